/// Job ids are SQLite `INTEGER PRIMARY KEY` rowids.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Convert a timestamp to the Unix-millisecond integer stored in the database.
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored Unix-millisecond integer back into a timestamp.
///
/// Out-of-range values clamp to the Unix epoch rather than failing; the
/// store never writes such values itself.
pub fn from_millis(ms: i64) -> Timestamp {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::UNIX_EPOCH)
}
