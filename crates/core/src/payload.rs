//! Typed job payloads.
//!
//! Payloads are stored as opaque JSON. At the handler boundary they are
//! decoded through a per-job-type schema into [`JobPayload`]. Fields a
//! schema does not know about are preserved in `extra` so a newer producer
//! can talk to an older worker without losing data, but nothing in the
//! engine reads them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::DbId;

/// Known job type tags.
pub mod job_types {
    pub const CAPTION: &str = "caption";
    pub const NSFW_SCORE: &str = "nsfw_score";
    pub const DUPLICATE_HINT: &str = "duplicate_hint";
    pub const METADATA_EXTRACT: &str = "metadata_extract";
    pub const RECIPE: &str = "recipe";
    pub const SCAN: &str = "scan";
    pub const REORGANIZE: &str = "reorganize";

    pub const ALL: [&str; 7] = [
        CAPTION,
        NSFW_SCORE,
        DUPLICATE_HINT,
        METADATA_EXTRACT,
        RECIPE,
        SCAN,
        REORGANIZE,
    ];
}

/// Maximum length of a job type tag.
const MAX_JOB_TYPE_LEN: usize = 64;

/// A job that targets a single media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTarget {
    pub media_id: DbId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionPayload {
    pub media_id: DbId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPayload {
    /// Library root to walk.
    pub root: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorganizePayload {
    pub media_ids: Vec<DbId>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Payload decoded according to its job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Caption(CaptionPayload),
    NsfwScore(MediaTarget),
    DuplicateHint(MediaTarget),
    MetadataExtract(MediaTarget),
    Recipe(MediaTarget),
    Scan(ScanPayload),
    Reorganize(ReorganizePayload),
    /// A job type this build has no schema for; passed through untouched.
    Other { job_type: String, body: Value },
}

impl JobPayload {
    /// Decode `body` using the schema registered for `job_type`.
    pub fn decode(job_type: &str, body: &Value) -> Result<Self, CoreError> {
        Ok(match job_type {
            job_types::CAPTION => JobPayload::Caption(decode_as(job_type, body)?),
            job_types::NSFW_SCORE => JobPayload::NsfwScore(decode_as(job_type, body)?),
            job_types::DUPLICATE_HINT => JobPayload::DuplicateHint(decode_as(job_type, body)?),
            job_types::METADATA_EXTRACT => {
                JobPayload::MetadataExtract(decode_as(job_type, body)?)
            }
            job_types::RECIPE => JobPayload::Recipe(decode_as(job_type, body)?),
            job_types::SCAN => {
                let scan: ScanPayload = decode_as(job_type, body)?;
                if scan.root.trim().is_empty() {
                    return Err(CoreError::Validation(
                        "scan payload: root must not be empty".to_string(),
                    ));
                }
                JobPayload::Scan(scan)
            }
            job_types::REORGANIZE => JobPayload::Reorganize(decode_as(job_type, body)?),
            other => JobPayload::Other {
                job_type: other.to_string(),
                body: body.clone(),
            },
        })
    }

    pub fn job_type(&self) -> &str {
        match self {
            JobPayload::Caption(_) => job_types::CAPTION,
            JobPayload::NsfwScore(_) => job_types::NSFW_SCORE,
            JobPayload::DuplicateHint(_) => job_types::DUPLICATE_HINT,
            JobPayload::MetadataExtract(_) => job_types::METADATA_EXTRACT,
            JobPayload::Recipe(_) => job_types::RECIPE,
            JobPayload::Scan(_) => job_types::SCAN,
            JobPayload::Reorganize(_) => job_types::REORGANIZE,
            JobPayload::Other { job_type, .. } => job_type,
        }
    }

    /// The domain entity this job is about, e.g. `media:7` or `path:/library`.
    ///
    /// Used to correlate audit records with library items.
    pub fn entity_ref(&self) -> Option<String> {
        match self {
            JobPayload::Caption(p) => Some(media_ref(p.media_id)),
            JobPayload::NsfwScore(t)
            | JobPayload::DuplicateHint(t)
            | JobPayload::MetadataExtract(t)
            | JobPayload::Recipe(t) => Some(media_ref(t.media_id)),
            JobPayload::Scan(p) => Some(format!("path:{}", p.root)),
            JobPayload::Reorganize(p) => match p.media_ids.as_slice() {
                [single] => Some(media_ref(*single)),
                _ => None,
            },
            JobPayload::Other { body, .. } => body
                .get("media_id")
                .and_then(Value::as_i64)
                .map(media_ref),
        }
    }
}

fn media_ref(id: DbId) -> String {
    format!("media:{id}")
}

fn decode_as<T: DeserializeOwned>(job_type: &str, body: &Value) -> Result<T, CoreError> {
    serde_json::from_value(body.clone())
        .map_err(|e| CoreError::Validation(format!("{job_type} payload: {e}")))
}

/// Validate a job type tag.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_JOB_TYPE_LEN` characters.
/// - Lowercase alphanumeric, underscore, hyphen or dot only.
pub fn validate_job_type(job_type: &str) -> Result<(), CoreError> {
    if job_type.is_empty() {
        return Err(CoreError::Validation(
            "Job type must not be empty".to_string(),
        ));
    }
    if job_type.len() > MAX_JOB_TYPE_LEN {
        return Err(CoreError::Validation(format!(
            "Job type must not exceed {MAX_JOB_TYPE_LEN} characters"
        )));
    }
    if !job_type
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
    {
        return Err(CoreError::Validation(format!(
            "Job type \"{job_type}\" may only contain lowercase alphanumeric, underscore, hyphen, or dot characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn caption_payload_keeps_unknown_fields() {
        let body = json!({"media_id": 7, "prompt": "describe", "tone": "dry"});
        let decoded = JobPayload::decode(job_types::CAPTION, &body).unwrap();
        let JobPayload::Caption(caption) = decoded else {
            panic!("expected caption payload");
        };
        assert_eq!(caption.media_id, 7);
        assert_eq!(caption.prompt.as_deref(), Some("describe"));
        assert_eq!(caption.extra.get("tone"), Some(&json!("dry")));
    }

    #[test]
    fn missing_media_id_is_validation_error() {
        let err = JobPayload::decode(job_types::NSFW_SCORE, &json!({"path": "a.png"}));
        assert_matches!(err, Err(CoreError::Validation(msg)) if msg.starts_with("nsfw_score payload"));
    }

    #[test]
    fn scan_requires_non_empty_root() {
        assert_matches!(
            JobPayload::decode(job_types::SCAN, &json!({"root": "  "})),
            Err(CoreError::Validation(_))
        );
        let scan = JobPayload::decode(job_types::SCAN, &json!({"root": "/library"})).unwrap();
        assert_matches!(scan, JobPayload::Scan(ScanPayload { recursive: true, .. }));
    }

    #[test]
    fn unknown_type_passes_through() {
        let body = json!({"anything": [1, 2, 3]});
        let decoded = JobPayload::decode("log_incident", &body).unwrap();
        assert_eq!(decoded.job_type(), "log_incident");
        assert_matches!(decoded, JobPayload::Other { body: b, .. } if b == body);
    }

    #[test]
    fn entity_ref_correlates_media_jobs() {
        let decoded = JobPayload::decode(job_types::DUPLICATE_HINT, &json!({"media_id": 42})).unwrap();
        assert_eq!(decoded.entity_ref().as_deref(), Some("media:42"));

        let scan = JobPayload::decode(job_types::SCAN, &json!({"root": "/lib"})).unwrap();
        assert_eq!(scan.entity_ref().as_deref(), Some("path:/lib"));

        let batch = JobPayload::decode(job_types::REORGANIZE, &json!({"media_ids": [1, 2]})).unwrap();
        assert_eq!(batch.entity_ref(), None);
    }

    #[test]
    fn job_type_validation() {
        assert!(validate_job_type("caption").is_ok());
        assert!(validate_job_type("log.incident-v2").is_ok());
        assert!(validate_job_type("").is_err());
        assert!(validate_job_type("Caption").is_err());
        assert!(validate_job_type(&"a".repeat(65)).is_err());
    }
}
