//! Per-attempt trace artifacts.
//!
//! Raw handler request and response documents are kept under
//! `<root>/<job_type>/<job_id>/attempt-<n>/<name>.json` for debugging.
//! They are never read back by the engine.

use std::path::{Path, PathBuf};

use medialib_core::types::DbId;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct TraceWriter {
    root: PathBuf,
}

impl TraceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attempt_dir(&self, job_type: &str, job_id: DbId, attempt: i32) -> PathBuf {
        self.root
            .join(sanitize(job_type))
            .join(job_id.to_string())
            .join(format!("attempt-{attempt}"))
    }

    /// Write `doc` as pretty JSON and return the file path.
    pub async fn write(
        &self,
        job_type: &str,
        job_id: DbId,
        attempt: i32,
        name: &str,
        doc: &Value,
    ) -> std::io::Result<PathBuf> {
        let dir = self.attempt_dir(job_type, job_id, attempt);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", sanitize(name)));
        let bytes = serde_json::to_vec_pretty(doc).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Bind the writer to one attempt of one job.
    pub fn scope(&self, job_type: &str, job_id: DbId, attempt: i32) -> TraceScope {
        TraceScope {
            writer: self.clone(),
            job_type: job_type.to_string(),
            job_id,
            attempt,
        }
    }
}

/// A [`TraceWriter`] fixed to one job attempt.
#[derive(Debug, Clone)]
pub struct TraceScope {
    writer: TraceWriter,
    job_type: String,
    job_id: DbId,
    attempt: i32,
}

impl TraceScope {
    pub async fn write(&self, name: &str, doc: &Value) -> std::io::Result<PathBuf> {
        self.writer
            .write(&self.job_type, self.job_id, self.attempt, name, doc)
            .await
    }
}

/// Keep path components to a safe character set.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_layout_follows_type_id_attempt() {
        let writer = TraceWriter::new("/var/trace");
        assert_eq!(
            writer.attempt_dir("caption", 42, 2),
            PathBuf::from("/var/trace/caption/42/attempt-2")
        );
    }

    #[test]
    fn names_cannot_escape_the_attempt_dir() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("response"), "response");
    }

    #[tokio::test]
    async fn scope_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(dir.path());
        let path = writer
            .scope("caption", 7, 1)
            .write("request", &json!({"media_id": 7}))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("caption/7/attempt-1/request.json"));
        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored, json!({"media_id": 7}));
    }
}
