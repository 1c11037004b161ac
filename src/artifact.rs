//! Audit sink for executed code and its output.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::sandbox::ExecutionResult;

/// Versioned blob storage for audit artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Stores `content` under `name` and returns the new version number,
    /// starting at 0.
    async fn save_artifact(&self, session_id: &str, name: &str, content: Vec<u8>) -> Result<u64>;
}

/// In-process sink keeping every version.
#[derive(Debug, Default)]
pub struct MemoryArtifactSink {
    artifacts: Mutex<HashMap<(String, String), Vec<Vec<u8>>>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest version of an artifact.
    pub async fn latest(&self, session_id: &str, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .await
            .get(&(session_id.to_string(), name.to_string()))
            .and_then(|versions| versions.last().cloned())
    }

    /// Returns the artifact names stored for a session, sorted.
    pub async fn names(&self, session_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .artifacts
            .lock()
            .await
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactSink {
    async fn save_artifact(&self, session_id: &str, name: &str, content: Vec<u8>) -> Result<u64> {
        let mut artifacts = self.artifacts.lock().await;
        let versions = artifacts
            .entry((session_id.to_string(), name.to_string()))
            .or_default();
        versions.push(content);
        Ok(versions.len() as u64 - 1)
    }
}

/// Artifact file name for a submission.
pub fn artifact_name(submission: u64) -> String {
    format!("repl_code_{:04}.txt", submission)
}

/// Renders the audit record for one execution.
pub fn render_artifact(iteration: u32, code: &str, result: &ExecutionResult) -> String {
    let comment = |text: &str| -> String {
        text.split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| format!("# {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let stderr = if result.stderr.is_empty() {
        "# (none)".to_string()
    } else {
        comment(&result.stderr)
    };

    format!(
        "# REPL Execution - Iteration {}\n\
         # Execution time: {:.3}s\n\
         # Success: {}\n\
         \n\
         {}\n\
         \n\
         # --- Output ---\n\
         # stdout:\n\
         {}\n\
         \n\
         # stderr:\n\
         {}\n",
        iteration,
        result.elapsed.as_secs_f64(),
        result.success,
        code,
        comment(&result.stdout),
        stderr
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            success: stderr.is_empty(),
            elapsed: Duration::from_millis(1500),
            steps: 10,
            namespace: serde_json::Map::new(),
            fault: None,
        }
    }

    #[test]
    fn artifact_names_are_zero_padded() {
        assert_eq!(artifact_name(1), "repl_code_0001.txt");
        assert_eq!(artifact_name(12345), "repl_code_12345.txt");
    }

    #[test]
    fn rendered_artifact_comments_out_output() {
        let text = render_artifact(2, "print('a')\nprint('b')", &result("a\nb\n", ""));
        assert!(text.starts_with("# REPL Execution - Iteration 2\n# Execution time: 1.500s\n"));
        assert!(text.contains("# Success: true"));
        assert!(text.contains("\nprint('a')\nprint('b')\n"));
        assert!(text.contains("# stdout:\n# a\n# b\n"));
        assert!(text.ends_with("# stderr:\n# (none)\n"));

        let failed = render_artifact(0, "1/0", &result("", "ZeroDivisionError: division by zero"));
        assert!(failed.contains("# Success: false"));
        assert!(failed.ends_with("# stderr:\n# ZeroDivisionError: division by zero\n"));
    }

    #[tokio::test]
    async fn memory_sink_versions_artifacts() {
        let sink = MemoryArtifactSink::new();
        assert_eq!(sink.save_artifact("s", "a.txt", b"one".to_vec()).await.unwrap(), 0);
        assert_eq!(sink.save_artifact("s", "a.txt", b"two".to_vec()).await.unwrap(), 1);
        sink.save_artifact("other", "b.txt", b"x".to_vec()).await.unwrap();

        assert_eq!(sink.latest("s", "a.txt").await, Some(b"two".to_vec()));
        assert_eq!(sink.names("s").await, vec!["a.txt".to_string()]);
    }
}
