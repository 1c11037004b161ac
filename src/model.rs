//! Secondary-model interface reachable from sandboxed code as `llm_query`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;

/// Failure reported by a model client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// No model is configured or reachable.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// The model was reached but the query failed.
    #[error("model query failed: {0}")]
    Failed(String),
}

/// Synchronous model client called from the sandbox worker thread.
///
/// Text written to `output` is captured in the secondary buffer of the
/// session's output router and never reaches the primary caller.
pub trait ModelClient: Send + Sync {
    fn query(&self, prompt: &str, output: &mut dyn fmt::Write) -> Result<String, ModelError>;
}

/// Adapts a closure into a [`ModelClient`].
pub struct FnModelClient<F>(pub F);

impl<F> ModelClient for FnModelClient<F>
where
    F: Fn(&str, &mut dyn fmt::Write) -> Result<String, ModelError> + Send + Sync,
{
    fn query(&self, prompt: &str, output: &mut dyn fmt::Write) -> Result<String, ModelError> {
        (self.0)(prompt, output)
    }
}

/// Asynchronous model backend, e.g. an HTTP client.
#[async_trait]
pub trait AsyncModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Bridges an [`AsyncModelClient`] into the blocking sandbox worker.
///
/// Must only be queried from a thread where blocking is allowed, which is
/// the case for sandbox executions running under `spawn_blocking`.
pub struct BlockingModelClient {
    inner: Arc<dyn AsyncModelClient>,
    handle: Handle,
}

impl BlockingModelClient {
    /// Captures the current runtime handle.
    pub fn new(inner: Arc<dyn AsyncModelClient>) -> Result<Self, ModelError> {
        let handle = Handle::try_current()
            .map_err(|e| ModelError::Unavailable(format!("no tokio runtime: {}", e)))?;
        Ok(Self { inner, handle })
    }
}

impl ModelClient for BlockingModelClient {
    fn query(&self, prompt: &str, output: &mut dyn fmt::Write) -> Result<String, ModelError> {
        tracing::debug!(prompt_len = prompt.len(), "Forwarding prompt to async model");
        let answer = self.handle.block_on(self.inner.complete(prompt))?;
        let _ = writeln!(output, "[model] {} chars", answer.len());
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    struct Echo;

    #[async_trait]
    impl AsyncModelClient for Echo {
        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            Ok(format!("echo: {}", prompt))
        }
    }

    #[test]
    fn closure_client_writes_to_given_output() {
        let client = FnModelClient(|prompt: &str, out: &mut dyn fmt::Write| {
            let _ = write!(out, "thinking about {}", prompt);
            Ok(prompt.to_uppercase())
        });
        let mut side = String::new();
        assert_eq!(client.query("hi", &mut side).unwrap(), "HI");
        assert_eq!(side, "thinking about hi");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_bridge_runs_async_backend() {
        let client = BlockingModelClient::new(Arc::new(Echo)).unwrap();
        let answer = tokio::task::spawn_blocking(move || {
            let mut side = String::new();
            client.query("ping", &mut side)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(answer, "echo: ping");
    }

    #[test]
    fn bridge_requires_a_runtime() {
        assert!(BlockingModelClient::new(Arc::new(Echo)).is_err());
    }
}
