//! The `execute_code` bridge. Sandboxes (Docker, WASM, V8) live outside this
//! process; the bridge owns the executor seam, limit clamping and deadline
//! enforcement around whichever executors the deployment wires in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, ErrorObject};

#[derive(Debug, Clone)]
pub struct ExecuteCodeRequest {
    pub language: String,
    pub code: String,
    pub timeout: Duration,
    pub max_tool_calls: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteCodeOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// An external code sandbox adapter.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn name(&self) -> &str;
    fn supports(&self, language: &str) -> bool;
    async fn execute(&self, request: ExecuteCodeRequest) -> Result<ExecuteCodeOutput, ErrorObject>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorLimits {
    #[serde(default = "default_timeout", with = "crate::config::humantime_duration")]
    pub default_timeout: Duration,
    #[serde(default = "default_max_timeout", with = "crate::config::humantime_duration")]
    pub max_timeout: Duration,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_max_tool_calls() -> u32 {
    25
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            max_timeout: default_max_timeout(),
            max_tool_calls: default_max_tool_calls(),
        }
    }
}

pub struct ExecutorBridge {
    executors: Vec<Arc<dyn CodeExecutor>>,
    limits: ExecutorLimits,
}

impl ExecutorBridge {
    pub fn new(executors: Vec<Arc<dyn CodeExecutor>>, limits: ExecutorLimits) -> Arc<Self> {
        Arc::new(Self { executors, limits })
    }

    /// Execute code through the first executor claiming the language.
    /// Caller limits clamp against the configured ceilings.
    pub async fn execute(
        &self,
        language: &str,
        code: &str,
        timeout_ms: Option<u64>,
        max_tool_calls: Option<u32>,
    ) -> Result<ExecuteCodeOutput, ErrorObject> {
        let executor = self
            .executors
            .iter()
            .find(|e| e.supports(language))
            .ok_or_else(|| {
                ErrorObject::new(
                    ErrorKind::ExecutionFailed,
                    format!("no code executor configured for language '{language}'"),
                )
                .with_op("execute_code")
            })?;

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .map(|t| t.min(self.limits.max_timeout))
            .unwrap_or(self.limits.default_timeout);
        let max_tool_calls = max_tool_calls
            .map(|m| m.min(self.limits.max_tool_calls))
            .unwrap_or(self.limits.max_tool_calls);

        let request = ExecuteCodeRequest {
            language: language.to_string(),
            code: code.to_string(),
            timeout,
            max_tool_calls,
        };

        match tokio::time::timeout(timeout, executor.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(ErrorObject::new(
                ErrorKind::Timeout,
                format!("code execution exceeded its {timeout:?} deadline"),
            )
            .with_op("execute_code")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubExecutor {
        language: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl CodeExecutor for StubExecutor {
        fn name(&self) -> &str {
            "stub"
        }

        fn supports(&self, language: &str) -> bool {
            language == self.language
        }

        async fn execute(
            &self,
            request: ExecuteCodeRequest,
        ) -> Result<ExecuteCodeOutput, ErrorObject> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(ExecuteCodeOutput {
                value: Some(serde_json::json!({
                    "echo": request.code,
                    "max_tool_calls": request.max_tool_calls,
                })),
                stdout: "ran".to_string(),
                stderr: String::new(),
                duration_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_executes_through_matching_executor() {
        let bridge = ExecutorBridge::new(
            vec![Arc::new(StubExecutor {
                language: "python",
                delay: Duration::ZERO,
            })],
            ExecutorLimits::default(),
        );

        let out = bridge
            .execute("python", "print(1)", None, None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "ran");
        assert_eq!(out.value.unwrap()["echo"], "print(1)");
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let bridge = ExecutorBridge::new(Vec::new(), ExecutorLimits::default());
        let err = bridge.execute("cobol", "", None, None).await.unwrap_err();
        assert_eq!(err.code, ErrorKind::ExecutionFailed);
        assert!(err.message.contains("no code executor"));
    }

    #[tokio::test]
    async fn test_caller_limits_clamp_against_ceiling() {
        let limits = ExecutorLimits {
            max_tool_calls: 10,
            ..ExecutorLimits::default()
        };
        let bridge = ExecutorBridge::new(
            vec![Arc::new(StubExecutor {
                language: "python",
                delay: Duration::ZERO,
            })],
            limits,
        );

        let out = bridge
            .execute("python", "x", None, Some(100))
            .await
            .unwrap();
        assert_eq!(out.value.unwrap()["max_tool_calls"], 10);
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let limits = ExecutorLimits {
            max_timeout: Duration::from_millis(20),
            ..ExecutorLimits::default()
        };
        let bridge = ExecutorBridge::new(
            vec![Arc::new(StubExecutor {
                language: "python",
                delay: Duration::from_secs(5),
            })],
            limits,
        );

        let err = bridge
            .execute("python", "sleep", Some(10_000), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorKind::Timeout);
    }
}
