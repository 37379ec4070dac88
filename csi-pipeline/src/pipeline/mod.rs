mod context;
pub mod operations;

pub use context::Context;
#[cfg(test)]
pub use context::tests::context as test_context;

use crate::credentials::CredentialError;
use crate::engine::EngineError;
use crate::reference::ReferenceError;
use crate::source::SourceError;
use crate::version::VersionError;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use strum::Display;
use tracing::{info, warn};

/// How many trailing lines of tool output are kept in a failure.
const OUTPUT_TAIL_LINES: usize = 15;

/// Represents the ways a pipeline invocation can fail. None of them are recovered from; the
/// first failure ends the invocation.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// An external tool exited non-zero.
    #[error("'{command}' exited with code {exit_code} in {environment}; examine partial output below:\n{output}")]
    ToolInvocation {
        environment: String,
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("malformed input; {0}")]
    MalformedInput(String),

    /// A registry or cluster rejected our credentials, or none were available.
    #[error("credential failure; {0}")]
    Credential(String),

    #[error("'{operation}' did not finish within {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("container engine failure; {0}")]
    Engine(EngineError),

    #[error("i/o failure; {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Input and credential problems will fail the same way again; tool and engine failures might not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ToolInvocation { .. } | Self::Timeout { .. } => true,
            Self::Engine(e) => !matches!(e, EngineError::Unauthorized(_)),
            Self::MalformedInput(_) | Self::Credential(_) | Self::Io(_) => false,
        }
    }
}

impl From<EngineError> for PipelineError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unauthorized(message) => Self::Credential(message),
            e => Self::Engine(e),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::MissingFile(file) => {
                Self::MalformedInput(format!("required file '{file}' missing from source tree"))
            }
            SourceError::NotADirectory(_) | SourceError::Pattern(_) => {
                Self::MalformedInput(e.to_string())
            }
            SourceError::Walk(e) => Self::Io(e.into()),
            SourceError::Io(e) => Self::Io(e),
        }
    }
}

impl From<CredentialError> for PipelineError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidSource(_) | CredentialError::MalformedRegistrySecret => {
                Self::MalformedInput(e.to_string())
            }
            CredentialError::MissingEnv(_)
            | CredentialError::UnreadableFile { .. }
            | CredentialError::NoCredentialMode => Self::Credential(e.to_string()),
        }
    }
}

impl From<ReferenceError> for PipelineError {
    fn from(e: ReferenceError) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

impl From<VersionError> for PipelineError {
    fn from(e: VersionError) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

/// Returns the last few lines of a tool's combined output.
pub fn output_tail(stdout: &str, stderr: &str) -> String {
    let combined: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = combined.len().saturating_sub(OUTPUT_TAIL_LINES);
    combined[start..]
        .iter()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum StepState {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Applied uniformly to every step unless a step asks for something else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepPolicy {
    /// Per attempt.
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    pub retries: u32,
}

/// An ordered list of named steps for one invocation. Steps run strictly one after another;
/// the first failing step ends the pipeline.
#[derive(Debug)]
pub struct Pipeline {
    pub id: String,
    policy: StepPolicy,
    steps: Vec<StepReport>,
}

impl Pipeline {
    pub fn new(id: &str, policy: StepPolicy) -> Self {
        Self {
            id: id.to_string(),
            policy,
            steps: vec![],
        }
    }

    pub fn policy(&self) -> StepPolicy {
        self.policy
    }

    pub fn report(&self) -> &[StepReport] {
        &self.steps
    }

    pub async fn step<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let policy = self.policy;
        self.step_with_policy(name, policy, f).await
    }

    pub async fn step_with_policy<T, F, Fut>(
        &mut self,
        name: &str,
        policy: StepPolicy,
        mut f: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let mut attempts = 0;

        let result = loop {
            attempts += 1;
            info!(pipeline = %self.id, step = name, attempt = attempts, "Starting step");

            let outcome = match policy.timeout {
                Some(timeout) => tokio::time::timeout(timeout, f())
                    .await
                    .unwrap_or_else(|_| {
                        Err(PipelineError::Timeout {
                            operation: name.to_string(),
                            seconds: timeout.as_secs(),
                        })
                    }),
                None => f().await,
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(e) if attempts <= policy.retries && e.is_retryable() => {
                    warn!(pipeline = %self.id, step = name, attempt = attempts, err = %e, "Step failed; retrying");
                }
                Err(e) => break Err(e),
            }
        };

        let state = if result.is_ok() {
            StepState::Complete
        } else {
            StepState::Failed
        };

        info!(pipeline = %self.id, step = name, %state, elapsed = ?started.elapsed(), "Finished step");

        self.steps.push(StepReport {
            name: name.to_string(),
            state,
            attempts,
            elapsed: started.elapsed(),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    fn tool_failure() -> PipelineError {
        PipelineError::ToolInvocation {
            environment: "cluster-client".into(),
            command: "helm upgrade".into(),
            exit_code: 1,
            output: "  Error: connection refused".into(),
        }
    }

    #[tokio::test]
    async fn steps_are_recorded_in_order() {
        let mut pipeline = Pipeline::new("test", StepPolicy::default());

        let version = pipeline
            .step("resolve-version", || async { Ok("v1.0.0".to_string()) })
            .await
            .unwrap();
        let result: Result<(), _> = pipeline
            .step("push-image", || async { Err(tool_failure()) })
            .await;

        assert_eq!(version, "v1.0.0");
        assert!(result.is_err());

        let names: Vec<(&str, StepState)> = pipeline
            .report()
            .iter()
            .map(|step| (step.name.as_str(), step.state))
            .collect();
        assert_eq!(
            names,
            vec![
                ("resolve-version", StepState::Complete),
                ("push-image", StepState::Failed)
            ]
        );
    }

    #[tokio::test]
    async fn tool_failures_are_not_retried_by_default() {
        let mut pipeline = Pipeline::new("test", StepPolicy::default());
        let calls = Cell::new(0);

        let result: Result<(), _> = pipeline
            .step("install-chart", || {
                calls.set(calls.get() + 1);
                async { Err(tool_failure()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
        assert_eq!(pipeline.report()[0].attempts, 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut pipeline = Pipeline::new("test", StepPolicy::default());
        let calls = Cell::new(0);
        let policy = StepPolicy {
            timeout: None,
            retries: 2,
        };

        let result = pipeline
            .step_with_policy("install-chart", policy, || {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move {
                    if attempt < 2 {
                        Err(tool_failure())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(pipeline.report()[0].attempts, 2);
        assert_eq!(pipeline.report()[0].state, StepState::Complete);
    }

    #[tokio::test]
    async fn malformed_input_is_never_retried() {
        let mut pipeline = Pipeline::new("test", StepPolicy::default());
        let calls = Cell::new(0);
        let policy = StepPolicy {
            timeout: None,
            retries: 3,
        };

        let result: Result<(), _> = pipeline
            .step_with_policy("install-chart", policy, || {
                calls.set(calls.get() + 1);
                async { Err(PipelineError::MalformedInput("no tag".into())) }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::MalformedInput(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_fails_the_step() {
        let mut pipeline = Pipeline::new("test", StepPolicy::default());
        let policy = StepPolicy {
            timeout: Some(Duration::from_secs(5)),
            retries: 0,
        };

        let result: Result<(), _> = pipeline
            .step_with_policy("compile", policy, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Timeout { ref operation, seconds: 5 }) if operation == "compile"
        ));
    }

    #[test]
    fn unauthorized_engine_errors_become_credential_failures() {
        let e: PipelineError = EngineError::Unauthorized("denied".into()).into();
        assert!(matches!(e, PipelineError::Credential(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn output_tail_keeps_last_lines() {
        let stdout: String = (0..20).map(|n| format!("line {n}\n")).collect();
        let tail = output_tail(&stdout, "error: build failed\n");

        assert_eq!(tail.lines().count(), OUTPUT_TAIL_LINES);
        assert!(tail.ends_with("  error: build failed"));
        assert!(!tail.contains("line 5\n"));
    }
}
