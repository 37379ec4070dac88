use super::PipelineError;
use crate::conf::Config;
use crate::engine::{Engine, CONTAINER_PREFIX, RUN_LABEL};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything a pipeline invocation needs that outlives a single step. Built once per
/// invocation and handed to every component; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub engine: Arc<dyn Engine>,

    /// Identifies this invocation in container names and labels.
    pub run_id: String,

    containers: Arc<AtomicUsize>,

    /// Container removals spawned by sessions that were dropped without being destroyed.
    cleanup: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Context {
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Self {
        let run_id = uuid::Uuid::now_v7().simple().to_string();

        Self {
            config: Arc::new(config),
            engine,
            run_id,
            containers: Arc::new(AtomicUsize::new(0)),
            cleanup: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Unique per invocation so concurrent runs on one engine never collide.
    pub fn container_name(&self, purpose: &str) -> String {
        let sequence = self.containers.fetch_add(1, Ordering::SeqCst);
        format!("{CONTAINER_PREFIX}{}-{}-{}", self.run_id, sequence, purpose)
    }

    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([(RUN_LABEL.to_string(), self.run_id.clone())])
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        match self.config.engine.exec_timeout {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    /// Runs `cleanup` on the current runtime and remembers it so [`Context::finish_cleanup`] can
    /// wait for it. Used from `Drop`, where nothing can be awaited.
    pub fn spawn_cleanup<F>(&self, cleanup: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime left to run container cleanup on");
            return;
        };

        let task = runtime.spawn(cleanup);
        self.cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Waits for every cleanup started by [`Context::spawn_cleanup`] so far.
    pub async fn finish_cleanup(&self) {
        let tasks = std::mem::take(
            &mut *self
                .cleanup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        if tasks.is_empty() {
            return;
        }

        debug!(tasks = tasks.len(), "Waiting for container cleanup");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(err = %e, "Container cleanup task did not finish");
            }
        }
    }

    /// Runs an engine or tool call under the invocation's exec deadline.
    pub async fn with_deadline<T, Fut>(&self, operation: &str, f: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let Some(timeout) = self.exec_timeout() else {
            return f.await;
        };

        match tokio::time::timeout(timeout, f).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            }),
        }
    }
}
