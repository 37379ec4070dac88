//! An in-memory engine that records what the pipeline asked for.

use super::{CreateContainerRequest, Engine, EngineError, ExecOutput, ExecRequest, Mount};
use crate::archive::regular_files;
use crate::credentials::RegistryCredential;
use crate::reference::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureImage(String),
    Create {
        name: String,
        image: String,
        env: Vec<(String, String)>,
        mounts: Vec<Mount>,
        labels: HashMap<String, String>,
        keep_alive: bool,
    },
    Exec {
        container_id: String,
        argv: Vec<String>,
        env: Vec<(String, String)>,
    },
    Upload {
        container_id: String,
        files: Vec<String>,
    },
    Download {
        container_id: String,
        path: String,
    },
    Commit {
        container_id: String,
        reference: String,
    },
    Push {
        reference: String,
        username: Option<String>,
    },
    Remove(String),
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<Call>>,
    /// Scripted exec results, matched by substring of the joined argv and consumed on use.
    exec_results: Mutex<Vec<(String, ExecOutput)>>,
    downloads: Mutex<HashMap<String, Bytes>>,
    push_error: Mutex<Option<EngineError>>,
    exec_delay: Option<Duration>,
    containers: AtomicUsize,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exec_result(self, argv_contains: &str, output: ExecOutput) -> Self {
        self.exec_results
            .lock()
            .unwrap()
            .push((argv_contains.to_string(), output));
        self
    }

    pub fn with_exec_failure(self, argv_contains: &str, stderr: &str) -> Self {
        self.with_exec_result(
            argv_contains,
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        )
    }

    pub fn with_download(self, path: &str, archive: Bytes) -> Self {
        self.downloads
            .lock()
            .unwrap()
            .insert(path.to_string(), archive);
        self
    }

    pub fn with_push_error(self, error: EngineError) -> Self {
        *self.push_error.lock().unwrap() = Some(error);
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Every executed argv, in order.
    pub fn execs(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec { argv, .. } => Some(argv),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn ensure_image(&self, image: &str, _always_pull: bool) -> Result<(), EngineError> {
        self.record(Call::EnsureImage(image.to_string()));
        Ok(())
    }

    async fn create_container(&self, req: CreateContainerRequest) -> Result<String, EngineError> {
        let id = format!("container-{}", self.containers.fetch_add(1, Ordering::SeqCst));
        self.record(Call::Create {
            name: req.name,
            image: req.image,
            env: req.env,
            mounts: req.mounts,
            labels: req.labels,
            keep_alive: req.keep_alive,
        });
        Ok(id)
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, EngineError> {
        let joined = req.argv.join(" ");
        self.record(Call::Exec {
            container_id: req.container_id,
            argv: req.argv,
            env: req.env,
        });

        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }

        let mut results = self.exec_results.lock().unwrap();
        if let Some(position) = results.iter().position(|(key, _)| joined.contains(key)) {
            return Ok(results.remove(position).1);
        }

        Ok(ExecOutput::default())
    }

    async fn upload(&self, container_id: &str, archive: Bytes) -> Result<(), EngineError> {
        let files = regular_files(&archive)
            .map_err(|e| EngineError::Unknown(e.to_string()))?
            .into_iter()
            .map(|file| file.path)
            .collect();
        self.record(Call::Upload {
            container_id: container_id.to_string(),
            files,
        });
        Ok(())
    }

    async fn download(&self, container_id: &str, path: &str) -> Result<Bytes, EngineError> {
        self.record(Call::Download {
            container_id: container_id.to_string(),
            path: path.to_string(),
        });
        self.downloads
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchContainer(format!("no such path {path}")))
    }

    async fn commit(
        &self,
        container_id: &str,
        reference: &ImageReference,
    ) -> Result<(), EngineError> {
        self.record(Call::Commit {
            container_id: container_id.to_string(),
            reference: reference.to_string(),
        });
        Ok(())
    }

    async fn push(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryCredential>,
    ) -> Result<(), EngineError> {
        self.record(Call::Push {
            reference: reference.to_string(),
            username: auth.map(|auth| auth.username.clone()),
        });

        match self.push_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.record(Call::Remove(container_id.to_string()));
        Ok(())
    }

    async fn list_created(
        &self,
        label: &str,
        name_prefix: &str,
    ) -> Result<Vec<String>, EngineError> {
        let removed = self.removed();
        let created = self
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create { name, labels, .. } => Some((name, labels)),
                _ => None,
            })
            .enumerate()
            .filter(|(_, (name, labels))| {
                labels.contains_key(label) && name.starts_with(name_prefix)
            })
            .map(|(n, _)| format!("container-{n}"))
            .filter(|id| !removed.contains(id))
            .collect();

        Ok(created)
    }
}
