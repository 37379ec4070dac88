mod docker;
#[cfg(test)]
pub mod testing;

pub use docker::Docker;

use crate::credentials::RegistryCredential;
use crate::reference::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;

/// Label carried by every command-running container this tool creates; the value is the run id.
/// Containers that get committed into images never carry it, since commit copies labels.
pub const RUN_LABEL: &str = "csi-pipeline.run";

/// Every container this tool creates is named with this prefix.
pub const CONTAINER_PREFIX: &str = "csi-pipeline-";

/// Represents different container engine failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Failed to communicate with the engine due to network error or other.
    #[error("could not connect to container engine; {0}")]
    Connection(String),

    /// Image requested by name could not be found or pulled.
    #[error("image not found; {0}")]
    NoSuchImage(String),

    /// Container requested by id could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// The registry turned down our credentials (or the lack of them).
    #[error("registry rejected authentication; {0}")]
    Unauthorized(String),

    /// An expected and unknown error has occurred.
    #[error("unexpected container engine error occurred; {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// A named volume that outlives the container; used for dependency caches.
    Cache { volume: String, target: String },
    /// A host path bound into the container; used for agent sockets.
    Bind { source: PathBuf, target: String },
}

#[derive(Debug, Clone, Default)]
pub struct CreateContainerRequest {
    /// A unique name to identify the container with.
    pub name: String,
    /// The image repository and name; tag or digest can be included.
    pub image: String,
    /// Environment baked into the container config. Secrets never go here.
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    /// Replace the image command with an idle loop and start the container, so that commands
    /// can be executed into it. Containers that only receive files and get committed stay stopped.
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container_id: String,
    pub argv: Vec<String>,
    /// Per command environment; this is where secrets are passed.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The engine trait defines what the interface between the pipeline and a container engine
/// should look like.
#[async_trait]
pub trait Engine: Debug + Send + Sync {
    /// Make sure an image is present locally, pulling it if missing or if `always_pull` is set.
    async fn ensure_image(&self, image: &str, always_pull: bool) -> Result<(), EngineError>;

    /// Create a container and, if requested, start it. Returns the engine's container id.
    async fn create_container(&self, req: CreateContainerRequest) -> Result<String, EngineError>;

    /// Run a command inside a running container and wait for it to finish.
    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, EngineError>;

    /// Extract a tar archive at the root of the container's filesystem.
    async fn upload(&self, container_id: &str, archive: Bytes) -> Result<(), EngineError>;

    /// Returns a path from the container's filesystem as a tar archive.
    async fn download(&self, container_id: &str, path: &str) -> Result<Bytes, EngineError>;

    /// Snapshot the container's filesystem into an image under the given reference.
    async fn commit(&self, container_id: &str, reference: &ImageReference)
        -> Result<(), EngineError>;

    /// Push a local image to its registry.
    async fn push(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryCredential>,
    ) -> Result<(), EngineError>;

    /// Force remove a container, running or not.
    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Ids of all containers carrying the given label key whose name starts with `name_prefix`,
    /// stopped ones included.
    async fn list_created(&self, label: &str, name_prefix: &str)
        -> Result<Vec<String>, EngineError>;
}
