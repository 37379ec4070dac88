use super::EnvironmentSpec;
use crate::archive::{regular_files, ArchivedFile};
use crate::credentials::Secret;
use crate::engine::{CreateContainerRequest, ExecOutput, ExecRequest};
use crate::pipeline::{output_tail, Context, PipelineError};
use crate::reference::ImageReference;
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// A live container created from an [`EnvironmentSpec`].
///
/// Callers must call [`Session::destroy`] once they are done, whether the work succeeded or not.
/// A session dropped without it, for example when a step deadline cancels the step, removes its
/// container in the background instead.
#[derive(Debug)]
pub struct Session {
    ctx: Context,
    purpose: String,
    container_id: String,
    secret_env: Vec<(String, Secret)>,
    working_dir: Option<String>,
    destroyed: bool,
}

impl Session {
    /// Creates the container, then runs the spec's setup commands. A failed setup removes the
    /// container before returning.
    #[instrument(skip(ctx, spec), fields(purpose = %spec.purpose, image = %spec.image))]
    pub async fn start(ctx: &Context, spec: &EnvironmentSpec) -> Result<Self, PipelineError> {
        // A retried step must not overlap with the container of the attempt it replaces.
        ctx.finish_cleanup().await;

        let always_pull = ctx.config.engine.always_pull;
        ctx.with_deadline("pull image", async {
            ctx.engine
                .ensure_image(&spec.image, always_pull)
                .await
                .map_err(PipelineError::from)
        })
        .await?;

        // Commit copies labels into the image; filesystem-only containers stay unlabeled.
        let mut labels = if spec.runs_commands {
            ctx.labels()
        } else {
            HashMap::new()
        };
        labels.extend(spec.labels.iter().cloned());

        let container_id = ctx
            .engine
            .create_container(CreateContainerRequest {
                name: ctx.container_name(&spec.purpose),
                image: spec.image.clone(),
                env: spec.env.clone(),
                mounts: spec.mounts.clone(),
                working_dir: spec.working_dir.clone(),
                labels,
                keep_alive: spec.runs_commands,
            })
            .await?;

        debug!(%container_id, "Started {}", spec.purpose);

        let session = Self {
            ctx: ctx.clone(),
            purpose: spec.purpose.clone(),
            container_id,
            secret_env: spec.secret_env.clone(),
            working_dir: spec.working_dir.clone(),
            destroyed: false,
        };

        for argv in &spec.setup {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            if let Err(e) = session.exec(&argv).await {
                session.destroy().await;
                return Err(e);
            }
        }

        Ok(session)
    }

    /// Runs a command to completion. A non-zero exit becomes [`PipelineError::ToolInvocation`].
    pub async fn exec(&self, argv: &[&str]) -> Result<ExecOutput, PipelineError> {
        self.exec_with_secrets(argv, &[]).await
    }

    /// Like [`Session::exec`], with extra secret environment for this command only.
    pub async fn exec_with_secrets(
        &self,
        argv: &[&str],
        secrets: &[(&str, &Secret)],
    ) -> Result<ExecOutput, PipelineError> {
        let command = argv.join(" ");
        debug!(purpose = %self.purpose, command, "Running command");

        let env = self
            .secret_env
            .iter()
            .map(|(key, value)| (key.clone(), value.expose().to_string()))
            .chain(
                secrets
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.expose().to_string())),
            )
            .collect();

        let request = ExecRequest {
            container_id: self.container_id.clone(),
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            env,
            working_dir: self.working_dir.clone(),
        };

        let output = self
            .ctx
            .with_deadline(&command, async {
                self.ctx.engine.exec(request).await.map_err(PipelineError::from)
            })
            .await?;

        if !output.success() {
            return Err(PipelineError::ToolInvocation {
                environment: self.purpose.clone(),
                command,
                exit_code: output.exit_code,
                output: output_tail(&output.stdout, &output.stderr),
            });
        }

        Ok(output)
    }

    /// Extracts a tar archive at the container's filesystem root.
    pub async fn upload(&self, archive: Bytes) -> Result<(), PipelineError> {
        self.ctx
            .with_deadline("upload files", async {
                self.ctx
                    .engine
                    .upload(&self.container_id, archive)
                    .await
                    .map_err(PipelineError::from)
            })
            .await
    }

    /// All regular files at or below `path`.
    pub async fn read_files(&self, path: &str) -> Result<Vec<ArchivedFile>, PipelineError> {
        let archive = self
            .ctx
            .with_deadline("download files", async {
                self.ctx
                    .engine
                    .download(&self.container_id, path)
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;

        Ok(regular_files(&archive)?)
    }

    /// Contents of a single file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        let mut files = self.read_files(path).await?;

        match files.len() {
            1 => Ok(files.remove(0).data),
            count => Err(PipelineError::MalformedInput(format!(
                "expected exactly one file at '{path}' in {} but found {count}",
                self.purpose
            ))),
        }
    }

    pub async fn commit(&self, reference: &ImageReference) -> Result<(), PipelineError> {
        self.ctx
            .with_deadline("commit image", async {
                self.ctx
                    .engine
                    .commit(&self.container_id, reference)
                    .await
                    .map_err(PipelineError::from)
            })
            .await
    }

    /// Removes the container. Failures are logged, not returned.
    pub async fn destroy(mut self) {
        remove_container(&self.ctx, &self.container_id).await;
        self.destroyed = true;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }

        debug!(
            container_id = %self.container_id,
            purpose = %self.purpose,
            "Session dropped; removing container"
        );
        let ctx = self.ctx.clone();
        let container_id = std::mem::take(&mut self.container_id);
        self.ctx.spawn_cleanup(async move {
            remove_container(&ctx, &container_id).await;
        });
    }
}

async fn remove_container(ctx: &Context, container_id: &str) {
    if let Err(e) = ctx.engine.remove_container(container_id).await {
        warn!(
            container_id,
            err = %e,
            "Could not remove container; run 'csi-pipeline prune' to clean up"
        );
    }
}
