use super::{CreateContainerRequest, EngineError, ExecOutput, ExecRequest, Mount};
use crate::conf;
use crate::credentials::RegistryCredential;
use crate::reference::ImageReference;
use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ListImagesOptions, PushImageOptions,
};
use bollard::models::{HostConfig, MountTypeEnum};
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, instrument, trace};

/// Keeps builder containers alive between execs; the image's own command is irrelevant to us.
const IDLE_ENTRYPOINT: [&str; 2] = ["/bin/sh", "-c"];
const IDLE_COMMAND: &str = "trap 'exit 0' TERM; while :; do sleep 3600; done";

fn format_env_var(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

fn server_error(e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => EngineError::Unauthorized(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NoSuchContainer(message),
        e => EngineError::Unknown(e.to_string()),
    }
}

/// Registries report auth failures as free text inside an otherwise successful stream.
fn is_auth_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    ["unauthorized", "denied", "authentication required", "forbidden"]
        .iter()
        .any(|marker| message.contains(marker))
}

/// How to reach the daemon named by `engine.docker_host`.
#[derive(Debug, PartialEq, Eq)]
enum Transport<'a> {
    Default,
    Socket(&'a str),
    Http(&'a str),
}

impl<'a> Transport<'a> {
    fn from_host(host: &'a str) -> Self {
        if host.is_empty() {
            return Transport::Default;
        }

        if host.starts_with("tcp://") || host.starts_with("http://") {
            return Transport::Http(host);
        }

        Transport::Socket(host.strip_prefix("unix://").unwrap_or(host))
    }
}

/// The engine reports container names with a leading slash.
fn has_name_prefix(name: &str, prefix: &str) -> bool {
    name.trim_start_matches('/').starts_with(prefix)
}

#[derive(Debug, Clone)]
pub struct Docker {
    client: bollard::Docker,
}

impl Docker {
    #[instrument(fields(origin = "engine::docker"))]
    pub async fn new(config: &conf::Engine) -> Result<Self, EngineError> {
        let client = match Transport::from_host(&config.docker_host) {
            Transport::Default => bollard::Docker::connect_with_socket_defaults(),
            Transport::Socket(path) => bollard::Docker::connect_with_socket(
                path,
                config.request_timeout,
                bollard::API_DEFAULT_VERSION,
            ),
            Transport::Http(address) => bollard::Docker::connect_with_http(
                address,
                config.request_timeout,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;
        let client = client.with_timeout(std::time::Duration::from_secs(config.request_timeout));

        // Check that we can actually get a connection.
        let version = client.version().await.map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        debug!(
            version = version.version.unwrap_or_default(),
            "Local docker engine successfully connected"
        );

        Ok(Self { client })
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        debug!(image, "Pulling image");
        self.client
            .create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| EngineError::NoSuchImage(format!("{image}; {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl super::Engine for Docker {
    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn ensure_image(&self, image: &str, always_pull: bool) -> Result<(), EngineError> {
        if always_pull {
            return self.pull(image).await;
        }

        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![image.to_string()]);

        let images = self
            .client
            .list_images(Some(ListImagesOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(server_error)?;

        if images.is_empty() {
            self.pull(image).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, req), fields(origin = "engine::docker", name = %req.name, image = %req.image))]
    async fn create_container(&self, req: CreateContainerRequest) -> Result<String, EngineError> {
        // Remove leftovers of an interrupted run that used the same name.
        if let Err(e) = self
            .client
            .remove_container(
                &req.name,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            trace!(container_name = &req.name, err = ?e, "could not remove previous container");
        }

        let mut binds = vec![];
        let mut mounts = vec![];
        for mount in &req.mounts {
            match mount {
                Mount::Cache { volume, target } => mounts.push(bollard::models::Mount {
                    target: Some(target.clone()),
                    source: Some(volume.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                }),
                Mount::Bind { source, target } => {
                    binds.push(format!("{}:{}", source.display(), target))
                }
            }
        }

        let mut container_config = bollard::container::Config {
            image: Some(req.image.clone()),
            env: Some(
                req.env
                    .iter()
                    .map(|(key, value)| format_env_var(key, value))
                    .collect(),
            ),
            labels: Some(req.labels.clone()),
            working_dir: req.working_dir.clone(),
            host_config: Some(HostConfig {
                binds: Some(binds),
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        };

        if req.keep_alive {
            container_config.entrypoint = Some(IDLE_ENTRYPOINT.iter().map(|s| s.to_string()).collect());
            container_config.cmd = Some(vec![IDLE_COMMAND.to_string()]);
        }

        let created_container = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: req.name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(server_error)?;

        if req.keep_alive {
            self.client
                .start_container::<String>(&created_container.id, None)
                .await
                .map_err(server_error)?;
        }

        debug!(container_id = %created_container.id, "Created container");
        Ok(created_container.id)
    }

    #[instrument(skip(self, req), fields(origin = "engine::docker", container_id = %req.container_id))]
    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, EngineError> {
        let create_exec_options = CreateExecOptions::<String> {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(req.argv.clone()),
            env: Some(
                req.env
                    .iter()
                    .map(|(key, value)| format_env_var(key, value))
                    .collect(),
            ),
            working_dir: req.working_dir.clone(),
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(&req.container_id, create_exec_options)
            .await
            .map_err(server_error)?;

        let results = self
            .client
            .start_exec(&created.id, None)
            .await
            .map_err(server_error)?;

        let mut output = ExecOutput::default();

        match results {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(log) = stream.next().await {
                    match log.map_err(server_error)? {
                        LogOutput::StdOut { message } => {
                            let text = String::from_utf8_lossy(&message);
                            trace!(stream = "stdout", "{}", text.trim_end());
                            output.stdout.push_str(&text);
                        }
                        LogOutput::StdErr { message } => {
                            let text = String::from_utf8_lossy(&message);
                            trace!(stream = "stderr", "{}", text.trim_end());
                            output.stderr.push_str(&text);
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Unknown(
                    "Could not properly attach to exec output".into(),
                ))
            }
        }

        let inspected = self
            .client
            .inspect_exec(&created.id)
            .await
            .map_err(server_error)?;

        output.exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(output)
    }

    #[instrument(skip(self, archive), fields(origin = "engine::docker", bytes = archive.len()))]
    async fn upload(&self, container_id: &str, archive: Bytes) -> Result<(), EngineError> {
        self.client
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(server_error)
    }

    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn download(&self, container_id: &str, path: &str) -> Result<Bytes, EngineError> {
        let archive = self
            .client
            .download_from_container(
                container_id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .map_err(server_error)
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;

        Ok(Bytes::from(archive))
    }

    #[instrument(skip(self, reference), fields(origin = "engine::docker", reference = %reference))]
    async fn commit(
        &self,
        container_id: &str,
        reference: &ImageReference,
    ) -> Result<(), EngineError> {
        self.client
            .commit_container(
                CommitContainerOptions {
                    container: container_id.to_string(),
                    repo: reference.repository.clone(),
                    tag: reference.tag.clone(),
                    pause: true,
                    ..Default::default()
                },
                bollard::container::Config::<String>::default(),
            )
            .await
            .map_err(server_error)?;

        Ok(())
    }

    #[instrument(skip(self, reference, auth), fields(origin = "engine::docker", reference = %reference))]
    async fn push(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryCredential>,
    ) -> Result<(), EngineError> {
        let credentials = auth.map(|auth| bollard::auth::DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.expose().to_string()),
            ..Default::default()
        });

        let mut stream = self.client.push_image(
            &reference.repository,
            Some(PushImageOptions {
                tag: reference.tag.clone(),
            }),
            credentials,
        );

        while let Some(info) = stream.next().await {
            let info = info.map_err(server_error)?;

            if let Some(message) = info.error {
                if is_auth_failure(&message) {
                    return Err(EngineError::Unauthorized(message));
                }
                return Err(EngineError::Unknown(message));
            }

            if let Some(status) = info.status {
                trace!(status, "push progress");
            }
        }

        Ok(())
    }

    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(server_error)
    }

    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn list_created(
        &self,
        label: &str,
        name_prefix: &str,
    ) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        filters.insert("name".to_string(), vec![format!("^/{name_prefix}")]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(server_error)?;

        // The engine's name filter is a loose match; check the prefix ourselves.
        Ok(containers
            .into_iter()
            .filter(|container| {
                container
                    .names
                    .iter()
                    .flatten()
                    .any(|name| has_name_prefix(name, name_prefix))
            })
            .filter_map(|container| container.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::unauthorized("unauthorized: authentication required", true)]
    #[case::denied("denied: requested access to the resource is denied", true)]
    #[case::layer("blob upload unknown", false)]
    fn test_is_auth_failure(#[case] message: &str, #[case] expected: bool) {
        assert_eq!(is_auth_failure(message), expected);
    }

    #[rstest]
    #[case::default("", Transport::Default)]
    #[case::unix("unix:///var/run/docker.sock", Transport::Socket("/var/run/docker.sock"))]
    #[case::bare_path("/run/user/1000/docker.sock", Transport::Socket("/run/user/1000/docker.sock"))]
    #[case::tcp("tcp://10.0.0.4:2375", Transport::Http("tcp://10.0.0.4:2375"))]
    #[case::http("http://localhost:2375", Transport::Http("http://localhost:2375"))]
    fn test_transport_from_host(#[case] host: &str, #[case] expected: Transport) {
        assert_eq!(Transport::from_host(host), expected);
    }

    #[rstest]
    #[case::ours("/csi-pipeline-0191-0-go-builder", true)]
    #[case::unprefixed("csi-pipeline-0191-1-helm-builder", true)]
    #[case::user_started("/musing_tesla", false)]
    #[case::substring("/old-csi-pipeline-0191-0-go-builder", false)]
    fn test_has_name_prefix(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(has_name_prefix(name, "csi-pipeline-"), expected);
    }

    #[test]
    fn env_vars_are_key_equals_value() {
        assert_eq!(format_env_var("GOPRIVATE", "github.com/weka"), "GOPRIVATE=github.com/weka");
    }
}
