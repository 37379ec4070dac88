//! Definitions of the containers that tools run in.
//!
//! Each factory returns an [`EnvironmentSpec`]: the base image, the environment, the caches and
//! the setup commands that make the container ready for work. Nothing is started here; a spec
//! becomes a running container through [`Session::start`].

mod session;

pub use session::Session;

use crate::conf;
use crate::credentials::{CredentialMode, Secret};
use crate::engine::Mount;

/// Where Go keeps downloaded modules inside the builder.
const MODULE_CACHE_TARGET: &str = "/go/pkg/mod";
/// Where Go keeps compiled packages inside the builder.
const BUILD_CACHE_TARGET: &str = "/root/.cache/go-build";

/// Env var holding the module token during setup; never part of the container config.
const TOKEN_ENV: &str = "GH_TOKEN";

/// Rewrites HTTPS module fetches for the git host (`$1`) to carry the token.
const TOKEN_GIT_SETUP: &str = r#"git config --global "url.https://x-access-token:${GH_TOKEN}@$1/.insteadOf" "https://$1/""#;

/// Rewrites HTTPS module fetches for the git host (`$1`) to SSH and trusts the host's keys.
const AGENT_GIT_SETUP: &str = r#"git config --global "url.git@$1:.insteadOf" "https://$1/"
mkdir -p -m 0700 "$HOME/.ssh"
ssh-keyscan "$1" >> "$HOME/.ssh/known_hosts"
chmod 600 "$HOME/.ssh/known_hosts""#;

/// Everything needed to bring up one tool container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Short description of what the container is for; ends up in its name and in errors.
    pub purpose: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Passed to every command run in the container, never stored in its config.
    pub secret_env: Vec<(String, Secret)>,
    pub mounts: Vec<Mount>,
    /// Commands run in order right after the container starts.
    pub setup: Vec<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: Vec<(String, String)>,
    /// Containers that only receive files before being committed never run commands.
    pub runs_commands: bool,
}

impl EnvironmentSpec {
    pub fn new(purpose: &str, image: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            image: image.to_string(),
            runs_commands: true,
            ..Default::default()
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn secret_env(mut self, key: &str, value: Secret) -> Self {
        self.secret_env.push((key.to_string(), value));
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn setup(mut self, argv: &[&str]) -> Self {
        self.setup.push(argv.iter().map(|arg| arg.to_string()).collect());
        self
    }

    pub fn working_dir(mut self, path: &str) -> Self {
        self.working_dir = Some(path.to_string());
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    /// A container whose filesystem is assembled from the outside and then committed.
    pub fn filesystem_only(mut self) -> Self {
        self.runs_commands = false;
        self
    }
}

/// A Go toolchain container able to fetch private modules.
///
/// Exactly one of the two credential mechanisms is configured, chosen by `mode`: a token
/// rewrites HTTPS fetches to carry it, an agent socket is mounted and fetches go over SSH.
pub fn go_builder(config: &conf::Builder, mode: &CredentialMode) -> EnvironmentSpec {
    let spec = EnvironmentSpec::new("go-builder", &config.go_image)
        .env("GOPRIVATE", &config.goprivate)
        .mount(Mount::Cache {
            volume: config.module_cache_volume.clone(),
            target: MODULE_CACHE_TARGET.to_string(),
        })
        .mount(Mount::Cache {
            volume: config.build_cache_volume.clone(),
            target: BUILD_CACHE_TARGET.to_string(),
        });

    match mode {
        CredentialMode::Token(token) => spec
            .secret_env(TOKEN_ENV, token.clone())
            .setup(&["apk", "add", "--no-cache", "git", "bash"])
            .setup(&["sh", "-ec", TOKEN_GIT_SETUP, "sh", &config.git_host]),
        CredentialMode::AgentSocket(socket) => spec
            .env("SSH_AUTH_SOCK", &config.agent_socket_target)
            .mount(Mount::Bind {
                source: socket.clone(),
                target: config.agent_socket_target.clone(),
            })
            .setup(&[
                "apk",
                "add",
                "--no-cache",
                "git",
                "bash",
                "ca-certificates",
                "openssh-client",
            ])
            .setup(&["sh", "-ec", AGENT_GIT_SETUP, "sh", &config.git_host]),
    }
}

/// The Go builder plus the Helm and make tooling needed to package charts.
pub fn helm_builder(config: &conf::Builder, mode: &CredentialMode) -> EnvironmentSpec {
    let mut spec = go_builder(config, mode).setup(&["apk", "add", "--no-cache", "helm", "make"]);
    spec.purpose = "helm-builder".to_string();
    spec
}

/// A minimal container holding the cluster tooling for installing charts.
pub fn cluster_client(config: &conf::Builder) -> EnvironmentSpec {
    EnvironmentSpec::new("cluster-client", &config.cluster_client_image).setup(&[
        "apk",
        "add",
        "--no-cache",
        "helm",
        "kubectl",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Config;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn config() -> conf::Builder {
        Config::defaults().builder
    }

    fn caches() -> Vec<Mount> {
        vec![
            Mount::Cache {
                volume: "go-cache".into(),
                target: "/go/pkg/mod".into(),
            },
            Mount::Cache {
                volume: "go-cache-root".into(),
                target: "/root/.cache/go-build".into(),
            },
        ]
    }

    #[test]
    fn token_mode_never_mounts_an_agent_socket() {
        let spec = go_builder(&config(), &CredentialMode::Token(Secret::new("ghp_token")));

        assert_eq!(spec.image, "golang:1.24-alpine");
        assert_eq!(spec.mounts, caches());
        assert_eq!(
            spec.secret_env,
            vec![("GH_TOKEN".to_string(), Secret::new("ghp_token"))]
        );
        assert_eq!(
            spec.env,
            vec![("GOPRIVATE".to_string(), "github.com/weka".to_string())]
        );
        assert!(spec.setup.iter().all(|argv| !argv.contains(&"ghp_token".to_string())));
        assert!(spec.setup[1].join(" ").contains("x-access-token"));
    }

    #[test]
    fn agent_mode_never_carries_a_token() {
        let socket = PathBuf::from("/run/user/1000/ssh-agent.sock");
        let spec = go_builder(&config(), &CredentialMode::AgentSocket(socket.clone()));

        let mut expected_mounts = caches();
        expected_mounts.push(Mount::Bind {
            source: socket,
            target: "/tmp/ssh-agent.sock".into(),
        });

        assert_eq!(spec.mounts, expected_mounts);
        assert!(spec.secret_env.is_empty());
        assert!(spec
            .env
            .contains(&("SSH_AUTH_SOCK".to_string(), "/tmp/ssh-agent.sock".to_string())));
        assert!(spec.setup[0].contains(&"openssh-client".to_string()));
        assert_eq!(spec.setup[1].last().unwrap(), "github.com");
    }

    #[test]
    fn helm_builder_extends_go_builder() {
        let mode = CredentialMode::Token(Secret::new("ghp_token"));
        let go = go_builder(&config(), &mode);
        let helm = helm_builder(&config(), &mode);

        assert_eq!(helm.purpose, "helm-builder");
        assert_eq!(helm.mounts, go.mounts);
        assert_eq!(helm.setup[..go.setup.len()], go.setup[..]);
        assert_eq!(
            helm.setup.last().unwrap(),
            &vec!["apk", "add", "--no-cache", "helm", "make"]
        );
    }

    #[test]
    fn cluster_client_has_no_credentials() {
        let spec = cluster_client(&config());

        assert_eq!(spec.image, "alpine:latest");
        assert!(spec.mounts.is_empty());
        assert!(spec.secret_env.is_empty());
        assert_eq!(spec.setup, vec![vec!["apk", "add", "--no-cache", "helm", "kubectl"]]);
    }
}
