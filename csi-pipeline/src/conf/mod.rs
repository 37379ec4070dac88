use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::path::PathBuf;
use strum::{Display, EnumString};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG_NAME: &str = "default_config.toml";
const ENV_PREFIX: &str = "CSI_PIPELINE_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("embedded default configuration '{0}' is missing")]
    MissingDefault(String),

    #[error("embedded default configuration is not valid utf-8; {0}")]
    InvalidDefault(#[from] std::str::Utf8Error),

    #[error("could not parse configuration; {0}")]
    Parse(#[from] Box<figment::Error>),
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub engine: Engine,
    pub builder: Builder,
    pub app: App,
    pub chart: Chart,
    pub registry: Registry,
    pub deploy: Deploy,
    pub explore: Explore,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Upper bound in seconds for each attempt of a step; 0 disables it.
    pub step_timeout: u64,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    /// Docker daemon address: a socket path (optionally `unix://`), or a `tcp://`/`http://`
    /// address. Empty means the platform default socket.
    pub docker_host: String,
    pub request_timeout: u64, // in seconds
    /// Deadline applied to every tool invocation in seconds.
    pub exec_timeout: u64,
    pub always_pull: bool,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Builder {
    pub go_image: String,
    /// Organization namespace whose modules bypass the public Go proxy.
    pub goprivate: String,
    pub git_host: String,
    pub module_cache_volume: String,
    pub build_cache_volume: String,
    /// Where the caller's ssh agent socket appears inside builder containers.
    pub agent_socket_target: String,
    pub cluster_client_image: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub name: String,
    pub program_path: String,
    /// Digest pinned base image for the runtime container.
    pub runtime_image: String,
    pub binary_path: String,
    pub cache_deps: bool,
    pub go_generate: bool,
    pub exclude: Vec<String>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub path: String,
    pub name: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    pub image_repository: String,
    pub chart_repository: String,
    pub alternate_image_repository: String,
    pub alternate_chart_repository: String,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Deploy {
    pub release: String,
    pub namespace: String,
    /// Extra attempts for the helm upgrade step.
    pub retries: u32,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Explore {
    pub image: String,
    pub mount_path: String,
}

/// returns the embedded default configuration file.
fn default_config() -> Result<String, ConfigError> {
    let config_file = EmbeddedConfigFS::get(DEFAULT_CONFIG_NAME)
        .ok_or_else(|| ConfigError::MissingDefault(DEFAULT_CONFIG_NAME.to_string()))?;

    Ok(std::str::from_utf8(&config_file.data)?.to_string())
}

/// returns the default configuration paths that are searched in case user does not specify.
fn config_paths() -> Vec<PathBuf> {
    let Some(user_home) = dirs::home_dir() else {
        return vec![];
    };

    vec![
        user_home.join(".csi-pipeline.toml"),
        user_home.join(".config").join("csi-pipeline.toml"),
    ]
}

impl Config {
    /// returns a correctly deserialized config struct from the configuration files and environment passed to it.
    ///
    /// Embedded defaults are read first, then the user's configuration files in order, then environment
    /// variables. Later sources win on conflicting keys, so `CSI_PIPELINE_DEPLOY__NAMESPACE=test`
    /// overrides whatever the files say about `deploy.namespace`.
    pub fn parse(path_override: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::string(&default_config()?));

        match path_override {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                for path in config_paths() {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        // Lastly env vars always override everything.
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(Box::new(e)))
    }

    /// The embedded defaults alone, untouched by the environment or user files.
    #[cfg(test)]
    pub fn defaults() -> Self {
        Figment::new()
            .merge(Toml::string(&default_config().unwrap()))
            .extract()
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    /// Test that the default config is properly parsed from the embedded file.
    fn parse_default_config_from_file() {
        let parsed_config: Config = Figment::new()
            .merge(Toml::string(&default_config().unwrap()))
            .extract()
            .unwrap();

        assert_eq!(parsed_config.general.log_level, "info");
        assert_eq!(parsed_config.general.log_format, LogFormat::Pretty);
        assert_eq!(parsed_config.builder.go_image, "golang:1.24-alpine");
        assert_eq!(parsed_config.builder.module_cache_volume, "go-cache");
        assert_eq!(parsed_config.builder.build_cache_volume, "go-cache-root");
        assert_eq!(parsed_config.app.program_path, "cmd/metricsserver/main.go");
        assert!(parsed_config.app.runtime_image.contains("@sha256:"));
        assert_eq!(parsed_config.chart.name, "csi-metricsserver");
        assert_eq!(
            parsed_config.deploy,
            Deploy {
                release: "metricsserver".to_string(),
                namespace: "csi-metricsserver-system".to_string(),
                retries: 0,
            }
        );
        assert_eq!(parsed_config.app.exclude.len(), 9);
    }

    #[test]
    /// Test that env vars and override files correctly overwrite the defaults.
    fn parse_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "override.toml",
                r#"
                [deploy]
                namespace = "weka-system"
                "#,
            )?;
            jail.set_env("CSI_PIPELINE_GENERAL__LOG_FORMAT", "json");
            jail.set_env("CSI_PIPELINE_ENGINE__EXEC_TIMEOUT", "30");

            let path = jail.directory().join("override.toml");
            let config = Config::parse(Some(&path)).unwrap();

            assert_eq!(config.deploy.namespace, "weka-system");
            assert_eq!(config.deploy.release, "metricsserver");
            assert_eq!(config.general.log_format, LogFormat::Json);
            assert_eq!(config.engine.exec_timeout, 30);

            Ok(())
        });
    }
}
