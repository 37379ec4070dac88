mod args;
mod report;

pub use args::*;

use crate::apps::chart::ChartTarget;
use crate::conf::{Config, LogFormat};
use crate::credentials::{CredentialMode, RegistryCredential, Secret};
use crate::engine::Docker;
use crate::pipeline::operations::{DeployInputs, Operations, PublishTargets};
use crate::pipeline::{Context, Pipeline, StepPolicy};
use crate::source::SourceTree;
use crate::version;
use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use colored::Colorize;
use polyfmt::{println, Spinner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
pub struct Cli {
    args: Args,
    conf: Config,
}

impl Cli {
    /// Parses arguments and configuration and sets up logging.
    pub fn new() -> Result<Self> {
        let args = Args::parse();
        let conf = Config::parse(args.config_path.as_ref())
            .context("Could not parse configuration")?;

        init_logging(&conf.general.log_level, conf.general.log_format)?;

        Ok(Self { args, conf })
    }

    pub async fn run(&mut self) -> Result<()> {
        let source = SourceTree::open(self.args.source.clone(), self.conf.app.exclude.clone())
            .await
            .with_context(|| {
                format!(
                    "Could not read source tree at '{}'",
                    self.args.source.display()
                )
            })?;

        debug!(
            digest = source.digest(),
            files = source.file_count(),
            "Snapshotted source tree"
        );

        // Answering the version question does not need a container engine.
        if let Commands::Version { version } = &self.args.command {
            println!("{}", version::resolve(&source, version.explicit()));
            return Ok(());
        }

        let engine = Docker::new(&self.conf.engine)
            .await
            .context("Could not connect to container engine")?;
        let ctx = Context::new(self.conf.clone(), Arc::new(engine));

        let policy = StepPolicy {
            timeout: match self.conf.general.step_timeout {
                0 => None,
                seconds => Some(Duration::from_secs(seconds)),
            },
            retries: 0,
        };
        let mut pipeline = Pipeline::new(&ctx.run_id, policy);
        let operations = Operations::new(ctx.clone());

        let spinner = Spinner::create(self.args.command.activity());
        let outcome = tokio::select! {
            result = self.dispatch(&operations, &mut pipeline, &source) => result,
            _ = tokio::signal::ctrl_c() => Err(anyhow!(
                "Interrupted; leftover containers can be removed with 'csi-pipeline prune'"
            )),
        };
        drop(spinner);

        // Sessions dropped mid-step leave their container removal running in the background.
        ctx.finish_cleanup().await;

        report::print(&pipeline, outcome.is_ok());
        if let Some(path) = &self.args.report {
            report::write_json(&pipeline, outcome.is_ok(), path)
                .await
                .with_context(|| format!("Could not write run report to '{}'", path.display()))?;
        }

        let output = outcome?;
        if !output.is_empty() {
            println!("{}", output);
        }

        Ok(())
    }

    /// Runs the selected command and returns what should be printed to stdout.
    async fn dispatch(
        &self,
        operations: &Operations,
        pipeline: &mut Pipeline,
        source: &SourceTree,
    ) -> Result<String> {
        match &self.args.command {
            Commands::Binary { builder, output } => {
                let mode = builder.credential_mode()?;
                let binary = operations
                    .build_binary(pipeline, source, &mode)
                    .await
                    .context("Could not build binary")?;

                write_executable(output, &binary).await?;
                Ok(output.display().to_string())
            }
            Commands::Image { builder, version } => {
                let mode = builder.credential_mode()?;
                Ok(operations
                    .build_image(pipeline, source, &mode, version.explicit())
                    .await
                    .context("Could not build image")?)
            }
            Commands::PublishImage {
                builder,
                version,
                repository,
                registry_secret,
            } => {
                let mode = builder.credential_mode()?;
                let auth = registry_credential(registry_secret.as_deref())?;
                let repository = repository
                    .clone()
                    .unwrap_or_else(|| self.conf.registry.image_repository.clone());

                Ok(operations
                    .publish_image(
                        pipeline,
                        source,
                        &mode,
                        &repository,
                        auth.as_ref(),
                        version.explicit(),
                    )
                    .await
                    .context("Could not publish image")?)
            }
            Commands::Chart {
                builder,
                version,
                output,
            } => {
                let mode = builder.credential_mode()?;
                let chart = operations
                    .build_chart(pipeline, source, &mode, version.explicit())
                    .await
                    .context("Could not package chart")?;

                let path = output.join(&chart.file_name);
                tokio::fs::create_dir_all(output)
                    .await
                    .with_context(|| format!("Could not create '{}'", output.display()))?;
                tokio::fs::write(&path, &chart.data)
                    .await
                    .with_context(|| format!("Could not write '{}'", path.display()))?;
                Ok(path.display().to_string())
            }
            Commands::PublishChart {
                builder,
                version,
                helm_repository,
                registry,
            } => {
                let mode = builder.credential_mode()?;
                let mut targets = self.targets(None, helm_repository.as_deref());
                registry.apply(&mut targets)?;

                Ok(operations
                    .publish_chart(pipeline, source, &mode, &targets.chart, version.explicit())
                    .await
                    .context("Could not publish chart")?)
            }
            Commands::PublishAll {
                builder,
                version,
                targets,
                registry,
            } => {
                let mode = builder.credential_mode()?;
                let mut resolved = targets.resolve(self);
                registry.apply(&mut resolved)?;

                Ok(operations
                    .publish_all(pipeline, source, &mode, &resolved, version.explicit())
                    .await
                    .context("Could not publish image and chart")?)
            }
            Commands::Deploy {
                builder,
                version,
                targets,
                registry,
                kubeconfig,
                values,
                cachebuster,
            } => {
                let mode = builder.credential_mode()?;
                let mut resolved = targets.resolve(self);
                registry.apply(&mut resolved)?;

                let kubeconfig =
                    Secret::from_source(kubeconfig).context("Could not read kubeconfig")?;
                let values = match values {
                    Some(path) => Some(tokio::fs::read(path).await.with_context(|| {
                        format!("Could not read values file '{}'", path.display())
                    })?),
                    None => None,
                };
                let inputs = DeployInputs {
                    kubeconfig,
                    values,
                    cachebuster: cachebuster.clone(),
                };

                Ok(operations
                    .deploy(
                        pipeline,
                        source,
                        &mode,
                        &resolved,
                        &inputs,
                        version.explicit(),
                    )
                    .await
                    .context("Could not deploy")?)
            }
            Commands::PublishAlternate {
                builder,
                version,
                registry_secret,
                registry_host,
            } => {
                let mode = builder.credential_mode()?;
                let credential = registry_credential(Some(registry_secret))?
                    .ok_or_else(|| anyhow!("A registry secret is required"))?;

                Ok(operations
                    .publish_alternate(
                        pipeline,
                        source,
                        &mode,
                        credential,
                        registry_host.clone(),
                        version.explicit(),
                    )
                    .await
                    .context("Could not publish to alternate registries")?)
            }
            Commands::Explore => {
                let reference = operations
                    .explore(pipeline, source)
                    .await
                    .context("Could not build explore image")?;

                println!(
                    "Start exploring with: {}",
                    format!("docker run --rm -it {reference} bash").cyan()
                );
                Ok(reference)
            }
            Commands::Version { version } => Ok(version::resolve(source, version.explicit())),
            Commands::Prune => {
                let removed = operations
                    .prune(pipeline)
                    .await
                    .context("Could not prune containers")?;
                Ok(format!("removed {removed} containers"))
            }
        }
    }

    fn targets(&self, repository: Option<&str>, helm_repository: Option<&str>) -> PublishTargets {
        let registry = &self.conf.registry;
        PublishTargets {
            image_repository: repository
                .unwrap_or(&registry.image_repository)
                .to_string(),
            chart: ChartTarget {
                repository: helm_repository
                    .unwrap_or(&registry.chart_repository)
                    .to_string(),
                credential: None,
                registry_host: None,
            },
        }
    }
}

impl BuilderArgs {
    /// Resolves exactly one way for builders to fetch private modules. Fails before any work
    /// starts when neither is available.
    pub fn credential_mode(&self) -> Result<CredentialMode> {
        let token = self
            .gh_token
            .as_deref()
            .map(Secret::from_source)
            .transpose()
            .context("Could not read access token")?;

        let agent_socket = self.ssh_sock.clone().or_else(|| {
            std::env::var_os("SSH_AUTH_SOCK")
                .filter(|socket| !socket.is_empty())
                .map(PathBuf::from)
        });

        Ok(CredentialMode::select(token, agent_socket)?)
    }
}

impl TargetArgs {
    fn resolve(&self, cli: &Cli) -> PublishTargets {
        cli.targets(self.repository.as_deref(), self.helm_repository.as_deref())
    }
}

impl RegistryArgs {
    fn apply(&self, targets: &mut PublishTargets) -> Result<()> {
        targets.chart.credential = registry_credential(self.registry_secret.as_deref())?;
        targets.chart.registry_host = self.registry_host.clone();
        Ok(())
    }
}

fn registry_credential(source: Option<&str>) -> Result<Option<RegistryCredential>> {
    let Some(source) = source else {
        return Ok(None);
    };

    let secret = Secret::from_source(source).context("Could not read registry secret")?;
    Ok(Some(RegistryCredential::parse(&secret)?))
}

async fn write_executable(path: &Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Could not write '{}'", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("Could not make '{}' executable", path.display()))?;

    Ok(())
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("Could not initialize logging; {}", e))
}
