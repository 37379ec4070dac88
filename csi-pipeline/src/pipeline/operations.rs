//! The operations exposed on the command line, each composed from named pipeline steps.

use super::{Context, Pipeline, PipelineError, StepPolicy};
use crate::apps::chart::{self, ChartTarget, PackagedChart};
use crate::apps::go::{self, GoBuild};
use crate::apps::image;
use crate::apps::install::{self, InstallRequest};
use crate::builder::{go_builder, helm_builder, EnvironmentSpec, Session};
use crate::credentials::{CredentialMode, RegistryCredential, Secret};
use crate::engine::{CONTAINER_PREFIX, RUN_LABEL};
use crate::reference::ImageReference;
use crate::source::SourceTree;
use crate::version;
use tracing::{info, warn};

/// Destinations for a combined image and chart publication.
#[derive(Debug, Clone)]
pub struct PublishTargets {
    pub image_repository: String,
    /// The chart credential, when present, is also used for the image push.
    pub chart: ChartTarget,
}

#[derive(Debug, Clone)]
pub struct DeployInputs {
    pub kubeconfig: Secret,
    pub values: Option<Vec<u8>>,
    pub cachebuster: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Operations {
    ctx: Context,
}

impl Operations {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Default publication targets from configuration.
    pub fn default_targets(&self) -> PublishTargets {
        let registry = &self.ctx.config.registry;
        PublishTargets {
            image_repository: registry.image_repository.clone(),
            chart: ChartTarget {
                repository: registry.chart_repository.clone(),
                credential: None,
                registry_host: None,
            },
        }
    }

    /// Publication targets for the alternate registry; a credential is mandatory there.
    pub fn alternate_targets(
        &self,
        credential: RegistryCredential,
        registry_host: Option<String>,
    ) -> PublishTargets {
        let registry = &self.ctx.config.registry;
        PublishTargets {
            image_repository: registry.alternate_image_repository.clone(),
            chart: ChartTarget {
                repository: registry.alternate_chart_repository.clone(),
                credential: Some(credential),
                registry_host,
            },
        }
    }

    pub async fn version(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        explicit: Option<&str>,
    ) -> Result<String, PipelineError> {
        pipeline
            .step("resolve-version", move || async move {
                Ok(version::resolve(source, explicit))
            })
            .await
    }

    /// Like [`Operations::version`], but explicit versions must also be valid chart versions.
    async fn chart_version(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        explicit: Option<&str>,
    ) -> Result<String, PipelineError> {
        pipeline
            .step("resolve-chart-version", move || async move {
                if let Some(explicit) = explicit.filter(|version| !version.is_empty()) {
                    version::validate_chart_version(explicit)?;
                }
                Ok::<_, PipelineError>(version::resolve(source, explicit))
            })
            .await
    }

    pub async fn build_binary(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
    ) -> Result<Vec<u8>, PipelineError> {
        let ctx = &self.ctx;
        let spec = &go_builder(&ctx.config.builder, mode);
        let build = &GoBuild::from(&ctx.config.app);

        pipeline
            .step("build-binary", move || go::build(ctx, source, spec, build))
            .await
    }

    /// Builds the runtime image and commits it locally as `<app-name>:<version>`.
    pub async fn build_image(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let version = self.version(pipeline, source, explicit_version).await?;
        let reference = ImageReference::new(&self.ctx.config.app.name, &version);

        self.assemble_image(pipeline, source, mode, &reference)
            .await?;
        Ok(reference.to_string())
    }

    pub async fn publish_image(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        repository: &str,
        auth: Option<&RegistryCredential>,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let version = self.version(pipeline, source, explicit_version).await?;
        self.push_image(pipeline, source, mode, repository, auth, &version)
            .await
    }

    /// Packages the chart without publishing it.
    pub async fn build_chart(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        explicit_version: Option<&str>,
    ) -> Result<PackagedChart, PipelineError> {
        let version = &self.chart_version(pipeline, source, explicit_version).await?;
        let ctx = &self.ctx;
        let spec = &helm_builder(&ctx.config.builder, mode);

        pipeline
            .step("package-chart", move || chart::package(ctx, source, spec, version))
            .await
    }

    pub async fn publish_chart(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        target: &ChartTarget,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let version = self.chart_version(pipeline, source, explicit_version).await?;
        self.push_chart(pipeline, source, mode, target, &version)
            .await
    }

    /// Publishes the image, then the chart, under one version. Returns the chart reference.
    pub async fn publish_all(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        targets: &PublishTargets,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let version = self.chart_version(pipeline, source, explicit_version).await?;

        self.push_image(
            pipeline,
            source,
            mode,
            &targets.image_repository,
            targets.chart.credential.as_ref(),
            &version,
        )
        .await?;

        self.push_chart(pipeline, source, mode, &targets.chart, &version)
            .await
    }

    /// Publishes everything, then installs the chart into the cluster. Returns helm's output.
    pub async fn deploy(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        targets: &PublishTargets,
        inputs: &DeployInputs,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let chart = self
            .publish_all(pipeline, source, mode, targets, explicit_version)
            .await?;

        let req = &InstallRequest {
            chart: ImageReference::parse(&chart)?,
            image_repository: targets.image_repository.clone(),
            kubeconfig: inputs.kubeconfig.clone(),
            values: inputs.values.clone(),
            cachebuster: inputs.cachebuster.clone(),
        };

        let policy = StepPolicy {
            retries: self.ctx.config.deploy.retries,
            ..pipeline.policy()
        };
        let ctx = &self.ctx;

        pipeline
            .step_with_policy("install-chart", policy, move || install::install(ctx, req))
            .await
    }

    /// Publishes everything to the alternate registries.
    pub async fn publish_alternate(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        credential: RegistryCredential,
        registry_host: Option<String>,
        explicit_version: Option<&str>,
    ) -> Result<String, PipelineError> {
        let targets = self.alternate_targets(credential, registry_host);
        let chart = self
            .publish_all(pipeline, source, mode, &targets, explicit_version)
            .await?;

        Ok(format!(
            "published {chart} to {}",
            targets.image_repository
        ))
    }

    /// Commits the source tree into a general purpose image for poking around. Nothing is built.
    pub async fn explore(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
    ) -> Result<String, PipelineError> {
        let version = self.version(pipeline, source, None).await?;
        let reference = &ImageReference::new(&format!("{}-explore", self.ctx.config.app.name), &version);
        let ctx = &self.ctx;

        pipeline
            .step("assemble-explore-image", move || async move {
                let explore = &ctx.config.explore;
                let archive = source.archive(explore.mount_path.trim_start_matches('/'))?;

                let spec = EnvironmentSpec::new("explore", &explore.image)
                    .working_dir(&explore.mount_path)
                    .filesystem_only();
                let session = Session::start(ctx, &spec).await?;
                let result = async {
                    session.upload(archive).await?;
                    session.commit(reference).await
                }
                .await;
                session.destroy().await;

                result?;
                Ok::<_, PipelineError>(reference.to_string())
            })
            .await
    }

    /// Removes containers left behind by interrupted runs. Returns how many were removed.
    pub async fn prune(&self, pipeline: &mut Pipeline) -> Result<usize, PipelineError> {
        let ctx = &self.ctx;

        pipeline
            .step("prune", move || async move {
                let containers = ctx
                    .engine
                    .list_created(RUN_LABEL, CONTAINER_PREFIX)
                    .await?;
                let mut removed = 0;

                for container_id in containers {
                    match ctx.engine.remove_container(&container_id).await {
                        Ok(_) => removed += 1,
                        Err(e) => warn!(%container_id, err = %e, "Could not remove container"),
                    }
                }

                info!(removed, "Pruned leftover containers");
                Ok::<_, PipelineError>(removed)
            })
            .await
    }

    async fn assemble_image(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        reference: &ImageReference,
    ) -> Result<(), PipelineError> {
        let binary = &self.build_binary(pipeline, source, mode).await?;
        let ctx = &self.ctx;

        pipeline
            .step("assemble-image", move || image::assemble(ctx, binary, reference))
            .await
    }

    async fn push_image(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        repository: &str,
        auth: Option<&RegistryCredential>,
        version: &str,
    ) -> Result<String, PipelineError> {
        let reference = &ImageReference::new(repository, version);
        self.assemble_image(pipeline, source, mode, reference)
            .await?;
        let ctx = &self.ctx;

        pipeline
            .step("push-image", move || image::push(ctx, reference, auth))
            .await
    }

    async fn push_chart(
        &self,
        pipeline: &mut Pipeline,
        source: &SourceTree,
        mode: &CredentialMode,
        target: &ChartTarget,
        version: &str,
    ) -> Result<String, PipelineError> {
        let ctx = &self.ctx;
        let spec = &helm_builder(&ctx.config.builder, mode);

        pipeline
            .step("push-chart", move || chart::publish(ctx, source, spec, target, version))
            .await
    }
}
