use crate::archive::{single_file, MODE_FILE, MODE_SECRET};
use crate::builder::{cluster_client, Session};
use crate::conf;
use crate::credentials::Secret;
use crate::pipeline::{Context, PipelineError};
use crate::reference::ImageReference;
use tracing::{info, instrument};

const KUBECONFIG_PATH: &str = "/kubeconfig";
const VALUES_PATH: &str = "/values.yaml";

/// Label carrying the caller's cache-busting token; it has no effect on the release.
pub const CACHEBUSTER_LABEL: &str = "csi-pipeline.cachebuster";

#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// `<repository>:<version>` of a chart already pushed to an OCI registry.
    pub chart: ImageReference,
    /// Image repository the chart's workloads should pull from.
    pub image_repository: String,
    /// Contents of the kubeconfig for the target cluster.
    pub kubeconfig: Secret,
    /// Contents of an optional values overlay.
    pub values: Option<Vec<u8>>,
    pub cachebuster: Option<String>,
}

/// The `helm upgrade --install` invocation. The `--values` flag is left out entirely when no
/// overlay is used.
pub fn upgrade_command(
    deploy: &conf::Deploy,
    chart: &ImageReference,
    image_repository: &str,
    with_values: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "helm".into(),
        "upgrade".into(),
        "--install".into(),
        deploy.release.clone(),
        format!("oci://{}", chart.repository),
        "--namespace".into(),
        deploy.namespace.clone(),
        "--version".into(),
        chart.tag.clone(),
        "--create-namespace".into(),
        "--set".into(),
        format!("image.repository={image_repository}"),
    ];

    if with_values {
        argv.push("--values".into());
        argv.push(VALUES_PATH.into());
    }

    argv
}

/// Installs or upgrades the release in the cluster the kubeconfig points at. Returns helm's
/// output.
#[instrument(skip(ctx, req), fields(chart = %req.chart))]
pub async fn install(ctx: &Context, req: &InstallRequest) -> Result<String, PipelineError> {
    let mut spec = cluster_client(&ctx.config.builder).env("KUBECONFIG", KUBECONFIG_PATH);
    if let Some(cachebuster) = &req.cachebuster {
        spec = spec.label(CACHEBUSTER_LABEL, cachebuster);
    }

    let kubeconfig = single_file(
        KUBECONFIG_PATH,
        req.kubeconfig.expose().as_bytes(),
        MODE_SECRET,
    )?;
    let values = req
        .values
        .as_deref()
        .map(|values| single_file(VALUES_PATH, values, MODE_FILE))
        .transpose()?;

    let argv = upgrade_command(
        &ctx.config.deploy,
        &req.chart,
        &req.image_repository,
        values.is_some(),
    );
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();

    let session = Session::start(ctx, &spec).await?;
    let result = async {
        session.upload(kubeconfig).await?;
        if let Some(values) = values {
            session.upload(values).await?;
        }
        session.exec(&argv).await
    }
    .await;
    session.destroy().await;

    let output = result?;
    info!(
        release = %ctx.config.deploy.release,
        namespace = %ctx.config.deploy.namespace,
        "Installed chart {}",
        req.chart
    );
    Ok(output.stdout)
}
