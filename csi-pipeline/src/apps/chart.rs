use crate::builder::{EnvironmentSpec, Session};
use crate::conf;
use crate::credentials::{RegistryCredential, Secret};
use crate::pipeline::{Context, PipelineError};
use crate::reference::derive_registry_host;
use crate::source::SourceTree;
use tracing::{info, instrument};

/// Where packaged charts are written inside the builder.
pub const CHART_OUTPUT_DIR: &str = "/chart-out";
const SOURCE_DIR: &str = "/src";

const PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// Logs into the registry (`$1`) as `$2`, reading the password from the environment.
const LOGIN_SCRIPT: &str =
    r#"printf '%s' "$REGISTRY_PASSWORD" | helm registry login "$1" --username "$2" --password-stdin"#;

/// A chart archive as produced by `helm package`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedChart {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Where a packaged chart goes and how to authenticate there.
#[derive(Debug, Clone)]
pub struct ChartTarget {
    pub repository: String,
    pub credential: Option<RegistryCredential>,
    /// Host for `helm registry login`; derived from the repository when absent.
    pub registry_host: Option<String>,
}

pub fn package_command(chart_path: &str, version: &str) -> Vec<String> {
    vec![
        "helm".into(),
        "package".into(),
        chart_path.into(),
        "--version".into(),
        version.into(),
        "--app-version".into(),
        version.into(),
        "--destination".into(),
        CHART_OUTPUT_DIR.into(),
    ]
}

pub fn push_command(archive: &str, repository: &str) -> Vec<String> {
    vec![
        "helm".into(),
        "push".into(),
        archive.into(),
        format!("oci://{repository}"),
    ]
}

pub fn login_command(host: &str, username: &str) -> Vec<String> {
    vec![
        "sh".into(),
        "-ec".into(),
        LOGIN_SCRIPT.into(),
        "sh".into(),
        host.into(),
        username.into(),
    ]
}

/// The reference under which a pushed chart can be installed.
pub fn chart_reference(repository: &str, chart_name: &str, version: &str) -> String {
    format!("{repository}/{chart_name}:{version}")
}

/// Resolves the login host up front so a bad repository fails before any container starts.
fn login_host(target: &ChartTarget) -> Result<String, PipelineError> {
    if let Some(host) = target.registry_host.as_deref().filter(|host| !host.is_empty()) {
        return Ok(host.to_string());
    }

    derive_registry_host(&target.repository).ok_or_else(|| {
        PipelineError::MalformedInput(format!(
            "cannot derive registry host from chart repository '{}'; pass it explicitly",
            target.repository
        ))
    })
}

/// Packages the chart and returns the archive without pushing it anywhere.
#[instrument(skip(ctx, source, spec))]
pub async fn package(
    ctx: &Context,
    source: &SourceTree,
    spec: &EnvironmentSpec,
    version: &str,
) -> Result<PackagedChart, PipelineError> {
    let archive = source.archive(SOURCE_DIR.trim_start_matches('/'))?;
    let spec = spec.clone().working_dir(SOURCE_DIR);

    let session = Session::start(ctx, &spec).await?;
    let result = package_in(&session, archive, &ctx.config.chart, version).await;
    session.destroy().await;

    let chart = result?;
    info!(file_name = %chart.file_name, "Packaged chart");
    Ok(chart)
}

/// Packages the chart, logs in if a credential was given and pushes it. Returns the chart
/// reference.
#[instrument(skip(ctx, source, spec, target), fields(repository = %target.repository))]
pub async fn publish(
    ctx: &Context,
    source: &SourceTree,
    spec: &EnvironmentSpec,
    target: &ChartTarget,
    version: &str,
) -> Result<String, PipelineError> {
    let host = match target.credential {
        Some(_) => Some(login_host(target)?),
        None => None,
    };

    let archive = source.archive(SOURCE_DIR.trim_start_matches('/'))?;
    let spec = spec.clone().working_dir(SOURCE_DIR);

    let session = Session::start(ctx, &spec).await?;
    let result = async {
        let chart = package_in(&session, archive, &ctx.config.chart, version).await?;

        if let (Some(host), Some(credential)) = (&host, &target.credential) {
            login(&session, host, credential).await?;
        }

        let packaged = format!("{CHART_OUTPUT_DIR}/{}", chart.file_name);
        let argv = push_command(&packaged, &target.repository);
        session.exec(&as_strs(&argv)).await?;

        Ok::<_, PipelineError>(chart_reference(
            &target.repository,
            &ctx.config.chart.name,
            version,
        ))
    }
    .await;
    session.destroy().await;

    let reference = result?;
    info!("Pushed chart {}", reference);
    Ok(reference)
}

async fn package_in(
    session: &Session,
    archive: bytes::Bytes,
    chart: &conf::Chart,
    version: &str,
) -> Result<PackagedChart, PipelineError> {
    session.upload(archive).await?;
    session
        .exec(&as_strs(&package_command(&chart.path, version)))
        .await?;

    let mut archives: Vec<_> = session
        .read_files(CHART_OUTPUT_DIR)
        .await?
        .into_iter()
        .filter(|file| file.path.ends_with(".tgz"))
        .collect();

    if archives.len() != 1 {
        return Err(PipelineError::MalformedInput(format!(
            "expected helm to produce one chart archive but found {}",
            archives.len()
        )));
    }

    let archive = archives.remove(0);
    let file_name = archive
        .path
        .rsplit('/')
        .next()
        .unwrap_or(&archive.path)
        .to_string();

    Ok(PackagedChart {
        file_name,
        data: archive.data,
    })
}

async fn login(
    session: &Session,
    host: &str,
    credential: &RegistryCredential,
) -> Result<(), PipelineError> {
    let argv = login_command(host, &credential.username);
    let secrets: [(&str, &Secret); 1] = [(PASSWORD_ENV, &credential.password)];

    match session.exec_with_secrets(&as_strs(&argv), &secrets).await {
        Ok(_) => Ok(()),
        Err(PipelineError::ToolInvocation { output, .. }) => Err(PipelineError::Credential(
            format!("registry login to '{host}' failed:\n{output}"),
        )),
        Err(e) => Err(e),
    }
}

fn as_strs(argv: &[String]) -> Vec<&str> {
    argv.iter().map(String::as_str).collect()
}
