use crate::archive::{single_file, MODE_EXECUTABLE};
use crate::builder::{EnvironmentSpec, Session};
use crate::credentials::RegistryCredential;
use crate::pipeline::{Context, PipelineError};
use crate::reference::ImageReference;
use tracing::{info, instrument};

/// Lays the binary over the runtime base image and commits the result locally as `reference`.
#[instrument(skip(ctx, binary), fields(reference = %reference))]
pub async fn assemble(
    ctx: &Context,
    binary: &[u8],
    reference: &ImageReference,
) -> Result<(), PipelineError> {
    let app = &ctx.config.app;
    let layer = single_file(&app.binary_path, binary, MODE_EXECUTABLE)?;

    let spec = EnvironmentSpec::new("runtime-image", &app.runtime_image).filesystem_only();
    let session = Session::start(ctx, &spec).await?;
    let result = async {
        session.upload(layer).await?;
        session.commit(reference).await
    }
    .await;
    session.destroy().await;

    result?;
    info!("Assembled image {}", reference);
    Ok(())
}

/// Pushes a locally committed image. There is no rollback; a failed push leaves the registry
/// as it was before or partially written, depending on where it failed.
#[instrument(skip(ctx, auth), fields(reference = %reference))]
pub async fn push(
    ctx: &Context,
    reference: &ImageReference,
    auth: Option<&RegistryCredential>,
) -> Result<String, PipelineError> {
    ctx.with_deadline(&format!("push {reference}"), async {
        ctx.engine
            .push(reference, auth)
            .await
            .map_err(PipelineError::from)
    })
    .await?;

    info!("Pushed image {}", reference);
    Ok(reference.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Secret;
    use crate::engine::testing::{Call, RecordingEngine};
    use crate::engine::{EngineError, RUN_LABEL};
    use crate::pipeline::test_context;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn assemble_places_binary_and_commits() {
        let engine = Arc::new(RecordingEngine::new());
        let ctx = test_context(engine.clone());
        let reference = ImageReference::new("metricsserver", "v999.0.0-0123456789ab");

        assemble(&ctx, b"\x7fELF", &reference).await.unwrap();

        let calls = engine.calls();
        match &calls[1] {
            Call::Create {
                image,
                labels,
                keep_alive,
                ..
            } => {
                assert!(image.starts_with("registry.access.redhat.com/ubi9/ubi@sha256:"));
                assert!(!keep_alive);
                // Labels would be committed into the published image.
                assert!(!labels.contains_key(RUN_LABEL));
            }
            other => panic!("expected container creation, got {other:?}"),
        }
        assert_eq!(
            calls[2..],
            [
                Call::Upload {
                    container_id: "container-0".into(),
                    files: vec!["metricsserver".into()],
                },
                Call::Commit {
                    container_id: "container-0".into(),
                    reference: "metricsserver:v999.0.0-0123456789ab".into(),
                },
                Call::Remove("container-0".into()),
            ]
        );
        assert!(engine.execs().is_empty());
    }

    #[tokio::test]
    async fn push_passes_credentials_and_returns_reference() {
        let engine = Arc::new(RecordingEngine::new());
        let ctx = test_context(engine.clone());
        let reference = ImageReference::new("quay.io/weka.io/csi-metricsserver", "v2.7.1");
        let auth = RegistryCredential::parse(&Secret::new("robot:token")).unwrap();

        let pushed = push(&ctx, &reference, Some(&auth)).await.unwrap();

        assert_eq!(pushed, "quay.io/weka.io/csi-metricsserver:v2.7.1");
        assert_eq!(
            engine.calls(),
            vec![Call::Push {
                reference: pushed,
                username: Some("robot".into()),
            }]
        );
    }

    #[tokio::test]
    async fn rejected_push_is_a_credential_failure() {
        let engine = Arc::new(
            RecordingEngine::new().with_push_error(EngineError::Unauthorized("denied".into())),
        );
        let ctx = test_context(engine.clone());
        let reference = ImageReference::new("quay.io/weka.io/csi-metricsserver", "v2.7.1");

        let result = push(&ctx, &reference, None).await;

        assert!(matches!(result, Err(PipelineError::Credential(_))));
    }
}
