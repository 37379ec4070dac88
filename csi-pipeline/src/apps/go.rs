use crate::builder::{EnvironmentSpec, Session};
use crate::conf;
use crate::pipeline::{Context, PipelineError};
use crate::source::SourceTree;
use tracing::{info, instrument};

/// Where the source tree lands inside the builder.
pub const SOURCE_DIR: &str = "/src";
/// Where the compiled program is written inside the builder.
pub const OUTPUT_BINARY: &str = "/out-binary";

const MANIFEST_FILES: [&str; 2] = ["go.mod", "go.sum"];

/// What to compile and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoBuild {
    /// Package or file handed to `go build`, relative to the source root.
    pub program_path: String,
    /// Download modules from the manifest alone before the rest of the source is copied in, so
    /// the download is reused for as long as the manifest does not change.
    pub cache_deps: bool,
    pub go_generate: bool,
}

impl From<&conf::App> for GoBuild {
    fn from(app: &conf::App) -> Self {
        Self {
            program_path: app.program_path.clone(),
            cache_deps: app.cache_deps,
            go_generate: app.go_generate,
        }
    }
}

/// Compiles the program inside a builder created from `spec` and returns the binary.
///
/// The builder is removed whether the build succeeded or not.
#[instrument(skip(ctx, source, spec), fields(program = %build.program_path, digest = source.digest()))]
pub async fn build(
    ctx: &Context,
    source: &SourceTree,
    spec: &EnvironmentSpec,
    build: &GoBuild,
) -> Result<Vec<u8>, PipelineError> {
    // Fail on a missing manifest before paying for a container.
    let manifest = source.subset_archive(&source_prefix(), &MANIFEST_FILES)?;
    let full = source.archive(&source_prefix())?;

    let spec = spec.clone().working_dir(SOURCE_DIR);
    let session = Session::start(ctx, &spec).await?;
    let result = compile(&session, manifest, full, build).await;
    session.destroy().await;

    let binary = result?;
    info!(bytes = binary.len(), "Compiled {}", build.program_path);
    Ok(binary)
}

async fn compile(
    session: &Session,
    manifest: bytes::Bytes,
    full: bytes::Bytes,
    build: &GoBuild,
) -> Result<Vec<u8>, PipelineError> {
    session.upload(manifest).await?;
    if build.cache_deps {
        session.exec(&["go", "mod", "download"]).await?;
    }

    session.upload(full).await?;
    if build.go_generate {
        session.exec(&["go", "generate", "./..."]).await?;
    }

    session
        .exec(&["go", "build", "-o", OUTPUT_BINARY, &build.program_path])
        .await?;

    session.read_file(OUTPUT_BINARY).await
}

fn source_prefix() -> String {
    SOURCE_DIR.trim_start_matches('/').to_string()
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::archive::{single_file, MODE_EXECUTABLE};
    use crate::builder::go_builder;
    use crate::credentials::{CredentialMode, Secret};
    use crate::engine::testing::{Call, RecordingEngine};
    use crate::pipeline::test_context;
    use crate::source::ExclusionFilter;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A small Go module on disk, the way the pipeline expects to find it.
    pub fn module_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module github.com/weka/csi\n").unwrap();
        std::fs::write(dir.path().join("go.sum"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("cmd/metricsserver")).unwrap();
        std::fs::write(
            dir.path().join("cmd/metricsserver/main.go"),
            "package main\nfunc main() {}\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("charts/csi-metricsserver")).unwrap();
        std::fs::write(
            dir.path().join("charts/csi-metricsserver/Chart.yaml"),
            "name: csi-metricsserver\n",
        )
        .unwrap();
        dir
    }

    pub fn snapshot(dir: &TempDir) -> SourceTree {
        SourceTree::snapshot(dir.path(), &ExclusionFilter::new(&[]).unwrap()).unwrap()
    }

    /// An engine that hands back a compiled binary from every builder.
    pub fn engine_with_binary() -> RecordingEngine {
        RecordingEngine::new().with_download(
            OUTPUT_BINARY,
            single_file(OUTPUT_BINARY, b"\x7fELF", MODE_EXECUTABLE).unwrap(),
        )
    }

    fn token() -> CredentialMode {
        CredentialMode::Token(Secret::new("ghp_token"))
    }

    fn default_build() -> GoBuild {
        GoBuild {
            program_path: "cmd/metricsserver/main.go".into(),
            cache_deps: true,
            go_generate: false,
        }
    }

    #[tokio::test]
    async fn builds_in_documented_order() {
        let dir = module_dir();
        let engine = Arc::new(engine_with_binary());
        let ctx = test_context(engine.clone());
        let spec = go_builder(&ctx.config.builder, &token());

        let binary = build(&ctx, &snapshot(&dir), &spec, &default_build())
            .await
            .unwrap();

        assert_eq!(binary, b"\x7fELF".to_vec());

        let work: Vec<Vec<String>> = engine.execs().into_iter().skip(spec.setup.len()).collect();
        assert_eq!(
            work,
            vec![
                vec!["go", "mod", "download"],
                vec!["go", "build", "-o", "/out-binary", "cmd/metricsserver/main.go"],
            ]
        );

        let uploads: Vec<Vec<String>> = engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { files, .. } => Some(files),
                _ => None,
            })
            .collect();
        assert_eq!(uploads[0], vec!["src/go.mod", "src/go.sum"]);
        assert!(uploads[1].contains(&"src/cmd/metricsserver/main.go".to_string()));
        assert_eq!(engine.removed().len(), 1);
    }

    #[tokio::test]
    async fn generate_runs_after_full_source_copy() {
        let dir = module_dir();
        let engine = Arc::new(engine_with_binary());
        let ctx = test_context(engine.clone());
        let spec = go_builder(&ctx.config.builder, &token());
        let build_config = GoBuild {
            cache_deps: false,
            go_generate: true,
            ..default_build()
        };

        build(&ctx, &snapshot(&dir), &spec, &build_config)
            .await
            .unwrap();

        let calls = engine.calls();
        let generate = calls
            .iter()
            .position(|call| matches!(call, Call::Exec { argv, .. } if argv[1] == "generate"))
            .unwrap();
        let last_upload = calls
            .iter()
            .rposition(|call| matches!(call, Call::Upload { .. }))
            .unwrap();
        assert!(last_upload < generate);
        assert!(!engine.execs().iter().any(|argv| argv.join(" ") == "go mod download"));
    }

    #[tokio::test]
    async fn missing_manifest_fails_before_any_container() {
        let dir = module_dir();
        std::fs::remove_file(dir.path().join("go.sum")).unwrap();
        let engine = Arc::new(engine_with_binary());
        let ctx = test_context(engine.clone());
        let spec = go_builder(&ctx.config.builder, &token());

        let result = build(&ctx, &snapshot(&dir), &spec, &default_build()).await;

        assert!(matches!(result, Err(PipelineError::MalformedInput(_))));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn compile_failure_surfaces_output_and_removes_builder() {
        let dir = module_dir();
        let engine = Arc::new(
            engine_with_binary().with_exec_failure("go build", "main.go:2:1: undefined: run"),
        );
        let ctx = test_context(engine.clone());
        let spec = go_builder(&ctx.config.builder, &token());

        let result = build(&ctx, &snapshot(&dir), &spec, &default_build()).await;

        match result {
            Err(PipelineError::ToolInvocation {
                environment,
                output,
                ..
            }) => {
                assert_eq!(environment, "go-builder");
                assert!(output.contains("undefined: run"));
            }
            other => panic!("expected tool invocation failure, got {other:?}"),
        }
        assert_eq!(engine.removed().len(), 1);
    }
}
