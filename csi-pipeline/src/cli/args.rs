use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "csi-pipeline")]
#[clap(about = "Builds, publishes and deploys the CSI metrics server.")]
#[clap(
    long_about = "Builds, publishes and deploys the CSI metrics server.\n\n Every tool runs inside a
    container on the local Docker engine: the Go toolchain compiles the server, the runtime image is
    assembled on top of a pinned base, and helm packages, pushes and installs the chart. Artifacts
    are versioned from a digest of the source tree unless an explicit version is given."
)]
#[clap(version, long_version = concat!(env!("BUILD_SEMVER"), " (", env!("BUILD_COMMIT"), ")"))]
pub struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH", global = true)]
    pub config_path: Option<PathBuf>,

    /// Root of the source tree to build from.
    #[clap(long, short, value_name = "PATH", default_value = ".", global = true)]
    pub source: PathBuf,

    /// Also write the run report as JSON to this path.
    #[clap(long, value_name = "PATH", global = true)]
    pub report: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// How builder containers reach private Go modules. Exactly one is used; the token wins when both
/// are given.
#[derive(Debug, Clone, clap::Args)]
pub struct BuilderArgs {
    /// Access token for private modules, given as env:NAME or file:PATH.
    #[clap(long, value_name = "SECRET")]
    pub gh_token: Option<String>,

    /// SSH agent socket for private modules; defaults to $SSH_AUTH_SOCK.
    #[clap(long, value_name = "PATH")]
    pub ssh_sock: Option<PathBuf>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct VersionArgs {
    /// Version to publish under; derived from the source digest when omitted.
    #[clap(long = "version", value_name = "VERSION")]
    pub explicit: Option<String>,
}

impl VersionArgs {
    pub fn explicit(&self) -> Option<&str> {
        self.explicit.as_deref()
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct TargetArgs {
    /// Image repository; defaults to the configured one.
    #[clap(long, value_name = "REPOSITORY")]
    pub repository: Option<String>,

    /// Chart repository; defaults to the configured one.
    #[clap(long, value_name = "REPOSITORY")]
    pub helm_repository: Option<String>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RegistryArgs {
    /// Registry credential in form <username>:<token>, given as env:NAME or file:PATH.
    #[clap(long, value_name = "SECRET")]
    pub registry_secret: Option<String>,

    /// Host to log into before pushing the chart; derived from the chart repository when omitted.
    #[clap(long, value_name = "HOST")]
    pub registry_host: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compile the metrics server and write the binary to a local path.
    Binary {
        #[clap(flatten)]
        builder: BuilderArgs,

        /// Where to write the binary.
        #[clap(long, short, value_name = "PATH", default_value = "metricsserver")]
        output: PathBuf,
    },

    /// Build the runtime image and keep it in the local engine.
    Image {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,
    },

    /// Build the runtime image and push it.
    PublishImage {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        /// Image repository; defaults to the configured one.
        #[clap(long, value_name = "REPOSITORY")]
        repository: Option<String>,

        /// Registry credential in form <username>:<token>, given as env:NAME or file:PATH.
        #[clap(long, value_name = "SECRET")]
        registry_secret: Option<String>,
    },

    /// Package the helm chart and write it to a local directory.
    Chart {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        /// Directory to write the chart archive to.
        #[clap(long, short, value_name = "DIR", default_value = ".")]
        output: PathBuf,
    },

    /// Package the helm chart and push it.
    PublishChart {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        /// Chart repository; defaults to the configured one.
        #[clap(long, value_name = "REPOSITORY")]
        helm_repository: Option<String>,

        #[clap(flatten)]
        registry: RegistryArgs,
    },

    /// Publish the image and the chart under one version.
    PublishAll {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        #[clap(flatten)]
        targets: TargetArgs,

        #[clap(flatten)]
        registry: RegistryArgs,
    },

    /// Publish the image and the chart, then install the chart into a cluster.
    Deploy {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        #[clap(flatten)]
        targets: TargetArgs,

        #[clap(flatten)]
        registry: RegistryArgs,

        /// Kubeconfig of the target cluster, given as env:NAME or file:PATH.
        #[clap(long, value_name = "SECRET")]
        kubeconfig: String,

        /// Values file layered over the chart defaults.
        #[clap(long, value_name = "PATH")]
        values: Option<PathBuf>,

        /// Arbitrary token that forces a fresh install container; it does not affect the release.
        #[clap(long)]
        cachebuster: Option<String>,
    },

    /// Publish the image and the chart to the alternate registries.
    PublishAlternate {
        #[clap(flatten)]
        builder: BuilderArgs,

        #[clap(flatten)]
        version: VersionArgs,

        /// Registry credential in form <username>:<token>, given as env:NAME or file:PATH.
        #[clap(long, value_name = "SECRET")]
        registry_secret: String,

        /// Host to log into before pushing the chart; derived from the chart repository when omitted.
        #[clap(long, value_name = "HOST")]
        registry_host: Option<String>,
    },

    /// Package the source tree into a local image for poking around. Nothing is built.
    Explore,

    /// Print the version artifacts would be published under.
    Version {
        #[clap(flatten)]
        version: VersionArgs,
    },

    /// Remove containers left behind by interrupted runs.
    Prune,
}

impl Commands {
    /// What the spinner says while the command runs.
    pub fn activity(&self) -> &'static str {
        match self {
            Commands::Binary { .. } => "Building metrics server binary",
            Commands::Image { .. } => "Building metrics server image",
            Commands::PublishImage { .. } => "Publishing metrics server image",
            Commands::Chart { .. } => "Packaging chart",
            Commands::PublishChart { .. } => "Publishing chart",
            Commands::PublishAll { .. } => "Publishing image and chart",
            Commands::Deploy { .. } => "Deploying metrics server",
            Commands::PublishAlternate { .. } => "Publishing to alternate registries",
            Commands::Explore => "Building explore image",
            Commands::Version { .. } => "Resolving version",
            Commands::Prune => "Removing leftover containers",
        }
    }
}
