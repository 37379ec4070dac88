use crate::source::SourceTree;

/// Major/minor/patch used for builds that were not given an explicit version. It sorts above
/// every real release so development charts never look older than what they replace.
const DEVELOPMENT_PREFIX: &str = "v999.0.0";
const DIGEST_CHARS: usize = 12;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("version '{version}' is not a valid semantic version; {reason}")]
    InvalidVersion { version: String, reason: String },
}

/// Returns the explicit version if one was given, otherwise a version derived from the source digest.
///
/// The same snapshot always yields the same derived version, which is what lets the image and
/// the chart published from one source tree line up without passing anything between them.
pub fn resolve(source: &SourceTree, explicit: Option<&str>) -> String {
    resolve_from_digest(source.digest(), explicit)
}

pub fn resolve_from_digest(digest: &str, explicit: Option<&str>) -> String {
    if let Some(version) = explicit.filter(|version| !version.is_empty()) {
        return version.to_string();
    }

    let hex = digest.rsplit(':').next().unwrap_or(digest);
    let short: String = hex.chars().take(DIGEST_CHARS).collect();
    format!("{DEVELOPMENT_PREFIX}-{short}")
}

/// Helm refuses chart versions that are not semver; catch that before any container starts.
pub fn validate_chart_version(version: &str) -> Result<(), VersionError> {
    let candidate = version.strip_prefix('v').unwrap_or(version);
    semver::Version::parse(candidate).map_err(|e| VersionError::InvalidVersion {
        version: version.to_string(),
        reason: e.to_string(),
    })?;

    Ok(())
}
