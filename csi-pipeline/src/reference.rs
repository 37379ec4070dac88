use std::fmt::Display;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference '{0}' has no tag; expected <repository>:<tag>")]
    MissingTag(String),

    #[error("reference '{0}' has an empty repository")]
    EmptyRepository(String),
}

/// `<repository>:<tag>` as used for images and OCI charts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Splits on the last colon. A colon followed by a path separator belongs to a registry port
    /// (`registry:5002/helm`), so such a reference is treated as untagged.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let (repository, tag) = reference
            .rsplit_once(':')
            .filter(|(_, tag)| !tag.is_empty() && !tag.contains('/'))
            .ok_or_else(|| ReferenceError::MissingTag(reference.to_string()))?;

        if repository.is_empty() {
            return Err(ReferenceError::EmptyRepository(reference.to_string()));
        }

        Ok(Self::new(repository, tag))
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Registry host for `helm registry login` when none was given explicitly.
///
/// Cuts the last two path segments (chart type, then namespace) off the repository, which fits
/// `<registry>/<namespace>/<chart-type>` layouts and nothing else.
pub fn derive_registry_host(repository: &str) -> Option<String> {
    let (without_type, _) = repository.rsplit_once('/')?;
    let (host, _) = without_type.rsplit_once('/')?;

    if host.is_empty() {
        return None;
    }

    Some(host.to_string())
}
