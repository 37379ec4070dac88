use std::fmt::{Debug, Display};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid secret source '{0}'; must be in form env:NAME or file:PATH")]
    InvalidSource(String),

    #[error("secret environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error("could not read secret file '{path}'; {reason}")]
    UnreadableFile { path: String, reason: String },

    #[error("registry secret must be in form <username>:<token>")]
    MalformedRegistrySecret,

    #[error("no credential for private modules; pass a token or an ssh agent socket")]
    NoCredentialMode,
}

/// A secret value that refuses to print itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value. Call sites should hand it straight to the tool that needs it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Resolves a secret from `env:NAME` or `file:PATH`.
    pub fn from_source(source: &str) -> Result<Self, CredentialError> {
        let (kind, location) = source
            .split_once(':')
            .ok_or_else(|| CredentialError::InvalidSource(source.to_string()))?;

        match kind {
            "env" => std::env::var(location)
                .map(Secret)
                .map_err(|_| CredentialError::MissingEnv(location.to_string())),
            "file" => std::fs::read_to_string(location)
                .map(|content| Secret(content.trim_end_matches(['\r', '\n']).to_string()))
                .map_err(|e| CredentialError::UnreadableFile {
                    path: location.to_string(),
                    reason: e.to_string(),
                }),
            _ => Err(CredentialError::InvalidSource(source.to_string())),
        }
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([redacted])")
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[redacted]")
    }
}

/// How builder containers authenticate against private Go module repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMode {
    /// An access token used for HTTPS fetches.
    Token(Secret),
    /// Path of a live ssh agent socket on the host, used for SSH fetches.
    AgentSocket(PathBuf),
}

impl CredentialMode {
    /// Picks exactly one mode. A token takes precedence over an agent socket.
    pub fn select(
        token: Option<Secret>,
        agent_socket: Option<PathBuf>,
    ) -> Result<Self, CredentialError> {
        match (token, agent_socket) {
            (Some(token), _) => Ok(Self::Token(token)),
            (None, Some(socket)) => Ok(Self::AgentSocket(socket)),
            (None, None) => Err(CredentialError::NoCredentialMode),
        }
    }
}

/// Username and token for an OCI registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub password: Secret,
}

impl RegistryCredential {
    /// Splits `<username>:<token>` on the first colon; the token may itself contain colons.
    pub fn parse(secret: &Secret) -> Result<Self, CredentialError> {
        let (username, password) = secret
            .expose()
            .trim()
            .split_once(':')
            .ok_or(CredentialError::MalformedRegistrySecret)?;

        if username.is_empty() || password.is_empty() {
            return Err(CredentialError::MalformedRegistrySecret);
        }

        Ok(Self {
            username: username.to_string(),
            password: Secret::new(password),
        })
    }
}
