use std::fmt;

use thiserror::Error;

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;

/// Successful outcome of a create-style provisioning call.
///
/// Paired with [`BootstrapError`] through `Result`, this gives every create
/// operation the three-valued `Created | AlreadyExists | Failed` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Provisioned {
    Created,
    AlreadyExists,
}

impl Provisioned {
    pub fn is_created(self) -> bool {
        matches!(self, Provisioned::Created)
    }
}

impl fmt::Display for Provisioned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provisioned::Created => f.write_str("created"),
            Provisioned::AlreadyExists => f.write_str("already exists"),
        }
    }
}

/// External system a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Directory,
    Broker,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Directory => f.write_str("LDAP"),
            Target::Broker => f.write_str("Vault"),
        }
    }
}

/// Every fatal bootstrap failure. None of these are retried in-process;
/// re-running the bootstrap is the recovery path.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{target} authentication failed: {detail}")]
    AuthFailure { target: Target, detail: String },

    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    #[error("{target} transport failure: {detail}")]
    Transport { target: Target, detail: String },

    #[error("{target} rejected request ({code}): {detail}")]
    Rejected {
        target: Target,
        code: u32,
        detail: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BootstrapError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        BootstrapError::PreconditionFailure(message.into())
    }
}

impl From<config::ConfigError> for BootstrapError {
    fn from(err: config::ConfigError) -> Self {
        BootstrapError::Config(err.to_string())
    }
}
