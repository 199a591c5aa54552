use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};
use crate::fs_util;

/// Root token and unseal key shares produced by the one and only broker
/// initialization. Key order is the order the broker returned them in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMaterial {
    #[serde(alias = "rootToken")]
    pub root_token: String,
    #[serde(alias = "unseal_keys", alias = "unsealKeys")]
    pub keys: Vec<String>,
}

impl SecretMaterial {
    pub fn new(root_token: String, keys: Vec<String>) -> Self {
        Self { root_token, keys }
    }

    fn check(&self) -> std::result::Result<(), &'static str> {
        if self.root_token.trim().is_empty() {
            return Err("root_token is empty");
        }
        if self.keys.is_empty() {
            return Err("keys is empty");
        }
        if self.keys.iter().any(|key| key.trim().is_empty()) {
            return Err("keys contains an empty share");
        }
        Ok(())
    }

    /// Renders the selected secrets for an operator, one value per line.
    pub fn render(&self, selector: SecretSelector) -> String {
        let mut lines = Vec::new();
        if matches!(selector, SecretSelector::Token | SecretSelector::All) {
            lines.push(format!("root_token: {}", self.root_token));
        }
        if matches!(selector, SecretSelector::Keys | SecretSelector::All) {
            for (idx, key) in self.keys.iter().enumerate() {
                lines.push(format!("unseal_key[{}]: {key}", idx + 1));
            }
        }
        lines.join("\n")
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("root_token", &"<redacted>")
            .field("keys", &format_args!("<{} redacted>", self.keys.len()))
            .finish()
    }
}

/// Which part of the persisted material to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecretSelector {
    Keys,
    Token,
    All,
}

/// Durable home of the [`SecretMaterial`]. The file, once written, is the
/// only record of the unseal keys and is never overwritten.
#[derive(Debug, Clone)]
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted material. `Ok(None)` means the broker was never
    /// initialized by this bootstrap.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if it holds an empty token or key list.
    pub async fn load(&self) -> Result<Option<SecretMaterial>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No secrets file at {}", self.path.display());
                return Ok(None);
            }
            Err(err) => {
                return Err(BootstrapError::io(
                    format!("Failed to read {}", self.path.display()),
                    err,
                ));
            }
        };
        let material: SecretMaterial = serde_json::from_str(&contents).map_err(|err| {
            BootstrapError::precondition(format!(
                "secrets file {} is malformed: {err}",
                self.path.display()
            ))
        })?;
        material.check().map_err(|reason| {
            BootstrapError::precondition(format!(
                "secrets file {} is unusable: {reason}",
                self.path.display()
            ))
        })?;
        info!("Loaded secrets from {}", self.path.display());
        Ok(Some(material))
    }

    /// Persists freshly generated material.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] if a secrets file is
    /// already present, or an I/O error if the atomic write fails.
    pub async fn save(&self, material: &SecretMaterial) -> Result<()> {
        material.check().map_err(|reason| {
            BootstrapError::precondition(format!("refusing to save secrets: {reason}"))
        })?;
        let exists = fs::try_exists(&self.path).await.map_err(|err| {
            BootstrapError::io(format!("Failed to inspect {}", self.path.display()), err)
        })?;
        if exists {
            return Err(BootstrapError::precondition(format!(
                "secrets file {} already exists and will not be overwritten",
                self.path.display()
            )));
        }
        let contents = serde_json::to_vec_pretty(material).map_err(|err| {
            BootstrapError::io("Failed to serialize secrets", std::io::Error::other(err))
        })?;
        fs_util::write_private_atomic(&self.path, &contents).await?;
        info!("Saved secrets to {}", self.path.display());
        Ok(())
    }
}
