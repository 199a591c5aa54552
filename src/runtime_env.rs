use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::{SecureRandom, SystemRandom};

use crate::config::DependentServiceSettings;
use crate::error::{BootstrapError, Result};
use crate::fs_util;
use crate::vault::OidcClientCredentials;

const SECRET_KEY_BYTES: usize = 16;

/// `KEY=value` settings handed to an OIDC application, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    entries: Vec<(String, String)>,
}

impl RuntimeEnv {
    pub fn new(
        credentials: &OidcClientCredentials,
        conf_url: String,
        secret_key: String,
        admin_users: &[String],
        dependent: &DependentServiceSettings,
    ) -> Self {
        let prefix = env_prefix(&dependent.name);
        let entries = vec![
            ("CLIENT_ID".to_string(), credentials.client_id.clone()),
            ("CLIENT_SECRET".to_string(), credentials.client_secret.clone()),
            ("CONF_URL".to_string(), conf_url),
            ("SECRET_KEY".to_string(), secret_key),
            ("ADMIN_USERS".to_string(), admin_users_value(admin_users)),
            (format!("{prefix}_HOST"), dependent.host.clone()),
            (format!("{prefix}_PASSWORD"), dependent.password.clone()),
        ];
        Self { entries }
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub async fn write(&self, path: &Path) -> Result<()> {
        fs_util::write_private_atomic(path, self.render().as_bytes()).await
    }
}

/// Discovery document URL of `provider` as seen by consuming applications.
pub fn conf_url(public_url: &str, provider: &str) -> String {
    format!(
        "{}/v1/identity/oidc/provider/{provider}/.well-known/openid-configuration",
        public_url.trim_end_matches('/')
    )
}

/// Fresh URL-safe secret for the application's session signing.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_secret_key() -> Result<String> {
    let mut buffer = [0u8; SECRET_KEY_BYTES];
    SystemRandom::new()
        .fill(&mut buffer)
        .map_err(|_| BootstrapError::precondition("Failed to generate secret key"))?;
    Ok(URL_SAFE_NO_PAD.encode(buffer))
}

fn env_prefix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

// Quoted so shells and dotenv parsers keep the JSON list intact.
fn admin_users_value(admin_users: &[String]) -> String {
    let list = serde_json::to_string(admin_users).unwrap_or_else(|_| "[]".to_string());
    format!("'{list}'")
}
