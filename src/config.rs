use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use ldap3::dn_escape;
use serde::Deserialize;

use crate::error::{BootstrapError, Result};

mod validation;

/// Keys are snake_case; the camelCase spellings (`ouGroups`,
/// `oidcApplications`, ...) are accepted as aliases. Unknown keys are errors.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub directory: DirectorySettings,
    pub broker: BrokerSettings,
    #[serde(default, alias = "dependentService")]
    pub dependent_service: Option<DependentServiceSettings>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DirectorySettings {
    #[serde(default)]
    pub host: String,
    pub port: u16,
    /// `ldap://host:port`, `host:port` or `host`; fills `host` and `port`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Base DN, e.g. `dc=uninuvola,dc=unipg,dc=it`.
    pub dc: String,
    #[serde(default = "default_ou_groups", alias = "ouGroups")]
    pub ou_groups: String,
    #[serde(default = "default_ou_users", alias = "ouUsers")]
    pub ou_users: String,
    #[serde(alias = "bindUser")]
    pub bind_user: String,
    #[serde(alias = "bindPassword")]
    pub bind_password: String,
    pub groups: Vec<String>,
    #[serde(default = "default_group_id_base", alias = "groupIdBase")]
    pub group_id_base: u32,
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    #[serde(default = "default_user_id_base", alias = "userIdBase")]
    pub user_id_base: u32,
    pub timeout: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DirectoryUser {
    pub uid: String,
    #[serde(alias = "firstName")]
    pub first_name: String,
    #[serde(alias = "lastName")]
    pub last_name: String,
    pub password: String,
    pub group: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BrokerSettings {
    pub protocol: String,
    #[serde(alias = "ip")]
    pub host: String,
    pub port: u16,
    #[serde(default, alias = "publicUrl")]
    pub public_url: Option<String>,
    #[serde(default = "default_secrets_file", alias = "secretsFile")]
    pub secrets_file: PathBuf,
    #[serde(default = "default_secret_shares", alias = "secretShares")]
    pub secret_shares: u8,
    #[serde(default = "default_secret_threshold", alias = "secretThreshold")]
    pub secret_threshold: u8,
    #[serde(default = "default_auth_mount", alias = "authMount")]
    pub auth_mount: String,
    #[serde(default = "default_vault_group", alias = "defaultGroup")]
    pub default_group: String,
    #[serde(default, alias = "ldapDefaultLogin")]
    pub ldap_default_login: bool,
    #[serde(default, alias = "adminUsers")]
    pub admin_users: Vec<String>,
    #[serde(default = "default_request_timeout", alias = "requestTimeout")]
    pub request_timeout: String,
    #[serde(default, alias = "oidcApplications")]
    pub oidc_applications: Vec<OidcApplication>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OidcApplication {
    pub appname: String,
    #[serde(default)]
    pub scopes: Vec<OidcScope>,
    #[serde(alias = "providerName")]
    pub provider_name: String,
    #[serde(alias = "redirectUri")]
    pub redirect_uri: String,
    #[serde(alias = "outputPath")]
    pub output_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OidcScope {
    pub name: String,
    pub template: String,
}

/// Cache/queue service whose connection settings are handed to OIDC
/// applications through their runtime config.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DependentServiceSettings {
    #[serde(default = "default_dependent_service_name")]
    pub name: String,
    pub host: String,
    pub password: String,
}

const DEFAULT_LDAP_PORT: u16 = 389;
const DEFAULT_OU_GROUPS: &str = "groups";
const DEFAULT_OU_USERS: &str = "users";
const DEFAULT_GROUPS: [&str; 2] = ["admin", "users"];
const DEFAULT_GROUP_ID_BASE: u32 = 500;
const DEFAULT_USER_ID_BASE: u32 = 1000;
const DEFAULT_LDAP_TIMEOUT: &str = "10s";
const DEFAULT_VAULT_PROTOCOL: &str = "http";
const DEFAULT_VAULT_PORT: u16 = 8200;
const DEFAULT_SECRETS_FILE: &str = ".secrets";
const DEFAULT_SECRET_SHARES: u8 = 5;
const DEFAULT_SECRET_THRESHOLD: u8 = 3;
const DEFAULT_AUTH_MOUNT: &str = "ldap";
const DEFAULT_VAULT_GROUP: &str = "default";
const DEFAULT_REQUEST_TIMEOUT: &str = "30s";
const DEFAULT_DEPENDENT_SERVICE: &str = "redis";
const LDAP_SCHEME: &str = "ldap://";

// Keys with a camelCase alias take their defaults from serde: a builder
// default under the snake_case key would collide with the alias.
fn default_ou_groups() -> String {
    DEFAULT_OU_GROUPS.to_string()
}

fn default_ou_users() -> String {
    DEFAULT_OU_USERS.to_string()
}

fn default_group_id_base() -> u32 {
    DEFAULT_GROUP_ID_BASE
}

fn default_user_id_base() -> u32 {
    DEFAULT_USER_ID_BASE
}

fn default_secrets_file() -> PathBuf {
    PathBuf::from(DEFAULT_SECRETS_FILE)
}

fn default_secret_shares() -> u8 {
    DEFAULT_SECRET_SHARES
}

fn default_secret_threshold() -> u8 {
    DEFAULT_SECRET_THRESHOLD
}

fn default_auth_mount() -> String {
    DEFAULT_AUTH_MOUNT.to_string()
}

fn default_vault_group() -> String {
    DEFAULT_VAULT_GROUP.to_string()
}

fn default_request_timeout() -> String {
    DEFAULT_REQUEST_TIMEOUT.to_string()
}

fn default_dependent_service_name() -> String {
    DEFAULT_DEPENDENT_SERVICE.to_string()
}

impl Settings {
    /// Loads and validates settings from `path`, with `UNINUVOLA_*`
    /// environment overrides (`__` separates nested keys).
    ///
    /// # Errors
    /// Returns [`BootstrapError::Config`] if the file is missing, malformed,
    /// lacks a required key or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let mut s = Config::builder();

        s = s
            .set_default("directory.port", DEFAULT_LDAP_PORT)?
            .set_default("directory.groups", DEFAULT_GROUPS.to_vec())?
            .set_default("directory.timeout", DEFAULT_LDAP_TIMEOUT)?
            .set_default("broker.protocol", DEFAULT_VAULT_PROTOCOL)?
            .set_default("broker.port", DEFAULT_VAULT_PORT)?;

        // The format follows the extension (.yaml, .yml or .toml).
        s = s.add_source(File::from(path.to_path_buf()).required(true));

        // e.g. UNINUVOLA_DIRECTORY__BIND_PASSWORD
        s = s.add_source(
            Environment::with_prefix("UNINUVOLA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = s.build()?.try_deserialize()?;
        settings.directory.apply_endpoint()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates identifiers, cross-references and numeric contracts.
    ///
    /// # Errors
    /// Returns [`BootstrapError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self).map_err(BootstrapError::Config)
    }

    /// Dependent service settings, required once any OIDC application exists.
    ///
    /// # Errors
    /// Returns [`BootstrapError::Config`] when the section is absent.
    pub fn dependent_service(&self) -> Result<&DependentServiceSettings> {
        self.dependent_service
            .as_ref()
            .ok_or_else(|| BootstrapError::Config("dependent_service is required".to_string()))
    }
}

impl DirectorySettings {
    pub fn url(&self) -> String {
        format!("{LDAP_SCHEME}{}:{}", self.host, self.port)
    }

    /// DN used to bind, `cn=<bind_user>,<dc>`.
    pub fn bind_dn(&self) -> String {
        format!("cn={},{}", dn_escape(self.bind_user.as_str()), self.dc)
    }

    pub fn ou_dn(&self, ou: &str) -> String {
        format!("ou={},{}", dn_escape(ou), self.dc)
    }

    pub fn groups_dn(&self) -> String {
        self.ou_dn(&self.ou_groups)
    }

    pub fn users_dn(&self) -> String {
        self.ou_dn(&self.ou_users)
    }

    /// Resolves `endpoint` into `host` and `port`.
    ///
    /// # Errors
    /// Returns [`BootstrapError::Config`] if both `endpoint` and `host` are
    /// set, or the endpoint is not a plain `ldap://` address.
    pub fn apply_endpoint(&mut self) -> Result<()> {
        let Some(endpoint) = self.endpoint.take() else {
            return Ok(());
        };
        if !self.host.is_empty() {
            return Err(BootstrapError::Config(
                "directory.endpoint and directory.host are mutually exclusive".to_string(),
            ));
        }
        let address = match endpoint.split_once("://") {
            None => endpoint.as_str(),
            Some(_) => endpoint.strip_prefix(LDAP_SCHEME).ok_or_else(|| {
                BootstrapError::Config(format!(
                    "directory.endpoint {endpoint} must use {LDAP_SCHEME}"
                ))
            })?,
        };
        let address = address.trim_end_matches('/');
        match address.rsplit_once(':') {
            Some((host, port)) => {
                self.port = port.parse().map_err(|_| {
                    BootstrapError::Config(format!(
                        "directory.endpoint {endpoint} has an invalid port"
                    ))
                })?;
                self.host = host.to_string();
            }
            None => self.host = address.to_string(),
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`BootstrapError::Config`] if `timeout` is not a duration.
    pub fn timeout(&self) -> Result<Duration> {
        parse_timeout("directory.timeout", &self.timeout)
    }
}

impl BrokerSettings {
    /// Address the bootstrap talks to, `<protocol>://<host>:<port>`.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Address consuming applications reach the broker at.
    pub fn public_url(&self) -> String {
        self.public_url
            .as_deref()
            .map_or_else(|| self.url(), |url| url.trim_end_matches('/').to_string())
    }

    /// # Errors
    /// Returns [`BootstrapError::Config`] if `request_timeout` is not a duration.
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_timeout("broker.request_timeout", &self.request_timeout)
    }
}

fn parse_timeout(key: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|err| BootstrapError::Config(format!("{key} is not a duration: {err}")))?;
    if duration.is_zero() {
        return Err(BootstrapError::Config(format!(
            "{key} must be greater than 0"
        )));
    }
    Ok(duration)
}
