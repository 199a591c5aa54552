use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult};
use tracing::{debug, info, warn};

use crate::config::DirectorySettings;
use crate::error::{BootstrapError, Provisioned, Result, Target};

const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INAPPROPRIATE_AUTH: u32 = 48;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_INSUFFICIENT_ACCESS: u32 = 50;
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

/// An entry to add: distinguished name plus multi-valued attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with<V: AsRef<str>>(mut self, name: &str, values: &[V]) -> Self {
        self.attributes.push((
            name.to_string(),
            values.iter().map(|value| value.as_ref().to_string()).collect(),
        ));
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }
}

/// Live, authenticated session against the directory.
#[async_trait]
pub trait DirectoryBackend: Send {
    /// Adds `entry`. An existing entry is [`Provisioned::AlreadyExists`].
    async fn add_entry(&mut self, entry: &DirectoryEntry) -> Result<Provisioned>;

    /// Ends the session. Called exactly once, by the owner.
    async fn unbind(&mut self) -> Result<()>;
}

/// LDAP session bound with the configured admin DN.
pub struct LdapSession {
    ldap: Ldap,
    timeout: Duration,
}

impl LdapSession {
    /// Connects to the directory and binds.
    ///
    /// # Errors
    /// Returns [`BootstrapError::Transport`] when the server is unreachable
    /// and [`BootstrapError::AuthFailure`] when the bind is refused.
    pub async fn connect(settings: &DirectorySettings) -> Result<Self> {
        let url = settings.url();
        let timeout = settings.timeout()?;
        info!("Connecting to {url}");

        let conn_settings = LdapConnSettings::new().set_conn_timeout(timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &url)
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                warn!("LDAP connection closed with error: {err}");
            }
        });

        let bind_dn = settings.bind_dn();
        debug!("Binding as {bind_dn}");
        let result = ldap
            .with_timeout(timeout)
            .simple_bind(&bind_dn, &settings.bind_password)
            .await
            .map_err(transport)?;
        classify_bind(&result)?;
        info!("Bound to {url} as {bind_dn}");

        Ok(Self { ldap, timeout })
    }
}

#[async_trait]
impl DirectoryBackend for LdapSession {
    async fn add_entry(&mut self, entry: &DirectoryEntry) -> Result<Provisioned> {
        let attrs: Vec<(&str, HashSet<&str>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| {
                (
                    name.as_str(),
                    values.iter().map(String::as_str).collect::<HashSet<_>>(),
                )
            })
            .collect();
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .add(&entry.dn, attrs)
            .await
            .map_err(transport)?;
        debug!("ADD {} -> rc={} {}", entry.dn, result.rc, result.text);
        classify_add(&entry.dn, &result)
    }

    async fn unbind(&mut self) -> Result<()> {
        info!("Closing LDAP connection");
        self.ldap.unbind().await.map_err(transport)
    }
}

fn transport(err: LdapError) -> BootstrapError {
    match err {
        LdapError::LdapResult { result } => rejected(&result),
        other => BootstrapError::Transport {
            target: Target::Directory,
            detail: other.to_string(),
        },
    }
}

fn describe(result: &LdapResult) -> String {
    if result.text.is_empty() {
        format!("result code {}", result.rc)
    } else {
        result.text.clone()
    }
}

fn rejected(result: &LdapResult) -> BootstrapError {
    BootstrapError::Rejected {
        target: Target::Directory,
        code: result.rc,
        detail: describe(result),
    }
}

pub(crate) fn classify_bind(result: &LdapResult) -> Result<()> {
    match result.rc {
        RC_SUCCESS => Ok(()),
        RC_INAPPROPRIATE_AUTH | RC_INVALID_CREDENTIALS | RC_INSUFFICIENT_ACCESS => {
            Err(BootstrapError::AuthFailure {
                target: Target::Directory,
                detail: describe(result),
            })
        }
        _ => Err(rejected(result)),
    }
}

pub(crate) fn classify_add(dn: &str, result: &LdapResult) -> Result<Provisioned> {
    match result.rc {
        RC_SUCCESS => Ok(Provisioned::Created),
        RC_ENTRY_ALREADY_EXISTS => Ok(Provisioned::AlreadyExists),
        RC_NO_SUCH_OBJECT => Err(BootstrapError::precondition(format!(
            "parent of {dn} does not exist"
        ))),
        RC_INVALID_CREDENTIALS | RC_INSUFFICIENT_ACCESS => Err(BootstrapError::AuthFailure {
            target: Target::Directory,
            detail: format!("not allowed to add {dn}: {}", describe(result)),
        }),
        _ => Err(rejected(result)),
    }
}
