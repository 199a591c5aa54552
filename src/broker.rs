use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::{BrokerSettings, DependentServiceSettings, DirectorySettings, OidcApplication};
use crate::error::{BootstrapError, Provisioned, Result};
use crate::runtime_env::{self, RuntimeEnv};
use crate::secrets::SecretMaterial;
use crate::vault::{
    LdapAuthConfig, OidcClientConfig, OidcProviderConfig, OidcScopeConfig, VaultClient,
};

mod template;

pub use template::render_claim_template;

const LDAP_AUTH_TYPE: &str = "ldap";
const LDAP_AUTH_DESCRIPTION: &str = "auth method";
const LDAP_USER_ATTR: &str = "uid";
const LDAP_GROUP_ATTR: &str = "cn";
const GROUP_TYPE_EXTERNAL: &str = "external";
const LISTING_VISIBILITY_UNAUTH: &str = "unauth";

mod oidc_constants {
    pub(crate) const TOKEN_TTL: &str = "24h";
    pub(crate) const CLIENT_TYPE: &str = "confidential";
    pub(crate) const SIGNING_KEY: &str = "default";
    pub(crate) const ASSIGNMENT_ALLOW_ALL: &str = "allow_all";
}

/// Lifecycle position of the broker as driven by this bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BrokerState {
    Uninitialized,
    Sealed,
    Unsealed,
    /// Unsealed with the LDAP auth mount in place.
    Configured,
}

/// An enabled auth mount and the accessor the broker assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMount {
    pub path: String,
    pub accessor: String,
}

/// Drives the broker through init, unseal and identity configuration.
///
/// Owns the broker session and the [`SecretMaterial`]; callers borrow both.
pub struct BrokerProvisioner {
    client: VaultClient,
    state: BrokerState,
    material: Option<SecretMaterial>,
    auth_mount: Option<AuthMount>,
    public_url: String,
}

impl BrokerProvisioner {
    /// Opens a session against the configured broker.
    ///
    /// # Errors
    /// Returns an error if the broker is unreachable or its state cannot be
    /// read.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        let client = VaultClient::new(&settings.url(), settings.request_timeout()?)?;
        Self::open(client, settings.public_url()).await
    }

    /// Probes health and lifecycle state through an existing client.
    ///
    /// # Errors
    /// Returns an error if the broker is unreachable or unhealthy.
    pub async fn open(client: VaultClient, public_url: String) -> Result<Self> {
        client.health_check().await?;
        let mut broker = Self {
            client,
            state: BrokerState::Uninitialized,
            material: None,
            auth_mount: None,
            public_url,
        };
        broker.probe_state().await?;
        Ok(broker)
    }

    /// Re-reads whether the broker is initialized and sealed. A configured
    /// broker that is still unsealed keeps its `Configured` state.
    ///
    /// # Errors
    /// Returns an error if either status endpoint fails.
    pub async fn probe_state(&mut self) -> Result<BrokerState> {
        let observed = if !self.client.is_initialized().await? {
            BrokerState::Uninitialized
        } else if self.client.seal_status().await?.sealed {
            BrokerState::Sealed
        } else {
            BrokerState::Unsealed
        };
        if !(observed == BrokerState::Unsealed && self.state == BrokerState::Configured) {
            self.state = observed;
        }
        if self.state < BrokerState::Configured {
            self.auth_mount = None;
        }
        info!("Vault state: {:?}", self.state);
        Ok(self.state)
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn material(&self) -> Option<&SecretMaterial> {
        self.material.as_ref()
    }

    pub fn auth_mount(&self) -> Option<&AuthMount> {
        self.auth_mount.as_ref()
    }

    /// Initializes the broker and keeps the resulting material.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] unless the broker is
    /// uninitialized, or the broker's own rejection.
    pub async fn initialize(&mut self, shares: u8, threshold: u8) -> Result<&SecretMaterial> {
        if self.state != BrokerState::Uninitialized {
            return Err(BootstrapError::precondition(
                "Vault is already initialized; refusing to initialize again",
            ));
        }
        info!("Initializing Vault with {shares} shares, threshold {threshold}");
        let response = self.client.init(shares, threshold).await?;
        let material = SecretMaterial::new(response.root_token.clone(), response.unseal_keys());
        if material.keys.len() < usize::from(threshold) {
            return Err(BootstrapError::precondition(format!(
                "Vault returned {} unseal keys for threshold {threshold}",
                material.keys.len()
            )));
        }
        self.client.set_token(material.root_token.clone());
        self.state = BrokerState::Sealed;
        Ok(self.material.insert(material))
    }

    /// Adopts material persisted by an earlier run.
    pub fn attach_material(&mut self, material: SecretMaterial) {
        self.client.set_token(material.root_token.clone());
        self.material = Some(material);
    }

    /// Submits unseal keys in their persisted order, at most `threshold` of
    /// them, until the broker reports unsealed.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] if there is no
    /// material, fewer keys than `threshold`, or the broker stays sealed.
    pub async fn unseal(&mut self, threshold: u8) -> Result<Provisioned> {
        let material = self.material.as_ref().ok_or_else(|| {
            BootstrapError::precondition("no secret material available to unseal Vault")
        })?;
        match self.state {
            BrokerState::Uninitialized => {
                return Err(BootstrapError::precondition(
                    "Vault must be initialized before it can be unsealed",
                ));
            }
            BrokerState::Unsealed | BrokerState::Configured => {
                info!("Vault is already unsealed");
                return Ok(Provisioned::AlreadyExists);
            }
            BrokerState::Sealed => {}
        }

        let threshold = usize::from(threshold);
        if material.keys.len() < threshold {
            return Err(BootstrapError::precondition(format!(
                "{} unseal keys persisted but threshold is {threshold}",
                material.keys.len()
            )));
        }

        info!("Unsealing Vault");
        let mut sealed = true;
        for (idx, key) in material.keys.iter().take(threshold).enumerate() {
            let status = self.client.unseal(key).await?;
            debug!(
                "Unseal key {}/{threshold} accepted (sealed: {}, progress: {:?} of {:?})",
                idx + 1,
                status.sealed,
                status.progress,
                status.t
            );
            if !status.sealed {
                sealed = false;
                break;
            }
        }
        if sealed {
            return Err(BootstrapError::precondition(format!(
                "Vault is still sealed after {threshold} unseal keys"
            )));
        }
        info!("Vault unsealed");
        self.state = BrokerState::Unsealed;
        Ok(Provisioned::Created)
    }

    /// Enables and configures LDAP auth at `mount`, bound to `directory`,
    /// and records the mount accessor.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] while sealed, or the
    /// broker's rejection.
    pub async fn enable_directory_auth(
        &mut self,
        directory: &DirectorySettings,
        mount: &str,
    ) -> Result<Provisioned> {
        self.require_unsealed("enable LDAP auth")?;

        let outcome = self
            .client
            .enable_auth(mount, LDAP_AUTH_TYPE, LDAP_AUTH_DESCRIPTION)
            .await?;
        match outcome {
            Provisioned::Created => info!("Enabled {mount}/ auth method"),
            Provisioned::AlreadyExists => warn!("Auth method {mount}/ already enabled"),
        }

        let config = LdapAuthConfig {
            url: directory.url(),
            userdn: directory.users_dn(),
            groupdn: directory.groups_dn(),
            binddn: directory.bind_dn(),
            bindpass: directory.bind_password.clone(),
            userattr: LDAP_USER_ATTR.to_string(),
            groupattr: LDAP_GROUP_ATTR.to_string(),
        };
        debug!(
            "LDAP auth config: url={} userdn={} groupdn={} binddn={}",
            config.url, config.userdn, config.groupdn, config.binddn
        );
        self.client.write_ldap_config(mount, &config).await?;

        let accessor = self.client.auth_accessor(mount).await?;
        debug!("{mount}/ accessor: {accessor}");
        self.auth_mount = Some(AuthMount {
            path: mount.to_string(),
            accessor,
        });
        self.state = BrokerState::Configured;
        Ok(outcome)
    }

    /// Makes the LDAP mount the login method offered by the web UI.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] before the mount exists.
    pub async fn tune_login_ui(&self) -> Result<()> {
        let mount = self.require_mount("tune the login UI")?;
        info!("Making {}/ the default UI login method", mount.path);
        self.client
            .tune_auth_listing(&mount.path, LISTING_VISIBILITY_UNAUTH)
            .await
    }

    /// Creates external group `name` and aliases it to the LDAP mount.
    /// Returns the group id.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] if the LDAP mount has
    /// not been enabled; no request is sent in that case.
    pub async fn create_group(&self, name: &str) -> Result<String> {
        let mount = self.require_mount(&format!("create group {name}"))?;

        let (group_id, outcome) = self.client.write_group(name, GROUP_TYPE_EXTERNAL).await?;
        match outcome {
            Provisioned::Created => info!("Group {name}: created ({group_id})"),
            Provisioned::AlreadyExists => warn!("Group {name}: already exists ({group_id})"),
        }

        let alias = self
            .client
            .create_group_alias(name, &mount.accessor, &group_id)
            .await?;
        match alias {
            Provisioned::Created => info!("Group alias {name}: created"),
            Provisioned::AlreadyExists => warn!("Group alias {name}: already exists"),
        }
        Ok(group_id)
    }

    /// Creates or updates the OIDC client, its scopes and its provider, in
    /// that order. Returns the client id.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] before the LDAP mount
    /// exists, or the broker's rejection of any step.
    pub async fn provision_oidc_application(&self, app: &OidcApplication) -> Result<String> {
        let mount = self.require_mount(&format!("provision OIDC application {}", app.appname))?;

        let client_config = OidcClientConfig {
            redirect_uris: vec![app.redirect_uri.clone()],
            assignments: vec![oidc_constants::ASSIGNMENT_ALLOW_ALL.to_string()],
            key: oidc_constants::SIGNING_KEY.to_string(),
            client_type: oidc_constants::CLIENT_TYPE.to_string(),
            id_token_ttl: oidc_constants::TOKEN_TTL.to_string(),
            access_token_ttl: oidc_constants::TOKEN_TTL.to_string(),
        };
        info!("Creating OIDC application {}", app.appname);
        debug!("{client_config:?}");
        self.client
            .write_oidc_client(&app.appname, &client_config)
            .await?;

        let mut scope_names = Vec::with_capacity(app.scopes.len());
        for scope in &app.scopes {
            let template = render_claim_template(&scope.template, &mount.accessor)
                .map_err(|err| BootstrapError::Config(format!("scope {}: {err}", scope.name)))?;
            let scope_config = OidcScopeConfig {
                description: String::new(),
                template,
            };
            info!("Creating OIDC scope {} for {}", scope.name, app.appname);
            debug!("{scope_config:?}");
            self.client
                .write_oidc_scope(&scope.name, &scope_config)
                .await?;
            scope_names.push(scope.name.clone());
        }

        let client_id = self.client.read_oidc_client(&app.appname).await?.client_id;
        let provider_config = OidcProviderConfig {
            issuer: self.public_url.clone(),
            allowed_client_ids: vec![client_id.clone()],
            scopes_supported: scope_names,
        };
        info!("Creating OIDC provider {}", app.provider_name);
        debug!("{provider_config:?}");
        self.client
            .write_oidc_provider(&app.provider_name, &provider_config)
            .await?;
        Ok(client_id)
    }

    /// Writes the runtime config of `app` to its `output_path`.
    ///
    /// # Errors
    /// Returns an error if the client cannot be read back or the file cannot
    /// be written.
    pub async fn export_runtime_config(
        &self,
        app: &OidcApplication,
        dependent: &DependentServiceSettings,
        admin_users: &[String],
    ) -> Result<PathBuf> {
        self.require_unsealed(&format!("export config for {}", app.appname))?;
        info!("Generating config for application {}", app.appname);

        let credentials = self.client.read_oidc_client(&app.appname).await?;
        if credentials.client_secret.is_empty() {
            return Err(BootstrapError::precondition(format!(
                "OIDC application {} has no client secret",
                app.appname
            )));
        }
        let env = RuntimeEnv::new(
            &credentials,
            runtime_env::conf_url(&self.public_url, &app.provider_name),
            runtime_env::generate_secret_key()?,
            admin_users,
            dependent,
        );
        env.write(&app.output_path).await?;
        info!("Wrote {}", app.output_path.display());
        Ok(app.output_path.clone())
    }

    /// Ends the session. The root token stays valid for later runs.
    pub fn logout(mut self) {
        info!("Logging out of Vault");
        self.client.clear_token();
        self.material = None;
    }

    fn require_unsealed(&self, action: &str) -> Result<()> {
        if self.state < BrokerState::Unsealed || !self.client.has_token() {
            return Err(BootstrapError::precondition(format!(
                "Vault must be unsealed and authenticated to {action}"
            )));
        }
        Ok(())
    }

    fn require_mount(&self, action: &str) -> Result<&AuthMount> {
        self.require_unsealed(action)?;
        self.auth_mount.as_ref().ok_or_else(|| {
            BootstrapError::precondition(format!(
                "LDAP auth must be enabled before attempting to {action}"
            ))
        })
    }
}
