use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing::{error, info};

use crate::broker::{BrokerProvisioner, BrokerState};
use crate::config::{DirectorySettings, Settings};
use crate::directory::{DirectoryProvisioner, assign_ids};
use crate::error::{BootstrapError, Provisioned, Result};
use crate::ldap::DirectoryBackend;
use crate::secrets::{SecretSelector, SecretStore};

/// A deployable service, selectable by name from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Service {
    Ldap,
    Vault,
}

impl Service {
    /// Every service, in dependency order.
    pub const ALL: [Service; 2] = [Service::Ldap, Service::Vault];

    pub fn name(self) -> &'static str {
        match self {
            Service::Ldap => "ldap",
            Service::Vault => "vault",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Services to run, deduplicated and in dependency order (`ldap` before
/// `vault`). An empty selection means every service.
pub fn plan(selected: &[Service]) -> Vec<Service> {
    if selected.is_empty() {
        return Service::ALL.to_vec();
    }
    let mut services = selected.to_vec();
    services.sort_unstable();
    services.dedup();
    services
}

#[derive(Debug, Default)]
pub struct DirectoryReport {
    pub organizational_units: Vec<(String, Provisioned)>,
    pub groups: Vec<(String, u32, Provisioned)>,
    pub users: Vec<(String, Provisioned)>,
}

impl DirectoryReport {
    pub fn created(&self) -> usize {
        self.outcomes().filter(|outcome| outcome.is_created()).count()
    }

    pub fn already_existing(&self) -> usize {
        self.outcomes().filter(|outcome| !outcome.is_created()).count()
    }

    fn outcomes(&self) -> impl Iterator<Item = Provisioned> + '_ {
        self.organizational_units
            .iter()
            .map(|(_, outcome)| *outcome)
            .chain(self.groups.iter().map(|(_, _, outcome)| *outcome))
            .chain(self.users.iter().map(|(_, outcome)| *outcome))
    }
}

#[derive(Debug)]
pub struct BrokerReport {
    pub initialized: bool,
    pub unseal: Provisioned,
    pub auth_mount: Provisioned,
    pub group_id: String,
    pub applications: Vec<ApplicationReport>,
}

#[derive(Debug)]
pub struct ApplicationReport {
    pub appname: String,
    pub client_id: String,
    pub output_path: PathBuf,
}

/// Outcome of a run; a service that was not selected stays `None`.
#[derive(Debug, Default)]
pub struct RunReport {
    pub directory: Option<DirectoryReport>,
    pub broker: Option<BrokerReport>,
}

/// Runs the selected services against the configured targets.
///
/// # Errors
/// Returns the first fatal failure; later services are not attempted.
pub async fn run(settings: &Settings, services: &[Service]) -> Result<RunReport> {
    run_with(
        settings,
        services,
        move || DirectoryProvisioner::connect(&settings.directory),
        move || BrokerProvisioner::connect(&settings.broker),
    )
    .await
}

/// [`run`] with the sessions supplied by the caller. Each connector is
/// called at most once, and only when its service is selected.
///
/// # Errors
/// Returns the first fatal failure; later services are not attempted.
pub async fn run_with<B, D, DF, V, VF>(
    settings: &Settings,
    services: &[Service],
    connect_directory: D,
    connect_broker: V,
) -> Result<RunReport>
where
    B: DirectoryBackend,
    D: FnOnce() -> DF,
    DF: Future<Output = Result<DirectoryProvisioner<B>>>,
    V: FnOnce() -> VF,
    VF: Future<Output = Result<BrokerProvisioner>>,
{
    let services = plan(services);
    let mut report = RunReport::default();

    if services.contains(&Service::Ldap) {
        info!("Deploying {}", Service::Ldap);
        let mut directory = connect_directory().await?;
        let result = deploy_directory(&mut directory, &settings.directory).await;
        let closed = directory.close().await;
        let directory = result?;
        closed?;
        info!(
            "LDAP done: {} created, {} already present",
            directory.created(),
            directory.already_existing()
        );
        report.directory = Some(directory);
    }

    if services.contains(&Service::Vault) {
        info!("Deploying {}", Service::Vault);
        let store = SecretStore::new(&settings.broker.secrets_file);
        let broker = deploy_broker(connect_broker().await?, settings, &store).await?;
        info!(
            "Vault done: {} OIDC application(s) configured",
            broker.applications.len()
        );
        report.broker = Some(broker);
    }

    Ok(report)
}

/// OU groups, then each configured group with its positional id, then OU
/// users and any configured users.
///
/// # Errors
/// Returns the first directory failure other than "already exists".
pub async fn deploy_directory<B: DirectoryBackend>(
    provisioner: &mut DirectoryProvisioner<B>,
    directory: &DirectorySettings,
) -> Result<DirectoryReport> {
    let mut report = DirectoryReport::default();

    let outcome = provisioner
        .ensure_organizational_unit(&directory.ou_groups)
        .await?;
    report
        .organizational_units
        .push((directory.ou_groups.clone(), outcome));

    let group_ids = assign_ids(&directory.groups, directory.group_id_base);
    for (name, gid) in &group_ids {
        let outcome = provisioner.ensure_group(name, *gid).await?;
        report.groups.push(((*name).to_string(), *gid, outcome));
    }

    let outcome = provisioner
        .ensure_organizational_unit(&directory.ou_users)
        .await?;
    report
        .organizational_units
        .push((directory.ou_users.clone(), outcome));

    let gids: HashMap<&str, u32> = group_ids.into_iter().collect();
    let uids: Vec<&str> = directory.users.iter().map(|user| user.uid.as_str()).collect();
    for (user, (_, uid_number)) in directory
        .users
        .iter()
        .zip(assign_ids(&uids, directory.user_id_base))
    {
        let gid = gids.get(user.group.as_str()).copied().ok_or_else(|| {
            BootstrapError::Config(format!(
                "user {} references unknown group {}",
                user.uid, user.group
            ))
        })?;
        let outcome = provisioner.ensure_user(user, uid_number, gid).await?;
        report.users.push((user.uid.clone(), outcome));
    }

    Ok(report)
}

/// Load-or-initialize, unseal, LDAP auth, default group, then each OIDC
/// application. The session is logged out whether or not this succeeds.
///
/// # Errors
/// Returns the first fatal broker, storage or precondition failure.
pub async fn deploy_broker(
    mut broker: BrokerProvisioner,
    settings: &Settings,
    store: &SecretStore,
) -> Result<BrokerReport> {
    let result = configure_broker(&mut broker, settings, store).await;
    broker.logout();
    result
}

async fn configure_broker(
    broker: &mut BrokerProvisioner,
    settings: &Settings,
    store: &SecretStore,
) -> Result<BrokerReport> {
    let vault = &settings.broker;

    let initialized = match store.load().await? {
        Some(material) => {
            if broker.state() == BrokerState::Uninitialized {
                return Err(BootstrapError::precondition(format!(
                    "{} holds secrets but Vault is uninitialized; move the stale file aside to \
                     initialize this instance",
                    store.path().display()
                )));
            }
            broker.attach_material(material);
            false
        }
        None => {
            if broker.state() != BrokerState::Uninitialized {
                return Err(BootstrapError::precondition(format!(
                    "Vault is already initialized but {} is missing",
                    store.path().display()
                )));
            }
            let material = broker
                .initialize(vault.secret_shares, vault.secret_threshold)
                .await?;
            if let Err(err) = store.save(material).await {
                // The broker will never hand these out again.
                error!(
                    "Failed to persist Vault secrets, record them now:\n{}",
                    material.render(SecretSelector::All)
                );
                return Err(err);
            }
            true
        }
    };

    let unseal = broker.unseal(vault.secret_threshold).await?;
    let auth_mount = broker
        .enable_directory_auth(&settings.directory, &vault.auth_mount)
        .await?;
    if vault.ldap_default_login {
        broker.tune_login_ui().await?;
    }
    let group_id = broker.create_group(&vault.default_group).await?;

    let mut applications = Vec::with_capacity(vault.oidc_applications.len());
    for app in &vault.oidc_applications {
        let client_id = broker.provision_oidc_application(app).await?;
        let output_path = broker
            .export_runtime_config(app, settings.dependent_service()?, &vault.admin_users)
            .await?;
        applications.push(ApplicationReport {
            appname: app.appname.clone(),
            client_id,
            output_path,
        });
    }

    Ok(BrokerReport {
        initialized,
        unseal,
        auth_mount,
        group_id,
        applications,
    })
}

/// Prints the persisted secrets selected by `selector`.
///
/// # Errors
/// Returns [`BootstrapError::PreconditionFailure`] when nothing is persisted.
pub async fn read_secrets(store: &SecretStore, selector: SecretSelector) -> Result<String> {
    let material = store.load().await?.ok_or_else(|| {
        BootstrapError::precondition(format!("no secrets file at {}", store.path().display()))
    })?;
    Ok(material.render(selector))
}
