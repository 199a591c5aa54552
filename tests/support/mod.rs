// Helper functions are shared across multiple test crates; not every helper is
// referenced in each test module.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uninuvola_init::broker::BrokerProvisioner;
use uninuvola_init::config::Settings;
use uninuvola_init::error::{BootstrapError, Provisioned, Result, Target};
use uninuvola_init::ldap::{DirectoryBackend, DirectoryEntry};
use uninuvola_init::vault::VaultClient;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(crate) const ROOT_TOKEN: &str = "root-token";
pub(crate) const UNSEAL_KEYS: [&str; 5] = ["key-1", "key-2", "key-3", "key-4", "key-5"];
pub(crate) const ACCESSOR: &str = "auth_ldap_1234";
pub(crate) const GROUP_ID: &str = "group-id-1";
pub(crate) const CLIENT_ID: &str = "client-id-1";
pub(crate) const CLIENT_SECRET: &str = "hvo_secret_1";
pub(crate) const BASE_DN: &str = "dc=uninuvola,dc=unipg,dc=it";
pub(crate) const SCOPE_TEMPLATE: &str =
    r#"{{"username": {{{{identity.entity.aliases.{_accessor}.name}}}}}}"#;
pub(crate) const RENDERED_SCOPE: &str =
    r#"{"username": {{identity.entity.aliases.auth_ldap_1234.name}}}"#;

/// Directory double: entries live in a shared map so tests can inspect them
/// after the provisioner is closed. Adds under a missing parent fail the way
/// a real server answers code 32.
#[derive(Clone, Default)]
pub(crate) struct MemoryDirectory {
    pub(crate) entries: Arc<Mutex<BTreeMap<String, DirectoryEntry>>>,
    pub(crate) adds: Arc<Mutex<Vec<String>>>,
    pub(crate) unbinds: Arc<Mutex<usize>>,
    pub(crate) reject_adds: bool,
}

impl MemoryDirectory {
    /// A directory that refuses every add with an insufficient-access code.
    pub(crate) fn read_only() -> Self {
        Self {
            reject_adds: true,
            ..Self::default()
        }
    }

    pub(crate) fn dns(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn entry(&self, dn: &str) -> Option<DirectoryEntry> {
        self.entries.lock().unwrap().get(dn).cloned()
    }

    pub(crate) fn add_order(&self) -> Vec<String> {
        self.adds.lock().unwrap().clone()
    }

    pub(crate) fn unbind_count(&self) -> usize {
        *self.unbinds.lock().unwrap()
    }
}

#[async_trait]
impl DirectoryBackend for MemoryDirectory {
    async fn add_entry(&mut self, entry: &DirectoryEntry) -> Result<Provisioned> {
        if self.reject_adds {
            return Err(BootstrapError::AuthFailure {
                target: Target::Directory,
                detail: format!("not allowed to add {}", entry.dn),
            });
        }
        let mut entries = self.entries.lock().unwrap();
        let parent = entry.dn.split_once(',').map_or("", |(_, parent)| parent);
        if parent != BASE_DN && !entries.contains_key(parent) {
            return Err(BootstrapError::PreconditionFailure(format!(
                "parent of {} does not exist",
                entry.dn
            )));
        }
        self.adds.lock().unwrap().push(entry.dn.clone());
        if entries.contains_key(&entry.dn) {
            return Ok(Provisioned::AlreadyExists);
        }
        entries.insert(entry.dn.clone(), entry.clone());
        Ok(Provisioned::Created)
    }

    async fn unbind(&mut self) -> Result<()> {
        *self.unbinds.lock().unwrap() += 1;
        Ok(())
    }
}

/// Writes a config pointing the broker at `server` and every output file
/// into `dir`, then loads it the way the binary does.
pub(crate) fn write_settings(dir: &Path, server: &MockServer, extra_broker: &str) -> Settings {
    let address = server.address();
    let config = format!(
        r#"
directory:
  host: ldap.test
  dc: "{BASE_DN}"
  bind_user: admin
  bind_password: ldap-admin-password
  users:
    - uid: mrossi
      first_name: Mario
      last_name: Rossi
      password: mario-password
      group: admin
broker:
  host: "{host}"
  port: {port}
  public_url: "https://vault.example.org/"
  secrets_file: "{secrets}"
  admin_users: ["mrossi"]
  request_timeout: 5s
{extra_broker}
  oidc_applications:
    - appname: webapp
      provider_name: uninuvola
      redirect_uri: "https://app.example.org/callback"
      output_path: "{env}"
      scopes:
        - name: user
          template: '{SCOPE_TEMPLATE}'
dependent_service:
  host: redis.test
  password: redis-password
"#,
        host = address.ip(),
        port = address.port(),
        secrets = dir.join(".secrets").display(),
        env = dir.join("webapp.env").display(),
    );
    let path = dir.join("config.yml");
    std::fs::write(&path, config).unwrap();
    Settings::load(&path).unwrap()
}

pub(crate) async fn open_broker(server: &MockServer) -> Result<BrokerProvisioner> {
    let client = VaultClient::new(&server.uri(), Duration::from_secs(5))?;
    BrokerProvisioner::open(client, "https://vault.example.org".to_string()).await
}

pub(crate) fn secrets_json() -> String {
    serde_json::to_string_pretty(&json!({
        "root_token": ROOT_TOKEN,
        "keys": UNSEAL_KEYS,
    }))
    .unwrap()
}

pub(crate) async fn mount_health(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({})))
        .mount(server)
        .await;
}

pub(crate) async fn mount_init_status(server: &MockServer, initialized: bool) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/init"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "initialized": initialized })),
        )
        .mount(server)
        .await;
}

pub(crate) async fn mount_seal_status(server: &MockServer, sealed: bool) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": sealed,
            "t": 3,
            "n": 5,
            "progress": 0
        })))
        .mount(server)
        .await;
}

/// Broker that is up, initialized and unsealed.
pub(crate) async fn mount_unsealed_broker(server: &MockServer) {
    mount_health(server, 200).await;
    mount_init_status(server, true).await;
    mount_seal_status(server, false).await;
}

/// Answers the first `sealed_for` unseal submissions with `sealed: true` and
/// every later one with `sealed: false`.
pub(crate) async fn mount_unseal(server: &MockServer, sealed_for: u64) {
    if sealed_for > 0 {
        Mock::given(method("POST"))
            .and(path("/v1/sys/unseal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sealed": true,
                "t": 3,
                "progress": 1
            })))
            .up_to_n_times(sealed_for)
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false,
            "t": 3,
            "progress": 0
        })))
        .mount(server)
        .await;
}

/// LDAP auth mount writes plus the `sys/auth` listing carrying the accessor.
pub(crate) async fn mount_ldap_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/sys/auth/ldap"))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/ldap/config"))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/auth"))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "token/": { "type": "token", "accessor": "auth_token_0000" },
                "ldap/": { "type": "ldap", "accessor": ACCESSOR }
            }
        })))
        .mount(server)
        .await;
}

pub(crate) async fn mount_group(server: &MockServer, name: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/identity/group/name/{name}")))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "id": GROUP_ID, "name": name } })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/identity/group-alias"))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "id": "alias-id-1", "canonical_id": GROUP_ID } })),
        )
        .mount(server)
        .await;
}

/// Client, scope and provider writes for `appname`, plus the client read.
pub(crate) async fn mount_oidc(server: &MockServer, appname: &str, scope: &str, provider: &str) {
    for write in [
        format!("/v1/identity/oidc/client/{appname}"),
        format!("/v1/identity/oidc/scope/{scope}"),
        format!("/v1/identity/oidc/provider/{provider}"),
    ] {
        Mock::given(method("POST"))
            .and(path(write))
            .and(header("X-Vault-Token", ROOT_TOKEN))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(format!("/v1/identity/oidc/client/{appname}")))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "client_id": CLIENT_ID,
                "client_secret": CLIENT_SECRET,
                "client_type": "confidential",
                "redirect_uris": ["https://app.example.org/callback"]
            }
        })))
        .mount(server)
        .await;
}

/// Paths of the requests `server` received, in arrival order.
pub(crate) async fn received_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| format!("{} {}", request.method, request.url.path()))
        .collect()
}
