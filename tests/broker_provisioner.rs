mod support;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde_json::{Value, json};
use support::{
    ACCESSOR, CLIENT_ID, CLIENT_SECRET, RENDERED_SCOPE, ROOT_TOKEN, UNSEAL_KEYS, mount_group,
    mount_health, mount_init_status, mount_ldap_auth, mount_oidc, mount_seal_status, mount_unseal,
    mount_unsealed_broker, open_broker, received_paths, write_settings,
};
use uninuvola_init::broker::BrokerState;
use uninuvola_init::error::{BootstrapError, Provisioned};
use uninuvola_init::secrets::SecretMaterial;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn material() -> SecretMaterial {
    SecretMaterial::new(
        ROOT_TOKEN.to_string(),
        UNSEAL_KEYS.iter().map(ToString::to_string).collect(),
    )
}

async fn mount_sealed_broker(server: &MockServer) {
    mount_health(server, 503).await;
    mount_init_status(server, true).await;
    mount_seal_status(server, true).await;
}

async fn submitted_keys(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/v1/sys/unseal")
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            body["key"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn open_detects_lifecycle_state() {
    let server = MockServer::start().await;
    mount_health(&server, 501).await;
    mount_init_status(&server, false).await;
    let broker = open_broker(&server).await.unwrap();
    assert_eq!(broker.state(), BrokerState::Uninitialized);

    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;
    assert_eq!(open_broker(&server).await.unwrap().state(), BrokerState::Sealed);

    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;
    assert_eq!(open_broker(&server).await.unwrap().state(), BrokerState::Unsealed);
}

#[tokio::test]
async fn initialize_keeps_material_and_token() {
    let server = MockServer::start().await;
    mount_health(&server, 501).await;
    mount_init_status(&server, false).await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/init"))
        .and(body_json(json!({ "secret_shares": 5, "secret_threshold": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": UNSEAL_KEYS,
            "keys_base64": UNSEAL_KEYS,
            "root_token": ROOT_TOKEN
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut broker = open_broker(&server).await.unwrap();
    let material = broker.initialize(5, 3).await.expect("init should succeed");
    assert_eq!(material.root_token, ROOT_TOKEN);
    assert_eq!(material.keys, UNSEAL_KEYS);
    assert_eq!(broker.state(), BrokerState::Sealed);

    let err = broker.initialize(5, 3).await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
}

#[tokio::test]
async fn initialize_refuses_initialized_broker() {
    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut broker = open_broker(&server).await.unwrap();
    let err = broker.initialize(5, 3).await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
}

#[tokio::test]
async fn unseal_submits_threshold_keys_in_order() {
    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;
    mount_unseal(&server, 2).await;

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    let outcome = broker.unseal(3).await.expect("unseal should succeed");

    assert_eq!(outcome, Provisioned::Created);
    assert_eq!(broker.state(), BrokerState::Unsealed);
    assert_eq!(submitted_keys(&server).await, vec!["key-1", "key-2", "key-3"]);
}

#[tokio::test]
async fn unseal_stops_once_unsealed() {
    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;
    mount_unseal(&server, 1).await;

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();

    assert_eq!(submitted_keys(&server).await, vec!["key-1", "key-2"]);
}

#[tokio::test]
async fn unseal_fails_when_still_sealed_after_threshold() {
    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;
    mount_unseal(&server, 10).await;

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    let err = broker.unseal(3).await.unwrap_err();

    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
    assert_eq!(submitted_keys(&server).await.len(), 3);
    assert_eq!(broker.state(), BrokerState::Sealed);
}

#[tokio::test]
async fn unseal_requires_material() {
    let server = MockServer::start().await;
    mount_sealed_broker(&server).await;

    let mut broker = open_broker(&server).await.unwrap();
    let err = broker.unseal(3).await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));

    broker.attach_material(SecretMaterial::new(
        ROOT_TOKEN.to_string(),
        vec!["key-1".to_string()],
    ));
    let err = broker.unseal(3).await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
    assert!(submitted_keys(&server).await.is_empty());
}

#[tokio::test]
async fn unseal_on_unsealed_broker_is_already_exists() {
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    assert_eq!(broker.unseal(3).await.unwrap(), Provisioned::AlreadyExists);
    assert!(submitted_keys(&server).await.is_empty());
}

#[tokio::test]
async fn create_group_before_auth_mount_sends_no_request() {
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();
    let before = received_paths(&server).await.len();

    let err = broker.create_group("default").await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
    let err = broker.tune_login_ui().await.unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));

    assert_eq!(received_paths(&server).await.len(), before);
}

#[tokio::test]
async fn enable_directory_auth_configures_mount() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/ldap/config"))
        .and(header("X-Vault-Token", ROOT_TOKEN))
        .and(body_json(json!({
            "url": "ldap://ldap.test:389",
            "userdn": "ou=users,dc=uninuvola,dc=unipg,dc=it",
            "groupdn": "ou=groups,dc=uninuvola,dc=unipg,dc=it",
            "binddn": "cn=admin,dc=uninuvola,dc=unipg,dc=it",
            "bindpass": "ldap-admin-password",
            "userattr": "uid",
            "groupattr": "cn"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    mount_ldap_auth(&server).await;
    let settings = write_settings(dir.path(), &server, "");

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();
    let outcome = broker
        .enable_directory_auth(&settings.directory, "ldap")
        .await
        .expect("enable should succeed");

    assert_eq!(outcome, Provisioned::Created);
    assert_eq!(broker.state(), BrokerState::Configured);
    let mount = broker.auth_mount().unwrap();
    assert_eq!(mount.path, "ldap");
    assert_eq!(mount.accessor, ACCESSOR);
}

#[tokio::test]
async fn group_and_oidc_application_follow_mount() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;
    mount_ldap_auth(&server).await;
    mount_group(&server, "default").await;
    Mock::given(method("POST"))
        .and(path("/v1/identity/oidc/scope/user"))
        .and(body_json(json!({ "description": "", "template": RENDERED_SCOPE })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/identity/oidc/provider/uninuvola"))
        .and(body_json(json!({
            "issuer": "https://vault.example.org",
            "allowed_client_ids": [CLIENT_ID],
            "scopes_supported": ["user"]
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/identity/oidc/client/webapp"))
        .and(body_json(json!({
            "redirect_uris": ["https://app.example.org/callback"],
            "assignments": ["allow_all"],
            "key": "default",
            "client_type": "confidential",
            "id_token_ttl": "24h",
            "access_token_ttl": "24h"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    mount_oidc(&server, "webapp", "user", "uninuvola").await;
    let settings = write_settings(dir.path(), &server, "");

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();
    broker
        .enable_directory_auth(&settings.directory, "ldap")
        .await
        .unwrap();
    let before = received_paths(&server).await.len();

    let group_id = broker.create_group("default").await.unwrap();
    assert_eq!(group_id, support::GROUP_ID);

    let app = &settings.broker.oidc_applications[0];
    let client_id = broker.provision_oidc_application(app).await.unwrap();
    assert_eq!(client_id, CLIENT_ID);

    let calls = received_paths(&server).await.split_off(before);
    assert_eq!(
        calls,
        vec![
            "POST /v1/identity/group/name/default",
            "POST /v1/identity/group-alias",
            "POST /v1/identity/oidc/client/webapp",
            "POST /v1/identity/oidc/scope/user",
            "GET /v1/identity/oidc/client/webapp",
            "POST /v1/identity/oidc/provider/uninuvola",
        ]
    );
}

#[tokio::test]
async fn export_runtime_config_writes_private_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;
    mount_oidc(&server, "webapp", "user", "uninuvola").await;
    let settings = write_settings(dir.path(), &server, "");

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();
    let app = &settings.broker.oidc_applications[0];
    let written = broker
        .export_runtime_config(
            app,
            settings.dependent_service().unwrap(),
            &settings.broker.admin_users,
        )
        .await
        .expect("export should succeed");

    assert_eq!(written, dir.path().join("webapp.env"));
    let contents = std::fs::read_to_string(&written).unwrap();
    assert!(contents.contains(&format!("CLIENT_ID={CLIENT_ID}\n")));
    assert!(contents.contains(&format!("CLIENT_SECRET={CLIENT_SECRET}\n")));
    assert!(contents.contains(
        "CONF_URL=https://vault.example.org/v1/identity/oidc/provider/uninuvola/.well-known/openid-configuration\n"
    ));
    assert!(contents.contains("ADMIN_USERS='[\"mrossi\"]'\n"));
    assert!(contents.contains("REDIS_HOST=redis.test\n"));
    assert!(contents.contains("REDIS_PASSWORD=redis-password\n"));
    let secret_key = contents
        .lines()
        .find_map(|line| line.strip_prefix("SECRET_KEY="))
        .unwrap();
    assert_eq!(secret_key.len(), 22);

    #[cfg(unix)]
    {
        let mode = std::fs::metadata(&written).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

#[tokio::test]
async fn export_runtime_config_requires_client_secret() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_unsealed_broker(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/identity/oidc/client/webapp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "client_id": CLIENT_ID, "client_type": "public" }
        })))
        .mount(&server)
        .await;
    let settings = write_settings(dir.path(), &server, "");

    let mut broker = open_broker(&server).await.unwrap();
    broker.attach_material(material());
    broker.unseal(3).await.unwrap();
    let err = broker
        .export_runtime_config(
            &settings.broker.oidc_applications[0],
            settings.dependent_service().unwrap(),
            &[],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::PreconditionFailure(_)));
    assert!(!dir.path().join("webapp.env").exists());
}

#[tokio::test]
async fn refreshed_state_tracks_unseal() {
    let server = MockServer::start().await;
    mount_health(&server, 503).await;
    mount_init_status(&server, true).await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sealed": true })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_seal_status(&server, false).await;

    let mut broker = open_broker(&server).await.unwrap();
    assert_eq!(broker.state(), BrokerState::Sealed);
    assert_eq!(broker.probe_state().await.unwrap(), BrokerState::Unsealed);
}
