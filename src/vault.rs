use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{BootstrapError, Provisioned, Result, Target};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// HTTP session against the broker. Holds the token used for every
/// authenticated request; there is no process-wide client.
#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InitStatus {
    pub initialized: bool,
}

#[derive(Debug, Deserialize)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(default)]
    pub t: Option<u32>,
    #[serde(default)]
    pub progress: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

impl InitResponse {
    /// Unseal shares in the order the broker returned them.
    pub fn unseal_keys(&self) -> Vec<String> {
        if self.keys.is_empty() {
            self.keys_base64.clone()
        } else {
            self.keys.clone()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LdapAuthConfig {
    pub url: String,
    pub userdn: String,
    pub groupdn: String,
    pub binddn: String,
    pub bindpass: String,
    pub userattr: String,
    pub groupattr: String,
}

#[derive(Debug, Serialize)]
pub struct OidcClientConfig {
    pub redirect_uris: Vec<String>,
    pub assignments: Vec<String>,
    pub key: String,
    pub client_type: String,
    pub id_token_ttl: String,
    pub access_token_ttl: String,
}

#[derive(Debug, Serialize)]
pub struct OidcScopeConfig {
    pub description: String,
    pub template: String,
}

#[derive(Debug, Serialize)]
pub struct OidcProviderConfig {
    pub issuer: String,
    pub allowed_client_ids: Vec<String>,
    pub scopes_supported: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OidcClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct GroupData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AuthMountData {
    accessor: String,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultClient {
    /// Builds a client for `base_url` whose requests time out after `timeout`.
    ///
    /// # Errors
    /// Returns [`BootstrapError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| transport("Failed to build Vault HTTP client", &err))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Forgets the session token without revoking it server-side.
    pub fn clear_token(&mut self) {
        self.token = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// # Errors
    /// Returns an error if the broker is unreachable or unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let response = self.execute(Method::GET, "sys/health", None, false).await?;
        let status = response.status;
        // 429 standby, 501 uninitialized, 503 sealed: all reachable.
        if status == StatusCode::OK
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::SERVICE_UNAVAILABLE
            || status == StatusCode::NOT_IMPLEMENTED
        {
            return Ok(());
        }
        Err(api_error(status, &response.text))
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn is_initialized(&self) -> Result<bool> {
        let status: InitStatus = self.get_json("sys/init", false).await?;
        Ok(status.initialized)
    }

    /// # Errors
    /// Returns an error if the broker refuses initialization, e.g. because it
    /// is already initialized.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse> {
        #[derive(Serialize)]
        struct InitRequest {
            secret_shares: u8,
            secret_threshold: u8,
        }
        self.post_json(
            "sys/init",
            &InitRequest {
                secret_shares: shares,
                secret_threshold: threshold,
            },
            false,
        )
        .await
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn seal_status(&self) -> Result<SealStatus> {
        self.get_json("sys/seal-status", false).await
    }

    /// # Errors
    /// Returns an error if the broker rejects the key share.
    pub async fn unseal(&self, key: &str) -> Result<SealStatus> {
        #[derive(Serialize)]
        struct UnsealRequest<'a> {
            key: &'a str,
        }
        self.post_json("sys/unseal", &UnsealRequest { key }, false)
            .await
    }

    /// Enables an auth method at `path`. A path already in use is
    /// [`Provisioned::AlreadyExists`].
    ///
    /// # Errors
    /// Returns any other broker rejection.
    pub async fn enable_auth(
        &self,
        path: &str,
        auth_type: &str,
        description: &str,
    ) -> Result<Provisioned> {
        #[derive(Serialize)]
        struct AuthRequest<'a> {
            #[serde(rename = "type")]
            auth_type: &'a str,
            description: &'a str,
        }
        self.post_create(
            &format!("sys/auth/{path}"),
            &AuthRequest {
                auth_type,
                description,
            },
        )
        .await
    }

    /// Accessor the broker assigned to the auth mount at `path`.
    ///
    /// # Errors
    /// Returns [`BootstrapError::PreconditionFailure`] if no such mount exists.
    pub async fn auth_accessor(&self, path: &str) -> Result<String> {
        let auths: DataResponse<serde_json::Map<String, Value>> =
            self.get_json("sys/auth", true).await?;
        let key = format!("{}/", path.trim_end_matches('/'));
        let mount = auths
            .data
            .get(&key)
            .ok_or_else(|| BootstrapError::precondition(format!("auth mount {key} is not enabled")))?;
        let mount: AuthMountData = serde_json::from_value(mount.clone())
            .map_err(|err| unexpected(StatusCode::OK, &format!("auth mount {key}: {err}")))?;
        Ok(mount.accessor)
    }

    /// # Errors
    /// Returns an error if the broker rejects the configuration.
    pub async fn write_ldap_config(&self, path: &str, config: &LdapAuthConfig) -> Result<()> {
        self.post_empty(&format!("auth/{path}/config"), config)
            .await
    }

    /// # Errors
    /// Returns an error if the broker rejects the tuning.
    pub async fn tune_auth_listing(&self, path: &str, visibility: &str) -> Result<()> {
        #[derive(Serialize)]
        struct TuneRequest<'a> {
            listing_visibility: &'a str,
        }
        self.post_empty(
            &format!("sys/auth/{path}/tune"),
            &TuneRequest {
                listing_visibility: visibility,
            },
        )
        .await
    }

    /// Creates or updates identity group `name`. Returns its id and whether
    /// it was newly created.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the write or the read-back.
    pub async fn write_group(&self, name: &str, group_type: &str) -> Result<(String, Provisioned)> {
        #[derive(Serialize)]
        struct GroupRequest<'a> {
            #[serde(rename = "type")]
            group_type: &'a str,
        }
        let path = format!("identity/group/name/{name}");
        let created: Option<DataResponse<GroupData>> =
            self.post_optional(&path, &GroupRequest { group_type }).await?;
        if let Some(created) = created {
            return Ok((created.data.id, Provisioned::Created));
        }
        // An update answers 204 without a body.
        let existing: DataResponse<GroupData> = self.get_json(&path, true).await?;
        Ok((existing.data.id, Provisioned::AlreadyExists))
    }

    /// Binds group `canonical_id` to the auth mount `mount_accessor`.
    ///
    /// # Errors
    /// Returns any broker rejection other than "already in use".
    pub async fn create_group_alias(
        &self,
        name: &str,
        mount_accessor: &str,
        canonical_id: &str,
    ) -> Result<Provisioned> {
        #[derive(Serialize)]
        struct AliasRequest<'a> {
            name: &'a str,
            mount_accessor: &'a str,
            canonical_id: &'a str,
        }
        self.post_create(
            "identity/group-alias",
            &AliasRequest {
                name,
                mount_accessor,
                canonical_id,
            },
        )
        .await
    }

    /// # Errors
    /// Returns an error if the broker rejects the client.
    pub async fn write_oidc_client(&self, name: &str, config: &OidcClientConfig) -> Result<()> {
        self.post_empty(&format!("identity/oidc/client/{name}"), config)
            .await
    }

    /// # Errors
    /// Returns an error if the client does not exist or cannot be read.
    pub async fn read_oidc_client(&self, name: &str) -> Result<OidcClientCredentials> {
        let response: DataResponse<OidcClientCredentials> = self
            .get_json(&format!("identity/oidc/client/{name}"), true)
            .await?;
        Ok(response.data)
    }

    /// # Errors
    /// Returns an error if the broker rejects the scope.
    pub async fn write_oidc_scope(&self, name: &str, config: &OidcScopeConfig) -> Result<()> {
        self.post_empty(&format!("identity/oidc/scope/{name}"), config)
            .await
    }

    /// # Errors
    /// Returns an error if the broker rejects the provider.
    pub async fn write_oidc_provider(&self, name: &str, config: &OidcProviderConfig) -> Result<()> {
        self.post_empty(&format!("identity/oidc/provider/{name}"), config)
            .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        use_token: bool,
    ) -> Result<RawResponse> {
        let url = self.endpoint(path);
        debug!("{method} {url}");
        let mut request = self.client.request(method, url);
        if use_token {
            let token = self.token.as_ref().ok_or_else(|| {
                BootstrapError::precondition(format!("Vault token is not set for {path}"))
            })?;
            request = request.header(VAULT_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| transport(&format!("Vault request failed: {path}"), &err))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| transport(&format!("Failed to read Vault response: {path}"), &err))?;
        debug!("{path} -> {status}");
        Ok(RawResponse { status, text })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, use_token: bool) -> Result<T> {
        let response = self.execute(Method::GET, path, None, use_token).await?;
        response.into_json()
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        use_token: bool,
    ) -> Result<T> {
        let response = self
            .execute(Method::POST, path, Some(to_value(body)?), use_token)
            .await?;
        response.into_json()
    }

    async fn post_empty<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .execute(Method::POST, path, Some(to_value(body)?), true)
            .await?;
        response.into_success().map(|_| ())
    }

    async fn post_optional<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let response = self
            .execute(Method::POST, path, Some(to_value(body)?), true)
            .await?;
        let status = response.status;
        let text = response.into_success()?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| unexpected(status, &err.to_string()))
    }

    async fn post_create<B: Serialize>(&self, path: &str, body: &B) -> Result<Provisioned> {
        let response = self
            .execute(Method::POST, path, Some(to_value(body)?), true)
            .await?;
        if response.status == StatusCode::BAD_REQUEST && is_conflict(&response.text) {
            return Ok(Provisioned::AlreadyExists);
        }
        response.into_success().map(|_| Provisioned::Created)
    }
}

struct RawResponse {
    status: StatusCode,
    text: String,
}

impl RawResponse {
    fn into_success(self) -> Result<String> {
        if self.status.is_success() {
            Ok(self.text)
        } else {
            Err(api_error(self.status, &self.text))
        }
    }

    fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        let status = self.status;
        let text = self.into_success()?;
        serde_json::from_str(&text).map_err(|err| unexpected(status, &err.to_string()))
    }
}

fn to_value<B: Serialize>(body: &B) -> Result<Value> {
    serde_json::to_value(body).map_err(|err| BootstrapError::Transport {
        target: Target::Broker,
        detail: format!("Failed to encode request: {err}"),
    })
}

fn error_messages(text: &str) -> String {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
    if body.errors.is_empty() {
        text.trim().to_string()
    } else {
        body.errors.join("; ")
    }
}

fn is_conflict(text: &str) -> bool {
    let messages = error_messages(text);
    messages.contains("already in use") || messages.contains("already exists")
}

fn api_error(status: StatusCode, text: &str) -> BootstrapError {
    let detail = error_messages(text);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return BootstrapError::AuthFailure {
            target: Target::Broker,
            detail,
        };
    }
    BootstrapError::Rejected {
        target: Target::Broker,
        code: u32::from(status.as_u16()),
        detail,
    }
}

fn unexpected(status: StatusCode, detail: &str) -> BootstrapError {
    BootstrapError::Rejected {
        target: Target::Broker,
        code: u32::from(status.as_u16()),
        detail: format!("unexpected response: {detail}"),
    }
}

fn transport(context: &str, err: &reqwest::Error) -> BootstrapError {
    BootstrapError::Transport {
        target: Target::Broker,
        detail: format!("{context}: {err}"),
    }
}
