use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::principal::{json_id, parse_timestamp, AccessToken, Credential, Identity, SignIn, VerificationMethod};
use super::secret::{check_secret, SecretCheck};
use crate::backend::{eq_filter, error_detail, BackendClient, AUTH_TOKEN_PATH, AUTH_USER_PATH};
use crate::config::Config;

/// Caller-visible sign-in failures. `Display` is the status line shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Please enter both email and password")]
    MissingFields,
    #[error("Please enter a valid email address")]
    InvalidEmail,
    #[error("No internet connection available")]
    NoConnection,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// How one strategy classified a sign-in attempt.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Accepted(SignIn),
    /// Conclusive "no" from this strategy; the next one may still accept.
    Rejected(String),
    /// Transport failure before a conclusive answer.
    Unreachable(String),
}

/// One way of checking credentials and vouching for the tokens it issues.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    fn method(&self) -> VerificationMethod;
    async fn attempt(&self, credential: &Credential) -> StageOutcome;
    async fn verify(&self, token: &AccessToken) -> Option<Identity>;
}

/// Token verification as seen by the API side.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Option<Identity>;
}

pub(crate) fn identity_from_remote_user(user: &Value, method: VerificationMethod) -> Option<Identity> {
    let id = json_id(user.get("id")?)?;
    let email = user.get("email").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let created_at = user.get("created_at").and_then(parse_timestamp).unwrap_or_else(Utc::now);
    Some(Identity { id, email, verification_method: method, created_at })
}

/// Password grant against the remote identity service.
pub struct RemoteAuthVerifier {
    backend: BackendClient,
}

impl RemoteAuthVerifier {
    pub fn new(backend: BackendClient) -> Self { Self { backend } }
}

#[async_trait]
impl CredentialVerifier for RemoteAuthVerifier {
    fn method(&self) -> VerificationMethod { VerificationMethod::RemoteAuth }

    async fn attempt(&self, credential: &Credential) -> StageOutcome {
        let body = serde_json::json!({"email": credential.email, "password": credential.secret});
        let resp = match self.backend.post_json(AUTH_TOKEN_PATH, &[("grant_type", "password")], &body).await {
            Ok(r) => r,
            Err(e) => return StageOutcome::Unreachable(e.to_string()),
        };
        let status = resp.status();
        if status.is_server_error() {
            return StageOutcome::Unreachable(error_detail(resp).await);
        }
        if status != StatusCode::OK {
            return StageOutcome::Rejected(error_detail(resp).await);
        }
        let v: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return StageOutcome::Unreachable(format!("malformed token response: {}", e)),
        };
        let token = v.get("access_token").and_then(|t| t.as_str()).filter(|t| !t.is_empty());
        let identity = v.get("user").and_then(|u| identity_from_remote_user(u, VerificationMethod::RemoteAuth));
        match (token, identity) {
            (Some(t), Some(identity)) => StageOutcome::Accepted(SignIn {
                identity,
                access_token: AccessToken::Bearer(t.to_string()),
                method: VerificationMethod::RemoteAuth,
            }),
            _ => StageOutcome::Unreachable("malformed token response: missing access_token or user".into()),
        }
    }

    async fn verify(&self, token: &AccessToken) -> Option<Identity> {
        let AccessToken::Bearer(raw) = token else { return None; };
        let resp = match self.backend.get(AUTH_USER_PATH, &[] as &[(&str, &str)], Some(raw.as_str())).await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "auth", "token verification request failed: {}", e);
                return None;
            }
        };
        if resp.status() != StatusCode::OK {
            debug!(target: "auth", "token verification answered {}", resp.status());
            return None;
        }
        let user: Value = resp.json().await.ok()?;
        identity_from_remote_user(&user, VerificationMethod::RemoteAuth)
    }
}

/// Exact-email lookup in the user table, with the secret checked locally.
pub struct TableLookupVerifier {
    backend: BackendClient,
    table: String,
    allow_plaintext: bool,
}

impl TableLookupVerifier {
    pub fn new(backend: BackendClient, table: impl Into<String>, allow_plaintext: bool) -> Self {
        Self { backend, table: table.into(), allow_plaintext }
    }
}

#[async_trait]
impl CredentialVerifier for TableLookupVerifier {
    fn method(&self) -> VerificationMethod { VerificationMethod::TableLookup }

    async fn attempt(&self, credential: &Credential) -> StageOutcome {
        let query = [eq_filter("email", &credential.email), ("select".to_string(), "*".to_string())];
        let resp = match self.backend.get(&BackendClient::table_path(&self.table), &query, None).await {
            Ok(r) => r,
            Err(e) => return StageOutcome::Unreachable(e.to_string()),
        };
        let status = resp.status();
        if status.is_server_error() {
            return StageOutcome::Unreachable(error_detail(resp).await);
        }
        if status != StatusCode::OK {
            return StageOutcome::Rejected(error_detail(resp).await);
        }
        let rows: Vec<Value> = match resp.json().await {
            Ok(rows) => rows,
            Err(e) => return StageOutcome::Unreachable(format!("malformed user table response: {}", e)),
        };
        debug!(target: "auth", "user table returned {} row(s)", rows.len());
        let [row] = rows.as_slice() else {
            return StageOutcome::Rejected(format!("expected exactly one row, got {}", rows.len()));
        };
        let Some(stored) = row.get("password").and_then(|p| p.as_str()).map(|s| s.to_string()) else {
            return StageOutcome::Rejected("row has no stored secret".into());
        };
        let Some(id) = row.get("id").and_then(json_id) else {
            return StageOutcome::Rejected("row has no id".into());
        };

        // Argon2 verification is CPU bound
        let provided = credential.secret.clone();
        let allow_plaintext = self.allow_plaintext;
        let check = tokio::task::spawn_blocking(move || check_secret(&provided, &stored, allow_plaintext))
            .await
            .unwrap_or(SecretCheck::Mismatch);
        if check != SecretCheck::Match {
            return StageOutcome::Rejected("secret mismatch".into());
        }

        let email = row.get("email").and_then(|v| v.as_str()).unwrap_or(credential.email.as_str()).to_string();
        let created_at = row.get("created_at").and_then(parse_timestamp).unwrap_or_else(Utc::now);
        let identity = Identity { id: id.clone(), email, verification_method: VerificationMethod::TableLookup, created_at };
        StageOutcome::Accepted(SignIn {
            identity,
            access_token: AccessToken::table_auth(id),
            method: VerificationMethod::TableLookup,
        })
    }

    async fn verify(&self, _token: &AccessToken) -> Option<Identity> {
        // Table-auth tokens are synthesized locally and carry nothing the API can check.
        debug!(target: "auth", "table-auth token presented for verification; rejecting");
        None
    }
}

/// Ordered fallback chain over the configured strategies; the first acceptance wins.
pub struct IdentityClient {
    verifiers: Vec<Arc<dyn CredentialVerifier>>,
    current: RwLock<Option<SignIn>>,
}

impl IdentityClient {
    /// Remote password grant first, then the user table.
    pub fn new(backend: BackendClient, cfg: &Config) -> Self {
        let remote: Arc<dyn CredentialVerifier> = Arc::new(RemoteAuthVerifier::new(backend.clone()));
        let table: Arc<dyn CredentialVerifier> =
            Arc::new(TableLookupVerifier::new(backend, cfg.users_table.clone(), cfg.allow_plaintext_secrets));
        Self::with_verifiers(vec![remote, table])
    }

    pub fn with_verifiers(verifiers: Vec<Arc<dyn CredentialVerifier>>) -> Self {
        Self { verifiers, current: RwLock::new(None) }
    }

    pub async fn sign_in(&self, email: &str, secret: &str) -> Result<SignIn, AuthError> {
        let credential = Credential::new(email, secret);
        *self.current.write() = None;
        for verifier in self.verifiers.iter() {
            match verifier.attempt(&credential).await {
                StageOutcome::Accepted(sign_in) => {
                    info!(target: "auth", "signed in {} via {}", credential.email, sign_in.method);
                    *self.current.write() = Some(sign_in.clone());
                    return Ok(sign_in);
                }
                StageOutcome::Rejected(reason) => {
                    debug!(target: "auth", "{} rejected {}: {}", verifier.method(), credential.email, reason);
                }
                StageOutcome::Unreachable(detail) => {
                    warn!(target: "auth", "{} unreachable during sign-in: {}", verifier.method(), detail);
                    return Err(AuthError::ConnectionError(detail));
                }
            }
        }
        info!(target: "auth", "sign-in failed for {}", credential.email);
        Err(AuthError::InvalidCredentials)
    }

    /// Dispatch on token shape to the capability that issued it.
    pub async fn verify_token(&self, token: &str) -> Option<Identity> {
        let token = AccessToken::parse(token);
        let verifier = self.verifiers.iter().find(|v| v.method() == token.method())?;
        verifier.verify(&token).await
    }

    pub fn sign_out(&self) {
        *self.current.write() = None;
    }

    pub fn current(&self) -> Option<SignIn> {
        self.current.read().clone()
    }
}

#[async_trait]
impl TokenVerifier for IdentityClient {
    async fn verify_token(&self, token: &str) -> Option<Identity> {
        IdentityClient::verify_token(self, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> IdentityClient {
        let cfg = Config::new(server.uri(), "anon");
        IdentityClient::new(BackendClient::for_client(&cfg).unwrap(), &cfg)
    }

    fn remote_user() -> Value {
        json!({"id": "c0ffee", "email": "op@lab.example", "created_at": "2024-03-01T09:00:00+00:00"})
    }

    async fn mount_remote(server: &MockServer, status: u16) {
        let body = if status == 200 {
            json!({"access_token": "jwt-abc", "user": remote_user()})
        } else {
            json!({"error": "invalid_grant", "error_description": "Invalid login credentials"})
        };
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    async fn mount_table(server: &MockServer, email: &str, rows: Value, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/Users"))
            .and(query_param("email", format!("eq.{}", email)))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn remote_success_short_circuits_table_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(body_json(json!({"email": "op@lab.example", "password": "pw"})))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "jwt-abc", "user": remote_user()})))
            .mount(&server)
            .await;
        mount_table(&server, "op@lab.example", json!([]), 0).await;

        let client = client_for(&server);
        let s = client.sign_in("op@lab.example", "pw").await.unwrap();
        assert_eq!(s.method, VerificationMethod::RemoteAuth);
        assert_eq!(s.access_token, AccessToken::Bearer("jwt-abc".into()));
        assert_eq!(s.identity.id, "c0ffee");
        assert_eq!(client.current(), Some(s));
    }

    #[tokio::test]
    async fn table_lookup_accepts_matching_row() {
        let server = MockServer::start().await;
        mount_remote(&server, 400).await;
        mount_table(&server, "a@b.com", json!([{"id": 17, "email": "a@b.com", "password": "x"}]), 1).await;

        let s = client_for(&server).sign_in("a@b.com", "x").await.unwrap();
        assert_eq!(s.method, VerificationMethod::TableLookup);
        assert!(s.access_token.to_string().starts_with("table_auth_"));
        assert_eq!(s.access_token.to_string(), "table_auth_17");
        assert_eq!(s.identity.verification_method, VerificationMethod::TableLookup);
    }

    #[tokio::test]
    async fn table_lookup_accepts_hashed_row() {
        let server = MockServer::start().await;
        mount_remote(&server, 400).await;
        let phc = super::super::secret::hash_secret("x").unwrap();
        mount_table(&server, "a@b.com", json!([{"id": "u1", "email": "a@b.com", "password": phc}]), 1).await;
        let s = client_for(&server).sign_in("a@b.com", "x").await.unwrap();
        assert_eq!(s.identity.id, "u1");
    }

    #[tokio::test]
    async fn failures_are_indistinguishable() {
        let no_row = MockServer::start().await;
        mount_remote(&no_row, 400).await;
        mount_table(&no_row, "a@b.com", json!([]), 1).await;
        let e1 = client_for(&no_row).sign_in("a@b.com", "x").await.unwrap_err();

        let wrong = MockServer::start().await;
        mount_remote(&wrong, 400).await;
        mount_table(&wrong, "a@b.com", json!([{"id": 1, "email": "a@b.com", "password": "y"}]), 1).await;
        let e2 = client_for(&wrong).sign_in("a@b.com", "x").await.unwrap_err();

        let dupes = MockServer::start().await;
        mount_remote(&dupes, 401).await;
        mount_table(&dupes, "a@b.com", json!([{"id": 1, "password": "x"}, {"id": 2, "password": "x"}]), 1).await;
        let e3 = client_for(&dupes).sign_in("a@b.com", "x").await.unwrap_err();

        assert_eq!(e1, AuthError::InvalidCredentials);
        assert_eq!(e1.to_string(), e2.to_string());
        assert_eq!(e2.to_string(), e3.to_string());
        assert_eq!(e1.to_string(), "Invalid email or password");
    }

    #[tokio::test]
    async fn server_error_stops_the_chain() {
        let server = MockServer::start().await;
        mount_remote(&server, 503).await;
        mount_table(&server, "a@b.com", json!([{"id": 1, "password": "x"}]), 0).await;
        let err = client_for(&server).sign_in("a@b.com", "x").await.unwrap_err();
        assert!(matches!(err, AuthError::ConnectionError(_)));
        assert!(err.to_string().starts_with("Connection error:"));
    }

    #[tokio::test]
    async fn verify_bearer_token_via_who_am_i() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer jwt-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote_user()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let client = client_for(&server);
        let id = client.verify_token("jwt-abc").await.unwrap();
        assert_eq!(id.email, "op@lab.example");
        assert!(client.verify_token("stale").await.is_none());
    }

    #[tokio::test]
    async fn table_auth_tokens_never_verify() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(remote_user()))
            .expect(0)
            .mount(&server)
            .await;
        assert!(client_for(&server).verify_token("table_auth_17").await.is_none());
    }

    #[tokio::test]
    async fn sign_out_clears_current() {
        let server = MockServer::start().await;
        mount_remote(&server, 200).await;
        let client = client_for(&server);
        client.sign_in("op@lab.example", "pw").await.unwrap();
        assert!(client.current().is_some());
        client.sign_out();
        assert!(client.current().is_none());
    }
}
