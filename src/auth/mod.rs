//! Authentication against the provider's B2C identity service.
//!
//! The provider exposes no stable machine-to-machine grant, so the client
//! works through a cascade: a cached access token, then the refresh-token
//! grant, then the resource-owner-password grant, and finally a simulation
//! of the browser authorization-code-with-PKCE flow. An HTTP 401 on any
//! authorized call triggers a refresh and, failing that, a full re-login;
//! each call is retried at most once after a successful re-authentication.

mod settings;

pub use settings::{extract_auth_code, extract_login_settings, LoginSettings};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::session::Session;

const AUTHORITY: &str = "https://osbespaceresident.b2clogin.com";
const TENANT: &str = "/osbespaceresident.onmicrosoft.com";
const POLICY: &str = "b2c_1a_signup_signin";
const CLIENT_ID: &str = "1cacfb15-0b3c-42cc-a662-736e4737e7d9";
const REDIRECT_URI: &str = "https://espace-resident.ocea-sb.com";
const SCOPE: &str = "https://osbespaceresident.onmicrosoft.com/\
app-imago-espace-resident-back-prod/user_impersonation \
openid profile offline_access";
const API_BASE: &str = "https://espace-resident-api.ocea-sb.com/api/v1";

/// Provider addresses; overridable so tests can point everything at a mock
/// server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Scheme + host of the B2C login server.
    pub authority: String,
    /// Base of the resident API, including the version prefix.
    pub api_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            authority: AUTHORITY.to_string(),
            api_base: API_BASE.to_string(),
        }
    }
}

impl Endpoints {
    /// Point both the identity provider and the API at a test server.
    pub fn with_base_url(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            api_base: format!("{base}/api/v1"),
            authority: base,
        }
    }

    fn authorize_url(&self) -> String {
        format!("{}{TENANT}/{POLICY}/oauth2/v2.0/authorize", self.authority)
    }

    fn token_url(&self) -> String {
        format!("{}{TENANT}/{POLICY}/oauth2/v2.0/token", self.authority)
    }

    fn self_asserted_url(&self, tenant: &str) -> String {
        format!("{}{tenant}/SelfAsserted", self.authority)
    }

    fn confirm_url(&self, tenant: &str) -> String {
        format!(
            "{}{tenant}/api/CombinedSigninAndSignup/confirmed",
            self.authority
        )
    }
}

/// Token pair held for the life of the client; cleared when a full
/// re-login is forced.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// PKCE verifier/challenge pair, regenerated for every interactive login
/// attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Truncate a response body for log output without splitting a character.
fn snippet(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Authenticated client for the resident API.
pub struct AuthClient {
    session: Session,
    endpoints: Endpoints,
    username: String,
    password: String,
    tokens: Mutex<AuthSession>,
}

impl AuthClient {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        Ok(Self {
            session: Session::new()?,
            endpoints: Endpoints::default(),
            username: username.into(),
            password: password.into(),
            tokens: Mutex::new(AuthSession::default()),
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Snapshot of the currently held token pair.
    pub async fn tokens(&self) -> AuthSession {
        self.tokens.lock().await.clone()
    }

    /// Seed the token pair, e.g. from a previously saved session.
    pub async fn set_tokens(&self, tokens: AuthSession) {
        *self.tokens.lock().await = tokens;
    }

    /// Make sure a usable bearer token is held, running the login cascade
    /// if necessary.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        self.ensure_token(&mut tokens).await
    }

    /// Perform an authorized GET, recovering from one 401 per call.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        self.execute(url, |client_url, token| {
            self.session
                .client()
                .get(client_url)
                .bearer_auth(token.to_string())
        })
        .await
    }

    /// Perform an authorized POST with a JSON body, recovering from one
    /// 401 per call.
    pub async fn post_json(&self, url: &str, payload: &Value) -> Result<Value> {
        self.execute(url, |client_url, token| {
            self.session
                .client()
                .post(client_url)
                .bearer_auth(token.to_string())
                .json(payload)
        })
        .await
    }

    async fn execute<F>(&self, url: &str, build: F) -> Result<Value>
    where
        F: Fn(&str, &str) -> RequestBuilder,
    {
        let mut tokens = self.tokens.lock().await;
        self.ensure_token(&mut tokens).await?;

        let mut response = self.send_authorized(url, &tokens, &build).await?;
        if response.status() == StatusCode::UNAUTHORIZED
            && self.handle_unauthorized(&mut tokens).await
        {
            response = self.send_authorized(url, &tokens, &build).await?;
        }

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::Http {
                status,
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn send_authorized<F>(
        &self,
        url: &str,
        tokens: &AuthSession,
        build: &F,
    ) -> Result<Response>
    where
        F: Fn(&str, &str) -> RequestBuilder,
    {
        let token = tokens.access_token.as_deref().unwrap_or_default();
        Ok(build(url, token).send().await?)
    }

    async fn ensure_token(&self, tokens: &mut AuthSession) -> Result<()> {
        if tokens.access_token.is_some() {
            return Ok(());
        }
        if self.try_refresh(tokens).await? {
            return Ok(());
        }
        if self.try_ropc(tokens).await? {
            return Ok(());
        }
        debug!("ROPC failed or not supported, trying PKCE flow");
        self.login_interactive(tokens).await
    }

    /// Refresh-token grant. Non-success responses fall through to the next
    /// strategy instead of failing.
    async fn try_refresh(&self, tokens: &mut AuthSession) -> Result<bool> {
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            return Ok(false);
        };
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", SCOPE),
        ];
        let response = self
            .session
            .client()
            .post(self.endpoints.token_url())
            .form(&form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = snippet(&body, 200), "token refresh failed");
            return Ok(false);
        }
        let token: TokenResponse = response.json().await?;
        tokens.access_token = token.access_token;
        if token.refresh_token.is_some() {
            tokens.refresh_token = token.refresh_token;
        }
        debug!("refreshed access token");
        Ok(tokens.access_token.is_some())
    }

    /// Resource-owner-password grant. B2C tenants frequently disable this;
    /// a non-success response falls through to the interactive flow.
    async fn try_ropc(&self, tokens: &mut AuthSession) -> Result<bool> {
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("scope", SCOPE),
        ];
        let response = self
            .session
            .client()
            .post(self.endpoints.token_url())
            .form(&form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = snippet(&body, 200), "ROPC auth failed");
            return Ok(false);
        }
        let token: TokenResponse = response.json().await?;
        tokens.access_token = token.access_token;
        tokens.refresh_token = token.refresh_token;
        debug!("authenticated with ROPC flow");
        Ok(tokens.access_token.is_some())
    }

    /// Replicate the browser authorization-code-with-PKCE flow.
    async fn login_interactive(&self, tokens: &mut AuthSession) -> Result<()> {
        let pkce = PkcePair::generate();
        let state = random_urlsafe(16);
        let nonce = random_urlsafe(16);

        let params = [
            ("client_id", CLIENT_ID),
            ("response_type", "code"),
            ("redirect_uri", REDIRECT_URI),
            ("response_mode", "query"),
            ("scope", SCOPE),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
            ("nonce", nonce.as_str()),
        ];
        let response = self
            .session
            .client()
            .get(self.endpoints.authorize_url())
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::flow(format!(
                "Auth start failed: status={}.",
                status.as_u16()
            )));
        }
        let page = response.text().await?;
        let settings = extract_login_settings(&page)?;

        self.submit_credentials(&settings).await?;
        let code = self.confirm_sign_in(&settings).await?;
        self.exchange_code(tokens, &code, &pkce).await?;
        debug!("authenticated with PKCE flow");
        Ok(())
    }

    /// Submit credentials to the self-asserted identity endpoint.
    async fn submit_credentials(&self, settings: &LoginSettings) -> Result<()> {
        let mut form: Vec<(&str, &str)> = vec![
            ("request_type", "RESPONSE"),
            ("signInName", self.username.as_str()),
            ("logonIdentifier", self.username.as_str()),
            ("email", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let mut request = self
            .session
            .client()
            .post(self.endpoints.self_asserted_url(&settings.tenant))
            .query(&[
                ("tx", settings.transaction_id.as_str()),
                ("p", settings.policy.as_str()),
            ])
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(csrf) = &settings.csrf_token {
            form.push(("csrf_token", csrf.as_str()));
            request = request.header("X-CSRF-TOKEN", csrf.as_str());
        }

        let response = request.form(&form).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            warn!(%status, "SelfAsserted failed");
            return Err(Error::flow(format!(
                "B2C SelfAsserted failed ({}).",
                status.as_u16()
            )));
        }

        let content_type = header_str(&response, CONTENT_TYPE);
        if content_type.contains("json") {
            let body: Value = response.json().await?;
            let sa_status = match body.get("status") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            if !matches!(sa_status.as_str(), "200" | "ok" | "OK") {
                let message = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("B2C SelfAsserted returned an error.")
                    .to_string();
                return Err(Error::flow(message));
            }
        }
        Ok(())
    }

    /// Call the confirm-sign-in endpoint and dig the authorization code out
    /// of wherever the provider decided to put it: a redirect Location, a
    /// JSON redirect URL, the body text, or the final URL after following
    /// redirects.
    async fn confirm_sign_in(&self, settings: &LoginSettings) -> Result<String> {
        let url = self.endpoints.confirm_url(&settings.tenant);
        let mut query: Vec<(&str, &str)> = vec![
            ("tx", settings.transaction_id.as_str()),
            ("p", settings.policy.as_str()),
        ];
        if let Some(csrf) = &settings.csrf_token {
            query.push(("csrf_token", csrf.as_str()));
        }

        let mut request = self
            .session
            .no_redirect()
            .get(&url)
            .query(&query)
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(csrf) = &settings.csrf_token {
            request = request.header("X-CSRF-TOKEN", csrf.as_str());
        }
        let response = request.send().await?;

        let status = response.status();
        let mut code = None;
        if status == StatusCode::FOUND || status == StatusCode::SEE_OTHER {
            if let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
            {
                code = extract_auth_code(location);
            }
        } else if status == StatusCode::OK {
            let content_type = header_str(&response, CONTENT_TYPE);
            let body = response.text().await?;
            if content_type.contains("application/json") {
                if let Ok(json) = serde_json::from_str::<Value>(&body) {
                    let redirect = json
                        .get("redirectUrl")
                        .or_else(|| json.get("redirect_uri"))
                        .and_then(Value::as_str);
                    if let Some(redirect) = redirect {
                        code = extract_auth_code(redirect);
                    }
                }
            }
            if code.is_none() {
                code = extract_auth_code(&body);
            }
        }

        if code.is_none() {
            // Last resort: follow the redirect chain and inspect the final URL.
            let mut request = self
                .session
                .client()
                .get(&url)
                .query(&query)
                .header("X-Requested-With", "XMLHttpRequest");
            if let Some(csrf) = &settings.csrf_token {
                request = request.header("X-CSRF-TOKEN", csrf.as_str());
            }
            let response = request.send().await?;
            code = extract_auth_code(response.url().as_str());
        }

        code.ok_or_else(|| Error::flow("Authorization code not found."))
    }

    /// Exchange the authorization code and PKCE verifier for a token pair.
    async fn exchange_code(
        &self,
        tokens: &mut AuthSession,
        code: &str,
        pkce: &PkcePair,
    ) -> Result<()> {
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", pkce.verifier.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("scope", SCOPE),
        ];
        let response = self
            .session
            .client()
            .post(self.endpoints.token_url())
            .form(&form)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = snippet(&body, 200), "token exchange failed");
            return Err(Error::flow("Token exchange failed."));
        }
        let token: TokenResponse = response.json().await?;
        tokens.access_token = token.access_token;
        tokens.refresh_token = token.refresh_token;
        Ok(())
    }

    /// Recovery path for an HTTP 401: refresh first, then clear both tokens
    /// and run the full interactive flow. Returns whether a retry is worth
    /// attempting.
    async fn handle_unauthorized(&self, tokens: &mut AuthSession) -> bool {
        warn!("HTTP 401 received; attempting token refresh");
        if let Ok(true) = self.try_refresh(tokens).await {
            return true;
        }
        warn!("token refresh failed; retrying full authentication");
        tokens.access_token = None;
        tokens.refresh_token = None;
        match self.login_interactive(tokens).await {
            Ok(()) => tokens.access_token.is_some(),
            Err(err) => {
                error!(%err, "full authentication failed after 401");
                false
            }
        }
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let pair = PkcePair::generate();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pair.verifier.as_bytes()));
        assert_eq!(pair.challenge, expected);
        assert!(!pair.challenge.contains('='));
        assert!(!pair.verifier.contains('='));
    }

    #[test]
    fn pkce_pairs_are_distinct_per_attempt() {
        let first = PkcePair::generate();
        let second = PkcePair::generate();
        assert_ne!(first.verifier, second.verifier);
        assert_ne!(first.challenge, second.challenge);
    }

    #[test]
    fn endpoints_compose_b2c_urls() {
        let endpoints = Endpoints::with_base_url("http://127.0.0.1:9000");
        assert_eq!(
            endpoints.token_url(),
            "http://127.0.0.1:9000/osbespaceresident.onmicrosoft.com/b2c_1a_signup_signin/oauth2/v2.0/token"
        );
        assert_eq!(endpoints.api_base, "http://127.0.0.1:9000/api/v1");
        assert_eq!(
            endpoints.self_asserted_url("/tenant"),
            "http://127.0.0.1:9000/tenant/SelfAsserted"
        );
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        assert_eq!(snippet("héllo", 2), "hé");
        assert_eq!(snippet("ok", 200), "ok");
    }
}
