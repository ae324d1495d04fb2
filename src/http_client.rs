use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::coordinator::RefreshRole;
use crate::auth::store::{load_pair, save_pair};
use crate::auth::{
    parse_token_envelope, refresh_tokens, token_preview, CredentialPair, CredentialStore,
    LoginRequest, RefreshCoordinator, RefreshPhase, SessionHooks, SqliteCredentialStore,
    REFRESH_TOKEN_KEY, TOKEN_KEY,
};
use crate::config::{ClientVariant, Config, DEFAULT_LOGIN_PATH, DEFAULT_REFRESH_PATH};
use crate::context::{
    collect_headers, DeviceIdSource, HeaderSource, LocaleSource, LocationSource,
};
use crate::error::{ApiError, RefreshError, Result};
use crate::models::{ApiSuccess, RequestDescriptor};
use crate::transport::{OutgoingRequest, ReqwestTransport, Transport, TransportError};

const UNAUTHORIZED: u16 = 401;

/// Authenticated client for the intake API
///
/// Attaches the stored bearer token to every request and recovers from an
/// expired token by refreshing it once for all concurrent callers, then
/// replaying each rejected request a single time.
pub struct AuthenticatedRequestClient {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    hooks: Arc<dyn SessionHooks>,

    /// Refresh state for this client instance only
    coordinator: RefreshCoordinator,

    header_sources: Vec<Box<dyn HeaderSource>>,
    login_path: String,
    refresh_path: String,
}

impl AuthenticatedRequestClient {
    /// Create a client with default endpoint paths and debounce
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        Self {
            transport,
            store,
            hooks,
            coordinator: RefreshCoordinator::default(),
            header_sources: Vec::new(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
        }
    }

    /// Build the reqwest transport, SQLite store and header sources from
    /// configuration
    pub fn from_config(config: &Config, hooks: Arc<dyn SessionHooks>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(
            &config.api_base_url,
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;
        let store = SqliteCredentialStore::open(&config.credentials_db)
            .context("Failed to open credential store")?;

        let mut client = Self::new(Arc::new(transport), Arc::new(store), hooks)
            .with_login_path(&config.login_path)
            .with_refresh_path(&config.refresh_path)
            .with_debounce(Duration::from_millis(config.refresh_debounce_ms));

        if config.client_variant == ClientVariant::Mobile {
            client = client
                .with_header_source(DeviceIdSource)
                .with_header_source(LocaleSource::new(config.locale.clone()))
                .with_header_source(LocationSource::new(config.location));
        }

        Ok(client)
    }

    pub fn with_login_path(mut self, path: &str) -> Self {
        self.login_path = path.to_string();
        self
    }

    pub fn with_refresh_path(mut self, path: &str) -> Self {
        self.refresh_path = path.to_string();
        self
    }

    /// Quiet period after a refresh during which a burst of 401s is coalesced
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.coordinator = RefreshCoordinator::new(debounce);
        self
    }

    pub fn with_header_source(mut self, source: impl HeaderSource + 'static) -> Self {
        self.header_sources.push(Box::new(source));
        self
    }

    /// Current refresh phase
    pub fn refresh_phase(&self) -> RefreshPhase {
        self.coordinator.phase()
    }

    /// Send a request, refreshing the access token once if it was rejected
    pub async fn request(&self, mut descriptor: RequestDescriptor) -> Result<ApiSuccess> {
        let request_id = Uuid::new_v4().to_string()[..8].to_string();
        let mut replay_token: Option<String> = None;

        loop {
            let token = match replay_token.take() {
                Some(token) => Some(token),
                None => self.stored_token().await,
            };

            let outgoing = self.prepare(&descriptor, token.as_deref()).await;
            tracing::debug!(
                request_id = %request_id,
                method = %descriptor.method,
                endpoint = %descriptor.endpoint,
                retried = descriptor.is_retried(),
                "Sending API request"
            );

            let response = match self.transport.send(outgoing).await {
                Ok(response) => response,
                Err(TransportError::NoResponse(msg)) => {
                    tracing::warn!(request_id = %request_id, error = %msg, "No response received");
                    return Err(ApiError::Network(msg));
                }
                Err(TransportError::Setup(msg)) => {
                    tracing::error!(request_id = %request_id, error = %msg, "Request setup failed");
                    return Err(ApiError::RequestSetup(msg));
                }
            };

            if response.is_success() {
                return Ok(ApiSuccess {
                    status: response.status,
                    data: response.body,
                });
            }

            if response.status == UNAUTHORIZED
                && !self.is_login_endpoint(&response.url)
                && !self.is_login_endpoint(&descriptor.endpoint)
            {
                if descriptor.is_retried() {
                    tracing::warn!(
                        request_id = %request_id,
                        endpoint = %descriptor.endpoint,
                        "Request rejected again after token refresh"
                    );
                    return Err(ApiError::AuthExpired {
                        status: response.status,
                        body: response.body,
                    });
                }

                tracing::info!(
                    request_id = %request_id,
                    endpoint = %descriptor.endpoint,
                    "Access token rejected, recovering"
                );
                let fresh = self.recover(token.as_deref()).await?;
                descriptor.mark_retried();
                replay_token = Some(fresh);
                continue;
            }

            tracing::warn!(
                request_id = %request_id,
                status = response.status,
                endpoint = %descriptor.endpoint,
                "API request failed"
            );
            return Err(ApiError::Server {
                status: response.status,
                body: response.body,
            });
        }
    }

    /// Sign in and persist the issued credential pair
    pub async fn login(&self, credentials: &LoginRequest) -> Result<CredentialPair> {
        let body = serde_json::to_value(credentials)
            .map_err(|e| ApiError::RequestSetup(e.to_string()))?;
        let response = self
            .request(RequestDescriptor::post(self.login_path.clone(), body))
            .await?;

        let pair = parse_token_envelope(response.data.clone()).map_err(|e| {
            tracing::warn!(error = %e, "Login rejected");
            ApiError::Server {
                status: match e {
                    RefreshError::Rejected { status_code, .. } => status_code,
                    _ => response.status,
                },
                body: response.data.clone(),
            }
        })?;

        save_pair(self.store.as_ref(), &pair)
            .await
            .map_err(|e| ApiError::Storage(format!("{:#}", e)))?;
        self.coordinator.clear_issued();

        tracing::info!(
            "Signed in as {} (token: {}...)",
            credentials.username,
            token_preview(&pair.access_token)
        );
        Ok(pair)
    }

    /// Forget the stored credentials
    pub async fn logout(&self) -> Result<()> {
        self.store
            .clear()
            .await
            .map_err(|e| ApiError::Storage(format!("{:#}", e)))?;
        self.coordinator.clear_issued();
        tracing::info!("Signed out");
        Ok(())
    }

    /// Stored credential pair, if both tokens are present
    pub async fn credentials(&self) -> Result<Option<CredentialPair>> {
        load_pair(self.store.as_ref())
            .await
            .map_err(|e| ApiError::Storage(format!("{:#}", e)))
    }

    async fn stored_token(&self) -> Option<String> {
        match self.store.get(TOKEN_KEY).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read access token, sending without it");
                None
            }
        }
    }

    async fn prepare(&self, descriptor: &RequestDescriptor, token: Option<&str>) -> OutgoingRequest {
        let mut request = OutgoingRequest::new(descriptor.method, descriptor.endpoint.clone());
        request.params = descriptor.params.clone();
        request.data = descriptor.data.clone();

        request
            .headers
            .push(("Accept".to_string(), "application/json".to_string()));
        if let Some(token) = token {
            request
                .headers
                .push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        if !self.header_sources.is_empty() {
            let context = collect_headers(&self.header_sources, self.hooks.as_ref()).await;
            request.headers.extend(context);
        }

        request
    }

    /// Whether a request endpoint or response URL is the login endpoint
    ///
    /// Relative endpoints are compared with the login path, absolute URLs
    /// with the login path resolved against the transport's base URL.
    fn is_login_endpoint(&self, url: &str) -> bool {
        let target = without_query(url);
        if target == without_query(&self.login_path) {
            return true;
        }
        self.transport
            .resolve(&self.login_path)
            .is_some_and(|login_url| without_query(&login_url) == target)
    }

    /// Obtain a usable access token after a 401, refreshing at most once
    /// across all concurrent callers
    async fn recover(&self, sent_token: Option<&str>) -> Result<String> {
        match self.coordinator.enter(sent_token) {
            RefreshRole::Coalesced(token) => Ok(token),
            RefreshRole::Failed(e) => Err(e.into()),
            RefreshRole::Waiter(rx) => match rx.await {
                Ok(outcome) => outcome.map_err(ApiError::from),
                Err(_) => Err(RefreshError::Abandoned.into()),
            },
            RefreshRole::Refresher(guard) => {
                let outcome = self.refresh().await;
                if let Err(e) = &outcome {
                    self.expire_session(e).await;
                }
                guard.settle(outcome.clone());
                outcome.map_err(ApiError::from)
            }
        }
    }

    /// Exchange the stored refresh token and persist the new pair
    async fn refresh(&self) -> std::result::Result<String, RefreshError> {
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)
            .await
            .map_err(|e| RefreshError::Store(format!("{:#}", e)))?
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MissingRefreshToken)?;

        let pair =
            refresh_tokens(self.transport.as_ref(), &self.refresh_path, &refresh_token).await?;

        save_pair(self.store.as_ref(), &pair)
            .await
            .map_err(|e| RefreshError::Store(format!("{:#}", e)))?;

        tracing::debug!(
            "Stored refreshed token: {}...",
            token_preview(&pair.access_token)
        );
        Ok(pair.access_token)
    }

    async fn expire_session(&self, reason: &RefreshError) {
        tracing::error!(error = %reason, "Token refresh failed, signing out");
        if let Err(e) = self.store.clear().await {
            tracing::error!(error = %e, "Failed to clear credentials");
        }
        self.hooks.on_auth_expired();
    }
}

fn without_query(url: &str) -> &str {
    url.split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NoopHooks;

    impl SessionHooks for NoopHooks {
        fn on_auth_expired(&self) {}
    }

    /// Records requests and answers 200 with an empty object
    #[derive(Default)]
    struct EchoTransport {
        sent: Mutex<Vec<OutgoingRequest>>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            request: OutgoingRequest,
        ) -> std::result::Result<crate::transport::TransportResponse, TransportError> {
            let url = request.endpoint.clone();
            self.sent.lock().unwrap().push(request);
            Ok(crate::transport::TransportResponse {
                status: 200,
                url,
                body: serde_json::json!({}),
            })
        }
    }

    fn client_with(transport: Arc<EchoTransport>) -> AuthenticatedRequestClient {
        AuthenticatedRequestClient::new(
            transport,
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(NoopHooks),
        )
    }

    fn reqwest_client(base_url: &str) -> AuthenticatedRequestClient {
        let transport = ReqwestTransport::new(base_url, 1, 5, 5).unwrap();
        AuthenticatedRequestClient::new(
            Arc::new(transport),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(NoopHooks),
        )
    }

    #[test]
    fn test_login_endpoint_matching() {
        let client = reqwest_client("https://api.example.test/v1");
        assert!(client.is_login_endpoint("/auth/login"));
        assert!(client.is_login_endpoint("auth/login/"));
        assert!(client.is_login_endpoint("https://api.example.test/v1/auth/login"));
        assert!(client.is_login_endpoint("https://api.example.test/v1/auth/login/?next=1"));
        assert!(!client.is_login_endpoint("https://api.example.test/v1/auth/refresh-token"));
        assert!(!client.is_login_endpoint("/cases"));
    }

    #[test]
    fn test_login_endpoint_is_not_a_suffix_match() {
        let client = reqwest_client("https://api.example.test/v1").with_login_path("/login");
        assert!(client.is_login_endpoint("/login"));
        assert!(client.is_login_endpoint("https://api.example.test/v1/login"));
        assert!(!client.is_login_endpoint("/admin/login"));
        assert!(!client.is_login_endpoint("/v2/ops/login"));
        assert!(!client.is_login_endpoint("https://api.example.test/v1/admin/login"));
    }

    #[test]
    fn test_login_endpoint_without_resolvable_base() {
        let client = client_with(Arc::new(EchoTransport::default()));
        assert!(client.is_login_endpoint("/auth/login?next=1"));
        assert!(!client.is_login_endpoint("/staff/auth/login"));
    }

    #[tokio::test]
    async fn test_no_authorization_without_token() {
        let transport = Arc::new(EchoTransport::default());
        let client = client_with(transport.clone());

        client.request(RequestDescriptor::get("/cases")).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].header("Authorization"), None);
        assert_eq!(sent[0].header("Accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_absent_params_and_data_are_omitted() {
        let transport = Arc::new(EchoTransport::default());
        let client = client_with(transport.clone());

        client.request(RequestDescriptor::delete("/drafts/9")).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].params, None);
        assert_eq!(sent[0].data, None);
    }

    #[tokio::test]
    async fn test_mobile_headers_do_not_block_requests() {
        let transport = Arc::new(EchoTransport::default());
        let client = client_with(transport.clone())
            .with_header_source(LocaleSource::new(Some("en_GB.UTF-8".to_string())))
            .with_header_source(LocationSource::new(None));

        let result = client.request(RequestDescriptor::get("/notifications")).await;
        assert!(result.is_ok());

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].header("Accept-Language"), Some("en-GB"));
        assert_eq!(sent[0].header("X-Location"), None);
    }
}
