//! The API client: profile selection, identity refresh and server
//! discovery.

use crate::auth::{self, IssuedToken};
use crate::config::{ApiInfo, AuthInfo, Config, Server};
use crate::errors::{Error, Result};
use crate::request::{Dispatcher, HttpDispatcher, Parameter, Request, WarningHandler};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Default lifetime requested when exchanging an access token.
pub const DEFAULT_EXCHANGE_TTL: Duration = Duration::from_secs(30 * 60);

/// Callback invoked with a configuration snapshot whenever the client
/// changes it, typically to persist it back to disk.
pub type UpdateHandler = Arc<dyn Fn(&Config) -> Result<()> + Send + Sync>;

struct ClientInner {
    config: RwLock<Config>,
    update_handler: Option<UpdateHandler>,
    warning_handler: Option<WarningHandler>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    // serializes identity refreshes so concurrent requests don't all
    // hit the token endpoint
    refresh_gate: Mutex<()>,
}

/// A handle to the API. Cheap to clone; clones share configuration and
/// refreshed credentials.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    profile: Option<String>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: Config,
    profile: Option<String>,
    update_handler: Option<UpdateHandler>,
    warning_handler: Option<WarningHandler>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl ClientBuilder {
    /// Starts a builder from the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            profile: None,
            update_handler: None,
            warning_handler: None,
            dispatcher: None,
        }
    }

    /// Uses the named profile instead of the configuration's current
    /// one.
    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile = Some(name.into());
        self
    }

    /// Invoked whenever the client updates the configuration.
    pub fn update_handler(mut self, handler: UpdateHandler) -> Self {
        self.update_handler = Some(handler);
        self
    }

    /// Default handler for response warnings on mutating requests.
    pub fn warning_handler(mut self, handler: WarningHandler) -> Self {
        self.warning_handler = Some(handler);
        self
    }

    /// Overrides the transport, mostly useful for fakes in tests.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config: RwLock::new(self.config),
                update_handler: self.update_handler,
                warning_handler: self.warning_handler,
                dispatcher: self.dispatcher,
                refresh_gate: Mutex::new(()),
            }),
            profile: self.profile,
        }
    }
}

impl Client {
    /// Creates a client with default options.
    pub fn new(config: Config) -> Self {
        ClientBuilder::new(config).build()
    }

    /// Returns a client bound to the named profile, sharing state with
    /// this one.
    pub fn override_profile(&self, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            profile: Some(name.into()),
        }
    }

    /// Returns the name of the profile in use.
    pub async fn current_profile(&self) -> String {
        match &self.profile {
            Some(profile) => profile.clone(),
            None => self.inner.config.read().await.current_profile.clone(),
        }
    }

    /// Returns a snapshot of the configuration.
    pub async fn config(&self) -> Config {
        self.inner.config.read().await.clone()
    }

    /// Starts a new request session.
    pub async fn request(&self) -> Request {
        Request::new(
            self.clone(),
            self.current_profile().await,
            self.inner.warning_handler.clone(),
        )
    }

    /// Refreshes the identity token of the current profile, either by
    /// token exchange or by the refresh-token flow, and notifies the
    /// update handler.
    pub async fn refresh_identity(&self) -> Result<()> {
        let _gate = self.inner.refresh_gate.lock().await;

        self.do_refresh().await
    }

    /// Refreshes the identity only when its access token has expired.
    /// Callers queued behind an in-flight refresh pick up its result
    /// instead of refreshing again.
    pub(crate) fn refresh_identity_boxed(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let _gate = self.inner.refresh_gate.lock().await;

            let profile = self.current_profile().await;
            if let Some(identity) = self.auth_info(&profile).await.and_then(|a| a.identity) {
                if !identity.is_expired()? {
                    return Ok(());
                }
            }

            self.do_refresh().await
        })
    }

    async fn do_refresh(&self) -> Result<()> {
        let profile = self.current_profile().await;
        let auth = self.auth_info(&profile).await.ok_or_else(|| {
            Error::invalid_profile(&profile, "missing authentication profile")
        })?;
        let identity = auth
            .identity
            .ok_or_else(|| Error::InvalidOperation("no token available to refresh".to_string()))?;

        let token = if identity.is_exchange_token() {
            tracing::debug!("refreshing access token via token exchange");
            self.exchange_access_token(&identity.refresh_token, DEFAULT_EXCHANGE_TTL)
                .await?
        } else if !identity.refresh_token.is_empty() {
            tracing::debug!("refreshing identity token");
            self.refresh_identity_token(&identity.refresh_token).await?
        } else {
            return Err(Error::NoRefreshToken);
        };

        let snapshot = {
            let mut cfg = self.inner.config.write().await;
            if let Some(auth) = cfg.get_auth_info_mut(&profile) {
                if let Some(identity) = auth.identity.as_mut() {
                    identity.token = token;
                }
            }
            cfg.clone()
        };

        self.handle_configuration_update(&snapshot)
    }

    /// Exchanges a refresh token for a new access token via the login
    /// endpoint.
    pub async fn refresh_identity_token(&self, refresh: &str) -> Result<String> {
        let payload = IssuedToken {
            token: String::new(),
            refresh_token: refresh.to_string(),
        };

        let mut req = self.request().await;
        let issued: IssuedToken = req
            .authorization(refresh)
            .endpoint("/login/token")
            .payload(&payload)
            .post()
            .await
            .json()?;

        Ok(issued.token)
    }

    /// Exchanges an exchange-scoped access token for an API token valid
    /// for the requested lifetime.
    pub async fn exchange_access_token(&self, exchange: &str, ttl: Duration) -> Result<String> {
        if !auth::is_exchange_token(exchange)? {
            return Err(Error::NonExchangeToken);
        }

        let mut req = self.request().await;
        let result = req
            .authorization(exchange)
            .endpoint("/exchange")
            .parameters([Parameter::query("ttl", format_ttl(ttl))])
            .post()
            .await
            .json::<IssuedToken>();

        match result {
            Ok(issued) => Ok(issued.token),
            Err(e) => Err(Error::TokenExchange(Box::new(e))),
        }
    }

    /// Discovers the API surface layout of the current profile's server
    /// and caches it on the server entry. A 404 means a pre-discovery
    /// server, which gets the legacy non-resource base path.
    pub async fn check_server(&self, force: bool, save_profile: bool) -> Result<()> {
        let profile = self.current_profile().await;

        {
            let cfg = self.inner.config.read().await;
            let prof = cfg.get_profile(&profile).ok_or(Error::MissingProfile)?;
            let server = cfg.servers.get(&prof.server).ok_or(Error::MissingProfile)?;
            if !force && server.api_info.is_some() {
                return Ok(());
            }
        }

        let mut req = self.request().await;
        let api_info = match req
            .raw_endpoint("/apiinfo")
            .unauthenticated()
            .get()
            .await
            .json::<ApiInfo>()
        {
            Ok(info) => info,
            Err(e) if e.is_not_found() => ApiInfo {
                non_resource_api: "/api/v1alpha1".to_string(),
                ..Default::default()
            },
            Err(e) => return Err(e),
        };

        let snapshot = {
            let mut cfg = self.inner.config.write().await;
            let server_name = cfg
                .get_profile(&profile)
                .ok_or(Error::MissingProfile)?
                .server
                .clone();
            if let Some(server) = cfg.servers.get_mut(&server_name) {
                server.api_info = Some(api_info);
            }
            cfg.clone()
        };

        if save_profile {
            return self.handle_configuration_update(&snapshot);
        }

        Ok(())
    }

    /// Resolves and validates the server of the given profile.
    pub(crate) async fn server(&self, profile: &str) -> Result<Server> {
        let cfg = self.inner.config.read().await;

        let prof = cfg.get_profile(profile).ok_or(Error::MissingProfile)?;
        let server = cfg
            .servers
            .get(&prof.server)
            .ok_or_else(|| Error::invalid_profile(profile, "missing profile server"))?;

        if server.endpoint.is_empty() {
            return Err(Error::invalid_profile(profile, "missing endpoint"));
        }

        Ok(server.clone())
    }

    pub(crate) async fn auth_info(&self, profile: &str) -> Option<AuthInfo> {
        self.inner.config.read().await.get_auth_info(profile).cloned()
    }

    pub(crate) fn dispatcher(&self, server: &Server, follow: bool) -> Result<Arc<dyn Dispatcher>> {
        match &self.inner.dispatcher {
            Some(dispatcher) => Ok(Arc::clone(dispatcher)),
            None => Ok(Arc::new(HttpDispatcher::new(
                &server.ca_certificate,
                follow,
            )?)),
        }
    }

    fn handle_configuration_update(&self, config: &Config) -> Result<()> {
        match &self.inner.update_handler {
            Some(handler) => handler(config),
            None => Ok(()),
        }
    }
}

fn format_ttl(ttl: Duration) -> String {
    format!("{}m", ttl.as_secs() / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_profiles() -> Config {
        let mut cfg = Config::new_empty();
        cfg.current_profile = "main".to_string();
        cfg.create_profile("main", "https://api.example.com");
        cfg.create_profile("other", "https://other.example.com");
        cfg
    }

    #[tokio::test]
    async fn test_current_profile_and_override() {
        let client = Client::new(config_with_profiles());
        assert_eq!(client.current_profile().await, "main");

        let other = client.override_profile("other");
        assert_eq!(other.current_profile().await, "other");
        // the original client is unaffected
        assert_eq!(client.current_profile().await, "main");
    }

    #[tokio::test]
    async fn test_server_resolution() {
        let client = Client::new(config_with_profiles());

        let server = client.server("main").await.unwrap();
        assert_eq!(server.endpoint, "https://api.example.com");

        let err = client.server("missing").await.unwrap_err();
        assert!(matches!(err, Error::MissingProfile));
    }

    #[tokio::test]
    async fn test_server_requires_endpoint() {
        let mut cfg = config_with_profiles();
        cfg.servers.get_mut("main").unwrap().endpoint = String::new();

        let client = Client::new(cfg);
        let err = client.server("main").await.unwrap_err();
        assert!(err.to_string().contains("missing endpoint"));
    }

    #[test]
    fn test_format_ttl() {
        assert_eq!(format_ttl(DEFAULT_EXCHANGE_TTL), "30m");
        assert_eq!(format_ttl(Duration::from_secs(3600)), "60m");
    }
}
