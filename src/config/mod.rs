//! Client configuration: profiles, servers and credentials.
//!
//! The configuration is a YAML profile store on disk, or an ephemeral
//! in-memory store synthesized from environment variables (largely used
//! for CI).

use crate::auth;
use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Environment variable holding the server URL for ephemeral configs.
pub const ENV_WAYFINDER_SERVER: &str = "WAYFINDER_SERVER";
/// Environment variable holding the token for ephemeral configs.
pub const ENV_WAYFINDER_TOKEN: &str = "WAYFINDER_TOKEN";
/// Environment variable holding the default workspace for ephemeral
/// configs.
pub const ENV_WAYFINDER_WORKSPACE: &str = "WAYFINDER_WORKSPACE";
/// Environment variable overriding the configuration file path.
pub const ENV_WAYFINDER_CONFIG: &str = "WAYFINDER_CONFIG";

const DEFAULT_NON_RESOURCE_API: &str = "/api/v2";
const DEFAULT_RESOURCE_API: &str = "/resources";
const DEFAULT_KUBE_PROXY_API: &str = "/kubeproxy";

/// Base paths for the different API surfaces of a server, as returned
/// from the unauthenticated `/apiinfo` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Base path for the non-resource API (login, exchange and friends).
    #[serde(rename = "nonResourceAPI", default, skip_serializing_if = "String::is_empty")]
    pub non_resource_api: String,
    /// Base path for the resource API.
    #[serde(rename = "resourceAPI", default, skip_serializing_if = "String::is_empty")]
    pub resource_api: String,
    /// Base path for the kube proxy API.
    #[serde(rename = "kubeProxyAPI", default, skip_serializing_if = "String::is_empty")]
    pub kube_proxy_api: String,
}

/// An API server endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// URL of the API endpoint.
    #[serde(rename = "server", default)]
    pub endpoint: String,
    /// CA bundle used to verify a self-signed API.
    #[serde(rename = "caCertificate", default, skip_serializing_if = "String::is_empty")]
    pub ca_certificate: String,
    /// Cached API surface metadata, lazily populated on first use.
    #[serde(rename = "apiInfo", default, skip_serializing_if = "Option::is_none")]
    pub api_info: Option<ApiInfo>,
}

impl Server {
    /// Returns the cached API info, or the hard-coded defaults which
    /// work with v2.4+ servers.
    pub fn api_info(&self) -> ApiInfo {
        match &self.api_info {
            Some(info) => info.clone(),
            None => ApiInfo {
                non_resource_api: DEFAULT_NON_RESOURCE_API.to_string(),
                resource_api: DEFAULT_RESOURCE_API.to_string(),
                kube_proxy_api: DEFAULT_KUBE_PROXY_API.to_string(),
            },
        }
    }
}

/// A refreshable identity: an access token paired with a refresh or
/// exchange token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The refresh token issued by the service, or an exchange-scoped
    /// token.
    #[serde(rename = "refresh-token", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    /// The access token issued by the service.
    #[serde(rename = "token", default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl Identity {
    /// Checks if the refresh token is scoped for token exchange.
    pub fn is_exchange_token(&self) -> bool {
        auth::is_exchange_token(&self.refresh_token).unwrap_or(false)
    }

    /// Checks if this identity represents an access token user.
    pub fn is_access_token(&self) -> bool {
        self.is_exchange_token() || auth::is_access_token(&self.token).unwrap_or(false)
    }

    /// Checks if the access token is expired.
    pub fn is_expired(&self) -> Result<bool> {
        auth::is_token_expired(&self.token)
    }
}

/// A credential to the API endpoint: exactly one of the fields is
/// populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// A refreshable identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// A static token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A profile links an endpoint and a credential together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Name of the credentials to use.
    #[serde(rename = "user", default)]
    pub auth_info: String,
    /// Name of the server config to use.
    #[serde(default)]
    pub server: String,
    /// Default workspace for this profile.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
}

/// The client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Credentials, keyed by name.
    #[serde(rename = "users", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_infos: BTreeMap<String, AuthInfo>,
    /// The profile in use at the moment.
    #[serde(rename = "current-profile", default, skip_serializing_if = "String::is_empty")]
    pub current_profile: String,
    /// Profiles, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, Profile>,
    /// API endpoints, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers: BTreeMap<String, Server>,
    /// Version of the configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl Config {
    /// Returns an empty configuration.
    pub fn new_empty() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// Decodes a configuration from a YAML reader.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_yaml::from_reader(reader).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration from the given file path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_reader(file)
    }

    /// Writes the configuration to the given file path, creating parent
    /// directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::Config(e.to_string()))?;
        }
        let data = serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| Error::Config(e.to_string()))?;

        // the file carries tokens, keep it out of reach of other users
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640));
        }

        Ok(())
    }

    /// Returns the ephemeral configuration from environment variables if
    /// provided, or loads the configured file - creating it if it does
    /// not exist.
    pub fn from_env_or_file() -> Result<Self> {
        if Self::is_ephemeral() {
            return Ok(Self::from_env());
        }

        let path = Self::default_path();
        tracing::debug!(path = %path.display(), "using wayfinder configuration file");

        if !path.is_file() {
            let empty = Self::new_empty();
            empty.save(&path)?;
            return Ok(empty);
        }

        Self::from_path(path)
    }

    /// Checks whether the environment provides an ephemeral
    /// configuration.
    pub fn is_ephemeral() -> bool {
        std::env::var(ENV_WAYFINDER_SERVER).map(|v| !v.is_empty()).unwrap_or(false)
            && std::env::var(ENV_WAYFINDER_TOKEN).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Synthesizes a single-profile configuration from the environment
    /// variables. The token is inspected: an exchange-scoped token is
    /// stored as the refresh token, anything else as the access token.
    pub fn from_env() -> Self {
        let name = "default";
        let server = std::env::var(ENV_WAYFINDER_SERVER).unwrap_or_default();
        let token = std::env::var(ENV_WAYFINDER_TOKEN).unwrap_or_default();

        let mut identity = Identity::default();
        if auth::is_exchange_token(&token).unwrap_or(false) {
            identity.refresh_token = token;
        } else {
            identity.token = token;
        }

        let mut cfg = Self::new_empty();
        cfg.current_profile = name.to_string();
        cfg.create_profile(name, &server);
        cfg.add_auth_info(
            name,
            AuthInfo {
                identity: Some(identity),
                token: None,
            },
        );

        if let Ok(workspace) = std::env::var(ENV_WAYFINDER_WORKSPACE) {
            if !workspace.is_empty() {
                if let Some(profile) = cfg.profiles.get_mut(name) {
                    profile.workspace = workspace;
                }
            }
        }

        cfg
    }

    /// Returns the path of the configuration file: the
    /// `WAYFINDER_CONFIG` override or `~/.wayfinder/config`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(ENV_WAYFINDER_CONFIG) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".wayfinder").join("config")
    }

    /// Creates a profile with a same-named server entry.
    pub fn create_profile(&mut self, name: &str, endpoint: &str) {
        self.add_profile(
            name,
            Profile {
                server: name.to_string(),
                auth_info: name.to_string(),
                workspace: String::new(),
            },
        );
        self.add_server(
            name,
            Server {
                endpoint: endpoint.to_string(),
                ..Default::default()
            },
        );
    }

    /// Creates a profile with the given credentials, failing if the name
    /// is already in use.
    pub fn new_profile_with_auth(&mut self, name: &str, endpoint: &str, auth: AuthInfo) -> Result<()> {
        if self.has_profile(name) {
            return Err(Error::Config("profile name already in use".to_string()));
        }

        self.create_profile(name, endpoint);
        self.add_auth_info(name, auth);

        Ok(())
    }

    /// Adds a profile to the config.
    pub fn add_profile(&mut self, name: &str, profile: Profile) {
        self.profiles.insert(name.to_string(), profile);
    }

    /// Adds a server, trimming any trailing slash from the endpoint.
    pub fn add_server(&mut self, name: &str, mut server: Server) {
        server.endpoint = server.endpoint.trim_end_matches('/').to_string();
        self.servers.insert(name.to_string(), server);
    }

    /// Adds a credential.
    pub fn add_auth_info(&mut self, name: &str, auth: AuthInfo) {
        self.auth_infos.insert(name.to_string(), auth);
    }

    /// Checks if the profile exists.
    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Checks if the server exists.
    pub fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// Checks if the credential exists.
    pub fn has_auth_info(&self, name: &str) -> bool {
        self.auth_infos.contains_key(name)
    }

    /// Returns the profile names.
    pub fn list_profiles(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Returns the named profile, if present.
    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Returns the server for the named profile, if present.
    pub fn get_server(&self, profile: &str) -> Option<&Server> {
        let profile = self.profiles.get(profile)?;
        self.servers.get(&profile.server)
    }

    /// Returns the credentials for the named profile, if present.
    pub fn get_auth_info(&self, profile: &str) -> Option<&AuthInfo> {
        let profile = self.profiles.get(profile)?;
        self.auth_infos.get(&profile.auth_info)
    }

    /// Returns mutable credentials for the named profile, if present.
    pub fn get_auth_info_mut(&mut self, profile: &str) -> Option<&mut AuthInfo> {
        let auth_name = self.profiles.get(profile)?.auth_info.clone();
        self.auth_infos.get_mut(&auth_name)
    }

    /// Returns the method of authentication for a profile: `token`,
    /// `idtoken` or `none`.
    pub fn profile_auth_method(&self, name: &str) -> &'static str {
        match self.get_auth_info(name) {
            Some(AuthInfo { token: Some(_), .. }) => "token",
            Some(AuthInfo {
                identity: Some(_), ..
            }) => "idtoken",
            _ => "none",
        }
    }

    /// Checks if auth is configured for the profile.
    pub fn has_auth(&self, name: &str) -> bool {
        matches!(
            self.get_auth_info(name),
            Some(AuthInfo { token: Some(_), .. })
                | Some(AuthInfo {
                    identity: Some(_),
                    ..
                })
        )
    }

    /// Checks if the current profile is for an access token user.
    pub fn is_access_token(&self) -> bool {
        self.get_auth_info(&self.current_profile)
            .and_then(|a| a.identity.as_ref())
            .map(Identity::is_access_token)
            .unwrap_or(false)
    }

    /// Removes the profile along with its linked server and credential.
    pub fn remove_profile(&mut self, name: &str) {
        if let Some(profile) = self.profiles.remove(name) {
            self.servers.remove(&profile.server);
            self.auth_infos.remove(&profile.auth_info);
        }
    }
}
