use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to load configuration: {0}")]
    Load(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `SameSite` attribute applied to session cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    #[default]
    Lax,
    Strict,
    None,
}

/// One protected (or whitelisted) path prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    pub uri: String,
    pub methods: Vec<String>,
    pub roles: Vec<String>,
    pub headers: HashMap<String, String>,
    pub whitelisted: bool,
    pub audit: bool,
}

/// Validated configuration snapshot. Loaded once at startup, immutable
/// afterwards, and shared by reference into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the proxy listens on.
    pub listen: String,
    /// Upstream service requests are forwarded to.
    pub upstream_url: String,
    /// OIDC issuer (discovery) URL.
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Scopes requested on top of `openid`.
    pub scopes: Vec<String>,
    /// Public base URL of this proxy, used for the callback redirect URI and
    /// the `Secure` cookie flag.
    pub redirection_url: String,
    /// AES key for refresh-token encryption; 16, 24 or 32 bytes.
    pub encryption_key: String,
    pub enable_refresh_tokens: bool,
    /// Expose `POST /oauth/login` (resource-owner password grant).
    pub enable_login_handler: bool,
    /// Expose `GET /oauth/token` (access-token claims, for debugging).
    pub enable_token_handler: bool,
    /// Refresh-token store selector (`memory://…`); unset keeps the token in
    /// the `kc-state` cookie.
    pub store_url: Option<String>,
    pub cookie_domain: Option<String>,
    pub secure_cookie: bool,
    pub same_site_cookie: SameSitePolicy,
    /// Access tokens expiring within this window are refreshed proactively.
    #[serde(with = "humantime_serde")]
    pub refresh_skew: Duration,
    /// Deadline for calls to the provider, the store and the upstream.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Parse tokens without verifying signatures. Development only.
    pub skip_token_verification: bool,
    /// Forbid requests that match no resource rule.
    pub default_deny: bool,
    /// Cookie lifetime for refresh tokens that are opaque (carry no expiry).
    #[serde(with = "humantime_serde")]
    pub refresh_cookie_duration: Duration,
    /// Upper bound on accepted token sizes.
    pub max_token_bytes: usize,
    pub resources: Vec<Resource>,
    pub cors_origins: Vec<String>,
    pub cors_methods: Vec<String>,
    pub cors_headers: Vec<String>,
    pub cors_max_age: Option<usize>,
    /// Override for the provider's revocation endpoint.
    pub revocation_endpoint: Option<String>,
    /// Custom sign-in page served by `/oauth/authorize`.
    pub sign_in_page: Option<String>,
    /// Custom page served with 403 responses to browsers.
    pub forbidden_page: Option<String>,
    /// Tags substituted into the custom pages.
    pub tags: HashMap<String, String>,
    /// Recognized for deployment compatibility; metrics exposition itself is
    /// delegated to the surrounding infrastructure.
    pub localhost_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_owned(),
            upstream_url: String::new(),
            discovery_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            redirection_url: String::new(),
            encryption_key: String::new(),
            enable_refresh_tokens: false,
            enable_login_handler: false,
            enable_token_handler: false,
            store_url: None,
            cookie_domain: None,
            secure_cookie: false,
            same_site_cookie: SameSitePolicy::default(),
            refresh_skew: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            skip_token_verification: false,
            default_deny: false,
            refresh_cookie_duration: Duration::from_secs(240 * 60 * 60),
            max_token_bytes: 16 * 1024,
            resources: Vec::new(),
            cors_origins: Vec::new(),
            cors_methods: Vec::new(),
            cors_headers: Vec::new(),
            cors_max_age: None,
            revocation_endpoint: None,
            sign_in_page: None,
            forbidden_page: None,
            tags: HashMap::new(),
            localhost_metrics: false,
        }
    }
}

impl Config {
    /// Load from a YAML file (when given) overlaid with `AUTH_PROXY_*`
    /// environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("AUTH_PROXY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|err| ConfigError::Load(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid(format!("listen address: {err}")))?;

        for (name, value) in [
            ("upstream_url", &self.upstream_url),
            ("discovery_url", &self.discovery_url),
            ("redirection_url", &self.redirection_url),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is required")));
            }
            Url::parse(value).map_err(|err| ConfigError::Invalid(format!("{name}: {err}")))?;
        }

        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("client_id is required".to_owned()));
        }

        if self.enable_refresh_tokens && !matches!(self.encryption_key.len(), 16 | 24 | 32) {
            return Err(ConfigError::Invalid(
                "encryption_key must be 16, 24 or 32 bytes".to_owned(),
            ));
        }

        if let Some(store_url) = &self.store_url {
            let parsed = Url::parse(store_url)
                .map_err(|err| ConfigError::Invalid(format!("store_url: {err}")))?;
            if parsed.scheme() != "memory" {
                return Err(ConfigError::Invalid(format!(
                    "store_url scheme {:?} is not supported",
                    parsed.scheme()
                )));
            }
        }

        for resource in &self.resources {
            if !resource.uri.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "resource uri {:?} must start with '/'",
                    resource.uri
                )));
            }
            for method in &resource.methods {
                if actix_web::http::Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "resource {} lists invalid method {:?}",
                        resource.uri, method
                    )));
                }
            }
        }

        Ok(())
    }
}
