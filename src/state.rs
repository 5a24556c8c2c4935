use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use thiserror::Error;

use crate::access::AccessEngine;
use crate::config::{Config, ConfigError};
use crate::crypto::{CipherError, SecretCipher};
use crate::jwks::JwksCache;
use crate::oidc::{OidcError, OidcFlows, OidcProvider};
use crate::refresh::RefreshCoordinator;
use crate::store::{self, RefreshStore, StoreError};
use crate::worker::BackgroundQueue;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] OidcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("unable to load page {path}: {source}")]
    Page {
        path: String,
        source: std::io::Error,
    },
}

/// Custom pages loaded once at startup.
#[derive(Default, Clone)]
pub struct Pages {
    pub sign_in: Option<String>,
    pub forbidden: Option<String>,
}

/// Everything the middleware and the `/oauth` handlers share, registered as
/// actix app data and passed around by reference.
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn OidcFlows>,
    pub jwks: Arc<JwksCache>,
    pub cipher: Option<Arc<SecretCipher>>,
    pub store: Option<Arc<dyn RefreshStore>>,
    pub refresher: RefreshCoordinator,
    pub engine: AccessEngine,
    pub queue: BackgroundQueue,
    pub pages: Pages,
}

impl AppState {
    /// Validate the config, discover the provider and assemble the shared
    /// state. Returns the background worker handle so shutdown can drain it.
    pub async fn bootstrap(
        config: Config,
    ) -> Result<(Self, actix_web::rt::task::JoinHandle<()>), BootstrapError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| OidcError::Configuration(err.to_string()))?;

        let provider = OidcProvider::discover(&config).await?;
        let jwks = Arc::new(JwksCache::new(http, provider.jwks_uri().to_owned()));
        if !config.skip_token_verification {
            if let Err(err) = jwks.refresh().await {
                log::warn!(
                    "initial JWKS fetch failed: {}; verification recovers on the next rotation",
                    err
                );
            }
        }
        let provider: Arc<dyn OidcFlows> = Arc::new(provider);

        let store = match &config.store_url {
            Some(url) => Some(store::from_url(url)?),
            None => None,
        };

        let cipher = if config.encryption_key.is_empty() {
            None
        } else {
            Some(Arc::new(SecretCipher::new(config.encryption_key.as_bytes())?))
        };

        let pages = Pages {
            sign_in: load_page(config.sign_in_page.as_deref())?,
            forbidden: load_page(config.forbidden_page.as_deref())?,
        };

        let engine = AccessEngine::new(&config);
        let (queue, worker) = BackgroundQueue::start(provider.clone(), store.clone());

        Ok((
            Self {
                config: Arc::new(config),
                provider,
                jwks,
                cipher,
                store,
                refresher: RefreshCoordinator::new(),
                engine,
                queue,
                pages,
            },
            worker,
        ))
    }
}

fn load_page(path: Option<&str>) -> Result<Option<String>, BootstrapError> {
    match path {
        Some(path) => fs::read_to_string(path)
            .map(Some)
            .map_err(|source| BootstrapError::Page {
                path: path.to_owned(),
                source,
            }),
        None => Ok(None),
    }
}

/// Substitute `{{ key }}` tags in a custom page.
pub fn render_page(template: &str, vars: &HashMap<String, String>) -> String {
    let mut rendered = template.to_owned();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{ {key} }}}}"), value);
    }
    rendered
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Assemble an [`AppState`] around a mocked provider and a fixture key
    /// set; fields can be adjusted afterwards through the returned value.
    pub fn state_with(
        config: Config,
        provider: Arc<dyn OidcFlows>,
        jwks: Arc<JwksCache>,
    ) -> AppState {
        let cipher = if config.encryption_key.is_empty() {
            None
        } else {
            Some(Arc::new(
                SecretCipher::new(config.encryption_key.as_bytes()).unwrap(),
            ))
        };
        let engine = AccessEngine::new(&config);
        let (queue, _worker) = BackgroundQueue::start(provider.clone(), None);
        AppState {
            config: Arc::new(config),
            provider,
            jwks,
            cipher,
            store: None,
            refresher: RefreshCoordinator::new(),
            engine,
            queue,
            pages: Pages::default(),
        }
    }
}
