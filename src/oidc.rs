use std::time::Duration;

use async_trait::async_trait;
use oauth2::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, RefreshToken, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, Scope,
};
use openidconnect::core::{
    CoreAuthDisplay, CoreAuthenticationFlow, CoreClaimName, CoreClaimType, CoreClient,
    CoreClientAuthMethod, CoreErrorResponseType, CoreGrantType, CoreJsonWebKey,
    CoreJsonWebKeyType, CoreJsonWebKeyUse, CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm, CoreJwsSigningAlgorithm, CoreResponseMode, CoreResponseType,
    CoreSubjectIdentifierType, CoreTokenResponse,
};
use openidconnect::{
    reqwest::async_http_client, AdditionalProviderMetadata, IssuerUrl, Nonce, OAuth2TokenResponse,
    ProviderMetadata, RedirectUrl, RevocationUrl, StandardErrorResponse,
    TokenResponse as OpenIdTokenResponse,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::Config;

const DISCOVERY_ATTEMPTS: u32 = 5;
const DISCOVERY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum OidcError {
    #[error("provider discovery failed: {0}")]
    Discovery(String),
    #[error("token exchange rejected: {0}")]
    Exchange(String),
    #[error("credentials rejected by provider")]
    InvalidGrant,
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider configuration invalid: {0}")]
    Configuration(String),
}

/// Fields the core discovery document type drops but this proxy needs:
/// where to revoke refresh tokens and where to end provider sessions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GateExtraMetadata {
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

impl AdditionalProviderMetadata for GateExtraMetadata {}

type GateProviderMetadata = ProviderMetadata<
    GateExtraMetadata,
    CoreAuthDisplay,
    CoreClientAuthMethod,
    CoreClaimName,
    CoreClaimType,
    CoreGrantType,
    CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm,
    CoreJwsSigningAlgorithm,
    CoreJsonWebKeyType,
    CoreJsonWebKeyUse,
    CoreJsonWebKey,
    CoreResponseMode,
    CoreResponseType,
    CoreSubjectIdentifierType,
>;

/// Token endpoint response as consumed by the cookie manager, the flow
/// handlers and the refresh coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<CoreTokenResponse> for TokenPair {
    fn from(response: CoreTokenResponse) -> Self {
        // Id tokens serialize to their compact JWT form.
        let id_token = response
            .id_token()
            .and_then(|token| serde_json::to_value(token).ok())
            .and_then(|value| value.as_str().map(str::to_owned));
        Self {
            access_token: response.access_token().secret().clone(),
            id_token,
            refresh_token: response.refresh_token().map(|token| token.secret().clone()),
            expires_in: response.expires_in().map(|d| d.as_secs()),
            scope: response.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|scope| scope.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        }
    }
}

/// The provider operations the rest of the proxy depends on. A trait so the
/// middleware, coordinator and handlers can be exercised against a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OidcFlows: Send + Sync {
    /// Authorization endpoint URL carrying the given `state`, a fresh nonce
    /// and the configured scopes.
    fn authorization_url(&self, state: &str) -> Url;

    async fn exchange_code(&self, code: &str) -> Result<TokenPair, OidcError>;

    async fn password_grant(&self, username: &str, password: &str)
        -> Result<TokenPair, OidcError>;

    async fn refresh_exchange(&self, refresh_token: &str) -> Result<TokenPair, OidcError>;

    /// Best-effort revocation; failures are logged and swallowed.
    async fn revoke(&self, token: &str);

    fn end_session_endpoint(&self) -> Option<String>;
}

pub struct OidcProvider {
    client: CoreClient,
    scopes: Vec<Scope>,
    jwks_uri: String,
    end_session_endpoint: Option<String>,
}

impl OidcProvider {
    /// Run discovery against the configured issuer and build the relying
    /// party client. Transient failures are retried with exponential backoff
    /// and become fatal once the attempt budget is spent.
    pub async fn discover(config: &Config) -> Result<Self, OidcError> {
        let issuer = config
            .discovery_url
            .trim_end_matches("/.well-known/openid-configuration")
            .trim_end_matches('/');
        let issuer = IssuerUrl::new(issuer.to_owned())
            .map_err(|err| OidcError::Configuration(err.to_string()))?;

        let metadata = discover_with_backoff(issuer).await?;

        let jwks_uri = metadata.jwks_uri().url().to_string();
        let end_session_endpoint = metadata.additional_metadata().end_session_endpoint.clone();
        let revocation_endpoint = config
            .revocation_endpoint
            .clone()
            .or_else(|| metadata.additional_metadata().revocation_endpoint.clone())
            .or_else(|| end_session_endpoint.clone());

        let redirect = RedirectUrl::new(format!(
            "{}/oauth/callback",
            config.redirection_url.trim_end_matches('/')
        ))
        .map_err(|err| OidcError::Configuration(err.to_string()))?;

        let mut client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
        )
        .set_redirect_uri(redirect);

        if let Some(endpoint) = revocation_endpoint {
            client = client.set_revocation_uri(
                RevocationUrl::new(endpoint)
                    .map_err(|err| OidcError::Configuration(err.to_string()))?,
            );
        }

        Ok(Self {
            client,
            scopes: scopes_with_openid(&config.scopes),
            jwks_uri,
            end_session_endpoint,
        })
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }
}

async fn discover_with_backoff(issuer: IssuerUrl) -> Result<GateProviderMetadata, OidcError> {
    let mut delay = DISCOVERY_BASE_DELAY;
    for attempt in 1..=DISCOVERY_ATTEMPTS {
        match GateProviderMetadata::discover_async(issuer.clone(), async_http_client).await {
            Ok(metadata) => return Ok(metadata),
            Err(err) if attempt < DISCOVERY_ATTEMPTS => {
                log::warn!(
                    "provider discovery attempt {} failed: {}; retrying in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(OidcError::Discovery(err.to_string())),
        }
    }
    Err(OidcError::Discovery("discovery attempts exhausted".into()))
}

fn scopes_with_openid(configured: &[String]) -> Vec<Scope> {
    let mut scopes: Vec<Scope> = configured.iter().cloned().map(Scope::new).collect();
    if !configured.iter().any(|scope| scope == "openid") {
        scopes.push(Scope::new("openid".to_owned()));
    }
    scopes
}

fn map_token_error<RE: std::error::Error>(
    err: RequestTokenError<RE, StandardErrorResponse<CoreErrorResponseType>>,
    what: &str,
) -> OidcError {
    match err {
        RequestTokenError::ServerResponse(response)
            if *response.error() == CoreErrorResponseType::InvalidGrant =>
        {
            OidcError::InvalidGrant
        }
        RequestTokenError::ServerResponse(response) => {
            OidcError::Exchange(format!("{what}: {:?}", response.error()))
        }
        RequestTokenError::Request(err) => OidcError::Transport(err.to_string()),
        RequestTokenError::Parse(err, _) => OidcError::Exchange(format!("{what}: {err}")),
        RequestTokenError::Other(err) => OidcError::Exchange(format!("{what}: {err}")),
    }
}

#[async_trait]
impl OidcFlows for OidcProvider {
    fn authorization_url(&self, state: &str) -> Url {
        let state = state.to_owned();
        let (url, _, _) = self
            .client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                move || CsrfToken::new(state),
                Nonce::new_random,
            )
            .add_scopes(self.scopes.clone())
            .url();
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenPair, OidcError> {
        self.client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(async_http_client)
            .await
            .map(TokenPair::from)
            .map_err(|err| map_token_error(err, "code exchange"))
    }

    async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, OidcError> {
        self.client
            .exchange_password(
                &ResourceOwnerUsername::new(username.to_owned()),
                &ResourceOwnerPassword::new(password.to_owned()),
            )
            .add_scopes(self.scopes.clone())
            .request_async(async_http_client)
            .await
            .map(TokenPair::from)
            .map_err(|err| map_token_error(err, "password grant"))
    }

    async fn refresh_exchange(&self, refresh_token: &str) -> Result<TokenPair, OidcError> {
        self.client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_owned()))
            .request_async(async_http_client)
            .await
            .map(TokenPair::from)
            .map_err(|err| map_token_error(err, "token refresh"))
    }

    async fn revoke(&self, token: &str) {
        let request = match self
            .client
            .revoke_token(RefreshToken::new(token.to_owned()).into())
        {
            Ok(request) => request,
            Err(err) => {
                log::warn!("no usable revocation endpoint: {}", err);
                return;
            }
        };
        match request.request_async(async_http_client).await {
            Ok(()) => log::info!("revoked session token with the provider"),
            Err(err) => log::warn!("revocation endpoint rejected the request: {}", err),
        }
    }

    fn end_session_endpoint(&self) -> Option<String> {
        self.end_session_endpoint.clone()
    }
}
