use std::collections::{BTreeMap, BTreeSet};
use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Duration;

use actix_web::{
    http::{header, StatusCode},
    FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::cookie;
use crate::token::{self, TokenError};
use crate::ACCESS_COOKIE;

/// Verified claim bundle extracted from an access token. Constructed only by
/// the token codec; a value attached to a request context has already passed
/// signature verification.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
    pub preferred_username: Option<String>,
    pub audience: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub realm_roles: BTreeSet<String>,
    pub client_roles: BTreeMap<String, BTreeSet<String>>,
    pub raw_claims: Value,
}

impl Identity {
    pub fn from_claims(claims: Value) -> Result<Self, TokenError> {
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| TokenError::Malformed("claims missing subject".into()))?
            .to_owned();

        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| TokenError::Malformed("claims missing expiry".into()))?;
        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| TokenError::Malformed("expiry out of range".into()))?;

        let iat = claims.get("iat").and_then(Value::as_i64).unwrap_or(0);
        let issued_at = Utc
            .timestamp_opt(iat, 0)
            .single()
            .ok_or_else(|| TokenError::Malformed("issue time out of range".into()))?;

        if expires_at <= issued_at {
            return Err(TokenError::Malformed("token expires before issuance".into()));
        }

        let audience = match claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        };

        let realm_roles = string_set(claims.get("realm_access").and_then(|v| v.get("roles")));

        let mut client_roles = BTreeMap::new();
        if let Some(access) = claims.get("resource_access").and_then(Value::as_object) {
            for (client, entry) in access {
                let roles = string_set(entry.get("roles"));
                if !roles.is_empty() {
                    client_roles.insert(client.clone(), roles);
                }
            }
        }

        Ok(Self {
            subject,
            email: claims.get("email").and_then(Value::as_str).map(str::to_owned),
            preferred_username: claims
                .get("preferred_username")
                .and_then(Value::as_str)
                .map(str::to_owned),
            audience,
            issued_at,
            expires_at,
            realm_roles,
            client_roles,
            raw_claims: claims,
        })
    }

    /// `now + skew >= expires_at`.
    pub fn is_expired(&self, skew: Duration) -> bool {
        Utc::now() + chrono::Duration::seconds(skew.as_secs() as i64) >= self.expires_at
    }

    /// Realm roles united with every client's roles.
    pub fn effective_roles(&self) -> BTreeSet<String> {
        let mut roles = self.realm_roles.clone();
        for client in self.client_roles.values() {
            roles.extend(client.iter().cloned());
        }
        roles
    }

    pub fn jti(&self) -> Option<&str> {
        self.raw_claims.get("jti").and_then(Value::as_str)
    }
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// The identity attached to a request by the gate middleware, exposed to
/// handlers as an extractor.
#[derive(Clone)]
pub struct AuthenticatedUser {
    pub identity: Rc<Identity>,
}

impl From<Identity> for AuthenticatedUser {
    fn from(identity: Identity) -> Self {
        Self {
            identity: Rc::new(identity),
        }
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = AuthError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut actix_web::dev::Payload) -> Self::Future {
        if let Some(user) = req.extensions().get::<AuthenticatedUser>() {
            return ready(Ok(user.clone()));
        }
        ready(
            request_identity(req)
                .map(|(_, identity)| AuthenticatedUser::from(identity))
                .ok_or(AuthError::NoSession),
        )
    }
}

/// The raw bearer token from the `Authorization` header, if any.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_owned())
    }
}

/// Locate and parse the session's access token. Used by the `/oauth`
/// handlers, which run outside the gate middleware; the claims are parsed
/// without signature verification, so the result must never authorize an
/// upstream call.
pub fn request_identity(req: &HttpRequest) -> Option<(String, Identity)> {
    let raw = bearer_token(req).or_else(|| cookie::read(req, ACCESS_COOKIE))?;
    match token::parse(&raw) {
        Ok((_, identity)) => Some((raw, identity)),
        Err(err) => {
            log::debug!("unable to parse session token: {}", err);
            None
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no authenticated session")]
    NoSession,
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}
