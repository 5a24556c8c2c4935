use std::time::Duration;

use actix_web::{
    get,
    http::header,
    post,
    web::{self, Data, Form, Query},
    HttpRequest, HttpResponse, Responder,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use chrono::Utc;

use crate::middleware::verify_token;
use crate::oidc::OidcError;
use crate::refresh::refresh_ttl;
use crate::state::{render_page, AppState};
use crate::store::{self, MAX_STORE_TTL};
use crate::types::{AuthorizeParams, CallbackParams, LoginForm, LogoutParams};
use crate::user;
use crate::worker::Job;
use crate::{cookie, token};
use crate::{ACCESS_COOKIE, OAUTH_SCOPE, STATE_COOKIE, VERSION_HEADER};

pub fn oauth_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope(OAUTH_SCOPE)
            .service(authorize)
            .service(callback)
            .service(login)
            .service(logout)
            .service(expired)
            .service(token_claims)
            .service(health),
    );
}

/// Entry of the authorization-code flow: redirect to the provider (or serve
/// the custom sign-in page) with the caller's `state` passed through.
#[get("/authorize")]
async fn authorize(params: Query<AuthorizeParams>, state: Data<AppState>) -> impl Responder {
    if state.config.skip_token_verification {
        return HttpResponse::NotAcceptable().finish();
    }

    let relay = params
        .state
        .clone()
        .unwrap_or_else(|| URL_SAFE.encode("/"));
    let auth_url = state.provider.authorization_url(&relay);

    if let Some(page) = &state.pages.sign_in {
        let mut vars = state.config.tags.clone();
        vars.insert("redirect".to_owned(), auth_url.to_string());
        return HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(render_page(page, &vars));
    }

    HttpResponse::Found()
        .insert_header((header::LOCATION, auth_url.to_string()))
        .finish()
}

#[get("/callback")]
async fn callback(
    req: HttpRequest,
    params: Query<CallbackParams>,
    state: Data<AppState>,
) -> impl Responder {
    if state.config.skip_token_verification {
        return HttpResponse::NotAcceptable().finish();
    }
    if let Some(error) = &params.error {
        log::error!(
            "provider rejected the authorization request: {} {}",
            error,
            params.error_description.as_deref().unwrap_or_default()
        );
        return HttpResponse::Forbidden().finish();
    }
    let Some(code) = &params.code else {
        return HttpResponse::BadRequest().finish();
    };

    let pair = match state.provider.exchange_code(code).await {
        Ok(pair) => pair,
        Err(err) => {
            log::error!("unable to exchange code for access token: {}", err);
            return HttpResponse::Forbidden().finish();
        }
    };

    let (session_token, identity, raw) = match token::parse(&pair.access_token) {
        Ok((session_token, identity)) => (session_token, identity, pair.access_token.clone()),
        Err(err) => {
            log::warn!(
                "unable to parse the access token, using id token for session identity: {}",
                err
            );
            let Some(id_token) = pair.id_token.clone() else {
                log::error!("token response carried no usable token");
                return HttpResponse::Forbidden().finish();
            };
            match token::parse(&id_token) {
                Ok((session_token, identity)) => (session_token, identity, id_token),
                Err(err) => {
                    log::error!("unable to parse the id token either: {}", err);
                    return HttpResponse::Forbidden().finish();
                }
            }
        }
    };

    if let Err(err) = verify_token(&state, &session_token).await {
        log::error!("unable to verify the session token: {}", err);
        return HttpResponse::Forbidden().finish();
    }

    log::info!(
        "issuing access token for subject {}, expires {}",
        identity.subject,
        identity.expires_at
    );

    let access_ttl = (identity.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let mut cookie_ttl = access_ttl;
    let mut cookies = Vec::new();

    if state.config.enable_refresh_tokens {
        if let (Some(refresh), Some(cipher)) = (&pair.refresh_token, &state.cipher) {
            let ciphertext = match cipher.encode(refresh) {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    log::error!("failed to encrypt the refresh token: {}", err);
                    return HttpResponse::InternalServerError().finish();
                }
            };
            let ttl = refresh_ttl(refresh, state.config.refresh_cookie_duration);
            // The access cookie must outlive the access token itself,
            // otherwise the browser drops it before a refresh can run.
            cookie_ttl = ttl;
            match &state.store {
                Some(backend) => {
                    if let Err(err) = backend
                        .put(
                            &store::session_key(&identity),
                            &ciphertext,
                            ttl.min(MAX_STORE_TTL),
                        )
                        .await
                    {
                        log::warn!("failed to save the refresh token in the store: {}", err);
                    }
                }
                None => {
                    cookies.extend(cookie::issue(&state.config, &req, STATE_COOKIE, &ciphertext, ttl));
                }
            }
        }
    }

    cookies.extend(cookie::issue(&state.config, &req, ACCESS_COOKIE, &raw, cookie_ttl));

    let mut response = HttpResponse::Found();
    for cookie in cookies {
        response.cookie(cookie);
    }
    response
        .insert_header((header::LOCATION, redirect_target(params.state.as_deref())))
        .finish()
}

/// Resource-owner password grant, for non-interactive clients. Disabled
/// unless explicitly configured.
#[post("/login")]
async fn login(req: HttpRequest, form: Form<LoginForm>, state: Data<AppState>) -> impl Responder {
    if !state.config.enable_login_handler {
        return HttpResponse::NotImplemented().body("login handler is disabled");
    }
    if form.username.is_empty() || form.password.is_empty() {
        return HttpResponse::BadRequest().body("request must supply both username and password");
    }

    let pair = match state
        .provider
        .password_grant(&form.username, &form.password)
        .await
    {
        Ok(pair) => pair,
        Err(OidcError::InvalidGrant) => return HttpResponse::Unauthorized().finish(),
        Err(err) => {
            log::error!("password grant failed: {}", err);
            return HttpResponse::InternalServerError().finish();
        }
    };

    let (_, identity) = match token::parse(&pair.access_token) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::error!("unable to decode the granted access token: {}", err);
            return HttpResponse::InternalServerError().finish();
        }
    };

    let ttl = (identity.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    let mut response = HttpResponse::Ok();
    for cookie in cookie::issue(&state.config, &req, ACCESS_COOKIE, &pair.access_token, ttl) {
        response.cookie(cookie);
    }
    response.json(pair)
}

/// End the session: revoke the refresh token with the provider, drop the
/// store entry and clear the cookies. Revocation trouble never fails the
/// logout.
#[get("/logout")]
async fn logout(
    req: HttpRequest,
    params: Query<LogoutParams>,
    state: Data<AppState>,
) -> impl Responder {
    let Some((raw, identity)) = user::request_identity(&req) else {
        return HttpResponse::BadRequest().finish();
    };

    let session_key = store::session_key(&identity);
    let ciphertext = match &state.store {
        Some(backend) => backend.get(&session_key).await.ok(),
        None => cookie::read(&req, STATE_COOKIE),
    };
    // Revoking the refresh token kills the whole session upstream; without
    // one the access token is the best we can offer.
    let revocable = ciphertext
        .and_then(|ciphertext| {
            state
                .cipher
                .as_ref()
                .and_then(|cipher| cipher.decode(&ciphertext).ok())
        })
        .unwrap_or(raw);

    if state.store.is_some() {
        state.queue.enqueue(Job::DeleteSession(session_key)).await;
    }
    state.queue.enqueue(Job::Revoke(revocable)).await;

    let mut response = match params.redirect.as_deref() {
        Some(redirect) if !redirect.is_empty() => {
            let mut response = HttpResponse::Found();
            response.insert_header((header::LOCATION, redirect.to_owned()));
            response
        }
        _ => HttpResponse::Ok(),
    };
    for cookie in cookie::clear_session(&state.config, &req) {
        response.cookie(cookie);
    }
    response.finish()
}

/// 200 iff the current session's access token is still valid.
#[get("/expired")]
async fn expired(req: HttpRequest) -> impl Responder {
    match user::request_identity(&req) {
        Some((_, identity)) if !identity.is_expired(Duration::ZERO) => HttpResponse::Ok().finish(),
        _ => HttpResponse::Unauthorized().finish(),
    }
}

/// Access-token claims as JSON, for debugging. Opt-in.
#[get("/token")]
async fn token_claims(req: HttpRequest, state: Data<AppState>) -> impl Responder {
    if !state.config.enable_token_handler {
        return HttpResponse::NotFound().finish();
    }
    match user::request_identity(&req) {
        Some((_, identity)) => HttpResponse::Ok().json(&identity.raw_claims),
        None => HttpResponse::Unauthorized().finish(),
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok()
        .insert_header((VERSION_HEADER, env!("CARGO_PKG_VERSION")))
        .body("OK\n")
}

/// Decode the post-login redirect carried in `state`. Only same-origin path
/// targets are accepted; anything else falls back to `/`.
fn redirect_target(state: Option<&str>) -> String {
    let Some(encoded) = state else {
        return "/".to_owned();
    };
    let decoded = URL_SAFE
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let Some(target) = decoded else {
        log::warn!("unable to decode the state parameter, redirecting to /");
        return "/".to_owned();
    };
    if same_origin(&target) {
        target
    } else {
        log::warn!("state redirect target is not same-origin, redirecting to /");
        "/".to_owned()
    }
}

fn same_origin(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains("://")
        && !target.contains('\\')
}
