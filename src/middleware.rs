use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Duration;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{self, HeaderName, HeaderValue},
    web::Data,
    Error, HttpMessage, HttpRequest, HttpResponse,
};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use futures_util::future::LocalBoxFuture;

use crate::access::{Decision, ResourceRule};
use crate::cookie;
use crate::refresh::{RefreshError, RefreshRequest, RefreshedSession};
use crate::state::{render_page, AppState};
use crate::store;
use crate::token::{self, AccessToken, TokenError};
use crate::user::{self, AuthenticatedUser, Identity};
use crate::worker::Job;
use crate::{ACCESS_COOKIE, OAUTH_SCOPE, STATE_COOKIE};

/// The request gate: locates and verifies the session's access token,
/// refreshes it when it is about to expire, evaluates the resource rules and
/// attaches the identity for the upstream forwarder. Requests under `/oauth`
/// belong to the flow handlers and pass through untouched.
pub struct AccessGate;

impl<S, B> Transform<S, ServiceRequest> for AccessGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AccessGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessGateMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AccessGateMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AccessGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(handle(service, req))
    }
}

async fn handle<S, B>(
    service: Rc<S>,
    mut req: ServiceRequest,
) -> Result<ServiceResponse<EitherBody<B>>, Error>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: 'static,
{
    if req.path().starts_with(OAUTH_SCOPE) {
        return service.call(req).await.map(|res| res.map_into_left_body());
    }

    let Some(state) = req.app_data::<Data<AppState>>().cloned() else {
        let response = HttpResponse::InternalServerError().body("proxy state missing");
        return Ok(req.into_response(response).map_into_right_body());
    };

    let rule = state.engine.matched(req.path(), req.method()).cloned();

    if let Some(rule) = &rule {
        if rule.whitelisted {
            if rule.audit {
                audit(&req, None, rule);
            }
            return service.call(req).await.map(|res| res.map_into_left_body());
        }
    } else if !state.engine.default_deny() {
        return service.call(req).await.map(|res| res.map_into_left_body());
    }

    let browser = wants_html(req.request());
    let original_uri = original_uri(req.request());

    // Bearer header first, reassembled cookie second.
    let located = user::bearer_token(req.request())
        .or_else(|| cookie::read(req.request(), ACCESS_COOKIE));
    let Some(raw) = located else {
        let response = challenge(browser, &original_uri);
        return Ok(req.into_response(response).map_into_right_body());
    };

    if raw.len() > state.config.max_token_bytes {
        log::warn!("rejecting token above the configured size bound");
        let response = forbidden(&state, req.request(), browser, true);
        return Ok(req.into_response(response).map_into_right_body());
    }

    let (token, mut identity) = match token::parse(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("rejecting malformed session token: {}", err);
            let response = forbidden(&state, req.request(), browser, true);
            return Ok(req.into_response(response).map_into_right_body());
        }
    };

    if !state.config.skip_token_verification {
        if let Err(err) = verify_token(&state, &token).await {
            log::warn!("rejecting session token: {}", err);
            let response = forbidden(&state, req.request(), browser, true);
            return Ok(req.into_response(response).map_into_right_body());
        }
    }

    let mut refreshed: Option<RefreshedSession> = None;
    if identity.is_expired(state.config.refresh_skew) {
        match &state.cipher {
            Some(cipher) if state.config.enable_refresh_tokens => {
                let session_key = store::session_key(&identity);
                let request = RefreshRequest {
                    session_key: session_key.clone(),
                    cookie_ciphertext: cookie::read(req.request(), STATE_COOKIE),
                    provider: state.provider.clone(),
                    store: state.store.clone(),
                    cipher: cipher.clone(),
                    fallback_ttl: state.config.refresh_cookie_duration,
                };
                match state.refresher.refresh(request).await {
                    Ok(session) => {
                        if !state.config.skip_token_verification {
                            if let Err(err) = verify_refreshed(&state, &session.access_token).await
                            {
                                log::error!("refreshed token failed verification: {}", err);
                                let response = forbidden(&state, req.request(), browser, true);
                                return Ok(req.into_response(response).map_into_right_body());
                            }
                        }
                        identity = session.identity.clone();
                        refreshed = Some(session);
                    }
                    Err(RefreshError::InvalidGrant) | Err(RefreshError::NoRefreshToken) => {
                        state.queue.enqueue(Job::DeleteSession(session_key)).await;
                        let response = session_expired(&state, req.request(), browser, &original_uri);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Err(err) => {
                        log::warn!("session refresh failed: {}", err);
                        if identity.is_expired(Duration::ZERO) {
                            // Transport trouble; surface 401 without purging
                            // so the session survives a provider blip.
                            let response = challenge(browser, &original_uri);
                            return Ok(req.into_response(response).map_into_right_body());
                        }
                    }
                }
            }
            _ => {
                if identity.is_expired(Duration::ZERO) {
                    let response = session_expired(&state, req.request(), browser, &original_uri);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            }
        }
    }

    match state.engine.evaluate(rule.as_ref(), Some(&identity), req.headers()) {
        Decision::Allow => {
            if let Some(rule) = &rule {
                if rule.audit {
                    audit(&req, Some(&identity), rule);
                }
            }
        }
        Decision::Forbidden(reason) => {
            log::debug!("denying {} {}: {}", req.method(), req.path(), reason);
            let response = forbidden(&state, req.request(), browser, false);
            return Ok(req.into_response(response).map_into_right_body());
        }
    }

    let active_token = refreshed
        .as_ref()
        .map(|session| session.access_token.clone())
        .unwrap_or(raw);
    identity_headers(&mut req, &identity, &active_token);
    req.extensions_mut()
        .insert(AuthenticatedUser::from(identity));

    let res = service.call(req).await?;
    let mut res = res.map_into_left_body();

    if let Some(session) = refreshed {
        let mut cookies = cookie::issue(
            &state.config,
            res.request(),
            ACCESS_COOKIE,
            &session.access_token,
            session.cookie_ttl,
        );
        if state.store.is_none() {
            cookies.extend(cookie::issue(
                &state.config,
                res.request(),
                STATE_COOKIE,
                &session.state_ciphertext,
                session.cookie_ttl,
            ));
        }
        for cookie in cookies {
            if let Err(err) = res.response_mut().add_cookie(&cookie) {
                log::error!("unable to replace session cookie: {}", err);
            }
        }
    }

    Ok(res)
}

/// Verify with the current key set; an unknown `kid` forces one JWKS
/// rotation and a single retry.
pub(crate) async fn verify_token(state: &AppState, token: &AccessToken) -> Result<(), TokenError> {
    let keys = state.jwks.snapshot().await;
    match token::verify(token, &keys) {
        Err(TokenError::UnknownKid { kid }) => {
            log::debug!("token signed by unknown key {:?}, rotating JWKS", kid);
            if let Err(err) = state.jwks.refresh_throttled().await {
                log::warn!("JWKS rotation failed: {}", err);
            }
            let keys = state.jwks.snapshot().await;
            token::verify(token, &keys)
        }
        other => other,
    }
}

async fn verify_refreshed(state: &AppState, raw: &str) -> Result<(), TokenError> {
    let (token, _) = token::parse(raw)?;
    verify_token(state, &token).await
}

fn wants_html(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

fn original_uri(req: &HttpRequest) -> String {
    match req.query_string() {
        "" => req.path().to_owned(),
        query => format!("{}?{}", req.path(), query),
    }
}

/// Missing session: browsers are sent into the authorization flow with the
/// original URI as `state`, API clients get a bare 401.
pub(crate) fn challenge(browser: bool, original_uri: &str) -> HttpResponse {
    if browser {
        let state = URL_SAFE.encode(original_uri);
        HttpResponse::Found()
            .insert_header((
                header::LOCATION,
                format!("{OAUTH_SCOPE}/authorize?state={state}"),
            ))
            .finish()
    } else {
        HttpResponse::Unauthorized().finish()
    }
}

/// Dead session: clear the cookies and restart the flow.
fn session_expired(
    state: &AppState,
    req: &HttpRequest,
    browser: bool,
    original_uri: &str,
) -> HttpResponse {
    let mut response = challenge(browser, original_uri);
    for cookie in cookie::clear_session(&state.config, req) {
        if let Err(err) = response.add_cookie(&cookie) {
            log::error!("unable to clear session cookie: {}", err);
        }
    }
    response
}

fn forbidden(state: &AppState, req: &HttpRequest, browser: bool, clear: bool) -> HttpResponse {
    let mut builder = HttpResponse::Forbidden();
    if clear {
        for cookie in cookie::clear_session(&state.config, req) {
            builder.cookie(cookie);
        }
    }
    match (&state.pages.forbidden, browser) {
        (Some(page), true) => builder
            .content_type("text/html; charset=utf-8")
            .body(render_page(page, &state.config.tags)),
        _ => builder.finish(),
    }
}

fn audit(req: &ServiceRequest, identity: Option<&Identity>, rule: &ResourceRule) {
    log::info!(
        target: "audit",
        "allow {} {} rule={} subject={} email={}",
        req.method(),
        req.path(),
        rule.uri,
        identity.map(|i| i.subject.as_str()).unwrap_or("-"),
        identity.and_then(|i| i.email.as_deref()).unwrap_or("-"),
    );
}

fn identity_headers(req: &mut ServiceRequest, identity: &Identity, token: &str) {
    let mut set = |name: HeaderName, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            req.headers_mut().insert(name, value);
        }
    };
    set(
        HeaderName::from_static("x-auth-subject"),
        identity.subject.clone(),
    );
    if let Some(email) = &identity.email {
        set(HeaderName::from_static("x-auth-email"), email.clone());
    }
    if let Some(username) = &identity.preferred_username {
        set(HeaderName::from_static("x-auth-username"), username.clone());
    }
    set(
        HeaderName::from_static("x-auth-roles"),
        identity
            .effective_roles()
            .into_iter()
            .collect::<Vec<_>>()
            .join(","),
    );
    set(header::AUTHORIZATION, format!("Bearer {token}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_support as config_support, Config, Resource};
    use crate::jwks::JwksCache;
    use crate::oidc::{MockOidcFlows, OidcError, TokenPair};
    use crate::state::test_support::state_with;
    use crate::token::test_support::{expiring_in, sign, TEST_KID, TEST_SECRET};
    use actix_web::{
        cookie::Cookie,
        http::StatusCode,
        test::{self, TestRequest},
        web, App, HttpRequest as ActixRequest,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn protected_config() -> Config {
        let mut config = config_support::valid();
        config.resources.push(Resource {
            uri: "/protected".to_owned(),
            roles: vec!["user".to_owned()],
            ..Resource::default()
        });
        config.resources.push(Resource {
            uri: "/admin".to_owned(),
            roles: vec!["admin".to_owned()],
            ..Resource::default()
        });
        config.resources.push(Resource {
            uri: "/open".to_owned(),
            whitelisted: true,
            ..Resource::default()
        });
        config
    }

    fn fixture_jwks() -> Arc<JwksCache> {
        Arc::new(JwksCache::static_keys(&[(TEST_KID, TEST_SECRET)]))
    }

    async fn upstream_echo(req: ActixRequest) -> HttpResponse {
        let subject = req
            .headers()
            .get("x-auth-subject")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        HttpResponse::Ok().body(format!("upstream:{subject}"))
    }

    macro_rules! gate_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(Data::new($state))
                    .wrap(AccessGate)
                    .default_service(web::to(upstream_echo)),
            )
            .await
        };
    }

    fn user_token() -> String {
        sign(json!({ "realm_access": { "roles": ["user"] } }))
    }

    #[actix_web::test]
    async fn browsers_without_a_session_are_sent_to_authorize() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .insert_header((header::ACCEPT, "text/html"))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::FOUND);
        let location = res.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, "/oauth/authorize?state=L3Byb3RlY3RlZA==");
    }

    #[actix_web::test]
    async fn api_clients_without_a_session_get_401() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let res =
            test::call_service(&srv, TestRequest::get().uri("/protected").to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn a_verified_session_reaches_the_upstream_with_identity_headers() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, user_token()))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        let body = test::read_body(res).await;
        assert_eq!(body, "upstream:user-1");
    }

    #[actix_web::test]
    async fn bearer_tokens_are_accepted_without_cookies() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", user_token())))
            .to_request();
        let res = test::call_service(&srv, req).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn missing_roles_are_forbidden() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/admin")
            .cookie(Cookie::new(ACCESS_COOKIE, user_token()))
            .to_request();
        let res = test::call_service(&srv, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        // A role mismatch is not a broken session; cookies survive.
        assert!(res.response().cookies().next().is_none());
    }

    #[actix_web::test]
    async fn malformed_tokens_get_403_and_lose_their_cookies() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, "garbage"))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        let cleared: Vec<String> = res
            .response()
            .cookies()
            .map(|c| c.name().to_owned())
            .collect();
        assert!(cleared.contains(&ACCESS_COOKIE.to_owned()));
    }

    #[actix_web::test]
    async fn forged_tokens_are_rejected() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        // Signed with a key the provider never published.
        let forged = {
            use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
            let mut header = Header::new(Algorithm::HS256);
            header.kid = Some(TEST_KID.to_owned());
            encode(
                &header,
                &json!({ "sub": "intruder", "exp": 4102444800i64,
                         "realm_access": { "roles": ["user"] } }),
                &EncodingKey::from_secret(b"attacker key"),
            )
            .unwrap()
        };
        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, forged))
            .to_request();
        let res = test::call_service(&srv, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn whitelisted_routes_need_no_identity() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let res = test::call_service(&srv, TestRequest::get().uri("/open").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn unmatched_paths_follow_default_allow() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let res =
            test::call_service(&srv, TestRequest::get().uri("/elsewhere").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn default_deny_forbids_unmatched_paths() {
        let mut config = protected_config();
        config.default_deny = true;
        let state = state_with(config, Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let with_session = TestRequest::get()
            .uri("/elsewhere")
            .cookie(Cookie::new(ACCESS_COOKIE, user_token()))
            .to_request();
        let res = test::call_service(&srv, with_session).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let without = TestRequest::get().uri("/elsewhere").to_request();
        let res = test::call_service(&srv, without).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    fn refresh_ready_config() -> Config {
        let mut config = protected_config();
        config.enable_refresh_tokens = true;
        config.encryption_key = "0123456789abcdef0123456789abcdef".to_owned();
        config
    }

    #[actix_web::test]
    async fn near_expiry_sessions_are_refreshed_and_cookies_replaced() {
        let fresh = sign(json!({ "realm_access": { "roles": ["user"] }, "jti": "fresh" }));
        let mut provider = MockOidcFlows::new();
        let pair = TokenPair {
            access_token: fresh.clone(),
            id_token: None,
            refresh_token: Some("rotated-refresh".to_owned()),
            expires_in: Some(300),
            scope: None,
        };
        provider
            .expect_refresh_exchange()
            .times(1)
            .returning(move |_| Ok(pair.clone()));

        let config = refresh_ready_config();
        let state = state_with(config, Arc::new(provider), fixture_jwks());
        let cipher = state.cipher.clone().unwrap();
        let state_cookie = cipher.encode("original-refresh").unwrap();
        let srv = gate_app!(state);

        let stale = sign(json!({
            "realm_access": { "roles": ["user"] },
            "exp": chrono::Utc::now().timestamp() + 5,
        }));
        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, stale))
            .cookie(Cookie::new(STATE_COOKIE, state_cookie))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        let cookies: Vec<_> = res.response().cookies().collect();
        let access = cookies.iter().find(|c| c.name() == ACCESS_COOKIE).unwrap();
        assert_eq!(access.value(), fresh);
        let rotated = cookies.iter().find(|c| c.name() == STATE_COOKIE).unwrap();
        assert_eq!(cipher.decode(rotated.value()).unwrap(), "rotated-refresh");
    }

    #[actix_web::test]
    async fn rejected_refresh_purges_the_session() {
        let mut provider = MockOidcFlows::new();
        provider
            .expect_refresh_exchange()
            .times(1)
            .returning(|_| Err(OidcError::InvalidGrant));

        let state = state_with(refresh_ready_config(), Arc::new(provider), fixture_jwks());
        let cipher = state.cipher.clone().unwrap();
        let state_cookie = cipher.encode("stale-refresh").unwrap();
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, expiring_in(-60)))
            .cookie(Cookie::new(STATE_COOKIE, state_cookie))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let cleared: Vec<String> = res
            .response()
            .cookies()
            .map(|c| c.name().to_owned())
            .collect();
        assert!(cleared.contains(&ACCESS_COOKIE.to_owned()));
        assert!(cleared.contains(&STATE_COOKIE.to_owned()));
    }

    #[actix_web::test]
    async fn provider_outage_keeps_the_session_cookies() {
        let mut provider = MockOidcFlows::new();
        provider
            .expect_refresh_exchange()
            .times(1)
            .returning(|_| Err(OidcError::Transport("connection refused".to_owned())));

        let state = state_with(refresh_ready_config(), Arc::new(provider), fixture_jwks());
        let cipher = state.cipher.clone().unwrap();
        let state_cookie = cipher.encode("refresh").unwrap();
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, expiring_in(-60)))
            .cookie(Cookie::new(STATE_COOKIE, state_cookie))
            .to_request();
        let res = test::call_service(&srv, req).await;

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.response().cookies().next().is_none());
    }

    #[actix_web::test]
    async fn expired_sessions_without_refresh_are_unauthorized() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let req = TestRequest::get()
            .uri("/protected")
            .cookie(Cookie::new(ACCESS_COOKIE, expiring_in(-60)))
            .to_request();
        let res = test::call_service(&srv, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn oauth_scope_bypasses_the_gate() {
        let state = state_with(protected_config(), Arc::new(MockOidcFlows::new()), fixture_jwks());
        let srv = gate_app!(state);

        let res =
            test::call_service(&srv, TestRequest::get().uri("/oauth/anything").to_request()).await;
        // Reached the default handler instead of being challenged.
        assert_eq!(res.status(), StatusCode::OK);
    }
}
