#![doc = r#"
# oidc-gate

An OpenID Connect authenticating reverse proxy for upstream HTTP services,
built on the [Actix web framework](https://actix.rs).

oidc-gate sits in front of an upstream service and only forwards requests
from clients that have proven their identity to the configured OIDC provider.
Sessions are kept in cookies: the signed access token travels in `kc-access`
and the refresh token, AES-GCM encrypted, in `kc-state` (or in an external
store). Token lifetime is managed transparently: near-expiry access tokens
are refreshed through a single-flight coordinator, and logout revokes the
refresh token upstream.

Per-route authorization is declarative: resource rules match request paths by
longest prefix and gate on HTTP methods, required roles (Keycloak realm and
client roles) and required headers, with whitelisting for public routes.

# Getting started

Point the proxy at a provider and an upstream:

```yaml
listen: "127.0.0.1:3000"
upstream_url: "http://127.0.0.1:8080"
discovery_url: "https://idp.example.com/realms/main"
client_id: "proxy"
client_secret: "…"
redirection_url: "https://svc.example.com"
encryption_key: "12345678901234567890123456789012"
enable_refresh_tokens: true
resources:
  - uri: /admin
    methods: [GET, POST]
    roles: [admin]
  - uri: /public
    whitelisted: true
```

and run it:

```text
oidc-gate config.yaml
```

Every option can also be supplied through the environment with the
`AUTH_PROXY_` prefix (`AUTH_PROXY_CLIENT_SECRET=…`).

The `/oauth` scope is owned by the proxy itself: `/oauth/authorize` starts the
authorization-code flow, `/oauth/callback` completes it, `/oauth/logout` ends
the session, `/oauth/login` (opt-in) exposes the resource-owner password
grant, and `/oauth/health` answers liveness probes.
"#]

pub mod access;
pub mod config;
pub mod cookie;
pub mod crypto;
pub mod jwks;
pub mod middleware;
pub mod oidc;
pub mod proxy;
pub mod refresh;
pub mod route;
pub mod state;
pub mod store;
pub mod token;
pub mod types;
pub mod user;
pub mod worker;

/// Cookie carrying the signed access token.
pub const ACCESS_COOKIE: &str = "kc-access";
/// Cookie carrying the encrypted refresh token.
pub const STATE_COOKIE: &str = "kc-state";
/// Path prefix owned by the proxy's own handlers.
pub const OAUTH_SCOPE: &str = "/oauth";
/// Response header announcing the proxy version on `/oauth/health`.
pub const VERSION_HEADER: &str = "X-Auth-Proxy-Version";
