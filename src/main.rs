use std::path::PathBuf;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Condition, web, App, HttpServer};

use oidc_gate::config::Config;
use oidc_gate::jwks;
use oidc_gate::middleware::AccessGate;
use oidc_gate::proxy::{self, Upstream};
use oidc_gate::route;
use oidc_gate::state::AppState;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var("AUTH_PROXY_CONFIG").ok().map(PathBuf::from));
    let config = Config::load(config_path.as_deref()).map_err(fatal)?;

    let listen = config.listen.clone();
    let upstream_url = url::Url::parse(&config.upstream_url).map_err(fatal)?;
    let request_timeout = config.request_timeout;
    let cors = CorsSettings::from_config(&config);

    let (state, worker) = AppState::bootstrap(config).await.map_err(fatal)?;
    let queue = state.queue.clone();

    let rotating = state.jwks.clone();
    actix_web::rt::spawn(async move {
        loop {
            tokio::time::sleep(jwks::ROTATION_PERIOD).await;
            if let Err(err) = rotating.refresh().await {
                log::warn!("periodic JWKS rotation failed: {}", err);
            }
        }
    });

    let upstream = web::Data::new(Upstream::new(upstream_url, request_timeout).map_err(fatal)?);
    let state = web::Data::new(state);

    log::info!(
        "starting oidc-gate {} on {}",
        env!("CARGO_PKG_VERSION"),
        listen
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(upstream.clone())
            .wrap(AccessGate)
            .wrap(Condition::new(cors.enabled(), cors.build()))
            .configure(route::oauth_routes)
            .default_service(web::to(proxy::forward))
    })
    .bind(&listen)?
    .run()
    .await?;

    queue.drain(worker, SHUTDOWN_DRAIN).await;
    Ok(())
}

fn fatal<E: std::fmt::Display>(err: E) -> std::io::Error {
    log::error!("{}", err);
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[derive(Clone)]
struct CorsSettings {
    origins: Vec<String>,
    methods: Vec<String>,
    headers: Vec<String>,
    max_age: Option<usize>,
}

impl CorsSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            origins: config.cors_origins.clone(),
            methods: config.cors_methods.clone(),
            headers: config.cors_headers.clone(),
            max_age: config.cors_max_age,
        }
    }

    fn enabled(&self) -> bool {
        !self.origins.is_empty()
    }

    fn build(&self) -> Cors {
        let mut cors = Cors::default();
        if self.origins.iter().any(|origin| origin == "*") {
            cors = cors.allow_any_origin();
        } else {
            for origin in &self.origins {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = if self.methods.is_empty() {
            cors.allow_any_method()
        } else {
            cors.allowed_methods(self.methods.iter().map(String::as_str))
        };
        cors = if self.headers.is_empty() {
            cors.allow_any_header()
        } else {
            cors.allowed_headers(self.headers.iter().map(String::as_str))
        };
        if let Some(max_age) = self.max_age {
            cors = cors.max_age(max_age);
        }
        cors
    }
}
