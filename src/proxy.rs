use std::time::Duration;

use actix_web::{
    http::StatusCode,
    web::{self, Data},
    HttpRequest, HttpResponse,
};
use reqwest::redirect::Policy;

/// End-to-end headers only; hop-by-hop headers stay on their own leg.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop))
}

/// Black-box forwarder to the configured upstream. Requests arriving here
/// have already passed the gate; the response is streamed back as-is.
pub struct Upstream {
    client: reqwest::Client,
    base: url::Url,
}

impl Upstream {
    pub fn new(base: url::Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()?;
        Ok(Self { client, base })
    }

    pub async fn forward(&self, req: &HttpRequest, body: web::Bytes) -> HttpResponse {
        let target = target_url(&self.base, req.uri().path(), req.uri().query());

        let Ok(method) = reqwest::Method::from_bytes(req.method().as_str().as_bytes()) else {
            return HttpResponse::MethodNotAllowed().finish();
        };

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers() {
            if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("host") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        {
            let info = req.connection_info();
            for (name, value) in [
                ("x-forwarded-proto", info.scheme()),
                ("x-forwarded-host", info.host()),
            ] {
                if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
            }
        }
        if let Some(peer) = req.peer_addr() {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&peer.ip().to_string()) {
                headers.append("x-forwarded-for", value);
            }
        }

        let upstream_response = match self
            .client
            .request(method, target)
            .headers(headers)
            .body(body.to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                log::error!("upstream did not answer in time: {}", err);
                return HttpResponse::GatewayTimeout().finish();
            }
            Err(err) => {
                log::error!("upstream request failed: {}", err);
                return HttpResponse::BadGateway().finish();
            }
        };

        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = HttpResponse::build(status);
        for (name, value) in upstream_response.headers() {
            if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                actix_web::http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                actix_web::http::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder.append_header((name, value));
            }
        }
        builder.streaming(upstream_response.bytes_stream())
    }
}

fn target_url(base: &url::Url, path: &str, query: Option<&str>) -> url::Url {
    let mut target = base.clone();
    target.set_path(path);
    target.set_query(query);
    target
}

/// Default service behind the gate: everything that is not `/oauth` ends up
/// here.
pub async fn forward(
    req: HttpRequest,
    body: web::Bytes,
    upstream: Data<Upstream>,
) -> HttpResponse {
    upstream.forward(&req, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("TE"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("x-auth-subject"));
    }

    #[test]
    fn target_preserves_path_and_query() {
        let base = url::Url::parse("http://10.0.0.5:8080").unwrap();
        let target = target_url(&base, "/api/v1/items", Some("page=2&sort=asc"));
        assert_eq!(
            target.as_str(),
            "http://10.0.0.5:8080/api/v1/items?page=2&sort=asc"
        );
        let bare = target_url(&base, "/", None);
        assert_eq!(bare.as_str(), "http://10.0.0.5:8080/");
    }
}
