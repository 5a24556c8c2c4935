use std::time::Duration;

use actix_web::{
    cookie::{time, Cookie, SameSite},
    HttpRequest,
};

use crate::config::Config;
use crate::{ACCESS_COOKIE, STATE_COOKIE};

/// Browsers start dropping cookies beyond 4 KiB; values longer than this are
/// split across indexed parts (`kc-access-0`, `kc-access-1`, …).
pub const MAX_COOKIE_LEN: usize = 4_093;

/// Build the cookies carrying `value` under `name`, chunking when oversize,
/// plus removal cookies for any previously issued parts the new value no
/// longer needs.
pub fn issue(
    config: &Config,
    req: &HttpRequest,
    name: &str,
    value: &str,
    max_age: Duration,
) -> Vec<Cookie<'static>> {
    let parts = chunks(value);
    let stale = present_parts(req, name);
    let mut cookies = Vec::new();

    if parts.len() == 1 {
        cookies.push(build(config, req, name.to_owned(), parts[0].clone(), max_age));
        for index in stale {
            cookies.push(removal(config, part_name(name, index)));
        }
    } else {
        for (index, part) in parts.iter().enumerate() {
            cookies.push(build(config, req, part_name(name, index), part.clone(), max_age));
        }
        if req.cookie(name).is_some() {
            cookies.push(removal(config, name.to_owned()));
        }
        for index in stale.into_iter().filter(|i| *i >= parts.len()) {
            cookies.push(removal(config, part_name(name, index)));
        }
    }
    cookies
}

/// Reassemble a cookie value: the canonical name wins, otherwise indexed
/// parts are concatenated in order until the first missing index.
pub fn read(req: &HttpRequest, name: &str) -> Option<String> {
    if let Some(cookie) = req.cookie(name) {
        return Some(cookie.value().to_owned());
    }
    let mut value = String::new();
    for index in 0.. {
        match req.cookie(&part_name(name, index)) {
            Some(cookie) => value.push_str(cookie.value()),
            None if index == 0 => return None,
            None => break,
        }
    }
    Some(value)
}

/// Removal cookies for the canonical name and every part present on the
/// request.
pub fn expire(config: &Config, req: &HttpRequest, name: &str) -> Vec<Cookie<'static>> {
    let mut cookies = Vec::new();
    if req.cookie(name).is_some() {
        cookies.push(removal(config, name.to_owned()));
    }
    for index in present_parts(req, name) {
        cookies.push(removal(config, part_name(name, index)));
    }
    cookies
}

/// Clear the whole session: access and state cookies including parts.
pub fn clear_session(config: &Config, req: &HttpRequest) -> Vec<Cookie<'static>> {
    let mut cookies = expire(config, req, ACCESS_COOKIE);
    cookies.extend(expire(config, req, STATE_COOKIE));
    cookies
}

fn part_name(name: &str, index: usize) -> String {
    format!("{name}-{index}")
}

fn present_parts(req: &HttpRequest, name: &str) -> Vec<usize> {
    let prefix = format!("{name}-");
    let mut parts: Vec<usize> = req
        .cookies()
        .map(|cookies| {
            cookies
                .iter()
                .filter_map(|cookie| cookie.name().strip_prefix(&prefix))
                .filter_map(|suffix| suffix.parse::<usize>().ok())
                .collect()
        })
        .unwrap_or_default();
    parts.sort_unstable();
    parts
}

fn chunks(value: &str) -> Vec<String> {
    if value.len() <= MAX_COOKIE_LEN {
        return vec![value.to_owned()];
    }
    let mut parts = Vec::new();
    let mut start = 0;
    while start < value.len() {
        let mut end = (start + MAX_COOKIE_LEN).min(value.len());
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        parts.push(value[start..end].to_owned());
        start = end;
    }
    parts
}

fn secure(config: &Config, req: &HttpRequest) -> bool {
    config.secure_cookie
        || config.redirection_url.starts_with("https://")
        || req.connection_info().scheme() == "https"
}

fn build(
    config: &Config,
    req: &HttpRequest,
    name: String,
    value: String,
    max_age: Duration,
) -> Cookie<'static> {
    let mut builder = Cookie::build(name, value)
        .http_only(true)
        .secure(secure(config, req))
        .same_site(same_site(config))
        .path("/")
        .max_age(time::Duration::seconds(max_age.as_secs().min(i64::MAX as u64) as i64));
    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }
    builder.finish()
}

fn removal(config: &Config, name: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, "");
    cookie.set_path("/");
    if let Some(domain) = &config.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookie.make_removal();
    cookie
}

fn same_site(config: &Config) -> SameSite {
    use crate::config::SameSitePolicy;
    match config.same_site_cookie {
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::None => SameSite::None,
    }
}
