use std::collections::HashMap;

use actix_web::http::{header::HeaderMap, Method};

use crate::config::{Config, Resource};
use crate::user::Identity;

/// Declarative allow/deny unit matched against request path and method.
#[derive(Debug, Clone)]
pub struct ResourceRule {
    pub uri: String,
    pub methods: Vec<Method>,
    pub roles: Vec<String>,
    pub headers: HashMap<String, String>,
    pub whitelisted: bool,
    pub audit: bool,
}

impl ResourceRule {
    fn from_resource(resource: &Resource) -> Option<Self> {
        let mut methods = Vec::new();
        for method in &resource.methods {
            match Method::from_bytes(method.to_uppercase().as_bytes()) {
                Ok(method) => methods.push(method),
                Err(_) => {
                    log::warn!(
                        "resource {} lists unknown method {:?}, ignoring the rule",
                        resource.uri,
                        method
                    );
                    return None;
                }
            }
        }
        Some(Self {
            uri: resource.uri.clone(),
            methods,
            roles: resource.roles.clone(),
            headers: resource.headers.clone(),
            whitelisted: resource.whitelisted,
            audit: resource.audit,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Forbidden(String),
}

/// Evaluates resource rules: longest matching `uri` prefix wins, declaration
/// order breaks ties, and the first match decides.
pub struct AccessEngine {
    rules: Vec<ResourceRule>,
    default_deny: bool,
}

impl AccessEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            rules: config
                .resources
                .iter()
                .filter_map(ResourceRule::from_resource)
                .collect(),
            default_deny: config.default_deny,
        }
    }

    pub fn default_deny(&self) -> bool {
        self.default_deny
    }

    /// The rule governing this request, if any. A rule with a method list
    /// that excludes the request method does not match at all.
    pub fn matched(&self, path: &str, method: &Method) -> Option<&ResourceRule> {
        let mut best: Option<&ResourceRule> = None;
        for rule in &self.rules {
            if !path.starts_with(rule.uri.as_str()) {
                continue;
            }
            if !rule.methods.is_empty() && !rule.methods.contains(method) {
                continue;
            }
            // Strictly longer prefixes replace the candidate, so the first
            // declared rule wins among equals.
            if best.map_or(true, |current| rule.uri.len() > current.uri.len()) {
                best = Some(rule);
            }
        }
        best
    }

    /// Evaluate the matched rule against the request. `identity` may be
    /// absent only for whitelisted rules and unmatched requests.
    pub fn evaluate(
        &self,
        rule: Option<&ResourceRule>,
        identity: Option<&Identity>,
        headers: &HeaderMap,
    ) -> Decision {
        let Some(rule) = rule else {
            return if self.default_deny {
                Decision::Forbidden("no resource rule matches".to_owned())
            } else {
                Decision::Allow
            };
        };

        if rule.whitelisted {
            return Decision::Allow;
        }

        for (name, expected) in &rule.headers {
            let found = headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok());
            if found != Some(expected.as_str()) {
                return Decision::Forbidden(format!("required header {name} missing or mismatched"));
            }
        }

        if !rule.roles.is_empty() {
            let Some(identity) = identity else {
                return Decision::Forbidden("no identity for role check".to_owned());
            };
            let effective = identity.effective_roles();
            for role in &rule.roles {
                if !effective.contains(role) {
                    return Decision::Forbidden(format!("missing required role {role}"));
                }
            }
        }

        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{self, test_support::sign};
    use actix_web::http::header::{HeaderName, HeaderValue};
    use serde_json::json;

    fn engine(resources: Vec<Resource>, default_deny: bool) -> AccessEngine {
        let config = Config {
            resources,
            default_deny,
            ..Config::default()
        };
        AccessEngine::new(&config)
    }

    fn resource(uri: &str) -> Resource {
        Resource {
            uri: uri.to_owned(),
            ..Resource::default()
        }
    }

    fn identity_with_roles(realm: &[&str], client: &[(&str, &[&str])]) -> Identity {
        let clients: serde_json::Map<String, serde_json::Value> = client
            .iter()
            .map(|(name, roles)| ((*name).to_owned(), json!({ "roles": roles })))
            .collect();
        let raw = sign(json!({
            "realm_access": { "roles": realm },
            "resource_access": clients,
        }));
        token::parse(&raw).unwrap().1
    }

    #[test]
    fn longest_prefix_wins() {
        let engine = engine(
            vec![resource("/api"), resource("/api/admin")],
            false,
        );
        let rule = engine.matched("/api/admin/users", &Method::GET).unwrap();
        assert_eq!(rule.uri, "/api/admin");
        let rule = engine.matched("/api/other", &Method::GET).unwrap();
        assert_eq!(rule.uri, "/api");
    }

    #[test]
    fn declaration_order_breaks_prefix_ties() {
        let mut first = resource("/api");
        first.roles = vec!["first".to_owned()];
        let mut second = resource("/api");
        second.roles = vec!["second".to_owned()];
        let engine = engine(vec![first, second], false);
        let rule = engine.matched("/api/x", &Method::GET).unwrap();
        assert_eq!(rule.roles, vec!["first"]);
    }

    #[test]
    fn method_filter_excludes_the_rule() {
        let mut guarded = resource("/api");
        guarded.methods = vec!["POST".to_owned(), "delete".to_owned()];
        let engine = engine(vec![guarded], false);
        assert!(engine.matched("/api/x", &Method::GET).is_none());
        assert!(engine.matched("/api/x", &Method::POST).is_some());
        assert!(engine.matched("/api/x", &Method::DELETE).is_some());
    }

    #[test]
    fn whitelist_short_circuits_role_checks() {
        let mut open = resource("/health");
        open.whitelisted = true;
        open.roles = vec!["admin".to_owned()];
        let engine = engine(vec![open], true);
        let rule = engine.matched("/health", &Method::GET);
        assert_eq!(
            engine.evaluate(rule, None, &HeaderMap::new()),
            Decision::Allow
        );
    }

    #[test]
    fn all_required_roles_must_be_present() {
        let mut admin = resource("/admin");
        admin.roles = vec!["admin".to_owned(), "operator".to_owned()];
        let engine = engine(vec![admin], false);
        let rule = engine.matched("/admin", &Method::GET);

        let partial = identity_with_roles(&["admin"], &[]);
        assert!(matches!(
            engine.evaluate(rule, Some(&partial), &HeaderMap::new()),
            Decision::Forbidden(_)
        ));

        let full = identity_with_roles(&["admin"], &[("batch", &["operator"])]);
        assert_eq!(
            engine.evaluate(rule, Some(&full), &HeaderMap::new()),
            Decision::Allow
        );
    }

    #[test]
    fn client_roles_satisfy_requirements() {
        let mut api = resource("/api");
        api.roles = vec!["reader".to_owned()];
        let engine = engine(vec![api], false);
        let rule = engine.matched("/api", &Method::GET);
        let identity = identity_with_roles(&[], &[("api", &["reader"])]);
        assert_eq!(
            engine.evaluate(rule, Some(&identity), &HeaderMap::new()),
            Decision::Allow
        );
    }

    #[test]
    fn required_headers_are_enforced() {
        let mut internal = resource("/internal");
        internal
            .headers
            .insert("x-client".to_owned(), "trusted".to_owned());
        let engine = engine(vec![internal], false);
        let rule = engine.matched("/internal", &Method::GET);
        let identity = identity_with_roles(&[], &[]);

        let mut headers = HeaderMap::new();
        assert!(matches!(
            engine.evaluate(rule, Some(&identity), &headers),
            Decision::Forbidden(_)
        ));

        headers.insert(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("other"),
        );
        assert!(matches!(
            engine.evaluate(rule, Some(&identity), &headers),
            Decision::Forbidden(_)
        ));

        headers.insert(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("trusted"),
        );
        assert_eq!(
            engine.evaluate(rule, Some(&identity), &headers),
            Decision::Allow
        );
    }

    #[test]
    fn unmatched_requests_follow_the_default() {
        let permissive = engine(vec![], false);
        assert_eq!(
            permissive.evaluate(None, None, &HeaderMap::new()),
            Decision::Allow
        );
        let strict = engine(vec![], true);
        assert!(matches!(
            strict.evaluate(None, None, &HeaderMap::new()),
            Decision::Forbidden(_)
        ));
    }
}
