use regex::Regex;
use url::Url;

use crate::config::{InterceptTarget, RewriteConfig, RewritePatternType};
use crate::error::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteAction {
    PassThrough,
    Redirect(String),
}

// Predicate deciding which request URLs are eligible for redirect or
// substitution. Stateless and shared read-only across connections.
#[derive(Debug)]
pub enum RewriteRule {
    Marker(String),
    Pattern(Regex),
}

impl RewriteRule {
    pub fn from_config(config: &RewriteConfig) -> Result<Self, ProxyError> {
        match config.pattern_type {
            RewritePatternType::Marker => Ok(Self::Marker(config.pattern.clone())),
            RewritePatternType::Regex => Regex::new(&config.pattern)
                .map(Self::Pattern)
                .map_err(|err| ProxyError::Init(format!("invalid rewrite pattern: {err}"))),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Marker(marker) => url.contains(marker.as_str()),
            Self::Pattern(pattern) => pattern.is_match(url),
        }
    }
}

// Plain-HTTP side: matching requests are answered with a 302 to the
// intercept target. Requests already aimed at the target pass through,
// otherwise the redirect would loop forever.
pub fn filter_http_request(
    rule: &RewriteRule,
    url: &str,
    target: &InterceptTarget,
) -> Result<RewriteAction, ProxyError> {
    if !rule.matches(url) {
        return Ok(RewriteAction::PassThrough);
    }

    let original = parse_url(url)?;
    let redirected = redirect_url(&original, target)?;
    if redirected == original.to_string() {
        return Ok(RewriteAction::PassThrough);
    }
    Ok(RewriteAction::Redirect(redirected))
}

// Host and port swap only; the original scheme, path, and query survive.
fn redirect_url(original: &Url, target: &InterceptTarget) -> Result<String, ProxyError> {
    let mut rewritten = original.clone();
    rewritten
        .set_host(Some(&target.address))
        .map_err(|err| ProxyError::Route(format!("unable to rewrite host: {err}")))?;
    rewritten
        .set_port(Some(target.port))
        .map_err(|_| ProxyError::Route("unable to rewrite port".to_string()))?;
    Ok(rewritten.to_string())
}

// HTTPS side: the reconstructed tunnel URL rewritten onto the intercept
// target, scheme included, ready for the substitution fetch.
pub fn substitute_url(url: &str, target: &InterceptTarget) -> Result<String, ProxyError> {
    let mut rewritten = parse_url(url)?;
    rewritten
        .set_scheme(target.scheme())
        .map_err(|_| ProxyError::Route("unable to rewrite scheme".to_string()))?;
    rewritten
        .set_host(Some(&target.address))
        .map_err(|err| ProxyError::Route(format!("unable to rewrite host: {err}")))?;
    rewritten
        .set_port(Some(target.port))
        .map_err(|_| ProxyError::Route("unable to rewrite port".to_string()))?;
    Ok(rewritten.to_string())
}

// Requests inside a CONNECT tunnel arrive in origin form; the recorded
// prefix supplies the scheme and authority.
pub fn resolve_tunneled_url(prefix: &str, target: &str) -> String {
    format!("{prefix}{target}")
}

fn parse_url(url: &str) -> Result<Url, ProxyError> {
    Url::parse(url).map_err(|err| ProxyError::Route(format!("malformed URL {url}: {err}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{RewriteAction, RewriteRule, filter_http_request, resolve_tunneled_url, substitute_url};
    use crate::config::{InterceptTarget, RewriteConfig, RewritePatternType};

    fn marker_rule() -> RewriteRule {
        RewriteRule::from_config(&RewriteConfig {
            pattern_type: RewritePatternType::Marker,
            pattern: "/rest/gadgets/".to_string(),
        })
        .unwrap()
    }

    fn target() -> InterceptTarget {
        InterceptTarget {
            address: "jira.internal".to_string(),
            port: 8080,
            use_https: false,
        }
    }

    #[test]
    fn matching_request_redirects_to_target() {
        let action = filter_http_request(
            &marker_rule(),
            "http://example.com/rest/gadgets/1.0/g/feed?v=2",
            &target(),
        )
        .unwrap();

        assert_eq!(
            action,
            RewriteAction::Redirect(
                "http://jira.internal:8080/rest/gadgets/1.0/g/feed?v=2".to_string()
            )
        );
    }

    #[test]
    fn non_matching_request_passes_through() {
        let action = filter_http_request(
            &marker_rule(),
            "http://example.com/rest/api/2/issue",
            &target(),
        )
        .unwrap();

        assert_eq!(action, RewriteAction::PassThrough);
    }

    #[test]
    fn request_already_at_target_passes_through() {
        let action = filter_http_request(
            &marker_rule(),
            "http://jira.internal:8080/rest/gadgets/1.0/g/feed",
            &target(),
        )
        .unwrap();

        assert_eq!(action, RewriteAction::PassThrough);
    }

    #[test]
    fn malformed_url_is_a_route_error() {
        let result = filter_http_request(&marker_rule(), "not a url /rest/gadgets/", &target());
        assert_matches!(result, Err(crate::ProxyError::Route(_)));
    }

    #[test]
    fn regex_rule_matches() {
        let rule = RewriteRule::from_config(&RewriteConfig {
            pattern_type: RewritePatternType::Regex,
            pattern: "^.*/rest/gadgets/.*$".to_string(),
        })
        .unwrap();

        assert!(rule.matches("https://example.com/rest/gadgets/feed"));
        assert!(!rule.matches("https://example.com/rest/api/feed"));
    }

    #[test]
    fn invalid_regex_fails_construction() {
        let result = RewriteRule::from_config(&RewriteConfig {
            pattern_type: RewritePatternType::Regex,
            pattern: "(unclosed".to_string(),
        });
        assert_matches!(result, Err(crate::ProxyError::Init(_)));
    }

    #[test]
    fn tunneled_url_reconstruction() {
        let url = resolve_tunneled_url("https://issues.example.com", "/rest/gadgets/feed");
        assert_eq!(url, "https://issues.example.com/rest/gadgets/feed");
    }

    #[test]
    fn substitute_url_applies_target_scheme() {
        let url = substitute_url("https://issues.example.com/rest/gadgets/feed", &target()).unwrap();
        assert_eq!(url, "http://jira.internal:8080/rest/gadgets/feed");

        let https_target = InterceptTarget {
            use_https: true,
            ..target()
        };
        let url =
            substitute_url("https://issues.example.com/rest/gadgets/feed", &https_target).unwrap();
        assert_eq!(url, "https://jira.internal:8080/rest/gadgets/feed");
    }
}
