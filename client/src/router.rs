//! Target selection by path pattern
//!
//! Patterns are tried in configured order and the first match wins. With no
//! patterns and a single target, that target receives everything.

use thiserror::Error;
use url::Url;

/// Pattern used when only a single target is configured
pub const CATCH_ALL: &str = "**";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("number of pattern({patterns}) and target({targets}) does not match")]
    CountMismatch { patterns: usize, targets: usize },

    #[error("no target configured")]
    NoTargets,

    #[error("empty pattern at position {0}")]
    EmptyPattern(usize),
}

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    target: Url,
}

/// Ordered (pattern, target) list.
#[derive(Debug, Clone)]
pub struct TargetRouter {
    routes: Vec<Route>,
}

impl TargetRouter {
    pub fn new(mut patterns: Vec<String>, targets: Vec<Url>) -> Result<Self, RouteError> {
        if targets.is_empty() {
            return Err(RouteError::NoTargets);
        }
        if patterns.is_empty() && targets.len() == 1 {
            patterns.push(CATCH_ALL.to_string());
        }
        if patterns.len() != targets.len() {
            return Err(RouteError::CountMismatch {
                patterns: patterns.len(),
                targets: targets.len(),
            });
        }
        if let Some(pos) = patterns.iter().position(|p| p.trim().is_empty()) {
            return Err(RouteError::EmptyPattern(pos));
        }

        let routes = patterns
            .into_iter()
            .zip(targets)
            .map(|(pattern, target)| Route { pattern, target })
            .collect();
        Ok(Self { routes })
    }

    /// Target for a request path (query string ignored), or None.
    pub fn select(&self, url: &str) -> Option<&Url> {
        let path = url.split(['?', '#']).next().unwrap_or("");
        self.routes
            .iter()
            .find(|r| matches_glob(&r.pattern, path))
            .map(|r| &r.target)
    }

    /// (pattern, target) pairs in priority order
    pub fn routes(&self) -> impl Iterator<Item = (&str, &Url)> {
        self.routes.iter().map(|r| (r.pattern.as_str(), &r.target))
    }
}

/// Glob match over `/`-separated segments.
///
/// `**` spans any number of segments, `*` any run of characters inside one
/// segment, `?` a single character inside one segment.
pub fn matches_glob(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }

    let mut pat_parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    // a run of ** spans the same segments as a single one
    pat_parts.dedup_by(|a, b| *a == "**" && *b == "**");
    let path_parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    matches_parts(&pat_parts, &path_parts)
}

fn matches_parts(pattern: &[&str], path: &[&str]) -> bool {
    if pattern.is_empty() {
        return path.is_empty();
    }

    if pattern[0] == "**" {
        // ** matches zero or more path segments
        return (0..=path.len()).any(|i| matches_parts(&pattern[1..], &path[i..]));
    }

    if path.is_empty() {
        return false;
    }

    matches_segment(pattern[0], path[0]) && matches_parts(&pattern[1..], &path[1..])
}

/// Wildcard match within one segment, backtracking to the last `*`.
fn matches_segment(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn router(patterns: &[&str], targets: &[&str]) -> TargetRouter {
        TargetRouter::new(
            patterns.iter().map(|s| s.to_string()).collect(),
            targets.iter().map(|s| url(s)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_literal_segments() {
        assert!(matches_glob("/healthz", "/healthz"));
        assert!(matches_glob("/healthz", "/healthz/"));
        assert!(matches_glob("/v1/orders", "//v1//orders"));
        assert!(!matches_glob("/healthz", "/healthz/live"));
        assert!(!matches_glob("/v1/orders", "/v1/order"));
    }

    #[test]
    fn test_segment_wildcards() {
        assert!(matches_glob("/v1/*/status", "/v1/jobs/status"));
        assert!(!matches_glob("/v1/*/status", "/v1/jobs/42/status"));
        assert!(matches_glob("/assets/*.css", "/assets/site.min.css"));
        assert!(!matches_glob("/assets/*.css", "/assets/site.css.map"));
        assert!(matches_glob("/r?ports", "/reports"));
        assert!(!matches_glob("/r?ports", "/rports"));
    }

    #[test]
    fn test_question_mark_matches_one_character() {
        assert!(matches_glob("/caf?", "/café"));
        assert!(matches_glob("/?/menu", "/ü/menu"));
        assert!(!matches_glob("/??/menu", "/ü/menu"));
        assert!(matches_glob("/docs/*.md", "/docs/日本語.md"));
    }

    #[test]
    fn test_repeated_double_wildcard() {
        assert!(matches_glob("/**/**/**/end", "/end"));
        assert!(matches_glob("/**/**/**/end", "/a/b/c/end"));
        assert!(!matches_glob("/**/**/**/end", "/a/b/c/end/x"));

        let deep: String = (0..200).map(|i| format!("/s{}", i)).collect();
        let pattern = format!("{}/nomatch", "/**".repeat(12));
        assert!(!matches_glob(&pattern, &deep));
    }

    #[test]
    fn test_double_wildcard() {
        assert!(matches_glob("/admin/**", "/admin/settings"));
        assert!(matches_glob("/admin/**", "/admin/users/123/edit"));
        assert!(matches_glob("**", "/anything/at/all"));
        assert!(matches_glob("**", "/"));
        assert!(matches_glob("/**/edit", "/admin/users/123/edit"));
        assert!(!matches_glob("/admin/**", "/other"));
    }

    #[test]
    fn test_first_match_wins() {
        let r = router(
            &["/a/**", "/b/**", "/**"],
            &["http://t1:8080", "http://t2:8080", "http://fallback:8080"],
        );
        assert_eq!(r.select("/a/x").unwrap().host_str(), Some("t1"));
        assert_eq!(r.select("/b/y").unwrap().host_str(), Some("t2"));
        assert_eq!(r.select("/c/z").unwrap().host_str(), Some("fallback"));
    }

    #[test]
    fn test_no_match() {
        let r = router(&["/a/**", "/b/**"], &["http://t1", "http://t2"]);
        assert!(r.select("/c/z").is_none());

        let r = router(&["/api/**"], &["http://t1"]);
        assert!(r.select("/other").is_none());
    }

    #[test]
    fn test_query_string_ignored() {
        let r = router(&["/api/*"], &["http://t1"]);
        assert!(r.select("/api/users?page=2&sort=a/b").is_some());
    }

    #[test]
    fn test_single_target_catch_all() {
        let r = router(&[], &["http://localhost:3010"]);
        assert_eq!(r.routes().next().unwrap().0, CATCH_ALL);
        assert!(r.select("/whatever/path").is_some());
    }

    #[test]
    fn test_count_mismatch() {
        let err = TargetRouter::new(vec![], vec![url("http://a"), url("http://b")]).unwrap_err();
        assert!(matches!(err, RouteError::CountMismatch { patterns: 0, targets: 2 }));

        let err = TargetRouter::new(vec!["/a".into(), "/b".into()], vec![url("http://a")])
            .unwrap_err();
        assert!(matches!(err, RouteError::CountMismatch { patterns: 2, targets: 1 }));

        assert!(matches!(
            TargetRouter::new(vec![], vec![]).unwrap_err(),
            RouteError::NoTargets
        ));
    }
}
