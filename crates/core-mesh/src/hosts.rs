//! Host pattern matching.
//!
//! A pattern is either `*` (any host), `*suffix` (any host ending in
//! `suffix`) or an exact hostname. Comparison ignores ASCII case and a
//! trailing root dot on the host.

/// Returns true when `host` is covered by `pattern`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }
    if pattern == "*" || pattern == host {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => false,
    }
}

/// Returns true when any of `patterns` covers `host`.
pub fn any_match<S: AsRef<str>>(patterns: &[S], host: &str) -> bool {
    patterns.iter().any(|p| host_matches(p.as_ref(), host))
}

/// Strips the port (and IPv6 brackets) from an authority like `host:port`.
pub fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port.
        Some((host, _)) if !host.contains(':') => host,
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_only_matches_itself() {
        assert!(host_matches("api.example.com", "api.example.com"));
        assert!(!host_matches("api.example.com", "www.example.com"));
        assert!(!host_matches("api.example.com", "api.example.com.evil"));
    }

    #[test]
    fn star_matches_anything() {
        assert!(host_matches("*", "anything.test"));
        assert!(host_matches("*", "localhost"));
    }

    #[test]
    fn suffix_wildcard() {
        assert!(host_matches("*.example.com", "api.example.com"));
        assert!(host_matches("*.example.com", "a.b.example.com"));
        assert!(!host_matches("*.example.com", "example.com"));
        assert!(host_matches("*example.com", "example.com"));
        assert!(host_matches("*tmdb.org", "image.tmdb.org"));
        assert!(!host_matches("*tmdb.org", "tmdb.org.example"));
    }

    #[test]
    fn case_and_root_dot_are_ignored() {
        assert!(host_matches("*.Example.COM", "API.example.com."));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!host_matches("", "example.com"));
        assert!(!host_matches("*", ""));
    }

    #[test]
    fn any_match_over_list() {
        let patterns = vec!["*themoviedb.org".to_string(), "*tmdb.org".to_string()];
        assert!(any_match(&patterns, "api.themoviedb.org"));
        assert!(!any_match(&patterns, "example.org"));
        assert!(!any_match::<String>(&[], "example.org"));
    }

    #[test]
    fn authority_host_extraction() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("::1"), "::1");
    }
}
