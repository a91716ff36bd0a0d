/// Validates a request against the configured bearer token, if any. No
/// token configured means the deployment is open — everything passes.
///
/// Accepts either a `?token=<T>` query parameter or an
/// `Authorization: Bearer <T>` header, matching the spec's "either form"
/// contract for both HTTP and the WS upgrade.
pub fn check(configured: Option<&str>, query_token: Option<&str>, auth_header: Option<&str>) -> bool {
    let Some(expected) = configured else {
        return true;
    };
    if query_token.is_some_and(|t| t == expected) {
        return true;
    }
    auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|t| t == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_configured_token_always_passes() {
        assert!(check(None, None, None));
    }

    #[test]
    fn query_token_match() {
        assert!(check(Some("secret"), Some("secret"), None));
    }

    #[test]
    fn bearer_header_match() {
        assert!(check(Some("secret"), None, Some("Bearer secret")));
    }

    #[test]
    fn mismatch_rejected() {
        assert!(!check(Some("secret"), Some("nope"), None));
        assert!(!check(Some("secret"), None, Some("Bearer nope")));
        assert!(!check(Some("secret"), None, None));
    }
}
