use super::frame::now_millis;

/// Path suffix that never gets a cache-busting query param appended, even
/// when `cache_bust_on_reload` is set — its own query string is a project
/// selector, not something to collide with.
const EXCLUDED_PATH: &str = "/vis/index.html";

/// Computes the URL a reload should actually navigate to. When cache
/// busting is enabled and the URL's path doesn't match `/vis/index.html`
/// (case-insensitively), appends/replaces an `hb_ts` query parameter with
/// the current timestamp so the browser can't serve a stale cached
/// response. Otherwise returns `url` unchanged.
pub fn cache_busted_url(url: &str, cache_bust_on_reload: bool) -> String {
    if !cache_bust_on_reload {
        return url.to_string();
    }
    if path_of(url).to_ascii_lowercase() == EXCLUDED_PATH {
        return url.to_string();
    }

    let ts = now_millis();
    let (base, fragment) = match url.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (url, None),
    };
    let (base_without_query, existing_query) = match base.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (base, None),
    };

    let mut query_pairs: Vec<String> = existing_query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.starts_with("hb_ts="))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    query_pairs.push(format!("hb_ts={ts}"));

    let mut result = format!("{base_without_query}?{}", query_pairs.join("&"));
    if let Some(fragment) = fragment {
        result.push('#');
        result.push(fragment);
    }
    result
}

fn path_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let without_host = without_scheme.find('/').map(|i| &without_scheme[i..]).unwrap_or("/");
    let end = without_host.find(['?', '#']).unwrap_or(without_host.len());
    &without_host[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_returns_url_unchanged() {
        assert_eq!(cache_busted_url("http://x/view", false), "http://x/view");
    }

    #[test]
    fn excludes_vis_index_html_case_insensitively() {
        let url = "http://x/vis/INDEX.html";
        assert_eq!(cache_busted_url(url, true), url);
    }

    #[test]
    fn appends_query_param_to_plain_url() {
        let busted = cache_busted_url("http://x/view", true);
        assert!(busted.starts_with("http://x/view?hb_ts="));
    }

    #[test]
    fn replaces_existing_hb_ts_param_without_duplicating() {
        let busted = cache_busted_url("http://x/view?hb_ts=1&foo=bar", true);
        assert_eq!(busted.matches("hb_ts=").count(), 1);
        assert!(busted.contains("foo=bar"));
    }

    #[test]
    fn preserves_fragment() {
        let busted = cache_busted_url("http://x/view#frag", true);
        assert!(busted.ends_with("#frag"));
        assert!(busted.contains("hb_ts="));
    }
}
