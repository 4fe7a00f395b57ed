//! Request classification: which `(method, path)` tuples may reach the
//! Docker daemon. Stateless — each request is judged in isolation.

use std::sync::OnceLock;

use regex::Regex;

/// POST paths that remain allowed: container exec/attach and exec start,
/// with or without the `/v<version>` API prefix. `<id>` is
/// `[A-Za-z0-9_.-]+`, `<version>` is `v[0-9.]+`.
fn exec_attach_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:/v[0-9.]+)?/(?:containers/[A-Za-z0-9_.-]+/(?:exec|attach)|exec/[A-Za-z0-9_.-]+/start)$",
        )
        .expect("exec/attach pattern is valid")
    })
}

/// Returns `None` when the request is allowed, otherwise the complete
/// plain-text denial body written back to the client.
pub fn deny_reason(method: &str, path: &str) -> Option<String> {
    if method == "GET" || method == "HEAD" {
        return None;
    }
    // docker attach/exec carry query parameters (?stream=1&stdin=1&...);
    // classification is on the bare path.
    let bare = path.split('?').next().unwrap_or(path);
    if method == "POST" && exec_attach_pattern().is_match(bare) {
        return None;
    }
    Some(format!(
        "docker proxy: {method} {path} blocked (write operations not allowed)\n"
    ))
}
