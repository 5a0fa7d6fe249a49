//! plan9port namespace discovery.

use std::path::PathBuf;

/// Returns the plan9port namespace directory for the current user.
///
/// The search order is:
/// 1. `$NAMESPACE`, with trailing slashes removed.
/// 2. `/tmp/ns.$USER.$DISPLAY`, where `DISPLAY` defaults to `:0`.
#[must_use]
pub fn namespace() -> Option<PathBuf> {
    resolve(
        std::env::var("NAMESPACE").ok(),
        user(),
        std::env::var("DISPLAY").ok(),
    )
}

/// Path of the acme service socket inside `namespace`.
#[must_use]
pub fn acme_socket(namespace: impl Into<PathBuf>) -> PathBuf {
    namespace.into().join("acme")
}

/// Name presented to the file server.
#[must_use]
pub fn user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

fn resolve(ns: Option<String>, user: Option<String>, display: Option<String>) -> Option<PathBuf> {
    if let Some(ns) = ns.filter(|ns| !ns.is_empty()) {
        let trimmed = ns.trim_end_matches('/');
        return Some(PathBuf::from(if trimmed.is_empty() { "/" } else { trimmed }));
    }
    let user = user?;
    let display = canonical_display(display.as_deref().unwrap_or(":0"));
    Some(PathBuf::from(format!("/tmp/ns.{user}.{display}")))
}

/// `host:0.0` becomes `host:0`; slashes (launchd displays) become `_`.
fn canonical_display(display: &str) -> String {
    let mut display = display.to_string();
    if let Some(colon) = display.rfind(':') {
        let rest = &display[colon + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if &rest[digits..] == ".0" {
            display.truncate(colon + 1 + digits);
        }
    }
    display.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_env_wins() {
        assert_eq!(
            resolve(Some("/run/ns/".into()), Some("glenda".into()), None),
            Some(PathBuf::from("/run/ns"))
        );
    }

    #[test]
    fn test_default_display() {
        assert_eq!(
            resolve(None, Some("glenda".into()), None),
            Some(PathBuf::from("/tmp/ns.glenda.:0"))
        );
    }

    #[test]
    fn test_display_screen_suffix_stripped() {
        assert_eq!(canonical_display("localhost:10.0"), "localhost:10");
        assert_eq!(canonical_display(":1.1"), ":1.1");
        assert_eq!(canonical_display(":0"), ":0");
    }

    #[test]
    fn test_launchd_display() {
        assert_eq!(
            canonical_display("/private/tmp/com.apple.launchd.x/org.xquartz:0"),
            "_private_tmp_com.apple.launchd.x_org.xquartz:0"
        );
    }

    #[test]
    fn test_no_user() {
        assert_eq!(resolve(None, None, Some(":0".into())), None);
    }

    #[test]
    fn test_acme_socket() {
        assert_eq!(acme_socket("/tmp/ns.glenda.:0"), PathBuf::from("/tmp/ns.glenda.:0/acme"));
    }
}
