//! The session seam: credential snapshots and the [`Session`] trait.
//!
//! Everything that talks HTTP to the service authorizes each call with a
//! [`CredentialSnapshot`] captured from the live browser immediately before
//! the call. Snapshots are values: built fresh per use, never mutated, and
//! never cached across a session-health transition.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::Result;

/// User-agent sent when the live browser's own UA could not be captured.
pub const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/// Browser-like header template. `origin`, `referer`, `user-agent`, and
/// `accept-language` are filled in per snapshot.
const HEADER_TEMPLATE: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-US"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"136\", \"Google Chrome\";v=\"136\", \"Not.A/Brand\";v=\"99\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
];

/// Point-in-time header + cookie capture used to authorize one HTTP call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSnapshot {
    /// Header map seeded from the template with per-session values filled in.
    pub headers: BTreeMap<String, String>,
    /// Cookies captured from the live browser for the configured origin.
    pub cookies: BTreeMap<String, String>,
}

impl CredentialSnapshot {
    /// Build a snapshot from live-browser state.
    ///
    /// `user_agent` and `language` come from the bootstrap capture and may
    /// be absent; the UA falls back to [`FALLBACK_USER_AGENT`].
    #[must_use]
    pub fn new(
        origin: &str,
        cookies: BTreeMap<String, String>,
        user_agent: Option<&str>,
        language: Option<&str>,
    ) -> Self {
        let mut headers: BTreeMap<String, String> = HEADER_TEMPLATE
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();

        let _ = headers.insert("origin".into(), origin.to_string());
        let _ = headers.insert("referer".into(), format!("{origin}/"));
        let _ = headers.insert(
            "user-agent".into(),
            user_agent.unwrap_or(FALLBACK_USER_AGENT).to_string(),
        );
        if let Some(lang) = language {
            let _ = headers.insert("accept-language".into(), lang.to_string());
        }

        Self { headers, cookies }
    }

    /// Cookies folded into a single `cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Handle onto the browser-backed session.
///
/// Implemented by the session actor in `arena-browser`; consumers
/// (discovery, uploader, streaming engine) depend only on this trait so
/// they can be exercised against a stub in tests.
#[async_trait]
pub trait Session: Send + Sync {
    /// Make sure a live, bootstrapped browser session exists.
    ///
    /// `force_reload` tears down and relaunches the browser even if the
    /// current one looks healthy. Concurrent callers coalesce onto one
    /// bootstrap pass.
    async fn ensure_ready(&self, force_reload: bool) -> Result<()>;

    /// Re-navigate the existing browser to the origin and clear the
    /// bootstrapped flag. Cheaper than a full relaunch; the next
    /// [`Session::ensure_ready`] re-runs the page-state bootstrap steps.
    async fn reload_session(&self) -> Result<()>;

    /// Capture a fresh [`CredentialSnapshot`] from the live browser.
    async fn credential_snapshot(&self) -> Result<CredentialSnapshot>;

    /// Mint a fresh anti-automation challenge token inside the browser.
    async fn challenge_token(&self) -> Result<String>;

    /// Current rendered page HTML. Returns an empty string on failure;
    /// callers must tolerate empty markup.
    async fn rendered_markup(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookies(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn snapshot_fills_origin_and_referer() {
        let snap = CredentialSnapshot::new("https://x.test", BTreeMap::new(), None, None);
        assert_eq!(snap.headers["origin"], "https://x.test");
        assert_eq!(snap.headers["referer"], "https://x.test/");
    }

    #[test]
    fn snapshot_uses_fallback_user_agent() {
        let snap = CredentialSnapshot::new("https://x.test", BTreeMap::new(), None, None);
        assert_eq!(snap.headers["user-agent"], FALLBACK_USER_AGENT);
    }

    #[test]
    fn snapshot_prefers_live_user_agent_and_language() {
        let snap = CredentialSnapshot::new(
            "https://x.test",
            BTreeMap::new(),
            Some("TestUA/1.0"),
            Some("de-DE"),
        );
        assert_eq!(snap.headers["user-agent"], "TestUA/1.0");
        assert_eq!(snap.headers["accept-language"], "de-DE");
    }

    #[test]
    fn snapshot_keeps_template_headers() {
        let snap = CredentialSnapshot::new("https://x.test", BTreeMap::new(), None, None);
        assert_eq!(snap.headers["sec-fetch-mode"], "cors");
        assert_eq!(snap.headers["sec-ch-ua-mobile"], "?0");
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let snap = CredentialSnapshot::new(
            "https://x.test",
            cookies(&[("a", "1"), ("b", "2")]),
            None,
            None,
        );
        assert_eq!(snap.cookie_header(), "a=1; b=2");
    }

    #[test]
    fn cookie_header_empty_when_no_cookies() {
        let snap = CredentialSnapshot::new("https://x.test", BTreeMap::new(), None, None);
        assert_eq!(snap.cookie_header(), "");
    }
}
