//! Shared test doubles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use arena_core::Result;
use arena_core::session::{CredentialSnapshot, Session};

/// In-memory [`Session`] with fixed credentials and markup. Counts the
/// lifecycle calls so tests can assert on retry behavior.
pub(crate) struct StubSession {
    origin: String,
    markup: String,
    pub(crate) ensures: AtomicUsize,
    pub(crate) reloads: AtomicUsize,
}

impl StubSession {
    pub(crate) fn new(origin: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            markup: String::new(),
            ensures: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_markup(mut self, markup: String) -> Self {
        self.markup = markup;
        self
    }

    pub(crate) fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for StubSession {
    async fn ensure_ready(&self, _force_reload: bool) -> Result<()> {
        let _ = self.ensures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_session(&self) -> Result<()> {
        let _ = self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn credential_snapshot(&self) -> Result<CredentialSnapshot> {
        let mut cookies = BTreeMap::new();
        let _ = cookies.insert("arena-auth-prod-v1".to_string(), "stub".to_string());
        Ok(CredentialSnapshot::new(
            &self.origin,
            cookies,
            Some("StubBrowser/1.0"),
            None,
        ))
    }

    async fn challenge_token(&self) -> Result<String> {
        Ok("stub-challenge-token".to_string())
    }

    async fn rendered_markup(&self) -> Result<String> {
        Ok(self.markup.clone())
    }
}
