//! The session actor: one task owns the browser, everyone else sends
//! commands.
//!
//! All browser work is serialized through an mpsc command queue, so at most
//! one DevTools operation runs at a time no matter how many logical chat
//! operations are in flight. A caller dropping its future just drops a
//! oneshot receiver; the actor finishes the command and discards the reply.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use arena_core::config::ArenaConfig;
use arena_core::session::{CredentialSnapshot, Session};
use arena_core::{ArenaError, Result};

use crate::backend::{BrowserBackend, BrowserLauncher};

/// Cookie marking a bootstrapped session. Matched by substring since the
/// full name carries a variable suffix.
const AUTH_COOKIE_MARKER: &str = "arena-auth-prod";

const PAGE_READY_TIMEOUT: Duration = Duration::from_secs(180);
const AUTH_COOKIE_TIMEOUT: Duration = Duration::from_secs(300);
const CHALLENGE_RUNTIME_TIMEOUT: Duration = Duration::from_secs(180);
const TOKEN_RUNTIME_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const PAGE_READY_JS: &str = r#"document.querySelector("body:not(.no-js)") !== null"#;
const CHALLENGE_RUNTIME_JS: &str = "!!(window.grecaptcha && window.grecaptcha.enterprise)";

const ACCEPT_COOKIES_JS: &str = r#"(() => {
    const el = Array.from(document.querySelectorAll("button, a"))
        .find(e => (e.textContent || "").includes("Accept Cookies"));
    if (el) { el.click(); return true; }
    return false;
})()"#;

const TRIGGER_COMPOSER_JS: &str = r#"(() => {
    const el = document.querySelector('textarea[name="message"]');
    if (!el) return false;
    el.focus();
    el.dispatchEvent(new Event("input", {bubbles: true}));
    return true;
})()"#;

const WIDGET_RECT_JS: &str = r##"(() => {
    const el = document.querySelector('[style="display: grid;"]')
        || document.querySelector("#cf-turnstile");
    if (!el) return null;
    const r = el.getBoundingClientRect();
    return {x: r.left + r.width / 2, y: r.top + r.height / 2};
})()"##;

enum Command {
    EnsureReady {
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    ReloadSession {
        reply: oneshot::Sender<Result<()>>,
    },
    Credentials {
        reply: oneshot::Sender<Result<CredentialSnapshot>>,
    },
    ChallengeToken {
        reply: oneshot::Sender<Result<String>>,
    },
    RenderedMarkup {
        reply: oneshot::Sender<Result<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto the browser-owning worker task. Cheap to clone.
#[derive(Clone)]
pub struct SessionActor {
    tx: mpsc::Sender<Command>,
}

impl SessionActor {
    /// Spawn the worker task. The browser is not launched until the first
    /// command needs it.
    #[must_use]
    pub fn spawn(config: ArenaConfig, launcher: Box<dyn BrowserLauncher>) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let worker = Worker {
            config,
            launcher,
            backend: None,
            bootstrapped: false,
            user_agent: None,
            language: None,
        };
        drop(tokio::spawn(worker.run(rx)));
        Self { tx }
    }

    /// Close the browser and stop the worker.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ArenaError::Browser("session worker stopped".into()))?;
        rx.await
            .map_err(|_| ArenaError::Browser("session worker stopped".into()))?
    }
}

#[async_trait]
impl Session for SessionActor {
    async fn ensure_ready(&self, force_reload: bool) -> Result<()> {
        self.request(|reply| Command::EnsureReady {
            force: force_reload,
            reply,
        })
        .await
    }

    async fn reload_session(&self) -> Result<()> {
        self.request(|reply| Command::ReloadSession { reply }).await
    }

    async fn credential_snapshot(&self) -> Result<CredentialSnapshot> {
        self.request(|reply| Command::Credentials { reply }).await
    }

    async fn challenge_token(&self) -> Result<String> {
        self.request(|reply| Command::ChallengeToken { reply }).await
    }

    async fn rendered_markup(&self) -> Result<String> {
        self.request(|reply| Command::RenderedMarkup { reply }).await
    }
}

struct Worker {
    config: ArenaConfig,
    launcher: Box<dyn BrowserLauncher>,
    backend: Option<Box<dyn BrowserBackend>>,
    bootstrapped: bool,
    user_agent: Option<String>,
    language: Option<String>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::EnsureReady { force, reply } => {
                    let _ = reply.send(self.ensure_ready(force).await);
                }
                Command::ReloadSession { reply } => {
                    let _ = reply.send(self.reload_session().await);
                }
                Command::Credentials { reply } => {
                    let _ = reply.send(self.credentials().await);
                }
                Command::ChallengeToken { reply } => {
                    let _ = reply.send(self.challenge_token().await);
                }
                Command::RenderedMarkup { reply } => {
                    let _ = reply.send(self.rendered_markup().await);
                }
                Command::Shutdown { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close().await;
        }
        self.bootstrapped = false;
    }

    async fn ensure_ready(&mut self, force: bool) -> Result<()> {
        if force {
            tracing::info!("forced session reload requested");
            self.teardown().await;
        }

        if self.backend.is_none() {
            tracing::info!("launching browser session");
            self.backend = Some(self.launcher.launch(&self.config.browser).await?);
            self.bootstrapped = false;
        } else if !self.probe_alive().await {
            tracing::warn!("browser session unhealthy, relaunching");
            self.teardown().await;
            self.backend = Some(self.launcher.launch(&self.config.browser).await?);
        }

        if !self.on_origin().await? {
            let url = self.config.boot_url();
            tracing::info!(url, "navigating to chat origin");
            self.backend_mut()?.navigate(&url).await?;
            self.bootstrapped = false;
        }

        if !self.bootstrapped {
            self.bootstrap().await?;
        }
        Ok(())
    }

    async fn probe_alive(&mut self) -> bool {
        match self.backend.as_mut() {
            Some(backend) => matches!(
                backend.evaluate("1").await,
                Ok(value) if value.as_u64() == Some(1)
            ),
            None => false,
        }
    }

    async fn on_origin(&mut self) -> Result<bool> {
        let origin = self.config.origin_trimmed().to_string();
        let location = self
            .backend_mut()?
            .evaluate("window.location.origin")
            .await
            .unwrap_or(Value::Null);
        Ok(location.as_str() == Some(origin.as_str()))
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn BrowserBackend>> {
        self.backend
            .as_mut()
            .ok_or_else(|| ArenaError::SessionUnhealthy("no live browser".into()))
    }

    /// The page-state bootstrap. Hard waits surface as `BootstrapTimeout`;
    /// the click helpers are best-effort and never fail the sequence.
    async fn bootstrap(&mut self) -> Result<()> {
        tracing::info!("bootstrapping session");

        self.wait_for_js("page hydration", PAGE_READY_JS, PAGE_READY_TIMEOUT)
            .await?;

        if let Err(e) = self.backend_mut()?.evaluate(ACCEPT_COOKIES_JS).await {
            tracing::debug!(error = %e, "cookie banner dismissal failed");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Err(e) = self.backend_mut()?.evaluate(TRIGGER_COMPOSER_JS).await {
            tracing::debug!(error = %e, "composer trigger failed");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        self.challenge_click_assist().await;

        self.wait_for_auth_cookie().await?;
        self.wait_for_js(
            "challenge runtime",
            CHALLENGE_RUNTIME_JS,
            CHALLENGE_RUNTIME_TIMEOUT,
        )
        .await?;

        self.snapshot_navigator().await;
        self.bootstrapped = true;
        tracing::info!("session bootstrapped");
        Ok(())
    }

    /// Nudge the anti-bot widget with real pointer events. Entirely
    /// best-effort; the auth-cookie wait that follows is the real gate.
    async fn challenge_click_assist(&mut self) {
        for round in 0..3u32 {
            if self.has_auth_cookie().await {
                return;
            }
            let Ok(backend) = self.backend_mut() else {
                return;
            };
            let rect = match backend.evaluate(WIDGET_RECT_JS).await {
                Ok(value) if value.is_object() => value,
                Ok(_) => {
                    tracing::debug!(round, "no challenge widget on page");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(round, error = %e, "widget lookup failed");
                    return;
                }
            };
            let (Some(x), Some(y)) = (rect["x"].as_f64(), rect["y"].as_f64()) else {
                continue;
            };

            for step in 0..15u32 {
                if self.has_auth_cookie().await {
                    return;
                }
                let offset = f64::from(step) * 3.0;
                let Ok(backend) = self.backend_mut() else {
                    return;
                };
                if let Err(e) = backend.move_pointer(x + offset, y + offset).await {
                    tracing::debug!(error = %e, "pointer move failed");
                    return;
                }
                if let Err(e) = backend.click_point(x + offset, y + offset).await {
                    tracing::debug!(error = %e, "widget click failed");
                    return;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    async fn has_auth_cookie(&mut self) -> bool {
        let origin = self.config.origin_trimmed().to_string();
        match self.backend.as_mut() {
            Some(backend) => backend
                .cookies(&origin)
                .await
                .is_ok_and(|cookies| cookies.keys().any(|name| name.contains(AUTH_COOKIE_MARKER))),
            None => false,
        }
    }

    async fn wait_for_auth_cookie(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + AUTH_COOKIE_TIMEOUT;
        loop {
            if self.has_auth_cookie().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ArenaError::timeout(
                    "auth cookie",
                    AUTH_COOKIE_TIMEOUT.as_secs(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_js(&mut self, what: &str, expr: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let satisfied = self
                .backend_mut()?
                .evaluate(expr)
                .await
                .is_ok_and(|value| value.as_bool() == Some(true));
            if satisfied {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ArenaError::timeout(what, timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn snapshot_navigator(&mut self) {
        let Ok(backend) = self.backend_mut() else {
            return;
        };
        if let Ok(value) = backend.evaluate("navigator.userAgent").await {
            self.user_agent = value.as_str().map(str::to_owned);
        }
        let Ok(backend) = self.backend_mut() else {
            return;
        };
        if let Ok(value) = backend.evaluate("navigator.language").await {
            self.language = value.as_str().map(str::to_owned);
        }
    }

    async fn reload_session(&mut self) -> Result<()> {
        let url = self.config.boot_url();
        if let Some(backend) = self.backend.as_mut() {
            tracing::info!(url, "reloading session page");
            if let Err(e) = backend.navigate(&url).await {
                tracing::warn!(error = %e, "navigate failed, falling back to reload");
                if let Err(e) = backend.evaluate("location.reload()").await {
                    tracing::warn!(error = %e, "in-page reload failed");
                }
            }
        }
        // The flag drops even when both reload paths failed; the next
        // ensure_ready re-runs the bootstrap against whatever page is left.
        self.bootstrapped = false;
        Ok(())
    }

    async fn credentials(&mut self) -> Result<CredentialSnapshot> {
        self.ensure_ready(false).await?;
        let origin = self.config.origin_trimmed().to_string();
        let cookies = self.backend_mut()?.cookies(&origin).await?;
        Ok(CredentialSnapshot::new(
            &origin,
            cookies,
            self.user_agent.as_deref(),
            self.language.as_deref(),
        ))
    }

    async fn challenge_token(&mut self) -> Result<String> {
        self.ensure_ready(false).await?;
        self.wait_for_js(
            "challenge runtime",
            CHALLENGE_RUNTIME_JS,
            TOKEN_RUNTIME_TIMEOUT,
        )
        .await?;

        let site_key = self.config.recaptcha_site_key.clone();
        let expr = format!(
            r#"new Promise((resolve, reject) => {{
                try {{
                    window.grecaptcha.enterprise.ready(() => {{
                        window.grecaptcha.enterprise
                            .execute({key}, {{action: "chat_submit"}})
                            .then(resolve, reject);
                    }});
                }} catch (e) {{ reject(e); }}
            }})"#,
            key = serde_json::to_string(&site_key)?,
        );
        let value = self.backend_mut()?.evaluate_async(&expr).await?;
        match value.as_str() {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(ArenaError::Browser(
                "challenge runtime returned an empty token".into(),
            )),
        }
    }

    async fn rendered_markup(&mut self) -> Result<String> {
        self.ensure_ready(false).await?;
        match self.backend_mut()?.page_html().await {
            Ok(html) => Ok(html),
            Err(e) => {
                tracing::debug!(error = %e, "markup capture failed");
                Ok(String::new())
            }
        }
    }
}
