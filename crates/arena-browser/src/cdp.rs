//! Raw DevTools protocol client over a browser-level WebSocket.
//!
//! One WebSocket connection per browser, flatten mode: after attaching to
//! the page target every command carries the page `sessionId`. A reader
//! task routes command responses back by message id through oneshot
//! channels.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use arena_core::config::BrowserConfig;
use arena_core::{ArenaError, Result};

use crate::backend::{BrowserBackend, BrowserLauncher};
use crate::chrome;

const CONNECT_RETRIES: u32 = 30;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type ResponseMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Production [`BrowserLauncher`]: spawns Chrome with remote debugging
/// enabled and attaches over the DevTools WebSocket.
#[derive(Clone, Copy, Debug, Default)]
pub struct CdpLauncher;

#[async_trait]
impl BrowserLauncher for CdpLauncher {
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn BrowserBackend>> {
        let backend = CdpBackend::launch(config).await?;
        Ok(Box::new(backend))
    }
}

/// One spawned Chrome process plus its DevTools connection.
pub struct CdpBackend {
    child: Option<tokio::process::Child>,
    ws_tx: WsSink,
    responses: ResponseMap,
    reader: tokio::task::JoinHandle<()>,
    session_id: String,
    next_id: u64,
}

impl CdpBackend {
    /// Spawn Chrome per `config` and attach to its first page target.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let binary = config
            .executable
            .clone()
            .or_else(chrome::find_chrome)
            .ok_or_else(|| {
                ArenaError::Browser("no Chrome binary found (set CHROME_PATH)".into())
            })?;

        let port = match config.devtools_port {
            Some(p) => p,
            None => ephemeral_port()?,
        };

        let mut cmd = tokio::process::Command::new(&binary);
        let _ = cmd
            .arg(format!("--remote-debugging-port={port}"))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-gpu")
            .arg("--no-sandbox");
        if config.headless {
            let _ = cmd.arg("--headless=new");
        }
        if config.incognito {
            let _ = cmd.arg("--incognito");
        }
        if let Some(dir) = &config.user_data_dir {
            let _ = cmd.arg(format!("--user-data-dir={}", dir.display()));
        } else {
            let _ = cmd.arg("--guest");
        }
        if let Some(profile) = &config.profile_directory {
            let _ = cmd.arg(format!("--profile-directory={profile}"));
        }
        let _ = cmd.arg("about:blank").kill_on_drop(true);

        tracing::info!(binary = %binary.display(), port, "launching browser");
        let child = cmd
            .spawn()
            .map_err(|e| ArenaError::Browser(format!("failed to launch {}: {e}", binary.display())))?;

        let ws_url = wait_for_debugger_url(port).await?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| ArenaError::Browser(format!("websocket connect failed: {e}")))?;
        let (ws_tx, mut ws_rx) = ws_stream.split();

        let responses: ResponseMap = Arc::new(Mutex::new(HashMap::new()));
        let responses_for_reader = Arc::clone(&responses);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = value.get("id").and_then(Value::as_u64) {
                            if let Some(tx) = responses_for_reader.lock().await.remove(&id) {
                                let _ = tx.send(value);
                            }
                        }
                        // Events are unsolicited and unused; dropped here.
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::debug!("devtools websocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "devtools websocket error");
                        break;
                    }
                    Ok(_) => {}
                }
            }
        });

        let mut backend = Self {
            child: Some(child),
            ws_tx,
            responses,
            reader,
            session_id: String::new(),
            next_id: 0,
        };

        match backend.attach_first_page().await {
            Ok(()) => Ok(backend),
            Err(e) => {
                backend.close().await;
                Err(e)
            }
        }
    }

    async fn attach_first_page(&mut self) -> Result<()> {
        let targets = self.send_command("Target.getTargets", json!({})).await?;
        let target_id = targets["targetInfos"]
            .as_array()
            .and_then(|infos| {
                infos
                    .iter()
                    .find(|t| t["type"].as_str() == Some("page"))
                    .and_then(|t| t["targetId"].as_str())
            })
            .map(str::to_owned)
            .ok_or_else(|| ArenaError::Browser("no page target found".into()))?;

        let attached = self
            .send_command(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        self.session_id = attached["sessionId"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ArenaError::Browser("attachToTarget returned no sessionId".into()))?;

        let _ = self.send_command("Page.enable", json!({})).await?;
        let _ = self.send_command("Runtime.enable", json!({})).await?;
        let _ = self.send_command("Network.enable", json!({})).await?;

        tracing::debug!(target = %target_id, "attached to page target");
        Ok(())
    }

    /// Send one command and await its response's `result` field.
    ///
    /// Commands go to the page session once attached; before that (the
    /// Target.* handshake) they go to the browser connection itself.
    async fn send_command(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        let (tx, rx) = oneshot::channel();
        let _ = self.responses.lock().await.insert(id, tx);

        let mut command = json!({"id": id, "method": method, "params": params});
        if !self.session_id.is_empty() {
            command["sessionId"] = Value::String(self.session_id.clone());
        }

        self.ws_tx
            .send(WsMessage::Text(command.to_string().into()))
            .await
            .map_err(|e| ArenaError::Browser(format!("websocket send failed: {e}")))?;

        let response = match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ArenaError::Browser("response channel closed".into())),
            Err(_) => return Err(ArenaError::Browser(format!("command timeout: {method}"))),
        };

        if let Some(err) = response.get("error") {
            return Err(ArenaError::Browser(format!("{method} failed: {err}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn dispatch_mouse(&mut self, kind: &str, x: f64, y: f64, button: &str) -> Result<()> {
        let clicks = u8::from(button != "none");
        let _ = self
            .send_command(
                "Input.dispatchMouseEvent",
                json!({"type": kind, "x": x, "y": y, "button": button, "clickCount": clicks}),
            )
            .await?;
        Ok(())
    }

    async fn eval(&mut self, expression: &str, await_promise: bool) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("unknown exception");
            return Err(ArenaError::Browser(format!("evaluate threw: {text}")));
        }
        Ok(result["result"].get("value").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BrowserBackend for CdpBackend {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let _ = self
            .send_command("Page.navigate", json!({"url": url}))
            .await?;

        // Poll readyState instead of subscribing to load events; transient
        // evaluation failures during the navigation are expected.
        let deadline = tokio::time::Instant::now() + NAVIGATE_TIMEOUT;
        loop {
            if tokio::time::Instant::now() > deadline {
                tracing::warn!(url, "navigation did not reach readyState complete");
                break;
            }
            if let Ok(state) = self.eval("document.readyState", false).await
                && state.as_str() == Some("complete")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        tracing::debug!(url, "navigated");
        Ok(())
    }

    async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        self.eval(expression, false).await
    }

    async fn evaluate_async(&mut self, expression: &str) -> Result<Value> {
        self.eval(expression, true).await
    }

    async fn cookies(&mut self, origin: &str) -> Result<BTreeMap<String, String>> {
        let result = self
            .send_command("Network.getCookies", json!({"urls": [origin]}))
            .await?;
        let mut out = BTreeMap::new();
        if let Some(cookies) = result["cookies"].as_array() {
            for cookie in cookies {
                if let (Some(name), Some(value)) =
                    (cookie["name"].as_str(), cookie["value"].as_str())
                {
                    let _ = out.insert(name.to_string(), value.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn page_html(&mut self) -> Result<String> {
        let value = self
            .eval("document.documentElement.outerHTML", false)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn move_pointer(&mut self, x: f64, y: f64) -> Result<()> {
        self.dispatch_mouse("mouseMoved", x, y, "none").await
    }

    async fn click_point(&mut self, x: f64, y: f64) -> Result<()> {
        self.dispatch_mouse("mousePressed", x, y, "left").await?;
        self.dispatch_mouse("mouseReleased", x, y, "left").await
    }

    async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "browser kill failed");
            }
            let _ = child.wait().await;
            self.reader.abort();
            tracing::info!("browser closed");
        }
    }
}

impl Drop for CdpBackend {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the reader just needs stopping.
        self.reader.abort();
    }
}

/// Poll the DevTools HTTP endpoint until it reports its WebSocket URL.
async fn wait_for_debugger_url(port: u16) -> Result<String> {
    let version_url = format!("http://127.0.0.1:{port}/json/version");
    let mut last_error = String::from("never reachable");

    for _ in 0..CONNECT_RETRIES {
        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        match reqwest::get(&version_url).await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(version) => {
                    if let Some(url) = version["webSocketDebuggerUrl"].as_str() {
                        return Ok(url.to_string());
                    }
                    last_error = "no webSocketDebuggerUrl in /json/version".into();
                }
                Err(e) => last_error = format!("bad /json/version body: {e}"),
            },
            Ok(resp) => last_error = format!("HTTP {}", resp.status()),
            Err(e) => last_error = format!("connect error: {e}"),
        }
    }

    Err(ArenaError::Browser(format!(
        "devtools endpoint on port {port} never came up: {last_error}"
    )))
}

/// Reserve an ephemeral TCP port by binding and immediately releasing it.
fn ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| ArenaError::Browser(format!("failed to reserve devtools port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ArenaError::Browser(format!("failed to read reserved port: {e}")))?
        .port();
    Ok(port)
}
