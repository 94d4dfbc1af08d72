//! Asset uploads.
//!
//! Uploading is a three-step RPC sequence against the page's server
//! actions: mint an upload URL, PUT the raw bytes to it, then resolve the
//! stored key to a signed URL. Identical payloads are served from an
//! in-process cache keyed by content hash, so the sequence runs at most
//! once per distinct byte string.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use arena_core::config::ArenaConfig;
use arena_core::session::{FALLBACK_USER_AGENT, Session};
use arena_core::{ArenaError, Result};

use crate::discovery::Discovery;
use crate::{sniff, transport};

const MAX_ATTEMPTS: u32 = 2;

/// Where an asset's bytes come from.
pub enum AssetSource {
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// A `data:` URI with base64 payload.
    DataUri(String),
    /// A local file.
    Path(PathBuf),
    /// An http(s) URL to fetch.
    Url(String),
    /// An arbitrary async reader, drained to the end.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// One asset to upload, with an optional caller-supplied filename.
pub struct Asset {
    /// The bytes source.
    pub source: AssetSource,
    /// Filename hint; a name is generated when absent.
    pub filename: Option<String>,
}

impl Asset {
    /// Asset from raw bytes.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            source: AssetSource::Bytes(data),
            filename: None,
        }
    }

    /// Asset from a local file path.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: AssetSource::Path(path.into()),
            filename: None,
        }
    }

    /// Asset fetched from an http(s) URL.
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source: AssetSource::Url(url.into()),
            filename: None,
        }
    }

    /// Asset decoded from a base64 `data:` URI.
    #[must_use]
    pub fn from_data_uri(uri: impl Into<String>) -> Self {
        Self {
            source: AssetSource::DataUri(uri.into()),
            filename: None,
        }
    }

    /// Attach a filename hint.
    #[must_use]
    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }
}

/// Descriptor of a stored asset, as attached to outgoing messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Storage key assigned by the service.
    pub name: String,
    /// Sniffed content type.
    #[serde(rename = "contentType")]
    pub content_type: String,
    /// Signed fetch URL.
    pub url: String,
}

/// Uploads assets and caches the resulting descriptors for the process
/// lifetime.
pub struct Uploader {
    config: ArenaConfig,
    session: Arc<dyn Session>,
    discovery: Arc<Discovery>,
    cache: Mutex<HashMap<String, UploadedFile>>,
}

impl Uploader {
    /// New uploader over `session` and `discovery`.
    #[must_use]
    pub fn new(config: ArenaConfig, session: Arc<dyn Session>, discovery: Arc<Discovery>) -> Self {
        Self {
            config,
            session,
            discovery,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Upload every asset, in order. An empty input returns immediately
    /// with no session or discovery activity.
    #[tracing::instrument(skip_all, fields(assets = assets.len()))]
    pub async fn upload(&self, assets: Vec<Asset>) -> Result<Vec<UploadedFile>> {
        if assets.is_empty() {
            return Ok(Vec::new());
        }

        self.session.ensure_ready(false).await?;
        self.discovery.ensure_loaded().await?;
        let actions = self.discovery.action_ids().await;
        let (Some(mint_id), Some(sign_id)) = (
            actions.generate_upload_url.clone(),
            actions.get_signed_url.clone(),
        ) else {
            return Err(ArenaError::ActionsNotLoaded);
        };

        let client =
            transport::build_client(Duration::from_secs(self.config.upload_timeout_secs))?;
        let rpc_url = self.config.image_url();
        let mut uploaded = Vec::with_capacity(assets.len());

        for (index, asset) in assets.into_iter().enumerate() {
            let data = resolve_bytes(asset.source).await?;
            let digest = format!("{:x}", Sha256::digest(&data));

            if self.config.upload_cache
                && let Some(hit) = self.cache.lock().get(&digest).cloned()
            {
                tracing::debug!(digest, "upload cache hit");
                uploaded.push(hit);
                continue;
            }

            let (ext, mime) = sniff::detect_file_type(&data).ok_or_else(|| {
                ArenaError::UploadFailure("unrecognized file signature".into())
            })?;
            let filename = sniff::ensure_filename(asset.filename.as_deref(), index, ext);

            let file = self
                .upload_with_retry(&client, &rpc_url, &filename, mime, &data, &mint_id, &sign_id)
                .await?;
            let _ = self.cache.lock().insert(digest, file.clone());
            uploaded.push(file);
        }
        Ok(uploaded)
    }

    async fn upload_with_retry(
        &self,
        client: &reqwest::Client,
        rpc_url: &str,
        filename: &str,
        mime: &str,
        data: &[u8],
        mint_id: &str,
        sign_id: &str,
    ) -> Result<UploadedFile> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .upload_once(client, rpc_url, filename, mime, data, mint_id, sign_id)
                .await
            {
                Ok(file) => {
                    tracing::info!(filename, url = %file.url, "asset uploaded");
                    return Ok(file);
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(filename, attempt, error = %e, "upload failed, retrying");
                    if let Err(re) = self.session.reload_session().await {
                        tracing::warn!(error = %re, "session reload before retry failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("upload retry loop returns on the final attempt")
    }

    async fn upload_once(
        &self,
        client: &reqwest::Client,
        rpc_url: &str,
        filename: &str,
        mime: &str,
        data: &[u8],
        mint_id: &str,
        sign_id: &str,
    ) -> Result<UploadedFile> {
        let creds = self.session.credential_snapshot().await?;
        let mut rpc_creds = creds.clone();
        let _ = rpc_creds
            .headers
            .insert("accept".into(), "text/x-component".into());
        let _ = rpc_creds
            .headers
            .insert("content-type".into(), "text/plain;charset=UTF-8".into());
        let _ = rpc_creds.headers.insert("referer".into(), rpc_url.into());

        // Step 1: mint an upload URL.
        let response = transport::apply_credentials(client.post(rpc_url), &rpc_creds)
            .header("next-action", mint_id)
            .body(serde_json::to_string(&json!([filename, mime]))?)
            .send()
            .await?;
        let text = transport::ensure_ok(response).await?.text().await?;
        let minted = component_payload(&text, "upload-url mint")?;
        let upload_url = require_str(&minted, "uploadUrl", "upload-url mint")?;
        let key = require_str(&minted, "key", "upload-url mint")?;

        // Step 2: PUT the raw bytes.
        let response = transport::apply_credentials(client.put(&upload_url), &creds)
            .header("content-type", mime)
            .body(data.to_vec())
            .send()
            .await?;
        let _ = transport::ensure_ok(response).await?;

        // Step 3: resolve the key to a signed URL.
        let response = transport::apply_credentials(client.post(rpc_url), &rpc_creds)
            .header("next-action", sign_id)
            .body(serde_json::to_string(&json!([key]))?)
            .send()
            .await?;
        let text = transport::ensure_ok(response).await?.text().await?;
        let signed = component_payload(&text, "signed-url resolve")?;
        let url = require_str(&signed, "url", "signed-url resolve")?;

        Ok(UploadedFile {
            name: key,
            content_type: mime.to_string(),
            url,
        })
    }
}

/// Parse a server-action response: the `1:`-prefixed line holds a JSON
/// envelope `{success, data}`.
fn component_payload(text: &str, context: &str) -> Result<Value> {
    let line = text
        .lines()
        .find(|l| l.starts_with("1:"))
        .ok_or_else(|| ArenaError::UploadFailure(format!("{context}: no payload line")))?;
    let envelope: Value = serde_json::from_str(&line[2..])
        .map_err(|e| ArenaError::UploadFailure(format!("{context}: bad payload: {e}")))?;
    if envelope.get("success").and_then(Value::as_bool) != Some(true) {
        return Err(ArenaError::UploadFailure(format!(
            "{context}: action reported failure: {envelope}"
        )));
    }
    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
}

fn require_str(data: &Value, field: &str, context: &str) -> Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ArenaError::UploadFailure(format!("{context}: missing {field}")))
}

async fn resolve_bytes(source: AssetSource) -> Result<Vec<u8>> {
    match source {
        AssetSource::Bytes(data) => Ok(data),
        AssetSource::DataUri(uri) => {
            let (_, payload) = uri.split_once(',').ok_or_else(|| {
                ArenaError::UploadFailure("data URI has no payload separator".into())
            })?;
            BASE64
                .decode(payload)
                .map_err(|e| ArenaError::UploadFailure(format!("bad data URI payload: {e}")))
        }
        AssetSource::Path(path) => tokio::fs::read(&path).await.map_err(|e| {
            ArenaError::UploadFailure(format!("read {} failed: {e}", path.display()))
        }),
        AssetSource::Url(url) => {
            let client = transport::build_client(Duration::from_secs(60))?;
            let response = client
                .get(&url)
                .header("user-agent", FALLBACK_USER_AGENT)
                .send()
                .await?;
            let response = transport::ensure_ok(response).await?;
            Ok(response.bytes().await?.to_vec())
        }
        AssetSource::Reader(mut reader) => {
            let mut data = Vec::new();
            let _ = reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| ArenaError::UploadFailure(format!("reader failed: {e}")))?;
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ActionIds;
    use crate::testutil::StubSession;
    use assert_matches::assert_matches;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n....";

    fn mint_body(server: &MockServer) -> String {
        format!(
            "0:preamble\n1:{}\n",
            json!({"success": true, "data": {
                "uploadUrl": format!("{}/put-target", server.uri()),
                "key": "uploads/k1",
            }})
        )
    }

    fn sign_body() -> String {
        format!(
            "1:{}\n",
            json!({"success": true, "data": {"url": "https://cdn.test/signed"}})
        )
    }

    async fn uploader_over(server: &MockServer) -> (Uploader, Arc<StubSession>) {
        let session = Arc::new(StubSession::new(&server.uri()));
        let config = ArenaConfig {
            origin: server.uri(),
            ..ArenaConfig::default()
        };
        let discovery = Arc::new(Discovery::new(config.clone(), session.clone()));
        discovery
            .seed(
                &[("alpha-chat", "id-alpha")],
                &[],
                &["alpha-chat"],
                ActionIds {
                    generate_upload_url: Some("a".repeat(40)),
                    get_signed_url: Some("b".repeat(40)),
                },
            )
            .await;
        (Uploader::new(config, session.clone(), discovery), session)
    }

    async fn mount_happy_path(server: &MockServer, expected_rpc_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("chat-modality", "image"))
            .and(header("next-action", "a".repeat(40).as_str()))
            .and(header("accept", "text/x-component"))
            .respond_with(ResponseTemplate::new(200).set_body_string(mint_body(server)))
            .expect(expected_rpc_calls)
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/put-target"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(expected_rpc_calls)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(query_param("chat-modality", "image"))
            .and(header("next-action", "b".repeat(40).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(sign_body()))
            .expect(expected_rpc_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn three_step_sequence_yields_descriptor() {
        let server = MockServer::start().await;
        mount_happy_path(&server, 1).await;
        let (uploader, _) = uploader_over(&server).await;

        let files = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec())])
            .await
            .unwrap();
        assert_eq!(
            files,
            vec![UploadedFile {
                name: "uploads/k1".into(),
                content_type: "image/png".into(),
                url: "https://cdn.test/signed".into(),
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_bytes_upload_once() {
        let server = MockServer::start().await;
        mount_happy_path(&server, 1).await;
        let (uploader, _) = uploader_over(&server).await;

        let first = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec())])
            .await
            .unwrap();
        // Same bytes again, different filename hint: served from cache,
        // the expect(1) mocks above would trip on a second RPC sequence.
        let second = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec()).with_filename("other.png")])
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_input_touches_nothing() {
        let server = MockServer::start().await;
        let (uploader, session) = uploader_over(&server).await;

        let files = uploader.upload(Vec::new()).await.unwrap();
        assert!(files.is_empty());
        assert_eq!(session.ensures.load(Ordering::SeqCst), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_actions_fail_fast() {
        let server = MockServer::start().await;
        let session = Arc::new(StubSession::new(&server.uri()));
        let config = ArenaConfig {
            origin: server.uri(),
            ..ArenaConfig::default()
        };
        let discovery = Arc::new(Discovery::new(config.clone(), session.clone()));
        discovery
            .seed(&[("m", "id")], &[], &[], ActionIds::default())
            .await;
        let uploader = Uploader::new(config, session, discovery);

        let err = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec())])
            .await
            .unwrap_err();
        assert_matches!(err, ArenaError::ActionsNotLoaded);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_mint_reloads_session_and_retries() {
        let server = MockServer::start().await;
        // First mint attempt fails; mounted first so it wins once.
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("next-action", "a".repeat(40).as_str()))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_happy_path(&server, 1).await;
        let (uploader, session) = uploader_over(&server).await;

        let files = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec())])
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(session.reload_count(), 1);
    }

    #[tokio::test]
    async fn unrecognized_signature_is_rejected() {
        let server = MockServer::start().await;
        let (uploader, _) = uploader_over(&server).await;

        let err = uploader
            .upload(vec![Asset::from_bytes(vec![0, 1, 2, 3])])
            .await
            .unwrap_err();
        assert_matches!(err, ArenaError::UploadFailure(_));
    }

    #[tokio::test]
    async fn mint_payload_body_is_the_json_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("next-action", "a".repeat(40).as_str()))
            .and(body_string(r#"["cat.png","image/png"]"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(mint_body(&server)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("next-action", "b".repeat(40).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(sign_body()))
            .mount(&server)
            .await;
        let (uploader, _) = uploader_over(&server).await;

        let files = uploader
            .upload(vec![Asset::from_bytes(PNG.to_vec()).with_filename("cat.png")])
            .await
            .unwrap();
        assert_eq!(files[0].name, "uploads/k1");
    }

    #[tokio::test]
    async fn data_uri_and_reader_sources_resolve() {
        let encoded = BASE64.encode(PNG);
        let data = resolve_bytes(AssetSource::DataUri(format!(
            "data:image/png;base64,{encoded}"
        )))
        .await
        .unwrap();
        assert_eq!(data, PNG);

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(PNG));
        let data = resolve_bytes(AssetSource::Reader(reader)).await.unwrap();
        assert_eq!(data, PNG);
    }

    #[tokio::test]
    async fn path_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("img.png");
        std::fs::write(&file, PNG).unwrap();
        let data = resolve_bytes(AssetSource::Path(file)).await.unwrap();
        assert_eq!(data, PNG);
    }
}
