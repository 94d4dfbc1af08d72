//! The streaming engine: routes one user message to the service and
//! decodes the response stream into events.
//!
//! The retry rule is positional, not category based: a failure before the
//! first emitted event reloads the browser session and retries once; any
//! failure after an event has been emitted propagates unmodified, so a
//! consumer never sees duplicated output.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use arena_core::config::ArenaConfig;
use arena_core::events::{ChatResult, StreamEvent};
use arena_core::session::Session;
use arena_core::{ArenaError, Result};

use crate::discovery::Discovery;
use crate::transport;
use crate::upload::{Asset, Uploader};
use crate::wire::{self, Frame};

const MAX_ATTEMPTS: u32 = 2;

/// One user message to send.
pub struct MessageRequest {
    /// Target model name. Empty selects the default model.
    pub model: String,
    /// Message text.
    pub prompt: String,
    /// Existing conversation to continue, if any.
    pub conversation_id: Option<String>,
    /// Force the conversation-creating endpoint even when an id is
    /// supplied. Lets callers hand out ids before the first send.
    pub create_new: bool,
    /// Assets to attach.
    pub assets: Vec<Asset>,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
}

impl MessageRequest {
    /// A plain text message to `model`.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            conversation_id: None,
            create_new: false,
            assets: Vec::new(),
            timeout: None,
        }
    }
}

/// Streaming engine over a session, discovery state, and uploader.
pub struct Engine {
    config: ArenaConfig,
    session: Arc<dyn Session>,
    discovery: Arc<Discovery>,
    uploader: Arc<Uploader>,
}

impl Engine {
    /// Wire up an engine.
    #[must_use]
    pub fn new(
        config: ArenaConfig,
        session: Arc<dyn Session>,
        discovery: Arc<Discovery>,
        uploader: Arc<Uploader>,
    ) -> Self {
        Self {
            config,
            session,
            discovery,
            uploader,
        }
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Stream one message. The stream is finite; it ends after the
    /// terminal event or the first propagated error and cannot be
    /// restarted.
    ///
    /// If the connection dies between the last delta and the terminal
    /// frame the error propagates; the consumer keeps whatever it already
    /// received.
    pub fn stream_message(
        &self,
        request: MessageRequest,
    ) -> impl Stream<Item = Result<StreamEvent>> + Send + use<> {
        let config = self.config.clone();
        let session = Arc::clone(&self.session);
        let discovery = Arc::clone(&self.discovery);
        let uploader = Arc::clone(&self.uploader);

        async_stream::try_stream! {
            session.ensure_ready(false).await?;
            discovery.ensure_loaded().await?;

            let model = if request.model.is_empty() {
                discovery.default_model().await
            } else {
                request.model.clone()
            };
            let model_id = discovery
                .resolve_model_id(&model)
                .await
                .ok_or_else(|| ArenaError::ModelUnavailable(model.clone()))?;

            if !request.assets.is_empty() && !discovery.supports_vision_input(&model).await {
                Err(ArenaError::VisionUnsupported(model.clone()))?;
            }

            let modality = if discovery.is_image_output_model(&model).await {
                "image"
            } else {
                "chat"
            };

            // Routing: create_new forces the conversation-creating
            // endpoint even with a caller-supplied id.
            let origin = config.origin_trimmed().to_string();
            let (url, conversation_id) = match (&request.conversation_id, request.create_new) {
                (Some(id), false) => (
                    format!("{origin}/nextjs-api/stream/post-to-evaluation/{id}"),
                    id.clone(),
                ),
                (id, _) => (
                    format!("{origin}/nextjs-api/stream/create-evaluation"),
                    id.clone().unwrap_or_else(|| Uuid::now_v7().to_string()),
                ),
            };
            let user_message_id = Uuid::now_v7().to_string();
            let model_message_id = Uuid::now_v7().to_string();

            let files = uploader.upload(request.assets).await?;
            let timeout = request
                .timeout
                .unwrap_or(Duration::from_secs(config.timeout_secs));

            tracing::debug!(model, %url, conversation = %conversation_id, "sending message");

            let mut emitted = false;
            let mut attempt = 0u32;
            'attempts: loop {
                attempt += 1;

                let opened = async {
                    let creds = session.credential_snapshot().await?;
                    let token = session.challenge_token().await?;
                    let payload = json!({
                        "id": conversation_id,
                        "mode": "direct",
                        "modelAId": model_id,
                        "userMessageId": user_message_id,
                        "modelAMessageId": model_message_id,
                        "userMessage": {
                            "content": request.prompt,
                            "experimental_attachments": files,
                            "metadata": {},
                        },
                        "modality": modality,
                        "recaptchaV3Token": token,
                    });
                    let client = transport::build_client(timeout)?;
                    let response = transport::apply_credentials(client.post(&url), &creds)
                        .json(&payload)
                        .send()
                        .await?;
                    transport::ensure_ok(response).await
                }
                .await;

                let response = match opened {
                    Ok(response) => response,
                    Err(e) => {
                        retry_or_bail(&session, e, emitted, attempt).await?;
                        continue 'attempts;
                    }
                };

                let body = StreamReader::new(
                    response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(std::io::Error::other)),
                );
                let mut lines =
                    tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(body));

                let mut failure: Option<ArenaError> = None;
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            failure = Some(ArenaError::Protocol(format!(
                                "stream read failed: {e}"
                            )));
                            break;
                        }
                    };
                    match wire::decode_frame(line.trim_end_matches('\r')) {
                        Ok(Some(Frame::Text(delta))) => {
                            emitted = true;
                            yield StreamEvent::TextDelta(delta);
                        }
                        Ok(Some(Frame::Images(urls))) => {
                            emitted = true;
                            yield StreamEvent::ImageBatch(urls);
                        }
                        Ok(Some(Frame::Finish { finish_reason, usage })) => {
                            emitted = true;
                            yield StreamEvent::Final {
                                conversation_id: conversation_id.clone(),
                                finish_reason,
                                usage,
                            };
                        }
                        Ok(None) => {}
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                match failure {
                    None => break 'attempts,
                    Some(e) => {
                        retry_or_bail(&session, e, emitted, attempt).await?;
                    }
                }
            }
        }
    }

    /// Non-streaming helper: drains the stream into a [`ChatResult`].
    #[tracing::instrument(skip_all, fields(model = %request.model))]
    pub async fn send_message(&self, request: MessageRequest) -> Result<ChatResult> {
        let fallback_id = request.conversation_id.clone().unwrap_or_default();
        let mut stream = std::pin::pin!(self.stream_message(request));

        let mut result = ChatResult {
            conversation_id: fallback_id,
            ..ChatResult::default()
        };
        while let Some(event) = stream.next().await {
            result.absorb(event?);
        }
        Ok(result)
    }
}

/// Decide the fate of a failed attempt: reload and retry while nothing
/// has been emitted and attempts remain, propagate otherwise.
async fn retry_or_bail(
    session: &Arc<dyn Session>,
    error: ArenaError,
    emitted: bool,
    attempt: u32,
) -> Result<()> {
    if emitted || attempt >= MAX_ATTEMPTS {
        return Err(error);
    }
    tracing::warn!(attempt, error = %error, "stream attempt failed, reloading session");
    if let Err(e) = session.reload_session().await {
        tracing::warn!(error = %e, "session reload failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ActionIds;
    use crate::testutil::StubSession;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn engine_over(server: &MockServer) -> (Engine, Arc<StubSession>) {
        let session = Arc::new(StubSession::new(&server.uri()));
        let config = ArenaConfig {
            origin: server.uri(),
            ..ArenaConfig::default()
        };
        let discovery = Arc::new(Discovery::new(config.clone(), session.clone()));
        discovery
            .seed(
                &[("alpha-chat", "id-alpha"), ("zeta-chat", "id-zeta")],
                &[("painter", "id-painter")],
                &["alpha-chat", "painter"],
                ActionIds {
                    generate_upload_url: Some("a".repeat(40)),
                    get_signed_url: Some("b".repeat(40)),
                },
            )
            .await;
        let uploader = Arc::new(Uploader::new(
            config.clone(),
            session.clone(),
            discovery.clone(),
        ));
        (
            Engine::new(config, session.clone(), discovery, uploader),
            session,
        )
    }

    fn stream_body(lines: &[&str]) -> String {
        let mut body = lines.join("\n");
        body.push('\n');
        body
    }

    #[tokio::test]
    async fn decodes_text_and_final_frames() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/create-evaluation"))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"a0:"Hello, ""#,
                r#"a2:[{"type":"heartbeat"}]"#,
                r#"a0:"world""#,
                r#"ad:{"finishReason":"stop","usage":{"promptTokens":2,"completionTokens":5}}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let result = engine
            .send_message(MessageRequest::new("alpha-chat", "hi"))
            .await
            .unwrap();
        assert_eq!(result.text, "Hello, world");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage.unwrap().total_tokens, 7);
        assert!(!result.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn continues_existing_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/post-to-evaluation/conv-9"))
            .and(body_partial_json(json!({"id": "conv-9", "mode": "direct"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"a0:"ok""#,
                r#"ad:{"finishReason":"stop"}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let request = MessageRequest {
            conversation_id: Some("conv-9".to_string()),
            ..MessageRequest::new("alpha-chat", "again")
        };
        let result = engine.send_message(request).await.unwrap();
        assert_eq!(result.conversation_id, "conv-9");
    }

    #[tokio::test]
    async fn create_new_keeps_supplied_id_on_create_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/create-evaluation"))
            .and(body_partial_json(json!({"id": "pre-minted"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"ad:{"finishReason":"stop"}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let request = MessageRequest {
            conversation_id: Some("pre-minted".to_string()),
            create_new: true,
            ..MessageRequest::new("alpha-chat", "first")
        };
        let result = engine.send_message(request).await.unwrap();
        assert_eq!(result.conversation_id, "pre-minted");
    }

    #[tokio::test]
    async fn unknown_model_fails_without_any_request() {
        let server = MockServer::start().await;
        let (engine, _) = engine_over(&server).await;

        let err = engine
            .send_message(MessageRequest::new("no-such-model", "hi"))
            .await
            .unwrap_err();
        assert_matches!(err, ArenaError::ModelUnavailable(name) if name == "no-such-model");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assets_to_non_vision_model_fail_before_upload() {
        let server = MockServer::start().await;
        let (engine, _) = engine_over(&server).await;

        let request = MessageRequest {
            assets: vec![Asset::from_bytes(b"\x89PNG\r\n\x1a\n..".to_vec())],
            ..MessageRequest::new("zeta-chat", "look")
        };
        let err = engine.send_message(request).await.unwrap_err();
        assert_matches!(err, ArenaError::VisionUnsupported(name) if name == "zeta-chat");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_model_uses_image_modality() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/create-evaluation"))
            .and(body_partial_json(json!({"modality": "image"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"a2:[{"image":"https://img.test/out.png"}]"#,
                r#"ad:{"finishReason":"stop"}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let result = engine
            .send_message(MessageRequest::new("painter", "a cat"))
            .await
            .unwrap();
        assert_eq!(result.image_urls, vec!["https://img.test/out.png"]);
    }

    #[tokio::test]
    async fn failure_before_first_event_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/create-evaluation"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/nextjs-api/stream/create-evaluation"))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"a0:"recovered""#,
                r#"ad:{"finishReason":"stop"}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, session) = engine_over(&server).await;

        let result = engine
            .send_message(MessageRequest::new("alpha-chat", "hi"))
            .await
            .unwrap();
        assert_eq!(result.text, "recovered");
        assert_eq!(session.reload_count(), 1);
    }

    #[tokio::test]
    async fn failure_after_first_event_propagates_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("/nextjs-api/stream/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_string(stream_body(&[
                r#"a0:"partial""#,
                r#"a3:{"message":"mid-stream failure"}"#,
            ])))
            .expect(1)
            .mount(&server)
            .await;
        let (engine, session) = engine_over(&server).await;

        let mut stream = std::pin::pin!(engine.stream_message(MessageRequest::new("alpha-chat", "hi")));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, StreamEvent::TextDelta("partial".to_string()));
        let second = stream.next().await.unwrap();
        assert_matches!(second, Err(ArenaError::Protocol(_)));
        assert!(stream.next().await.is_none());
        assert_eq!(session.reload_count(), 0);
    }

    #[tokio::test]
    async fn error_sentinel_aborts_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("/nextjs-api/stream/.*"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(stream_body(&[r#"a0:"hasArenaError""#])),
            )
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let err = engine
            .send_message(MessageRequest::new("alpha-chat", "hi"))
            .await
            .unwrap_err();
        assert_matches!(err, ArenaError::Protocol(_));
    }

    #[tokio::test]
    async fn clean_end_without_terminal_frame_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("/nextjs-api/stream/.*"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(stream_body(&[r#"a0:"only text""#])),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine_over(&server).await;

        let result = engine
            .send_message(MessageRequest::new("alpha-chat", "hi"))
            .await
            .unwrap();
        assert_eq!(result.text, "only text");
        assert_eq!(result.finish_reason, None);
    }
}
