//! High-level client facade and conversation handles.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use uuid::Uuid;

use arena_core::Result;
use arena_core::config::ArenaConfig;
use arena_core::events::{ChatResult, StreamEvent};
use arena_core::session::Session;
use arena_browser::{CdpLauncher, SessionActor};

use crate::discovery::Discovery;
use crate::engine::{Engine, MessageRequest};
use crate::upload::{Asset, Uploader};

/// Entry point. Owns the browser session and the per-origin state; hand
/// out [`ChatSession`]s via [`ArenaClient::chats`].
pub struct ArenaClient {
    discovery: Arc<Discovery>,
    engine: Arc<Engine>,
    actor: Option<SessionActor>,
}

impl ArenaClient {
    /// Client backed by a locally launched Chrome instance.
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        let actor = SessionActor::spawn(config.clone(), Box::new(CdpLauncher));
        let mut client = Self::with_session(config, Arc::new(actor.clone()));
        client.actor = Some(actor);
        client
    }

    /// Client over a caller-provided session. The seam for tests and for
    /// embedding an externally managed browser.
    #[must_use]
    pub fn with_session(config: ArenaConfig, session: Arc<dyn Session>) -> Self {
        let discovery = Arc::new(Discovery::new(config.clone(), Arc::clone(&session)));
        let uploader = Arc::new(Uploader::new(
            config.clone(),
            Arc::clone(&session),
            Arc::clone(&discovery),
        ));
        let engine = Arc::new(Engine::new(config, session, Arc::clone(&discovery), uploader));
        Self {
            discovery,
            engine,
            actor: None,
        }
    }

    /// Drive the session to a usable state and load the model catalog.
    /// Optional; the first message does the same work lazily.
    pub async fn bootstrap(&self) -> Result<()> {
        self.engine.session().ensure_ready(false).await?;
        self.discovery.ensure_loaded().await
    }

    /// Names of every known model, sorted.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.engine.session().ensure_ready(false).await?;
        self.discovery.ensure_loaded().await?;
        Ok(self.discovery.model_names().await)
    }

    /// Conversation management surface.
    #[must_use]
    pub fn chats(&self) -> ChatsApi {
        ChatsApi {
            engine: Arc::clone(&self.engine),
        }
    }

    /// One-shot send without a conversation handle.
    pub async fn send_message(&self, request: MessageRequest) -> Result<ChatResult> {
        self.engine.send_message(request).await
    }

    /// One-shot stream without a conversation handle.
    pub fn stream_message(
        &self,
        request: MessageRequest,
    ) -> impl Stream<Item = Result<StreamEvent>> + Send + use<> {
        self.engine.stream_message(request)
    }

    /// Close the browser, if this client launched one.
    pub async fn close(&self) {
        if let Some(actor) = &self.actor {
            actor.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }
}

/// Creates and resumes conversations.
pub struct ChatsApi {
    engine: Arc<Engine>,
}

impl ChatsApi {
    /// New conversation with `model`. The id is minted locally so it is
    /// known before the first send.
    #[must_use]
    pub fn create(&self, model: impl Into<String>) -> ChatSession {
        ChatSession {
            engine: Arc::clone(&self.engine),
            model: model.into(),
            conversation: Arc::new(parking_lot::Mutex::new(Conversation {
                id: Uuid::now_v7().to_string(),
                fresh: true,
            })),
        }
    }

    /// Handle onto an existing conversation.
    #[must_use]
    pub fn resume(&self, model: impl Into<String>, id: impl Into<String>) -> ChatSession {
        ChatSession {
            engine: Arc::clone(&self.engine),
            model: model.into(),
            conversation: Arc::new(parking_lot::Mutex::new(Conversation {
                id: id.into(),
                fresh: false,
            })),
        }
    }
}

struct Conversation {
    id: String,
    fresh: bool,
}

/// One conversation. Sends go through the owning client's engine; the
/// conversation id tracks what the service last confirmed, so clones of
/// a handle stay in sync.
pub struct ChatSession {
    engine: Arc<Engine>,
    model: String,
    conversation: Arc<parking_lot::Mutex<Conversation>>,
}

impl Clone for ChatSession {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            model: self.model.clone(),
            conversation: Arc::clone(&self.conversation),
        }
    }
}

impl ChatSession {
    /// The model this conversation talks to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Current conversation id.
    #[must_use]
    pub fn conversation_id(&self) -> String {
        self.conversation.lock().id.clone()
    }

    /// Send a text message and wait for the full reply.
    pub async fn send(&self, prompt: impl Into<String>) -> Result<ChatResult> {
        self.send_with_assets(prompt, Vec::new()).await
    }

    /// Send a message with attachments and wait for the full reply.
    pub async fn send_with_assets(
        &self,
        prompt: impl Into<String>,
        assets: Vec<Asset>,
    ) -> Result<ChatResult> {
        let result = self.engine.send_message(self.request(prompt, assets)).await?;
        self.confirm(&result.conversation_id);
        Ok(result)
    }

    /// Stream a text message.
    pub fn stream<P: Into<String>>(
        &self,
        prompt: P,
    ) -> impl Stream<Item = Result<StreamEvent>> + Send + use<P> {
        self.stream_with_assets(prompt, Vec::new())
    }

    /// Stream a message with attachments. The conversation is confirmed
    /// when the terminal event arrives; an aborted first send leaves the
    /// handle fresh so a retry still creates the conversation.
    pub fn stream_with_assets<P: Into<String>>(
        &self,
        prompt: P,
        assets: Vec<Asset>,
    ) -> impl Stream<Item = Result<StreamEvent>> + Send + use<P> {
        let engine = Arc::clone(&self.engine);
        let conversation = Arc::clone(&self.conversation);
        let request = self.request(prompt, assets);
        async_stream::try_stream! {
            let mut inner = std::pin::pin!(engine.stream_message(request));
            while let Some(event) = inner.next().await {
                let event = event?;
                if let StreamEvent::Final { conversation_id, .. } = &event {
                    let mut conv = conversation.lock();
                    conv.id.clone_from(conversation_id);
                    conv.fresh = false;
                }
                yield event;
            }
        }
    }

    fn request(&self, prompt: impl Into<String>, assets: Vec<Asset>) -> MessageRequest {
        let conv = self.conversation.lock();
        MessageRequest {
            model: self.model.clone(),
            prompt: prompt.into(),
            conversation_id: Some(conv.id.clone()),
            create_new: conv.fresh,
            assets,
            timeout: None,
        }
    }

    fn confirm(&self, id: &str) {
        let mut conv = self.conversation.lock();
        if !id.is_empty() {
            conv.id = id.to_string();
        }
        conv.fresh = false;
    }
}
