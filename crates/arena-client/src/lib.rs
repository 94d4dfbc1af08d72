//! # arena-client
//!
//! The protocol side of the arena client: HTTP transport riding on
//! browser credentials, model and server-action discovery from the
//! rendered page, file uploads, the streaming message engine, and the
//! [`ArenaClient`] facade.
//!
//! ## Modules
//!
//! - [`discovery`]: model catalog and server-action ids from page markup
//! - [`upload`]: content-addressed attachment uploads
//! - [`engine`]: one message in, a stream of events out
//! - [`chat`]: [`ArenaClient`], [`chat::ChatsApi`] and [`chat::ChatSession`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use arena_client::{ArenaClient, ArenaConfig};
//!
//! # async fn run() -> arena_client::Result<()> {
//! let client = ArenaClient::new(ArenaConfig::default());
//! let chat = client.chats().create("gpt-4o");
//! let reply = chat.send("hello").await?;
//! println!("{}", reply.text);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod chat;
pub mod discovery;
pub mod engine;
pub mod upload;

mod sniff;
mod transport;
mod wire;

#[cfg(test)]
mod testutil;

pub use arena_core::config::{ArenaConfig, BrowserConfig};
pub use arena_core::events::{ChatResult, StreamEvent, Usage};
pub use arena_core::{ArenaError, Result};

pub use chat::{ArenaClient, ChatSession, ChatsApi};
pub use engine::{Engine, MessageRequest};
pub use upload::{Asset, UploadedFile};
