//! # arena-browser
//!
//! The browser side of the arena client: Chrome discovery and launch, a
//! raw DevTools protocol client, and the session actor that owns the
//! browser and serializes every operation against it.
//!
//! The actor implements [`arena_core::session::Session`]; everything above
//! this crate talks to the browser only through that trait.
//!
//! ## Modules
//!
//! - [`chrome`]: locating a Chrome/Chromium binary
//! - [`cdp`]: the DevTools WebSocket client and process lifecycle
//! - [`backend`]: the [`backend::BrowserBackend`] seam the actor drives
//! - [`actor`]: the [`actor::SessionActor`] worker and bootstrap sequence

#![deny(unsafe_code)]

pub mod actor;
pub mod backend;
pub mod cdp;
pub mod chrome;

pub use actor::SessionActor;
pub use backend::{BrowserBackend, BrowserLauncher};
pub use cdp::CdpLauncher;
