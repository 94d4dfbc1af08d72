//! # arena-core
//!
//! Foundation types for the arena client.
//!
//! This crate provides the shared vocabulary the other arena crates depend on:
//!
//! - **Errors**: [`errors::ArenaError`] taxonomy via `thiserror`
//! - **Configuration**: [`config::ArenaConfig`] and [`config::BrowserConfig`]
//! - **Session seam**: the [`session::Session`] trait plus
//!   [`session::CredentialSnapshot`] value types
//! - **Stream events**: [`events::StreamEvent`], [`events::Usage`],
//!   [`events::ChatResult`]
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `arena-browser` and `arena-client`.

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod events;
pub mod session;

pub use errors::{ArenaError, Result};
