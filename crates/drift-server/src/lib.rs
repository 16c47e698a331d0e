// SPDX-License-Identifier: Apache-2.0
//! Drift hub: a real-time document-state synchronization server.
//!
//! The hub keeps a set of named JSON-like documents, ticks each one on its
//! own cadence, and streams minimal patches to every subscribed session
//! over framed transports. Sessions that fall behind are resynchronized
//! with a fresh snapshot instead of an unbounded backlog; documents
//! checkpoint themselves to a pluggable store without stalling their tick.
//!
//! Application behaviour plugs in through the [`Hooks`] trait; everything
//! else — diffing, fan-out, backpressure, persistence debouncing — is the
//! hub's job.

mod broker;
mod config;
mod doc;
mod error;
mod hooks;
mod outbound;
mod persist;
mod registry;
mod server;
mod session;
pub mod prefs;

pub use config::ServerConfig;
pub use error::ServerError;
pub use hooks::{Hooks, NoHooks, SessionInfo, TickContext};
pub use registry::{DocRouter, Registry};
pub use server::Server;
