//! stream-clipper: keeps a rolling window of a live stream and its chat, and saves
//! a clip whenever a moderator removes a message.
//!
//! - [`buffers`] - Bounded media and chat buffers
//! - [`orchestrator`] - Reacts to stream lifecycle and chat events
//! - [`persister`] - Clip sinks
//! - [`webhook`] - EventSub lifecycle ingress

pub mod buffers;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod persister;
pub mod utils;
pub mod webhook;

pub use error::{Error, Result};
