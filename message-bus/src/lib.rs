//! In-process message bus between nodes
//!
//! Provides asynchronous request/response and fire-and-forget delivery with:
//! - One bounded mailbox per registered node
//! - Node-local timeouts (a timeout never cancels the remote handler)
//! - Drop rules that simulate message loss by sender, receiver and kind
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bus;
pub mod error;
pub mod metrics;
pub mod types;

pub use bus::{Bus, BusConfig, Transport};
pub use error::{Error, Result};
pub use types::{DropRule, Envelope, Mailbox, Message, Responder};
