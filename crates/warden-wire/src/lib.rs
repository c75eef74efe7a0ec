//! Warden Wire - drive a capsule across a process or host boundary.
//!
//! This crate provides:
//! - Newline-delimited JSON framing and the three message shapes (request,
//!   response, stimulus event)
//! - [`ProtocolHandler`]: caller-side request correlation, stimulus
//!   fan-out and per-invocation stream routing
//! - [`CapsuleServer`]: the capsule-side loop serving a
//!   [`warden_capsule::CapsuleCore`] over any async byte stream
//! - [`RemoteInstance`]: a [`warden_capsule::CapsuleInstance`] that is
//!   observably identical to a local one
//! - [`Transport`] implementations for in-memory halves, child processes
//!   and `ssh` exec channels
//! - [`open_instance`]: pick local or remote placement at construction time
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_capsule::CapsuleInstance;
//! use warden_config::WireConfig;
//! use warden_wire::{CommandTransport, Placement, open_instance};
//!
//! # async fn example() -> warden_core::CapsuleResult<()> {
//! let transport = CommandTransport::ssh("build-host", "warden-shell-host");
//! let instance = open_instance(Placement::remote(transport), &WireConfig::default()).await?;
//! instance.boot().await?;
//! let metadata = instance.describe()?;
//! println!("connected to {}", metadata.name);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod host;
pub mod prelude;

mod error;
mod factory;
mod framing;
mod handler;
mod message;
mod remote;
mod server;
mod transport;

pub use error::{ProtocolError, WireError};
pub use factory::{Placement, open_instance};
pub use framing::{Frame, LineReader, LineWriter};
pub use handler::{PendingResponse, ProtocolHandler, StreamEvent, StreamRoute};
pub use message::{
    Request, Response, STREAM_END, STREAM_ERROR, STREAM_ITEM, WireMessage, WireSource,
    WireStimulus, method,
};
pub use remote::RemoteInstance;
pub use server::CapsuleServer;
pub use transport::{BoxReader, BoxWriter, CommandTransport, StreamTransport, Transport};
