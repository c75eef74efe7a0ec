//! Warden Test - Shared test utilities for warden capsules.
//!
//! This crate provides fixture capsules, recording mocks and a harness that
//! runs any definition behind a real wire connection, for use across warden
//! crates as a dev-dependency.
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! warden-test.workspace = true
//! ```
//!
//! Then use in your tests:
//!
//! ```rust,ignore
//! #[cfg(test)]
//! mod tests {
//!     use warden_capsule::CapsuleInstance;
//!     use warden_test::{math_capsule, remote_pair};
//!
//!     #[tokio::test]
//!     async fn test_remote_add() {
//!         let pair = remote_pair(math_capsule()).await.unwrap();
//!         pair.instance.boot().await.unwrap();
//!
//!         let sum = pair
//!             .instance
//!             .trigger("math", "add", serde_json::json!({"a": 2, "b": 3}), None)
//!             .await
//!             .unwrap()
//!             .into_value()
//!             .unwrap();
//!         assert_eq!(sum, 5);
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
