//! # relay-server
//!
//! The relay hub and everything around it.
//!
//! - [`hub`]: single-task coordinator owning the live set and fan-out
//! - [`websocket`]: transport seam, per-connection pumps, echo route, snapshot publisher
//! - [`server`]: axum router (`/ws`, `/echo`, `/health`, `/world`, `/metrics`)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{HubError, ServerError};
pub use hub::{Audience, BroadcastEnvelope, Hub, HubHandle, Payload};
pub use server::RelayServer;
