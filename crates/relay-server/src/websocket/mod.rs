//! WebSocket transport seam, per-connection pumps, echo route, and the
//! periodic world snapshot.

pub mod connection;
pub mod echo;
pub mod snapshot;
pub mod transport;
