//! # relay-core
//!
//! Foundation types shared by every relay crate.
//!
//! - [`ids::ConnectionId`]: identity assigned to each live connection
//! - [`protocol`]: position records, the `cubes` snapshot batch, acknowledgements
//! - [`world::World`]: last-known position per connection, behind an RW lock
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod protocol;
pub mod world;

pub use ids::ConnectionId;
pub use protocol::Position;
pub use world::World;
