//! Last-known position of every connection.
//!
//! The world is the one piece of shared-memory state in the relay: every
//! inbound pump writes to it and snapshot readers scan it concurrently. The
//! map sits behind a `parking_lot::RwLock`; writers exclude each other and
//! readers, and each entry is a `Copy` value stored whole, so a snapshot never
//! observes a partially written position.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::ids::ConnectionId;
use crate::protocol::{Cube, CubeBatch, Position};

/// Shared store of positions keyed by connection.
#[derive(Debug, Default)]
pub struct World {
    players: RwLock<HashMap<ConnectionId, Position>>,
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the position of `id`.
    pub fn update_position(&self, id: &ConnectionId, position: Position) {
        let _ = self.players.write().insert(id.clone(), position);
        trace!(conn_id = %id, x = position.x, y = position.y, z = position.z, "position updated");
    }

    /// Forget `id`. Returns `false` when there was nothing to remove.
    pub fn remove_player(&self, id: &ConnectionId) -> bool {
        self.players.write().remove(id).is_some()
    }

    /// Last recorded position of `id`.
    pub fn position(&self, id: &ConnectionId) -> Option<Position> {
        self.players.read().get(id).copied()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.players.read().len()
    }

    /// Whether no connection has reported a position.
    pub fn is_empty(&self) -> bool {
        self.players.read().is_empty()
    }

    /// Point-in-time copy of every entry as a `cubes` batch, sorted by id.
    pub fn snapshot(&self) -> CubeBatch {
        let mut cubes: Vec<Cube> = {
            let players = self.players.read();
            players
                .iter()
                .map(|(id, pos)| Cube::at(id.clone(), *pos))
                .collect()
        };
        cubes.sort_by(|a, b| a.id.cmp(&b.id));
        CubeBatch::new(cubes)
    }

    /// [`snapshot`](Self::snapshot) serialized to JSON text.
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }
}
