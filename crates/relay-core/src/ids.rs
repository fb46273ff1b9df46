//! Connection identities.
//!
//! A [`ConnectionId`] is `player_` followed by a UUID v7. UUID v7 is
//! time-ordered and carries random bits, so two connections accepted in the
//! same clock tick still get distinct identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix shared by every generated identity.
pub const ID_PREFIX: &str = "player_";

/// Identity of one live connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
