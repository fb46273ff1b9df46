//! Wire shapes consumed and produced by the relay.
//!
//! Inbound text frames may carry a position record: a JSON object with
//! numeric `x`, `y` and `z`. All three must be present; anything else is an
//! opaque payload and is relayed untouched.
//!
//! Outbound, the world is published as a `cubes` batch (the format the game
//! client spawns cubes from) and position acknowledgements as `ack` records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ConnectionId;

/// Discriminator of the snapshot batch.
pub const CUBES_TYPE: &str = "cubes";
/// Discriminator of a position acknowledgement.
pub const ACK_TYPE: &str = "ack";
/// Color given to every cube until colors are tracked.
pub const DEFAULT_COLOR: &str = "#FFFFFF";

/// A point in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Position {
    /// Build a position from its coordinates.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Classify a text payload as a position record.
///
/// Returns `None` unless the payload is a JSON object whose `x`, `y` and `z`
/// are all numbers. Extra fields are ignored; `null` counts as missing.
pub fn parse_position(payload: &str) -> Option<Position> {
    let Value::Object(map) = serde_json::from_str::<Value>(payload).ok()? else {
        return None;
    };
    let coord = |key: &str| map.get(key).and_then(Value::as_f64);
    Some(Position {
        x: coord("x")?,
        y: coord("y")?,
        z: coord("z")?,
    })
}

/// One entity of a [`CubeBatch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    /// Owning connection.
    pub id: ConnectionId,
    /// Display color (placeholder until tracked).
    pub color: String,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
    /// Orientation quaternion X.
    pub qx: f64,
    /// Orientation quaternion Y.
    pub qy: f64,
    /// Orientation quaternion Z.
    pub qz: f64,
    /// Orientation quaternion W.
    pub qw: f64,
}

impl Cube {
    /// A cube at `position` with default color and identity rotation.
    pub fn at(id: ConnectionId, position: Position) -> Self {
        Self {
            id,
            color: DEFAULT_COLOR.to_owned(),
            x: position.x,
            y: position.y,
            z: position.z,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
            qw: 1.0,
        }
    }

    /// The cube's position.
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }
}

/// Batch of every known entity, as published to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CubeBatch {
    /// Always [`CUBES_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// One entry per tracked connection.
    pub cubes: Vec<Cube>,
}

impl CubeBatch {
    /// Wrap a list of cubes.
    pub fn new(cubes: Vec<Cube>) -> Self {
        Self {
            kind: CUBES_TYPE.to_owned(),
            cubes,
        }
    }
}

/// Normalized reply to the connection that reported a position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionAck {
    /// Always [`ACK_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Connection the position was recorded for.
    pub id: ConnectionId,
    /// Recorded X.
    pub x: f64,
    /// Recorded Y.
    pub y: f64,
    /// Recorded Z.
    pub z: f64,
}

impl PositionAck {
    /// Acknowledge `position` for `id`.
    pub fn new(id: ConnectionId, position: Position) -> Self {
        Self {
            kind: ACK_TYPE.to_owned(),
            id,
            x: position.x,
            y: position.y,
            z: position.z,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_record_parses() {
        let pos = parse_position(r#"{"x":1,"y":2,"z":3}"#).unwrap();
        assert_eq!(pos, Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn fractional_and_negative_coordinates() {
        let pos = parse_position(r#"{"x":-1.5,"y":0.25,"z":1e3}"#).unwrap();
        assert_eq!(pos, Position::new(-1.5, 0.25, 1000.0));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let pos = parse_position(r#"{"x":1,"y":2,"z":3,"name":"cube"}"#).unwrap();
        assert_eq!(pos, Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn missing_coordinate_is_not_a_position() {
        assert!(parse_position(r#"{"x":1,"y":2}"#).is_none());
        assert!(parse_position(r#"{"y":2,"z":3}"#).is_none());
    }

    #[test]
    fn null_coordinate_is_not_a_position() {
        assert!(parse_position(r#"{"x":1,"y":null,"z":3}"#).is_none());
    }

    #[test]
    fn non_numeric_coordinate_is_not_a_position() {
        assert!(parse_position(r#"{"x":"1","y":2,"z":3}"#).is_none());
        assert!(parse_position(r#"{"x":true,"y":2,"z":3}"#).is_none());
    }

    #[test]
    fn non_object_json_is_not_a_position() {
        assert!(parse_position("[1,2,3]").is_none());
        assert!(parse_position("42").is_none());
        assert!(parse_position(r#""x""#).is_none());
    }

    #[test]
    fn garbage_is_not_a_position() {
        assert!(parse_position("hello").is_none());
        assert!(parse_position("").is_none());
        assert!(parse_position("{").is_none());
    }

    #[test]
    fn cube_defaults() {
        let cube = Cube::at("player_1".into(), Position::new(1.0, 2.0, 3.0));
        assert_eq!(cube.color, DEFAULT_COLOR);
        assert_eq!((cube.qx, cube.qy, cube.qz, cube.qw), (0.0, 0.0, 0.0, 1.0));
        assert_eq!(cube.position(), Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn cube_batch_wire_shape() {
        let batch = CubeBatch::new(vec![Cube::at(
            "player_1".into(),
            Position::new(1.0, 2.0, 3.0),
        )]);
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["type"], "cubes");
        let cube = &value["cubes"][0];
        assert_eq!(cube["id"], "player_1");
        assert_eq!(cube["color"], "#FFFFFF");
        assert_eq!(cube["x"], 1.0);
        assert_eq!(cube["y"], 2.0);
        assert_eq!(cube["z"], 3.0);
        assert_eq!(cube["qw"], 1.0);
    }

    #[test]
    fn ack_wire_shape() {
        let ack = PositionAck::new("player_9".into(), Position::new(4.0, 5.0, 6.0));
        let value: Value = serde_json::from_str(&ack.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["id"], "player_9");
        assert_eq!(value["x"], 4.0);
        assert_eq!(value["z"], 6.0);
    }

    #[test]
    fn ack_payload_is_itself_a_position_record() {
        let ack = PositionAck::new("p".into(), Position::new(1.0, 2.0, 3.0));
        let pos = parse_position(&ack.to_json().unwrap()).unwrap();
        assert_eq!(pos, Position::new(1.0, 2.0, 3.0));
    }
}
