use std::fmt;

use bevy::reflect::Reflect;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Terrain classification of a single hex tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum Terrain {
    Mine,
    Slime,
    Wild,
    Turret,
}

impl fmt::Display for Terrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Terrain::Mine => "Mine",
            Terrain::Slime => "Slime",
            Terrain::Wild => "Wild",
            Terrain::Turret => "Turret",
        };
        f.write_str(name)
    }
}

/// Server-assigned identity of one connected client. Never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partial tile data carried in the `data` field of tile messages.
/// Absent fields leave the stored tile untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terrain: Option<Terrain>,
}

impl TilePatch {
    pub fn terrain(terrain: Terrain) -> Self {
        Self {
            terrain: Some(terrain),
        }
    }
}

/// One addressed entry of a snapshot or batch update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileState {
    pub col: i32,
    pub row: i32,
    pub data: TilePatch,
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Asks for a full `grid_state` snapshot. Sent once per established session.
    RequestGridState,
    TileUpdate { col: i32, row: i32, data: TilePatch },
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot: establishes grid dimensions and initial tile contents.
    GridState {
        width: u32,
        height: u32,
        tiles: Vec<TileState>,
    },
    TileUpdate { col: i32, row: i32, data: TilePatch },
    TilesUpdate { tiles: Vec<TileState> },
}

/// Values of the `type` discriminator that decode into a [`ServerMessage`].
const SERVER_MESSAGE_TYPES: [&str; 3] = ["grid_state", "tile_update", "tiles_update"];

/// Values of the `type` discriminator that decode into a [`ClientMessage`].
const CLIENT_MESSAGE_TYPES: [&str; 2] = ["request_grid_state", "tile_update"];

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no \"type\" discriminator")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// Encodes a message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a JSON text frame received by the client.
pub fn decode(text: &str) -> Result<ServerMessage, DecodeError> {
    decode_tagged(text, &SERVER_MESSAGE_TYPES)
}

/// Decodes a JSON text frame received by the server.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeError> {
    decode_tagged(text, &CLIENT_MESSAGE_TYPES)
}

/// The `type` discriminator is checked before the payload so that frames of an
/// unknown kind can be told apart from broken ones.
fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    if !known.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_grid_state_has_no_payload() {
        let encoded = encode(&ClientMessage::RequestGridState).unwrap();
        assert_eq!(encoded, r#"{"type":"request_grid_state"}"#);
    }

    #[test]
    fn test_tile_update_wire_shape() {
        let msg = ClientMessage::TileUpdate {
            col: 3,
            row: 7,
            data: TilePatch::terrain(Terrain::Slime),
        };
        let encoded = encode(&msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "tile_update",
                "col": 3,
                "row": 7,
                "data": { "terrain": "Slime" },
            })
        );
    }

    #[test]
    fn test_empty_patch_omits_terrain() {
        let encoded = serde_json::to_string(&TilePatch::default()).unwrap();
        assert_eq!(encoded, "{}");
    }

    #[test]
    fn test_decode_grid_state() {
        let text = r#"{"type":"grid_state","width":2,"height":1,
            "tiles":[{"col":0,"row":0,"data":{"terrain":"Wild"}}]}"#;
        match decode(text).unwrap() {
            ServerMessage::GridState {
                width,
                height,
                tiles,
            } => {
                assert_eq!(width, 2);
                assert_eq!(height, 1);
                assert_eq!(
                    tiles,
                    vec![TileState {
                        col: 0,
                        row: 0,
                        data: TilePatch::terrain(Terrain::Wild),
                    }]
                );
            }
            other => panic!("Expected GridState, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_tile_update_with_partial_data() {
        let text = r#"{"type":"tile_update","col":1,"row":2,"data":{}}"#;
        assert_eq!(
            decode(text).unwrap(),
            ServerMessage::TileUpdate {
                col: 1,
                row: 2,
                data: TilePatch { terrain: None },
            }
        );
    }

    #[test]
    fn test_decode_ignores_unknown_tile_fields() {
        let text =
            r#"{"type":"tile_update","col":0,"row":0,"data":{"terrain":"Mine","owner":4}}"#;
        assert_eq!(
            decode(text).unwrap(),
            ServerMessage::TileUpdate {
                col: 0,
                row: 0,
                data: TilePatch::terrain(Terrain::Mine),
            }
        );
    }

    #[test]
    fn test_decode_tiles_update() {
        let text = r#"{"type":"tiles_update","tiles":[
            {"col":0,"row":0,"data":{"terrain":"Turret"}},
            {"col":1,"row":0,"data":{"terrain":"Slime"}}]}"#;
        match decode(text).unwrap() {
            ServerMessage::TilesUpdate { tiles } => {
                assert_eq!(tiles.len(), 2);
                assert_eq!(tiles[0].data.terrain, Some(Terrain::Turret));
                assert_eq!(tiles[1].col, 1);
            }
            other => panic!("Expected TilesUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_missing_type() {
        assert!(matches!(
            decode(r#"{"col":1,"row":1}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::MissingType)));
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode(r#"{"type":"chat","text":"hi"}"#) {
            Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "chat"),
            other => panic!("Expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_known_type_bad_payload() {
        let text = r#"{"type":"tile_update","col":"a","row":0,"data":{}}"#;
        assert!(matches!(decode(text), Err(DecodeError::Malformed(_))));

        let text = r#"{"type":"tile_update","col":0,"row":0,"data":{"terrain":"Lava"}}"#;
        assert!(matches!(decode(text), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_client_messages() {
        assert_eq!(
            decode_client_message(r#"{"type":"request_grid_state"}"#).unwrap(),
            ClientMessage::RequestGridState
        );
        assert_eq!(
            decode_client_message(r#"{"type":"tile_update","col":2,"row":5,"data":{"terrain":"Slime"}}"#)
                .unwrap(),
            ClientMessage::TileUpdate {
                col: 2,
                row: 5,
                data: TilePatch::terrain(Terrain::Slime),
            }
        );
        // A server-only kind is unknown to the server.
        assert!(matches!(
            decode_client_message(r#"{"type":"grid_state","width":1,"height":1,"tiles":[]}"#),
            Err(DecodeError::UnknownType(kind)) if kind == "grid_state"
        ));
    }

    #[test]
    fn test_terrain_display() {
        assert_eq!(Terrain::Mine.to_string(), "Mine");
        assert_eq!(Terrain::Turret.to_string(), "Turret");
    }
}
