use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::canvas::grid::Grid;

/// The one message type, used in both directions.
///
/// Absent fields are omitted on the wire. An absent `grid` means the frame
/// carries no grid change; it never means "clear the grid".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasMessage {
    /// Full grid snapshot, row-major
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<Arc<Grid>>,
    /// Sender's cursor row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<usize>,
    /// Sender's cursor column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<usize>,
    /// Assigned display color (server to client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Overlay/effect tint (server to client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    /// Remote endpoint -> cursor (server to client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursors: Option<HashMap<String, Cursor>>,
    /// Live client count (server to client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_clients: Option<usize>,
    /// Present on explosion frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bomb: Option<BombMarker>,
    /// Client hint asking for trigger detection on this edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_sequences: Option<bool>,
}

/// A client's tracked position and display color
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: usize,
    pub y: usize,
    pub color: String,
}

impl Cursor {
    pub fn at_origin(color: impl Into<String>) -> Self {
        Self {
            x: 0,
            y: 0,
            color: color.into(),
        }
    }
}

/// Effect marker carried by explosion frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BombMarker {
    pub color: String,
}

/// A client edit with its required fields present
#[derive(Debug, Clone)]
pub struct Edit {
    pub grid: Arc<Grid>,
    pub x: usize,
    pub y: usize,
    pub check_sequences: bool,
}

impl CanvasMessage {
    /// Initial frame for a client that just joined
    pub fn snapshot(
        grid: Arc<Grid>,
        cursor: &Cursor,
        cursors: HashMap<String, Cursor>,
        connected_clients: usize,
    ) -> Self {
        Self {
            grid: Some(grid),
            x: Some(cursor.x),
            y: Some(cursor.y),
            color: Some(cursor.color.clone()),
            cursors: Some(cursors),
            connected_clients: Some(connected_clients),
            ..Default::default()
        }
    }

    /// Rebroadcast of one client's edit
    pub fn edit(grid: Arc<Grid>, cursor: &Cursor) -> Self {
        Self {
            grid: Some(grid),
            x: Some(cursor.x),
            y: Some(cursor.y),
            color: Some(cursor.color.clone()),
            ..Default::default()
        }
    }

    /// Grid-only frame
    pub fn grid(grid: Arc<Grid>) -> Self {
        Self {
            grid: Some(grid),
            ..Default::default()
        }
    }

    /// Grid frame with an overlay tint
    pub fn tinted(grid: Arc<Grid>, text_color: &str) -> Self {
        Self {
            grid: Some(grid),
            text_color: Some(text_color.to_string()),
            ..Default::default()
        }
    }

    /// One tinted step of an explosion
    pub fn explosion(grid: Arc<Grid>, tint: &str) -> Self {
        Self {
            bomb: Some(BombMarker {
                color: tint.to_string(),
            }),
            ..Self::tinted(grid, tint)
        }
    }

    /// Count-only presence frame
    pub fn client_count(connected_clients: usize) -> Self {
        Self {
            connected_clients: Some(connected_clients),
            ..Default::default()
        }
    }

    /// Attach the live cursor mapping and client count
    pub fn stamp(&mut self, cursors: HashMap<String, Cursor>, connected_clients: usize) {
        self.cursors = Some(cursors);
        self.connected_clients = Some(connected_clients);
    }

    /// Check that an inbound message carries a grid and cursor coordinates
    pub fn into_edit(self) -> Result<Edit, DecodeError> {
        let grid = self.grid.ok_or(DecodeError::MissingGrid)?;
        let (x, y) = match (self.x, self.y) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(DecodeError::MissingCursor),
        };
        Ok(Edit {
            grid,
            x,
            y,
            check_sequences: self.check_sequences.unwrap_or(false),
        })
    }
}

/// A message serialized once and shared by every recipient
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame(Utf8Bytes);

impl EncodedFrame {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

/// Encode a message as JSON text
pub fn encode(message: &CanvasMessage) -> Result<EncodedFrame, EncodeError> {
    serde_json::to_string(message)
        .map(|text| EncodedFrame(Utf8Bytes::from(text)))
        .map_err(EncodeError)
}

/// Decode a JSON text message
pub fn decode(text: &str) -> Result<CanvasMessage, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(#[source] serde_json::Error);

/// Malformed inbound message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Edit carries no grid")]
    MissingGrid,
    #[error("Edit carries no cursor coordinates")]
    MissingCursor,
    #[error("Expected a text message")]
    NotText,
}
