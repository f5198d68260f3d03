//! Message types exchanged between clients and the replication server.
//!
//! Each direction has its own closed set of type bytes. Both start at 1 so a
//! stray zero byte in the type position is detected as corruption. Payload
//! layouts are fixed per type and built from [`crate::codec`] primitives.

use glam::Vec3;

use crate::codec::{self, ByteReader, CodecError};
use crate::framing::{self, Frame, FrameError};

/// Errors raised while interpreting a frame as a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The type byte does not name a known message.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The byte stream itself was corrupt.
    #[error(transparent)]
    Framing(#[from] FrameError),

    /// The payload did not match the layout for its type.
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: CodecError,
    },
}

// ---------------------------------------------------------------------------
// Type bytes
// ---------------------------------------------------------------------------

/// Type bytes of client → server messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientMessageType {
    Login = 1,
    Heartbeat = 2,
    Disconnect = 3,
    Create = 4,
    Delete = 5,
    VariableUpdate = 6,
    Trigger = 7,
    RenderRangeUpdate = 8,
}

impl TryFrom<u8> for ClientMessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Login,
            2 => Self::Heartbeat,
            3 => Self::Disconnect,
            4 => Self::Create,
            5 => Self::Delete,
            6 => Self::VariableUpdate,
            7 => Self::Trigger,
            8 => Self::RenderRangeUpdate,
            other => return Err(MessageError::UnknownType(other)),
        })
    }
}

/// Type bytes of server → client messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerMessageType {
    Create = 1,
    ForceCreate = 2,
    Unload = 3,
    CreationSuccess = 4,
    DeleteSuccess = 5,
    VariableUpdate = 6,
    Trigger = 7,
    LoseAuth = 8,
    GainAuth = 9,
    Heartbeat = 10,
    Disconnect = 11,
    PlayerUpdate = 12,
}

impl TryFrom<u8> for ServerMessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Create,
            2 => Self::ForceCreate,
            3 => Self::Unload,
            4 => Self::CreationSuccess,
            5 => Self::DeleteSuccess,
            6 => Self::VariableUpdate,
            7 => Self::Trigger,
            8 => Self::LoseAuth,
            9 => Self::GainAuth,
            10 => Self::Heartbeat,
            11 => Self::Disconnect,
            12 => Self::PlayerUpdate,
            other => return Err(MessageError::UnknownType(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Claim a username. Credentials are carried opaque.
    Login { username: String, credentials: Vec<u8> },
    /// Keepalive. `active` reports user input since the last heartbeat.
    Heartbeat { active: bool, key: i32 },
    /// Client-initiated disconnect.
    Disconnect { delete_player: bool },
    /// A serialized representation the client instantiated locally.
    Create { serialization: Vec<u8> },
    Delete {
        network_id: i32,
        response_requested: bool,
    },
    VariableUpdate {
        network_id: i32,
        index: i32,
        serialization: Vec<u8>,
    },
    Trigger { network_id: i32, event: i32 },
    RenderRangeUpdate { range: f32 },
}

impl ClientMessage {
    pub fn kind(&self) -> ClientMessageType {
        match self {
            Self::Login { .. } => ClientMessageType::Login,
            Self::Heartbeat { .. } => ClientMessageType::Heartbeat,
            Self::Disconnect { .. } => ClientMessageType::Disconnect,
            Self::Create { .. } => ClientMessageType::Create,
            Self::Delete { .. } => ClientMessageType::Delete,
            Self::VariableUpdate { .. } => ClientMessageType::VariableUpdate,
            Self::Trigger { .. } => ClientMessageType::Trigger,
            Self::RenderRangeUpdate { .. } => ClientMessageType::RenderRangeUpdate,
        }
    }

    /// Interpret a frame received from a client.
    pub fn decode(frame: &Frame) -> Result<Self, MessageError> {
        let kind = ClientMessageType::try_from(frame.kind)?;
        let mut r = ByteReader::new(&frame.payload);
        let malformed = |source| MessageError::Malformed {
            kind: kind.name(),
            source,
        };

        let message = match kind {
            ClientMessageType::Login => Self::Login {
                username: r.read_string().map_err(malformed)?,
                credentials: r.read_rest().to_vec(),
            },
            ClientMessageType::Heartbeat => Self::Heartbeat {
                active: r.read_bool().map_err(malformed)?,
                key: r.read_int().map_err(malformed)?,
            },
            ClientMessageType::Disconnect => Self::Disconnect {
                delete_player: r.read_bool().map_err(malformed)?,
            },
            ClientMessageType::Create => Self::Create {
                serialization: r.read_rest().to_vec(),
            },
            ClientMessageType::Delete => Self::Delete {
                network_id: r.read_int().map_err(malformed)?,
                response_requested: r.read_bool().map_err(malformed)?,
            },
            ClientMessageType::VariableUpdate => Self::VariableUpdate {
                network_id: r.read_int().map_err(malformed)?,
                index: r.read_int().map_err(malformed)?,
                serialization: r.read_rest().to_vec(),
            },
            ClientMessageType::Trigger => Self::Trigger {
                network_id: r.read_int().map_err(malformed)?,
                event: r.read_int().map_err(malformed)?,
            },
            ClientMessageType::RenderRangeUpdate => Self::RenderRangeUpdate {
                range: r.read_float().map_err(malformed)?,
            },
        };
        Ok(message)
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Login {
                username,
                credentials,
            } => codec::concat([&codec::encode_string(username)[..], credentials.as_slice()]),
            Self::Heartbeat { active, key } => {
                codec::concat([&codec::encode_bool(*active)[..], &codec::encode_int(*key)[..]])
            }
            Self::Disconnect { delete_player } => codec::encode_bool(*delete_player).to_vec(),
            Self::Create { serialization } => serialization.clone(),
            Self::Delete {
                network_id,
                response_requested,
            } => codec::concat([
                &codec::encode_int(*network_id)[..],
                &codec::encode_bool(*response_requested)[..],
            ]),
            Self::VariableUpdate {
                network_id,
                index,
                serialization,
            } => codec::concat([
                &codec::encode_int(*network_id)[..],
                &codec::encode_int(*index)[..],
                serialization.as_slice(),
            ]),
            Self::Trigger { network_id, event } => {
                codec::concat([&codec::encode_int(*network_id)[..], &codec::encode_int(*event)[..]])
            }
            Self::RenderRangeUpdate { range } => codec::encode_float(*range).to_vec(),
        }
    }

    /// Framed bytes as a client puts them on the wire.
    #[track_caller]
    pub fn encode(&self) -> Vec<u8> {
        framing::encode_client_frame(self.kind() as u8, &self.payload())
    }
}

impl ClientMessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
            Self::Create => "CREATE",
            Self::Delete => "DELETE",
            Self::VariableUpdate => "VARIABLE_UPDATE",
            Self::Trigger => "TRIGGER",
            Self::RenderRangeUpdate => "RENDER_RANGE_UPDATE",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// A server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Instantiate a representation from its serialization.
    Create { serialization: Vec<u8> },
    /// Ask the client to instantiate a prefab under a reserved id and report
    /// it back with a CREATE.
    ForceCreate {
        position: Vec3,
        prefab: String,
        network_id: i32,
        parent_id: i32,
    },
    /// Remove a representation. `deleting` distinguishes deletion from
    /// leaving the client's range.
    Unload { network_id: i32, deleting: bool },
    /// Maps the id a client chose locally to the authoritative one.
    CreationSuccess { local_id: i32, network_id: i32 },
    DeleteSuccess { network_id: i32 },
    VariableUpdate {
        network_id: i32,
        index: i32,
        serialization: Vec<u8>,
    },
    Trigger { network_id: i32, event: i32 },
    LoseAuth { network_id: i32 },
    GainAuth { network_id: i32 },
    /// Heartbeat echo with the server's wall clock.
    Heartbeat { key: i32, unix_seconds: i32 },
    Disconnect { reason: String },
    /// Roster entry for another player.
    PlayerUpdate {
        username: String,
        position: Vec3,
        connected: bool,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageType {
        match self {
            Self::Create { .. } => ServerMessageType::Create,
            Self::ForceCreate { .. } => ServerMessageType::ForceCreate,
            Self::Unload { .. } => ServerMessageType::Unload,
            Self::CreationSuccess { .. } => ServerMessageType::CreationSuccess,
            Self::DeleteSuccess { .. } => ServerMessageType::DeleteSuccess,
            Self::VariableUpdate { .. } => ServerMessageType::VariableUpdate,
            Self::Trigger { .. } => ServerMessageType::Trigger,
            Self::LoseAuth { .. } => ServerMessageType::LoseAuth,
            Self::GainAuth { .. } => ServerMessageType::GainAuth,
            Self::Heartbeat { .. } => ServerMessageType::Heartbeat,
            Self::Disconnect { .. } => ServerMessageType::Disconnect,
            Self::PlayerUpdate { .. } => ServerMessageType::PlayerUpdate,
        }
    }

    fn payload(&self) -> Vec<u8> {
        use codec::{encode_bool, encode_int, encode_string, encode_vec3};

        match self {
            Self::Create { serialization } => serialization.clone(),
            Self::ForceCreate {
                position,
                prefab,
                network_id,
                parent_id,
            } => codec::concat([
                &encode_vec3(*position)[..],
                &encode_string(prefab)[..],
                &encode_int(*network_id)[..],
                &encode_int(*parent_id)[..],
            ]),
            Self::Unload {
                network_id,
                deleting,
            } => codec::concat([&encode_int(*network_id)[..], &encode_bool(*deleting)[..]]),
            Self::CreationSuccess {
                local_id,
                network_id,
            } => codec::concat([&encode_int(*local_id)[..], &encode_int(*network_id)[..]]),
            Self::DeleteSuccess { network_id }
            | Self::LoseAuth { network_id }
            | Self::GainAuth { network_id } => encode_int(*network_id).to_vec(),
            Self::VariableUpdate {
                network_id,
                index,
                serialization,
            } => codec::concat([
                &encode_int(*network_id)[..],
                &encode_int(*index)[..],
                serialization.as_slice(),
            ]),
            Self::Trigger { network_id, event } => {
                codec::concat([&encode_int(*network_id)[..], &encode_int(*event)[..]])
            }
            Self::Heartbeat { key, unix_seconds } => {
                codec::concat([&encode_int(*key)[..], &encode_int(*unix_seconds)[..]])
            }
            Self::Disconnect { reason } => encode_string(reason),
            Self::PlayerUpdate {
                username,
                position,
                connected,
            } => codec::concat([
                &encode_string(username)[..],
                &encode_vec3(*position)[..],
                &encode_bool(*connected)[..],
            ]),
        }
    }

    /// Framed bytes ready to queue on a connection.
    pub fn encode(&self) -> Vec<u8> {
        framing::encode_frame(self.kind() as u8, &self.payload())
    }

    /// Interpret a frame received from the server.
    pub fn decode(frame: &Frame) -> Result<Self, MessageError> {
        let kind = ServerMessageType::try_from(frame.kind)?;
        let mut r = ByteReader::new(&frame.payload);
        let malformed = |source| MessageError::Malformed {
            kind: kind.name(),
            source,
        };

        let message = match kind {
            ServerMessageType::Create => Self::Create {
                serialization: r.read_rest().to_vec(),
            },
            ServerMessageType::ForceCreate => Self::ForceCreate {
                position: r.read_vec3().map_err(malformed)?,
                prefab: r.read_string().map_err(malformed)?,
                network_id: r.read_int().map_err(malformed)?,
                parent_id: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::Unload => Self::Unload {
                network_id: r.read_int().map_err(malformed)?,
                deleting: r.read_bool().map_err(malformed)?,
            },
            ServerMessageType::CreationSuccess => Self::CreationSuccess {
                local_id: r.read_int().map_err(malformed)?,
                network_id: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::DeleteSuccess => Self::DeleteSuccess {
                network_id: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::VariableUpdate => Self::VariableUpdate {
                network_id: r.read_int().map_err(malformed)?,
                index: r.read_int().map_err(malformed)?,
                serialization: r.read_rest().to_vec(),
            },
            ServerMessageType::Trigger => Self::Trigger {
                network_id: r.read_int().map_err(malformed)?,
                event: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::LoseAuth => Self::LoseAuth {
                network_id: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::GainAuth => Self::GainAuth {
                network_id: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::Heartbeat => Self::Heartbeat {
                key: r.read_int().map_err(malformed)?,
                unix_seconds: r.read_int().map_err(malformed)?,
            },
            ServerMessageType::Disconnect => Self::Disconnect {
                reason: r.read_string().map_err(malformed)?,
            },
            ServerMessageType::PlayerUpdate => Self::PlayerUpdate {
                username: r.read_string().map_err(malformed)?,
                position: r.read_vec3().map_err(malformed)?,
                connected: r.read_bool().map_err(malformed)?,
            },
        };
        Ok(message)
    }
}

impl ServerMessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::ForceCreate => "FORCE_CREATE",
            Self::Unload => "UNLOAD",
            Self::CreationSuccess => "CREATION_SUCCESS",
            Self::DeleteSuccess => "DELETE_SUCCESS",
            Self::VariableUpdate => "VARIABLE_UPDATE",
            Self::Trigger => "TRIGGER",
            Self::LoseAuth => "LOSE_AUTH",
            Self::GainAuth => "GAIN_AUTH",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
            Self::PlayerUpdate => "PLAYER_UPDATE",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
