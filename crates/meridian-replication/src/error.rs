//! Error types for the replication engine.

use std::path::PathBuf;

use meridian_net::{CodecError, FrameError, MessageError};
use thiserror::Error;

use crate::prefab::PrefabError;
use crate::session::ClientId;

/// How a [`ReplicationError`] must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from one client. That client is disconnected; the server
    /// carries on.
    Protocol,
    /// The representation graph is inconsistent. Never swallowed.
    ///
    /// Not only server bugs land here: a client VARIABLE_UPDATE that skips a
    /// slot index is classified as one too, so a single malformed payload
    /// makes [`crate::Server::tick`] return this kind.
    Invariant,
    /// A save file could not be read or written.
    Persistence,
    Io,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    // --- protocol ---
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("malformed representation: {0}")]
    Representation(#[from] CodecError),

    #[error("network id {0} is not valid here")]
    InvalidId(i32),

    #[error("parent {parent_id} of a new representation does not exist")]
    UnknownParent { parent_id: i32 },

    #[error("negative variable slot {0}")]
    NegativeSlot(i32),

    #[error("client {client} sent an unrequested forced creation (id {network_id}, prefab {prefab:?})")]
    UnexpectedForcedCreate {
        client: ClientId,
        network_id: i32,
        prefab: String,
    },

    #[error("client {0} logged in twice")]
    AlreadyLoggedIn(ClientId),

    // --- invariant ---
    #[error("network id {0} is already registered")]
    IdInUse(i32),

    #[error("client {client} unloaded representation {network_id} which it had not loaded")]
    NotLoaded { client: ClientId, network_id: i32 },

    #[error("representation {network_id} skipped variable slot: set {index} with only {len} slots")]
    SkippedSlot {
        network_id: i32,
        index: usize,
        len: usize,
    },

    #[error("client {0} already has a player")]
    PlayerAlreadyAssigned(ClientId),

    #[error("representation {0} was created with children")]
    CreatedWithChildren(i32),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    // --- persistence ---
    #[error("unknown save record tag {0}")]
    UnknownSaveTag(u8),

    #[error("corrupt save record: {0}")]
    CorruptSave(String),

    #[error("failed to access save file {path}: {source}")]
    SaveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // --- io ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(_)
            | Self::Message(_)
            | Self::Representation(_)
            | Self::InvalidId(_)
            | Self::UnknownParent { .. }
            | Self::NegativeSlot(_)
            | Self::UnexpectedForcedCreate { .. }
            | Self::AlreadyLoggedIn(_) => ErrorKind::Protocol,
            Self::IdInUse(_)
            | Self::NotLoaded { .. }
            | Self::SkippedSlot { .. }
            | Self::PlayerAlreadyAssigned(_)
            | Self::CreatedWithChildren(_)
            | Self::UnknownClient(_) => ErrorKind::Invariant,
            Self::UnknownSaveTag(_) | Self::CorruptSave(_) | Self::SaveFile { .. } => {
                ErrorKind::Persistence
            }
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Configuration problems reported by [`crate::Server::start`].
#[derive(Debug, Error)]
pub enum StartError {
    #[error("player prefab {0:?} is not registered")]
    UnknownPlayerPrefab(String),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("save file not present: {0}")]
    MissingSave(PathBuf),

    #[error("failed to load save: {0}")]
    Load(#[source] ReplicationError),

    #[error(transparent)]
    Prefabs(#[from] PrefabError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_partition_errors() {
        assert_eq!(ReplicationError::InvalidId(0).kind(), ErrorKind::Protocol);
        assert_eq!(
            ReplicationError::NotLoaded {
                client: ClientId(1),
                network_id: 4
            }
            .kind(),
            ErrorKind::Invariant
        );
        assert_eq!(ReplicationError::UnknownSaveTag(9).kind(), ErrorKind::Persistence);
        assert_eq!(
            ReplicationError::from(MessageError::UnknownType(0)).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_messages_name_the_object() {
        let err = ReplicationError::SkippedSlot {
            network_id: 7,
            index: 3,
            len: 1,
        };
        assert_eq!(
            err.to_string(),
            "representation 7 skipped variable slot: set 3 with only 1 slots"
        );
    }
}
