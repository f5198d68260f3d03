//! The server's record of one networked object, and its wire form.
//!
//! Serialized layout (used both for CREATE messages and save records):
//!
//! ```text
//! int network_id | int parent_id (0 = top-level) | string prefab
//! then per variable slot: int length | bytes
//! ```

use glam::Vec3;
use meridian_net::codec::{self, ByteReader};

use crate::error::ReplicationError;
use crate::prefab::PrefabInfo;
use crate::session::ClientId;

/// Variable slots 0..3 hold the position components as `f32`.
pub const POSITION_SLOTS: usize = 3;

#[derive(Debug, Clone)]
pub struct Representation {
    pub(crate) network_id: i32,
    pub(crate) prefab: String,
    pub(crate) info: PrefabInfo,
    pub(crate) position: Vec3,
    pub(crate) serializations: Vec<Vec<u8>>,
    /// Raw holder; may name a client that has since disconnected. Read it
    /// through `World::authority`.
    pub(crate) authority: Option<ClientId>,
}

impl Representation {
    pub(crate) fn new(network_id: i32, prefab: String, info: PrefabInfo) -> Self {
        Self {
            network_id,
            prefab,
            info,
            position: Vec3::ZERO,
            serializations: Vec::new(),
            authority: None,
        }
    }

    pub fn network_id(&self) -> i32 {
        self.network_id
    }

    pub fn prefab(&self) -> &str {
        &self.prefab
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn radius(&self) -> f32 {
        self.info.radius
    }

    pub fn is_persistent(&self) -> bool {
        self.info.persistent
    }

    pub fn serializations(&self) -> &[Vec<u8>] {
        &self.serializations
    }

    /// Store a variable slot. Slots must be filled in order; position slots
    /// also refresh the cached position.
    pub(crate) fn set_serialization(
        &mut self,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        if index > self.serializations.len() {
            return Err(ReplicationError::SkippedSlot {
                network_id: self.network_id,
                index,
                len: self.serializations.len(),
            });
        }

        if index < POSITION_SLOTS
            && let Some(value) = bytes.get(..codec::FLOAT_SIZE).and_then(codec::decode_float)
        {
            self.position[index] = value;
        }

        if index == self.serializations.len() {
            self.serializations.push(bytes);
        } else {
            self.serializations[index] = bytes;
        }
        Ok(())
    }

    /// Wire form. `parent_id` is 0 for top-level representations.
    pub fn serialize(&self, parent_id: i32) -> Vec<u8> {
        let mut out = codec::concat([
            &codec::encode_int(self.network_id)[..],
            &codec::encode_int(parent_id)[..],
            &codec::encode_string(&self.prefab)[..],
        ]);
        for serial in &self.serializations {
            out.extend_from_slice(&codec::encode_int(serial.len() as i32));
            out.extend_from_slice(serial);
        }
        out
    }
}

/// A decoded but not yet instantiated representation.
#[derive(Debug, Clone, PartialEq)]
pub struct RepresentationRecord {
    /// Negative: a client-local id, a fresh one must be assigned.
    /// Positive: an id to restore.
    pub input_id: i32,
    pub parent_id: i32,
    pub prefab: String,
    pub slots: Vec<Vec<u8>>,
}

impl RepresentationRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self, ReplicationError> {
        let mut reader = ByteReader::new(bytes);
        let input_id = reader.read_int()?;
        let parent_id = reader.read_int()?;
        let prefab = reader.read_string()?;

        let mut slots = Vec::new();
        while !reader.is_empty() {
            slots.push(reader.read_sized()?.to_vec());
        }

        Ok(Self {
            input_id,
            parent_id,
            prefab,
            slots,
        })
    }

    /// A record for a fresh server-side object at `position`.
    pub fn at_position(prefab: &str, parent_id: i32, position: Vec3, extra: Vec<Vec<u8>>) -> Self {
        let mut slots: Vec<Vec<u8>> = (0..POSITION_SLOTS)
            .map(|axis| codec::encode_float(position[axis]).to_vec())
            .collect();
        slots.extend(extra);
        Self {
            input_id: -1,
            parent_id,
            prefab: prefab.to_owned(),
            slots,
        }
    }
}
