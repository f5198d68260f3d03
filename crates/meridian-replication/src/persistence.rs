//! Gzip-compressed save files.
//!
//! A save is a sequence of records, each
//!
//! ```text
//! u8 tag | int length | serialized representation [| string username]
//! ```
//!
//! where the username follows only `PLAYER` records. Players come first, then
//! persistent representations reachable from the active root, then those
//! reachable from the inactive root, each id at most once.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use meridian_net::codec::{self, ByteReader};
use rustc_hash::FxHashSet;

use crate::error::ReplicationError;
use crate::hierarchy::{NodeId, Parent, Root};
use crate::representation::RepresentationRecord;
use crate::world::World;

pub const SAVE_EXTENSION: &str = "save";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SaveTag {
    Player = 1,
    Active = 2,
    Inactive = 3,
}

impl TryFrom<u8> for SaveTag {
    type Error = ReplicationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Player),
            2 => Ok(Self::Active),
            3 => Ok(Self::Inactive),
            other => Err(ReplicationError::UnknownSaveTag(other)),
        }
    }
}

/// Path of the save called `name` inside `dir`.
pub fn save_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{SAVE_EXTENSION}"))
}

pub fn save_exists(dir: &Path, name: &str) -> bool {
    save_path(dir, name).is_file()
}

/// Every save file in `dir`, sorted by path. A missing directory has none.
pub fn existing_saves(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut saves = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SAVE_EXTENSION) {
            saves.push(path);
        }
    }
    saves.sort();
    Ok(saves)
}

fn corrupt(err: codec::CodecError) -> ReplicationError {
    ReplicationError::CorruptSave(err.to_string())
}

impl World {
    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Write every player and persistent representation. Returns the number
    /// of records written.
    pub fn write_save<W: Write>(&self, writer: W) -> Result<usize, ReplicationError> {
        let mut encoder = GzEncoder::new(writer, Compression::best());
        let mut saved: FxHashSet<i32> = FxHashSet::default();
        let mut records = 0;

        for (username, &node) in &self.players {
            if !self.is_live(node) {
                continue;
            }
            let serialization = self.serialize(node);
            encoder.write_all(&[SaveTag::Player as u8])?;
            encoder.write_all(&codec::encode_int(serialization.len() as i32))?;
            encoder.write_all(&serialization)?;
            encoder.write_all(&codec::encode_string(username))?;
            saved.insert(self.network_id(node));
            records += 1;
        }

        for (root, tag) in [(Root::Active, SaveTag::Active), (Root::Inactive, SaveTag::Inactive)] {
            for node in self.tree.walk_root(root) {
                let Some(rep) = self.rep(node) else {
                    continue;
                };
                if !rep.is_persistent() || !saved.insert(rep.network_id) {
                    continue;
                }
                let serialization = self.serialize(node);
                encoder.write_all(&[tag as u8])?;
                encoder.write_all(&codec::encode_int(serialization.len() as i32))?;
                encoder.write_all(&serialization)?;
                records += 1;
            }
        }

        encoder.finish()?.flush()?;
        Ok(records)
    }

    pub fn save_to(&self, path: &Path) -> Result<usize, ReplicationError> {
        let file_error = |source| ReplicationError::SaveFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(file_error)?;
        }
        let file = File::create(path).map_err(file_error)?;
        let records = self.write_save(BufWriter::new(file))?;
        tracing::info!(path = %path.display(), records, "world saved");
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    /// Restore representations from a save stream. Records whose prefab is
    /// no longer registered (or whose parent was skipped) are dropped.
    /// Returns the number of representations restored.
    pub fn read_save<R: Read>(&mut self, reader: R) -> Result<usize, ReplicationError> {
        let mut bytes = Vec::new();
        GzDecoder::new(reader).read_to_end(&mut bytes)?;

        let mut reader = ByteReader::new(&bytes);
        let mut restored = 0;
        while !reader.is_empty() {
            let tag = reader.read_bytes(1).map_err(corrupt)?[0];
            let tag = SaveTag::try_from(tag)?;
            let record = RepresentationRecord::parse(reader.read_sized().map_err(corrupt)?)
                .map_err(|err| ReplicationError::CorruptSave(err.to_string()))?;
            // always consume the username so the stream stays aligned
            let username = match tag {
                SaveTag::Player => Some(reader.read_string().map_err(corrupt)?),
                _ => None,
            };

            if let Some(node) = self.restore(record, tag)? {
                if let Some(username) = username {
                    self.players.insert(username, node);
                }
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn restore(
        &mut self,
        record: RepresentationRecord,
        tag: SaveTag,
    ) -> Result<Option<NodeId>, ReplicationError> {
        let input_id = record.input_id;
        if input_id <= 0 {
            return Err(ReplicationError::CorruptSave(format!(
                "record carries unregistered id {input_id}"
            )));
        }
        let top_level = record.parent_id <= 0;
        if !top_level && !self.ids.contains_key(&record.parent_id) {
            tracing::warn!(
                network_id = input_id,
                parent_id = record.parent_id,
                "parent not restored, skipping saved representation"
            );
            return Ok(None);
        }

        let Some(node) = self.instantiate(record)? else {
            return Ok(None);
        };
        let goes_inactive = match tag {
            SaveTag::Player => true,
            SaveTag::Inactive => top_level,
            SaveTag::Active => false,
        };
        if goes_inactive {
            self.tree.set_parent(node, Parent::Root(Root::Inactive));
        }
        Ok(Some(node))
    }

    pub fn load_from(&mut self, path: &Path) -> Result<usize, ReplicationError> {
        let file = File::open(path).map_err(|source| ReplicationError::SaveFile {
            path: path.to_path_buf(),
            source,
        })?;
        let restored = self.read_save(BufReader::new(file))?;
        tracing::info!(path = %path.display(), restored, "world loaded");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use glam::Vec3;

    use super::*;
    use crate::prefab::PrefabRegistry;
    use crate::world::WorldSettings;

    fn registry() -> PrefabRegistry {
        let mut registry = PrefabRegistry::new();
        registry.register("player", 10.0, true);
        registry.register("chest", 5.0, true);
        registry.register("spark", 1.0, false);
        registry
    }

    fn world() -> World {
        World::new(registry(), WorldSettings::default(), Instant::now())
    }

    fn spawn(world: &mut World, prefab: &str, parent_id: i32, position: Vec3) -> NodeId {
        let record = RepresentationRecord::at_position(prefab, parent_id, position, vec![b"extra".to_vec()]);
        world.instantiate(record).unwrap().unwrap()
    }

    #[test]
    fn test_round_trip_restores_graph() {
        let mut original = world();
        let player = spawn(&mut original, "player", 0, Vec3::new(1.0, 2.0, 3.0));
        original.players.insert("ada".into(), player);
        let chest = spawn(&mut original, "chest", 0, Vec3::X);
        let chest_id = original.network_id(chest);
        let inner = spawn(&mut original, "chest", chest_id, Vec3::Y);
        let stored = spawn(&mut original, "chest", 0, Vec3::Z);
        original.tree.set_parent(stored, Parent::Root(Root::Inactive));
        spawn(&mut original, "spark", 0, Vec3::ZERO);

        let mut bytes = Vec::new();
        assert_eq!(original.write_save(&mut bytes).unwrap(), 4);

        let mut restored = world();
        assert_eq!(restored.read_save(bytes.as_slice()).unwrap(), 4);

        let player_id = original.network_id(player);
        assert_eq!(restored.player("ada").unwrap().network_id(), player_id);
        assert_eq!(restored.root_of(player_id), Some(Root::Inactive));
        assert_eq!(restored.root_of(chest_id), Some(Root::Active));
        assert_eq!(restored.parent_of(original.network_id(inner)), Some(chest_id));
        assert_eq!(restored.root_of(original.network_id(stored)), Some(Root::Inactive));
        assert_eq!(restored.representation_count(), 4);

        let before = original.representation(chest_id).unwrap();
        let after = restored.representation(chest_id).unwrap();
        assert_eq!(before.serializations(), after.serializations());
        assert_eq!(after.position(), Vec3::X);

        // fresh ids continue past everything restored
        assert!(restored.next_network_id() > original.network_id(stored));
    }

    #[test]
    fn test_unknown_prefab_is_skipped_without_desync() {
        let mut original = world();
        let player = spawn(&mut original, "player", 0, Vec3::ZERO);
        original.players.insert("ada".into(), player);
        let survivor = spawn(&mut original, "chest", 0, Vec3::ONE);

        let mut bytes = Vec::new();
        original.write_save(&mut bytes).unwrap();

        let mut partial = PrefabRegistry::new();
        partial.register("chest", 5.0, true);
        let mut restored = World::new(partial, WorldSettings::default(), Instant::now());
        assert_eq!(restored.read_save(bytes.as_slice()).unwrap(), 1);
        assert!(restored.player("ada").is_none());
        assert!(restored.representation(original.network_id(survivor)).is_some());
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&[9]).unwrap();
        let bytes = encoder.finish().unwrap();

        let err = world().read_save(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownSaveTag(9)));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&[SaveTag::Active as u8]).unwrap();
        encoder.write_all(&codec::encode_int(40)).unwrap();
        encoder.write_all(b"short").unwrap();
        let bytes = encoder.finish().unwrap();

        assert!(matches!(
            world().read_save(bytes.as_slice()),
            Err(ReplicationError::CorruptSave(_))
        ));
    }

    #[test]
    fn test_save_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let saves = dir.path().join("saves");
        assert!(existing_saves(&saves).unwrap().is_empty());

        let mut world = world();
        spawn(&mut world, "chest", 0, Vec3::ZERO);
        let path = save_path(&saves, "alpha");
        assert_eq!(world.save_to(&path).unwrap(), 1);
        std::fs::write(saves.join("notes.txt"), "ignored").unwrap();

        assert!(save_exists(&saves, "alpha"));
        assert!(!save_exists(&saves, "beta"));
        assert_eq!(existing_saves(&saves).unwrap(), vec![path.clone()]);

        let mut loaded = World::new(registry(), WorldSettings::default(), Instant::now());
        assert_eq!(loaded.load_from(&path).unwrap(), 1);
        assert!(matches!(
            loaded.load_from(&save_path(&saves, "beta")),
            Err(ReplicationError::SaveFile { .. })
        ));
    }
}
