//! Prefab registry: per-type proximity radius and persistence.
//!
//! Prefabs are registered in code by the embedding game, or loaded from a
//! plain text table with one whitespace-separated entry per line:
//!
//! ```text
//! player      10        true
//! tree        50        true
//! sky_dome    Infinity  true
//! projectile  2.5       false
//! ```

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned while loading a prefab table.
#[derive(Debug, Error)]
pub enum PrefabError {
    #[error("failed to read prefab table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line did not have exactly three fields.
    #[error("line {line}: expected `<key> <radius> <persistent>`, got {content:?}")]
    FieldCount { line: usize, content: String },

    #[error("line {line}: invalid radius {value:?}")]
    Radius { line: usize, value: String },

    #[error("line {line}: invalid persistence flag {value:?}")]
    Persistent { line: usize, value: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable metadata shared by every representation of one prefab.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefabInfo {
    /// Added to a client's render range for the proximity test. May be
    /// infinite for objects that are loaded everywhere.
    pub radius: f32,
    /// Survives having no observers.
    pub persistent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PrefabRegistry {
    prefabs: FxHashMap<String, PrefabInfo>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a prefab.
    pub fn register(&mut self, key: impl Into<String>, radius: f32, persistent: bool) {
        self.prefabs
            .insert(key.into(), PrefabInfo { radius, persistent });
    }

    pub fn get(&self, key: &str) -> Option<PrefabInfo> {
        self.prefabs.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prefabs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.prefabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefabs.is_empty()
    }

    /// Load a table file, adding its entries to this registry.
    pub fn load_table(&mut self, path: &Path) -> Result<usize, PrefabError> {
        let text = std::fs::read_to_string(path).map_err(|source| PrefabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.parse_table(&text)?;
        tracing::info!(path = %path.display(), count, "loaded prefab table");
        Ok(count)
    }

    /// Parse table text. Blank lines and `#` comments are skipped.
    pub fn parse_table(&mut self, text: &str) -> Result<usize, PrefabError> {
        let mut parsed = Vec::new();
        for (number, raw) in text.lines().enumerate() {
            let line = number + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = content.split_whitespace().collect();
            let [key, radius, persistent] = fields[..] else {
                return Err(PrefabError::FieldCount {
                    line,
                    content: content.to_owned(),
                });
            };

            let radius = radius
                .parse::<f32>()
                .ok()
                .filter(|r| !r.is_nan())
                .ok_or_else(|| PrefabError::Radius {
                    line,
                    value: radius.to_owned(),
                })?;
            let persistent = parse_flag(persistent).ok_or_else(|| PrefabError::Persistent {
                line,
                value: persistent.to_owned(),
            })?;
            parsed.push((key.to_owned(), radius, persistent));
        }

        let count = parsed.len();
        for (key, radius, persistent) in parsed {
            self.register(key, radius, persistent);
        }
        Ok(count)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PrefabRegistry::new();
        registry.register("crate", 4.0, false);

        assert_eq!(
            registry.get("crate"),
            Some(PrefabInfo {
                radius: 4.0,
                persistent: false
            })
        );
        assert!(registry.get("barrel").is_none());
    }

    #[test]
    fn test_parse_table_accepts_infinity_and_case() {
        let mut registry = PrefabRegistry::new();
        let count = registry
            .parse_table("# comment\nplayer 10 True\n\nsky Infinity true\nbolt 0.5 FALSE\n")
            .unwrap();

        assert_eq!(count, 3);
        assert!(registry.get("sky").unwrap().radius.is_infinite());
        assert!(registry.get("player").unwrap().persistent);
        assert!(!registry.get("bolt").unwrap().persistent);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let mut registry = PrefabRegistry::new();
        let err = registry.parse_table("ok 1 true\nbroken 2\n").unwrap_err();
        assert!(matches!(err, PrefabError::FieldCount { line: 2, .. }));
        assert!(registry.is_empty(), "nothing registered from a bad table");
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut registry = PrefabRegistry::new();
        assert!(matches!(
            registry.parse_table("x wide true"),
            Err(PrefabError::Radius { line: 1, .. })
        ));
        assert!(matches!(
            registry.parse_table("x 1 maybe"),
            Err(PrefabError::Persistent { line: 1, .. })
        ));
    }

    #[test]
    fn test_load_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_data");
        std::fs::write(&path, "player 10 true\n").unwrap();

        let mut registry = PrefabRegistry::new();
        assert_eq!(registry.load_table(&path).unwrap(), 1);
        assert!(registry.contains("player"));

        let missing = registry.load_table(&dir.path().join("nope"));
        assert!(matches!(missing, Err(PrefabError::Io { .. })));
    }
}
