use crate::error::{IngestError, Result};
use log::info;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Registry of entity keys already seen for one series, persisted as one key per line
#[derive(Debug, Clone)]
pub struct KnownEntitySet {
    path: PathBuf,
    keys: BTreeSet<String>,
    dirty: bool,
}

impl KnownEntitySet {
    pub fn file_name(series: &str) -> String {
        format!("{}_known_entities.txt", series)
    }

    /// Load from `path`; a missing file is an empty registry
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = match std::fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(IngestError::io(&path, e)),
        };
        Ok(Self {
            path,
            keys,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Add `keys`, returning the ones never seen before (sorted, each once)
    pub fn observe<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut fresh = BTreeSet::new();
        for key in keys {
            if !self.keys.contains(key) {
                fresh.insert(key.to_string());
            }
        }
        if !fresh.is_empty() {
            self.keys.extend(fresh.iter().cloned());
            self.dirty = true;
        }
        fresh.into_iter().collect()
    }

    /// Rewrite the file atomically if anything changed since load or the last persist
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| IngestError::io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| IngestError::io(dir, e))?;
        for key in &self.keys {
            writeln!(tmp, "{}", key).map_err(|e| IngestError::io(tmp.path(), e))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| IngestError::io(&self.path, e.error))?;

        self.dirty = false;
        info!("💾 {} known entities written to {}", self.keys.len(), self.path.display());
        Ok(())
    }
}
