use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use crate::engine::memstore::Namespace;
use crate::{Error, Result};
use log::warn;

/// Snapshot storage for the [`MemEngine`](crate::engine::MemEngine).
///
/// Each namespace is written to its own `<namespace>.json` file using a
/// write-then-rename, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    /// Creates the directory if it does not exist.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { data_dir: dir })
    }

    pub fn save_namespace(&self, namespace: &str, data: &Namespace) -> Result<()> {
        let file_path = self.data_dir.join(format!("{}.json", namespace));
        let temp_path = file_path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &file_path)?;
        Ok(())
    }

    /// Loads every `*.json` snapshot. Unreadable or corrupt files are skipped with a warning.
    pub fn load_all(&self) -> Result<HashMap<String, Namespace>> {
        let mut all = HashMap::new();
        if !self.data_dir.exists() {
            return Ok(all);
        }

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let namespace = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::Internal(format!("invalid snapshot filename {:?}", path)))?
                .to_string();

            let content = match fs::read(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Could not read snapshot {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_slice::<Namespace>(&content) {
                Ok(data) => {
                    all.insert(namespace, data);
                }
                Err(e) => warn!("Could not decode snapshot {:?}: {}", path, e),
            }
        }
        Ok(all)
    }
}
