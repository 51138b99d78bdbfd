//! Durable table of active restream handles.
//!
//! One `<key>.json` file per active key under the state directory. Writes go
//! through a temporary file and a rename so a crash never leaves a partial
//! record behind.

use crate::error::{RestreamError, Result};
use crate::handle::RestreamHandle;
use crate::process;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HandleStore {
    dir: PathBuf,
}

impl HandleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn put(&self, handle: &RestreamHandle) -> Result<()> {
        let path = self.record_path(&handle.key);
        let persist_err = |path: &Path, source: std::io::Error| RestreamError::Persistence {
            key: handle.key.clone(),
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(|e| persist_err(&self.dir, e))?;

        let json = serde_json::to_vec_pretty(handle)
            .map_err(|e| persist_err(&path, std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let tmp = path.with_extension("json.tmp");
        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| persist_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| persist_err(&path, e))?;

        debug!("Persisted handle [{}] (pid {}) to {:?}", handle.key, handle.pid, path);
        Ok(())
    }

    /// Missing records are `None`; unreadable or corrupt ones are logged and
    /// also treated as absent.
    pub fn get(&self, key: &str) -> Option<RestreamHandle> {
        read_record(&self.record_path(key))
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RestreamError::Persistence {
                key: key.to_string(),
                path,
                source,
            }),
        }
    }

    /// Lazily walks the state directory. Call again to restart the walk.
    pub fn list_all(&self) -> impl Iterator<Item = RestreamHandle> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read handle store {:?}: {}", self.dir, e);
                None
            }
        };

        entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| read_record(&path))
    }

    pub fn is_alive(&self, handle: &RestreamHandle) -> bool {
        process::is_running(handle.pid, &handle.backend_target)
    }
}

fn read_record(path: &Path) -> Option<RestreamHandle> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Cannot read handle record {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Ignoring corrupt handle record {:?}: {}", path, e);
            None
        }
    }
}
