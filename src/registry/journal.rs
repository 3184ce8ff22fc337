//! Append-only JSON-lines journal of registered mappings.
//!
//! One `RegisteredMapping` per line. A line for a key that already appeared
//! carries the same binding with an updated disclosure policy.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{RegisteredMapping, RegistryError};

pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::IoError(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RegistryError::IoError(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Every entry in `path`, oldest first. A missing file is an empty journal.
    pub fn read_all(path: &Path) -> Result<Vec<RegisteredMapping>, RegistryError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::IoError(e.to_string())),
        };

        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| RegistryError::IoError(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: RegisteredMapping = serde_json::from_str(&line)
                .map_err(|e| RegistryError::JournalCorrupt(format!("line {}: {}", n + 1, e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &RegisteredMapping) -> Result<(), RegistryError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| RegistryError::EncodingError(e.to_string()))?;
        line.push('\n');

        let mut file = &self.file;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| RegistryError::IoError(format!("{}: {}", self.path.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
