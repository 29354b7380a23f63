//! Persistent memory store
//!
//! Owns the storage directory holding the two artifacts and the flag
//! record:
//!
//! - `audio.wav`: the captured audio clip
//! - `color.dat`: the captured color as `r,g,b`
//! - `recordings.txt`: presence flags as `audio:1,color:0`
//!
//! The flag record is always replaced through a temp file and rename, so a
//! reader never sees a torn record.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sensors::Rgb;

pub const AUDIO_FILE: &str = "audio.wav";
pub const COLOR_FILE: &str = "color.dat";
pub const STATUS_FILE: &str = "recordings.txt";

/// Errors from the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create storage directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove {path:?}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which items of the current memory are present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFlags {
    pub has_audio: bool,
    pub has_color: bool,
}

impl MemoryFlags {
    pub fn new(has_audio: bool, has_color: bool) -> Self {
        Self {
            has_audio,
            has_color,
        }
    }

    /// Number of items present (0, 1 or 2)
    pub fn count(&self) -> u8 {
        u8::from(self.has_audio) + u8::from(self.has_color)
    }

    /// Both items present, the memory can be poured
    pub fn is_complete(&self) -> bool {
        self.has_audio && self.has_color
    }

    fn encode(&self) -> String {
        format!(
            "audio:{},color:{}\n",
            u8::from(self.has_audio),
            u8::from(self.has_color)
        )
    }

    /// Parse a flag record. Unknown keys are ignored, anything but `1`
    /// reads as absent.
    fn parse(record: &str) -> Self {
        let mut flags = Self::default();
        for field in record.trim().split(',') {
            match field.trim().split_once(':') {
                Some(("audio", value)) => flags.has_audio = value.trim() == "1",
                Some(("color", value)) => flags.has_color = value.trim() == "1",
                _ => {
                    if !field.trim().is_empty() {
                        warn!(field, "ignoring malformed status field");
                    }
                }
            }
        }
        flags
    }
}

/// A file found in the storage directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
}

/// Presence flags plus the artifacts they describe
#[derive(Debug)]
pub struct MemoryStore {
    dir: PathBuf,
    flags: MemoryFlags,
}

impl MemoryStore {
    /// Open the store at `dir`, creating it if needed
    ///
    /// The persisted flags are reconciled with the artifacts on disk: a flag
    /// whose artifact file is missing is dropped and the corrected record is
    /// written back. This is how a clear interrupted between saving and
    /// deleting, or a deletion done behind our back, is resolved.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let mut store = Self {
            dir,
            flags: MemoryFlags::default(),
        };

        let persisted = store.load()?;
        let reconciled = MemoryFlags {
            has_audio: persisted.has_audio && store.audio_path().exists(),
            has_color: persisted.has_color && store.color_path().exists(),
        };

        if reconciled != persisted {
            warn!(
                ?persisted,
                ?reconciled,
                "persisted flags name missing artifacts, dropping them"
            );
            store.save(reconciled)?;
        } else {
            store.flags = persisted;
        }

        info!(
            dir = ?store.dir,
            has_audio = store.flags.has_audio,
            has_color = store.flags.has_color,
            "memory store opened"
        );

        Ok(store)
    }

    /// Read the persisted flag record. A missing record reads as empty.
    pub fn load(&self) -> Result<MemoryFlags, StoreError> {
        let path = self.status_path();
        match fs::read_to_string(&path) {
            Ok(record) => Ok(MemoryFlags::parse(&record)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(MemoryFlags::default()),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    /// Persist `flags` and adopt them as the current flags
    pub fn save(&mut self, flags: MemoryFlags) -> Result<(), StoreError> {
        let path = self.status_path();
        let tmp = self.dir.join(format!("{STATUS_FILE}.tmp"));

        fs::write(&tmp, flags.encode())
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| StoreError::Write { path, source })?;

        debug!(?flags, "flags persisted");
        self.flags = flags;
        Ok(())
    }

    /// Persist the current in-memory flags
    pub fn persist(&mut self) -> Result<(), StoreError> {
        self.save(self.flags)
    }

    /// Forget the current memory
    ///
    /// Both flags are persisted as absent before any artifact is deleted. If
    /// the save fails nothing has changed; if a deletion fails afterwards the
    /// record already says absent and the stale file is overwritten by the
    /// next capture.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.save(MemoryFlags::default())?;

        for path in [self.audio_path(), self.color_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Remove { path, source }),
            }
        }

        info!("memory cleared");
        Ok(())
    }

    /// Write the audio artifact and mark it present
    pub fn put_audio(&mut self, wav: &[u8]) -> Result<(), StoreError> {
        let path = self.audio_path();
        fs::write(&path, wav).map_err(|source| StoreError::Write { path, source })?;
        self.flags.has_audio = true;
        Ok(())
    }

    /// Write the color artifact and mark it present
    pub fn put_color(&mut self, color: Rgb) -> Result<(), StoreError> {
        let path = self.color_path();
        fs::write(&path, format!("{color}\n"))
            .map_err(|source| StoreError::Write { path, source })?;
        self.flags.has_color = true;
        Ok(())
    }

    /// List the files in the storage directory, sorted by name
    pub fn list_files(&self) -> Result<Vec<StoredFile>, StoreError> {
        let read_err = |source: io::Error| StoreError::Read {
            path: self.dir.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            let metadata = entry.metadata().map_err(read_err)?;
            if metadata.is_file() {
                files.push(StoredFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    pub fn item_count(&self) -> u8 {
        self.flags.count()
    }

    pub fn is_complete(&self) -> bool {
        self.flags.is_complete()
    }

    pub fn audio_path(&self) -> PathBuf {
        self.dir.join(AUDIO_FILE)
    }

    pub fn color_path(&self) -> PathBuf {
        self.dir.join(COLOR_FILE)
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("storage")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let (_dir, store) = open_temp();
        assert_eq!(store.flags(), MemoryFlags::default());
        assert_eq!(store.item_count(), 0);
        assert!(!store.is_complete());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, mut store) = open_temp();
        store.save(MemoryFlags::new(true, false)).unwrap();
        assert_eq!(store.load().unwrap(), MemoryFlags::new(true, false));
    }

    #[test]
    fn test_flags_survive_reopen() {
        let (dir, mut store) = open_temp();
        store.put_audio(b"RIFF").unwrap();
        store.put_color(Rgb::new(10, 20, 30)).unwrap();
        store.persist().unwrap();
        drop(store);

        let reopened = MemoryStore::open(dir.path().join("storage")).unwrap();
        assert_eq!(reopened.flags(), MemoryFlags::new(true, true));
        assert_eq!(
            fs::read_to_string(reopened.color_path()).unwrap(),
            "10,20,30\n"
        );
    }

    #[test]
    fn test_unpersisted_flags_do_not_survive() {
        let (dir, mut store) = open_temp();
        store.put_color(Rgb::default()).unwrap();
        drop(store);

        let reopened = MemoryStore::open(dir.path().join("storage")).unwrap();
        assert!(!reopened.flags().has_color);
    }

    #[test]
    fn test_missing_artifact_is_not_resurrected() {
        let (dir, mut store) = open_temp();
        store.put_audio(b"RIFF").unwrap();
        store.put_color(Rgb::default()).unwrap();
        store.persist().unwrap();

        // Simulate a clear that deleted one file before the record was
        // rewritten.
        fs::remove_file(store.audio_path()).unwrap();
        drop(store);

        let reopened = MemoryStore::open(dir.path().join("storage")).unwrap();
        assert_eq!(reopened.flags(), MemoryFlags::new(false, true));
        assert_eq!(reopened.load().unwrap(), MemoryFlags::new(false, true));
    }

    #[test]
    fn test_clear_removes_everything() {
        let (_dir, mut store) = open_temp();
        store.put_audio(b"RIFF").unwrap();
        store.put_color(Rgb::default()).unwrap();
        store.persist().unwrap();

        store.clear().unwrap();
        assert_eq!(store.flags(), MemoryFlags::default());
        assert_eq!(store.load().unwrap(), MemoryFlags::default());
        assert!(!store.audio_path().exists());
        assert!(!store.color_path().exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_dir, mut store) = open_temp();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), MemoryFlags::default());
    }

    #[test]
    fn test_parse_tolerates_noise() {
        assert_eq!(
            MemoryFlags::parse("audio:1,color:1\n"),
            MemoryFlags::new(true, true)
        );
        assert_eq!(
            MemoryFlags::parse(" color:1 , junk "),
            MemoryFlags::new(false, true)
        );
        assert_eq!(MemoryFlags::parse(""), MemoryFlags::default());
    }

    #[test]
    fn test_list_files_sorted() {
        let (_dir, mut store) = open_temp();
        store.put_color(Rgb::default()).unwrap();
        store.put_audio(&[0u8; 44]).unwrap();
        store.persist().unwrap();

        let names: Vec<_> = store
            .list_files()
            .unwrap()
            .into_iter()
            .map(|f| (f.name, f.size))
            .collect();
        assert_eq!(
            names,
            vec![
                (AUDIO_FILE.to_string(), 44),
                (COLOR_FILE.to_string(), 11),
                (STATUS_FILE.to_string(), 16),
            ]
        );
    }
}
