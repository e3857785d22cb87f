//! Local fragment storage
//!
//! Fragments live under `<root>/<customer>/<path_id>/<version>/<fragment>`,
//! where the fragment file name is the canonical `"{block}-{slot}-{kind}"`
//! form. The store is deliberately dumb: it moves bytes and reports what is
//! on disk, and the availability matrix decides what that means.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::fragment::{is_canonical_version, BackupId, FragmentId};

/// One fragment file found by a disk scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFragment {
    pub backup: BackupId,
    pub id: FragmentId,
    pub size: u64,
}

/// Fragment file store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FragmentStore {
    root: PathBuf,
}

impl FragmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all fragments of one backup version.
    pub fn version_dir(&self, backup: &BackupId) -> PathBuf {
        self.root
            .join(&backup.customer)
            .join(&backup.path_id)
            .join(&backup.version)
    }

    pub fn fragment_path(&self, backup: &BackupId, id: &FragmentId) -> PathBuf {
        self.version_dir(backup).join(id.file_name())
    }

    /// Write a fragment, creating the version directory as needed.
    /// Returns the byte size written, for local-size accounting.
    pub fn write_fragment(&self, backup: &BackupId, id: &FragmentId, bytes: &[u8]) -> Result<u64> {
        let dir = self.version_dir(backup);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(id.file_name()), bytes)?;
        Ok(bytes.len() as u64)
    }

    pub fn read_fragment(&self, backup: &BackupId, id: &FragmentId) -> Result<Bytes> {
        match fs::read(self.fragment_path(backup, id)) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::FragmentNotFound(format!("{}/{}", backup, id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_fragment(&self, backup: &BackupId, id: &FragmentId) -> bool {
        self.fragment_path(backup, id).is_file()
    }

    pub fn fragment_size(&self, backup: &BackupId, id: &FragmentId) -> Option<u64> {
        fs::metadata(self.fragment_path(backup, id))
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Delete one fragment file. Returns whether it existed.
    pub fn delete_fragment(&self, backup: &BackupId, id: &FragmentId) -> Result<bool> {
        match fs::remove_file(self.fragment_path(backup, id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the whole version directory.
    pub fn delete_version(&self, backup: &BackupId) -> Result<()> {
        match fs::remove_dir_all(self.version_dir(backup)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fragments present on disk for one version, with sizes.
    pub fn scan_version(&self, backup: &BackupId) -> Result<Vec<(FragmentId, u64)>> {
        let dir = self.version_dir(backup);
        let mut found = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = name.parse::<FragmentId>() {
                found.push((id, meta.len()));
            }
        }
        found.sort_by_key(|(id, _)| *id);
        Ok(found)
    }

    /// Walk everything stored for one customer. A directory whose name is a
    /// canonical version tag is treated as a version directory; files named
    /// like fragments inside it are reported. Partial `newblock-` writes and
    /// stray files are skipped.
    pub fn scan_customer(&self, customer: &str) -> Result<Vec<LocalFragment>> {
        let base = self.root.join(customer);
        let mut found = Vec::new();
        if !base.is_dir() {
            return Ok(found);
        }
        let mut stack = vec![(base, String::new())];
        while let Some((dir, rel)) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if meta.is_dir() {
                    let child_rel = if rel.is_empty() {
                        name
                    } else {
                        format!("{}/{}", rel, name)
                    };
                    stack.push((entry.path(), child_rel));
                    continue;
                }
                if !meta.is_file() || name.starts_with("newblock-") {
                    continue;
                }
                let Some((path_id, version)) = rel.rsplit_once('/') else {
                    continue;
                };
                if !is_canonical_version(version) {
                    continue;
                }
                if let Ok(id) = name.parse::<FragmentId>() {
                    found.push(LocalFragment {
                        backup: BackupId::new(customer, path_id, version),
                        id,
                        size: meta.len(),
                    });
                }
            }
        }
        Ok(found)
    }
}
