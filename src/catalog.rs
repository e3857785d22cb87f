//! Backup catalog interface
//!
//! The catalog is the authoritative list of what *should* exist: which
//! paths are backed up, which versions each path has, and the best known
//! block count and byte size per version. The availability matrix consults
//! it while reconciling supplier reports and pushes better information back
//! when a report reveals it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fragment::{BackupId, BlockIndex};

/// Best known shape of one backup version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Highest block number seen for this version, if any report or local
    /// scan has established one.
    pub max_block: Option<BlockIndex>,
    /// Total byte size of the version as reported by suppliers.
    pub size: u64,
}

impl VersionInfo {
    pub fn new(max_block: Option<BlockIndex>, size: u64) -> Self {
        Self { max_block, size }
    }
}

/// What the matrix needs from the catalog.
///
/// Implemented by the embedding application; [`MemoryCatalog`] covers tests
/// and single-process deployments.
pub trait Catalog: Send {
    /// Is this path known at all for this customer?
    fn has_path(&self, customer: &str, path_id: &str) -> bool;

    /// Is this exact version known?
    fn has_version(&self, backup: &BackupId) -> bool;

    fn version_info(&self, backup: &BackupId) -> Option<VersionInfo>;

    /// Record better information learned from a supplier report.
    fn set_version_info(&mut self, backup: &BackupId, info: VersionInfo);

    /// Every version the catalog knows for this customer. Used to spot
    /// backups no supplier mentioned at all.
    fn known_backups(&self, customer: &str) -> Vec<BackupId>;

    /// Highest known block number, if established.
    fn max_known_block(&self, backup: &BackupId) -> Option<BlockIndex> {
        self.version_info(backup).and_then(|info| info.max_block)
    }
}

/// In-memory catalog keyed by customer and path.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    // (customer, path_id) -> version -> info
    paths: HashMap<(String, String), HashMap<String, VersionInfo>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version, creating the path entry if needed.
    pub fn add_version(&mut self, backup: &BackupId, info: VersionInfo) {
        self.paths
            .entry((backup.customer.clone(), backup.path_id.clone()))
            .or_default()
            .insert(backup.version.clone(), info);
    }

    pub fn remove_version(&mut self, backup: &BackupId) {
        let key = (backup.customer.clone(), backup.path_id.clone());
        if let Some(versions) = self.paths.get_mut(&key) {
            versions.remove(&backup.version);
            if versions.is_empty() {
                self.paths.remove(&key);
            }
        }
    }

    pub fn remove_path(&mut self, customer: &str, path_id: &str) {
        self.paths
            .remove(&(customer.to_string(), path_id.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Catalog for MemoryCatalog {
    fn has_path(&self, customer: &str, path_id: &str) -> bool {
        self.paths
            .contains_key(&(customer.to_string(), path_id.to_string()))
    }

    fn has_version(&self, backup: &BackupId) -> bool {
        self.paths
            .get(&(backup.customer.clone(), backup.path_id.clone()))
            .map(|versions| versions.contains_key(&backup.version))
            .unwrap_or(false)
    }

    fn version_info(&self, backup: &BackupId) -> Option<VersionInfo> {
        self.paths
            .get(&(backup.customer.clone(), backup.path_id.clone()))
            .and_then(|versions| versions.get(&backup.version))
            .copied()
    }

    fn set_version_info(&mut self, backup: &BackupId, info: VersionInfo) {
        self.add_version(backup, info);
    }

    fn known_backups(&self, customer: &str) -> Vec<BackupId> {
        let mut out = Vec::new();
        for ((owner, path_id), versions) in &self.paths {
            if owner != customer {
                continue;
            }
            for version in versions.keys() {
                out.push(BackupId::new(owner.clone(), path_id.clone(), version.clone()));
            }
        }
        out.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(path: &str, version: &str) -> BackupId {
        BackupId::new("alice@node-a", path, version)
    }

    #[test]
    fn test_add_and_query() {
        let mut catalog = MemoryCatalog::new();
        let id = backup("0/0/1", "F20260101120000AM");
        assert!(!catalog.has_version(&id));

        catalog.add_version(&id, VersionInfo::new(Some(9), 4096));
        assert!(catalog.has_path("alice@node-a", "0/0/1"));
        assert!(catalog.has_version(&id));
        assert_eq!(catalog.max_known_block(&id), Some(9));
        assert_eq!(catalog.version_info(&id).unwrap().size, 4096);
    }

    #[test]
    fn test_set_version_info_updates() {
        let mut catalog = MemoryCatalog::new();
        let id = backup("1/2", "F20260101120000AM");
        catalog.add_version(&id, VersionInfo::new(None, 0));
        catalog.set_version_info(&id, VersionInfo::new(Some(4), 777));
        assert_eq!(
            catalog.version_info(&id),
            Some(VersionInfo::new(Some(4), 777))
        );
    }

    #[test]
    fn test_remove_version_and_path() {
        let mut catalog = MemoryCatalog::new();
        let v1 = backup("1/2", "F20260101120000AM");
        let v2 = backup("1/2", "F20260202010101PM");
        catalog.add_version(&v1, VersionInfo::default());
        catalog.add_version(&v2, VersionInfo::default());

        catalog.remove_version(&v1);
        assert!(!catalog.has_version(&v1));
        assert!(catalog.has_version(&v2));
        assert!(catalog.has_path("alice@node-a", "1/2"));

        catalog.remove_version(&v2);
        assert!(!catalog.has_path("alice@node-a", "1/2"));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_known_backups_filters_by_customer() {
        let mut catalog = MemoryCatalog::new();
        catalog.add_version(&backup("1/2", "F20260101120000AM"), VersionInfo::default());
        catalog.add_version(
            &BackupId::new("bob@node-b", "3/4", "F20260101120000AM"),
            VersionInfo::default(),
        );

        let known = catalog.known_backups("alice@node-a");
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].path_id, "1/2");
    }
}
