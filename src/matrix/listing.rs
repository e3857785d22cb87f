//! Supplier listing parser.
//!
//! Suppliers periodically report everything they hold for a customer as a
//! plain-text listing, one entry per line:
//!
//! ```text
//! Kmaster
//! Findex 5456
//! D0 -1
//! D0/1 -1
//! V0/1/F20090709034221PM 3 0-1000 7463434
//! V0/0/123/4567/F20090709034221PM 3 0-11 434353 missing Data:1,3
//! ```
//!
//! The first character selects the entry type: `K` switches the current
//! key alias, `F` is a plain file, `D` is a folder and `V` is one stored
//! backup version. Parsing is deliberately forgiving. Listings come from
//! remote peers, so a malformed line is logged and skipped, never fatal.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::fragment::{is_canonical_version, BlockIndex, SupplierSlot};

/// Key alias that maps a backup directly to the customer itself.
pub const MASTER_KEY_ALIAS: &str = "master";

/// Name of the catalog index file as it appears in listings. It is kept
/// on every supplier for recovery but is not a backup version.
pub const INDEX_FILE_NAME: &str = "index";

/// One parsed line of a supplier listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingLine {
    /// `K<alias>`: all entries below belong to this key alias.
    KeyAlias(String),
    /// `F<path> [size]`: a plain file held for the customer.
    File { path: String, size: Option<u64> },
    /// `D<path>`: a folder.
    Dir { path: String },
    /// `V<path>/<version> <slot> 0-<max> <size> [missing ...]`.
    Version(VersionEntry),
}

/// A `V` line: one backup version the supplier claims to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub path_id: String,
    pub version: String,
    /// Slot the supplier believes it occupies for this backup.
    pub claimed_slot: SupplierSlot,
    /// Highest block number the supplier holds fragments for.
    pub max_block: BlockIndex,
    /// Total size of the version in bytes, as reported.
    pub size: u64,
    pub missing_data: BTreeSet<BlockIndex>,
    pub missing_parity: BTreeSet<BlockIndex>,
}

/// Parses a raw listing into its recognized lines.
///
/// Never fails: unparseable lines are dropped with a warning so a single
/// corrupted entry cannot hide the rest of a supplier's report.
pub fn parse_listing(raw: &str) -> Vec<ListingLine> {
    let mut parsed = Vec::new();
    for line in raw.lines() {
        let Some(typ) = line.chars().next() else {
            continue;
        };
        let rest = &line[typ.len_utf8()..];
        if rest.trim().is_empty() {
            continue;
        }
        // identity files sometimes leak into listings, never treat them as data
        if rest.contains("http://") || rest.contains(".xml") {
            continue;
        }
        match typ {
            'K' => parsed.push(ListingLine::KeyAlias(rest.trim().to_string())),
            'F' => parsed.push(parse_file_line(rest)),
            'D' => {
                let path = rest.split_once(' ').map_or(rest, |(head, _)| head);
                parsed.push(ListingLine::Dir {
                    path: path.to_string(),
                });
            }
            'V' => {
                if let Some(entry) = parse_version_line(rest) {
                    parsed.push(ListingLine::Version(entry));
                }
            }
            other => debug!("Skipping listing line of unknown type {:?}", other),
        }
    }
    parsed
}

fn parse_file_line(rest: &str) -> ListingLine {
    if let Some((path, size)) = rest.split_once(' ') {
        // a negative size means the supplier does not know it
        if let Ok(size) = size.parse::<i64>() {
            return ListingLine::File {
                path: path.to_string(),
                size: u64::try_from(size).ok(),
            };
        }
    }
    ListingLine::File {
        path: rest.to_string(),
        size: None,
    }
}

fn parse_version_line(rest: &str) -> Option<VersionEntry> {
    // minimum is 4 words: "0/0/F20090709034221PM" "3" "0-1000" "123456"
    let words: Vec<&str> = rest.split(' ').collect();
    if words.len() < 4 {
        warn!("Incorrect version line (words count): [{}]", rest);
        return None;
    }
    let Some((path_id, version)) = words[0].rsplit_once('/') else {
        warn!("Incorrect version line (backup id format): [{}]", rest);
        return None;
    };
    if path_id.is_empty() || !is_canonical_version(version) {
        warn!("Incorrect version line (backup id format): [{}]", rest);
        return None;
    }
    let (Ok(claimed_slot), Ok(size)) = (
        words[1].parse::<SupplierSlot>(),
        words[3].parse::<u64>(),
    ) else {
        warn!("Incorrect version line (digits format): [{}]", rest);
        return None;
    };
    let Some(max_block) = words[2]
        .split_once('-')
        .and_then(|(_, max)| max.parse::<BlockIndex>().ok())
    else {
        warn!("Incorrect version line (block range format): [{}]", rest);
        return None;
    };
    let mut entry = VersionEntry {
        path_id: path_id.to_string(),
        version: version.to_string(),
        claimed_slot,
        max_block,
        size,
        missing_data: BTreeSet::new(),
        missing_parity: BTreeSet::new(),
    };
    if words.len() > 4 {
        if words[4] != "missing" {
            warn!("Incorrect version line (unexpected tail): [{}]", rest);
            return None;
        }
        for word in &words[5..] {
            let Some((kind, blocks)) = word.split_once(':') else {
                warn!("Incorrect missing annotation [{}] in line [{}]", word, rest);
                break;
            };
            let blocks: BTreeSet<BlockIndex> =
                blocks.split(',').filter_map(|b| b.parse().ok()).collect();
            match kind {
                "Data" => entry.missing_data = blocks,
                "Parity" => entry.missing_parity = blocks,
                // unknown kinds can never match a block, ignore them
                _ => {}
            }
        }
    }
    Some(entry)
}

/// Infers which slot a supplier occupies from its own listing, by majority
/// vote over the slot numbers embedded in its version lines. Returns `None`
/// when the listing carries no version lines at all. A tie keeps the slot
/// that appeared first in the listing.
pub fn detect_supplier_position(raw: &str) -> Option<SupplierSlot> {
    let mut votes: Vec<(SupplierSlot, usize)> = Vec::new();
    for line in parse_listing(raw) {
        let ListingLine::Version(entry) = line else {
            continue;
        };
        match votes.iter_mut().find(|(slot, _)| *slot == entry.claimed_slot) {
            Some((_, count)) => *count += 1,
            None => votes.push((entry.claimed_slot, 1)),
        }
    }
    let mut best: Option<(SupplierSlot, usize)> = None;
    for (slot, count) in votes {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((slot, count));
        }
    }
    best.map(|(slot, _)| slot)
}

/// Folds a key alias into the customer ID the way backup IDs carry it:
/// the master alias maps to the customer itself, any other alias becomes
/// `"{alias}${customer}"`.
pub fn customer_for_alias(alias: &str, customer: &str) -> String {
    if alias == MASTER_KEY_ALIAS {
        customer.to_string()
    } else {
        format!("{}${}", alias, customer)
    }
}

/// On-disk archive of the latest raw listing received from each supplier.
///
/// Replayed at startup to rebuild the remote matrix without waiting a full
/// polling round for fresh reports.
#[derive(Debug, Clone)]
pub struct ListingArchive {
    root: PathBuf,
}

impl ListingArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn listing_path(&self, customer: &str, slot: SupplierSlot) -> PathBuf {
        self.root.join(customer).join(format!("{}.listing", slot))
    }

    /// Stores the latest raw listing for one supplier, replacing any
    /// previous one.
    pub fn store(&self, customer: &str, slot: SupplierSlot, raw: &str) -> Result<()> {
        let path = self.listing_path(customer, slot);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, raw)?;
        debug!("Archived listing for {} slot {} ({} bytes)", customer, slot, raw.len());
        Ok(())
    }

    /// Loads the archived listing for one supplier, if any.
    pub fn load(&self, customer: &str, slot: SupplierSlot) -> Option<String> {
        fs::read_to_string(self.listing_path(customer, slot)).ok()
    }

    /// Loads every archived listing for a customer, keyed by slot.
    pub fn load_all(&self, customer: &str) -> HashMap<SupplierSlot, String> {
        let mut listings = HashMap::new();
        let dir = self.root.join(customer);
        let Ok(entries) = fs::read_dir(&dir) else {
            return listings;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(slot) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".listing"))
                .and_then(|n| n.parse::<SupplierSlot>().ok())
            else {
                continue;
            };
            if let Ok(raw) = fs::read_to_string(entry.path()) {
                listings.insert(slot, raw);
            }
        }
        listings
    }

    /// Drops the archived listing for one supplier, used when a slot is
    /// cleared or handed to a different peer.
    pub fn forget(&self, customer: &str, slot: SupplierSlot) -> Result<()> {
        match fs::remove_file(self.listing_path(customer, slot)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_listing() {
        let raw = "Kmaster\n\
                   Findex 5456\n\
                   D0 -1\n\
                   D0/1 -1\n\
                   V0/1/F20090709034221PM 3 0-1000 7463434\n\
                   V0/0/123/4567/F20090709034221PM 3 0-11 434353 missing Data:1,3\n";
        let lines = parse_listing(raw);
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], ListingLine::KeyAlias("master".to_string()));
        assert_eq!(
            lines[1],
            ListingLine::File {
                path: "index".to_string(),
                size: Some(5456),
            }
        );
        assert_eq!(
            lines[2],
            ListingLine::Dir {
                path: "0".to_string(),
            }
        );
        let ListingLine::Version(v) = &lines[4] else {
            panic!("expected a version line");
        };
        assert_eq!(v.path_id, "0/1");
        assert_eq!(v.version, "F20090709034221PM");
        assert_eq!(v.claimed_slot, 3);
        assert_eq!(v.max_block, 1000);
        assert_eq!(v.size, 7463434);
        assert!(v.missing_data.is_empty());
        assert!(v.missing_parity.is_empty());

        let ListingLine::Version(v) = &lines[5] else {
            panic!("expected a version line");
        };
        assert_eq!(v.path_id, "0/0/123/4567");
        assert_eq!(v.max_block, 11);
        assert_eq!(v.missing_data, BTreeSet::from([1, 3]));
        assert!(v.missing_parity.is_empty());
    }

    #[test]
    fn test_parse_both_missing_kinds() {
        let raw = "V0/0/123/4/F20090709012331PM 3 0-5 434353 missing Data:1,3 Parity:0,1,2\n";
        let lines = parse_listing(raw);
        let ListingLine::Version(v) = &lines[0] else {
            panic!("expected a version line");
        };
        assert_eq!(v.missing_data, BTreeSet::from([1, 3]));
        assert_eq!(v.missing_parity, BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        // too few words
        assert!(parse_listing("V0/1/F20090709034221PM 3 0-5\n").is_empty());
        // not a version tag
        assert!(parse_listing("V0/1/notaversion 3 0-5 100\n").is_empty());
        // bad digits
        assert!(parse_listing("V0/1/F20090709034221PM x 0-5 100\n").is_empty());
        // bad block range
        assert!(parse_listing("V0/1/F20090709034221PM 3 5 100\n").is_empty());
        // fifth word must be the missing marker
        assert!(parse_listing("V0/1/F20090709034221PM 3 0-5 100 extra\n").is_empty());
        // empty and type-only lines
        assert!(parse_listing("\nV\nK\n").is_empty());
        // identity files are never data
        assert!(parse_listing("Fhttp://node/alice.xml 100\n").is_empty());
    }

    #[test]
    fn test_parse_keeps_partial_missing_sets() {
        // truncated second annotation keeps what was already parsed
        let raw = "V0/1/F20090709034221PM 3 0-5 100 missing Data:1,3 Parity\n";
        let lines = parse_listing(raw);
        let ListingLine::Version(v) = &lines[0] else {
            panic!("expected a version line");
        };
        assert_eq!(v.missing_data, BTreeSet::from([1, 3]));
        assert!(v.missing_parity.is_empty());
    }

    #[test]
    fn test_parse_file_line_without_size() {
        let lines = parse_listing("Findex -1\n");
        assert_eq!(
            lines[0],
            ListingLine::File {
                path: "index".to_string(),
                size: None,
            }
        );
    }

    #[test]
    fn test_detect_position_majority() {
        let mut raw = String::new();
        for block in 0..9 {
            raw.push_str(&format!("V0/{}/F20090709034221PM 2 0-5 100\n", block));
        }
        raw.push_str("V0/9/F20090709034221PM 5 0-5 100\n");
        assert_eq!(detect_supplier_position(&raw), Some(2));
    }

    #[test]
    fn test_detect_position_no_version_lines() {
        assert_eq!(detect_supplier_position("Kmaster\nD0 -1\n"), None);
        assert_eq!(detect_supplier_position(""), None);
    }

    #[test]
    fn test_detect_position_tie_keeps_first_seen() {
        let raw = "V0/1/F20090709034221PM 4 0-5 100\n\
                   V0/2/F20090709034221PM 1 0-5 100\n";
        assert_eq!(detect_supplier_position(raw), Some(4));
    }

    #[test]
    fn test_customer_for_alias() {
        assert_eq!(customer_for_alias("master", "alice@node-a"), "alice@node-a");
        assert_eq!(
            customer_for_alias("share_abc", "alice@node-a"),
            "share_abc$alice@node-a"
        );
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ListingArchive::new(dir.path());
        assert!(archive.load("alice@node-a", 0).is_none());

        archive.store("alice@node-a", 0, "Kmaster\n").unwrap();
        archive.store("alice@node-a", 3, "D0 -1\n").unwrap();
        assert_eq!(archive.load("alice@node-a", 0).unwrap(), "Kmaster\n");

        let all = archive.load_all("alice@node-a");
        assert_eq!(all.len(), 2);
        assert_eq!(all[&3], "D0 -1\n");

        archive.forget("alice@node-a", 0).unwrap();
        assert!(archive.load("alice@node-a", 0).is_none());
        // forgetting twice is fine
        archive.forget("alice@node-a", 0).unwrap();
    }
}
