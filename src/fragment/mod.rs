//! Fragment and backup identifiers
//!
//! Every erasure-coded piece of a backup is addressed by the triple
//! (block number, supplier slot, kind) rendered as `"{block}-{slot}-{kind}"`.
//! That string form is part of the on-disk layout and the wire protocol,
//! so parse/format must round-trip exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sequential block number within one backup version, starting at 0.
pub type BlockIndex = usize;

/// Ordinal position in the customer's supplier list. Stable identity
/// independent of which peer currently occupies it.
pub type SupplierSlot = usize;

/// Which half of the erasure code a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragmentKind {
    Data,
    Parity,
}

impl FragmentKind {
    /// Canonical wire/disk spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentKind::Data => "Data",
            FragmentKind::Parity => "Parity",
        }
    }

    /// Both kinds, in matrix column order.
    pub const BOTH: [FragmentKind; 2] = [FragmentKind::Data, FragmentKind::Parity];
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Data" => Ok(FragmentKind::Data),
            "Parity" => Ok(FragmentKind::Parity),
            other => Err(Error::InvalidFragmentId(format!(
                "unknown fragment kind {:?}",
                other
            ))),
        }
    }
}

/// What we currently believe about one remote fragment.
///
/// `Unknown` means no report received yet, `Missing` is an explicit
/// negative report from the supplier, `Present` is a positive report or
/// a confirmed delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentState {
    #[default]
    Unknown,
    Missing,
    Present,
}

impl FragmentState {
    pub fn is_present(&self) -> bool {
        matches!(self, FragmentState::Present)
    }
}

/// Address of one fragment within a backup version.
///
/// String form `"{block}-{slot}-{kind}"`, e.g. `"7-3-Parity"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId {
    pub block: BlockIndex,
    pub slot: SupplierSlot,
    pub kind: FragmentKind,
}

impl FragmentId {
    pub fn new(block: BlockIndex, slot: SupplierSlot, kind: FragmentKind) -> Self {
        Self { block, slot, kind }
    }

    pub fn data(block: BlockIndex, slot: SupplierSlot) -> Self {
        Self::new(block, slot, FragmentKind::Data)
    }

    pub fn parity(block: BlockIndex, slot: SupplierSlot) -> Self {
        Self::new(block, slot, FragmentKind::Parity)
    }

    /// File name under the backup version directory. Identical to the
    /// `Display` form.
    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.block, self.slot, self.kind)
    }
}

impl FromStr for FragmentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        let (block, slot, kind) = match (parts.next(), parts.next(), parts.next()) {
            (Some(b), Some(n), Some(k)) => (b, n, k),
            _ => return Err(Error::InvalidFragmentId(s.to_string())),
        };
        let block: BlockIndex = block
            .parse()
            .map_err(|_| Error::InvalidFragmentId(s.to_string()))?;
        let slot: SupplierSlot = slot
            .parse()
            .map_err(|_| Error::InvalidFragmentId(s.to_string()))?;
        let kind: FragmentKind = kind.parse()?;
        Ok(Self { block, slot, kind })
    }
}

/// Returns true if `name` is a well-formed fragment file name.
pub fn is_fragment_name(name: &str) -> bool {
    name.parse::<FragmentId>().is_ok()
}

/// One backup version: (customer, catalog path ID, version tag).
///
/// String form `"{customer}:{path_id}/{version}"`. The path ID may itself
/// contain `/` separators, so parsing splits on the *last* slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupId {
    pub customer: String,
    pub path_id: String,
    pub version: String,
}

impl BackupId {
    pub fn new(
        customer: impl Into<String>,
        path_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            customer: customer.into(),
            path_id: path_id.into(),
            version: version.into(),
        }
    }

    /// The `customer:path_id` part without the version tag.
    pub fn remote_path(&self) -> String {
        format!("{}:{}", self.customer, self.path_id)
    }

    /// True when this backup is stored under `customer`, either directly
    /// or through a key alias folded as `"{alias}${customer}"`.
    pub fn belongs_to(&self, customer: &str) -> bool {
        self.customer == customer
            || self
                .customer
                .strip_suffix(customer)
                .is_some_and(|head| head.ends_with('$'))
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.customer, self.path_id, self.version)
    }
}

impl FromStr for BackupId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, version) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidBackupId(s.to_string()))?;
        let (customer, path_id) = prefix
            .split_once(':')
            .ok_or_else(|| Error::InvalidBackupId(s.to_string()))?;
        if customer.is_empty() || path_id.is_empty() || version.is_empty() {
            return Err(Error::InvalidBackupId(s.to_string()));
        }
        Ok(Self::new(customer, path_id, version))
    }
}

/// Fully-qualified fragment: backup version plus fragment address.
///
/// String form `"{backup}/{fragment}"`. Used as the dedup key in transfer
/// queues and as the log identity of an in-flight packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentAddress {
    pub backup: BackupId,
    pub id: FragmentId,
}

impl FragmentAddress {
    pub fn new(backup: BackupId, id: FragmentId) -> Self {
        Self { backup, id }
    }
}

impl fmt::Display for FragmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backup, self.id)
    }
}

impl FromStr for FragmentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (backup, name) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidFragmentId(s.to_string()))?;
        Ok(Self {
            backup: backup.parse()?,
            id: name.parse()?,
        })
    }
}

/// Creates a version tag for the current local time, e.g. `F20260821034405PM`.
pub fn make_version_tag() -> String {
    chrono::Local::now().format("F%Y%m%d%I%M%S%p").to_string()
}

/// Returns true if `tag` looks like a timestamp version tag. Local store
/// scans call this once per directory, so the pattern compiles once.
pub fn is_canonical_version(tag: &str) -> bool {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^F\d+(AM|PM)\d*$").unwrap())
        .is_match(tag)
}
