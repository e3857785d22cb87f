//! fragmend - fragment-availability tracking and self-healing
//! reconstruction for erasure-coded distributed backups
//!
//! Backups are cut into blocks, each block erasure-coded into data and
//! parity fragments spread over a fixed ring of supplier nodes. This
//! library keeps track of which fragments exist where, pushes local
//! fragments out to suppliers, repairs blocks that lost fragments, and
//! streams whole backups back out of whatever pieces are still
//! reachable. [`engine::Engine`] ties it all together behind a single
//! event loop.

pub mod catalog;
pub mod config;
pub mod ecc;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod matrix;
pub mod rebuild;
pub mod restore;
pub mod storage;
pub mod suppliers;
pub mod transfer;
pub mod worker;

pub use config::FragmendConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::FragmendConfig;
    pub use crate::ecc::EccMap;
    pub use crate::engine::{Engine, EngineHandle};
    pub use crate::error::{Error, Result};
    pub use crate::fragment::{BackupId, FragmentAddress, FragmentId};
    pub use crate::restore::RestoreOutcome;
    pub use crate::suppliers::SupplierDirectory;
    pub use crate::transfer::Transport;
}
