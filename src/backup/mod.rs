//! Backup subsystem
//!
//! Pre-flight classification of a descriptor's mounts (backupability, size,
//! privilege requirements) and safe snapshotting of named volumes and bind
//! mounts into tar.gz archives with recorded checksums.

mod classify;
mod execute;

pub use classify::{classify, BackupClassification, MountClass};
pub use execute::{backup_mount, BackupKind, BackupRecord};
