//! Disk image and snapshot delegation.
//!
//! The driver does not manipulate disk images itself. It assembles a
//! [`LaunchConfig`] and hands it, together with the instance's running state,
//! to an [`ImageBackend`].

use async_trait::async_trait;
use vmctl_core::SnapshotTag;

use crate::{DriverError, LaunchConfig};

/// External disk image and snapshot subsystem.
///
/// `running` tells the implementation whether the emulator is live, so it can
/// choose between an online (monitor) and offline (image tool) operation.
///
/// # Cancel Safety
/// Implementations are expected to be cancel safe at the granularity of a
/// single call.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Create the instance disk if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`DriverError::Disk`] if the image cannot be created.
    async fn ensure_disk(&self, cfg: &LaunchConfig) -> Result<(), DriverError>;

    /// Save a snapshot named `tag`.
    ///
    /// # Errors
    /// Returns [`DriverError::Snapshot`] if the subsystem refuses.
    async fn save_snapshot(
        &self,
        cfg: &LaunchConfig,
        running: bool,
        tag: &SnapshotTag,
    ) -> Result<(), DriverError>;

    /// Delete the snapshot named `tag`.
    ///
    /// # Errors
    /// Returns [`DriverError::Snapshot`] if the subsystem refuses.
    async fn delete_snapshot(
        &self,
        cfg: &LaunchConfig,
        running: bool,
        tag: &SnapshotTag,
    ) -> Result<(), DriverError>;

    /// Revert the instance to the snapshot named `tag`.
    ///
    /// # Errors
    /// Returns [`DriverError::Snapshot`] if the subsystem refuses.
    async fn load_snapshot(
        &self,
        cfg: &LaunchConfig,
        running: bool,
        tag: &SnapshotTag,
    ) -> Result<(), DriverError>;

    /// Tabular snapshot listing, header line first.
    ///
    /// # Errors
    /// Returns [`DriverError::Snapshot`] if the subsystem refuses.
    async fn list_snapshots(&self, cfg: &LaunchConfig, running: bool)
        -> Result<String, DriverError>;
}

/// Extract the tag column from a snapshot listing.
///
/// The first line is a header whose second column must be `TAG`; blank lines
/// are skipped.
///
/// ```
/// let listing = "ID  TAG     VM SIZE  DATE\n1   clean   0 B      2024-01-01\n";
/// let tags = vmctl_driver::snapshot::parse_snapshot_tags(listing).unwrap();
/// assert_eq!(tags, vec!["clean".to_owned()]);
/// ```
///
/// # Errors
/// Returns [`DriverError::Snapshot`] on an unknown header or a row without a
/// tag column.
pub fn parse_snapshot_tags(listing: &str) -> Result<Vec<String>, DriverError> {
    let mut lines = listing.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    if header.split_whitespace().nth(1) != Some("TAG") {
        return Err(DriverError::Snapshot(format!("unknown header: {header:?}")));
    }
    lines
        .map(|line| {
            line.split_whitespace()
                .nth(1)
                .map(str::to_owned)
                .ok_or_else(|| DriverError::Snapshot(format!("row without tag: {line:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
ID        TAG               VM SIZE                DATE     VM CLOCK     ICOUNT
1         clean                 0 B 2024-03-02 10:11:12 00:00:00.000          0

2         after-install     1.2 GiB 2024-03-02 11:00:00 00:12:01.250          0
";

    #[test]
    fn tags_are_second_column_in_order() {
        let tags = match parse_snapshot_tags(LISTING) {
            Ok(t) => t,
            Err(e) => panic!("parse: {e}"),
        };
        assert_eq!(tags, vec!["clean".to_owned(), "after-install".to_owned()]);
    }

    #[test]
    fn empty_listing_has_no_tags() {
        assert!(matches!(parse_snapshot_tags(""), Ok(v) if v.is_empty()));
        assert!(matches!(parse_snapshot_tags("ID TAG VM SIZE\n"), Ok(v) if v.is_empty()));
    }

    #[test]
    fn unknown_header_is_rejected() {
        let res = parse_snapshot_tags("Snapshot list:\n1 clean 0 B\n");
        match res {
            Err(DriverError::Snapshot(msg)) => assert!(msg.contains("unknown header"), "got {msg}"),
            other => panic!("expected Snapshot error, got {other:?}"),
        }
    }

    #[test]
    fn row_without_tag_is_rejected() {
        let res = parse_snapshot_tags("ID TAG\n7\n");
        assert!(matches!(res, Err(DriverError::Snapshot(_))), "got {res:?}");
    }
}
