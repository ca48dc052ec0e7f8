use crate::Result;
use fleetsim_core::PersistedState;

/// Persistence contract for the fleet snapshot
///
/// Implementations own the on-disk representation; callers only ever see
/// whole snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Durably replace the stored snapshot
    fn save(&self, snapshot: &PersistedState) -> Result<()>;

    /// Read the stored snapshot.
    ///
    /// A store that has never been written yields an empty snapshot. A store
    /// whose contents cannot be recovered yields `StateError::Corrupt`.
    fn load(&self) -> Result<PersistedState>;
}
