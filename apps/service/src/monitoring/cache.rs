use std::sync::Arc;

use arc_swap::ArcSwap;

use super::types::CycleSnapshot;

/// Holder of the most recent [`CycleSnapshot`].
///
/// Snapshots are immutable once built; `publish` swaps the whole value in one
/// atomic pointer store, so a reader holds either the old cycle or the new one
/// and never a mix of fields from both.
pub struct ResultCache {
    current: ArcSwap<CycleSnapshot>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self { current: ArcSwap::from_pointee(CycleSnapshot::empty()) }
    }

    pub fn publish(&self, snapshot: CycleSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn read(&self) -> Arc<CycleSnapshot> {
        self.current.load_full()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
