//! Frame sinks for completed bundles.

use async_trait::async_trait;
use parking_lot::Mutex;
use seq_core::data::{FrameBundle, FrameSink};
use seq_core::error::SeqResult;
use tracing::debug;

/// Keeps every accepted bundle in memory, tagged with its source flowcell.
#[derive(Debug, Default)]
pub struct MemorySink {
    bundles: Mutex<Vec<(String, FrameBundle)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bundles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.lock().is_empty()
    }

    /// Labels of the accepted bundles, in arrival order.
    pub fn labels(&self) -> Vec<Option<String>> {
        self.bundles
            .lock()
            .iter()
            .map(|(_, b)| b.metadata.label.clone())
            .collect()
    }

    /// Remove and return everything accepted so far.
    pub fn take(&self) -> Vec<(String, FrameBundle)> {
        std::mem::take(&mut *self.bundles.lock())
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn accept(&self, source: &str, bundle: FrameBundle) -> SeqResult<()> {
        debug!(source, frames = bundle.len(), "bundle accepted");
        self.bundles.lock().push((source.to_string(), bundle));
        Ok(())
    }
}
