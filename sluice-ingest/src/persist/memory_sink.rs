use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use derive_builder::Builder;
use tokio::sync::RwLock;

use sluice_core::{Backpressure, DocSink, Document, SourceId};

#[derive(Debug, Default, Builder, Clone)]
#[builder(pattern = "owned")]
/// A simple in-memory sink.
///
/// Great for experimentation and testing. It can be told to report saturation or to fail writes
/// to exercise the backpressure and retry paths of a pipeline.
pub struct MemorySink {
    #[builder(default)]
    data: Arc<RwLock<Vec<(SourceId, Document)>>>,
    #[builder(default)]
    saturated: Arc<AtomicBool>,
    #[builder(default)]
    failing_writes: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn builder() -> MemorySinkBuilder {
        MemorySinkBuilder::default()
    }

    /// Makes every following write report [`Backpressure::Saturated`] until reset.
    pub fn set_saturated(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::Relaxed);
    }

    /// The next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::Relaxed);
    }

    /// Retrieve all documents written for a source, in write order
    pub async fn documents(&self, source_id: &str) -> Vec<Document> {
        self.data
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == source_id)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl DocSink for MemorySink {
    async fn write(&self, source_id: &str, documents: Vec<Document>) -> Result<Backpressure> {
        let should_fail = self
            .failing_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("memory sink refused the write");
        }

        let mut lock = self.data.write().await;
        lock.extend(
            documents
                .into_iter()
                .map(|doc| (source_id.to_string(), doc)),
        );

        if self.saturated.load(Ordering::Relaxed) {
            Ok(Backpressure::Saturated)
        } else {
            Ok(Backpressure::Ready)
        }
    }
}
