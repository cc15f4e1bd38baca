//! In-memory path registry: the minimal `PathRegistry` implementation
//! this crate ships as a reference/test harness, not a production media
//! server path registry (that remains out of scope per spec §1).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{PathRegistry, ReaderAuthor, SessionDescription, SourceStream};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Default)]
pub struct MemoryRegistry {
    paths: RwLock<HashMap<String, Arc<dyn SourceStream>>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PathRegistry for MemoryRegistry {
    async fn source_stream(&self, path: &str, _author: ReaderAuthor) -> Option<Arc<dyn SourceStream>> {
        self.paths.read().await.get(path).cloned()
    }

    async fn set_ready(&self, path: &str, stream: Arc<dyn SourceStream>, _description: SessionDescription) -> anyhow::Result<()> {
        self.paths.write().await.insert(path.to_string(), stream);
        info!(path, "path ready");
        Ok(())
    }

    async fn set_not_ready(&self, path: &str) {
        self.paths.write().await.remove(path);
        info!(path, "path not ready");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Codec, Format, Media, MediaKind, SyntheticStream};

    fn description() -> SessionDescription {
        SessionDescription {
            medias: vec![Media {
                kind: MediaKind::Video,
                formats: vec![Format { codec: Codec::H264 { sps: vec![], pps: vec![] }, clock_rate: 90_000, payload_type: 96 }],
            }],
        }
    }

    #[tokio::test]
    async fn set_ready_then_source_stream_round_trips() {
        let registry = MemoryRegistry::new();
        let stream = SyntheticStream::new(description());
        registry.set_ready("live/foo", stream.clone(), description()).await.unwrap();

        let author = ReaderAuthor::new();
        let found = registry.source_stream("live/foo", author).await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn set_not_ready_removes_path() {
        let registry = MemoryRegistry::new();
        let stream = SyntheticStream::new(description());
        registry.set_ready("live/foo", stream, description()).await.unwrap();
        registry.set_not_ready("live/foo").await;

        let author = ReaderAuthor::new();
        assert!(registry.source_stream("live/foo", author).await.is_none());
    }
}
