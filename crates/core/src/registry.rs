//! Host path registry surface, consumed but not implemented here.
//!
//! The simulcast aggregation source and the transcoder's publication side
//! both need to reach across paths: attach a reader to an upstream path by
//! name, and register a freshly produced stream as a new (or child) path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::stream::{SessionDescription, SourceStream};

/// Unique identity for a reader-author, used by the host's access control
/// when a component attaches a reader on a path it does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderAuthor(pub uuid::Uuid);

impl ReaderAuthor {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ReaderAuthor {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-provided registry of live paths, consumed by the simulcast source
/// (to read upstream layers) and the transcoder's publication side (to
/// publish a derived output as a sibling path).
#[async_trait]
pub trait PathRegistry: Send + Sync {
    /// Look up the stream currently bound to `path`, if the path exists and
    /// has a publisher attached. `author` identifies the caller for the
    /// host's access control.
    async fn source_stream(&self, path: &str, author: ReaderAuthor) -> Option<Arc<dyn SourceStream>>;

    /// Register `stream` as the publication for `path`, transitioning the
    /// path to "ready" with the given description. Used by synthetic
    /// sources (simulcast aggregation, transcoder output).
    async fn set_ready(
        &self,
        path: &str,
        stream: Arc<dyn SourceStream>,
        description: SessionDescription,
    ) -> anyhow::Result<()>;

    /// Transition `path` back to "not ready", releasing its publication.
    async fn set_not_ready(&self, path: &str);
}
