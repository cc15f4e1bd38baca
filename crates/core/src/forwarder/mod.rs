//! Forwarder fleet (components B, C, D): per-path zero-recode fan-out to
//! remote SRT and WHIP sinks, with reconnect and a manager that owns the
//! whole set for one path.

pub mod manager;
pub mod srt;
pub mod whip;

pub use manager::ForwarderManager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Lifecycle state of a single forwarder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Idle,
    Connecting,
    Running,
    Error,
    Stopped,
}

/// Atomic counters plus the monotone last-error record shared by every
/// forwarder kind. `last_error` is never cleared once set; `reconnect_count`
/// never decreases.
#[derive(Default)]
pub struct ForwarderCounters {
    pub bytes_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_lost: AtomicU64,
    pub reconnect_count: AtomicU64,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl ForwarderCounters {
    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn set_last_error(&self, error: impl std::fmt::Display) {
        *self.last_error.write().await = Some(error.to_string());
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub fn record_sent(&self, packets: u64, bytes: u64) {
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_lost(&self, packets: u64) {
        self.packets_lost.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of a forwarder's counters, returned by
/// `GetStats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ForwarderStats {
    pub target: String,
    pub state: &'static str,
    pub connected: bool,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub reconnect_count: u64,
    pub last_error: Option<String>,
}

fn state_label(state: ForwarderState) -> &'static str {
    match state {
        ForwarderState::Idle => "idle",
        ForwarderState::Connecting => "connecting",
        ForwarderState::Running => "running",
        ForwarderState::Error => "error",
        ForwarderState::Stopped => "stopped",
    }
}

impl ForwarderStats {
    pub fn label(state: ForwarderState) -> &'static str {
        state_label(state)
    }
}

/// The small capability set the manager needs from either forwarder kind,
/// expressed as a trait object instead of a tagged enum so the manager's
/// vector stays uniform regardless of how many forwarder kinds exist.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// One-shot: fails with `RelayError::AlreadyStarted` if called twice.
    async fn start(self: Arc<Self>, source: Arc<dyn crate::stream::SourceStream>) -> anyhow::Result<()>;

    /// Idempotent: cancels the supervisor, closes the connection, detaches
    /// the reader. Safe to call even if `start` was never called.
    async fn stop(&self);

    async fn is_running(&self) -> bool;

    async fn stats(&self) -> ForwarderStats;

    fn target(&self) -> &str;
}
