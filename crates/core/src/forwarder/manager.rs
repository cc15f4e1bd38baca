//! Forwarder manager (component D): owns the forwarder set for one path.

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::{PathName, RelayConfig};
use tracing::warn;

use crate::stream::SourceStream;

use super::srt::SrtForwarder;
use super::whip::WhipForwarder;
use super::{Forwarder, ForwarderStats};

/// Bounded interval a child is given to stop before it is considered
/// leaked (logged, not retried).
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct ForwarderManager {
    path: PathName,
    forwarders: Vec<Arc<dyn Forwarder>>,
}

impl ForwarderManager {
    /// Build the forwarder set from the typed target lists, expanding
    /// `$MTX_PATH` in every URL once and skipping disabled targets.
    pub fn new(path: PathName, config: &RelayConfig) -> Self {
        let mut forwarders: Vec<Arc<dyn Forwarder>> = Vec::new();

        for target in &config.srt_forward_targets {
            if !target.enable {
                continue;
            }
            let mut expanded = target.clone();
            expanded.url = path.expand(&expanded.url);
            forwarders.push(Arc::new(SrtForwarder::new(expanded)));
        }

        for target in &config.webrtc_forward_targets {
            if !target.enable {
                continue;
            }
            let mut expanded = target.clone();
            expanded.url = path.expand(&expanded.url);
            forwarders.push(Arc::new(WhipForwarder::new(expanded)));
        }

        Self { path, forwarders }
    }

    pub fn path(&self) -> &PathName {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }

    /// Start every forwarder against `source`. A start failure on one child
    /// is logged at warn and does not prevent the others from starting.
    pub async fn start(&self, source: Arc<dyn SourceStream>) {
        for forwarder in &self.forwarders {
            let forwarder = Arc::clone(forwarder);
            let source = Arc::clone(&source);
            let target = forwarder.target().to_string();
            if let Err(e) = forwarder.start(source).await {
                warn!(target, error = %e, "forwarder failed to start");
            }
        }
    }

    /// Stop every forwarder. Each gets up to [`STOP_GRACE`]; a child that
    /// doesn't stop in time is logged as leaked, not retried.
    pub async fn stop(&self) {
        for forwarder in &self.forwarders {
            let target = forwarder.target().to_string();
            if tokio::time::timeout(STOP_GRACE, forwarder.stop()).await.is_err() {
                warn!(target, "forwarder did not stop within grace period, considered leaked");
            }
        }
    }

    pub async fn stats(&self) -> Vec<ForwarderStats> {
        let mut out = Vec::with_capacity(self.forwarders.len());
        for forwarder in &self.forwarders {
            out.push(forwarder.stats().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::SrtForwardTarget;

    fn base_srt_target(url: &str) -> SrtForwardTarget {
        SrtForwardTarget {
            url: url.to_string(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 2_000,
            max_reconnect_time_ms: 0,
            passphrase: None,
            latency_ms: 120,
            packet_size: 1316,
            write_queue_size: 64,
        }
    }

    #[test]
    fn expands_path_placeholder_once_at_construction() {
        let mut config = RelayConfig::default();
        config.srt_forward_targets.push(base_srt_target("srt://sink:8890?streamid=publish:$MTX_PATH"));
        let manager = ForwarderManager::new(PathName::new("live/foo"), &config);
        assert_eq!(manager.forwarders[0].target(), "srt://sink:8890?streamid=publish:live/foo");
    }

    #[test]
    fn skips_disabled_targets() {
        let mut config = RelayConfig::default();
        let mut target = base_srt_target("srt://sink:8890");
        target.enable = false;
        config.srt_forward_targets.push(target);
        let manager = ForwarderManager::new(PathName::new("live/foo"), &config);
        assert!(manager.is_empty());
    }
}
