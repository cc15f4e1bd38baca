use serde::{Deserialize, Serialize};

use crate::path::PATH_PLACEHOLDER;

fn default_true() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_srt_latency_ms() -> u32 {
    120
}

fn default_srt_packet_size() -> u32 {
    1316
}

fn default_write_queue_size() -> usize {
    64
}

/// Per-path configuration, as loaded from the host's per-path config block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub srt_forward_targets: Vec<SrtForwardTarget>,
    #[serde(default)]
    pub webrtc_forward_targets: Vec<WhipForwardTarget>,
    #[serde(default)]
    pub simulcast: SimulcastConfig,
    #[serde(default)]
    pub srt_transcoding: TranscodingConfig,
}

impl RelayConfig {
    /// Validate the configuration. Returns a list of issues; entries
    /// prefixed `ERROR:` mean the path must not initialise, anything else is
    /// a warning the caller may log and continue past.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for target in &self.srt_forward_targets {
            issues.extend(target.validate());
        }
        for target in &self.webrtc_forward_targets {
            issues.extend(target.validate());
        }
        if self.simulcast.enable {
            issues.extend(self.simulcast.validate());
        }
        if self.srt_transcoding.enable {
            issues.extend(self.srt_transcoding.validate());
        }

        issues
    }
}

/// An SRT forward target: a remote MPEG-TS-over-SRT sink this path's stream
/// is mirrored to at zero re-encoding cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrtForwardTarget {
    pub url: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 0 means no cap (retry forever).
    #[serde(default)]
    pub max_reconnect_time_ms: u64,
    pub passphrase: Option<String>,
    #[serde(default = "default_srt_latency_ms")]
    pub latency_ms: u32,
    #[serde(default = "default_srt_packet_size")]
    pub packet_size: u32,
    /// Tunable only, not a correctness contract: the depth of the buffered
    /// writer in front of the SRT socket. See DESIGN.md for why this stays a
    /// knob instead of a hard-coded constant.
    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,
}

impl SrtForwardTarget {
    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.url.trim().is_empty() {
            issues.push("ERROR: srt forward target URL must be non-empty".to_string());
            return issues;
        }
        if !self.url.contains(PATH_PLACEHOLDER) && !self.url.starts_with("srt://") {
            issues.push(format!("ERROR: srt forward target URL must use srt:// scheme: {}", self.url));
        }
        if self.reconnect && self.reconnect_delay_ms == 0 {
            issues.push("ERROR: reconnect=true requires reconnect_delay_ms > 0".to_string());
        }
        if self.latency_ms == 0 {
            issues.push(format!("srt target {} has latency_ms=0, using protocol default", self.url));
        }
        issues
    }
}

/// A WHIP forward target: a remote WHIP ingest endpoint this path's stream is
/// published to, mirroring the same tracks the source publisher signalled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhipForwardTarget {
    pub url: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// SHA-256 fingerprint of the expected server certificate, hex-encoded,
    /// for pinning instead of (or in addition to) system trust roots.
    pub fingerprint: Option<String>,
}

impl WhipForwardTarget {
    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.url.trim().is_empty() {
            issues.push("ERROR: whip forward target URL must be non-empty".to_string());
            return issues;
        }
        if !self.url.contains(PATH_PLACEHOLDER) {
            match url::Url::parse(&self.url) {
                Ok(parsed) => {
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        issues.push(format!(
                            "ERROR: whip target scheme must be http/https: {}",
                            self.url
                        ));
                    }
                    if !parsed.path().ends_with("/whip") {
                        issues.push(format!(
                            "ERROR: whip target path must end with /whip: {}",
                            self.url
                        ));
                    }
                }
                Err(e) => issues.push(format!("ERROR: whip target URL is invalid ({e}): {}", self.url)),
            }
        }
        if self.reconnect && self.reconnect_delay_ms == 0 {
            issues.push("ERROR: reconnect=true requires reconnect_delay_ms > 0".to_string());
        }
        issues
    }
}

/// The three fixed simulcast layer names. Ordered high to low, matching the
/// client controller's level table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulcastLayer {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulcastInputConfig {
    pub path: String,
    pub layer: SimulcastLayer,
    pub resolution: Option<String>,
    pub bitrate: Option<u32>,
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulcastConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub inputs: Vec<SimulcastInputConfig>,
    /// Open question resolved: rewrite audio SSRC the same way video SSRC is
    /// rewritten, per-layer. Defaults to `true`; both modes are tested.
    #[serde(default = "default_true")]
    pub rewrite_audio_ssrc: bool,
}

impl SimulcastConfig {
    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.inputs.is_empty() {
            issues.push("ERROR: simulcast.enable=true requires at least one input".to_string());
        }
        for input in &self.inputs {
            if input.path.trim().is_empty() {
                issues.push("ERROR: simulcast input path must be non-empty".to_string());
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTranscodeConfig {
    pub resolution: String,
    pub bitrate: u32,
    pub framerate: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_preset() -> String {
    "veryfast".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTranscodeConfig {
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_samplerate")]
    pub samplerate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
}

fn default_audio_bitrate() -> u32 {
    128_000
}
fn default_samplerate() -> u32 {
    48_000
}
fn default_channels() -> u8 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingOutputConfig {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub video: Option<VideoTranscodeConfig>,
    pub audio: Option<AudioTranscodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscodingConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub outputs: Vec<TranscodingOutputConfig>,
}

impl TranscodingConfig {
    fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.outputs.is_empty() {
            issues.push("ERROR: srt_transcoding.enable=true requires at least one output".to_string());
        }
        for output in &self.outputs {
            if output.path.trim().is_empty() {
                issues.push("ERROR: transcoding output path must be non-empty".to_string());
            }
            if matches!(output.kind, MediaKind::Video) && output.video.is_none() {
                issues.push(format!(
                    "ERROR: transcoding output {} has type=video but no video config",
                    output.path
                ));
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_url() {
        let target = SrtForwardTarget {
            url: String::new(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 0,
            max_reconnect_time_ms: 0,
            passphrase: None,
            latency_ms: 120,
            packet_size: 1316,
            write_queue_size: 64,
        };
        let issues = target.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn rejects_reconnect_without_delay() {
        let target = SrtForwardTarget {
            url: "srt://sink:8890".to_string(),
            enable: true,
            reconnect: true,
            reconnect_delay_ms: 0,
            max_reconnect_time_ms: 0,
            passphrase: None,
            latency_ms: 120,
            packet_size: 1316,
            write_queue_size: 64,
        };
        assert!(target.validate().iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn whip_target_requires_whip_suffix() {
        let target = WhipForwardTarget {
            url: "https://sink/ingest".to_string(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 2_000,
            fingerprint: None,
        };
        assert!(target.validate().iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn whip_target_accepts_placeholder_url_without_parsing() {
        let target = WhipForwardTarget {
            url: "https://$MTX_PATH.example.com/whip".to_string(),
            enable: true,
            reconnect: false,
            reconnect_delay_ms: 2_000,
            fingerprint: None,
        };
        assert!(target.validate().is_empty());
    }

    #[test]
    fn config_with_disabled_simulcast_skips_input_validation() {
        let config = RelayConfig {
            simulcast: SimulcastConfig {
                enable: false,
                inputs: vec![],
                rewrite_audio_ssrc: true,
            },
            ..Default::default()
        };
        assert!(config.validate().is_empty());
    }
}
