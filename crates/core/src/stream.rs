//! Host-provided stream bus surface, consumed but not implemented here.
//!
//! `relay-host` ships a minimal in-memory implementation for demos and
//! integration tests; a production media server would back this with its
//! own path/session machinery.

use std::time::SystemTime;

use async_trait::async_trait;
use webrtc::rtp::packet::Packet;

/// The two media kinds a path can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

/// A codec and its negotiation parameters, independent of any particular
/// peer connection or muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    H264 { sps: Vec<u8>, pps: Vec<u8> },
    Opus,
    Other { name: String },
}

impl Codec {
    pub fn is_h264(&self) -> bool {
        matches!(self, Codec::H264 { .. })
    }

    pub fn is_opus(&self) -> bool {
        matches!(self, Codec::Opus)
    }
}

/// One format within a media: a codec plus its RTP clock rate and, for
/// video, an associated payload type.
#[derive(Debug, Clone)]
pub struct Format {
    pub codec: Codec,
    pub clock_rate: u32,
    pub payload_type: u8,
}

/// One media within a session description: a kind plus the formats offered
/// for it, in preference order.
#[derive(Debug, Clone)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn first_h264(&self) -> Option<&Format> {
        self.formats.iter().find(|f| f.codec.is_h264())
    }

    pub fn first_opus(&self) -> Option<&Format> {
        self.formats.iter().find(|f| f.codec.is_opus())
    }
}

/// An ordered list of medias, the unit exchanged at WHIP/WHEP offer time and
/// used to drive track/format negotiation everywhere else in this crate.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub medias: Vec<Media>,
}

impl SessionDescription {
    pub fn is_empty(&self) -> bool {
        self.medias.is_empty()
    }

    pub fn first_video(&self) -> Option<&Media> {
        self.medias.iter().find(|m| m.kind == MediaKind::Video)
    }

    pub fn first_audio(&self) -> Option<&Media> {
        self.medias.iter().find(|m| m.kind == MediaKind::Audio)
    }
}

/// An envelope handed from the stream bus to a reader: zero or more RTP
/// packets from the same media/format, an NTP wall-clock stamp aligned to
/// the first packet, and whether a payload is actually present.
#[derive(Debug, Clone)]
pub struct Unit {
    pub rtp_packets: Vec<Packet>,
    pub ntp_time: SystemTime,
    pub has_payload: bool,
}

impl Unit {
    pub fn packet_count(&self) -> usize {
        self.rtp_packets.len()
    }
}

/// Callback registered per (media, format) pair. Must return promptly and
/// never perform blocking I/O; forwarders enqueue into their own writer
/// instead of acting inline.
pub type UnitCallback = Box<dyn Fn(Unit) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle to a reader registration, released via
/// [`SourceStream::remove_reader`]. Readers are exclusively owned by
/// whichever forwarder/source attached them.
#[derive(Debug)]
pub struct ReaderHandle(pub u64);

/// Uniform interface over a host's per-path sample bus: a live upstream
/// publication to read from, or a synthetic stream to publish into.
///
/// Implementors must deliver units to a given reader in publication order
/// and must not invoke a reader's callbacks after it has been removed.
#[async_trait]
pub trait SourceStream: Send + Sync {
    /// Current session description. For a synthetic/tentative stream this
    /// may change over time (e.g. transcoder output before/after first
    /// successful parse).
    fn description(&self) -> SessionDescription;

    /// Register a new reader against this stream. Fails if the stream has
    /// been torn down.
    async fn add_reader(&self) -> anyhow::Result<ReaderHandle>;

    /// Register the callback invoked for units of the given (media, format)
    /// pair, for the given reader. Call once per pair present in the
    /// session description before depending on delivery.
    fn on_data(&self, reader: &ReaderHandle, media_index: usize, format_index: usize, callback: UnitCallback);

    /// Detach a reader. After this returns, no further callback invocation
    /// for that reader occurs. Idempotent per handle.
    async fn remove_reader(&self, reader: ReaderHandle);

    /// Write an RTP packet into a synthetic stream at the given (media,
    /// format) coordinates. `pts` stays in the RTP clock domain (i.e. it is
    /// `packet.header.timestamp`, not a wall-clock value).
    async fn write_rtp_packet(
        &self,
        media_index: usize,
        format_index: usize,
        packet: Packet,
        ntp: SystemTime,
        pts: u32,
    ) -> anyhow::Result<()>;
}
