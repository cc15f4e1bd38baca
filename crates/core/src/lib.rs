//! Core media-relay logic: the stream bus adaptor, the MPEG-TS codec, the
//! SRT/WHIP forwarders and their manager, the simulcast aggregation source,
//! and the transcoding output. None of this crate owns a path registry or a
//! stream bus of its own — `relay-host` supplies both.

pub mod bus;
pub mod forwarder;
pub mod mpegts;
pub mod registry;
pub mod simulcast;
pub mod stream;
pub mod synthetic;
pub mod tls;
pub mod transcode;

pub use forwarder::{Forwarder, ForwarderCounters, ForwarderManager, ForwarderState, ForwarderStats};
pub use registry::{PathRegistry, ReaderAuthor};
pub use stream::{Codec, Format, Media, MediaKind, ReaderHandle, SessionDescription, SourceStream, Unit, UnitCallback};
pub use synthetic::SyntheticStream;
