//! Synthetic source stream: the in-core `SourceStream` implementation used
//! by the simulcast aggregation source and the transcoding output to
//! publish a derived stream back through the host's path registry.
//!
//! The host only needs to know how to route readers to *some*
//! `Arc<dyn SourceStream>`; it does not need its own type for streams this
//! crate itself originates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use webrtc::rtp::packet::Packet;

use crate::stream::{ReaderHandle, SessionDescription, SourceStream, Unit, UnitCallback};

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

struct Registration {
    media_index: usize,
    format_index: usize,
    callback: UnitCallback,
}

#[derive(Default)]
struct Inner {
    description: SessionDescription,
    registrations: HashMap<u64, Registration>,
}

/// A publisher-owned stream with no upstream of its own: the simulcast
/// source and the transcoder output both write into one of these and hand
/// it to the host's path registry via `set_ready`.
///
/// `Inner` is guarded by a plain `std::sync::RwLock` rather than the tokio
/// one: `description`/`on_data` are synchronous per the stream bus contract
/// (4.A) and must never suspend the caller.
pub struct SyntheticStream {
    inner: RwLock<Inner>,
}

impl SyntheticStream {
    pub fn new(description: SessionDescription) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                description,
                registrations: HashMap::new(),
            }),
        })
    }

    /// Replace the description wholesale, e.g. when the transcoder swaps
    /// its tentative description for the encoder's real one.
    pub fn set_description(&self, description: SessionDescription) {
        self.inner.write().expect("synthetic stream lock poisoned").description = description;
    }
}

#[async_trait]
impl SourceStream for SyntheticStream {
    fn description(&self) -> SessionDescription {
        self.inner.read().expect("synthetic stream lock poisoned").description.clone()
    }

    async fn add_reader(&self) -> anyhow::Result<ReaderHandle> {
        Ok(ReaderHandle(NEXT_READER_ID.fetch_add(1, Ordering::Relaxed)))
    }

    fn on_data(&self, reader: &ReaderHandle, media_index: usize, format_index: usize, callback: UnitCallback) {
        let mut guard = self.inner.write().expect("synthetic stream lock poisoned");
        guard.registrations.insert(
            reader.0,
            Registration {
                media_index,
                format_index,
                callback,
            },
        );
    }

    async fn remove_reader(&self, reader: ReaderHandle) {
        self.inner.write().expect("synthetic stream lock poisoned").registrations.remove(&reader.0);
    }

    async fn write_rtp_packet(
        &self,
        media_index: usize,
        format_index: usize,
        packet: Packet,
        ntp: SystemTime,
        _pts: u32,
    ) -> anyhow::Result<()> {
        let guard = self.inner.read().expect("synthetic stream lock poisoned");
        let unit = Unit {
            rtp_packets: vec![packet],
            ntp_time: ntp,
            has_payload: true,
        };
        for registration in guard.registrations.values() {
            if registration.media_index == media_index && registration.format_index == format_index {
                (registration.callback)(unit.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Codec, Format, Media, MediaKind};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn video_description() -> SessionDescription {
        SessionDescription {
            medias: vec![Media {
                kind: MediaKind::Video,
                formats: vec![Format {
                    codec: Codec::H264 { sps: vec![], pps: vec![] },
                    clock_rate: 90_000,
                    payload_type: 96,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn dispatches_written_packets_to_matching_registration() {
        let stream = SyntheticStream::new(video_description());
        let reader = stream.add_reader().await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        stream.on_data(&reader, 0, 0, Box::new(move |_unit| {
            count_clone.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        }));

        let packet = Packet::default();
        stream
            .write_rtp_packet(0, 0, packet, SystemTime::now(), 0)
            .await
            .unwrap();

        assert_eq!(count.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn removed_reader_receives_no_further_callbacks() {
        let stream = SyntheticStream::new(video_description());
        let reader = stream.add_reader().await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        stream.on_data(&reader, 0, 0, Box::new(move |_unit| {
            count_clone.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        }));
        stream.remove_reader(reader).await;

        stream
            .write_rtp_packet(0, 0, Packet::default(), SystemTime::now(), 0)
            .await
            .unwrap();

        assert_eq!(count.load(AtomicOrdering::Relaxed), 0);
    }
}
