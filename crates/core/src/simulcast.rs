//! Simulcast aggregation source (component E): binds N upstream layer
//! paths, rewrites SSRCs into one synthetic stream, publishes it through
//! the host's path registry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use relay_protocol::{SimulcastConfig, SimulcastLayer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webrtc::rtp::packet::Packet;

use crate::bus::attach;
use crate::registry::{PathRegistry, ReaderAuthor};
use crate::stream::{Format, Media, MediaKind, SessionDescription, SourceStream};
use crate::synthetic::SyntheticStream;

const UPSTREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct LayerHandle {
    layer: SimulcastLayer,
    path: String,
    video_ssrc: u32,
    audio_ssrc: Option<u32>,
}

/// Waits for `path` to report a populated session description, polling at
/// [`UPSTREAM_POLL_INTERVAL`] up to [`UPSTREAM_WAIT_TIMEOUT`].
async fn wait_for_upstream(
    registry: &Arc<dyn PathRegistry>,
    path: &str,
    author: ReaderAuthor,
) -> anyhow::Result<Arc<dyn SourceStream>> {
    let deadline = tokio::time::Instant::now() + UPSTREAM_WAIT_TIMEOUT;
    loop {
        if let Some(stream) = registry.source_stream(path, author).await {
            if !stream.description().is_empty() {
                return Ok(stream);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(relay_protocol::RelayError::UpstreamNotReady {
                path: path.to_string(),
                waited_ms: UPSTREAM_WAIT_TIMEOUT.as_millis() as u64,
            }
            .into());
        }
        tokio::time::sleep(UPSTREAM_POLL_INTERVAL).await;
    }
}

fn synthesize_description(upstream: &[(LayerHandle, SessionDescription)]) -> (SessionDescription, Option<Format>, Option<Format>) {
    let video_format = upstream
        .iter()
        .find_map(|(_, desc)| desc.first_video().and_then(|m| m.first_h264()))
        .cloned();
    let audio_format = upstream
        .iter()
        .find_map(|(_, desc)| desc.first_audio().and_then(|m| m.first_opus()))
        .cloned();

    let mut medias = Vec::new();
    if let Some(format) = video_format.clone() {
        medias.push(Media { kind: MediaKind::Video, formats: vec![format] });
    }
    if let Some(format) = audio_format.clone() {
        medias.push(Media { kind: MediaKind::Audio, formats: vec![format] });
    }

    (SessionDescription { medias }, video_format, audio_format)
}

/// Runs the simulcast aggregation source to completion (i.e. until
/// `cancel` fires). The host is expected to spawn this as its own task, the
/// way it would run any other static source.
pub async fn run(
    config: &SimulcastConfig,
    registry: Arc<dyn PathRegistry>,
    output_path: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut connected = Vec::new();
    let mut streams = Vec::new();

    for input in &config.inputs {
        let author = ReaderAuthor::new();
        let stream = match wait_for_upstream(&registry, &input.path, author).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(path = %input.path, error = %e, "simulcast input never became ready");
                return Err(e);
            }
        };

        let description = stream.description();
        let mut rng = rand::thread_rng();
        let handle = LayerHandle {
            layer: input.layer,
            path: input.path.clone(),
            video_ssrc: rng.gen::<u32>(),
            audio_ssrc: config.rewrite_audio_ssrc.then(|| rng.gen::<u32>()),
        };
        info!(path = %input.path, layer = ?handle.layer, ssrc = handle.video_ssrc, "simulcast input attached");
        connected.push((handle, description));
        streams.push(stream);
    }

    let (description, video_format, audio_format) = synthesize_description(&connected);
    if description.is_empty() {
        warn!(output_path, "no matching video/audio format on any simulcast input");
        return Err(relay_protocol::RelayError::DescriptionMismatch {
            path: output_path.to_string(),
            media_type: "video/audio".to_string(),
        }
        .into());
    }

    let synthetic = SyntheticStream::new(description.clone());
    let video_media_index = video_format.as_ref().map(|_| 0usize);
    let audio_media_index = match (video_format.is_some(), audio_format.is_some()) {
        (true, true) => Some(1usize),
        (false, true) => Some(0usize),
        _ => None,
    };

    registry
        .set_ready(output_path, Arc::clone(&synthetic) as Arc<dyn SourceStream>, description)
        .await?;

    let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel::<(usize, Packet, SystemTime, u32)>();

    let mut readers = Vec::new();
    for ((handle, upstream_description), stream) in connected.into_iter().zip(streams.into_iter()) {
        let upstream_video_index = upstream_description.medias.iter().position(|m| m.kind == MediaKind::Video);
        let upstream_audio_index = upstream_description.medias.iter().position(|m| m.kind == MediaKind::Audio);

        let pkt_tx = pkt_tx.clone();
        let reader = attach(&stream, move |media_index, _format_index| {
            let pkt_tx = pkt_tx.clone();
            let is_video = Some(media_index) == upstream_video_index;
            let is_audio = Some(media_index) == upstream_audio_index;
            let video_ssrc = handle.video_ssrc;
            let audio_ssrc = handle.audio_ssrc;
            let out_video_index = video_media_index;
            let out_audio_index = audio_media_index;
            Box::new(move |unit| {
                if !unit.has_payload {
                    return Ok(());
                }
                for packet in &unit.rtp_packets {
                    let mut clone = packet.clone();
                    let target_index = if is_video {
                        clone.header.ssrc = video_ssrc;
                        out_video_index
                    } else if is_audio {
                        if let Some(ssrc) = audio_ssrc {
                            clone.header.ssrc = ssrc;
                        }
                        out_audio_index
                    } else {
                        None
                    };
                    let Some(media_index) = target_index else { continue };
                    let pts = clone.header.timestamp;
                    let _ = pkt_tx.send((media_index, clone, unit.ntp_time, pts));
                }
                Ok(())
            })
        })
        .await?;
        readers.push((stream, reader, handle.path));
    }
    drop(pkt_tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_packet = pkt_rx.recv() => {
                let Some((media_index, packet, ntp, pts)) = maybe_packet else { break };
                let _ = synthetic.write_rtp_packet(media_index, 0, packet, ntp, pts).await;
            }
        }
    }

    for (stream, reader, path) in readers {
        stream.remove_reader(reader).await;
        info!(%path, "simulcast input detached");
    }
    registry.set_not_ready(output_path).await;

    Ok(())
}
