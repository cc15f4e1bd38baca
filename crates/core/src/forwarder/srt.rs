//! SRT forwarder (component B): MPEG-TS-over-SRT client, zero re-encode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{RelayError, SrtForwardTarget};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bus::attach;
use crate::mpegts::TsMuxer;
use crate::stream::{MediaKind, ReaderHandle, SourceStream};

use super::{Forwarder, ForwarderCounters, ForwarderState, ForwarderStats};

/// Largest MPEG-TS payload that fits one SRT message given a UDP payload
/// budget, rounded down to a whole number of 188-byte TS packets.
pub fn max_ts_payload(udp_max_payload_size: u32) -> usize {
    let budget = (udp_max_payload_size as i64 - 16).max(0) as usize;
    (budget / 188) * 188
}

fn split_stream_id(url: &url::Url) -> (String, Option<String>) {
    let mut stream_id = String::new();
    let mut passphrase = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "streamid" => stream_id = value.into_owned(),
            "passphrase" => passphrase = Some(value.into_owned()),
            _ => {}
        }
    }
    (stream_id, passphrase)
}

struct RunState {
    started: AtomicBool,
    cancel: CancellationToken,
}

pub struct SrtForwarder {
    target: SrtForwardTarget,
    counters: ForwarderCounters,
    state: Mutex<ForwarderState>,
    run: RunState,
    reader: Mutex<Option<ReaderHandle>>,
    source: Mutex<Option<Arc<dyn SourceStream>>>,
}

impl SrtForwarder {
    pub fn new(target: SrtForwardTarget) -> Self {
        Self {
            target,
            counters: ForwarderCounters::default(),
            state: Mutex::new(ForwarderState::Idle),
            run: RunState {
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            },
            reader: Mutex::new(None),
            source: Mutex::new(None),
        }
    }

    #[instrument(skip(self, source), fields(target = %self.target.url))]
    async fn run_once(&self, source: &Arc<dyn SourceStream>) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.target.url).context("parsing SRT target URL")?;
        let host = url.host_str().context("SRT URL missing host")?;
        let port = url.port().context("SRT URL missing port")?;
        let (stream_id, url_passphrase) = split_stream_id(&url);
        let passphrase = self.target.passphrase.clone().or(url_passphrase);

        *self.state.lock().await = ForwarderState::Connecting;

        let addr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(format!("invalid SRT address: {e}"))))?;

        let mut builder = srt_tokio::SrtSocket::builder().latency(Duration::from_millis(self.target.latency_ms as u64));
        if !stream_id.is_empty() {
            builder = builder.stream_id(stream_id.as_str()).context("invalid SRT stream id")?;
        }
        if let Some(pass) = passphrase {
            builder = builder.passphrase(pass.as_str()).context("invalid SRT passphrase")?;
        }

        let mut socket = builder
            .call(addr, None)
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;

        self.counters.set_connected(true);
        *self.state.lock().await = ForwarderState::Running;
        info!("SRT forwarder connected");

        let max_payload = max_ts_payload(self.target.packet_size);

        let description = source.description();
        let video_media = description.medias.iter().position(|m| m.kind == MediaKind::Video);
        let audio_media = description.medias.iter().position(|m| m.kind == MediaKind::Audio);

        let mut muxer = TsMuxer::new();
        let (pkt_tx, mut pkt_rx) = tokio::sync::mpsc::unbounded_channel::<(bool, bool, u64, Vec<u8>)>();

        let reader = attach(source, {
            let pkt_tx = pkt_tx.clone();
            move |media_index, _format_index| {
                let pkt_tx = pkt_tx.clone();
                let is_video = Some(media_index) == video_media;
                let is_audio = Some(media_index) == audio_media;
                Box::new(move |unit| {
                    if !unit.has_payload {
                        return Ok(());
                    }
                    for packet in &unit.rtp_packets {
                        let pts = packet.header.timestamp as u64;
                        let payload = packet.payload.to_vec();
                        let _ = pkt_tx.send((is_video, is_audio, pts, payload));
                    }
                    Ok(())
                })
            }
        })
        .await
        .context("attaching SRT forwarder reader")?;

        *self.reader.lock().await = Some(reader);

        let write_result = 'write_loop: loop {
            tokio::select! {
                _ = self.run.cancel.cancelled() => break Ok(()),
                maybe_packet = pkt_rx.recv() => {
                    let Some((is_video, is_audio, pts, payload)) = maybe_packet else { break Ok(()) };
                    if !is_video && !is_audio {
                        continue;
                    }
                    let mut chunk = muxer.maybe_psi();
                    if is_video {
                        chunk.extend(muxer.mux_video(&payload, pts, Some(pts)));
                    } else {
                        chunk.extend(muxer.mux_audio(&payload, pts));
                    }
                    self.counters.record_sent(1, payload.len() as u64);
                    for frame in chunk.chunks(max_payload.max(188)) {
                        if let Err(e) = tokio::time::timeout(
                            Duration::from_millis(2_000),
                            futures_util::SinkExt::send(&mut socket, (SystemTime::now(), Bytes::copy_from_slice(frame))),
                        ).await {
                            break 'write_loop Err(anyhow::anyhow!(RelayError::TransportLost(e.to_string())));
                        }
                    }
                }
            }
        };

        self.detach_reader(source).await;
        self.counters.set_connected(false);
        write_result
    }

    async fn detach_reader(&self, source: &Arc<dyn SourceStream>) {
        if let Some(reader) = self.reader.lock().await.take() {
            source.remove_reader(reader).await;
        }
    }
}

#[async_trait]
impl Forwarder for SrtForwarder {
    async fn start(self: Arc<Self>, source: Arc<dyn SourceStream>) -> anyhow::Result<()> {
        if self.run.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyStarted.into());
        }
        *self.source.lock().await = Some(Arc::clone(&source));

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut first = true;
            let started_at = tokio::time::Instant::now();
            loop {
                if this.run.cancel.is_cancelled() {
                    break;
                }
                match this.run_once(&source).await {
                    Ok(()) => {
                        if this.run.cancel.is_cancelled() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "SRT forwarder failed");
                        this.counters.set_last_error(&e).await;
                        *this.state.lock().await = ForwarderState::Error;
                    }
                }

                if !this.target.reconnect {
                    break;
                }
                if this.target.max_reconnect_time_ms > 0
                    && started_at.elapsed().as_millis() as u64 > this.target.max_reconnect_time_ms
                {
                    warn!("SRT forwarder giving up after max_reconnect_time_ms");
                    break;
                }
                if !first {
                    this.counters.record_reconnect();
                }
                first = false;

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(this.target.reconnect_delay_ms)) => {}
                    _ = this.run.cancel.cancelled() => break,
                }
            }
            *this.state.lock().await = ForwarderState::Stopped;
        });

        Ok(())
    }

    async fn stop(&self) {
        self.run.cancel.cancel();
        if let Some(source) = self.source.lock().await.clone() {
            self.detach_reader(&source).await;
        }
    }

    async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ForwarderState::Running | ForwarderState::Connecting)
    }

    async fn stats(&self) -> ForwarderStats {
        let state = *self.state.lock().await;
        ForwarderStats {
            target: self.target.url.clone(),
            state: ForwarderStats::label(state),
            connected: self.counters.is_connected(),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_lost: self.counters.packets_lost.load(Ordering::Relaxed),
            reconnect_count: self.counters.reconnect_count.load(Ordering::Relaxed),
            last_error: self.counters.last_error().await,
        }
    }

    fn target(&self) -> &str {
        &self.target.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_ts_payload_rounds_down_to_whole_packets() {
        assert_eq!(max_ts_payload(1316), 1128);
        assert_eq!(max_ts_payload(1500), 1316);
    }

    #[test]
    fn max_ts_payload_is_zero_when_budget_too_small() {
        assert_eq!(max_ts_payload(16), 0);
        assert_eq!(max_ts_payload(0), 0);
    }
}
