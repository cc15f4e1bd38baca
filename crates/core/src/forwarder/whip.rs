//! WHIP forwarder (component C): outbound WHIP publisher with trickle ICE,
//! mirroring the source session description into a sender peer connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use relay_protocol::{RelayError, WhipForwardTarget};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::bus::attach;
use crate::stream::{MediaKind, ReaderHandle, SourceStream};
use crate::tls::build_http_client;

use super::{Forwarder, ForwarderCounters, ForwarderState, ForwarderStats};

struct RunState {
    started: AtomicBool,
    cancel: CancellationToken,
}

/// Per-track running totals, updated by the ordered RTP write loop and read
/// by the periodic sender-report task so its report carries real numbers.
#[derive(Default)]
struct TrackCounters {
    packet_count: AtomicU64,
    octet_count: AtomicU64,
    last_rtp_time: AtomicU32,
}

pub struct WhipForwarder {
    target: WhipForwardTarget,
    counters: ForwarderCounters,
    state: Mutex<ForwarderState>,
    run: RunState,
    reader: Mutex<Option<ReaderHandle>>,
    source: Mutex<Option<Arc<dyn SourceStream>>>,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
}

impl WhipForwarder {
    pub fn new(target: WhipForwardTarget) -> Self {
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
            peer: Mutex::new(None),
        }
    }

    #[instrument(skip(self, source), fields(target = %self.target.url))]
    async fn run_once(&self, source: &Arc<dyn SourceStream>) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.target.url).context("parsing WHIP target URL")?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RelayError::ConfigInvalid("WHIP URL must be http/https".into()).into());
        }
        if !url.path().ends_with("/whip") {
            return Err(RelayError::ConfigInvalid("WHIP URL path must end with /whip".into()).into());
        }

        *self.state.lock().await = ForwarderState::Connecting;

        let http = build_http_client(self.target.fingerprint.as_deref())?;

        let description = source.description();
        let mut media_engine = MediaEngine::default();
        register_codecs(&mut media_engine)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?,
        );
        *self.peer.lock().await = Some(Arc::clone(&peer));

        let mut senders: Vec<(usize, Arc<RTCRtpSender>, Arc<TrackLocalStaticRTP>)> = Vec::new();
        for (media_index, media) in description.medias.iter().enumerate() {
            let track = match media.kind {
                MediaKind::Video => media.first_h264().map(|f| {
                    Arc::new(TrackLocalStaticRTP::new(
                        RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_H264.to_string(),
                            clock_rate: f.clock_rate,
                            ..Default::default()
                        },
                        "video".to_string(),
                        "relay".to_string(),
                    ))
                }),
                MediaKind::Audio => media.first_opus().map(|f| {
                    Arc::new(TrackLocalStaticRTP::new(
                        RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_OPUS.to_string(),
                            clock_rate: f.clock_rate,
                            channels: 2,
                            ..Default::default()
                        },
                        "audio".to_string(),
                        "relay".to_string(),
                    ))
                }),
            };
            let Some(track) = track else {
                warn!(?media.kind, "no matching format for media, skipping track");
                continue;
            };
            let sender = peer
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;
            senders.push((media_index, sender, track));
        }

        if senders.is_empty() {
            return Err(RelayError::DescriptionMismatch {
                path: self.target.url.clone(),
                media_type: "video/audio".to_string(),
            }
            .into());
        }

        let (ice_tx, mut ice_rx) = mpsc::unbounded_channel::<String>();
        peer.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    let _ = ice_tx.send(json.candidate);
                }
            }
            Box::pin(async {})
        }));

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;

        let response = http
            .post(url.as_str())
            .header("Content-Type", "application/sdp")
            .body(offer.sdp.clone())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;

        if response.status() != reqwest::StatusCode::CREATED {
            return Err(RelayError::DialFailed(format!("WHIP POST returned {}", response.status())).into());
        }
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .context("WHIP response missing Location header")?
            .to_string();
        let session_url = url.join(&location).context("resolving WHIP Location header")?;
        let answer_sdp = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;

        peer.set_remote_description(RTCSessionDescription::answer(answer_sdp).context("parsing WHIP answer SDP")?)
            .await
            .map_err(|e| anyhow::anyhow!(RelayError::DialFailed(e.to_string())))?;

        info!(%session_url, "WHIP session established");

        let trickle_http = http.clone();
        let trickle_url = session_url.clone();
        let trickle_task = tokio::spawn(async move {
            while let Some(candidate) = ice_rx.recv().await {
                let fragment = format!("a={candidate}\r\n");
                if let Err(e) = trickle_http
                    .patch(trickle_url.as_str())
                    .header("Content-Type", "application/trickle-ice-sdpfrag")
                    .header("If-Match", "*")
                    .body(fragment)
                    .send()
                    .await
                {
                    warn!(error = %e, "WHIP trickle ICE PATCH failed, continuing");
                }
            }
        });

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<u64>();
        for (_media_index, sender, _track) in &senders {
            let sender = Arc::clone(sender);
            let lost_tx = lost_tx.clone();
            tokio::spawn(async move {
                let mut last_total_lost: HashMap<u32, u32> = HashMap::new();
                while let Ok((packets, _)) = sender.read_rtcp().await {
                    for packet in &packets {
                        let reports = packet
                            .as_any()
                            .downcast_ref::<rtcp::receiver_report::ReceiverReport>()
                            .map(|rr| rr.reports.clone())
                            .or_else(|| {
                                packet
                                    .as_any()
                                    .downcast_ref::<rtcp::sender_report::SenderReport>()
                                    .map(|sr| sr.reports.clone())
                            });
                        let Some(reports) = reports else { continue };
                        for report in reports {
                            let prev = last_total_lost.entry(report.ssrc).or_insert(0);
                            if report.total_lost > *prev {
                                let delta = (report.total_lost - *prev) as u64;
                                *prev = report.total_lost;
                                let _ = lost_tx.send(delta);
                            }
                        }
                    }
                }
            });
        }

        let track_counters: Vec<Arc<TrackCounters>> = senders.iter().map(|_| Arc::new(TrackCounters::default())).collect();
        for ((_media_index, sender, _track), counters) in senders.iter().zip(track_counters.iter()) {
            spawn_sender_report_task(Arc::clone(sender), Arc::clone(counters), self.run.cancel.clone());
        }

        let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel::<(Arc<TrackLocalStaticRTP>, Arc<TrackCounters>, Packet)>();

        let reader = attach(source, {
            let senders = senders.clone();
            let track_counters = track_counters.clone();
            move |media_index, _format_index| {
                let entry = senders
                    .iter()
                    .zip(track_counters.iter())
                    .find(|((idx, _, _), _)| *idx == media_index)
                    .map(|((_, _, track), counters)| (Arc::clone(track), Arc::clone(counters)));
                let pkt_tx = pkt_tx.clone();
                Box::new(move |unit| {
                    let Some((track, counters)) = entry.clone() else { return Ok(()) };
                    if !unit.has_payload {
                        return Ok(());
                    }
                    for packet in unit.rtp_packets {
                        let _ = pkt_tx.send((Arc::clone(&track), Arc::clone(&counters), packet));
                    }
                    Ok(())
                })
            }
        })
        .await
        .context("attaching WHIP forwarder reader")?;
        *self.reader.lock().await = Some(reader);
        self.counters.set_connected(true);
        *self.state.lock().await = ForwarderState::Running;

        let (state_tx, mut state_rx) = mpsc::unbounded_channel::<RTCPeerConnectionState>();
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(state);
            Box::pin(async {})
        }));

        let result = loop {
            tokio::select! {
                _ = self.run.cancel.cancelled() => break Ok(()),
                Some(state) = state_rx.recv() => {
                    if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed) {
                        break Err(anyhow::anyhow!(RelayError::TransportLost(format!("{state:?}"))));
                    }
                }
                Some(delta) = lost_rx.recv() => {
                    self.counters.record_lost(delta);
                }
                Some((track, counters, packet)) = pkt_rx.recv() => {
                    let bytes = packet.payload.len() as u64;
                    let rtp_time = packet.header.timestamp;
                    if track.write_rtp(&packet).await.is_ok() {
                        self.counters.record_sent(1, bytes);
                        counters.packet_count.fetch_add(1, Ordering::Relaxed);
                        counters.octet_count.fetch_add(bytes, Ordering::Relaxed);
                        counters.last_rtp_time.store(rtp_time, Ordering::Relaxed);
                    }
                }
            }
        };

        trickle_task.abort();
        self.detach_reader(source).await;
        self.counters.set_connected(false);
        *self.peer.lock().await = None;

        let _ = http
            .delete(session_url.as_str())
            .send()
            .await;
        let _ = peer.close().await;

        result
    }

    async fn detach_reader(&self, source: &Arc<dyn SourceStream>) {
        if let Some(reader) = self.reader.lock().await.take() {
            source.remove_reader(reader).await;
        }
    }
}

fn register_codecs(media_engine: &mut MediaEngine) -> anyhow::Result<()> {
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_string(),
                ..Default::default()
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                ..Default::default()
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

/// Emit an RTCP sender report roughly once a second, carrying the track's
/// real running packet/octet counts and the RTP timestamp of the most
/// recently written packet, both updated by the ordered RTP write loop.
fn spawn_sender_report_task(sender: Arc<RTCRtpSender>, counters: Arc<TrackCounters>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let Ok(ssrc) = sender.get_parameters().await.encodings.first().map(|e| e.ssrc).ok_or(()) else {
                        continue;
                    };
                    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                    let ntp = ((now.as_secs() + 2_208_988_800) << 32) | (now.subsec_nanos() as u64);
                    let report = rtcp::sender_report::SenderReport {
                        ssrc,
                        ntp_time: ntp,
                        rtp_time: counters.last_rtp_time.load(Ordering::Relaxed),
                        packet_count: counters.packet_count.load(Ordering::Relaxed) as u32,
                        octet_count: counters.octet_count.load(Ordering::Relaxed) as u32,
                        reports: vec![],
                        profile_extensions: vec![],
                    };
                    let _ = sender.transport().write_rtcp(&[Box::new(report)]).await;
                }
            }
        }
    });
}

#[async_trait]
impl Forwarder for WhipForwarder {
    async fn start(self: Arc<Self>, source: Arc<dyn SourceStream>) -> anyhow::Result<()> {
        if self.run.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyStarted.into());
        }
        *self.source.lock().await = Some(Arc::clone(&source));

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let started_at = tokio::time::Instant::now();
            let mut first = true;
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
                        warn!(error = %e, "WHIP forwarder failed");
                        this.counters.set_last_error(&e).await;
                        *this.state.lock().await = ForwarderState::Error;
                    }
                }

                if !this.target.reconnect {
                    break;
                }
                if this.target.max_reconnect_time_ms() > 0
                    && started_at.elapsed().as_millis() as u64 > this.target.max_reconnect_time_ms()
                {
                    break;
                }
                if !first {
                    this.counters.record_reconnect();
                }
                first = false;
                info!(target = %this.target.url, "retrying WHIP forwarder");

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
        let mut bytes_sent = self.counters.bytes_sent.load(Ordering::Relaxed);
        let mut packets_sent = self.counters.packets_sent.load(Ordering::Relaxed);

        if self.counters.is_connected() {
            if let Some(peer) = self.peer.lock().await.clone() {
                let report = peer.get_stats().await;
                for stat in report.reports.values() {
                    if let StatsReportType::CandidatePair(pair) = stat {
                        if pair.nominated {
                            bytes_sent = pair.bytes_sent;
                            packets_sent = pair.packets_sent as u64;
                            break;
                        }
                    }
                }
            }
        }

        ForwarderStats {
            target: self.target.url.clone(),
            state: ForwarderStats::label(state),
            connected: self.counters.is_connected(),
            bytes_sent,
            packets_sent,
            packets_lost: self.counters.packets_lost.load(Ordering::Relaxed),
            reconnect_count: self.counters.reconnect_count.load(Ordering::Relaxed),
            last_error: self.counters.last_error().await,
        }
    }

    fn target(&self) -> &str {
        &self.target.url
    }
}

/// `WhipForwardTarget` has no hard cap in the config schema; the forwarder
/// treats "no cap" as the same sentinel the SRT side uses (0).
trait MaxReconnectTime {
    fn max_reconnect_time_ms(&self) -> u64;
}

impl MaxReconnectTime for WhipForwardTarget {
    fn max_reconnect_time_ms(&self) -> u64 {
        0
    }
}
