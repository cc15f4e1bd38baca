//! Transcoding output (component F): external encoder child process,
//! MPEG-TS round trip, republish as a sibling path.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use relay_protocol::{MediaKind as ConfigMediaKind, RelayError, TranscodingOutputConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::attach;
use crate::mpegts::{extract_h264_params, DemuxedUnit, TsDemuxer, TsMuxer, AUDIO_PID, VIDEO_PID};
use crate::stream::{Codec, Format, Media, MediaKind, SessionDescription, SourceStream};
use crate::synthetic::SyntheticStream;

const STDIN_FLUSH_GRACE: Duration = Duration::from_secs(2);

fn tentative_description() -> SessionDescription {
    SessionDescription {
        medias: vec![
            Media {
                kind: MediaKind::Video,
                formats: vec![Format {
                    codec: Codec::H264 {
                        sps: vec![0x67, 0x42, 0x00, 0x1f],
                        pps: vec![0x68, 0xce, 0x3c, 0x80],
                    },
                    clock_rate: 90_000,
                    payload_type: 96,
                }],
            },
            Media {
                kind: MediaKind::Audio,
                formats: vec![Format {
                    codec: Codec::Opus,
                    clock_rate: 48_000,
                    payload_type: 97,
                }],
            },
        ],
    }
}

/// Build the encoder command line per `output`'s configuration: mpegts in
/// on stdin, mpegts out on stdout.
fn build_command(output: &TranscodingOutputConfig) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-f").arg("mpegts").arg("-i").arg("pipe:0");

    match output.kind {
        ConfigMediaKind::Video => {
            let video = output.video.as_ref().expect("validated: video output requires video config");
            let gop = video.framerate * 2;
            cmd.arg("-c:v")
                .arg("libx264")
                .arg("-preset")
                .arg(&video.preset)
                .arg("-tune")
                .arg("zerolatency")
                .arg("-b:v")
                .arg(video.bitrate.to_string())
                .arg("-s")
                .arg(&video.resolution)
                .arg("-r")
                .arg(video.framerate.to_string())
                .arg("-g")
                .arg(gop.to_string())
                .arg("-keyint_min")
                .arg(gop.to_string())
                .arg("-bf")
                .arg("0")
                .arg("-pix_fmt")
                .arg("yuv420p");
            if let Some(audio) = &output.audio {
                cmd.arg("-c:a")
                    .arg("libopus")
                    .arg("-b:a")
                    .arg(audio.bitrate.to_string())
                    .arg("-ar")
                    .arg(audio.samplerate.to_string())
                    .arg("-ac")
                    .arg(audio.channels.to_string());
            }
        }
        ConfigMediaKind::Audio => {
            cmd.arg("-vn");
            if let Some(audio) = &output.audio {
                cmd.arg("-c:a")
                    .arg("libopus")
                    .arg("-b:a")
                    .arg(audio.bitrate.to_string())
                    .arg("-ar")
                    .arg(audio.samplerate.to_string())
                    .arg("-ac")
                    .arg(audio.channels.to_string());
            }
        }
    }

    cmd.arg("-f")
        .arg("mpegts")
        .arg("-fflags")
        .arg("+discardcorrupt+genpts+nobuffer")
        .arg("-max_delay")
        .arg("100000")
        .arg("-avoid_negative_ts")
        .arg("make_zero")
        .arg("pipe:1");

    cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd
}

/// A single running transcoding output: its own synthetic stream and its
/// own encoder child process.
pub struct TranscodingOutput {
    config: TranscodingOutputConfig,
    stream: Arc<SyntheticStream>,
}

impl TranscodingOutput {
    pub fn new(config: TranscodingOutputConfig) -> Self {
        Self {
            stream: SyntheticStream::new(tentative_description()),
            config,
        }
    }

    pub fn stream(&self) -> Arc<SyntheticStream> {
        Arc::clone(&self.stream)
    }

    /// Spawn the child process and the input/output/stderr tasks. Returns
    /// once the child has been spawned; the tasks keep running until
    /// `cancel` fires or the child exits.
    pub async fn start(
        &self,
        upstream: Arc<dyn SourceStream>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut command = build_command(&self.config);
        let mut child: Child = command
            .spawn()
            .map_err(|e| RelayError::ChildSpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let input_cancel = cancel.clone();
        let input_task = tokio::spawn(run_input(upstream, stdin, input_cancel));

        let output_cancel = cancel.clone();
        let stream = Arc::clone(&self.stream);
        let is_video_output = matches!(self.config.kind, ConfigMediaKind::Video);
        let output_task = tokio::spawn(run_output(stdout, stream, is_video_output, output_cancel));

        tokio::spawn(run_stderr(stderr, cancel.clone()));

        tokio::spawn(async move {
            cancel.cancelled().await;
            input_task.abort();
            let _ = tokio::time::timeout(STDIN_FLUSH_GRACE, child.wait()).await;
            let _ = child.kill().await;
            output_task.abort();
        });

        Ok(())
    }
}

async fn run_input(upstream: Arc<dyn SourceStream>, mut stdin: tokio::process::ChildStdin, cancel: CancellationToken) {
    let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel::<(bool, bool, u64, Vec<u8>)>();
    let mut muxer = TsMuxer::new();

    let description = upstream.description();
    let video_index = description.medias.iter().position(|m| m.kind == MediaKind::Video);
    let audio_index = description.medias.iter().position(|m| m.kind == MediaKind::Audio);

    let reader = match attach(&upstream, {
        let pkt_tx = pkt_tx.clone();
        move |media_index, _format_index| {
            let pkt_tx = pkt_tx.clone();
            let is_video = Some(media_index) == video_index;
            let is_audio = Some(media_index) == audio_index;
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
    {
        Ok(reader) => reader,
        Err(e) => {
            warn!(error = %e, "transcoder input failed to attach reader");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_packet = pkt_rx.recv() => {
                let Some((is_video, is_audio, pts, payload)) = maybe_packet else { break };
                if !is_video && !is_audio {
                    continue;
                }
                let mut out = muxer.maybe_psi();
                if is_video {
                    out.extend(muxer.mux_video(&payload, pts, Some(pts)));
                } else {
                    out.extend(muxer.mux_audio(&payload, pts));
                }
                if stdin.write_all(&out).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = stdin.shutdown().await;
    upstream.remove_reader(reader).await;
}

async fn run_output(
    stdout: tokio::process::ChildStdout,
    stream: Arc<SyntheticStream>,
    is_video_output: bool,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stdout);
    let mut demuxer = TsDemuxer::new();
    let mut buf = vec![0u8; 4096];
    let mut description_replaced = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let units = demuxer.push(&buf[..n]);
                        for unit in units {
                            handle_demuxed_unit(&stream, unit, is_video_output, &mut description_replaced).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "transcoder stdout read failed");
                        break;
                    }
                }
            }
        }
    }

    for unit in demuxer.finish() {
        handle_demuxed_unit(&stream, unit, is_video_output, &mut description_replaced).await;
    }
}

async fn handle_demuxed_unit(
    stream: &Arc<SyntheticStream>,
    unit: DemuxedUnit,
    is_video_output: bool,
    description_replaced: &mut bool,
) {
    if unit.pid == VIDEO_PID && is_video_output && !*description_replaced {
        if let Some((sps, pps)) = extract_h264_params(&unit.payload) {
            stream.set_description(SessionDescription {
                medias: vec![
                    Media {
                        kind: MediaKind::Video,
                        formats: vec![Format {
                            codec: Codec::H264 { sps, pps },
                            clock_rate: 90_000,
                            payload_type: 96,
                        }],
                    },
                    Media {
                        kind: MediaKind::Audio,
                        formats: vec![Format { codec: Codec::Opus, clock_rate: 48_000, payload_type: 97 }],
                    },
                ],
            });
            *description_replaced = true;
            info!("transcoder output description replaced with encoder's actual SPS/PPS");
        }
    }

    let (media_index, packet) = match unit.pid {
        VIDEO_PID => (0usize, build_rtp_packet(unit.pts_90khz, &unit.payload, 96)),
        AUDIO_PID => (1usize, build_rtp_packet(unit.pts_90khz, &unit.payload, 97)),
        _ => return,
    };
    let pts = packet.header.timestamp;
    let _ = stream.write_rtp_packet(media_index, 0, packet, SystemTime::now(), pts).await;
}

fn build_rtp_packet(pts_90khz: Option<u64>, payload: &[u8], payload_type: u8) -> webrtc::rtp::packet::Packet {
    let mut packet = webrtc::rtp::packet::Packet::default();
    packet.header.payload_type = payload_type;
    packet.header.timestamp = pts_90khz.unwrap_or(0) as u32;
    packet.payload = bytes::Bytes::copy_from_slice(payload);
    packet
}

async fn run_stderr(stderr: tokio::process::ChildStderr, cancel: CancellationToken) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        use tokio::io::AsyncBufReadExt;
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        debug!(ffmpeg_stderr = line.trim_end(), "encoder output");
                        line.clear();
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Transcoder static source: binds an output stream to a named sibling
/// path and keeps a reader attached so the stream isn't torn down early.
pub async fn publish(
    registry: Arc<dyn crate::registry::PathRegistry>,
    path: &str,
    stream: Arc<SyntheticStream>,
) -> anyhow::Result<()> {
    let description = stream.description();
    registry
        .set_ready(path, stream as Arc<dyn SourceStream>, description)
        .await
}
