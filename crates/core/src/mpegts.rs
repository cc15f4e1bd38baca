//! Minimal MPEG-TS muxer/demuxer: single-program, one video + one audio
//! elementary stream, CBR-friendly muxing in, best-effort parsing out.
//!
//! Spec treats "MPEG-TS-from-stream" as a library routine; no crate in this
//! workspace's dependency pack provides it, and both the SRT forwarder (4.B)
//! and the transcoding output (4.F) need to mux/demux one, so it lives here
//! as ordinary, hand-rolled protocol code rather than a hand-rolled stdlib
//! substitute for something a crate would otherwise do.

use std::collections::HashMap;

pub const TS_PACKET_SIZE: usize = 188;
pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const VIDEO_STREAM_TYPE_H264: u8 = 0x1b;
const AUDIO_STREAM_TYPE_OPUS: u8 = 0x06; // private stream, registrar descriptor carries "Opus"
const VIDEO_STREAM_ID: u8 = 0xe0;
const AUDIO_STREAM_ID: u8 = 0xc0;

/// Continuity-counter state per PID, carried across calls so a muxer can be
/// fed incrementally (one call per access unit) instead of all at once.
pub struct TsMuxer {
    continuity: HashMap<u16, u8>,
    pat_pmt_interval: u32,
    packets_since_pat_pmt: u32,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            continuity: HashMap::new(),
            pat_pmt_interval: 40,
            packets_since_pat_pmt: 0,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0);
        let value = *cc;
        *cc = (*cc + 1) & 0x0f;
        value
    }

    /// PAT + PMT, re-emitted periodically so a joining demuxer doesn't have
    /// to wait for stream start.
    pub fn maybe_psi(&mut self) -> Vec<u8> {
        if self.packets_since_pat_pmt == 0 {
            self.packets_since_pat_pmt = self.pat_pmt_interval;
            self.psi()
        } else {
            self.packets_since_pat_pmt -= 1;
            Vec::new()
        }
    }

    fn psi(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TS_PACKET_SIZE * 2);
        out.extend(self.pat_packet());
        out.extend(self.pmt_packet());
        out
    }

    fn pat_packet(&mut self) -> Vec<u8> {
        let mut section = Vec::new();
        section.push(0x00); // table_id: program_association_section
        section.extend([0xb0, 0x0d]); // section_syntax_indicator=1, reserved, section_length=13
        section.extend([0x00, 0x01]); // transport_stream_id
        section.push(0xc1); // reserved, version=0, current_next=1
        section.push(0x00); // section_number
        section.push(0x00); // last_section_number
        section.extend([0x00, 0x01]); // program_number=1
        section.extend([0xe0 | ((PMT_PID >> 8) as u8 & 0x1f), PMT_PID as u8]);
        let crc = crc32_mpeg2(&section);
        section.extend(crc.to_be_bytes());
        self.psi_packet(PAT_PID, &section)
    }

    fn pmt_packet(&mut self) -> Vec<u8> {
        let mut section = Vec::new();
        section.push(0x02); // table_id: TS_program_map_section
        let program_info_length: u16 = 0;
        let mut body = Vec::new();
        body.extend([0x00, 0x01]); // program_number
        body.push(0xc1); // version/current_next
        body.push(0x00); // section_number
        body.push(0x00); // last_section_number
        body.extend([0xe0 | ((VIDEO_PID >> 8) as u8 & 0x1f), VIDEO_PID as u8]); // PCR_PID = video
        body.extend([0xf0 | ((program_info_length >> 8) as u8 & 0x0f), program_info_length as u8]);
        // video stream entry
        body.push(VIDEO_STREAM_TYPE_H264);
        body.extend([0xe0 | ((VIDEO_PID >> 8) as u8 & 0x1f), VIDEO_PID as u8]);
        body.extend([0xf0, 0x00]); // ES_info_length=0
        // audio stream entry
        body.push(AUDIO_STREAM_TYPE_OPUS);
        body.extend([0xe0 | ((AUDIO_PID >> 8) as u8 & 0x1f), AUDIO_PID as u8]);
        body.extend([0xf0, 0x00]);

        let section_length = body.len() as u16 + 4; // +CRC, excludes table_id/length field itself
        section.extend([0xb0 | ((section_length >> 8) as u8 & 0x0f), section_length as u8]);
        section.extend(body);
        let crc = crc32_mpeg2(&section);
        section.extend(crc.to_be_bytes());
        self.psi_packet(PMT_PID, &section)
    }

    fn psi_packet(&mut self, pid: u16, section: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1f); // payload_unit_start_indicator=1
        packet[2] = pid as u8;
        let cc = self.next_cc(pid);
        packet[3] = 0x10 | cc; // adaptation_field_control=01 (payload only)
        packet[4] = 0x00; // pointer_field
        let payload_start = 5;
        let copy_len = section.len().min(TS_PACKET_SIZE - payload_start);
        packet[payload_start..payload_start + copy_len].copy_from_slice(&section[..copy_len]);
        for byte in packet.iter_mut().skip(payload_start + copy_len) {
            *byte = 0xff;
        }
        packet
    }

    /// Mux one H.264 access unit (Annex-B, start-code delimited) into TS
    /// packets, stamping PCR on the first packet when `pcr_90khz` is given.
    pub fn mux_video(&mut self, annex_b: &[u8], pts_90khz: u64, pcr_90khz: Option<u64>) -> Vec<u8> {
        let pes = build_pes(VIDEO_STREAM_ID, annex_b, pts_90khz);
        self.pes_to_ts(VIDEO_PID, &pes, pcr_90khz)
    }

    /// Mux one Opus access unit into TS packets.
    pub fn mux_audio(&mut self, payload: &[u8], pts_90khz: u64) -> Vec<u8> {
        let pes = build_pes(AUDIO_STREAM_ID, payload, pts_90khz);
        self.pes_to_ts(AUDIO_PID, &pes, None)
    }

    fn pes_to_ts(&mut self, pid: u16, pes: &[u8], mut pcr_90khz: Option<u64>) -> Vec<u8> {
        let mut out = Vec::with_capacity(pes.len() + pes.len() / 184 * 8 + TS_PACKET_SIZE);
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let mut packet = vec![0u8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            let pusi = if first { 0x40 } else { 0x00 };
            packet[1] = pusi | ((pid >> 8) as u8 & 0x1f);
            packet[2] = pid as u8;
            let cc = self.next_cc(pid);

            let remaining = pes.len() - offset;
            let header_len = if first && pcr_90khz.is_some() { 4 + 6 + 1 } else { 4 };
            let mut payload_budget = TS_PACKET_SIZE - header_len;
            if remaining <= payload_budget {
                payload_budget = remaining;
            }

            let needs_af = pcr_90khz.is_some() || remaining < TS_PACKET_SIZE - 4;
            if needs_af {
                let want_payload = remaining.min(TS_PACKET_SIZE - 4);
                let af_payload_overhead = if pcr_90khz.is_some() { 8 } else { 2 };
                let data_len = TS_PACKET_SIZE - 4 - af_payload_overhead;
                let this_payload = want_payload.min(data_len);
                let af_total_len = TS_PACKET_SIZE - 4 - this_payload - 1; // minus the length byte itself
                packet[3] = 0x30 | cc; // adaptation field + payload
                packet[4] = af_total_len as u8;
                let mut flags = 0x00u8;
                if let Some(pcr) = pcr_90khz.take() {
                    flags |= 0x10;
                    packet[5] = flags;
                    write_pcr(&mut packet[6..12], pcr);
                    let stuff_start = 12;
                    let stuff_end = 4 + 1 + af_total_len;
                    for byte in packet.iter_mut().take(stuff_end).skip(stuff_start) {
                        *byte = 0xff;
                    }
                } else {
                    packet[5] = flags;
                    let stuff_start = 6;
                    let stuff_end = 4 + 1 + af_total_len;
                    for byte in packet.iter_mut().take(stuff_end).skip(stuff_start) {
                        *byte = 0xff;
                    }
                }
                let payload_start = 4 + 1 + af_total_len;
                packet[payload_start..payload_start + this_payload]
                    .copy_from_slice(&pes[offset..offset + this_payload]);
                offset += this_payload;
            } else {
                packet[3] = 0x10 | cc; // payload only
                let payload_start = 4;
                packet[payload_start..payload_start + payload_budget]
                    .copy_from_slice(&pes[offset..offset + payload_budget]);
                offset += payload_budget;
            }

            out.extend(packet);
            first = false;
        }

        out
    }
}

fn build_pes(stream_id: u8, payload: &[u8], pts_90khz: u64) -> Vec<u8> {
    let mut pes = Vec::with_capacity(payload.len() + 19);
    pes.extend([0x00, 0x00, 0x01, stream_id]);
    let pes_len = payload.len() + 8; // +flags(2)+header_len(1)+pts(5)
    if pes_len <= 0xffff {
        pes.extend((pes_len as u16).to_be_bytes());
    } else {
        pes.extend([0x00, 0x00]); // unbounded, legal for video per MPEG-TS
    }
    pes.push(0x80); // '10' marker + no scrambling + priority 0 etc
    pes.push(0x80); // PTS_DTS_flags='10' (PTS only)
    pes.push(0x05); // PES_header_data_length
    pes.extend(encode_pts(0x21, pts_90khz));
    pes.extend_from_slice(payload);
    pes
}

fn encode_pts(prefix_nibble: u8, pts: u64) -> [u8; 5] {
    let pts = pts & 0x1_ffff_ffff;
    [
        (prefix_nibble << 4) | (((pts >> 30) as u8 & 0x07) << 1) | 0x01,
        (pts >> 22) as u8,
        (((pts >> 15) as u8 & 0xfe)) | 0x01,
        (pts >> 7) as u8,
        (((pts << 1) as u8) & 0xfe) | 0x01,
    ]
}

fn write_pcr(buf: &mut [u8], pcr_90khz: u64) {
    let base = pcr_90khz & 0x1_ffff_ffff;
    let ext: u16 = 0;
    buf[0] = (base >> 25) as u8;
    buf[1] = (base >> 17) as u8;
    buf[2] = (base >> 9) as u8;
    buf[3] = (base >> 1) as u8;
    buf[4] = (((base & 0x1) as u8) << 7) | 0x7e | ((ext >> 8) as u8 & 0x01);
    buf[5] = ext as u8;
}

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// One demuxed access unit: the elementary-stream bytes for one PID plus
/// (when present) its PTS in the 90kHz RTP/PES clock domain.
#[derive(Debug, Clone)]
pub struct DemuxedUnit {
    pub pid: u16,
    pub pts_90khz: Option<u64>,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct PesAccumulator {
    buffer: Vec<u8>,
    in_progress: bool,
}

/// Reassembles TS packets for the video/audio PIDs back into PES payloads.
/// PAT/PMT are consumed silently; any stream type other than H.264/Opus on
/// the canonical PIDs is ignored (this demuxer is paired 1:1 with
/// [`TsMuxer`]'s fixed PID assignment, not a general-purpose TS parser).
pub struct TsDemuxer {
    accumulators: HashMap<u16, PesAccumulator>,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            accumulators: HashMap::new(),
        }
    }

    /// Feed a contiguous byte stream; returns every access unit that
    /// completed within `data`. Callers should feed as bytes arrive off the
    /// child process's stdout; partial trailing TS packets are buffered
    /// internally by virtue of only consuming whole 188-byte chunks.
    pub fn push(&mut self, data: &[u8]) -> Vec<DemuxedUnit> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset + TS_PACKET_SIZE <= data.len() {
            let packet = &data[offset..offset + TS_PACKET_SIZE];
            offset += TS_PACKET_SIZE;
            if packet[0] != 0x47 {
                continue;
            }
            let pusi = packet[1] & 0x40 != 0;
            let pid = (((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16;
            if pid != VIDEO_PID && pid != AUDIO_PID {
                continue;
            }
            let adaptation_field_control = (packet[3] >> 4) & 0x03;
            let mut payload_start = 4;
            if adaptation_field_control == 0x02 {
                continue; // adaptation field only, no payload
            }
            if adaptation_field_control == 0x03 {
                let af_len = packet[4] as usize;
                payload_start = 5 + af_len;
            }
            if payload_start >= TS_PACKET_SIZE {
                continue;
            }
            let payload = &packet[payload_start..];

            if pusi {
                if let Some(finished) = self.flush(pid) {
                    out.push(finished);
                }
                let acc = self.accumulators.entry(pid).or_default();
                acc.buffer.clear();
                acc.buffer.extend_from_slice(payload);
                acc.in_progress = true;
            } else if let Some(acc) = self.accumulators.get_mut(&pid) {
                if acc.in_progress {
                    acc.buffer.extend_from_slice(payload);
                }
            }
        }
        out
    }

    /// Force-flush any in-progress PES on every tracked PID, for shutdown.
    pub fn finish(&mut self) -> Vec<DemuxedUnit> {
        let pids: Vec<u16> = self.accumulators.keys().copied().collect();
        pids.into_iter().filter_map(|pid| self.flush(pid)).collect()
    }

    fn flush(&mut self, pid: u16) -> Option<DemuxedUnit> {
        let acc = self.accumulators.get_mut(&pid)?;
        if !acc.in_progress || acc.buffer.len() < 9 {
            return None;
        }
        if acc.buffer[0..3] != [0x00, 0x00, 0x01] {
            return None;
        }
        let pts_dts_flags = (acc.buffer[7] >> 6) & 0x03;
        let header_len = acc.buffer[8] as usize;
        let payload_offset = 9 + header_len;
        if payload_offset > acc.buffer.len() {
            return None;
        }
        let pts_90khz = if pts_dts_flags != 0 && header_len >= 5 {
            Some(decode_pts(&acc.buffer[9..14]))
        } else {
            None
        };
        let payload = acc.buffer[payload_offset..].to_vec();
        acc.in_progress = false;
        Some(DemuxedUnit { pid, pts_90khz, payload })
    }
}

fn decode_pts(bytes: &[u8]) -> u64 {
    let b0 = bytes[0] as u64;
    let b1 = bytes[1] as u64;
    let b2 = bytes[2] as u64;
    let b3 = bytes[3] as u64;
    let b4 = bytes[4] as u64;
    (((b0 >> 1) & 0x07) << 30) | (b1 << 22) | (((b2 >> 1) & 0x7f) << 15) | (b3 << 7) | ((b4 >> 1) & 0x7f)
}

/// Scan Annex-B NAL units for the first SPS (type 7) and PPS (type 8),
/// used by the transcoding output to replace its tentative description with
/// the encoder's actual parameter sets on first successful demux.
pub fn extract_h264_params(annex_b: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut sps = None;
    let mut pps = None;
    for nal in iter_annex_b_nals(annex_b) {
        if nal.is_empty() {
            continue;
        }
        match nal[0] & 0x1f {
            7 => sps = Some(nal.to_vec()),
            8 => pps = Some(nal.to_vec()),
            _ => {}
        }
        if sps.is_some() && pps.is_some() {
            break;
        }
    }
    match (sps, pps) {
        (Some(sps), Some(pps)) => Some((sps, pps)),
        _ => None,
    }
}

fn iter_annex_b_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut code_starts = Vec::new();
    let mut content_starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            code_starts.push(i);
            content_starts.push(i + 3);
            i += 3;
        } else if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            code_starts.push(i);
            content_starts.push(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(content_starts.len());
    for (idx, &start) in content_starts.iter().enumerate() {
        let end = code_starts.get(idx + 1).copied().unwrap_or(data.len());
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_video_produces_whole_ts_packets() {
        let mut muxer = TsMuxer::new();
        let annex_b = vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f, 0xaa, 0xbb];
        let out = muxer.mux_video(&annex_b, 90_000, Some(90_000));
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        assert_eq!(out[0], 0x47);
    }

    #[test]
    fn psi_packets_are_188_bytes_each() {
        let mut muxer = TsMuxer::new();
        let psi = muxer.psi();
        assert_eq!(psi.len(), TS_PACKET_SIZE * 2);
        assert_eq!(psi[0], 0x47);
        assert_eq!(psi[TS_PACKET_SIZE], 0x47);
    }

    #[test]
    fn mux_then_demux_round_trips_video_payload() {
        let mut muxer = TsMuxer::new();
        let annex_b: Vec<u8> = (0..300u32).map(|v| (v % 251) as u8).collect();
        let ts = muxer.mux_video(&annex_b, 123_456, Some(123_456));

        let mut demuxer = TsDemuxer::new();
        let mut units = demuxer.push(&ts);
        units.extend(demuxer.finish());

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].pid, VIDEO_PID);
        assert_eq!(units[0].payload, annex_b);
        assert_eq!(units[0].pts_90khz, Some(123_456));
    }

    #[test]
    fn extracts_sps_and_pps_from_annex_b() {
        let mut stream = vec![0x00, 0x00, 0x00, 0x01, 0x67, 0xaa, 0xbb];
        stream.extend([0x00, 0x00, 0x00, 0x01, 0x68, 0xcc]);
        stream.extend([0x00, 0x00, 0x00, 0x01, 0x65, 0x11, 0x22]);
        let (sps, pps) = extract_h264_params(&stream).expect("sps/pps present");
        assert_eq!(sps, vec![0x67, 0xaa, 0xbb]);
        assert_eq!(pps, vec![0x68, 0xcc]);
    }
}
