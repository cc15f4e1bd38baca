//! The adaptive controller: owns the level table, the metrics/trigger
//! evaluation, the penalty box, and the single `RTCPeerConnection` the
//! browser currently reads from. Reopens a WHEP session on every level
//! switch; there is no server-side RID selection (see `whep`).

use std::cell::RefCell;
use std::rc::Rc;

use wasm_bindgen::{closure::Closure, JsCast, JsValue};
use wasm_bindgen_futures::{spawn_local, JsFuture};
use web_sys::{
    RtcConfiguration, RtcIceCandidate, RtcPeerConnection, RtcPeerConnectionIceEvent, RtcSdpType,
    RtcSessionDescriptionInit, RtcTrackEvent,
};

use crate::levels::LevelTable;
use crate::metrics::{Ema, MetricsSample, Trigger, TriggerEvaluator};
use crate::penalty::PenaltyBox;
use crate::state::ControllerState;
use crate::util::{now_ms, window, IntervalHandle};
use crate::whep::{WhepEndpoint, WhepSession};

const HONEYMOON_MS: f64 = 10_000.0;
const SWITCH_COOLDOWN_MS: f64 = 5_000.0;
const TICK_MS: i32 = 1_000;

/// Shared mutable controller state, handed to event closures via `Rc<RefCell<_>>`
/// since the DOM event loop is single-threaded — no locking needed beyond that.
struct Inner<E: WhepEndpoint + 'static> {
    endpoint: Rc<E>,
    levels: LevelTable,
    current_index: Option<usize>,
    state: ControllerState,
    ema: Ema,
    trigger_eval: TriggerEvaluator,
    penalty: PenaltyBox,
    session: Option<WhepSession>,
    pc: Option<RtcPeerConnection>,
    pending_candidates: Vec<String>,
    candidates_flushed: bool,
    honeymoon_until_ms: f64,
    cooldown_until_ms: f64,
    prev_stats: Option<StatsSnapshot>,
    // Closures must be kept alive for as long as the listener is attached.
    _on_ice_candidate: Option<Closure<dyn FnMut(RtcPeerConnectionIceEvent)>>,
    _on_track: Option<Closure<dyn FnMut(RtcTrackEvent)>>,
}

/// Cumulative counters read off the `inbound-rtp` stats entry on the last
/// tick, kept so the next tick can derive instantaneous deltas.
#[derive(Debug, Clone, Copy, Default)]
struct StatsSnapshot {
    timestamp_ms: f64,
    bytes_received: f64,
    packets_lost: f64,
    packets_received: f64,
    frames_decoded: f64,
}

/// Drives a single WHEP reader, switching levels in response to network
/// quality triggers. `E` is the WHEP endpoint implementation; production
/// code uses [`crate::whep::HttpWhepEndpoint`], tests fake it.
pub struct AdaptiveController<E: WhepEndpoint + 'static> {
    inner: Rc<RefCell<Inner<E>>>,
    _tick: Option<IntervalHandle>,
}

impl<E: WhepEndpoint + 'static> AdaptiveController<E> {
    pub fn new(endpoint: E, levels: LevelTable) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            endpoint: Rc::new(endpoint),
            levels,
            current_index: None,
            state: ControllerState::GettingCodecs,
            ema: Ema::default(),
            trigger_eval: TriggerEvaluator::default(),
            penalty: PenaltyBox::default(),
            session: None,
            pc: None,
            pending_candidates: Vec::new(),
            candidates_flushed: false,
            honeymoon_until_ms: 0.0,
            cooldown_until_ms: 0.0,
            prev_stats: None,
            _on_ice_candidate: None,
            _on_track: None,
        }));
        Self { inner, _tick: None }
    }

    /// Starts the controller at the top (unlimited) level.
    pub fn start(&mut self) {
        let top = self.inner.borrow().levels.top();
        if let Some(index) = top {
            self.switch_to(index);
        } else {
            self.inner.borrow_mut().state = ControllerState::Failed;
        }
        self.arm_tick();
    }

    fn arm_tick(&mut self) {
        let inner = self.inner.clone();
        let closure = Closure::<dyn FnMut()>::new(move || {
            Inner::on_tick(inner.clone());
        });
        let handle = window()
            .set_interval_with_callback_and_timeout_and_arguments_0(closure.as_ref().unchecked_ref(), TICK_MS)
            .expect("setInterval must succeed");
        closure.forget();
        self._tick = Some(IntervalHandle(handle));
    }

    /// Requests a switch to the level at `index`. Mirrors `loadLevel(i)`:
    /// `running -> switching`.
    pub fn switch_to(&mut self, index: usize) {
        Inner::begin_switch(self.inner.clone(), index, false);
    }

    pub fn state(&self) -> ControllerState {
        self.inner.borrow().state
    }

    pub fn current_level_id(&self) -> Option<String> {
        let inner = self.inner.borrow();
        inner.current_index.and_then(|i| inner.levels.get(i)).map(|e| e.level.id.clone())
    }

    /// Explicit close: tears down the peer connection and, if a session URL
    /// is known, DELETEs it. Legal from every state.
    pub fn close(&mut self) {
        self._tick = None;
        Inner::close(self.inner.clone());
    }
}

impl<E: WhepEndpoint + 'static> Inner<E> {
    fn begin_switch(inner: Rc<RefCell<Self>>, index: usize, is_fallback_retry: bool) {
        {
            let mut this = inner.borrow_mut();
            if this.state.is_terminal() {
                return;
            }
            let level_id = match this.levels.get(index) {
                Some(entry) => entry.level.id.clone(),
                None => return,
            };
            if !is_fallback_retry && this.penalty.is_banned(&level_id, now_ms()) {
                log::warn!("level {level_id} is in the penalty box, skipping switch");
                return;
            }
            this.state = ControllerState::Switching;
            this.candidates_flushed = false;
            this.pending_candidates.clear();
        }

        spawn_local(async move {
            if let Err(e) = Inner::open_session(inner.clone(), index).await {
                log::warn!("failed to open WHEP session for level {index}: {e}");
                Inner::handle_connect_failure(inner, index).await;
            }
        });
    }

    async fn handle_connect_failure(inner: Rc<RefCell<Self>>, index: usize) {
        let (level_id, fallback) = {
            let mut this = inner.borrow_mut();
            let level_id = this.levels.get(index).map(|e| e.level.id.clone()).unwrap_or_default();
            this.penalty.record_failure(&level_id, now_ms());
            let fallback = this.levels.get(index).and_then(|e| e.fallback_chain.first().cloned());
            (level_id, fallback)
        };

        if fallback.is_some() {
            // Same-level fallback codec retry stays on the same rung; the
            // level table index doesn't change, only the offered codec
            // would (negotiated by the peer connection's codec preference,
            // out of scope here).
            log::info!("retrying level {level_id} with fallback codec");
            Inner::begin_switch(inner, index, true);
            return;
        }

        let mut this = inner.borrow_mut();
        if let Some(lower) = this.current_index.and_then(|i| this.levels.next_lower(i)).or_else(|| this.levels.next_lower(index)) {
            drop(this);
            Inner::begin_switch(inner, lower, false);
        } else {
            this.state = ControllerState::Failed;
        }
    }

    async fn open_session(inner: Rc<RefCell<Self>>, index: usize) -> Result<(), String> {
        let config = RtcConfiguration::new();
        let pc = RtcPeerConnection::new_with_configuration(&config).map_err(|e| format!("{e:?}"))?;

        let ice_candidate_inner = inner.clone();
        let on_ice_candidate = Closure::<dyn FnMut(RtcPeerConnectionIceEvent)>::new(move |event: RtcPeerConnectionIceEvent| {
            if let Some(candidate) = event.candidate() {
                Inner::queue_or_send_candidate(ice_candidate_inner.clone(), candidate);
            }
        });
        pc.set_onicecandidate(Some(on_ice_candidate.as_ref().unchecked_ref()));

        let track_inner = inner.clone();
        let switching_index = index;
        let on_track = Closure::<dyn FnMut(RtcTrackEvent)>::new(move |_event: RtcTrackEvent| {
            Inner::on_new_track(track_inner.clone(), switching_index);
        });
        pc.set_ontrack(Some(on_track.as_ref().unchecked_ref()));

        pc.add_transceiver_with_str("video");
        pc.add_transceiver_with_str("audio");

        let offer_value = JsFuture::from(pc.create_offer()).await.map_err(|e| format!("{e:?}"))?;
        let offer = js_sys::Reflect::get(&offer_value, &JsValue::from_str("sdp"))
            .ok()
            .and_then(|v| v.as_string())
            .ok_or_else(|| "offer missing sdp".to_string())?;

        let max_bitrate_kbps = {
            let this = inner.borrow();
            this.levels.get(index).map(|e| e.level.max_bitrate_kbps).unwrap_or(0)
        };
        let rewritten = rewrite_offer_sdp(&offer, max_bitrate_kbps);

        let desc_init = RtcSessionDescriptionInit::new(RtcSdpType::Offer);
        desc_init.sdp(&rewritten);
        JsFuture::from(pc.set_local_description(&desc_init)).await.map_err(|e| format!("{e:?}"))?;

        let endpoint = inner.borrow().endpoint.clone();
        let session = endpoint.post_offer(&rewritten).await.map_err(|e| e.to_string())?;

        let answer_init = RtcSessionDescriptionInit::new(RtcSdpType::Answer);
        answer_init.sdp(&session.answer_sdp);
        JsFuture::from(pc.set_remote_description(&answer_init)).await.map_err(|e| format!("{e:?}"))?;

        {
            let mut this = inner.borrow_mut();
            this.pc = Some(pc);
            this.session = Some(session);
            this._on_ice_candidate = Some(on_ice_candidate);
            this._on_track = Some(on_track);
        }

        Inner::flush_pending_candidates(inner).await;
        Ok(())
    }

    fn queue_or_send_candidate(inner: Rc<RefCell<Self>>, candidate: RtcIceCandidate) {
        let fragment = candidate.candidate();
        let (flushed, session) = {
            let this = inner.borrow();
            (this.candidates_flushed, this.session.clone())
        };
        let session = match (flushed, session) {
            (true, Some(session)) => session,
            _ => {
                inner.borrow_mut().pending_candidates.push(fragment);
                return;
            }
        };
        let endpoint = inner.borrow().endpoint.clone();
        spawn_local(async move {
            if let Err(e) = endpoint.patch_ice(&session, &fragment).await {
                log::warn!("ICE candidate PATCH failed (non-fatal): {e}");
            }
        });
    }

    async fn flush_pending_candidates(inner: Rc<RefCell<Self>>) {
        let (session, candidates, endpoint) = {
            let mut this = inner.borrow_mut();
            this.candidates_flushed = true;
            let candidates = std::mem::take(&mut this.pending_candidates);
            (this.session.clone(), candidates, this.endpoint.clone())
        };
        let Some(session) = session else { return };
        if candidates.is_empty() {
            return;
        }
        let fragment = candidates.join("\r\n");
        if let Err(e) = endpoint.patch_ice(&session, &fragment).await {
            log::warn!("ICE candidate flush PATCH failed (non-fatal): {e}");
        }
    }

    /// `switching -> running` on the new reader's first `ontrack`; the
    /// previous session is closed only after this fires, so there is never
    /// a silent gap.
    fn on_new_track(inner: Rc<RefCell<Self>>, new_index: usize) {
        let mut this = inner.borrow_mut();
        if this.current_index == Some(new_index) && this.state == ControllerState::Running {
            return;
        }
        this.state = ControllerState::Running;
        this.current_index = Some(new_index);
        this.honeymoon_until_ms = now_ms() + HONEYMOON_MS;
        this.cooldown_until_ms = now_ms() + SWITCH_COOLDOWN_MS;
        let level_id = this.levels.get(new_index).map(|e| e.level.id.clone()).unwrap_or_default();
        this.penalty.clear(&level_id);
    }

    fn on_tick(inner: Rc<RefCell<Self>>) {
        let (state, honeymoon_active, cooldown_active, current_index) = {
            let this = inner.borrow();
            (this.state, now_ms() < this.honeymoon_until_ms, now_ms() < this.cooldown_until_ms, this.current_index)
        };
        if state != ControllerState::Running {
            return;
        }
        let Some(index) = current_index else { return };

        spawn_local(async move {
            let sample = Inner::poll_metrics_sample(inner.clone()).await;
            let expected_bitrate = {
                let this = inner.borrow();
                this.levels.get(index).map(|e| e.level.max_bitrate_kbps as f64).unwrap_or(0.0)
            };

            let trigger = {
                let mut this = inner.borrow_mut();
                this.ema.update(&sample);
                let ema = this.ema;
                this.trigger_eval.evaluate(&ema, &sample, expected_bitrate, honeymoon_active)
            };

            if cooldown_active || trigger == Trigger::None {
                return;
            }

            let levels = inner.borrow().levels.clone();
            match trigger {
                Trigger::Downgrade | Trigger::CriticalDowngrade => {
                    if let Some(lower) = levels.next_lower(index) {
                        Inner::begin_switch(inner, lower, false);
                    }
                }
                Trigger::Upgrade => {
                    if let Some(higher) = levels.next_higher(index) {
                        let banned = {
                            let this = inner.borrow();
                            let level_id = levels.get(higher).map(|e| e.level.id.clone()).unwrap_or_default();
                            this.penalty.is_banned(&level_id, now_ms())
                        };
                        if !banned {
                            Inner::begin_switch(inner, higher, false);
                        }
                    }
                }
                Trigger::None => {}
            }
        });
    }

    /// Reads `RTCPeerConnection.getStats()` and reduces it to one tick's
    /// sample. A missing/closed peer connection yields a zeroed sample so
    /// the EMA simply holds steady rather than panicking.
    async fn poll_metrics_sample(inner: Rc<RefCell<Self>>) -> MetricsSample {
        let pc = inner.borrow().pc.clone();
        let Some(pc) = pc else { return MetricsSample::default() };

        let audio_only = {
            let this = inner.borrow();
            this.current_index.and_then(|i| this.levels.get(i)).map(|e| e.level.audio_only).unwrap_or(false)
        };

        let stats_value = match JsFuture::from(pc.get_stats()).await {
            Ok(v) => v,
            Err(_) => return MetricsSample { audio_only, ..Default::default() },
        };
        let prev = inner.borrow().prev_stats;
        let (sample, updated) = reduce_stats_report(&stats_value, audio_only, prev);
        inner.borrow_mut().prev_stats = updated;
        sample
    }

    fn close(inner: Rc<RefCell<Self>>) {
        let (pc, session, endpoint) = {
            let mut this = inner.borrow_mut();
            this.state = ControllerState::Closed;
            this._on_ice_candidate = None;
            this._on_track = None;
            (this.pc.take(), this.session.take(), this.endpoint.clone())
        };
        if let Some(pc) = pc {
            pc.close();
        }
        if let Some(session) = session {
            spawn_local(async move {
                if let Err(e) = endpoint.delete_session(&session).await {
                    log::warn!("WHEP session DELETE failed during close: {e}");
                }
            });
        }
    }
}

/// Strips browser-inserted `a=rid:`/`a=simulcast:` lines from the video
/// section (this is a recv-only session) and inserts `b=AS:<maxBitrate>`
/// right after the video `m=` line. `max_bitrate_kbps == 0` (unlimited)
/// omits the `b=AS` line entirely.
fn rewrite_offer_sdp(sdp: &str, max_bitrate_kbps: u32) -> String {
    let mut out = Vec::new();
    let mut in_video_section = false;
    for line in sdp.lines() {
        if line.starts_with("m=video") {
            in_video_section = true;
            out.push(line.to_string());
            if max_bitrate_kbps > 0 {
                out.push(format!("b=AS:{max_bitrate_kbps}"));
            }
            continue;
        }
        if line.starts_with("m=") && !line.starts_with("m=video") {
            in_video_section = false;
        }
        if in_video_section && (line.starts_with("a=rid:") || line.starts_with("a=simulcast:")) {
            continue;
        }
        out.push(line.to_string());
    }
    out.join("\r\n")
}

fn reflect_f64(obj: &JsValue, key: &str) -> Option<f64> {
    js_sys::Reflect::get(obj, &JsValue::from_str(key)).ok()?.as_f64()
}

fn reflect_string(obj: &JsValue, key: &str) -> Option<String> {
    js_sys::Reflect::get(obj, &JsValue::from_str(key)).ok()?.as_string()
}

fn reflect_bool(obj: &JsValue, key: &str) -> bool {
    js_sys::Reflect::get(obj, &JsValue::from_str(key)).ok().map(|v| v.is_truthy()).unwrap_or(false)
}

/// Reduces an `RTCStatsReport` (a `Map`-like iterable of stats dictionaries)
/// into one tick's [`MetricsSample`]. Walks every entry via `Map::for_each`,
/// pulling RTT off the nominated `candidate-pair` and the cumulative
/// byte/packet/frame counters off the `inbound-rtp` entry for this level's
/// media kind, then diffs those counters against `prev` to get instantaneous
/// loss/bitrate/fps. Returns the sample plus the snapshot to keep for the
/// next tick's delta (`None` when no matching `inbound-rtp` entry was found,
/// leaving the caller's stored snapshot untouched).
fn reduce_stats_report(report: &JsValue, audio_only: bool, prev: Option<StatsSnapshot>) -> (MetricsSample, Option<StatsSnapshot>) {
    let map = js_sys::Map::from(report.clone());
    let mut rtt_inst_ms = 0.0;
    let mut snapshot = StatsSnapshot::default();
    let mut found_inbound = false;
    let want_kind = if audio_only { "audio" } else { "video" };

    map.for_each(&mut |value, _key| {
        let Some(kind) = reflect_string(&value, "type") else { return };
        match kind.as_str() {
            "candidate-pair" => {
                if reflect_bool(&value, "nominated") {
                    if let Some(rtt) = reflect_f64(&value, "currentRoundTripTime") {
                        rtt_inst_ms = rtt * 1000.0;
                    }
                }
            }
            "inbound-rtp" => {
                if reflect_string(&value, "kind").as_deref() == Some(want_kind) {
                    found_inbound = true;
                    snapshot.timestamp_ms = reflect_f64(&value, "timestamp").unwrap_or(0.0);
                    snapshot.bytes_received = reflect_f64(&value, "bytesReceived").unwrap_or(0.0);
                    snapshot.packets_lost = reflect_f64(&value, "packetsLost").unwrap_or(0.0);
                    snapshot.packets_received = reflect_f64(&value, "packetsReceived").unwrap_or(0.0);
                    snapshot.frames_decoded = reflect_f64(&value, "framesDecoded").unwrap_or(0.0);
                }
            }
            _ => {}
        }
    });

    if !found_inbound {
        return (MetricsSample { audio_only, rtt_inst_ms, fps_3s: if audio_only { 30.0 } else { 0.0 }, ..Default::default() }, prev);
    }

    let Some(prev) = prev.filter(|p| snapshot.timestamp_ms > p.timestamp_ms) else {
        return (MetricsSample { audio_only, rtt_inst_ms, fps_3s: if audio_only { 30.0 } else { 0.0 }, ..Default::default() }, Some(snapshot));
    };

    let dt_s = ((snapshot.timestamp_ms - prev.timestamp_ms) / 1000.0).max(0.001);
    let delta_bytes = (snapshot.bytes_received - prev.bytes_received).max(0.0);
    let delta_lost = (snapshot.packets_lost - prev.packets_lost).max(0.0);
    let delta_received = (snapshot.packets_received - prev.packets_received).max(0.0);
    let delta_frames = (snapshot.frames_decoded - prev.frames_decoded).max(0.0);

    let loss_inst = if delta_lost + delta_received > 0.0 { delta_lost / (delta_lost + delta_received) } else { 0.0 };
    let bitrate_inst_kbps = delta_bytes * 8.0 / 1000.0;
    let fps_3s = if audio_only { 30.0 } else { delta_frames / dt_s };

    (MetricsSample { rtt_inst_ms, loss_inst, bitrate_inst_kbps, fps_3s, audio_only }, Some(snapshot))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rewrite_offer_strips_rid_and_simulcast_and_inserts_bitrate_cap() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rid:h send\r\na=simulcast:send h\r\na=mid:0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rid:should-stay\r\n";
        let rewritten = rewrite_offer_sdp(sdp, 1200);
        assert!(rewritten.contains("b=AS:1200"));
        assert!(!rewritten.contains("a=rid:h send"));
        assert!(!rewritten.contains("a=simulcast:send h"));
        assert!(rewritten.contains("a=rid:should-stay"));
    }

    #[test]
    fn rewrite_offer_omits_bitrate_cap_when_unlimited() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n";
        let rewritten = rewrite_offer_sdp(sdp, 0);
        assert!(!rewritten.contains("b=AS:"));
    }
}
