//! Receive side of the USRP link.
//!
//! ```text
//!  socket ──▶ UsrpPacket::parse ──┬─ VOICE ─▶ resample ─▶ AudioSink, meter, keyup edges
//!                                 ├─ TEXT ──▶ REG / INFO / SET_INFO
//!                                 ├─ PING ──▶ missed end-of-transmission check
//!                                 └─ TLV ───▶ FILE_XFER
//! ```
//!
//! One task owns the engine, so per-stream state (keyup edge, loss
//! counters, file transfer) needs no locking. Anything shared goes through
//! [`SessionContext`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{ DateTime, Local };
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::audio::AudioSink;
use crate::commands::UsrpSender;
use crate::error::CodecError;
use crate::events::{ EventBus, LogEntry, UiEvent };
use crate::file_xfer::{ save_file, FileTransfer, FileXferOutcome };
use crate::lookup::LookupHandle;
use crate::resampler::{ pcm_from_le_bytes, Resampler };
use crate::session::{ SessionContext, Talkgroup };
use crate::stats::Stats;
use crate::usrp_protocol::{
    InfoMessage,
    PacketType,
    RegReply,
    SetInfo,
    TextMessage,
    TlvRecord,
    TlvTag,
    UsrpPacket,
    NETWORK_SAMPLE_RATE,
    VOICE_FRAME_BYTES,
};
use crate::vox::compute_rms;

/// Largest datagram we expect from a gateway.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Sequence gaps larger than this are treated as a restart, not loss.
const MAX_COUNTED_GAP: i32 = 500;

/// Tunables that come from configuration.
#[derive(Debug, Clone)]
pub struct RxOptions {
    /// Source IDs above this count as subscribers for private-call retune.
    pub private_call_min_id: u32,
    /// Verified file transfers are written here when set.
    pub download_dir: Option<PathBuf>,
    /// Emit a meter level every this many voice frames.
    pub meter_every: u32,
}

impl Default for RxOptions {
    fn default() -> Self {
        RxOptions {
            private_call_min_id: 10_000,
            download_dir: None,
            meter_every: 5,
        }
    }
}

/// Who is transmitting, as shown in the log.
#[derive(Debug, Clone, PartialEq)]
struct CallInfo {
    call: String,
    slot: String,
    talkgroup: String,
}

impl Default for CallInfo {
    fn default() -> Self {
        CallInfo { call: String::new(), slot: "0".into(), talkgroup: String::new() }
    }
}

/// Voice sequence bookkeeping for one transmission.
#[derive(Debug, Default)]
struct LossCounter {
    last_seq: Option<i32>,
    received: u64,
    lost: u64,
}

impl LossCounter {
    fn record(&mut self, seq: i32) {
        if let Some(last) = self.last_seq {
            let gap = seq.wrapping_sub(last.wrapping_add(1));
            if gap > 0 && gap <= MAX_COUNTED_GAP {
                self.lost += gap as u64;
            }
        }
        self.last_seq = Some(seq);
        self.received += 1;
    }

    fn percent(&self) -> f64 {
        let expected = self.received + self.lost;
        if expected == 0 { 0.0 } else { ((self.lost as f64) * 100.0) / (expected as f64) }
    }
}

/// `a` and `b` are consecutive on the gateway's 16-bit command counter.
fn is_next_seq(prev: i32, next: i32) -> bool {
    (prev.wrapping_add(1) & 0xffff) == (next & 0xffff)
}

pub struct RxEngine {
    ctx: Arc<SessionContext>,
    sender: Arc<UsrpSender>,
    events: EventBus,
    lookup: LookupHandle,
    sink: AudioSink,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    options: RxOptions,

    resampler: Resampler,
    last_keyup: bool,
    tx_started_at: DateTime<Local>,
    current: CallInfo,
    loss: LossCounter,
    last_ping_seq: Option<i32>,
    meter_countdown: u32,
    file_xfer: FileTransfer,
}

impl RxEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<SessionContext>,
        sender: Arc<UsrpSender>,
        events: EventBus,
        lookup: LookupHandle,
        sink: AudioSink,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
        options: RxOptions
    ) -> Self {
        let resampler = Resampler::new(NETWORK_SAMPLE_RATE, sink.sample_rate());
        RxEngine {
            ctx,
            sender,
            events,
            lookup,
            sink,
            stats,
            shutdown,
            options,
            resampler,
            last_keyup: false,
            tx_started_at: Local::now(),
            current: CallInfo::default(),
            loss: LossCounter::default(),
            last_ping_seq: None,
            meter_countdown: 0,
            file_xfer: FileTransfer::new(),
        }
    }

    /// Decode and act on one datagram. An `Err` means the datagram was
    /// dropped without touching any state.
    pub async fn handle_datagram(&mut self, buf: &[u8], now: DateTime<Local>) -> Result<(), CodecError> {
        let packet = UsrpPacket::parse(buf)?;

        match packet.header.packet_type {
            PacketType::Voice => self.handle_voice(&packet, now),
            PacketType::Text => self.handle_text(&packet.payload, now).await?,
            PacketType::Ping => self.handle_ping(packet.header.seq, now),
            PacketType::Tlv => self.handle_tlv(&packet.payload).await?,
            PacketType::Dtmf | PacketType::VoiceAdpcm | PacketType::VoiceUlaw => {
                debug!(kind = %packet.header.packet_type, "ignoring packet");
            }
        }
        self.ctx.set_last_sequence(packet.header.seq);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    //  VOICE
    // ═══════════════════════════════════════════════════════════════════

    fn handle_voice(&mut self, packet: &UsrpPacket, now: DateTime<Local>) {
        let keyup = packet.header.keyup;

        if packet.payload.len() == VOICE_FRAME_BYTES {
            let samples = pcm_from_le_bytes(&packet.payload);
            self.update_meter(&samples);
            self.sink.write(self.resampler.process(&samples));
            self.stats.record_voice_frame();
        }

        if keyup != self.last_keyup {
            if keyup {
                self.tx_started_at = now;
                self.loss = LossCounter::default();
                self.resampler.reset();
                debug!(seq = packet.header.seq, "keyup");
            } else {
                self.end_transmission(now);
            }
        }
        if keyup {
            self.loss.record(packet.header.seq);
        }
        self.last_keyup = keyup;
        self.ctx.set_last_keyup(keyup);
    }

    fn update_meter(&mut self, samples: &[i16]) {
        if self.meter_countdown == 0 {
            self.meter_countdown = self.options.meter_every.max(1);
            self.events.emit(UiEvent::AudioLevel(compute_rms(samples) as u32));
        }
        self.meter_countdown -= 1;
    }

    /// Close out the current network transmission: log row, re-open the
    /// transmit gate, reset the meter.
    fn end_transmission(&mut self, now: DateTime<Local>) {
        let duration_secs = ((now - self.tx_started_at).num_milliseconds() as f64) / 1000.0;
        let entry = LogEntry {
            started_at: self.tx_started_at,
            call: self.current.call.clone(),
            slot: self.current.slot.clone(),
            talkgroup: self.current.talkgroup.clone(),
            loss_percent: self.loss.percent(),
            duration_secs,
        };
        info!(
            call = %entry.call,
            slot = %entry.slot,
            tg = %entry.talkgroup,
            loss = %entry.loss(),
            duration = %entry.duration(),
            "📴 end of transmission"
        );
        self.stats.record_transmission();
        self.events.emit(UiEvent::EndOfTransmission(entry));
        self.events.emit(UiEvent::CurrentTransmission(None));
        self.events.emit(UiEvent::AudioLevel(0));
        self.ctx.set_transmit_enabled(true);
        self.last_keyup = false;
        self.ctx.set_last_keyup(false);
    }

    // ═══════════════════════════════════════════════════════════════════
    //  PING
    // ═══════════════════════════════════════════════════════════════════

    /// Two back-to-back PINGs while a transmission is open means the
    /// unkey frame was lost.
    fn handle_ping(&mut self, seq: i32, now: DateTime<Local>) {
        if !self.ctx.transmit_enabled() {
            if let Some(prev) = self.last_ping_seq {
                if is_next_seq(prev, seq) {
                    warn!(prev, seq, "⚠️  missed EOT");
                    self.end_transmission(now);
                }
            }
        }
        self.last_ping_seq = Some(seq);
    }

    // ═══════════════════════════════════════════════════════════════════
    //  TEXT
    // ═══════════════════════════════════════════════════════════════════

    async fn handle_text(&mut self, payload: &[u8], now: DateTime<Local>) -> Result<(), CodecError> {
        match TextMessage::parse(payload)? {
            TextMessage::Register(reply) => self.handle_reg(reply).await,
            TextMessage::Info(info) => self.handle_info(info).await,
            TextMessage::SetInfo(info) => self.handle_set_info(info, now).await,
        }
        Ok(())
    }

    async fn handle_reg(&mut self, reply: RegReply) {
        match reply {
            RegReply::Ok => {
                info!("✅ registered with gateway");
                self.ctx.set_registered(true);
                self.events.status("Registered");
                self.sender.request_info().await;
                self.events.transmit_control(&self.ctx, self.ctx.has_input());
            }
            RegReply::Unreg => {
                info!("gateway unregistered us");
                self.ctx.set_registered(false);
                self.events.status("Disconnected");
                self.events.transmit_control(&self.ctx, false);
            }
            RegReply::Exiting { rereg_after_secs } => {
                warn!(rereg_after_secs, "gateway exiting");
                self.ctx.set_registered(false);
                self.events.status("Disconnected");
                self.events.transmit_control(&self.ctx, false);
                if rereg_after_secs > 0 {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_secs(rereg_after_secs)) => {
                            self.sender.register().await;
                        }
                    }
                }
            }
            RegReply::Other(text) => info!(reply = %text, "REG reply"),
        }
    }

    async fn handle_info(&mut self, info: InfoMessage) {
        match info {
            InfoMessage::Msg(text) => {
                info!(msg = %text, "💬 gateway message");
                self.events.emit(UiEvent::Toast { title: "Text Message".into(), text });
            }
            InfoMessage::Macro(entries) => {
                debug!(count = entries.len(), "macro list");
                self.ctx.set_macros(entries.clone());
                self.events.emit(UiEvent::MacroMenu(entries));
            }
            InfoMessage::Menu(entries) => {
                debug!(count = entries.len(), "menu list");
                self.ctx.set_macros(entries);
            }
            InfoMessage::Status(status) => {
                let mode = status.normalized_mode();
                info!(mode = %mode, last_tune = %status.last_tune, "ℹ️  gateway status");
                // Adopt the gateway's mode without sending it back.
                if mode != self.ctx.mode() {
                    self.ctx.set_mode(&mode);
                    self.events.emit(UiEvent::ModeChanged(mode));
                }
                if self.ctx.select_talkgroup(&status.last_tune) {
                    self.events.emit(UiEvent::TalkgroupSelected(status.last_tune.clone()));
                }
                self.events.status(format!("Connected to {}", status.last_tune));
            }
        }
    }

    async fn handle_set_info(&mut self, info: SetInfo, now: DateTime<Local>) {
        if !self.ctx.transmit_enabled() {
            // New call metadata while the previous call never unkeyed.
            self.end_transmission(now);
        }

        let destination = info.destination_id.to_string();
        let talkgroup = self.ctx.resolve_talkgroup_name(&destination).unwrap_or_else(|| destination.clone());
        let call = info.call.call().to_string();

        info!(
            call = %call,
            name = info.call.name().unwrap_or(""),
            src = info.source_id,
            tg = %talkgroup,
            slot = info.slot,
            private = info.is_private(),
            "📻 incoming call"
        );
        self.events.emit(UiEvent::CurrentTransmission(Some(format!("{call} -> {talkgroup}"))));
        self.current = CallInfo {
            call: call.clone(),
            slot: info.slot.to_string(),
            talkgroup,
        };
        self.ctx.set_transmit_enabled(false);

        if !call.chars().all(|c| c.is_ascii_digit()) {
            self.lookup.request(&call);
        }

        if info.is_private() && info.source_id > self.options.private_call_min_id {
            let token = format!("{}#", info.source_id);
            if self.ctx.current_talkgroup().as_deref() != Some(token.as_str()) {
                info!(token = %token, "🔀 private call, retuning");
                self.sender.set_tx_talkgroup(&token).await;
                let mode = self.ctx.mode();
                let name = format!("{call} Private");
                if self.ctx.add_talkgroup(&mode, Talkgroup::new(name.clone(), token.clone())) {
                    self.events.emit(UiEvent::TalkgroupAdded { mode, name, value: token.clone() });
                }
                if self.ctx.select_talkgroup(&token) {
                    self.events.emit(UiEvent::TalkgroupSelected(token));
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  TLV
    // ═══════════════════════════════════════════════════════════════════

    async fn handle_tlv(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        let record = TlvRecord::parse(payload)?;
        match record.tag {
            TlvTag::FileXfer => {
                let outcome = self.file_xfer.handle(record.value)?;
                self.on_file_outcome(outcome).await;
            }
            | TlvTag::BeginTx
            | TlvTag::Ambe
            | TlvTag::EndTx
            | TlvTag::TgTune
            | TlvTag::PlayAmbe
            | TlvTag::RemoteCmd
            | TlvTag::Ambe49
            | TlvTag::Ambe72
            | TlvTag::SetInfo
            | TlvTag::Imbe
            | TlvTag::DsAmbe => {
                debug!(tag = record.tag.as_u8(), len = record.value.len(), "ignoring TLV");
            }
        }
        Ok(())
    }

    async fn on_file_outcome(&mut self, outcome: FileXferOutcome) {
        match outcome {
            FileXferOutcome::Verified { name, content } => {
                if let Some(dir) = &self.options.download_dir {
                    match save_file(dir, &name, &content).await {
                        Ok(path) => info!(path = %path.display(), "💾 file saved"),
                        Err(e) => warn!(file = %name, error = %e, "file save failed"),
                    }
                }
                self.events.emit(UiEvent::Toast {
                    title: "File received".into(),
                    text: format!("{name} ({} bytes)", content.len()),
                });
            }
            FileXferOutcome::Ignored(reason) => debug!(reason, "file transfer record ignored"),
            FileXferOutcome::Started { .. } |
            FileXferOutcome::Chunk { .. } |
            FileXferOutcome::Mismatch { .. } |
            FileXferOutcome::Aborted => {}
        }
    }
}

/// Receive loop: one datagram at a time until shutdown.
pub async fn rx_loop(mut engine: RxEngine, socket: Arc<UdpSocket>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let stats = engine.stats.clone();

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "❌ UDP recv error");
                    continue;
                }
            },
        };
        stats.record_recv(len);

        if let Err(e) = engine.handle_datagram(&buf[..len], Local::now()).await {
            stats.record_parse_error();
            debug!(src = %src, len, error = %e, "dropped datagram");
        }
    }
    if engine.file_xfer.in_progress() {
        warn!("file transfer still in flight at shutdown, discarded");
    }
    debug!("RX loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{ loopback_sender, recv_packet, remote_cmd };
    use crate::file_xfer::tests::{ name_record, payload_record, write_record };
    use crate::session::TalkgroupBook;
    use crate::usrp_protocol::{ build_command, build_tlv, build_voice, TlvTag, UsrpHeader };
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    struct Harness {
        engine: RxEngine,
        ctx: Arc<SessionContext>,
        events: mpsc::Receiver<UiEvent>,
        gateway: UdpSocket,
        shutdown: CancellationToken,
    }

    async fn harness() -> Harness {
        let mut book = TalkgroupBook::new();
        book.add("DMR", Talkgroup::new("Disconnect", "4000"));
        book.add("DMR", Talkgroup::new("Local", "\"3100\""));
        let ctx = Arc::new(SessionContext::new("DMR", 2, book, true));
        let (sender, mut gws) = loopback_sender(1).await;
        let stats = Stats::new();
        let (bus, events) = EventBus::new(256, stats.clone());
        let shutdown = CancellationToken::new();
        let engine = RxEngine::new(
            ctx.clone(),
            sender,
            bus,
            LookupHandle::disabled(),
            AudioSink::null(48_000),
            stats,
            shutdown.clone(),
            RxOptions::default()
        );
        Harness { engine, ctx, events, gateway: gws.remove(0), shutdown }
    }

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn eots(events: &[UiEvent]) -> Vec<LogEntry> {
        events
            .iter()
            .filter_map(|e| match e {
                UiEvent::EndOfTransmission(entry) => Some(entry.clone()),
                _ => None,
            })
            .collect()
    }

    fn text(seq: i32, body: &[u8]) -> Vec<u8> {
        build_command(seq, PacketType::Text, body)
    }

    fn set_info(src: u32, dst: u32, slot: u8, cc: u8, call: &str) -> Vec<u8> {
        let mut p = vec![0u8; 14];
        p[0] = TlvTag::SetInfo.as_u8();
        p[2..5].copy_from_slice(&src.to_be_bytes()[1..]);
        p[9..12].copy_from_slice(&dst.to_be_bytes()[1..]);
        p[12] = slot;
        p[13] = cc;
        p.extend_from_slice(call.as_bytes());
        p.push(0);
        p[1] = (p.len() - 2) as u8;
        text(0, &p)
    }

    fn voice(seq: i32, keyup: bool) -> Vec<u8> {
        build_voice(seq, keyup, &[0u8; VOICE_FRAME_BYTES])
    }

    fn ping(seq: i32) -> Vec<u8> {
        UsrpPacket { header: UsrpHeader::new(seq, false, PacketType::Ping, 0), payload: b"PING".to_vec() }.encode()
    }

    #[tokio::test]
    async fn test_keyup_edges_emit_one_end_of_transmission() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 3100, 2, 0, "N4IRR"), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(10, true), at(1)).await.unwrap();
        h.engine.handle_datagram(&voice(11, true), at(2)).await.unwrap();
        h.engine.handle_datagram(&voice(12, false), at(4)).await.unwrap();
        h.engine.handle_datagram(&voice(13, false), at(5)).await.unwrap();

        let events = drain(&mut h.events);
        let rows = eots(&events);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.call, "N4IRR");
        assert_eq!(row.talkgroup, "Local");
        assert_eq!(row.slot, "2");
        assert_eq!(row.started_at, at(1));
        assert!((row.duration_secs - 3.0).abs() < 1e-9);
        assert_eq!(row.loss_percent, 0.0);
        assert!(events.contains(&UiEvent::CurrentTransmission(Some("N4IRR -> Local".into()))));
        assert!(events.contains(&UiEvent::AudioLevel(0)));
        assert!(h.ctx.transmit_enabled());
        assert!(!h.ctx.snapshot().last_keyup);
    }

    #[tokio::test]
    async fn test_sequence_gap_counts_as_loss() {
        let mut h = harness().await;
        h.engine.handle_datagram(&voice(1, true), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(2, true), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(5, true), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(6, false), at(1)).await.unwrap();
        let rows = eots(&drain(&mut h.events));
        // 3 received, 2 missing
        assert!((rows[0].loss_percent - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_raw_destination_when_not_in_book() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 91, 1, 0, "W1AW"), at(0)).await.unwrap();
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::CurrentTransmission(Some("W1AW -> 91".into()))));
        assert!(!h.ctx.transmit_enabled());
    }

    #[tokio::test]
    async fn test_missed_eot_on_consecutive_pings() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 3100, 2, 0, "N4IRR"), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(20, true), at(1)).await.unwrap();
        h.engine.handle_datagram(&ping(100), at(2)).await.unwrap();
        assert!(eots(&drain(&mut h.events)).is_empty());

        h.engine.handle_datagram(&ping(101), at(3)).await.unwrap();
        h.engine.handle_datagram(&ping(102), at(4)).await.unwrap();
        let rows = eots(&drain(&mut h.events));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call, "N4IRR");
        assert!(h.ctx.transmit_enabled());

        // the late unkey frame must not produce a second row
        h.engine.handle_datagram(&voice(21, false), at(5)).await.unwrap();
        assert!(eots(&drain(&mut h.events)).is_empty());
    }

    #[tokio::test]
    async fn test_ping_sequence_compared_modulo_16_bits() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 3100, 2, 0, "N4IRR"), at(0)).await.unwrap();
        h.engine.handle_datagram(&ping(0xffff), at(1)).await.unwrap();
        h.engine.handle_datagram(&ping(0), at(2)).await.unwrap();
        assert_eq!(eots(&drain(&mut h.events)).len(), 1);
    }

    #[tokio::test]
    async fn test_set_info_mid_transmission_closes_previous() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 3100, 2, 0, "N4IRR"), at(0)).await.unwrap();
        h.engine.handle_datagram(&voice(1, true), at(0)).await.unwrap();
        h.engine.handle_datagram(&set_info(3_110_001, 4000, 2, 0, "W1AW"), at(3)).await.unwrap();
        let events = drain(&mut h.events);
        let rows = eots(&events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call, "N4IRR");
        assert!(events.contains(&UiEvent::CurrentTransmission(Some("W1AW -> Disconnect".into()))));
        assert!(!h.ctx.transmit_enabled());
    }

    #[tokio::test]
    async fn test_private_call_retunes_once() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(3_112_345, 3_113_043, 2, 0x80, "W1AW"), at(0)).await.unwrap();

        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "txTg=3112345#");
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("3112345#"));
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::TalkgroupAdded {
            mode: "DMR".into(),
            name: "W1AW Private".into(),
            value: "3112345#".into(),
        }));
        assert!(events.contains(&UiEvent::TalkgroupSelected("3112345#".into())));

        // same caller again: already tuned, nothing sent
        h.engine.handle_datagram(&voice(1, true), at(1)).await.unwrap();
        h.engine.handle_datagram(&voice(2, false), at(2)).await.unwrap();
        h.engine.handle_datagram(&set_info(3_112_345, 3_113_043, 2, 0x80, "W1AW"), at(3)).await.unwrap();
        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(100), h.gateway.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_private_call_from_low_id_is_ignored() {
        let mut h = harness().await;
        h.engine.handle_datagram(&set_info(9_999, 3_113_043, 2, 0x80, "BRIDGE"), at(0)).await.unwrap();
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("4000"));
    }

    #[tokio::test]
    async fn test_noise_is_dropped_without_state_change() {
        let mut h = harness().await;
        let before = h.ctx.snapshot();
        assert!(h.engine.handle_datagram(b"hello world", at(0)).await.is_err());
        assert!(h.engine.handle_datagram(&[0u8; 40], at(0)).await.is_err());
        assert!(h.engine.handle_datagram(&text(1, b"WHAT:IS THIS\0"), at(0)).await.is_err());
        assert_eq!(h.ctx.snapshot(), before);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_reg_ok_requests_info_and_enables_tx() {
        let mut h = harness().await;
        h.engine.handle_datagram(&text(1, b"REG:OK\0"), at(0)).await.unwrap();
        assert!(h.ctx.registered());
        let pkt = recv_packet(&h.gateway).await;
        assert_eq!(pkt.payload, b"INFO:");
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::ConnectionStatus("Registered".into())));
        assert!(events.contains(&UiEvent::TransmitControl { enabled: true }));
        assert!(h.ctx.tx_control());

        h.engine.handle_datagram(&text(2, b"REG:UNREG\0"), at(0)).await.unwrap();
        assert!(!h.ctx.registered());
        assert!(!h.ctx.tx_control());
        assert!(drain(&mut h.events).contains(&UiEvent::TransmitControl { enabled: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exiting_reregisters_after_delay() {
        let mut h = harness().await;
        h.ctx.set_registered(true);
        h.engine.handle_datagram(&text(1, b"REG:EXITING 30\0"), at(0)).await.unwrap();
        assert!(!h.ctx.registered());
        let pkt = recv_packet(&h.gateway).await;
        assert_eq!(pkt.payload, b"REG:DVSWITCH");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exiting_wait_cut_short_by_shutdown() {
        let mut h = harness().await;
        h.shutdown.cancel();
        h.engine.handle_datagram(&text(1, b"REG:EXITING 30\0"), at(0)).await.unwrap();
        let mut buf = [0u8; 64];
        assert!(h.gateway.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_info_status_adopts_mode_without_echo() {
        let mut h = harness().await;
        let json = br#"INFO:{"last_tune":"3100","tlv":{"ambe_mode":"DMR"}}"#;
        h.engine.handle_datagram(&text(1, json), at(0)).await.unwrap();
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("3100"));
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::ConnectionStatus("Connected to 3100".into())));
        assert!(!events.iter().any(|e| matches!(e, UiEvent::ModeChanged(_))));

        let json = br#"INFO:{"last_tune":"register.ysfreflector.de:42000","tlv":{"ambe_mode":"YSFW"}}"#;
        h.engine.handle_datagram(&text(2, json), at(0)).await.unwrap();
        assert_eq!(h.ctx.mode(), "YSF");
        assert!(drain(&mut h.events).contains(&UiEvent::ModeChanged("YSF".into())));

        let mut buf = [0u8; 64];
        assert!(h.gateway.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_info_msg_and_macro() {
        let mut h = harness().await;
        h.engine.handle_datagram(&text(1, b"INFO:MSG:net tonight\0"), at(0)).await.unwrap();
        h.engine.handle_datagram(&text(2, b"INFO:MACRO:*DMR,DMR|*YSF,YSF\0"), at(0)).await.unwrap();
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::Toast { title: "Text Message".into(), text: "net tonight".into() }));
        assert!(events.iter().any(|e| matches!(e, UiEvent::MacroMenu(m) if m.len() == 2)));
        assert_eq!(h.ctx.macros().len(), 2);
    }

    fn file_packet(record: &[u8]) -> Vec<u8> {
        build_command(0, PacketType::Tlv, &build_tlv(TlvTag::FileXfer, record).unwrap())
    }

    #[tokio::test]
    async fn test_file_transfer_match_and_mismatch() {
        let mut h = harness().await;
        let body = b"macro file contents";
        let digest = format!("{:x}", md5::compute(body));

        h.engine.handle_datagram(&file_packet(&name_record("m.txt", body.len() as u32)), at(0)).await.unwrap();
        h.engine.handle_datagram(&file_packet(&payload_record(body)), at(0)).await.unwrap();
        h.engine.handle_datagram(&file_packet(&write_record(&digest)), at(0)).await.unwrap();
        assert!(
            drain(&mut h.events)
                .iter()
                .any(|e| matches!(e, UiEvent::Toast { title, .. } if title == "File received"))
        );

        h.engine.handle_datagram(&file_packet(&name_record("m.txt", 3)), at(0)).await.unwrap();
        h.engine.handle_datagram(&file_packet(&payload_record(b"abc")), at(0)).await.unwrap();
        h.engine.handle_datagram(&file_packet(&write_record(&digest)), at(0)).await.unwrap();
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_other_tlv_tags_ignored() {
        let mut h = harness().await;
        let pkt = build_command(0, PacketType::Tlv, &build_tlv(TlvTag::Ambe, &[0u8; 9]).unwrap());
        h.engine.handle_datagram(&pkt, at(0)).await.unwrap();
        let bad = build_command(0, PacketType::Tlv, &[42, 0]);
        assert_eq!(h.engine.handle_datagram(&bad, at(0)).await, Err(CodecError::UnknownTlvTag(42)));
    }

    #[test]
    fn test_is_next_seq() {
        assert!(is_next_seq(5, 6));
        assert!(is_next_seq(0xffff, 0));
        assert!(!is_next_seq(5, 7));
        assert!(!is_next_seq(6, 5));
    }
}
