use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::commands::UsrpSender;
use crate::events::{ EventBus, UiCommand, UiEvent };
use crate::lookup::LookupHandle;
use crate::session::{ SessionContext, Talkgroup };
use crate::tx_engine::set_local_ptt;

/// Registration as seen from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "UNREGISTERED"),
            RegistrationState::Registered => write!(f, "REGISTERED"),
        }
    }
}

/// Who this station is, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub call: String,
    pub subscriber_id: u32,
    pub repeater_id: u32,
}

/// Applies UI commands to the session and the gateway.
pub struct Controller {
    ctx: Arc<SessionContext>,
    sender: Arc<UsrpSender>,
    events: EventBus,
    lookup: LookupHandle,
    station: Station,
    asl_mode: bool,
}

impl Controller {
    pub fn new(
        ctx: Arc<SessionContext>,
        sender: Arc<UsrpSender>,
        events: EventBus,
        lookup: LookupHandle,
        station: Station,
        asl_mode: bool
    ) -> Self {
        Controller { ctx, sender, events, lookup, station, asl_mode }
    }

    pub fn registration(&self) -> RegistrationState {
        if self.ctx.registered() { RegistrationState::Registered } else { RegistrationState::Unregistered }
    }

    /// Register with the gateway, or in ASL mode behave as if it said OK.
    pub async fn start(&self) {
        if self.asl_mode {
            info!("ASL mode: skipping gateway registration");
            self.ctx.set_registered(true);
            self.events.status("Registered");
            self.events.transmit_control(&self.ctx, self.ctx.has_input());
            return;
        }
        self.sender.register().await;
    }

    /// Returns false once shutdown was requested.
    pub async fn handle(&self, cmd: UiCommand) -> bool {
        debug!(?cmd, "UI command");
        match cmd {
            UiCommand::Connect => self.connect().await,
            UiCommand::Disconnect => self.disconnect().await,
            UiCommand::SelectTalkgroup(value) => {
                if !self.ctx.select_talkgroup(&value) {
                    debug!(tg = %value, "talkgroup not in list, using it as typed");
                    self.ctx.select_talkgroups(std::slice::from_ref(&value));
                }
                self.events.emit(UiEvent::TalkgroupSelected(value));
            }
            UiCommand::SelectTalkgroups(values) => self.ctx.select_talkgroups(&values),
            UiCommand::SetSlot(slot) => self.ctx.set_slot(slot),
            UiCommand::SelectMode(mode) => self.select_mode(&mode).await,
            UiCommand::TogglePtt => self.toggle_ptt(),
            UiCommand::AddTalkgroup { name, value } => {
                let mode = self.ctx.mode();
                let tg = Talkgroup::new(name, value);
                if self.ctx.add_talkgroup(&mode, tg.clone()) {
                    self.events.emit(UiEvent::TalkgroupAdded { mode, name: tg.name, value: tg.value.clone() });
                }
                if self.ctx.select_talkgroup(&tg.value) {
                    self.events.emit(UiEvent::TalkgroupSelected(tg.value));
                }
            }
            UiCommand::Dtmf(digits) => self.sender.send_dtmf(&digits).await,
            UiCommand::RemoteCommand(cmd) => self.sender.send_remote_command(&cmd).await,
            UiCommand::RequestInfo => self.sender.request_info().await,
            UiCommand::SendSettings => self.send_settings().await,
            UiCommand::SetAmbeSize(bits) => self.sender.set_ambe_size(bits).await,
            UiCommand::Shutdown => {
                return false;
            }
        }
        true
    }

    /// Tune the selected talkgroup(s) on the current slot.
    pub async fn connect(&self) {
        if !self.ctx.registered() {
            self.start().await;
        }
        let selected = self.ctx.selected_talkgroups();
        if selected.is_empty() {
            warn!("connect with no talkgroup selected");
            return;
        }
        self.sender.set_slot(self.ctx.slot()).await;
        self.tune(&selected).await;
    }

    /// Tune the first talkgroup of the current mode (its "disconnect" entry).
    pub async fn disconnect(&self) {
        let Some(first) = self.ctx.first_talkgroup() else {
            warn!("disconnect with an empty talkgroup list");
            return;
        };
        self.ctx.select_talkgroup(&first.value);
        self.events.emit(UiEvent::TalkgroupSelected(first.value.clone()));
        self.tune(std::slice::from_ref(&first.value)).await;
        self.events.status("Disconnected");
    }

    async fn tune(&self, tgs: &[String]) {
        if let [tg] = tgs {
            info!(tg = %tg, "📡 tune");
            self.sender.set_talkgroups(tgs).await;
            self.sender.send_dtmf(tg).await;
            self.events.status(format!("Connected to {}", self.ctx.current_talkgroup_name()));
            if self.ctx.registered() {
                self.events.transmit_control(&self.ctx, self.ctx.has_input());
            }
        } else {
            info!(tgs = %tgs.join(","), "📡 scan");
            self.sender.set_talkgroups(tgs).await;
            self.sender.set_tx_talkgroup("0").await;
            self.events.status(format!("Scanning {}", tgs.join(",")));
            // no single talkgroup to transmit on
            self.events.transmit_control(&self.ctx, false);
        }
        self.ctx.set_transmit_enabled(true);
    }

    /// User-initiated mode change: tell the gateway, then ask what it tuned.
    pub async fn select_mode(&self, mode: &str) {
        let mode = mode.trim().to_ascii_uppercase();
        info!(mode = %mode, "mode change");
        self.ctx.set_mode(&mode);
        self.sender.set_mode(&mode).await;
        self.ctx.set_transmit_enabled(true);
        self.events.emit(UiEvent::ModeChanged(mode));
        self.events.emit(UiEvent::CurrentTransmission(None));
        self.sender.request_info().await;
    }

    /// Station identity and current mode, as gateway settings.
    pub async fn send_settings(&self) {
        let mode = self.ctx.mode();
        info!(id = self.station.subscriber_id, peer = self.station.repeater_id, mode = %mode, "⚙️  sending settings");
        self.sender.set_dmr_id(self.station.subscriber_id).await;
        self.sender.set_peer_id(self.station.repeater_id).await;
        self.sender.set_dmr_call(&self.station.call).await;
        self.sender.set_ambe_mode(&mode).await;
    }

    fn toggle_ptt(&self) {
        let on = !self.ctx.ptt();
        if on && !self.ctx.transmit_enabled() {
            info!("PTT refused: network transmission in progress");
            return;
        }
        if on && !self.ctx.has_input() {
            info!("PTT refused: no input device");
            return;
        }
        if on && !self.ctx.tx_control() {
            info!(registered = self.ctx.registered(), "PTT refused: transmit control closed");
            return;
        }
        set_local_ptt(&self.ctx, &self.events, &self.lookup, &self.station.call, on, Local::now());
    }

    /// Drop PTT and, if registered, say goodbye to the gateway.
    pub async fn shutdown(&self) {
        if self.ctx.ptt() {
            set_local_ptt(&self.ctx, &self.events, &self.lookup, &self.station.call, false, Local::now());
        }
        if self.ctx.registered() {
            // let the TX task flush its unkey frame first
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.sender.unregister().await;
            self.ctx.set_registered(false);
        }
    }
}

/// Drain UI commands until shutdown, then unregister.
pub async fn controller_loop(
    controller: Controller,
    mut commands: mpsc::Receiver<UiCommand>,
    shutdown: CancellationToken
) {
    controller.start().await;
    loop {
        let cmd = tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(c) => c,
                None => break,
            },
        };
        if !controller.handle(cmd).await {
            info!("shutdown requested");
            break;
        }
    }
    shutdown.cancel();
    controller.shutdown().await;
    debug!(state = %controller.registration(), "controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{ loopback_sender, recv_packet, remote_cmd };
    use crate::session::TalkgroupBook;
    use crate::stats::Stats;
    use crate::usrp_protocol::PacketType;
    use tokio::net::UdpSocket;

    struct Harness {
        controller: Controller,
        ctx: Arc<SessionContext>,
        events: mpsc::Receiver<UiEvent>,
        gateway: UdpSocket,
    }

    async fn harness(asl_mode: bool, has_input: bool) -> Harness {
        let mut book = TalkgroupBook::new();
        book.add("DMR", Talkgroup::new("Disconnect", "4000"));
        book.add("DMR", Talkgroup::new("Local", "3100"));
        book.add("DMR", Talkgroup::new("Worldwide", "91"));
        let ctx = Arc::new(SessionContext::new("DMR", 2, book, has_input));
        let (sender, mut gws) = loopback_sender(1).await;
        let (bus, events) = EventBus::new(64, Stats::new());
        let station = Station { call: "N4IRR".into(), subscriber_id: 3_113_043, repeater_id: 311_304_301 };
        let controller = Controller::new(ctx.clone(), sender, bus, LookupHandle::disabled(), station, asl_mode);
        Harness { controller, ctx, events, gateway: gws.remove(0) }
    }

    fn drain(rx: &mut mpsc::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_registers_then_tunes() {
        let mut h = harness(false, true).await;
        h.controller.handle(UiCommand::SelectTalkgroup("3100".into())).await;
        h.controller.handle(UiCommand::Connect).await;

        assert_eq!(recv_packet(&h.gateway).await.payload, b"REG:DVSWITCH");
        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "txTs=2");
        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "tgs=3100");
        let dtmf = recv_packet(&h.gateway).await;
        assert_eq!(dtmf.header.packet_type, PacketType::Dtmf);
        assert_eq!(dtmf.payload, b"3100");
        assert!(drain(&mut h.events).contains(&UiEvent::ConnectionStatus("Connected to Local".into())));
    }

    #[tokio::test]
    async fn test_scan_disables_transmit_control() {
        let mut h = harness(true, true).await;
        h.controller.start().await;
        h.controller.handle(UiCommand::SelectTalkgroups(vec!["3100".into(), "91".into()])).await;
        h.controller.handle(UiCommand::Connect).await;

        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "txTs=2");
        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "tgs=3100,91");
        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "txTg=0");
        let events = drain(&mut h.events);
        assert_eq!(events.last(), Some(&UiEvent::TransmitControl { enabled: false }));
    }

    #[tokio::test]
    async fn test_asl_mode_fakes_registration() {
        let mut h = harness(true, false).await;
        h.controller.start().await;
        assert_eq!(h.controller.registration(), RegistrationState::Registered);
        let events = drain(&mut h.events);
        assert!(events.contains(&UiEvent::TransmitControl { enabled: false }));
        let mut buf = [0u8; 64];
        assert!(h.gateway.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_tunes_first_entry() {
        let mut h = harness(true, true).await;
        h.controller.handle(UiCommand::SelectTalkgroup("91".into())).await;
        h.controller.handle(UiCommand::Disconnect).await;
        assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), "tgs=4000");
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("4000"));
        assert_eq!(drain(&mut h.events).last(), Some(&UiEvent::ConnectionStatus("Disconnected".into())));
    }

    #[tokio::test]
    async fn test_mode_change_sends_macro_and_info() {
        let mut h = harness(true, true).await;
        h.ctx.set_transmit_enabled(false);
        h.controller.handle(UiCommand::SelectMode("ysf".into())).await;
        assert_eq!(recv_packet(&h.gateway).await.payload, b"*YSF");
        assert_eq!(recv_packet(&h.gateway).await.payload, b"INFO:");
        assert_eq!(h.ctx.mode(), "YSF");
        assert!(h.ctx.transmit_enabled());
        assert!(drain(&mut h.events).contains(&UiEvent::ModeChanged("YSF".into())));
    }

    #[tokio::test]
    async fn test_manual_ptt_blocked_while_receiving() {
        let mut h = harness(true, true).await;
        h.controller.start().await;
        h.ctx.set_transmit_enabled(false);
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(!h.ctx.ptt());

        h.ctx.set_transmit_enabled(true);
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(h.ctx.ptt());
        // turning off is always allowed and logs a local row
        h.ctx.set_transmit_enabled(false);
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(!h.ctx.ptt());
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(e, UiEvent::EndOfTransmission(row) if row.call == "N4IRR")));
    }

    #[tokio::test]
    async fn test_ptt_refused_while_scanning() {
        let h = harness(true, true).await;
        h.controller.start().await;
        h.controller.handle(UiCommand::SelectTalkgroups(vec!["3100".into(), "91".into()])).await;
        h.controller.handle(UiCommand::Connect).await;
        assert!(!h.ctx.tx_control());
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(!h.ctx.ptt());

        // back on a single talkgroup the control reopens
        h.controller.handle(UiCommand::SelectTalkgroup("3100".into())).await;
        h.controller.handle(UiCommand::Connect).await;
        assert!(h.ctx.tx_control());
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(h.ctx.ptt());
    }

    #[tokio::test]
    async fn test_ptt_refused_after_unregister() {
        let mut h = harness(true, true).await;
        h.controller.start().await;
        assert!(h.ctx.tx_control());
        // what the RX task does on REG:UNREG
        h.ctx.set_registered(false);
        h.controller.events.transmit_control(&h.ctx, false);
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(!h.ctx.ptt());
        assert!(!drain(&mut h.events).iter().any(|e| matches!(e, UiEvent::PttChanged { on: true })));
    }

    #[tokio::test]
    async fn test_ptt_refused_before_registration() {
        let h = harness(false, true).await;
        h.controller.handle(UiCommand::TogglePtt).await;
        assert!(!h.ctx.ptt());
    }

    #[tokio::test]
    async fn test_send_settings() {
        let h = harness(true, true).await;
        h.controller.handle(UiCommand::SendSettings).await;
        h.controller.handle(UiCommand::SetAmbeSize(49)).await;
        let expect = [
            "gateway_dmr_id=3113043",
            "gateway_peer_id=311304301",
            "gateway_call=N4IRR",
            "ambeMode=DMR",
            "ambeSize=49",
        ];
        for e in expect {
            assert_eq!(remote_cmd(&recv_packet(&h.gateway).await), e);
        }
    }

    #[tokio::test]
    async fn test_unknown_talkgroup_used_as_typed() {
        let h = harness(true, true).await;
        h.controller.handle(UiCommand::SelectTalkgroup("31665".into())).await;
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("31665"));
        assert_eq!(h.ctx.current_talkgroup_name(), "31665");
    }

    #[tokio::test]
    async fn test_add_talkgroup_selects_it() {
        let mut h = harness(true, true).await;
        h.controller.handle(UiCommand::AddTalkgroup { name: "TAC 310".into(), value: "310".into() }).await;
        assert_eq!(h.ctx.current_talkgroup().as_deref(), Some("310"));
        assert_eq!(h.ctx.snapshot().talkgroups.len(), 4);
        assert!(drain(&mut h.events).contains(&UiEvent::TalkgroupSelected("310".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unregisters_when_registered() {
        let h = harness(false, true).await;
        h.ctx.set_registered(true);
        h.controller.shutdown().await;
        assert_eq!(recv_packet(&h.gateway).await.payload, b"REG:UNREG");
        assert!(!h.ctx.registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_shutdown_command() {
        let h = harness(true, true).await;
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        tx.send(UiCommand::Shutdown).await.unwrap();
        controller_loop(h.controller, rx, token.clone()).await;
        assert!(token.is_cancelled());
    }
}
