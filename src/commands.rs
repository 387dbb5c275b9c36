//! Outbound side of the USRP link: every packet this client sends goes
//! through [`UsrpSender`].
//!
//! ```text
//!  TX task ──send_voice──┐
//!  controller ──command──┼──▶ seq lock ──encode──▶ send_to(port 1..N)
//!  RX task ──txTg / INFO─┘
//! ```
//!
//! The sequence counter is held across encode and send so packets hit the
//! wire in sequence order even with three tasks sending.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::events::EventBus;
use crate::stats::Stats;
use crate::usrp_protocol::{ build_command, build_tlv, build_voice, PacketType, TlvTag };

pub struct UsrpSender {
    socket: Arc<UdpSocket>,
    destinations: Vec<SocketAddr>,
    seq: Mutex<i32>,
    call: String,
    events: EventBus,
    stats: Arc<Stats>,
}

impl UsrpSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        destinations: Vec<SocketAddr>,
        call: impl Into<String>,
        events: EventBus,
        stats: Arc<Stats>
    ) -> Self {
        UsrpSender {
            socket,
            destinations,
            seq: Mutex::new(0),
            call: call.into(),
            events,
            stats,
        }
    }

    /// Next sequence number that will be stamped on a packet.
    #[cfg(test)]
    pub async fn peek_seq(&self) -> i32 {
        *self.seq.lock().await
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Raw packets
    // ═══════════════════════════════════════════════════════════════════

    /// One 20 ms frame of 8 kHz PCM.
    pub async fn send_voice(&self, keyup: bool, pcm: &[u8]) {
        let mut seq = self.seq.lock().await;
        let packet = build_voice(*seq, keyup, pcm);
        self.fan_out(&packet).await;
        self.stats.record_voice_sent();
        *seq = seq.wrapping_add(1);
    }

    /// Any non-voice packet.
    pub async fn send_command(&self, packet_type: PacketType, payload: &[u8]) {
        let mut seq = self.seq.lock().await;
        let packet = build_command(*seq, packet_type, payload);
        self.fan_out(&packet).await;
        *seq = seq.wrapping_add(1) & 0xffff;
    }

    async fn fan_out(&self, packet: &[u8]) {
        for dest in &self.destinations {
            match self.socket.send_to(packet, dest).await {
                Ok(_) => self.stats.record_send(),
                Err(e) => {
                    self.stats.record_send_error();
                    warn!(dest = %dest, error = %e, "❌ send failed");
                    self.events.status("Connection failure");
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Commands
    // ═══════════════════════════════════════════════════════════════════

    /// `key=value` command executed by the gateway (`txTg=`, `tgs=`, ...).
    pub async fn send_remote_command(&self, cmd: &str) {
        match build_tlv(TlvTag::RemoteCmd, cmd.as_bytes()) {
            Ok(tlv) => {
                debug!(cmd, "remote command");
                self.send_command(PacketType::Tlv, &tlv).await;
            }
            Err(e) => warn!(cmd, error = %e, "remote command not sent"),
        }
    }

    /// Bare ASCII, no terminator.
    pub async fn send_text(&self, text: &str) {
        self.send_command(PacketType::Text, text.as_bytes()).await;
    }

    pub async fn send_dtmf(&self, digits: &str) {
        self.send_command(PacketType::Dtmf, digits.as_bytes()).await;
    }

    pub async fn register(&self) {
        info!(call = %self.call, "📝 registering with gateway");
        self.send_text("REG:DVSWITCH").await;
    }

    pub async fn unregister(&self) {
        info!("👋 unregistering from gateway");
        self.send_text("REG:UNREG").await;
    }

    pub async fn request_info(&self) {
        self.send_text("INFO:").await;
    }

    /// `*MODE` as DTMF.
    pub async fn set_mode(&self, mode: &str) {
        self.send_dtmf(&format!("*{mode}")).await;
    }

    pub async fn set_tx_talkgroup(&self, tg: &str) {
        self.send_remote_command(&format!("txTg={tg}")).await;
    }

    /// Receive talkgroup list (`tgs=a,b,c`).
    pub async fn set_talkgroups(&self, tgs: &[String]) {
        self.send_remote_command(&format!("tgs={}", tgs.join(","))).await;
    }

    pub async fn set_slot(&self, slot: u8) {
        self.send_remote_command(&format!("txTs={slot}")).await;
    }

    pub async fn set_ambe_size(&self, size: u32) {
        self.send_remote_command(&format!("ambeSize={size}")).await;
    }

    pub async fn set_ambe_mode(&self, mode: &str) {
        self.send_remote_command(&format!("ambeMode={mode}")).await;
    }

    pub async fn set_dmr_id(&self, id: u32) {
        self.send_remote_command(&format!("gateway_dmr_id={id}")).await;
    }

    pub async fn set_peer_id(&self, id: u32) {
        self.send_remote_command(&format!("gateway_peer_id={id}")).await;
    }

    pub async fn set_dmr_call(&self, call: &str) {
        self.send_remote_command(&format!("gateway_call={call}")).await;
    }

    pub async fn ping(&self) {
        self.send_command(PacketType::Ping, b"PING").await;
    }
}

/// Periodic PING so NAT bindings and the gateway's idea of us stay fresh.
pub async fn ping_loop(sender: Arc<UsrpSender>, interval_secs: u64, shutdown: CancellationToken) {
    if interval_secs == 0 {
        shutdown.cancelled().await;
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => sender.ping().await,
        }
    }
    debug!("ping loop stopped");
}

/// Bind a UDP socket with SO_REUSEADDR/SO_REUSEPORT and a large receive buffer.
pub fn bind_reuseport(addr: &str, recv_buf_size: usize) -> anyhow::Result<UdpSocket> {
    let parsed: SocketAddr = addr.parse()?;

    let socket = socket2::Socket::new(
        match parsed {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP)
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(recv_buf_size)?;
    socket.bind(&parsed.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
