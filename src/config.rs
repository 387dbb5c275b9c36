use std::net::{ IpAddr, SocketAddr };
use std::path::PathBuf;

use anyhow::{ bail, Context };
use clap::Parser;

use crate::session::{ Talkgroup, TalkgroupBook };

/// Placeholder values shipped in sample configs; running with them would
/// register a station that does not exist.
const PLACEHOLDER_CALL: &str = "N0CALL";
const PLACEHOLDER_SUBSCRIBER_ID: u32 = 3_112_000;
const PLACEHOLDER_GATEWAY: &str = "1.2.3.4";

/// Device rates the audio layer knows how to chunk.
const SUPPORTED_SAMPLE_RATES: [u32; 2] = [8_000, 48_000];

/// USRP client for a DVSwitch Analog_Bridge gateway: plays network voice,
/// transmits microphone audio with PTT or VOX, and tunes talkgroups.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    // ── Station identity ───────────────────────────────────────────────

    /// Callsign of this station
    #[arg(long, env = "USRP_CALL", default_value = PLACEHOLDER_CALL)]
    pub call: String,

    /// DMR subscriber ID
    #[arg(long, default_value_t = PLACEHOLDER_SUBSCRIBER_ID)]
    pub subscriber_id: u32,

    /// DMR repeater/hotspot ID
    #[arg(long, default_value_t = 311_200_000)]
    pub repeater_id: u32,

    // ── Network ────────────────────────────────────────────────────────

    /// Gateway (Analog_Bridge) address
    #[arg(long, env = "USRP_GATEWAY", default_value = PLACEHOLDER_GATEWAY)]
    pub gateway: String,

    /// Gateway port(s) to send to (repeatable)
    #[arg(long = "tx-port", default_values_t = [50_100u16])]
    pub tx_ports: Vec<u16>,

    /// Local port to receive on
    #[arg(long, default_value_t = 50_100)]
    pub rx_port: u16,

    /// Local bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_host: String,

    /// UDP receive buffer size (SO_RCVBUF)
    #[arg(long, default_value_t = 1024 * 1024)]
    pub recv_buf_size: usize,

    // ── Radio ──────────────────────────────────────────────────────────

    /// DMR timeslot
    #[arg(long, default_value_t = 2)]
    pub slot: u8,

    /// Starting mode (DMR, YSF, NXDN, P25, DSTAR)
    #[arg(long, default_value = "DMR")]
    pub mode: String,

    /// Talkgroup entry as MODE:NAME=VALUE (repeatable)
    #[arg(long = "talkgroup", value_parser = parse_talkgroup_arg)]
    pub talkgroups: Vec<TalkgroupArg>,

    /// Key up automatically on microphone level
    #[arg(long, default_value_t = false)]
    pub vox: bool,

    /// VOX RMS threshold
    #[arg(long, default_value_t = 200)]
    pub vox_threshold: u32,

    /// Quiet 20 ms chunks before VOX drops PTT
    #[arg(long, default_value_t = 50)]
    pub vox_delay: u32,

    /// Local audio device sample rate (8000 or 48000)
    #[arg(long, default_value_t = 48_000)]
    pub sample_rate: u32,

    /// AllStar mode: the gateway never answers REG, so don't wait for it
    #[arg(long, default_value_t = false)]
    pub asl_mode: bool,

    /// Receive only (no input device is opened)
    #[arg(long, default_value_t = false)]
    pub rx_only: bool,

    /// Input device name (default device when omitted)
    #[arg(long)]
    pub input_device: Option<String>,

    /// Output device name (default device when omitted)
    #[arg(long)]
    pub output_device: Option<String>,

    /// Source IDs above this count as subscribers for private-call retune
    #[arg(long, default_value_t = 10_000)]
    pub private_call_min_id: u32,

    // ── Housekeeping ───────────────────────────────────────────────────

    /// Keepalive PING interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 0)]
    pub ping_interval_secs: u64,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 60)]
    pub stats_interval_secs: u64,

    /// Capacity of the worker → UI event channel
    #[arg(long, default_value_t = 1024)]
    pub event_capacity: usize,

    /// Save verified file transfers here (not saved when omitted)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

/// One `--talkgroup MODE:NAME=VALUE` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkgroupArg {
    pub mode: String,
    pub name: String,
    pub value: String,
}

fn parse_talkgroup_arg(s: &str) -> Result<TalkgroupArg, String> {
    let (mode, rest) = s.split_once(':').ok_or_else(|| format!("expected MODE:NAME=VALUE, got '{s}'"))?;
    let (name, value) = rest.split_once('=').ok_or_else(|| format!("expected MODE:NAME=VALUE, got '{s}'"))?;
    let (mode, name, value) = (mode.trim(), name.trim(), value.trim());
    if mode.is_empty() || name.is_empty() || value.is_empty() {
        return Err(format!("empty field in talkgroup '{s}'"));
    }
    Ok(TalkgroupArg {
        mode: mode.to_ascii_uppercase(),
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Reject placeholder identity values and impossible settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.call.trim().is_empty() || self.call.eq_ignore_ascii_case(PLACEHOLDER_CALL) {
            bail!("set --call to your callsign (got '{}')", self.call);
        }
        if self.subscriber_id == PLACEHOLDER_SUBSCRIBER_ID {
            bail!("set --subscriber-id to your DMR ID (got {})", self.subscriber_id);
        }
        if self.gateway == PLACEHOLDER_GATEWAY {
            bail!("set --gateway to the Analog_Bridge address (got {})", self.gateway);
        }
        if self.tx_ports.is_empty() {
            bail!("at least one --tx-port is required");
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            bail!("--sample-rate must be one of {:?} (got {})", SUPPORTED_SAMPLE_RATES, self.sample_rate);
        }
        if self.event_capacity == 0 {
            bail!("--event-capacity must be at least 1");
        }
        self.gateway_ip()?;
        Ok(())
    }

    pub fn gateway_ip(&self) -> anyhow::Result<IpAddr> {
        self.gateway.parse().with_context(|| format!("invalid --gateway address '{}'", self.gateway))
    }

    /// Every gateway port the sender fans out to.
    pub fn destinations(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let ip = self.gateway_ip()?;
        Ok(self.tx_ports.iter().map(|&port| SocketAddr::new(ip, port)).collect())
    }

    pub fn rx_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.rx_port)
    }

    /// Whether the microphone path runs at all.
    pub fn input_enabled(&self) -> bool {
        !self.rx_only
    }

    /// Device samples per 20 ms chunk.
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as usize) / 50
    }

    pub fn mode(&self) -> String {
        self.mode.trim().to_ascii_uppercase()
    }

    /// Talkgroup lists from the command line, in argument order per mode.
    pub fn talkgroup_book(&self) -> TalkgroupBook {
        let mut book = TalkgroupBook::new();
        for tg in &self.talkgroups {
            book.add(&tg.mode, Talkgroup::new(tg.name.clone(), tg.value.clone()));
        }
        book
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "usrp-client",
            "--call",
            "N4IRR",
            "--subscriber-id",
            "3113043",
            "--gateway",
            "127.0.0.1",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = parse(&[]);
        cfg.validate().unwrap();
        assert_eq!(cfg.tx_ports, vec![50_100]);
        assert_eq!(cfg.chunk_samples(), 960);
        assert_eq!(cfg.private_call_min_id, 10_000);
        assert!(cfg.input_enabled());
    }

    #[test]
    fn test_placeholders_rejected() {
        let cfg = Config::try_parse_from(["usrp-client"]).unwrap();
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&[]);
        cfg.subscriber_id = PLACEHOLDER_SUBSCRIBER_ID;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&[]);
        cfg.gateway = PLACEHOLDER_GATEWAY.into();
        assert!(cfg.validate().is_err());

        let mut cfg = parse(&[]);
        cfg.tx_ports.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sample_rate_checked() {
        assert!(parse(&["--sample-rate", "44100"]).validate().is_err());
        let cfg = parse(&["--sample-rate", "8000"]);
        cfg.validate().unwrap();
        assert_eq!(cfg.chunk_samples(), 160);
    }

    #[test]
    fn test_multiple_destinations() {
        let cfg = parse(&["--tx-port", "50100", "--tx-port", "50200"]);
        let dests = cfg.destinations().unwrap();
        assert_eq!(dests.len(), 2);
        assert_eq!(dests[1].to_string(), "127.0.0.1:50200");
    }

    #[test]
    fn test_talkgroup_args() {
        let cfg = parse(&[
            "--talkgroup",
            "dmr:Disconnect=4000",
            "--talkgroup",
            "DMR:Local=\"3100\"",
            "--talkgroup",
            "YSF:Parrot=register.ysfreflector.de:42020",
        ]);
        let book = cfg.talkgroup_book();
        assert_eq!(book.list("DMR").len(), 2);
        assert_eq!(book.find("DMR", "3100").unwrap().name, "Local");
        assert_eq!(book.list("YSF")[0].value, "register.ysfreflector.de:42020");

        assert!(parse_talkgroup_arg("DMR-Local-3100").is_err());
        assert!(parse_talkgroup_arg("DMR:=3100").is_err());
    }
}
