//! Messages crossing the boundary between the protocol workers and the UI.
//!
//! Workers never touch UI state and the UI never touches worker state: the
//! workers push [`UiEvent`]s out through an [`EventBus`], and the UI pushes
//! [`UiCommand`]s in through a plain `mpsc` channel drained by the
//! controller task.

use std::sync::Arc;

use chrono::{ DateTime, Local };
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::SessionContext;
use crate::stats::Stats;
use crate::usrp_protocol::MacroEntry;

/// One row of the transmission log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub started_at: DateTime<Local>,
    pub call: String,
    pub slot: String,
    pub talkgroup: String,
    pub loss_percent: f64,
    pub duration_secs: f64,
}

impl LogEntry {
    /// `MM/DD/YY`
    pub fn date(&self) -> String {
        self.started_at.format("%m/%d/%y").to_string()
    }

    /// `HH:MM:SS`
    pub fn time(&self) -> String {
        self.started_at.format("%H:%M:%S").to_string()
    }

    pub fn loss(&self) -> String {
        format!("{:.2}%", self.loss_percent)
    }

    pub fn duration(&self) -> String {
        format!("{:.2}s", self.duration_secs)
    }
}

/// A state change the UI may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Status-bar text ("Registered", "Connected to Local", ...).
    ConnectionStatus(String),
    /// Whether the transmit control should be usable.
    TransmitControl {
        enabled: bool,
    },
    /// Local PTT turned on or off.
    PttChanged {
        on: bool,
    },
    /// "who -> where" line for the transmission in progress; `None` when idle.
    CurrentTransmission(Option<String>),
    /// A transmission (remote or local) ended.
    EndOfTransmission(LogEntry),
    Toast {
        title: String,
        text: String,
    },
    /// Receive audio level for the meter.
    AudioLevel(u32),
    /// The gateway pushed a macro list that should pop up.
    MacroMenu(Vec<MacroEntry>),
    ModeChanged(String),
    /// A talkgroup (by wire value) became the selected one.
    TalkgroupSelected(String),
    /// The talkgroup book for a mode gained an entry.
    TalkgroupAdded {
        mode: String,
        name: String,
        value: String,
    },
    /// Avatar lookup result; `None` clears the picture.
    Avatar {
        call: String,
        image_url: Option<String>,
    },
}

/// A request from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Connect,
    Disconnect,
    /// Tune one talkgroup by wire value.
    SelectTalkgroup(String),
    /// Scan several talkgroups at once (receive only).
    SelectTalkgroups(Vec<String>),
    SetSlot(u8),
    SelectMode(String),
    TogglePtt,
    /// Ad-hoc talkgroup typed by the user.
    AddTalkgroup {
        name: String,
        value: String,
    },
    Dtmf(String),
    RemoteCommand(String),
    RequestInfo,
    /// Push station identity and mode to the gateway.
    SendSettings,
    SetAmbeSize(u32),
    Shutdown,
}

/// Non-blocking event sender shared by every worker.
///
/// A full channel drops the event (and counts it) rather than stalling a
/// worker on a slow UI.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<UiEvent>,
    stats: Arc<Stats>,
}

impl EventBus {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> (Self, mpsc::Receiver<UiEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventBus { tx, stats }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.stats.record_event_drop();
            debug!(error = %e, "UI event dropped");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(UiEvent::ConnectionStatus(text.into()));
    }

    /// Open or close the transmit control, in the session and on screen.
    pub fn transmit_control(&self, ctx: &SessionContext, enabled: bool) {
        ctx.set_tx_control(enabled);
        self.emit(UiEvent::TransmitControl { enabled });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_entry_formatting() {
        let entry = LogEntry {
            started_at: Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap(),
            call: "N4IRR".into(),
            slot: "2".into(),
            talkgroup: "Local".into(),
            loss_percent: 1.5,
            duration_secs: 3.456,
        };
        assert_eq!(entry.date(), "03/09/24");
        assert_eq!(entry.time(), "07:05:01");
        assert_eq!(entry.loss(), "1.50%");
        assert_eq!(entry.duration(), "3.46s");
    }

    #[tokio::test]
    async fn test_full_bus_drops_and_counts() {
        let stats = Stats::new();
        let (bus, mut rx) = EventBus::new(1, stats.clone());
        bus.status("one");
        bus.status("two");
        assert_eq!(rx.recv().await, Some(UiEvent::ConnectionStatus("one".into())));
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot_and_reset(std::time::Duration::from_secs(1)).events_dropped, 1);
    }
}
