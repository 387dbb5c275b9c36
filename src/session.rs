use std::collections::BTreeMap;
use std::sync::atomic::{ AtomicBool, AtomicI32, Ordering };

use chrono::{ DateTime, Local };
use parking_lot::RwLock;

use crate::usrp_protocol::MacroEntry;

// ═══════════════════════════════════════════════════════════════════════
//  Talkgroups
// ═══════════════════════════════════════════════════════════════════════

/// A selectable destination: friendly name plus the string sent on the wire
/// (numeric TG, `*MACRO`, or a private-call token like `3112345#`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Talkgroup {
    pub name: String,
    pub value: String,
}

impl Talkgroup {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value: String = value.into();
        Talkgroup {
            name: name.into(),
            value: value.replace('"', ""),
        }
    }
}

/// Talkgroup lists keyed by mode (DMR, YSF, NXDN, ...).
///
/// Entries are only ever appended during a session.
#[derive(Debug, Clone, Default)]
pub struct TalkgroupBook {
    lists: BTreeMap<String, Vec<Talkgroup>>,
}

impl TalkgroupBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless the mode already has an entry with this wire value.
    pub fn add(&mut self, mode: &str, tg: Talkgroup) -> bool {
        let list = self.lists.entry(mode.to_string()).or_default();
        if list.iter().any(|t| t.value == tg.value) {
            return false;
        }
        list.push(tg);
        true
    }

    pub fn list(&self, mode: &str) -> &[Talkgroup] {
        self.lists.get(mode).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, mode: &str, value: &str) -> Option<&Talkgroup> {
        self.list(mode).iter().find(|t| t.value == value)
    }

    pub fn modes(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session context
// ═══════════════════════════════════════════════════════════════════════

/// Fields behind the lock: everything that is not a plain flag.
#[derive(Debug)]
struct Selection {
    mode: String,
    slot: u8,
    /// Selected wire values; more than one means scan mode.
    selected: Vec<String>,
    talkgroups: TalkgroupBook,
    macros: Vec<MacroEntry>,
    local_tx_start: Option<DateTime<Local>>,
}

/// Session state shared by the RX, TX and controller tasks.
///
/// Writers:
/// * `registered`, `transmit_enabled`, last keyup / sequence: RX task
///   (the controller also sets `registered` in ASL mode and re-opens
///   `transmit_enabled` on a retune)
/// * `tx_control`: whoever emits `UiEvent::TransmitControl` (RX on REG
///   replies, controller on ASL start and on tune/scan)
/// * `ptt`: TX task (VOX) and controller (manual PTT)
/// * selection / talkgroups: controller, plus RX on INFO and private calls
///
/// The UI only ever sees [`SessionSnapshot`] copies.
#[derive(Debug)]
pub struct SessionContext {
    registered: AtomicBool,
    transmit_enabled: AtomicBool,
    tx_control: AtomicBool,
    ptt: AtomicBool,
    last_keyup: AtomicBool,
    last_sequence_seen: AtomicI32,
    has_input: bool,
    selection: RwLock<Selection>,
}

/// Point-in-time copy of the session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub registered: bool,
    pub transmit_enabled: bool,
    pub tx_control: bool,
    pub ptt: bool,
    pub last_keyup: bool,
    pub last_sequence_seen: i32,
    pub mode: String,
    pub slot: u8,
    pub current_talkgroup: Option<String>,
    pub talkgroups: Vec<Talkgroup>,
}

impl SessionContext {
    pub fn new(mode: &str, slot: u8, talkgroups: TalkgroupBook, has_input: bool) -> Self {
        let selected = talkgroups
            .list(mode)
            .first()
            .map(|t| vec![t.value.clone()])
            .unwrap_or_default();
        SessionContext {
            registered: AtomicBool::new(false),
            transmit_enabled: AtomicBool::new(true),
            tx_control: AtomicBool::new(false),
            ptt: AtomicBool::new(false),
            last_keyup: AtomicBool::new(false),
            last_sequence_seen: AtomicI32::new(0),
            has_input,
            selection: RwLock::new(Selection {
                mode: mode.to_string(),
                slot,
                selected,
                talkgroups,
                macros: Vec::new(),
                local_tx_start: None,
            }),
        }
    }

    // ── flags ─────────────────────────────────────────────────────────

    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn set_registered(&self, on: bool) {
        self.registered.store(on, Ordering::Release);
    }

    /// Half-duplex gate: false while the network is delivering someone
    /// else's transmission.
    pub fn transmit_enabled(&self) -> bool {
        self.transmit_enabled.load(Ordering::Acquire)
    }

    pub fn set_transmit_enabled(&self, on: bool) {
        self.transmit_enabled.store(on, Ordering::Release);
    }

    /// Whether the user may key up at all. Closed until registration, while
    /// scanning, and when there is no input device.
    pub fn tx_control(&self) -> bool {
        self.tx_control.load(Ordering::Acquire)
    }

    pub fn set_tx_control(&self, on: bool) {
        self.tx_control.store(on, Ordering::Release);
    }

    pub fn ptt(&self) -> bool {
        self.ptt.load(Ordering::Acquire)
    }

    pub fn set_ptt(&self, on: bool) {
        self.ptt.store(on, Ordering::Release);
    }

    pub fn has_input(&self) -> bool {
        self.has_input
    }

    pub fn set_last_keyup(&self, keyup: bool) {
        self.last_keyup.store(keyup, Ordering::Relaxed);
    }

    pub fn set_last_sequence(&self, seq: i32) {
        self.last_sequence_seen.store(seq, Ordering::Relaxed);
    }

    // ── mode / slot ───────────────────────────────────────────────────

    pub fn mode(&self) -> String {
        self.selection.read().mode.clone()
    }

    /// Switch mode and select the first talkgroup of its list.
    pub fn set_mode(&self, mode: &str) {
        let mut s = self.selection.write();
        s.mode = mode.to_string();
        s.selected = s.talkgroups
            .list(mode)
            .first()
            .map(|t| vec![t.value.clone()])
            .unwrap_or_default();
    }

    pub fn slot(&self) -> u8 {
        self.selection.read().slot
    }

    pub fn set_slot(&self, slot: u8) {
        self.selection.write().slot = slot;
    }

    // ── talkgroups ────────────────────────────────────────────────────

    pub fn current_talkgroup(&self) -> Option<String> {
        self.selection.read().selected.first().cloned()
    }

    pub fn selected_talkgroups(&self) -> Vec<String> {
        self.selection.read().selected.clone()
    }

    /// Friendly name of the current talkgroup, falling back to its wire value.
    pub fn current_talkgroup_name(&self) -> String {
        let s = self.selection.read();
        match s.selected.first() {
            Some(value) =>
                s.talkgroups
                    .find(&s.mode, value)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| value.clone()),
            None => String::new(),
        }
    }

    /// Look up a wire value in the active mode's list.
    pub fn resolve_talkgroup_name(&self, value: &str) -> Option<String> {
        let s = self.selection.read();
        s.talkgroups.find(&s.mode, value).map(|t| t.name.clone())
    }

    /// Select a talkgroup of the active mode; false if it is not in the list.
    pub fn select_talkgroup(&self, value: &str) -> bool {
        let mut s = self.selection.write();
        if s.talkgroups.find(&s.mode, value).is_none() {
            return false;
        }
        s.selected = vec![value.to_string()];
        true
    }

    /// Select several talkgroups (unknown values are kept as typed).
    pub fn select_talkgroups(&self, values: &[String]) {
        self.selection.write().selected = values.to_vec();
    }

    pub fn add_talkgroup(&self, mode: &str, tg: Talkgroup) -> bool {
        self.selection.write().talkgroups.add(mode, tg)
    }

    pub fn first_talkgroup(&self) -> Option<Talkgroup> {
        let s = self.selection.read();
        s.talkgroups.list(&s.mode).first().cloned()
    }

    // ── macros ────────────────────────────────────────────────────────

    pub fn set_macros(&self, macros: Vec<MacroEntry>) {
        self.selection.write().macros = macros;
    }

    pub fn macros(&self) -> Vec<MacroEntry> {
        self.selection.read().macros.clone()
    }

    // ── local transmission timing ─────────────────────────────────────

    pub fn mark_local_tx_start(&self, at: DateTime<Local>) {
        self.selection.write().local_tx_start = Some(at);
    }

    pub fn take_local_tx_start(&self) -> Option<DateTime<Local>> {
        self.selection.write().local_tx_start.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.selection.read();
        SessionSnapshot {
            registered: self.registered(),
            transmit_enabled: self.transmit_enabled(),
            tx_control: self.tx_control(),
            ptt: self.ptt(),
            last_keyup: self.last_keyup.load(Ordering::Relaxed),
            last_sequence_seen: self.last_sequence_seen.load(Ordering::Relaxed),
            mode: s.mode.clone(),
            slot: s.slot,
            current_talkgroup: s.selected.first().cloned(),
            talkgroups: s.talkgroups.list(&s.mode).to_vec(),
        }
    }
}
