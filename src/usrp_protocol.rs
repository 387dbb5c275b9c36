//! USRP ↔ Analog-Bridge UDP protocol
//!
//! Packet format (32-byte header + variable payload):
//! ```text
//! ┌──────────┬─────────┬─────────┬─────────┬───────────┬──────────┬─────────┬──────────┬──────────┐
//! │ 0-3      │ 4-7     │ 8-11    │ 12-15   │ 16-19     │ 20-23    │ 24-27   │ 28-31    │ 32..N    │
//! │ "USRP"   │ seq     │ memory  │ keyup   │ talkgroup │ type     │ mpxid   │ reserved │ payload  │
//! │ ASCII    │ i32 BE  │ i32 BE  │ i32 BE  │ i32 BE    │ i32 NE ! │ i32 BE  │ i32 BE   │          │
//! └──────────┴─────────┴─────────┴─────────┴───────────┴──────────┴─────────┴──────────┴──────────┘
//! ```
//!
//! The `type` field is host-endian while every other integer is big-endian.
//!
//! Voice: 16-bit signed PCM, 8 kHz, mono, 160 samples (320 bytes) per frame.

use bytes::BufMut;
use serde::{ Deserialize, Deserializer };

use crate::error::CodecError;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Magic bytes at the start of every packet.
pub const USRP_EYE_CATCHER: &[u8; 4] = b"USRP";

/// Fixed header size.
pub const USRP_HEADER_SIZE: usize = 32;

/// Network audio rate.
pub const NETWORK_SAMPLE_RATE: u32 = 8_000;

/// Samples in one network voice frame (20 ms).
pub const VOICE_FRAME_SAMPLES: usize = 160;

/// Bytes in one network voice frame.
pub const VOICE_FRAME_BYTES: usize = VOICE_FRAME_SAMPLES * 2;

/// SET_INFO call-control bit marking a private (unit-to-unit) call.
pub const CALL_CONTROL_PRIVATE: u8 = 0x80;

/// Offset of the call string inside a SET_INFO record.
const SET_INFO_CALL_OFFSET: usize = 14;

// ── Packet Types ───────────────────────────────────────────────────────

/// Payload interpretation carried in the header `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Voice,
    Dtmf,
    Text,
    Ping,
    Tlv,
    VoiceAdpcm,
    VoiceUlaw,
}

impl PacketType {
    pub fn from_i32(v: i32) -> Result<Self, CodecError> {
        match v {
            0 => Ok(PacketType::Voice),
            1 => Ok(PacketType::Dtmf),
            2 => Ok(PacketType::Text),
            3 => Ok(PacketType::Ping),
            4 => Ok(PacketType::Tlv),
            5 => Ok(PacketType::VoiceAdpcm),
            6 => Ok(PacketType::VoiceUlaw),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            PacketType::Voice => 0,
            PacketType::Dtmf => 1,
            PacketType::Text => 2,
            PacketType::Ping => 3,
            PacketType::Tlv => 4,
            PacketType::VoiceAdpcm => 5,
            PacketType::VoiceUlaw => 6,
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Voice => write!(f, "voice"),
            PacketType::Dtmf => write!(f, "dtmf"),
            PacketType::Text => write!(f, "text"),
            PacketType::Ping => write!(f, "ping"),
            PacketType::Tlv => write!(f, "tlv"),
            PacketType::VoiceAdpcm => write!(f, "voice_adpcm"),
            PacketType::VoiceUlaw => write!(f, "voice_ulaw"),
        }
    }
}

// ── TLV Tags ───────────────────────────────────────────────────────────

/// Tag byte of a tag-length-value record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvTag {
    BeginTx,
    Ambe,
    EndTx,
    TgTune,
    PlayAmbe,
    RemoteCmd,
    Ambe49,
    Ambe72,
    SetInfo,
    Imbe,
    DsAmbe,
    FileXfer,
}

impl TlvTag {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(TlvTag::BeginTx),
            1 => Ok(TlvTag::Ambe),
            2 => Ok(TlvTag::EndTx),
            3 => Ok(TlvTag::TgTune),
            4 => Ok(TlvTag::PlayAmbe),
            5 => Ok(TlvTag::RemoteCmd),
            6 => Ok(TlvTag::Ambe49),
            7 => Ok(TlvTag::Ambe72),
            8 => Ok(TlvTag::SetInfo),
            9 => Ok(TlvTag::Imbe),
            10 => Ok(TlvTag::DsAmbe),
            11 => Ok(TlvTag::FileXfer),
            other => Err(CodecError::UnknownTlvTag(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TlvTag::BeginTx => 0,
            TlvTag::Ambe => 1,
            TlvTag::EndTx => 2,
            TlvTag::TgTune => 3,
            TlvTag::PlayAmbe => 4,
            TlvTag::RemoteCmd => 5,
            TlvTag::Ambe49 => 6,
            TlvTag::Ambe72 => 7,
            TlvTag::SetInfo => 8,
            TlvTag::Imbe => 9,
            TlvTag::DsAmbe => 10,
            TlvTag::FileXfer => 11,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Header + Packet
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsrpHeader {
    pub seq: i32,
    pub memory: i32,
    pub keyup: bool,
    pub talkgroup: i32,
    pub packet_type: PacketType,
    pub mpxid: i32,
    pub reserved: i32,
}

impl UsrpHeader {
    /// Header with only the fields this client ever sets.
    pub fn new(seq: i32, keyup: bool, packet_type: PacketType, talkgroup: i32) -> Self {
        UsrpHeader {
            seq,
            memory: 0,
            keyup,
            talkgroup,
            packet_type,
            mpxid: 0,
            reserved: 0,
        }
    }
}

/// A decoded USRP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsrpPacket {
    pub header: UsrpHeader,
    pub payload: Vec<u8>,
}

impl UsrpPacket {
    /// Parse a USRP packet from raw UDP bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < USRP_HEADER_SIZE {
            return Err(CodecError::TooShort { len: buf.len(), need: USRP_HEADER_SIZE });
        }
        if &buf[0..4] != USRP_EYE_CATCHER {
            return Err(CodecError::BadEyeCatcher([buf[0], buf[1], buf[2], buf[3]]));
        }

        let be = |at: usize| i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let type_raw = i32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]);

        let header = UsrpHeader {
            seq: be(4),
            memory: be(8),
            keyup: be(12) != 0,
            talkgroup: be(16),
            packet_type: PacketType::from_i32(type_raw)?,
            mpxid: be(24),
            reserved: be(28),
        };

        Ok(UsrpPacket {
            header,
            payload: buf[USRP_HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize with the `type` field in host order (inverse of [`parse`](Self::parse)).
    pub fn encode(&self) -> Vec<u8> {
        let type_field = self.header.packet_type.as_i32().to_ne_bytes();
        encode_with_type_field(&self.header, type_field, &self.payload)
    }
}

fn encode_with_type_field(h: &UsrpHeader, type_field: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(USRP_HEADER_SIZE + payload.len());
    buf.put_slice(USRP_EYE_CATCHER);
    buf.put_i32(h.seq);
    buf.put_i32(h.memory);
    buf.put_i32(h.keyup as i32);
    buf.put_i32(h.talkgroup);
    buf.put_slice(&type_field);
    buf.put_i32(h.mpxid);
    buf.put_i32(h.reserved);
    buf.put_slice(payload);
    buf
}

// ═══════════════════════════════════════════════════════════════════════
//  Packet Builders (client → gateway)
// ═══════════════════════════════════════════════════════════════════════

/// Build a voice packet. VOICE is type 0, so the type field is all zeros
/// whatever the byte order.
pub fn build_voice(seq: i32, keyup: bool, pcm: &[u8]) -> Vec<u8> {
    let header = UsrpHeader::new(seq, keyup, PacketType::Voice, 0);
    encode_with_type_field(&header, [0; 4], pcm)
}

/// Build a command packet (DTMF / TEXT / TLV / PING).
///
/// The legacy command path stores `type << 24` big-endian, which puts the
/// type in the first byte of the field. On little-endian hosts this is the
/// same as the host-order encoding a gateway decodes.
pub fn build_command(seq: i32, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let header = UsrpHeader::new(seq, false, packet_type, 0);
    let type_field = (packet_type.as_i32() << 24).to_be_bytes();
    encode_with_type_field(&header, type_field, payload)
}

/// Encode one TLV record.
pub fn build_tlv(tag: TlvTag, value: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u8::try_from(value.len()).map_err(|_| CodecError::ValueTooLong(value.len()))?;
    let mut buf = Vec::with_capacity(2 + value.len());
    buf.put_u8(tag.as_u8());
    buf.put_u8(len);
    buf.put_slice(value);
    Ok(buf)
}

// ═══════════════════════════════════════════════════════════════════════
//  TLV records
// ═══════════════════════════════════════════════════════════════════════

/// A tag-length-value record borrowed from a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRecord<'a> {
    pub tag: TlvTag,
    pub value: &'a [u8],
}

impl<'a> TlvRecord<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::TooShort { len: buf.len(), need: 2 });
        }
        let tag = TlvTag::from_u8(buf[0])?;
        let declared = buf[1] as usize;
        let available = buf.len() - 2;
        if declared > available {
            return Err(CodecError::Truncated { declared, available });
        }
        Ok(TlvRecord { tag, value: &buf[2..2 + declared] })
    }
}

/// Bytes up to (not including) the first NUL, or the whole slice.
pub fn c_str(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(end) => &buf[..end],
        None => buf,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SET_INFO (call metadata embedded in TEXT packets)
// ═══════════════════════════════════════════════════════════════════════

/// The call field of a SET_INFO record: either a bare callsign or a JSON
/// object carrying the callsign and an operator name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallField {
    Plain(String),
    Structured {
        call: String,
        name: String,
    },
}

#[derive(Deserialize)]
struct CallObject {
    call: String,
    #[serde(default)]
    name: String,
}

impl CallField {
    /// Structured decode first, raw string as fallback.
    pub fn parse(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            if let Ok(obj) = serde_json::from_str::<CallObject>(raw) {
                return CallField::Structured { call: obj.call, name: obj.name };
            }
        }
        CallField::Plain(raw.to_string())
    }

    pub fn call(&self) -> &str {
        match self {
            CallField::Plain(c) => c,
            CallField::Structured { call, .. } => call,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            CallField::Plain(_) => None,
            CallField::Structured { name, .. } if name.is_empty() => None,
            CallField::Structured { name, .. } => Some(name),
        }
    }
}

/// Metadata the gateway sends at the start of a network transmission.
///
/// ```text
/// [0] tag=8  [1] len  [2..5] source id (24-bit BE)  [5..9] unused
/// [9..12] destination id (24-bit BE)  [12] slot  [13] call control
/// [14..] call string or {"call":..,"name":..}, NUL-terminated
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub source_id: u32,
    pub destination_id: u32,
    pub slot: u8,
    pub call_control: u8,
    pub call: CallField,
}

impl SetInfo {
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() <= SET_INFO_CALL_OFFSET {
            return Err(CodecError::TooShort { len: buf.len(), need: SET_INFO_CALL_OFFSET + 1 });
        }
        if TlvTag::from_u8(buf[0])? != TlvTag::SetInfo {
            return Err(CodecError::UnknownText(String::from_utf8_lossy(c_str(buf)).into_owned()));
        }

        let u24 = |at: usize| ((buf[at] as u32) << 16) | ((buf[at + 1] as u32) << 8) | (buf[at + 2] as u32);
        let source_id = u24(2);

        let raw_call = c_str(&buf[SET_INFO_CALL_OFFSET..]);
        let call = if raw_call.is_empty() {
            CallField::Plain(source_id.to_string())
        } else {
            CallField::parse(&String::from_utf8_lossy(raw_call))
        };

        Ok(SetInfo {
            source_id,
            destination_id: u24(9),
            slot: buf[12],
            call_control: buf[13],
            call,
        })
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        (self.call_control & CALL_CONTROL_PRIVATE) != 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  TEXT payloads
// ═══════════════════════════════════════════════════════════════════════

/// Gateway reply to a `REG:` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegReply {
    Ok,
    Unreg,
    /// Gateway is going away; re-register after this many seconds (0 = don't).
    Exiting {
        rereg_after_secs: u64,
    },
    Other(String),
}

/// One `value,label` entry of a MACRO or MENU list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroEntry {
    pub value: String,
    pub label: String,
}

/// Status JSON returned for an `INFO:` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfoStatus {
    #[serde(deserialize_with = "string_or_number")]
    pub last_tune: String,
    pub tlv: InfoTlv,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfoTlv {
    pub ambe_mode: String,
}

impl InfoStatus {
    /// Mode name with every `YSF*` variant collapsed to `YSF`.
    pub fn normalized_mode(&self) -> String {
        if self.tlv.ambe_mode.starts_with("YSF") {
            "YSF".to_string()
        } else {
            self.tlv.ambe_mode.clone()
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoMessage {
    Msg(String),
    Macro(Vec<MacroEntry>),
    Menu(Vec<MacroEntry>),
    Status(InfoStatus),
}

/// Every kind of TEXT payload the gateway sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMessage {
    Register(RegReply),
    Info(InfoMessage),
    SetInfo(SetInfo),
}

impl TextMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let text = c_str(payload);

        if let Some(rest) = text.strip_prefix(b"REG:") {
            return Ok(TextMessage::Register(parse_reg(rest)));
        }

        if let Some(rest) = text.strip_prefix(b"INFO:") {
            return parse_info(&String::from_utf8_lossy(rest)).map(TextMessage::Info);
        }

        match payload.first() {
            Some(&tag) if tag == TlvTag::SetInfo.as_u8() => SetInfo::parse(payload).map(TextMessage::SetInfo),
            _ => Err(CodecError::UnknownText(String::from_utf8_lossy(text).into_owned())),
        }
    }
}

fn parse_reg(rest: &[u8]) -> RegReply {
    if rest.starts_with(b"OK") {
        RegReply::Ok
    } else if rest.starts_with(b"UNREG") {
        RegReply::Unreg
    } else if rest.starts_with(b"EXITING") {
        let text = String::from_utf8_lossy(rest);
        let rereg_after_secs = text
            .split_whitespace()
            .last()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);
        RegReply::Exiting { rereg_after_secs }
    } else {
        RegReply::Other(String::from_utf8_lossy(rest).into_owned())
    }
}

fn parse_info(body: &str) -> Result<InfoMessage, CodecError> {
    if let Some(msg) = body.strip_prefix("MSG:") {
        return Ok(InfoMessage::Msg(msg.to_string()));
    }
    if let Some(list) = body.strip_prefix("MACRO:") {
        return Ok(InfoMessage::Macro(parse_macro_list(list)));
    }
    if let Some(list) = body.strip_prefix("MENU:") {
        return Ok(InfoMessage::Menu(parse_macro_list(list)));
    }
    serde_json::from_str::<InfoStatus>(body)
        .map(InfoMessage::Status)
        .map_err(|e| CodecError::BadJson(e.to_string()))
}

/// `value,label|value,label|...`; an entry without a comma is its own label.
pub fn parse_macro_list(list: &str) -> Vec<MacroEntry> {
    list.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once(',') {
            Some((value, label)) => MacroEntry {
                value: value.trim().to_string(),
                label: label.trim().to_string(),
            },
            None => MacroEntry { value: item.to_string(), label: item.to_string() },
        })
        .collect()
}
