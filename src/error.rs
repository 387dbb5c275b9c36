//! Error types for the USRP wire codec.
//!
//! Every decoder in the crate returns [`CodecError`] on bad input. The RX
//! loop logs these and moves on to the next datagram, so none of them is
//! ever fatal.

/// Reasons a datagram (or a record embedded in one) could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Fewer bytes than the fixed structure needs.
    #[error("datagram too short: {len} bytes, need {need}")]
    TooShort { len: usize, need: usize },

    /// First four bytes are not `USRP`.
    #[error("bad eye-catcher {0:02x?}")]
    BadEyeCatcher([u8; 4]),

    /// Header `type` field outside the known packet types.
    #[error("unknown packet type {0}")]
    UnknownPacketType(i32),

    /// TLV tag byte outside the known tags.
    #[error("unknown TLV tag {0}")]
    UnknownTlvTag(u8),

    /// TLV length byte runs past the end of the payload.
    #[error("TLV value truncated: declared {declared}, have {available}")]
    Truncated { declared: usize, available: usize },

    /// TLV values are limited to 255 bytes by the one-byte length field.
    #[error("TLV value too long: {0} bytes")]
    ValueTooLong(usize),

    /// TEXT payload without a recognised prefix or embedded record.
    #[error("unrecognised text payload {0:?}")]
    UnknownText(String),

    /// INFO body that is neither a known keyword nor valid status JSON.
    #[error("bad INFO json: {0}")]
    BadJson(String),

    /// File-transfer sub-command byte outside the known set.
    #[error("unknown file-transfer sub-command {0}")]
    UnknownFileCommand(u8),
}
