//! Codec boundary error types

use std::fmt;

/// Errors raised while turning bytes into a structured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends before the field (or the claimed remaining length) does
    InsufficientData,
    /// Packet type nibble 0
    InvalidPacketType(u8),
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    /// Remaining length above the configured maximum
    PacketTooLarge,
    /// Fixed-header flags do not match the packet type
    InvalidFlags,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidPropertyId(u8),
    /// A property that may appear once appeared twice
    DuplicateProperty(u8),
    InvalidReasonCode(u8),
    InvalidRetainHandling(u8),
    /// Reserved bits set in a subscription options byte
    InvalidSubscriptionOptions,
    ZeroSubscriptionIdentifier,
    /// `+` or `#` inside a PUBLISH topic name
    WildcardInTopicName,
    ZeroPacketId,
    MalformedPacket(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidFlags => write!(f, "invalid fixed header flags"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {:#04x}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {:#04x}", id),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {:#04x}", r),
            Self::InvalidRetainHandling(v) => write!(f, "invalid retain handling: {}", v),
            Self::InvalidSubscriptionOptions => write!(f, "reserved subscription option bits set"),
            Self::ZeroSubscriptionIdentifier => write!(f, "subscription identifier cannot be 0"),
            Self::WildcardInTopicName => write!(f, "topic name contains wildcard"),
            Self::ZeroPacketId => write!(f, "packet identifier cannot be 0"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while serializing a structured packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length does not fit a variable byte integer
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
    /// QoS > 0 PUBLISH without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
            Self::MissingPacketId => write!(f, "packet identifier required for QoS > 0"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Classified protocol failure reported up from the codec boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// Well-formed packet that is not allowed in the current state
    Unexpected(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Unexpected(what) => write!(f, "unexpected packet: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
