//! MQTT v5.0 property blocks
//!
//! A property block is a variable-byte-integer length followed by a
//! type-tagged sequence. Properties are kept in wire order so a decoded
//! block re-encodes to the same bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_binary, write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers (MQTT v5.0 table 2-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Wire representation of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        Some(match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        })
    }

    fn wire_type(self) -> WireType {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => WireType::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => WireType::TwoByte,
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval
            | MaximumPacketSize => WireType::FourByte,
            SubscriptionIdentifier => WireType::VarInt,
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString => WireType::Utf8,
            CorrelationData | AuthenticationData => WireType::Binary,
            UserProperty => WireType::Utf8Pair,
        }
    }

    /// Only user properties and subscription identifiers may repeat.
    fn repeatable(self) -> bool {
        matches!(
            self,
            PropertyId::UserProperty | PropertyId::SubscriptionIdentifier
        )
    }
}

/// Property payload, shaped by the identifier's wire type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByte(u16),
    FourByte(u32),
    VarInt(u32),
    Utf8(String),
    Binary(Bytes),
    Pair(String, String),
}

/// A single property. `value` must match the identifier's wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: PropertyId,
    pub value: PropertyValue,
}

impl Property {
    pub fn user(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: PropertyId::UserProperty,
            value: PropertyValue::Pair(key.into(), value.into()),
        }
    }

    pub fn subscription_identifier(id: u32) -> Self {
        Self {
            id: PropertyId::SubscriptionIdentifier,
            value: PropertyValue::VarInt(id),
        }
    }

    pub fn assigned_client_identifier(id: impl Into<String>) -> Self {
        Self {
            id: PropertyId::AssignedClientIdentifier,
            value: PropertyValue::Utf8(id.into()),
        }
    }

    pub fn reason_string(reason: impl Into<String>) -> Self {
        Self {
            id: PropertyId::ReasonString,
            value: PropertyValue::Utf8(reason.into()),
        }
    }

    /// Bytes on the wire including the identifier byte
    fn encoded_size(&self) -> usize {
        1 + match &self.value {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByte(_) => 2,
            PropertyValue::FourByte(_) => 4,
            PropertyValue::VarInt(v) => variable_int_len(*v),
            PropertyValue::Utf8(s) => 2 + s.len(),
            PropertyValue::Binary(b) => 2 + b.len(),
            PropertyValue::Pair(k, v) => 4 + k.len() + v.len(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        debug_assert!(self.matches_wire_type(), "property value shape mismatch");
        buf.put_u8(self.id as u8);
        match &self.value {
            PropertyValue::Byte(v) => buf.put_u8(*v),
            PropertyValue::TwoByte(v) => buf.put_u16(*v),
            PropertyValue::FourByte(v) => buf.put_u32(*v),
            PropertyValue::VarInt(v) => {
                write_variable_int(buf, *v)?;
            }
            PropertyValue::Utf8(s) => write_string(buf, s)?,
            PropertyValue::Binary(b) => write_binary(buf, b)?,
            PropertyValue::Pair(k, v) => {
                write_string(buf, k)?;
                write_string(buf, v)?;
            }
        }
        Ok(())
    }

    fn matches_wire_type(&self) -> bool {
        matches!(
            (self.id.wire_type(), &self.value),
            (WireType::Byte, PropertyValue::Byte(_))
                | (WireType::TwoByte, PropertyValue::TwoByte(_))
                | (WireType::FourByte, PropertyValue::FourByte(_))
                | (WireType::VarInt, PropertyValue::VarInt(_))
                | (WireType::Utf8, PropertyValue::Utf8(_))
                | (WireType::Binary, PropertyValue::Binary(_))
                | (WireType::Utf8Pair, PropertyValue::Pair(_, _))
        )
    }
}

/// Ordered property block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.0.iter().find(|p| p.id == id).map(|p| &p.value)
    }

    pub fn subscription_identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().filter_map(|p| match (p.id, &p.value) {
            (PropertyId::SubscriptionIdentifier, PropertyValue::VarInt(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|p| match &p.value {
            PropertyValue::Pair(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }

    /// Drop every property with the given identifier.
    pub fn remove(&mut self, id: PropertyId) {
        self.0.retain(|p| p.id != id);
    }

    /// Size of the sequence, excluding the length prefix
    pub fn encoded_size(&self) -> usize {
        self.0.iter().map(Property::encoded_size).sum()
    }

    /// Size including the variable-byte-integer length prefix
    pub fn block_size(&self) -> usize {
        let len = self.encoded_size();
        variable_int_len(len as u32) + len
    }

    /// Write the length prefix and every property.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;
        for property in &self.0 {
            property.encode(buf)?;
        }
        Ok(())
    }

    /// Read a property block. Returns the block and bytes consumed
    /// (length prefix included).
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (len, prefix) = read_variable_int(buf)?;
        let end = prefix + len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let block = &buf[prefix..end];
        let mut props = Properties::new();
        let mut pos = 0;

        while pos < block.len() {
            let (raw_id, id_len) = read_variable_int(&block[pos..])?;
            pos += id_len;
            let id = u8::try_from(raw_id)
                .ok()
                .and_then(PropertyId::from_u8)
                .ok_or(DecodeError::InvalidPropertyId(raw_id as u8))?;

            if !id.repeatable() && props.0.iter().any(|p| p.id == id) {
                return Err(DecodeError::DuplicateProperty(id as u8));
            }

            let rest = &block[pos..];
            let (value, used) = match id.wire_type() {
                WireType::Byte => {
                    let v = *rest.first().ok_or(DecodeError::InsufficientData)?;
                    (PropertyValue::Byte(v), 1)
                }
                WireType::TwoByte => (PropertyValue::TwoByte(read_u16(rest)?), 2),
                WireType::FourByte => (PropertyValue::FourByte(read_u32(rest)?), 4),
                WireType::VarInt => {
                    let (v, n) = read_variable_int(rest)?;
                    (PropertyValue::VarInt(v), n)
                }
                WireType::Utf8 => {
                    let (s, n) = read_string(rest)?;
                    (PropertyValue::Utf8(s.to_string()), n)
                }
                WireType::Binary => {
                    let (b, n) = read_binary(rest)?;
                    (PropertyValue::Binary(Bytes::copy_from_slice(b)), n)
                }
                WireType::Utf8Pair => {
                    let (k, kn) = read_string(rest)?;
                    let (v, vn) = read_string(&rest[kn..])?;
                    (PropertyValue::Pair(k.to_string(), v.to_string()), kn + vn)
                }
            };
            pos += used;

            match (id, &value) {
                (PropertyId::SubscriptionIdentifier, PropertyValue::VarInt(0)) => {
                    return Err(DecodeError::ZeroSubscriptionIdentifier);
                }
                (PropertyId::ReceiveMaximum, PropertyValue::TwoByte(0)) => {
                    return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                }
                (PropertyId::MaximumPacketSize, PropertyValue::FourByte(0)) => {
                    return Err(DecodeError::MalformedPacket(
                        "maximum packet size cannot be 0",
                    ));
                }
                _ => {}
            }

            props.0.push(Property { id, value });
        }

        Ok((props, end))
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Properties(iter.into_iter().collect())
    }
}
