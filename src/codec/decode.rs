//! Packet decoder
//!
//! Turns one framed packet into a [`Packet`]. The negotiated protocol
//! version decides whether reason codes and property blocks are read;
//! before CONNECT has been seen the decoder assumes v3.1.1.

use std::sync::Arc;

use bytes::Bytes;

use super::{peek_frame, read_binary, read_string, read_u16, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Ack, ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties,
    ProtocolVersion, Publish, QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter,
    SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};

#[derive(Debug, Clone)]
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn for_version(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: Some(version),
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode the packet at the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the
    /// packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(header) = peek_frame(buf, self.max_packet_size)? else {
            return Ok(None);
        };
        let body = &buf[header.header_len..header.frame_len()];
        let packet = self.decode_frame(header.first_byte, body)?;
        Ok(Some((packet, header.frame_len())))
    }

    /// Decode a frame whose fixed header has already been split off.
    pub fn decode_frame(&mut self, first_byte: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_type =
            PacketType::of_header(first_byte).ok_or(DecodeError::InvalidPacketType(0))?;
        let flags = first_byte & 0x0F;

        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(DecodeError::InvalidFlags);
            }
        }

        match packet_type {
            PacketType::Connect => self.decode_connect(body),
            PacketType::ConnAck => self.decode_connack(body),
            PacketType::Publish => self.decode_publish(flags, body),
            PacketType::PubAck => self.decode_ack(body).map(Packet::PubAck),
            PacketType::PubRec => self.decode_ack(body).map(Packet::PubRec),
            PacketType::PubRel => self.decode_ack(body).map(Packet::PubRel),
            PacketType::PubComp => self.decode_ack(body).map(Packet::PubComp),
            PacketType::Subscribe => self.decode_subscribe(body),
            PacketType::SubAck => self.decode_suback(body),
            PacketType::Unsubscribe => self.decode_unsubscribe(body),
            PacketType::UnsubAck => self.decode_unsuback(body),
            PacketType::PingReq => expect_empty(body).map(|_| Packet::PingReq),
            PacketType::PingResp => expect_empty(body).map(|_| Packet::PingResp),
            PacketType::Disconnect => self.decode_disconnect(body),
            PacketType::Auth => Err(DecodeError::InvalidPacketType(PacketType::Auth as u8)),
        }
    }

    /// Read a v5 property block at `pos`, or nothing on v3.1.1.
    fn properties_at(&self, body: &[u8], pos: &mut usize) -> Result<Properties, DecodeError> {
        if !self.is_v5() {
            return Ok(Properties::default());
        }
        let (props, used) = Properties::decode(&body[*pos..])?;
        *pos += used;
        Ok(props)
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let (name, mut pos) = read_string(body)?;
        if name != "MQTT" && name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        let protocol_version =
            ProtocolVersion::from_level(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(protocol_version);
        pos += 1;

        let flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if flags & 0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let will_flag = flags & 0x04 != 0;
        let will_qos = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        if !self.is_v5() && password_flag && !username_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let properties = self.properties_at(body, &mut pos)?;

        let (client_id, used) = read_string(&body[pos..])?;
        pos += used;

        let will = if will_flag {
            let will_properties = self.properties_at(body, &mut pos)?;
            let (topic, used) = read_string(&body[pos..])?;
            pos += used;
            let (payload, used) = read_binary(&body[pos..])?;
            pos += used;
            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, used) = read_string(&body[pos..])?;
            pos += used;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, used) = read_binary(&body[pos..])?;
            pos += used;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        expect_consumed(body, pos)?;

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_start: flags & 0x02 != 0,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let [ack_flags, code, ..] = *body else {
            return Err(DecodeError::InsufficientData);
        };
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 2;
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::from_v3_connack_code(code)
        };
        let properties = self.properties_at(body, &mut pos)?;
        expect_consumed(body, pos)?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP set on QoS 0 publish"));
        }

        let (topic, mut pos) = read_string(body)?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::WildcardInTopicName);
        }

        let packet_id = if qos.needs_ack() {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::ZeroPacketId);
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let properties = self.properties_at(body, &mut pos)?;

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            properties,
        }))
    }

    /// PUBACK / PUBREC / PUBREL / PUBCOMP.
    ///
    /// On v5 the reason code may be omitted (remaining length 2, success)
    /// and the property block may be omitted after it.
    fn decode_ack(&self, body: &[u8]) -> Result<Ack, DecodeError> {
        let packet_id = read_u16(body)?;

        if !self.is_v5() {
            expect_consumed(body, 2)?;
            return Ok(Ack::new(packet_id));
        }

        let Some(&code) = body.get(2) else {
            return Ok(Ack::new(packet_id));
        };
        let reason_code = ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;

        let mut pos = 3;
        let properties = if body.len() > pos {
            self.properties_at(body, &mut pos)?
        } else {
            Properties::default()
        };
        expect_consumed(body, pos)?;

        Ok(Ack {
            packet_id,
            reason_code,
            properties,
        })
    }

    fn decode_subscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = nonzero_packet_id(body)?;
        let mut pos = 2;
        let properties = self.properties_at(body, &mut pos)?;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, used) = read_string(&body[pos..])?;
            pos += used;
            let byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;

            let options = if self.is_v5() {
                SubscriptionOptions::from_byte(byte)?
            } else {
                if byte & 0xFC != 0 {
                    return Err(DecodeError::InvalidSubscriptionOptions);
                }
                let qos = QoS::from_u8(byte).ok_or(DecodeError::InvalidQoS(byte))?;
                SubscriptionOptions::with_qos(qos)
            };

            filters.push(SubscribeFilter {
                filter: filter.to_string(),
                options,
            });
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let properties = self.properties_at(body, &mut pos)?;

        let reason_codes = body[pos..]
            .iter()
            .map(|&code| {
                if self.is_v5() {
                    ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))
                } else {
                    Ok(ReasonCode::from_v3_suback_code(code))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = nonzero_packet_id(body)?;
        let mut pos = 2;
        let properties = self.properties_at(body, &mut pos)?;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, used) = read_string(&body[pos..])?;
            pos += used;
            filters.push(filter.to_string());
        }
        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without topic filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let packet_id = read_u16(body)?;
        if !self.is_v5() {
            expect_consumed(body, 2)?;
            return Ok(Packet::UnsubAck(UnsubAck {
                packet_id,
                reason_codes: Vec::new(),
                properties: Properties::default(),
            }));
        }

        let mut pos = 2;
        let properties = self.properties_at(body, &mut pos)?;
        let reason_codes = body[pos..]
            .iter()
            .map(|&code| ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        if !self.is_v5() || body.is_empty() {
            expect_empty(body)?;
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let code = body[0];
        let reason_code = ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
        let mut pos = 1;
        let properties = if body.len() > pos {
            self.properties_at(body, &mut pos)?
        } else {
            Properties::default()
        };
        expect_consumed(body, pos)?;

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }
}

fn nonzero_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    match read_u16(body)? {
        0 => Err(DecodeError::ZeroPacketId),
        id => Ok(id),
    }
}

fn expect_empty(body: &[u8]) -> Result<(), DecodeError> {
    expect_consumed(body, 0)
}

fn expect_consumed(body: &[u8], pos: usize) -> Result<(), DecodeError> {
    if body.len() != pos {
        return Err(DecodeError::MalformedPacket("unexpected trailing bytes"));
    }
    Ok(())
}
