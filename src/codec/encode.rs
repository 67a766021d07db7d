//! Packet encoder
//!
//! Writes structured packets in the layout of the connection's protocol
//! version. v5-only fields are silently left out on v3.1.1. Acks use the
//! shortest form the v5 rules allow, so decoding then re-encoding a packet
//! reproduces the same bytes.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Ack, ConnAck, Connect, Disconnect, EncodeError, Packet, PacketType, Properties,
    ProtocolVersion, Publish, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

#[derive(Debug, Clone)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
    max_packet_size: usize,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    /// Refuse to emit frames whose remaining length exceeds `size`.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version.is_v5()
    }

    /// Append one encoded packet to `buf`.
    ///
    /// On error `buf` is left as it was.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let first_byte = match packet {
            Packet::Connect(p) => {
                self.encode_connect(p, &mut body)?;
                0x10
            }
            Packet::ConnAck(p) => {
                self.encode_connack(p, &mut body)?;
                0x20
            }
            Packet::Publish(p) => return self.encode_publish(p, buf),
            Packet::PubAck(p) => self.ack(PacketType::PubAck, p, &mut body)?,
            Packet::PubRec(p) => self.ack(PacketType::PubRec, p, &mut body)?,
            Packet::PubRel(p) => self.ack(PacketType::PubRel, p, &mut body)?,
            Packet::PubComp(p) => self.ack(PacketType::PubComp, p, &mut body)?,
            Packet::Subscribe(p) => {
                self.encode_subscribe(p, &mut body)?;
                0x82
            }
            Packet::SubAck(p) => {
                self.encode_suback(p, &mut body)?;
                0x90
            }
            Packet::Unsubscribe(p) => {
                self.encode_unsubscribe(p, &mut body)?;
                0xA2
            }
            Packet::UnsubAck(p) => {
                self.encode_unsuback(p, &mut body)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(p) => {
                self.encode_disconnect(p, &mut body)?;
                0xE0
            }
        };
        self.frame(first_byte, &body, buf)
    }

    /// Encode a packet into a fresh buffer.
    pub fn encode_to_vec(&self, packet: &Packet) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf)
    }

    fn frame(&self, first_byte: u8, body: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
        if body.len() > self.max_packet_size {
            return Err(EncodeError::PacketTooLarge);
        }
        buf.reserve(1 + 4 + body.len());
        buf.put_u8(first_byte);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(body);
        Ok(())
    }

    fn properties(&self, props: &Properties, body: &mut BytesMut) -> Result<(), EncodeError> {
        if self.is_v5() {
            props.encode(body)?;
        }
        Ok(())
    }

    fn encode_connect(&self, packet: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, "MQTT")?;
        body.put_u8(self.protocol_version as u8);

        let mut flags = 0u8;
        if packet.clean_start {
            flags |= 0x02;
        }
        if let Some(will) = &packet.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(packet.keep_alive);
        self.properties(&packet.properties, body)?;

        write_string(body, &packet.client_id)?;
        if let Some(will) = &packet.will {
            self.properties(&will.properties, body)?;
            write_string(body, &will.topic)?;
            write_binary(body, &will.payload)?;
        }
        if let Some(username) = &packet.username {
            write_string(body, username)?;
        }
        if let Some(password) = &packet.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(packet.session_present as u8);
        if self.is_v5() {
            body.put_u8(packet.reason_code as u8);
        } else {
            body.put_u8(packet.reason_code.to_v3_connack_code());
        }
        self.properties(&packet.properties, body)
    }

    /// PUBLISH is written straight into `buf` so the payload is copied once.
    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let packet_id = match (packet.qos.needs_ack(), packet.packet_id) {
            (true, None) => return Err(EncodeError::MissingPacketId),
            (true, id) => id,
            (false, _) => None,
        };

        let mut header = BytesMut::with_capacity(2 + packet.topic.len() + 8);
        write_string(&mut header, &packet.topic)?;
        if let Some(id) = packet_id {
            header.put_u16(id);
        }
        self.properties(&packet.properties, &mut header)?;

        let remaining = header.len() + packet.payload.len();
        if remaining > self.max_packet_size {
            return Err(EncodeError::PacketTooLarge);
        }

        let mut first_byte = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first_byte |= 0x08;
        }
        if packet.retain {
            first_byte |= 0x01;
        }

        buf.reserve(1 + 4 + remaining);
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining as u32)?;
        buf.put_slice(&header);
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn ack(&self, kind: PacketType, packet: &Ack, body: &mut BytesMut) -> Result<u8, EncodeError> {
        body.put_u16(packet.packet_id);
        if self.is_v5() {
            let has_props = !packet.properties.is_empty();
            if has_props || packet.reason_code != ReasonCode::Success {
                body.put_u8(packet.reason_code as u8);
            }
            if has_props {
                packet.properties.encode(body)?;
            }
        }
        let flags = kind.required_flags().unwrap_or(0);
        Ok(((kind as u8) << 4) | flags)
    }

    fn encode_subscribe(&self, packet: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(packet.packet_id);
        self.properties(&packet.properties, body)?;
        for entry in &packet.filters {
            write_string(body, &entry.filter)?;
            if self.is_v5() {
                body.put_u8(entry.options.to_byte());
            } else {
                body.put_u8(entry.options.qos as u8);
            }
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(packet.packet_id);
        self.properties(&packet.properties, body)?;
        for code in &packet.reason_codes {
            if self.is_v5() {
                body.put_u8(*code as u8);
            } else {
                body.put_u8(code.to_v3_suback_code());
            }
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        body.put_u16(packet.packet_id);
        self.properties(&packet.properties, body)?;
        for filter in &packet.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    /// v3.1.1 UNSUBACK is just the packet id.
    fn encode_unsuback(&self, packet: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(packet.packet_id);
        if self.is_v5() {
            packet.properties.encode(body)?;
            for code in &packet.reason_codes {
                body.put_u8(*code as u8);
            }
        }
        Ok(())
    }

    fn encode_disconnect(&self, packet: &Disconnect, body: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.is_v5() {
            return Ok(());
        }
        let has_props = !packet.properties.is_empty();
        if has_props || packet.reason_code != ReasonCode::Success {
            body.put_u8(packet.reason_code as u8);
        }
        if has_props {
            packet.properties.encode(body)?;
        }
        Ok(())
    }
}
