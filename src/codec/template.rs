//! Pre-serialized PUBLISH for fan-out
//!
//! The topic, properties and payload are laid out once per protocol
//! version. Each target then gets a copy with its own first byte and
//! packet identifier patched in; targets at QoS 0 get the same bytes with
//! the identifier slot spliced out.

use bytes::{BufMut, Bytes, BytesMut};

use super::{variable_int_len, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{EncodeError, ProtocolVersion, Publish, QoS};

#[derive(Debug, Clone)]
pub struct PublishTemplate {
    protocol_version: ProtocolVersion,
    /// Variable header and payload with a two byte packet id slot
    body: Bytes,
    /// Offset of the packet id slot within `body`
    id_offset: usize,
}

impl PublishTemplate {
    pub fn new(publish: &Publish, protocol_version: ProtocolVersion) -> Result<Self, EncodeError> {
        let props_len = if protocol_version.is_v5() {
            publish.properties.block_size()
        } else {
            0
        };
        let len = 2 + publish.topic.len() + 2 + props_len + publish.payload.len();
        if len > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        let mut body = BytesMut::with_capacity(len);
        write_string(&mut body, &publish.topic)?;
        let id_offset = body.len();
        body.put_u16(0);
        if protocol_version.is_v5() {
            publish.properties.encode(&mut body)?;
        }
        body.put_slice(&publish.payload);

        Ok(Self {
            protocol_version,
            body: body.freeze(),
            id_offset,
        })
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Frame size for a target at `qos`.
    pub fn frame_len(&self, qos: QoS) -> usize {
        let remaining = self.remaining_len(qos);
        1 + variable_int_len(remaining as u32) + remaining
    }

    fn remaining_len(&self, qos: QoS) -> usize {
        if qos.needs_ack() {
            self.body.len()
        } else {
            self.body.len() - 2
        }
    }

    /// Append the frame for one target.
    ///
    /// `packet_id` is required when `qos > 0` and ignored otherwise.
    pub fn write_to(
        &self,
        buf: &mut BytesMut,
        qos: QoS,
        packet_id: Option<u16>,
        retain: bool,
        dup: bool,
    ) -> Result<(), EncodeError> {
        let mut first_byte = 0x30 | ((qos as u8) << 1);
        if dup {
            first_byte |= 0x08;
        }
        if retain {
            first_byte |= 0x01;
        }

        buf.reserve(self.frame_len(qos));
        buf.put_u8(first_byte);
        write_variable_int(buf, self.remaining_len(qos) as u32)?;

        if qos.needs_ack() {
            let id = packet_id.ok_or(EncodeError::MissingPacketId)?;
            let start = buf.len() + self.id_offset;
            buf.extend_from_slice(&self.body);
            buf[start..start + 2].copy_from_slice(&id.to_be_bytes());
        } else {
            buf.extend_from_slice(&self.body[..self.id_offset]);
            buf.extend_from_slice(&self.body[self.id_offset + 2..]);
        }
        Ok(())
    }

    /// Convenience wrapper returning a fresh frame.
    pub fn render(
        &self,
        qos: QoS,
        packet_id: Option<u16>,
        retain: bool,
        dup: bool,
    ) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.frame_len(qos));
        self.write_to(&mut buf, qos, packet_id, retain, dup)?;
        Ok(buf.freeze())
    }
}
