//! QoS acknowledgements
//!
//! PUBACK and PUBCOMP finish a delivery on the pipe that sent them.
//! PUBREC is turned into PUBREL in place and sent back. PUBREL from a
//! publisher releases its held QoS 2 id and is answered with PUBCOMP.

use tracing::{debug, trace};

use super::{EngineError, Work};
use crate::codec::Decoder;
use crate::protocol::{Ack, Packet, ReasonCode};
use crate::registry::Completion;
use crate::transport::{ConnParams, Message};
use crate::PipeId;

impl Work {
    pub(super) fn handle_ack(&mut self, pipe: PipeId, ack: Ack) {
        let id = ack.packet_id;
        if let Some(dest) = self.source_pipe(pipe) {
            dest.complete_inflight(id);
        }

        let record = self.socket.registry().pending(pipe, id);
        match self.socket.registry().ack_pending(pipe, id) {
            Completion::Done => {
                if let Some(record) = record {
                    debug!(
                        pipe,
                        packet_id = id,
                        publisher = record.publisher,
                        source_packet_id = record.source_packet_id,
                        targets = record.total(),
                        "delivery acknowledged by every target"
                    );
                }
            }
            Completion::Progress => trace!(pipe, packet_id = id, "delivery acknowledged"),
            Completion::Ignored => trace!(pipe, packet_id = id, "ack for unknown packet id"),
        }
    }

    pub(super) fn handle_pubrec(&mut self, mut msg: Message, conn: &ConnParams) -> Result<(), EngineError> {
        let pipe = msg.pipe();
        let mut decoder = Decoder::for_version(conn.protocol_version);
        let Packet::PubRec(ack) = decoder.decode_frame(msg.first_byte(), msg.body())? else {
            return Ok(());
        };

        // a v5 receiver refusing the message ends the exchange here
        if !ack.reason_code.is_success() {
            debug!(pipe, packet_id = ack.packet_id, reason = %ack.reason_code, "PUBREC refused delivery");
            self.handle_ack(pipe, ack);
            return Ok(());
        }

        let Some(id) = msg.rewrite_pubrec() else {
            return Ok(());
        };
        let pubrel = msg.into_frame().freeze();
        let known = self
            .source_pipe(pipe)
            .is_some_and(|dest| dest.release_inflight(id, pubrel.clone()));
        if !known {
            trace!(pipe, packet_id = id, "PUBREC for unknown packet id");
        }
        self.queue(pipe, pubrel);
        Ok(())
    }

    pub(super) fn handle_pubrel(
        &mut self,
        pipe: PipeId,
        conn: &ConnParams,
        ack: Ack,
    ) -> Result<(), EngineError> {
        let held = self
            .source_pipe(pipe)
            .is_some_and(|source| source.release_qos2(ack.packet_id));

        let reason = if held {
            ReasonCode::Success
        } else {
            trace!(pipe, packet_id = ack.packet_id, "PUBREL for unknown packet id");
            ReasonCode::PacketIdNotFound
        };
        self.reply(pipe, conn, &Packet::PubComp(Ack::with_reason(ack.packet_id, reason)))
    }
}
