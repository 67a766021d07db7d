//! PUBLISH handling and fan-out

use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{EngineError, Outbound, Work};
use crate::codec::{Encoder, PublishTemplate};
use crate::protocol::{
    Ack, DecodeError, Packet, PropertyId, Property, ProtocolVersion, Publish, QoS,
};
use crate::registry::{DeliveryEntry, PendingDelivery};
use crate::topic::{validate_topic_name, RetainedMessage};
use crate::transport::{ConnParams, TransportError};
use crate::PipeId;

/// One delivery of a fan-out
#[derive(Debug, Clone)]
pub(super) struct Target {
    pub pipe: PipeId,
    pub qos: QoS,
    pub retain: bool,
    pub subscription_ids: SmallVec<[u32; 2]>,
}

/// Lazily built per-version templates for one fan-out
#[derive(Default)]
struct Templates {
    v311: Option<PublishTemplate>,
    v5: Option<PublishTemplate>,
}

impl Templates {
    fn get(&mut self, publish: &Publish, version: ProtocolVersion) -> Result<&PublishTemplate, EngineError> {
        let slot = match version {
            ProtocolVersion::V311 => &mut self.v311,
            ProtocolVersion::V5 => &mut self.v5,
        };
        let template = match slot.take() {
            Some(template) => template,
            None => PublishTemplate::new(publish, version)?,
        };
        Ok(slot.insert(template))
    }
}

impl Work {
    pub(super) fn handle_publish(
        &mut self,
        pipe: PipeId,
        conn: &ConnParams,
        mut publish: Publish,
    ) -> Result<(), EngineError> {
        validate_topic_name(&publish.topic).map_err(DecodeError::MalformedPacket)?;

        let source = self
            .source_pipe(pipe)
            .ok_or(TransportError::NoSuchPipe(pipe))?;

        let source_id = publish.packet_id.unwrap_or(0);
        match publish.qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                self.reply(pipe, conn, &Packet::PubAck(Ack::new(source_id)))?;
            }
            QoS::ExactlyOnce => {
                let first = source.hold_qos2(source_id);
                self.reply(pipe, conn, &Packet::PubRec(Ack::new(source_id)))?;
                if !first {
                    debug!(pipe, packet_id = source_id, "QoS 2 publish retransmitted, not forwarded again");
                    return Ok(());
                }
            }
        }

        // per-target properties are added back during fan-out
        publish.properties.remove(PropertyId::SubscriptionIdentifier);
        publish.properties.remove(PropertyId::TopicAlias);
        publish.dup = false;

        if publish.retain && self.settings.retain_available {
            let slot = if publish.payload.is_empty() {
                None
            } else {
                let mut stored = publish.clone();
                stored.packet_id = None;
                Some(RetainedMessage::new(stored))
            };
            let clearing = slot.is_none();
            self.socket.trie().retain(&publish.topic, slot)?;
            trace!(pipe, topic = %publish.topic, clearing, "retained message updated");
        }

        let matches = self.socket.trie().search_client(&publish.topic, Some(pipe));
        trace!(
            pipe,
            client_id = %conn.client_id,
            topic = %publish.topic,
            qos = ?publish.qos,
            subscribers = matches.len(),
            "publish"
        );

        let targets = matches.into_iter().map(|m| Target {
            pipe: m.pipe,
            qos: publish.qos.downgrade(m.qos),
            retain: publish.retain && m.retain_as_published,
            subscription_ids: m.subscription_ids,
        });
        self.fan_out(pipe, source_id, &publish, targets)
    }

    /// Encode `publish` once per protocol version and queue it for every
    /// target. QoS 1/2 targets get an outbound packet id on their pipe, an
    /// inflight entry and a key in the pending-delivery table.
    pub(super) fn fan_out(
        &mut self,
        publisher: PipeId,
        source_id: u16,
        publish: &Publish,
        targets: impl IntoIterator<Item = Target>,
    ) -> Result<(), EngineError> {
        let mut templates = Templates::default();
        let mut entries: Vec<DeliveryEntry> = Vec::new();
        let mut frames: SmallVec<[Outbound; 8]> = SmallVec::new();

        for target in targets {
            let Some(dest) = self.socket.pipe(target.pipe) else {
                trace!(pipe = target.pipe, "subscriber pipe gone, skipping");
                continue;
            };
            let version = dest.conn().protocol_version;

            let packet_id = if target.qos.needs_ack() {
                match dest.alloc_packet_id() {
                    Some(id) => Some(id),
                    None => {
                        warn!(pipe = target.pipe, "no free packet identifier, delivery skipped");
                        continue;
                    }
                }
            } else {
                None
            };

            let encoded = if version.is_v5() && !target.subscription_ids.is_empty() {
                encode_with_ids(publish, &target, packet_id, version)
            } else {
                templates
                    .get(publish, version)
                    .and_then(|t| {
                        t.render(target.qos, packet_id, target.retain, false)
                            .map_err(EngineError::from)
                    })
            };
            let frame = match encoded {
                Ok(frame) => frame,
                Err(e) => {
                    self.unwind(&entries);
                    return Err(e);
                }
            };

            if let Some(id) = packet_id {
                dest.track_inflight(id, frame.clone());
            }
            entries.push(DeliveryEntry::publish(target.pipe, target.qos, packet_id));
            frames.push(Outbound {
                pipe: target.pipe,
                frame,
            });
        }

        if entries.iter().any(|e| !e.finished) {
            let record = Arc::new(PendingDelivery::new(publisher, source_id, entries.clone()));
            let registry = self.socket.registry();
            for entry in &entries {
                let Some(id) = entry.packet_id else {
                    continue;
                };
                if let Err(e) = registry.insert_pending((entry.pipe, id), record.clone()) {
                    self.unwind(&entries);
                    return Err(e.into());
                }
            }
            self.delivery = Some(record);
        }

        self.outbound.extend(frames);
        Ok(())
    }

    /// Forget the inflight and pending state of deliveries that were never
    /// sent.
    fn unwind(&self, entries: &[DeliveryEntry]) {
        for entry in entries {
            let Some(id) = entry.packet_id else {
                continue;
            };
            self.socket.registry().ack_pending(entry.pipe, id);
            if let Some(dest) = self.socket.pipe(entry.pipe) {
                dest.complete_inflight(id);
            }
        }
    }
}

/// v5 delivery carrying the matching subscriptions' identifiers.
fn encode_with_ids(
    publish: &Publish,
    target: &Target,
    packet_id: Option<u16>,
    version: ProtocolVersion,
) -> Result<Bytes, EngineError> {
    let mut copy = publish.clone();
    copy.qos = target.qos;
    copy.retain = target.retain;
    copy.dup = false;
    copy.packet_id = packet_id;
    for id in &target.subscription_ids {
        copy.properties.push(Property::subscription_identifier(*id));
    }
    let frame = Encoder::new(version).encode_to_vec(&Packet::Publish(copy))?;
    Ok(frame.freeze())
}
