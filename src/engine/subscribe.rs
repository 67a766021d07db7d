//! SUBSCRIBE and UNSUBSCRIBE

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use super::publish::Target;
use super::{EngineError, Work};
use crate::protocol::{
    Packet, Properties, QoS, ReasonCode, RetainHandling, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::registry::TopicEntry;
use crate::topic::{validate_topic_filter, InsertOutcome, RetainedMessage, Subscriber};
use crate::transport::{ConnParams, TransportError};
use crate::PipeId;

impl Work {
    pub(super) fn handle_subscribe(
        &mut self,
        pipe: PipeId,
        conn: &ConnParams,
        subscribe: Subscribe,
    ) -> Result<(), EngineError> {
        let source = self
            .source_pipe(pipe)
            .ok_or(TransportError::NoSuchPipe(pipe))?;
        let trie = self.socket.trie().clone();
        let registry = self.socket.registry().clone();
        let subscription_id = subscribe.subscription_id();

        let mut codes: SmallVec<[ReasonCode; 8]> = SmallVec::new();
        let mut added: SmallVec<[Arc<str>; 8]> = SmallVec::new();
        let mut retained: Vec<(RetainedMessage, QoS)> = Vec::new();

        for request in &subscribe.filters {
            if let Err(reason) = validate_topic_filter(&request.filter) {
                debug!(pipe, filter = %request.filter, reason, "invalid topic filter");
                codes.push(if conn.protocol_version.is_v5() {
                    ReasonCode::TopicFilterInvalid
                } else {
                    ReasonCode::UnspecifiedError
                });
                continue;
            }

            let filter: Arc<str> = Arc::from(request.filter.as_str());
            let subscriber = Subscriber {
                client_id: conn.client_id.clone(),
                pipe,
                options: request.options,
                subscription_id,
            };
            let outcome = match trie.insert_subscriber(&filter, subscriber) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.rollback_subscribe(pipe, conn, &added);
                    return Err(e.into());
                }
            };

            let is_new = match outcome {
                InsertOutcome::Duplicate => {
                    debug!(
                        pipe,
                        client_id = %conn.client_id,
                        filter = %filter,
                        "client already subscribed from another pipe"
                    );
                    codes.push(ReasonCode::UnspecifiedError);
                    continue;
                }
                InsertOutcome::Added { .. } => true,
                InsertOutcome::Replaced => false,
            };

            registry.add_topic(
                &conn.client_id,
                TopicEntry {
                    filter: filter.clone(),
                    pipe,
                    options: request.options,
                    subscription_id,
                },
            );
            source.note_subscribed(&filter);
            if is_new {
                added.push(filter.clone());
            }
            codes.push(ReasonCode::granted(request.options.qos));

            let send_retained = match request.options.retain_handling {
                RetainHandling::SendAtSubscribe => true,
                RetainHandling::SendIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
            if send_retained && self.settings.retain_available {
                retained.extend(
                    trie.search_retain_msg(&filter)
                        .into_iter()
                        .map(|msg| (msg, request.options.qos)),
                );
            }
        }

        let suback = Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes: codes.into_vec(),
            properties: Properties::default(),
        });
        if let Err(e) = self.reply(pipe, conn, &suback) {
            self.rollback_subscribe(pipe, conn, &added);
            return Err(e);
        }

        debug!(
            pipe,
            client_id = %conn.client_id,
            filters = subscribe.filters.len(),
            retained = retained.len(),
            "subscribed"
        );

        for (msg, sub_qos) in retained {
            let target = Target {
                pipe,
                qos: msg.qos.downgrade(sub_qos),
                retain: true,
                subscription_ids: subscription_id.into_iter().collect(),
            };
            self.fan_out(pipe, subscribe.packet_id, &msg.publish, std::iter::once(target))?;
        }
        Ok(())
    }

    /// Undo the subscriptions this packet created.
    fn rollback_subscribe(&self, pipe: PipeId, conn: &ConnParams, added: &[Arc<str>]) {
        let source = self.source_pipe(pipe);
        for filter in added {
            self.socket.trie().delete_client(filter, &conn.client_id, Some(pipe));
            self.socket
                .registry()
                .remove_topic(&conn.client_id, filter, pipe);
            if let Some(source) = &source {
                source.forget_subscribed(filter);
            }
        }
        if !added.is_empty() {
            debug!(pipe, client_id = %conn.client_id, count = added.len(), "subscribe rolled back");
        }
    }

    pub(super) fn handle_unsubscribe(
        &mut self,
        pipe: PipeId,
        conn: &ConnParams,
        unsubscribe: Unsubscribe,
    ) -> Result<(), EngineError> {
        let source = self.source_pipe(pipe);
        let registry = self.socket.registry().clone();
        let trie = self.socket.trie().clone();

        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                if registry.remove_topic(&conn.client_id, filter, pipe) {
                    trie.delete_client(filter, &conn.client_id, Some(pipe));
                    if let Some(source) = &source {
                        source.forget_subscribed(filter);
                    }
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect();

        debug!(pipe, client_id = %conn.client_id, filters = unsubscribe.filters.len(), "unsubscribed");

        self.reply(
            pipe,
            conn,
            &Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
                reason_codes,
                properties: Properties::default(),
            }),
        )
    }
}
