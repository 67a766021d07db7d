use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::codec::peek_frame;
use crate::policy::{AbortPolicy, RejectPolicy, SharedPolicy};
use crate::protocol::{
    Ack, ProtocolVersion, Publish, QoS, ReasonCode, RetainHandling, SubAck, Subscribe,
    SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe,
};
use crate::protocol::{Properties, Property};
use crate::registry::Registry;
use crate::topic::SubscriptionTrie;
use crate::transport::{Pipe, Stage, TransportSettings};

struct Client {
    id: PipeId,
    version: ProtocolVersion,
    pipe: Arc<Pipe>,
    rx: mpsc::Receiver<Bytes>,
}

struct Harness {
    socket: Arc<Socket>,
    work: Work,
}

impl Harness {
    fn new() -> Self {
        Self::build(0, 0, Arc::new(AbortPolicy), EngineSettings::default())
    }

    fn build(max_nodes: usize, max_pending: usize, policy: SharedPolicy, settings: EngineSettings) -> Self {
        let socket = Socket::new(
            TransportSettings::default(),
            Arc::new(Registry::new(max_pending, policy.clone())),
            Arc::new(SubscriptionTrie::new(max_nodes, policy.clone())),
            policy,
        );
        let work = Work::new(0, socket.clone(), Arc::new(settings));
        Self { socket, work }
    }

    fn connect(&self, id: PipeId, client_id: &str, version: ProtocolVersion) -> Client {
        let conn = ConnParams {
            protocol_version: version,
            client_id: Arc::from(client_id),
            keep_alive: 0,
            clean_start: true,
            username: None,
        };
        let (pipe, rx) = self.socket.attach(id, conn).unwrap();
        self.socket.registry().bind(id, Arc::from(client_id));
        Client {
            id,
            version,
            pipe,
            rx,
        }
    }

    /// Run one inbound packet through the state machine.
    async fn feed(&mut self, client: &Client, packet: Packet) {
        let frame = Encoder::new(client.version).encode_to_vec(&packet).unwrap();
        self.feed_raw(client, &frame).await;
    }

    async fn feed_raw(&mut self, client: &Client, bytes: &[u8]) {
        self.deliver(client, bytes);
        self.pump().await;
        assert!(!client.pipe.in_engine());
    }

    fn deliver(&self, client: &Client, bytes: &[u8]) {
        let header = peek_frame(bytes, usize::MAX).unwrap().unwrap();
        let msg = Message::new(client.pipe.clone(), BytesMut::from(bytes), header.header_len);
        self.socket.deliver(msg).unwrap();
    }

    async fn pump(&mut self) {
        self.take().await;
        self.pump_current().await;
    }

    /// Let the context take the next delivered message.
    async fn take(&mut self) {
        if self.work.state() == WorkState::Init {
            self.work.step().await.unwrap();
        }
        assert_eq!(self.work.state(), WorkState::Recv);
        self.work.step().await.unwrap();
    }

    /// Finish the packet the context already took.
    async fn pump_current(&mut self) {
        while self.work.state() != WorkState::Recv {
            self.work.step().await.unwrap();
        }
    }
}

/// Everything written to `client` so far, decoded.
fn drain(client: &mut Client) -> Vec<Packet> {
    let mut decoder = Decoder::for_version(client.version);
    let mut out = Vec::new();
    while let Ok(frame) = client.rx.try_recv() {
        client.pipe.send_complete();
        let (packet, used) = decoder.decode(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        out.push(packet);
    }
    out
}

fn subscribe(packet_id: u16, filters: &[(&str, QoS)]) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id,
        filters: filters
            .iter()
            .map(|(f, qos)| SubscribeFilter {
                filter: f.to_string(),
                options: SubscriptionOptions::with_qos(*qos),
            })
            .collect(),
        properties: Properties::default(),
    })
}

fn subscribe_with(packet_id: u16, filter: &str, options: SubscriptionOptions) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id,
        filters: vec![SubscribeFilter {
            filter: filter.to_string(),
            options,
        }],
        properties: Properties::default(),
    })
}

fn publish(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Packet {
    let mut p = Publish::new(topic, Bytes::from_static(payload), qos);
    p.packet_id = packet_id;
    Packet::Publish(p)
}

fn retained(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Packet {
    let mut p = Publish::new(topic, Bytes::from_static(payload), qos);
    p.packet_id = packet_id;
    p.retain = true;
    Packet::Publish(p)
}

fn suback_codes(packets: &[Packet]) -> Vec<ReasonCode> {
    match packets.first() {
        Some(Packet::SubAck(SubAck { reason_codes, .. })) => reason_codes.clone(),
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

fn expect_publish(packet: &Packet) -> &Publish {
    match packet {
        Packet::Publish(p) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_suback_codes_v3() {
    let mut h = Harness::new();
    let mut c = h.connect(1, "c", ProtocolVersion::V311);
    h.feed(&c, subscribe(1, &[("a/b", QoS::AtLeastOnce), ("a/#/b", QoS::AtMostOnce)])).await;

    assert_eq!(
        suback_codes(&drain(&mut c)),
        vec![ReasonCode::GrantedQoS1, ReasonCode::UnspecifiedError]
    );
}

#[tokio::test]
async fn test_suback_codes_v5() {
    let mut h = Harness::new();
    let mut c = h.connect(1, "c", ProtocolVersion::V5);
    h.feed(&c, subscribe(1, &[("a/+", QoS::ExactlyOnce), ("a/b#", QoS::AtMostOnce)])).await;

    assert_eq!(
        suback_codes(&drain(&mut c)),
        vec![ReasonCode::GrantedQoS2, ReasonCode::TopicFilterInvalid]
    );
    let topics = h.socket.registry().topics("c");
    assert_eq!(topics.len(), 1);
    assert_eq!(&*topics[0].filter, "a/+");
    assert!(c.pipe.is_subscribed("a/+"));
}

#[tokio::test]
async fn test_same_client_from_second_pipe_is_refused() {
    let mut h = Harness::new();
    let mut first = h.connect(1, "C", ProtocolVersion::V5);
    let mut second = h.connect(2, "C", ProtocolVersion::V5);

    h.feed(&first, subscribe(1, &[("t", QoS::AtMostOnce)])).await;
    h.feed(&second, subscribe(1, &[("t", QoS::AtLeastOnce)])).await;

    assert_eq!(suback_codes(&drain(&mut first)), vec![ReasonCode::Success]);
    assert_eq!(suback_codes(&drain(&mut second)), vec![ReasonCode::UnspecifiedError]);

    let subs = h.socket.trie().subscribers("t");
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].pipe, 1);
}

#[tokio::test]
async fn test_qos1_fan_out_completes_after_all_acks() {
    let mut h = Harness::new();
    let mut publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut s1 = h.connect(2, "s1", ProtocolVersion::V311);
    let mut s2 = h.connect(3, "s2", ProtocolVersion::V5);

    h.feed(&s1, subscribe(1, &[("t", QoS::AtLeastOnce)])).await;
    h.feed(&s2, subscribe(1, &[("t", QoS::ExactlyOnce)])).await;
    drain(&mut s1);
    drain(&mut s2);

    h.feed(&publisher, publish("t", b"hello", QoS::AtLeastOnce, Some(10))).await;

    assert_eq!(drain(&mut publisher), vec![Packet::PubAck(Ack::new(10))]);
    let got1 = drain(&mut s1);
    let got2 = drain(&mut s2);
    assert_eq!(got1.len(), 1);
    assert_eq!(got2.len(), 1);
    let p1 = expect_publish(&got1[0]);
    let p2 = expect_publish(&got2[0]);
    assert_eq!(p1.qos, QoS::AtLeastOnce);
    assert_eq!(p2.qos, QoS::AtLeastOnce);
    assert_eq!(p1.payload, Bytes::from_static(b"hello"));

    let id1 = p1.packet_id.unwrap();
    let id2 = p2.packet_id.unwrap();
    let record = h.socket.registry().pending(2, id1).unwrap();
    assert_eq!(record.publisher, 1);
    assert_eq!(record.source_packet_id, 10);
    assert_eq!(record.total(), 2);
    assert_eq!(record.finished(), 0);

    h.feed(&s1, Packet::PubAck(Ack::new(id1))).await;
    assert_eq!(record.finished(), 1);
    assert!(h.socket.registry().pending(2, id1).is_none());
    assert_eq!(s1.pipe.inflight_len(), 0);

    h.feed(&s2, Packet::PubAck(Ack::new(id2))).await;
    assert!(record.is_complete());
    assert_eq!(h.socket.registry().pending_len(), 0);

    // a late duplicate ack changes nothing
    h.feed(&s2, Packet::PubAck(Ack::new(id2))).await;
    assert_eq!(record.finished(), 2);
    assert_eq!(Arc::strong_count(&record), 1);
    assert!(drain(&mut publisher).is_empty());
}

#[tokio::test]
async fn test_overlapping_filters_deliver_once_at_highest_qos() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut sub = h.connect(2, "sub", ProtocolVersion::V311);
    h.feed(&sub, subscribe(1, &[("a/+", QoS::AtMostOnce), ("a/#", QoS::AtLeastOnce)])).await;
    drain(&mut sub);

    h.feed(&publisher, publish("a/b", b"x", QoS::ExactlyOnce, Some(3))).await;

    let got = drain(&mut sub);
    assert_eq!(got.len(), 1);
    assert_eq!(expect_publish(&got[0]).qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_no_local_skips_own_publish() {
    let mut h = Harness::new();
    let mut c = h.connect(1, "c", ProtocolVersion::V5);
    let options = SubscriptionOptions {
        no_local: true,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    h.feed(&c, subscribe_with(1, "t", options)).await;
    drain(&mut c);

    h.feed(&c, publish("t", b"x", QoS::AtMostOnce, None)).await;
    assert!(drain(&mut c).is_empty());
}

#[tokio::test]
async fn test_retained_delivered_then_cleared() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V311);
    h.feed(&publisher, retained("r/1", b"on", QoS::AtMostOnce, None)).await;

    let mut first = h.connect(2, "first", ProtocolVersion::V311);
    h.feed(&first, subscribe(1, &[("r/+", QoS::AtLeastOnce)])).await;
    let got = drain(&mut first);
    assert_eq!(got.len(), 2);
    assert_eq!(suback_codes(&got), vec![ReasonCode::GrantedQoS1]);
    let p = expect_publish(&got[1]);
    assert!(p.retain);
    assert_eq!(p.qos, QoS::AtMostOnce);
    assert_eq!(&*p.topic, "r/1");

    // empty retained payload clears the slot
    h.feed(&publisher, retained("r/1", b"", QoS::AtMostOnce, None)).await;
    drain(&mut first);

    let mut second = h.connect(3, "second", ProtocolVersion::V311);
    h.feed(&second, subscribe(1, &[("r/1", QoS::AtMostOnce)])).await;
    assert_eq!(drain(&mut second).len(), 1);
}

#[tokio::test]
async fn test_retained_qos_is_capped_by_subscription() {
    let mut h = Harness::new();
    let mut publisher = h.connect(1, "pub", ProtocolVersion::V5);
    h.feed(&publisher, retained("r", b"v", QoS::ExactlyOnce, Some(4))).await;
    drain(&mut publisher);

    let mut sub = h.connect(2, "sub", ProtocolVersion::V5);
    h.feed(&sub, subscribe(9, &[("r", QoS::AtLeastOnce)])).await;
    let got = drain(&mut sub);
    let p = expect_publish(&got[1]);
    assert_eq!(p.qos, QoS::AtLeastOnce);
    let id = p.packet_id.unwrap();

    let record = h.socket.registry().pending(2, id).unwrap();
    assert_eq!(record.source_packet_id, 9);
    h.feed(&sub, Packet::PubAck(Ack::new(id))).await;
    assert_eq!(h.socket.registry().pending_len(), 0);
}

#[tokio::test]
async fn test_retain_handling_send_if_new() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V5);
    h.feed(&publisher, retained("r", b"v", QoS::AtMostOnce, None)).await;

    let mut sub = h.connect(2, "sub", ProtocolVersion::V5);
    let options = SubscriptionOptions {
        retain_handling: RetainHandling::SendIfNew,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    h.feed(&sub, subscribe_with(1, "r", options)).await;
    assert_eq!(drain(&mut sub).len(), 2);

    h.feed(&sub, subscribe_with(2, "r", options)).await;
    assert_eq!(drain(&mut sub).len(), 1);

    let never = SubscriptionOptions {
        retain_handling: RetainHandling::DoNotSend,
        ..options
    };
    let mut other = h.connect(3, "other", ProtocolVersion::V5);
    h.feed(&other, subscribe_with(1, "r", never)).await;
    assert_eq!(drain(&mut other).len(), 1);
}

#[tokio::test]
async fn test_retain_flag_kept_only_when_retain_as_published() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V5);
    let mut plain = h.connect(2, "plain", ProtocolVersion::V5);
    let mut rap = h.connect(3, "rap", ProtocolVersion::V5);

    h.feed(&plain, subscribe(1, &[("t", QoS::AtMostOnce)])).await;
    let options = SubscriptionOptions {
        retain_as_published: true,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    h.feed(&rap, subscribe_with(1, "t", options)).await;
    drain(&mut plain);
    drain(&mut rap);

    h.feed(&publisher, retained("t", b"v", QoS::AtMostOnce, None)).await;
    assert!(!expect_publish(&drain(&mut plain)[0]).retain);
    assert!(expect_publish(&drain(&mut rap)[0]).retain);
}

#[tokio::test]
async fn test_subscription_identifier_attached_for_v5() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut sub = h.connect(2, "sub", ProtocolVersion::V5);

    let mut properties = Properties::default();
    properties.push(Property::subscription_identifier(5));
    h.feed(
        &sub,
        Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: "t/#".to_string(),
                options: SubscriptionOptions::with_qos(QoS::AtMostOnce),
            }],
            properties,
        }),
    )
    .await;
    drain(&mut sub);

    h.feed(&publisher, publish("t/x", b"v", QoS::AtMostOnce, None)).await;
    let got = drain(&mut sub);
    let ids: Vec<u32> = expect_publish(&got[0]).properties.subscription_identifiers().collect();
    assert_eq!(ids, vec![5]);
}

#[tokio::test]
async fn test_inbound_qos2_held_until_pubrel() {
    let mut h = Harness::new();
    let mut publisher = h.connect(1, "pub", ProtocolVersion::V5);
    let mut sub = h.connect(2, "sub", ProtocolVersion::V311);
    h.feed(&sub, subscribe(1, &[("t", QoS::AtMostOnce)])).await;
    drain(&mut sub);

    h.feed(&publisher, publish("t", b"once", QoS::ExactlyOnce, Some(7))).await;
    assert_eq!(drain(&mut publisher), vec![Packet::PubRec(Ack::new(7))]);
    assert_eq!(drain(&mut sub).len(), 1);

    // retransmission before PUBREL is acknowledged but not forwarded
    h.feed(&publisher, publish("t", b"once", QoS::ExactlyOnce, Some(7))).await;
    assert_eq!(drain(&mut publisher), vec![Packet::PubRec(Ack::new(7))]);
    assert!(drain(&mut sub).is_empty());

    h.feed(&publisher, Packet::PubRel(Ack::new(7))).await;
    assert_eq!(drain(&mut publisher), vec![Packet::PubComp(Ack::new(7))]);

    h.feed(&publisher, Packet::PubRel(Ack::new(7))).await;
    assert_eq!(
        drain(&mut publisher),
        vec![Packet::PubComp(Ack::with_reason(7, ReasonCode::PacketIdNotFound))]
    );
}

#[tokio::test]
async fn test_outbound_qos2_pubrec_becomes_pubrel() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut sub = h.connect(2, "sub", ProtocolVersion::V311);
    h.feed(&sub, subscribe(1, &[("t", QoS::ExactlyOnce)])).await;
    drain(&mut sub);

    h.feed(&publisher, publish("t", b"x", QoS::ExactlyOnce, Some(1))).await;
    let got = drain(&mut sub);
    let id = expect_publish(&got[0]).packet_id.unwrap();
    assert_eq!(sub.pipe.inflight_stage(id), Some(Stage::Publish));

    h.feed(&sub, Packet::PubRec(Ack::new(id))).await;
    assert_eq!(drain(&mut sub), vec![Packet::PubRel(Ack::new(id))]);
    assert_eq!(sub.pipe.inflight_stage(id), Some(Stage::PubRel));
    assert!(h.socket.registry().pending(2, id).is_some());

    h.feed(&sub, Packet::PubComp(Ack::new(id))).await;
    assert_eq!(sub.pipe.inflight_len(), 0);
    assert_eq!(h.socket.registry().pending_len(), 0);
}

#[tokio::test]
async fn test_unsubscribe_reason_codes() {
    let mut h = Harness::new();
    let mut c = h.connect(1, "c", ProtocolVersion::V5);
    h.feed(&c, subscribe(1, &[("a/b", QoS::AtMostOnce)])).await;
    drain(&mut c);

    h.feed(
        &c,
        Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["a/b".to_string(), "x".to_string()],
            properties: Properties::default(),
        }),
    )
    .await;

    assert_eq!(
        drain(&mut c),
        vec![Packet::UnsubAck(UnsubAck {
            packet_id: 2,
            reason_codes: vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted],
            properties: Properties::default(),
        })]
    );
    assert!(!h.socket.registry().has_topics("c"));
    assert_eq!(h.socket.trie().node_count(), 1);
    assert!(!c.pipe.is_subscribed("a/b"));
}

#[tokio::test]
async fn test_pingreq_consumed_without_reply() {
    let mut h = Harness::new();
    let mut c = h.connect(1, "c", ProtocolVersion::V311);
    h.feed(&c, Packet::PingReq).await;
    assert!(drain(&mut c).is_empty());
}

#[tokio::test]
async fn test_disconnect_handled_in_recv() {
    let mut h = Harness::new();
    let c = h.connect(1, "c", ProtocolVersion::V311);
    h.work.step().await.unwrap();

    h.deliver(&c, &[0xE0, 0x00]);
    assert!(c.pipe.in_engine());
    h.work.step().await.unwrap();
    assert_eq!(h.work.state(), WorkState::Recv);
    assert!(!c.pipe.in_engine());
}

#[tokio::test]
async fn test_publish_from_closed_pipe_still_fans_out() {
    let mut h = Harness::new();
    let publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut sub = h.connect(2, "sub", ProtocolVersion::V311);
    h.feed(&sub, subscribe(1, &[("x/y", QoS::AtMostOnce)])).await;
    drain(&mut sub);

    let frame = Encoder::new(ProtocolVersion::V311)
        .encode_to_vec(&publish("x/y", b"last", QoS::AtLeastOnce, Some(4)))
        .unwrap();
    h.deliver(&publisher, &frame);
    h.take().await;
    assert_eq!(h.work.state(), WorkState::Wait);

    // the connection goes away while the packet is being handled
    assert!(h.socket.close_pipe(1));
    h.pump_current().await;

    let got = drain(&mut sub);
    assert_eq!(got.len(), 1);
    let Packet::Publish(p) = &got[0] else {
        panic!("expected PUBLISH, got {:?}", got[0]);
    };
    assert_eq!(&*p.topic, "x/y");
    assert_eq!(p.payload, Bytes::from_static(b"last"));
    assert_eq!(h.socket.registry().client_of(1), None);
}

#[tokio::test]
async fn test_subscribe_from_closing_pipe_is_cleaned_up() {
    let mut h = Harness::new();
    let sub = h.connect(1, "sub", ProtocolVersion::V311);

    let frame = Encoder::new(ProtocolVersion::V311)
        .encode_to_vec(&subscribe(1, &[("a/b", QoS::AtLeastOnce)]))
        .unwrap();
    h.deliver(&sub, &frame);
    h.take().await;
    assert_eq!(h.work.state(), WorkState::Wait);
    assert!(h.socket.close_pipe(1));
    h.pump_current().await;

    assert!(h.socket.trie().search_client("a/b", None).is_empty());
    assert!(!h.socket.registry().has_topics("sub"));
    assert_eq!(h.socket.registry().client_of(1), None);
    assert_eq!(h.socket.trie().node_count(), 1);
}

#[tokio::test]
async fn test_protocol_error_drop_keeps_pipe() {
    let mut h = Harness::new();
    let c = h.connect(1, "c", ProtocolVersion::V311);
    // QoS 3 publish
    h.feed_raw(&c, &[0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01]).await;
    assert!(!c.pipe.is_closed());
}

#[tokio::test]
async fn test_protocol_error_disconnect_closes_pipe() {
    let settings = EngineSettings {
        protocol_error_action: ProtocolErrorAction::Disconnect,
        ..Default::default()
    };
    let mut h = Harness::build(0, 0, Arc::new(AbortPolicy), settings);
    let c = h.connect(1, "c", ProtocolVersion::V311);
    h.feed(&c, subscribe(1, &[("t", QoS::AtMostOnce)])).await;

    // wildcard in a PUBLISH topic name
    h.feed_raw(&c, &[0x30, 0x05, 0x00, 0x03, b'a', b'/', b'+']).await;

    assert!(c.pipe.is_closed());
    assert_eq!(h.socket.pipe_count(), 0);
    assert!(h.socket.trie().search_client("t", None).is_empty());
}

#[tokio::test]
async fn test_subscribe_rolled_back_on_node_exhaustion() {
    let mut h = Harness::build(3, 0, Arc::new(RejectPolicy), EngineSettings::default());
    let mut c = h.connect(1, "c", ProtocolVersion::V311);

    h.feed(&c, subscribe(1, &[("a", QoS::AtMostOnce), ("b/c/d", QoS::AtMostOnce)])).await;

    assert!(drain(&mut c).is_empty());
    assert_eq!(h.socket.trie().node_count(), 1);
    assert!(!h.socket.registry().has_topics("c"));
    assert!(!c.pipe.is_subscribed("a"));
}

#[tokio::test]
async fn test_pending_exhaustion_unwinds_fan_out() {
    let mut h = Harness::build(0, 1, Arc::new(RejectPolicy), EngineSettings::default());
    let mut publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let mut s1 = h.connect(2, "s1", ProtocolVersion::V311);
    let mut s2 = h.connect(3, "s2", ProtocolVersion::V311);
    h.feed(&s1, subscribe(1, &[("t", QoS::AtLeastOnce)])).await;
    h.feed(&s2, subscribe(1, &[("t", QoS::AtLeastOnce)])).await;
    drain(&mut s1);
    drain(&mut s2);

    h.feed(&publisher, publish("t", b"x", QoS::AtLeastOnce, Some(1))).await;

    assert_eq!(drain(&mut publisher), vec![Packet::PubAck(Ack::new(1))]);
    assert!(drain(&mut s1).is_empty());
    assert!(drain(&mut s2).is_empty());
    assert_eq!(s1.pipe.inflight_len(), 0);
    assert_eq!(s2.pipe.inflight_len(), 0);
    assert_eq!(h.socket.registry().pending_len(), 0);
}

#[tokio::test]
async fn test_closed_subscriber_receives_nothing() {
    let mut h = Harness::new();
    let mut publisher = h.connect(1, "pub", ProtocolVersion::V311);
    let sub = h.connect(2, "C", ProtocolVersion::V311);
    h.feed(&sub, subscribe(1, &[("a/b", QoS::AtLeastOnce), ("a/+/c", QoS::AtLeastOnce)])).await;

    h.socket.close_pipe(2);
    assert!(h.socket.registry().topics("C").is_empty());

    h.feed(&publisher, publish("a/b", b"x", QoS::AtLeastOnce, Some(1))).await;
    assert_eq!(drain(&mut publisher), vec![Packet::PubAck(Ack::new(1))]);
    assert_eq!(h.socket.registry().pending_len(), 0);
}
