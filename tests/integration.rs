//! Integration Tests for the VibeMQ Nano broker
//!
//! A real broker on a loopback listener, driven by a minimal client built on
//! the crate's own encoder and decoder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use vibemq_nano::codec::{Decoder, Encoder};
use vibemq_nano::config::{Config, OnExhausted};
use vibemq_nano::protocol::{
    Ack, ConnAck, Connect, Disconnect, Packet, Properties, PropertyId, ProtocolVersion, Publish,
    QoS, ReasonCode, SubAck, Subscribe, SubscribeFilter, SubscriptionOptions,
};
use vibemq_nano::Broker;

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind = SocketAddr::from(([127, 0, 0, 1], 0));
    config.server.parallel = 4;
    config.limits.on_exhausted = OnExhausted::Reject;
    config
}

async fn start(config: Config) -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new(config));
    let listener = broker.bind().expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let serving = broker.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (broker, addr)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn open(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(version),
            decoder: Decoder::for_version(version),
            buf: BytesMut::new(),
        }
    }

    /// Open a connection and complete the CONNECT handshake.
    async fn connect(addr: SocketAddr, version: ProtocolVersion, client_id: &str) -> Self {
        let mut client = Self::open(addr, version).await;
        let ack = client.handshake(version, client_id, 60).await;
        assert_eq!(ack.reason_code, ReasonCode::Success);
        client
    }

    async fn handshake(&mut self, version: ProtocolVersion, client_id: &str, keep_alive: u16) -> ConnAck {
        let connect = Connect {
            keep_alive,
            ..Connect::new(version, client_id)
        };
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let buf = self.encoder.encode_to_vec(packet).expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Write several packets with a single write, as pipelining clients do.
    async fn send_all(&mut self, packets: &[Packet]) {
        let mut buf = BytesMut::new();
        for packet in packets {
            buf.extend_from_slice(&self.encoder.encode_to_vec(packet).expect("Failed to encode"));
        }
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    fn try_decode(&mut self) -> Option<Packet> {
        match self.decoder.decode(&self.buf) {
            Ok(Some((packet, used))) => {
                self.buf.advance(used);
                Some(packet)
            }
            _ => None,
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.try_decode() {
                return Some(packet);
            }
            match timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    /// True when nothing arrives for `wait`.
    async fn silent_for(&mut self, wait: Duration) -> bool {
        if self.try_decode().is_some() {
            return false;
        }
        timeout(wait, self.stream.read_buf(&mut self.buf)).await.is_err()
    }

    /// True when the broker closes the connection within five seconds.
    async fn closed_by_broker(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![SubscribeFilter {
                filter: filter.to_string(),
                options: SubscriptionOptions::with_qos(qos),
            }],
            properties: Properties::default(),
        });
        self.send(&subscribe).await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>, retain: bool) {
        let mut publish = Publish::new(topic, Bytes::from_static(payload), qos);
        publish.packet_id = packet_id;
        publish.retain = retain;
        self.send(&Packet::Publish(publish)).await;
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(p)) => p,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(&mut self) {
        self.send(&Packet::Disconnect(Disconnect::default())).await;
    }
}

#[tokio::test]
async fn test_connect_v311_and_v5() {
    let (_broker, addr) = start(test_config()).await;

    let mut v3 = TestClient::open(addr, ProtocolVersion::V311).await;
    let ack = v3.handshake(ProtocolVersion::V311, "v3-client", 60).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    assert!(!ack.session_present);

    let mut v5 = TestClient::open(addr, ProtocolVersion::V5).await;
    let ack = v5.handshake(ProtocolVersion::V5, "v5-client", 60).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    assert!(ack.properties.is_empty());
}

#[tokio::test]
async fn test_empty_client_id_is_assigned() {
    let (broker, addr) = start(test_config()).await;

    let mut client = TestClient::open(addr, ProtocolVersion::V5).await;
    let ack = client.handshake(ProtocolVersion::V5, "", 60).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);
    assert!(ack.properties.get(PropertyId::AssignedClientIdentifier).is_some());

    assert!(eventually(|| broker.connection_count() == 1).await);
}

#[tokio::test]
async fn test_unsupported_protocol_level() {
    let (_broker, addr) = start(test_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // "MQTT", level 3, clean session, keepalive 60, empty client id
    stream
        .write_all(&[0x10, 0x0C, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x00])
        .await
        .unwrap();

    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x20, 0x02, 0x00, 0x01]);
}

#[tokio::test]
async fn test_connect_timeout_closes_silent_connection() {
    let mut config = test_config();
    config.session.connect_timeout = Duration::from_millis(200);
    let (_broker, addr) = start(config).await;

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    assert!(client.closed_by_broker().await);
}

#[tokio::test]
async fn test_pingreq_gets_pingresp() {
    let (_broker, addr) = start(test_config()).await;
    let mut client = TestClient::connect(addr, ProtocolVersion::V311, "pinger").await;

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_qos0_publish_subscribe() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connect(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V5, "pub").await;

    let ack = sub.subscribe(1, "sensors/+/temp", QoS::AtMostOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::Success]);

    publisher.publish("sensors/k1/temp", b"21.5", QoS::AtMostOnce, None, false).await;
    let got = sub.recv_publish().await;
    assert_eq!(&*got.topic, "sensors/k1/temp");
    assert_eq!(got.payload, Bytes::from_static(b"21.5"));
    assert_eq!(got.qos, QoS::AtMostOnce);
}

#[tokio::test]
async fn test_qos1_puback_and_pending_release() {
    let (broker, addr) = start(test_config()).await;
    let mut s1 = TestClient::connect(addr, ProtocolVersion::V311, "s1").await;
    let mut s2 = TestClient::connect(addr, ProtocolVersion::V5, "s2").await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, "pub").await;
    s1.subscribe(1, "q/1", QoS::AtLeastOnce).await;
    s2.subscribe(1, "q/#", QoS::AtLeastOnce).await;

    publisher.publish("q/1", b"m", QoS::AtLeastOnce, Some(42), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(Ack::new(42))));

    let p1 = s1.recv_publish().await;
    let p2 = s2.recv_publish().await;
    assert_eq!(p1.qos, QoS::AtLeastOnce);
    assert_eq!(p2.qos, QoS::AtLeastOnce);

    let registry = broker.socket().registry().clone();
    assert_eq!(registry.pending_len(), 2);

    s1.send(&Packet::PubAck(Ack::new(p1.packet_id.unwrap()))).await;
    s2.send(&Packet::PubAck(Ack::new(p2.packet_id.unwrap()))).await;
    assert!(eventually(|| registry.pending_len() == 0).await);

    // exactly one PUBACK per publish
    assert!(publisher.silent_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_qos2_both_directions() {
    let (broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connect(addr, ProtocolVersion::V5, "sub").await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V5, "pub").await;
    sub.subscribe(1, "q2", QoS::ExactlyOnce).await;

    publisher.publish("q2", b"once", QoS::ExactlyOnce, Some(9), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(9))));
    publisher.send(&Packet::PubRel(Ack::new(9))).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(Ack::new(9))));

    let delivered = sub.recv_publish().await;
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    let id = delivered.packet_id.unwrap();

    sub.send(&Packet::PubRec(Ack::new(id))).await;
    assert_eq!(sub.recv().await, Some(Packet::PubRel(Ack::new(id))));
    sub.send(&Packet::PubComp(Ack::new(id))).await;

    let registry = broker.socket().registry().clone();
    assert!(eventually(|| registry.pending_len() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_publish_then_disconnect_in_one_write() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connect(addr, ProtocolVersion::V311, "sink").await;
    sub.subscribe(1, "x/y", QoS::AtMostOnce).await;

    let mut expected = Vec::new();
    for i in 0..20 {
        let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, &format!("burst-{}", i)).await;
        let payload = Bytes::from(format!("m{}", i));
        expected.push(payload.clone());
        publisher
            .send_all(&[
                Packet::Publish(Publish::new("x/y", payload, QoS::AtMostOnce)),
                Packet::Disconnect(Disconnect::default()),
            ])
            .await;
    }

    let mut got = Vec::new();
    for _ in 0..expected.len() {
        got.push(sub.recv_publish().await.payload);
    }
    got.sort();
    expected.sort();
    assert_eq!(got, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_qos2_publish_and_pubrel_keep_order() {
    let mut config = test_config();
    config.server.parallel = 8;
    let (_broker, addr) = start(config).await;
    let mut sub = TestClient::connect(addr, ProtocolVersion::V311, "q2-sink").await;
    sub.subscribe(1, "q/2", QoS::AtMostOnce).await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V5, "q2-pipeliner").await;

    for id in 1..=200u16 {
        let mut publish = Publish::new("q/2", Bytes::from_static(b"x"), QoS::ExactlyOnce);
        publish.packet_id = Some(id);
        publisher
            .send_all(&[Packet::Publish(publish), Packet::PubRel(Ack::new(id))])
            .await;
        assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(id))));
        assert_eq!(publisher.recv().await, Some(Packet::PubComp(Ack::new(id))));
    }
    for _ in 0..200 {
        assert_eq!(&*sub.recv_publish().await.topic, "q/2");
    }

    // released ids are free again
    let mut again = Publish::new("q/2", Bytes::from_static(b"again"), QoS::ExactlyOnce);
    again.packet_id = Some(1);
    publisher
        .send_all(&[Packet::Publish(again), Packet::PubRel(Ack::new(1))])
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(Ack::new(1))));
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(Ack::new(1))));
    assert_eq!(sub.recv_publish().await.payload, Bytes::from_static(b"again"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_subscribe_then_publish() {
    let mut config = test_config();
    config.server.parallel = 8;
    let (_broker, addr) = start(config).await;
    let mut client = TestClient::connect(addr, ProtocolVersion::V311, "echo").await;

    for i in 1..=50u16 {
        let topic = format!("echo/{}", i);
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: i,
            filters: vec![SubscribeFilter {
                filter: topic.clone(),
                options: SubscriptionOptions::with_qos(QoS::AtMostOnce),
            }],
            properties: Properties::default(),
        });
        let publish = Publish::new(topic.as_str(), Bytes::from_static(b"hi"), QoS::AtMostOnce);
        client.send_all(&[subscribe, Packet::Publish(publish)]).await;

        match client.recv().await {
            Some(Packet::SubAck(ack)) => assert_eq!(ack.packet_id, i),
            other => panic!("Expected SUBACK, got {:?}", other),
        }
        assert_eq!(&*client.recv_publish().await.topic, topic.as_str());
    }
}

#[tokio::test]
async fn test_same_client_id_from_two_connections() {
    let (broker, addr) = start(test_config()).await;
    let mut first = TestClient::connect(addr, ProtocolVersion::V311, "twin").await;
    let mut second = TestClient::connect(addr, ProtocolVersion::V311, "twin").await;

    let ack = first.subscribe(1, "dup/topic", QoS::AtLeastOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::GrantedQoS1]);
    let ack = second.subscribe(1, "dup/topic", QoS::AtLeastOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::UnspecifiedError]);

    assert_eq!(broker.socket().trie().subscribers("dup/topic").len(), 1);
}

#[tokio::test]
async fn test_overlapping_filters_one_delivery() {
    let (_broker, addr) = start(test_config()).await;
    let mut sub = TestClient::connect(addr, ProtocolVersion::V311, "sub").await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, "a/+", QoS::AtMostOnce).await;
    sub.subscribe(2, "a/#", QoS::AtMostOnce).await;
    sub.subscribe(3, "a/b", QoS::AtMostOnce).await;

    publisher.publish("a/b", b"x", QoS::AtMostOnce, None, false).await;
    sub.recv_publish().await;
    assert!(sub.silent_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_retained_set_and_clear() {
    let (_broker, addr) = start(test_config()).await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, "pub").await;

    publisher.publish("status/door", b"open", QoS::AtLeastOnce, Some(1), true).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(Ack::new(1))));

    let mut early = TestClient::connect(addr, ProtocolVersion::V311, "early").await;
    early.subscribe(1, "status/#", QoS::AtMostOnce).await;
    let retained = early.recv_publish().await;
    assert!(retained.retain);
    assert_eq!(retained.payload, Bytes::from_static(b"open"));

    publisher.publish("status/door", b"", QoS::AtLeastOnce, Some(2), true).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(Ack::new(2))));

    let mut late = TestClient::connect(addr, ProtocolVersion::V311, "late").await;
    late.subscribe(1, "status/door", QoS::AtMostOnce).await;
    assert!(late.silent_for(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let (broker, addr) = start(test_config()).await;
    let mut c = TestClient::connect(addr, ProtocolVersion::V311, "C").await;
    c.subscribe(1, "a/b", QoS::AtLeastOnce).await;
    c.subscribe(2, "a/+/c", QoS::AtLeastOnce).await;

    let registry = broker.socket().registry().clone();
    let trie = broker.socket().trie().clone();
    assert_eq!(registry.topics("C").len(), 2);

    c.disconnect().await;
    assert!(eventually(|| !registry.has_topics("C")).await);
    assert!(trie.subscribers("a/b").is_empty());
    assert!(trie.subscribers("a/+/c").is_empty());
    assert!(eventually(|| registry.pipe_of("C").is_none()).await);

    let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, "pub").await;
    publisher.publish("a/b", b"x", QoS::AtLeastOnce, Some(5), false).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubAck(Ack::new(5))));
    assert_eq!(registry.pending_len(), 0);
}

#[tokio::test]
async fn test_dropped_socket_removes_subscriptions() {
    let (broker, addr) = start(test_config()).await;
    let mut c = TestClient::connect(addr, ProtocolVersion::V5, "gone").await;
    c.subscribe(1, "x/y", QoS::AtMostOnce).await;
    drop(c);

    let registry = broker.socket().registry().clone();
    assert!(eventually(|| !registry.has_topics("gone")).await);
    assert!(eventually(|| broker.connection_count() == 0).await);
}

#[tokio::test]
async fn test_unacked_delivery_is_resent_with_dup() {
    let mut config = test_config();
    config.session.qos_timer = Duration::from_millis(100);
    config.session.resend_after = Some(Duration::from_millis(150));
    let (_broker, addr) = start(config).await;

    let mut sub = TestClient::connect(addr, ProtocolVersion::V311, "slow").await;
    let mut publisher = TestClient::connect(addr, ProtocolVersion::V311, "pub").await;
    sub.subscribe(1, "r", QoS::AtLeastOnce).await;

    publisher.publish("r", b"again", QoS::AtLeastOnce, Some(3), false).await;
    let first = sub.recv_publish().await;
    assert!(!first.dup);

    let resent = sub.recv_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, first.packet_id);
    assert_eq!(resent.payload, first.payload);

    sub.send(&Packet::PubAck(Ack::new(first.packet_id.unwrap()))).await;
    // drain resends that crossed the ack on the wire
    while !sub.silent_for(Duration::from_millis(250)).await {}
    assert!(sub.silent_for(Duration::from_millis(400)).await);
}

#[tokio::test]
async fn test_keepalive_expiry_closes_connection() {
    let mut config = test_config();
    config.session.qos_timer = Duration::from_millis(100);
    let (broker, addr) = start(config).await;

    let mut client = TestClient::open(addr, ProtocolVersion::V311).await;
    let ack = client.handshake(ProtocolVersion::V311, "sleepy", 1).await;
    assert_eq!(ack.reason_code, ReasonCode::Success);

    assert!(client.closed_by_broker().await);
    assert!(eventually(|| broker.connection_count() == 0).await);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config();
    config.limits.max_connections = 1;
    let (_broker, addr) = start(config).await;

    let _first = TestClient::connect(addr, ProtocolVersion::V5, "first").await;
    let mut second = TestClient::open(addr, ProtocolVersion::V5).await;
    let ack = second.handshake(ProtocolVersion::V5, "second", 60).await;
    assert_eq!(ack.reason_code, ReasonCode::ServerUnavailable);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let (broker, addr) = start(test_config()).await;
    let mut client = TestClient::connect(addr, ProtocolVersion::V311, "stay").await;
    assert!(eventually(|| broker.connection_count() == 1).await);

    broker.shutdown();

    assert!(client.closed_by_broker().await);
    assert_eq!(broker.connection_count(), 0);
}
