//! Per-connection tasks
//!
//! Every accepted stream runs three tasks: the reader (CONNECT handshake,
//! then framing and hand-off to the socket, one packet at a time), the writer (drains the pipe's
//! one-slot hand-off channel onto the stream) and the timer (keepalive and
//! resend).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{user_key, ConnParams, Message, Pipe, Socket, Tick, TransportError};
use crate::codec::{peek_frame, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PacketType, Properties, Property, ProtocolError,
    ReasonCode,
};

const READ_CHUNK: usize = 4096;

/// v3.1.1 CONNACK "unacceptable protocol version"
const CONNACK_BAD_LEVEL: [u8; 4] = [0x20, 0x02, 0x00, 0x01];

const PINGRESP: [u8; 2] = [0xD0, 0x00];

/// Bind a listening socket with SO_REUSEADDR set.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

/// Run one accepted connection until it closes.
pub async fn serve_stream(
    socket: Arc<Socket>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), TransportError> {
    if let Err(e) = SockRef::from(&stream).set_nodelay(true) {
        trace!(%peer, error = %e, "failed to set TCP_NODELAY");
    }

    let id = socket.next_pipe_id();
    let settings = socket.settings().clone();
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let connect = match timeout(
        settings.connect_timeout,
        read_connect(&mut rd, &mut buf, settings.max_packet_size),
    )
    .await
    {
        Ok(Ok(connect)) => connect,
        Ok(Err(e)) => {
            if let TransportError::Protocol(ProtocolError::Decode(
                DecodeError::InvalidProtocolVersion(level),
            )) = &e
            {
                debug!(pipe = id, %peer, level, "unsupported protocol level");
                let _ = wr.write_all(&CONNACK_BAD_LEVEL).await;
            } else {
                debug!(pipe = id, %peer, error = %e, "handshake failed");
            }
            return Err(e);
        }
        Err(_) => {
            debug!(pipe = id, %peer, "no CONNECT before timeout");
            return Err(TransportError::Timeout);
        }
    };

    let version = connect.protocol_version;
    let assigned = connect.client_id.is_empty();
    let client_id: Arc<str> = if assigned {
        Arc::from(format!("auto-{}", id))
    } else {
        Arc::from(connect.client_id)
    };
    let conn = ConnParams {
        protocol_version: version,
        client_id: client_id.clone(),
        keep_alive: connect.keep_alive,
        clean_start: connect.clean_start,
        username: connect.username,
    };

    let encoder = Encoder::new(version);
    let (pipe, rx) = match socket.attach(id, conn) {
        Ok(attached) => attached,
        Err(e) => {
            warn!(pipe = id, %peer, client_id = %client_id, error = %e, "connection refused");
            let refuse = Packet::ConnAck(ConnAck {
                session_present: false,
                reason_code: ReasonCode::ServerUnavailable,
                properties: Properties::default(),
            });
            if let Ok(frame) = encoder.encode_to_vec(&refuse) {
                let _ = wr.write_all(&frame).await;
            }
            return Err(e);
        }
    };

    let result = run_pipe(&socket, &pipe, &encoder, assigned, rd, wr, rx, buf).await;
    socket.close_pipe(id);
    if let Err(e) = &result {
        debug!(pipe = id, client_id = %client_id, error = %e, "connection ended");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_pipe(
    socket: &Arc<Socket>,
    pipe: &Arc<Pipe>,
    encoder: &Encoder,
    assigned: bool,
    mut rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    rx: mpsc::Receiver<Bytes>,
    buf: BytesMut,
) -> Result<(), TransportError> {
    let id = pipe.id();
    let conn = pipe.conn();

    if let Some(old) = socket.registry().bind(id, conn.client_id.clone()) {
        debug!(pipe = id, old_pipe = old, client_id = %conn.client_id, "client bound to new pipe");
    }
    if let Some(user) = &conn.username {
        socket
            .registry()
            .kv()
            .set(user_key(&conn.client_id), Bytes::copy_from_slice(user.as_bytes()));
    }

    tokio::spawn(write_loop(socket.clone(), pipe.clone(), wr, rx));
    pipe.set_timer(tokio::spawn(timer_loop(socket.clone(), pipe.clone())));

    let mut properties = Properties::default();
    if assigned && conn.protocol_version.is_v5() {
        properties.push(Property::assigned_client_identifier(&*conn.client_id));
    }
    let connack = Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: ReasonCode::Success,
        properties,
    });
    let frame = encoder
        .encode_to_vec(&connack)
        .map_err(ProtocolError::from)?;
    pipe.send(frame.freeze())?;

    info!(
        pipe = id,
        client_id = %conn.client_id,
        version = ?conn.protocol_version,
        keep_alive = conn.keep_alive,
        "client connected"
    );

    read_loop(socket, pipe, &mut rd, buf).await
}

/// Read until a complete CONNECT is buffered. Any other first packet is an
/// error.
async fn read_connect(
    rd: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Connect, TransportError> {
    let mut decoder = Decoder::new().with_max_packet_size(max_packet_size);
    loop {
        if let Some(header) = peek_frame(buf, max_packet_size).map_err(ProtocolError::from)? {
            if PacketType::of_header(header.first_byte) != Some(PacketType::Connect) {
                return Err(ProtocolError::Unexpected("first packet must be CONNECT").into());
            }
            let frame = buf.split_to(header.frame_len());
            let packet = decoder
                .decode_frame(header.first_byte, &frame[header.header_len..])
                .map_err(ProtocolError::from)?;
            return match packet {
                Packet::Connect(connect) => Ok(*connect),
                _ => Err(ProtocolError::Unexpected("first packet must be CONNECT").into()),
            };
        }

        buf.reserve(READ_CHUNK);
        if rd.read_buf(buf).await? == 0 {
            return Err(TransportError::Closed);
        }
    }
}

async fn read_loop(
    socket: &Socket,
    pipe: &Arc<Pipe>,
    rd: &mut OwnedReadHalf,
    mut buf: BytesMut,
) -> Result<(), TransportError> {
    let max_packet_size = socket.settings().max_packet_size;

    loop {
        while let Some(header) = peek_frame(&buf, max_packet_size).map_err(ProtocolError::from)? {
            let frame = buf.split_to(header.frame_len());
            pipe.touch();

            let msg = Message::new(pipe.clone(), frame, header.header_len);
            let kind = msg.packet_type();
            if kind == Some(PacketType::PingReq) {
                pipe.send(Bytes::from_static(&PINGRESP))?;
            }

            socket.deliver(msg)?;
            let handled = pipe.wait_handled().await;
            if kind == Some(PacketType::Disconnect) {
                debug!(pipe = pipe.id(), client_id = %pipe.conn().client_id, "client disconnected");
                return Ok(());
            }
            if !handled {
                return Err(TransportError::Closed);
            }
        }

        if pipe.is_closed() {
            return Err(TransportError::Closed);
        }
        buf.reserve(READ_CHUNK);
        tokio::select! {
            n = rd.read_buf(&mut buf) => {
                if n? == 0 {
                    debug!(pipe = pipe.id(), "peer closed connection");
                    return Ok(());
                }
            }
            _ = pipe.wait_closing() => return Err(TransportError::Closed),
        }
    }
}

async fn write_loop(
    socket: Arc<Socket>,
    pipe: Arc<Pipe>,
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = wr.write_all(&frame).await {
            debug!(pipe = pipe.id(), error = %e, "write failed");
            break;
        }
        pipe.send_complete();
    }
    let _ = wr.shutdown().await;
    socket.close_pipe(pipe.id());
}

async fn timer_loop(socket: Arc<Socket>, pipe: Arc<Pipe>) {
    let period = socket.settings().qos_timer;
    let resend_after = socket.settings().resend_after;

    tokio::time::sleep(period.mul_f32(1.2)).await;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match pipe.tick(period, resend_after) {
            Tick::Idle => {}
            Tick::Close => {
                info!(
                    pipe = pipe.id(),
                    client_id = %pipe.conn().client_id,
                    keep_alive = pipe.conn().keep_alive,
                    "keepalive expired"
                );
                socket.close_pipe(pipe.id());
                return;
            }
            Tick::Resend(packet_id, frame) => {
                if pipe.send(frame).is_err() {
                    return;
                }
                trace!(pipe = pipe.id(), packet_id, "resent unacknowledged message");
            }
        }
    }
}
