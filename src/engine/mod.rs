//! Protocol Engine
//!
//! A fixed pool of work contexts, each a small state machine:
//!
//! ```text
//! Init -> Recv -> Wait -> Send -> Recv -> ...
//!          ^       |
//!          +-------+  (nothing to send)
//! ```
//!
//! `Recv` is the only suspension point. `Wait` decodes the inbound packet,
//! touches the registry and trie, and builds the outbound frames; `Send`
//! hands them to the transport and resets the per-packet state.
//!
//! A context releases the source pipe once it is back in `Recv`, which
//! lets that pipe's reader deliver its next packet.

mod ack;
mod publish;
mod subscribe;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{Decoder, Encoder};
use crate::policy::Exhausted;
use crate::protocol::{DecodeError, EncodeError, Packet, PacketType, ProtocolError};
use crate::registry::PendingDelivery;
use crate::transport::{ConnParams, Context, Message, Pipe, Socket, TransportError};
use crate::PipeId;

/// What happens to a pipe that sent a malformed or unexpected packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolErrorAction {
    /// Log and drop the packet
    #[default]
    Drop,
    /// Log and close the pipe
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub protocol_error_action: ProtocolErrorAction,
    pub retain_available: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            protocol_error_action: ProtocolErrorAction::Drop,
            retain_available: true,
        }
    }
}

/// Engine errors
#[derive(Debug)]
pub enum EngineError {
    Protocol(ProtocolError),
    Transport(TransportError),
    Exhausted(Exhausted),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Protocol(e) => write!(f, "{}", e),
            EngineError::Transport(e) => write!(f, "transport error: {}", e),
            EngineError::Exhausted(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        EngineError::Protocol(e)
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<EncodeError> for EngineError {
    fn from(e: EncodeError) -> Self {
        EngineError::Protocol(ProtocolError::Encode(e))
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        EngineError::Transport(e)
    }
}

impl From<Exhausted> for EngineError {
    fn from(e: Exhausted) -> Self {
        EngineError::Exhausted(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Init,
    Recv,
    Wait,
    Send,
}

/// One frame queued for a pipe
#[derive(Debug, Clone)]
struct Outbound {
    pipe: PipeId,
    frame: Bytes,
}

/// A work context
pub struct Work {
    id: usize,
    state: WorkState,
    ctx: Context,
    socket: Arc<Socket>,
    settings: Arc<EngineSettings>,
    /// Inbound message being handled
    msg: Option<Message>,
    /// Pipe the message came from, held until its replies are queued
    source: Option<Arc<Pipe>>,
    outbound: SmallVec<[Outbound; 8]>,
    /// Fan-out record of the packet being handled
    delivery: Option<Arc<PendingDelivery>>,
}

impl Work {
    pub fn new(id: usize, socket: Arc<Socket>, settings: Arc<EngineSettings>) -> Self {
        Self {
            id,
            state: WorkState::Init,
            ctx: socket.context(),
            socket,
            settings,
            msg: None,
            source: None,
            outbound: SmallVec::new(),
            delivery: None,
        }
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    /// Drive the context until the socket closes.
    pub async fn run(mut self) {
        trace!(ctx = self.id, "work context started");
        while self.step().await.is_ok() {}
        trace!(ctx = self.id, "work context stopped");
    }

    /// Run the handler of the current state and move to the next one.
    pub async fn step(&mut self) -> Result<(), TransportError> {
        self.state = match self.state {
            WorkState::Init => WorkState::Recv,
            WorkState::Recv => self.recv().await?,
            WorkState::Wait => self.wait(),
            WorkState::Send => self.send(),
        };
        Ok(())
    }

    async fn recv(&mut self) -> Result<WorkState, TransportError> {
        let msg = self.ctx.recv().await?;
        let source = msg.source().clone();

        if msg.packet_type() == Some(PacketType::Disconnect) {
            trace!(ctx = self.id, pipe = source.id(), "disconnect");
            self.socket.finish_inbound(&source);
            return Ok(WorkState::Recv);
        }

        self.msg = Some(msg);
        self.source = Some(source);
        Ok(WorkState::Wait)
    }

    fn wait(&mut self) -> WorkState {
        let Some(msg) = self.msg.take() else {
            self.finish();
            return WorkState::Recv;
        };
        let pipe = msg.pipe();
        let conn = msg.source().conn().clone();

        if let Err(e) = self.dispatch(msg, &conn) {
            self.on_error(pipe, &conn, e);
        }

        if self.outbound.is_empty() {
            self.delivery = None;
            self.finish();
            WorkState::Recv
        } else {
            WorkState::Send
        }
    }

    fn dispatch(&mut self, msg: Message, conn: &ConnParams) -> Result<(), EngineError> {
        let pipe = msg.pipe();
        let kind = msg.packet_type();

        // PUBREC is answered from the raw frame
        if kind == Some(PacketType::PubRec) {
            return self.handle_pubrec(msg, conn);
        }

        let mut decoder = Decoder::for_version(conn.protocol_version);
        let packet = decoder.decode_frame(msg.first_byte(), msg.body())?;
        drop(msg);

        match packet {
            Packet::PingReq => Ok(()),
            Packet::Subscribe(subscribe) => self.handle_subscribe(pipe, conn, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(pipe, conn, unsubscribe),
            Packet::Publish(publish) => self.handle_publish(pipe, conn, publish),
            Packet::PubAck(ack) | Packet::PubComp(ack) => {
                self.handle_ack(pipe, ack);
                Ok(())
            }
            Packet::PubRel(ack) => self.handle_pubrel(pipe, conn, ack),
            Packet::Connect(_) => Err(ProtocolError::Unexpected("second CONNECT").into()),
            other => {
                trace!(ctx = self.id, pipe, kind = ?other.packet_type(), "ignored packet");
                Ok(())
            }
        }
    }

    fn on_error(&mut self, pipe: PipeId, conn: &ConnParams, e: EngineError) {
        match &e {
            EngineError::Protocol(_) => {
                warn!(ctx = self.id, pipe, client_id = %conn.client_id, error = %e, "protocol error");
                if self.settings.protocol_error_action == ProtocolErrorAction::Disconnect {
                    self.outbound.retain(|o| o.pipe != pipe);
                    self.socket.close_pipe(pipe);
                }
            }
            EngineError::Transport(_) => {
                debug!(ctx = self.id, pipe, error = %e, "pipe went away while handling packet");
            }
            EngineError::Exhausted(_) => {
                warn!(ctx = self.id, pipe, client_id = %conn.client_id, error = %e, "packet rejected");
            }
        }
    }

    fn send(&mut self) -> WorkState {
        for out in self.outbound.drain(..) {
            if let Err(e) = self.socket.send(out.pipe, out.frame) {
                trace!(ctx = self.id, pipe = out.pipe, error = %e, "send dropped");
            }
        }
        if let Some(record) = self.delivery.take() {
            trace!(
                ctx = self.id,
                publisher = record.publisher,
                targets = record.total(),
                "fan-out issued"
            );
        }
        self.finish();
        WorkState::Recv
    }

    /// Hand the source pipe back to its reader.
    fn finish(&mut self) {
        if let Some(source) = self.source.take() {
            self.socket.finish_inbound(&source);
        }
    }

    /// The pipe a packet came from. Stays reachable through the message
    /// after the pipe was closed.
    fn source_pipe(&self, pipe: PipeId) -> Option<Arc<Pipe>> {
        match &self.source {
            Some(source) if source.id() == pipe => Some(source.clone()),
            _ => self.socket.pipe(pipe),
        }
    }

    fn queue(&mut self, pipe: PipeId, frame: Bytes) {
        self.outbound.push(Outbound { pipe, frame });
    }

    /// Encode a broker-built packet for `conn` and queue it.
    fn reply(&mut self, pipe: PipeId, conn: &ConnParams, packet: &Packet) -> Result<(), EngineError> {
        let frame = Encoder::new(conn.protocol_version).encode_to_vec(packet)?;
        self.queue(pipe, frame.freeze());
        Ok(())
    }
}

/// Start `parallel` work contexts on `socket`.
pub fn spawn_workers(
    socket: &Arc<Socket>,
    settings: EngineSettings,
    parallel: usize,
) -> Vec<JoinHandle<()>> {
    let settings = Arc::new(settings);
    (0..parallel.max(1))
        .map(|id| tokio::spawn(Work::new(id, socket.clone(), settings.clone()).run()))
        .collect()
}
