//! Transport Layer
//!
//! A [`Socket`] owns every live pipe (one per TCP connection) and hands
//! inbound frames to work contexts. Pipes with an unconsumed frame wait in
//! `recv_pipes`; contexts with nothing to do wait in `recvq`. Whichever
//! side arrives second completes the other.
//!
//! A pipe has at most one message in the engine. Its reader hands over the
//! next frame only after the work context that took the previous one
//! called [`Socket::finish_inbound`], so packets of one connection are
//! handled in order.
//!
//! Lock order is socket then pipe, never the reverse.

mod conn;
mod pipe;


pub use conn::{bind_listener, serve_stream};
pub use pipe::{ConnParams, Pipe, Stage, Tick};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use compact_str::{format_compact, CompactString};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::policy::{reserve, Exhausted, Resource, SharedPolicy};
use crate::protocol::{PacketType, ProtocolError};
use crate::registry::Registry;
use crate::topic::SubscriptionTrie;
use crate::PipeId;
use pipe::Closing;

/// Transport errors
#[derive(Debug)]
pub enum TransportError {
    /// Socket or pipe closed
    Closed,
    NoSuchPipe(PipeId),
    Io(io::Error),
    Protocol(ProtocolError),
    Exhausted(Exhausted),
    /// No CONNECT within the connect timeout
    Timeout,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::NoSuchPipe(id) => write!(f, "no such pipe: {}", id),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Exhausted(e) => write!(f, "{}", e),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Exhausted(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

impl From<Exhausted> for TransportError {
    fn from(e: Exhausted) -> Self {
        TransportError::Exhausted(e)
    }
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_packet_size: usize,
    /// 0 leaves the pipe count unbounded
    pub max_connections: usize,
    /// Frames parked per busy pipe before the oldest is dropped
    pub resend_queue_capacity: usize,
    /// Period of the per-pipe keepalive/resend timer
    pub qos_timer: Duration,
    /// Age after which an unacknowledged delivery is resent
    pub resend_after: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_connections: 0,
            resend_queue_capacity: 64,
            qos_timer: Duration::from_secs(3),
            resend_after: Duration::from_millis(3750),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One inbound control packet, still in wire form
///
/// The message keeps its pipe alive, so a handler can still read the
/// connection parameters after the pipe was closed.
#[derive(Debug)]
pub struct Message {
    source: Arc<Pipe>,
    frame: BytesMut,
    header_len: usize,
}

impl Message {
    pub fn new(source: Arc<Pipe>, frame: BytesMut, header_len: usize) -> Self {
        Self {
            source,
            frame,
            header_len,
        }
    }

    #[inline]
    pub fn pipe(&self) -> PipeId {
        self.source.id()
    }

    pub fn source(&self) -> &Arc<Pipe> {
        &self.source
    }

    #[inline]
    pub fn first_byte(&self) -> u8 {
        self.frame[0]
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::of_header(self.first_byte())
    }

    /// Variable header and payload
    pub fn body(&self) -> &[u8] {
        &self.frame[self.header_len..]
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn into_frame(self) -> BytesMut {
        self.frame
    }

    /// Turn a PUBREC frame into the matching PUBREL in place and return
    /// its packet id.
    pub fn rewrite_pubrec(&mut self) -> Option<u16> {
        if self.packet_type() != Some(PacketType::PubRec) || self.body().len() < 2 {
            return None;
        }
        let id = u16::from_be_bytes([self.frame[self.header_len], self.frame[self.header_len + 1]]);
        self.frame.truncate(2);
        self.frame[0] = 0x62;
        self.frame[1] = 0x02;
        self.frame.extend_from_slice(&id.to_be_bytes());
        self.header_len = 2;
        Some(id)
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Message, TransportError>>,
}

#[derive(Default)]
struct SocketInner {
    pipes: AHashMap<PipeId, Arc<Pipe>>,
    /// Pipes holding an inbound message no context took yet
    recv_pipes: VecDeque<PipeId>,
    /// Contexts waiting for a message
    recvq: VecDeque<Waiter>,
    closed: bool,
}

pub struct Socket {
    inner: Mutex<SocketInner>,
    registry: Arc<Registry>,
    trie: Arc<SubscriptionTrie>,
    policy: SharedPolicy,
    settings: TransportSettings,
    next_pipe: AtomicU32,
    next_waiter: AtomicU64,
}

/// Registry key holding the username a client connected with
pub fn user_key(client_id: &str) -> CompactString {
    format_compact!("user:{}", client_id)
}

impl Socket {
    pub fn new(
        settings: TransportSettings,
        registry: Arc<Registry>,
        trie: Arc<SubscriptionTrie>,
        policy: SharedPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SocketInner::default()),
            registry,
            trie,
            policy,
            settings,
            next_pipe: AtomicU32::new(1),
            next_waiter: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn trie(&self) -> &Arc<SubscriptionTrie> {
        &self.trie
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// A receive/send handle for one work context.
    pub fn context(self: &Arc<Self>) -> Context {
        Context {
            socket: self.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.lock().pipes.len()
    }

    pub fn pipe(&self, id: PipeId) -> Option<Arc<Pipe>> {
        self.inner.lock().pipes.get(&id).cloned()
    }

    pub(crate) fn next_pipe_id(&self) -> PipeId {
        self.next_pipe.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new pipe. Fails once the socket is closed or the
    /// connection limit is reached.
    pub fn attach(&self, id: PipeId, conn: ConnParams) -> Result<(Arc<Pipe>, mpsc::Receiver<Bytes>), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        reserve(
            &*self.policy,
            Resource::Connections,
            inner.pipes.len(),
            self.settings.max_connections,
        )?;
        let (pipe, rx) = Pipe::new(id, conn, self.settings.resend_queue_capacity);
        inner.pipes.insert(id, pipe.clone());
        Ok((pipe, rx))
    }

    /// Queue `frame` for `pipe`.
    pub fn send(&self, pipe: PipeId, frame: Bytes) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        let target = inner.pipes.get(&pipe).ok_or(TransportError::NoSuchPipe(pipe))?;
        target.send(frame)
    }

    /// Hand an inbound message to a waiting context, or park it on its
    /// pipe. The pipe counts as busy in the engine until
    /// [`finish_inbound`](Self::finish_inbound).
    pub(crate) fn deliver(&self, msg: Message) -> Result<(), TransportError> {
        let pipe = msg.source().clone();
        let mut inner = self.inner.lock();
        if inner.closed || !inner.pipes.contains_key(&pipe.id()) {
            return Err(TransportError::Closed);
        }
        pipe.begin_inbound()?;

        let mut msg = msg;
        while let Some(waiter) = inner.recvq.pop_front() {
            match waiter.tx.send(Ok(msg)) {
                Ok(()) => {
                    trace!(pipe = pipe.id(), waiter = waiter.id, "delivered to waiting context");
                    return Ok(());
                }
                // the context went away, try the next one
                Err(Ok(back)) => msg = back,
                Err(Err(e)) => {
                    drop(inner);
                    self.finish_inbound(&pipe);
                    return Err(e);
                }
            }
        }

        pipe.store_inbound(msg);
        inner.recv_pipes.push_back(pipe.id());
        Ok(())
    }

    /// A work context is done with the message it took from `pipe`. Runs
    /// the cleanup a close deferred meanwhile.
    pub fn finish_inbound(&self, pipe: &Pipe) {
        if pipe.finish_inbound() {
            self.release(pipe.id());
        }
    }

    /// Close one pipe and clean up everything it owned.
    ///
    /// While a packet of the pipe is still in the engine the cleanup waits
    /// for [`finish_inbound`](Self::finish_inbound), so a handler never
    /// re-adds state for a pipe that was already cleaned up.
    pub fn close_pipe(&self, id: PipeId) -> bool {
        let pipe = {
            let mut inner = self.inner.lock();
            inner.recv_pipes.retain(|p| *p != id);
            inner.pipes.remove(&id)
        };
        let Some(pipe) = pipe else {
            return false;
        };
        match pipe.close() {
            Closing::Already => false,
            Closing::Deferred => {
                debug!(pipe = id, "pipe closed, cleanup waits for the packet in the engine");
                true
            }
            Closing::Now => {
                self.release(id);
                true
            }
        }
    }

    /// Remove the subscriptions, pending deliveries and bindings of a
    /// closed pipe.
    ///
    /// Subscriptions are removed from the trie and the registry before
    /// the pipe/client binding goes away, since the cleanup resolves the
    /// client through it.
    fn release(&self, id: PipeId) {
        if let Some(client) = self.registry.client_of(id) {
            let removed = self.registry.remove_topics_where(&client, |e| e.pipe == id);
            for entry in &removed {
                self.trie.delete_client(&entry.filter, &client, Some(id));
            }
            if self.registry.pipe_of(&client) == Some(id) {
                self.registry.kv().del(&user_key(&client));
            }
            debug!(pipe = id, client_id = %client, subscriptions = removed.len(), "pipe closed");
        } else {
            debug!(pipe = id, "pipe closed");
        }

        let dropped = self.registry.drop_pending_for(id);
        if dropped > 0 {
            trace!(pipe = id, dropped, "abandoned pending deliveries");
        }
        self.registry.unbind(id);
    }

    /// Close the socket: waiting contexts fail with [`TransportError::Closed`]
    /// and every pipe is closed.
    pub fn close(&self) {
        let (waiters, pipes) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let waiters: Vec<Waiter> = inner.recvq.drain(..).collect();
            let pipes: Vec<PipeId> = inner.pipes.keys().copied().collect();
            (waiters, pipes)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(TransportError::Closed));
        }
        for id in pipes {
            self.close_pipe(id);
        }
        debug!("socket closed");
    }

    fn cancel_waiter(&self, id: u64) {
        self.inner.lock().recvq.retain(|w| w.id != id);
    }
}

/// Per-work-context handle onto the socket
#[derive(Clone)]
pub struct Context {
    socket: Arc<Socket>,
}

/// Removes a waiter from the socket queue if its receive is dropped early.
struct WaiterGuard<'a> {
    socket: &'a Socket,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.socket.cancel_waiter(self.id);
    }
}

impl Context {
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Wait for the next inbound message from any pipe.
    pub async fn recv(&self) -> Result<Message, TransportError> {
        let (id, rx) = {
            let mut inner = self.socket.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            while let Some(pipe_id) = inner.recv_pipes.pop_front() {
                let ready = inner.pipes.get(&pipe_id).and_then(|p| p.take_inbound());
                if let Some(msg) = ready {
                    return Ok(msg);
                }
            }
            let id = self.socket.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            inner.recvq.push_back(Waiter { id, tx });
            (id, rx)
        };

        let _guard = WaiterGuard {
            socket: &self.socket,
            id,
        };
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    pub fn send(&self, pipe: PipeId, frame: Bytes) -> Result<(), TransportError> {
        self.socket.send(pipe, frame)
    }
}
