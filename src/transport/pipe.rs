//! Pipe state
//!
//! Everything private to one connection sits behind the pipe lock: the
//! busy flag, the inbound message and whether the engine still holds it,
//! keepalive ticks, outbound QoS state and the writer hand-off. The resend
//! queue is lock-free but only touched with the pipe lock held so it stays
//! consistent with `busy`.
//!
//! At most one inbound packet per pipe is in the engine at a time. The
//! reader waits for [`Pipe::wait_handled`] before framing the next one, and
//! a pipe closed while its packet is in the engine defers its cleanup until
//! the engine lets go of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Message, TransportError};
use crate::protocol::ProtocolVersion;
use crate::PipeId;

/// Connection parameters negotiated by CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    pub protocol_version: ProtocolVersion,
    pub client_id: Arc<str>,
    /// Seconds, 0 disables the keepalive check
    pub keep_alive: u16,
    pub clean_start: bool,
    pub username: Option<String>,
}

/// Where an outbound QoS 1/2 delivery stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// PUBLISH sent, waiting for PUBACK or PUBREC
    Publish,
    /// PUBREL sent, waiting for PUBCOMP
    PubRel,
}

#[derive(Debug, Clone)]
struct Inflight {
    frame: Bytes,
    stage: Stage,
    sent_at: Instant,
    resent: bool,
}

/// Outcome of [`Pipe::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Closing {
    /// Someone else closed it first
    Already,
    /// Nothing from the pipe is in the engine, clean up now
    Now,
    /// The engine still handles a packet from the pipe and cleans up
    /// when it finishes
    Deferred,
}

/// What a timer tick asks the caller to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    /// Keepalive expired
    Close,
    /// Send this frame again
    Resend(u16, Bytes),
}

#[derive(Debug, Default)]
struct PipeState {
    busy: bool,
    closed: bool,
    inbound: Option<Message>,
    /// An inbound packet was delivered and is not handled yet
    in_engine: bool,
    /// Closed while `in_engine`; cleanup runs on finish
    cleanup_deferred: bool,
    /// Timer ticks since the last inbound frame
    ka_refresh: u32,
    next_packet_id: u16,
    inflight: AHashMap<u16, Inflight>,
    /// Inbound QoS 2 ids answered with PUBREC, waiting for PUBREL
    awaiting_rel: AHashSet<u16>,
    /// Filters subscribed through this pipe
    subscribed: AHashSet<Arc<str>>,
    writer: Option<mpsc::Sender<Bytes>>,
}

pub struct Pipe {
    id: PipeId,
    conn: ConnParams,
    state: Mutex<PipeState>,
    queue: ArrayQueue<Bytes>,
    /// Signalled when the engine finishes an inbound packet or the pipe
    /// closes
    handled: Notify,
    /// Signalled once on close
    closing: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Pipe {
    /// Create a pipe and the receiving end of its writer hand-off.
    pub fn new(
        id: PipeId,
        conn: ConnParams,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(1);
        let pipe = Arc::new(Self {
            id,
            conn,
            state: Mutex::new(PipeState {
                next_packet_id: 1,
                writer: Some(tx),
                ..Default::default()
            }),
            queue: ArrayQueue::new(queue_capacity.max(1)),
            handled: Notify::new(),
            closing: Notify::new(),
            timer: Mutex::new(None),
        });
        (pipe, rx)
    }

    #[inline]
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn conn(&self) -> &ConnParams {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Hand `frame` to the writer, or park it in the resend queue while a
    /// send is already in flight. A full queue drops its oldest entry.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        self.send_locked(&mut st, frame)
    }

    fn send_locked(&self, st: &mut PipeState, frame: Bytes) -> Result<(), TransportError> {
        if st.closed {
            return Err(TransportError::Closed);
        }
        if st.busy {
            if self.queue.force_push(frame).is_some() {
                debug!(pipe = self.id, "resend queue full, dropped oldest message");
            }
            return Ok(());
        }

        let writer = st.writer.as_ref().ok_or(TransportError::Closed)?;
        writer.try_send(frame).map_err(|_| TransportError::Closed)?;
        st.busy = true;
        Ok(())
    }

    /// Called by the writer after a frame hit the socket. Queued frames go
    /// out before the pipe is marked idle.
    pub fn send_complete(&self) {
        let mut st = self.state.lock();
        match self.queue.pop() {
            Some(next) => {
                let sent = st
                    .writer
                    .as_ref()
                    .is_some_and(|w| w.try_send(next).is_ok());
                if !sent {
                    st.busy = false;
                }
            }
            None => st.busy = false,
        }
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Mark an inbound packet as owned by the engine.
    pub(super) fn begin_inbound(&self) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        st.in_engine = true;
        Ok(())
    }

    /// Park an inbound message until a context takes it.
    pub(super) fn store_inbound(&self, msg: Message) {
        self.state.lock().inbound = Some(msg);
    }

    pub(super) fn take_inbound(&self) -> Option<Message> {
        self.state.lock().inbound.take()
    }

    /// The engine is done with the current inbound packet. Returns true
    /// when the pipe closed meanwhile and its cleanup is now due.
    pub(super) fn finish_inbound(&self) -> bool {
        let cleanup = {
            let mut st = self.state.lock();
            st.in_engine = false;
            st.closed && std::mem::take(&mut st.cleanup_deferred)
        };
        self.handled.notify_one();
        cleanup
    }

    pub fn in_engine(&self) -> bool {
        self.state.lock().in_engine
    }

    /// Wait until the engine finished the last delivered packet. Returns
    /// false if the pipe closed meanwhile.
    pub(super) async fn wait_handled(&self) -> bool {
        loop {
            {
                let st = self.state.lock();
                if st.closed {
                    return false;
                }
                if !st.in_engine {
                    return true;
                }
            }
            self.handled.notified().await;
        }
    }

    pub(super) async fn wait_closing(&self) {
        self.closing.notified().await;
    }

    /// Inbound activity resets the keepalive count.
    pub fn touch(&self) {
        self.state.lock().ka_refresh = 0;
    }

    // ------------------------------------------------------------------
    // timer
    // ------------------------------------------------------------------

    pub(super) fn set_timer(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.timer.lock().replace(handle) {
            old.abort();
        }
    }

    /// One keepalive/resend tick.
    pub fn tick(&self, qos_timer: Duration, resend_after: Duration) -> Tick {
        let mut st = self.state.lock();
        if st.closed {
            return Tick::Idle;
        }

        let keep_alive = Duration::from_secs(u64::from(self.conn.keep_alive));
        if !keep_alive.is_zero() && qos_timer * st.ka_refresh > keep_alive {
            return Tick::Close;
        }
        st.ka_refresh = st.ka_refresh.saturating_add(1);

        if st.busy {
            return Tick::Idle;
        }

        let now = Instant::now();
        let oldest = st
            .inflight
            .iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= resend_after)
            .min_by_key(|(_, f)| f.sent_at)
            .map(|(&id, _)| id);
        let Some(id) = oldest else {
            return Tick::Idle;
        };
        let Some(entry) = st.inflight.get_mut(&id) else {
            return Tick::Idle;
        };

        if entry.stage == Stage::Publish && !entry.resent {
            let mut frame = BytesMut::from(&entry.frame[..]);
            frame[0] |= 0x08;
            entry.frame = frame.freeze();
        }
        entry.resent = true;
        entry.sent_at = now;
        trace!(pipe = self.id, packet_id = id, stage = ?entry.stage, "resending");
        Tick::Resend(id, entry.frame.clone())
    }

    // ------------------------------------------------------------------
    // outbound QoS state
    // ------------------------------------------------------------------

    /// Next packet id not in flight on this pipe.
    pub fn alloc_packet_id(&self) -> Option<u16> {
        let mut st = self.state.lock();
        if st.inflight.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            let id = st.next_packet_id;
            st.next_packet_id = match id.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !st.inflight.contains_key(&id) {
                return Some(id);
            }
        }
    }

    pub fn track_inflight(&self, packet_id: u16, frame: Bytes) {
        self.state.lock().inflight.insert(
            packet_id,
            Inflight {
                frame,
                stage: Stage::Publish,
                sent_at: Instant::now(),
                resent: false,
            },
        );
    }

    /// PUBACK or PUBCOMP arrived. Returns false for unknown ids.
    pub fn complete_inflight(&self, packet_id: u16) -> bool {
        self.state.lock().inflight.remove(&packet_id).is_some()
    }

    /// PUBREC arrived: the entry now waits for PUBCOMP and resends `pubrel`.
    pub fn release_inflight(&self, packet_id: u16, pubrel: Bytes) -> bool {
        let mut st = self.state.lock();
        match st.inflight.get_mut(&packet_id) {
            Some(entry) => {
                entry.stage = Stage::PubRel;
                entry.frame = pubrel;
                entry.sent_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn inflight_stage(&self, packet_id: u16) -> Option<Stage> {
        self.state.lock().inflight.get(&packet_id).map(|f| f.stage)
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    // ------------------------------------------------------------------
    // inbound QoS 2
    // ------------------------------------------------------------------

    /// Remember an inbound QoS 2 id. False if it was already held.
    pub fn hold_qos2(&self, packet_id: u16) -> bool {
        self.state.lock().awaiting_rel.insert(packet_id)
    }

    pub fn release_qos2(&self, packet_id: u16) -> bool {
        self.state.lock().awaiting_rel.remove(&packet_id)
    }

    // ------------------------------------------------------------------
    // subscriptions made through this pipe
    // ------------------------------------------------------------------

    pub fn note_subscribed(&self, filter: &Arc<str>) {
        self.state.lock().subscribed.insert(filter.clone());
    }

    pub fn forget_subscribed(&self, filter: &str) -> bool {
        self.state.lock().subscribed.remove(filter)
    }

    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.state.lock().subscribed.contains(filter)
    }

    // ------------------------------------------------------------------
    // teardown
    // ------------------------------------------------------------------

    /// Mark closed, drop buffers and the writer hand-off, cancel the timer.
    ///
    /// A parked message no context took yet is dropped with the pipe. One
    /// already taken keeps the cleanup waiting for its handler.
    pub(super) fn close(&self) -> Closing {
        let (parked, outcome) = {
            let mut st = self.state.lock();
            if st.closed {
                return Closing::Already;
            }
            st.closed = true;
            st.busy = false;
            let parked = st.inbound.take();
            if parked.is_some() {
                st.in_engine = false;
            }
            st.cleanup_deferred = st.in_engine;
            st.inflight.clear();
            st.awaiting_rel.clear();
            st.subscribed.clear();
            st.writer = None;
            while self.queue.pop().is_some() {}
            let outcome = if st.cleanup_deferred {
                Closing::Deferred
            } else {
                Closing::Now
            };
            (parked, outcome)
        };
        drop(parked);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.handled.notify_one();
        self.closing.notify_one();
        outcome
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("client_id", &self.conn.client_id)
            .finish_non_exhaustive()
    }
}
