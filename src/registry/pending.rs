//! Pending delivery records
//!
//! One record per fanned-out QoS 1/2 publish. It lists every target the
//! publish went to and counts acknowledgements; targets delivered at QoS 0
//! are finished from the start.

use parking_lot::Mutex;

use crate::protocol::{PacketType, QoS};
use crate::PipeId;

/// One target of a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryEntry {
    pub pipe: PipeId,
    pub qos: QoS,
    /// Packet type sent to the target
    pub cmd: PacketType,
    /// Outbound packet id on the target pipe, QoS 1/2 only
    pub packet_id: Option<u16>,
    pub finished: bool,
}

impl DeliveryEntry {
    pub fn publish(pipe: PipeId, qos: QoS, packet_id: Option<u16>) -> Self {
        Self {
            pipe,
            qos,
            cmd: PacketType::Publish,
            packet_id,
            finished: !qos.needs_ack(),
        }
    }
}

/// Outcome of acknowledging one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Entry finished, others still outstanding
    Progress,
    /// Every entry is now finished
    Done,
    /// No unfinished entry for that target
    Ignored,
}

#[derive(Debug)]
struct Progress {
    entries: Vec<DeliveryEntry>,
    finished: usize,
}

#[derive(Debug)]
pub struct PendingDelivery {
    /// Pipe that published the message
    pub publisher: PipeId,
    /// Packet id the publisher used
    pub source_packet_id: u16,
    progress: Mutex<Progress>,
}

impl PendingDelivery {
    pub fn new(publisher: PipeId, source_packet_id: u16, entries: Vec<DeliveryEntry>) -> Self {
        let finished = entries.iter().filter(|e| e.finished).count();
        Self {
            publisher,
            source_packet_id,
            progress: Mutex::new(Progress { entries, finished }),
        }
    }

    pub fn total(&self) -> usize {
        self.progress.lock().entries.len()
    }

    pub fn finished(&self) -> usize {
        self.progress.lock().finished
    }

    pub fn is_complete(&self) -> bool {
        let p = self.progress.lock();
        p.finished == p.entries.len()
    }

    pub fn entries(&self) -> Vec<DeliveryEntry> {
        self.progress.lock().entries.clone()
    }

    /// Mark the entry sent to `pipe` with `packet_id` finished.
    pub fn finish(&self, pipe: PipeId, packet_id: u16) -> Completion {
        let mut p = self.progress.lock();
        let Some(entry) = p
            .entries
            .iter_mut()
            .find(|e| e.pipe == pipe && e.packet_id == Some(packet_id) && !e.finished)
        else {
            return Completion::Ignored;
        };
        entry.finished = true;
        p.finished += 1;
        if p.finished == p.entries.len() {
            Completion::Done
        } else {
            Completion::Progress
        }
    }

    /// Finish every unfinished entry targeting `pipe`.
    pub fn abandon(&self, pipe: PipeId) -> Completion {
        let mut p = self.progress.lock();
        let mut n = 0;
        for entry in p.entries.iter_mut().filter(|e| e.pipe == pipe && !e.finished) {
            entry.finished = true;
            n += 1;
        }
        if n == 0 {
            return Completion::Ignored;
        }
        p.finished += n;
        if p.finished == p.entries.len() {
            Completion::Done
        } else {
            Completion::Progress
        }
    }
}
