//! Capacity Policy
//!
//! Decides what happens when a bounded resource runs out. The broker is
//! sized up front, so the default is to abort the process; tests install
//! [`RejectPolicy`] to exercise the exhausted path without dying.

use std::fmt;
use std::sync::Arc;

use tracing::error;

/// A bounded resource the broker can exhaust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Nodes in the subscription trie
    TopicNodes,
    /// Outstanding pending-delivery records
    PendingDeliveries,
    /// Live pipes
    Connections,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::TopicNodes => write!(f, "topic nodes"),
            Resource::PendingDeliveries => write!(f, "pending deliveries"),
            Resource::Connections => write!(f, "connections"),
        }
    }
}

/// What the caller should do after the policy ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    Abort,
    Reject,
}

/// Error returned when a policy rejects an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted(pub Resource);

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource exhausted: {}", self.0)
    }
}

impl std::error::Error for Exhausted {}

/// Injectable reaction to resource exhaustion
pub trait CapacityPolicy: Send + Sync {
    fn on_exhausted(&self, resource: Resource) -> Exhaustion;
}

/// Log and abort the process
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortPolicy;

impl CapacityPolicy for AbortPolicy {
    fn on_exhausted(&self, resource: Resource) -> Exhaustion {
        error!(%resource, "capacity exhausted, aborting");
        std::process::abort()
    }
}

/// Refuse the allocation and let the caller fail the operation
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectPolicy;

impl CapacityPolicy for RejectPolicy {
    fn on_exhausted(&self, _resource: Resource) -> Exhaustion {
        Exhaustion::Reject
    }
}

pub type SharedPolicy = Arc<dyn CapacityPolicy>;

/// Run `policy` for `resource` and turn a rejection into an error.
///
/// An `Abort` answer from a custom policy aborts here.
pub fn exhaust(policy: &dyn CapacityPolicy, resource: Resource) -> Exhausted {
    match policy.on_exhausted(resource) {
        Exhaustion::Reject => Exhausted(resource),
        Exhaustion::Abort => {
            error!(%resource, "capacity exhausted, aborting");
            std::process::abort()
        }
    }
}

/// Check `used` against `limit` (0 means unbounded).
pub fn reserve(
    policy: &dyn CapacityPolicy,
    resource: Resource,
    used: usize,
    limit: usize,
) -> Result<(), Exhausted> {
    if limit != 0 && used >= limit {
        return Err(exhaust(policy, resource));
    }
    Ok(())
}
