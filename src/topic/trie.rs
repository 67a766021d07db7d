//! Subscription Trie
//!
//! One node per topic level, stored in an indexed arena. Wildcard levels
//! are ordinary children keyed `+` and `#`, so a filter's node is found by
//! walking its levels literally while a published topic is matched by
//! trying the literal, `+` and `#` children at every level.
//!
//! Nodes are addressed through [`NodeHandle`]s carrying a generation. A
//! handle to a pruned node is stale and every operation on it is a no-op.

use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::validation::split_levels;
use super::{RetainedMessage, Subscriber, SubscriberMatch};
use crate::policy::{reserve, Exhausted, Resource, SharedPolicy};
use crate::PipeId;

type NodeId = u32;

const ROOT: NodeId = 0;

/// Stable reference to a trie node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: NodeId,
    generation: u32,
}

/// Result of [`SubscriptionTrie::insert_subscriber`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Subscriber added; `created` when the filter's node was new
    Added { created: bool },
    /// Same client and pipe were already subscribed; options replaced
    Replaced,
    /// Same client id subscribed from another pipe, nothing changed
    Duplicate,
}

#[derive(Debug)]
struct Node {
    segment: CompactString,
    parent: Option<NodeId>,
    children: AHashMap<CompactString, NodeId>,
    subscribers: Vec<Subscriber>,
    retained: Option<RetainedMessage>,
}

impl Node {
    fn new(segment: &str, parent: Option<NodeId>) -> Self {
        Self {
            segment: CompactString::new(segment),
            parent,
            children: AHashMap::new(),
            subscribers: Vec::new(),
            retained: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.retained.is_none() && self.children.is_empty()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<NodeId>,
    live: usize,
}

impl Arena {
    fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node::new("", None)),
            }],
            free: Vec::new(),
            live: 1,
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id as usize)?.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id as usize)?.node.as_mut()
    }

    fn resolve(&self, handle: NodeHandle) -> Option<NodeId> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.node.is_some()).then_some(handle.index)
    }

    fn handle(&self, id: NodeId) -> NodeHandle {
        NodeHandle {
            index: id,
            generation: self.slots[id as usize].generation,
        }
    }

    fn child(&self, id: NodeId, segment: &str) -> Option<NodeId> {
        self.node(id)?.children.get(segment).copied()
    }

    fn alloc(&mut self, segment: &str, parent: NodeId) -> NodeId {
        let node = Node::new(segment, Some(parent));
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id as usize].node = Some(node);
                id
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as NodeId
            }
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.insert(CompactString::new(segment), id);
        }
        self.live += 1;
        id
    }

    /// Remove `id` and every ancestor left empty by its removal.
    fn prune(&mut self, mut id: NodeId) {
        while id != ROOT {
            let Some(node) = self.node(id) else { return };
            if !node.is_empty() {
                return;
            }
            let parent = node.parent;
            let segment = node.segment.clone();

            let slot = &mut self.slots[id as usize];
            slot.node = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id);
            self.live -= 1;

            let Some(parent) = parent else { return };
            if let Some(p) = self.node_mut(parent) {
                p.children.remove(segment.as_str());
            }
            id = parent;
        }
    }

    /// Walk `levels` literally from the root, without creating anything.
    fn find(&self, levels: &[&str]) -> Option<NodeId> {
        levels
            .iter()
            .try_fold(ROOT, |id, level| self.child(id, level))
    }
}

pub struct SubscriptionTrie {
    arena: RwLock<Arena>,
    max_nodes: usize,
    policy: SharedPolicy,
}

impl SubscriptionTrie {
    /// `max_nodes` of 0 leaves the trie unbounded.
    pub fn new(max_nodes: usize, policy: SharedPolicy) -> Self {
        Self {
            arena: RwLock::new(Arena::new()),
            max_nodes,
            policy,
        }
    }

    /// Walk the levels of `topic`, creating missing nodes.
    ///
    /// Returns the leaf and whether it was created by this call.
    pub fn search_node(&self, topic: &str) -> Result<(NodeHandle, bool), Exhausted> {
        let mut arena = self.arena.write();
        let (id, created) = self.walk_create(&mut arena, topic)?;
        Ok((arena.handle(id), created))
    }

    fn walk_create(&self, arena: &mut Arena, topic: &str) -> Result<(NodeId, bool), Exhausted> {
        let mut id = ROOT;
        let mut created = false;
        for level in split_levels(topic) {
            id = match arena.child(id, level) {
                Some(child) => child,
                None => {
                    if let Err(e) =
                        reserve(&*self.policy, Resource::TopicNodes, arena.live, self.max_nodes)
                    {
                        arena.prune(id);
                        return Err(e);
                    }
                    created = true;
                    arena.alloc(level, id)
                }
            };
        }
        Ok((id, created))
    }

    /// Node for an existing topic or filter, if any.
    pub fn find_node(&self, topic: &str) -> Option<NodeHandle> {
        let arena = self.arena.read();
        let levels = split_levels(topic);
        arena.find(&levels).map(|id| arena.handle(id))
    }

    /// Link a subscriber at `node`.
    ///
    /// Callers check for an existing entry with [`check_client`] first.
    /// Returns false on a stale handle.
    ///
    /// [`check_client`]: Self::check_client
    pub fn add_client(&self, node: NodeHandle, subscriber: Subscriber) -> bool {
        let mut arena = self.arena.write();
        let Some(id) = arena.resolve(node) else {
            return false;
        };
        match arena.node_mut(id) {
            Some(n) => {
                n.subscribers.push(subscriber);
                true
            }
            None => false,
        }
    }

    pub fn check_client(&self, node: NodeHandle, client_id: &str) -> bool {
        let arena = self.arena.read();
        arena
            .resolve(node)
            .and_then(|id| arena.node(id))
            .is_some_and(|n| n.subscribers.iter().any(|s| &*s.client_id == client_id))
    }

    /// Create-or-find the node for `filter` and link `subscriber` there
    /// under a single write lock.
    pub fn insert_subscriber(
        &self,
        filter: &str,
        subscriber: Subscriber,
    ) -> Result<InsertOutcome, Exhausted> {
        let mut arena = self.arena.write();
        let (id, created) = self.walk_create(&mut arena, filter)?;
        let Some(node) = arena.node_mut(id) else {
            return Ok(InsertOutcome::Duplicate);
        };

        match node
            .subscribers
            .iter_mut()
            .find(|s| s.client_id == subscriber.client_id)
        {
            Some(existing) if existing.pipe == subscriber.pipe => {
                *existing = subscriber;
                Ok(InsertOutcome::Replaced)
            }
            Some(_) => Ok(InsertOutcome::Duplicate),
            None => {
                node.subscribers.push(subscriber);
                Ok(InsertOutcome::Added { created })
            }
        }
    }

    /// Remove `client_id` from the node of `filter`, optionally only when
    /// it was subscribed from `pipe`. Empty nodes are pruned.
    pub fn delete_client(&self, filter: &str, client_id: &str, pipe: Option<PipeId>) -> bool {
        let mut arena = self.arena.write();
        let levels = split_levels(filter);
        let Some(id) = arena.find(&levels) else {
            return false;
        };
        let Some(node) = arena.node_mut(id) else {
            return false;
        };

        let before = node.subscribers.len();
        node.subscribers
            .retain(|s| !(&*s.client_id == client_id && pipe.map_or(true, |p| p == s.pipe)));
        let removed = node.subscribers.len() != before;
        arena.prune(id);
        removed
    }

    /// Every subscriber whose filter matches `topic`, one entry per client.
    ///
    /// A client matched through several filters gets the highest granted
    /// QoS and every subscription identifier involved. Subscriptions with
    /// no-local set are skipped when they belong to `publisher`.
    ///
    /// When the client subscribed from more than one live pipe, the merged
    /// delivery goes to the pipe of the first subscription reached. At each
    /// level `#` is visited before `+`, and both before the exact name.
    pub fn search_client(
        &self,
        topic: &str,
        publisher: Option<PipeId>,
    ) -> SmallVec<[SubscriberMatch; 16]> {
        let arena = self.arena.read();
        let levels = split_levels(topic);

        let mut out: SmallVec<[SubscriberMatch; 16]> = SmallVec::new();
        let mut seen: AHashMap<Arc<str>, usize> = AHashMap::new();

        collect_matches(&arena, ROOT, &levels, 0, &mut |sub: &Subscriber| {
            if sub.options.no_local && publisher == Some(sub.pipe) {
                return;
            }
            match seen.get(&sub.client_id) {
                Some(&i) => out[i].merge(sub),
                None => {
                    seen.insert(sub.client_id.clone(), out.len());
                    out.push(SubscriberMatch::from(sub));
                }
            }
        });

        out
    }

    pub fn get_retain_msg(&self, node: NodeHandle) -> Option<RetainedMessage> {
        let arena = self.arena.read();
        let id = arena.resolve(node)?;
        arena.node(id)?.retained.clone()
    }

    /// Replace the retained slot; `None` clears it and prunes the node when
    /// nothing else keeps it alive. Returns false on a stale handle.
    pub fn set_retain_msg(&self, node: NodeHandle, msg: Option<RetainedMessage>) -> bool {
        let mut arena = self.arena.write();
        let Some(id) = arena.resolve(node) else {
            return false;
        };
        let clearing = msg.is_none();
        if let Some(n) = arena.node_mut(id) {
            n.retained = msg;
        }
        if clearing {
            arena.prune(id);
        }
        true
    }

    /// Store or clear the retained message of `topic`.
    ///
    /// Clearing a topic that has no node is a no-op and creates nothing.
    pub fn retain(&self, topic: &str, msg: Option<RetainedMessage>) -> Result<(), Exhausted> {
        match msg {
            Some(msg) => {
                let mut arena = self.arena.write();
                let (id, _) = self.walk_create(&mut arena, topic)?;
                if let Some(n) = arena.node_mut(id) {
                    n.retained = Some(msg);
                }
            }
            None => {
                let mut arena = self.arena.write();
                let levels = split_levels(topic);
                if let Some(id) = arena.find(&levels) {
                    if let Some(n) = arena.node_mut(id) {
                        n.retained = None;
                    }
                    arena.prune(id);
                }
            }
        }
        Ok(())
    }

    /// Retained messages on every topic matched by `filter`.
    pub fn search_retain_msg(&self, filter: &str) -> Vec<RetainedMessage> {
        let arena = self.arena.read();
        let levels = split_levels(filter);
        let mut out = Vec::new();
        collect_retained(&arena, ROOT, &levels, 0, &mut out);
        out
    }

    /// Subscribers stored at exactly `filter`.
    pub fn subscribers(&self, filter: &str) -> Vec<Subscriber> {
        let arena = self.arena.read();
        let levels = split_levels(filter);
        arena
            .find(&levels)
            .and_then(|id| arena.node(id))
            .map(|n| n.subscribers.clone())
            .unwrap_or_default()
    }

    /// Live nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.arena.read().live
    }
}

fn is_wildcard(segment: &str) -> bool {
    segment == "+" || segment == "#"
}

/// Depth-first match of a topic name against stored filters.
fn collect_matches(
    arena: &Arena,
    id: NodeId,
    levels: &[&str],
    depth: usize,
    visit: &mut dyn FnMut(&Subscriber),
) {
    let Some(node) = arena.node(id) else { return };

    if depth == levels.len() {
        node.subscribers.iter().for_each(&mut *visit);
        // "a/#" also matches "a"
        if let Some(multi) = arena.child(id, "#").and_then(|c| arena.node(c)) {
            multi.subscribers.iter().for_each(&mut *visit);
        }
        return;
    }

    let level = levels[depth];
    let wildcards_apply = !(depth == 0 && level.starts_with('$'));

    if wildcards_apply {
        if let Some(multi) = arena.child(id, "#").and_then(|c| arena.node(c)) {
            multi.subscribers.iter().for_each(&mut *visit);
        }
        if let Some(single) = arena.child(id, "+") {
            collect_matches(arena, single, levels, depth + 1, visit);
        }
    }
    if !is_wildcard(level) {
        if let Some(child) = arena.child(id, level) {
            collect_matches(arena, child, levels, depth + 1, visit);
        }
    }
}

/// Depth-first match of a filter against stored topic names.
fn collect_retained(
    arena: &Arena,
    id: NodeId,
    levels: &[&str],
    depth: usize,
    out: &mut Vec<RetainedMessage>,
) {
    let Some(node) = arena.node(id) else { return };

    if depth == levels.len() {
        out.extend(node.retained.iter().cloned());
        return;
    }

    match levels[depth] {
        "#" => {
            // parent level itself, then everything below
            out.extend(node.retained.iter().cloned());
            for (segment, &child) in &node.children {
                if is_wildcard(segment) || (depth == 0 && segment.starts_with('$')) {
                    continue;
                }
                collect_subtree(arena, child, out);
            }
        }
        "+" => {
            for (segment, &child) in &node.children {
                if is_wildcard(segment) || (depth == 0 && segment.starts_with('$')) {
                    continue;
                }
                collect_retained(arena, child, levels, depth + 1, out);
            }
        }
        level => {
            if let Some(child) = arena.child(id, level) {
                collect_retained(arena, child, levels, depth + 1, out);
            }
        }
    }
}

fn collect_subtree(arena: &Arena, id: NodeId, out: &mut Vec<RetainedMessage>) {
    let Some(node) = arena.node(id) else { return };
    out.extend(node.retained.iter().cloned());
    for (segment, &child) in &node.children {
        if !is_wildcard(segment) {
            collect_subtree(arena, child, out);
        }
    }
}
