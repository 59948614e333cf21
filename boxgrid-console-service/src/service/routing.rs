use boxgrid_common::model::NodeId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub node_id: NodeId,
    pub last_used_ms: i64,
}

#[derive(Default)]
struct RouteMaps {
    routes: HashMap<String, RouteEntry>,
    // Reverse index for node-scoped eviction on session close.
    by_node: HashMap<NodeId, HashSet<String>>,
}

impl RouteMaps {
    fn unlink(&mut self, terminal_session_id: &str, node_id: &NodeId) {
        if let Some(set) = self.by_node.get_mut(node_id) {
            set.remove(terminal_session_id);
            if set.is_empty() {
                self.by_node.remove(node_id);
            }
        }
    }

    fn link(&mut self, terminal_session_id: &str, node_id: &NodeId) {
        self.by_node
            .entry(node_id.clone())
            .or_default()
            .insert(terminal_session_id.to_string());
    }
}

/// Sticky terminal-session -> node map. Routes expire after `ttl` of
/// disuse and are pruned opportunistically on dispatch, at most once per
/// `prune_interval`.
pub struct TerminalRouteTable {
    inner: Mutex<RouteMaps>,
    ttl_ms: i64,
    prune_interval_ms: i64,
    last_prune_ms: AtomicI64,
}

impl TerminalRouteTable {
    pub fn new(ttl: Duration, prune_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(RouteMaps::default()),
            ttl_ms: ttl.as_millis() as i64,
            prune_interval_ms: prune_interval.as_millis() as i64,
            last_prune_ms: AtomicI64::new(0),
        }
    }

    /// Looks up the route and refreshes its `last_used`.
    pub fn lookup(&self, terminal_session_id: &str, now: DateTime<Utc>) -> Option<NodeId> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.routes.get_mut(terminal_session_id)?;
        entry.last_used_ms = now.timestamp_millis();
        Some(entry.node_id.clone())
    }

    /// Unconditionally binds the route, moving the reverse-index link when
    /// the session was previously pinned to a different node.
    pub fn bind(&self, terminal_session_id: &str, node_id: &NodeId, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.routes.get(terminal_session_id).cloned() {
            if previous.node_id != *node_id {
                inner.unlink(terminal_session_id, &previous.node_id);
            }
        }
        inner.link(terminal_session_id, node_id);
        inner.routes.insert(
            terminal_session_id.to_string(),
            RouteEntry {
                node_id: node_id.clone(),
                last_used_ms: now.timestamp_millis(),
            },
        );
    }

    /// Reservation: installs the route only when absent. Returns the node
    /// the route maps to afterwards, which is the race winner's.
    pub fn reserve(&self, terminal_session_id: &str, node_id: &NodeId, now: DateTime<Utc>) -> NodeId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.routes.get_mut(terminal_session_id) {
            existing.last_used_ms = now.timestamp_millis();
            return existing.node_id.clone();
        }
        inner.link(terminal_session_id, node_id);
        inner.routes.insert(
            terminal_session_id.to_string(),
            RouteEntry {
                node_id: node_id.clone(),
                last_used_ms: now.timestamp_millis(),
            },
        );
        node_id.clone()
    }

    pub fn clear(&self, terminal_session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.routes.remove(terminal_session_id) {
            inner.unlink(terminal_session_id, &entry.node_id);
        }
    }

    /// Clears the route only if it still maps to `node_id`.
    pub fn clear_if_node(&self, terminal_session_id: &str, node_id: &NodeId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .routes
            .get(terminal_session_id)
            .is_some_and(|entry| entry.node_id == *node_id);
        if matches {
            inner.routes.remove(terminal_session_id);
            inner.unlink(terminal_session_id, node_id);
        }
        matches
    }

    /// Evicts every route pinned to `node_id`.
    pub fn clear_node(&self, node_id: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sessions) = inner.by_node.remove(node_id) {
            for terminal_session_id in sessions {
                inner.routes.remove(&terminal_session_id);
            }
        }
    }

    /// TTL prune, gated by a compare-and-swap on the last prune timestamp
    /// so that concurrent dispatches do not all pay for it.
    pub fn maybe_prune(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now_ms - last < self.prune_interval_ms {
            return;
        }
        if self
            .last_prune_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<(String, NodeId)> = inner
            .routes
            .iter()
            .filter(|(_, entry)| now_ms - entry.last_used_ms >= self.ttl_ms)
            .map(|(id, entry)| (id.clone(), entry.node_id.clone()))
            .collect();
        for (terminal_session_id, node_id) in expired {
            debug!(%terminal_session_id, %node_id, "Pruning expired terminal route");
            inner.routes.remove(&terminal_session_id);
            inner.unlink(&terminal_session_id, &node_id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
