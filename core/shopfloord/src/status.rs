//! Live status plumbing: the cursor cache, the broadcast fan-out, and the
//! periodically refreshed machine-status cache.
//!
//! All three are read-heavy structures guarded by plain mutexes. Cursor
//! expiry is lazy (computed against the TTL at read time, nothing is ever
//! evicted by a timer) and the status cache is replaced wholesale by the
//! refresh thread so readers always see one consistent batch.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shopfloor_protocol::BroadcastMessage;

#[derive(Debug, Clone, Serialize)]
pub struct CursorView {
    pub operation_id: String,
    pub operation_name: String,
    pub last_activity_at: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
struct CursorEntry {
    operation_name: String,
    last_activity_at: DateTime<Utc>,
}

/// Which operation each client is currently looking at, keyed by operation
/// id. Entries are never removed; staleness is a property of the read.
pub struct CursorCache {
    ttl_secs: i64,
    entries: Mutex<HashMap<String, CursorEntry>>,
}

impl CursorCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn touch(&self, operation_id: &str, operation_name: Option<&str>, now: DateTime<Utc>) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries
            .entry(operation_id.to_string())
            .or_insert_with(|| CursorEntry {
                operation_name: String::new(),
                last_activity_at: now,
            });
        entry.last_activity_at = now;
        if let Some(name) = operation_name {
            if !name.trim().is_empty() {
                entry.operation_name = name.trim().to_string();
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<CursorView> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut views: Vec<CursorView> = entries
            .iter()
            .map(|(operation_id, entry)| CursorView {
                operation_id: operation_id.clone(),
                operation_name: entry.operation_name.clone(),
                last_activity_at: entry.last_activity_at.to_rfc3339(),
                is_active: (now - entry.last_activity_at).num_seconds() <= self.ttl_secs,
            })
            .collect();
        views.sort_by(|a, b| a.operation_id.cmp(&b.operation_id));
        views
    }
}

/// Best-effort fan-out of cursor movements to subscribed connections.
/// Senders whose receiving side has hung up are dropped on the next publish.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<BroadcastMessage>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<BroadcastMessage> {
        let (sender, receiver) = std::sync::mpsc::channel();
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(sender);
        receiver
    }

    pub fn publish(&self, message: &BroadcastMessage) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|sender| sender.send(message.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineStatusView {
    pub machine_id: String,
    pub name: String,
    pub status: String,
    pub mode: String,
    pub active_program: String,
    pub current_tool: String,
    pub remaining_secs: i64,
    pub inactive_secs: i64,
    pub active_job_id: Option<i64>,
    pub updated_at: String,
}

/// Machine statuses served to clients. Requests read this cache only; the
/// refresh thread rebuilds it from the store and swaps the whole map.
pub struct StatusCache {
    views: Mutex<HashMap<String, MachineStatusView>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            views: Mutex::new(HashMap::new()),
        }
    }

    pub fn replace_all(&self, fresh: HashMap<String, MachineStatusView>) {
        let mut views = match self.views.lock() {
            Ok(views) => views,
            Err(poisoned) => poisoned.into_inner(),
        };
        *views = fresh;
    }

    pub fn snapshot(&self) -> Vec<MachineStatusView> {
        let views = match self.views.lock() {
            Ok(views) => views,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut list: Vec<MachineStatusView> = views.values().cloned().collect();
        list.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        list
    }
}
