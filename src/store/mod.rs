//! Client-side state for sessions, messages and parts.
//!
//! The store is the single owner of every collection. It is mutated through
//! idempotent snapshot operations (bulk loads and decoded events) and read
//! through derived views. `revision()` moves on every observable change so a
//! front end can cheaply decide whether to rebuild its rows.

mod pending;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use opencode_api::{Message, MessageWithParts, Part, Role, Session};

use crate::events::ServerEvent;
use pending::PendingParts;

/// Store mutations an orphan part survives before it is dropped.
pub const DEFAULT_PENDING_GRACE_EVENTS: u64 = 512;
/// Upper bound on buffered orphan parts.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;
/// Store mutations a removal keeps absorbing late updates for.
pub const DEFAULT_REMOVED_GRACE_EVENTS: u64 = 4096;
/// Upper bound on remembered removals across all sessions.
pub const DEFAULT_REMOVED_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub pending_grace_events: u64,
    pub pending_capacity: usize,
    pub removed_grace_events: u64,
    pub removed_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pending_grace_events: DEFAULT_PENDING_GRACE_EVENTS,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            removed_grace_events: DEFAULT_REMOVED_GRACE_EVENTS,
            removed_capacity: DEFAULT_REMOVED_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn of(message: &Message) -> Self {
        if message.error.is_some() {
            Self::Failed
        } else if message.time.completed.is_some() || message.role == Role::User {
            Self::Completed
        } else {
            Self::Streaming
        }
    }
}

#[derive(Debug, Clone)]
struct MessageEntry {
    info: Message,
    parts: Vec<Part>,
    part_index: HashMap<String, usize>,
}

impl MessageEntry {
    fn new(info: Message) -> Self {
        Self {
            info,
            parts: Vec::new(),
            part_index: HashMap::new(),
        }
    }

    fn upsert_part(&mut self, part: Part) -> bool {
        match self.part_index.get(&part.id) {
            Some(&index) => {
                if self.parts[index] == part {
                    return false;
                }
                self.parts[index] = part;
            }
            None => {
                self.part_index.insert(part.id.clone(), self.parts.len());
                self.parts.push(part);
            }
        }
        true
    }

    fn to_view(&self) -> MessageWithParts {
        MessageWithParts {
            info: self.info.clone(),
            parts: self.parts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionMessages {
    order: Vec<String>,
    entries: HashMap<String, MessageEntry>,
    /// Removed message id to the mutation that removed it.
    removed: HashMap<String, u64>,
}

impl SessionMessages {
    fn is_empty(&self) -> bool {
        self.order.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Tombstone {
    session_id: String,
    message_id: String,
    removed_at: u64,
}

#[derive(Debug, Clone)]
pub struct Store {
    sessions: Vec<Session>,
    current_session_id: Option<String>,
    messages: HashMap<String, SessionMessages>,
    pending: PendingParts,
    tombstones: VecDeque<Tombstone>,
    removed_grace: u64,
    removed_capacity: usize,
    mutations: u64,
    revision: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            sessions: Vec::new(),
            current_session_id: None,
            messages: HashMap::new(),
            pending: PendingParts::new(options.pending_grace_events, options.pending_capacity),
            tombstones: VecDeque::new(),
            removed_grace: options.removed_grace_events,
            removed_capacity: options.removed_capacity,
            mutations: 0,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Drop all state, keeping the revision counter monotonic.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.current_session_id = None;
        self.messages.clear();
        self.pending.clear();
        self.tombstones.clear();
        self.bump();
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    /// Replace the session list; the result is ordered newest first.
    /// Messages of sessions missing from the new list are forgotten unless
    /// the session is selected.
    pub fn load_sessions(&mut self, sessions: Vec<Session>) {
        self.tick();

        let mut seen = HashSet::new();
        let mut loaded = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.id.is_empty() {
                tracing::warn!(title = %session.title, "dropping session without id");
                continue;
            }
            if !seen.insert(session.id.clone()) {
                tracing::warn!(session_id = %session.id, "dropping duplicate session");
                continue;
            }
            loaded.push(session);
        }
        sort_sessions(&mut loaded);

        if loaded != self.sessions {
            self.sessions = loaded;
            self.bump();
        }

        let unlisted: Vec<String> = self
            .messages
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .filter(|id| self.current_session_id.as_deref() != Some(id.as_str()))
            .cloned()
            .collect();
        for session_id in unlisted {
            tracing::debug!(session_id = %session_id, "forgetting messages of unlisted session");
            self.forget_messages(&session_id);
        }
    }

    pub fn apply_session_update(&mut self, session: Session) {
        self.tick();

        if session.id.is_empty() {
            tracing::warn!("ignoring session update without id");
            return;
        }

        match self.sessions.iter_mut().find(|known| known.id == session.id) {
            Some(known) if *known == session => return,
            Some(known) => *known = session,
            None => self.sessions.push(session),
        }
        sort_sessions(&mut self.sessions);
        self.bump();
    }

    pub fn select_session(&mut self, session_id: Option<&str>) {
        let next = session_id.filter(|id| !id.is_empty()).map(str::to_string);
        if next != self.current_session_id {
            self.current_session_id = next;
            self.bump();
        }
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session_id
            .as_deref()
            .and_then(|id| self.session(id))
    }

    /// Replace one session's messages with a server snapshot, in server order.
    pub fn load_messages(&mut self, session_id: &str, messages: Vec<MessageWithParts>) {
        self.tick();

        if session_id.is_empty() {
            tracing::warn!("ignoring message load without session id");
            return;
        }

        let mut loaded = SessionMessages::default();
        for MessageWithParts { info, parts } in messages {
            if info.id.is_empty() {
                tracing::warn!(session_id, "dropping loaded message without id");
                continue;
            }
            if !info.session_id.is_empty() && info.session_id != session_id {
                tracing::warn!(
                    session_id,
                    message_id = %info.id,
                    owner = %info.session_id,
                    "dropping loaded message owned by another session"
                );
                continue;
            }

            let message_id = info.id.clone();
            let entry = match loaded.entries.entry(message_id.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    entry.info = info;
                    entry
                }
                Entry::Vacant(vacant) => {
                    loaded.order.push(message_id.clone());
                    vacant.insert(MessageEntry::new(info))
                }
            };
            for part in parts {
                if part.id.is_empty() {
                    tracing::warn!(session_id, message_id = %message_id, "dropping loaded part without id");
                    continue;
                }
                entry.upsert_part(part);
            }
        }

        for message_id in &loaded.order {
            let replay = self.pending.take_for(session_id, message_id);
            if let Some(entry) = loaded.entries.get_mut(message_id) {
                for part in replay {
                    entry.upsert_part(part);
                }
            }
        }

        self.tombstones
            .retain(|tombstone| tombstone.session_id != session_id);
        self.messages.insert(session_id.to_string(), loaded);
        self.bump();
    }

    /// Upsert a message snapshot. New messages are appended; known ones keep
    /// their position and parts.
    pub fn apply_message_update(&mut self, session_id: &str, message_id: &str, info: Message) {
        self.tick();

        if session_id.is_empty() || message_id.is_empty() {
            tracing::warn!(session_id, message_id, "ignoring message update without ids");
            return;
        }
        if info.id != message_id {
            tracing::warn!(
                message_id,
                snapshot_id = %info.id,
                "ignoring message update whose snapshot id does not match"
            );
            return;
        }
        if !info.session_id.is_empty() && info.session_id != session_id {
            tracing::warn!(
                session_id,
                message_id,
                owner = %info.session_id,
                "ignoring message update owned by another session"
            );
            return;
        }

        let session = self.messages.entry(session_id.to_string()).or_default();
        if session.removed.contains_key(message_id) {
            tracing::debug!(session_id, message_id, "ignoring update for removed message");
            return;
        }

        match session.entries.get_mut(message_id) {
            Some(entry) => {
                if entry.info == info {
                    return;
                }
                entry.info = info;
            }
            None => {
                let mut entry = MessageEntry::new(info);
                for part in self.pending.take_for(session_id, message_id) {
                    entry.upsert_part(part);
                }
                session.order.push(message_id.to_string());
                session.entries.insert(message_id.to_string(), entry);
            }
        }
        self.bump();
    }

    /// Remove a message and its parts. Later updates for it are ignored
    /// until the session is reloaded.
    pub fn apply_message_removed(&mut self, session_id: &str, message_id: &str) {
        self.tick();

        if session_id.is_empty() || message_id.is_empty() {
            tracing::warn!(session_id, message_id, "ignoring removal without ids");
            return;
        }

        let discarded = self.pending.discard_for(session_id, message_id);
        if discarded > 0 {
            tracing::debug!(session_id, message_id, discarded, "discarded buffered parts of removed message");
        }

        let removed_at = self.mutations;
        let session = self.messages.entry(session_id.to_string()).or_default();
        session.removed.insert(message_id.to_string(), removed_at);
        let existed = session.entries.remove(message_id).is_some();
        if existed {
            session.order.retain(|id| id != message_id);
        }

        self.tombstones.push_back(Tombstone {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            removed_at,
        });
        self.expire_tombstones();
        if existed {
            self.bump();
        }
    }

    /// Upsert a part; parts for a message not seen yet are buffered.
    pub fn apply_part_update(&mut self, session_id: &str, message_id: &str, part: Part) {
        self.tick();

        if session_id.is_empty() || message_id.is_empty() || part.id.is_empty() {
            tracing::warn!(session_id, message_id, part_id = %part.id, "ignoring part update without ids");
            return;
        }
        if !part.message_id.is_empty() && part.message_id != message_id {
            tracing::warn!(
                message_id,
                part_message_id = %part.message_id,
                "ignoring part update whose owner does not match"
            );
            return;
        }

        let session = self.messages.entry(session_id.to_string()).or_default();
        if session.removed.contains_key(message_id) {
            tracing::debug!(session_id, message_id, part_id = %part.id, "ignoring part of removed message");
            return;
        }

        match session.entries.get_mut(message_id) {
            Some(entry) => {
                if entry.upsert_part(part) {
                    self.bump();
                }
            }
            None => {
                tracing::debug!(session_id, message_id, part_id = %part.id, "buffering part for unseen message");
                self.pending
                    .push(session_id, message_id, part, self.mutations);
            }
        }
    }

    /// Dispatch one decoded event.
    pub fn apply(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageUpdated { info } => {
                let session_id = info.session_id.clone();
                let message_id = info.id.clone();
                self.apply_message_update(&session_id, &message_id, info);
            }
            ServerEvent::MessageRemoved {
                session_id,
                message_id,
            } => self.apply_message_removed(&session_id, &message_id),
            ServerEvent::PartUpdated { part } => {
                let session_id = part.session_id.clone();
                let message_id = part.message_id.clone();
                self.apply_part_update(&session_id, &message_id, part);
            }
            ServerEvent::SessionUpdated { info } => self.apply_session_update(info),
            ServerEvent::Unknown { event_type } => {
                tracing::trace!(event_type = event_type.as_deref().unwrap_or("<untyped>"), "ignoring event");
            }
        }
    }

    /// Messages of one session in lifecycle order, each with its parts.
    pub fn messages_for(&self, session_id: &str) -> Vec<MessageWithParts> {
        let Some(session) = self.messages.get(session_id) else {
            return Vec::new();
        };
        session
            .order
            .iter()
            .filter_map(|id| session.entries.get(id))
            .map(MessageEntry::to_view)
            .collect()
    }

    pub fn current_messages(&self) -> Vec<MessageWithParts> {
        self.current_session_id
            .as_deref()
            .map(|id| self.messages_for(id))
            .unwrap_or_default()
    }

    /// Message ids of one session in display order.
    pub fn message_ids(&self, session_id: &str) -> &[String] {
        self.messages
            .get(session_id)
            .map(|session| session.order.as_slice())
            .unwrap_or(&[])
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<MessageWithParts> {
        self.messages
            .get(session_id)
            .and_then(|session| session.entries.get(message_id))
            .map(MessageEntry::to_view)
    }

    pub fn is_removed(&self, session_id: &str, message_id: &str) -> bool {
        self.messages
            .get(session_id)
            .is_some_and(|session| session.removed.contains_key(message_id))
    }

    pub fn pending_part_count(&self) -> usize {
        self.pending.len()
    }

    /// Removals still absorbing late updates.
    pub fn tombstone_count(&self) -> usize {
        self.messages.values().map(|session| session.removed.len()).sum()
    }

    /// Forget one session's messages and buffered parts.
    pub fn forget_messages(&mut self, session_id: &str) {
        self.tombstones
            .retain(|tombstone| tombstone.session_id != session_id);
        let discarded = self.pending.discard_session(session_id);
        if self.messages.remove(session_id).is_some() || discarded > 0 {
            self.bump();
        }
    }

    fn tick(&mut self) {
        self.mutations += 1;
        self.pending.expire(self.mutations);
        self.expire_tombstones();
    }

    fn expire_tombstones(&mut self) {
        while let Some(oldest) = self.tombstones.front() {
            let alive = oldest.removed_at + self.removed_grace >= self.mutations;
            if alive && self.tombstones.len() <= self.removed_capacity {
                break;
            }
            let Some(tombstone) = self.tombstones.pop_front() else {
                break;
            };
            self.drop_tombstone(tombstone);
        }
    }

    fn drop_tombstone(&mut self, tombstone: Tombstone) {
        let Entry::Occupied(mut occupied) = self.messages.entry(tombstone.session_id) else {
            return;
        };
        let session = occupied.get_mut();
        // A later removal of the same id owns the entry now.
        if session.removed.get(&tombstone.message_id) == Some(&tombstone.removed_at) {
            session.removed.remove(&tombstone.message_id);
        }
        if session.is_empty() && self.current_session_id.as_deref() != Some(occupied.key().as_str()) {
            occupied.remove();
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}

fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
}
