//! Shared client registry: the single source of truth for who is
//! connected and who still owes a confirm for which broadcast.
//!
//! [`ClientRegistry`] guards one map of client records plus one wait-list
//! table behind a single mutex. Workers call it interleaved from
//! arbitrary tasks; every method is one critical section, and no method
//! performs I/O, so the lock is only ever briefly held. Cross-worker
//! coordination happens exclusively through this API — the underlying
//! maps are never exposed for iterate-then-mutate by callers.
//!
//! # Wait-lists and the empty transition
//!
//! A wait-list records, for one in-flight broadcast, the set of usernames
//! that have not yet confirmed it, along with what the operation was (so
//! whoever drains the list can produce the right gated response). Confirms
//! arrive on arbitrary worker tasks in arbitrary order; the list only
//! shrinks, and exactly one [`remove_from_wait_list`] call — the one that
//! removes the final entry — gets the [`CompletedBroadcast`] back. The
//! wait-list is deleted in that same critical section, so duplicate or
//! late confirms are no-ops.
//!
//! [`remove_from_wait_list`]: ClientRegistry::remove_from_wait_list

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Conversation status of one client, kept on both sides of the protocol.
///
/// `Unregistered` is both the initial and the terminal state:
/// `Unregistered → Registering → Registered → Unregistering → Unregistered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which of the three broadcast operations a wait-list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Login,
    Logout,
    Chat,
}

/// Everything needed to produce the gated response for a drained
/// wait-list, handed to exactly one caller per operation.
#[derive(Debug, Clone)]
pub struct CompletedBroadcast {
    /// The operation owner (original requester).
    pub owner: String,
    pub kind: BroadcastKind,
    /// Sequence number of the triggering request, echoed in the response.
    pub sequence_number: u64,
    /// Request receipt time, for the server-time measurement.
    pub started: Instant,
}

/// One connected (or finishing) client.
///
/// The owning worker is the only writer of its own record's fields, and
/// all writes go through registry methods; other workers read snapshots
/// via [`ClientRegistry::get`] and send to `conn` (the transport
/// serialises concurrent sends internally).
#[derive(Clone)]
pub struct ClientRecord {
    pub user_name: String,
    pub conn: Arc<dyn Transport>,
    pub status: ClientStatus,
    pub login_time: Instant,
    /// Receipt time of the request currently being processed.
    pub request_start: Option<Instant>,
    /// Statistics only — these never gate protocol progress.
    pub received_chat_messages: u64,
    pub sent_events: u64,
    pub received_confirms: u64,
    /// Set when this client's session is over; the record lingers until
    /// no wait-list references it, then GC (or its own worker) removes it.
    pub finished: bool,
}

impl ClientRecord {
    pub fn new(user_name: &str, conn: Arc<dyn Transport>) -> Self {
        Self {
            user_name: user_name.to_string(),
            conn,
            status: ClientStatus::Unregistered,
            login_time: Instant::now(),
            request_start: None,
            received_chat_messages: 0,
            sent_events: 0,
            received_confirms: 0,
            finished: false,
        }
    }
}

impl fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRecord")
            .field("user_name", &self.user_name)
            .field("status", &self.status)
            .field("received_chat_messages", &self.received_chat_messages)
            .field("sent_events", &self.sent_events)
            .field("received_confirms", &self.received_confirms)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Errors reported by registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("username {0:?} is already registered")]
    DuplicateUser(String),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct WaitList {
    kind: BroadcastKind,
    sequence_number: u64,
    started: Instant,
    /// Usernames that still owe a confirm for this operation.
    pending: HashSet<String>,
}

struct Inner {
    /// Ordered so name-list snapshots come out in a stable order.
    clients: BTreeMap<String, ClientRecord>,
    /// Keyed by operation owner; at most one in-flight operation per owner.
    wait_lists: HashMap<String, WaitList>,
}

impl Inner {
    /// Whether any wait-list still expects a confirm from `name`.
    fn referenced(&self, name: &str) -> bool {
        self.wait_lists.values().any(|wl| wl.pending.contains(name))
    }
}

/// Process-wide concurrent map from username to client record, plus the
/// per-owner wait-lists. Safe under arbitrary concurrent callers.
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                clients: BTreeMap::new(),
                wait_lists: HashMap::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().clients.contains_key(name)
    }

    /// Insert a new client atomically with status `Registering`.
    pub fn create(&self, mut record: ClientRecord) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.clients.contains_key(&record.user_name) {
            return Err(RegistryError::DuplicateUser(record.user_name));
        }
        record.status = ClientStatus::Registering;
        log::debug!("[registry] created client {:?}", record.user_name);
        inner.clients.insert(record.user_name.clone(), record);
        Ok(())
    }

    /// No-op if `name` is absent.
    pub fn change_status(&self, name: &str, status: ClientStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.clients.get_mut(name) {
            log::debug!("[registry] {name}: {} -> {status}", record.status);
            record.status = status;
        }
    }

    /// Owned snapshot of one record (the transport handle is shared).
    pub fn get(&self, name: &str) -> Option<ClientRecord> {
        self.inner.lock().unwrap().clients.get(name).cloned()
    }

    /// Remove `name` only if that is safe: the record is past registration
    /// and no wait-list anywhere still expects a confirm from it.
    /// Returns whether removal happened.
    pub fn delete(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let deletable = match inner.clients.get(name) {
            Some(record) => record.status != ClientStatus::Registering && !inner.referenced(name),
            None => false,
        };
        if deletable {
            inner.clients.remove(name);
            log::debug!("[registry] deleted client {name:?}");
        }
        deletable
    }

    /// Connection-teardown removal: always removes `name`, and purges it
    /// from every wait-list, since this client can never confirm again.
    ///
    /// Returns the operations whose wait-lists drained because of the
    /// purge; the caller must complete them (send the gated responses) —
    /// otherwise their owners would be stranded forever.
    pub fn delete_unconditionally(&self, name: &str) -> Vec<CompletedBroadcast> {
        let mut inner = self.inner.lock().unwrap();
        inner.clients.remove(name);
        // The departing client's own in-flight operation is moot.
        inner.wait_lists.remove(name);

        let drained: Vec<String> = inner
            .wait_lists
            .iter_mut()
            .filter_map(|(owner, wl)| {
                (wl.pending.remove(name) && wl.pending.is_empty()).then(|| owner.clone())
            })
            .collect();

        drained
            .into_iter()
            .map(|owner| {
                let wl = inner.wait_lists.remove(&owner).unwrap();
                log::debug!(
                    "[registry] purge of {name:?} drained {:?} wait-list of {owner:?}",
                    wl.kind
                );
                CompletedBroadcast {
                    owner,
                    kind: wl.kind,
                    sequence_number: wl.sequence_number,
                    started: wl.started,
                }
            })
            .collect()
    }

    /// Point-in-time snapshot of every known username, ordered.
    pub fn all_user_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().clients.keys().cloned().collect()
    }

    /// Ordered snapshot of usernames with status `Registered` or
    /// `Registering` — the list shipped to clients for display.
    pub fn registered_or_registering_user_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    ClientStatus::Registered | ClientStatus::Registering
                )
            })
            .map(|r| r.user_name.clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    // -----------------------------------------------------------------------
    // Wait-lists
    // -----------------------------------------------------------------------

    /// Start a broadcast operation for `owner`: the pending set becomes a
    /// snapshot of the currently deliverable usernames (the owner included
    /// — its own confirm of its own event counts). Finished records and
    /// records already back at `Unregistered` are left out: the event will
    /// never reach them, so counting them as confirmers would strand the
    /// operation. Replaces any prior wait-list for `owner`.
    pub fn create_wait_list(&self, owner: &str, kind: BroadcastKind, sequence_number: u64) {
        let mut inner = self.inner.lock().unwrap();
        let pending: HashSet<String> = inner
            .clients
            .values()
            .filter(|r| !r.finished && r.status != ClientStatus::Unregistered)
            .map(|r| r.user_name.clone())
            .collect();
        log::debug!(
            "[registry] {kind:?} wait-list for {owner:?}: {} pending",
            pending.len()
        );
        inner.wait_lists.insert(
            owner.to_string(),
            WaitList {
                kind,
                sequence_number,
                started: Instant::now(),
                pending,
            },
        );
    }

    /// Record `confirmer`'s confirm for `owner`'s in-flight operation.
    ///
    /// Idempotent: removing an absent entry (or confirming a nonexistent
    /// operation) is a no-op. Returns `Some` exactly once per operation —
    /// for the call that removed the final pending entry — with the
    /// wait-list deleted in the same critical section.
    pub fn remove_from_wait_list(
        &self,
        owner: &str,
        confirmer: &str,
    ) -> Option<CompletedBroadcast> {
        let mut inner = self.inner.lock().unwrap();
        let wl = inner.wait_lists.get_mut(owner)?;
        if !wl.pending.remove(confirmer) {
            return None;
        }
        let remaining = wl.pending.len();
        log::debug!("[registry] {confirmer:?} confirmed for {owner:?}, {remaining} left");
        if remaining > 0 {
            return None;
        }
        let wl = inner.wait_lists.remove(owner).unwrap();
        Some(CompletedBroadcast {
            owner: owner.to_string(),
            kind: wl.kind,
            sequence_number: wl.sequence_number,
            started: wl.started,
        })
    }

    /// Remaining pending confirms for `owner`'s operation (0 if none).
    pub fn wait_list_size(&self, owner: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .wait_lists
            .get(owner)
            .map_or(0, |wl| wl.pending.len())
    }

    pub fn delete_wait_list(&self, owner: &str) {
        self.inner.lock().unwrap().wait_lists.remove(owner);
    }

    // -----------------------------------------------------------------------
    // Per-record bookkeeping
    // -----------------------------------------------------------------------

    pub fn set_request_start(&self, name: &str, at: Instant) {
        if let Some(record) = self.inner.lock().unwrap().clients.get_mut(name) {
            record.request_start = Some(at);
        }
    }

    pub fn incr_received_chat_messages(&self, name: &str) {
        if let Some(record) = self.inner.lock().unwrap().clients.get_mut(name) {
            record.received_chat_messages += 1;
        }
    }

    pub fn incr_sent_events(&self, name: &str) {
        if let Some(record) = self.inner.lock().unwrap().clients.get_mut(name) {
            record.sent_events += 1;
        }
    }

    pub fn incr_received_confirms(&self, name: &str) {
        if let Some(record) = self.inner.lock().unwrap().clients.get_mut(name) {
            record.received_confirms += 1;
        }
    }

    /// Mark `name`'s session over. The record stays until it is no longer
    /// referenced by any wait-list.
    pub fn finish(&self, name: &str) {
        if let Some(record) = self.inner.lock().unwrap().clients.get_mut(name) {
            record.finished = true;
        }
    }

    /// Sweep out records that are finished and unreferenced by any
    /// wait-list. Returns the removed names so callers can react (a
    /// worker seeing its own name stops its loop).
    pub fn garbage_collect(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let removable: Vec<String> = inner
            .clients
            .values()
            .filter(|r| r.finished && !inner.referenced(&r.user_name))
            .map(|r| r.user_name.clone())
            .collect();
        for name in &removable {
            inner.clients.remove(name);
            inner.wait_lists.remove(name);
            log::debug!("[registry] gc removed {name:?}");
        }
        removable
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::link;

    /// Record backed by a dangling in-memory transport (never sent to).
    fn record(name: &str) -> ClientRecord {
        let (conn, _peer) = link();
        ClientRecord::new(name, Arc::new(conn))
    }

    fn registry_with(names: &[&str]) -> ClientRegistry {
        let reg = ClientRegistry::new();
        for name in names {
            reg.create(record(name)).unwrap();
        }
        reg
    }

    #[test]
    fn create_sets_registering_and_rejects_duplicates() {
        let reg = ClientRegistry::new();
        reg.create(record("alice")).unwrap();
        assert!(reg.exists("alice"));
        assert_eq!(reg.get("alice").unwrap().status, ClientStatus::Registering);

        let err = reg.create(record("alice")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateUser("alice".into()));
        assert_eq!(reg.size(), 1);
    }

    #[test]
    fn change_status_on_absent_name_is_noop() {
        let reg = ClientRegistry::new();
        reg.change_status("ghost", ClientStatus::Registered);
        assert!(!reg.exists("ghost"));
    }

    #[test]
    fn name_snapshots_are_ordered() {
        let reg = registry_with(&["carol", "alice", "bob"]);
        assert_eq!(reg.all_user_names(), vec!["alice", "bob", "carol"]);

        reg.change_status("bob", ClientStatus::Unregistering);
        assert_eq!(
            reg.registered_or_registering_user_names(),
            vec!["alice", "carol"]
        );
    }

    #[test]
    fn drain_is_order_independent_and_fires_once() {
        let reg = registry_with(&["alice", "bob", "carol"]);
        reg.create_wait_list("alice", BroadcastKind::Login, 1);
        assert_eq!(reg.wait_list_size("alice"), 3);

        // Any permutation of confirmers drains to empty exactly once.
        assert!(reg.remove_from_wait_list("alice", "carol").is_none());
        assert!(reg.remove_from_wait_list("alice", "alice").is_none());
        let done = reg.remove_from_wait_list("alice", "bob").unwrap();
        assert_eq!(done.kind, BroadcastKind::Login);
        assert_eq!(done.owner, "alice");

        // The wait-list is gone; nothing can fire twice.
        assert_eq!(reg.wait_list_size("alice"), 0);
        assert!(reg.remove_from_wait_list("alice", "bob").is_none());
    }

    #[test]
    fn remove_is_idempotent_per_confirmer() {
        let reg = registry_with(&["alice", "bob"]);
        reg.create_wait_list("alice", BroadcastKind::Chat, 9);

        assert!(reg.remove_from_wait_list("alice", "bob").is_none());
        // Duplicate confirm: no-op, size unchanged.
        assert!(reg.remove_from_wait_list("alice", "bob").is_none());
        assert_eq!(reg.wait_list_size("alice"), 1);

        let done = reg.remove_from_wait_list("alice", "alice").unwrap();
        assert_eq!(done.sequence_number, 9);
    }

    #[test]
    fn concurrent_confirms_complete_exactly_once() {
        let names: Vec<String> = (0..8).map(|i| format!("user{i}")).collect();
        let reg = Arc::new(ClientRegistry::new());
        for name in &names {
            reg.create(record(name)).unwrap();
        }
        reg.create_wait_list("user0", BroadcastKind::Chat, 42);

        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let reg = Arc::clone(&reg);
                let name = name.clone();
                std::thread::spawn(move || reg.remove_from_wait_list("user0", &name).is_some())
            })
            .collect();

        let completions: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(completions, 1, "exactly one confirmer may observe the drain");
        assert_eq!(reg.wait_list_size("user0"), 0);
    }

    #[test]
    fn delete_refuses_while_referenced() {
        let reg = registry_with(&["alice", "bob"]);
        reg.change_status("bob", ClientStatus::Registered);
        reg.create_wait_list("alice", BroadcastKind::Login, 1);

        // bob owes a confirm for alice's operation.
        assert!(!reg.delete("bob"));
        assert!(reg.exists("bob"));

        reg.remove_from_wait_list("alice", "bob");
        reg.remove_from_wait_list("alice", "alice");
        assert!(reg.delete("bob"));
        assert!(!reg.exists("bob"));
    }

    #[test]
    fn delete_refuses_mid_registration() {
        let reg = registry_with(&["alice"]);
        assert!(!reg.delete("alice"));
        reg.change_status("alice", ClientStatus::Registered);
        assert!(reg.delete("alice"));
    }

    #[test]
    fn unconditional_delete_purges_and_reports_drained_owners() {
        let reg = registry_with(&["alice", "bob"]);
        reg.create_wait_list("alice", BroadcastKind::Chat, 3);
        assert!(reg.remove_from_wait_list("alice", "alice").is_none());

        // bob vanishes without confirming; alice's operation must not
        // stay stranded.
        let drained = reg.delete_unconditionally("bob");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].owner, "alice");
        assert_eq!(drained[0].kind, BroadcastKind::Chat);
        assert_eq!(drained[0].sequence_number, 3);
        assert!(!reg.exists("bob"));
        assert_eq!(reg.wait_list_size("alice"), 0);
    }

    #[test]
    fn unconditional_delete_drops_own_wait_list() {
        let reg = registry_with(&["alice", "bob"]);
        reg.create_wait_list("alice", BroadcastKind::Login, 1);

        let drained = reg.delete_unconditionally("alice");
        assert!(drained.is_empty(), "own operation is moot, not completed");
        assert_eq!(reg.wait_list_size("alice"), 0);
    }

    #[test]
    fn wait_list_snapshot_skips_undeliverable_records() {
        let reg = registry_with(&["alice", "bob", "carol", "dave"]);
        reg.change_status("alice", ClientStatus::Registered);
        reg.change_status("dave", ClientStatus::Registered);
        reg.finish("bob");
        reg.change_status("carol", ClientStatus::Unregistered);

        // Neither bob (finished) nor carol (already unregistered) will
        // ever see the event, so neither may be waited on.
        reg.create_wait_list("alice", BroadcastKind::Chat, 1);
        assert_eq!(reg.wait_list_size("alice"), 2);

        assert!(reg.remove_from_wait_list("alice", "dave").is_none());
        assert!(reg.remove_from_wait_list("alice", "alice").is_some());
    }

    #[test]
    fn gc_removes_only_finished_unreferenced_records() {
        let reg = registry_with(&["alice", "bob", "carol"]);
        reg.create_wait_list("carol", BroadcastKind::Chat, 1);
        reg.finish("alice");
        reg.finish("bob");
        reg.remove_from_wait_list("carol", "carol");
        reg.remove_from_wait_list("carol", "alice");
        // bob is finished but still owed by carol's wait-list.

        let mut removed = reg.garbage_collect();
        removed.sort();
        assert_eq!(removed, vec!["alice"]);
        assert!(reg.exists("bob"));
        assert!(reg.exists("carol"));

        reg.remove_from_wait_list("carol", "bob");
        assert_eq!(reg.garbage_collect(), vec!["bob"]);
    }

    #[test]
    fn counters_accumulate() {
        let reg = registry_with(&["alice"]);
        reg.incr_received_chat_messages("alice");
        reg.incr_received_chat_messages("alice");
        reg.incr_sent_events("alice");
        reg.incr_received_confirms("alice");

        let rec = reg.get("alice").unwrap();
        assert_eq!(rec.received_chat_messages, 2);
        assert_eq!(rec.sent_events, 1);
        assert_eq!(rec.received_confirms, 1);
    }
}
