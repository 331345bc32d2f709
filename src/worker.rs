//! Server-side per-connection state machine.
//!
//! One [`Worker`] task owns each accepted connection. It is the only
//! reader of that connection and the only writer of its *own* client's
//! record fields, but it reaches into other clients' records through the
//! registry's atomic operations: fanning an event out to their
//! connections, and draining their wait-lists when their confirms arrive
//! on *this* worker's receive loop (confirms travel client→server, never
//! peer-to-peer).
//!
//! # Broadcast-and-gate
//!
//! Every request follows the same shape:
//! 1. snapshot the target names at request receipt (the snapshot, not a
//!    live view, defines the wait-list),
//! 2. record it as the owner's wait-list,
//! 3. send one retargeted event PDU per target — a failed send to one
//!    target neither aborts the rest nor shrinks the wait-list,
//! 4. confirms drain the wait-list from arbitrary worker tasks,
//! 5. whichever worker removes the final entry sends the gated response.
//!
//! There is no coordinator; correctness rests on the registry's
//! exactly-once drain result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pdu::{ErrorCode, Pdu, PduType};
use crate::registry::{
    BroadcastKind, ClientRecord, ClientRegistry, ClientStatus, CompletedBroadcast,
};
use crate::transport::{Transport, TransportError};

/// How long a worker waits for the next PDU before checking whether its
/// client silently vanished.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-side session handler for one connection.
pub struct Worker {
    registry: Arc<ClientRegistry>,
    conn: Arc<dyn Transport>,
    receive_timeout: Duration,
    /// Set once this connection's client has logged in.
    user_name: Option<String>,
    finished: bool,
}

impl Worker {
    pub fn new(registry: Arc<ClientRegistry>, conn: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            conn,
            receive_timeout: RECEIVE_TIMEOUT,
            user_name: None,
            finished: false,
        }
    }

    /// Override the inactivity timeout (tests use short ones).
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Drive the session until the client is gone, then tear down.
    pub async fn run(mut self) {
        log::debug!("[worker] session task started");

        while !self.finished {
            if self.own_client_deletable() {
                break;
            }

            let pdu = match self.conn.receive_timeout(self.receive_timeout).await {
                Ok(pdu) => pdu,
                Err(TransportError::Timeout) => {
                    self.on_receive_timeout();
                    continue;
                }
                Err(TransportError::EndOfStream) => {
                    log::debug!(
                        "[worker] end of stream, client {:?} disconnected",
                        self.user_name
                    );
                    self.finish_own_client();
                    break;
                }
                Err(e) => {
                    log::warn!("[worker] receive failed for {:?}: {e}", self.user_name);
                    self.finish_own_client();
                    break;
                }
            };

            let start = Instant::now();
            self.dispatch(pdu, start).await;
        }

        self.teardown().await;
    }

    // -----------------------------------------------------------------------
    // Loop plumbing
    // -----------------------------------------------------------------------

    /// Deletable check run once per iteration: our own client may have
    /// been finished by another worker (logout drain), and the sweep may
    /// free clients stranded by dead connections.
    fn own_client_deletable(&self) -> bool {
        let Some(name) = self.user_name.as_deref() else {
            return false;
        };

        if self.registry.get(name).is_some_and(|r| r.finished) && self.registry.delete(name) {
            log::debug!("[worker] own client {name:?} deleted, stopping");
            return true;
        }

        if self.registry.garbage_collect().iter().any(|n| n == name) {
            log::debug!("[worker] gc removed own client {name:?}, stopping");
            return true;
        }
        false
    }

    /// Inactivity timeout: a client in `Unregistering` will never send
    /// again (its logout already drained), so treat this as the completed
    /// disconnect. Any other status just waits for the next message.
    fn on_receive_timeout(&mut self) {
        log::debug!(
            "[worker] no message from {:?} within {:?}",
            self.user_name,
            self.receive_timeout
        );
        if let Some(name) = self.user_name.as_deref() {
            if self.registry.get(name).map(|r| r.status) == Some(ClientStatus::Unregistering) {
                self.registry.finish(name);
                self.finished = true;
            }
        }
    }

    fn finish_own_client(&self) {
        if let Some(name) = self.user_name.as_deref() {
            self.registry.finish(name);
        }
    }

    async fn dispatch(&mut self, pdu: Pdu, start: Instant) {
        match pdu.pdu_type {
            PduType::LoginRequest => self.on_login_request(pdu, start).await,
            PduType::LogoutRequest => self.on_logout_request(pdu, start).await,
            PduType::ChatMessageRequest => self.on_chat_message_request(pdu, start).await,
            PduType::LoginEventConfirm
            | PduType::LogoutEventConfirm
            | PduType::ChatMessageEventConfirm => self.on_event_confirm(pdu).await,
            // Illegal for a server to receive; discarded without a reply.
            other => {
                log::debug!(
                    "[worker] discarding {other:?} from {:?}",
                    pdu.user_name
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    async fn on_login_request(&mut self, pdu: Pdu, start: Instant) {
        let name = pdu.user_name.clone();
        log::info!("[worker] login request from {name:?}");

        let record = ClientRecord::new(&name, Arc::clone(&self.conn));
        if self.registry.create(record).is_err() {
            log::warn!("[worker] duplicate login for {name:?} rejected");
            let response = Pdu::login_error_response(&name, ErrorCode::LoginError);
            if let Err(e) = self.conn.send(&response).await {
                log::warn!("[worker] sending login error response failed: {e}");
            }
            // The session never got a client; drop the connection.
            self.finished = true;
            return;
        }

        self.user_name = Some(name.clone());
        self.registry.set_request_start(&name, start);
        self.registry
            .create_wait_list(&name, BroadcastKind::Login, pdu.sequence_number);

        // The login event goes to every connected client, the new one
        // included — alone on the server, its own confirm completes the
        // login.
        let event = Pdu::login_event(&name, self.registry.registered_or_registering_user_names());
        self.fan_out(event, false).await;
    }

    async fn on_logout_request(&mut self, pdu: Pdu, start: Instant) {
        let name = pdu.user_name.clone();
        log::info!("[worker] logout request from {name:?}");

        // Only the session's own client may be logged out from here.
        if self.user_name.as_deref() != Some(name.as_str()) {
            log::debug!("[worker] logout request for foreign client {name:?} discarded");
            return;
        }

        self.registry.set_request_start(&name, start);
        self.registry.change_status(&name, ClientStatus::Unregistering);
        self.registry
            .create_wait_list(&name, BroadcastKind::Logout, pdu.sequence_number);

        let event = Pdu::logout_event(&name, self.registry.registered_or_registering_user_names());
        self.fan_out(event, true).await;
    }

    async fn on_chat_message_request(&mut self, pdu: Pdu, start: Instant) {
        let name = pdu.user_name.clone();
        log::debug!(
            "[worker] chat message seq={} from {name:?}",
            pdu.sequence_number
        );

        // A connection can only speak as the client it logged in as.
        if self.user_name.as_deref() != Some(name.as_str()) {
            log::debug!("[worker] chat message for foreign client {name:?} discarded");
            return;
        }

        self.registry.set_request_start(&name, start);
        self.registry.incr_received_chat_messages(&name);
        self.registry
            .create_wait_list(&name, BroadcastKind::Chat, pdu.sequence_number);

        let text = pdu.message.as_deref().unwrap_or_default();
        let event = Pdu::chat_message_event(&name, text, pdu.sequence_number);
        self.fan_out(event, true).await;
    }

    // -----------------------------------------------------------------------
    // Confirms
    // -----------------------------------------------------------------------

    /// A peer confirmed an event. Drain the owner's wait-list; whoever
    /// removes the final entry sends the gated response.
    async fn on_event_confirm(&mut self, pdu: Pdu) {
        let Some(owner) = pdu.event_user_name.clone() else {
            log::debug!("[worker] confirm without event owner discarded");
            return;
        };
        let confirmer = pdu.user_name.clone();
        log::debug!("[worker] {confirmer:?} confirms for {owner:?}");

        self.registry.incr_received_confirms(&owner);
        if let Some(done) = self.registry.remove_from_wait_list(&owner, &confirmer) {
            self.complete_broadcast(done).await;
        }
    }

    /// Send the gated response for a drained wait-list. Called either by
    /// the worker that processed the final confirm or by a tearing-down
    /// worker whose purge drained the list.
    async fn complete_broadcast(&self, done: CompletedBroadcast) {
        let Some(record) = self.registry.get(&done.owner) else {
            log::debug!("[worker] owner {:?} gone before its response", done.owner);
            return;
        };

        match done.kind {
            BroadcastKind::Login => {
                if record.status != ClientStatus::Registering {
                    log::debug!(
                        "[worker] login drain for {:?} in state {}, ignored",
                        done.owner,
                        record.status
                    );
                    return;
                }
                let response = Pdu::login_response(&done.owner);
                if let Err(e) = record.conn.send(&response).await {
                    log::warn!("[worker] login response to {:?} failed: {e}", done.owner);
                }
                self.registry
                    .change_status(&done.owner, ClientStatus::Registered);
                log::info!("[worker] {:?} registered", done.owner);
            }
            BroadcastKind::Logout => {
                self.registry
                    .change_status(&done.owner, ClientStatus::Unregistered);
                let response =
                    Pdu::logout_response(&done.owner, record.received_chat_messages);
                if let Err(e) = record.conn.send(&response).await {
                    log::warn!("[worker] logout response to {:?} failed: {e}", done.owner);
                }
                // The owner's own worker sees the flag and stops.
                self.registry.finish(&done.owner);
                log::info!("[worker] {:?} logged out", done.owner);
            }
            BroadcastKind::Chat => {
                let server_time = done.started.elapsed().as_nanos() as u64;
                let response =
                    Pdu::chat_message_response(&done.owner, done.sequence_number, server_time);
                if let Err(e) = record.conn.send(&response).await {
                    log::warn!("[worker] chat response to {:?} failed: {e}", done.owner);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out and teardown
    // -----------------------------------------------------------------------

    /// Send one retargeted copy of `event` to each target's own
    /// connection. Failures are logged and skipped: the broadcast
    /// continues, and the failed target stays in the wait-list (its
    /// worker's teardown will purge it).
    async fn fan_out(&self, event: Pdu, skip_unregistered: bool) {
        for target in self.registry.all_user_names() {
            let Some(record) = self.registry.get(&target) else {
                continue;
            };
            if record.finished {
                continue;
            }
            if skip_unregistered && record.status == ClientStatus::Unregistered {
                continue;
            }

            let copy = event.retargeted(&target);
            match record.conn.send(&copy).await {
                Ok(()) => {
                    self.registry.incr_sent_events(&target);
                    log::debug!("[worker] {:?} event sent to {target:?}", copy.pdu_type);
                }
                Err(e) => {
                    log::warn!("[worker] event to {target:?} failed: {e}");
                }
            }
        }
    }

    /// Runs once on every exit path: this connection can never send or
    /// receive again, so the record is removed regardless of wait-list
    /// references, and any operation the purge drained is completed on
    /// behalf of its stranded owner.
    async fn teardown(&mut self) {
        if let Some(name) = self.user_name.take() {
            log::debug!("[worker] teardown for {name:?}");
            let drained = self.registry.delete_unconditionally(&name);
            for done in drained {
                self.complete_broadcast(done).await;
            }
        }
        if let Err(e) = self.conn.close().await {
            log::debug!("[worker] close reported {e}");
        }
        log::debug!("[worker] session task ended");
    }
}

// ---------------------------------------------------------------------------
// Unit tests (in-memory transport; full protocol runs live in tests/)
// ---------------------------------------------------------------------------
