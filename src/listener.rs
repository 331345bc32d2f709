//! Client-side reactive mirror of the connection.
//!
//! The [`Listener`] task is the only reader of a client connection. It
//! sorts everything the server sends into two streams: events (other
//! clients' logins, logouts and messages) go to the application as
//! [`ChatEvent`]s, responses to this client's own requests go back to the
//! session handle as [`SessionReply`]s. Every event is confirmed back to
//! the server immediately after delivery — a client never withholds a
//! confirm, because peers' responses are gated on it.
//!
//! The listener shares the session status with [`crate::client::ChatClient`]:
//! the handle advances it when it sends a request, the listener advances
//! it when the matching response arrives.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use crate::pdu::{ErrorCode, Pdu, PduType};
use crate::registry::ClientStatus;
use crate::transport::{Transport, TransportError};

/// Something a peer did, delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The set of logged-in users changed (someone logged in or out).
    UserListUpdate { users: Vec<String> },
    /// A chat message reached this client.
    Message { from: String, text: String },
}

/// Outcome of one of this client's own requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReply {
    LoginOk,
    LoginFailed(ErrorCode),
    ChatAck {
        sequence_number: u64,
        server_time_ns: u64,
    },
    LogoutOk {
        message_count: u64,
    },
}

/// Receive loop for one client session.
pub struct Listener {
    conn: Arc<dyn Transport>,
    user_name: String,
    status: Arc<StdMutex<ClientStatus>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    replies: mpsc::UnboundedSender<SessionReply>,
}

impl Listener {
    pub fn new(
        conn: Arc<dyn Transport>,
        user_name: &str,
        status: Arc<StdMutex<ClientStatus>>,
        events: mpsc::UnboundedSender<ChatEvent>,
        replies: mpsc::UnboundedSender<SessionReply>,
    ) -> Self {
        Self {
            conn,
            user_name: user_name.to_string(),
            status,
            events,
            replies,
        }
    }

    /// Receive until the session ends (logout response, rejected login or
    /// lost connection), then close.
    pub async fn run(self) {
        log::debug!("[listener] started for {:?}", self.user_name);

        loop {
            let pdu = match self.conn.receive().await {
                Ok(pdu) => pdu,
                Err(TransportError::EndOfStream) => {
                    log::debug!("[listener] server closed the connection");
                    break;
                }
                Err(e) => {
                    log::warn!("[listener] receive failed: {e}");
                    break;
                }
            };
            if self.handle(pdu).await {
                break;
            }
        }

        self.set_status(ClientStatus::Unregistered);
        if let Err(e) = self.conn.close().await {
            log::debug!("[listener] close reported {e}");
        }
        log::debug!("[listener] ended for {:?}", self.user_name);
    }

    /// Dispatch one PDU; returns `true` once the session is over.
    async fn handle(&self, pdu: Pdu) -> bool {
        match pdu.pdu_type {
            PduType::LoginResponse => return self.on_login_response(pdu),
            PduType::LogoutResponse => return self.on_logout_response(pdu),
            PduType::ChatMessageResponse => self.on_chat_response(pdu),
            PduType::LoginEvent => {
                self.on_user_list_event(pdu, PduType::LoginEventConfirm).await;
            }
            PduType::LogoutEvent => {
                self.on_user_list_event(pdu, PduType::LogoutEventConfirm).await;
            }
            PduType::ChatMessageEvent => self.on_chat_event(pdu).await,
            other => {
                log::debug!("[listener] discarding unexpected {other:?}");
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Responses to our own requests
    // -----------------------------------------------------------------------

    fn on_login_response(&self, pdu: Pdu) -> bool {
        if let Some(code) = pdu.error_code {
            log::warn!("[listener] login rejected: {code:?}");
            self.set_status(ClientStatus::Unregistered);
            let _ = self.replies.send(SessionReply::LoginFailed(code));
            // Session over: nothing further may be sent on this
            // connection, so close our own end rather than wait for the
            // server's.
            return true;
        }
        if self.current_status() != ClientStatus::Registering {
            log::debug!("[listener] stray login response ignored");
            return false;
        }
        self.set_status(ClientStatus::Registered);
        let _ = self.replies.send(SessionReply::LoginOk);
        false
    }

    fn on_logout_response(&self, pdu: Pdu) -> bool {
        if self.current_status() != ClientStatus::Unregistering {
            log::debug!("[listener] stray logout response ignored");
            return false;
        }
        self.set_status(ClientStatus::Unregistered);
        let _ = self.replies.send(SessionReply::LogoutOk {
            message_count: pdu.message_count.unwrap_or(0),
        });
        true
    }

    fn on_chat_response(&self, pdu: Pdu) {
        let _ = self.replies.send(SessionReply::ChatAck {
            sequence_number: pdu.sequence_number,
            server_time_ns: pdu.server_time,
        });
    }

    // -----------------------------------------------------------------------
    // Events from peers (always confirmed, even while unregistering)
    // -----------------------------------------------------------------------

    async fn on_user_list_event(&self, pdu: Pdu, confirm_type: PduType) {
        let _ = self.events.send(ChatEvent::UserListUpdate {
            users: pdu.client_name_list.clone(),
        });
        self.confirm(confirm_type, &pdu).await;
    }

    async fn on_chat_event(&self, pdu: Pdu) {
        let from = pdu.event_user_name.clone().unwrap_or_default();
        let text = pdu.message.clone().unwrap_or_default();
        let _ = self.events.send(ChatEvent::Message { from, text });
        self.confirm(PduType::ChatMessageEventConfirm, &pdu).await;
    }

    async fn confirm(&self, confirm_type: PduType, event: &Pdu) {
        let confirm = Pdu::event_confirm(confirm_type, &self.user_name, event);
        if let Err(e) = self.conn.send(&confirm).await {
            log::warn!("[listener] sending {confirm_type:?} failed: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Shared status
    // -----------------------------------------------------------------------

    fn current_status(&self) -> ClientStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: ClientStatus) {
        *self.status.lock().unwrap() = status;
    }
}
