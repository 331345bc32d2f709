//! High-level client session handle.
//!
//! [`ChatClient`] wraps one connection into a request/response API:
//! `login` constructs it, `send_chat` and `logout` block until the
//! server's gated response arrives, and `next_event` yields what the
//! peers are doing in the meantime. A [`Listener`](crate::listener::Listener)
//! task owns the receive side and confirms events on its own; the handle
//! only ever sends requests and awaits replies.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::listener::{ChatEvent, Listener, SessionReply};
use crate::pdu::{ErrorCode, Pdu};
use crate::registry::ClientStatus;
use crate::transport::{TcpTransport, Transport, TransportError};

/// Errors surfaced to the application by a client session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    /// The server refused the login (username already taken).
    #[error("login rejected by the server")]
    LoginRejected(ErrorCode),
    /// The connection ended before the awaited response arrived.
    #[error("session ended before the server replied")]
    SessionEnded,
    #[error("unexpected reply from the server: {0:?}")]
    UnexpectedReply(SessionReply),
}

/// One logged-in chat session.
///
/// Dropping the handle without calling [`logout`](ChatClient::logout)
/// abandons the connection; the server notices the closed stream and
/// cleans the client up as a disconnect.
pub struct ChatClient {
    conn: Arc<dyn Transport>,
    user_name: String,
    status: Arc<StdMutex<ClientStatus>>,
    events: mpsc::UnboundedReceiver<ChatEvent>,
    replies: mpsc::UnboundedReceiver<SessionReply>,
    next_sequence: u64,
    listener: JoinHandle<()>,
}

impl ChatClient {
    /// Connect to `addr` over TCP and log in as `user_name`.
    pub async fn login(addr: SocketAddr, user_name: &str) -> Result<Self, ClientError> {
        let conn = TcpTransport::connect(addr).await?;
        Self::login_with(Arc::new(conn), user_name).await
    }

    /// Log in over an already-established transport.
    pub async fn login_with(
        conn: Arc<dyn Transport>,
        user_name: &str,
    ) -> Result<Self, ClientError> {
        let status = Arc::new(StdMutex::new(ClientStatus::Registering));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let listener = Listener::new(
            Arc::clone(&conn),
            user_name,
            Arc::clone(&status),
            event_tx,
            reply_tx,
        );
        let listener = tokio::spawn(listener.run());

        let mut client = Self {
            conn,
            user_name: user_name.to_string(),
            status,
            events,
            replies,
            next_sequence: 0,
            listener,
        };

        client.conn.send(&Pdu::login_request(user_name)).await?;
        match client.replies.recv().await {
            Some(SessionReply::LoginOk) => Ok(client),
            Some(SessionReply::LoginFailed(code)) => Err(ClientError::LoginRejected(code)),
            Some(other) => Err(ClientError::UnexpectedReply(other)),
            None => Err(ClientError::SessionEnded),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Broadcast a chat message and wait for the gated response. Returns
    /// the server's reported processing time in nanoseconds.
    pub async fn send_chat(&mut self, text: &str) -> Result<u64, ClientError> {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.conn
            .send(&Pdu::chat_message_request(&self.user_name, text, sequence))
            .await?;

        loop {
            match self.replies.recv().await {
                Some(SessionReply::ChatAck {
                    sequence_number,
                    server_time_ns,
                }) if sequence_number == sequence => return Ok(server_time_ns),
                Some(SessionReply::ChatAck { sequence_number, .. }) => {
                    log::debug!("[client] stale chat ack seq={sequence_number} skipped");
                }
                Some(other) => return Err(ClientError::UnexpectedReply(other)),
                None => return Err(ClientError::SessionEnded),
            }
        }
    }

    /// Next peer event, in arrival order. `None` once the session is over
    /// and all buffered events are drained.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    /// Log out and wait for the gated response. Returns the number of
    /// chat messages the server counted for this session.
    pub async fn logout(mut self) -> Result<u64, ClientError> {
        // The listener treats the logout response as final only in this
        // state, so advance it before the request goes out.
        *self.status.lock().unwrap() = ClientStatus::Unregistering;
        self.conn.send(&Pdu::logout_request(&self.user_name)).await?;

        let result = match self.replies.recv().await {
            Some(SessionReply::LogoutOk { message_count }) => Ok(message_count),
            Some(other) => Err(ClientError::UnexpectedReply(other)),
            None => Err(ClientError::SessionEnded),
        };
        // The listener closes the connection and exits on its own.
        let _ = (&mut self.listener).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientRegistry;
    use crate::transport::link;
    use crate::worker::Worker;
    use std::time::Duration;

    /// Registry plus one worker task wired to a fresh in-memory connection.
    fn attach_worker(registry: &Arc<ClientRegistry>) -> Arc<dyn Transport> {
        let (server_end, client_end) = link();
        let worker = Worker::new(Arc::clone(registry), Arc::new(server_end))
            .with_receive_timeout(Duration::from_millis(200));
        tokio::spawn(worker.run());
        Arc::new(client_end)
    }

    #[tokio::test]
    async fn full_session_against_a_worker() {
        let registry = Arc::new(ClientRegistry::new());

        let mut solo = ChatClient::login_with(attach_worker(&registry), "solo")
            .await
            .unwrap();
        // Own login event, confirmed by the listener behind the scenes.
        assert_eq!(
            solo.next_event().await,
            Some(ChatEvent::UserListUpdate {
                users: vec!["solo".into()]
            })
        );

        solo.send_chat("talking to myself").await.unwrap();
        assert_eq!(
            solo.next_event().await,
            Some(ChatEvent::Message {
                from: "solo".into(),
                text: "talking to myself".into()
            })
        );

        let count = solo.logout().await.unwrap();
        assert_eq!(count, 1);
        // The worker notices the closed stream and removes the record.
        wait_for(|| !registry.exists("solo")).await;
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn rejected_login_returns_the_error() {
        let registry = Arc::new(ClientRegistry::new());

        let _first = ChatClient::login_with(attach_worker(&registry), "alice")
            .await
            .unwrap();
        let second = ChatClient::login_with(attach_worker(&registry), "alice").await;

        assert!(matches!(
            second,
            Err(ClientError::LoginRejected(ErrorCode::LoginError))
        ));
        assert_eq!(registry.size(), 1);
    }
}
