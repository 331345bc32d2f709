//! Protocol data unit: the single message envelope exchanged over every
//! connection.
//!
//! This module is responsible for:
//! - Defining the envelope fields and the twelve [`PduType`]s.
//! - Builder functions that assemble each request/response/event/confirm
//!   shape with the right fields populated.
//! - Serialising a [`Pdu`] to its JSON wire body and back, with a size
//!   bound on malformed or oversized input.
//!
//! No I/O happens here — framing (the length prefix) lives in
//! [`crate::transport`]; this is pure data transformation.
//!
//! # Addressing
//!
//! `user_name` is the addressee of *this hop* and is rewritten for each
//! recipient as an event fans out. `event_user_name` names the operation
//! owner and stays stable across all fan-out copies and their confirms —
//! it is the wait-list key on the server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on an encoded PDU body. Anything larger is rejected before
/// parsing (and refused at encode time).
pub const MAX_PDU_BYTES: usize = 64 * 1024;

/// The twelve message kinds of the chat protocol.
///
/// Requests flow client→server, responses server→client, events
/// server→client (fan-out), confirms client→server (one per event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PduType {
    LoginRequest,
    LoginResponse,
    LoginEvent,
    LoginEventConfirm,
    LogoutRequest,
    LogoutResponse,
    LogoutEvent,
    LogoutEventConfirm,
    ChatMessageRequest,
    ChatMessageResponse,
    ChatMessageEvent,
    ChatMessageEventConfirm,
}

/// Error codes carried in response PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Username already registered (duplicate login attempt).
    LoginError,
}

/// The protocol envelope. Treated as immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pdu {
    pub pdu_type: PduType,

    /// Addressee on this hop; rewritten per recipient during fan-out.
    #[serde(default)]
    pub user_name: String,

    /// Operation owner, stable across fan-out copies and confirms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_user_name: Option<String>,

    /// Per-sending-client monotonic counter; correlates a chat response
    /// with the request that caused it.
    #[serde(default)]
    pub sequence_number: u64,

    /// Chat text payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Snapshot of registered usernames, attached to login/logout events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_name_list: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    /// Elapsed server processing time in nanoseconds, request receipt to
    /// response send. Informational only.
    #[serde(default)]
    pub server_time: u64,

    /// Count of chat messages the server received from this client,
    /// reported in the logout response. Statistics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,

    /// Diagnostic correlation labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_thread_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_thread_name: Option<String>,
}

impl Pdu {
    /// Bare envelope with only type and addressee set.
    fn new(pdu_type: PduType, user_name: &str) -> Self {
        Self {
            pdu_type,
            user_name: user_name.to_string(),
            event_user_name: None,
            sequence_number: 0,
            message: None,
            client_name_list: Vec::new(),
            error_code: None,
            server_time: 0,
            message_count: None,
            client_thread_name: None,
            server_thread_name: None,
        }
    }

    // -----------------------------------------------------------------------
    // Client → server
    // -----------------------------------------------------------------------

    pub fn login_request(user_name: &str) -> Self {
        Self::new(PduType::LoginRequest, user_name)
    }

    pub fn logout_request(user_name: &str) -> Self {
        Self::new(PduType::LogoutRequest, user_name)
    }

    pub fn chat_message_request(user_name: &str, text: &str, sequence_number: u64) -> Self {
        let mut pdu = Self::new(PduType::ChatMessageRequest, user_name);
        pdu.message = Some(text.to_string());
        pdu.sequence_number = sequence_number;
        pdu
    }

    /// Confirm for a received event: `event_user_name` copied from the
    /// event, `user_name` set to the confirming client itself.
    pub fn event_confirm(confirm_type: PduType, own_name: &str, event: &Pdu) -> Self {
        let mut pdu = Self::new(confirm_type, own_name);
        pdu.event_user_name = event.event_user_name.clone();
        pdu.sequence_number = event.sequence_number;
        pdu.server_thread_name = event.server_thread_name.clone();
        pdu
    }

    // -----------------------------------------------------------------------
    // Server → client: events (fan-out copies, retargeted per recipient)
    // -----------------------------------------------------------------------

    pub fn login_event(owner: &str, client_name_list: Vec<String>) -> Self {
        let mut pdu = Self::new(PduType::LoginEvent, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu.client_name_list = client_name_list;
        pdu
    }

    pub fn logout_event(owner: &str, client_name_list: Vec<String>) -> Self {
        let mut pdu = Self::new(PduType::LogoutEvent, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu.client_name_list = client_name_list;
        pdu
    }

    pub fn chat_message_event(owner: &str, text: &str, sequence_number: u64) -> Self {
        let mut pdu = Self::new(PduType::ChatMessageEvent, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu.message = Some(text.to_string());
        pdu.sequence_number = sequence_number;
        pdu
    }

    /// Copy of this event addressed to `addressee`. `event_user_name` and
    /// all payload fields are preserved.
    pub fn retargeted(&self, addressee: &str) -> Self {
        let mut copy = self.clone();
        copy.user_name = addressee.to_string();
        copy
    }

    // -----------------------------------------------------------------------
    // Server → client: gated responses
    // -----------------------------------------------------------------------

    pub fn login_response(owner: &str) -> Self {
        let mut pdu = Self::new(PduType::LoginResponse, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu
    }

    pub fn login_error_response(user_name: &str, error_code: ErrorCode) -> Self {
        let mut pdu = Self::new(PduType::LoginResponse, user_name);
        pdu.error_code = Some(error_code);
        pdu
    }

    pub fn logout_response(owner: &str, message_count: u64) -> Self {
        let mut pdu = Self::new(PduType::LogoutResponse, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu.message_count = Some(message_count);
        pdu
    }

    pub fn chat_message_response(owner: &str, sequence_number: u64, server_time_ns: u64) -> Self {
        let mut pdu = Self::new(PduType::ChatMessageResponse, owner);
        pdu.event_user_name = Some(owner.to_string());
        pdu.sequence_number = sequence_number;
        pdu.server_time = server_time_ns;
        pdu
    }

    // -----------------------------------------------------------------------
    // Wire codec (JSON body; length prefix is the transport's concern)
    // -----------------------------------------------------------------------

    /// Serialise to the JSON wire body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PduError> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_PDU_BYTES {
            return Err(PduError::TooLarge { len: body.len() });
        }
        Ok(body)
    }

    /// Parse a JSON wire body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, PduError> {
        if body.len() > MAX_PDU_BYTES {
            return Err(PduError::TooLarge { len: body.len() });
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Errors that can arise when encoding or decoding a PDU body.
#[derive(Debug, Error)]
pub enum PduError {
    #[error("PDU body of {len} bytes exceeds the {MAX_PDU_BYTES}-byte bound")]
    TooLarge { len: usize },
    #[error("malformed PDU body: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_chat_request() {
        let pdu = Pdu::chat_message_request("alice", "hi there", 5);
        let decoded = Pdu::from_bytes(&pdu.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, pdu);
        assert_eq!(decoded.sequence_number, 5);
        assert_eq!(decoded.message.as_deref(), Some("hi there"));
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let pdu = Pdu::chat_message_event("alice", "hi", 3);
        let json = String::from_utf8(pdu.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"pduType\":\"CHAT_MESSAGE_EVENT\""), "{json}");
        assert!(json.contains("\"eventUserName\":\"alice\""), "{json}");
        assert!(json.contains("\"sequenceNumber\":3"), "{json}");
    }

    #[test]
    fn retargeted_preserves_owner() {
        let event = Pdu::login_event("alice", vec!["alice".into(), "bob".into()]);
        let copy = event.retargeted("bob");
        assert_eq!(copy.user_name, "bob");
        assert_eq!(copy.event_user_name.as_deref(), Some("alice"));
        assert_eq!(copy.client_name_list, event.client_name_list);
    }

    #[test]
    fn confirm_copies_event_owner() {
        let event = Pdu::chat_message_event("alice", "hi", 7).retargeted("bob");
        let confirm = Pdu::event_confirm(PduType::ChatMessageEventConfirm, "bob", &event);
        assert_eq!(confirm.user_name, "bob");
        assert_eq!(confirm.event_user_name.as_deref(), Some("alice"));
        assert_eq!(confirm.sequence_number, 7);
    }

    #[test]
    fn oversized_body_rejected() {
        let mut pdu = Pdu::chat_message_request("alice", "", 1);
        pdu.message = Some("x".repeat(MAX_PDU_BYTES));
        assert!(matches!(pdu.to_bytes(), Err(PduError::TooLarge { .. })));
    }

    #[test]
    fn garbage_body_rejected() {
        assert!(matches!(
            Pdu::from_bytes(b"not json at all"),
            Err(PduError::Json(_))
        ));
    }

    #[test]
    fn login_error_response_carries_code() {
        let pdu = Pdu::login_error_response("alice", ErrorCode::LoginError);
        let json = String::from_utf8(pdu.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"errorCode\":\"LOGIN_ERROR\""), "{json}");
    }

    #[test]
    fn unknown_fields_ignored_on_decode() {
        let body = br#"{"pduType":"LOGIN_REQUEST","userName":"alice","futureField":42}"#;
        let pdu = Pdu::from_bytes(body).unwrap();
        assert_eq!(pdu.pdu_type, PduType::LoginRequest);
        assert_eq!(pdu.user_name, "alice");
    }
}
