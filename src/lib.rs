//! `ack-chat` — a multi-client chat service with acknowledgment-gated
//! broadcasts.
//!
//! Clients log in, broadcast text messages, and log out; every client
//! observes every other client's login/logout/message events, and the
//! originator of an operation only receives its response once every other
//! active client has confirmed the corresponding event.
//!
//! # Architecture
//!
//! ```text
//!  Client A ──▶ Worker A ──┐            ┌──▶ conn B ──▶ Listener B
//!                          │  snapshot  │
//!                          ▼            │ fan-out events
//!                   ┌──────────────┐    │
//!                   │ClientRegistry│────┘
//!                   │  wait-lists  │◀─── confirms (via each peer's
//!                   └──────────────┘     own worker receive loop)
//!                          │
//!                          ▼ wait-list drained
//!                   gated response ──▶ conn A
//! ```
//!
//! Each module has a single responsibility:
//! - [`pdu`]       — message envelope and its wire codec (no I/O)
//! - [`transport`] — bidirectional PDU channel (TCP + in-memory test pair)
//! - [`registry`]  — shared client map and per-operation wait-lists
//! - [`worker`]    — server-side per-connection state machine
//! - [`listener`]  — client-side reactive mirror
//! - [`client`]    — high-level session handle (login / chat / logout)
//! - [`server`]    — accept loop spawning one worker task per connection
//!
//! There is no coordinator thread: workers run in parallel, one per
//! connection, and all cross-worker effects go through the registry's
//! atomic operations.

pub mod client;
pub mod listener;
pub mod pdu;
pub mod registry;
pub mod server;
pub mod transport;
pub mod worker;
