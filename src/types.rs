//! Core types for the live status channel.
//!
//! This module contains the organization identifier, the channel lifecycle
//! state, the events delivered to subscribers and the error types shared
//! throughout the crate.

use std::{fmt, sync::Arc};

use url::Url;

/// Generation number of a connection attempt.
///
/// Every attempt gets a fresh, strictly increasing generation so that
/// signals from a retired link can be recognised and discarded.
pub type Generation = u64;

/// Opaque identifier of the organization whose feed is being watched.
///
/// The channel never interprets the id; it is only escaped into the
/// endpoint path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrganizationId(Arc<str>);

impl OrganizationId {
    /// Creates an organization id, returning `None` for an empty or
    /// whitespace-only value.
    pub fn new(id: impl AsRef<str>) -> Option<Self> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return None;
        }
        Some(Self(Arc::from(id)))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a connection left the open (or connecting) state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The stream could not be opened.
    ConnectFailed(String),
    /// The peer closed the stream.
    Remote,
    /// The stream failed while open.
    Transport(String),
    /// The channel closed the stream itself (scope change, manual
    /// reconnect or shutdown).
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(err) => write!(f, "connect failed: {err}"),
            Self::Remote => f.write_str("closed by peer"),
            Self::Transport(err) => write!(f, "transport failure: {err}"),
            Self::Local => f.write_str("closed locally"),
        }
    }
}

/// Lifecycle state of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No organization in scope, or torn down.
    #[default]
    Idle,
    /// A stream is being opened.
    Connecting,
    /// The stream is open and keep-alives are running.
    Open,
    /// The last stream closed; a reconnect is scheduled.
    Closed(CloseReason),
}

impl ChannelState {
    /// Returns true while a stream is being opened or is open.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closed(reason) => write!(f, "closed ({reason})"),
        }
    }
}

/// An inbound payload pushed by the server.
///
/// Payloads are forwarded verbatim; the channel does not parse them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A text frame, usually JSON.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the payload as text, if it is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Notification emitted by the channel to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A stream opened against `endpoint`.
    Opened {
        /// The organization in scope.
        organization: OrganizationId,
        /// The endpoint the stream is connected to.
        endpoint: Url,
    },
    /// The current stream closed.
    Closed {
        /// Why the stream closed.
        reason: CloseReason,
    },
    /// A payload arrived on the open stream.
    Message {
        /// The organization the payload was pushed for.
        organization: OrganizationId,
        /// The raw payload.
        payload: Payload,
    },
}

/// Errors raised by a [`Transport`](crate::Transport) or its links.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The stream could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A frame could not be sent.
    #[error("send failed: {0}")]
    Send(String),

    /// The stream failed while receiving.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The stream is already closed.
    #[error("stream closed")]
    Closed,
}

/// Errors returned by [`LiveChannel`](crate::LiveChannel) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The driver task has already exited.
    #[error("channel driver stopped")]
    Stopped,

    /// The driver task panicked or was aborted.
    #[error("channel driver failed: {0}")]
    Driver(String),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::blank("   ")]
    fn test_organization_id_rejects_empty(#[case] raw: &str) {
        assert!(OrganizationId::new(raw).is_none());
    }

    #[test]
    fn test_organization_id_trims() {
        let id = OrganizationId::new(" org-1 ").unwrap();
        assert_eq!(id.as_str(), "org-1");
        assert_eq!(id.to_string(), "org-1");
    }

    #[rstest]
    #[case::idle(ChannelState::Idle, false)]
    #[case::connecting(ChannelState::Connecting, true)]
    #[case::open(ChannelState::Open, true)]
    #[case::closed(ChannelState::Closed(CloseReason::Remote), false)]
    fn test_state_is_active(#[case] state: ChannelState, #[case] expected: bool) {
        assert_eq!(state.is_active(), expected);
    }

    #[test]
    fn test_close_reason_display() {
        let state = ChannelState::Closed(CloseReason::ConnectFailed("refused".to_string()));
        assert_eq!(format!("{state}"), "closed (connect failed: refused)");
        assert_eq!(format!("{}", CloseReason::Local), "closed locally");
    }

    #[test]
    fn test_payload_as_text() {
        assert_eq!(Payload::Text("{}".to_string()).as_text(), Some("{}"));
        assert_eq!(Payload::Binary(vec![1]).as_text(), None);
    }
}
