//! Transport abstractions for the live status channel.
//!
//! The channel is generic over how a duplex stream is opened:
//!
//! - [`Transport`]: opens a stream to an endpoint
//! - [`Link`]: one open stream, owned by a single link task

use std::future::Future;

use url::Url;

use crate::types::{Payload, TransportError};

/// Abstraction over a duplex stream factory.
///
/// Implementations open a stream to the given endpoint. Opening may take
/// arbitrarily long; the channel never waits on it from its driver loop and
/// drops the future when the attempt is abandoned.
///
/// # Example
///
/// ```ignore
/// use livestatus::{Link, Transport, TransportError};
///
/// #[derive(Clone)]
/// struct Loopback;
///
/// impl Transport for Loopback {
///     type Link = LoopbackLink;
///
///     async fn open(&self, endpoint: &Url) -> Result<Self::Link, TransportError> {
///         Ok(LoopbackLink::new(endpoint.clone()))
///     }
/// }
/// ```
pub trait Transport: Clone + Send + Sync + 'static {
    /// The stream type produced by a successful open.
    type Link: Link;

    /// Opens a new stream to `endpoint`.
    fn open(
        &self,
        endpoint: &Url,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One open duplex stream.
///
/// `next_payload` must be cancel-safe: the link task polls it alongside its
/// command queue and drops the future whenever a command wins.
pub trait Link: Send + 'static {
    /// Sends a text frame.
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next inbound payload.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream.
    fn next_payload(
        &mut self,
    ) -> impl Future<Output = Result<Option<Payload>, TransportError>> + Send;

    /// Closes the stream. Closing an already closed stream is a no-op.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
