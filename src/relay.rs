//! Per-organization notification relay.
//!
//! Server-side counterpart of the channel: every WebSocket connected to
//! `/ws/{organization_id}` receives the notifications published for that
//! organization. The literal keep-alive `ping` is answered with `pong`.
//!
//! Routes:
//! - `GET /health` - Liveness check
//! - `GET /ws/{organization_id}` - WebSocket subscription
//! - `POST /organizations/{organization_id}/events` - Broadcast a JSON notification

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::{config::DEFAULT_KEEP_ALIVE_PAYLOAD, types::OrganizationId};

/// Reply to the keep-alive token.
const KEEP_ALIVE_REPLY: &str = "pong";

/// Default per-organization broadcast buffer.
const DEFAULT_CAPACITY: usize = 64;

/// In-process hub of organization subscriptions.
#[derive(Debug, Clone)]
pub struct Relay {
    organizations: Arc<RwLock<HashMap<OrganizationId, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    /// Creates an empty relay.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty relay buffering up to `capacity` notifications per
    /// organization for slow sockets.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { organizations: Arc::new(RwLock::new(HashMap::new())), capacity: capacity.max(1) }
    }

    /// Registers a subscriber for `organization`.
    pub async fn subscribe(&self, organization: &OrganizationId) -> broadcast::Receiver<String> {
        let mut organizations = self.organizations.write().await;
        let sender = organizations
            .entry(organization.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        let receiver = sender.subscribe();
        let connections = sender.receiver_count();
        info!(organization = %organization, connections, "subscriber added");
        receiver
    }

    /// Broadcasts `payload` to every subscriber of `organization`.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub async fn publish(&self, organization: &OrganizationId, payload: String) -> usize {
        let organizations = self.organizations.read().await;
        let Some(sender) = organizations.get(organization) else {
            debug!(organization = %organization, "no subscribers for organization");
            return 0;
        };
        sender.send(payload).unwrap_or(0)
    }

    /// Returns the number of live subscribers of `organization`.
    pub async fn connections(&self, organization: &OrganizationId) -> usize {
        self.organizations.read().await.get(organization).map_or(0, |s| s.receiver_count())
    }

    /// Drops `organization` once its last subscriber has gone.
    async fn prune(&self, organization: &OrganizationId) {
        let mut organizations = self.organizations.write().await;
        if organizations.get(organization).is_some_and(|s| s.receiver_count() == 0) {
            organizations.remove(organization);
            debug!(organization = %organization, "organization pruned");
        }
    }
}

/// Publish response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Number of sockets the notification was delivered to.
    pub delivered: usize,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the relay is healthy.
    pub healthy: bool,
}

/// Creates the axum router serving the relay.
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws/{organization_id}", get(ws_handler))
        .route("/organizations/{organization_id}/events", post(publish_handler))
        .with_state(relay)
}

fn bad_organization() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: "organization id must not be empty".to_string() }),
    )
        .into_response()
}

/// Handler for `GET /health`.
async fn health_handler() -> impl IntoResponse {
    Json(HealthStatus { healthy: true })
}

/// Handler for `GET /ws/{organization_id}`.
async fn ws_handler(
    State(relay): State<Relay>,
    Path(organization_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(organization) = OrganizationId::new(&organization_id) else {
        return bad_organization();
    };
    // Subscribe before the upgrade so nothing published after the handshake is missed.
    let subscription = Subscription::new(relay, organization).await;
    ws.on_upgrade(move |socket| serve_socket(socket, subscription))
}

/// Handler for `POST /organizations/{organization_id}/events`.
async fn publish_handler(
    State(relay): State<Relay>,
    Path(organization_id): Path<String>,
    Json(notification): Json<serde_json::Value>,
) -> Response {
    let Some(organization) = OrganizationId::new(&organization_id) else {
        return bad_organization();
    };
    let delivered = relay.publish(&organization, notification.to_string()).await;
    info!(organization = %organization, delivered, "notification published");
    (StatusCode::OK, Json(PublishResponse { delivered })).into_response()
}

/// One socket's registration with the relay.
///
/// Dropping it, whether the socket was served or the upgrade never
/// completed, prunes the organization once it has no subscribers left.
struct Subscription {
    relay: Relay,
    organization: OrganizationId,
    receiver: Option<broadcast::Receiver<String>>,
}

impl Subscription {
    async fn new(relay: Relay, organization: OrganizationId) -> Self {
        let receiver = relay.subscribe(&organization).await;
        Self { relay, organization, receiver: Some(receiver) }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must be gone before the prune task checks the count.
        drop(self.receiver.take());
        let relay = self.relay.clone();
        let organization = self.organization.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { relay.prune(&organization).await });
            }
            Err(_) => debug!(organization = %organization, "no runtime, prune skipped"),
        }
    }
}

async fn serve_socket(mut socket: WebSocket, mut subscription: Subscription) {
    let organization = subscription.organization.clone();
    let Some(notifications) = subscription.receiver.as_mut() else {
        return;
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text.as_str() == DEFAULT_KEEP_ALIVE_PAYLOAD {
                        let pong = Message::Text(KEEP_ALIVE_REPLY.to_owned().into());
                        if socket.send(pong).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(organization = %organization, error = %e, "websocket error");
                    break;
                }
            },
            published = notifications.recv() => match published {
                Ok(payload) => {
                    if let Err(e) = socket.send(Message::Text(payload.into())).await {
                        warn!(%organization, error = %e, "send failed, dropping socket");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(organization = %organization, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(subscription);
    info!(organization = %organization, "subscriber removed");
}
