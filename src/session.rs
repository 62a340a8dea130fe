//! Viewer session store.
//!
//! The login flow owns the write side ([`SessionStore`]); the channel only
//! holds a [`watch::Receiver`] and reacts to organization changes.

use tokio::sync::watch;
use tracing::info;

use crate::types::OrganizationId;

/// The logged-in viewer and the organization currently in view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSession {
    /// Viewer identity (user id or email).
    pub viewer: String,
    /// Organization whose feed is in view, if the viewer belongs to one.
    pub organization: Option<OrganizationId>,
}

impl ViewerSession {
    /// Creates a session for `viewer` scoped to `organization`.
    pub fn new(viewer: impl Into<String>, organization: Option<OrganizationId>) -> Self {
        Self { viewer: viewer.into(), organization }
    }
}

/// Write side of the session state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    tx: watch::Sender<Option<ViewerSession>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Creates a store with no viewer logged in.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns a read-only view of the session.
    pub fn subscribe(&self) -> watch::Receiver<Option<ViewerSession>> {
        self.tx.subscribe()
    }

    /// Returns the current session.
    pub fn current(&self) -> Option<ViewerSession> {
        self.tx.borrow().clone()
    }

    /// Returns the organization currently in scope.
    pub fn organization(&self) -> Option<OrganizationId> {
        organization_of(&self.tx.borrow())
    }

    /// Starts a session.
    pub fn login(&self, session: ViewerSession) {
        info!(viewer = %session.viewer, organization = ?session.organization, "viewer logged in");
        self.tx.send_replace(Some(session));
    }

    /// Moves the current viewer to another organization.
    ///
    /// Does nothing when no viewer is logged in.
    pub fn switch_organization(&self, organization: Option<OrganizationId>) {
        self.tx.send_if_modified(|session| match session {
            Some(session) if session.organization != organization => {
                info!(viewer = %session.viewer, ?organization, "organization switched");
                session.organization = organization;
                true
            }
            _ => false,
        });
    }

    /// Ends the session.
    pub fn logout(&self) {
        if self.tx.send_replace(None).is_some() {
            info!("viewer logged out");
        }
    }
}

/// Extracts the organization scope from a session snapshot.
pub(crate) fn organization_of(session: &Option<ViewerSession>) -> Option<OrganizationId> {
    session.as_ref().and_then(|s| s.organization.clone())
}
