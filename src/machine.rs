//! Lifecycle state machine of the live status channel.
//!
//! [`ChannelMachine`] is pure: it consumes [`Input`]s and returns the
//! [`Command`]s the driver must carry out. It owns no timers and no
//! sockets, which keeps every cancellation rule checkable in plain unit
//! tests.
//!
//! Teardown always emits, in order and only for live resources:
//! [`Command::StopKeepAlive`], [`Command::CancelReconnect`],
//! [`Command::Disconnect`].

use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ChannelConfig,
    types::{ChannelEvent, ChannelState, CloseReason, Generation, OrganizationId, Payload},
};

/// An event delivered to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The organization in scope changed (`None` on logout).
    Scope(Option<OrganizationId>),
    /// The transport opened the stream of `generation`.
    Opened {
        /// Attempt the signal belongs to.
        generation: Generation,
    },
    /// The stream of `generation` closed or failed to open.
    Closed {
        /// Attempt the signal belongs to.
        generation: Generation,
        /// Why it closed.
        reason: CloseReason,
    },
    /// The transport reported an error on `generation`.
    Errored {
        /// Attempt the signal belongs to.
        generation: Generation,
        /// Error description.
        error: String,
    },
    /// A payload arrived on `generation`.
    Message {
        /// Attempt the signal belongs to.
        generation: Generation,
        /// The raw payload.
        payload: Payload,
    },
    /// The keep-alive timer fired.
    KeepAliveDue,
    /// The reconnect timer fired.
    ReconnectDue,
    /// Manual reconnect request.
    Reconnect,
    /// The owner is disposing of the channel.
    Shutdown,
}

/// A side effect requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a new stream.
    Connect {
        /// Attempt number of the new stream.
        generation: Generation,
        /// Where to connect.
        endpoint: Url,
    },
    /// Close the stream of `generation`.
    Disconnect {
        /// Attempt to close.
        generation: Generation,
    },
    /// Arm the keep-alive timer.
    StartKeepAlive,
    /// Disarm the keep-alive timer.
    StopKeepAlive,
    /// Arm the reconnect timer.
    ScheduleReconnect,
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Send the keep-alive frame on `generation`.
    SendKeepAlive {
        /// Attempt to send on.
        generation: Generation,
    },
    /// Deliver an event to subscribers.
    Emit(ChannelEvent),
}

/// The channel's finite-state machine.
#[derive(Debug)]
pub struct ChannelMachine {
    config: ChannelConfig,
    state: ChannelState,
    organization: Option<OrganizationId>,
    endpoint: Option<Url>,
    generation: Generation,
    keep_alive_armed: bool,
    reconnect_pending: bool,
    shut_down: bool,
}

impl ChannelMachine {
    /// Creates an idle machine.
    pub const fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: ChannelState::Idle,
            organization: None,
            endpoint: None,
            generation: 0,
            keep_alive_armed: false,
            reconnect_pending: false,
            shut_down: false,
        }
    }

    /// Returns the current lifecycle state.
    pub const fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Returns the organization in scope.
    pub const fn organization(&self) -> Option<&OrganizationId> {
        self.organization.as_ref()
    }

    /// Returns the endpoint of the current (or last) attempt while in scope.
    pub const fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Returns the generation of the latest attempt.
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns true while the keep-alive timer is armed.
    pub const fn keep_alive_armed(&self) -> bool {
        self.keep_alive_armed
    }

    /// Returns true while a reconnect is scheduled.
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Returns true once [`Input::Shutdown`] has been handled.
    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Applies `input` and returns the commands to execute, in order.
    pub fn handle(&mut self, input: Input) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.shut_down {
            debug!(?input, "input after shutdown ignored");
            return commands;
        }

        match input {
            Input::Scope(organization) => self.on_scope(organization, &mut commands),
            Input::Opened { generation } => self.on_opened(generation, &mut commands),
            Input::Closed { generation, reason } => {
                self.on_closed(generation, reason, &mut commands)
            }
            Input::Errored { generation, error } => {
                if generation == self.generation && self.state.is_active() {
                    warn!(generation, error = %error, "transport error");
                } else {
                    debug!(generation, error = %error, "stale transport error ignored");
                }
            }
            Input::Message { generation, payload } => {
                match (&self.state, &self.organization) {
                    (ChannelState::Open, Some(organization)) if generation == self.generation => {
                        commands.push(Command::Emit(ChannelEvent::Message {
                            organization: organization.clone(),
                            payload,
                        }));
                    }
                    _ => debug!(generation, "message outside open stream dropped"),
                }
            }
            Input::KeepAliveDue => {
                if self.state == ChannelState::Open {
                    commands.push(Command::SendKeepAlive { generation: self.generation });
                }
            }
            Input::ReconnectDue => self.on_reconnect_due(&mut commands),
            Input::Reconnect => {
                if self.reconnect_pending {
                    info!("manual reconnect requested");
                    self.connect(&mut commands);
                } else {
                    debug!(state = %self.state, "manual reconnect ignored");
                }
            }
            Input::Shutdown => {
                self.teardown(&mut commands);
                self.organization = None;
                self.shut_down = true;
                info!("channel shut down");
            }
        }

        commands
    }

    fn on_scope(&mut self, organization: Option<OrganizationId>, commands: &mut Vec<Command>) {
        if organization.is_some() && organization == self.organization {
            debug!(organization = ?organization, "organization unchanged");
            return;
        }

        self.teardown(commands);
        self.organization = organization;

        if self.organization.is_some() {
            self.connect(commands);
        } else {
            info!("organization scope cleared");
        }
    }

    fn on_opened(&mut self, generation: Generation, commands: &mut Vec<Command>) {
        if generation != self.generation || self.state != ChannelState::Connecting {
            debug!(generation, current = self.generation, "stale open ignored");
            return;
        }
        let (Some(organization), Some(endpoint)) = (&self.organization, &self.endpoint) else {
            return;
        };

        info!(generation, organization = %organization, endpoint = %endpoint, "stream open");
        self.state = ChannelState::Open;
        if self.reconnect_pending {
            self.reconnect_pending = false;
            commands.push(Command::CancelReconnect);
        }
        self.keep_alive_armed = true;
        commands.push(Command::StartKeepAlive);
        commands.push(Command::Emit(ChannelEvent::Opened {
            organization: organization.clone(),
            endpoint: endpoint.clone(),
        }));
    }

    fn on_closed(
        &mut self,
        generation: Generation,
        reason: CloseReason,
        commands: &mut Vec<Command>,
    ) {
        if generation != self.generation || !self.state.is_active() {
            debug!(generation, current = self.generation, "stale close ignored");
            return;
        }

        info!(generation, reason = %reason, "stream closed");
        if self.keep_alive_armed {
            self.keep_alive_armed = false;
            commands.push(Command::StopKeepAlive);
        }
        self.state = ChannelState::Closed(reason.clone());
        commands.push(Command::Emit(ChannelEvent::Closed { reason }));

        if self.organization.is_some() && !self.reconnect_pending {
            debug!(delay = ?self.config.reconnect_delay, "reconnect scheduled");
            self.reconnect_pending = true;
            commands.push(Command::ScheduleReconnect);
        }
    }

    fn on_reconnect_due(&mut self, commands: &mut Vec<Command>) {
        if !self.reconnect_pending {
            debug!("cancelled reconnect fired, ignored");
            return;
        }
        self.reconnect_pending = false;

        if self.organization.is_some() && matches!(self.state, ChannelState::Closed(_)) {
            self.connect(commands);
        } else {
            self.state = ChannelState::Idle;
        }
    }

    /// Starts a fresh attempt against the organization in scope.
    fn connect(&mut self, commands: &mut Vec<Command>) {
        self.teardown(commands);
        let Some(organization) = &self.organization else {
            return;
        };

        self.generation += 1;
        let endpoint = self.config.endpoint(organization);
        info!(generation = self.generation, endpoint = %endpoint, "connecting");
        self.endpoint = Some(endpoint.clone());
        self.state = ChannelState::Connecting;
        commands.push(Command::Connect { generation: self.generation, endpoint });
    }

    /// Releases every live resource and returns to idle.
    fn teardown(&mut self, commands: &mut Vec<Command>) {
        if self.keep_alive_armed {
            self.keep_alive_armed = false;
            commands.push(Command::StopKeepAlive);
        }
        if self.reconnect_pending {
            self.reconnect_pending = false;
            commands.push(Command::CancelReconnect);
        }

        let was_open = self.state == ChannelState::Open;
        if self.state.is_active() {
            commands.push(Command::Disconnect { generation: self.generation });
        }
        if was_open {
            commands.push(Command::Emit(ChannelEvent::Closed { reason: CloseReason::Local }));
        }

        self.state = ChannelState::Idle;
        self.endpoint = None;
    }
}
