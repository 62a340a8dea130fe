//! Live status channel.
//!
//! The [`LiveChannel`] is the owned component constructed at session start.
//! It spawns a single driver task that feeds session changes, transport
//! signals and timer expiries into a [`ChannelMachine`] and carries out the
//! resulting commands. Subscribers get a read-only [`ChannelHandle`].

use std::time::Duration;

use futures::future;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ChannelConfig,
    machine::{ChannelMachine, Command, Input},
    session::{ViewerSession, organization_of},
    traits::{Link, Transport},
    types::{ChannelError, ChannelEvent, ChannelState, CloseReason, Generation, OrganizationId},
};

/// How long a new link waits for its predecessor to finish closing.
const LINK_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Snapshot of the channel published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    /// Lifecycle state.
    pub state: ChannelState,
    /// Organization in scope.
    pub organization: Option<OrganizationId>,
    /// Endpoint of the current attempt, while connecting or open.
    pub endpoint: Option<Url>,
    /// Generation of the latest attempt.
    pub generation: Generation,
}

/// Read-only view of a [`LiveChannel`] for subscribers.
///
/// Handles can receive events and observe the lifecycle, but cannot close
/// or reopen the connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelHandle {
    /// Registers a new subscriber.
    ///
    /// Only events emitted after this call are received; there is no
    /// history buffer.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Returns the current status snapshot.
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.status.borrow().state.clone()
    }

    /// Returns the endpoint of the current attempt, if any.
    pub fn endpoint(&self) -> Option<Url> {
        self.status.borrow().endpoint.clone()
    }

    /// Returns a receiver notified on every status change.
    ///
    /// The current status counts as already seen.
    pub fn changed(&self) -> watch::Receiver<ChannelStatus> {
        let mut receiver = self.status.clone();
        receiver.mark_unchanged();
        receiver
    }

    /// Waits until the status satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Stopped`] if the channel shuts down first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ChannelStatus) -> bool,
    ) -> Result<ChannelStatus, ChannelError> {
        let mut receiver = self.status.clone();
        let status = receiver.wait_for(predicate).await.map_err(|_| ChannelError::Stopped)?;
        Ok(status.clone())
    }
}

/// Control requests from the owner to the driver.
#[derive(Debug)]
enum Control {
    Reconnect,
    Shutdown,
}

/// A live status channel bound to the viewer's organization.
///
/// # Example
///
/// ```ignore
/// use livestatus::{
///     ChannelConfig, LiveChannel, OrganizationId, SessionStore, ViewerSession, WsTransport,
/// };
///
/// let store = SessionStore::new();
/// let channel = LiveChannel::spawn(ChannelConfig::default(), WsTransport, store.subscribe());
/// let mut events = channel.handle().subscribe();
///
/// store.login(ViewerSession::new("ops@example.com", OrganizationId::new("org-1")));
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
///
/// channel.shutdown().await?;
/// ```
#[derive(Debug)]
pub struct LiveChannel {
    handle: ChannelHandle,
    control: mpsc::UnboundedSender<Control>,
    driver: Option<JoinHandle<()>>,
}

impl LiveChannel {
    /// Creates the channel and spawns its driver task.
    ///
    /// The channel immediately connects if `session` already carries an
    /// organization. Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        config: ChannelConfig,
        transport: T,
        session: watch::Receiver<Option<ViewerSession>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine: ChannelMachine::new(config.clone()),
            config,
            transport,
            session,
            control: control_rx,
            signals_tx,
            signals_rx,
            events: events.clone(),
            status: status_tx,
            next_keep_alive: None,
            reconnect_at: None,
            link: None,
            retiring: Vec::new(),
        };

        Self {
            handle: ChannelHandle { events, status: status_rx },
            control: control_tx,
            driver: Some(tokio::spawn(driver.run())),
        }
    }

    /// Returns a read-only handle for subscribers.
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Requests an immediate reconnect.
    ///
    /// Only takes effect while a reconnect is pending; the pending timer is
    /// cancelled so exactly one attempt is made.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Stopped`] if the driver has exited.
    pub fn reconnect(&self) -> Result<(), ChannelError> {
        self.control.send(Control::Reconnect).map_err(|_| ChannelError::Stopped)
    }

    /// Tears the channel down and waits for the driver to exit.
    ///
    /// Cancels the keep-alive timer, then the reconnect timer, then closes
    /// the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Driver`] if the driver task panicked.
    pub async fn shutdown(mut self) -> Result<(), ChannelError> {
        let Some(driver) = self.driver.take() else {
            return Ok(());
        };
        // The driver may already be gone; awaiting it still reports how it ended.
        let _ = self.control.send(Control::Shutdown);
        driver.await.map_err(|e| ChannelError::Driver(e.to_string()))
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Commands from the driver to a link task.
#[derive(Debug)]
enum LinkCommand {
    Send(String),
    Close,
}

/// Driver-side handle of a link task.
#[derive(Debug)]
struct LinkHandle {
    generation: Generation,
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

/// A link task that was asked to close; aborted if dropped unfinished.
#[derive(Debug)]
struct RetiredLink(JoinHandle<()>);

impl Drop for RetiredLink {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Single owner of the machine, the timers and the link.
struct Driver<T: Transport> {
    machine: ChannelMachine,
    config: ChannelConfig,
    transport: T,
    session: watch::Receiver<Option<ViewerSession>>,
    control: mpsc::UnboundedReceiver<Control>,
    signals_tx: mpsc::UnboundedSender<Input>,
    signals_rx: mpsc::UnboundedReceiver<Input>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
    next_keep_alive: Option<Instant>,
    reconnect_at: Option<Instant>,
    link: Option<LinkHandle>,
    retiring: Vec<RetiredLink>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        let initial = organization_of(&self.session.borrow_and_update());
        self.apply(Input::Scope(initial));

        let mut session_live = true;
        while !self.machine.is_shut_down() {
            // Owner and session inputs are polled first so a scope change
            // always wins over a timer that expired in the same turn.
            let input = tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Reconnect) => Input::Reconnect,
                    Some(Control::Shutdown) | None => Input::Shutdown,
                },
                changed = self.session.changed(), if session_live => match changed {
                    Ok(()) => Input::Scope(organization_of(&self.session.borrow_and_update())),
                    Err(_) => {
                        debug!("session store dropped, ending session");
                        session_live = false;
                        Input::Scope(None)
                    }
                },
                Some(input) = self.signals_rx.recv() => input,
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    Input::ReconnectDue
                },
                () = sleep_until(self.next_keep_alive) => {
                    let interval = self.config.keep_alive_interval;
                    self.next_keep_alive = self.next_keep_alive.map(|at| at + interval);
                    Input::KeepAliveDue
                },
            };
            self.apply(input);
        }

        if let Some(link) = self.link.take() {
            self.retire(link);
        }
        settle(std::mem::take(&mut self.retiring)).await;
        debug!("channel driver exited");
    }

    fn apply(&mut self, input: Input) {
        for command in self.machine.handle(input) {
            self.execute(command);
        }
        self.publish_status();
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { generation, endpoint } => self.connect(generation, endpoint),
            Command::Disconnect { generation } => {
                if let Some(link) = self.link.take_if(|link| link.generation == generation) {
                    self.retire(link);
                }
            }
            Command::StartKeepAlive => {
                self.next_keep_alive = Some(Instant::now() + self.config.keep_alive_interval);
            }
            Command::StopKeepAlive => self.next_keep_alive = None,
            Command::ScheduleReconnect => {
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            }
            Command::CancelReconnect => self.reconnect_at = None,
            Command::SendKeepAlive { generation } => match &self.link {
                Some(link) if link.generation == generation => {
                    let ping = LinkCommand::Send(self.config.keep_alive_payload.clone());
                    if link.commands.send(ping).is_err() {
                        debug!(generation, "keep-alive dropped, link already gone");
                    }
                }
                _ => debug!(generation, "keep-alive for retired link skipped"),
            },
            Command::Emit(event) => {
                if self.events.send(event).is_err() {
                    debug!("no channel subscribers");
                }
            }
        }
    }

    fn connect(&mut self, generation: Generation, endpoint: Url) {
        if let Some(link) = self.link.take() {
            self.retire(link);
        }
        let previous = std::mem::take(&mut self.retiring);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            self.transport.clone(),
            generation,
            endpoint,
            previous,
            commands_rx,
            self.signals_tx.clone(),
        ));
        self.link = Some(LinkHandle { generation, commands: commands_tx, task });
    }

    fn retire(&mut self, link: LinkHandle) {
        // A finished task has dropped its receiver; the send error is expected.
        let _ = link.commands.send(LinkCommand::Close);
        self.retiring.push(RetiredLink(link.task));
    }

    fn publish_status(&self) {
        let next = ChannelStatus {
            state: self.machine.state().clone(),
            organization: self.machine.organization().cloned(),
            endpoint: self
                .machine
                .endpoint()
                .filter(|_| self.machine.state().is_active())
                .cloned(),
            generation: self.machine.generation(),
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Waits for retired link tasks to finish closing, aborting stragglers.
async fn settle(tasks: Vec<RetiredLink>) {
    for mut task in tasks {
        if time::timeout(LINK_CLOSE_GRACE, &mut task.0).await.is_err() {
            warn!("retired link did not close in time, aborting");
            task.0.abort();
            // Resolves once the cancelled task has dropped its stream.
            let _ = (&mut task.0).await;
        }
    }
}

/// Resolves once the driver asks the link to close.
async fn close_requested(commands: &mut mpsc::UnboundedReceiver<LinkCommand>) {
    loop {
        match commands.recv().await {
            Some(LinkCommand::Close) | None => return,
            Some(LinkCommand::Send(_)) => {}
        }
    }
}

/// Owns one stream from open to close and reports its signals.
async fn run_link<T: Transport>(
    transport: T,
    generation: Generation,
    endpoint: Url,
    previous: Vec<RetiredLink>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    signals: mpsc::UnboundedSender<Input>,
) {
    // Runs to completion even if this attempt is abandoned meanwhile, so a
    // predecessor still closing is never detached.
    settle(previous).await;

    let opened = tokio::select! {
        biased;
        () = close_requested(&mut commands) => {
            debug!(generation, "attempt abandoned before open");
            return;
        }
        opened = transport.open(&endpoint) => opened,
    };

    let mut link = match opened {
        Ok(link) => link,
        Err(e) => {
            warn!(generation, endpoint = %endpoint, error = %e, "open failed");
            let reason = CloseReason::ConnectFailed(e.to_string());
            let _ = signals.send(Input::Closed { generation, reason });
            return;
        }
    };
    let _ = signals.send(Input::Opened { generation });

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(text)) => {
                    if let Err(e) = link.send_text(&text).await {
                        debug!(generation, error = %e, "keep-alive send failed");
                    }
                }
                Some(LinkCommand::Close) | None => {
                    link.close().await;
                    break CloseReason::Local;
                }
            },
            inbound = link.next_payload() => match inbound {
                Ok(Some(payload)) => {
                    let _ = signals.send(Input::Message { generation, payload });
                }
                Ok(None) => break CloseReason::Remote,
                Err(e) => {
                    let _ = signals.send(Input::Errored { generation, error: e.to_string() });
                    link.close().await;
                    break CloseReason::Transport(e.to_string());
                }
            },
        }
    };

    info!(generation, reason = %reason, "link closed");
    let _ = signals.send(Input::Closed { generation, reason });
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        session::SessionStore,
        types::{Payload, TransportError},
    };

    type Remote = mpsc::UnboundedSender<Result<Option<Payload>, TransportError>>;

    #[derive(Default)]
    struct MockState {
        attempts: Vec<(Instant, Url)>,
        sent: Vec<(Instant, Url, String)>,
        remotes: Vec<Remote>,
        fail_opens: bool,
        fail_sends: bool,
        open_delay: Option<Duration>,
        close_delay: Option<Duration>,
        live: usize,
        max_live: usize,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn failing() -> Self {
            let transport = Self::default();
            transport.state.lock().unwrap().fail_opens = true;
            transport
        }

        fn slow(delay: Duration) -> Self {
            let transport = Self::default();
            transport.state.lock().unwrap().open_delay = Some(delay);
            transport
        }

        fn slow_close(delay: Duration) -> Self {
            let transport = Self::default();
            transport.state.lock().unwrap().close_delay = Some(delay);
            transport
        }

        fn set_failing_sends(&self, fail: bool) {
            self.state.lock().unwrap().fail_sends = fail;
        }

        fn set_failing(&self, fail: bool) {
            self.state.lock().unwrap().fail_opens = fail;
        }

        fn attempt_offsets(&self, start: Instant) -> Vec<Duration> {
            self.state.lock().unwrap().attempts.iter().map(|(at, _)| *at - start).collect()
        }

        fn attempts(&self) -> usize {
            self.state.lock().unwrap().attempts.len()
        }

        fn sent(&self) -> Vec<(Instant, Url, String)> {
            self.state.lock().unwrap().sent.clone()
        }

        fn live(&self) -> usize {
            self.state.lock().unwrap().live
        }

        fn max_live(&self) -> usize {
            self.state.lock().unwrap().max_live
        }

        fn remote(&self, index: usize) -> Remote {
            self.state.lock().unwrap().remotes[index].clone()
        }
    }

    struct MockLink {
        endpoint: Url,
        inbound: mpsc::UnboundedReceiver<Result<Option<Payload>, TransportError>>,
        state: Arc<Mutex<MockState>>,
    }

    impl Drop for MockLink {
        fn drop(&mut self) {
            self.state.lock().unwrap().live -= 1;
        }
    }

    impl Transport for MockTransport {
        type Link = MockLink;

        async fn open(&self, endpoint: &Url) -> Result<MockLink, TransportError> {
            let delay = {
                let mut state = self.state.lock().unwrap();
                state.attempts.push((Instant::now(), endpoint.clone()));
                state.open_delay
            };
            if let Some(delay) = delay {
                time::sleep(delay).await;
            }

            let mut state = self.state.lock().unwrap();
            if state.fail_opens {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.remotes.push(tx);
            state.live += 1;
            state.max_live = state.max_live.max(state.live);
            Ok(MockLink { endpoint: endpoint.clone(), inbound: rx, state: Arc::clone(&self.state) })
        }
    }

    impl Link for MockLink {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.sent.push((Instant::now(), self.endpoint.clone(), text.to_string()));
            if state.fail_sends {
                return Err(TransportError::Send("broken pipe".to_string()));
            }
            Ok(())
        }

        async fn next_payload(&mut self) -> Result<Option<Payload>, TransportError> {
            self.inbound.recv().await.unwrap_or(Ok(None))
        }

        async fn close(&mut self) {
            let delay = self.state.lock().unwrap().close_delay;
            if let Some(delay) = delay {
                time::sleep(delay).await;
            }
        }
    }

    fn org(id: &str) -> Option<OrganizationId> {
        OrganizationId::new(id)
    }

    fn config() -> ChannelConfig {
        ChannelConfig::new("ws://status.test/api/v1").unwrap()
    }

    fn endpoint(id: &str) -> Url {
        Url::parse(&format!("ws://status.test/api/v1/ws/{id}")).unwrap()
    }

    async fn wait_state(handle: &ChannelHandle, state: ChannelState) -> ChannelStatus {
        handle.wait_for(|s| s.state == state).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_against_org_endpoint_and_delivers_messages() {
        let store = SessionStore::new();
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();
        let mut events = handle.subscribe();

        store.login(ViewerSession::new("ops", org("org-1")));
        let status = wait_state(&handle, ChannelState::Open).await;
        assert_eq!(status.endpoint, Some(endpoint("org-1")));

        let opened = events.recv().await.unwrap();
        assert!(matches!(
            opened,
            ChannelEvent::Opened { endpoint: e, .. } if e == endpoint("org-1")
        ));

        let payload = Payload::Text(r#"{"type":"incident_created","id":7}"#.to_string());
        transport.remote(0).send(Ok(Some(payload.clone()))).unwrap();
        let message = events.recv().await.unwrap();
        assert_eq!(message, ChannelEvent::Message { organization: org("org-1").unwrap(), payload });

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_only_while_open() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();
        let start = Instant::now();

        wait_state(&handle, ChannelState::Open).await;
        time::sleep(Duration::from_secs(95)).await;

        let sent = transport.sent();
        let offsets: Vec<_> = sent.iter().map(|(at, _, _)| *at - start).collect();
        assert_eq!(
            offsets,
            vec![Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(90)]
        );
        assert!(sent.iter().all(|(_, _, text)| text == "ping"));

        // Peer closes; every later attempt fails, so no keep-alive may follow.
        transport.set_failing(true);
        transport.remote(0).send(Ok(None)).unwrap();
        handle.wait_for(|s| matches!(s.state, ChannelState::Closed(_))).await.unwrap();
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.sent().len(), 3);

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failures_retry_at_fixed_interval() {
        let store = SessionStore::new();
        let transport = MockTransport::failing();
        let start = Instant::now();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());

        store.login(ViewerSession::new("ops", org("org-1")));
        time::sleep(Duration::from_secs(16)).await;

        assert_eq!(
            transport.attempt_offsets(start),
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
            ]
        );
        assert!(matches!(
            channel.handle().state(),
            ChannelState::Closed(CloseReason::ConnectFailed(_))
        ));

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_replaces_pending_timer() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::failing();
        let start = Instant::now();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());

        time::sleep(Duration::from_secs(1)).await;
        channel.reconnect().unwrap();
        time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            transport.attempt_offsets(start),
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(6)]
        );

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_org_switch_closes_old_stream_first() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();

        wait_state(&handle, ChannelState::Open).await;
        time::sleep(Duration::from_secs(31)).await;

        let switched_at = Instant::now();
        store.switch_organization(org("org-2"));
        let status = handle
            .wait_for(|s| s.state == ChannelState::Open && s.endpoint == Some(endpoint("org-2")))
            .await
            .unwrap();
        assert_eq!(status.generation, 2);

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.max_live(), 1);
        assert_eq!(transport.live(), 1);
        let stale: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|(at, url, _)| *at >= switched_at && *url == endpoint("org-1"))
            .collect();
        assert!(stale.is_empty());
        assert_eq!(
            transport.sent().iter().filter(|(_, url, _)| *url == endpoint("org-2")).count(),
            2
        );

        channel.shutdown().await.unwrap();
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_switches_wait_for_slow_close() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::slow_close(Duration::from_secs(1));
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();

        wait_state(&handle, ChannelState::Open).await;

        // The org-2 attempt is abandoned while org-1 is still closing.
        store.switch_organization(org("org-2"));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        store.switch_organization(org("org-3"));

        let status = handle
            .wait_for(|s| s.state == ChannelState::Open && s.endpoint == Some(endpoint("org-3")))
            .await
            .unwrap();
        assert_eq!(status.generation, 3);

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.max_live(), 1);
        assert_eq!(transport.live(), 1);
        assert_eq!(handle.endpoint(), Some(endpoint("org-3")));

        channel.shutdown().await.unwrap();
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_send_failure_is_ignored() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();
        let mut events = handle.subscribe();

        wait_state(&handle, ChannelState::Open).await;
        transport.set_failing_sends(true);
        time::sleep(Duration::from_secs(61)).await;

        // Both keep-alives were attempted and failed.
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(handle.state(), ChannelState::Open);
        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.live(), 1);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ChannelEvent::Closed { .. }), "unexpected {event:?}");
        }

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_notifies_state_transitions() {
        let store = SessionStore::new();
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let mut changes = channel.handle().changed();
        assert!(!changes.has_changed().unwrap());

        store.login(ViewerSession::new("ops", org("org-1")));
        let status = changes.wait_for(|s| s.state == ChannelState::Open).await.unwrap().clone();
        assert_eq!(status.organization, org("org-1"));

        store.logout();
        changes.wait_for(|s| s.state == ChannelState::Idle).await.unwrap();

        channel.shutdown().await.unwrap();
        assert!(changes.changed().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_while_open_returns_to_idle() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();
        let mut events = handle.subscribe();

        wait_state(&handle, ChannelState::Open).await;
        store.logout();
        let status = wait_state(&handle, ChannelState::Idle).await;
        assert!(status.organization.is_none());
        assert!(status.endpoint.is_none());

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.live(), 0);
        assert!(transport.sent().is_empty());

        let mut closes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Closed { reason } = event {
                closes.push(reason);
            }
        }
        assert_eq!(closes, vec![CloseReason::Local]);

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_while_connecting_discards_open() {
        let store = SessionStore::new();
        let transport = MockTransport::slow(Duration::from_secs(3));
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();
        let mut events = handle.subscribe();

        store.login(ViewerSession::new("ops", org("org-1")));
        wait_state(&handle, ChannelState::Connecting).await;
        store.logout();
        wait_state(&handle, ChannelState::Idle).await;

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state(), ChannelState::Idle);
        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.max_live(), 0);
        assert!(transport.sent().is_empty());
        assert!(events.try_recv().is_err());

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_remote_close() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();

        wait_state(&handle, ChannelState::Open).await;
        transport.remote(0).send(Err(TransportError::Receive("reset".to_string()))).unwrap();
        let closed = handle.wait_for(|s| matches!(s.state, ChannelState::Closed(_))).await.unwrap();
        assert_eq!(
            closed.state,
            ChannelState::Closed(CloseReason::Transport("receive failed: reset".to_string()))
        );

        let reopened =
            handle.wait_for(|s| s.state == ChannelState::Open && s.generation == 2).await.unwrap();
        assert_eq!(reopened.endpoint, Some(endpoint("org-1")));
        assert_eq!(transport.max_live(), 1);

        channel.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();

        wait_state(&handle, ChannelState::Open).await;
        channel.shutdown().await.unwrap();
        assert_eq!(transport.live(), 0);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempts(), 1);
        assert!(transport.sent().is_empty());
        assert!(matches!(handle.wait_for(|_| false).await, Err(ChannelError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_store_ends_session() {
        let store = SessionStore::new();
        store.login(ViewerSession::new("ops", org("org-1")));
        let transport = MockTransport::default();
        let channel = LiveChannel::spawn(config(), transport.clone(), store.subscribe());
        let handle = channel.handle();

        wait_state(&handle, ChannelState::Open).await;
        drop(store);
        wait_state(&handle, ChannelState::Idle).await;
        assert_eq!(transport.live(), 0);

        channel.shutdown().await.unwrap();
    }
}
