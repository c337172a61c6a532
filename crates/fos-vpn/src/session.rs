//! Tunnel Session Controller
//!
//! One actor task owns every piece of session state: status, selected
//! server, key validity override, connectivity flag and the running
//! observers. [`SessionHandle`] talks to it through an inbox; the
//! connection tester and spawned configuration jobs report back through
//! their own channels into the same loop.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──job ok──▶ Connected ◀──reconnected──┐
//!      ▲                      │                      │                     │
//!      │                  job failed            failure 1 ──▶ Reasserting ─┘
//!      │                      │                      │
//!      └──── Disconnecting ◀──┴──── stop / failure 2 ┘
//! ```
//!
//! Configuration jobs (start, rekey, fix, reconfigure) run one at a time in
//! spawned tasks. Each carries the session epoch it was started in; stop
//! bumps the epoch, so a late result can never touch a newer session.

use crate::adapter::{AdapterError, TunnelAdapter};
use crate::bandwidth::BandwidthAnalyzer;
use crate::connection_tester::{
    ConnectionTester, ConnectivityProbe, TesterEvent, TesterReport, DEFAULT_TEST_INTERVAL,
};
use crate::device_manager::{DeviceManager, ServerSelectionMethod};
use crate::error::{ErrorEvent, VpnError};
use crate::host_message::{HostMessage, HostResponse};
use crate::latency::{LatencyProbe, LatencyReporter, DEFAULT_LATENCY_INTERVAL};
use crate::options::{Activation, SelectedServer, StartOptions};
use crate::platform::PlatformHooks;
use crate::server::ServerInfo;
use crate::status::{ConnectionStatus, ServerStatusInfo, SessionEvent, StatusChange, StatusPublisher};
use crate::unhandled;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default time between bandwidth samples
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before a failed rekey or fix is retried
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_CAPACITY: usize = 32;

/// Session timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub test_interval: Duration,
    pub latency_interval: Duration,
    pub sampling_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            test_interval: DEFAULT_TEST_INTERVAL,
            latency_interval: DEFAULT_LATENCY_INTERVAL,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Why the session is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user turned the tunnel off
    UserInitiated,
    /// The tunnel could not be repaired
    ConnectionFailed,
    /// The host asked to wipe all state
    StateReset,
    /// The process is exiting
    Shutdown,
}

/// Errors surfaced to the caller of a session operation
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to generate a tunnel configuration: {0}")]
    CouldNotGenerateTunnelConfiguration(#[source] VpnError),

    #[error("Invalid start options: {0}")]
    InvalidStartOptions(#[source] VpnError),

    #[error("Could not fix the connection")]
    CouldNotFixConnection,

    #[error("Simulated a tunnel error as requested")]
    SimulatedFailure,

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Session is already {0}")]
    AlreadyStarted(ConnectionStatus),

    #[error("Start was cancelled")]
    Cancelled,

    #[error("Session task has exited")]
    Closed,

    #[error(transparent)]
    Unhandled(VpnError),
}

impl SessionError {
    /// Stable identifier used for telemetry
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::CouldNotGenerateTunnelConfiguration(_) => "couldNotGenerateTunnelConfiguration",
            SessionError::InvalidStartOptions(_) => "startingTunnelWithoutAuthToken",
            SessionError::CouldNotFixConnection => "couldNotFixConnection",
            SessionError::SimulatedFailure => "simulateTunnelFailureError",
            SessionError::Adapter(_) => "couldNotStartBackend",
            SessionError::AlreadyStarted(_) => "alreadyStarted",
            SessionError::Cancelled => "cancelled",
            SessionError::Closed => "sessionClosed",
            SessionError::Unhandled(e) => e.code(),
        }
    }
}

/// Configuration job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Start,
    Rekey,
    /// Move away from the current server after a failed probe
    Fix,
    /// Follow a changed server preference
    Reconfigure,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Start => write!(f, "start"),
            Job::Rekey => write!(f, "rekey"),
            Job::Fix => write!(f, "fix"),
            Job::Reconfigure => write!(f, "reconfigure"),
        }
    }
}

struct JobResult {
    epoch: u64,
    job: Job,
    result: Result<ServerInfo, SessionError>,
}

struct InFlight {
    job: Job,
    abort: AbortHandle,
}

struct PendingStart {
    activation: Activation,
    reply: oneshot::Sender<Result<(), SessionError>>,
}

enum Command {
    Start {
        options: StartOptions,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        reason: StopReason,
        reply: oneshot::Sender<()>,
    },
    Sleep {
        reply: oneshot::Sender<()>,
    },
    Wake {
        reply: oneshot::Sender<()>,
    },
    HostMessage {
        message: HostMessage,
        reply: oneshot::Sender<HostResponse>,
    },
    Status {
        reply: oneshot::Sender<StatusChange>,
    },
    #[cfg(test)]
    Tester(TesterEvent),
}

/// Collaborators a session is built from
pub struct SessionParts {
    pub devices: Arc<DeviceManager>,
    pub adapter: Arc<dyn TunnelAdapter>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub latency_probe: Arc<dyn LatencyProbe>,
    pub platform: Arc<dyn PlatformHooks>,
    pub config: SessionConfig,
}

/// Cloneable front end of a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Bring the tunnel up; resolves once it is connected or has failed
    pub async fn start(&self, options: StartOptions) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { options, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn stop(&self, reason: StopReason) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reason, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Pause observation while the device sleeps
    pub async fn sleep(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Sleep { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn wake(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Wake { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn handle_host_message(&self, message: HostMessage) -> Result<HostResponse, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::HostMessage { message, reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn status(&self) -> Result<StatusChange, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    async fn inject_tester_event(&self, event: TesterEvent) {
        self.send(Command::Tester(event)).await.unwrap();
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }
}

/// Session actor state
pub struct TunnelSessionController {
    devices: Arc<DeviceManager>,
    adapter: Arc<dyn TunnelAdapter>,
    platform: Arc<dyn PlatformHooks>,
    config: SessionConfig,
    publisher: StatusPublisher,
    tester: ConnectionTester,
    latency: LatencyReporter,
    bandwidth: BandwidthAnalyzer,
    jobs: mpsc::UnboundedSender<JobResult>,
    epoch: Arc<AtomicU64>,
    in_flight: Option<InFlight>,
    queued: Option<Job>,
    retry: Option<(Instant, Job)>,
    pending_start: Option<PendingStart>,
    selected_server: SelectedServer,
    key_validity: Option<Duration>,
    current_server: Option<ServerInfo>,
    connected_since: Option<DateTime<Utc>>,
    connectivity_issues: bool,
    observing: bool,
    /// Device asleep: jobs may finish, nothing probes
    suspended: bool,
    terminated: bool,
    last_error: Option<String>,
}

impl TunnelSessionController {
    /// Spawn the session actor
    pub fn spawn(parts: SessionParts) -> SessionHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (jobs_tx, jobs) = mpsc::unbounded_channel();

        let publisher = StatusPublisher::new();
        let events = publisher.sender();

        let controller = Self {
            tester: ConnectionTester::new(parts.probe, reports_tx)
                .with_interval(parts.config.test_interval),
            latency: LatencyReporter::new(parts.latency_probe, publisher.sender())
                .with_interval(parts.config.latency_interval),
            devices: parts.devices,
            adapter: parts.adapter,
            platform: parts.platform,
            config: parts.config,
            publisher,
            bandwidth: BandwidthAnalyzer::new(),
            jobs: jobs_tx,
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: None,
            queued: None,
            retry: None,
            pending_start: None,
            selected_server: SelectedServer::Automatic,
            key_validity: None,
            current_server: None,
            connected_since: None,
            connectivity_issues: false,
            observing: false,
            suspended: false,
            terminated: false,
            last_error: None,
        };

        tokio::spawn(controller.run(commands, reports, jobs));

        SessionHandle {
            commands: commands_tx,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::UnboundedReceiver<TesterReport>,
        mut jobs: mpsc::UnboundedReceiver<JobResult>,
    ) {
        let period = self.config.sampling_interval;
        let mut sampling = interval_at(Instant::now() + period, period);
        sampling.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry.as_ref().map(|(at, _)| *at);
            let retry_due = async move {
                match retry_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
                Some(result) = jobs.recv() => self.handle_job_result(result).await,
                _ = sampling.tick(), if self.observing => self.sample().await,
                _ = retry_due, if !self.suspended => self.retry_due(),
            }
        }

        debug!("All session handles dropped, shutting down");
        if self.publisher.status() != ConnectionStatus::Disconnected {
            self.stop(StopReason::Shutdown).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { options, reply } => self.start(options, reply).await,
            Command::Stop { reason, reply } => {
                self.stop(reason).await;
                let _ = reply.send(());
            }
            Command::Sleep { reply } => {
                self.sleep();
                let _ = reply.send(());
            }
            Command::Wake { reply } => {
                self.wake();
                let _ = reply.send(());
            }
            Command::HostMessage { message, reply } => {
                let response = self.handle_host_message(message).await;
                let _ = reply.send(response);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.publisher.current());
            }
            #[cfg(test)]
            Command::Tester(event) => self.handle_tester_event(event).await,
        }
    }

    async fn start(&mut self, options: StartOptions, reply: oneshot::Sender<Result<(), SessionError>>) {
        let status = self.publisher.status();
        if status != ConnectionStatus::Disconnected {
            let _ = reply.send(Err(SessionError::AlreadyStarted(status)));
            return;
        }

        info!("Starting tunnel (activated from {})", options.activation);

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.terminated = false;
        self.suspended = false;
        self.last_error = None;
        self.set_connectivity_issues(false);
        self.publisher.set(ConnectionStatus::Connecting);

        let pending = PendingStart {
            activation: options.activation,
            reply,
        };

        if options.simulate_failure {
            self.fail_start(pending, SessionError::SimulatedFailure).await;
            return;
        }

        if let Err(e) = self.load_options(&options) {
            self.fail_start(pending, SessionError::InvalidStartOptions(e)).await;
            return;
        }

        self.pending_start = Some(pending);
        self.spawn_job(Job::Start);
    }

    fn load_options(&mut self, options: &StartOptions) -> Result<(), VpnError> {
        if let Some(ref selected) = options.selected_server {
            self.selected_server = selected.clone();
        }
        if options.key_validity.is_some() {
            self.set_key_validity(options.key_validity);
        }
        if let Some(ref token) = options.auth_token {
            self.devices.token_store().store_token(token)?;
        }
        Ok(())
    }

    async fn finish_start(&mut self, result: Result<ServerInfo, SessionError>) {
        let Some(pending) = self.pending_start.take() else {
            return;
        };

        match result {
            Ok(server) => {
                info!("Tunnel started with server {}", server.name);
                self.select_server(server);
                self.adapter_started(false);

                let _ = pending.reply.send(Ok(()));
                if pending.activation != Activation::OnDemand {
                    self.platform.enable_on_demand().await;
                }
            }
            Err(e) => self.fail_start(pending, e).await,
        }
    }

    async fn fail_start(&mut self, pending: PendingStart, error: SessionError) {
        error!("Failed to start tunnel: {}", error);

        self.record_error(&error);
        self.publisher.set(ConnectionStatus::Disconnected);

        // An on-demand rule would immediately retry the same failing start
        if pending.activation == Activation::OnDemand {
            self.platform.disable_on_demand().await;
        }

        let _ = pending.reply.send(Err(error));
    }

    async fn stop(&mut self, reason: StopReason) {
        let status = self.publisher.status();
        info!("Stopping tunnel ({:?})", reason);

        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(in_flight) = self.in_flight.take() {
            debug!("Abandoning in-flight {} job", in_flight.job);
            in_flight.abort.abort();
        }
        self.queued = None;
        self.retry = None;

        // Observers go first so nothing probes a tunnel being torn down
        self.tester.stop();
        self.latency.stop();
        self.observing = false;
        self.bandwidth.reset();

        if let Some(pending) = self.pending_start.take() {
            let _ = pending.reply.send(Err(SessionError::Cancelled));
        }

        if status != ConnectionStatus::Disconnected {
            self.publisher.set(ConnectionStatus::Disconnecting);
            if let Err(e) = self.adapter.stop().await {
                warn!("Failed to stop tunnel adapter: {}", e);
            }
            self.publisher.set(ConnectionStatus::Disconnected);
        }

        self.connected_since = None;
        self.set_connectivity_issues(false);

        if reason == StopReason::UserInitiated {
            self.platform.disable_on_demand().await;
        }
    }

    /// Terminal failure; only the first one per session stops it
    async fn fail_session(&mut self, error: SessionError) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        error!("Stopping tunnel after unrecoverable error: {}", error);
        self.record_error(&error);
        self.stop(StopReason::ConnectionFailed).await;
    }

    fn sleep(&mut self) {
        info!("Device going to sleep, pausing observers");
        self.suspended = true;
        self.tester.stop();
        self.latency.stop();
        self.observing = false;
    }

    fn wake(&mut self) {
        info!("Device woke up");
        self.suspended = false;
        if self.publisher.status().is_connected() {
            self.adapter_started(true);
            self.tester.test_immediately();
        }
    }

    /// Runs after the adapter came up, was updated, or the device woke
    fn adapter_started(&mut self, resumed: bool) {
        if !resumed || self.connected_since.is_none() {
            let since = Utc::now();
            self.connected_since = Some(since);
            self.publisher.set(ConnectionStatus::Connected { since });
        }

        match self.devices.key_store().is_current_key_expired() {
            Ok(true) => {
                info!("Key pair expired, rekeying before testing the connection");
                self.request_job(Job::Rekey);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check key expiration: {}", e),
        }

        self.start_tester();
    }

    fn start_tester(&mut self) {
        match self.adapter.interface() {
            Some(interface) => self.tester.start(interface),
            None => warn!("No tunnel interface, connection tester not started"),
        }
    }

    fn request_job(&mut self, job: Job) {
        if !self.publisher.status().is_connected() {
            debug!("Ignoring {} request while {}", job, self.publisher.status());
            return;
        }

        if let Some(ref in_flight) = self.in_flight {
            debug!("Queueing {} behind in-flight {} job", job, in_flight.job);
            self.queued = Some(job);
            return;
        }

        self.spawn_job(job);
    }

    fn spawn_job(&mut self, job: Job) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let selection = self.selection_for(job);

        if job == Job::Rekey {
            if let Err(e) = self.devices.key_store().reset_current_key_pair() {
                warn!("Could not reset key pair: {}", e);
            }
        }

        info!("Running {} job ({}, epoch {})", job, selection, epoch);

        let work = tokio::spawn(run_job(
            job,
            selection,
            self.devices.clone(),
            self.adapter.clone(),
            self.epoch.clone(),
            epoch,
        ));
        let abort = work.abort_handle();
        let results = self.jobs.clone();

        tokio::spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(SessionError::Cancelled),
                Err(e) => Err(SessionError::Unhandled(unhandled!(e))),
            };
            let _ = results.send(JobResult { epoch, job, result });
        });

        self.retry = None;
        self.in_flight = Some(InFlight { job, abort });
    }

    fn selection_for(&self, job: Job) -> ServerSelectionMethod {
        match job {
            Job::Fix => match self.current_server {
                Some(ref server) => ServerSelectionMethod::AvoidServer(server.name.clone()),
                None => ServerSelectionMethod::Automatic,
            },
            _ => self.selected_server.selection_method(),
        }
    }

    async fn handle_job_result(&mut self, JobResult { epoch, job, result }: JobResult) {
        if epoch != self.epoch.load(Ordering::SeqCst) {
            debug!("Discarding {} result from stale epoch {}", job, epoch);
            return;
        }
        self.in_flight = None;

        match job {
            Job::Start => self.finish_start(result).await,
            _ => self.finish_remediation(job, result),
        }

        if let Some(next) = self.queued.take() {
            self.request_job(next);
        }
    }

    fn finish_remediation(&mut self, job: Job, result: Result<ServerInfo, SessionError>) {
        match result {
            Ok(server) => {
                info!("{} job finished with server {}", job, server.name);
                self.select_server(server);

                if job == Job::Rekey {
                    self.publisher.publish(SessionEvent::RekeyCompleted);
                }

                // Wake restarts the observers
                if self.suspended {
                    debug!("{} job finished while asleep, not testing", job);
                } else if job == Job::Rekey {
                    self.start_tester();
                } else {
                    self.adapter_started(true);
                }
            }
            Err(e) => {
                let delay = self.retry_interval();
                warn!("{} job failed: {}, retrying in {:?}", job, e, delay);
                self.record_error(&e);
                self.retry = Some((Instant::now() + delay, job));
            }
        }
    }

    fn retry_due(&mut self) {
        if let Some((_, job)) = self.retry.take() {
            info!("Retrying {} job", job);
            self.request_job(job);
        }
    }

    fn retry_interval(&self) -> Duration {
        match self.key_validity {
            Some(validity) if validity < self.config.retry_interval => validity,
            _ => self.config.retry_interval,
        }
    }

    async fn handle_report(&mut self, report: TesterReport) {
        if self.tester.current_run() != Some(report.run) {
            debug!("Dropping tester report from finished run {}", report.run);
            return;
        }
        self.handle_tester_event(report.event).await;
    }

    async fn handle_tester_event(&mut self, event: TesterEvent) {
        if !self.publisher.status().is_connected() {
            return;
        }

        match event {
            TesterEvent::Connected => {
                self.set_connectivity_issues(false);
                self.resume_observation();
            }
            TesterEvent::Reconnected => {
                info!("Tunnel connectivity restored");
                self.set_connectivity_issues(false);
                self.cancel_pending_fix();
                if self.publisher.status() == ConnectionStatus::Reasserting {
                    let since = *self.connected_since.get_or_insert_with(Utc::now);
                    self.publisher.set(ConnectionStatus::Connected { since });
                }
                self.resume_observation();
            }
            TesterEvent::Disconnected { failure_count: 1 } => {
                warn!("Tunnel connectivity lost, moving to another server");
                self.set_connectivity_issues(true);
                self.bandwidth.reset();
                self.latency.stop();
                self.observing = false;
                self.publisher.set(ConnectionStatus::Reasserting);
                self.request_job(Job::Fix);
            }
            TesterEvent::Disconnected { failure_count } => {
                warn!("Tunnel still down after {} failed probes", failure_count);
                self.fail_session(SessionError::CouldNotFixConnection).await;
            }
        }
    }

    /// The tunnel healed on its own; a queued or retried fix would move it
    fn cancel_pending_fix(&mut self) {
        if self.queued == Some(Job::Fix) {
            debug!("Dropping queued fix job");
            self.queued = None;
        }
        if matches!(self.retry, Some((_, Job::Fix))) {
            debug!("Dropping fix retry");
            self.retry = None;
        }
    }

    fn resume_observation(&mut self) {
        self.observing = true;

        if let Some(ref server) = self.current_server {
            if let Some(ip) = server.ipv4() {
                self.latency.start(ip, server.name.clone());
            }
        }
    }

    async fn sample(&mut self) {
        match self.adapter.byte_counters().await {
            Some(counters) => self.bandwidth.record(counters),
            None => self.bandwidth.prevent_idle(),
        }

        if !self.bandwidth.is_connection_idle() {
            return;
        }

        match self.devices.key_store().is_current_key_expired() {
            Ok(true) => {
                info!("Connection idle with an expired key, rekeying");
                self.request_job(Job::Rekey);
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check key expiration: {}", e),
        }
    }

    async fn handle_host_message(&mut self, message: HostMessage) -> HostResponse {
        debug!("Host message {:?}", message);

        match message {
            HostMessage::ExpireRegistrationKey => {
                if self.publisher.status().is_connected() {
                    self.request_job(Job::Rekey);
                } else if let Err(e) = self.devices.key_store().reset_current_key_pair() {
                    warn!("Could not reset key pair: {}", e);
                }
                HostResponse::none()
            }
            HostMessage::GetLastErrorMessage => HostResponse::text(self.last_error.clone()),
            HostMessage::GetRuntimeConfiguration => {
                HostResponse::text(self.adapter.runtime_configuration().await)
            }
            HostMessage::IsHavingConnectivityIssues => HostResponse::flag(self.connectivity_issues),
            HostMessage::SetSelectedServer(name) => {
                self.set_selected_server(name.map_or(SelectedServer::Automatic, SelectedServer::Endpoint));
                HostResponse::none()
            }
            HostMessage::GetServerLocation => {
                HostResponse::text(self.current_server.as_ref().map(ServerInfo::location))
            }
            HostMessage::GetServerAddress => {
                HostResponse::text(self.current_server.as_ref().and_then(server_address))
            }
            HostMessage::SetKeyValidity(validity) => {
                self.set_key_validity(validity);
                HostResponse::none()
            }
            HostMessage::ResetAllState => {
                self.reset_all_state().await;
                HostResponse::none()
            }
        }
    }

    fn set_selected_server(&mut self, selection: SelectedServer) {
        if self.selected_server == selection {
            return;
        }

        info!("Selected server changed to {}", selection.name().unwrap_or("automatic"));
        self.selected_server = selection;

        let current = self.current_server.as_ref().map(|server| server.name.as_str());
        if self.selected_server.name().is_some() && self.selected_server.name() == current {
            return;
        }

        self.request_job(Job::Reconfigure);
    }

    fn set_key_validity(&mut self, validity: Option<Duration>) {
        let validity = validity.filter(|validity| !validity.is_zero());
        self.key_validity = validity;
        self.devices.key_store().set_validity_interval(validity);
    }

    async fn reset_all_state(&mut self) {
        info!("Resetting all session state");

        if let Err(e) = self.devices.key_store().reset_current_key_pair() {
            warn!("Could not reset key pair: {}", e);
        }
        if let Err(e) = self.devices.server_cache().remove_server_list() {
            warn!("Could not remove cached server list: {}", e);
        }

        self.selected_server = SelectedServer::Automatic;
        self.current_server = None;
        self.stop(StopReason::StateReset).await;
    }

    fn select_server(&mut self, server: ServerInfo) {
        self.publisher.publish(SessionEvent::ServerSelected(ServerStatusInfo {
            name: server.name.clone(),
            location: server.location(),
            address: server_address(&server),
        }));
        self.current_server = Some(server);
    }

    fn set_connectivity_issues(&mut self, issues: bool) {
        if self.connectivity_issues != issues {
            self.connectivity_issues = issues;
            self.publisher.publish(SessionEvent::ConnectivityIssues(issues));
        }
    }

    fn record_error(&mut self, error: &SessionError) {
        self.last_error = Some(error.to_string());
        self.publisher.publish(SessionEvent::Error(ErrorEvent {
            code: error.code(),
            message: error.to_string(),
        }));
    }
}

fn server_address(server: &ServerInfo) -> Option<String> {
    server
        .ipv4()
        .map(|ip| ip.to_string())
        .or_else(|| server.hostnames.first().cloned())
}

async fn run_job(
    job: Job,
    selection: ServerSelectionMethod,
    devices: Arc<DeviceManager>,
    adapter: Arc<dyn TunnelAdapter>,
    current_epoch: Arc<AtomicU64>,
    epoch: u64,
) -> Result<ServerInfo, SessionError> {
    let (configuration, server) = devices
        .generate_tunnel_configuration(&selection)
        .await
        .map_err(SessionError::CouldNotGenerateTunnelConfiguration)?;

    // The session may have been stopped while the backend was answering
    if current_epoch.load(Ordering::SeqCst) != epoch {
        return Err(SessionError::Cancelled);
    }

    match job {
        Job::Start => adapter.start(&configuration).await?,
        Job::Rekey => adapter.update(&configuration, false).await?,
        Job::Fix | Job::Reconfigure => adapter.update(&configuration, true).await?,
    }

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::ByteCounters;
    use crate::directory::ClientError;
    use crate::error::ErrorEvents;
    use crate::key_store::KeyStore;
    use crate::secret_store::{AuthToken, MemorySecretStore, TokenStore};
    use crate::server_cache::ServerListCache;
    use crate::test_support::{
        server_record, FixedLatencyProbe, MockAdapter, MockDirectory, RecordingPlatform, ScriptedProbe,
    };

    struct Fixture {
        handle: SessionHandle,
        directory: Arc<MockDirectory>,
        adapter: Arc<MockAdapter>,
        platform: Arc<RecordingPlatform>,
        probe: Arc<ScriptedProbe>,
        keys: Arc<KeyStore>,
        cache: Arc<ServerListCache>,
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            test_interval: Duration::from_secs(3600),
            latency_interval: Duration::from_secs(3600),
            sampling_interval: Duration::from_secs(3600),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    fn fixture(config: SessionConfig) -> Fixture {
        let secrets = Arc::new(MemorySecretStore::new());
        let tokens = TokenStore::new(secrets.clone());
        tokens.store_token(&AuthToken::new("token")).unwrap();

        let directory = Arc::new(MockDirectory::new());
        directory.set_register(Ok(vec![server_record("a"), server_record("b")]));

        let keys = Arc::new(KeyStore::new(secrets));
        let cache = Arc::new(ServerListCache::in_memory());
        let devices = Arc::new(DeviceManager::new(
            directory.clone(),
            tokens,
            keys.clone(),
            cache.clone(),
            ErrorEvents::disabled(),
        ));

        let adapter = Arc::new(MockAdapter::new());
        let platform = Arc::new(RecordingPlatform::default());
        let probe = Arc::new(ScriptedProbe::new(Vec::new()));

        let handle = TunnelSessionController::spawn(SessionParts {
            devices,
            adapter: adapter.clone(),
            probe: probe.clone(),
            latency_probe: Arc::new(FixedLatencyProbe),
            platform: platform.clone(),
            config,
        });

        Fixture { handle, directory, adapter, platform, probe, keys, cache }
    }

    /// Let spawned jobs finish and the actor drain its inbox
    async fn settle(handle: &SessionHandle) -> StatusChange {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.status().await.unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn app_start() -> StartOptions {
        StartOptions::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_with_registered_key() {
        let f = fixture(quiet_config());

        f.handle.start(app_start()).await.unwrap();
        let status = settle(&f.handle).await;

        assert!(matches!(status.status, ConnectionStatus::Connected { .. }));

        let starts = f.adapter.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].name.as_deref(), Some("a"));
        assert_eq!(
            &starts[0].interface.private_key,
            f.keys.current_key_pair().unwrap().private_key()
        );
        assert_eq!(f.platform.enabled(), 1);
        assert_eq!(f.platform.disabled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();

        let result = f.handle.start(app_start()).await;

        assert!(matches!(result, Err(SessionError::AlreadyStarted(ConnectionStatus::Connected { .. }))));
        assert_eq!(f.adapter.starts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_start_failure_disables_on_demand() {
        let f = fixture(quiet_config());
        f.directory.set_register(Err(ClientError::FailedToFetchRegisteredServers("offline".into())));

        let options = StartOptions {
            activation: Activation::OnDemand,
            ..StartOptions::default()
        };
        let result = f.handle.start(options).await;

        assert!(matches!(
            result,
            Err(SessionError::CouldNotGenerateTunnelConfiguration(VpnError::NoServerListFound))
        ));
        assert_eq!(settle(&f.handle).await.status, ConnectionStatus::Disconnected);
        assert_eq!(f.platform.disabled(), 1);
        assert_eq!(f.platform.enabled(), 0);

        let message = f.handle.handle_host_message(HostMessage::GetLastErrorMessage).await.unwrap();
        assert!(message.as_text().unwrap().contains("No usable server list found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_failure() {
        let f = fixture(quiet_config());

        let options = StartOptions {
            simulate_failure: true,
            ..StartOptions::default()
        };

        assert!(matches!(f.handle.start(options).await, Err(SessionError::SimulatedFailure)));
        assert!(f.adapter.starts().is_empty());
        assert_eq!(f.directory.register_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_rotated_before_first_probe() {
        let f = fixture(quiet_config());
        f.keys.current_key_pair().unwrap();
        let expired = f.keys.update_current_key_pair(Utc::now() - chrono::Duration::hours(1)).unwrap();

        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;

        let started = &f.adapter.starts()[0];
        let current = f.keys.current_key_pair().unwrap();

        assert_ne!(&started.interface.private_key, expired.private_key());
        assert_eq!(&started.interface.private_key, current.private_key());
        assert!(current.expiration() > Utc::now());
        assert_eq!(f.probe.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_reconnect_keeps_session() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        let connected = settle(&f.handle).await.status;

        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        assert_eq!(settle(&f.handle).await.status, ConnectionStatus::Reasserting);

        let updates = f.adapter.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.name.as_deref(), Some("b"));
        assert!(updates[0].1);
        assert_eq!(f.directory.last_preferred_server(), None);

        let issues = f.handle.handle_host_message(HostMessage::IsHavingConnectivityIssues).await.unwrap();
        assert_eq!(issues, HostResponse::flag(true));

        f.handle.inject_tester_event(TesterEvent::Reconnected).await;
        let status = settle(&f.handle).await;

        assert_eq!(status.status, connected);
        assert_eq!(f.adapter.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_failure_stops_exactly_once() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;
        let mut events = f.handle.subscribe();

        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        settle(&f.handle).await;
        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 2 }).await;
        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 3 }).await;
        let status = settle(&f.handle).await;

        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert_eq!(f.adapter.stops(), 1);

        let errors: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Error(error) => Some(error.code),
                _ => None,
            })
            .collect();
        assert_eq!(errors, ["couldNotFixConnection"]);

        let message = f.handle.handle_host_message(HostMessage::GetLastErrorMessage).await.unwrap();
        assert_eq!(message.as_text(), Some("Could not fix the connection"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_start() {
        let f = fixture(quiet_config());
        f.directory.set_register_delay(Duration::from_secs(10));

        let handle = f.handle.clone();
        let start = tokio::spawn(async move { handle.start(app_start()).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(f.handle.status().await.unwrap().status, ConnectionStatus::Connecting);
        f.handle.stop(StopReason::UserInitiated).await.unwrap();

        assert!(matches!(start.await.unwrap(), Err(SessionError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(f.adapter.starts().is_empty());
        assert_eq!(settle(&f.handle).await.status, ConnectionStatus::Disconnected);
        assert_eq!(f.platform.disabled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_key_message_rekeys_silently() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        let connected = settle(&f.handle).await;
        let original = f.keys.current_key_pair().unwrap();
        let mut events = f.handle.subscribe();

        f.handle.handle_host_message(HostMessage::ExpireRegistrationKey).await.unwrap();
        let status = settle(&f.handle).await;

        let updates = f.adapter.updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].1);
        assert_ne!(&updates[0].0.interface.private_key, original.private_key());
        assert_eq!(status.status, connected.status);
        assert!(drain(&mut events).contains(&SessionEvent::RekeyCompleted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_with_expired_key_rekeys() {
        let config = SessionConfig {
            sampling_interval: Duration::from_secs(30),
            ..quiet_config()
        };
        let f = fixture(config);
        f.adapter.set_counters(Some(ByteCounters::new(1000, 1000)));

        f.handle.start(app_start()).await.unwrap();
        f.handle.inject_tester_event(TesterEvent::Connected).await;
        settle(&f.handle).await;

        f.keys.update_current_key_pair(Utc::now() - chrono::Duration::minutes(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        settle(&f.handle).await;

        let updates = f.adapter.updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_connection_does_not_rekey() {
        let config = SessionConfig {
            sampling_interval: Duration::from_secs(30),
            ..quiet_config()
        };
        let f = fixture(config);

        f.handle.start(app_start()).await.unwrap();
        f.handle.inject_tester_event(TesterEvent::Connected).await;
        settle(&f.handle).await;

        // No counters means the adapter cannot prove the tunnel idle
        f.keys.update_current_key_pair(Utc::now() - chrono::Duration::minutes(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        settle(&f.handle).await;

        assert!(f.adapter.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selected_server_change_reconfigures() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;

        let select_b = HostMessage::SetSelectedServer(Some("b".to_string()));
        f.handle.handle_host_message(select_b.clone()).await.unwrap();
        settle(&f.handle).await;

        assert_eq!(f.directory.last_preferred_server(), Some("b".to_string()));
        assert_eq!(f.adapter.updates().len(), 1);
        assert!(f.adapter.updates()[0].1);

        f.handle.handle_host_message(select_b).await.unwrap();
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fix_is_retried() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;
        f.adapter.fail_updates(Some(AdapterError::UpdateFailed("busy".into())));

        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 1);

        f.adapter.fail_updates(None);
        tokio::time::sleep(DEFAULT_RETRY_INTERVAL + Duration::from_secs(1)).await;
        settle(&f.handle).await;

        assert_eq!(f.adapter.updates().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_with_expired_key_rekeys() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;

        f.handle.sleep().await.unwrap();
        f.keys.update_current_key_pair(Utc::now() - chrono::Duration::minutes(1)).unwrap();
        f.handle.wake().await.unwrap();
        settle(&f.handle).await;

        assert_eq!(f.adapter.updates().len(), 1);
        assert!(!f.adapter.updates()[0].1);
    }

    fn probing_config() -> SessionConfig {
        SessionConfig {
            test_interval: Duration::from_secs(10),
            ..quiet_config()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_pauses_probing_until_wake() {
        let f = fixture(probing_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle(&f.handle).await;
        assert!(f.probe.calls() >= 2);

        f.handle.sleep().await.unwrap();
        settle(&f.handle).await;
        let asleep = f.probe.calls();

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle(&f.handle).await;
        assert_eq!(f.probe.calls(), asleep);

        // Wake tests right away instead of waiting a full interval
        f.handle.wake().await.unwrap();
        settle(&f.handle).await;
        assert_eq!(f.probe.calls(), asleep + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rekey_finishing_asleep_does_not_probe() {
        let f = fixture(probing_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;

        f.handle.sleep().await.unwrap();
        settle(&f.handle).await;
        let asleep = f.probe.calls();

        f.handle.handle_host_message(HostMessage::ExpireRegistrationKey).await.unwrap();
        settle(&f.handle).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle(&f.handle).await;

        assert_eq!(f.adapter.updates().len(), 1);
        assert_eq!(f.probe.calls(), asleep);

        f.handle.wake().await.unwrap();
        settle(&f.handle).await;
        assert_eq!(f.probe.calls(), asleep + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fix_retry_waits_for_wake() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;
        f.adapter.fail_updates(Some(AdapterError::UpdateFailed("busy".into())));

        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 1);

        f.adapter.fail_updates(None);
        f.handle.sleep().await.unwrap();
        tokio::time::sleep(DEFAULT_RETRY_INTERVAL * 2).await;
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 1);

        f.handle.wake().await.unwrap();
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 2);
        assert!(f.adapter.updates()[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_fix_retry() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;
        f.adapter.fail_updates(Some(AdapterError::UpdateFailed("busy".into())));

        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        settle(&f.handle).await;
        assert_eq!(f.adapter.updates().len(), 1);

        f.adapter.fail_updates(None);
        f.handle.inject_tester_event(TesterEvent::Reconnected).await;
        let status = settle(&f.handle).await;
        assert!(matches!(status.status, ConnectionStatus::Connected { .. }));

        tokio::time::sleep(DEFAULT_RETRY_INTERVAL + Duration::from_secs(1)).await;
        settle(&f.handle).await;

        assert_eq!(f.adapter.updates().len(), 1);
        let location = f.handle.handle_host_message(HostMessage::GetServerAddress).await.unwrap();
        assert_eq!(
            location.as_text().map(str::to_string),
            server_record("a").ipv4().map(|ip| ip.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_queued_fix() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        settle(&f.handle).await;
        f.directory.set_register_delay(Duration::from_secs(10));

        f.handle.handle_host_message(HostMessage::ExpireRegistrationKey).await.unwrap();
        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        f.handle.inject_tester_event(TesterEvent::Reconnected).await;
        settle(&f.handle).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle(&f.handle).await;

        // Only the rekey reached the adapter
        let updates = f.adapter.updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_queries() {
        let f = fixture(quiet_config());

        let location = f.handle.handle_host_message(HostMessage::GetServerLocation).await.unwrap();
        assert_eq!(location, HostResponse::none());

        f.handle.start(app_start()).await.unwrap();

        let location = f.handle.handle_host_message(HostMessage::GetServerLocation).await.unwrap();
        assert_eq!(location.as_text(), Some("Lafayette, US"));

        let address = f.handle.handle_host_message(HostMessage::GetServerAddress).await.unwrap();
        assert_eq!(address.as_text().map(str::to_string), server_record("a").ipv4().map(|ip| ip.to_string()));

        let config = f.handle.handle_host_message(HostMessage::GetRuntimeConfiguration).await.unwrap();
        assert!(config.as_text().unwrap().contains("[Peer]"));

        let issues = f.handle.handle_host_message(HostMessage::IsHavingConnectivityIssues).await.unwrap();
        assert_eq!(issues, HostResponse::flag(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_state() {
        let f = fixture(quiet_config());
        f.handle.start(app_start()).await.unwrap();
        assert!(!f.cache.stored_server_list().unwrap().is_empty());

        f.handle.handle_host_message(HostMessage::ResetAllState).await.unwrap();
        let status = settle(&f.handle).await;

        assert_eq!(status.status, ConnectionStatus::Disconnected);
        assert!(f.keys.stored_key_pair().unwrap().is_none());
        assert!(f.cache.stored_server_list().unwrap().is_empty());
        assert_eq!(f.platform.disabled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_validity_bounds_retry_interval() {
        let f = fixture(quiet_config());

        let options = StartOptions {
            key_validity: Some(Duration::from_secs(20)),
            ..StartOptions::default()
        };
        f.handle.start(options).await.unwrap();
        settle(&f.handle).await;
        assert_eq!(f.keys.validity_interval(), Duration::from_secs(20));

        f.adapter.fail_updates(Some(AdapterError::UpdateFailed("busy".into())));
        f.handle.inject_tester_event(TesterEvent::Disconnected { failure_count: 1 }).await;
        settle(&f.handle).await;

        f.adapter.fail_updates(None);
        tokio::time::sleep(Duration::from_secs(21)).await;
        settle(&f.handle).await;

        assert_eq!(f.adapter.updates().len(), 2);
    }
}
