//! Connection orchestrator.
//!
//! [`OpenVpnConnection`] drives one VPN connection at a time: it asks a
//! [`ProcessLauncher`] for an OpenVPN process, attaches a [`ManagementClient`]
//! to it, performs the hold-release handshake, enforces the connect timeout
//! and republishes everything as [`ConnectionEvent`]s.
//!
//! Each connect attempt ends with exactly one `Disconnected` event (optionally
//! preceded by `ConnectError`), whichever way it fails or finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::config::OvpnctlConfig;
use crate::error::{OvpnError, OvpnResult};
use super::bandwidth::BandwidthUsage;
use super::credentials::CredentialProvider;
use super::launcher::{LaunchMode, LaunchParams, ProcessLauncher};
use super::management::{ManagementClient, ManagementSettings};
use super::protocol::{LogArgs, LogFlags, OvpnState, PasswordKind, ProtocolEvent, StateArgs};

const TAP_DRIVER_MISSING: &str = "there are no tap-windows nor wintun adapters on this system";
const PING_EXIT_TIMEOUT: &str = "inactivity timeout (--ping-exit)";
const DECRYPT_FAILURE: &str = "authenticate/decrypt packet error: cipher final failed";
const CONNECT_TIMEOUT_MESSAGE: &str = "The connection attempt timed out.";
const LAUNCH_FAILED_MESSAGE: &str = "The OpenVPN client could not be started.";

/// Pause between attempts to reach a freshly spawned management port
const MANAGEMENT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timing used by the orchestrator and the management clients it creates
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub management_host: String,
    /// Manual connect timeout, counted from hold release
    pub connect_timeout: Duration,
    /// How long to keep retrying the management port after launch
    pub management_connect: Duration,
    pub bytecount_interval: u32,
    pub credential_settle: Duration,
    pub shutdown_wait: Duration,
    pub shutdown_poll: Duration,
    pub min_bandwidth_sample: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OvpnctlConfig::default())
    }
}

impl From<&OvpnctlConfig> for OrchestratorSettings {
    fn from(config: &OvpnctlConfig) -> Self {
        Self {
            management_host: config.openvpn.management_host.clone(),
            connect_timeout: config.timeouts.connect(),
            management_connect: config.timeouts.management_connect(),
            bytecount_interval: config.timeouts.bytecount_interval_secs,
            credential_settle: config.timeouts.credential_settle(),
            shutdown_wait: config.timeouts.shutdown_wait(),
            shutdown_poll: config.timeouts.shutdown_poll(),
            min_bandwidth_sample: config.bandwidth.min_sample(),
        }
    }
}

/// High-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHoldRelease,
    Connected,
    Exiting,
}

/// Lifecycle notifications published to callers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting { host: String, context: Value },
    Connected { host: String, context: Value },
    Disconnecting { context: Value },
    Disconnected { host: String, error: Option<Arc<OvpnError>>, context: Value },
    ConnectError { host: String, error: Arc<OvpnError>, context: Value },
    BandwidthUsageUpdated(BandwidthUsage),
    /// No TAP/WinTun adapter is installed; raised instead of a generic error
    TapDriverInstallationRequired { host: String, context: Value },
}

/// Arguments to [`OpenVpnConnection::connect`]
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub mode: LaunchMode,
    pub protocol: String,
    pub port: u16,
    /// Opaque caller data echoed back in every event of this attempt
    pub context: Value,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, mode: LaunchMode) -> Self {
        Self {
            host: host.into(),
            mode,
            protocol: "udp".to_string(),
            port: 1194,
            context: Value::Null,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// How an attempt ends
enum Termination {
    Clean,
    Failed(OvpnError),
    DriverMissing,
}

/// Per-attempt signals
struct Attempt {
    id: u64,
    host: String,
    context: Value,
    /// Wakes the hold-release timeout wait
    connect_signal: Notify,
    /// Wakes the caller blocked in `connect`
    dial_done: Notify,
    abort_timeout: AtomicBool,
    terminal_raised: AtomicBool,
    hold_release_started: AtomicBool,
    /// Set once the session is gone and the terminal events are out
    torn_down: watch::Sender<bool>,
}

impl Attempt {
    fn new(id: u64, host: String, context: Value) -> Self {
        Self {
            id,
            host,
            context,
            connect_signal: Notify::new(),
            dial_done: Notify::new(),
            abort_timeout: AtomicBool::new(false),
            terminal_raised: AtomicBool::new(false),
            hold_release_started: AtomicBool::new(false),
            torn_down: watch::channel(false).0,
        }
    }

    async fn wait_torn_down(&self) {
        let mut done = self.torn_down.subscribe();
        let _ = done.wait_for(|torn_down| *torn_down).await;
    }

    fn is_terminal(&self) -> bool {
        self.terminal_raised.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        self.connect_signal.notify_one();
        self.dial_done.notify_one();
    }
}

struct ConnectionData {
    host: Option<String>,
    context: Value,
    state: ConnectionState,
    last_ovpn_state: Option<OvpnState>,
    connected_since: Option<DateTime<Utc>>,
    last_interface: Option<String>,
    last_error: Option<Arc<OvpnError>>,
    suppress_errors: bool,
    attempt: Option<Arc<Attempt>>,
    client: Option<Arc<ManagementClient>>,
}

impl Default for ConnectionData {
    fn default() -> Self {
        Self {
            host: None,
            context: Value::Null,
            state: ConnectionState::Disconnected,
            last_ovpn_state: None,
            connected_since: None,
            last_interface: None,
            last_error: None,
            suppress_errors: false,
            attempt: None,
            client: None,
        }
    }
}

struct Inner {
    settings: OrchestratorSettings,
    launcher: Arc<dyn ProcessLauncher>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    events: broadcast::Sender<ConnectionEvent>,
    data: Mutex<ConnectionData>,
    usage: Mutex<BandwidthUsage>,
    connect_lock: tokio::sync::Mutex<()>,
    next_attempt: AtomicU64,
}

/// Drives OpenVPN connections and publishes their lifecycle
#[derive(Clone)]
pub struct OpenVpnConnection {
    inner: Arc<Inner>,
}

impl OpenVpnConnection {
    pub fn new(
        settings: OrchestratorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        let usage = BandwidthUsage::new(settings.min_bandwidth_sample);

        Self {
            inner: Arc::new(Inner {
                settings,
                launcher,
                credentials,
                events,
                data: Mutex::new(ConnectionData::default()),
                usage: Mutex::new(usage),
                connect_lock: tokio::sync::Mutex::new(()),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Lifecycle and bandwidth events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Start a connection and wait until it is up, has failed or timed out.
    ///
    /// Only a missing config or certificate file is reported as an error
    /// here; everything else is delivered as events. Any previous session is
    /// torn down first.
    pub async fn connect(&self, params: ConnectParams) -> OvpnResult<()> {
        params.mode.validate()?;

        let attempt = {
            let _guard = self.inner.connect_lock.lock().await;
            match self.inner.begin_attempt(params).await {
                Some(attempt) => attempt,
                None => return Ok(()),
            }
        };

        attempt.dial_done.notified().await;
        debug!("Connect attempt {} resolved in state {:?}", attempt.id, self.state());
        Ok(())
    }

    /// Tear down the current session. Events are only published when a
    /// connection was up or being established.
    pub async fn disconnect(&self) {
        let active = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::AwaitingHoldRelease
        );
        self.inner.shutdown(active, false).await;
    }

    /// Tear down the current session and always publish
    /// `Disconnecting` / `Disconnected`.
    pub async fn abort(&self) {
        self.inner.shutdown(true, true).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.data().state
    }

    /// Last raw state reported by OpenVPN
    pub fn openvpn_state(&self) -> Option<OvpnState> {
        self.inner.data().last_ovpn_state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state(), ConnectionState::Connecting | ConnectionState::AwaitingHoldRelease)
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.inner.data().connected_since
    }

    pub fn connected_duration(&self) -> Option<chrono::Duration> {
        self.connected_since().map(|since| Utc::now() - since)
    }

    pub fn current_server(&self) -> Option<String> {
        self.inner.data().host.clone()
    }

    /// Tunnel device reported by the most recent session
    pub fn last_interface(&self) -> Option<String> {
        self.inner.data().last_interface.clone()
    }

    pub fn last_error(&self) -> Option<Arc<OvpnError>> {
        self.inner.data().last_error.clone()
    }

    /// Snapshot of the bandwidth counters
    pub fn usage(&self) -> BandwidthUsage {
        self.inner.usage().clone()
    }

    /// Stop publishing `ConnectError`; errors are still recorded
    pub fn set_suppress_errors(&self, suppress: bool) {
        self.inner.data().suppress_errors = suppress;
    }

    /// Publish the stored error, if any, and stop suppressing errors
    pub fn raise_last_error(&self) {
        let (error, host, context) = {
            let mut data = self.inner.data();
            data.suppress_errors = false;
            (data.last_error.clone(), data.host.clone().unwrap_or_default(), data.context.clone())
        };
        if let Some(error) = error {
            self.inner.publish(ConnectionEvent::ConnectError { host, error, context });
        }
    }

    pub fn status_json(&self) -> Value {
        let data = self.inner.data();
        let usage = self.inner.usage().clone();
        json!({
            "state": data.state,
            "openvpn_state": data.last_ovpn_state.map(|s| s.as_str()),
            "server": data.host,
            "connected_since": data.connected_since.map(|t| t.to_rfc3339()),
            "interface": data.last_interface,
            "last_error": data.last_error.as_ref().map(|e| e.to_string()),
            "usage": usage,
        })
    }
}

impl Inner {
    fn data(&self) -> MutexGuard<'_, ConnectionData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn usage(&self) -> MutexGuard<'_, BandwidthUsage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ConnectionEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.events.send(event);
    }

    fn is_current(&self, attempt_id: u64) -> bool {
        self.data().attempt.as_ref().map(|a| a.id) == Some(attempt_id)
    }

    fn set_state(&self, state: ConnectionState) {
        self.data().state = state;
    }

    /// Everything up to the point where the caller starts waiting.
    /// Returns `None` when the attempt already ended.
    async fn begin_attempt(self: &Arc<Self>, params: ConnectParams) -> Option<Arc<Attempt>> {
        let previous = self.data().attempt.clone();
        match previous {
            Some(previous) => {
                info!("Closing previous connection to {}", previous.host);
                let active = !previous.is_terminal()
                    && matches!(
                        self.data().state,
                        ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::AwaitingHoldRelease
                    );
                if active {
                    self.set_state(ConnectionState::Exiting);
                    self.publish(ConnectionEvent::Disconnecting {
                        context: previous.context.clone(),
                    });
                }
                self.end_attempt(&previous, Termination::Clean, true).await;
            }
            None => self.kill_session(None).await,
        }

        let id = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let attempt = Arc::new(Attempt::new(id, params.host.clone(), params.context.clone()));
        {
            let mut data = self.data();
            data.host = Some(params.host.clone());
            data.context = params.context.clone();
            data.state = ConnectionState::Connecting;
            data.last_ovpn_state = None;
            data.connected_since = None;
            data.last_error = None;
            data.attempt = Some(attempt.clone());
        }
        self.usage().reset();

        info!("Connecting to {} over {}:{}", params.host, params.protocol, params.port);
        self.publish(ConnectionEvent::Connecting {
            host: params.host.clone(),
            context: params.context.clone(),
        });

        let launch = LaunchParams {
            host: params.host,
            mode: params.mode,
            protocol: params.protocol,
            port: params.port,
        };
        let outcome = match self.launcher.launch(&launch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to start OpenVPN: {}", e);
                self.end_attempt(&attempt, Termination::Failed(OvpnError::ServiceError(LAUNCH_FAILED_MESSAGE.to_string())), true)
                    .await;
                return None;
            }
        };

        if outcome.management_port == 0 {
            let err = OvpnError::InvalidPort(i64::from(outcome.management_port));
            error!("{}", err);
            self.end_attempt(&attempt, Termination::Failed(err), true).await;
            return None;
        }

        let settings = ManagementSettings {
            host: self.settings.management_host.clone(),
            port: outcome.management_port,
            password: outcome.management_password,
            connect_timeout: self.settings.management_connect,
            credential_settle: self.settings.credential_settle,
            shutdown_wait: self.settings.shutdown_wait,
            shutdown_poll: self.settings.shutdown_poll,
        };
        let (client, events) = ManagementClient::new(settings, self.credentials.clone());
        let client = Arc::new(client);

        let installed = {
            let mut data = self.data();
            let current = data.attempt.as_ref().map(|a| a.id) == Some(id);
            if current && !attempt.is_terminal() {
                data.client = Some(client.clone());
            }
            current && !attempt.is_terminal()
        };
        if !installed {
            debug!("Attempt {} ended during launch", id);
            if let Err(e) = self.launcher.kill_all().await {
                warn!("Failed to stop OpenVPN: {}", e);
            }
            return None;
        }

        tokio::spawn(Self::dispatch(self.clone(), attempt.clone(), events));

        if let Err(e) = self.connect_management(&attempt, &client).await {
            error!("Could not reach the OpenVPN management interface: {}", e);
            self.end_attempt(&attempt, Termination::Failed(e), true).await;
            return None;
        }

        if client.is_waiting_for_hold_release() {
            self.start_hold_release(&attempt);
        }
        self.spawn_hold_watchdog(&attempt);

        Some(attempt)
    }

    async fn connect_management(&self, attempt: &Attempt, client: &ManagementClient) -> OvpnResult<()> {
        let deadline = Instant::now() + self.settings.management_connect;
        loop {
            match client.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() < deadline && !attempt.is_terminal() => {
                    trace!("Management port {} not ready yet: {}", client.port(), e);
                    tokio::time::sleep(MANAGEMENT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume one session's protocol events in order
    async fn dispatch(self: Arc<Self>, attempt: Arc<Attempt>, mut events: mpsc::UnboundedReceiver<ProtocolEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(attempt.id) {
                debug!("Dropping {:?} from stale attempt {}", event, attempt.id);
                break;
            }
            self.handle_event(&attempt, event).await;
        }
        trace!("Event dispatch for attempt {} finished", attempt.id);
    }

    async fn handle_event(self: &Arc<Self>, attempt: &Arc<Attempt>, event: ProtocolEvent) {
        match event {
            ProtocolEvent::HoldRequested => {
                debug!("OpenVPN is waiting for hold release");
                self.set_state(ConnectionState::AwaitingHoldRelease);
                self.start_hold_release(attempt);
            }
            ProtocolEvent::HoldReleaseSucceeded => {
                debug!("Hold released");
                self.set_state(ConnectionState::Connecting);
            }
            ProtocolEvent::StateChanged(args) => self.on_state_changed(attempt, args).await,
            ProtocolEvent::Log(args) => self.on_log(attempt, args).await,
            ProtocolEvent::Info(message) => info!("OpenVPN: {}", message),
            ProtocolEvent::ByteCount(counts) => {
                let snapshot = {
                    let mut usage = self.usage();
                    usage.update(counts.bytes_out, counts.bytes_in);
                    usage.clone()
                };
                self.publish(ConnectionEvent::BandwidthUsageUpdated(snapshot));
            }
            ProtocolEvent::Echo(args) => debug!("OpenVPN echo: {}", args.command),
            ProtocolEvent::PasswordRequest(request) => match request.kind {
                PasswordKind::VerificationFailed => {
                    warn!("OpenVPN rejected the credentials");
                    self.end_attempt(attempt, Termination::Failed(OvpnError::Authentication(request.payload)), true)
                        .await;
                }
                _ => debug!("OpenVPN requested {:?}", request.kind),
            },
            ProtocolEvent::Fatal(message) => {
                if message.to_ascii_lowercase().contains(TAP_DRIVER_MISSING) {
                    warn!("No TAP/WinTun adapter available");
                    self.end_attempt(attempt, Termination::DriverMissing, true).await;
                } else {
                    error!("OpenVPN fatal error: {}", message);
                    let err = OvpnError::Fatal(format!("OpenVPN Interface Error: {}", message));
                    self.end_attempt(attempt, Termination::Failed(err), true).await;
                }
            }
            ProtocolEvent::Success(message) => trace!("OpenVPN: SUCCESS: {}", message),
            ProtocolEvent::ConnectedWithErrors => {
                self.end_attempt(attempt, Termination::Failed(OvpnError::ConnectedWithErrors), true).await;
            }
            ProtocolEvent::Disconnected => {
                info!("Management session closed");
                self.end_attempt(attempt, Termination::Clean, true).await;
            }
        }
    }

    async fn on_state_changed(self: &Arc<Self>, attempt: &Arc<Attempt>, args: StateArgs) {
        debug!("OpenVPN state: {}", args.state);
        self.data().last_ovpn_state = Some(args.state);

        match args.state {
            OvpnState::Connecting | OvpnState::Resolve => {
                self.publish(ConnectionEvent::Connecting {
                    host: attempt.host.clone(),
                    context: attempt.context.clone(),
                });
            }
            OvpnState::Connected => {
                {
                    let mut data = self.data();
                    data.state = ConnectionState::Connected;
                    data.connected_since = Some(Utc::now());
                }
                attempt.abort_timeout.store(true, Ordering::SeqCst);
                attempt.wake();
                info!(
                    "Connected to {} (local {}, remote {})",
                    attempt.host,
                    args.local_ip.as_deref().unwrap_or("-"),
                    args.remote_ip.as_deref().unwrap_or("-")
                );
                self.publish(ConnectionEvent::Connected {
                    host: attempt.host.clone(),
                    context: attempt.context.clone(),
                });
            }
            OvpnState::Exiting => {
                self.set_state(ConnectionState::Exiting);
                self.end_attempt(attempt, Termination::Clean, true).await;
            }
            OvpnState::Reconnecting => info!("OpenVPN is reconnecting; the session will be closed"),
            _ => {}
        }
    }

    async fn on_log(self: &Arc<Self>, attempt: &Arc<Attempt>, args: LogArgs) {
        let message = args.message.as_str();
        if args.flags.contains(LogFlags::FATAL_ERROR) {
            error!("openvpn: {}", message);
        } else if args.flags.contains(LogFlags::NON_FATAL_ERROR) || args.flags.contains(LogFlags::WARNING) {
            warn!("openvpn: {}", message);
        } else if args.flags.contains(LogFlags::INFORMATIONAL) {
            info!("openvpn: {}", message);
        } else {
            debug!("openvpn: {}", message);
        }

        if let Some(interface) = parse_interface_name(message) {
            debug!("Tunnel interface is {}", interface);
            self.data().last_interface = Some(interface);
        }

        let lower = message.to_ascii_lowercase();
        if lower.contains(PING_EXIT_TIMEOUT) {
            let err = OvpnError::Timeout("The VPN server stopped responding (inactivity timeout).".to_string());
            self.end_attempt(attempt, Termination::Failed(err), true).await;
        } else if lower.contains(DECRYPT_FAILURE) {
            let err = OvpnError::Fatal("OpenVPN Interface Error: packet decryption failed".to_string());
            self.end_attempt(attempt, Termination::Failed(err), true).await;
        }
    }

    /// Configure notifications, release the hold and arm the connect timeout.
    /// Runs at most once per attempt.
    fn start_hold_release(self: &Arc<Self>, attempt: &Arc<Attempt>) {
        if attempt.hold_release_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = {
            let data = self.data();
            let current = data.attempt.as_ref().map(|a| a.id) == Some(attempt.id);
            match data.client.clone() {
                Some(client) if current => client,
                _ => return,
            }
        };

        let inner = self.clone();
        let attempt = attempt.clone();
        tokio::spawn(async move {
            client.set_state(true);
            client.set_byte_count(inner.settings.bytecount_interval);
            client.set_log(true);
            client.release_hold();
            inner.set_state(ConnectionState::Connecting);

            let signalled = tokio::time::timeout(inner.settings.connect_timeout, attempt.connect_signal.notified())
                .await
                .is_ok();

            if !signalled && !attempt.abort_timeout.load(Ordering::SeqCst) && inner.data().state != ConnectionState::Connected {
                warn!("No connection to {} within {:?}", attempt.host, inner.settings.connect_timeout);
                inner
                    .end_attempt(&attempt, Termination::Failed(OvpnError::Timeout(CONNECT_TIMEOUT_MESSAGE.to_string())), true)
                    .await;
            }
        });
    }

    /// Fail the attempt when OpenVPN never asks for a hold release
    fn spawn_hold_watchdog(self: &Arc<Self>, attempt: &Arc<Attempt>) {
        let inner = self.clone();
        let attempt = attempt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.settings.connect_timeout).await;
            if !attempt.hold_release_started.load(Ordering::SeqCst)
                && !attempt.abort_timeout.load(Ordering::SeqCst)
                && !attempt.is_terminal()
            {
                warn!("OpenVPN never requested a hold release");
                inner
                    .end_attempt(&attempt, Termination::Failed(OvpnError::Timeout(CONNECT_TIMEOUT_MESSAGE.to_string())), true)
                    .await;
            }
        });
    }

    /// Finish an attempt: kill its session, then publish the terminal events.
    /// Only the first call per attempt has any effect; later callers wait
    /// until that teardown is complete. Returns whether this call published
    /// `Disconnected`.
    async fn end_attempt(&self, attempt: &Attempt, termination: Termination, publish: bool) -> bool {
        if attempt.terminal_raised.swap(true, Ordering::SeqCst) {
            attempt.wait_torn_down().await;
            return false;
        }
        attempt.abort_timeout.store(true, Ordering::SeqCst);

        let error = match termination {
            Termination::Clean => None,
            Termination::Failed(e) => Some(Arc::new(e)),
            Termination::DriverMissing => Some(Arc::new(OvpnError::TapDriverInstallationRequired)),
        };

        self.kill_session(Some(attempt.id)).await;

        let suppress = {
            let mut data = self.data();
            let current = data.attempt.as_ref().map(|a| a.id) == Some(attempt.id);
            if current {
                data.state = ConnectionState::Disconnected;
                data.connected_since = None;
                data.attempt = None;
            }
            if let Some(error) = &error {
                data.last_error = Some(error.clone());
            }
            data.suppress_errors
        };

        if publish {
            match &error {
                Some(error) if matches!(**error, OvpnError::TapDriverInstallationRequired) => {
                    self.publish(ConnectionEvent::TapDriverInstallationRequired {
                        host: attempt.host.clone(),
                        context: attempt.context.clone(),
                    });
                }
                Some(error) if !suppress => {
                    self.publish(ConnectionEvent::ConnectError {
                        host: attempt.host.clone(),
                        error: error.clone(),
                        context: attempt.context.clone(),
                    });
                }
                _ => {}
            }

            info!("Disconnected from {}", attempt.host);
            self.publish(ConnectionEvent::Disconnected {
                host: attempt.host.clone(),
                error,
                context: attempt.context.clone(),
            });
        }

        attempt.wake();
        attempt.torn_down.send_replace(true);
        publish
    }

    /// Dispose the management session and stop the process. With `Some(id)`
    /// nothing happens unless that attempt is still the current one.
    async fn kill_session(&self, attempt_id: Option<u64>) {
        let client = {
            let mut data = self.data();
            if let Some(id) = attempt_id {
                if data.attempt.as_ref().map(|a| a.id) != Some(id) {
                    return;
                }
            }
            data.client.take()
        };

        if let Some(client) = client {
            client.dispose().await;
        }

        if let Err(e) = self.launcher.kill_all().await {
            warn!("Failed to stop OpenVPN: {}", e);
        }
    }

    async fn shutdown(&self, publish: bool, always_publish: bool) {
        let (mut attempt, host, context) = {
            let data = self.data();
            (data.attempt.clone(), data.host.clone().unwrap_or_default(), data.context.clone())
        };

        // Without a current attempt a connect may be between tearing down
        // the old session and launching the new one.
        let mut _guard = None;
        if attempt.is_none() {
            _guard = Some(self.connect_lock.lock().await);
            attempt = self.data().attempt.clone();
        }

        if publish {
            info!("Disconnecting from {}", host);
            self.set_state(ConnectionState::Exiting);
            self.publish(ConnectionEvent::Disconnecting { context: context.clone() });
        }

        let published = match &attempt {
            Some(attempt) => self.end_attempt(attempt, Termination::Clean, publish).await,
            None => {
                self.kill_session(None).await;
                false
            }
        };

        // A newer attempt owns the state from here on
        let superseded = {
            let mut data = self.data();
            if data.attempt.is_some() {
                true
            } else {
                data.state = ConnectionState::Disconnected;
                false
            }
        };
        if always_publish && !published && !superseded {
            self.publish(ConnectionEvent::Disconnected { host, error: None, context });
        }
    }
}

/// Tunnel device name from an OpenVPN log line
fn parse_interface_name(message: &str) -> Option<String> {
    if let Some(rest) = message.split("opened utun device ").nth(1) {
        return rest.split_whitespace().next().map(str::to_string);
    }
    let rest = message.split("TUN/TAP device ").nth(1)?;
    let name = rest.strip_suffix(" opened").or_else(|| rest.split(" opened").next())?;
    (!name.is_empty()).then(|| name.trim().to_string())
}
