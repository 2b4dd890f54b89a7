//! Client for the OpenVPN management interface.
//!
//! Wraps a [`LineTransport`], registers a router handler per notification tag
//! and turns every recognised line into a [`ProtocolEvent`] delivered over an
//! unbounded channel, in the order the lines arrived.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::config::OvpnctlConfig;
use crate::error::{OvpnError, OvpnResult};
use crate::net::router::{Comparison, MatchMode};
use crate::net::transport::{LineTransport, TransportEvent, TransportHandle};
use super::credentials::{CredentialProvider, Credentials, Secret};
use super::protocol::{
    command, trim_type, ByteCountArgs, EchoArgs, LogArgs, OvpnState, PasswordKind, PasswordRequest,
    ProtocolEvent, StateArgs, HOLD_RELEASE_SUCCEEDED, PASSWORD_PROMPT, TAG_BYTECOUNT, TAG_ECHO,
    TAG_FATAL, TAG_HOLD, TAG_INFO, TAG_LOG, TAG_PASSWORD, TAG_STATE, TAG_SUCCESS,
};

/// Connection parameters for one management session
#[derive(Debug, Clone)]
pub struct ManagementSettings {
    pub host: String,
    pub port: u16,
    /// One-time password answered to `ENTER PASSWORD:`
    pub password: Secret,
    pub connect_timeout: Duration,
    /// Pause between a credential command and the NUL flush that follows it
    pub credential_settle: Duration,
    /// Upper bound on waiting for OpenVPN to exit after SIGTERM
    pub shutdown_wait: Duration,
    pub shutdown_poll: Duration,
}

impl ManagementSettings {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<Secret>) -> Self {
        let defaults = OvpnctlConfig::default();
        Self::from_config(&defaults, host, port, password)
    }

    pub fn from_config(config: &OvpnctlConfig, host: impl Into<String>, port: u16, password: impl Into<Secret>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            connect_timeout: config.timeouts.management_connect(),
            credential_settle: config.timeouts.credential_settle(),
            shutdown_wait: config.timeouts.shutdown_wait(),
            shutdown_poll: config.timeouts.shutdown_poll(),
        }
    }
}

#[derive(Default)]
struct SessionFlags {
    waiting_for_hold_release: AtomicBool,
    received_exit_notification: AtomicBool,
    disposing: AtomicBool,
    disconnected_raised: AtomicBool,
    last_bandwidth_update: Mutex<Option<DateTime<Utc>>>,
}

impl SessionFlags {
    fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }
}

/// Sends events unless the client is being torn down
#[derive(Clone)]
struct Emitter {
    tx: mpsc::UnboundedSender<ProtocolEvent>,
    flags: Arc<SessionFlags>,
}

impl Emitter {
    fn emit(&self, event: ProtocolEvent) {
        if self.flags.is_disposing() {
            trace!("Suppressing {:?} during shutdown", event);
            return;
        }
        let _ = self.tx.send(event);
    }

    fn emit_parsed(&self, line: &str, parsed: OvpnResult<ProtocolEvent>) {
        match parsed {
            Ok(event) => self.emit(event),
            Err(e) => warn!("Ignoring malformed management line '{}': {}", line, e),
        }
    }

    /// Raise `Disconnected` at most once per session
    fn emit_disconnected(&self) {
        if !self.flags.disconnected_raised.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ProtocolEvent::Disconnected);
        }
    }
}

async fn send_secret(handle: &TransportHandle, line: Zeroizing<String>, settle: Duration) {
    handle.send_sensitive(line);
    tokio::time::sleep(settle).await;
    handle.send(command::flush());
}

/// One dialogue with a running OpenVPN process
pub struct ManagementClient {
    transport: LineTransport,
    handle: TransportHandle,
    flags: Arc<SessionFlags>,
    emitter: Emitter,
    settings: ManagementSettings,
}

impl ManagementClient {
    /// Build a client and the receiver its events are delivered on.
    ///
    /// `credentials` answers `>PASSWORD:Need 'Auth'` and `'Private Key'`
    /// requests; without one those requests surface as `Fatal`.
    pub fn new(
        settings: ManagementSettings,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let flags = Arc::new(SessionFlags::default());
        let emitter = Emitter { tx, flags: flags.clone() };

        let transport = LineTransport::new(settings.host.clone(), settings.port, settings.connect_timeout);
        transport.add_magic_phrase(PASSWORD_PROMPT);
        let handle = transport.handle();

        let client = Self {
            transport,
            handle,
            flags,
            emitter,
            settings,
        };
        client.register_handlers(credentials);

        (client, rx)
    }

    fn register_handlers(&self, credentials: Option<Arc<dyn CredentialProvider>>) {
        let router = self.transport.router();

        let handle = self.handle.clone();
        let password = self.settings.password.clone();
        router.add_handler(PASSWORD_PROMPT, MatchMode::EndsWith, Comparison::IgnoreAsciiCase, move |_| {
            debug!("Answering management password prompt");
            handle.send_sensitive(Zeroizing::new(password.expose().to_string()));
        });

        let emitter = self.emitter.clone();
        router.add_prefix_handler(TAG_ECHO, move |line| {
            emitter.emit_parsed(line, trim_type(line).parse::<EchoArgs>().map(ProtocolEvent::Echo));
        });

        let emitter = self.emitter.clone();
        router.add_prefix_handler(TAG_LOG, move |line| {
            emitter.emit_parsed(line, trim_type(line).parse::<LogArgs>().map(ProtocolEvent::Log));
        });

        let emitter = self.emitter.clone();
        router.add_prefix_handler(TAG_INFO, move |line| {
            emitter.emit(ProtocolEvent::Info(trim_type(line).to_string()));
        });

        let emitter = self.emitter.clone();
        router.add_prefix_handler(TAG_FATAL, move |line| {
            emitter.emit(ProtocolEvent::Fatal(trim_type(trim_type(line)).to_string()));
        });

        let emitter = self.emitter.clone();
        let flags = self.flags.clone();
        router.add_prefix_handler(TAG_BYTECOUNT, move |line| {
            if flags.is_disposing() {
                return;
            }
            if let Ok(mut last) = flags.last_bandwidth_update.lock() {
                *last = Some(Utc::now());
            }
            emitter.emit_parsed(line, trim_type(line).parse::<ByteCountArgs>().map(ProtocolEvent::ByteCount));
        });

        let emitter = self.emitter.clone();
        let flags = self.flags.clone();
        router.add_prefix_handler(TAG_HOLD, move |_| {
            if flags.is_disposing() {
                return;
            }
            flags.waiting_for_hold_release.store(true, Ordering::SeqCst);
            emitter.emit(ProtocolEvent::HoldRequested);
        });

        let emitter = self.emitter.clone();
        let flags = self.flags.clone();
        router.add_handler(TAG_SUCCESS, MatchMode::StartsWith, Comparison::IgnoreAsciiCase, move |line| {
            let message = trim_type(line);
            if message.eq_ignore_ascii_case(HOLD_RELEASE_SUCCEEDED) {
                flags.waiting_for_hold_release.store(false, Ordering::SeqCst);
                emitter.emit(ProtocolEvent::HoldReleaseSucceeded);
            }
            emitter.emit(ProtocolEvent::Success(message.to_string()));
        });

        let emitter = self.emitter.clone();
        let handle = self.handle.clone();
        let settle = self.settings.credential_settle;
        router.add_prefix_handler(TAG_PASSWORD, move |line| {
            let request = match trim_type(line).parse::<PasswordRequest>() {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring malformed password request '{}': {}", line, e);
                    return;
                }
            };
            if emitter.flags.is_disposing() {
                return;
            }
            Self::handle_password_request(request, &emitter, &handle, credentials.as_deref(), settle);
        });

        let emitter = self.emitter.clone();
        let flags = self.flags.clone();
        let handle = self.handle.clone();
        router.add_prefix_handler(TAG_STATE, move |line| {
            let args = match trim_type(line).parse::<StateArgs>() {
                Ok(args) => args,
                Err(e) => {
                    warn!("Ignoring malformed state line '{}': {}", line, e);
                    return;
                }
            };

            if args.state == OvpnState::Exiting {
                flags.received_exit_notification.store(true, Ordering::SeqCst);
            }
            if flags.is_disposing() {
                return;
            }

            if args.state == OvpnState::Reconnecting {
                // OpenVPN does not recover cleanly in place; drop the session
                info!("OpenVPN is reconnecting, closing management session");
                handle.disconnect();
            }

            if args.state == OvpnState::Connected && line.contains(",ERROR,") {
                warn!("OpenVPN connected with errors: {}", line);
                handle.disconnect();
                emitter.emit(ProtocolEvent::ConnectedWithErrors);
                return;
            }

            emitter.emit(ProtocolEvent::StateChanged(args));
        });
    }

    fn handle_password_request(
        request: PasswordRequest,
        emitter: &Emitter,
        handle: &TransportHandle,
        credentials: Option<&dyn CredentialProvider>,
        settle: Duration,
    ) {
        match request.kind {
            PasswordKind::UsernamePassword => {
                emitter.emit(ProtocolEvent::PasswordRequest(request));
                let result = credentials
                    .ok_or_else(|| OvpnError::NotSupported("no credential provider configured".to_string()))
                    .and_then(|provider| provider.credentials());
                match result {
                    Ok(creds) => Self::spawn_send_credentials(handle.clone(), creds, settle),
                    Err(e) => emitter.emit(ProtocolEvent::Fatal(
                        OvpnError::CredentialsUnavailable(e.to_string()).to_string(),
                    )),
                }
            }
            PasswordKind::PrivateKey => {
                emitter.emit(ProtocolEvent::PasswordRequest(request));
                let result = credentials
                    .ok_or_else(|| OvpnError::NotSupported("no credential provider configured".to_string()))
                    .and_then(|provider| provider.private_key());
                match result {
                    Ok(passphrase) => handle.send_sensitive(command::private_key(passphrase.expose())),
                    Err(e) => emitter.emit(ProtocolEvent::Fatal(
                        OvpnError::CredentialsUnavailable(e.to_string()).to_string(),
                    )),
                }
            }
            PasswordKind::VerificationFailed => {
                emitter.emit(ProtocolEvent::PasswordRequest(request));
            }
            PasswordKind::Other => {
                debug!("Unhandled password notification: {}", request.payload);
            }
        }
    }

    // Password goes first; each secret is followed by a settle delay and a NUL flush.
    fn spawn_send_credentials(handle: TransportHandle, creds: Credentials, settle: Duration) {
        tokio::spawn(async move {
            send_secret(&handle, command::auth_password(creds.password.expose()), settle).await;
            send_secret(&handle, command::auth_username(&creds.username), settle).await;
            debug!("Sent credentials for user {}", creds.username);
        });
    }

    /// Open the management socket
    pub async fn connect(&self) -> OvpnResult<()> {
        let mut transport_events = self.transport.subscribe_events();
        self.transport.connect().await?;

        let emitter = self.emitter.clone();
        let flags = self.flags.clone();
        tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Disconnected) => {
                        if !flags.is_disposing() {
                            flags.received_exit_notification.store(true, Ordering::SeqCst);
                            emitter.emit_disconnected();
                        }
                        break;
                    }
                    Ok(TransportEvent::Error { message, unsent, unprocessed }) => {
                        warn!("Management transport error: {} (unsent: {}, unprocessed: {})", message, unsent, unprocessed);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Management transport events lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("Management client connected on port {}", self.settings.port);
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.settings.port
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn is_waiting_for_hold_release(&self) -> bool {
        self.flags.waiting_for_hold_release.load(Ordering::SeqCst)
    }

    pub fn received_exit_notification(&self) -> bool {
        self.flags.received_exit_notification.load(Ordering::SeqCst)
    }

    pub fn is_disposing(&self) -> bool {
        self.flags.is_disposing()
    }

    /// When the last `>BYTECOUNT:` arrived
    pub fn last_bandwidth_update(&self) -> Option<DateTime<Utc>> {
        self.flags.last_bandwidth_update.lock().ok().and_then(|t| *t)
    }

    /// Raw dispatched lines, for diagnostics
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.transport.subscribe_lines()
    }

    /// Real-time bandwidth notifications every `seconds`; 0 turns them off
    pub fn set_byte_count(&self, seconds: u32) {
        self.handle.send(command::bytecount(seconds));
    }

    pub fn set_echo(&self, on: bool) {
        self.handle.send(command::echo(on));
    }

    /// Leave the hold state without changing the hold flag
    pub fn release_hold(&self) {
        self.handle.send(command::hold_release());
    }

    /// Whether future restarts hold
    pub fn set_hold(&self, on: bool) {
        self.handle.send(command::hold(on));
    }

    pub fn set_log(&self, on: bool) {
        self.handle.send(command::log(on));
    }

    pub fn set_state(&self, on: bool) {
        self.handle.send(command::state(on));
    }

    pub async fn set_auth_password(&self, password: &str) {
        send_secret(&self.handle, command::auth_password(password), self.settings.credential_settle).await;
    }

    pub async fn set_auth_username(&self, username: &str) {
        send_secret(&self.handle, command::auth_username(username), self.settings.credential_settle).await;
    }

    pub fn set_private_key(&self, passphrase: &str) {
        self.handle.send_sensitive(command::private_key(passphrase));
    }

    pub fn sig_term(&self) {
        self.handle.send(command::sigterm());
    }

    /// Ask OpenVPN to exit and close the session.
    ///
    /// Events arriving from here on are dropped. Waits up to the configured
    /// shutdown bound for the exit notification or the socket to close, then
    /// raises `Disconnected` unless it was already raised. Further calls are
    /// no-ops.
    pub async fn dispose(&self) {
        if self.flags.disposing.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Disposing management client on port {}", self.settings.port);
        self.sig_term();

        let started = Instant::now();
        while !self.received_exit_notification()
            && self.handle.is_connected()
            && started.elapsed() < self.settings.shutdown_wait
        {
            tokio::time::sleep(self.settings.shutdown_poll).await;
        }

        if self.handle.is_connected() && !self.received_exit_notification() {
            warn!("OpenVPN did not acknowledge SIGTERM within {:?}", self.settings.shutdown_wait);
        }

        self.transport.disconnect();
        self.emitter.emit_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ManagementSettings {
        let mut settings = ManagementSettings::new("127.0.0.1", 1, "pw");
        settings.shutdown_wait = Duration::from_millis(50);
        settings.shutdown_poll = Duration::from_millis(10);
        settings
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = OvpnctlConfig::default();
        config.timeouts.credential_settle_ms = 5;
        let settings = ManagementSettings::from_config(&config, "localhost", 31000, "pw");
        assert_eq!(settings.credential_settle, Duration::from_millis(5));
        assert_eq!(settings.shutdown_wait, Duration::from_secs(10));
        assert_eq!(settings.port, 31000);
    }

    #[tokio::test]
    async fn test_initial_flags() {
        let (client, _rx) = ManagementClient::new(settings(), None);
        assert!(!client.is_connected());
        assert!(!client.is_waiting_for_hold_release());
        assert!(!client.received_exit_notification());
        assert!(client.last_bandwidth_update().is_none());
    }

    #[tokio::test]
    async fn test_dispose_without_connection_is_idempotent() {
        let (client, mut rx) = ManagementClient::new(settings(), None);

        client.dispose().await;
        client.dispose().await;
        assert!(client.is_disposing());

        assert_eq!(rx.recv().await, Some(ProtocolEvent::Disconnected));
        assert!(rx.try_recv().is_err());
    }
}
