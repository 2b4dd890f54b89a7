//! OpenVPN Control CLI (ovpnctl)
//!
//! Starts OpenVPN, drives it through the management interface and prints
//! lifecycle events until the tunnel goes down or Ctrl-C is pressed.
//!
//! # Usage
//!
//! ```bash
//! # Connect using a full .ovpn file
//! sudo ovpnctl connect --config client.ovpn --host vpn.example.com
//!
//! # Username/password authentication, password read from the environment
//! OVPN_PASSWORD=secret sudo ovpnctl connect --config client.ovpn --host vpn.example.com --username alice
//!
//! # Decode a raw management line
//! ovpnctl parse-line '>STATE:1700000000,CONNECTED,SUCCESS,10.8.0.2,203.0.113.5'
//! ```

use clap::{Parser, Subcommand};
use libovpnctl::config::OvpnctlConfig;
use libovpnctl::error::{OvpnError, OvpnResult};
use libovpnctl::vpn::protocol::{
    trim_type, ByteCountArgs, EchoArgs, LogArgs, PasswordRequest, StateArgs, TAG_BYTECOUNT, TAG_ECHO,
    TAG_FATAL, TAG_HOLD, TAG_INFO, TAG_LOG, TAG_PASSWORD, TAG_STATE, TAG_SUCCESS,
};
use libovpnctl::vpn::{
    ConnectParams, ConnectionEvent, CredentialProvider, Credentials, LaunchMode, OpenVpnConnection,
    OpenVpnLauncher, OrchestratorSettings, StaticCredentials,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// OpenVPN management-interface controller
#[derive(Parser, Debug)]
#[command(name = "ovpnctl")]
#[command(version)]
#[command(about = "Drive OpenVPN through its management interface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print events as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and stay connected until interrupted
    Connect {
        /// Remote server
        #[arg(long)]
        host: String,

        /// Full OpenVPN configuration file
        #[arg(long, conflicts_with = "ca", required_unless_present = "ca")]
        config: Option<PathBuf>,

        /// CA certificate, when no configuration file is used
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Transport protocol (udp, tcp)
        #[arg(long, default_value = "udp")]
        proto: String,

        /// Remote port
        #[arg(long, default_value_t = 1194)]
        port: u16,

        /// Username for 'Auth' requests
        #[arg(long)]
        username: Option<String>,

        /// Environment variable holding the password
        #[arg(long, default_value = "OVPN_PASSWORD")]
        password_env: String,

        /// Manual connect timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Decode a raw management interface line
    ParseLine {
        line: String,
    },

    /// Show the installed OpenVPN version
    Version,
}

#[tokio::main]
async fn main() -> OvpnResult<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    let mut config = match &cli.settings {
        Some(path) => OvpnctlConfig::load(path)?,
        None => OvpnctlConfig::default(),
    };

    match cli.command {
        Commands::Connect {
            host,
            config: ovpn_config,
            ca,
            proto,
            port,
            username,
            password_env,
            timeout,
        } => {
            if let Some(secs) = timeout {
                config.timeouts.connect_secs = secs;
            }

            let mode = match (ovpn_config, ca) {
                (Some(path), _) => LaunchMode::ConfigFile(path),
                (None, Some(path)) => LaunchMode::Certificate(path),
                (None, None) => {
                    return Err(OvpnError::InvalidParameter("Either --config or --ca is required".to_string()))
                }
            };

            let credentials = match username {
                Some(username) => {
                    let password = std::env::var(&password_env).map_err(|_| {
                        OvpnError::InvalidParameter(format!("Password variable {} is not set", password_env))
                    })?;
                    let provider: Arc<dyn CredentialProvider> =
                        Arc::new(StaticCredentials::new(Credentials::new(username, password)));
                    Some(provider)
                }
                None => None,
            };

            let params = ConnectParams::new(host, mode).with_protocol(proto).with_port(port);
            run_connect(&config, params, credentials, cli.json).await
        }
        Commands::ParseLine { line } => {
            let decoded = decode_line(&line)?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
            Ok(())
        }
        Commands::Version => {
            let launcher = OpenVpnLauncher::new(config.openvpn.clone());
            if !launcher.is_available().await {
                return Err(OvpnError::NotSupported(format!("{} not found in PATH", config.openvpn.binary)));
            }
            println!("{}", launcher.version().await?);
            Ok(())
        }
    }
}

/// Initialize logging based on command line arguments
fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ovpnctl={},libovpnctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

async fn run_connect(
    config: &OvpnctlConfig,
    params: ConnectParams,
    credentials: Option<Arc<dyn CredentialProvider>>,
    json_output: bool,
) -> OvpnResult<()> {
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - OpenVPN may fail to create the tunnel device");
        }
    }

    config.validate()?;
    config.ensure_directories()?;

    let launcher = Arc::new(OpenVpnLauncher::new(config.openvpn.clone()));
    let connection = OpenVpnConnection::new(OrchestratorSettings::from(config), launcher, credentials);

    let printer = tokio::spawn(print_events(connection.subscribe(), json_output));
    let mut events = connection.subscribe();

    tokio::select! {
        result = connection.connect(params) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted while connecting");
            connection.abort().await;
            printer.abort();
            return Ok(());
        }
    }

    if !connection.is_connected() {
        printer.abort();
        let reason = connection
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        return Err(OvpnError::ServiceError(format!("Connection failed: {}", reason)));
    }

    info!("Connected; press Ctrl-C to disconnect");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Disconnecting");
            connection.disconnect().await;
        }
        _ = wait_for_disconnect(&mut events) => {
            warn!("Connection closed");
        }
    }

    printer.abort();
    Ok(())
}

async fn wait_for_disconnect(events: &mut broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<ConnectionEvent>, json_output: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json_output {
            println!("{}", event_json(&event));
            continue;
        }

        match event {
            ConnectionEvent::Connecting { host, .. } => println!("Connecting to {}...", host),
            ConnectionEvent::Connected { host, .. } => println!("✓ Connected to {}", host),
            ConnectionEvent::Disconnecting { .. } => println!("Disconnecting..."),
            ConnectionEvent::Disconnected { host, error: Some(e), .. } => println!("✗ Disconnected from {}: {}", host, e),
            ConnectionEvent::Disconnected { host, error: None, .. } => println!("Disconnected from {}", host),
            ConnectionEvent::ConnectError { host, error, .. } => error!("Connection to {} failed: {}", host, error),
            ConnectionEvent::BandwidthUsageUpdated(usage) => info!(
                "{} ({} B/s down, {} B/s up)",
                usage, usage.rx_bytes_per_second, usage.tx_bytes_per_second
            ),
            ConnectionEvent::TapDriverInstallationRequired { .. } => {
                error!("A TAP/WinTun adapter must be installed before connecting")
            }
        }
    }
}

fn event_json(event: &ConnectionEvent) -> Value {
    match event {
        ConnectionEvent::Connecting { host, context } => json!({"event": "connecting", "host": host, "context": context}),
        ConnectionEvent::Connected { host, context } => json!({"event": "connected", "host": host, "context": context}),
        ConnectionEvent::Disconnecting { context } => json!({"event": "disconnecting", "context": context}),
        ConnectionEvent::Disconnected { host, error, context } => json!({
            "event": "disconnected",
            "host": host,
            "error": error.as_ref().map(|e| e.to_string()),
            "context": context,
        }),
        ConnectionEvent::ConnectError { host, error, context } => json!({
            "event": "connect_error",
            "host": host,
            "error": error.to_string(),
            "context": context,
        }),
        ConnectionEvent::BandwidthUsageUpdated(usage) => json!({"event": "bandwidth", "usage": usage}),
        ConnectionEvent::TapDriverInstallationRequired { host, context } => {
            json!({"event": "tap_driver_required", "host": host, "context": context})
        }
    }
}

/// Decode one management line into a JSON description
fn decode_line(line: &str) -> OvpnResult<Value> {
    let payload = trim_type(line);
    let decoded = if line.starts_with(TAG_STATE) {
        json!({"type": "state", "args": payload.parse::<StateArgs>()?})
    } else if line.starts_with(TAG_LOG) {
        json!({"type": "log", "args": payload.parse::<LogArgs>()?})
    } else if line.starts_with(TAG_BYTECOUNT) {
        json!({"type": "bytecount", "args": payload.parse::<ByteCountArgs>()?})
    } else if line.starts_with(TAG_ECHO) {
        json!({"type": "echo", "args": payload.parse::<EchoArgs>()?})
    } else if line.starts_with(TAG_PASSWORD) {
        json!({"type": "password", "args": payload.parse::<PasswordRequest>()?})
    } else if line.starts_with(TAG_FATAL) {
        json!({"type": "fatal", "message": trim_type(payload)})
    } else if line.starts_with(TAG_INFO) {
        json!({"type": "info", "message": payload})
    } else if line.starts_with(TAG_HOLD) {
        json!({"type": "hold", "message": payload})
    } else if line.to_ascii_uppercase().starts_with(TAG_SUCCESS) {
        json!({"type": "success", "message": payload})
    } else {
        json!({"type": "unrecognized", "line": line})
    };
    Ok(decoded)
}
