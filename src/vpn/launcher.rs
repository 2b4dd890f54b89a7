//! Starting and stopping the OpenVPN process.
//!
//! The orchestrator only talks to [`ProcessLauncher`]; [`OpenVpnLauncher`]
//! is the implementation that runs the real `openvpn` binary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OpenVpnSettings;
use crate::error::{OvpnError, OvpnResult};
use super::common;
use super::credentials::Secret;

/// How the tunnel is configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum LaunchMode {
    /// A complete `.ovpn` configuration file
    ConfigFile(PathBuf),
    /// Only a CA certificate; everything else comes from the command line
    Certificate(PathBuf),
}

impl LaunchMode {
    pub fn path(&self) -> &Path {
        match self {
            LaunchMode::ConfigFile(path) | LaunchMode::Certificate(path) => path,
        }
    }

    /// Fails when the referenced file is missing
    pub fn validate(&self) -> OvpnResult<()> {
        let (what, path) = match self {
            LaunchMode::ConfigFile(path) => ("Config file", path),
            LaunchMode::Certificate(path) => ("Certificate", path),
        };
        if !path.is_file() {
            return Err(OvpnError::InvalidParameter(format!("{} not found: {}", what, path.display())));
        }
        Ok(())
    }
}

/// What to start
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub host: String,
    pub mode: LaunchMode,
    pub protocol: String,
    pub port: u16,
}

/// Where to reach the management interface of the started process
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// 0 means the launcher could not determine a port
    pub management_port: u16,
    pub management_password: Secret,
}

/// Starts OpenVPN processes on behalf of the orchestrator
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a process with its management interface enabled and held
    async fn launch(&self, params: &LaunchParams) -> OvpnResult<LaunchOutcome>;

    /// Stop every process this launcher started. Must be safe to call when
    /// nothing is running.
    async fn kill_all(&self) -> OvpnResult<()>;
}

struct RunningProcess {
    child: Child,
    password_file: PathBuf,
}

/// Runs the `openvpn` binary with tokio's process API
pub struct OpenVpnLauncher {
    settings: OpenVpnSettings,
    running: Mutex<Option<RunningProcess>>,
}

impl OpenVpnLauncher {
    pub fn new(settings: OpenVpnSettings) -> Self {
        Self {
            settings,
            running: Mutex::new(None),
        }
    }

    pub async fn is_available(&self) -> bool {
        common::check_binary_available(&self.settings.binary).await
    }

    pub async fn version(&self) -> OvpnResult<String> {
        common::get_binary_version(&self.settings.binary).await
    }

    /// Command line for one process
    pub fn build_args(&self, params: &LaunchParams, management_port: u16, password_file: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |flag: &str, values: &[&str]| {
            args.push(flag.to_string());
            args.extend(values.iter().map(|v| v.to_string()));
        };

        push("--client", &[]);
        push("--remote", &[params.host.as_str()]);
        push("--port", &[params.port.to_string().as_str()]);
        push("--proto", &[params.protocol.as_str()]);
        push("--nobind", &[]);
        push("--dev", &["tun"]);
        push("--auth-nocache", &[]);
        push("--auth-user-pass", &[]);
        push("--auth-retry", &["interact"]);
        push("--ping", &[self.settings.ping.to_string().as_str()]);
        push("--ping-exit", &[self.settings.ping_exit.to_string().as_str()]);

        // Not valid over TCP
        if !params.protocol.to_ascii_lowercase().starts_with("tcp") {
            push("--explicit-exit-notify", &[]);
        }

        push(
            "--management",
            &[
                self.settings.management_host.as_str(),
                management_port.to_string().as_str(),
                password_file.to_string_lossy().as_ref(),
            ],
        );
        push("--management-hold", &[]);
        push("--management-query-passwords", &[]);
        push("--management-forget-disconnect", &[]);

        match &params.mode {
            LaunchMode::ConfigFile(path) => push("--config", &[path.to_string_lossy().as_ref()]),
            LaunchMode::Certificate(path) => push("--ca", &[path.to_string_lossy().as_ref()]),
        }

        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    async fn stop(process: RunningProcess) {
        let RunningProcess { mut child, password_file } = process;

        if let Err(e) = child.kill().await {
            warn!("Failed to kill OpenVPN process: {}", e);
        }

        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("OpenVPN process exited with status: {}", status),
            Ok(Err(e)) => warn!("Error waiting for OpenVPN process: {}", e),
            Err(_) => warn!("Timeout waiting for OpenVPN process to exit"),
        }

        if let Err(e) = common::delete_config_file(&password_file).await {
            warn!("{}", e);
        }
    }
}

#[async_trait]
impl ProcessLauncher for OpenVpnLauncher {
    async fn launch(&self, params: &LaunchParams) -> OvpnResult<LaunchOutcome> {
        params.mode.validate()?;

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            debug!("Stopping previous OpenVPN process before launch");
            Self::stop(previous).await;
        }

        let port = common::pick_management_port(&self.settings.management_host, self.settings.management_port_range())?;
        let password = Secret::new(Uuid::new_v4().to_string());

        common::ensure_directory_exists(&self.settings.state_dir).await?;
        let password_file = self.settings.state_dir.join(format!("management-{}.pw", port));
        common::write_secure_config(&password_file, &format!("{}\n", password.expose()), 0o600).await?;

        let args = self.build_args(params, port, &password_file);
        info!("Starting OpenVPN for {} (management port {})", params.host, port);
        debug!("{} {}", self.settings.binary, args.join(" "));

        let child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                if let Err(cleanup) = common::delete_config_file(&password_file).await {
                    warn!("{}", cleanup);
                }
                return Err(OvpnError::ServiceError(format!("Failed to start {}: {}", self.settings.binary, e)));
            }
        };

        debug!("OpenVPN started with PID {:?}", child.id());
        *running = Some(RunningProcess { child, password_file });

        Ok(LaunchOutcome {
            management_port: port,
            management_password: password,
        })
    }

    async fn kill_all(&self) -> OvpnResult<()> {
        if let Some(process) = self.running.lock().await.take() {
            info!("Stopping OpenVPN process");
            Self::stop(process).await;
        }
        Ok(())
    }
}
