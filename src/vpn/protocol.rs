//! OpenVPN management interface wire format.
//!
//! Parsers for the payload of each tagged real-time notification and the
//! [`ProtocolEvent`] values the management client raises from them.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::{OvpnError, OvpnResult};

pub const TAG_ECHO: &str = ">ECHO:";
pub const TAG_LOG: &str = ">LOG:";
pub const TAG_INFO: &str = ">INFO:";
pub const TAG_FATAL: &str = ">FATAL:";
pub const TAG_BYTECOUNT: &str = ">BYTECOUNT:";
pub const TAG_HOLD: &str = ">HOLD:";
pub const TAG_PASSWORD: &str = ">PASSWORD:";
pub const TAG_STATE: &str = ">STATE:";
pub const TAG_SUCCESS: &str = "SUCCESS:";
pub const PASSWORD_PROMPT: &str = "ENTER PASSWORD:";

pub const HOLD_RELEASE_SUCCEEDED: &str = "hold release succeeded";
pub const AUTHENTICATION_FAILURE_MESSAGE: &str = "Authentication failure during connection attempt.";

/// Strip everything up to and including the first colon.
///
/// Lines without a colon come back unchanged (trimmed).
pub fn trim_type(message: &str) -> &str {
    match message.find(':') {
        Some(i) => message[i + 1..].trim(),
        None => message.trim(),
    }
}

/// Escape a value for a quoted management command argument
pub fn escape(argument: &str) -> String {
    let specials = argument.chars().filter(|c| matches!(c, '\\' | '"' | ' ')).count();
    let mut escaped = String::with_capacity(argument.len() + specials);
    for c in argument.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            ' ' => escaped.push_str("\\ "),
            c => escaped.push(c),
        }
    }
    escaped
}

fn parse_unix_time(field: &str) -> OvpnResult<DateTime<Utc>> {
    let secs: i64 = field
        .trim()
        .parse()
        .map_err(|_| OvpnError::ParseError(format!("Invalid unix timestamp '{}'", field)))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| OvpnError::ParseError(format!("Timestamp out of range: {}", secs)))
}

/// Connection states reported by `>STATE:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OvpnState {
    Resolve,
    Connecting,
    Wait,
    Auth,
    GetConfig,
    AssignIp,
    AddRoutes,
    Connected,
    Reconnecting,
    Exiting,
    TcpConnect,
}

impl OvpnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OvpnState::Resolve => "RESOLVE",
            OvpnState::Connecting => "CONNECTING",
            OvpnState::Wait => "WAIT",
            OvpnState::Auth => "AUTH",
            OvpnState::GetConfig => "GET_CONFIG",
            OvpnState::AssignIp => "ASSIGN_IP",
            OvpnState::AddRoutes => "ADD_ROUTES",
            OvpnState::Connected => "CONNECTED",
            OvpnState::Reconnecting => "RECONNECTING",
            OvpnState::Exiting => "EXITING",
            OvpnState::TcpConnect => "TCP_CONNECT",
        }
    }

    /// States between hold release and CONNECTED
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            OvpnState::Resolve
                | OvpnState::Connecting
                | OvpnState::Wait
                | OvpnState::Auth
                | OvpnState::GetConfig
                | OvpnState::AssignIp
                | OvpnState::AddRoutes
                | OvpnState::TcpConnect
        )
    }
}

impl fmt::Display for OvpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OvpnState {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "RESOLVE" => Ok(OvpnState::Resolve),
            "CONNECTING" => Ok(OvpnState::Connecting),
            "WAIT" => Ok(OvpnState::Wait),
            "AUTH" => Ok(OvpnState::Auth),
            "GET_CONFIG" => Ok(OvpnState::GetConfig),
            "ASSIGN_IP" => Ok(OvpnState::AssignIp),
            "ADD_ROUTES" => Ok(OvpnState::AddRoutes),
            "CONNECTED" => Ok(OvpnState::Connected),
            "RECONNECTING" => Ok(OvpnState::Reconnecting),
            "EXITING" => Ok(OvpnState::Exiting),
            "TCP_CONNECT" => Ok(OvpnState::TcpConnect),
            other => Err(OvpnError::ParseError(format!("Unknown OpenVPN state '{}'", other))),
        }
    }
}

/// Payload of `>STATE:<unixTime>,<STATE>[,<descr>[,<localIP>[,<remoteIP>]]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateArgs {
    pub timestamp: DateTime<Utc>,
    pub state: OvpnState,
    pub description: Option<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
}

impl FromStr for StateArgs {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 2 {
            return Err(OvpnError::ParseError(format!("STATE needs at least 2 fields: '{}'", s)));
        }

        let field = |i: usize| parts.get(i).map(|p| p.to_string());

        Ok(StateArgs {
            timestamp: parse_unix_time(parts[0])?,
            state: parts[1].parse()?,
            description: field(2),
            local_ip: field(3),
            remote_ip: field(4),
        })
    }
}

/// Payload of `>BYTECOUNT:<in>,<out>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCountArgs {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl FromStr for ByteCountArgs {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bytes_in, bytes_out) = s
            .split_once(',')
            .ok_or_else(|| OvpnError::ParseError(format!("BYTECOUNT needs 2 fields: '{}'", s)))?;

        let number = |field: &str| {
            field
                .trim()
                .parse::<u64>()
                .map_err(|_| OvpnError::ParseError(format!("Invalid byte count '{}'", field)))
        };

        Ok(ByteCountArgs {
            bytes_in: number(bytes_in)?,
            bytes_out: number(bytes_out)?,
        })
    }
}

/// Severity flags attached to `>LOG:` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct LogFlags(u8);

impl LogFlags {
    pub const INFORMATIONAL: LogFlags = LogFlags(1 << 0);
    pub const FATAL_ERROR: LogFlags = LogFlags(1 << 1);
    pub const NON_FATAL_ERROR: LogFlags = LogFlags(1 << 2);
    pub const WARNING: LogFlags = LogFlags(1 << 3);
    pub const DEBUG: LogFlags = LogFlags(1 << 4);

    pub const fn empty() -> Self {
        LogFlags(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: LogFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a concatenation of `I`, `F`, `N`, `W`, `D` characters.
    /// Unknown characters are ignored.
    pub fn from_letters(letters: &str) -> Self {
        letters.chars().fold(LogFlags::empty(), |flags, c| {
            flags
                | match c {
                    'I' => LogFlags::INFORMATIONAL,
                    'F' => LogFlags::FATAL_ERROR,
                    'N' => LogFlags::NON_FATAL_ERROR,
                    'W' => LogFlags::WARNING,
                    'D' => LogFlags::DEBUG,
                    _ => LogFlags::empty(),
                }
        })
    }
}

impl BitOr for LogFlags {
    type Output = LogFlags;

    fn bitor(self, rhs: LogFlags) -> LogFlags {
        LogFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for LogFlags {
    fn bitor_assign(&mut self, rhs: LogFlags) {
        self.0 |= rhs.0;
    }
}

/// Payload of `>LOG:<unixTime>,<flags>,<message>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogArgs {
    pub timestamp: DateTime<Utc>,
    pub flags: LogFlags,
    pub message: String,
}

impl FromStr for LogArgs {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Log text may itself contain commas
        let parts: Vec<&str> = s.splitn(3, ',').collect();
        if parts.len() < 3 {
            return Err(OvpnError::ParseError(format!("LOG needs 3 fields: '{}'", s)));
        }

        Ok(LogArgs {
            timestamp: parse_unix_time(parts[0])?,
            flags: LogFlags::from_letters(parts[1]),
            message: parts[2].to_string(),
        })
    }
}

/// Payload of `>ECHO:<unixTime>,<command>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoArgs {
    pub timestamp: DateTime<Utc>,
    pub command: String,
}

impl FromStr for EchoArgs {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time, command) = s
            .split_once(',')
            .ok_or_else(|| OvpnError::ParseError(format!("ECHO needs 2 fields: '{}'", s)))?;

        Ok(EchoArgs {
            timestamp: parse_unix_time(time)?,
            command: command.to_string(),
        })
    }
}

/// What a `>PASSWORD:` notification asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordKind {
    /// `Need 'Auth' username/password`
    UsernamePassword,
    /// `Need 'Private Key' password`
    PrivateKey,
    /// `Verification Failed: '<type>'`
    VerificationFailed,
    /// Anything else, e.g. auth tokens
    Other,
}

/// Parsed `>PASSWORD:` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub kind: PasswordKind,
    /// Human readable detail; for verification failures the message shown to users
    pub payload: String,
}

impl FromStr for PasswordRequest {
    type Err = OvpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim_start_matches(':').trim();
        let lower = text.to_ascii_lowercase();

        let kind = if lower.starts_with("need") {
            // The realm is the first single-quoted token: Need 'Private Key' password
            let realm = text
                .split('\'')
                .nth(1)
                .unwrap_or_default();
            match realm {
                "Auth" => PasswordKind::UsernamePassword,
                "Private Key" => PasswordKind::PrivateKey,
                _ => PasswordKind::Other,
            }
        } else if lower.starts_with("verification failed") {
            PasswordKind::VerificationFailed
        } else {
            PasswordKind::Other
        };

        let payload = match kind {
            PasswordKind::VerificationFailed => AUTHENTICATION_FAILURE_MESSAGE.to_string(),
            _ => text.to_string(),
        };

        Ok(PasswordRequest { kind, payload })
    }
}

/// One decoded management notification
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    StateChanged(StateArgs),
    Log(LogArgs),
    Info(String),
    ByteCount(ByteCountArgs),
    Echo(EchoArgs),
    PasswordRequest(PasswordRequest),
    Fatal(String),
    Success(String),
    HoldRequested,
    HoldReleaseSucceeded,
    /// CONNECTED was reported together with `,ERROR,`; the session has been dropped
    ConnectedWithErrors,
    Disconnected,
}

/// Outbound management commands
pub mod command {
    use super::escape;
    use zeroize::Zeroizing;

    pub fn bytecount(seconds: u32) -> String {
        format!("bytecount {}", seconds)
    }

    fn on_off(name: &str, on: bool) -> String {
        format!("{} {}", name, if on { "on" } else { "off" })
    }

    pub fn echo(on: bool) -> String {
        on_off("echo", on)
    }

    pub fn hold(on: bool) -> String {
        on_off("hold", on)
    }

    pub fn log(on: bool) -> String {
        on_off("log", on)
    }

    pub fn state(on: bool) -> String {
        on_off("state", on)
    }

    pub fn hold_release() -> String {
        "hold release".to_string()
    }

    // Sized up front so no reallocation leaves a stray copy behind
    fn quoted(prefix: &str, value: &str) -> Zeroizing<String> {
        let escaped = Zeroizing::new(escape(value));
        let mut line = Zeroizing::new(String::with_capacity(prefix.len() + escaped.len() + 2));
        line.push_str(prefix);
        line.push('"');
        line.push_str(&escaped);
        line.push('"');
        line
    }

    pub fn auth_password(password: &str) -> Zeroizing<String> {
        quoted("password Auth ", password)
    }

    pub fn auth_username(username: &str) -> Zeroizing<String> {
        quoted("username Auth ", username)
    }

    pub fn private_key(passphrase: &str) -> Zeroizing<String> {
        quoted("password \"Private Key\" ", passphrase)
    }

    pub fn sigterm() -> String {
        "signal SIGTERM".to_string()
    }

    /// 1024 NUL characters; pushes credential commands through OpenVPN's input buffering
    pub fn flush() -> String {
        "\0".repeat(1024)
    }
}
