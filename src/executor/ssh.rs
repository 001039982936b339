//! SSH execution backend built on russh.
//!
//! Every module run opens its own session: connect, authenticate, run one
//! or two commands, disconnect. Transport and authentication problems map
//! to `unreachable`; everything after a successful login maps to `ok` or
//! `failed`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::backend::{ExecutionBackend, HostOutcome, HostTarget};
use super::ModuleCall;

/// Transport level failures. All of them make a host unreachable.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    ConnectionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("host key verification failed for {0}")]
    HostKeyRejected(String),

    #[error("{0}")]
    Channel(String),
}

/// Error type for the russh handler.
#[derive(Debug)]
pub struct RusshError(pub russh::Error);

impl From<russh::Error> for RusshError {
    fn from(err: russh::Error) -> Self {
        RusshError(err)
    }
}

impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "russh error: {}", self.0)
    }
}

impl std::error::Error for RusshError {}

struct ClientHandler {
    host: String,
    port: u16,
    check_host_key: bool,
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if !self.check_host_key {
            return Ok(true);
        }
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs modules over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshBackend {
    host_key_checking: bool,
}

impl SshBackend {
    pub fn new(host_key_checking: bool) -> Self {
        Self { host_key_checking }
    }

    async fn connect(&self, target: &HostTarget) -> Result<Handle<ClientHandler>, ConnectionError> {
        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(target.timeout.max(Duration::from_secs(1)) * 6);
        let config = Arc::new(config);

        let addr = format!("{}:{}", target.host, target.port);
        let socket = tokio::time::timeout(target.timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(target.timeout.as_secs()))?
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e)))?;
        socket
            .set_nodelay(true)
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            check_host_key: self.host_key_checking,
        };

        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                if self.host_key_checking && matches!(e.0, russh::Error::UnknownKey) {
                    ConnectionError::HostKeyRejected(target.host.clone())
                } else {
                    ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e))
                }
            })?;

        Self::authenticate(&mut session, target).await?;
        debug!(host = %target.host, "SSH session established");
        Ok(session)
    }

    async fn authenticate(session: &mut Handle<ClientHandler>, target: &HostTarget) -> Result<(), ConnectionError> {
        let user = target.user.clone().unwrap_or_else(|| "root".to_string());

        if let Some(key_path) = &target.private_key_file {
            match Self::try_key_auth(session, &user, key_path).await {
                Ok(true) => {
                    debug!(key = %key_path.display(), "Authenticated using key");
                    return Ok(());
                }
                Ok(false) => trace!("Key rejected"),
                Err(e) => trace!(error = %e, "Key authentication attempt failed"),
            }
        }

        if let Some(password) = &target.password {
            let authenticated = session
                .authenticate_password(&user, password)
                .await
                .map_err(|_| ConnectionError::AuthenticationFailed)?;
            if authenticated {
                debug!("Authenticated using password");
                return Ok(());
            }
        }

        Err(ConnectionError::AuthenticationFailed)
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> Result<bool, ConnectionError> {
        let key_pair = load_secret_key(key_path, None)
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to load key {}: {}", key_path.display(), e)))?;
        session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|_| ConnectionError::AuthenticationFailed)
    }

    async fn exec(
        session: &Handle<ClientHandler>,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ConnectionError> {
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::Channel(format!("Failed to open channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ConnectionError::Channel(format!("Failed to execute command: {}", e)))?;

        if let Some(data) = stdin {
            let mut cursor = tokio::io::BufReader::new(data);
            channel
                .data(&mut cursor)
                .await
                .map_err(|e| ConnectionError::Channel(format!("Failed to write stdin: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| ConnectionError::Channel(format!("Failed to send EOF: {}", e)))?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // ext 1 is stderr
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput {
            rc: exit_code.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn run_on_session(
        &self,
        session: &Handle<ClientHandler>,
        target: &HostTarget,
        call: &ModuleCall,
    ) -> Result<HostOutcome, ConnectionError> {
        match call.name.as_str() {
            "ping" => {
                let out = Self::exec(session, &wrap_become("echo pong", target.become_user.as_deref()), None).await?;
                if out.rc == 0 {
                    Ok(HostOutcome::ok(json!({ "ping": "pong", "changed": false })))
                } else {
                    Ok(HostOutcome::failed(command_payload("echo pong", &out, Local::now(), Local::now())))
                }
            }
            "command" | "shell" | "raw" => {
                let cmd = module_command(&call.name, &call.args);
                let start = Local::now();
                let out = Self::exec(session, &wrap_become(&cmd, target.become_user.as_deref()), None).await?;
                let payload = command_payload(&call.args, &out, start, Local::now());
                if out.rc == 0 {
                    Ok(HostOutcome::ok(payload))
                } else {
                    Ok(HostOutcome::failed(payload))
                }
            }
            "copy" => {
                let args = match CopyArgs::parse(&call.args) {
                    Ok(args) => args,
                    Err(msg) => return Ok(HostOutcome::failed_msg(msg)),
                };
                let data = match tokio::fs::read(&args.src).await {
                    Ok(data) => data,
                    Err(e) => return Ok(HostOutcome::failed_msg(format!("could not read {}: {}", args.src, e))),
                };
                let cmd = wrap_become(&format!("cat > {}", escape_shell_arg(&args.dest)), target.become_user.as_deref());
                let out = Self::exec(session, &cmd, Some(&data)).await?;
                if out.rc == 0 {
                    Ok(HostOutcome::ok(json!({
                        "src": args.src,
                        "dest": args.dest,
                        "size": data.len(),
                        "changed": true,
                    })))
                } else {
                    Ok(HostOutcome::failed(json!({
                        "src": args.src,
                        "dest": args.dest,
                        "rc": out.rc,
                        "stderr": out.stderr,
                        "changed": false,
                        "msg": "copy failed",
                    })))
                }
            }
            other => Ok(HostOutcome::failed_msg(format!("unsupported module: {}", other))),
        }
    }
}

#[async_trait]
impl ExecutionBackend for SshBackend {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn run_module(&self, target: &HostTarget, call: &ModuleCall) -> HostOutcome {
        if !is_supported(&call.name) {
            return HostOutcome::failed_msg(format!("unsupported module: {}", call.name));
        }

        let session = match self.connect(target).await {
            Ok(session) => session,
            Err(e) => {
                debug!(host = %target.host, error = %e, "Host unreachable");
                return HostOutcome::unreachable(e);
            }
        };

        let outcome = match self.run_on_session(&session, target, call).await {
            Ok(outcome) => outcome,
            Err(e) => HostOutcome::unreachable(e),
        };

        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        outcome
    }
}

const SUPPORTED_MODULES: &[&str] = &["ping", "command", "shell", "raw", "copy"];

fn is_supported(name: &str) -> bool {
    SUPPORTED_MODULES.contains(&name)
}

/// Command line executed for `command`, `shell` and `raw`.
fn module_command(module: &str, args: &str) -> String {
    match module {
        "shell" | "raw" => format!("sh -c {}", escape_shell_arg(args)),
        _ => args.to_string(),
    }
}

/// Wrap `cmd` so it runs as `become_user` via non-interactive sudo.
fn wrap_become(cmd: &str, become_user: Option<&str>) -> String {
    match become_user {
        Some(user) => format!("sudo -n -u {} sh -c {}", user, escape_shell_arg(cmd)),
        None => cmd.to_string(),
    }
}

fn escape_shell_arg(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn command_payload(cmd: &str, out: &ExecOutput, start: DateTime<Local>, end: DateTime<Local>) -> Value {
    let mut payload = json!({
        "cmd": cmd,
        "rc": out.rc,
        "stdout": out.stdout.trim_end_matches('\n'),
        "stderr": out.stderr.trim_end_matches('\n'),
        "stdout_lines": out.stdout.lines().collect::<Vec<_>>(),
        "stderr_lines": out.stderr.lines().collect::<Vec<_>>(),
        "start": start.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        "end": end.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        "delta": format_delta(end - start),
        "changed": true,
    });
    if out.rc != 0 {
        if let Some(map) = payload.as_object_mut() {
            map.insert("msg".into(), Value::String("non-zero return code".into()));
        }
    }
    payload
}

fn format_delta(delta: chrono::Duration) -> String {
    let micros = delta.num_microseconds().unwrap_or(0).max(0);
    let secs = micros / 1_000_000;
    format!(
        "{}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        micros % 1_000_000
    )
}

#[derive(Debug, PartialEq, Eq)]
struct CopyArgs {
    src: String,
    dest: String,
}

impl CopyArgs {
    fn parse(args: &str) -> Result<Self, String> {
        let words = shell_words::split(args).map_err(|e| format!("invalid copy arguments: {}", e))?;
        let mut src = None;
        let mut dest = None;
        for word in words {
            match word.split_once('=') {
                Some(("src", v)) => src = Some(v.to_string()),
                Some(("dest", v)) => dest = Some(v.to_string()),
                _ => {}
            }
        }
        match (src, dest) {
            (Some(src), Some(dest)) if !src.is_empty() && !dest.is_empty() => Ok(Self { src, dest }),
            _ => Err("copy requires src= and dest=".to_string()),
        }
    }
}
