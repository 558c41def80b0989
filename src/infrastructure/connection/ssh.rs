//! SSH session handling for cluster nodes.
//!
//! Sessions go through the system `ssh` binary with ControlMaster
//! multiplexing: `connect` starts a persistent master process, `exec` reuses
//! its socket, and the liveness probe is `ssh -O check`. Local, docker, and
//! kubernetes nodes are reached through the matching exec wrapper instead of
//! a master connection.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("ssh master connection to {target} failed: {stderr}")]
    MasterFailed { target: String, stderr: String },

    #[error("command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("command output is not valid utf-8")]
    InvalidOutput(#[from] std::string::FromUtf8Error),
}

/// How a node is reached. Mirrors the cluster config's `access` field.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum NodeAccess {
    #[default]
    Remote,
    Local,
    Docker {
        container: String,
    },
    Kubernetes {
        namespace: String,
        pod: String,
    },
}

/// A single cluster node as declared in the cluster config file.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub access: NodeAccess,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl NodeConfig {
    pub fn key(&self) -> NodeKey {
        match &self.access {
            NodeAccess::Remote => NodeKey::Ssh {
                host: self.host.clone(),
                port: self.ssh_port,
            },
            NodeAccess::Local => NodeKey::Local,
            NodeAccess::Docker { container } => NodeKey::Docker {
                container: container.clone(),
            },
            NodeAccess::Kubernetes { namespace, pod } => NodeKey::Kubernetes {
                namespace: namespace.clone(),
                pod: pod.clone(),
            },
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}

/// Partitioning key for the SSH pool. One sub-pool per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    Local,
    Ssh { host: String, port: u16 },
    Docker { container: String },
    Kubernetes { namespace: String, pod: String },
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Local => write!(f, "local"),
            NodeKey::Ssh { host, port } => write!(f, "ssh:{host}:{port}"),
            NodeKey::Docker { container } => write!(f, "docker:{container}"),
            NodeKey::Kubernetes { namespace, pod } => write!(f, "k8s:{namespace}:{pod}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// An exclusively-owned shell session against one node.
///
/// While leased from the pool the caller is the only owner; returning it via
/// `SshConnectionPool::release` hands ownership back.
#[async_trait]
pub trait SshSession: Send + Sync {
    fn key(&self) -> &NodeKey;

    /// Run a command on the node and capture its output.
    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Cheap liveness probe used before a pooled session is reused.
    async fn is_alive(&self) -> bool;

    /// Tear the session down. Errors are logged by callers, never propagated.
    async fn close(&self) -> Result<(), SshError>;
}

/// Constructs sessions for the pool. The production implementation shells out
/// to `ssh`; tests substitute a fake.
#[async_trait]
pub trait SshSessionFactory: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn SshSession>, SshError>;
}

/// Production session over the system `ssh` binary.
pub struct SystemSshSession {
    key: NodeKey,
    node: NodeConfig,
    /// ControlMaster socket path, present only for remote nodes.
    control_path: Option<PathBuf>,
}

impl SystemSshSession {
    fn destination(&self) -> String {
        match &self.node.user {
            Some(user) => format!("{}@{}", user, self.node.host),
            None => self.node.host.clone(),
        }
    }

    fn base_ssh_args(&self, control_path: Option<&PathBuf>) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.node.connect_timeout().as_secs()),
            "-p".to_string(),
            self.node.ssh_port.to_string(),
        ];
        if let Some(control_path) = control_path {
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", control_path.display()));
        }
        if let Some(key_path) = &self.node.key_path {
            args.push("-i".to_string());
            args.push(key_path.display().to_string());
        }
        args
    }

    /// Build the program and arguments that run `command` on this node.
    fn exec_command(&self, command: &str) -> (String, Vec<String>) {
        match &self.node.access {
            NodeAccess::Remote => {
                let mut args = self.base_ssh_args(self.control_path.as_ref());
                args.push(self.destination());
                args.push(command.to_string());
                ("ssh".to_string(), args)
            }
            NodeAccess::Local => (
                "sh".to_string(),
                vec!["-c".to_string(), command.to_string()],
            ),
            NodeAccess::Docker { container } => (
                "docker".to_string(),
                vec![
                    "exec".to_string(),
                    container.clone(),
                    "sh".to_string(),
                    "-c".to_string(),
                    command.to_string(),
                ],
            ),
            NodeAccess::Kubernetes { namespace, pod } => (
                "kubectl".to_string(),
                vec![
                    "exec".to_string(),
                    "-n".to_string(),
                    namespace.clone(),
                    pod.clone(),
                    "--".to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    command.to_string(),
                ],
            ),
        }
    }

    async fn run(program: &str, args: &[String]) -> Result<CommandOutput, SshError> {
        debug!("running: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SshError::Spawn {
                command: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8(output.stdout)?,
            stderr: String::from_utf8(output.stderr)?,
            status: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl SshSession for SystemSshSession {
    fn key(&self) -> &NodeKey {
        &self.key
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let (program, args) = self.exec_command(command);
        let output = Self::run(&program, &args).await?;
        if output.status != 0 {
            return Err(SshError::CommandFailed {
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    async fn is_alive(&self) -> bool {
        match &self.control_path {
            Some(control_path) => {
                // `ssh -O check` exits 0 while the master is up.
                let args = vec![
                    "-o".to_string(),
                    format!("ControlPath={}", control_path.display()),
                    "-O".to_string(),
                    "check".to_string(),
                    self.destination(),
                ];
                matches!(Self::run("ssh", &args).await, Ok(out) if out.status == 0)
            }
            // Exec-wrapper sessions hold no persistent state; probe with a
            // no-op command.
            None => self.exec("true").await.is_ok(),
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        if let Some(control_path) = &self.control_path {
            let args = vec![
                "-o".to_string(),
                format!("ControlPath={}", control_path.display()),
                "-O".to_string(),
                "exit".to_string(),
                self.destination(),
            ];
            let output = Self::run("ssh", &args).await?;
            if output.status != 0 {
                warn!(
                    "ssh master for {} did not exit cleanly: {}",
                    self.key, output.stderr
                );
            }
        }
        Ok(())
    }
}

/// One socket per session, not per node. The pool leases several sessions
/// against the same key concurrently; if they shared a socket, a second
/// `ssh -M` would silently disable multiplexing and closing any one session
/// would kill the master every sibling routes through.
fn control_socket_path(key: &NodeKey) -> PathBuf {
    static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);
    let slug = key
        .to_string()
        .replace([':', '/', '@'], "-")
        .replace(|c: char| c.is_whitespace(), "");
    let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "clusterdoc-{}-{}-{}.sock",
        slug,
        std::process::id(),
        seq
    ))
}

/// Factory that starts ControlMaster-backed sessions.
pub struct SystemSshFactory;

#[async_trait]
impl SshSessionFactory for SystemSshFactory {
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn SshSession>, SshError> {
        let key = node.key();
        let control_path = match node.access {
            NodeAccess::Remote => {
                let control_path = control_socket_path(&key);
                let session = SystemSshSession {
                    key: key.clone(),
                    node: node.clone(),
                    control_path: Some(control_path.clone()),
                };
                // Start the persistent master: -M master, -N no command,
                // -f background after auth.
                let mut args = session.base_ssh_args(Some(&control_path));
                args.extend([
                    "-o".to_string(),
                    "ControlMaster=yes".to_string(),
                    "-M".to_string(),
                    "-N".to_string(),
                    "-f".to_string(),
                    session.destination(),
                ]);
                let output = SystemSshSession::run("ssh", &args).await?;
                if output.status != 0 {
                    return Err(SshError::MasterFailed {
                        target: key.to_string(),
                        stderr: output.stderr,
                    });
                }
                return Ok(Box::new(session));
            }
            _ => None,
        };

        Ok(Box::new(SystemSshSession {
            key,
            node: node.clone(),
            control_path,
        }))
    }
}
