use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Directory listed to discover installed application bundles.
pub const APPS_ROOT: &str = "/var/containers/Bundle/Application/";

/// Directory the extraction script is placed in when none is given.
pub const DEFAULT_REMOTE_DIR: &str = "/var/mobile/Documents";

/// On-device script used when no local script is transferred.
pub const DEFAULT_REMOTE_SCRIPT: &str = "/var/mobile/Documents/extract-ipa.sh";

/// Token echoed by the remote shell when the connection test succeeds.
pub const CONNECT_SUCCESS_TOKEN: &str = "Connected";

/// Connection details for the remote device.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub port: u16,
    // Never written out with reports.
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
}

impl Credentials {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: 22,
            secret: None,
        }
    }

    /// `user@host` as understood by ssh, scp and rsync.
    pub fn target(&self) -> String {
        format!("{}@{}", self.username.trim(), self.host.trim())
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("secret", &self.secret.as_ref().map(|_| "****"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    TestConnection,
    Transfer,
    Execute,
    ListBundles,
    DownloadArtifact,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::TestConnection,
        OperationKind::Transfer,
        OperationKind::Execute,
        OperationKind::ListBundles,
        OperationKind::DownloadArtifact,
    ];

    pub fn label(self) -> &'static str {
        match self {
            OperationKind::TestConnection => "SSH connection",
            OperationKind::Transfer => "Script transfer",
            OperationKind::Execute => "Script execution",
            OperationKind::ListBundles => "Bundle listing",
            OperationKind::DownloadArtifact => "IPA download",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single remote operation with the paths it needs. Built fresh for each invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationRequest {
    TestConnection,
    Transfer {
        local_path: PathBuf,
        remote_script: String,
    },
    Execute {
        remote_script: String,
        bundle_path: String,
    },
    ListBundles {
        listing_path: String,
    },
    DownloadArtifact {
        artifact_path: String,
        save_path: PathBuf,
    },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::TestConnection => OperationKind::TestConnection,
            OperationRequest::Transfer { .. } => OperationKind::Transfer,
            OperationRequest::Execute { .. } => OperationKind::Execute,
            OperationRequest::ListBundles { .. } => OperationKind::ListBundles,
            OperationRequest::DownloadArtifact { .. } => OperationKind::DownloadArtifact,
        }
    }
}

/// Optional local tools, probed once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    /// `sshpass` is available, so a password can be supplied non-interactively.
    pub password_injection: bool,
    /// `rsync` is available, so downloads can report percentage progress.
    pub progress_transfer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamChannel {
    Stdout,
    Stderr,
}

/// Everything a finished process produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Executed command lines, only shown in verbose mode.
    Command,
    Info,
    Success,
    Warning,
    Error,
    Stdout,
    Stderr,
}

impl From<StreamChannel> for Severity {
    fn from(channel: StreamChannel) -> Self {
        match channel {
            StreamChannel::Stdout => Severity::Stdout,
            StreamChannel::Stderr => Severity::Stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Fast,
    Slow,
}

impl ConnectionQuality {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionQuality::Fast => "fast",
            ConnectionQuality::Slow => "slow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected(ConnectionQuality),
}

/// Point-in-time view of the session for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub artifact_available: bool,
    pub artifact_name: Option<String>,
    pub capabilities: ToolCapabilities,
    /// Operation currently running, if any. Nothing else is accepted meanwhile.
    pub busy: Option<OperationKind>,
    pub allowed: Vec<OperationKind>,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected(_))
    }

    pub fn allows(&self, op: OperationKind) -> bool {
        self.allowed.contains(&op)
    }
}

/// How a process that exited with code 0 turned out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// The process succeeded but the expected marker was missing from its output.
    Partial { warning: String },
}

/// Events emitted by the coordinator and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    Progress {
        op: OperationKind,
        percent: u8,
    },
    Log {
        text: String,
        severity: Severity,
    },
    Completed {
        op: OperationKind,
        // Box to keep EngineEvent small; captured output can be large.
        result: Box<ProcessResult>,
        outcome: Outcome,
    },
    Failed {
        op: OperationKind,
        message: String,
        result: Option<Box<ProcessResult>>,
    },
    Rejected {
        reason: String,
    },
    SessionChanged(SessionSnapshot),
    CatalogUpdated {
        entries: Vec<String>,
        /// Entries matching the current filter text.
        filtered: Vec<String>,
    },
}

impl EngineEvent {
    pub fn log(text: impl Into<String>, severity: Severity) -> Self {
        EngineEvent::Log {
            text: text.into(),
            severity,
        }
    }
}
