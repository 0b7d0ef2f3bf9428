use crate::model::OperationKind;
use std::path::PathBuf;
use thiserror::Error;

/// Why the coordinator refused a request before launching anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("not connected; connect to the device first")]
    NotConnected,

    #[error("a connection test is already in progress")]
    Connecting,

    #[error("already connected; disconnect first")]
    AlreadyConnected,

    #[error("{0} is already in progress")]
    Busy(OperationKind),

    #[error("no IPA is available yet; run the extraction script first")]
    ArtifactUnavailable,

    #[error("missing input: {0}")]
    MissingInput(&'static str),

    #[error("local file does not exist: {}", .0.display())]
    LocalFileMissing(PathBuf),
}

/// The process could not be started or observed. No exit status exists.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("command not found: `{0}`. Make sure ssh, scp, rsync (and sshpass for passwords) are installed and in your PATH")]
    NotFound(String),

    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),
}
