//! Connection and artifact state for one device session.
//!
//! Only the coordinator mutates this. Workers report results and the coordinator
//! applies the matching transition.

use crate::model::{ConnectionQuality, ConnectionStatus, OperationKind, ToolCapabilities};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionState {
    status: ConnectionStatus,
    // Present exactly when an artifact is available for download.
    artifact: Option<String>,
    capabilities: ToolCapabilities,
}

impl SessionState {
    pub fn new(capabilities: ToolCapabilities) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            artifact: None,
            capabilities,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected(_))
    }

    pub fn artifact_available(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    pub fn capabilities(&self) -> ToolCapabilities {
        self.capabilities
    }

    /// A connection test was requested. Artifacts never survive a new connection.
    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
        self.artifact = None;
    }

    pub fn mark_connected(&mut self, elapsed: Duration, fast_threshold: Duration) -> ConnectionQuality {
        let quality = classify_quality(elapsed, fast_threshold);
        self.status = ConnectionStatus::Connected(quality);
        self.artifact = None;
        quality
    }

    pub fn mark_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.artifact = None;
    }

    pub fn invalidate_artifact(&mut self) {
        self.artifact = None;
    }

    /// Record the artifact produced by a successful execute step.
    ///
    /// Returns false (and records nothing) when not connected or the name is blank.
    pub fn record_artifact(&mut self, name: &str) -> bool {
        let name = name.trim();
        if !self.is_connected() || name.is_empty() {
            return false;
        }
        self.artifact = Some(name.to_string());
        true
    }

    /// Operations the current state permits, ignoring whether one is already running.
    pub fn allowed_operations(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(|op| self.allows(*op))
            .collect()
    }

    pub fn allows(&self, op: OperationKind) -> bool {
        match op {
            OperationKind::TestConnection => self.status == ConnectionStatus::Disconnected,
            OperationKind::Transfer | OperationKind::Execute | OperationKind::ListBundles => {
                self.is_connected()
            }
            OperationKind::DownloadArtifact => self.is_connected() && self.artifact_available(),
        }
    }
}

/// Connection quality is a status label only.
pub fn classify_quality(elapsed: Duration, fast_threshold: Duration) -> ConnectionQuality {
    if elapsed < fast_threshold {
        ConnectionQuality::Fast
    } else {
        ConnectionQuality::Slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(1);

    fn connected() -> SessionState {
        let mut s = SessionState::new(ToolCapabilities::default());
        s.begin_connect();
        s.mark_connected(Duration::from_millis(400), THRESHOLD);
        s
    }

    #[test]
    fn starts_disconnected_with_only_connect_allowed() {
        let s = SessionState::new(ToolCapabilities::default());
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
        assert_eq!(s.allowed_operations(), vec![OperationKind::TestConnection]);
    }

    #[test]
    fn connecting_allows_nothing() {
        let mut s = SessionState::new(ToolCapabilities::default());
        s.begin_connect();
        assert!(s.allowed_operations().is_empty());
    }

    #[test]
    fn quality_uses_threshold() {
        assert_eq!(classify_quality(Duration::from_millis(400), THRESHOLD), ConnectionQuality::Fast);
        assert_eq!(classify_quality(THRESHOLD, THRESHOLD), ConnectionQuality::Slow);
        assert_eq!(connected().status(), ConnectionStatus::Connected(ConnectionQuality::Fast));
    }

    #[test]
    fn download_requires_connection_and_artifact() {
        let mut s = connected();
        assert!(!s.allows(OperationKind::DownloadArtifact));
        assert!(s.record_artifact("MyApp.ipa"));
        assert!(s.allows(OperationKind::DownloadArtifact));
        assert!(!s.allows(OperationKind::TestConnection));
        s.invalidate_artifact();
        assert!(!s.allows(OperationKind::DownloadArtifact));
    }

    #[test]
    fn disconnect_clears_artifact_and_reconnect_starts_clean() {
        let mut s = connected();
        s.record_artifact("MyApp.ipa");
        s.mark_disconnected();
        assert!(!s.artifact_available());
        assert_eq!(s.artifact_name(), None);

        s.begin_connect();
        s.mark_connected(Duration::from_secs(2), THRESHOLD);
        assert!(!s.artifact_available());
        assert_eq!(s.status(), ConnectionStatus::Connected(ConnectionQuality::Slow));
    }

    #[test]
    fn artifact_requires_connection_and_name() {
        let mut s = SessionState::new(ToolCapabilities::default());
        assert!(!s.record_artifact("MyApp.ipa"));
        let mut s2 = connected();
        assert!(!s2.record_artifact("   "));
        assert!(!s2.artifact_available());
        s.begin_connect();
        assert!(!s.record_artifact("MyApp.ipa"));
    }
}
