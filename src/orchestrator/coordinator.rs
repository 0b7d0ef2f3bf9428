//! Operation sequencing and session bookkeeping.
//!
//! The coordinator never spawns anything itself. Entry points validate a request against
//! the session and return a [`Dispatch`] describing the process to launch; the controller
//! runs it and feeds every runner event back through [`OperationCoordinator::handle_worker`].
//! This keeps all state mutation on one task and makes the whole state machine testable
//! without a device.

use super::outcome::{classify_failure, parse_artifact_name, parse_bundle_listing};
use crate::catalog::BundleCatalog;
use crate::command::{build_command, remote_dirname, remote_join, CommandLine};
use crate::engine::RunnerEvent;
use crate::error::{LaunchError, RejectReason};
use crate::model::{
    ConnectionStatus, Credentials, EngineEvent, OperationKind, OperationRequest, Outcome,
    ProcessResult, SessionSnapshot, Severity, StreamChannel, ToolCapabilities, APPS_ROOT,
    CONNECT_SUCCESS_TOKEN, DEFAULT_REMOTE_DIR,
};
use crate::session::SessionState;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Connection tests faster than this are labelled fast.
    pub fast_threshold: Duration,
    /// Log every executed command line (secret masked).
    pub verbose: bool,
    /// Where downloads go when no explicit save path is given.
    pub save_dir: PathBuf,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fast_threshold: Duration::from_secs(1),
            verbose: false,
            save_dir: PathBuf::from("."),
        }
    }
}

/// A process the controller should launch on behalf of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: u64,
    pub op: OperationKind,
    pub command: CommandLine,
    pub track_progress: bool,
}

/// A runner event tagged with the dispatch it belongs to.
#[derive(Debug)]
pub struct WorkerMessage {
    pub id: u64,
    pub event: RunnerEvent,
}

struct InFlight {
    id: u64,
    op: OperationKind,
    // Second half of a transfer-then-execute chain.
    follow_up: Option<OperationRequest>,
    save_path: Option<PathBuf>,
}

pub struct OperationCoordinator {
    session: SessionState,
    catalog: BundleCatalog,
    credentials: Option<Credentials>,
    settings: CoordinatorSettings,
    in_flight: Option<InFlight>,
    next_id: u64,
    // Remote directory of the script that produced the current artifact.
    artifact_dir: Option<String>,
    event_tx: UnboundedSender<EngineEvent>,
}

impl OperationCoordinator {
    pub fn new(
        capabilities: ToolCapabilities,
        settings: CoordinatorSettings,
        event_tx: UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            session: SessionState::new(capabilities),
            catalog: BundleCatalog::default(),
            credentials: None,
            settings,
            in_flight: None,
            next_id: 1,
            artifact_dir: None,
            event_tx,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    #[cfg(test)]
    pub fn catalog(&self) -> &BundleCatalog {
        &self.catalog
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Operations a new request may start right now. Empty while anything is running.
    pub fn allowed_operations(&self) -> Vec<OperationKind> {
        if self.is_busy() {
            Vec::new()
        } else {
            self.session.allowed_operations()
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.session.status(),
            artifact_available: self.session.artifact_available(),
            artifact_name: self.session.artifact_name().map(str::to_string),
            capabilities: self.session.capabilities(),
            busy: self.in_flight.as_ref().map(|f| f.op),
            allowed: self.allowed_operations(),
        }
    }

    #[cfg(any(test, feature = "tui"))]
    pub fn set_verbose(&mut self, verbose: bool) {
        self.settings.verbose = verbose;
        let state = if verbose { "enabled" } else { "disabled" };
        self.emit(EngineEvent::log(format!("Verbose mode {state}."), Severity::Info));
    }

    pub fn set_filter(&mut self, text: impl Into<String>) {
        self.catalog.set_filter(text);
        self.emit_catalog();
    }

    /// Tell the user which optional tools were found at startup.
    pub fn announce_capabilities(&self) {
        let caps = self.session.capabilities();
        if caps.password_injection {
            self.emit(EngineEvent::log(
                "sshpass found. Passwords will be supplied automatically.",
                Severity::Success,
            ));
        } else {
            self.emit(EngineEvent::log(
                "sshpass not found. Password authentication may prompt on the terminal.",
                Severity::Warning,
            ));
        }
        if caps.progress_transfer {
            self.emit(EngineEvent::log(
                "rsync found. Download progress will be displayed.",
                Severity::Success,
            ));
            self.emit(EngineEvent::log(
                "rsync must also be installed on the device for progress downloads.",
                Severity::Info,
            ));
        } else {
            self.emit(EngineEvent::log(
                "rsync not found. IPA download will use scp without progress display.",
                Severity::Warning,
            ));
        }
    }

    pub fn connect(&mut self, creds: Credentials) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::TestConnection)
            .and_then(|_| self.ensure_idle())
            .and_then(|_| validate_credentials(&creds));
        self.admit(check)?;

        self.session.begin_connect();
        self.artifact_dir = None;
        self.emit(EngineEvent::log(
            format!(
                "Testing SSH connection to {} (port {})...",
                creds.target(),
                creds.port
            ),
            Severity::Info,
        ));
        self.credentials = Some(creds);
        self.launch(OperationRequest::TestConnection, None, None)
    }

    pub fn disconnect(&mut self) -> Result<(), RejectReason> {
        let check = match self.session.status() {
            ConnectionStatus::Disconnected => Err(RejectReason::NotConnected),
            ConnectionStatus::Connecting => Err(RejectReason::Connecting),
            ConnectionStatus::Connected(_) => Ok(()),
        }
        .and_then(|_| self.ensure_idle());
        self.admit(check)?;

        self.reset_session();
        tracing::info!("session disconnected");
        self.emit(EngineEvent::log("SSH connection disconnected.", Severity::Info));
        self.publish_snapshot();
        Ok(())
    }

    /// Copy a local script to the directory of `remote_script`.
    pub fn transfer(
        &mut self,
        local_path: PathBuf,
        remote_script: String,
    ) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::Transfer)
            .and_then(|_| self.ensure_idle())
            .and_then(|_| validate_remote_script(&remote_script))
            .and_then(|_| validate_local_script(&local_path));
        self.admit(check)?;

        self.launch(
            OperationRequest::Transfer {
                local_path,
                remote_script,
            },
            None,
            None,
        )
    }

    /// Transfer the script, then run it against `bundle_path` if the copy succeeded.
    pub fn transfer_then_execute(
        &mut self,
        local_path: PathBuf,
        remote_script: String,
        bundle_path: String,
    ) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::Transfer)
            .and_then(|_| self.ensure_idle())
            .and_then(|_| validate_remote_script(&remote_script))
            .and_then(|_| validate_bundle(&bundle_path))
            .and_then(|_| validate_local_script(&local_path));
        self.admit(check)?;

        let follow_up = OperationRequest::Execute {
            remote_script: remote_script.clone(),
            bundle_path,
        };
        self.launch(
            OperationRequest::Transfer {
                local_path,
                remote_script,
            },
            Some(follow_up),
            None,
        )
    }

    /// Run a script that is already on the device.
    pub fn execute_only(
        &mut self,
        remote_script: String,
        bundle_path: String,
    ) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::Execute)
            .and_then(|_| self.ensure_idle())
            .and_then(|_| validate_remote_script(&remote_script))
            .and_then(|_| validate_bundle(&bundle_path));
        self.admit(check)?;

        self.launch(
            OperationRequest::Execute {
                remote_script,
                bundle_path,
            },
            None,
            None,
        )
    }

    pub fn list_bundles(&mut self) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::ListBundles)
            .and_then(|_| self.ensure_idle());
        self.admit(check)?;

        self.launch(
            OperationRequest::ListBundles {
                listing_path: APPS_ROOT.to_string(),
            },
            None,
            None,
        )
    }

    /// Fetch the current artifact. Without a save path it lands in the configured save dir.
    pub fn download(&mut self, save_path: Option<PathBuf>) -> Result<Dispatch, RejectReason> {
        let check = self
            .ensure_allowed(OperationKind::DownloadArtifact)
            .and_then(|_| self.ensure_idle());
        self.admit(check)?;

        let name = self
            .session
            .artifact_name()
            .ok_or(RejectReason::ArtifactUnavailable)?
            .to_string();
        let dir = self.artifact_dir.as_deref().unwrap_or(DEFAULT_REMOTE_DIR);
        let artifact_path = remote_join(dir, &name);
        let save_path = save_path.unwrap_or_else(|| self.settings.save_dir.join(&name));

        if !self.session.capabilities().progress_transfer {
            self.emit(EngineEvent::log(
                "rsync unavailable; downloading without progress display.",
                Severity::Warning,
            ));
        }
        self.emit(EngineEvent::log(
            format!("Downloading {artifact_path} to {}...", save_path.display()),
            Severity::Info,
        ));
        self.launch(
            OperationRequest::DownloadArtifact {
                artifact_path,
                save_path: save_path.clone(),
            },
            None,
            Some(save_path),
        )
    }

    /// Apply one runner event. Returns the next step of a chain, if one should start.
    pub fn handle_worker(&mut self, msg: WorkerMessage) -> Option<Dispatch> {
        let Some(op) = self
            .in_flight
            .as_ref()
            .filter(|f| f.id == msg.id)
            .map(|f| f.op)
        else {
            tracing::debug!(id = msg.id, "ignoring message from a finished worker");
            return None;
        };

        match msg.event {
            RunnerEvent::Progress(percent) => {
                self.emit(EngineEvent::Progress { op, percent });
                None
            }
            RunnerEvent::Output { channel, text } => {
                let progress_noise = op == OperationKind::DownloadArtifact
                    && channel == StreamChannel::Stdout
                    && self.session.capabilities().progress_transfer
                    && !self.settings.verbose;
                let text = text.trim_end();
                if !progress_noise && !text.is_empty() {
                    self.emit(EngineEvent::log(text, channel.into()));
                }
                None
            }
            RunnerEvent::Terminal(result) => {
                let flight = self.in_flight.take()?;
                let next = self.finish(flight, result);
                self.publish_snapshot();
                next
            }
            RunnerEvent::LaunchError(err) => {
                let flight = self.in_flight.take()?;
                self.fail_launch(flight.op, err);
                self.publish_snapshot();
                None
            }
        }
    }

    fn finish(&mut self, flight: InFlight, result: ProcessResult) -> Option<Dispatch> {
        tracing::info!(
            op = %flight.op,
            exit_code = result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "operation finished"
        );
        match flight.op {
            OperationKind::TestConnection => {
                self.finish_connect(result);
                None
            }
            OperationKind::Transfer => self.finish_transfer(flight, result),
            OperationKind::Execute => {
                self.finish_execute(result);
                None
            }
            OperationKind::ListBundles => {
                self.finish_listing(result);
                None
            }
            OperationKind::DownloadArtifact => {
                self.finish_download(flight.save_path, result);
                None
            }
        }
    }

    fn finish_connect(&mut self, result: ProcessResult) {
        let op = OperationKind::TestConnection;
        if !result.success() {
            // Credentials are still needed for the sshpass hint.
            self.report_failure(op, result);
            self.reset_session();
            return;
        }
        if !result.stdout.contains(CONNECT_SUCCESS_TOKEN) {
            self.reset_session();
            let warning = format!(
                "The device answered but '{CONNECT_SUCCESS_TOKEN}' was missing from the output; staying disconnected."
            );
            self.emit(EngineEvent::log(warning.clone(), Severity::Warning));
            self.complete(op, result, Outcome::Partial { warning });
            return;
        }

        let quality = self
            .session
            .mark_connected(result.elapsed, self.settings.fast_threshold);
        tracing::info!(quality = quality.label(), "connected");
        self.emit(EngineEvent::log(
            format!(
                "SSH connection successful, {} link (Time: {:.2}s).",
                quality.label(),
                result.elapsed.as_secs_f64()
            ),
            Severity::Success,
        ));
        self.complete(op, result, Outcome::Success);
    }

    fn finish_transfer(&mut self, flight: InFlight, result: ProcessResult) -> Option<Dispatch> {
        let op = OperationKind::Transfer;
        if !result.success() {
            self.report_failure(op, result);
            return None;
        }
        self.emit(EngineEvent::log(
            format!(
                "Script transferred successfully (Time: {:.2}s).",
                result.elapsed.as_secs_f64()
            ),
            Severity::Success,
        ));
        self.complete(op, result, Outcome::Success);

        let next = flight.follow_up?;
        match self.launch(next, None, None) {
            Ok(dispatch) => Some(dispatch),
            Err(reason) => {
                self.emit(EngineEvent::Failed {
                    op: OperationKind::Execute,
                    message: reason.to_string(),
                    result: None,
                });
                None
            }
        }
    }

    fn finish_execute(&mut self, result: ProcessResult) {
        let op = OperationKind::Execute;
        if !result.success() {
            self.report_failure(op, result);
            return;
        }
        match parse_artifact_name(&result.stdout) {
            Some(name) if self.session.record_artifact(&name) => {
                tracing::info!(artifact = %name, "artifact available");
                self.emit(EngineEvent::log(
                    format!("IPA created: {name}. Ready to download."),
                    Severity::Success,
                ));
                self.complete(op, result, Outcome::Success);
            }
            _ => {
                let warning =
                    "Script finished but no 'IPA: <name>.ipa' line was found; there is nothing to download."
                        .to_string();
                self.emit(EngineEvent::log(warning.clone(), Severity::Warning));
                self.complete(op, result, Outcome::Partial { warning });
            }
        }
    }

    fn finish_listing(&mut self, result: ProcessResult) {
        let op = OperationKind::ListBundles;
        if !result.success() {
            self.report_failure(op, result);
            return;
        }
        self.catalog.replace(parse_bundle_listing(&result.stdout));
        if self.catalog.is_empty() {
            self.emit(EngineEvent::log(
                format!("No application bundles found under {APPS_ROOT}."),
                Severity::Warning,
            ));
        } else if self.catalog.filter().is_empty() {
            self.emit(EngineEvent::log(
                format!("Found {} application bundles.", self.catalog.entries().len()),
                Severity::Success,
            ));
        } else {
            self.emit(EngineEvent::log(
                format!(
                    "Found {} application bundles, {} matching '{}'.",
                    self.catalog.entries().len(),
                    self.catalog.filtered().len(),
                    self.catalog.filter()
                ),
                Severity::Success,
            ));
        }
        self.emit_catalog();
        self.complete(op, result, Outcome::Success);
    }

    fn finish_download(&mut self, save_path: Option<PathBuf>, result: ProcessResult) {
        let op = OperationKind::DownloadArtifact;
        if !result.success() {
            self.report_failure(op, result);
            return;
        }
        self.emit(EngineEvent::Progress { op, percent: 100 });
        let target = save_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.settings.save_dir.display().to_string());
        self.emit(EngineEvent::log(
            format!(
                "IPA downloaded to {target} (Time: {:.2}s).",
                result.elapsed.as_secs_f64()
            ),
            Severity::Success,
        ));
        self.complete(op, result, Outcome::Success);
    }

    fn report_failure(&mut self, op: OperationKind, result: ProcessResult) {
        let advisory = classify_failure(&result);
        tracing::warn!(op = %op, exit_code = result.exit_code, ?advisory, "operation failed");

        let message = advisory.message(op);
        if advisory.is_generic() {
            self.emit(EngineEvent::log(message.clone(), Severity::Error));
            let has_secret = self
                .credentials
                .as_ref()
                .is_some_and(|c| c.secret().is_some());
            if has_secret && !self.session.capabilities().password_injection {
                self.emit(EngineEvent::log(
                    "sshpass is not installed, so the password may have been requested on the terminal.",
                    Severity::Warning,
                ));
            }
        } else {
            self.emit(EngineEvent::log(
                format!("{op} failed with exit code {}.", result.exit_code),
                Severity::Error,
            ));
            self.emit(EngineEvent::log(message.clone(), Severity::Error));
        }
        self.emit(EngineEvent::Failed {
            op,
            message,
            result: Some(Box::new(result)),
        });
    }

    fn fail_launch(&mut self, op: OperationKind, err: LaunchError) {
        tracing::error!(op = %op, error = %err, "could not launch command");
        let message = err.to_string();
        self.emit(EngineEvent::log(message.clone(), Severity::Error));
        if self.session.status() != ConnectionStatus::Disconnected {
            self.reset_session();
            self.emit(EngineEvent::log(
                "Session reset to disconnected.",
                Severity::Warning,
            ));
        }
        self.emit(EngineEvent::Failed {
            op,
            message,
            result: None,
        });
    }

    fn complete(&self, op: OperationKind, result: ProcessResult, outcome: Outcome) {
        self.emit(EngineEvent::Completed {
            op,
            result: Box::new(result),
            outcome,
        });
    }

    fn launch(
        &mut self,
        request: OperationRequest,
        follow_up: Option<OperationRequest>,
        save_path: Option<PathBuf>,
    ) -> Result<Dispatch, RejectReason> {
        let op = request.kind();
        if matches!(
            op,
            OperationKind::Transfer | OperationKind::Execute | OperationKind::ListBundles
        ) {
            self.session.invalidate_artifact();
        }
        if let OperationRequest::Execute { remote_script, .. } = &request {
            self.artifact_dir = Some(remote_dirname(remote_script).to_string());
        }

        let creds = self.credentials.as_ref().ok_or(RejectReason::NotConnected)?;
        let caps = self.session.capabilities();
        let command = build_command(&request, creds, caps);
        let track_progress = op == OperationKind::DownloadArtifact && caps.progress_transfer;

        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(id, op = %op, command = %command.display, "launching");
        if self.settings.verbose {
            self.emit(EngineEvent::log(
                format!("Executing command: {}", command.display),
                Severity::Command,
            ));
        }

        self.in_flight = Some(InFlight {
            id,
            op,
            follow_up,
            save_path,
        });
        self.publish_snapshot();
        Ok(Dispatch {
            id,
            op,
            command,
            track_progress,
        })
    }

    fn reset_session(&mut self) {
        self.session.mark_disconnected();
        self.credentials = None;
        self.artifact_dir = None;
    }

    fn ensure_allowed(&self, op: OperationKind) -> Result<(), RejectReason> {
        if self.session.allows(op) {
            return Ok(());
        }
        Err(match (self.session.status(), op) {
            (ConnectionStatus::Connecting, _) => RejectReason::Connecting,
            (ConnectionStatus::Connected(_), OperationKind::TestConnection) => {
                RejectReason::AlreadyConnected
            }
            (ConnectionStatus::Connected(_), _) => RejectReason::ArtifactUnavailable,
            (ConnectionStatus::Disconnected, _) => RejectReason::NotConnected,
        })
    }

    fn ensure_idle(&self) -> Result<(), RejectReason> {
        match &self.in_flight {
            Some(flight) => Err(RejectReason::Busy(flight.op)),
            None => Ok(()),
        }
    }

    /// Surface a failed validation as a `Rejected` event.
    fn admit(&self, check: Result<(), RejectReason>) -> Result<(), RejectReason> {
        check.map_err(|reason| {
            tracing::warn!(%reason, "request rejected");
            self.emit(EngineEvent::Rejected {
                reason: reason.to_string(),
            });
            reason
        })
    }

    /// Emit the current session state for presentation layers.
    pub fn publish_snapshot(&self) {
        self.emit(EngineEvent::SessionChanged(self.snapshot()));
    }

    fn emit_catalog(&self) {
        self.emit(EngineEvent::CatalogUpdated {
            entries: self.catalog.entries().to_vec(),
            filtered: self.catalog.filtered().to_vec(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn validate_credentials(creds: &Credentials) -> Result<(), RejectReason> {
    if creds.host.trim().is_empty() {
        return Err(RejectReason::MissingInput("host address"));
    }
    if creds.username.trim().is_empty() {
        return Err(RejectReason::MissingInput("username"));
    }
    Ok(())
}

fn validate_remote_script(remote_script: &str) -> Result<(), RejectReason> {
    if remote_script.trim().is_empty() {
        return Err(RejectReason::MissingInput("remote script path"));
    }
    Ok(())
}

fn validate_bundle(bundle_path: &str) -> Result<(), RejectReason> {
    if bundle_path.trim().is_empty() {
        return Err(RejectReason::MissingInput("bundle path"));
    }
    Ok(())
}

fn validate_local_script(local_path: &Path) -> Result<(), RejectReason> {
    if local_path.as_os_str().is_empty() {
        return Err(RejectReason::MissingInput("local script path"));
    }
    if !local_path.is_file() {
        return Err(RejectReason::LocalFileMissing(local_path.to_path_buf()));
    }
    Ok(())
}
