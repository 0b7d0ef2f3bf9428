use crate::cli::{resolve_remote_script, Cli};
use crate::model::{
    ConnectionStatus, Credentials, EngineEvent, OperationKind, Outcome, SessionSnapshot, Severity,
    DEFAULT_REMOTE_SCRIPT,
};
use crate::orchestrator::UiCommand;
use std::path::PathBuf;
use time::macros::format_description;
use time::OffsetDateTime;

const MAX_LOG_LINES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputField {
    Host,
    User,
    Port,
    Password,
    LocalScript,
    RemoteScript,
    Filter,
}

impl InputField {
    const ORDER: [InputField; 7] = [
        InputField::Host,
        InputField::User,
        InputField::Port,
        InputField::Password,
        InputField::LocalScript,
        InputField::RemoteScript,
        InputField::Filter,
    ];

    pub fn label(self) -> &'static str {
        match self {
            InputField::Host => "Host",
            InputField::User => "User",
            InputField::Port => "Port",
            InputField::Password => "Password",
            InputField::LocalScript => "Local script",
            InputField::RemoteScript => "Remote script",
            InputField::Filter => "Filter",
        }
    }

    /// Connection inputs are frozen while a session is open.
    pub fn editable(self, connected: bool) -> bool {
        !connected || matches!(self, InputField::LocalScript | InputField::Filter)
    }
}

/// Where the extraction script comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Copy a local script to the device, then run it.
    LocalScript,
    /// Run a script already on the device.
    DeviceScript,
}

impl Mechanism {
    pub fn label(self) -> &'static str {
        match self {
            Mechanism::LocalScript => "local script (transfer + run)",
            Mechanism::DeviceScript => "device script (run only)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub stamp: String,
    pub text: String,
    pub severity: Severity,
}

pub struct UiState {
    pub tab: usize,
    pub info: String,

    pub host: String,
    pub user: String,
    pub port: String,
    pub password: String,
    pub local_script: String,
    pub remote_script: String,
    pub filter: String,
    pub editing: Option<InputField>,

    pub mechanism: Mechanism,
    pub verbose: bool,

    pub session: Option<SessionSnapshot>,
    pub bundles: Vec<String>, // filtered view, as published by the coordinator
    pub bundle_total: usize,
    pub selected: usize,

    pub log: Vec<LogLine>,
    pub progress: Option<(OperationKind, u8)>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: String::new(),
            host: String::new(),
            user: "root".into(),
            port: "22".into(),
            password: String::new(),
            local_script: String::new(),
            remote_script: DEFAULT_REMOTE_SCRIPT.into(),
            filter: String::new(),
            editing: None,
            mechanism: Mechanism::DeviceScript,
            verbose: false,
            session: None,
            bundles: Vec::new(),
            bundle_total: 0,
            selected: 0,
            log: Vec::new(),
            progress: None,
        }
    }
}

impl UiState {
    /// Prefill inputs from the command line.
    pub fn from_args(args: &Cli) -> Self {
        let local_script = args
            .local_script
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            host: args.host.clone().unwrap_or_default(),
            user: args.user.clone(),
            port: args.port.to_string(),
            password: args.password.clone().unwrap_or_default(),
            remote_script: resolve_remote_script(
                args.remote_script.as_deref(),
                args.local_script.as_deref(),
            ),
            mechanism: if local_script.is_empty() {
                Mechanism::DeviceScript
            } else {
                Mechanism::LocalScript
            },
            local_script,
            filter: args.filter.clone().unwrap_or_default(),
            verbose: args.verbose,
            ..Default::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    pub fn allows(&self, op: OperationKind) -> bool {
        self.session.as_ref().is_some_and(|s| s.allows(op))
    }

    pub fn selected_bundle(&self) -> Option<&str> {
        self.bundles.get(self.selected).map(String::as_str)
    }

    pub fn push_log(&mut self, text: &str, severity: Severity) {
        let stamp = local_stamp();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.log.push(LogLine {
                stamp: stamp.clone(),
                text: line.to_string(),
                severity,
            });
        }
        if self.log.len() > MAX_LOG_LINES {
            let _ = self.log.drain(0..(self.log.len() - MAX_LOG_LINES));
        }
    }

    pub fn select_next(&mut self) {
        if self.selected + 1 < self.bundles.len() {
            self.selected += 1;
        }
    }

    pub fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn field_mut(&mut self, field: InputField) -> &mut String {
        match field {
            InputField::Host => &mut self.host,
            InputField::User => &mut self.user,
            InputField::Port => &mut self.port,
            InputField::Password => &mut self.password,
            InputField::LocalScript => &mut self.local_script,
            InputField::RemoteScript => &mut self.remote_script,
            InputField::Filter => &mut self.filter,
        }
    }

    /// Start editing the first editable field.
    pub fn begin_editing(&mut self) {
        let connected = self.is_connected();
        self.editing = InputField::ORDER
            .into_iter()
            .find(|f| f.editable(connected));
    }

    /// Move to the next (or previous) editable field.
    pub fn cycle_field(&mut self, forward: bool) {
        let Some(current) = self.editing else {
            return;
        };
        let connected = self.is_connected();
        let fields: Vec<InputField> = InputField::ORDER
            .into_iter()
            .filter(|f| f.editable(connected))
            .collect();
        let Some(pos) = fields.iter().position(|f| *f == current) else {
            self.editing = fields.first().copied();
            return;
        };
        let next = if forward {
            (pos + 1) % fields.len()
        } else {
            (pos + fields.len() - 1) % fields.len()
        };
        self.editing = Some(fields[next]);
    }

    pub fn toggle_mechanism(&mut self) {
        self.mechanism = match self.mechanism {
            Mechanism::LocalScript => Mechanism::DeviceScript,
            Mechanism::DeviceScript => Mechanism::LocalScript,
        };
        // A stock remote path follows the local file name; a custom one is left alone.
        let stock = self.remote_script.trim().is_empty()
            || self.remote_script.trim() == DEFAULT_REMOTE_SCRIPT;
        if self.mechanism == Mechanism::LocalScript && stock && !self.local_script.trim().is_empty() {
            let local = PathBuf::from(self.local_script.trim());
            self.remote_script = resolve_remote_script(None, Some(&local));
        }
        self.info = format!("Script mechanism: {}", self.mechanism.label());
    }

    pub fn connect_command(&self) -> Result<UiCommand, String> {
        let port: u16 = self
            .port
            .trim()
            .parse()
            .map_err(|_| format!("Port must be a number, got '{}'", self.port.trim()))?;
        let mut creds = Credentials::new(self.host.trim(), self.user.trim());
        creds.port = port;
        creds.secret = Some(self.password.clone()).filter(|p| !p.is_empty());
        Ok(UiCommand::Connect(creds))
    }

    /// Run the extraction against the selected bundle using the current mechanism.
    pub fn run_command(&self) -> Result<UiCommand, String> {
        let bundle_path = self
            .selected_bundle()
            .ok_or("Select a bundle first (press l to list bundles)")?
            .to_string();
        let remote_script = self.remote_script.trim().to_string();
        Ok(match self.mechanism {
            Mechanism::LocalScript => UiCommand::TransferThenExecute {
                local_path: PathBuf::from(self.local_script.trim()),
                remote_script,
                bundle_path,
            },
            Mechanism::DeviceScript => UiCommand::ExecuteOnly {
                remote_script,
                bundle_path,
            },
        })
    }

    pub fn transfer_command(&self) -> UiCommand {
        UiCommand::Transfer {
            local_path: PathBuf::from(self.local_script.trim()),
            remote_script: self.remote_script.trim().to_string(),
        }
    }

    pub fn execute_command(&self) -> Result<UiCommand, String> {
        let bundle_path = self
            .selected_bundle()
            .ok_or("Select a bundle first (press l to list bundles)")?
            .to_string();
        Ok(UiCommand::ExecuteOnly {
            remote_script: self.remote_script.trim().to_string(),
            bundle_path,
        })
    }
}

/// Fold one engine event into the UI state.
pub fn apply_event(state: &mut UiState, ev: EngineEvent) {
    match ev {
        EngineEvent::Progress { op, percent } => {
            state.progress = Some((op, percent));
        }
        EngineEvent::Log { text, severity } => {
            state.push_log(&text, severity);
        }
        EngineEvent::Completed { op, outcome, .. } => {
            state.info = match outcome {
                Outcome::Success => format!("{op} finished."),
                Outcome::Partial { warning } => warning,
            };
        }
        EngineEvent::Failed { op, message, .. } => {
            state.info = format!("{op} failed: {message}");
        }
        EngineEvent::Rejected { reason } => {
            state.push_log(&format!("Request rejected: {reason}"), Severity::Warning);
            state.info = reason;
        }
        EngineEvent::SessionChanged(snapshot) => {
            if let Some(op) = snapshot.busy {
                let starting = state.progress.map(|(p, _)| p) != Some(op);
                if starting && op == OperationKind::DownloadArtifact {
                    state.progress = Some((op, 0));
                }
            }
            if snapshot.status == ConnectionStatus::Disconnected {
                state.progress = None;
            }
            state.session = Some(snapshot);
        }
        EngineEvent::CatalogUpdated { entries, filtered } => {
            state.bundle_total = entries.len();
            state.bundles = filtered;
            if state.selected >= state.bundles.len() {
                state.selected = state.bundles.len().saturating_sub(1);
            }
        }
    }
}

fn local_stamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionQuality, ProcessResult, ToolCapabilities};
    use std::time::Duration;

    fn snapshot(status: ConnectionStatus, busy: Option<OperationKind>) -> SessionSnapshot {
        SessionSnapshot {
            status,
            artifact_available: false,
            artifact_name: None,
            capabilities: ToolCapabilities::default(),
            busy,
            allowed: Vec::new(),
        }
    }

    fn connected() -> SessionSnapshot {
        snapshot(ConnectionStatus::Connected(ConnectionQuality::Fast), None)
    }

    #[test]
    fn log_lines_are_split_and_stamped() {
        let mut state = UiState::default();
        apply_event(&mut state, EngineEvent::log("one\n\ntwo\n", Severity::Stdout));
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].text, "two");
        assert_eq!(state.log[0].stamp.len(), 8);
    }

    #[test]
    fn log_is_capped() {
        let mut state = UiState::default();
        for i in 0..(MAX_LOG_LINES + 5) {
            state.push_log(&format!("line {i}"), Severity::Info);
        }
        assert_eq!(state.log.len(), MAX_LOG_LINES);
        assert_eq!(state.log[0].text, "line 5");
    }

    #[test]
    fn catalog_update_clamps_selection() {
        let mut state = UiState {
            selected: 5,
            ..Default::default()
        };
        apply_event(
            &mut state,
            EngineEvent::CatalogUpdated {
                entries: vec!["/a/Foo/".into(), "/a/bar/".into()],
                filtered: vec!["/a/bar/".into()],
            },
        );
        assert_eq!(state.bundle_total, 2);
        assert_eq!(state.selected, 0);
        assert_eq!(state.selected_bundle(), Some("/a/bar/"));
    }

    #[test]
    fn download_start_resets_progress() {
        let mut state = UiState {
            progress: Some((OperationKind::ListBundles, 100)),
            ..Default::default()
        };
        apply_event(
            &mut state,
            EngineEvent::SessionChanged(snapshot(
                ConnectionStatus::Connected(ConnectionQuality::Slow),
                Some(OperationKind::DownloadArtifact),
            )),
        );
        assert_eq!(state.progress, Some((OperationKind::DownloadArtifact, 0)));
        apply_event(
            &mut state,
            EngineEvent::Progress {
                op: OperationKind::DownloadArtifact,
                percent: 37,
            },
        );
        assert_eq!(state.progress, Some((OperationKind::DownloadArtifact, 37)));
    }

    #[test]
    fn terminal_events_update_info() {
        let mut state = UiState::default();
        apply_event(
            &mut state,
            EngineEvent::Completed {
                op: OperationKind::Execute,
                result: Box::new(ProcessResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    elapsed: Duration::from_secs(1),
                }),
                outcome: Outcome::Partial {
                    warning: "no IPA".into(),
                },
            },
        );
        assert_eq!(state.info, "no IPA");
        apply_event(
            &mut state,
            EngineEvent::Rejected {
                reason: "busy".into(),
            },
        );
        assert_eq!(state.info, "busy");
        assert_eq!(state.log.last().map(|l| l.severity), Some(Severity::Warning));
    }

    #[test]
    fn connect_command_validates_port() {
        let mut state = UiState {
            host: " 10.0.0.2 ".into(),
            password: "alpine".into(),
            ..Default::default()
        };
        match state.connect_command() {
            Ok(UiCommand::Connect(creds)) => {
                assert_eq!(creds.target(), "root@10.0.0.2");
                assert_eq!(creds.port, 22);
                assert_eq!(creds.secret(), Some("alpine"));
            }
            other => panic!("unexpected {other:?}"),
        }
        state.port = "ssh".into();
        assert!(state.connect_command().is_err());
    }

    #[test]
    fn run_command_follows_mechanism() {
        let mut state = UiState {
            local_script: "/home/me/extract.sh".into(),
            remote_script: "/var/mobile/Documents/extract.sh".into(),
            bundles: vec!["/b/One/".into()],
            ..Default::default()
        };
        assert!(matches!(
            state.run_command(),
            Ok(UiCommand::ExecuteOnly { bundle_path, .. }) if bundle_path == "/b/One/"
        ));
        state.mechanism = Mechanism::LocalScript;
        assert!(matches!(
            state.run_command(),
            Ok(UiCommand::TransferThenExecute { local_path, .. })
                if local_path == PathBuf::from("/home/me/extract.sh")
        ));
        state.bundles.clear();
        assert!(state.run_command().is_err());
    }

    #[test]
    fn toggling_to_local_script_derives_remote_path() {
        let mut state = UiState {
            local_script: "/home/me/dump.sh".into(),
            remote_script: "/var/mobile/Documents/extract-ipa.sh".into(),
            ..Default::default()
        };
        state.toggle_mechanism();
        assert_eq!(state.mechanism, Mechanism::LocalScript);
        assert_eq!(state.remote_script, "/var/mobile/Documents/dump.sh");

        let mut custom = UiState {
            local_script: "/home/me/dump.sh".into(),
            remote_script: "/tmp/run.sh".into(),
            ..Default::default()
        };
        custom.toggle_mechanism();
        assert_eq!(custom.remote_script, "/tmp/run.sh");
    }

    #[test]
    fn connection_fields_freeze_while_connected() {
        let mut state = UiState::default();
        state.begin_editing();
        assert_eq!(state.editing, Some(InputField::Host));
        state.cycle_field(false);
        assert_eq!(state.editing, Some(InputField::Filter));

        apply_event(&mut state, EngineEvent::SessionChanged(connected()));
        state.begin_editing();
        assert_eq!(state.editing, Some(InputField::LocalScript));
        state.cycle_field(true);
        assert_eq!(state.editing, Some(InputField::Filter));
        state.cycle_field(true);
        assert_eq!(state.editing, Some(InputField::LocalScript));
    }
}
