use crate::engine::probe_capabilities;
use crate::model::{
    Credentials, EngineEvent, OperationKind, Outcome, ProcessResult, SessionSnapshot, Severity,
    ToolCapabilities, DEFAULT_REMOTE_DIR, DEFAULT_REMOTE_SCRIPT,
};
use crate::orchestrator::{run_controller, CoordinatorSettings, OperationCoordinator, UiCommand};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "ipa-extract",
    version,
    about = "Extract IPAs from a jailbroken iOS device over ssh/scp/rsync, with optional TUI"
)]
pub struct Cli {
    /// Device address (IP or hostname)
    #[arg(long)]
    pub host: Option<String>,

    /// SSH username on the device
    #[arg(long, default_value = "root")]
    pub user: String,

    /// SSH port on the device
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// SSH password, passed through sshpass when it is installed
    #[arg(long, env = "IPA_EXTRACT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Local extraction script to copy to the device before running it
    #[arg(long)]
    pub local_script: Option<PathBuf>,

    /// Script path on the device (defaults next to the transferred script, or the stock location)
    #[arg(long)]
    pub remote_script: Option<String>,

    /// Application bundle path on the device to extract
    #[arg(long)]
    pub bundle: Option<String>,

    /// List installed application bundles (pipeline mode)
    #[arg(long)]
    pub list_bundles: bool,

    /// Only show bundles whose path contains this text (case-insensitive)
    #[arg(long)]
    pub filter: Option<String>,

    /// Download the IPA after the script ran (pipeline mode)
    #[arg(long, requires = "bundle")]
    pub download: bool,

    /// Local directory downloaded IPAs are saved to
    #[arg(long, default_value = ".")]
    pub save_dir: PathBuf,

    /// Connections answering faster than this are shown as fast
    #[arg(long, default_value = "1s")]
    pub fast_threshold: humantime::Duration,

    /// Do not use sshpass even if it is installed
    #[arg(long)]
    pub no_sshpass: bool,

    /// Do not use rsync even if it is installed (downloads fall back to scp)
    #[arg(long)]
    pub no_rsync: bool,

    /// Log every executed command (password masked)
    #[arg(long)]
    pub verbose: bool,

    /// Print a JSON report and exit (no TUI)
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Print a text log and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Log file for the TUI (defaults to the user data directory)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Whether this run is non-interactive.
    pub fn is_pipeline(&self) -> bool {
        self.json || self.text || cfg!(not(feature = "tui"))
    }

    /// Connection details from the flags, if a host was given.
    pub fn credentials(&self) -> Option<Credentials> {
        let host = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let mut creds = Credentials::new(host, self.user.trim());
        creds.port = self.port;
        creds.secret = self.password.clone().filter(|p| !p.is_empty());
        Some(creds)
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let caps = apply_overrides(probe_capabilities().await, &args);

    if !args.is_pipeline() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args, caps).await;
        }
    }

    run_pipeline(args, caps).await
}

/// Build coordinator settings from CLI arguments.
pub fn build_settings(args: &Cli) -> CoordinatorSettings {
    CoordinatorSettings {
        fast_threshold: Duration::from(args.fast_threshold),
        verbose: args.verbose,
        save_dir: args.save_dir.clone(),
    }
}

/// Flags can switch probed tools off, never on.
pub fn apply_overrides(mut caps: ToolCapabilities, args: &Cli) -> ToolCapabilities {
    if args.no_sshpass {
        caps.password_injection = false;
    }
    if args.no_rsync {
        caps.progress_transfer = false;
    }
    caps
}

/// Where the script lives on the device.
///
/// An explicit path wins. A transferred script lands in the stock directory under its
/// own file name; otherwise the stock on-device script is used.
pub fn resolve_remote_script(remote: Option<&str>, local: Option<&Path>) -> String {
    if let Some(remote) = remote.map(str::trim).filter(|r| !r.is_empty()) {
        return remote.to_string();
    }
    local
        .and_then(|p| p.file_name())
        .map(|name| format!("{DEFAULT_REMOTE_DIR}/{}", name.to_string_lossy()))
        .unwrap_or_else(|| DEFAULT_REMOTE_SCRIPT.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum StepStatus {
    Completed,
    Partial,
    Failed,
    Rejected,
}

#[derive(Debug, Serialize)]
struct StepReport {
    op: OperationKind,
    status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ProcessResult>,
}

/// Machine-readable summary printed by `--json`.
#[derive(Debug, Serialize)]
struct PipelineReport {
    timestamp: String,
    target: String,
    port: u16,
    capabilities: ToolCapabilities,
    steps: Vec<StepReport>,
    bundles: Vec<String>,
    artifact: Option<String>,
    saved_to: Option<PathBuf>,
    log: Vec<String>,
}

/// Drives the controller one step at a time and renders what comes back.
struct Pipeline {
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    event_rx: mpsc::UnboundedReceiver<EngineEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    json: bool,
    last_progress: Option<u8>,
    session: Option<SessionSnapshot>,
    report: PipelineReport,
}

impl Pipeline {
    fn send(&self, cmd: UiCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow!("operation controller stopped unexpectedly"))
    }

    /// Send one command and wait until `until` finishes, fails or is rejected.
    async fn step(&mut self, cmd: UiCommand, until: OperationKind) -> Result<StepStatus> {
        self.send(cmd)?;
        self.last_progress = None;
        while let Some(ev) = self.event_rx.recv().await {
            match ev {
                EngineEvent::Rejected { reason } => {
                    self.print_err(format!("error: {reason}"));
                    self.record(until, StepStatus::Rejected, Some(reason), None);
                    return Ok(StepStatus::Rejected);
                }
                EngineEvent::Completed {
                    op,
                    result,
                    outcome,
                } => {
                    let (status, message) = match outcome {
                        Outcome::Success => (StepStatus::Completed, None),
                        Outcome::Partial { warning } => (StepStatus::Partial, Some(warning)),
                    };
                    self.record(op, status, message, Some(*result));
                    if op == until {
                        self.settle().await;
                        return Ok(status);
                    }
                }
                EngineEvent::Failed {
                    op,
                    message,
                    result,
                } => {
                    self.record(op, StepStatus::Failed, Some(message), result.map(|r| *r));
                    self.settle().await;
                    return Ok(StepStatus::Failed);
                }
                other => self.observe(other),
            }
        }
        bail!("operation controller stopped before {until} finished")
    }

    /// Every terminal event is followed by a fresh snapshot; wait for it.
    async fn settle(&mut self) {
        while let Some(ev) = self.event_rx.recv().await {
            let done = matches!(ev, EngineEvent::SessionChanged(_));
            self.observe(ev);
            if done {
                break;
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_connected())
    }

    fn allows(&self, op: OperationKind) -> bool {
        self.session.as_ref().is_some_and(|s| s.allows(op))
    }

    /// Handle a non-terminal event.
    fn observe(&mut self, ev: EngineEvent) {
        match ev {
            EngineEvent::Log { text, severity } => self.log(text, severity),
            EngineEvent::Progress { percent, .. } => self.progress(percent),
            EngineEvent::SessionChanged(snapshot) => {
                self.report.artifact = snapshot.artifact_name.clone();
                self.session = Some(snapshot);
            }
            EngineEvent::CatalogUpdated { filtered, .. } => {
                self.report.bundles = filtered;
            }
            EngineEvent::Rejected { reason } => self.log(reason, Severity::Warning),
            EngineEvent::Completed { .. } | EngineEvent::Failed { .. } => {}
        }
    }

    /// Consume whatever the controller emits until it shuts down.
    async fn drain(&mut self) {
        while let Some(ev) = self.event_rx.recv().await {
            self.observe(ev);
        }
    }

    fn record(
        &mut self,
        op: OperationKind,
        status: StepStatus,
        message: Option<String>,
        result: Option<ProcessResult>,
    ) {
        self.report.steps.push(StepReport {
            op,
            status,
            message,
            result,
        });
    }

    fn log(&mut self, text: String, severity: Severity) {
        if self.json {
            self.report.log.push(text);
            return;
        }
        let line = match severity {
            Severity::Command => format!("$ {text}"),
            Severity::Warning => format!("warning: {text}"),
            Severity::Error => format!("error: {text}"),
            Severity::Stdout | Severity::Stderr => text
                .lines()
                .map(|l| format!("  | {l}"))
                .collect::<Vec<_>>()
                .join("\n"),
            Severity::Info | Severity::Success => text,
        };
        self.print_err(line);
    }

    fn progress(&mut self, percent: u8) {
        let last = self.last_progress.replace(percent);
        if self.json {
            return;
        }
        // One line per 10% step keeps rsync's chatter readable.
        let crossed = match last {
            None => true,
            Some(prev) => percent / 10 > prev / 10,
        };
        if crossed {
            self.print_err(format!("Progress: {percent}%"));
        }
    }

    fn print_err(&self, line: String) {
        if !self.json {
            let _ = self.out_tx.send(OutputLine::Stderr(line));
        }
    }
}

/// Non-interactive run: connect, then list/transfer/execute/download as the flags ask.
async fn run_pipeline(args: Cli, caps: ToolCapabilities) -> Result<()> {
    let creds = args
        .credentials()
        .context("--host is required with --text/--json")?;
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")?;

    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let coordinator = OperationCoordinator::new(caps, build_settings(&args), event_tx.clone());
    coordinator.announce_capabilities();
    let controller = tokio::spawn(run_controller(coordinator, event_tx, cmd_rx));
    let (out_tx, out_handle) = spawn_output_writer();

    let mut p = Pipeline {
        cmd_tx,
        event_rx,
        out_tx,
        json: args.json,
        last_progress: None,
        session: None,
        report: PipelineReport {
            timestamp,
            target: creds.target(),
            port: creds.port,
            capabilities: caps,
            steps: Vec::new(),
            bundles: Vec::new(),
            artifact: None,
            saved_to: None,
            log: Vec::new(),
        },
    };

    let failure = run_steps(&mut p, &args, creds).await?;
    if p.is_connected() {
        p.send(UiCommand::Disconnect)?;
    }
    p.send(UiCommand::Quit)?;
    p.drain().await;
    controller.await.context("operation controller task failed")??;

    if args.json {
        let out = serde_json::to_string_pretty(&p.report)?;
        let _ = p.out_tx.send(OutputLine::Stdout(out));
    } else {
        for bundle in &p.report.bundles {
            let _ = p.out_tx.send(OutputLine::Stdout(bundle.clone()));
        }
        if let Some(path) = &p.report.saved_to {
            let _ = p.out_tx.send(OutputLine::Stderr(format!("Saved: {}", path.display())));
        }
    }

    drop(p);
    let _ = out_handle.await;

    match failure {
        Some(msg) => Err(anyhow!(msg)),
        None => Ok(()),
    }
}

/// Run the requested steps in order. Returns a failure description when a step did not succeed.
async fn run_steps(p: &mut Pipeline, args: &Cli, creds: Credentials) -> Result<Option<String>> {
    if p.step(UiCommand::Connect(creds), OperationKind::TestConnection).await?
        != StepStatus::Completed
    {
        return Ok(Some("could not connect to the device".into()));
    }

    if args.list_bundles || args.filter.is_some() {
        if let Some(filter) = &args.filter {
            p.send(UiCommand::SetFilter(filter.clone()))?;
        }
        if p.step(UiCommand::ListBundles, OperationKind::ListBundles).await?
            != StepStatus::Completed
        {
            return Ok(Some("could not list application bundles".into()));
        }
    }

    let remote_script =
        resolve_remote_script(args.remote_script.as_deref(), args.local_script.as_deref());
    let Some(bundle_path) = args.bundle.clone() else {
        if let Some(local_path) = args.local_script.clone() {
            let cmd = UiCommand::Transfer {
                local_path,
                remote_script,
            };
            if p.step(cmd, OperationKind::Transfer).await? != StepStatus::Completed {
                return Ok(Some("script transfer failed".into()));
            }
        }
        return Ok(None);
    };

    let cmd = match args.local_script.clone() {
        Some(local_path) => UiCommand::TransferThenExecute {
            local_path,
            remote_script,
            bundle_path,
        },
        None => UiCommand::ExecuteOnly {
            remote_script,
            bundle_path,
        },
    };
    match p.step(cmd, OperationKind::Execute).await? {
        StepStatus::Completed => {}
        StepStatus::Partial if !args.download => return Ok(None),
        StepStatus::Partial => return Ok(Some("the script did not report an IPA to download".into())),
        StepStatus::Failed | StepStatus::Rejected => {
            return Ok(Some("extraction script did not complete".into()))
        }
    }

    if args.download {
        if !p.allows(OperationKind::DownloadArtifact) {
            return Ok(Some("no IPA is available to download".into()));
        }
        let status = p
            .step(
                UiCommand::Download { save_path: None },
                OperationKind::DownloadArtifact,
            )
            .await?;
        if status != StepStatus::Completed {
            return Ok(Some("IPA download failed".into()));
        }
        p.report.saved_to = p.report.artifact.as_ref().map(|name| args.save_dir.join(name));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ipa-extract").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn defaults_map_to_settings() {
        let cli = parse(&[]);
        let settings = build_settings(&cli);
        assert_eq!(settings.fast_threshold, Duration::from_secs(1));
        assert!(!settings.verbose);
        assert_eq!(settings.save_dir, PathBuf::from("."));
        assert_eq!(cli.user, "root");
        assert_eq!(cli.port, 22);
    }

    #[test]
    fn humantime_threshold_is_parsed() {
        let cli = parse(&["--fast-threshold", "250ms", "--verbose", "--save-dir", "/tmp/ipas"]);
        let settings = build_settings(&cli);
        assert_eq!(settings.fast_threshold, Duration::from_millis(250));
        assert!(settings.verbose);
        assert_eq!(settings.save_dir, PathBuf::from("/tmp/ipas"));
    }

    #[test]
    fn credentials_need_a_host() {
        assert!(parse(&[]).credentials().is_none());
        assert!(parse(&["--host", "  "]).credentials().is_none());
        let creds = parse(&["--host", "10.0.0.2", "--port", "2222", "--password", "alpine"])
            .credentials()
            .unwrap();
        assert_eq!(creds.target(), "root@10.0.0.2");
        assert_eq!(creds.port, 2222);
        assert_eq!(creds.secret(), Some("alpine"));
    }

    #[test]
    fn json_and_text_conflict() {
        let res = Cli::try_parse_from(["ipa-extract", "--json", "--text"]);
        assert!(res.is_err());
    }

    #[test]
    fn download_requires_bundle() {
        assert!(Cli::try_parse_from(["ipa-extract", "--download"]).is_err());
        assert!(Cli::try_parse_from(["ipa-extract", "--download", "--bundle", "/x/"]).is_ok());
    }

    #[test]
    fn overrides_only_switch_off() {
        let all = ToolCapabilities {
            password_injection: true,
            progress_transfer: true,
        };
        let caps = apply_overrides(all, &parse(&["--no-rsync"]));
        assert!(caps.password_injection);
        assert!(!caps.progress_transfer);

        let none = apply_overrides(ToolCapabilities::default(), &parse(&[]));
        assert_eq!(none, ToolCapabilities::default());
    }

    #[test]
    fn remote_script_resolution() {
        assert_eq!(
            resolve_remote_script(Some("/tmp/run.sh"), Some(Path::new("/home/me/x.sh"))),
            "/tmp/run.sh"
        );
        assert_eq!(
            resolve_remote_script(None, Some(Path::new("/home/me/dump.sh"))),
            "/var/mobile/Documents/dump.sh"
        );
        assert_eq!(resolve_remote_script(Some(" "), None), DEFAULT_REMOTE_SCRIPT);
    }

    #[test]
    fn pipeline_mode_follows_flags() {
        assert!(parse(&["--text"]).is_pipeline());
        assert!(parse(&["--json"]).is_pipeline());
        assert_eq!(parse(&[]).is_pipeline(), cfg!(not(feature = "tui")));
    }
}
