use super::progress::{ProgressScanner, Utf8Carry};
use crate::error::LaunchError;
use crate::model::{ProcessResult, StreamChannel};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8192;

#[derive(Debug)]
pub enum RunnerEvent {
    Progress(u8),
    Output { channel: StreamChannel, text: String },
    Terminal(ProcessResult),
    LaunchError(LaunchError),
}

/// Runs one shell command line and reports what happens over a channel.
///
/// Every run ends with exactly one `Terminal` or `LaunchError` event.
pub struct ProcessRunner {
    command_line: String,
    track_progress: bool,
}

impl ProcessRunner {
    pub fn new(command_line: impl Into<String>, track_progress: bool) -> Self {
        Self {
            command_line: command_line.into(),
            track_progress,
        }
    }

    pub async fn run(self, event_tx: mpsc::UnboundedSender<RunnerEvent>) {
        let event = match self.execute(&event_tx).await {
            Ok(result) => {
                tracing::debug!(
                    exit_code = result.exit_code,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "process finished"
                );
                RunnerEvent::Terminal(result)
            }
            Err(err) => {
                tracing::warn!(error = %err, "process launch failed");
                RunnerEvent::LaunchError(err)
            }
        };
        let _ = event_tx.send(event);
    }

    async fn execute(
        &self,
        event_tx: &mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<ProcessResult, LaunchError> {
        let program = self
            .command_line
            .split_whitespace()
            .next()
            .ok_or(LaunchError::EmptyCommand)?;
        // The shell would report a missing program as exit 127, which is
        // indistinguishable from a remote command that was not found.
        if locate_executable(program).is_none() {
            return Err(LaunchError::NotFound(program.to_string()));
        }

        let start = Instant::now();
        let mut child = shell_command(&self.command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(LaunchError::Spawn)?;

        let stdout_task = tokio::spawn(pump(
            child.stdout.take(),
            StreamChannel::Stdout,
            self.track_progress,
            event_tx.clone(),
        ));
        let stderr_task = tokio::spawn(pump(
            child.stderr.take(),
            StreamChannel::Stderr,
            false,
            event_tx.clone(),
        ));

        let (stdout, stderr, status) = tokio::join!(stdout_task, stderr_task, child.wait());
        let status = status.map_err(LaunchError::Wait)?;
        let elapsed = start.elapsed();

        Ok(ProcessResult {
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
            exit_code: exit_code(status),
            elapsed,
        })
    }
}

/// Read a stream to EOF, forwarding each decoded chunk and returning the whole text.
async fn pump<R>(
    reader: Option<R>,
    channel: StreamChannel,
    track_progress: bool,
    event_tx: mpsc::UnboundedSender<RunnerEvent>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let Some(mut reader) = reader else {
        return captured;
    };
    let mut carry = Utf8Carry::default();
    let mut scanner = track_progress.then(ProgressScanner::default);
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(?channel, error = %err, "stream read failed");
                break;
            }
        };
        let text = carry.decode(&buf[..n]);
        forward(&text, channel, scanner.as_mut(), &event_tx);
        captured.push_str(&text);
    }
    let rest = carry.finish();
    forward(&rest, channel, scanner.as_mut(), &event_tx);
    captured.push_str(&rest);
    captured
}

fn forward(
    text: &str,
    channel: StreamChannel,
    scanner: Option<&mut ProgressScanner>,
    event_tx: &mpsc::UnboundedSender<RunnerEvent>,
) {
    if text.is_empty() {
        return;
    }
    let _ = event_tx.send(RunnerEvent::Output {
        channel,
        text: text.to_string(),
    });
    if let Some(percent) = scanner.and_then(|s| s.feed(text)) {
        let _ = event_tx.send(RunnerEvent::Progress(percent));
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Resolve a program name the way the shell would, via `PATH`.
pub(crate) fn locate_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        executable_names(program)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|p| is_executable(p))
    })
}

#[cfg(unix)]
fn executable_names(program: &str) -> Vec<String> {
    vec![program.to_string()]
}

#[cfg(windows)]
fn executable_names(program: &str) -> Vec<String> {
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".into());
    std::iter::once(program.to_string())
        .chain(exts.split(';').map(|ext| format!("{program}{ext}")))
        .collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(command: &str, track_progress: bool) -> Vec<RunnerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ProcessRunner::new(command, track_progress).run(tx).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn terminal_count(events: &[RunnerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RunnerEvent::Terminal(_) | RunnerEvent::LaunchError(_)))
            .count()
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let events = collect("sh -c 'echo out; echo err 1>&2; exit 3'", false).await;
        assert_eq!(terminal_count(&events), 1);
        match events.last() {
            Some(RunnerEvent::Terminal(result)) => {
                assert_eq!(result.stdout, "out\n");
                assert_eq!(result.stderr, "err\n");
                assert_eq!(result.exit_code, 3);
            }
            other => panic!("expected terminal event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_output_before_terminal() {
        let events = collect("printf 'line one\\n'", false).await;
        let first_output = events
            .iter()
            .position(|e| matches!(e, RunnerEvent::Output { channel: StreamChannel::Stdout, .. }));
        let terminal = events
            .iter()
            .position(|e| matches!(e, RunnerEvent::Terminal(_)));
        assert!(first_output.is_some());
        assert!(first_output < terminal);
    }

    #[tokio::test]
    async fn reports_progress_when_tracking() {
        let events = collect("printf '10%%\\n55%%\\n'", true).await;
        let last_progress = events.iter().rev().find_map(|e| match e {
            RunnerEvent::Progress(p) => Some(*p),
            _ => None,
        });
        assert_eq!(last_progress, Some(55));
    }

    #[tokio::test]
    async fn progress_token_split_across_reads_is_joined() {
        let events = collect("sh -c 'printf 2; sleep 0.2; printf \"5%%\\n\"'", true).await;
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![25]);
    }

    #[tokio::test]
    async fn no_progress_without_tracking_or_for_malformed_tokens() {
        let untracked = collect("printf '10%%\\n'", false).await;
        assert!(!untracked.iter().any(|e| matches!(e, RunnerEvent::Progress(_))));

        let malformed = collect("printf '%%50 12percent\\n'", true).await;
        assert!(!malformed.iter().any(|e| matches!(e, RunnerEvent::Progress(_))));
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_error_only() {
        let events = collect("definitely-not-a-real-tool-7f3a --version", false).await;
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(
            events.last(),
            Some(RunnerEvent::LaunchError(LaunchError::NotFound(name)))
                if name == "definitely-not-a-real-tool-7f3a"
        ));
        assert!(!events.iter().any(|e| matches!(e, RunnerEvent::Terminal(_))));
    }

    #[tokio::test]
    async fn empty_command_is_a_launch_error() {
        let events = collect("   ", false).await;
        assert!(matches!(
            events.as_slice(),
            [RunnerEvent::LaunchError(LaunchError::EmptyCommand)]
        ));
    }

    #[tokio::test]
    async fn concurrent_runs_are_isolated() {
        let (a, b) = tokio::join!(
            collect("sh -c 'sleep 0.1; echo a'", false),
            collect("echo b", false)
        );
        let stdout = |events: &[RunnerEvent]| match events.last() {
            Some(RunnerEvent::Terminal(r)) => r.stdout.clone(),
            _ => String::new(),
        };
        assert_eq!(stdout(&a), "a\n");
        assert_eq!(stdout(&b), "b\n");
    }

    #[test]
    fn locates_shell_on_path() {
        assert!(locate_executable("sh").is_some());
        assert!(locate_executable("definitely-not-a-real-tool-7f3a").is_none());
    }
}
