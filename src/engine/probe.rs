use crate::model::ToolCapabilities;
use std::process::Stdio;
use tokio::process::Command;

/// Check once which optional local tools are usable.
pub async fn probe_capabilities() -> ToolCapabilities {
    let (password_injection, progress_transfer) = tokio::join!(
        tool_available("sshpass", &["-V"]),
        tool_available("rsync", &["--version"]),
    );
    let caps = ToolCapabilities {
        password_injection,
        progress_transfer,
    };
    tracing::info!(?caps, "probed local tool capabilities");
    caps
}

async fn tool_available(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_is_unavailable() {
        assert!(!tool_available("definitely-not-a-real-tool-7f3a", &["-V"]).await);
    }

    #[tokio::test]
    async fn failing_tool_is_unavailable() {
        assert!(!tool_available("sh", &["-c", "exit 1"]).await);
        assert!(tool_available("sh", &["-c", "exit 0"]).await);
    }
}
