//! Interpreting finished processes.
//!
//! Bundle listing parsing, artifact marker extraction and failure classification.
//! Classification is a best-effort heuristic over tool output and only chooses which
//! advice to show; it never drives state transitions.

use crate::model::{OperationKind, ProcessResult, APPS_ROOT};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn artifact_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"IPA: (.+\.ipa)").expect("valid artifact regex"))
}

/// Turn `ls` output into full bundle paths, keeping listing order.
pub fn parse_bundle_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("{APPS_ROOT}{line}/"))
        .collect()
}

/// First `IPA: <name>.ipa` marker printed by the extraction script.
pub fn parse_artifact_name(stdout: &str) -> Option<String> {
    artifact_marker()
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Advisory {
    PermissionDenied,
    HostUnreachable,
    NoSuchFile,
    CommandNotFound,
    MissingBundle,
    Generic { exit_code: i32 },
}

/// Pick the advice matching known fragments in a failed process's output.
pub fn classify_failure(result: &ProcessResult) -> Advisory {
    let stderr = result.stderr.to_lowercase();
    let stdout = result.stdout.to_lowercase();
    if stderr.contains("permission denied") {
        Advisory::PermissionDenied
    } else if stderr.contains("connection refused")
        || stderr.contains("host unreachable")
        || stderr.contains("no route to host")
    {
        Advisory::HostUnreachable
    } else if stdout.contains("application bundle directory does not exist")
        || stdout.contains("application .app directory does not exist")
    {
        Advisory::MissingBundle
    } else if stderr.contains("no such file or directory") {
        Advisory::NoSuchFile
    } else if stderr.contains("command not found") {
        Advisory::CommandNotFound
    } else {
        Advisory::Generic {
            exit_code: result.exit_code,
        }
    }
}

impl Advisory {
    /// Human-readable advice for a failure of `op`.
    pub fn message(self, op: OperationKind) -> String {
        match (self, op) {
            (Advisory::PermissionDenied, OperationKind::Execute) => {
                "Access denied. Check username/password or script file permissions on the device."
                    .into()
            }
            (Advisory::PermissionDenied, OperationKind::DownloadArtifact) => {
                "Permission denied when accessing the IPA on the device.".into()
            }
            (Advisory::PermissionDenied, _) => "Access denied. Check username and password.".into(),
            (Advisory::HostUnreachable, _) => {
                "Connection refused or host unreachable. Check the IP address and network.".into()
            }
            (Advisory::NoSuchFile, OperationKind::Transfer) => {
                "Destination directory on the device not found. Check the remote script path."
                    .into()
            }
            (Advisory::NoSuchFile, OperationKind::ListBundles) => {
                format!("Directory '{APPS_ROOT}' not found on the device.")
            }
            (Advisory::NoSuchFile, OperationKind::DownloadArtifact) => {
                "IPA file not found on the device at the expected path.".into()
            }
            (Advisory::NoSuchFile, _) => {
                "File or directory not found. Check the script and bundle paths on the device."
                    .into()
            }
            (Advisory::CommandNotFound, _) => {
                "A command was not found: ssh/scp missing locally, or the script is missing on the device."
                    .into()
            }
            (Advisory::MissingBundle, _) => {
                "Application bundle path on the device is incorrect or does not exist.".into()
            }
            (Advisory::Generic { exit_code }, op) => {
                format!("{op} failed with exit code {exit_code}.")
            }
        }
    }

    pub fn is_generic(self) -> bool {
        matches!(self, Advisory::Generic { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failed(stdout: &str, stderr: &str, exit_code: i32) -> ProcessResult {
        ProcessResult {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn listing_becomes_full_paths_in_order() {
        assert_eq!(
            parse_bundle_listing("com.foo.App\ncom.bar.App2\n"),
            vec![
                "/var/containers/Bundle/Application/com.foo.App/".to_string(),
                "/var/containers/Bundle/Application/com.bar.App2/".to_string(),
            ]
        );
    }

    #[test]
    fn listing_skips_blank_lines_and_trims() {
        assert_eq!(
            parse_bundle_listing("\n  ABC-123  \n\r\n\tDEF\n"),
            vec![
                "/var/containers/Bundle/Application/ABC-123/".to_string(),
                "/var/containers/Bundle/Application/DEF/".to_string(),
            ]
        );
        assert!(parse_bundle_listing("").is_empty());
    }

    #[test]
    fn artifact_marker_first_match_wins() {
        let out = "Packing...\nIPA: MyApp.ipa\nIPA: Other.ipa\n";
        assert_eq!(parse_artifact_name(out), Some("MyApp.ipa".into()));
    }

    #[test]
    fn artifact_marker_requires_extension() {
        assert_eq!(parse_artifact_name("IPA: MyApp.zip\n"), None);
        assert_eq!(parse_artifact_name("done\n"), None);
        assert_eq!(
            parse_artifact_name("IPA: My App 1.2.ipa  \n"),
            Some("My App 1.2.ipa".into())
        );
    }

    #[test]
    fn classifies_known_fragments() {
        assert_eq!(
            classify_failure(&failed("", "root@host: Permission denied (publickey).", 255)),
            Advisory::PermissionDenied
        );
        assert_eq!(
            classify_failure(&failed("", "ssh: connect to host x port 22: Connection refused", 255)),
            Advisory::HostUnreachable
        );
        assert_eq!(
            classify_failure(&failed("", "scp: /nope: No such file or directory", 1)),
            Advisory::NoSuchFile
        );
        assert_eq!(
            classify_failure(&failed(
                "Error: application bundle directory DOES NOT exists.",
                "",
                1
            )),
            Advisory::MissingBundle
        );
        assert_eq!(
            classify_failure(&failed("", "bash: ./x.sh: command not found", 127)),
            Advisory::CommandNotFound
        );
        assert_eq!(classify_failure(&failed("", "boom", 2)), Advisory::Generic { exit_code: 2 });
    }

    #[test]
    fn advice_depends_on_operation() {
        assert!(Advisory::NoSuchFile
            .message(OperationKind::ListBundles)
            .contains(APPS_ROOT));
        assert!(Advisory::NoSuchFile
            .message(OperationKind::Transfer)
            .starts_with("Destination directory"));
        assert_eq!(
            Advisory::Generic { exit_code: 5 }.message(OperationKind::DownloadArtifact),
            "IPA download failed with exit code 5."
        );
    }
}
