//! Command-line construction for the remote toolchain.
//!
//! Pure functions: nothing here touches the filesystem or spawns processes.

use crate::model::{Credentials, OperationRequest, ToolCapabilities, CONNECT_SUCCESS_TOKEN};

/// A shell command line plus a form that is safe to show or log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub line: String,
    /// Same command with the password masked.
    pub display: String,
}

/// Map an operation to the ssh/scp/rsync invocation that performs it.
pub fn build_command(
    request: &OperationRequest,
    creds: &Credentials,
    caps: ToolCapabilities,
) -> CommandLine {
    let target = creds.target();
    let port = creds.port;
    let base = match request {
        OperationRequest::TestConnection => format!(
            "ssh -p {port} {target} {}",
            shell_quote(&format!("echo {CONNECT_SUCCESS_TOKEN}"))
        ),
        OperationRequest::Transfer {
            local_path,
            remote_script,
        } => format!(
            "scp -P {port} {} {target}:{}",
            shell_quote(&local_path.to_string_lossy()),
            shell_quote(remote_dirname(remote_script))
        ),
        OperationRequest::Execute {
            remote_script,
            bundle_path,
        } => {
            let script = format!("./{}", remote_basename(remote_script));
            let remote = format!(
                "cd {dir} && chmod +x {script} && {script} {bundle}",
                dir = shell_quote(remote_dirname(remote_script)),
                script = shell_quote(&script),
                bundle = shell_quote(bundle_path),
            );
            format!("ssh -p {port} {target} {}", shell_quote(&remote))
        }
        OperationRequest::ListBundles { listing_path } => format!(
            "ssh -p {port} {target} {}",
            shell_quote(&format!("ls {}", shell_quote(listing_path)))
        ),
        OperationRequest::DownloadArtifact {
            artifact_path,
            save_path,
        } => {
            let save = shell_quote(&save_path.to_string_lossy());
            if caps.progress_transfer {
                format!(
                    "rsync -avz --info=progress2 -e {} {target}:{} {save}",
                    shell_quote(&format!("ssh -p {port}")),
                    shell_quote(artifact_path),
                )
            } else {
                format!(
                    "scp -P {port} {target}:{} {save}",
                    shell_quote(artifact_path)
                )
            }
        }
    };

    match creds.secret() {
        Some(secret) if caps.password_injection => CommandLine {
            line: format!("sshpass -p {} {base}", shell_quote(secret)),
            display: format!("sshpass -p '****' {base}"),
        },
        _ => CommandLine {
            line: base.clone(),
            display: base,
        },
    }
}

/// Quote a string for a POSIX shell.
///
/// Plain words are returned as-is; anything else is wrapped in single quotes with
/// embedded single quotes escaped.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let plain = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ',' | ':' | '@' | '+' | '=')
    };
    if s.chars().all(plain) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Directory part of a remote (POSIX) path, `dirname` style.
pub fn remote_dirname(path: &str) -> &str {
    let head = match path.rfind('/') {
        Some(i) => &path[..=i],
        None => return "",
    };
    let trimmed = head.trim_end_matches('/');
    if trimmed.is_empty() {
        // Root, possibly written as several slashes.
        head
    } else {
        trimmed
    }
}

/// Final component of a remote (POSIX) path.
pub fn remote_basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Join a remote directory and a file name.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::APPS_ROOT;
    use std::path::PathBuf;

    fn creds() -> Credentials {
        Credentials::new("192.168.1.20", "root")
    }

    fn caps(password_injection: bool, progress_transfer: bool) -> ToolCapabilities {
        ToolCapabilities {
            password_injection,
            progress_transfer,
        }
    }

    #[test]
    fn test_connection_echoes_success_token() {
        let cmd = build_command(&OperationRequest::TestConnection, &creds(), caps(false, false));
        assert_eq!(cmd.line, "ssh -p 22 root@192.168.1.20 'echo Connected'");
        assert_eq!(cmd.display, cmd.line);
    }

    #[test]
    fn transfer_targets_script_directory() {
        let req = OperationRequest::Transfer {
            local_path: PathBuf::from("/home/me/extract ipa.sh"),
            remote_script: "/var/mobile/Documents/extract-ipa.sh".into(),
        };
        let cmd = build_command(&req, &creds(), caps(false, false));
        assert_eq!(
            cmd.line,
            "scp -P 22 '/home/me/extract ipa.sh' root@192.168.1.20:/var/mobile/Documents"
        );
    }

    #[test]
    fn execute_changes_directory_marks_executable_and_passes_bundle() {
        let req = OperationRequest::Execute {
            remote_script: "/var/mobile/Documents/extract-ipa.sh".into(),
            bundle_path: "/var/containers/Bundle/Application/ABC/".into(),
        };
        let cmd = build_command(&req, &creds(), caps(false, false));
        assert_eq!(
            cmd.line,
            "ssh -p 22 root@192.168.1.20 'cd /var/mobile/Documents && chmod +x ./extract-ipa.sh && ./extract-ipa.sh /var/containers/Bundle/Application/ABC/'"
        );
    }

    #[test]
    fn execute_quotes_nested_arguments() {
        let req = OperationRequest::Execute {
            remote_script: "/tmp/x.sh".into(),
            bundle_path: "/apps/My App/".into(),
        };
        let cmd = build_command(&req, &creds(), caps(false, false));
        assert_eq!(
            cmd.line,
            r#"ssh -p 22 root@192.168.1.20 'cd /tmp && chmod +x ./x.sh && ./x.sh '\''/apps/My App/'\'''"#
        );
    }

    #[test]
    fn list_bundles_lists_apps_root() {
        let req = OperationRequest::ListBundles {
            listing_path: APPS_ROOT.into(),
        };
        let cmd = build_command(&req, &creds(), caps(false, false));
        assert_eq!(
            cmd.line,
            "ssh -p 22 root@192.168.1.20 'ls /var/containers/Bundle/Application/'"
        );
    }

    #[test]
    fn download_prefers_rsync_with_progress() {
        let req = OperationRequest::DownloadArtifact {
            artifact_path: "/var/mobile/Documents/MyApp.ipa".into(),
            save_path: PathBuf::from("./MyApp.ipa"),
        };
        let with_rsync = build_command(&req, &creds(), caps(false, true));
        assert_eq!(
            with_rsync.line,
            "rsync -avz --info=progress2 -e 'ssh -p 22' root@192.168.1.20:/var/mobile/Documents/MyApp.ipa ./MyApp.ipa"
        );
        let fallback = build_command(&req, &creds(), caps(false, false));
        assert_eq!(
            fallback.line,
            "scp -P 22 root@192.168.1.20:/var/mobile/Documents/MyApp.ipa ./MyApp.ipa"
        );
    }

    #[test]
    fn secret_is_injected_only_when_supported() {
        let mut creds = creds();
        creds.secret = Some("alp'ine".into());

        let injected = build_command(&OperationRequest::TestConnection, &creds, caps(true, false));
        assert_eq!(
            injected.line,
            r#"sshpass -p 'alp'\''ine' ssh -p 22 root@192.168.1.20 'echo Connected'"#
        );
        assert!(!injected.display.contains("alp"));
        assert!(injected.display.starts_with("sshpass -p '****' ssh"));

        let plain = build_command(&OperationRequest::TestConnection, &creds, caps(false, false));
        assert_eq!(plain.line, "ssh -p 22 root@192.168.1.20 'echo Connected'");
    }

    #[test]
    fn empty_secret_is_not_injected() {
        let mut creds = creds();
        creds.secret = Some(String::new());
        let cmd = build_command(&OperationRequest::TestConnection, &creds, caps(true, true));
        assert!(!cmd.line.starts_with("sshpass"));
    }

    #[test]
    fn custom_port_is_used_everywhere() {
        let mut creds = creds();
        creds.port = 2222;
        let ssh = build_command(&OperationRequest::TestConnection, &creds, caps(false, false));
        assert!(ssh.line.starts_with("ssh -p 2222 "));
        let scp = build_command(
            &OperationRequest::Transfer {
                local_path: PathBuf::from("a.sh"),
                remote_script: "/tmp/a.sh".into(),
            },
            &creds,
            caps(false, false),
        );
        assert!(scp.line.starts_with("scp -P 2222 "));
    }

    #[test]
    fn remote_path_helpers_follow_posix_dirname() {
        assert_eq!(remote_dirname("/var/mobile/Documents/extract-ipa.sh"), "/var/mobile/Documents");
        assert_eq!(remote_dirname("/extract-ipa.sh"), "/");
        assert_eq!(remote_dirname("extract-ipa.sh"), "");
        assert_eq!(remote_basename("/var/mobile/Documents/extract-ipa.sh"), "extract-ipa.sh");
        assert_eq!(remote_basename("extract-ipa.sh"), "extract-ipa.sh");
        assert_eq!(remote_join("/var/mobile/Documents", "MyApp.ipa"), "/var/mobile/Documents/MyApp.ipa");
        assert_eq!(remote_join("/", "MyApp.ipa"), "/MyApp.ipa");
        assert_eq!(remote_join("", "MyApp.ipa"), "MyApp.ipa");
    }

    #[test]
    fn shell_quote_leaves_plain_words() {
        assert_eq!(shell_quote("/var/mobile"), "/var/mobile");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }
}
