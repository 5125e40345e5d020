//! Installs the in-guest agent over SSH on a freshly booted VM (spec.md
//! §4.7). `ssh2` is synchronous, so the whole exchange runs on a blocking
//! thread via `tokio::task::spawn_blocking`, the same pattern the teacher
//! uses for its own blocking diesel migration runner.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use ssh2::Session;

use crate::error::{AppError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRUNCATE_LEN: usize = 500;

pub struct InstallOutcome {
    pub log: Vec<String>,
}

/// Connects with host-key verification disabled (accept-any, noted risk
/// per spec.md §4.7), detects the guest OS family from `/etc/os-release`,
/// and runs the matching package-manager install command.
pub async fn install_guest_tools(ip: String, username: String, password: String) -> Result<InstallOutcome> {
    tokio::task::spawn_blocking(move || install_guest_tools_blocking(&ip, &username, &password)).await?
}

fn install_guest_tools_blocking(ip: &str, username: &str, password: &str) -> Result<InstallOutcome> {
    let tcp = TcpStream::connect((ip, 22))
        .map_err(|err| AppError::Exec(format!("SSH connect to {ip} failed: {err}")))?;
    tcp.set_read_timeout(Some(CONNECT_TIMEOUT)).ok();

    let mut session = Session::new().map_err(|err| AppError::Exec(format!("SSH session init failed: {err}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| AppError::Exec(format!("SSH handshake with {ip} failed: {err}")))?;

    // AutoAddPolicy equivalent: no host-key verification.
    session
        .userauth_password(username, password)
        .map_err(|err| AppError::Exec(format!("SSH auth to {ip} failed: {err}")))?;

    let os_info = exec(&session, "cat /etc/os-release")?.0.to_lowercase();
    let cmd = install_command(&os_info);

    let mut log = vec![format!("Command: {cmd}")];
    let (stdout, stderr, exit_status) = exec_with_status(&session, &cmd)?;
    log.push(format!("Exit Code: {exit_status}"));
    if !stdout.is_empty() {
        log.push(format!("Stdout: {}", truncate(&stdout)));
    }
    if !stderr.is_empty() {
        log.push(format!("Stderr: {}", truncate(&stderr)));
    }

    if exit_status != 0 {
        let detail = if !stderr.trim().is_empty() { stderr.trim() } else { stdout.trim() };
        return Err(AppError::Exec(format!(
            "install command failed (exit {exit_status}): {}",
            truncate(detail)
        )));
    }

    Ok(InstallOutcome { log })
}

/// Dispatches by OS family, matching the package managers spec.md §4.7
/// names. CentOS 8 specifically needs its mirrorlist rewritten to a vault
/// mirror since its repos are long past EOL.
fn install_command(os_info: &str) -> String {
    if os_info.contains("centos") || os_info.contains("rhel") || os_info.contains("fedora") {
        let fix_repo = "if grep -q 'release 8' /etc/redhat-release 2>/dev/null; then \
            sed -i 's/mirrorlist/#mirrorlist/g' /etc/yum.repos.d/CentOS-*.repo; \
            sed -i 's|#baseurl=http://mirror.centos.org|baseurl=http://vault.centos.org|g' /etc/yum.repos.d/CentOS-*.repo; \
            fi";
        format!("{fix_repo} && yum install -y open-vm-tools && systemctl start vmtoolsd && systemctl enable vmtoolsd")
    } else if os_info.contains("ubuntu") || os_info.contains("debian") {
        "export DEBIAN_FRONTEND=noninteractive; apt-get update && apt-get install -y open-vm-tools && systemctl start vmtoolsd && systemctl enable vmtoolsd".to_string()
    } else if os_info.contains("alpine") {
        "apk add open-vm-tools && rc-service open-vm-tools start && rc-update add open-vm-tools".to_string()
    } else {
        "yum install -y open-vm-tools || apt-get install -y open-vm-tools".to_string()
    }
}

/// Truncates to at most `TRUNCATE_LEN` bytes, backing off to the nearest
/// char boundary so this never panics on a localized yum/apt message whose
/// byte 500 lands mid-codepoint (spec.md §4.7/§8).
fn truncate(s: &str) -> String {
    if s.len() <= TRUNCATE_LEN {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= TRUNCATE_LEN)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..end])
}

fn exec(session: &Session, command: &str) -> Result<(String, i32)> {
    let (stdout, _stderr, status) = exec_with_status(session, command)?;
    Ok((stdout, status))
}

fn exec_with_status(session: &Session, command: &str) -> Result<(String, String, i32)> {
    let mut channel = session
        .channel_session()
        .map_err(|err| AppError::Exec(format!("SSH channel open failed: {err}")))?;
    channel
        .exec(command)
        .map_err(|err| AppError::Exec(format!("SSH exec failed: {err}")))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|err| AppError::Exec(format!("SSH read stdout failed: {err}")))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|err| AppError::Exec(format!("SSH read stderr failed: {err}")))?;

    channel
        .wait_close()
        .map_err(|err| AppError::Exec(format!("SSH channel close failed: {err}")))?;
    let exit_status = channel
        .exit_status()
        .map_err(|err| AppError::Exec(format!("SSH exit status read failed: {err}")))?;

    Ok((stdout, stderr, exit_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centos_family_gets_vault_mirror_fix() {
        let cmd = install_command("name=\"centos linux\" version=\"8\"");
        assert!(cmd.contains("vault.centos.org"));
        assert!(cmd.contains("yum install -y open-vm-tools"));
    }

    #[test]
    fn debian_family_uses_noninteractive_apt() {
        let cmd = install_command("name=\"ubuntu\"");
        assert!(cmd.contains("DEBIAN_FRONTEND=noninteractive"));
        assert!(cmd.contains("apt-get install"));
    }

    #[test]
    fn alpine_uses_apk() {
        let cmd = install_command("name=\"alpine linux\"");
        assert!(cmd.contains("apk add"));
    }

    #[test]
    fn unknown_family_falls_back_to_yum_then_apt() {
        let cmd = install_command("name=\"some unknown distro\"");
        assert!(cmd.contains("yum install") && cmd.contains("apt-get install"));
    }

    #[test]
    fn truncate_leaves_short_strings_untouched() {
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn truncate_caps_long_strings() {
        let long = "x".repeat(600);
        assert_eq!(truncate(&long).len(), TRUNCATE_LEN + 3);
    }

    #[test]
    fn truncate_backs_off_to_char_boundary() {
        // Each "é" is 2 bytes, so byte 500 lands inside one of them.
        let long = "é".repeat(300);
        let _ = truncate(&long); // must not panic
    }
}
