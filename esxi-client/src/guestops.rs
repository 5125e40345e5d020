use std::time::Duration;

use crate::client::VsphereClient;
use crate::error::{HypervisorError, Result};
use crate::xml::{esc, first_text};

impl VsphereClient {
    /// Upload a file into the guest through the guest-ops file-transfer
    /// channel. The URL the hypervisor returns may carry a wildcard host
    /// component (`*`); spec.md §4.1/§4.5 require rewriting it to the
    /// hypervisor's own address before the PUT.
    pub async fn guest_upload_file(
        &self,
        vm_moref: &str,
        guest_username: &str,
        guest_password: &str,
        guest_path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let params = format!(
            r#"<vm type="VirtualMachine">{vm}</vm>
               <auth xsi:type="NamePasswordAuthentication"><username>{user}</username><password>{pass}</password><interactiveSession>false</interactiveSession></auth>
               <guestFilePath>{path}</guestFilePath>
               <fileAttributes xsi:type="GuestFileAttributes"/>
               <fileSize>{size}</fileSize>
               <overwrite>true</overwrite>"#,
            vm = esc(vm_moref),
            user = esc(guest_username),
            pass = esc(guest_password),
            path = esc(guest_path),
            size = contents.len()
        );
        let response = self
            .call(
                "InitiateFileTransferToGuest",
                "GuestOperationsManager",
                "FileManager",
                &params,
            )
            .await?;
        let upload_url = first_text(&response, "returnval").ok_or_else(|| HypervisorError::Protocol {
            host: self.address.clone(),
            message: "guest file-transfer response missing upload URL".to_string(),
        })?;
        let upload_url = rewrite_wildcard_host(&upload_url, &self.address);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|source| HypervisorError::Transport {
                host: self.address.clone(),
                source,
            })?;
        http.put(&upload_url)
            .body(contents.to_vec())
            .send()
            .await
            .map_err(|source| HypervisorError::Transport {
                host: self.address.clone(),
                source,
            })?;
        Ok(())
    }

    /// Start a process inside the guest through the guest-ops process
    /// manager (e.g. `/bin/sh /tmp/opsnav-setup-eth0.sh`).
    pub async fn guest_start_program(
        &self,
        vm_moref: &str,
        guest_username: &str,
        guest_password: &str,
        program_path: &str,
        arguments: &str,
    ) -> Result<i64> {
        let params = format!(
            r#"<vm type="VirtualMachine">{vm}</vm>
               <auth xsi:type="NamePasswordAuthentication"><username>{user}</username><password>{pass}</password><interactiveSession>false</interactiveSession></auth>
               <spec xsi:type="GuestProgramSpec"><programPath>{program}</programPath><arguments>{args}</arguments></spec>"#,
            vm = esc(vm_moref),
            user = esc(guest_username),
            pass = esc(guest_password),
            program = esc(program_path),
            args = esc(arguments)
        );
        let response = self
            .call(
                "StartProgramInGuest",
                "GuestOperationsManager",
                "ProcessManager",
                &params,
            )
            .await?;
        first_text(&response, "returnval")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| HypervisorError::Protocol {
                host: self.address.clone(),
                message: "guest process start response missing pid".to_string(),
            })
    }

    /// List guest processes, used to recover the exit code of a
    /// previously started program (spec.md §4.5 step: "apply the
    /// exit-code policy").
    pub async fn guest_list_processes(
        &self,
        vm_moref: &str,
        guest_username: &str,
        guest_password: &str,
        pids: &[i64],
    ) -> Result<Vec<(i64, Option<i32>)>> {
        let pid_xml: String = pids.iter().map(|p| format!("<pids>{p}</pids>")).collect();
        let params = format!(
            r#"<vm type="VirtualMachine">{vm}</vm>
               <auth xsi:type="NamePasswordAuthentication"><username>{user}</username><password>{pass}</password><interactiveSession>false</interactiveSession></auth>
               {pid_xml}"#,
            vm = esc(vm_moref),
            user = esc(guest_username),
            pass = esc(guest_password),
            pid_xml = pid_xml
        );
        let response = self
            .call(
                "ListProcessesInGuest",
                "GuestOperationsManager",
                "ProcessManager",
                &params,
            )
            .await?;
        let blocks = crate::xml::blocks(&response, "returnval");
        Ok(blocks
            .iter()
            .map(|block| {
                let pid = first_text(block, "pid").and_then(|p| p.parse().ok()).unwrap_or(0);
                let exit_code = first_text(block, "exitCode").and_then(|c| c.parse().ok());
                (pid, exit_code)
            })
            .collect())
    }

    /// Poll `guest_list_processes` for a single pid's exit code until it
    /// appears or the deadline elapses; `None` means the process is still
    /// running.
    pub async fn wait_for_process_exit(
        &self,
        vm_moref: &str,
        guest_username: &str,
        guest_password: &str,
        pid: i64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Option<i32>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let processes = self
                .guest_list_processes(vm_moref, guest_username, guest_password, &[pid])
                .await?;
            if let Some((_, Some(code))) = processes.into_iter().find(|(p, _)| *p == pid) {
                return Ok(Some(code));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Rewrite a wildcard host component in a guest-ops transfer URL with the
/// hypervisor's own address (spec.md §4.1).
fn rewrite_wildcard_host(url: &str, host: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    if parsed.host_str() == Some("*") && parsed.set_host(Some(host)).is_ok() {
        parsed.to_string()
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_wildcard_host_with_port() {
        let url = "https://*:443/guestFile?id=1&token=abc";
        assert_eq!(
            rewrite_wildcard_host(url, "10.0.0.5"),
            "https://10.0.0.5:443/guestFile?id=1&token=abc"
        );
    }

    #[test]
    fn leaves_concrete_host_untouched() {
        let url = "https://10.0.0.5:443/guestFile?id=1";
        assert_eq!(rewrite_wildcard_host(url, "10.0.0.5"), url);
    }
}
