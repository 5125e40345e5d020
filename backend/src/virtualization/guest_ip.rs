//! Builds and runs the in-guest IP reconfiguration script the clone
//! orchestrator uploads over the guest-ops channel (spec.md §4.5).

use std::time::Duration;

use esxi_client::VsphereClient;

use crate::error::{AppError, Result};

pub struct IpConfigRequest<'a> {
    pub nic: &'a str,
    pub ip: &'a str,
    pub netmask: &'a str,
    pub gateway: Option<&'a str>,
    pub dns: &'a [String],
}

pub struct IpConfigOutcome {
    pub success: bool,
    pub message: String,
}

const SCRIPT_EXEC_WAIT: Duration = Duration::from_secs(20);
const SCRIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upload and run the configurator script, then apply the exit-code policy
/// from spec.md §4.4/§4.5: 0 is success, 8 ("link down, config persisted")
/// is treated as success, anything else is a failure — never fatal to the
/// overall clone.
pub async fn configure(
    client: &VsphereClient,
    vm_moref: &str,
    guest_username: &str,
    guest_password: &str,
    req: &IpConfigRequest<'_>,
) -> Result<IpConfigOutcome> {
    let prefix = cidr_prefix(req.netmask)?;
    let script = render_script(req.nic, req.ip, prefix, req.gateway, req.dns);
    let guest_path = format!("/tmp/opsnav-setup-{}.sh", req.nic);

    client
        .guest_upload_file(vm_moref, guest_username, guest_password, &guest_path, script.as_bytes())
        .await?;

    let pid = client
        .guest_start_program(vm_moref, guest_username, guest_password, "/bin/sh", &guest_path)
        .await?;

    // spec.md §4.5: "wait 20s; list the pid; apply the exit-code policy" —
    // polled rather than a single check after a flat sleep so a script that
    // finishes early doesn't sit idle for the rest of the 20s window.
    let exit_code = client
        .wait_for_process_exit(
            vm_moref,
            guest_username,
            guest_password,
            pid,
            SCRIPT_POLL_INTERVAL,
            SCRIPT_EXEC_WAIT,
        )
        .await?;

    Ok(apply_exit_code_policy(exit_code))
}

fn apply_exit_code_policy(exit_code: Option<i32>) -> IpConfigOutcome {
    match exit_code {
        Some(0) => IpConfigOutcome {
            success: true,
            message: "guest IP configured".to_string(),
        },
        Some(8) => IpConfigOutcome {
            success: true,
            message: "link down, config persisted".to_string(),
        },
        Some(code) => IpConfigOutcome {
            success: false,
            message: format!("guest IP script exited {code}"),
        },
        None => IpConfigOutcome {
            success: false,
            message: "guest IP script did not report an exit code in time".to_string(),
        },
    }
}

/// Dotted netmask to CIDR prefix length; a non-contiguous mask (e.g.
/// `255.0.255.0`) cannot be expressed as a prefix and is rejected
/// (spec.md §4.5 [ADD]).
pub fn cidr_prefix(netmask: &str) -> Result<u8> {
    let octets: Vec<u8> = netmask
        .split('.')
        .map(|part| {
            part.parse::<u8>()
                .map_err(|_| AppError::Validation(format!("invalid netmask: {netmask}")))
        })
        .collect::<Result<_>>()?;
    if octets.len() != 4 {
        return Err(AppError::Validation(format!("invalid netmask: {netmask}")));
    }
    let bits = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    let prefix = bits.count_ones() as u8;
    let contiguous = prefix == 0 || bits == (u32::MAX << (32 - prefix));
    if !contiguous {
        return Err(AppError::Validation(format!(
            "netmask {netmask} does not express a contiguous CIDR prefix"
        )));
    }
    Ok(prefix)
}

fn render_script(nic: &str, ip: &str, prefix: u8, gateway: Option<&str>, dns: &[String]) -> String {
    let profile = format!("opsnav-{nic}");
    let log_path = format!("/tmp/opsnav-ip-{nic}.log");
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("LOG=\"{log_path}\"\n"));
    script.push_str("log() { echo \"$(date -u +%Y-%m-%dT%H:%M:%SZ) $1\" >> \"$LOG\"; }\n");
    script.push_str("log \"starting guest IP configuration\"\n");
    script.push_str("(systemctl start NetworkManager || service NetworkManager start) >/dev/null 2>&1 || true\n");
    script.push_str("sleep 3\n");
    script.push_str("set -e\n");
    script.push_str(&format!(
        "for c in $(nmcli -t -f NAME,DEVICE con show | awk -F: -v d=\"{nic}\" '$2==d {{print $1}}'); do\n    nmcli con delete \"$c\" >/dev/null 2>&1 || true\ndone\n"
    ));
    script.push_str(&format!(
        "nmcli con add type ethernet ifname \"{nic}\" con-name \"{profile}\" autoconnect yes\n"
    ));
    script.push_str(&format!(
        "nmcli con mod \"{profile}\" ipv4.addresses \"{ip}/{prefix}\" ipv4.method manual\n"
    ));
    if let Some(gateway) = gateway {
        script.push_str(&format!("nmcli con mod \"{profile}\" ipv4.gateway \"{gateway}\"\n"));
    }
    if !dns.is_empty() {
        let joined = dns.join(" ");
        script.push_str(&format!(
            "nmcli con mod \"{profile}\" ipv4.dns \"{joined}\" ipv4.ignore-auto-dns yes\n"
        ));
    }
    script.push_str("nmcli con reload\n");
    script.push_str(&format!("log \"activating {profile}\"\n"));
    script.push_str(&format!("nmcli con down \"{profile}\" >/dev/null 2>&1 || true\n"));
    script.push_str(&format!("nmcli con up \"{profile}\" >/dev/null 2>&1 || true\n"));
    script.push_str("log \"guest IP configuration complete\"\n");
    script.push_str("exit 0\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_prefix_common_masks() {
        assert_eq!(cidr_prefix("255.255.255.0").unwrap(), 24);
        assert_eq!(cidr_prefix("255.255.0.0").unwrap(), 16);
        assert_eq!(cidr_prefix("255.255.255.255").unwrap(), 32);
        assert_eq!(cidr_prefix("0.0.0.0").unwrap(), 0);
    }

    #[test]
    fn cidr_prefix_rejects_non_contiguous_mask() {
        assert!(cidr_prefix("255.0.255.0").is_err());
    }

    #[test]
    fn cidr_prefix_rejects_malformed_octet() {
        assert!(cidr_prefix("255.255.256.0").is_err());
        assert!(cidr_prefix("255.255.0").is_err());
    }

    #[test]
    fn exit_code_zero_is_success() {
        let outcome = apply_exit_code_policy(Some(0));
        assert!(outcome.success);
    }

    #[test]
    fn exit_code_eight_is_tolerated_as_success() {
        let outcome = apply_exit_code_policy(Some(8));
        assert!(outcome.success);
    }

    #[test]
    fn other_nonzero_exit_code_is_failure() {
        let outcome = apply_exit_code_policy(Some(1));
        assert!(!outcome.success);
    }

    #[test]
    fn missing_exit_code_is_failure() {
        let outcome = apply_exit_code_policy(None);
        assert!(!outcome.success);
    }

    #[test]
    fn script_contains_expected_nmcli_calls() {
        let script = render_script("eth0", "10.0.0.77", 24, Some("10.0.0.1"), &["8.8.8.8".to_string()]);
        assert!(script.contains("con-name \"opsnav-eth0\""));
        assert!(script.contains("ipv4.addresses \"10.0.0.77/24\""));
        assert!(script.contains("ipv4.gateway \"10.0.0.1\""));
        assert!(script.contains("ipv4.dns \"8.8.8.8\""));
        assert!(script.trim_end().ends_with("exit 0"));
    }
}
