use serde::{Deserialize, Serialize};

/// Ways callers may describe the VM they want `find_vm` to resolve, tried
/// in the fixed order spec.md §4.1 requires: instance UUID, BIOS UUID,
/// primary IP, then DNS name.
#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub instance_uuid: Option<String>,
    pub bios_uuid: Option<String>,
    pub ip: Option<String>,
    pub name: Option<String>,
}

impl VmDescriptor {
    pub fn by_instance_uuid(uuid: impl Into<String>) -> Self {
        Self {
            instance_uuid: Some(uuid.into()),
            bios_uuid: None,
            ip: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

impl PowerState {
    /// Maps the hypervisor's raw `VirtualMachinePowerState` enum value
    /// through a fixed table; anything unrecognized is `Unknown` rather
    /// than a parse error (spec.md §4.2 step 6).
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "poweredOn" => PowerState::PoweredOn,
            "poweredOff" => PowerState::PoweredOff,
            "suspended" => PowerState::Suspended,
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostFacts {
    pub hostname: String,
    pub version: String,
    pub model: String,
    pub cpu_mhz_per_core: f64,
    pub cpu_cores: u32,
    pub cpu_used_mhz: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub resource_pool_moref: String,
    pub host_moref: String,
    pub datacenter_moref: String,
    pub vm_folder_moref: String,
}

#[derive(Debug, Clone)]
pub struct DatastoreFacts {
    pub url: String,
    pub name: String,
    pub kind: String,
    pub capacity_gb: f64,
    pub free_gb: f64,
}

#[derive(Debug, Clone)]
pub struct VmFacts {
    pub moref: String,
    pub instance_uuid: String,
    pub name: String,
    pub power_state: PowerState,
    pub primary_ip: Option<String>,
    pub guest_os: String,
    pub annotation: String,
    pub num_cpu: u32,
    pub memory_mb: u32,
    pub overall_cpu_mhz: u32,
    pub guest_memory_mb: u32,
    pub uptime_seconds: u64,
    pub committed_disk_gb: f64,
    pub uncommitted_disk_gb: f64,
    pub tools_status: String,
    pub datastore_name: String,
    pub config_path: String,
}

/// One virtual disk backing file attached to a VM, in device-list order
/// (spec.md §4.4's "Disk iteration order" note).
#[derive(Debug, Clone)]
pub struct VirtualDisk {
    pub device_key: i32,
    pub backing_file: String,
}

/// The fixed handful of managed-object references needed to address a
/// standalone host's own inventory: its folder/datacenter/compute-resource
/// ancestry and the host itself. Resolved once per session and threaded
/// through the reconciler and clone orchestrator rather than looked up
/// per call.
#[derive(Debug, Clone)]
pub struct HostTopology {
    pub host_moref: String,
    pub resource_pool_moref: String,
    pub datacenter_moref: String,
    pub vm_folder_moref: String,
}

#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub id: String,
    pub text: String,
    pub choices: Vec<(String, String)>, // (key, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_maps_known_values() {
        assert_eq!(PowerState::from_raw("poweredOn"), PowerState::PoweredOn);
        assert_eq!(PowerState::from_raw("poweredOff"), PowerState::PoweredOff);
        assert_eq!(PowerState::from_raw("suspended"), PowerState::Suspended);
    }

    #[test]
    fn power_state_defaults_unknown_on_unrecognized_value() {
        assert_eq!(PowerState::from_raw("travelling"), PowerState::Unknown);
        assert_eq!(PowerState::from_raw(""), PowerState::Unknown);
    }
}
