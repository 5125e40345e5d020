//! Reads host/VM/datastore facts off a connected session and normalizes
//! them into flat records — the managed-object-graph-to-row mapping
//! spec.md §4.2 calls the reconciler's job.

use crate::client::VsphereClient;
use crate::error::Result;
use crate::types::{DatastoreFacts, HostFacts, HostTopology, PowerState, VirtualDisk, VmFacts};
use crate::vm_ops::EthernetDevice;
use crate::xml::{blocks, first_text};

impl VsphereClient {
    /// Host hardware summary and quick-stats. `topology` supplies the
    /// resource pool / datacenter / VM folder morefs the clone
    /// orchestrator needs; they are resolved once per session via
    /// `VsphereClient::topology`, not re-derived here.
    pub async fn host_facts(&self, topology: &HostTopology) -> Result<HostFacts> {
        let host_moref = &topology.host_moref;
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &format!(
                    r#"<specSet>
                        <propSet><type>HostSystem</type>
                            <pathSet>name</pathSet>
                            <pathSet>summary.config.product.version</pathSet>
                            <pathSet>summary.hardware.model</pathSet>
                            <pathSet>summary.hardware.cpuMhz</pathSet>
                            <pathSet>summary.hardware.numCpuCores</pathSet>
                            <pathSet>summary.quickStats.overallCpuUsage</pathSet>
                            <pathSet>summary.hardware.memorySize</pathSet>
                            <pathSet>summary.quickStats.overallMemoryUsage</pathSet>
                            <pathSet>parent</pathSet>
                        </propSet>
                        <objectSet><obj type="HostSystem">{host_moref}</obj></objectSet>
                    </specSet>"#,
                    host_moref = host_moref
                ),
            )
            .await?;

        let cpu_mhz_per_core = parse_f64(&first_text(&response, "cpuMhz"));
        let cpu_used_mhz = parse_f64(&first_text(&response, "overallCpuUsage"));
        let memory_total_bytes = parse_f64(&first_text(&response, "memorySize")) as u64;
        let memory_used_mb = parse_f64(&first_text(&response, "overallMemoryUsage"));

        Ok(HostFacts {
            hostname: first_text(&response, "name").unwrap_or_default(),
            version: first_text(&response, "version").unwrap_or_default(),
            model: first_text(&response, "model").unwrap_or_default(),
            cpu_mhz_per_core,
            cpu_cores: parse_f64(&first_text(&response, "numCpuCores")) as u32,
            cpu_used_mhz,
            memory_total_bytes,
            memory_used_bytes: (memory_used_mb * 1024.0 * 1024.0) as u64,
            resource_pool_moref: topology.resource_pool_moref.clone(),
            host_moref: host_moref.to_string(),
            datacenter_moref: topology.datacenter_moref.clone(),
            vm_folder_moref: topology.vm_folder_moref.clone(),
        })
    }

    /// Datastores attached to `host_moref`, each a flat record upserted on
    /// every sync (spec.md §4.2 step 5).
    pub async fn datastores(&self, host_moref: &str) -> Result<Vec<DatastoreFacts>> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &format!(
                    r#"<specSet>
                        <propSet><type>Datastore</type>
                            <pathSet>summary.url</pathSet>
                            <pathSet>summary.name</pathSet>
                            <pathSet>summary.type</pathSet>
                            <pathSet>summary.capacity</pathSet>
                            <pathSet>summary.freeSpace</pathSet>
                        </propSet>
                        <objectSet><obj type="HostSystem">{host_moref}</obj><selectSet><name>datastore</name></selectSet></objectSet>
                    </specSet>"#,
                    host_moref = host_moref
                ),
            )
            .await?;

        Ok(blocks(&response, "objects")
            .iter()
            .map(|block| DatastoreFacts {
                url: first_text(block, "url").unwrap_or_default(),
                name: first_text(block, "name").unwrap_or_default(),
                kind: first_text(block, "type").unwrap_or_default(),
                capacity_gb: parse_f64(&first_text(block, "capacity")) / GIB,
                free_gb: parse_f64(&first_text(block, "freeSpace")) / GIB,
            })
            .collect())
    }

    /// Every VM under `vm_folder_moref`, skipping entries whose config is
    /// entirely absent rather than aborting the whole scan (spec.md §4.2
    /// step 6's per-VM tolerance).
    pub async fn virtual_machines(&self, vm_folder_moref: &str) -> Result<Vec<VmFacts>> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &format!(
                    r#"<specSet>
                        <propSet><type>VirtualMachine</type>
                            <pathSet>config.instanceUuid</pathSet>
                            <pathSet>name</pathSet>
                            <pathSet>runtime.powerState</pathSet>
                            <pathSet>guest.ipAddress</pathSet>
                            <pathSet>config.guestFullName</pathSet>
                            <pathSet>config.annotation</pathSet>
                            <pathSet>config.hardware.numCPU</pathSet>
                            <pathSet>config.hardware.memoryMB</pathSet>
                            <pathSet>summary.quickStats.overallCpuUsage</pathSet>
                            <pathSet>summary.quickStats.guestMemoryUsage</pathSet>
                            <pathSet>summary.quickStats.uptimeSeconds</pathSet>
                            <pathSet>summary.storage.committed</pathSet>
                            <pathSet>summary.storage.uncommitted</pathSet>
                            <pathSet>guest.toolsStatus</pathSet>
                            <pathSet>datastore</pathSet>
                            <pathSet>config.files.vmPathName</pathSet>
                        </propSet>
                        <objectSet><obj type="Folder">{folder}</obj><selectSet><name>vm</name></selectSet></objectSet>
                    </specSet>"#,
                    folder = vm_folder_moref
                ),
            )
            .await?;

        let mut out = Vec::new();
        for block in blocks(&response, "objects") {
            // spec.md §4.2 step 6: config entirely absent -> skip, don't abort.
            let Some(config_path) = first_text(&block, "vmPathName") else {
                tracing::warn!("skipping VM with no config during reconcile");
                continue;
            };
            let Some(moref) = first_text(&block, "obj") else {
                continue;
            };
            out.push(VmFacts {
                moref,
                instance_uuid: first_text(&block, "instanceUuid").unwrap_or_default(),
                name: first_text(&block, "name").unwrap_or_default(),
                power_state: PowerState::from_raw(
                    &first_text(&block, "powerState").unwrap_or_default(),
                ),
                primary_ip: first_text(&block, "ipAddress"),
                guest_os: first_text(&block, "guestFullName").unwrap_or_default(),
                annotation: first_text(&block, "annotation").unwrap_or_default(),
                num_cpu: parse_f64(&first_text(&block, "numCPU")) as u32,
                memory_mb: parse_f64(&first_text(&block, "memoryMB")) as u32,
                overall_cpu_mhz: parse_f64(&first_text(&block, "overallCpuUsage")) as u32,
                guest_memory_mb: parse_f64(&first_text(&block, "guestMemoryUsage")) as u32,
                uptime_seconds: parse_f64(&first_text(&block, "uptimeSeconds")) as u64,
                committed_disk_gb: parse_f64(&first_text(&block, "committed")) / GIB,
                uncommitted_disk_gb: parse_f64(&first_text(&block, "uncommitted")) / GIB,
                tools_status: first_text(&block, "toolsStatus").unwrap_or_default(),
                datastore_name: first_text(&block, "datastore").unwrap_or_default(),
                config_path,
            });
        }
        Ok(out)
    }

    /// Virtual disk backing files attached to a VM, in device-list order.
    pub async fn virtual_disks(&self, vm_moref: &str) -> Result<Vec<VirtualDisk>> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &format!(
                    r#"<specSet>
                        <propSet><type>VirtualMachine</type><pathSet>config.hardware.device</pathSet></propSet>
                        <objectSet><obj type="VirtualMachine">{vm_moref}</obj></objectSet>
                    </specSet>"#,
                    vm_moref = vm_moref
                ),
            )
            .await?;

        let mut disks = Vec::new();
        for block in blocks(&response, "VirtualDisk") {
            let Some(key) = first_text(&block, "key") else {
                continue;
            };
            let Some(backing) = first_text(&block, "fileName") else {
                continue;
            };
            disks.push(VirtualDisk {
                device_key: key.parse().unwrap_or_default(),
                backing_file: backing,
            });
        }
        Ok(disks)
    }

    /// Ethernet device keys attached to a VM, in device-list order — the
    /// clone orchestrator's identity-reset and NIC-reconnect phases act on
    /// every key this returns.
    pub async fn ethernet_devices(&self, vm_moref: &str) -> Result<Vec<EthernetDevice>> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &format!(
                    r#"<specSet>
                        <propSet><type>VirtualMachine</type><pathSet>config.hardware.device</pathSet></propSet>
                        <objectSet><obj type="VirtualMachine">{vm_moref}</obj></objectSet>
                    </specSet>"#,
                    vm_moref = vm_moref
                ),
            )
            .await?;

        let mut devices = Vec::new();
        for tag in ["VirtualE1000", "VirtualE1000e", "VirtualVmxnet3", "VirtualVmxnet2"] {
            for block in blocks(&response, tag) {
                if let Some(key) = first_text(&block, "key") {
                    devices.push(EthernetDevice {
                        device_key: key.parse().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(devices)
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn parse_f64(value: &Option<String>) -> f64 {
    value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0.0)
}
