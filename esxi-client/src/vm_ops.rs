use std::time::Duration;

use crate::client::VsphereClient;
use crate::error::Result;
use crate::xml::{esc, first_text};

/// Identity-reset/reconnect targets one ethernet device at a time; callers
/// pass the device key list read from `virtual_disks`'s sibling
/// `config.hardware.device` walk (kept in `esxi-client::inventory`'s
/// caller, `backend::virtualization::clone`, which also owns NIC device
/// keys since it already reads the full device list for disks).
pub struct EthernetDevice {
    pub device_key: i32,
}

impl VsphereClient {
    /// Register a copied `.vmx` as a new VM under the given resource pool,
    /// host, and VM folder (spec.md §4.4 "Register").
    pub async fn register_vm(
        &self,
        vmx_path: &str,
        name: &str,
        folder_moref: &str,
        pool_moref: &str,
        host_moref: &str,
        deadline: Duration,
    ) -> Result<String> {
        let params = format!(
            r#"<path>{path}</path><name>{name}</name><asTemplate>false</asTemplate>
               <pool type="ResourcePool">{pool}</pool><host type="HostSystem">{host}</host>"#,
            path = esc(vmx_path),
            name = esc(name),
            pool = esc(pool_moref),
            host = esc(host_moref)
        );
        let response = self
            .call("RegisterVM_Task", "Folder", folder_moref, &params)
            .await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        let result = self.wait_for_task(&task_moref, "register VM", deadline).await?;
        Ok(result)
    }

    /// Clear BIOS UUID, location UUID, and per-NIC MAC so the hypervisor
    /// treats the next boot as a brand-new VM (spec.md §4.4 "Reset
    /// Identity" / GLOSSARY "Identity reset"). When `disconnect_first` is
    /// set, also disconnects every NIC as the first-boot IP-collision
    /// safety valve.
    pub async fn reset_identity(
        &self,
        vm_moref: &str,
        ethernet_devices: &[EthernetDevice],
        disconnect_first: bool,
        deadline: Duration,
    ) -> Result<()> {
        let device_changes: String = ethernet_devices
            .iter()
            .map(|dev| {
                let connectable = if disconnect_first {
                    r#"<connectable><connected>false</connected><startConnected>false</startConnected></connectable>"#
                } else {
                    ""
                };
                format!(
                    r#"<deviceChange><operation>edit</operation><device><key>{key}</key><addressType>generated</addressType><macAddress></macAddress>{connectable}</device></deviceChange>"#,
                    key = dev.device_key,
                    connectable = connectable
                )
            })
            .collect();

        let params = format!(
            r#"<spec>
                {device_changes}
                <extraConfig><key>uuid.action</key><value>create</value></extraConfig>
                <extraConfig><key>uuid.bios</key><value></value></extraConfig>
                <extraConfig><key>uuid.location</key><value></value></extraConfig>
               </spec>"#,
            device_changes = device_changes
        );
        let response = self
            .call("ReconfigVM_Task", "VirtualMachine", vm_moref, &params)
            .await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "reset identity", deadline).await?;
        Ok(())
    }

    /// Reconnect every ethernet device (`connected=true`,
    /// `startConnected=true`) — spec.md §4.4's unconditional post-IP-step
    /// phase.
    pub async fn reconnect_nics(
        &self,
        vm_moref: &str,
        ethernet_devices: &[EthernetDevice],
        deadline: Duration,
    ) -> Result<()> {
        let device_changes: String = ethernet_devices
            .iter()
            .map(|dev| {
                format!(
                    r#"<deviceChange><operation>edit</operation><device><key>{key}</key><connectable><connected>true</connected><startConnected>true</startConnected></connectable></device></deviceChange>"#,
                    key = dev.device_key
                )
            })
            .collect();
        let params = format!(r#"<spec>{device_changes}</spec>"#, device_changes = device_changes);
        let response = self
            .call("ReconfigVM_Task", "VirtualMachine", vm_moref, &params)
            .await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "reconnect NICs", deadline).await?;
        Ok(())
    }

    /// Start a power-on task; caller drives `wait_for_power_task_with_questions`.
    pub async fn power_on_task(&self, vm_moref: &str) -> Result<String> {
        let response = self
            .call("PowerOnVM_Task", "VirtualMachine", vm_moref, "")
            .await?;
        Ok(first_text(&response, "returnval").unwrap_or_default())
    }

    pub async fn power_off_task(&self, vm_moref: &str, deadline: Duration) -> Result<()> {
        let response = self
            .call("PowerOffVM_Task", "VirtualMachine", vm_moref, "")
            .await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "power off", deadline).await?;
        Ok(())
    }

    pub async fn reset_task(&self, vm_moref: &str, deadline: Duration) -> Result<()> {
        let response = self.call("ResetVM_Task", "VirtualMachine", vm_moref, "").await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "reset", deadline).await?;
        Ok(())
    }

    pub async fn shutdown_guest(&self, vm_moref: &str) -> Result<()> {
        self.call("ShutdownGuest", "VirtualMachine", vm_moref, "").await?;
        Ok(())
    }

    pub async fn reboot_guest(&self, vm_moref: &str) -> Result<()> {
        self.call("RebootGuest", "VirtualMachine", vm_moref, "").await?;
        Ok(())
    }

    /// Hypervisor-side rename, awaited before the local record is updated
    /// (spec.md §6 `PATCH /virtualization/vms/{id}`).
    pub async fn rename_vm(&self, vm_moref: &str, new_name: &str, deadline: Duration) -> Result<()> {
        let params = format!(r#"<newName>{}</newName>"#, esc(new_name));
        let response = self.call("Rename_Task", "VirtualMachine", vm_moref, &params).await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "rename VM", deadline).await?;
        Ok(())
    }

    /// Hypervisor-side annotation update.
    pub async fn set_annotation(&self, vm_moref: &str, annotation: &str, deadline: Duration) -> Result<()> {
        let params = format!(r#"<spec><annotation>{}</annotation></spec>"#, esc(annotation));
        let response = self
            .call("ReconfigVM_Task", "VirtualMachine", vm_moref, &params)
            .await?;
        let task_moref = first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "update annotation", deadline).await?;
        Ok(())
    }
}
