use std::time::Duration;

use crate::client::VsphereClient;
use crate::error::Result;
use crate::xml::esc;

impl VsphereClient {
    /// Delete a datastore path. Best-effort: a "file not found" fault is
    /// swallowed so callers can use this for idempotent cleanup (spec.md
    /// §4.4 "Prepare Target").
    pub async fn delete_path(&self, datacenter_moref: &str, path: &str, deadline: Duration) -> Result<()> {
        let params = format!(
            r#"<name>{}</name><datacenter type="Datacenter">{}</datacenter>"#,
            esc(path),
            esc(datacenter_moref)
        );
        let result = self
            .call("DeleteDatastoreFile_Task", "FileManager", "FileManager", &params)
            .await;
        let task_moref = match result {
            Ok(response) => crate::xml::first_text(&response, "returnval").unwrap_or_default(),
            Err(_) => return Ok(()),
        };
        match self.wait_for_task(&task_moref, "delete path", deadline).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let missing = matches!(&err, crate::error::HypervisorError::Remote { message, .. }
                    if message.to_lowercase().contains("not found") || message.to_lowercase().contains("was not found"));
                if missing {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Create a datastore directory. Idempotent: "already exists" faults
    /// are swallowed (spec.md §4.1).
    pub async fn make_directory(&self, datacenter_moref: &str, path: &str) -> Result<()> {
        let params = format!(
            r#"<name>{}</name><datacenter type="Datacenter">{}</datacenter><createParentDirectories>true</createParentDirectories>"#,
            esc(path),
            esc(datacenter_moref)
        );
        match self
            .call("MakeDirectory", "FileManager", "FileManager", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(crate::error::HypervisorError::Remote { message, .. })
                if message.to_lowercase().contains("already exists") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Copy a single file between datastore paths.
    pub async fn copy_file(
        &self,
        datacenter_moref: &str,
        source: &str,
        dest: &str,
        force: bool,
        deadline: Duration,
    ) -> Result<()> {
        let params = format!(
            r#"<sourceName>{}</sourceName><sourceDatacenter type="Datacenter">{dc}</sourceDatacenter><destinationName>{}</destinationName><destinationDatacenter type="Datacenter">{dc}</destinationDatacenter><force>{}</force>"#,
            esc(source),
            esc(dest),
            force,
            dc = esc(datacenter_moref)
        );
        let response = self
            .call("CopyDatastoreFile_Task", "FileManager", "FileManager", &params)
            .await?;
        let task_moref = crate::xml::first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "copy file", deadline).await?;
        Ok(())
    }

    /// Copy a virtual disk (`.vmdk`) between datastore paths with
    /// `force=true`, as spec.md §4.4's "Copy Disks" phase requires.
    pub async fn copy_virtual_disk(
        &self,
        datacenter_moref: &str,
        source: &str,
        dest: &str,
        deadline: Duration,
    ) -> Result<()> {
        let params = format!(
            r#"<sourceName>{}</sourceName><sourceDatacenter type="Datacenter">{dc}</sourceDatacenter><destName>{}</destName><destDatacenter type="Datacenter">{dc}</destDatacenter><force>true</force>"#,
            esc(source),
            esc(dest),
            dc = esc(datacenter_moref)
        );
        let response = self
            .call("CopyVirtualDisk_Task", "VirtualDiskManager", "VirtualDiskManager", &params)
            .await?;
        let task_moref = crate::xml::first_text(&response, "returnval").unwrap_or_default();
        self.wait_for_task(&task_moref, "copy virtual disk", deadline).await?;
        Ok(())
    }
}
