use std::time::Duration;

use tokio::time::sleep;

use crate::error::{HypervisorError, Result};
use crate::types::{HostTopology, PendingQuestion, PowerState, VmDescriptor};
use crate::xml::{envelope, esc, first_text};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const QUESTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A session against one hypervisor's `/sdk` management endpoint.
///
/// Every method carries an explicit deadline, per spec.md §4.1. TLS
/// verification is disabled because ESXi hosts ship self-signed certs by
/// default — this is the one place in the system that relaxes it.
pub struct VsphereClient {
    http: reqwest::Client,
    pub address: String,
    port: u16,
    base_url: String,
    session_cookie: Option<String>,
}

impl VsphereClient {
    /// Open a session and log in. Consumes credentials immediately; they
    /// are not retained beyond the login call.
    pub async fn connect(address: &str, username: &str, password: &str, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| HypervisorError::Transport {
                host: address.to_string(),
                source,
            })?;

        let base_url = format!("https://{address}:{port}/sdk");
        let mut client = Self {
            http,
            address: address.to_string(),
            port,
            base_url,
            session_cookie: None,
        };
        client.login(username, password).await?;
        Ok(client)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let body = format!(
            r#"<Login xmlns="urn:vim25"><_this type="SessionManager">SessionManager</_this><userName>{}</userName><password>{}</password></Login>"#,
            esc(username),
            esc(password)
        );
        let (response, cookie) = self.raw_call(&body).await?;
        if first_text(&response, "fault").is_some() || first_text(&response, "key").is_none() {
            return Err(HypervisorError::Auth {
                host: self.address.clone(),
                reason: first_text(&response, "fault")
                    .unwrap_or_else(|| "login rejected".to_string()),
            });
        }
        self.session_cookie = cookie;
        Ok(())
    }

    /// Log out and drop the session. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.session_cookie.take().is_some() {
            let body = r#"<Logout xmlns="urn:vim25"><_this type="SessionManager">SessionManager</_this></Logout>"#;
            let _ = self.raw_call(body).await;
        }
    }

    async fn raw_call(&self, body: &str) -> Result<(String, Option<String>)> {
        let mut req = self
            .http
            .post(&self.base_url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "urn:vim25/8.0")
            .body(envelope(body));
        if let Some(cookie) = &self.session_cookie {
            req = req.header("Cookie", cookie.clone());
        }
        let resp = req.send().await.map_err(|source| HypervisorError::Transport {
            host: self.address.clone(),
            source,
        })?;
        let cookie = resp
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let text = resp.text().await.map_err(|source| HypervisorError::Transport {
            host: self.address.clone(),
            source,
        })?;
        Ok((text, cookie))
    }

    /// Issue a vim25 method call against a managed object and return the
    /// raw XML response body.
    pub async fn call(&self, method: &str, this_type: &str, this_moref: &str, params: &str) -> Result<String> {
        let body = format!(
            r#"<{method} xmlns="urn:vim25"><_this type="{this_type}">{moref}</_this>{params}</{method}>"#,
            method = method,
            this_type = this_type,
            moref = esc(this_moref),
            params = params
        );
        let (response, _cookie) = self.raw_call(&body).await?;
        if let Some(fault) = first_text(&response, "faultstring") {
            return Err(HypervisorError::Remote {
                host: self.address.clone(),
                message: fault,
            });
        }
        Ok(response)
    }

    /// Resolve a VM descriptor to a managed-object reference, trying each
    /// identifying field in order; the first one that yields a match wins.
    pub async fn find_vm(&self, descriptor: &VmDescriptor) -> Result<String> {
        if let Some(uuid) = &descriptor.instance_uuid {
            if let Some(moref) = self.find_vm_by_uuid(uuid, true).await? {
                return Ok(moref);
            }
        }
        if let Some(uuid) = &descriptor.bios_uuid {
            if let Some(moref) = self.find_vm_by_uuid(uuid, false).await? {
                return Ok(moref);
            }
        }
        if let Some(ip) = &descriptor.ip {
            if let Some(moref) = self.find_vm_by_ip(ip).await? {
                return Ok(moref);
            }
        }
        if let Some(name) = &descriptor.name {
            if let Some(moref) = self.find_vm_by_name(name).await? {
                return Ok(moref);
            }
        }
        Err(HypervisorError::VmNotFound {
            descriptor: format!("{:?}", descriptor),
        })
    }

    async fn find_vm_by_uuid(&self, uuid: &str, instance_uuid: bool) -> Result<Option<String>> {
        let params = format!(
            r#"<uuid>{}</uuid><vmSearch>true</vmSearch><instanceUuid>{}</instanceUuid>"#,
            esc(uuid),
            instance_uuid
        );
        let response = self
            .call("FindByUuid", "SearchIndex", "SearchIndex", &params)
            .await?;
        Ok(first_text(&response, "returnval"))
    }

    async fn find_vm_by_ip(&self, ip: &str) -> Result<Option<String>> {
        let params = format!(r#"<ip>{}</ip>"#, esc(ip));
        let response = self
            .call("FindByIp", "SearchIndex", "SearchIndex", &params)
            .await?;
        Ok(first_text(&response, "returnval"))
    }

    async fn find_vm_by_name(&self, name: &str) -> Result<Option<String>> {
        let params = format!(r#"<dnsName>{}</dnsName>"#, esc(name));
        let response = self
            .call("FindByDnsName", "SearchIndex", "SearchIndex", &params)
            .await?;
        Ok(first_text(&response, "returnval"))
    }

    /// Poll a task moref until it reaches a terminal state, at the fixed
    /// 2s cadence spec.md §4.1/§5 specify. Returns the task's result field
    /// (often empty) on success.
    pub async fn wait_for_task(&self, task_moref: &str, label: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self
                .call(
                    "RetrieveProperties",
                    "PropertyCollector",
                    "propertyCollector",
                    &property_spec("Task", task_moref, &["info.state", "info.result", "info.error"]),
                )
                .await?;
            match first_text(&response, "state").as_deref() {
                Some("success") => return Ok(first_text(&response, "result").unwrap_or_default()),
                Some("error") => {
                    return Err(HypervisorError::Remote {
                        host: self.address.clone(),
                        message: first_text(&response, "error")
                            .unwrap_or_else(|| format!("{label} failed")),
                    });
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HypervisorError::Timeout {
                            host: self.address.clone(),
                            operation: label.to_string(),
                            deadline_secs: timeout.as_secs(),
                        });
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Check whether `vm_moref` has a pending question prompt and, if so,
    /// answer it per spec.md §4.1: prefer the choice whose label mentions
    /// "copied"/"copy"/"复制", else the second option, else literal "2".
    pub async fn answer_pending_question(&self, vm_moref: &str) -> Result<bool> {
        let question = self.pending_question(vm_moref).await?;
        let Some(question) = question else {
            return Ok(false);
        };
        let answer = pick_answer(&question);
        let params = format!(
            r#"<questionId>{}</questionId><answerChoice>{}</answerChoice>"#,
            esc(&question.id),
            esc(&answer)
        );
        self.call("AnswerVM", "VirtualMachine", vm_moref, &params).await?;
        Ok(true)
    }

    async fn pending_question(&self, vm_moref: &str) -> Result<Option<PendingQuestion>> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("VirtualMachine", vm_moref, &["runtime.question"]),
            )
            .await?;
        let Some(id) = first_text(&response, "id") else {
            return Ok(None);
        };
        let text = first_text(&response, "text").unwrap_or_default();
        let keys = crate::xml::all_text(&response, "key");
        let labels = crate::xml::all_text(&response, "label");
        let choices = keys.into_iter().zip(labels).collect();
        Ok(Some(PendingQuestion { id, text, choices }))
    }

    /// Poll until the guest's VMware Tools report a running state, or the
    /// deadline elapses. Tolerant: callers in the clone workflow treat a
    /// timeout here as non-fatal.
    pub async fn wait_for_tools_running(&self, vm_moref: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self
                .call(
                    "RetrieveProperties",
                    "PropertyCollector",
                    "propertyCollector",
                    &property_spec("VirtualMachine", vm_moref, &["guest.toolsRunningStatus"]),
                )
                .await?;
            if first_text(&response, "toolsRunningStatus").as_deref() == Some("guestToolsRunning") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HypervisorError::Timeout {
                    host: self.address.clone(),
                    operation: "await guest tools".to_string(),
                    deadline_secs: timeout.as_secs(),
                });
            }
            sleep(Duration::from_secs(5)).await;
        }
    }

    /// Walk the inventory from the well-known `ServiceInstance` moref down
    /// to the host's own managed-object references. A directly-managed
    /// ESXi host exposes exactly one datacenter and one compute resource,
    /// so the first child at each level is always the right one.
    pub async fn topology(&self) -> Result<HostTopology> {
        let content = self
            .call(
                "RetrieveServiceContent",
                "ServiceInstance",
                "ServiceInstance",
                "",
            )
            .await?;
        let root_folder = first_text(&content, "rootFolder").ok_or_else(|| HypervisorError::Protocol {
            host: self.address.clone(),
            message: "service content missing rootFolder".to_string(),
        })?;

        let root_children = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("Folder", &root_folder, &["childEntity"]),
            )
            .await?;
        let datacenter_moref = first_text(&root_children, "childEntity").ok_or_else(|| {
            HypervisorError::Protocol {
                host: self.address.clone(),
                message: "no datacenter in inventory".to_string(),
            }
        })?;

        let dc_props = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("Datacenter", &datacenter_moref, &["hostFolder", "vmFolder"]),
            )
            .await?;
        let host_folder = first_text(&dc_props, "hostFolder").ok_or_else(|| HypervisorError::Protocol {
            host: self.address.clone(),
            message: "datacenter missing hostFolder".to_string(),
        })?;
        let vm_folder_moref = first_text(&dc_props, "vmFolder").ok_or_else(|| HypervisorError::Protocol {
            host: self.address.clone(),
            message: "datacenter missing vmFolder".to_string(),
        })?;

        let hf_children = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("Folder", &host_folder, &["childEntity"]),
            )
            .await?;
        let compute_resource = first_text(&hf_children, "childEntity").ok_or_else(|| {
            HypervisorError::Protocol {
                host: self.address.clone(),
                message: "no compute resource in inventory".to_string(),
            }
        })?;

        let cr_props = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("ComputeResource", &compute_resource, &["host", "resourcePool"]),
            )
            .await?;
        let host_moref = first_text(&cr_props, "host").ok_or_else(|| HypervisorError::Protocol {
            host: self.address.clone(),
            message: "compute resource has no host".to_string(),
        })?;
        let resource_pool_moref = first_text(&cr_props, "resourcePool").unwrap_or_default();

        Ok(HostTopology {
            host_moref,
            resource_pool_moref,
            datacenter_moref,
            vm_folder_moref,
        })
    }

    pub async fn power_state(&self, vm_moref: &str) -> Result<PowerState> {
        let response = self
            .call(
                "RetrieveProperties",
                "PropertyCollector",
                "propertyCollector",
                &property_spec("VirtualMachine", vm_moref, &["runtime.powerState"]),
            )
            .await?;
        Ok(PowerState::from_raw(
            &first_text(&response, "powerState").unwrap_or_default(),
        ))
    }

    /// Poll for a pending question at 1s cadence while a power-on task
    /// runs, as spec.md §4.4/§4.6 require; returns when the task reaches a
    /// terminal state or the deadline elapses.
    pub async fn wait_for_power_task_with_questions(
        &self,
        vm_moref: &str,
        task_moref: &str,
        label: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.answer_pending_question(vm_moref).await.unwrap_or(false) {
                tracing::debug!(vm = vm_moref, "answered pending question during {label}");
            }
            let response = self
                .call(
                    "RetrieveProperties",
                    "PropertyCollector",
                    "propertyCollector",
                    &property_spec("Task", task_moref, &["info.state", "info.error"]),
                )
                .await?;
            match first_text(&response, "state").as_deref() {
                Some("success") => return Ok(()),
                Some("error") => {
                    return Err(HypervisorError::Remote {
                        host: self.address.clone(),
                        message: first_text(&response, "error")
                            .unwrap_or_else(|| format!("{label} failed")),
                    });
                }
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HypervisorError::Timeout {
                            host: self.address.clone(),
                            operation: label.to_string(),
                            deadline_secs: timeout.as_secs(),
                        });
                    }
                    sleep(QUESTION_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// RAII guard that disconnects a session on drop — the Rust expression of
/// spec.md §9's "guaranteed release on all exit paths, including panics".
/// Wraps the client in an `Option` so `disconnect` can be awaited exactly
/// once from an async `Drop`-adjacent teardown call.
pub struct SessionGuard {
    client: Option<VsphereClient>,
}

impl SessionGuard {
    pub fn new(client: VsphereClient) -> Self {
        Self { client: Some(client) }
    }

    pub fn get(&self) -> &VsphereClient {
        self.client.as_ref().expect("session already released")
    }

    /// Explicitly release the session. Idempotent.
    pub async fn release(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
    }
}

impl Drop for SessionGuard {
    /// Covers the path `release()` can't: a panic unwinding through a
    /// workflow before it reaches its explicit `release().await`. `Logout`
    /// is itself async, so this spawns a detached best-effort task on the
    /// caller's Tokio runtime rather than blocking the drop; every call site
    /// runs inside a `tokio::spawn`ed task, so a runtime handle is always
    /// available here.
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tokio::spawn(async move {
                let mut client = client;
                client.disconnect().await;
            });
        }
    }
}

fn property_spec(kind: &str, moref: &str, props: &[&str]) -> String {
    let path_xml: String = props
        .iter()
        .map(|p| format!("<pathSet>{p}</pathSet>"))
        .collect();
    format!(
        r#"<specSet>
            <propSet><type>{kind}</type>{path_xml}</propSet>
            <objectSet><obj type="{kind}">{moref}</obj></objectSet>
        </specSet>"#,
        kind = kind,
        path_xml = path_xml,
        moref = esc(moref)
    )
}

/// Choose a question answer per spec.md §4.1: prefer a choice whose label
/// mentions being copied, else the second option, else the literal "2".
fn pick_answer(question: &PendingQuestion) -> String {
    for (key, label) in &question.choices {
        let lower = label.to_lowercase();
        if lower.contains("copied") || lower.contains("copy") || label.contains("复制") {
            return key.clone();
        }
    }
    if let Some((key, _)) = question.choices.get(1) {
        return key.clone();
    }
    "2".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(labels: &[&str]) -> PendingQuestion {
        PendingQuestion {
            id: "q.1".into(),
            text: "moved or copied?".into(),
            choices: labels
                .iter()
                .enumerate()
                .map(|(i, l)| (i.to_string(), l.to_string()))
                .collect(),
        }
    }

    #[test]
    fn prefers_copied_label() {
        let q = question(&["I moved it", "I copied it"]);
        assert_eq!(pick_answer(&q), "1");
    }

    #[test]
    fn falls_back_to_second_option() {
        let q = question(&["Cancel", "Retry"]);
        assert_eq!(pick_answer(&q), "1");
    }

    #[test]
    fn falls_back_to_literal_two_when_no_second_choice() {
        let q = question(&["Only option"]);
        assert_eq!(pick_answer(&q), "2");
    }

    #[test]
    fn recognizes_chinese_copied_label() {
        let q = question(&["我已移动该虚拟机", "我已复制该虚拟机"]);
        assert_eq!(pick_answer(&q), "1");
    }
}
