//! ARM workflows behind the MCP tools.
//!
//! Every public method acquires a fresh token, issues its requests through the
//! [`Executor`], and hands any `Accepted` outcome to an [`LroDriver`].

use std::collections::HashSet;
use std::sync::Arc;

use azure_core::credentials::Secret;
use serde_json::{json, Value};

use crate::auth::{ClientCredentialTokenProvider, TokenProvider};
use crate::builder::{PublicIpFallback, VmChain, VmCreateSpec, VmCreation};
use crate::config::Config;
use crate::error::{ArmError, ArmResult};
use crate::executor::{Executor, OperationOutcome, OperationRequest, PollLocation, PollSource};
use crate::http::{HttpTransport, ReqwestTransport, REQUEST_TIMEOUT};
use crate::lro::{extract_label, LroDriver, PollClass, PollSettings, TerminalTable, STATUS_RULES};
use crate::observe::{OperationEvent, OperationObserver, TracingObserver};
use crate::status::{power_state, provisioning_state, statuses_of, PowerState};

pub const COMPUTE_READ_API_VERSION: &str = "2024-11-01";
pub const COMPUTE_WRITE_API_VERSION: &str = "2025-04-01";
pub const NETWORK_API_VERSION: &str = "2021-02-01";
pub const DEPLOYMENTS_API_VERSION: &str = "2021-04-01";

const VM_TYPE: &str = "Microsoft.Compute/virtualMachines";
const DEPLOYMENT_TYPE: &str = "Microsoft.Resources/deployments";

/// Upper bound on `nextLink` pages followed by one listing.
const MAX_LIST_PAGES: u32 = 1000;

/// Reject names that would change the shape of the ARM path or query they
/// are spliced into.
pub fn validate_name(field: &str, value: &str) -> ArmResult<()> {
    if value.is_empty() {
        return Err(ArmError::InvalidInput(format!("{field} must not be empty")));
    }
    if value == "." || value.contains("..") {
        return Err(ArmError::InvalidInput(format!(
            "{field} '{value}' must not contain '..'"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '?' | '#' | '%' | '&') || c.is_control())
    {
        return Err(ArmError::InvalidInput(format!(
            "{field} '{}' contains forbidden character {c:?}",
            value.escape_debug()
        )));
    }
    Ok(())
}

/// Builds ARM resource ids and the URLs that address them.
#[derive(Debug, Clone)]
pub struct ArmEndpoint {
    base: String,
    subscription_id: String,
}

impl ArmEndpoint {
    pub fn new(base: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            subscription_id: subscription_id.into(),
        }
    }

    pub fn subscription_scope(&self) -> String {
        format!("/subscriptions/{}", self.subscription_id)
    }

    pub fn resource_group_scope(&self, resource_group: &str) -> String {
        format!("{}/resourceGroups/{resource_group}", self.subscription_scope())
    }

    /// `/subscriptions/{sub}/resourceGroups/{rg}/providers/{type}/{name}`
    pub fn resource_id(&self, resource_group: &str, resource_type: &str, name: &str) -> String {
        format!(
            "{}/providers/{resource_type}/{name}",
            self.resource_group_scope(resource_group)
        )
    }

    /// Absolute URL for an ARM id or scope path.
    pub fn url(&self, id: &str) -> String {
        format!("{}{id}", self.base)
    }
}

/// `nextLink` (or the older `odata.nextLink`) of a list page.
fn next_link(page: &Value) -> Option<String> {
    page.get("nextLink")
        .or_else(|| page.get("odata.nextLink"))
        .and_then(Value::as_str)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

fn page_items(page: Value) -> Vec<Value> {
    match page {
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

pub struct ArmClient {
    config: Arc<Config>,
    endpoint: ArmEndpoint,
    executor: Executor,
    tokens: Arc<dyn TokenProvider>,
    observer: Arc<dyn OperationObserver>,
}

impl ArmClient {
    /// Production wiring: reqwest transport, client-credentials tokens,
    /// tracing observer.
    pub fn new(config: Arc<Config>) -> ArmResult<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
        let tokens = Arc::new(ClientCredentialTokenProvider::new(
            config.credentials.clone(),
            config.authority_host.clone(),
            transport.clone(),
        ));
        Ok(Self::with_parts(
            config,
            transport,
            tokens,
            Arc::new(TracingObserver),
        ))
    }

    pub fn with_parts(
        config: Arc<Config>,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
        observer: Arc<dyn OperationObserver>,
    ) -> Self {
        let endpoint = ArmEndpoint::new(
            config.management_endpoint.clone(),
            config.credentials.subscription_id(),
        );
        let executor = Executor::new(transport).with_observer(observer.clone());
        Self {
            config,
            endpoint,
            executor,
            tokens,
            observer,
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    fn lro(&self) -> LroDriver {
        LroDriver::new(self.executor.clone(), self.observer.clone())
    }

    fn vm_id(&self, resource_group: &str, vm_name: &str) -> String {
        self.endpoint.resource_id(resource_group, VM_TYPE, vm_name)
    }

    fn deployment_id(&self, resource_group: &str, deployment_name: &str) -> String {
        self.endpoint
            .resource_id(resource_group, DEPLOYMENT_TYPE, deployment_name)
    }

    /// List VMs in a resource group, or the whole subscription when `None`.
    /// With `all_pages`, `nextLink` pages are followed and concatenated into
    /// a single `{"value": [...]}`.
    pub async fn list_vms(&self, resource_group: Option<&str>, all_pages: bool) -> ArmResult<Value> {
        if let Some(rg) = resource_group {
            validate_name("resource_group", rg)?;
        }
        let token = self.tokens.acquire_token().await?;
        let scope = match resource_group {
            Some(rg) => self.endpoint.resource_group_scope(rg),
            None => self.endpoint.subscription_scope(),
        };
        let url = OperationRequest::get(
            self.endpoint.url(&format!("{scope}/providers/{VM_TYPE}")),
            COMPUTE_READ_API_VERSION,
        )
        .full_url();

        let first = self.executor.get_json(&url, &token).await?;
        if !all_pages {
            return Ok(first);
        }

        let mut seen = HashSet::from([url]);
        let mut link = next_link(&first);
        let mut vms = page_items(first);
        let mut pages = 1u32;
        while let Some(url) = link.take() {
            if pages >= MAX_LIST_PAGES {
                tracing::warn!(pages, "page limit reached, listing truncated");
                break;
            }
            if !seen.insert(url.clone()) {
                tracing::warn!(%url, "nextLink repeats an earlier page, listing stopped");
                break;
            }
            let page = self.executor.get_json(&url, &token).await?;
            link = next_link(&page);
            vms.extend(page_items(page));
            pages += 1;
        }
        tracing::debug!(pages, count = vms.len(), "listed virtual machines");
        Ok(json!({ "value": vms }))
    }

    pub async fn instance_view(&self, resource_group: &str, vm_name: &str) -> ArmResult<Value> {
        validate_name("resource_group", resource_group)?;
        validate_name("vm_name", vm_name)?;
        let token = self.tokens.acquire_token().await?;
        let url = OperationRequest::get(
            self.endpoint
                .url(&format!("{}/instanceView", self.vm_id(resource_group, vm_name))),
            COMPUTE_READ_API_VERSION,
        )
        .full_url();
        self.executor.get_json(&url, &token).await
    }

    pub async fn power_state(&self, resource_group: &str, vm_name: &str) -> ArmResult<PowerState> {
        let view = self.instance_view(resource_group, vm_name).await?;
        Ok(power_state(&statuses_of(&view)))
    }

    /// `{name, id, location, provisioningState, powerState}` for one VM.
    pub async fn vm_status(&self, resource_group: &str, vm_name: &str) -> ArmResult<Value> {
        validate_name("resource_group", resource_group)?;
        validate_name("vm_name", vm_name)?;
        let token = self.tokens.acquire_token().await?;
        let request = OperationRequest::get(
            self.endpoint.url(&self.vm_id(resource_group, vm_name)),
            COMPUTE_READ_API_VERSION,
        );
        let vm = match self.executor.execute(&request, &token).await? {
            OperationOutcome::Completed(body) => body.unwrap_or(Value::Null),
            OperationOutcome::Failed { status: 404, .. } => {
                return Err(ArmError::NotFound(format!(
                    "virtual machine '{vm_name}' in resource group '{resource_group}'"
                )));
            }
            OperationOutcome::Failed { status, body } => {
                return Err(ArmError::Request { status, body });
            }
            OperationOutcome::Accepted(_) => Value::Null,
        };

        let view = self.instance_view(resource_group, vm_name).await?;
        let statuses = statuses_of(&view);
        let provisioning = vm
            .pointer("/properties/provisioningState")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| provisioning_state(&statuses));

        Ok(json!({
            "name": vm.get("name").and_then(Value::as_str).unwrap_or(vm_name),
            "id": vm.get("id"),
            "location": vm.get("location"),
            "provisioningState": provisioning,
            "powerState": power_state(&statuses),
        }))
    }

    /// Run the VM dependency chain.
    pub async fn create_vm(
        &self,
        spec: &VmCreateSpec,
        settings: PollSettings,
    ) -> ArmResult<VmCreation> {
        validate_name("resource_group", &spec.resource_group)?;
        validate_name("vm_name", &spec.vm_name)?;
        if spec.nic_id.is_none() {
            validate_name("vnet_name", &spec.vnet_name)?;
            validate_name("subnet_name", &spec.subnet_name)?;
        }
        let token = self.tokens.acquire_token().await?;
        let lro = self.lro();
        let fallback = PublicIpFallback::new(self.config.public_ip_fallback_codes.clone());
        let chain = VmChain {
            executor: &self.executor,
            lro: &lro,
            endpoint: &self.endpoint,
            observer: self.observer.as_ref(),
            fallback: &fallback,
            settings,
        };
        chain.run(spec, &token).await
    }

    /// DELETE a VM and wait for the deletion to settle.
    pub async fn delete_vm(
        &self,
        resource_group: &str,
        vm_name: &str,
        force: bool,
        settings: PollSettings,
    ) -> ArmResult<Value> {
        validate_name("resource_group", resource_group)?;
        validate_name("vm_name", vm_name)?;
        let token = self.tokens.acquire_token().await?;
        let mut request = OperationRequest::delete(
            self.endpoint.url(&self.vm_id(resource_group, vm_name)),
            COMPUTE_WRITE_API_VERSION,
        );
        if force {
            request = request.with_query("forceDeletion", "true");
        }

        let outcome = self.executor.execute(&request, &token).await?;
        let done = self
            .lro()
            .drive(
                &format!("delete vm {resource_group}/{vm_name}"),
                outcome,
                &token,
                settings,
            )
            .await?;
        Ok(json!({
            "ok": true,
            "polls": done.polls,
            "elapsed_secs": done.elapsed.as_secs(),
            "result": done.body,
        }))
    }

    /// PUT an incremental deployment of an opaque template and wait for it
    /// to reach a terminal provisioning state.
    pub async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: Value,
        parameters: Value,
        settings: PollSettings,
    ) -> ArmResult<Value> {
        validate_name("resource_group", resource_group)?;
        validate_name("deployment_name", deployment_name)?;
        let token = self.tokens.acquire_token().await?;
        let id = self.deployment_id(resource_group, deployment_name);
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": template,
                "parameters": parameters,
            }
        });
        let request = OperationRequest::put(self.endpoint.url(&id), DEPLOYMENTS_API_VERSION, body);

        let operation = format!("deploy {resource_group}/{deployment_name}");
        let table = TerminalTable::deployment();
        let lro = self.lro().with_table(table.clone());

        let result = match self.executor.execute(&request, &token).await? {
            // The PUT usually answers 200/201 with a non-terminal
            // provisioningState; follow the deployment resource itself.
            OperationOutcome::Completed(body) => {
                let label = body.as_ref().and_then(|b| extract_label(b, STATUS_RULES));
                match table.classify(label.as_deref()) {
                    PollClass::Pending => {
                        let location = PollLocation {
                            url: OperationRequest::get(
                                self.endpoint.url(&id),
                                DEPLOYMENTS_API_VERSION,
                            )
                            .full_url(),
                            source: PollSource::Resource,
                        };
                        self.observer.emit(&OperationEvent::Submitted {
                            operation: operation.clone(),
                            location: location.url.clone(),
                        });
                        lro.poll_until_terminal(&operation, &location, &token, settings)
                            .await
                    }
                    PollClass::Failed => Err(ArmError::OperationFailed {
                        body: body.unwrap_or(Value::Null),
                    }),
                    PollClass::Succeeded => {
                        lro.drive(&operation, OperationOutcome::Completed(body), &token, settings)
                            .await
                    }
                }
            }
            outcome => lro.drive(&operation, outcome, &token, settings).await,
        };

        match result {
            Ok(done) => Ok(json!({
                "ok": true,
                "polls": done.polls,
                "elapsed_secs": done.elapsed.as_secs(),
                "deployment": done.body,
            })),
            Err(ArmError::OperationFailed { body }) => {
                Err(self.with_operations(&id, body, &token).await)
            }
            Err(err) => Err(err),
        }
    }

    /// Attach the deployment's `/operations` list to a failure body.
    async fn with_operations(
        &self,
        deployment_id: &str,
        failure: Value,
        token: &Secret,
    ) -> ArmError {
        let url = OperationRequest::get(
            self.endpoint.url(&format!("{deployment_id}/operations")),
            DEPLOYMENTS_API_VERSION,
        )
        .full_url();

        let body = match self.executor.get_json(&url, token).await {
            Ok(operations) => json!({ "deployment": failure, "operations": operations }),
            Err(err) => {
                tracing::warn!(%err, "could not fetch deployment operations");
                json!({ "deployment": failure, "operations_error": err.to_string() })
            }
        };
        ArmError::OperationFailed { body }
    }

    /// Delete a deployment record.  Resources it created are left alone.
    pub async fn delete_deployment(
        &self,
        resource_group: &str,
        deployment_name: &str,
        settings: PollSettings,
    ) -> ArmResult<Value> {
        validate_name("resource_group", resource_group)?;
        validate_name("deployment_name", deployment_name)?;
        let token = self.tokens.acquire_token().await?;
        let request = OperationRequest::delete(
            self.endpoint
                .url(&self.deployment_id(resource_group, deployment_name)),
            DEPLOYMENTS_API_VERSION,
        );
        let outcome = self.executor.execute(&request, &token).await?;
        let done = self
            .lro()
            .drive(
                &format!("delete deployment {resource_group}/{deployment_name}"),
                outcome,
                &token,
                settings,
            )
            .await?;
        Ok(json!({ "ok": true, "polls": done.polls }))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::auth::testing::StaticToken;
    use crate::config::testing::config;
    use crate::http::testing::ScriptedTransport;
    use crate::observe::testing::RecordingObserver;

    /// Client wired to a scripted transport against `https://arm.test`.
    pub fn client(
        run_deploy: bool,
        transport: Arc<ScriptedTransport>,
    ) -> (ArmClient, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let client = ArmClient::with_parts(
            Arc::new(config(run_deploy)),
            transport,
            Arc::new(StaticToken("tok")),
            observer.clone(),
        );
        (client, observer)
    }
}
