use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use azure_core::credentials::Secret;

use crate::arm::ArmClient;
use crate::builder::{ImageReference, VmCreateSpec};
use crate::config::{Config, OperationKind};
use crate::error::{ArmError, ArmResult};

// ---------------------------------------------------------------------------
// Tool parameter types
// ---------------------------------------------------------------------------

/// Parameters for `list_vms`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListVmsParams {
    /// Resource group to list.  Omit to list the whole subscription.
    pub resource_group: Option<String>,
    /// Follow `nextLink` and return every page (default: false).
    pub all_pages: Option<bool>,
}

/// Parameters for tools addressing a single VM.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct VmRefParams {
    pub resource_group: String,
    pub vm_name: String,
}

/// Parameters for `deploy_vm`.  Omitted fields fall back to the `AZ_TEST_*`
/// environment defaults.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeployVmParams {
    pub resource_group: String,
    pub vm_name: String,
    pub location: Option<String>,
    pub vm_size: Option<String>,
    pub admin_username: Option<String>,
    /// Admin password.  Falls back to `AZ_TEST_PASS`.
    pub admin_password: Option<String>,
    /// Marketplace image (default: Canonical UbuntuServer 18.04-LTS latest).
    pub image: Option<ImageReference>,
    /// Existing NIC resource id.  When set, no network resources are touched.
    pub nic_id: Option<String>,
    pub vnet_name: Option<String>,
    pub subnet_name: Option<String>,
    /// Create and attach a public IP (default: false).
    pub public_ip: Option<bool>,
    /// Overrides `AZ_DEPLOY_TIMEOUT_SECS` for this call.
    pub timeout_secs: Option<u64>,
    /// Overrides `AZ_POLL_INTERVAL_SECS` for this call.
    pub poll_interval_secs: Option<u64>,
}

/// Parameters for `deploy_template`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeployTemplateParams {
    pub resource_group: String,
    pub deployment_name: String,
    /// ARM template as a JSON string.
    pub template_json: String,
    /// Parameter values as a JSON string, e.g. `{"vmName": {"value": "vm1"}}`.
    pub parameters_json: Option<String>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

/// Parameters for `delete_vm`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteVmParams {
    pub resource_group: String,
    pub vm_name: String,
    /// Request forced deletion (default: true).
    pub force: Option<bool>,
    /// Overrides `AZ_DELETE_TIMEOUT_SECS` for this call.
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

/// Parameters for `delete_deployment`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteDeploymentParams {
    pub resource_group: String,
    pub deployment_name: String,
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Turn a core result into the tool's JSON text.  Errors never escape as
/// anything but a structured JSON object.
fn render<T: Serialize>(result: ArmResult<T>) -> Result<String, String> {
    match result {
        Ok(value) => serde_json::to_string(&value).map_err(|e| {
            json!({"error": format!("failed to encode result: {e}"), "kind": "internal"})
                .to_string()
        }),
        Err(err) => {
            tracing::warn!(kind = err.kind(), %err, "tool call failed");
            Err(err.to_tool_json().to_string())
        }
    }
}

fn parse_json(field: &str, raw: &str) -> ArmResult<Value> {
    serde_json::from_str(raw)
        .map_err(|e| ArmError::InvalidInput(format!("{field} is not valid JSON: {e}")))
}

/// MCP server that exposes Azure VM and ARM deployment operations as tools.
#[derive(Clone)]
pub struct AzureVmMcpServer {
    config: Arc<Config>,
    arm: Arc<ArmClient>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for AzureVmMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "azure-vm-mcp-server".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "This MCP server manages Azure virtual machines and ARM template \
                 deployments.  Read-only tools (list_vms, get_vm_*) are always \
                 available; deploy_* and delete_* require AZ_RUN_DEPLOY=true and \
                 wait for the long-running operation to finish."
                    .into(),
            ),
        }
    }
}

#[tool_router]
impl AzureVmMcpServer {
    // ------------------------------------------------------------------
    // Read-only tools
    // ------------------------------------------------------------------

    #[tool(description = "List virtual machines in a resource group, or in the \
                          whole subscription when resource_group is omitted.  \
                          Set all_pages to follow nextLink pagination.")]
    async fn list_vms(
        &self,
        Parameters(params): Parameters<ListVmsParams>,
    ) -> Result<String, String> {
        tracing::info!(resource_group = ?params.resource_group, "list_vms");
        render(
            self.arm
                .list_vms(
                    params.resource_group.as_deref().filter(|rg| !rg.is_empty()),
                    params.all_pages.unwrap_or(false),
                )
                .await,
        )
    }

    #[tool(description = "Return the raw instance view of a virtual machine.")]
    async fn get_vm_instance_view(
        &self,
        Parameters(params): Parameters<VmRefParams>,
    ) -> Result<String, String> {
        tracing::info!(rg = %params.resource_group, vm = %params.vm_name, "get_vm_instance_view");
        render(
            self.arm
                .instance_view(&params.resource_group, &params.vm_name)
                .await,
        )
    }

    #[tool(description = "Summarise a virtual machine: name, id, location, \
                          provisioningState and powerState.")]
    async fn get_vm_status(
        &self,
        Parameters(params): Parameters<VmRefParams>,
    ) -> Result<String, String> {
        tracing::info!(rg = %params.resource_group, vm = %params.vm_name, "get_vm_status");
        render(
            self.arm
                .vm_status(&params.resource_group, &params.vm_name)
                .await,
        )
    }

    /// Returns `{"powerState": "running"}` style output; `"unknown"` when the
    /// instance view carries no power state.
    #[tool(description = "Return the power state of a virtual machine \
                          (e.g. running, stopped, deallocated, or unknown).")]
    async fn get_vm_power_state(
        &self,
        Parameters(params): Parameters<VmRefParams>,
    ) -> Result<String, String> {
        tracing::info!(rg = %params.resource_group, vm = %params.vm_name, "get_vm_power_state");
        render(
            self.arm
                .power_state(&params.resource_group, &params.vm_name)
                .await
                .map(|state| json!({ "powerState": state })),
        )
    }

    // ------------------------------------------------------------------
    // Mutating tools (gated by AZ_RUN_DEPLOY)
    // ------------------------------------------------------------------

    #[tool(description = "Create a virtual machine.  Creates an optional public \
                          IP and a NIC in an existing virtual network unless \
                          nic_id is given, then creates the VM and waits for it.  \
                          Requires AZ_RUN_DEPLOY=true.")]
    async fn deploy_vm(
        &self,
        Parameters(params): Parameters<DeployVmParams>,
    ) -> Result<String, String> {
        tracing::info!(rg = %params.resource_group, vm = %params.vm_name, "deploy_vm");
        render(self.deploy_vm_inner(params).await)
    }

    #[tool(description = "Deploy an ARM template (incremental mode) to a \
                          resource group and wait for a terminal state.  On \
                          failure the deployment operations are included.  \
                          Requires AZ_RUN_DEPLOY=true.")]
    async fn deploy_template(
        &self,
        Parameters(params): Parameters<DeployTemplateParams>,
    ) -> Result<String, String> {
        tracing::info!(
            rg = %params.resource_group,
            deployment = %params.deployment_name,
            "deploy_template"
        );
        render(self.deploy_template_inner(params).await)
    }

    #[tool(description = "Delete a virtual machine (forced by default) and wait \
                          for the deletion to finish.  Requires AZ_RUN_DEPLOY=true.")]
    async fn delete_vm(
        &self,
        Parameters(params): Parameters<DeleteVmParams>,
    ) -> Result<String, String> {
        tracing::info!(rg = %params.resource_group, vm = %params.vm_name, "delete_vm");
        let result = match self.config.require_deploy("delete_vm") {
            Ok(()) => {
                let settings = self.config.polling.settings(
                    OperationKind::Delete,
                    params.timeout_secs,
                    params.poll_interval_secs,
                );
                self.arm
                    .delete_vm(
                        &params.resource_group,
                        &params.vm_name,
                        params.force.unwrap_or(true),
                        settings,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        render(result)
    }

    #[tool(description = "Delete an ARM deployment record.  Resources created by \
                          the deployment are not deleted.  Requires AZ_RUN_DEPLOY=true.")]
    async fn delete_deployment(
        &self,
        Parameters(params): Parameters<DeleteDeploymentParams>,
    ) -> Result<String, String> {
        tracing::info!(
            rg = %params.resource_group,
            deployment = %params.deployment_name,
            "delete_deployment"
        );
        let result = match self.config.require_deploy("delete_deployment") {
            Ok(()) => {
                let settings = self.config.polling.settings(
                    OperationKind::Delete,
                    params.timeout_secs,
                    params.poll_interval_secs,
                );
                self.arm
                    .delete_deployment(&params.resource_group, &params.deployment_name, settings)
                    .await
            }
            Err(e) => Err(e),
        };
        render(result)
    }
}

impl AzureVmMcpServer {
    /// Create a new server instance with production wiring.
    pub fn new(config: Config) -> ArmResult<Self> {
        let arm = ArmClient::new(Arc::new(config))?;
        Ok(Self::with_client(arm))
    }

    pub fn with_client(arm: ArmClient) -> Self {
        Self {
            config: arm.config(),
            arm: Arc::new(arm),
            tool_router: Self::tool_router(),
        }
    }

    async fn deploy_vm_inner(&self, params: DeployVmParams) -> ArmResult<Value> {
        self.config.require_deploy("deploy_vm")?;

        let defaults = &self.config.vm_defaults;
        let admin_password = match params.admin_password {
            Some(p) if !p.is_empty() => Secret::from(p),
            _ => defaults.admin_password.clone().ok_or_else(|| {
                ArmError::InvalidInput(
                    "admin_password not provided and AZ_TEST_PASS not set".into(),
                )
            })?,
        };

        let spec = VmCreateSpec {
            resource_group: params.resource_group,
            vm_name: params.vm_name,
            location: params.location.unwrap_or_else(|| defaults.location.clone()),
            vm_size: params.vm_size.unwrap_or_else(|| defaults.vm_size.clone()),
            admin_username: params
                .admin_username
                .unwrap_or_else(|| defaults.admin_username.clone()),
            admin_password,
            image: params.image.unwrap_or_default(),
            nic_id: params.nic_id.filter(|id| !id.is_empty()),
            vnet_name: params.vnet_name.unwrap_or_else(|| defaults.vnet_name.clone()),
            subnet_name: params
                .subnet_name
                .unwrap_or_else(|| defaults.subnet_name.clone()),
            public_ip: params.public_ip.unwrap_or(false),
        };
        let settings = self.config.polling.settings(
            OperationKind::Deploy,
            params.timeout_secs,
            params.poll_interval_secs,
        );

        let created = self.arm.create_vm(&spec, settings).await?;
        serde_json::to_value(created)
            .map_err(|e| ArmError::InvalidInput(format!("unencodable result: {e}")))
    }

    async fn deploy_template_inner(&self, params: DeployTemplateParams) -> ArmResult<Value> {
        self.config.require_deploy("deploy_template")?;

        let template = parse_json("template_json", &params.template_json)?;
        if !template.is_object() {
            return Err(ArmError::InvalidInput(
                "template_json must be a JSON object".into(),
            ));
        }
        let parameters = match params.parameters_json.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_json("parameters_json", raw)?,
            _ => json!({}),
        };
        let settings = self.config.polling.settings(
            OperationKind::Deploy,
            params.timeout_secs,
            params.poll_interval_secs,
        );

        self.arm
            .deploy_template(
                &params.resource_group,
                &params.deployment_name,
                template,
                parameters,
                settings,
            )
            .await
    }
}
