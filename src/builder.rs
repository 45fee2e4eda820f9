//! VM creation as a fixed, fail-fast chain of ARM calls:
//! public IP (optional) -> virtual network check -> NIC -> compute.
//!
//! Nothing is rolled back when a step fails; whatever was already created is
//! left for the caller to clean up.

use std::fmt;

use azure_core::credentials::Secret;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::arm::{ArmEndpoint, COMPUTE_WRITE_API_VERSION, NETWORK_API_VERSION};
use crate::error::{ArmError, ArmResult};
use crate::executor::{Executor, OperationOutcome, OperationRequest};
use crate::lro::{LroCompletion, LroDriver, PollSettings};
use crate::observe::{OperationEvent, OperationObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    PublicIp,
    VnetCheck,
    Nic,
    Compute,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::PublicIp => "public-ip",
            StepKind::VnetCheck => "vnet-check",
            StepKind::Nic => "nic",
            StepKind::Compute => "compute",
        })
    }
}

/// A finished step and the resource id it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub kind: StepKind,
    pub resource_id: String,
}

/// Marketplace image to boot from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl Default for ImageReference {
    fn default() -> Self {
        Self {
            publisher: "Canonical".into(),
            offer: "UbuntuServer".into(),
            sku: "18.04-LTS".into(),
            version: "latest".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmCreateSpec {
    pub resource_group: String,
    pub vm_name: String,
    pub location: String,
    pub vm_size: String,
    pub admin_username: String,
    pub admin_password: Secret,
    pub image: ImageReference,
    /// Existing NIC to attach.  When set, the network steps are skipped.
    pub nic_id: Option<String>,
    pub vnet_name: String,
    pub subnet_name: String,
    pub public_ip: bool,
}

impl VmCreateSpec {
    fn public_ip_name(&self) -> String {
        format!("{}-pip", self.vm_name)
    }

    fn nic_name(&self) -> String {
        format!("{}-nic", self.vm_name)
    }

    fn os_disk_name(&self) -> String {
        format!("{}-osdisk", self.vm_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicIpSku {
    /// Basic SKU, dynamic allocation.
    Basic,
    /// Standard SKU, static allocation.
    Standard,
}

pub fn public_ip_body(location: &str, sku: PublicIpSku) -> Value {
    match sku {
        PublicIpSku::Basic => json!({
            "location": location,
            "properties": {"publicIPAllocationMethod": "Dynamic"}
        }),
        PublicIpSku::Standard => json!({
            "location": location,
            "sku": {"name": "Standard"},
            "properties": {"publicIPAllocationMethod": "Static"}
        }),
    }
}

pub fn nic_body(location: &str, subnet_id: &str, public_ip_id: Option<&str>) -> Value {
    let mut ip_config = json!({
        "name": "ipconfig1",
        "properties": {
            "subnet": {"id": subnet_id},
            "privateIPAllocationMethod": "Dynamic"
        }
    });
    if let Some(pip) = public_ip_id {
        ip_config["properties"]["publicIPAddress"] = json!({"id": pip});
    }
    json!({
        "location": location,
        "properties": {"ipConfigurations": [ip_config]}
    })
}

pub fn vm_body(spec: &VmCreateSpec, nic_id: &str) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "hardwareProfile": {"vmSize": spec.vm_size},
            "storageProfile": {
                "imageReference": spec.image,
                "osDisk": {
                    "caching": "ReadWrite",
                    "managedDisk": {"storageAccountType": "Premium_LRS"},
                    "name": spec.os_disk_name(),
                    "createOption": "FromImage"
                }
            },
            "osProfile": {
                "adminUsername": spec.admin_username,
                "computerName": spec.vm_name,
                "adminPassword": spec.admin_password.secret(),
                "linuxConfiguration": {
                    "provisionVMAgent": true,
                    "patchSettings": {"patchMode": "ImageDefault"}
                }
            },
            "networkProfile": {
                "networkInterfaces": [{"id": nic_id, "properties": {"primary": true}}]
            }
        }
    })
}

/// Provider error codes that make public IP creation retry once with a
/// Standard SKU.
#[derive(Debug, Clone, Default)]
pub struct PublicIpFallback {
    codes: Vec<String>,
}

impl PublicIpFallback {
    pub fn new(codes: Vec<String>) -> Self {
        Self { codes }
    }

    /// The matching provider code, if `err` should trigger the fallback.
    pub fn triggered_by<'e>(&self, err: &'e ArmError) -> Option<&'e str> {
        let code = err.provider_code()?;
        self.codes.iter().any(|c| c == code).then_some(code)
    }
}

/// Outcome of a completed chain.
#[derive(Debug, Clone, Serialize)]
pub struct VmCreation {
    pub vm_id: String,
    pub steps: Vec<StepRecord>,
    /// Polls spent waiting on the compute resource.
    pub polls: u32,
    /// Compute resource body, when the provider answered synchronously.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<Value>,
}

pub struct VmChain<'a> {
    pub executor: &'a Executor,
    pub lro: &'a LroDriver,
    pub endpoint: &'a ArmEndpoint,
    pub observer: &'a dyn OperationObserver,
    pub fallback: &'a PublicIpFallback,
    pub settings: PollSettings,
}

impl VmChain<'_> {
    pub async fn run(&self, spec: &VmCreateSpec, token: &Secret) -> ArmResult<VmCreation> {
        let mut steps = Vec::new();

        let nic_id = match &spec.nic_id {
            Some(id) => id.clone(),
            None => {
                let public_ip_id = if spec.public_ip {
                    self.started(StepKind::PublicIp, &spec.public_ip_name());
                    let id = self.create_public_ip(spec, token).await?;
                    steps.push(self.finished(StepKind::PublicIp, id.clone()));
                    Some(id)
                } else {
                    None
                };

                self.started(StepKind::VnetCheck, &spec.vnet_name);
                let subnet_id = self.check_vnet(spec, token).await?;
                steps.push(self.finished(StepKind::VnetCheck, subnet_id.clone()));

                self.started(StepKind::Nic, &spec.nic_name());
                let nic_id = self
                    .create_nic(spec, &subnet_id, public_ip_id.as_deref(), token)
                    .await?;
                steps.push(self.finished(StepKind::Nic, nic_id.clone()));
                nic_id
            }
        };

        self.started(StepKind::Compute, &spec.vm_name);
        let vm_id = self.endpoint.resource_id(
            &spec.resource_group,
            "Microsoft.Compute/virtualMachines",
            &spec.vm_name,
        );
        let (vm_id, done) = self
            .put_resource(
                StepKind::Compute,
                &vm_id,
                COMPUTE_WRITE_API_VERSION,
                vm_body(spec, &nic_id),
                token,
            )
            .await?;
        steps.push(self.finished(StepKind::Compute, vm_id.clone()));

        Ok(VmCreation {
            vm_id,
            steps,
            polls: done.polls,
            vm: if done.polls == 0 { done.body } else { None },
        })
    }

    fn started(&self, step: StepKind, name: &str) {
        self.observer.emit(&OperationEvent::StepStarted {
            step,
            name: name.to_string(),
        });
    }

    fn finished(&self, kind: StepKind, resource_id: String) -> StepRecord {
        self.observer.emit(&OperationEvent::StepFinished {
            step: kind,
            resource_id: resource_id.clone(),
        });
        StepRecord { kind, resource_id }
    }

    /// PUT `id` and drive the outcome to completion.  Returns the produced
    /// resource id: the synchronous body's `id` when present, else `id`.
    async fn put_resource(
        &self,
        step: StepKind,
        id: &str,
        api_version: &str,
        body: Value,
        token: &Secret,
    ) -> ArmResult<(String, LroCompletion)> {
        let request = OperationRequest::put(self.endpoint.url(id), api_version, body);
        let outcome = self.executor.execute(&request, token).await?;
        let done = self
            .lro
            .drive(&format!("create {step} {id}"), outcome, token, self.settings)
            .await?;

        let produced = done
            .body
            .as_ref()
            .filter(|_| done.polls == 0)
            .and_then(|b| b.get("id"))
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string();
        Ok((produced, done))
    }

    async fn create_public_ip(&self, spec: &VmCreateSpec, token: &Secret) -> ArmResult<String> {
        let name = spec.public_ip_name();
        let id = self.endpoint.resource_id(
            &spec.resource_group,
            "Microsoft.Network/publicIPAddresses",
            &name,
        );

        let first = self
            .put_resource(
                StepKind::PublicIp,
                &id,
                NETWORK_API_VERSION,
                public_ip_body(&spec.location, PublicIpSku::Basic),
                token,
            )
            .await;

        match first {
            Ok((produced, _)) => Ok(produced),
            Err(err) => {
                let Some(code) = self.fallback.triggered_by(&err) else {
                    return Err(err);
                };
                self.observer.emit(&OperationEvent::SkuFallback {
                    name,
                    code: code.to_string(),
                });
                let (produced, _) = self
                    .put_resource(
                        StepKind::PublicIp,
                        &id,
                        NETWORK_API_VERSION,
                        public_ip_body(&spec.location, PublicIpSku::Standard),
                        token,
                    )
                    .await?;
                Ok(produced)
            }
        }
    }

    /// Confirm the virtual network (and subnet, when the provider lists
    /// subnets) exists.  Never creates anything.
    async fn check_vnet(&self, spec: &VmCreateSpec, token: &Secret) -> ArmResult<String> {
        let vnet_id = self.endpoint.resource_id(
            &spec.resource_group,
            "Microsoft.Network/virtualNetworks",
            &spec.vnet_name,
        );
        let request = OperationRequest::get(self.endpoint.url(&vnet_id), NETWORK_API_VERSION);

        let body = match self.executor.execute(&request, token).await? {
            OperationOutcome::Failed { status, body } => {
                let error = ArmError::Request { status, body };
                let absent = status == 404
                    || matches!(error.provider_code(), Some("ResourceNotFound" | "NotFound"));
                if !absent {
                    return Err(error);
                }
                return Err(ArmError::NotFound(format!(
                    "virtual network '{}' in resource group '{}'",
                    spec.vnet_name, spec.resource_group
                )));
            }
            OperationOutcome::Completed(body) => body,
            OperationOutcome::Accepted(_) => None,
        };

        let listed = body
            .as_ref()
            .and_then(|b| b.pointer("/properties/subnets"))
            .and_then(Value::as_array);
        if let Some(subnets) = listed {
            let present = subnets
                .iter()
                .any(|s| s.get("name").and_then(Value::as_str) == Some(spec.subnet_name.as_str()));
            if !present {
                return Err(ArmError::NotFound(format!(
                    "subnet '{}' in virtual network '{}' (resource group '{}')",
                    spec.subnet_name, spec.vnet_name, spec.resource_group
                )));
            }
        }

        Ok(format!("{vnet_id}/subnets/{}", spec.subnet_name))
    }

    async fn create_nic(
        &self,
        spec: &VmCreateSpec,
        subnet_id: &str,
        public_ip_id: Option<&str>,
        token: &Secret,
    ) -> ArmResult<String> {
        let id = self.endpoint.resource_id(
            &spec.resource_group,
            "Microsoft.Network/networkInterfaces",
            &spec.nic_name(),
        );
        let (produced, _) = self
            .put_resource(
                StepKind::Nic,
                &id,
                NETWORK_API_VERSION,
                nic_body(&spec.location, subnet_id, public_ip_id),
                token,
            )
            .await?;
        Ok(produced)
    }
}
