//! Server teardown with optional cleanup of dependent resources.
//!
//! Runs strictly in order: authenticate, fetch the server, delete it,
//! then (only if that succeeded) the network interfaces, public IPs,
//! virtual networks and storage account it used. Everything needed to
//! find the dependents is read before the first of them is deleted.
//!
//! A failure before or during the server deletion aborts the run. After
//! that, every failure is recorded and the remaining steps still run;
//! if any were recorded the result is [`Error::PartialFailure`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::mapper::{list, text};
use crate::model::Entity;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownOptions {
    pub destroy_nics: bool,
    pub destroy_public_ip: bool,
    pub destroy_vnet: bool,
    pub destroy_storage: bool,
}

impl TeardownOptions {
    pub fn everything() -> Self {
        Self {
            destroy_nics: true,
            destroy_public_ip: true,
            destroy_vnet: true,
            destroy_storage: true,
        }
    }

    fn any(&self) -> bool {
        self.destroy_nics || self.destroy_public_ip || self.destroy_vnet || self.destroy_storage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependentCategory {
    NetworkInterface,
    PublicIp,
    VirtualNetwork,
    StorageAccount,
}

impl fmt::Display for DependentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NetworkInterface => "network interface",
            Self::PublicIp => "public ip",
            Self::VirtualNetwork => "virtual network",
            Self::StorageAccount => "storage account",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    /// Reading the details that name the dependents.
    Resolve,
    Delete,
}

/// One step that did not complete.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    pub category: DependentCategory,
    /// Resource id (or storage account name) the step was acting on.
    pub resource: String,
    pub stage: TeardownStage,
    pub error: Arc<Error>,
}

/// Dependents named by the server's pre-deletion details.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownPlan {
    pub nics: Vec<String>,
    pub public_ips: Vec<String>,
    pub vnets: Vec<String>,
    pub storage_account: Option<String>,
}

impl TeardownPlan {
    /// NIC ids and storage account from the server payload. Public IPs and
    /// vnets come from the NIC details, see [`TeardownPlan::add_nic`].
    pub fn from_server(server: &Value) -> Self {
        let nics = props(server, &["networkProfile", "networkInterfaces"])
            .iter()
            .filter_map(|nic| text(nic, &["id"]))
            .collect();

        let storage_account = props_text(server, &["storageProfile", "osDisk", "vhd", "uri"])
            .as_deref()
            .and_then(storage_account_name);

        Self {
            nics,
            storage_account,
            ..Self::default()
        }
    }

    /// Record the public IPs and vnets referenced by one NIC's details.
    pub fn add_nic(&mut self, nic: &Value) {
        for config in props(nic, &["ipConfigurations"]) {
            if let Some(ip) = props_text(config, &["publicIPAddress", "id"]) {
                push_unique(&mut self.public_ips, ip);
            }
            if let Some(vnet) = props_text(config, &["subnet", "id"]).as_deref().and_then(vnet_id) {
                push_unique(&mut self.vnets, vnet);
            }
        }
    }
}

/// ARM payloads nest most fields under `properties`; older flattened
/// payloads do not.
fn props<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    let nested: Vec<&str> = std::iter::once("properties").chain(path.iter().copied()).collect();
    match list(value, &nested) {
        [] => list(value, path),
        found => found,
    }
}

fn props_text(value: &Value, path: &[&str]) -> Option<String> {
    let nested: Vec<&str> = std::iter::once("properties").chain(path.iter().copied()).collect();
    text(value, &nested).or_else(|| text(value, path))
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Subnet id up to (not including) `/subnets/`.
fn vnet_id(subnet: &str) -> Option<String> {
    subnet
        .find("/subnets/")
        .map(|at| subnet[..at].to_string())
        .filter(|id| !id.is_empty())
}

/// Host label of an `https://` blob URI: `https://acct.blob.core.windows.net/..` → `acct`.
fn storage_account_name(uri: &str) -> Option<String> {
    let host = uri.strip_prefix("https://")?;
    let label = host.split(['.', '/']).next()?;
    (!label.is_empty()).then(|| label.to_string())
}

#[derive(Debug, Clone)]
pub struct TeardownReport {
    /// The server as it was before deletion.
    pub server: Entity,
    pub removed: Vec<(DependentCategory, String)>,
}

/// The provider calls a teardown needs.
#[async_trait]
pub trait TeardownApi: Send + Sync {
    async fn authenticate(&self) -> Result<()>;
    async fn get_server(&self, id: &str) -> Result<Entity>;
    async fn delete_server(&self, id: &str) -> Result<()>;
    /// Fetch a dependent resource by its full id.
    async fn get_resource(&self, id: &str) -> Result<Value>;
    async fn delete_resource(&self, id: &str) -> Result<()>;
    async fn delete_storage_account(&self, name: &str) -> Result<()>;
}

#[derive(Default)]
struct Run {
    removed: Vec<(DependentCategory, String)>,
    failures: Vec<TeardownFailure>,
}

impl Run {
    fn fail(&mut self, category: DependentCategory, resource: &str, stage: TeardownStage, error: Arc<Error>) {
        warn!(%category, resource, ?stage, %error, "teardown: step failed");
        self.failures.push(TeardownFailure {
            category,
            resource: resource.to_string(),
            stage,
            error,
        });
    }

    async fn delete_each(&mut self, api: &dyn TeardownApi, category: DependentCategory, ids: &[String]) {
        for id in ids {
            match api.delete_resource(id).await {
                Ok(()) => {
                    info!(%category, resource = %id, "teardown: removed");
                    self.removed.push((category, id.clone()));
                }
                Err(e) => self.fail(category, id, TeardownStage::Delete, Arc::new(e)),
            }
        }
    }
}

pub async fn teardown(api: &dyn TeardownApi, server_id: &str, options: TeardownOptions) -> Result<TeardownReport> {
    api.authenticate().await?;
    let server = api.get_server(server_id).await?;
    api.delete_server(server_id).await?;
    info!(server = server_id, "teardown: server deleted");

    let mut run = Run::default();
    if options.any() {
        let mut plan = TeardownPlan::from_server(server.raw());

        if options.destroy_public_ip || options.destroy_vnet {
            for nic in plan.nics.clone() {
                match api.get_resource(&nic).await {
                    Ok(details) => plan.add_nic(&details),
                    Err(e) => {
                        // Without every NIC's details the lists are incomplete.
                        let error = Arc::new(e);
                        if options.destroy_public_ip {
                            run.fail(DependentCategory::PublicIp, &nic, TeardownStage::Resolve, error.clone());
                        }
                        if options.destroy_vnet {
                            run.fail(DependentCategory::VirtualNetwork, &nic, TeardownStage::Resolve, error);
                        }
                        plan.public_ips.clear();
                        plan.vnets.clear();
                        break;
                    }
                }
            }
        }

        if options.destroy_nics {
            run.delete_each(api, DependentCategory::NetworkInterface, &plan.nics).await;
        }
        if options.destroy_public_ip {
            run.delete_each(api, DependentCategory::PublicIp, &plan.public_ips).await;
        }
        if options.destroy_vnet {
            run.delete_each(api, DependentCategory::VirtualNetwork, &plan.vnets).await;
        }
        if options.destroy_storage
            && let Some(account) = &plan.storage_account
        {
            match api.delete_storage_account(account).await {
                Ok(()) => {
                    info!(account = %account, "teardown: storage account removed");
                    run.removed.push((DependentCategory::StorageAccount, account.clone()));
                }
                Err(e) => run.fail(DependentCategory::StorageAccount, account, TeardownStage::Delete, Arc::new(e)),
            }
        }
    }

    if run.failures.is_empty() {
        Ok(TeardownReport {
            server,
            removed: run.removed,
        })
    } else {
        Err(Error::PartialFailure {
            server: Box::new(server),
            failures: run.failures,
        })
    }
}
