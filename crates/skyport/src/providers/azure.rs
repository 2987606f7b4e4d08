//! Azure Resource Manager compute.
//!
//! Virtual machines are addressed by name inside the configured resource
//! group. Dependent resources (NICs, public IPs, virtual networks) are
//! addressed by their full ARM id, which is already a path.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use skyport_http::Request;
use tracing::{debug, info};

use super::{arm_template, require};
use crate::client::{Client, CreateServerOptions, ServerAction};
use crate::mapper::{list, lookup, set_text, text};
use crate::model::{Entity, EntityKind, Status};
use crate::pagination::{Cursor, Page, PageSource};
use crate::parser::ContentKind;
use crate::teardown::TeardownApi;
use crate::{Error, Result};

const COMPUTE_API_VERSION: &str = "2016-04-30-preview";
const MANAGEMENT_API_VERSION: &str = "2016-09-01";
const STORAGE_API_VERSION: &str = "2016-01-01";

const DEFAULT_IMAGE: &str = "Canonical:UbuntuServer:16.04.0-LTS:latest";

#[cfg(not(test))]
const DEPLOYMENT_POLL: Duration = Duration::from_secs(5);
#[cfg(test)]
const DEPLOYMENT_POLL: Duration = Duration::from_millis(1);

const POWER_STATE: &[(&str, Status)] = &[
    ("PowerState/running", Status::Running),
    ("PowerState/starting", Status::Provisioning),
    ("PowerState/stopping", Status::Stopped),
    ("PowerState/stopped", Status::Stopped),
    ("PowerState/deallocating", Status::Stopped),
    ("PowerState/deallocated", Status::Stopped),
];

const PROVISIONING_STATE: &[(&str, Status)] = &[
    ("Creating", Status::Provisioning),
    ("Updating", Status::Provisioning),
    ("Failed", Status::Error),
    ("Succeeded", Status::Running),
];

/// ARM fields usually sit under `properties`.
fn prop(payload: &Value, path: &[&str]) -> Option<String> {
    let nested: Vec<&str> = std::iter::once("properties").chain(path.iter().copied()).collect();
    text(payload, &nested).or_else(|| text(payload, path))
}

fn power_state(payload: &Value) -> Option<Status> {
    let statuses = lookup(payload, &["properties", "instanceView", "statuses"])
        .or_else(|| lookup(payload, &["instanceView", "statuses"]))
        .and_then(Value::as_array)?;

    statuses
        .iter()
        .filter_map(|s| text(s, &["code"]))
        .find(|code| code.get(..11).is_some_and(|p| p.eq_ignore_ascii_case("PowerState/")))
        .map(|code| Status::from_vocabulary(&code, POWER_STATE))
}

pub(super) fn map_server(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["name"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = power_state(payload)
        .or_else(|| prop(payload, &["provisioningState"]).map(|s| Status::from_vocabulary(&s, PROVISIONING_STATE)))
        .unwrap_or(Status::Unknown);

    set_text(entity, "location", text(payload, &["location"]));
    set_text(entity, "flavor", prop(payload, &["hardwareProfile", "vmSize"]));
    set_text(entity, "resource_id", text(payload, &["id"]));

    let image = ["publisher", "offer", "sku", "version"]
        .map(|field| prop(payload, &["storageProfile", "imageReference", field]));
    if image.iter().all(Option::is_some) {
        set_text(entity, "image_id", Some(image.into_iter().flatten().collect::<Vec<_>>().join(":")));
    }
}

/// Compute client for one subscription and resource group.
pub(crate) struct AzureCompute {
    client: Client,
    subscription_id: String,
    resource_group: String,
}

impl AzureCompute {
    pub(crate) fn new(client: Client) -> Result<Self> {
        let config = client.config();
        let subscription_id = super::require("subscription_id", config.subscription_id.clone())?;
        let resource_group = super::require("resource_group", config.resource_group.clone())?;
        Ok(Self {
            client,
            subscription_id,
            resource_group,
        })
    }

    fn group_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            urlencoding::encode(&self.subscription_id),
            urlencoding::encode(&self.resource_group),
        )
    }

    fn vm_path(&self, name: &str) -> String {
        format!(
            "{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.group_path(),
            urlencoding::encode(name)
        )
    }

    fn vms_path(&self) -> String {
        format!("{}/providers/Microsoft.Compute/virtualMachines", self.group_path())
    }

    /// A VM with its instance view, plus `hostname` when its first NIC
    /// has a public IP with a DNS name.
    pub(crate) async fn server(&self, name: &str) -> Result<Entity> {
        let request = Request::get(self.vm_path(name))
            .query("$expand", "instanceView")
            .query("api-version", COMPUTE_API_VERSION);
        let vm = self.client.fetch(request, ContentKind::Json).await?;

        let hostname = self.resolve_hostname(&vm).await?;
        let mut server = self.client.map(EntityKind::Server, vm);
        set_text(&mut server, "hostname", hostname);
        Ok(server)
    }

    async fn resolve_hostname(&self, vm: &Value) -> Result<Option<String>> {
        let Some(nic_id) = list(vm, &["properties", "networkProfile", "networkInterfaces"])
            .first()
            .and_then(|nic| text(nic, &["id"]))
        else {
            return Ok(None);
        };

        let nic = self.resource(&nic_id).await?;
        let Some(ip_id) = list(&nic, &["properties", "ipConfigurations"])
            .first()
            .and_then(|config| text(config, &["properties", "publicIPAddress", "id"]))
        else {
            return Ok(None);
        };

        let ip = self.resource(&ip_id).await?;
        let hostname = text(&ip, &["properties", "dnsSettings", "fqdn"]);
        debug!(nic = %nic_id, ?hostname, "azure: resolved hostname");
        Ok(hostname)
    }

    async fn resource(&self, id: &str) -> Result<Value> {
        let request = Request::get(id).query("api-version", MANAGEMENT_API_VERSION);
        self.client.fetch(request, ContentKind::Json).await
    }

    pub(crate) async fn power(&self, name: &str, action: ServerAction) -> Result<()> {
        let verb = match action {
            ServerAction::Reboot => "restart",
            ServerAction::Stop => "powerOff",
        };
        let request = Request::post(format!("{}/{verb}", self.vm_path(name))).query("api-version", COMPUTE_API_VERSION);
        self.client.send(request).await?;
        Ok(())
    }

    /// Deploy the VM template and return the new server.
    pub(crate) async fn create_server(&self, options: CreateServerOptions) -> Result<Entity> {
        let name = require("name", options.name)?;
        let username = require("username", options.username)?;
        let password = require("password", options.password)?;
        let flavor = require("flavor", options.flavor)?;
        let [publisher, offer, sku, version] = image_reference(options.image.as_deref().unwrap_or(DEFAULT_IMAGE))?;

        let parameters = json!({
            "vmName": { "value": name },
            "vmSize": { "value": flavor },
            "adminUsername": { "value": username },
            "adminPassword": { "value": password },
            "imagePublisher": { "value": publisher },
            "imageOffer": { "value": offer },
            "imageSku": { "value": sku },
            "imageVersion": { "value": version },
        });
        self.deploy(arm_template::compute()?, parameters).await?;
        self.server(&name).await
    }

    /// Submit an incremental deployment and wait until ARM settles it.
    async fn deploy(&self, template: Value, parameters: Value) -> Result<()> {
        let name = format!("skyport-{}", Utc::now().format("%Y%m%d-%H%M%S%3f"));
        let path = format!(
            "{}/providers/Microsoft.Resources/deployments/{name}",
            self.group_path()
        );
        let body = json!({
            "properties": { "template": template, "parameters": parameters, "mode": "Incremental" }
        });

        let put = Request::put(path.clone())
            .query("api-version", MANAGEMENT_API_VERSION)
            .json(body);
        let mut deployment = self.client.fetch(put, ContentKind::Json).await?;
        info!(deployment = %name, "azure: deployment submitted");

        loop {
            match prop(&deployment, &["provisioningState"]).as_deref() {
                Some("Succeeded") => return Ok(()),
                Some(state @ ("Failed" | "Canceled")) => {
                    return Err(Error::Deployment {
                        name,
                        state: state.to_string(),
                        message: prop(&deployment, &["error", "message"]).unwrap_or_else(|| "no details".into()),
                    });
                }
                state => debug!(deployment = %name, ?state, "azure: deployment in progress"),
            }
            tokio::time::sleep(DEPLOYMENT_POLL).await;
            let get = Request::get(path.clone()).query("api-version", MANAGEMENT_API_VERSION);
            deployment = self.client.fetch(get, ContentKind::Json).await?;
        }
    }

    pub(crate) async fn delete_vm(&self, name: &str) -> Result<()> {
        let request = Request::delete(self.vm_path(name)).query("api-version", COMPUTE_API_VERSION);
        self.client.send(request).await?;
        info!(server = name, "azure: server deleted");
        Ok(())
    }
}

/// `publisher:offer:sku[:version]`, version defaulting to `latest`.
fn image_reference(image: &str) -> Result<[String; 4]> {
    let parts: Vec<&str> = image.split(':').map(str::trim).collect();
    let parts = match parts.as_slice() {
        [publisher, offer, sku] => [*publisher, *offer, *sku, "latest"],
        [publisher, offer, sku, version] => [*publisher, *offer, *sku, *version],
        _ => [""; 4],
    };
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Validation {
            field: "image",
            reason: format!("`{image}` is not publisher:offer:sku[:version]"),
        });
    }
    Ok(parts.map(str::to_string))
}

#[async_trait]
impl TeardownApi for AzureCompute {
    async fn authenticate(&self) -> Result<()> {
        self.client.authenticate().await
    }

    async fn get_server(&self, id: &str) -> Result<Entity> {
        self.server(id).await
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        self.delete_vm(id).await
    }

    async fn get_resource(&self, id: &str) -> Result<Value> {
        self.resource(id).await
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        let request = Request::delete(id).query("api-version", MANAGEMENT_API_VERSION);
        self.client.send(request).await?;
        Ok(())
    }

    async fn delete_storage_account(&self, name: &str) -> Result<()> {
        let path = format!(
            "{}/providers/Microsoft.Storage/storageAccounts/{}",
            self.group_path(),
            urlencoding::encode(name)
        );
        let request = Request::delete(path).query("api-version", STORAGE_API_VERSION);
        self.client.send(request).await?;
        Ok(())
    }
}

// ── Listing ─────────────────────────────────────────────────────────

/// VMs in the resource group. ARM picks the page size and hands back an
/// absolute `nextLink` to follow.
pub(super) struct Servers {
    compute: AzureCompute,
}

impl Servers {
    pub(super) fn new(compute: AzureCompute) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl PageSource for Servers {
    fn max_page_size(&self) -> Option<usize> {
        None
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>, _page_size: Option<usize>) -> Result<Page> {
        let request = match cursor {
            Some(link) => Request::get(link.as_str()),
            None => Request::get(self.compute.vms_path()).query("api-version", COMPUTE_API_VERSION),
        };

        let client = &self.compute.client;
        let body = client.fetch(request, ContentKind::Json).await?;
        let next = text(&body, &["nextLink"]).filter(|l| !l.is_empty()).map(Cursor::new);
        let items = crate::mapper::take_array(body, Some("value"))
            .into_iter()
            .map(|raw| client.map(EntityKind::Server, raw))
            .collect();
        Ok(Page { items, next })
    }
}
