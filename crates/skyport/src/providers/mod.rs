//! Per-provider bindings: field tables for the mapper, page sources for
//! the paginator, and the single-resource calls.

mod amazon;
mod arm_template;
mod azure;
mod joyent;
mod openstack;
mod rackspace;
mod redistogo;

pub(crate) use azure::AzureCompute;

use async_trait::async_trait;
use serde_json::Value;
use skyport_http::Request;

use crate::client::{Client, CreateInstanceOptions, CreateServerOptions, ServerAction};
use crate::mapper::{self, text};
use crate::model::{Entity, EntityKind};
use crate::pagination::{Cursor, Page, PageSource};
use crate::parser::ContentKind;
use crate::{Error, ProviderName, Result};

/// Entity kinds each provider exposes.
pub(crate) fn supports(provider: ProviderName, kind: EntityKind) -> bool {
    use EntityKind::*;
    match provider {
        ProviderName::Rackspace => true,
        ProviderName::Openstack => matches!(kind, Server | Image | Flavor | File | LoadBalancer),
        ProviderName::Amazon => matches!(kind, Server | Image | File),
        ProviderName::Azure => kind == Server,
        ProviderName::Joyent => matches!(kind, Server | Image | Flavor),
        ProviderName::Redistogo => kind == Instance,
    }
}

pub(crate) fn map_fields(provider: ProviderName, kind: EntityKind, payload: &Value, entity: &mut Entity) {
    use EntityKind::*;
    use ProviderName::*;
    match (provider, kind) {
        (Rackspace | Openstack, Server) => openstack::map_server(payload, entity),
        (Rackspace | Openstack, Image) => openstack::map_image(payload, entity),
        (Rackspace | Openstack, Flavor) => openstack::map_flavor(payload, entity),
        (Rackspace | Openstack, File) => openstack::map_file(payload, entity),
        (Rackspace, Instance) => rackspace::map_instance(payload, entity),
        (Rackspace, LoadBalancer) => rackspace::map_load_balancer(payload, entity),
        (Openstack, LoadBalancer) => openstack::map_load_balancer(payload, entity),
        (Amazon, Server) => amazon::map_server(payload, entity),
        (Amazon, Image) => amazon::map_image(payload, entity),
        (Amazon, File) => amazon::map_file(payload, entity),
        (Azure, Server) => azure::map_server(payload, entity),
        (Joyent, Server) => joyent::map_server(payload, entity),
        (Joyent, Image) => joyent::map_image(payload, entity),
        (Joyent, Flavor) => joyent::map_flavor(payload, entity),
        (Redistogo, Instance) => redistogo::map_instance(payload, entity),
        _ => map_generic(payload, entity),
    }
}

/// Fallback for payloads without a dedicated table.
fn map_generic(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
}

pub(crate) fn page_source(client: &Client, kind: EntityKind, container: Option<&str>) -> Result<Box<dyn PageSource>> {
    use EntityKind::*;
    use ProviderName::*;
    let source: Box<dyn PageSource> = match (client.provider(), kind) {
        (Rackspace | Openstack, File) => Box::new(openstack::files(client, require_container(container)?)),
        (Rackspace | Openstack, Server | Image | Flavor) => Box::new(openstack::compute(client, kind)),
        (Rackspace, Instance) => Box::new(rackspace::instances(client)),
        (Rackspace, LoadBalancer) => Box::new(rackspace::load_balancers(client)),
        (Openstack, LoadBalancer) => Box::new(openstack::load_balancers(client)),
        (Amazon, Server) => Box::new(amazon::Instances::new(client)),
        (Amazon, Image) => Box::new(amazon::images(client)),
        (Amazon, File) => Box::new(amazon::Objects::new(client, require_container(container)?)),
        (Azure, Server) => Box::new(azure::Servers::new(AzureCompute::new(client.clone())?)),
        (Joyent, Server) => Box::new(joyent::Machines::new(client)),
        (Joyent, Image | Flavor) => Box::new(joyent::catalog(client, kind)),
        (Redistogo, Instance) => Box::new(redistogo::instances(client)),
        _ => return Err(client.unsupported(format!("listing {kind}"))),
    };
    Ok(source)
}

pub(crate) async fn get(client: &Client, kind: EntityKind, id: &str, container: Option<&str>) -> Result<Entity> {
    use EntityKind::*;
    use ProviderName::*;
    match (client.provider(), kind) {
        (Rackspace | Openstack, File) => openstack::head_object(client, require_container(container)?, id).await,
        (Rackspace | Openstack, Server | Image | Flavor) => openstack::get(client, kind, id).await,
        (Rackspace, Instance | LoadBalancer) => rackspace::get(client, kind, id).await,
        (Openstack, LoadBalancer) => openstack::get(client, kind, id).await,
        (Amazon, File) => amazon::head_object(client, require_container(container)?, id).await,
        (Amazon, Server | Image) => amazon::get(client, kind, id).await,
        (Azure, Server) => AzureCompute::new(client.clone())?.server(id).await,
        (Joyent, _) => joyent::get(client, kind, id).await,
        (Redistogo, _) => redistogo::get(client, id).await,
        _ => Err(client.unsupported(format!("get {kind}"))),
    }
}

pub(crate) async fn destroy(client: &Client, kind: EntityKind, id: &str, container: Option<&str>) -> Result<()> {
    use EntityKind::*;
    use ProviderName::*;
    match (client.provider(), kind) {
        (Rackspace | Openstack | Amazon, File) => {
            let path = crate::upload::object_path(require_container(container)?, id);
            client.send(Request::delete(path)).await?;
            Ok(())
        }
        (Rackspace | Openstack, Server | Image | LoadBalancer) | (Rackspace, Instance) => {
            client.send(Request::delete(resource_path(client.provider(), kind, id))).await?;
            Ok(())
        }
        (Amazon, Server | Image) => amazon::destroy(client, kind, id).await,
        (Azure, Server) => AzureCompute::new(client.clone())?.delete_vm(id).await,
        (Joyent, Server | Image) => joyent::destroy(client, kind, id).await,
        (Redistogo, Instance) => redistogo::destroy(client, id).await,
        _ => Err(client.unsupported(format!("destroy {kind}"))),
    }
}

pub(crate) async fn create_instance(client: &Client, options: CreateInstanceOptions) -> Result<Entity> {
    match client.provider() {
        ProviderName::Rackspace => rackspace::create_instance(client, options).await,
        ProviderName::Redistogo => redistogo::create_instance(client, options).await,
        _ => Err(client.unsupported("create instance")),
    }
}

pub(crate) async fn create_server(client: &Client, options: CreateServerOptions) -> Result<Entity> {
    match client.provider() {
        ProviderName::Rackspace | ProviderName::Openstack => openstack::create_server(client, options).await,
        ProviderName::Azure => AzureCompute::new(client.clone())?.create_server(options).await,
        _ => Err(client.unsupported("create server")),
    }
}

pub(crate) async fn server_action(client: &Client, id: &str, action: ServerAction) -> Result<()> {
    let id = require("id", Some(id.to_string()))?;
    match client.provider() {
        ProviderName::Rackspace | ProviderName::Openstack => openstack::server_action(client, &id, action).await,
        ProviderName::Amazon => amazon::server_action(client, &id, action).await,
        ProviderName::Azure => AzureCompute::new(client.clone())?.power(&id, action).await,
        ProviderName::Joyent => joyent::server_action(client, &id, action).await,
        ProviderName::Redistogo => Err(client.unsupported(format!("{action} server"))),
    }
}

/// Only Nova can rename in place; ARM names are immutable.
pub(crate) async fn rename_server(client: &Client, id: &str, name: &str) -> Result<Entity> {
    match client.provider() {
        ProviderName::Rackspace | ProviderName::Openstack => {
            let id = require("id", Some(id.to_string()))?;
            openstack::rename_server(client, &id, name).await
        }
        _ => Err(client.unsupported("rename server")),
    }
}

/// Path of a single Keystone-family resource.
fn resource_path(provider: ProviderName, kind: EntityKind, id: &str) -> String {
    let id = urlencoding::encode(id);
    match (provider, kind) {
        (_, EntityKind::Server) => format!("/servers/{id}"),
        (_, EntityKind::Image) => format!("/images/{id}"),
        (_, EntityKind::Flavor) => format!("/flavors/{id}"),
        (_, EntityKind::Instance) => format!("/instances/{id}"),
        (ProviderName::Openstack, EntityKind::LoadBalancer) => format!("/v2.0/lbaas/loadbalancers/{id}"),
        (_, EntityKind::LoadBalancer) => format!("/loadbalancers/{id}"),
        (_, EntityKind::File) => format!("/{id}"),
    }
}

fn require_container(container: Option<&str>) -> Result<&str> {
    container
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Validation {
            field: "container",
            reason: "files are listed per container".into(),
        })
}

pub(crate) fn require(field: &'static str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Validation {
            field,
            reason: "required".into(),
        })
}

/// GET `path` and map the object under `key`.
async fn fetch_one(client: &Client, kind: EntityKind, request: Request, key: &str) -> Result<Entity> {
    let body = client.fetch(request, ContentKind::Json).await?;
    Ok(client.map(kind, mapper::take_object(body, key)))
}

// ── Marker listings ─────────────────────────────────────────────────

/// A JSON list endpoint paged with `limit` and `marker`, where the
/// marker is a key of the last item already seen.
pub(crate) struct MarkerListing {
    client: Client,
    kind: EntityKind,
    path: String,
    /// Key holding the array; `None` when the body is the array.
    collection: Option<&'static str>,
    cursor_field: &'static str,
    max_page_size: usize,
    query: Vec<(String, String)>,
    container: Option<String>,
}

impl MarkerListing {
    pub(crate) fn new(
        client: &Client,
        kind: EntityKind,
        path: impl Into<String>,
        collection: Option<&'static str>,
        max_page_size: usize,
    ) -> Self {
        Self {
            client: client.clone(),
            kind,
            path: path.into(),
            collection,
            cursor_field: "id",
            max_page_size,
            query: Vec::new(),
            container: None,
        }
    }

    pub(crate) fn cursor_field(mut self, field: &'static str) -> Self {
        self.cursor_field = field;
        self
    }

    pub(crate) fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub(crate) fn in_container(mut self, container: &str) -> Self {
        self.container = Some(container.into());
        self
    }
}

#[async_trait]
impl PageSource for MarkerListing {
    fn max_page_size(&self) -> Option<usize> {
        Some(self.max_page_size)
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: Option<usize>) -> Result<Page> {
        let mut request = Request::get(self.path.clone());
        for (key, value) in &self.query {
            request = request.query(key, value);
        }
        if let Some(size) = page_size {
            request = request.query("limit", size.to_string());
        }
        if let Some(cursor) = cursor {
            request = request.query("marker", cursor.as_str());
        }

        let body = self.client.fetch(request, ContentKind::Json).await?;
        let items = mapper::take_array(body, self.collection);
        let next = items
            .last()
            .and_then(|last| text(last, &[self.cursor_field]))
            .map(Cursor::new);

        let items = items
            .into_iter()
            .map(|raw| self.client.map_in(self.kind, self.container.as_deref(), raw))
            .collect();
        Ok(Page { items, next })
    }
}

// ── Single-page listings ────────────────────────────────────────────

/// A list endpoint that returns everything in one response.
pub(crate) struct SinglePage {
    client: Client,
    kind: EntityKind,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    format: ContentKind,
    extract: fn(Value) -> Vec<Value>,
}

impl SinglePage {
    pub(crate) fn new(client: &Client, kind: EntityKind, path: impl Into<String>, extract: fn(Value) -> Vec<Value>) -> Self {
        Self {
            client: client.clone(),
            kind,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            format: ContentKind::Json,
            extract,
        }
    }

    pub(crate) fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn format(mut self, format: ContentKind) -> Self {
        self.format = format;
        self
    }
}

#[async_trait]
impl PageSource for SinglePage {
    fn max_page_size(&self) -> Option<usize> {
        None
    }

    async fn fetch_page(&self, _cursor: Option<&Cursor>, _page_size: Option<usize>) -> Result<Page> {
        let mut request = Request::get(self.path.clone());
        for (key, value) in &self.query {
            request = request.query(key, value);
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let body = self.client.fetch(request, self.format).await?;
        let items = (self.extract)(body)
            .into_iter()
            .map(|raw| self.client.map(self.kind, raw))
            .collect();
        Ok(Page { items, next: None })
    }
}

/// The body itself is the array.
pub(crate) fn top_level(body: Value) -> Vec<Value> {
    mapper::take_array(body, None)
}
