//! Joyent CloudAPI. Machines page by offset; images and packages come
//! back whole.

use async_trait::async_trait;
use serde_json::Value;
use skyport_http::Request;

use super::{SinglePage, top_level};
use crate::client::{Client, ServerAction};
use crate::mapper::{list, lookup, number, partition_addresses, set_attr, set_number, set_text, text};
use crate::model::{Entity, EntityKind, Status};
use crate::pagination::{Cursor, Page, PageSource};
use crate::parser::ContentKind;
use crate::{Error, Result};

const API_VERSION: &str = "~7.0";
const MACHINE_PAGE: usize = 1_000;

const MACHINE_STATUS: &[(&str, Status)] = &[
    ("PROVISIONING", Status::Provisioning),
    ("RUNNING", Status::Running),
    ("STOPPING", Status::Stopped),
    ("STOPPED", Status::Stopped),
    ("FAILED", Status::Error),
];

const IMAGE_STATUS: &[(&str, Status)] = &[
    ("active", Status::Running),
    ("creating", Status::Provisioning),
    ("unactivated", Status::Provisioning),
    ("disabled", Status::Stopped),
    ("failed", Status::Error),
];

fn get_request(path: impl Into<String>) -> Request {
    Request::get(path).header("X-Api-Version", API_VERSION)
}

fn state(payload: &Value, table: &[(&str, Status)]) -> Status {
    text(payload, &["state"])
        .map(|raw| Status::from_vocabulary(&raw, table))
        .unwrap_or(Status::Unknown)
}

pub(super) fn map_server(payload: &Value, entity: &mut Entity) {
    let ips: Vec<String> = list(payload, &["ips"])
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = state(payload, MACHINE_STATUS);
    entity.addresses = partition_addresses(&ips);

    set_text(entity, "image_id", text(payload, &["dataset"]).or_else(|| text(payload, &["image"])));
    set_text(entity, "flavor", text(payload, &["package"]));
    set_number(entity, "ram", number(payload, &["memory"]));
    set_number(entity, "disk", number(payload, &["disk"]));
    set_text(entity, "type", text(payload, &["type"]));
    set_text(entity, "created", text(payload, &["created"]));
    set_text(entity, "updated", text(payload, &["updated"]));
    set_attr(entity, "metadata", payload.get("metadata").cloned());
    set_text(entity, "admin_pass", text(payload, &["metadata", "credentials", "admin"]));
}

pub(super) fn map_image(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = state(payload, IMAGE_STATUS);

    set_text(entity, "version", text(payload, &["version"]));
    set_text(entity, "os", text(payload, &["os"]));
    set_text(entity, "created", text(payload, &["published_at"]));
}

pub(super) fn map_flavor(payload: &Value, entity: &mut Entity) {
    entity.name = text(payload, &["name"]);
    entity.id = text(payload, &["id"]).or_else(|| entity.name.clone()).unwrap_or_default();

    set_number(entity, "ram", number(payload, &["memory"]));
    set_number(entity, "disk", number(payload, &["disk"]));
    set_number(entity, "vcpus", number(payload, &["vcpus"]));
    set_attr(entity, "default", lookup(payload, &["default"]).cloned());
}

// ── Listings ────────────────────────────────────────────────────────

/// `/my/machines`, paged with `limit` / `offset`. The cursor is the
/// offset of the next page.
pub(super) struct Machines {
    client: Client,
}

impl Machines {
    pub(super) fn new(client: &Client) -> Self {
        Self { client: client.clone() }
    }
}

#[async_trait]
impl PageSource for Machines {
    fn max_page_size(&self) -> Option<usize> {
        Some(MACHINE_PAGE)
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: Option<usize>) -> Result<Page> {
        let offset = match cursor {
            Some(c) => c.as_str().parse::<usize>().map_err(|_| Error::Validation {
                field: "marker",
                reason: format!("`{c}` is not a machine offset"),
            })?,
            None => 0,
        };
        let size = page_size.unwrap_or(MACHINE_PAGE);

        let request = get_request("/my/machines")
            .query("limit", size.to_string())
            .query("offset", offset.to_string());
        let body = self.client.fetch(request, ContentKind::Json).await?;

        let items: Vec<Entity> = top_level(body)
            .into_iter()
            .map(|raw| self.client.map(EntityKind::Server, raw))
            .collect();
        let next = Some(Cursor::new((offset + items.len()).to_string()));
        Ok(Page { items, next })
    }
}

/// Images or packages; the account sees the whole catalog in one call.
pub(super) fn catalog(client: &Client, kind: EntityKind) -> SinglePage {
    let path = match kind {
        EntityKind::Flavor => "/my/packages",
        _ => "/my/images",
    };
    SinglePage::new(client, kind, path, top_level).header("X-Api-Version", API_VERSION)
}

fn resource_path(kind: EntityKind, id: &str) -> String {
    let id = urlencoding::encode(id);
    match kind {
        EntityKind::Image => format!("/my/images/{id}"),
        EntityKind::Flavor => format!("/my/packages/{id}"),
        _ => format!("/my/machines/{id}"),
    }
}

pub(super) async fn get(client: &Client, kind: EntityKind, id: &str) -> Result<Entity> {
    let body = client.fetch(get_request(resource_path(kind, id)), ContentKind::Json).await?;
    Ok(client.map(kind, body))
}

pub(super) async fn destroy(client: &Client, kind: EntityKind, id: &str) -> Result<()> {
    let request = Request::delete(resource_path(kind, id)).header("X-Api-Version", API_VERSION);
    client.send(request).await?;
    Ok(())
}

/// `POST /my/machines/{id}?action=`; CloudAPI answers 202 and works
/// in the background.
pub(super) async fn server_action(client: &Client, id: &str, action: ServerAction) -> Result<()> {
    let request = Request::post(resource_path(EntityKind::Server, id))
        .query("action", action.to_string())
        .header("X-Api-Version", API_VERSION);
    client.send(request).await?;
    Ok(())
}
