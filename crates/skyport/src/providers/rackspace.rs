//! Rackspace Cloud Databases and Cloud Load Balancers. Compute and
//! storage go through the OpenStack bindings.

use serde_json::{Value, json};
use skyport_http::Request;

use super::openstack::status;
use super::{MarkerListing, fetch_one, require, resource_path};
use crate::client::{Client, CreateInstanceOptions};
use crate::mapper::{list, number, object, partition_addresses, set_attr, set_number, set_text, take_object, text};
use crate::model::{Entity, EntityKind, Status};
use crate::parser::ContentKind;
use crate::Result;

pub(super) const INSTANCE_STATUS: &[(&str, Status)] = &[
    ("PROVISIONING", Status::Provisioning),
    ("BUILD", Status::Provisioning),
    ("REBOOT", Status::Provisioning),
    ("RESIZE", Status::Provisioning),
    ("RUNNING", Status::Running),
    ("ACTIVE", Status::Running),
    ("STOPPING", Status::Stopped),
    ("STOPPED", Status::Stopped),
    ("SHUTDOWN", Status::Stopped),
    ("FAILED", Status::Error),
];

const LOAD_BALANCER_STATUS: &[(&str, Status)] = super::openstack::LOAD_BALANCER_STATUS;

/// Trove's `instances_page_size`; larger `limit`s are silently capped to it.
const DATABASE_PAGE: usize = 20;
const LOAD_BALANCER_PAGE: usize = 100;

const MIN_VOLUME_GB: i64 = 1;
const MAX_VOLUME_GB: i64 = 8;

pub(super) fn map_instance(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = match text(payload, &["status"]) {
        Some(_) => status(payload, "status", INSTANCE_STATUS),
        None => status(payload, "state", INSTANCE_STATUS),
    };

    set_attr(entity, "flavor", Some(Value::Object(object(payload, &["flavor"]))));
    set_text(entity, "hostname", text(payload, &["hostname"]));
    set_attr(entity, "volume", payload.get("volume").cloned());
    set_text(entity, "created", text(payload, &["created"]));
    set_text(entity, "updated", text(payload, &["updated"]));
}

pub(super) fn map_load_balancer(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = status(payload, "status", LOAD_BALANCER_STATUS);
    entity.addresses = partition_addresses(
        list(payload, &["virtualIps"])
            .iter()
            .filter_map(|vip| text(vip, &["address"])),
    );

    set_text(entity, "protocol", text(payload, &["protocol"]));
    set_number(entity, "port", number(payload, &["port"]));
    set_text(entity, "algorithm", text(payload, &["algorithm"]));
    set_number(entity, "node_count", number(payload, &["nodeCount"]));
    set_text(entity, "created", text(payload, &["created", "time"]));
}

pub(super) fn instances(client: &Client) -> MarkerListing {
    MarkerListing::new(client, EntityKind::Instance, "/instances", Some("instances"), DATABASE_PAGE)
}

pub(super) fn load_balancers(client: &Client) -> MarkerListing {
    MarkerListing::new(
        client,
        EntityKind::LoadBalancer,
        "/loadbalancers",
        Some("loadBalancers"),
        LOAD_BALANCER_PAGE,
    )
}

pub(super) async fn get(client: &Client, kind: EntityKind, id: &str) -> Result<Entity> {
    let key = match kind {
        EntityKind::LoadBalancer => "loadBalancer",
        _ => "instance",
    };
    let path = resource_path(client.provider(), kind, id);
    fetch_one(client, kind, Request::get(path), key).await
}

/// Volume size in GB; anything outside the supported range falls back
/// to the smallest volume.
fn volume_size(size: Option<i64>) -> i64 {
    size.filter(|s| (MIN_VOLUME_GB..=MAX_VOLUME_GB).contains(s))
        .unwrap_or(MIN_VOLUME_GB)
}

pub(super) async fn create_instance(client: &Client, options: CreateInstanceOptions) -> Result<Entity> {
    let name = require("name", options.name)?;
    let flavor = require("flavor", options.flavor)?;

    let databases: Vec<Value> = options
        .databases
        .iter()
        .map(|db| json!({ "name": db, "character_set": "utf8", "collate": "utf8_general_ci" }))
        .collect();

    let body = json!({
        "instance": {
            "name": name,
            "flavorRef": flavor,
            "databases": databases,
            "volume": { "size": volume_size(options.size) },
        }
    });

    let resp = client
        .fetch(Request::post("/instances").json(body), ContentKind::Json)
        .await?;
    Ok(client.map(EntityKind::Instance, take_object(resp, "instance")))
}
