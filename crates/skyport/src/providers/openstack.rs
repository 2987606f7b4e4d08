//! Nova (compute), Swift (storage) and LBaaS v2 (network). Rackspace
//! speaks the same compute and storage dialect.

use serde_json::{Value, json};
use skyport_http::Request;

use super::{MarkerListing, fetch_one, require, resource_path};
use crate::client::{Client, CreateServerOptions, ServerAction};
use crate::mapper::{lookup, number, partition_addresses, set_attr, set_number, set_text, text};
use crate::model::{Entity, EntityKind, Status};
use crate::upload::{normalize_etag, object_path};
use crate::Result;

pub(super) const SERVER_STATUS: &[(&str, Status)] = &[
    ("ACTIVE", Status::Running),
    ("BUILD", Status::Provisioning),
    ("REBUILD", Status::Provisioning),
    ("REBOOT", Status::Provisioning),
    ("HARD_REBOOT", Status::Provisioning),
    ("RESIZE", Status::Provisioning),
    ("VERIFY_RESIZE", Status::Provisioning),
    ("PASSWORD", Status::Provisioning),
    ("MIGRATING", Status::Provisioning),
    ("SHUTOFF", Status::Stopped),
    ("SUSPENDED", Status::Stopped),
    ("PAUSED", Status::Stopped),
    ("STOPPED", Status::Stopped),
    ("ERROR", Status::Error),
];

const IMAGE_STATUS: &[(&str, Status)] = &[
    ("ACTIVE", Status::Running),
    ("SAVING", Status::Provisioning),
    ("QUEUED", Status::Provisioning),
    ("ERROR", Status::Error),
    ("KILLED", Status::Error),
];

pub(super) const LOAD_BALANCER_STATUS: &[(&str, Status)] = &[
    ("ACTIVE", Status::Running),
    ("BUILD", Status::Provisioning),
    ("PENDING_CREATE", Status::Provisioning),
    ("PENDING_UPDATE", Status::Provisioning),
    ("PENDING_DELETE", Status::Provisioning),
    ("SUSPENDED", Status::Stopped),
    ("DELETED", Status::Stopped),
    ("ERROR", Status::Error),
];

const SWIFT_PAGE: usize = 10_000;
const NOVA_PAGE: usize = 1_000;
const LBAAS_PAGE: usize = 100;

pub(super) fn status(payload: &Value, field: &str, table: &[(&str, Status)]) -> Status {
    text(payload, &[field])
        .map(|raw| Status::from_vocabulary(&raw, table))
        .unwrap_or(Status::Unknown)
}

// ── Mapping ─────────────────────────────────────────────────────────

pub(super) fn map_server(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = status(payload, "status", SERVER_STATUS);
    entity.addresses = partition_addresses(server_addresses(payload));

    set_text(entity, "image_id", text(payload, &["image", "id"]));
    set_text(entity, "flavor", text(payload, &["flavor", "id"]));
    set_text(entity, "created", text(payload, &["created"]));
    set_text(entity, "updated", text(payload, &["updated"]));
    set_text(entity, "host_id", text(payload, &["hostId"]));
    set_text(entity, "admin_pass", text(payload, &["adminPass"]));
    set_number(entity, "progress", number(payload, &["progress"]));
    set_attr(entity, "metadata", lookup(payload, &["metadata"]).cloned());
}

/// `addresses.<network>[]` entries are `{addr, version}` objects in v2
/// and bare strings in the older Rackspace dialect.
fn server_addresses(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(Value::Object(networks)) = lookup(payload, &["addresses"]) {
        for entry in networks.values().filter_map(Value::as_array).flatten() {
            match entry {
                Value::String(addr) => out.push(addr.clone()),
                other => out.extend(text(other, &["addr"])),
            }
        }
    }
    for key in ["accessIPv4", "accessIPv6"] {
        if let Some(addr) = text(payload, &[key])
            && !addr.is_empty()
            && !out.contains(&addr)
        {
            out.push(addr);
        }
    }
    out
}

pub(super) fn map_image(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = status(payload, "status", IMAGE_STATUS);

    set_text(entity, "created", text(payload, &["created"]));
    set_text(entity, "updated", text(payload, &["updated"]));
    set_number(entity, "min_disk", number(payload, &["minDisk"]));
    set_number(entity, "min_ram", number(payload, &["minRam"]));
    set_number(entity, "progress", number(payload, &["progress"]));
}

pub(super) fn map_flavor(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);

    set_number(entity, "ram", number(payload, &["ram"]));
    set_number(entity, "disk", number(payload, &["disk"]));
    set_number(entity, "vcpus", number(payload, &["vcpus"]));
}

pub(super) fn map_file(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["name"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);

    set_number(entity, "size", number(payload, &["bytes"]));
    set_text(entity, "hash", text(payload, &["hash"]).map(|h| normalize_etag(&h)));
    set_text(entity, "content_type", text(payload, &["content_type"]));
    set_text(entity, "last_modified", text(payload, &["last_modified"]));
}

pub(super) fn map_load_balancer(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["id"]).unwrap_or_default();
    entity.name = text(payload, &["name"]);
    entity.status = status(payload, "provisioning_status", LOAD_BALANCER_STATUS);
    entity.addresses = partition_addresses(text(payload, &["vip_address"]));

    set_text(entity, "operating_status", text(payload, &["operating_status"]));
    set_text(entity, "vip_subnet_id", text(payload, &["vip_subnet_id"]));
    set_text(entity, "provider", text(payload, &["provider"]));
}

// ── Listings ────────────────────────────────────────────────────────

pub(super) fn compute(client: &Client, kind: EntityKind) -> MarkerListing {
    let (path, collection) = match kind {
        EntityKind::Image => ("/images/detail", "images"),
        EntityKind::Flavor => ("/flavors/detail", "flavors"),
        _ => ("/servers/detail", "servers"),
    };
    MarkerListing::new(client, kind, path, Some(collection), NOVA_PAGE)
}

pub(super) fn files(client: &Client, container: &str) -> MarkerListing {
    let path = format!("/{}", urlencoding::encode(container));
    MarkerListing::new(client, EntityKind::File, path, None, SWIFT_PAGE)
        .cursor_field("name")
        .query("format", "json")
        .in_container(container)
}

pub(super) fn load_balancers(client: &Client) -> MarkerListing {
    MarkerListing::new(
        client,
        EntityKind::LoadBalancer,
        "/v2.0/lbaas/loadbalancers",
        Some("loadbalancers"),
        LBAAS_PAGE,
    )
}

// ── Single resources ────────────────────────────────────────────────

pub(super) async fn get(client: &Client, kind: EntityKind, id: &str) -> Result<Entity> {
    let key = match kind {
        EntityKind::Image => "image",
        EntityKind::Flavor => "flavor",
        EntityKind::LoadBalancer => "loadbalancer",
        _ => "server",
    };
    let path = resource_path(client.provider(), kind, id);
    fetch_one(client, kind, Request::get(path), key).await
}

// ── Server lifecycle ────────────────────────────────────────────────

/// `POST /servers`. The response only carries the id, links and admin
/// password; the server is still building.
pub(super) async fn create_server(client: &Client, options: CreateServerOptions) -> Result<Entity> {
    let name = require("name", options.name)?;
    let flavor = require("flavor", options.flavor)?;
    let image = require("image", options.image)?;

    let mut server = json!({ "name": name, "flavorRef": flavor, "imageRef": image });
    if let Some(password) = options.password.filter(|p| !p.is_empty()) {
        server["adminPass"] = Value::String(password);
    }

    let request = Request::post("/servers").json(json!({ "server": server }));
    fetch_one(client, EntityKind::Server, request, "server").await
}

pub(super) async fn server_action(client: &Client, id: &str, action: ServerAction) -> Result<()> {
    let body = match action {
        ServerAction::Reboot => json!({ "reboot": { "type": "SOFT" } }),
        ServerAction::Stop => json!({ "os-stop": null }),
    };
    let path = format!("{}/action", resource_path(client.provider(), EntityKind::Server, id));
    client.send(Request::post(path).json(body)).await?;
    Ok(())
}

pub(super) async fn rename_server(client: &Client, id: &str, name: &str) -> Result<Entity> {
    let name = require("name", Some(name.to_string()))?;
    let path = resource_path(client.provider(), EntityKind::Server, id);
    let request = Request::put(path).json(json!({ "server": { "name": name } }));
    fetch_one(client, EntityKind::Server, request, "server").await
}

/// Object metadata from a HEAD, shaped like a listing entry.
pub(super) async fn head_object(client: &Client, container: &str, name: &str) -> Result<Entity> {
    let resp = client
        .send(Request::head(object_path(container, name)).query("format", "json"))
        .await?;

    let payload = json!({
        "name": name,
        "bytes": resp.header("content-length").and_then(|v| v.parse::<u64>().ok()),
        "hash": resp.header("etag"),
        "content_type": resp.header("content-type"),
        "last_modified": resp.header("last-modified"),
    });
    Ok(client.map_in(EntityKind::File, Some(container), payload))
}

#[cfg(test)]
mod tests {
    use skyport_http::StatusCode;

    use super::*;
    use crate::mapper::map;
    use crate::pagination::ListOptions;
    use crate::testing::{self, Sent};
    use crate::{ProviderName, Service};

    /// Swift container holding FILE00000..FILE{total-1}.
    fn swift(total: usize) -> impl Fn(&Sent) -> skyport_http::Result<skyport_http::Response> + Send + Sync + 'static {
        move |sent: &Sent| {
            assert_eq!(sent.query_value("format"), Some("json"));
            let start = sent
                .query_value("marker")
                .map(|m| m["FILE".len()..].parse::<usize>().unwrap() + 1)
                .unwrap_or(0);
            let limit = sent
                .query_value("limit")
                .map(|l| l.parse::<usize>().unwrap())
                .unwrap_or(SWIFT_PAGE);
            let end = (start + limit).min(total);
            let files: Vec<Value> = (start.min(end)..end)
                .map(|i| json!({ "name": format!("FILE{i:05}"), "bytes": 2027, "hash": "abc", "content_type": "text/plain" }))
                .collect();
            testing::json_response(Value::Array(files))
        }
    }

    #[tokio::test]
    async fn files_limit_walks_markers() {
        let (client, recorder) = testing::client(ProviderName::Rackspace, Service::Storage, swift(30_000));

        let files = client
            .list_all(EntityKind::File, Some("0.1.7-215"), ListOptions::limit(23_400))
            .unwrap()
            .collect_all()
            .await
            .unwrap();

        assert_eq!(files.len(), 23_400);
        assert!(files.iter().all(|f| f.container() == Some("0.1.7-215")));
        let sent = recorder.requests();
        let queries: Vec<Vec<(String, String)>> = sent.iter().map(|s| s.query.clone()).collect();
        let q = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert_eq!(
            queries,
            [
                q(&[("format", "json")]),
                q(&[("format", "json"), ("marker", "FILE09999")]),
                q(&[("format", "json"), ("limit", "3400"), ("marker", "FILE19999")]),
            ]
        );
        assert!(sent.iter().all(|s| s.path == "/0.1.7-215"));
    }

    #[tokio::test]
    async fn files_unbounded_stops_at_empty_page() {
        let (client, recorder) = testing::client(ProviderName::Rackspace, Service::Storage, swift(20_000));
        let files = client
            .list_all(EntityKind::File, Some("0.1.7-215"), ListOptions::unbounded())
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(files.len(), 20_000);
        assert_eq!(recorder.requests().len(), 3);
    }

    #[tokio::test]
    async fn files_need_a_container() {
        let (client, recorder) = testing::client(ProviderName::Openstack, Service::Storage, swift(0));
        let err = client
            .list_all(EntityKind::File, None, ListOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::Validation { field: "container", .. }));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn head_encodes_the_object_name() {
        let (client, recorder) = testing::client(ProviderName::Rackspace, Service::Storage, |_| {
            let resp = skyport_http::Response::new(StatusCode::OK, "");
            let resp = testing::with_header(resp, "content-length", "11");
            Ok(testing::with_header(resp, "etag", "5eb63bbbe01eeed093cb22bb8f5acdc3"))
        });

        let file = client
            .get(EntityKind::File, "dir/hello world.txt", Some("0.1.7-215"))
            .await
            .unwrap();

        assert_eq!(recorder.requests()[0].path, "/0.1.7-215/dir/hello%20world.txt");
        assert_eq!(file.id(), "dir/hello world.txt");
        assert_eq!(file.attribute_u64("size"), Some(11));
        assert_eq!(file.attribute_str("hash"), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    }

    #[test]
    fn nova_server_addresses_are_partitioned() {
        let server = map(
            ProviderName::Openstack,
            EntityKind::Server,
            json!({
                "id": "52415800-8b69-11e0-9b19-734f565bc83b",
                "name": "new-server-test",
                "status": "ACTIVE",
                "created": "2012-05-20T22:48:08Z",
                "image": { "id": "70a599e0" },
                "flavor": { "id": "1" },
                "addresses": {
                    "public": [{ "version": 4, "addr": "67.23.10.138" }],
                    "private": [{ "version": 4, "addr": "10.176.42.16" }]
                }
            }),
        );

        assert_eq!(server.status(), Status::Running);
        assert_eq!(server.addresses().public, ["67.23.10.138"]);
        assert_eq!(server.addresses().private, ["10.176.42.16"]);
        assert_eq!(server.attribute_str("image_id"), Some("70a599e0"));
        assert_eq!(server.attribute_str("flavor"), Some("1"));
        assert_eq!(server.created().unwrap().timestamp(), 1_337_554_088);
    }

    #[test]
    fn legacy_string_addresses_are_read() {
        let server = map(
            ProviderName::Rackspace,
            EntityKind::Server,
            json!({ "id": 1, "status": "BUILD", "addresses": { "public": ["50.57.94.244"], "private": ["10.182.33.49"] } }),
        );
        assert_eq!(server.id(), "1");
        assert_eq!(server.status(), Status::Provisioning);
        assert_eq!(server.addresses().public, ["50.57.94.244"]);
        assert_eq!(server.addresses().private, ["10.182.33.49"]);
    }

    #[test]
    fn unknown_or_missing_status_is_unknown() {
        let a = map(ProviderName::Openstack, EntityKind::Server, json!({ "id": "x", "status": "SHELVED" }));
        let b = map(ProviderName::Openstack, EntityKind::Server, json!({ "id": "x" }));
        assert_eq!(a.status(), Status::Unknown);
        assert_eq!(b.status(), Status::Unknown);
    }

    #[test]
    fn mapping_keeps_the_payload() {
        let payload = json!({ "id": "1", "name": "512MB", "ram": 512, "disk": 20, "vcpus": 1 });
        let flavor = map(ProviderName::Openstack, EntityKind::Flavor, payload.clone());
        assert_eq!(flavor.attribute_u64("ram"), Some(512));
        assert_eq!(flavor.into_raw(), payload);
    }

    #[tokio::test]
    async fn get_server_unwraps_envelope() {
        let (client, recorder) = testing::client(ProviderName::Openstack, Service::Compute, |sent| {
            if sent.path == "/servers/missing" {
                return testing::failure(sent, StatusCode::NOT_FOUND, "Instance could not be found");
            }
            testing::json_response(json!({ "server": { "id": "abc", "status": "SHUTOFF" } }))
        });

        let server = client.get(EntityKind::Server, "abc", None).await.unwrap();
        assert_eq!(server.status(), Status::Stopped);
        assert!(client.get(EntityKind::Server, "missing", None).await.unwrap_err().is_not_found());
        assert_eq!(recorder.endpoints(), ["GET /servers/abc", "GET /servers/missing"]);
    }

    #[tokio::test]
    async fn lbaas_listing_uses_v2_paths() {
        let (client, recorder) = testing::client(ProviderName::Openstack, Service::Network, |_| {
            testing::json_response(json!({ "loadbalancers": [
                { "id": "lb-1", "name": "web", "provisioning_status": "PENDING_CREATE", "vip_address": "10.0.0.4" }
            ] }))
        });

        let lbs = client
            .list_all(EntityKind::LoadBalancer, None, ListOptions::default())
            .unwrap()
            .collect_all()
            .await
            .unwrap();

        assert_eq!(recorder.requests()[0].path, "/v2.0/lbaas/loadbalancers");
        assert_eq!(lbs[0].status(), Status::Provisioning);
        assert_eq!(lbs[0].addresses().private, ["10.0.0.4"]);
    }

    #[test]
    fn every_status_word_maps() {
        use EntityKind::*;
        for provider in [ProviderName::Openstack, ProviderName::Rackspace] {
            testing::assert_vocabulary(provider, Server, SERVER_STATUS, |raw| json!({ "id": "s", "status": raw }));
            testing::assert_vocabulary(provider, Image, IMAGE_STATUS, |raw| json!({ "id": "i", "status": raw }));
        }
        testing::assert_vocabulary(ProviderName::Openstack, LoadBalancer, LOAD_BALANCER_STATUS, |raw| {
            json!({ "id": "lb", "provisioning_status": raw })
        });
    }

    #[tokio::test]
    async fn create_server_checks_options_before_sending() {
        let (client, recorder) = testing::client(ProviderName::Openstack, Service::Compute, |_| {
            panic!("no request expected")
        });

        let err = client
            .create_server(CreateServerOptions {
                name: Some("web".into()),
                flavor: Some("2".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation { field: "image", .. }));

        let err = client
            .create_server(CreateServerOptions {
                flavor: Some("2".into()),
                image: Some("70a599e0".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation { field: "name", .. }));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn create_server_posts_refs() {
        let (client, recorder) = testing::client(ProviderName::Rackspace, Service::Compute, |_| {
            testing::json_response(json!({ "server": { "id": "srv-9", "adminPass": "GFf1j9aP" } }))
        });

        let server = client
            .create_server(CreateServerOptions {
                name: Some("create-test".into()),
                flavor: Some("2".into()),
                image: Some("70a599e0".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(server.id(), "srv-9");
        assert_eq!(server.status(), Status::Unknown);
        let sent = recorder.requests();
        assert_eq!(sent[0].endpoint(), "POST /servers");
        assert_eq!(
            sent[0].json,
            Some(json!({ "server": { "name": "create-test", "flavorRef": "2", "imageRef": "70a599e0" } }))
        );
    }

    #[tokio::test]
    async fn reboot_stop_and_rename_use_nova_actions() {
        let (client, recorder) = testing::client(ProviderName::Openstack, Service::Compute, |sent| {
            if sent.method == skyport_http::Method::PUT {
                return testing::json_response(json!({ "server": { "id": "abc", "name": "renamed", "status": "ACTIVE" } }));
            }
            testing::empty(StatusCode::ACCEPTED)
        });

        client.reboot("abc").await.unwrap();
        client.stop("abc").await.unwrap();
        let renamed = client.rename_server("abc", "renamed").await.unwrap();
        assert_eq!(renamed.name(), Some("renamed"));

        let sent = recorder.requests();
        assert_eq!(
            recorder.endpoints(),
            ["POST /servers/abc/action", "POST /servers/abc/action", "PUT /servers/abc"]
        );
        assert_eq!(sent[0].json, Some(json!({ "reboot": { "type": "SOFT" } })));
        assert_eq!(sent[1].json, Some(json!({ "os-stop": null })));
        assert_eq!(sent[2].json, Some(json!({ "server": { "name": "renamed" } })));

        let err = client.reboot("").await.unwrap_err();
        assert!(matches!(err, crate::Error::Validation { field: "id", .. }));
    }

    #[tokio::test]
    async fn extract_unpacks_into_the_account() {
        let (client, recorder) = testing::client(ProviderName::Rackspace, Service::Storage, |_| {
            testing::json_response(json!({
                "Number Files Created": 1,
                "Response Status": "201 Created",
                "Response Body": "",
                "Errors": []
            }))
        });

        let outcome = client
            .extract(crate::upload::ExtractRequest::new(crate::upload::UploadSource::Bytes(
                bytes::Bytes::from_static(b"tarball"),
            )))
            .await
            .unwrap();

        assert_eq!(outcome.files_created, 1);
        let sent = recorder.requests();
        assert_eq!(sent[0].method, skyport_http::Method::PUT);
        assert_eq!(sent[0].query, [("extract-archive".to_string(), "tar.gz".to_string())]);
    }
}
