//! EC2 (query API, XML) and S3 (REST, XML).

use async_trait::async_trait;
use serde_json::{Value, json};
use skyport_http::Request;

use super::SinglePage;
use super::openstack::status;
use crate::client::{Client, ServerAction};
use crate::mapper::{list, number, partition_addresses, set_number, set_text, text};
use crate::model::{Entity, EntityKind, Status};
use crate::pagination::{Cursor, Page, PageSource};
use crate::parser::ContentKind;
use crate::upload::{normalize_etag, object_path};
use crate::{Error, Result};

const EC2_VERSION: &str = "2016-11-15";

const INSTANCE_STATUS: &[(&str, Status)] = &[
    ("pending", Status::Provisioning),
    ("running", Status::Running),
    ("stopping", Status::Stopped),
    ("stopped", Status::Stopped),
    ("shutting-down", Status::Stopped),
    ("terminated", Status::Stopped),
];

const IMAGE_STATUS: &[(&str, Status)] = &[
    ("available", Status::Running),
    ("pending", Status::Provisioning),
    ("failed", Status::Error),
];

const EC2_PAGE: usize = 1_000;
const S3_PAGE: usize = 1_000;

/// AMIs carry no creation time in the listing.
const EPOCH: &str = "1970-01-01T00:00:00Z";

fn action(name: &str) -> Request {
    Request::get("/")
        .query("Action", name)
        .query("Version", EC2_VERSION)
}

// ── Mapping ─────────────────────────────────────────────────────────

pub(super) fn map_server(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["instanceId"]).unwrap_or_default();
    entity.name = list(payload, &["tagSet", "item"])
        .iter()
        .find(|tag| text(tag, &["key"]).as_deref() == Some("Name"))
        .and_then(|tag| text(tag, &["value"]));

    entity.status = text(payload, &["instanceState", "name"])
        .map(|raw| Status::from_vocabulary(&raw, INSTANCE_STATUS))
        .unwrap_or(Status::Unknown);
    entity.addresses = partition_addresses(
        [
            text(payload, &["privateIpAddress"]),
            text(payload, &["ipAddress"]),
        ]
        .into_iter()
        .flatten(),
    );

    set_text(entity, "image_id", text(payload, &["imageId"]));
    set_text(entity, "flavor", text(payload, &["instanceType"]));
    set_text(entity, "created", text(payload, &["launchTime"]));
    set_text(entity, "hostname", text(payload, &["dnsName"]).filter(|h| !h.is_empty()));
    set_text(entity, "zone", text(payload, &["placement", "availabilityZone"]));
}

pub(super) fn map_image(payload: &Value, entity: &mut Entity) {
    let location = text(payload, &["imageLocation"]);

    entity.id = text(payload, &["imageId"]).unwrap_or_default();
    entity.name = text(payload, &["name"]).filter(|n| !n.is_empty()).or_else(|| {
        location
            .as_deref()
            .and_then(|l| l.split('/').nth(1))
            .map(str::to_string)
    });
    entity.status = status(payload, "imageState", IMAGE_STATUS);

    set_text(entity, "created", Some(EPOCH.to_string()));
    set_text(entity, "architecture", text(payload, &["architecture"]));
    set_text(entity, "location", location);
}

pub(super) fn map_file(payload: &Value, entity: &mut Entity) {
    entity.id = text(payload, &["Key"]).unwrap_or_default();
    entity.name = text(payload, &["Key"]);

    set_number(entity, "size", number(payload, &["Size"]));
    set_text(entity, "hash", text(payload, &["ETag"]).map(|e| normalize_etag(&e)));
    set_text(entity, "last_modified", text(payload, &["LastModified"]));
    set_text(entity, "content_type", text(payload, &["ContentType"]));
    set_text(entity, "storage_class", text(payload, &["StorageClass"]));
}

fn instances_in(body: &Value) -> Vec<Value> {
    list(body, &["DescribeInstancesResponse", "reservationSet", "item"])
        .iter()
        .flat_map(|reservation| list(reservation, &["instancesSet", "item"]).iter().cloned())
        .collect()
}

fn images_in(body: Value) -> Vec<Value> {
    list(&body, &["DescribeImagesResponse", "imagesSet", "item"]).to_vec()
}

// ── Listings ────────────────────────────────────────────────────────

/// DescribeInstances, paged with `NextToken`.
///
/// EC2 counts `MaxResults` against instances but groups them into
/// reservations, so a short page says nothing about the end of the
/// listing. Only the token is trusted.
pub(super) struct Instances {
    client: Client,
}

impl Instances {
    pub(super) fn new(client: &Client) -> Self {
        Self { client: client.clone() }
    }
}

#[async_trait]
impl PageSource for Instances {
    fn max_page_size(&self) -> Option<usize> {
        None
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>, _page_size: Option<usize>) -> Result<Page> {
        let mut request = action("DescribeInstances").query("MaxResults", EC2_PAGE.to_string());
        if let Some(token) = cursor {
            request = request.query("NextToken", token.as_str());
        }

        let body = self.client.fetch(request, ContentKind::Xml).await?;
        let next = text(&body, &["DescribeInstancesResponse", "nextToken"])
            .filter(|t| !t.is_empty())
            .map(Cursor::new);
        let items = instances_in(&body)
            .into_iter()
            .map(|raw| self.client.map(EntityKind::Server, raw))
            .collect();
        Ok(Page { items, next })
    }
}

/// Images owned by the account; one response.
pub(super) fn images(client: &Client) -> SinglePage {
    SinglePage::new(client, EntityKind::Image, "/", images_in)
        .query("Action", "DescribeImages")
        .query("Version", EC2_VERSION)
        .query("Owner.1", "self")
        .format(ContentKind::Xml)
}

/// ListObjects (v1), paged with `max-keys` / `marker`.
pub(super) struct Objects {
    client: Client,
    bucket: String,
}

impl Objects {
    pub(super) fn new(client: &Client, bucket: &str) -> Self {
        Self {
            client: client.clone(),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl PageSource for Objects {
    fn max_page_size(&self) -> Option<usize> {
        Some(S3_PAGE)
    }

    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: Option<usize>) -> Result<Page> {
        let mut request = Request::get(format!("/{}", urlencoding::encode(&self.bucket)));
        if let Some(size) = page_size {
            request = request.query("max-keys", size.to_string());
        }
        if let Some(marker) = cursor {
            request = request.query("marker", marker.as_str());
        }

        let body = self.client.fetch(request, ContentKind::Xml).await?;
        let contents = list(&body, &["ListBucketResult", "Contents"]);
        let truncated = text(&body, &["ListBucketResult", "IsTruncated"]).as_deref() == Some("true");
        let next = if truncated {
            text(&body, &["ListBucketResult", "NextMarker"])
                .or_else(|| contents.last().and_then(|last| text(last, &["Key"])))
                .map(Cursor::new)
        } else {
            None
        };

        let items = contents
            .iter()
            .cloned()
            .map(|raw| self.client.map_in(EntityKind::File, Some(&self.bucket), raw))
            .collect();
        Ok(Page { items, next })
    }
}

// ── Single resources ────────────────────────────────────────────────

pub(super) async fn get(client: &Client, kind: EntityKind, id: &str) -> Result<Entity> {
    let found = match kind {
        EntityKind::Image => {
            let body = client
                .fetch(
                    action("DescribeImages").query("ImageId.1", id),
                    ContentKind::Xml,
                )
                .await?;
            images_in(body).into_iter().next()
        }
        _ => {
            let body = client
                .fetch(
                    action("DescribeInstances").query("InstanceId.1", id),
                    ContentKind::Xml,
                )
                .await?;
            instances_in(&body).into_iter().next()
        }
    };

    found
        .map(|raw| client.map(kind, raw))
        .ok_or_else(|| Error::NotFound {
            kind,
            id: id.to_string(),
        })
}

pub(super) async fn destroy(client: &Client, kind: EntityKind, id: &str) -> Result<()> {
    let request = match kind {
        EntityKind::Image => action("DeregisterImage").query("ImageId", id),
        _ => action("TerminateInstances").query("InstanceId.1", id),
    };
    client.send(request).await?;
    Ok(())
}

pub(super) async fn server_action(client: &Client, id: &str, op: ServerAction) -> Result<()> {
    let name = match op {
        ServerAction::Reboot => "RebootInstances",
        ServerAction::Stop => "StopInstances",
    };
    client.send(action(name).query("InstanceId.1", id)).await?;
    Ok(())
}

pub(super) async fn head_object(client: &Client, bucket: &str, key: &str) -> Result<Entity> {
    let resp = client.send(Request::head(object_path(bucket, key))).await?;
    let payload = json!({
        "Key": key,
        "Size": resp.header("content-length").and_then(|v| v.parse::<u64>().ok()),
        "ETag": resp.header("etag"),
        "LastModified": resp.header("last-modified"),
        "ContentType": resp.header("content-type"),
    });
    Ok(client.map_in(EntityKind::File, Some(bucket), payload))
}
