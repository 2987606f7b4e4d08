//! Provider payload → [`Entity`].
//!
//! The per-provider field tables live in `providers::*`; this module holds
//! the entry point and the tolerant accessors they share. Accessors accept
//! both JSON shapes and the array-wrapped shape the XML parser produces,
//! so one provider mapping works for either encoding.

use std::net::IpAddr;

use serde_json::{Map, Value};

use crate::model::{Addresses, Entity, EntityKind};
use crate::{ProviderName, providers};

/// Map a provider payload onto the canonical entity for `kind`.
///
/// Never fails: absent fields are left empty and an unrecognized or
/// missing status becomes `unknown`. The payload is stored verbatim as
/// the entity's `raw` value.
pub fn map(provider: ProviderName, kind: EntityKind, payload: Value) -> Entity {
    let mut entity = Entity::new(provider, kind, Value::Null);
    providers::map_fields(provider, kind, &payload, &mut entity);
    entity.raw = payload;
    entity
}

fn first(value: &Value) -> &Value {
    match value {
        Value::Array(items) if !items.is_empty() => &items[0],
        other => other,
    }
}

/// Walk `path` through nested objects, stepping into the first element of
/// any array met on the way.
pub(crate) fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = first(current).get(key)?;
    }
    Some(current)
}

/// String (or number) at `path`.
pub(crate) fn text(value: &Value, path: &[&str]) -> Option<String> {
    match first(lookup(value, path)?) {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Non-negative integer at `path`; numeric strings are accepted.
pub(crate) fn number(value: &Value, path: &[&str]) -> Option<u64> {
    match first(lookup(value, path)?) {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Array at `path`, or an empty slice.
pub(crate) fn list<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    lookup(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Take the array stored under `key` (or the body itself) out of a
/// decoded response.
pub(crate) fn take_array(body: Value, key: Option<&str>) -> Vec<Value> {
    let items = match (body, key) {
        (Value::Object(mut obj), Some(key)) => obj.remove(key),
        (body, None) => Some(body),
        _ => None,
    };
    match items {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Take the object stored under `key`, falling back to the body itself.
pub(crate) fn take_object(body: Value, key: &str) -> Value {
    match body {
        Value::Object(mut obj) if obj.contains_key(key) => obj.remove(key).unwrap_or(Value::Null),
        other => other,
    }
}

pub(crate) fn set_attr(entity: &mut Entity, key: &str, value: Option<Value>) {
    if let Some(value) = value
        && !value.is_null()
    {
        entity.attributes.insert(key.to_string(), value);
    }
}

pub(crate) fn set_text(entity: &mut Entity, key: &str, value: Option<String>) {
    set_attr(entity, key, value.map(Value::String));
}

pub(crate) fn set_number(entity: &mut Entity, key: &str, value: Option<u64>) {
    set_attr(entity, key, value.map(Value::from));
}

/// Whether `addr` is in a range that is not publicly routable.
///
/// Covers RFC 1918, loopback and link-local for IPv4, and loopback,
/// unique-local (fc00::/7) and link-local (fe80::/10) for IPv6.
/// Anything unparseable counts as public.
pub fn is_private(addr: &str) -> bool {
    match addr.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => {
            let head = v6.segments()[0];
            v6.is_loopback() || (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Split addresses into private/public buckets, testing each on its own.
pub fn partition_addresses<I, S>(addrs: I) -> Addresses
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Addresses::default();
    for addr in addrs {
        let addr = addr.as_ref().trim();
        if addr.is_empty() {
            continue;
        }
        if is_private(addr) {
            out.private.push(addr.to_string());
        } else {
            out.public.push(addr.to_string());
        }
    }
    out
}

/// Object at `path`, or an empty map.
pub(crate) fn object(value: &Value, path: &[&str]) -> Map<String, Value> {
    lookup(value, path)
        .map(first)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn private_ranges() {
        for addr in ["10.0.0.1", "172.16.5.4", "172.31.255.255", "192.168.1.1", "127.0.0.1", "169.254.0.9", "::1", "fd00::1", "fe80::1"] {
            assert!(is_private(addr), "{addr} should be private");
        }
        for addr in ["8.8.8.8", "172.32.0.1", "165.225.1.1", "2001:4860::8888", "not-an-ip", ""] {
            assert!(!is_private(addr), "{addr} should be public");
        }
    }

    #[test]
    fn partition_tests_each_address_independently() {
        let addrs = partition_addresses(["10.88.88.2", "165.225.129.57", "192.168.0.3", " "]);
        assert_eq!(addrs.private, ["10.88.88.2", "192.168.0.3"]);
        assert_eq!(addrs.public, ["165.225.129.57"]);
    }

    #[test]
    fn accessors_read_json_and_xml_shapes() {
        let json_shape = json!({ "instanceState": { "name": "running" }, "size": "42" });
        let xml_shape = json!({ "instanceState": [{ "name": ["running"] }], "size": ["42"] });

        for v in [&json_shape, &xml_shape] {
            assert_eq!(text(v, &["instanceState", "name"]).as_deref(), Some("running"));
            assert_eq!(number(v, &["size"]), Some(42));
            assert_eq!(text(v, &["missing", "path"]), None);
        }
    }

    #[test]
    fn take_array_handles_missing_and_top_level() {
        assert_eq!(take_array(json!([1, 2]), None).len(), 2);
        assert_eq!(take_array(json!({ "servers": [1] }), Some("servers")).len(), 1);
        assert!(take_array(json!({ "other": [1] }), Some("servers")).is_empty());
        assert!(take_array(Value::Null, Some("servers")).is_empty());
    }
}
