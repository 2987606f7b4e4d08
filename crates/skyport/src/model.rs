use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{Client, ClientInner};
use crate::{Error, ProviderName, Result};

/// Normalized lifecycle state shared by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Provisioning,
    Running,
    Stopped,
    Error,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Look `raw` up in a provider vocabulary, ignoring case.
    /// Anything not in the table is `Unknown`.
    pub fn from_vocabulary(raw: &str, table: &[(&str, Status)]) -> Status {
        let raw = raw.trim();
        table
            .iter()
            .find(|(word, _)| word.eq_ignore_ascii_case(raw))
            .map(|(_, status)| *status)
            .unwrap_or(Status::Unknown)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Server,
    Image,
    Flavor,
    Instance,
    File,
    LoadBalancer,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Image => "image",
            Self::Flavor => "flavor",
            Self::Instance => "instance",
            Self::File => "file",
            Self::LoadBalancer => "load_balancer",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses of a multi-homed resource, split by routability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    pub private: Vec<String>,
    pub public: Vec<String>,
}

impl Addresses {
    pub fn is_empty(&self) -> bool {
        self.private.is_empty() && self.public.is_empty()
    }
}

/// Non-owning handle back to the client that produced an entity.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientRef(Weak<ClientInner>);

impl ClientRef {
    pub(crate) fn new(inner: &Arc<ClientInner>) -> Self {
        Self(Arc::downgrade(inner))
    }

    fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(Client::from_inner)
    }
}

/// A provider resource in canonical form.
///
/// Only the mapper builds these, always from a provider payload. The
/// payload itself is kept untouched in [`Entity::raw`].
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub(crate) kind: EntityKind,
    pub(crate) provider: ProviderName,
    pub(crate) id: String,
    pub(crate) name: Option<String>,
    pub(crate) status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) container: Option<String>,
    #[serde(skip_serializing_if = "Addresses::is_empty")]
    pub(crate) addresses: Addresses,
    pub(crate) attributes: BTreeMap<String, Value>,
    pub(crate) raw: Value,
    #[serde(skip)]
    pub(crate) client: ClientRef,
}

impl Entity {
    pub(crate) fn new(provider: ProviderName, kind: EntityKind, raw: Value) -> Self {
        Self {
            kind,
            provider,
            id: String::new(),
            name: None,
            status: Status::Unknown,
            container: None,
            addresses: Addresses::default(),
            attributes: BTreeMap::new(),
            raw,
            client: ClientRef::default(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn provider(&self) -> ProviderName {
        self.provider
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Owning container, for files.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn addresses(&self) -> &Addresses {
        &self.addresses
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(Value::as_str)
    }

    pub fn attribute_u64(&self, name: &str) -> Option<u64> {
        self.attribute(name).and_then(Value::as_u64)
    }

    /// Creation time, when the provider reports one in RFC 3339 form.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.attribute_str("created")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// The unmodified provider payload.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// Re-fetch this resource and map it again.
    ///
    /// Returns a new entity; `self` is left as it was. Fails with
    /// [`Error::Detached`] if the owning client has been dropped.
    pub async fn refresh(&self) -> Result<Entity> {
        let client = self.client.upgrade().ok_or(Error::Detached)?;
        client
            .get(self.kind, &self.id, self.container.as_deref())
            .await
    }
}
