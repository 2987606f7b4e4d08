use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use skyport_http::{Request, Response, Transport};
use tracing::info;

use crate::config::ClientConfig;
use crate::model::{ClientRef, Entity, EntityKind};
use crate::pagination::{ListOptions, Paginator};
use crate::parser::{ContentKind, parse};
use crate::providers::{self, AzureCompute};
use crate::teardown::{self, TeardownOptions, TeardownReport};
use crate::upload::{self, ExtractOutcome, ExtractRequest, UploadOutcome, UploadRequest};
use crate::{Error, ProviderName, Result, Service, mapper};

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
}

/// Handle to one provider service. Cheap to clone; clones share the
/// transport (and its cached auth token).
///
/// Entities produced by a client only hold a weak reference back to it,
/// so dropping every `Client` clone detaches them.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("provider", &self.provider())
            .field("service", &self.service())
            .field("endpoint", &self.inner.config.endpoint)
            .finish()
    }
}

/// Options for [`Client::create_instance`]. Which fields are required
/// depends on the provider.
#[derive(Debug, Clone, Default)]
pub struct CreateInstanceOptions {
    pub name: Option<String>,
    pub flavor: Option<String>,
    /// Volume size in GB.
    pub size: Option<i64>,
    pub databases: Vec<String>,
    pub plan: Option<String>,
}

/// Options for [`Client::create_server`].
#[derive(Debug, Clone, Default)]
pub struct CreateServerOptions {
    pub name: Option<String>,
    pub flavor: Option<String>,
    /// Image id. Azure takes `publisher:offer:sku:version`.
    pub image: Option<String>,
    /// Admin login; Azure requires both.
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Power operations on a running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Reboot,
    Stop,
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reboot => "reboot",
            Self::Stop => "stop",
        })
    }
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner { config, transport }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn provider(&self) -> ProviderName {
        self.inner.config.provider
    }

    pub fn service(&self) -> Service {
        self.inner.config.service
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Plumbing ────────────────────────────────────────────────────

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    pub(crate) async fn authenticate(&self) -> Result<()> {
        Ok(self.transport().authenticate().await?)
    }

    pub(crate) async fn send(&self, request: Request) -> Result<Response> {
        Ok(self.transport().send(request).await?)
    }

    /// Send and decode the body. The `Content-Type` header decides the
    /// format when it names one; otherwise `default` does. An empty body
    /// decodes to `null`.
    pub(crate) async fn fetch(&self, request: Request, default: ContentKind) -> Result<Value> {
        let resp = self.send(request).await?;
        if resp.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        let kind = resp
            .content_type()
            .filter(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("json") || ct.contains("xml")
            })
            .map(ContentKind::from_content_type)
            .unwrap_or(default);
        parse(&resp.body, kind)
    }

    pub(crate) fn unsupported(&self, operation: impl Into<String>) -> Error {
        Error::Unsupported {
            provider: self.provider(),
            service: self.service(),
            operation: operation.into(),
        }
    }

    fn ensure(&self, kind: EntityKind, operation: &str) -> Result<()> {
        if self.service().kinds().contains(&kind) && providers::supports(self.provider(), kind) {
            Ok(())
        } else {
            Err(self.unsupported(format!("{operation} {kind}")))
        }
    }

    // ── Mapping ─────────────────────────────────────────────────────

    /// Map a provider payload into an entity owned by this client.
    pub fn map(&self, kind: EntityKind, payload: Value) -> Entity {
        self.map_in(kind, None, payload)
    }

    pub(crate) fn map_in(&self, kind: EntityKind, container: Option<&str>, payload: Value) -> Entity {
        let mut entity = mapper::map(self.provider(), kind, payload);
        if let Some(container) = container {
            entity.container = Some(container.to_string());
        }
        entity.client = ClientRef::new(&self.inner);
        entity
    }

    // ── Operations ──────────────────────────────────────────────────

    /// A lazy listing of `kind`. Files need their `container`.
    ///
    /// Nothing is requested until the returned paginator is streamed.
    pub fn list_all(&self, kind: EntityKind, container: Option<&str>, options: ListOptions) -> Result<Paginator> {
        self.ensure(kind, "listing")?;
        let source = providers::page_source(self, kind, container)?;
        Ok(Paginator::new(source, options))
    }

    /// Fetch one resource. For files this is a metadata-only request, so
    /// it doubles as an existence check: a missing object fails with an
    /// error whose [`Error::is_not_found`] is true.
    pub async fn get(&self, kind: EntityKind, id: &str, container: Option<&str>) -> Result<Entity> {
        self.ensure(kind, "get")?;
        providers::get(self, kind, id, container).await
    }

    pub async fn destroy(&self, kind: EntityKind, id: &str, container: Option<&str>) -> Result<()> {
        self.ensure(kind, "destroy")?;
        providers::destroy(self, kind, id, container).await?;
        info!(provider = %self.provider(), %kind, id, "resource destroyed");
        Ok(())
    }

    /// Upload an object and verify it landed intact, see [`crate::upload`].
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        self.ensure(EntityKind::File, "upload")?;
        upload::upload(self.transport(), request).await
    }

    /// Unpack a tar archive into object storage, one object per member.
    pub async fn extract(&self, request: ExtractRequest) -> Result<ExtractOutcome> {
        self.ensure(EntityKind::File, "extract")?;
        if !matches!(self.provider(), ProviderName::Rackspace | ProviderName::Openstack) {
            return Err(self.unsupported("archive extraction"));
        }
        upload::extract(self.transport(), request).await
    }

    /// Create a server and return it as the provider first reports it.
    /// Required options are checked before anything is sent.
    pub async fn create_server(&self, options: CreateServerOptions) -> Result<Entity> {
        self.ensure(EntityKind::Server, "create")?;
        let server = providers::create_server(self, options).await?;
        info!(provider = %self.provider(), server = %server.id(), "server created");
        Ok(server)
    }

    pub async fn reboot(&self, server_id: &str) -> Result<()> {
        self.server_action(server_id, ServerAction::Reboot).await
    }

    pub async fn stop(&self, server_id: &str) -> Result<()> {
        self.server_action(server_id, ServerAction::Stop).await
    }

    async fn server_action(&self, server_id: &str, action: ServerAction) -> Result<()> {
        self.ensure(EntityKind::Server, &action.to_string())?;
        providers::server_action(self, server_id, action).await?;
        info!(provider = %self.provider(), server = server_id, %action, "server action accepted");
        Ok(())
    }

    pub async fn rename_server(&self, server_id: &str, name: &str) -> Result<Entity> {
        self.ensure(EntityKind::Server, "rename")?;
        providers::rename_server(self, server_id, name).await
    }

    /// Delete an Azure server and, per `options`, the resources it
    /// leaves behind. See [`crate::teardown`].
    pub async fn teardown(&self, server_id: &str, options: TeardownOptions) -> Result<TeardownReport> {
        if self.provider() != ProviderName::Azure || self.service() != Service::Compute {
            return Err(self.unsupported("teardown"));
        }
        let api = AzureCompute::new(self.clone())?;
        teardown::teardown(&api, server_id, options).await
    }

    /// Provision a database instance. Required options are checked before
    /// anything is sent.
    pub async fn create_instance(&self, options: CreateInstanceOptions) -> Result<Entity> {
        self.ensure(EntityKind::Instance, "create")?;
        let entity = providers::create_instance(self, options).await?;
        info!(provider = %self.provider(), instance = %entity.id(), "database instance created");
        Ok(entity)
    }
}
