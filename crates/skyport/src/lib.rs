//! Multi-cloud client core.
//!
//! Turns provider responses (JSON or XML) into canonical [`Entity`]
//! values, walks paginated listings, verifies uploads end to end and
//! runs Azure server teardown with its dependent resources. Requests go
//! through the [`skyport_http::Transport`] trait; [`create_client`] wires
//! up the default `reqwest` transport.

pub mod client;
pub mod config;
pub mod mapper;
pub mod model;
pub mod pagination;
pub mod parser;
mod providers;
pub mod teardown;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skyport_http::HttpTransport;
use tracing::info;

pub use client::{Client, CreateInstanceOptions, CreateServerOptions, ServerAction};
pub use config::{ClientConfig, Credentials};
pub use mapper::{is_private, map, partition_addresses};
pub use model::{Addresses, Entity, EntityKind, Status};
pub use pagination::{Cursor, Limit, ListOptions, Page, PageSource, Paginator};
pub use parser::{ContentKind, parse};
pub use teardown::{
    DependentCategory, TeardownApi, TeardownFailure, TeardownOptions, TeardownPlan,
    TeardownReport, TeardownStage,
};
pub use upload::{ArchiveFormat, ExtractOutcome, ExtractRequest, UploadOutcome, UploadRequest, UploadSource};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed {kind} response: {message} (body starts with {snippet:?})")]
    Parse {
        kind: ContentKind,
        message: String,
        snippet: String,
    },

    #[error("invalid `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{endpoint} returned {status}: {message}")]
    Provider {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("{endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{kind} `{id}` not found")]
    NotFound { kind: EntityKind, id: String },

    #[error(
        "checksum mismatch for {container}/{object}: local {local}, remote {remote:?}{}",
        .cleanup.as_ref().map(|e| format!(" (cleanup failed: {e})")).unwrap_or_default()
    )]
    Integrity {
        container: String,
        object: String,
        local: String,
        remote: String,
        cleanup: Option<Box<Error>>,
    },

    #[error("teardown of `{}` left {} step(s) failed", .server.id(), .failures.len())]
    PartialFailure {
        server: Box<Entity>,
        failures: Vec<TeardownFailure>,
    },

    #[error("deployment `{name}` ended {state}: {message}")]
    Deployment {
        name: String,
        state: String,
        message: String,
    },

    #[error("pagination cursor `{0}` came back twice")]
    CursorRepeated(String),

    #[error("{provider} {service} does not support {operation}")]
    Unsupported {
        provider: ProviderName,
        service: Service,
        operation: String,
    },

    #[error("owning client has been dropped")]
    Detached,

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status of a provider rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. }) || self.status() == Some(404)
    }
}

impl From<skyport_http::Error> for Error {
    fn from(err: skyport_http::Error) -> Self {
        match err {
            skyport_http::Error::Transport { endpoint, message } => {
                Self::Transport { endpoint, message }
            }
            skyport_http::Error::Provider {
                endpoint,
                status,
                message,
            } => Self::Provider {
                endpoint,
                status: status.as_u16(),
                message,
            },
            skyport_http::Error::Auth(message) => Self::Auth(message),
            skyport_http::Error::InvalidUrl(url) => Self::Validation {
                field: "endpoint",
                reason: format!("invalid url {url}"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Providers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Amazon,
    Azure,
    Joyent,
    Openstack,
    Rackspace,
    Redistogo,
}

impl ProviderName {
    pub const ALL: [ProviderName; 6] = [
        Self::Amazon,
        Self::Azure,
        Self::Joyent,
        Self::Openstack,
        Self::Rackspace,
        Self::Redistogo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amazon => "amazon",
            Self::Azure => "azure",
            Self::Joyent => "joyent",
            Self::Openstack => "openstack",
            Self::Rackspace => "rackspace",
            Self::Redistogo => "redistogo",
        }
    }

    /// Whether this provider offers `service` at all.
    pub fn supports(&self, service: Service) -> bool {
        use Service::*;
        match self {
            Self::Rackspace => true,
            Self::Openstack => matches!(service, Compute | Storage | Network),
            Self::Amazon => matches!(service, Compute | Storage),
            Self::Azure | Self::Joyent => service == Compute,
            Self::Redistogo => service == Database,
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Compute,
    Storage,
    Database,
    Network,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Storage => "storage",
            Self::Database => "database",
            Self::Network => "network",
        }
    }

    /// Entity kinds a client for this service can list and fetch.
    pub fn kinds(&self) -> &'static [EntityKind] {
        match self {
            Self::Compute => &[EntityKind::Server, EntityKind::Image, EntityKind::Flavor],
            Self::Storage => &[EntityKind::File],
            Self::Database => &[EntityKind::Instance],
            Self::Network => &[EntityKind::LoadBalancer],
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compute" => Ok(Self::Compute),
            "storage" => Ok(Self::Storage),
            "database" => Ok(Self::Database),
            "network" => Ok(Self::Network),
            _ => Err(Error::UnknownService(s.to_string())),
        }
    }
}

/// Build a client for `config.provider` / `config.service` over the
/// default HTTP transport.
pub fn create_client(config: ClientConfig) -> Result<Client> {
    if !config.provider.supports(config.service) {
        return Err(Error::Unsupported {
            provider: config.provider,
            service: config.service,
            operation: "client creation".into(),
        });
    }

    let auth = config.auth()?;
    let transport = HttpTransport::new(config.endpoint.clone(), auth);
    info!(
        provider = %config.provider,
        service = %config.service,
        endpoint = %config.endpoint,
        "client created"
    );
    Ok(Client::new(config, Arc::new(transport)))
}
