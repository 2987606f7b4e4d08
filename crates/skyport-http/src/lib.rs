//! HTTP transport for skyport provider clients.
//!
//! Covers the single capability the core consumes: send a request, get
//! back status, headers and body, or a transport/provider error. Each
//! provider's authentication handshake lives here too, see [`auth`].

pub mod auth;
mod types;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

pub use auth::{
    Auth, AwsCredentials, AzureCredentials, CatalogSelector, KeystoneCredentials, KeystoneSecret,
    Session,
};
pub use reqwest::header::HeaderMap;
pub use reqwest::{Method, StatusCode};
pub use types::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned {status}: {message}")]
    Provider {
        endpoint: String,
        status: StatusCode,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid url {0}")]
    InvalidUrl(String),
}

impl Error {
    /// HTTP status of a provider rejection.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sends provider requests. Implemented by [`HttpTransport`] and by
/// in-memory fakes in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request. Non-2xx responses come back as
    /// [`Error::Provider`]; no response at all as [`Error::Transport`].
    async fn send(&self, request: Request) -> Result<Response>;

    /// Run the provider's authentication handshake, if it has one.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }
}

/// Pull the human-readable message out of a provider error body.
///
/// Understands the common envelopes (`{"message"}`, `{"error": ...}`,
/// Nova-style `{"itemNotFound": {"message"}}`); falls back to the raw text.
pub fn provider_message(body: &[u8]) -> String {
    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_slice(body) {
        if let Some(msg) = obj.get("message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        match obj.get("error") {
            Some(serde_json::Value::String(msg)) => return msg.clone(),
            Some(err) => {
                if let Some(msg) = err.get("message").and_then(|v| v.as_str()) {
                    return msg.to_string();
                }
            }
            None => {}
        }
        if obj.len() == 1
            && let Some(msg) = obj
                .values()
                .next()
                .and_then(|fault| fault.get("message"))
                .and_then(|v| v.as_str())
        {
            return msg.to_string();
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "(empty body)".into()
    } else {
        text.chars().take(500).collect()
    }
}

/// `reqwest`-backed transport bound to one provider endpoint.
///
/// An empty endpoint is filled in from the Keystone service catalog on
/// the first token exchange.
pub struct HttpTransport {
    endpoint: String,
    auth: Auth,
    session: RwLock<Option<Session>>,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, auth: Auth) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth,
            session: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, session: Option<&Session>, path: &str) -> Result<String> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        let base = match (self.endpoint.trim(), session.and_then(|s| s.endpoint.as_deref())) {
            ("", Some(resolved)) => resolved,
            ("", None) => return Err(Error::InvalidUrl(format!("(no endpoint){path}"))),
            (configured, _) => configured,
        };
        let base = base.trim_end_matches('/');
        Ok(if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        })
    }

    async fn session(&self) -> Result<Option<Session>> {
        if !self.auth.needs_token() {
            return Ok(None);
        }
        if let Some(session) = self.session.read().await.clone() {
            return Ok(Some(session));
        }
        self.authenticate().await?;
        Ok(self.session.read().await.clone())
    }

    /// Add the `x-amz-*` headers to `headers` and return the matching
    /// `Authorization` value. Bodies are streamed, so the payload is unsigned.
    fn sign_s3(
        &self,
        credentials: &AwsCredentials,
        region: &str,
        method: &Method,
        url: &str,
        query: &[(String, String)],
        headers: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let parsed = reqwest::Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::InvalidUrl(url.to_string())),
        };
        let now = Utc::now();

        headers.push(("x-amz-content-sha256".into(), auth::UNSIGNED_PAYLOAD.into()));
        headers.push(("x-amz-date".into(), auth::amz_date(now)));

        let mut signed = headers.clone();
        signed.push(("host".into(), host));
        auth::sign_v4(
            credentials,
            region,
            "s3",
            &auth::CanonicalRequest {
                method: method.as_str(),
                path: parsed.path(),
                query,
                headers: &signed,
                payload_hash: auth::UNSIGNED_PAYLOAD,
            },
            now,
        )
    }

    async fn check(resp: reqwest::Response, endpoint: String) -> Result<Response> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| Error::Transport {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(Error::Provider {
                endpoint,
                status,
                message: provider_message(&body),
            });
        }

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let endpoint = request.endpoint();
        let Request {
            method,
            path,
            mut query,
            mut headers,
            body,
        } = request;
        let session = self.session().await?;
        let mut url = self.url(session.as_ref(), &path)?;

        if let Auth::AwsQuery(creds) = &self.auth {
            let parsed = reqwest::Url::parse(&url).map_err(|_| Error::InvalidUrl(url.clone()))?;
            auth::sign_query_v2(
                creds,
                method.as_str(),
                parsed.host_str().unwrap_or_default(),
                parsed.path(),
                &mut query,
                Utc::now(),
            )?;
        }

        if let Auth::AwsS3 { credentials, region } = &self.auth {
            let authorization = self.sign_s3(credentials, region, &method, &url, &query, &mut headers)?;
            headers.push(("Authorization".into(), authorization));
            // Sent exactly as signed.
            if !query.is_empty() {
                url = format!("{url}?{}", auth::canonical_query(&query));
                query.clear();
            }
        }

        let token = session.map(|s| s.token);

        let mut builder = self.http.request(method, &url);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        builder = match (&self.auth, token) {
            (Auth::Bearer(t), _) => builder.bearer_auth(t),
            (Auth::Basic { username, password }, _) => builder.basic_auth(username, Some(password)),
            (Auth::Header { name, value }, _) => builder.header(name, value),
            (Auth::Keystone(_), Some(t)) => builder.header("X-Auth-Token", t),
            (Auth::AzureAd(_), Some(t)) => builder.bearer_auth(t),
            _ => builder,
        };

        builder = match body {
            Body::Empty => builder,
            Body::Bytes(b) => builder.body(b),
            Body::Json(v) => builder.json(&v),
            Body::Form(pairs) => builder.form(&pairs),
            Body::Stream(s) => builder.body(reqwest::Body::wrap_stream(s)),
        };

        debug!(%endpoint, "sending provider request");

        let resp = builder.send().await.map_err(|e| Error::Transport {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        })?;

        Self::check(resp, endpoint).await
    }

    async fn authenticate(&self) -> Result<()> {
        if let Some(session) = self.auth.exchange(&self.http).await? {
            *self.session.write().await = Some(session);
        }
        Ok(())
    }
}
