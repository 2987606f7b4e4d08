//! In-memory transport fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use serde_json::Value;
use skyport_http::{Body, Method, Request, Response, StatusCode, Transport};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::model::{EntityKind, Status};
use crate::{ProviderName, Service, mapper};

/// A request as the fake saw it, body fully drained.
#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub json: Option<Value>,
    pub form: Vec<(String, String)>,
}

impl Sent {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    sent: Arc<Mutex<Vec<Sent>>>,
}

impl Recorder {
    pub fn requests(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.requests().iter().map(Sent::endpoint).collect()
    }
}

type Responder = Box<dyn Fn(&Sent) -> skyport_http::Result<Response> + Send + Sync>;

pub(crate) struct FakeTransport {
    recorder: Recorder,
    responder: Responder,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: Request) -> skyport_http::Result<Response> {
        let endpoint = request.endpoint();
        let Request {
            method,
            path,
            query,
            headers,
            body,
        } = request;

        let (body, json, form) = match body {
            Body::Empty => (Vec::new(), None, Vec::new()),
            Body::Bytes(b) => (b.to_vec(), None, Vec::new()),
            Body::Json(v) => (v.to_string().into_bytes(), Some(v), Vec::new()),
            Body::Form(pairs) => (Vec::new(), None, pairs),
            Body::Stream(s) => {
                let chunks: Vec<Bytes> = s.try_collect().await.map_err(|e| {
                    skyport_http::Error::Transport {
                        endpoint: endpoint.clone(),
                        message: e.to_string(),
                    }
                })?;
                (chunks.concat(), None, Vec::new())
            }
        };

        let sent = Sent {
            method,
            path,
            query,
            headers,
            body,
            json,
            form,
        };
        let result = (self.responder)(&sent);
        self.recorder.sent.lock().unwrap().push(sent);
        result
    }
}

pub(crate) fn transport<F>(responder: F) -> (Arc<FakeTransport>, Recorder)
where
    F: Fn(&Sent) -> skyport_http::Result<Response> + Send + Sync + 'static,
{
    let recorder = Recorder::default();
    let transport = Arc::new(FakeTransport {
        recorder: recorder.clone(),
        responder: Box::new(responder),
    });
    (transport, recorder)
}

pub(crate) fn client<F>(provider: ProviderName, service: Service, responder: F) -> (Client, Recorder)
where
    F: Fn(&Sent) -> skyport_http::Result<Response> + Send + Sync + 'static,
{
    let mut config = ClientConfig::new(provider, service, "https://api.test");
    if provider == ProviderName::Azure {
        config.subscription_id = Some("sub-1".into());
        config.resource_group = Some("rg-1".into());
    }
    let (transport, recorder) = transport(responder);
    (Client::new(config, transport), recorder)
}

// ── Status vocabularies ─────────────────────────────────────────────

/// Map one payload per vocabulary word, upper-cased, lower-cased and
/// padded, and check each lands on the word's canonical status.
pub(crate) fn assert_vocabulary<F>(provider: ProviderName, kind: EntityKind, table: &[(&str, Status)], payload: F)
where
    F: Fn(&str) -> Value,
{
    assert!(!table.is_empty());
    for (word, expected) in table {
        for raw in [word.to_uppercase(), word.to_lowercase(), format!(" {word} ")] {
            let entity = mapper::map(provider, kind, payload(&raw));
            assert_eq!(entity.status(), *expected, "{provider} {kind} status {raw:?}");
        }
    }
}

// ── Canned responses ────────────────────────────────────────────────

pub(crate) fn with_header(mut resp: Response, name: &'static str, value: &str) -> Response {
    if let Ok(value) = value.parse() {
        resp.headers.insert(name, value);
    }
    resp
}

pub(crate) fn json_response(value: Value) -> skyport_http::Result<Response> {
    let resp = Response::new(StatusCode::OK, value.to_string());
    Ok(with_header(resp, "content-type", "application/json"))
}

pub(crate) fn xml_response(body: &str) -> skyport_http::Result<Response> {
    let resp = Response::new(StatusCode::OK, body.to_string());
    Ok(with_header(resp, "content-type", "text/xml;charset=UTF-8"))
}

pub(crate) fn empty(status: StatusCode) -> skyport_http::Result<Response> {
    Ok(Response::new(status, ""))
}

pub(crate) fn failure(sent: &Sent, status: StatusCode, message: &str) -> skyport_http::Result<Response> {
    Err(skyport_http::Error::Provider {
        endpoint: sent.endpoint(),
        status,
        message: message.into(),
    })
}

/// An object store keyed by request path. PUT stores the body and echoes
/// its MD5 as the ETag (or `etag` when set, to simulate corruption);
/// HEAD and DELETE answer 404 for unknown paths.
pub(crate) fn object_store(
    etag: Option<&str>,
    fail_delete: bool,
) -> impl Fn(&Sent) -> skyport_http::Result<Response> + Send + Sync + 'static {
    let etag = etag.map(str::to_string);
    let objects: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();

    move |sent: &Sent| {
        let mut objects = objects.lock().unwrap();
        match sent.method {
            Method::PUT => {
                let tag = etag
                    .clone()
                    .unwrap_or_else(|| format!("{:x}", md5::compute(&sent.body)));
                objects.insert(sent.path.clone(), sent.body.clone());
                let resp = Response::new(StatusCode::CREATED, "");
                Ok(with_header(resp, "etag", &format!("\"{tag}\"")))
            }
            Method::HEAD => match objects.get(&sent.path) {
                Some(body) => {
                    let resp = Response::new(StatusCode::OK, "");
                    let resp = with_header(resp, "content-length", &body.len().to_string());
                    Ok(with_header(resp, "etag", &format!("{:x}", md5::compute(body))))
                }
                None => failure(sent, StatusCode::NOT_FOUND, "(empty body)"),
            },
            Method::DELETE if fail_delete => {
                failure(sent, StatusCode::INTERNAL_SERVER_ERROR, "delete refused")
            }
            Method::DELETE => match objects.remove(&sent.path) {
                Some(_) => empty(StatusCode::NO_CONTENT),
                None => failure(sent, StatusCode::NOT_FOUND, "(empty body)"),
            },
            _ => failure(sent, StatusCode::METHOD_NOT_ALLOWED, "unexpected method"),
        }
    }
}
