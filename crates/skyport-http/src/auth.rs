//! Provider authentication handshakes.
//!
//! Token-based schemes (Keystone, Azure AD) exchange credentials for a
//! token on first use; the remaining schemes decorate each request.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result, provider_message};

const AZURE_AUTHORITY: &str = "https://login.microsoftonline.com";
const AZURE_RESOURCE: &str = "https://management.azure.com/";

/// How a transport authenticates against its provider.
#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    /// Arbitrary static header, e.g. RedisToGo's `Authorization: Token token="..."`.
    Header {
        name: String,
        value: String,
    },
    Keystone(KeystoneCredentials),
    AzureAd(AzureCredentials),
    AwsQuery(AwsCredentials),
    /// S3 REST requests, signed with an `Authorization: AWS4-HMAC-SHA256` header.
    AwsS3 {
        credentials: AwsCredentials,
        region: String,
    },
}

#[derive(Debug, Clone)]
pub struct KeystoneCredentials {
    pub auth_url: String,
    pub username: String,
    pub secret: KeystoneSecret,
    pub tenant_id: Option<String>,
    /// Picks the service endpoint out of the token response's catalog.
    pub catalog: Option<CatalogSelector>,
}

/// Which service catalog entry a Keystone session talks to.
#[derive(Debug, Clone)]
pub struct CatalogSelector {
    /// Catalog `type`, e.g. `compute`, `object-store` or `rax:database`.
    pub service_type: String,
    /// Matched case-insensitively; `None` takes the first endpoint listed.
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub enum KeystoneSecret {
    /// Rackspace `RAX-KSKEY:apiKeyCredentials`.
    ApiKey(String),
    Password(String),
}

#[derive(Debug, Clone)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Overrides the AD authority, mostly for tests.
    pub authority: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Deserialize)]
struct KeystoneResponse {
    access: KeystoneAccess,
}

#[derive(Deserialize)]
struct KeystoneAccess {
    token: KeystoneToken,
    #[serde(default, rename = "serviceCatalog")]
    service_catalog: Vec<CatalogService>,
}

#[derive(Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

#[derive(Deserialize)]
struct KeystoneToken {
    id: String,
}

#[derive(Deserialize)]
struct AzureTokenResponse {
    access_token: String,
}

/// Result of a token exchange.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    /// Service endpoint published alongside the token, if one was selected.
    pub endpoint: Option<String>,
}

impl Auth {
    /// Whether this scheme needs a token exchange before the first request.
    pub fn needs_token(&self) -> bool {
        matches!(self, Self::Keystone(_) | Self::AzureAd(_))
    }

    /// Perform the token exchange. Returns `None` for schemes without one.
    pub(crate) async fn exchange(&self, http: &reqwest::Client) -> Result<Option<Session>> {
        match self {
            Self::Keystone(creds) => keystone_session(http, creds).await.map(Some),
            Self::AzureAd(creds) => azure_token(http, creds).await.map(|token| {
                Some(Session {
                    token,
                    endpoint: None,
                })
            }),
            _ => Ok(None),
        }
    }
}

impl KeystoneAccess {
    fn endpoint(&self, selector: &CatalogSelector) -> Result<String> {
        let service = self
            .service_catalog
            .iter()
            .find(|s| s.service_type == selector.service_type)
            .ok_or_else(|| Error::Auth(format!("keystone: no `{}` service in catalog", selector.service_type)))?;

        let endpoint = match &selector.region {
            Some(region) => service
                .endpoints
                .iter()
                .find(|e| e.region.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(region))),
            None => service.endpoints.first(),
        };
        endpoint.map(|e| e.public_url.clone()).ok_or_else(|| {
            Error::Auth(format!(
                "keystone: `{}` has no endpoint in region {}",
                selector.service_type,
                selector.region.as_deref().unwrap_or("(any)")
            ))
        })
    }
}

async fn keystone_session(http: &reqwest::Client, creds: &KeystoneCredentials) -> Result<Session> {
    let mut auth = match &creds.secret {
        KeystoneSecret::ApiKey(key) => json!({
            "RAX-KSKEY:apiKeyCredentials": { "username": creds.username, "apiKey": key }
        }),
        KeystoneSecret::Password(password) => json!({
            "passwordCredentials": { "username": creds.username, "password": password }
        }),
    };
    if let (Some(tenant), Some(obj)) = (&creds.tenant_id, auth.as_object_mut()) {
        obj.insert("tenantId".into(), json!(tenant));
    }

    let url = format!("{}/v2.0/tokens", creds.auth_url.trim_end_matches('/'));
    debug!(%url, "keystone: requesting token");

    let resp = http
        .post(&url)
        .json(&json!({ "auth": auth }))
        .send()
        .await
        .map_err(|e| Error::Auth(format!("keystone: {e}")))?;

    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Auth(format!("keystone: {e}")))?;
    if !status.is_success() {
        return Err(Error::Auth(format!(
            "keystone returned {status}: {}",
            provider_message(&body)
        )));
    }

    let parsed: KeystoneResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::Auth(format!("keystone: malformed token response: {e}")))?;
    let endpoint = creds
        .catalog
        .as_ref()
        .map(|selector| parsed.access.endpoint(selector))
        .transpose()?;
    if let Some(endpoint) = &endpoint {
        debug!(%endpoint, "keystone: endpoint resolved from catalog");
    }

    Ok(Session {
        token: parsed.access.token.id,
        endpoint,
    })
}

async fn azure_token(http: &reqwest::Client, creds: &AzureCredentials) -> Result<String> {
    let authority = creds.authority.as_deref().unwrap_or(AZURE_AUTHORITY);
    let url = format!(
        "{}/{}/oauth2/token",
        authority.trim_end_matches('/'),
        creds.tenant_id
    );
    debug!(%url, "azure: requesting token");

    let resp = http
        .post(&url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("resource", AZURE_RESOURCE),
        ])
        .send()
        .await
        .map_err(|e| Error::Auth(format!("azure ad: {e}")))?;

    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Auth(format!("azure ad: {e}")))?;
    if !status.is_success() {
        return Err(Error::Auth(format!(
            "azure ad returned {status}: {}",
            provider_message(&body)
        )));
    }

    let parsed: AzureTokenResponse = serde_json::from_slice(&body)
        .map_err(|e| Error::Auth(format!("azure ad: malformed token response: {e}")))?;
    Ok(parsed.access_token)
}

/// Payload hash sent with S3 requests whose body is streamed.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// The parts of a request that AWS signature version 4 covers.
#[derive(Debug)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    /// Already percent-encoded path, as it goes on the wire.
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// Signed headers, `host` included. Names are matched case-insensitively.
    pub headers: &'a [(String, String)],
    pub payload_hash: &'a str,
}

impl CanonicalRequest<'_> {
    fn signed_headers(&self) -> (String, String) {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
            .collect();
        headers.sort();
        let canonical = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let names = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        (canonical, names)
    }

    fn canonical_path(&self) -> String {
        if self.path.is_empty() {
            return "/".into();
        }
        self.path
            .split('/')
            .map(|segment| {
                let decoded = urlencoding::decode(segment)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| segment.to_string());
                urlencoding::encode(&decoded).into_owned()
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    fn canonical_query(&self) -> String {
        canonical_query(self.query)
    }
}

/// RFC 3986-encoded, sorted `k=v&...` query string, the form SigV4 signs.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| Error::Auth(format!("aws signature: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `x-amz-date` value for `timestamp`.
pub fn amz_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Compute the `Authorization` header value for an AWS signature
/// version 4 request. `x-amz-date` must be among the signed headers and
/// carry [`amz_date`] of the same `timestamp`.
pub fn sign_v4(
    creds: &AwsCredentials,
    region: &str,
    service: &str,
    request: &CanonicalRequest<'_>,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let (canonical_headers, signed_headers) = request.signed_headers();
    let canonical = format!(
        "{}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
        request.method,
        request.canonical_path(),
        request.canonical_query(),
        request.payload_hash,
    );

    let date = timestamp.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{scope}\n{}",
        amz_date(timestamp),
        hex(&Sha256::digest(canonical.as_bytes()))
    );

    let mut key = hmac_sha256(format!("AWS4{}", creds.secret_access_key).as_bytes(), &date)?;
    for part in [region, service, "aws4_request"] {
        key = hmac_sha256(&key, part)?;
    }
    let signature = hex(&hmac_sha256(&key, &string_to_sign)?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope},SignedHeaders={signed_headers},Signature={signature}",
        creds.access_key_id
    ))
}

/// Sign an AWS query API request (signature version 2, HmacSHA256).
///
/// Appends `AWSAccessKeyId`, `SignatureMethod`, `SignatureVersion`,
/// `Timestamp` and finally `Signature` to `params`.
pub fn sign_query_v2(
    creds: &AwsCredentials,
    method: &str,
    host: &str,
    path: &str,
    params: &mut Vec<(String, String)>,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    params.push(("AWSAccessKeyId".into(), creds.access_key_id.clone()));
    params.push(("SignatureMethod".into(), "HmacSHA256".into()));
    params.push(("SignatureVersion".into(), "2".into()));
    params.push((
        "Timestamp".into(),
        timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    ));
    params.sort();

    let canonical = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let path = if path.is_empty() { "/" } else { path };
    let string_to_sign = format!("{method}\n{}\n{path}\n{canonical}", host.to_lowercase());

    let mut mac = Hmac::<Sha256>::new_from_slice(creds.secret_access_key.as_bytes())
        .map_err(|e| Error::Auth(format!("aws signature: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    params.push(("Signature".into(), signature));
    Ok(())
}
