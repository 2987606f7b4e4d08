//! Object uploads with end-to-end integrity checking.
//!
//! The local MD5 is computed while the payload is handed to the
//! transport; streamed sources are hashed chunk by chunk and never
//! collected. After the PUT the digest is compared with the `ETag` the
//! provider reports. On mismatch the object is deleted and the upload
//! fails with [`Error::Integrity`].
//!
//! Swift can also unpack a tar archive server-side, see [`extract`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use skyport_http::{Body, Request, Transport};
use tracing::{info, warn};

use crate::parser::{ContentKind, parse};
use crate::{Error, Result};

pub enum UploadSource {
    Bytes(Bytes),
    /// Read from disk when the upload starts.
    File(PathBuf),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl UploadSource {
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UploadRequest {
    pub container: String,
    /// Object name; `/` separates path segments.
    pub remote: String,
    pub source: UploadSource,
    pub content_type: Option<String>,
}

impl UploadRequest {
    pub fn new(container: impl Into<String>, remote: impl Into<String>, source: UploadSource) -> Self {
        Self {
            container: container.into(),
            remote: remote.into(),
            source,
            content_type: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub container: String,
    pub remote: String,
    /// Lowercase hex MD5, confirmed by the provider.
    pub etag: String,
    pub bytes_sent: u64,
}

/// `/{container}/{remote}` with every segment percent-encoded.
pub fn object_path(container: &str, remote: &str) -> String {
    let mut path = format!("/{}", urlencoding::encode(container));
    for segment in remote.split('/') {
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    path
}

/// Strip quotes and case from an `ETag` so it compares with a hex digest.
pub(crate) fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_ascii_lowercase()
}

struct Tally {
    digest: md5::Context,
    bytes: u64,
}

impl Tally {
    fn new() -> Self {
        Self {
            digest: md5::Context::new(),
            bytes: 0,
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        self.digest.consume(chunk);
        self.bytes += chunk.len() as u64;
    }

    fn finish(&self) -> (String, u64) {
        (format!("{:x}", self.digest.clone().compute()), self.bytes)
    }
}

type SharedTally = Arc<Mutex<Tally>>;

fn lock(tally: &SharedTally) -> MutexGuard<'_, Tally> {
    tally.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hash each chunk as the transport pulls it.
fn tee(stream: BoxStream<'static, io::Result<Bytes>>, tally: SharedTally) -> BoxStream<'static, io::Result<Bytes>> {
    stream
        .inspect_ok(move |chunk| lock(&tally).update(chunk))
        .boxed()
}

/// PUT `request` through `transport` and verify the stored object.
pub async fn upload(transport: &dyn Transport, request: UploadRequest) -> Result<UploadOutcome> {
    let UploadRequest {
        container,
        remote,
        source,
        content_type,
    } = request;

    if container.is_empty() {
        return Err(Error::Validation {
            field: "container",
            reason: "must not be empty".into(),
        });
    }
    if remote.is_empty() {
        return Err(Error::Validation {
            field: "remote",
            reason: "must not be empty".into(),
        });
    }

    let path = object_path(&container, &remote);
    let tally: SharedTally = Arc::new(Mutex::new(Tally::new()));

    let body = match source {
        UploadSource::Bytes(bytes) => {
            lock(&tally).update(&bytes);
            Body::Bytes(bytes)
        }
        UploadSource::File(file) => {
            let bytes = Bytes::from(tokio::fs::read(&file).await?);
            lock(&tally).update(&bytes);
            Body::Bytes(bytes)
        }
        UploadSource::Stream(stream) => Body::Stream(tee(stream, tally.clone())),
    };

    let mut put = Request::put(path.clone()).body(body);
    if let Some(content_type) = content_type {
        put = put.header("Content-Type", content_type);
    }
    let resp = transport.send(put).await?;

    let (local, bytes_sent) = lock(&tally).finish();
    let remote_hash = resp.header("etag").map(normalize_etag).unwrap_or_default();

    if remote_hash == local {
        info!(%container, object = %remote, bytes = bytes_sent, "upload: verified");
        return Ok(UploadOutcome {
            container,
            remote,
            etag: local,
            bytes_sent,
        });
    }

    warn!(
        %container,
        object = %remote,
        %local,
        remote = %remote_hash,
        "upload: checksum mismatch, removing object"
    );
    let cleanup = match transport.send(Request::delete(path)).await {
        Ok(_) => None,
        Err(e) => {
            warn!(%container, object = %remote, error = %e, "upload: failed to remove corrupt object");
            Some(Box::new(Error::from(e)))
        }
    };

    Err(Error::Integrity {
        container,
        object: remote,
        local,
        remote: remote_hash,
        cleanup,
    })
}

// ── Archive extraction ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    #[default]
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
        }
    }
}

#[derive(Debug)]
pub struct ExtractRequest {
    /// Unpack into this container. Without one, each member's top-level
    /// directory names its container.
    pub container: Option<String>,
    pub source: UploadSource,
    pub format: ArchiveFormat,
}

impl ExtractRequest {
    pub fn new(source: UploadSource) -> Self {
        Self {
            container: None,
            source,
            format: ArchiveFormat::default(),
        }
    }

    pub fn into_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn format(mut self, format: ArchiveFormat) -> Self {
        self.format = format;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub files_created: u64,
    /// `(object, status)` for members the provider rejected.
    pub errors: Vec<(String, String)>,
}

/// Swift bulk-operation report. The HTTP status is 200 even when the
/// extraction failed; the real one is in `Response Status`.
#[derive(Deserialize)]
struct BulkReport {
    #[serde(rename = "Number Files Created", default)]
    files_created: u64,
    #[serde(rename = "Response Status", default)]
    status: String,
    #[serde(rename = "Response Body", default)]
    body: String,
    #[serde(rename = "Errors", default)]
    errors: Vec<(String, String)>,
}

/// PUT an archive with `?extract-archive=` and read back the bulk report.
pub async fn extract(transport: &dyn Transport, request: ExtractRequest) -> Result<ExtractOutcome> {
    let ExtractRequest {
        container,
        source,
        format,
    } = request;

    let path = match container.as_deref() {
        Some(container) if !container.is_empty() => format!("/{}", urlencoding::encode(container)),
        _ => String::new(),
    };
    let body = match source {
        UploadSource::Bytes(bytes) => Body::Bytes(bytes),
        UploadSource::File(file) => Body::Bytes(Bytes::from(tokio::fs::read(&file).await?)),
        UploadSource::Stream(stream) => Body::Stream(stream),
    };

    let put = Request::put(path)
        .query("extract-archive", format.as_str())
        .header("Accept", "application/json")
        .body(body);
    let endpoint = put.endpoint();
    let resp = transport.send(put).await?;

    let report: BulkReport = serde_json::from_value(parse(&resp.body, ContentKind::Json)?).map_err(|e| {
        Error::Parse {
            kind: ContentKind::Json,
            message: e.to_string(),
            snippet: String::from_utf8_lossy(&resp.body).chars().take(64).collect(),
        }
    })?;

    let status = report
        .status
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .unwrap_or(200);
    if status >= 400 {
        let message = match report.errors.first() {
            Some((object, error)) => format!("{object}: {error}"),
            None if !report.body.trim().is_empty() => report.body.trim().to_string(),
            None => report.status.clone(),
        };
        return Err(Error::Provider {
            endpoint,
            status,
            message,
        });
    }

    info!(
        container = container.as_deref().unwrap_or("(account)"),
        files = report.files_created,
        errors = report.errors.len(),
        "extract: archive unpacked"
    );
    Ok(ExtractOutcome {
        files_created: report.files_created,
        errors: report.errors,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures_util::stream;

    use super::*;
    use crate::model::EntityKind;
    use crate::testing;
    use crate::{ProviderName, Service};

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn object_path_encodes_each_segment() {
        assert_eq!(object_path("pkgcloud-test-container", "test-file.txt"), "/pkgcloud-test-container/test-file.txt");
        assert_eq!(object_path("c", "dir/a b#1.txt"), "/c/dir/a%20b%231.txt");
        assert_eq!(object_path("my container", "x"), "/my%20container/x");
    }

    #[test]
    fn etag_is_normalized() {
        assert_eq!(normalize_etag("\"5EB63BBBE01EEED093CB22BB8F5ACDC3\""), HELLO_MD5);
    }

    #[tokio::test]
    async fn matching_etag_succeeds() {
        let (transport, recorder) = testing::transport(testing::object_store(None, false));

        let outcome = upload(
            transport.as_ref(),
            UploadRequest::new("c", "hello.txt", UploadSource::Bytes(Bytes::from_static(b"hello world")))
                .content_type("text/plain"),
        )
        .await
        .unwrap();

        assert_eq!(outcome.etag, HELLO_MD5);
        assert_eq!(outcome.bytes_sent, 11);
        let sent = recorder.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn stream_is_hashed_incrementally() {
        let (transport, recorder) = testing::transport(testing::object_store(None, false));
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"wor")),
            Ok(Bytes::from_static(b"ld")),
        ]);

        let outcome = upload(
            transport.as_ref(),
            UploadRequest::new("c", "streamed.txt", UploadSource::stream(chunks)),
        )
        .await
        .unwrap();

        assert_eq!(outcome.etag, HELLO_MD5);
        assert_eq!(outcome.bytes_sent, 11);
        assert_eq!(recorder.requests()[0].body, b"hello world");
    }

    #[tokio::test]
    async fn file_source_is_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let (transport, _) = testing::transport(testing::object_store(None, false));

        let outcome = upload(
            transport.as_ref(),
            UploadRequest::new("c", "from-disk.txt", UploadSource::File(file.path().to_path_buf())),
        )
        .await
        .unwrap();
        assert_eq!(outcome.etag, HELLO_MD5);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, recorder) = testing::transport(testing::object_store(None, false));

        let err = upload(
            transport.as_ref(),
            UploadRequest::new("c", "x", UploadSource::File(dir.path().join("nope"))),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn mismatch_deletes_the_object() {
        let (client, recorder) = testing::client(
            ProviderName::Rackspace,
            Service::Storage,
            testing::object_store(Some("00000000000000000000000000000000"), false),
        );

        let err = client
            .upload(UploadRequest::new("c", "bad.txt", UploadSource::Bytes(Bytes::from_static(b"hello world"))))
            .await
            .unwrap_err();

        match &err {
            Error::Integrity {
                local,
                remote,
                cleanup,
                ..
            } => {
                assert_eq!(local, HELLO_MD5);
                assert_eq!(remote, "00000000000000000000000000000000");
                assert!(cleanup.is_none());
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
        assert_eq!(recorder.endpoints(), ["PUT /c/bad.txt", "DELETE /c/bad.txt"]);

        let gone = client
            .get(EntityKind::File, "bad.txt", Some("c"))
            .await
            .unwrap_err();
        assert!(gone.is_not_found());
    }

    #[tokio::test]
    async fn failed_cleanup_is_recorded() {
        let (transport, _) = testing::transport(testing::object_store(Some("ffff"), true));

        let err = upload(
            transport.as_ref(),
            UploadRequest::new("c", "bad.txt", UploadSource::Bytes(Bytes::from_static(b"x"))),
        )
        .await
        .unwrap_err();

        match err {
            Error::Integrity {
                cleanup: Some(cleanup),
                ..
            } => assert_eq!(cleanup.status(), Some(500)),
            other => panic!("expected integrity error with cleanup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let (transport, recorder) = testing::transport(testing::object_store(None, false));
        let err = upload(
            transport.as_ref(),
            UploadRequest::new("", "x", UploadSource::Bytes(Bytes::new())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "container", .. }));
        assert!(recorder.requests().is_empty());
    }

    #[tokio::test]
    async fn extract_puts_the_archive_at_the_account_root() {
        let (transport, recorder) = testing::transport(|_| {
            testing::json_response(serde_json::json!({
                "Number Files Created": 2,
                "Response Status": "201 Created",
                "Response Body": "",
                "Errors": []
            }))
        });

        let archive = Bytes::from_static(b"\x1f\x8b\x08\x00 not really a tarball");
        let outcome = extract(transport.as_ref(), ExtractRequest::new(UploadSource::Bytes(archive.clone())))
            .await
            .unwrap();

        assert_eq!(outcome.files_created, 2);
        assert!(outcome.errors.is_empty());

        let sent = recorder.requests();
        assert_eq!(sent[0].endpoint(), "PUT ");
        assert_eq!(sent[0].query_value("extract-archive"), Some("tar.gz"));
        assert_eq!(sent[0].header("accept"), Some("application/json"));
        assert_eq!(sent[0].body, archive.to_vec());
    }

    #[tokio::test]
    async fn extract_failure_inside_the_report_is_an_error() {
        let (transport, recorder) = testing::transport(|_| {
            testing::json_response(serde_json::json!({
                "Number Files Created": 0,
                "Response Status": "400 Bad Request",
                "Response Body": "Invalid Tar File: not a gzip file",
                "Errors": []
            }))
        });

        let err = extract(
            transport.as_ref(),
            ExtractRequest::new(UploadSource::Bytes(Bytes::from_static(b"junk")))
                .into_container("backups")
                .format(ArchiveFormat::Tar),
        )
        .await
        .unwrap_err();

        match err {
            Error::Provider { status, message, .. } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid Tar File: not a gzip file");
            }
            other => panic!("expected provider error, got {other:?}"),
        }
        let sent = recorder.requests();
        assert_eq!(sent[0].path, "/backups");
        assert_eq!(sent[0].query_value("extract-archive"), Some("tar"));
    }
}
