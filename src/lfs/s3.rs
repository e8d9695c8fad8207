//! S3 content store: virtual-hosted-style requests signed with AWS
//! Signature V4. Only object GET/PUT/DELETE and `list-type=2` LIST are
//! used; the LIST response is scanned for tag values without a full XML
//! parser.

use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use ring::hmac;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::S3Config;
use crate::errors::{ForgeError, Result};
use crate::lfs::storage::{ContentStore, ObjectStream, StoredObject, validate_oid};
use crate::store::records::StorageBackendKind;
use crate::utils::sha256_hex;

const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
/// Idempotent GETs are retried this many times on 5xx responses.
const MAX_GET_ATTEMPTS: u32 = 3;

/// S3 backend bound to one bucket, region, and key prefix.
pub struct S3Store {
    config: S3Config,
    client: reqwest::Client,
    host: String,
    base_url: String,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() || config.access_key_id.is_empty() {
            return Err(ForgeError::BackendError(
                "s3 backend requires bucket and credentials".into(),
            ));
        }
        let (host, base_url) = if config.endpoint.is_empty() {
            let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
            let base = format!("https://{host}");
            (host, base)
        } else {
            let trimmed = config.endpoint.trim_end_matches('/');
            let host = trimmed
                .strip_prefix("https://")
                .or_else(|| trimmed.strip_prefix("http://"))
                .unwrap_or(trimmed)
                .to_string();
            (host, trimmed.to_string())
        };
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            host,
            base_url,
        })
    }

    fn key_for(&self, oid: &str) -> String {
        format!("{}/{}/{}", self.config.prefix, &oid[0..2], oid)
    }

    /// Sign one request, returning the headers to attach.
    fn sign(
        &self,
        method: &str,
        uri_path: &str,
        query: &[(String, String)],
        payload_hash: &str,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_uri = uri_encode(uri_path, false);
        let mut sorted = query.to_vec();
        sorted.sort();
        let canonical_query = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        // HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), "s3"), "aws4_request")
        let secret = format!("AWS4{}", self.config.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        );

        vec![
            ("authorization".to_string(), authorization),
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ]
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, uri_encode(key, false))
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<(Vec<StoredObject>, Option<String>)> {
        let mut query: Vec<(String, String)> = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let headers = self.sign("GET", "/", &query, EMPTY_PAYLOAD_HASH);
        let mut request = self.client.get(format!("{}/", self.base_url)).query(
            &query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect::<Vec<_>>(),
        );
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::BackendError(format!("s3 list: {e}")))?;
        if !response.status().is_success() {
            return Err(ForgeError::BackendError(format!(
                "s3 list returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ForgeError::BackendError(format!("s3 list body: {e}")))?;

        let keys = extract_tag_values(&body, "Key");
        let sizes = extract_tag_values(&body, "Size");
        let modified = extract_tag_values(&body, "LastModified");

        let mut objects = Vec::with_capacity(keys.len());
        for (idx, key) in keys.iter().enumerate() {
            let Some(oid) = key.rsplit('/').next().map(str::to_owned) else {
                continue;
            };
            if validate_oid(&oid).is_err() {
                continue;
            }
            let size = sizes
                .get(idx)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let modified = modified
                .get(idx)
                .and_then(|m| chrono::DateTime::parse_from_rfc3339(m).ok())
                .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            objects.push(StoredObject {
                oid,
                size,
                modified,
            });
        }

        let truncated = extract_tag_values(&body, "IsTruncated")
            .first()
            .is_some_and(|v| v == "true");
        let next = truncated
            .then(|| {
                extract_tag_values(&body, "NextContinuationToken")
                    .into_iter()
                    .next()
            })
            .flatten();
        Ok((objects, next))
    }
}

#[async_trait]
impl ContentStore for S3Store {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::S3
    }

    async fn exists(&self, oid: &str) -> Result<bool> {
        validate_oid(oid)?;
        let key = self.key_for(oid);
        let (page, _) = self.list_page(&key, None).await?;
        Ok(page.iter().any(|o| o.oid == oid))
    }

    async fn get(&self, oid: &str) -> Result<ObjectStream> {
        validate_oid(oid)?;
        let key = self.key_for(oid);
        let path = format!("/{key}");
        let url = self.object_url(&key);

        let mut last_err = None;
        for attempt in 0..MAX_GET_ATTEMPTS {
            if attempt > 0 {
                // Exponential backoff between idempotent retries.
                tokio::time::sleep(std::time::Duration::from_millis(200 << attempt)).await;
            }
            let headers = self.sign("GET", &path, &[], EMPTY_PAYLOAD_HASH);
            let mut request = self.client.get(&url);
            for (name, value) in &headers {
                request = request.header(name, value);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    use futures::TryStreamExt;
                    let stream = response
                        .bytes_stream()
                        .map_err(|e| ForgeError::BackendError(format!("s3 read: {e}")));
                    return Ok(Box::pin(stream));
                }
                Ok(response) if response.status().as_u16() == 404 => {
                    return Err(ForgeError::ObjectNotFound(oid.to_string()));
                }
                Ok(response) if response.status().is_server_error() => {
                    last_err = Some(ForgeError::BackendError(format!(
                        "s3 get returned {}",
                        response.status()
                    )));
                }
                Ok(response) => {
                    return Err(ForgeError::BackendError(format!(
                        "s3 get returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    last_err = Some(ForgeError::BackendError(format!("s3 get: {e}")));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ForgeError::BackendError("s3 get failed".into())))
    }

    async fn put(&self, oid: &str, body: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        validate_oid(oid)?;
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer).await?;
        let payload_hash = sha256_hex(&buffer);

        let written = buffer.len() as u64;
        let key = self.key_for(oid);
        let path = format!("/{key}");
        let headers = self.sign("PUT", &path, &[], &payload_hash);
        let mut request = self.client.put(self.object_url(&key)).body(buffer);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::BackendError(format!("s3 put: {e}")))?;
        if !response.status().is_success() {
            return Err(ForgeError::BackendError(format!(
                "s3 put returned {}",
                response.status()
            )));
        }
        Ok(written)
    }

    async fn delete(&self, oid: &str) -> Result<()> {
        validate_oid(oid)?;
        let key = self.key_for(oid);
        let path = format!("/{key}");
        let headers = self.sign("DELETE", &path, &[], EMPTY_PAYLOAD_HASH);
        let mut request = self.client.delete(self.object_url(&key));
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::BackendError(format!("s3 delete: {e}")))?;
        // 404 means already gone; deletion is idempotent.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(ForgeError::BackendError(format!(
                "s3 delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredObject>> {
        let prefix = format!("{}/", self.config.prefix);
        let mut all = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let (mut page, next) = self.list_page(&prefix, continuation.as_deref()).await?;
            all.append(&mut page);
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        all.sort_by(|a, b| a.oid.cmp(&b.oid));
        Ok(all)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// RFC 3986 percent-encoding as SigV4 requires: unreserved characters pass,
/// everything else is `%XX`; the slash is preserved in URI paths only.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        let unreserved = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~');
        if unreserved || (b == b'/' && !encode_slash) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Extract the text content of every `<tag>...</tag>` occurrence by
/// subsequence scanning.
fn extract_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    values
}
