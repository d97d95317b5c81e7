//! Upload of batches to an S3 style object store, authenticated with a signature computed
//! over a canonical description of the request.

use std::io::Read;
use std::thread;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use curl::easy::{Easy, List};
use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use sha1::Sha1;
use thiserror::Error;
use url::Url;

use crate::batch::BatchArtifact;
use crate::buffer::{BufferError, BufferStore};
use crate::config::Config;

type HmacSha1 = Hmac<Sha1>;

/// HTTP statuses worth another attempt
const TRANSIENT_STATUSES: [u32; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<curl::Error> for TransportError {
    fn from(e: curl::Error) -> Self {
        TransportError(e.to_string())
    }
}

/// Everything needed to understand why the store refused an upload
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub string_to_sign: String,
    pub response: String,
    pub code: Option<String>,
    pub message: Option<String>,
    /// What the store says it expected to be signed
    pub expected_string_to_sign: Option<String>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Could not upload to '{url}': {source}")]
    Transport { url: String, source: TransportError },
    #[error("Upload rejected with HTTP status {status}")]
    Rejected {
        status: u32,
        body: String,
        diagnostics: Option<Box<Diagnostics>>,
    },
    #[error("Endpoint '{0}' cannot be uploaded to")]
    Endpoint(String),
    #[error("Could not sign request: {0}")]
    Signing(String),
    #[error("Uploaded, but could not clean up the buffer: {0}")]
    Cleanup(#[from] BufferError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u32,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait Transport {
    fn put(&self, request: &PutRequest) -> Result<HttpResponse, TransportError>;
}

pub struct CurlTransport;

impl Transport for CurlTransport {
    fn put(&self, request: &PutRequest) -> Result<HttpResponse, TransportError> {
        let mut headers = List::new();
        for (name, value) in &request.headers {
            headers.append(&format!("{name}: {value}"))?;
        }
        headers.append("Expect:")?;

        let mut easy = Easy::new();
        easy.url(&request.url)?;
        easy.upload(true)?;
        easy.in_filesize(request.body.len() as u64)?;
        easy.http_headers(headers)?;

        let mut put_data = request.body.as_slice();
        let mut data = Vec::new();
        {
            let mut transfer = easy.transfer();
            transfer.read_function(|buf| Ok(put_data.read(buf).unwrap_or(0)))?;
            transfer.write_function(|new_data| {
                data.extend_from_slice(new_data);
                Ok(new_data.len())
            })?;
            transfer.perform()?;
        }

        Ok(HttpResponse {
            status: easy.response_code()?,
            body: data,
        })
    }
}

/// The parts of a request that are signed
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub content_md5: &'a str,
    pub content_type: &'a str,
    pub date: &'a str,
    pub acl: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
}

pub fn canonical_string(request: &CanonicalRequest) -> String {
    format!(
        "{}\n{}\n{}\n{}\nx-amz-acl:{}\n/{}/{}",
        request.method,
        request.content_md5,
        request.content_type,
        request.date,
        request.acl,
        request.bucket,
        request.key
    )
}

/// Base64 of the HMAC-SHA1 of `string_to_sign` keyed with `secret`
pub fn sign(secret: &str, string_to_sign: &str) -> Result<String, UploadError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| UploadError::Signing(e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// RFC 1123 date in GMT, always with English day and month names
pub fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Text between `<field>` and `</field>` in an XML error response
fn xml_field(body: &str, field: &str) -> Option<String> {
    let open = format!("<{field}>");
    let close = format!("</{field}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_owned())
}

pub struct UploadClient<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
}

impl<'a> UploadClient<'a> {
    pub fn new(config: &'a Config, transport: &'a dyn Transport) -> Self {
        UploadClient { config, transport }
    }

    fn object_url(&self, key: &str) -> Result<Url, UploadError> {
        let mut url = match &self.config.endpoint_url {
            Some(url) if !url.cannot_be_a_base() => url.clone(),
            _ => return Err(UploadError::Endpoint(self.config.store.endpoint.clone())),
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&self.config.store.bucket)
                .push(key);
        }
        Ok(url)
    }

    /// Build the signed request for `artifact`, returning it with the string that was signed
    pub fn signed_request(
        &self,
        artifact: &BatchArtifact,
        now: DateTime<Utc>,
    ) -> Result<(PutRequest, String), UploadError> {
        let store = &self.config.store;
        let date = http_date(now);
        let string_to_sign = canonical_string(&CanonicalRequest {
            method: "PUT",
            content_md5: &artifact.checksum,
            content_type: &store.content_type,
            date: &date,
            acl: &store.acl,
            bucket: &store.bucket,
            key: &artifact.name,
        });
        let signature = sign(&store.secret_key, &string_to_sign)?;

        let request = PutRequest {
            url: self.object_url(&artifact.name)?.to_string(),
            headers: vec![
                ("Accept".into(), "*/*".into()),
                ("Content-Type".into(), store.content_type.clone()),
                ("Date".into(), date),
                ("Content-MD5".into(), artifact.checksum.clone()),
                ("x-amz-acl".into(), store.acl.clone()),
                (
                    "Authorization".into(),
                    format!("AWS {}:{signature}", store.access_key),
                ),
            ],
            body: artifact.content.clone(),
        };

        Ok((request, string_to_sign))
    }

    fn rejected(&self, response: HttpResponse, string_to_sign: &str) -> UploadError {
        let body = String::from_utf8_lossy(&response.body).into_owned();

        let diagnostics = if self.config.debug {
            let diagnostics = Diagnostics {
                string_to_sign: string_to_sign.to_owned(),
                response: body.clone(),
                code: xml_field(&body, "Code"),
                message: xml_field(&body, "Message"),
                expected_string_to_sign: xml_field(&body, "StringToSign"),
            };
            error!("Signed string was:\n{}", diagnostics.string_to_sign);
            error!("Response was:\n{}", diagnostics.response);
            if let Some(code) = &diagnostics.code {
                error!("Code: {code}");
            }
            if let Some(message) = &diagnostics.message {
                error!("Message: {message}");
            }
            if let Some(expected) = &diagnostics.expected_string_to_sign {
                error!("Store expected to have signed:\n{expected}");
            }
            Some(Box::new(diagnostics))
        } else {
            None
        };

        UploadError::Rejected {
            status: response.status,
            body,
            diagnostics,
        }
    }

    /// Send `artifact`, retrying transient failures up to the configured number of times
    pub fn upload(&self, artifact: &BatchArtifact, now: DateTime<Utc>) -> Result<(), UploadError> {
        let (request, string_to_sign) = self.signed_request(artifact, now)?;
        let retries = self.config.store.retries;

        info!(
            "Uploading '{}' ({} bytes) to {}",
            artifact.name, artifact.length, request.url
        );
        debug!("String to sign:\n{string_to_sign}");

        let mut attempt = 0;
        loop {
            match self.transport.put(&request) {
                Ok(response) if response.is_success() => {
                    info!("Upload of '{}' accepted", artifact.name);
                    debug!("Response: {}", String::from_utf8_lossy(&response.body));
                    return Ok(());
                }
                Ok(response)
                    if TRANSIENT_STATUSES.contains(&response.status) && attempt < retries =>
                {
                    warn!("Upload got HTTP status {}, retrying", response.status);
                }
                Ok(response) => return Err(self.rejected(response, &string_to_sign)),
                Err(e) if attempt < retries => warn!("Upload failed: {e}, retrying"),
                Err(source) => {
                    return Err(UploadError::Transport {
                        url: request.url.clone(),
                        source,
                    })
                }
            }
            attempt += 1;
            thread::sleep(self.config.retry_delay);
        }
    }

    /// Upload `artifact` and, once the store has confirmed it, delete it and the records it
    /// was made from. Records go first: if interrupted, only the batch is left, and uploading
    /// it again overwrites the same object. On failure everything is left for a later run.
    pub fn upload_and_release(
        &self,
        store: &BufferStore,
        artifact: &BatchArtifact,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        self.upload(artifact, now)?;

        for key in &artifact.sources {
            store.remove(key)?;
        }
        store.remove(&artifact.name)?;
        info!(
            "Removed '{}' and the {} records in it",
            artifact.name,
            artifact.sources.len()
        );
        Ok(())
    }
}
