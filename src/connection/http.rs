use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, ETAG, RANGE};

use crate::errors::{FragError, Result};

use super::ResourceConnection;

/// A connection to an HTTP(S) resource served with byte-range support.
///
/// Opening issues a HEAD request to verify `Accept-Ranges: bytes`, resolve
/// the content length and capture the `ETag` for later revalidation. Batched
/// fetches use one multi-range request with a `multipart/byteranges`
/// response, downgrading permanently to per-range requests when the server
/// does not cooperate.
pub struct HttpRangeConnection {
    client: reqwest::Client,
    url: String,
    bytes: u64,
    etag: Option<String>,
    batchable: AtomicBool,
}

impl HttpRangeConnection {
    pub async fn open(url: impl Into<String>) -> Result<Self> {
        Self::open_with(reqwest::Client::new(), url).await
    }

    pub async fn open_with(client: reqwest::Client, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let response = client.head(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FragError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let headers = response.headers();
        match headers.get(ACCEPT_RANGES).and_then(|v| v.to_str().ok()) {
            Some("bytes") => {}
            found => {
                return Err(FragError::HttpHeader(match found {
                    Some(found) => {
                        format!("expected 'Accept-Ranges: bytes', found '{found}' instead")
                    }
                    None => "expected 'Accept-Ranges: bytes', found nothing".to_owned(),
                }))
            }
        }

        let bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                FragError::HttpHeader("missing or unparsable 'Content-Length'".to_owned())
            })?;

        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        log::debug!("http: connected to <{url}> ({bytes} bytes)");
        Ok(Self {
            client,
            url,
            bytes,
            etag,
            batchable: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request_range(&self, range: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, range)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Err(FragError::HttpStatus {
                status,
                url: self.url.clone(),
            });
        }
        self.revalidate(response.headers())?;
        Ok(response)
    }

    // ETag verification against the value captured at open time
    fn revalidate(&self, headers: &HeaderMap) -> Result<()> {
        if let Some(expected) = &self.etag {
            let found = headers.get(ETAG).and_then(|v| v.to_str().ok());
            if found != Some(expected.as_str()) {
                return Err(FragError::CacheMismatch(format!(
                    "ETag mismatch; <{}> may have changed since it was last used",
                    self.url
                )));
            }
        }
        Ok(())
    }

    async fn fetch_each(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        futures::future::try_join_all(ranges.iter().map(|&(lo, hi)| self.fetch(lo, hi))).await
    }
}

#[async_trait]
impl ResourceConnection for HttpRangeConnection {
    fn bytes(&self) -> u64 {
        self.bytes
    }

    async fn fetch(&self, lo: u64, hi: u64) -> Result<Bytes> {
        if hi <= lo {
            return Ok(Bytes::new());
        }
        let response = self.request_range(&format!("bytes={}-{}", lo, hi - 1)).await?;
        if response.status().as_u16() != 206 {
            return Err(FragError::HttpStatus {
                status: response.status().as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(response.bytes().await?)
    }

    async fn fetch_many(&self, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        match ranges {
            [] => return Ok(Vec::new()),
            [(lo, hi)] => return Ok(vec![self.fetch(*lo, *hi).await?]),
            _ => {}
        }
        if !self.batchable.load(Ordering::Relaxed) {
            return self.fetch_each(ranges).await;
        }

        let spec = ranges
            .iter()
            .map(|&(lo, hi)| format!("{}-{}", lo, hi - 1))
            .collect::<Vec<_>>()
            .join(", ");
        let response = self.request_range(&format!("bytes={spec}")).await?;

        if response.status().as_u16() == 200 {
            // server ignored the range request entirely
            log::warn!(
                "http: <{}> answered 200 to a multi-range request; downgrading to per-range fetches",
                self.url
            );
            self.batchable.store(false, Ordering::Relaxed);
            return self.fetch_each(ranges).await;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        let body = response.bytes().await?;

        match boundary_of(&content_type) {
            Some(boundary) => parse_multipart(&body, &boundary, ranges),
            None => {
                // single-part answer to a multi-range request
                log::warn!(
                    "http: <{}> answered '{}' to a multi-range request; downgrading to per-range fetches",
                    self.url,
                    content_type
                );
                self.batchable.store(false, Ordering::Relaxed);
                self.fetch_each(ranges).await
            }
        }
    }
}

/// Extract the boundary parameter from a `multipart/byteranges` media type.
fn boundary_of(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if parts.next()?.trim() != "multipart/byteranges" {
        return None;
    }
    for parameter in parts {
        if let Some(value) = parameter.trim().strip_prefix("boundary=") {
            return Some(value.trim_matches('"').to_owned());
        }
    }
    None
}

/// Parse a `multipart/byteranges` body, mapping each part back to the
/// requested range via its `Content-Range` header.
fn parse_multipart(body: &Bytes, boundary: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
    let delimiter = format!("--{boundary}");
    let mut parts: Vec<(u64, Bytes)> = Vec::new();

    let mut pos = match find(body, delimiter.as_bytes(), 0) {
        Some(at) => at,
        None => {
            return Err(FragError::HttpHeader(
                "multipart body contains no boundary".to_owned(),
            ))
        }
    };

    loop {
        let after = pos + delimiter.len();
        if body[after..].starts_with(b"--") {
            break; // closing delimiter
        }
        let header_start = match body[after..].starts_with(b"\r\n") {
            true => after + 2,
            false => after,
        };
        let header_end = find(body, b"\r\n\r\n", header_start).ok_or_else(|| {
            FragError::HttpHeader("multipart part is missing a header block".to_owned())
        })?;
        let body_start = header_end + 4;
        let next = find(body, delimiter.as_bytes(), body_start).ok_or_else(|| {
            FragError::HttpHeader("multipart body is missing its closing boundary".to_owned())
        })?;
        let mut body_end = next;
        if body_end >= 2 && &body[body_end - 2..body_end] == b"\r\n" {
            body_end -= 2;
        }

        let headers = std::str::from_utf8(&body[header_start..header_end])?;
        let range_lo = content_range_lo(headers).ok_or_else(|| {
            FragError::HttpHeader("multipart part is missing 'Content-Range'".to_owned())
        })?;
        parts.push((range_lo, body.slice(body_start..body_end)));

        pos = next;
    }

    ranges
        .iter()
        .map(|&(lo, hi)| {
            let (_, data) = parts
                .iter()
                .find(|(part_lo, _)| *part_lo == lo)
                .ok_or_else(|| {
                    FragError::HttpHeader(format!(
                        "multipart response has no part for range {lo}-{}",
                        hi - 1
                    ))
                })?;
            if data.len() as u64 != hi - lo {
                return Err(FragError::HttpHeader(format!(
                    "multipart part for range {lo}-{} has {} byte(s), expected {}",
                    hi - 1,
                    data.len(),
                    hi - lo
                )));
            }
            Ok(data.clone())
        })
        .collect()
}

/// First position of `Content-Range: bytes lo-hi/total` in a part's headers.
fn content_range_lo(headers: &str) -> Option<u64> {
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-range") {
            let spec = value.trim().strip_prefix("bytes ")?;
            let (lo, _) = spec.split_once('-')?;
            return lo.parse().ok();
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| at + from)
}
