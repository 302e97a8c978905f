use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_LENGTH,
    CONTENT_RANGE, RANGE,
};
use reqwest::StatusCode;
use url::Url;

use crate::store::{FetchError, ObjectStore};

/// [`ObjectStore`] over HTTP `Range` requests.
///
/// Auth is the caller's concern: pass whatever headers the remote needs
/// (`Authorization`, `Cookie`, a signed URL) via [`HttpRangeStore::with_header`].
pub struct HttpRangeStore {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl HttpRangeStore {
    pub fn new(url: Url) -> Result<Self, FetchError> {
        if !url.has_host() {
            return Err(FetchError::Permanent(format!(
                "URL must be absolute: {url}"
            )));
        }
        let mut headers = HeaderMap::new();
        // Block bytes need a stable byte representation; refuse transparent
        // compression at intermediaries.
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            headers,
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, FetchError> {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| FetchError::Permanent(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| FetchError::Permanent(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Discover the object length: `HEAD` when the server advertises byte
    /// ranges, otherwise a one-byte ranged `GET` whose `Content-Range` echoes
    /// the total size.
    pub async fn probe_length(&self) -> Result<u64, FetchError> {
        if let Ok(resp) = self
            .client
            .head(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await
        {
            if resp.status().is_success() {
                let accepts_ranges = resp
                    .headers()
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
                    .unwrap_or(false);
                let length = resp
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if accepts_ranges {
                    if let Some(length) = length {
                        return Ok(length);
                    }
                }
            }
        }

        let resp = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(classify_status(resp.status()));
        }
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FetchError::Permanent("missing Content-Range".into()))?;
        let (_, _, total) = parse_content_range(content_range)?;
        Ok(total)
    }

    async fn fetch_once(&self, start: u64, end: u64) -> Result<Bytes, FetchError> {
        if start >= end {
            return Ok(Bytes::new());
        }

        let mut headers = self.headers.clone();
        let range = format!("bytes={}-{}", start, end - 1);
        headers.insert(
            RANGE,
            HeaderValue::from_str(&range).map_err(|e| FetchError::Permanent(e.to_string()))?,
        );

        let resp = self
            .client
            .get(self.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() != StatusCode::PARTIAL_CONTENT {
            if resp.status() == StatusCode::OK {
                // The server ignored the Range header; treating the full
                // representation as a block would hand back wrong bytes.
                return Err(FetchError::Permanent(
                    "remote does not support range requests".into(),
                ));
            }
            return Err(classify_status(resp.status()));
        }

        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FetchError::Permanent("missing Content-Range".into()))?;
        let (cr_start, cr_end_inclusive, _) = parse_content_range(content_range)?;
        if cr_start != start || cr_end_inclusive != end - 1 {
            return Err(FetchError::Permanent(format!(
                "unexpected Content-Range: {content_range} (requested bytes {start}-{})",
                end - 1
            )));
        }

        resp.bytes().await.map_err(transport_error)
    }
}

impl ObjectStore for HttpRangeStore {
    fn fetch_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(self.fetch_once(start, end))
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    // Connection resets and timeouts are worth another attempt.
    FetchError::Retryable(err.to_string())
}

fn classify_status(status: StatusCode) -> FetchError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchError::Retryable(format!("remote returned HTTP {status}"))
    } else {
        FetchError::Permanent(format!("remote returned HTTP {status}"))
    }
}

/// Parse `bytes <start>-<end_inclusive>/<total>`.
fn parse_content_range(content_range: &str) -> Result<(u64, u64, u64), FetchError> {
    let invalid = || FetchError::Permanent(format!("invalid Content-Range: {content_range}"));

    let mut parts = content_range.trim().split_whitespace();
    let unit = parts.next().ok_or_else(invalid)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return Err(invalid());
    }
    let spec = parts.next().ok_or_else(invalid)?;

    let (range_part, total_part) = spec.split_once('/').ok_or_else(invalid)?;
    let total: u64 = total_part.parse().map_err(|_| invalid())?;
    let (start_part, end_part) = range_part.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start_part.parse().map_err(|_| invalid())?;
    let end: u64 = end_part.parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, end, total))
}
