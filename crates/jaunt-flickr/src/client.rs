use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

/// Default Flickr REST endpoint.
pub const DEFAULT_API_URL: &str = "https://api.flickr.com/services/rest";

/// Photos per search page, matching a 3-wide album grid.
pub const PER_PAGE: u32 = 21;

/// Request timeout (seconds). One attempt per call, no retries.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const SEARCH_METHOD: &str = "flickr.photos.search";
const MEDIUM_URL_EXTRA: &str = "url_m";
const OK_STATUS: &str = "ok";

// Search bounding box half-extents in degrees, clamped to valid ranges.
const BBOX_HALF_WIDTH: f64 = 1.0;
const BBOX_HALF_HEIGHT: f64 = 1.0;
const LON_RANGE: (f64, f64) = (-180.0, 180.0);
const LAT_RANGE: (f64, f64) = (-90.0, 90.0);

/// One photo search result: provider id plus a medium-size image URL.
/// Entries missing either field never make it out of the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePhoto {
    pub id: String,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FlickrError {
    /// Connection or request failure; no response to interpret.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-2xx HTTP status.
    #[error("request returned status {0}")]
    Status(reqwest::StatusCode),
    /// Empty body, malformed JSON, missing expected keys, or a
    /// provider-reported error status. One kind, no partial recovery.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Thin client over the Flickr photo-search API. Pure fetch-and-parse;
/// persistence belongs to the caller.
pub struct FlickrClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FlickrClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Search for photos around a geographic point. Returns one entry per
    /// usable result; a search that finds nothing returns an empty list
    /// rather than an error.
    pub async fn search(
        &self,
        latitude: f64,
        longitude: f64,
        page: u32,
    ) -> Result<Vec<RemotePhoto>, FlickrError> {
        let bbox = bbox_string(latitude, longitude);
        debug!(%bbox, page, "searching for photos");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("method", SEARCH_METHOD),
                ("api_key", &self.api_key),
                ("bbox", &bbox),
                ("safe_search", "1"),
                ("extras", MEDIUM_URL_EXTRA),
                ("format", "json"),
                ("nojsoncallback", "1"),
                ("per_page", &PER_PAGE.to_string()),
                ("page", &page.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlickrError::Status(status));
        }

        let body = response.bytes().await?;
        parse_search_response(&body)
    }

    /// GET the raw bytes behind a photo URL. Single attempt, no retries.
    pub async fn fetch_image_bytes(&self, url: &str) -> Result<Vec<u8>, FlickrError> {
        debug!(url, "downloading image bytes");
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlickrError::Status(status));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FlickrError::InvalidResponse("empty body".into()));
        }
        Ok(body.to_vec())
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    stat: String,
    message: Option<String>,
    photos: Option<PhotoPage>,
}

#[derive(Deserialize)]
struct PhotoPage {
    photo: Option<Vec<PhotoEntry>>,
}

#[derive(Deserialize)]
struct PhotoEntry {
    id: Option<String>,
    url_m: Option<String>,
}

/// Parse a search response body into usable results. Entries lacking an id
/// or a medium-image URL are skipped, not reported as errors.
fn parse_search_response(body: &[u8]) -> Result<Vec<RemotePhoto>, FlickrError> {
    if body.is_empty() {
        return Err(FlickrError::InvalidResponse("empty body".into()));
    }

    let parsed: SearchResponse = serde_json::from_slice(body)
        .map_err(|err| FlickrError::InvalidResponse(format!("malformed JSON: {err}")))?;

    if parsed.stat != OK_STATUS {
        let message = parsed.message.unwrap_or_else(|| parsed.stat.clone());
        return Err(FlickrError::InvalidResponse(format!(
            "provider returned error status: {message}"
        )));
    }

    let entries = parsed
        .photos
        .and_then(|page| page.photo)
        .ok_or_else(|| FlickrError::InvalidResponse("missing photos key".into()))?;

    let total = entries.len();
    let results: Vec<RemotePhoto> = entries
        .into_iter()
        .filter_map(|entry| match (entry.id, entry.url_m) {
            (Some(id), Some(url)) => Some(RemotePhoto { id, url }),
            _ => None,
        })
        .collect();

    if results.len() < total {
        warn!(
            skipped = total - results.len(),
            "dropped search results missing id or image URL"
        );
    }

    Ok(results)
}

/// Bounding box around a point, clamped so it never leaves valid
/// longitude/latitude ranges. Format: min_lon,min_lat,max_lon,max_lat.
fn bbox_string(latitude: f64, longitude: f64) -> String {
    let min_lon = (longitude - BBOX_HALF_WIDTH).max(LON_RANGE.0);
    let min_lat = (latitude - BBOX_HALF_HEIGHT).max(LAT_RANGE.0);
    let max_lon = (longitude + BBOX_HALF_WIDTH).min(LON_RANGE.1);
    let max_lat = (latitude + BBOX_HALF_HEIGHT).min(LAT_RANGE.1);
    format!("{min_lon},{min_lat},{max_lon},{max_lat}")
}
