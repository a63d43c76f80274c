//! STAC API backend for [`CatalogClient`](crate::io::CatalogClient).
//!
//! Item Search over HTTP (POST `/search` with the query extension), `next`
//! link pagination, and Planetary Computer SAS signing of asset hrefs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::io::catalog::CatalogBackend;
use crate::types::{AssetReference, CatalogItem, SearchCriteria, VegError, VegResult};

const PC_SIGN_URL: &str = "https://planetarycomputer.microsoft.com/api/sas/v1/sign";

/// Well-known STAC endpoints plus custom ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StacEndpoint {
    /// Microsoft Planetary Computer (assets need SAS signing)
    PlanetaryComputer,
    /// AWS Earth Search (Element 84)
    EarthSearch,
    /// Any STAC API root URL
    Custom(String),
}

impl StacEndpoint {
    /// Full `/search` URL
    pub fn search_url(&self) -> String {
        match self {
            Self::PlanetaryComputer => {
                "https://planetarycomputer.microsoft.com/api/stac/v1/search".to_string()
            }
            Self::EarthSearch => "https://earth-search.aws.element84.com/v1/search".to_string(),
            Self::Custom(base) => {
                let base = base.trim_end_matches('/');
                if base.ends_with("/search") {
                    base.to_string()
                } else {
                    format!("{}/search", base)
                }
            }
        }
    }

    pub fn needs_signing(&self) -> bool {
        matches!(self, Self::PlanetaryComputer)
    }
}

/// Connection parameters for [`StacApi`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacApiOptions {
    pub endpoint: StacEndpoint,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Items requested per page
    pub page_size: u32,
    /// Upper bound on items collected across pages
    pub max_items: usize,
}

impl Default for StacApiOptions {
    fn default() -> Self {
        Self {
            endpoint: StacEndpoint::PlanetaryComputer,
            request_timeout: Duration::from_secs(60),
            page_size: 100,
            max_items: 500,
        }
    }
}

/// Body of `POST /search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacSearchRequest {
    pub collections: Vec<String>,
    pub intersects: serde_json::Value,
    pub datetime: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub query: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl StacSearchRequest {
    pub fn from_criteria(criteria: &SearchCriteria, page_size: u32) -> VegResult<Self> {
        let mut query = serde_json::Map::new();
        query.insert(
            "eo:cloud_cover".to_string(),
            serde_json::json!({ "lt": criteria.max_cloud_cover }),
        );
        for filter in &criteria.filters {
            let entry = query
                .entry(filter.property.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let Some(ops) = entry.as_object_mut() {
                ops.insert(filter.op.as_str().to_string(), filter.value.clone());
            }
        }

        Ok(Self {
            collections: vec![criteria.collection.clone()],
            intersects: criteria.aoi.to_json()?,
            datetime: criteria.date_range.to_stac_interval(),
            query,
            limit: Some(page_size),
            token: None,
        })
    }
}

/// A page of search results (GeoJSON FeatureCollection)
#[derive(Debug, Clone, Deserialize)]
pub struct StacItemCollection {
    #[serde(default)]
    pub features: Vec<StacItem>,
    #[serde(default)]
    pub links: Vec<StacLink>,
}

impl StacItemCollection {
    pub fn next_link(&self) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == "next")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItem {
    pub id: String,
    pub properties: StacItemProperties,
    #[serde(default)]
    pub assets: HashMap<String, StacAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItemProperties {
    pub datetime: Option<String>,
    #[serde(rename = "eo:cloud_cover")]
    pub eo_cloud_cover: Option<f64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacAsset {
    pub href: String,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacLink {
    pub rel: String,
    pub href: String,
    pub method: Option<String>,
    pub body: Option<serde_json::Value>,
    pub merge: Option<bool>,
}

impl StacItem {
    /// Convert into the pipeline's item model.
    ///
    /// Returns `None` when the item has no parseable acquisition datetime.
    /// A missing cloud cover counts as 0%.
    pub fn into_catalog_item(self) -> Option<CatalogItem> {
        let datetime = self
            .properties
            .datetime
            .as_deref()
            .and_then(|dt| DateTime::parse_from_rfc3339(dt).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let datetime = match datetime {
            Some(dt) => dt,
            None => {
                log::warn!("Skipping item {}: missing or invalid datetime", self.id);
                return None;
            }
        };

        let assets: BTreeMap<String, AssetReference> = self
            .assets
            .into_iter()
            .map(|(band, asset)| {
                let content_length = asset.extra.get("file:size").and_then(|v| v.as_u64());
                let reference = AssetReference {
                    band: band.clone(),
                    href: asset.href,
                    content_length,
                };
                (band, reference)
            })
            .collect();

        Some(CatalogItem {
            id: self.id,
            datetime,
            cloud_cover: self.properties.eo_cloud_cover.unwrap_or(0.0),
            assets,
        })
    }
}

/// Blocking STAC API client
pub struct StacApi {
    options: StacApiOptions,
    client: reqwest::blocking::Client,
}

impl StacApi {
    pub fn open(options: StacApiOptions) -> VegResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| VegError::CatalogUnavailable(format!("failed to build HTTP client: {}", e)))?;

        log::debug!("Opened STAC endpoint {}", options.endpoint.search_url());
        Ok(Self { options, client })
    }

    pub fn options(&self) -> &StacApiOptions {
        &self.options
    }

    fn post_search(&self, url: &str, body: &serde_json::Value) -> VegResult<StacItemCollection> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| VegError::CatalogUnavailable(format!("STAC search request failed: {}", e)))?;
        Self::parse_page(response)
    }

    fn get_page(&self, url: &str) -> VegResult<StacItemCollection> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| VegError::CatalogUnavailable(format!("STAC pagination failed: {}", e)))?;
        Self::parse_page(response)
    }

    fn parse_page(response: reqwest::blocking::Response) -> VegResult<StacItemCollection> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(VegError::CatalogUnavailable(format!(
                "STAC search returned HTTP {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        response
            .json::<StacItemCollection>()
            .map_err(|e| VegError::CatalogUnavailable(format!("parsing STAC response: {}", e)))
    }

    /// Follow a `next` link. POST links carry a body, optionally merged over
    /// the original request.
    fn follow_next(
        &self,
        link: &StacLink,
        original: &serde_json::Value,
    ) -> VegResult<StacItemCollection> {
        let method = link.method.as_deref().unwrap_or("GET").to_uppercase();
        if method != "POST" {
            return self.get_page(&link.href);
        }

        let body = match (&link.body, link.merge.unwrap_or(false)) {
            (Some(link_body), true) => {
                let mut merged = original.clone();
                if let (Some(base), Some(overlay)) = (merged.as_object_mut(), link_body.as_object()) {
                    for (k, v) in overlay {
                        base.insert(k.clone(), v.clone());
                    }
                }
                merged
            }
            (Some(link_body), false) => link_body.clone(),
            (None, _) => original.clone(),
        };
        self.post_search(&link.href, &body)
    }
}

impl CatalogBackend for StacApi {
    fn search_items(&self, criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>> {
        let request = StacSearchRequest::from_criteria(criteria, self.options.page_size)?;
        let body = serde_json::to_value(&request)
            .map_err(|e| VegError::InvalidInput(format!("serializing search request: {}", e)))?;

        let max = self.options.max_items;
        let mut items = Vec::new();
        let mut page = self.post_search(&self.options.endpoint.search_url(), &body)?;

        loop {
            let next = page.next_link().cloned();
            let fetched = page.features.len();
            items.extend(page.features.into_iter().filter_map(StacItem::into_catalog_item));

            if items.len() >= max || fetched == 0 {
                break;
            }
            match next {
                Some(link) => page = self.follow_next(&link, &body)?,
                None => break,
            }
        }

        items.truncate(max);
        Ok(items)
    }

    /// Planetary Computer hrefs go through the SAS `/sign` endpoint; other
    /// catalogs serve assets unsigned.
    fn sign(&self, href: &str) -> VegResult<String> {
        if !self.options.endpoint.needs_signing() {
            return Ok(href.to_string());
        }

        let response = self
            .client
            .get(PC_SIGN_URL)
            .query(&[("href", href)])
            .send()
            .map_err(|e| VegError::CatalogUnavailable(format!("PC sign request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(VegError::CatalogUnavailable(format!(
                "PC sign returned HTTP {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| VegError::CatalogUnavailable(format!("parsing PC sign response: {}", e)))?;

        body["href"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| VegError::CatalogUnavailable("PC sign response missing 'href'".to_string()))
    }

    fn name(&self) -> String {
        self.options.endpoint.search_url()
    }
}
