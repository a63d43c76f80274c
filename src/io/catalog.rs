use crate::types::{CatalogItem, SearchCriteria, VegError, VegResult};

/// Remote spatio-temporal catalog protocol.
///
/// Implementations issue one logical query (following pagination as needed)
/// and return the raw matches. Connectivity and authorization failures map to
/// [`VegError::CatalogUnavailable`].
pub trait CatalogBackend: Send + Sync {
    fn search_items(&self, criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>>;

    /// Resolve an asset href into a fetchable URL. Catalogs serving public
    /// assets keep the default.
    fn sign(&self, href: &str) -> VegResult<String> {
        Ok(href.to_string())
    }

    /// Short label used in log lines and diagnostics
    fn name(&self) -> String;
}

/// Turns an asset href into a URL that can be fetched.
pub trait AssetSigner: Send + Sync {
    fn sign(&self, href: &str) -> VegResult<String>;
}

/// Signer for catalogs whose assets are publicly readable
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedAssets;

impl AssetSigner for UnsignedAssets {
    fn sign(&self, href: &str) -> VegResult<String> {
        Ok(href.to_string())
    }
}

/// Catalog client opened once per run and passed by reference to the stages
/// that need it.
pub struct CatalogClient {
    backend: Box<dyn CatalogBackend>,
}

impl CatalogClient {
    pub fn new(backend: Box<dyn CatalogBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> String {
        self.backend.name()
    }

    /// Search the catalog for items matching `criteria`.
    ///
    /// The result is never empty: zero matches is reported as
    /// [`VegError::NoResults`] naming the criteria.
    pub fn search(&self, criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>> {
        criteria.validate()?;

        log::info!("Searching {} for {}", self.backend.name(), criteria);
        let raw = self.backend.search_items(criteria)?;
        let total = raw.len();

        let items: Vec<CatalogItem> = raw
            .into_iter()
            .filter(|item| {
                let keep = criteria.date_range.contains(item.datetime)
                    && item.cloud_cover < criteria.max_cloud_cover;
                if !keep {
                    log::debug!(
                        "Dropping {} ({}, cloud {:.1}%): outside criteria",
                        item.id,
                        item.datetime,
                        item.cloud_cover
                    );
                }
                keep
            })
            .collect();

        log::info!(
            "{} product(s) between {} and {} with cloud<{}% ({} returned by catalog)",
            items.len(),
            criteria.date_range.start,
            criteria.date_range.end,
            criteria.max_cloud_cover,
            total
        );
        for item in &items {
            log::info!(
                "  {} - {} - cloud: {:.1}%",
                item.id,
                item.datetime.to_rfc3339(),
                item.cloud_cover
            );
        }

        if items.is_empty() {
            return Err(VegError::NoResults {
                criteria: criteria.to_string(),
            });
        }

        Ok(items)
    }
}

impl AssetSigner for CatalogClient {
    fn sign(&self, href: &str) -> VegResult<String> {
        self.backend.sign(href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AreaOfInterest, DateRange};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;

    struct FixedCatalog(Vec<CatalogItem>);

    impl CatalogBackend for FixedCatalog {
        fn search_items(&self, _criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> String {
            "fixed".to_string()
        }
    }

    struct OfflineCatalog;

    impl CatalogBackend for OfflineCatalog {
        fn search_items(&self, _criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>> {
            Err(VegError::CatalogUnavailable("connection refused".to_string()))
        }

        fn name(&self) -> String {
            "offline".to_string()
        }
    }

    fn item(id: &str, datetime: &str, cloud: f64) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            datetime: datetime.parse::<DateTime<Utc>>().unwrap(),
            cloud_cover: cloud,
            assets: BTreeMap::new(),
        }
    }

    fn criteria(start: &str, end: &str) -> SearchCriteria {
        let aoi = AreaOfInterest::from_geojson_str(
            r#"{"type": "Polygon", "coordinates": [[[0.6, 43.4], [0.8, 43.4], [0.8, 43.6], [0.6, 43.4]]]}"#,
        )
        .unwrap();
        SearchCriteria::new("sentinel-2-l1c", aoi, DateRange::parse(start, end).unwrap(), 20.0)
            .unwrap()
    }

    #[test]
    fn test_search_drops_items_outside_criteria() {
        let client = CatalogClient::new(Box::new(FixedCatalog(vec![
            item("A", "2025-06-20T10:10:31Z", 5.0),
            item("B", "2025-06-23T10:10:31Z", 35.0),
            item("C", "2025-07-02T10:10:31Z", 1.0),
        ])));

        let items = client.search(&criteria("2025-06-01", "2025-06-30")).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "A");
    }

    #[test]
    fn test_search_with_no_matches_is_no_results() {
        let client = CatalogClient::new(Box::new(FixedCatalog(Vec::new())));
        let err = client.search(&criteria("2030-01-01", "2030-01-02")).unwrap_err();
        match err {
            VegError::NoResults { criteria } => assert!(criteria.contains("2030-01-01")),
            other => panic!("expected NoResults, got {:?}", other),
        }
    }

    #[test]
    fn test_backend_failure_is_surfaced() {
        let client = CatalogClient::new(Box::new(OfflineCatalog));
        let err = client.search(&criteria("2025-06-01", "2025-06-30")).unwrap_err();
        assert!(matches!(err, VegError::CatalogUnavailable(_)));
    }
}
