//! Search -> select -> fetch -> compose, for one area of interest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::indices::{BandAlgebraEngine, BandStack};
use crate::core::selection::{ProductSelector, SelectionPolicy};
use crate::io::catalog::CatalogClient;
use crate::io::fetch::{AssetFetcher, FetchReport};
use crate::io::raster::RasterReader;
use crate::types::{
    AreaOfInterest, BandRole, CatalogItem, DateRange, PropertyFilter, SearchCriteria, VegResult,
    VegetationIndexRaster,
};

/// Pipeline parameters
///
/// The default band map is the L2A one: B04 and B08 are 10 m assets while
/// B05 and B8A are 20 m. Band algebra never resamples, so running the
/// defaults against raw L2A assets fails with
/// [`VegError::GeometryMismatch`](crate::types::VegError::GeometryMismatch).
/// Point the map at co-registered assets, or compose from a pre-aligned
/// stack with [`BandStack::from_stacked_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub collection: String,
    /// Upper cloud cover bound, percent (exclusive)
    pub max_cloud_cover: f64,
    /// Extra catalog filters, e.g. a tile identifier
    pub filters: Vec<PropertyFilter>,
    /// Asset name of each spectral role
    pub bands: BTreeMap<BandRole, String>,
    /// Products are downloaded into `<download_root>/<item id>`
    pub download_root: PathBuf,
    pub output_path: PathBuf,
    pub selection: SelectionPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let bands = [
            (BandRole::Red, "B04"),
            (BandRole::RedEdge, "B05"),
            (BandRole::Nir, "B08"),
            (BandRole::NirNarrow, "B8A"),
        ]
        .into_iter()
        .map(|(role, name)| (role, name.to_string()))
        .collect();

        Self {
            collection: "sentinel-2-l2a".to_string(),
            max_cloud_cover: 60.0,
            filters: Vec::new(),
            bands,
            download_root: PathBuf::from("data/S2/L2A"),
            output_path: PathBuf::from("data/S2/indices/veg_indices.tif"),
            selection: SelectionPolicy::MostRecent,
        }
    }
}

impl PipelineConfig {
    /// Search criteria for `aoi` over `date_range` with this configuration
    pub fn criteria(&self, aoi: AreaOfInterest, date_range: DateRange) -> VegResult<SearchCriteria> {
        let mut criteria =
            SearchCriteria::new(&self.collection, aoi, date_range, self.max_cloud_cover)?;
        for filter in &self.filters {
            criteria = criteria.with_filter(filter.clone());
        }
        Ok(criteria)
    }

    /// Asset names to download, in role order, without duplicates
    pub fn band_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for role in BandRole::ALL {
            if let Some(name) = self.bands.get(&role) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }
}

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub item: CatalogItem,
    pub fetch: FetchReport,
    pub output: VegetationIndexRaster,
}

pub struct Pipeline<'a> {
    client: &'a CatalogClient,
    fetcher: AssetFetcher<'a>,
    engine: BandAlgebraEngine,
    config: PipelineConfig,
    /// Overrides `config.selection` when set
    selector: Option<ProductSelector>,
}

impl<'a> Pipeline<'a> {
    pub fn new(client: &'a CatalogClient, fetcher: AssetFetcher<'a>, config: PipelineConfig) -> Self {
        Self {
            client,
            fetcher,
            engine: BandAlgebraEngine::new(),
            config,
            selector: None,
        }
    }

    /// Use a caller-built selector (any [`SelectionStrategy`](crate::core::selection::SelectionStrategy))
    /// instead of the configured policy
    pub fn with_selector(mut self, selector: ProductSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole acquisition for `criteria`.
    ///
    /// Nothing is retried; since fetching is idempotent a failed run can be
    /// re-invoked and only the missing band files are transferred.
    pub fn run(&self, criteria: &SearchCriteria) -> VegResult<PipelineReport> {
        let items = self.client.search(criteria)?;

        let item = match &self.selector {
            Some(selector) => selector.select(&items)?.clone(),
            None => {
                let selector = self.config.selection.clone().into_selector()?;
                selector.select(&items)?.clone()
            }
        };

        let destination = self.config.download_root.join(&item.id);
        let fetch = self
            .fetcher
            .fetch(&item, &self.config.band_names(), &destination)?;

        let bands = self.load_bands(&fetch)?;
        let output = self.engine.compose(&bands, &self.config.output_path)?;

        log::info!(
            "NDVI, NDRE, SAVI for {} written to {}",
            item.id,
            output.path.display()
        );
        Ok(PipelineReport {
            item,
            fetch,
            output,
        })
    }

    /// Read every role whose band file was fetched. Absent roles stay out of
    /// the stack and surface as `MissingBand` during composition.
    fn load_bands(&self, fetch: &FetchReport) -> VegResult<BandStack> {
        let mut stack = BandStack::new();
        for (role, name) in &self.config.bands {
            match fetch.files.get(name) {
                Some(file) => {
                    stack.insert(*role, RasterReader::read_band(&file.path, 1)?);
                }
                None => log::warn!(
                    "No {} file ({}) for {}",
                    role,
                    name,
                    fetch.item_id
                ),
            }
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_l2a_acquisition() {
        let config = PipelineConfig::default();
        assert_eq!(config.collection, "sentinel-2-l2a");
        assert_eq!(config.band_names(), vec!["B04", "B05", "B08", "B8A"]);
        assert_eq!(config.selection, SelectionPolicy::MostRecent);
    }

    #[test]
    fn test_band_names_deduplicate() {
        let mut config = PipelineConfig::default();
        config.bands.insert(BandRole::NirNarrow, "B08".to_string());
        assert_eq!(config.band_names(), vec!["B04", "B05", "B08"]);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "collection": "sentinel-2-l1c",
            "max_cloud_cover": 20.0,
            "filters": [{"property": "sentinel:tile_id", "op": "eq", "value": "31TCJ"}],
            "bands": {"red": "B04", "red-edge": "B05", "nir": "B08", "nir-narrow": "B8A"},
            "download_root": "data/S2/L1C",
            "output_path": "data/S2/indices/veg_indices.tif",
            "selection": {"rule": "identifier_token", "value": "20250623T101031"}
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bands.get(&BandRole::NirNarrow).unwrap(), "B8A");
        assert_eq!(
            config.selection,
            SelectionPolicy::IdentifierToken("20250623T101031".to_string())
        );
        assert_eq!(config.filters[0].op, crate::types::FilterOp::Eq);
    }
}
