use approx::assert_abs_diff_eq;
use gdal::raster::Buffer;
use gdal::DriverManager;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;

use verdure::core::{Pipeline, PipelineConfig, ProductSelector, SelectionStrategy};
use verdure::io::{AssetFetcher, AssetSource, AssetStream, CatalogBackend, CatalogClient};
use verdure::io::RasterReader;
use verdure::{
    AreaOfInterest, AssetReference, CatalogItem, DateRange, SearchCriteria, VegError, VegResult,
};

const AOI: &str = r#"{"type": "Polygon", "coordinates": [[[0.9, 43.5], [1.2, 43.5], [1.2, 43.7], [0.9, 43.7], [0.9, 43.5]]]}"#;
const NEWER: &str = "S2B_MSIL2A_20250623T104619_R051_T31TCJ_20250623T134512";
const OLDER: &str = "S2A_MSIL2A_20250620T105031_R051_T31TCJ_20250620T140051";

struct StaticCatalog(Vec<CatalogItem>);

impl CatalogBackend for StaticCatalog {
    fn search_items(&self, _criteria: &SearchCriteria) -> VegResult<Vec<CatalogItem>> {
        Ok(self.0.clone())
    }

    fn sign(&self, href: &str) -> VegResult<String> {
        Ok(format!("{}?sig=test", href))
    }

    fn name(&self) -> String {
        "static".to_string()
    }
}

struct MemorySource(HashMap<String, Vec<u8>>);

impl AssetSource for MemorySource {
    fn open(&self, url: &str) -> std::io::Result<AssetStream> {
        let unsigned = url.trim_end_matches("?sig=test");
        let body = self
            .0
            .get(unsigned)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, unsigned.to_string()))?;
        Ok(AssetStream {
            content_length: Some(body.len() as u64),
            reader: Box::new(Cursor::new(body)),
        })
    }
}

/// Earliest acquisition wins
struct EarliestFirst;

impl SelectionStrategy for EarliestFirst {
    fn compare(&self, a: &CatalogItem, b: &CatalogItem) -> std::cmp::Ordering {
        b.datetime.cmp(&a.datetime)
    }

    fn describe(&self) -> String {
        "earliest acquisition".to_string()
    }
}

fn tiff_bytes(scratch: &Path, name: &str, value: f32) -> Vec<u8> {
    tiff_bytes_at(scratch, name, value, 10.0)
}

fn tiff_bytes_at(scratch: &Path, name: &str, value: f32, pixel_size: f64) -> Vec<u8> {
    let path = scratch.join(name);
    {
        let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
        let mut dataset = driver
            .create_with_band_type::<f32, _>(&path, 3, 2, 1)
            .unwrap();
        dataset
            .set_geo_transform(&[399960.0, pixel_size, 0.0, 4900020.0, 0.0, -pixel_size])
            .unwrap();
        let mut band = dataset.rasterband(1).unwrap();
        band.write((0, 0), (3, 2), &Buffer::new((3, 2), vec![value; 6]))
            .unwrap();
    }
    std::fs::read(&path).unwrap()
}

fn href(id: &str, band: &str) -> String {
    format!("https://example.com/{}/{}.tif", id, band)
}

fn item(id: &str, datetime: &str, bands: &[&str]) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        datetime: datetime.parse().unwrap(),
        cloud_cover: 5.0,
        assets: bands
            .iter()
            .map(|band| {
                (
                    band.to_string(),
                    AssetReference {
                        band: band.to_string(),
                        href: href(id, band),
                        content_length: None,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        download_root: root.join("L2A"),
        output_path: root.join("indices").join("veg_indices.tif"),
        ..PipelineConfig::default()
    }
}

fn criteria(config: &PipelineConfig) -> SearchCriteria {
    config
        .criteria(
            AreaOfInterest::from_geojson_str(AOI).unwrap(),
            DateRange::parse("2025-06-01", "2025-06-30").unwrap(),
        )
        .unwrap()
}

#[test]
fn test_pipeline_selects_fetches_and_composes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let bands = ["B04", "B05", "B08", "B8A"];
    let reflectance = [0.1f32, 0.2, 0.5, 0.4];

    let mut bodies = HashMap::new();
    for (band, value) in bands.iter().zip(reflectance) {
        bodies.insert(href(NEWER, band), tiff_bytes(scratch.path(), band, value));
    }

    let client = CatalogClient::new(Box::new(StaticCatalog(vec![
        item(OLDER, "2025-06-20T10:50:31Z", &bands),
        item(NEWER, "2025-06-23T10:46:19Z", &bands),
    ])));
    let config = config(dir.path());
    let criteria = criteria(&config);
    let fetcher = AssetFetcher::new(&client, Box::new(MemorySource(bodies)));
    let pipeline = Pipeline::new(&client, fetcher, config);

    let report = pipeline.run(&criteria).expect("pipeline run");
    assert_eq!(report.item.id, NEWER);
    assert_eq!(report.fetch.files.len(), 4);
    assert!(dir.path().join("L2A").join(NEWER).join("B8A.tif").exists());
    assert_eq!((report.output.width, report.output.height), (3, 2));

    let ndvi = RasterReader::read_band(&report.output.path, 1).unwrap();
    assert_abs_diff_eq!(ndvi.data[[1, 2]], 0.6667, epsilon = 1e-4);

    // Re-run against the populated cache
    let again = pipeline.run(&criteria).expect("cached run");
    assert_eq!(again.fetch, report.fetch);
}

#[test]
fn test_pipeline_reports_missing_red_edge() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let bands = ["B04", "B08", "B8A"];

    let mut bodies = HashMap::new();
    for band in bands {
        bodies.insert(href(NEWER, band), tiff_bytes(scratch.path(), band, 0.3));
    }

    let client = CatalogClient::new(Box::new(StaticCatalog(vec![item(
        NEWER,
        "2025-06-23T10:46:19Z",
        &bands,
    )])));
    let config = config(dir.path());
    let criteria = criteria(&config);
    let output_path = config.output_path.clone();
    let fetcher = AssetFetcher::new(&client, Box::new(MemorySource(bodies)));

    let err = Pipeline::new(&client, fetcher, config)
        .run(&criteria)
        .unwrap_err();
    assert!(matches!(err, VegError::MissingBand(verdure::BandRole::RedEdge)));
    assert!(!output_path.exists());
}

#[test]
fn test_pipeline_uses_caller_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let bands = ["B04", "B05", "B08", "B8A"];

    let mut bodies = HashMap::new();
    for band in bands {
        bodies.insert(href(OLDER, band), tiff_bytes(scratch.path(), band, 0.25));
    }

    let client = CatalogClient::new(Box::new(StaticCatalog(vec![
        item(OLDER, "2025-06-20T10:50:31Z", &bands),
        item(NEWER, "2025-06-23T10:46:19Z", &bands),
    ])));
    let config = config(dir.path());
    let criteria = criteria(&config);
    let fetcher = AssetFetcher::new(&client, Box::new(MemorySource(bodies)));

    let report = Pipeline::new(&client, fetcher, config)
        .with_selector(ProductSelector::new(Box::new(EarliestFirst)))
        .run(&criteria)
        .expect("run with custom selector");
    assert_eq!(report.item.id, OLDER);
    assert!(!dir.path().join("L2A").join(NEWER).exists());
}

#[test]
fn test_default_bands_at_native_resolution_do_not_align() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let bands = ["B04", "B05", "B08", "B8A"];

    let mut bodies = HashMap::new();
    for band in bands {
        let pixel_size = if band == "B05" || band == "B8A" { 20.0 } else { 10.0 };
        bodies.insert(
            href(NEWER, band),
            tiff_bytes_at(scratch.path(), band, 0.3, pixel_size),
        );
    }

    let client = CatalogClient::new(Box::new(StaticCatalog(vec![item(
        NEWER,
        "2025-06-23T10:46:19Z",
        &bands,
    )])));
    let config = config(dir.path());
    let criteria = criteria(&config);
    let fetcher = AssetFetcher::new(&client, Box::new(MemorySource(bodies)));

    let err = Pipeline::new(&client, fetcher, config)
        .run(&criteria)
        .unwrap_err();
    assert!(matches!(err, VegError::GeometryMismatch(_)), "got {}", err);
}
