use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Single-precision reflectance / index sample
pub type Sample = f32;

/// 2D raster grid (rows x cols)
pub type SampleGrid = Array2<Sample>;

/// Area of interest used verbatim as the spatial filter of a catalog search.
///
/// Holds a Polygon or MultiPolygon in geographic coordinates (lon, lat).
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    geometry: geojson::Geometry,
}

impl AreaOfInterest {
    /// Wrap an already-parsed geometry after validating it.
    pub fn new(geometry: geojson::Geometry) -> VegResult<Self> {
        match &geometry.value {
            geojson::Value::Polygon(rings) => validate_polygon(rings)?,
            geojson::Value::MultiPolygon(polygons) => {
                if polygons.is_empty() {
                    return Err(VegError::InvalidInput("AOI multipolygon is empty".to_string()));
                }
                for rings in polygons {
                    validate_polygon(rings)?;
                }
            }
            _ => {
                return Err(VegError::InvalidInput(
                    "AOI must be a Polygon or MultiPolygon".to_string(),
                ))
            }
        }
        Ok(Self { geometry })
    }

    /// Parse a GeoJSON document into an AOI.
    ///
    /// Accepts a bare Geometry, a Feature, or a FeatureCollection (the first
    /// feature's geometry is used).
    pub fn from_geojson_str(text: &str) -> VegResult<Self> {
        let parsed: geojson::GeoJson = text
            .parse()
            .map_err(|e| VegError::InvalidInput(format!("AOI is not valid GeoJSON: {}", e)))?;

        let geometry = match parsed {
            geojson::GeoJson::Geometry(geometry) => Some(geometry),
            geojson::GeoJson::Feature(feature) => feature.geometry,
            geojson::GeoJson::FeatureCollection(collection) => collection
                .features
                .into_iter()
                .next()
                .and_then(|feature| feature.geometry),
        };

        let geometry = geometry
            .ok_or_else(|| VegError::InvalidInput("AOI GeoJSON carries no geometry".to_string()))?;
        Self::new(geometry)
    }

    pub fn geometry(&self) -> &geojson::Geometry {
        &self.geometry
    }

    /// Geometry as a JSON value, ready to embed in a search request
    pub fn to_json(&self) -> VegResult<serde_json::Value> {
        serde_json::to_value(&self.geometry)
            .map_err(|e| VegError::InvalidInput(format!("AOI geometry cannot be serialized: {}", e)))
    }
}

fn validate_polygon(rings: &[Vec<Vec<f64>>]) -> VegResult<()> {
    if rings.is_empty() {
        return Err(VegError::InvalidInput("AOI polygon has no rings".to_string()));
    }
    for ring in rings {
        if ring.len() < 4 {
            return Err(VegError::InvalidInput(format!(
                "AOI ring has {} positions, at least 4 are required",
                ring.len()
            )));
        }
        if ring.first() != ring.last() {
            return Err(VegError::InvalidInput("AOI ring is not closed".to_string()));
        }
        for position in ring {
            let (lon, lat) = match position.as_slice() {
                [lon, lat, ..] => (*lon, *lat),
                _ => {
                    return Err(VegError::InvalidInput(
                        "AOI position needs at least two coordinates".to_string(),
                    ))
                }
            };
            if !lon.is_finite() || !lat.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
                return Err(VegError::InvalidInput(format!(
                    "AOI position ({}, {}) is outside geographic bounds",
                    lon, lat
                )));
            }
        }
    }
    Ok(())
}

/// Inclusive calendar date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> VegResult<Self> {
        if start > end {
            return Err(VegError::InvalidInput(format!(
                "date range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds
    pub fn parse(start: &str, end: &str) -> VegResult<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| VegError::InvalidInput(format!("invalid date '{}': {}", s, e)))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let day = instant.date_naive();
        day >= self.start && day <= self.end
    }

    /// STAC `datetime` interval, e.g. `2025-06-01T00:00:00Z/2025-06-30T23:59:59Z`
    pub fn to_stac_interval(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Comparison operators of the STAC query extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
        }
    }
}

/// Catalog-specific property filter (e.g. `sentinel:tile_id eq 31TCJ`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub property: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl PropertyFilter {
    pub fn new(property: &str, op: FilterOp, value: impl Into<serde_json::Value>) -> Self {
        Self {
            property: property.to_string(),
            op,
            value: value.into(),
        }
    }
}

/// Immutable description of what to search for
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCriteria {
    pub collection: String,
    pub aoi: AreaOfInterest,
    pub date_range: DateRange,
    /// Items must have a cloud cover strictly below this percentage
    pub max_cloud_cover: f64,
    pub filters: Vec<PropertyFilter>,
}

impl SearchCriteria {
    pub fn new(
        collection: &str,
        aoi: AreaOfInterest,
        date_range: DateRange,
        max_cloud_cover: f64,
    ) -> VegResult<Self> {
        let criteria = Self {
            collection: collection.to_string(),
            aoi,
            date_range,
            max_cloud_cover,
            filters: Vec::new(),
        };
        criteria.validate()?;
        Ok(criteria)
    }

    pub fn with_filter(mut self, filter: PropertyFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Re-check invariants; criteria can be built field-by-field.
    pub fn validate(&self) -> VegResult<()> {
        if self.collection.trim().is_empty() {
            return Err(VegError::InvalidInput("collection identifier is empty".to_string()));
        }
        if !(0.0..=100.0).contains(&self.max_cloud_cover) {
            return Err(VegError::InvalidInput(format!(
                "cloud cover bound {} is outside [0, 100]",
                self.max_cloud_cover
            )));
        }
        if self.date_range.start > self.date_range.end {
            return Err(VegError::InvalidInput(format!(
                "date range {} is inverted",
                self.date_range
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "collection={} dates={} cloud<{}%",
            self.collection, self.date_range, self.max_cloud_cover
        )?;
        for filter in &self.filters {
            write!(f, " {} {} {}", filter.property, filter.op.as_str(), filter.value)?;
        }
        Ok(())
    }
}

/// Downloadable asset of one band of a catalog item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetReference {
    pub band: String,
    /// Unsigned remote location
    pub href: String,
    pub content_length: Option<u64>,
}

impl AssetReference {
    /// Local file name: last segment of the href's path (query string dropped)
    pub fn file_name(&self) -> VegResult<String> {
        let path = match url::Url::parse(&self.href) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => self.href.split(['?', '#']).next().unwrap_or_default().to_string(),
        };

        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
            .ok_or_else(|| {
                VegError::InvalidInput(format!(
                    "cannot derive a file name for band {} from '{}'",
                    self.band, self.href
                ))
            })
    }
}

/// Candidate product returned by a catalog search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub datetime: DateTime<Utc>,
    pub cloud_cover: f64,
    /// Band name -> asset. Bands a product does not carry are absent.
    pub assets: BTreeMap<String, AssetReference>,
}

impl CatalogItem {
    pub fn asset(&self, band: &str) -> Option<&AssetReference> {
        self.assets.get(band)
    }
}

/// Band file present in the local download cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBandFile {
    pub band: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Affine transform plus coordinate reference system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    pub transform: GeoTransform,
    /// CRS as WKT (empty when the source carries none)
    pub crs_wkt: String,
}

/// One georeferenced single-band grid
#[derive(Debug, Clone)]
pub struct RasterBand {
    pub data: SampleGrid,
    pub georef: GeoReference,
    pub nodata: Option<f64>,
}

impl RasterBand {
    pub fn new(data: SampleGrid, georef: GeoReference) -> Self {
        Self {
            data,
            georef,
            nodata: None,
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// Spectral role a band plays in the index formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BandRole {
    Red,
    RedEdge,
    Nir,
    NirNarrow,
}

impl BandRole {
    pub const ALL: [BandRole; 4] = [
        BandRole::Red,
        BandRole::RedEdge,
        BandRole::Nir,
        BandRole::NirNarrow,
    ];
}

impl fmt::Display for BandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandRole::Red => write!(f, "red"),
            BandRole::RedEdge => write!(f, "red-edge"),
            BandRole::Nir => write!(f, "nir"),
            BandRole::NirNarrow => write!(f, "nir-narrow"),
        }
    }
}

/// Vegetation indices in output band order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Ndvi,
    Ndre,
    Savi,
}

impl IndexKind {
    pub const ALL: [IndexKind; 3] = [IndexKind::Ndvi, IndexKind::Ndre, IndexKind::Savi];

    /// 1-based band index in the output raster
    pub fn band_index(&self) -> usize {
        match self {
            IndexKind::Ndvi => 1,
            IndexKind::Ndre => 2,
            IndexKind::Savi => 3,
        }
    }

    /// Roles the index reads, as (reference, near-infrared), e.g. (red, nir)
    /// for NDVI
    pub fn roles(&self) -> (BandRole, BandRole) {
        match self {
            IndexKind::Ndvi | IndexKind::Savi => (BandRole::Red, BandRole::Nir),
            IndexKind::Ndre => (BandRole::RedEdge, BandRole::NirNarrow),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Ndvi => "NDVI",
            IndexKind::Ndre => "NDRE",
            IndexKind::Savi => "SAVI",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of a written 3-band index raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationIndexRaster {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub georef: GeoReference,
    pub bands: [IndexKind; 3],
}

/// Error types for acquisition and index composition
#[derive(Debug, thiserror::Error)]
pub enum VegError {
    #[error("no catalog items match {criteria}")]
    NoResults { criteria: String },

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("selection failed: {0}")]
    Selection(String),

    #[error("transfer of band {band} from {url} failed: {reason}")]
    Transfer {
        band: String,
        url: String,
        reason: String,
    },

    #[error("band {band} is not available for product {item}")]
    BandUnavailable { item: String, band: String },

    #[error("required {0} band is missing")]
    MissingBand(BandRole),

    #[error("band geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for pipeline operations
pub type VegResult<T> = Result<T, VegError>;
