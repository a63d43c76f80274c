//! Verdure: Sentinel-2 acquisition and vegetation index composition
//!
//! Searches a STAC catalog for products over an area of interest, picks one
//! deterministically, downloads the red / red-edge / near-infrared bands into
//! a resumable local cache, and writes NDVI, NDRE and SAVI as a single
//! co-registered float32 GeoTIFF.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    AreaOfInterest, AssetReference, BandRole, CatalogItem, DateRange, FilterOp, GeoReference,
    GeoTransform, IndexKind, LocalBandFile, PropertyFilter, RasterBand, SearchCriteria, VegError,
    VegResult, VegetationIndexRaster,
};

pub use io::{AssetFetcher, CatalogClient, StacApi};
pub use core::{BandAlgebraEngine, BandStack, Pipeline, PipelineConfig, ProductSelector};
