//! I/O modules for catalog search, asset transfer and raster files

pub mod catalog;
pub mod stac;
pub mod fetch;
pub mod raster;

pub use catalog::{AssetSigner, CatalogBackend, CatalogClient, UnsignedAssets};
pub use stac::{StacApi, StacApiOptions, StacEndpoint};
pub use fetch::{
    AssetFetcher, AssetSource, AssetStream, FetchOptions, FetchReport, HttpAssetSource,
    LogProgress, ProgressObserver, SilentProgress, TransferProgress,
};
#[cfg(feature = "progress")]
pub use fetch::ProgressBarObserver;
pub use raster::{IndexRasterWriter, RasterReader};
