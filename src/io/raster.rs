use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::Path;

use crate::types::{
    GeoReference, GeoTransform, IndexKind, RasterBand, SampleGrid, VegError, VegResult,
};

/// Creation options of the index GeoTIFF: DEFLATE with the floating-point
/// predictor is lossless for float32 samples.
const INDEX_CREATION_OPTIONS: [RasterCreationOption<'static>; 3] = [
    RasterCreationOption {
        key: "COMPRESS",
        value: "DEFLATE",
    },
    RasterCreationOption {
        key: "PREDICTOR",
        value: "3",
    },
    RasterCreationOption {
        key: "TILED",
        value: "YES",
    },
];

/// Reads single bands out of GDAL-readable rasters (GeoTIFF, JPEG2000, ...)
pub struct RasterReader;

impl RasterReader {
    /// Number of bands in a raster file
    pub fn band_count<P: AsRef<Path>>(path: P) -> VegResult<usize> {
        let dataset = Dataset::open(path.as_ref())?;
        Ok(dataset.raster_count().max(0) as usize)
    }

    /// Read band `band_index` (1-based) as float32 with its georeferencing
    pub fn read_band<P: AsRef<Path>>(path: P, band_index: usize) -> VegResult<RasterBand> {
        let path = path.as_ref();
        log::debug!("Reading band {} of {}", band_index, path.display());

        let dataset = Dataset::open(path)?;
        let count = dataset.raster_count().max(0) as usize;
        if band_index == 0 || band_index > count {
            return Err(VegError::InvalidInput(format!(
                "{} has {} band(s), band {} requested",
                path.display(),
                count,
                band_index
            )));
        }

        let (width, height) = dataset.raster_size();
        let transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let crs_wkt = dataset.projection();

        let rasterband = dataset.rasterband(band_index as isize)?;
        let buffer = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let data = Array2::from_shape_vec((height, width), buffer.data).map_err(|e| {
            VegError::InvalidInput(format!("{}: unexpected buffer shape: {}", path.display(), e))
        })?;

        Ok(RasterBand {
            data,
            georef: GeoReference { transform, crs_wkt },
            nodata: rasterband.no_data_value(),
        })
    }
}

/// Writes the 3-band float32 index raster
pub struct IndexRasterWriter;

impl IndexRasterWriter {
    /// Write `bands` (in output order) to a DEFLATE-compressed GeoTIFF,
    /// replacing any existing file at `path`.
    pub fn write<P: AsRef<Path>>(
        path: P,
        georef: &GeoReference,
        bands: [(IndexKind, &SampleGrid); 3],
    ) -> VegResult<()> {
        let path = path.as_ref();
        let (height, width) = bands[0].1.dim();

        for (kind, grid) in &bands {
            if grid.dim() != (height, width) {
                return Err(VegError::GeometryMismatch(format!(
                    "{} grid is {:?}, expected {:?}",
                    kind,
                    grid.dim(),
                    (height, width)
                )));
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
            path,
            width as isize,
            height as isize,
            bands.len() as isize,
            &INDEX_CREATION_OPTIONS,
        )?;

        dataset.set_geo_transform(&georef.transform.to_gdal())?;
        if !georef.crs_wkt.is_empty() {
            dataset.set_projection(&georef.crs_wkt)?;
        }

        for (kind, grid) in bands {
            let mut rasterband = dataset.rasterband(kind.band_index() as isize)?;
            let buffer = Buffer::new((width, height), grid.iter().copied().collect());
            rasterband.write((0, 0), (width, height), &buffer)?;
            rasterband.set_no_data_value(Some(f64::NAN))?;
            rasterband.set_metadata_item("NAME", kind.name(), "")?;
        }

        log::info!("Index raster written to {}", path.display());
        Ok(())
    }
}
