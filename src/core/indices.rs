//! Vegetation index band algebra
//!
//! - NDVI = (NIR - R) / (NIR + R + ε)
//! - NDRE = (NIRn - RE) / (NIRn + RE + ε)
//! - SAVI = 1.5 (NIR - R) / (NIR + R + 0.5 + ε)
//!
//! ε keeps masked border pixels (all bands exactly zero) finite: they
//! evaluate to 0 instead of NaN.

use ndarray::{ArrayView2, Zip};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::io::raster::{IndexRasterWriter, RasterReader};
use crate::types::{
    BandRole, GeoReference, IndexKind, RasterBand, Sample, SampleGrid, VegError, VegResult,
    VegetationIndexRaster,
};

/// Stabilizer added to every index denominator
pub const EPSILON: Sample = 1e-6;

/// Soil brightness correction of SAVI
pub const SAVI_SOIL_FACTOR: Sample = 0.5;

/// SAVI gain, (1 + L)
pub const SAVI_GAIN: Sample = 1.5;

#[inline]
pub fn ndvi(nir: Sample, red: Sample) -> Sample {
    (nir - red) / (nir + red + EPSILON)
}

#[inline]
pub fn ndre(nir_narrow: Sample, red_edge: Sample) -> Sample {
    (nir_narrow - red_edge) / (nir_narrow + red_edge + EPSILON)
}

#[inline]
pub fn savi(nir: Sample, red: Sample) -> Sample {
    SAVI_GAIN * (nir - red) / (nir + red + SAVI_SOIL_FACTOR + EPSILON)
}

/// Input bands keyed by spectral role
#[derive(Debug, Clone, Default)]
pub struct BandStack {
    bands: HashMap<BandRole, RasterBand>,
}

impl BandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: BandRole, band: RasterBand) -> &mut Self {
        self.bands.insert(role, band);
        self
    }

    pub fn with(mut self, role: BandRole, band: RasterBand) -> Self {
        self.bands.insert(role, band);
        self
    }

    pub fn get(&self, role: BandRole) -> Option<&RasterBand> {
        self.bands.get(&role)
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Read each role from band 1 of its own file
    pub fn from_files(files: &[(BandRole, PathBuf)]) -> VegResult<Self> {
        let mut stack = Self::new();
        for (role, path) in files {
            stack.insert(*role, RasterReader::read_band(path, 1)?);
        }
        Ok(stack)
    }

    /// Read a pre-aligned 4-band stack laid out as [R, RE, NIR, NIRn]
    pub fn from_stacked_file<P: AsRef<Path>>(path: P) -> VegResult<Self> {
        let path = path.as_ref();
        let count = RasterReader::band_count(path)?;
        if count < BandRole::ALL.len() {
            return Err(VegError::InvalidInput(format!(
                "{} has {} band(s); a [red, red-edge, nir, nir-narrow] stack needs 4",
                path.display(),
                count
            )));
        }

        let mut stack = Self::new();
        for (index, role) in BandRole::ALL.iter().enumerate() {
            stack.insert(*role, RasterReader::read_band(path, index + 1)?);
        }
        Ok(stack)
    }

    fn require(&self, role: BandRole) -> VegResult<&RasterBand> {
        self.get(role).ok_or(VegError::MissingBand(role))
    }
}

/// The three index grids with their shared georeferencing
#[derive(Debug, Clone)]
pub struct IndexStack {
    pub ndvi: SampleGrid,
    pub ndre: SampleGrid,
    pub savi: SampleGrid,
    pub georef: GeoReference,
}

impl IndexStack {
    pub fn grid(&self, kind: IndexKind) -> &SampleGrid {
        match kind {
            IndexKind::Ndvi => &self.ndvi,
            IndexKind::Ndre => &self.ndre,
            IndexKind::Savi => &self.savi,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.ndvi.dim()
    }
}

/// Compute NDVI, NDRE and SAVI from plain grids of identical shape
pub fn index_grids(
    red: ArrayView2<Sample>,
    red_edge: ArrayView2<Sample>,
    nir: ArrayView2<Sample>,
    nir_narrow: ArrayView2<Sample>,
) -> VegResult<[SampleGrid; 3]> {
    let shape = red.dim();
    for (role, view) in [
        (BandRole::RedEdge, &red_edge.view()),
        (BandRole::Nir, &nir.view()),
        (BandRole::NirNarrow, &nir_narrow.view()),
    ] {
        if view.dim() != shape {
            return Err(VegError::GeometryMismatch(format!(
                "{} band is {:?}, red band is {:?}",
                role,
                view.dim(),
                shape
            )));
        }
    }

    let mut ndvi_grid = SampleGrid::zeros(shape);
    let mut ndre_grid = SampleGrid::zeros(shape);
    let mut savi_grid = SampleGrid::zeros(shape);

    let zip = Zip::from(&mut ndvi_grid)
        .and(&mut savi_grid)
        .and(&nir)
        .and(&red);
    #[cfg(feature = "parallel")]
    zip.par_for_each(|ndvi_px, savi_px, &n, &r| {
        *ndvi_px = ndvi(n, r);
        *savi_px = savi(n, r);
    });
    #[cfg(not(feature = "parallel"))]
    zip.for_each(|ndvi_px, savi_px, &n, &r| {
        *ndvi_px = ndvi(n, r);
        *savi_px = savi(n, r);
    });

    let zip = Zip::from(&mut ndre_grid).and(&nir_narrow).and(&red_edge);
    #[cfg(feature = "parallel")]
    zip.par_for_each(|px, &n, &re| *px = ndre(n, re));
    #[cfg(not(feature = "parallel"))]
    zip.for_each(|px, &n, &re| *px = ndre(n, re));

    Ok([ndvi_grid, ndre_grid, savi_grid])
}

/// Composes co-registered reflectance bands into the index raster
#[derive(Debug, Clone, Copy, Default)]
pub struct BandAlgebraEngine;

impl BandAlgebraEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute the index grids in memory.
    ///
    /// All four roles must be present ([`VegError::MissingBand`] names the
    /// first absent one) and share shape and georeferencing exactly
    /// ([`VegError::GeometryMismatch`]); nothing is resampled or cropped.
    pub fn compute(&self, bands: &BandStack) -> VegResult<IndexStack> {
        let red = bands.require(BandRole::Red)?;
        let red_edge = bands.require(BandRole::RedEdge)?;
        let nir = bands.require(BandRole::Nir)?;
        let nir_narrow = bands.require(BandRole::NirNarrow)?;

        for (role, band) in [
            (BandRole::RedEdge, red_edge),
            (BandRole::Nir, nir),
            (BandRole::NirNarrow, nir_narrow),
        ] {
            check_alignment(BandRole::Red, red, role, band)?;
        }

        let (rows, cols) = red.shape();
        log::debug!("Computing NDVI/NDRE/SAVI over {}x{} pixels", cols, rows);

        let [ndvi, ndre, savi] = index_grids(
            red.data.view(),
            red_edge.data.view(),
            nir.data.view(),
            nir_narrow.data.view(),
        )?;

        Ok(IndexStack {
            ndvi,
            ndre,
            savi,
            georef: red.georef.clone(),
        })
    }

    /// Compute a single index from the two roles it reads.
    ///
    /// Unlike [`compute`](Self::compute), bands the index does not use may be
    /// absent: NDVI and SAVI need red and NIR, NDRE needs red-edge and
    /// narrow NIR.
    pub fn compute_index(&self, kind: IndexKind, bands: &BandStack) -> VegResult<SampleGrid> {
        let (reference_role, role) = kind.roles();
        let reference = bands.require(reference_role)?;
        let band = bands.require(role)?;
        check_alignment(reference_role, reference, role, band)?;

        let formula: fn(Sample, Sample) -> Sample = match kind {
            IndexKind::Ndvi => ndvi,
            IndexKind::Ndre => ndre,
            IndexKind::Savi => savi,
        };

        let mut grid = SampleGrid::zeros(reference.shape());
        let zip = Zip::from(&mut grid).and(&band.data).and(&reference.data);
        #[cfg(feature = "parallel")]
        zip.par_for_each(|px, &high, &low| *px = formula(high, low));
        #[cfg(not(feature = "parallel"))]
        zip.for_each(|px, &high, &low| *px = formula(high, low));

        Ok(grid)
    }

    /// Compute the indices and write them as a 3-band float32 GeoTIFF
    /// (band 1 NDVI, 2 NDRE, 3 SAVI), overwriting `output_path`.
    pub fn compose<P: AsRef<Path>>(
        &self,
        bands: &BandStack,
        output_path: P,
    ) -> VegResult<VegetationIndexRaster> {
        let output_path = output_path.as_ref();
        let indices = self.compute(bands)?;
        write_indices(&indices, output_path)
    }
}

/// Persist an [`IndexStack`] in the fixed band order
pub fn write_indices(indices: &IndexStack, output_path: &Path) -> VegResult<VegetationIndexRaster> {
    IndexRasterWriter::write(
        output_path,
        &indices.georef,
        IndexKind::ALL.map(|kind| (kind, indices.grid(kind))),
    )?;

    let (height, width) = indices.shape();
    Ok(VegetationIndexRaster {
        path: output_path.to_path_buf(),
        width,
        height,
        georef: indices.georef.clone(),
        bands: IndexKind::ALL,
    })
}

fn check_alignment(
    reference_role: BandRole,
    reference: &RasterBand,
    role: BandRole,
    band: &RasterBand,
) -> VegResult<()> {
    if band.shape() != reference.shape() {
        return Err(VegError::GeometryMismatch(format!(
            "{} band is {:?} pixels, {} band is {:?}",
            role,
            band.shape(),
            reference_role,
            reference.shape()
        )));
    }
    if band.georef.transform != reference.georef.transform {
        return Err(VegError::GeometryMismatch(format!(
            "{} band transform {:?} differs from {} band transform {:?}",
            role,
            band.georef.transform.to_gdal(),
            reference_role,
            reference.georef.transform.to_gdal()
        )));
    }
    if band.georef.crs_wkt != reference.georef.crs_wkt {
        return Err(VegError::GeometryMismatch(format!(
            "{} band CRS differs from {} band CRS",
            role, reference_role
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn georef() -> GeoReference {
        GeoReference {
            transform: GeoTransform::from_gdal([300000.0, 10.0, 0.0, 4800000.0, 0.0, -10.0]),
            crs_wkt: String::new(),
        }
    }

    fn band(data: SampleGrid) -> RasterBand {
        RasterBand::new(data, georef())
    }

    #[test]
    fn test_degenerate_pixel_stays_finite() {
        assert_eq!(ndvi(0.0, 0.0), 0.0);
        assert_eq!(ndre(0.0, 0.0), 0.0);
        assert_eq!(savi(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_reference_values() {
        assert_abs_diff_eq!(ndvi(0.5, 0.1), 0.6667, epsilon = 1e-4);
        assert_abs_diff_eq!(savi(0.5, 0.1), 1.5 * 0.4 / 1.1, epsilon = 1e-5);
        assert_abs_diff_eq!(ndre(0.4, 0.2), 0.2 / 0.6, epsilon = 1e-5);
    }

    #[test]
    fn test_compute_full_stack() {
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1, 0.0], [0.2, 0.05]]))
            .with(BandRole::RedEdge, band(array![[0.2, 0.0], [0.2, 0.1]]))
            .with(BandRole::Nir, band(array![[0.5, 0.0], [0.2, 0.45]]))
            .with(BandRole::NirNarrow, band(array![[0.4, 0.0], [0.3, 0.4]]));

        let indices = BandAlgebraEngine::new().compute(&stack).unwrap();
        assert_eq!(indices.shape(), (2, 2));
        assert_abs_diff_eq!(indices.ndvi[[0, 0]], 0.6667, epsilon = 1e-4);
        assert_eq!(indices.ndvi[[0, 1]], 0.0);
        assert_eq!(indices.ndvi[[1, 0]], 0.0);
        assert_abs_diff_eq!(indices.ndre[[0, 0]], 0.2 / 0.6, epsilon = 1e-5);
        assert_eq!(indices.savi[[0, 1]], 0.0);
        assert_eq!(indices.georef, georef());
    }

    #[test]
    fn test_missing_red_edge_is_reported() {
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1]]))
            .with(BandRole::Nir, band(array![[0.5]]));

        let err = BandAlgebraEngine::new().compute(&stack).unwrap_err();
        assert!(matches!(err, VegError::MissingBand(BandRole::RedEdge)));
    }

    #[test]
    fn test_single_indices_from_red_and_nir_only() {
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1]]))
            .with(BandRole::Nir, band(array![[0.5]]));
        let engine = BandAlgebraEngine::new();

        let ndvi_grid = engine.compute_index(IndexKind::Ndvi, &stack).unwrap();
        let savi_grid = engine.compute_index(IndexKind::Savi, &stack).unwrap();
        assert_eq!(ndvi_grid.dim(), (1, 1));
        assert_abs_diff_eq!(ndvi_grid[[0, 0]], 0.6667, epsilon = 1e-4);
        assert_abs_diff_eq!(savi_grid[[0, 0]], 1.5 * 0.4 / 1.1, epsilon = 1e-5);

        let err = engine.compute_index(IndexKind::Ndre, &stack).unwrap_err();
        assert!(matches!(err, VegError::MissingBand(BandRole::RedEdge)));
    }

    #[test]
    fn test_single_index_matches_full_stack() {
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1, 0.0], [0.2, 0.05]]))
            .with(BandRole::RedEdge, band(array![[0.2, 0.0], [0.2, 0.1]]))
            .with(BandRole::Nir, band(array![[0.5, 0.0], [0.2, 0.45]]))
            .with(BandRole::NirNarrow, band(array![[0.4, 0.0], [0.3, 0.4]]));
        let engine = BandAlgebraEngine::new();
        let full = engine.compute(&stack).unwrap();

        for kind in IndexKind::ALL {
            assert_eq!(&engine.compute_index(kind, &stack).unwrap(), full.grid(kind));
        }
    }

    #[test]
    fn test_single_index_checks_only_its_roles() {
        let coarse = RasterBand::new(
            array![[0.2]],
            GeoReference {
                transform: GeoTransform::from_gdal([300000.0, 20.0, 0.0, 4800000.0, 0.0, -20.0]),
                crs_wkt: String::new(),
            },
        );
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1]]))
            .with(BandRole::Nir, band(array![[0.5]]))
            .with(BandRole::RedEdge, coarse)
            .with(BandRole::NirNarrow, band(array![[0.4]]));
        let engine = BandAlgebraEngine::new();

        assert!(engine.compute_index(IndexKind::Ndvi, &stack).is_ok());
        let err = engine.compute_index(IndexKind::Ndre, &stack).unwrap_err();
        assert!(matches!(err, VegError::GeometryMismatch(_)));
    }

    #[test]
    fn test_shape_and_transform_mismatch() {
        let shifted = RasterBand::new(
            array![[0.4]],
            GeoReference {
                transform: GeoTransform::from_gdal([300010.0, 10.0, 0.0, 4800000.0, 0.0, -10.0]),
                crs_wkt: String::new(),
            },
        );
        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1]]))
            .with(BandRole::RedEdge, band(array![[0.2]]))
            .with(BandRole::Nir, band(array![[0.5]]))
            .with(BandRole::NirNarrow, shifted);
        let err = BandAlgebraEngine::new().compute(&stack).unwrap_err();
        assert!(matches!(err, VegError::GeometryMismatch(_)));

        let stack = BandStack::new()
            .with(BandRole::Red, band(array![[0.1, 0.1]]))
            .with(BandRole::RedEdge, band(array![[0.2]]))
            .with(BandRole::Nir, band(array![[0.5, 0.5]]))
            .with(BandRole::NirNarrow, band(array![[0.4, 0.4]]));
        let err = BandAlgebraEngine::new().compute(&stack).unwrap_err();
        assert!(matches!(err, VegError::GeometryMismatch(_)));
    }

    #[test]
    fn test_compute_is_reproducible() {
        let grid = SampleGrid::from_shape_fn((64, 48), |(r, c)| ((r * 48 + c) % 97) as Sample / 97.0);
        let stack = BandStack::new()
            .with(BandRole::Red, band(grid.mapv(|v| v * 0.3)))
            .with(BandRole::RedEdge, band(grid.mapv(|v| v * 0.5)))
            .with(BandRole::Nir, band(grid.clone()))
            .with(BandRole::NirNarrow, band(grid.mapv(|v| v * 0.9)));

        let engine = BandAlgebraEngine::new();
        let first = engine.compute(&stack).unwrap();
        let second = engine.compute(&stack).unwrap();
        for kind in IndexKind::ALL {
            let a: Vec<u32> = first.grid(kind).iter().map(|v| v.to_bits()).collect();
            let b: Vec<u32> = second.grid(kind).iter().map(|v| v.to_bits()).collect();
            assert_eq!(a, b);
        }
    }
}
