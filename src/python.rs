//! Python bindings (`python` feature)

use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;

use crate::core::indices::index_grids;

/// Compute (ndvi, ndre, savi) from four equally shaped float32 arrays
#[pyfunction]
fn compute_indices<'py>(
    py: Python<'py>,
    red: PyReadonlyArray2<f32>,
    red_edge: PyReadonlyArray2<f32>,
    nir: PyReadonlyArray2<f32>,
    nir_narrow: PyReadonlyArray2<f32>,
) -> PyResult<(&'py PyArray2<f32>, &'py PyArray2<f32>, &'py PyArray2<f32>)> {
    let [ndvi, ndre, savi] = index_grids(
        red.as_array(),
        red_edge.as_array(),
        nir.as_array(),
        nir_narrow.as_array(),
    )
    .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e)))?;

    Ok((ndvi.into_pyarray(py), ndre.into_pyarray(py), savi.into_pyarray(py)))
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_indices, m)?)?;
    m.add("EPSILON", crate::core::indices::EPSILON)?;
    Ok(())
}
