use ndarray::ArrayD;
use numpy::{IntoPyArray, PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustflow_core::bijections::{AffineTransformer, SplineTransformer};
use rustflow_core::distributions::{Distribution, StandardNormal};
use rustflow_core::errors::FlowError;
use rustflow_core::flows::{
    self, BlockNeuralAutoregressiveFlowConfig, CouplingFlowConfig, LayerPermutation,
    MaskedAutoregressiveFlowConfig, PlanarFlowConfig, TriangularSplineFlowConfig,
};

fn to_py_err(e: FlowError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn owned_condition(condition: Option<PyReadonlyArrayDyn<'_, f64>>) -> Option<ArrayD<f64>> {
    condition.map(|c| c.as_array().to_owned())
}

/// A fitted-architecture flow over a standard normal base. All sampling
/// takes an explicit seed, so results are reproducible.
#[pyclass]
struct Flow {
    inner: flows::Flow<StandardNormal>,
    architecture: String,
    permutation: &'static str,
}

#[pymethods]
impl Flow {
    #[getter]
    fn shape(&self) -> Vec<usize> {
        self.inner.shape().to_vec()
    }

    #[getter]
    fn cond_shape(&self) -> Option<Vec<usize>> {
        self.inner.cond_shape().map(|cs| cs.to_vec())
    }

    #[getter]
    fn architecture(&self) -> &str {
        &self.architecture
    }

    /// Inter-layer permutation strategy: "none", "flip", or "random".
    #[getter]
    fn permutation(&self) -> &str {
        self.permutation
    }

    #[pyo3(signature = (seed, sample_shape=vec![], condition=None))]
    fn sample<'py>(
        &self,
        py: Python<'py>,
        seed: u64,
        sample_shape: Vec<usize>,
        condition: Option<PyReadonlyArrayDyn<'py, f64>>,
    ) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
        let condition = owned_condition(condition);
        let samples = py
            .allow_threads(|| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                self.inner.sample(&mut rng, condition.as_ref(), &sample_shape)
            })
            .map_err(to_py_err)?;
        Ok(samples.into_pyarray(py))
    }

    #[pyo3(signature = (x, condition=None))]
    fn log_prob<'py>(
        &self,
        py: Python<'py>,
        x: PyReadonlyArrayDyn<'py, f64>,
        condition: Option<PyReadonlyArrayDyn<'py, f64>>,
    ) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
        let x = x.as_array().to_owned();
        let condition = owned_condition(condition);
        let lp = py
            .allow_threads(|| self.inner.log_prob(&x, condition.as_ref()))
            .map_err(to_py_err)?;
        Ok(lp.into_pyarray(py))
    }

    #[pyo3(signature = (seed, sample_shape=vec![], condition=None))]
    fn sample_and_log_prob<'py>(
        &self,
        py: Python<'py>,
        seed: u64,
        sample_shape: Vec<usize>,
        condition: Option<PyReadonlyArrayDyn<'py, f64>>,
    ) -> PyResult<(Bound<'py, PyArrayDyn<f64>>, Bound<'py, PyArrayDyn<f64>>)> {
        let condition = owned_condition(condition);
        let (samples, lps) = py
            .allow_threads(|| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                self.inner
                    .sample_and_log_prob(&mut rng, condition.as_ref(), &sample_shape)
            })
            .map_err(to_py_err)?;
        Ok((samples.into_pyarray(py), lps.into_pyarray(py)))
    }

    fn __repr__(&self) -> String {
        format!(
            "rustflow Flow ({}, shape={:?}, cond_shape={:?}, permutation={})",
            self.architecture,
            self.inner.shape(),
            self.inner.cond_shape(),
            self.permutation
        )
    }
}

fn wrap(
    inner: flows::Flow<StandardNormal>,
    architecture: &str,
    dim: usize,
) -> Flow {
    Flow {
        inner,
        architecture: architecture.to_string(),
        permutation: LayerPermutation::strategy_for(dim),
    }
}

fn cond_slice(cond_dim: &Option<usize>) -> Option<Vec<usize>> {
    cond_dim.map(|d| vec![d])
}

#[pyfunction]
#[pyo3(signature = (dim, cond_dim=None, transformer="affine", flow_layers=8, nn_width=40, nn_depth=2, knots=8, interval=4.0, invert=true, seed=0))]
#[allow(clippy::too_many_arguments)]
fn coupling_flow(
    dim: usize,
    cond_dim: Option<usize>,
    transformer: &str,
    flow_layers: usize,
    nn_width: usize,
    nn_depth: usize,
    knots: usize,
    interval: f64,
    invert: bool,
    seed: u64,
) -> PyResult<Flow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = StandardNormal::new(&[dim]);
    let cond = cond_slice(&cond_dim);
    let config = CouplingFlowConfig {
        flow_layers,
        nn_width,
        nn_depth,
        invert,
    };
    let inner = match transformer {
        "affine" => flows::coupling_flow(
            &mut rng,
            base,
            &AffineTransformer::default(),
            cond.as_deref(),
            &config,
        ),
        "spline" => flows::coupling_flow(
            &mut rng,
            base,
            &SplineTransformer::new(knots, interval).map_err(to_py_err)?,
            cond.as_deref(),
            &config,
        ),
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown transformer {other:?}; expected \"affine\" or \"spline\""
            )))
        }
    }
    .map_err(to_py_err)?;
    Ok(wrap(inner, "coupling", dim))
}

#[pyfunction]
#[pyo3(signature = (dim, cond_dim=None, transformer="affine", flow_layers=8, nn_width=40, nn_depth=2, knots=8, interval=4.0, invert=true, seed=0))]
#[allow(clippy::too_many_arguments)]
fn masked_autoregressive_flow(
    dim: usize,
    cond_dim: Option<usize>,
    transformer: &str,
    flow_layers: usize,
    nn_width: usize,
    nn_depth: usize,
    knots: usize,
    interval: f64,
    invert: bool,
    seed: u64,
) -> PyResult<Flow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = StandardNormal::new(&[dim]);
    let cond = cond_slice(&cond_dim);
    let config = MaskedAutoregressiveFlowConfig {
        flow_layers,
        nn_width,
        nn_depth,
        invert,
    };
    let inner = match transformer {
        "affine" => flows::masked_autoregressive_flow(
            &mut rng,
            base,
            &AffineTransformer::default(),
            cond.as_deref(),
            &config,
        ),
        "spline" => flows::masked_autoregressive_flow(
            &mut rng,
            base,
            &SplineTransformer::new(knots, interval).map_err(to_py_err)?,
            cond.as_deref(),
            &config,
        ),
        other => {
            return Err(PyValueError::new_err(format!(
                "unknown transformer {other:?}; expected \"affine\" or \"spline\""
            )))
        }
    }
    .map_err(to_py_err)?;
    Ok(wrap(inner, "masked_autoregressive", dim))
}

#[pyfunction]
#[pyo3(signature = (dim, cond_dim=None, flow_layers=1, nn_depth=1, block_dim=8, invert=true, seed=0))]
fn block_neural_autoregressive_flow(
    dim: usize,
    cond_dim: Option<usize>,
    flow_layers: usize,
    nn_depth: usize,
    block_dim: usize,
    invert: bool,
    seed: u64,
) -> PyResult<Flow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = StandardNormal::new(&[dim]);
    let cond = cond_slice(&cond_dim);
    let config = BlockNeuralAutoregressiveFlowConfig {
        flow_layers,
        nn_depth,
        block_dim,
        invert,
    };
    let inner =
        flows::block_neural_autoregressive_flow(&mut rng, base, cond.as_deref(), &config)
            .map_err(to_py_err)?;
    Ok(wrap(inner, "block_neural_autoregressive", dim))
}

#[pyfunction]
#[pyo3(signature = (dim, cond_dim=None, flow_layers=8, nn_width=40, nn_depth=2, invert=true, seed=0))]
fn planar_flow(
    dim: usize,
    cond_dim: Option<usize>,
    flow_layers: usize,
    nn_width: usize,
    nn_depth: usize,
    invert: bool,
    seed: u64,
) -> PyResult<Flow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = StandardNormal::new(&[dim]);
    let cond = cond_slice(&cond_dim);
    let config = PlanarFlowConfig {
        flow_layers,
        nn_width,
        nn_depth,
        invert,
    };
    let inner =
        flows::planar_flow(&mut rng, base, cond.as_deref(), &config).map_err(to_py_err)?;
    Ok(wrap(inner, "planar", dim))
}

#[pyfunction]
#[pyo3(signature = (dim, cond_dim=None, flow_layers=8, knots=8, tanh_max_val=3.0, invert=true, seed=0))]
fn triangular_spline_flow(
    dim: usize,
    cond_dim: Option<usize>,
    flow_layers: usize,
    knots: usize,
    tanh_max_val: f64,
    invert: bool,
    seed: u64,
) -> PyResult<Flow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let base = StandardNormal::new(&[dim]);
    let cond = cond_slice(&cond_dim);
    let config = TriangularSplineFlowConfig {
        flow_layers,
        knots,
        tanh_max_val,
        invert,
    };
    let inner = flows::triangular_spline_flow(&mut rng, base, cond.as_deref(), &config)
        .map_err(to_py_err)?;
    Ok(wrap(inner, "triangular_spline", dim))
}

#[pymodule]
fn rustflow(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<Flow>()?;
    m.add_function(wrap_pyfunction!(coupling_flow, m)?)?;
    m.add_function(wrap_pyfunction!(masked_autoregressive_flow, m)?)?;
    m.add_function(wrap_pyfunction!(block_neural_autoregressive_flow, m)?)?;
    m.add_function(wrap_pyfunction!(planar_flow, m)?)?;
    m.add_function(wrap_pyfunction!(triangular_spline_flow, m)?)?;
    Ok(())
}
