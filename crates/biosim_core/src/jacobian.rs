use nalgebra::{DMatrix, DVector};

use crate::config::ContainerSettings;
use crate::error::{MathError, Result};
use crate::traits::DynamicalSystem;

/// Central difference quotient of `evaluate` around `x`.
///
/// Coordinate `j` is perturbed by `max(|x_j| * derivation_factor,
/// derivation_resolution)`. `evaluate` is called once more at `x` before
/// returning, also when a perturbed evaluation failed, so that any cached
/// values match the unperturbed point.
pub fn central_difference<F>(
    x: &[f64],
    outputs: usize,
    settings: &ContainerSettings,
    mut evaluate: F,
) -> Result<DMatrix<f64>>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<()>,
{
    let jacobian = difference_quotients(x, outputs, settings, &mut evaluate);
    let mut current = vec![0.0; outputs];
    let restored = evaluate(x, &mut current);
    let jacobian = jacobian?;
    restored?;
    Ok(jacobian)
}

fn difference_quotients<F>(
    x: &[f64],
    outputs: usize,
    settings: &ContainerSettings,
    evaluate: &mut F,
) -> Result<DMatrix<f64>>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<()>,
{
    let dim = x.len();
    let mut jacobian = DMatrix::zeros(outputs, dim);
    let mut point = x.to_vec();
    let mut plus = vec![0.0; outputs];
    let mut minus = vec![0.0; outputs];

    for j in 0..dim {
        let delta = (x[j].abs() * settings.derivation_factor).max(settings.derivation_resolution);

        point[j] = x[j] + delta;
        evaluate(&point, &mut plus)?;
        point[j] = x[j] - delta;
        evaluate(&point, &mut minus)?;
        point[j] = x[j];

        for i in 0..outputs {
            let derivative = (plus[i] - minus[i]) / (2.0 * delta);
            if !derivative.is_finite() {
                return Err(MathError::NoDerivative(j));
            }
            jacobian[(i, j)] = derivative;
        }
    }
    Ok(jacobian)
}

/// Jacobian of a dynamical system's rate at `(t, x)`.
pub fn system_jacobian<S: DynamicalSystem>(
    system: &mut S,
    t: f64,
    x: &[f64],
    settings: &ContainerSettings,
) -> Result<DMatrix<f64>> {
    let dim = system.dimension();
    if x.len() != dim {
        return Err(MathError::DimensionMismatch {
            expected: dim,
            actual: x.len(),
        });
    }
    central_difference(x, dim, settings, |point, out| system.apply(t, point, out))
}

/// Time derivatives of the root functions along the flow: `J_root * rate`.
pub fn root_derivatives(root_jacobian: &DMatrix<f64>, rate: &[f64]) -> Result<DVector<f64>> {
    if root_jacobian.ncols() != rate.len() {
        return Err(MathError::DimensionMismatch {
            expected: root_jacobian.ncols(),
            actual: rate.len(),
        });
    }
    let rate = DVector::from_column_slice(rate);
    let mut derivatives = DVector::zeros(root_jacobian.nrows());
    derivatives.gemm(1.0, root_jacobian, &rate, 0.0);
    if let Some(position) = derivatives.iter().position(|d| !d.is_finite()) {
        return Err(MathError::NoDerivative(position));
    }
    Ok(derivatives)
}
