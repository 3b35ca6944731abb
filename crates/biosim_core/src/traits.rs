use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::error::Result;
use crate::object::DataObjectKey;

/// A trait for types that can be used as scalars by the expression VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A continuous system whose rate can be evaluated at an arbitrary state.
///
/// Evaluation may update internal caches, hence `&mut self`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates dx/dt at time `t` and state `x`, writing into `out`.
    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()>;
}

/// Storage of the model adapter, addressed by data-object keys.
///
/// This is the only seam between the container's arena and the model's own
/// values: the container reads and writes through it during push/fetch.
pub trait DataObjectStore {
    fn data_value(&self, key: &DataObjectKey) -> Option<f64>;

    /// Stores `value`; returns false when the key is not owned by the store.
    fn set_data_value(&mut self, key: &DataObjectKey, value: f64) -> bool;
}
