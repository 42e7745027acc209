use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Logical tensor shape as an ordered list of non-negative extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank zero; the shape of a scalar tensor.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    /// Returns element count, or `None` when the product overflows.
    pub fn num_elements(&self) -> Option<usize> {
        let mut count = 1usize;
        for &dim in &self.dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Right-aligned elementwise broadcast of two shapes.
///
/// In each aligned column the result extent is `max(x, y)` when `x == y` or
/// either side is 1; anything else cannot be reconciled. The result rank is
/// the larger of the two input ranks.
pub fn infer_broadcast(a: &Shape, b: &Shape) -> Result<Shape> {
    let rank = a.rank().max(b.rank());
    let mut dims = vec![0usize; rank];
    for i in 0..rank {
        let x = if i < a.rank() { a.dims()[a.rank() - 1 - i] } else { 1 };
        let y = if i < b.rank() { b.dims()[b.rank() - 1 - i] } else { 1 };
        dims[rank - 1 - i] = if x == y || y == 1 {
            x
        } else if x == 1 {
            y
        } else {
            return Err(GraphError::ShapeMismatch(format!(
                "cannot broadcast {a} with {b}: extents {x} and {y} differ"
            )));
        };
    }
    Ok(Shape::new(dims))
}

/// Folds a possibly-negative axis into `[0, rank)`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let folded = if axis < 0 { axis + rank as isize } else { axis };
    if folded < 0 || folded >= rank as isize {
        return Err(GraphError::BadAttribute(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(folded as usize)
}
