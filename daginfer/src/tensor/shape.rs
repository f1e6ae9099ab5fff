//! Shape arithmetic shared by tensors and kernels.

use crate::error::{Error, Result};

/// Logical element count of a shape. A scalar (rank 0) holds one element.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for a contiguous buffer.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut acc = 1usize;
    for (stride, dim) in strides.iter_mut().zip(shape.iter()).rev() {
        *stride = acc;
        acc *= *dim;
    }
    strides
}

/// Flat offset of a multidimensional index in a contiguous buffer.
pub fn offset_for(shape: &[usize], indices: &[usize]) -> Result<usize> {
    if indices.len() != shape.len() {
        return Err(Error::internal(format!(
            "index rank {} does not match shape rank {}",
            indices.len(),
            shape.len()
        )));
    }
    let mut offset = 0usize;
    let mut stride = 1usize;
    for (dim, index) in shape.iter().zip(indices.iter()).rev() {
        if index >= dim {
            return Err(Error::internal(format!(
                "index {} out of bounds for dimension {}",
                index, dim
            )));
        }
        offset += index * stride;
        stride *= dim;
    }
    Ok(offset)
}

/// Multidimensional index of a flat offset.
pub fn linear_to_indices(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = vec![0usize; shape.len()];
    for (index, dim) in indices.iter_mut().zip(shape.iter()).rev() {
        if *dim > 0 {
            *index = linear % dim;
            linear /= dim;
        }
    }
    indices
}

/// NumPy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(Error::invalid_argument(format!(
                "shapes {:?} and {:?} are not broadcastable",
                a, b
            )));
        };
    }
    Ok(out)
}

/// Flat offset into `shape` for an index expressed in the broadcast
/// output shape. Dimensions of size 1 are pinned to index 0.
pub fn broadcast_offset(shape: &[usize], out_indices: &[usize]) -> usize {
    let pad = out_indices.len() - shape.len();
    let mut offset = 0usize;
    let mut stride = 1usize;
    for i in (0..shape.len()).rev() {
        let index = if shape[i] == 1 { 0 } else { out_indices[i + pad] };
        offset += index * stride;
        stride *= shape[i];
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn broadcast_aligns_trailing_dimensions() {
        assert_eq!(broadcast_shapes(&[2, 3, 4], &[3, 1]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shapes(&[1], &[5]).unwrap(), vec![5]);
        assert!(broadcast_shapes(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn broadcast_offset_pins_unit_dims() {
        // shape [3,1] against output [2,3,4]
        assert_eq!(broadcast_offset(&[3, 1], &[1, 2, 3]), 2);
    }

    #[test]
    fn linear_round_trip() {
        let shape = [2usize, 3, 4];
        for linear in 0..numel(&shape) {
            let idx = linear_to_indices(linear, &shape);
            assert_eq!(offset_for(&shape, &idx).unwrap(), linear);
        }
    }
}
