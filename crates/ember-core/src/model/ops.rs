//! Numeric building blocks shared by the layers.
//!
//! Everything here is a thin wrapper over candle kernels that fixes the
//! precision policy: softmax runs in f32 regardless of the working dtype, and
//! argmax resolves ties to the lowest index.

use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Bias-free linear projection `x @ weight^T`.
///
/// # Arguments
///
/// * `x` - Input tensor [..., in_features]
/// * `weight` - Weight matrix [out_features, in_features]
pub fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    let dims = x.dims();
    let Some(&last) = dims.last() else {
        return Err(EmberError::ShapeMismatch(
            "linear input must have at least one dimension".to_string(),
        ));
    };
    if last != in_features {
        return Err(EmberError::ShapeMismatch(format!(
            "linear expects {} input features, got {:?}",
            in_features, dims
        )));
    }

    // Flatten leading dims so a single matmul covers the batch
    let rows = x.elem_count() / in_features;
    let out = x.reshape((rows, in_features))?.matmul(&weight.t()?)?;

    let mut shape = dims.to_vec();
    let last_idx = shape.len() - 1;
    shape[last_idx] = out_features;
    Ok(out.reshape(shape)?)
}

/// Softmax over the last dimension, computed in f32 and cast back.
pub fn softmax_f32(x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let probs = candle_nn::ops::softmax_last_dim(&x.to_dtype(DType::F32)?)?;
    Ok(probs.to_dtype(dtype)?)
}

/// SiLU activation `x * sigmoid(x)`.
pub fn silu(x: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::silu(x)?)
}

/// Argmax over the last dimension of a [batch, vocab] tensor.
///
/// Ties go to the lowest index. NaN entries never win a comparison.
pub fn argmax_last(logits: &Tensor) -> Result<Vec<u32>> {
    let rows: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;
    Ok(rows
        .iter()
        .map(|row| {
            let mut best = 0usize;
            let mut best_val = f32::NEG_INFINITY;
            for (idx, &val) in row.iter().enumerate() {
                if val > best_val {
                    best = idx;
                    best_val = val;
                }
            }
            best as u32
        })
        .collect())
}

/// Additive causal mask for `seq_len` queries starting at `start_pos`.
///
/// Shape [seq_len, start_pos + seq_len]. Entry (i, j) is `-inf` when key `j`
/// lies after query `start_pos + i`, zero otherwise.
pub fn causal_mask(
    seq_len: usize,
    start_pos: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let total = start_pos + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j > start_pos + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (seq_len, total), device)?;
    Ok(mask.to_dtype(dtype)?)
}

/// Take the last position of a [batch, seq, vocab] logits tensor.
pub fn last_position(logits: &Tensor) -> Result<Tensor> {
    let seq_len = logits.dim(1)?;
    Ok(logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?)
}

/// Mean of `x^2` over the last dimension, in f32.
pub(crate) fn mean_square(x: &Tensor) -> Result<Tensor> {
    Ok(x.to_dtype(DType::F32)?.sqr()?.mean_keepdim(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_shapes() {
        let x = Tensor::randn(0.0f32, 1.0, &[2, 5, 8], &Device::Cpu).unwrap();
        let w = Tensor::randn(0.0f32, 1.0, &[3, 8], &Device::Cpu).unwrap();
        let y = linear(&x, &w).unwrap();
        assert_eq!(y.dims(), &[2, 5, 3]);
    }

    #[test]
    fn linear_matches_manual() {
        let x = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let w = Tensor::new(&[[1.0f32, 0.0], [0.5, 0.5], [0.0, -1.0]], &Device::Cpu).unwrap();
        let y: Vec<Vec<f32>> = linear(&x, &w).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![1.0, 1.5, -2.0]]);
    }

    #[test]
    fn linear_rejects_wrong_width() {
        let x = Tensor::zeros(&[2, 7], DType::F32, &Device::Cpu).unwrap();
        let w = Tensor::zeros(&[3, 8], DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(linear(&x, &w), Err(EmberError::ShapeMismatch(_))));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Tensor::randn(0.0f32, 3.0, &[4, 10], &Device::Cpu).unwrap();
        let p = softmax_f32(&x).unwrap();
        let sums: Vec<f32> = p.sum(1).unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn softmax_keeps_dtype() {
        let x = Tensor::randn(0.0f32, 1.0, &[2, 6], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        assert_eq!(softmax_f32(&x).unwrap().dtype(), DType::F16);
    }

    #[test]
    fn softmax_masked_entries_are_zero() {
        let x = Tensor::new(&[[1.0f32, f32::NEG_INFINITY, 2.0]], &Device::Cpu).unwrap();
        let p: Vec<Vec<f32>> = softmax_f32(&x).unwrap().to_vec2().unwrap();
        assert_eq!(p[0][1], 0.0);
    }

    #[test]
    fn argmax_lowest_index_wins_ties() {
        let logits = Tensor::new(
            &[[0.5f32, 2.0, 2.0, 1.0], [3.0, 3.0, 3.0, 3.0]],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(argmax_last(&logits).unwrap(), vec![1, 0]);
    }

    #[test]
    fn argmax_skips_nan() {
        let logits = Tensor::new(&[[f32::NAN, 1.0, 0.0]], &Device::Cpu).unwrap();
        assert_eq!(argmax_last(&logits).unwrap(), vec![1]);
    }

    #[test]
    fn causal_mask_values() {
        let mask: Vec<Vec<f32>> = causal_mask(3, 0, DType::F32, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mask[0][0], 0.0);
        assert!(mask[0][1].is_infinite() && mask[0][1] < 0.0);
        assert!(mask[0][2].is_infinite());
        assert_eq!(mask[1][1], 0.0);
        assert!(mask[1][2].is_infinite());
        assert!(mask[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn causal_mask_with_offset() {
        let mask = causal_mask(2, 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 5]);
        let mask: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        // Query 0 sits at absolute position 3: keys 0..=3 visible
        assert!(mask[0][..4].iter().all(|v| *v == 0.0));
        assert!(mask[0][4].is_infinite());
        assert!(mask[1].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn last_position_slices_seq() {
        let logits = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap();
        let last: Vec<Vec<f32>> = last_position(&logits).unwrap().to_vec2().unwrap();
        assert_eq!(last, vec![vec![8.0, 9.0, 10.0, 11.0]]);
    }
}
