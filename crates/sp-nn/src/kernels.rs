//! Row-major dense kernels over raw slices.
//!
//! Shapes are passed explicitly; callers validate them before calling in.
//! Every loop runs in a fixed order so results are bit-reproducible.

/// `out[n, o] = sum_i x[n, i] * w[o, i]`, i.e. `X @ W^T`.
pub(crate) fn gemm_nt(x: &[f64], w: &[f64], rows: usize, n_o: usize, n_i: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * n_o];
    for n in 0..rows {
        let x_row = &x[n * n_i..(n + 1) * n_i];
        let out_row = &mut out[n * n_o..(n + 1) * n_o];
        for (o, slot) in out_row.iter_mut().enumerate() {
            let w_row = &w[o * n_i..(o + 1) * n_i];
            *slot = dot(x_row, w_row);
        }
    }
    out
}

/// `out[n, i] = sum_o dz[n, o] * w[o, i]`, i.e. `dZ @ W`.
pub(crate) fn gemm_nn(dz: &[f64], w: &[f64], rows: usize, n_o: usize, n_i: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * n_i];
    for n in 0..rows {
        let out_row = &mut out[n * n_i..(n + 1) * n_i];
        for o in 0..n_o {
            let scale = dz[n * n_o + o];
            if scale != 0.0 {
                axpy(scale, &w[o * n_i..(o + 1) * n_i], out_row);
            }
        }
    }
    out
}

/// `dw[o, i] += sum_n dz[n, o] * x[n, i]`, i.e. `dW += dZ^T @ X`.
pub(crate) fn gemm_tn_acc(
    dz: &[f64],
    x: &[f64],
    dw: &mut [f64],
    rows: usize,
    n_o: usize,
    n_i: usize,
) {
    for n in 0..rows {
        let x_row = &x[n * n_i..(n + 1) * n_i];
        for o in 0..n_o {
            let scale = dz[n * n_o + o];
            if scale != 0.0 {
                axpy(scale, x_row, &mut dw[o * n_i..(o + 1) * n_i]);
            }
        }
    }
}

pub(crate) fn add_bias(out: &mut [f64], bias: &[f64]) {
    let width = bias.len();
    for row in out.chunks_mut(width) {
        for (slot, b) in row.iter_mut().zip(bias.iter()) {
            *slot += b;
        }
    }
}

/// `db[o] += sum_n dz[n, o]`.
pub(crate) fn sum_rows_acc(dz: &[f64], db: &mut [f64]) {
    let width = db.len();
    for row in dz.chunks(width) {
        for (slot, d) in db.iter_mut().zip(row.iter()) {
            *slot += d;
        }
    }
}

pub(crate) fn dot(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a * b).sum()
}

pub(crate) fn axpy(scale: f64, x: &[f64], y: &mut [f64]) {
    for (slot, value) in y.iter_mut().zip(x.iter()) {
        *slot += scale * value;
    }
}

pub(crate) fn sigmoid(value: f64) -> f64 {
    if value >= 0.0 {
        1.0 / (1.0 + (-value).exp())
    } else {
        let e = value.exp();
        e / (1.0 + e)
    }
}

/// Row-wise softmax in place, shifted by the row max.
pub(crate) fn softmax_rows(values: &mut [f64], width: usize) {
    if width == 0 {
        return;
    }
    for row in values.chunks_mut(width) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for slot in row.iter_mut() {
            *slot = (*slot - max).exp();
            total += *slot;
        }
        for slot in row.iter_mut() {
            *slot /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{gemm_nn, gemm_nt, gemm_tn_acc, sigmoid, softmax_rows};

    #[test]
    fn gemm_variants_agree_with_hand_computation() {
        // x: [2, 3], w: [2, 3]
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let w = [1.0, 0.0, -1.0, 0.5, 0.5, 0.5];
        let z = gemm_nt(&x, &w, 2, 2, 3);
        assert_eq!(z, vec![-2.0, 3.0, -2.0, 7.5]);

        let dz = [1.0, 0.0, 0.0, 2.0];
        assert_eq!(gemm_nn(&dz, &w, 2, 2, 3), vec![1.0, 0.0, -1.0, 1.0, 1.0, 1.0]);

        let mut dw = vec![0.0; 6];
        gemm_tn_acc(&dz, &x, &mut dw, 2, 2, 3);
        assert_eq!(dw, vec![1.0, 2.0, 3.0, 8.0, 10.0, 12.0]);
    }

    #[test]
    fn sigmoid_is_symmetric_and_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-15);
        assert!((sigmoid(3.0) + sigmoid(-3.0) - 1.0).abs() < 1e-15);
        assert!(sigmoid(-1_000.0).is_finite());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut values = vec![1.0, 2.0, 3.0, 1_000.0, 1_000.0, 1_000.0];
        softmax_rows(&mut values, 3);
        assert!((values[..3].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((values[3] - 1.0 / 3.0).abs() < 1e-12);
    }
}
