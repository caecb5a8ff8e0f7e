// ============================================================================
// SLICE KERNELS
// Tight loops that auto-vectorize under opt-level=3 + LTO
// ============================================================================

#[inline]
pub fn vec_add(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

#[inline]
pub fn vec_add_inplace(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

#[inline]
pub fn vec_mul(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).collect()
}

#[inline]
pub fn vec_scale(a: &[f32], s: f32) -> Vec<f32> {
    a.iter().map(|x| x * s).collect()
}

#[inline]
pub fn vec_scale_inplace(a: &mut [f32], s: f32) {
    for x in a.iter_mut() {
        *x *= s;
    }
}

/// `a -= s * b`
#[inline]
pub fn vec_axpy_inplace(a: &mut [f32], s: f32, b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x -= s * y;
    }
}

#[inline]
pub fn vec_sigmoid(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&x| 1.0 / (1.0 + (-x).exp())).collect()
}

#[inline]
pub fn vec_tanh(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&x| x.tanh()).collect()
}

#[inline]
pub fn vec_relu(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&x| x.max(0.0)).collect()
}

#[inline]
pub fn vec_max(a: &[f32]) -> f32 {
    a.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

#[inline]
pub fn sum_squares(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum()
}

/// Numerically stable `log(sum(exp(row)))`.
#[inline]
pub fn log_sum_exp(row: &[f32]) -> f32 {
    let max_l = vec_max(row);
    let sum_exp: f32 = row.iter().map(|&x| (x - max_l).exp()).sum();
    sum_exp.ln() + max_l
}
