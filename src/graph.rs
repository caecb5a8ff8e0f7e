// ============================================================================
// VECTORIZED TENSOR AUTODIFF ENGINE
// Each node = dense row-major matrix. No per-scalar nodes.
// ============================================================================

use rayon::prelude::*;

use crate::ops::{
    log_sum_exp, vec_add, vec_add_inplace, vec_max, vec_mul, vec_relu, vec_scale, vec_sigmoid,
    vec_tanh,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TID(pub(crate) usize);

#[derive(Clone, Debug)]
enum TensorOp {
    None,
    MatMul { a: TID, b: TID, m: usize, k: usize, n: usize },
    Add { a: TID, b: TID },
    Mul { a: TID, b: TID },
    Scale { a: TID, s: f32 },
    ScalarDiv { a: TID, n: f32 },
    Sigmoid { a: TID },
    Tanh { a: TID },
    Relu { a: TID },
    OneMinus { a: TID },
    Square { a: TID },
    BroadcastAdd { a: TID, bias: TID, rows: usize, cols: usize },
    GatherRows { a: TID, idx: Vec<usize>, cols: usize },
    Transpose { a: TID, rows: usize, cols: usize },
    SumAll { a: TID },
    SoftmaxCE { logits: TID, targets: Vec<usize>, vocab: usize },
}

struct TensorNode {
    data: Vec<f32>,
    grad: Vec<f32>,
    rows: usize,
    cols: usize,
    op: TensorOp,
}

/// Tape of dense matrices. Parameters are pushed first and frozen behind
/// `param_boundary`; everything after it is per-window activation state.
pub struct Graph {
    nodes: Vec<TensorNode>,
    param_boundary: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::with_capacity(4096), param_boundary: 0 }
    }

    fn push(&mut self, data: Vec<f32>, rows: usize, cols: usize, op: TensorOp) -> TID {
        debug_assert_eq!(data.len(), rows * cols);
        let len = data.len();
        let id = self.nodes.len();
        self.nodes.push(TensorNode { data, grad: vec![0.0; len], rows, cols, op });
        TID(id)
    }

    pub fn param(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        debug_assert_eq!(self.nodes.len(), self.param_boundary, "params must precede activations");
        let id = self.push(data, rows, cols, TensorOp::None);
        self.param_boundary = self.nodes.len();
        id
    }

    pub fn constant(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        self.push(data, rows, cols, TensorOp::None)
    }

    /// Drops every activation node. Parameter values and their accumulated
    /// gradients survive.
    pub fn reset(&mut self) {
        self.nodes.truncate(self.param_boundary);
    }

    pub fn zero_grad(&mut self) {
        for node in self.nodes.iter_mut() {
            for g in node.grad.iter_mut() {
                *g = 0.0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn data(&self, t: TID) -> &[f32] {
        &self.nodes[t.0].data
    }

    pub fn data_mut(&mut self, t: TID) -> &mut [f32] {
        &mut self.nodes[t.0].data
    }

    pub fn grad(&self, t: TID) -> &[f32] {
        &self.nodes[t.0].grad
    }

    /// Value and gradient of one node, borrowed together for in-place updates.
    pub fn data_and_grad_mut(&mut self, t: TID) -> (&mut [f32], &mut [f32]) {
        let node = &mut self.nodes[t.0];
        (&mut node.data, &mut node.grad)
    }

    pub fn rows(&self, t: TID) -> usize {
        self.nodes[t.0].rows
    }

    pub fn cols(&self, t: TID) -> usize {
        self.nodes[t.0].cols
    }

    pub fn scalar(&self, t: TID) -> f32 {
        self.nodes[t.0].data[0]
    }

    // ------------------------------------------------------------------
    // Forward ops: each builds one TensorNode
    // ------------------------------------------------------------------

    pub fn matmul(&mut self, a: TID, b: TID) -> TID {
        let m = self.nodes[a.0].rows;
        let k = self.nodes[a.0].cols;
        let n = self.nodes[b.0].cols;
        debug_assert_eq!(k, self.nodes[b.0].rows, "matmul shape [{},{}] @ [{},{}]",
            m, k, self.nodes[b.0].rows, n);

        let a_data = &self.nodes[a.0].data;
        let b_data = &self.nodes[b.0].data;
        let mut out = vec![0.0f32; m * n];

        // SAFETY: buffers are exactly [m,k], [k,n] and [m,n] row-major.
        unsafe {
            matrixmultiply::sgemm(
                m, k, n,
                1.0,
                a_data.as_ptr(), k as isize, 1,
                b_data.as_ptr(), n as isize, 1,
                0.0,
                out.as_mut_ptr(), n as isize, 1,
            );
        }

        self.push(out, m, n, TensorOp::MatMul { a, b, m, k, n })
    }

    pub fn add(&mut self, a: TID, b: TID) -> TID {
        let data = vec_add(&self.nodes[a.0].data, &self.nodes[b.0].data);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Add { a, b })
    }

    pub fn mul(&mut self, a: TID, b: TID) -> TID {
        let data = vec_mul(&self.nodes[a.0].data, &self.nodes[b.0].data);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Mul { a, b })
    }

    pub fn scale(&mut self, a: TID, s: f32) -> TID {
        let data = vec_scale(&self.nodes[a.0].data, s);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Scale { a, s })
    }

    pub fn scalar_div(&mut self, a: TID, n: f32) -> TID {
        let data: Vec<f32> = self.nodes[a.0].data.iter().map(|x| x / n).collect();
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::ScalarDiv { a, n })
    }

    pub fn sigmoid(&mut self, a: TID) -> TID {
        let data = vec_sigmoid(&self.nodes[a.0].data);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Sigmoid { a })
    }

    pub fn tanh_op(&mut self, a: TID) -> TID {
        let data = vec_tanh(&self.nodes[a.0].data);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Tanh { a })
    }

    pub fn relu(&mut self, a: TID) -> TID {
        let data = vec_relu(&self.nodes[a.0].data);
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Relu { a })
    }

    pub fn one_minus(&mut self, a: TID) -> TID {
        let data: Vec<f32> = self.nodes[a.0].data.iter().map(|x| 1.0 - x).collect();
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::OneMinus { a })
    }

    pub fn square(&mut self, a: TID) -> TID {
        let data: Vec<f32> = self.nodes[a.0].data.iter().map(|x| x * x).collect();
        let (r, c) = (self.nodes[a.0].rows, self.nodes[a.0].cols);
        self.push(data, r, c, TensorOp::Square { a })
    }

    /// [m,n] + [1,n] broadcast bias add
    pub fn broadcast_add(&mut self, a: TID, bias: TID) -> TID {
        let rows = self.nodes[a.0].rows;
        let cols = self.nodes[a.0].cols;
        debug_assert_eq!(self.nodes[bias.0].data.len(), cols);
        let bd = &self.nodes[bias.0].data;
        let mut out = self.nodes[a.0].data.clone();
        for row in out.chunks_mut(cols) {
            vec_add_inplace(row, bd);
        }
        self.push(out, rows, cols, TensorOp::BroadcastAdd { a, bias, rows, cols })
    }

    /// Selects rows of `a` in the order given; backward scatter-adds.
    pub fn gather_rows(&mut self, a: TID, idx: &[usize]) -> TID {
        let cols = self.nodes[a.0].cols;
        let ad = &self.nodes[a.0].data;
        let mut out = Vec::with_capacity(idx.len() * cols);
        for &r in idx {
            debug_assert!(r < self.nodes[a.0].rows, "gather row {} out of range", r);
            out.extend_from_slice(&ad[r * cols..(r + 1) * cols]);
        }
        self.push(out, idx.len(), cols, TensorOp::GatherRows { a, idx: idx.to_vec(), cols })
    }

    pub fn transpose(&mut self, a: TID) -> TID {
        let rows = self.nodes[a.0].rows;
        let cols = self.nodes[a.0].cols;
        let ad = &self.nodes[a.0].data;
        let mut out = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                out[j * rows + i] = ad[i * cols + j];
            }
        }
        self.push(out, cols, rows, TensorOp::Transpose { a, rows, cols })
    }

    pub fn sum_all(&mut self, a: TID) -> TID {
        let s: f32 = self.nodes[a.0].data.iter().sum();
        self.push(vec![s], 1, 1, TensorOp::SumAll { a })
    }

    /// Fused softmax cross-entropy: [rows, vocab] + one target per row -> summed loss
    pub fn softmax_ce(&mut self, logits: TID, targets: &[usize]) -> TID {
        let vocab = self.nodes[logits.0].cols;
        debug_assert_eq!(self.nodes[logits.0].rows, targets.len());
        let loss: f32 = self.nodes[logits.0]
            .data
            .par_chunks(vocab)
            .zip(targets.par_iter())
            .map(|(row, &t)| log_sum_exp(row) - row[t])
            .sum();
        self.push(vec![loss], 1, 1, TensorOp::SoftmaxCE { logits, targets: targets.to_vec(), vocab })
    }

    // ------------------------------------------------------------------
    // Backward: vectorized gradient propagation
    // ------------------------------------------------------------------

    /// Seeds `loss` with unit gradient and propagates into every node that
    /// feeds it. Gradients accumulate, so repeated passes sum.
    pub fn backward(&mut self, loss: TID) {
        debug_assert_eq!(self.nodes[loss.0].data.len(), 1, "backward needs a scalar");
        self.nodes[loss.0].grad[0] += 1.0;

        for i in (0..=loss.0).rev() {
            let has_grad = self.nodes[i].grad.iter().any(|&g| g != 0.0);
            if !has_grad { continue; }

            let op = self.nodes[i].op.clone();
            match op {
                TensorOp::None => {}

                TensorOp::MatMul { a, b, m, k, n: nn } => {
                    let og = self.nodes[i].grad.clone();
                    // dA = dOut @ B^T
                    {
                        let b_d = &self.nodes[b.0].data;
                        let mut da_buf = vec![0.0f32; m * k];
                        unsafe {
                            matrixmultiply::sgemm(
                                m, nn, k,
                                1.0,
                                og.as_ptr(), nn as isize, 1,
                                b_d.as_ptr(), 1, nn as isize,
                                0.0,
                                da_buf.as_mut_ptr(), k as isize, 1,
                            );
                        }
                        vec_add_inplace(&mut self.nodes[a.0].grad, &da_buf);
                    }
                    // dB = A^T @ dOut
                    {
                        let a_d = &self.nodes[a.0].data;
                        let mut db_buf = vec![0.0f32; k * nn];
                        unsafe {
                            matrixmultiply::sgemm(
                                k, m, nn,
                                1.0,
                                a_d.as_ptr(), 1, k as isize,
                                og.as_ptr(), nn as isize, 1,
                                0.0,
                                db_buf.as_mut_ptr(), nn as isize, 1,
                            );
                        }
                        vec_add_inplace(&mut self.nodes[b.0].grad, &db_buf);
                    }
                }

                TensorOp::Add { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    vec_add_inplace(&mut self.nodes[b.0].grad, &g);
                }

                TensorOp::Mul { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    for j in 0..g.len() {
                        self.nodes[a.0].grad[j] += g[j] * b_d[j];
                        self.nodes[b.0].grad[j] += g[j] * a_d[j];
                    }
                }

                TensorOp::Scale { a, s } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * s; }
                }

                TensorOp::ScalarDiv { a, n: dv } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] / dv; }
                }

                TensorOp::Sigmoid { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let s = od[j];
                        self.nodes[a.0].grad[j] += g[j] * s * (1.0 - s);
                    }
                }

                TensorOp::Tanh { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let t = od[j];
                        self.nodes[a.0].grad[j] += g[j] * (1.0 - t * t);
                    }
                }

                TensorOp::Relu { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        if od[j] > 0.0 { self.nodes[a.0].grad[j] += g[j]; }
                    }
                }

                TensorOp::OneMinus { a } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] -= g[j]; }
                }

                TensorOp::Square { a } => {
                    let g = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * 2.0 * a_d[j]; }
                }

                TensorOp::BroadcastAdd { a, bias, rows: rr, cols: cc } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for ii in 0..rr {
                        let off = ii * cc;
                        vec_add_inplace(&mut self.nodes[bias.0].grad, &g[off..off + cc]);
                    }
                }

                TensorOp::GatherRows { a, idx, cols: cc } => {
                    let g = self.nodes[i].grad.clone();
                    let ag = &mut self.nodes[a.0].grad;
                    for (row, &r) in idx.iter().enumerate() {
                        vec_add_inplace(&mut ag[r * cc..(r + 1) * cc], &g[row * cc..(row + 1) * cc]);
                    }
                }

                TensorOp::Transpose { a, rows: rr, cols: cc } => {
                    let g = self.nodes[i].grad.clone();
                    for ii in 0..cc {
                        for jj in 0..rr {
                            self.nodes[a.0].grad[jj * cc + ii] += g[ii * rr + jj];
                        }
                    }
                }

                TensorOp::SumAll { a } => {
                    let gv = self.nodes[i].grad[0];
                    for v in self.nodes[a.0].grad.iter_mut() { *v += gv; }
                }

                TensorOp::SoftmaxCE { logits, targets, vocab } => {
                    let gv = self.nodes[i].grad[0];
                    let node = &mut self.nodes[logits.0];
                    let (data, grad) = (&node.data, &mut node.grad);
                    grad.par_chunks_mut(vocab)
                        .zip(data.par_chunks(vocab))
                        .zip(targets.par_iter())
                        .for_each(|((gr, row), &t)| {
                            let max_l = vec_max(row);
                            let exps: Vec<f32> = row.iter().map(|&x| (x - max_l).exp()).collect();
                            let sum_e: f32 = exps.iter().sum();
                            for j in 0..vocab {
                                let prob = exps[j] / sum_e;
                                let tg = if j == t { prob - 1.0 } else { prob };
                                gr[j] += gv * tg;
                            }
                        });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn matmul_forward_and_backward() {
        let mut g = Graph::new();
        let a = g.param(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let b = g.param(vec![1.0, 0.0, 0.0, 1.0], 2, 2);
        let c = g.matmul(a, b);
        assert_eq!(g.data(c), &[1.0, 2.0, 3.0, 4.0]);
        let s = g.sum_all(c);
        g.backward(s);
        // d(sum(AB))/dA = 1 @ B^T
        assert_eq!(g.grad(a), &[1.0, 1.0, 1.0, 1.0]);
        // d(sum(AB))/dB = A^T @ 1
        assert_eq!(g.grad(b), &[4.0, 4.0, 6.0, 6.0]);
    }

    #[test]
    fn gather_scatters_gradient_into_repeated_rows() {
        let mut g = Graph::new();
        let w = g.param(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2);
        let rows = g.gather_rows(w, &[2, 0, 2]);
        assert_eq!(g.data(rows), &[5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);
        let s = g.sum_all(rows);
        g.backward(s);
        assert_eq!(g.grad(w), &[1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn softmax_ce_of_uniform_logits_is_log_vocab() {
        let mut g = Graph::new();
        let logits = g.param(vec![0.0; 8], 2, 4);
        let loss = g.softmax_ce(logits, &[1, 3]);
        assert!(close(g.scalar(loss), 2.0 * 4f32.ln(), 1e-5));
        g.backward(loss);
        let grad = g.grad(logits);
        assert!(close(grad[1], 0.25 - 1.0, 1e-6));
        assert!(close(grad[0], 0.25, 1e-6));
        assert!(close(grad.iter().sum::<f32>(), 0.0, 1e-5));
    }

    #[test]
    fn reset_keeps_param_gradients_and_backward_accumulates() {
        let mut g = Graph::new();
        let w = g.param(vec![3.0], 1, 1);
        let sq = g.square(w);
        g.backward(sq);
        g.reset();
        assert_eq!(g.len(), 1);
        let doubled = g.scale(w, 2.0);
        g.backward(doubled);
        assert_eq!(g.grad(w), &[6.0 + 2.0]);
    }

    #[test]
    fn transpose_backward_routes_to_source() {
        let mut g = Graph::new();
        let a = g.param(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        let t = g.transpose(a);
        assert_eq!((g.rows(t), g.cols(t)), (3, 2));
        assert_eq!(g.data(t), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let w = g.constant(vec![1.0, 10.0, 100.0, 1000.0, 1e4, 1e5], 3, 2);
        let m = g.mul(t, w);
        let s = g.sum_all(m);
        g.backward(s);
        assert_eq!(g.grad(a), &[1.0, 100.0, 1e4, 10.0, 1000.0, 1e5]);
    }

    #[test]
    fn broadcast_add_sums_bias_gradient_over_rows() {
        let mut g = Graph::new();
        let bias = g.param(vec![1.0, -1.0], 1, 2);
        let x = g.constant(vec![0.0; 6], 3, 2);
        let y = g.broadcast_add(x, bias);
        assert_eq!(g.data(y), &[1.0, -1.0, 1.0, -1.0, 1.0, -1.0]);
        let s = g.sum_all(y);
        g.backward(s);
        assert_eq!(g.grad(bias), &[3.0, 3.0]);
    }
}
