//! Bias regularization: `λ · ‖W[N] · Bᵀ‖²`.
//!
//! The subspace `B` is re-estimated from the current embedding values on
//! every call and enters the graph as a constant, so the gradient lands on
//! the neutral rows of `W` only.

use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{Graph, TID};
use crate::model::RnnModel;
use crate::subspace::{estimate, GenderSubspace, GenderWordSets};

pub struct BiasRegularizer {
    sets: GenderWordSets,
    var_ratio: f32,
    weight: f32,
}

impl BiasRegularizer {
    pub fn new(sets: GenderWordSets, var_ratio: f32, weight: f32) -> Result<Self> {
        if !(var_ratio > 0.0 && var_ratio <= 1.0) {
            return Err(Error::InvalidVarianceRatio(var_ratio));
        }
        if !(weight >= 0.0 && weight.is_finite()) {
            return Err(Error::InvalidRegularizationWeight(weight));
        }
        Ok(BiasRegularizer { sets, var_ratio, weight })
    }

    /// Gender subspace of the model's current embedding matrix.
    pub fn subspace(&self, model: &RnnModel, g: &Graph) -> Result<GenderSubspace> {
        estimate(g.data(model.embedding_weight()), model.embedding_dim(), self.sets.pairs(), self.var_ratio)
    }

    /// Builds the penalty as a scalar node on `g`, ready for its own
    /// backward pass.
    pub fn loss(&self, model: &RnnModel, g: &mut Graph) -> Result<TID> {
        let subspace = self.subspace(model, g)?;
        debug!(k = subspace.k(), captured = subspace.captured_variance(), "gender subspace");
        Ok(projection_penalty(g, model.embedding_weight(), self.sets.neutral(), &subspace, self.weight))
    }
}

/// `weight · ‖W[neutral] · Bᵀ‖²` with `W` the graph node `w`.
pub fn projection_penalty(g: &mut Graph, w: TID, neutral: &[usize], subspace: &GenderSubspace, weight: f32) -> TID {
    if neutral.is_empty() {
        return g.constant(vec![0.0], 1, 1);
    }
    let bt = g.constant(subspace.transposed(), subspace.dim(), subspace.k());
    let wn = g.gather_rows(w, neutral);
    let proj = g.matmul(wn, bt);
    let sq = g.square(proj);
    let total = g.sum_all(sq);
    g.scale(total, weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelKind};
    use crate::subspace::estimate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn axis_subspace() -> (Graph, TID, GenderSubspace) {
        // rows 0/1 are the pair and differ along axis 0; rows 2.. are neutral
        let w = vec![
            1.0, 0.0, 0.0, //
            -1.0, 0.0, 0.0, //
            2.0, 3.0, 0.0, //
            0.0, 1.0, 4.0,
        ];
        let sub = estimate(&w, 3, &[(0, 1)], 0.5).unwrap();
        let mut g = Graph::new();
        let wid = g.param(w, 4, 3);
        (g, wid, sub)
    }

    #[test]
    fn penalty_is_weighted_squared_projection() {
        let (mut g, w, sub) = axis_subspace();
        let loss = projection_penalty(&mut g, w, &[2, 3], &sub, 0.5);
        // projections onto axis 0 are 2 and 0
        assert!((g.scalar(loss) - 0.5 * 4.0).abs() < 1e-5);
    }

    #[test]
    fn penalty_vanishes_in_the_null_space() {
        let (mut g, w, sub) = axis_subspace();
        let loss = projection_penalty(&mut g, w, &[3], &sub, 10.0);
        assert!(g.scalar(loss).abs() < 1e-6);
        assert!(g.scalar(loss) >= 0.0);
    }

    #[test]
    fn gradient_only_touches_neutral_rows_along_the_subspace() {
        let (mut g, w, sub) = axis_subspace();
        let loss = projection_penalty(&mut g, w, &[2, 3], &sub, 1.0);
        g.backward(loss);
        let grad = g.grad(w);
        // d/dW[2] = 2 (W[2]·b) b = (4, 0, 0)
        assert!((grad[6] - 4.0).abs() < 1e-5);
        assert!(grad[7].abs() < 1e-6 && grad[8].abs() < 1e-6);
        assert!(grad[..6].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn regularizer_rejects_bad_settings() {
        let sets = GenderWordSets::new(vec![(0, 1)], vec![2]).unwrap();
        assert!(matches!(
            BiasRegularizer::new(sets.clone(), 0.0, 1.0),
            Err(Error::InvalidVarianceRatio(_))
        ));
        assert!(matches!(
            BiasRegularizer::new(sets, 0.5, -1.0),
            Err(Error::InvalidRegularizationWeight(_))
        ));
    }

    #[test]
    fn loss_is_non_negative_on_a_fresh_model() {
        let mut g = Graph::new();
        let mut rng = StdRng::seed_from_u64(5);
        let cfg = ModelConfig { kind: ModelKind::Lstm, ntoken: 6, ninp: 4, nhid: 4, nlayers: 1, dropout: 0.0, tied: false };
        let model = RnnModel::new(cfg, &mut g, &mut rng).unwrap();
        let sets = GenderWordSets::new(vec![(0, 1), (2, 3)], vec![4, 5]).unwrap();
        let reg = BiasRegularizer::new(sets, 0.5, 1.0).unwrap();
        let loss = reg.loss(&model, &mut g).unwrap();
        assert!(g.scalar(loss) >= 0.0);
        g.backward(loss);
        let w = model.embedding_weight();
        assert!(g.grad(w)[..16].iter().all(|&v| v == 0.0));
    }
}
