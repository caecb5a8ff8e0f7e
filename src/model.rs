// ============================================================================
// RECURRENT LANGUAGE MODEL
// Embedding -> stacked recurrent cells -> linear decoder over the vocabulary
// ============================================================================

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Graph, TID};

const INIT_RANGE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum ModelKind {
    #[value(name = "RNN_TANH")]
    RnnTanh,
    #[value(name = "RNN_RELU")]
    RnnRelu,
    #[value(name = "LSTM")]
    Lstm,
    #[value(name = "GRU")]
    Gru,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::RnnTanh => "RNN_TANH",
            ModelKind::RnnRelu => "RNN_RELU",
            ModelKind::Lstm => "LSTM",
            ModelKind::Gru => "GRU",
        };
        f.write_str(name)
    }
}

/// Everything needed to rebuild the parameter layout of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub kind: ModelKind,
    pub ntoken: usize,
    pub ninp: usize,
    pub nhid: usize,
    pub nlayers: usize,
    pub dropout: f32,
    pub tied: bool,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ntoken == 0 || self.ninp == 0 || self.nhid == 0 || self.nlayers == 0 {
            return Err(Error::InvalidConfig(format!(
                "model sizes must be non-zero (ntoken={}, emsize={}, nhid={}, nlayers={})",
                self.ntoken, self.ninp, self.nhid, self.nlayers
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!("dropout must lie in [0, 1), got {}", self.dropout)));
        }
        if self.tied && self.nhid != self.ninp {
            return Err(Error::TiedSizeMismatch { nhid: self.nhid, emsize: self.ninp });
        }
        Ok(())
    }
}

fn rand_uniform(n: usize, range: f32, rng: &mut impl Rng) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-range..range)).collect()
}

// ============================================================================
// EMBEDDING
// ============================================================================

struct Embedding { weight: TID, vocab_size: usize, embed_dim: usize }

impl Embedding {
    fn new(vocab_size: usize, embed_dim: usize, g: &mut Graph, rng: &mut impl Rng) -> Self {
        let weight = g.param(rand_uniform(vocab_size * embed_dim, INIT_RANGE, rng), vocab_size, embed_dim);
        Embedding { weight, vocab_size, embed_dim }
    }

    fn forward(&self, idx: &[usize], g: &mut Graph) -> TID {
        debug_assert!(idx.iter().all(|&i| i < self.vocab_size));
        g.gather_rows(self.weight, idx)
    }
}

// ============================================================================
// RECURRENT CELLS
// ============================================================================

/// `x @ w + h @ u + b`
struct Gate { w: TID, u: TID, b: TID }

impl Gate {
    fn new(input_size: usize, hidden_size: usize, g: &mut Graph, rng: &mut impl Rng) -> Self {
        let r = 1.0 / (hidden_size as f32).sqrt();
        let w = g.param(rand_uniform(input_size * hidden_size, r, rng), input_size, hidden_size);
        let u = g.param(rand_uniform(hidden_size * hidden_size, r, rng), hidden_size, hidden_size);
        let b = g.param(rand_uniform(hidden_size, r, rng), 1, hidden_size);
        Gate { w, u, b }
    }

    fn pre(&self, x: TID, h: TID, g: &mut Graph) -> TID {
        let wx = g.matmul(x, self.w);
        let uh = g.matmul(h, self.u);
        let s = g.add(wx, uh);
        g.broadcast_add(s, self.b)
    }

    fn param_ids(&self) -> [TID; 3] { [self.w, self.u, self.b] }
}

enum RecurrentCell {
    Elman { gate: Gate, relu: bool },
    Lstm { input: Gate, forget: Gate, cell: Gate, output: Gate },
    Gru { reset: Gate, update: Gate, cand: Gate },
}

impl RecurrentCell {
    fn new(kind: ModelKind, input_size: usize, hidden_size: usize, g: &mut Graph, rng: &mut impl Rng) -> Self {
        let mut gate = || Gate::new(input_size, hidden_size, &mut *g, &mut *rng);
        match kind {
            ModelKind::RnnTanh => RecurrentCell::Elman { gate: gate(), relu: false },
            ModelKind::RnnRelu => RecurrentCell::Elman { gate: gate(), relu: true },
            ModelKind::Lstm => RecurrentCell::Lstm { input: gate(), forget: gate(), cell: gate(), output: gate() },
            ModelKind::Gru => RecurrentCell::Gru { reset: gate(), update: gate(), cand: gate() },
        }
    }

    /// One time step. `c` is only present for LSTM.
    fn forward(&self, x: TID, h: TID, c: Option<TID>, g: &mut Graph) -> (TID, Option<TID>) {
        match self {
            RecurrentCell::Elman { gate, relu } => {
                let pre = gate.pre(x, h, g);
                let h_new = if *relu { g.relu(pre) } else { g.tanh_op(pre) };
                (h_new, None)
            }
            RecurrentCell::Lstm { input, forget, cell, output } => {
                let i_pre = input.pre(x, h, g);
                let i = g.sigmoid(i_pre);
                let f_pre = forget.pre(x, h, g);
                let f = g.sigmoid(f_pre);
                let c_pre = cell.pre(x, h, g);
                let c_cand = g.tanh_op(c_pre);
                let o_pre = output.pre(x, h, g);
                let o = g.sigmoid(o_pre);

                // c' = f*c + i*c_cand ; h' = o*tanh(c')
                let kept = c.map(|c_prev| g.mul(f, c_prev));
                let written = g.mul(i, c_cand);
                let c_new = match kept {
                    Some(k) => g.add(k, written),
                    None => written,
                };
                let c_act = g.tanh_op(c_new);
                let h_new = g.mul(o, c_act);
                (h_new, Some(c_new))
            }
            RecurrentCell::Gru { reset, update, cand } => {
                let z_pre = update.pre(x, h, g);
                let z = g.sigmoid(z_pre);
                let r_pre = reset.pre(x, h, g);
                let r = g.sigmoid(r_pre);

                // h_cand = tanh(x @ Wh + (r*h) @ Uh + bh)
                let rh = g.mul(r, h);
                let h_pre = cand.pre(x, rh, g);
                let h_cand = g.tanh_op(h_pre);

                // h = (1-z)*h_prev + z*h_cand
                let omz = g.one_minus(z);
                let h_part1 = g.mul(omz, h);
                let h_part2 = g.mul(z, h_cand);
                (g.add(h_part1, h_part2), None)
            }
        }
    }

    fn param_ids(&self) -> Vec<TID> {
        match self {
            RecurrentCell::Elman { gate, .. } => gate.param_ids().to_vec(),
            RecurrentCell::Lstm { input, forget, cell, output } => [input, forget, cell, output]
                .iter()
                .flat_map(|gate| gate.param_ids())
                .collect(),
            RecurrentCell::Gru { reset, update, cand } => [reset, update, cand]
                .iter()
                .flat_map(|gate| gate.param_ids())
                .collect(),
        }
    }
}

// ============================================================================
// HIDDEN STATE
// ============================================================================

/// Per-layer recurrent state held as plain data, `[batch, nhid]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerState {
    pub h: Vec<f32>,
    pub c: Option<Vec<f32>>,
}

/// Recurrent state owned by whichever loop is driving the model. It carries
/// values only; no gradient history crosses a `forward` call.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenState {
    pub batch: usize,
    pub layers: Vec<LayerState>,
}

pub struct ForwardResult {
    /// Logits `[batch, ntoken]` for every input step.
    pub outputs: Vec<TID>,
    pub hidden: HiddenState,
}

// ============================================================================
// MODEL
// ============================================================================

pub struct RnnModel {
    config: ModelConfig,
    embedding: Embedding,
    layers: Vec<RecurrentCell>,
    decoder_weight: Option<TID>,
    decoder_bias: TID,
    training: bool,
}

impl RnnModel {
    /// Registers all parameters on `g`. Call on a graph with no activations.
    pub fn new(config: ModelConfig, g: &mut Graph, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let embedding = Embedding::new(config.ntoken, config.ninp, g, rng);
        let layers = (0..config.nlayers)
            .map(|i| {
                let inp = if i == 0 { config.ninp } else { config.nhid };
                RecurrentCell::new(config.kind, inp, config.nhid, g, rng)
            })
            .collect();
        let decoder_weight = if config.tied {
            None
        } else {
            Some(g.param(rand_uniform(config.nhid * config.ntoken, INIT_RANGE, rng), config.nhid, config.ntoken))
        };
        let decoder_bias = g.param(vec![0.0; config.ntoken], 1, config.ntoken);
        Ok(RnnModel { config, embedding, layers, decoder_weight, decoder_bias, training: true })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn ntoken(&self) -> usize {
        self.config.ntoken
    }

    /// The embedding matrix `W`, `[ntoken, emsize]`.
    pub fn embedding_weight(&self) -> TID {
        self.embedding.weight
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding.embed_dim
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Parameters in a fixed order; checkpoints rely on it.
    pub fn param_ids(&self) -> Vec<TID> {
        let mut ids = vec![self.embedding.weight];
        for layer in &self.layers {
            ids.extend(layer.param_ids());
        }
        if let Some(w) = self.decoder_weight {
            ids.push(w);
        }
        ids.push(self.decoder_bias);
        ids
    }

    pub fn total_params(&self, g: &Graph) -> usize {
        self.param_ids().iter().map(|&t| g.data(t).len()).sum()
    }

    pub fn init_hidden(&self, batch: usize) -> HiddenState {
        let n = batch * self.config.nhid;
        let with_cell = self.config.kind == ModelKind::Lstm;
        HiddenState {
            batch,
            layers: (0..self.config.nlayers)
                .map(|_| LayerState { h: vec![0.0; n], c: with_cell.then(|| vec![0.0; n]) })
                .collect(),
        }
    }

    fn dropout(&self, x: TID, g: &mut Graph, rng: &mut impl Rng) -> TID {
        let p = self.config.dropout;
        if !self.training || p <= 0.0 {
            return x;
        }
        let keep = 1.0 / (1.0 - p);
        let n = g.data(x).len();
        let mask: Vec<f32> = (0..n).map(|_| if rng.gen::<f32>() < p { 0.0 } else { keep }).collect();
        let m = g.constant(mask, g.rows(x), g.cols(x));
        g.mul(x, m)
    }

    /// Runs `inputs[t][b]` through the network. The incoming state enters the
    /// graph as a constant, so backpropagation stops at the window start;
    /// inside the window gradients flow through time.
    pub fn forward(
        &self,
        inputs: &[Vec<usize>],
        hidden: HiddenState,
        g: &mut Graph,
        rng: &mut impl Rng,
    ) -> ForwardResult {
        let batch = hidden.batch;
        let nhid = self.config.nhid;
        let mut hs: Vec<TID> = Vec::with_capacity(self.layers.len());
        let mut cs: Vec<Option<TID>> = Vec::with_capacity(self.layers.len());
        for layer in hidden.layers {
            hs.push(g.constant(layer.h, batch, nhid));
            cs.push(layer.c.map(|c| g.constant(c, batch, nhid)));
        }

        let decoder = match self.decoder_weight {
            Some(w) => w,
            None => g.transpose(self.embedding.weight),
        };

        let mut outputs = Vec::with_capacity(inputs.len());
        for tokens in inputs {
            debug_assert_eq!(tokens.len(), batch);
            let emb = self.embedding.forward(tokens, g);
            let mut x = self.dropout(emb, g, rng);
            for (l, cell) in self.layers.iter().enumerate() {
                let (h, c) = cell.forward(x, hs[l], cs[l], g);
                hs[l] = h;
                cs[l] = c;
                x = self.dropout(h, g, rng);
            }
            let proj = g.matmul(x, decoder);
            outputs.push(g.broadcast_add(proj, self.decoder_bias));
        }

        let layers = hs
            .iter()
            .zip(cs.iter())
            .map(|(&h, c)| LayerState { h: g.data(h).to_vec(), c: c.map(|c| g.data(c).to_vec()) })
            .collect();
        ForwardResult { outputs, hidden: HiddenState { batch, layers } }
    }

    /// Single-token step for batch size 1. Clears activations first.
    pub fn step(&self, token: usize, hidden: HiddenState, g: &mut Graph, rng: &mut impl Rng) -> (Vec<f32>, HiddenState) {
        g.reset();
        let res = self.forward(&[vec![token]], hidden, g, rng);
        let logits = g.data(res.outputs[0]).to_vec();
        (logits, res.hidden)
    }

    /// Mean cross-entropy over every (step, batch) position.
    pub fn cross_entropy_loss(&self, outputs: &[TID], targets: &[Vec<usize>], g: &mut Graph) -> TID {
        let count: usize = targets.iter().map(Vec::len).sum();
        let mut total = g.softmax_ce(outputs[0], &targets[0]);
        for (out, tgt) in outputs.iter().zip(targets).skip(1) {
            let ce = g.softmax_ce(*out, tgt);
            total = g.add(total, ce);
        }
        g.scalar_div(total, count as f32)
    }
}
