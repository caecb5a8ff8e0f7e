// ============================================================================
// TRAINING LOOP
// truncated BPTT, optional bias penalty, global-norm clipping, plain SGD
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::TrainConfig;
use crate::data::{batchify, Batched, Corpus, Vocabulary};
use crate::error::Result;
use crate::graph::{Graph, TID};
use crate::model::RnnModel;
use crate::ops::{sum_squares, vec_axpy_inplace, vec_scale_inplace};
use crate::regularizer::BiasRegularizer;
use crate::subspace::GenderWordSets;

const ANNEAL_FACTOR: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainStatus {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub status: TrainStatus,
    pub epochs_run: usize,
    pub checkpoints_written: usize,
    pub best_val_loss: Option<f32>,
    pub final_lr: f32,
    pub test_loss: f32,
}

impl TrainOutcome {
    pub fn test_ppl(&self) -> f32 {
        self.test_loss.exp()
    }
}

/// Scales every gradient by `max_norm / ‖g‖` when the global L2 norm exceeds
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(g: &mut Graph, params: &[TID], max_norm: f32) -> f32 {
    let norm = params.iter().map(|&t| sum_squares(g.grad(t))).sum::<f32>().sqrt();
    if norm > max_norm {
        let s = max_norm / (norm + 1e-6);
        for &t in params {
            let (_, grad) = g.data_and_grad_mut(t);
            vec_scale_inplace(grad, s);
        }
    }
    norm
}

/// `p -= lr * grad` for every parameter.
pub fn sgd_step(g: &mut Graph, params: &[TID], lr: f32) {
    for &t in params {
        let (data, grad) = g.data_and_grad_mut(t);
        vec_axpy_inplace(data, lr, grad);
    }
}

pub struct Trainer {
    config: TrainConfig,
    g: Graph,
    model: RnnModel,
    regularizer: Option<BiasRegularizer>,
    rng: StdRng,
    lr: f32,
    best_val_loss: Option<f32>,
    interrupt: Arc<AtomicBool>,
}

impl Trainer {
    /// Builds the model for `vocab` and, when enabled, the bias regularizer.
    /// All configuration checks happen here, before any compute.
    pub fn new(config: TrainConfig, vocab: &Vocabulary, mut rng: StdRng, interrupt: Arc<AtomicBool>) -> Result<Self> {
        config.validate()?;
        let regularizer = if config.bias_reg {
            let sets = GenderWordSets::from_vocab(vocab)?;
            info!(pairs = sets.pairs().len(), neutral = sets.neutral().len(), "bias regularization enabled");
            Some(BiasRegularizer::new(sets, config.bias_reg_var_ratio, config.bias_reg_factor)?)
        } else {
            None
        };
        let mut g = Graph::new();
        let model = RnnModel::new(config.model_config(vocab.len()), &mut g, &mut rng)?;
        info!(
            model = %config.model,
            params = model.total_params(&g),
            emsize = config.emsize,
            nhid = config.nhid,
            nlayers = config.nlayers,
            "built model"
        );
        let lr = config.lr;
        Ok(Trainer { config, g, model, regularizer, rng, lr, best_val_loss: None, interrupt })
    }

    pub fn model(&self) -> &RnnModel {
        &self.model
    }

    pub fn graph(&self) -> &Graph {
        &self.g
    }

    /// Runs every epoch, then reloads the best checkpoint (or keeps the
    /// in-memory model if none was written) and scores the test split.
    pub fn run(&mut self, corpus: &Corpus) -> Result<TrainOutcome> {
        let train = batchify(&corpus.train, self.config.batch_size, "train")?;
        let valid = batchify(&corpus.valid, self.config.eval_batch_size, "valid")?;
        let test = batchify(&corpus.test, self.config.eval_batch_size, "test")?;

        let mut status = TrainStatus::Completed;
        let mut epochs_run = 0;
        let mut checkpoints_written = 0;

        for epoch in 1..=self.config.epochs {
            if self.interrupt.load(Ordering::SeqCst) {
                warn!("Exiting from training early");
                status = TrainStatus::Interrupted;
                break;
            }
            let epoch_start = Instant::now();
            self.train_epoch(epoch, &train)?;
            let val_loss = self.evaluate(&valid);
            epochs_run = epoch;
            info!(
                "| end of epoch {:3} | time: {:5.2}s | valid loss {:5.2} | valid ppl {:8.2}",
                epoch,
                epoch_start.elapsed().as_secs_f64(),
                val_loss,
                val_loss.exp()
            );

            if self.best_val_loss.map_or(true, |best| val_loss < best) {
                let meta = CheckpointMeta { epoch, val_loss, lr: self.lr };
                checkpoint::save(&self.config.save, &self.model, &self.g, Some(&meta))?;
                checkpoints_written += 1;
                self.best_val_loss = Some(val_loss);
            } else {
                self.lr /= ANNEAL_FACTOR;
                info!(lr = self.lr, "no improvement on validation, annealing learning rate");
            }
        }

        if checkpoints_written > 0 {
            let (g, model) = checkpoint::load(&self.config.save)?;
            self.g = g;
            self.model = model;
        } else {
            warn!("no checkpoint was written, evaluating the current model");
        }

        let test_loss = self.evaluate(&test);
        info!(
            "| End of training | test loss {:5.2} | test ppl {:8.2}",
            test_loss,
            test_loss.exp()
        );
        Ok(TrainOutcome {
            status,
            epochs_run,
            checkpoints_written,
            best_val_loss: self.best_val_loss,
            final_lr: self.lr,
            test_loss,
        })
    }

    /// One pass over `train` in bptt windows. Returns the mean window loss,
    /// bias penalty included.
    pub fn train_epoch(&mut self, epoch: usize, train: &Batched) -> Result<f32> {
        self.model.train();
        let bptt = self.config.bptt;
        let log_interval = self.config.log_interval;
        let params = self.model.param_ids();
        let mut hidden = self.model.init_hidden(train.cols());

        let mut interval_loss = 0.0f32;
        let mut epoch_loss = 0.0f32;
        let mut windows = 0usize;
        let mut start = Instant::now();

        for (batch, i) in train.window_starts(bptt).enumerate() {
            let window = train.window(i, bptt);
            self.g.reset();
            self.g.zero_grad();

            let res = self.model.forward(&window.inputs, hidden, &mut self.g, &mut self.rng);
            hidden = res.hidden;
            let loss = self.model.cross_entropy_loss(&res.outputs, &window.targets, &mut self.g);
            let mut step_loss = self.g.scalar(loss);
            self.g.backward(loss);

            // separate pass so its gradient accumulates on top before clipping
            if let Some(reg) = &self.regularizer {
                self.g.reset();
                let bias = reg.loss(&self.model, &mut self.g)?;
                step_loss += self.g.scalar(bias);
                self.g.backward(bias);
            }

            clip_grad_norm(&mut self.g, &params, self.config.clip);
            sgd_step(&mut self.g, &params, self.lr);

            interval_loss += step_loss;
            epoch_loss += step_loss;
            windows += 1;

            if batch % log_interval == 0 && batch > 0 {
                let cur_loss = interval_loss / log_interval as f32;
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "| epoch {:3} | {:5}/{:5} batches | lr {:02.2} | ms/batch {:5.2} | loss {:5.2} | ppl {:8.2}",
                    epoch,
                    batch,
                    train.rows() / bptt,
                    self.lr,
                    elapsed * 1000.0 / log_interval as f64,
                    cur_loss,
                    cur_loss.exp()
                );
                interval_loss = 0.0;
                start = Instant::now();
            }
        }
        self.g.reset();
        Ok(epoch_loss / windows.max(1) as f32)
    }

    /// Mean next-token cross-entropy over `data` in eval mode. The hidden
    /// state is carried across windows and never reset.
    pub fn evaluate(&mut self, data: &Batched) -> f32 {
        self.model.eval();
        let bptt = self.config.bptt;
        let mut hidden = self.model.init_hidden(data.cols());
        let mut total = 0.0f64;
        let mut steps = 0usize;
        for i in data.window_starts(bptt) {
            let window = data.window(i, bptt);
            self.g.reset();
            let res = self.model.forward(&window.inputs, hidden, &mut self.g, &mut self.rng);
            hidden = res.hidden;
            let loss = self.model.cross_entropy_loss(&res.outputs, &window.targets, &mut self.g);
            total += window.len() as f64 * self.g.scalar(loss) as f64;
            steps += window.len();
        }
        self.g.reset();
        (total / steps.max(1) as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn clipping_rescales_to_max_norm() {
        let mut g = Graph::new();
        let a = g.param(vec![0.0; 2], 1, 2);
        let b = g.param(vec![0.0; 1], 1, 1);
        let c = g.constant(vec![3.0, 0.0], 1, 2);
        let d = g.constant(vec![4.0], 1, 1);
        // d(sum(a*c) + sum(b*d)) = (c, d), norm 5
        let ac = g.mul(a, c);
        let bd = g.mul(b, d);
        let s1 = g.sum_all(ac);
        let s2 = g.sum_all(bd);
        let loss = g.add(s1, s2);
        g.backward(loss);

        let norm = clip_grad_norm(&mut g, &[a, b], 1.0);
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped = (sum_squares(g.grad(a)) + sum_squares(g.grad(b))).sqrt();
        assert!((clipped - 1.0).abs() < 1e-4);

        let untouched = clip_grad_norm(&mut g, &[a, b], 10.0);
        assert!((untouched - clipped).abs() < 1e-6);
    }

    #[test]
    fn sgd_moves_against_the_gradient() {
        let mut g = Graph::new();
        let a = g.param(vec![1.0, 1.0], 1, 2);
        let c = g.constant(vec![2.0, -1.0], 1, 2);
        let ac = g.mul(a, c);
        let loss = g.sum_all(ac);
        g.backward(loss);
        sgd_step(&mut g, &[a], 0.5);
        assert_eq!(g.data(a), &[0.0, 1.5]);
    }

    fn toy_vocab() -> Vocabulary {
        Vocabulary::from_words(["the", "cat", "she", "he", "<eos>"]).unwrap()
    }

    fn toy_config(dir: &std::path::Path) -> TrainConfig {
        TrainConfig {
            emsize: 4,
            nhid: 4,
            nlayers: 1,
            epochs: 1,
            batch_size: 1,
            eval_batch_size: 1,
            bptt: 2,
            lr: 1.0,
            dropout: 0.0,
            log_interval: 1,
            save: dir.join("model.pt"),
            ..TrainConfig::default()
        }
    }

    fn toy_corpus(vocab: &Vocabulary) -> Corpus {
        let src = std::path::Path::new("toy");
        Corpus {
            vocab: vocab.clone(),
            train: vocab.tokenize("the cat\nshe the cat\nhe the cat\n", src).unwrap(),
            valid: vocab.tokenize("she the cat\n", src).unwrap(),
            test: vocab.tokenize("he the cat\n", src).unwrap(),
        }
    }

    #[test]
    fn bias_penalty_contributes_to_the_update() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = toy_vocab();
        let corpus = toy_corpus(&vocab);
        let train = batchify(&corpus.train, 1, "train").unwrap();
        let interrupt = Arc::new(AtomicBool::new(false));

        let plain = toy_config(dir.path());
        let biased = TrainConfig { bias_reg: true, bias_reg_factor: 10.0, ..plain.clone() };

        let mut a = Trainer::new(plain, &vocab, StdRng::seed_from_u64(7), interrupt.clone()).unwrap();
        let mut b = Trainer::new(biased, &vocab, StdRng::seed_from_u64(7), interrupt).unwrap();
        let loss_a = a.train_epoch(1, &train).unwrap();
        let loss_b = b.train_epoch(1, &train).unwrap();
        assert!(loss_a.is_finite() && loss_b.is_finite());

        let w = a.model().embedding_weight();
        assert_ne!(a.graph().data(w), b.graph().data(w));
    }

    #[test]
    fn annealing_divides_learning_rate_by_four() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = toy_vocab();
        let corpus = toy_corpus(&vocab);
        let cfg = TrainConfig { epochs: 2, ..toy_config(dir.path()) };
        let mut t = Trainer::new(cfg, &vocab, StdRng::seed_from_u64(3), Arc::new(AtomicBool::new(false))).unwrap();
        // a best loss no epoch can beat forces the anneal branch
        t.best_val_loss = Some(f32::NEG_INFINITY);
        let outcome = t.run(&corpus).unwrap();
        assert_eq!(outcome.checkpoints_written, 0);
        assert_eq!(outcome.final_lr, 1.0 / 16.0);
    }
}
