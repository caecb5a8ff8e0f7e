// ============================================================================
// CONFIGURATION
// ============================================================================

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::data::SPLIT_FILE;
use crate::error::{Error, Result};
use crate::model::{ModelConfig, ModelKind};

pub const MIN_TEMPERATURE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Device {
    Cpu,
    Accelerator,
}

impl Device {
    fn check(self) -> Result<()> {
        match self {
            Device::Cpu => Ok(()),
            Device::Accelerator => Err(Error::UnsupportedDevice("accelerator".into())),
        }
    }
}

/// RNN/LSTM language model training with optional bias regularization.
#[derive(Debug, Clone, Parser)]
#[command(name = "train")]
pub struct TrainConfig {
    /// Location of the data corpus (holds VOCAB.txt)
    #[arg(long, default_value = "./data/bbc/")]
    pub data: PathBuf,
    /// Document split written/reused when the corpus has no fixed splits
    #[arg(long, default_value = SPLIT_FILE)]
    pub split: PathBuf,
    /// Type of recurrent net
    #[arg(long, value_enum, default_value = "LSTM")]
    pub model: ModelKind,
    /// Size of word embeddings
    #[arg(long, default_value_t = 200)]
    pub emsize: usize,
    /// Number of hidden units per layer
    #[arg(long, default_value_t = 200)]
    pub nhid: usize,
    #[arg(long, default_value_t = 2)]
    pub nlayers: usize,
    /// Initial learning rate
    #[arg(long, default_value_t = 20.0)]
    pub lr: f32,
    /// Gradient clipping
    #[arg(long, default_value_t = 0.25)]
    pub clip: f32,
    #[arg(long, default_value_t = 40)]
    pub epochs: usize,
    #[arg(long = "batch-size", default_value_t = 20)]
    pub batch_size: usize,
    #[arg(long = "eval-batch-size", default_value_t = 10)]
    pub eval_batch_size: usize,
    /// Sequence length
    #[arg(long, default_value_t = 35)]
    pub bptt: usize,
    /// Penalize gender-neutral embeddings along the gender subspace
    #[arg(long = "bias-reg")]
    pub bias_reg: bool,
    #[arg(long = "bias-reg-factor", default_value_t = 1.0)]
    pub bias_reg_factor: f32,
    /// Share of pair variance the gender subspace has to capture
    #[arg(long = "bias-reg-var-ratio", default_value_t = 0.5)]
    pub bias_reg_var_ratio: f32,
    /// Dropout applied to layers (0 = no dropout)
    #[arg(long, default_value_t = 0.2)]
    pub dropout: f32,
    /// Tie the word embedding and softmax weights
    #[arg(long)]
    pub tied: bool,
    #[arg(long, default_value_t = 20180330)]
    pub seed: u64,
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: Device,
    #[arg(long = "log-interval", default_value_t = 200)]
    pub log_interval: usize,
    /// Path to save the final model
    #[arg(long, default_value = "model.pt")]
    pub save: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::parse_from(["train"])
    }
}

impl TrainConfig {
    pub fn model_config(&self, ntoken: usize) -> ModelConfig {
        ModelConfig {
            kind: self.model,
            ntoken,
            ninp: self.emsize,
            nhid: self.nhid,
            nlayers: self.nlayers,
            dropout: self.dropout,
            tied: self.tied,
        }
    }

    /// Everything that can be checked before the corpus is read.
    pub fn validate(&self) -> Result<()> {
        self.device.check()?;
        if !(self.bias_reg_var_ratio > 0.0 && self.bias_reg_var_ratio <= 1.0) {
            return Err(Error::InvalidVarianceRatio(self.bias_reg_var_ratio));
        }
        if !(self.bias_reg_factor >= 0.0 && self.bias_reg_factor.is_finite()) {
            return Err(Error::InvalidRegularizationWeight(self.bias_reg_factor));
        }
        if self.batch_size == 0 || self.eval_batch_size == 0 || self.bptt == 0 {
            return Err(Error::InvalidConfig(format!(
                "batch-size ({}), eval-batch-size ({}) and bptt ({}) must be non-zero",
                self.batch_size, self.eval_batch_size, self.bptt
            )));
        }
        if !(self.lr > 0.0 && self.clip > 0.0) {
            return Err(Error::InvalidConfig(format!("lr ({}) and clip ({}) must be positive", self.lr, self.clip)));
        }
        if self.log_interval == 0 {
            return Err(Error::InvalidConfig("log-interval must be non-zero".into()));
        }
        // sizes, dropout and tying; ntoken is checked once the vocabulary is known
        self.model_config(1).validate()
    }
}

/// Text generation from a trained checkpoint.
#[derive(Debug, Clone, Parser)]
#[command(name = "generate")]
pub struct GenerateConfig {
    /// Location of the data corpus (holds VOCAB.txt)
    #[arg(long, default_value = "./data/bbc/")]
    pub data: PathBuf,
    /// Model checkpoint to use
    #[arg(long, default_value = "./model.pt")]
    pub checkpoint: PathBuf,
    /// Output file for generated text
    #[arg(long, default_value = "generated.txt")]
    pub outf: PathBuf,
    /// Number of words to generate
    #[arg(long, default_value_t = 1000)]
    pub words: usize,
    #[arg(long, default_value_t = 1111)]
    pub seed: u64,
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: Device,
    /// Higher temperature increases diversity
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,
    #[arg(long = "log-interval", default_value_t = 100)]
    pub log_interval: usize,
    /// Keep the hidden state across <eos>
    #[arg(long = "no-sentence-reset")]
    pub no_sentence_reset: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self::parse_from(["generate"])
    }
}

impl GenerateConfig {
    pub fn validate(&self) -> Result<()> {
        self.device.check()?;
        check_temperature(self.temperature)?;
        if self.log_interval == 0 {
            return Err(Error::InvalidConfig("log-interval must be non-zero".into()));
        }
        Ok(())
    }
}

pub fn check_temperature(t: f32) -> Result<()> {
    if t >= MIN_TEMPERATURE {
        Ok(())
    } else {
        Err(Error::InvalidTemperature(t))
    }
}
