use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by training, generation and the bias measurements.
///
/// Everything except the i/o, checkpoint and numeric variants is a
/// configuration problem detected before any compute starts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("temperature has to be greater or equal 1e-3, got {0}")]
    InvalidTemperature(f32),
    #[error("bias regularization variance ratio must lie in (0, 1], got {0}")]
    InvalidVarianceRatio(f32),
    #[error("bias regularization factor must be non-negative, got {0}")]
    InvalidRegularizationWeight(f32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("when using the tied flag, nhid ({nhid}) must be equal to emsize ({emsize})")]
    TiedSizeMismatch { nhid: usize, emsize: usize },
    #[error("device '{0}' is not available in this build (only the cpu backend is compiled in)")]
    UnsupportedDevice(String),

    #[error("vocabulary {path} is empty")]
    EmptyVocabulary { path: PathBuf },
    #[error("vocabulary {path} lists '{word}' more than once")]
    DuplicateToken { path: PathBuf, word: String },
    #[error("word '{word}' in {path} is not in the vocabulary and no <unk> token exists")]
    UnknownWord { path: PathBuf, word: String },
    #[error("cannot read data file {path}: {source}")]
    DataFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no corpus found under {0} (expected train.txt/valid.txt/test.txt or data/*.txt)")]
    MissingCorpus(PathBuf),
    #[error("{split} split has {tokens} tokens, too few for batch size {batch_size}")]
    SplitTooSmall { split: &'static str, tokens: usize, batch_size: usize },

    #[error("no gender word pair is present in the vocabulary")]
    EmptyGenderPairs,
    #[error("gender subspace is empty for variance ratio {0}")]
    EmptySubspace(f32),
    #[error("gender covariance has no variance; paired embeddings are identical")]
    DegenerateCovariance,
    #[error("eigendecomposition failed: {0}")]
    Decomposition(String),
    #[error("cannot sample from the output distribution: {0}")]
    Sampling(#[from] rand::distributions::WeightedError),

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Stream(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub(crate) fn data_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::DataFile { path: path.into(), source }
    }

    /// True for failures that are detected before any compute begins.
    pub fn is_config(&self) -> bool {
        !matches!(
            self,
            Error::Io { .. }
                | Error::Stream(_)
                | Error::Checkpoint { .. }
                | Error::Decomposition(_)
                | Error::DegenerateCovariance
                | Error::Sampling(_)
        )
    }
}
