// ============================================================================
// DATA PREPARATION
// Vocabulary file, corpus splits, batchify and bptt windows
// ============================================================================

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

pub const EOS: &str = "<eos>";
pub const UNK: &str = "<unk>";
pub const VOCAB_FILE: &str = "VOCAB.txt";
pub const SPLIT_FILE: &str = "split.json";

/// Stable word <-> index mapping read from a newline-delimited token list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    word2idx: HashMap<String, usize>,
    idx2word: Vec<String>,
}

impl Vocabulary {
    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(words.into_iter().map(Into::into), Path::new("<memory>"))
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::data_file(path, e))?;
        let words = text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);
        Self::build(words, path)
    }

    fn build(words: impl Iterator<Item = String>, path: &Path) -> Result<Self> {
        let mut vocab = Vocabulary { word2idx: HashMap::new(), idx2word: Vec::new() };
        for word in words {
            if vocab.word2idx.contains_key(&word) {
                return Err(Error::DuplicateToken { path: path.to_path_buf(), word });
            }
            vocab.push(word);
        }
        if vocab.idx2word.is_empty() {
            return Err(Error::EmptyVocabulary { path: path.to_path_buf() });
        }
        if !vocab.word2idx.contains_key(EOS) {
            vocab.push(EOS.to_string());
        }
        Ok(vocab)
    }

    fn push(&mut self, word: String) {
        self.word2idx.insert(word.clone(), self.idx2word.len());
        self.idx2word.push(word);
    }

    pub fn len(&self) -> usize {
        self.idx2word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2word.is_empty()
    }

    pub fn index(&self, word: &str) -> Option<usize> {
        self.word2idx.get(word).copied()
    }

    pub fn word(&self, idx: usize) -> Option<&str> {
        self.idx2word.get(idx).map(String::as_str)
    }

    pub fn eos(&self) -> Option<usize> {
        self.index(EOS)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.idx2word.iter().enumerate().map(|(i, w)| (i, w.as_str()))
    }

    /// Maps every whitespace token of every line to its id, terminating each
    /// line with `<eos>`.
    pub fn tokenize(&self, text: &str, source: &Path) -> Result<Vec<usize>> {
        let unk = self.index(UNK);
        let eos = self.eos().unwrap_or(self.len() - 1);
        let mut ids = Vec::new();
        for line in text.lines() {
            let mut words = line.split_whitespace().peekable();
            if words.peek().is_none() {
                continue;
            }
            for word in words {
                match self.index(word).or(unk) {
                    Some(id) => ids.push(id),
                    None => {
                        return Err(Error::UnknownWord {
                            path: source.to_path_buf(),
                            word: word.to_string(),
                        })
                    }
                }
            }
            ids.push(eos);
        }
        Ok(ids)
    }

    pub fn tokenize_file(&self, path: &Path) -> Result<Vec<usize>> {
        let text = fs::read_to_string(path).map_err(|e| Error::data_file(path, e))?;
        self.tokenize(&text, path)
    }
}

/// Document names assigned to each split when the corpus is a directory of
/// documents rather than three split files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIndex {
    pub train: Vec<String>,
    pub valid: Vec<String>,
    pub test: Vec<String>,
}

impl SplitIndex {
    /// Shuffles `docs` with `rng`, holds out 10% for test and 20% of the rest
    /// for validation. Held-out counts round up.
    pub fn shuffle_split(mut docs: Vec<String>, rng: &mut StdRng) -> Self {
        docs.sort();
        docs.shuffle(rng);
        let n_test = held_out(docs.len(), 0.1);
        let test = docs.split_off(docs.len() - n_test);
        let n_valid = held_out(docs.len(), 0.2);
        let valid = docs.split_off(docs.len() - n_valid);
        SplitIndex { train: docs, valid, test }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("split index: {e}")))?;
        fs::write(path, json).map_err(|e| Error::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::data_file(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("malformed split index {}: {e}", path.display())))
    }
}

fn held_out(n: usize, fraction: f64) -> usize {
    if n < 2 {
        return 0;
    }
    ((n as f64 * fraction).ceil() as usize).min(n - 1)
}

/// Token streams of the three splits.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub vocab: Vocabulary,
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
    pub test: Vec<usize>,
}

impl Corpus {
    /// Loads `<dir>/VOCAB.txt` and the splits.
    ///
    /// Prefers `train.txt`/`valid.txt`/`test.txt`. Otherwise the `*.txt`
    /// documents of `<dir>/data/` are split with `rng`, and the assignment is
    /// written to `split_path` for later runs. An existing `split_path` is
    /// reused instead of reshuffling.
    pub fn load(dir: &Path, split_path: &Path, rng: &mut StdRng) -> Result<Self> {
        let vocab = Vocabulary::read(dir.join(VOCAB_FILE))?;

        let files = ["train.txt", "valid.txt", "test.txt"].map(|f| dir.join(f));
        if files.iter().all(|f| f.is_file()) {
            let corpus = Corpus {
                train: vocab.tokenize_file(&files[0])?,
                valid: vocab.tokenize_file(&files[1])?,
                test: vocab.tokenize_file(&files[2])?,
                vocab,
            };
            corpus.log_sizes();
            return Ok(corpus);
        }

        let doc_dir = dir.join("data");
        let split = if split_path.is_file() {
            SplitIndex::load(split_path)?
        } else {
            let docs = list_documents(&doc_dir)?;
            if docs.is_empty() {
                return Err(Error::MissingCorpus(dir.to_path_buf()));
            }
            let split = SplitIndex::shuffle_split(docs, rng);
            split.save(split_path)?;
            split
        };

        let read_all = |names: &[String]| -> Result<Vec<usize>> {
            let mut ids = Vec::new();
            for name in names {
                ids.extend(vocab.tokenize_file(&doc_dir.join(name))?);
            }
            Ok(ids)
        };
        let corpus = Corpus {
            train: read_all(&split.train)?,
            valid: read_all(&split.valid)?,
            test: read_all(&split.test)?,
            vocab: vocab.clone(),
        };
        corpus.log_sizes();
        Ok(corpus)
    }

    fn log_sizes(&self) {
        info!(
            vocab = self.vocab.len(),
            train = self.train.len(),
            valid = self.valid.len(),
            test = self.test.len(),
            "loaded corpus"
        );
    }
}

fn list_documents(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| Error::data_file(dir, e))?;
    let mut docs = Vec::new();
    for entry in entries {
        let path: PathBuf = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "txt") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                docs.push(name.to_string());
            }
        }
    }
    Ok(docs)
}

/// A token stream laid out time-major: `rows` steps of `cols` parallel streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batched {
    data: Vec<usize>,
    rows: usize,
    cols: usize,
}

impl Batched {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[usize] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Window starting at row `i`: inputs are rows `[i, i+len)`, targets are
    /// the following rows, `len = min(bptt, rows - 1 - i)`.
    pub fn window(&self, i: usize, bptt: usize) -> Window {
        let len = bptt.min(self.rows - 1 - i);
        Window {
            inputs: (i..i + len).map(|r| self.row(r).to_vec()).collect(),
            targets: (i + 1..i + 1 + len).map(|r| self.row(r).to_vec()).collect(),
        }
    }

    /// Start rows of consecutive non-overlapping windows.
    pub fn window_starts(&self, bptt: usize) -> impl Iterator<Item = usize> {
        (0..self.rows.saturating_sub(1)).step_by(bptt.max(1))
    }
}

/// One bptt window: `inputs[t][b]` predicts `targets[t][b]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub inputs: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Divides `tokens` into `bsz` contiguous streams, trimming the remainder.
/// Stream `b` holds tokens `[b*n, (b+1)*n)` and becomes column `b`.
pub fn batchify(tokens: &[usize], bsz: usize, split: &'static str) -> Result<Batched> {
    let nbatch = if bsz == 0 { 0 } else { tokens.len() / bsz };
    if nbatch < 2 {
        return Err(Error::SplitTooSmall { split, tokens: tokens.len(), batch_size: bsz });
    }
    let mut data = vec![0usize; nbatch * bsz];
    for b in 0..bsz {
        for t in 0..nbatch {
            data[t * bsz + b] = tokens[b * nbatch + t];
        }
    }
    Ok(Batched { data, rows: nbatch, cols: bsz })
}
