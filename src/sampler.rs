// ============================================================================
// GENERATION
// ============================================================================

use std::io::Write;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::info;

use crate::config::{check_temperature, GenerateConfig};
use crate::data::Vocabulary;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::model::{HiddenState, RnnModel};
use crate::ops::vec_max;

const WORDS_PER_LINE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    pub words: usize,
    pub temperature: f32,
    /// Reset the hidden state after every `<eos>`.
    pub sentence_reset: bool,
    pub log_interval: usize,
}

impl From<&GenerateConfig> for SampleOptions {
    fn from(c: &GenerateConfig) -> Self {
        SampleOptions {
            words: c.words,
            temperature: c.temperature,
            sentence_reset: !c.no_sentence_reset,
            log_interval: c.log_interval,
        }
    }
}

/// Sampled token ids, plus the same ids cut into sentences at `<eos>`.
/// The last sentence may lack the terminator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Generation {
    pub tokens: Vec<usize>,
    pub sentences: Vec<Vec<usize>>,
}

impl Generation {
    pub fn sentence_words<'v>(&self, vocab: &'v Vocabulary) -> Vec<Vec<&'v str>> {
        self.sentences
            .iter()
            .map(|s| s.iter().filter_map(|&id| vocab.word(id)).collect())
            .collect()
    }
}

/// Draws one index with probability proportional to `exp(logit / t)`.
pub fn sample_token(logits: &[f32], temperature: f32, rng: &mut impl Rng) -> Result<usize> {
    let max = vec_max(logits);
    let weights: Vec<f32> = logits.iter().map(|&l| ((l - max) / temperature).exp()).collect();
    let dist = WeightedIndex::new(&weights)?;
    Ok(dist.sample(rng))
}

/// State fed to the step after `idx`: a fresh zero state when `idx` ends a
/// sentence and resets are on, the carried state otherwise.
fn carry_hidden(model: &RnnModel, idx: usize, eos: Option<usize>, sentence_reset: bool, hidden: HiddenState) -> HiddenState {
    if sentence_reset && Some(idx) == eos {
        model.init_hidden(1)
    } else {
        hidden
    }
}

/// Autoregressively samples `opts.words` tokens and writes them to `out`,
/// a newline after every twentieth word and a space otherwise.
pub fn generate<W: Write>(
    model: &mut RnnModel,
    g: &mut Graph,
    vocab: &Vocabulary,
    opts: &SampleOptions,
    rng: &mut impl Rng,
    out: &mut W,
) -> Result<Generation> {
    check_temperature(opts.temperature)?;
    if model.ntoken() != vocab.len() {
        return Err(Error::InvalidConfig(format!(
            "checkpoint was trained on {} tokens but the vocabulary has {}",
            model.ntoken(),
            vocab.len()
        )));
    }
    model.eval();
    let eos = vocab.eos();
    let log_interval = opts.log_interval.max(1);

    let mut hidden = model.init_hidden(1);
    let mut input = rng.gen_range(0..model.ntoken());
    let mut result = Generation::default();
    let mut sentence = Vec::new();

    for i in 0..opts.words {
        let (logits, next) = model.step(input, hidden, g, rng);
        let idx = sample_token(&logits, opts.temperature, rng)?;
        hidden = carry_hidden(model, idx, eos, opts.sentence_reset, next);
        input = idx;
        result.tokens.push(idx);
        sentence.push(idx);

        let word = vocab.word(idx).unwrap_or_default();
        let sep = if (i + 1) % WORDS_PER_LINE == 0 { '\n' } else { ' ' };
        write!(out, "{word}{sep}")?;

        if Some(idx) == eos {
            result.sentences.push(std::mem::take(&mut sentence));
        }

        if i % log_interval == 0 {
            info!("| Generated {}/{} words", i, opts.words);
        }
    }
    if !sentence.is_empty() {
        result.sentences.push(sentence);
    }
    out.flush()?;
    g.reset();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (Graph, RnnModel, Vocabulary) {
        let vocab = Vocabulary::from_words(["the", "cat", "she", "he", "<eos>"]).unwrap();
        let mut g = Graph::new();
        let cfg = ModelConfig { kind: ModelKind::Lstm, ntoken: vocab.len(), ninp: 6, nhid: 6, nlayers: 2, dropout: 0.3, tied: false };
        let model = RnnModel::new(cfg, &mut g, &mut StdRng::seed_from_u64(42)).unwrap();
        (g, model, vocab)
    }

    fn opts(words: usize) -> SampleOptions {
        SampleOptions { words, temperature: 1.0, sentence_reset: true, log_interval: 100 }
    }

    #[test]
    fn same_seed_gives_identical_text() {
        let (mut g, mut model, vocab) = setup();
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        let a = generate(&mut model, &mut g, &vocab, &opts(20), &mut StdRng::seed_from_u64(1111), &mut out_a).unwrap();
        let b = generate(&mut model, &mut g, &vocab, &opts(20), &mut StdRng::seed_from_u64(1111), &mut out_b).unwrap();
        assert_eq!(a, b);
        assert_eq!(out_a, out_b);
        assert_eq!(a.tokens.len(), 20);

        let text = String::from_utf8(out_a).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert_eq!(text.split_whitespace().count(), 20);
    }

    #[test]
    fn sentences_partition_the_tokens() {
        let (mut g, mut model, vocab) = setup();
        let gen = generate(&mut model, &mut g, &vocab, &opts(60), &mut StdRng::seed_from_u64(5), &mut Vec::new()).unwrap();
        let flat: Vec<usize> = gen.sentences.iter().flatten().copied().collect();
        assert_eq!(flat, gen.tokens);
        let eos = vocab.eos().unwrap();
        let (last, complete) = gen.sentences.split_last().unwrap();
        assert!(complete.iter().all(|s| s.last() == Some(&eos)));
        assert!(last.iter().rev().skip(1).all(|&t| t != eos));
    }

    #[test]
    fn eos_resets_hidden_state_only_when_enabled() {
        let (mut g, mut model, vocab) = setup();
        model.eval();
        let eos = vocab.eos();
        let cat = vocab.index("cat").unwrap();
        let fresh = model.init_hidden(1);
        let (_, stepped) = model.step(cat, fresh.clone(), &mut g, &mut StdRng::seed_from_u64(0));
        assert_ne!(stepped, fresh);

        let reset = carry_hidden(&model, eos.unwrap(), eos, true, stepped.clone());
        assert_eq!(reset, fresh);

        let kept = carry_hidden(&model, eos.unwrap(), eos, false, stepped.clone());
        assert_eq!(kept, stepped);
        assert_ne!(kept, fresh);

        let mid_sentence = carry_hidden(&model, cat, eos, true, stepped.clone());
        assert_eq!(mid_sentence, stepped);
    }

    #[test]
    fn low_temperature_is_rejected_before_sampling() {
        let (mut g, mut model, vocab) = setup();
        let bad = SampleOptions { temperature: 1e-4, ..opts(5) };
        let mut out = Vec::new();
        let err = generate(&mut model, &mut g, &vocab, &bad, &mut StdRng::seed_from_u64(0), &mut out).unwrap_err();
        assert!(matches!(err, Error::InvalidTemperature(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn near_zero_temperature_picks_the_argmax() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(sample_token(&[0.1, 2.0, 1.9, -4.0], 1e-3, &mut rng).unwrap(), 1);
        }
    }
}
