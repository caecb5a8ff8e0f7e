//! Gender co-occurrence statistics over generated sentences.
//!
//! Every non-gendered word occurrence co-occurs once with each female and
//! each male word occurrence in the same sentence. From those counts:
//!
//! * `bias`: mean over words seen with both genders of `|ln(P(w|f) / P(w|m))|`
//!   where `P(w|g)` is normalized by the total co-occurrence count of `g`.
//! * `bias_norm`: the same mean, normalized by the number of `g` words in the
//!   text instead, which cancels gender-word frequency imbalance.
//! * `gdd`: Jensen-Shannon divergence between `P(.|f)` and `P(.|m)`.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::data::EOS;
use crate::subspace::{female_words, is_gendered, male_words};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cooccurrences {
    female: BTreeMap<String, f64>,
    male: BTreeMap<String, f64>,
    female_words: usize,
    male_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BiasScores {
    pub bias: f64,
    pub bias_norm: f64,
    pub gdd: f64,
}

impl Cooccurrences {
    pub fn from_sentences<S: AsRef<str>>(sentences: &[Vec<S>]) -> Self {
        let female: BTreeSet<&str> = female_words().collect();
        let male: BTreeSet<&str> = male_words().collect();
        let mut acc = Cooccurrences::default();
        for sentence in sentences {
            let words: Vec<&str> = sentence.iter().map(|w| w.as_ref()).collect();
            let nf = words.iter().filter(|w| female.contains(*w)).count();
            let nm = words.iter().filter(|w| male.contains(*w)).count();
            acc.female_words += nf;
            acc.male_words += nm;
            if nf + nm == 0 {
                continue;
            }
            for &w in words.iter().filter(|w| **w != EOS && !is_gendered(w)) {
                if nf > 0 {
                    *acc.female.entry(w.to_string()).or_default() += nf as f64;
                }
                if nm > 0 {
                    *acc.male.entry(w.to_string()).or_default() += nm as f64;
                }
            }
        }
        acc
    }

    pub fn female(&self) -> &BTreeMap<String, f64> {
        &self.female
    }

    pub fn male(&self) -> &BTreeMap<String, f64> {
        &self.male
    }

    pub fn is_empty(&self) -> bool {
        self.female.is_empty() || self.male.is_empty()
    }

    /// `(bias, bias_norm)`.
    pub fn bias(&self) -> (f64, f64) {
        if self.is_empty() {
            return (0.0, 0.0);
        }
        let f_total: f64 = self.female.values().sum();
        let m_total: f64 = self.male.values().sum();
        let (mut bias, mut bias_norm, mut n) = (0.0, 0.0, 0usize);
        for (w, &cf) in &self.female {
            let Some(&cm) = self.male.get(w) else { continue };
            bias += ((cf / f_total) / (cm / m_total)).ln().abs();
            bias_norm += ((cf / self.female_words as f64) / (cm / self.male_words as f64)).ln().abs();
            n += 1;
        }
        if n == 0 {
            return (0.0, 0.0);
        }
        (bias / n as f64, bias_norm / n as f64)
    }

    /// Jensen-Shannon divergence (natural log) between the two conditional
    /// word distributions. Bounded by `ln 2`.
    pub fn divergence(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let f_total: f64 = self.female.values().sum();
        let m_total: f64 = self.male.values().sum();
        let vocab: BTreeSet<&String> = self.female.keys().chain(self.male.keys()).collect();
        let mut js = 0.0;
        for w in vocab {
            let p = self.female.get(w).map_or(0.0, |c| c / f_total);
            let q = self.male.get(w).map_or(0.0, |c| c / m_total);
            let m = 0.5 * (p + q);
            if p > 0.0 {
                js += 0.5 * p * (p / m).ln();
            }
            if q > 0.0 {
                js += 0.5 * q * (q / m).ln();
            }
        }
        js
    }

    pub fn scores(&self) -> BiasScores {
        let (bias, bias_norm) = self.bias();
        BiasScores { bias, bias_norm, gdd: self.divergence() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sents(text: &[&str]) -> Vec<Vec<String>> {
        text.iter().map(|s| s.split_whitespace().map(String::from).collect()).collect()
    }

    #[test]
    fn balanced_contexts_have_no_bias() {
        let c = Cooccurrences::from_sentences(&sents(&["she likes cats <eos>", "he likes dogs <eos>"]));
        assert_eq!(c.female().get("likes"), Some(&1.0));
        assert!(c.female().get("<eos>").is_none());
        let s = c.scores();
        assert!(s.bias.abs() < 1e-12);
        assert!(s.bias_norm.abs() < 1e-12);
        // half the mass is shared
        assert!((s.gdd - 0.5 * 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn normalization_by_gender_word_count() {
        let c = Cooccurrences::from_sentences(&sents(&["she her x", "he x y"]));
        let s = c.scores();
        assert!((s.bias - 2f64.ln()).abs() < 1e-12);
        assert!(s.bias_norm.abs() < 1e-12);
    }

    #[test]
    fn divergence_is_symmetric_and_bounded() {
        let a = Cooccurrences::from_sentences(&sents(&["she a a b", "he c"]));
        let b = Cooccurrences::from_sentences(&sents(&["he a a b", "she c"]));
        assert!((a.divergence() - b.divergence()).abs() < 1e-12);
        // disjoint supports reach the bound
        assert!((a.divergence() - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn empty_input_scores_zero() {
        let none: Vec<Vec<&str>> = Vec::new();
        let s = Cooccurrences::from_sentences(&none).scores();
        assert_eq!(s, BiasScores { bias: 0.0, bias_norm: 0.0, gdd: 0.0 });
        let one_sided = Cooccurrences::from_sentences(&sents(&["she walks"])).scores();
        assert_eq!(one_sided.gdd, 0.0);
    }
}
