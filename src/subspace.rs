//! Gender word sets and the gender subspace of an embedding matrix.
//!
//! Every (female, male) pair contributes the covariance of its two
//! embedding rows; the summed covariance is decomposed and the leading
//! singular directions that together capture the requested share of
//! variance span the subspace.

use std::collections::HashSet;

use crate::data::Vocabulary;
use crate::error::{Error, Result};
use crate::linalg::symmetric_svd;

/// Definitional pairs, female word first.
pub const GENDER_PAIRS: [(&str, &str); 15] = [
    ("woman", "man"),
    ("women", "men"),
    ("ladies", "gentlemen"),
    ("lady", "gentleman"),
    ("female", "male"),
    ("females", "males"),
    ("girl", "boy"),
    ("girls", "boys"),
    ("girlfriend", "boyfriend"),
    ("girlfriends", "boyfriends"),
    ("she", "he"),
    ("her", "him"),
    ("hers", "his"),
    ("wife", "husband"),
    ("wives", "husbands"),
];

pub fn female_words() -> impl Iterator<Item = &'static str> {
    GENDER_PAIRS.iter().map(|&(f, _)| f)
}

pub fn male_words() -> impl Iterator<Item = &'static str> {
    GENDER_PAIRS.iter().map(|&(_, m)| m)
}

pub fn is_gendered(word: &str) -> bool {
    GENDER_PAIRS.iter().any(|&(f, m)| f == word || m == word)
}

/// Pair set `D` and neutral set `N` resolved against a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenderWordSets {
    pairs: Vec<(usize, usize)>,
    neutral: Vec<usize>,
}

impl GenderWordSets {
    /// Keeps the pairs whose two words are both in `vocab`; every other
    /// non-gendered token is neutral. Fails when no pair survives.
    pub fn from_vocab(vocab: &Vocabulary) -> Result<Self> {
        let pairs: Vec<(usize, usize)> = GENDER_PAIRS
            .iter()
            .filter_map(|&(f, m)| Some((vocab.index(f)?, vocab.index(m)?)))
            .collect();
        if pairs.is_empty() {
            return Err(Error::EmptyGenderPairs);
        }
        let neutral = vocab.iter().filter(|(_, w)| !is_gendered(w)).map(|(i, _)| i).collect();
        Ok(GenderWordSets { pairs, neutral })
    }

    /// Builds the sets from raw ids, checking the invariants on them.
    pub fn new(pairs: Vec<(usize, usize)>, neutral: Vec<usize>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(Error::EmptyGenderPairs);
        }
        let gendered: HashSet<usize> = pairs.iter().flat_map(|&(f, m)| [f, m]).collect();
        if pairs.iter().any(|&(f, m)| f == m) {
            return Err(Error::InvalidConfig("a gender pair repeats the same token".into()));
        }
        if neutral.iter().any(|n| gendered.contains(n)) {
            return Err(Error::InvalidConfig("neutral set overlaps the gender pairs".into()));
        }
        Ok(GenderWordSets { pairs, neutral })
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn neutral(&self) -> &[usize] {
        &self.neutral
    }
}

/// Orthonormal basis `B` of the gender subspace, `k x dim` row-major.
#[derive(Debug, Clone)]
pub struct GenderSubspace {
    basis: Vec<f32>,
    k: usize,
    dim: usize,
    captured: f64,
}

impl GenderSubspace {
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.basis[i * self.dim..(i + 1) * self.dim]
    }

    /// Share of the pair variance the basis captures.
    pub fn captured_variance(&self) -> f64 {
        self.captured
    }

    /// `Bᵀ`, `dim x k` row-major.
    pub fn transposed(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.dim * self.k];
        for i in 0..self.k {
            for j in 0..self.dim {
                out[j * self.k + i] = self.basis[i * self.dim + j];
            }
        }
        out
    }
}

/// Summed pair covariance `X = Σ (Aᵢ - μᵢ)ᵀ(Aᵢ - μᵢ) / 2` over the two-row
/// blocks `Aᵢ = W[(f, m)]`; `dim x dim` row-major.
pub fn pair_covariance(w: &[f32], dim: usize, pairs: &[(usize, usize)]) -> Result<Vec<f32>> {
    if pairs.is_empty() {
        return Err(Error::EmptyGenderPairs);
    }
    let mut x = vec![0.0f64; dim * dim];
    let mut centered = [vec![0.0f64; dim], vec![0.0f64; dim]];
    for &(f, m) in pairs {
        let rf = &w[f * dim..(f + 1) * dim];
        let rm = &w[m * dim..(m + 1) * dim];
        for j in 0..dim {
            let mu = (f64::from(rf[j]) + f64::from(rm[j])) / 2.0;
            centered[0][j] = f64::from(rf[j]) - mu;
            centered[1][j] = f64::from(rm[j]) - mu;
        }
        for row in &centered {
            for a in 0..dim {
                let ra = row[a];
                if ra == 0.0 {
                    continue;
                }
                for b in 0..dim {
                    x[a * dim + b] += ra * row[b] / 2.0;
                }
            }
        }
    }
    Ok(x.into_iter().map(|v| v as f32).collect())
}

/// Smallest `k` whose leading normalized variances sum to at least `ratio`.
pub fn components_for_ratio(singular_values: &[f32], ratio: f32) -> Result<(usize, f64)> {
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(Error::InvalidVarianceRatio(ratio));
    }
    let var: Vec<f64> = singular_values.iter().map(|&s| f64::from(s) * f64::from(s)).collect();
    let total: f64 = var.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(Error::DegenerateCovariance);
    }
    // Same summation order as `total`, so the final partial sum hits 1.0 exactly.
    let mut partial = 0.0f64;
    for (i, v) in var.iter().enumerate() {
        partial += v;
        let cumulative = partial / total;
        if cumulative >= f64::from(ratio) {
            return Ok((i + 1, cumulative));
        }
    }
    Err(Error::EmptySubspace(ratio))
}

/// Estimates the gender subspace of the `[vocab, dim]` embedding matrix `w`.
pub fn estimate(w: &[f32], dim: usize, pairs: &[(usize, usize)], ratio: f32) -> Result<GenderSubspace> {
    let x = pair_covariance(w, dim, pairs)?;
    let svd = symmetric_svd(&x, dim)?;
    let (k, captured) = components_for_ratio(&svd.singular_values, ratio)?;
    let basis = svd.vectors[..k].iter().flatten().copied().collect();
    Ok(GenderSubspace { basis, k, dim, captured })
}
