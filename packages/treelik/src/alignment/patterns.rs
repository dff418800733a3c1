use crate::alignment::alignment::Alignment;
use crate::alphabet::alphabet::Alphabet;
use crate::make_error;
use crate::utils::string::quoted_list;
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{Array1, Array2};

/// Alignment compressed into unique column patterns.
///
/// Each pattern carries a weight (its multiplicity in the alignment) and the leaf likelihood vectors of every taxon,
/// stored as one `(n_patterns, K)` matrix per taxon.
#[derive(Clone, Debug)]
pub struct Patterns {
  names: Vec<String>,
  patterns: Vec<Vec<String>>,
  weights: Vec<f64>,
  column_to_pattern: Vec<usize>,
  leaf_profiles: Vec<Array2<f64>>,
}

impl Patterns {
  pub fn compress(aln: &Alignment) -> Self {
    let n_taxa = aln.n_taxa();
    let mut unique = IndexMap::<Vec<usize>, usize>::new();
    let mut column_to_pattern = Vec::with_capacity(aln.len());

    for column in 0..aln.len() {
      let key = (0..n_taxa).map(|taxon| aln.codes(taxon)[column]).collect_vec();
      let next = unique.len();
      let pattern = *unique.entry(key).or_insert(next);
      column_to_pattern.push(pattern);
    }

    let mut weights = vec![0.0; unique.len()];
    for &pattern in &column_to_pattern {
      weights[pattern] += 1.0;
    }

    let k = aln.alphabet().len();
    let leaf_profiles = (0..n_taxa)
      .map(|taxon| {
        let mut profile = Array2::<f64>::zeros((unique.len(), k));
        for (key, mut row) in unique.keys().zip(profile.rows_mut()) {
          row.assign(aln.symbol_profile(key[taxon]));
        }
        profile
      })
      .collect_vec();

    let patterns = unique
      .keys()
      .map(|key| key.iter().map(|&code| aln.symbol(code).to_owned()).collect_vec())
      .collect_vec();

    Self {
      names: aln.names().map(str::to_owned).collect(),
      patterns,
      weights,
      column_to_pattern,
      leaf_profiles,
    }
  }

  /// Build patterns with explicit (possibly fractional) weights. Each pattern lists one symbol per taxon, in the
  /// order of `names`. The column map is the identity: pattern `i` stands for column `i`.
  pub fn with_weights(
    alphabet: &Alphabet,
    names: &[impl AsRef<str>],
    patterns: &[Vec<&str>],
    weights: &[f64],
  ) -> Result<Self, Report> {
    if patterns.len() != weights.len() {
      return make_error!(
        "Number of patterns ({}) does not match number of weights ({})",
        patterns.len(),
        weights.len()
      );
    }
    if let Some((i, w)) = weights.iter().find_position(|w| !w.is_finite() || **w < 0.0) {
      return make_error!("Pattern weights must be finite and non-negative, but weight of pattern {i} is {w}");
    }

    let duplicates = names.iter().map(|name| name.as_ref()).duplicates().collect_vec();
    if !duplicates.is_empty() {
      return make_error!(
        "Taxon names of patterns must be unique, but found duplicates: {}",
        quoted_list(duplicates)
      );
    }

    let n_taxa = names.len();
    let k = alphabet.len();
    let mut leaf_profiles = vec![Array2::<f64>::zeros((patterns.len(), k)); n_taxa];
    for (i, pattern) in patterns.iter().enumerate() {
      if pattern.len() != n_taxa {
        return make_error!(
          "Pattern {i} has {} symbols, but there are {n_taxa} taxa",
          pattern.len()
        );
      }
      for (taxon, symbol) in pattern.iter().enumerate() {
        let profile = alphabet
          .profile(symbol)
          .wrap_err_with(|| format!("When reading pattern {i} of taxon '{}'", names[taxon].as_ref()))?;
        leaf_profiles[taxon].row_mut(i).assign(&profile);
      }
    }

    Ok(Self {
      names: names.iter().map(|name| name.as_ref().to_owned()).collect(),
      patterns: patterns
        .iter()
        .map(|pattern| pattern.iter().map(|&s| s.to_owned()).collect())
        .collect(),
      weights: weights.to_vec(),
      column_to_pattern: (0..patterns.len()).collect(),
      leaf_profiles,
    })
  }

  pub fn n_patterns(&self) -> usize {
    self.weights.len()
  }

  pub fn n_taxa(&self) -> usize {
    self.names.len()
  }

  /// Number of alignment columns represented
  pub fn n_columns(&self) -> usize {
    self.column_to_pattern.len()
  }

  /// Total weight, i.e. the effective number of sites
  pub fn n_sites(&self) -> f64 {
    self.weights.iter().sum()
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  /// Symbols of one pattern, in taxon order
  pub fn pattern(&self, index: usize) -> Option<&[String]> {
    self.patterns.get(index).map(Vec::as_slice)
  }

  pub fn column_to_pattern(&self) -> &[usize] {
    &self.column_to_pattern
  }

  /// Leaf likelihood vectors of one taxon, one row per pattern
  pub fn leaf_profile(&self, name: &str) -> Option<&Array2<f64>> {
    let i = self.names.iter().position(|n| n == name)?;
    self.leaf_profiles.get(i)
  }

  /// Expand per-pattern values into per-column values
  pub fn expand(&self, per_pattern: &Array1<f64>) -> Array1<f64> {
    self.column_to_pattern.iter().map(|&p| per_pattern[p]).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::AlphabetName;
  use approx::assert_ulps_eq;
  use eyre::Report;
  use ndarray::array;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn compresses_identical_columns() -> Result<(), Report> {
    let alphabet = Alphabet::new(AlphabetName::Nuc)?;
    let aln = Alignment::from_pairs(&alphabet, [("a", "AACAA"), ("b", "AAGAN")])?;
    let patterns = aln.patterns();
    assert_eq!(patterns.n_patterns(), 3);
    assert_eq!(patterns.n_columns(), 5);
    assert_eq!(patterns.weights(), &[3.0, 1.0, 1.0]);
    assert_eq!(patterns.column_to_pattern(), &[0, 0, 1, 0, 2]);
    assert_eq!(patterns.pattern(1), Some(["C".to_owned(), "G".to_owned()].as_slice()));
    assert_ulps_eq!(
      patterns.leaf_profile("b").unwrap().view(),
      array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [1.0, 1.0, 1.0, 1.0]]
    );
    assert_ulps_eq!(
      patterns.expand(&array![-1.0, -2.0, -3.0]),
      array![-1.0, -1.0, -2.0, -1.0, -3.0]
    );
    Ok(())
  }

  #[rstest]
  fn accepts_explicit_weights() -> Result<(), Report> {
    let alphabet = Alphabet::new(AlphabetName::Nuc)?;
    let patterns = Patterns::with_weights(&alphabet, &["x", "y"], &[vec!["A", "A"], vec!["A", "G"]], &[0.9, 0.1])?;
    assert_eq!(patterns.n_patterns(), 2);
    assert_ulps_eq!(patterns.n_sites(), 1.0);
    assert!(Patterns::with_weights(&alphabet, &["x", "y"], &[vec!["A", "A"]], &[-1.0]).is_err());
    assert!(Patterns::with_weights(&alphabet, &["x", "y"], &[vec!["A"]], &[1.0]).is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_repeated_taxon_names() -> Result<(), Report> {
    let alphabet = Alphabet::new(AlphabetName::Nuc)?;
    let report = Patterns::with_weights(&alphabet, &["a", "a", "b"], &[vec!["A", "C", "G"]], &[1.0]).unwrap_err();
    assert!(report.to_string().contains("'a'"));
    Ok(())
  }
}
