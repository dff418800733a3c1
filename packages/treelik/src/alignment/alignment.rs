use crate::alignment::patterns::Patterns;
use crate::alphabet::alphabet::Alphabet;
use crate::{make_error, make_report};
use crate::utils::string::quoted_list;
use eyre::{Report, WrapErr};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use ndarray::Array1;

/// Aligned sequences over one alphabet, keyed by taxon name.
///
/// Every observed symbol is interned once, and its leaf profile is computed once, so that sequences are stored as
/// vectors of small integer codes.
#[derive(Clone, Debug)]
pub struct Alignment {
  alphabet: Alphabet,
  names: IndexSet<String>,
  symbols: IndexSet<String>,
  profiles: Vec<Array1<f64>>,
  seqs: Vec<Vec<usize>>,
  n_columns: usize,
}

impl Alignment {
  /// Build an alignment from (taxon name, sequence) pairs
  pub fn from_pairs<N, S>(alphabet: &Alphabet, pairs: impl IntoIterator<Item = (N, S)>) -> Result<Self, Report>
  where
    N: AsRef<str>,
    S: AsRef<str>,
  {
    let mut names = IndexSet::<String>::new();
    let mut symbols = IndexSet::<String>::new();
    let mut profiles = vec![];
    let mut seqs = vec![];
    let mut n_columns: Option<(usize, String)> = None;

    for (name, seq) in pairs {
      let name = name.as_ref();
      if !names.insert(name.to_owned()) {
        return make_error!("Taxon names in an alignment must be unique, but found duplicate '{name}'");
      }

      let tokens = alphabet
        .tokenize(seq.as_ref())
        .wrap_err_with(|| format!("When reading sequence of taxon '{name}'"))?;

      if let Some((expected, first)) = &n_columns {
        if *expected != tokens.len() {
          return make_error!(
            "All sequences in an alignment must have equal length, but sequence of taxon '{name}' has length {} while sequence of taxon '{first}' has length {expected}",
            tokens.len()
          );
        }
      } else {
        n_columns = Some((tokens.len(), name.to_owned()));
      }

      let mut codes = Vec::with_capacity(tokens.len());
      for (column, token) in tokens.into_iter().enumerate() {
        let code = match symbols.get_index_of(&token) {
          Some(code) => code,
          None => {
            let profile = alphabet
              .profile(&token)
              .wrap_err_with(|| format!("When reading taxon '{name}' at column {column}"))?;
            profiles.push(profile);
            symbols.insert_full(token).0
          }
        };
        codes.push(code);
      }
      seqs.push(codes);
    }

    if names.is_empty() {
      return make_error!("Alignment contains no sequences");
    }

    Ok(Self {
      alphabet: alphabet.clone(),
      names,
      symbols,
      profiles,
      seqs,
      n_columns: n_columns.map_or(0, |(n, _)| n),
    })
  }

  pub fn from_map(alphabet: &Alphabet, seqs: &IndexMap<String, String>) -> Result<Self, Report> {
    Self::from_pairs(alphabet, seqs.iter())
  }

  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  /// Taxon names, in insertion order
  pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
    self.names.iter().map(String::as_str)
  }

  pub fn n_taxa(&self) -> usize {
    self.names.len()
  }

  /// Number of columns
  pub const fn len(&self) -> usize {
    self.n_columns
  }

  pub const fn is_empty(&self) -> bool {
    self.n_columns == 0
  }

  pub fn contains(&self, name: &str) -> bool {
    self.names.contains(name)
  }

  fn taxon_index(&self, name: &str) -> Result<usize, Report> {
    self.names.get_index_of(name).ok_or_else(|| {
      make_report!(
        "Taxon '{name}' is not in the alignment. Known taxa: {}",
        quoted_list(self.names.iter())
      )
    })
  }

  /// Symbols of one taxon
  pub fn sequence(&self, name: &str) -> Result<Vec<&str>, Report> {
    let i = self.taxon_index(name)?;
    Ok(self.seqs[i].iter().map(|&code| self.symbol(code)).collect())
  }

  pub fn sequence_string(&self, name: &str) -> Result<String, Report> {
    Ok(self.sequence(name)?.concat())
  }

  /// Symbols of all taxa at one column, in taxon order
  pub fn column(&self, column: usize) -> Result<Vec<&str>, Report> {
    if column >= self.n_columns {
      return make_error!(
        "Column {column} is out of range: alignment has {} columns",
        self.n_columns
      );
    }
    Ok(self.seqs.iter().map(|seq| self.symbol(seq[column])).collect())
  }

  pub(crate) fn symbol(&self, code: usize) -> &str {
    self.symbols.get_index(code).map_or("", String::as_str)
  }

  pub(crate) fn codes(&self, taxon: usize) -> &[usize] {
    &self.seqs[taxon]
  }

  pub(crate) fn symbol_profile(&self, code: usize) -> &Array1<f64> {
    &self.profiles[code]
  }

  /// Sub-alignment restricted to the given taxa, in the given order
  pub fn take_taxa(&self, names: &[impl AsRef<str>]) -> Result<Self, Report> {
    let pairs = names
      .iter()
      .map(|name| Ok((name.as_ref().to_owned(), self.sequence_string(name.as_ref())?)))
      .collect::<Result<Vec<_>, Report>>()
      .wrap_err("When selecting taxa from alignment")?;
    Self::from_pairs(&self.alphabet, pairs)
  }

  /// Proportion of differing columns between two taxa, counted over columns where both carry a canonical state
  pub fn p_distance(&self, a: &str, b: &str) -> Result<f64, Report> {
    let a_codes = self.codes(self.taxon_index(a)?);
    let b_codes = self.codes(self.taxon_index(b)?);
    let (n_compared, n_diff) = a_codes
      .iter()
      .zip(b_codes.iter())
      .filter(|(x, y)| self.alphabet.is_canonical(self.symbol(**x)) && self.alphabet.is_canonical(self.symbol(**y)))
      .fold((0_usize, 0_usize), |(n, d), (x, y)| (n + 1, d + usize::from(x != y)));
    if n_compared == 0 {
      return make_error!("Taxa '{a}' and '{b}' have no columns where both carry a canonical state");
    }
    Ok(n_diff as f64 / n_compared as f64)
  }

  /// Observed frequencies of canonical states over all taxa and columns. Ambiguous and missing data are ignored.
  /// Falls back to uniform frequencies when no canonical state is observed.
  pub fn empirical_freqs(&self) -> Array1<f64> {
    let n = self.alphabet.len();
    let mut counts = Array1::<f64>::zeros(n);
    for seq in &self.seqs {
      for &code in seq {
        if let Some(i) = self.alphabet.index_of(self.symbol(code)) {
          counts[i] += 1.0;
        }
      }
    }
    let total = counts.sum();
    if total > 0.0 {
      counts / total
    } else {
      Array1::from_elem(n, 1.0 / n as f64)
    }
  }

  /// Unique column patterns with their multiplicities
  pub fn patterns(&self) -> Patterns {
    Patterns::compress(self)
  }
}
