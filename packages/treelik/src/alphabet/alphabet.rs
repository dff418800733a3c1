use crate::alphabet::genetic_code::sense_codons;
use crate::make_error;
use crate::utils::string::quoted_list;
use clap::ValueEnum;
use eyre::{Report, WrapErr};
use indexmap::{indexmap, IndexMap, IndexSet};
use itertools::{chain, Itertools};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(ValueEnum, SmartDefault, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum AlphabetName {
  #[default]
  Nuc,
  Aa,
  Codon,
}

pub type ProfileMap = IndexMap<String, Array1<f64>>;

/// Ordered set of canonical states of a substitution model, together with the symbols which can be observed in the
/// data: ambiguity codes, the 'unknown' symbol and the 'gap' symbol.
///
/// Symbols are strings of equal length (`motif_length`): single characters for nucleotides and amino acids,
/// triplets for codons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alphabet {
  name: Option<AlphabetName>,
  canonical: IndexSet<String>,
  ambiguous: IndexMap<String, Vec<String>>,
  unknown: String,
  gap: String,
  motif_length: usize,
  profile_map: ProfileMap,
}

impl Alphabet {
  /// Create one of the pre-defined alphabets
  pub fn new(name: AlphabetName) -> Result<Self, Report> {
    let cfg = match name {
      AlphabetName::Nuc => AlphabetConfig::nuc(),
      AlphabetName::Aa => AlphabetConfig::aa(),
      AlphabetName::Codon => AlphabetConfig::codon(),
    };
    let mut alphabet = Self::with_config(&cfg).wrap_err_with(|| format!("When creating alphabet '{name}'"))?;
    alphabet.name = Some(name);
    Ok(alphabet)
  }

  /// Create custom alphabet from a given config
  pub fn with_config(cfg: &AlphabetConfig) -> Result<Self, Report> {
    let profile_map = cfg.create_profile_map()?;

    let AlphabetConfig {
      canonical,
      ambiguous,
      unknown,
      gap,
    } = cfg;

    Ok(Self {
      name: None,
      canonical: canonical.iter().cloned().collect(),
      ambiguous: ambiguous.clone(),
      unknown: unknown.clone(),
      gap: gap.clone(),
      motif_length: unknown.chars().count(),
      profile_map,
    })
  }

  pub const fn name(&self) -> Option<AlphabetName> {
    self.name
  }

  /// Number of canonical states (K)
  pub fn len(&self) -> usize {
    self.canonical.len()
  }

  pub fn is_empty(&self) -> bool {
    self.canonical.is_empty()
  }

  /// Number of characters in every symbol
  pub const fn motif_length(&self) -> usize {
    self.motif_length
  }

  /// Canonical states, in matrix index order
  pub fn canonical(&self) -> impl Iterator<Item = &str> + '_ {
    self.canonical.iter().map(String::as_str)
  }

  /// Get canonical state by matrix index
  pub fn state(&self, index: usize) -> Option<&str> {
    self.canonical.get_index(index).map(String::as_str)
  }

  /// Get matrix index of a canonical state
  pub fn index_of(&self, state: &str) -> Option<usize> {
    self.canonical.get_index_of(state)
  }

  pub fn is_canonical(&self, symbol: &str) -> bool {
    self.canonical.contains(symbol)
  }

  pub fn is_ambiguous(&self, symbol: &str) -> bool {
    self.ambiguous.contains_key(symbol) || (!self.is_canonical(symbol) && self.resolve_motif(symbol).is_some())
  }

  pub fn unknown(&self) -> &str {
    &self.unknown
  }

  pub fn is_unknown(&self, symbol: &str) -> bool {
    symbol == self.unknown
  }

  pub fn gap(&self) -> &str {
    &self.gap
  }

  pub fn is_gap(&self, symbol: &str) -> bool {
    symbol == self.gap
  }

  /// Check if a symbol can be observed in data over this alphabet
  pub fn contains(&self, symbol: &str) -> bool {
    self.profile_map.contains_key(symbol) || self.resolve_motif(symbol).is_some()
  }

  /// Indices of the canonical states compatible with a symbol. Gap and unknown are compatible with every state.
  pub fn disambiguate(&self, symbol: &str) -> Result<Vec<usize>, Report> {
    let profile = self.profile(symbol)?;
    Ok(
      profile
        .iter()
        .enumerate()
        .filter(|(_, p)| **p > 0.0)
        .map(|(i, _)| i)
        .collect(),
    )
  }

  /// Leaf likelihood vector of an observed symbol: indicator over the compatible canonical states
  pub fn profile(&self, symbol: &str) -> Result<Array1<f64>, Report> {
    if let Some(profile) = self.profile_map.get(symbol) {
      return Ok(profile.clone());
    }
    if let Some(states) = self.resolve_motif(symbol) {
      let mut profile = Array1::<f64>::zeros(self.len());
      for i in states {
        profile[i] = 1.0;
      }
      return Ok(profile);
    }
    make_error!(
      "Unknown symbol '{symbol}'. Expected one of the canonical states ({}), an ambiguity code, unknown '{}' or gap '{}'",
      self.canonical().join(", "),
      self.unknown,
      self.gap
    )
  }

  /// Split a sequence string into symbols of this alphabet. The pre-defined alphabets also accept lowercase input,
  /// custom alphabets match their symbols exactly.
  pub fn tokenize(&self, seq: &str) -> Result<Vec<String>, Report> {
    let chars = if self.name.is_some() {
      seq.trim().chars().map(|c| c.to_ascii_uppercase()).collect_vec()
    } else {
      seq.trim().chars().collect_vec()
    };
    if chars.len() % self.motif_length != 0 {
      return make_error!(
        "Sequence length {} is not divisible by the motif length {} of the alphabet",
        chars.len(),
        self.motif_length
      );
    }
    Ok(
      chars
        .chunks(self.motif_length)
        .map(|motif| motif.iter().collect::<String>())
        .collect(),
    )
  }

  /// Resolves multi-character motifs made of nucleotide ambiguity codes (e.g. codon `AAR`) into the compatible
  /// canonical states. Motifs which are partially gapped are treated as unknown.
  fn resolve_motif(&self, symbol: &str) -> Option<Vec<usize>> {
    if self.motif_length < 2 || symbol.chars().count() != self.motif_length {
      return None;
    }
    let nuc = AlphabetConfig::nuc();
    let gap = nuc.gap.chars().next()?;
    if symbol.contains(gap) {
      return symbol
        .chars()
        .all(|c| c == gap || nuc.resolve_char(c).is_some())
        .then(|| (0..self.len()).collect());
    }
    let per_position: Vec<Vec<char>> = symbol.chars().map(|c| nuc.resolve_char(c)).collect::<Option<_>>()?;
    let states = self
      .canonical
      .iter()
      .enumerate()
      .filter(|(_, state)| {
        state
          .chars()
          .zip(per_position.iter())
          .all(|(c, allowed)| allowed.contains(&c))
      })
      .map(|(i, _)| i)
      .collect_vec();
    (!states.is_empty()).then_some(states)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlphabetConfig {
  pub canonical: Vec<String>,
  pub ambiguous: IndexMap<String, Vec<String>>,
  pub unknown: String,
  pub gap: String,
}

fn symbols(chars: &str) -> Vec<String> {
  chars.chars().map(String::from).collect()
}

impl AlphabetConfig {
  pub fn nuc() -> Self {
    Self {
      canonical: symbols("ACGT"),
      ambiguous: indexmap! {
        "R".to_owned() => symbols("AG"),
        "Y".to_owned() => symbols("CT"),
        "S".to_owned() => symbols("CG"),
        "W".to_owned() => symbols("AT"),
        "K".to_owned() => symbols("GT"),
        "M".to_owned() => symbols("AC"),
        "D".to_owned() => symbols("AGT"),
        "H".to_owned() => symbols("ACT"),
        "B".to_owned() => symbols("CGT"),
        "V".to_owned() => symbols("ACG"),
        "?".to_owned() => symbols("ACGT"),
      },
      unknown: "N".to_owned(),
      gap: "-".to_owned(),
    }
  }

  pub fn aa() -> Self {
    Self {
      canonical: symbols("ACDEFGHIKLMNPQRSTVWY"),
      ambiguous: indexmap! {
        "B".to_owned() => symbols("ND"),
        "Z".to_owned() => symbols("QE"),
        "J".to_owned() => symbols("LI"),
        "?".to_owned() => symbols("ACDEFGHIKLMNPQRSTVWY"),
      },
      unknown: "X".to_owned(),
      gap: "-".to_owned(),
    }
  }

  pub fn codon() -> Self {
    Self {
      canonical: sense_codons(),
      ambiguous: IndexMap::new(),
      unknown: "NNN".to_owned(),
      gap: "---".to_owned(),
    }
  }

  /// Canonical characters compatible with a single-character symbol
  fn resolve_char(&self, c: char) -> Option<Vec<char>> {
    let symbol = c.to_string();
    if self.canonical.contains(&symbol) {
      Some(vec![c])
    } else if let Some(values) = self.ambiguous.get(&symbol) {
      Some(values.iter().flat_map(|v| v.chars()).collect())
    } else if self.unknown == symbol {
      Some(self.canonical.iter().flat_map(|v| v.chars()).collect())
    } else {
      None
    }
  }

  pub fn create_profile_map(&self) -> Result<ProfileMap, Report> {
    self.validate().wrap_err("When validating alphabet config")?;

    let AlphabetConfig {
      canonical,
      ambiguous,
      unknown,
      gap,
    } = self;

    let eye = Array2::<f64>::eye(canonical.len());

    let mut profile_map: ProfileMap = canonical
      .iter()
      .zip(eye.rows())
      .map(|(s, x)| (s.clone(), x.to_owned()))
      .collect();

    for (key, values) in ambiguous {
      let profile = canonical
        .iter()
        .map(|c| if values.contains(c) { 1.0 } else { 0.0 })
        .collect::<Array1<f64>>();
      profile_map.insert(key.clone(), profile);
    }

    // Missing data is compatible with every state
    profile_map.insert(unknown.clone(), Array1::<f64>::ones(canonical.len()));
    profile_map.insert(gap.clone(), Array1::<f64>::ones(canonical.len()));

    Ok(profile_map)
  }

  pub fn validate(&self) -> Result<(), Report> {
    let AlphabetConfig {
      canonical,
      ambiguous,
      unknown,
      gap,
    } = self;

    if canonical.is_empty() {
      return make_error!("Canonical set of states is empty. This is not allowed.");
    }

    let canonical_dupes = canonical.iter().duplicates().collect_vec();
    if !canonical_dupes.is_empty() {
      return make_error!("Canonical set contains duplicates: {}", quoted_list(canonical_dupes));
    }

    let motif_length = unknown.chars().count();
    let bad_lengths = chain!(canonical.iter(), ambiguous.keys(), [unknown, gap])
      .filter(|s| s.chars().count() != motif_length || s.is_empty())
      .collect_vec();
    if !bad_lengths.is_empty() {
      return make_error!(
        "All symbols are expected to have the same non-zero length as the 'unknown' symbol ({motif_length}), but found: {}",
        quoted_list(bad_lengths)
      );
    }

    let canonical_set: IndexSet<&String> = canonical.iter().collect();

    let shared = ambiguous.keys().filter(|k| canonical_set.contains(k)).collect_vec();
    if !shared.is_empty() {
      return make_error!(
        "Canonical and ambiguous sets must be disjoint, but these symbols are shared: {}",
        quoted_list(shared)
      );
    }

    if unknown == gap {
      return make_error!("'Unknown' and 'gap' symbols must differ, but both are '{gap}'");
    }

    for (what, symbol) in [("gap", gap), ("unknown", unknown)] {
      if canonical_set.contains(symbol) {
        return make_error!("Canonical set contains '{what}' symbol '{symbol}'");
      }
      if ambiguous.contains_key(symbol) {
        return make_error!("Ambiguous set contains '{what}' symbol '{symbol}'");
      }
    }

    for (key, values) in ambiguous {
      let extra = values.iter().filter(|v| !canonical_set.contains(v)).collect_vec();
      if !extra.is_empty() {
        return make_error!(
          "Ambiguous symbol '{key}' resolves to states which are not canonical: {}",
          quoted_list(extra)
        );
      }
      if values.is_empty() {
        return make_error!("Ambiguous symbol '{key}' resolves to an empty set of states");
      }
    }

    Ok(())
  }
}
