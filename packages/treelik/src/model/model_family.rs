use crate::alphabet::alphabet::{Alphabet, AlphabetName};
use crate::alphabet::genetic_code::{codon_differences, is_transition, translate};
use crate::model::rate_matrix::{validate_freqs, ModelOptions, RateMatrix};
use crate::params::bounds::Bounds;
use crate::utils::error::LikelihoodError;
use crate::{make_error, make_report};
use clap::ValueEnum;
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{array, Array1, Array2};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use strum_macros::{Display, EnumIter, EnumString};

/// Named substitution model families
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(ValueEnum, SmartDefault, Display, EnumString, EnumIter, Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
pub enum ModelFamily {
  /// Jukes-Cantor 1969: equal frequencies and equal exchangeabilities
  #[default]
  JC69,
  /// Kimura 1980: equal frequencies, transition/transversion ratio `kappa`
  K80,
  /// Felsenstein 1981: free frequencies, equal exchangeabilities
  F81,
  /// Hasegawa, Kishino and Yano 1985: free frequencies, transition/transversion ratio `kappa`
  HKY85,
  /// Tamura 1992: frequencies given by the GC content `gc`, transition/transversion ratio `kappa`
  T92,
  /// General time-reversible: free frequencies, one exchangeability per unordered pair of states
  GTR,
  /// General non-reversible: free frequencies, one rate per ordered pair of states
  GN,
  /// Goldman and Yang 1994 codon model: free codon frequencies, `kappa` and the dN/dS ratio `omega`
  GY94,
}

/// Default and admissible values of one rate parameter of a model family
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateParamSpec {
  pub name: String,
  pub init: f64,
  pub bounds: Bounds,
  /// Whether the parameter also applies to the root pseudo-edge, where it determines root frequencies
  pub includes_root: bool,
}

impl RateParamSpec {
  fn rate(name: impl AsRef<str>) -> Self {
    Self {
      name: name.as_ref().to_owned(),
      init: 1.0,
      bounds: Bounds::rate(),
      includes_root: false,
    }
  }
}

/// A model family bound to an alphabet: the uniform interface through which parameters are named and rate matrices
/// are built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubstitutionModel {
  family: ModelFamily,
  alphabet: Alphabet,
  options: ModelOptions,
}

impl SubstitutionModel {
  pub fn new(family: ModelFamily, alphabet: &Alphabet, options: ModelOptions) -> Result<Self, Report> {
    match family {
      ModelFamily::K80 | ModelFamily::HKY85 | ModelFamily::T92 => {
        if alphabet.canonical().collect_vec() != ["A", "C", "G", "T"] {
          return make_error!(
            "Model '{family}' requires the nucleotide alphabet (A, C, G, T), but found states: {}",
            alphabet.canonical().join(", ")
          );
        }
      }
      ModelFamily::GY94 => {
        if alphabet.name() != Some(AlphabetName::Codon) {
          return make_error!("Model '{family}' requires the codon alphabet");
        }
      }
      ModelFamily::JC69 | ModelFamily::F81 | ModelFamily::GTR | ModelFamily::GN => {}
    }
    if alphabet.len() < 2 {
      return make_error!("Model '{family}' requires at least 2 states");
    }
    Ok(Self {
      family,
      alphabet: alphabet.clone(),
      options,
    })
  }

  pub fn from_name(name: &str, alphabet: &Alphabet) -> Result<Self, Report> {
    let family: ModelFamily = name
      .parse()
      .map_err(|_| make_report!("Unknown model family '{name}'"))?;
    Self::new(family, alphabet, ModelOptions::default())
  }

  pub const fn family(&self) -> ModelFamily {
    self.family
  }

  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  pub const fn options(&self) -> &ModelOptions {
    &self.options
  }

  pub fn n_states(&self) -> usize {
    self.alphabet.len()
  }

  /// Whether every rate matrix of this family satisfies detailed balance
  pub const fn is_reversible(&self) -> bool {
    !matches!(self.family, ModelFamily::GN)
  }

  /// Whether equilibrium frequencies are free parameters (the `freqs` parameter)
  pub const fn has_free_freqs(&self) -> bool {
    matches!(
      self.family,
      ModelFamily::F81 | ModelFamily::HKY85 | ModelFamily::GTR | ModelFamily::GN | ModelFamily::GY94
    )
  }

  pub fn uniform_freqs(&self) -> Array1<f64> {
    let n = self.n_states();
    Array1::from_elem(n, 1.0 / n as f64)
  }

  fn state_pairs(&self, ordered: bool) -> Vec<(usize, usize)> {
    let n = self.n_states();
    (0..n)
      .cartesian_product(0..n)
      .filter(|(i, j)| if ordered { i != j } else { i < j })
      .collect()
  }

  fn pair_name(&self, (i, j): (usize, usize), sep: &str) -> String {
    let a = self.alphabet.state(i).unwrap_or_default();
    let b = self.alphabet.state(j).unwrap_or_default();
    format!("{a}{sep}{b}")
  }

  /// Free rate parameters of the family. For `GTR` and `GN` the last pair is fixed to 1 and is not listed.
  pub fn rate_params(&self) -> Vec<RateParamSpec> {
    match self.family {
      ModelFamily::JC69 | ModelFamily::F81 => vec![],
      ModelFamily::K80 | ModelFamily::HKY85 => vec![RateParamSpec::rate("kappa")],
      ModelFamily::T92 => vec![
        RateParamSpec::rate("kappa"),
        RateParamSpec {
          name: "gc".to_owned(),
          init: 0.5,
          bounds: Bounds {
            lower: 1e-6,
            upper: 1.0 - 1e-6,
          },
          includes_root: true,
        },
      ],
      ModelFamily::GTR | ModelFamily::GN => {
        let (ordered, sep) = self.pair_convention();
        let pairs = self.state_pairs(ordered);
        pairs[..pairs.len() - 1]
          .iter()
          .map(|&pair| RateParamSpec::rate(self.pair_name(pair, sep)))
          .collect()
      }
      ModelFamily::GY94 => vec![RateParamSpec::rate("kappa"), RateParamSpec::rate("omega")],
    }
  }

  pub fn rate_param_names(&self) -> Vec<String> {
    self.rate_params().into_iter().map(|spec| spec.name).collect()
  }

  const fn pair_convention(&self) -> (bool, &'static str) {
    match self.family {
      ModelFamily::GN => (true, ">"),
      _ => (false, "/"),
    }
  }

  /// Exchangeability matrix R from the named rate values
  pub fn exchangeabilities(&self, rates: &IndexMap<String, f64>) -> Result<Array2<f64>, Report> {
    let n = self.n_states();
    let get = |name: &str| -> Result<f64, LikelihoodError> {
      let value = *rates
        .get(name)
        .ok_or_else(|| LikelihoodError::invalid_parameter(name, "no value given"))?;
      if !(value.is_finite() && value >= 0.0) {
        return Err(LikelihoodError::invalid_parameter(
          name,
          format!("rate must be finite and non-negative, but found {value}"),
        ));
      }
      Ok(value)
    };

    let mut r = Array2::<f64>::ones((n, n));
    match self.family {
      ModelFamily::JC69 | ModelFamily::F81 => {}
      ModelFamily::K80 | ModelFamily::HKY85 | ModelFamily::T92 => {
        let kappa = get("kappa")?;
        for (i, j) in self.state_pairs(true) {
          if self.is_transition_pair(i, j) {
            r[[i, j]] = kappa;
          }
        }
      }
      ModelFamily::GTR | ModelFamily::GN => {
        let (ordered, sep) = self.pair_convention();
        let pairs = self.state_pairs(ordered);
        for &(i, j) in &pairs[..pairs.len() - 1] {
          let value = get(&self.pair_name((i, j), sep))?;
          r[[i, j]] = value;
          if !ordered {
            r[[j, i]] = value;
          }
        }
      }
      ModelFamily::GY94 => {
        let kappa = get("kappa")?;
        let omega = get("omega")?;
        let codons = self.alphabet.canonical().collect_vec();
        for (i, j) in self.state_pairs(true) {
          r[[i, j]] = match codon_differences(codons[i], codons[j]).as_slice() {
            [(_, a, b)] => {
              let ts = if is_transition(*a, *b) { kappa } else { 1.0 };
              let synonymous = translate(codons[i]) == translate(codons[j]);
              ts * if synonymous { 1.0 } else { omega }
            }
            _ => 0.0,
          };
        }
      }
    }
    r.diag_mut().fill(0.0);
    Ok(r)
  }

  fn is_transition_pair(&self, i: usize, j: usize) -> bool {
    let a = self.alphabet.state(i).and_then(|s| s.chars().next());
    let b = self.alphabet.state(j).and_then(|s| s.chars().next());
    matches!((a, b), (Some(a), Some(b)) if is_transition(a, b))
  }

  /// Equilibrium frequencies of a process: the given `freqs` when they are free, otherwise derived from the family
  pub fn equilibrium_freqs(
    &self,
    rates: &IndexMap<String, f64>,
    freqs: Option<&Array1<f64>>,
  ) -> Result<Array1<f64>, Report> {
    match self.family {
      ModelFamily::JC69 | ModelFamily::K80 => Ok(self.uniform_freqs()),
      ModelFamily::T92 => {
        let gc = *rates
          .get("gc")
          .ok_or_else(|| LikelihoodError::invalid_parameter("gc", "no value given"))?;
        if !(0.0..=1.0).contains(&gc) {
          let reason = format!("must be between 0 and 1, but found {gc}");
          return Err(LikelihoodError::invalid_parameter("gc", reason).into());
        }
        Ok(array![(1.0 - gc) * 0.5, gc * 0.5, gc * 0.5, (1.0 - gc) * 0.5])
      }
      _ => {
        let freqs = freqs.ok_or_else(|| LikelihoodError::invalid_parameter("freqs", "no value given"))?;
        if freqs.len() != self.n_states() {
          return Err(
            LikelihoodError::invalid_parameter(
              "freqs",
              format!("expected {} frequencies, but found {}", self.n_states(), freqs.len()),
            )
            .into(),
          );
        }
        validate_freqs(freqs)?;
        Ok(freqs.clone())
      }
    }
  }

  /// Build the generator of one process from its rate values and frequencies
  pub fn rate_matrix(&self, rates: &IndexMap<String, f64>, freqs: Option<&Array1<f64>>) -> Result<RateMatrix, Report> {
    let r = self.exchangeabilities(rates)?;
    let pi = self.equilibrium_freqs(rates, freqs)?;
    RateMatrix::with_options(&r, &pi, &self.options)
      .wrap_err_with(|| format!("When building rate matrix of model '{}'", self.family))
  }
}
