use itertools::Itertools;

/// Nucleotide order in which codons of the standard code table below are enumerated
const TABLE_BASES: [char; 4] = ['T', 'C', 'A', 'G'];

/// Standard genetic code (NCBI translation table 1), codons enumerated in TCAG order
const STANDARD_CODE: &str = "FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

pub const STOP: char = '*';

fn base_index(base: char) -> Option<usize> {
  TABLE_BASES.iter().position(|&b| b == base.to_ascii_uppercase())
}

/// Translate a codon into an amino acid letter, `*` for stop codons. Returns `None` for anything that is not a
/// triplet of canonical nucleotides.
pub fn translate(codon: &str) -> Option<char> {
  let bases = codon.chars().collect_vec();
  if bases.len() != 3 {
    return None;
  }
  let i = base_index(bases[0])?;
  let j = base_index(bases[1])?;
  let k = base_index(bases[2])?;
  STANDARD_CODE.chars().nth(i * 16 + j * 4 + k)
}

pub fn is_stop(codon: &str) -> bool {
  translate(codon) == Some(STOP)
}

/// The 61 sense codons of the standard genetic code, in ACGT lexicographic order
pub fn sense_codons() -> Vec<String> {
  let bases = ['A', 'C', 'G', 'T'];
  bases
    .iter()
    .cartesian_product(bases.iter())
    .cartesian_product(bases.iter())
    .map(|((a, b), c)| format!("{a}{b}{c}"))
    .filter(|codon| !is_stop(codon))
    .collect()
}

fn is_purine(base: char) -> bool {
  matches!(base.to_ascii_uppercase(), 'A' | 'G')
}

fn is_pyrimidine(base: char) -> bool {
  matches!(base.to_ascii_uppercase(), 'C' | 'T' | 'U')
}

/// Substitution between two purines or two pyrimidines
pub fn is_transition(a: char, b: char) -> bool {
  a != b && ((is_purine(a) && is_purine(b)) || (is_pyrimidine(a) && is_pyrimidine(b)))
}

/// Substitution between a purine and a pyrimidine
pub fn is_transversion(a: char, b: char) -> bool {
  (is_purine(a) && is_pyrimidine(b)) || (is_pyrimidine(a) && is_purine(b))
}

/// Positions at which two codons differ, as pairs of (position, from, to)
pub fn codon_differences(from: &str, to: &str) -> Vec<(usize, char, char)> {
  from
    .chars()
    .zip(to.chars())
    .enumerate()
    .filter(|(_, (a, b))| a != b)
    .map(|(pos, (a, b))| (pos, a, b))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case("ATG", Some('M'))]
  #[case("TGG", Some('W'))]
  #[case("TAA", Some('*'))]
  #[case("TGA", Some('*'))]
  #[case("GGC", Some('G'))]
  #[case("AAN", None)]
  #[case("AT", None)]
  fn translates_codons(#[case] codon: &str, #[case] expected: Option<char>) {
    assert_eq!(translate(codon), expected);
  }

  #[rstest]
  fn lists_sense_codons() {
    let codons = sense_codons();
    assert_eq!(codons.len(), 61);
    assert_eq!(codons.first().map(String::as_str), Some("AAA"));
    assert_eq!(codons.last().map(String::as_str), Some("TTT"));
    assert!(!codons.contains(&"TAG".to_owned()));
  }

  #[rstest]
  fn classifies_substitutions() {
    assert!(is_transition('A', 'G'));
    assert!(is_transition('C', 'T'));
    assert!(!is_transition('A', 'A'));
    assert!(is_transversion('A', 'C'));
    assert!(is_transversion('G', 'T'));
    assert!(!is_transversion('A', 'G'));
    assert_eq!(codon_differences("ACG", "ATG"), vec![(1, 'C', 'T')]);
  }
}
