use crate::make_error;
use eyre::Report;
use ndarray::ArrayView1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_isaac::Isaac64Rng;

pub fn get_random_number_generator(seed: Option<u64>) -> Isaac64Rng {
  match seed {
    None => Isaac64Rng::from_entropy(),
    Some(seed) => Isaac64Rng::seed_from_u64(seed),
  }
}

/// Draws an index with probability proportional to the given weights
pub fn random_index_weighted(weights: &ArrayView1<f64>, rng: &mut impl Rng) -> Result<usize, Report> {
  match WeightedIndex::new(weights.iter()) {
    Ok(dist) => Ok(dist.sample(rng)),
    Err(err) => make_error!("Unable to draw from weights [{weights}]: {err}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;
  use rstest::rstest;

  #[rstest]
  fn draws_only_states_with_weight() -> Result<(), Report> {
    let mut rng = get_random_number_generator(Some(42));
    let weights = array![0.0, 0.3, 0.0, 0.7];
    for _ in 0..200 {
      let i = random_index_weighted(&weights.view(), &mut rng)?;
      assert!(i == 1 || i == 3);
    }
    Ok(())
  }

  #[rstest]
  fn rejects_all_zero_weights() {
    let mut rng = get_random_number_generator(Some(1));
    assert!(random_index_weighted(&array![0.0, 0.0].view(), &mut rng).is_err());
  }

  #[rstest]
  fn is_reproducible_with_seed() -> Result<(), Report> {
    let weights = array![0.25, 0.25, 0.25, 0.25];
    let draw = |seed| -> Result<Vec<usize>, Report> {
      let mut rng = get_random_number_generator(Some(seed));
      (0..20).map(|_| random_index_weighted(&weights.view(), &mut rng)).collect()
    };
    assert_eq!(draw(7)?, draw(7)?);
    Ok(())
  }
}
