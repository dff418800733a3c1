use itertools::Itertools;
use std::fmt::Display;

pub fn quote_single(x: impl Display) -> String {
  format!("'{x}'")
}

/// Comma-separated list of single-quoted items, for error messages
pub fn quoted_list<T: Display>(items: impl IntoIterator<Item = T>) -> String {
  items.into_iter().map(quote_single).join(", ")
}
