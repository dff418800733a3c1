use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::Path;

pub fn json_read_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(filepath: P) -> Result<T, Report> {
  let filepath = filepath.as_ref();
  let file = std::fs::File::open(filepath).wrap_err_with(|| format!("When opening file '{}'", filepath.display()))?;
  json_read(BufReader::new(file)).wrap_err_with(|| format!("When reading JSON file: '{}'", filepath.display()))
}

pub fn json_read_str<T: for<'de> Deserialize<'de>>(s: impl AsRef<str>) -> Result<T, Report> {
  json_read(Cursor::new(s.as_ref())).wrap_err("When reading JSON string")
}

pub fn json_read<T: for<'de> Deserialize<'de>>(reader: impl std::io::Read) -> Result<T, Report> {
  serde_json::from_reader(reader).wrap_err("When parsing JSON")
}

#[derive(Clone, Copy, Debug)]
pub struct JsonPretty(pub bool);

pub fn json_write_file<T: Serialize>(filepath: impl AsRef<Path>, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let file =
    std::fs::File::create(filepath).wrap_err_with(|| format!("When creating file '{}'", filepath.display()))?;
  let mut writer = BufWriter::new(file);
  json_write(&mut writer, obj, pretty).wrap_err_with(|| format!("When writing JSON file: '{}'", filepath.display()))?;
  writeln!(writer)?;
  Ok(())
}

pub fn json_write_str<T: Serialize>(obj: &T, pretty: JsonPretty) -> Result<String, Report> {
  if pretty.0 {
    serde_json::to_string_pretty(obj)
  } else {
    serde_json::to_string(obj)
  }
  .wrap_err("When writing JSON string")
}

pub fn json_write<W: Write, T: Serialize>(writer: W, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  if pretty.0 {
    serde_json::to_writer_pretty(writer, &obj)
  } else {
    serde_json::to_writer(writer, &obj)
  }
  .wrap_err("When writing JSON")
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::{indexmap, IndexMap};
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn round_trips_through_file() -> Result<(), Report> {
    let value: IndexMap<String, Vec<f64>> = indexmap! {
      "freqs".to_owned() => vec![0.1, 0.2, 0.3, 0.4],
      "length".to_owned() => vec![0.123_456_789_012_345_6],
    };
    let filepath = std::env::temp_dir().join(format!("treelik-json-{}.json", std::process::id()));
    json_write_file(&filepath, &value, JsonPretty(true))?;
    let restored: IndexMap<String, Vec<f64>> = json_read_file(&filepath)?;
    std::fs::remove_file(&filepath)?;
    assert_eq!(restored, value);
    Ok(())
  }

  #[rstest]
  fn names_file_which_can_not_be_read() {
    let report = json_read_file::<Vec<f64>, _>("/nonexistent/treelik.json").unwrap_err();
    assert!(format!("{report:#}").contains("/nonexistent/treelik.json"));
  }
}
