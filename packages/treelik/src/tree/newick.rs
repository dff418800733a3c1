use crate::make_error;
use crate::tree::tree::{Node, NodeId, Tree};
use bio::io::newick;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::warn;
use petgraph::visit::IntoNodeReferences;
use petgraph::Direction;
use smart_default::SmartDefault;
use std::io::{Cursor, Read, Write};
use std::path::Path;

#[derive(Clone, Debug, SmartDefault)]
pub struct NwkWriteOptions {
  /// Write names of internal nodes, including generated `edge.N` names
  #[default = true]
  pub internal_names: bool,
}

impl Tree {
  pub fn from_newick(nwk: impl AsRef<str>) -> Result<Self, Report> {
    let nwk = nwk.as_ref();
    Self::from_newick_reader(Cursor::new(nwk)).wrap_err_with(|| format!("When reading Newick string:\n    '{nwk}'"))
  }

  pub fn from_newick_file(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    let filepath = filepath.as_ref();
    let nwk = std::fs::read_to_string(filepath).wrap_err_with(|| format!("When opening file {filepath:#?}"))?;
    Self::from_newick_reader(Cursor::new(nwk.trim()))
      .wrap_err_with(|| format!("When reading Newick file {filepath:#?}"))
  }

  /// Reads the topology with the `bio` Newick parser. Edge lengths are read from the text again at full `f64`
  /// precision, because the parser stores them as `f32`.
  pub fn from_newick_reader(mut reader: impl Read) -> Result<Self, Report> {
    let mut nwk = String::new();
    reader.read_to_string(&mut nwk).wrap_err("When reading Newick")?;

    let nwk_tree = newick::read(nwk.as_bytes()).wrap_err("When parsing Newick")?;
    let g = &nwk_tree.g;

    let mut nodes = g
      .node_references()
      .map(|(_, name)| Node {
        name: if name == "N/A" { String::new() } else { name.trim().to_owned() },
        parent: None,
        children: vec![],
        length: 0.0,
      })
      .collect_vec();

    for (i, edge) in g.raw_edges().iter().enumerate() {
      let (source, target) = (edge.source().index(), edge.target().index());
      if source >= nodes.len() || target >= nodes.len() {
        return make_error!("When inserting edge {i}: node with index {source} or {target} not found");
      }
      nodes[target].parent = Some(NodeId(source));
      nodes[source].children.push(NodeId(target));
    }

    let roots = g
      .node_indices()
      .filter(|&idx| g.edges_directed(idx, Direction::Incoming).next().is_none())
      .collect_vec();
    let root = match roots.as_slice() {
      [root] => NodeId(root.index()),
      _ => return make_error!("Expected exactly one root in Newick tree, but found {}", roots.len()),
    };

    let mut tree = Tree::from_nodes(nodes, root)?;

    let lengths = scan_lengths(&nwk)?;
    let postorder = tree.postorder();
    if lengths.len() != postorder.len() {
      return make_error!(
        "Found {} edge lengths for {} nodes in Newick tree",
        lengths.len(),
        postorder.len()
      );
    }
    for (id, length) in postorder.into_iter().zip(lengths) {
      if id == tree.root() {
        continue;
      }
      match length {
        Some(length) => tree.set_length(id, length)?,
        None => warn!(
          "When reading Newick: edge above node '{}' has no length. Assuming zero.",
          tree.name(id)
        ),
      }
    }

    Ok(tree)
  }

  pub fn to_newick(&self, options: &NwkWriteOptions) -> Result<String, Report> {
    let mut buf = Vec::new();
    self.write_newick(&mut buf, options)?;
    Ok(String::from_utf8(buf)?)
  }

  pub fn write_newick_file(&self, filepath: impl AsRef<Path>, options: &NwkWriteOptions) -> Result<(), Report> {
    let filepath = filepath.as_ref();
    let mut f = std::fs::File::create(filepath).wrap_err_with(|| format!("When creating file {filepath:#?}"))?;
    self.write_newick(&mut f, options)?;
    writeln!(f)?;
    Ok(())
  }

  pub fn write_newick(&self, writer: &mut impl Write, options: &NwkWriteOptions) -> Result<(), Report> {
    let mut stack: Vec<(NodeId, usize)> = vec![(self.root(), 0)];
    while let Some((id, child_visit)) = stack.pop() {
      let children = self.children(id);

      if child_visit < children.len() {
        stack.push((id, child_visit + 1));
        if child_visit == 0 {
          write!(writer, "(")?;
        } else {
          write!(writer, ",")?;
        }
        stack.push((children[child_visit], 0));
      } else {
        if child_visit > 0 {
          write!(writer, ")")?;
        }

        if self.is_tip(id) || options.internal_names {
          write!(writer, "{}", quote_name(self.name(id)))?;
        }

        if id != self.root() {
          write!(writer, ":{}", self.length(id))?;
        }
      }
    }
    write!(writer, ";")?;
    Ok(())
  }
}

/// Lengths of all nodes in the order in which the Newick text closes them, i.e. in postorder. A node closes at the
/// `,`, `)` or `;` which follows its label and its optional `:length`. Quoted labels and `[...]` comments are skipped.
fn scan_lengths(nwk: &str) -> Result<Vec<Option<f64>>, Report> {
  let mut lengths = vec![];
  let mut pending: Option<String> = None;
  let mut chars = nwk.chars().peekable();
  while let Some(c) = chars.next() {
    match c {
      '\'' => {
        while let Some(q) = chars.next() {
          if q == '\'' && chars.peek() != Some(&'\'') {
            break;
          }
          if q == '\'' {
            chars.next();
          }
        }
      }
      '[' => {
        for q in chars.by_ref() {
          if q == ']' {
            break;
          }
        }
      }
      ':' => pending = Some(String::new()),
      ',' | ')' | ';' => {
        let length = pending
          .take()
          .map(|token| {
            token
              .trim()
              .parse::<f64>()
              .wrap_err_with(|| format!("When parsing edge length '{}'", token.trim()))
          })
          .transpose()?;
        lengths.push(length);
        if c == ';' {
          break;
        }
      }
      _ => {
        if let Some(token) = &mut pending {
          token.push(c);
        }
      }
    }
  }
  Ok(lengths)
}

fn quote_name(name: &str) -> String {
  const SPECIAL: &[char] = &['(', ')', '[', ']', ':', ';', ',', '\'', ' ', '\t'];
  if name.contains(SPECIAL) {
    format!("'{}'", name.replace('\'', "''"))
  } else {
    name.to_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn round_trips_newick() -> Result<(), Report> {
    let input = "((A:0.1,B:0.2)AB:0.1,(C:0.2,D:0.12)CD:0.05)root;";
    let tree = Tree::from_newick(input)?;
    assert_eq!(tree.to_newick(&NwkWriteOptions::default())?, input);
    Ok(())
  }

  #[rstest]
  fn reads_lengths_exactly() -> Result<(), Report> {
    let tree = Tree::from_newick("((A:0.1,B:0.2)AB:0.3,C:0.7)root;")?;
    let ab = tree.get("AB")?;
    assert_eq!(tree.length(ab), 0.3);
    assert_eq!(tree.length(tree.get("C")?), 0.7);
    assert_ulps_eq!(tree.total_length(), 1.3);
    Ok(())
  }

  #[rstest]
  fn reads_lengths_at_full_precision() -> Result<(), Report> {
    let tree = Tree::from_newick("(A:0.123456789012345,(B:0.0000000025,C:0.5)BC:1.000000001)root;")?;
    assert_eq!(tree.length(tree.get("A")?), 0.123_456_789_012_345);
    assert_eq!(tree.length(tree.get("B")?), 2.5e-9);
    assert_eq!(tree.length(tree.get("BC")?), 1.000_000_001);
    Ok(())
  }

  #[rstest]
  fn scans_lengths_in_postorder() -> Result<(), Report> {
    assert_eq!(
      scan_lengths("(('A,[x]':0.1,B)[c:1]AB:0.3,'it''s':1e-3)root;")?,
      vec![Some(0.1), None, Some(0.3), Some(1e-3), None]
    );
    assert!(scan_lengths("(A:x,B:1);").is_err());
    Ok(())
  }

  #[rstest]
  fn names_unnamed_internal_nodes() -> Result<(), Report> {
    let tree = Tree::from_newick("((A:0.1,B:0.2):0.1,(C:0.2,D:0.12):0.05);")?;
    assert_eq!(tree.name(tree.root()), "root");
    assert_eq!(tree.edge_names(), vec!["edge.0", "A", "B", "edge.1", "C", "D"]);
    assert_eq!(
      tree.to_newick(&NwkWriteOptions { internal_names: false })?,
      "((A:0.1,B:0.2):0.1,(C:0.2,D:0.12):0.05);"
    );
    Ok(())
  }

  #[rstest]
  fn round_trips_through_file() -> Result<(), Report> {
    let tree = Tree::from_newick("((A:0.1,B:0.2)AB:0.1,C:0.3)root;")?;
    let filepath = std::env::temp_dir().join(format!("treelik-newick-{}.nwk", std::process::id()));
    tree.write_newick_file(&filepath, &NwkWriteOptions::default())?;
    let restored = Tree::from_newick_file(&filepath)?;
    std::fs::remove_file(&filepath)?;
    assert_eq!(restored, tree);
    Ok(())
  }

  #[rstest]
  fn rejects_unnamed_tips() {
    assert!(Tree::from_newick("((:0.1,B:0.2)AB:0.1,C:0.1)root;").is_err());
  }

  #[rstest]
  fn rejects_duplicate_tip_names() {
    assert!(Tree::from_newick("((A:0.1,A:0.2)AB:0.1,C:0.1)root;").is_err());
  }

  #[rstest]
  fn quotes_special_names() {
    assert_eq!(quote_name("plain_name"), "plain_name");
    assert_eq!(quote_name("with space"), "'with space'");
    assert_eq!(quote_name("it's"), "'it''s'");
  }
}
