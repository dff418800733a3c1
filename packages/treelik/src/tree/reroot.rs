use crate::make_error;
use crate::tree::tree::{Node, NodeId, Tree};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::debug;

impl Tree {
  /// Copy of this tree rooted at the named internal node.
  ///
  /// Every edge on the path between the old and the new root is inverted and keeps its length. When the old root is
  /// left with a single child, it is removed and its two adjacent edges are merged into one, with the summed length.
  pub fn rerooted_at(&self, name: &str) -> Result<Self, Report> {
    let new_root = self.get(name).wrap_err("When rerooting")?;
    let old_root = self.root();
    if new_root == old_root {
      return Ok(self.clone());
    }
    if self.is_tip(new_root) {
      return make_error!("When rerooting: can not root the tree at tip '{name}'. Choose an internal node.");
    }

    let mut nodes = self.nodes().to_vec();

    // Path from the new root up to the old root: p0 = new root, ..., pk = old root
    let path = std::iter::once(new_root).chain(self.ancestors(new_root)).collect_vec();
    let lengths = path.iter().map(|&id| self.length(id)).collect_vec();

    for (i, (&child, &parent)) in path.iter().tuple_windows().enumerate() {
      nodes[parent.0].children.retain(|&c| c != child);
      nodes[child.0].children.push(parent);
      nodes[parent.0].parent = Some(child);
      nodes[parent.0].length = lengths[i];
    }
    nodes[new_root.0].parent = None;
    nodes[new_root.0].length = 0.0;

    let removed = if let [only_child] = nodes[old_root.0].children[..] {
      let above = nodes[old_root.0].parent;
      let merged_length = nodes[only_child.0].length + nodes[old_root.0].length;
      debug!(
        "When rerooting: removing former root '{}' of degree 2, merging edges into '{}'",
        nodes[old_root.0].name, nodes[only_child.0].name
      );
      nodes[only_child.0].parent = above;
      nodes[only_child.0].length = merged_length;
      if let Some(above) = above {
        for c in &mut nodes[above.0].children {
          if *c == old_root {
            *c = only_child;
          }
        }
      }
      Some(old_root)
    } else {
      None
    };

    let (nodes, root) = compact(nodes, new_root, removed);
    Tree::from_nodes(nodes, root)
  }
}

/// Drops a node from the arena and renumbers the rest
fn compact(nodes: Vec<Node>, root: NodeId, removed: Option<NodeId>) -> (Vec<Node>, NodeId) {
  let Some(removed) = removed else {
    return (nodes, root);
  };
  let remap = |id: NodeId| if id.0 > removed.0 { NodeId(id.0 - 1) } else { id };
  let nodes = nodes
    .into_iter()
    .enumerate()
    .filter(|(i, _)| *i != removed.0)
    .map(|(_, mut node)| {
      node.parent = node.parent.map(remap);
      node.children = node.children.into_iter().map(remap).collect();
      node
    })
    .collect();
  (nodes, remap(root))
}
