use crate::utils::error::LikelihoodError;
use crate::utils::string::quoted_list;
use crate::make_error;
use eyre::Report;
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

/// Index of a node in the tree arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl Display for NodeId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Node of a tree. The length is the length of the edge connecting the node to its parent and is ignored for the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub name: String,
  pub parent: Option<NodeId>,
  pub children: Vec<NodeId>,
  pub length: f64,
}

impl Node {
  pub fn is_tip(&self) -> bool {
    self.children.is_empty()
  }

  pub fn is_root(&self) -> bool {
    self.parent.is_none()
  }
}

/// Phylogeny stored as an arena of nodes. Every node is addressed by `NodeId`, names its parent and its ordered
/// children. Every non-root node identifies the edge above it, and edges are referred to by the name of that node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
  nodes: Vec<Node>,
  root: NodeId,
}

impl Tree {
  /// Assembles a tree from nodes whose parent and children links are already consistent, then names unnamed
  /// internal nodes and validates names and lengths.
  pub(crate) fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self, Report> {
    let mut tree = Self { nodes, root };
    tree.assign_node_names();
    tree.validate()?;
    Ok(tree)
  }

  /// Build a tree from (parent name, child name, edge length) triples. The root is the only node which is never a
  /// child. Children keep the order in which they are listed.
  pub fn from_edges<P, C>(edges: impl IntoIterator<Item = (P, C, f64)>) -> Result<Self, Report>
  where
    P: AsRef<str>,
    C: AsRef<str>,
  {
    let mut ids = IndexMap::<String, NodeId>::new();
    let mut nodes = Vec::<Node>::new();

    let mut get_or_insert = |name: &str, nodes: &mut Vec<Node>| -> NodeId {
      *ids.entry(name.to_owned()).or_insert_with(|| {
        nodes.push(Node {
          name: name.to_owned(),
          parent: None,
          children: vec![],
          length: 0.0,
        });
        NodeId(nodes.len() - 1)
      })
    };

    for (parent, child, length) in edges {
      let (parent, child) = (parent.as_ref(), child.as_ref());
      let parent_id = get_or_insert(parent, &mut nodes);
      let child_id = get_or_insert(child, &mut nodes);
      if parent_id == child_id {
        return make_error!("Node '{child}' can not be its own parent");
      }
      if let Some(existing) = nodes[child_id.0].parent {
        return make_error!(
          "Node '{child}' has more than one parent: '{}' and '{parent}'",
          nodes[existing.0].name
        );
      }
      nodes[child_id.0].parent = Some(parent_id);
      nodes[child_id.0].length = length;
      nodes[parent_id.0].children.push(child_id);
    }

    let roots = nodes.iter().positions(Node::is_root).map(NodeId).collect_vec();
    let root = match roots.as_slice() {
      [root] => *root,
      [] => return make_error!("Tree has no root: every node has a parent"),
      _ => {
        return make_error!(
          "Tree must have exactly one root, but found {}: {}",
          roots.len(),
          quoted_list(roots.iter().map(|id| &nodes[id.0].name))
        )
      }
    };

    let tree = Self::from_nodes(nodes, root)?;
    if tree.preorder().len() != tree.len() {
      return make_error!("Tree contains a cycle or nodes disconnected from the root");
    }
    Ok(tree)
  }

  /// Gives names `edge.0`, `edge.1`, ... (in pre-order) to unnamed internal nodes, and `root` to an unnamed root
  fn assign_node_names(&mut self) {
    let mut names: HashSet<String> = self.nodes.iter().map(|node| node.name.clone()).collect();
    let root = self.root;
    if self.nodes[root.0].name.is_empty() && !names.contains("root") {
      self.nodes[root.0].name = "root".to_owned();
      names.insert("root".to_owned());
    }
    let mut counter = 0;
    for id in self.preorder() {
      let node = &mut self.nodes[id.0];
      if node.name.is_empty() && !node.is_tip() {
        let mut name = format!("edge.{counter}");
        while names.contains(&name) {
          counter += 1;
          name = format!("edge.{counter}");
        }
        names.insert(name.clone());
        node.name = name;
        counter += 1;
      }
    }
  }

  fn validate(&self) -> Result<(), Report> {
    let unnamed_tips = self.tips().into_iter().filter(|&id| self.name(id).is_empty()).count();
    if unnamed_tips > 0 {
      return make_error!("Tree contains {unnamed_tips} unnamed tip(s). All tips must be named.");
    }

    let duplicates = self.nodes.iter().map(|node| &node.name).duplicates().collect_vec();
    if !duplicates.is_empty() {
      return make_error!("Node names must be unique, but found duplicates: {}", quoted_list(duplicates));
    }

    for id in self.edges() {
      let node = self.node(id);
      if !(node.length.is_finite() && node.length >= 0.0) {
        return Err(
          LikelihoodError::invalid_parameter(
            "length",
            format!("edge length must be finite and non-negative, but found {}", node.length),
          )
          .on_edge(&node.name)
          .into(),
        );
      }
    }
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub const fn root(&self) -> NodeId {
    self.root
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id.0]
  }

  pub fn name(&self, id: NodeId) -> &str {
    &self.nodes[id.0].name
  }

  pub fn parent(&self, id: NodeId) -> Option<NodeId> {
    self.nodes[id.0].parent
  }

  pub fn children(&self, id: NodeId) -> &[NodeId] {
    &self.nodes[id.0].children
  }

  pub fn length(&self, id: NodeId) -> f64 {
    self.nodes[id.0].length
  }

  pub fn is_tip(&self, id: NodeId) -> bool {
    self.nodes[id.0].is_tip()
  }

  pub fn find(&self, name: &str) -> Option<NodeId> {
    self.nodes.iter().position(|node| node.name == name).map(NodeId)
  }

  /// Like `find()`, failing with the list of known names
  pub fn get(&self, name: &str) -> Result<NodeId, Report> {
    match self.find(name) {
      Some(id) => Ok(id),
      None => make_error!(
        "Node '{name}' is not in the tree. Known nodes: {}",
        quoted_list(self.nodes.iter().map(|node| &node.name))
      ),
    }
  }

  /// Nodes in pre-order: every parent before its children, children in order
  pub fn preorder(&self) -> Vec<NodeId> {
    let mut order = Vec::with_capacity(self.len());
    let mut visited = vec![false; self.len()];
    let mut stack = vec![self.root];
    while let Some(id) = stack.pop() {
      if std::mem::replace(&mut visited[id.0], true) {
        continue;
      }
      order.push(id);
      stack.extend(self.children(id).iter().rev().copied());
    }
    order
  }

  /// Nodes in post-order: every child before its parent
  pub fn postorder(&self) -> Vec<NodeId> {
    let mut order = Vec::with_capacity(self.len());
    let mut stack = vec![(self.root, 0_usize)];
    while let Some((id, child_visit)) = stack.pop() {
      let children = self.children(id);
      if child_visit < children.len() {
        stack.push((id, child_visit + 1));
        stack.push((children[child_visit], 0));
      } else {
        order.push(id);
      }
    }
    order
  }

  /// Tips, in pre-order
  pub fn tips(&self) -> Vec<NodeId> {
    self.preorder().into_iter().filter(|&id| self.is_tip(id)).collect()
  }

  pub fn tip_names(&self) -> Vec<&str> {
    self.tips().into_iter().map(|id| self.name(id)).collect()
  }

  /// Edges, identified by their child node, in pre-order. The root has no edge.
  pub fn edges(&self) -> Vec<NodeId> {
    self.preorder().into_iter().filter(|&id| id != self.root).collect()
  }

  pub fn edge_names(&self) -> Vec<&str> {
    self.edges().into_iter().map(|id| self.name(id)).collect()
  }

  /// A tree is considered unrooted when its root has three or more children
  pub fn is_rooted(&self) -> bool {
    self.children(self.root).len() <= 2
  }

  /// Ancestors of a node, from its parent up to the root
  pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
    let mut ancestors = vec![];
    let mut current = self.parent(id);
    while let Some(parent) = current {
      ancestors.push(parent);
      current = self.parent(parent);
    }
    ancestors
  }

  /// Edges of the clade below the named node, including the edge above that node unless it is the root
  pub fn clade_edges(&self, name: &str) -> Result<Vec<NodeId>, Report> {
    let top = self.get(name)?;
    let mut edges = vec![];
    let mut stack = vec![top];
    while let Some(id) = stack.pop() {
      if id != self.root {
        edges.push(id);
      }
      stack.extend(self.children(id).iter().rev().copied());
    }
    Ok(edges)
  }

  pub fn set_length(&mut self, id: NodeId, length: f64) -> Result<(), LikelihoodError> {
    if !(length.is_finite() && length >= 0.0) {
      return Err(
        LikelihoodError::invalid_parameter(
          "length",
          format!("edge length must be finite and non-negative, but found {length}"),
        )
        .on_edge(self.name(id)),
      );
    }
    self.nodes[id.0].length = length;
    Ok(())
  }

  /// Sum of all edge lengths
  pub fn total_length(&self) -> f64 {
    self.edges().into_iter().map(|id| self.length(id)).sum()
  }

  /// Names of tips which are in this tree but not in `names`, and of `names` which are not tips of this tree. A name
  /// repeated in `names` can match only one tip, so each repetition is reported as missing from the tree.
  pub fn compare_tips<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> (Vec<String>, Vec<String>) {
    let names = names.into_iter().collect_vec();
    let tips: IndexSet<&str> = self.tip_names().into_iter().collect();
    let others: IndexSet<&str> = names.iter().copied().collect();
    let missing_in_others = tips.difference(&others).map(|&s| s.to_owned()).collect();
    let repeated = names.iter().enumerate().filter(|&(i, name)| names[..i].contains(name));
    let missing_in_tree = others
      .difference(&tips)
      .copied()
      .chain(repeated.map(|(_, name)| *name))
      .map(str::to_owned)
      .collect();
    (missing_in_others, missing_in_tree)
  }
}
