//! Reference walker over parsed YAML documents.
//!
//! The walker visits a document tree depth-first, in document order, and
//! reports every string scalar together with a path that can later rewrite
//! the same node in place. Duplicate values are reported at every site.

use serde_yaml::Value;

/// Well-known prefix marking a reference that must be buildable.
pub const STRICT_PREFIX: &str = "ko://";

/// One step down a document tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
  /// Into the mapping value under the given key.
  Key(Value),
  /// Into the sequence element at the given index.
  Index(usize),
}

/// Location of a scalar node within one document tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodePath(Vec<Step>);

impl NodePath {
  fn child(&self, step: Step) -> Self {
    let mut steps = self.0.clone();
    steps.push(step);
    Self(steps)
  }

  /// Mutable handle to the node this path names, if it still exists.
  pub fn locate<'a>(&self, root: &'a mut Value) -> Option<&'a mut Value> {
    let mut node = untag_mut(root);
    for step in &self.0 {
      node = match step {
        Step::Key(key) => node.as_mapping_mut()?.get_mut(key)?,
        Step::Index(index) => node.as_sequence_mut()?.get_mut(*index)?,
      };
      node = untag_mut(node);
    }
    Some(node)
  }
}

fn untag(mut node: &Value) -> &Value {
  while let Value::Tagged(tagged) = node {
    node = &tagged.value;
  }
  node
}

fn untag_mut(mut node: &mut Value) -> &mut Value {
  while let Value::Tagged(tagged) = node {
    node = &mut tagged.value;
  }
  node
}

/// Collect every string scalar in `doc`, in document order.
///
/// In strict mode only values whose trimmed content carries the `ko://`
/// prefix qualify; otherwise every string scalar does and the caller decides
/// buildability. Mapping keys are not candidates.
pub fn string_scalars(doc: &Value, strict: bool) -> Vec<(NodePath, String)> {
  let mut out = Vec::new();
  collect(doc, &NodePath::default(), strict, &mut out);
  out
}

fn collect(node: &Value, path: &NodePath, strict: bool, out: &mut Vec<(NodePath, String)>) {
  match untag(node) {
    Value::String(value) => {
      if !strict || value.trim().starts_with(STRICT_PREFIX) {
        out.push((path.clone(), value.clone()));
      }
    }
    Value::Mapping(map) => {
      for (key, value) in map {
        collect(value, &path.child(Step::Key(key.clone())), strict, out);
      }
    }
    Value::Sequence(seq) => {
      for (index, value) in seq.iter().enumerate() {
        collect(value, &path.child(Step::Index(index)), strict, out);
      }
    }
    _ => {}
  }
}
