//! Named trees of leaves
//!
//! Every hierarchy the registry deals with (source arrays, segment
//! descriptors, attached views) is a [`Tree`]: a leaf or a node of named
//! children. Keys are unique within a node and kept sorted.

use std::collections::BTreeMap;

/// Separator used when flattening key paths for display and errors.
pub const PATH_SEP: char = '/';

#[derive(Debug, Clone, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    Node(BTreeMap<String, Tree<T>>),
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Tree::Node(BTreeMap::new())
    }
}

impl<T> Tree<T> {
    /// Empty internal node.
    pub fn node() -> Self {
        Self::default()
    }

    /// Builder-style insert; replaces an existing child with the same key.
    ///
    /// Inserting into a leaf turns nothing into a node: the call is ignored
    /// and the leaf returned unchanged.
    pub fn with(mut self, key: impl Into<String>, child: impl Into<Tree<T>>) -> Self {
        self.insert(key, child);
        self
    }

    /// Insert a child; returns the replaced child, if any.
    pub fn insert(&mut self, key: impl Into<String>, child: impl Into<Tree<T>>) -> Option<Tree<T>> {
        match self {
            Tree::Node(children) => children.insert(key.into(), child.into()),
            Tree::Leaf(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Tree::Leaf(value) => Some(value),
            Tree::Node(_) => None,
        }
    }

    pub fn into_leaf(self) -> Option<T> {
        match self {
            Tree::Leaf(value) => Some(value),
            Tree::Node(_) => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Tree<T>>> {
        match self {
            Tree::Node(children) => Some(children),
            Tree::Leaf(_) => None,
        }
    }

    /// Look up a descendant by `/`-separated key path.
    pub fn get(&self, path: &str) -> Option<&Tree<T>> {
        path.split(PATH_SEP)
            .filter(|part| !part.is_empty())
            .try_fold(self, |tree, key| tree.children()?.get(key))
    }

    /// Look up a leaf value by key path.
    pub fn leaf(&self, path: &str) -> Option<&T> {
        self.get(path)?.as_leaf()
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Tree<T>> {
        let mut tree = self;
        for key in path.split(PATH_SEP).filter(|part| !part.is_empty()) {
            tree = match tree {
                Tree::Node(children) => children.get_mut(key)?,
                Tree::Leaf(_) => return None,
            };
        }
        Some(tree)
    }

    pub fn leaf_mut(&mut self, path: &str) -> Option<&mut T> {
        match self.get_mut(path)? {
            Tree::Leaf(value) => Some(value),
            Tree::Node(_) => None,
        }
    }

    /// Depth-first leaves with their key paths, keys in sorted order.
    pub fn leaves(&self) -> Vec<(String, &T)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, path: String, out: &mut Vec<(String, &'a T)>) {
        match self {
            Tree::Leaf(value) => out.push((path, value)),
            Tree::Node(children) => {
                for (key, child) in children {
                    child.collect_leaves(join(&path, key), out);
                }
            }
        }
    }

    /// Mutable counterpart of [`leaves`](Self::leaves).
    pub fn leaves_mut(&mut self) -> Vec<(String, &mut T)> {
        let mut out = Vec::new();
        self.collect_leaves_mut(String::new(), &mut out);
        out
    }

    fn collect_leaves_mut<'a>(&'a mut self, path: String, out: &mut Vec<(String, &'a mut T)>) {
        match self {
            Tree::Leaf(value) => out.push((path, value)),
            Tree::Node(children) => {
                for (key, child) in children.iter_mut() {
                    child.collect_leaves_mut(join(&path, key), out);
                }
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::Node(children) => children.values().map(Tree::leaf_count).sum(),
        }
    }

    /// Same shape, leaves transformed; `f` receives each leaf's key path.
    pub fn map_with_path<U>(&self, f: &mut impl FnMut(&str, &T) -> U) -> Tree<U> {
        self.map_inner("", f)
    }

    fn map_inner<U>(&self, path: &str, f: &mut impl FnMut(&str, &T) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(value) => Tree::Leaf(f(path, value)),
            Tree::Node(children) => Tree::Node(
                children
                    .iter()
                    .map(|(key, child)| {
                        let child_path = join(path, key);
                        (key.clone(), child.map_inner(&child_path, f))
                    })
                    .collect(),
            ),
        }
    }

    /// Consume the tree, transforming each leaf.
    pub fn into_map<U>(self, f: &mut impl FnMut(T) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(value) => Tree::Leaf(f(value)),
            Tree::Node(children) => Tree::Node(
                children
                    .into_iter()
                    .map(|(key, child)| (key, child.into_map(f)))
                    .collect(),
            ),
        }
    }
}

impl<T, E> Tree<Result<T, E>> {
    /// Lift per-leaf results out of the tree; the first error in
    /// depth-first order wins.
    pub fn transpose(self) -> Result<Tree<T>, E> {
        match self {
            Tree::Leaf(result) => result.map(Tree::Leaf),
            Tree::Node(children) => children
                .into_iter()
                .map(|(key, child)| Ok((key, child.transpose()?)))
                .collect::<Result<BTreeMap<_, _>, E>>()
                .map(Tree::Node),
        }
    }
}

impl<T> From<BTreeMap<String, Tree<T>>> for Tree<T> {
    fn from(children: BTreeMap<String, Tree<T>>) -> Self {
        Tree::Node(children)
    }
}

/// Append `key` to a `/`-separated path.
pub fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", path, PATH_SEP, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree<u32> {
        Tree::node()
            .with("a", Tree::Leaf(1))
            .with("b", Tree::node().with("b2", Tree::Leaf(3)).with("b1", Tree::Leaf(2)))
            .with("empty", Tree::node())
    }

    #[test]
    fn test_leaves_are_depth_first_and_sorted() {
        let tree = sample();
        let leaves: Vec<_> = tree.leaves().into_iter().map(|(p, v)| (p, *v)).collect();
        assert_eq!(
            leaves,
            vec![("a".to_string(), 1), ("b/b1".to_string(), 2), ("b/b2".to_string(), 3)]
        );
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn test_get_by_path() {
        let mut tree = sample();
        assert_eq!(tree.leaf("b/b2"), Some(&3));
        assert_eq!(tree.leaf("b"), None);
        assert!(tree.get("b").is_some());
        assert!(tree.get("a/x").is_none());
        assert_eq!(tree.get("empty").and_then(Tree::children).map(|c| c.len()), Some(0));

        *tree.leaf_mut("b/b1").unwrap() = 20;
        assert_eq!(tree.leaf("b/b1"), Some(&20));

        for (_, value) in tree.leaves_mut() {
            *value += 1;
        }
        assert_eq!(tree.leaf("a"), Some(&2));
    }

    #[test]
    fn test_map_with_path_keeps_shape() {
        let tree = sample();
        let mapped = tree.map_with_path(&mut |path, value| format!("{path}={value}"));
        assert_eq!(mapped.leaf("b/b1").map(String::as_str), Some("b/b1=2"));
        assert!(mapped.get("empty").is_some());
    }

    #[test]
    fn test_transpose_first_error() {
        let ok: Tree<Result<u32, String>> = sample().into_map(&mut Ok);
        assert_eq!(ok.transpose().unwrap(), sample());

        let bad = sample().map_with_path(&mut |path, v| {
            if path.starts_with('b') {
                Err(path.to_string())
            } else {
                Ok(*v)
            }
        });
        assert_eq!(bad.transpose().unwrap_err(), "b/b1");
    }
}
