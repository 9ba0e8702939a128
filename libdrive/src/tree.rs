//! Lock-per-node concurrent tree keyed by path segment. The root key
//! is the empty path. Traversals lock one node at a time and release
//! it before descending, so readers and writers on disjoint subtrees
//! never contend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::path;

pub struct TreeNode<T> {
    payload: RwLock<Option<T>>,
    children: RwLock<HashMap<String, Arc<TreeNode<T>>>>,
}

impl<T> Default for TreeNode<T> {
    fn default() -> Self {
        Self {
            payload: RwLock::new(None),
            children: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> TreeNode<T> {
    pub fn set_payload(&self, value: Option<T>) {
        *self.payload.write().unwrap() = value;
    }

    pub fn with_payload<R>(&self, f: impl FnOnce(&Option<T>) -> R) -> R {
        f(&self.payload.read().unwrap())
    }

    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut Option<T>) -> R) -> R {
        f(&mut self.payload.write().unwrap())
    }

    pub fn child(&self, segment: &str) -> Option<Arc<TreeNode<T>>> {
        self.children.read().unwrap().get(segment).cloned()
    }

    pub fn child_or_create(self: &Arc<Self>, segment: &str) -> Arc<TreeNode<T>> {
        if let Some(c) = self.child(segment) {
            return c;
        }
        let mut children = self.children.write().unwrap();
        children
            .entry(segment.to_string())
            .or_insert_with(|| Arc::new(TreeNode::default()))
            .clone()
    }

    /// Unlink a child subtree; returns whether it existed.
    pub fn remove_child(&self, segment: &str) -> bool {
        self.children.write().unwrap().remove(segment).is_some()
    }

    fn is_empty(&self) -> bool {
        self.payload.read().unwrap().is_none() && self.children.read().unwrap().is_empty()
    }
}

impl<T: Clone> TreeNode<T> {
    pub fn payload(&self) -> Option<T> {
        self.payload.read().unwrap().clone()
    }

    fn child_list(&self) -> Vec<(String, Arc<TreeNode<T>>)> {
        self.children
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub struct PathTree<T> {
    root: Arc<TreeNode<T>>,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        Self {
            root: Arc::new(TreeNode::default()),
        }
    }

    pub fn root(&self) -> Arc<TreeNode<T>> {
        self.root.clone()
    }

    pub fn get_node(&self, p: &str) -> Option<Arc<TreeNode<T>>> {
        let mut node = self.root.clone();
        for seg in path::segments(p) {
            node = node.child(seg)?;
        }
        Some(node)
    }

    /// Get-or-create every node along `p`.
    pub fn create(&self, p: &str) -> Arc<TreeNode<T>> {
        let mut node = self.root.clone();
        for seg in path::segments(p) {
            node = node.child_or_create(seg);
        }
        node
    }

    pub fn set(&self, p: &str, value: T) {
        self.create(p).set_payload(Some(value));
    }

    pub fn add_children(&self, parent: &str, children: HashMap<String, T>) {
        let node = self.create(parent);
        for (segment, value) in children {
            node.child_or_create(&segment).set_payload(Some(value));
        }
    }

    pub fn remove_child(&self, parent: &str, segment: &str) -> bool {
        match self.get_node(parent) {
            Some(node) => node.remove_child(segment),
            None => false,
        }
    }

    pub fn clear(&self) {
        self.root.set_payload(None);
        self.root.children.write().unwrap().clear();
    }
}

impl<T: Clone> PathTree<T> {
    pub fn get(&self, p: &str) -> Option<T> {
        self.get_node(p)?.payload()
    }

    /// Visit every node with a payload along the walk from the root to
    /// `p` (inclusive), in root-first order.
    pub fn visit_along<F: FnMut(&str, &T)>(&self, p: &str, mut f: F) {
        let mut node = self.root.clone();
        if let Some(v) = node.payload() {
            f("", &v);
        }
        let mut walked = String::new();
        for seg in path::segments(p) {
            node = match node.child(seg) {
                Some(n) => n,
                None => return,
            };
            if !walked.is_empty() {
                walked.push('/');
            }
            walked.push_str(seg);
            if let Some(v) = node.payload() {
                f(&walked, &v);
            }
        }
    }

    /// Visit every node with a payload in the subtree rooted at `p`
    /// (inclusive), depth-first.
    pub fn visit<F: FnMut(&str, &T)>(&self, p: &str, mut f: F) {
        let start = match self.get_node(p) {
            Some(n) => n,
            None => return,
        };
        let mut stack = vec![(p.to_string(), start)];
        while let Some((node_path, node)) = stack.pop() {
            if let Some(v) = node.payload() {
                f(&node_path, &v);
            }
            for (name, child) in node.child_list() {
                stack.push((path::join(&node_path, &name), child));
            }
        }
    }

    /// Remove payload-less leaves, bottom-up. The root always stays.
    pub fn prune(&self) {
        Self::prune_node(&self.root);
    }

    fn prune_node(node: &Arc<TreeNode<T>>) -> bool {
        for (name, child) in node.child_list() {
            if Self::prune_node(&child) {
                let mut children = node.children.write().unwrap();
                // Re-check under the parent's write lock: a concurrent
                // insert may have repopulated the child.
                if child.is_empty() {
                    children.remove(&name);
                }
            }
        }
        node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_and_remove() {
        let tree: PathTree<i32> = PathTree::new();
        tree.set("a/b/c", 3);
        tree.set("a", 1);
        assert_eq!(tree.get("a/b/c"), Some(3));
        assert_eq!(tree.get("a"), Some(1));
        assert_eq!(tree.get("a/b"), None);
        assert!(tree.get_node("a/b").is_some());
        assert!(tree.remove_child("a", "b"));
        assert_eq!(tree.get("a/b/c"), None);
    }

    #[test]
    fn root_payload() {
        let tree: PathTree<i32> = PathTree::new();
        tree.set("", 7);
        assert_eq!(tree.get(""), Some(7));
    }

    #[test]
    fn add_children_bulk() {
        let tree: PathTree<i32> = PathTree::new();
        let mut kids = HashMap::new();
        kids.insert("x".to_string(), 1);
        kids.insert("y".to_string(), 2);
        tree.add_children("dir", kids);
        assert_eq!(tree.get("dir/x"), Some(1));
        assert_eq!(tree.get("dir/y"), Some(2));
    }

    #[test]
    fn visit_along_collects_ancestors() {
        let tree: PathTree<i32> = PathTree::new();
        tree.set("", 0);
        tree.set("a", 1);
        tree.set("a/b/c", 3);
        let mut seen = Vec::new();
        tree.visit_along("a/b/c", |p, v| seen.push((p.to_string(), *v)));
        assert_eq!(
            seen,
            vec![
                ("".to_string(), 0),
                ("a".to_string(), 1),
                ("a/b/c".to_string(), 3)
            ]
        );
    }

    #[test]
    fn visit_subtree() {
        let tree: PathTree<i32> = PathTree::new();
        tree.set("a/b", 2);
        tree.set("a/b/c", 3);
        tree.set("d", 4);
        let mut seen = Vec::new();
        tree.visit("a", |p, v| seen.push((p.to_string(), *v)));
        seen.sort();
        assert_eq!(
            seen,
            vec![("a/b".to_string(), 2), ("a/b/c".to_string(), 3)]
        );
    }

    #[test]
    fn prune_removes_payloadless_leaves() {
        let tree: PathTree<i32> = PathTree::new();
        tree.set("a/b/c", 3);
        tree.get_node("a/b/c").unwrap().set_payload(None);
        tree.set("a/x", 1);
        tree.prune();
        assert!(tree.get_node("a/b").is_none());
        assert_eq!(tree.get("a/x"), Some(1));
    }
}
