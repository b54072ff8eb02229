//! Query node trees.
//!
//! Callers assemble queries as trees of tagged nodes. Nodes live in a
//! [`NodeArena`] and link to parent, first/last child and next sibling by
//! index, so the parent back-links cost nothing to own. Trees are pure
//! data — emission and planning walk them without mutating.
//!
//! A `Select` node's children are its `From`, `Join`s, `Qual`s, `OrderBy`s
//! and projection `Field`s (an empty projection means every column). A
//! `Qual`'s two children are its operands. Write nodes carry the tuple
//! pointers they act on.

pub mod build;
pub mod sql;

use crate::heap::HeapTuplePtr;
use crate::value::TypedSlot;
use crate::{Error, Result};

// ============================================================================
// Node identity
// ============================================================================

/// Index of a node within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub u32);

// ============================================================================
// Tags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// Tagged node payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Read query root.
    Select,
    /// Write: insert the given tuples into `table`.
    Insert {
        table: String,
        tuples: Vec<HeapTuplePtr>,
    },
    /// Write: update the given tuples. Explicit `UpdateField` children
    /// override the changed-field diff.
    Update {
        table: String,
        tuples: Vec<HeapTuplePtr>,
    },
    /// Write: delete the given tuples by primary key.
    Delete {
        table: String,
        tuples: Vec<HeapTuplePtr>,
    },
    /// Data definition passed through to the backend.
    Ddl { command: String },
    /// The driving table of a select.
    From { table: String },
    /// A joined table; children are the join quals.
    Join { table: String, kind: JoinKind },
    /// A column reference, optionally qualified by table name.
    Field {
        table: Option<String>,
        name: String,
    },
    /// A predicate; children are the two operands.
    Qual { op: String },
    /// Sort specification; child is the field.
    OrderBy { ascending: bool },
    /// One explicit set-column of an update; child is the value.
    UpdateField { name: String },
    /// A typed constant.
    Const(TypedSlot),
    /// A caller-bound parameter by position.
    Param(u16),
}

impl NodeKind {
    pub fn is_read(&self) -> bool {
        matches!(self, NodeKind::Select)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            NodeKind::Insert { .. }
                | NodeKind::Update { .. }
                | NodeKind::Delete { .. }
                | NodeKind::Ddl { .. }
        )
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeRef>,
    pub first_child: Option<NodeRef>,
    pub last_child: Option<NodeRef>,
    pub next_sibling: Option<NodeRef>,
}

/// Owns every node of one or more query trees.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an unlinked node.
    pub fn node(&mut self, kind: NodeKind) -> NodeRef {
        let at = NodeRef(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            parent: None,
            first_child: None,
            last_child: None,
            next_sibling: None,
        });
        at
    }

    pub fn get(&self, at: NodeRef) -> &Node {
        &self.nodes[at.0 as usize]
    }

    pub fn kind(&self, at: NodeRef) -> &NodeKind {
        &self.nodes[at.0 as usize].kind
    }

    pub fn kind_mut(&mut self, at: NodeRef) -> &mut NodeKind {
        &mut self.nodes[at.0 as usize].kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Link `child` as the rightmost child of `parent`.
    pub fn append_child(&mut self, parent: NodeRef, child: NodeRef) -> Result<()> {
        if self.nodes[child.0 as usize].parent.is_some() {
            return Err(Error::UserInput("node is already linked".into()));
        }
        self.nodes[child.0 as usize].parent = Some(parent);

        match self.nodes[parent.0 as usize].last_child {
            None => {
                self.nodes[parent.0 as usize].first_child = Some(child);
                self.nodes[parent.0 as usize].last_child = Some(child);
            }
            Some(last) => {
                self.nodes[last.0 as usize].next_sibling = Some(child);
                self.nodes[parent.0 as usize].last_child = Some(child);
            }
        }
        Ok(())
    }

    /// Link `child` as the leftmost child of `parent`.
    pub fn prepend_child(&mut self, parent: NodeRef, child: NodeRef) -> Result<()> {
        if self.nodes[child.0 as usize].parent.is_some() {
            return Err(Error::UserInput("node is already linked".into()));
        }
        self.nodes[child.0 as usize].parent = Some(parent);

        match self.nodes[parent.0 as usize].first_child {
            None => {
                self.nodes[parent.0 as usize].first_child = Some(child);
                self.nodes[parent.0 as usize].last_child = Some(child);
            }
            Some(first) => {
                self.nodes[child.0 as usize].next_sibling = Some(first);
                self.nodes[parent.0 as usize].first_child = Some(child);
            }
        }
        Ok(())
    }

    /// Children of `at`, left to right.
    pub fn children(&self, at: NodeRef) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[at.0 as usize].first_child;
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.nodes[child.0 as usize].next_sibling;
        }
        out
    }

    /// Children matching a predicate on the kind.
    pub fn children_where<'a>(
        &'a self,
        at: NodeRef,
        pred: impl Fn(&NodeKind) -> bool + 'a,
    ) -> Vec<NodeRef> {
        self.children(at)
            .into_iter()
            .filter(|c| pred(self.kind(*c)))
            .collect()
    }

    /// Depth-first walk with pre- and post-order callbacks.
    pub fn visit_depth_first(
        &self,
        root: NodeRef,
        pre: &mut dyn FnMut(NodeRef, &Node),
        post: &mut dyn FnMut(NodeRef, &Node),
    ) {
        pre(root, self.get(root));
        for child in self.children(root) {
            self.visit_depth_first(child, pre, post);
        }
        post(root, self.get(root));
    }

    /// Copy a subtree. Links between nodes inside the subtree are re-wired
    /// to their copies through the returned source→copy map.
    pub fn copy_subtree(&mut self, root: NodeRef) -> (NodeRef, hashbrown::HashMap<NodeRef, NodeRef>) {
        let mut map = hashbrown::HashMap::new();
        let copy = self.copy_rec(root, None, &mut map);
        (copy, map)
    }

    fn copy_rec(
        &mut self,
        source: NodeRef,
        parent: Option<NodeRef>,
        map: &mut hashbrown::HashMap<NodeRef, NodeRef>,
    ) -> NodeRef {
        let kind = self.nodes[source.0 as usize].kind.clone();
        let copy = self.node(kind);
        map.insert(source, copy);
        if let Some(parent) = parent {
            self.append_child(parent, copy)
                .expect("fresh node cannot be linked");
        }
        for child in self.children(source) {
            self.copy_rec(child, Some(copy), map);
        }
        copy
    }

    /// Copy a subtree into a different arena, returning the new root.
    pub fn copy_subtree_into(&self, root: NodeRef, target: &mut NodeArena) -> NodeRef {
        let kind = self.nodes[root.0 as usize].kind.clone();
        let copy = target.node(kind);
        for child in self.children(root) {
            let child_copy = self.copy_subtree_into(child, target);
            target
                .append_child(copy, child_copy)
                .expect("fresh node cannot be linked");
        }
        copy
    }

    /// Structural equality of two subtrees: kinds and child order match,
    /// parent pointers ignored.
    pub fn structural_eq(&self, a: NodeRef, b: NodeRef) -> bool {
        if self.kind(a) != self.kind(b) {
            return false;
        }
        let ca = self.children(a);
        let cb = self.children(b);
        ca.len() == cb.len()
            && ca
                .iter()
                .zip(cb.iter())
                .all(|(x, y)| self.structural_eq(*x, *y))
    }

    // ========================================================================
    // Query-shape helpers
    // ========================================================================

    /// Table names referenced by a select's FROM and JOINs, in order.
    pub fn select_tables(&self, select: NodeRef) -> Vec<String> {
        let mut out = Vec::new();
        for child in self.children(select) {
            match self.kind(child) {
                NodeKind::From { table } | NodeKind::Join { table, .. } => {
                    out.push(table.clone())
                }
                _ => {}
            }
        }
        out
    }

    /// The target table of any query node.
    pub fn target_table(&self, root: NodeRef) -> Result<String> {
        match self.kind(root) {
            NodeKind::Insert { table, .. }
            | NodeKind::Update { table, .. }
            | NodeKind::Delete { table, .. } => Ok(table.clone()),
            NodeKind::Select => self
                .select_tables(root)
                .first()
                .cloned()
                .ok_or_else(|| Error::UserInput("select has no FROM".into())),
            NodeKind::Ddl { .. } => Err(Error::UserInput("DDL has no target table".into())),
            other => Err(Error::UserInput(format!(
                "node {other:?} is not a query root"
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
