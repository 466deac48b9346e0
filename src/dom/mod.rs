//! Document model - an arena of nodes addressed by generation-checked ids
//!
//! A [`NodeId`] is a weak handle: it names a slot and the generation the
//! slot had when the id was issued. Removing a node bumps the slot's
//! generation, so stale ids fail lookup instead of aliasing whatever node
//! reuses the slot later.

mod selector;
mod serialized;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use selector::Selector;
pub use serialized::{SerializedDocument, SerializedId, SerializedNode};

static NEXT_DOCUMENT: AtomicU64 = AtomicU64::new(1);

/// Fresh document identity for locally built documents
pub fn next_document_id() -> u64 {
    NEXT_DOCUMENT.fetch_add(1, Ordering::Relaxed)
}

/// Weak handle to a node in one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Owning document
    pub doc: u64,
    /// Arena slot
    pub index: u32,
    /// Slot generation at issue time
    pub generation: u32,
}

/// Element or text content
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

/// Computed layout facts the snapshot needs
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Layout {
    /// Computed `display: none`
    pub display_none: bool,
    /// Computed `visibility: hidden`
    pub visibility_hidden: bool,
    /// Rendered width and height, when known
    pub size: Option<(f64, f64)>,
}

/// A node in the arena
#[derive(Debug, Clone)]
pub struct Node {
    kind: NodeKind,
    layout: Layout,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    /// Lowercase tag name, `None` for text nodes
    pub fn tag(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Element { tag, .. } => Some(tag),
            NodeKind::Text(_) => None,
        }
    }

    /// Text of a text node
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Text(t) => Some(t),
            NodeKind::Element { .. } => None,
        }
    }

    /// Attribute value by lowercase name
    pub fn attr(&self, name: &str) -> Option<&str> {
        match &self.kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    /// Whether an attribute is present
    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// All attributes in insertion order
    pub fn attrs(&self) -> &[(String, String)] {
        match &self.kind {
            NodeKind::Element { attrs, .. } => attrs,
            NodeKind::Text(_) => &[],
        }
    }

    pub fn is_element(&self) -> bool {
        matches!(self.kind, NodeKind::Element { .. })
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// A document tree
#[derive(Debug, Clone)]
pub struct Document {
    id: u64,
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl Document {
    /// Create an empty `html > body` document
    pub fn new() -> Self {
        let mut doc = Self::with_root(next_document_id(), "html");
        let root = doc.root;
        doc.element(root, "body", &[]);
        doc
    }

    fn with_root(id: u64, tag: &str) -> Self {
        let mut doc = Self {
            id,
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                doc: id,
                index: 0,
                generation: 0,
            },
        };
        doc.root = doc.create_element(tag);
        doc
    }

    /// Identity of this document
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The document element
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The `<body>` element, or the root when there is none
    pub fn body(&self) -> NodeId {
        self.children(self.root)
            .iter()
            .copied()
            .find(|c| self.tag(*c) == Some("body"))
            .unwrap_or(self.root)
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                doc: self.id,
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            doc: self.id,
            index,
            generation: 0,
        }
    }

    /// Place a node at a fixed slot (used for remote documents)
    fn place(&mut self, id: SerializedId, node: Node) -> Option<NodeId> {
        let index = id.index as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || Slot {
                generation: 0,
                node: None,
            });
        }
        let slot = &mut self.slots[index];
        if slot.node.is_some() {
            return None;
        }
        slot.generation = id.generation;
        slot.node = Some(node);
        Some(NodeId {
            doc: self.id,
            index: id.index,
            generation: id.generation,
        })
    }

    /// Create a detached element
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(Node {
            kind: NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
                attrs: Vec::new(),
            },
            layout: Layout::default(),
            parent: None,
            children: Vec::new(),
        })
    }

    /// Create a detached text node
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(Node {
            kind: NodeKind::Text(text.to_string()),
            layout: Layout::default(),
            parent: None,
            children: Vec::new(),
        })
    }

    /// Look up a live node
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if id.doc != self.id {
            return None;
        }
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if id.doc != self.id {
            return None;
        }
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Whether the node is alive and reachable from the root
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == self.root {
                return true;
            }
            match self.get(current).and_then(Node::parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Append a detached node to a parent; returns false on bad ids or cycles
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if self.get(parent).is_none() || self.get(child).is_none() || parent == child {
            return false;
        }
        if self.ancestors(parent).contains(&child) {
            return false;
        }
        self.detach(child);
        if let Some(node) = self.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
        true
    }

    /// Create an element with attributes under a parent
    pub fn element(&mut self, parent: NodeId, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let id = self.create_element(tag);
        for (name, value) in attrs {
            self.set_attr(id, name, value);
        }
        self.append_child(parent, id);
        id
    }

    /// Create a text node under a parent
    pub fn text(&mut self, parent: NodeId, content: &str) -> NodeId {
        let id = self.create_text(content);
        self.append_child(parent, id);
        id
    }

    /// Set or replace an attribute
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.get_mut(id)
        {
            let name = name.to_ascii_lowercase();
            match attrs.iter_mut().find(|(k, _)| *k == name) {
                Some(entry) => entry.1 = value.to_string(),
                None => attrs.push((name, value.to_string())),
            }
        }
    }

    /// Remove an attribute
    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = self.get_mut(id)
        {
            attrs.retain(|(k, _)| k != name);
        }
    }

    /// Replace the text of a text node
    pub fn set_text(&mut self, id: NodeId, content: &str) {
        if let Some(Node {
            kind: NodeKind::Text(text),
            ..
        }) = self.get_mut(id)
        {
            *text = content.to_string();
        }
    }

    /// Set computed layout facts
    pub fn set_layout(&mut self, id: NodeId, layout: Layout) {
        if let Some(node) = self.get_mut(id) {
            node.layout = layout;
        }
    }

    /// Unlink a node from its parent, keeping it alive
    pub fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.get(id).and_then(Node::parent) else {
            return;
        };
        if let Some(node) = self.get_mut(parent) {
            node.children.retain(|c| *c != id);
        }
        if let Some(node) = self.get_mut(id) {
            node.parent = None;
        }
    }

    /// Remove a node and its subtree, invalidating every id in it
    pub fn remove(&mut self, id: NodeId) -> bool {
        if self.get(id).is_none() || id == self.root {
            return false;
        }
        self.detach(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let slot = &mut self.slots[current.index as usize];
            if let Some(node) = slot.node.take() {
                stack.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(current.index);
            }
        }
        true
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.get(id).and_then(Node::tag)
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.get(id).and_then(|n| n.attr(name))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(Node::parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(Node::children).unwrap_or(&[])
    }

    /// Ancestors from the parent up to the root
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Descendants of a node in document order, excluding the node itself
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// Concatenated text of all descendant text nodes
    pub fn text_content(&self, id: NodeId) -> String {
        if let Some(text) = self.get(id).and_then(Node::text) {
            return text.to_string();
        }
        self.descendants(id)
            .into_iter()
            .filter_map(|d| self.get(d).and_then(Node::text))
            .collect::<Vec<_>>()
            .join("")
    }

    /// First attached element with the given `id` attribute
    pub fn element_by_id(&self, element_id: &str) -> Option<NodeId> {
        self.descendants(self.root)
            .into_iter()
            .find(|n| self.attr(*n, "id") == Some(element_id))
    }

    /// All elements under `root` matching a selector string
    pub fn query_all(&self, root: NodeId, selector: &str) -> Result<Vec<NodeId>, String> {
        Ok(Selector::parse(selector)?.matches(self, root))
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse runs of whitespace and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
