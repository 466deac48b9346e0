//! Serialized node form used by fixtures and bridge peers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Document, Layout, Node, NodeId, NodeKind};
use crate::core::{BrowseError, Result};

/// Remote slot indices may exceed the node count by this much plus a
/// factor of four, leaving room for slots the peer freed
const REMOTE_SLOT_SLACK: usize = 65_536;

/// Slot identity assigned by a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedId {
    pub index: u32,
    #[serde(default)]
    pub generation: u32,
}

/// One node of a serialized tree; a node without `tag` is text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SerializedId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedNode>,
    /// Computed display none or visibility hidden
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    /// Rendered width and height
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<[f64; 2]>,
}

/// A whole document as sent by a bridge peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedDocument {
    /// Peer-side document identity
    pub id: u64,
    pub root: SerializedNode,
}

impl SerializedNode {
    /// Element builder
    pub fn element(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            ..Self::default()
        }
    }

    /// Text node builder
    pub fn text(content: &str) -> Self {
        Self {
            text: Some(content.to_string()),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn child(mut self, child: SerializedNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn rect(mut self, width: f64, height: f64) -> Self {
        self.rect = Some([width, height]);
        self
    }

    /// Number of nodes in this subtree, including itself
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SerializedNode::count).sum::<usize>()
    }

    fn to_node(&self) -> Node {
        let kind = match &self.tag {
            Some(tag) => NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
                attrs: self
                    .attrs
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                    .collect(),
            },
            None => NodeKind::Text(self.text.clone().unwrap_or_default()),
        };
        Node {
            kind,
            layout: Layout {
                display_none: self.hidden,
                visibility_hidden: false,
                size: self.rect.map(|[w, h]| (w, h)),
            },
            parent: None,
            children: Vec::new(),
        }
    }
}

impl Document {
    /// Build a local document from a serialized body.
    ///
    /// A `body` root is wrapped in `html`; any other root is wrapped in
    /// `html > body`.
    pub fn from_serialized(body: &SerializedNode) -> Self {
        let mut doc = Self::new();
        let target = doc.body();
        if body.tag.as_deref() == Some("body") {
            for (name, value) in &body.attrs {
                doc.set_attr(target, name, value);
            }
            for child in &body.children {
                doc.build_local(target, child);
            }
        } else {
            doc.build_local(target, body);
        }
        doc
    }

    fn build_local(&mut self, parent: NodeId, node: &SerializedNode) {
        let id = self.alloc(node.to_node());
        self.append_child(parent, id);
        for child in &node.children {
            self.build_local(id, child);
        }
    }

    /// Build a document whose slots are assigned by a remote peer.
    ///
    /// Every node must carry an `id` so that handles stay valid across
    /// repeated fetches of the same peer document.
    pub fn from_remote(remote: &SerializedDocument) -> Result<Self> {
        let mut doc = Self {
            id: remote.id,
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                doc: remote.id,
                index: 0,
                generation: 0,
            },
        };
        let limit = remote
            .root
            .count()
            .saturating_mul(4)
            .saturating_add(REMOTE_SLOT_SLACK);
        doc.root = doc.place_remote(None, &remote.root, limit)?;
        doc.free = doc
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_none())
            .map(|(i, _)| i as u32)
            .collect();
        Ok(doc)
    }

    /// Serialize the whole tree with slot ids, as a bridge peer sends it
    pub fn to_remote(&self) -> SerializedDocument {
        SerializedDocument {
            id: self.id,
            root: self.serialize_node(self.root),
        }
    }

    fn serialize_node(&self, id: NodeId) -> SerializedNode {
        let Some(node) = self.get(id) else {
            return SerializedNode::default();
        };
        let layout = node.layout();
        let mut out = match node.kind() {
            NodeKind::Element { tag, attrs } => SerializedNode {
                tag: Some(tag.clone()),
                attrs: attrs.iter().cloned().collect(),
                ..SerializedNode::default()
            },
            NodeKind::Text(text) => SerializedNode::text(text),
        };
        out.id = Some(SerializedId {
            index: id.index,
            generation: id.generation,
        });
        out.hidden = layout.display_none || layout.visibility_hidden;
        out.rect = layout.size.map(|(w, h)| [w, h]);
        out.children = node
            .children()
            .iter()
            .map(|child| self.serialize_node(*child))
            .collect();
        out
    }

    fn place_remote(
        &mut self,
        parent: Option<NodeId>,
        node: &SerializedNode,
        limit: usize,
    ) -> Result<NodeId> {
        let slot = node
            .id
            .ok_or_else(|| BrowseError::engine("remote document node without id"))?;
        if slot.index as usize >= limit {
            return Err(BrowseError::engine(format!(
                "remote node id {} out of range (limit {})",
                slot.index, limit
            )));
        }
        let id = self
            .place(slot, node.to_node())
            .ok_or_else(|| BrowseError::engine(format!("duplicate remote node id {}", slot.index)))?;
        if let Some(parent) = parent {
            self.append_child(parent, id);
        }
        for child in &node.children {
            self.place_remote(Some(id), child, limit)?;
        }
        Ok(id)
    }
}
