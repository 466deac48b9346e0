//! Snapshot module - accessibility tree rendering with stable refs
//!
//! A snapshot walks a document depth-first, renders one line per emitted
//! node and hands out sequential refs (`e1`, `e2`, ...) to the nodes worth
//! addressing. Refs hold node ids, never nodes: resolving a ref re-checks
//! that the node is still in the tree.

pub mod aria;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::core::{BrowseError, Result};
use crate::dom::{normalize_whitespace, Document, NodeId, Selector};
use crate::protocol::command::SnapshotOptions;

/// Placeholder when interactive-only mode finds nothing
pub const NO_INTERACTIVE: &str = "(no interactive elements)";
/// Placeholder for an empty tree
pub const EMPTY_PAGE: &str = "(empty page)";

/// One addressable element of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefEntry {
    #[serde(rename = "ref")]
    pub ref_id: String,
    /// Role selector that re-finds the element without the ref
    pub selector: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordinal among elements sharing role and name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nth: Option<usize>,
    #[serde(skip)]
    pub node: Option<NodeId>,
}

impl RefEntry {
    /// Check if this is an interactive element
    pub fn is_interactive(&self) -> bool {
        aria::is_interactive(&self.role)
    }

    /// Check if this is a text input
    pub fn is_input(&self) -> bool {
        matches!(
            self.role.as_str(),
            "textbox" | "searchbox" | "combobox" | "spinbutton"
        )
    }
}

/// Result of one snapshot generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Rendered tree
    pub tree: String,
    /// Entries in ref order
    pub refs: Vec<RefEntry>,
}

impl Snapshot {
    /// Count the number of elements with refs
    pub fn count_elements(&self) -> usize {
        self.refs.len()
    }

    /// Get an entry by ref token
    pub fn get(&self, token: &str) -> Option<&RefEntry> {
        let ref_id = parse_ref(token)?;
        self.refs.iter().find(|e| e.ref_id == ref_id)
    }

    /// Get all interactive elements
    pub fn interactive_elements(&self) -> Vec<&RefEntry> {
        self.refs.iter().filter(|e| e.is_interactive()).collect()
    }

    /// Get elements by role
    pub fn elements_by_role(&self, role: &str) -> Vec<&RefEntry> {
        self.refs.iter().filter(|e| e.role == role).collect()
    }

    /// Find elements containing text in their name
    pub fn find_by_text(&self, text: &str) -> Vec<&RefEntry> {
        let text_lower = text.to_lowercase();
        self.refs
            .iter()
            .filter(|e| {
                e.name
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase().contains(&text_lower))
            })
            .collect()
    }

    /// Response payload: `{snapshot, refs: {eN: entry}}`
    pub fn to_value(&self) -> Value {
        let refs: Map<String, Value> = self
            .refs
            .iter()
            .map(|e| (e.ref_id.clone(), serde_json::to_value(e).unwrap_or(Value::Null)))
            .collect();
        json!({ "snapshot": self.tree, "refs": refs })
    }
}

/// Parse a user-supplied ref token (`@e3`, `ref=e3`, `e3`) into `e3`
pub fn parse_ref(token: &str) -> Option<String> {
    let token = token.trim();
    let bare = token
        .strip_prefix('@')
        .or_else(|| token.strip_prefix("ref="))
        .unwrap_or(token);
    let digits = bare.strip_prefix('e')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(bare.to_string())
}

/// Ref table of the latest snapshot generation
#[derive(Debug, Clone, Default)]
pub struct RefMap {
    entries: HashMap<String, NodeId>,
}

impl RefMap {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            entries: snapshot
                .refs
                .iter()
                .filter_map(|e| e.node.map(|n| (e.ref_id.clone(), n)))
                .collect(),
        }
    }

    /// Node id for a token; `None` when the token is not a ref at all
    pub fn lookup(&self, token: &str) -> Option<Result<NodeId>> {
        let ref_id = parse_ref(token)?;
        Some(
            self.entries
                .get(&ref_id)
                .copied()
                .ok_or(BrowseError::RefNotFound(ref_id)),
        )
    }

    /// Resolve a ref against a document, failing if its node left the tree
    pub fn resolve(&self, token: &str, doc: &Document) -> Result<NodeId> {
        let node = self
            .lookup(token)
            .ok_or_else(|| BrowseError::RefNotFound(token.to_string()))??;
        if doc.is_attached(node) {
            Ok(node)
        } else {
            Err(BrowseError::RefNotFound(token.trim().to_string()))
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum LineKind {
    Text(String),
    Node {
        role: String,
        name: String,
        ref_index: Option<usize>,
        annotations: Vec<String>,
    },
}

struct Line {
    depth: usize,
    kind: LineKind,
}

impl Line {
    fn has_ref(&self) -> bool {
        matches!(
            self.kind,
            LineKind::Node {
                ref_index: Some(_),
                ..
            }
        )
    }
}

struct Walker<'a> {
    doc: &'a Document,
    options: &'a SnapshotOptions,
    lines: Vec<Line>,
    refs: Vec<RefEntry>,
    counts: HashMap<(String, String), usize>,
}

fn is_structural(role: &str) -> bool {
    matches!(role, "generic" | "group" | "rowgroup" | "list" | "table" | "row")
}

impl<'a> Walker<'a> {
    fn visit(&mut self, id: NodeId, depth: usize) {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return;
        }
        let doc = self.doc;
        let Some(node) = doc.get(id) else {
            return;
        };

        if let Some(text) = node.text() {
            if !self.options.interactive {
                let text = normalize_whitespace(text);
                if !text.is_empty() {
                    self.lines.push(Line {
                        depth,
                        kind: LineKind::Text(text),
                    });
                }
            }
            return;
        }

        if aria::is_hidden(doc, id) {
            return;
        }

        let role = aria::role_of(doc, id);
        let name = aria::accessible_name(doc, id, &role);
        let interactive = aria::is_interactive(&role);
        let transparent = matches!(role.as_str(), "none" | "presentation");

        let emit = if self.options.interactive {
            interactive
        } else if self.options.compact {
            !transparent && !(is_structural(&role) && name.is_empty())
        } else {
            !transparent
        };

        let mut child_depth = depth;
        let mut skip_text = false;
        if emit {
            let wants_ref = interactive || (aria::is_content(&role) && !name.is_empty());
            let ref_index = wants_ref.then(|| self.assign_ref(id, &role, &name));
            skip_text = !name.is_empty() && aria::names_from_content(&role);
            self.lines.push(Line {
                depth,
                kind: LineKind::Node {
                    annotations: aria::annotations(doc, id, &role),
                    role,
                    name,
                    ref_index,
                },
            });
            child_depth = depth + 1;
        }

        for &child in doc.children(id) {
            if skip_text && doc.get(child).is_some_and(|c| !c.is_element()) {
                continue;
            }
            self.visit(child, child_depth);
        }
    }

    fn assign_ref(&mut self, node: NodeId, role: &str, name: &str) -> usize {
        let ordinal = self
            .counts
            .entry((role.to_string(), name.to_string()))
            .or_insert(0);
        let nth = *ordinal;
        *ordinal += 1;

        self.refs.push(RefEntry {
            ref_id: format!("e{}", self.refs.len() + 1),
            selector: String::new(),
            role: role.to_string(),
            name: (!name.is_empty()).then(|| name.to_string()),
            nth: Some(nth),
            node: Some(node),
        });
        self.refs.len() - 1
    }

    fn finish(mut self) -> Snapshot {
        for entry in &mut self.refs {
            let name = entry.name.clone().unwrap_or_default();
            if self.counts.get(&(entry.role.clone(), name.clone())) == Some(&1) {
                entry.nth = None;
            }
            entry.selector = Selector::role_selector(&entry.role, &name, entry.nth);
        }

        let keep: Vec<bool> = if self.options.compact {
            compact_mask(&self.lines)
        } else {
            vec![true; self.lines.len()]
        };

        let rendered: Vec<String> = self
            .lines
            .iter()
            .zip(keep)
            .filter(|(_, keep)| *keep)
            .map(|(line, _)| render_line(line, &self.refs))
            .collect();

        let tree = if rendered.is_empty() {
            if self.options.interactive {
                NO_INTERACTIVE.to_string()
            } else {
                EMPTY_PAGE.to_string()
            }
        } else {
            rendered.join("\n")
        };

        Snapshot {
            tree,
            refs: self.refs,
        }
    }
}

/// Keep lines with a ref or text, and structural lines with a ref below them
fn compact_mask(lines: &[Line]) -> Vec<bool> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if line.has_ref() || matches!(line.kind, LineKind::Text(_)) {
                return true;
            }
            lines[i + 1..]
                .iter()
                .take_while(|l| l.depth > line.depth)
                .any(Line::has_ref)
        })
        .collect()
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn render_line(line: &Line, refs: &[RefEntry]) -> String {
    let indent = "  ".repeat(line.depth);
    match &line.kind {
        LineKind::Text(text) => format!("{}- text: {}", indent, quoted(text)),
        LineKind::Node {
            role,
            name,
            ref_index,
            annotations,
        } => {
            let mut out = format!("{}- {}", indent, role);
            if !name.is_empty() {
                out.push(' ');
                out.push_str(&quoted(name));
            }
            if let Some(entry) = ref_index.and_then(|i| refs.get(i)) {
                out.push_str(&format!(" [ref={}]", entry.ref_id));
                if let Some(nth) = entry.nth {
                    out.push_str(&format!(" [nth={}]", nth));
                }
            }
            for annotation in annotations {
                out.push_str(&format!(" [{}]", annotation));
            }
            out
        }
    }
}

/// Take a snapshot of `doc`.
///
/// With no `root` the walk starts below the body; a given root is itself
/// part of the output.
pub fn take_snapshot(doc: &Document, root: Option<NodeId>, options: &SnapshotOptions) -> Snapshot {
    let mut walker = Walker {
        doc,
        options,
        lines: Vec::new(),
        refs: Vec::new(),
        counts: HashMap::new(),
    };

    match root {
        Some(root) => walker.visit(root, 0),
        None => {
            for &child in doc.children(doc.body()) {
                walker.visit(child, 0);
            }
        }
    }

    walker.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_page() -> Document {
        let mut doc = Document::new();
        let body = doc.body();
        let h1 = doc.element(body, "h1", &[]);
        doc.text(h1, "Welcome");
        let form = doc.element(body, "form", &[("aria-label", "Login")]);
        let wrapper = doc.element(form, "div", &[]);
        doc.element(wrapper, "input", &[("type", "email"), ("placeholder", "Email")]);
        let submit = doc.element(form, "button", &[("type", "submit")]);
        doc.text(submit, "Sign in");
        let cancel = doc.element(form, "button", &[]);
        doc.text(cancel, "Cancel");
        let cancel2 = doc.element(form, "button", &[]);
        doc.text(cancel2, "Cancel");
        doc.element(body, "div", &[]);
        let script = doc.element(body, "script", &[]);
        doc.text(script, "var x = 1;");
        doc
    }

    #[test]
    fn test_full_snapshot() {
        let doc = login_page();
        let snap = take_snapshot(&doc, None, &SnapshotOptions::default());
        assert_eq!(
            snap.tree,
            [
                "- heading \"Welcome\" [ref=e1] [level=1]",
                "- form \"Login\"",
                "  - generic",
                "    - textbox \"Email\" [ref=e2]",
                "  - button \"Sign in\" [ref=e3]",
                "  - button \"Cancel\" [ref=e4] [nth=0]",
                "  - button \"Cancel\" [ref=e5] [nth=1]",
                "- generic",
            ]
            .join("\n")
        );
        assert_eq!(snap.count_elements(), 5);
        assert_eq!(snap.refs[3].selector, "role=button[name=\"Cancel\"] >> nth=0");
        assert_eq!(snap.refs[2].selector, "role=button[name=\"Sign in\"]");
        assert_eq!(snap.refs[2].nth, None);
    }

    #[test]
    fn test_interactive_and_compact() {
        let doc = login_page();
        let interactive = take_snapshot(
            &doc,
            None,
            &SnapshotOptions {
                interactive: true,
                ..Default::default()
            },
        );
        assert_eq!(
            interactive.tree.lines().next(),
            Some("- textbox \"Email\" [ref=e1]")
        );
        assert_eq!(interactive.refs.len(), 4);

        let compact = take_snapshot(
            &doc,
            None,
            &SnapshotOptions {
                compact: true,
                ..Default::default()
            },
        );
        assert!(!compact.tree.contains("generic"));
        // The unnamed wrapper is gone, so the textbox sits right under the form
        assert!(compact.tree.contains("\n  - textbox \"Email\" [ref=e2]"));
    }

    #[test]
    fn test_compact_drops_empty_wrappers() {
        let mut doc = Document::new();
        let body = doc.body();
        let nav = doc.element(body, "ul", &[]);
        let item = doc.element(nav, "li", &[]);
        let link = doc.element(item, "a", &[("href", "/docs")]);
        doc.text(link, "Docs");
        let empty = doc.element(body, "ul", &[]);
        doc.element(empty, "li", &[]);

        let snap = take_snapshot(
            &doc,
            None,
            &SnapshotOptions {
                compact: true,
                ..Default::default()
            },
        );
        assert_eq!(
            snap.tree,
            "- listitem \"Docs\" [ref=e1]\n  - link \"Docs\" [ref=e2]"
        );
    }

    #[test]
    fn test_empty_placeholders() {
        let doc = Document::new();
        let snap = take_snapshot(&doc, None, &SnapshotOptions::default());
        assert_eq!(snap.tree, EMPTY_PAGE);

        let mut doc = Document::new();
        let body = doc.body();
        let p = doc.element(body, "p", &[]);
        doc.text(p, "just text");
        let snap = take_snapshot(
            &doc,
            None,
            &SnapshotOptions {
                interactive: true,
                ..Default::default()
            },
        );
        assert_eq!(snap.tree, NO_INTERACTIVE);
    }

    #[test]
    fn test_max_depth_and_sub_root() {
        let doc = login_page();
        let snap = take_snapshot(
            &doc,
            None,
            &SnapshotOptions {
                max_depth: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(snap.tree.lines().count(), 3);

        let form = doc.query_all(doc.root(), "form").unwrap()[0];
        let snap = take_snapshot(&doc, Some(form), &SnapshotOptions::default());
        assert!(snap.tree.starts_with("- form \"Login\""));
        assert_eq!(snap.refs[0].role, "textbox");
    }

    #[test]
    fn test_deterministic() {
        let doc = login_page();
        let a = take_snapshot(&doc, None, &SnapshotOptions::default());
        let b = take_snapshot(&doc, None, &SnapshotOptions::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_ref_forms() {
        assert_eq!(parse_ref("@e3").as_deref(), Some("e3"));
        assert_eq!(parse_ref("ref=e3").as_deref(), Some("e3"));
        assert_eq!(parse_ref("e3").as_deref(), Some("e3"));
        assert_eq!(parse_ref("bogus"), None);
        assert_eq!(parse_ref("e"), None);
        assert_eq!(parse_ref("#e3"), None);
        assert_eq!(parse_ref("e3x"), None);
    }

    #[test]
    fn test_resolve_all_forms_and_stale() {
        let mut doc = login_page();
        let snap = take_snapshot(&doc, None, &SnapshotOptions::default());
        let refs = RefMap::from_snapshot(&snap);

        let node = refs.resolve("@e3", &doc).unwrap();
        assert_eq!(refs.resolve("ref=e3", &doc).unwrap(), node);
        assert_eq!(refs.resolve("e3", &doc).unwrap(), node);
        assert!(matches!(refs.resolve("e99", &doc), Err(BrowseError::RefNotFound(_))));
        assert!(refs.lookup("#submit").is_none());

        doc.remove(node);
        assert!(matches!(refs.resolve("e3", &doc), Err(BrowseError::RefNotFound(_))));
        // A node reusing the slot must not be picked up
        let body = doc.body();
        doc.element(body, "button", &[]);
        assert!(refs.resolve("e3", &doc).is_err());
    }

    #[test]
    fn test_helper_queries_and_payload() {
        let doc = login_page();
        let snap = take_snapshot(&doc, None, &SnapshotOptions::default());
        assert_eq!(snap.interactive_elements().len(), 4);
        assert_eq!(snap.elements_by_role("button").len(), 3);
        assert_eq!(snap.find_by_text("cancel").len(), 2);
        assert_eq!(snap.get("@e1").map(|e| e.role.as_str()), Some("heading"));
        assert!(snap.get("e1").is_some_and(|e| !e.is_input()));

        let payload = snap.to_value();
        assert_eq!(payload["refs"]["e4"]["nth"], 0);
        assert_eq!(payload["refs"]["e3"]["name"], "Sign in");
        assert!(payload["refs"]["e3"].get("nth").is_none());
        assert!(payload["snapshot"].as_str().unwrap().contains("[ref=e1]"));
    }
}
