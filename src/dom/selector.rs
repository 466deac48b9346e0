//! Small selector engine
//!
//! Supports what refs and scripts need:
//!
//! - CSS compounds (`tag`, `#id`, `.class`, `[attr]`, `[attr=value]`)
//!   joined by the descendant combinator
//! - `role=button[name="Submit"]`, matched on computed role and name
//! - `text=Sign in` (substring, case-insensitive) or `text="Sign in"` (exact)
//! - a trailing `>> nth=K` picking the K-th match (0-based)

use super::{normalize_whitespace, Document, NodeId};
use crate::snapshot::aria;

/// A parsed selector
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    base: Base,
    nth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Base {
    Css(Vec<Compound>),
    Role { role: String, name: Option<String> },
    Text { text: String, exact: bool },
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Selector {
    /// Parse a selector string
    pub fn parse(input: &str) -> Result<Self, String> {
        let (body, nth) = match split_chain(input) {
            Some((head, tail)) => {
                let tail = tail.trim();
                let index = tail
                    .strip_prefix("nth=")
                    .ok_or_else(|| format!("unsupported selector part '{}'", tail))?;
                let index = index
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid nth index '{}'", index))?;
                (head.trim(), Some(index))
            }
            None => (input.trim(), None),
        };
        if body.is_empty() {
            return Err(format!("invalid selector '{}'", input));
        }

        let base = if let Some(rest) = body.strip_prefix("role=") {
            parse_role(rest)?
        } else if let Some(rest) = body.strip_prefix("text=") {
            match unquote(rest.trim()) {
                Some(text) => Base::Text { text, exact: true },
                None => Base::Text {
                    text: rest.trim().to_string(),
                    exact: false,
                },
            }
        } else {
            Base::Css(parse_css(body)?)
        };

        Ok(Self { base, nth })
    }

    /// Selector string for the `nth` element with a role and name
    pub fn role_selector(role: &str, name: &str, nth: Option<usize>) -> String {
        let mut out = format!("role={}", role);
        if !name.is_empty() {
            out.push_str(&format!("[name={}]", quote(name)));
        }
        if let Some(nth) = nth {
            out.push_str(&format!(" >> nth={}", nth));
        }
        out
    }

    /// Matching elements under `root` in document order
    pub fn matches(&self, doc: &Document, root: NodeId) -> Vec<NodeId> {
        let elements = doc
            .descendants(root)
            .into_iter()
            .filter(|n| doc.get(*n).is_some_and(|node| node.is_element()));

        let mut found: Vec<NodeId> = match &self.base {
            Base::Css(chain) => elements
                .filter(|n| matches_chain(doc, *n, chain))
                .collect(),
            Base::Role { role, name } => elements
                .filter(|n| aria::is_visible_in_tree(doc, *n))
                .filter(|n| aria::role_of(doc, *n) == *role)
                .filter(|n| {
                    name.as_ref()
                        .map_or(true, |name| aria::accessible_name(doc, *n, role) == *name)
                })
                .collect(),
            Base::Text { text, exact } => {
                let needle = if *exact {
                    text.clone()
                } else {
                    text.to_lowercase()
                };
                let contains = |n: NodeId| {
                    let content = normalize_whitespace(&doc.text_content(n));
                    if *exact {
                        content == needle
                    } else {
                        content.to_lowercase().contains(&needle)
                    }
                };
                elements
                    .filter(|n| contains(*n))
                    // Innermost match only
                    .filter(|n| {
                        !doc.children(*n)
                            .iter()
                            .any(|c| doc.get(*c).is_some_and(|c| c.is_element()) && contains(*c))
                    })
                    .collect()
            }
        };

        if let Some(nth) = self.nth {
            found = found.into_iter().nth(nth).into_iter().collect();
        }
        found
    }
}

/// Split at the last `>>` outside quotes and brackets
fn split_chain(input: &str) -> Option<(&str, &str)> {
    let bytes = input.as_bytes();
    let mut last = None;
    let mut depth = 0usize;
    let mut quoted = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quoted => i += 1,
            b'"' => quoted = !quoted,
            b'[' if !quoted => depth += 1,
            b']' if !quoted => depth = depth.saturating_sub(1),
            b'>' if !quoted && depth == 0 && bytes.get(i + 1) == Some(&b'>') => {
                last = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    last.map(|i| (&input[..i], &input[i + 2..]))
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn parse_role(rest: &str) -> Result<Base, String> {
    let (role, filter) = match rest.find('[') {
        Some(i) => (&rest[..i], Some(&rest[i..])),
        None => (rest, None),
    };
    let role = role.trim();
    if role.is_empty() {
        return Err("role selector without a role".to_string());
    }

    let name = match filter {
        None => None,
        Some(filter) => {
            let inner = filter
                .strip_prefix('[')
                .and_then(|f| f.strip_suffix(']'))
                .and_then(|f| f.strip_prefix("name="))
                .ok_or_else(|| format!("invalid role filter '{}'", filter))?;
            Some(unquote(inner).ok_or_else(|| format!("unquoted role name '{}'", inner))?)
        }
    };

    Ok(Base::Role {
        role: role.to_ascii_lowercase(),
        name,
    })
}

fn parse_css(input: &str) -> Result<Vec<Compound>, String> {
    split_descendants(input)?
        .into_iter()
        .map(parse_compound)
        .collect()
}

/// Split on whitespace outside brackets and quotes
fn split_descendants(input: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start: Option<usize> = None;

    for (i, c) in input.char_indices() {
        match c {
            '"' if depth > 0 => quoted = !quoted,
            '[' if !quoted => depth += 1,
            ']' if !quoted => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 => {
                if let Some(s) = start.take() {
                    parts.push(&input[s..i]);
                }
                continue;
            }
            _ => {}
        }
        if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        parts.push(&input[s..]);
    }
    if depth != 0 || quoted {
        return Err(format!("unbalanced selector '{}'", input));
    }
    if parts.is_empty() {
        return Err("empty selector".to_string());
    }
    Ok(parts)
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn parse_compound(input: &str) -> Result<Compound, String> {
    let mut compound = Compound::default();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    let read_ident = |i: &mut usize| -> String {
        let start = *i;
        while *i < chars.len() && is_ident(chars[*i]) {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    if i < chars.len() && chars[i] == '*' {
        i += 1;
    } else if i < chars.len() && is_ident(chars[i]) {
        compound.tag = Some(read_ident(&mut i).to_ascii_lowercase());
    }

    while i < chars.len() {
        match chars[i] {
            '#' => {
                i += 1;
                let id = read_ident(&mut i);
                if id.is_empty() {
                    return Err(format!("empty id in '{}'", input));
                }
                compound.id = Some(id);
            }
            '.' => {
                i += 1;
                let class = read_ident(&mut i);
                if class.is_empty() {
                    return Err(format!("empty class in '{}'", input));
                }
                compound.classes.push(class);
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| format!("unclosed attribute in '{}'", input))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let (name, value) = match inner.split_once('=') {
                    Some((n, v)) => {
                        let v = v.trim();
                        let v = unquote(v)
                            .or_else(|| {
                                v.strip_prefix('\'')
                                    .and_then(|s| s.strip_suffix('\''))
                                    .map(str::to_string)
                            })
                            .unwrap_or_else(|| v.to_string());
                        (n.trim().to_ascii_lowercase(), Some(v))
                    }
                    None => (inner.trim().to_ascii_lowercase(), None),
                };
                if name.is_empty() {
                    return Err(format!("empty attribute name in '{}'", input));
                }
                compound.attrs.push((name, value));
                i = close + 1;
            }
            other => return Err(format!("unexpected '{}' in selector '{}'", other, input)),
        }
    }

    Ok(compound)
}

fn matches_compound(doc: &Document, id: NodeId, compound: &Compound) -> bool {
    let Some(node) = doc.get(id) else {
        return false;
    };
    let Some(tag) = node.tag() else {
        return false;
    };
    if compound.tag.as_deref().is_some_and(|t| t != tag) {
        return false;
    }
    if let Some(want) = &compound.id {
        if node.attr("id") != Some(want.as_str()) {
            return false;
        }
    }
    if !compound.classes.is_empty() {
        let classes: Vec<&str> = node.attr("class").unwrap_or("").split_whitespace().collect();
        if !compound.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
    }
    compound.attrs.iter().all(|(name, value)| match value {
        None => node.has_attr(name),
        Some(v) => node.attr(name) == Some(v.as_str()),
    })
}

fn matches_chain(doc: &Document, id: NodeId, chain: &[Compound]) -> bool {
    let Some((last, rest)) = chain.split_last() else {
        return false;
    };
    if !matches_compound(doc, id, last) {
        return false;
    }
    let mut ancestors = doc.ancestors(id).into_iter();
    rest.iter()
        .rev()
        .all(|compound| ancestors.any(|a| matches_compound(doc, a, compound)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> (Document, NodeId, NodeId, NodeId) {
        let mut doc = Document::new();
        let body = doc.body();
        let form = doc.element(body, "form", &[("id", "login"), ("class", "card wide")]);
        let user = doc.element(form, "input", &[("name", "user"), ("type", "text")]);
        let submit = doc.element(form, "button", &[("type", "submit")]);
        doc.text(submit, "Sign in");
        let other = doc.element(body, "button", &[]);
        doc.text(other, "Sign in");
        (doc, user, submit, other)
    }

    #[test]
    fn test_css_selectors() {
        let (doc, user, submit, other) = page();
        let root = doc.root();
        assert_eq!(doc.query_all(root, "#login input").unwrap(), vec![user]);
        assert_eq!(doc.query_all(root, "form.card.wide button").unwrap(), vec![submit]);
        assert_eq!(doc.query_all(root, "[name=\"user\"]").unwrap(), vec![user]);
        assert_eq!(doc.query_all(root, "button").unwrap(), vec![submit, other]);
        assert_eq!(doc.query_all(root, "button >> nth=1").unwrap(), vec![other]);
        assert!(doc.query_all(root, "section").unwrap().is_empty());
    }

    #[test]
    fn test_role_selector() {
        let (doc, _, submit, other) = page();
        let root = doc.root();
        assert_eq!(
            doc.query_all(root, "role=button[name=\"Sign in\"]").unwrap(),
            vec![submit, other]
        );
        assert_eq!(
            doc.query_all(root, "role=button[name=\"Sign in\"] >> nth=1").unwrap(),
            vec![other]
        );
        assert_eq!(doc.query_all(root, "role=textbox").unwrap().len(), 1);
    }

    #[test]
    fn test_text_selector_innermost() {
        let (doc, _, submit, other) = page();
        let root = doc.root();
        assert_eq!(doc.query_all(root, "text=sign IN").unwrap(), vec![submit, other]);
        assert_eq!(doc.query_all(root, "text=\"Sign in\"").unwrap(), vec![submit, other]);
    }

    #[test]
    fn test_role_selector_round_trip() {
        let mut doc = Document::new();
        let body = doc.body();
        let a = doc.element(body, "button", &[]);
        doc.text(a, "say \"hi\"");
        let b = doc.element(body, "button", &[]);
        doc.text(b, "say \"hi\"");

        let selector = Selector::role_selector("button", "say \"hi\"", Some(1));
        assert_eq!(selector, "role=button[name=\"say \\\"hi\\\"\"] >> nth=1");
        assert_eq!(doc.query_all(doc.root(), &selector).unwrap(), vec![b]);
        assert_eq!(Selector::role_selector("main", "", None), "role=main");
    }

    #[test]
    fn test_role_selector_names_with_chain_syntax() {
        let mut doc = Document::new();
        let body = doc.body();
        let names = ["Next >>", "a]b [c]", "say \"x >> y\"", "back\\slash"];
        let mut buttons = Vec::new();
        for name in names {
            let button = doc.element(body, "button", &[]);
            doc.text(button, name);
            buttons.push(button);
        }
        let twin = doc.element(body, "button", &[]);
        doc.text(twin, "Next >>");

        for (name, button) in names.iter().zip(&buttons) {
            let selector = Selector::role_selector("button", name, Some(0));
            assert_eq!(doc.query_all(doc.root(), &selector).unwrap(), vec![*button], "{}", selector);
        }
        let unique = Selector::role_selector("button", "a]b [c]", None);
        assert_eq!(doc.query_all(doc.root(), &unique).unwrap(), vec![buttons[1]]);
        let second = Selector::role_selector("button", "Next >>", Some(1));
        assert_eq!(doc.query_all(doc.root(), &second).unwrap(), vec![twin]);
        assert!(Selector::parse(&Selector::role_selector("button", "Next >>", None)).is_ok());
        assert_eq!(
            doc.query_all(doc.root(), "text=\"Next >>\"").unwrap(),
            vec![buttons[0], twin]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("div >> first").is_err());
        assert!(Selector::parse("[unclosed").is_err());
        assert!(Selector::parse("role=").is_err());
    }
}
