//! Role, accessible name, visibility and state computation
//!
//! Implicit roles follow the HTML-AAM mapping for the tags that matter to
//! automation; anything unlisted is `generic`.

use crate::dom::{normalize_whitespace, Document, NodeId};

/// Roles a user can act on; these always get a ref
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "searchbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "treeitem",
];

/// Roles that get a ref when they carry a name
pub const CONTENT_ROLES: &[&str] = &[
    "heading",
    "cell",
    "gridcell",
    "columnheader",
    "rowheader",
    "listitem",
    "article",
    "region",
    "main",
    "navigation",
    "img",
];

const NAME_FROM_CONTENT: &[&str] = &[
    "button",
    "link",
    "heading",
    "cell",
    "gridcell",
    "columnheader",
    "rowheader",
    "listitem",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "tab",
    "treeitem",
    "checkbox",
    "radio",
    "switch",
    "tooltip",
];

const NEVER_RENDERED: &[&str] = &[
    "script", "style", "noscript", "template", "head", "meta", "link", "title",
];

const LABELABLE: &[&str] = &["input", "select", "textarea", "meter", "progress", "output"];

/// Longest accessible name kept before truncation
pub const MAX_NAME_CHARS: usize = 100;

pub fn is_interactive(role: &str) -> bool {
    INTERACTIVE_ROLES.contains(&role)
}

pub fn is_content(role: &str) -> bool {
    CONTENT_ROLES.contains(&role)
}

/// Whether a role takes its name from its own text
pub fn names_from_content(role: &str) -> bool {
    NAME_FROM_CONTENT.contains(&role)
}

/// Computed role of an element (`text` for text nodes)
pub fn role_of(doc: &Document, id: NodeId) -> String {
    let Some(node) = doc.get(id) else {
        return "none".to_string();
    };
    let Some(tag) = node.tag() else {
        return "text".to_string();
    };

    if let Some(explicit) = node
        .attr("role")
        .and_then(|r| r.split_whitespace().next())
        .filter(|r| !r.is_empty())
    {
        return explicit.to_ascii_lowercase();
    }

    implicit_role(doc, id, tag).to_string()
}

fn implicit_role(doc: &Document, id: NodeId, tag: &str) -> &'static str {
    let attr = |name: &str| doc.attr(id, name);
    match tag {
        "a" | "area" => {
            if attr("href").is_some() {
                "link"
            } else {
                "generic"
            }
        }
        "button" | "summary" => "button",
        "input" => input_role(attr("type").unwrap_or("text"), attr("list").is_some()),
        "select" => {
            let sized = attr("size")
                .and_then(|s| s.parse::<u32>().ok())
                .is_some_and(|s| s > 1);
            if attr("multiple").is_some() || sized {
                "listbox"
            } else {
                "combobox"
            }
        }
        "textarea" => "textbox",
        "option" => "option",
        "img" => {
            if attr("alt") == Some("") {
                "presentation"
            } else {
                "img"
            }
        }
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "nav" => "navigation",
        "main" => "main",
        "header" => "banner",
        "footer" => "contentinfo",
        "aside" => "complementary",
        "form" => "form",
        "section" => "region",
        "article" => "article",
        "ul" | "ol" | "menu" => "list",
        "li" => "listitem",
        "table" => "table",
        "thead" | "tbody" | "tfoot" => "rowgroup",
        "tr" => "row",
        "td" => "cell",
        "th" => "columnheader",
        "p" => "paragraph",
        "dialog" => "dialog",
        "details" | "fieldset" => "group",
        "progress" => "progressbar",
        "meter" => "meter",
        "hr" => "separator",
        "iframe" => "iframe",
        _ => "generic",
    }
}

fn input_role(input_type: &str, has_list: bool) -> &'static str {
    match input_type.to_ascii_lowercase().as_str() {
        "checkbox" => "checkbox",
        "radio" => "radio",
        "range" => "slider",
        "number" => "spinbutton",
        "button" | "submit" | "reset" | "image" => "button",
        "search" if has_list => "combobox",
        "search" => "searchbox",
        "hidden" => "none",
        _ if has_list => "combobox",
        _ => "textbox",
    }
}

/// Whether a node itself is hidden (ancestors not considered)
pub fn is_hidden(doc: &Document, id: NodeId) -> bool {
    let Some(node) = doc.get(id) else {
        return true;
    };
    let Some(tag) = node.tag() else {
        return false;
    };

    if NEVER_RENDERED.contains(&tag) {
        return true;
    }
    if node.attr("aria-hidden") == Some("true") || node.has_attr("hidden") {
        return true;
    }
    if tag == "input" && node.attr("type").map(str::to_ascii_lowercase).as_deref() == Some("hidden")
    {
        return true;
    }

    let layout = node.layout();
    if layout.display_none || layout.visibility_hidden {
        return true;
    }
    if let Some(style) = node.attr("style") {
        let style: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }

    // Zero-size leaves render nothing
    matches!(layout.size, Some((w, h)) if w <= 0.0 || h <= 0.0) && node.children().is_empty()
}

/// Whether a node and all its ancestors are rendered
pub fn is_visible_in_tree(doc: &Document, id: NodeId) -> bool {
    !is_hidden(doc, id) && doc.ancestors(id).into_iter().all(|a| !is_hidden(doc, a))
}

/// Text of rendered descendants, whitespace-normalized
pub fn visible_text(doc: &Document, id: NodeId) -> String {
    let mut out = String::new();
    collect_text(doc, id, &mut out);
    normalize_whitespace(&out)
}

fn collect_text(doc: &Document, id: NodeId, out: &mut String) {
    let Some(node) = doc.get(id) else {
        return;
    };
    if let Some(text) = node.text() {
        out.push_str(text);
        return;
    }
    if is_hidden(doc, id) {
        return;
    }
    for child in node.children() {
        collect_text(doc, *child, out);
        // Block-ish children are separated visually
        if doc.get(*child).is_some_and(|c| c.is_element()) {
            out.push(' ');
        }
    }
}

fn truncate(name: String) -> String {
    if name.chars().count() <= MAX_NAME_CHARS {
        return name;
    }
    let mut cut: String = name.chars().take(MAX_NAME_CHARS).collect();
    cut.push('…');
    cut
}

/// Accessible name by the labelling priority chain
pub fn accessible_name(doc: &Document, id: NodeId, role: &str) -> String {
    let Some(node) = doc.get(id) else {
        return String::new();
    };
    let Some(tag) = node.tag() else {
        return String::new();
    };

    if let Some(ids) = node.attr("aria-labelledby") {
        let name = ids
            .split_whitespace()
            .filter_map(|ref_id| doc.element_by_id(ref_id))
            .map(|label| visible_text(doc, label))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            return truncate(name);
        }
    }

    if let Some(label) = node.attr("aria-label").map(normalize_whitespace) {
        if !label.is_empty() {
            return truncate(label);
        }
    }

    if LABELABLE.contains(&tag) {
        let label = label_text(doc, id);
        if !label.is_empty() {
            return truncate(label);
        }
    }

    if matches!(tag, "input" | "textarea") {
        if let Some(placeholder) = node.attr("placeholder").map(normalize_whitespace) {
            if !placeholder.is_empty() {
                return truncate(placeholder);
            }
        }
    }

    let is_image_input =
        tag == "input" && node.attr("type").map(str::to_ascii_lowercase).as_deref() == Some("image");
    if matches!(tag, "img" | "area") || is_image_input {
        if let Some(alt) = node.attr("alt").map(normalize_whitespace) {
            if !alt.is_empty() {
                return truncate(alt);
            }
        }
    }

    if let Some(title) = node.attr("title").map(normalize_whitespace) {
        if !title.is_empty() {
            return truncate(title);
        }
    }

    if names_from_content(role) {
        if tag == "input" {
            return truncate(input_button_label(node.attr("type"), node.attr("value")));
        }
        return truncate(visible_text(doc, id));
    }

    String::new()
}

fn input_button_label(input_type: Option<&str>, value: Option<&str>) -> String {
    if let Some(value) = value.map(normalize_whitespace).filter(|v| !v.is_empty()) {
        return value;
    }
    match input_type.map(str::to_ascii_lowercase).as_deref() {
        Some("submit") => "Submit".to_string(),
        Some("reset") => "Reset".to_string(),
        _ => String::new(),
    }
}

/// Text of the `<label for>` or wrapping `<label>` of a control
fn label_text(doc: &Document, id: NodeId) -> String {
    if let Some(control_id) = doc.attr(id, "id") {
        let explicit = doc
            .descendants(doc.root())
            .into_iter()
            .filter(|n| doc.tag(*n) == Some("label") && doc.attr(*n, "for") == Some(control_id))
            .map(|label| visible_text(doc, label))
            .find(|t| !t.is_empty());
        if let Some(text) = explicit {
            return text;
        }
    }

    doc.ancestors(id)
        .into_iter()
        .find(|a| doc.tag(*a) == Some("label"))
        .map(|label| visible_text(doc, label))
        .unwrap_or_default()
}

/// Heading level from `aria-level` or the tag
pub fn heading_level(doc: &Document, id: NodeId) -> Option<u8> {
    if let Some(level) = doc.attr(id, "aria-level").and_then(|l| l.parse().ok()) {
        return Some(level);
    }
    match doc.tag(id)? {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

const CHECKABLE: &[&str] = &[
    "checkbox",
    "radio",
    "switch",
    "menuitemcheckbox",
    "menuitemradio",
];
const SELECTABLE: &[&str] = &["option", "tab", "row", "gridcell", "treeitem"];
const FORM_CONTROLS: &[&str] = &["button", "input", "select", "textarea", "option", "fieldset"];

/// State annotations rendered after the ref, e.g. `level=2`, `checked`
pub fn annotations(doc: &Document, id: NodeId, role: &str) -> Vec<String> {
    let mut out = Vec::new();
    let Some(node) = doc.get(id) else {
        return out;
    };
    let tag = node.tag().unwrap_or_default();
    let aria = |name: &str| node.attr(name);

    if role == "heading" {
        if let Some(level) = heading_level(doc, id) {
            out.push(format!("level={}", level));
        }
    }

    if CHECKABLE.contains(&role) {
        match aria("aria-checked") {
            Some("true") => out.push("checked".to_string()),
            Some("mixed") => out.push("checked=mixed".to_string()),
            Some(_) => {}
            None if tag == "input" && node.has_attr("checked") => out.push("checked".to_string()),
            None => {}
        }
    }

    if SELECTABLE.contains(&role) {
        let selected = match aria("aria-selected") {
            Some(v) => v == "true",
            None => tag == "option" && node.has_attr("selected"),
        };
        if selected {
            out.push("selected".to_string());
        }
    }

    let expanded = match aria("aria-expanded") {
        Some(v) => Some(v == "true"),
        None if tag == "summary" => doc
            .parent(id)
            .filter(|p| doc.tag(*p) == Some("details"))
            .map(|p| doc.attr(p, "open").is_some()),
        None => None,
    };
    match expanded {
        Some(true) => out.push("expanded".to_string()),
        Some(false) => out.push("expanded=false".to_string()),
        None => {}
    }

    let native_disabled = FORM_CONTROLS.contains(&tag)
        && (node.has_attr("disabled")
            || doc.ancestors(id).into_iter().any(|a| {
                doc.tag(a) == Some("fieldset") && doc.attr(a, "disabled").is_some()
            }));
    if aria("aria-disabled") == Some("true") || native_disabled {
        out.push("disabled".to_string());
    }

    let native_required =
        matches!(tag, "input" | "select" | "textarea") && node.has_attr("required");
    if aria("aria-required") == Some("true") || native_required {
        out.push("required".to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let mut doc = Document::new();
        let body = doc.body();
        let link = doc.element(body, "a", &[("href", "/x")]);
        let anchor = doc.element(body, "a", &[]);
        let check = doc.element(body, "input", &[("type", "checkbox")]);
        let search = doc.element(body, "input", &[("type", "search")]);
        let custom = doc.element(body, "div", &[("role", "tab other")]);
        let multi = doc.element(body, "select", &[("multiple", "")]);

        assert_eq!(role_of(&doc, link), "link");
        assert_eq!(role_of(&doc, anchor), "generic");
        assert_eq!(role_of(&doc, check), "checkbox");
        assert_eq!(role_of(&doc, search), "searchbox");
        assert_eq!(role_of(&doc, custom), "tab");
        assert_eq!(role_of(&doc, multi), "listbox");
    }

    #[test]
    fn test_name_priority() {
        let mut doc = Document::new();
        let body = doc.body();
        let heading = doc.element(body, "span", &[("id", "lbl")]);
        doc.text(heading, "From labelledby");

        let a = doc.element(
            body,
            "input",
            &[("aria-labelledby", "lbl"), ("aria-label", "From aria"), ("placeholder", "p")],
        );
        let b = doc.element(body, "input", &[("aria-label", "From aria"), ("placeholder", "p")]);
        let label = doc.element(body, "label", &[("for", "email")]);
        doc.text(label, "Email address");
        let c = doc.element(body, "input", &[("id", "email"), ("placeholder", "p")]);
        let wrap = doc.element(body, "label", &[]);
        doc.text(wrap, "Remember me");
        let d = doc.element(wrap, "input", &[("type", "checkbox")]);
        let e = doc.element(body, "input", &[("placeholder", "Search…")]);
        let f = doc.element(body, "img", &[("alt", "Logo"), ("title", "t")]);
        let g = doc.element(body, "div", &[("title", "Tooltip")]);
        let h = doc.element(body, "button", &[]);
        doc.text(h, "  Sign\n in ");

        assert_eq!(accessible_name(&doc, a, "textbox"), "From labelledby");
        assert_eq!(accessible_name(&doc, b, "textbox"), "From aria");
        assert_eq!(accessible_name(&doc, c, "textbox"), "Email address");
        assert_eq!(accessible_name(&doc, d, "checkbox"), "Remember me");
        assert_eq!(accessible_name(&doc, e, "textbox"), "Search…");
        assert_eq!(accessible_name(&doc, f, "img"), "Logo");
        assert_eq!(accessible_name(&doc, g, "generic"), "Tooltip");
        assert_eq!(accessible_name(&doc, h, "button"), "Sign in");
    }

    #[test]
    fn test_generic_has_no_content_name() {
        let mut doc = Document::new();
        let body = doc.body();
        let div = doc.element(body, "div", &[]);
        doc.text(div, "plain text");
        assert_eq!(accessible_name(&doc, div, "generic"), "");
    }

    #[test]
    fn test_submit_input_default_name() {
        let mut doc = Document::new();
        let body = doc.body();
        let submit = doc.element(body, "input", &[("type", "submit")]);
        assert_eq!(accessible_name(&doc, submit, "button"), "Submit");
    }

    #[test]
    fn test_visibility() {
        let mut doc = Document::new();
        let body = doc.body();
        let script = doc.element(body, "script", &[]);
        let aria = doc.element(body, "div", &[("aria-hidden", "true")]);
        let styled = doc.element(body, "div", &[("style", "display: none")]);
        let hidden_input = doc.element(body, "input", &[("type", "hidden")]);
        let empty = doc.element(body, "span", &[]);
        doc.set_layout(
            empty,
            crate::dom::Layout {
                size: Some((0.0, 0.0)),
                ..Default::default()
            },
        );
        let inside = doc.element(aria, "button", &[]);
        let shown = doc.element(body, "button", &[]);

        assert!(is_hidden(&doc, script));
        assert!(is_hidden(&doc, aria));
        assert!(is_hidden(&doc, styled));
        assert!(is_hidden(&doc, hidden_input));
        assert!(is_hidden(&doc, empty));
        assert!(!is_hidden(&doc, inside));
        assert!(!is_visible_in_tree(&doc, inside));
        assert!(is_visible_in_tree(&doc, shown));
    }

    #[test]
    fn test_annotations() {
        let mut doc = Document::new();
        let body = doc.body();
        let h2 = doc.element(body, "h2", &[]);
        let check = doc.element(
            body,
            "input",
            &[("type", "checkbox"), ("checked", ""), ("aria-disabled", "true"), ("disabled", "")],
        );
        let menu = doc.element(body, "button", &[("aria-expanded", "false")]);
        let email = doc.element(body, "input", &[("required", "")]);

        assert_eq!(annotations(&doc, h2, "heading"), vec!["level=2"]);
        assert_eq!(annotations(&doc, check, "checkbox"), vec!["checked", "disabled"]);
        assert_eq!(annotations(&doc, menu, "button"), vec!["expanded=false"]);
        assert_eq!(annotations(&doc, email, "textbox"), vec!["required"]);
    }
}
