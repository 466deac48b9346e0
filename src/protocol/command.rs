//! Command schema for the control protocol
//!
//! Decodes untrusted JSON into a typed [`Command`]. The set of actions and
//! their fields is closed: unknown actions and unexpected fields are
//! rejected, never ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Client-chosen correlation token
    pub id: String,
    /// What to do
    pub action: Action,
}

/// Why a command was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationKind {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field '{path}': {reason}")]
    InvalidField { path: String, reason: String },

    #[error("Unexpected field: {0}")]
    UnexpectedField(String),

    #[error("Invalid command: {0}")]
    InvalidEnvelope(String),
}

/// Validation failure, keeping the id when one could be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct ValidationError {
    /// Id of the offending command, if parsable
    pub id: Option<String>,
    /// What was wrong
    pub kind: ValidationKind,
}

impl ValidationError {
    fn new(id: Option<&str>, kind: ValidationKind) -> Self {
        Self {
            id: id.map(str::to_string),
            kind,
        }
    }
}

fn invalid(path: impl Into<String>, reason: impl Into<String>) -> ValidationKind {
    ValidationKind::InvalidField {
        path: path.into(),
        reason: reason.into(),
    }
}

/// Load state to wait for after navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl WaitUntil {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "load" => Some(Self::Load),
            "domcontentloaded" => Some(Self::DomContentLoaded),
            "networkidle" => Some(Self::NetworkIdle),
            _ => None,
        }
    }
}

/// Mouse button for clicks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "middle" => Some(Self::Middle),
            _ => None,
        }
    }
}

/// Scroll direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Web storage area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Session,
}

impl StorageKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Paper size for PDF output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaperFormat {
    #[default]
    Letter,
    Legal,
    Tabloid,
    A3,
    A4,
    A5,
}

impl PaperFormat {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Letter" => Some(Self::Letter),
            "Legal" => Some(Self::Legal),
            "Tabloid" => Some(Self::Tabloid),
            "A3" => Some(Self::A3),
            "A4" => Some(Self::A4),
            "A5" => Some(Self::A5),
            _ => None,
        }
    }
}

/// How to find an embedded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameLocator {
    /// Element locator of the `<iframe>`
    Selector(String),
    /// Frame `name` attribute
    Name(String),
    /// Frame url, or a substring of it
    Url(String),
}

impl std::fmt::Display for FrameLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameLocator::Selector(s) => write!(f, "selector {}", s),
            FrameLocator::Name(n) => write!(f, "name {}", n),
            FrameLocator::Url(u) => write!(f, "url {}", u),
        }
    }
}

/// Options for the snapshot action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Emit only interactive elements
    pub interactive: bool,
    /// Drop unnamed structural wrappers
    pub compact: bool,
    /// Sub-root locator
    pub selector: Option<String>,
    /// Deepest emitted level
    pub max_depth: Option<usize>,
}

/// Options for the screenshot action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotOptions {
    /// Output file, base64 in the response when absent
    pub path: Option<String>,
    /// Capture beyond the viewport
    pub full_page: bool,
    /// Element to capture instead of the page
    pub selector: Option<String>,
}

/// What a wait action waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitFor {
    /// An element matching the locator
    Selector { selector: String, timeout_ms: u64 },
    /// Text anywhere in the page
    Text { text: String, timeout_ms: u64 },
    /// A fixed delay
    Duration(u64),
}

/// A cookie to set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

/// Default ceiling for waits, in ms
pub const DEFAULT_WAIT_MS: u64 = 30_000;

/// Longest a single command may hold the session worker, in ms
pub const MAX_WAIT_MS: u64 = 300_000;

/// Every action the protocol understands
pub const ACTIONS: &[&str] = &[
    "launch",
    "navigate",
    "back",
    "forward",
    "reload",
    "url",
    "title",
    "click",
    "dblclick",
    "fill",
    "type",
    "press",
    "check",
    "uncheck",
    "hover",
    "focus",
    "select",
    "scroll",
    "gettext",
    "wait",
    "snapshot",
    "screenshot",
    "evaluate",
    "pdf",
    "cookies_get",
    "cookies_set",
    "cookies_clear",
    "storage_get",
    "storage_set",
    "storage_clear",
    "tab_new",
    "tab_list",
    "tab_switch",
    "tab_close",
    "window_new",
    "frame",
    "mainframe",
    "close",
];

/// Action-specific payload of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Launch,
    Navigate { url: String, wait_until: WaitUntil },
    Back,
    Forward,
    Reload,
    Url,
    Title,
    Click {
        selector: String,
        button: MouseButton,
        click_count: u32,
    },
    Dblclick { selector: String },
    Fill { selector: String, value: String },
    Type {
        selector: String,
        text: String,
        delay_ms: Option<u64>,
    },
    Press { key: String, selector: Option<String> },
    Check { selector: String },
    Uncheck { selector: String },
    Hover { selector: String },
    Focus { selector: String },
    Select { selector: String, values: Vec<String> },
    Scroll {
        direction: ScrollDirection,
        amount: u32,
        selector: Option<String>,
    },
    GetText { selector: String },
    Wait(WaitFor),
    Snapshot(SnapshotOptions),
    Screenshot(ScreenshotOptions),
    Evaluate { script: String, args: Vec<Value> },
    Pdf { path: String, format: PaperFormat },
    CookiesGet { urls: Vec<String> },
    CookiesSet { cookies: Vec<Cookie> },
    CookiesClear,
    StorageGet { kind: StorageKind, key: Option<String> },
    StorageSet {
        kind: StorageKind,
        key: String,
        value: String,
    },
    StorageClear { kind: StorageKind },
    TabNew { url: Option<String> },
    TabList,
    TabSwitch { index: usize },
    TabClose { index: Option<usize> },
    WindowNew { url: Option<String> },
    Frame(FrameLocator),
    MainFrame,
    Close,
}

impl Action {
    /// Wire name of this action
    pub fn name(&self) -> &'static str {
        match self {
            Action::Launch => "launch",
            Action::Navigate { .. } => "navigate",
            Action::Back => "back",
            Action::Forward => "forward",
            Action::Reload => "reload",
            Action::Url => "url",
            Action::Title => "title",
            Action::Click { .. } => "click",
            Action::Dblclick { .. } => "dblclick",
            Action::Fill { .. } => "fill",
            Action::Type { .. } => "type",
            Action::Press { .. } => "press",
            Action::Check { .. } => "check",
            Action::Uncheck { .. } => "uncheck",
            Action::Hover { .. } => "hover",
            Action::Focus { .. } => "focus",
            Action::Select { .. } => "select",
            Action::Scroll { .. } => "scroll",
            Action::GetText { .. } => "gettext",
            Action::Wait(_) => "wait",
            Action::Snapshot(_) => "snapshot",
            Action::Screenshot(_) => "screenshot",
            Action::Evaluate { .. } => "evaluate",
            Action::Pdf { .. } => "pdf",
            Action::CookiesGet { .. } => "cookies_get",
            Action::CookiesSet { .. } => "cookies_set",
            Action::CookiesClear => "cookies_clear",
            Action::StorageGet { .. } => "storage_get",
            Action::StorageSet { .. } => "storage_set",
            Action::StorageClear { .. } => "storage_clear",
            Action::TabNew { .. } => "tab_new",
            Action::TabList => "tab_list",
            Action::TabSwitch { .. } => "tab_switch",
            Action::TabClose { .. } => "tab_close",
            Action::WindowNew { .. } => "window_new",
            Action::Frame(_) => "frame",
            Action::MainFrame => "mainframe",
            Action::Close => "close",
        }
    }
}

/// Field reader that remembers which keys an action consumed
struct Fields<'a> {
    map: &'a Map<String, Value>,
    known: Vec<&'static str>,
}

type FieldResult<T> = std::result::Result<T, ValidationKind>;

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            known: vec!["id", "action"],
        }
    }

    fn raw(&mut self, key: &'static str) -> Option<&'a Value> {
        self.known.push(key);
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn opt_string(&mut self, key: &'static str) -> FieldResult<Option<String>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(invalid(key, "expected a string")),
        }
    }

    /// Required string that may be empty
    fn text(&mut self, key: &'static str) -> FieldResult<String> {
        self.opt_string(key)?
            .ok_or_else(|| ValidationKind::MissingField(key.to_string()))
    }

    /// Optional string that must not be empty when present
    fn opt_non_empty(&mut self, key: &'static str) -> FieldResult<Option<String>> {
        match self.opt_string(key)? {
            Some(s) if s.trim().is_empty() => Err(invalid(key, "must not be empty")),
            other => Ok(other),
        }
    }

    fn non_empty(&mut self, key: &'static str) -> FieldResult<String> {
        self.opt_non_empty(key)?
            .ok_or_else(|| ValidationKind::MissingField(key.to_string()))
    }

    fn flag(&mut self, key: &'static str) -> FieldResult<bool> {
        match self.raw(key) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(invalid(key, "expected a boolean")),
        }
    }

    fn opt_u64(&mut self, key: &'static str) -> FieldResult<Option<u64>> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(key, "expected a non-negative integer")),
        }
    }

    fn opt_positive(&mut self, key: &'static str) -> FieldResult<Option<u64>> {
        match self.opt_u64(key)? {
            Some(0) => Err(invalid(key, "must be greater than zero")),
            other => Ok(other),
        }
    }

    fn opt_at_most(&mut self, key: &'static str, max: u64) -> FieldResult<Option<u64>> {
        match self.opt_u64(key)? {
            Some(v) if v > max => Err(invalid(key, format!("must be at most {}", max))),
            other => Ok(other),
        }
    }

    fn opt_count(&mut self, key: &'static str) -> FieldResult<Option<u32>> {
        match self.opt_positive(key)? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| invalid(key, format!("must be at most {}", u32::MAX))),
        }
    }

    fn opt_index(&mut self, key: &'static str) -> FieldResult<Option<usize>> {
        Ok(self.opt_u64(key)?.map(|v| v as usize))
    }

    fn opt_enum<T>(
        &mut self,
        key: &'static str,
        parse: fn(&str) -> Option<T>,
        allowed: &str,
    ) -> FieldResult<Option<T>> {
        match self.opt_string(key)? {
            None => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| invalid(key, format!("expected one of {}, got '{}'", allowed, s))),
        }
    }

    /// A string or an array of strings
    fn opt_strings(&mut self, key: &'static str) -> FieldResult<Option<Vec<String>>> {
        match self.raw(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(format!("{}[{}]", key, i), "expected a string"))
                })
                .collect::<FieldResult<Vec<_>>>()
                .map(Some),
            Some(_) => Err(invalid(key, "expected a string or an array of strings")),
        }
    }

    fn opt_url(&mut self, key: &'static str) -> FieldResult<Option<String>> {
        match self.opt_non_empty(key)? {
            None => Ok(None),
            Some(raw) => normalize_url(&raw)
                .map(Some)
                .ok_or_else(|| invalid(key, format!("not a valid URL: {}", raw))),
        }
    }

    fn finish(self) -> FieldResult<()> {
        match self
            .map
            .keys()
            .find(|k| !self.known.contains(&k.as_str()))
        {
            Some(extra) => Err(ValidationKind::UnexpectedField(extra.clone())),
            None => Ok(()),
        }
    }
}

/// Accept absolute URLs as given; prefix bare hosts with `https://`
fn normalize_url(raw: &str) -> Option<String> {
    match url::Url::parse(raw) {
        Ok(_) => Some(raw.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let prefixed = format!("https://{}", raw);
            url::Url::parse(&prefixed).ok().map(|_| prefixed)
        }
        Err(_) => None,
    }
}

/// Validate raw JSON text
pub fn validate_str(raw: &str) -> std::result::Result<Command, ValidationError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        ValidationError::new(None, ValidationKind::InvalidEnvelope(e.to_string()))
    })?;
    validate(&value)
}

/// Validate a decoded JSON value into a command
pub fn validate(raw: &Value) -> std::result::Result<Command, ValidationError> {
    let map = raw.as_object().ok_or_else(|| {
        ValidationError::new(
            None,
            ValidationKind::InvalidEnvelope("expected a JSON object".to_string()),
        )
    })?;

    let id = match map.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.as_str(),
        Some(Value::String(_)) => {
            return Err(ValidationError::new(None, invalid("id", "must not be empty")))
        }
        Some(_) => return Err(ValidationError::new(None, invalid("id", "expected a string"))),
        None => {
            return Err(ValidationError::new(
                None,
                ValidationKind::MissingField("id".to_string()),
            ))
        }
    };

    let action = match map.get("action") {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(ValidationError::new(
                Some(id),
                invalid("action", "expected a string"),
            ))
        }
        None => {
            return Err(ValidationError::new(
                Some(id),
                ValidationKind::MissingField("action".to_string()),
            ))
        }
    };

    let mut fields = Fields::new(map);
    let action = parse_action(action, &mut fields)
        .and_then(|action| fields.finish().map(|_| action))
        .map_err(|kind| ValidationError::new(Some(id), kind))?;

    Ok(Command {
        id: id.to_string(),
        action,
    })
}

fn parse_action(action: &str, f: &mut Fields<'_>) -> FieldResult<Action> {
    let parsed = match action {
        "launch" => Action::Launch,
        "navigate" => Action::Navigate {
            url: f
                .opt_url("url")?
                .ok_or_else(|| ValidationKind::MissingField("url".to_string()))?,
            wait_until: f
                .opt_enum(
                    "waitUntil",
                    WaitUntil::parse,
                    "load, domcontentloaded, networkidle",
                )?
                .unwrap_or_default(),
        },
        "back" => Action::Back,
        "forward" => Action::Forward,
        "reload" => Action::Reload,
        "url" => Action::Url,
        "title" => Action::Title,
        "click" => Action::Click {
            selector: f.non_empty("selector")?,
            button: f
                .opt_enum("button", MouseButton::parse, "left, right, middle")?
                .unwrap_or_default(),
            click_count: f.opt_count("clickCount")?.unwrap_or(1),
        },
        "dblclick" => Action::Dblclick {
            selector: f.non_empty("selector")?,
        },
        "fill" => Action::Fill {
            selector: f.non_empty("selector")?,
            value: f.text("value")?,
        },
        "type" => {
            let selector = f.non_empty("selector")?;
            let text = f.text("text")?;
            let delay_ms = f.opt_at_most("delay", MAX_WAIT_MS)?;
            let keys = text.chars().count() as u64;
            if delay_ms.is_some_and(|ms| ms.saturating_mul(keys) > MAX_WAIT_MS) {
                return Err(invalid(
                    "delay",
                    format!("typing {} keys would exceed {} ms", keys, MAX_WAIT_MS),
                ));
            }
            Action::Type {
                selector,
                text,
                delay_ms,
            }
        }
        "press" => Action::Press {
            key: f.non_empty("key")?,
            selector: f.opt_non_empty("selector")?,
        },
        "check" => Action::Check {
            selector: f.non_empty("selector")?,
        },
        "uncheck" => Action::Uncheck {
            selector: f.non_empty("selector")?,
        },
        "hover" => Action::Hover {
            selector: f.non_empty("selector")?,
        },
        "focus" => Action::Focus {
            selector: f.non_empty("selector")?,
        },
        "select" => {
            let selector = f.non_empty("selector")?;
            let values = f
                .opt_strings("values")?
                .ok_or_else(|| ValidationKind::MissingField("values".to_string()))?;
            if values.is_empty() {
                return Err(invalid("values", "must not be empty"));
            }
            Action::Select { selector, values }
        }
        "scroll" => Action::Scroll {
            direction: f
                .opt_enum("direction", ScrollDirection::parse, "up, down, left, right")?
                .unwrap_or_default(),
            amount: f.opt_count("amount")?.unwrap_or(300),
            selector: f.opt_non_empty("selector")?,
        },
        "gettext" => Action::GetText {
            selector: f.non_empty("selector")?,
        },
        "wait" => {
            let selector = f.opt_non_empty("selector")?;
            let text = f.opt_non_empty("text")?;
            let timeout = f.opt_at_most("timeout", MAX_WAIT_MS)?;
            Action::Wait(match (selector, text, timeout) {
                (Some(_), Some(_), _) => {
                    return Err(invalid("text", "cannot be combined with selector"))
                }
                (Some(selector), None, timeout) => WaitFor::Selector {
                    selector,
                    timeout_ms: timeout.unwrap_or(DEFAULT_WAIT_MS),
                },
                (None, Some(text), timeout) => WaitFor::Text {
                    text,
                    timeout_ms: timeout.unwrap_or(DEFAULT_WAIT_MS),
                },
                (None, None, Some(ms)) => WaitFor::Duration(ms),
                (None, None, None) => {
                    return Err(ValidationKind::MissingField("selector".to_string()))
                }
            })
        }
        "snapshot" => Action::Snapshot(SnapshotOptions {
            interactive: f.flag("interactive")?,
            compact: f.flag("compact")?,
            selector: f.opt_non_empty("selector")?,
            max_depth: f.opt_index("maxDepth")?,
        }),
        "screenshot" => Action::Screenshot(ScreenshotOptions {
            path: f.opt_non_empty("path")?,
            full_page: f.flag("fullPage")?,
            selector: f.opt_non_empty("selector")?,
        }),
        "evaluate" => Action::Evaluate {
            script: f.non_empty("script")?,
            args: match f.raw("args") {
                None => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err(invalid("args", "expected an array")),
            },
        },
        "pdf" => Action::Pdf {
            path: f.non_empty("path")?,
            format: f
                .opt_enum("format", PaperFormat::parse, "Letter, Legal, Tabloid, A3, A4, A5")?
                .unwrap_or_default(),
        },
        "cookies_get" => Action::CookiesGet {
            urls: f.opt_strings("urls")?.unwrap_or_default(),
        },
        "cookies_set" => Action::CookiesSet {
            cookies: parse_cookies(f)?,
        },
        "cookies_clear" => Action::CookiesClear,
        "storage_get" => Action::StorageGet {
            kind: storage_kind(f)?,
            key: f.opt_non_empty("key")?,
        },
        "storage_set" => Action::StorageSet {
            kind: storage_kind(f)?,
            key: f.non_empty("key")?,
            value: f.text("value")?,
        },
        "storage_clear" => Action::StorageClear {
            kind: storage_kind(f)?,
        },
        "tab_new" => Action::TabNew {
            url: f.opt_url("url")?,
        },
        "tab_list" => Action::TabList,
        "tab_switch" => Action::TabSwitch {
            index: f
                .opt_index("index")?
                .ok_or_else(|| ValidationKind::MissingField("index".to_string()))?,
        },
        "tab_close" => Action::TabClose {
            index: f.opt_index("index")?,
        },
        "window_new" => Action::WindowNew {
            url: f.opt_url("url")?,
        },
        "frame" => {
            let selector = f.opt_non_empty("selector")?;
            let name = f.opt_non_empty("name")?;
            let url = f.opt_non_empty("url")?;
            Action::Frame(match (selector, name, url) {
                (Some(s), None, None) => FrameLocator::Selector(s),
                (None, Some(n), None) => FrameLocator::Name(n),
                (None, None, Some(u)) => FrameLocator::Url(u),
                (None, None, None) => {
                    return Err(ValidationKind::MissingField("selector".to_string()))
                }
                _ => {
                    return Err(invalid(
                        "selector",
                        "exactly one of selector, name or url is allowed",
                    ))
                }
            })
        }
        "mainframe" => Action::MainFrame,
        "close" => Action::Close,
        other => return Err(ValidationKind::UnknownAction(other.to_string())),
    };
    Ok(parsed)
}

fn storage_kind(f: &mut Fields<'_>) -> FieldResult<StorageKind> {
    f.opt_enum("type", StorageKind::parse, "local, session")?
        .ok_or_else(|| ValidationKind::MissingField("type".to_string()))
}

fn parse_cookies(f: &mut Fields<'_>) -> FieldResult<Vec<Cookie>> {
    let items = match f.raw("cookies") {
        None => return Err(ValidationKind::MissingField("cookies".to_string())),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid("cookies", "expected an array")),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let path = format!("cookies[{}]", i);
            let cookie: Cookie = serde_json::from_value(item.clone())
                .map_err(|e| invalid(path.clone(), e.to_string()))?;
            if cookie.name.is_empty() {
                return Err(invalid(format!("{}.name", path), "must not be empty"));
            }
            if cookie.url.is_none() && cookie.domain.is_none() {
                return Err(invalid(path, "requires either url or domain"));
            }
            Ok(cookie)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind_of(value: Value) -> ValidationKind {
        validate(&value).unwrap_err().kind
    }

    #[test]
    fn test_navigate() {
        let cmd = validate(&json!({"id": "1", "action": "navigate", "url": "https://example.test"}))
            .unwrap();
        assert_eq!(cmd.id, "1");
        assert_eq!(
            cmd.action,
            Action::Navigate {
                url: "https://example.test".to_string(),
                wait_until: WaitUntil::Load
            }
        );
    }

    #[test]
    fn test_bare_host_gets_scheme() {
        let cmd = validate(&json!({"id": "1", "action": "navigate", "url": "example.test/path"}))
            .unwrap();
        match cmd.action {
            Action::Navigate { url, .. } => assert_eq!(url, "https://example.test/path"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_keeps_id() {
        let err = validate(&json!({"id": "7", "action": "bogus"})).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("7"));
        assert_eq!(err.to_string(), "Unknown action: bogus");
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        assert_eq!(
            kind_of(json!({"id": "1", "action": "fill", "selector": "@e1"})),
            ValidationKind::MissingField("value".to_string())
        );
        assert_eq!(
            kind_of(json!({"id": "1", "action": "click", "selector": ""})),
            invalid("selector", "must not be empty")
        );
        assert!(matches!(
            kind_of(json!({"id": "1", "action": "click", "selector": "a", "clickCount": 0})),
            ValidationKind::InvalidField { path, .. } if path == "clickCount"
        ));
        assert!(matches!(
            kind_of(json!({"id": "1", "action": "navigate", "url": "x", "waitUntil": "soon"})),
            ValidationKind::InvalidField { path, .. } if path == "waitUntil"
        ));
    }

    #[test]
    fn test_closed_world() {
        assert_eq!(
            kind_of(json!({"id": "1", "action": "tab_list", "verbose": true})),
            ValidationKind::UnexpectedField("verbose".to_string())
        );
    }

    #[test]
    fn test_envelope_errors() {
        let err = validate(&json!([1, 2])).unwrap_err();
        assert!(err.id.is_none());
        assert!(matches!(err.kind, ValidationKind::InvalidEnvelope(_)));

        let err = validate(&json!({"action": "url"})).unwrap_err();
        assert_eq!(err.kind, ValidationKind::MissingField("id".to_string()));

        let err = validate(&json!({"id": "9"})).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("9"));
        assert_eq!(err.kind, ValidationKind::MissingField("action".to_string()));

        assert!(validate_str("{not json").is_err());
    }

    #[test]
    fn test_cookie_paths() {
        let err = validate(&json!({
            "id": "c",
            "action": "cookies_set",
            "cookies": [{"name": "a", "value": "1", "url": "https://x.test"}, {"name": "b", "value": "2"}]
        }))
        .unwrap_err();
        assert_eq!(err.kind, invalid("cookies[1]", "requires either url or domain"));
    }

    #[test]
    fn test_frame_locator_exclusive() {
        let cmd = validate(&json!({"id": "f", "action": "frame", "name": "checkout"})).unwrap();
        assert_eq!(cmd.action, Action::Frame(FrameLocator::Name("checkout".into())));

        assert!(validate(&json!({"id": "f", "action": "frame", "name": "a", "url": "b"})).is_err());
        assert!(validate(&json!({"id": "f", "action": "frame"})).is_err());
    }

    #[test]
    fn test_wait_variants() {
        let cmd = validate(&json!({"id": "w", "action": "wait", "timeout": 250})).unwrap();
        assert_eq!(cmd.action, Action::Wait(WaitFor::Duration(250)));

        let cmd = validate(&json!({"id": "w", "action": "wait", "selector": "#go"})).unwrap();
        assert_eq!(
            cmd.action,
            Action::Wait(WaitFor::Selector {
                selector: "#go".into(),
                timeout_ms: DEFAULT_WAIT_MS
            })
        );
    }

    #[test]
    fn test_wait_and_delay_are_bounded() {
        let err = validate(&json!({"id": "w", "action": "wait", "timeout": 1_000_000_000_000_000u64}))
            .unwrap_err();
        assert_eq!(err.id.as_deref(), Some("w"));
        assert_eq!(
            err.kind,
            invalid("timeout", format!("must be at most {}", MAX_WAIT_MS))
        );
        assert!(validate(&json!({"id": "w", "action": "wait", "selector": "#go", "timeout": MAX_WAIT_MS + 1})).is_err());
        assert!(validate(&json!({"id": "w", "action": "wait", "timeout": MAX_WAIT_MS})).is_ok());

        let err = validate(&json!({"id": "t", "action": "type", "selector": "#q", "text": "abc", "delay": 100_001}))
            .unwrap_err();
        assert!(matches!(err.kind, ValidationKind::InvalidField { ref path, .. } if path == "delay"));
        assert!(validate(&json!({"id": "t", "action": "type", "selector": "#q", "text": "abc", "delay": 50})).is_ok());
    }

    #[test]
    fn test_counts_do_not_truncate() {
        let huge = u64::from(u32::MAX) + 2;
        let err = validate(&json!({"id": "c", "action": "click", "selector": "#a", "clickCount": huge}))
            .unwrap_err();
        assert_eq!(
            err.kind,
            invalid("clickCount", format!("must be at most {}", u32::MAX))
        );
        assert!(validate(&json!({"id": "s", "action": "scroll", "amount": huge})).is_err());

        let cmd = validate(&json!({"id": "c", "action": "click", "selector": "#a", "clickCount": 3})).unwrap();
        assert!(matches!(cmd.action, Action::Click { click_count: 3, .. }));
    }

    #[test]
    fn test_every_action_name_round_trips() {
        for name in ACTIONS {
            if let Ok(cmd) = validate(&json!({"id": "x", "action": name})) {
                assert_eq!(cmd.action.name(), *name);
            }
        }
        let cmd = validate(&json!({"id": "x", "action": "select", "selector": "#s", "values": "a"}))
            .unwrap();
        assert_eq!(cmd.action.name(), "select");
    }
}
