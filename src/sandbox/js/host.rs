//! Browser host objects: `document`, `window`, nodes, events and timers.

use tracing::warn;

use super::interp::{arg, type_err, Flow, Interp, Listener, Timer, MAX_DOM_NODES, R};
use super::parser;
use super::promise::Job;
use super::value::*;
use super::ScriptError;
use crate::sandbox::css::{self, Declaration};
use crate::sandbox::dom::{DomError, NodeId, NodeKind, DOCUMENT};
use crate::sandbox::selector::SelectorList;

pub(super) const NODE_METHODS: &[&str] = &[
    "appendChild", "removeChild", "insertBefore", "replaceChild", "append", "prepend", "remove",
    "before", "after", "replaceWith", "replaceChildren", "cloneNode", "contains", "hasChildNodes",
    "getAttribute", "setAttribute", "removeAttribute", "hasAttribute", "toggleAttribute",
    "getAttributeNames", "querySelector", "querySelectorAll", "getElementsByTagName",
    "getElementsByClassName", "closest", "matches", "addEventListener", "removeEventListener",
    "dispatchEvent", "click", "focus", "blur", "insertAdjacentHTML", "insertAdjacentElement",
    "insertAdjacentText", "getBoundingClientRect", "scrollIntoView", "submit", "requestSubmit",
    "reset", "select", "checkValidity", "reportValidity", "getRootNode",
];

pub(super) const DOCUMENT_METHODS: &[&str] = &[
    "getElementById", "getElementsByName", "createElement", "createTextNode", "createComment",
    "createDocumentFragment", "querySelector", "querySelectorAll", "getElementsByTagName",
    "getElementsByClassName", "addEventListener", "removeEventListener", "dispatchEvent", "contains",
    "hasChildNodes", "appendChild", "removeChild",
];

pub(super) const WINDOW_METHODS: &[&str] = &["addEventListener", "removeEventListener", "dispatchEvent"];
pub(super) const CLASS_LIST_METHODS: &[&str] = &["add", "remove", "toggle", "contains", "replace", "item", "forEach"];
pub(super) const STYLE_METHODS: &[&str] = &["setProperty", "getPropertyValue", "removeProperty"];
pub(super) const NODE_LIST_METHODS: &[&str] = &["forEach", "item", "entries", "keys", "values"];
pub(super) const EVENT_METHODS: &[&str] = &["preventDefault", "stopPropagation", "stopImmediatePropagation"];
pub(super) const STORAGE_METHODS: &[&str] = &["getItem", "setItem", "removeItem", "clear", "key"];

const HOST_FUNCTIONS: &[&str] = &[
    "setTimeout", "setInterval", "clearTimeout", "clearInterval", "requestAnimationFrame",
    "cancelAnimationFrame", "queueMicrotask", "alert", "confirm", "prompt", "getComputedStyle",
    "matchMedia", "scrollTo", "scrollBy", "Image", "Option",
];

const EVENT_CLASSES: &[&str] = &[
    "Event", "CustomEvent", "UIEvent", "MouseEvent", "KeyboardEvent", "InputEvent", "FocusEvent",
    "SubmitEvent",
];

/// Interfaces exposed only for `instanceof` checks.
const INTERFACES: &[&str] = &[
    "EventTarget", "Node", "Element", "HTMLElement", "Text", "Comment", "Document", "HTMLDocument",
    "DocumentFragment", "NodeList", "HTMLCollection", "Window", "HTMLDivElement", "HTMLSpanElement",
    "HTMLParagraphElement", "HTMLAnchorElement", "HTMLButtonElement", "HTMLInputElement",
    "HTMLFormElement", "HTMLUListElement", "HTMLOListElement", "HTMLLIElement", "HTMLImageElement",
    "HTMLSelectElement", "HTMLOptionElement", "HTMLTextAreaElement", "HTMLLabelElement",
    "HTMLTableElement", "HTMLTableRowElement", "HTMLTableCellElement", "HTMLHeadingElement",
    "HTMLBodyElement", "HTMLHeadElement", "HTMLHtmlElement", "HTMLScriptElement", "HTMLStyleElement",
    "HTMLCanvasElement", "HTMLBRElement", "HTMLHRElement", "Storage",
];

const BOOLEAN_ATTRS: &[(&str, &str)] = &[
    ("disabled", "disabled"),
    ("hidden", "hidden"),
    ("required", "required"),
    ("readOnly", "readonly"),
    ("multiple", "multiple"),
    ("autofocus", "autofocus"),
    ("open", "open"),
];

const STRING_ATTRS: &[(&str, &str)] = &[
    ("name", "name"),
    ("href", "href"),
    ("src", "src"),
    ("alt", "alt"),
    ("placeholder", "placeholder"),
    ("htmlFor", "for"),
    ("lang", "lang"),
    ("rel", "rel"),
    ("target", "target"),
    ("action", "action"),
    ("method", "method"),
    ("min", "min"),
    ("max", "max"),
    ("step", "step"),
    ("pattern", "pattern"),
];

/// Animation frames run on a fixed 60Hz virtual clock.
const FRAME_MS: f64 = 16.0;
pub(super) const MAX_TIMER_RUNS: usize = 10_000;
/// Characters (keys plus values) one storage area may hold.
const STORAGE_QUOTA: usize = 5_000_000;

fn dom_err(e: DomError) -> ScriptError {
    let name = match e {
        DomError::Hierarchy(_) => "HierarchyRequestError",
        DomError::NotAChild(_) => "NotFoundError",
    };
    ScriptError::Dom { name, message: e.to_string() }
}

fn interface_name(tag: &str) -> &'static str {
    match tag {
        "div" => "HTMLDivElement",
        "span" => "HTMLSpanElement",
        "p" => "HTMLParagraphElement",
        "a" => "HTMLAnchorElement",
        "button" => "HTMLButtonElement",
        "input" => "HTMLInputElement",
        "form" => "HTMLFormElement",
        "ul" => "HTMLUListElement",
        "ol" => "HTMLOListElement",
        "li" => "HTMLLIElement",
        "img" => "HTMLImageElement",
        "select" => "HTMLSelectElement",
        "option" => "HTMLOptionElement",
        "textarea" => "HTMLTextAreaElement",
        "label" => "HTMLLabelElement",
        "table" => "HTMLTableElement",
        "tr" => "HTMLTableRowElement",
        "td" | "th" => "HTMLTableCellElement",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "HTMLHeadingElement",
        "body" => "HTMLBodyElement",
        "head" => "HTMLHeadElement",
        "html" => "HTMLHtmlElement",
        "script" => "HTMLScriptElement",
        "style" => "HTMLStyleElement",
        "canvas" => "HTMLCanvasElement",
        "br" => "HTMLBRElement",
        "hr" => "HTMLHRElement",
        _ => "HTMLElement",
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Capture,
    AtTarget,
    Bubble,
}

impl Interp {
    pub fn install_host(&mut self) {
        let global = self.global_scope;
        let doc = self.document_value();
        self.declare(global, "document", doc, false);
        for name in ["window", "self", "globalThis"] {
            self.declare(global, name, Value::Obj(self.window), false);
        }
        for name in HOST_FUNCTIONS.iter().chain(EVENT_CLASSES).chain(INTERFACES) {
            let f = self.native(name);
            self.declare(global, name, f, true);
        }
        for name in ["localStorage", "sessionStorage"] {
            let area = self.alloc(ObjKind::Storage(Vec::new()));
            self.declare(global, name, Value::Obj(area), false);
        }
    }

    // --- Nodes ---

    pub fn node_value(&mut self, n: NodeId) -> Value {
        Value::Obj(self.node_obj(n))
    }

    fn node_obj(&mut self, n: NodeId) -> ObjId {
        if let Some(id) = self.node_objs.get(&n) {
            return *id;
        }
        let id = self.alloc(ObjKind::Node(n));
        self.node_objs.insert(n, id);
        id
    }

    fn opt_node(&mut self, n: Option<NodeId>) -> Value {
        match n {
            Some(n) => self.node_value(n),
            None => Value::Null,
        }
    }

    fn node_list(&mut self, nodes: Vec<NodeId>) -> Value {
        Value::Obj(self.alloc(ObjKind::NodeList(nodes)))
    }

    fn node_of(&self, v: &Value) -> Option<NodeId> {
        match v {
            Value::Obj(id) => match self.heap[*id].kind {
                ObjKind::Node(n) => Some(n),
                _ => None,
            },
            _ => None,
        }
    }

    fn node_arg(&self, v: &Value, method: &str) -> R<NodeId> {
        self.node_of(v)
            .ok_or_else(|| type_err(format!("Failed to execute '{method}' on 'Node': parameter 1 is not of type 'Node'.")))
    }

    /// Nodes and strings (as text nodes), the argument shape of `append`/`before`.
    fn nodes_from_args(&mut self, args: &[Value]) -> R<Vec<NodeId>> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            match self.node_of(a) {
                Some(n) => out.push(n),
                None => {
                    let text = self.to_string(a)?;
                    out.push(self.dom.create_text(&text));
                }
            }
        }
        Ok(out)
    }

    pub fn node_type_string(&self, n: NodeId) -> String {
        match &self.dom.node(n).kind {
            NodeKind::Document => "[object HTMLDocument]".into(),
            NodeKind::Fragment => "[object DocumentFragment]".into(),
            NodeKind::Text(_) => "[object Text]".into(),
            NodeKind::Comment(_) => "[object Comment]".into(),
            NodeKind::Element(e) => format!("[object {}]", interface_name(&e.tag)),
        }
    }

    pub(super) fn host_instance_of(&self, id: ObjId, ctor: &str) -> bool {
        match &self.heap[id].kind {
            ObjKind::Node(n) => {
                let n = *n;
                match ctor {
                    "Node" | "EventTarget" => true,
                    "Element" | "HTMLElement" => self.dom.is_element(n),
                    "Text" => matches!(self.dom.node(n).kind, NodeKind::Text(_)),
                    "Comment" => matches!(self.dom.node(n).kind, NodeKind::Comment(_)),
                    "Document" | "HTMLDocument" => n == DOCUMENT,
                    "DocumentFragment" => self.dom.is_fragment(n),
                    other => self.dom.tag(n).map(interface_name) == Some(other),
                }
            }
            ObjKind::NodeList(_) => matches!(ctor, "NodeList" | "HTMLCollection"),
            ObjKind::Window => matches!(ctor, "Window" | "EventTarget"),
            ObjKind::Storage(_) => ctor == "Storage",
            ObjKind::Event { class, .. } => {
                ctor == "Event"
                    || ctor == *class
                    || (ctor == "UIEvent" && matches!(*class, "MouseEvent" | "KeyboardEvent" | "InputEvent" | "FocusEvent"))
            }
            _ => false,
        }
    }

    fn node_name(&self, n: NodeId) -> String {
        match &self.dom.node(n).kind {
            NodeKind::Document => "#document".into(),
            NodeKind::Fragment => "#document-fragment".into(),
            NodeKind::Text(_) => "#text".into(),
            NodeKind::Comment(_) => "#comment".into(),
            NodeKind::Element(e) => e.tag.to_ascii_uppercase(),
        }
    }

    pub fn node_get(&mut self, _obj: ObjId, n: NodeId, key: &str) -> R<Option<Value>> {
        if n == DOCUMENT {
            if let Some(v) = self.document_get(key)? {
                return Ok(Some(v));
            }
        }
        let tag = self.dom.tag(n).unwrap_or_default().to_string();
        let v = match key {
            "nodeType" => Value::Num(match self.dom.node(n).kind {
                NodeKind::Element(_) => 1.0,
                NodeKind::Text(_) => 3.0,
                NodeKind::Comment(_) => 8.0,
                NodeKind::Document => 9.0,
                NodeKind::Fragment => 11.0,
            }),
            "nodeName" => Value::Str(self.node_name(n)),
            "tagName" if self.dom.is_element(n) => Value::Str(tag.to_ascii_uppercase()),
            "localName" if self.dom.is_element(n) => Value::Str(tag.clone()),
            "id" => Value::str(self.dom.attr(n, "id").unwrap_or_default()),
            "className" => Value::str(self.dom.attr(n, "class").unwrap_or_default()),
            "title" => Value::str(self.dom.attr(n, "title").unwrap_or_default()),
            "classList" => Value::Obj(self.alloc(ObjKind::ClassList(n))),
            "style" => Value::Obj(self.alloc(ObjKind::Style(n))),
            "dataset" => Value::Obj(self.alloc(ObjKind::Dataset(n))),
            "textContent" | "innerText" => Value::Str(self.dom.text_content(n)),
            "nodeValue" | "data" | "wholeText" => match self.dom.text(n) {
                Some(t) => Value::str(t),
                None => Value::Null,
            },
            "innerHTML" => Value::Str(self.dom.inner_html(n)),
            "outerHTML" => Value::Str(self.dom.outer_html(n)),
            "parentNode" => {
                let p = self.dom.parent(n);
                self.opt_node(p)
            }
            "parentElement" => {
                let p = self.dom.parent_element(n);
                self.opt_node(p)
            }
            "childNodes" => {
                let kids = self.dom.children(n).to_vec();
                self.node_list(kids)
            }
            "children" => {
                let kids = self.dom.element_children(n);
                self.node_list(kids)
            }
            "firstChild" => {
                let c = self.dom.children(n).first().copied();
                self.opt_node(c)
            }
            "lastChild" => {
                let c = self.dom.children(n).last().copied();
                self.opt_node(c)
            }
            "firstElementChild" => {
                let c = self.dom.element_children(n).first().copied();
                self.opt_node(c)
            }
            "lastElementChild" => {
                let c = self.dom.element_children(n).last().copied();
                self.opt_node(c)
            }
            "nextSibling" => {
                let c = self.dom.next_sibling(n);
                self.opt_node(c)
            }
            "previousSibling" => {
                let c = self.dom.previous_sibling(n);
                self.opt_node(c)
            }
            "nextElementSibling" => {
                let c = self.dom.next_element_sibling(n);
                self.opt_node(c)
            }
            "previousElementSibling" => {
                let c = self.dom.previous_element_sibling(n);
                self.opt_node(c)
            }
            "childElementCount" => Value::Num(self.dom.element_children(n).len() as f64),
            "isConnected" => Value::Bool(self.dom.is_connected(n)),
            "ownerDocument" => self.document_value(),
            "length" if self.dom.text(n).is_some() => Value::Num(self.dom.text(n).unwrap_or_default().chars().count() as f64),
            "value" if matches!(tag.as_str(), "input" | "textarea" | "select" | "option" | "button") => {
                Value::Str(self.control_value(n))
            }
            "defaultValue" => Value::str(self.dom.attr(n, "value").unwrap_or_default()),
            "valueAsNumber" => Value::Num(string_to_number_or_nan(&self.control_value(n))),
            "checked" => Value::Bool(self.is_checked(n)),
            "defaultChecked" => Value::Bool(self.dom.has_attr(n, "checked")),
            "selected" if tag == "option" => Value::Bool(self.option_selected(n)),
            "selectedIndex" if tag == "select" => {
                let options = self.dom.elements_by_tag(n, "option");
                let sel = self.selected_option(n);
                Value::Num(sel.and_then(|s| options.iter().position(|o| *o == s)).map(|i| i as f64).unwrap_or(-1.0))
            }
            "options" if tag == "select" => {
                let options = self.dom.elements_by_tag(n, "option");
                self.node_list(options)
            }
            "elements" if tag == "form" => {
                let controls = self.form_controls(n);
                self.node_list(controls)
            }
            "form" => {
                let f = self.owning_form(n);
                self.opt_node(f)
            }
            "type" if matches!(tag.as_str(), "input" | "button") => {
                let default = if tag == "button" { "submit" } else { "text" };
                Value::Str(self.dom.attr(n, "type").map(|t| t.to_ascii_lowercase()).unwrap_or_else(|| default.into()))
            }
            "tabIndex" => Value::Num(self.dom.attr(n, "tabindex").and_then(|t| t.trim().parse().ok()).unwrap_or(-1.0)),
            "offsetWidth" | "offsetHeight" | "clientWidth" | "clientHeight" | "scrollWidth" | "scrollHeight"
            | "scrollTop" | "scrollLeft" | "offsetTop" | "offsetLeft" => Value::Num(0.0),
            k => {
                if let Some((_, attr)) = BOOLEAN_ATTRS.iter().find(|(p, _)| *p == k) {
                    Value::Bool(self.dom.has_attr(n, attr))
                } else if let Some((_, attr)) = STRING_ATTRS.iter().find(|(p, _)| *p == k) {
                    Value::str(self.dom.attr(n, attr).unwrap_or_default())
                } else {
                    return Ok(None);
                }
            }
        };
        Ok(Some(v))
    }

    fn document_get(&mut self, key: &str) -> R<Option<Value>> {
        Ok(Some(match key {
            "body" => {
                let b = self.dom.body();
                self.opt_node(b)
            }
            "head" => {
                let h = self.dom.head();
                self.opt_node(h)
            }
            "documentElement" => {
                let e = self.dom.document_element();
                self.opt_node(e)
            }
            "title" => Value::Str(self.dom.title()),
            "readyState" => Value::str("complete"),
            "activeElement" => {
                let active = self.active_element.filter(|n| self.dom.is_connected(*n)).or_else(|| self.dom.body());
                self.opt_node(active)
            }
            "forms" | "images" | "links" | "scripts" => {
                let tag = match key {
                    "forms" => "form",
                    "images" => "img",
                    "links" => "a",
                    _ => "script",
                };
                let nodes = self.dom.elements_by_tag(DOCUMENT, tag);
                self.node_list(nodes)
            }
            "defaultView" => Value::Obj(self.window),
            "URL" | "documentURI" => Value::str("about:blank"),
            "location" => self.location(),
            "cookie" => Value::str(""),
            "characterSet" => Value::str("UTF-8"),
            _ => return Ok(None),
        }))
    }

    pub fn node_set(&mut self, n: NodeId, key: &str, value: &Value) -> R<bool> {
        if n == DOCUMENT {
            match key {
                "title" => {
                    let text = self.to_string(value)?;
                    self.set_document_title(&text);
                    return Ok(true);
                }
                "body" | "cookie" | "location" => return Ok(true),
                _ => {}
            }
        }
        let tag = self.dom.tag(n).unwrap_or_default().to_string();
        match key {
            "id" | "className" | "title" => {
                let v = self.to_string(value)?;
                let attr = if key == "className" { "class" } else { key };
                self.dom.set_attr(n, attr, &v);
            }
            "textContent" | "innerText" | "nodeValue" | "data" => {
                let v = match value {
                    Value::Null => String::new(),
                    other => self.to_string(other)?,
                };
                self.dom.set_text_content(n, &v);
            }
            "innerHTML" => {
                let v = self.to_string(value)?;
                self.dom.set_inner_html(n, &v);
            }
            "outerHTML" => {
                let v = self.to_string(value)?;
                if let Some(parent) = self.dom.parent(n) {
                    let frag = self.dom.parse_fragment(&v);
                    self.dom.insert_before(parent, frag, Some(n), "outerHTML").map_err(dom_err)?;
                    self.dom.detach(n);
                }
            }
            "value" if matches!(tag.as_str(), "input" | "textarea" | "select" | "option" | "button") => {
                let v = self.to_string(value)?;
                match tag.as_str() {
                    "select" => self.select_value(n, &v),
                    "option" | "button" => self.dom.set_attr(n, "value", &v),
                    _ => self.form_state.entry(n).or_default().value = Some(v),
                }
            }
            "defaultValue" => {
                let v = self.to_string(value)?;
                self.dom.set_attr(n, "value", &v);
            }
            "checked" => self.set_checked(n, value.truthy()),
            "selected" if tag == "option" => {
                let on = value.truthy();
                if on {
                    if let Some(select) = self.enclosing(n, "select") {
                        for o in self.dom.elements_by_tag(select, "option") {
                            self.form_state.entry(o).or_default().checked = Some(o == n);
                        }
                    }
                }
                self.form_state.entry(n).or_default().checked = Some(on);
            }
            "selectedIndex" if tag == "select" => {
                let i = self.to_number(value)?;
                let options = self.dom.elements_by_tag(n, "option");
                for (idx, o) in options.iter().enumerate() {
                    self.form_state.entry(*o).or_default().checked = Some(idx as f64 == i);
                }
            }
            "type" if matches!(tag.as_str(), "input" | "button") => {
                let v = self.to_string(value)?;
                self.dom.set_attr(n, "type", &v);
            }
            "tabIndex" => {
                let v = self.to_string(value)?;
                self.dom.set_attr(n, "tabindex", &v);
            }
            "style" => {
                let v = self.to_string(value)?;
                self.dom.set_attr(n, "style", &v);
            }
            k => {
                if let Some((_, attr)) = BOOLEAN_ATTRS.iter().find(|(p, _)| *p == k) {
                    if value.truthy() {
                        self.dom.set_attr(n, attr, "");
                    } else {
                        self.dom.remove_attr(n, attr);
                    }
                } else if let Some((_, attr)) = STRING_ATTRS.iter().find(|(p, _)| *p == k) {
                    let v = self.to_string(value)?;
                    self.dom.set_attr(n, attr, &v);
                } else {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn set_document_title(&mut self, text: &str) {
        let existing = self.dom.elements_by_tag(DOCUMENT, "title").first().copied();
        let title = match existing {
            Some(t) => t,
            None => {
                let t = self.dom.create_element("title");
                if let Some(head) = self.dom.head() {
                    let _ = self.dom.append_child(head, t);
                }
                t
            }
        };
        self.dom.set_text_content(title, text);
    }

    // --- Form controls ---

    fn enclosing(&self, n: NodeId, tag: &str) -> Option<NodeId> {
        let mut cur = self.dom.parent(n);
        while let Some(p) = cur {
            if self.dom.tag(p) == Some(tag) {
                return Some(p);
            }
            cur = self.dom.parent(p);
        }
        None
    }

    fn owning_form(&self, n: NodeId) -> Option<NodeId> {
        if let Some(id) = self.dom.attr(n, "form") {
            return self.dom.get_element_by_id(id).filter(|f| self.dom.tag(*f) == Some("form"));
        }
        self.enclosing(n, "form")
    }

    fn form_controls(&self, form: NodeId) -> Vec<NodeId> {
        self.dom
            .descendant_elements(form)
            .into_iter()
            .filter(|c| matches!(self.dom.tag(*c), Some("input" | "select" | "textarea" | "button")))
            .collect()
    }

    fn input_type(&self, n: NodeId) -> String {
        self.dom.attr(n, "type").map(|t| t.to_ascii_lowercase()).unwrap_or_else(|| "text".into())
    }

    fn control_value(&self, n: NodeId) -> String {
        if let Some(v) = self.form_state.get(&n).and_then(|s| s.value.clone()) {
            return v;
        }
        match self.dom.tag(n) {
            Some("textarea") => self.dom.text_content(n),
            Some("select") => self.selected_option(n).map(|o| self.control_value(o)).unwrap_or_default(),
            Some("option") => match self.dom.attr(n, "value") {
                Some(v) => v.to_string(),
                None => self.dom.text_content(n).split_whitespace().collect::<Vec<_>>().join(" "),
            },
            _ => match self.dom.attr(n, "value") {
                Some(v) => v.to_string(),
                None if matches!(self.input_type(n).as_str(), "checkbox" | "radio") => "on".into(),
                None => String::new(),
            },
        }
    }

    fn option_selected(&self, option: NodeId) -> bool {
        match self.enclosing(option, "select") {
            Some(select) => self.selected_option(select) == Some(option),
            None => self.form_state.get(&option).and_then(|s| s.checked).unwrap_or_else(|| self.dom.has_attr(option, "selected")),
        }
    }

    fn selected_option(&self, select: NodeId) -> Option<NodeId> {
        let options = self.dom.elements_by_tag(select, "option");
        let explicit: Vec<(NodeId, bool)> = options
            .iter()
            .filter_map(|o| self.form_state.get(o).and_then(|s| s.checked).map(|c| (*o, c)))
            .collect();
        if !explicit.is_empty() {
            return explicit.iter().find(|(_, c)| *c).map(|(o, _)| *o);
        }
        options.iter().copied().find(|o| self.dom.has_attr(*o, "selected")).or_else(|| options.first().copied())
    }

    fn select_value(&mut self, select: NodeId, value: &str) {
        for o in self.dom.elements_by_tag(select, "option") {
            let hit = self.control_value(o) == value;
            self.form_state.entry(o).or_default().checked = Some(hit);
        }
    }

    fn is_checked(&self, n: NodeId) -> bool {
        self.form_state.get(&n).and_then(|s| s.checked).unwrap_or_else(|| self.dom.has_attr(n, "checked"))
    }

    fn set_checked(&mut self, n: NodeId, on: bool) {
        self.form_state.entry(n).or_default().checked = Some(on);
        if on && self.input_type(n) == "radio" {
            for other in self.radio_group(n) {
                if other != n {
                    self.form_state.entry(other).or_default().checked = Some(false);
                }
            }
        }
    }

    fn radio_group(&self, n: NodeId) -> Vec<NodeId> {
        let Some(name) = self.dom.attr(n, "name") else { return vec![n] };
        let root = self.owning_form(n).unwrap_or(DOCUMENT);
        self.dom
            .descendant_elements(root)
            .into_iter()
            .filter(|o| self.dom.tag(*o) == Some("input") && self.input_type(*o) == "radio" && self.dom.attr(*o, "name") == Some(name))
            .collect()
    }

    fn reset_form(&mut self, form: NodeId) {
        for c in self.dom.descendant_elements(form) {
            self.form_state.remove(&c);
        }
    }

    fn is_valid(&self, n: NodeId) -> bool {
        let controls = if self.dom.tag(n) == Some("form") { self.form_controls(n) } else { vec![n] };
        controls.into_iter().all(|c| {
            if !self.dom.has_attr(c, "required") {
                return true;
            }
            match self.input_type(c).as_str() {
                "checkbox" | "radio" if self.dom.tag(c) == Some("input") => self.is_checked(c),
                _ => !self.control_value(c).is_empty(),
            }
        })
    }

    // --- Node methods ---

    pub(super) fn call_host_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Option<Value>> {
        let v = match &self.heap[id].kind {
            ObjKind::Node(n) => {
                let n = *n;
                if n == DOCUMENT && DOCUMENT_METHODS.contains(&name) {
                    self.document_method(id, name, args)?
                } else if NODE_METHODS.contains(&name) {
                    self.node_method(id, n, name, args)?
                } else {
                    return Ok(None);
                }
            }
            ObjKind::Window if WINDOW_METHODS.contains(&name) => self.event_target_method(id, name, args)?,
            ObjKind::ClassList(n) if CLASS_LIST_METHODS.contains(&name) => {
                let n = *n;
                self.class_list_method(n, name, args)?
            }
            ObjKind::Style(n) if STYLE_METHODS.contains(&name) => {
                let n = *n;
                self.style_method(n, name, args)?
            }
            ObjKind::ComputedStyle(map) if name == "getPropertyValue" => {
                let key = self.display(&arg(args, 0));
                Value::str(map.get(&key).cloned().unwrap_or_default())
            }
            ObjKind::NodeList(nodes) if NODE_LIST_METHODS.contains(&name) => {
                let nodes = nodes.clone();
                self.node_list_method(id, nodes, name, args)?
            }
            ObjKind::Storage(_) if STORAGE_METHODS.contains(&name) => self.storage_method(id, name, args)?,
            ObjKind::Event { .. } if EVENT_METHODS.contains(&name) => {
                let cancelable = self.heap[id].props.get("cancelable").map(Value::truthy).unwrap_or(false);
                if let ObjKind::Event { prevented, stopped, immediate, .. } = &mut self.heap[id].kind {
                    match name {
                        "preventDefault" => *prevented |= cancelable,
                        "stopPropagation" => *stopped = true,
                        _ => {
                            *stopped = true;
                            *immediate = true;
                        }
                    }
                }
                Value::Undefined
            }
            _ => return Ok(None),
        };
        Ok(Some(v))
    }

    fn document_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let a0 = arg(args, 0);
        match name {
            "getElementById" => {
                let key = self.to_string(&a0)?;
                let n = self.dom.get_element_by_id(&key);
                Ok(self.opt_node(n))
            }
            "getElementsByName" => {
                let key = self.to_string(&a0)?;
                let nodes: Vec<NodeId> = self
                    .dom
                    .descendant_elements(DOCUMENT)
                    .into_iter()
                    .filter(|n| self.dom.attr(*n, "name") == Some(key.as_str()))
                    .collect();
                Ok(self.node_list(nodes))
            }
            "createElement" => {
                let tag = self.to_string(&a0)?;
                if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err(ScriptError::Dom {
                        name: "InvalidCharacterError",
                        message: format!("Failed to execute 'createElement' on 'Document': The tag name provided ('{tag}') is not a valid name."),
                    });
                }
                let n = self.dom.create_element(&tag);
                Ok(self.node_value(n))
            }
            "createTextNode" => {
                let text = self.to_string(&a0)?;
                let n = self.dom.create_text(&text);
                Ok(self.node_value(n))
            }
            "createComment" => {
                let text = self.to_string(&a0)?;
                let n = self.dom.create_comment(&text);
                Ok(self.node_value(n))
            }
            "createDocumentFragment" => {
                let n = self.dom.create_fragment();
                Ok(self.node_value(n))
            }
            _ => self.node_method(id, DOCUMENT, name, args),
        }
    }

    fn selector(&self, sel: &Value, method: &str) -> R<SelectorList> {
        let text = self.display(sel);
        SelectorList::parse(&text).map_err(|e| ScriptError::Dom {
            name: "SyntaxError",
            message: format!("Failed to execute '{method}' on 'Element': {e}"),
        })
    }

    fn node_method(&mut self, id: ObjId, n: NodeId, name: &str, args: &[Value]) -> R<Value> {
        let a0 = arg(args, 0);
        match name {
            "appendChild" => {
                let child = self.node_arg(&a0, name)?;
                self.dom.append_child(n, child).map_err(dom_err)?;
                Ok(a0)
            }
            "removeChild" => {
                let child = self.node_arg(&a0, name)?;
                self.dom.remove_child(n, child).map_err(dom_err)?;
                Ok(a0)
            }
            "insertBefore" => {
                let child = self.node_arg(&a0, name)?;
                let reference = self.node_of(&arg(args, 1));
                self.dom.insert_before(n, child, reference, "insertBefore").map_err(dom_err)?;
                Ok(a0)
            }
            "replaceChild" => {
                let new = self.node_arg(&a0, name)?;
                let old = self.node_arg(&arg(args, 1), name)?;
                self.dom.insert_before(n, new, Some(old), "replaceChild").map_err(dom_err)?;
                self.dom.detach(old);
                Ok(arg(args, 1))
            }
            "append" | "prepend" => {
                let nodes = self.nodes_from_args(args)?;
                let reference = if name == "prepend" { self.dom.children(n).first().copied() } else { None };
                for c in nodes {
                    self.dom.insert_before(n, c, reference, if name == "append" { "append" } else { "prepend" }).map_err(dom_err)?;
                }
                Ok(Value::Undefined)
            }
            "replaceChildren" => {
                let nodes = self.nodes_from_args(args)?;
                self.dom.replace_children(n, &nodes).map_err(dom_err)?;
                Ok(Value::Undefined)
            }
            "remove" => {
                self.dom.detach(n);
                Ok(Value::Undefined)
            }
            "before" | "after" | "replaceWith" => {
                let Some(parent) = self.dom.parent(n) else { return Ok(Value::Undefined) };
                let nodes = self.nodes_from_args(args)?;
                let reference = if name == "after" { self.dom.next_sibling(n) } else { Some(n) };
                for c in nodes {
                    if c == n {
                        continue;
                    }
                    self.dom.insert_before(parent, c, reference, "before").map_err(dom_err)?;
                }
                if name == "replaceWith" && !args.iter().any(|a| self.node_of(a) == Some(n)) {
                    self.dom.detach(n);
                }
                Ok(Value::Undefined)
            }
            "cloneNode" => {
                let deep = a0.truthy();
                let size = if deep { self.dom.descendants(n).len() + 1 } else { 1 };
                if self.dom.len() + size > MAX_DOM_NODES {
                    return Err(ScriptError::Range("Document node limit exceeded".into()));
                }
                let copy = self.dom.clone_node(n, deep);
                Ok(self.node_value(copy))
            }
            "contains" => Ok(Value::Bool(self.node_of(&a0).map(|o| self.dom.contains(n, o)).unwrap_or(false))),
            "hasChildNodes" => Ok(Value::Bool(!self.dom.children(n).is_empty())),
            "getAttribute" => {
                let key = self.to_string(&a0)?;
                Ok(self.dom.attr(n, &key).map(Value::str).unwrap_or(Value::Null))
            }
            "setAttribute" => {
                let key = self.to_string(&a0)?;
                let v = self.to_string(&arg(args, 1))?;
                if key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '"' || c == '<' || c == '>') {
                    return Err(ScriptError::Dom {
                        name: "InvalidCharacterError",
                        message: format!("Failed to execute 'setAttribute' on 'Element': '{key}' is not a valid attribute name."),
                    });
                }
                self.dom.set_attr(n, &key, &v);
                Ok(Value::Undefined)
            }
            "removeAttribute" => {
                let key = self.to_string(&a0)?;
                self.dom.remove_attr(n, &key);
                Ok(Value::Undefined)
            }
            "hasAttribute" => {
                let key = self.to_string(&a0)?;
                Ok(Value::Bool(self.dom.has_attr(n, &key)))
            }
            "toggleAttribute" => {
                let key = self.to_string(&a0)?;
                let on = match arg(args, 1) {
                    Value::Undefined => !self.dom.has_attr(n, &key),
                    force => force.truthy(),
                };
                if on {
                    if !self.dom.has_attr(n, &key) {
                        self.dom.set_attr(n, &key, "");
                    }
                } else {
                    self.dom.remove_attr(n, &key);
                }
                Ok(Value::Bool(on))
            }
            "getAttributeNames" => {
                let names = self.dom.attrs(n).iter().map(|(k, _)| Value::str(k.as_str())).collect();
                Ok(self.array(names))
            }
            "querySelector" => {
                let sel = self.selector(&a0, name)?;
                let found = sel.query_first(&self.dom, n);
                Ok(self.opt_node(found))
            }
            "querySelectorAll" => {
                let sel = self.selector(&a0, name)?;
                let found = sel.query_all(&self.dom, n);
                Ok(self.node_list(found))
            }
            "getElementsByTagName" => {
                let tag = self.to_string(&a0)?;
                let found = self.dom.elements_by_tag(n, &tag);
                Ok(self.node_list(found))
            }
            "getElementsByClassName" => {
                let names = self.to_string(&a0)?;
                let found = self.dom.elements_by_class(n, &names);
                Ok(self.node_list(found))
            }
            "closest" => {
                let sel = self.selector(&a0, name)?;
                let mut cur = Some(n);
                while let Some(c) = cur {
                    if self.dom.is_element(c) && sel.matches(&self.dom, c) {
                        return Ok(self.node_value(c));
                    }
                    cur = self.dom.parent(c);
                }
                Ok(Value::Null)
            }
            "matches" => {
                let sel = self.selector(&a0, name)?;
                Ok(Value::Bool(self.dom.is_element(n) && sel.matches(&self.dom, n)))
            }
            "addEventListener" | "removeEventListener" | "dispatchEvent" => self.event_target_method(id, name, args),
            "click" => {
                self.click(n)?;
                Ok(Value::Undefined)
            }
            "focus" => {
                self.focus(n)?;
                Ok(Value::Undefined)
            }
            "blur" => {
                if self.active_element == Some(n) {
                    self.active_element = None;
                    self.fire(n, "FocusEvent", "blur", false, false)?;
                    self.fire(n, "FocusEvent", "focusout", true, false)?;
                }
                Ok(Value::Undefined)
            }
            "insertAdjacentHTML" | "insertAdjacentElement" | "insertAdjacentText" => {
                let position = self.to_string(&a0)?.to_ascii_lowercase();
                let payload = arg(args, 1);
                let node = match name {
                    "insertAdjacentHTML" => {
                        let html = self.to_string(&payload)?;
                        self.dom.parse_fragment(&html)
                    }
                    "insertAdjacentText" => {
                        let text = self.to_string(&payload)?;
                        self.dom.create_text(&text)
                    }
                    _ => self.node_arg(&payload, name)?,
                };
                let (parent, reference) = match position.as_str() {
                    "beforebegin" => (self.dom.parent(n), Some(n)),
                    "afterbegin" => (Some(n), self.dom.children(n).first().copied()),
                    "beforeend" => (Some(n), None),
                    "afterend" => (self.dom.parent(n), self.dom.next_sibling(n)),
                    other => {
                        return Err(ScriptError::Dom {
                            name: "SyntaxError",
                            message: format!("Failed to execute '{name}' on 'Element': The value provided ('{other}') is not one of 'beforeBegin', 'afterBegin', 'beforeEnd', or 'afterEnd'."),
                        })
                    }
                };
                if let Some(parent) = parent {
                    self.dom.insert_before(parent, node, reference, "insertAdjacentHTML").map_err(dom_err)?;
                }
                Ok(if name == "insertAdjacentElement" { payload } else { Value::Undefined })
            }
            "getBoundingClientRect" => Ok(self.plain(
                ["x", "y", "top", "left", "right", "bottom", "width", "height"]
                    .into_iter()
                    .map(|k| (k, Value::Num(0.0)))
                    .collect(),
            )),
            "scrollIntoView" | "select" => Ok(Value::Undefined),
            "submit" => Ok(Value::Undefined),
            "requestSubmit" => {
                self.submit_form(n)?;
                Ok(Value::Undefined)
            }
            "reset" => {
                if self.fire(n, "Event", "reset", true, true)? {
                    self.reset_form(n);
                }
                Ok(Value::Undefined)
            }
            "checkValidity" | "reportValidity" => {
                let valid = self.is_valid(n);
                if !valid {
                    self.fire(n, "Event", "invalid", false, true)?;
                }
                Ok(Value::Bool(valid))
            }
            "getRootNode" => {
                let mut root = n;
                while let Some(p) = self.dom.parent(root) {
                    root = p;
                }
                Ok(self.node_value(root))
            }
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    fn node_list_method(&mut self, id: ObjId, nodes: Vec<NodeId>, name: &str, args: &[Value]) -> R<Value> {
        match name {
            "forEach" => {
                let f = arg(args, 0);
                for (i, n) in nodes.into_iter().enumerate() {
                    self.tick()?;
                    let v = self.node_value(n);
                    self.call(&f, arg(args, 1), vec![v, Value::Num(i as f64), Value::Obj(id)])?;
                }
                Ok(Value::Undefined)
            }
            "item" => {
                let i = self.to_number(&arg(args, 0))?;
                let n = if i >= 0.0 { nodes.get(i as usize).copied() } else { None };
                Ok(self.opt_node(n))
            }
            "keys" => {
                let keys = (0..nodes.len()).map(|i| Value::Num(i as f64)).collect();
                Ok(self.array(keys))
            }
            "values" => {
                let vals = nodes.into_iter().map(|n| self.node_value(n)).collect();
                Ok(self.array(vals))
            }
            _ => {
                let mut out = Vec::with_capacity(nodes.len());
                for (i, n) in nodes.into_iter().enumerate() {
                    let v = self.node_value(n);
                    out.push(self.array(vec![Value::Num(i as f64), v]));
                }
                Ok(self.array(out))
            }
        }
    }

    // --- classList / style ---

    pub fn class_list_get(&self, n: NodeId, key: &str) -> Option<Value> {
        let classes = self.dom.class_list(n);
        match key {
            "length" => Some(Value::Num(classes.len() as f64)),
            "value" => Some(Value::str(self.dom.attr(n, "class").unwrap_or_default())),
            k => array_index(k).map(|i| classes.get(i).map(|c| Value::str(c.as_str())).unwrap_or(Value::Undefined)),
        }
    }

    fn class_token(&mut self, v: &Value, method: &str) -> R<String> {
        let token = self.to_string(v)?;
        if token.is_empty() {
            return Err(ScriptError::Dom {
                name: "SyntaxError",
                message: format!("Failed to execute '{method}' on 'DOMTokenList': The token provided must not be empty."),
            });
        }
        if token.contains(char::is_whitespace) {
            return Err(ScriptError::Dom {
                name: "InvalidCharacterError",
                message: format!("Failed to execute '{method}' on 'DOMTokenList': The token provided ('{token}') contains HTML space characters, which are not valid in tokens."),
            });
        }
        Ok(token)
    }

    fn class_list_method(&mut self, n: NodeId, name: &str, args: &[Value]) -> R<Value> {
        let mut classes = self.dom.class_list(n);
        match name {
            "add" | "remove" => {
                for a in args {
                    let token = self.class_token(a, name)?;
                    if name == "add" {
                        if !classes.contains(&token) {
                            classes.push(token);
                        }
                    } else {
                        classes.retain(|c| *c != token);
                    }
                }
                self.dom.set_class_list(n, &classes);
                Ok(Value::Undefined)
            }
            "toggle" => {
                let token = self.class_token(&arg(args, 0), name)?;
                let present = classes.contains(&token);
                let on = match arg(args, 1) {
                    Value::Undefined => !present,
                    force => force.truthy(),
                };
                if on && !present {
                    classes.push(token);
                } else if !on {
                    classes.retain(|c| *c != token);
                }
                self.dom.set_class_list(n, &classes);
                Ok(Value::Bool(on))
            }
            "contains" => {
                let token = self.to_string(&arg(args, 0))?;
                Ok(Value::Bool(classes.contains(&token)))
            }
            "replace" => {
                let old = self.class_token(&arg(args, 0), name)?;
                let new = self.class_token(&arg(args, 1), name)?;
                let Some(pos) = classes.iter().position(|c| *c == old) else { return Ok(Value::Bool(false)) };
                if classes.contains(&new) {
                    classes.remove(pos);
                } else {
                    classes[pos] = new;
                }
                self.dom.set_class_list(n, &classes);
                Ok(Value::Bool(true))
            }
            "item" => {
                let i = self.to_number(&arg(args, 0))?;
                Ok(if i >= 0.0 { classes.get(i as usize).map(|c| Value::str(c.as_str())).unwrap_or(Value::Null) } else { Value::Null })
            }
            _ => {
                let f = arg(args, 0);
                for (i, c) in classes.into_iter().enumerate() {
                    self.call(&f, Value::Undefined, vec![Value::Str(c), Value::Num(i as f64)])?;
                }
                Ok(Value::Undefined)
            }
        }
    }

    fn inline_declarations(&self, n: NodeId) -> Vec<Declaration> {
        self.dom.attr(n, "style").map(css::parse_declarations).unwrap_or_default()
    }

    fn style_property(key: &str) -> String {
        match key {
            "cssFloat" => "float".into(),
            k if k.contains('-') => k.to_ascii_lowercase(),
            k => css::camel_to_kebab(k),
        }
    }

    pub fn style_get(&self, n: NodeId, key: &str) -> Value {
        let decls = self.inline_declarations(n);
        match key {
            "cssText" => Value::Str(css::serialize_declarations(&decls)),
            "length" => Value::Num(decls.len() as f64),
            k => {
                let prop = Self::style_property(k);
                Value::str(decls.iter().rev().find(|d| d.property == prop).map(|d| d.value.clone()).unwrap_or_default())
            }
        }
    }

    pub fn style_set(&mut self, n: NodeId, key: &str, value: &str) {
        if key == "cssText" {
            self.dom.set_attr(n, "style", value);
            return;
        }
        self.write_style(n, &Self::style_property(key), value, false);
    }

    fn write_style(&mut self, n: NodeId, prop: &str, value: &str, important: bool) {
        let mut decls = self.inline_declarations(n);
        let value = value.trim();
        if value.is_empty() {
            decls.retain(|d| d.property != prop);
        } else if let Some(d) = decls.iter_mut().find(|d| d.property == prop) {
            d.value = value.to_string();
            d.important = important;
        } else {
            decls.push(Declaration { property: prop.to_string(), value: value.to_string(), important });
        }
        let text = css::serialize_declarations(&decls);
        self.dom.set_attr(n, "style", &text);
    }

    fn style_method(&mut self, n: NodeId, name: &str, args: &[Value]) -> R<Value> {
        let prop = self.to_string(&arg(args, 0))?.to_ascii_lowercase();
        match name {
            "setProperty" => {
                let value = match arg(args, 1) {
                    Value::Null | Value::Undefined => String::new(),
                    v => self.to_string(&v)?,
                };
                let important = self.display(&arg(args, 2)) == "important";
                self.write_style(n, &prop, &value, important);
                Ok(Value::Undefined)
            }
            "getPropertyValue" => Ok(self.style_get(n, &prop)),
            _ => {
                let old = self.style_get(n, &prop);
                self.write_style(n, &prop, "", false);
                Ok(old)
            }
        }
    }

    fn computed_style_of(&mut self, n: NodeId) -> Value {
        let rules: Vec<css::Rule> = self.dom.style_sheets().iter().flat_map(|s| css::parse_stylesheet(s)).collect();
        let map = css::computed_style(&self.dom, &rules, n);
        Value::Obj(self.alloc(ObjKind::ComputedStyle(map)))
    }

    // --- window ---

    pub fn window_get(&mut self, key: &str) -> R<Option<Value>> {
        let v = match key {
            "document" => self.document_value(),
            "innerWidth" | "outerWidth" => Value::Num(1024.0),
            "innerHeight" | "outerHeight" => Value::Num(768.0),
            "devicePixelRatio" => Value::Num(1.0),
            "scrollX" | "scrollY" | "pageXOffset" | "pageYOffset" => Value::Num(0.0),
            "frames" | "parent" | "top" => Value::Obj(self.window),
            "location" => self.location(),
            "navigator" => self.plain(vec![
                ("userAgent", Value::str("Mozilla/5.0 (linux) AppleWebKit/537.36 (KHTML, like Gecko) jsdom")),
                ("language", Value::str("en-US")),
                ("onLine", Value::Bool(true)),
            ]),
            k => {
                let global = &self.scopes[self.global_scope].vars;
                if let Some(b) = global.get(k).filter(|_| !self.lexical_globals.contains(k)) {
                    b.value.clone()
                } else if let Some(b) = self.scopes[self.builtins_scope].vars.get(k) {
                    b.value.clone()
                } else {
                    return Ok(None);
                }
            }
        };
        Ok(Some(v))
    }

    pub fn window_set(&mut self, key: &str, value: &Value) -> R<bool> {
        if matches!(key, "location" | "document") {
            return Ok(true);
        }
        if self.lexical_globals.contains(key) {
            return Ok(false);
        }
        let global = self.global_scope;
        match self.scopes[global].vars.get_mut(key) {
            Some(b) if b.mutable => {
                b.value = value.clone();
                b.initialized = true;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn location(&mut self) -> Value {
        let reload = self.native("noop");
        self.plain(vec![
            ("href", Value::str("about:blank")),
            ("protocol", Value::str("about:")),
            ("pathname", Value::str("blank")),
            ("hash", Value::str("")),
            ("search", Value::str("")),
            ("host", Value::str("")),
            ("origin", Value::str("null")),
            ("reload", reload),
        ])
    }

    // --- Host natives ---

    pub(super) fn call_host_native(&mut self, name: &'static str, _this: Value, args: Vec<Value>, construct: bool) -> R<Value> {
        if EVENT_CLASSES.contains(&name) {
            if !construct {
                return Err(type_err(format!("Failed to construct '{name}': Please use the 'new' operator, this DOM object constructor cannot be called as a function.")));
            }
            let ty = self.to_string(&arg(&args, 0))?;
            let ev = self.new_event(name, &ty, false, false);
            let init = arg(&args, 1);
            if !init.is_nullish() {
                for k in self.own_keys(&init) {
                    let v = self.get_prop(&init, &k)?;
                    self.heap[ev].props.set(&k, v);
                }
            }
            if name == "CustomEvent" && !self.heap[ev].props.has("detail") {
                self.heap[ev].props.set("detail", Value::Null);
            }
            return Ok(Value::Obj(ev));
        }
        if INTERFACES.contains(&name) {
            return Err(type_err("Illegal constructor"));
        }
        let a0 = arg(&args, 0);
        match name {
            "setTimeout" | "setInterval" => {
                let delay = self.to_number(&arg(&args, 1))?;
                let delay = if delay.is_finite() { delay.max(1.0) } else { 1.0 };
                let extra = args.iter().skip(2).cloned().collect();
                let interval = (name == "setInterval").then_some(delay);
                Ok(Value::Num(self.schedule(a0, extra, delay, interval, false) as f64))
            }
            "requestAnimationFrame" => Ok(Value::Num(self.schedule(a0, Vec::new(), FRAME_MS, None, true) as f64)),
            "queueMicrotask" => {
                if !self.is_callable(&a0) {
                    return Err(type_err(
                        "Failed to execute 'queueMicrotask' on 'Window': parameter 1 is not of type 'Function'.",
                    ));
                }
                self.microtasks.push_back(Job::Callback(a0));
                Ok(Value::Undefined)
            }
            "clearTimeout" | "clearInterval" | "cancelAnimationFrame" => {
                let id = self.to_number(&a0)?;
                self.timers.retain(|t| t.id as f64 != id);
                Ok(Value::Undefined)
            }
            "alert" => {
                let msg = self.to_string(&a0)?;
                self.log("alert", msg);
                Ok(Value::Undefined)
            }
            "confirm" => Ok(Value::Bool(false)),
            "prompt" => Ok(Value::Null),
            "getComputedStyle" => {
                let n = self.node_of(&a0).filter(|n| self.dom.is_element(*n)).ok_or_else(|| {
                    type_err("Failed to execute 'getComputedStyle' on 'Window': parameter 1 is not of type 'Element'.")
                })?;
                Ok(self.computed_style_of(n))
            }
            "matchMedia" => {
                let media = self.to_string(&a0)?;
                let noop = self.native("noop");
                Ok(self.plain(vec![
                    ("matches", Value::Bool(false)),
                    ("media", Value::Str(media)),
                    ("addEventListener", noop.clone()),
                    ("removeEventListener", noop.clone()),
                    ("addListener", noop),
                ]))
            }
            "scrollTo" | "scrollBy" | "noop" => Ok(Value::Undefined),
            "Image" => {
                let n = self.dom.create_element("img");
                Ok(self.node_value(n))
            }
            "Option" => {
                let n = self.dom.create_element("option");
                let text = match a0 {
                    Value::Undefined => String::new(),
                    v => self.to_string(&v)?,
                };
                self.dom.set_text_content(n, &text);
                if let Some(v) = args.get(1).filter(|v| !v.is_nullish()) {
                    let v = self.to_string(v)?;
                    self.dom.set_attr(n, "value", &v);
                }
                Ok(self.node_value(n))
            }
            _ => Err(type_err(format!("{name} is not a function"))),
        }
    }

    // --- Timers ---

    fn schedule(&mut self, callback: Value, args: Vec<Value>, delay: f64, interval: Option<f64>, animation_frame: bool) -> u32 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_seq += 1;
        self.timers.push(Timer { id, due: self.clock + delay, seq: self.timer_seq, callback, args, interval, animation_frame });
        id
    }

    /// Advance the virtual clock by `ms`, running due timers in `(due, seq)`
    /// order. Intervals are rescheduled before their callback runs, so a
    /// callback may clear its own interval.
    pub fn run_timers(&mut self, ms: f64) -> Vec<ScriptError> {
        let target = self.clock + ms.max(0.0);
        let mut errors = Vec::new();
        let mut runs = 0;
        while let Some(timer) = self.take_due_timer(target) {
            runs += 1;
            if runs > MAX_TIMER_RUNS {
                warn!(target: "sandbox", "timer budget exhausted, dropping remaining timers");
                self.timers.clear();
                break;
            }
            self.steps = 0;
            self.depth = 0;
            match self.fire_timer(timer) {
                Ok(_) | Err(ScriptError::Suspended) => {}
                Err(err) => {
                    warn!(target: "sandbox", error = %err, "timer callback failed");
                    errors.push(err);
                }
            }
            errors.extend(self.run_microtasks());
        }
        self.clock = self.clock.max(target);
        errors
    }

    /// Earliest timer due by `limit` (ties by scheduling order). Intervals
    /// are rescheduled before they are handed out, so a callback may clear
    /// its own interval.
    pub(super) fn take_due_timer(&mut self, limit: f64) -> Option<Timer> {
        let i = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= limit)
            .min_by(|(_, a), (_, b)| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)?;
        Some(match self.timers[i].interval {
            Some(every) => {
                let t = self.timers[i].clone();
                self.timer_seq += 1;
                self.timers[i].due += every;
                self.timers[i].seq = self.timer_seq;
                t
            }
            None => self.timers.remove(i),
        })
    }

    /// Run one timer callback at its due time on the virtual clock.
    pub(super) fn fire_timer(&mut self, timer: Timer) -> R<Value> {
        self.clock = self.clock.max(timer.due);
        let args = if timer.animation_frame { vec![Value::Num(self.clock)] } else { timer.args };
        match &timer.callback {
            Value::Str(code) => {
                let code = code.clone();
                self.run_source(&code).map(|_| Value::Undefined)
            }
            cb => self.call(cb, Value::Obj(self.window), args),
        }
    }

    /// Queued microtasks, then `DOMContentLoaded` and `load`, each followed
    /// by a microtask checkpoint.
    pub fn fire_lifecycle(&mut self) -> Vec<ScriptError> {
        let mut errors = self.run_timers(0.0);
        self.steps = 0;
        if let Err(err) = self.fire(DOCUMENT, "Event", "DOMContentLoaded", true, false) {
            errors.push(err);
        }
        errors.extend(self.run_microtasks());
        let window = self.window;
        let ev = self.new_event("Event", "load", false, false);
        if let Err(err) = self.dispatch(window, ev) {
            errors.push(err);
        }
        errors.extend(self.run_microtasks());
        errors.extend(self.run_timers(0.0));
        errors
    }

    // --- Storage ---

    fn storage_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let a0 = arg(args, 0);
        match name {
            "getItem" => {
                let key = self.to_string(&a0)?;
                Ok(match &self.heap[id].kind {
                    ObjKind::Storage(items) => {
                        items.iter().find(|(k, _)| *k == key).map(|(_, v)| Value::str(v.clone())).unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                })
            }
            "setItem" => {
                if args.len() < 2 {
                    return Err(type_err(format!(
                        "Failed to execute 'setItem' on 'Storage': 2 arguments required, but only {} present.",
                        args.len()
                    )));
                }
                let key = self.to_string(&a0)?;
                let value = self.to_string(&args[1])?;
                self.storage_set(id, &key, value)?;
                Ok(Value::Undefined)
            }
            "removeItem" => {
                let key = self.to_string(&a0)?;
                if let ObjKind::Storage(items) = &mut self.heap[id].kind {
                    items.retain(|(k, _)| *k != key);
                }
                Ok(Value::Undefined)
            }
            "clear" => {
                if let ObjKind::Storage(items) = &mut self.heap[id].kind {
                    items.clear();
                }
                Ok(Value::Undefined)
            }
            _ => {
                let i = self.to_number(&a0)?;
                Ok(match &self.heap[id].kind {
                    ObjKind::Storage(items) if i >= 0.0 && i.fract() == 0.0 => {
                        items.get(i as usize).map(|(k, _)| Value::str(k.clone())).unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                })
            }
        }
    }

    /// Store an item, keeping the area under its quota.
    pub(super) fn storage_set(&mut self, id: ObjId, key: &str, value: String) -> R<()> {
        let ObjKind::Storage(items) = &mut self.heap[id].kind else { return Ok(()) };
        let others: usize =
            items.iter().filter(|(k, _)| k != key).map(|(k, v)| k.chars().count() + v.chars().count()).sum();
        if others + key.chars().count() + value.chars().count() > STORAGE_QUOTA {
            return Err(ScriptError::Dom {
                name: "QuotaExceededError",
                message: format!("Failed to execute 'setItem' on 'Storage': Setting the value of '{key}' exceeded the quota."),
            });
        }
        match items.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => items.push((key.to_string(), value)),
        }
        Ok(())
    }

    // --- Events ---

    fn new_event(&mut self, class: &'static str, ty: &str, bubbles: bool, cancelable: bool) -> ObjId {
        let id = self.alloc(ObjKind::Event { class, prevented: false, stopped: false, immediate: false });
        let props = &mut self.heap[id].props;
        props.set("type", Value::str(ty));
        props.set("bubbles", Value::Bool(bubbles));
        props.set("cancelable", Value::Bool(cancelable));
        props.set("target", Value::Null);
        props.set("currentTarget", Value::Null);
        props.set("eventPhase", Value::Num(0.0));
        props.set("isTrusted", Value::Bool(false));
        props.set("timeStamp", Value::Num(self.clock));
        id
    }

    /// Create and dispatch a trusted-looking event; `Ok(false)` when cancelled.
    fn fire(&mut self, n: NodeId, class: &'static str, ty: &str, bubbles: bool, cancelable: bool) -> R<bool> {
        let ev = self.new_event(class, ty, bubbles, cancelable);
        self.heap[ev].props.set("isTrusted", Value::Bool(true));
        let target = self.node_obj(n);
        self.dispatch(target, ev)
    }

    fn event_target_method(&mut self, id: ObjId, name: &str, args: &[Value]) -> R<Value> {
        let ty = self.to_string(&arg(args, 0))?;
        let callback = arg(args, 1);
        match name {
            "addEventListener" | "removeEventListener" => {
                if callback.is_nullish() {
                    return Ok(Value::Undefined);
                }
                let opts = arg(args, 2);
                let (capture, once) = match &opts {
                    Value::Obj(_) => {
                        let c = self.get_prop(&opts, "capture")?.truthy();
                        let o = self.get_prop(&opts, "once")?.truthy();
                        (c, o)
                    }
                    other => (other.truthy(), false),
                };
                let same = |l: &Listener| l.target == id && l.event_type == ty && l.callback == callback && l.capture == capture;
                if name == "removeEventListener" {
                    self.listeners.retain(|l| !same(l));
                } else if !self.listeners.iter().any(same) {
                    self.listeners.push(Listener { target: id, event_type: ty, callback, capture, once });
                }
                Ok(Value::Undefined)
            }
            _ => {
                let ev = match arg(args, 0) {
                    Value::Obj(ev) if matches!(self.heap[ev].kind, ObjKind::Event { .. }) => ev,
                    _ => {
                        return Err(type_err(
                            "Failed to execute 'dispatchEvent' on 'EventTarget': parameter 1 is not of type 'Event'.",
                        ))
                    }
                };
                Ok(Value::Bool(self.dispatch(id, ev)?))
            }
        }
    }

    /// Capture, target and bubble phases over the target's ancestor path.
    /// Returns whether the default action may proceed.
    fn dispatch(&mut self, target: ObjId, event: ObjId) -> R<bool> {
        let ty = match self.heap[event].props.get("type") {
            Some(v) => self.display(v),
            None => String::new(),
        };
        let bubbles = self.heap[event].props.get("bubbles").map(Value::truthy).unwrap_or(false);
        let mut path = vec![target];
        if let ObjKind::Node(n) = self.heap[target].kind {
            let mut cur = self.dom.parent(n);
            while let Some(p) = cur {
                path.push(self.node_obj(p));
                cur = self.dom.parent(p);
            }
            if self.dom.is_connected(n) {
                path.push(self.window);
            }
        }
        self.heap[event].props.set("target", Value::Obj(target));

        let result = self.propagate(&path, event, &ty, bubbles);

        let props = &mut self.heap[event].props;
        props.set("currentTarget", Value::Null);
        props.set("eventPhase", Value::Num(0.0));
        let prevented = match &mut self.heap[event].kind {
            ObjKind::Event { prevented, stopped, immediate, .. } => {
                *stopped = false;
                *immediate = false;
                *prevented
            }
            _ => false,
        };
        result.map(|_| !prevented)
    }

    fn propagate(&mut self, path: &[ObjId], event: ObjId, ty: &str, bubbles: bool) -> R<()> {
        let Some((&target, ancestors)) = path.split_first() else { return Ok(()) };
        for &cur in ancestors.iter().rev() {
            if self.propagation_stopped(event) {
                return Ok(());
            }
            self.invoke(cur, event, ty, Phase::Capture)?;
        }
        if self.propagation_stopped(event) {
            return Ok(());
        }
        self.invoke(target, event, ty, Phase::AtTarget)?;
        if bubbles {
            for &cur in ancestors {
                if self.propagation_stopped(event) {
                    break;
                }
                self.invoke(cur, event, ty, Phase::Bubble)?;
            }
        }
        Ok(())
    }

    fn propagation_stopped(&self, event: ObjId) -> bool {
        matches!(self.heap[event].kind, ObjKind::Event { stopped: true, .. })
    }

    fn invoke(&mut self, cur: ObjId, event: ObjId, ty: &str, phase: Phase) -> R<()> {
        let phase_num = match phase {
            Phase::Capture => 1.0,
            Phase::AtTarget => 2.0,
            Phase::Bubble => 3.0,
        };
        self.heap[event].props.set("currentTarget", Value::Obj(cur));
        self.heap[event].props.set("eventPhase", Value::Num(phase_num));
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .filter(|l| {
                l.target == cur
                    && l.event_type == ty
                    && match phase {
                        Phase::Capture => l.capture,
                        Phase::AtTarget => true,
                        Phase::Bubble => !l.capture,
                    }
            })
            .cloned()
            .collect();
        for l in listeners {
            if l.once {
                self.listeners.retain(|o| !(o.target == l.target && o.event_type == l.event_type && o.callback == l.callback && o.capture == l.capture));
            }
            let res = if self.is_callable(&l.callback) {
                self.call(&l.callback, Value::Obj(cur), vec![Value::Obj(event)])
            } else {
                match self.get_prop(&l.callback, "handleEvent") {
                    Ok(handler) => self.call(&handler, l.callback.clone(), vec![Value::Obj(event)]),
                    Err(e) => Err(e),
                }
            };
            self.report(res)?;
            if matches!(self.heap[event].kind, ObjKind::Event { immediate: true, .. }) {
                return Ok(());
            }
        }
        if phase == Phase::Capture {
            return Ok(());
        }

        let prop = format!("on{ty}");
        let handler = self.heap[cur].props.get(&prop).cloned().filter(|h| self.is_callable(h));
        let returned = match handler {
            Some(h) => {
                let res = self.call(&h, Value::Obj(cur), vec![Value::Obj(event)]);
                self.report(res)?
            }
            None => {
                let source = match self.heap[cur].kind {
                    ObjKind::Node(n) => self.dom.attr(n, &prop).map(str::to_string),
                    ObjKind::Window => self.dom.body().and_then(|b| self.dom.attr(b, &prop)).map(str::to_string),
                    _ => None,
                };
                match source {
                    Some(code) => {
                        let res = self.run_inline_handler(&code, cur, event);
                        self.report(res)?
                    }
                    None => None,
                }
            }
        };
        if returned == Some(Value::Bool(false)) {
            let cancelable = self.heap[event].props.get("cancelable").map(Value::truthy).unwrap_or(false);
            if let ObjKind::Event { prevented, .. } = &mut self.heap[event].kind {
                *prevented |= cancelable;
            }
        }
        Ok(())
    }

    /// `onclick="..."` attribute bodies run as functions of `event`.
    fn run_inline_handler(&mut self, code: &str, this: ObjId, event: ObjId) -> R<Value> {
        let body = parser::parse_program(code)?;
        let scope = self.new_scope(Some(self.global_scope), Some(Value::Obj(this)));
        self.declare(scope, "event", Value::Obj(event), true);
        self.hoist(scope, &body, true)?;
        let saved = self.scope;
        self.scope = scope;
        let res = self.exec_stmts(&body);
        self.scope = saved;
        match res? {
            Flow::Return(v) => Ok(v),
            _ => Ok(Value::Undefined),
        }
    }

    /// Listener failures are reported and swallowed, except for the step
    /// budget, which must unwind the whole run.
    fn report(&mut self, res: R<Value>) -> R<Option<Value>> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(ScriptError::StepLimit) => Err(ScriptError::StepLimit),
            Err(ScriptError::Suspended) => Ok(None),
            Err(err) => {
                warn!(target: "sandbox", error = %err, "event listener failed");
                self.log("error", format!("Uncaught {err}"));
                Ok(None)
            }
        }
    }

    fn click(&mut self, n: NodeId) -> R<()> {
        if self.dom.has_attr(n, "disabled") {
            return Ok(());
        }
        let tag = self.dom.tag(n).unwrap_or_default().to_string();
        let kind = if tag == "input" { self.input_type(n) } else { String::new() };
        let toggles = matches!(kind.as_str(), "checkbox" | "radio");
        let before: Vec<(NodeId, bool)> = match kind.as_str() {
            "radio" => self.radio_group(n).into_iter().map(|r| (r, self.is_checked(r))).collect(),
            "checkbox" => vec![(n, self.is_checked(n))],
            _ => Vec::new(),
        };
        match kind.as_str() {
            "checkbox" => {
                let was = self.is_checked(n);
                self.set_checked(n, !was);
            }
            "radio" => self.set_checked(n, true),
            _ => {}
        }

        let proceed = self.fire(n, "MouseEvent", "click", true, true)?;
        if !proceed {
            for (r, was) in before {
                self.form_state.entry(r).or_default().checked = Some(was);
            }
            return Ok(());
        }

        let changed = before.iter().any(|(r, was)| self.is_checked(*r) != *was);
        if toggles && changed {
            self.fire(n, "Event", "input", true, false)?;
            self.fire(n, "Event", "change", true, false)?;
        }
        let submits = match tag.as_str() {
            "button" => self.dom.attr(n, "type").map(|t| t.eq_ignore_ascii_case("submit")).unwrap_or(true),
            "input" => matches!(kind.as_str(), "submit" | "image"),
            _ => false,
        };
        let resets = (tag == "button" || tag == "input") && self.dom.attr(n, "type").map(|t| t.eq_ignore_ascii_case("reset")).unwrap_or(false);
        if submits {
            if let Some(form) = self.owning_form(n) {
                self.submit_form(form)?;
            }
        } else if resets {
            if let Some(form) = self.owning_form(n) {
                if self.fire(form, "Event", "reset", true, true)? {
                    self.reset_form(form);
                }
            }
        } else if tag == "label" {
            let control = match self.dom.attr(n, "for") {
                Some(id) => self.dom.get_element_by_id(id),
                None => self
                    .dom
                    .descendant_elements(n)
                    .into_iter()
                    .find(|c| matches!(self.dom.tag(*c), Some("input" | "select" | "textarea" | "button"))),
            };
            if let Some(c) = control.filter(|c| *c != n) {
                self.click(c)?;
            }
        }
        Ok(())
    }

    fn submit_form(&mut self, form: NodeId) -> R<()> {
        self.fire(form, "SubmitEvent", "submit", true, true).map(|_| ())
    }

    fn focus(&mut self, n: NodeId) -> R<()> {
        if self.active_element == Some(n) || !self.dom.is_element(n) {
            return Ok(());
        }
        if let Some(prev) = self.active_element.take() {
            self.fire(prev, "FocusEvent", "blur", false, false)?;
            self.fire(prev, "FocusEvent", "focusout", true, false)?;
        }
        self.active_element = Some(n);
        self.fire(n, "FocusEvent", "focus", false, false)?;
        self.fire(n, "FocusEvent", "focusin", true, false)?;
        Ok(())
    }
}

fn string_to_number_or_nan(s: &str) -> f64 {
    if s.trim().is_empty() {
        f64::NAN
    } else {
        string_to_number(s)
    }
}
