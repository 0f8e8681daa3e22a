//! Index-based virtual DOM.
//!
//! Nodes live in one arena and refer to each other by `NodeId`, so the whole
//! document is a plain owned value: it can be handed to the evaluation thread,
//! mutated by scripts, and dropped in one go when the run is over.

use scraper::Html;
use thiserror::Error;

pub type NodeId = usize;

/// The document node is always the first arena slot.
pub const DOCUMENT: NodeId = 0;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomError {
    #[error("Failed to execute '{0}' on 'Node': The new child element contains the parent.")]
    Hierarchy(&'static str),
    #[error("Failed to execute '{0}' on 'Node': The node to be removed is not a child of this node.")]
    NotAChild(&'static str),
}

#[derive(Clone, Debug)]
pub struct ElementData {
    /// Lowercase local name.
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Document,
    Fragment,
    Element(ElementData),
    Text(String),
    Comment(String),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct Dom {
    nodes: Vec<Node>,
}

impl Dom {
    /// Parse a full HTML document (HTML5 error-tolerant parsing).
    pub fn parse(html: &str) -> Self {
        let mut dom = Dom {
            nodes: vec![Node { kind: NodeKind::Document, parent: None, children: Vec::new() }],
        };
        let parsed = Html::parse_document(html);
        dom.import(&parsed, DOCUMENT, false);
        dom
    }

    /// Copy a scraper tree into the arena under `parent`. For fragments the
    /// parser wraps content in a synthetic `<html>` element; its children are
    /// what we want.
    fn import(&mut self, parsed: &Html, parent: NodeId, fragment: bool) {
        let root = parsed.tree.root();
        let start = if fragment {
            root.children().find(|c| matches!(c.value(), scraper::Node::Element(e) if e.name() == "html"))
        } else {
            Some(root)
        };
        let Some(start) = start else { return };

        let mut stack = Vec::new();
        let kids: Vec<_> = start.children().collect();
        for kid in kids.into_iter().rev() {
            stack.push((kid, parent));
        }

        while let Some((src, dst_parent)) = stack.pop() {
            let kind = match src.value() {
                scraper::Node::Element(e) => NodeKind::Element(ElementData {
                    tag: e.name().to_ascii_lowercase(),
                    attrs: e.attrs().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                }),
                scraper::Node::Text(t) => NodeKind::Text(t.to_string()),
                scraper::Node::Comment(c) => NodeKind::Comment(c.to_string()),
                _ => continue,
            };
            let id = self.alloc(kind);
            self.nodes[id].parent = Some(dst_parent);
            self.nodes[dst_parent].children.push(id);

            let kids: Vec<_> = src.children().collect();
            for kid in kids.into_iter().rev() {
                stack.push((kid, id));
            }
        }
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node { kind, parent: None, children: Vec::new() });
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // --- Node classification ---

    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.nodes[id].kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.nodes[id].kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|e| e.tag.as_str())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn parent_element(&self, id: NodeId) -> Option<NodeId> {
        self.parent(id).filter(|p| self.is_element(*p))
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id].children.iter().copied().filter(|c| self.is_element(*c)).collect()
    }

    /// Siblings including `id` itself, in document order.
    fn siblings(&self, id: NodeId) -> &[NodeId] {
        match self.parent(id) {
            Some(p) => &self.nodes[p].children,
            None => &[],
        }
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let sibs = self.siblings(id);
        let pos = sibs.iter().position(|s| *s == id)?;
        sibs.get(pos + 1).copied()
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let sibs = self.siblings(id);
        let pos = sibs.iter().position(|s| *s == id)?;
        if pos == 0 { None } else { Some(sibs[pos - 1]) }
    }

    pub fn next_element_sibling(&self, id: NodeId) -> Option<NodeId> {
        let sibs = self.siblings(id);
        let pos = sibs.iter().position(|s| *s == id)?;
        sibs[pos + 1..].iter().copied().find(|s| self.is_element(*s))
    }

    pub fn previous_element_sibling(&self, id: NodeId) -> Option<NodeId> {
        let sibs = self.siblings(id);
        let pos = sibs.iter().position(|s| *s == id)?;
        sibs[..pos].iter().rev().copied().find(|s| self.is_element(*s))
    }

    /// Element siblings (including `id`) used by the structural pseudo-classes.
    pub fn element_siblings(&self, id: NodeId) -> Vec<NodeId> {
        self.siblings(id).iter().copied().filter(|s| self.is_element(*s)).collect()
    }

    /// Pre-order descendants of `id`, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev().copied());
        }
        out
    }

    pub fn descendant_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.descendants(id).into_iter().filter(|n| self.is_element(*n)).collect()
    }

    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.parent(node);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    pub fn contains(&self, outer: NodeId, inner: NodeId) -> bool {
        outer == inner || self.is_ancestor(outer, inner)
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.contains(DOCUMENT, id)
    }

    // --- Well-known elements ---

    pub fn document_element(&self) -> Option<NodeId> {
        self.nodes[DOCUMENT].children.iter().copied().find(|c| self.is_element(*c))
    }

    fn child_by_tag(&self, parent: NodeId, tag: &str) -> Option<NodeId> {
        self.nodes[parent].children.iter().copied().find(|c| self.tag(*c) == Some(tag))
    }

    pub fn head(&self) -> Option<NodeId> {
        self.document_element().and_then(|html| self.child_by_tag(html, "head"))
    }

    pub fn body(&self) -> Option<NodeId> {
        self.document_element().and_then(|html| self.child_by_tag(html, "body"))
    }

    pub fn title(&self) -> String {
        self.descendant_elements(DOCUMENT)
            .into_iter()
            .find(|n| self.tag(*n) == Some("title"))
            .map(|t| collapse_whitespace(&self.text_content(t)))
            .unwrap_or_default()
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.descendant_elements(DOCUMENT)
            .into_iter()
            .find(|n| self.attr(*n, "id") == Some(id))
    }

    pub fn elements_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        let tag = tag.to_ascii_lowercase();
        self.descendant_elements(root)
            .into_iter()
            .filter(|n| tag == "*" || self.tag(*n) == Some(tag.as_str()))
            .collect()
    }

    pub fn elements_by_class(&self, root: NodeId, names: &str) -> Vec<NodeId> {
        let wanted: Vec<&str> = names.split_whitespace().collect();
        if wanted.is_empty() {
            return Vec::new();
        }
        self.descendant_elements(root)
            .into_iter()
            .filter(|n| {
                let classes = self.class_list(*n);
                wanted.iter().all(|w| classes.iter().any(|c| c == w))
            })
            .collect()
    }

    // --- Attributes ---

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.element(id)?
            .attrs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(el) = self.element_mut(id) {
            match el.attrs.iter_mut().find(|(k, _)| *k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => el.attrs.push((name, value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(el) = self.element_mut(id) {
            el.attrs.retain(|(k, _)| *k != name);
        }
    }

    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        match self.element(id) {
            Some(e) => &e.attrs,
            None => &[],
        }
    }

    pub fn class_list(&self, id: NodeId) -> Vec<String> {
        self.attr(id, "class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn set_class_list(&mut self, id: NodeId, classes: &[String]) {
        self.set_attr(id, "class", &classes.join(" "));
    }

    // --- Text ---

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Text(t) | NodeKind::Comment(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn set_text(&mut self, id: NodeId, value: &str) {
        if let NodeKind::Text(t) | NodeKind::Comment(t) = &mut self.nodes[id].kind {
            *t = value.to_string();
        }
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        if let NodeKind::Text(t) | NodeKind::Comment(t) = &self.nodes[id].kind {
            return t.clone();
        }
        let mut out = String::new();
        for n in self.descendants(id) {
            if let NodeKind::Text(t) = &self.nodes[n].kind {
                out.push_str(t);
            }
        }
        out
    }

    pub fn set_text_content(&mut self, id: NodeId, value: &str) {
        if let NodeKind::Text(_) | NodeKind::Comment(_) = self.nodes[id].kind {
            self.set_text(id, value);
            return;
        }
        self.clear_children(id);
        if !value.is_empty() {
            let t = self.create_text(value);
            self.nodes[t].parent = Some(id);
            self.nodes[id].children.push(t);
        }
    }

    // --- Construction & mutation ---

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(NodeKind::Element(ElementData { tag: tag.to_ascii_lowercase(), attrs: Vec::new() }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeKind::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.alloc(NodeKind::Comment(text.to_string()))
    }

    pub fn create_fragment(&mut self) -> NodeId {
        self.alloc(NodeKind::Fragment)
    }

    pub fn is_fragment(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Fragment)
    }

    /// Remove `id` from its parent, leaving it detached.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(p) = self.nodes[id].parent.take() {
            self.nodes[p].children.retain(|c| *c != id);
        }
    }

    fn clear_children(&mut self, id: NodeId) {
        let kids = std::mem::take(&mut self.nodes[id].children);
        for k in kids {
            self.nodes[k].parent = None;
        }
    }

    /// Insert `child` into `parent` before `reference` (append when `None`).
    /// Fragments are flattened: their children move, the fragment empties.
    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
        op: &'static str,
    ) -> Result<(), DomError> {
        if self.contains(child, parent) {
            return Err(DomError::Hierarchy(op));
        }
        if let Some(r) = reference {
            if self.parent(r) != Some(parent) {
                return Err(DomError::NotAChild(op));
            }
        }

        let moving: Vec<NodeId> = if self.is_fragment(child) {
            let kids = std::mem::take(&mut self.nodes[child].children);
            for k in &kids {
                self.nodes[*k].parent = None;
            }
            kids
        } else {
            self.detach(child);
            vec![child]
        };

        let mut at = match reference {
            Some(r) => self.nodes[parent].children.iter().position(|c| *c == r).unwrap_or(0),
            None => self.nodes[parent].children.len(),
        };
        for m in moving {
            self.nodes[m].parent = Some(parent);
            self.nodes[parent].children.insert(at, m);
            at += 1;
        }
        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.insert_before(parent, child, None, "appendChild")
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        if self.parent(child) != Some(parent) {
            return Err(DomError::NotAChild("removeChild"));
        }
        self.detach(child);
        Ok(())
    }

    pub fn replace_children(&mut self, parent: NodeId, new_children: &[NodeId]) -> Result<(), DomError> {
        for c in new_children {
            if self.contains(*c, parent) {
                return Err(DomError::Hierarchy("replaceChildren"));
            }
        }
        self.clear_children(parent);
        for c in new_children {
            self.append_child(parent, *c)?;
        }
        Ok(())
    }

    /// Deep or shallow copy of `id`, detached.
    pub fn clone_node(&mut self, id: NodeId, deep: bool) -> NodeId {
        let kind = self.nodes[id].kind.clone();
        let copy = self.alloc(kind);
        if deep {
            let kids = self.nodes[id].children.clone();
            for k in kids {
                let kc = self.clone_node(k, true);
                self.nodes[kc].parent = Some(copy);
                self.nodes[copy].children.push(kc);
            }
        }
        copy
    }

    // --- Serialization ---

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        let raw = self.tag(id).map(|t| RAW_TEXT_ELEMENTS.contains(&t)).unwrap_or(false);
        for c in &self.nodes[id].children {
            self.serialize(*c, raw, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.serialize(id, false, &mut out);
        out
    }

    fn serialize(&self, id: NodeId, raw_text: bool, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Text(t) => {
                if raw_text {
                    out.push_str(t);
                } else {
                    out.push_str(&escape_text(t));
                }
            }
            NodeKind::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeKind::Element(e) => {
                out.push('<');
                out.push_str(&e.tag);
                for (k, v) in &e.attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(v));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&e.tag.as_str()) {
                    return;
                }
                let raw = RAW_TEXT_ELEMENTS.contains(&e.tag.as_str());
                for c in &self.nodes[id].children {
                    self.serialize(*c, raw, out);
                }
                out.push_str("</");
                out.push_str(&e.tag);
                out.push('>');
            }
            NodeKind::Document | NodeKind::Fragment => {
                for c in &self.nodes[id].children {
                    self.serialize(*c, false, out);
                }
            }
        }
    }

    /// Replace the children of `id` with the parsed fragment.
    pub fn set_inner_html(&mut self, id: NodeId, html: &str) {
        self.clear_children(id);
        let parsed = Html::parse_fragment(html);
        self.import(&parsed, id, true);
    }

    /// Parse `html` into a detached fragment node.
    pub fn parse_fragment(&mut self, html: &str) -> NodeId {
        let frag = self.create_fragment();
        let parsed = Html::parse_fragment(html);
        self.import(&parsed, frag, true);
        frag
    }

    /// Script element sources in document order.
    pub fn inline_scripts(&self) -> Vec<(NodeId, String)> {
        self.descendant_elements(DOCUMENT)
            .into_iter()
            .filter(|n| self.tag(*n) == Some("script"))
            .map(|n| (n, self.text_content(n)))
            .collect()
    }

    /// Stylesheet texts from every `<style>` element, in document order.
    pub fn style_sheets(&self) -> Vec<String> {
        self.descendant_elements(DOCUMENT)
            .into_iter()
            .filter(|n| self.tag(*n) == Some("style") && self.is_connected(*n))
            .map(|n| self.text_content(n))
            .collect()
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('\u{a0}', "&nbsp;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;").replace('\u{a0}', "&nbsp;")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_builds_html_head_body() {
        let dom = Dom::parse("<h1>Hi</h1>");
        let body = dom.body().unwrap();
        assert!(dom.head().is_some());
        let kids = dom.element_children(body);
        assert_eq!(kids.len(), 1);
        assert_eq!(dom.tag(kids[0]), Some("h1"));
        assert_eq!(dom.text_content(kids[0]), "Hi");
    }

    #[test]
    fn set_inner_html_replaces_children() {
        let mut dom = Dom::parse("<div id='a'><span>old</span></div>");
        let a = dom.get_element_by_id("a").unwrap();
        dom.set_inner_html(a, "<p>one</p><p>two</p>");
        assert_eq!(dom.element_children(a).len(), 2);
        assert_eq!(dom.inner_html(a), "<p>one</p><p>two</p>");
    }

    #[test]
    fn append_child_moves_node_and_rejects_cycles() {
        let mut dom = Dom::parse("<div id='a'></div><div id='b'></div>");
        let a = dom.get_element_by_id("a").unwrap();
        let b = dom.get_element_by_id("b").unwrap();
        dom.append_child(a, b).unwrap();
        assert_eq!(dom.parent(b), Some(a));
        assert_eq!(dom.append_child(b, a), Err(DomError::Hierarchy("appendChild")));
    }

    #[test]
    fn fragments_flatten_on_insert() {
        let mut dom = Dom::parse("<ul id='l'></ul>");
        let l = dom.get_element_by_id("l").unwrap();
        let frag = dom.parse_fragment("<li>a</li><li>b</li>");
        dom.append_child(l, frag).unwrap();
        assert_eq!(dom.element_children(l).len(), 2);
        assert!(dom.children(frag).is_empty());
    }

    #[test]
    fn title_and_text_content() {
        let dom = Dom::parse("<html><head><title> My   Page </title></head><body>x</body></html>");
        assert_eq!(dom.title(), "My Page");
        assert_eq!(dom.text_content(dom.body().unwrap()), "x");
    }

    #[test]
    fn void_elements_serialize_without_close_tag() {
        let dom = Dom::parse("<body><img src=\"a.png\"><br></body>");
        let body = dom.body().unwrap();
        assert_eq!(dom.inner_html(body), "<img src=\"a.png\"><br>");
    }
}
