//! CSS selectors over the arena DOM.
//!
//! Parsing and matching are done by the `selectors` crate (the engine scraper
//! builds on); this module supplies the `SelectorImpl` with the form-state
//! pseudo-classes tests rely on and the `Element` view of an arena node.

use std::fmt;

use cssparser::ToCss;
use selectors::{
    attr::{AttrSelectorOperation, CaseSensitivity, NamespaceConstraint},
    matching::{self, MatchingContext},
    parser::{self, ParseRelative, SelectorParseErrorKind},
    Element, NthIndexCache, OpaqueElement,
};
use thiserror::Error;

use super::dom::{Dom, NodeId};

#[derive(Debug, Error, Clone, PartialEq)]
#[error("'{0}' is not a valid selector")]
pub struct SelectorError(pub String);

/// (ids, classes/attributes/pseudo-classes, types)
pub type Specificity = (u32, u32, u32);

const FORM_CONTROLS: &[&str] = &["input", "button", "select", "textarea", "option", "fieldset"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    selectors: parser::SelectorList<Tutor>,
}

impl SelectorList {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut parser_input = cssparser::ParserInput::new(input);
        let mut parser = cssparser::Parser::new(&mut parser_input);
        parser::SelectorList::parse(&TutorParser, &mut parser, ParseRelative::No)
            .map(|selectors| Self { selectors })
            .map_err(|_| SelectorError(input.to_string()))
    }

    pub fn matches(&self, dom: &Dom, node: NodeId) -> bool {
        self.matching_specificity(dom, node).is_some()
    }

    /// Highest specificity among the selectors in the list that match `node`.
    pub fn matching_specificity(&self, dom: &Dom, node: NodeId) -> Option<Specificity> {
        if !dom.is_element(node) {
            return None;
        }
        let element = DomElement { dom, id: node };
        let mut cache = NthIndexCache::default();
        let mut context = MatchingContext::new(
            matching::MatchingMode::Normal,
            None,
            &mut cache,
            matching::QuirksMode::NoQuirks,
            matching::NeedsSelectorFlags::No,
            matching::IgnoreNthChildForInvalidation::No,
        );
        self.selectors
            .0
            .iter()
            .filter(|s| matching::matches_selector(s, 0, None, &element, &mut context))
            .map(|s| unpack(s.specificity()))
            .max()
    }

    /// First matching descendant of `root`, in document order.
    pub fn query_first(&self, dom: &Dom, root: NodeId) -> Option<NodeId> {
        dom.descendant_elements(root).into_iter().find(|n| self.matches(dom, *n))
    }

    pub fn query_all(&self, dom: &Dom, root: NodeId) -> Vec<NodeId> {
        dom.descendant_elements(root).into_iter().filter(|n| self.matches(dom, *n)).collect()
    }
}

// selectors packs specificity as three 10-bit fields.
fn unpack(s: u32) -> Specificity {
    (s >> 20, (s >> 10) & 0x3ff, s & 0x3ff)
}

#[derive(Clone, Copy, Debug)]
struct TutorParser;

impl<'i> parser::Parser<'i> for TutorParser {
    type Impl = Tutor;
    type Error = SelectorParseErrorKind<'i>;

    fn parse_is_and_where(&self) -> bool {
        true
    }

    fn parse_non_ts_pseudo_class(
        &self,
        location: cssparser::SourceLocation,
        name: cssparser::CowRcStr<'i>,
    ) -> Result<PseudoClass, cssparser::ParseError<'i, Self::Error>> {
        let pc = match name.to_ascii_lowercase().as_str() {
            "checked" => PseudoClass::Checked,
            "disabled" => PseudoClass::Disabled,
            "enabled" => PseudoClass::Enabled,
            "hover" | "focus" | "focus-within" | "focus-visible" | "active" | "visited" | "link"
            | "any-link" | "target" => PseudoClass::Interactive(name.to_ascii_lowercase()),
            _ => {
                return Err(location
                    .new_custom_error(SelectorParseErrorKind::UnsupportedPseudoClassOrElement(name)))
            }
        };
        Ok(pc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tutor;

impl parser::SelectorImpl for Tutor {
    type ExtraMatchingData<'a> = ();
    type AttrValue = CssString;
    type Identifier = CssName;
    type LocalName = CssName;
    type NamespacePrefix = CssName;
    type NamespaceUrl = CssName;
    type BorrowedNamespaceUrl = CssName;
    type BorrowedLocalName = CssName;
    type NonTSPseudoClass = PseudoClass;
    type PseudoElement = NoPseudoElement;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssString(String);

impl From<&str> for CssString {
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl AsRef<str> for CssString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl ToCss for CssString {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        cssparser::serialize_string(&self.0, dest)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CssName(String);

impl From<&str> for CssName {
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl ToCss for CssName {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        dest.write_str(&self.0)
    }
}

/// Pseudo-classes that are not about tree structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PseudoClass {
    Checked,
    Disabled,
    Enabled,
    /// User-interaction state; a headless document never has any.
    Interactive(String),
}

impl parser::NonTSPseudoClass for PseudoClass {
    type Impl = Tutor;

    fn is_active_or_hover(&self) -> bool {
        matches!(self, Self::Interactive(n) if n == "active" || n == "hover")
    }

    fn is_user_action_state(&self) -> bool {
        matches!(self, Self::Interactive(_))
    }
}

impl ToCss for PseudoClass {
    fn to_css<W: fmt::Write>(&self, dest: &mut W) -> fmt::Result {
        match self {
            Self::Checked => dest.write_str(":checked"),
            Self::Disabled => dest.write_str(":disabled"),
            Self::Enabled => dest.write_str(":enabled"),
            Self::Interactive(name) => write!(dest, ":{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoPseudoElement {}

impl parser::PseudoElement for NoPseudoElement {
    type Impl = Tutor;
}

impl ToCss for NoPseudoElement {
    fn to_css<W: fmt::Write>(&self, _dest: &mut W) -> fmt::Result {
        match *self {}
    }
}

/// An element node of the arena, as seen by the matcher.
#[derive(Clone, Copy)]
struct DomElement<'a> {
    dom: &'a Dom,
    id: NodeId,
}

impl fmt::Debug for DomElement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> #{}", self.tag(), self.id)
    }
}

impl<'a> DomElement<'a> {
    fn wrap(&self, id: Option<NodeId>) -> Option<Self> {
        id.map(|id| Self { dom: self.dom, id })
    }

    fn tag(&self) -> &'a str {
        self.dom.tag(self.id).unwrap_or_default()
    }
}

impl<'a> Element for DomElement<'a> {
    type Impl = Tutor;

    fn opaque(&self) -> OpaqueElement {
        OpaqueElement::new(self.dom.node(self.id))
    }

    fn parent_element(&self) -> Option<Self> {
        self.wrap(self.dom.parent_element(self.id))
    }

    fn parent_node_is_shadow_root(&self) -> bool {
        false
    }

    fn containing_shadow_host(&self) -> Option<Self> {
        None
    }

    fn is_pseudo_element(&self) -> bool {
        false
    }

    fn prev_sibling_element(&self) -> Option<Self> {
        self.wrap(self.dom.previous_element_sibling(self.id))
    }

    fn next_sibling_element(&self) -> Option<Self> {
        self.wrap(self.dom.next_element_sibling(self.id))
    }

    fn first_element_child(&self) -> Option<Self> {
        self.wrap(self.dom.element_children(self.id).first().copied())
    }

    fn is_html_element_in_html_document(&self) -> bool {
        true
    }

    fn has_local_name(&self, name: &CssName) -> bool {
        self.tag() == name.0
    }

    fn has_namespace(&self, ns: &CssName) -> bool {
        ns.0.is_empty() || ns.0 == "http://www.w3.org/1999/xhtml"
    }

    fn is_same_type(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }

    fn attr_matches(
        &self,
        ns: &NamespaceConstraint<&CssName>,
        local_name: &CssName,
        operation: &AttrSelectorOperation<&CssString>,
    ) -> bool {
        if matches!(ns, NamespaceConstraint::Specific(url) if !url.0.is_empty()) {
            return false;
        }
        self.dom
            .attrs(self.id)
            .iter()
            .any(|(name, value)| *name == local_name.0 && operation.eval_str(value))
    }

    fn match_non_ts_pseudo_class(&self, pc: &PseudoClass, _context: &mut MatchingContext<'_, Tutor>) -> bool {
        let dom = self.dom;
        match pc {
            PseudoClass::Checked => dom.has_attr(self.id, "checked") || dom.has_attr(self.id, "selected"),
            PseudoClass::Disabled => dom.has_attr(self.id, "disabled"),
            PseudoClass::Enabled => FORM_CONTROLS.contains(&self.tag()) && !dom.has_attr(self.id, "disabled"),
            PseudoClass::Interactive(_) => false,
        }
    }

    fn match_pseudo_element(&self, pe: &NoPseudoElement, _context: &mut MatchingContext<'_, Tutor>) -> bool {
        match *pe {}
    }

    fn apply_selector_flags(&self, _flags: matching::ElementSelectorFlags) {}

    fn is_link(&self) -> bool {
        matches!(self.tag(), "a" | "area" | "link") && self.dom.has_attr(self.id, "href")
    }

    fn is_html_slot_element(&self) -> bool {
        false
    }

    fn has_id(&self, id: &CssName, case_sensitivity: CaseSensitivity) -> bool {
        self.dom
            .attr(self.id, "id")
            .is_some_and(|v| case_sensitivity.eq(id.0.as_bytes(), v.as_bytes()))
    }

    fn has_class(&self, name: &CssName, case_sensitivity: CaseSensitivity) -> bool {
        self.dom
            .class_list(self.id)
            .iter()
            .any(|c| case_sensitivity.eq(name.0.as_bytes(), c.as_bytes()))
    }

    fn imported_part(&self, _name: &CssName) -> Option<CssName> {
        None
    }

    fn is_part(&self, _name: &CssName) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        !self.dom.children(self.id).iter().any(|&c| {
            self.dom.is_element(c) || self.dom.text(c).is_some_and(|t| !t.is_empty())
        })
    }

    fn is_root(&self) -> bool {
        self.dom.document_element() == Some(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dom() -> Dom {
        Dom::parse(
            r#"<body>
              <ul id="list" class="todo big">
                <li class="item">a</li>
                <li class="item done" data-x="1">b</li>
                <li class="item">c</li>
              </ul>
              <p lang="en-US">x</p><span></span>
              <form><input id="on" checked><input id="off" disabled><textarea></textarea></form>
            </body>"#,
        )
    }

    fn count(dom: &Dom, sel: &str) -> usize {
        SelectorList::parse(sel).unwrap().query_all(dom, crate::sandbox::dom::DOCUMENT).len()
    }

    #[test]
    fn basic_selectors() {
        let d = dom();
        assert_eq!(count(&d, "li"), 3);
        assert_eq!(count(&d, "#list"), 1);
        assert_eq!(count(&d, ".todo.big"), 1);
        assert_eq!(count(&d, "ul > li.item"), 3);
        assert_eq!(count(&d, "body li"), 3);
        assert_eq!(count(&d, "li, p"), 4);
        assert_eq!(count(&d, "UL > LI"), 3);
        assert_eq!(count(&d, ":root"), 1);
        assert_eq!(count(&d, "html:root > body"), 1);
    }

    #[test]
    fn attribute_operators() {
        let d = dom();
        assert_eq!(count(&d, "[data-x]"), 1);
        assert_eq!(count(&d, "[data-x='1']"), 1);
        assert_eq!(count(&d, "[class~=done]"), 1);
        assert_eq!(count(&d, "[lang|=en]"), 1);
        assert_eq!(count(&d, "[class^=item]"), 3);
        assert_eq!(count(&d, "[lang='EN-us' i]"), 1);
    }

    #[test]
    fn structural_pseudos_and_siblings() {
        let d = dom();
        assert_eq!(count(&d, "li:first-child"), 1);
        assert_eq!(count(&d, "li:nth-child(odd)"), 2);
        assert_eq!(count(&d, "li:not(.done)"), 2);
        assert_eq!(count(&d, "li:is(.done, :last-child)"), 2);
        assert_eq!(count(&d, "li.done + li"), 1);
        assert_eq!(count(&d, "li.done ~ li"), 1);
        assert_eq!(count(&d, "span:empty"), 1);
        assert_eq!(count(&d, "a:hover"), 0);
    }

    #[test]
    fn form_state_pseudos() {
        let d = dom();
        assert_eq!(count(&d, "input:checked"), 1);
        assert_eq!(count(&d, ":disabled"), 1);
        assert_eq!(count(&d, ":enabled"), 2);
        assert_eq!(count(&d, "li:enabled"), 0);
    }

    #[test]
    fn invalid_selectors_are_rejected() {
        for bad in ["", "div[", "..a", "li:nope", "a >", "1abc", "p::before"] {
            let err = SelectorList::parse(bad).unwrap_err();
            assert_eq!(err.to_string(), format!("'{bad}' is not a valid selector"));
        }
    }

    #[test]
    fn specificity_orders_id_class_type() {
        let d = dom();
        let li = SelectorList::parse("li.done").unwrap();
        let node = li.query_first(&d, crate::sandbox::dom::DOCUMENT).unwrap();
        assert_eq!(li.matching_specificity(&d, node), Some((0, 1, 1)));
        let id = SelectorList::parse("#list li").unwrap();
        assert_eq!(id.matching_specificity(&d, node), Some((1, 0, 1)));
        let either = SelectorList::parse("li, #list > .done").unwrap();
        assert_eq!(either.matching_specificity(&d, node), Some((1, 1, 0)));
    }
}
