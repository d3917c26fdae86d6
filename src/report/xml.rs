//! A small owned XML tree for report rewriting.
//!
//! Reports are parsed with quick-xml into [`XmlDocument`]s, edited in place,
//! and written back out. Summary counters are read and written through the
//! typed [`Counter`] accessors so every numeric attribute is parsed,
//! combined and formatted the same way.

use quick_xml::Writer;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;

use super::{ReportError, ReportResult};

/// A node inside an element.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
    Comment(String),
}

/// An element with ordered attributes and children.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

/// Numeric summary attributes found on report elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Tests,
    Failures,
    Errors,
    Skipped,
    Time,
    Total,
    NotRun,
    Inconclusive,
    Ignored,
    Invalid,
    TestCaseCount,
    Passed,
    Failed,
    Asserts,
}

impl Counter {
    pub fn attr_name(&self) -> &'static str {
        match self {
            Counter::Tests => "tests",
            Counter::Failures => "failures",
            Counter::Errors => "errors",
            Counter::Skipped => "skipped",
            Counter::Time => "time",
            Counter::Total => "total",
            Counter::NotRun => "not-run",
            Counter::Inconclusive => "inconclusive",
            Counter::Ignored => "ignored",
            Counter::Invalid => "invalid",
            Counter::TestCaseCount => "testcasecount",
            Counter::Passed => "passed",
            Counter::Failed => "failed",
            Counter::Asserts => "asserts",
        }
    }
}

/// Rounds to three decimals and formats without trailing zeros.
fn format_number(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 {
        return "0".to_string();
    }
    rounded.to_string()
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Every element named `name` in this subtree, depth first, including
    /// this element itself.
    pub fn collect_all<'a>(&'a self, name: &str) -> Vec<&'a XmlElement> {
        let mut result = Vec::new();
        self.collect_all_into(name, &mut result);
        result
    }

    fn collect_all_into<'a>(&'a self, name: &str, result: &mut Vec<&'a XmlElement>) {
        if self.name == name {
            result.push(self);
        }
        for child in self.elements() {
            child.collect_all_into(name, result);
        }
    }

    /// The first element named `name` on each path from this element down.
    /// Matches are not searched for nested matches.
    pub fn collect_children<'a>(&'a self, name: &str) -> Vec<&'a XmlElement> {
        if self.name == name {
            return vec![self];
        }
        self.elements()
            .flat_map(|child| child.collect_children(name))
            .collect()
    }

    /// Removes and returns what [`collect_children`](Self::collect_children)
    /// would find below this element, in document order.
    pub fn drain_children(&mut self, name: &str) -> Vec<XmlElement> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.children.len());

        for node in std::mem::take(&mut self.children) {
            match node {
                XmlNode::Element(element) if element.name == name => drained.push(element),
                XmlNode::Element(mut element) => {
                    drained.extend(element.drain_children(name));
                    kept.push(XmlNode::Element(element));
                }
                other => kept.push(other),
            }
        }

        self.children = kept;
        drained
    }

    /// Whether any element named `name` exists in this subtree (self included).
    pub fn contains(&self, name: &str) -> bool {
        self.name == name || self.elements().any(|child| child.contains(name))
    }

    /// Parsed value of a counter attribute. Missing or unparsable is `None`.
    pub fn counter(&self, counter: Counter) -> Option<f64> {
        self.attr(counter.attr_name())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse::<f64>().ok())
    }

    /// Writes a counter, rounded to three decimals.
    pub fn set_counter(&mut self, counter: Counter, value: f64) {
        self.set_attr(counter.attr_name(), format_number(value));
    }

    /// Adds `other`'s counter to this element's. A no-op when either side is
    /// missing or unparsable.
    pub fn add_counter_from(&mut self, other: &XmlElement, counter: Counter) {
        if let (Some(mine), Some(theirs)) = (self.counter(counter), other.counter(counter)) {
            self.set_counter(counter, mine + theirs);
        }
    }

    /// Subtracts from a counter that is present; missing counters stay missing.
    pub fn decrement(&mut self, counter: Counter, by: f64) {
        if let Some(value) = self.counter(counter) {
            self.set_counter(counter, value - by);
        }
    }

    /// Removes every element named `name` matching `predicate`, at any
    /// depth, and returns them. `on_removed` is called bottom-up for each
    /// ancestor that lost elements, with everything removed beneath it.
    pub fn remove_elements<P, F>(&mut self, name: &str, predicate: &P, on_removed: &mut F) -> Vec<XmlElement>
    where
        P: Fn(&XmlElement) -> bool,
        F: FnMut(&mut XmlElement, &[XmlElement]),
    {
        let mut removed = Vec::new();
        for child in self.elements_mut() {
            removed.extend(child.remove_elements(name, predicate, on_removed));
        }

        let mut kept = Vec::with_capacity(self.children.len());
        for node in std::mem::take(&mut self.children) {
            match node {
                XmlNode::Element(element) if element.name == name && predicate(&element) => {
                    removed.push(element)
                }
                other => kept.push(other),
            }
        }
        self.children = kept;

        if !removed.is_empty() {
            on_removed(self, &removed);
        }
        removed
    }

    /// Removes child elements named `name` whose subtree has no element
    /// named `required`, deepest first.
    pub fn prune_without(&mut self, name: &str, required: &str) {
        for child in self.elements_mut() {
            child.prune_without(name, required);
        }
        self.children.retain(|node| match node {
            XmlNode::Element(element) if element.name == name => element.contains(required),
            _ => true,
        });
    }

    fn write<W: std::io::Write>(&self, writer: &mut Writer<W>) -> ReportResult<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(xml_error)?;
            return Ok(());
        }

        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        for child in &self.children {
            match child {
                XmlNode::Element(element) => element.write(writer)?,
                XmlNode::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(xml_error)?,
                XmlNode::CData(data) => writer
                    .write_event(Event::CData(BytesCData::new(data.as_str())))
                    .map_err(xml_error)?,
                XmlNode::Comment(comment) => writer
                    .write_event(Event::Comment(BytesText::from_escaped(comment.as_str())))
                    .map_err(xml_error)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_error)?;
        Ok(())
    }
}

/// A parsed report file or merge accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub root: XmlElement,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    /// Parses a document. Declarations, processing instructions and
    /// whitespace-only text are dropped; other text is kept verbatim.
    pub fn parse(text: &str) -> ReportResult<Self> {
        let mut reader = Reader::from_str(text);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ReportError::Xml("unexpected closing tag".to_string()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = text.unescape().map_err(xml_error)?;
                        if !text.trim().is_empty() {
                            parent.children.push(XmlNode::Text(text.into_owned()));
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                        parent.children.push(XmlNode::CData(data));
                    }
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        let comment = String::from_utf8_lossy(&comment).into_owned();
                        parent.children.push(XmlNode::Comment(comment));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(ReportError::Xml(format!("unclosed element <{}>", stack[0].name)));
        }
        root.map(Self::new)
            .ok_or_else(|| ReportError::Xml("document has no root element".to_string()))
    }

    /// Serializes with an XML declaration and two-space indentation.
    pub fn to_xml_string(&self) -> ReportResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        self.root.write(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(xml_error)
    }
}

fn element_from_start(start: &BytesStart<'_>) -> ReportResult<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_error)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> ReportResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(ReportError::Xml("multiple root elements".to_string())),
    }
    Ok(())
}

fn xml_error(err: impl std::fmt::Display) -> ReportError {
    ReportError::Xml(err.to_string())
}
