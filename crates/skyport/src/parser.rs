//! Decode raw provider bodies into plain `serde_json::Value` trees.
//!
//! XML is converted with a fixed, lossless shape: an element that has
//! neither attributes nor children becomes its text; anything else
//! becomes an object with attributes under `"$"`, text under `"_"` and
//! every child tag mapped to an array of its occurrences, in document
//! order. Repeated siblings are never collapsed.

use std::fmt;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::{Map, Value};

use crate::{Error, Result};

const SNIPPET_LEN: usize = 200;

/// Declared encoding of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Xml,
}

impl ContentKind {
    /// Guess from a `Content-Type` header; anything mentioning xml is XML.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("xml") {
            Self::Xml
        } else {
            Self::Json
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Xml => "xml",
        })
    }
}

/// Decode `body` as `kind`.
pub fn parse(body: &[u8], kind: ContentKind) -> Result<Value> {
    let decoded = match kind {
        ContentKind::Json => serde_json::from_slice(body).map_err(|e| e.to_string()),
        ContentKind::Xml => parse_xml(body),
    };

    decoded.map_err(|message| Error::Parse {
        kind,
        message,
        snippet: snippet(body),
    })
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(SNIPPET_LEN)
        .collect()
}

struct Node {
    name: String,
    attrs: Map<String, Value>,
    children: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> std::result::Result<Self, String> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();

        let mut attrs = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attrs.insert(key, Value::String(value.into_owned()));
        }

        Ok(Self {
            name,
            attrs,
            children: Map::new(),
            text: String::new(),
        })
    }

    fn push_child(&mut self, name: String, value: Value) {
        let slot = self
            .children
            .entry(name)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = slot {
            items.push(value);
        }
    }

    fn into_value(self) -> Value {
        let text = self.text.trim();
        if self.attrs.is_empty() && self.children.is_empty() {
            return Value::String(text.to_string());
        }

        let mut obj = self.children;
        if !self.attrs.is_empty() {
            obj.insert("$".into(), Value::Object(self.attrs));
        }
        if !text.is_empty() {
            obj.insert("_".into(), Value::String(text.to_string()));
        }
        Value::Object(obj)
    }
}

fn close(
    stack: &mut [Node],
    root: &mut Option<(String, Value)>,
    node: Node,
) -> std::result::Result<(), String> {
    let name = node.name.clone();
    let value = node.into_value();

    match stack.last_mut() {
        Some(parent) => parent.push_child(name, value),
        None if root.is_none() => *root = Some((name, value)),
        None => return Err(format!("second root element <{name}>")),
    }
    Ok(())
}

fn parse_xml(body: &[u8]) -> std::result::Result<Value, String> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Node> = Vec::new();
    let mut root = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("at byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Start(start) => stack.push(Node::open(&start)?),
            Event::Empty(start) => {
                let node = Node::open(&start)?;
                close(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or("unbalanced closing tag")?;
                close(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text.unescape().map_err(|e| e.to_string())?);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(format!("document ended inside <{}>", open.name));
    }

    let (name, value) = root.ok_or("document has no root element")?;
    let mut doc = Map::new();
    doc.insert(name, value);
    Ok(Value::Object(doc))
}
