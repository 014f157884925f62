use std::str::FromStr;

use anyhow::anyhow;
use roxmltree::{Document, Node};


/// A parsed XML body as it travels in discovery and control messages. Lookups address elements
///  by a slash separated path of tag names, relative to the document's root element
///  (`"D2C_C_R/did"` inside `<P2P>`, `"Encryption/nonce"` inside `<body>`).
pub struct XmlBody<'input> {
    doc: Document<'input>,
}

impl<'input> XmlBody<'input> {
    pub fn parse(raw: &'input str) -> anyhow::Result<XmlBody<'input>> {
        // control payloads are sometimes NUL padded
        let raw = raw.trim_end_matches('\0');
        let doc = Document::parse(raw)
            .map_err(|e| anyhow!("malformed XML: {}", e))?;
        Ok(XmlBody { doc })
    }

    pub fn parse_bytes(raw: &'input [u8]) -> anyhow::Result<XmlBody<'input>> {
        Self::parse(std::str::from_utf8(raw)?)
    }

    pub fn root_name(&self) -> &str {
        self.doc.root_element().tag_name().name()
    }

    pub fn has(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// trimmed text content of the element at `path`, `None` if the element does not exist
    pub fn text(&self, path: &str) -> Option<&str> {
        self.find(path)
            .map(|n| n.text().unwrap_or("").trim())
    }

    /// `None` if the element is missing or its text does not parse
    pub fn parse_at<T: FromStr>(&self, path: &str) -> Option<T> {
        self.text(path)?.parse().ok()
    }

    fn find(&self, path: &str) -> Option<Node<'_, 'input>> {
        let mut node = self.doc.root_element();
        for segment in path.split('/') {
            node = node.children()
                .find(|n| n.is_element() && n.has_tag_name(segment))?;
        }
        Some(node)
    }
}

/// Sniffs the `binaryData` marker a device puts into control XML to announce that subsequent
///  messages with the same id carry binary records. Absence of the marker (or of a parseable
///  document) is the normal case and yields `None`.
pub fn binary_data_flag(text: &[u8]) -> Option<bool> {
    let xml = XmlBody::parse_bytes(text).ok()?;
    xml.text("binaryData").map(|t| t == "1")
}
