//! Minimal SOAP envelope construction and response scraping.
//!
//! The management API surface this crate touches is narrow enough that a
//! full typed WSDL binding would cost more than it buys. Instead we build
//! envelopes from format strings and pull the handful of fields we need out
//! of the response with `quick_xml`'s pull parser, in the spirit of
//! spec.md §9 ("dynamic attribute access ... becomes explicit getter calls
//! with null-guards").

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Escape a value for embedding inside an XML element.
pub fn esc(value: &str) -> String {
    escape(value).into_owned()
}

/// Wrap a SOAP body fragment in the standard envelope used by the
/// hypervisor's `/sdk` endpoint.
pub fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <soapenv:Body>{body}</soapenv:Body>
</soapenv:Envelope>"#
    )
}

/// Return the text content of the first element named `tag`, scanning
/// depth-first. Returns `None` if the tag is absent or empty — the
/// null-guard spec.md asks for in place of dynamic attribute access.
pub fn first_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut capture = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if local_name_eq(e.name().as_ref(), tag) => capture = true,
            Ok(Event::Text(t)) if capture => {
                let text = t.unescape().ok()?.into_owned();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(Event::End(e)) if local_name_eq(e.name().as_ref(), tag) => {
                if capture {
                    capture = false;
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Collect the text content of every element named `tag`, in document order.
pub fn all_text(xml: &str, tag: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut capture = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if local_name_eq(e.name().as_ref(), tag) => capture = true,
            Ok(Event::Text(t)) if capture => {
                if let Ok(text) = t.unescape() {
                    out.push(text.into_owned());
                }
            }
            Ok(Event::End(e)) if local_name_eq(e.name().as_ref(), tag) => capture = false,
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

/// Split a response into the repeated top-level blocks named `tag`
/// (e.g. one block per VM `returnval`), so each block can be scraped with
/// `first_text` independently.
pub fn blocks(xml: &str, tag: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = None;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if local_name_eq(e.name().as_ref(), tag) => {
                if depth == 0 {
                    start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::End(e)) if local_name_eq(e.name().as_ref(), tag) => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let end = reader.buffer_position() as usize;
                        if end <= xml.len() && s <= end {
                            out.push(xml[s..end].to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

fn local_name_eq(qname: &[u8], tag: &str) -> bool {
    let s = std::str::from_utf8(qname).unwrap_or("");
    let local = s.rsplit(':').next().unwrap_or(s);
    local == tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_text_finds_nested_tag() {
        let xml = "<root><a><name>host-1</name></a></root>";
        assert_eq!(first_text(xml, "name").as_deref(), Some("host-1"));
    }

    #[test]
    fn first_text_missing_tag_is_none() {
        let xml = "<root><a/></root>";
        assert_eq!(first_text(xml, "name"), None);
    }

    #[test]
    fn blocks_splits_repeated_siblings() {
        let xml = "<r><vm><id>1</id></vm><vm><id>2</id></vm></r>";
        let parts = blocks(xml, "vm");
        assert_eq!(parts.len(), 2);
        assert_eq!(first_text(&parts[0], "id").as_deref(), Some("1"));
        assert_eq!(first_text(&parts[1], "id").as_deref(), Some("2"));
    }

    #[test]
    fn esc_escapes_ampersand() {
        assert_eq!(esc("a & b"), "a &amp; b");
    }
}
