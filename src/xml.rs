//! Blob service XML rendering and parsing.
//!
//! The service speaks XML in both directions: the client renders the
//! block-list commit document and parses error bodies, enumeration pages,
//! and the committed-block-list query, all via `quick-xml`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::errors::{AzError, Result};

/// One page of an enumeration (`comp=list`) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Names in page order.
    pub names: Vec<String>,
    /// Continuation marker for the next page, when the listing is truncated.
    pub next_marker: Option<String>,
}

// -- Rendering ----------------------------------------------------------------

/// Render the Put Block List commit document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <BlockList><Uncommitted>MDA=</Uncommitted>...</BlockList>
/// ```
///
/// Ids must appear in plan order; the service fixes the blob's byte order
/// from this document.
pub fn render_block_list(block_ids: &[String]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
        .write_event(Event::Start(BytesStart::new("BlockList")))
        .expect("start BlockList");
    for id in block_ids {
        writer
            .write_event(Event::Start(BytesStart::new("Uncommitted")))
            .expect("start Uncommitted");
        writer
            .write_event(Event::Text(BytesText::new(id)))
            .expect("block id text");
        writer
            .write_event(Event::End(BytesEnd::new("Uncommitted")))
            .expect("end Uncommitted");
    }
    writer
        .write_event(Event::End(BytesEnd::new("BlockList")))
        .expect("end BlockList");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// -- Parsing ------------------------------------------------------------------

/// Extract the inner `<Error><Code>` of a service error body, if present.
pub fn parse_error_code(body: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut in_code = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => in_code = element.name().as_ref() == b"Code",
            Ok(Event::Text(text)) if in_code => {
                return text.unescape().ok().map(|value| value.trim().to_string());
            }
            Ok(Event::End(_)) => in_code = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Parse one `EnumerationResults` page of a blob listing
/// (`GET /{container}?restype=container&comp=list`).
pub fn parse_blob_list(body: &[u8]) -> Result<ListPage> {
    parse_enumeration(body, b"Blob")
}

/// Parse one `EnumerationResults` page of a container listing
/// (`GET /?comp=list` at storage-account scope).
pub fn parse_container_list(body: &[u8]) -> Result<ListPage> {
    parse_enumeration(body, b"Container")
}

fn parse_enumeration(body: &[u8], entry: &[u8]) -> Result<ListPage> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut names = Vec::new();
    let mut next_marker: Option<String> = None;
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| malformed(e))?;
        match event {
            Event::Start(element) => stack.push(element.name().as_ref().to_vec()),
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(malformed)?.trim().to_string();
                let depth = stack.len();
                if value.is_empty() {
                    // Whitespace between elements.
                } else if depth >= 2
                    && stack[depth - 1].as_slice() == b"Name"
                    && stack[depth - 2].as_slice() == entry
                {
                    names.push(value);
                } else if depth >= 1 && stack[depth - 1].as_slice() == b"NextMarker" {
                    next_marker = Some(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(ListPage {
        names,
        next_marker: next_marker.filter(|marker| !marker.is_empty()),
    })
}

/// Parse the committed block ids from a `GET ?comp=blocklist` response.
pub fn parse_committed_blocks(body: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut ids = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| malformed(e))?;
        match event {
            Event::Start(element) => stack.push(element.name().as_ref().to_vec()),
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(malformed)?.trim().to_string();
                let depth = stack.len();
                if !value.is_empty()
                    && depth >= 3
                    && stack[depth - 1].as_slice() == b"Name"
                    && stack[depth - 2].as_slice() == b"Block"
                    && stack[depth - 3].as_slice() == b"CommittedBlocks"
                {
                    ids.push(value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(ids)
}

fn malformed(err: quick_xml::Error) -> AzError {
    AzError::InvalidResponse {
        operation: "parse service xml",
        detail: err.to_string(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_block_list_order_and_shape() {
        let ids = vec!["MDA=".to_string(), "MDE=".to_string(), "MDI=".to_string()];
        let xml = render_block_list(&ids);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<BlockList>"));
        assert!(xml.ends_with("</BlockList>"));
        assert_eq!(xml.matches("<Uncommitted>").count(), 3);
        // Plan order must be preserved verbatim.
        let first = xml.find("MDA=").unwrap();
        let second = xml.find("MDE=").unwrap();
        let third = xml.find("MDI=").unwrap();
        assert!(first < second && second < third);
    }

    #[test]
    fn test_render_block_list_empty() {
        let xml = render_block_list(&[]);
        assert!(xml.contains("<BlockList>"));
        assert!(!xml.contains("<Uncommitted>"));
    }

    #[test]
    fn test_parse_error_code() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<Error><Code>InvalidBlockList</Code><Message>The specified block list is invalid.</Message></Error>"#;
        assert_eq!(
            parse_error_code(body).as_deref(),
            Some("InvalidBlockList")
        );
    }

    #[test]
    fn test_parse_error_code_absent() {
        assert_eq!(parse_error_code(b"not xml at all"), None);
        assert_eq!(parse_error_code(b"<Error><Message>x</Message></Error>"), None);
    }

    #[test]
    fn test_parse_blob_list_page() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="ct">
  <Prefix>p/</Prefix>
  <Blobs>
    <Blob><Name>p/k1</Name><Properties><Content-Length>3</Content-Length></Properties></Blob>
    <Blob><Name>p/k2</Name><Properties><Content-Length>5</Content-Length></Properties></Blob>
  </Blobs>
  <NextMarker>marker-token</NextMarker>
</EnumerationResults>"#;
        let page = parse_blob_list(body).unwrap();
        assert_eq!(page.names, vec!["p/k1", "p/k2"]);
        assert_eq!(page.next_marker.as_deref(), Some("marker-token"));
    }

    #[test]
    fn test_parse_blob_list_last_page() {
        let body = br#"<EnumerationResults>
  <Blobs><Blob><Name>only</Name></Blob></Blobs>
  <NextMarker />
</EnumerationResults>"#;
        let page = parse_blob_list(body).unwrap();
        assert_eq!(page.names, vec!["only"]);
        assert_eq!(page.next_marker, None);
    }

    #[test]
    fn test_parse_blob_list_ignores_other_names() {
        // A <Name> outside <Blob> must not leak into the listing.
        let body = br#"<EnumerationResults>
  <Containers><Container><Name>not-a-blob</Name></Container></Containers>
  <Blobs><Blob><Name>a-blob</Name></Blob></Blobs>
</EnumerationResults>"#;
        let page = parse_blob_list(body).unwrap();
        assert_eq!(page.names, vec!["a-blob"]);
    }

    #[test]
    fn test_parse_container_list_page() {
        let body = br#"<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/">
  <Containers>
    <Container><Name>ct-a</Name></Container>
    <Container><Name>ct-b</Name></Container>
  </Containers>
</EnumerationResults>"#;
        let page = parse_container_list(body).unwrap();
        assert_eq!(page.names, vec!["ct-a", "ct-b"]);
        assert_eq!(page.next_marker, None);
    }

    #[test]
    fn test_parse_committed_blocks() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<BlockList>
  <CommittedBlocks>
    <Block><Name>MDA=</Name><Size>1024</Size></Block>
    <Block><Name>MDE=</Name><Size>1024</Size></Block>
  </CommittedBlocks>
  <UncommittedBlocks>
    <Block><Name>ghost</Name><Size>7</Size></Block>
  </UncommittedBlocks>
</BlockList>"#;
        let ids = parse_committed_blocks(body).unwrap();
        assert_eq!(ids, vec!["MDA=", "MDE="]);
    }

    #[test]
    fn test_parse_committed_blocks_empty() {
        let body = b"<BlockList><CommittedBlocks /></BlockList>";
        assert!(parse_committed_blocks(body).unwrap().is_empty());
    }
}
