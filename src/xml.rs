//! XML emission and minimal request-body parsing.
//!
//! Responses are assembled with [`XmlWriter`], which escapes all text and
//! attribute values. Request parsing is deliberately not a full XML parser:
//! the service only ever accepts four small documents, and each is handled
//! by linear tag extraction.

use crate::errors::{S3Error, S3ErrorCode};

/// Escape text content or an attribute value.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Undo the five entity references produced by [`escape`].
pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (entity, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else if rest.starts_with("&quot;") {
            ('"', 6)
        } else if rest.starts_with("&apos;") {
            ('\'', 6)
        } else {
            ('&', 1)
        };
        out.push(entity);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// Incremental writer over a string buffer.
pub struct XmlWriter {
    buf: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        XmlWriter {
            buf: String::with_capacity(256),
        }
    }

    /// Emit the XML declaration. Never emits a BOM.
    pub fn declaration(&mut self) {
        self.buf
            .push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    }

    pub fn open(&mut self, tag: &str) {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
    }

    pub fn open_with_attrs(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.buf.push('<');
        self.buf.push_str(tag);
        for (name, value) in attrs {
            self.buf.push(' ');
            self.buf.push_str(name);
            self.buf.push_str("=\"");
            self.buf.push_str(&escape(value));
            self.buf.push('"');
        }
        self.buf.push('>');
    }

    pub fn close(&mut self, tag: &str) {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
    }

    /// Open, escaped text, close in one go.
    pub fn element(&mut self, tag: &str, text: &str) {
        self.open(tag);
        self.buf.push_str(&escape(text));
        self.close(tag);
    }

    /// A self-closing empty element with attributes.
    pub fn empty_with_attrs(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.buf.push('<');
        self.buf.push_str(tag);
        for (name, value) in attrs {
            self.buf.push(' ');
            self.buf.push_str(name);
            self.buf.push_str("=\"");
            self.buf.push_str(&escape(value));
            self.buf.push('"');
        }
        self.buf.push_str("/>");
    }

    /// Append pre-escaped content verbatim.
    pub fn raw(&mut self, content: &str) {
        self.buf.push_str(content);
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        XmlWriter::new()
    }
}

// -- Tag extraction ----------------------------------------------------------

/// Find the inner text of the first `<tag ...>...</tag>` occurrence at or after
/// `from`. Returns `(inner, end)` where `end` is the offset just past the
/// closing tag. Self-closing `<tag .../>` yields an empty inner text.
fn find_tag(doc: &str, tag: &str, from: usize) -> Option<(String, usize)> {
    let open = format!("<{}", tag);
    let mut search = from;
    loop {
        let start = doc[search..].find(&open)? + search;
        let after_name = start + open.len();
        // Reject prefix matches like <KeyCount> when looking for <Key>.
        match doc.as_bytes().get(after_name) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b'/') => {}
            _ => {
                search = after_name;
                continue;
            }
        }
        let tag_end = doc[after_name..].find('>')? + after_name;
        if doc[..tag_end].ends_with('/') {
            return Some((String::new(), tag_end + 1));
        }
        let close = format!("</{}>", tag);
        let inner_start = tag_end + 1;
        let close_pos = doc[inner_start..].find(&close)? + inner_start;
        let inner = unescape(doc[inner_start..close_pos].trim());
        return Some((inner, close_pos + close.len()));
    }
}

/// First occurrence of a tag's inner text anywhere in the document.
pub fn extract_tag(doc: &str, tag: &str) -> Option<String> {
    find_tag(doc, tag, 0).map(|(inner, _)| inner)
}

/// All occurrences of a tag's inner content, in document order.
///
/// The inner content is returned raw (not entity-decoded) so nested tags can
/// be extracted from it in turn.
pub fn extract_tag_blocks(doc: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut search = 0;
    while let Some(rel) = doc[search..].find(&open) {
        let start = search + rel;
        let after_name = start + open.len();
        match doc.as_bytes().get(after_name) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b'/') => {}
            _ => {
                search = after_name;
                continue;
            }
        }
        let tag_end = match doc[after_name..].find('>') {
            Some(p) => after_name + p,
            None => break,
        };
        if doc[..tag_end].ends_with('/') {
            blocks.push(String::new());
            search = tag_end + 1;
            continue;
        }
        let inner_start = tag_end + 1;
        let close_pos = match doc[inner_start..].find(&close) {
            Some(p) => inner_start + p,
            None => break,
        };
        blocks.push(doc[inner_start..close_pos].to_string());
        search = close_pos + close.len();
    }
    blocks
}

// -- Request documents -------------------------------------------------------

/// Parse a `CreateBucketConfiguration` body. Returns the LocationConstraint
/// text, if the element is present.
pub fn parse_create_bucket_configuration(body: &str) -> Result<Option<String>, S3Error> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    if !body.contains("CreateBucketConfiguration") {
        return Err(S3Error::new(S3ErrorCode::MalformedXML));
    }
    Ok(extract_tag(body, "LocationConstraint"))
}

/// A parsed `Delete` request body.
#[derive(Debug)]
pub struct DeleteRequest {
    pub quiet: bool,
    pub keys: Vec<String>,
}

/// Parse a `Delete` (DeleteObjects) body.
pub fn parse_delete(body: &str) -> Result<DeleteRequest, S3Error> {
    if !body.contains("<Delete") {
        return Err(S3Error::new(S3ErrorCode::MalformedXML));
    }
    let quiet = extract_tag(body, "Quiet")
        .map(|q| q.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let mut keys = Vec::new();
    for block in extract_tag_blocks(body, "Object") {
        match find_tag(&block, "Key", 0) {
            Some((key, _)) => keys.push(key),
            None => return Err(S3Error::new(S3ErrorCode::MalformedXML)),
        }
    }
    if keys.is_empty() {
        return Err(S3Error::new(S3ErrorCode::MalformedXML));
    }
    Ok(DeleteRequest { quiet, keys })
}

/// One `Part` entry from a CompleteMultipartUpload body.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Parse a `CompleteMultipartUpload` body into its part list.
pub fn parse_complete_multipart_upload(body: &str) -> Result<Vec<CompletedPart>, S3Error> {
    if !body.contains("CompleteMultipartUpload") {
        return Err(S3Error::new(S3ErrorCode::MalformedXML));
    }
    let mut parts = Vec::new();
    for block in extract_tag_blocks(body, "Part") {
        let number = find_tag(&block, "PartNumber", 0)
            .and_then(|(n, _)| n.parse::<u32>().ok())
            .ok_or_else(|| S3Error::new(S3ErrorCode::MalformedXML))?;
        let etag = find_tag(&block, "ETag", 0)
            .map(|(e, _)| e)
            .ok_or_else(|| S3Error::new(S3ErrorCode::MalformedXML))?;
        parts.push(CompletedPart {
            part_number: number,
            etag,
        });
    }
    if parts.is_empty() {
        return Err(S3Error::new(S3ErrorCode::MalformedXML));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let raw = "a<b>&\"c'd";
        let escaped = escape(raw);
        assert_eq!(escaped, "a&lt;b&gt;&amp;&quot;c&apos;d");
        assert_eq!(unescape(&escaped), raw);
    }

    #[test]
    fn test_writer_basic_document() {
        let mut w = XmlWriter::new();
        w.declaration();
        w.open_with_attrs("Result", &[("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
        w.element("Name", "b&w");
        w.empty_with_attrs("Empty", &[]);
        w.close("Result");
        assert_eq!(
            w.finish(),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Result xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Name>b&amp;w</Name><Empty/></Result>"
        );
    }

    #[test]
    fn test_extract_tag_skips_prefix_matches() {
        let doc = "<KeyCount>7</KeyCount><Key>real</Key>";
        assert_eq!(extract_tag(doc, "Key").as_deref(), Some("real"));
    }

    #[test]
    fn test_parse_create_bucket_configuration() {
        let body = "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                    <LocationConstraint>eu-west-1</LocationConstraint>\
                    </CreateBucketConfiguration>";
        assert_eq!(
            parse_create_bucket_configuration(body).unwrap().as_deref(),
            Some("eu-west-1")
        );
        assert_eq!(parse_create_bucket_configuration("").unwrap(), None);
        assert!(parse_create_bucket_configuration("<Delete/>").is_err());
    }

    #[test]
    fn test_parse_delete() {
        let body = "<Delete><Quiet>true</Quiet>\
                    <Object><Key>a/b.txt</Key></Object>\
                    <Object><Key>c&amp;d</Key></Object></Delete>";
        let req = parse_delete(body).unwrap();
        assert!(req.quiet);
        assert_eq!(req.keys, vec!["a/b.txt".to_string(), "c&d".to_string()]);

        assert!(parse_delete("<Delete></Delete>").is_err());
        assert!(parse_delete("not xml").is_err());
    }

    #[test]
    fn test_parse_complete_multipart_upload() {
        let body = "<CompleteMultipartUpload>\
                    <Part><PartNumber>1</PartNumber><ETag>\"abc\"</ETag></Part>\
                    <Part><ETag>\"def\"</ETag><PartNumber>2</PartNumber></Part>\
                    </CompleteMultipartUpload>";
        let parts = parse_complete_multipart_upload(body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag, "\"abc\"");
        assert_eq!(parts[1].part_number, 2);

        let bad = "<CompleteMultipartUpload><Part><PartNumber>x</PartNumber>\
                   <ETag>\"e\"</ETag></Part></CompleteMultipartUpload>";
        assert!(parse_complete_multipart_upload(bad).is_err());
        assert!(parse_complete_multipart_upload("<CompleteMultipartUpload/>").is_err());
    }
}
