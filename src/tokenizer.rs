//! Scanner for the XML-RPC grammar. Walks a complete in-memory
//! document and reports what it finds through [`Callback`]; the value
//! tree itself is assembled by the consumer (see `value_tree_builder`).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::common::{DateTime, Fault};
use crate::constants::*;

/// Receives parse events. Every method returning `bool` may stop the
/// parse by returning false.
pub trait Callback {
    fn call(&mut self, method: &str) -> bool;
    fn response(&mut self) -> bool;
    fn fault(&mut self) -> bool;

    fn integer(&mut self, v: i32) -> bool;
    fn integer64(&mut self, v: i64) -> bool;
    fn boolean(&mut self, v: bool) -> bool;
    fn double_number(&mut self, v: f64) -> bool;
    fn string_value(&mut self, v: String) -> bool;
    fn datetime(&mut self, v: DateTime) -> bool;
    fn binary(&mut self, v: Vec<u8>) -> bool;
    fn null(&mut self) -> bool;

    fn array_begin(&mut self) -> bool;
    fn struct_begin(&mut self) -> bool;
    fn struct_key(&mut self, name: String) -> bool;
    /// Closes the innermost open array or struct.
    fn value_end(&mut self) -> bool;
}

struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
}

pub struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a [u8]) -> Tokenizer<'a> {
        Tokenizer { input, pos: 0 }
    }

    /** Scans one complete document: a methodCall, a methodResponse,
     * or a bare value. Extension elements (`ex:i8`, `ex:nil`) are
     * accepted regardless of the dialect the peer claims to speak.
     */
    pub fn parse(&mut self, cb: &mut dyn Callback) -> Result<(), Fault> {
        self.skip_misc();

        let root_start = self.pos;
        let root = self.read_tag()?;
        if root.closing || root.self_closing {
            return Err(self.error("document has no root element"));
        }

        match root.name.as_str() {
            TAG_METHOD_CALL => self.parse_call_body(cb)?,
            TAG_METHOD_RESPONSE => self.parse_response_body(cb)?,
            TAG_VALUE => {
                self.pos = root_start;
                self.parse_value(cb, 0)?;
            }
            other => {
                return Err(self.error(&format!("unexpected root element <{}>", other)))
            }
        }

        self.skip_misc();
        if self.pos < self.input.len() {
            return Err(self.error("trailing content after document"));
        }
        Ok(())
    }

    fn parse_call_body(&mut self, cb: &mut dyn Callback) -> Result<(), Fault> {
        self.expect_open(TAG_METHOD_NAME)?;
        let raw = self.read_raw_text()?;
        let method = self.decode_entities(raw)?;
        self.expect_close(TAG_METHOD_NAME)?;
        if !cb.call(&method) {
            return Err(self.aborted());
        }

        self.skip_whitespace();
        if !self.try_close(TAG_METHOD_CALL) {
            self.parse_params(cb)?;
            self.skip_whitespace();
            self.expect_close(TAG_METHOD_CALL)?;
        }
        Ok(())
    }

    fn parse_response_body(&mut self, cb: &mut dyn Callback) -> Result<(), Fault> {
        self.skip_whitespace();
        if self.try_open(TAG_FAULT) {
            if !cb.fault() {
                return Err(self.aborted());
            }
            self.skip_whitespace();
            self.parse_value(cb, 0)?;
            self.skip_whitespace();
            self.expect_close(TAG_FAULT)?;
        } else {
            if !cb.response() {
                return Err(self.aborted());
            }
            self.expect_open(TAG_PARAMS)?;
            self.skip_whitespace();
            self.expect_open(TAG_PARAM)?;
            self.skip_whitespace();
            self.parse_value(cb, 0)?;
            self.skip_whitespace();
            self.expect_close(TAG_PARAM)?;
            self.skip_whitespace();
            self.expect_close(TAG_PARAMS)?;
        }
        self.skip_whitespace();
        self.expect_close(TAG_METHOD_RESPONSE)?;
        Ok(())
    }

    fn parse_params(&mut self, cb: &mut dyn Callback) -> Result<(), Fault> {
        self.expect_open(TAG_PARAMS)?;
        loop {
            self.skip_whitespace();
            if self.try_close(TAG_PARAMS) {
                return Ok(());
            }
            self.expect_open(TAG_PARAM)?;
            self.skip_whitespace();
            self.parse_value(cb, 0)?;
            self.skip_whitespace();
            self.expect_close(TAG_PARAM)?;
        }
    }

    fn parse_value(&mut self, cb: &mut dyn Callback, depth: usize) -> Result<(), Fault> {
        if depth > MAX_NEST_DEPTH {
            return Err(Fault::limit_exceeded(format!(
                "document nested deeper than {} levels",
                MAX_NEST_DEPTH
            )));
        }

        self.expect_open(TAG_VALUE)?;
        let raw = self.read_raw_text()?;
        let tag_start = self.pos;
        let tag = self.read_tag()?;

        // <value>text</value> with no type element is a string
        if tag.closing && tag.name == TAG_VALUE {
            let text = self.decode_entities(raw)?;
            if text.len() > MAX_STR_LENGTH {
                return Err(Fault::limit_exceeded("string too long"));
            }
            if !cb.string_value(text) {
                return Err(self.aborted());
            }
            return Ok(());
        }
        if tag.closing {
            self.pos = tag_start;
            return Err(self.error("mismatched close tag inside <value>"));
        }
        if !raw.iter().all(|b| b.is_ascii_whitespace()) {
            self.pos = tag_start;
            return Err(self.error("unexpected text before type element"));
        }

        match tag.name.as_str() {
            TAG_ARRAY => self.parse_array(cb, depth)?,
            TAG_STRUCT => self.parse_struct(cb, depth)?,
            _ => self.parse_scalar(cb, tag)?,
        }

        self.skip_whitespace();
        self.expect_close(TAG_VALUE)
    }

    fn parse_scalar(&mut self, cb: &mut dyn Callback, open: Tag) -> Result<(), Fault> {
        let content = if open.self_closing {
            String::new()
        } else {
            let raw = self.read_raw_text()?;
            let close = self.read_tag()?;
            if !close.closing || close.name != open.name {
                return Err(self.error(&format!("unterminated <{}>", open.name)));
            }
            self.decode_entities(raw)?
        };

        let proceed = match open.name.as_str() {
            TAG_I4 | TAG_INT => cb.integer(self.parse_number(&content)?),
            TAG_I8 | "i8" => cb.integer64(self.parse_number(&content)?),
            TAG_BOOLEAN => match content.trim() {
                "0" => cb.boolean(false),
                "1" => cb.boolean(true),
                other => {
                    return Err(self.error(&format!("boolean must be 0 or 1, got {:?}", other)))
                }
            },
            TAG_DOUBLE => {
                let v: f64 = content
                    .trim()
                    .parse()
                    .map_err(|_| self.error(&format!("bad double: {:?}", content)))?;
                if !v.is_finite() {
                    return Err(self.error(&format!("double is not finite: {:?}", content)));
                }
                cb.double_number(v)
            }
            TAG_STRING => {
                if content.len() > MAX_STR_LENGTH {
                    return Err(Fault::limit_exceeded("string too long"));
                }
                cb.string_value(content)
            }
            TAG_DATETIME => {
                let dt = DateTime::new(&content)
                    .map_err(|fault| self.error(&fault.message))?;
                cb.datetime(dt)
            }
            TAG_BASE64 => {
                let mut cleaned = content.into_bytes();
                cleaned.retain(|b| !b.is_ascii_whitespace());
                let data = STANDARD
                    .decode(&cleaned)
                    .map_err(|_| self.error("bad base64 payload"))?;
                if data.len() > MAX_BIN_LENGTH {
                    return Err(Fault::limit_exceeded("binary payload too long"));
                }
                cb.binary(data)
            }
            TAG_NIL | "nil" => {
                if !content.trim().is_empty() {
                    return Err(self.error("nil element carries content"));
                }
                cb.null()
            }
            other => return Err(self.error(&format!("unknown value element <{}>", other))),
        };

        if !proceed {
            return Err(self.aborted());
        }
        Ok(())
    }

    fn parse_array(&mut self, cb: &mut dyn Callback, depth: usize) -> Result<(), Fault> {
        if !cb.array_begin() {
            return Err(self.aborted());
        }
        self.skip_whitespace();
        self.expect_open(TAG_DATA)?;

        let mut count = 0usize;
        loop {
            self.skip_whitespace();
            if self.try_close(TAG_DATA) {
                break;
            }
            if count >= MAX_ARRAY_LENGTH {
                return Err(Fault::limit_exceeded("array has too many elements"));
            }
            self.parse_value(cb, depth + 1)?;
            count += 1;
        }

        self.skip_whitespace();
        self.expect_close(TAG_ARRAY)?;
        if !cb.value_end() {
            return Err(self.aborted());
        }
        Ok(())
    }

    fn parse_struct(&mut self, cb: &mut dyn Callback, depth: usize) -> Result<(), Fault> {
        if !cb.struct_begin() {
            return Err(self.aborted());
        }

        let mut count = 0usize;
        loop {
            self.skip_whitespace();
            if self.try_close(TAG_STRUCT) {
                break;
            }
            if count >= MAX_STRUCT_LENGTH {
                return Err(Fault::limit_exceeded("struct has too many members"));
            }
            self.expect_open(TAG_MEMBER)?;
            self.skip_whitespace();
            self.expect_open(TAG_NAME)?;
            let raw = self.read_raw_text()?;
            let name = self.decode_entities(raw)?;
            if name.is_empty() {
                return Err(self.error("struct member name is empty"));
            }
            self.expect_close(TAG_NAME)?;
            if !cb.struct_key(name) {
                return Err(self.aborted());
            }
            self.skip_whitespace();
            self.parse_value(cb, depth + 1)?;
            self.skip_whitespace();
            self.expect_close(TAG_MEMBER)?;
            count += 1;
        }

        if !cb.value_end() {
            return Err(self.aborted());
        }
        Ok(())
    }

    fn parse_number<T: std::str::FromStr>(&self, content: &str) -> Result<T, Fault> {
        content
            .trim()
            .parse()
            .map_err(|_| self.error(&format!("bad integer: {:?}", content)))
    }

    fn error(&self, msg: &str) -> Fault {
        Fault::parse_error(format!("{} (at byte {})", msg, self.pos))
    }

    fn aborted(&self) -> Fault {
        Fault::parse_error("parse stopped by consumer")
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .map_or(false, |b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    /// Skips whitespace, the XML prologue and comments.
    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            if self.input[self.pos..].starts_with(b"<?") {
                match self.find_from(self.pos, b"?>") {
                    Some(end) => self.pos = end + 2,
                    None => return,
                }
            } else if self.input[self.pos..].starts_with(b"<!--") {
                match self.find_from(self.pos, b"-->") {
                    Some(end) => self.pos = end + 3,
                    None => return,
                }
            } else {
                return;
            }
        }
    }

    fn find_from(&self, from: usize, needle: &[u8]) -> Option<usize> {
        self.input[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|off| from + off)
    }

    fn read_tag(&mut self) -> Result<Tag, Fault> {
        if self.input.get(self.pos) != Some(&b'<') {
            return Err(self.error("expected a tag"));
        }
        self.pos += 1;

        let closing = self.input.get(self.pos) == Some(&b'/');
        if closing {
            self.pos += 1;
        }

        let start = self.pos;
        while self.input.get(self.pos).map_or(false, |&b| {
            b != b'>' && b != b'/' && !b.is_ascii_whitespace()
        }) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("empty tag name"));
        }
        let name = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("tag name is not UTF-8"))?
            .to_owned();

        let mut self_closing = false;
        loop {
            match self.input.get(self.pos) {
                None => return Err(self.error("unterminated tag")),
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') if self.input.get(self.pos + 1) == Some(&b'>') => {
                    self_closing = true;
                    self.pos += 2;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }

        Ok(Tag {
            name,
            closing,
            self_closing,
        })
    }

    fn expect_open(&mut self, name: &str) -> Result<(), Fault> {
        self.skip_whitespace();
        let tag = self.read_tag()?;
        if tag.closing || tag.self_closing || tag.name != name {
            return Err(self.error(&format!("expected <{}>", name)));
        }
        Ok(())
    }

    fn expect_close(&mut self, name: &str) -> Result<(), Fault> {
        self.skip_whitespace();
        let tag = self.read_tag()?;
        if !tag.closing || tag.name != name {
            return Err(self.error(&format!("expected </{}>", name)));
        }
        Ok(())
    }

    /// Consumes `</name>` if it is the next tag, leaves the cursor
    /// untouched otherwise.
    fn try_close(&mut self, name: &str) -> bool {
        self.try_tag(name, true)
    }

    fn try_open(&mut self, name: &str) -> bool {
        self.try_tag(name, false)
    }

    fn try_tag(&mut self, name: &str, closing: bool) -> bool {
        let save = self.pos;
        self.skip_whitespace();
        match self.read_tag() {
            Ok(tag) if tag.closing == closing && !tag.self_closing && tag.name == name => true,
            _ => {
                self.pos = save;
                false
            }
        }
    }

    fn read_raw_text(&mut self) -> Result<&'a [u8], Fault> {
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos] != b'<' {
            self.pos += 1;
        }
        if self.pos >= self.input.len() {
            return Err(self.error("unexpected end of document"));
        }
        Ok(&self.input[start..self.pos])
    }

    /** Expands the predefined entities and numeric character
     * references; everything else passes through byte for byte.
     */
    fn decode_entities(&self, raw: &[u8]) -> Result<String, Fault> {
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] != b'&' {
                out.push(raw[i]);
                i += 1;
                continue;
            }
            let semi = raw[i + 1..]
                .iter()
                .position(|&b| b == b';')
                .map(|off| i + 1 + off)
                .ok_or_else(|| self.error("unterminated entity reference"))?;
            let entity = &raw[i + 1..semi];
            match entity {
                b"lt" => out.push(b'<'),
                b"gt" => out.push(b'>'),
                b"amp" => out.push(b'&'),
                b"quot" => out.push(b'"'),
                b"apos" => out.push(b'\''),
                _ => {
                    let text = std::str::from_utf8(entity)
                        .map_err(|_| self.error("bad entity reference"))?;
                    let code = if let Some(hex) =
                        text.strip_prefix("#x").or_else(|| text.strip_prefix("#X"))
                    {
                        u32::from_str_radix(hex, 16)
                    } else if let Some(dec) = text.strip_prefix('#') {
                        dec.parse()
                    } else {
                        return Err(self.error(&format!("unknown entity &{};", text)));
                    }
                    .map_err(|_| self.error(&format!("bad character reference &{};", text)))?;
                    let c = std::char::from_u32(code)
                        .ok_or_else(|| self.error(&format!("bad character reference &{};", text)))?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
            i = semi + 1;
        }
        String::from_utf8(out).map_err(|_| self.error("text is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::common::{FaultKind, Value};
    use crate::value_tree_builder::parse_value;

    #[test]
    fn prologue_and_comments_are_skipped() {
        let xml = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
                    <!-- produced by a peer -->\r\n\
                    <value><i4>42</i4></value>";
        assert_eq!(parse_value(xml).unwrap(), Value::Int(42));
    }

    #[test]
    fn untyped_value_is_a_string() {
        assert_eq!(
            parse_value(b"<value>plain &amp; simple</value>").unwrap(),
            Value::string("plain & simple")
        );
    }

    #[test]
    fn numeric_character_references_decode() {
        assert_eq!(
            parse_value(b"<value><string>foo&#x0d;bar&#65;</string></value>").unwrap(),
            Value::Str("foo\rbarA".to_owned())
        );
    }

    #[test]
    fn integers_tolerate_surrounding_whitespace() {
        assert_eq!(
            parse_value(b"<value><int> -17 </int></value>").unwrap(),
            Value::Int(-17)
        );
        assert_eq!(
            parse_value(b"<value><ex:i8>8</ex:i8></value>").unwrap(),
            Value::Int64(8)
        );
    }

    #[test]
    fn boolean_accepts_only_zero_and_one() {
        assert_eq!(
            parse_value(b"<value><boolean>1</boolean></value>").unwrap(),
            Value::Bool(true)
        );
        let fault = parse_value(b"<value><boolean>true</boolean></value>").unwrap_err();
        assert_eq!(fault.kind(), FaultKind::ParseError);
    }

    #[test]
    fn nil_parses_in_both_forms() {
        assert_eq!(parse_value(b"<value><ex:nil/></value>").unwrap(), Value::Null);
        assert_eq!(
            parse_value(b"<value><ex:nil></ex:nil></value>").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn base64_ignores_embedded_whitespace() {
        assert_eq!(
            parse_value(b"<value><base64>\r\nYmFz\r\nZTY0IGRhdGE=\r\n</base64></value>")
                .unwrap(),
            Value::Binary(b"base64 data".to_vec())
        );
    }

    #[test]
    fn self_closing_string_is_empty() {
        assert_eq!(
            parse_value(b"<value><string/></value>").unwrap(),
            Value::Str(String::new())
        );
    }

    #[test]
    fn malformed_documents_fault() {
        for xml in [
            &b"<value><i4>12</i4>"[..],
            b"<value><i4>twelve</i4></value>",
            b"<value><i4>12</int></value>",
            b"<value><dateTime.iso8601>1998</dateTime.iso8601></value>",
            b"<value><wat>1</wat></value>",
            b"<value><i4>1</i4></value><value/>",
            b"<bogus/>",
        ] {
            let fault = parse_value(xml).unwrap_err();
            assert_eq!(fault.kind(), FaultKind::ParseError, "input: {:?}", xml);
        }
    }

    #[test]
    fn nesting_limit_holds() {
        let mut xml = Vec::new();
        for _ in 0..80 {
            xml.extend_from_slice(b"<value><array><data>");
        }
        let fault = parse_value(&xml).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::LimitExceeded);
    }
}
