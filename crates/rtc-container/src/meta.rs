//! Meta documents: the stream registry as carried by `Meta` and `meta`
//! frames.
//!
//! The document is a relaxed JSON form — an array of objects with unquoted
//! keys, closed by the next free stream id:
//!
//! ```text
//! [{id:9,name:"stdin",cont:true,content:"utf-8"},10]
//! ```
//!
//! The trailing integer and unquoted keys put this outside real JSON, so a
//! dedicated parser for the fixed shape lives here instead of a JSON
//! library. Object keys other than the known ones are skipped but preserved
//! in the entry's raw text.

use crate::error::FormatError;
use crate::format::{FrameLength, StreamConfig};

/// One object of a meta document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    pub id: u32,
    pub name: Option<String>,
    /// Fixed frame length; absent for variable-length streams.
    pub length: Option<u64>,
    pub cont: Option<bool>,
    pub content: Option<String>,
    /// Exact source text of the object, for caller queries.
    pub raw: String,
}

impl MetaEntry {
    pub fn frame_length(&self) -> FrameLength {
        match self.length {
            Some(n) => FrameLength::Fixed(n),
            None => FrameLength::Variable,
        }
    }
}

/// A parsed meta document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDocument {
    pub entries: Vec<MetaEntry>,
    /// The writer's next free stream id at the time the document was
    /// emitted.
    pub next_id: u64,
}

/// Append one stream object to `out`.
pub fn render_entry(id: u32, cfg: &StreamConfig, out: &mut Vec<u8>) {
    out.extend_from_slice(b"{id:");
    out.extend_from_slice(id.to_string().as_bytes());
    out.extend_from_slice(b",name:\"");
    escape_into(&cfg.name, out);
    out.push(b'"');
    if let FrameLength::Fixed(n) = cfg.frame_length {
        out.extend_from_slice(b",length:");
        out.extend_from_slice(n.to_string().as_bytes());
    }
    if cfg.cont {
        out.extend_from_slice(b",cont:true");
    }
    if let Some(content) = &cfg.content {
        out.extend_from_slice(b",content:\"");
        escape_into(content, out);
        out.push(b'"');
    }
    out.push(b'}');
}

/// Render a whole document from `(id, config)` pairs and the next free id.
pub fn render_document<'a, I>(streams: I, next_id: u32) -> Vec<u8>
where
    I: IntoIterator<Item = (u32, &'a StreamConfig)>,
{
    let mut out = Vec::new();
    out.push(b'[');
    for (id, cfg) in streams {
        render_entry(id, cfg, &mut out);
        out.push(b',');
    }
    out.extend_from_slice(next_id.to_string().as_bytes());
    out.push(b']');
    out
}

fn escape_into(s: &str, out: &mut Vec<u8>) {
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if c.is_control() => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

/// Parse a complete meta document.
pub fn parse_document(bytes: &[u8]) -> Result<MetaDocument, FormatError> {
    let mut p = Parser { bytes, pos: 0 };
    p.skip_ws();
    p.expect(b'[')?;
    let mut entries = Vec::new();
    loop {
        p.skip_ws();
        match p.peek() {
            Some(b'{') => {
                entries.push(p.object()?);
                p.skip_ws();
                p.expect(b',')?;
            }
            Some(b'0'..=b'9') => break,
            _ => return Err(FormatError::Meta("expected object or next free id")),
        }
    }
    let next_id = p.integer()?;
    p.skip_ws();
    p.expect(b']')?;
    p.skip_ws();
    if p.pos != p.bytes.len() {
        return Err(FormatError::Meta("trailing bytes after document"));
    }
    Ok(MetaDocument { entries, next_id })
}

enum Value {
    Int(u64),
    Bool(bool),
    Str(String),
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), FormatError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(FormatError::Meta("unexpected byte"))
        }
    }

    fn integer(&mut self) -> Result<u64, FormatError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FormatError::Meta("expected integer"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(FormatError::Meta("integer out of range"))
    }

    fn ident(&mut self) -> Result<&str, FormatError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FormatError::Meta("expected key"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| FormatError::Meta("key is not ascii"))
    }

    fn string(&mut self) -> Result<String, FormatError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek().ok_or(FormatError::Meta("unterminated string"))? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let esc = self.peek().ok_or(FormatError::Meta("unterminated escape"))?;
                    self.pos += 1;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => {
                            if self.pos + 4 > self.bytes.len() {
                                return Err(FormatError::Meta("short unicode escape"));
                            }
                            let hex = std::str::from_utf8(&self.bytes[self.pos..self.pos + 4])
                                .map_err(|_| FormatError::Meta("bad unicode escape"))?;
                            let code = u32::from_str_radix(hex, 16)
                                .map_err(|_| FormatError::Meta("bad unicode escape"))?;
                            self.pos += 4;
                            out.push(
                                char::from_u32(code)
                                    .ok_or(FormatError::Meta("bad unicode escape"))?,
                            );
                        }
                        _ => return Err(FormatError::Meta("unknown escape")),
                    }
                }
                _ => {
                    // Consume one UTF-8 scalar.
                    let rest = std::str::from_utf8(&self.bytes[self.pos..])
                        .map_err(|_| FormatError::Meta("string is not utf-8"))?;
                    let c = rest.chars().next().ok_or(FormatError::Meta("unterminated string"))?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value, FormatError> {
        match self.peek().ok_or(FormatError::Meta("expected value"))? {
            b'"' => Ok(Value::Str(self.string()?)),
            b'0'..=b'9' => Ok(Value::Int(self.integer()?)),
            b't' | b'f' => {
                let word = self.ident()?;
                match word {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(FormatError::Meta("unknown literal")),
                }
            }
            _ => Err(FormatError::Meta("expected value")),
        }
    }

    fn object(&mut self) -> Result<MetaEntry, FormatError> {
        let raw_start = self.pos;
        self.expect(b'{')?;

        let mut id = None;
        let mut name = None;
        let mut length = None;
        let mut cont = None;
        let mut content = None;

        self.skip_ws();
        if self.peek() != Some(b'}') {
            loop {
                self.skip_ws();
                let key_start = self.pos;
                let key_end;
                {
                    let key = self.ident()?;
                    key_end = key_start + key.len();
                }
                self.skip_ws();
                self.expect(b':')?;
                self.skip_ws();
                let value = self.value()?;
                let key = std::str::from_utf8(&self.bytes[key_start..key_end]).unwrap();
                match (key, value) {
                    ("id", Value::Int(v)) => {
                        id = Some(
                            u32::try_from(v).map_err(|_| FormatError::Meta("id out of range"))?,
                        );
                    }
                    ("id", _) => return Err(FormatError::Meta("id must be an integer")),
                    ("name", Value::Str(s)) => name = Some(s),
                    ("name", _) => return Err(FormatError::Meta("name must be a string")),
                    ("length", Value::Int(v)) => length = Some(v),
                    ("length", _) => return Err(FormatError::Meta("length must be an integer")),
                    ("cont", Value::Bool(b)) => cont = Some(b),
                    ("cont", _) => return Err(FormatError::Meta("cont must be a boolean")),
                    ("content", Value::Str(s)) => content = Some(s),
                    ("content", _) => return Err(FormatError::Meta("content must be a string")),
                    // Unknown keys are preserved only through `raw`.
                    _ => {}
                }
                self.skip_ws();
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b'}') => break,
                    _ => return Err(FormatError::Meta("expected ',' or '}'")),
                }
            }
        }
        self.expect(b'}')?;

        let raw = std::str::from_utf8(&self.bytes[raw_start..self.pos])
            .map_err(|_| FormatError::Meta("object is not utf-8"))?
            .to_owned();

        Ok(MetaEntry {
            id: id.ok_or(FormatError::Meta("object has no id"))?,
            name,
            length,
            cont,
            content,
            raw,
        })
    }
}
