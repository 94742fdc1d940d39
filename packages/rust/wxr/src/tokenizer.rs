//! Incremental XML tokenization.
//!
//! [`XmlTokenizer`] is the pull interface the entity reader and the rewrite
//! stage are written against. [`QuickXmlTokenizer`] implements it on top of
//! `quick-xml`, adding what a streaming import needs: byte-at-a-time input,
//! a breadcrumb stack, text replacement and resumable positions.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

/// The syntactic kind of the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlTokenKind {
    Tag,
    Text,
    CData,
    Comment,
    /// `<?xml ...?>` and other processing instructions.
    ProcessingInstruction,
    Doctype,
}

/// Where parsing restarts after a pause.
///
/// `byte_offset` counts bytes of the original document. The caller resumes
/// by feeding bytes from that offset onward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerCursor {
    pub byte_offset: u64,
    pub breadcrumbs: Vec<String>,
}

/// A pull tokenizer over XML that may arrive in arbitrary chunks.
///
/// `next_token()` returns `false` when the input is exhausted, when more
/// bytes are needed, or after a syntax error; the three cases are told apart
/// with [`is_finished`](XmlTokenizer::is_finished),
/// [`is_paused_at_incomplete_input`](XmlTokenizer::is_paused_at_incomplete_input)
/// and [`last_error`](XmlTokenizer::last_error).
pub trait XmlTokenizer {
    fn append_bytes(&mut self, bytes: &[u8]);

    /// No more bytes will be appended.
    fn input_finished(&mut self);

    fn next_token(&mut self) -> bool;

    fn token_kind(&self) -> Option<XmlTokenKind>;

    /// Qualified name of the current tag, e.g. `wp:post_id`.
    fn tag(&self) -> Option<&str>;

    /// Start tags and empty elements.
    fn is_tag_opener(&self) -> bool;

    fn is_tag_closer(&self) -> bool;

    fn is_empty_element(&self) -> bool;

    /// Decoded attributes of the current tag, in source order.
    fn attributes(&self) -> &[(String, String)];

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Decoded content of the current text or CDATA token.
    fn modifiable_text(&self) -> Option<&str>;

    /// Replace the content of the current text or CDATA token. Returns
    /// `false` when the current token carries no text.
    fn set_modifiable_text(&mut self, text: &str) -> bool;

    /// Names of the open elements. The current tag is included for openers
    /// and empty elements; a closer has already been popped.
    fn breadcrumbs(&self) -> &[String];

    fn is_finished(&self) -> bool;

    fn is_paused_at_incomplete_input(&self) -> bool;

    fn last_error(&self) -> Option<&str>;

    /// Capture a restart position. With `rewind_current` the current token
    /// is parsed again after resuming; otherwise parsing continues after it.
    fn pause(&self, rewind_current: bool) -> TokenizerCursor;

    /// Reset to a captured position. Bytes from `cursor.byte_offset` onward
    /// must be appended next.
    fn resume(&mut self, cursor: &TokenizerCursor);
}

// ---------------------------------------------------------------------------
// QuickXmlTokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Token {
    kind: XmlTokenKind,
    start: usize,
    end: usize,
    tag: Option<String>,
    closer: bool,
    empty: bool,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    breadcrumbs_before: Vec<String>,
}

impl Token {
    fn markup(kind: XmlTokenKind, start: usize, end: usize) -> Self {
        Self {
            kind,
            start,
            end,
            tag: None,
            closer: false,
            empty: false,
            attributes: Vec::new(),
            text: None,
            breadcrumbs_before: Vec::new(),
        }
    }
}

/// [`XmlTokenizer`] backed by `quick-xml`.
///
/// Text runs are delimited here; every markup token is handed to a fresh
/// `quick_xml::Reader` positioned at its `<`, which keeps the adapter free
/// of parser state that could not be checkpointed. Consumed bytes are
/// discarded as input is appended, so memory stays bounded by the largest
/// single token.
///
/// With [`record_output`](QuickXmlTokenizer::record_output) enabled, every
/// token passed over is copied to an output buffer, with replacement text
/// substituted, which is how stream stages rewrite a document in flight.
#[derive(Debug, Default)]
pub struct QuickXmlTokenizer {
    buf: Vec<u8>,
    /// Document offset of `buf[0]`.
    base_offset: u64,
    /// End of the last consumed token, relative to `buf`.
    pos: usize,
    input_finished: bool,
    finished: bool,
    paused_incomplete: bool,
    error: Option<String>,
    breadcrumbs: Vec<String>,
    /// An empty element stays on the breadcrumb stack while it is current.
    pending_pop: bool,
    token: Option<Token>,
    record_output: bool,
    replacement: Option<Vec<u8>>,
    output: Vec<u8>,
}

impl QuickXmlTokenizer {
    /// A tokenizer expecting streamed input.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tokenizer over a complete document.
    pub fn from_str(xml: &str) -> Self {
        let mut tokenizer = Self::new();
        tokenizer.append_bytes(xml.as_bytes());
        tokenizer.input_finished();
        tokenizer
    }

    /// Copy every consumed token to the output buffer.
    pub fn record_output(mut self) -> Self {
        self.record_output = true;
        self
    }

    /// Take the bytes of all tokens consumed since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Bytes appended but not yet consumed by a token.
    pub fn pending_input(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn flush_current(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let replacement = self.replacement.take();
        if self.record_output {
            match replacement {
                Some(bytes) => self.output.extend_from_slice(&bytes),
                None => self.output.extend_from_slice(&self.buf[token.start..token.end]),
            }
        }
    }

    fn read_token(&mut self) -> Result<Option<Token>, String> {
        let start = self.pos;
        let rest = &self.buf[start..];

        if rest.is_empty() {
            if !self.input_finished {
                self.paused_incomplete = true;
            } else if let Some(open) = self.breadcrumbs.last() {
                return Err(format!("unexpected end of input inside <{open}>"));
            } else {
                self.finished = true;
            }
            return Ok(None);
        }

        if rest[0] != b'<' {
            let len = match rest.iter().position(|&b| b == b'<') {
                Some(len) => len,
                None if self.input_finished => rest.len(),
                None => {
                    self.paused_incomplete = true;
                    return Ok(None);
                }
            };
            let raw = String::from_utf8_lossy(&rest[..len]);
            let mut token = Token::markup(XmlTokenKind::Text, start, start + len);
            token.text = Some(html_escape::decode_html_entities(&raw).into_owned());
            return Ok(Some(token));
        }

        let mut reader = Reader::from_reader(rest);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.expand_empty_elements = false;

        let event = match reader.read_event() {
            Ok(event) => event,
            Err(_) if !self.input_finished => {
                self.paused_incomplete = true;
                return Ok(None);
            }
            Err(e) => return Err(format!("malformed XML at byte {}: {e}", self.base_offset + start as u64)),
        };
        let len = usize::try_from(reader.buffer_position()).unwrap_or(rest.len());
        let end = start + len.min(rest.len());

        let token = match event {
            Event::Start(e) => tag_token(&e, start, end)?,
            Event::Empty(e) => {
                let mut token = tag_token(&e, start, end)?;
                token.empty = true;
                token
            }
            Event::End(e) => {
                let mut token = Token::markup(XmlTokenKind::Tag, start, end);
                token.tag = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                token.closer = true;
                token
            }
            Event::CData(e) => {
                let mut token = Token::markup(XmlTokenKind::CData, start, end);
                token.text = Some(String::from_utf8_lossy(&e).into_owned());
                token
            }
            Event::Comment(_) => Token::markup(XmlTokenKind::Comment, start, end),
            Event::Decl(_) | Event::PI(_) => Token::markup(XmlTokenKind::ProcessingInstruction, start, end),
            Event::DocType(_) => Token::markup(XmlTokenKind::Doctype, start, end),
            _ => return Err(format!("unexpected token at byte {}", self.base_offset + start as u64)),
        };
        Ok(Some(token))
    }

    fn apply(&mut self, mut token: Token) -> Result<(), String> {
        token.breadcrumbs_before = self.breadcrumbs.clone();
        if token.kind == XmlTokenKind::Tag {
            let name = token.tag.clone().unwrap_or_default();
            if token.closer {
                match self.breadcrumbs.pop() {
                    Some(open) if open == name => {}
                    Some(open) => return Err(format!("closer </{name}> does not match <{open}>")),
                    None => return Err(format!("closer </{name}> without an open element")),
                }
            } else {
                self.breadcrumbs.push(name);
                self.pending_pop = token.empty;
            }
        }
        self.pos = token.end;
        self.token = Some(token);
        Ok(())
    }
}

fn tag_token(e: &BytesStart<'_>, start: usize, end: usize) -> Result<Token, String> {
    let mut token = Token::markup(XmlTokenKind::Tag, start, end);
    token.tag = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attribute in e.attributes().with_checks(false) {
        let attribute = attribute.map_err(|e| format!("malformed attribute: {e}"))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attribute.value);
        token
            .attributes
            .push((key, html_escape::decode_html_entities(&raw).into_owned()));
    }
    Ok(token)
}

fn encode_cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

impl XmlTokenizer for QuickXmlTokenizer {
    fn append_bytes(&mut self, bytes: &[u8]) {
        let keep_from = self.token.as_ref().map_or(self.pos, |token| token.start);
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.base_offset += keep_from as u64;
            self.pos -= keep_from;
            if let Some(token) = self.token.as_mut() {
                token.start -= keep_from;
                token.end -= keep_from;
            }
        }
        self.buf.extend_from_slice(bytes);
        self.paused_incomplete = false;
    }

    fn input_finished(&mut self) {
        self.input_finished = true;
        self.paused_incomplete = false;
    }

    fn next_token(&mut self) -> bool {
        if self.error.is_some() || self.finished {
            return false;
        }
        self.flush_current();
        if self.pending_pop {
            self.breadcrumbs.pop();
            self.pending_pop = false;
        }
        self.paused_incomplete = false;

        let outcome = self.read_token().and_then(|token| match token {
            Some(token) => self.apply(token).map(|()| true),
            None => Ok(false),
        });
        match outcome {
            Ok(advanced) => advanced,
            Err(message) => {
                self.error = Some(message);
                false
            }
        }
    }

    fn token_kind(&self) -> Option<XmlTokenKind> {
        self.token.as_ref().map(|token| token.kind)
    }

    fn tag(&self) -> Option<&str> {
        self.token.as_ref().and_then(|token| token.tag.as_deref())
    }

    fn is_tag_opener(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| token.kind == XmlTokenKind::Tag && !token.closer)
    }

    fn is_tag_closer(&self) -> bool {
        self.token.as_ref().is_some_and(|token| token.closer)
    }

    fn is_empty_element(&self) -> bool {
        self.token.as_ref().is_some_and(|token| token.empty)
    }

    fn attributes(&self) -> &[(String, String)] {
        self.token.as_ref().map_or(&[], |token| token.attributes.as_slice())
    }

    fn modifiable_text(&self) -> Option<&str> {
        self.token.as_ref().and_then(|token| token.text.as_deref())
    }

    fn set_modifiable_text(&mut self, text: &str) -> bool {
        let Some(token) = self.token.as_mut() else {
            return false;
        };
        let encoded = match token.kind {
            XmlTokenKind::Text => quick_xml::escape::escape(text).into_owned(),
            XmlTokenKind::CData => encode_cdata(text),
            _ => return false,
        };
        token.text = Some(text.to_string());
        self.replacement = Some(encoded.into_bytes());
        true
    }

    fn breadcrumbs(&self) -> &[String] {
        &self.breadcrumbs
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_paused_at_incomplete_input(&self) -> bool {
        self.paused_incomplete
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn pause(&self, rewind_current: bool) -> TokenizerCursor {
        match self.token.as_ref() {
            Some(token) if rewind_current => TokenizerCursor {
                byte_offset: self.base_offset + token.start as u64,
                breadcrumbs: token.breadcrumbs_before.clone(),
            },
            _ => {
                let mut breadcrumbs = self.breadcrumbs.clone();
                if self.pending_pop {
                    breadcrumbs.pop();
                }
                TokenizerCursor {
                    byte_offset: self.base_offset + self.pos as u64,
                    breadcrumbs,
                }
            }
        }
    }

    fn resume(&mut self, cursor: &TokenizerCursor) {
        *self = Self {
            base_offset: cursor.byte_offset,
            breadcrumbs: cursor.breadcrumbs.clone(),
            record_output: self.record_output,
            ..Self::default()
        };
    }
}
