//! Block markup scanning on top of `lol_html`.
//!
//! [`MarkupTokenizer`] runs one `lol_html` pass over the markup and records
//! start tags, text nodes and comments in document order. Edits are keyed
//! by token and only applied by [`MarkupTokenizer::updated_markup`], which
//! runs a second pass over the same markup, so every token that was not
//! touched comes back byte-for-byte.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use lol_html::html_content::{ContentType, TextChunk, TextType};
use lol_html::{RewriteStrSettings, doc_comments, doc_text, element, rewrite_str};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

/// `wp:name {json}` inside a comment, optionally closing or self-closing.
static BLOCK_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^\s*(/)?wp:([a-z][a-z0-9_-]*(?:/[a-z][a-z0-9_-]*)?)\s*(\{.*\})?\s*(/)?\s*$",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupTokenKind {
    /// A start tag.
    Tag,
    /// A `<!-- wp:… -->` block delimiter.
    BlockComment,
    /// Any other comment.
    Comment,
    Text,
    /// Contents of `SCRIPT`, `STYLE`, `TEXTAREA`, `TITLE` and the like.
    RawText,
}

#[derive(Debug, Clone)]
struct BlockToken {
    name: String,
    closer: bool,
    json_span: Option<(usize, usize)>,
    attributes: Option<Value>,
}

#[derive(Debug, Clone)]
struct Token {
    kind: MarkupTokenKind,
    /// Upper-cased tag name.
    tag: Option<String>,
    /// Lower-cased names with entity-decoded values, first occurrence wins.
    attributes: Vec<(String, String)>,
    /// Decoded text for text nodes, raw contents otherwise.
    text: String,
    block: Option<BlockToken>,
}

impl Token {
    fn new(kind: MarkupTokenKind) -> Self {
        Self {
            kind,
            tag: None,
            attributes: Vec::new(),
            text: String::new(),
            block: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Edit {
    Attributes(Vec<(String, String)>),
    Text(String),
    Comment(String),
}

/// Assigns token indices the same way in the scan and rewrite passes.
#[derive(Default)]
struct TokenCounter {
    next: Cell<usize>,
    open_text: Cell<Option<usize>>,
}

impl TokenCounter {
    fn next_node(&self) -> usize {
        self.open_text.set(None);
        let index = self.next.get();
        self.next.set(index + 1);
        index
    }

    /// Index of the text node `chunk` belongs to, and whether the chunk
    /// opens it. Empty chunks outside a node are not tokens.
    fn text(&self, chunk: &TextChunk<'_>) -> Option<(usize, bool)> {
        let (index, first) = match self.open_text.get() {
            Some(index) => (index, false),
            None if chunk.as_str().is_empty() => return None,
            None => {
                let index = self.next_node();
                self.open_text.set(Some(index));
                (index, true)
            }
        };
        if chunk.last_in_text_node() {
            self.open_text.set(None);
        }
        Some((index, first))
    }
}

/// Pull-based view over a markup string's tokens with deferred rewriting.
#[derive(Debug, Clone)]
pub struct MarkupTokenizer {
    markup: String,
    tokens: Vec<Token>,
    current: Option<usize>,
    edits: BTreeMap<usize, Edit>,
}

impl MarkupTokenizer {
    pub fn new(markup: impl Into<String>) -> Self {
        let markup = markup.into();
        let tokens = scan(&markup);
        Self {
            markup,
            tokens,
            current: None,
            edits: BTreeMap::new(),
        }
    }

    pub fn next_token(&mut self) -> bool {
        let next = self.current.map_or(0, |index| index + 1);
        if next < self.tokens.len() {
            self.current = Some(next);
            true
        } else {
            self.current = Some(self.tokens.len());
            false
        }
    }

    pub fn token_kind(&self) -> Option<MarkupTokenKind> {
        self.token().map(|t| t.kind)
    }

    /// Upper-cased tag name of the current tag token.
    pub fn tag(&self) -> Option<&str> {
        self.token()?.tag.as_deref()
    }

    /// Entity-decoded attribute value. Boolean attributes read as `""`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.token()?
            .attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace an existing attribute's value on the current tag.
    pub fn set_attribute(&mut self, name: &str, value: &str) -> bool {
        let Some(index) = self.current else {
            return false;
        };
        let Some(token) = self.tokens.get_mut(index) else {
            return false;
        };
        let Some((attr_name, attr_value)) = token
            .attributes
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        else {
            return false;
        };
        *attr_value = value.to_string();
        let attr_name = attr_name.clone();

        let edit = self
            .edits
            .entry(index)
            .or_insert_with(|| Edit::Attributes(Vec::new()));
        if let Edit::Attributes(values) = edit {
            match values.iter_mut().find(|(n, _)| *n == attr_name) {
                Some((_, existing)) => *existing = value.to_string(),
                None => values.push((attr_name, value.to_string())),
            }
        }
        true
    }

    /// Decoded text of a text node, or the raw contents of comments and
    /// raw-text elements.
    pub fn modifiable_text(&self) -> String {
        self.token().map(|t| t.text.clone()).unwrap_or_default()
    }

    /// Replace the contents of the current text node.
    pub fn set_modifiable_text(&mut self, text: &str) -> bool {
        let Some(index) = self.current else {
            return false;
        };
        match self.tokens.get_mut(index) {
            Some(token) if token.kind == MarkupTokenKind::Text => {
                token.text = text.to_string();
                self.edits.insert(index, Edit::Text(text.to_string()));
                true
            }
            _ => false,
        }
    }

    /// Block name of the current block delimiter, without the `wp:` prefix.
    pub fn block_name(&self) -> Option<&str> {
        self.current_block().map(|b| b.name.as_str())
    }

    pub fn is_block_closer(&self) -> bool {
        self.current_block().is_some_and(|b| b.closer)
    }

    pub fn block_attributes(&self) -> Option<&Value> {
        self.current_block()?.attributes.as_ref()
    }

    /// JSON pointers to every string leaf of the current block's
    /// attributes, in document order.
    pub fn block_string_pointers(&self) -> Vec<String> {
        let mut pointers = Vec::new();
        if let Some(attributes) = self.block_attributes() {
            collect_string_pointers(attributes, String::new(), &mut pointers);
        }
        pointers
    }

    /// Replace one string leaf of the current block's attributes and
    /// re-serialize the attribute object.
    pub fn set_block_attribute(&mut self, pointer: &str, value: &str) -> bool {
        let Some(index) = self.current else {
            return false;
        };
        let Some(token) = self.tokens.get_mut(index) else {
            return false;
        };
        let Some(block) = token.block.as_mut() else {
            return false;
        };
        let (Some((start, end)), Some(attributes)) = (block.json_span, block.attributes.as_mut())
        else {
            return false;
        };
        let Some(leaf) = attributes.pointer_mut(pointer) else {
            return false;
        };
        *leaf = Value::String(value.to_string());

        let Ok(serialized) = serde_json::to_string(attributes) else {
            return false;
        };
        let text = format!(
            "{}{}{}",
            &token.text[..start],
            escape_block_json(&serialized),
            &token.text[end..]
        );
        self.edits.insert(index, Edit::Comment(text));
        true
    }

    /// The markup with every recorded edit applied.
    pub fn updated_markup(&self) -> String {
        if self.edits.is_empty() {
            return self.markup.clone();
        }
        match apply_edits(&self.markup, &self.edits) {
            Ok(markup) => markup,
            Err(e) => {
                warn!(error = %e, "failed to apply markup edits; keeping the original");
                self.markup.clone()
            }
        }
    }

    fn token(&self) -> Option<&Token> {
        self.tokens.get(self.current?)
    }

    fn current_block(&self) -> Option<&BlockToken> {
        self.token()?.block.as_ref()
    }
}

fn scan(markup: &str) -> Vec<Token> {
    let tokens: RefCell<Vec<Token>> = RefCell::new(Vec::new());
    let counter = TokenCounter::default();

    let result = rewrite_str(
        markup,
        RewriteStrSettings {
            element_content_handlers: vec![element!("*", |el| {
                counter.next_node();
                let mut token = Token::new(MarkupTokenKind::Tag);
                token.tag = Some(el.tag_name().to_ascii_uppercase());
                for attr in el.attributes() {
                    let name = attr.name().to_ascii_lowercase();
                    if token.attributes.iter().all(|(n, _)| *n != name) {
                        let value = html_escape::decode_html_entities(&attr.value()).into_owned();
                        token.attributes.push((name, value));
                    }
                }
                tokens.borrow_mut().push(token);
                Ok(())
            })],
            document_content_handlers: vec![
                doc_text!(|chunk| {
                    let Some((index, first)) = counter.text(chunk) else {
                        return Ok(());
                    };
                    let mut tokens = tokens.borrow_mut();
                    if first {
                        let kind = if chunk.text_type() == TextType::Data {
                            MarkupTokenKind::Text
                        } else {
                            MarkupTokenKind::RawText
                        };
                        tokens.push(Token::new(kind));
                    }
                    if let Some(token) = tokens.get_mut(index) {
                        token.text.push_str(chunk.as_str());
                    }
                    Ok(())
                }),
                doc_comments!(|comment| {
                    counter.next_node();
                    tokens.borrow_mut().push(comment_token(comment.text()));
                    Ok(())
                }),
            ],
            strict: false,
            ..RewriteStrSettings::default()
        },
    );
    if let Err(e) = result {
        warn!(error = %e, "failed to scan markup");
    }

    let mut tokens = tokens.into_inner();
    for token in &mut tokens {
        if token.kind == MarkupTokenKind::Text {
            token.text = html_escape::decode_html_entities(&token.text).into_owned();
        }
    }
    tokens
}

fn apply_edits(
    markup: &str,
    edits: &BTreeMap<usize, Edit>,
) -> Result<String, lol_html::errors::RewritingError> {
    let counter = TokenCounter::default();

    rewrite_str(
        markup,
        RewriteStrSettings {
            element_content_handlers: vec![element!("*", |el| {
                if let Some(Edit::Attributes(values)) = edits.get(&counter.next_node()) {
                    for (name, value) in values {
                        el.set_attribute(name, &html_escape::encode_double_quoted_attribute(value))?;
                    }
                }
                Ok(())
            })],
            document_content_handlers: vec![
                doc_text!(|chunk| {
                    let Some((index, first)) = counter.text(chunk) else {
                        return Ok(());
                    };
                    if let Some(Edit::Text(text)) = edits.get(&index) {
                        if first {
                            chunk.replace(&html_escape::encode_text(text), ContentType::Html);
                        } else {
                            chunk.remove();
                        }
                    }
                    Ok(())
                }),
                doc_comments!(|comment| {
                    if let Some(Edit::Comment(text)) = edits.get(&counter.next_node()) {
                        comment.set_text(text)?;
                    }
                    Ok(())
                }),
            ],
            strict: false,
            ..RewriteStrSettings::default()
        },
    )
}

fn comment_token(text: String) -> Token {
    let block = BLOCK_COMMENT_RE.captures(&text).map(|caps| {
        let json = caps.get(3);
        BlockToken {
            name: caps.get(2).map_or("", |m| m.as_str()).to_string(),
            closer: caps.get(1).is_some(),
            json_span: json.map(|m| (m.start(), m.end())),
            attributes: json.and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok()),
        }
    });
    let mut token = Token::new(if block.is_some() {
        MarkupTokenKind::BlockComment
    } else {
        MarkupTokenKind::Comment
    });
    token.text = text;
    token.block = block;
    token
}

fn collect_string_pointers(value: &Value, path: String, out: &mut Vec<String>) {
    match value {
        Value::String(_) => out.push(path),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_string_pointers(item, format!("{path}/{index}"), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_string_pointers(item, format!("{path}/{escaped}"), out);
            }
        }
        _ => {}
    }
}

/// Keep serialized attributes from terminating the comment or being read
/// as markup.
fn escape_block_json(json: &str) -> String {
    json.replace("--", "\\u002d\\u002d")
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(markup: &str) -> Vec<(MarkupTokenKind, String)> {
        let mut tokenizer = MarkupTokenizer::new(markup);
        let mut out = Vec::new();
        while tokenizer.next_token() {
            let label = match tokenizer.token_kind() {
                Some(MarkupTokenKind::Tag) => tokenizer.tag().unwrap_or("").to_string(),
                Some(MarkupTokenKind::BlockComment) => tokenizer.block_name().unwrap_or("").to_string(),
                _ => tokenizer.modifiable_text(),
            };
            out.push((tokenizer.token_kind().unwrap(), label));
        }
        out
    }

    #[test]
    fn tokenizes_tags_text_and_comments() {
        let tokens = kinds("<p class=x>Hi &amp; bye<!-- note --></p>");
        assert_eq!(
            tokens,
            vec![
                (MarkupTokenKind::Tag, "P".to_string()),
                (MarkupTokenKind::Text, "Hi & bye".to_string()),
                (MarkupTokenKind::Comment, " note ".to_string()),
            ]
        );
    }

    #[test]
    fn script_contents_are_raw_text() {
        let tokens = kinds("<script>if (a < b) { x(); }</script>after");
        assert_eq!(tokens[1], (MarkupTokenKind::RawText, "if (a < b) { x(); }".to_string()));
        assert_eq!(tokens[2], (MarkupTokenKind::Text, "after".to_string()));
    }

    #[test]
    fn stray_angle_brackets_stay_in_text() {
        let tokens = kinds("1 < 2 and 3 > 2");
        assert_eq!(tokens, vec![(MarkupTokenKind::Text, "1 < 2 and 3 > 2".to_string())]);

        let tokens = kinds("ab<br/>cd");
        assert_eq!(tokens[1], (MarkupTokenKind::Tag, "BR".to_string()));
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn unterminated_bang_with_multibyte_text() {
        let mut tokenizer = MarkupTokenizer::new("<!é");
        while tokenizer.next_token() {
            let _ = tokenizer.modifiable_text();
        }
        assert_eq!(tokenizer.updated_markup(), "<!é");

        let mut tokenizer = MarkupTokenizer::new("<p>né</p><?é");
        tokenizer.next_token();
        tokenizer.next_token();
        assert!(tokenizer.set_modifiable_text("à"));
        while tokenizer.next_token() {
            let _ = tokenizer.modifiable_text();
        }
        assert!(tokenizer.updated_markup().starts_with("<p>à</p>"));
    }

    #[test]
    fn reads_decoded_attributes() {
        let mut tokenizer = MarkupTokenizer::new(r#"<img SRC='/a.png?x=1&amp;y=2' alt=plain hidden>"#);
        assert!(tokenizer.next_token());
        assert_eq!(tokenizer.tag(), Some("IMG"));
        assert_eq!(tokenizer.attribute("src"), Some("/a.png?x=1&y=2"));
        assert_eq!(tokenizer.attribute("alt"), Some("plain"));
        assert_eq!(tokenizer.attribute("hidden"), Some(""));
        assert_eq!(tokenizer.attribute("title"), None);
    }

    #[test]
    fn attribute_edits_leave_the_rest_untouched() {
        let markup = r#"<p>keep  <b>this</b></p><a class="x" href='old'>link</a>"#;
        let mut tokenizer = MarkupTokenizer::new(markup);
        while tokenizer.next_token() {
            if tokenizer.tag() == Some("A") {
                assert!(tokenizer.set_attribute("href", "/new?a=1&b=\"2\""));
                assert!(tokenizer.set_attribute("href", "/newer"));
                assert_eq!(tokenizer.attribute("href"), Some("/newer"));
            }
        }
        assert_eq!(
            tokenizer.updated_markup(),
            r#"<p>keep  <b>this</b></p><a class="x" href="/newer">link</a>"#
        );
    }

    #[test]
    fn text_edits_are_escaped() {
        let mut tokenizer = MarkupTokenizer::new("<p>old</p><p>other</p>");
        tokenizer.next_token();
        tokenizer.next_token();
        assert!(tokenizer.set_modifiable_text("a < b & c"));
        assert_eq!(tokenizer.updated_markup(), "<p>a &lt; b &amp; c</p><p>other</p>");
    }

    #[test]
    fn parses_block_delimiters() {
        let mut tokenizer = MarkupTokenizer::new(
            r#"<!-- wp:core/image {"url":"https://a.test/x.png","sizes":["https://a.test/s.png"],"id":4} /--><!-- /wp:paragraph -->"#,
        );
        assert!(tokenizer.next_token());
        assert_eq!(tokenizer.token_kind(), Some(MarkupTokenKind::BlockComment));
        assert_eq!(tokenizer.block_name(), Some("core/image"));
        assert_eq!(tokenizer.block_string_pointers(), vec!["/url", "/sizes/0"]);

        assert!(tokenizer.next_token());
        assert!(tokenizer.is_block_closer());
        assert_eq!(tokenizer.block_name(), Some("paragraph"));
        assert!(tokenizer.block_attributes().is_none());
    }

    #[test]
    fn block_attribute_edits_reserialize_json() {
        let mut tokenizer =
            MarkupTokenizer::new(r#"<!-- wp:image {"src": "http://old.test/a.png", "alt": "x"} --><p>x</p>"#);
        tokenizer.next_token();
        assert!(tokenizer.set_block_attribute("/src", "https://new.test/<a>--b&c"));
        assert_eq!(
            tokenizer.updated_markup(),
            r#"<!-- wp:image {"src":"https://new.test/\u003ca\u003e\u002d\u002db\u0026c","alt":"x"} --><p>x</p>"#
        );
    }
}
