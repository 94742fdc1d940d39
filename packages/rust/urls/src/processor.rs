//! Walks every URL in a piece of block markup and rewrites them in place.

use tracing::trace;
use url::Url;

use crate::decode::urldecode_n;
use crate::markup::{MarkupTokenKind, MarkupTokenizer};
use crate::text::UrlInTextProcessor;

/// HTML attributes whose values are URLs, per tag.
pub const URL_ATTRIBUTES: &[(&str, &[&str])] = &[
    ("A", &["href"]),
    ("APPLET", &["codebase", "archive"]),
    ("AREA", &["href"]),
    ("AUDIO", &["src"]),
    ("BASE", &["href"]),
    ("BLOCKQUOTE", &["cite"]),
    ("BODY", &["background"]),
    ("BUTTON", &["formaction"]),
    ("COMMAND", &["icon"]),
    ("DEL", &["cite"]),
    ("EMBED", &["src"]),
    ("FORM", &["action"]),
    ("FRAME", &["longdesc", "src"]),
    ("HEAD", &["profile"]),
    ("HTML", &["manifest"]),
    ("IFRAME", &["longdesc", "src"]),
    // SVG <image>
    ("IMAGE", &["href"]),
    ("IMG", &["longdesc", "src", "usemap", "lowsrc", "highsrc"]),
    ("INPUT", &["src", "usemap", "formaction"]),
    ("INS", &["cite"]),
    ("LINK", &["href"]),
    ("OBJECT", &["classid", "codebase", "data", "usemap"]),
    ("Q", &["cite"]),
    ("SCRIPT", &["src"]),
    ("SOURCE", &["src"]),
    ("TRACK", &["src"]),
    ("VIDEO", &["poster", "src"]),
];

/// URL-valued attributes of `tag` (upper-case).
pub fn url_attributes(tag: &str) -> &'static [&'static str] {
    for (name, attributes) in URL_ATTRIBUTES {
        if *name == tag {
            return attributes;
        }
    }
    &[]
}

/// Where a matched URL lives in the markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSource {
    TagAttribute { tag: String, attribute: String },
    BlockAttribute { block: String, pointer: String },
    TextNode,
}

#[derive(Debug, Clone)]
pub struct UrlToken {
    pub raw: String,
    pub parsed: Url,
    pub source: UrlSource,
}

impl UrlToken {
    /// Whether the match was written without a host, e.g. `/about` in an
    /// `href`. Text matches are always treated as absolute.
    fn is_relative(&self) -> bool {
        if self.source == UrlSource::TextNode {
            return false;
        }
        let lower = self.raw.trim_start().to_ascii_lowercase();
        !lower.starts_with("http://") && !lower.starts_with("https://") && !lower.starts_with("//")
    }

    fn is_protocol_relative(&self) -> bool {
        self.source != UrlSource::TextNode && self.raw.trim_start().starts_with("//")
    }
}

/// Reports every URL in tag attributes, block attributes and text nodes,
/// in document order, and rewrites them without disturbing the rest of
/// the markup.
pub struct UrlProcessor {
    tokenizer: MarkupTokenizer,
    base_url: Option<Url>,
    token: Option<UrlToken>,
    attribute_index: usize,
    block_pointers: Option<Vec<String>>,
    block_index: usize,
    text: Option<UrlInTextProcessor>,
    text_updated: bool,
}

impl UrlProcessor {
    pub fn new(markup: impl Into<String>, base_url: Option<&Url>) -> Self {
        Self {
            tokenizer: MarkupTokenizer::new(markup),
            base_url: base_url.cloned(),
            token: None,
            attribute_index: 0,
            block_pointers: None,
            block_index: 0,
            text: None,
            text_updated: false,
        }
    }

    pub fn next_url(&mut self) -> bool {
        loop {
            if self.next_url_in_current_token() {
                return true;
            }
            if !self.next_token() {
                return false;
            }
        }
    }

    pub fn raw_url(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.raw.as_str())
    }

    pub fn parsed_url(&self) -> Option<&Url> {
        self.token.as_ref().map(|t| &t.parsed)
    }

    pub fn token(&self) -> Option<&UrlToken> {
        self.token.as_ref()
    }

    pub fn token_kind(&self) -> Option<MarkupTokenKind> {
        self.tokenizer.token_kind()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tokenizer.tag()
    }

    pub fn inspected_attribute_name(&self) -> Option<&str> {
        match &self.token.as_ref()?.source {
            UrlSource::TagAttribute { attribute, .. } => Some(attribute),
            _ => None,
        }
    }

    /// Write `new_url` in place of the current match.
    pub fn set_raw_url(&mut self, new_url: &str) -> bool {
        let Some(token) = self.token.as_mut() else {
            return false;
        };
        let written = match &token.source {
            UrlSource::TagAttribute { attribute, .. } => {
                self.tokenizer.set_attribute(attribute, new_url)
            }
            UrlSource::BlockAttribute { pointer, .. } => {
                self.tokenizer.set_block_attribute(pointer, new_url)
            }
            UrlSource::TextNode => match self.text.as_mut() {
                Some(text) => {
                    self.text_updated = true;
                    text.set_raw_url(new_url)
                }
                None => false,
            },
        };
        if written {
            token.raw = new_url.to_string();
        }
        written
    }

    /// Move the current match from the base URL to `to`, keeping its
    /// relative or absolute shape.
    ///
    /// Scheme, host and port always come from `to`. When the base path
    /// differs from `to`'s path, only as many leading bytes of the matched
    /// path are decoded as needed to strip the base path, so escapes in the
    /// rest of the path survive untouched.
    pub fn replace_base_url(&mut self, to: &Url) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        let mut updated = token.parsed.clone();
        if !adopt_origin(&mut updated, to) {
            return false;
        }

        let base_path = self.base_url.as_ref().map_or("/", |b| b.path());
        if base_path != to.path() {
            let old_prefix = format!("{}/", base_path.trim_end_matches('/'));
            let decoded = urldecode_n(token.parsed.path(), old_prefix.len());
            let rest = decoded
                .as_bytes()
                .get(old_prefix.len()..)
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            updated.set_path(&format!("{}/{}", to.path().trim_end_matches('/'), rest));
        }

        let mut new_raw = updated.to_string();
        if !token.raw.ends_with('/')
            && new_raw.ends_with('/')
            && updated.query().is_none()
            && updated.fragment().is_none()
        {
            new_raw.pop();
        }

        let shaped = shape_like(token, &updated, new_raw);
        trace!(from = %token.raw, to = %shaped, "rewriting url");
        self.set_raw_url(&shaped)
    }

    /// Replace the current match with `to` entirely, keeping its relative
    /// or absolute shape.
    pub fn replace_url(&mut self, to: &Url) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        let shaped = shape_like(token, to, to.to_string());
        self.set_raw_url(&shaped)
    }

    /// The markup with every rewrite so far applied.
    pub fn updated_markup(&mut self) -> String {
        self.flush_text();
        self.tokenizer.updated_markup()
    }

    fn flush_text(&mut self) {
        if !self.text_updated {
            return;
        }
        self.text_updated = false;
        if let Some(text) = &self.text {
            let updated = text.updated_text();
            self.tokenizer.set_modifiable_text(&updated);
        }
    }

    fn next_token(&mut self) -> bool {
        self.flush_text();
        self.token = None;
        self.attribute_index = 0;
        self.block_pointers = None;
        self.block_index = 0;
        self.text = None;
        self.tokenizer.next_token()
    }

    fn next_url_in_current_token(&mut self) -> bool {
        self.token = None;
        match self.tokenizer.token_kind() {
            Some(MarkupTokenKind::Tag) => self.next_url_attribute(),
            Some(MarkupTokenKind::BlockComment) => self.next_url_block_attribute(),
            Some(MarkupTokenKind::Text) => self.next_url_in_text(),
            _ => false,
        }
    }

    /// Known URL attributes resolve against the base URL, so `plugins.php`
    /// in an `href` is a URL even though it would not be in text.
    fn next_url_attribute(&mut self) -> bool {
        let Some(tag) = self.tokenizer.tag().map(str::to_string) else {
            return false;
        };
        let attributes = url_attributes(&tag);

        while self.attribute_index < attributes.len() {
            let attribute = attributes[self.attribute_index];
            self.attribute_index += 1;

            let Some(value) = self.tokenizer.attribute(attribute) else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            let parsed = match &self.base_url {
                Some(base) => base.join(value),
                None => Url::parse(value),
            };
            let Ok(parsed) = parsed else {
                continue;
            };
            if !is_http(&parsed) {
                continue;
            }
            self.token = Some(UrlToken {
                raw: value.to_string(),
                parsed,
                source: UrlSource::TagAttribute {
                    tag: tag.clone(),
                    attribute: attribute.to_string(),
                },
            });
            return true;
        }
        false
    }

    /// Block attributes never use the base URL: any word would resolve
    /// against it, so only absolute URLs count.
    fn next_url_block_attribute(&mut self) -> bool {
        if self.block_pointers.is_none() {
            self.block_pointers = Some(self.tokenizer.block_string_pointers());
        }
        let block = self.tokenizer.block_name().unwrap_or_default().to_string();

        loop {
            let Some(pointer) = self
                .block_pointers
                .as_ref()
                .and_then(|pointers| pointers.get(self.block_index))
                .cloned()
            else {
                return false;
            };
            self.block_index += 1;

            let Some(value) = self
                .tokenizer
                .block_attributes()
                .and_then(|attributes| attributes.pointer(&pointer))
                .and_then(|value| value.as_str())
            else {
                continue;
            };
            let Ok(parsed) = Url::parse(value) else {
                continue;
            };
            if !is_http(&parsed) {
                continue;
            }
            self.token = Some(UrlToken {
                raw: value.to_string(),
                parsed,
                source: UrlSource::BlockAttribute {
                    block: block.clone(),
                    pointer,
                },
            });
            return true;
        }
    }

    fn next_url_in_text(&mut self) -> bool {
        if self.text.is_none() {
            self.text = Some(UrlInTextProcessor::new(
                self.tokenizer.modifiable_text(),
                self.base_url.as_ref(),
            ));
        }
        let Some(text) = self.text.as_mut() else {
            return false;
        };
        if !text.next_url() {
            return false;
        }
        let (Some(raw), Some(parsed)) = (text.raw_url(), text.parsed_url()) else {
            return false;
        };
        self.token = Some(UrlToken {
            raw: raw.to_string(),
            parsed: parsed.clone(),
            source: UrlSource::TextNode,
        });
        true
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|h| !h.is_empty())
}

/// Copy scheme, host and port from `to`.
fn adopt_origin(url: &mut Url, to: &Url) -> bool {
    url.set_scheme(to.scheme()).is_ok()
        && url.set_host(to.host_str()).is_ok()
        && url.set_port(to.port()).is_ok()
}

/// Render `url` the way the original match was written: a relative match
/// stays `path?query#fragment`, a protocol-relative one keeps `//host`.
fn shape_like(token: &UrlToken, url: &Url, absolute: String) -> String {
    if token.is_protocol_relative() {
        return match absolute.split_once(':') {
            Some((_, rest)) => rest.to_string(),
            None => absolute,
        };
    }
    if !token.is_relative() {
        return absolute;
    }
    let mut relative = url.path().to_string();
    if let Some(query) = url.query() {
        relative.push('?');
        relative.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        relative.push('#');
        relative.push_str(fragment);
    }
    relative
}
