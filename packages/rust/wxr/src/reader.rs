//! Streaming WXR entity reader.
//!
//! [`EntityReader`] turns a WXR document, fed in chunks of any size, into a
//! sequence of [`Entity`] values: site options, users, posts, post meta,
//! comments, comment meta, terms, tags and categories. Entity boundaries
//! are discovered from the `rss > channel` element structure:
//!
//! ```text
//! <rss><channel>
//!   <title>My site</title>                 -> site_option blogname
//!   <wp:author>...</wp:author>             -> user
//!   <item>                                 -> post
//!     <title>Hello</title>
//!     <wp:postmeta>...</wp:postmeta>       -> post_meta
//!     <wp:comment>...</wp:comment>         -> comment
//!   </item>
//! </channel></rss>
//! ```
//!
//! Nested entities are emitted flat, in document order. A post is emitted
//! as soon as its first nested entity starts, so post fields that appear
//! after a nested `wp:postmeta` or `wp:comment` are dropped.
//!
//! The reader never needs the whole document: when a token is cut off by a
//! chunk boundary it reports [`ReadError::IncompleteInput`] and picks up
//! where it left off once more bytes are appended. [`EntityReader::pause`]
//! captures a [`ReaderCursor`] from which a fresh reader continues with the
//! same entities.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use datalib_shared::{DatalibError, Entity, EntityKind, Fields, TermAssociation};

use crate::schema::{canonical_tag, entity_schema, site_option_name};
use crate::tokenizer::{QuickXmlTokenizer, TokenizerCursor, XmlTokenKind, XmlTokenizer};

/// Why [`EntityReader::try_next_entity`] did not produce an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// More bytes are needed. Append them and call again.
    #[error("incomplete input")]
    IncompleteInput,

    /// The document is not well-formed XML.
    #[error("malformed WXR: {0}")]
    Syntax(String),

    /// The document is XML but not a WXR export.
    #[error("not a WXR export: {0}")]
    UnexpectedRoot(String),
}

impl From<ReadError> for DatalibError {
    fn from(err: ReadError) -> Self {
        DatalibError::parse(err.to_string())
    }
}

/// Serializable reader checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderCursor {
    pub tokenizer: TokenizerCursor,
    #[serde(default)]
    pub entity_tag: Option<String>,
    #[serde(default)]
    pub entity: Option<Entity>,
    #[serde(default)]
    pub entity_finished: bool,
    #[serde(default)]
    pub text_buffer: String,
    #[serde(default)]
    pub last_opener_attributes: Vec<(String, String)>,
    #[serde(default)]
    pub last_post_id: Option<String>,
    #[serde(default)]
    pub last_comment_id: Option<String>,
}

impl ReaderCursor {
    /// Document offset from which bytes must be fed after resuming.
    pub fn byte_offset(&self) -> u64 {
        self.tokenizer.byte_offset
    }
}

enum Step {
    Continue,
    Emit,
}

/// Pull-based WXR reader. See the module docs for the entity model.
pub struct EntityReader<T: XmlTokenizer = QuickXmlTokenizer> {
    xml: T,
    /// Element that opened the entity being accumulated.
    entity_tag: Option<String>,
    entity: Option<Entity>,
    entity_finished: bool,
    text_buffer: String,
    last_opener_attributes: Vec<(String, String)>,
    last_post_id: Option<String>,
    last_comment_id: Option<String>,
    /// The entity was emitted on the opener of the next one, which has not
    /// been processed yet.
    reprocess_current: bool,
    failure: Option<ReadError>,
    warnings: Vec<String>,
}

impl EntityReader<QuickXmlTokenizer> {
    /// A reader over a complete document.
    pub fn from_str(wxr: &str) -> Self {
        Self::with_tokenizer(QuickXmlTokenizer::from_str(wxr))
    }

    /// A reader for streamed input; feed it with [`append_bytes`](Self::append_bytes).
    pub fn new() -> Self {
        Self::with_tokenizer(QuickXmlTokenizer::new())
    }
}

impl Default for EntityReader<QuickXmlTokenizer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: XmlTokenizer> EntityReader<T> {
    pub fn with_tokenizer(xml: T) -> Self {
        Self {
            xml,
            entity_tag: None,
            entity: None,
            entity_finished: false,
            text_buffer: String::new(),
            last_opener_attributes: Vec::new(),
            last_post_id: None,
            last_comment_id: None,
            reprocess_current: false,
            failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.xml.append_bytes(bytes);
    }

    pub fn input_finished(&mut self) {
        self.xml.input_finished();
    }

    pub fn is_finished(&self) -> bool {
        self.xml.is_finished()
    }

    pub fn is_paused_at_incomplete_input(&self) -> bool {
        self.failure.is_none() && self.xml.is_paused_at_incomplete_input()
    }

    pub fn last_error(&self) -> Option<&ReadError> {
        self.failure.as_ref()
    }

    /// Kind of the most recently emitted entity.
    pub fn entity_type(&self) -> Option<EntityKind> {
        self.entity().map(Entity::kind)
    }

    /// The most recently emitted entity.
    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref().filter(|_| self.entity_finished)
    }

    pub fn entity_data(&self) -> Option<&Fields> {
        self.entity().map(Entity::fields)
    }

    /// `ID` of the most recent post, for parenting comments and meta.
    pub fn last_post_id(&self) -> Option<&str> {
        self.last_post_id.as_deref()
    }

    pub fn last_comment_id(&self) -> Option<&str> {
        self.last_comment_id.as_deref()
    }

    /// Recoverable oddities seen since the last call, such as unmapped
    /// elements inside an entity.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Advance to the next entity. `false` covers the end of the document,
    /// incomplete input and errors alike.
    pub fn next_entity(&mut self) -> bool {
        matches!(self.try_next_entity(), Ok(Some(_)))
    }

    /// Advance to the next entity.
    ///
    /// Returns `Ok(None)` once the document is exhausted and
    /// `Err(ReadError::IncompleteInput)` when more bytes are needed. Hard
    /// errors are sticky.
    pub fn try_next_entity(&mut self) -> Result<Option<&Entity>, ReadError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.entity_finished {
            self.after_entity();
        }

        loop {
            if self.reprocess_current {
                self.reprocess_current = false;
            } else if !self.xml.next_token() {
                break;
            }
            match self.process_token() {
                Ok(Step::Continue) => {}
                Ok(Step::Emit) => return Ok(self.entity.as_ref()),
                Err(err) => return Err(self.fail(err)),
            }
        }

        if let Some(message) = self.xml.last_error() {
            let err = ReadError::Syntax(message.to_string());
            return Err(self.fail(err));
        }
        if self.xml.is_paused_at_incomplete_input() {
            return Err(ReadError::IncompleteInput);
        }
        if self.xml.is_finished() && self.entity.is_some() && !self.entity_finished {
            self.emit_entity();
            return Ok(self.entity.as_ref());
        }
        Ok(None)
    }

    /// Capture the position right after the most recently emitted entity,
    /// or right after the last consumed token when paused mid-entity.
    pub fn pause(&self) -> ReaderCursor {
        ReaderCursor {
            tokenizer: self.xml.pause(self.reprocess_current),
            entity_tag: self.entity_tag.clone(),
            entity: self.entity.clone(),
            entity_finished: self.entity_finished,
            text_buffer: self.text_buffer.clone(),
            last_opener_attributes: self.last_opener_attributes.clone(),
            last_post_id: self.last_post_id.clone(),
            last_comment_id: self.last_comment_id.clone(),
        }
    }

    /// Offset a cursor taken now would resume from.
    pub fn byte_offset(&self) -> u64 {
        self.xml.pause(self.reprocess_current).byte_offset
    }

    /// Restore a checkpoint. Feed bytes from [`ReaderCursor::byte_offset`]
    /// onward afterwards.
    pub fn resume(&mut self, cursor: &ReaderCursor) {
        self.xml.resume(&cursor.tokenizer);
        self.entity_tag = cursor.entity_tag.clone();
        self.entity = cursor.entity.clone();
        self.entity_finished = cursor.entity_finished;
        self.text_buffer = cursor.text_buffer.clone();
        self.last_opener_attributes = cursor.last_opener_attributes.clone();
        self.last_post_id = cursor.last_post_id.clone();
        self.last_comment_id = cursor.last_comment_id.clone();
        self.reprocess_current = false;
        self.failure = None;
        self.warnings.clear();
    }

    // -- token processing -------------------------------------------------

    fn process_token(&mut self) -> Result<Step, ReadError> {
        if self.xml.is_tag_opener() {
            check_structure(self.xml.breadcrumbs())?;
        }
        let crumbs = self.xml.breadcrumbs();
        if crumbs.len() < 2 || crumbs[0] != "rss" || crumbs[1] != "channel" {
            return Ok(Step::Continue);
        }

        match self.xml.token_kind() {
            Some(XmlTokenKind::Text | XmlTokenKind::CData) => {
                if let Some(text) = self.xml.modifiable_text() {
                    self.text_buffer.push_str(text);
                }
                return Ok(Step::Continue);
            }
            Some(XmlTokenKind::Tag) => {}
            _ => return Ok(Step::Continue),
        }

        let Some(tag) = self.xml.tag() else {
            return Ok(Step::Continue);
        };
        let tag = canonical_tag(tag).to_string();

        if let Some(schema) = entity_schema(&tag) {
            if self.entity.is_some() && !self.entity_finished {
                self.emit_entity();
                // An opener starts the next entity on the following call.
                self.reprocess_current = self.xml.is_tag_opener();
                return Ok(Step::Emit);
            }
            self.after_entity();
            if self.xml.is_tag_opener() {
                self.entity_tag = Some(tag);
                self.entity = Some(Entity::new(schema.kind));
            }
            return Ok(Step::Continue);
        }

        if self.xml.is_tag_opener() {
            self.last_opener_attributes = self.xml.attributes().to_vec();
            self.text_buffer.clear();
            return Ok(Step::Continue);
        }
        if !self.xml.is_tag_closer() {
            return Ok(Step::Continue);
        }

        if self.xml.breadcrumbs().len() == 2 {
            return Ok(if self.parse_site_option(&tag) {
                Step::Emit
            } else {
                Step::Continue
            });
        }

        let Some(entity) = self.entity.as_mut() else {
            debug!(tag = %tag, "dropping field outside of an entity");
            return Ok(Step::Continue);
        };

        if entity.kind() == EntityKind::Post && tag == "category" {
            let taxonomy = opener_attribute(&self.last_opener_attributes, "domain");
            let slug = opener_attribute(&self.last_opener_attributes, "nicename");
            if taxonomy.is_none() || slug.is_none() {
                self.warnings
                    .push("<category> without domain or nicename attribute".to_string());
                warn!("<category> without domain or nicename attribute");
            }
            entity.push_term(TermAssociation {
                taxonomy: taxonomy.unwrap_or_default(),
                slug: slug.unwrap_or_default(),
                description: std::mem::take(&mut self.text_buffer),
            });
            return Ok(Step::Continue);
        }

        let field = self
            .entity_tag
            .as_deref()
            .and_then(entity_schema)
            .and_then(|schema| schema.field(&tag));
        match field {
            Some(field) => entity.set(field, std::mem::take(&mut self.text_buffer)),
            None => {
                let entity_tag = self.entity_tag.as_deref().unwrap_or_default();
                warn!(tag = %tag, entity = %entity_tag, "unknown WXR element");
                self.warnings
                    .push(format!("unknown element <{tag}> in <{entity_tag}>"));
            }
        }
        Ok(Step::Continue)
    }

    fn parse_site_option(&mut self, tag: &str) -> bool {
        let Some(option_name) = site_option_name(tag) else {
            return false;
        };
        let entity = Entity::new(EntityKind::SiteOption)
            .with_field("option_name", option_name)
            .with_field("option_value", std::mem::take(&mut self.text_buffer));
        self.entity_tag = None;
        self.entity = Some(entity);
        self.emit_entity();
        true
    }

    fn emit_entity(&mut self) {
        let Some(entity) = self.entity.as_mut() else {
            return;
        };
        match entity.kind() {
            EntityKind::Post => self.last_post_id = entity.get("ID").map(str::to_string),
            EntityKind::Comment => {
                self.last_comment_id = entity.get("comment_id").map(str::to_string);
            }
            EntityKind::Tag => entity.set("taxonomy", "post_tag"),
            EntityKind::Category => entity.set("taxonomy", "category"),
            _ => {}
        }
        debug!(kind = %entity.kind(), fields = entity.fields().len(), "entity emitted");
        self.entity_finished = true;
    }

    fn after_entity(&mut self) {
        self.entity_tag = None;
        self.entity = None;
        self.entity_finished = false;
        self.text_buffer.clear();
        self.last_opener_attributes.clear();
    }

    fn fail(&mut self, err: ReadError) -> ReadError {
        warn!(error = %err, "WXR reader stopped");
        self.failure = Some(err.clone());
        err
    }
}

/// The root must be `<rss>` and its only element child `<channel>`.
fn check_structure(crumbs: &[String]) -> Result<(), ReadError> {
    match crumbs {
        [root] if root != "rss" => Err(ReadError::UnexpectedRoot(format!(
            "root element is <{root}>, expected <rss>"
        ))),
        [_, child] if child != "channel" => Err(ReadError::UnexpectedRoot(format!(
            "<rss> child is <{child}>, expected <channel>"
        ))),
        _ => Ok(()),
    }
}

fn opener_attribute(attributes: &[(String, String)], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = include_str!("../../../../fixtures/wxr/simple.xml");

    fn read_all(reader: &mut EntityReader) -> Vec<Entity> {
        let mut entities = Vec::new();
        while let Ok(Some(entity)) = reader.try_next_entity() {
            entities.push(entity.clone());
        }
        entities
    }

    fn read_chunked(wxr: &str, chunk_size: usize) -> Vec<Entity> {
        let mut reader = EntityReader::new();
        let mut chunks = wxr.as_bytes().chunks(chunk_size);
        let mut entities = Vec::new();
        loop {
            match reader.try_next_entity() {
                Ok(Some(entity)) => entities.push(entity.clone()),
                Ok(None) => break,
                Err(ReadError::IncompleteInput) => match chunks.next() {
                    Some(chunk) => reader.append_bytes(chunk),
                    None => reader.input_finished(),
                },
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        entities
    }

    fn wxr(channel: &str) -> String {
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss>\n<channel>\n{channel}\n</channel>\n</rss>\n")
    }

    #[test]
    fn reads_simple_export() {
        let mut reader = EntityReader::from_str(SIMPLE);

        let expected_options = [
            ("blogname", "My WordPress Website"),
            ("siteurl", "https://playground.internal/path"),
            ("home", "https://playground.internal/path"),
        ];
        for (name, value) in expected_options {
            assert!(reader.next_entity());
            assert_eq!(reader.entity_type(), Some(EntityKind::SiteOption));
            let data = reader.entity_data().unwrap();
            assert_eq!(data.get("option_name"), Some(name));
            assert_eq!(data.get("option_value"), Some(value));
        }

        assert!(reader.next_entity());
        let user = reader.entity().unwrap();
        assert_eq!(user.kind(), EntityKind::User);
        assert_eq!(user.get("ID"), Some("1"));
        assert_eq!(user.get("user_login"), Some("admin"));
        assert_eq!(user.get("user_email"), Some("admin@localhost.com"));
        assert_eq!(user.get("first_name"), Some(""));

        assert!(reader.next_entity());
        let post = reader.entity().unwrap();
        assert_eq!(post.kind(), EntityKind::Post);
        assert_eq!(post.get("post_title"), Some("\"The Road Not Taken\" by Robert Frost"));
        assert_eq!(post.get("ID"), Some("10"));
        assert_eq!(post.get("guid"), Some("https://playground.internal/path/?p=1"));
        assert_eq!(post.get("post_published_at"), Some("Wed, 05 Jun 2024 16:04:48 +0000"));
        assert_eq!(post.get("post_author"), Some("admin"));
        assert_eq!(post.get("post_excerpt"), Some(""));
        assert_eq!(post.get("post_status"), Some("publish"));
        assert_eq!(post.get("is_sticky"), Some("0"));
        let content = post.get("post_content").unwrap();
        assert!(content.starts_with("<!-- wp:paragraph -->\n<p>Two roads diverged"));
        assert!(content.ends_with("<!-- /wp:paragraph -->"));
        assert_eq!(
            post.terms(),
            &[TermAssociation {
                taxonomy: "category".into(),
                slug: "uncategorized".into(),
                description: "Uncategorized".into(),
            }]
        );
        assert_eq!(reader.last_post_id(), Some("10"));

        for key in ["_pingme", "_encloseme"] {
            assert!(reader.next_entity());
            let meta = reader.entity().unwrap();
            assert_eq!(meta.kind(), EntityKind::PostMeta);
            assert_eq!(meta.get("meta_key"), Some(key));
            assert_eq!(meta.get("meta_value"), Some("1"));
        }

        assert!(!reader.next_entity());
        assert!(reader.is_finished());
        assert!(reader.take_warnings().is_empty());
    }

    #[test]
    fn entities_do_not_depend_on_chunk_boundaries() {
        let whole = read_all(&mut EntityReader::from_str(SIMPLE));
        assert_eq!(whole.len(), 7);
        for chunk_size in [1, 2, 3, 7, 10, 64, 1000] {
            assert_eq!(read_chunked(SIMPLE, chunk_size), whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn streamed_tag_joins_text_and_cdata() {
        let doc = wxr(
            "<wp:tag>\n\
               <wp:term_id>651</wp:term_id>\n\
               <wp:tag_slug>articles</wp:tag_slug>\n\
               <wp:tag_name><![CDATA[Articles]]> for <![CDATA[everyone]]></wp:tag_name>\n\
               <wp:tag_description><![CDATA[Tags posts about Articles.]]></wp:tag_description>\n\
             </wp:tag>",
        );
        let entities = read_chunked(&doc, 10);
        assert_eq!(entities.len(), 1);
        let tag = &entities[0];
        assert_eq!(tag.kind(), EntityKind::Tag);
        assert_eq!(tag.get("term_id"), Some("651"));
        assert_eq!(tag.get("slug"), Some("articles"));
        assert_eq!(tag.get("name"), Some("Articles for everyone"));
        assert_eq!(tag.get("description"), Some("Tags posts about Articles."));
        assert_eq!(tag.get("taxonomy"), Some("post_tag"));
    }

    #[test]
    fn reads_attachments_and_their_meta() {
        let doc = wxr(
            "<item>\n\
               <title>vneck-tee-2.jpg</title>\n\
               <link>https://stylish-press.wordpress.org/?attachment_id=31</link>\n\
               <guid isPermaLink=\"false\">https://example.com/vneck-tee-2.jpg</guid>\n\
               <description/>\n\
               <content:encoded><![CDATA[]]></content:encoded>\n\
               <wp:post_id>31</wp:post_id>\n\
               <wp:post_parent>6</wp:post_parent>\n\
               <wp:post_type>attachment</wp:post_type>\n\
               <wp:post_password/>\n\
               <wp:attachment_url>https://example.com/vneck-tee-2.jpg</wp:attachment_url>\n\
               <wp:postmeta>\n\
                 <wp:meta_key>_wc_attachment_source</wp:meta_key>\n\
                 <wp:meta_value><![CDATA[https://example.com/vneck-tee-2.jpg]]></wp:meta_value>\n\
               </wp:postmeta>\n\
             </item>",
        );
        let entities = read_all(&mut EntityReader::from_str(&doc));
        assert_eq!(entities.len(), 2);

        let post = &entities[0];
        assert_eq!(post.get("post_type"), Some("attachment"));
        assert_eq!(post.get("attachment_url"), Some("https://example.com/vneck-tee-2.jpg"));
        assert_eq!(post.get("post_content"), Some(""));
        assert_eq!(post.get("post_parent"), Some("6"));
        // Empty elements carry no value.
        assert_eq!(post.get("post_excerpt"), None);
        assert_eq!(post.get("post_password"), None);

        assert_eq!(entities[1].kind(), EntityKind::PostMeta);
        assert_eq!(entities[1].get("meta_key"), Some("_wc_attachment_source"));
    }

    #[test]
    fn reads_terms_and_categories() {
        let doc = wxr(
            "<wp:term>\n\
               <wp:term_id><![CDATA[9]]></wp:term_id>\n\
               <wp:term_taxonomy><![CDATA[slider_category]]></wp:term_taxonomy>\n\
               <wp:term_slug><![CDATA[fullscreen_slider]]></wp:term_slug>\n\
               <wp:term_parent><![CDATA[]]></wp:term_parent>\n\
               <wp:term_name><![CDATA[fullscreen_slider]]></wp:term_name>\n\
             </wp:term>\n\
             <wp:category>\n\
               <wp:category_nicename>uncategorized</wp:category_nicename>\n\
               <wp:category_parent></wp:category_parent>\n\
               <wp:cat_name><![CDATA[Uncategorized]]></wp:cat_name>\n\
             </wp:category>",
        );
        let entities = read_all(&mut EntityReader::from_str(&doc));
        assert_eq!(entities.len(), 2);

        let term = &entities[0];
        assert_eq!(term.kind(), EntityKind::Term);
        let pairs: Vec<_> = term.fields().iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("term_id", "9"),
                ("taxonomy", "slider_category"),
                ("slug", "fullscreen_slider"),
                ("parent", ""),
                ("name", "fullscreen_slider"),
            ]
        );

        let category = &entities[1];
        assert_eq!(category.kind(), EntityKind::Category);
        assert_eq!(category.get("slug"), Some("uncategorized"));
        assert_eq!(category.get("parent"), Some(""));
        assert_eq!(category.get("name"), Some("Uncategorized"));
        assert_eq!(category.get("taxonomy"), Some("category"));
    }

    #[test]
    fn comments_follow_their_post_and_track_ids() {
        let doc = wxr(
            "<item>\n\
               <title>My post!</title>\n\
               <wp:post_id>10</wp:post_id>\n\
               <wp:comment>\n\
                 <wp:comment_id>167</wp:comment_id>\n\
                 <wp:comment_author><![CDATA[Anon]]></wp:comment_author>\n\
                 <wp:comment_author_url/>\n\
                 <wp:comment_content><![CDATA[Anonymous comment.]]></wp:comment_content>\n\
                 <wp:commentmeta>\n\
                   <wp:meta_key>_wp_karma</wp:meta_key>\n\
                   <wp:meta_value><![CDATA[1]]></wp:meta_value>\n\
                 </wp:commentmeta>\n\
               </wp:comment>\n\
               <wp:comment>\n\
                 <wp:comment_id>168</wp:comment_id>\n\
               </wp:comment>\n\
             </item>\n\
             <item>\n\
               <wp:post_id>11</wp:post_id>\n\
               <wp:comment><wp:comment_id>169</wp:comment_id></wp:comment>\n\
             </item>",
        );
        let mut reader = EntityReader::from_str(&doc);
        let expected = [
            (EntityKind::Post, Some("10"), None),
            (EntityKind::Comment, Some("10"), Some("167")),
            (EntityKind::CommentMeta, Some("10"), Some("167")),
            (EntityKind::Comment, Some("10"), Some("168")),
            (EntityKind::Post, Some("11"), Some("168")),
            (EntityKind::Comment, Some("11"), Some("169")),
        ];
        for (kind, post_id, comment_id) in expected {
            assert!(reader.next_entity());
            assert_eq!(reader.entity_type(), Some(kind));
            assert_eq!(reader.last_post_id(), post_id);
            assert_eq!(reader.last_comment_id(), comment_id);
        }
        assert!(!reader.next_entity());
    }

    #[test]
    fn fields_after_nested_meta_are_dropped() {
        let doc = wxr(
            "<item>\n\
               <title>Before</title>\n\
               <wp:postmeta><wp:meta_key>k</wp:meta_key><wp:meta_value>v</wp:meta_value></wp:postmeta>\n\
               <wp:post_type>page</wp:post_type>\n\
             </item>",
        );
        let entities = read_all(&mut EntityReader::from_str(&doc));
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].get("post_title"), Some("Before"));
        assert_eq!(entities[0].get("post_type"), None);
        assert_eq!(entities[1].kind(), EntityKind::PostMeta);
    }

    #[test]
    fn wp_author_alias_reads_as_user() {
        let doc = wxr("<wp:wp_author><wp:author_login>jane</wp:author_login></wp:wp_author>");
        let entities = read_all(&mut EntityReader::from_str(&doc));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].kind(), EntityKind::User);
        assert_eq!(entities[0].get("user_login"), Some("jane"));
    }

    #[test]
    fn unknown_elements_are_warnings() {
        let doc = wxr("<item><title>T</title><slash:comments>0</slash:comments><category>Loose</category></item>");
        let mut reader = EntityReader::from_str(&doc);
        assert!(reader.next_entity());
        let post = reader.entity().unwrap();
        assert_eq!(post.get("post_title"), Some("T"));
        assert_eq!(post.terms()[0].description, "Loose");
        assert_eq!(post.terms()[0].taxonomy, "");
        assert_eq!(
            reader.take_warnings(),
            vec![
                "unknown element <slash:comments> in <item>".to_string(),
                "<category> without domain or nicename attribute".to_string(),
            ]
        );
        assert!(reader.take_warnings().is_empty());
    }

    #[test]
    fn rejects_documents_that_are_not_wxr() {
        let mut reader = EntityReader::from_str("<feed><entry/></feed>");
        assert!(matches!(reader.try_next_entity(), Err(ReadError::UnexpectedRoot(_))));
        // Sticky.
        assert!(matches!(reader.try_next_entity(), Err(ReadError::UnexpectedRoot(_))));

        let mut reader = EntityReader::from_str("<rss><item/></rss>");
        let err = reader.try_next_entity().unwrap_err();
        assert_eq!(err.to_string(), "not a WXR export: <rss> child is <item>, expected <channel>");

        let mut reader = EntityReader::from_str("<rss><channel><item></channel></rss>");
        assert!(matches!(reader.try_next_entity(), Err(ReadError::Syntax(_))));
        let converted: DatalibError = reader.last_error().unwrap().clone().into();
        assert!(converted.to_string().starts_with("parse error: malformed WXR"));
    }

    #[test]
    fn pause_after_each_entity_and_resume_yields_the_rest() {
        let whole = read_all(&mut EntityReader::from_str(SIMPLE));
        for n in 1..whole.len() {
            let mut reader = EntityReader::from_str(SIMPLE);
            for _ in 0..n {
                assert!(reader.next_entity());
            }
            let cursor = reader.pause();
            let json = serde_json::to_string(&cursor).unwrap();
            let cursor: ReaderCursor = serde_json::from_str(&json).unwrap();

            let mut resumed = EntityReader::new();
            resumed.resume(&cursor);
            let offset = cursor.byte_offset() as usize;
            resumed.append_bytes(&SIMPLE.as_bytes()[offset..]);
            resumed.input_finished();
            assert_eq!(read_all(&mut resumed), whole[n..].to_vec(), "paused after {n}");
        }
    }

    #[test]
    fn pause_mid_entity_keeps_partial_fields() {
        let mut reader = EntityReader::new();
        let split = SIMPLE.find("<wp:post_id>").unwrap();
        reader.append_bytes(&SIMPLE.as_bytes()[..split]);
        let mut before = Vec::new();
        loop {
            match reader.try_next_entity() {
                Ok(Some(entity)) => before.push(entity.clone()),
                Err(ReadError::IncompleteInput) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(before.len(), 4);

        let cursor = reader.pause();
        assert_eq!(cursor.entity_tag.as_deref(), Some("item"));
        assert!(cursor.entity.as_ref().unwrap().get("post_title").is_some());

        let mut resumed = EntityReader::new();
        resumed.resume(&cursor);
        resumed.append_bytes(&SIMPLE.as_bytes()[cursor.byte_offset() as usize..]);
        resumed.input_finished();
        let rest = read_all(&mut resumed);
        let whole = read_all(&mut EntityReader::from_str(SIMPLE));
        assert_eq!(rest, whole[4..].to_vec());
    }
}
