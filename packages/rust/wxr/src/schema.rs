//! The WXR vocabulary: which elements start entities and how their child
//! elements map onto entity fields.

use datalib_shared::EntityKind;

/// An element that starts an entity, plus its child-element field map.
#[derive(Debug)]
pub struct EntitySchema {
    pub tag: &'static str,
    pub kind: EntityKind,
    /// `(child element, field name)` pairs.
    pub fields: &'static [(&'static str, &'static str)],
}

impl EntitySchema {
    /// Field name for a child element, if the element is known.
    pub fn field(&self, child: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(element, _)| *element == child)
            .map(|(_, field)| *field)
    }
}

const META_FIELDS: &[(&str, &str)] = &[("wp:meta_key", "meta_key"), ("wp:meta_value", "meta_value")];

pub const KNOWN_ENTITIES: &[EntitySchema] = &[
    EntitySchema {
        tag: "wp:comment",
        kind: EntityKind::Comment,
        fields: &[
            ("wp:comment_id", "comment_id"),
            ("wp:comment_author", "comment_author"),
            ("wp:comment_author_email", "comment_author_email"),
            ("wp:comment_author_url", "comment_author_url"),
            ("wp:comment_author_IP", "comment_author_IP"),
            ("wp:comment_date", "comment_date"),
            ("wp:comment_date_gmt", "comment_date_gmt"),
            ("wp:comment_content", "comment_content"),
            ("wp:comment_approved", "comment_approved"),
            ("wp:comment_type", "comment_type"),
            ("wp:comment_parent", "comment_parent"),
            ("wp:comment_user_id", "comment_user_id"),
        ],
    },
    EntitySchema {
        tag: "wp:commentmeta",
        kind: EntityKind::CommentMeta,
        fields: META_FIELDS,
    },
    EntitySchema {
        tag: "wp:author",
        kind: EntityKind::User,
        fields: &[
            ("wp:author_id", "ID"),
            ("wp:author_login", "user_login"),
            ("wp:author_email", "user_email"),
            ("wp:author_display_name", "display_name"),
            ("wp:author_first_name", "first_name"),
            ("wp:author_last_name", "last_name"),
        ],
    },
    EntitySchema {
        tag: "item",
        kind: EntityKind::Post,
        fields: &[
            ("title", "post_title"),
            ("link", "link"),
            ("guid", "guid"),
            ("description", "post_excerpt"),
            ("pubDate", "post_published_at"),
            ("dc:creator", "post_author"),
            ("content:encoded", "post_content"),
            ("excerpt:encoded", "post_excerpt"),
            ("wp:post_id", "ID"),
            ("wp:status", "post_status"),
            ("wp:post_date", "post_date"),
            ("wp:post_date_gmt", "post_date_gmt"),
            ("wp:post_modified", "post_modified"),
            ("wp:post_modified_gmt", "post_modified_gmt"),
            ("wp:comment_status", "comment_status"),
            ("wp:ping_status", "ping_status"),
            ("wp:post_name", "post_name"),
            ("wp:post_parent", "post_parent"),
            ("wp:menu_order", "menu_order"),
            ("wp:post_type", "post_type"),
            ("wp:post_password", "post_password"),
            ("wp:is_sticky", "is_sticky"),
            ("wp:attachment_url", "attachment_url"),
        ],
    },
    EntitySchema {
        tag: "wp:postmeta",
        kind: EntityKind::PostMeta,
        fields: META_FIELDS,
    },
    EntitySchema {
        tag: "wp:term",
        kind: EntityKind::Term,
        fields: &[
            ("wp:term_id", "term_id"),
            ("wp:term_taxonomy", "taxonomy"),
            ("wp:term_slug", "slug"),
            ("wp:term_parent", "parent"),
            ("wp:term_name", "name"),
        ],
    },
    EntitySchema {
        tag: "wp:tag",
        kind: EntityKind::Tag,
        fields: &[
            ("wp:term_id", "term_id"),
            ("wp:tag_slug", "slug"),
            ("wp:tag_name", "name"),
            ("wp:tag_description", "description"),
        ],
    },
    EntitySchema {
        tag: "wp:category",
        kind: EntityKind::Category,
        fields: &[
            ("wp:category_nicename", "slug"),
            ("wp:category_parent", "parent"),
            ("wp:cat_name", "name"),
            ("wp:category_description", "description"),
        ],
    },
];

/// Channel-level elements that become `site_option` entities.
pub const SITE_OPTIONS: &[(&str, &str)] = &[
    ("wp:base_blog_url", "home"),
    ("wp:base_site_url", "siteurl"),
    ("title", "blogname"),
];

/// Some exporters write `wp:wp_author` for `wp:author`.
pub fn canonical_tag(tag: &str) -> &str {
    match tag {
        "wp:wp_author" => "wp:author",
        other => other,
    }
}

pub fn entity_schema(tag: &str) -> Option<&'static EntitySchema> {
    KNOWN_ENTITIES.iter().find(|schema| schema.tag == tag)
}

pub fn site_option_name(tag: &str) -> Option<&'static str> {
    SITE_OPTIONS
        .iter()
        .find(|(element, _)| *element == tag)
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_entities_and_fields() {
        let item = entity_schema("item").unwrap();
        assert_eq!(item.kind, EntityKind::Post);
        assert_eq!(item.field("wp:post_id"), Some("ID"));
        assert_eq!(item.field("excerpt:encoded"), Some("post_excerpt"));
        assert_eq!(item.field("wp:meta_key"), None);

        assert_eq!(entity_schema("wp:postmeta").unwrap().field("wp:meta_value"), Some("meta_value"));
        assert!(entity_schema("channel").is_none());
    }

    #[test]
    fn author_alias_is_canonicalized() {
        let schema = entity_schema(canonical_tag("wp:wp_author")).unwrap();
        assert_eq!(schema.kind, EntityKind::User);
        assert_eq!(canonical_tag("item"), "item");
    }

    #[test]
    fn site_options_map_channel_children() {
        assert_eq!(site_option_name("wp:base_blog_url"), Some("home"));
        assert_eq!(site_option_name("title"), Some("blogname"));
        assert_eq!(site_option_name("link"), None);
    }
}
