//! Markdown directory trees as a datalib entity source.
//!
//! [`MarkdownTreeReader`] turns a folder of `.md` files into a page
//! hierarchy. Front matter supplies titles, slugs and ordering, and a
//! [`MarkdownConverter`] decides what ends up in `post_content`.

mod converter;
mod frontmatter;
mod reader;
mod title;

pub use converter::{MarkdownConverter, PassthroughConverter};
pub use frontmatter::{FrontMatter, split_front_matter};
pub use reader::{MarkdownCursor, MarkdownTreeReader};
pub use title::{first_heading, slug_to_title, strip_leading_heading};
