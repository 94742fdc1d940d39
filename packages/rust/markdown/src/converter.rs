use datalib_shared::Result;

/// Turns a Markdown body (front matter already removed) into the markup
/// stored as `post_content`.
pub trait MarkdownConverter {
    fn convert(&self, markdown: &str) -> Result<String>;
}

/// Stores the Markdown as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConverter;

impl MarkdownConverter for PassthroughConverter {
    fn convert(&self, markdown: &str) -> Result<String> {
        Ok(markdown.to_string())
    }
}

impl<F> MarkdownConverter for F
where
    F: Fn(&str) -> Result<String>,
{
    fn convert(&self, markdown: &str) -> Result<String> {
        self(markdown)
    }
}
