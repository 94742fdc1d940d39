//! Site-to-site URL migration over whole markup strings.

use url::Url;

use crate::decode::urldecode;
use crate::processor::UrlProcessor;

/// Whether `url` points at `base` or anything beneath it.
///
/// Hosts must be equal (both are already IDNA-normalized by the parser).
/// Paths are compared decoded, with the base path's trailing slash ignored.
pub fn url_matches(url: &Url, base: &Url) -> bool {
    if url.host_str() != base.host_str() {
        return false;
    }
    let base_decoded = urldecode(base.path());
    let base_path = base_decoded.trim_end_matches('/');
    let path = urldecode(url.path());
    path == base_path || path == format!("{base_path}/") || path.starts_with(&format!("{base_path}/"))
}

/// Rewrite every URL in `markup` that lives under `from` so it lives under
/// `to` instead. Relative URLs are resolved against `from`.
pub fn rewrite_urls(markup: &str, from: &Url, to: &Url) -> String {
    let mut processor = UrlProcessor::new(markup, Some(from));
    while processor.next_url() {
        let matches = processor.parsed_url().is_some_and(|parsed| url_matches(parsed, from));
        if matches {
            processor.replace_base_url(to);
        }
    }
    processor.updated_markup()
}
