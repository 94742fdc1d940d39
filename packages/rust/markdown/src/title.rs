//! Page titles: `# ` headings and titles derived from file names.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static H1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[ \t]+(.+?)(?:[ \t]+#+)?[ \t]*$").expect("valid regex"));

static LEADING_ORDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[-_. ]*").expect("valid regex"));

/// Text of the first level-one heading outside fenced code.
pub fn first_heading(markdown: &str) -> Option<String> {
    let mut in_fence = false;
    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = H1_RE.captures(line) {
            return Some(caps[1].trim().to_string());
        }
    }
    None
}

/// Drop a level-one heading when it is the first block of the document.
pub fn strip_leading_heading(markdown: &str) -> &str {
    let body = markdown.trim_start_matches(['\n', '\r']);
    let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
    if H1_RE.is_match(first.trim_end_matches('\r')) {
        rest.trim_start_matches(['\n', '\r'])
    } else {
        markdown
    }
}

/// `02-getting_started.md` becomes `Getting Started`.
pub fn slug_to_title(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let stem = LEADING_ORDER_RE.replace(stem, "");

    stem.split(['-', '_', ' '])
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
