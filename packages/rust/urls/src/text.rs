//! Finds URL-shaped substrings in plain text.
//!
//! Only strings that look absolute are reported: an explicit `http(s)://`
//! scheme, a protocol-relative `//host`, or a bare `host.tld` whose TLD is
//! known. The base URL is used to resolve bare and protocol-relative
//! matches, never to turn an arbitrary word into a URL.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?:
            (?P<scheme>(?i:https?):)?
            //
            (?P<userinfo>[^\s@/?\#<>"\[\]]+@)?
        )?
        (?P<host>
            \[[0-9A-Fa-f:.]+\]
          | [\p{L}\p{N}\p{So}_-]+(?:\.[\p{L}\p{N}\p{So}_-]+)*
        )
        (?P<port>:\d{1,5})?
        (?P<path>[/?\#][^\s<>"]*)?
        "#,
    )
    .expect("valid regex")
});

/// Top-level domains accepted for matches without a scheme. Country codes
/// that are also common file extensions (`md`, `pl`, `rs`, `sh`) are left
/// out.
static KNOWN_TLDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "com", "org", "net", "edu", "gov", "mil", "int", "info", "biz", "name", "pro", "aero",
        "coop", "museum", "mobi", "travel", "jobs", "asia", "io", "co", "ai", "app", "dev",
        "blog", "news", "shop", "store", "online", "site", "tech", "technology", "website",
        "space", "xyz", "club", "design", "cloud", "page", "wiki", "live", "media", "agency",
        "studio", "digital", "art", "me", "tv", "fm", "us", "uk", "ca", "au", "de", "fr", "es",
        "it", "nl", "be", "ch", "at", "se", "no", "dk", "fi", "cz", "sk", "hu", "ro", "bg", "ru",
        "ua", "jp", "cn", "kr", "in", "br", "mx", "ar", "cl", "pe", "nz", "za", "ie", "pt",
        "gr", "tr", "il", "sg", "hk", "tw", "eu", "is", "ee", "lv", "lt", "si", "hr",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone)]
struct TextMatch {
    start: usize,
    end: usize,
    raw: String,
    parsed: Url,
    has_scheme: bool,
    protocol_relative: bool,
}

#[derive(Debug, Clone)]
struct Replacement {
    start: usize,
    end: usize,
    text: String,
}

/// Iterates over URLs in a piece of text and supports replacing them.
#[derive(Debug, Clone)]
pub struct UrlInTextProcessor {
    text: String,
    base_url: Option<Url>,
    at: usize,
    current: Option<TextMatch>,
    replacements: Vec<Replacement>,
}

impl UrlInTextProcessor {
    pub fn new(text: impl Into<String>, base_url: Option<&Url>) -> Self {
        Self {
            text: text.into(),
            base_url: base_url.cloned(),
            at: 0,
            current: None,
            replacements: Vec::new(),
        }
    }

    pub fn next_url(&mut self) -> bool {
        self.current = None;
        while self.at < self.text.len() {
            let Some(caps) = URL_RE.captures_at(&self.text, self.at) else {
                self.at = self.text.len();
                return false;
            };
            let Some(whole) = caps.get(0) else {
                return false;
            };
            self.at = whole.end().max(whole.start() + 1);
            while !self.text.is_char_boundary(self.at) {
                self.at += 1;
            }

            let has_scheme = caps.name("scheme").is_some();
            let protocol_relative = !has_scheme && whole.as_str().starts_with("//");
            let end = whole.start() + trimmed_len(whole.as_str());
            let raw = &self.text[whole.start()..end];

            if !has_scheme {
                if caps.name("userinfo").is_some() {
                    continue;
                }
                if !protocol_relative && !self.bare_host_allowed(whole.start(), &caps) {
                    continue;
                }
            }

            let Some(parsed) = self.resolve(raw, has_scheme, protocol_relative) else {
                continue;
            };

            self.current = Some(TextMatch {
                start: whole.start(),
                end,
                raw: raw.to_string(),
                parsed,
                has_scheme,
                protocol_relative,
            });
            return true;
        }
        false
    }

    pub fn raw_url(&self) -> Option<&str> {
        self.current.as_ref().map(|m| m.raw.as_str())
    }

    pub fn parsed_url(&self) -> Option<&Url> {
        self.current.as_ref().map(|m| &m.parsed)
    }

    /// Replace the current match. A match written without a scheme keeps
    /// that shape: the new URL's scheme (and `//` for bare hosts) is
    /// dropped.
    pub fn set_raw_url(&mut self, new_url: &str) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };

        let text = if current.has_scheme {
            new_url.to_string()
        } else {
            match new_url.split_once("://") {
                Some((scheme, rest)) if is_http_scheme(scheme) => {
                    if current.protocol_relative {
                        format!("//{rest}")
                    } else {
                        rest.to_string()
                    }
                }
                _ => new_url.to_string(),
            }
        };

        current.raw = text.clone();
        let (start, end) = (current.start, current.end);
        match self
            .replacements
            .iter_mut()
            .find(|r| r.start == start && r.end == end)
        {
            Some(existing) => existing.text = text,
            None => self.replacements.push(Replacement { start, end, text }),
        }
        true
    }

    pub fn updated_text(&self) -> String {
        let mut replacements: Vec<&Replacement> = self.replacements.iter().collect();
        replacements.sort_by_key(|r| r.start);

        let mut out = String::with_capacity(self.text.len());
        let mut at = 0;
        for replacement in replacements {
            out.push_str(&self.text[at..replacement.start]);
            out.push_str(&replacement.text);
            at = replacement.end;
        }
        out.push_str(&self.text[at..]);
        out
    }

    fn bare_host_allowed(&self, start: usize, caps: &regex::Captures<'_>) -> bool {
        if self.text[..start].ends_with('@') {
            return false;
        }
        let Some(host) = caps.name("host").map(|m| m.as_str().to_lowercase()) else {
            return false;
        };
        let Some((_, tld)) = host.rsplit_once('.') else {
            return false;
        };
        KNOWN_TLDS.contains(tld) || tld.starts_with("xn--")
    }

    fn resolve(&self, raw: &str, has_scheme: bool, protocol_relative: bool) -> Option<Url> {
        let parsed = if has_scheme {
            Url::parse(raw).ok()?
        } else {
            let relative = if protocol_relative {
                raw.to_string()
            } else {
                format!("//{raw}")
            };
            match &self.base_url {
                Some(base) => base.join(&relative).ok()?,
                None => Url::parse(&format!("https:{relative}")).ok()?,
            }
        };
        (is_http_scheme(parsed.scheme()) && parsed.host_str().is_some_and(|h| !h.is_empty()))
            .then_some(parsed)
    }
}

fn is_http_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

/// Length of `candidate` once trailing punctuation and unbalanced closing
/// brackets are dropped.
fn trimmed_len(candidate: &str) -> usize {
    let mut end = candidate.len();
    loop {
        let current = &candidate[..end];
        let Some(last) = current.chars().last() else {
            return end;
        };
        let unbalanced = match last {
            ')' => current.matches(')').count() > current.matches('(').count(),
            ']' => current.matches(']').count() > current.matches('[').count(),
            '.' | ',' | ':' | ';' | '!' | '?' | '\'' | '"' => true,
            _ => false,
        };
        if !unbalanced {
            return end;
        }
        end -= last.len_utf8();
    }
}
