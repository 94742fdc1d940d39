//! A stream stage that migrates site URLs inside a WXR document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;
use url::Url;

use datalib_shared::{DatalibError, Result};
use datalib_stream::{ByteStream, ByteStreamState};
use datalib_urls::rewrite_urls;

use crate::tokenizer::{QuickXmlTokenizer, TokenizerCursor, XmlTokenKind, XmlTokenizer};

/// Elements whose text may carry site URLs. Meta values are left alone:
/// they can hold serialized or JSON-encoded data.
pub const CONTENT_NODES: &[&str] = &[
    "content:encoded",
    "excerpt:encoded",
    "guid",
    "link",
    "wp:attachment_url",
    "wp:comment_content",
    "wp:base_site_url",
    "wp:base_blog_url",
];

#[derive(Debug, Serialize, Deserialize)]
struct RewritePauseState {
    tokenizer: TokenizerCursor,
    #[serde(default)]
    pending: Vec<u8>,
}

/// Rewrites every URL under `from` to live under `to`, in the text of
/// [`CONTENT_NODES`]. All other bytes pass through unchanged.
pub struct WxrRewriteStream {
    state: ByteStreamState,
    xml: QuickXmlTokenizer,
    from: Url,
    to: Url,
}

impl WxrRewriteStream {
    pub fn new(from: Url, to: Url) -> Self {
        Self {
            state: ByteStreamState::new(),
            xml: QuickXmlTokenizer::new().record_output(),
            from,
            to,
        }
    }

    fn in_content_node(&self) -> bool {
        self.xml
            .breadcrumbs()
            .iter()
            .any(|crumb| CONTENT_NODES.contains(&crumb.as_str()))
    }
}

impl ByteStream for WxrRewriteStream {
    fn state(&self) -> &ByteStreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ByteStreamState {
        &mut self.state
    }

    fn generate_next_chunk(&mut self) -> bool {
        let input = self.state.take_input();
        if !input.is_empty() {
            self.xml.append_bytes(&input);
        }
        if self.state.input_eof {
            self.xml.input_finished();
        }

        while self.xml.next_token() {
            if !matches!(self.xml.token_kind(), Some(XmlTokenKind::Text | XmlTokenKind::CData)) {
                continue;
            }
            if !self.in_content_node() {
                continue;
            }
            let Some(text) = self.xml.modifiable_text() else {
                continue;
            };
            let updated = rewrite_urls(text, &self.from, &self.to);
            if updated != text {
                trace!(node = ?self.xml.breadcrumbs().last(), "rewrote URLs in content node");
                self.xml.set_modifiable_text(&updated);
            }
        }

        if let Some(err) = self.xml.last_error() {
            let message = err.to_string();
            self.state.fail(message);
            return false;
        }

        let output = self.xml.take_output();
        if output.is_empty() {
            return false;
        }
        self.state.output_bytes = output;
        true
    }

    fn pause(&self) -> Result<Value> {
        let mut pending = self.xml.pending_input().to_vec();
        pending.extend_from_slice(&self.state.input_bytes);
        serde_json::to_value(RewritePauseState {
            tokenizer: self.xml.pause(false),
            pending,
        })
        .map_err(|e| DatalibError::cursor(e.to_string()))
    }

    fn resume(&mut self, paused: &Value) -> Result<()> {
        let paused: RewritePauseState = serde_json::from_value(paused.clone())
            .map_err(|e| DatalibError::cursor(format!("wxr rewrite stage: {e}")))?;
        self.xml.resume(&paused.tokenizer);
        self.xml.append_bytes(&paused.pending);
        self.state.input_bytes.clear();
        Ok(())
    }
}
