//! Response rendering: one placeholder message, edited in place.
//!
//! State machine: placeholder sent → zero or more streaming edits →
//! finalized, or errored. Every streaming edit re-escapes the full
//! accumulated buffer (the escaper is idempotent), and an edit is only
//! issued when the escaped text actually changed, since Telegram
//! rate-limits message edits.

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::markup::escape_markdown;

/// Initial text of the placeholder reply.
pub const PLACEHOLDER_TEXT: &str = "Processing...";

/// Shown when the backend finishes without producing any text. Distinct
/// from an error: the backend answered, it just said nothing.
pub const NO_CONTENT_NOTICE: &str = "The model returned no content.";

/// Identifies a message we sent and can edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRef {
    pub chat_id: i64,
    pub message_id: i32,
}

/// Outbound chat operations the renderer needs. Implemented over the
/// Telegram client; tests substitute a recording mock.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Send `text` as a reply to `reply_to` in `chat_id`.
    async fn send_reply(&self, chat_id: i64, reply_to: i32, text: &str) -> Result<SentRef>;

    /// Replace a sent message's content with MarkdownV2 `text`.
    async fn edit_rich(&self, target: SentRef, text: &str) -> Result<()>;

    /// Replace a sent message's content with plain `text` and detach any
    /// interactive controls so the failed message is inert.
    async fn edit_plain_detached(&self, target: SentRef, text: &str) -> Result<()>;
}

/// Mutable state of one in-flight response cycle. Owned by exactly one
/// turn; never shared across concurrent inbound messages.
#[derive(Debug)]
struct RenderState {
    target: SentRef,
    /// Last escaped text actually sent; edits matching it are suppressed.
    last_rendered: String,
}

/// Drives the placeholder through streaming edits to a final state.
pub struct Renderer<'a> {
    port: &'a dyn ChatPort,
    state: RenderState,
    accumulated: String,
}

impl<'a> Renderer<'a> {
    /// Send the placeholder reply and enter the render cycle.
    pub async fn begin(port: &'a dyn ChatPort, chat_id: i64, reply_to: i32) -> Result<Renderer<'a>> {
        let target = port.send_reply(chat_id, reply_to, PLACEHOLDER_TEXT).await?;
        Ok(Self {
            port,
            state: RenderState {
                target,
                last_rendered: String::new(),
            },
            accumulated: String::new(),
        })
    }

    /// Raw text accumulated so far (unescaped).
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Append a streamed increment and re-render the whole buffer.
    pub async fn push(&mut self, delta: &str) -> Result<()> {
        self.accumulated.push_str(delta);
        self.render_current().await
    }

    /// Render the full accumulated buffer, skipping no-op edits.
    async fn render_current(&mut self) -> Result<()> {
        let escaped = escape_markdown(&self.accumulated);
        if escaped.is_empty() || escaped == self.state.last_rendered {
            return Ok(());
        }
        self.port.edit_rich(self.state.target, &escaped).await?;
        self.state.last_rendered = escaped;
        Ok(())
    }

    /// Finish the cycle: flush any unrendered text, or replace the
    /// placeholder with the no-content notice if nothing ever arrived.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.accumulated.trim().is_empty() {
            let notice = escape_markdown(NO_CONTENT_NOTICE);
            self.port.edit_rich(self.state.target, &notice).await?;
            return Ok(());
        }
        self.render_current().await
    }

    /// Set the complete response at once (non-incremental backends) and
    /// finish.
    pub async fn finalize_with(&mut self, text: Option<&str>) -> Result<()> {
        if let Some(text) = text {
            self.accumulated = text.to_string();
        }
        self.finalize().await
    }

    /// Render a failure: whatever partial text accumulated, followed by
    /// the error message, as a plain edit with controls detached. Edit
    /// failures here are logged, not propagated, so the error path cannot
    /// itself error out of the turn.
    pub async fn fail(&self, error: &(dyn std::fmt::Display + Send + Sync)) {
        let text = if self.accumulated.trim().is_empty() {
            format!("Error: {error}")
        } else {
            format!("{}\n\nError: {error}", self.accumulated)
        };
        if let Err(e) = self
            .port
            .edit_plain_detached(self.state.target, &text)
            .await
        {
            warn!("Failed to render error into placeholder: {:#}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every outbound call for assertions.
    #[derive(Debug, PartialEq, Eq, Clone)]
    pub enum PortCall {
        SendReply { chat_id: i64, reply_to: i32, text: String },
        EditRich { message_id: i32, text: String },
        EditPlainDetached { message_id: i32, text: String },
    }

    #[derive(Default)]
    pub struct MockPort {
        pub calls: Mutex<Vec<PortCall>>,
    }

    impl MockPort {
        pub fn calls(&self) -> Vec<PortCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatPort for MockPort {
        async fn send_reply(&self, chat_id: i64, reply_to: i32, text: &str) -> Result<SentRef> {
            self.calls.lock().unwrap().push(PortCall::SendReply {
                chat_id,
                reply_to,
                text: text.to_string(),
            });
            Ok(SentRef {
                chat_id,
                message_id: 777,
            })
        }

        async fn edit_rich(&self, target: SentRef, text: &str) -> Result<()> {
            self.calls.lock().unwrap().push(PortCall::EditRich {
                message_id: target.message_id,
                text: text.to_string(),
            });
            Ok(())
        }

        async fn edit_plain_detached(&self, target: SentRef, text: &str) -> Result<()> {
            self.calls.lock().unwrap().push(PortCall::EditPlainDetached {
                message_id: target.message_id,
                text: text.to_string(),
            });
            Ok(())
        }
    }

    fn edit_texts(calls: &[PortCall]) -> Vec<&str> {
        calls
            .iter()
            .filter_map(|c| match c {
                PortCall::EditRich { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_begin_sends_placeholder_reply() {
        let port = MockPort::default();
        let _renderer = Renderer::begin(&port, 5, 42).await.unwrap();
        assert_eq!(
            port.calls(),
            vec![PortCall::SendReply {
                chat_id: 5,
                reply_to: 42,
                text: PLACEHOLDER_TEXT.to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_streaming_renders_growing_buffer() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.push("Hello").await.unwrap();
        renderer.push(" world").await.unwrap();
        renderer.finalize().await.unwrap();

        let calls = port.calls();
        assert_eq!(edit_texts(&calls), vec!["Hello", "Hello world"]);
    }

    #[tokio::test]
    async fn test_identical_edits_are_suppressed() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.push("Hello").await.unwrap();
        renderer.push("").await.unwrap();
        renderer.push("").await.unwrap();
        renderer.finalize().await.unwrap();

        let calls = port.calls();
        let edits = edit_texts(&calls);
        assert_eq!(edits, vec!["Hello"]);
        for pair in edits.windows(2) {
            assert_ne!(pair[0], pair[1], "consecutive identical edits issued");
        }
    }

    #[tokio::test]
    async fn test_empty_deltas_never_edit() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.push("").await.unwrap();
        assert_eq!(port.calls().len(), 1); // just the placeholder
    }

    #[tokio::test]
    async fn test_finalize_escapes_markup() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.finalize_with(Some("2+2 = 4.")).await.unwrap();

        let calls = port.calls();
        assert_eq!(edit_texts(&calls), vec!["2\\+2 \\= 4\\."]);
    }

    #[tokio::test]
    async fn test_finalize_without_content_shows_notice() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.finalize_with(None).await.unwrap();

        let calls = port.calls();
        let edits = edit_texts(&calls);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0], escape_markdown(NO_CONTENT_NOTICE));
    }

    #[tokio::test]
    async fn test_fail_after_partial_keeps_partial_text() {
        let port = MockPort::default();
        let mut renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.push("Hello ").await.unwrap();
        renderer.fail(&"backend exploded").await;

        let calls = port.calls();
        match calls.last().unwrap() {
            PortCall::EditPlainDetached { text, .. } => {
                assert!(text.contains("Hello "));
                assert!(text.contains("backend exploded"));
            }
            other => panic!("expected detached plain edit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_without_partial_is_bare_error() {
        let port = MockPort::default();
        let renderer = Renderer::begin(&port, 1, 1).await.unwrap();
        renderer.fail(&"boom").await;

        let calls = port.calls();
        match calls.last().unwrap() {
            PortCall::EditPlainDetached { text, .. } => {
                assert_eq!(text, "Error: boom");
            }
            other => panic!("expected detached plain edit, got {other:?}"),
        }
    }
}
