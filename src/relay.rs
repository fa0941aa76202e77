//! The core relay pipeline.
//!
//! One inbound message becomes one turn: fetch attached media, rebuild the
//! reply-chain history, assemble the backend request, generate, and render
//! the result into the placeholder. Media and backend failures are caught
//! here and converted into user-visible chat messages; they never escape
//! to the dispatcher.

use anyhow::Result;
use tracing::{error, info};

use crate::history;
use crate::llm::{Backend, ContentPart, ConversationTurn, Role};
use crate::media::{FileResolver, MediaFetcher, MediaPart};
use crate::message::{InboundMessage, MediaKind, MessageLookup};
use crate::render::{ChatPort, Renderer};

/// Combine pre-turns, history and the new user turn into one ordered
/// message list. Pure and deterministic.
pub fn assemble_request(
    pre: &[ConversationTurn],
    history: Vec<ConversationTurn>,
    prompt: &str,
    media: Vec<MediaPart>,
) -> Vec<ConversationTurn> {
    let mut turns = Vec::with_capacity(pre.len() + history.len() + 1);
    turns.extend_from_slice(pre);
    turns.extend(history);

    let mut parts = Vec::with_capacity(1 + media.len());
    // Captionless media sends no text part; the backend rejects requests
    // with an empty text parameter.
    if !prompt.trim().is_empty() {
        parts.push(ContentPart::Text(prompt.to_string()));
    }
    parts.extend(media.into_iter().map(|part| match part.kind {
        MediaKind::Image => ContentPart::Image {
            mime: part.mime,
            data: part.data,
        },
        MediaKind::Audio => ContentPart::Audio {
            mime: part.mime,
            data: part.data,
        },
    }));
    turns.push(ConversationTurn {
        role: Role::User,
        parts,
    });
    turns
}

/// Owns the backend client and drives individual turns.
pub struct Relay {
    backend: Box<dyn Backend>,
    fetcher: MediaFetcher,
}

impl Relay {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            fetcher: MediaFetcher::new(),
        }
    }

    /// Process one routed message: the prompt is the already-extracted user
    /// text, `pre` carries any system directive for the invoked command.
    pub async fn run_turn(
        &self,
        port: &dyn ChatPort,
        resolver: &dyn FileResolver,
        msg: &InboundMessage,
        lookup: &dyn MessageLookup,
        prompt: &str,
        pre: &[ConversationTurn],
    ) -> Result<()> {
        let media = match self.fetcher.fetch_all(&msg.media, resolver).await {
            Ok(media) => media,
            Err(e) => {
                // No placeholder exists yet; surface the failure as a reply.
                error!("Media fetch failed: {:#}", e);
                port.send_reply(msg.chat_id, msg.id, &format!("Error: {e}"))
                    .await?;
                return Ok(());
            }
        };
        let has_media = !media.is_empty();

        let history = history::reconstruct(msg, lookup);
        info!(
            "Processing turn: {} history turn(s), {} media part(s)",
            history.len(),
            media.len()
        );

        let turns = assemble_request(pre, history, prompt, media);
        let renderer = Renderer::begin(port, msg.chat_id, msg.id).await?;
        self.respond(renderer, &turns, has_media).await
    }

    /// Generate and render. Media-bearing requests use single-shot
    /// generation; text-only requests stream increments into the
    /// placeholder. Backend and rendering failures alike end up as an
    /// error edit of the placeholder; neither escapes the turn.
    async fn respond(
        &self,
        mut renderer: Renderer<'_>,
        turns: &[ConversationTurn],
        has_media: bool,
    ) -> Result<()> {
        if has_media {
            match self.backend.generate(turns).await {
                Ok(text) => {
                    if let Err(e) = renderer.finalize_with(text.as_deref()).await {
                        error!("Rendering failed: {:#}", e);
                        renderer.fail(&e).await;
                    }
                }
                Err(e) => {
                    error!("Backend call failed: {:#}", e);
                    renderer.fail(&e).await;
                }
            }
            return Ok(());
        }

        let mut stream = match self.backend.stream(turns).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Backend stream failed to open: {:#}", e);
                renderer.fail(&e).await;
                return Ok(());
            }
        };

        loop {
            match stream.next_chunk().await {
                Ok(Some(delta)) => {
                    // A rejected edit (bad markup, rate limit) must still
                    // leave the partial text and error in the placeholder.
                    if let Err(e) = renderer.push(&delta).await {
                        error!("Rendering failed mid-stream: {:#}", e);
                        renderer.fail(&e).await;
                        return Ok(());
                    }
                }
                Ok(None) => {
                    if let Err(e) = renderer.finalize().await {
                        error!("Rendering failed at finish: {:#}", e);
                        renderer.fail(&e).await;
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!("Backend stream failed mid-response: {:#}", e);
                    renderer.fail(&e).await;
                    return Ok(());
                }
            }
        }
    }
}
