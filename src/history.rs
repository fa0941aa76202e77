//! Reply-chain reconstruction.
//!
//! Telegram encodes conversational context as a chain of replies; walking
//! it back to the root recovers the prior turns without any storage of our
//! own.

use std::collections::HashSet;

use crate::command;
use crate::llm::{ConversationTurn, Role};
use crate::message::{InboundMessage, MessageLookup};

/// Hard cap on chain depth. Platform chains are far shorter in practice;
/// the cap only guards against pathological lookups.
const MAX_CHAIN_DEPTH: usize = 512;

/// Walk the parent chain of `current` and return the prior turns in
/// chronological order (oldest first). The current message itself is never
/// included. Ancestors that start with a `/cmd ` prefix contribute only
/// their payload, and bot-authored messages become assistant turns.
///
/// Iterative on purpose: chain depth is bounded by the platform, not by
/// our stack.
pub fn reconstruct(current: &InboundMessage, lookup: &dyn MessageLookup) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut seen: HashSet<i32> = HashSet::new();
    let mut next_id = current.parent_id;

    while let Some(id) = next_id {
        if turns.len() >= MAX_CHAIN_DEPTH || !seen.insert(id) {
            break;
        }
        let Some(ancestor) = lookup.get(id) else {
            break;
        };
        let role = if ancestor.sender.is_bot {
            Role::Assistant
        } else {
            Role::User
        };
        let text = command::strip_prefix(&ancestor.text);
        turns.push(ConversationTurn::text(role, text));
        next_id = ancestor.parent_id;
    }

    turns.reverse();
    turns
}
