//! Telegram dispatch: per-update routing and the platform glue that turns
//! teloxide types into the relay's domain model.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, FileId, InlineKeyboardMarkup, MessageEntityKind, MessageId, ParseMode,
    ReplyParameters,
};
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::command;
use crate::config::Config;
use crate::llm::{ConversationTurn, GeminiClient, Role};
use crate::media::{FileResolver, MediaFetchError};
use crate::message::{InboundMessage, MediaKind, MediaRef, Sender};
use crate::prompts;
use crate::relay::Relay;
use crate::render::{ChatPort, SentRef};

const GREETING: &str = "Hello! I'm a relay to a generative model.\n\n\
     Talk to me directly, reply to my answers to continue a thread, or use:\n\
     /ask <question> - ask a question\n\
     /polish <sentence> - rewrite a sentence the way a native speaker would";

/// The bot's own identity, fetched once and reused for mention matching.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
}

/// Shared application state.
pub struct AppState {
    pub relay: Relay,
    /// Lazily initialized via `get_me`; single-flight, set at most once.
    me: OnceCell<BotIdentity>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = Relay::new(Box::new(GeminiClient::new(config.gemini.clone())));
        Self {
            relay,
            me: OnceCell::new(),
        }
    }
}

/// Start the Telegram dispatcher.
pub async fn run(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Starting Telegram relay...");

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("relaybot"))
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// What to do with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    /// No reply, no error.
    Ignore,
    Respond {
        prompt: String,
        directive: Option<&'static str>,
    },
}

/// Per-message routing. Private chats are processed unconditionally;
/// group chats only on a known command or a mention of the bot. The
/// mention span is stripped from the prompt (first occurrence only).
fn route(msg: &InboundMessage, bot_username: &str) -> Route {
    if let Some(cmd) = command::parse(&msg.text) {
        match cmd.name {
            "ask" => {
                return Route::Respond {
                    prompt: cmd.payload.trim().to_string(),
                    directive: None,
                }
            }
            "polish" => {
                return Route::Respond {
                    prompt: cmd.payload.trim().to_string(),
                    directive: Some(prompts::polish_directive()),
                }
            }
            // Unknown commands: plain text in private chats, not an
            // address in groups.
            _ => {}
        }
    }

    if msg.private {
        return Route::Respond {
            prompt: msg.text.clone(),
            directive: None,
        };
    }

    let at_username = format!("@{bot_username}");
    if !bot_username.is_empty() && msg.mentions_user(&at_username) {
        return Route::Respond {
            prompt: msg.text_without_mention(&at_username),
            directive: None,
        };
    }

    Route::Ignore
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = msg.text().or(msg.caption()).unwrap_or("");

    // Bare /start carries no payload, so it sits outside the command
    // pattern; handled as an exact match.
    if text == "/start" {
        bot.send_message(msg.chat.id, GREETING).await?;
        return Ok(());
    }

    let me = match state
        .me
        .get_or_try_init(|| async {
            let me = bot.get_me().await?;
            Ok::<_, teloxide::RequestError>(BotIdentity {
                id: me.user.id.0,
                username: me.user.username.clone().unwrap_or_default(),
            })
        })
        .await
    {
        Ok(me) => me.clone(),
        Err(e) => {
            error!("Failed to resolve bot identity: {}", e);
            return Ok(());
        }
    };

    let (inbound, lookup) = convert(&msg);

    let Route::Respond { prompt, directive } = route(&inbound, &me.username) else {
        return Ok(());
    };
    if prompt.trim().is_empty() && inbound.media.is_empty() {
        return Ok(());
    }

    info!(
        "Message in chat {} from user {}: {}",
        inbound.chat_id, inbound.sender.id, prompt
    );

    bot.send_chat_action(msg.chat.id, ChatAction::Typing)
        .await
        .ok();

    let port = TelegramPort { bot: bot.clone() };
    let files = TelegramFiles { bot: bot.clone() };
    let pre: Vec<ConversationTurn> = directive
        .map(|d| vec![ConversationTurn::text(Role::System, d)])
        .unwrap_or_default();

    if let Err(e) = state
        .relay
        .run_turn(&port, &files, &inbound, &lookup, &prompt, &pre)
        .await
    {
        error!("Error processing message: {:#}", e);
    }

    Ok(())
}

/// Convert a teloxide message and its visible reply chain into the domain
/// model plus a parent-id lookup. The chain is walked iteratively over
/// whatever ancestors the update carried.
fn convert(msg: &Message) -> (InboundMessage, HashMap<i32, InboundMessage>) {
    let mut lookup = HashMap::new();
    let mut cursor = msg.reply_to_message();
    while let Some(ancestor) = cursor {
        lookup.insert(ancestor.id.0, convert_one(ancestor));
        cursor = ancestor.reply_to_message();
    }
    (convert_one(msg), lookup)
}

fn convert_one(msg: &Message) -> InboundMessage {
    let text = msg
        .text()
        .or(msg.caption())
        .unwrap_or_default()
        .to_string();

    let sender = msg
        .from
        .as_ref()
        .map(|user| Sender {
            id: user.id.0,
            is_bot: user.is_bot,
        })
        .unwrap_or(Sender {
            id: 0,
            is_bot: false,
        });

    let mut media = Vec::new();
    // One reference per photo size variant; variants may resolve to the
    // same file path and then get fetched more than once.
    for photo in msg.photo().into_iter().flatten() {
        media.push(MediaRef {
            kind: MediaKind::Image,
            file_id: photo.file.id.0.clone(),
            mime: None,
        });
    }
    if let Some(voice) = msg.voice() {
        media.push(MediaRef {
            kind: MediaKind::Audio,
            file_id: voice.file.id.0.clone(),
            mime: voice.mime_type.as_ref().map(|m| m.to_string()),
        });
    } else if let Some(audio) = msg.audio() {
        media.push(MediaRef {
            kind: MediaKind::Audio,
            file_id: audio.file.id.0.clone(),
            mime: audio.mime_type.as_ref().map(|m| m.to_string()),
        });
    }

    let entities = msg.entities().or(msg.caption_entities()).unwrap_or(&[]);
    let mentions = entities
        .iter()
        .filter(|e| e.kind == MessageEntityKind::Mention)
        .map(|e| utf16_substring(&text, e.offset, e.length))
        .collect();

    InboundMessage {
        id: msg.id.0,
        chat_id: msg.chat.id.0,
        private: msg.chat.is_private(),
        sender,
        text,
        media,
        mentions,
        parent_id: msg.reply_to_message().map(|parent| parent.id.0),
    }
}

/// Telegram entity offsets count UTF-16 code units, not bytes or chars.
fn utf16_substring(text: &str, offset: usize, length: usize) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let start = offset.min(units.len());
    let end = (offset + length).min(units.len());
    String::from_utf16_lossy(&units[start..end])
}

/// Outbound chat operations over the Telegram API.
struct TelegramPort {
    bot: Bot,
}

#[async_trait]
impl ChatPort for TelegramPort {
    async fn send_reply(&self, chat_id: i64, reply_to: i32, text: &str) -> Result<SentRef> {
        let sent = self
            .bot
            .send_message(ChatId(chat_id), text)
            .reply_parameters(ReplyParameters::new(MessageId(reply_to)))
            .await?;
        Ok(SentRef {
            chat_id: sent.chat.id.0,
            message_id: sent.id.0,
        })
    }

    async fn edit_rich(&self, target: SentRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(ChatId(target.chat_id), MessageId(target.message_id), text)
            .parse_mode(ParseMode::MarkdownV2)
            .await?;
        Ok(())
    }

    async fn edit_plain_detached(&self, target: SentRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(ChatId(target.chat_id), MessageId(target.message_id), text)
            .reply_markup(InlineKeyboardMarkup::default())
            .await?;
        Ok(())
    }
}

/// File-id resolution through the owning bot.
struct TelegramFiles {
    bot: Bot,
}

#[async_trait]
impl FileResolver for TelegramFiles {
    async fn download_url(&self, file_id: &str) -> Result<String, MediaFetchError> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| MediaFetchError::Resolve {
                file_id: file_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.bot.token(),
            file.path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_msg(text: &str, mentions: &[&str]) -> InboundMessage {
        InboundMessage {
            id: 1,
            chat_id: -100,
            private: false,
            sender: Sender {
                id: 5,
                is_bot: false,
            },
            text: text.to_string(),
            media: Vec::new(),
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
            parent_id: None,
        }
    }

    fn private_msg(text: &str) -> InboundMessage {
        InboundMessage {
            private: true,
            ..group_msg(text, &[])
        }
    }

    #[test]
    fn test_group_without_command_or_mention_is_ignored() {
        let msg = group_msg("just chatting", &[]);
        assert_eq!(route(&msg, "relaybot"), Route::Ignore);
    }

    #[test]
    fn test_group_with_unrelated_mention_is_ignored() {
        let msg = group_msg("hey @someoneelse", &["@someoneelse"]);
        assert_eq!(route(&msg, "relaybot"), Route::Ignore);
    }

    #[test]
    fn test_private_chat_is_always_processed() {
        let msg = private_msg("what is rust?");
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "what is rust?".to_string(),
                directive: None,
            }
        );
    }

    #[test]
    fn test_ask_command_works_in_groups() {
        let msg = group_msg("/ask what is rust?", &[]);
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "what is rust?".to_string(),
                directive: None,
            }
        );
    }

    #[test]
    fn test_polish_command_carries_directive() {
        let msg = private_msg("/polish me want food");
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "me want food".to_string(),
                directive: Some(prompts::polish_directive()),
            }
        );
    }

    #[test]
    fn test_mention_is_stripped_from_prompt() {
        let msg = group_msg("@relaybot what is rust?", &["@relaybot"]);
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "what is rust?".to_string(),
                directive: None,
            }
        );
    }

    #[test]
    fn test_mention_strip_keeps_later_occurrence() {
        let msg = group_msg("@relaybot say @relaybot three times", &["@relaybot"]);
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "say @relaybot three times".to_string(),
                directive: None,
            }
        );
    }

    #[test]
    fn test_unknown_command_in_group_is_ignored() {
        let msg = group_msg("/weather tokyo", &[]);
        assert_eq!(route(&msg, "relaybot"), Route::Ignore);
    }

    #[test]
    fn test_unknown_command_in_private_is_plain_text() {
        let msg = private_msg("/weather tokyo");
        assert_eq!(
            route(&msg, "relaybot"),
            Route::Respond {
                prompt: "/weather tokyo".to_string(),
                directive: None,
            }
        );
    }

    #[test]
    fn test_utf16_substring_handles_wide_chars() {
        // "😀" is two UTF-16 code units; the mention starts at offset 3.
        let text = "😀 @bot hi";
        assert_eq!(utf16_substring(text, 3, 4), "@bot");
        assert_eq!(utf16_substring(text, 0, 2), "😀");
    }

    #[test]
    fn test_utf16_substring_clamps_out_of_range() {
        assert_eq!(utf16_substring("abc", 10, 5), "");
        assert_eq!(utf16_substring("abc", 1, 100), "bc");
    }
}
