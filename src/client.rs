//! The seam between the bot and the Telegram Bot API.
//!
//! The supervisor and the handlers only talk to [`BotApi`]; [`TeloxideClient`]
//! is the production implementation on top of teloxide.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use teloxide::net::default_reqwest_settings;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, BotCommand, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
    ReplyParameters, ThreadId,
};
use tracing::debug;

use crate::config::Config;
use crate::error::ClientError;

/// Who the bot is, as reported by `getMe`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BotIdentity {
    pub id: u64,
    pub username: String,
    pub first_name: String,
}

/// One chat administrator, enough to render a mention.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminEntry {
    pub user_id: u64,
    pub full_name: String,
}

/// Where an outgoing message goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyTarget {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
    pub reply_to: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingText {
    pub text: String,
    pub html: bool,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_me(&self) -> Result<BotIdentity, ClientError>;

    /// Drop events queued while nobody was polling.
    async fn drop_pending_updates(&self) -> Result<(), ClientError>;

    /// One long-poll round. `offset` is the first update id still wanted.
    async fn fetch_updates(&self, offset: i32, timeout: Duration)
        -> Result<Vec<Update>, ClientError>;

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), ClientError>;

    async fn member_count(&self, chat_id: i64) -> Result<u32, ClientError>;

    async fn administrators(&self, chat_id: i64) -> Result<Vec<AdminEntry>, ClientError>;

    /// Returns the id of the sent message.
    async fn send_text(&self, target: ReplyTarget, text: OutgoingText) -> Result<i32, ClientError>;

    async fn send_document(
        &self,
        target: ReplyTarget,
        file_name: String,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError>;

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: String,
        html: bool,
    ) -> Result<(), ClientError>;

    async fn answer_callback(&self, callback_id: String) -> Result<(), ClientError>;
}

/// [`BotApi`] backed by a teloxide [`Bot`].
#[derive(Clone)]
pub struct TeloxideClient {
    bot: Bot,
}

impl TeloxideClient {
    /// Build the HTTP client with the configured timeout. Fails on a broken TLS
    /// or proxy setup, which is not recoverable.
    pub fn connect(config: &Config) -> Result<Self, ClientError> {
        let client = default_reqwest_settings()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Construction(e.to_string()))?;

        let mut bot = Bot::with_client(config.token.clone(), client);
        if let Some(url) = &config.api_url {
            bot = bot.set_api_url(url.clone());
        }
        Ok(Self { bot })
    }
}

fn target_chat(target: &ReplyTarget) -> ChatId {
    ChatId(target.chat_id)
}

#[async_trait]
impl BotApi for TeloxideClient {
    async fn get_me(&self) -> Result<BotIdentity, ClientError> {
        let me = self.bot.get_me().await?;
        Ok(BotIdentity {
            id: me.id.0,
            username: me.username().to_string(),
            first_name: me.first_name.clone(),
        })
    }

    async fn drop_pending_updates(&self) -> Result<(), ClientError> {
        self.bot.delete_webhook().drop_pending_updates(true).await?;
        Ok(())
    }

    async fn fetch_updates(
        &self,
        offset: i32,
        timeout: Duration,
    ) -> Result<Vec<Update>, ClientError> {
        let mut request = self
            .bot
            .get_updates()
            .timeout(timeout.as_secs() as u32)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
        if offset > 0 {
            request = request.offset(offset);
        }
        Ok(request.await?)
    }

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), ClientError> {
        self.bot.set_my_commands(commands).await?;
        Ok(())
    }

    async fn member_count(&self, chat_id: i64) -> Result<u32, ClientError> {
        Ok(self.bot.get_chat_member_count(ChatId(chat_id)).await?)
    }

    async fn administrators(&self, chat_id: i64) -> Result<Vec<AdminEntry>, ClientError> {
        let admins = self.bot.get_chat_administrators(ChatId(chat_id)).await?;
        Ok(admins
            .into_iter()
            .map(|member| AdminEntry {
                user_id: member.user.id.0,
                full_name: member.user.full_name(),
            })
            .collect())
    }

    async fn send_text(&self, target: ReplyTarget, text: OutgoingText) -> Result<i32, ClientError> {
        let mut request = self.bot.send_message(target_chat(&target), text.text);
        if text.html {
            request = request.parse_mode(ParseMode::Html);
        }
        if let Some(thread) = target.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        if let Some(reply_to) = target.reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
        }
        if let Some(keyboard) = text.keyboard {
            request = request.reply_markup(keyboard);
        }
        let sent = request.await?;
        debug!(chat_id = target.chat_id, message_id = sent.id.0, "Message sent");
        Ok(sent.id.0)
    }

    async fn send_document(
        &self,
        target: ReplyTarget,
        file_name: String,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        let file = InputFile::memory(bytes).file_name(file_name);
        let mut request = self.bot.send_document(target_chat(&target), file);
        if let Some(thread) = target.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        if let Some(reply_to) = target.reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
        }
        request.await?;
        Ok(())
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: String,
        html: bool,
    ) -> Result<(), ClientError> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text);
        if html {
            request = request.parse_mode(ParseMode::Html);
        }
        request.await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: String) -> Result<(), ClientError> {
        self.bot.answer_callback_query(callback_id).await?;
        Ok(())
    }
}
