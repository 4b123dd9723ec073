use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, Message, User};
use teloxide::utils::html;
use tracing::{debug, warn};

use crate::client::{BotApi, OutgoingText, ReplyTarget};
use crate::error::{ClientError, HandlerError};
use crate::router::{Command, HandlerFuture};

/// Chat fields the handlers read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatInfo {
    pub id: i64,
    pub kind: String,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub bio: Option<String>,
    pub description: Option<String>,
    pub invite_link: Option<String>,
}

impl ChatInfo {
    pub fn is_group_like(&self) -> bool {
        self.kind == "group" || self.kind == "supergroup"
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserInfo {
    pub id: u64,
    pub is_bot: bool,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

impl UserInfo {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageInfo {
    pub id: i32,
    pub thread_id: Option<i32>,
    pub is_topic_message: bool,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media_group_id: Option<String>,
    pub has_protected_content: bool,
    pub date: Option<DateTime<Utc>>,
    pub edit_date: Option<DateTime<Utc>>,
    pub entities: Option<Vec<Value>>,
    pub reply_to_message_id: Option<i32>,
    /// File id of the media in the replied-to message, if any.
    pub reply_file_id: Option<String>,
}

/// Everything a handler needs to know about the event that invoked it.
///
/// For a button press the chat and message are those of the menu message
/// the button belongs to, and the user is whoever pressed it. That makes a
/// button and its command produce the same reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Invocation {
    pub chat: ChatInfo,
    pub user: Option<UserInfo>,
    pub message: MessageInfo,
}

fn raw_str(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

fn chat_kind(msg: &Message) -> &'static str {
    let chat = &msg.chat;
    if chat.is_private() {
        "private"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_group() {
        "group"
    } else {
        "channel"
    }
}

fn media_file_id(msg: &Message) -> Option<String> {
    if let Some(sticker) = msg.sticker() {
        return Some(sticker.file.id.to_string());
    }
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(photo.file.id.to_string());
    }
    if let Some(document) = msg.document() {
        return Some(document.file.id.to_string());
    }
    msg.video().map(|video| video.file.id.to_string())
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.0,
            is_bot: user.is_bot,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            language_code: user.language_code.clone(),
        }
    }
}

impl Invocation {
    /// `actor` is the user behind the event; for commands that is the sender.
    pub fn from_message(msg: &Message, actor: Option<&User>) -> Self {
        // Fields that vary between Bot API revisions are read from the wire form.
        let raw_msg = serde_json::to_value(msg).unwrap_or_default();
        let raw_chat = serde_json::to_value(&msg.chat).unwrap_or_default();

        let chat = ChatInfo {
            id: msg.chat.id.0,
            kind: chat_kind(msg).to_string(),
            title: msg.chat.title().map(str::to_string),
            username: msg.chat.username().map(str::to_string),
            first_name: msg.chat.first_name().map(str::to_string),
            last_name: msg.chat.last_name().map(str::to_string),
            bio: raw_str(&raw_chat, "bio"),
            description: raw_str(&raw_chat, "description"),
            invite_link: raw_str(&raw_chat, "invite_link"),
        };

        let message = MessageInfo {
            id: msg.id.0,
            thread_id: msg.thread_id.map(|t| t.0 .0),
            is_topic_message: msg.is_topic_message,
            text: msg.text().map(str::to_string),
            caption: msg.caption().map(str::to_string),
            media_group_id: raw_str(&raw_msg, "media_group_id"),
            has_protected_content: raw_msg
                .get("has_protected_content")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            date: Some(msg.date),
            edit_date: msg.edit_date().copied(),
            entities: msg.entities().map(|entities| {
                entities
                    .iter()
                    .filter_map(|e| serde_json::to_value(e).ok())
                    .collect()
            }),
            reply_to_message_id: msg.reply_to_message().map(|m| m.id.0),
            reply_file_id: msg.reply_to_message().and_then(media_file_id),
        };

        Self {
            chat,
            user: actor.map(UserInfo::from),
            message,
        }
    }

    /// Replies go to the invoking message, inside its topic when there is one.
    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            chat_id: self.chat.id,
            thread_id: if self.message.is_topic_message {
                self.message.thread_id
            } else {
                None
            },
            reply_to: Some(self.message.id),
        }
    }

    fn require_user(&self) -> Result<&UserInfo, HandlerError> {
        self.user
            .as_ref()
            .ok_or(HandlerError::MissingContext("this update has no sender"))
    }
}

/// What a handler wants sent back.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Text(OutgoingText),
    Document { file_name: String, bytes: Vec<u8> },
    /// Round-trip probe; the latency is measured while delivering.
    Pong,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Reply::Text(OutgoingText {
            text: text.into(),
            html: false,
            keyboard: None,
        })
    }

    pub fn html(text: impl Into<String>) -> Self {
        Reply::Text(OutgoingText {
            text: text.into(),
            html: true,
            keyboard: None,
        })
    }
}

const START_TEXT: &str = "Hi! I Can Show IDs And Chat Info.\n\n\
Commands :\n\
/id – Your ID\n\
/chatid – This Chat's/Group's ID\n\
/topicid – Get The Topic ID In This Thread\n\
/members – Member Count\n\
/admins – List Admins\n\
/export – Export Chat Info As JSON\n\
/userinfo – Show Your Info\n\
/ping – Bot Latency\n\
/fileid – Get File ID Of Media";

const HELP_TEXT: &str = "📖 Available Commands:\n\n\
/start – Show Menu\n\
/help – Show This Help\n\
/id – Your Telegram ID\n\
/chatid – This Chat's/Group's ID\n\
/topicid – Get The Topic ID In This Thread\n\
/members – Member Count\n\
/admins – List Chat/Group Admins\n\
/export – Export Chat Info As JSON\n\
/userinfo – Show Detailed User Info\n\
/ping – Test Bot Latency\n\
/fileid – Get File ID From Media";

pub const EXPORT_FILE_NAME: &str = "Chat_Info.json";

/// One button per row, one row per button payload.
pub fn menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(Command::BUTTONS.iter().map(|command| {
        vec![InlineKeyboardButton::callback(
            command.button_label(),
            command.name(),
        )]
    }))
}

pub fn start<'a>(_inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(Reply::Text(OutgoingText {
            text: START_TEXT.to_string(),
            html: false,
            keyboard: Some(menu_keyboard()),
        }))
    })
}

pub fn help<'a>(_inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(Reply::plain(HELP_TEXT)) })
}

pub fn user_id<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        let user = inv.require_user()?;
        Ok(Reply::html(format!("Your ID : <code>{}</code>", user.id)))
    })
}

pub fn chat_id<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(Reply::html(format!(
            "Chat ID : <code>{}</code>\nType: {}",
            inv.chat.id, inv.chat.kind
        )))
    })
}

pub fn topic_id<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !inv.chat.is_group_like() {
            return Ok(Reply::plain(
                "⚠️ This command Only Works In SuperGroups With Topics Enabled.",
            ));
        }
        match inv.message.thread_id {
            Some(thread) if inv.message.is_topic_message => Ok(Reply::html(format!(
                "🧵 This Topic's ID : <code>{thread}</code>"
            ))),
            _ => Ok(Reply::plain(
                "⚠️ This Chat Has No Topic ID (Not In A Thread).",
            )),
        }
    })
}

pub fn members<'a>(inv: &'a Invocation, api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        let count = api.member_count(inv.chat.id).await?;
        Ok(Reply::html(format!("👥 Members : <b>{count}</b>")))
    })
}

pub fn admins<'a>(inv: &'a Invocation, api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        let admins = api.administrators(inv.chat.id).await?;
        let names: Vec<String> = admins
            .iter()
            .map(|admin| {
                format!(
                    "<a href=\"tg://user?id={}\">{}</a>",
                    admin.user_id,
                    html::escape(&admin.full_name)
                )
            })
            .collect();
        Ok(Reply::html(format!("👑 Admins :\n{}", names.join("\n"))))
    })
}

#[derive(Serialize)]
struct ChatSection<'a> {
    id: i64,
    #[serde(rename = "type")]
    kind: &'a str,
    title: Option<&'a str>,
    username: Option<&'a str>,
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    bio: Option<&'a str>,
    description: Option<&'a str>,
    invite_link: Option<&'a str>,
}

#[derive(Serialize)]
struct UserSection<'a> {
    id: u64,
    is_bot: bool,
    username: Option<&'a str>,
    first_name: &'a str,
    last_name: Option<&'a str>,
    full_name: String,
    language_code: Option<&'a str>,
}

#[derive(Serialize)]
struct MessageSection<'a> {
    message_id: i32,
    text: Option<&'a str>,
    caption: Option<&'a str>,
    media_group_id: Option<&'a str>,
    has_protected_content: bool,
    date: Option<String>,
    edit_date: Option<String>,
    entities: Option<&'a [Value]>,
    reply_to_message_id: Option<i32>,
}

#[derive(Serialize)]
struct ChatSnapshot<'a> {
    chat: ChatSection<'a>,
    from_user: Option<UserSection<'a>>,
    message: MessageSection<'a>,
}

impl<'a> From<&'a Invocation> for ChatSnapshot<'a> {
    fn from(inv: &'a Invocation) -> Self {
        let chat = &inv.chat;
        let msg = &inv.message;
        Self {
            chat: ChatSection {
                id: chat.id,
                kind: &chat.kind,
                title: chat.title.as_deref(),
                username: chat.username.as_deref(),
                first_name: chat.first_name.as_deref(),
                last_name: chat.last_name.as_deref(),
                bio: chat.bio.as_deref(),
                description: chat.description.as_deref(),
                invite_link: chat.invite_link.as_deref(),
            },
            from_user: inv.user.as_ref().map(|user| UserSection {
                id: user.id,
                is_bot: user.is_bot,
                username: user.username.as_deref(),
                first_name: &user.first_name,
                last_name: user.last_name.as_deref(),
                full_name: user.full_name(),
                language_code: user.language_code.as_deref(),
            }),
            message: MessageSection {
                message_id: msg.id,
                text: msg.text.as_deref(),
                caption: msg.caption.as_deref(),
                media_group_id: msg.media_group_id.as_deref(),
                has_protected_content: msg.has_protected_content,
                date: msg.date.map(|d| d.to_rfc3339()),
                edit_date: msg.edit_date.map(|d| d.to_rfc3339()),
                entities: msg.entities.as_deref(),
                reply_to_message_id: msg.reply_to_message_id,
            },
        }
    }
}

/// Pretty JSON of the chat, sender and message, as sent by `/export`.
pub fn export_json(inv: &Invocation) -> Result<Vec<u8>, HandlerError> {
    Ok(serde_json::to_vec_pretty(&ChatSnapshot::from(inv))?)
}

pub fn export<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(Reply::Document {
            file_name: EXPORT_FILE_NAME.to_string(),
            bytes: export_json(inv)?,
        })
    })
}

pub fn user_info<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        let user = inv.require_user()?;
        let username = user.username.as_deref().unwrap_or("N/A");
        let language = user.language_code.as_deref().unwrap_or("N/A");
        Ok(Reply::html(format!(
            "👤 <b>User Info</b>\n\
            ID : <code>{}</code>\n\
            Username : @{}\n\
            Name: {}\n\
            Language : {}\n\
            Bot : {}",
            user.id,
            html::escape(username),
            html::escape(&user.full_name()),
            html::escape(language),
            if user.is_bot { "Yes" } else { "No" }
        )))
    })
}

pub fn ping<'a>(_inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(Reply::Pong) })
}

pub fn file_id<'a>(inv: &'a Invocation, _api: &'a dyn BotApi) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &inv.message.reply_file_id {
            Some(id) => Ok(Reply::html(format!("🆔 File ID :\n<code>{}</code>", html::escape(id)))),
            None => Ok(Reply::plain(
                "⚠️ Reply To A Sticker/Photo/Document/Video To Get Its File ID",
            )),
        }
    })
}

/// The user-facing apology for a failed handler.
pub fn apology(command: Command, e: &HandlerError) -> Reply {
    let cause = match e {
        HandlerError::Client(ClientError::PermissionDenied(_)) => {
            "I don't have the rights to do that here. Make me an administrator and try again."
                .to_string()
        }
        HandlerError::Client(ClientError::Network(_) | ClientError::Timeout) => {
            "Telegram did not answer in time. Please try again.".to_string()
        }
        other => other.to_string(),
    };
    Reply::plain(format!("⚠️ Could Not {}\n{}", command.failure_label(), cause))
}

/// Send `reply` to `target`.
pub async fn deliver(api: &dyn BotApi, target: ReplyTarget, reply: Reply) -> Result<(), ClientError> {
    match reply {
        Reply::Text(text) => {
            api.send_text(target, text).await?;
        }
        Reply::Document { file_name, bytes } => {
            api.send_document(target, file_name, bytes).await?;
        }
        Reply::Pong => {
            let started = Instant::now();
            let probe = OutgoingText {
                text: "Pinging...".to_string(),
                html: false,
                keyboard: None,
            };
            let sent = api.send_text(target, probe).await?;
            let latency = started.elapsed().as_secs_f64() * 1000.0;
            debug!(chat_id = target.chat_id, latency_ms = latency, "Ping measured");
            if let Err(e) = api
                .edit_text(
                    target.chat_id,
                    sent,
                    format!("🏓 Pong ! : <b>{latency:.2} ms</b>"),
                    true,
                )
                .await
            {
                warn!(chat_id = target.chat_id, error = %e, "Failed to edit ping message");
            }
        }
    }
    Ok(())
}
