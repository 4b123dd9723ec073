//! Maps commands and button payloads to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use teloxide::types::{Update, UpdateKind};
use teloxide::utils::command::BotCommands;
use tracing::{debug, info, warn};

use crate::client::BotApi;
use crate::error::HandlerError;
use crate::handler::{self, apology, deliver, Invocation, Reply};

pub type HandlerFuture<'a> = BoxFuture<'a, Result<Reply, HandlerError>>;

/// A handler: reads the invocation, may call the bot client, returns a reply.
pub type Handler = for<'a> fn(&'a Invocation, &'a dyn BotApi) -> HandlerFuture<'a>;

/// Command list shown by Telegram clients. Button payloads use the same names.
#[derive(BotCommands, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "Show menu")]
    Start,
    #[command(description = "Show this help")]
    Help,
    #[command(description = "Your Telegram ID")]
    Id,
    #[command(description = "This chat's/group's ID")]
    ChatId,
    #[command(description = "Topic ID of this thread")]
    TopicId,
    #[command(description = "Member count")]
    Members,
    #[command(description = "List chat/group admins")]
    Admins,
    #[command(description = "Export chat info as JSON")]
    Export,
    #[command(description = "Show detailed user info")]
    UserInfo,
    #[command(description = "Test bot latency")]
    Ping,
    #[command(description = "Get file ID of replied media")]
    FileId,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::Start,
        Command::Help,
        Command::Id,
        Command::ChatId,
        Command::TopicId,
        Command::Members,
        Command::Admins,
        Command::Export,
        Command::UserInfo,
        Command::Ping,
        Command::FileId,
    ];

    /// Commands reachable from the start menu, in menu order.
    pub const BUTTONS: [Command; 9] = [
        Command::Id,
        Command::ChatId,
        Command::Admins,
        Command::Members,
        Command::Export,
        Command::UserInfo,
        Command::Help,
        Command::TopicId,
        Command::Ping,
    ];

    /// Command name without the slash; also the button payload.
    pub fn name(&self) -> String {
        // Mirrors `rename_rule = "lowercase"`.
        format!("{self:?}").to_lowercase()
    }

    pub fn button_label(&self) -> &'static str {
        match self {
            Command::Id => "Your ID",
            Command::ChatId => "This Chat/Group ID",
            Command::Admins => "Admins",
            Command::Members => "👥 Members",
            Command::Export => "📦 Export JSON",
            Command::UserInfo => "ℹ️ User Info",
            Command::Help => "🆘 Help",
            Command::TopicId => "🧵 Topic ID",
            Command::Ping => "🏓 Ping",
            Command::Start => "Menu",
            Command::FileId => "🆔 File ID",
        }
    }

    /// Completes "Could Not ..." in apologies.
    pub fn failure_label(&self) -> &'static str {
        match self {
            Command::Start => "Show The Menu",
            Command::Help => "Show Help",
            Command::Id => "Show Your ID",
            Command::ChatId => "Show The Chat ID",
            Command::TopicId => "Show The Topic ID",
            Command::Members => "Fetch Member Count",
            Command::Admins => "Fetch Admins",
            Command::Export => "Export Chat Info",
            Command::UserInfo => "Show User Info",
            Command::Ping => "Measure Latency",
            Command::FileId => "Get The File ID",
        }
    }

    fn handler(&self) -> Handler {
        match self {
            Command::Start => handler::start,
            Command::Help => handler::help,
            Command::Id => handler::user_id,
            Command::ChatId => handler::chat_id,
            Command::TopicId => handler::topic_id,
            Command::Members => handler::members,
            Command::Admins => handler::admins,
            Command::Export => handler::export,
            Command::UserInfo => handler::user_info,
            Command::Ping => handler::ping,
            Command::FileId => handler::file_id,
        }
    }
}

/// The command at the start of `text`, or `None` when there is none or it is
/// addressed to another bot.
pub fn parse_command(text: &str, bot_username: &str) -> Option<Command> {
    // Arguments are ignored, and names match regardless of case.
    let token = text.split_whitespace().next()?.to_lowercase();
    Command::parse(&token, &bot_username.to_lowercase()).ok()
}

/// A handler whose failures become apologies instead of errors.
#[derive(Clone, Copy)]
pub struct Guarded {
    command: Command,
    handler: Handler,
}

impl Guarded {
    pub async fn call(&self, inv: &Invocation, api: &dyn BotApi) -> Reply {
        match (self.handler)(inv, api).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(command = ?self.command, chat_id = inv.chat.id, error = %e, "Handler failed");
                apology(self.command, &e)
            }
        }
    }
}

pub fn with_error_boundary(command: Command, handler: Handler) -> Guarded {
    Guarded { command, handler }
}

/// The two discriminator namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discriminator<'a> {
    Command(&'a str),
    Button(&'a str),
}

/// An inbound event reduced to what the router needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Command {
        command: Command,
        invocation: Invocation,
    },
    Button {
        callback_id: String,
        payload: String,
        invocation: Invocation,
    },
}

impl Event {
    pub fn from_update(update: &Update, bot_username: &str) -> Option<Event> {
        match &update.kind {
            UpdateKind::Message(msg) => {
                let command = parse_command(msg.text()?, bot_username)?;
                Some(Event::Command {
                    command,
                    invocation: Invocation::from_message(msg, msg.from.as_ref()),
                })
            }
            UpdateKind::CallbackQuery(query) => {
                let payload = query.data.clone()?;
                let msg = query.regular_message()?;
                Some(Event::Button {
                    callback_id: query.id.clone(),
                    payload,
                    invocation: Invocation::from_message(msg, Some(&query.from)),
                })
            }
            _ => None,
        }
    }
}

/// Stateless dispatch table. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    commands: Arc<HashMap<Command, Guarded>>,
    buttons: Arc<HashMap<Command, Guarded>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        let mut buttons = HashMap::new();
        for command in Command::ALL {
            let guarded = with_error_boundary(command, command.handler());
            commands.insert(command, guarded);
            if Command::BUTTONS.contains(&command) {
                buttons.insert(command, guarded);
            }
        }
        Self {
            commands: Arc::new(commands),
            buttons: Arc::new(buttons),
        }
    }

    fn lookup(&self, discriminator: Discriminator<'_>) -> Option<&Guarded> {
        let (name, table) = match discriminator {
            Discriminator::Command(name) => (name, &self.commands),
            Discriminator::Button(payload) => (payload, &self.buttons),
        };
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '@') {
            return None;
        }
        let command = parse_command(&format!("/{name}"), "")?;
        table.get(&command)
    }

    /// Run the handler for `discriminator` and return its reply, or `None`
    /// when nothing is registered under it.
    pub async fn reply_for(
        &self,
        discriminator: Discriminator<'_>,
        inv: &Invocation,
        api: &dyn BotApi,
    ) -> Option<Reply> {
        let guarded = self.lookup(discriminator)?;
        Some(guarded.call(inv, api).await)
    }

    /// Dispatch and deliver. Returns whether a handler was found.
    pub async fn dispatch(
        &self,
        discriminator: Discriminator<'_>,
        inv: &Invocation,
        api: &dyn BotApi,
    ) -> bool {
        let Some(reply) = self.reply_for(discriminator, inv, api).await else {
            debug!(?discriminator, chat_id = inv.chat.id, "No handler registered");
            return false;
        };
        if let Err(e) = deliver(api, inv.reply_target(), reply).await {
            warn!(?discriminator, chat_id = inv.chat.id, error = %e, "Failed to deliver reply");
        }
        true
    }

    /// Handle one inbound event end to end.
    pub async fn handle_event(&self, event: Event, api: &dyn BotApi) -> bool {
        match event {
            Event::Command {
                command,
                invocation,
            } => {
                let name = command.name();
                info!(
                    command = %name,
                    chat_id = invocation.chat.id,
                    user_id = ?invocation.user.as_ref().map(|u| u.id),
                    "Command received"
                );
                self.dispatch(Discriminator::Command(&name), &invocation, api)
                    .await
            }
            Event::Button {
                callback_id,
                payload,
                invocation,
            } => {
                info!(
                    payload = %payload,
                    chat_id = invocation.chat.id,
                    user_id = ?invocation.user.as_ref().map(|u| u.id),
                    "Button pressed"
                );
                // Stops the client's loading spinner; nothing to do if it fails.
                if let Err(e) = api.answer_callback(callback_id).await {
                    debug!(error = %e, "Failed to answer callback query");
                }
                self.dispatch(Discriminator::Button(&payload), &invocation, api)
                    .await
            }
        }
    }

    pub async fn handle_update(&self, update: Update, api: &dyn BotApi, bot_username: &str) -> bool {
        match Event::from_update(&update, bot_username) {
            Some(event) => self.handle_event(event, api).await,
            None => {
                debug!(update_id = update.id.0, "Ignoring update");
                false
            }
        }
    }
}
