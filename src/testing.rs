//! In-memory bot client and invocation fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use teloxide::types::{BotCommand, Update};
use tokio::time::Instant;

use crate::client::{AdminEntry, BotApi, BotIdentity, OutgoingText, ReplyTarget};
use crate::error::ClientError;
use crate::handler::{ChatInfo, Invocation, MessageInfo, UserInfo};

type PollResult = Result<Vec<Update>, ClientError>;

#[derive(Default)]
struct Recorded {
    poll_script: VecDeque<PollResult>,
    poll_error: Option<ClientError>,
    fetches: Vec<(Instant, i32, Duration)>,
    drops: usize,
    commands: usize,
    chat_error: Option<ClientError>,
    send_error: Option<ClientError>,
    sent: Vec<(ReplyTarget, OutgoingText)>,
    documents: Vec<(String, Vec<u8>)>,
    edits: Vec<String>,
    answered: Vec<String>,
    next_message_id: i32,
}

/// Scriptable [`BotApi`] that records everything sent through it.
#[derive(Default)]
pub struct MockBot {
    inner: Mutex<Recorded>,
    get_me_fails: AtomicBool,
    send_delay: Mutex<Duration>,
}

impl MockBot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results for the next fetches, in order. Once used up, fetches either
    /// fail with the `fail_polls` error or idle for their timeout.
    pub fn script_polls(&self, script: Vec<PollResult>) {
        self.inner.lock().poll_script.extend(script);
    }

    pub fn fail_polls(&self, err: ClientError) {
        self.inner.lock().poll_error = Some(err);
    }

    pub fn fail_chat_queries(&self, err: ClientError) {
        self.inner.lock().chat_error = Some(err);
    }

    pub fn fail_sends(&self, err: ClientError) {
        self.inner.lock().send_error = Some(err);
    }

    /// Make every `send_text` take `delay` before it is recorded.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    pub fn set_get_me_fails(&self, fails: bool) {
        self.get_me_fails.store(fails, Ordering::SeqCst);
    }

    pub fn fetch_instants(&self) -> Vec<Instant> {
        self.inner.lock().fetches.iter().map(|f| f.0).collect()
    }

    pub fn fetch_offsets(&self) -> Vec<i32> {
        self.inner.lock().fetches.iter().map(|f| f.1).collect()
    }

    pub fn drop_calls(&self) -> usize {
        self.inner.lock().drops
    }

    pub fn commands_registered(&self) -> usize {
        self.inner.lock().commands
    }

    pub fn sent_texts(&self) -> Vec<(ReplyTarget, OutgoingText)> {
        self.inner.lock().sent.clone()
    }

    pub fn documents(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().documents.clone()
    }

    pub fn edits(&self) -> Vec<String> {
        self.inner.lock().edits.clone()
    }

    pub fn answered_callbacks(&self) -> Vec<String> {
        self.inner.lock().answered.clone()
    }

    fn chat_query(&self) -> Result<(), ClientError> {
        match &self.inner.lock().chat_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BotApi for MockBot {
    async fn get_me(&self) -> Result<BotIdentity, ClientError> {
        if self.get_me_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Network("connection refused".into()));
        }
        Ok(BotIdentity {
            id: 999,
            username: "id_test_bot".to_string(),
            first_name: "ID Bot".to_string(),
        })
    }

    async fn drop_pending_updates(&self) -> Result<(), ClientError> {
        self.inner.lock().drops += 1;
        Ok(())
    }

    async fn fetch_updates(&self, offset: i32, timeout: Duration) -> PollResult {
        let scripted = {
            let mut inner = self.inner.lock();
            inner.fetches.push((Instant::now(), offset, timeout));
            match inner.poll_script.pop_front() {
                Some(result) => Some(result),
                None => inner.poll_error.clone().map(Err),
            }
        };
        match scripted {
            Some(result) => result,
            None => {
                // An idle long poll.
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn set_commands(&self, commands: Vec<BotCommand>) -> Result<(), ClientError> {
        self.inner.lock().commands = commands.len();
        Ok(())
    }

    async fn member_count(&self, _chat_id: i64) -> Result<u32, ClientError> {
        self.chat_query()?;
        Ok(17)
    }

    async fn administrators(&self, _chat_id: i64) -> Result<Vec<AdminEntry>, ClientError> {
        self.chat_query()?;
        Ok(vec![
            AdminEntry {
                user_id: 1,
                full_name: "Alice".to_string(),
            },
            AdminEntry {
                user_id: 2,
                full_name: "Bob <ops>".to_string(),
            },
        ])
    }

    async fn send_text(&self, target: ReplyTarget, text: OutgoingText) -> Result<i32, ClientError> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock();
        if let Some(e) = &inner.send_error {
            return Err(e.clone());
        }
        inner.sent.push((target, text));
        inner.next_message_id += 1;
        Ok(500 + inner.next_message_id)
    }

    async fn send_document(
        &self,
        _target: ReplyTarget,
        file_name: String,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        if let Some(e) = &inner.send_error {
            return Err(e.clone());
        }
        inner.documents.push((file_name, bytes));
        Ok(())
    }

    async fn edit_text(
        &self,
        _chat_id: i64,
        _message_id: i32,
        text: String,
        _html: bool,
    ) -> Result<(), ClientError> {
        self.inner.lock().edits.push(text);
        Ok(())
    }

    async fn answer_callback(&self, callback_id: String) -> Result<(), ClientError> {
        self.inner.lock().answered.push(callback_id);
        Ok(())
    }
}

fn ada() -> UserInfo {
    UserInfo {
        id: 42,
        is_bot: false,
        username: Some("ada".to_string()),
        first_name: "Ada".to_string(),
        last_name: Some("Lovelace".to_string()),
        language_code: Some("en".to_string()),
    }
}

/// `/id` sent by Ada in her private chat with the bot.
pub fn private_invocation() -> Invocation {
    Invocation {
        chat: ChatInfo {
            id: 42,
            kind: "private".to_string(),
            username: Some("ada".to_string()),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            ..ChatInfo::default()
        },
        user: Some(ada()),
        message: MessageInfo {
            id: 100,
            text: Some("/id".to_string()),
            ..MessageInfo::default()
        },
    }
}

/// `/export` sent by Ada in a supergroup, inside topic `thread` if given.
pub fn group_invocation(thread: Option<i32>) -> Invocation {
    Invocation {
        chat: ChatInfo {
            id: -1001234,
            kind: "supergroup".to_string(),
            title: Some("Rustaceans 🦀".to_string()),
            username: Some("rustaceans".to_string()),
            ..ChatInfo::default()
        },
        user: Some(ada()),
        message: MessageInfo {
            id: 100,
            thread_id: thread,
            is_topic_message: thread.is_some(),
            text: Some("/export".to_string()),
            ..MessageInfo::default()
        },
    }
}

/// A wire-format update carrying `text` from Ada's private chat.
pub fn command_update(update_id: u32, text: &str) -> Update {
    let json = serde_json::json!({
        "update_id": update_id,
        "message": {
            "message_id": 100,
            "date": 1_700_000_000,
            "chat": {
                "id": 42,
                "type": "private",
                "username": "ada",
                "first_name": "Ada",
                "last_name": "Lovelace"
            },
            "from": {
                "id": 42,
                "is_bot": false,
                "first_name": "Ada",
                "last_name": "Lovelace",
                "username": "ada",
                "language_code": "en"
            },
            "text": text,
            "entities": [{ "type": "bot_command", "offset": 0, "length": text.len() }]
        }
    });
    parse_update(&json)
}

/// Ada pressing the menu button `payload` under the bot's menu message in
/// her private chat.
pub fn button_update(update_id: u32, payload: &str) -> Update {
    let json = serde_json::json!({
        "update_id": update_id,
        "callback_query": {
            "id": format!("cb-{update_id}"),
            "from": {
                "id": 42,
                "is_bot": false,
                "first_name": "Ada",
                "last_name": "Lovelace",
                "username": "ada",
                "language_code": "en"
            },
            "message": {
                "message_id": 101,
                "date": 1_700_000_000,
                "chat": {
                    "id": 42,
                    "type": "private",
                    "username": "ada",
                    "first_name": "Ada",
                    "last_name": "Lovelace"
                },
                "from": {
                    "id": 999,
                    "is_bot": true,
                    "first_name": "ID Bot",
                    "username": "id_test_bot"
                },
                "text": "Hi! I Can Show IDs And Chat Info."
            },
            "chat_instance": "-5551234",
            "data": payload
        }
    });
    parse_update(&json)
}

// `Update` only deserializes its kind correctly from text, not from a `Value`.
fn parse_update(json: &serde_json::Value) -> Update {
    serde_json::from_str(&json.to_string()).expect("valid update json")
}
