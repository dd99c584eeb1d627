//! Telegram Bot API client (long polling, sendMessage, keyboard edits).

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<Box<Message>>,
}

/// One inbound event, reduced to what the dialogue needs: who sent it, what
/// they said (if it was text at all), and which message carried the inline
/// keyboard when it was a button press.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub chat_id: i64,
    pub text: Option<String>,
    pub keyboard_message_id: Option<i64>,
}

impl Update {
    /// A button press carries its payload in `callback_query.data`; a plain
    /// message in `message.text` (absent for stickers, photos and the like).
    pub fn inbound(&self) -> Option<Inbound> {
        if let Some(query) = &self.callback_query {
            let message = query.message.as_ref()?;
            return Some(Inbound {
                chat_id: message.chat.id,
                text: query.data.clone(),
                keyboard_message_id: Some(message.message_id),
            });
        }
        let message = self.message.as_ref()?;
        Some(Inbound {
            chat_id: message.chat.id,
            text: message.text.clone(),
            keyboard_message_id: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct SendOptions {
    /// Render the text with Telegram's HTML parse mode.
    pub html: bool,
    /// Inline keyboard markup to attach.
    pub markup: Option<serde_json::Value>,
}

/// Outbound side of the messaging provider. Failure is an outcome, not an
/// error: a refused or undeliverable message comes back as `false`.
#[async_trait]
pub trait MessageSender {
    async fn send(&self, chat_id: i64, text: &str, options: SendOptions) -> bool;

    /// Removes the inline keyboard from a previously sent message.
    async fn clear_markup(&self, chat_id: i64, message_id: i64) -> bool;
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{token}"),
        }
    }

    /// Fetches updates with ids at or above `offset`. Passing an offset also
    /// acknowledges everything below it.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response = self
            .http
            .get(format!("{}/getUpdates", self.base))
            .query(&[("offset", offset)])
            .send()
            .await
            .context("getUpdates request failed")?;
        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .context("getUpdates response is not valid JSON")?;
        if !body.ok {
            bail!(
                "getUpdates rejected: {}",
                body.description.unwrap_or_else(|| "no description".to_string())
            );
        }
        Ok(body.result.unwrap_or_default())
    }

    async fn post(&self, method: &str, params: &serde_json::Value) -> bool {
        match self
            .http
            .post(format!("{}/{}", self.base, method))
            .json(params)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(method, status = %response.status(), "Telegram call refused");
                false
            }
            Err(e) => {
                warn!(method, error = %e, "Telegram call failed");
                false
            }
        }
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str, options: SendOptions) -> bool {
        let mut params = json!({ "chat_id": chat_id, "text": text });
        if options.html {
            params["parse_mode"] = json!("HTML");
        }
        if let Some(markup) = options.markup {
            params["reply_markup"] = markup;
        }
        self.post("sendMessage", &params).await
    }

    async fn clear_markup(&self, chat_id: i64, message_id: i64) -> bool {
        let params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": { "inline_keyboard": [] },
        });
        self.post("editMessageReplyMarkup", &params).await
    }
}
