//! Telegram Bot API transport over long polling.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mira_worker::{Button, ChannelError, ControlChannel, RemoteFile};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects longer messages.
pub const MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub document: Option<Document>,
    pub photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct FileResult {
    file_id: String,
    file_path: Option<String>,
    file_size: Option<u64>,
}

pub struct TelegramChannel {
    http: reqwest::Client,
    token: String,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, ChannelError> {
        let response = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        unwrap_response(response).await
    }

    /// Verifies the token; returns the bot's username.
    pub async fn get_me(&self) -> Result<String, ChannelError> {
        let me: Value = self.call("getMe", json!({})).await?;
        Ok(me["username"].as_str().unwrap_or("unknown").to_string())
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ChannelError> {
        let response = self
            .http
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .json(&json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }))
            .send()
            .await
            .map_err(transport)?;
        unwrap_response(response).await
    }

    pub async fn answer_callback(&self, callback_id: &str) {
        let result: Result<Value, _> = self
            .call("answerCallbackQuery", json!({ "callback_query_id": callback_id }))
            .await;
        if let Err(e) = result {
            debug!(error = %e, "answerCallbackQuery failed");
        }
    }
}

async fn unwrap_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ChannelError> {
    let parsed: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| ChannelError::Decode(e.to_string()))?;
    if !parsed.ok {
        return Err(ChannelError::Api {
            code: parsed.error_code.unwrap_or_default(),
            description: parsed.description.unwrap_or_default(),
        });
    }
    parsed
        .result
        .ok_or_else(|| ChannelError::Decode("missing result".to_string()))
}

fn transport(err: reqwest::Error) -> ChannelError {
    ChannelError::Transport(err.to_string())
}

fn keyboard(rows: &[Vec<Button>]) -> Value {
    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Splits `text` into chunks of at most `limit` characters, preferring line
/// breaks, then spaces.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.chars().count() > limit {
        let hard = remaining
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..hard];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard);
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start();
    }
    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

#[async_trait]
impl ControlChannel for TelegramChannel {
    /// Long texts go out as several messages; the id of the last one is returned.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, ChannelError> {
        let mut last = 0;
        for chunk in split_message(text, MESSAGE_LIMIT) {
            let sent: SentMessage = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
            last = sent.message_id;
        }
        Ok(last)
    }

    async fn send_buttons(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<Button>],
    ) -> Result<i64, ChannelError> {
        let mut chunks = split_message(text, MESSAGE_LIMIT);
        let last = chunks.pop().unwrap_or_default();
        for chunk in chunks {
            let _: SentMessage = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        let sent: SentMessage = self
            .call(
                "sendMessage",
                json!({ "chat_id": chat_id, "text": last, "reply_markup": keyboard(rows) }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), ChannelError> {
        let text: String = text.chars().take(MESSAGE_LIMIT).collect();
        let result: Result<Value, _> = self
            .call(
                "editMessageText",
                json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Same text as before.
            Err(ChannelError::Api { description, .. }) if description.contains("not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), ChannelError> {
        let _: Value = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<i64, ChannelError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChannelError::Transport(format!("read {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| n.contains('.'))
            .unwrap_or_else(|| "hasil.txt".to_string());
        let part = Part::bytes(bytes)
            .file_name(name)
            .mime_str("text/plain")
            .map_err(transport)?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.chars().take(1024).collect::<String>())
            .part("document", part);

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        let sent: SentMessage = unwrap_response(response).await?;
        Ok(sent.message_id)
    }

    async fn file_info(&self, file_id: &str) -> Result<RemoteFile, ChannelError> {
        let file: FileResult = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| ChannelError::Decode("file has no download path".to_string()))?;
        Ok(RemoteFile {
            file_id: file.file_id,
            file_path,
            size: file.file_size,
        })
    }

    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError> {
        let url = format!("{API_BASE}/file/bot{}/{}", self.token, file.file_path);
        let response = self.http.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "File download rejected");
            return Err(ChannelError::Api {
                code: i64::from(status.as_u16()),
                description: status.to_string(),
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
