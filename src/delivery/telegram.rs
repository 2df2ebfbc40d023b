//! Telegram Bot API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app::{Result, TributaryError};
use crate::delivery::ChatPlatform;
use crate::domain::{Destination, DestinationClass, FeedId, MediaContent, UserId};

/// Longest text the Bot API accepts in one message.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    user: User,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

/// Bot API method and field used for a given MIME type.
fn media_method(mime: &str) -> (&'static str, &'static str) {
    match mime {
        "image/jpeg" | "image/png" | "image/webp" => ("sendPhoto", "photo"),
        "image/gif" => ("sendAnimation", "animation"),
        "video/mp4" => ("sendVideo", "video"),
        _ => ("sendDocument", "document"),
    }
}

/// Admins that can receive direct messages. Bots cannot be messaged by bots.
fn human_admins(members: Vec<ChatMember>) -> Vec<UserId> {
    members
        .into_iter()
        .filter(|m| !m.user.is_bot)
        .map(|m| UserId(m.user.id))
        .collect()
}

fn destination_class(kind: &str) -> DestinationClass {
    match kind {
        "private" => DestinationClass::Direct,
        "channel" => DestinationClass::Channel,
        _ => DestinationClass::Group,
    }
}

/// Numeric ids go out as integers, `@usernames` as strings.
fn chat_id(alias: &str) -> Value {
    match alias.trim().parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(alias.trim()),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn interpret<T>(status: StatusCode, response: ApiResponse<T>) -> Result<T> {
    if response.ok {
        return response
            .result
            .ok_or_else(|| TributaryError::Platform("Response without result".into()));
    }

    if let Some(seconds) = response.parameters.and_then(|p| p.retry_after) {
        return Err(TributaryError::RetryAfter(Duration::from_secs(seconds)));
    }

    let description = response
        .description
        .unwrap_or_else(|| status.to_string());
    if description.contains("not found") {
        Err(TributaryError::NotFound(description))
    } else {
        Err(TributaryError::Platform(description))
    }
}

pub struct TelegramPlatform {
    client: Client,
    config: TelegramConfig,
}

impl TelegramPlatform {
    pub fn new(client: Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T> {
        debug!("Telegram {}", method);
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T> {
        debug!("Telegram {} (upload)", method);
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let body: ApiResponse<T> = response.json().await?;
        interpret(status, body)
    }
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn resolve_destination(&self, alias: &str) -> Result<Destination> {
        let chat: Chat = self
            .call("getChat", json!({ "chat_id": chat_id(alias) }))
            .await?;
        Ok(Destination {
            id: FeedId(chat.id),
            class: destination_class(&chat.kind),
        })
    }

    async fn send_text(&self, feed_id: FeedId, text: &str) -> Result<()> {
        let _: Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": feed_id.0,
                    "text": truncate(text, MAX_MESSAGE_CHARS),
                    "link_preview_options": { "is_disabled": true },
                }),
            )
            .await?;
        Ok(())
    }

    async fn send_media(
        &self,
        feed_id: FeedId,
        media: &MediaContent,
        caption: Option<&str>,
    ) -> Result<()> {
        let (method, field) = media_method(media.mime());

        let _: Value = match media {
            MediaContent::Remote { url, .. } => {
                let mut body = json!({ "chat_id": feed_id.0 });
                body[field] = json!(url);
                if let Some(caption) = caption {
                    body["caption"] = json!(caption);
                }
                self.call(method, body).await?
            }
            MediaContent::Inline {
                data,
                mime,
                filename,
            } => {
                let part = Part::bytes(data.clone())
                    .file_name(filename.clone())
                    .mime_str(mime)?;
                let mut form = Form::new()
                    .text("chat_id", feed_id.0.to_string())
                    .part(field, part);
                if let Some(caption) = caption {
                    form = form.text("caption", caption.to_string());
                }
                self.call_multipart(method, form).await?
            }
        };
        Ok(())
    }

    async fn get_admins(&self, feed_id: FeedId) -> Result<Vec<UserId>> {
        let members: Vec<ChatMember> = self
            .call("getChatAdministrators", json!({ "chat_id": feed_id.0 }))
            .await?;
        Ok(human_admins(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<T: DeserializeOwned>(body: &str) -> ApiResponse<T> {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_retry_after_is_typed() {
        let body = parse::<Value>(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 10","parameters":{"retry_after":10}}"#,
        );
        let err = interpret(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert!(matches!(err, TributaryError::RetryAfter(d) if d == Duration::from_secs(10)));
    }

    #[test]
    fn test_chat_not_found() {
        let body = parse::<Chat>(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        );
        assert!(interpret(StatusCode::BAD_REQUEST, body)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_get_chat_result() {
        let body = parse::<Chat>(r#"{"ok":true,"result":{"id":-1001,"type":"channel","title":"News"}}"#);
        let chat = interpret(StatusCode::OK, body).unwrap();
        assert_eq!(chat.id, -1001);
        assert_eq!(destination_class(&chat.kind), DestinationClass::Channel);
        assert_eq!(destination_class("supergroup"), DestinationClass::Group);
        assert_eq!(destination_class("private"), DestinationClass::Direct);
    }

    #[test]
    fn test_admin_list_skips_bots() {
        let body = parse::<Vec<ChatMember>>(
            r#"{"ok":true,"result":[{"status":"creator","user":{"id":1,"is_bot":false}},{"status":"administrator","user":{"id":2,"is_bot":true}}]}"#,
        );
        let members = interpret(StatusCode::OK, body).unwrap();
        assert_eq!(human_admins(members), vec![UserId(1)]);

        let body = parse::<Vec<ChatMember>>(
            r#"{"ok":true,"result":[{"status":"administrator","user":{"id":5}},{"status":"administrator","user":{"id":6,"is_bot":true}},{"status":"creator","user":{"id":9,"is_bot":false}}]}"#,
        );
        let members = interpret(StatusCode::OK, body).unwrap();
        assert_eq!(human_admins(members), vec![UserId(5), UserId(9)]);
    }

    #[test]
    fn test_media_method_by_mime() {
        assert_eq!(media_method("image/jpeg"), ("sendPhoto", "photo"));
        assert_eq!(media_method("image/gif"), ("sendAnimation", "animation"));
        assert_eq!(media_method("video/mp4"), ("sendVideo", "video"));
        assert_eq!(media_method("video/webm"), ("sendDocument", "document"));
    }

    #[test]
    fn test_chat_id_forms() {
        assert_eq!(chat_id("-1001"), json!(-1001));
        assert_eq!(chat_id("@news"), json!("@news"));
    }

    #[test]
    fn test_method_url() {
        let platform = TelegramPlatform::new(
            Client::new(),
            TelegramConfig {
                token: "123:abc".into(),
                api_base: "https://api.telegram.org/".into(),
            },
        );
        assert_eq!(
            platform.method_url("getChat"),
            "https://api.telegram.org/bot123:abc/getChat"
        );
    }
}
