//! Collaborator contracts for the ingest pipeline: where messages come from and
//! which language model turns them into structured completions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use flattrack_core::RawMessage;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "flattrack-adapters";

pub const DEFAULT_MODEL_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemma-3-27b-it:free";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading message export {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing message export {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message {id} has an unreadable date {value:?}")]
    BadDate { id: i64, value: String },
    #[error("message source unavailable: {0}")]
    Unavailable(String),
}

/// Channel history access. Messages come back newest first.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `limit` messages older than `offset_id`; `offset_id == 0` starts at the newest.
    async fn extract(&self, limit: usize, offset_id: i64) -> Result<Vec<RawMessage>, SourceError>;
}

/// Telegram-style paging over an in-memory history.
pub fn paginate(mut messages: Vec<RawMessage>, limit: usize, offset_id: i64) -> Vec<RawMessage> {
    messages.retain(|m| m.text.as_deref().is_some_and(|t| !t.is_empty()));
    messages.sort_by(|a, b| b.id.cmp(&a.id));
    messages
        .into_iter()
        .filter(|m| offset_id <= 0 || m.id < offset_id)
        .take(limit)
        .collect()
}

#[derive(Debug, Deserialize)]
struct TelegramExport {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    date: String,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    text: ExportText,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum ExportText {
    Plain(String),
    Rich(Vec<ExportTextPart>),
    #[default]
    Missing,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportTextPart {
    Plain(String),
    Entity { text: String },
}

impl ExportText {
    fn flatten(self) -> String {
        match self {
            Self::Plain(s) => s,
            Self::Rich(parts) => parts
                .into_iter()
                .map(|part| match part {
                    ExportTextPart::Plain(s) => s,
                    ExportTextPart::Entity { text } => text,
                })
                .collect(),
            Self::Missing => String::new(),
        }
    }
}

fn export_timestamp(message: &ExportMessage) -> Result<DateTime<FixedOffset>, SourceError> {
    let from_unix = message
        .date_unixtime
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    if let Some(utc) = from_unix {
        return Ok(utc.fixed_offset());
    }
    NaiveDateTime::parse_from_str(&message.date, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|_| SourceError::BadDate {
            id: message.id,
            value: message.date.clone(),
        })
}

fn split_display_name(from: Option<String>) -> (Option<String>, Option<String>) {
    let Some(name) = from else {
        return (None, None);
    };
    match name.trim().split_once(' ') {
        Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
        None => (Some(name.trim().to_string()), None),
    }
}

/// Reads a channel's Telegram Desktop JSON export (`result.json`).
#[derive(Debug, Clone)]
pub struct TelegramExportSource {
    path: PathBuf,
}

impl TelegramExportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawMessage>, SourceError> {
        let display = self.path.display().to_string();
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: display.clone(),
                source,
            })?;
        let export: TelegramExport =
            serde_json::from_str(&text).map_err(|source| SourceError::Parse {
                path: display.clone(),
                source,
            })?;

        let mut out = Vec::with_capacity(export.messages.len());
        for message in export.messages {
            if message.kind != "message" {
                continue;
            }
            let timestamp = export_timestamp(&message)?;
            let (sender_first_name, sender_last_name) = split_display_name(message.from);
            let text = message.text.flatten();
            out.push(RawMessage {
                id: message.id,
                timestamp,
                text: (!text.is_empty()).then_some(text),
                sender_first_name,
                sender_last_name,
            });
        }
        debug!(
            channel = export.name.as_deref().unwrap_or("unknown"),
            messages = out.len(),
            "loaded message export"
        );
        Ok(out)
    }
}

#[async_trait]
impl MessageSource for TelegramExportSource {
    async fn extract(&self, limit: usize, offset_id: i64) -> Result<Vec<RawMessage>, SourceError> {
        let span = info_span!("message_extract", path = %self.path.display(), limit, offset_id);
        async {
            let messages = paginate(self.load().await?, limit, offset_id);
            info!(extracted = messages.len(), "extracted messages");
            Ok(messages)
        }
        .instrument(span)
        .await
    }
}

/// In-memory history, optionally failing every call.
#[derive(Debug, Clone, Default)]
pub struct StaticMessageSource {
    messages: Vec<RawMessage>,
    failure: Option<String>,
}

impl StaticMessageSource {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            failure: None,
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            failure: Some(reason.into()),
        }
    }
}

#[async_trait]
impl MessageSource for StaticMessageSource {
    async fn extract(&self, limit: usize, offset_id: i64) -> Result<Vec<RawMessage>, SourceError> {
        if let Some(reason) = &self.failure {
            return Err(SourceError::Unavailable(reason.clone()));
        }
        Ok(paginate(self.messages.clone(), limit, offset_id))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model api key is not configured (set OPENROUTER_API_KEY)")]
    MissingApiKey,
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from model api: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Raw prompt in, raw completion text out. `Ok(None)` means the model answered with no content.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<Option<String>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that allows a burst of `rpm` calls and refills one token every `60s / rpm`.
    pub fn per_minute(rpm: u32) -> Self {
        let rpm = rpm.max(1);
        Self {
            capacity: rpm,
            refill_every: Duration::from_secs(60) / rpm,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.refill(now, self.capacity, self.refill_every);

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = state.next_token_in(now, self.refill_every);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

impl TokenBucketState {
    /// Credits whole elapsed periods. The partial period carries over unless the bucket is full.
    fn refill(&mut self, now: Instant, capacity: u32, every: Duration) {
        if every.is_zero() {
            self.tokens = capacity;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = u32::try_from(elapsed.as_nanos() / every.as_nanos()).unwrap_or(u32::MAX);
        if periods == 0 {
            return;
        }
        self.tokens = self.tokens.saturating_add(periods).min(capacity);
        match every.checked_mul(periods) {
            Some(step) if self.tokens < capacity => self.last_refill += step,
            _ => self.last_refill = now,
        }
    }

    fn next_token_in(&self, now: Instant, every: Duration) -> Duration {
        (self.last_refill + every).saturating_duration_since(now)
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    pub requests_per_minute: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            requests_per_minute: None,
        }
    }
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENROUTER_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.trim().is_empty()),
            base_url: std::env::var("FLATTRACK_MODEL_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("FLATTRACK_MODEL").unwrap_or(defaults.model),
            timeout: std::env::var("FLATTRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            backoff: BackoffPolicy {
                max_retries: std::env::var("FLATTRACK_MODEL_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
            requests_per_minute: std::env::var("FLATTRACK_MODEL_RPM")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn into_content(self) -> Option<String> {
        self.choices.into_iter().next().and_then(|c| c.message.content)
    }
}

/// OpenAI-compatible chat completions client (OpenRouter by default).
#[derive(Debug)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    backoff: BackoffPolicy,
    token_bucket: Option<SimpleTokenBucket>,
}

impl OpenRouterClient {
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let api_key = config.api_key.ok_or(ModelError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            backoff: config.backoff,
            token_bucket: config
                .requests_per_minute
                .map(|rpm| SimpleTokenBucket::new(TokenBucketConfig::per_minute(rpm))),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionModel for OpenRouterClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<Option<String>, ModelError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let span = info_span!("model_complete", model = %self.model);
        async {
            for attempt in 0..=self.backoff.max_retries {
                let resp_result = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&request)
                    .send()
                    .await;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body: ChatResponse = resp.json().await?;
                            return Ok(body.into_content());
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(%status, attempt, "retryable model api status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        let body = resp.text().await.unwrap_or_default();
                        return Err(ModelError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retryable model request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ModelError::Request(err));
                    }
                }
            }
            Err(ModelError::Unavailable("retry budget exhausted".to_string()))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Reply(String),
    Silent,
    Fail(String),
}

#[derive(Debug, Clone)]
struct ScriptRule {
    needle: String,
    reply: ScriptedReply,
}

/// Deterministic model double: replies are chosen by the first rule whose needle
/// occurs in the prompt, falling back to the default reply.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    default_reply: Option<String>,
    rules: Vec<ScriptRule>,
    calls: AtomicUsize,
    prompts: StdMutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(default_reply: impl Into<String>) -> Self {
        Self {
            default_reply: Some(default_reply.into()),
            ..Self::default()
        }
    }

    pub fn with_reply_for(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            reply: ScriptedReply::Reply(reply.into()),
        });
        self
    }

    pub fn with_silence_for(mut self, needle: impl Into<String>) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            reply: ScriptedReply::Silent,
        });
        self
    }

    pub fn with_error_for(mut self, needle: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rules.push(ScriptRule {
            needle: needle.into(),
            reply: ScriptedReply::Fail(reason.into()),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<Option<String>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let rule = self.rules.iter().find(|r| prompt.contains(&r.needle));
        match rule.map(|r| &r.reply) {
            Some(ScriptedReply::Reply(text)) => Ok(Some(text.clone())),
            Some(ScriptedReply::Silent) => Ok(None),
            Some(ScriptedReply::Fail(reason)) => Err(ModelError::Unavailable(reason.clone())),
            None => Ok(self.default_reply.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn msg(id: i64, text: Option<&str>) -> RawMessage {
        RawMessage {
            id,
            timestamp: DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z").unwrap(),
            text: text.map(str::to_string),
            sender_first_name: None,
            sender_last_name: None,
        }
    }

    #[test]
    fn pagination_is_newest_first_and_respects_offset() {
        let history = vec![
            msg(1, Some("a")),
            msg(3, Some("c")),
            msg(2, None),
            msg(4, Some("d")),
            msg(5, Some("")),
        ];
        let ids = |v: Vec<RawMessage>| v.into_iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids(paginate(history.clone(), 10, 0)), vec![4, 3, 1]);
        assert_eq!(ids(paginate(history.clone(), 1, 0)), vec![4]);
        assert_eq!(ids(paginate(history, 10, 4)), vec![3, 1]);
    }

    #[tokio::test]
    async fn telegram_export_flattens_rich_text_and_names() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("result.json");
        let export = serde_json::json!({
            "name": "Megapolis_Hinjewadi_Pune",
            "type": "public_supergroup",
            "id": 123,
            "messages": [
                {"id": 10, "type": "service", "date": "2025-03-01T09:00:00", "action": "pin_message"},
                {"id": 11, "type": "message", "date": "2025-03-01T10:00:00", "date_unixtime": "1740823200",
                 "from": "Akash Kumar Singh", "text": ["Room ", {"type": "bold", "text": "available"}, " now"]},
                {"id": 12, "type": "message", "date": "2025-03-01T11:30:00", "from": null, "text": "plain text"},
                {"id": 13, "type": "message", "date": "2025-03-01T11:45:00", "from": "Priya", "text": ""}
            ]
        });
        std::fs::write(&path, serde_json::to_vec(&export).unwrap()).unwrap();

        let source = TelegramExportSource::new(&path);
        let messages = source.extract(10, 0).await.expect("extract");
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].id, 12);
        assert_eq!(messages[0].text.as_deref(), Some("plain text"));
        assert_eq!(messages[0].sender_first_name, None);
        assert_eq!(messages[0].timestamp.to_rfc3339(), "2025-03-01T11:30:00+00:00");

        assert_eq!(messages[1].id, 11);
        assert_eq!(messages[1].text.as_deref(), Some("Room available now"));
        assert_eq!(messages[1].sender_first_name.as_deref(), Some("Akash"));
        assert_eq!(messages[1].sender_last_name.as_deref(), Some("Kumar Singh"));
        assert_eq!(messages[1].timestamp.timestamp(), 1_740_823_200);
    }

    #[tokio::test]
    async fn missing_export_is_a_source_error() {
        let source = TelegramExportSource::new("/definitely/not/here/result.json");
        let err = source.extract(5, 0).await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[tokio::test]
    async fn failing_static_source_propagates() {
        let source = StaticMessageSource::failing("channel gone");
        assert!(matches!(
            source.extract(5, 0).await,
            Err(SourceError::Unavailable(reason)) if reason == "channel gone"
        ));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limited_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn token_bucket_per_minute_spreads_refills() {
        let config = TokenBucketConfig::per_minute(20);
        assert_eq!(config.capacity, 20);
        assert_eq!(config.refill_every, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn token_bucket_serves_burst_without_waiting() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn token_bucket_carries_partial_periods() {
        let start = Instant::now();
        let every = Duration::from_secs(3);
        let mut state = TokenBucketState {
            tokens: 0,
            last_refill: start,
        };

        state.refill(start + Duration::from_secs(7), 5, every);
        assert_eq!(state.tokens, 2);
        assert_eq!(state.last_refill, start + Duration::from_secs(6));
        assert_eq!(state.next_token_in(start + Duration::from_secs(7), every), Duration::from_secs(2));

        state.refill(start + Duration::from_secs(8), 5, every);
        assert_eq!(state.tokens, 2);
        state.refill(start + Duration::from_secs(9), 5, every);
        assert_eq!(state.tokens, 3);

        state.refill(start + Duration::from_secs(100), 5, every);
        assert_eq!(state.tokens, 5);
        assert_eq!(state.last_refill, start + Duration::from_secs(100));
    }

    #[test]
    fn client_requires_api_key() {
        let err = OpenRouterClient::new(ModelConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::MissingApiKey));
    }

    #[test]
    fn chat_response_takes_first_choice_content() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({
            "id": "gen-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "```json\n{}\n```"}},
                {"index": 1, "message": {"role": "assistant", "content": "ignored"}}
            ]
        }))
        .unwrap();
        assert_eq!(body.into_content().as_deref(), Some("```json\n{}\n```"));

        let empty: ChatResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert_eq!(empty.into_content(), None);
    }

    #[tokio::test]
    async fn scripted_model_matches_rules_in_order() {
        let model = ScriptedModel::new("default")
            .with_reply_for("alpha", "first")
            .with_error_for("beta", "boom")
            .with_silence_for("gamma");

        assert_eq!(model.complete("sys", "has alpha").await.unwrap().as_deref(), Some("first"));
        assert!(matches!(model.complete("sys", "has beta").await, Err(ModelError::Unavailable(_))));
        assert_eq!(model.complete("sys", "has gamma").await.unwrap(), None);
        assert_eq!(model.complete("sys", "other").await.unwrap().as_deref(), Some("default"));
        assert_eq!(model.call_count(), 4);
        assert_eq!(model.prompts().len(), 4);
    }
}
