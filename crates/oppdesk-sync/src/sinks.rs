//! Delivery targets for assembled opportunities.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use oppdesk_core::Opportunity;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;
pub const TELEGRAM_TEXT_LIMIT: usize = 4096;
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const TELEGRAM_HASHTAGS: &str = "#Opportunities #Scholarships #Grants #Education #Career";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAck {
    Accepted,
    /// The target already held an equivalent record; nothing was written.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{sink} request failed: {source}")]
    Request {
        sink: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{sink} rejected delivery with http {status}: {body}")]
    Rejected {
        sink: &'static str,
        status: u16,
        body: String,
    },
    #[error("{sink} returned an unexpected response: {message}")]
    Protocol { sink: &'static str, message: String },
}

/// Somewhere an opportunity can be handed off to. Called at most once per item per run.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, opportunity: &Opportunity) -> Result<DeliveryAck, SinkError>;
}

fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building sink http client")
}

async fn ensure_success(
    sink: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, SinkError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SinkError::Rejected {
        sink,
        status: status.as_u16(),
        body,
    })
}

/// The five-field record the webhook receiver expects.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub title: &'a str,
    pub link: Option<&'a str>,
    pub deadline: Option<&'a str>,
    pub thumbnail: Option<&'a str>,
    pub description: Option<&'a str>,
}

impl<'a> From<&'a Opportunity> for WebhookPayload<'a> {
    fn from(op: &'a Opportunity) -> Self {
        Self {
            title: &op.title,
            link: op.apply_link.as_deref(),
            deadline: op.deadline.as_deref(),
            thumbnail: op.thumbnail_url.as_deref(),
            description: op.description.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            secret: secret.filter(|s| !s.trim().is_empty()),
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, opportunity: &Opportunity) -> Result<DeliveryAck, SinkError> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::from(opportunity));
        if let Some(secret) = &self.secret {
            req = req.bearer_auth(secret);
        }
        let resp = req.send().await.map_err(|source| SinkError::Request {
            sink: self.name(),
            source,
        })?;
        ensure_success(self.name(), resp).await?;
        debug!(title = %opportunity.title, "webhook accepted");
        Ok(DeliveryAck::Accepted)
    }
}

/// Row shape of the review table: new posts wait for manual approval.
#[derive(Debug, Serialize)]
pub struct SupabaseRow<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub link: Option<&'a str>,
    pub deadline: Option<&'a str>,
    pub thumbnail: Option<&'a str>,
    pub tags: &'a [String],
    pub approved: bool,
    pub posted_to_telegram: bool,
}

impl<'a> From<&'a Opportunity> for SupabaseRow<'a> {
    fn from(op: &'a Opportunity) -> Self {
        Self {
            title: &op.title,
            description: op.description.as_deref(),
            link: op.apply_link.as_deref(),
            deadline: op.deadline.as_deref(),
            thumbnail: op.thumbnail_url.as_deref(),
            tags: &op.tags,
            approved: false,
            posted_to_telegram: false,
        }
    }
}

/// Inserts into a PostgREST table, skipping titles that already exist.
#[derive(Debug, Clone)]
pub struct SupabaseSink {
    client: reqwest::Client,
    table_url: String,
}

impl SupabaseSink {
    pub fn new(
        base_url: &str,
        service_key: &str,
        table: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(service_key).context("supabase key is not a valid header value")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .context("supabase key is not a valid header value")?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("building supabase http client")?;

        Ok(Self {
            client,
            table_url: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
        })
    }

    async fn title_exists(&self, title: &str) -> Result<bool, SinkError> {
        let resp = self
            .client
            .get(&self.table_url)
            .query(&[("select", "id".to_string()), ("title", format!("eq.{title}"))])
            .send()
            .await
            .map_err(|source| SinkError::Request {
                sink: self.name(),
                source,
            })?;
        let rows: Vec<serde_json::Value> = ensure_success(self.name(), resp)
            .await?
            .json()
            .await
            .map_err(|e| SinkError::Protocol {
                sink: self.name(),
                message: e.to_string(),
            })?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl Sink for SupabaseSink {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn deliver(&self, opportunity: &Opportunity) -> Result<DeliveryAck, SinkError> {
        if self.title_exists(&opportunity.title).await? {
            info!(title = %opportunity.title, "already stored, skipping insert");
            return Ok(DeliveryAck::Duplicate);
        }

        let resp = self
            .client
            .post(&self.table_url)
            .header("Prefer", "return=minimal")
            .json(&SupabaseRow::from(opportunity))
            .send()
            .await
            .map_err(|source| SinkError::Request {
                sink: self.name(),
                source,
            })?;
        ensure_success(self.name(), resp).await?;
        Ok(DeliveryAck::Accepted)
    }
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Posts straight to a channel through the Bot API.
#[derive(Debug, Clone)]
pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    channel_id: String,
    join_url: Option<String>,
}

impl TelegramSink {
    pub fn new(
        api_base: &str,
        bot_token: impl Into<String>,
        channel_id: impl Into<String>,
        join_url: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            channel_id: channel_id.into(),
            join_url: join_url.filter(|u| !u.trim().is_empty()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }
}

#[async_trait]
impl Sink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, opportunity: &Opportunity) -> Result<DeliveryAck, SinkError> {
        let join_url = self.join_url.as_deref();
        let (method, body) = match opportunity.thumbnail_url.as_deref() {
            Some(photo) => (
                "sendPhoto",
                serde_json::json!({
                    "chat_id": self.channel_id,
                    "photo": photo,
                    "caption": format_post(opportunity, join_url, TELEGRAM_CAPTION_LIMIT),
                    "parse_mode": "HTML",
                }),
            ),
            None => (
                "sendMessage",
                serde_json::json!({
                    "chat_id": self.channel_id,
                    "text": format_post(opportunity, join_url, TELEGRAM_TEXT_LIMIT),
                    "parse_mode": "HTML",
                    "disable_web_page_preview": false,
                }),
            ),
        };

        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|source| SinkError::Request {
                sink: self.name(),
                source,
            })?;
        let reply: TelegramReply = ensure_success(self.name(), resp)
            .await?
            .json()
            .await
            .map_err(|e| SinkError::Protocol {
                sink: self.name(),
                message: e.to_string(),
            })?;
        if !reply.ok {
            return Err(SinkError::Protocol {
                sink: self.name(),
                message: reply.description.unwrap_or_else(|| "ok=false".to_string()),
            });
        }
        debug!(method, title = %opportunity.title, "posted to telegram");
        Ok(DeliveryAck::Accepted)
    }
}

/// Channel post in Telegram's HTML parse mode, at most `limit` characters.
/// The description is shortened first; a title too long to fit even without
/// a description is shortened too. Shortened text ends in `…`.
pub fn format_post(op: &Opportunity, join_url: Option<&str>, limit: usize) -> String {
    let title = html_escape::encode_text(&op.title);
    let description = op.description.as_deref().unwrap_or_default();
    let full = render_post(&title, op, join_url, &html_escape::encode_text(description));
    if full.chars().count() <= limit {
        return full;
    }

    let skeleton = render_post(&title, op, join_url, "…");
    let skeleton_len = skeleton.chars().count();
    if skeleton_len <= limit {
        let shortened = shorten_escaped(description, limit - skeleton_len + 1);
        return render_post(&title, op, join_url, &shortened);
    }

    let bare = render_post("…", op, join_url, "");
    let available = (limit + 1).saturating_sub(bare.chars().count());
    render_post(&shorten_escaped(&op.title, available), op, join_url, "")
}

/// HTML-escaped prefix of `raw` plus `…`, at most `max_chars` characters.
/// Entities are never split.
fn shorten_escaped(raw: &str, max_chars: usize) -> String {
    let budget = max_chars.saturating_sub(1);
    let mut shortened = String::new();
    let mut used = 0usize;
    for ch in raw.chars() {
        let mut buf = [0u8; 4];
        let escaped = html_escape::encode_text(ch.encode_utf8(&mut buf)).into_owned();
        let width = escaped.chars().count();
        if used + width > budget {
            break;
        }
        used += width;
        shortened.push_str(&escaped);
    }
    format!("{}…", shortened.trim_end())
}

fn render_post(
    escaped_title: &str,
    op: &Opportunity,
    join_url: Option<&str>,
    escaped_description: &str,
) -> String {
    let mut post = format!("<b>{escaped_title}</b>");
    if !escaped_description.is_empty() {
        post.push_str("\n\n");
        post.push_str(escaped_description);
    }
    if let Some(deadline) = &op.deadline {
        post.push_str(&format!(
            "\n\n<b>Deadline:</b> {}",
            html_escape::encode_text(deadline)
        ));
    }
    if let Some(link) = &op.apply_link {
        post.push_str(&format!(
            "\n\n📨 <a href=\"{}\"><b>Apply Now</b></a>",
            html_escape::encode_double_quoted_attribute(link)
        ));
    }
    if let Some(join) = join_url {
        post.push_str(&format!(
            "\n\n✅ <a href=\"{}\"><b>Join Us</b></a>",
            html_escape::encode_double_quoted_attribute(join)
        ));
    }
    post.push_str("\n\n");
    post.push_str(TELEGRAM_HASHTAGS);
    post
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn sample(title: &str) -> Opportunity {
        Opportunity {
            title: title.to_string(),
            apply_link: Some("https://apply.example/a?x=1&y=2".to_string()),
            deadline: Some("March 1, 2024".to_string()),
            thumbnail_url: None,
            description: Some("Funds <early> career & more.".to_string()),
            detail_url: "https://site.test/a".to_string(),
            tags: vec!["Grants".to_string()],
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[derive(Clone, Default)]
    struct Captured {
        bodies: Arc<Mutex<Vec<Value>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
        queries: Arc<Mutex<Vec<String>>>,
        paths: Arc<Mutex<Vec<String>>>,
    }

    fn header(headers: &AxumHeaders, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    #[test]
    fn webhook_payload_has_the_five_wire_fields() {
        let op = sample("Grant A");
        let value = serde_json::to_value(WebhookPayload::from(&op)).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["deadline", "description", "link", "thumbnail", "title"]);
        assert_eq!(obj["link"], "https://apply.example/a?x=1&y=2");
        assert!(obj["thumbnail"].is_null());
    }

    #[tokio::test]
    async fn webhook_sends_bearer_secret_and_payload() {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(c): State<Captured>, headers: AxumHeaders, Json(body): Json<Value>| async move {
                    c.auth.lock().unwrap().push(header(&headers, "authorization"));
                    c.bodies.lock().unwrap().push(body);
                    StatusCode::OK
                }),
            )
            .with_state(captured.clone());
        let base = serve(app).await;

        let sink = WebhookSink::new(format!("{base}/hook"), Some("s3cret".into()), TIMEOUT).unwrap();
        let ack = sink.deliver(&sample("Grant A")).await.unwrap();
        assert_eq!(ack, DeliveryAck::Accepted);

        assert_eq!(captured.auth.lock().unwrap()[0].as_deref(), Some("Bearer s3cret"));
        assert_eq!(captured.bodies.lock().unwrap()[0]["title"], "Grant A");
    }

    #[tokio::test]
    async fn webhook_without_secret_sends_no_authorization() {
        let captured = Captured::default();
        let app = Router::new()
            .route(
                "/hook",
                post(|State(c): State<Captured>, headers: AxumHeaders| async move {
                    c.auth.lock().unwrap().push(header(&headers, "authorization"));
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(captured.clone());
        let base = serve(app).await;

        let sink = WebhookSink::new(format!("{base}/hook"), Some("  ".into()), TIMEOUT).unwrap();
        sink.deliver(&sample("Grant A")).await.unwrap();
        assert_eq!(captured.auth.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn webhook_non_2xx_is_rejected() {
        let app = Router::new().route("/hook", post(|| async { (StatusCode::BAD_GATEWAY, "down") }));
        let base = serve(app).await;

        let sink = WebhookSink::new(format!("{base}/hook"), None, TIMEOUT).unwrap();
        let err = sink.deliver(&sample("Grant A")).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status: 502, ref body, .. } if body == "down"));
    }

    fn supabase_app(existing_title: &'static str, captured: Captured) -> Router {
        Router::new()
            .route(
                "/rest/v1/opportunities",
                get(
                    move |State(c): State<Captured>,
                          headers: AxumHeaders,
                          Query(q): Query<std::collections::HashMap<String, String>>| async move {
                        c.auth.lock().unwrap().push(header(&headers, "apikey"));
                        let title = q.get("title").cloned().unwrap_or_default();
                        c.queries.lock().unwrap().push(title.clone());
                        if title == format!("eq.{existing_title}") {
                            Json(serde_json::json!([{ "id": 7 }]))
                        } else {
                            Json(serde_json::json!([]))
                        }
                    },
                )
                .post(|State(c): State<Captured>, Json(body): Json<Value>| async move {
                    c.bodies.lock().unwrap().push(body);
                    StatusCode::CREATED
                }),
            )
            .with_state(captured)
    }

    #[tokio::test]
    async fn supabase_inserts_new_titles_for_review() {
        let captured = Captured::default();
        let base = serve(supabase_app("Old Grant", captured.clone())).await;

        let sink = SupabaseSink::new(&base, "service-key", "opportunities", TIMEOUT).unwrap();
        let ack = sink.deliver(&sample("New Grant")).await.unwrap();
        assert_eq!(ack, DeliveryAck::Accepted);

        assert_eq!(captured.queries.lock().unwrap()[0], "eq.New Grant");
        assert_eq!(captured.auth.lock().unwrap()[0].as_deref(), Some("service-key"));
        let rows = captured.bodies.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "New Grant");
        assert_eq!(rows[0]["approved"], false);
        assert_eq!(rows[0]["posted_to_telegram"], false);
        assert_eq!(rows[0]["tags"], serde_json::json!(["Grants"]));
    }

    #[tokio::test]
    async fn supabase_skips_existing_titles() {
        let captured = Captured::default();
        let base = serve(supabase_app("Old Grant", captured.clone())).await;

        let sink = SupabaseSink::new(&base, "service-key", "opportunities", TIMEOUT).unwrap();
        let ack = sink.deliver(&sample("Old Grant")).await.unwrap();
        assert_eq!(ack, DeliveryAck::Duplicate);
        assert!(captured.bodies.lock().unwrap().is_empty());
    }

    fn telegram_app(captured: Captured) -> Router {
        Router::new()
            .route(
                "/{bot}/{method}",
                post(
                    |State(c): State<Captured>,
                     Path((bot, method)): Path<(String, String)>,
                     Json(body): Json<Value>| async move {
                        c.paths.lock().unwrap().push(format!("{bot}/{method}"));
                        c.bodies.lock().unwrap().push(body);
                        Json(serde_json::json!({ "ok": true, "result": {} }))
                    },
                ),
            )
            .with_state(captured)
    }

    #[tokio::test]
    async fn telegram_uses_send_message_without_thumbnail() {
        let captured = Captured::default();
        let base = serve(telegram_app(captured.clone())).await;

        let sink = TelegramSink::new(&base, "123:abc", "@channel", None, TIMEOUT).unwrap();
        sink.deliver(&sample("Grant A")).await.unwrap();

        assert_eq!(captured.paths.lock().unwrap()[0], "bot123:abc/sendMessage");
        let bodies = captured.bodies.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["chat_id"], "@channel");
        assert_eq!(body["parse_mode"], "HTML");
        assert!(body["text"].as_str().unwrap().starts_with("<b>Grant A</b>"));
    }

    #[tokio::test]
    async fn telegram_uses_send_photo_with_thumbnail() {
        let captured = Captured::default();
        let base = serve(telegram_app(captured.clone())).await;

        let mut op = sample("Grant A");
        op.thumbnail_url = Some("https://img.test/a.jpg".into());
        let sink = TelegramSink::new(&base, "123:abc", "@channel", None, TIMEOUT).unwrap();
        sink.deliver(&op).await.unwrap();

        assert_eq!(captured.paths.lock().unwrap()[0], "bot123:abc/sendPhoto");
        let bodies = captured.bodies.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["photo"], "https://img.test/a.jpg");
        assert!(body["caption"].as_str().unwrap().chars().count() <= TELEGRAM_CAPTION_LIMIT);
    }

    #[tokio::test]
    async fn telegram_ok_false_is_an_error() {
        let app = Router::new().route(
            "/{bot}/{method}",
            post(|| async { Json(serde_json::json!({ "ok": false, "description": "chat not found" })) }),
        );
        let base = serve(app).await;

        let sink = TelegramSink::new(&base, "t", "@nowhere", None, TIMEOUT).unwrap();
        let err = sink.deliver(&sample("Grant A")).await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[test]
    fn post_format_escapes_and_orders_sections() {
        let post = format_post(&sample("A & B"), Some("https://t.me/join"), TELEGRAM_TEXT_LIMIT);
        assert_eq!(
            post,
            "<b>A &amp; B</b>\n\n\
             Funds &lt;early&gt; career &amp; more.\n\n\
             <b>Deadline:</b> March 1, 2024\n\n\
             📨 <a href=\"https://apply.example/a?x=1&amp;y=2\"><b>Apply Now</b></a>\n\n\
             ✅ <a href=\"https://t.me/join\"><b>Join Us</b></a>\n\n\
             #Opportunities #Scholarships #Grants #Education #Career"
        );
    }

    #[test]
    fn post_format_skips_absent_sections() {
        let op = Opportunity {
            description: None,
            deadline: None,
            ..sample("Bare")
        };
        let post = format_post(&op, None, TELEGRAM_TEXT_LIMIT);
        assert!(!post.contains("Deadline"));
        assert!(!post.contains("Join Us"));
        assert!(post.starts_with("<b>Bare</b>\n\n📨"));
    }

    #[test]
    fn long_descriptions_are_shortened_to_the_limit() {
        let op = Opportunity {
            description: Some("word & ".repeat(400)),
            ..sample("Long")
        };
        let post = format_post(&op, None, TELEGRAM_CAPTION_LIMIT);
        assert!(post.chars().count() <= TELEGRAM_CAPTION_LIMIT);
        assert!(post.contains("…"));
        assert!(post.ends_with(TELEGRAM_HASHTAGS));
        assert!(!post.contains("&am…"));
    }

    #[test]
    fn oversized_titles_are_shortened_as_a_last_resort() {
        let op = Opportunity {
            title: "Scholarship & Grant ".repeat(80),
            ..sample("unused")
        };
        let post = format_post(&op, Some("https://t.me/join"), TELEGRAM_CAPTION_LIMIT);
        assert!(post.chars().count() <= TELEGRAM_CAPTION_LIMIT);
        assert!(post.starts_with("<b>Scholarship &amp; Grant"));
        assert!(post.contains("…</b>"));
        assert!(!post.contains("Funds"));
        assert!(post.ends_with(TELEGRAM_HASHTAGS));
    }
}
