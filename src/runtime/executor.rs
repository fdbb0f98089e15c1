//! Node execution handlers.
//!
//! One handler per node kind, all with the same contract: take the node
//! definition plus the execution context (ancestor outputs keyed by node id)
//! and return the value stored under this node's id on success. Handlers own
//! every external resource they touch (HTTP client, sandbox, SMTP transport,
//! per-query database connections), so they stay reentrant across concurrent
//! executions.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::{Config, LlmConfig, SmtpConfig};
use crate::crypto::CredentialCipher;
use crate::error::HandlerError;
use crate::oauth::{GmailCredential, GmailOAuth};
use crate::runtime::sandbox::CodeSandbox;
use crate::store::Store;
use crate::template;
use crate::workflow::{Credential, ExecutionData, Node, NodeKind};

const GMAIL_SEND_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Dispatches node execution to the matching kind handler.
pub struct NodeExecutor {
    http: reqwest::Client,
    sandbox: CodeSandbox,
    cipher: Arc<CredentialCipher>,
    oauth: Arc<GmailOAuth>,
    store: Store,
    llm: LlmConfig,
    smtp: SmtpConfig,
    sandbox_env: Vec<String>,
}

impl NodeExecutor {
    pub fn new(
        config: &Config,
        store: Store,
        cipher: Arc<CredentialCipher>,
        oauth: Arc<GmailOAuth>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            sandbox: CodeSandbox::new(Duration::from_secs(config.engine.code_timeout_secs)),
            cipher,
            oauth,
            store,
            llm: config.llm.clone(),
            smtp: config.smtp.clone(),
            sandbox_env: config.engine.sandbox_env.clone(),
        }
    }

    /// Execute a single node against the current context.
    pub async fn execute(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        tracing::info!("executing node '{}' (type: {})", node.id, node.kind);
        let start = std::time::Instant::now();

        let result = match &node.kind {
            NodeKind::Webhook => self.run_webhook(node, context),
            NodeKind::HttpRequest => self.run_http_request(node, context).await,
            NodeKind::Code => self.run_code(node, context).await,
            NodeKind::AiChat => self.run_ai_chat(node, context).await,
            NodeKind::Database => self.run_database(node, context).await,
            NodeKind::Email => self.run_email(node, context).await,
            NodeKind::Other(kind) => self.run_fallback(node, context, kind),
        };

        match &result {
            Ok(_) => tracing::info!("node '{}' completed in {:?}", node.id, start.elapsed()),
            Err(e) => tracing::error!("node '{}' failed in {:?}: {e}", node.id, start.elapsed()),
        }
        result
    }

    /// Entry point node: returns the pre-seeded trigger data verbatim, or a
    /// synthetic stub when the execution was started without one.
    fn run_webhook(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        if let Some(seeded) = context.get(&node.id) {
            return Ok(seeded.clone());
        }
        Ok(json!({
            "received": true,
            "timestamp": Utc::now().to_rfc3339(),
            "body": {},
            "headers": {},
            "query": {},
        }))
    }

    /// Outbound HTTP call. Non-2xx responses are not failures; downstream
    /// nodes branch on `ok`.
    async fn run_http_request(
        &self,
        node: &Node,
        context: &ExecutionData,
    ) -> Result<Value, HandlerError> {
        let data = template::resolve_map(&node.data, context);
        let url = require_str(&data, "url")?;
        let method_raw = data
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let method = match method_raw.as_str() {
            "GET" => reqwest::Method::GET,
            "HEAD" => reqwest::Method::HEAD,
            "POST" => reqwest::Method::POST,
            "PUT" => reqwest::Method::PUT,
            "PATCH" => reqwest::Method::PATCH,
            "DELETE" => reqwest::Method::DELETE,
            other => return Err(HandlerError::Io(format!("unsupported HTTP method: {other}"))),
        };

        let mut request = self.http.request(method.clone(), url);

        let mut has_content_type = false;
        if let Some(headers) = data.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    if name.eq_ignore_ascii_case("content-type") {
                        has_content_type = true;
                    }
                    request = request.header(name, value);
                }
            }
        }
        if !has_content_type {
            request = request.header("Content-Type", "application/json");
        }

        if !matches!(method, reqwest::Method::GET | reqwest::Method::HEAD) {
            if let Some(body) = data.get("body") {
                let payload = match body {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string(other)
                        .map_err(|e| HandlerError::Io(e.to_string()))?,
                };
                request = request.body(payload);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), Value::String(v.to_string())))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(json!({
            "statusCode": status.as_u16(),
            "headers": headers,
            "body": body,
            "ok": status.is_success(),
        }))
    }

    /// User script in the ECMAScript sandbox. The script sees the context as
    /// `items`, its own raw data as `$node`, and the whitelisted environment
    /// as `$env`.
    async fn run_code(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        let code = node
            .data
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::MissingField("code".to_string()))?;

        let items: Vec<Value> = context
            .iter()
            .map(|(node_id, output)| json!({"nodeId": node_id, "json": output}))
            .collect();

        let mut env = Map::new();
        for name in &self.sandbox_env {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), Value::String(value));
            }
        }

        self.sandbox
            .run(
                &node.id,
                code,
                Value::Array(items),
                Value::Object(node.data.clone()),
                Value::Object(env),
            )
            .await
    }

    /// Chat-completions call against the configured provider.
    async fn run_ai_chat(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        let data = template::resolve_map(&node.data, context);
        let prompt = data.get("prompt").and_then(Value::as_str).unwrap_or("");
        let system_prompt = data.get("systemPrompt").and_then(Value::as_str);
        if prompt.is_empty() && system_prompt.is_none() {
            return Err(HandlerError::MissingField("prompt".to_string()));
        }

        let api_key = self
            .llm
            .api_key
            .as_deref()
            .ok_or_else(|| HandlerError::ConfigMissing("LLM provider API key".to_string()))?;
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.llm.model);

        // The provider requires a non-empty user turn even for system-only
        // node configurations.
        let user_content = if prompt.is_empty() {
            "Respond according to the system prompt."
        } else {
            prompt
        };

        let mut payload = json!({
            "model": model,
            "max_tokens": 2048,
            "messages": [{"role": "user", "content": user_content}],
        });
        if let Some(system) = system_prompt {
            payload["system"] = json!(system);
        }

        let url = format!("{}/v1/messages", self.llm.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;
        if !status.is_success() {
            return Err(HandlerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| HandlerError::Io(e.to_string()))?;
        let text = parsed["content"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(json!({
            "text": text,
            "model": parsed.get("model").cloned().unwrap_or_else(|| json!(model)),
            "usage": parsed.get("usage").cloned().unwrap_or(Value::Null),
        }))
    }

    /// SQL query over a fresh PostgreSQL connection, closed with the scope on
    /// both success and failure.
    async fn run_database(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        let data = template::resolve_map(&node.data, context);
        let connection_string = require_str(&data, "connectionString")?;
        let query = require_str(&data, "query")?;

        let db_err = |e: tokio_postgres::Error| HandlerError::Database(e.to_string());

        let (client, connection) = tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
            .await
            .map_err(db_err)?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("postgres connection closed: {e}");
            }
        });

        let result = async {
            let statement = client.prepare(query).await.map_err(db_err)?;
            let fields: Vec<Value> = statement
                .columns()
                .iter()
                .map(|c| Value::String(c.name().to_string()))
                .collect();

            let rows = client.query(&statement, &[]).await.map_err(db_err)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                out.push(row_to_json(row)?);
            }

            Ok(json!({
                "rows": out,
                "rowCount": rows.len(),
                "fields": fields,
            }))
        }
        .await;

        drop(client);
        driver.abort();
        result
    }

    /// Mail delivery. Uses the Gmail API when the node references a
    /// `gmail-oauth` credential, refreshing the access token first if
    /// expired; otherwise falls back to SMTP.
    async fn run_email(&self, node: &Node, context: &ExecutionData) -> Result<Value, HandlerError> {
        let data = template::resolve_map(&node.data, context);
        let to = require_str(&data, "to")?;
        let subject = require_str(&data, "subject")?;
        let body = require_str(&data, "body")?;

        let credential_id = data.get("credentialId").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });

        if let Some(id) = credential_id {
            let credential = self
                .store
                .get_credential(id)
                .await
                .map_err(|e| HandlerError::Credential(e.to_string()))?
                .ok_or_else(|| HandlerError::Credential(format!("credential {id} not found")))?;

            if credential.kind == "gmail-oauth" {
                return self.send_via_gmail(&credential, to, subject, body).await;
            }
            tracing::warn!(
                "credential {id} has type '{}', falling back to SMTP",
                credential.kind
            );
        }

        self.send_via_smtp(&data, to, subject, body).await
    }

    async fn send_via_gmail(
        &self,
        credential: &Credential,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Value, HandlerError> {
        let mut blob: GmailCredential = serde_json::from_value(self.cipher.decrypt(&credential.data)?)
            .map_err(|e| HandlerError::Credential(format!("gmail credential blob: {e}")))?;

        if blob.tokens.is_expired() {
            tracing::info!("refreshing expired Gmail access token for credential {}", credential.id);
            let refresh_token = blob.tokens.refresh_token.clone().ok_or_else(|| {
                HandlerError::Credential("access token expired and no refresh token stored".to_string())
            })?;
            blob.tokens = self
                .oauth
                .refresh_token(&refresh_token, &blob.client_id, &blob.client_secret)
                .await?;

            let plaintext = serde_json::to_value(&blob)
                .map_err(|e| HandlerError::Credential(e.to_string()))?;
            let ciphertext = self.cipher.encrypt(&plaintext)?;
            // Losing the persisted refresh only costs a re-refresh next run.
            if let Err(e) = self.store.update_credential(credential.id, &ciphertext).await {
                tracing::warn!(
                    "failed to persist refreshed tokens for credential {}: {e}",
                    credential.id
                );
            }
        }

        let raw = build_mime_message(&blob.email, to, subject, body);
        let response = self
            .http
            .post(GMAIL_SEND_ENDPOINT)
            .bearer_auth(&blob.tokens.access_token)
            .json(&json!({"raw": URL_SAFE_NO_PAD.encode(raw)}))
            .send()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| HandlerError::Io(e.to_string()))?;
        if !status.is_success() {
            return Err(HandlerError::Upstream {
                status: status.as_u16(),
                body: response_body,
            });
        }

        let parsed: Value = serde_json::from_str(&response_body).unwrap_or(Value::Null);
        Ok(json!({
            "messageId": parsed.get("id").cloned().unwrap_or(Value::Null),
            "sent": true,
            "provider": "gmail-oauth",
        }))
    }

    async fn send_via_smtp(
        &self,
        data: &Map<String, Value>,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Value, HandlerError> {
        let host = data
            .get("host")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.smtp.host.clone())
            .ok_or_else(|| HandlerError::ConfigMissing("SMTP host".to_string()))?;
        let user = data
            .get("user")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.smtp.user.clone())
            .ok_or_else(|| HandlerError::ConfigMissing("SMTP user".to_string()))?;
        let pass = data
            .get("pass")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.smtp.pass.clone())
            .ok_or_else(|| HandlerError::ConfigMissing("SMTP password".to_string()))?;
        let port = data
            .get("port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(self.smtp.port);
        let from = data
            .get("from")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.smtp.from.clone())
            .unwrap_or_else(|| user.clone());

        let message_id = format!("<{}@flowmill>", Uuid::new_v4());
        let message = Message::builder()
            .from(parse_mailbox(&from)?)
            .to(parse_mailbox(to)?)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .multipart(MultiPart::alternative_plain_html(
                body.to_string(),
                body.to_string(),
            ))
            .map_err(|e| HandlerError::Email(e.to_string()))?;

        let credentials = SmtpCredentials::new(user, pass);
        // Port 465 is implicit TLS; everything else negotiates STARTTLS.
        let mailer: AsyncSmtpTransport<Tokio1Executor> = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
                .map_err(|e| HandlerError::Email(e.to_string()))?
                .port(port)
                .credentials(credentials)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
                .map_err(|e| HandlerError::Email(e.to_string()))?
                .port(port)
                .credentials(credentials)
                .build()
        };

        mailer
            .send(message)
            .await
            .map_err(|e| HandlerError::Email(e.to_string()))?;

        Ok(json!({
            "messageId": message_id,
            "accepted": [to],
            "rejected": [],
            "sent": true,
            "provider": "smtp",
        }))
    }

    /// Unknown node kind: echo the (resolved) node data without contacting
    /// any external system, so forward-compatible workflows keep running.
    fn run_fallback(
        &self,
        node: &Node,
        context: &ExecutionData,
        kind: &str,
    ) -> Result<Value, HandlerError> {
        tracing::warn!("unknown node type '{kind}' for node '{}'; echoing node data", node.id);
        let mut out = template::resolve_map(&node.data, context);
        out.insert("executed".to_string(), Value::Bool(true));
        out.insert("nodeType".to_string(), Value::String(kind.to_string()));
        Ok(Value::Object(out))
    }
}

fn require_str<'a>(data: &'a Map<String, Value>, field: &str) -> Result<&'a str, HandlerError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::MissingField(field.to_string()))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, HandlerError> {
    address
        .parse()
        .map_err(|e| HandlerError::Email(format!("invalid address '{address}': {e}")))
}

/// RFC 2822 multipart/alternative message for the Gmail raw-send endpoint.
fn build_mime_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let boundary = format!("b{}", Uuid::new_v4().simple());
    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: text/plain; charset=\"UTF-8\"\r\n\
         \r\n\
         {body}\r\n\
         \r\n\
         --{boundary}\r\n\
         Content-Type: text/html; charset=\"UTF-8\"\r\n\
         \r\n\
         {body}\r\n\
         \r\n\
         --{boundary}--"
    )
}

fn row_to_json(row: &tokio_postgres::Row) -> Result<Value, HandlerError> {
    use tokio_postgres::types::Type;

    let db_err = |e: tokio_postgres::Error| HandlerError::Database(e.to_string());
    let mut record = Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value: Value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)
                .map_err(db_err)?
                .map(Value::Bool)
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)
                .map_err(db_err)?
                .map(|v| json!(v))
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)
                .map_err(db_err)?
                .map(|v| json!(v))
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)
                .map_err(db_err)?
                .map(|v| json!(v))
                .unwrap_or(Value::Null)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)
                .map_err(db_err)?
                .map(|v| json!(v))
                .unwrap_or(Value::Null)
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)
                .map_err(db_err)?
                .map(|v| json!(v))
                .unwrap_or(Value::Null)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<Value>>(i)
                .map_err(db_err)?
                .unwrap_or(Value::Null)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<Utc>>>(i)
                .map_err(db_err)?
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(i)
                .map_err(db_err)?
                .map(|t| Value::String(t.to_string()))
                .unwrap_or(Value::Null)
        } else {
            // Text-ish and anything else: best effort as a string.
            row.try_get::<_, Option<String>>(i)
                .unwrap_or(None)
                .map(Value::String)
                .unwrap_or(Value::Null)
        };

        record.insert(column.name().to_string(), value);
    }

    Ok(Value::Object(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_message_has_multipart_structure() {
        let raw = build_mime_message("me@example.test", "you@example.test", "Hi", "Hello there");

        assert!(raw.starts_with("From: me@example.test\r\n"));
        assert!(raw.contains("To: you@example.test\r\n"));
        assert!(raw.contains("Subject: Hi\r\n"));
        assert!(raw.contains("Content-Type: multipart/alternative; boundary="));
        assert!(raw.contains("Content-Type: text/plain; charset=\"UTF-8\""));
        assert!(raw.contains("Content-Type: text/html; charset=\"UTF-8\""));
        assert!(raw.trim_end().ends_with("--"));

        // The boundary that the header declares is the one the parts use.
        let boundary = raw
            .split("boundary=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap();
        assert_eq!(raw.matches(&format!("--{boundary}")).count(), 3);
    }

    #[test]
    fn require_str_rejects_missing_and_empty_fields() {
        let mut data = Map::new();
        data.insert("present".to_string(), json!("value"));
        data.insert("empty".to_string(), json!(""));
        data.insert("number".to_string(), json!(7));

        assert_eq!(require_str(&data, "present").unwrap(), "value");
        assert!(matches!(
            require_str(&data, "empty"),
            Err(HandlerError::MissingField(_))
        ));
        assert!(matches!(
            require_str(&data, "missing"),
            Err(HandlerError::MissingField(_))
        ));
        assert!(matches!(
            require_str(&data, "number"),
            Err(HandlerError::MissingField(_))
        ));
    }
}
