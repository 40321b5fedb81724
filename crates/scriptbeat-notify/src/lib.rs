//! # ScriptBeat Notify
//!
//! Fan-out of completed run records to configured channels. One
//! fire-and-forget send per enabled config; failures are logged, never
//! surfaced to the scheduler. The contract ends at "message sent".
//!
//! Scripts can mark lines for notification with a `[NOTIFY]` prefix; only
//! those lines (plus any error) make up the message body. Without marked
//! lines a compact default summary is sent instead.

use std::sync::RwLock;
use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use scriptbeat_core::{Error, NotifierConfig, NotifierKind, Result, RunLog};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification fan-out over the enabled notifier configs.
pub struct Notifier {
    configs: RwLock<Vec<NotifierConfig>>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(Vec::new()),
            client: reqwest::Client::new(),
        }
    }

    /// Replace the active config set. Disabled configs are dropped here so
    /// the send path never has to re-check.
    pub fn set_configs(&self, configs: Vec<NotifierConfig>) {
        let enabled: Vec<NotifierConfig> = configs.into_iter().filter(|c| c.enabled).collect();
        *self.configs.write().unwrap() = enabled;
    }

    /// Fire-and-forget: one spawned send per enabled config.
    pub fn notify(&self, log: &RunLog) {
        let configs = self.configs.read().unwrap().clone();
        for config in configs {
            let client = self.client.clone();
            let log = log.clone();
            tokio::spawn(async move {
                if let Err(e) = send(&client, &config, &log).await {
                    tracing::warn!(
                        "failed to send notification via {} '{}': {e}",
                        kind_name(config.kind),
                        config.name
                    );
                }
            });
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

async fn send(client: &reqwest::Client, config: &NotifierConfig, log: &RunLog) -> Result<()> {
    match config.kind {
        NotifierKind::Dingtalk | NotifierKind::Wecom => {
            let webhook = require_webhook(config)?;
            let content = message_body(log);
            post_json(
                client,
                &webhook,
                &serde_json::json!({
                    "msgtype": "text",
                    "text": { "content": content }
                }),
            )
            .await
        }
        NotifierKind::Lark => {
            let webhook = require_webhook(config)?;
            let url = lark_url(&webhook, config.setting("secret"))?;
            let content = message_body(log);
            post_json(
                client,
                &url,
                &serde_json::json!({
                    "msg_type": "text",
                    "content": { "text": content }
                }),
            )
            .await
        }
        NotifierKind::Webhook => {
            // Generic webhooks receive the full record.
            let webhook = require_webhook(config)?;
            post_json(client, &webhook, log).await
        }
        NotifierKind::Email => {
            tracing::warn!("email notifier '{}' configured but not supported", config.name);
            Ok(())
        }
    }
}

fn require_webhook(config: &NotifierConfig) -> Result<String> {
    let webhook = config.setting("webhook");
    if webhook.is_empty() {
        return Err(Error::Notify(format!(
            "notifier '{}' has no webhook URL configured",
            config.name
        )));
    }
    Ok(webhook.to_string())
}

async fn post_json<T: serde::Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
) -> Result<()> {
    let resp = client
        .post(url)
        .json(payload)
        .timeout(SEND_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Notify(format!("send failed: {e}")))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(Error::Notify(format!(
            "unexpected status code: {}",
            resp.status()
        )))
    }
}

/// Lark webhooks with a configured secret require a signed URL: HMAC-SHA256
/// with `"{timestamp}\n{secret}"` as the key over an empty message, base64
/// encoded, passed back as `timestamp`/`sign` query parameters.
fn lark_url(webhook: &str, secret: &str) -> Result<String> {
    if secret.is_empty() {
        return Ok(webhook.to_string());
    }
    let timestamp = chrono::Utc::now().timestamp();
    let sign = lark_sign(timestamp, secret);

    let mut url = reqwest::Url::parse(webhook)
        .map_err(|e| Error::Notify(format!("invalid webhook URL: {e}")))?;
    url.query_pairs_mut()
        .append_pair("timestamp", &timestamp.to_string())
        .append_pair("sign", &sign);
    Ok(url.into())
}

fn lark_sign(timestamp: i64, secret: &str) -> String {
    let key = format!("{timestamp}\n{secret}");
    // Key material is the string to sign; the message itself is empty.
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("any key length is valid");
    mac.update(b"");
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Build the message body: `[NOTIFY]`-marked lines if any, else a summary.
fn message_body(log: &RunLog) -> String {
    let marked = extract_notify_content(log);
    if marked.is_empty() {
        default_summary(log)
    } else {
        marked
    }
}

/// Collect output lines carrying a `[NOTIFY]` marker (case insensitive),
/// stripped of the marker. The run error, when present, is always appended.
fn extract_notify_content(log: &RunLog) -> String {
    let mut lines: Vec<String> = Vec::new();

    for line in log.output.lines() {
        if line.to_uppercase().contains("[NOTIFY]") {
            let cleaned = line
                .replacen("[NOTIFY]", "", 1)
                .replacen("[notify]", "", 1)
                .trim()
                .to_string();
            if !cleaned.is_empty() {
                lines.push(cleaned);
            }
        }
    }

    if !log.error.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(format!("❌ error: {}", log.error));
    }

    lines.join("\n")
}

/// Compact fallback summary: status, name, duration, error or leading output.
fn default_summary(log: &RunLog) -> String {
    let status = if log.success { "✅ success" } else { "❌ failed" };
    let mut summary = format!("{status} {}\n", log.task_name);
    summary.push_str(&format!("duration: {}ms\n", log.duration_ms));

    if !log.error.is_empty() {
        summary.push_str(&format!("\nerror: {}", log.error));
    } else if !log.output.is_empty() {
        let output: String = if log.output.len() > 200 {
            let mut end = 200;
            while !log.output.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &log.output[..end])
        } else {
            log.output.clone()
        };
        summary.push_str(&format!("\noutput:\n{output}"));
    }

    summary
}

fn kind_name(kind: NotifierKind) -> &'static str {
    match kind {
        NotifierKind::Dingtalk => "dingtalk",
        NotifierKind::Wecom => "wecom",
        NotifierKind::Lark => "lark",
        NotifierKind::Webhook => "webhook",
        NotifierKind::Email => "email",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scriptbeat_core::models::new_id;

    fn log_with(output: &str, error: &str, success: bool) -> RunLog {
        let now = Utc::now();
        RunLog {
            id: new_id(),
            task_id: "t1".into(),
            task_name: "weather".into(),
            started_at: now,
            ended_at: now,
            duration_ms: 120,
            output: output.into(),
            error: error.into(),
            success,
        }
    }

    #[test]
    fn notify_marker_lines_are_extracted() {
        let log = log_with(
            "fetching...\n[NOTIFY] rain expected at 14:00\nnoise\n[notify] bring an umbrella",
            "",
            true,
        );
        let body = message_body(&log);
        assert_eq!(body, "rain expected at 14:00\nbring an umbrella");
    }

    #[test]
    fn error_always_appended_to_marked_lines() {
        let log = log_with("[NOTIFY] partial result", "boom", false);
        let body = message_body(&log);
        assert!(body.starts_with("partial result"));
        assert!(body.contains("error: boom"));
    }

    #[test]
    fn default_summary_when_no_markers() {
        let log = log_with("plain output", "", true);
        let body = message_body(&log);
        assert!(body.contains("✅ success weather"));
        assert!(body.contains("duration: 120ms"));
        assert!(body.contains("plain output"));
    }

    #[test]
    fn default_summary_truncates_long_output() {
        let log = log_with(&"x".repeat(500), "", true);
        let body = message_body(&log);
        assert!(body.contains("..."));
        assert!(body.len() < 400);
    }

    #[test]
    fn lark_url_unsigned_without_secret() {
        let url = lark_url("https://open.larksuite.com/hook/abc", "").unwrap();
        assert_eq!(url, "https://open.larksuite.com/hook/abc");
    }

    #[test]
    fn lark_url_signed_with_secret() {
        let url = lark_url("https://open.larksuite.com/hook/abc", "s3cret").unwrap();
        assert!(url.contains("timestamp="));
        assert!(url.contains("sign="));
    }

    #[test]
    fn lark_sign_is_deterministic_base64() {
        let a = lark_sign(1_700_000_000, "secret");
        let b = lark_sign(1_700_000_000, "secret");
        assert_eq!(a, b);
        // 32-byte HMAC-SHA256 digest base64-encodes to 44 chars.
        assert_eq!(a.len(), 44);
        assert_ne!(a, lark_sign(1_700_000_001, "secret"));
    }

    #[test]
    fn disabled_configs_are_dropped() {
        let notifier = Notifier::new();
        let mk = |enabled: bool| NotifierConfig {
            id: new_id(),
            kind: NotifierKind::Webhook,
            name: "hook".into(),
            enabled,
            settings: serde_json::Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        notifier.set_configs(vec![mk(true), mk(false), mk(true)]);
        assert_eq!(notifier.configs.read().unwrap().len(), 2);
    }
}
