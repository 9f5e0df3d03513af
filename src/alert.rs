// 📣 Dead-link alerts
// Best-effort notification to a human operator; never fails a cycle

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::sweep::DeadLink;

/// Everything an operator needs to chase the links that died this cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleAlert {
    pub detected_at: DateTime<Utc>,
    pub dead_links: Vec<DeadLink>,
}

impl CycleAlert {
    pub fn new(detected_at: DateTime<Utc>, dead_links: Vec<DeadLink>) -> Self {
        CycleAlert {
            detected_at,
            dead_links,
        }
    }

    pub fn subject(&self) -> String {
        format!("{} dead gear link(s) found", self.dead_links.len())
    }

    /// Plain-text body, one line per link
    pub fn render(&self) -> String {
        let mut body = format!(
            "{} at {}\n\n",
            self.subject(),
            self.detected_at.format("%Y-%m-%d %H:%M UTC")
        );

        for link in &self.dead_links {
            body.push_str(&format!(
                "- #{} {} [{}]: {}\n",
                link.entry_id,
                link.entry_name,
                link.vendor.name(),
                link.url
            ));
        }

        body
    }
}

/// AlertEmitter - fire-and-forget notification sink
pub trait AlertEmitter {
    fn notify_dead_links(&self, alert: &CycleAlert) -> Result<()>;
}

/// Writes the alert to the log; the default when no webhook is configured
#[derive(Debug, Default)]
pub struct LogAlertEmitter;

impl AlertEmitter for LogAlertEmitter {
    fn notify_dead_links(&self, alert: &CycleAlert) -> Result<()> {
        for link in &alert.dead_links {
            warn!(
                entry_id = link.entry_id,
                entry = %link.entry_name,
                vendor = link.vendor.code(),
                url = %link.url,
                "dead link needs attention"
            );
        }
        Ok(())
    }
}

/// POSTs the alert as JSON to an operator-facing webhook
pub struct WebhookAlertEmitter {
    url: String,
    client: Client,
}

impl WebhookAlertEmitter {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;

        Ok(WebhookAlertEmitter {
            url: url.to_string(),
            client,
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: String,
    text: String,
    #[serde(flatten)]
    alert: &'a CycleAlert,
}

impl AlertEmitter for WebhookAlertEmitter {
    fn notify_dead_links(&self, alert: &CycleAlert) -> Result<()> {
        let payload = WebhookPayload {
            subject: alert.subject(),
            text: alert.render(),
            alert,
        };

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("Failed to deliver dead-link alert to {}", self.url))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::Vendor;
    use chrono::TimeZone;

    fn sample_alert() -> CycleAlert {
        CycleAlert::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap(),
            vec![
                DeadLink {
                    entry_id: 3,
                    entry_name: "Trail Runners".to_string(),
                    vendor: Vendor::Rei,
                    url: "http://rei/shoes".to_string(),
                },
                DeadLink {
                    entry_id: 9,
                    entry_name: "Bear Canister".to_string(),
                    vendor: Vendor::Backcountry,
                    url: "http://bc/can".to_string(),
                },
            ],
        )
    }

    #[test]
    fn test_render_lists_every_link() {
        let text = sample_alert().render();

        assert!(text.starts_with("2 dead gear link(s) found at 2024-06-01 12:30 UTC"));
        assert!(text.contains("- #3 Trail Runners [REI]: http://rei/shoes"));
        assert!(text.contains("- #9 Bear Canister [Backcountry]: http://bc/can"));
    }

    #[test]
    fn test_log_emitter_never_fails() {
        assert!(LogAlertEmitter.notify_dead_links(&sample_alert()).is_ok());
    }

    #[test]
    fn test_webhook_payload_shape() {
        let alert = sample_alert();
        let payload = WebhookPayload {
            subject: alert.subject(),
            text: alert.render(),
            alert: &alert,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["subject"], "2 dead gear link(s) found");
        assert_eq!(json["dead_links"][1]["vendor"], "backcountry");
        assert!(json["detected_at"].is_string());
    }

    #[test]
    fn test_webhook_unreachable_is_an_error() {
        let emitter =
            WebhookAlertEmitter::new("http://127.0.0.1:9/alerts", Duration::from_millis(500)).unwrap();

        assert!(emitter.notify_dead_links(&sample_alert()).is_err());
    }
}
