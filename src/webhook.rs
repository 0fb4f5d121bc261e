use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use tokio::sync::watch;

use crate::config::Config;
use crate::debounce::{DebounceDecision, Debouncer};
use crate::desk::units::{format_number, HeightAndSpeed};

/// Bursts of telemetry are coalesced into at most one PUT per second.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);
const DEBOUNCE_KEY: &str = "webhook_put_height";

/// Pushes the human height to a configured URL whenever telemetry settles.
pub struct HeightWebhook {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    debouncer: Debouncer,
}

impl HeightWebhook {
    /// Build the webhook from configuration. Returns `None` when no URL is
    /// configured; bad URLs or headers are startup errors.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(raw_url) = config.webhook_put_height.as_deref() else {
            return Ok(None);
        };
        let url = Url::parse(raw_url)
            .with_context(|| format!("Invalid webhook URL: {}", raw_url))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.webhook_put_height_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid webhook header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid webhook header value for {}", name))?;
            headers.insert(name, value);
        }

        Ok(Some(Self {
            client: reqwest::Client::new(),
            url,
            headers,
            debouncer: Debouncer::new(),
        }))
    }

    /// Wait out the debounce window; if this event is still the newest,
    /// deliver the height that is current at fire time.
    async fn deliver(self: Arc<Self>, telemetry: watch::Receiver<HeightAndSpeed>) {
        if self.debouncer.debounce(DEBOUNCE_KEY, DEBOUNCE_WINDOW).await
            != DebounceDecision::Execute
        {
            return;
        }

        let height = telemetry.borrow().height.human();
        log::debug!("Executing webhook for {}mm", format_number(height));
        let request = self
            .client
            .put(self.url.clone())
            .headers(self.headers.clone())
            .body(format_number(height));
        if let Err(e) = request.send().await {
            log::warn!("Webhook delivery failed: {}", e);
        }
    }
}

/// Follow telemetry updates for the process lifetime, debouncing each into
/// a webhook delivery. Runs until the telemetry channel closes.
pub fn spawn_height_watcher(
    webhook: Arc<HeightWebhook>,
    mut telemetry: watch::Receiver<HeightAndSpeed>,
) {
    tokio::spawn(async move {
        while telemetry.changed().await.is_ok() {
            let webhook = webhook.clone();
            let telemetry = telemetry.clone();
            tokio::spawn(webhook.deliver(telemetry));
        }
    });
}
