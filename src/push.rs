//! Push-gateway surface: periodically POSTs the registry snapshot.

use std::time::Duration;

use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pushes the text exposition of a registry to a push gateway once per
/// second. Gathering the registry triggers the collector's background
/// refresh, the same as a scrape would.
pub struct Pusher {
    registry: Registry,
    url: String,
    client: reqwest::Client,
}

impl Pusher {
    pub fn new(registry: Registry, endpoint: &str, job: &str) -> Self {
        Self {
            registry,
            url: gateway_url(endpoint, job),
            client: reqwest::Client::new(),
        }
    }

    /// Run the push loop until the shutdown signal is received. Failed
    /// pushes are logged and retried at the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        info!(url = %self.url, "pushing metrics");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.push_once().await {
                        warn!(error = %err, "push failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("pusher stopped");
        Ok(())
    }

    async fn push_once(&self) -> anyhow::Result<()> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "text/plain; version=0.0.4")
            .body(buffer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("push gateway returned {status}");
        }
        debug!("pushed metrics");
        Ok(())
    }
}

/// Build the push URL for a job. Endpoints without a scheme get `http://`.
fn gateway_url(endpoint: &str, job: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/metrics/job/{job}")
    } else {
        format!("http://{base}/metrics/job/{job}")
    }
}
