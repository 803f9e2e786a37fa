use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{Collector, CollectorSettings, Heartbeat};

const MAX_ERROR_BODY: usize = 256;
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(1);

/// HTTP(S) collector client.
///
/// One instance per camera so each carries that camera's bearer credential.
pub struct HttpCollector {
    agent: ureq::Agent,
    events_url: String,
    heartbeat_url: String,
    authorization: String,
    events_timeout: Duration,
    heartbeat_timeout: Duration,
}

fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub(crate) fn validate_api_base(api_base: &str) -> Result<Url> {
    let url = Url::parse(api_base).with_context(|| format!("invalid api_base '{}'", api_base))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("api_base scheme must be http or https, got '{}'", other)),
    }
    if url.host_str().is_none() {
        return Err(anyhow!("api_base '{}' has no host", api_base));
    }
    Ok(url)
}

impl HttpCollector {
    pub fn new(settings: &CollectorSettings, api_key: &str) -> Result<Self> {
        validate_api_base(&settings.api_base)?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("collector credential must not be empty"));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.events_timeout.min(settings.heartbeat_timeout))
            .build();
        Ok(Self {
            agent,
            events_url: join(&settings.api_base, &settings.events_path),
            heartbeat_url: join(&settings.api_base, &settings.heartbeat_path),
            authorization: format!("Bearer {}", api_key),
            events_timeout: settings.events_timeout,
            heartbeat_timeout: settings.heartbeat_timeout,
        })
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    fn post(&self, url: &str, body: &str, timeout: Duration) -> Result<()> {
        let result = self
            .agent
            .post(url)
            .timeout(timeout)
            .set("Authorization", &self.authorization)
            .set("Content-Type", "application/json")
            .send_string(body);
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let mut text = response.into_string().unwrap_or_default();
                if text.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                Err(anyhow!("collector {} returned HTTP {}: {}", url, code, text))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(anyhow!("collector {} unreachable: {}", url, transport))
            }
        }
    }
}

impl Collector for HttpCollector {
    fn post_events(&self, batch_json: &str) -> Result<()> {
        self.post(&self.events_url, batch_json, self.events_timeout)
    }

    fn post_events_within(&self, batch_json: &str, timeout: Duration) -> Result<()> {
        let timeout = timeout.min(self.events_timeout).max(MIN_REQUEST_TIMEOUT);
        self.post(&self.events_url, batch_json, timeout)
    }

    fn post_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let body = serde_json::to_string(heartbeat)?;
        self.post(&self.heartbeat_url, &body, self.heartbeat_timeout)
    }
}
