use std::time::Duration;

use async_trait::async_trait;
use tokio::task;
use url::Url;

use crate::ResolutionError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retrieves remote descriptor text. The resolver never talks to the network directly.
#[async_trait]
pub trait DescriptorFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, ResolutionError>;
}

/// Blocking `ureq` requests, moved off the runtime with `spawn_blocking`.
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DescriptorFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, ResolutionError> {
        let agent = self.agent.clone();
        let target = url.clone();
        let failure = |reason: String| ResolutionError::Fetch {
            location: url.to_string(),
            reason,
        };

        let outcome = task::spawn_blocking(move || match agent.request_url("GET", &target).call() {
            Ok(response) => response.into_string().map_err(|e| e.to_string()),
            Err(ureq::Error::Status(code, _)) => Err(format!("server answered with status {code}")),
            Err(ureq::Error::Transport(transport)) => Err(transport.to_string()),
        })
        .await
        .map_err(|e| failure(e.to_string()))?;

        outcome.map_err(failure)
    }
}
