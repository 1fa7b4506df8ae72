//! Reasoning collaborator: decides next actions and decomposes drafts.
//!
//! Both calls take a rendered prompt and return opaque text; parsing lives
//! in `core::decision` and `core::plan`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;
use crate::io::config::EndpointConfig;
use crate::io::worker::send_json;

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(&self, prompt: &str) -> Result<String>;
    async fn decompose(&self, prompt: &str) -> Result<String>;
}

pub struct HttpReasoner {
    client: Client,
    endpoint: String,
}

#[derive(Serialize)]
struct ReasonRequest<'a> {
    kind: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct ReasonResponse {
    text: String,
}

impl HttpReasoner {
    pub fn new(config: &EndpointConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/reason", config.base_url.trim_end_matches('/')),
        })
    }

    async fn ask(&self, kind: &str, prompt: &str) -> Result<String> {
        let response: ReasonResponse = send_json(
            self.client
                .post(&self.endpoint)
                .json(&ReasonRequest { kind, prompt }),
        )
        .await?;
        Ok(response.text)
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    async fn decide(&self, prompt: &str) -> Result<String> {
        self.ask("decide", prompt).await
    }

    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    async fn decompose(&self, prompt: &str) -> Result<String> {
        self.ask("decompose", prompt).await
    }
}
