use crate::core::state::{JobMode, RenderProgress, RosterEntry};
use crate::services::cache::normalize_episode_id;
use crate::services::engine::{JobEvent, RenderService, ScriptMatch, ScriptMatcher, VoiceEngine};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::VecDeque;
use url::Url;

/// HTTP adapter for the dubbing backend. One instance serves the matcher,
/// voice-engine and render-service roles; progress endpoints stream NDJSON.
pub struct RemoteEngine {
    client: reqwest::Client,
    base: Url,
}

impl RemoteEngine {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid backend base URL: {}", base_url))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Backend base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow!("Backend returned {}: {}", status, body))
}

/// Decodes a newline-delimited JSON body into typed items. Lines may split
/// across chunks; malformed lines are skipped, a transport error ends the
/// stream.
fn ndjson_stream<T, S, B, E>(body: S) -> BoxStream<'static, T>
where
    T: DeserializeOwned + Send + 'static,
    S: futures_util::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    struct Decoder<S, T> {
        body: std::pin::Pin<Box<S>>,
        buf: String,
        pending: VecDeque<T>,
        done: bool,
    }

    let decoder: Decoder<S, T> = Decoder {
        body: Box::pin(body),
        buf: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(decoder, |mut d| async move {
        loop {
            if let Some(item) = d.pending.pop_front() {
                return Some((item, d));
            }
            if d.done {
                return None;
            }
            match d.body.next().await {
                Some(Ok(chunk)) => {
                    d.buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));
                    while let Some(pos) = d.buf.find('\n') {
                        let line: String = d.buf.drain(..=pos).collect();
                        push_line(&mut d.pending, line.trim());
                    }
                }
                Some(Err(e)) => {
                    warn!("Progress stream transport error: {}", e);
                    d.done = true;
                }
                None => {
                    let rest = std::mem::take(&mut d.buf);
                    push_line(&mut d.pending, rest.trim());
                    d.done = true;
                }
            }
        }
    }))
}

fn push_line<T: DeserializeOwned>(pending: &mut VecDeque<T>, line: &str) {
    if line.is_empty() {
        return;
    }
    match serde_json::from_str(line) {
        Ok(item) => pending.push_back(item),
        Err(e) => warn!("Skipping malformed progress line: {}", e),
    }
}

#[async_trait]
impl ScriptMatcher for RemoteEngine {
    async fn find_match(&self, episode_id: &str, text: &str) -> Result<Option<ScriptMatch>> {
        let url = self.endpoint(&["api", "match"])?;
        let resp = self
            .client
            .post(url)
            .json(&json!({ "episode_id": episode_id, "text": text }))
            .send()
            .await
            .context("Match request failed")?;
        let matched = ensure_success(resp)
            .await?
            .json::<Option<ScriptMatch>>()
            .await
            .context("Failed to parse match response")?;
        Ok(matched)
    }
}

#[async_trait]
impl VoiceEngine for RemoteEngine {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(&["api", "synthesize"])?;
        let resp = self
            .client
            .post(url)
            .json(&json!({ "text": text, "voice_id": voice_id }))
            .send()
            .await
            .context("Synthesis request failed")?;
        let bytes = ensure_success(resp)
            .await?
            .bytes()
            .await
            .context("Failed to read synthesized audio")?;
        debug!("Synthesized {} bytes for voice {}", bytes.len(), voice_id);
        Ok(bytes.to_vec())
    }

    async fn character_catalog(&self) -> Result<Vec<RosterEntry>> {
        let url = self.endpoint(&["api", "characters"])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Catalog request failed")?;
        ensure_success(resp)
            .await?
            .json::<Vec<RosterEntry>>()
            .await
            .context("Failed to parse character catalog")
    }

    async fn submit_batch(&self, char_ids: &[String], mode: JobMode) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct BatchResponse {
            job_id: String,
        }
        let url = self.endpoint(&["api", "jobs"])?;
        let resp = self
            .client
            .post(url)
            .json(&json!({ "char_ids": char_ids, "mode": mode }))
            .send()
            .await
            .context("Batch submission failed")?;
        let parsed = ensure_success(resp)
            .await?
            .json::<BatchResponse>()
            .await
            .context("Failed to parse batch response")?;
        Ok(parsed.job_id)
    }

    async fn subscribe_jobs(&self) -> Result<BoxStream<'static, JobEvent>> {
        let url = self.endpoint(&["api", "jobs", "stream"])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to open job progress stream")?;
        let resp = ensure_success(resp).await?;
        Ok(ndjson_stream(resp.bytes_stream()))
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = self.endpoint(&["api", "jobs", job_id, "cancel"])?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .context("Job cancel request failed")?;
        ensure_success(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl RenderService for RemoteEngine {
    async fn start(&self, episode_ids: &[String]) -> Result<()> {
        let url = self.endpoint(&["api", "renders"])?;
        let resp = self
            .client
            .post(url)
            .json(&json!({ "episode_ids": episode_ids }))
            .send()
            .await
            .context("Render start request failed")?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        let url = self.endpoint(&["api", "renders", "cancel"])?;
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .context("Render cancel request failed")?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn status(&self, episode_id: &str) -> Result<RenderProgress> {
        let episode = normalize_episode_id(episode_id);
        let url = self.endpoint(&["api", "renders", &episode, "status"])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Render status request failed")?;
        ensure_success(resp)
            .await?
            .json::<RenderProgress>()
            .await
            .context("Failed to parse render status")
    }

    async fn delete(&self, episode_id: &str) -> Result<()> {
        let episode = normalize_episode_id(episode_id);
        let url = self.endpoint(&["api", "renders", &episode])?;
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .context("Render delete request failed")?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RenderProgress>> {
        let url = self.endpoint(&["api", "renders", "stream"])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to open render progress stream")?;
        let resp = ensure_success(resp).await?;
        Ok(ndjson_stream(resp.bytes_stream()))
    }

    async fn fetch_artifact(&self, episode_id: &str, script_index: usize) -> Result<Vec<u8>> {
        let episode = normalize_episode_id(episode_id);
        let index = script_index.to_string();
        let url = self.endpoint(&["api", "renders", &episode, "artifacts", &index])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Artifact request failed")?;
        let bytes = ensure_success(resp)
            .await?
            .bytes()
            .await
            .context("Failed to read artifact")?;
        Ok(bytes.to_vec())
    }
}
