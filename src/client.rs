//! Leader-following HTTP client.
//!
//! Workers and the CLI talk to whichever replica currently leads. On a
//! `NotLeader` rejection the client follows the hint; with no hint it
//! round-robins the known peers. Transient failures retry with bounded
//! exponential backoff.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;
use tracing::debug;

use crate::api::NotLeaderBody;
use crate::error::{EngineError, Result};
use crate::model::WorkerId;

const MAX_ATTEMPTS: u32 = 6;

pub struct LeaderClient {
    peers: Mutex<PeerRing>,
    http: reqwest::Client,
}

struct PeerRing {
    addrs: Vec<String>,
    current: usize,
}

impl PeerRing {
    fn current(&self) -> String {
        self.addrs[self.current].clone()
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.addrs.len();
    }

    /// Point the ring at a hinted leader, learning it if previously
    /// unknown.
    fn follow_hint(&mut self, hint: &str) {
        match self.addrs.iter().position(|a| a == hint) {
            Some(index) => self.current = index,
            None => {
                self.addrs.push(hint.to_string());
                self.current = self.addrs.len() - 1;
            }
        }
    }
}

enum Verdict<T> {
    Done(T),
    Retry(EngineError),
}

impl LeaderClient {
    pub fn new(peers: Vec<String>) -> Result<Self> {
        if peers.is_empty() {
            return Err(EngineError::Config("no coordinator peers given".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            peers: Mutex::new(PeerRing {
                addrs: peers,
                current: 0,
            }),
            http,
        })
    }

    pub async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.with_retry(|addr| {
            let url = format!("http://{addr}{path}");
            let request = self.http.post(url).json(body);
            async move { request.send().await }
        })
        .await
    }

    pub async fn get<Resp>(&self, path: &str) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.with_retry(|addr| {
            let url = format!("http://{addr}{path}");
            let request = self.http.get(url);
            async move { request.send().await }
        })
        .await
    }

    async fn with_retry<Resp, F, Fut>(&self, send: F) -> Result<Resp>
    where
        Resp: DeserializeOwned,
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut last = EngineError::Unavailable("no attempt made".into());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // Jittered exponential backoff so a fleet of workers does
                // not stampede a recovering leader in lockstep.
                let jitter = rand::rng().random_range(0..100);
                sleep(Duration::from_millis(200 * (1 << attempt.min(4)) + jitter)).await;
            }
            let addr = self.peers.lock().expect("peer ring lock poisoned").current();
            let outcome = match send(addr.clone()).await {
                Ok(response) => self.classify(response).await,
                Err(err) => {
                    debug!(%addr, %err, "peer unreachable, rotating");
                    self.peers.lock().expect("peer ring lock poisoned").advance();
                    Verdict::Retry(EngineError::Transient(err.to_string()))
                }
            };
            match outcome {
                Verdict::Done(value) => return Ok(value),
                Verdict::Retry(err) if err.is_retryable() => last = err,
                Verdict::Retry(err) => return Err(err),
            }
        }
        Err(last)
    }

    async fn classify<Resp: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Verdict<Resp> {
        let status = response.status();
        if status.is_success() {
            return match response.json::<Resp>().await {
                Ok(value) => Verdict::Done(value),
                Err(err) => Verdict::Retry(EngineError::Transient(err.to_string())),
            };
        }
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            409 => {
                let hint = serde_json::from_str::<NotLeaderBody>(&body)
                    .ok()
                    .and_then(|b| b.leader_hint);
                {
                    let mut ring = self.peers.lock().expect("peer ring lock poisoned");
                    match &hint {
                        Some(hint) => ring.follow_hint(hint),
                        None => ring.advance(),
                    }
                }
                Verdict::Retry(EngineError::NotLeader { leader_hint: hint })
            }
            410 => Verdict::Retry(EngineError::WorkerNotFound(WorkerId(body))),
            404 => Verdict::Retry(EngineError::Rejected(body)),
            503 => Verdict::Retry(EngineError::Unavailable(body)),
            _ => Verdict::Retry(EngineError::Rejected(format!("{status}: {body}"))),
        }
    }
}
