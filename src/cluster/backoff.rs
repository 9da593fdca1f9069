//! Jittered exponential backoff for the crate's HTTP clients.

use anyhow::Result;
use std::time::Duration;

/// Upper bound of the random jitter added to every delay, in milliseconds.
const JITTER_MS: u64 = 50;

pub struct Backoff {
    delay_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            delay_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Returns the next delay and doubles the base, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        // Jitter keeps retries from many members from aligning.
        let jitter = rand::random::<u64>() % JITTER_MS;
        let delay = Duration::from_millis(self.delay_ms + jitter);
        self.delay_ms = (self.delay_ms * 2).min(self.max_ms);
        delay
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

/// Sends the request built by `build` up to `attempts` times, backing off
/// between transport failures. Any HTTP status counts as a delivered response.
pub async fn send_with_retry<F>(attempts: usize, mut build: F) -> Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut backoff = Backoff::new(Duration::from_millis(150), Duration::from_millis(1200));

    for attempt in 0..attempts {
        match build().send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt + 1 == attempts => return Err(anyhow::anyhow!(e)),
            Err(_) => backoff.wait().await,
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}
