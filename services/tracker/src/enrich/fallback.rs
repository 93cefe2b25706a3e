//! First-success fallback over replicated upstream endpoints.
//!
//! Every enrichment endpoint exists as a primary URL plus an ordered list of
//! functionally equivalent replicas.  The primary is tried first with a
//! retry on gateway-class statuses; on failure all replicas launch in
//! parallel with a staggered start and the first successful response wins.
//! The losing futures are simply dropped.

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Statuses worth a second attempt on the same endpoint.
const RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];
const RETRY_PAUSE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Endpoint group
// ---------------------------------------------------------------------------

/// A primary endpoint and its replicas, with the per-attempt deadline and
/// the replica start stagger.
#[derive(Debug, Clone)]
pub struct EndpointGroup {
    pub primary: String,
    pub replicas: Vec<String>,
    pub stagger: Duration,
    pub attempt_timeout: Duration,
}

/// A successful fallback fetch: the parsed body and which endpoint served it.
#[derive(Debug)]
pub struct FallbackOutcome {
    pub data: Value,
    /// Host of the endpoint that answered, e.g. `api3.example.com`.
    pub api_used: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("All APIs failed (last: {last})")]
    AllFailed { last: String },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// GET `query` against the group and return the first successful JSON body.
///
/// The primary gets two attempts on retryable statuses; replicas get one
/// attempt each.  Timeouts never overwrite the recorded last error so the
/// terminal message names a concrete failure when one exists.
pub async fn get_json_first_success(
    client: &reqwest::Client,
    group: &EndpointGroup,
    query: &[(&str, String)],
    cookie: &str,
) -> Result<FallbackOutcome, FallbackError> {
    let mut last_error: Option<String> = None;

    match try_with_retry(client, &group.primary, query, cookie, group.attempt_timeout, 2).await {
        Ok(data) => {
            return Ok(FallbackOutcome {
                data,
                api_used: host_of(&group.primary).to_owned(),
            });
        }
        Err(reason) => {
            debug!(endpoint = %host_of(&group.primary), %reason, "primary endpoint failed");
            if reason != "Timeout" {
                last_error = Some(format!("{}: {}", host_of(&group.primary), reason));
            }
        }
    }

    let mut in_flight = FuturesUnordered::new();
    for (i, url) in group.replicas.iter().enumerate() {
        let delay = group.stagger * (i as u32 + 1);
        in_flight.push(async move {
            tokio::time::sleep(delay).await;
            let result =
                try_with_retry(client, url, query, cookie, group.attempt_timeout, 1).await;
            (result, url.as_str())
        });
    }

    while let Some((result, url)) = in_flight.next().await {
        match result {
            Ok(data) => {
                return Ok(FallbackOutcome {
                    data,
                    api_used: host_of(url).to_owned(),
                });
            }
            Err(reason) => {
                debug!(endpoint = %host_of(url), %reason, "replica failed");
                if reason != "Timeout" {
                    last_error = Some(format!("{}: {}", host_of(url), reason));
                }
            }
        }
    }

    Err(FallbackError::AllFailed {
        last: last_error.unwrap_or_else(|| "unknown".to_owned()),
    })
}

// ---------------------------------------------------------------------------
// Single-endpoint attempt
// ---------------------------------------------------------------------------

async fn try_with_retry(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
    cookie: &str,
    attempt_timeout: Duration,
    attempts: u32,
) -> Result<Value, String> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = client
            .get(url)
            .query(query)
            .header(reqwest::header::COOKIE, cookie)
            .timeout(attempt_timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    return resp
                        .json::<Value>()
                        .await
                        .map_err(|e| format!("invalid JSON body: {e}"));
                }
                if RETRY_STATUSES.contains(&status) && attempt < attempts {
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
                return Err(format!("HTTP {status}"));
            }
            Err(e) if e.is_timeout() => return Err("Timeout".to_owned()),
            Err(e) => return Err(e.to_string()),
        }
    }
}

fn host_of(url: &str) -> &str {
    url.split('/').nth(2).unwrap_or(url)
}
