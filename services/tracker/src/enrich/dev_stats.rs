//! Deployer-history statistics.
//!
//! For each new token the engine pulls the deployer's full token history,
//! excludes the token being enriched, and computes the average market cap
//! over all prior tokens plus the average all-time-high market cap over the
//! newest K of them.  History endpoints are replicated; every call goes
//! through the first-success fallback.
//!
//! Results cache for 300 s per deployer, per-pair ATH peaks for 600 s.

use dt_protocol::{DeployerStats, DevHistoryStats, DevTokenInfo};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::AuthSession;
use crate::cache::{TtlCache, UnitPriceCache};
use crate::enrich::fallback::{EndpointGroup, get_json_first_success};

const DEV_CACHE_TTL: Duration = Duration::from_secs(300);
const ATH_CACHE_TTL: Duration = Duration::from_secs(600);
const UNIT_PRICE_TTL: Duration = Duration::from_secs(60);
const UNIT_PRICE_TIMEOUT: Duration = Duration::from_secs(2);
const UNIT_PRICE_FALLBACK: f64 = 150.0;

const CHART_WINDOW_DAYS: i64 = 30;
const CHART_INTERVAL: &str = "15m";
const CHART_BAR_CAP: &str = "300";

// Outlier bounds for market-cap computation.
const MAX_PRICE: f64 = 1_000_000.0;
const MAX_SUPPLY: f64 = 1e15;
const MIN_MCAP: f64 = 100.0;
const MAX_MCAP: f64 = 100_000_000_000.0;

/// Keys the chart response may nest its bar list under.
const BAR_CONTAINER_KEYS: [&str; 6] = ["bars", "data", "chart", "candles", "ohlc", "result"];

// ---------------------------------------------------------------------------
// Config and client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DevStatsConfig {
    pub dev_history: EndpointGroup,
    pub pair_chart: EndpointGroup,
    pub unit_price_url: String,
    /// K: how many of the newest prior tokens get an ATH lookup.
    pub ath_window: usize,
}

pub struct DevStatsClient {
    http: reqwest::Client,
    cfg: DevStatsConfig,
    auth: Arc<AuthSession>,
    dev_cache: TtlCache<String, DevHistoryStats>,
    ath_cache: TtlCache<(String, u64), f64>,
    unit_price: UnitPriceCache,
}

impl DevStatsClient {
    pub fn new(cfg: DevStatsConfig, auth: Arc<AuthSession>, http: reqwest::Client) -> Self {
        DevStatsClient {
            http,
            cfg,
            auth,
            dev_cache: TtlCache::new(DEV_CACHE_TTL),
            ath_cache: TtlCache::new(ATH_CACHE_TTL),
            unit_price: UnitPriceCache::new(UNIT_PRICE_FALLBACK, UNIT_PRICE_TTL),
        }
    }

    /// Compute (or serve from cache) the deployer statistics for a token.
    ///
    /// Never returns an error at the call level: every failure mode maps to
    /// the `Error` variant so the token keeps flowing to dispatch.
    pub async fn deployer_stats(&self, deployer: &str, current_token: &str) -> DeployerStats {
        if let Some((mut hit, age)) = self.dev_cache.get(&deployer.to_owned()) {
            hit.cached = true;
            hit.cache_age_secs = age.as_secs();
            return DeployerStats::Ready(hit);
        }

        let Ok(creds) = self.auth.ensure_fresh().await else {
            return DeployerStats::error("Auth failed");
        };
        let unit_price = self.unit_price().await;

        let outcome = match get_json_first_success(
            &self.http,
            &self.cfg.dev_history,
            &[("devAddress", deployer.to_owned())],
            &creds.cookie_header(),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => return DeployerStats::error(e.to_string()),
        };

        let history = match parse_history(&outcome.data) {
            Ok(history) => history,
            Err(reason) => return DeployerStats::error(reason),
        };

        let excluded = exclude_current(history, current_token);
        if excluded.tokens.is_empty() || excluded.total == 0 {
            return DeployerStats::FirstToken;
        }

        let (valid_mcaps, mut tokens_info) = collect_valid(&excluded.tokens, unit_price);
        if valid_mcaps.is_empty() {
            return DeployerStats::error("No valid tokens");
        }
        let avg_mcap = valid_mcaps.iter().sum::<f64>() / valid_mcaps.len() as f64;
        if avg_mcap > MAX_MCAP {
            return DeployerStats::error("Invalid data");
        }

        let avg_ath_mcap = self.fill_ath_window(&mut tokens_info).await;

        let stats = DevHistoryStats {
            avg_mcap,
            avg_ath_mcap,
            migrated: excluded.migrated,
            total: excluded.total,
            valid_tokens: valid_mcaps.len() as u32,
            tokens_info,
            api_used: outcome.api_used,
            cached: false,
            cache_age_secs: 0,
        };
        self.dev_cache.insert(deployer.to_owned(), stats.clone());
        DeployerStats::Ready(stats)
    }

    /// Fetch ATH market caps for the newest K breakdown entries, in
    /// parallel, and return their average.  Failed lookups contribute
    /// nothing and leave the entry's `ath_mcap` at zero.
    async fn fill_ath_window(&self, tokens_info: &mut [DevTokenInfo]) -> f64 {
        let window = tokens_info.len().min(self.cfg.ath_window);
        let lookups = tokens_info[..window]
            .iter()
            .map(|info| {
                let pair = info.pair_address.clone();
                let supply = info.supply;
                async move {
                    if pair.is_empty() {
                        return None;
                    }
                    match self.pair_ath(&pair, supply).await {
                        Ok(ath) => Some(ath),
                        Err(reason) => {
                            debug!(pair, %reason, "ATH lookup failed");
                            None
                        }
                    }
                }
            })
            .collect::<Vec<_>>();
        let results = futures_util::future::join_all(lookups).await;

        let mut obtained = Vec::new();
        for (info, ath) in tokens_info[..window].iter_mut().zip(results) {
            if let Some(ath) = ath {
                info.ath_mcap = ath;
                obtained.push(ath);
            }
        }
        if obtained.is_empty() {
            0.0
        } else {
            obtained.iter().sum::<f64>() / obtained.len() as f64
        }
    }

    /// Peak market cap of a pair over the last 30 days of 15-minute bars.
    async fn pair_ath(&self, pair_address: &str, supply: f64) -> Result<f64, String> {
        let key = (pair_address.to_owned(), supply.to_bits());
        if let Some((hit, _)) = self.ath_cache.get(&key) {
            return Ok(hit);
        }

        let Ok(creds) = self.auth.ensure_fresh().await else {
            return Err("Auth failed".to_owned());
        };

        let now = chrono::Utc::now();
        let from_ms = (now - chrono::TimeDelta::days(CHART_WINDOW_DAYS))
            .timestamp_millis()
            .to_string();
        let to_ms = now.timestamp_millis().to_string();
        let query = [
            ("pairAddress", pair_address.to_owned()),
            ("from", from_ms.clone()),
            ("to", to_ms.clone()),
            ("currency", "USD".to_owned()),
            ("interval", CHART_INTERVAL.to_owned()),
            ("openTrading", from_ms),
            ("lastTransactionTime", to_ms),
            ("countBars", CHART_BAR_CAP.to_owned()),
            ("showOutliers", "false".to_owned()),
            ("isNew", "false".to_owned()),
        ];

        let outcome = get_json_first_success(
            &self.http,
            &self.cfg.pair_chart,
            &query,
            &creds.cookie_header(),
        )
        .await
        .map_err(|e| e.to_string())?;

        let bars = extract_bars(&outcome.data).ok_or_else(|| "No bars found".to_owned())?;
        let peak = peak_price(bars);
        if peak == 0.0 {
            return Err("No valid price data".to_owned());
        }

        let ath_mcap = peak * supply;
        self.ath_cache.insert(key, ath_mcap);
        Ok(ath_mcap)
    }

    /// The unit-currency price, refreshed at most once a minute; falls back
    /// to the last known value when the refresh fails.
    async fn unit_price(&self) -> f64 {
        if let Some(price) = self.unit_price.get_fresh() {
            return price;
        }
        match self.fetch_unit_price().await {
            Some(price) => {
                self.unit_price.store(price);
                price
            }
            None => self.unit_price.last_known(),
        }
    }

    async fn fetch_unit_price(&self) -> Option<f64> {
        let response = self
            .http
            .get(&self.cfg.unit_price_url)
            .timeout(UNIT_PRICE_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        first_number(&body)
    }
}

// ---------------------------------------------------------------------------
// History response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HistoryToken {
    token_address: String,
    pair_address: String,
    token_name: String,
    token_ticker: String,
    price_sol: f64,
    supply: f64,
    migrated: bool,
    created_at: String,
    protocol: String,
}

#[derive(Debug, PartialEq)]
struct History {
    tokens: Vec<HistoryToken>,
    migrated_count: u32,
    total_count: u32,
}

#[derive(Debug)]
struct ExcludedHistory {
    /// Prior tokens, newest first, current excluded.
    tokens: Vec<HistoryToken>,
    migrated: u32,
    total: u32,
}

fn parse_history(data: &Value) -> Result<History, String> {
    let tokens_value = data.get("tokens");
    // Element-tolerant: a malformed entry drops alone, not the whole list.
    let tokens: Vec<HistoryToken> = match tokens_value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect(),
        _ => Vec::new(),
    };

    let (migrated_count, total_count) = if let Some(counts) = data.get("counts") {
        (
            u32::try_from(counts.get("migratedCount").and_then(Value::as_u64).unwrap_or(0))
                .unwrap_or(u32::MAX),
            u32::try_from(counts.get("totalCount").and_then(Value::as_u64).unwrap_or(0))
                .unwrap_or(u32::MAX),
        )
    } else if tokens_value.is_some() {
        let migrated = tokens.iter().filter(|t| t.migrated).count() as u32;
        (migrated, tokens.len() as u32)
    } else {
        return Err("Invalid response format".to_owned());
    };

    if tokens.is_empty() {
        return Err("No tokens found".to_owned());
    }

    Ok(History {
        tokens,
        migrated_count,
        total_count,
    })
}

/// Remove the token being enriched from the history and adjust the counts:
/// the current token must never count toward its own deployer's record.
fn exclude_current(history: History, current_token: &str) -> ExcludedHistory {
    let current = history
        .tokens
        .iter()
        .find(|t| t.token_address == current_token);
    let in_list = current.is_some();
    let current_migrated = current.is_some_and(|t| t.migrated);

    let mut tokens: Vec<HistoryToken> = history
        .tokens
        .into_iter()
        .filter(|t| t.token_address != current_token)
        .collect();
    // ISO-8601 creation timestamps order lexicographically.
    tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let migrated = history
        .migrated_count
        .saturating_sub(u32::from(current_migrated));
    let total = history.total_count.saturating_sub(u32::from(in_list));

    ExcludedHistory {
        tokens,
        migrated,
        total,
    }
}

/// Apply the outlier rules and build the breakdown list.  Returns the
/// accepted market caps alongside one `DevTokenInfo` per accepted token.
fn collect_valid(tokens: &[HistoryToken], unit_price: f64) -> (Vec<f64>, Vec<DevTokenInfo>) {
    let mut mcaps = Vec::new();
    let mut infos = Vec::new();
    for token in tokens {
        if token.price_sol <= 0.0 || token.supply <= 0.0 {
            continue;
        }
        if token.price_sol > MAX_PRICE || token.supply > MAX_SUPPLY {
            continue;
        }
        let mcap = token.price_sol * token.supply * unit_price;
        if !(MIN_MCAP..=MAX_MCAP).contains(&mcap) {
            continue;
        }
        mcaps.push(mcap);
        infos.push(DevTokenInfo {
            pair_address: token.pair_address.clone(),
            ticker: token.token_ticker.clone(),
            name: token.token_name.clone(),
            mcap,
            supply: token.supply,
            ath_mcap: 0.0,
            migrated: token.migrated,
            created_at: token.created_at.clone(),
            protocol: token.protocol.clone(),
        });
    }
    (mcaps, infos)
}

// ---------------------------------------------------------------------------
// Chart response parsing
// ---------------------------------------------------------------------------

fn extract_bars(data: &Value) -> Option<&Vec<Value>> {
    match data {
        Value::Array(bars) => Some(bars),
        Value::Object(map) => BAR_CONTAINER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    }
}

/// Max of the high/close values across all bars.  A bar is either a 5-tuple
/// `[_, _, high, _, close]` or a map keyed `h`/`high` and `c`/`close`/`price`.
fn peak_price(bars: &[Value]) -> f64 {
    let mut max_price: f64 = 0.0;
    for bar in bars {
        match bar {
            Value::Array(fields) if fields.len() >= 5 => {
                let high = value_as_f64(&fields[2]);
                let close = value_as_f64(&fields[4]);
                max_price = max_price.max(high).max(close);
            }
            Value::Object(map) => {
                let high = map
                    .get("h")
                    .or_else(|| map.get("high"))
                    .map_or(0.0, value_as_f64);
                let close = map
                    .get("c")
                    .or_else(|| map.get("close"))
                    .or_else(|| map.get("price"))
                    .map_or(0.0, value_as_f64);
                max_price = max_price.max(high).max(close);
            }
            _ => {}
        }
    }
    max_price
}

fn value_as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Depth-first search for the first numeric leaf of a JSON document.
fn first_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map.values().find_map(first_number),
        Value::Array(items) => items.iter().find_map(first_number),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history_token(address: &str, migrated: bool, created_at: &str) -> Value {
        json!({
            "tokenAddress": address,
            "pairAddress": format!("pair-{address}"),
            "tokenName": "Tok",
            "tokenTicker": "TOK",
            "priceSol": 0.0001,
            "supply": 1_000_000_000.0,
            "migrated": migrated,
            "createdAt": created_at,
            "protocol": "pump v1"
        })
    }

    #[test]
    fn counts_object_is_preferred_over_manual_summing() {
        let data = json!({
            "counts": {"migratedCount": 4, "totalCount": 7},
            "tokens": [history_token("a", false, "2026-01-01")]
        });
        let history = parse_history(&data).unwrap();
        assert_eq!(history.migrated_count, 4);
        assert_eq!(history.total_count, 7);
    }

    #[test]
    fn missing_counts_are_summed_from_the_migrated_flags() {
        let data = json!({
            "tokens": [
                history_token("a", true, "2026-01-01"),
                history_token("b", false, "2026-01-02"),
                history_token("c", true, "2026-01-03")
            ]
        });
        let history = parse_history(&data).unwrap();
        assert_eq!(history.migrated_count, 2);
        assert_eq!(history.total_count, 3);
    }

    #[test]
    fn responses_without_counts_or_tokens_are_invalid() {
        assert_eq!(
            parse_history(&json!({"something": 1})),
            Err("Invalid response format".to_owned())
        );
        assert_eq!(
            parse_history(&json!({"tokens": []})),
            Err("No tokens found".to_owned())
        );
    }

    #[test]
    fn current_token_in_list_adjusts_both_counts() {
        // counts = {migratedCount: 4, totalCount: 7}, current is listed and
        // migrated -> reported migrated = 3, total = 6.
        let data = json!({
            "counts": {"migratedCount": 4, "totalCount": 7},
            "tokens": [
                history_token("current", true, "2026-01-05"),
                history_token("old", false, "2026-01-01")
            ]
        });
        let excluded = exclude_current(parse_history(&data).unwrap(), "current");
        assert_eq!(excluded.migrated, 3);
        assert_eq!(excluded.total, 6);
        assert_eq!(excluded.tokens.len(), 1);
    }

    #[test]
    fn current_token_absent_from_list_leaves_counts_untouched() {
        let data = json!({
            "counts": {"migratedCount": 4, "totalCount": 7},
            "tokens": [history_token("old", true, "2026-01-01")]
        });
        let excluded = exclude_current(parse_history(&data).unwrap(), "unlisted");
        assert_eq!(excluded.migrated, 4);
        assert_eq!(excluded.total, 7);
    }

    #[test]
    fn exclusion_sorts_remaining_tokens_newest_first() {
        let data = json!({
            "tokens": [
                history_token("a", false, "2026-01-01"),
                history_token("b", false, "2026-03-01"),
                history_token("c", false, "2026-02-01")
            ]
        });
        let excluded = exclude_current(parse_history(&data).unwrap(), "none");
        let order: Vec<&str> = excluded
            .tokens
            .iter()
            .map(|t| t.token_address.as_str())
            .collect();
        assert_eq!(order, ["b", "c", "a"]);
    }

    #[test]
    fn outlier_rules_reject_bad_tokens() {
        let unit_price = 100.0;
        let mk = |price: f64, supply: f64| HistoryToken {
            price_sol: price,
            supply,
            ..HistoryToken::default()
        };
        let tokens = vec![
            mk(0.0, 1e9),        // zero price
            mk(-1.0, 1e9),       // negative price
            mk(0.001, 0.0),      // zero supply
            mk(2_000_000.0, 10.0), // price above bound
            mk(0.001, 1e16),     // supply above bound
            mk(0.0000000001, 1000.0), // mcap below 100
            mk(10_000.0, 1e9),   // mcap above 1e11
            mk(0.0001, 1e9),     // accepted: 0.0001 * 1e9 * 100 = 10_000_000
        ];
        let (mcaps, infos) = collect_valid(&tokens, unit_price);
        assert_eq!(mcaps.len(), 1);
        assert_eq!(infos.len(), 1);
        assert_eq!(mcaps[0], 10_000_000.0);
    }

    #[test]
    fn bars_are_found_as_list_or_under_container_keys() {
        let plain = json!([[0, 0, 1.0, 0, 2.0]]);
        assert!(extract_bars(&plain).is_some());

        let nested = json!({"candles": [[0, 0, 1.0, 0, 2.0]]});
        assert_eq!(extract_bars(&nested).unwrap().len(), 1);

        assert!(extract_bars(&json!({"bars": {}})).is_none());
        assert!(extract_bars(&json!("nope")).is_none());
    }

    #[test]
    fn peak_price_covers_tuple_and_map_bars() {
        let bars = json!([
            [1000, 0.5, 0.9, 0.4, 0.7],
            {"h": 1.2, "c": 0.8},
            {"high": "1.5", "close": "1.1"},
            {"price": 2.5},
            {"unrelated": true}
        ]);
        let bars = bars.as_array().unwrap().clone();
        assert_eq!(peak_price(&bars), 2.5);
    }

    #[test]
    fn peak_price_is_zero_without_usable_values() {
        let bars = vec![json!([1, 2]), json!({"volume": 9})];
        assert_eq!(peak_price(&bars), 0.0);
    }

    #[test]
    fn first_number_walks_nested_documents() {
        assert_eq!(first_number(&json!({"solana": {"usd": 151.25}})), Some(151.25));
        assert_eq!(first_number(&json!([{"a": "x"}, {"b": 3}])), Some(3.0));
        assert_eq!(first_number(&json!({"a": "only strings"})), None);
    }
}
