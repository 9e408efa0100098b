// =============================================================================
// REST Feeds — HTTP implementations of the market data seams
// =============================================================================
//
// Plain unauthenticated JSON endpoints: one serving M1 OHLCV history, one
// serving pool snapshots. Both clients carry a 30-second request timeout;
// retries and degradation are the scheduler's concern.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::PoolRef;
use crate::types::{Candle, PoolSnapshot};
use crate::venues::{MarketFeed, SnapshotFeed};

/// Per-request timeout for both feeds.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build reqwest client")
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// REST-backed M1 candle source.
#[derive(Clone)]
pub struct HttpMarketFeed {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMarketFeed {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(),
        }
    }

    fn candles_url(&self, pair_id: &str, since_ms: i64) -> String {
        format!(
            "{}/v1/candles?pair={}&tf=1m&since={}",
            self.base_url, pair_id, since_ms
        )
    }
}

#[async_trait]
impl MarketFeed for HttpMarketFeed {
    #[instrument(skip(self), name = "feed::fetch_m1")]
    async fn fetch_m1_since(&self, pair_id: &str, since_ms: i64) -> Result<Vec<Candle>> {
        let url = self.candles_url(pair_id, since_ms);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("candle feed request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("candle feed returned {status} for {url}");
        }

        let mut candles: Vec<Candle> = resp
            .json()
            .await
            .context("failed to parse candle feed response")?;
        candles.sort_by_key(|c| c.ts);
        candles.retain(|c| c.ts > since_ms);

        debug!(pair = pair_id, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

// ---------------------------------------------------------------------------
// Pool snapshots
// ---------------------------------------------------------------------------

/// REST-backed pool snapshot source.
#[derive(Clone)]
pub struct HttpSnapshotFeed {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSnapshotFeed {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(),
        }
    }

    fn snapshots_url(&self, pools: &[PoolRef]) -> String {
        let ids: Vec<String> = pools
            .iter()
            .map(|p| format!("{}:{}", p.chain, p.address))
            .collect();
        format!("{}/v1/pools?ids={}", self.base_url, ids.join(","))
    }
}

#[async_trait]
impl SnapshotFeed for HttpSnapshotFeed {
    #[instrument(skip(self, pools), name = "feed::fetch_snapshots")]
    async fn fetch_snapshots(&self, pools: &[PoolRef]) -> Result<Vec<PoolSnapshot>> {
        if pools.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.snapshots_url(pools);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("snapshot feed request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("snapshot feed returned {status} for {url}");
        }

        let snapshots: Vec<PoolSnapshot> = resp
            .json()
            .await
            .context("failed to parse snapshot feed response")?;

        debug!(count = snapshots.len(), "pool snapshots fetched");
        Ok(snapshots)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DexFamily;

    #[test]
    fn candles_url_shape() {
        let feed = HttpMarketFeed::new("https://data.example.com/");
        let url = feed.candles_url("weth-usdc", 1_700_000_000_000);
        assert_eq!(
            url,
            "https://data.example.com/v1/candles?pair=weth-usdc&tf=1m&since=1700000000000"
        );
    }

    #[test]
    fn snapshots_url_joins_pool_ids() {
        let feed = HttpSnapshotFeed::new("https://data.example.com");
        let pools = vec![
            PoolRef {
                chain: "base".into(),
                address: "0xaaa".into(),
                dex: DexFamily::V3,
            },
            PoolRef {
                chain: "arbitrum".into(),
                address: "0xbbb".into(),
                dex: DexFamily::Lb,
            },
        ];
        let url = feed.snapshots_url(&pools);
        assert!(url.ends_with("/v1/pools?ids=base:0xaaa,arbitrum:0xbbb"));
    }
}
