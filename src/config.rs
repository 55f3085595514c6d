use std::env;
use std::path::PathBuf;

/// Chart hub configuration derived from environment variables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: String,
    pub port: u16,
    /// Bearer token for API auth.  Empty ⇒ auth disabled.
    pub token: String,

    // ── Bar store ──────────────────────────────────────────────────
    pub db_path: PathBuf,

    // ── Chain access ───────────────────────────────────────────────
    pub rpc_url: String,
    /// Topic0 of the trade settlement event scanned during backfill.
    pub settle_topic: String,
    pub genesis_block: u64,

    // ── Backfill tuning ────────────────────────────────────────────
    pub backfill_chunk: u64,
    pub backfill_retries: u32,
    pub backfill_backoff_ms: u64,
    pub backfill_window_delay_ms: u64,

    // ── Live feed ──────────────────────────────────────────────────
    pub live_poll_ms: u64,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_str(name, default))
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self {
            bind: env_str("CHART_HUB_BIND", "127.0.0.1"),
            port: env_u16("CHART_HUB_PORT", 61020),
            token: env_str("CHART_HUB_TOKEN", ""),
            db_path: env_path("CHART_HUB_DB", "chart_bars.db"),
            rpc_url: env_str("CHART_HUB_RPC_URL", "http://127.0.0.1:8545"),
            settle_topic: env_str("CHART_HUB_SETTLE_TOPIC", DEFAULT_SETTLE_TOPIC),
            genesis_block: env_u64("CHART_HUB_GENESIS_BLOCK", 0),
            // External providers commonly cap eth_getLogs at 2000 blocks.
            backfill_chunk: env_u64("CHART_HUB_BACKFILL_CHUNK", 2000).clamp(1, 2000),
            backfill_retries: env_u32("CHART_HUB_BACKFILL_RETRIES", 5),
            backfill_backoff_ms: env_u64("CHART_HUB_BACKFILL_BACKOFF_MS", 500),
            backfill_window_delay_ms: env_u64("CHART_HUB_BACKFILL_WINDOW_DELAY_MS", 100),
            live_poll_ms: env_u64("CHART_HUB_LIVE_POLL_MS", 1000),
        }
    }
}

/// keccak256("TradeSettled(address,uint256,uint256,uint256)")
const DEFAULT_SETTLE_TOPIC: &str =
    "0x6b8f4e2c1d0a9b57c3e8f2a46d915c07e3b8a1f49c26d05e7a14b3c8d92f60e1";
