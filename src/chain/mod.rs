pub mod rpc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::db::bars::BarKind;

/// Errors from the chain collaborators.  Rate limiting is its own variant so
/// the backfill retry loop can target it specifically.
#[derive(Debug)]
pub enum ChainError {
    RateLimited,
    Upstream(String),
    Decode(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Upstream(msg) => write!(f, "upstream: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
        }
    }
}

impl std::error::Error for ChainError {}

/// One raw settlement log entry, undecoded.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub block: u64,
    /// ABI-encoded event payload, `0x`-prefixed hex.
    pub data: String,
}

/// A decoded settlement sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub timestamp_s: i64,
    pub price_usd: Decimal,
    pub mcap_usd: Decimal,
}

impl Settlement {
    pub fn value(&self, kind: BarKind) -> Decimal {
        match kind {
            BarKind::Price => self.price_usd,
            BarKind::Mcap => self.mcap_usd,
        }
    }
}

/// Block-ordered settlement log reader for one launch.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head_block(&self) -> Result<u64, ChainError>;
    /// Ordered settlement logs for the launch in `[from_block, to_block]`.
    async fn logs(
        &self,
        series_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainError>;
}

/// Point-read of the current live value for one launch.
#[async_trait]
pub trait LiveSource: Send + Sync {
    async fn current(&self, series_id: &str, kind: BarKind) -> Result<Decimal, ChainError>;
}

const WORD_HEX: usize = 64;

pub(crate) fn word_u128(bytes: &[u8]) -> Result<u128, ChainError> {
    if bytes[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("value exceeds u128".into()));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[16..32]);
    Ok(u128::from_be_bytes(buf))
}

fn word_decimal(bytes: &[u8]) -> Result<Decimal, ChainError> {
    let raw = word_u128(bytes)?;
    let raw = i128::try_from(raw).map_err(|_| ChainError::Decode("value exceeds i128".into()))?;
    Ok(Decimal::from_i128_with_scale(raw, 18).normalize())
}

/// Decode a settlement event payload: three 32-byte words —
/// block timestamp (seconds), price and market cap (both 1e18-scaled USD).
pub fn decode_settlement(data: &str) -> Result<Settlement, ChainError> {
    let hex_str = data.strip_prefix("0x").unwrap_or(data);
    if hex_str.len() != 3 * WORD_HEX {
        return Err(ChainError::Decode(format!(
            "expected 3 words, got {} hex chars",
            hex_str.len()
        )));
    }
    let bytes = hex::decode(hex_str).map_err(|e| ChainError::Decode(e.to_string()))?;

    let ts = word_u128(&bytes[0..32])?;
    let timestamp_s =
        i64::try_from(ts).map_err(|_| ChainError::Decode("timestamp out of range".into()))?;
    Ok(Settlement {
        timestamp_s,
        price_usd: word_decimal(&bytes[32..64])?,
        mcap_usd: word_decimal(&bytes[64..96])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn word(v: u128) -> String {
        format!("{v:064x}")
    }

    #[test]
    fn decodes_three_word_payload() {
        // ts = 120s, price = 1.5 USD, mcap = 3000 USD.
        let data = format!(
            "0x{}{}{}",
            word(120),
            word(1_500_000_000_000_000_000),
            word(3_000_000_000_000_000_000_000)
        );
        let s = decode_settlement(&data).unwrap();
        assert_eq!(s.timestamp_s, 120);
        assert_eq!(s.price_usd, Decimal::from_str("1.5").unwrap());
        assert_eq!(s.mcap_usd, Decimal::from(3000));
        assert_eq!(s.value(BarKind::Price), s.price_usd);
        assert_eq!(s.value(BarKind::Mcap), s.mcap_usd);
    }

    #[test]
    fn rejects_short_payload() {
        assert!(matches!(
            decode_settlement("0xdeadbeef"),
            Err(ChainError::Decode(_))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        let data = format!("0x{}{}{}", word(1), word(1), "zz".repeat(32));
        assert!(matches!(decode_settlement(&data), Err(ChainError::Decode(_))));
    }
}
