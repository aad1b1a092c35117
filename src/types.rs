//! Address, transaction and ledger types shared by the store and the sessions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Script address as handed over by the client (hex or any opaque encoding).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrAddr(String);

impl ScrAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScrAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScrAddr {
    fn from(raw: &str) -> Self {
        ScrAddr(raw.to_string())
    }
}

/// Hex-encoded transaction hash
pub type TxHash = String;

/// Wallets are single-signer address sets, lockboxes multi-signer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WalletType {
    Wallet,
    Lockbox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub scr_addr: ScrAddr,
    pub value: u64,
}

/// An unconfirmed transaction as seen by the mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZcTx {
    pub hash: TxHash,
    pub outputs: Vec<TxOut>,
}

impl ZcTx {
    /// Sum of the outputs paying any of the given addresses.
    pub fn value_to(&self, mut is_ours: impl FnMut(&ScrAddr) -> bool) -> u64 {
        self.outputs
            .iter()
            .filter(|out| is_ours(&out.scr_addr))
            .map(|out| out.value)
            .fold(0, u64::saturating_add)
    }
}

/// One line of a wallet's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub tx_hash: TxHash,
    pub value: i64,
    /// None while the transaction is only in the mempool
    pub height: Option<u32>,
    pub is_zero_conf: bool,
    pub timestamp: i64,
}

impl LedgerEntry {
    pub fn confirmed(tx_hash: TxHash, value: u64, height: u32, timestamp: i64) -> Self {
        Self {
            tx_hash,
            value: signed_value(value),
            height: Some(height),
            is_zero_conf: false,
            timestamp,
        }
    }

    pub fn zero_conf(tx_hash: TxHash, value: u64) -> Self {
        Self {
            tx_hash,
            value: signed_value(value),
            height: None,
            is_zero_conf: true,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Ledger values are signed; amounts past `i64::MAX` saturate.
pub fn signed_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_value_saturates() {
        assert_eq!(signed_value(1500), 1500);
        assert_eq!(signed_value(u64::MAX), i64::MAX);

        let entry = LedgerEntry::zero_conf("ab".to_string(), u64::MAX);
        assert_eq!(entry.value, i64::MAX);
        assert!(entry.is_zero_conf);
    }
}
