//! Command parsing for BDV sessions
//!
//! Raw commands arrive as JSON `{"method": ..., "ids": [...], "args": [...]}`.
//! Registry-level methods are handled by the registry; everything else is
//! parsed into the closed [`Command`] enum and dispatched by the session.

use crate::error::ViewError;
use crate::types::ScrAddr;
use serde::Deserialize;
use serde_json::Value;

/// Ledger entries returned per history page
pub const HISTORY_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RawCommand {
    pub method: String,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RawCommand {
    pub fn parse(raw: &str) -> Result<Self, ViewError> {
        serde_json::from_str(raw)
            .map_err(|e| ViewError::Protocol(format!("malformed command: {}", e)))
    }
}

/// Methods handled by the registry itself rather than by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMethod {
    RegisterBdv,
    UnregisterBdv,
    Shutdown,
    GetBdvIds,
    RegisterCallback,
}

impl MetaMethod {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "registerBDV" => Some(MetaMethod::RegisterBdv),
            "unregisterBDV" => Some(MetaMethod::UnregisterBdv),
            "shutdown" => Some(MetaMethod::Shutdown),
            "getBDVIds" => Some(MetaMethod::GetBdvIds),
            "registerCallback" => Some(MetaMethod::RegisterCallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegisterWallet {
        wallet_id: String,
        addresses: Vec<ScrAddr>,
        is_new: bool,
    },
    RegisterLockbox {
        wallet_id: String,
        addresses: Vec<ScrAddr>,
        is_new: bool,
    },
    GetBalance { wallet_id: String },
    GetBalancesAndCount { wallet_id: String },
    GetAddressBalances { wallet_id: String },
    GetRegisteredAddresses { wallet_id: String },
    GetWalletIds,
    GetLedgerDelegateForWallets,
    GetLedgerDelegateForLockboxes,
    GetLedgerDelegateForScrAddr { wallet_id: String, scr_addr: ScrAddr },
    GetHistoryPage { delegate_id: String, page: usize },
    GetPageCount { delegate_id: String },
    GetTopBlockHeight,
    GetStatus,
}

impl Command {
    /// `ids` are the session-local identifiers (wallet or delegate ids); the
    /// BDV id has already been stripped by the registry.
    pub fn parse(method: &str, ids: &[String], args: &[Value]) -> Result<Self, ViewError> {
        let command = match method {
            "registerWallet" => Command::RegisterWallet {
                wallet_id: id_at(ids, 0, "wallet id")?,
                addresses: addresses_at(args, 0)?,
                is_new: bool_at(args, 1)?,
            },
            "registerLockbox" => Command::RegisterLockbox {
                wallet_id: id_at(ids, 0, "lockbox id")?,
                addresses: addresses_at(args, 0)?,
                is_new: bool_at(args, 1)?,
            },
            "getBalance" => Command::GetBalance {
                wallet_id: id_at(ids, 0, "wallet id")?,
            },
            "getBalancesAndCount" => Command::GetBalancesAndCount {
                wallet_id: id_at(ids, 0, "wallet id")?,
            },
            "getAddressBalances" => Command::GetAddressBalances {
                wallet_id: id_at(ids, 0, "wallet id")?,
            },
            "getRegisteredAddresses" => Command::GetRegisteredAddresses {
                wallet_id: id_at(ids, 0, "wallet id")?,
            },
            "getWalletIds" => Command::GetWalletIds,
            "getLedgerDelegateForWallets" => Command::GetLedgerDelegateForWallets,
            "getLedgerDelegateForLockboxes" => Command::GetLedgerDelegateForLockboxes,
            "getLedgerDelegateForScrAddr" => Command::GetLedgerDelegateForScrAddr {
                wallet_id: id_at(ids, 0, "wallet id")?,
                scr_addr: args
                    .first()
                    .and_then(Value::as_str)
                    .map(ScrAddr::from)
                    .ok_or_else(|| ViewError::Protocol("expected address argument".to_string()))?,
            },
            "getHistoryPage" => Command::GetHistoryPage {
                delegate_id: id_at(ids, 0, "delegate id")?,
                page: args
                    .first()
                    .and_then(Value::as_u64)
                    .and_then(|page| usize::try_from(page).ok())
                    .ok_or_else(|| ViewError::Protocol("expected page number".to_string()))?,
            },
            "getPageCount" => Command::GetPageCount {
                delegate_id: id_at(ids, 0, "delegate id")?,
            },
            "getTopBlockHeight" => Command::GetTopBlockHeight,
            "getStatus" => Command::GetStatus,
            other => return Err(ViewError::UnknownMethod(other.to_string())),
        };
        Ok(command)
    }

    /// Registration and status commands run before the initial scan completes;
    /// everything else waits on the readiness gate.
    pub fn requires_ready(&self) -> bool {
        !matches!(
            self,
            Command::RegisterWallet { .. } | Command::RegisterLockbox { .. } | Command::GetStatus
        )
    }
}

fn id_at(ids: &[String], index: usize, what: &str) -> Result<String, ViewError> {
    ids.get(index)
        .filter(|id| !id.is_empty())
        .cloned()
        .ok_or_else(|| ViewError::Protocol(format!("missing {}", what)))
}

fn addresses_at(args: &[Value], index: usize) -> Result<Vec<ScrAddr>, ViewError> {
    let list = args
        .get(index)
        .and_then(Value::as_array)
        .ok_or_else(|| ViewError::Protocol("expected address list".to_string()))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(ScrAddr::from)
                .ok_or_else(|| ViewError::Protocol("addresses must be strings".to_string()))
        })
        .collect()
}

fn bool_at(args: &[Value], index: usize) -> Result<bool, ViewError> {
    match args.get(index) {
        None => Ok(false),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ViewError::Protocol("expected boolean flag".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_raw_command() {
        let raw = RawCommand::parse(r#"{"method":"getBalance","ids":["bdv","w1"]}"#).unwrap();
        assert_eq!(raw.method, "getBalance");
        assert_eq!(raw.ids, vec!["bdv".to_string(), "w1".to_string()]);
        assert!(raw.args.is_empty());
    }

    #[test]
    fn test_malformed_raw_command() {
        assert!(matches!(
            RawCommand::parse("not json"),
            Err(ViewError::Protocol(_))
        ));
    }

    #[test]
    fn test_register_wallet_args() {
        let cmd = Command::parse(
            "registerWallet",
            &["w1".to_string()],
            &[json!(["a1", "a2"]), json!(true)],
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::RegisterWallet {
                wallet_id: "w1".to_string(),
                addresses: vec![ScrAddr::from("a1"), ScrAddr::from("a2")],
                is_new: true,
            }
        );
        assert!(!cmd.requires_ready());
    }

    #[test]
    fn test_unknown_method() {
        assert_eq!(
            Command::parse("mineBlock", &[], &[]),
            Err(ViewError::UnknownMethod("mineBlock".to_string()))
        );
    }

    #[test]
    fn test_missing_wallet_id() {
        assert!(matches!(
            Command::parse("getBalance", &[], &[]),
            Err(ViewError::Protocol(_))
        ));
    }

    #[test]
    fn test_meta_methods() {
        assert_eq!(MetaMethod::from_method("registerBDV"), Some(MetaMethod::RegisterBdv));
        assert_eq!(MetaMethod::from_method("getBalance"), None);
    }
}
