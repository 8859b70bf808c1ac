use std::path::{Path, PathBuf};

use mailwatch_core::{AccountIdentity, NULL_BACKEND_NAME, NullAccountSpec, ProxyConfig};
use tracing::warn;

pub(crate) const DEFAULT_INTERVAL_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchConfig {
    pub(crate) interval_minutes: u32,
    pub(crate) log_level: Option<String>,
    pub(crate) accounts: Vec<AccountIdentity>,
    pub(crate) null_accounts: Vec<NullAccountSpec>,
    pub(crate) load_error: Option<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            log_level: None,
            accounts: Vec::new(),
            null_accounts: Vec::new(),
            load_error: None,
        }
    }
}

impl WatchConfig {
    /// Accounts to sign in at start. Without `[[accounts]]` every scripted
    /// null account is watched.
    pub(crate) fn watched_accounts(&self) -> Vec<AccountIdentity> {
        if !self.accounts.is_empty() {
            return self.accounts.clone();
        }
        self.null_accounts
            .iter()
            .map(|spec| AccountIdentity {
                email: spec.email.clone(),
                backend: NULL_BACKEND_NAME.to_string(),
                proxy: None,
            })
            .collect()
    }
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailwatch.toml"),
        xdg_config_dir().join("mailwatch").join("mailwatch.toml"),
    ]
}

fn load_config_text(explicit: Option<&Path>) -> Result<Option<String>, String> {
    if let Some(path) = explicit {
        return std::fs::read_to_string(path)
            .map(Some)
            .map_err(|err| format!("{}: {}", path.display(), err));
    }
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Ok(Some(content));
        }
    }
    Ok(None)
}

pub(crate) fn load_watch_config(explicit: Option<&Path>) -> WatchConfig {
    match load_config_text(explicit) {
        Ok(Some(content)) => parse_watch_config(&content),
        Ok(None) => WatchConfig::default(),
        Err(err) => WatchConfig {
            load_error: Some(err),
            ..WatchConfig::default()
        },
    }
}

pub(crate) fn parse_watch_config(content: &str) -> WatchConfig {
    let value: toml::Value = match toml::from_str(content) {
        Ok(value) => value,
        Err(err) => {
            return WatchConfig {
                load_error: Some(err.to_string()),
                ..WatchConfig::default()
            };
        }
    };
    let interval_minutes = value
        .get("poll")
        .and_then(|poll| poll.get("interval_minutes"))
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_INTERVAL_MINUTES);
    let log_level = value
        .get("log")
        .and_then(|log| log.get("level"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let accounts = value
        .get("accounts")
        .and_then(|v| v.as_array())
        .map(|accounts| {
            accounts
                .iter()
                .enumerate()
                .filter_map(|(idx, acct)| parse_account(acct, idx))
                .collect()
        })
        .unwrap_or_default();
    let null_accounts = value
        .get("null_accounts")
        .and_then(|v| v.as_array())
        .map(|specs| {
            specs
                .iter()
                .enumerate()
                .filter_map(|(idx, spec)| match spec.clone().try_into::<NullAccountSpec>() {
                    Ok(spec) => Some(spec),
                    Err(err) => {
                        warn!(index = idx, %err, "skipping invalid null account");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    WatchConfig {
        interval_minutes,
        log_level,
        accounts,
        null_accounts,
        load_error: None,
    }
}

fn parse_account(value: &toml::Value, idx: usize) -> Option<AccountIdentity> {
    let email = value
        .get("email")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let backend = value
        .get("backend")
        .and_then(|v| v.as_str())
        .unwrap_or(NULL_BACKEND_NAME)
        .to_string();
    let proxy = match value.get("proxy") {
        Some(proxy) => match proxy.clone().try_into::<ProxyConfig>() {
            Ok(proxy) => match proxy.validate() {
                Ok(()) => Some(proxy),
                Err(err) => {
                    warn!(index = idx, email, %err, "skipping account with invalid proxy");
                    return None;
                }
            },
            Err(err) => {
                warn!(index = idx, email, %err, "skipping account with unreadable proxy");
                return None;
            }
        },
        None => None,
    };
    Some(AccountIdentity {
        email: email.to_string(),
        backend,
        proxy,
    })
}
