//! Synchronizer / aggregator configuration

use alloy_primitives::U256;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Everything the sync core needs from the deployment. Passed explicitly into
/// the synchronizer and aggregator constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tracked symbols, in display order
    pub symbols: Vec<String>,

    /// Fixed period between anchors
    #[serde(with = "duration_serde")]
    pub anchor_interval: Duration,

    /// Betting window measured from the anchor
    #[serde(with = "duration_serde")]
    pub betting_window: Duration,

    /// Number of anchors the history aggregator walks back
    pub history_window: usize,

    /// Max (slot, bet) pairs fetched at once during a history load
    pub history_concurrency: usize,

    /// Poll cadence while no transition is due
    #[serde(with = "duration_serde")]
    pub baseline_cadence: Duration,

    /// Poll cadence once the next anchor is overdue
    #[serde(with = "duration_serde")]
    pub elevated_cadence: Duration,

    /// Non-forced history loads inside this window are no-ops
    #[serde(with = "duration_serde")]
    pub history_cooldown: Duration,

    /// Periodic non-forced history load
    #[serde(with = "duration_serde")]
    pub history_refresh: Duration,

    /// Upper bound on any single remote read
    #[serde(with = "duration_serde")]
    pub rpc_timeout: Duration,

    /// Delay between a delegated write and the follow-up resync
    #[serde(with = "duration_serde")]
    pub post_action_resync_delay: Duration,

    #[serde(with = "duration_serde")]
    pub balance_poll: Duration,

    #[serde(with = "duration_serde")]
    pub timer_tick: Duration,

    /// Contract log polling interval
    #[serde(with = "duration_serde")]
    pub event_poll: Duration,

    /// How long a slot may sit in `ready` before it is flagged overdue
    #[serde(with = "duration_serde")]
    pub settlement_overdue_after: Duration,

    /// Smallest accepted deposit, in wei
    pub min_deposit_wei: U256,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC".into(), "ETH".into()],
            anchor_interval: Duration::from_secs(180),
            betting_window: Duration::from_secs(120),
            history_window: 100,
            history_concurrency: 200,
            baseline_cadence: Duration::from_secs(5),
            elevated_cadence: Duration::from_secs(2),
            history_cooldown: Duration::from_secs(10),
            history_refresh: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(10),
            post_action_resync_delay: Duration::from_secs(3),
            balance_poll: Duration::from_secs(5),
            timer_tick: Duration::from_secs(1),
            event_poll: Duration::from_secs(4),
            settlement_overdue_after: Duration::from_secs(120),
            min_deposit_wei: U256::from(500_000_000_000_000u64), // 0.0005 ETH
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file (or defaults), apply `SLOTBET_*` overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                info!("Loading sync config from {}", p.display());
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config {}", p.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLOTBET_SYMBOLS") {
            let symbols: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(secs) = env_u64("SLOTBET_ANCHOR_INTERVAL_SECS") {
            self.anchor_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SLOTBET_BETTING_WINDOW_SECS") {
            self.betting_window = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("SLOTBET_HISTORY_WINDOW") {
            self.history_window = n as usize;
        }
        if let Some(ms) = env_u64("SLOTBET_BASELINE_CADENCE_MS") {
            self.baseline_cadence = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SLOTBET_ELEVATED_CADENCE_MS") {
            self.elevated_cadence = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SLOTBET_HISTORY_COOLDOWN_MS") {
            self.history_cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("SLOTBET_RPC_TIMEOUT_MS") {
            self.rpc_timeout = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("symbols must not be empty");
        }
        if self.anchor_interval.as_secs() == 0 {
            bail!("anchor_interval must be at least one second");
        }
        if self.betting_window > self.anchor_interval {
            bail!(
                "betting_window ({}s) exceeds anchor_interval ({}s)",
                self.betting_window.as_secs(),
                self.anchor_interval.as_secs()
            );
        }
        if self.history_window == 0 {
            bail!("history_window must be positive");
        }
        if self.history_concurrency == 0 {
            bail!("history_concurrency must be positive");
        }
        for (name, d) in [
            ("baseline_cadence", self.baseline_cadence),
            ("elevated_cadence", self.elevated_cadence),
            ("rpc_timeout", self.rpc_timeout),
            ("timer_tick", self.timer_tick),
            ("balance_poll", self.balance_poll),
            ("event_poll", self.event_poll),
            ("history_refresh", self.history_refresh),
        ] {
            if d.is_zero() {
                bail!("{} must be non-zero", name);
            }
        }
        Ok(())
    }

    pub fn anchor_interval_secs(&self) -> i64 {
        self.anchor_interval.as_secs() as i64
    }

    pub fn betting_window_secs(&self) -> i64 {
        self.betting_window.as_secs() as i64
    }

    pub fn settlement_overdue_secs(&self) -> i64 {
        self.settlement_overdue_after.as_secs() as i64
    }

    /// Position of `symbol` in the configured order; unknown symbols sort last.
    pub fn symbol_rank(&self, symbol: &str) -> usize {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .unwrap_or(self.symbols.len())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

// Serde helper for Duration (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let c = SyncConfig::default();
        assert_eq!(c.symbols, vec!["BTC".to_string(), "ETH".to_string()]);
        assert_eq!(c.anchor_interval_secs(), 180);
        assert_eq!(c.betting_window_secs(), 120);
        assert_eq!(c.history_window, 100);
        assert_eq!(c.history_cooldown, Duration::from_secs(10));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "symbols = [\"BTC\"]\nanchor_interval = 60000\nbetting_window = 30000\nhistory_window = 5"
        )
        .unwrap();

        let c = SyncConfig::load(Some(file.path())).unwrap();
        assert_eq!(c.symbols, vec!["BTC".to_string()]);
        assert_eq!(c.anchor_interval, Duration::from_secs(60));
        assert_eq!(c.betting_window, Duration::from_secs(30));
        assert_eq!(c.history_window, 5);
        // untouched fields keep defaults
        assert_eq!(c.elevated_cadence, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = SyncConfig::default();
        c.symbols.clear();
        assert!(c.validate().is_err());

        let mut c = SyncConfig::default();
        c.betting_window = Duration::from_secs(500);
        assert!(c.validate().is_err());

        let mut c = SyncConfig::default();
        c.elevated_cadence = Duration::ZERO;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_symbol_rank() {
        let c = SyncConfig::default();
        assert_eq!(c.symbol_rank("BTC"), 0);
        assert_eq!(c.symbol_rank("ETH"), 1);
        assert_eq!(c.symbol_rank("DOGE"), 2);
    }
}
