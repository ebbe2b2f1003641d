//! Daily entry budget and setup dedup, counted in a configured timezone.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use riskgate_core::config::{ConfigError, EntryGateConfig};
use riskgate_core::{JsonStore, PersistenceError, SetupFingerprint};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateDenial {
    #[error("daily_limit")]
    DailyLimit,

    #[error("too_soon")]
    TooSoon,

    #[error("outside_hours")]
    OutsideHours,

    /// Same symbol and same fingerprint as the previous entry.
    #[error("duplicate_setup")]
    DuplicateSetup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryGateRecord {
    pub day: NaiveDate,
    pub trades_today: u32,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub last_symbol: Option<String>,
    pub last_fingerprint: Option<SetupFingerprint>,
}

impl EntryGateRecord {
    #[must_use]
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            trades_today: 0,
            last_entry_at: None,
            last_symbol: None,
            last_fingerprint: None,
        }
    }
}

pub struct EntryGate {
    config: EntryGateConfig,
    tz: Tz,
    record: EntryGateRecord,
    store: Option<JsonStore<EntryGateRecord>>,
}

impl EntryGate {
    /// Builds the gate, restoring today's record from `store` if present.
    ///
    /// # Errors
    /// Returns [`ConfigError::Timezone`] for an unknown timezone name.
    pub fn new(
        config: EntryGateConfig,
        store: Option<JsonStore<EntryGateRecord>>,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let tz = config.tz()?;
        let today = now.with_timezone(&tz).date_naive();
        let record = store
            .as_ref()
            .and_then(JsonStore::load)
            .filter(|r| r.day == today)
            .unwrap_or_else(|| EntryGateRecord::empty(today));
        info!(
            timezone = %tz,
            day = %record.day,
            trades_today = record.trades_today,
            "Entry gate ready"
        );
        Ok(Self {
            config,
            tz,
            record,
            store,
        })
    }

    #[must_use]
    pub fn record(&self) -> &EntryGateRecord {
        &self.record
    }

    /// Calendar day of `now` in the gate's timezone.
    #[must_use]
    pub fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    fn rollover(&mut self, now: DateTime<Utc>) {
        let today = self.local_day(now);
        if today != self.record.day {
            info!(from = %self.record.day, to = %today, "Entry gate day rollover");
            self.record = EntryGateRecord::empty(today);
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.record) {
                warn!(error = %e, path = %store.path().display(), "Failed to save entry gate record");
            }
        }
    }

    /// # Errors
    /// Returns the first [`GateDenial`] that applies.
    pub fn check(
        &mut self,
        symbol: &str,
        fingerprint: &SetupFingerprint,
        now: DateTime<Utc>,
    ) -> Result<(), GateDenial> {
        if !self.config.enabled {
            return Ok(());
        }
        self.rollover(now);

        if let Some(window) = self.config.allow_hours {
            if !window.contains(now.with_timezone(&self.tz).hour()) {
                return Err(GateDenial::OutsideHours);
            }
        }

        if self.record.trades_today >= self.config.max_trades_per_day {
            return Err(GateDenial::DailyLimit);
        }

        if let Some(last) = self.record.last_entry_at {
            if (now - last).num_minutes() < self.config.min_minutes_between {
                return Err(GateDenial::TooSoon);
            }
        }

        if self.config.require_new_setup
            && self.record.last_symbol.as_deref() == Some(symbol)
            && self.record.last_fingerprint.as_ref() == Some(fingerprint)
        {
            return Err(GateDenial::DuplicateSetup);
        }

        Ok(())
    }

    /// Books an accepted entry and persists the record.
    ///
    /// # Errors
    /// Returns the persistence error; the in-memory record is updated anyway.
    pub fn record_entry(
        &mut self,
        symbol: &str,
        fingerprint: &SetupFingerprint,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.rollover(now);
        self.record.trades_today += 1;
        self.record.last_entry_at = Some(now);
        self.record.last_symbol = Some(symbol.to_string());
        self.record.last_fingerprint = Some(fingerprint.clone());
        info!(
            symbol = %symbol,
            setup = %fingerprint,
            trades_today = self.record.trades_today,
            max = self.config.max_trades_per_day,
            "Entry accepted by gate"
        );
        match &self.store {
            Some(store) => store.save(&self.record),
            None => Ok(()),
        }
    }
}
