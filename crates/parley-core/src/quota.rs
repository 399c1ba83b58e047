//! Per-user, per-source entitlements and the gate that checks them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;
use crate::error::Result;
use crate::models::Source;
use crate::stats::UsageStats;
use crate::store::{QuotaStore, RecordStore};

/// A remaining count where `-1` means unlimited and `0` means exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub struct Allowance(i64);

impl Allowance {
    pub const UNLIMITED: Allowance = Allowance(-1);

    pub fn new(count: i64) -> Self {
        Allowance(count.max(-1))
    }

    pub fn is_unlimited(self) -> bool {
        self.0 == -1
    }

    pub fn is_exhausted(self) -> bool {
        self.0 == 0
    }

    pub fn remaining(self) -> Option<i64> {
        (!self.is_unlimited()).then_some(self.0)
    }

    pub fn decremented(self) -> Self {
        if self.is_unlimited() {
            self
        } else {
            Allowance((self.0 - 1).max(0))
        }
    }
}

impl From<i64> for Allowance {
    fn from(count: i64) -> Self {
        Allowance::new(count)
    }
}

impl From<Allowance> for i64 {
    fn from(allowance: Allowance) -> Self {
        allowance.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub window_seconds: u64,
    pub max_requests: u64,
}

/// A time-of-day range, evaluated in UTC. A slot whose end is before its
/// start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTimeSlot {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl DailyTimeSlot {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start_time <= self.end_time {
            self.start_time <= time && time <= self.end_time
        } else {
            time >= self.start_time || time <= self.end_time
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaState {
    pub allow_to_use: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub max_conv_count: Allowance,
    pub total_ask_count: Allowance,
    /// Models missing from this map are unlimited.
    pub per_model_ask_count: BTreeMap<String, Allowance>,
    /// Empty means every model of the source.
    pub available_models: Vec<String>,
    pub rate_limits: Vec<RateLimit>,
    /// Empty means no time-of-day restriction.
    pub daily_available_time_slots: Vec<DailyTimeSlot>,
}

impl Default for QuotaState {
    fn default() -> Self {
        Self {
            allow_to_use: true,
            valid_until: None,
            max_conv_count: Allowance::UNLIMITED,
            total_ask_count: Allowance::UNLIMITED,
            per_model_ask_count: BTreeMap::new(),
            available_models: Vec::new(),
            rate_limits: Vec::new(),
            daily_available_time_slots: Vec::new(),
        }
    }
}

impl QuotaState {
    /// A state that allows nothing, for users with no quota on record.
    pub fn disabled() -> Self {
        Self {
            allow_to_use: false,
            ..Self::default()
        }
    }

    /// The checks that need nothing beyond the state itself, in order.
    pub fn static_denial(&self, model: &str, now: DateTime<Utc>) -> Option<DenyReason> {
        if !self.allow_to_use {
            return Some(DenyReason::SourceDisabled);
        }
        if self.valid_until.is_some_and(|until| until < now) {
            return Some(DenyReason::Expired);
        }
        let time = now.time();
        if !self.daily_available_time_slots.is_empty()
            && !self
                .daily_available_time_slots
                .iter()
                .any(|slot| slot.contains(time))
        {
            return Some(DenyReason::OutsideTimeSlot);
        }
        if !self.available_models.is_empty() && !self.available_models.iter().any(|m| m == model)
        {
            return Some(DenyReason::ModelNotAllowed);
        }
        if self.total_ask_count.is_exhausted() {
            return Some(DenyReason::NoAskCount);
        }
        if self
            .per_model_ask_count
            .get(model)
            .is_some_and(|count| count.is_exhausted())
        {
            return Some(DenyReason::NoModelAskCount);
        }
        None
    }

    /// Account for one successful ask.
    pub fn consume(&mut self, model: &str) {
        self.total_ask_count = self.total_ask_count.decremented();
        if let Some(count) = self.per_model_ask_count.get_mut(model) {
            *count = count.decremented();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("this source is not enabled for the user")]
    SourceDisabled,
    #[error("the user's access has expired")]
    Expired,
    #[error("outside of the available time slots")]
    OutsideTimeSlot,
    #[error("model is not available to the user")]
    ModelNotAllowed,
    #[error("no asks left")]
    NoAskCount,
    #[error("no asks left for this model")]
    NoModelAskCount,
    #[error("conversation limit reached")]
    MaxConversations,
    #[error("too many asks in a short time")]
    RateLimited,
}

impl DenyReason {
    pub fn tip(self) -> &'static str {
        match self {
            DenyReason::SourceDisabled => "errors.sourceDisabled",
            DenyReason::Expired => "errors.quotaExpired",
            DenyReason::OutsideTimeSlot => "errors.outsideTimeSlot",
            DenyReason::ModelNotAllowed => "errors.modelNotAllowed",
            DenyReason::NoAskCount => "errors.noAskCount",
            DenyReason::NoModelAskCount => "errors.noModelAskCount",
            DenyReason::MaxConversations => "errors.maxConversations",
            DenyReason::RateLimited => "errors.rateLimited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny(DenyReason),
}

/// Evaluates a user's entitlement before an ask is admitted.
pub struct QuotaGate {
    quotas: Arc<dyn QuotaStore>,
    records: Arc<dyn RecordStore>,
    stats: Arc<UsageStats>,
    defaults: HashMap<Source, QuotaState>,
}

impl QuotaGate {
    pub fn new(
        quotas: Arc<dyn QuotaStore>,
        records: Arc<dyn RecordStore>,
        stats: Arc<UsageStats>,
    ) -> Self {
        Self {
            quotas,
            records,
            stats,
            defaults: HashMap::new(),
        }
    }

    /// Quota applied to users that have none stored for `source`.
    pub fn set_default(&mut self, source: Source, quota: QuotaState) {
        self.defaults.insert(source, quota);
    }

    pub async fn quota_for(&self, user: UserId, source: Source) -> Result<QuotaState> {
        Ok(match self.quotas.get_user_quota(user, source).await? {
            Some(quota) => quota,
            None => self
                .defaults
                .get(&source)
                .cloned()
                .unwrap_or_else(QuotaState::disabled),
        })
    }

    /// Run every check in order; the first failing one decides.
    pub async fn check(
        &self,
        user: UserId,
        source: Source,
        model: &str,
        new_conversation: bool,
    ) -> Result<Decision> {
        let now = Utc::now();
        let quota = self.quota_for(user, source).await?;

        if let Some(reason) = quota.static_denial(model, now) {
            return Ok(Decision::Deny(reason));
        }

        if new_conversation && let Some(max) = quota.max_conv_count.remaining() {
            let open = self.records.count_valid(user, source).await?;
            if open >= max.max(0) as u64 {
                return Ok(Decision::Deny(DenyReason::MaxConversations));
            }
        }

        for limit in &quota.rate_limits {
            let recent = self.stats.log().count_recent(
                user,
                source,
                Duration::from_secs(limit.window_seconds),
                now,
            );
            if recent as u64 >= limit.max_requests {
                return Ok(Decision::Deny(DenyReason::RateLimited));
            }
        }

        Ok(Decision::Admit)
    }

    pub async fn decrement(&self, user: UserId, source: Source, model: &str) -> Result<()> {
        if self.quotas.get_user_quota(user, source).await?.is_none() {
            // Defaults are not stored per user, so there is nothing to count down.
            return Ok(());
        }
        self.quotas.decrement_quota(user, source, model).await
    }
}
