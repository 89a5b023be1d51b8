//! Runtime settings as typed key/value pairs stored in the `settings` table.
//!
//! Every read goes to the database, so components always see the latest
//! committed value at decision time.

use chrono_tz::Tz;
use scriptguard_core::error::{Result, ScriptGuardError};
use scriptguard_core::types::ChannelKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::persistence::SchedulerDb;

/// Value of a setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SettingValue {
    fn to_stored(&self) -> String {
        match self {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Str(s) => s.trim().to_string(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_stored())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Int,
    Bool,
    Str,
}

impl SettingType {
    /// Coerce a value into this type (strings like "5" or "true" are accepted).
    fn coerce(self, key: &str, value: &SettingValue) -> Result<SettingValue> {
        let bad = || ScriptGuardError::validation(format!("{key}: expected {self:?}, got '{value}'"));
        match (self, value) {
            (SettingType::Int, SettingValue::Int(i)) => Ok(SettingValue::Int(*i)),
            (SettingType::Int, SettingValue::Str(s)) => {
                s.trim().parse().map(SettingValue::Int).map_err(|_| bad())
            }
            (SettingType::Bool, SettingValue::Bool(b)) => Ok(SettingValue::Bool(*b)),
            (SettingType::Bool, SettingValue::Str(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(SettingValue::Bool(true)),
                "false" | "0" | "no" => Ok(SettingValue::Bool(false)),
                _ => Err(bad()),
            },
            (SettingType::Str, v) => Ok(SettingValue::Str(v.to_stored())),
            _ => Err(bad()),
        }
    }
}

/// Settings the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    MaxConcurrency,
    TimeoutSeconds,
    LogRetentionDays,
    DingTalkWebhook,
    WeComWebhook,
    WebhookUrl,
    Timezone,
    NotifyIncludeOutput,
}

impl SettingKey {
    pub const ALL: [SettingKey; 8] = [
        SettingKey::MaxConcurrency,
        SettingKey::TimeoutSeconds,
        SettingKey::LogRetentionDays,
        SettingKey::DingTalkWebhook,
        SettingKey::WeComWebhook,
        SettingKey::WebhookUrl,
        SettingKey::Timezone,
        SettingKey::NotifyIncludeOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::MaxConcurrency => "max_concurrency",
            SettingKey::TimeoutSeconds => "timeout_seconds",
            SettingKey::LogRetentionDays => "log_retention_days",
            SettingKey::DingTalkWebhook => "dingtalk_webhook",
            SettingKey::WeComWebhook => "wecom_webhook",
            SettingKey::WebhookUrl => "webhook_url",
            SettingKey::Timezone => "timezone",
            SettingKey::NotifyIncludeOutput => "notify_include_output",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    /// Webhook URL setting for a channel.
    pub fn webhook_for(channel: ChannelKind) -> Self {
        match channel {
            ChannelKind::DingTalk => SettingKey::DingTalkWebhook,
            ChannelKind::WeCom => SettingKey::WeComWebhook,
            ChannelKind::Webhook => SettingKey::WebhookUrl,
        }
    }

    pub fn kind(&self) -> SettingType {
        match self {
            SettingKey::MaxConcurrency | SettingKey::TimeoutSeconds | SettingKey::LogRetentionDays => {
                SettingType::Int
            }
            SettingKey::NotifyIncludeOutput => SettingType::Bool,
            _ => SettingType::Str,
        }
    }

    pub fn default_value(&self) -> SettingValue {
        match self {
            SettingKey::MaxConcurrency => SettingValue::Int(5),
            SettingKey::TimeoutSeconds => SettingValue::Int(3600),
            SettingKey::LogRetentionDays => SettingValue::Int(30),
            SettingKey::Timezone => SettingValue::Str("UTC".into()),
            SettingKey::NotifyIncludeOutput => SettingValue::Bool(true),
            SettingKey::DingTalkWebhook | SettingKey::WeComWebhook | SettingKey::WebhookUrl => {
                SettingValue::Str(String::new())
            }
        }
    }

    /// Range and format checks on an already-coerced value.
    fn validate(&self, value: &SettingValue) -> Result<()> {
        let key = self.as_str();
        match (self, value) {
            (SettingKey::MaxConcurrency, SettingValue::Int(n)) if !(1..=64).contains(n) => Err(
                ScriptGuardError::validation(format!("{key} must be within 1..=64")),
            ),
            (SettingKey::TimeoutSeconds, SettingValue::Int(n)) if !(0..=86_400).contains(n) => {
                Err(ScriptGuardError::validation(format!(
                    "{key} must be 0 (unlimited) or within 1..=86400 seconds"
                )))
            }
            (SettingKey::LogRetentionDays, SettingValue::Int(n)) if !(1..=3650).contains(n) => Err(
                ScriptGuardError::validation(format!("{key} must be within 1..=3650 days")),
            ),
            (SettingKey::Timezone, SettingValue::Str(s)) => crate::cron::parse_timezone(s).map(|_| ()),
            (
                SettingKey::DingTalkWebhook | SettingKey::WeComWebhook | SettingKey::WebhookUrl,
                SettingValue::Str(s),
            ) => validate_webhook_url(key, s),
            _ => Ok(()),
        }
    }
}

/// Empty (unset) or an absolute http(s) URL.
pub fn validate_webhook_url(key: &str, raw: &str) -> Result<()> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(());
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| ScriptGuardError::validation(format!("{key}: invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ScriptGuardError::validation(format!(
            "{key}: unsupported URL scheme '{other}'"
        ))),
    }
}

/// Config store handle. Cheap to clone.
#[derive(Clone)]
pub struct Settings {
    db: Arc<SchedulerDb>,
}

impl Settings {
    /// Wrap the database, seeding defaults for missing keys.
    pub fn new(db: Arc<SchedulerDb>) -> Result<Self> {
        let defaults: Vec<(&str, String)> = SettingKey::ALL
            .iter()
            .map(|k| (k.as_str(), k.default_value().to_stored()))
            .collect();
        db.seed_settings(&defaults)?;
        Ok(Self { db })
    }

    /// Read one setting. Unknown keys come back as strings.
    pub fn get(&self, key: &str) -> Result<SettingValue> {
        let stored = self.db.get_setting(key)?;
        match (SettingKey::from_key(key), stored) {
            (Some(known), Some(raw)) => Ok(decode(known, &raw)),
            (Some(known), None) => Ok(known.default_value()),
            (None, Some(raw)) => Ok(SettingValue::Str(raw)),
            (None, None) => Err(ScriptGuardError::not_found("Config key", key)),
        }
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, SettingValue>> {
        let mut all: BTreeMap<String, SettingValue> = SettingKey::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), k.default_value()))
            .collect();
        for (key, raw) in self.db.all_settings()? {
            let value = match SettingKey::from_key(&key) {
                Some(known) => decode(known, &raw),
                None => SettingValue::Str(raw),
            };
            all.insert(key, value);
        }
        Ok(all)
    }

    /// Validate and persist. Returns the stored (coerced) value.
    pub fn update(&self, key: &str, value: SettingValue) -> Result<SettingValue> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ScriptGuardError::validation("config key must not be empty"));
        }
        let value = match SettingKey::from_key(key) {
            Some(known) => {
                let coerced = known.kind().coerce(key, &value)?;
                known.validate(&coerced)?;
                coerced
            }
            None => SettingValue::Str(value.to_stored()),
        };
        self.db.put_setting(key, &value.to_stored())?;
        tracing::info!("⚙️ Config updated: {} = {}", key, redact(key, &value));
        Ok(value)
    }

    // ─── Typed accessors ──────────────────────────────────────

    pub fn max_concurrency(&self) -> usize {
        self.int_or_default(SettingKey::MaxConcurrency).clamp(1, 64) as usize
    }

    /// Global execution timeout; `None` means unlimited.
    pub fn timeout(&self) -> Option<Duration> {
        match self.int_or_default(SettingKey::TimeoutSeconds) {
            n if n <= 0 => None,
            n => Some(Duration::from_secs(n as u64)),
        }
    }

    pub fn log_retention_days(&self) -> i64 {
        self.int_or_default(SettingKey::LogRetentionDays).max(1)
    }

    /// Configured webhook for a channel, if set.
    pub fn webhook(&self, channel: ChannelKind) -> Option<String> {
        let key = SettingKey::webhook_for(channel);
        match self.get(key.as_str()) {
            Ok(SettingValue::Str(url)) if !url.trim().is_empty() => Some(url.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}", key.as_str());
                None
            }
        }
    }

    pub fn timezone(&self) -> Tz {
        match self.get(SettingKey::Timezone.as_str()) {
            Ok(SettingValue::Str(name)) => crate::cron::parse_timezone(&name).unwrap_or_else(|e| {
                tracing::warn!("⚠️ {e}; falling back to UTC");
                Tz::UTC
            }),
            _ => Tz::UTC,
        }
    }

    pub fn notify_include_output(&self) -> bool {
        matches!(
            self.get(SettingKey::NotifyIncludeOutput.as_str()),
            Ok(SettingValue::Bool(true))
        )
    }

    fn int_or_default(&self, key: SettingKey) -> i64 {
        let fallback = key.default_value().as_int().unwrap_or_default();
        match self.get(key.as_str()) {
            Ok(SettingValue::Int(n)) => n,
            Ok(other) => {
                tracing::warn!("⚠️ {} holds '{}', using default {}", key.as_str(), other, fallback);
                fallback
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}; using default {}", key.as_str(), fallback);
                fallback
            }
        }
    }
}

/// Decode stored text for a known key; undecodable values stay as strings.
fn decode(key: SettingKey, raw: &str) -> SettingValue {
    key.kind()
        .coerce(key.as_str(), &SettingValue::Str(raw.to_string()))
        .unwrap_or_else(|_| SettingValue::Str(raw.to_string()))
}

/// Webhook URLs often carry access tokens; keep them out of logs.
fn redact(key: &str, value: &SettingValue) -> String {
    if key.ends_with("webhook") || key.ends_with("url") {
        match value.as_str() {
            Some(s) if s.len() > 12 => format!("{}••••", &s[..12]),
            Some(_) => "••••".to_string(),
            None => value.to_string(),
        }
    } else {
        value.to_string()
    }
}
