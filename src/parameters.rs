use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::FixedOffset;

use crate::types::NameValueParameter;

pub(crate) const CLIENT_STAGE_ARRAY_BINDING_THRESHOLD: &str = "client_stage_array_binding_threshold";
pub(crate) const SERVICE_NAME: &str = "service_name";
pub(crate) const QUERY_CONTEXT_CACHE_SIZE: &str = "query_context_cache_size";
pub(crate) const HEARTBEAT_FREQUENCY: &str = "client_session_keep_alive_heartbeat_frequency";
pub(crate) const TIMEZONE: &str = "timezone";
pub(crate) const MULTI_STATEMENT_COUNT: &str = "MULTI_STATEMENT_COUNT";
pub(crate) const CLIENT_TELEMETRY_ENABLED: &str = "client_telemetry_enabled";

const DEFAULT_QUERY_CONTEXT_CACHE_SIZE: usize = 5;
const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(900);
const MAX_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(3600);

/// Session parameters reported by the server, keyed by lower-cased name.
///
/// Any response may carry updates, so reads and writes go through one mutex.
#[derive(Debug, Default)]
pub(crate) struct SessionParameters {
    values: Mutex<HashMap<String, String>>,
}

impl SessionParameters {
    pub(crate) fn new(initial: &HashMap<String, String>) -> Self {
        let values = initial
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<String> {
        let values = match self.values.lock() {
            Ok(values) => values,
            Err(poisoned) => poisoned.into_inner(),
        };
        values.get(&name.to_ascii_lowercase()).cloned()
    }

    pub(crate) fn merge(&self, updates: &[NameValueParameter]) {
        if updates.is_empty() {
            return;
        }
        let mut values = match self.values.lock() {
            Ok(values) => values,
            Err(poisoned) => poisoned.into_inner(),
        };
        for update in updates {
            let value = match &update.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.insert(update.name.to_ascii_lowercase(), value);
        }
    }

    pub(crate) fn array_binding_threshold(&self) -> Option<usize> {
        self.get(CLIENT_STAGE_ARRAY_BINDING_THRESHOLD)
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
    }

    pub(crate) fn service_name(&self) -> Option<String> {
        self.get(SERVICE_NAME).filter(|v| !v.is_empty())
    }

    pub(crate) fn query_context_cache_size(&self) -> usize {
        self.get(QUERY_CONTEXT_CACHE_SIZE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_QUERY_CONTEXT_CACHE_SIZE)
    }

    pub(crate) fn heartbeat_frequency(&self, default: Duration) -> Duration {
        self.get(HEARTBEAT_FREQUENCY)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
            .clamp(MIN_HEARTBEAT_FREQUENCY, MAX_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn telemetry_enabled(&self) -> bool {
        self.get(CLIENT_TELEMETRY_ENABLED)
            .is_none_or(|v| !v.eq_ignore_ascii_case("false"))
    }

    /// Fixed offset of the session `TIMEZONE` when it is written as one (`+09:00`, `UTC`).
    pub(crate) fn time_offset(&self) -> Option<FixedOffset> {
        self.get(TIMEZONE).and_then(|tz| parse_fixed_offset(&tz))
    }
}

pub(crate) fn parse_fixed_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("gmt") || value == "Z" {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[..2].parse().ok()?, rest[2..].parse().ok()?),
        None => (rest.parse().ok()?, 0),
    };
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn param(name: &str, value: serde_json::Value) -> NameValueParameter {
        NameValueParameter {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn merge_lowercases_and_stringifies() {
        let params = SessionParameters::default();
        params.merge(&[
            param("CLIENT_STAGE_ARRAY_BINDING_THRESHOLD", json!(65280)),
            param("SERVICE_NAME", json!("svc")),
            param("TIMEZONE", json!("America/Los_Angeles")),
        ]);
        assert_eq!(params.array_binding_threshold(), Some(65280));
        assert_eq!(params.service_name().as_deref(), Some("svc"));
        assert_eq!(params.get("timezone").as_deref(), Some("America/Los_Angeles"));
        assert_eq!(params.time_offset(), None);
    }

    #[test]
    fn heartbeat_frequency_is_clamped() {
        let params = SessionParameters::default();
        let default = Duration::from_secs(3600);
        assert_eq!(params.heartbeat_frequency(default), default);
        params.merge(&[param(HEARTBEAT_FREQUENCY, json!(60))]);
        assert_eq!(params.heartbeat_frequency(default), Duration::from_secs(900));
    }

    #[test]
    fn fixed_offsets() {
        assert_eq!(parse_fixed_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_fixed_offset("+09:00"), FixedOffset::east_opt(9 * 3600));
        assert_eq!(parse_fixed_offset("-0530"), FixedOffset::west_opt(5 * 3600 + 1800));
        assert_eq!(parse_fixed_offset("Asia/Tokyo"), None);
    }

    #[test]
    fn cache_size_defaults_to_five() {
        let params = SessionParameters::new(&HashMap::new());
        assert_eq!(params.query_context_cache_size(), 5);
        params.merge(&[param("QUERY_CONTEXT_CACHE_SIZE", json!(2))]);
        assert_eq!(params.query_context_cache_size(), 2);
    }

    #[test]
    fn telemetry_enabled_unless_turned_off() {
        let params = SessionParameters::default();
        assert!(params.telemetry_enabled());
        params.merge(&[param("CLIENT_TELEMETRY_ENABLED", json!(false))]);
        assert!(!params.telemetry_enabled());
    }
}
