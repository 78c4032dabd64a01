//! Query parameters shared by the SSE and WebSocket stream endpoints

use crate::events::{EventKind, SubscriberFilter};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::str::FromStr;

/// Helper to deserialize optional numbers from query string
fn deserialize_option_from_str<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    use serde::de::Error;
    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) if !s.trim().is_empty() => s.trim().parse().map(Some).map_err(D::Error::custom),
        _ => Ok(None),
    }
}

/// Filters and resume point for a stream subscription
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StreamQuery {
    /// Comma-separated event kinds (e.g. "created,deleted")
    pub kinds: Option<String>,
    /// Only events for this resource
    pub resource_id: Option<String>,
    /// Resume point for clients that cannot send `Last-Event-ID`
    #[serde(default, deserialize_with = "deserialize_option_from_str")]
    pub last_event_id: Option<u64>,
}

impl StreamQuery {
    /// Build the subscriber filter; unknown kinds are rejected
    pub fn filter(&self) -> Result<SubscriberFilter, String> {
        let kinds = match self.kinds.as_deref() {
            Some(raw) => {
                let parsed = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(EventKind::from_str)
                    .collect::<Result<HashSet<_>, _>>()?;
                (!parsed.is_empty()).then_some(parsed)
            }
            None => None,
        };
        let resource_id = self
            .resource_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(SubscriberFilter { kinds, resource_id })
    }
}

/// Parse a `Last-Event-ID` value; anything but a plain sequence is ignored
pub fn parse_last_event_id(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}
