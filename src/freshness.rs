//! Staleness policy for cached derived values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A value together with when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub value: T,
    pub fetched_at: DateTime<Utc>,
    /// Hard expiry. Past this point the value is stale whatever the policy says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl<T> Timestamped<T> {
    pub fn now(value: T) -> Self {
        Self {
            value,
            fetched_at: Utc::now(),
            valid_until: None,
        }
    }

    pub fn with_valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    pub prefer_fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessReport {
    pub is_fresh: bool,
    /// Age of the data; `None` when there is no data (infinitely old).
    pub age: Option<Duration>,
    pub should_refresh: bool,
}

/// Decide whether `data` can still be trusted at `now`.
pub fn check_freshness<T>(
    data: Option<&Timestamped<T>>,
    policy: &FreshnessPolicy,
    now: DateTime<Utc>,
) -> FreshnessReport {
    let Some(data) = data else {
        return FreshnessReport {
            is_fresh: false,
            age: None,
            should_refresh: policy.prefer_fresh,
        };
    };

    // Timestamps from the future count as age zero.
    let age = (now - data.fetched_at).to_std().unwrap_or(Duration::ZERO);
    let expired = data.valid_until.is_some_and(|until| until <= now);
    let is_fresh = !expired && age <= policy.max_age;

    FreshnessReport {
        is_fresh,
        age: Some(age),
        should_refresh: !is_fresh && policy.prefer_fresh,
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_age_ms: u64, prefer_fresh: bool) -> FreshnessPolicy {
        FreshnessPolicy {
            max_age: Duration::from_millis(max_age_ms),
            prefer_fresh,
        }
    }

    #[test]
    fn test_absent_is_never_fresh() {
        let report = check_freshness::<u32>(None, &policy(1000, true), Utc::now());
        assert!(!report.is_fresh);
        assert_eq!(report.age, None);
        assert!(report.should_refresh);

        let report = check_freshness::<u32>(None, &policy(1000, false), Utc::now());
        assert!(!report.should_refresh);
    }

    #[test]
    fn test_age_within_max_age() {
        let now = Utc::now();
        let data = Timestamped {
            value: 1,
            fetched_at: now - chrono::Duration::milliseconds(200),
            valid_until: None,
        };
        let report = check_freshness(Some(&data), &policy(500, true), now);
        assert!(report.is_fresh);
        assert_eq!(report.age, Some(Duration::from_millis(200)));
        assert!(!report.should_refresh);

        let report = check_freshness(Some(&data), &policy(100, true), now);
        assert!(!report.is_fresh);
        assert!(report.should_refresh);

        let report = check_freshness(Some(&data), &policy(100, false), now);
        assert!(!report.is_fresh);
        assert!(!report.should_refresh);
    }

    #[test]
    fn test_valid_until_overrides_max_age() {
        let now = Utc::now();
        let data = Timestamped::now("x").with_valid_until(now - chrono::Duration::seconds(1));
        let report = check_freshness(Some(&data), &policy(60_000, true), now);
        assert!(!report.is_fresh);
        assert!(report.should_refresh);
    }

    #[test]
    fn test_policy_roundtrip_in_ms() {
        let json = serde_json::to_string(&policy(1500, true)).unwrap();
        assert_eq!(json, r#"{"max_age":1500,"prefer_fresh":true}"#);
    }
}
