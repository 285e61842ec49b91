use crate::k8s_types::{v1beta1, K8sType};
use crate::resource::{Conditions, ObjectMeta, ObjectReference, Resource, Scope};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use std::time::Duration;

lazy_static! {
    static ref DURATION_PART: Regex = Regex::new(r"(\d+)(ms|h|m|s)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub metadata: ObjectMeta,
    pub spec: BrokerSpec,
    #[serde(default)]
    pub status: BrokerStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<BrokerAuthInfo>,
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
    /// PEM bundle, base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    #[serde(default)]
    pub relist_behavior: RelistBehavior,
    /// Go style duration string such as `15m` or `1h30m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relist_duration: Option<String>,
    #[serde(default)]
    pub relist_requests: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_restrictions: Option<CatalogRestrictions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelistBehavior {
    Duration,
    Manual,
}

impl Default for RelistBehavior {
    fn default() -> RelistBehavior {
        RelistBehavior::Duration
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrokerAuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<SecretAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<SecretAuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretAuthConfig {
    pub secret_ref: ObjectReference,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRestrictions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_class: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_plan: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
}

impl Broker {
    pub fn new(namespace: Option<&str>, name: &str, url: &str) -> Broker {
        Broker {
            metadata: ObjectMeta::new(namespace, name),
            spec: BrokerSpec {
                url: url.to_owned(),
                ..Default::default()
            },
            status: BrokerStatus::default(),
        }
    }

    /// The relist interval, if the broker relists on a timer. Returns `Err` with the raw
    /// value if the duration string can't be parsed.
    pub fn relist_interval(&self, default: Duration) -> Result<Option<Duration>, String> {
        if self.spec.relist_behavior == RelistBehavior::Manual {
            return Ok(None);
        }
        match self.spec.relist_duration.as_deref() {
            None => Ok(Some(default)),
            Some(raw) => parse_duration(raw)
                .map(Some)
                .ok_or_else(|| raw.to_owned()),
        }
    }
}

impl Resource for Broker {
    fn k8s_type(scope: Scope) -> &'static K8sType {
        match scope {
            Scope::Cluster => v1beta1::ClusterServiceBroker,
            Scope::Namespaced => v1beta1::ServiceBroker,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Parses duration strings like `15m`, `1h30m`, `90s` or `250ms`. The whole input must be
/// consumed by duration parts.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let mut consumed = 0;
    let mut total = Duration::from_secs(0);
    for cap in DURATION_PART.captures_iter(input) {
        let whole = cap.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let amount: u64 = cap[1].parse().ok()?;
        let part = match &cap[2] {
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "s" => Duration::from_secs(amount),
            _ => Duration::from_millis(amount),
        };
        total = total.checked_add(part)?;
    }
    if consumed == input.len() {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_are_parsed() {
        assert_eq!(Some(Duration::from_secs(900)), parse_duration("15m"));
        assert_eq!(Some(Duration::from_secs(5400)), parse_duration("1h30m"));
        assert_eq!(Some(Duration::from_secs(90)), parse_duration("90s"));
        assert_eq!(Some(Duration::from_millis(250)), parse_duration("250ms"));
        assert_eq!(Some(Duration::from_secs(61)), parse_duration("1m1s"));
        assert_eq!(None, parse_duration(""));
        assert_eq!(None, parse_duration("15"));
        assert_eq!(None, parse_duration("15x"));
        assert_eq!(None, parse_duration("m15m"));
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        assert_eq!(None, parse_duration("6000000000000000h"));
        assert_eq!(None, parse_duration("400000000000000000m"));
        assert_eq!(None, parse_duration("18446744073709551615s18446744073709551615s"));
        assert_eq!(Some(Duration::from_secs(u64::MAX)), parse_duration("18446744073709551615s"));
    }

    #[test]
    fn manual_brokers_have_no_relist_interval() {
        let mut broker = Broker::new(None, "test-broker", "http://example.com");
        let default = Duration::from_secs(900);
        assert_eq!(Ok(Some(default)), broker.relist_interval(default));

        broker.spec.relist_duration = Some("10m".to_owned());
        assert_eq!(Ok(Some(Duration::from_secs(600))), broker.relist_interval(default));

        broker.spec.relist_behavior = RelistBehavior::Manual;
        assert_eq!(Ok(None), broker.relist_interval(default));
    }

    #[test]
    fn broker_deserializes_with_defaults() {
        let json = serde_json::json!({
            "metadata": {"name": "test-broker"},
            "spec": {
                "url": "http://example.com",
                "authInfo": {"basic": {"secretRef": {"namespace": "test-ns", "name": "auth"}}},
                "catalogRestrictions": {"serviceClass": ["spec.externalName==foo"]}
            }
        });
        let broker: Broker = serde_json::from_value(json).unwrap();
        assert_eq!(RelistBehavior::Duration, broker.spec.relist_behavior);
        assert_eq!(0, broker.spec.relist_requests);
        assert!(!broker.spec.insecure_skip_tls_verify);
        let basic = broker.spec.auth_info.unwrap().basic.unwrap();
        assert_eq!(Some("test-ns".to_owned()), basic.secret_ref.namespace);
        assert!(broker.status.conditions.is_empty());
    }
}
