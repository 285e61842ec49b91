use chrono::{DateTime, Utc};

use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Failed,
    OrphanMitigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> ConditionStatus {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// The set of conditions on an object, at most one per type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn status(&self, condition_type: ConditionType) -> ConditionStatus {
        self.get(condition_type)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.status(condition_type) == ConditionStatus::True
    }

    pub fn reason(&self, condition_type: ConditionType) -> Option<&str> {
        self.get(condition_type).map(|c| c.reason.as_str())
    }

    /// Sets the condition, touching `last_transition_time` only if the status changed.
    /// Returns true if anything about the condition changed.
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.0.iter_mut().find(|c| c.condition_type == condition_type) {
            Some(existing) => {
                let changed = existing.status != status
                    || existing.reason != reason
                    || existing.message != message;
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_owned();
                existing.message = message.to_owned();
                changed
            }
            None => {
                self.0.push(Condition {
                    condition_type,
                    status,
                    reason: reason.to_owned(),
                    message: message.to_owned(),
                    last_transition_time: now,
                });
                true
            }
        }
    }

    pub fn remove(&mut self, condition_type: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.condition_type != condition_type);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transition_time_only_changes_with_status() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);
        let mut conditions = Conditions::default();

        assert!(conditions.set(ConditionType::Ready, ConditionStatus::False, "Provisioning", "in progress", t0));
        assert!(conditions.set(ConditionType::Ready, ConditionStatus::False, "Provisioning", "still going", t1));
        assert_eq!(t0, conditions.get(ConditionType::Ready).unwrap().last_transition_time);

        assert!(conditions.set(ConditionType::Ready, ConditionStatus::True, "ProvisionedSuccessfully", "done", t2));
        let ready = conditions.get(ConditionType::Ready).unwrap();
        assert_eq!(t2, ready.last_transition_time);
        assert_eq!("ProvisionedSuccessfully", ready.reason);
    }

    #[test]
    fn setting_an_identical_condition_reports_no_change() {
        let now = Utc::now();
        let mut conditions = Conditions::default();
        conditions.set(ConditionType::Failed, ConditionStatus::True, "ProvisionCallFailed", "boom", now);
        assert!(!conditions.set(ConditionType::Failed, ConditionStatus::True, "ProvisionCallFailed", "boom", Utc::now()));
        assert!(conditions.is_true(ConditionType::Failed));
        assert_eq!(ConditionStatus::Unknown, conditions.status(ConditionType::Ready));
    }

    #[test]
    fn conditions_serialize_as_a_list() {
        let now = Utc::now();
        let mut conditions = Conditions::default();
        conditions.set(ConditionType::Ready, ConditionStatus::True, "FetchedCatalog", "ok", now);
        let json = serde_json::to_value(&conditions).unwrap();
        assert_eq!("Ready", json[0]["type"]);
        assert_eq!("True", json[0]["status"]);
        assert!(json[0]["lastTransitionTime"].is_string());
    }
}
