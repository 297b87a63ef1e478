use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Named boolean conditions carried in a record's status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// `None` when the condition has never been set.
    pub fn is_true(&self, type_: &str) -> Option<bool> {
        self.get(type_).map(|c| c.status)
    }

    /// Create or replace the condition of the given type.
    ///
    /// The transition time only moves when the boolean status flips.
    pub fn set(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        let now = Utc::now();
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.0.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_same_type() {
        let mut c = Conditions::default();
        c.set("Ready", false, "Creating", "PipelineCreating");
        c.set("Ready", true, "", "PipelineReady");
        c.set("ModelsReady", true, "Models all available", "");

        assert_eq!(c.len(), 2);
        let ready = c.get("Ready").unwrap();
        assert!(ready.status);
        assert_eq!(ready.message, "PipelineReady");
        assert_eq!(c.is_true("ModelsReady"), Some(true));
        assert_eq!(c.is_true("Missing"), None);
    }

    #[test]
    fn test_transition_time_kept_without_flip() {
        let mut c = Conditions::default();
        c.set("Ready", true, "a", "");
        let first = c.get("Ready").unwrap().last_transition_time;
        c.set("Ready", true, "b", "");
        let second = c.get("Ready").unwrap();
        assert_eq!(second.last_transition_time, first);
        assert_eq!(second.reason, "b");
    }
}
