use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The shared status document at `cocktail/status`.
///
/// Written by both the bridge and the mobile client. Fields the bridge does not
/// know about are carried in `extra` so a full write never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusRecord {
    pub is_blending: bool,
    pub is_taring: bool,
    pub current_step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusRecord {
    /// The record the client writes when the user taps "start".
    pub fn run_start(now_ms: i64) -> Self {
        Self {
            is_blending: true,
            is_taring: true,
            current_step: 0,
            total_weight: None,
            score: None,
            completed: false,
            timestamp: Some(now_ms),
            extra: Map::new(),
        }
    }

    /// `isTaring` and `completed` are never both set.
    pub fn is_consistent(&self) -> bool {
        !(self.is_taring && self.completed)
    }
}

/// A field-level merge. Only the fields that are `Some` are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_blending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_taring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, record: &mut StatusRecord) {
        if let Some(value) = self.is_blending {
            record.is_blending = value;
        }
        if let Some(value) = self.is_taring {
            record.is_taring = value;
        }
        if let Some(value) = self.current_step {
            record.current_step = value;
        }
        if let Some(value) = self.total_weight {
            record.total_weight = Some(value);
        }
        if let Some(value) = self.score {
            record.score = Some(value);
        }
        if let Some(value) = self.completed {
            record.completed = value;
        }
        if let Some(value) = self.timestamp {
            record.timestamp = Some(value);
        }
    }
}

/// A record read together with the store's opaque version tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub record: Option<StatusRecord>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_partial_client_write() {
        let record: StatusRecord = serde_json::from_value(json!({
            "isBlending": true,
            "isTaring": true,
            "currentStep": 0,
            "completed": false,
            "timestamp": 1_700_000_000_000i64
        }))
        .unwrap();

        assert!(record.is_blending);
        assert!(record.is_taring);
        assert_eq!(record.total_weight, None);
        assert_eq!(record.score, None);
        assert!(record.extra.is_empty());
    }

    #[test]
    fn keeps_unknown_fields_across_round_trip() {
        let record: StatusRecord = serde_json::from_value(json!({
            "isBlending": false,
            "totalWeight": 88,
            "score": 90,
            "playerName": "Cinderella"
        }))
        .unwrap();

        assert_eq!(record.total_weight, Some(88.0));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["playerName"], "Cinderella");
        assert_eq!(value["score"], 90);
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = StatusPatch {
            is_taring: Some(false),
            current_step: Some(1),
            ..Default::default()
        };

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "isTaring": false, "currentStep": 1 })
        );
    }

    #[test]
    fn patch_applies_over_existing_record() {
        let mut record = StatusRecord::run_start(10);
        StatusPatch {
            is_taring: Some(false),
            current_step: Some(1),
            ..Default::default()
        }
        .apply_to(&mut record);

        assert!(record.is_blending);
        assert!(!record.is_taring);
        assert_eq!(record.current_step, 1);
        assert_eq!(record.timestamp, Some(10));
    }

    #[test]
    fn taring_and_completed_are_inconsistent() {
        let mut record = StatusRecord::run_start(0);
        assert!(record.is_consistent());
        record.completed = true;
        assert!(!record.is_consistent());
    }
}
