use crate::core::{DateSpan, Record, SyncState};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalDirection {
    Increasing,
    Decreasing,
}

/// A tracked goal: move a measured value from `baseline` towards `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: Uuid,
    pub title: String,
    pub direction: GoalDirection,
    pub baseline: f64,
    pub target: f64,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub sync: SyncState,
}

impl Goal {
    pub fn new(
        title: impl Into<String>,
        direction: GoalDirection,
        baseline: f64,
        target: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            direction,
            baseline,
            target,
            start_date: Utc::now().date_naive(),
            end_date: None,
            notes: None,
            sync: SyncState::default(),
        }
    }

    pub fn decreasing(title: impl Into<String>, baseline: f64, target: f64) -> Self {
        Self::new(title, GoalDirection::Decreasing, baseline, target)
    }

    pub fn increasing(title: impl Into<String>, baseline: f64, target: f64) -> Self {
        Self::new(title, GoalDirection::Increasing, baseline, target)
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_dates(mut self, start: NaiveDate, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl Record for Goal {
    fn id(&self) -> Uuid {
        self.id
    }

    fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.sync
    }

    fn text_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![("title", self.title.as_str())];
        if let Some(notes) = &self.notes {
            fields.push(("notes", notes.as_str()));
        }
        fields
    }

    fn date_spans(&self) -> Vec<DateSpan> {
        vec![DateSpan {
            field: "start_date/end_date",
            start: self.start_date,
            end: self.end_date,
        }]
    }

    fn check_domain_rules(&self) -> Result<(), String> {
        if !self.baseline.is_finite() || !self.target.is_finite() {
            return Err("baseline and target must be finite".to_string());
        }
        if self.direction == GoalDirection::Decreasing {
            if self.baseline <= 0.0 {
                return Err(format!(
                    "decreasing goal needs baseline > 0, got {}",
                    self.baseline
                ));
            }
            if self.target >= self.baseline {
                return Err(format!(
                    "decreasing goal needs target < baseline, got target {} and baseline {}",
                    self.target, self.baseline
                ));
            }
        }
        Ok(())
    }
}
