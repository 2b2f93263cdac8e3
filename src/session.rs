use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;
use crate::stats::{fmt_ms, DeltaSeries};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Probe emits, host observes.
    Input,
    /// Host emits, probe observes.
    Output,
}

/// How a session reached `Done`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    /// A sync, command or transport failure ended the run early.
    Aborted,
    /// `end()` was called by the owner.
    Cancelled,
}

/// One run of N repetitions.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    direction: Direction,
    started_at: DateTime<Utc>,
    repetitions: usize,
    repetitions_done: usize,
    series: Vec<DeltaSeries>,
}

impl Session {
    pub fn new(direction: Direction, repetitions: usize, series_names: &[&str]) -> Self {
        Session {
            id: Uuid::new_v4(),
            direction,
            started_at: Utc::now(),
            repetitions,
            repetitions_done: 0,
            series: series_names.iter().map(|name| DeltaSeries::new(*name)).collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Records one trial: one delta per series, in series order.
    ///
    /// Returns false (and records nothing) once the configured repetition count is reached.
    pub fn record_trial(&mut self, deltas_ms: &[f64]) -> bool {
        if self.is_complete() {
            return false;
        }
        debug_assert_eq!(deltas_ms.len(), self.series.len());
        for (series, delta) in self.series.iter_mut().zip(deltas_ms) {
            series.push(*delta);
        }
        self.repetitions_done += 1;
        true
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn repetitions_done(&self) -> usize {
        self.repetitions_done
    }

    pub fn is_complete(&self) -> bool {
        self.repetitions_done >= self.repetitions
    }

    pub fn series(&self) -> &[DeltaSeries] {
        &self.series
    }

    pub fn series_named(&self, name: &str) -> Option<&DeltaSeries> {
        self.series.iter().find(|s| s.name() == name)
    }

    pub fn report(&self, outcome: Outcome) -> SessionReport {
        SessionReport {
            session_id: self.id,
            direction: self.direction,
            outcome,
            started_at: self.started_at,
            repetitions_requested: self.repetitions,
            repetitions_done: self.repetitions_done,
            series: self
                .series
                .iter()
                .map(|s| SeriesSummary {
                    name: s.name().to_string(),
                    values: s.values().to_vec(),
                    median: s.median(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SeriesSummary {
    pub name: String,
    pub values: Vec<f64>,
    /// None when the series is empty.
    pub median: Option<f64>,
}

/// Handed to the completion callback exactly once per session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub direction: Direction,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub repetitions_requested: usize,
    pub repetitions_done: usize,
    pub series: Vec<SeriesSummary>,
}

impl SessionReport {
    pub fn series_named(&self, name: &str) -> Option<&SeriesSummary> {
        self.series.iter().find(|s| s.name == name)
    }

    pub fn median(&self, name: &str) -> Option<f64> {
        self.series_named(name).and_then(|s| s.median)
    }

    pub fn summary_lines(&self) -> Vec<String> {
        self.series
            .iter()
            .map(|s| format!("Median {}: {} (n={})", s.name, fmt_ms(s.median), s.values.len()))
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))
    }
}
