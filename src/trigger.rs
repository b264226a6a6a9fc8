//! Progress-based screenshot triggers
//!
//! A trigger marks the first frame at which a recording has reached a given
//! percentage of its duration. Callers ask for a list of percentages (for
//! example `[4, 50, 99]`) and get back one trigger per percentage reached.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info};

use crate::frame::Frame;

/// Minimum number of distinct timestamps needed to sample by progress.
pub const MIN_DISTINCT_TIMESTAMPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ScreenshotTrigger {
    pub percent_of_progress: u32,
    pub elapsed_seconds: i64,
    pub duration: i64,
    pub frame_timestamp: i64,
}

impl ScreenshotTrigger {
    /// `duration` must be positive.
    pub fn new(duration: i64, elapsed_seconds: i64, frame_timestamp: i64) -> Self {
        let percent = if elapsed_seconds == 0 {
            0
        } else {
            (elapsed_seconds * 100).div_euclid(duration).clamp(0, 100)
        };
        Self {
            percent_of_progress: percent as u32,
            elapsed_seconds,
            duration,
            frame_timestamp,
        }
    }
}

/// Timestamps of every frame that carries one, in frame order.
pub fn frame_timestamps(frames: &[Frame]) -> Vec<i64> {
    frames.iter().filter_map(|f| f.timestamp).collect()
}

/// Compute one trigger candidate per timestamp.
///
/// Returns `None` when the recording is too short to sample: fewer than
/// [`MIN_DISTINCT_TIMESTAMPS`] distinct timestamps, or no positive duration.
/// Identical candidates collapse into the last one computed.
pub fn progress_triggers(timestamps: &[i64]) -> Option<Vec<ScreenshotTrigger>> {
    let distinct: HashSet<_> = timestamps.iter().collect();
    if distinct.len() < MIN_DISTINCT_TIMESTAMPS {
        debug!("Only {} distinct timestamps, not sampling by progress", distinct.len());
        return None;
    }

    let (first, last) = (*timestamps.first()?, *timestamps.last()?);
    let duration = last - first;
    if duration <= 0 {
        return None;
    }
    info!("The recording duration: {} seconds", duration);

    let mut seen = HashSet::new();
    let mut candidates: Vec<_> = timestamps
        .iter()
        .rev()
        .map(|ts| ScreenshotTrigger::new(duration, duration - (last - ts), *ts))
        .filter(|t| seen.insert(*t))
        .collect();
    candidates.reverse();
    Some(candidates)
}

/// Greedily match each target percentage to the first candidate, in
/// timestamp order, whose progress is at least that percentage.
///
/// Each target is matched at most once; the result follows target order.
pub fn select_triggers(candidates: &[ScreenshotTrigger], targets: &[u32]) -> Vec<ScreenshotTrigger> {
    let mut ordered = candidates.to_vec();
    ordered.sort_by_key(|t| t.frame_timestamp);

    let wanted: HashSet<_> = targets.iter().collect();
    let mut matched = HashSet::new();
    let mut selected = Vec::new();

    for target in targets {
        if matched.len() == wanted.len() {
            break;
        }
        if matched.contains(target) {
            continue;
        }
        if let Some(trigger) = ordered.iter().find(|t| t.percent_of_progress >= *target) {
            selected.push(*trigger);
            matched.insert(*target);
        }
    }
    selected
}

/// Which frames of a recording should be exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "triggers", rename_all = "snake_case")]
pub enum TriggerPlan {
    /// Every complete, synced frame
    ExportAll,
    /// Only the frames reaching these triggers, sorted by timestamp
    Sampled(Vec<ScreenshotTrigger>),
}

/// Build the export plan for a recording.
pub fn plan(timestamps: &[i64], targets: &[u32]) -> TriggerPlan {
    if targets.is_empty() {
        return TriggerPlan::ExportAll;
    }
    match progress_triggers(timestamps) {
        None => TriggerPlan::ExportAll,
        Some(candidates) => {
            let mut selected = select_triggers(&candidates, targets);
            selected.sort_by_key(|t| t.frame_timestamp);
            info!("Selected {} of {} progress triggers", selected.len(), targets.len());
            TriggerPlan::Sampled(selected)
        }
    }
}

/// Why a frame was picked for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Unconditional,
    Trigger(ScreenshotTrigger),
}

/// Walks frames in order and decides which ones to export.
#[derive(Debug)]
pub struct TriggerCursor {
    pending: Option<VecDeque<ScreenshotTrigger>>,
}

impl TriggerCursor {
    pub fn new(plan: &TriggerPlan) -> Self {
        let pending = match plan {
            TriggerPlan::ExportAll => None,
            TriggerPlan::Sampled(triggers) => Some(triggers.iter().copied().collect()),
        };
        Self { pending }
    }

    /// Only complete, synced frames are eligible; a sampled plan consumes one
    /// trigger per exported frame.
    pub fn accept(&mut self, frame: &Frame) -> Option<Selection> {
        if !(frame.is_complete() && frame.is_synced()) {
            return None;
        }
        let Some(pending) = self.pending.as_mut() else {
            return Some(Selection::Unconditional);
        };
        let timestamp = frame.timestamp?;
        let next = pending.front()?;
        if timestamp >= next.frame_timestamp {
            pending.pop_front().map(Selection::Trigger)
        } else {
            None
        }
    }

    /// True once a sampled plan has no trigger left.
    pub fn is_done(&self) -> bool {
        self.pending.as_ref().is_some_and(VecDeque::is_empty)
    }
}
