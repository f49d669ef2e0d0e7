// Per-tick telemetry capture with bounded retention.

use crate::domain::computation::ComputationOutcome;
use crate::domain::run::SimState;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Output of one request within a recorded tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSample {
    pub unit: String,
    pub kind: String,
    pub outcome: ComputationOutcome,
}

/// Snapshot of the run after one completed tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub iteration: u64,
    pub time: f64,
    /// Wall-clock epoch milliseconds when the frame was recorded.
    pub timestamp: u64,
    /// Time spent inside the barrier for this tick.
    pub compute_ms: f64,
    pub state: SimState,
    pub samples: Vec<UnitSample>,
}

impl TelemetryFrame {
    pub fn absent_units(&self) -> impl Iterator<Item = &UnitSample> {
        self.samples.iter().filter(|s| s.outcome.is_absent())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySettings {
    /// Most recent frames kept verbatim.
    pub recent_frames: usize,
    /// Upper bound on downsampled history frames.
    pub history_frames: usize,
    /// Initial stride between history frames.
    pub downsample_every: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            recent_frames: 256,
            history_frames: 512,
            downsample_every: 10,
        }
    }
}

/// Running summary of one scalar across every recorded frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalarSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    #[serde(rename = "final")]
    pub last: f64,
    #[serde(skip)]
    sum: f64,
    #[serde(skip)]
    count: u64,
}

impl ScalarSummary {
    fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            mean: value,
            last: value,
            sum: value,
            count: 1,
        }
    }

    fn push(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
        self.mean = self.sum / self.count as f64;
        self.last = value;
    }
}

/// Whole-run accumulators, independent of frame retention.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub frames: u64,
    pub computations: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub missed: u64,
    pub total_compute_ms: f64,
    pub max_compute_ms: f64,
    pub scalars: BTreeMap<String, ScalarSummary>,
}

impl TelemetryStats {
    fn absorb(&mut self, frame: &TelemetryFrame) {
        self.frames += 1;
        self.total_compute_ms += frame.compute_ms;
        self.max_compute_ms = self.max_compute_ms.max(frame.compute_ms);
        for sample in &frame.samples {
            self.computations += 1;
            match sample.outcome {
                ComputationOutcome::Failed { .. } => self.failures += 1,
                ComputationOutcome::TimedOut { .. } => self.timeouts += 1,
                ComputationOutcome::Missed => self.missed += 1,
                ComputationOutcome::Completed { .. } => {}
            }
        }
        for (name, value) in &frame.state.scalars {
            self.scalars
                .entry(name.clone())
                .and_modify(|s| s.push(*value))
                .or_insert_with(|| ScalarSummary::new(*value));
        }
    }

    pub fn mean_compute_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.total_compute_ms / self.frames as f64
        }
    }

    fn rate(&self, count: u64) -> f64 {
        if self.computations == 0 {
            0.0
        } else {
            count as f64 / self.computations as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        self.rate(self.failures)
    }

    pub fn timeout_rate(&self) -> f64 {
        self.rate(self.timeouts + self.missed)
    }
}

/// Bounded frame store: the last K frames plus a thinned long-run history.
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    settings: TelemetrySettings,
    recent: VecDeque<TelemetryFrame>,
    history: Vec<TelemetryFrame>,
    stride: u64,
    stats: TelemetryStats,
}

impl TelemetryBuffer {
    pub fn new(settings: TelemetrySettings) -> Self {
        Self {
            settings,
            recent: VecDeque::with_capacity(settings.recent_frames.min(1024)),
            history: Vec::new(),
            stride: settings.downsample_every.max(1),
            stats: TelemetryStats::default(),
        }
    }

    pub fn record(&mut self, frame: TelemetryFrame) {
        self.stats.absorb(&frame);

        if self.settings.history_frames > 0 && frame.iteration % self.stride == 0 {
            if self.history.len() >= self.settings.history_frames {
                self.thin_history();
            }
            // Thinning doubles the stride, which can leave this frame off-grid.
            if frame.iteration % self.stride == 0 {
                self.history.push(frame.clone());
            }
        }

        if self.settings.recent_frames == 0 {
            return;
        }
        if self.recent.len() == self.settings.recent_frames {
            self.recent.pop_front();
        }
        self.recent.push_back(frame);
    }

    // Keeps every other history frame and doubles the stride.
    fn thin_history(&mut self) {
        self.stride *= 2;
        let stride = self.stride;
        self.history.retain(|f| f.iteration % stride == 0);
    }

    pub fn stats(&self) -> &TelemetryStats {
        &self.stats
    }

    /// Retained frames in iteration order, without duplicates.
    pub fn frames(&self) -> Vec<TelemetryFrame> {
        let first_recent = self.recent.front().map_or(u64::MAX, |f| f.iteration);
        self.history
            .iter()
            .filter(|f| f.iteration < first_recent)
            .chain(self.recent.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(iteration: u64, fuel: f64, outcome: ComputationOutcome) -> TelemetryFrame {
        let mut state = SimState::default();
        state.scalars.insert("fuel".into(), fuel);
        TelemetryFrame {
            iteration,
            time: iteration as f64,
            timestamp: 0,
            compute_ms: iteration as f64,
            state,
            samples: vec![UnitSample {
                unit: "physics".into(),
                kind: "step".into(),
                outcome,
            }],
        }
    }

    fn ok() -> ComputationOutcome {
        ComputationOutcome::Completed {
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn recent_window_keeps_only_the_last_frames() {
        let mut buffer = TelemetryBuffer::new(TelemetrySettings {
            recent_frames: 3,
            history_frames: 0,
            downsample_every: 10,
        });
        for i in 1..=5 {
            buffer.record(frame(i, 10.0, ok()));
        }

        let kept: Vec<u64> = buffer.recent.iter().map(|f| f.iteration).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(buffer.stats().frames, 5);
    }

    #[test]
    fn history_is_thinned_when_full() {
        let mut buffer = TelemetryBuffer::new(TelemetrySettings {
            recent_frames: 2,
            history_frames: 4,
            downsample_every: 1,
        });
        for i in 1..=9 {
            buffer.record(frame(i, 10.0, ok()));
        }

        let history: Vec<u64> = buffer.history.iter().map(|f| f.iteration).collect();
        assert!(history.len() <= 4, "history grew to {history:?}");
        assert!(history.iter().all(|i| i % 2 == 0));
        assert_eq!(buffer.frames().last().map(|f| f.iteration), Some(9));
    }

    #[test]
    fn frames_merge_history_and_recent_in_order() {
        let mut buffer = TelemetryBuffer::new(TelemetrySettings {
            recent_frames: 2,
            history_frames: 10,
            downsample_every: 2,
        });
        for i in 1..=6 {
            buffer.record(frame(i, 10.0, ok()));
        }

        let order: Vec<u64> = buffer.frames().iter().map(|f| f.iteration).collect();
        assert_eq!(order, vec![2, 4, 5, 6]);
    }

    #[test]
    fn stats_cover_every_frame_and_outcome() {
        let mut buffer = TelemetryBuffer::new(TelemetrySettings {
            recent_frames: 1,
            history_frames: 0,
            downsample_every: 1,
        });
        buffer.record(frame(1, 10.0, ok()));
        buffer.record(frame(
            2,
            6.0,
            ComputationOutcome::Failed {
                error: "bad".into(),
            },
        ));
        buffer.record(frame(3, 8.0, ComputationOutcome::TimedOut { after_ms: 5 }));
        buffer.record(frame(4, 4.0, ok()));

        let stats = buffer.stats();
        assert_eq!(stats.computations, 4);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failure_rate(), 0.25);
        assert_eq!(stats.mean_compute_ms(), 2.5);
        assert_eq!(stats.max_compute_ms, 4.0);

        let fuel = stats.scalars["fuel"];
        assert_eq!(fuel.min, 4.0);
        assert_eq!(fuel.max, 10.0);
        assert_eq!(fuel.mean, 7.0);
        assert_eq!(fuel.last, 4.0);
    }
}
