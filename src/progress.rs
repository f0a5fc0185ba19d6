use std::time::{Duration, Instant};

/// Records processing milestones and estimates the remaining time from a
/// rolling window of the most recent ones.
pub struct ProgressRecorder {
    recorded_milestones: Vec<Instant>,
    milestones_reached: usize,
}

/// Milestones older than this no longer influence the ETA.
const MAX_RECORDED_DURATION: Duration = Duration::from_secs(10 * 60);

impl ProgressRecorder {
    pub fn new() -> Self {
        ProgressRecorder {
            recorded_milestones: Vec::new(),
            milestones_reached: 0,
        }
    }

    pub fn save_milestone(&mut self) {
        self.save_milestone_at(Instant::now());
    }

    fn save_milestone_at(&mut self, now: Instant) {
        self.milestones_reached += 1;
        self.recorded_milestones.push(now);

        while let Some(first) = self.recorded_milestones.first() {
            if now.duration_since(*first) > MAX_RECORDED_DURATION {
                self.recorded_milestones.remove(0);
            } else {
                break;
            }
        }
    }

    /// Formats the current progress as ` (12.34% ETA: 1h 2m 3s)`, or an empty
    /// string while nothing can be estimated yet.
    pub fn to_progress_string(&self, max_milestones: usize) -> String {
        self.progress_string_at(Instant::now(), max_milestones)
    }

    fn progress_string_at(&self, now: Instant, max_milestones: usize) -> String {
        let (Some(percentage), Some(eta)) = (
            self.percentage(max_milestones),
            self.eta_at(now, max_milestones),
        ) else {
            return String::new();
        };

        format!(" ({:.2}% ETA: {})", percentage, format_eta(eta))
    }

    fn percentage(&self, max_milestones: usize) -> Option<f64> {
        let upper_limit = self.milestones_reached.max(max_milestones);
        if upper_limit == 0 {
            return None;
        }

        Some(100.0 * self.milestones_reached as f64 / upper_limit as f64)
    }

    fn eta_at(&self, now: Instant, max_milestones: usize) -> Option<Duration> {
        if self.milestones_reached < 1 {
            return None;
        }
        let first = self.recorded_milestones.first()?;

        let recorded = now.duration_since(*first);
        let average = recorded / self.recorded_milestones.len() as u32;
        let remaining = max_milestones.saturating_sub(self.milestones_reached);

        let eta = average * remaining as u32;
        Some(Duration::from_secs(eta.as_secs()))
    }
}

impl Default for ProgressRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a duration the way ISO-8601 renders its time part, lowercased and
/// space-separated, e.g. `1h 2m 3s`. Zero components are omitted.
fn format_eta(eta: Duration) -> String {
    let total = eta.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recorder_reports_nothing() {
        let recorder = ProgressRecorder::new();
        assert_eq!(recorder.to_progress_string(100), "");
    }

    #[test]
    fn eta_uses_the_window_average() {
        let mut recorder = ProgressRecorder::new();
        let start = Instant::now();

        // four milestones, ten seconds apart
        for i in 0..4 {
            recorder.save_milestone_at(start + Duration::from_secs(i * 10));
        }

        let now = start + Duration::from_secs(40);
        // window spans 40s over 4 recorded milestones -> 10s average, 6 remain
        let progress = recorder.progress_string_at(now, 10);
        assert_eq!(progress, " (40.00% ETA: 1m)");
    }

    #[test]
    fn percentage_caps_at_hundred_when_total_is_exceeded() {
        let mut recorder = ProgressRecorder::new();
        let start = Instant::now();
        for i in 0..5 {
            recorder.save_milestone_at(start + Duration::from_secs(i));
        }

        let progress = recorder.progress_string_at(start + Duration::from_secs(5), 2);
        assert!(progress.starts_with(" (100.00%"), "got {progress}");
    }

    #[test]
    fn old_milestones_are_evicted() {
        let mut recorder = ProgressRecorder::new();
        let start = Instant::now();
        recorder.save_milestone_at(start);
        recorder.save_milestone_at(start + Duration::from_secs(11 * 60));

        assert_eq!(recorder.recorded_milestones.len(), 1);
        assert_eq!(recorder.milestones_reached, 2);
    }

    #[test]
    fn eta_formatting_omits_zero_components() {
        assert_eq!(format_eta(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(format_eta(Duration::from_secs(3603)), "1h 3s");
        assert_eq!(format_eta(Duration::from_secs(59)), "59s");
        assert_eq!(format_eta(Duration::from_secs(0)), "0s");
    }
}
