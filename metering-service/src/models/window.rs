//! Half-open time windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn duration(&self) -> Duration {
        if self.is_empty() {
            Duration::zero()
        } else {
            self.end - self.start
        }
    }

    /// Overlap with another window, `None` when they do not intersect.
    pub fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeWindow { start, end })
    }

    pub fn extend(&self, before: Duration, after: Duration) -> TimeWindow {
        TimeWindow {
            start: self.start - before,
            end: self.end + after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow::new(at(1), at(2));
        assert!(window.contains(at(1)));
        assert!(!window.contains(at(2)));
    }

    #[test]
    fn disjoint_windows_do_not_intersect() {
        let a = TimeWindow::new(at(1), at(5));
        let b = TimeWindow::new(at(5), at(9));
        assert_eq!(a.intersect(&b), None);
        assert_eq!(
            a.intersect(&TimeWindow::new(at(3), at(9))),
            Some(TimeWindow::new(at(3), at(5)))
        );
    }
}
