//! Candidate epsilon sequences.
//!
//! Candidates are computed as `start + i * step` rather than by repeated
//! addition so long scans do not accumulate rounding drift. Sequences are
//! lazy: a tiny step over a wide range costs nothing until candidates are
//! pulled, so the evaluation budget can stop a scan before it gets far.

use std::iter::{once, FusedIterator};

/// Slack, in units of `step`, for treating a candidate as landing on `end`.
const GRID_SLACK: f64 = 1e-9;

/// Lazy `start, start + step, ...` sequence; see [`linear_grid`].
#[derive(Debug, Clone)]
pub struct LinearGrid {
    start: f64,
    end: f64,
    step: f64,
    next: usize,
    count: usize,
}

impl LinearGrid {
    fn value(&self, i: usize) -> f64 {
        let value = self.start + i as f64 * self.step;
        if (value - self.end).abs() <= GRID_SLACK * self.step {
            self.end
        } else {
            value.min(self.end)
        }
    }
}

impl Iterator for LinearGrid {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.next >= self.count {
            return None;
        }
        let value = self.value(self.next);
        self.next += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for LinearGrid {}

impl FusedIterator for LinearGrid {}

/// `start, start + step, ...` up to and including `end` (when it lands on the grid).
///
/// A final candidate within rounding distance of `end` is snapped to `end`
/// exactly, so it matches results already recorded for that boundary.
pub fn linear_grid(start: f64, end: f64, step: f64) -> LinearGrid {
    if end < start || step <= 0.0 {
        return LinearGrid {
            start,
            end: start,
            step: 1.0,
            next: 0,
            count: 1,
        };
    }

    // Float-to-int casts saturate, so absurd ranges stay finite.
    let steps = ((end - start) / step + GRID_SLACK).floor() as usize;
    LinearGrid {
        start,
        end,
        step,
        next: 0,
        count: steps.saturating_add(1),
    }
}

/// Fine-scan candidates over `[start, anchor]`, in increasing order, always
/// ending exactly at `anchor`.
pub fn fine_window(start: f64, anchor: f64, step: f64) -> impl Iterator<Item = f64> {
    linear_grid(start, anchor, step)
        .take_while(move |eps| *eps < anchor)
        .chain(once(anchor))
}
