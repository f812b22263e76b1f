//! Splits the lookback horizon into contiguous discovery windows.

use std::fmt;

use crate::models::TimeWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    NonPositiveWidth(i64),
    InvertedHorizon { start: i64, end: i64 },
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveWidth(w) => write!(f, "window width must be positive, got {}", w),
            Self::InvertedHorizon { start, end } => {
                write!(f, "horizon start {} is after end {}", start, end)
            }
        }
    }
}

impl std::error::Error for PartitionError {}

/// `[start, start+width), [start+width, start+2·width), …` with the final
/// window clipped to `end`. `start == end` yields no windows.
pub fn partition(start: i64, end: i64, width: i64) -> Result<Vec<TimeWindow>, PartitionError> {
    if width <= 0 {
        return Err(PartitionError::NonPositiveWidth(width));
    }
    if start > end {
        return Err(PartitionError::InvertedHorizon { start, end });
    }

    let mut windows = Vec::with_capacity(((end - start) / width + 1) as usize);
    let mut cursor = start;
    let mut id = 0u32;
    while cursor < end {
        let next = cursor.saturating_add(width).min(end);
        windows.push(TimeWindow::new(id, cursor, next));
        cursor = next;
        id += 1;
    }
    Ok(windows)
}

/// Horizon `[now - lookback, now)`.
pub fn horizon_ending_at(now_ms: i64, lookback_ms: i64) -> Result<TimeWindow, PartitionError> {
    if lookback_ms < 0 {
        return Err(PartitionError::InvertedHorizon {
            start: now_ms.saturating_sub(lookback_ms),
            end: now_ms,
        });
    }
    Ok(TimeWindow::new(0, now_ms.saturating_sub(lookback_ms), now_ms))
}
