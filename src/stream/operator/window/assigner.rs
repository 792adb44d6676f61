// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use serde::{Deserialize, Serialize};

/// Decides which windows a point in window time belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowAssigner {
    /// Non-overlapping windows of `length`
    Tumbling { length: i64 },
    /// Windows of `length` starting every `slide`
    Sliding { length: i64, slide: i64 },
}

impl WindowAssigner {
    pub fn tumbling(length: i64) -> Self {
        WindowAssigner::Tumbling { length }
    }

    pub fn sliding(length: i64, slide: i64) -> Self {
        WindowAssigner::Sliding { length, slide }
    }

    #[inline]
    pub fn length(&self) -> i64 {
        match self {
            WindowAssigner::Tumbling { length } => *length,
            WindowAssigner::Sliding { length, .. } => *length,
        }
    }

    #[inline]
    pub fn slide(&self) -> i64 {
        match self {
            WindowAssigner::Tumbling { length } => *length,
            WindowAssigner::Sliding { slide, .. } => *slide,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let (length, slide) = (self.length(), self.slide());
        if length <= 0 || slide <= 0 {
            return Err(format!(
                "window length and slide must be positive, got {} and {}",
                length, slide
            ));
        }
        if length < slide {
            return Err("window length lower than slide".to_string());
        }
        if length % slide != 0 {
            return Err("window length not divisible by slide".to_string());
        }
        Ok(())
    }

    /// The `[start, end)` bounds of every window containing `t`, ordered by start
    pub fn windows(&self, t: i64) -> Vec<(i64, i64)> {
        let (length, slide) = (self.length(), self.slide());
        let last_start = t.div_euclid(slide).saturating_mul(slide);
        let mut windows = Vec::with_capacity((length / slide) as usize);
        let mut start = last_start;
        while start.saturating_add(length) > t {
            windows.push((start, start.saturating_add(length)));
            start = match start.checked_sub(slide) {
                Some(s) => s,
                None => break,
            };
        }
        windows.reverse();
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_test() {
        let assigner = WindowAssigner::tumbling(10);
        assert_eq!(assigner.windows(0), vec![(0, 10)]);
        assert_eq!(assigner.windows(19), vec![(10, 20)]);
        assert_eq!(assigner.windows(-1), vec![(-10, 0)]);
    }

    #[test]
    fn sliding_test() {
        let assigner = WindowAssigner::sliding(10, 5);
        assert_eq!(assigner.windows(7), vec![(0, 10), (5, 15)]);
        assert_eq!(assigner.windows(10), vec![(5, 15), (10, 20)]);
    }

    #[test]
    fn validate_test() {
        assert!(WindowAssigner::tumbling(0).validate().is_err());
        assert!(WindowAssigner::sliding(10, 3).validate().is_err());
        assert!(WindowAssigner::sliding(5, 10).validate().is_err());
        assert!(WindowAssigner::sliding(10, 5).validate().is_ok());
    }
}
