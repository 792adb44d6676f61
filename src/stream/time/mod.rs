// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

mod nested;

pub use nested::LoopTime;

use crate::data::Timestamp;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// The boundary below which no further changes occur.
///
/// A frontier at `t` promises that every future change has a timestamp `>= t`.
/// A closed frontier promises that no change will ever arrive again and
/// orders above every open frontier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frontier(Option<Timestamp>);

impl Frontier {
    /// Frontier of a stream that has not produced anything yet
    pub const MIN: Frontier = Frontier(Some(Timestamp::MIN));

    #[inline]
    pub const fn at(time: Timestamp) -> Frontier {
        Frontier(Some(time))
    }

    #[inline]
    pub const fn closed() -> Frontier {
        Frontier(None)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.is_none()
    }

    /// The lower bound on future timestamps, `None` when closed
    #[inline]
    pub fn time(&self) -> Option<Timestamp> {
        self.0
    }

    /// Returns true if a change at `time` can no longer arrive
    #[inline]
    pub fn passed(&self, time: Timestamp) -> bool {
        match self.0 {
            Some(t) => time < t,
            None => true,
        }
    }

    /// The smaller of two frontiers
    #[inline]
    pub fn meet(self, other: Frontier) -> Frontier {
        std::cmp::min(self, other)
    }
}

impl Default for Frontier {
    fn default() -> Self {
        Frontier::MIN
    }
}

impl From<Timestamp> for Frontier {
    fn from(time: Timestamp) -> Self {
        Frontier::at(time)
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Frontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(f, "{}", t),
            None => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_order_test() {
        let a = Frontier::at(Timestamp(3));
        let b = Frontier::at(Timestamp(5));
        assert!(a < b);
        assert!(b < Frontier::closed());
        assert_eq!(b.meet(a), a);
        assert_eq!(Frontier::closed().meet(b), b);
        assert_eq!(Frontier::default(), Frontier::MIN);
    }

    #[test]
    fn frontier_passed_test() {
        let f = Frontier::at(Timestamp(3));
        assert!(f.passed(Timestamp(2)));
        assert!(!f.passed(Timestamp(3)));
        assert!(Frontier::closed().passed(Timestamp::MAX));
        assert!(!Frontier::MIN.passed(Timestamp::MIN));
    }
}
