// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

use crate::data::Timestamp;
use std::fmt;

/// A timestamp extended with one round counter per enclosing iteration.
///
/// The outer timestamp is the logical time of the input batch being processed.
/// Each iterative scope pushes a round counter which advances once per pass
/// over the loop body, so times are ordered lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopTime {
    outer: Timestamp,
    rounds: Vec<u32>,
}

impl LoopTime {
    pub fn root(outer: Timestamp) -> Self {
        LoopTime {
            outer,
            rounds: Vec::new(),
        }
    }

    #[inline]
    pub fn outer(&self) -> Timestamp {
        self.outer
    }

    /// Nesting depth, 0 outside of any iteration
    #[inline]
    pub fn depth(&self) -> usize {
        self.rounds.len()
    }

    /// Round of the innermost iteration
    #[inline]
    pub fn round(&self) -> Option<u32> {
        self.rounds.last().copied()
    }

    /// Time of the first round in a nested scope
    pub fn enter(&self) -> LoopTime {
        let mut rounds = self.rounds.clone();
        rounds.push(0);
        LoopTime {
            outer: self.outer,
            rounds,
        }
    }

    /// Moves the innermost round forward
    pub fn advance(&mut self) {
        if let Some(r) = self.rounds.last_mut() {
            *r += 1;
        }
    }

    /// Time in the enclosing scope
    pub fn leave(&self) -> LoopTime {
        let mut rounds = self.rounds.clone();
        rounds.pop();
        LoopTime {
            outer: self.outer,
            rounds,
        }
    }
}

impl fmt::Display for LoopTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.outer)?;
        for r in &self.rounds {
            write!(f, ".{}", r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_time_order_test() {
        let root = LoopTime::root(Timestamp(4));
        let mut inner = root.enter();
        assert_eq!(inner.round(), Some(0));
        let first = inner.clone();
        inner.advance();
        assert!(first < inner);
        assert!(inner < LoopTime::root(Timestamp(5)).enter());
        assert_eq!(inner.leave(), root);
        assert_eq!(inner.to_string(), "4.1");
        assert_eq!(inner.depth(), 1);
    }
}
