// Copyright (c) 2020, KTH Royal Institute of Technology.
// SPDX-License-Identifier: AGPL-3.0-only

/// Hash partitioning of the key space across shards
pub mod partition;

pub use reflow_state::Diff;

use crate::error::EvalError;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use twox_hash::XxHash64;

/// Builds a `Vec<Value>` from a list of expressions convertible into [Value]
///
/// ```
/// use reflow::prelude::*;
/// let values = values![1, "a", 2.5];
/// assert_eq!(values[1], Value::from("a"));
/// ```
#[macro_export]
macro_rules! values {
    ($($v:expr),* $(,)?) => {
        vec![$($crate::data::Value::from($v)),*]
    };
}

/// A single column value of a [Row]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Tuple(Arc<[Value]>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::None => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Tuple(_) => 5,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value, integers are widened
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(&**s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(&**t),
            _ => None,
        }
    }

    pub fn tuple(values: Vec<Value>) -> Value {
        Value::Tuple(values.into())
    }

    /// Integer value or an evaluation error naming `what`
    pub fn expect_int(&self, what: &str) -> Result<i64, EvalError> {
        self.as_int()
            .ok_or_else(|| EvalError::new(format!("{} must be an integer, got {}", what, self)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::None, Value::None) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a.iter().cmp(b.iter()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

// Must agree with Eq, floats are therefore hashed by their bit pattern
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::None => {}
            Value::Bool(b) => state.write_u8(*b as u8),
            Value::Int(i) => state.write_i64(*i),
            Value::Float(f) => state.write_u64(f.to_bits()),
            Value::String(s) => {
                state.write(s.as_bytes());
                state.write_u8(0xff);
            }
            Value::Tuple(t) => {
                state.write_u64(t.len() as u64);
                for v in t.iter() {
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Tuple(t) => {
                write!(f, "(")?;
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v.into())
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Tuple(v.into())
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

/// Stable 64-bit row key.
///
/// Keys are xxhash based and therefore identical across runs and machines,
/// which keeps shard assignment stable for replay and recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub u64);

impl Key {
    /// Key used for the missing side of an outer join
    pub const NULL: Key = Key(0);

    #[inline]
    pub fn for_values(values: &[Value]) -> Key {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write_u64(values.len() as u64);
        for v in values {
            v.hash(&mut hasher);
        }
        Key(hasher.finish())
    }

    #[inline]
    pub fn combine(self, other: Key) -> Key {
        let mut hasher = XxHash64::with_seed(1);
        hasher.write_u64(self.0);
        hasher.write_u64(other.0);
        Key(hasher.finish())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An immutable tuple of values together with its stable key.
///
/// Rows are cheap to clone, the values are shared by reference.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Row {
    key: Key,
    values: Arc<[Value]>,
}

impl Row {
    pub fn new(key: Key, values: Vec<Value>) -> Row {
        Row {
            key,
            values: values.into(),
        }
    }

    /// Creates a row keyed by the hash of its values
    pub fn from_values(values: Vec<Value>) -> Row {
        let key = Key::for_values(&values);
        Row::new(key, values)
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[inline]
    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value at `column` or an evaluation error if the row is too narrow
    pub fn column(&self, column: usize) -> Result<&Value, EvalError> {
        self.values.get(column).ok_or_else(|| {
            EvalError::new(format!(
                "column {} out of range for row of width {}",
                column,
                self.values.len()
            ))
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Creates a row with new values that keeps this row's key
    pub fn with_values(&self, values: Vec<Value>) -> Row {
        Row::new(self.key, values)
    }

    /// Values of the given columns, in the given order
    pub fn project(&self, columns: &[usize]) -> Result<Vec<Value>, EvalError> {
        columns
            .iter()
            .map(|c| self.column(*c).map(Clone::clone))
            .collect()
    }

    /// The same values keyed by their hash.
    ///
    /// Rows derived along different paths carry different keys, set
    /// operators compare the normalized form so equal values meet.
    pub fn normalized(&self) -> Row {
        Row {
            key: Key::for_values(&self.values),
            values: self.values.clone(),
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Tuple(self.values.clone()))
    }
}

/// Logical time of a change.
///
/// Timestamps are assigned by sources, one per input batch, and have no relation to wall-clock time.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// The next timestamp, saturating at [Timestamp::MAX]
    #[inline]
    pub fn succ(self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }
}

impl From<u64> for Timestamp {
    fn from(t: u64) -> Self {
        Timestamp(t)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A timestamped, signed-multiplicity delta applied to a row
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Change {
    pub row: Row,
    pub time: Timestamp,
    pub diff: Diff,
}

impl Change {
    #[inline]
    pub fn new(row: Row, time: Timestamp, diff: Diff) -> Change {
        Change { row, time, diff }
    }
    #[inline]
    pub fn insert(row: Row, time: impl Into<Timestamp>) -> Change {
        Change::new(row, time.into(), 1)
    }
    #[inline]
    pub fn retract(row: Row, time: impl Into<Timestamp>) -> Change {
        Change::new(row, time.into(), -1)
    }
    #[inline]
    pub fn negate(mut self) -> Change {
        self.diff = -self.diff;
        self
    }
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.diff > 0
    }
    #[inline]
    pub fn is_retract(&self) -> bool {
        self.diff < 0
    }
}

/// Sorts `changes` by time and row, sums the multiplicities of identical
/// (row, time) pairs and removes those that cancel out.
pub fn consolidate(changes: &mut Vec<Change>) {
    changes.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.row.cmp(&b.row)));
    let mut merged: Vec<Change> = Vec::with_capacity(changes.len());
    for change in changes.drain(..) {
        match merged.last_mut() {
            Some(last) if last.time == change.time && last.row == change.row => {
                last.diff += change.diff;
            }
            _ => merged.push(change),
        }
    }
    merged.retain(|c| c.diff != 0);
    *changes = merged;
}

/// Consolidates (row, diff) pairs of a single time
pub fn consolidate_updates(updates: &mut Vec<(Row, Diff)>) {
    updates.sort_by(|a, b| a.0.cmp(&b.0));
    let mut merged: Vec<(Row, Diff)> = Vec::with_capacity(updates.len());
    for (row, diff) in updates.drain(..) {
        match merged.last_mut() {
            Some(last) if last.0 == row => last.1 += diff,
            _ => merged.push((row, diff)),
        }
    }
    merged.retain(|(_, d)| *d != 0);
    *updates = merged;
}

/// Sum of the multiplicities in a batch of changes
pub fn net_count(changes: &[Change]) -> Diff {
    changes.iter().map(|c| c.diff).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_order_test() {
        let mut values = vec![
            Value::from("b"),
            Value::Float(1.5),
            Value::Int(3),
            Value::None,
            Value::Int(-1),
            Value::Bool(true),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::None,
                Value::Bool(true),
                Value::Int(-1),
                Value::Int(3),
                Value::Float(1.5),
                Value::from("b"),
            ]
        );
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn key_stability_test() {
        let a = Key::for_values(&values![1, "x"]);
        let b = Key::for_values(&values![1, "x"]);
        let c = Key::for_values(&values!["x", 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.combine(c), c.combine(a));
    }

    #[test]
    fn project_test() {
        let row = Row::from_values(values![1, "a", 2.0]);
        assert_eq!(row.project(&[2, 0]).unwrap(), values![2.0, 1]);
        assert!(row.project(&[3]).is_err());
        let moved = row.with_values(values![5]);
        assert_eq!(moved.key(), row.key());
        assert_ne!(moved, Row::from_values(values![5]));
        assert_eq!(moved.normalized(), Row::from_values(values![5]));
    }

    #[test]
    fn consolidate_test() {
        let a = Row::from_values(values![1]);
        let b = Row::from_values(values![2]);
        let mut changes = vec![
            Change::insert(b.clone(), 2),
            Change::insert(a.clone(), 1),
            Change::retract(b.clone(), 2),
            Change::new(a.clone(), Timestamp(1), 2),
            Change::insert(b.clone(), 1),
        ];
        consolidate(&mut changes);
        assert_eq!(changes.len(), 2);
        assert_eq!(net_count(&changes), 4);
        assert!(changes
            .iter()
            .all(|c| c.time == Timestamp(1) && c.diff > 0));
    }
}
