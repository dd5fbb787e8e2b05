//! Translation of executor counter deltas into service counter updates.
//!
//! Pipeline executors accumulate counters while processing a work item and
//! surface the deltas when the item completes. The service understands a
//! narrower vocabulary than executors track, so translation filters as it
//! converts: zero deltas are elided, empty means are elided, and counter
//! shapes the service has no encoding for are dropped with a debug log.

use serde::Serialize;

/// Aggregation kind of a counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum CounterKind {
    /// Values are summed.
    Sum,
    /// The maximum value wins.
    Max,
    /// The minimum value wins.
    Min,
    /// Arithmetic mean; carries an element count alongside the aggregate.
    Mean,
    /// Full value distribution. Tracked by executors, not encodable for the
    /// service.
    Distribution,
}

/// Aggregate payload of a counter delta as produced by an executor.
#[derive(Clone, Debug, PartialEq)]
pub enum CounterAggregate {
    /// 64-bit integer aggregate.
    Int64(i64),
    /// 32-bit integer aggregate; widened to 64 bits on translation.
    Int32(i32),
    /// Floating-point aggregate.
    Double(f64),
    /// Free-form aggregate with no service encoding.
    Text(String),
}

/// One counter delta surfaced by an executor after a work item completes.
#[derive(Clone, Debug)]
pub struct CounterSnapshot {
    /// Counter name, scoped by the user pipeline.
    pub name: String,
    /// Aggregation kind.
    pub kind: CounterKind,
    /// Aggregate payload.
    pub aggregate: CounterAggregate,
    /// Number of elements folded into a [`CounterKind::Mean`] aggregate.
    /// Ignored for other kinds.
    pub mean_count: i64,
}

/// Scalar counter value in the service's vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum CounterValue {
    /// Integer scalar.
    Int64(i64),
    /// Floating-point scalar.
    Double(f64),
}

/// A counter update attached to a work-item commit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CounterUpdate {
    /// Counter name.
    pub name: String,
    /// Aggregation kind.
    pub kind: CounterKind,
    /// Scalar delta.
    pub value: CounterValue,
    /// Element count for mean counters.
    pub mean_count: Option<i64>,
}

impl CounterUpdate {
    pub(crate) fn encoded_len(&self) -> usize {
        // name + kind tag + 8-byte scalar + optional 8-byte count
        self.name.len() + 1 + 8 + self.mean_count.map_or(0, |_| 8)
    }
}

/// Translate executor counter deltas into commit counter updates.
///
/// Deltas that cannot or need not be reported are skipped: zero-valued
/// aggregates, means over zero elements, and kinds or aggregate payloads the
/// service has no encoding for.
pub fn translate_counters(snapshots: Vec<CounterSnapshot>) -> Vec<CounterUpdate> {
    let mut updates = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let mean_count = match snapshot.kind {
            CounterKind::Sum | CounterKind::Max | CounterKind::Min => None,
            CounterKind::Mean => {
                if snapshot.mean_count <= 0 {
                    continue;
                }
                Some(snapshot.mean_count)
            }
            other => {
                tracing::debug!(
                    counter = %snapshot.name,
                    kind = ?other,
                    "skipping counter with unhandled kind"
                );
                continue;
            }
        };

        let value = match snapshot.aggregate {
            CounterAggregate::Int64(v) if v != 0 => CounterValue::Int64(v),
            CounterAggregate::Int32(v) if v != 0 => {
                CounterValue::Int64(i64::from(v))
            }
            CounterAggregate::Double(v) if v != 0.0 => CounterValue::Double(v),
            CounterAggregate::Int64(_)
            | CounterAggregate::Int32(_)
            | CounterAggregate::Double(_) => continue,
            ref other => {
                tracing::debug!(
                    counter = %snapshot.name,
                    aggregate = ?other,
                    "skipping counter with unhandled aggregate payload"
                );
                continue;
            }
        };

        updates.push(CounterUpdate {
            name: snapshot.name,
            kind: snapshot.kind,
            value,
            mean_count,
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        name: &str,
        kind: CounterKind,
        aggregate: CounterAggregate,
        mean_count: i64,
    ) -> CounterSnapshot {
        CounterSnapshot {
            name: name.to_string(),
            kind,
            aggregate,
            mean_count,
        }
    }

    #[test]
    fn test_sum_counter_translates() {
        let updates = translate_counters(vec![snapshot(
            "records",
            CounterKind::Sum,
            CounterAggregate::Int64(42),
            0,
        )]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value, CounterValue::Int64(42));
        assert_eq!(updates[0].mean_count, None);
    }

    #[test]
    fn test_int32_widens_to_int64() {
        let updates = translate_counters(vec![snapshot(
            "small",
            CounterKind::Max,
            CounterAggregate::Int32(7),
            0,
        )]);
        assert_eq!(updates[0].value, CounterValue::Int64(7));
    }

    #[test]
    fn test_zero_aggregates_omitted() {
        let updates = translate_counters(vec![
            snapshot("a", CounterKind::Sum, CounterAggregate::Int64(0), 0),
            snapshot("b", CounterKind::Min, CounterAggregate::Int32(0), 0),
            snapshot("c", CounterKind::Sum, CounterAggregate::Double(0.0), 0),
        ]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_empty_mean_omitted() {
        let updates = translate_counters(vec![snapshot(
            "latency",
            CounterKind::Mean,
            CounterAggregate::Double(12.5),
            0,
        )]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_mean_carries_count() {
        let updates = translate_counters(vec![snapshot(
            "latency",
            CounterKind::Mean,
            CounterAggregate::Double(12.5),
            4,
        )]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].mean_count, Some(4));
        assert_eq!(updates[0].value, CounterValue::Double(12.5));
    }

    #[test]
    fn test_unhandled_kind_skipped() {
        let updates = translate_counters(vec![snapshot(
            "histogram",
            CounterKind::Distribution,
            CounterAggregate::Int64(9),
            0,
        )]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_unhandled_aggregate_skipped() {
        let updates = translate_counters(vec![snapshot(
            "label",
            CounterKind::Sum,
            CounterAggregate::Text("oops".to_string()),
            0,
        )]);
        assert!(updates.is_empty());
    }
}
