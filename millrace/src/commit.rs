//! Work-item commit requests and the per-computation output queues that
//! stage them for the commit aggregator.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::counters::CounterUpdate;

/// A message produced by a work item, addressed to a downstream stream tag.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputMessage {
    /// Destination stream tag.
    pub tag: String,
    /// Event timestamp in microseconds.
    pub timestamp_micros: i64,
    /// Encoded message payload.
    pub data: Vec<u8>,
}

/// A keyed-state mutation produced by a work item.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueUpdate {
    /// State tag within the item's key.
    pub tag: Vec<u8>,
    /// New encoded value.
    pub data: Vec<u8>,
}

/// Everything a single work item produced, acknowledged atomically by the
/// service under `(key, work_token)`.
#[derive(Clone, Debug)]
pub struct WorkItemCommit {
    /// Key the work item was leased under.
    pub key: Vec<u8>,
    /// Lease token the commit answers.
    pub work_token: u64,
    /// Messages for downstream computations.
    pub output_messages: Vec<OutputMessage>,
    /// Keyed-state mutations.
    pub value_updates: Vec<ValueUpdate>,
    /// Counter deltas.
    pub counter_updates: Vec<CounterUpdate>,
}

impl WorkItemCommit {
    /// Serialized size of this commit, used to charge the aggregator's byte
    /// budget. Computed as the sum of component byte lengths plus fixed
    /// per-field overhead, so relative sizes track the wire encoding.
    pub fn encoded_len(&self) -> usize {
        let mut len = self.key.len() + 8;
        for message in &self.output_messages {
            len += message.tag.len() + 8 + message.data.len();
        }
        for update in &self.value_updates {
            len += update.tag.len() + update.data.len();
        }
        for counter in &self.counter_updates {
            len += counter.encoded_len();
        }
        len
    }
}

/// Accumulates the outputs of one in-flight work item.
///
/// A builder is addressed by `(key, work_token)` at creation; the execution
/// context feeds it messages and state mutations while the executor runs,
/// and the harness attaches translated counters before sealing it.
#[derive(Clone, Debug)]
pub struct CommitBuilder {
    key: Vec<u8>,
    work_token: u64,
    output_messages: Vec<OutputMessage>,
    value_updates: Vec<ValueUpdate>,
    counter_updates: Vec<CounterUpdate>,
}

impl CommitBuilder {
    /// Begin a commit addressed by `(key, work_token)`.
    pub fn new(key: Vec<u8>, work_token: u64) -> Self {
        Self {
            key,
            work_token,
            output_messages: Vec::new(),
            value_updates: Vec::new(),
            counter_updates: Vec::new(),
        }
    }

    /// Key this builder is addressed by.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Work token this builder is addressed by.
    pub fn work_token(&self) -> u64 {
        self.work_token
    }

    /// Append an output message.
    pub fn add_output(&mut self, message: OutputMessage) {
        self.output_messages.push(message);
    }

    /// Append a keyed-state mutation.
    pub fn add_value_update(&mut self, update: ValueUpdate) {
        self.value_updates.push(update);
    }

    /// Attach translated counter deltas.
    pub fn add_counter_updates(
        &mut self,
        updates: impl IntoIterator<Item = CounterUpdate>,
    ) {
        self.counter_updates.extend(updates);
    }

    /// Seal the builder into a commit request.
    pub fn build(self) -> WorkItemCommit {
        WorkItemCommit {
            key: self.key,
            work_token: self.work_token,
            output_messages: self.output_messages,
            value_updates: self.value_updates,
            counter_updates: self.counter_updates,
        }
    }
}

/// Concurrent FIFO of commit requests awaiting aggregation.
///
/// Execution workers append; the commit aggregator polls. Order within one
/// queue is preserved end to end.
#[derive(Debug, Default)]
pub struct OutputQueue {
    inner: Mutex<VecDeque<WorkItemCommit>>,
}

impl OutputQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a commit request.
    pub fn push(&self, commit: WorkItemCommit) {
        self.inner.lock().push_back(commit);
    }

    /// Pop the oldest commit request, if any.
    pub fn pop(&self) -> Option<WorkItemCommit> {
        self.inner.lock().pop_front()
    }

    /// Number of commit requests waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
