/// Progress Reporting - per-phase sync events on the database message queue
///
/// Each sync phase opens a scoped `Progress` reporter: `start()` publishes
/// the total amount of work, `step()`/`add()` publish increments, and drop
/// publishes a closing message on every exit path - including errors - so
/// consumers always see the phase end.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;

/// A declared progress event: name plus the unit its counters are measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub name: &'static str,
    pub unit: &'static str,
}

/// One message on the database message queue
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    pub event: String,
    pub data: Value,
}

pub type ProgressQueue = UnboundedSender<ProgressMessage>;

fn publish(queue: &ProgressQueue, event: Event, data: Value) {
    // receiver gone means the daemon is shutting down; progress is best effort
    let _ = queue.send(ProgressMessage {
        event: event.name.to_string(),
        data,
    });
}

/// Payload keyed by the event's unit, e.g. `{"txs": 20000}`
fn unit_payload(unit: &str, n: u64, delta: bool) -> Value {
    let mut map = Map::new();
    map.insert(unit.to_string(), Value::from(n));
    if delta {
        map.insert("delta".to_string(), Value::from(true));
    }
    Value::Object(map)
}

/// Scoped phase reporter used by the sync coordinator
pub struct Progress {
    queue: ProgressQueue,
    event: Event,
    steps_done: u64,
}

impl Progress {
    pub fn new(queue: ProgressQueue, event: Event) -> Self {
        Self {
            queue,
            event,
            steps_done: 0,
        }
    }

    /// Publish the phase total in the event's unit
    pub fn start(&mut self, total: u64) {
        publish(&self.queue, self.event, unit_payload(self.event.unit, total, false));
    }

    /// Publish the phase totals with extra context (block phase main event)
    pub fn start_with_extras(&mut self, data: Value) {
        publish(&self.queue, self.event, data);
    }

    /// Publish completion of one planning step
    pub fn step(&mut self) {
        self.steps_done += 1;
        publish(&self.queue, self.event, json!({ "step": self.steps_done }));
    }

    /// Publish completion of `n` units of work
    pub fn add(&mut self, n: u64) {
        publish(&self.queue, self.event, unit_payload(self.event.unit, n, true));
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        publish(&self.queue, self.event, json!({ "done": true }));
    }
}

/// Lightweight publisher handed to phase workers for flush-time updates.
/// Unlike `Progress` it does not close the phase on drop - the coordinator
/// owns the phase scope.
#[derive(Clone)]
pub struct ProgressPub {
    queue: ProgressQueue,
    event: Event,
}

impl ProgressPub {
    pub fn new(queue: ProgressQueue, event: Event) -> Self {
        Self { queue, event }
    }

    pub fn add(&self, n: u64) {
        publish(&self.queue, self.event, unit_payload(self.event.unit, n, true));
    }
}
