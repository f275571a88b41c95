//! Execution Timeline
//!
//! Start, completion and failure times of every graph node of a job, for
//! run summaries and a text Gantt chart.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Width of the Gantt bar area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the node label column.
const LABEL_WIDTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Graph node key, e.g. `step.align`
    pub node: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Span of one node between its start and its last settling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpan {
    pub start_ms: u128,
    pub end_ms: Option<u128>,
    pub failed: bool,
}

impl NodeSpan {
    pub fn duration_ms(&self) -> Option<u128> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, node: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            node: node.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn offset_ms(&self, event: &TimelineEvent) -> u128 {
        event.timestamp.duration_since(self.start_time).as_millis()
    }

    /// Span of every node that started, keyed by node.
    pub fn spans(&self) -> BTreeMap<String, NodeSpan> {
        let mut spans: BTreeMap<String, NodeSpan> = BTreeMap::new();

        for event in &self.events {
            let offset = self.offset_ms(event);
            match event.event_type {
                EventType::Started => {
                    spans.insert(
                        event.node.clone(),
                        NodeSpan {
                            start_ms: offset,
                            end_ms: None,
                            failed: false,
                        },
                    );
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.get_mut(&event.node) {
                        span.end_ms = Some(offset);
                        span.failed = event.event_type == EventType::Failed;
                    }
                }
            }
        }

        spans
    }

    /// Duration in milliseconds of every settled node.
    pub fn durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(node, span)| span.duration_ms().map(|d| (node, d)))
            .collect()
    }

    /// Nodes whose last event is a failure.
    pub fn failed_nodes(&self) -> Vec<String> {
        self.spans()
            .into_iter()
            .filter(|(_, span)| span.failed)
            .map(|(node, _)| node)
            .collect()
    }

    /// ASCII Gantt chart of settled nodes, in start order.
    ///
    /// Failed nodes are drawn with `x` instead of `#`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.start_time.elapsed().as_millis();
        if total == 0 {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        let mut spans: Vec<(String, NodeSpan)> = self.spans().into_iter().collect();
        spans.sort_by_key(|(_, span)| span.start_ms);

        for (node, span) in spans {
            let Some(duration) = span.duration_ms() else {
                continue;
            };
            let offset = (span.start_ms as f64 * scale) as usize;
            let width = (duration as f64 * scale).max(1.0) as usize;
            let mark = if span.failed { "x" } else { "#" };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                truncate(&node, LABEL_WIDTH),
                " ".repeat(offset),
                mark.repeat(width),
                duration
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or cuts `s` to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
