//! Run Monitoring
//!
//! - [`ExecutionTimeline`]: node start/end timing for run summaries and
//!   Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, NodeSpan, TimelineEvent};
