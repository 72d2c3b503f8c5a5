//! spindle runtime metrics.
//!
//! Process-wide counters for task lifecycle, promise rejections and pipe
//! throughput, registered with metriken for exposition.

use metriken::{Counter, Gauge, metric};

// ── Tasks ────────────────────────────────────────────────────────

#[metric(name = "spindle/tasks/spawned", description = "Total tasks spawned")]
pub static TASKS_SPAWNED: Counter = Counter::new();

#[metric(
    name = "spindle/tasks/completed",
    description = "Total tasks that ran to completion"
)]
pub static TASKS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "spindle/tasks/cancelled",
    description = "Total tasks dropped before completion"
)]
pub static TASKS_CANCELLED: Counter = Counter::new();

#[metric(name = "spindle/tasks/active", description = "Currently live tasks")]
pub static TASKS_ACTIVE: Gauge = Gauge::new();

// ── Promises ─────────────────────────────────────────────────────

#[metric(
    name = "spindle/promise/unobserved_rejections",
    description = "Promises dropped with an error nobody observed"
)]
pub static UNOBSERVED_REJECTIONS: Counter = Counter::new();

// ── Pipes ────────────────────────────────────────────────────────

#[metric(
    name = "spindle/pipe/bytes_written",
    description = "Bytes pushed into non-blocking write pipes"
)]
pub static PIPE_BYTES_WRITTEN: Counter = Counter::new();

#[metric(
    name = "spindle/pipe/backpressure",
    description = "Times a pipe write crossed its high-water mark"
)]
pub static PIPE_BACKPRESSURE: Counter = Counter::new();
