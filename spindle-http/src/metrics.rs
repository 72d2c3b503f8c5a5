//! HTTP/2 connection and stream metrics, registered with metriken.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "spindle_http/connections/active",
    description = "HTTP/2 connections currently open"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "spindle_http/connections/closed",
    description = "HTTP/2 connections that reached the closed state"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "spindle_http/streams/opened",
    description = "Streams opened by either endpoint"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "spindle_http/streams/reset",
    description = "Streams reset locally or by the peer"
)]
pub static STREAMS_RESET: Counter = Counter::new();

#[metric(
    name = "spindle_http/flow_control/stalls",
    description = "Writes that had to wait for a WINDOW_UPDATE"
)]
pub static FLOW_CONTROL_STALLS: Counter = Counter::new();
