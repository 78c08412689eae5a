//! Metrics and tracing hooks.
//!
//! Sessions report what they do through an [`Instrumentation`] held on the
//! endpoint. Every method defaults to doing nothing, so a provider overrides
//! only what it exports. [`NoopInstrumentation`] is installed unless another
//! provider is given.

use std::time::Duration;

/// Key/value pairs attached to one measurement.
pub type Attributes<'a> = &'a [(&'a str, &'a str)];

/// Metric and span names reported by sessions.
pub mod names {
    /// Up/down counter of running session actors.
    pub const ACTIVE_SESSIONS: &str = "lumen.sessions.active";
    pub const JOINS: &str = "lumen.sessions.joins";
    /// Tagged with `event`.
    pub const EVENTS: &str = "lumen.events.handled";
    /// Tagged with `info`.
    pub const INFOS: &str = "lumen.info.handled";
    /// Render plus diff, in milliseconds.
    pub const RENDER_TIME: &str = "lumen.render.duration_ms";
    pub const JOIN_SPAN: &str = "lumen.join";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One unit of work, ended exactly once.
pub trait Span: Send {
    fn set_attribute(&mut self, _key: &str, _value: &str) {}

    fn add_event(&mut self, _name: &str) {}

    fn end(self: Box<Self>, _status: SpanStatus) {}
}

pub trait Instrumentation: Send + Sync {
    fn increment_counter(&self, _name: &str, _value: u64, _attrs: Attributes<'_>) {}

    fn update_updown_counter(&self, _name: &str, _delta: i64, _attrs: Attributes<'_>) {}

    fn record_gauge(&self, _name: &str, _value: f64, _attrs: Attributes<'_>) {}

    fn record_histogram(&self, _name: &str, _value: f64, _attrs: Attributes<'_>) {}

    fn start_span(&self, _name: &str, _attrs: Attributes<'_>) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }

    /// Record `elapsed` in a histogram, in milliseconds.
    fn record_duration(&self, name: &str, elapsed: Duration, attrs: Attributes<'_>) {
        self.record_histogram(name, elapsed.as_secs_f64() * 1000.0, attrs);
    }
}

/// End `span` with the status of `result`, noting the error message on failure.
pub fn finish_span<T, E: std::fmt::Display>(mut span: Box<dyn Span>, result: &Result<T, E>) {
    match result {
        Ok(_) => span.end(SpanStatus::Ok),
        Err(e) => {
            span.set_attribute("error.message", &e.to_string());
            span.end(SpanStatus::Error);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpan;

impl Span for NoopSpan {}
