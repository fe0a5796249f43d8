use chrono::{DateTime, Utc};

/// A recorded fact in an orchestration history.
///
/// Events are immutable and append-only; the `event_type` string is what
/// history readers use to pick a decoder.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "sale_item.status_changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (wall-clock time at decision).
    fn occurred_at(&self) -> DateTime<Utc>;
}
