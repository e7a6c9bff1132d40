#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;

use rundag::events::{ChannelSink, StateEvent};
use rundag::state::RetryPolicy;
use std::time::Duration;
use tokio::sync::mpsc;

pub use rundag_test_utils::{init_tracing, with_timeout};

pub type TestResult = Result<(), Box<dyn Error>>;

/// Retry policy with millisecond delays and no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)).without_jitter()
}

/// A channel sink plus its receiver, already wrapped for `with_event_sink`.
pub fn channel_sink() -> (
    Arc<dyn rundag::events::EventSink>,
    mpsc::UnboundedReceiver<StateEvent>,
) {
    let (sink, rx) = ChannelSink::new();
    (Arc::new(sink), rx)
}

/// Drain every event already sent to `rx`.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<StateEvent>) -> Vec<StateEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
