/// Retry/timeout knobs for [`crate::NetworkTransactor`] (spec.md §4.4, §5).
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// How long a get/pend/commit operation may keep retrying against
    /// alternate coordinators before giving up.
    pub timeout_ms: i64,
    /// Shorter deadline used for the best-effort cancel issued after a
    /// partially-succeeded pend (spec.md §4.4's "Cancellation of an
    /// in-flight pend").
    pub abort_or_cancel_timeout_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config { timeout_ms: 5_000, abort_or_cancel_timeout_ms: 500 }
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
