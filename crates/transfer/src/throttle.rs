use std::future::Future;

/// Paces the payload bytes moved by the streaming engine.
///
/// The engine calls [`acquire`](Throttle::acquire) before every socket read
/// or write, caps the operation to the returned quota, and reports the bytes
/// actually moved through [`consume`](Throttle::consume).
pub trait Throttle: Sync {
    /// Waits until at least one byte may move and returns how many may move
    /// now. The result is always within `1..=want` for `want > 0`.
    fn acquire(&self, want: usize) -> impl Future<Output = usize> + Send;

    /// Records bytes that were actually transferred.
    fn consume(&self, used: usize);
}

/// No pacing at all. Used by the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unthrottled;

impl Throttle for Unthrottled {
    fn acquire(&self, want: usize) -> impl Future<Output = usize> + Send {
        std::future::ready(want)
    }

    fn consume(&self, _used: usize) {}
}
