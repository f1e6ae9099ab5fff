//! Cross-device synchronisation hooks.

/// Per-tensor synchronisation object installed on a value slot when the
/// tensor crosses an asynchronous device boundary. The executor invokes the
/// `before_*` hooks ahead of a kernel dispatch and the `after_*` hooks once
/// the kernel returns; the provider serialises memory on its own queue.
///
/// Fences are owned by the slot and dropped when the frame is torn down at
/// end of run.
pub trait Fence: Send + Sync {
    fn before_using_as_input(&self, provider_type: &str, queue_id: usize);
    fn before_using_as_output(&self, provider_type: &str, queue_id: usize);
    fn after_used_as_input(&self, queue_id: usize);
    fn after_used_as_output(&self, queue_id: usize);
}
