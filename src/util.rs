//! Small shared utilities.

/// A resource that must be released exactly once.
///
/// `close` must be idempotent: the multi-closer guarantees it calls each
/// registered handle once, but handles may also be closed directly.
pub trait Close: Send {
    /// Release the underlying resource.
    fn close(&mut self);
}

/// Collects close handles opened during one request and releases them all
/// when the request scope ends, successfully or not.
///
/// Closing is explicit and scope-bound; nothing is left to finalization
/// order.
#[derive(Default)]
pub struct MultiCloser {
    handles: Vec<Box<dyn Close>>,
}

impl MultiCloser {
    /// An empty closer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle to be closed when this closer closes.
    pub fn add(&mut self, handle: impl Close + 'static) {
        self.handles.push(Box::new(handle));
    }

    /// Close all registered handles, in registration order. Idempotent.
    pub fn close_all(&mut self) {
        for handle in &mut self.handles {
            handle.close();
        }
        self.handles.clear();
    }
}

impl Drop for MultiCloser {
    fn drop(&mut self) {
        self.close_all();
    }
}
