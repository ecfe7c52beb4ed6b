//! Single-pass document cursor returned by `Collection::query`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::document::Document;
use crate::util::Close;

use super::error::BackendError;

/// Produces the documents of one query, in order. Finite and single-pass.
pub trait DocumentStream: Send {
    /// The next document, or `None` when drained.
    fn next_document(&mut self) -> Result<Option<Document>, BackendError>;
}

impl DocumentStream for VecDeque<Document> {
    fn next_document(&mut self) -> Result<Option<Document>, BackendError> {
        Ok(self.pop_front())
    }
}

struct CursorState {
    stream: Option<Box<dyn DocumentStream>>,
}

/// A closeable, single-pass cursor over query results.
///
/// The cursor and its [close handles](DocumentCursor::close_handle) share
/// one underlying stream; whichever closes first releases it, and every
/// later close is a no-op. The handler that opens a cursor registers a
/// close handle with the request's `MultiCloser` and keeps the cursor for
/// iteration.
pub struct DocumentCursor {
    state: Arc<Mutex<CursorState>>,
}

impl DocumentCursor {
    /// Wrap a stream implementation.
    pub fn new(stream: impl DocumentStream + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(CursorState {
                stream: Some(Box::new(stream)),
            })),
        }
    }

    /// An empty, already-drained cursor.
    pub fn empty() -> Self {
        Self::new(VecDeque::new())
    }

    /// The next document; `None` once drained or closed.
    pub fn next_document(&mut self) -> Result<Option<Document>, BackendError> {
        let mut state = self.state.lock();
        match state.stream.as_mut() {
            Some(stream) => {
                let next = stream.next_document()?;
                if next.is_none() {
                    // Drained; release the stream eagerly.
                    state.stream = None;
                }
                Ok(next)
            }
            None => Ok(None),
        }
    }

    /// Drain the remaining documents and close.
    pub fn collect_remaining(&mut self) -> Result<Vec<Document>, BackendError> {
        let mut docs = Vec::new();
        while let Some(doc) = self.next_document()? {
            docs.push(doc);
        }
        Ok(docs)
    }

    /// A handle that closes this cursor's underlying stream.
    pub fn close_handle(&self) -> CursorCloseHandle {
        CursorCloseHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Close for DocumentCursor {
    fn close(&mut self) {
        self.state.lock().stream = None;
    }
}

/// Detached close handle for a [`DocumentCursor`].
pub struct CursorCloseHandle {
    state: Arc<Mutex<CursorState>>,
}

impl Close for CursorCloseHandle {
    fn close(&mut self) {
        self.state.lock().stream = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::doc;
    use crate::document::Value;
    use crate::util::MultiCloser;

    // Counts drops of the underlying stream, standing in for a real
    // backend resource release.
    struct TrackedStream {
        docs: VecDeque<Document>,
        drops: Arc<AtomicUsize>,
    }

    impl DocumentStream for TrackedStream {
        fn next_document(&mut self) -> Result<Option<Document>, BackendError> {
            Ok(self.docs.pop_front())
        }
    }

    impl Drop for TrackedStream {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(n: usize) -> (DocumentCursor, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let docs = (0..n)
            .map(|i| doc! {"_id" => Value::Int32(i as i32)})
            .collect();
        let cursor = DocumentCursor::new(TrackedStream {
            docs,
            drops: Arc::clone(&drops),
        });
        (cursor, drops)
    }

    #[test]
    fn iterates_in_order_then_drains() {
        let (mut cursor, _drops) = tracked(3);
        for i in 0..3 {
            let doc = cursor.next_document().unwrap().unwrap();
            assert_eq!(doc.get("_id"), Some(&Value::Int32(i)));
        }
        assert!(cursor.next_document().unwrap().is_none());
        assert!(cursor.next_document().unwrap().is_none());
    }

    #[test]
    fn close_is_idempotent_and_releases_once() {
        let (cursor, drops) = tracked(3);
        let mut a = cursor.close_handle();
        let mut b = cursor.close_handle();

        a.close();
        a.close();
        b.close();
        drop(cursor);

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multicloser_closes_underlying_resource_exactly_once() {
        let (mut cursor, drops) = tracked(2);
        let mut closer = MultiCloser::new();
        closer.add(cursor.close_handle());

        assert!(cursor.next_document().unwrap().is_some());
        closer.close_all();

        assert!(cursor.next_document().unwrap().is_none());
        drop(closer);
        drop(cursor);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
