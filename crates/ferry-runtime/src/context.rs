//! Per-thread execution context
//!
//! Native threads may call a thunk without ever having been seen by the
//! embedding system. The first upcall on such a thread attaches a
//! [`ThreadContext`]; later upcalls reuse it. The context also carries the
//! out-of-band error channel read with [`take_last_error`].

use crate::error::UpcallError;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ATTACH_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

/// Managed execution state of one native thread
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadContext {
    id: u64,
    upcalls: u64,
    depth: u32,
    last_error: Option<UpcallError>,
}

impl ThreadContext {
    fn new() -> Self {
        Self {
            id: NEXT_ATTACH_ID.fetch_add(1, Ordering::Relaxed),
            upcalls: 0,
            depth: 0,
            last_error: None,
        }
    }

    /// Snapshot of the calling thread's context, `None` before the first upcall
    pub fn current() -> Option<ThreadContext> {
        CONTEXT.try_with(|c| c.borrow().clone()).ok().flatten()
    }

    /// Process-unique attach id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Upcalls entered on this thread
    pub fn upcalls(&self) -> u64 {
        self.upcalls
    }

    /// Upcalls currently running on this thread (more than one when nested)
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn last_error(&self) -> Option<&UpcallError> {
        self.last_error.as_ref()
    }
}

fn with_context<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Option<R> {
    CONTEXT
        .try_with(|cell| {
            let mut slot = cell.borrow_mut();
            let context = slot.get_or_insert_with(|| {
                let context = ThreadContext::new();
                tracing::debug!(
                    attach_id = context.id,
                    thread = ?std::thread::current().id(),
                    "attached native thread"
                );
                context
            });
            f(context)
        })
        .ok()
}

/// Attach the calling thread if needed and return its attach id
///
/// Returns `None` only while the thread's locals are being torn down.
pub fn attach() -> Option<u64> {
    with_context(|c| c.id)
}

/// Whether the calling thread has entered an upcall before
pub fn is_attached() -> bool {
    CONTEXT
        .try_with(|c| c.borrow().is_some())
        .unwrap_or(false)
}

/// Marks one upcall as running on this thread until dropped
pub(crate) struct DepthGuard {
    _private: (),
}

pub(crate) fn enter() -> DepthGuard {
    with_context(|c| {
        c.upcalls += 1;
        c.depth += 1;
    });
    DepthGuard { _private: () }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        with_context(|c| c.depth = c.depth.saturating_sub(1));
    }
}

/// Store `error` as the calling thread's last upcall failure
pub(crate) fn record_error(error: UpcallError) {
    with_context(|c| c.last_error = Some(error));
}

/// Take the last upcall failure recorded on the calling thread
///
/// The channel holds a single error; a later failure replaces an unread one.
pub fn take_last_error() -> Option<UpcallError> {
    CONTEXT
        .try_with(|c| c.borrow_mut().as_mut().and_then(|c| c.last_error.take()))
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetError;

    #[test]
    fn test_attach_is_lazy_and_stable() {
        std::thread::spawn(|| {
            assert!(!is_attached());
            assert!(ThreadContext::current().is_none());
            let first = attach().unwrap();
            assert_eq!(attach(), Some(first));
            assert!(is_attached());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_threads_get_distinct_ids() {
        let a = std::thread::spawn(|| attach().unwrap()).join().unwrap();
        let b = std::thread::spawn(|| attach().unwrap()).join().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_depth_tracks_nesting() {
        std::thread::spawn(|| {
            let outer = enter();
            {
                let _inner = enter();
                assert_eq!(ThreadContext::current().unwrap().depth(), 2);
            }
            assert_eq!(ThreadContext::current().unwrap().depth(), 1);
            drop(outer);
            let context = ThreadContext::current().unwrap();
            assert_eq!(context.depth(), 0);
            assert_eq!(context.upcalls(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_error_channel_is_taken_once() {
        std::thread::spawn(|| {
            assert_eq!(take_last_error(), None);
            record_error(TargetError::Raised("first".into()).into());
            record_error(TargetError::Raised("second".into()).into());
            assert_eq!(
                take_last_error(),
                Some(UpcallError::NativeTransition(TargetError::Raised("second".into())))
            );
            assert_eq!(take_last_error(), None);
        })
        .join()
        .unwrap();
    }
}
