use std::sync::atomic::{AtomicPtr, Ordering};

/// A write-once slot.  Similar to an `Option<Box<T>>`, but can be published
/// atomically and read without locks.  Once a value has been stored it is
/// never replaced, so a reader that observes `Some` may hold the reference
/// for as long as the slot itself lives.
pub struct OncePtr<T> {
    inner: AtomicPtr<T>,
}

impl<T> OncePtr<T> {
    pub const fn new() -> OncePtr<T> {
        Self {
            inner: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn get(&self, order: Ordering) -> Option<&T> {
        let ptr = self.inner.load(order);
        unsafe { ptr.as_ref() }
    }

    /// Publish `value` into an empty slot.  Panics if the slot was already
    /// populated: slots are filled exactly once, in segment order, by the
    /// single thread that grows the file.
    pub fn init(&self, value: T) {
        let new_inner = Box::into_raw(Box::new(value));
        let cas_result = self.inner.compare_exchange(
            std::ptr::null_mut(),
            new_inner,
            Ordering::Release,
            Ordering::Relaxed,
        );
        if cas_result.is_err() {
            drop(unsafe { Box::from_raw(new_inner) });
            panic!("OncePtr initialized twice");
        }
    }
}

impl<T> Default for OncePtr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OncePtr<T> {
    fn drop(&mut self) {
        let ptr = *self.inner.get_mut();
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

unsafe impl<T: Send> Send for OncePtr<T> {}
unsafe impl<T: Send + Sync> Sync for OncePtr<T> {}
