//! Emulated device memory.
//!
//! Device allocations and the pinned host staging buffers they are copied
//! through share one representation: a reference-counted, lock-protected
//! array. Stream jobs capture clones of the handle, so a buffer stays alive
//! until the last queued job touching it has run.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use pme_core::PmeError;

use super::stream::GpuStream;

/// Handle to one allocation. Cloning shares the allocation.
#[derive(Debug)]
pub struct SharedBuffer<T> {
    data: Arc<Mutex<Vec<T>>>,
}

/// Memory the stream's jobs operate on.
pub type DeviceBuffer<T> = SharedBuffer<T>;

/// Page-locked host staging memory for asynchronous copies.
pub type PinnedBuffer<T> = SharedBuffer<T>;

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Clone + Default> SharedBuffer<T> {
    /// Default-initialised allocation of `len` elements.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![T::default(); len])
    }

    /// Resets every element to its default value.
    pub fn clear(&self) {
        self.data.lock().iter_mut().for_each(|v| *v = T::default());
    }
}

impl<T: Clone> SharedBuffer<T> {
    pub fn from_slice(values: &[T]) -> Self {
        Self::from_vec(values.to_vec())
    }

    /// Blocking snapshot of the contents.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.lock().clone()
    }

    /// Overwrites the contents; lengths must match.
    pub fn copy_from_slice(&self, values: &[T]) {
        let mut data = self.data.lock();
        assert_eq!(
            data.len(),
            values.len(),
            "Buffer copy length mismatch ({} vs {})",
            data.len(),
            values.len()
        );
        data.clone_from_slice(values);
    }
}

impl<T> SharedBuffer<T> {
    pub fn from_vec(values: Vec<T>) -> Self {
        Self {
            data: Arc::new(Mutex::new(values)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both handles refer to the same allocation.
    pub fn same_as(&self, other: &SharedBuffer<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.data.lock()
    }
}

impl<T: Clone + Send + 'static> SharedBuffer<T> {
    /// Queues a copy of this buffer into `dst` on `stream`.
    pub fn copy_to_async(&self, stream: &GpuStream, label: &'static str, dst: &SharedBuffer<T>) {
        let src = self.clone();
        let dst = dst.clone();
        stream.enqueue(label, move || {
            if src.same_as(&dst) {
                return Ok(());
            }
            let src = src.lock();
            let mut dst = dst.lock();
            if src.len() != dst.len() {
                return Err(PmeError::validation(format!(
                    "copy length mismatch ({} vs {})",
                    src.len(),
                    dst.len()
                ))
                .into());
            }
            dst.clone_from_slice(&src);
            Ok(())
        });
    }
}
