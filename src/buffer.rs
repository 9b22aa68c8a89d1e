//! Fixed-length numeric buffers reused across ticks.
//!
//! A [`Buffer`] keeps its allocation when it shrinks so that switching the bin
//! count back and forth does not churn the allocator. Memory is only returned
//! by an explicit [`Buffer::release`].

use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, Default)]
pub struct Buffer<T> {
    data: Vec<T>,
    len: usize,
}

/// A buffer owned by one stage and shared read-only with downstream stages.
pub type SharedBuffer<T> = Arc<RwLock<Buffer<T>>>;

pub fn shared<T: Clone + Default>() -> SharedBuffer<T> {
    Arc::new(RwLock::new(Buffer::new()))
}

impl<T: Clone + Default> Buffer<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            len: 0,
        }
    }

    pub fn with_len(len: usize) -> Self {
        let mut buffer = Self::new();
        buffer.resize(len);
        buffer
    }

    /// Set the visible length. Growing zero-fills the new tail; shrinking keeps
    /// the backing storage. Returns `true` when the length changed.
    pub fn resize(&mut self, len: usize) -> bool {
        if len == self.len {
            return false;
        }
        if len > self.data.len() {
            self.data.resize(len, T::default());
        }
        if len > self.len {
            self.data[self.len..len].fill(T::default());
        }
        self.len = len;
        true
    }

    /// Resize to `src.len()` and copy it in.
    pub fn copy_from(&mut self, src: &[T]) {
        self.resize(src.len());
        self.data[..src.len()].clone_from_slice(src);
    }

    pub fn fill(&mut self, value: T) {
        self.data[..self.len].fill(value);
    }

    /// Drop the backing allocation.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.len = 0;
    }
}

impl<T> Buffer<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_zero_fills() {
        let mut buf = Buffer::<f32>::with_len(2);
        buf.as_mut_slice().copy_from_slice(&[1.0, 2.0]);
        assert!(buf.resize(4));
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn shrink_keeps_storage() {
        let mut buf = Buffer::<f32>::with_len(8);
        buf.resize(2);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.capacity(), 8);
        assert!(!buf.resize(2));
    }

    #[test]
    fn regrow_after_shrink_clears_stale_tail() {
        let mut buf = Buffer::<f32>::with_len(4);
        buf.fill(7.0);
        buf.resize(1);
        buf.resize(4);
        assert_eq!(buf.as_slice(), &[7.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn copy_from_resizes() {
        let mut buf = Buffer::<u32>::with_len(10);
        buf.copy_from(&[3, 4, 5]);
        assert_eq!(buf.as_slice(), &[3, 4, 5]);
        assert_eq!(buf.capacity(), 10);
    }

    #[test]
    fn release_drops_storage() {
        let mut buf = Buffer::<f32>::with_len(16);
        buf.release();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 0);
    }
}
