//! Cache line isolation for per-worker atomics.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Wrapper that gives its contents a 64-byte cache line of their own.
///
/// The per-worker load counters sit side by side in one shared slice;
/// without the alignment, one worker's hot updates would keep bouncing the
/// line its neighbours read when picking steal victims.
#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wrap `value`, padding it out to a full cache line.
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachePadded").field(&self.value).finish()
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_padding_fills_a_line() {
        assert_eq!(align_of::<CachePadded<AtomicUsize>>(), 64);
        assert!(size_of::<CachePadded<AtomicUsize>>() >= 64);
        // neighbouring elements land on distinct lines
        let pair = [CachePadded::new(0u8), CachePadded::new(0u8)];
        let gap = &pair[1] as *const _ as usize - &pair[0] as *const _ as usize;
        assert!(gap >= 64);
    }

    #[test]
    fn test_reads_and_writes_pass_through() {
        let counter = CachePadded::new(AtomicUsize::new(3));
        counter.fetch_add(2, Ordering::Relaxed);
        assert_eq!(counter.load(Ordering::Relaxed), 5);

        let mut plain = CachePadded::new(10);
        *plain = 20;
        assert_eq!(*plain, 20);
    }
}
