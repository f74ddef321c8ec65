use std::sync::{Mutex, OnceLock};

/// Free-list capacities, one bucket per power of two from 64 to 4096.
const BUCKET_CAPS: [usize; 7] = [64, 128, 256, 512, 1024, 2048, 4096];

/// Upper bound on buffers retained per bucket; beyond this, release drops.
const BUCKET_LIMIT: usize = 128;

/**
A size-bucketed pool of reusable path buffers.

A deep walk constructs one absolute path per emitted entry; recycling the
backing allocations through fixed-capacity buckets keeps the hot path free
of allocator traffic. The contract is advisory: a caller must not read a
buffer after releasing it.

Each bucket is guarded by its own lock, so threads acquiring different
sizes never contend.
*/
#[derive(Debug, Default)]
pub struct PathBufferPool {
    lists: [Mutex<Vec<Vec<u8>>>; 7],
}

impl PathBufferPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    /// The process-wide pool shared by all walkers.
    #[must_use]
    pub fn global() -> &'static Self {
        static POOL: OnceLock<PathBufferPool> = OnceLock::new();
        POOL.get_or_init(Self::new)
    }

    /// Index of the smallest bucket whose capacity covers `len`, if any.
    #[inline]
    fn bucket_for(len: usize) -> Option<usize> {
        BUCKET_CAPS.iter().position(|&cap| cap >= len)
    }

    /**
    Returns an empty buffer with at least `min_capacity` bytes of capacity.

    Served from the smallest bucket that covers the request; a fresh buffer
    of the bucket's capacity is allocated on underflow. Requests larger
    than the largest bucket are allocated exactly and will not be retained
    on release.
    */
    #[must_use]
    pub fn acquire(&self, min_capacity: usize) -> Vec<u8> {
        let Some(idx) = Self::bucket_for(min_capacity) else {
            return Vec::with_capacity(min_capacity);
        };

        if let Ok(mut list) = self.lists[idx].lock()
            && let Some(buf) = list.pop()
        {
            debug_assert!(buf.is_empty(), "pooled buffer was not truncated");
            return buf;
        }

        Vec::with_capacity(BUCKET_CAPS[idx])
    }

    /**
    Returns `buf` to the bucket matching its capacity.

    The buffer is truncated to zero length first. Buffers whose capacity is
    not one of the bucket sizes (oversize requests, or grown in place by
    the caller) are simply dropped.
    */
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();

        let cap = buf.capacity();
        let Some(idx) = BUCKET_CAPS.iter().position(|&c| c == cap) else {
            return;
        };

        if let Ok(mut list) = self.lists[idx].lock()
            && list.len() < BUCKET_LIMIT
        {
            list.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BUCKET_CAPS, PathBufferPool};

    #[test]
    fn acquire_rounds_up_to_bucket() {
        let pool = PathBufferPool::new();
        assert!(pool.acquire(1).capacity() >= 64);
        assert!(pool.acquire(65).capacity() >= 128);
        assert!(pool.acquire(4000).capacity() >= 4096);
    }

    #[test]
    fn oversize_requests_bypass_buckets() {
        let pool = PathBufferPool::new();
        let buf = pool.acquire(5000);
        assert!(buf.capacity() >= 5000);
        pool.release(buf);
    }

    #[test]
    fn release_recycles_and_truncates() {
        let pool = PathBufferPool::new();
        let mut buf = pool.acquire(128);
        let cap = buf.capacity();
        buf.extend_from_slice(b"/some/path");
        pool.release(buf);

        let again = pool.acquire(128);
        assert!(again.is_empty());
        assert_eq!(again.capacity(), cap);
    }

    #[test]
    fn all_buckets_are_powers_of_two_of_sixty_four() {
        for (i, cap) in BUCKET_CAPS.iter().enumerate() {
            assert_eq!(*cap, 64 << i);
        }
    }
}
