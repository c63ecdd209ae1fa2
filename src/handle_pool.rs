//! The handle pool: bucket allocation and reference counting.
//!
//! Handles are allocated in fixed-size buckets. Two parallel structures
//! track them: the bucket table (stable storage, a handle's index never
//! changes) and the free stack, whose tail `[used..max)` lists the handles
//! currently free. Releasing the last reference returns the handle to the
//! free stack and hands its payload back to the caller, who is responsible
//! for destroying nested references — payload destruction can recurse
//! through the whole object graph and may need the native-type registry,
//! which the pool knows nothing about.

use log::debug;

use crate::handle::{
    Handle, HandleFlags, HandleRef, Payload, TYPE_FLOAT, TYPE_INT, TYPE_NULL,
};

/// Default number of handles per allocation bucket.
pub const DEFAULT_ALLOC_GRAIN: usize = 1024;

/// The pool of all handles of one VM instance.
#[derive(Debug)]
pub struct HandlePool {
    grain: usize,
    buckets: Vec<Vec<Handle>>,
    free_stack: Vec<HandleRef>,
    used: usize,
}

impl HandlePool {
    /// Creates a pool with one bucket of `grain` handles and materializes
    /// the shared null handle as handle 0.
    pub fn new(grain: usize) -> Self {
        let grain = grain.max(2);
        let mut pool = Self {
            grain,
            buckets: Vec::new(),
            free_stack: Vec::new(),
            used: 0,
        };
        pool.append_bucket();
        let null = pool.acquire();
        debug_assert_eq!(null.index(), 0);
        pool
    }

    fn append_bucket(&mut self) {
        let start = self.buckets.len() * self.grain;
        let mut bucket = Vec::with_capacity(self.grain);
        for i in 0..self.grain {
            bucket.push(Handle::free());
            self.free_stack.push(HandleRef(start + i));
        }
        bucket[0].flags |= HandleFlags::NEW_BUCKET;
        self.buckets.push(bucket);
    }

    /// The shared null handle.
    pub fn null_ref(&self) -> HandleRef {
        HandleRef(0)
    }

    /// Shared access to a handle.
    pub fn handle(&self, r: HandleRef) -> &Handle {
        &self.buckets[r.0 / self.grain][r.0 % self.grain]
    }

    /// Exclusive access to a handle.
    pub fn handle_mut(&mut self, r: HandleRef) -> &mut Handle {
        &mut self.buckets[r.0 / self.grain][r.0 % self.grain]
    }

    /// Takes a fresh handle off the free stack: type null, reference count
    /// 1, flags cleared except `NEW_BUCKET`. Grows the pool by one bucket
    /// on exhaustion; existing indices remain valid.
    pub fn acquire(&mut self) -> HandleRef {
        if self.used >= self.free_stack.len() {
            self.append_bucket();
        }
        let r = self.free_stack[self.used];
        self.used += 1;
        let h = self.handle_mut(r);
        h.type_id = TYPE_NULL;
        h.flags &= HandleFlags::NEW_BUCKET;
        h.ref_count = 1;
        h.payload = Payload::Null;
        r
    }

    /// Acquires a handle with the given type and payload.
    pub fn acquire_with(&mut self, type_id: i32, payload: Payload) -> HandleRef {
        let r = self.acquire();
        let h = self.handle_mut(r);
        h.type_id = type_id;
        h.payload = payload;
        r
    }

    /// Acquires a fresh int handle.
    pub fn new_int(&mut self, v: i64) -> HandleRef {
        self.acquire_with(TYPE_INT, Payload::Int(v))
    }

    /// Acquires a fresh float handle.
    pub fn new_float(&mut self, v: f64) -> HandleRef {
        self.acquire_with(TYPE_FLOAT, Payload::Float(v))
    }

    /// Adds one reference.
    pub fn add_ref(&mut self, r: HandleRef) {
        self.handle_mut(r).ref_count += 1;
    }

    /// Adds `n` references at once.
    pub fn add_ref_n(&mut self, r: HandleRef, n: u32) {
        self.handle_mut(r).ref_count += n;
    }

    /// Drops one reference. When the count reaches zero the handle goes
    /// back on the free stack and its former type id and payload are
    /// returned for destruction — unless the handle is a weak reference
    /// (`PERSIST`), whose payload is an alias and is silently dropped.
    ///
    /// Releasing a handle whose count is already zero is a no-op. That case
    /// is reached only by the collector's sweep cascading through a
    /// reference cycle, where the second leg of the cycle re-releases a
    /// handle the first leg already reclaimed.
    pub(crate) fn release(&mut self, r: HandleRef) -> Option<(i32, Payload)> {
        let grain = self.grain;
        let h = &mut self.buckets[r.0 / grain][r.0 % grain];
        if h.ref_count == 0 {
            return None;
        }
        h.ref_count -= 1;
        if h.ref_count > 0 {
            return None;
        }
        let persist = h.flags.contains(HandleFlags::PERSIST);
        h.flags.remove(HandleFlags::PERSIST);
        let type_id = h.type_id;
        h.type_id = TYPE_NULL;
        let payload = std::mem::take(&mut h.payload);
        self.used -= 1;
        self.free_stack[self.used] = r;
        if persist {
            None
        } else {
            Some((type_id, payload))
        }
    }

    /// Returns a new handle holding a physical copy for int and float, and
    /// a new reference to the same handle for everything else.
    pub fn copy_value_type(&mut self, r: HandleRef) -> HandleRef {
        match self.handle(r).payload {
            Payload::Int(v) => self.new_int(v),
            Payload::Float(v) => self.new_float(v),
            _ => {
                self.add_ref(r);
                r
            }
        }
    }

    /// Creates a weak reference: a fresh handle aliasing the payload of
    /// `r`, flagged `PERSIST` so its destruction leaves the payload alone.
    /// The weak handle must not outlive its referent.
    pub fn weak_ref(&mut self, r: HandleRef) -> HandleRef {
        let (type_id, payload) = {
            let src = self.handle(r);
            (src.type_id, src.payload.clone())
        };
        let w = self.acquire_with(type_id, payload);
        self.handle_mut(w).flags |= HandleFlags::PERSIST;
        w
    }

    /// Total number of handles ever allocated (all buckets).
    pub fn max_handles(&self) -> usize {
        self.buckets.len() * self.grain
    }

    /// Number of handles currently in use.
    pub fn used_handles(&self) -> usize {
        self.used
    }

    /// Number of live handles excluding the null handle. This is the leak
    /// count reported at teardown.
    pub fn live_count(&self) -> usize {
        (0..self.max_handles())
            .filter(|&i| i != 0 && self.handle(HandleRef(i)).ref_count > 0)
            .count()
    }

    /// All handle indices, for GC sweeps and leak walks.
    pub fn iter_refs(&self) -> impl Iterator<Item = HandleRef> {
        (0..self.max_handles()).map(HandleRef)
    }

    pub(crate) fn log_bucket_shutdown(&self) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            debug_assert!(
                bucket[0].flags.contains(HandleFlags::NEW_BUCKET),
                "bucket {} lost its marker",
                i
            );
        }
        debug!("handle pool shutdown: {} buckets freed", self.buckets.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_is_first() {
        let pool = HandlePool::new(8);
        assert_eq!(pool.null_ref().index(), 0);
        assert_eq!(pool.handle(pool.null_ref()).ref_count, 1);
        assert!(pool.handle(pool.null_ref()).is_null());
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut pool = HandlePool::new(8);
        let a = pool.new_int(10);
        assert_eq!(pool.handle(a).ref_count, 1);
        assert_eq!(pool.used_handles(), 2);
        assert!(pool.release(a).is_some());
        assert_eq!(pool.used_handles(), 1);
        // the freed handle is handed out again
        let b = pool.acquire();
        assert_eq!(b, a);
    }

    #[test]
    fn test_growth_keeps_indices_stable() {
        let mut pool = HandlePool::new(4);
        let refs: Vec<_> = (0..10).map(|i| pool.new_int(i)).collect();
        assert!(pool.max_handles() >= 11);
        for (i, r) in refs.iter().enumerate() {
            assert_eq!(pool.handle(*r).as_int(), Some(i as i64));
        }
        // first handle of the second bucket carries the marker
        assert!(pool
            .handle(HandleRef(4))
            .flags
            .contains(HandleFlags::NEW_BUCKET));
    }

    #[test]
    fn test_acquire_preserves_only_bucket_flag() {
        let mut pool = HandlePool::new(4);
        let a = pool.acquire();
        pool.handle_mut(a).flags |= HandleFlags::MARKED;
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(b, a);
        assert!(!pool.handle(b).flags.contains(HandleFlags::MARKED));
    }

    #[test]
    fn test_copy_value_type() {
        let mut pool = HandlePool::new(8);
        let a = pool.new_int(5);
        let b = pool.copy_value_type(a);
        assert_ne!(a, b);
        assert_eq!(pool.handle(b).as_int(), Some(5));
        // non-value types share the handle
        let s = pool.acquire_with(
            crate::handle::TYPE_STRING,
            Payload::Str(std::rc::Rc::new(std::cell::RefCell::new("x".into()))),
        );
        let t = pool.copy_value_type(s);
        assert_eq!(s, t);
        assert_eq!(pool.handle(s).ref_count, 2);
    }

    #[test]
    fn test_weak_ref_aliases_payload() {
        let mut pool = HandlePool::new(8);
        let body = std::rc::Rc::new(std::cell::RefCell::new(String::from("shared")));
        let s = pool.acquire_with(crate::handle::TYPE_STRING, Payload::Str(body.clone()));
        let w = pool.weak_ref(s);
        assert!(pool.handle(w).flags.contains(HandleFlags::PERSIST));
        // mutation through the strong handle is visible through the alias
        pool.handle(s).as_str().unwrap().borrow_mut().push('!');
        assert_eq!(&*pool.handle(w).as_str().unwrap().borrow(), "shared!");
        // releasing the weak ref does not return a payload to destroy
        assert!(pool.release(w).is_none());
        assert_eq!(&*pool.handle(s).as_str().unwrap().borrow(), "shared!");
    }
}
