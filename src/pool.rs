use std::ptr::{self, NonNull};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    alignment::align_up,
    block::{min_payload, padded_header_size},
    classes::{ClassTable, SLOT_PREFIX_SIZE},
    config::{PoolConfig, MAX_REQUEST, MAX_SIZE_CLASSES},
    error::PoolError,
    heap::Heap,
    platform::page_size,
    region::page_align,
    stats::{fragmentation_ratio, PoolStats},
};

/// Lifetime counters updated on every mutating operation.
#[derive(Default)]
struct Counters {
    alloc_count: u64,
    free_count: u64,
    used_bytes: usize,
    peak_bytes: usize,
}

/// Everything behind the chain lock: the links (one heap over one backing
/// region each), the class table and the counters.
struct PoolState {
    links: Vec<Heap>,
    classes: ClassTable,
    counters: Counters,
    config: PoolConfig,
}

// The raw pointers inside `links` and `classes` all reference memory owned
// by the mapped regions of `links`, which move with the state.
unsafe impl Send for PoolState {}

/// A memory pool. One or more large backing regions acquired up front serve
/// every allocation; the pool never calls back into the OS except to grow.
///
/// Variable-size requests go to a boundary-tag heap with best-fit search and
/// eager coalescing. Exact-size requests can be served in O(1) from
/// fixed-size classes added with [`Pool::add_size_class`]. When no link of
/// the chain can host a variable-size request, a new link at least as large
/// as the first one is mapped and appended; pointers remain valid across
/// growth and every entry point resolves them against the whole chain.
///
/// All operations lock the pool for the duration of the chain walk, so a
/// `Pool` can be shared freely across threads and each operation is atomic
/// with respect to the others.
pub struct Pool {
    state: Mutex<PoolState>,
}

#[inline]
fn check_size(size: usize) -> Result<(), PoolError> {
    if size == 0 || size > MAX_REQUEST {
        return Err(PoolError::InvalidSize);
    }

    Ok(())
}

impl Pool {
    /// Creates a pool with one backing region of at least `pool_size` bytes
    /// (rounded up to whole pages) and the default configuration.
    pub fn new(pool_size: usize) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::new(pool_size))
    }

    /// Creates a pool from an explicit configuration, carving any size
    /// classes listed in it.
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let align = config.alignment;
        let floor = padded_header_size(align) + min_payload(align);
        let len = page_align(config.pool_size.max(floor));

        let mut state = PoolState {
            links: vec![Heap::new(len, align)?],
            classes: ClassTable::new(),
            counters: Counters::default(),
            config,
        };

        for spec in state.config.size_classes.clone() {
            state.add_class(spec.slot_size, spec.capacity)?;
        }

        debug!("created pool: {len} byte region, {align} byte alignment");

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Allocates `size` bytes aligned to the pool alignment. Served from a
    /// fixed-size class when one matches the request exactly, otherwise from
    /// the first link of the chain with a fitting free block; the chain grows
    /// as a last resort.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        check_size(size)?;

        let mut state = self.state.lock();
        let align = state.config.alignment;
        state.allocate(size, align)
    }

    /// Like [`Pool::alloc`] with an explicit alignment. Alignments up to the
    /// pool alignment are free; stricter ones cost up to `align` extra bytes
    /// of the block. `align` must be a power of two no larger than the page
    /// size.
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        check_size(size)?;

        if !align.is_power_of_two() || align > page_size() {
            return Err(PoolError::InvalidSize);
        }

        let mut state = self.state.lock();
        let align = align.max(state.config.alignment);
        state.allocate(size, align)
    }

    /// Allocates a zeroed array of `count` elements of `size` bytes each,
    /// detecting multiplication overflow.
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, PoolError> {
        let total = count.checked_mul(size).ok_or(PoolError::InvalidSize)?;
        check_size(total)?;

        let mut state = self.state.lock();
        let align = state.config.alignment;
        let address = state.allocate(total, align)?;

        // Recycled blocks carry old contents, so zeroing is unconditional.
        unsafe { address.as_ptr().write_bytes(0, total) };

        Ok(address)
    }

    /// Releases an allocation obtained from any entry point of this pool,
    /// including fixed-size slots.
    ///
    /// # Safety
    ///
    /// `address` must come from this pool and must not be used again after
    /// this call returns `Ok`. Foreign pointers are rejected without being
    /// dereferenced.
    pub unsafe fn free(&self, address: NonNull<u8>) -> Result<(), PoolError> {
        self.state.lock().free(address)
    }

    /// Resizes an allocation. `realloc(None, n)` is `alloc(n)`;
    /// `realloc(Some(p), 0)` frees `p` and returns `Ok(None)`. Heap blocks
    /// grow in place when the neighbouring block is free; fixed-size slots
    /// keep their pointer while the new size fits the slot. Everything else
    /// moves the contents and releases the old allocation. The first
    /// `min(old, new)` bytes are preserved either way.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::free`]: a `Some` address must be a live
    /// allocation of this pool and is invalidated when a new address is
    /// returned.
    pub unsafe fn realloc(
        &self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, PoolError> {
        match address {
            None => self.alloc(new_size).map(Some),
            Some(p) if new_size == 0 => {
                self.free(p)?;
                Ok(None)
            }
            Some(p) => {
                check_size(new_size)?;
                self.state.lock().reallocate(p, new_size).map(Some)
            }
        }
    }

    /// Adds a fixed-size class of `capacity` slots of `slot_size` bytes,
    /// carving its slab from the chain, and returns the class id. Classes
    /// cannot be removed. Unlike variable-size allocation, this never grows
    /// the chain: if no link can host the slab, `OutOfMemory` is returned.
    pub fn add_size_class(&self, slot_size: usize, capacity: usize) -> Result<usize, PoolError> {
        self.state.lock().add_class(slot_size, capacity)
    }

    /// O(1) allocation from the class with the smallest slot size that fits
    /// `size`. Fails with `InvalidSize` when no class fits and `OutOfMemory`
    /// when the matching class is exhausted; the variable-size heap is never
    /// consulted.
    pub fn alloc_fixed(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        check_size(size)?;

        let mut state = self.state.lock();
        let address = unsafe { state.classes.alloc_smallest_fit(size) }?;
        state.counters.alloc_count += 1;

        Ok(address)
    }

    /// O(1) release of a fixed-size slot. The slot prefix identifies the
    /// owning class.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::free`].
    pub unsafe fn free_fixed(&self, address: NonNull<u8>) -> Result<(), PoolError> {
        self.state.lock().free_fixed(address)
    }

    /// Whether `address` falls inside any backing region of the chain.
    pub fn contains(&self, address: *const u8) -> bool {
        self.state
            .lock()
            .links
            .iter()
            .any(|heap| heap.contains(address))
    }

    /// Number of links in the chain. Starts at 1 and only grows.
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Checks every invariant of every link and class: address lists tile
    /// their regions, no two adjacent blocks are free, free lists match the
    /// free blocks, all tags are intact. Returns `Corruption` without
    /// touching the pool if anything is off.
    pub fn validate(&self) -> Result<(), PoolError> {
        let state = self.state.lock();

        for heap in &state.links {
            unsafe { heap.validate()? };
        }

        unsafe { state.classes.validate() }
    }

    /// Best-effort merge pass over every link. Eager coalescing keeps the
    /// heap defragmented in steady state, so this only finds work after the
    /// invariants were disturbed externally. Safe to call at any time,
    /// idempotent.
    pub fn defragment(&self) {
        let mut state = self.state.lock();
        let mut merged = 0;

        for heap in &mut state.links {
            merged += unsafe { heap.defragment() };
        }

        trace!("defragment pass merged {merged} block pairs");
    }

    /// Returns every link to its freshly-created state without releasing any
    /// backing region, then re-carves the classes listed in the pool
    /// configuration. Dynamically added classes disappear. Every previously
    /// returned pointer is invalidated.
    pub fn reset(&self) {
        let mut state = self.state.lock();

        for heap in &mut state.links {
            heap.reset();
        }
        state.classes.clear();
        state.counters = Counters::default();

        // Seeding succeeded at construction over the same first link, so it
        // cannot fail against freshly reset links.
        for spec in state.config.size_classes.clone() {
            let _ = state.add_class(spec.slot_size, spec.capacity);
        }

        trace!("pool reset");
    }

    /// Touches every page of free space in every link so the OS commits the
    /// backing frames now instead of on first use. Pages backing live
    /// allocations are left alone.
    pub fn warmup(&self) {
        let state = self.state.lock();

        for heap in &state.links {
            unsafe { heap.warmup() };
        }
    }

    /// Snapshot of the pool counters, aggregated over the whole chain.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();

        let mut total_bytes = 0;
        let mut total_free = 0;
        let mut largest_free = 0;
        let mut blocks = 0;
        let mut free_blocks = 0;
        let mut merge_count = 0;
        let mut split_count = 0;

        for heap in &state.links {
            total_bytes += heap.region_len();
            blocks += heap.block_count();
            free_blocks += heap.free_block_count();
            merge_count += heap.merges();
            split_count += heap.splits();

            let (free, largest) = unsafe { heap.free_space() };
            total_free += free;
            largest_free = largest_free.max(largest);
        }

        PoolStats {
            total_bytes,
            used_bytes: state.counters.used_bytes,
            peak_bytes: state.counters.peak_bytes,
            alloc_count: state.counters.alloc_count,
            free_count: state.counters.free_count,
            allocated_block_count: blocks - free_blocks,
            free_block_count: free_blocks,
            merge_count,
            split_count,
            fragmentation_ratio: fragmentation_ratio(total_free, largest_free),
        }
    }
}

impl PoolState {
    fn link_of(&self, address: *const u8) -> Result<usize, PoolError> {
        self.links
            .iter()
            .position(|heap| heap.contains(address))
            .ok_or(PoolError::InvalidPointer)
    }

    /// Whether the slot prefix word below `address` lies inside the link, so
    /// probing it cannot touch foreign memory.
    fn slot_probe_allowed(&self, link: usize, address: NonNull<u8>) -> bool {
        !self.classes.is_empty()
            && self.links[link].contains(address.as_ptr().wrapping_sub(SLOT_PREFIX_SIZE))
    }

    fn note_alloc(&mut self, payload: usize) {
        self.counters.alloc_count += 1;
        self.counters.used_bytes += payload;
        self.counters.peak_bytes = self.counters.peak_bytes.max(self.counters.used_bytes);
    }

    fn note_free(&mut self, payload: usize) {
        self.counters.free_count += 1;
        self.counters.used_bytes -= payload;
    }

    fn allocate(&mut self, size: usize, req_align: usize) -> Result<NonNull<u8>, PoolError> {
        // Exact-size fast path. An exhausted class quietly defers to the
        // heap; only `alloc_fixed` reports exhaustion to the caller.
        if self.config.enable_size_classes
            && req_align <= self.config.alignment
            && !self.classes.is_empty()
        {
            if let Some(address) = unsafe { self.classes.alloc_exact(size) } {
                self.counters.alloc_count += 1;
                return Ok(address);
            }
        }

        self.allocate_variable(size, req_align)
    }

    fn allocate_variable(&mut self, size: usize, req_align: usize) -> Result<NonNull<u8>, PoolError> {
        for heap in &mut self.links {
            if let Some((address, payload)) = unsafe { heap.allocate(size, req_align) } {
                self.note_alloc(payload);
                return Ok(address);
            }
        }

        self.grow(size, req_align)?;

        let heap = self.links.last_mut().unwrap();
        match unsafe { heap.allocate(size, req_align) } {
            Some((address, payload)) => {
                self.note_alloc(payload);
                Ok(address)
            }
            None => Err(PoolError::OutOfMemory),
        }
    }

    /// Appends a new link sized to host the failed request, but never smaller
    /// than the first link.
    fn grow(&mut self, size: usize, req_align: usize) -> Result<(), PoolError> {
        let align = self.config.alignment;
        let payload = self.links[0].required_payload(size, req_align);
        let len = page_align((padded_header_size(align) + payload).max(self.links[0].region_len()));

        debug!(
            "chain exhausted by a {size} byte request, appending a {len} byte link"
        );

        self.links.push(Heap::new(len, align)?);

        Ok(())
    }

    fn free(&mut self, address: NonNull<u8>) -> Result<(), PoolError> {
        let link = self.link_of(address.as_ptr())?;

        if self.slot_probe_allowed(link, address) {
            if let Some(result) = unsafe { self.classes.try_free(address) } {
                result?;
                self.counters.free_count += 1;
                return Ok(());
            }
        }

        let freed = unsafe { self.links[link].free(address) }?;
        self.note_free(freed);

        Ok(())
    }

    fn free_fixed(&mut self, address: NonNull<u8>) -> Result<(), PoolError> {
        let link = self.link_of(address.as_ptr())?;

        if !self.slot_probe_allowed(link, address) {
            return Err(PoolError::InvalidPointer);
        }

        match unsafe { self.classes.try_free(address) } {
            Some(result) => {
                result?;
                self.counters.free_count += 1;
                Ok(())
            }
            None => Err(PoolError::InvalidPointer),
        }
    }

    fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, PoolError> {
        let link = self.link_of(address.as_ptr())?;

        // The pointer may be a class slot handed out by the exact-size fast
        // path. Slots never change size in place: within the slot capacity
        // the pointer is stable, growing moves through the generic path.
        if self.slot_probe_allowed(link, address) {
            let resolved = unsafe { self.classes.live_slot_size(address) };

            if let Some(slot_size) = resolved.transpose()? {
                if new_size <= slot_size {
                    return Ok(address);
                }

                let new_address = self.allocate(new_size, self.config.alignment)?;

                unsafe {
                    ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), slot_size);
                    // Resolved as live above and the lock is held throughout.
                    let _ = self.classes.try_free(address);
                }
                self.counters.free_count += 1;

                return Ok(new_address);
            }
        }

        let block = unsafe { self.links[link].resolve_allocated(address) }?;

        let align = self.links[link].align();
        let payload_start = unsafe { self.links[link].payload_address(block) }.as_ptr() as usize;

        // For over-aligned allocations the caller pointer sits somewhere
        // inside the payload; the part before it has to stay reserved.
        let delta = address.as_ptr() as usize - payload_start;
        let old_payload = unsafe { block.as_ref().size() };
        let needed = align_up(delta + new_size, align).max(min_payload(align));

        if let Some(new_payload) = unsafe { self.links[link].try_realloc_in_place(block, needed) } {
            self.counters.used_bytes = self.counters.used_bytes - old_payload + new_payload;
            self.counters.peak_bytes = self.counters.peak_bytes.max(self.counters.used_bytes);
            return Ok(address);
        }

        // Move: allocate first, copy, then release the old block.
        let new_address = self.allocate_variable(new_size, self.config.alignment)?;
        let copy = (old_payload - delta).min(new_size);

        unsafe {
            ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), copy);
            let freed = self.links[link].free(address)?;
            self.note_free(freed);
        }

        Ok(new_address)
    }

    fn add_class(&mut self, slot_size: usize, capacity: usize) -> Result<usize, PoolError> {
        if slot_size == 0
            || slot_size > MAX_REQUEST
            || capacity == 0
            || capacity > u32::MAX as usize
        {
            return Err(PoolError::InvalidSize);
        }

        if self.classes.len() >= MAX_SIZE_CLASSES {
            return Err(PoolError::InvalidSize);
        }

        let align = self.config.alignment;
        let id = self.classes.len();
        let bytes = ClassTable::slab_bytes(slot_size, capacity as u32, align)
            .filter(|bytes| *bytes <= MAX_REQUEST)
            .ok_or(PoolError::InvalidSize)?;

        for i in 0..self.links.len() {
            if let Some((slab, payload)) = unsafe { self.links[i].carve_slab(bytes, id as i32) } {
                self.counters.used_bytes += payload;
                self.counters.peak_bytes =
                    self.counters.peak_bytes.max(self.counters.used_bytes);

                let installed =
                    unsafe { self.classes.install(slot_size, capacity as u32, align, slab) };
                debug_assert_eq!(installed, id);

                trace!("class {id}: {capacity} slots of {slot_size} bytes");
                return Ok(id);
            }
        }

        Err(PoolError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[test]
    fn alloc_write_free_roundtrip() {
        let pool = Pool::new(1024 * 1024).unwrap();

        let p1 = pool.alloc(8).unwrap();
        let p2 = pool.alloc(page_size() * 2).unwrap();

        unsafe {
            p1.as_ptr().write_bytes(69, 8);
            p2.as_ptr().write_bytes(42, page_size() * 2);

            for i in 0..8 {
                assert_eq!(*p1.as_ptr().add(i), 69);
            }
            pool.free(p1).unwrap();

            for i in 0..page_size() * 2 {
                assert_eq!(*p2.as_ptr().add(i), 42);
            }
            pool.free(p2).unwrap();
        }

        pool.validate().unwrap();
        assert_eq!(pool.stats().used_bytes, 0);
    }

    #[test]
    fn growth_appends_links_and_resolves_pointers() {
        let pool = Pool::new(64 * 1024).unwrap();
        assert_eq!(pool.link_count(), 1);

        let big = pool.alloc(96 * 1024).unwrap();
        assert_eq!(pool.link_count(), 2);
        assert!(pool.contains(big.as_ptr()));

        unsafe {
            big.as_ptr().write_bytes(0xEE, 96 * 1024);
            pool.free(big).unwrap();
        }

        pool.validate().unwrap();
        assert_eq!(pool.stats().used_bytes, 0);
    }

    #[test]
    fn fixed_classes_through_the_generic_entry_points() {
        let pool = Pool::new(4 * 1024 * 1024).unwrap();
        let id = pool.add_size_class(64, 100).unwrap();
        assert_eq!(id, 0);

        // Exact-size requests ride the fast path, and the generic `free`
        // recognises the slot prefix.
        let slot = pool.alloc(64).unwrap();
        let stats = pool.stats();
        unsafe { pool.free(slot).unwrap() };

        // The slab is a single allocated block; the fast path added none.
        assert_eq!(stats.allocated_block_count, 1);

        // Explicit fixed entry points agree.
        let slot = pool.alloc_fixed(64).unwrap();
        unsafe { pool.free_fixed(slot).unwrap() };

        // A non-matching size goes to the heap instead.
        let odd = pool.alloc(65).unwrap();
        assert!(pool.stats().allocated_block_count > 1);
        unsafe { pool.free(odd).unwrap() };

        pool.validate().unwrap();
    }

    #[test]
    fn fixed_class_exhaustion_does_not_grow_the_chain() {
        let pool = Pool::new(1024 * 1024).unwrap();
        pool.add_size_class(128, 2).unwrap();

        let a = pool.alloc_fixed(128).unwrap();
        let b = pool.alloc_fixed(128).unwrap();
        assert_eq!(pool.alloc_fixed(128), Err(PoolError::OutOfMemory));
        assert_eq!(pool.link_count(), 1);

        unsafe {
            pool.free_fixed(a).unwrap();
            pool.free_fixed(b).unwrap();
        }
        pool.validate().unwrap();
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let pool = Pool::new(1024 * 1024).unwrap();

        let dirty = pool.alloc(512).unwrap();
        unsafe {
            dirty.as_ptr().write_bytes(0xFF, 512);
            pool.free(dirty).unwrap();
        }

        let clean = pool.calloc(64, 8).unwrap();
        unsafe {
            for i in 0..512 {
                assert_eq!(*clean.as_ptr().add(i), 0);
            }
            pool.free(clean).unwrap();
        }

        assert_eq!(pool.calloc(usize::MAX, 2), Err(PoolError::InvalidSize));
    }

    #[test]
    fn reset_restores_the_created_state() {
        let mut config = PoolConfig::new(1024 * 1024);
        config.size_classes = vec![crate::SizeClassSpec {
            slot_size: 64,
            capacity: 16,
        }];
        let pool = Pool::with_config(config).unwrap();

        let created = pool.stats();

        let _leaked = pool.alloc(4096).unwrap();
        pool.add_size_class(256, 8).unwrap();
        pool.alloc_fixed(256).unwrap();

        pool.reset();

        let after = pool.stats();
        assert_eq!(after.used_bytes, created.used_bytes);
        assert_eq!(after.allocated_block_count, created.allocated_block_count);
        assert_eq!(after.alloc_count, 0);

        // The configured class is back, the dynamically added one is gone.
        pool.alloc_fixed(64).unwrap();
        assert_eq!(pool.alloc_fixed(256), Err(PoolError::InvalidSize));
        pool.validate().unwrap();
    }

    #[test]
    fn warmup_is_observably_inert() {
        let pool = Pool::new(2 * 1024 * 1024).unwrap();

        let p = pool.alloc(1024).unwrap();
        unsafe { p.as_ptr().write_bytes(0x77, 1024) };

        pool.warmup();

        unsafe {
            for i in 0..1024 {
                assert_eq!(*p.as_ptr().add(i), 0x77);
            }
            pool.free(p).unwrap();
        }
        pool.validate().unwrap();
    }

    /// All threads allocate at the same time, then all free at the same time.
    #[test]
    fn multiple_threads_synchronized_allocs_and_frees() {
        let pool = Pool::new(16 * 1024 * 1024).unwrap();

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        thread::scope(|scope| {
            for t in 0..num_threads {
                let pool = &pool;
                let barrier = &barrier;

                scope.spawn(move || {
                    let size = 8 * 1024;
                    let address = pool.alloc(size).unwrap();

                    unsafe {
                        address.as_ptr().write_bytes(t as u8, size);
                    }

                    barrier.wait();

                    unsafe {
                        // Check that no other thread scribbled over us.
                        for i in 0..size {
                            assert_eq!(*address.as_ptr().add(i), t as u8);
                        }
                        pool.free(address).unwrap();
                    }
                });
            }
        });

        pool.validate().unwrap();
        assert_eq!(pool.stats().used_bytes, 0);
    }

    /// Threads allocate, write, reallocate and free in interleaved bursts.
    #[test]
    fn multiple_threads_unsynchronized_churn() {
        let pool = Pool::new(32 * 1024 * 1024).unwrap();

        let num_threads = 8;
        let barrier = Barrier::new(num_threads);

        // Miri is really slow, but it doesn't need as many operations to
        // find bugs either.
        let rounds = if cfg!(miri) { 10 } else { 500 };

        thread::scope(|scope| {
            for t in 0..num_threads {
                let pool = &pool;
                let barrier = &barrier;

                scope.spawn(move || {
                    let sizes = [64, 256, 1024, 2048, 4096];
                    barrier.wait();

                    for round in 0..rounds {
                        let size = sizes[(t + round) % sizes.len()];
                        let address = pool.alloc(size).unwrap();

                        unsafe {
                            address.as_ptr().write_bytes(t as u8, size);

                            let grown = pool
                                .realloc(Some(address), size * 2)
                                .unwrap()
                                .unwrap();

                            for i in 0..size {
                                assert_eq!(*grown.as_ptr().add(i), t as u8);
                            }

                            pool.free(grown).unwrap();
                        }
                    }
                });
            }
        });

        pool.validate().unwrap();
        assert_eq!(pool.stats().used_bytes, 0);
    }
}
