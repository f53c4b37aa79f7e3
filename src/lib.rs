//! `memtrack` is an instrumented memory-allocation tracker.  It wraps an
//! untracked allocator, records per-allocation metadata (address, size and
//! call site) in a fixed-capacity table, refuses erroneous deallocation
//! requests instead of forwarding them to the underlying allocator, and
//! prints a usage/leak report when the tracked program ends.
//!
//! Unlike heap profilers that sample or aggregate, `memtrack` keeps one
//! record per live allocation, so the final report can name the exact source
//! location of every allocation that was never freed.  The table does not
//! grow: once its capacity is reached, further allocations still succeed but
//! are no longer tracked.  A full table degrades observability, never the
//! program under test.
//!
//! ## Tracking allocations in a Rust program
//!
//! Create a [`Tracker`] and route allocation calls through it.  Call sites
//! are captured automatically via `#[track_caller]`:
//!
//! ```
//! use memtrack::Tracker;
//!
//! let mut tracker = Tracker::with_capacity(1024);
//! let ptr = tracker.allocate(64);
//! // ... use the memory ...
//! unsafe { tracker.deallocate(ptr) };
//! ```
//!
//! When the tracker is dropped at the end of `main`, it prints its report to
//! stderr, unless [`Tracker::print_report`] was already called.
//!
//! ## Tracking allocations in a C program
//!
//! The companion `lib_memtrack` crate compiles into a dynamic library that
//! exposes `mt_malloc`/`mt_free`/`mt_print_report` with a C ABI, backed by a
//! process-global tracker, for instrumenting programs in other languages.
//!
//! ## Viewing dumped reports
//!
//! A [`Snapshot`] of the tracker state can be serialized to disk with
//! [`Snapshot::write_to_dir`].  The `mt_print` tool aggregates and prints
//! dumped snapshots:
//!
//! ```bash
//! mt_print --dir <report dir>
//! ```

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::process;

use log::warn;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of slots in a tracker's allocation table unless configured
/// otherwise.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// Source location of an allocation or deallocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    pub fn new(file: &'static str, line: u32) -> Self {
        CallSite { file, line }
    }

    /// Captures the location of the calling code.  Propagates through
    /// `#[track_caller]` frames, so a tracker method annotated with
    /// `#[track_caller]` records its own caller, not itself.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        CallSite {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl Display for CallSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Why an allocation could not be registered in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InsertError {
    /// The underlying allocator returned no memory for the requested size.
    #[error("underlying allocator returned no memory")]
    AllocationFailed,
    /// The table has no free slot.  The allocation itself still succeeded;
    /// only its tracking is lost.
    #[error("allocation table capacity reached")]
    CapacityExceeded,
}

/// Why a deallocation request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EraseError {
    /// Deallocation requested on a null address.
    #[error("attempted to free a null pointer")]
    NullFree,
    /// No live record matches the address: either a double free or a pointer
    /// this tracker never registered.  The two cases are indistinguishable.
    #[error("double free or free of an untracked pointer")]
    UntrackedFree,
}

/// Aggregate allocation statistics maintained by an [`AllocationTable`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_allocated_bytes: usize,
    pub total_freed_bytes: usize,
    pub current_allocated_bytes: usize,
    pub max_allocated_bytes: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    pub failed_allocation_count: u64,
    pub null_free_count: u64,
    pub untracked_free_count: u64,
}

impl Stats {
    /// Total number of refused deallocation requests (null frees plus double
    /// or untracked frees).
    pub fn invalid_free_count(&self) -> u64 {
        self.null_free_count + self.untracked_free_count
    }

    /// Bytes that were allocated and never freed.  Kept as an explicit
    /// difference rather than `current_allocated_bytes`: the report defines
    /// leakage in terms of what was handed out versus what came back.
    pub fn leaked_bytes(&self) -> usize {
        self.total_allocated_bytes - self.total_freed_bytes
    }

    /// Adds another tracker's statistics to this one.  Peak usage of
    /// independent trackers may not coincide, so the merged
    /// `max_allocated_bytes` is the sum of the peaks, an upper bound.
    pub fn merge(&mut self, other: &Stats) {
        self.total_allocated_bytes += other.total_allocated_bytes;
        self.total_freed_bytes += other.total_freed_bytes;
        self.current_allocated_bytes += other.current_allocated_bytes;
        self.max_allocated_bytes += other.max_allocated_bytes;
        self.allocation_count += other.allocation_count;
        self.free_count += other.free_count;
        self.failed_allocation_count += other.failed_allocation_count;
        self.null_free_count += other.null_free_count;
        self.untracked_free_count += other.untracked_free_count;
    }
}

/// Metadata for one live allocation.
#[derive(Clone, Copy, Debug)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub site: CallSite,
}

/// Fixed-capacity registry of live allocations.
///
/// Each slot holds at most one [`AllocationRecord`]; an empty slot is `None`.
/// A slot becomes occupied only through a successful [`insert`] and empty
/// again only through a successful [`erase`] of the matching address.  All
/// lookups are linear scans, so every operation costs O(capacity).
///
/// [`insert`]: AllocationTable::insert
/// [`erase`]: AllocationTable::erase
#[derive(Debug)]
pub struct AllocationTable {
    slots: Box<[Option<AllocationRecord>]>,
    stats: Stats,
}

impl AllocationTable {
    pub fn new(capacity: usize) -> Self {
        AllocationTable {
            slots: vec![None; capacity].into_boxed_slice(),
            stats: Stats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of currently occupied slots.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Occupied slots in slot order.
    pub fn live_records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Linear scan for the live record registered at `address`.
    pub fn find(&self, address: usize) -> Option<&AllocationRecord> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref())
            .find(|record| record.address == address)
    }

    // First unoccupied slot, or `None` when the table is full.
    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    /// Registers an allocation of `size` bytes at `address`.
    ///
    /// A null `address` means the underlying allocator itself failed; a full
    /// table means tracking capacity ran out.  Both count as failed
    /// allocations and neither adds a record.
    pub fn insert(
        &mut self,
        address: usize,
        size: usize,
        site: CallSite,
    ) -> Result<(), InsertError> {
        if address == 0 {
            warn!("memory allocation failed at {}", site);
            self.stats.failed_allocation_count += 1;
            return Err(InsertError::AllocationFailed);
        }

        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => {
                warn!("allocation table capacity reached at {}", site);
                self.stats.failed_allocation_count += 1;
                return Err(InsertError::CapacityExceeded);
            }
        };

        self.slots[slot] = Some(AllocationRecord {
            address,
            size,
            site,
        });

        self.stats.total_allocated_bytes += size;
        self.stats.current_allocated_bytes += size;
        if self.stats.current_allocated_bytes > self.stats.max_allocated_bytes {
            self.stats.max_allocated_bytes = self.stats.current_allocated_bytes;
        }
        self.stats.allocation_count += 1;
        Ok(())
    }

    /// Removes the record registered at `address` and returns its size.
    ///
    /// Refused requests (null address, or no matching record) increment their
    /// counter and leave every size statistic untouched.
    pub fn erase(&mut self, address: usize, site: CallSite) -> Result<usize, EraseError> {
        if address == 0 {
            warn!("tried to free a null pointer at {}", site);
            self.stats.null_free_count += 1;
            return Err(EraseError::NullFree);
        }

        for slot in self.slots.iter_mut() {
            match slot {
                Some(record) if record.address == address => {
                    let size = record.size;
                    self.stats.total_freed_bytes += size;
                    self.stats.current_allocated_bytes -= size;
                    self.stats.free_count += 1;
                    *slot = None;
                    return Ok(size);
                }
                _ => {}
            }
        }

        warn!("double free or invalid free at {}", site);
        self.stats.untracked_free_count += 1;
        Err(EraseError::UntrackedFree)
    }
}

/// The untracked allocator a [`Tracker`] delegates to.
///
/// Implemented by [`SystemAllocator`] for real memory; tests inject mock
/// backends to exercise failure paths without touching the heap.
pub trait RawAllocator {
    /// Requests `size` bytes.  Returns null on failure.
    fn malloc(&self, size: usize) -> *mut u8;

    /// Releases memory previously returned by [`malloc`](RawAllocator::malloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator's `malloc` and must
    /// not have been freed before.
    unsafe fn free(&self, ptr: *mut u8);
}

/// [`RawAllocator`] backed by the C allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn malloc(&self, size: usize) -> *mut u8 {
        unsafe { libc::malloc(size) as *mut u8 }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr as *mut libc::c_void);
    }
}

/// Façade over an untracked allocator that registers every allocation it
/// hands out and refuses bad deallocation requests.
///
/// Trackers are explicit objects rather than process-wide state, so a test
/// can run several independent ones.  A tracker is single-threaded; callers
/// that share one across threads must guard it externally (the companion
/// C-ABI crate wraps its global tracker in a mutex).
///
/// Dropping a tracker prints its report to stderr unless
/// [`print_report`](Tracker::print_report) already ran.
#[derive(Debug)]
pub struct Tracker<A: RawAllocator = SystemAllocator> {
    backend: A,
    table: AllocationTable,
    reported: bool,
}

impl Tracker<SystemAllocator> {
    /// Tracker over the C allocator with [`DEFAULT_CAPACITY`] table slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_backend(SystemAllocator, capacity)
    }
}

impl Default for Tracker<SystemAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: RawAllocator> Tracker<A> {
    pub fn with_backend(backend: A, capacity: usize) -> Self {
        Tracker {
            backend,
            table: AllocationTable::new(capacity),
            reported: false,
        }
    }

    pub fn backend(&self) -> &A {
        &self.backend
    }

    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    pub fn stats(&self) -> &Stats {
        self.table.stats()
    }

    /// Allocates `size` bytes and registers the allocation under the
    /// caller's source location.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        self.allocate_at(size, CallSite::caller())
    }

    /// Allocates `size` bytes and registers the allocation under an explicit
    /// call site.
    ///
    /// The backend's pointer is always returned to the caller, even when
    /// registration failed: a null pointer on genuine allocation failure, or
    /// a valid but untracked pointer when the table is full.
    pub fn allocate_at(&mut self, size: usize, site: CallSite) -> *mut u8 {
        let ptr = self.backend.malloc(size);
        // Registration failures are already counted and logged by the table.
        let _ = self.table.insert(ptr as usize, size, site);
        ptr
    }

    /// Deallocates `ptr`, capturing the caller's source location.
    ///
    /// # Safety
    ///
    /// If `ptr` matches a live record, it must still be valid memory obtained
    /// from this tracker's backend; it is released and must not be used
    /// afterwards.  Null and unregistered pointers are refused and left
    /// untouched.
    #[track_caller]
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        self.deallocate_at(ptr, CallSite::caller());
    }

    /// Deallocates `ptr` under an explicit call site.
    ///
    /// The pointer is forwarded to the backend only when the erase succeeds.
    /// A refused request (null or untracked address) never reaches the
    /// backend, so a double free is downgraded from a crash to a report
    /// entry.  The flip side: a pointer the table never registered, for
    /// example because capacity ran out, is never released through this
    /// path.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Tracker::deallocate).
    pub unsafe fn deallocate_at(&mut self, ptr: *mut u8, site: CallSite) {
        if self.table.erase(ptr as usize, site).is_ok() {
            self.backend.free(ptr);
        }
    }

    /// Snapshot of the current statistics and still-live records, suitable
    /// for serialization and merging.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            stats: *self.table.stats(),
            leaks: self
                .table
                .live_records()
                .map(|record| Leak {
                    file: record.site.file.to_string(),
                    line: record.site.line,
                    address: record.address,
                    size: record.size,
                })
                .collect(),
        }
    }

    /// Prints the report to stderr and suppresses the report the tracker
    /// would otherwise print when dropped.
    pub fn print_report(&mut self) {
        self.reported = true;
        eprintln!("{}", self.snapshot());
    }
}

// Runs when the tracker goes out of scope, normally at the end of main.
// This is the report-on-normal-termination hook; an abort skips it.
impl<A: RawAllocator> Drop for Tracker<A> {
    fn drop(&mut self) {
        if !self.reported {
            self.print_report();
        }
    }
}

/// One leaked allocation in a [`Snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leak {
    pub file: String,
    pub line: u32,
    pub address: usize,
    pub size: usize,
}

/// Serializable view of a tracker: its statistics plus every allocation that
/// was still live when the snapshot was taken, in table slot order.
///
/// `Display` renders the report.  Snapshots dumped by independent trackers
/// (or processes) can be merged and printed with the `mt_print` tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: Stats,
    pub leaks: Vec<Leak>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges another snapshot into this one: statistics are added, leak
    /// records concatenated.
    pub fn merge(&mut self, other: &Snapshot) {
        self.stats.merge(&other.stats);
        self.leaks.extend(other.leaks.iter().cloned());
    }

    /// Dumps the snapshot as YAML into `dir` (created if missing), named
    /// `memtrack.<pid>`, and returns the file path.
    pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("memtrack.{}", process::id()));
        fs::write(&path, yaml)?;
        Ok(path)
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        let stats = &self.stats;
        writeln!(f, "======= memory report =======")?;
        writeln!(
            f,
            "total allocations       : {}",
            stats.allocation_count.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "total frees             : {}",
            stats.free_count.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "failed allocations      : {}",
            stats.failed_allocation_count.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "double/invalid frees    : {}",
            stats.invalid_free_count().to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "total memory allocated  : {} bytes",
            stats.total_allocated_bytes.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "total memory freed      : {} bytes",
            stats.total_freed_bytes.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "current allocated memory: {} bytes",
            stats.current_allocated_bytes.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "max allocated memory    : {} bytes",
            stats.max_allocated_bytes.to_formatted_string(&Locale::en)
        )?;
        writeln!(
            f,
            "memory leaked           : {} bytes",
            stats.leaked_bytes().to_formatted_string(&Locale::en)
        )?;
        writeln!(f, "=============================")?;

        if stats.current_allocated_bytes != 0 {
            writeln!(f)?;
            writeln!(f, "======= detailed leaks =======")?;
            for leak in &self.leaks {
                writeln!(
                    f,
                    "leak at {}:{} - address: {:#x}, size: {} bytes",
                    leak.file,
                    leak.line,
                    leak.address,
                    leak.size.to_formatted_string(&Locale::en)
                )?;
            }
            writeln!(f, "=============================")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::env;
    use std::fs;
    use std::process;

    use super::*;

    fn site() -> CallSite {
        CallSite::new("test.rs", 1)
    }

    fn assert_stats_identity(stats: &Stats) {
        assert_eq!(
            stats.current_allocated_bytes,
            stats.total_allocated_bytes - stats.total_freed_bytes
        );
        assert!(stats.max_allocated_bytes >= stats.current_allocated_bytes);
    }

    /// Backend that hands out distinct fake addresses and records every
    /// pointer forwarded to `free`.  Nothing is dereferenced.
    struct MockAllocator {
        next_address: Cell<usize>,
        fail_next: Cell<bool>,
        freed: RefCell<Vec<usize>>,
    }

    impl MockAllocator {
        fn new() -> Self {
            MockAllocator {
                next_address: Cell::new(0x1000),
                fail_next: Cell::new(false),
                freed: RefCell::new(Vec::new()),
            }
        }

        fn freed(&self) -> Vec<usize> {
            self.freed.borrow().clone()
        }
    }

    impl RawAllocator for MockAllocator {
        fn malloc(&self, _size: usize) -> *mut u8 {
            if self.fail_next.replace(false) {
                return std::ptr::null_mut();
            }
            let address = self.next_address.get();
            self.next_address.set(address + 0x10);
            address as *mut u8
        }

        unsafe fn free(&self, ptr: *mut u8) {
            self.freed.borrow_mut().push(ptr as usize);
        }
    }

    fn mock_tracker(capacity: usize) -> Tracker<MockAllocator> {
        Tracker::with_backend(MockAllocator::new(), capacity)
    }

    #[test]
    fn stats_identity_holds_across_operations() {
        let mut table = AllocationTable::new(4);
        assert_stats_identity(table.stats());

        table.insert(0x10, 100, site()).unwrap();
        assert_stats_identity(table.stats());

        table.insert(0x20, 50, site()).unwrap();
        assert_stats_identity(table.stats());

        table.erase(0x10, site()).unwrap();
        assert_stats_identity(table.stats());

        // Refused operations must not disturb the identity either.
        assert_eq!(
            table.insert(0, 7, site()),
            Err(InsertError::AllocationFailed)
        );
        assert_stats_identity(table.stats());
        assert_eq!(table.erase(0x10, site()), Err(EraseError::UntrackedFree));
        assert_stats_identity(table.stats());
        assert_eq!(table.erase(0, site()), Err(EraseError::NullFree));
        assert_stats_identity(table.stats());
    }

    #[test]
    fn max_allocated_is_monotone() {
        let mut table = AllocationTable::new(4);
        table.insert(0x10, 10, site()).unwrap();
        table.insert(0x20, 20, site()).unwrap();
        assert_eq!(table.stats().max_allocated_bytes, 30);

        table.erase(0x20, site()).unwrap();
        assert_eq!(table.stats().max_allocated_bytes, 30);

        table.insert(0x30, 5, site()).unwrap();
        assert_eq!(table.stats().max_allocated_bytes, 30);
        assert_eq!(table.stats().current_allocated_bytes, 15);

        table.insert(0x40, 100, site()).unwrap();
        assert_eq!(table.stats().max_allocated_bytes, 115);
    }

    #[test]
    fn insert_then_erase_restores_table_state() {
        let mut table = AllocationTable::new(4);
        table.insert(0x10, 64, site()).unwrap();
        let before = *table.stats();
        let live_before = table.live_count();

        table.insert(0x20, 128, site()).unwrap();
        let removed = table.erase(0x20, site()).unwrap();

        assert_eq!(removed, 128);
        assert_eq!(table.live_count(), live_before);
        assert_eq!(
            table.stats().current_allocated_bytes,
            before.current_allocated_bytes
        );
    }

    #[test]
    fn double_erase_counts_as_untracked_free() {
        let mut table = AllocationTable::new(4);
        table.insert(0x10, 32, site()).unwrap();
        assert_eq!(table.erase(0x10, site()), Ok(32));

        let before = *table.stats();
        assert_eq!(table.erase(0x10, site()), Err(EraseError::UntrackedFree));

        let after = table.stats();
        assert_eq!(after.untracked_free_count, before.untracked_free_count + 1);
        assert_eq!(after.total_freed_bytes, before.total_freed_bytes);
        assert_eq!(
            after.current_allocated_bytes,
            before.current_allocated_bytes
        );
        assert_eq!(after.free_count, before.free_count);
    }

    #[test]
    fn null_free_counted_without_touching_sizes() {
        let mut table = AllocationTable::new(4);
        table.insert(0x10, 32, site()).unwrap();
        let before = *table.stats();

        assert_eq!(table.erase(0, site()), Err(EraseError::NullFree));

        let after = table.stats();
        assert_eq!(after.null_free_count, before.null_free_count + 1);
        assert_eq!(after.total_freed_bytes, before.total_freed_bytes);
        assert_eq!(
            after.current_allocated_bytes,
            before.current_allocated_bytes
        );
    }

    #[test]
    fn null_insert_counts_as_failed_allocation() {
        let mut table = AllocationTable::new(4);
        assert_eq!(
            table.insert(0, 32, site()),
            Err(InsertError::AllocationFailed)
        );
        assert_eq!(table.stats().failed_allocation_count, 1);
        assert_eq!(table.stats().allocation_count, 0);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn capacity_boundary() {
        let capacity = 4;
        let mut table = AllocationTable::new(capacity);
        for i in 0..capacity {
            table.insert(0x1000 + i * 0x10, 8, site()).unwrap();
        }

        assert_eq!(
            table.insert(0x9999, 8, site()),
            Err(InsertError::CapacityExceeded)
        );
        assert_eq!(table.stats().failed_allocation_count, 1);
        assert_eq!(table.stats().allocation_count, capacity as u64);
        assert_eq!(table.live_count(), capacity);
        assert!(table.find(0x9999).is_none());
    }

    #[test]
    fn find_matches_live_records_only() {
        let mut table = AllocationTable::new(4);
        table.insert(0x10, 64, site()).unwrap();

        let record = table.find(0x10).unwrap();
        assert_eq!(record.size, 64);
        assert!(table.find(0x20).is_none());

        table.erase(0x10, site()).unwrap();
        assert!(table.find(0x10).is_none());
    }

    #[test]
    fn erased_slot_is_reused_first() {
        let mut table = AllocationTable::new(3);
        table.insert(0xa, 1, site()).unwrap();
        table.insert(0xb, 2, site()).unwrap();
        table.insert(0xc, 3, site()).unwrap();
        table.erase(0xa, site()).unwrap();
        table.insert(0xd, 4, site()).unwrap();

        let order: Vec<usize> = table.live_records().map(|r| r.address).collect();
        assert_eq!(order, vec![0xd, 0xb, 0xc]);
    }

    #[test]
    fn tracker_returns_backend_pointer_and_registers_it() {
        let mut tracker = mock_tracker(4);
        let ptr = tracker.allocate_at(10, site());
        assert!(!ptr.is_null());
        assert_eq!(tracker.stats().allocation_count, 1);
        assert_eq!(tracker.table().find(ptr as usize).unwrap().size, 10);
    }

    #[test]
    fn tracker_returns_null_when_backend_fails() {
        let mut tracker = mock_tracker(4);
        tracker.backend().fail_next.set(true);

        let ptr = tracker.allocate_at(10, site());
        assert!(ptr.is_null());
        assert_eq!(tracker.stats().failed_allocation_count, 1);
        assert_eq!(tracker.stats().allocation_count, 0);
    }

    #[test]
    fn full_table_still_returns_usable_pointer() {
        let mut tracker = mock_tracker(1);
        let first = tracker.allocate_at(8, site());
        let second = tracker.allocate_at(8, site());

        assert!(!first.is_null());
        assert!(!second.is_null());
        assert_eq!(tracker.stats().allocation_count, 1);
        assert_eq!(tracker.stats().failed_allocation_count, 1);
        // The untracked pointer can never be released through the tracker.
        assert!(tracker.table().find(second as usize).is_none());
    }

    #[test]
    fn deallocate_forwards_to_backend_only_on_success() {
        let mut tracker = mock_tracker(4);
        let ptr = tracker.allocate_at(16, site());

        unsafe { tracker.deallocate_at(ptr, site()) };
        assert_eq!(tracker.backend().freed(), vec![ptr as usize]);
        assert_eq!(tracker.stats().free_count, 1);

        // Double free: refused, not forwarded.
        unsafe { tracker.deallocate_at(ptr, site()) };
        assert_eq!(tracker.backend().freed().len(), 1);
        assert_eq!(tracker.stats().untracked_free_count, 1);

        // Null free: refused, not forwarded.
        unsafe { tracker.deallocate_at(std::ptr::null_mut(), site()) };
        assert_eq!(tracker.backend().freed().len(), 1);
        assert_eq!(tracker.stats().null_free_count, 1);
    }

    #[test]
    fn track_caller_records_this_file() {
        let mut tracker = mock_tracker(4);
        let ptr = tracker.allocate(4);
        let record = tracker.table().find(ptr as usize).unwrap();
        assert_eq!(record.site.file, file!());
    }

    #[test]
    fn end_to_end_report_scenario() {
        let mut tracker = mock_tracker(8);
        let a = tracker.allocate_at(10, CallSite::new("alpha.rs", 11));
        let b = tracker.allocate_at(20, CallSite::new("beta.rs", 22));
        let c = tracker.allocate_at(30, CallSite::new("gamma.rs", 33));

        assert_eq!(tracker.stats().current_allocated_bytes, 60);
        assert_eq!(tracker.stats().max_allocated_bytes, 60);

        unsafe { tracker.deallocate_at(b, site()) };
        assert_eq!(tracker.stats().current_allocated_bytes, 40);
        assert_eq!(tracker.stats().max_allocated_bytes, 60);
        assert_eq!(tracker.stats().free_count, 1);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.stats.leaked_bytes(), 40);
        assert_eq!(snapshot.leaks.len(), 2);
        assert_eq!(snapshot.leaks[0].address, a as usize);
        assert_eq!(snapshot.leaks[0].size, 10);
        assert_eq!(snapshot.leaks[1].address, c as usize);
        assert_eq!(snapshot.leaks[1].size, 30);

        let report = snapshot.to_string();
        assert!(report.contains("total allocations       : 3"));
        assert!(report.contains("total frees             : 1"));
        assert!(report.contains("memory leaked           : 40 bytes"));
        assert!(report.contains("leak at alpha.rs:11"));
        assert!(report.contains("leak at gamma.rs:33"));
        assert!(!report.contains("beta.rs"));
    }

    #[test]
    fn report_omits_leak_section_when_everything_was_freed() {
        let mut tracker = mock_tracker(4);
        let ptr = tracker.allocate_at(10, site());
        unsafe { tracker.deallocate_at(ptr, site()) };

        let report = tracker.snapshot().to_string();
        assert!(!report.contains("detailed leaks"));
        assert!(report.contains("memory leaked           : 0 bytes"));
    }

    #[test]
    fn snapshot_merge_adds_stats_and_concatenates_leaks() {
        let mut first = mock_tracker(4);
        first.allocate_at(10, CallSite::new("one.rs", 1));

        let mut second = mock_tracker(4);
        second.allocate_at(20, CallSite::new("two.rs", 2));
        let extra = second.allocate_at(30, site());
        unsafe { second.deallocate_at(extra, site()) };

        let mut aggregate = Snapshot::new();
        aggregate.merge(&first.snapshot());
        aggregate.merge(&second.snapshot());

        assert_eq!(aggregate.stats.allocation_count, 3);
        assert_eq!(aggregate.stats.free_count, 1);
        assert_eq!(aggregate.stats.total_allocated_bytes, 60);
        assert_eq!(aggregate.stats.current_allocated_bytes, 30);
        assert_eq!(aggregate.leaks.len(), 2);
        assert_stats_identity(&aggregate.stats);
    }

    #[test]
    fn snapshot_round_trips_through_yaml_dump() {
        let mut tracker = mock_tracker(4);
        tracker.allocate_at(10, CallSite::new("one.rs", 1));
        let snapshot = tracker.snapshot();

        let dir = env::temp_dir().join(format!("memtrack_test_{}", process::id()));
        let path = snapshot.write_to_dir(&dir).unwrap();
        let bytes = fs::read(&path).unwrap();
        let restored: Snapshot = serde_yaml::from_slice(&bytes).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(restored, snapshot);
    }
}
