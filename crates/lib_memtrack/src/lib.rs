//! Companion crate to [`memtrack`].  This crate compiles into a dynamic library exposing the
//! tracker through a C ABI: instrumented C code calls `mt_malloc`/`mt_free` instead of
//! `malloc`/`free` (passing `__FILE__`/`__LINE__` as the call site) and the final report is
//! printed automatically when the process exits normally.
//!
//! The tracker behind these entry points is process-global state guarded by a mutex, the
//! documented synchronization extension for multi-threaded hosts.  Its table capacity is fixed
//! at first use: `MEMTRACK_CAPACITY` overrides the default.  If `MEMTRACK_DUMP_DIR` is set, a
//! YAML snapshot is also written there at exit, for later aggregation with `mt_print`.

use std::collections::HashSet;
use std::env;
use std::ffi::CStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{c_char, c_void};
use memtrack::{CallSite, Tracker, DEFAULT_CAPACITY};
use once_cell::sync::Lazy;

static TRACKER: Lazy<Mutex<Tracker>> = Lazy::new(|| {
    let _ = env_logger::try_init();
    unsafe { libc::atexit(report_at_exit) };
    let capacity = env::var("MEMTRACK_CAPACITY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_CAPACITY);
    Mutex::new(Tracker::with_capacity(capacity))
});

// C file-name strings interned once per distinct file, so records can hold
// `&'static str` like their Rust-captured counterparts.
static FILE_NAMES: Lazy<Mutex<HashSet<&'static str>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn tracker() -> MutexGuard<'static, Tracker> {
    // A panic while holding the lock leaves the table usable; keep reporting.
    TRACKER.lock().unwrap_or_else(PoisonError::into_inner)
}

extern "C" fn report_at_exit() {
    let mut tracker = tracker();
    if let Ok(dir) = env::var("MEMTRACK_DUMP_DIR") {
        if let Err(e) = tracker.snapshot().write_to_dir(&dir) {
            eprintln!("failed to write memtrack snapshot: {}", e);
        }
    }
    tracker.print_report();
}

fn intern_file(file: *const c_char) -> &'static str {
    if file.is_null() {
        return "<unknown>";
    }
    let name = unsafe { CStr::from_ptr(file) }.to_string_lossy();
    let mut names = FILE_NAMES.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(&interned) = names.get(name.as_ref()) {
        return interned;
    }
    let interned: &'static str = Box::leak(name.into_owned().into_boxed_str());
    names.insert(interned);
    interned
}

/// Allocates `size` bytes through the global tracker, registering `file:line` as the call site.
/// Returns whatever the underlying allocator produced, even when tracking failed.
///
/// # Safety
///
/// `file` must be null or point to a NUL-terminated string (`__FILE__` qualifies).
#[no_mangle]
pub unsafe extern "C" fn mt_malloc(size: libc::size_t, file: *const c_char, line: u32) -> *mut c_void {
    let site = CallSite::new(intern_file(file), line);
    tracker().allocate_at(size, site) as *mut c_void
}

/// Frees memory previously returned by [`mt_malloc`].  Null pointers, double frees and pointers
/// the tracker never registered are refused (counted and logged) rather than forwarded to the
/// underlying allocator.
///
/// # Safety
///
/// If `ptr` is a live tracked allocation it is released and must not be used afterwards.
/// `file` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mt_free(ptr: *mut c_void, file: *const c_char, line: u32) {
    let site = CallSite::new(intern_file(file), line);
    tracker().deallocate_at(ptr as *mut u8, site);
}

/// Prints the global tracker's report to stderr.  Also runs automatically at normal process
/// exit; calling it earlier suppresses nothing, the report reflects the state at call time.
#[no_mangle]
pub extern "C" fn mt_print_report() {
    tracker().print_report();
}
