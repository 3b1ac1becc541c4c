// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the native primitives: pthread mutexes and
// condition variables (process-local, process-shared, robust), named
// counting semaphores, and shared memory mappings.
//
// Everything here speaks errno. The portable layer above decides which
// failures are fatal and which are reported.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::naming;

// ---------------------------------------------------------------------------
// Robust mutex symbols: not exposed by the `libc` crate on every platform.
// macOS has no robust mutexes; there the lock degrades to a plain
// process-shared mutex.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
pub(crate) const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
pub(crate) const ENOTRECOVERABLE: i32 = libc::ENOTRECOVERABLE;

// Never returned on macOS; keeps the callers free of cfg noise.
#[cfg(target_os = "macos")]
pub(crate) const EOWNERDEAD: i32 = -1;

#[cfg(target_os = "macos")]
pub(crate) const ENOTRECOVERABLE: i32 = -2;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// Whether owner-death detection is available.
pub(crate) const ROBUST_SUPPORTED: bool = cfg!(not(target_os = "macos"));

/// How a native mutex is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutexKind {
    Regular,
    ProcessShared,
    Robust,
}

// ---------------------------------------------------------------------------
// pthread mutex
// ---------------------------------------------------------------------------

/// Initialise the `pthread_mutex_t` at `mtx`. Returns an errno.
///
/// # Safety
/// `mtx` must point to writable memory large enough for a mutex that is not
/// in use by any thread or process.
pub(crate) unsafe fn mutex_init(mtx: *mut libc::pthread_mutex_t, kind: MutexKind) -> i32 {
    ptr::write_bytes(mtx, 0, 1);

    if kind == MutexKind::Regular {
        return libc::pthread_mutex_init(mtx, ptr::null());
    }

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return eno;
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return eno;
    }

    #[cfg(not(target_os = "macos"))]
    if kind == MutexKind::Robust {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return eno;
        }
    }

    eno = libc::pthread_mutex_init(mtx, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    eno
}

pub(crate) unsafe fn mutex_lock(mtx: *mut libc::pthread_mutex_t) -> i32 {
    libc::pthread_mutex_lock(mtx)
}

pub(crate) unsafe fn mutex_trylock(mtx: *mut libc::pthread_mutex_t) -> i32 {
    libc::pthread_mutex_trylock(mtx)
}

pub(crate) unsafe fn mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> i32 {
    libc::pthread_mutex_unlock(mtx)
}

pub(crate) unsafe fn mutex_destroy(mtx: *mut libc::pthread_mutex_t) -> i32 {
    libc::pthread_mutex_destroy(mtx)
}

/// Clear the inconsistent state of a robust mutex after `EOWNERDEAD`.
pub(crate) unsafe fn mutex_consistent(mtx: *mut libc::pthread_mutex_t) -> i32 {
    #[cfg(not(target_os = "macos"))]
    {
        pthread_mutex_consistent(mtx)
    }
    #[cfg(target_os = "macos")]
    {
        let _ = mtx;
        0
    }
}

// ---------------------------------------------------------------------------
// pthread condition variable
// ---------------------------------------------------------------------------

/// Initialise the `pthread_cond_t` at `cond`. Returns an errno.
///
/// # Safety
/// `cond` must point to writable memory large enough for a condition
/// variable that nobody is waiting on.
pub(crate) unsafe fn cond_init(cond: *mut libc::pthread_cond_t, process_shared: bool) -> i32 {
    ptr::write_bytes(cond, 0, 1);

    if !process_shared {
        return libc::pthread_cond_init(cond, ptr::null());
    }

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_condattr_init(&mut attr);
    if eno != 0 {
        return eno;
    }

    eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_condattr_destroy(&mut attr);
        return eno;
    }

    eno = libc::pthread_cond_init(cond, &attr);
    libc::pthread_condattr_destroy(&mut attr);
    eno
}

pub(crate) unsafe fn cond_destroy(cond: *mut libc::pthread_cond_t) -> i32 {
    libc::pthread_cond_destroy(cond)
}

pub(crate) unsafe fn cond_wait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
) -> i32 {
    libc::pthread_cond_wait(cond, mtx)
}

/// Wait with a relative timeout; returns `ETIMEDOUT` when it elapses.
pub(crate) unsafe fn cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
    timeout: Duration,
) -> i32 {
    let ts = realtime_deadline(timeout);
    libc::pthread_cond_timedwait(cond, mtx, &ts)
}

pub(crate) unsafe fn cond_signal(cond: *mut libc::pthread_cond_t) -> i32 {
    libc::pthread_cond_signal(cond)
}

pub(crate) unsafe fn cond_broadcast(cond: *mut libc::pthread_cond_t) -> i32 {
    libc::pthread_cond_broadcast(cond)
}

/// Absolute `CLOCK_REALTIME` deadline `timeout` from now.
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let deadline = now.saturating_add(timeout);
    libc::timespec {
        tv_sec: deadline.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as libc::c_long,
    }
}

/// Adaptive backoff: busy spin, then CPU pause hints, then yield, then sleep.
#[cfg(target_os = "macos")]
#[inline]
fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

// ---------------------------------------------------------------------------
// PlatformSemaphore: POSIX named counting semaphore
// ---------------------------------------------------------------------------

pub struct PlatformSemaphore {
    sem: *mut libc::sem_t,
    name: String, // POSIX name (with leading '/')
}

// Safety: sem_t operations are thread-safe; the handle is only closed on drop.
unsafe impl Send for PlatformSemaphore {}
unsafe impl Sync for PlatformSemaphore {}

impl PlatformSemaphore {
    /// Open the named semaphore, creating it with `initial` permits if it
    /// does not exist yet.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        let posix_name = naming::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                perms as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(target: "shmsync::semaphore", name = %posix_name, "opened semaphore");
        Ok(Self {
            sem,
            name: posix_name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a permit is available and take it.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Take a permit if one is available right now.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Wait up to `timeout` for a permit. `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        #[cfg(target_os = "macos")]
        {
            // macOS lacks sem_timedwait; poll with try_wait instead.
            let deadline = std::time::Instant::now() + timeout;
            let mut k = 0u32;
            loop {
                if self.try_wait()? {
                    return Ok(true);
                }
                if std::time::Instant::now() >= deadline {
                    return Ok(false);
                }
                adaptive_yield(&mut k);
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            let ts = realtime_deadline(timeout);
            loop {
                if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                }
            }
        }
    }

    /// Release `count` permits.
    pub fn post(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Remove a named semaphore. Open handles stay usable.
    pub fn unlink_by_name(name: &str) {
        let posix_name = naming::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
    }
}

// ---------------------------------------------------------------------------
// Layout helpers for named segments: the user region is followed by an
// `AtomicI32` reference counter shared by every process mapping it.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// Returns a reference to the trailing `AtomicI32` ref-counter inside a mapped
/// region of `total_size` bytes starting at `mem`.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm: POSIX shared memory segment or memory-mapped file
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Backing {
    /// `shm_open` segment with a trailing reference counter.
    Segment { name: String, prev_ref: i32 },
    /// Regular file; lives on after every mapping is gone.
    File,
}

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,      // total mapped size (including ref counter for segments)
    user_size: usize, // user-requested size
    device: u64,
    inode: u64,
    backing: Backing,
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

/// Open mode flags for named segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Acquire a named shared memory segment of `user_size` usable bytes.
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = naming::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;
        let total_size = calc_size(user_size);

        let open_excl = || unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            )
        };
        let open_existing =
            || unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };

        // For CreateOrOpen: try exclusive create first so we only call ftruncate
        // when we actually own the new object.  On macOS, calling ftruncate on an
        // already-sized shm object can zero its contents before returning EINVAL.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = open_excl();
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f = open_existing();
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = open_excl();
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = open_existing();
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        // Ensure permissions regardless of umask.
        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let (mem, device, inode) = map_fd(fd, total_size)?;

        // Count ourselves in; 0 before the increment means we were first.
        let prev_ref = unsafe { acc_of(mem, total_size).fetch_add(1, Ordering::AcqRel) };
        tracing::debug!(
            target: "shmsync::shm",
            name = %posix_name,
            size = user_size,
            prev_ref,
            "mapped segment"
        );

        Ok(Self {
            mem,
            size: total_size,
            user_size,
            device,
            inode,
            backing: Backing::Segment {
                name: posix_name,
                prev_ref,
            },
        })
    }

    /// Map `size` bytes of the file at `path`, creating it and growing it to
    /// `size` if needed. New bytes read as zero.
    pub fn map_file(path: &Path, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
                0o666 as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if (st.st_size as u64) < size as u64
            && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0
        {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let (mem, device, inode) = map_fd(fd, size)?;
        tracing::debug!(target: "shmsync::shm", path = %path.display(), size, "mapped file");

        Ok(Self {
            mem,
            size,
            user_size: size,
            device,
            inode,
            backing: Backing::File,
        })
    }

    /// Pointer to the user-visible region (excluding the trailing ref counter).
    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Total mapped size (including ref counter).
    pub fn mapped_size(&self) -> usize {
        self.size
    }

    /// User-requested size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Device id of the backing object.
    pub fn device(&self) -> u64 {
        self.device
    }

    /// Inode number of the backing object.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// POSIX name (with leading '/'), `None` for file mappings.
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Segment { name, .. } => Some(name),
            Backing::File => None,
        }
    }

    /// The ref count value *before* our own increment during acquire.
    /// Returns 0 if this handle was the first to map the segment.
    pub fn prev_ref_count(&self) -> i32 {
        match self.backing {
            Backing::Segment { prev_ref, .. } => prev_ref,
            Backing::File => 0,
        }
    }

    /// Current reference count (0 for file mappings).
    pub fn ref_count(&self) -> i32 {
        match self.backing {
            Backing::Segment { .. } => unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) },
            Backing::File => 0,
        }
    }

    /// Force-remove the backing segment (shm_unlink). Does NOT release the mapping.
    pub fn unlink(&self) {
        if let Backing::Segment { name, .. } = &self.backing {
            if let Ok(c_name) = CString::new(name.as_bytes()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }

    /// Unlink a named shm segment by name (static helper).
    pub fn unlink_by_name(name: &str) {
        let posix_name = naming::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        match self.backing {
            Backing::Segment { .. } => {
                // Decrement ref counter; if we're the last, also unlink.
                let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
                unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
                if prev <= 1 {
                    self.unlink();
                }
            }
            Backing::File => {
                unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
            }
        }
    }
}

/// `mmap` the whole of `fd` shared and read/write, then close it.
/// Returns the mapping and the (device, inode) identity of the object.
fn map_fd(fd: i32, size: usize) -> io::Result<(*mut u8, u64, u64)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };

    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok((mem as *mut u8, st.st_dev as u64, st.st_ino as u64))
}
