// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// CondVar: process-local, process-shared native, and semaphore-emulated.
// Shared variants live in a named segment laid out as a repr(C) monitor, and
// each emulated participant binds its own CondVar, as separate processes
// would.

mod common;

use std::mem::offset_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shmsync::naming::condvar_semaphore_name;
use shmsync::{
    CondVar, EmulationPolicy, Error, Mutex, NamedSemaphore, RobustMutex, RobustScopedLock,
    RobustState, SharedPart, ShmHandle, ShmOpenMode, SyncConfig, WaitStatus,
};

use common::{init_test_logging, unique_name, wait_until};

const SETTLE: Duration = Duration::from_secs(10);

/// Plain data guarded by the monitor's mutex.
#[derive(Clone, Copy)]
struct Cell(*mut u64);

unsafe impl Send for Cell {}
unsafe impl Sync for Cell {}

impl Cell {
    fn get(self) -> u64 {
        unsafe { *self.0 }
    }

    fn set(self, v: u64) {
        unsafe { *self.0 = v }
    }
}

#[repr(C)]
struct Monitor {
    mutex: Mutex,
    part: SharedPart,
    generation: u64,
    entered: u64,
}

#[repr(C)]
struct RobustMonitor {
    mutex: RobustMutex,
    part: SharedPart,
    value: u64,
    entered: u64,
}

/// A named segment holding one initialised `Monitor`.
struct SharedMonitor {
    shm: ShmHandle,
}

impl SharedMonitor {
    fn new(prefix: &str, policy: EmulationPolicy) -> Self {
        let name = unique_name(prefix);
        ShmHandle::unlink_by_name(&name);
        let shm = ShmHandle::acquire(&name, std::mem::size_of::<Monitor>(), ShmOpenMode::Create)
            .expect("acquire");
        let m = shm.as_mut_ptr() as *mut Monitor;
        unsafe {
            Mutex::init_process_shared(std::ptr::addr_of_mut!((*m).mutex));
            CondVar::init_shared_part_with(
                std::ptr::addr_of_mut!((*m).part),
                &SyncConfig::with_emulation(policy),
            );
        }
        CondVar::remove_semaphore(shm.device(), shm.inode(), offset_of!(Monitor, part));
        Self { shm }
    }

    fn monitor(&self) -> &Monitor {
        unsafe { &*(self.shm.as_ptr() as *const Monitor) }
    }

    fn bind(&self) -> CondVar {
        let mut cv = CondVar::process_shared();
        unsafe {
            cv.set_shared_part(
                &self.monitor().part,
                self.shm.device(),
                self.shm.inode(),
                offset_of!(Monitor, part),
            )
        };
        cv
    }

    fn generation(&self) -> Cell {
        Cell(unsafe { std::ptr::addr_of_mut!((*(self.shm.as_mut_ptr() as *mut Monitor)).generation) })
    }

    fn entered(&self) -> Cell {
        Cell(unsafe { std::ptr::addr_of_mut!((*(self.shm.as_mut_ptr() as *mut Monitor)).entered) })
    }
}

impl Drop for SharedMonitor {
    fn drop(&mut self) {
        CondVar::remove_semaphore(self.shm.device(), self.shm.inode(), offset_of!(Monitor, part));
    }
}

struct SharedRobustMonitor {
    shm: ShmHandle,
}

impl SharedRobustMonitor {
    fn new(prefix: &str, policy: EmulationPolicy) -> Self {
        let name = unique_name(prefix);
        ShmHandle::unlink_by_name(&name);
        let shm =
            ShmHandle::acquire(&name, std::mem::size_of::<RobustMonitor>(), ShmOpenMode::Create)
                .expect("acquire");
        let m = shm.as_mut_ptr() as *mut RobustMonitor;
        unsafe {
            RobustMutex::init_process_shared(std::ptr::addr_of_mut!((*m).mutex));
            CondVar::init_shared_part_with(
                std::ptr::addr_of_mut!((*m).part),
                &SyncConfig::with_emulation(policy),
            );
        }
        CondVar::remove_semaphore(shm.device(), shm.inode(), offset_of!(RobustMonitor, part));
        Self { shm }
    }

    fn monitor(&self) -> &RobustMonitor {
        unsafe { &*(self.shm.as_ptr() as *const RobustMonitor) }
    }

    fn bind(&self) -> CondVar {
        let mut cv = CondVar::process_shared();
        unsafe {
            cv.set_shared_part(
                &self.monitor().part,
                self.shm.device(),
                self.shm.inode(),
                offset_of!(RobustMonitor, part),
            )
        };
        cv
    }

    fn value(&self) -> Cell {
        Cell(unsafe {
            std::ptr::addr_of_mut!((*(self.shm.as_mut_ptr() as *mut RobustMonitor)).value)
        })
    }

    fn entered(&self) -> Cell {
        Cell(unsafe {
            std::ptr::addr_of_mut!((*(self.shm.as_mut_ptr() as *mut RobustMonitor)).entered)
        })
    }
}

impl Drop for SharedRobustMonitor {
    fn drop(&mut self) {
        CondVar::remove_semaphore(
            self.shm.device(),
            self.shm.inode(),
            offset_of!(RobustMonitor, part),
        );
    }
}

/// `waiters` threads wait for the generation to change; one `notify_all`
/// must release exactly all of them. `cvs[i]` is used by waiter `i`, the
/// last entry by the notifier.
fn check_notify_all(mutex: &Mutex, cvs: &[&CondVar], generation: Cell, entered: Cell) {
    let waiters = cvs.len() - 1;
    let woken = AtomicUsize::new(0);

    thread::scope(|s| {
        for &cv in &cvs[..waiters] {
            let woken = &woken;
            s.spawn(move || {
                let g = mutex.lock();
                let start = generation.get();
                entered.set(entered.get() + 1);
                while generation.get() == start {
                    cv.wait(&g);
                }
                drop(g);
                woken.fetch_add(1, Ordering::SeqCst);
            });
        }

        // `entered` is bumped under the lock right before waiting, so every
        // counted waiter is registered once we hold the lock.
        assert!(wait_until(SETTLE, || {
            let _g = mutex.lock();
            entered.get() == waiters as u64
        }));
        let _g = mutex.lock();
        generation.set(generation.get() + 1);
        cvs[waiters].notify_all();
    });

    assert_eq!(woken.load(Ordering::SeqCst), waiters);
}

#[test]
fn local_construct_and_close() {
    let mut cv = CondVar::new();
    assert!(!cv.is_process_shared());
    assert!(!cv.is_emulated());
    cv.close();
    assert!(cv.is_process_shared());

    let cv = CondVar::default();
    assert!(!cv.is_process_shared());
}

#[test]
fn unbound_process_shared() {
    let cv = CondVar::process_shared();
    assert!(cv.is_process_shared());
    assert!(!cv.is_emulated());
}

#[test]
fn binding_follows_initialiser_mode() {
    init_test_logging();
    let native = SharedMonitor::new("cv_mode_native", EmulationPolicy::Never);
    assert!(!native.monitor().part.is_emulated());
    assert!(!native.bind().is_emulated());

    let emulated = SharedMonitor::new("cv_mode_emulated", EmulationPolicy::Always);
    assert!(emulated.monitor().part.is_emulated());
    let cv = emulated.bind();
    assert!(cv.is_emulated());
    assert!(cv.is_process_shared());
    assert_eq!(emulated.monitor().part.signal_counter(), 0);
    assert_eq!(emulated.monitor().part.waiters(), 0);
}

#[test]
fn local_wait_notify() {
    let mtx = Mutex::new();
    let cv = CondVar::new();
    let mut flag = 0u64;
    let flag = Cell(&mut flag);

    thread::scope(|s| {
        s.spawn(|| {
            let g = mtx.lock();
            while flag.get() == 0 {
                cv.wait(&g);
            }
        });
        thread::sleep(Duration::from_millis(20));
        let _g = mtx.lock();
        flag.set(1);
        cv.notify();
    });
    assert_eq!(flag.get(), 1);
}

#[test]
fn local_notify_all_exact() {
    for waiters in [0usize, 1, 5, 50] {
        let mtx = Mutex::new();
        let cv = CondVar::new();
        let (mut generation, mut entered) = (0u64, 0u64);
        let cvs = vec![&cv; waiters + 1];
        check_notify_all(&mtx, &cvs, Cell(&mut generation), Cell(&mut entered));
    }
}

#[test]
fn shared_native_notify_all_exact() {
    for waiters in [0usize, 1, 5, 50] {
        let fixture = SharedMonitor::new("cv_native_all", EmulationPolicy::Never);
        let cv = fixture.bind();
        let cvs = vec![&cv; waiters + 1];
        check_notify_all(
            &fixture.monitor().mutex,
            &cvs,
            fixture.generation(),
            fixture.entered(),
        );
    }
}

#[test]
fn emulated_notify_all_exact() {
    init_test_logging();
    for waiters in [0usize, 1, 5, 50] {
        let fixture = SharedMonitor::new("cv_emul_all", EmulationPolicy::Always);
        let owned: Vec<CondVar> = (0..=waiters).map(|_| fixture.bind()).collect();
        let cvs: Vec<&CondVar> = owned.iter().collect();
        check_notify_all(
            &fixture.monitor().mutex,
            &cvs,
            fixture.generation(),
            fixture.entered(),
        );

        let part = &fixture.monitor().part;
        assert_eq!(part.waiters(), 0, "notify_all must consume every registration");
        assert_eq!(part.signal_counter(), 1);
    }
}

// Every waiter registered before a notify observes a later generation.
#[test]
fn emulated_notify_advances_generation() {
    const WAITERS: usize = 3;
    let fixture = SharedMonitor::new("cv_emul_gen", EmulationPolicy::Always);
    let monitor = fixture.monitor();
    let entered = fixture.entered();

    thread::scope(|s| {
        for _ in 0..WAITERS {
            let cv = fixture.bind();
            s.spawn(move || {
                let g = monitor.mutex.lock();
                let at_entry = monitor.part.signal_counter();
                entered.set(entered.get() + 1);
                cv.wait(&g);
                assert!(monitor.part.signal_counter() >= at_entry + 1);
            });
        }

        assert!(wait_until(SETTLE, || {
            let _g = monitor.mutex.lock();
            entered.get() == WAITERS as u64
        }));
        let cv = fixture.bind();
        for _ in 0..WAITERS {
            let _g = monitor.mutex.lock();
            cv.notify();
        }
    });

    assert_eq!(monitor.part.waiters(), 0);
    assert_eq!(monitor.part.signal_counter(), WAITERS as u64);
}

// A waiter that registers after a notify may steal the earlier waiter's
// permit; it must hand it back so the earlier waiter still wakes.
#[test]
fn emulated_late_waiter_does_not_swallow_wakeup() {
    init_test_logging();
    let fixture = SharedMonitor::new("cv_emul_late", EmulationPolicy::Always);
    let monitor = fixture.monitor();
    let generation = fixture.generation();
    let entered = fixture.entered();
    let woken = AtomicUsize::new(0);

    for _ in 0..20 {
        generation.set(0);
        entered.set(0);
        woken.store(0, Ordering::SeqCst);

        thread::scope(|s| {
            let notifier = fixture.bind();
            let spawn_waiter = |target: u64| {
                let cv = fixture.bind();
                let woken = &woken;
                s.spawn(move || {
                    let g = monitor.mutex.lock();
                    entered.set(entered.get() + 1);
                    while generation.get() < target {
                        cv.wait(&g);
                    }
                    drop(g);
                    woken.fetch_add(1, Ordering::SeqCst);
                });
            };

            spawn_waiter(1);
            assert!(wait_until(SETTLE, || {
                let _g = monitor.mutex.lock();
                entered.get() == 1
            }));
            {
                let _g = monitor.mutex.lock();
                generation.set(1);
                notifier.notify();
            }

            spawn_waiter(2);
            assert!(wait_until(SETTLE, || {
                let _g = monitor.mutex.lock();
                entered.get() == 2
            }));
            {
                let _g = monitor.mutex.lock();
                generation.set(2);
                notifier.notify();
            }
        });

        assert_eq!(woken.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.part.waiters(), 0);
    }
}

fn check_robust_wait_notify(fixture: &SharedRobustMonitor) {
    let monitor = fixture.monitor();
    let value = fixture.value();

    thread::scope(|s| {
        let cv = fixture.bind();
        s.spawn(move || {
            let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            while value.get() == 0 {
                let status = cv.wait_robust(&mut g, || Ok(()), None).expect("wait");
                assert_eq!(status, WaitStatus::Notified);
            }
            value.set(2);
        });

        thread::sleep(Duration::from_millis(20));
        let cv = fixture.bind();
        let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
        value.set(1);
        cv.notify();
    });

    assert_eq!(value.get(), 2);
    assert_eq!(monitor.mutex.state(), RobustState::Unlocked);
}

#[test]
fn robust_wait_notify_native() {
    check_robust_wait_notify(&SharedRobustMonitor::new("cv_robust_native", EmulationPolicy::Never));
}

#[test]
fn robust_wait_notify_emulated() {
    check_robust_wait_notify(&SharedRobustMonitor::new("cv_robust_emul", EmulationPolicy::Always));
}

fn check_timed_wait_times_out(fixture: &SharedRobustMonitor) {
    let monitor = fixture.monitor();
    let cv = fixture.bind();

    let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
    let status = cv
        .wait_robust(&mut g, || panic!("no owner died"), Some(Duration::from_millis(50)))
        .expect("timed wait");
    assert_eq!(status, WaitStatus::TimedOut);
    assert!(g.is_held());
    assert_eq!(monitor.mutex.state(), RobustState::Locked);
    assert_eq!(monitor.part.waiters(), 0);
    drop(g);
    assert_eq!(monitor.mutex.state(), RobustState::Unlocked);
}

#[test]
fn timed_wait_times_out_native() {
    check_timed_wait_times_out(&SharedRobustMonitor::new("cv_timed_native", EmulationPolicy::Never));
}

#[test]
fn timed_wait_times_out_emulated() {
    check_timed_wait_times_out(&SharedRobustMonitor::new("cv_timed_emul", EmulationPolicy::Always));
}

#[test]
fn timed_wait_notified_emulated() {
    let fixture = SharedRobustMonitor::new("cv_timed_notified", EmulationPolicy::Always);
    let monitor = fixture.monitor();
    let value = fixture.value();
    let entered = fixture.entered();

    thread::scope(|s| {
        let cv = fixture.bind();
        s.spawn(move || {
            let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.set(1);
            while value.get() == 0 {
                let status = cv
                    .wait_robust(&mut g, || Ok(()), Some(Duration::from_secs(30)))
                    .expect("wait");
                assert_eq!(status, WaitStatus::Notified);
            }
        });

        assert!(wait_until(SETTLE, || {
            let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.get() == 1
        }));
        let cv = fixture.bind();
        let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
        value.set(1);
        cv.notify();
    });

    assert_eq!(monitor.part.waiters(), 0);
}

// A timed waiter expires while the lock is held elsewhere, then a single
// notify arrives and an untimed waiter takes its permit. Both return, and
// the shared part must be left with no registrations and no spare permit.
#[test]
fn timed_waiter_losing_permit_withdraws_registration() {
    init_test_logging();
    let fixture = SharedRobustMonitor::new("cv_timed_race", EmulationPolicy::Always);
    let monitor = fixture.monitor();
    let entered = fixture.entered();
    let hold = Duration::from_millis(200);

    let statuses = thread::scope(|s| {
        let spawn_waiter = |timeout: Option<Duration>| {
            let cv = fixture.bind();
            s.spawn(move || {
                let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
                entered.set(entered.get() + 1);
                cv.wait_robust(&mut g, || Ok(()), timeout).expect("wait")
            })
        };
        let timed = spawn_waiter(Some(Duration::from_millis(50)));
        let untimed = spawn_waiter(None);

        assert!(wait_until(SETTLE, || {
            let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.get() == 2
        }));

        let cv = fixture.bind();
        {
            let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            assert_eq!(monitor.part.waiters(), 2);
            // The timed waiter expires and queues on the lock.
            thread::sleep(hold);
            cv.notify();
            // The untimed waiter takes the only permit meanwhile.
            thread::sleep(hold);
        }
        (
            timed.join().expect("timed waiter"),
            untimed.join().expect("untimed waiter"),
        )
    });

    assert_eq!(statuses, (WaitStatus::Notified, WaitStatus::Notified));
    assert_eq!(monitor.part.waiters(), 0);

    let cv = fixture.bind();
    {
        let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
        cv.notify();
    }
    let sem = NamedSemaphore::open(
        &condvar_semaphore_name(
            fixture.shm.device(),
            fixture.shm.inode(),
            offset_of!(RobustMonitor, part),
        ),
        0,
    )
    .expect("open semaphore");
    assert!(!sem.try_wait().expect("try_wait"), "notify without waiters left a permit");
}

// The notifier dies holding the lock; the waiter re-acquires it, runs
// recovery once, and owns a consistent lock again.
fn check_wait_recovers_after_owner_death(fixture: &SharedRobustMonitor) {
    let monitor = fixture.monitor();
    let value = fixture.value();
    let entered = fixture.entered();
    let recoveries = AtomicUsize::new(0);

    thread::scope(|s| {
        let cv = fixture.bind();
        let recoveries = &recoveries;
        s.spawn(move || {
            let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.set(1);
            while value.get() == 0 {
                cv.wait_robust(
                    &mut g,
                    || {
                        recoveries.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                )
                .expect("wait");
            }
            assert_eq!(monitor.mutex.state(), RobustState::Locked);
        });

        assert!(wait_until(SETTLE, || {
            let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.get() == 1
        }));

        let cv = fixture.bind();
        s.spawn(move || {
            let g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            value.set(1);
            cv.notify_all();
            std::mem::forget(g);
        })
        .join()
        .unwrap();
    });

    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.mutex.state(), RobustState::Unlocked);
}

#[test]
fn wait_recovers_after_owner_death_native() {
    init_test_logging();
    if !RobustMutex::is_robust_on_this_platform() {
        return;
    }
    check_wait_recovers_after_owner_death(&SharedRobustMonitor::new(
        "cv_death_native",
        EmulationPolicy::Never,
    ));
}

#[test]
fn wait_recovers_after_owner_death_emulated() {
    init_test_logging();
    if !RobustMutex::is_robust_on_this_platform() {
        return;
    }
    check_wait_recovers_after_owner_death(&SharedRobustMonitor::new(
        "cv_death_emul",
        EmulationPolicy::Always,
    ));
}

// A failing recovery during a wait leaves the guard without the lock.
#[test]
fn wait_recovery_failure_releases_guard() {
    if !RobustMutex::is_robust_on_this_platform() {
        return;
    }
    let fixture = SharedRobustMonitor::new("cv_death_fail", EmulationPolicy::Never);
    let monitor = fixture.monitor();
    let value = fixture.value();
    let entered = fixture.entered();

    thread::scope(|s| {
        let cv = fixture.bind();
        s.spawn(move || {
            let mut g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.set(1);
            let err = loop {
                match cv.wait_robust(&mut g, || Err(Error::recovery("corrupt")), None) {
                    Ok(_) if value.get() == 0 => continue,
                    Ok(_) => panic!("recovery failure was not reported"),
                    Err(e) => break e,
                }
            };
            assert!(matches!(err, Error::Recovery(_)));
            assert!(!g.is_held());
        });

        assert!(wait_until(SETTLE, || {
            let _g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            entered.get() == 1
        }));

        let cv = fixture.bind();
        s.spawn(move || {
            let g = RobustScopedLock::new(&monitor.mutex, || Ok(())).expect("lock");
            value.set(1);
            cv.notify_all();
            std::mem::forget(g);
        })
        .join()
        .unwrap();
    });

    assert_eq!(monitor.mutex.state(), RobustState::Unrecoverable);
    assert!(RobustScopedLock::new(&monitor.mutex, || Ok(()))
        .err()
        .is_some_and(|e| e.is_not_recoverable()));
}
