use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use rover_buffer::{SharedMutex, ShmRegion, SyncError};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "rover-sync-{}-{}-{tag}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    )
}

struct Fixture {
    name: String,
    region: ShmRegion,
}

impl Fixture {
    fn new(tag: &str) -> Self {
        let name = unique_name(tag);
        let region = ShmRegion::open(&name, SharedMutex::size(), true).unwrap();
        Self { name, region }
    }

    fn mutex(&self) -> SharedMutex {
        unsafe { SharedMutex::from_raw(self.region.base()) }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        ShmRegion::unlink(&self.name);
    }
}

#[test]
fn try_acquire_release() {
    let fx = Fixture::new("try");
    let mutex = fx.mutex();
    mutex.initialize().unwrap();
    mutex.acquire(Some(Duration::ZERO)).unwrap();
    mutex.release().unwrap();
    mutex.destroy();
}

#[test]
fn double_acquire_reports_deadlock() {
    let fx = Fixture::new("deadlock");
    let mutex = fx.mutex();
    mutex.initialize().unwrap();
    mutex.acquire(None).unwrap();
    assert_eq!(mutex.acquire(None), Err(SyncError::Deadlock));
    mutex.release().unwrap();
    mutex.destroy();
}

#[test]
fn double_release_reports_not_owner() {
    let fx = Fixture::new("release");
    let mutex = fx.mutex();
    mutex.initialize().unwrap();
    mutex.acquire(None).unwrap();
    mutex.release().unwrap();
    assert_eq!(mutex.release(), Err(SyncError::NotOwner));
    mutex.destroy();
}

/// Hold the lock on another thread while `f` runs.
fn with_holder(fx: &Fixture, f: impl FnOnce()) {
    let mutex = fx.mutex();
    let entered = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));
    let holder = {
        let entered = Arc::clone(&entered);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            mutex.acquire(None).unwrap();
            entered.wait();
            done.wait();
            mutex.release().unwrap();
        })
    };
    entered.wait();
    f();
    done.wait();
    holder.join().unwrap();
}

#[test]
fn try_acquire_contended_reports_busy() {
    let fx = Fixture::new("busy");
    fx.mutex().initialize().unwrap();
    with_holder(&fx, || {
        assert_eq!(
            fx.mutex().acquire(Some(Duration::ZERO)),
            Err(SyncError::Busy)
        );
    });
}

#[test]
fn timed_acquire_contended_times_out() {
    let fx = Fixture::new("timeout");
    fx.mutex().initialize().unwrap();
    with_holder(&fx, || {
        let start = Instant::now();
        assert_eq!(
            fx.mutex().acquire(Some(Duration::from_millis(200))),
            Err(SyncError::TimedOut)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "returned after {elapsed:?}");
    });
}

#[test]
fn foreign_release_reports_not_owner() {
    let fx = Fixture::new("foreign");
    fx.mutex().initialize().unwrap();
    with_holder(&fx, || {
        assert_eq!(fx.mutex().release(), Err(SyncError::NotOwner));
    });
}

#[test]
fn contended_increments_are_exact() {
    let fx = Fixture::new("contend");
    let region_extra = unique_name("counter");
    // A bare u64 counter in its own region, guarded by the mutex under test.
    let counter_region = ShmRegion::open(&region_extra, 8, true).unwrap();
    fx.mutex().initialize().unwrap();

    const THREADS: usize = 4;
    const INCREMENTS: usize = 250;
    let counter_ptr = counter_region.base() as usize;
    let mutex = fx.mutex();
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    mutex.acquire(None).unwrap();
                    unsafe {
                        let counter = counter_ptr as *mut u64;
                        let value = counter.read();
                        std::thread::yield_now();
                        counter.write(value + 1);
                    }
                    mutex.release().unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    let total = unsafe { (counter_ptr as *const u64).read() };
    assert_eq!(total as usize, THREADS * INCREMENTS);
    ShmRegion::unlink(&region_extra);
}
