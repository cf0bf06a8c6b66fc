//! End-to-end scenarios for the directory I/O queue.
//!
//! These drive `Ioq` the way a traversal loop would: submit a batch of
//! requests, reap them in a loop, and confirm backpressure, cancellation,
//! and shutdown all behave as a single-consumer caller expects.
//!
//! Run with: `cargo test --test scenarios`

use oxidex_ioq::{Ioq, Op, SubmitError};
use std::fs::File;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::ptr;
use std::thread;

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn scenario_producer_waits_out_a_full_pool() {
    let ioq = Ioq::create(2, 1);

    ioq.close(-1, ptr::null_mut()).unwrap();
    ioq.close(-1, ptr::null_mut()).unwrap();
    assert_eq!(
        ioq.close(-1, ptr::null_mut()),
        Err(SubmitError::QueueFull),
        "third submission should be rejected with only 2 slots in the pool"
    );

    // Reap one, which frees a slot for the next submission.
    let ent = ioq.pop().unwrap();
    ioq.free(ent);
    ioq.close(-1, ptr::null_mut()).unwrap();

    // Drain everything.
    for _ in 0..2 {
        let ent = ioq.pop().unwrap();
        ioq.free(ent);
    }
}

// ============================================================================
// Ordering is not guaranteed across a worker pool, but correlation holds
// ============================================================================

#[test]
fn scenario_correlation_tokens_survive_concurrent_workers() {
    let ioq = Ioq::create(32, 8);

    for i in 0..32usize {
        ioq.close(-1, i as *mut std::ffi::c_void).unwrap();
    }

    let mut seen = vec![false; 32];
    for _ in 0..32 {
        let ent = ioq.pop().unwrap();
        let i = ent.ptr as usize;
        assert!(!seen[i], "token {i} reaped twice");
        seen[i] = true;
        ioq.free(ent);
    }

    assert!(seen.iter().all(|&s| s), "every submitted token must be reaped exactly once");
}

// ============================================================================
// Directory lifecycle
// ============================================================================

#[test]
fn scenario_open_missing_then_open_real_directory() {
    let ioq = Ioq::create(4, 2);
    let root = File::open("/").unwrap();

    let mut bad_slot: *mut libc::DIR = ptr::null_mut();
    ioq.opendir(&mut bad_slot, root.as_raw_fd(), "no-such-child", ptr::null_mut())
        .unwrap();

    let mut good_slot: *mut libc::DIR = ptr::null_mut();
    ioq.opendir(&mut good_slot, root.as_raw_fd(), ".", ptr::null_mut())
        .unwrap();

    let mut saw_failure = false;
    let mut saw_success = false;
    for _ in 0..2 {
        let ent = ioq.pop().unwrap();
        assert_eq!(ent.op, Op::OpenDir);
        if ent.ret == 0 {
            saw_success = true;
        } else {
            assert_eq!(ent.error, libc::ENOENT);
            saw_failure = true;
        }
        ioq.free(ent);
    }

    assert!(saw_failure && saw_success);
    assert!(bad_slot.is_null());
    assert!(!good_slot.is_null());

    ioq.closedir(&mut good_slot, ptr::null_mut()).unwrap();
    let ent = ioq.pop().unwrap();
    assert_eq!(ent.ret, 0);
    ioq.free(ent);
}

// ============================================================================
// Cancellation mid-flight
// ============================================================================

#[test]
fn scenario_cancel_mid_batch_still_drains_every_entry() {
    let ioq = Ioq::create(16, 4);

    let files: Vec<File> = (0..16).map(|_| File::open("/").unwrap()).collect();
    for f in files {
        ioq.close(f.into_raw_fd(), ptr::null_mut()).unwrap();
    }

    ioq.cancel();

    let mut reaped = 0;
    while let Some(ent) = ioq.pop() {
        // Either it ran to completion before the cancel reached it, or it
        // was cancelled outright -- both are valid terminal states.
        assert!(ent.ret == 0 || ent.error == libc::ECANCELED);
        ioq.free(ent);
        reaped += 1;
    }

    assert_eq!(reaped, 16, "every submitted entry must eventually surface exactly once");
    assert_eq!(
        ioq.close(-1, ptr::null_mut()),
        Err(SubmitError::Cancelled),
        "a cancelled queue must refuse further submissions"
    );
}

// ============================================================================
// Shutdown while a second thread is still submitting
// ============================================================================

#[test]
fn scenario_drop_during_concurrent_submission_does_not_hang() {
    let ioq = std::sync::Arc::new(Ioq::create(8, 4));
    let producer = {
        let ioq = ioq.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let _ = ioq.close(-1, ptr::null_mut());
                if let Some(ent) = ioq.trypop() {
                    ioq.free(ent);
                }
            }
        })
    };

    producer.join().unwrap();
    // Dropping the last handle must join every worker and return promptly.
    drop(ioq);
}
