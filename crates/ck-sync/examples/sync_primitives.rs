//! A short tour of the synchronization primitives: mutex handoff, flag
//! groups and a condition variable, all driven by one kernel run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ck::{Kernel, OnReturn, TaskConfig, Timeout};
use ck_sync::{CondVar, FlagGroup, FlagRequest, Mutex, Semaphore};

const READY_BIT: u32 = 0b01;
const DONE_BIT: u32 = 0b10;

fn main() {
    println!("=== ck sync primitives tour ===\n");

    let kernel = Kernel::builder().build().expect("build kernel");
    let mutex = Mutex::new(&kernel);
    let flags = FlagGroup::new(&kernel);
    let cv = CondVar::new(&kernel);
    let gate = Semaphore::binary(&kernel);
    let shared = Arc::new(AtomicU32::new(0));

    {
        let mutex = mutex.clone();
        let flags = flags.clone();
        let shared = Arc::clone(&shared);
        kernel
            .spawn(
                TaskConfig::new("worker", move |ctx| {
                    let got = flags
                        .wait_for(ctx, FlagRequest::all(READY_BIT | DONE_BIT), Timeout::Forever)
                        .expect("flag wait");
                    println!("worker: both flags arrived (mask {got:#04b})");

                    mutex.wait_for(ctx, 50u32).expect("lock");
                    let value = shared.fetch_add(1, Ordering::SeqCst) + 1;
                    println!("worker: exclusive update -> {value}");
                    mutex.give(ctx).expect("unlock");
                })
                .on_return(OnReturn::Stop),
            )
            .expect("spawn worker");
    }
    {
        let mutex = mutex.clone();
        let flags = flags.clone();
        let cv = cv.clone();
        let gate = gate.clone();
        kernel
            .spawn(
                TaskConfig::new("director", move |ctx| {
                    ctx.sleep_for(1);
                    println!("director: raising READY");
                    flags.give(READY_BIT).expect("give ready");
                    ctx.sleep_for(1);
                    println!("director: raising DONE");
                    flags.give(DONE_BIT).expect("give done");

                    mutex.wait_for(ctx, Timeout::Forever).expect("lock");
                    println!("director: waiting for a late notification");
                    cv.wait(ctx, &mutex, 20u32).ok();
                    mutex.give(ctx).expect("unlock");

                    gate.give().expect("open the gate");
                })
                .on_return(OnReturn::Stop),
            )
            .expect("spawn director");
    }
    {
        let gate = gate.clone();
        let cv = cv.clone();
        kernel
            .spawn(
                TaskConfig::new("closer", move |ctx| {
                    ctx.sleep_for(5);
                    // Nobody may be waiting yet; a notification to an empty
                    // queue is simply lost.
                    let notified = cv.notify_one().expect("notify");
                    println!("closer: notified a waiter: {notified}");
                    gate.wait_for(ctx, Timeout::Forever).expect("gate");
                    println!("closer: gate opened at tick {}", ctx.now());
                })
                .on_return(OnReturn::Stop),
            )
            .expect("spawn closer");
    }

    kernel.run().expect("run kernel");
    println!("\nall tasks stopped, kernel halted");
}
