//! Producer-consumer example on the cooperative kernel.
//!
//! Two counting semaphores guard a shared buffer: `empty` counts free
//! slots, `full` counts produced items. Both tasks block mid-function on
//! the semaphores and the scheduler interleaves them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ck::{Kernel, OnReturn, TaskConfig, Timeout};
use ck_sync::Semaphore;

const ITEMS: usize = 10;
const SLOTS: u32 = 3;

fn main() {
    println!("=== ck producer-consumer example ===\n");

    let kernel = Kernel::builder().build().expect("build kernel");
    let empty = Semaphore::new(&kernel, SLOTS, SLOTS);
    let full = Semaphore::new(&kernel, 0, SLOTS);
    let buffer: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new(VecDeque::new()));

    {
        let empty = empty.clone();
        let full = full.clone();
        let buffer = Arc::clone(&buffer);
        kernel
            .spawn(
                TaskConfig::new("producer", move |ctx| {
                    for item in 1..=ITEMS {
                        empty.wait_for(ctx, Timeout::Forever).expect("free slot");
                        buffer.lock().unwrap().push_back(item);
                        println!("producer: created item #{item}");
                        full.give().expect("signal item");
                        if item % 4 == 0 {
                            // Simulate a slow production burst.
                            ctx.sleep_for(2);
                        }
                    }
                    println!("producer: finished ({ITEMS} items)");
                })
                .on_return(OnReturn::Stop),
            )
            .expect("spawn producer");
    }
    {
        let empty = empty.clone();
        let full = full.clone();
        let buffer = Arc::clone(&buffer);
        kernel
            .spawn(
                TaskConfig::new("consumer", move |ctx| {
                    for _ in 0..ITEMS {
                        full.wait_for(ctx, Timeout::Forever).expect("item");
                        let item = buffer.lock().unwrap().pop_front().expect("buffered item");
                        println!("consumer: handled item #{item} at tick {}", ctx.now());
                        empty.give().expect("free a slot");
                    }
                    println!("consumer: done");
                })
                .on_return(OnReturn::Stop),
            )
            .expect("spawn consumer");
    }

    kernel.run().expect("run kernel");
    println!("\nall tasks stopped, kernel halted");
}
