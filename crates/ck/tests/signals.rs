//! End-to-end signal delivery: staging, ordering, self-delivery and the
//! interaction with sleeping tasks.

use std::sync::{Arc, Mutex};

use ck::{Kernel, OnReturn, TaskConfig, TimerConfig};

type Recorder<T> = Arc<Mutex<Vec<T>>>;

fn recorder<T>() -> Recorder<T> {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn handlers_run_in_ascending_signal_order() {
    let log: Recorder<u8> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    let target = {
        let log = Arc::clone(&log);
        kernel
            .spawn(
                TaskConfig::new("target", move |ctx| {
                    ctx.sleep_for(100);
                })
                .on_return(OnReturn::Stop)
                .with_signal_handler(move |num| {
                    log.lock().unwrap().push(num);
                }),
            )
            .unwrap()
    };
    {
        let kernel_handle = kernel.clone();
        kernel
            .spawn(
                TaskConfig::new("poster", move |ctx| {
                    ctx.sleep_for(1); // let the target block first
                    kernel_handle.post_signal(target, 5).unwrap();
                    kernel_handle.post_signal(target, 2).unwrap();
                })
                .on_return(OnReturn::Stop),
            )
            .unwrap();
    }
    kernel.run().unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[2, 5],
        "lowest pending signal number must be delivered first"
    );
}

#[test]
fn delivery_does_not_cancel_the_interrupted_sleep() {
    let log: Recorder<(&str, u32)> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    let target = {
        let log = Arc::clone(&log);
        let handler_log = Arc::clone(&log);
        kernel
            .spawn(
                TaskConfig::new("sleeper", move |ctx| {
                    ctx.sleep_for(10);
                    log.lock().unwrap().push(("woke", ctx.now()));
                })
                .on_return(OnReturn::Stop)
                .with_signal_handler(move |num| {
                    handler_log.lock().unwrap().push(("signal", num as u32));
                }),
            )
            .unwrap()
    };
    {
        let kernel_handle = kernel.clone();
        kernel
            .spawn(
                TaskConfig::new("poster", move |ctx| {
                    ctx.sleep_for(3);
                    kernel_handle.post_signal(target, 0).unwrap();
                })
                .on_return(OnReturn::Stop),
            )
            .unwrap();
    }
    kernel.run().unwrap();

    // The handler runs mid-sleep (around tick 3) but the sleep still ends at
    // its original deadline of tick 10.
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[("signal", 0), ("woke", 10)]
    );
}

#[test]
fn posting_to_self_delivers_synchronously() {
    let log: Recorder<&str> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    {
        let log = Arc::clone(&log);
        let handler_log = Arc::clone(&log);
        let config = TaskConfig::new("selfish", move |ctx| {
            log.lock().unwrap().push("before");
            ctx.kernel().post_signal(ctx.id(), 4).unwrap();
            log.lock().unwrap().push("after");
        })
        .on_return(OnReturn::Stop)
        .with_signal_handler(move |_num| {
            handler_log.lock().unwrap().push("handler");
        });
        kernel.spawn(config).unwrap();
    }
    kernel.run().unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["before", "handler", "after"],
        "self-posting must run the handler before the post returns"
    );
}

#[test]
fn unhandled_signals_pend_until_taken() {
    let log: Recorder<u32> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    let target = {
        let log = Arc::clone(&log);
        kernel
            .spawn(
                TaskConfig::new("collector", move |ctx| {
                    ctx.sleep_for(5);
                    log.lock().unwrap().push(ctx.take_signals());
                    log.lock().unwrap().push(ctx.take_signals());
                })
                .on_return(OnReturn::Stop),
            )
            .unwrap()
    };
    {
        let kernel_handle = kernel.clone();
        kernel
            .spawn(
                TaskConfig::new("poster", move |ctx| {
                    kernel_handle.post_signal(target, 1).unwrap();
                    kernel_handle.post_signal(target, 3).unwrap();
                    ctx.exit();
                }),
            )
            .unwrap();
    }
    kernel.run().unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[(1 << 1) | (1 << 3), 0],
        "pending bits accumulate and are consumed exactly once"
    );
}

#[test]
fn handlers_can_be_driven_from_timer_callbacks() {
    let log: Recorder<u8> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    let target = {
        let log = Arc::clone(&log);
        kernel
            .spawn(
                TaskConfig::new("target", move |ctx| {
                    ctx.sleep_for(50);
                })
                .on_return(OnReturn::Stop)
                .with_signal_handler(move |num| {
                    log.lock().unwrap().push(num);
                }),
            )
            .unwrap()
    };
    // Callbacks live inside the kernel: hold it weakly to avoid a cycle.
    let weak = kernel.downgrade();
    kernel.create_timer(
        TimerConfig::new("kick", move || {
            if let Some(k) = weak.upgrade() {
                let _ = k.post_signal(target, 6);
            }
        })
        .after(2),
    );
    kernel.run().unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), &[6]);
}

#[test]
fn signal_handler_can_be_installed_after_spawn() {
    let log: Recorder<u8> = recorder();

    let kernel = Kernel::builder().build().unwrap();
    let target = kernel
        .spawn(
            TaskConfig::new("late", move |ctx| {
                ctx.sleep_for(20);
            })
            .on_return(OnReturn::Stop),
        )
        .unwrap();
    {
        let log = Arc::clone(&log);
        kernel
            .set_signal_handler(target, move |num| {
                log.lock().unwrap().push(num);
            })
            .unwrap();
    }
    {
        let kernel_handle = kernel.clone();
        kernel
            .spawn(
                TaskConfig::new("poster", move |ctx| {
                    ctx.sleep_for(1);
                    kernel_handle.post_signal(target, 9).unwrap();
                })
                .on_return(OnReturn::Stop),
            )
            .unwrap();
    }
    kernel.run().unwrap();

    assert_eq!(log.lock().unwrap().as_slice(), &[9]);
}
