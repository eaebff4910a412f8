//! Main loop and timer example.
//!
//! Runs without network access: the client is in webhook mode and never
//! sends a request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use winecord::{Client, ClientBuilder, Timer, TimerFlags};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = ClientBuilder::new()
        .max_poll_wait_ms(1_000)
        .build()
        .expect("failed to start client");

    // one-shot
    client.timer(|_, _| println!("⏰ one-shot fired after 50 ms"), 50);

    // five ticks, 100 ms apart
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    client.timer_interval(
        move |_, timer: &mut Timer<Client>| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            println!("🔁 tick {} ({} left)", n, timer.repeat);
        },
        0,
        100,
        5,
    );

    // a timer that is canceled before it fires
    let doomed = client
        .timer_ctl(
            Timer::new()
                .with_delay(10_000)
                .with_flags(TimerFlags::DELETE_AUTO)
                .on_tick(|_, _| println!("never printed"))
                .on_status_changed(|_, timer: &mut Timer<Client>| {
                    println!("🛑 timer status changed: {:?}", timer.flags);
                }),
        )
        .expect("timer not created");
    client.timer_cancel(doomed);

    // the wakeup timer can be pushed back from anywhere
    client.set_on_wakeup(|client| {
        println!("👋 wakeup, stopping the loop");
        client.stop();
    });
    client.set_next_wakeup(800);

    let cycles = Arc::new(AtomicUsize::new(0));
    let cycle_counter = Arc::clone(&cycles);
    client.set_on_cycle(move |_| {
        cycle_counter.fetch_add(1, Ordering::SeqCst);
    });

    client.run();

    println!(
        "\nloop stopped after {} iterations, {} ticks",
        cycles.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
    client.shutdown();
}
