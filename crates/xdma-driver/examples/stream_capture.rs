// SPDX-License-Identifier: AGPL-3.0-only

//! Stream capture through a C2H ring
//!
//! Feeds the model's stream FIFO from one thread while the main thread
//! consumes the ring, then waits on a user interrupt line.

use std::time::Duration;
use xdma_driver::{ConsumeStatus, DriverConfig, Result, SimPlatform, XdmaDevice};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("xdma_driver=debug")
        .init();

    let sim = SimPlatform::with_defaults()?;
    let dev = XdmaDevice::attach(sim.clone(), DriverConfig::from_env())?;
    let ring = dev.open("c2h_1")?;

    let producer = {
        let sim = sim.clone();
        std::thread::spawn(move || {
            for chunk in 0..16u8 {
                sim.push_stream(1, &[chunk; 10_000]);
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let mut total = 0;
    let mut buf = vec![0u8; 32 * 1024];
    while total < 160_000 {
        match ring.consume(&mut buf)? {
            ConsumeStatus::Data(n) => total += n,
            ConsumeStatus::TimedOut { .. } => {
                println!("⏱  no data yet");
            }
        }
    }
    let _ = producer.join();
    println!("✅ Captured {total} bytes");

    let events = dev.open("events_0")?;
    let waiter = std::thread::spawn(move || {
        let mut flag = [0u8; 1];
        events.read(0, &mut flag).map(|_| flag[0] == 1)
    });
    while !waiter.is_finished() {
        sim.trigger_user_irq(0);
        std::thread::sleep(Duration::from_millis(1));
    }
    match waiter.join() {
        Ok(Ok(true)) => println!("✅ events_0 pulsed"),
        Ok(Ok(false)) => println!("⏱  events_0 timed out"),
        Ok(Err(e)) => return Err(e),
        Err(_) => println!("❌ event reader panicked"),
    }

    dev.release();
    Ok(())
}
