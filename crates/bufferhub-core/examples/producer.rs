//! Producer - creates a buffer, fills it and posts it
//!
//! Creates a buffer, registers as its producer, writes a pattern and posts
//! it, then waits for a consumer to attach and leave. Gives up after the
//! given number of seconds (60 by default) and tears the buffer down either
//! way, so the demo can be rerun.
//!
//! Usage:
//! ```bash
//! cargo run --example producer -- [seconds]
//! ```

use bufferhub_core::{BufferDesc, BufferHub, HubConfig, PixelFormat, UsageFlags};
use std::thread;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let timeout = match std::env::args().nth(1) {
        Some(arg) => Duration::from_secs(arg.parse()?),
        None => Duration::from_secs(60),
    };

    let hub = BufferHub::new(HubConfig::from_env())?;
    let desc = BufferDesc::new(
        640,
        480,
        1,
        PixelFormat::Rgba8888,
        UsageFlags::CPU_READ_OFTEN | UsageFlags::CPU_WRITE_OFTEN,
    );
    let node = hub.create_buffer(desc, 0)?;
    println!("Created buffer id={}", node.id());

    let producer = node.register_client()?;
    producer.gain()?;

    let handle = node.buffer_handle();
    unsafe { std::ptr::write_bytes(handle.as_mut_ptr(), 0x7F, handle.size()) };
    producer.post()?;
    println!(
        "Posted {} bytes as client {:#x}",
        handle.size(),
        producer.bit().mask()
    );

    println!("\nRun: cargo run --example consumer -- {}", node.id());
    println!("Waiting up to {}s for a consumer...", timeout.as_secs());

    let own = producer.bit().mask();
    let deadline = Instant::now() + timeout;
    let mut consumer_seen = false;
    while Instant::now() < deadline {
        let active = node.active_clients_bit_mask();
        println!("active clients: {:#06x}", active);
        if active & !own != 0 {
            consumer_seen = true;
        } else if consumer_seen {
            println!("Consumer left");
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    drop(producer);
    drop(node);
    println!("Buffer released");
    Ok(())
}
