//! Consumer - attaches to a buffer and reads it
//!
//! Attaches to the buffer created by the producer example, registers as a
//! client and reads the pixel data.
//!
//! Usage:
//! ```bash
//! cargo run --example consumer -- <buffer id>
//! ```

use bufferhub_core::{BufferHub, BufferId, BufferState, HubConfig};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let raw_id: u32 = std::env::args()
        .nth(1)
        .ok_or("missing buffer id")?
        .parse()?;
    let id = BufferId::new(raw_id).ok_or("buffer id must be non-zero")?;

    let hub = BufferHub::new(HubConfig::from_env())?;
    let node = hub.attach(id)?;
    let desc = node.buffer_desc();
    println!(
        "Attached to buffer id={} ({}x{} {:?})",
        node.id(),
        desc.width,
        desc.height,
        desc.format
    );

    let consumer = node.register_client()?;
    println!("Registered as client {:#x}", consumer.bit().mask());

    let active = node.active_clients_bit_mask();
    let posted = node.buffer_state().clients_in(BufferState::Posted, active);
    println!("active clients: {:#06x}, posted: {:#06x}", active, posted);

    let handle = node.buffer_handle();
    let data = unsafe { std::slice::from_raw_parts(handle.as_ptr(), handle.size()) };
    println!("First bytes: {:02x?}", &data[..8.min(data.len())]);

    // stay registered long enough for the producer to notice us
    thread::sleep(Duration::from_secs(1));

    Ok(())
}
