//! Basic DMA I/O on the in-process model
//!
//! Writes a pattern to card memory through `h2c_0`, reads it back through
//! `c2h_0` and pokes the user BAR.

use xdma_driver::{DriverConfig, Result, SimPlatform, XdmaDevice};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("xdma_driver=info")
        .init();

    println!("XDMA basic I/O\n");

    let dev = XdmaDevice::attach(SimPlatform::with_defaults()?, DriverConfig::from_env())?;
    println!("Layout: {:?}", dev.layout()?);

    let h2c = dev.open("h2c_0")?;
    let c2h = dev.open("c2h_0")?;

    let test_data: Vec<u8> = (0..64 * 1024).map(|i| (i % 256) as u8).collect();
    println!("📤 Writing {} bytes...", test_data.len());
    let written = h2c.write(0x1000, &test_data)?;
    println!("✅ Wrote {written} bytes");

    let mut buffer = vec![0u8; test_data.len()];
    println!("📥 Reading {} bytes...", buffer.len());
    let read_bytes = c2h.read(0x1000, &mut buffer)?;
    println!("✅ Read {read_bytes} bytes");

    if buffer == test_data {
        println!("\n🎉 Data verification: PASSED");
    } else {
        println!("\n❌ Data verification: FAILED");
    }

    let user = dev.open("user")?;
    user.write(0x10, &0xCAFE_F00Du32.to_le_bytes())?;
    let mut word = [0u8; 4];
    user.read(0x10, &mut word)?;
    println!("user[0x10] = {:#010x}", u32::from_le_bytes(word));

    dev.release();
    Ok(())
}
