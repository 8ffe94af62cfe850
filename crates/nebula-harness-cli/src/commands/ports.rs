//! Ports command - prints free ports.

use anyhow::Result;

pub fn run(count: usize) -> Result<()> {
    for port in nebula_harness::find_free_ports(count)? {
        println!("{port}");
    }
    Ok(())
}
