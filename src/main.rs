use clap::Parser;
use color_eyre::Result;

use nbd_client::client::{Driver, Extents, OpFlags};
use nbd_client::config::Config;

/// Probe an export on a remote NBD server.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Unix socket to connect to
    #[arg(long, conflicts_with_all = ["hostname", "port"])]
    socket: Option<String>,

    /// Hostname for a TCP connection
    #[arg(long)]
    hostname: Option<String>,

    /// TCP port or service name
    #[arg(long)]
    port: Option<String>,

    /// Export name to request
    #[arg(long, default_value = "")]
    export: String,

    /// Number of connect retries, one second apart
    #[arg(long, default_value_t = 0)]
    retry: u32,

    /// Share one connection among all clients
    #[arg(long)]
    shared: bool,

    /// Bytes to read and hex-dump from the start of the export
    #[arg(long)]
    read: Option<u32>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(socket) = &args.socket {
        config.set("socket", socket)?;
    }
    if let Some(hostname) = &args.hostname {
        config.set("hostname", hostname)?;
    }
    if let Some(port) = &args.port {
        config.set("port", port)?;
    }
    config.set("export", &args.export)?;
    config.retry = args.retry;
    config.shared = args.shared;

    let driver = Driver::new(config)?;
    let handle = driver.open(true)?;

    println!("size: {} bytes", handle.size());
    println!("write: {}", handle.can_write());
    println!("flush: {}", handle.can_flush());
    println!("rotational: {}", handle.is_rotational());
    println!("trim: {}", handle.can_trim());
    println!("zero: {}", handle.can_zero());
    println!("fast zero: {}", handle.can_fast_zero());
    println!("fua: {:?}", handle.can_fua());
    println!("multi-conn: {}", handle.can_multi_conn());
    println!("cache: {:?}", handle.can_cache());
    println!("extents: {}", handle.can_extents());

    if let Some(count) = args.read {
        let mut buf = vec![0; count as usize];
        handle.pread(&mut buf, 0, OpFlags::empty())?;
        for (i, row) in buf.chunks(16).enumerate() {
            let bytes: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:08x}  {}", i * 16, bytes.join(" "));
        }
    }

    if handle.can_extents() {
        let count = handle.size().min(u32::MAX as u64) as u32;
        let extents = handle.extents(count, 0, OpFlags::empty(), Extents::new())?;
        for extent in extents.as_slice() {
            println!(
                "extent: offset {:#x}, length {:#x}, status {:#x}",
                extent.offset, extent.length, extent.status
            );
        }
    }

    driver.close(handle);
    Ok(())
}
