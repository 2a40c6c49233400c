extern crate ajbusd;

#[cfg(unix)]
use std::{fs::File, io::Write, os::fd::FromRawFd};

use ajbusd::{bus::Bus, config::Config, listen::BusAddr, name_service::InProcessNetwork};

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use tokio::{select, signal::unix::SignalKind};
use tracing::error;
#[cfg(unix)]
use tracing::info;

/// An AllJoyn-flavored message-bus router.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The address to listen on, e.g. `tcp:r4addr=0.0.0.0,r4port=9955`.
    #[clap(short = 'a', long, value_parser)]
    address: Option<String>,

    /// Print the address of the message bus to standard output.
    #[clap(long)]
    print_address: bool,

    /// Combined bound on authenticating + active connections.
    #[clap(long)]
    max_connections: Option<usize>,

    /// Bound on connections that are still authenticating.
    #[clap(long)]
    max_incomplete_connections: Option<usize>,

    /// Ceiling on untrusted clients before the router advertisement drops.
    #[clap(long)]
    max_untrusted_clients: Option<usize>,

    /// Disable the quiet router advertisement entirely.
    #[clap(long)]
    no_router_advertisement: bool,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the daemon is up, it will print `READY=1\n` into this file
    /// descriptor and close it.
    ///
    /// This readiness notification mechanism works on both systemd and s6.
    ///
    /// This feature is only available on unix-like platforms.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    ajbusd::tracing_subscriber::init();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(max_incomplete) = args.max_incomplete_connections {
        config.max_incomplete_connections = max_incomplete;
    }
    if let Some(max_untrusted) = args.max_untrusted_clients {
        config.max_untrusted_clients = max_untrusted;
    }
    if args.no_router_advertisement {
        config.router_advertisement = None;
    }

    let address = args
        .address
        .as_deref()
        .unwrap_or("tcp:r4addr=0.0.0.0,r4port=9955");
    let listen_addr: BusAddr = address.parse()?;

    let name_service = InProcessNetwork::new().node();
    let mut bus = Bus::new(config, name_service)?;
    bus.state().listen().start_listen(listen_addr).await;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: We don't have any way to know if the fd is valid or not. The parent process is
        // responsible for passing a valid fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    if args.print_address {
        println!("{listen_addr}");
    }

    // FIXME: How to handle this gracefully on Windows?
    #[cfg(unix)]
    {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;

        select! {
            _ = sig_int.recv() => {
                info!("Received SIGINT, shutting down..");
            }
            res = bus.run() => match res {
                Ok(()) => info!("Bus stopped, shutting down.."),
                Err(e) => error!("Bus stopped with an error: {}", e),
            }
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = bus.run().await {
        error!("Bus stopped with an error: {}", e);
    }

    bus.stop().await;

    Ok(())
}
