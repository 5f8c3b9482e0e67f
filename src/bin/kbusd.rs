#[cfg(unix)]
use std::{env, fs::File, io::Write, os::fd::FromRawFd};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
#[cfg(unix)]
use tokio::{select, signal::unix::SignalKind};
use tracing::{error, info};

use kbusd::{router::Router, session, subsystem::Subsystem};

/// A kernel-resident-style inter-process message bus, running in user
/// space. Brings up one root domain and one bus on it, then accepts
/// connections on a Unix domain socket.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the Unix domain socket to listen on.
    #[clap(short = 'a', long, value_parser)]
    address: Option<PathBuf>,

    /// Name of the bus created under the root domain.
    #[clap(long, default_value = "session")]
    bus_name: String,

    /// Per-connection receive pool size, in bytes.
    #[clap(long, default_value_t = 1024 * 1024)]
    pool_capacity: u64,

    /// Print the socket path to standard output once listening.
    #[clap(long)]
    print_address: bool,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the bus is listening, `READY=1\n` is written to this fd and it
    /// is closed -- the same systemd/s6-compatible protocol the teacher
    /// binary used.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[cfg(unix)]
fn default_socket_path() -> PathBuf {
    env::var("XDG_RUNTIME_DIR")
        .map(|p| Path::new(&p).join("kbusd-session"))
        .unwrap_or_else(|_| Path::new("/run").join("kbusd-session"))
}

#[tokio::main]
async fn main() -> Result<()> {
    kbusd::tracing_subscriber::init();

    let args = Args::parse();
    #[cfg(unix)]
    let socket_path = args.address.clone().unwrap_or_else(default_socket_path);
    #[cfg(not(unix))]
    let socket_path = args.address.clone().expect("--address is required on this platform");

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let subsystem = Subsystem::start();
    let handle = subsystem.open_control();
    let bus = handle.make_bus(args.bus_name.clone(), 0, 0o666, 0, 0)?;
    let endpoint = bus.default_endpoint();
    let router = Arc::new(Router::new(bus.clone()));

    info!(bus = args.bus_name.as_str(), path = %socket_path.display(), "bus listening");

    let sweeper = Subsystem::spawn_timeout_sweeper(router.clone(), Duration::from_millis(100));
    let listener = tokio::net::UnixListener::bind(&socket_path)?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: the parent process is responsible for passing a valid fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    if args.print_address {
        println!("{}", socket_path.display());
    }

    let serve = async {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let bus = bus.clone();
            let endpoint = endpoint.clone();
            let router = router.clone();
            let pool_capacity = args.pool_capacity;
            tokio::spawn(async move {
                if let Err(e) = session::serve(stream, bus, endpoint, router, pool_capacity).await {
                    tracing::warn!(error = %e, "connection session ended with an error");
                }
            });
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(unix)]
    {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;
        select! {
            _ = sig_int.recv() => {
                info!("received SIGINT, shutting down..");
            }
            res = serve => if let Err(e) = res {
                error!("bus stopped with an error: {}", e);
            }
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = serve.await {
        error!("bus stopped with an error: {}", e);
    }

    sweeper.abort();
    subsystem.shutdown();
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}
