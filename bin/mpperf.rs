use clap::Parser;
use mpath_socket::{Address, DialOptions, MpSocket, Path, PathConn, PathMetrics};
use std::{collections::HashMap, collections::HashSet, sync::Arc, time::{Duration, Instant}};
use tracing_subscriber::filter::EnvFilter;

fn spawn_writer(conn: Arc<dyn PathConn>, size: usize) {
    let mut buf = vec![0u8; size];
    buf.fill(42);
    std::thread::spawn(move || {
        loop {
            if let Err(e) = conn.write_all(&buf) {
                println!("[{}]: write failed: {e}", conn.id());
                break;
            }
        }
    });
}

fn spawn_reader(conn: Arc<dyn PathConn>, size: usize) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; size];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => {
                    println!("[{}]: connection closed by remote peer", conn.id());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("[{}]: read failed: {e}", conn.id());
                    break;
                }
            }
        }
    });
}

fn bytes_of(m: &PathMetrics, reading: bool) -> u64 {
    if reading { m.read_bytes } else { m.written_bytes }
}

/// Prints per-connection throughput once per sampling period, forever.
fn report(socket: &MpSocket, args: &Args, reading: bool) {
    let sampling_period = Duration::from_secs(args.period);
    let mut seen = HashSet::new();
    let mut last: HashMap<_, u64> = HashMap::new();
    let mut start = Instant::now();
    loop {
        std::thread::sleep(sampling_period);
        let conns = if reading {
            socket.listen_connections()
        } else {
            socket.dial_connections()
        };
        if reading {
            for conn in conns.iter().filter(|c| seen.insert(c.id())) {
                spawn_reader(conn.clone(), args.size);
            }
        }

        let delta = start.elapsed();
        start = Instant::now();
        for conn in conns {
            let total = bytes_of(&conn.metrics(), reading);
            let prev = last.insert(conn.id(), total).unwrap_or(0);
            let throughput = (((total - prev) * 8) as f32 / delta.as_secs_f32()) / (10u64.pow(6) as f32);
            let path = conn.path().map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            println!("[{}] {path}: {throughput} Mbps", conn.id());
        }
        if let Some(e) = socket.accept_error() {
            println!("Accept loop stopped: {e}");
        }
    }
}

fn run_client_mode(args: Args) -> mpath_socket::Result<()> {
    let remote: Address = args.addr.parse()?;
    let socket = MpSocket::new(args.local.clone());
    socket.listen()?;

    let paths: Vec<Path> = (0..args.paths).map(|i| Path::new(format!("path-{i}"))).collect();
    let conns = socket.dial_all(&remote, &paths, DialOptions { send_addr_packet: true })?;
    println!("Connected successfully to {} over {} paths", args.addr, paths.len());

    for conn in conns.into_iter().skip(1) {
        spawn_writer(conn, args.size);
    }
    report(&socket, &args, false);
    Ok(())
}

fn run_server_mode(args: Args) -> mpath_socket::Result<()> {
    let socket = MpSocket::new(args.addr.clone());
    socket.listen()?;
    println!("Listening on {:?}", socket.local_addr());

    let peer = socket.wait_for_dial_in(true)?;
    println!("Accepted dial-in from: {}", peer.map(|p| p.to_string()).unwrap_or_default());
    report(&socket, &args, true);
    Ok(())
}

fn init_env_filter(env_filter: EnvFilter) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let subscriber = subscriber.finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> mpath_socket::Result<()> {

    tracing_log::LogTracer::init().expect("Failed to set logger");

    // Initialize tracing subscriber
    match EnvFilter::try_from_default_env() {
        Ok(env_filter) => init_env_filter(env_filter),
        _ => { }
    }

    let args = Args::parse();
    if args.client {
        run_client_mode(args)
    } else {
        run_server_mode(args)
    }
}

/// Throughput benchmark for multipath sockets
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Set the client mode for the application
    #[arg(short, long)]
    client: bool,
    /// The address <ip:port> to listen on or dial, depending on the mode.
    #[arg(short, long)]
    addr: String,
    /// The local address <ip:port> the client binds and announces to the server.
    /// Use a routable address when the server is not on this host.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    local: String,
    /// The read/write buffer size
    #[arg(short, long)]
    size: usize,
    /// The number of paths (dial-side connections) opened by the client
    #[arg(short = 'n', long, default_value = "4")]
    paths: usize,
    /// The sampling period in seconds
    #[arg(short, long, default_value = "1")]
    period: u64,
}
