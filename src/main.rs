mod cache;
mod config;
mod control;
mod forward;
mod hosts;
mod proto;
mod resolvconf;
mod server;
mod stats;
mod upstream;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::MessageCache;
use crate::config::Config;
use crate::control::ControlState;
use crate::forward::Forwarder;
use crate::hosts::Hosts;
use crate::server::Handler;
use crate::stats::Stats;
use crate::upstream::{Exchanger, Transport};

const MAX_UDP_PACKET: usize = 4096;
const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "dnsrelay", version, about = "Lightweight caching DNS forwarder", long_about = None)]
struct Args {
    /// Listen on this address <host[:port]>
    #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:53", env = "DNSRELAY_LISTEN")]
    listen: String,
    /// Update /etc/resolv.conf with the address of dnsrelay as nameserver
    #[arg(short = 'd', long = "default-resolver", env = "DNSRELAY_DEFAULT", default_value_t = false)]
    default_resolver: bool,
    /// Comma delimited list of nameservers <host[:port]> (supersedes resolv.conf)
    #[arg(short = 'n', long = "nameservers", env = "DNSRELAY_SERVERS", value_delimiter = ',')]
    nameservers: Vec<String>,
    /// Use different nameservers for given domains <domain[,domain]/host[:port][,host[:port]]>
    #[arg(short = 'z', long = "stubzones", env = "DNSRELAY_STUB")]
    stubzones: Vec<String>,
    /// Path to a hosts file (e.g. /etc/hosts)
    #[arg(short = 'f', long = "hostsfile", env = "DNSRELAY_HOSTSFILE")]
    hostsfile: Option<PathBuf>,
    /// Reload the hosts file when it changes
    #[arg(long = "hostsfile-watch", env = "DNSRELAY_HOSTSFILE_WATCH", default_value_t = false)]
    hostsfile_watch: bool,
    /// Comma delimited list of search domains <domain[,domain]> (supersedes resolv.conf)
    #[arg(short = 's', long = "search-domains", env = "DNSRELAY_SEARCH_DOMAINS", value_delimiter = ',')]
    search_domains: Vec<String>,
    /// Qualify names with search domains to resolve queries
    #[arg(long = "enable-search", env = "DNSRELAY_ENABLE_SEARCH", default_value_t = false)]
    enable_search: bool,
    /// Response cache capacity ('0' disables caching)
    #[arg(short = 'r', long = "rcache", default_value_t = 0, env = "DNSRELAY_RCACHE")]
    rcache: i64,
    /// TTL in seconds for response cache entries
    #[arg(long = "rcache-ttl", default_value_t = 60, env = "DNSRELAY_RCACHE_TTL")]
    rcache_ttl: u32,
    /// Use the lowest TTL from the response; rcache-ttl and rcache-ttl-max bound it
    #[arg(long = "rcache-ttl-from-resp", env = "DNSRELAY_RCACHE_TTL_FROM_RESP", default_value_t = false)]
    rcache_ttl_from_resp: bool,
    /// Used with rcache-ttl-from-resp: upper bound for TTLs taken from responses
    #[arg(long = "rcache-ttl-max", default_value_t = 3600, env = "DNSRELAY_RCACHE_TTL_MAX")]
    rcache_ttl_max: u32,
    /// Stale retention in seconds: keep serving expired entries while nameservers are unreachable
    #[arg(long = "rstale-ttl", default_value_t = 0, env = "DNSRELAY_RSTALE_TTL")]
    rstale_ttl: u32,
    /// Cache only NOERROR responses and try other upstreams on negative status
    #[arg(long = "rcache-non-negative", env = "DNSRELAY_CACHE_NON_NEGATIVE", default_value_t = false)]
    rcache_non_negative: bool,
    /// Disable recursion
    #[arg(long = "no-rec", env = "DNSRELAY_NOREC", default_value_t = false)]
    no_rec: bool,
    /// Number of dots a name must have before the query is forwarded
    #[arg(long = "fwd-ndots", default_value_t = 0, env = "DNSRELAY_FWD_NDOTS")]
    fwd_ndots: usize,
    /// Number of dots a name must have before doing an initial absolute query (supersedes resolv.conf)
    #[arg(long = "ndots", env = "DNSRELAY_NDOTS")]
    ndots: Option<usize>,
    /// Bind to the socket activated by systemd (supersedes '--listen')
    #[arg(long = "systemd", env = "DNSRELAY_SYSTEMD", default_value_t = false)]
    systemd: bool,
    /// Number of UDP worker tasks (default: CPU count)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// Enable verbose logging
    #[arg(long = "verbose", env = "DNSRELAY_VERBOSE", default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // recover from an unclean shutdown before anything reads the file
    if let Err(err) = resolvconf::restore(Path::new(resolvconf::RESOLV_CONF)) {
        warn!(error = %err, "could not restore resolv.conf backup");
    }

    let config = Arc::new(build_config(&args)?);
    info!(
        listen = %config.listen,
        nameservers = ?config.nameservers,
        cache_capacity = config.cache_capacity,
        "starting dnsrelay"
    );
    if config.enable_search {
        info!(search_domains = ?config.search_domains, "search domains enabled");
    }

    let hosts = match &args.hostsfile {
        Some(path) => {
            let hosts = Hosts::load(path)
                .with_context(|| format!("load hosts file {}", path.display()))?;
            if args.hostsfile_watch {
                hosts.spawn_watcher(path.clone());
            }
            hosts
        }
        None => Hosts::empty(),
    };

    let stats = Arc::new(Stats::new());
    let cache = Arc::new(MessageCache::new(
        config.cache_capacity,
        config.cache_ttl,
        config.cache_stale_ttl,
        config.cache_ttl_from_response,
        config.cache_ttl_max,
    ));
    let forwarder = Forwarder::new(
        Arc::clone(&config),
        Exchanger::new(config.read_timeout),
        Arc::clone(&stats),
    );
    let handler = Handler::new(
        Arc::clone(&config),
        Arc::clone(&cache),
        hosts,
        forwarder,
        Arc::clone(&stats),
    );

    let control_state = ControlState { cache, stats };
    tokio::spawn(async move {
        if let Err(err) = control::run(control_state).await {
            error!(error = %err, "control server exited");
        }
    });

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };
    spawn_listeners(&args, &config, handler, udp_workers).await?;
    info!(bind = %config.listen, udp_workers, "dns server started");

    if args.default_resolver {
        if let Err(err) =
            resolvconf::store_address(Path::new(resolvconf::RESOLV_CONF), config.listen.ip())
        {
            warn!(error = %err, "failed to register as default nameserver");
        }
    }

    wait_for_shutdown().await?;
    info!("shutting down");

    if args.default_resolver {
        if let Err(err) = resolvconf::restore(Path::new(resolvconf::RESOLV_CONF)) {
            warn!(error = %err, "failed to restore resolv.conf");
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fmt_layer = fmt::layer().with_target(false);
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Resolves flags into the immutable runtime configuration, filling
/// nameservers, search domains and ndots from resolv.conf when unset.
fn build_config(args: &Args) -> anyhow::Result<Config> {
    let listen = config::normalize_host_port(&args.listen).context("listen address is invalid")?;

    let mut nameservers = Vec::new();
    for ns in &args.nameservers {
        nameservers.push(config::normalize_host_port(ns).context("nameserver is invalid")?);
    }

    let mut search_domains = Vec::new();
    for domain in &args.search_domains {
        search_domains.push(config::parse_search_domain(domain)?);
    }

    let mut stub_zones = Vec::new();
    for stub in &args.stubzones {
        stub_zones.extend(config::parse_stub_zone(stub)?);
    }

    let mut ndots = args.ndots;
    if nameservers.is_empty() || search_domains.is_empty() || ndots.is_none() {
        match resolvconf::read(Path::new(resolvconf::RESOLV_CONF)) {
            Ok(resolv) => {
                if nameservers.is_empty() {
                    nameservers = resolv.nameservers;
                }
                if search_domains.is_empty() {
                    search_domains = resolv
                        .search_domains
                        .iter()
                        .filter_map(|domain| config::parse_search_domain(domain).ok())
                        .collect();
                }
                if ndots.is_none() {
                    ndots = resolv.ndots;
                }
            }
            Err(err) => {
                warn!(error = %err, "error parsing resolv.conf");
            }
        }
    }

    Ok(Config {
        listen,
        nameservers,
        stub_zones,
        search_domains,
        enable_search: args.enable_search,
        no_recursion: args.no_rec,
        fwd_ndots: args.fwd_ndots,
        ndots: ndots.unwrap_or(1),
        cache_capacity: args.rcache,
        cache_ttl: args.rcache_ttl,
        cache_stale_ttl: args.rstale_ttl,
        cache_ttl_from_response: args.rcache_ttl_from_resp,
        cache_ttl_max: args.rcache_ttl_max,
        cache_non_negative: args.rcache_non_negative,
        read_timeout: Duration::from_secs(2),
    })
}

async fn spawn_listeners(
    args: &Args,
    config: &Arc<Config>,
    handler: Handler,
    udp_workers: usize,
) -> anyhow::Result<()> {
    let bind_addr = config.listen;

    if args.systemd {
        #[cfg(unix)]
        {
            let (udp, tcp) = systemd_sockets().context("adopt systemd sockets")?;
            let udp = udp.context("socket activation provided no datagram socket")?;
            udp.set_nonblocking(true).context("set nonblocking")?;
            let udp = Arc::new(UdpSocket::from_std(udp).context("adopt udp socket")?);
            for _ in 0..udp_workers {
                tokio::spawn(run_udp_worker(Arc::clone(&udp), handler.clone()));
            }
            if let Some(tcp) = tcp {
                tcp.set_nonblocking(true).context("set nonblocking")?;
                let listener = TcpListener::from_std(tcp).context("adopt tcp listener")?;
                tokio::spawn(run_tcp(listener, handler));
            }
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("socket activation is only supported on unix");
        }
    }

    #[cfg(unix)]
    {
        // one socket per worker with SO_REUSEPORT, the kernel spreads the load
        for worker_id in 0..udp_workers {
            let socket = bind_udp_socket(bind_addr, true)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = Arc::new(UdpSocket::from_std(socket)?);
            tokio::spawn(run_udp_worker(socket, handler.clone()));
        }
    }
    #[cfg(not(unix))]
    {
        let socket = bind_udp_socket(bind_addr, false).context("create udp socket")?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        for _ in 0..udp_workers {
            tokio::spawn(run_udp_worker(Arc::clone(&socket), handler.clone()));
        }
    }

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("bind tcp listener")?;
    tokio::spawn(run_tcp(listener, handler));
    Ok(())
}

fn bind_udp_socket(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_reuse_address(true).context("set reuse address")?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true).context("set reuse port")?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    Ok(socket.into())
}

/// Adopts sockets passed by a socket-activation supervisor (fd 3 onwards),
/// classifying them by SO_TYPE.
#[cfg(unix)]
fn systemd_sockets() -> anyhow::Result<(Option<std::net::UdpSocket>, Option<std::net::TcpListener>)>
{
    use std::os::unix::io::FromRawFd;

    const SD_LISTEN_FDS_START: libc::c_int = 3;

    let pid: i32 = std::env::var("LISTEN_PID")
        .context("LISTEN_PID is not set")?
        .parse()
        .context("LISTEN_PID is not a pid")?;
    anyhow::ensure!(
        pid == unsafe { libc::getpid() },
        "LISTEN_PID does not match this process"
    );
    let nfds: i32 = std::env::var("LISTEN_FDS")
        .context("LISTEN_FDS is not set")?
        .parse()
        .context("LISTEN_FDS is not a number")?;

    let mut udp = None;
    let mut tcp = None;
    for fd in SD_LISTEN_FDS_START..SD_LISTEN_FDS_START + nfds {
        let mut sock_type: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TYPE,
                &mut sock_type as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            continue;
        }
        match sock_type {
            libc::SOCK_DGRAM if udp.is_none() => {
                udp = Some(unsafe { std::net::UdpSocket::from_raw_fd(fd) });
            }
            libc::SOCK_STREAM if tcp.is_none() => {
                tcp = Some(unsafe { std::net::TcpListener::from_raw_fd(fd) });
            }
            _ => {}
        }
    }
    Ok((udp, tcp))
}

async fn run_udp_worker(socket: Arc<UdpSocket>, handler: Handler) {
    let mut buf = [0u8; MAX_UDP_PACKET];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = buf[..len].to_vec();
                let handler = handler.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(resp) = handler.handle_packet(&packet, Transport::Udp).await {
                        if let Err(err) = socket.send_to(&resp, peer).await {
                            debug!(peer = %peer, error = %err, "failed to write response");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "udp recv error");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, handler: Handler) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_conn(stream, handler).await {
                        debug!(peer = %peer, error = %err, "tcp connection ended");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "tcp accept error");
            }
        }
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, handler: Handler) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let Some(resp) = handler.handle_packet(&buf, Transport::Tcp).await else {
            return Ok(());
        };

        if resp.len() <= u16::MAX as usize {
            stream
                .write_all(&(resp.len() as u16).to_be_bytes())
                .await
                .context("write response length")?;
            stream.write_all(&resp).await.context("write response")?;
        }
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut quit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt signal received"),
            _ = terminate.recv() => info!("terminate signal received"),
            _ = quit.recv() => info!("quit signal received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("wait for interrupt")?;
        info!("interrupt signal received");
    }
    Ok(())
}
