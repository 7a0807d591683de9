mod advertise;
mod collection;
mod content_directory;
mod didl;
mod media_server;
mod service;
mod ssdp;

use std::env;
use std::error::Error;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use url::Url;
use uuid::Uuid;

use crate::collection::Collection;
use crate::media_server::MediaServer;
use crate::ssdp::SSDP_IPV4_MULTICAST_ADDRESS;

pub const NAME: &str = env!("CARGO_PKG_NAME");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const UPNP_VERSION: &str = "UPnP/1.0";

pub const MEDIA_SERVER_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:MediaServer:1";

const DEFAULT_HTTP_PORT: u16 = 8200;

const DEFAULT_SEARCH_PORT: u16 = 1900;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

// Blocking reads and accepts poll at this pace so the shutdown flag is
// never observed late.
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);

// How long in-flight HTTP requests get to finish once we stop accepting.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// The device identity everything advertises and serves. Built once in
/// `run`, after the search-port fallback has settled, and immutable from
/// then on; every task holds it behind an `Arc`.
pub struct SysInfo {
    pub device_uuid: Uuid,
    pub friendly_name: String,
    pub device_type: String,
    pub service_types: Vec<String>,
    pub os_version: String,
    pub base_url: Url,
    pub interval: Duration,
    pub search_port: u16,
}

impl SysInfo {
    pub fn new(
        device_uuid: Uuid,
        friendly_name: &str,
        os_version: &str,
        base_url: Url,
        interval: Duration,
        search_port: u16,
        service_types: Vec<String>,
    ) -> Self {
        Self {
            device_uuid,
            friendly_name: friendly_name.to_string(),
            device_type: MEDIA_SERVER_DEVICE_TYPE.to_string(),
            service_types,
            os_version: os_version.to_string(),
            base_url,
            interval,
            search_port,
        }
    }

    pub fn uuid_urn(&self) -> String {
        format!("uuid:{}", self.device_uuid)
    }

    pub fn server_tokens(&self) -> String {
        format!("{} {UPNP_VERSION} {NAME}/{VERSION}", self.os_version)
    }
}

/// The one seam the SSDP code needs for testing: something datagrams can be
/// sent through.
pub trait SocketToMe {
    fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> std::io::Result<usize>;
}

impl SocketToMe for Socket {
    fn send_to(&mut self, buf: &[u8], addr: &SockAddr) -> std::io::Result<usize> {
        Socket::send_to(self, buf, addr)
    }
}

#[cfg(test)]
pub fn new_test_sys_info() -> SysInfo {
    SysInfo::new(
        Uuid::parse_str("5c863963-f2a2-491e-8b60-079cdadad147").unwrap(),
        "midlari test",
        "a/1",
        Url::parse("http://192.168.1.9:8200/").unwrap(),
        Duration::from_secs(3),
        1900,
        vec![content_directory::SERVICE_TYPE.to_string()],
    )
}

#[derive(Debug, PartialEq)]
struct Config {
    interface: Option<Ipv4Addr>,
    name: String,
    port: u16,
    interval: Duration,
    verbose: bool,
    directories: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            name: NAME.to_string(),
            port: DEFAULT_HTTP_PORT,
            interval: DEFAULT_INTERVAL,
            verbose: false,
            directories: Vec::new(),
        }
    }
}

fn usage() -> String {
    format!(
        "usage: {NAME} [options] [directory...]\n\
         \n\
         serve the given directories (default: the current one) as a UPnP media server\n\
         \n\
         options:\n\
         \x20 -i, --interface <ipv4>  address of the network interface to serve on\n\
         \x20 -n, --name <name>       friendly name shown on player devices\n\
         \x20 -p, --port <port>       HTTP port (default {DEFAULT_HTTP_PORT})\n\
         \x20 -t, --interval <secs>   advertise interval in seconds (default {})\n\
         \x20 -v, --verbose           show more logs\n\
         \x20 -h, --help              show this help",
        DEFAULT_INTERVAL.as_secs()
    )
}

/// `None` means help was asked for.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<Config>, String> {
    let mut config = Config::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-v" | "--verbose" => config.verbose = true,
            "-i" | "--interface" => {
                let value = args.next().ok_or("missing value for --interface")?;
                config.interface = Some(
                    value
                        .parse()
                        .map_err(|_| format!("{value} is not an IPv4 address"))?,
                );
            }
            "-n" | "--name" => {
                config.name = args.next().ok_or("missing value for --name")?;
            }
            "-p" | "--port" => {
                let value = args.next().ok_or("missing value for --port")?;
                config.port = value
                    .parse()
                    .map_err(|_| format!("{value} is not a port number"))?;
            }
            "-t" | "--interval" => {
                let value = args.next().ok_or("missing value for --interval")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("{value} is not a number of seconds"))?;
                if secs == 0 {
                    return Err("interval must be at least one second".to_string());
                }
                config.interval = Duration::from_secs(secs);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option {flag}")),
            directory => config.directories.push(PathBuf::from(directory)),
        }
    }

    Ok(Some(config))
}

/// Which address would the kernel route SSDP traffic out of? A connected
/// (never used) UDP socket answers without sending a byte.
fn discover_local_address() -> Result<Ipv4Addr, String> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|err| format!("could not create a probe socket: {err}"))?;
    socket
        .connect(SSDP_IPV4_MULTICAST_ADDRESS)
        .map_err(|err| format!("could not pick an outbound interface: {err}"))?;
    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => {
            Ok(*addr.ip())
        }
        _ => Err("could not determine a local IPv4 address; pass --interface".to_string()),
    }
}

fn resolve_root(directories: &[PathBuf]) -> Result<PathBuf, Box<dyn Error>> {
    match directories {
        [] => canonical(&PathBuf::from(".")),
        [single] => canonical(single),
        many => assemble_symlink_root(many),
    }
}

fn canonical(directory: &PathBuf) -> Result<PathBuf, Box<dyn Error>> {
    let path = fs::canonicalize(directory)
        .map_err(|err| format!("cannot open {}: {err}", directory.display()))?;
    if !path.is_dir() {
        return Err(format!("{} is not a directory", directory.display()).into());
    }
    Ok(path)
}

/// More than one directory argument becomes one root full of symlinks, so
/// the rest of the server only ever sees a single tree.
#[cfg(unix)]
fn assemble_symlink_root(directories: &[PathBuf]) -> Result<PathBuf, Box<dyn Error>> {
    let root = env::temp_dir().join(format!("{NAME}-{}", process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root)?;

    for directory in directories {
        let target = canonical(directory)?;
        let name = target
            .file_name()
            .ok_or_else(|| format!("{} has no name to link as", target.display()))?;
        let link = root.join(name);
        if link.symlink_metadata().is_ok() {
            return Err(format!("more than one directory is named {name:?}").into());
        }
        std::os::unix::fs::symlink(&target, &link)?;
    }

    Ok(root)
}

#[cfg(not(unix))]
fn assemble_symlink_root(_directories: &[PathBuf]) -> Result<PathBuf, Box<dyn Error>> {
    Err("multiple directory arguments are only supported on unix".into())
}

fn bind_multicast_listener(interface: Ipv4Addr) -> std::io::Result<Socket> {
    let addr: SocketAddr = SSDP_IPV4_MULTICAST_ADDRESS
        .parse()
        .unwrap_or_else(|_| panic!("multicast address {SSDP_IPV4_MULTICAST_ADDRESS} is invalid"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;

    let IpAddr::V4(group) = addr.ip() else {
        panic!("multicast address {SSDP_IPV4_MULTICAST_ADDRESS} is not ipv4");
    };
    socket.join_multicast_v4(&group, &interface)?;
    socket.bind(&SockAddr::from(addr))?;

    Ok(socket)
}

fn bind_udp(interface: Ipv4Addr, port: u16) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
    socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(interface), port)))?;
    Ok(socket)
}

/// Bind the directed-search socket. Port 1900 is routinely taken (our own
/// multicast listener, another DLNA server); the fallback lands on an
/// ephemeral port which is then advertised via SEARCHPORT.UPNP.ORG. This
/// runs before any task starts, so the advertised value never changes
/// afterwards.
fn bind_search_socket(interface: Ipv4Addr) -> std::io::Result<(Socket, u16)> {
    let socket = match bind_udp(interface, DEFAULT_SEARCH_PORT) {
        Ok(socket) => socket,
        Err(err) => {
            debug!("could not bind search port {DEFAULT_SEARCH_PORT}: {err}, using an ephemeral port");
            bind_udp(interface, 0)?
        }
    };

    let port = socket
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .ok_or_else(|| std::io::Error::other("search socket has no local address"))?;
    Ok((socket, port))
}

fn http_serve(listener: &TcpListener, server: &Arc<MediaServer>, shutdown: &Arc<AtomicBool>) {
    match listener.local_addr() {
        Ok(addr) => info!("listening on {addr}"),
        Err(_) => info!("listening"),
    }

    let in_flight = Arc::new(AtomicUsize::new(0));
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let server = server.clone();
                let in_flight = in_flight.clone();
                in_flight.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    media_server::handle_device_connection(&server, peer.ip(), &stream, &stream);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(SOCKET_READ_TIMEOUT),
            Err(err) => {
                error!("error accepting connection: {err}");
                break;
            }
        }
    }

    // stopped accepting; in-flight requests get a bounded window to finish
    let deadline = Instant::now() + SHUTDOWN_DEADLINE;
    while in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let leftover = in_flight.load(Ordering::SeqCst);
    if leftover > 0 {
        warn!("shutting down with {leftover} requests still in flight");
    }
    info!("stopped listening");
}

fn run() -> Result<(), Box<dyn Error>> {
    let Some(config) = parse_args(env::args().skip(1))? else {
        println!("{}", usage());
        return Ok(());
    };

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if config.verbose { "debug" } else { "info" }),
    )
    .init();

    let interface = match config.interface {
        Some(interface) => interface,
        None => discover_local_address()?,
    };

    let root = resolve_root(&config.directories)?;
    let collection = Arc::new(Collection::index(&root)?);

    let listener = TcpListener::bind((interface, config.port))
        .map_err(|err| format!("could not listen on {interface}:{}: {err}", config.port))?;
    let base_url = Url::parse(&format!("http://{}/", listener.local_addr()?))?;

    let multicast_socket = bind_multicast_listener(interface)
        .map_err(|err| format!("could not join the SSDP multicast group: {err}"))?;
    let (unicast_socket, search_port) = bind_search_socket(interface)
        .map_err(|err| format!("could not bind a search socket: {err}"))?;

    let os = os_info::get();
    let sys_info = Arc::new(SysInfo::new(
        Uuid::new_v4(),
        &config.name,
        &format!("{}/{}", os.os_type(), os.version()),
        base_url.clone(),
        config.interval,
        search_port,
        vec![content_directory::SERVICE_TYPE.to_string()],
    ));

    info!(
        "{NAME} {VERSION} serving {} entries from {} at {base_url} as {:?} ({})",
        collection.entry_count(),
        collection.base().display(),
        config.name,
        sys_info.uuid_urn()
    );

    let services = vec![content_directory::service(collection.clone(), base_url)];
    let server = Arc::new(MediaServer {
        sys_info: sys_info.clone(),
        services,
        collection,
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let (advertiser_tx, advertiser_rx) = mpsc::channel();

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Relaxed);
            let _ = advertiser_tx.send(());
        })?;
    }

    listener.set_nonblocking(true)?;
    let http = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || http_serve(&listener, &server, &shutdown))
    };

    let advertiser = {
        let sys_info = sys_info.clone();
        thread::spawn(move || {
            let group: SocketAddr = SSDP_IPV4_MULTICAST_ADDRESS.parse().unwrap_or_else(|_| {
                panic!("multicast address {SSDP_IPV4_MULTICAST_ADDRESS} is invalid")
            });
            match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
                Ok(mut socket) => advertise::advertise(
                    &sys_info,
                    &mut socket,
                    &SockAddr::from(group),
                    &advertiser_rx,
                ),
                Err(err) => error!("could not create an advertiser socket: {err}"),
            }
        })
    };

    let (requests_tx, requests_rx) = mpsc::channel();
    let multicast_reader = {
        let requests = requests_tx.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || advertise::read_search_requests(&multicast_socket, &requests, &shutdown))
    };
    let unicast_reader = {
        let requests = requests_tx;
        let shutdown = shutdown.clone();
        thread::spawn(move || advertise::read_search_requests(&unicast_socket, &requests, &shutdown))
    };
    let responder = {
        let sys_info = sys_info.clone();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
                Ok(mut socket) => {
                    advertise::reply_search(&sys_info, &requests_rx, &mut socket, &shutdown);
                }
                Err(err) => error!("could not create a search response socket: {err}"),
            }
        })
    };

    // The interrupt handler flips the flag and wakes the advertiser; the
    // advertiser join means the byebye burst finished before we return and
    // its socket closes.
    for (name, handle) in [
        ("advertiser", advertiser),
        ("http", http),
        ("multicast reader", multicast_reader),
        ("unicast reader", unicast_reader),
        ("responder", responder),
    ] {
        if handle.join().is_err() {
            error!("{name} thread panicked");
        }
    }

    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{NAME}: {err}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults() {
        let config = parse_args(args(&[])).unwrap().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 8200);
        assert_eq!(config.interval, Duration::from_secs(3));
        assert!(!config.verbose);
        assert!(config.directories.is_empty());
    }

    #[test]
    fn test_parse_args_everything() {
        let config = parse_args(args(&[
            "-i",
            "192.168.1.9",
            "--name",
            "den shelf",
            "-p",
            "9000",
            "--interval",
            "30",
            "-v",
            "/srv/music",
            "/srv/video",
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(config.interface, Some(Ipv4Addr::new(192, 168, 1, 9)));
        assert_eq!(config.name, "den shelf");
        assert_eq!(config.port, 9000);
        assert_eq!(config.interval, Duration::from_secs(30));
        assert!(config.verbose);
        assert_eq!(
            config.directories,
            vec![PathBuf::from("/srv/music"), PathBuf::from("/srv/video")]
        );
    }

    #[test]
    fn test_parse_args_help() {
        assert_eq!(parse_args(args(&["--help"])).unwrap(), None);
        assert_eq!(parse_args(args(&["-h", "dir"])).unwrap(), None);
    }

    #[test]
    fn test_parse_args_rejects_junk() {
        assert!(parse_args(args(&["--interface", "not-an-ip"])).is_err());
        assert!(parse_args(args(&["--interface"])).is_err());
        assert!(parse_args(args(&["--port", "99999"])).is_err());
        assert!(parse_args(args(&["--interval", "0"])).is_err());
        assert!(parse_args(args(&["--frobnicate"])).is_err());
    }

    #[test]
    fn test_server_tokens() {
        let sys_info = new_test_sys_info();
        assert_eq!(sys_info.server_tokens(), format!("a/1 UPnP/1.0 {NAME}/{VERSION}"));
        assert_eq!(
            sys_info.uuid_urn(),
            "uuid:5c863963-f2a2-491e-8b60-079cdadad147"
        );
    }
}
