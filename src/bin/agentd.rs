//! Process-selection shim (spec.md §6): parses the CLI, then either runs a
//! public command directly or forks and supervises the full service tree.
//!
//! Each service's actual logic lives in the `agentd` library; this binary's
//! job is the plumbing a real privilege-separated deployment needs around
//! that logic — binding listen sockets as root, building the Unix socket
//! pairs that stand in for spec.md §4.H's inherited descriptors, forking one
//! child per [`ServiceName`], and running each child's private-mode body.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use structopt::StructOpt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use agentd::canonization::{self, CanonizationConfig, CanonizationService};
use agentd::cli::{Action, Cli, PrivateCommand};
use agentd::config::{self, AgentConfig};
use agentd::dataservice::{dispatch, DataServiceEngine, RemoteEngineClient, Request};
use agentd::error::{CoreError, CoreResult};
use agentd::framing::{AuthedCodec, DataPacket, DataType, PacketCodec};
use agentd::listener::{self, ListenerService};
use agentd::protocol::{HandshakeInitiate, ProtocolConnection};
use agentd::reactor::{run_local, Reactor};
use agentd::supervisor::privsep;
use agentd::supervisor::{exit_code_for, ServiceName, Supervisor, STARTUP_ORDER};

const DEFAULT_CONFIG_PATH: &str = "/etc/agentd/agentd.conf";

/// Well-known inherited descriptor slots a private-mode child finds in
/// place by the time its body starts running (spec.md §6). Reused across
/// service kinds since each role only ever runs in its own process.
mod fdslots {
    use std::os::unix::io::RawFd;

    /// Carries a hex-encoded `config::encode_stream` blob across `exec`
    /// (spec.md §6's persistent configuration stream, piggy-backed over an
    /// environment variable since `privsep::exec_private` passes no
    /// argv beyond `-P <subcommand>`).
    pub const CONFIG_ENV: &str = "AGENTD_CONFIG_STREAM";
    /// Distinguishes the `Auth` and `Protocol` service roles, which share
    /// the same private subcommand name (`ServiceName::private_subcommand`).
    pub const ROLE_ENV: &str = "AGENTD_ROLE";

    pub const CONTROL: RawFd = 3;
    pub const DATASERVICE: RawFd = 4;
    pub const LISTEN_BASE: RawFd = 4;
}

fn main() {
    let cli = Cli::from_args();
    let result = match cli.resolve() {
        Ok(Action::Help) => {
            Cli::clap().print_help().ok();
            println!();
            Ok(())
        }
        Ok(Action::Readconfig) => run_readconfig(&cli),
        Ok(Action::Start) => run_start(&cli),
        Ok(Action::Private(cmd)) => run_private(cmd, &cli),
        Err(e) => {
            eprintln!("agentd: {e}");
            std::process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("agentd: {err}");
        std::process::exit(exit_code_for(&err));
    }
}

fn init_logging(log_level: u8) {
    let filter = match log_level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2..=3 => log::LevelFilter::Warn,
        4..=5 => log::LevelFilter::Info,
        6..=7 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .init();
}

fn load_config(cli: &Cli) -> CoreResult<AgentConfig> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let text = std::fs::read_to_string(&path)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("reading {}: {e}", path.display())))?;
    let config: AgentConfig = toml::from_str(&text)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("parsing {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

fn empty_config() -> AgentConfig {
    AgentConfig {
        log_dir: String::new(),
        log_level: 0,
        block_max_milliseconds: 0,
        block_max_transactions: 0,
        secret_path: String::new(),
        root_block_path: String::new(),
        datastore_path: String::new(),
        listen_addresses: Vec::new(),
        chroot_dir: String::new(),
        user: String::new(),
        group: String::new(),
        materialized_views: Vec::new(),
    }
}

fn load_private_config() -> CoreResult<AgentConfig> {
    let hex = std::env::var(fdslots::CONFIG_ENV)
        .map_err(|_| CoreError::Fatal(anyhow::anyhow!("missing {} env var", fdslots::CONFIG_ENV)))?;
    let bytes = hex_decode(&hex)?;
    config::decode_stream(&bytes, empty_config())
}

fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0F) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> CoreResult<Vec<u8>> {
    fn nibble(c: u8) -> CoreResult<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(CoreError::Fatal(anyhow::anyhow!("invalid hex digit"))),
        }
    }
    let bytes = s.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(CoreError::Fatal(anyhow::anyhow!("odd-length hex config stream")));
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks(2) {
        out.push((nibble(chunk[0])? << 4) | nibble(chunk[1])?);
    }
    Ok(out)
}

fn run_readconfig(cli: &Cli) -> CoreResult<()> {
    let config = load_config(cli)?;
    let stream = config::encode_stream(&config);
    std::io::stdout()
        .write_all(&stream)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("writing config stream: {e}")))?;
    Ok(())
}

fn raw_pair(kind: nix::sys::socket::SockType) -> CoreResult<(RawFd, RawFd)> {
    nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        kind,
        None,
        nix::sys::socket::SockFlag::empty(),
    )
    .map_err(|e| CoreError::Fatal(anyhow::anyhow!("socketpair: {e}")))
}

/// Forks, chroots, drops privileges and `exec`s the full service tree
/// (spec.md §4.H, §4.I), then supervises it until `SIGTERM`.
fn run_start(cli: &Cli) -> CoreResult<()> {
    use nix::sys::socket::SockType;

    let config = load_config(cli)?;
    init_logging(config.log_level);

    let (uid, gid) = privsep::lookup_usergroup(&config.user, &config.group)?;

    let mut listen_listeners = Vec::with_capacity(config.listen_addresses.len());
    for addr in &config.listen_addresses {
        let listener = StdTcpListener::bind((addr.addr, addr.port))
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("bind {}:{}: {e}", addr.addr, addr.port)))?;
        listen_listeners.push(listener);
    }
    let listen_fds: Vec<RawFd> = listen_listeners.iter().map(|l| l.as_raw_fd()).collect();

    // One socket pair per IPC relationship spec.md §4.H implies between
    // adjacent services: data-for-canonization<->canonization,
    // data-for-protocol<->protocol (both carrying the request-dispatcher
    // wire protocol), and listener<->protocol (SCM_RIGHTS fd hand-off).
    let (canon_dataservice_end, canon_end) = raw_pair(SockType::Stream)?;
    let (protocol_dataservice_end, protocol_remote_end) = raw_pair(SockType::Stream)?;
    let (listener_control_end, protocol_control_end) = raw_pair(SockType::Datagram)?;

    let config_hex = hex_encode(&config::encode_stream(&config));
    let agentd_path = std::env::current_exe()
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("current_exe: {e}")))?
        .to_string_lossy()
        .into_owned();
    let chroot_dir = config.chroot_dir.clone();

    let mut supervisor = Supervisor::new();

    for name in STARTUP_ORDER {
        let agentd_path = agentd_path.clone();
        let config_hex = config_hex.clone();
        let chroot_dir = chroot_dir.clone();
        let sub = name.private_subcommand();

        let fd_pairs: Vec<(RawFd, RawFd)> = match name {
            ServiceName::Random | ServiceName::Auth => Vec::new(),
            ServiceName::DataForCanonization => vec![(canon_dataservice_end, fdslots::CONTROL)],
            ServiceName::DataForProtocol => vec![(protocol_dataservice_end, fdslots::CONTROL)],
            ServiceName::Listener => {
                let mut pairs = vec![(listener_control_end, fdslots::CONTROL)];
                for (i, fd) in listen_fds.iter().enumerate() {
                    pairs.push((*fd, fdslots::LISTEN_BASE + i as RawFd));
                }
                pairs
            }
            ServiceName::Protocol => vec![
                (protocol_control_end, fdslots::CONTROL),
                (protocol_remote_end, fdslots::DATASERVICE),
            ],
            ServiceName::Canonization => vec![(canon_end, fdslots::CONTROL)],
        };
        let max_slot = fd_pairs.iter().map(|(_, t)| *t).max().unwrap_or(2);
        // `Auth` and `Protocol` share one private subcommand name
        // (`ServiceName::private_subcommand`); the role env var is how the
        // shared body tells which behavior to run.
        let role_tag = if name == ServiceName::Auth { "auth" } else { "protocol" };

        supervisor.spawn_child(name, move || {
            std::env::set_var(fdslots::ROLE_ENV, role_tag);
            std::env::set_var(fdslots::CONFIG_ENV, &config_hex);
            privsep::setfds(&fd_pairs)?;
            privsep::close_other_fds(max_slot)?;
            privsep::chroot(&chroot_dir)?;
            privsep::drop_privileges(uid, gid)?;
            privsep::exec_private(&agentd_path, sub)
        })?;
    }

    // The supervisor itself never talks on any of these; every descriptor
    // handed to a child was duplicated into place there, so the parent's
    // copies are now just clutter.
    drop(listen_listeners);
    for fd in [
        canon_dataservice_end,
        canon_end,
        protocol_dataservice_end,
        protocol_remote_end,
        listener_control_end,
        protocol_control_end,
    ] {
        let _ = nix::unistd::close(fd);
    }

    run_local(async move {
        supervisor.watch_signals().await;
        supervisor.shutdown_all();
    });
    Ok(())
}

fn run_private(cmd: PrivateCommand, cli: &Cli) -> CoreResult<()> {
    if cmd == PrivateCommand::Readconfig {
        return run_readconfig(cli);
    }
    let config = load_private_config()?;
    init_logging(config.log_level);
    match cmd {
        PrivateCommand::Random => run_random_private(),
        PrivateCommand::Dataservice => run_dataservice_private(&config),
        PrivateCommand::Listenservice => run_listenservice_private(&config),
        PrivateCommand::UnauthorizedProtocolService => run_protocol_or_auth_private(&config),
        PrivateCommand::CanonizationService => run_canonization_private(&config),
        PrivateCommand::Supervisor | PrivateCommand::Readconfig => Err(CoreError::Fatal(
            anyhow::anyhow!("{:?} is not a forked private-mode role", cmd),
        )),
    }
}

fn idle_until_signaled(name: &'static str) {
    run_local(async move {
        let reactor = Reactor::new(name);
        reactor.run(futures::future::pending::<()>()).await;
    });
}

/// The entropy device itself is an out-of-scope collaborator (spec.md §1)
/// and nothing in this binary yet opens a control channel to this process
/// (canonization currently mints block ids via `os_entropy` in-process, see
/// `canonization::try_make_block`'s reserved-for-future-wiring note); the
/// body is a signal-driven idle loop bounded by the reactor's exit flag.
fn run_random_private() -> CoreResult<()> {
    idle_until_signaled("random");
    Ok(())
}

const CONTROL_PACKET_TYPE: u8 = 0x20;

fn write_control_frame(stream: &mut UnixStream, payload: &[u8]) -> CoreResult<()> {
    let mut header = [0u8; 5];
    header[0] = CONTROL_PACKET_TYPE;
    BigEndian::write_u32(&mut header[1..5], payload.len() as u32);
    stream
        .write_all(&header)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("write frame header: {e}")))?;
    stream
        .write_all(payload)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("write frame body: {e}")))?;
    Ok(())
}

fn read_control_frame(stream: &mut UnixStream) -> CoreResult<Vec<u8>> {
    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("read frame header: {e}")))?;
    let size = BigEndian::read_u32(&header[1..5]) as usize;
    let mut payload = vec![0u8; size];
    stream
        .read_exact(&mut payload)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("read frame body: {e}")))?;
    Ok(payload)
}

/// Serves `CHILD_CONTEXT_CREATE`/`TRANSACTION_GET`/etc requests over its
/// inherited control channel, one storage transaction per request (spec.md
/// §4.D, §4.E). Exits cleanly when its peer (canonization or protocol)
/// closes the channel.
fn run_dataservice_private(config: &AgentConfig) -> CoreResult<()> {
    let mut engine = DataServiceEngine::open(std::path::Path::new(&config.datastore_path))?;
    let mut stream = unsafe { UnixStream::from_raw_fd(fdslots::CONTROL) };
    loop {
        let request_bytes = match read_control_frame(&mut stream) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(()),
        };
        let request = Request::decode(&request_bytes)?;
        let response = dispatch(&mut engine, &request)?;
        write_control_frame(&mut stream, &response)?;
    }
}

fn run_listenservice_private(config: &AgentConfig) -> CoreResult<()> {
    let listen_fds: Vec<RawFd> = (0..config.listen_addresses.len())
        .map(|i| fdslots::LISTEN_BASE + i as RawFd)
        .collect();

    run_local(async move {
        let reactor = Reactor::new("listener");
        let exit = reactor.exit_flag();
        match ListenerService::from_inherited(&listen_fds, fdslots::CONTROL) {
            Ok(mut service) => {
                reactor
                    .run(async {
                        if let Err(e) = service.run(exit).await {
                            log::error!("listener: {e}");
                        }
                    })
                    .await;
            }
            Err(e) => log::error!("listener: setup failed: {e}"),
        }
    });
    Ok(())
}

async fn read_decoded<D, T>(stream: &mut tokio::net::TcpStream, buf: &mut BytesMut, codec: &mut D) -> CoreResult<T>
where
    D: Decoder<Item = T, Error = CoreError>,
{
    loop {
        if let Some(item) = codec.decode(buf)? {
            return Ok(item);
        }
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("read: {e}")))?;
        if n == 0 {
            return Err(CoreError::Fatal(anyhow::anyhow!("peer closed connection")));
        }
    }
}

async fn write_encoded<D, T>(stream: &mut tokio::net::TcpStream, item: T, codec: &mut D) -> CoreResult<()>
where
    D: Encoder<T, Error = CoreError>,
{
    let mut buf = BytesMut::new();
    codec.encode(item, &mut buf)?;
    stream
        .write_all(&buf)
        .await
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("write: {e}")))?;
    Ok(())
}

/// Runs one client connection's handshake then authed request loop
/// (spec.md §4.G). The codec is swapped mid-stream (plain during the
/// handshake, authed afterward), so this drives `Decoder`/`Encoder`
/// directly against a shared read buffer rather than through one `Framed`.
async fn handle_client_connection(
    fd: RawFd,
    engine: Rc<RefCell<RemoteEngineClient>>,
    server_id: Vec<u8>,
) -> CoreResult<()> {
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("set_nonblocking: {e}")))?;
    let mut stream = tokio::net::TcpStream::from_std(std_stream)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("TcpStream::from_std: {e}")))?;

    let mut buf = BytesMut::new();
    let mut plain = PacketCodec;

    let init_packet = read_decoded(&mut stream, &mut buf, &mut plain).await?;
    if init_packet.kind != DataType::Data {
        return Err(CoreError::from(agentd::error::MALFORMED_PAYLOAD_DATA));
    }
    let initiate = HandshakeInitiate::decode(&init_packet.payload)?;

    let mut conn = ProtocolConnection::new();
    let response = conn.handle_initiate(&initiate, &server_id)?;
    write_encoded(&mut stream, DataPacket::data(response.encode()), &mut plain).await?;

    let ack_packet = read_decoded(&mut stream, &mut buf, &mut plain).await?;
    conn.handle_ack(&ack_packet.payload)?;

    let session = conn
        .session()
        .expect("a successful handle_ack always leaves a session in place")
        .clone();
    let mut authed = AuthedCodec::new(session);

    loop {
        let payload = read_decoded(&mut stream, &mut buf, &mut authed).await?;
        let response = {
            let mut eng = engine.borrow_mut();
            conn.dispatch(&mut *eng, &payload)?
        };
        write_encoded(&mut stream, response, &mut authed).await?;
        if conn.is_closed() {
            return Ok(());
        }
    }
}

/// Shared body for both halves of the `Auth`/`Protocol` name collision: the
/// auth service is a stub today (nothing in this process tree authenticates
/// a peer before the protocol handshake takes over), so only the `protocol`
/// role does real work; `auth` just stays up.
fn run_protocol_or_auth_private(config: &AgentConfig) -> CoreResult<()> {
    let role = std::env::var(fdslots::ROLE_ENV).unwrap_or_default();
    if role != "protocol" {
        idle_until_signaled("auth-stub");
        return Ok(());
    }

    let server_id = config.secret_path.clone().into_bytes();

    run_local(async move {
        let reactor = Reactor::new("protocol");
        let exit = reactor.exit_flag();
        let dataservice_stream = unsafe { UnixStream::from_raw_fd(fdslots::DATASERVICE) };
        let engine = Rc::new(RefCell::new(RemoteEngineClient::new(dataservice_stream)));

        reactor
            .run(async move {
                loop {
                    if exit.is_set() {
                        return;
                    }
                    let fd = match tokio::task::spawn_blocking(move || listener::recv_fd(fdslots::CONTROL)).await {
                        Ok(Ok(fd)) => fd,
                        Ok(Err(e)) => {
                            log::warn!("protocol: recv_fd failed: {e}");
                            return;
                        }
                        Err(e) => {
                            log::warn!("protocol: recv_fd task failed: {e}");
                            return;
                        }
                    };
                    let engine = engine.clone();
                    let server_id = server_id.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = handle_client_connection(fd, engine, server_id).await {
                            log::warn!("protocol: connection ended: {e}");
                        }
                    });
                }
            })
            .await;
    });
    Ok(())
}

fn run_canonization_private(config: &AgentConfig) -> CoreResult<()> {
    let stream = unsafe { UnixStream::from_raw_fd(fdslots::CONTROL) };
    let mut client = RemoteEngineClient::new(stream);
    let mask = canonization::canonization_caps();

    let mut service = CanonizationService::new();
    service.configure(CanonizationConfig {
        sleep_ms: config.block_max_milliseconds.max(1) as u64,
        max_txns_per_block: config.block_max_transactions.max(1) as u64,
    })?;
    service.start()?;

    run_local(async move {
        let reactor = Reactor::new("canonization");
        let exit = reactor.exit_flag();
        reactor
            .run(async {
                if let Err(e) = service.run_loop(&mut client, &mask, &exit).await {
                    log::error!("canonization: run_loop failed: {e}");
                }
            })
            .await;
    });
    Ok(())
}
