use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use peer_meet::config::{Config, DEFAULT_SERVER, SERVER_ENV};
use peer_meet::media::SyntheticMediaSource;
use peer_meet::negotiation::NegotiationState;
use peer_meet::peer::{MockPeer, PeerConfig, PeerError, WebRtcPeer};
use peer_meet::relay::pusher::PusherBus;
use peer_meet::session::{
    HttpRoomService, LocalRoomService, Notice, RoomServiceError, SessionCoordinator, SessionError,
};
use peer_meet::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use relay_bus::{BusError, LocalBus};
use thiserror::Error;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    config.server = peer_meet::config::normalize_server(&cli.server);

    match cli.command {
        Command::Join(args) => handle_join(&config, args).await,
        Command::Demo(args) => handle_demo(args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "peer-meet",
    about = "Two-party WebRTC calls negotiated over a pub/sub relay",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = SERVER_ENV,
        default_value = DEFAULT_SERVER,
        help = "Base URL of the room server"
    )]
    server: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "PEER_MEET_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "PEER_MEET_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room through the room server and the Pusher relay
    Join(JoinArgs),
    /// Run two in-process participants through a full call setup
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, help = "Room name to register in")]
    room: String,

    #[arg(long, help = "Identity announced to the room")]
    username: String,

    #[arg(long, help = "Call the first participant that joins after us")]
    call: bool,

    #[arg(long = "send-media", help = "Attach local media once the call is accepted")]
    send_media: bool,
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, default_value = "demo", help = "Room name used by both participants")]
    room: String,

    #[arg(
        long = "timeout-secs",
        default_value_t = 10,
        help = "Give up if the call is not set up within this many seconds"
    )]
    timeout_secs: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    #[error("{0} is required to reach the relay")]
    MissingSetting(&'static str),
    #[error("relay connection failed: {0}")]
    Relay(#[from] BusError),
    #[error("peer connection setup failed: {0}")]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Room(#[from] RoomServiceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("demo did not finish within {0:?}")]
    DemoTimeout(Duration),
}

async fn handle_join(config: &Config, args: JoinArgs) -> Result<(), CliError> {
    let pusher = config
        .pusher()
        .ok_or(CliError::MissingSetting(peer_meet::config::PUSHER_KEY_ENV))?;
    let bus = Arc::new(PusherBus::connect(&pusher).await?);
    let rooms = Arc::new(HttpRoomService::new(&config.server)?);
    let peer = Arc::new(WebRtcPeer::new(&PeerConfig::new(config.ice_servers.clone())).await?);

    let mut session =
        SessionCoordinator::new(peer, rooms, bus, Arc::new(SyntheticMediaSource::default()));
    let mut notices = session.subscribe_notices();
    session.join_room(&args.room, &args.username).await?;
    println!("joined room {} as {}", args.room, args.username);

    let mut media_sent = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = session.next_event() => {
                let Some(event) = event else { break };
                if let Err(err) = session.handle_event(event).await {
                    eprintln!("⚠️  {err}");
                }
            }
        }
        for notice in drain_notices(&mut notices) {
            print_notice(&notice);
            match notice {
                Notice::PeerJoined { .. } if args.call => {
                    if let Err(err) = session.start_call().await {
                        eprintln!("⚠️  unable to start call: {err}");
                    }
                }
                Notice::CallAccepted if args.send_media && !media_sent => {
                    match session.attach_local_media().await {
                        Ok(()) => media_sent = true,
                        Err(err) => eprintln!("⚠️  unable to send media: {err}"),
                    }
                }
                _ => {}
            }
        }
    }

    info!(room = %args.room, "leaving room");
    session.close().await?;
    Ok(())
}

fn drain_notices(notices: &mut tokio::sync::broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut drained = Vec::new();
    loop {
        match notices.try_recv() {
            Ok(notice) => drained.push(notice),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "notices lagged");
            }
            Err(_) => break,
        }
    }
    drained
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::JoinedRoom { room } => println!("✅ joined room {room}"),
        Notice::PeerJoined { identity } => println!("👋 {identity} joined"),
        Notice::RelayAccepted { message } => debug!(%message, "relay accepted"),
        Notice::RelayRejected { reason } => println!("⚠️  relay rejected: {reason}"),
        Notice::CallAccepted => println!("📞 call accepted"),
        Notice::StreamsSent { tracks } => println!("📤 sent {tracks} local tracks"),
        Notice::RemoteTrack { kind } => println!("📥 receiving remote {kind}"),
        Notice::Failure { reason } => println!("⚠️  {reason}"),
    }
}

/// Runs two participants against an in-process relay and room server with
/// scripted engines: join, call, accept, send media, renegotiate.
async fn handle_demo(args: DemoArgs) -> Result<(), CliError> {
    let bus = Arc::new(LocalBus::new());
    let rooms = Arc::new(LocalRoomService::new(bus.clone()));
    let media = Arc::new(SyntheticMediaSource::default());
    let mut alice = SessionCoordinator::new(
        Arc::new(MockPeer::new("alice")),
        rooms.clone(),
        bus.clone(),
        media.clone(),
    );
    let bob_peer = MockPeer::new("bob");
    let mut bob = SessionCoordinator::new(Arc::new(bob_peer.clone()), rooms, bus, media);

    let limit = Duration::from_secs(args.timeout_secs);
    tokio::time::timeout(limit, async {
        alice.join_room(&args.room, "alice").await?;
        bob.join_room(&args.room, "bob").await?;
        let mut alice_notices = alice.subscribe_notices();

        let mut called = false;
        let mut attached = false;
        loop {
            tokio::select! {
                Some(event) = alice.next_event() => {
                    alice.handle_event(event).await?;
                }
                Some(event) = bob.next_event() => {
                    bob.handle_event(event).await?;
                }
            }
            for notice in drain_notices(&mut alice_notices) {
                print_notice(&notice);
            }
            if !called && alice.remote_peer().is_some() {
                alice.start_call().await?;
                called = true;
            }
            if !attached && alice.call_active() {
                alice.attach_local_media().await?;
                attached = true;
            }
            // The renegotiation offer carrying alice's media is bob's second
            // remote description.
            let settled = attached
                && bob.call_active()
                && bob_peer.remote_description_sets() >= 2
                && alice.negotiation_state() == NegotiationState::Connected
                && bob.negotiation_state() == NegotiationState::Connected;
            if settled {
                println!("✅ call set up between alice and bob in room {}", args.room);
                return Ok::<(), CliError>(());
            }
        }
    })
    .await
    .map_err(|_| CliError::DemoTimeout(limit))??;

    alice.close().await?;
    bob.close().await?;
    Ok(())
}
