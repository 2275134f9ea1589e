/// Main entry point for the Echonest Player CLI
use anyhow::Context;
use clap::Parser;
use echonest_player::airhorn::Airhorns;
use echonest_player::credentials::CredentialCache;
use echonest_player::playback::RodioOutput;
use echonest_player::providers::soundcloud::SoundcloudDriver;
use echonest_player::providers::spotify::{SpotifyDriver, WebApiClient};
use echonest_player::providers::youtube::YoutubeDriver;
use echonest_player::providers::BackendRegistry;
use echonest_player::session::{Reauthorizer, SessionParts};
use echonest_player::transport::WebSocketConnector;
use echonest_player::{Config, Connection, Session, SessionCommand, SessionStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(
    name = "echonest-player",
    version,
    about = "Plays a shared listening queue through Spotify, YouTube and SoundCloud",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Queue server websocket URL
    #[arg(short, long)]
    server: Option<String>,

    /// Start as the audio producer
    #[arg(short, long)]
    producer: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Connect and play (default)
    Run,

    /// Write a default configuration file
    InitConfig,

    /// Print the effective configuration
    ShowConfig,
}

/// Prints the authorization URL for the user to open
struct ConsoleReauthorizer;

impl Reauthorizer for ConsoleReauthorizer {
    fn reauthorize(&self, url: &str) {
        println!("Spotify authorization required. Open this URL, then type `reauth-done`:");
        println!("  {}", url);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    if let Some(Command::InitConfig) = args.command {
        Config::default().save_to(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(server) = args.server {
        config.server.url = server;
        config.validate()?;
    }
    if args.producer {
        config.session.producer_on_start = true;
    }

    let level = args
        .log_level
        .unwrap_or_else(|| config.general.log_level.clone());
    init_logging(&level)?;

    match args.command {
        Some(Command::ShowConfig) => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        _ => run(config).await,
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let level: LevelFilter = level.parse()?;
    let quiet = level.min(LevelFilter::INFO);
    let filter = Targets::new()
        .with_default(level)
        .with_target("tungstenite", quiet)
        .with_target("tokio_tungstenite", quiet)
        .with_target("reqwest", quiet)
        .with_target("hyper", quiet);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting Echonest Player v{}", env!("CARGO_PKG_VERSION"));

    let connection = Connection::with_connector(
        config.server.url.clone(),
        Arc::new(WebSocketConnector),
        config.transport_settings(),
    );
    let credentials = CredentialCache::new();
    let (reports_tx, reports) = mpsc::unbounded_channel();
    let mut backends = BackendRegistry::new();

    if config.spotify.enabled {
        backends.register(Arc::new(SpotifyDriver::new(
            Arc::new(WebApiClient::new(config.spotify.api_base_url.clone())),
            credentials.playback_token(),
            reports_tx.clone(),
            config.retry_settings(),
        )));
    }

    if config.youtube.enabled {
        let youtube = Arc::new(YoutubeDriver::new(config.youtube.volume_scale));
        backends.register(youtube.clone());
        start_video_player(&config, youtube);
    }

    let soundcloud = if config.soundcloud.enabled {
        let driver = Arc::new(
            SoundcloudDriver::new(
                Arc::new(connection.clone()),
                Arc::new(RodioOutput::new(Some(reports_tx))),
            )
            .with_stream_timeout(config.stream_timeout()),
        );
        backends.register(driver.clone());
        Some(driver)
    } else {
        None
    };

    // Airhorns get their own output so they play over a SoundCloud stream.
    let airhorns = if config.airhorn.enabled {
        let output = Arc::new(RodioOutput::new(None));
        match config.airhorn_base_url()? {
            Some(base_url) => Some(Airhorns::new(base_url, output)),
            None => Some(Airhorns::from_server_url(&config.server.url, output)?),
        }
    } else {
        None
    };

    let (session, handle) = Session::new(SessionParts {
        connection,
        credentials,
        backends,
        soundcloud,
        airhorns,
        reports,
        reauthorizer: Arc::new(ConsoleReauthorizer),
        settings: config.session_settings(),
    });
    let session_task = tokio::spawn(session.run());

    println!("Commands: p (producer), m (mute), pause, unpause, vol N, reauth-done, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(line.trim()) {
            Ok(Some(command)) => command,
            Ok(None) => {
                print_status(&handle.status());
                continue;
            }
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };
        let shutdown = command == SessionCommand::Shutdown;
        if !handle.send(command) || shutdown {
            break;
        }
    }

    handle.send(SessionCommand::Shutdown);
    session_task.await?;
    Ok(())
}

#[cfg(unix)]
fn start_video_player(config: &Config, youtube: Arc<YoutubeDriver>) {
    use echonest_player::providers::mpv::MpvPlayer;

    let settings = config.mpv_settings();
    tokio::spawn(async move {
        match MpvPlayer::launch(&settings).await {
            Ok(player) => youtube.attach(player),
            Err(e) => warn!("YouTube playback unavailable: {}", e),
        }
    });
}

#[cfg(not(unix))]
fn start_video_player(_config: &Config, _youtube: Arc<YoutubeDriver>) {
    warn!("YouTube playback needs mpv IPC, which is only supported on unix");
}

/// `Ok(None)` means the line asked for a status report
fn parse_command(line: &str) -> Result<Option<SessionCommand>, String> {
    let mut parts = line.split_whitespace();
    let command = match (parts.next(), parts.next()) {
        (Some("p"), None) => SessionCommand::ToggleProducer,
        (Some("m"), None) => SessionCommand::ToggleMute,
        (Some("pause"), None) => SessionCommand::Pause,
        (Some("unpause"), None) => SessionCommand::Unpause,
        (Some("vol"), Some(level)) => {
            let level: u8 = level
                .parse()
                .map_err(|_| format!("invalid volume: {}", level))?;
            SessionCommand::ChangeVolume(level.min(100))
        }
        (Some("reauth-done"), None) => SessionCommand::ReauthorizationComplete,
        (Some("status"), None) => return Ok(None),
        (Some("quit"), None) | (Some("q"), None) => SessionCommand::Shutdown,
        _ => return Err(format!("unknown command: {}", line)),
    };
    Ok(Some(command))
}

fn print_status(status: &SessionStatus) {
    println!(
        "connected={} producer={} state={} volume={} (shared {}){}",
        status.connected,
        status.producer,
        status.state,
        status.effective_volume,
        status.shared_volume,
        if status.muted { " muted" } else { "" }
    );
    if let Some(title) = &status.now_playing.title {
        let artist = status.now_playing.artist.as_deref().unwrap_or("unknown artist");
        let src = status.now_playing.src.as_deref().unwrap_or("?");
        match status.remaining {
            Some(remaining) => println!("  {} - {} [{}] {:.0}s left", title, artist, src, remaining),
            None => println!("  {} - {} [{}]", title, artist, src),
        }
    }
    println!(
        "  credentials: playback={} search={} (as of {})",
        status.playback_token,
        status.search_token,
        status.updated_at.format("%H:%M:%S")
    );
}
