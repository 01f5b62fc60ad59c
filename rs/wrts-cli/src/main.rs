mod observer;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

use wrts_core::buffer_state::Thresholds;
use wrts_core::source::http_adaptive::{CmcdMode, HttpAdaptiveSource};
use wrts_core::source::selection::TrackSelection;
use wrts_core::source::streaming::{HttpDirectSource, WsSource};
use wrts_core::source::{OpenParams, Source};
use wrts_core::{Environment, Player, Resolution};

use observer::TracingObserver;
use sink::FileSink;

/// Which wire mode to open the endpoint with (§2 item 5/6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
	/// Manifest-driven HTTP, with bitrate/frame-skip adaptation.
	Adaptive,
	/// A single long-lived WebSocket connection.
	Ws,
	/// A single long HTTP response.
	HttpDirect,
}

/// Mirrors [`CmcdMode`] for `clap`, which can't derive `ValueEnum` on a type
/// from another crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Cmcd {
	Query,
	Headers,
	Disabled,
}

impl From<Cmcd> for CmcdMode {
	fn from(mode: Cmcd) -> Self {
		match mode {
			Cmcd::Query => CmcdMode::Query,
			Cmcd::Headers => CmcdMode::Headers,
			Cmcd::Disabled => CmcdMode::Disabled,
		}
	}
}

/// Headless WRTS player: opens a stream and writes its CMAF fragments to
/// disk instead of feeding a browser `SourceBuffer`.
#[derive(Debug, Parser)]
#[command(name = "wrts", version, about)]
struct Cli {
	/// Manifest URL (adaptive transport) or media URL (ws/http-direct).
	url: Url,

	/// Directory fragments are written under, as `<output>/<audio|video>/`.
	#[arg(long, env = "WRTS_OUTPUT", default_value = "./wrts-out")]
	output: PathBuf,

	#[arg(long, value_enum, default_value_t = Transport::Adaptive, env = "WRTS_TRANSPORT")]
	transport: Transport,

	/// Disable frame-skip/sequence-skip recovery (§2's `reliable` flag).
	#[arg(long, env = "WRTS_RELIABLE")]
	reliable: bool,

	/// Pin to one audio track id instead of automatic bitrate selection.
	#[arg(long)]
	audio_track: Option<u32>,

	/// Pin to one video track id instead of automatic bitrate selection.
	#[arg(long)]
	video_track: Option<u32>,

	/// Cap the adaptive ladder to this resolution (requires --max-height too).
	#[arg(long, requires = "max_height")]
	max_width: Option<u16>,

	/// Cap the adaptive ladder to this resolution (requires --max-width too).
	#[arg(long, requires = "max_width")]
	max_height: Option<u16>,

	/// How Common Media Client Data rides along on adaptive requests.
	#[arg(long, value_enum, default_value_t = Cmcd::Query)]
	cmcd: Cmcd,

	/// Shared timeout slot duration (§4.7): Start, then Connection, then Data.
	#[arg(long, env = "WRTS_IDLE_TIMEOUT_MS", default_value_t = 14_000)]
	idle_timeout_ms: u64,

	/// Assumed fragment duration, since this sink never decodes a real one.
	#[arg(long, default_value_t = 2_000)]
	fragment_duration_ms: u64,

	/// How far behind the buffered end this sink keeps its simulated playhead.
	#[arg(long, default_value_t = 500)]
	target_latency_ms: u64,
}

fn cmcd_session_id() -> String {
	let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
	format!("wrts-cli-{nanos:x}-{}", std::process::id())
}

fn max_resolution(cli: &Cli) -> Option<Resolution> {
	match (cli.max_width, cli.max_height) {
		(Some(width), Some(height)) => Some(Resolution { width, height }),
		_ => None,
	}
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let cli = Cli::parse();

	let mut environment = Environment::new();
	if let Some(resolution) = max_resolution(&cli) {
		environment = environment.with_max_resolution(resolution);
	}

	let mut player = Player::with_observer(environment, Box::new(TracingObserver)).with_idle_timeout_ms(cli.idle_timeout_ms).with_reliable(cli.reliable);
	let handle = player.handle();

	let stop_on_ctrl_c = handle.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("ctrl-c received, stopping");
			stop_on_ctrl_c.stop();
		}
	});

	let client = reqwest::Client::builder().build()?;

	let source: Box<dyn Source> = match cli.transport {
		Transport::Adaptive => {
			let mut source = HttpAdaptiveSource::new(client.clone(), cmcd_session_id());
			source.set_cmcd_mode(cli.cmcd.into());
			source.set_max_resolution(max_resolution(&cli));
			Box::new(source)
		}
		Transport::Ws => Box::new(WsSource::new()),
		Transport::HttpDirect => Box::new(HttpDirectSource::new(client.clone())),
	};

	let params = OpenParams {
		audio: Some(cli.audio_track.map(TrackSelection::Track).unwrap_or(TrackSelection::Automatic)),
		video: Some(cli.video_track.map(TrackSelection::Track).unwrap_or(TrackSelection::Automatic)),
		reliable: cli.reliable,
		preload_ms: Some(Thresholds::default().middle()),
	};

	let mut sink = FileSink::new(cli.output.clone(), Duration::from_millis(cli.fragment_duration_ms), Duration::from_millis(cli.target_latency_ms))?;

	handle.media_source_open();

	tracing::info!(url = %cli.url, output = %cli.output.display(), transport = ?cli.transport, "opening session");
	player.run(source, &mut sink, cli.url, params).await?;
	Ok(())
}
