//! Runs the receiver against a simulated player.
//!
//! Senders connect over TCP using the length-prefixed JSON framing and
//! drive the session with LOAD / QUEUE_LOAD / PAUSE / ... commands. The
//! simulated player acknowledges setup instantly and reports a fixed
//! duration, which is enough to exercise loads, queueing and seeks end
//! to end without real media.

use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use cast_receiver::manager::ReceiverTask;
use cast_receiver::player::{
    AudioTrack, CaptionTrack, PlayerAdapter, PlayerEvent, PlayerEventKind, PlayerSetup,
    TRACK_DISABLED,
};
use cast_receiver::session::SessionId;
use cast_receiver::transport::{self, DEFAULT_PORT};
use cast_receiver::Result;

#[derive(clap::Parser, Clone, Debug)]
struct Args {
    /// Address to accept sender connections on.
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// Duration the simulated player reports for every content item, in
    /// seconds.
    #[arg(long, default_value_t = 60.0)]
    duration: f64,
}

/// Player that produces plausible event sequences without decoding
/// anything.
struct SimulatedPlayer {
    events: mpsc::Sender<PlayerEvent>,
    session_id: SessionId,
    duration: f64,
    position: f64,
    captions: Vec<CaptionTrack>,
    current_captions: usize,
    current_audio: i64,
}

impl SimulatedPlayer {
    fn new(events: mpsc::Sender<PlayerEvent>, duration: f64) -> SimulatedPlayer {
        SimulatedPlayer {
            events,
            session_id: 0,
            duration,
            position: 0.0,
            captions: vec![
                CaptionTrack {
                    id: "off".to_string(),
                    label: None,
                },
                CaptionTrack {
                    id: "captions.vtt".to_string(),
                    label: Some("English".to_string()),
                },
            ],
            current_captions: TRACK_DISABLED,
            current_audio: 0,
        }
    }

    fn emit(&self, kind: PlayerEventKind) {
        if let Err(err) = self.events.try_send(PlayerEvent::new(self.session_id, kind)) {
            warn!(%err, "dropping simulated player event");
        }
    }
}

impl PlayerAdapter for SimulatedPlayer {
    fn setup(&mut self, setup: PlayerSetup, session_id: SessionId) {
        info!(content = %setup.content_id, session_id, "simulated setup");
        self.session_id = session_id;
        self.position = 0.0;
        self.emit(PlayerEventKind::Ready);
        self.emit(PlayerEventKind::CaptionList {
            tracks: self.captions.clone(),
            current: self.current_captions,
        });
        self.emit(PlayerEventKind::AudioTracks {
            tracks: vec![AudioTrack {
                name: Some("Stereo".to_string()),
            }],
        });
        self.emit(PlayerEventKind::Time {
            position: 0.0,
            duration: self.duration,
        });
        if setup.autostart {
            self.emit(PlayerEventKind::Play);
        }
    }

    fn play(&mut self, _force: bool) {
        self.emit(PlayerEventKind::Play);
    }

    fn pause(&mut self, _force: bool) {
        self.emit(PlayerEventKind::Pause);
    }

    fn stop(&mut self) {
        self.emit(PlayerEventKind::Idle);
    }

    fn seek(&mut self, position: f64) {
        self.position = position.clamp(0.0, self.duration);
        self.emit(PlayerEventKind::Seek {
            position: Some(position),
        });
        self.emit(PlayerEventKind::Seeked);
        self.emit(PlayerEventKind::Time {
            position: self.position,
            duration: self.duration,
        });
    }

    fn set_volume(&mut self, level: u32) {
        info!(level, "simulated volume change");
    }

    fn set_mute(&mut self, mute: bool) {
        info!(mute, "simulated mute change");
    }

    fn caption_list(&self) -> Vec<CaptionTrack> {
        self.captions.clone()
    }

    fn current_captions(&self) -> usize {
        self.current_captions
    }

    fn set_current_captions(&mut self, index: usize) {
        self.current_captions = index;
    }

    fn current_audio_track(&self) -> i64 {
        self.current_audio
    }

    fn set_current_audio_track(&mut self, index: i64) {
        self.current_audio = index;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let args = Args::parse();
    tracing::debug!(?args, "args");

    let listener = TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "receiver listening");

    let (task, transport_tx) =
        ReceiverTask::new(|events| SimulatedPlayer::new(events, args.duration));

    tokio::spawn(async move {
        if let Err(err) = transport::serve(listener, transport_tx).await {
            warn!(%err, "transport serve loop failed");
        }
    });

    task.main().await
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{filter::LevelFilter, EnvFilter};

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))?;

    Ok(())
}
