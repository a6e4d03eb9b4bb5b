mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};
use transport_bus::{Bus, LocalBus};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc_phone::{
    BusTransport, CallAnswer, CallOptions, ConnectionFactory, MediaStream, PeerId, PhoneConfig,
    PhoneSettings, RtcConnectionFactory, WebRtcPhone,
};

use crate::logging::{LogConfig, LogLevel};

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const FRAME: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("phone-demo: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "phone-demo",
    about = "Place a WebRTC call between two in-process phones",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(long, default_value = "alice", help = "Identifier of the calling phone")]
    caller: String,

    #[arg(long, default_value = "bob", help = "Identifier of the answering phone")]
    callee: String,

    #[arg(long, help = "Have the callee refuse the call")]
    reject: bool,

    #[arg(
        long,
        env = "PHONE_IGNORE_NON_TURN",
        help = "Only register relay candidates from the peer"
    )]
    ignore_non_turn: bool,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 5,
        help = "How long to keep the call up once both sides have media"
    )]
    hold: u64,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 15,
        help = "Give up if the call is not established in time"
    )]
    connect_timeout: u64,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PHONE_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PHONE_LOG_FILE",
        help = "Write structured logs to the specified file"
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

#[derive(Debug)]
enum DemoEvent {
    Answered(bool),
    Track { phone: PeerId, kind: String },
    HungUp(PeerId),
}

struct Handset {
    phone: WebRtcPhone,
    pacer: JoinHandle<()>,
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initializing logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut settings = PhoneSettings::from_env().context("reading PHONE_* settings")?;
    settings.ignore_non_turn |= cli.ignore_non_turn;
    info!(rtc_config = ?settings.rtc_config, ignore_non_turn = settings.ignore_non_turn, "settings loaded");

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let factory: Arc<dyn ConnectionFactory> =
        Arc::new(RtcConnectionFactory::new().context("building media engine")?);
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let callee = handset(&cli.callee, &bus, &factory, &settings, events_tx.clone(), cli.reject)
        .await
        .context("starting callee")?;
    let caller = handset(&cli.caller, &bus, &factory, &settings, events_tx, false)
        .await
        .context("starting caller")?;

    caller
        .phone
        .call_user(cli.callee.as_str(), CallOptions::default())
        .await;

    let established = timeout(Duration::from_secs(cli.connect_timeout), async {
        let mut tracks = 0;
        while let Some(event) = events.recv().await {
            match event {
                DemoEvent::Answered(false) => bail!("{} declined the call", cli.callee),
                DemoEvent::Answered(true) => info!("call accepted"),
                DemoEvent::Track { phone, kind } => {
                    info!(%phone, %kind, "receiving media");
                    tracks += 1;
                    if tracks >= 2 {
                        return Ok(());
                    }
                }
                DemoEvent::HungUp(phone) => bail!("{phone} hung up before media flowed"),
            }
        }
        bail!("phones stopped reporting events")
    })
    .await;

    let outcome = match established {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "call not established within {}s",
            cli.connect_timeout
        )),
    };

    if outcome.is_ok() {
        info!(hold_secs = cli.hold, state = ?caller.phone.state(), "call established");
        tokio::select! {
            _ = sleep(Duration::from_secs(cli.hold)) => {}
            _ = tokio::signal::ctrl_c() => warn!("interrupted"),
        }
    }

    caller.phone.disconnect().await;
    callee.phone.disconnect().await;
    for device in [caller, callee] {
        device.pacer.abort();
        device.phone.shutdown();
    }
    outcome
}

async fn handset(
    id: &str,
    bus: &Arc<dyn Bus>,
    factory: &Arc<dyn ConnectionFactory>,
    settings: &PhoneSettings,
    events: mpsc::UnboundedSender<DemoEvent>,
    reject: bool,
) -> Result<Handset> {
    let (stream, pacer) = silent_microphone(id);
    let me = PeerId::from(id);
    let transport = Arc::new(BusTransport::new(id, bus.clone()));

    let on_answer = events.clone();
    let on_track = events.clone();
    let on_hangup = events;
    let answer_stream = stream.clone();
    let track_owner = me.clone();
    let hangup_owner = me.clone();

    let config = PhoneConfig::new(transport)
        .connections(factory.clone())
        .with_settings(settings.clone())
        .my_stream(stream)
        .strict(true)
        .on_incoming_call(move |peer, responder| {
            info!(%peer, reject, "ringing");
            let answer = if reject {
                CallAnswer::reject()
            } else {
                CallAnswer::accept().with_stream(answer_stream.clone())
            };
            responder.respond(answer);
        })
        .on_call_response(move |accepted| {
            let _ = on_answer.send(DemoEvent::Answered(accepted));
        })
        .on_peer_stream(move |track| {
            let _ = on_track.send(DemoEvent::Track {
                phone: track_owner.clone(),
                kind: track.kind,
            });
        })
        .on_disconnect(move || {
            let _ = on_hangup.send(DemoEvent::HungUp(hangup_owner.clone()));
        });

    let phone = WebRtcPhone::new(config).await?;
    info!(phone = %me, "handset ready");
    Ok(Handset { phone, pacer })
}

/// An Opus track fed with silence so the peer sees live media.
fn silent_microphone(owner: &str) -> (MediaStream, JoinHandle<()>) {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        format!("{owner}-microphone"),
    ));

    let writer = track.clone();
    let pacer = tokio::spawn(async move {
        let mut ticks = interval(FRAME);
        loop {
            ticks.tick().await;
            let sample = Sample {
                data: Bytes::from_static(OPUS_SILENCE),
                duration: FRAME,
                ..Default::default()
            };
            if let Err(err) = writer.write_sample(&sample).await {
                debug!(error = %err, "dropping silence frame");
            }
        }
    });

    let stream = MediaStream::new(format!("{owner}-microphone")).with_track(track);
    (stream, pacer)
}
