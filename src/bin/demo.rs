//! Runs a clinician/patient call inside one process over the loopback transport

use clap::Parser;
use physio_link::media::synthetic::{PreviewLog, SyntheticDevices};
use physio_link::peer::loopback::LoopbackNetwork;
use physio_link::peer::messages::{Landmark, Pose};
use physio_link::signaling::token;
use physio_link::{
    logger, Result, Role, SessionConfig, SessionController, SessionDeps, SessionError,
    SessionEvent, SessionHandle, SignalingBus, SkeletonUpdate,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "physio-link-demo")]
#[command(about = "Connect an offerer and an answerer in-process and exchange messages")]
struct Args {
    /// Session configuration (TOML)
    #[arg(long, env = "PHYSIO_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Chat messages sent by each side
    #[arg(long, default_value_t = 3)]
    messages: usize,

    /// Skeleton frames streamed by the answerer at 30 Hz
    #[arg(long, default_value_t = 30)]
    skeleton_frames: usize,

    /// Share the offerer's screen for a moment
    #[arg(long)]
    share_screen: bool,

    /// Print the offerer's signaling as a copy-paste token once connected
    #[arg(long)]
    print_token: bool,

    /// Seconds to stay connected before hanging up
    #[arg(long, default_value_t = 2)]
    hold_secs: u64,
}

fn print_events(label: &'static str, mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::DurationTick { .. }) => {}
                Ok(event) => println!("[{label}] {event:?}"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("[{label}] ... {n} events skipped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_connected(events: &mut broadcast::Receiver<SessionEvent>) -> Result<()> {
    let connected = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ConnectionChanged { connected: true }) => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(SessionError::Closed),
            }
        }
    };
    timeout(Duration::from_secs(10), connected)
        .await
        .map_err(|_| SessionError::NegotiationTimeout(10))?
}

fn frame(i: usize) -> SkeletonUpdate {
    let t = i as f32 / 30.0;
    SkeletonUpdate {
        poses: vec![Pose {
            landmarks: vec![
                Landmark {
                    x: 0.5,
                    y: 0.2,
                    z: 0.0,
                    visibility: Some(0.99),
                },
                Landmark {
                    x: 0.5 + 0.1 * t.sin(),
                    y: 0.6,
                    z: 0.0,
                    visibility: Some(0.9),
                },
            ],
        }],
        analysis: serde_json::json!({ "frame": i }),
    }
}

fn spawn_side(
    config: &SessionConfig,
    network: &LoopbackNetwork,
    bus: &SignalingBus,
) -> Result<SessionHandle> {
    let deps = SessionDeps {
        devices: Arc::new(SyntheticDevices::new()),
        transports: Arc::new(network.factory()),
        signaling: bus.clone(),
    };
    SessionController::spawn(deps, config.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    let network = LoopbackNetwork::new();
    let bus = SignalingBus::default();
    let clinician = spawn_side(&config, &network, &bus)?;
    let patient = spawn_side(&config, &network, &bus)?;

    print_events("clinician", clinician.subscribe());
    print_events("patient", patient.subscribe());
    let mut clinician_events = clinician.subscribe();
    let mut patient_events = patient.subscribe();
    // sees everything the offerer publishes
    let mut offerer_tap = args.print_token.then(|| bus.subscribe(Role::Answerer));

    patient
        .init(Arc::new(PreviewLog::new()), Role::Answerer)
        .await?;
    clinician
        .init(Arc::new(PreviewLog::new()), Role::Offerer)
        .await?;
    clinician.start_call().await?;

    wait_connected(&mut clinician_events).await?;
    wait_connected(&mut patient_events).await?;
    info!("both sides connected");

    if let Some(tap) = offerer_tap.as_mut() {
        let envelopes: Vec<_> = std::iter::from_fn(|| tap.try_recv()).collect();
        let encoded = token::encode(&envelopes)?;
        let restored = token::decode(&encoded)?;
        println!(
            "[clinician] signaling token ({} envelopes, {} chars):\n{encoded}",
            restored.len(),
            encoded.len()
        );
    }

    for i in 1..=args.messages {
        clinician.send_chat(format!("clinician message {i}")).await?;
        patient.send_chat(format!("patient message {i}")).await?;
    }
    patient.send_reaction("👋").await?;
    clinician.toggle_audio(false).await?;
    clinician.toggle_audio(true).await?;

    let skeleton = clinician.skeleton();
    for i in 0..args.skeleton_frames {
        patient.send_skeleton(frame(i)).await?;
        tokio::time::sleep(Duration::from_millis(33)).await;
    }
    if let Some(latest) = skeleton.borrow().as_ref() {
        println!(
            "[clinician] latest skeleton: {} pose(s), analysis {}",
            latest.update.poses.len(),
            latest.update.analysis
        );
    }

    if args.share_screen {
        clinician.start_screen_share().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        clinician.stop_screen_share().await?;
    }

    clinician.send_alert("Session ending soon").await?;
    tokio::time::sleep(Duration::from_secs(args.hold_secs)).await;

    let duration = clinician.end_call().await?;
    patient.end_call().await?;
    println!("call lasted {duration}s");
    // let the printers drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
