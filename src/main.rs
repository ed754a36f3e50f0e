use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use callsignal::calls::Phase;
use callsignal::provisioning::LocalRoomProvisioner;
use callsignal::store::{BlocklistStore, FileStore};
use callsignal::transport::MemoryHub;
use callsignal::{
    CallManager, LocalIdentity, MediaType, Notification, ParticipantRole, SignalingConfig,
};

// Runs two in-process peers over an in-memory transport and plays one call.
//
// Usage:
//   cargo run -- call                              # Audio call, callee answers
//   cargo run -- call --video --answer decline     # Callee declines
//   cargo run -- call --answer ignore              # Ring out to no_answer
//   cargo run -- block mallory --hours 24          # Temporary block for the callee
//   cargo run -- list

#[derive(Parser)]
#[command(name = "callsignal-demo")]
#[command(about = "Plays a call between two in-process peers")]
struct Cli {
    /// JSON file with signaling settings; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Answer {
    Accept,
    Decline,
    Ignore,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call from the caller to the callee.
    Call {
        #[arg(long)]
        video: bool,

        #[arg(long, value_enum, default_value = "accept")]
        answer: Answer,

        /// Seconds to stay connected before the caller hangs up.
        #[arg(long, default_value_t = 2)]
        hangup_after: u64,
    },
    /// Block a user for the callee, permanently unless --hours is given.
    Block {
        user: String,
        #[arg(long)]
        hours: Option<u32>,
    },
    Unblock {
        user: String,
    },
    /// Show the callee's blocklist.
    List,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = match &cli.config {
        Some(path) => SignalingConfig::load(path)?,
        None => SignalingConfig::default(),
    };

    // The blocklist belongs to the callee, who screens incoming calls.
    let backend = Arc::new(FileStore::new(config.storage_dir.join(&cli.callee)).await?);
    let blocklist = Arc::new(BlocklistStore::load(backend).await?);

    match cli.command {
        Commands::Block { user, hours } => {
            match hours {
                Some(hours) => {
                    let expiry = blocklist.block_temporary(&user, hours).await?;
                    info!("Blocked {user} until {expiry}");
                }
                None => {
                    blocklist.block_permanent(&user).await?;
                    info!("Blocked {user}");
                }
            }
            Ok(())
        }
        Commands::Unblock { user } => {
            if blocklist.unblock(&user).await? {
                info!("Unblocked {user}");
            } else {
                warn!("{user} was not blocked");
            }
            Ok(())
        }
        Commands::List => {
            for user in blocklist.permanent_blocks().await {
                info!("{user}: permanent");
            }
            for (user, expiry) in blocklist.temporary_blocks().await {
                info!("{user}: until {expiry}");
            }
            Ok(())
        }
        Commands::Call {
            video,
            answer,
            hangup_after,
        } => {
            let media_type = if video { MediaType::Video } else { MediaType::Audio };
            play_call(
                &cli.caller,
                &cli.callee,
                config,
                blocklist,
                media_type,
                answer,
                Duration::from_secs(hangup_after),
            )
            .await
        }
    }
}

async fn play_call(
    caller_id: &str,
    callee_id: &str,
    config: SignalingConfig,
    callee_blocklist: Arc<BlocklistStore>,
    media_type: MediaType,
    answer: Answer,
    hangup_after: Duration,
) -> Result<(), anyhow::Error> {
    let hub = MemoryHub::new();
    let provisioner =
        Arc::new(LocalRoomProvisioner::new().with_latency(Duration::from_millis(200)));
    let sweeper = callee_blocklist.spawn_sweeper(config.blocklist_sweep_interval());

    let (caller_transport, caller_inbound) = hub.connect(caller_id).await;
    let (callee_transport, callee_inbound) = hub.connect(callee_id).await;

    let caller_blocklist = Arc::new(BlocklistStore::load(Arc::new(
        callsignal::store::MemoryStore::new(),
    ))
    .await?);
    let caller = CallManager::spawn(
        LocalIdentity::new(caller_id, ParticipantRole::Host),
        config.clone(),
        Arc::new(caller_transport),
        provisioner.clone(),
        caller_blocklist,
    );
    let callee = CallManager::spawn(
        LocalIdentity::new(callee_id, ParticipantRole::Attendee),
        config,
        Arc::new(callee_transport),
        provisioner,
        callee_blocklist.clone(),
    );
    caller.attach(caller_inbound);
    callee.attach(callee_inbound);

    let mut caller_notes = caller.subscribe();
    let mut callee_notes = callee.subscribe();

    // The callee reacts to its own notifications like a UI would.
    let callee_ui = {
        let callee = Arc::clone(&callee);
        tokio::spawn(async move {
            while let Ok(note) = callee_notes.recv().await {
                log_notification("callee", &note);
                if matches!(note.state.phase, Phase::IncomingAudioCall | Phase::IncomingVideoCall) {
                    let result = match answer {
                        Answer::Accept => callee.accept().await,
                        Answer::Decline => callee.reject("declined").await,
                        Answer::Ignore => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!("Callee could not answer: {e}");
                    }
                }
                if note.state.phase == Phase::Terminated {
                    break;
                }
            }
        })
    };

    caller.start_call(callee_id, media_type, ParticipantRole::Attendee).await?;

    while let Ok(note) = caller_notes.recv().await {
        log_notification("caller", &note);
        match note.state.phase {
            Phase::ConnectedJoined => {
                tokio::time::sleep(hangup_after).await;
                let reason = caller.cancel().await?;
                info!("Caller hung up ({reason})");
            }
            Phase::Terminated => break,
            _ => {}
        }
    }

    // Give the peer a moment to process the final message.
    let _ = tokio::time::timeout(Duration::from_secs(1), callee_ui).await;
    caller.shutdown();
    callee.shutdown();
    callee_blocklist.shutdown();
    let _ = sweeper.await;
    Ok(())
}

fn log_notification(who: &str, note: &Notification) {
    let call_id = note
        .payload
        .call_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();
    match (&note.payload.message, &note.payload.room) {
        (Some(message), _) => info!(
            "[{who}] {} ({}) {call_id}: {message}",
            note.state, note.substate
        ),
        (None, Some(room)) => info!(
            "[{who}] {} ({}) {call_id}: joined {}",
            note.state, note.substate, room.meeting_id
        ),
        (None, None) => info!("[{who}] {} ({}) {call_id}", note.state, note.substate),
    }
}
