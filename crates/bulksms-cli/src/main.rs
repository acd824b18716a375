//! Campaign dispatcher CLI
//!
//! Imports a campaign JSON file into the dispatch store and runs it against
//! the console transport, printing progress as it goes. Ctrl-C pauses the
//! campaign; `bulksms resume` picks it back up from its checkpoint.

mod cli;
mod transport;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use bulksms_core::config::DispatchConfig;
use bulksms_core::events::DispatchEvent;
use bulksms_core::session::{CampaignSession, CampaignType, ProcessingStatus};
use bulksms_core::template::{estimate_segments, TemplateRenderer};
use bulksms_core::types::{PhoneNumber, SessionId, Timestamp};
use bulksms_core::Recipient;
use bulksms_runtime::DispatchRuntime;
use bulksms_store::SessionStore;

use crate::cli::{Cli, Command};
use crate::transport::ConsoleTransport;

// ----------------------------------------------------------------------------
// Campaign File
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CampaignFile {
    campaign_name: String,
    #[serde(default = "CampaignFile::default_type")]
    campaign_type: CampaignType,
    template: String,
    #[serde(default)]
    send_speed: Option<u32>,
    #[serde(default)]
    sim_slot: u32,
    recipients: Vec<RecipientEntry>,
}

impl CampaignFile {
    fn default_type() -> CampaignType {
        CampaignType::Transactional
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn into_session(self, file_name: String, default_speed: u32) -> CampaignSession {
        let recipients = self
            .recipients
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Recipient {
                id: i as u64,
                phone: entry.phone,
                name: entry.name,
                amount: entry.amount,
                fields: entry.fields,
            })
            .collect();
        CampaignSession::new(
            file_name,
            self.campaign_name,
            self.campaign_type,
            recipients,
            self.template,
            self.send_speed.unwrap_or(default_speed),
            self.sim_slot,
            Timestamp::now(),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipientEntry {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    fields: HashMap<String, String>,
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);

    let store = Arc::new(SessionStore::open(&args.db)?);

    match args.command {
        Command::Validate { file } => validate(&file),
        Command::Run { file, speed } => {
            let config = DispatchConfig::default();
            let campaign = CampaignFile::load(&file)?;
            let mut session = campaign.into_session(
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                config.send_speed_per_hour,
            );
            if let Some(speed) = speed {
                session.send_speed = speed;
            }
            store.save(&session)?;
            println!(
                "campaign {} imported: {} recipients, session {}",
                session.campaign_name,
                session.recipients.len(),
                session.session_id
            );

            let runtime = DispatchRuntime::new(store, Arc::new(ConsoleTransport::new()), config)?;
            runtime.start(session.session_id)?;
            watch(&runtime, session.session_id).await;
            runtime.shutdown().await;
            Ok(())
        }
        Command::Resume => {
            let Some(session) = store.load_active()? else {
                bail!("no active session to resume");
            };
            println!(
                "resuming {} at recipient {}/{}",
                session.session_id,
                session.last_processed_index,
                session.recipients.len()
            );
            let runtime = DispatchRuntime::new(
                store,
                Arc::new(ConsoleTransport::new()),
                DispatchConfig::default(),
            )?;
            runtime.resume(session.session_id)?;
            watch(&runtime, session.session_id).await;
            runtime.shutdown().await;
            Ok(())
        }
        Command::Optout { phone, reason } => {
            let normalized = PhoneNumber::parse(&phone)?;
            let runtime = DispatchRuntime::new(
                store,
                Arc::new(ConsoleTransport::new()),
                DispatchConfig::default(),
            )?;
            runtime.add_opt_out(normalized.as_str(), &reason)?;
            println!("opt-out recorded for {normalized}");
            runtime.shutdown().await;
            Ok(())
        }
        Command::ClearExhausted => {
            let runtime = DispatchRuntime::new(
                store,
                Arc::new(ConsoleTransport::new()),
                DispatchConfig::default(),
            )?;
            let removed = runtime.clear_exhausted()?;
            println!("{removed} exhausted message(s) removed");
            runtime.shutdown().await;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Dry-run checks on a campaign file
fn validate(path: &Path) -> anyhow::Result<()> {
    let campaign = CampaignFile::load(path)?;
    TemplateRenderer::validate(&campaign.template)?;

    let mut valid = 0usize;
    let mut invalid = 0usize;
    for entry in &campaign.recipients {
        match PhoneNumber::parse(&entry.phone) {
            Ok(_) => valid += 1,
            Err(err) => {
                invalid += 1;
                warn!(phone = %entry.phone, %err, "invalid recipient");
            }
        }
    }

    // segment estimate against the raw template as a rough upper bound
    let estimate = estimate_segments(&campaign.template);
    println!(
        "{}: template ok ({:?}, ~{} segment(s)); {} valid recipient(s), {} invalid",
        campaign.campaign_name, estimate.encoding, estimate.segments, valid, invalid
    );
    if invalid > 0 {
        bail!("{invalid} recipient(s) would be skipped as invalid");
    }
    Ok(())
}

/// Follow one session's event stream until it parks or finishes
async fn watch(runtime: &DispatchRuntime, session_id: SessionId) {
    let mut events = runtime.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DispatchEvent::Progress(p)) if p.session_id == session_id => {
                    println!(
                        "progress {}/{} ({:.1}%)  sent {}  failed {}  skipped {}",
                        p.processed, p.total, p.percent, p.sent, p.failed, p.skipped
                    );
                }
                Ok(DispatchEvent::Statistics(stats)) => {
                    if stats.delivered + stats.delivered_assumed > 0 {
                        println!(
                            "delivery {} confirmed, {} assumed, rate {:.0}%",
                            stats.delivered,
                            stats.delivered_assumed,
                            stats.delivery_rate * 100.0
                        );
                    }
                }
                Ok(DispatchEvent::MissingVariable { variable, .. }) => {
                    eprintln!("warning: template variable {{{{{variable}}}}} has no value");
                }
                Ok(DispatchEvent::Error { code, message, .. }) => {
                    eprintln!("error [{code}]: {message}");
                }
                Ok(DispatchEvent::SessionStateChanged { session_id: id, new_status, .. })
                    if id == session_id =>
                {
                    println!("session is now {new_status}");
                    if new_status.is_terminal() || new_status == ProcessingStatus::Paused {
                        return;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("pausing; run `bulksms resume` to continue");
                if let Err(err) = runtime.pause(session_id) {
                    eprintln!("pause failed: {err}");
                    return;
                }
            }
        }
    }
}
