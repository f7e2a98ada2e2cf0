//! Command-line surface over cardfile-core.
//!
//! The binary stays thin: parse arguments, load configuration, open the
//! vault, call one core operation, print the result. `watch` is the long
//! running mode; it runs the backup scheduler until the process receives a
//! shutdown signal, which it maps onto a synchronous critical checkpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::TimeZone;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};

use cardfile_core::archive::{self, ImportOptions};
use cardfile_core::config::VaultConfig;
use cardfile_core::diff::DatasetDiff;
use cardfile_core::engine::{ConsistencyOutcome, Vault};
use cardfile_core::events::VaultEvent;
use cardfile_core::logging::{LogError, init_logging};
use cardfile_core::model::{Contact, ContactDraft, ContactId, ContactPatch, GroupId};
use cardfile_core::roster::RosterFilter;
use cardfile_core::scheduler::{self, RemoteSink, SyncFuture};
use cardfile_core::search;
use cardfile_core::snapshot::{CheckpointTrigger, Snapshot};

#[derive(Debug, Parser)]
#[command(name = "cf", version, about = "Local-first contact vault")]
pub struct Cli {
    /// Config file path (defaults to the conventional location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory from the config.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a contact.
    Add {
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// List contacts, optionally filtered.
    List {
        #[arg(long)]
        favorites: bool,
        #[arg(long)]
        blocked: bool,
        /// Restrict to one group, by label or id.
        #[arg(long)]
        group: Option<String>,
        /// Substring filter over name, email, and phone.
        #[arg(long)]
        query: Option<String>,
    },
    /// Search contacts, with optional typo tolerance.
    Search {
        query: String,
        /// Maximum edit distance for fuzzy matches (0 = exact substring).
        #[arg(long, default_value_t = 0)]
        fuzzy: usize,
    },
    /// Update fields of a contact.
    Update {
        /// Contact id, id prefix, or exact name.
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        clear_email: bool,
        #[arg(long)]
        clear_phone: bool,
    },
    /// Delete a contact.
    Rm { id: String },
    /// Toggle the favorite flag.
    Fav { id: String },
    /// Toggle the blocked flag.
    Block { id: String },
    /// Manage groups.
    #[command(subcommand)]
    Group(GroupCommand),
    /// Force an immediate full backup plus a critical checkpoint.
    Backup,
    /// Run an integrity check, recovering if the replicas diverged.
    Check,
    /// Export the dataset as a checksummed archive.
    Export { path: PathBuf },
    /// Import a checksummed archive, replacing the dataset.
    Import {
        path: PathBuf,
        /// Verify and report without importing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show vault state and storage usage.
    Status {
        /// Also diff the live dataset against an archive.
        #[arg(long)]
        against: Option<PathBuf>,
    },
    /// Run the backup scheduler until interrupted.
    Watch {
        /// Best-effort remote sync endpoint for full backups.
        #[arg(long)]
        remote: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum GroupCommand {
    /// Create a group.
    Add { label: String },
    /// Delete a group, keeping its former members.
    Rm { group: String },
    /// Add a contact to a group.
    Assign { id: String, group: String },
    /// Remove a contact from a group.
    Unassign { id: String, group: String },
    /// List the members of a group.
    Members { group: String },
    /// List all groups.
    List,
}

pub async fn run(args: Cli) -> anyhow::Result<()> {
    let mut config = VaultConfig::load_or_default(args.config.as_deref())?;
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    match init_logging(&config.log) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(e) => return Err(e.into()),
    }

    let vault = Vault::open(config)?;
    vault.hydrate();

    match args.command {
        Command::Add { name, email, phone } => {
            let mut draft = ContactDraft::new(name);
            draft.email = email;
            draft.phone = phone;
            let contact = vault.add_contact(draft)?;
            flush(&vault)?;
            emit(args.json, &contact, |c| {
                println!("added {} ({})", c.name, c.id);
            });
        }
        Command::List {
            favorites,
            blocked,
            group,
            query,
        } => {
            let filter = RosterFilter {
                favorite: favorites.then_some(true),
                blocked: blocked.then_some(true),
                group: group.map(|g| resolve_group(&vault, &g)).transpose()?,
                query,
            };
            let contacts = vault.contacts(Some(&filter));
            emit(args.json, &contacts, |contacts| {
                for contact in contacts {
                    print_contact(contact);
                }
                println!("{} contact(s)", contacts.len());
            });
        }
        Command::Search { query, fuzzy } => {
            let hits = search::rank(&vault.contacts(None), &query, fuzzy);
            emit(args.json, &hits, |hits| {
                for hit in hits {
                    print_contact(&hit.contact);
                }
                println!("{} match(es)", hits.len());
            });
        }
        Command::Update {
            id,
            name,
            email,
            phone,
            clear_email,
            clear_phone,
        } => {
            let id = resolve_contact(&vault, &id)?;
            let patch = ContactPatch {
                name,
                email,
                phone,
                clear_email,
                clear_phone,
                ..ContactPatch::default()
            };
            let contact = vault.update_contact(id, &patch)?;
            flush(&vault)?;
            emit(args.json, &contact, |c| {
                println!("updated {} ({})", c.name, c.id);
            });
        }
        Command::Rm { id } => {
            let id = resolve_contact(&vault, &id)?;
            vault.delete_contact(id)?;
            flush(&vault)?;
            println!("deleted {id}");
        }
        Command::Fav { id } => {
            let id = resolve_contact(&vault, &id)?;
            let contact = vault.toggle_favorite(id)?;
            flush(&vault)?;
            println!(
                "{} is {}a favorite",
                contact.name,
                if contact.favorite { "" } else { "no longer " }
            );
        }
        Command::Block { id } => {
            let id = resolve_contact(&vault, &id)?;
            let contact = vault.toggle_block(id)?;
            flush(&vault)?;
            println!(
                "{} is {}blocked",
                contact.name,
                if contact.blocked { "" } else { "no longer " }
            );
        }
        Command::Group(cmd) => run_group(&vault, cmd, args.json)?,
        Command::Backup => {
            let receipt = vault.manual_backup().await?;
            emit(args.json, &receipt, |r| {
                println!("backed up {} record(s) to {}", r.record_count, r.key);
            });
        }
        Command::Check => {
            let outcome = vault.check_and_recover().await?;
            match outcome {
                ConsistencyOutcome::Consistent(report) => {
                    println!(
                        "consistent: {} source(s), spread {}",
                        report.observed.len(),
                        report.spread()
                    );
                }
                ConsistencyOutcome::Recovered { recovery, .. } => {
                    println!(
                        "recovered {} record(s) from {} (score {:.0})",
                        recovery.record_count, recovery.source, recovery.score
                    );
                }
                ConsistencyOutcome::Exhausted(_) => {
                    bail!(
                        "replica counts diverged and no recoverable dataset was found; \
                         your data may be at risk"
                    );
                }
            }
        }
        Command::Export { path } => {
            let receipt = archive::export_archive(&vault, &path)?;
            emit(args.json, &receipt, |r| {
                println!(
                    "exported {} record(s), {} group(s) to {}",
                    r.manifest.record_count,
                    r.manifest.group_count,
                    r.path.display()
                );
            });
        }
        Command::Import { path, dry_run } => {
            let receipt = archive::import_archive(&vault, &path, ImportOptions { dry_run }).await?;
            emit(args.json, &receipt, |r| {
                let verb = if r.dry_run { "would import" } else { "imported" };
                println!(
                    "{verb} {} record(s), {} group(s) (+{} ~{} -{})",
                    r.record_count, r.group_count, r.diff.added, r.diff.modified, r.diff.deleted
                );
            });
        }
        Command::Status { against } => {
            let status = vault.status().await?;
            emit(args.json, &status, |s| {
                println!("state:     {}", s.state);
                println!("records:   {} ({} group(s))", s.record_count, s.group_count);
                println!("dirty:     {}", s.dirty);
                println!(
                    "kv usage:  {} / {} bytes",
                    s.kv_payload_bytes, s.kv_quota_bytes
                );
                println!("snapshots: {}", s.stored_snapshots);
                if let Some(marker) = &s.last_checkpoint {
                    println!(
                        "last checkpoint: {} ({})",
                        format_time(marker.last_saved_at_ms),
                        marker.trigger
                    );
                }
            });
            if let Some(path) = against {
                let other = archive::read_archive(&path)?;
                let (current, _) = vault.dataset();
                let summary = DatasetDiff::compute(&current, &other.snapshot.contacts).summary();
                println!(
                    "vs {}: +{} ~{} -{}",
                    path.display(),
                    summary.added,
                    summary.modified,
                    summary.deleted
                );
            }
        }
        Command::Watch { remote } => run_watch(vault, remote).await?,
    }
    Ok(())
}

fn run_group(vault: &Vault, cmd: GroupCommand, json: bool) -> anyhow::Result<()> {
    match cmd {
        GroupCommand::Add { label } => {
            let group = vault.add_group(&label)?;
            flush(vault)?;
            println!("added group {} ({})", group.label, group.id);
        }
        GroupCommand::Rm { group } => {
            let id = resolve_group(vault, &group)?;
            vault.remove_group(id)?;
            flush(vault)?;
            println!("removed group {id}");
        }
        GroupCommand::Assign { id, group } => {
            let contact = resolve_contact(vault, &id)?;
            let group = resolve_group(vault, &group)?;
            let updated = vault.assign_group(contact, group)?;
            flush(vault)?;
            println!("{} now has {} group(s)", updated.name, updated.groups.len());
        }
        GroupCommand::Unassign { id, group } => {
            let contact = resolve_contact(vault, &id)?;
            let group = resolve_group(vault, &group)?;
            let updated = vault.unassign_group(contact, group)?;
            flush(vault)?;
            println!("{} now has {} group(s)", updated.name, updated.groups.len());
        }
        GroupCommand::Members { group } => {
            let id = resolve_group(vault, &group)?;
            let members = vault.group_members(id);
            emit(json, &members, |members| {
                for member in members {
                    print_contact(member);
                }
                println!("{} member(s)", members.len());
            });
        }
        GroupCommand::List => {
            let groups = vault.groups();
            emit(json, &groups, |groups| {
                for group in groups {
                    println!(
                        "{}  {} ({} member(s))",
                        group.id,
                        group.label,
                        vault.group_members(group.id).len()
                    );
                }
            });
        }
    }
    Ok(())
}

/// Run the scheduler until a shutdown signal, then checkpoint and stop.
async fn run_watch(vault: Vault, remote: Option<String>) -> anyhow::Result<()> {
    let vault = Arc::new(vault);

    // Startup consistency pass before any timer can write.
    match vault.check_and_recover().await? {
        ConsistencyOutcome::Exhausted(_) => {
            warn!("replicas diverged and nothing was recoverable; continuing with what is loaded");
        }
        outcome => info!(consistent = matches!(outcome, ConsistencyOutcome::Consistent(_)), "startup check done"),
    }

    let mut events = vault.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                VaultEvent::RecoveryIssue { detail, .. } => warn!(detail = %detail, "recovery issue"),
                VaultEvent::Recovered { source, record_count, .. } => {
                    info!(source = %source, records = record_count, "dataset recovered");
                }
                _ => {}
            }
        }
    });

    let sink: Option<Arc<dyn RemoteSink>> = match remote {
        Some(url) => Some(Arc::new(HttpSink::new(url)?)),
        None => None,
    };
    let handle = scheduler::start(Arc::clone(&vault), sink);

    wait_for_shutdown().await;
    info!("shutdown signal received");

    // Synchronous path first: it must land even if the runtime is torn
    // down before the scheduler finishes joining.
    if let Err(e) = vault.critical_checkpoint(CheckpointTrigger::Terminating) {
        warn!(error = %e, "shutdown checkpoint failed");
    }
    handle.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Best-effort HTTP sink for full snapshots.
///
/// Each push carries the snapshot plus a summary of what changed since
/// the last successful push; the endpoint never has to keep state.
struct HttpSink {
    client: reqwest::Client,
    url: String,
    last_pushed: Mutex<Vec<Contact>>,
}

impl HttpSink {
    fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            last_pushed: Mutex::new(Vec::new()),
        })
    }
}

impl RemoteSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn push<'a>(&'a self, snapshot: &'a Snapshot) -> SyncFuture<'a> {
        Box::pin(async move {
            let diff = {
                let last = self.last_pushed.lock();
                DatasetDiff::compute(&last, &snapshot.contacts).summary()
            };
            let body = serde_json::json!({ "snapshot": snapshot, "diff": diff });
            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("remote returned {}", response.status()));
            }
            *self.last_pushed.lock() = snapshot.contacts.clone();
            Ok(())
        })
    }
}

/// One-shot commands return to the shell as soon as they print, so a
/// mutation only counts once a checkpoint has landed on disk.
fn flush(vault: &Vault) -> anyhow::Result<()> {
    vault.critical_checkpoint(CheckpointTrigger::Terminating)?;
    Ok(())
}

/// Accept a full id, an unambiguous id prefix, or an exact name.
fn resolve_contact(vault: &Vault, text: &str) -> anyhow::Result<ContactId> {
    if let Ok(id) = text.parse::<ContactId>() {
        return Ok(id);
    }
    let contacts = vault.contacts(None);
    let matches: Vec<&Contact> = contacts
        .iter()
        .filter(|c| c.id.to_string().starts_with(text) || c.name.eq_ignore_ascii_case(text))
        .collect();
    match matches.as_slice() {
        [one] => Ok(one.id),
        [] => bail!("no contact matches {text:?}"),
        many => bail!("{text:?} is ambiguous ({} matches)", many.len()),
    }
}

/// Accept a group id or an exact label.
fn resolve_group(vault: &Vault, text: &str) -> anyhow::Result<GroupId> {
    if let Ok(id) = text.parse::<GroupId>() {
        return Ok(id);
    }
    let groups = vault.groups();
    let matches: Vec<&GroupId> = groups
        .iter()
        .filter(|g| g.label.eq_ignore_ascii_case(text))
        .map(|g| &g.id)
        .collect();
    match matches.as_slice() {
        [one] => Ok(**one),
        [] => bail!("no group matches {text:?}"),
        many => bail!("{text:?} is ambiguous ({} matches)", many.len()),
    }
}

fn format_time(ts_ms: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .map_or_else(|| ts_ms.to_string(), |dt| dt.to_rfc3339())
}

fn print_contact(contact: &Contact) {
    let mut flags = String::new();
    if contact.favorite {
        flags.push('*');
    }
    if contact.blocked {
        flags.push('!');
    }
    println!(
        "{}  {}{}  {}  {}",
        contact.id,
        contact.name,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" [{flags}]")
        },
        contact.email.as_deref().unwrap_or("-"),
        contact.phone.as_deref().unwrap_or("-"),
    );
}

fn emit<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(out) => println!("{out}"),
            Err(e) => warn!(error = %e, "failed to serialize output"),
        }
    } else {
        text(value);
    }
}
