//! Admin chat commands: `/start`, `/status`, `/scan`, `/history <id>`.
//!
//! Parsing and permission checks live here; all real work is delegated to
//! [`WatchContext`]. Every outcome, including errors, becomes reply text.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::WatchContext;
use crate::logging;
use crate::profile::MemberId;
use crate::registry::RegisterOutcome;
use crate::scanner::ScanReport;
use crate::scheduler::TriggerError;
use crate::storage::StorageError;

pub const HISTORY_LIMIT: usize = 10;

/// An incoming chat message that may carry a command.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandRequest {
    pub sender_id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
    Scan,
    History(MemberId),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("this command can only be used in groups")]
    GroupOnly,
    #[error("only the admin can use this command")]
    NotAdmin,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl Command {
    /// Parse `/name[@bot] [args]`.
    pub fn parse(text: &str) -> Result<Command, CommandError> {
        let mut parts = text.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let name = head
            .strip_prefix('/')
            .ok_or_else(|| CommandError::Unknown(head.to_string()))?;
        let name = name.split('@').next().unwrap_or_default();
        match name {
            "start" => Ok(Command::Start),
            "status" => Ok(Command::Status),
            "scan" => Ok(Command::Scan),
            "history" => parts
                .next()
                .and_then(|id| id.parse().ok())
                .map(Command::History)
                .ok_or(CommandError::Usage("/history <member_id>")),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Run the command in `request` and return the reply text.
pub async fn dispatch(ctx: &WatchContext, request: &CommandRequest) -> String {
    let result = match Command::parse(&request.text) {
        Ok(command) => {
            info!(
                sender = request.sender_id,
                chat = request.chat_id,
                ?command,
                "commands: received"
            );
            execute(ctx, request, command).await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(reply) => reply,
        Err(CommandError::GroupOnly) => "❌ This command can only be used in groups.".to_string(),
        Err(CommandError::NotAdmin) => "⛔ Only the admin can use this command".to_string(),
        Err(CommandError::Usage(usage)) => format!("Usage: {usage}"),
        Err(CommandError::Unknown(name)) => {
            format!("Unknown command '{name}'. Available: /start, /status, /scan, /history <id>")
        }
        Err(CommandError::Storage(e)) => {
            warn!(error = %e, "commands: storage failure");
            "❌ An unexpected error occurred. Please try again.".to_string()
        }
    }
}

async fn execute(
    ctx: &WatchContext,
    request: &CommandRequest,
    command: Command,
) -> Result<String, CommandError> {
    match command {
        Command::Start => start(ctx, request).await,
        Command::Status => status(ctx).await,
        Command::Scan => {
            if !ctx.is_admin(request.sender_id) {
                return Err(CommandError::NotAdmin);
            }
            Ok(scan_reply(ctx.trigger_scan().await)?)
        }
        Command::History(member_id) => {
            if !ctx.is_admin(request.sender_id) {
                return Err(CommandError::NotAdmin);
            }
            history(ctx, member_id).await
        }
    }
}

async fn start(ctx: &WatchContext, request: &CommandRequest) -> Result<String, CommandError> {
    if !request.is_group {
        return Err(CommandError::GroupOnly);
    }
    let group_id = request.chat_id;
    let title = request
        .chat_title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Group {group_id}"));
    let (outcome, scan) = ctx.start_group(group_id, &title).await?;
    info!(group = %logging::group(group_id), ?outcome, "commands: /start");

    let mut lines = vec![
        match outcome {
            RegisterOutcome::AlreadyActive => "✅ Name tracking is already active!".to_string(),
            RegisterOutcome::Registered | RegisterOutcome::Reactivated => {
                "✅ Name tracking activated!".to_string()
            }
        },
        format!("Group: {title}"),
        format!("ID: {group_id}"),
    ];
    match scan {
        Ok(report) => {
            lines.push(format!("Added {} users to tracking.", report.new_members));
            if let Some(err) = report.errors.iter().find(|e| e.group.group_id == group_id) {
                lines.push(format!("⚠️ Could not load members yet: {}", err.error));
            }
        }
        Err(TriggerError::AlreadyScanning) => {
            lines.push("A scan is already running; members will be loaded shortly.".to_string())
        }
        Err(TriggerError::ShuttingDown) => {
            lines.push("Shutting down; members will be loaded after restart.".to_string())
        }
        Err(TriggerError::Storage(e)) => return Err(e.into()),
    }
    lines.push(String::new());
    lines.push("I'll report name changes to the admin.".to_string());
    Ok(lines.join("\n"))
}

async fn status(ctx: &WatchContext) -> Result<String, CommandError> {
    let status = ctx.get_status().await?;
    let mut lines = vec![
        "📊 Status".to_string(),
        format!("👤 Users: {}", status.members_tracked),
        format!("👥 Groups: {}", status.active_groups.len()),
        String::new(),
        "🎯 Monitored:".to_string(),
    ];
    if status.active_groups.is_empty() {
        lines.push("No groups monitored".to_string());
    } else {
        lines.extend(status.active_groups.iter().map(|g| format!("• {}", g.title)));
    }
    lines.push(String::new());
    lines.push(match status.last_scan_time {
        Some(secs) => format!("🕑 Last scan: {} UTC", logging::format_timestamp(secs)),
        None => "🕑 Last scan: never".to_string(),
    });
    lines.push(format!("⏱️ Scan interval: {}m", (status.scan_interval_secs / 60).max(1)));
    if status.queued_notifications > 0 {
        lines.push(format!(
            "📨 Notifications waiting: {}",
            status.queued_notifications
        ));
    }
    Ok(lines.join("\n"))
}

fn scan_reply(result: Result<ScanReport, TriggerError>) -> Result<String, StorageError> {
    match result {
        Ok(report) => {
            let mut reply = format!(
                "✅ Manual scan completed!\nGroups scanned: {}\nChanges found: {}\nNew members: {}",
                report.groups_scanned,
                report.events.len(),
                report.new_members
            );
            if !report.errors.is_empty() {
                let failed: Vec<String> = report.errors.iter().map(|e| e.group.title.clone()).collect();
                reply.push_str(&format!("\n⚠️ Failed: {}", failed.join(", ")));
            }
            Ok(reply)
        }
        Err(TriggerError::AlreadyScanning) => Ok("⏳ scan already in progress".to_string()),
        Err(TriggerError::ShuttingDown) => Ok("🛑 Shutting down, scan not started".to_string()),
        Err(TriggerError::Storage(e)) => Err(e),
    }
}

async fn history(ctx: &WatchContext, member_id: MemberId) -> Result<String, CommandError> {
    let records = ctx.recent_history(member_id, HISTORY_LIMIT).await?;
    if records.is_empty() {
        return Ok(format!("No recorded changes for user `{member_id}`"));
    }
    let mut lines = vec![format!("📜 Latest changes for user `{member_id}`")];
    for record in records {
        lines.push(format!(
            "{} {}: {} → {}",
            logging::format_timestamp(record.detected_at),
            record.field.label(),
            record.old_value.as_deref().unwrap_or("(none)"),
            record.new_value.as_deref().unwrap_or("(none)"),
        ));
    }
    Ok(lines.join("\n"))
}
