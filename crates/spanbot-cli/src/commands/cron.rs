//! `spanbot cron` -- manage scheduled jobs.
//!
//! Operates directly on the JSON store shared with the running gateway's
//! scheduler; the gateway's 5-second store watcher picks up edits made
//! here. `run` works by pulling the job's next run time to now, which
//! the watcher turns into an immediate firing.
//!
//! # Examples
//!
//! ```text
//! spanbot cron list
//! spanbot cron add --name report --message "Daily report" --cron "0 9 * * *"
//! spanbot cron add --name ping --message "ping" --at-in 120 --deliver --channel telegram --to 42
//! spanbot cron remove job-1a2b3c4d
//! spanbot cron enable job-1a2b3c4d
//! spanbot cron run job-1a2b3c4d
//! ```

use anyhow::bail;
use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};

use spanbot_services::cron::schedule::{compute_next_run, validate_schedule};
use spanbot_services::cron::storage::{load_sync, save_sync};
use spanbot_services::cron::generate_job_id;
use spanbot_types::cron::{CronJob, CronPayload, CronSchedule, CronStore, JobStatus};

use super::cron_store_path;

/// Cron subcommands.
#[derive(Subcommand)]
pub enum CronAction {
    /// List all jobs.
    List,
    /// Add a job.
    Add(AddArgs),
    /// Remove a job by id.
    Remove { id: String },
    /// Enable a job.
    Enable { id: String },
    /// Disable a job.
    Disable { id: String },
    /// Fire a job as soon as the gateway notices (within ~5 s).
    Run { id: String },
}

/// Arguments for `cron add`.
#[derive(Args)]
pub struct AddArgs {
    /// Job name.
    #[arg(long)]
    name: String,

    /// Message delivered to the agent when the job fires.
    #[arg(long)]
    message: String,

    /// Interval schedule in seconds.
    #[arg(long, conflicts_with_all = ["at_in", "cron"])]
    every: Option<i64>,

    /// One-shot schedule: fire this many seconds from now.
    #[arg(long, conflicts_with_all = ["every", "cron"])]
    at_in: Option<i64>,

    /// Cron expression schedule (e.g. "0 9 * * *").
    #[arg(long, conflicts_with_all = ["every", "at_in"])]
    cron: Option<String>,

    /// Timezone for the cron expression.
    #[arg(long, requires = "cron")]
    tz: Option<String>,

    /// Deliver the agent's response to a channel.
    #[arg(long, requires_all = ["channel", "to"])]
    deliver: bool,

    /// Delivery channel name.
    #[arg(long)]
    channel: Option<String>,

    /// Delivery chat id.
    #[arg(long)]
    to: Option<String>,

    /// Remove the job after its next run.
    #[arg(long)]
    delete_after_run: bool,
}

/// Dispatch a cron action.
pub fn run(action: CronAction) -> anyhow::Result<()> {
    let path = cron_store_path();
    match action {
        CronAction::List => {
            let store = load_sync(&path)?;
            print_jobs(&store.jobs);
            Ok(())
        }
        CronAction::Add(args) => add(args),
        CronAction::Remove { id } => {
            let mut store = load_sync(&path)?;
            let before = store.jobs.len();
            store.jobs.retain(|j| j.id != id);
            if store.jobs.len() == before {
                bail!("job not found: {id}");
            }
            save_sync(&path, &store)?;
            println!("removed {id}");
            Ok(())
        }
        CronAction::Enable { id } => set_enabled(&id, true),
        CronAction::Disable { id } => set_enabled(&id, false),
        CronAction::Run { id } => {
            let mut store = load_sync(&path)?;
            let now = Utc::now().timestamp_millis();
            let Some(job) = store.jobs.iter_mut().find(|j| j.id == id) else {
                bail!("job not found: {id}");
            };
            job.state.next_run_at_ms = Some(now);
            job.updated_at_ms = now;
            save_sync(&path, &store)?;
            println!("scheduled {id} to fire now; the gateway will pick it up within ~5s");
            Ok(())
        }
    }
}

fn add(args: AddArgs) -> anyhow::Result<()> {
    let now = Utc::now().timestamp_millis();
    let schedule = if let Some(secs) = args.every {
        CronSchedule::every(secs * 1000)
    } else if let Some(secs) = args.at_in {
        CronSchedule::at(now + secs * 1000)
    } else if let Some(expr) = args.cron {
        CronSchedule::cron(expr, args.tz)
    } else {
        bail!("one of --every, --at-in, or --cron is required");
    };

    let mut job = CronJob {
        id: generate_job_id(),
        name: args.name,
        enabled: true,
        schedule,
        payload: CronPayload {
            message: args.message,
            deliver: args.deliver,
            channel: args.channel,
            to: args.to,
            ..Default::default()
        },
        state: Default::default(),
        created_at_ms: now,
        updated_at_ms: now,
        delete_after_run: args.delete_after_run,
    };

    validate_schedule(&job).map_err(|e| anyhow::anyhow!("{e}"))?;
    job.state.next_run_at_ms = compute_next_run(&job, now);

    let path = cron_store_path();
    let mut store = load_sync(&path)?;
    if store.jobs.iter().any(|j| j.name == job.name) {
        bail!("a job named '{}' already exists", job.name);
    }
    let (id, name) = (job.id.clone(), job.name.clone());
    store.jobs.push(job);
    save_sync(&path, &store)?;
    println!("added {id} ({name})");
    Ok(())
}

fn set_enabled(id: &str, enabled: bool) -> anyhow::Result<()> {
    let path = cron_store_path();
    let mut store = load_sync(&path)?;
    let now = Utc::now().timestamp_millis();

    let Some(job) = store.jobs.iter_mut().find(|j| j.id == id) else {
        bail!("job not found: {id}");
    };
    job.enabled = enabled;
    job.updated_at_ms = now;
    if enabled {
        job.state.next_run_at_ms = compute_next_run(job, now);
    }
    save_sync(&path, &store)?;
    println!("{} {id}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn print_jobs(jobs: &[CronJob]) {
    if jobs.is_empty() {
        println!("no cron jobs");
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["ID", "Name", "Enabled", "Schedule", "Next run", "Last status"]);

    for job in jobs {
        table.add_row([
            job.id.clone(),
            job.name.clone(),
            job.enabled.to_string(),
            describe_schedule(&job.schedule),
            format_ts(job.state.next_run_at_ms),
            match job.state.last_status {
                Some(JobStatus::Ok) => "ok".into(),
                Some(JobStatus::Error) => format!(
                    "error: {}",
                    job.state.last_error.as_deref().unwrap_or("?")
                ),
                Some(JobStatus::Skipped) => "skipped".into(),
                None => "-".into(),
            },
        ]);
    }
    println!("{table}");
}

fn describe_schedule(schedule: &CronSchedule) -> String {
    use spanbot_types::cron::ScheduleKind;
    match schedule.kind {
        ScheduleKind::Every => format!(
            "every {}s",
            schedule.every_ms.unwrap_or(0) / 1000
        ),
        ScheduleKind::At => format!("at {}", format_ts(schedule.at_ms)),
        ScheduleKind::Cron => format!(
            "cron {}{}",
            schedule.expr.as_deref().unwrap_or("?"),
            schedule
                .tz
                .as_deref()
                .map(|tz| format!(" ({tz})"))
                .unwrap_or_default()
        ),
    }
}

fn format_ts(ms: Option<i64>) -> String {
    match ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".into(),
    }
}
