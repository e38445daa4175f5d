//! REPL – Read-Eval-Print Loop for the Steward interactive shell.
//!
//! Supported slash-commands:
//!   /help                                – show this list
//!   /status                              – kernel, queue and host summary
//!   /submit <name> [priority] [duration] – run a timed demo task
//!   /tasks                               – list known tasks
//!   /cancel <id>                         – cancel a task (id prefix accepted)
//!   /pause | /resume                     – stop or restart dispatching
//!   /audit                               – recent authorization decisions
//!   /failures                            – failure records
//!   /checkpoints                         – saved entity state
//!   /metrics                             – counters, gauges and histograms
//!   /events [kind]                       – recent journaled events
//!   /quit | /exit                        – shut down and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::json;
use std::time::Duration;

use steward_kernel::{AuditFilter, FailureFilter};
use steward_runtime::{Kernel, TaskContext, executor};
use steward_types::{EntityKind, KernelState, TaskOptions, TaskStatus};

use crate::config::Config;

const DEFAULT_DURATION_MS: u64 = 2_000;
const PROGRESS_STEP: Duration = Duration::from_millis(100);
const LIST_LIMIT: usize = 10;

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Submit {
        name: String,
        priority: Option<u8>,
        duration_ms: u64,
    },
    Tasks,
    Cancel(String),
    Pause,
    Resume,
    Audit,
    Failures,
    Checkpoints,
    Metrics,
    Events(Option<String>),
    Quit,
}

/// Parse one input line.  `Err` carries the message shown to the user.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();
    let command = match head {
        "/help" => Command::Help,
        "/status" => Command::Status,
        "/tasks" => Command::Tasks,
        "/pause" => Command::Pause,
        "/resume" => Command::Resume,
        "/audit" => Command::Audit,
        "/failures" => Command::Failures,
        "/checkpoints" => Command::Checkpoints,
        "/metrics" => Command::Metrics,
        "/events" => match args.as_slice() {
            [] => Command::Events(None),
            [kind] => Command::Events(Some((*kind).to_string())),
            _ => return Err("usage: /events [kind]".to_string()),
        },
        "/quit" | "/exit" => Command::Quit,
        "/cancel" => match args.as_slice() {
            [id] => Command::Cancel((*id).to_string()),
            _ => return Err("usage: /cancel <id>".to_string()),
        },
        "/submit" => {
            let Some(name) = args.first() else {
                return Err("usage: /submit <name> [priority] [duration_ms]".to_string());
            };
            let priority = match args.get(1) {
                Some(p) => Some(
                    p.parse::<u8>()
                        .ok()
                        .filter(|p| (1..=10).contains(p))
                        .ok_or_else(|| format!("priority must be 1-10, got '{p}'"))?,
                ),
                None => None,
            };
            let duration_ms = match args.get(2) {
                Some(d) => d
                    .parse::<u64>()
                    .map_err(|_| format!("duration must be milliseconds, got '{d}'"))?,
                None => DEFAULT_DURATION_MS,
            };
            if args.len() > 3 {
                return Err("usage: /submit <name> [priority] [duration_ms]".to_string());
            }
            Command::Submit {
                name: (*name).to_string(),
                priority,
                duration_ms,
            }
        }
        other => return Err(format!("Unknown command: '{other}'")),
    };
    Ok(command)
}

/// Entry point for the interactive REPL.  Returns when the user quits, hits
/// Ctrl-C / Ctrl-D at the prompt, or the kernel shuts down.
pub fn run(kernel: &Kernel, cfg: &Config) {
    let mut editor = match DefaultEditor::new() {
        Ok(ed) => ed,
        Err(e) => {
            eprintln!("{}: {}", "Line editor unavailable".red(), e);
            return;
        }
    };

    loop {
        if kernel.state() == KernelState::Shutdown {
            break;
        }

        let line = match editor.readline(&format!("{} ", "steward>".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(command) => execute(kernel, cfg, command),
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}

fn execute(kernel: &Kernel, cfg: &Config, command: Command) {
    match command {
        Command::Help => cmd_help(),
        Command::Status => cmd_status(kernel),
        Command::Submit {
            name,
            priority,
            duration_ms,
        } => cmd_submit(kernel, cfg, &name, priority, duration_ms),
        Command::Tasks => cmd_tasks(kernel),
        Command::Cancel(id) => cmd_cancel(kernel, &id),
        Command::Pause => match kernel.pause() {
            Ok(_) => println!("{}", "✓ Dispatching paused.".green()),
            Err(e) => println!("{}: {}", "Cannot pause".red(), e),
        },
        Command::Resume => match kernel.resume() {
            Ok(_) => println!("{}", "✓ Dispatching resumed.".green()),
            Err(e) => println!("{}: {}", "Cannot resume".red(), e),
        },
        Command::Audit => cmd_audit(kernel),
        Command::Failures => cmd_failures(kernel),
        Command::Checkpoints => cmd_checkpoints(kernel),
        Command::Metrics => cmd_metrics(kernel),
        Command::Events(kind) => cmd_events(kernel, kind.as_deref()),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Steward Commands".bold().underline());
    println!("  {}                              – kernel, queue and host summary", "/status".bold().cyan());
    println!("  {} – run a timed demo task", "/submit <name> [priority] [duration_ms]".bold().cyan());
    println!("  {}                               – list known tasks", "/tasks".bold().cyan());
    println!("  {}                         – cancel a task (id prefix accepted)", "/cancel <id>".bold().cyan());
    println!("  {}                     – stop or restart dispatching", "/pause  /resume".bold().cyan());
    println!("  {}                               – recent authorization decisions", "/audit".bold().cyan());
    println!("  {}                            – failure records", "/failures".bold().cyan());
    println!("  {}                         – saved entity state", "/checkpoints".bold().cyan());
    println!("  {}                             – counters, gauges and histograms", "/metrics".bold().cyan());
    println!("  {}                      – recent journaled events", "/events [kind]".bold().cyan());
    println!("  {}                         – shut down and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(kernel: &Kernel) {
    let state = kernel.state();
    let sched = kernel.scheduler_stats();
    let engine = kernel.engine_stats();

    println!("{}", "Kernel Status".bold().underline());
    let state_str = state.to_string();
    let state_col = match state {
        KernelState::Active => state_str.green(),
        KernelState::Paused => state_str.yellow(),
        _ => state_str.red(),
    };
    println!("  State        : {}", state_col);
    println!("  Clock        : tick {}", sched.tick);
    println!(
        "  Queue        : {} queued ({} ready), {} running, {} backing off",
        sched.queued, sched.ready, engine.running, engine.backing_off
    );
    println!(
        "  Concurrency  : {} of {} configured",
        engine.max_concurrency,
        kernel.config().engine.max_concurrency
    );
    println!(
        "  Outcomes     : {} completed, {} failed, {} cancelled",
        sched.completed.to_string().green(),
        sched.failed.to_string().red(),
        sched.cancelled
    );
    println!(
        "  Attempts     : {} retried, {} timed out, {} over limit, {} denied",
        engine.retried, engine.timed_out, engine.limit_exceeded, engine.denied
    );
    match kernel.snapshot() {
        Some(s) => println!(
            "  Host         : cpu {:.1}%  memory {:.0}/{:.0} MB ({:.1}%)",
            s.cpu_percent,
            s.memory_used_mb,
            s.memory_total_mb,
            s.memory_percent()
        ),
        None => println!("  Host         : {}", "not sampled yet".dimmed()),
    }
}

fn cmd_submit(kernel: &Kernel, cfg: &Config, name: &str, priority: Option<u8>, duration_ms: u64) {
    let mut options = TaskOptions::default().max_retries(0);
    if let Some(p) = priority {
        options = options.priority(p);
    }
    let timeout = kernel.config().governance.default_budget.max_time;
    options = options.timeout(timeout.max(Duration::from_millis(duration_ms) * 2));

    let task = kernel.create_task(
        name,
        "demo",
        &cfg.operator,
        EntityKind::User,
        json!({ "duration_ms": duration_ms }),
        options,
    );
    let body = executor(|ctx: TaskContext| async move {
        let total_ms = ctx.payload()["duration_ms"].as_u64().unwrap_or(DEFAULT_DURATION_MS);
        let total = Duration::from_millis(total_ms);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            let step = PROGRESS_STEP.min(total - elapsed);
            tokio::select! {
                _ = ctx.cancelled() => return Err("cancelled".to_string()),
                _ = tokio::time::sleep(step) => {}
            }
            elapsed += step;
            ctx.report_progress(elapsed.as_secs_f32() / total.as_secs_f32(), None);
        }
        Ok(json!({ "slept_ms": total_ms }))
    });

    match kernel.submit(task, body, None) {
        Ok(id) => println!("{} {}", "✓ Submitted".green(), id.bold()),
        Err(e) => println!("{}: {}", "Submit failed".red(), e),
    }
}

fn cmd_tasks(kernel: &Kernel) {
    let mut tasks: Vec<_> = kernel.scheduler().tasks().cloned().collect();
    if tasks.is_empty() {
        println!("  {}", "No tasks yet.".dimmed());
        return;
    }
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!("{}", "Tasks (newest first)".bold().underline());
    for t in tasks.iter().take(LIST_LIMIT) {
        let status = t.status.to_string();
        let status = match t.status {
            TaskStatus::Completed => status.green(),
            TaskStatus::Failed => status.red(),
            TaskStatus::Running => status.cyan(),
            TaskStatus::Pending => status.yellow(),
            TaskStatus::Cancelled => status.dimmed(),
        };
        println!(
            "  {}  {:<16} p{:<2} {:<10} {}",
            short(&t.id),
            t.name,
            t.priority.effective(),
            status,
            t.error.as_deref().unwrap_or("").dimmed()
        );
    }
}

fn cmd_cancel(kernel: &Kernel, prefix: &str) {
    let matches: Vec<String> = kernel
        .scheduler()
        .tasks()
        .filter(|t| t.id.starts_with(prefix))
        .map(|t| t.id.clone())
        .collect();
    match matches.as_slice() {
        [] => println!("{} '{}'", "No task matches".red(), prefix.yellow()),
        [id] => {
            if kernel.cancel(id) {
                println!("{} {}", "✓ Cancelled".green(), id.bold());
            } else {
                println!("{} {} {}", "Task".yellow(), id.bold(), "has already finished".yellow());
            }
        }
        many => println!("{} ({} tasks)", "Ambiguous id prefix".red(), many.len()),
    }
}

fn cmd_audit(kernel: &Kernel) {
    let summary = kernel.audit_summary();
    println!("{}", "Audit Trail".bold().underline());
    println!(
        "  {} decisions: {} allowed, {} denied",
        summary.total,
        summary.allowed.to_string().green(),
        summary.denied.to_string().red()
    );
    let recent = kernel.audit_query(&AuditFilter {
        limit: Some(LIST_LIMIT),
        ..AuditFilter::default()
    });
    for e in recent {
        let verdict = if e.allowed { "allow".green() } else { "deny ".red() };
        println!(
            "  {} {} {}:{} {} {}",
            e.timestamp.format("%H:%M:%S").to_string().dimmed(),
            verdict,
            e.entity_kind,
            e.entity_id,
            e.permission.bold(),
            e.reason.dimmed()
        );
    }
}

fn cmd_failures(kernel: &Kernel) {
    let records = kernel.failures(&FailureFilter::default());
    if records.is_empty() {
        println!("  {}", "No failures recorded.".dimmed());
        return;
    }
    println!("{}", "Failures".bold().underline());
    for r in records.iter().rev().take(LIST_LIMIT) {
        println!(
            "  {} {}:{} {:?}/{:?} → {:?} [{:?}] {}",
            r.detected_at.format("%H:%M:%S").to_string().dimmed(),
            r.entity_kind,
            r.entity_id,
            r.kind,
            r.severity,
            r.action,
            r.status,
            r.message
        );
    }
}

fn cmd_checkpoints(kernel: &Kernel) {
    let checkpoints = kernel.checkpoints();
    if checkpoints.is_empty() {
        println!("  {}", "No checkpoints saved.".dimmed());
        return;
    }
    println!("{}", "Checkpoints (newest first)".bold().underline());
    for c in checkpoints.iter().take(LIST_LIMIT) {
        println!(
            "  {}:{} v{} saved {}",
            c.entity_kind,
            c.entity_id,
            c.version,
            c.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn cmd_metrics(kernel: &Kernel) {
    let snapshot = kernel.metrics();
    println!("{}", "Metrics".bold().underline());
    for (name, value) in &snapshot.counters {
        println!("  {:<40} {}", name, value.to_string().bold());
    }
    for (name, value) in &snapshot.gauges {
        println!("  {:<40} {:.1}", name.cyan(), value);
    }
    for (name, h) in &snapshot.histograms {
        println!(
            "  {:<40} n={} avg={:.1} p50={:.1} p95={:.1} max={:.1}",
            name.magenta(),
            h.count,
            h.avg,
            h.p50,
            h.p95,
            h.max
        );
    }
}

fn cmd_events(kernel: &Kernel, kind: Option<&str>) {
    let events = match kind {
        Some(kind) => {
            let mut matching = kernel.events_by_kind(kind);
            let skip = matching.len().saturating_sub(LIST_LIMIT);
            matching.drain(..skip);
            matching
        }
        None => kernel.recent_events(LIST_LIMIT),
    };
    if events.is_empty() {
        println!("  {}", "No events journaled.".dimmed());
        return;
    }
    println!("{}", "Events".bold().underline());
    for r in events {
        println!(
            "  {} #{} {} {}",
            r.event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            r.sequence,
            r.kind().bold(),
            r.event.source.dimmed()
        );
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
