//! `steward-cli` – interactive shell around a live Steward kernel.
//!
//! 1. Loads `~/.steward/config.toml`, running a **First-Run Wizard** when the
//!    file is absent.
//! 2. Boots a kernel from the `kernel` section and starts its services.
//! 3. Drops the user into an **interactive REPL** (`/help` lists commands).
//! 4. Intercepts **Ctrl-C** / SIGTERM to shut the kernel down and cancel
//!    running tasks before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use steward_kernel::Policy;
use steward_runtime::{Kernel, init_tracing};
use steward_types::EntityKind;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };
    // Kernel timers and task bodies are spawned from this thread.
    let _enter = runtime.enter();
    let _telemetry = init_tracing("steward-cli");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let kernel = match Kernel::new(cfg.kernel.clone()) {
        Ok(k) => Arc::new(k),
        Err(e) => {
            println!("{}: {}", "Kernel error".red(), e);
            std::process::exit(1);
        }
    };
    if cfg.trust_operator {
        kernel.add_policy(
            Policy::new("operator", EntityKind::User)
                .for_entity(cfg.operator.clone())
                .allow("*"),
        );
    }
    if let Err(e) = kernel.start() {
        println!("{}: {}", "Kernel failed to start".red(), e);
        std::process::exit(1);
    }
    info!(operator = %cfg.operator, "kernel started");

    // ── Ctrl-C / SIGTERM ──────────────────────────────────────────────────
    // Outside of line editing the signal lands here; inside it, the REPL sees
    // it as an interrupt and returns normally.
    let handle = runtime.handle().clone();
    let signal_kernel = Arc::clone(&kernel);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Interrupt received – shutting down …".yellow().bold());
        match handle.block_on(signal_kernel.shutdown()) {
            Ok(true) => println!("{}", "  ✓ All tasks settled.".green()),
            Ok(false) => println!("{}", "  ⚠ Some tasks did not settle in time.".yellow()),
            Err(e) => println!("  {}: {}", "Shutdown error".red(), e),
        }
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!(
        "  Kernel {} with concurrency {}. Type {} for a list of commands.\n",
        "active".green().bold(),
        cfg.kernel.engine.max_concurrency.to_string().bold(),
        "/help".bold().cyan()
    );

    repl::run(&kernel, &cfg);

    print!("  Shutting down kernel … ");
    match runtime.block_on(kernel.shutdown()) {
        Ok(true) => println!("{}", "OK".green()),
        Ok(false) => println!("{}", "some tasks did not settle".yellow()),
        Err(e) => println!("{}: {}", "FAILED".red(), e),
    }
    drop(kernel);
    drop(_enter);
    runtime.shutdown_timeout(Duration::from_secs(1));
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      Steward First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Steward.\n");

    let mut cfg = config::Config::default();

    cfg.operator = prompt_line(&format!("  Operator name [{}]: ", cfg.operator), &cfg.operator);

    let engine = &mut cfg.kernel.engine;
    let raw = prompt_line(
        &format!("  Concurrent tasks [{}]: ", engine.max_concurrency),
        &engine.max_concurrency.to_string(),
    );
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => engine.max_concurrency = n,
        _ => println!("  {} keeping {}", "Invalid number,".yellow(), engine.max_concurrency),
    }

    let scheduler = &mut cfg.kernel.scheduler;
    let raw = prompt_line(
        &format!("  Queue capacity [{}]: ", scheduler.max_queue_size),
        &scheduler.max_queue_size.to_string(),
    );
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => scheduler.max_queue_size = n,
        _ => println!("  {} keeping {}", "Invalid number,".yellow(), scheduler.max_queue_size),
    }

    let raw = prompt_line("  Recover from failures automatically? [Y/n]: ", "y");
    cfg.kernel.recovery.auto_recovery = !raw.eq_ignore_ascii_case("n");

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______                          __"#.bold().cyan());
    println!("{}", r#"  / __/ /____ _    _____ ________/ /"#.bold().cyan());
    println!("{}", r#" _\ \/ __/ -_) |/|/ / _ `/ __/ _  / "#.bold().cyan());
    println!("{}", r#"/___/\__/\__/|__,__/\_,_/_/  \_,_/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Steward".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Task execution kernel");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
