use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use colored::*;
use prewarm_daemon::client::{running_pid, stdio_channel, stop_daemon};
use prewarm_daemon::socket_path::socket_exists;
use prewarm_daemon::{
    logging, Client, CommandRequest, Daemon, DaemonError, DaemonOptions, Env, OriginalEnv, Reply,
};
use std::os::fd::AsFd;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::debug;

mod cli;

use cli::{Args, Commands};

const BOOT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Taken before anything else can touch the environment
    let original_env = OriginalEnv::capture();
    let args = Args::parse();

    logging::init(&args.log_level);

    let cwd = match args.project {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    let env = Env::discover(&cwd)?;

    match args.command {
        Commands::Server { no_session_group } => {
            handle_server(env, original_env, no_session_group).await?
        }
        Commands::Run {
            env: default_env,
            no_boot,
            args,
        } => {
            let status = handle_run(&env, default_env, no_boot, args).await?;
            std::process::exit(status);
        }
        Commands::Status => handle_status(&env),
        Commands::Stop { timeout } => handle_stop(&env, Duration::from_secs(timeout)).await?,
    }

    Ok(())
}

async fn handle_server(env: Env, original_env: OriginalEnv, no_session_group: bool) -> Result<()> {
    let options = DaemonOptions {
        session_group: !no_session_group,
        ..DaemonOptions::default()
    };

    match Daemon::new(env, original_env, options).boot().await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<DaemonError>() {
            Some(already @ DaemonError::AlreadyRunning { .. }) => {
                eprintln!("{}", already.to_string().yellow());
                std::process::exit(1);
            }
            _ => Err(e),
        },
    }
}

async fn handle_run(
    env: &Env,
    default_env: Option<String>,
    no_boot: bool,
    args: Vec<String>,
) -> Result<i32> {
    let Some(client) = connect(env, no_boot).await? else {
        eprintln!(
            "{} run `prewarm server` first or drop --no-boot",
            "No daemon is running:".red().bold()
        );
        return Ok(1);
    };

    let request = CommandRequest::new(args, default_env);
    let channel = stdio_channel(&request)?;
    let command = request.command_name().unwrap_or_default();
    match client.run(channel.as_fd(), &request).await? {
        Reply::Exited(status) => Ok(status),
        Reply::Unknown => {
            eprintln!("{} {}", "Unknown command:".red().bold(), command);
            Ok(1)
        }
        Reply::Failed => {
            eprintln!(
                "{} {} (see {})",
                "Daemon could not run".red().bold(),
                command,
                env.log_file().display()
            );
            Ok(1)
        }
    }
}

/// Connect and handshake, booting a daemon when none is serving this project.
///
/// A daemon that just went stale drops the first connection; in that case
/// wait for it to finish tearing down and boot a fresh one.
async fn connect(env: &Env, no_boot: bool) -> Result<Option<Client>> {
    let socket = env.socket_path();

    for attempt in 0..2 {
        if running_pid(env).is_none() || !socket_exists(&socket) {
            if no_boot {
                return Ok(None);
            }
            boot_daemon(env).await?;
        }

        let mut client = Client::connect(&socket).await?;
        match client.handshake(env.version()).await {
            Ok(()) => return Ok(Some(client)),
            Err(e) if e.is_hangup() && attempt == 0 => {
                debug!("Daemon is retiring, waiting for it to exit");
                wait_until("the old daemon to exit", || running_pid(env).is_none()).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(None)
}

async fn boot_daemon(env: &Env) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the prewarm executable")?;
    debug!("Booting daemon for {}", env.root().display());

    std::process::Command::new(exe)
        .arg("--project")
        .arg(env.root())
        .arg("server")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to boot the daemon")?;

    let socket = env.socket_path();
    wait_until("the daemon to boot", || {
        running_pid(env).is_some() && socket_exists(&socket)
    })
    .await
}

async fn wait_until(what: &str, done: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + BOOT_TIMEOUT;
    while !done() {
        if Instant::now() >= deadline {
            anyhow::bail!("Timed out after {:?} waiting for {}", BOOT_TIMEOUT, what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn handle_status(env: &Env) {
    println!("{} {}", "Project:".bold().green(), env.root().display());
    match running_pid(env) {
        Some(pid) => {
            println!("{} {}", "Daemon:".bold().green(), "running".green());
            println!("{} {}", "PID:".bold().green(), pid);
            println!("{} {}", "Socket:".bold().green(), env.socket_path().display());
        }
        None => println!("{} {}", "Daemon:".bold().green(), "not running".yellow()),
    }
}

async fn handle_stop(env: &Env, timeout: Duration) -> Result<()> {
    match stop_daemon(env, timeout).await? {
        Some(pid) => println!("{} {}", "Stopped daemon".green(), pid),
        None => println!("{}", "No daemon is running.".yellow().bold()),
    }
    Ok(())
}
