use clap::{Parser, Subcommand};
use radadapter::{open_channel, DebugSession, Profile, RadError, WAVE_SIZE};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "radscope", version, about = "Run remote debug actions and inspect dispatch output")]
struct Cli {
    /// Profile file describing the connection and actions
    #[arg(short, long, global = true, default_value = "radscope.toml")]
    config: PathBuf,

    /// Log protocol traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured action
    Run {
        action: String,
        /// Keep going after a failed step
        #[arg(long)]
        continue_on_error: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the remote environment variables
    Env,
    /// Show the negotiated server version and platform
    Info,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let adapter_level = if cli.verbose { log::LevelFilter::Trace } else { log::LevelFilter::Info };
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("radscope", log::LevelFilter::Info)
        .with_module_level("radadapter", adapter_level)
        .init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32, RadError> {
    let profile = Profile::load(&cli.config)?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, cancelling...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Run { action, continue_on_error, json } => {
            let steps = profile.action_steps(&action)?;
            let mut session = DebugSession::from_profile(&profile);
            let result = session.run_action(&action, &steps, continue_on_error, &cancel).await?;

            if json {
                match serde_json::to_string_pretty(&result) {
                    Ok(text) => println!("{}", text),
                    Err(e) => log::error!("Failed to serialize the run result: {}", e),
                }
            } else {
                print!("{}", result.summary());
            }

            if session.break_state().is_some() {
                print_break_state(&mut session, &cancel).await?;
            }
            session.close();
            Ok(if result.successful() { 0 } else { 2 })
        }
        Commands::Env => {
            let session = DebugSession::from_profile(&profile);
            let variables = session.channel().get_remote_environment(&cancel).await?;
            for (name, value) in variables {
                println!("{}={}", name, value);
            }
            Ok(0)
        }
        Commands::Info => {
            let channel = open_channel(&profile);
            let info = channel.server_info(&cancel).await?;
            println!("Server {}: version {} on {}", profile.connection_options(), info.version, info.platform);
            Ok(0)
        }
    }
}

async fn print_break_state(session: &mut DebugSession, cancel: &CancellationToken) -> Result<(), RadError> {
    let group_size = session
        .break_state()
        .and_then(|state| state.dispatch_params.as_ref())
        .map(|params| round_up_to_wave(params.group_x as usize))
        .unwrap_or(WAVE_SIZE);

    if let Some(params) = session.break_state().and_then(|state| state.dispatch_params.as_ref()) {
        println!("Dispatch: {}", params);
    }
    if let Some(warning) = session.change_group(0, group_size, cancel).await? {
        println!("Warning: {}", warning);
    }

    if let Some(system) = session.break_state().and_then(|state| state.data.get_system()) {
        let values: Vec<String> = system.iter().map(|v| format!("{:#010x}", v)).collect();
        println!("Group #0 system ({} lanes):", system.len());
        for row in values.chunks(8) {
            println!("  {}", row.join(" "));
        }
    }
    Ok(())
}

fn round_up_to_wave(size: usize) -> usize {
    ((size.max(1) + WAVE_SIZE - 1) / WAVE_SIZE) * WAVE_SIZE
}
