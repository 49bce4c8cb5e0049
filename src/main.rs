//! Command-line front-end for the debug client
//!
//! Launches or attaches to a debuggee and streams session events to stdout.
//! Stops print the top of the stack with locals, then resume; this is a
//! tracing front-end, not an interactive one.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use v8debug::common::config::ClientConfig;
use v8debug::common::logging;
use v8debug::{Breakpoint, DebugEvent, EventReceiver, LaunchOptions, Session};

#[derive(Parser)]
#[command(name = "v8db", about = "Client for the legacy V8/Node.js debug protocol")]
#[command(version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a script under the debugger and run it to completion
    Launch {
        script: PathBuf,
        /// Debug port the interpreter will listen on
        #[arg(long, default_value_t = 5858)]
        port: u16,
        /// Extra interpreter options, repeatable
        #[arg(long = "node-arg")]
        node_args: Vec<String>,
        /// Breakpoints as file:line, repeatable
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<String>,
        /// Arguments passed to the script
        #[arg(trailing_var_arg = true)]
        script_args: Vec<String>,
    },
    /// Attach to an interpreter already listening on its debug port
    Attach {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Breakpoints as file:line, repeatable
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> v8debug::Result<()> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;

    let (session, events, breakpoints) = match cli.command {
        Command::Launch {
            script,
            port,
            node_args,
            breakpoints,
            script_args,
        } => {
            let mut options = LaunchOptions::new(script);
            options.port = port;
            options.interpreter_options = node_args;
            options.script_args = script_args;
            let (session, events) = Session::launch(config, options).await?;
            (session, events, breakpoints)
        }
        Command::Attach {
            host,
            port,
            breakpoints,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let (session, events) = Session::connect(config, None).await?;
            (session, events, breakpoints)
        }
    };

    drive(session, events, breakpoints).await
}

async fn drive(
    session: Arc<Session>,
    mut events: EventReceiver,
    breakpoints: Vec<String>,
) -> v8debug::Result<()> {
    while let Some(event) = events.recv().await {
        match &event {
            DebugEvent::ProcessLoaded { running } => {
                println!("loaded (running: {running})");
                for location in &breakpoints {
                    match parse_breakpoint(location) {
                        Some(bp) => {
                            if let Err(err) = session.add_breakpoint(bp).await {
                                eprintln!("breakpoint {location}: {err}");
                            }
                        }
                        None => eprintln!("ignoring malformed breakpoint location '{location}'"),
                    }
                }
                session.resume().await;
            }
            DebugEvent::EntryPointHit => {
                println!("entry point");
                session.resume().await;
            }
            DebugEvent::ModuleLoaded { script } => {
                println!("module {} (id {})", script.name, script.id);
            }
            DebugEvent::BreakpointHit { path, line, .. } => {
                println!("breakpoint hit at {path}:{line}");
                print_stop(&session);
                session.resume().await;
            }
            DebugEvent::StepComplete => {
                print_stop(&session);
                session.resume().await;
            }
            DebugEvent::ExceptionRaised {
                name,
                description,
                uncaught,
            } => {
                println!("exception {name}{}: {description}", if *uncaught { " (uncaught)" } else { "" });
                print_stop(&session);
                session.resume().await;
            }
            DebugEvent::ProcessExited { exit_code } => {
                println!("process exited with code {exit_code}");
                break;
            }
            other => println!("{other:?}"),
        }
    }
    Ok(())
}

fn parse_breakpoint(location: &str) -> Option<Breakpoint> {
    let (path, line) = location.rsplit_once(':')?;
    let line: u32 = line.parse().ok()?;
    Some(Breakpoint::new(path, line))
}

fn print_stop(session: &Arc<Session>) {
    let frames = session.frames();
    let Some(top) = frames.first() else {
        return;
    };
    println!(
        "  at {} ({}:{})",
        top.function, top.script.name, top.line
    );
    for local in &top.locals {
        println!("    {} = {}", local.name, local.display);
    }
}
