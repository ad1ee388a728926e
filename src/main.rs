use clap::{Arg, ArgAction, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let matches = Command::new("synapse")
        .version(VERSION)
        .about("Synapse - LLM intention orchestrator with a durable saga engine")
        .subcommand(
            Command::new("up")
                .about("Start the engine and HTTP API")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .help("HTTP API port")
                        .default_value("8080"),
                )
                .arg(
                    Arg::new("in-memory")
                        .long("in-memory")
                        .action(ArgAction::SetTrue)
                        .help("Use the in-memory state store (no durability)"),
                )
                .arg(
                    Arg::new("embedded-queue")
                        .long("embedded-queue")
                        .action(ArgAction::SetTrue)
                        .help("Run the continuation queue in-process instead of over HTTP"),
                ),
        )
        .subcommand(Command::new("doctor").about("Check configuration and dependencies"))
        .arg_required_else_help(true)
        .get_matches();

    let result = match matches.subcommand() {
        Some(("up", sub)) => commands::up::run(sub).await,
        Some(("doctor", _)) => commands::doctor::run().await,
        _ => unreachable!("subcommand required"),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
