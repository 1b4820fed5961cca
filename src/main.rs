use clap::Parser;
use lookout::Settings;
use lookout::cli::commands::serve::ServeArgs;
use lookout::cli::commands::{init, serve};
use lookout::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration (explicit --config path wins over workspace discovery)
    let config = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        Settings::default()
    });

    lookout::logging::init_with_config(&config.logging);

    match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&config),
        Commands::Serve {
            paths,
            ignore,
            foreground,
            parent_pid,
            verbose,
        } => {
            serve::run(
                ServeArgs {
                    paths,
                    ignore,
                    foreground,
                    parent_pid,
                    verbose,
                    config_path: cli.config.clone(),
                },
                config,
            )
            .await;
        }
    }
}
