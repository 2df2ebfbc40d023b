use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tributary::app::AppContext;
use tributary::cli::{commands, Cli, Commands};
use tributary::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let ctx = AppContext::new(config)?;

    match cli.command {
        Commands::Run => {
            commands::run(&ctx).await?;
        }
        Commands::Subscribe {
            feed,
            reference,
            options,
        } => {
            commands::subscribe(&ctx, &feed, &reference, &options).await?;
        }
        Commands::List { feed, suspended } => {
            commands::list(&ctx, &feed, suspended).await?;
        }
        Commands::Suspend { target, reason } => {
            commands::suspend(&ctx, &target.feed, &target.vendor, &target.sub_id, &reason).await?;
        }
        Commands::Resume { target } => {
            commands::resume(&ctx, &target.feed, &target.vendor, &target.sub_id).await?;
        }
        Commands::Delete { target } => {
            commands::delete(&ctx, &target.feed, &target.vendor, &target.sub_id).await?;
        }
        Commands::Clear { feed, pattern } => {
            commands::clear(&ctx, &feed, &pattern).await?;
        }
    }

    ctx.scheduler.stop().await;
    Ok(())
}
