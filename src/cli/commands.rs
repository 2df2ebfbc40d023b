use tracing::{info, warn};

use crate::app::{AppContext, Result};
use crate::domain::{Caller, FeedId, Header, SubscriptionAction, SubscriptionView};
use crate::vendor::ParseOptions;

/// Run the scheduler until Ctrl-C or SIGTERM.
pub async fn run(ctx: &AppContext) -> Result<()> {
    if ctx.config.platform.token.is_empty() {
        warn!("No bot token configured; every delivery will fail");
    }
    ctx.mediator.blobs().purge()?;

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    println!("Tributary running (Ctrl-C to stop)");
    ctx.scheduler.run().await?;
    println!("Stopped");
    Ok(())
}

pub async fn subscribe(
    ctx: &AppContext,
    feed: &str,
    reference: &str,
    options: &[String],
) -> Result<()> {
    let feed_id = resolve_feed(ctx, feed).await?;
    let options = ParseOptions::from_pairs(options)?;
    let subscription = ctx
        .controller
        .subscribe(feed_id, reference, &options)
        .await?;
    println!(
        "Subscribed {} to {} ({})",
        feed_id, subscription.name, subscription.header
    );
    Ok(())
}

pub async fn list(ctx: &AppContext, feed: &str, suspended: bool) -> Result<()> {
    let feed_id = resolve_feed(ctx, feed).await?;
    let views = ctx.controller.list(feed_id, !suspended)?;

    if views.is_empty() {
        println!(
            "No {} subscriptions",
            if suspended { "suspended" } else { "active" }
        );
        return Ok(());
    }

    for view in &views {
        println!("{}", format_view(view));
    }
    Ok(())
}

pub async fn suspend(
    ctx: &AppContext,
    feed: &str,
    vendor: &str,
    sub_id: &str,
    reason: &str,
) -> Result<()> {
    let header = header(ctx, feed, vendor, sub_id).await?;
    ctx.controller
        .suspend(Caller::Console, &header, reason)
        .await?;
    println!("Suspended {}", header);
    Ok(())
}

pub async fn resume(ctx: &AppContext, feed: &str, vendor: &str, sub_id: &str) -> Result<()> {
    let header = header(ctx, feed, vendor, sub_id).await?;
    ctx.controller.resume(Caller::Console, &header).await?;
    println!("Resumed {}", header);
    Ok(())
}

pub async fn delete(ctx: &AppContext, feed: &str, vendor: &str, sub_id: &str) -> Result<()> {
    let header = header(ctx, feed, vendor, sub_id).await?;
    ctx.controller.delete(Caller::Console, &header).await?;
    println!("Deleted {}", header);
    Ok(())
}

pub async fn clear(ctx: &AppContext, feed: &str, pattern: &str) -> Result<()> {
    let feed_id = resolve_feed(ctx, feed).await?;
    let count = ctx.controller.clear(feed_id, pattern).await?;
    println!("Removed {} suspended subscriptions", count);
    Ok(())
}

/// Numeric ids are used as-is; anything else is an alias the platform resolves.
async fn resolve_feed(ctx: &AppContext, feed: &str) -> Result<FeedId> {
    match feed.parse::<FeedId>() {
        Ok(id) => Ok(id),
        Err(_) => Ok(ctx.router.resolve(feed).await?.id),
    }
}

async fn header(ctx: &AppContext, feed: &str, vendor: &str, sub_id: &str) -> Result<Header> {
    let feed_id = resolve_feed(ctx, feed).await?;
    Ok(Header::new(sub_id, vendor, feed_id))
}

fn format_view(view: &SubscriptionView) -> String {
    let sub = &view.subscription;
    let actions: Vec<&str> = view
        .actions
        .iter()
        .map(|action| match action {
            SubscriptionAction::Suspend => "suspend",
            SubscriptionAction::Resume => "resume",
            SubscriptionAction::Delete => "delete",
        })
        .collect();

    let mut line = format!(
        "{}/{}  {}  (updated {})",
        sub.header.vendor,
        sub.header.sub_id,
        sub.name,
        sub.updated_at.format("%Y-%m-%d %H:%M")
    );
    if let Some(error) = &sub.error {
        line.push_str(&format!("\n    error: {}", error));
    }
    line.push_str(&format!("\n    actions: {}", actions.join(", ")));
    line
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
