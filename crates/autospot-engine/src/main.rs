//! autospot: replaces on-demand auto-scaling group members with spot
//! instances.
//!
//! Three invocation shapes: an event file simulating one event-driven
//! invocation, a hand-off queue drained for pending attachments, or the
//! cron-mode replacement pass over the configured regions.

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use tracing::{info, warn};

use autospot_engine::aws::autoscaling::AutoScalingClient;
use autospot_engine::aws::context::AwsContext;
use autospot_engine::aws::ec2::Ec2Client;
use autospot_engine::aws::sqs::{ReplacementMessage, ReplacementQueue};
use autospot_engine::catalog::RegionCatalogs;
use autospot_engine::config::{Args, Config};
use autospot_engine::engine::{Recap, RegionRunner};
use autospot_engine::events::{CloudEvent, EngineEvent};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        print_error(&error);
        std::process::exit(1);
    }
}

fn print_error(error: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\nError: {error}");

    let mut source = error.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  Caused by: {cause}");
        source = cause.source();
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into())
        .add_directive("aws_config=warn".parse().expect("static directive"))
        .add_directive("aws_smithy_runtime=warn".parse().expect("static directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = Config::from_args(&args).context("Invalid configuration")?;

    let catalogs = match &config.instance_data_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read instance data file {path}"))?;
            RegionCatalogs::from_json(&json).context("Failed to parse instance data file")?
        }
        None => {
            info!("No instance data file configured, launches will find no candidates");
            RegionCatalogs::default()
        }
    };

    let recap = Recap::new();

    if let Some(path) = config.event_file.clone() {
        handle_event_file(&path, &config, &catalogs, &recap).await?;
    } else if config.sqs_queue_url.is_some() {
        drain_replacement_queue(&config, &catalogs, &recap).await?;
    } else {
        run_replacement_cycles(&config, &catalogs, &recap).await?;
    }

    recap.log_summary();
    Ok(())
}

/// Simulate one event-driven invocation from a JSON file.
async fn handle_event_file(
    path: &str,
    config: &Config,
    catalogs: &RegionCatalogs,
    recap: &Recap,
) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file {path}"))?;
    let envelope = CloudEvent::parse(&json)?;

    let region = if envelope.region.is_empty() {
        config.main_region.clone()
    } else {
        envelope.region.clone()
    };
    if !config.region_enabled(&region) {
        info!(region = %region, "Event region is not enabled");
        return Ok(());
    }

    let event = envelope.classify();
    handle_event_in_region(&region, &event, config, catalogs, recap).await
}

async fn handle_event_in_region(
    region: &str,
    event: &EngineEvent,
    config: &Config,
    catalogs: &RegionCatalogs,
    recap: &Recap,
) -> Result<()> {
    let ctx = AwsContext::new(region).await;
    let ec2 = Ec2Client::from_context(&ctx);
    let asg = AutoScalingClient::from_context(&ctx);
    let catalog = catalogs.catalog_for(region);

    let runner = RegionRunner::new(region, &ec2, &asg, &catalog, config, recap);
    runner.handle_event(event).await?;
    Ok(())
}

/// Drain the hand-off queue: every message is a spot instance launched by
/// an earlier cron pass, ready to attach now.
async fn drain_replacement_queue(
    config: &Config,
    catalogs: &RegionCatalogs,
    recap: &Recap,
) -> Result<()> {
    let queue_url = config.sqs_queue_url.as_deref().expect("checked by caller");
    let main_ctx = AwsContext::new(&config.main_region).await;
    let queue = ReplacementQueue::new(&main_ctx, queue_url);

    for queued in queue.receive().await? {
        let ReplacementMessage {
            region,
            instance_id,
        } = &queued.message;

        if !config.region_enabled(region) {
            info!(region = %region, instance_id, "Message region is not enabled, dropping");
            queue.delete(&queued.receipt_handle).await?;
            continue;
        }

        let event = EngineEvent::SpotRunning {
            region: region.clone(),
            instance_id: instance_id.clone(),
        };
        match handle_event_in_region(region, &event, config, catalogs, recap).await {
            Ok(()) => queue.delete(&queued.receipt_handle).await?,
            // Leave the message in flight; the queue redelivers it and the
            // platform's retry channel applies.
            Err(error) => warn!(instance_id, %error, "Keeping message for redelivery"),
        }
    }
    Ok(())
}

/// Cron mode: one replacement pass per enabled region, regions in
/// parallel. Launched instances are handed off through the queue when one
/// is configured.
async fn run_replacement_cycles(
    config: &Config,
    catalogs: &RegionCatalogs,
    recap: &Recap,
) -> Result<()> {
    let regions: Vec<String> = if config.regions.is_empty() {
        vec![config.main_region.clone()]
    } else {
        // Glob patterns select among explicitly named regions; region
        // discovery belongs to the invocation shell.
        config
            .regions
            .iter()
            .filter(|pattern| !pattern.contains(['*', '?', '[']))
            .cloned()
            .collect()
    };

    if regions.is_empty() {
        warn!("No literal region names configured, nothing to do");
        return Ok(());
    }

    let cycles = regions.iter().map(|region| {
        let region = region.clone();
        async move {
            let launched = run_region_cycle(&region, config, catalogs, recap).await;
            (region, launched)
        }
    });

    let queue = match &config.sqs_queue_url {
        Some(url) => {
            let ctx = AwsContext::new(&config.main_region).await;
            Some(ReplacementQueue::new(&ctx, url))
        }
        None => None,
    };

    for (region, result) in join_all(cycles).await {
        match result {
            Ok(launched) => {
                if let Some(queue) = &queue {
                    for instance_id in launched {
                        let message = ReplacementMessage {
                            region: region.clone(),
                            instance_id,
                        };
                        if let Err(error) = queue.send(&message).await {
                            warn!(region = %region, %error, "Failed to enqueue hand-off");
                        }
                    }
                }
            }
            Err(error) => warn!(region = %region, %error, "Replacement cycle failed"),
        }
    }
    Ok(())
}

async fn run_region_cycle(
    region: &str,
    config: &Config,
    catalogs: &RegionCatalogs,
    recap: &Recap,
) -> Result<Vec<String>> {
    let ctx = AwsContext::new(region).await;
    let ec2 = Ec2Client::from_context(&ctx);
    let asg = AutoScalingClient::from_context(&ctx);
    let catalog = catalogs.catalog_for(region);

    let runner = RegionRunner::new(region, &ec2, &asg, &catalog, config, recap);
    let launched = runner.run_replacement_cycle().await?;
    Ok(launched)
}
