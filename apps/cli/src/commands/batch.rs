//! Batch command implementation.
//!
//! Submits one batch job, renders progress while it runs, and prints the
//! summary. Ctrl+C cancels the job; items already in flight still finish.

use anyhow::{Context, bail};
use clap::{ArgGroup, Args};
use colored::Colorize;
use idenhide_abstraction::{DEFAULT_FACE_BLUR_STRENGTH, DEFAULT_PLATE_BLUR_STRENGTH};
use idenhide_core::{
    ArtifactLayout, BatchJob, BatchService, BatchSummary, IdenhideConfig, ItemStatus, JobId, JobStatus, Origin,
    ProcessOptions, ProgressEvent, RemoteLocation, Strategy, SubmitRequest,
};
use idenhide_detector::HttpDetector;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use super::credentials_from_env;

/// Arguments of `idenhide batch`.
#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["folder", "files", "s3"])))]
pub struct BatchArgs {
    /// Process every image directly inside this folder
    #[arg(long, value_name = "DIR")]
    pub folder: Option<PathBuf>,

    /// Process these files, in this order
    #[arg(long = "file", value_name = "FILE", num_args = 1..)]
    pub files: Vec<PathBuf>,

    /// Process every image under this S3 prefix (s3://bucket/prefix)
    #[arg(long, value_name = "URI")]
    pub s3: Option<String>,

    /// Write blurred images under this S3 prefix
    #[arg(long, value_name = "URI", conflicts_with = "output")]
    pub output_s3: Option<String>,

    /// Write blurred images under this local directory
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Maximum items in flight (1-8)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Process one item at a time
    #[arg(long)]
    pub sequential: bool,

    /// Skip face detection
    #[arg(long)]
    pub no_faces: bool,

    /// Skip license plate detection
    #[arg(long)]
    pub no_plates: bool,

    /// Only detect, do not render blurred images
    #[arg(long)]
    pub no_blur: bool,

    /// Face blur strength (1-100)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub face_blur: Option<u8>,

    /// License plate blur strength (1-100)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub plate_blur: Option<u8>,

    /// Write a tar.gz archive of originals, blurred images and manifest here
    #[arg(long, value_name = "PATH")]
    pub archive: Option<PathBuf>,

    /// Output the job and summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Detection service URL
    #[arg(long, value_name = "URL")]
    pub detector_url: Option<String>,

    /// AWS region for S3 sources and outputs
    #[arg(long)]
    pub region: Option<String>,
}

impl BatchArgs {
    fn origin(&self, region: &str) -> anyhow::Result<Origin> {
        if let Some(folder) = &self.folder {
            return Ok(Origin::LocalFolder { path: folder.clone() });
        }
        if let Some(uri) = &self.s3 {
            return Ok(Origin::Remote(RemoteLocation::parse(uri, region)?));
        }
        Ok(Origin::LocalFiles { paths: self.files.clone() })
    }

    /// Request without credentials. `--output` always wins over the default
    /// layout, so an S3 source with `--output` writes locally.
    fn request(&self, origin: Origin, region: &str) -> anyhow::Result<SubmitRequest> {
        let mut request = SubmitRequest::new(origin).with_options(self.options());
        if let Some(concurrency) = self.concurrency {
            request = request.with_concurrency(concurrency);
        }
        if self.sequential {
            request = request.with_strategy(Strategy::Sequential);
        }
        if let Some(dir) = &self.output {
            request = request.with_output(ArtifactLayout::local(dir));
        }
        if let Some(uri) = &self.output_s3 {
            request = request.with_output(ArtifactLayout::remote(RemoteLocation::parse(uri, region)?));
        }
        Ok(request)
    }

    fn options(&self) -> ProcessOptions {
        ProcessOptions {
            detect_faces: !self.no_faces,
            detect_plates: !self.no_plates,
            render_blur: !self.no_blur,
            face_blur_strength: self.face_blur.unwrap_or(DEFAULT_FACE_BLUR_STRENGTH),
            plate_blur_strength: self.plate_blur.unwrap_or(DEFAULT_PLATE_BLUR_STRENGTH),
        }
    }
}

/// JSON output of `idenhide batch --json`.
#[derive(Serialize)]
struct BatchReport<'a> {
    job: &'a BatchJob,
    summary: &'a BatchSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    archive: Option<&'a Path>,
}

/// Execute batch command.
pub async fn execute(args: BatchArgs, config: &IdenhideConfig) -> anyhow::Result<()> {
    let region = args.region.clone().unwrap_or_else(|| config.region().to_string());
    let origin = args.origin(&region)?;
    let detector_url = args.detector_url.as_deref().unwrap_or_else(|| config.detector_url());

    if !args.json {
        println!("{}", "idenhide batch".bold().cyan());
        println!();
        println!("  {} Source: {}", "•".dimmed(), origin.describe());
        println!("  {} Detector: {}", "•".dimmed(), detector_url);
    }

    let detector = HttpDetector::with_timeout(detector_url, config.request_timeout())
        .context("Failed to create detection client")?;
    let service = BatchService::from_config(config, Arc::new(detector))?;

    let mut request = args.request(origin, &region)?;
    if request.origin.is_remote() || args.output_s3.is_some() {
        request = request.with_credentials(credentials_from_env()?);
    }

    let id = service.submit_batch(request).await.context("Batch submission failed")?;
    let status = run_with_progress(&service, &id, args.json).await?;

    let job = service.snapshot(&id).await?;
    let summary = service.summary(&id).await?;

    if let Some(path) = &args.archive {
        let bytes = service.archive(&id).await?;
        tokio::fs::write(path, &bytes)
            .await
            .with_context(|| format!("Failed to write archive: {}", path.display()))?;
    }

    if args.json {
        let report = BatchReport { job: &job, summary: &summary, archive: args.archive.as_deref() };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_summary(&job, &summary, args.archive.as_deref());
    }

    match status {
        JobStatus::Aborted => {
            let cause = job.abort_cause.map_or_else(|| "unknown cause".to_string(), |info| info.message);
            bail!("Batch {} aborted: {}", id, cause);
        }
        JobStatus::Cancelled if !args.json => {
            eprintln!("{} Batch cancelled before all items ran", "⚠".yellow());
        }
        _ => {}
    }
    Ok(())
}

/// Waits for the job while mirroring its progress events on a bar.
async fn run_with_progress(service: &BatchService, id: &JobId, quiet: bool) -> anyhow::Result<JobStatus> {
    let total = service.progress(id).await?.total as u64;
    let bar = if quiet { ProgressBar::hidden() } else { ProgressBar::new(total) };
    let style = ProgressStyle::with_template("  {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map_or_else(|_| ProgressStyle::default_bar(), |style| style.progress_chars("=>-"));
    bar.set_style(style);

    let mut events = service.subscribe(id).await?;
    let listener = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProgressEvent::ItemSettled { processed, status, index, .. }) => {
                        bar.set_position(processed as u64);
                        if status == ItemStatus::Failed {
                            bar.set_message(format!("item {index} failed"));
                        }
                    }
                    Ok(ProgressEvent::StrategyChanged { from, to, reason, .. }) => {
                        bar.println(format!("  {} Switched from {from} to {to}: {reason}", "⚠".yellow()));
                    }
                    Ok(ProgressEvent::JobFinished { .. }) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        })
    };

    let status = tokio::select! {
        status = service.wait(id) => status?,
        _ = tokio::signal::ctrl_c() => {
            bar.println(format!("{} Cancellation requested, waiting for in-flight items...", "⚠".yellow()));
            service.cancel(id).await?;
            service.wait(id).await?
        }
    };

    listener.abort();
    bar.set_position(service.progress(id).await?.processed as u64);
    bar.finish_and_clear();
    Ok(status)
}

fn render_summary(job: &BatchJob, summary: &BatchSummary, archive: Option<&Path>) {
    let status = match job.status {
        JobStatus::Completed => job.status.to_string().green(),
        JobStatus::PartiallyFailed | JobStatus::Cancelled => job.status.to_string().yellow(),
        _ => job.status.to_string().red(),
    };

    println!();
    println!("{}", "Batch summary".bold());
    println!("  Job:        {}", job.id.to_string().cyan());
    println!("  Status:     {status}");
    println!("  Strategy:   {}", job.strategy);
    println!(
        "  Items:      {} total, {} succeeded, {} failed",
        summary.total,
        summary.succeeded.to_string().green(),
        summary.failed.to_string().red()
    );
    println!("  Detections: {} faces, {} plates", summary.faces_detected, summary.plates_detected);
    println!(
        "  Time:       {:.1}s ({:.2} items/s)",
        summary.elapsed_ms as f64 / 1000.0,
        summary.throughput_items_per_sec
    );
    if let Some(cause) = &job.abort_cause {
        println!("  Cause:      {}", cause.message.red());
    }

    let failed: Vec<_> = job.items.iter().filter(|r| r.status == ItemStatus::Failed).collect();
    if !failed.is_empty() {
        println!();
        println!("{}", "Failed items".bold());
        for record in failed {
            let message = record.error.as_ref().map_or("unknown error", |e| e.message.as_str());
            println!("  {} {} - {}", "✗".red(), record.name, message.dimmed());
        }
    }

    if let Some(first) = job.items.iter().find_map(|r| r.artifact_ref.as_ref()) {
        println!();
        println!("  {} First artifact: {}", "✓".green(), first.location.uri());
    }
    if let Some(path) = archive {
        println!("  {} Archive: {}", "✓".green(), path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: BatchArgs,
    }

    fn parse(argv: &[&str]) -> BatchArgs {
        TestCli::parse_from(std::iter::once("batch").chain(argv.iter().copied())).args
    }

    #[test]
    fn test_s3_source_with_local_output_writes_locally() {
        let args = parse(&["--s3", "s3://photos/in", "--output", "./out"]);
        let origin = args.origin("eu-west-1").unwrap();
        let request = args.request(origin, "eu-west-1").unwrap();

        assert!(request.origin.is_remote());
        assert_eq!(request.output, Some(ArtifactLayout::local("./out")));
    }

    #[test]
    fn test_output_s3_layout_and_overrides() {
        let args = parse(&[
            "--folder",
            ".",
            "--output-s3",
            "s3://vault/blurred",
            "--sequential",
            "--concurrency",
            "3",
        ]);
        let origin = args.origin("eu-west-1").unwrap();
        let request = args.request(origin, "eu-west-1").unwrap();

        let expected = RemoteLocation::parse("s3://vault/blurred", "eu-west-1").unwrap();
        assert_eq!(request.output, Some(ArtifactLayout::remote(expected)));
        assert_eq!(request.strategy, Some(Strategy::Sequential));
        assert_eq!(request.concurrency, Some(3));
    }

    #[test]
    fn test_default_request_leaves_layout_to_service() {
        let args = parse(&["--s3", "s3://photos/in"]);
        let request = args.request(args.origin("us-east-1").unwrap(), "us-east-1").unwrap();
        assert!(request.output.is_none());
        assert!(request.credentials.is_none());
    }
}
