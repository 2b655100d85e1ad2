//! Remote storage commands: `list`, `presign` and `check-credentials`.

use anyhow::Context;
use colored::Colorize;
use idenhide_core::{
    AccessLayer, IdenhideConfig, Origin, RemoteConnector, RemoteLocation, S3Connector, SourceBackend,
    SourceProvider,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::credentials_from_env;

#[derive(Serialize)]
struct ListedObject {
    name: String,
    uri: String,
}

async fn connect(region: &str, config: &IdenhideConfig) -> anyhow::Result<Arc<dyn SourceBackend>> {
    let credentials = credentials_from_env()?;
    let mut connector = S3Connector::new();
    if let Some(endpoint) = &config.storage.endpoint_url {
        connector = connector.with_endpoint_url(endpoint);
    }
    connector
        .connect(region, credentials)
        .await
        .with_context(|| format!("Failed to connect to S3 in {region}"))
}

/// Lists the images under an S3 prefix.
pub async fn list(uri: &str, region: &str, json: bool, config: &IdenhideConfig) -> anyhow::Result<()> {
    let origin = Origin::Remote(RemoteLocation::parse(uri, region)?);
    let backend = connect(region, config).await?;
    let objects: Vec<ListedObject> = backend
        .list(&origin)
        .await?
        .iter()
        .map(|location| ListedObject { name: origin.item_name(location), uri: location.uri() })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&objects)?);
        return Ok(());
    }

    println!("{} {}", "Images under".bold(), uri.cyan());
    if objects.is_empty() {
        println!("  {}", "No images found".dimmed());
    }
    for object in &objects {
        println!("  {} {}", "•".dimmed(), object.name);
    }
    println!();
    println!("  {} image(s)", objects.len());
    Ok(())
}

/// Prints a presigned view URL for one S3 object.
pub async fn presign(
    uri: &str,
    expires: Option<u64>,
    region: &str,
    json: bool,
    config: &IdenhideConfig,
) -> anyhow::Result<()> {
    let ttl = expires.map_or_else(|| config.presign_ttl(), Duration::from_secs);
    let backend = connect(region, config).await?;
    let access = AccessLayer::new(SourceProvider::local_only().with_remote(backend));
    let link = access.presign_source(uri, region, ttl).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&link)?);
    } else {
        println!("{}", link.url);
        eprintln!("  {} expires at {}", "•".dimmed(), link.expires_at.to_rfc3339());
    }
    Ok(())
}

/// Verifies the credentials from the environment against S3.
pub async fn check_credentials(region: &str, config: &IdenhideConfig) -> anyhow::Result<()> {
    connect(region, config).await?;
    println!("{} Credentials valid for region {}", "✓".green(), region.cyan());
    Ok(())
}
