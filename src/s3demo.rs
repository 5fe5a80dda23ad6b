mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use s3kit::s3::{
    BatchDeleter, ErrorKind, ListRequest, ObjectMetadata, PutOptions, S3Client, StorageError,
    UploadResult, Waiter, WaiterConfig, download_file, parse_metadata, sync_file, upload_file,
};
use settings::Settings;

const DEMO_KEY: &str = "myobjpath/hello.txt";
const DEMO_DOWNLOAD_TO: &str = "hello-downloaded.txt";

#[derive(Parser, Debug)]
#[command(
    name = "s3demo",
    version = env!("CARGO_PKG_VERSION"),
    author = "Tyr Chen <tyr.chen@gmail.com>",
    about = "Exercise an S3-compatible endpoint: upload, download, presign, list, wait and purge",
    after_help = "Examples:\n  \
                  s3demo demo hello.txt                   # Upload, download, presign, list, re-put, delete\n  \
                  s3demo ls --prefix logs/ --json          # List objects as JSON lines\n  \
                  s3demo presign reports/q3.pdf -e 3600    # One-hour download link\n  \
                  s3demo purge --prefix tmp/               # Bulk delete everything under tmp/\n\n\
                  Configuration (.env):\n  \
                  S3_ENDPOINT=http://localhost:9000\n  \
                  S3_REGION=us-east-1\n  \
                  S3_BUCKET=my-bucket\n  \
                  AWS_ACCESS_KEY_ID=...\n  \
                  AWS_SECRET_KEY=..."
)]
struct Cli {
    /// Bucket to operate on (overrides S3_BUCKET)
    #[arg(long, short = 'b', global = true)]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, download it back, presign, list, re-upload and delete it
    Demo {
        /// Local file to upload
        #[arg(default_value = "hello.txt")]
        file: PathBuf,
    },
    /// List objects
    Ls {
        #[arg(long, short = 'p')]
        prefix: Option<String>,

        /// Group keys by this delimiter (e.g. "/")
        #[arg(long, short = 'd')]
        delimiter: Option<String>,

        /// Keys per request (1-1000)
        #[arg(long, default_value = "1000")]
        page_size: u32,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Upload a file
    Put {
        file: PathBuf,

        /// Object key (defaults to the file name)
        #[arg(long, short = 'k')]
        key: Option<String>,

        /// Canned ACL, e.g. public-read
        #[arg(long)]
        acl: Option<String>,

        /// Override Content-Type
        #[arg(long)]
        content_type: Option<String>,

        /// Custom metadata (key=value pairs, comma-separated)
        #[arg(long)]
        metadata: Option<String>,

        /// Skip the upload when the remote object is identical
        #[arg(long)]
        sync: bool,
    },
    /// Download an object
    Get {
        key: String,

        /// Destination file (defaults to the key's file name)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Delete an object
    Rm { key: String },
    /// Generate a pre-signed URL
    Presign {
        key: String,

        /// Expiration in seconds (1 to 604800)
        #[arg(long, short = 'e', default_value = "900")]
        expires_secs: u64,

        /// Presign an upload instead of a download
        #[arg(long)]
        put: bool,
    },
    /// Delete every object under a prefix
    Purge {
        #[arg(long, short = 'p')]
        prefix: Option<String>,

        /// Keys per bulk delete request (1-1000)
        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },
    /// Wait until the bucket exists (or is gone)
    WaitBucket {
        /// Wait for the bucket to disappear instead
        #[arg(long)]
        absent: bool,

        /// Seconds between checks
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Give up after this many seconds
        #[arg(long, default_value = "100")]
        timeout: u64,
    },
    /// Create the bucket
    Mb,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file early to get LOG_LEVEL
    dotenv::dotenv().ok();

    // Initialize tracing/logging with support for LOG_LEVEL from .env
    let log_level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = match err.downcast_ref::<StorageError>() {
                Some(storage) => format!("{:#}\n\n{}", err, storage.user_message()),
                None => format!("{:#}", err),
            };
            eprintln!("{} {}", style("✗").red().bold(), style(message).red());
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(bucket) = cli.bucket {
        settings.bucket = bucket;
    }

    let client = S3Client::new(settings.client_config()?)?;
    let bucket = settings.bucket.as_str();

    info!("S3 Demo v{}", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %settings.endpoint, bucket, "using endpoint");

    match cli.command {
        Command::Demo { file } => run_demo(&client, bucket, &file).await?,
        Command::Ls {
            prefix,
            delimiter,
            page_size,
            json,
        } => {
            let mut request = ListRequest::new(bucket).with_max_keys(page_size);
            if let Some(prefix) = prefix {
                request = request.with_prefix(prefix);
            }
            if let Some(delimiter) = delimiter {
                request = request.with_delimiter(delimiter);
            }
            list(&client, request, json).await?;
        }
        Command::Put {
            file,
            key,
            acl,
            content_type,
            metadata,
            sync,
        } => {
            let key = match key {
                Some(key) => key,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .context("Cannot derive an object key from the file name, pass --key")?,
            };
            let options = PutOptions {
                content_type,
                acl,
                metadata: metadata.as_deref().map(parse_metadata).unwrap_or_default(),
                expires: None,
            };

            let pb = progress_bar();
            let result = if sync {
                sync_file(&client, bucket, &key, &file, &options, Some(&pb)).await?
            } else {
                upload_file(&client, bucket, &key, &file, &options, Some(&pb)).await?
            };
            match result {
                UploadResult::Uploaded { size, .. } => println!(
                    "{} {} → s3://{}/{} ({})",
                    style("UPLOADED").green().bold(),
                    file.display(),
                    bucket,
                    key,
                    format_size(size)
                ),
                UploadResult::Skipped => println!(
                    "{} {} (identical)",
                    style("SKIPPED").dim(),
                    file.display()
                ),
            }
        }
        Command::Get { key, output } => {
            let output = output.unwrap_or_else(|| {
                PathBuf::from(key.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("download"))
            });
            let bytes = download_file(&client, bucket, &key, &output).await?;
            println!("Downloaded {} {} bytes", output.display(), bytes);
        }
        Command::Rm { key } => {
            client.delete_object(bucket, &key).await?;
            println!("{:?} in bucket {:?} is deleted", key, bucket);
        }
        Command::Presign {
            key,
            expires_secs,
            put,
        } => {
            let method = if put { Method::PUT } else { Method::GET };
            let presigned = client.presign(method, bucket, &key, Duration::from_secs(expires_secs))?;
            println!("{}", presigned.url);
            println!(
                "{}",
                style(format!(
                    "{} valid until {}",
                    presigned.method,
                    presigned.expires_at.to_rfc3339()
                ))
                .dim()
            );
        }
        Command::Purge { prefix, batch_size } => {
            purge(&client, bucket, prefix, batch_size).await?;
        }
        Command::WaitBucket {
            absent,
            interval,
            timeout,
        } => {
            let config = WaiterConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))?;
            let waiter = Waiter::new(config).with_cancellation(ctrl_c_token());
            let report = if absent {
                waiter.wait_until_bucket_not_exists(&client, bucket).await?
            } else {
                waiter.wait_until_bucket_exists(&client, bucket).await?
            };
            println!(
                "Bucket {:?} is {} after {} check(s) ({:.1}s)",
                bucket,
                if absent { "gone" } else { "available" },
                report.attempts,
                report.elapsed.as_secs_f64()
            );
        }
        Command::Mb => {
            client.create_bucket(bucket).await?;
            println!("Bucket {:?} created", bucket);
        }
    }

    let stats = client.stats();
    info!(
        requests = stats.requests,
        retries = stats.retries,
        failures = stats.failures,
        "done"
    );
    Ok(())
}

/// Upload, download, presign, list, re-upload and delete one object
async fn run_demo(client: &S3Client, bucket: &str, file: &Path) -> Result<()> {
    // S3 overwrites an existing object uploaded under the same key
    let options = PutOptions::default()
        .with_content_type("text/plain")
        .with_acl("public-read")
        .with_expires(chrono::Utc::now() + chrono::TimeDelta::hours(3));

    let pb = progress_bar();
    upload_file(client, bucket, DEMO_KEY, file, &options, Some(&pb))
        .await
        .with_context(|| format!("Unable to upload {:?} to {:?}", file.display(), bucket))?;
    println!("Successfully uploaded {:?} to {:?}", file.display(), bucket);

    let download_to = PathBuf::from(DEMO_DOWNLOAD_TO);
    let bytes = match download_file(client, bucket, DEMO_KEY, &download_to).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let context = match err.downcast_ref::<StorageError>() {
                Some(StorageError::NotFound { code, .. }) if code == "NoSuchBucket" => {
                    format!("bucket {} does not exist", bucket)
                }
                Some(StorageError::NotFound { .. }) => {
                    format!("object with key {} does not exist in bucket {}", DEMO_KEY, bucket)
                }
                _ => format!("Unable to download item {:?}", DEMO_KEY),
            };
            return Err(err.context(context));
        }
    };
    println!("Downloaded {} {} bytes", download_to.display(), bytes);

    let presigned = client
        .presign(Method::GET, bucket, DEMO_KEY, s3kit::s3::DEFAULT_PRESIGN_EXPIRY)
        .context("Got an error retrieving pre-signed object")?;
    println!("Get presigned URL {:?}", presigned.url.as_str());

    let page = client
        .list_objects(&ListRequest::new(bucket))
        .await
        .with_context(|| format!("Unable to list items in bucket {:?}", bucket))?;
    for item in &page.items {
        print_object(item);
    }

    let body = tokio::fs::read(&download_to)
        .await
        .with_context(|| format!("Unable to open file {:?}", download_to.display()))?;
    client
        .put_object(bucket, DEMO_KEY, body, &PutOptions::default())
        .await
        .with_context(|| format!("Could not put {} in bucket {}", DEMO_KEY, bucket))?;
    println!("Put {:?} in bucket {:?} successfully", DEMO_KEY, bucket);

    client
        .delete_object(bucket, DEMO_KEY)
        .await
        .with_context(|| format!("Could not delete {} in bucket {}", DEMO_KEY, bucket))?;
    println!("{:?} in bucket {:?} is deleted", DEMO_KEY, bucket);

    Ok(())
}

async fn list(client: &S3Client, request: ListRequest, json: bool) -> Result<()> {
    let mut paginator = client.paginate(request);
    let (mut objects, mut bytes) = (0usize, 0u64);

    while let Some(page) = paginator.next_page().await? {
        for prefix in &page.common_prefixes {
            if json {
                println!("{}", serde_json::json!({ "prefix": prefix }));
            } else {
                println!("{} {}", style("PRE").cyan(), prefix);
            }
        }
        for item in &page.items {
            objects += 1;
            bytes += item.size;
            if json {
                println!("{}", serde_json::to_string(item)?);
            } else {
                print_object(item);
            }
        }
    }

    if !json {
        println!(
            "{}",
            style(format!(
                "Summary: {} object(s), {} in {} page(s)",
                objects,
                format_size(bytes),
                paginator.pages_fetched()
            ))
            .bold()
        );
    }
    Ok(())
}

async fn purge(client: &S3Client, bucket: &str, prefix: Option<String>, batch_size: usize) -> Result<()> {
    let mut request = ListRequest::new(bucket);
    if let Some(prefix) = prefix {
        request = request.with_prefix(prefix);
    }

    let token = ctrl_c_token();
    let deleter = BatchDeleter::new(client, batch_size)?.with_cancellation(token);
    let identifiers = client.paginate(request).into_identifiers().inspect_ok(|id| {
        tracing::debug!(%id, "queued for deletion");
    });

    let result = deleter.delete_all(identifiers).await?;

    for (id, outcome) in result.failures() {
        println!("{} {} {:?}", style("FAILED").red().bold(), id, outcome);
    }
    println!(
        "{}",
        style(format!(
            "Summary: {} deleted, {} failed{}",
            result.deleted_count(),
            result.failures().count(),
            if result.is_cancelled() { " (cancelled)" } else { "" }
        ))
        .bold()
    );

    if result.is_cancelled() {
        return Err(StorageError::Cancelled.into());
    }
    Ok(())
}

fn print_object(item: &ObjectMetadata) {
    println!("Name:          {}", item.key);
    match item.last_modified {
        Some(modified) => println!("Last modified: {}", modified),
        None => println!("Last modified: -"),
    }
    println!("Size (byte):   {}", item.size);
    println!();
}

/// Cancellation token fired by Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style("Interrupted, finishing the current request...").yellow());
            child.cancel();
        }
    });
    token
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(template) = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
    {
        pb.set_style(template.progress_chars("=>-"));
    }
    pb
}

/// Format file size for display
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Process exit status for a failed run, one per error kind
fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(storage) = err.downcast_ref::<StorageError>() else {
        return 1;
    };
    match storage.kind() {
        ErrorKind::NotFound => 2,
        ErrorKind::AlreadyExists => 3,
        ErrorKind::AuthFailure => 4,
        ErrorKind::Throttled | ErrorKind::Transient => 5,
        ErrorKind::ValidationError => 6,
        ErrorKind::InvalidContinuation => 7,
        ErrorKind::TransportFailure => 8,
        ErrorKind::TimedOut => 9,
        ErrorKind::Cancelled => 130,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_exit_codes() {
        let not_found = anyhow::Error::from(StorageError::NotFound {
            resource: "s3://b/k".to_string(),
            code: "NoSuchKey".to_string(),
        })
        .context("Unable to download item");
        assert_eq!(exit_code(&not_found), 2);
        assert_eq!(exit_code(&StorageError::Cancelled.into()), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("io failure")), 1);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["s3demo", "-b", "logs", "presign", "a.txt", "-e", "60"]).unwrap();
        assert_eq!(cli.bucket.as_deref(), Some("logs"));
        assert!(matches!(cli.command, Command::Presign { expires_secs: 60, put: false, .. }));
    }
}
