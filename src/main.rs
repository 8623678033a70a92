use anyhow::Context;
use clap::Parser;
use datafetch::{DatasetFetcher, FetchConfig, Registry, RetryPolicy, Split};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "datafetch")]
#[command(about = "Download, verify and materialize training datasets", long_about = None)]
#[command(version)]
struct Args {
    /// Dataset identifier (e.g. MNIST, FashionMNIST)
    #[arg(required_unless_present = "list")]
    dataset: Option<String>,

    /// Splits to fetch (comma-separated, e.g. "train,test")
    #[arg(short, long, value_delimiter = ',', default_value = "train,test")]
    split: Vec<Split>,

    /// Destination directory; datasets land in <dest>/<dataset>/<split>
    #[arg(short, long, default_value = "data")]
    dest: PathBuf,

    /// JSON dataset table to use instead of the built-in one
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Retries per URL after the first attempt
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// First backoff delay, doubled on every retry (e.g. "1s", "500ms")
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    backoff: Duration,

    /// Timeout for connecting and for every read of a response
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// How long to wait for another process fetching the same target
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    lock_timeout: Duration,

    /// Randomize backoff delays
    #[arg(long)]
    jitter: bool,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,

    /// List known datasets and exit
    #[arg(long)]
    list: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("datafetch={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if let Err(e) = run(args).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let registry = match &args.registry {
        Some(path) => Registry::from_json_file(path)
            .with_context(|| format!("loading dataset registry {}", path.display()))?,
        None => Registry::builtin(),
    };

    if args.list {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let dataset = args.dataset.context("no dataset given")?;

    let config = FetchConfig {
        retry: RetryPolicy {
            max_retries: args.retries,
            base_delay: args.backoff,
            jitter: args.jitter,
            ..RetryPolicy::default()
        },
        request_timeout: args.timeout,
        connect_timeout: args.timeout,
        lock_timeout: args.lock_timeout,
        show_progress: !args.no_progress,
        ..FetchConfig::default()
    };

    info!("🚀 DataFetch - Dataset Downloader");
    info!("Dataset: {}", dataset);
    info!("Splits: {:?}", args.split);
    info!("Destination: {:?}", args.dest);

    let fetcher = DatasetFetcher::new(registry, config).context("building HTTP client")?;

    let mut splits = args.split.clone();
    splits.dedup();
    for split in splits {
        let acquired = fetcher
            .acquire(&dataset, split, &args.dest)
            .await
            .with_context(|| format!("acquiring {} {}", dataset, split))?;

        if acquired.fetched {
            info!(
                "✅ {} {} ready at {} ({} bytes fetched)",
                dataset,
                split,
                acquired.path.display(),
                acquired.bytes_fetched
            );
        } else {
            info!("✅ {} {} already present at {}", dataset, split, acquired.path.display());
        }
        println!("{}", acquired.path.display());
    }

    Ok(())
}
