//! devicelab CLI - run mobile test matrices on Firebase Test Lab.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use devicelab::config::{self, AppConfig, Config};
use devicelab::model::Platform;
use devicelab::orchestrator::{Orchestrator, RunSettings};
use devicelab::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use devicelab::service::HttpTestLabClient;
use devicelab::storage::GsutilStore;

/// Exit code for runs aborted by a fatal error.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "devicelab")]
#[command(about = "Run mobile test matrices on Firebase Test Lab", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devicelab.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the test matrix and wait for the verdict
    Run {
        /// Return as soon as the results link is available
        #[arg(long = "async")]
        async_mode: bool,

        /// Override the project id
        #[arg(long)]
        project: Option<String>,

        /// Download result files after the run
        #[arg(long)]
        download: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Platform under test (ios, android)
        #[arg(short, long, default_value = "ios")]
        platform: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run {
            async_mode,
            project,
            download,
            junit,
        } => {
            let overrides = Overrides {
                async_mode,
                project,
                download,
            };
            run(&cli.config, overrides, junit, cli.verbose).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { platform } => init_config(&cli.config, &platform),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

/// Command-line overrides applied on top of the config file.
struct Overrides {
    async_mode: bool,
    project: Option<String>,
    download: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if self.async_mode {
            config.job.async_mode = true;
        }
        if let Some(project) = self.project {
            config.lab.project = project;
        }
        if self.download {
            config.download.enabled = true;
        }
    }
}

async fn run(
    config_path: &Path,
    overrides: Overrides,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);

    info!("Loaded configuration from {}", config_path.display());

    let plan = config::validate(&config)?;
    let settings = RunSettings::from_config(&config);
    let service = HttpTestLabClient::from_config(&config.lab, &config.auth)?;
    let store = GsutilStore::new(&config.storage.gsutil);
    let reporter = create_reporter(&config, junit_path, verbose);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            on_interrupt.cancel();
        }
    });

    let orchestrator =
        Orchestrator::new(plan, settings, service, store, reporter).with_cancellation(cancel);

    match orchestrator.run().await {
        Ok(outcome) => Ok(outcome.exit_code()),
        Err(e) => {
            // Already shown by the console reporter.
            debug!("Run aborted ({:?}): {}", e.kind(), e);
            Ok(EXIT_FATAL)
        }
    }
}

fn validate_config(config_path: &Path) -> Result<i32> {
    let config = config::load_config(config_path)?;
    let plan = config::validate(&config)?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Project:   {}", plan.project);
    println!("  Platform:  {}", plan.platform());
    println!("  Timeout:   {}s", plan.timeout.as_secs());
    println!(
        "  Bucket:    {}",
        plan.bucket.as_deref().unwrap_or("(project default)")
    );
    println!("  Async:     {}", plan.flags.async_mode);
    println!("  Devices:");
    for device in &plan.devices {
        println!(
            "    {} {} ({}, {})",
            device.model, device.version, device.locale, device.orientation
        );
    }
    if let AppConfig::Android(android) = &config.app
        && !android.test_targets.is_empty()
    {
        println!("  Targets:   {}", android.test_targets.join(", "));
    }

    Ok(0)
}

fn init_config(path: &Path, platform: &str) -> Result<i32> {
    let platform = match platform {
        "ios" => Platform::Ios,
        "android" => Platform::Android,
        other => bail!("Unknown platform: {other}. Use: ios, android"),
    };

    let (app_config, device_config) = match platform {
        Platform::Ios => (
            r#"[app]
platform = "ios"
# Zipped XCTest bundle: a local path or a gs:// reference
test_bundle = "build/MyAppTests.zip"
# xcode_version = "14.3""#,
            r#"[[job.devices]]
model = "iphone13pro"
version = "15.7"
locale = "en_US"
orientation = "portrait""#,
        ),
        Platform::Android => (
            r#"[app]
platform = "android"
app_apk = "app/build/outputs/apk/debug/app-debug.apk"
test_apk = "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk"
# test_targets = ["class com.example.LoginTest"]"#,
            r#"[[job.devices]]
model = "redfin"
version = "30"
locale = "en_US"
orientation = "portrait""#,
        ),
    };

    let config = format!(
        r#"# devicelab configuration file

[lab]
project = "my-firebase-project"
poll_interval_secs = 15
# max_wait_secs = 3600

[auth]
token_env = "DEVICELAB_ACCESS_TOKEN"
# token_command = "gcloud auth print-access-token"

{app_config}

[job]
timeout_secs = 900
disable_video = false
disable_metrics = false
retry_on_failure = false
async = false

{device_config}

[storage]
# bucket = "my-results-bucket"
results_prefix = "devicelab-"

[download]
enabled = false
files = []
output_dir = "test-results/firebase"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#
    );

    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  devicelab run");

    Ok(0)
}

fn create_reporter(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));

    let junit_path = match junit_override {
        Some(path) => Some(path),
        None if config.report.junit => {
            Some(config.report.output_dir.join(&config.report.junit_file))
        }
        None => None,
    };
    if let Some(path) = junit_path {
        multi = multi.with_reporter(JUnitReporter::new(path));
    }

    multi
}
