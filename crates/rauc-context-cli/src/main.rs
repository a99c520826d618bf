use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rauc_context::{ConfigMode, Context, ContextView, SystemConfig};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rauc-context")]
#[command(about = "Resolve the update context of this system and print it")]
struct Args {
    /// System configuration file (must exist when given)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How to treat the default configuration file
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    config_mode: ModeArg,

    /// Mount prefix override
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Keyring file override
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Keyring directory override
    #[arg(long)]
    keyring_directory: Option<PathBuf>,

    /// Booted slot, skipping command line detection
    #[arg(long)]
    override_boot_slot: Option<String>,

    /// Kernel command line to use instead of /proc/cmdline
    #[arg(long)]
    cmdline: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output_format: OutputFormat,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    None,
    Auto,
    Required,
}

impl From<ModeArg> for ConfigMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::None => ConfigMode::None,
            ModeArg::Auto => ConfigMode::Auto,
            ModeArg::Required => ConfigMode::Required,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Resolved context as printed.
#[derive(Serialize)]
struct Status<'a> {
    config_path: Option<&'a std::path::Path>,
    boot_slot: Option<&'a str>,
    system_serial: Option<&'a str>,
    config: &'a SystemConfig,
}

impl<'a> From<ContextView<'a>> for Status<'a> {
    fn from(view: ContextView<'a>) -> Self {
        Self {
            config_path: view.config_path(),
            boot_slot: view.boot_slot(),
            system_serial: view.system_serial(),
            config: view.config(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "rauc_context={},rauc_context_cli={}",
            args.log_level, args.log_level
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut builder = Context::builder().with_config_mode(args.config_mode.into());
    if let Some(path) = args.config {
        builder = builder.with_config_path(path);
    }
    if let Some(prefix) = args.mount {
        builder = builder.with_mount_prefix(prefix);
    }
    if let Some(keyring) = args.keyring {
        builder = builder.with_keyring_path(keyring);
    }
    if let Some(directory) = args.keyring_directory {
        builder = builder.with_keyring_directory(directory);
    }
    if let Some(slot) = args.override_boot_slot {
        builder = builder.with_boot_slot(slot);
    }
    if let Some(cmdline) = args.cmdline {
        builder = builder.with_cmdline(cmdline);
    }

    let mut context = builder.build()?;
    let view = match context.read() {
        Ok(view) => view,
        Err(e) => {
            error!("Failed to resolve context: {}", e);
            return Err(e.into());
        }
    };
    info!("Context resolved");

    let status = Status::from(view);
    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print_text(&status),
    }

    Ok(())
}

fn print_text(status: &Status<'_>) {
    fn or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
        value.map_or_else(|| "-".to_string(), |v| v.to_string())
    }

    let config = status.config;
    println!("config file:    {}", or_dash(status.config_path.map(|p| p.display())));
    println!("compatible:     {}", or_dash(config.compatible.as_deref()));
    println!("bootloader:     {}", or_dash(config.bootloader.as_deref()));
    println!("variant:        {}", or_dash(config.system_variant.as_deref()));
    println!("serial:         {}", or_dash(status.system_serial));
    println!("booted slot:    {}", or_dash(status.boot_slot));
    println!("mount prefix:   {}", config.mount_prefix.display());
    println!(
        "keyring:        {}",
        or_dash(config.keyring_path.as_deref().map(|p| p.display()))
    );
    println!(
        "keyring dir:    {}",
        or_dash(config.keyring_directory.as_deref().map(|p| p.display()))
    );
}
