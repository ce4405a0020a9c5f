//! archdisk - main entry point
//!
//! Parses the command line, loads settings, and dispatches to the library.
//! Reports go to stdout; logs and errors go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use archdisk::cache::{cache_env, ensure_cache_dirs, resolve_cache_root};
use archdisk::cli::{CacheCommands, Cli, Commands, PlanCommands, RepairCommands};
use archdisk::device::system::SystemDevices;
use archdisk::error::{EXIT_OK, EXIT_VALIDATION, ProvisionError, Result};
use archdisk::executor::{ApplyOptions, ConfirmationToken, apply, dry_run};
use archdisk::interrupt::{InterruptFlag, install_signal_handlers};
use archdisk::plan::{Plan, validate};
use archdisk::preflight::run_preflight;
use archdisk::repair::repair_home;
use archdisk::settings::Settings;
use archdisk::verify::{verify_plan, verify_system};

/// Initialize tracing with appropriate settings
fn init_logger(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG overrides the -v level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli.command);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // anyhow stops here; everything past this point is ProvisionError
            let err = ProvisionError::config(format!("{:#}", e));
            report_error(&err);
            return exit(err.exit_code());
        }
    };

    match run(cli.command, &settings) {
        Ok(code) => exit(code),
        Err(e) => {
            report_error(&e);
            exit(e.exit_code())
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Print the failing step, exact command and remediation to stderr.
fn report_error(err: &ProvisionError) {
    eprintln!();
    eprintln!("ERROR: {}", err.root_cause());
    if let Some(step) = err.step() {
        eprintln!("   Step:    {}", step);
    }
    if let Some(command) = err.failed_command() {
        eprintln!("   Command: {}", command);
    }
    eprintln!("   Fix:     {}", err.remediation());
    eprintln!();
}

fn run(command: Commands, settings: &Settings) -> Result<i32> {
    match command {
        Commands::Plan { action } => run_plan(action, settings),
        Commands::Verify { plan, root, json } => {
            let devices = SystemDevices::new();
            let report = match load_optional_plan(plan.as_deref())? {
                Some(plan) => verify_plan(&plan, &devices, settings, root.as_deref())?,
                None => verify_system(&devices, settings, root.as_deref())?,
            };
            if json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", report.to_text());
            }
            report.ensure_passed()?;
            Ok(EXIT_OK)
        }
        Commands::Repair {
            target: RepairCommands::Home { plan, root, confirm },
        } => {
            let plan = load_optional_plan(plan.as_deref())?;
            let mut devices = SystemDevices::new();
            if confirm {
                ConfirmationToken::confirm("repair home --confirm");
            }
            let report = repair_home(plan.as_ref(), &mut devices, settings, root.as_deref(), confirm)?;
            println!("{}", report.to_text());
            Ok(EXIT_OK)
        }
        Commands::Cache {
            action: CacheCommands::Env { plan, root, create },
        } => {
            let plan = load_optional_plan(plan.as_deref())?;
            let root = root.unwrap_or_else(|| PathBuf::from("/"));
            let cache_root = resolve_cache_root(plan.as_ref(), settings, &root);
            let mut devices = SystemDevices::new();
            let env = cache_env(&devices, &cache_root)?;
            if create {
                let created = ensure_cache_dirs(&mut devices, &env)?;
                info!("created {} cache directories", created.len());
            }
            print!("{}", env.render_exports());
            Ok(EXIT_OK)
        }
        Commands::Preflight { skip_root } => {
            let report = run_preflight(skip_root);
            println!("{}", report.to_text());
            Ok(if report.is_ok() { EXIT_OK } else { EXIT_VALIDATION })
        }
    }
}

fn run_plan(action: PlanCommands, settings: &Settings) -> Result<i32> {
    match action {
        PlanCommands::Validate { plan } => {
            info!("Validating plan: {:?}", plan);
            let loaded = Plan::load_from_file(&plan)?;
            validate(&loaded, &SystemDevices::new())?;
            println!("Plan is valid: {}", plan.display());
            Ok(EXIT_OK)
        }
        PlanCommands::Show { plan, json } => {
            let loaded = Plan::load_from_file(&plan)?;
            let storage = dry_run(&loaded, &SystemDevices::new(), settings)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&storage)?);
            } else {
                println!("{}", storage.summary());
            }
            Ok(EXIT_OK)
        }
        PlanCommands::Apply {
            plan,
            confirm,
            force,
            key_file,
        } => {
            let loaded = Plan::load_from_file(&plan)?;
            let interrupt = InterruptFlag::new();
            if let Err(e) = install_signal_handlers(&interrupt) {
                warn!("Failed to install signal handlers: {}", e);
            }

            let passphrase = passphrase_from_env(settings, key_file.as_deref());
            let options = ApplyOptions {
                confirmation: confirm.then(|| ConfirmationToken::confirm("plan apply --confirm")),
                force,
                key_file,
                passphrase,
                interrupt: Some(interrupt),
            };

            let mut devices = SystemDevices::new();
            let report = apply(&loaded, &mut devices, settings, &options)?;
            println!("{}", report.summary());
            Ok(EXIT_OK)
        }
    }
}

/// The passphrase variable, unless a keyfile was given.
fn passphrase_from_env(settings: &Settings, key_file: Option<&Path>) -> Option<String> {
    if key_file.is_some() {
        return None;
    }
    std::env::var(&settings.passphrase_env)
        .ok()
        .filter(|v| !v.is_empty())
}

fn load_optional_plan(path: Option<&Path>) -> Result<Option<Plan>> {
    path.map(Plan::load_from_file).transpose()
}
