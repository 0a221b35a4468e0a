use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use load_atoms::api::{DatasetInput, Loader};
use load_atoms::config::SettingsLoader;
use load_atoms::domain::DatasetId;
use load_atoms::error::LoadAtomsError;
use load_atoms::extxyz;
use load_atoms::output::{HumanOutput, JsonOutput, OutputMode};
use load_atoms::progress::Verbosity;

#[derive(Parser)]
#[command(name = "load-atoms")]
#[command(about = "Download, verify, process and cache atomistic datasets by name")]
#[command(version, author)]
struct Cli {
    /// Settings file (default: ./load-atoms.json if present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Cache root (default: ~/.load-atoms)
    #[arg(long, global = true)]
    root: Option<Utf8PathBuf>,

    /// 0 silent, 1 plain progress, 2 rich progress
    #[arg(long, short, global = true)]
    verbose: Option<u8>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load a dataset by name, or a local structure file")]
    Load(LoadArgs),
    #[command(about = "Show a dataset's description without downloading it")]
    Info(InfoArgs),
    #[command(about = "List datasets cached under the root")]
    List,
}

#[derive(Args)]
struct LoadArgs {
    /// Dataset identifier or path to a local file/directory
    target: String,

    /// Rebuild even if a cached copy exists
    #[arg(long)]
    force: bool,

    /// Keep downloaded and intermediate files
    #[arg(long)]
    keep_raw: bool,

    /// Also write the structures to an extended XYZ file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct InfoArgs {
    id: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<LoadAtomsError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &LoadAtomsError) -> u8 {
    match error {
        LoadAtomsError::NotFound(_) | LoadAtomsError::PathNotFound(_) => 2,
        LoadAtomsError::Network { .. } | LoadAtomsError::NetworkStatus { .. } => 3,
        LoadAtomsError::Integrity { .. } | LoadAtomsError::IncompatibleVersion { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = SettingsLoader::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        settings.root = Some(root);
    }
    if let Some(level) = cli.verbose {
        settings.verbosity = Verbosity::try_from(level).map_err(LoadAtomsError::ConfigParse)?;
    }
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Load(args) => {
            if args.keep_raw {
                settings.debug = true;
            }
            let loader = Loader::from_settings(settings)?;
            let input = DatasetInput::parse(&args.target)?;
            let outcome = loader.load(input, args.force)?;

            if let Some(path) = &args.output {
                let structures = outcome.dataset.to_vec()?;
                let mut writer = BufWriter::new(File::create(path).into_diagnostic()?);
                extxyz::write_frames(&mut writer, &structures).into_diagnostic()?;
                writer.flush().into_diagnostic()?;
                tracing::info!(path = %path.display(), count = structures.len(), "wrote extxyz");
            }

            let summary = outcome.summary(&args.target)?;
            match mode {
                OutputMode::Json => JsonOutput::print_load(&summary).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_load(&summary).into_diagnostic(),
            }
        }
        Commands::Info(args) => {
            let id: DatasetId = args.id.parse()?;
            let loader = Loader::from_settings(settings)?;
            let info = loader.info(&id)?;
            match mode {
                OutputMode::Json => JsonOutput::print_info(&info).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_info(&info).into_diagnostic(),
            }
        }
        Commands::List => {
            let loader = Loader::from_settings(settings)?;
            let list = loader.list()?;
            match mode {
                OutputMode::Json => JsonOutput::print_list(&list).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_list(&list).into_diagnostic(),
            }
        }
    }
}
