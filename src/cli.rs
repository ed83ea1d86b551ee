//! Command line surface.
//!
//! Subcommands mirror the lifecycle of a detection project: print a
//! default config, run or continue a search, re-run post-processors,
//! derive station corrections, inspect pluggable modules and maintain
//! the process-wide cache.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::QSeekError;
use crate::schemas;
use crate::search::{Search, SearchConfig};
use crate::util::CacheDir;

#[derive(Parser)]
#[command(
    name = "qseek",
    version,
    about = "qseek - earthquake detection and localisation"
)]
struct Cli {
    /// Increase verbosity of the log messages, repeat to increase.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a new default configuration.
    Config,
    /// Detect, localize and characterize earthquakes in a dataset.
    Search {
        /// Path to the configuration file.
        config: PathBuf,
        /// Backup an existing rundir and create a new one.
        #[arg(long)]
        force: bool,
    },
    /// Continue an aborted run from an existing rundir.
    Continue {
        /// Existing rundir to continue.
        rundir: PathBuf,
    },
    /// Re-run magnitude and feature extraction on an existing run.
    FeatureExtraction {
        /// Path of the existing run.
        rundir: PathBuf,
    },
    /// Derive station corrections from a finished run.
    Corrections {
        /// Path of the existing run.
        rundir: PathBuf,
    },
    /// List available modules.
    Modules {
        /// Print the named module's default JSON configuration.
        #[arg(short, long)]
        json: Option<String>,
    },
    /// Clear the cache directory.
    ClearCache,
    /// Dump JSON schemas of the persisted models.
    DumpSchemas {
        /// Folder to dump the schemas to.
        folder: PathBuf,
    },
}

/// File writer that can be attached after logging is initialized, once
/// the run directory is known. Events before that go to the console only.
#[derive(Clone, Default)]
struct LateFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl LateFileWriter {
    fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().expect("log file lock") = Some(file);
        Ok(())
    }
}

struct LateFileHandle(Arc<Mutex<Option<File>>>);

impl Write for LateFileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock().expect("log file lock").as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock().expect("log file lock").as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LateFileWriter {
    type Writer = LateFileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        LateFileHandle(self.inner.clone())
    }
}

fn setup_logging(verbose: u8, file_writer: LateFileWriter) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("qseek={level},{level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
}

/// Entry point used by the binary.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = LateFileWriter::default();
    setup_logging(cli.verbose, log_file.clone());

    let cache_dir = CacheDir::default_location();

    match cli.command {
        Command::Config => {
            let config = SearchConfig::default();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Command::Search { config, force } => {
            let mut search = Search::from_config(&config, cache_dir)
                .with_context(|| format!("loading config {}", config.display()))?;
            search.init_rundir(force)?;
            log_file.attach(&search.rundir()?.join("qseek.log"))?;
            run_search(search).await?;
        }

        Command::Continue { rundir } => {
            let mut search = Search::load_rundir(&rundir, cache_dir)
                .with_context(|| format!("loading rundir {}", rundir.display()))?;
            log_file.attach(&rundir.join("qseek.log"))?;
            match search.progress().time_progress {
                Some(time) => info!("continuing search from {time}"),
                None => info!("starting search from scratch"),
            }
            run_search(search).await?;
        }

        Command::FeatureExtraction { rundir } => {
            let mut search = Search::load_rundir(&rundir, cache_dir)?;
            log_file.attach(&rundir.join("qseek.log"))?;
            search.extract_features().await?;
        }

        Command::Corrections { rundir } => {
            let search = Search::load_rundir(&rundir, cache_dir)?;
            let path = search.derive_corrections()?;
            println!("wrote corrections config to {}", path.display());
            println!("to use it, run `qseek search {}`", path.display());
        }

        Command::Modules { json } => match json {
            Some(name) => match module_default_json(&name) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("unknown module: {name}"),
            },
            None => {
                for (kind, modules) in MODULE_KINDS {
                    println!("{kind}:");
                    for module in *modules {
                        println!("  {module}");
                    }
                }
            }
        },

        Command::ClearCache => {
            info!("clearing cache directory {}", cache_dir.root().display());
            cache_dir.clear()?;
        }

        Command::DumpSchemas { folder } => {
            if !folder.exists() {
                bail!("folder {} does not exist", folder.display());
            }
            let file = folder.join("search.schema.json");
            println!("writing JSON schemas to {}", folder.display());
            std::fs::write(
                &file,
                serde_json::to_string_pretty(&schemas::search_config_schema())?,
            )?;
            std::fs::write(
                folder.join("detections.schema.json"),
                serde_json::to_string_pretty(&schemas::detections_schema())?,
            )?;
        }
    }
    Ok(())
}

async fn run_search(mut search: Search) -> anyhow::Result<()> {
    match search.start().await {
        Ok(()) => Ok(()),
        Err(QSeekError::Cancelled) => {
            info!("search cancelled, progress has been saved");
            bail!("search cancelled")
        }
        Err(error) => Err(error.into()),
    }
}

const MODULE_KINDS: &[(&str, &[&str])] = &[
    ("WaveformProvider", &["synthetic"]),
    ("ImageFunction", &["envelope", "sta-lta"]),
    ("RayTracer", &["cake", "fast-marching"]),
    ("StationCorrections", &["constant"]),
    ("MagnitudeCalculator", &["local"]),
    ("FeatureExtractor", &["waveform-amplitudes"]),
];

fn module_default_json(name: &str) -> Option<serde_json::Value> {
    use crate::corrections::{ConstantCorrections, StationCorrections};
    use crate::image::{EnvelopeFunction, ImageFunction, StaLtaFunction};
    use crate::postprocess::{
        FeatureExtractor, LocalMagnitude, MagnitudeCalculator, WaveformAmplitudes,
    };
    use crate::provider::{SyntheticProvider, WaveformProvider};
    use crate::traveltime::{CakeTracer, FastMarchingTracer, RayTracer};

    let value = match name {
        "synthetic" => {
            serde_json::to_value(WaveformProvider::Synthetic(SyntheticProvider::default()))
        }
        "envelope" => serde_json::to_value(ImageFunction::Envelope(EnvelopeFunction {
            phase: "cake:P".to_string(),
            weight: 1.0,
            blinding_seconds: 0.5,
            channel_selector: String::new(),
        })),
        "sta-lta" => serde_json::to_value(ImageFunction::StaLta(StaLtaFunction {
            phase: "cake:P".to_string(),
            weight: 1.0,
            blinding_seconds: 2.0,
            channel_selector: String::new(),
            short_window_seconds: 0.5,
            long_window_seconds: 5.0,
        })),
        "cake" => serde_json::to_value(RayTracer::Cake(CakeTracer::default())),
        "fast-marching" => {
            serde_json::to_value(RayTracer::FastMarching(FastMarchingTracer::default()))
        }
        "constant" => serde_json::to_value(StationCorrections::Constant(
            ConstantCorrections::default(),
        )),
        "local" => {
            serde_json::to_value(MagnitudeCalculator::Local(LocalMagnitude::default()))
        }
        "waveform-amplitudes" => serde_json::to_value(FeatureExtractor::WaveformAmplitudes(
            WaveformAmplitudes::default(),
        )),
        _ => return None,
    };
    value.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_listed_modules_have_default_json() {
        for (_, modules) in MODULE_KINDS {
            for module in *modules {
                let value = module_default_json(module).unwrap();
                assert!(value.is_object(), "module {module} default is not an object");
            }
        }
    }

    #[test]
    fn test_unknown_module_yields_none() {
        assert!(module_default_json("bogus").is_none());
    }

    #[test]
    fn test_cli_parses_search_command() {
        let cli = Cli::try_parse_from(["qseek", "search", "config.json", "--force"]).unwrap();
        match cli.command {
            Command::Search { config, force } => {
                assert_eq!(config, PathBuf::from("config.json"));
                assert!(force);
            }
            _ => panic!("wrong command"),
        }
    }
}
