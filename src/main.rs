//! iv_daq command-line entry point.
//!
//! ```text
//! iv_daq iv                          # full IV curve on the configured port
//! iv_daq bins data/IVdata_....txt    # segment a raw log into bin files
//! iv_daq fit bins/run/a_215v.csv --model exp
//! iv_daq config                      # print the effective configuration
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use iv_daq::analysis::{fit_bin_exponential, fit_bin_linear, timed_linear_fit, FitModel};
use iv_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use iv_daq::data::{read_bin_file, segment, BinStore, SampleLog};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iv_daq")]
#[command(about = "IV-curve acquisition and bin analysis for SCPI source-measure units")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full IV curve and write the raw logs
    Iv {
        /// Serial port, overriding the configuration
        #[arg(short, long)]
        port: Option<String>,

        /// Run name, overriding the configuration
        #[arg(long)]
        run_name: Option<String>,
    },

    /// Segment a raw log and store its bins
    Bins {
        /// Raw whitespace-delimited log
        log: PathBuf,

        /// Run name for the bin directory (default: log file stem)
        #[arg(long)]
        run_name: Option<String>,

        /// Also store the first and last runs of the log
        #[arg(long)]
        boundary: bool,
    },

    /// Fit one stored bin
    Fit {
        /// Bin file, e.g. bins/<run>/a_215v.csv
        bin: PathBuf,

        /// Model: exp or linear
        #[arg(short, long, default_value = "exp")]
        model: FitModel,

        /// Window start in seconds (linear only)
        #[arg(long)]
        t_start: Option<f64>,

        /// Window end in seconds (linear only)
        #[arg(long)]
        t_stop: Option<f64>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command {
        Command::Iv { port, run_name } => run_iv(settings, port, run_name).await,
        Command::Bins {
            log,
            run_name,
            boundary,
        } => run_bins(&settings, log, run_name, boundary),
        Command::Fit {
            bin,
            model,
            t_start,
            t_stop,
        } => run_fit(&settings, bin, model, t_start, t_stop),
        Command::Config => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

#[cfg(feature = "instrument_serial")]
async fn run_iv(mut settings: Settings, port: Option<String>, run_name: Option<String>) -> Result<()> {
    use iv_daq::adapters::SerialTransport;
    use iv_daq::instrument::InstrumentSession;
    use iv_daq::ramp::RampController;
    use std::time::Duration;

    if let Some(port) = port {
        settings.instrument.port = port;
    }
    if run_name.is_some() {
        settings.storage.run_name = run_name;
    }
    let run_name = settings.run_name(Local::now());
    let ramp = settings.ramp_config();

    let transport = SerialTransport::from_config(&settings.instrument);
    let mut session = InstrumentSession::connect(transport)
        .await
        .with_context(|| format!("Failed to open {}", settings.instrument.port))?
        .with_preserved_sense(settings.instrument.preserve_sense_on_raw_write);

    info!("Starting IV run '{}'", run_name);
    let controller = RampController::new();
    let curve = match controller.make_iv_curve(&mut session, &ramp).await {
        Ok(curve) => curve,
        Err(err) => {
            tracing::error!("IV curve failed: {}; ramping output down", err);
            if let Err(shutdown) = controller
                .ramp_to_zero(&mut session, ramp.step_voltage.abs(), Duration::from_millis(500))
                .await
            {
                tracing::error!("Shutdown ramp failed: {}", shutdown);
            }
            return Err(err).context("IV curve aborted");
        }
    };
    session.close().await?;

    let data_dir = &settings.storage.data_dir;
    let combined = curve.combined();
    for (suffix, log) in [("up", &curve.up), ("down", &curve.down), ("all", &combined)] {
        let path = data_dir.join(format!("{}_{}.txt", run_name, suffix));
        log.write_table(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} samples to {}", log.len(), path.display());
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
async fn run_iv(_settings: Settings, _port: Option<String>, _run_name: Option<String>) -> Result<()> {
    anyhow::bail!("iv_daq was built without the instrument_serial feature")
}

fn run_bins(settings: &Settings, log: PathBuf, run_name: Option<String>, boundary: bool) -> Result<()> {
    let samples = SampleLog::load_table(&log, settings.analysis.current_scale)
        .with_context(|| format!("Failed to read raw log {}", log.display()))?;

    let run_name = run_name
        .or_else(|| {
            log.file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| settings.run_name(Local::now()));

    let segmentation = segment(&samples, &settings.segment_options());
    let store = BinStore::new(&settings.storage.bin_dir, &run_name);
    let report = store.save(&segmentation, boundary)?;

    println!(
        "{} bins written to {}",
        report.written.len(),
        store.dir().display()
    );
    for warning in segmentation.warnings.iter().chain(&report.warnings) {
        println!("warning: {}", warning);
    }
    Ok(())
}

fn run_fit(
    settings: &Settings,
    bin: PathBuf,
    model: FitModel,
    t_start: Option<f64>,
    t_stop: Option<f64>,
) -> Result<()> {
    let bin = read_bin_file(&bin, &settings.load_options())
        .with_context(|| format!("Failed to load bin {}", bin.display()))?;
    println!("{} bin at {} V, {} samples", bin.direction, bin.voltage, bin.len());

    match model {
        FitModel::Exponential => {
            let fit = fit_bin_exponential(&bin, &settings.exponential_options())?;
            let p = &fit.result.parameters;
            println!("a = {:e}, b = {:e}, c = {:e}", p[0], p[1], p[2]);
            println!("tau = {:e} s, settled current = {:e}", 1.0 / p[1], p[2]);
            println!("initial guess = {:?}", fit.initial_guess);
        }
        FitModel::Linear => {
            let (fit, reached_end) = match (t_start, t_stop) {
                (None, None) => (fit_bin_linear(&bin)?, true),
                (start, stop) => timed_linear_fit(
                    &bin,
                    start.unwrap_or(f64::NEG_INFINITY),
                    stop.unwrap_or(f64::INFINITY),
                )?,
            };
            let p = &fit.parameters;
            println!("m = {:e}, b = {:e}", p[0], p[1]);
            println!(
                "window {:?} s{}",
                fit.source_interval,
                if reached_end { " (end of bin)" } else { "" }
            );
        }
    }
    Ok(())
}
