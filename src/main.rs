//! CLI entry point for dielectric_daq.
//!
//! ```bash
//! dielectric_daq discover
//! dielectric_daq correct open
//! dielectric_daq sweep --output data/film.dat
//! dielectric_daq --simulate sweep
//! ```
//!
//! Ctrl-C cancels a running sweep or correction. Samples already written stay
//! in the output file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dielectric_daq::acquisition::{AcquisitionController, RunSummary, TracingPlot};
use dielectric_daq::config::{self, AppConfig};
use dielectric_daq::error::{AppResult, DaqError};
use dielectric_daq::gpib::simulator::simulated_bench;
use dielectric_daq::gpib::GpibBus;
use dielectric_daq::instrument::{discover, Hp4284a, LakeShore330};
use dielectric_daq::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dielectric_daq")]
#[command(about = "Dielectric spectroscopy with an HP4284A LCR meter over GPIB", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = config::DEFAULT_PATH)]
    config: PathBuf,

    /// Use a simulated bench instead of the GPIB hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the instruments on the bus
    Discover,

    /// Run a frequency sweep
    Sweep {
        /// Output file (default: timestamped file in the output directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Measure open or short compensation data
    Correct {
        #[arg(value_enum)]
        kind: CorrectionArg,
    },

    /// Read or control the temperature controller
    Temperature {
        /// New setpoint in K
        #[arg(long)]
        setpoint: Option<f64>,

        /// Ramp rate in K/min towards the setpoint
        #[arg(long, requires = "setpoint")]
        ramp: Option<f64>,

        /// Heater range 1-3, or 0 to switch the heater off
        #[arg(long)]
        heater: Option<u8>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum CorrectionArg {
    Open,
    Short,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Cannot load configuration from {}", cli.config.display()))?;
    logging::init(&config.application.log_level, &config.application.log_format)?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Discover => run_discover(&config, open_bus(&config, cli.simulate)?).await,
        Commands::Sweep { output } => {
            run_sweep(&config, open_bus(&config, cli.simulate)?, output).await
        }
        Commands::Correct { kind } => {
            run_correction(&config, open_bus(&config, cli.simulate)?, kind).await
        }
        Commands::Temperature {
            setpoint,
            ramp,
            heater,
        } => {
            run_temperature(
                &config,
                open_bus(&config, cli.simulate)?,
                setpoint,
                ramp,
                heater,
            )
            .await
        }
    }
}

fn open_bus(config: &AppConfig, simulate: bool) -> AppResult<Box<dyn GpibBus>> {
    if simulate {
        info!("Using simulated bench");
        return Ok(Box::new(simulated_bench(
            config.gpib.lcr_address,
            config.gpib.thermostat_address,
        )));
    }
    hardware_bus()
}

#[cfg(feature = "instrument_visa")]
fn hardware_bus() -> AppResult<Box<dyn GpibBus>> {
    Ok(Box::new(dielectric_daq::gpib::visa::VisaBus::new()?))
}

#[cfg(not(feature = "instrument_visa"))]
fn hardware_bus() -> AppResult<Box<dyn GpibBus>> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
}

/// Adds the advice a user needs for the errors the boundary handles.
fn explain(error: DaqError) -> anyhow::Error {
    let hint = match &error {
        DaqError::DeviceNotPresent { board, address } => Some(format!(
            "Nothing answered at GPIB{} address {}. Check the cable, power and the address in the configuration.",
            board, address
        )),
        DaqError::File { path, .. } => Some(format!(
            "Cannot write {}. Choose another output directory or file name.",
            path.display()
        )),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(error).context(hint),
        None => anyhow::Error::new(error),
    }
}

/// Watch channel flipped to `true` on Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn open_meter(config: &AppConfig, bus: Box<dyn GpibBus>) -> Result<Arc<Mutex<Hp4284a>>> {
    let mut meter = Hp4284a::new(bus, config.gpib.board, config.gpib.lcr_address)
        .with_timeout(config.gpib.timeout)
        .with_settle_delay(config.gpib.settle)
        .with_averages(config.lcr.averages);
    meter.open().await.map_err(explain)?;
    Ok(Arc::new(Mutex::new(meter)))
}

async fn close_meter(meter: &Mutex<Hp4284a>) {
    if let Err(e) = meter.lock().await.close().await {
        warn!("Closing the LCR meter failed: {}", e);
    }
}

fn print_summary(summary: &RunSummary) {
    if summary.cancelled {
        println!("{} cancelled", summary.operation);
    } else {
        println!("{} complete", summary.operation);
    }
    if let Some(path) = &summary.output {
        println!(
            "{} points measured, {} written, {} skipped -> {}",
            summary.points,
            summary.accepted,
            summary.skipped,
            path.display()
        );
    }
}

async fn run_discover(config: &AppConfig, mut bus: Box<dyn GpibBus>) -> Result<()> {
    let found = discover(bus.as_mut(), config.gpib.board)
        .await
        .map_err(explain)?;
    if found.is_empty() {
        println!("No instruments on GPIB{}", config.gpib.board);
    }
    for instrument in &found {
        println!(
            "{:>3}  {:<40} {}",
            instrument.address, instrument.kind, instrument.identity
        );
    }
    Ok(())
}

async fn run_sweep(
    config: &AppConfig,
    bus: Box<dyn GpibBus>,
    output: Option<PathBuf>,
) -> Result<()> {
    let table = config.frequency_table()?;
    let geometry = config.geometry()?;
    let path = output.unwrap_or_else(|| config.output_path());

    let meter = open_meter(config, bus).await?;
    let mut controller = AcquisitionController::new(
        Arc::clone(&meter),
        config.acquisition_settings(),
        Box::new(TracingPlot::new()),
    );

    let result = async {
        controller.start_measurement(table, &geometry, &path).await?;
        controller.run(cancel_on_ctrl_c()).await
    }
    .await;
    close_meter(&meter).await;

    let summary = result.map_err(explain).context("Sweep failed")?;
    print_summary(&summary);
    Ok(())
}

async fn run_correction(
    config: &AppConfig,
    bus: Box<dyn GpibBus>,
    kind: CorrectionArg,
) -> Result<()> {
    let meter = open_meter(config, bus).await?;
    let mut controller = AcquisitionController::new(
        Arc::clone(&meter),
        config.acquisition_settings(),
        Box::new(TracingPlot::new()),
    );

    println!("Measuring compensation data, this can take a minute");
    let result = async {
        match kind {
            CorrectionArg::Open => controller.start_open_correction().await?,
            CorrectionArg::Short => controller.start_short_correction().await?,
        }
        controller.run(cancel_on_ctrl_c()).await
    }
    .await;
    close_meter(&meter).await;

    let summary = result.map_err(explain).context("Correction failed")?;
    print_summary(&summary);
    Ok(())
}

async fn run_temperature(
    config: &AppConfig,
    bus: Box<dyn GpibBus>,
    setpoint: Option<f64>,
    ramp: Option<f64>,
    heater: Option<u8>,
) -> Result<()> {
    let Some(address) = config.gpib.thermostat_address else {
        bail!("No thermostat_address in the [gpib] configuration");
    };
    let mut controller = LakeShore330::new(bus, config.gpib.board, address)
        .with_settle_delay(config.gpib.settle);
    controller.open().await.map_err(explain)?;

    let result = async {
        match (setpoint, ramp) {
            (Some(target), Some(rate)) => controller.start_ramp(target, rate).await?,
            (Some(target), None) => controller.set_temperature(target).await?,
            _ => {}
        }
        match heater {
            Some(0) => controller.switch_power_off().await?,
            Some(range) => controller.switch_power_on(range).await?,
            None => {}
        }
        let temperature = controller.temperature().await?;
        let status = controller.check_status().await?;
        let ramping = controller.is_ramping().await?;
        AppResult::Ok((temperature, status, ramping))
    }
    .await;

    // close() switches the heater off, release() leaves it running.
    let heater_on = heater.is_some_and(|range| range > 0);
    let closed = if heater_on {
        controller.release().await
    } else {
        controller.close().await
    };
    if let Err(e) = closed {
        warn!("Closing the temperature controller failed: {}", e);
    }

    let (temperature, status, ramping) = result.map_err(explain)?;
    println!("Sample temperature: {:.2} K", temperature);
    println!("Status: {}", status);
    if ramping {
        println!("Ramping");
    }
    Ok(())
}
