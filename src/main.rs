use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;

use gammaspec::io::{read_spectrum_file, read_table_file};
use gammaspec::prelude::*;

#[derive(Parser)]
#[command(name = "gammaspec")]
#[command(about = "Peak fitting and calibration for gamma-ray spectra", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the peak candidates found by the detector
    Peaks {
        spectrum: PathBuf,
    },
    /// Fit the peaks inside a window and report positions, widths and rates
    Fit {
        spectrum: PathBuf,
        #[arg(long)]
        min: f64,
        #[arg(long)]
        max: f64,
        /// JSON analysis configuration, overridden by the flags below
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        peaks: Option<usize>,
        #[arg(long)]
        border: Option<usize>,
        /// Measurement time in seconds
        #[arg(long)]
        time: Option<u32>,
        /// Seed the fit from detector candidates
        #[arg(long)]
        seed: bool,
        /// Background spectrum to subtract before fitting
        #[arg(long)]
        background: Option<PathBuf>,
        /// Energy calibration table
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Fit on the energy axis; `--min` and `--max` are then energies
        #[arg(long, requires = "calibration")]
        energy: bool,
        /// Efficiency table, enables efficiency correction
        #[arg(long)]
        efficiency: Option<PathBuf>,
        /// The efficiency table is indexed by energy
        #[arg(long, requires = "efficiency")]
        efficiency_energy: bool,
        #[arg(long, num_args = 2, value_names = ["P1", "P2"])]
        breakpoints: Option<Vec<f64>>,
        /// Branching ratio of the line, applied with efficiency correction
        #[arg(long)]
        branching: Option<f64>,
    },
    /// Fit an energy calibration from a table of channel, energy and uncertainty
    Calibrate {
        table: PathBuf,
        /// Write the points back out, sorted, with their uncertainties
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fit an efficiency curve from a table of position, efficiency and uncertainty
    Efficiency {
        table: PathBuf,
        #[arg(long, num_args = 2, value_names = ["P1", "P2"], required = true)]
        breakpoints: Vec<f64>,
        /// The table is indexed by energy, converted with `--calibration`
        #[arg(long, requires = "calibration")]
        energy_domain: bool,
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Print this many samples of the fitted curve
        #[arg(long, default_value_t = 0)]
        samples: usize,
    },
}

fn step(state: SessionState, command: Command) -> Result<SessionState, SessionError> {
    Ok(recompute(&state, command)?.state)
}

fn breakpoint_pair(values: &[f64]) -> Option<(f64, f64)> {
    match values {
        [low, high] => Some((*low, *high)),
        _ => None,
    }
}

#[cfg(feature = "serde")]
fn load_config(path: Option<PathBuf>) -> Result<AnalysisConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(AnalysisConfig::from_json(fs::File::open(path)?)?),
        None => Ok(AnalysisConfig::default()),
    }
}

#[cfg(not(feature = "serde"))]
fn load_config(path: Option<PathBuf>) -> Result<AnalysisConfig, Box<dyn Error>> {
    match path {
        Some(_) => Err("Reading a configuration file requires the `serde` feature".into()),
        None => Ok(AnalysisConfig::default()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Peaks { spectrum } => {
            let spectrum = read_spectrum_file(&spectrum)?;
            info!("Scanning {} bins", spectrum.len());
            for candidate in PeakDetector::default().scan(&spectrum) {
                println!(
                    "{}\t{:.2}\t{}\t{:.0}",
                    candidate.bin,
                    spectrum.center(candidate.bin),
                    candidate.width,
                    spectrum.count(candidate.bin)
                );
            }
        }
        Commands::Fit {
            spectrum,
            min,
            max,
            config,
            peaks,
            border,
            time,
            seed,
            background,
            calibration,
            energy,
            efficiency,
            efficiency_energy,
            breakpoints,
            branching,
        } => {
            let mut settings = load_config(config)?;

            if let Some(n) = peaks {
                settings.peak_count = n;
            }
            if let Some(b) = border {
                settings.border_length = b;
            }
            if let Some(t) = time {
                settings.measurement_time = t;
            }
            settings.flags.set(AnalysisFlags::SEED_FROM_DETECTOR, seed);

            let mut state = SessionState::new(settings)?;
            if let Some(path) = calibration {
                state = step(state, Command::LoadCalibration(read_table_file(path)?))?;
            }
            if let Some(path) = &efficiency {
                let domain = if efficiency_energy {
                    AxisDomain::Energy
                } else {
                    AxisDomain::Channel
                };
                let rows = read_table_file(path)?;
                state = step(state, Command::LoadEfficiency { rows, domain })?;
            }
            if let Some((low, high)) = breakpoints.as_deref().and_then(breakpoint_pair) {
                state = step(state, Command::SetBreakpoints { low, high })?;
            }

            state = step(state, Command::LoadSpectrum(read_spectrum_file(&spectrum)?))?;
            if let Some(path) = background {
                state = step(state, Command::LoadBackground(read_spectrum_file(path)?))?;
                state = step(state, Command::Show(View::Spectrum(SpectrumView::Difference)))?;
            }
            if energy {
                state = step(state, Command::SetAxis(AxisDomain::Energy))?;
            }
            if efficiency.is_some() {
                state = step(state, Command::SetEfficiencyCorrection(true))?;
            }
            if let Some(ratio) = branching {
                state = step(state, Command::SetBranchingRatio(ratio))?;
            }
            let result = recompute(&state, Command::SetRange { min, max })?;

            let Some(analysis) = result.state.analysis() else {
                return Err("No analysis was produced".into());
            };
            println!("position\tfwhm\tintegral\tintegral_err\trate\trate_err");
            for (peak, rate) in analysis.fit.peaks.iter().zip(analysis.rates.iter()) {
                let (value, uncertainty) = rate
                    .map(|r| (r.value, r.uncertainty))
                    .unwrap_or((f64::NAN, f64::NAN));
                println!(
                    "{:.3}\t{:.3}\t{:.1}\t{:.1}\t{:.4e}\t{:.4e}",
                    peak.position,
                    peak.fwhm,
                    peak.integral,
                    peak.integral_uncertainty,
                    value,
                    uncertainty
                );
            }
        }
        Commands::Calibrate { table, output } => {
            let points = CalibrationSet::from_rows(&read_table_file(table)?);
            let model = points.fit()?;
            let points = points.with_model(&model);
            println!(
                "E = ({:.6} +- {:.6}) * ch + ({:.4} +- {:.4})",
                model.slope, model.slope_error, model.intercept, model.intercept_error
            );
            for (channel, residual) in points.residuals(&model) {
                println!("{channel:.2}\t{residual:+.4}");
            }
            if let Some(path) = output {
                TableWriter::new(fs::File::create(path)?).write_rows(&points.rows())?;
            }
        }
        Commands::Efficiency {
            table,
            breakpoints,
            energy_domain,
            calibration,
            samples,
        } => {
            let (low, high) =
                breakpoint_pair(&breakpoints).ok_or("Expected exactly two breakpoints")?;
            let domain = if energy_domain {
                AxisDomain::Energy
            } else {
                AxisDomain::Channel
            };
            let mut points = EfficiencySet::from_rows(&read_table_file(table)?, domain);
            if let Some(path) = calibration {
                let model = CalibrationSet::from_rows(&read_table_file(path)?).fit()?;
                points = points.to_channel_domain(&model);
            }
            let model = EfficiencyCalibrator::default().fit(&points, low, high)?;
            println!(
                "low:  {:.4e} * (x - {:.4}) ^ 2 + {:.4e}",
                model.low.a, model.low.b, model.low.c
            );
            println!(
                "high: {:.4e} / (x + {:.4}) + {:.4e}",
                model.high.a, model.high.b, model.high.c
            );
            println!(
                "join: {:.4e} * x + {:.4e} on [{low}, {high}]",
                model.join_slope, model.join_intercept
            );
            println!("residual: {:.4e}", model.residual);
            println!("reconciled breakpoint: {:.3}", model.reconciled_breakpoint);
            for (x, y) in model.curve(samples) {
                println!("{x:.3}\t{y:.6e}");
            }
        }
    }
    Ok(())
}
