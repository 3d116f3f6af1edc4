//! Demonstration of the IMM tracker
//!
//! Simulates a target that cruises, turns and accelerates, feeds its plots
//! into a track table running a constant velocity / constant acceleration
//! bank, and prints the estimate after every plot.

use std::path::PathBuf;

use clap::Parser;
use imm_tracker::models::{presets, ImmSpec};
use imm_tracker::tracking::{Plot, PlotOutcome, TrackTable, TrackTableConfig};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multiple-model tracking demo", long_about = None)]
struct Args {
    /// JSON filter bank configuration; defaults to the CV/CA bank
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of plots to simulate
    #[arg(long, default_value_t = 60)]
    steps: usize,

    /// Seconds between plots
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Acceleration noise variance of the default bank
    #[arg(long, default_value_t = 0.5)]
    sigma_a_sq: f64,

    /// Measurement standard deviation of the simulated sensor
    #[arg(long, default_value_t = 2.0)]
    noise: f64,

    /// Seed of the simulated measurement noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Enable DEBUG logging, including every IMM cycle
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let spec = match &args.config {
        Some(path) => {
            info!("Loading filter bank from {}", path.display());
            ImmSpec::from_json(&std::fs::read_to_string(path)?)?
        }
        None => presets::cv_ca_bank(args.sigma_a_sq),
    };
    info!(
        "Filter bank: {}",
        spec.filters
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut table = TrackTable::new(spec, TrackTableConfig::default())?;
    let covariance = DMatrix::identity(2, 2) * args.noise.powi(2);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let normal = Normal::new(0.0, args.noise)?;

    println!(
        "{:>6} {:>10} {:>10} {:>10} {:>10}  mode probabilities",
        "t", "x", "y", "x_true", "y_true"
    );

    for step in 0..args.steps {
        let time = step as f64 * args.interval;
        let (x_true, y_true) = trajectory(time);
        let position = measure((x_true, y_true), &normal, &mut rng);

        let plot = Plot {
            target: "T1".to_string(),
            plot_id: format!("P{step}"),
            position,
            covariance: covariance.clone(),
            time,
            sensor_id: 0,
        };

        match table.add_plot(&plot)? {
            PlotOutcome::Skipped { reason } => {
                error!("Plot {} skipped: {reason}", plot.plot_id);
                continue;
            }
            PlotOutcome::Initiated | PlotOutcome::Updated => {}
        }

        if let Some(track) = table.track("T1") {
            let layout = track.imm.layout();
            let state = track.imm.state();
            let component = |name: &str| layout.state_index(name).map(|i| state[i]).unwrap_or(0.0);
            println!(
                "{time:>6.1} {:>10.2} {:>10.2} {x_true:>10.2} {y_true:>10.2}  {:?}",
                component("x"),
                component("y"),
                track
                    .imm
                    .mode_probabilities()
                    .iter()
                    .map(|p| (p * 1000.0).round() / 1000.0)
                    .collect::<Vec<_>>()
            );
        }
    }

    let horizon = args.steps as f64 * args.interval;
    for record in table.extrapolate_all(horizon) {
        info!(
            "Extrapolated {} to t={:.1}: {:?}",
            record.target,
            record.time,
            record.state.as_slice()
        );
    }

    Ok(())
}

/// Straight flight, a left turn, then a straight acceleration.
fn trajectory(t: f64) -> (f64, f64) {
    const SPEED: f64 = 10.0;
    const TURN_START: f64 = 20.0;
    const TURN_END: f64 = 35.0;
    const OMEGA: f64 = std::f64::consts::FRAC_PI_2 / (TURN_END - TURN_START);
    const RADIUS: f64 = SPEED / OMEGA;

    if t <= TURN_START {
        return (SPEED * t, 0.0);
    }
    let x0 = SPEED * TURN_START;
    if t <= TURN_END {
        let phi = OMEGA * (t - TURN_START);
        return (x0 + RADIUS * phi.sin(), RADIUS * (1.0 - phi.cos()));
    }
    let tau = t - TURN_END;
    (x0 + RADIUS, RADIUS + SPEED * tau + 0.5 * 2.0 * tau * tau)
}

/// Position plot of the true position with Gaussian sensor error.
fn measure(truth: (f64, f64), noise: &Normal<f64>, rng: &mut StdRng) -> DVector<f64> {
    DVector::from_vec(vec![truth.0 + noise.sample(rng), truth.1 + noise.sample(rng)])
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    if verbose {
        info!("Verbose logging enabled (DEBUG level)");
    }
}
