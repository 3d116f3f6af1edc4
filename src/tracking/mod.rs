//! Track management
//!
//! Routes timestamped plots to one IMM per target. The first plot of a target
//! initiates its track, later plots run a measurement cycle, and periodic
//! extrapolation reports every live track without disturbing it.
//!
//! Timestamps are seconds as `f64`. Tracks that have not been updated for
//! longer than the coasting time are dropped on the next extrapolation.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::filters::imm::{CycleInputs, InteractingMultipleModel};
use crate::logging::{ImmLogger, TracingLogger};
use crate::models::config::ImmSpec;
use crate::types::binding::StateLayout;
use crate::types::linalg::{ensure_len, ensure_shape};
use crate::{ConfigError, Result};

/// Sensor id of the multilateration network in the reference deployment.
pub const MLAT_SENSOR: u32 = 25188;

/// Sensor id of the ADS-B receiver in the reference deployment.
pub const ADSB_SENSOR: u32 = 20;

// ============================================================================
// Sensor Noise Policy
// ============================================================================

/// How a sensor's reported variances are corrected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceScale {
    Multiply(f64),
    Divide(f64),
}

impl VarianceScale {
    /// Multiplicative factor this correction applies.
    pub fn factor(&self) -> f64 {
        match *self {
            VarianceScale::Multiply(f) => f,
            VarianceScale::Divide(d) if d != 0.0 => 1.0 / d,
            VarianceScale::Divide(_) => 1.0,
        }
    }
}

/// Per-sensor correction of plot covariances.
///
/// The reported covariance is multiplied by the global scale and by the
/// factor of the sensor's entry, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorNoisePolicy {
    #[serde(default = "default_scale")]
    pub global_scale: f64,
    #[serde(default)]
    pub sensors: BTreeMap<u32, VarianceScale>,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for SensorNoisePolicy {
    fn default() -> Self {
        Self {
            global_scale: 1.0,
            sensors: BTreeMap::new(),
        }
    }
}

impl SensorNoisePolicy {
    /// Correction used for the multilateration and ADS-B sensors.
    ///
    /// Multilateration variances are inflated by 23², ADS-B variances are
    /// divided by 20.
    pub fn airport_surveillance() -> Self {
        Self::default()
            .with_sensor(MLAT_SENSOR, VarianceScale::Multiply(529.0))
            .with_sensor(ADSB_SENSOR, VarianceScale::Divide(20.0))
    }

    pub fn with_global_scale(mut self, scale: f64) -> Self {
        self.global_scale = scale;
        self
    }

    pub fn with_sensor(mut self, sensor_id: u32, scale: VarianceScale) -> Self {
        self.sensors.insert(sensor_id, scale);
        self
    }

    /// Total factor applied to covariances reported by `sensor_id`.
    pub fn factor(&self, sensor_id: u32) -> f64 {
        let sensor = self
            .sensors
            .get(&sensor_id)
            .map(VarianceScale::factor)
            .unwrap_or(1.0);
        self.global_scale * sensor
    }

    /// Corrected measurement covariance.
    pub fn apply(&self, sensor_id: u32, covariance: &DMatrix<f64>) -> DMatrix<f64> {
        covariance * self.factor(sensor_id)
    }
}

// ============================================================================
// Plots, Tracks and Records
// ============================================================================

/// A single position report for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct Plot {
    pub target: String,
    pub plot_id: String,
    /// Measured components, ordered like the configured measurement variables
    pub position: DVector<f64>,
    /// Covariance as reported by the sensor
    pub covariance: DMatrix<f64>,
    /// Seconds
    pub time: f64,
    pub sensor_id: u32,
}

/// A target under estimation.
#[derive(Debug, Clone)]
pub struct Track {
    pub imm: InteractingMultipleModel,
    /// Time of the last accepted plot
    pub last_update: f64,
    /// Position of the last accepted plot
    pub measurement: DVector<f64>,
    /// Ids of all accepted plots, oldest first
    pub plot_ids: Vec<String>,
}

/// Snapshot of one track at an extrapolation time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub target: String,
    pub time: f64,
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub mode_probabilities: DVector<f64>,
    pub plot_ids: Vec<String>,
}

/// What [`TrackTable::add_plot`] did with a plot.
#[derive(Debug, Clone, PartialEq)]
pub enum PlotOutcome {
    /// First plot of the target; a track was created
    Initiated,
    /// The track ran a measurement cycle
    Updated,
    /// The plot was dropped and the track kept its previous estimate
    Skipped { reason: String },
}

// ============================================================================
// Track Table
// ============================================================================

/// Tuning of a [`TrackTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackTableConfig {
    /// Seconds without an update after which a track is dropped
    #[serde(default = "default_coasting_time")]
    pub coasting_time: f64,
    /// Factor inflating the corrected plot covariance at initiation
    #[serde(default = "default_initial_covariance_scale")]
    pub initial_covariance_scale: f64,
    /// Initial variance of state components the plot does not measure
    #[serde(default = "default_unmeasured_variance")]
    pub unmeasured_variance: f64,
    #[serde(default)]
    pub sensor_noise: SensorNoisePolicy,
}

fn default_coasting_time() -> f64 {
    2.0
}

fn default_initial_covariance_scale() -> f64 {
    10.0
}

fn default_unmeasured_variance() -> f64 {
    100.0
}

impl Default for TrackTableConfig {
    fn default() -> Self {
        Self {
            coasting_time: default_coasting_time(),
            initial_covariance_scale: default_initial_covariance_scale(),
            unmeasured_variance: default_unmeasured_variance(),
            sensor_noise: SensorNoisePolicy::default(),
        }
    }
}

/// One IMM per target, keyed by target id.
pub struct TrackTable {
    spec: ImmSpec,
    config: TrackTableConfig,
    layout: StateLayout,
    tracks: BTreeMap<String, Track>,
    logger: Arc<dyn ImmLogger>,
}

impl TrackTable {
    /// Creates an empty table whose tracks are built from `spec`.
    ///
    /// # Errors
    /// The bank configuration fails structural validation or its state layout does not
    /// name every measured component.
    pub fn new(spec: ImmSpec, config: TrackTableConfig) -> ::core::result::Result<Self, ConfigError> {
        spec.validate()?;
        let layout = spec.layout(common_dim(&spec))?;

        if let Some(missing) = layout
            .measurement
            .iter()
            .find(|name| layout.state_index(name).is_none())
        {
            return Err(ConfigError::DimensionMismatch {
                context: "measurement_variables".to_string(),
                expected: format!("a state component named '{missing}'"),
                actual: format!("{:?}", layout.state),
            });
        }

        Ok(Self {
            spec,
            config,
            layout,
            tracks: BTreeMap::new(),
            logger: Arc::new(TracingLogger::default()),
        })
    }

    /// Logger handed to every IMM created from now on.
    pub fn with_logger(mut self, logger: Arc<dyn ImmLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TrackTableConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track(&self, target: &str) -> Option<&Track> {
        self.tracks.get(target)
    }

    /// Target ids in ascending order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    /// Feeds one plot to its target's track.
    ///
    /// # Errors
    /// Plots of the wrong shape, and configuration errors while initiating a
    /// track. Numerical failures during a cycle are not errors: the plot is
    /// skipped and the track keeps its estimate.
    pub fn add_plot(&mut self, plot: &Plot) -> Result<PlotOutcome> {
        let m = self.layout.measurement.len();
        ensure_len("plot position", &plot.position, m)?;
        ensure_shape("plot covariance", &plot.covariance, m, m)?;

        let r = self.config.sensor_noise.apply(plot.sensor_id, &plot.covariance);

        let Some(track) = self.tracks.get_mut(&plot.target) else {
            let track = self.initiate(plot, &r)?;
            tracing::info!(target_id = %plot.target, time = plot.time, "track initiated");
            self.tracks.insert(plot.target.clone(), track);
            return Ok(PlotOutcome::Initiated);
        };

        let dt = plot.time - track.last_update;
        if dt < 0.0 {
            let reason = format!("plot is {:.3} s older than the last update", -dt);
            tracing::warn!(target_id = %plot.target, plot_id = %plot.plot_id, "{reason}");
            return Ok(PlotOutcome::Skipped { reason });
        }

        let inputs = CycleInputs {
            measurement_uncertainty: Some(&r),
            ..CycleInputs::default()
        };
        match track.imm.predict_update_with(dt, &plot.position, inputs) {
            Ok(()) => {
                track.last_update = plot.time;
                track.measurement = plot.position.clone();
                track.plot_ids.push(plot.plot_id.clone());
                Ok(PlotOutcome::Updated)
            }
            Err(err) => {
                tracing::warn!(
                    target_id = %plot.target,
                    plot_id = %plot.plot_id,
                    error = %err,
                    "plot skipped"
                );
                Ok(PlotOutcome::Skipped {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Reports every live track at `time` and drops coasted tracks.
    ///
    /// Tracks are projected on copies; their estimates are unchanged.
    /// Tracks whose projection fails are reported in the log and omitted.
    pub fn extrapolate_all(&mut self, time: f64) -> Vec<TrackRecord> {
        let coasting_time = self.config.coasting_time;
        self.tracks.retain(|target, track| {
            let keep = time - track.last_update < coasting_time;
            if !keep {
                tracing::info!(target_id = %target, last_update = track.last_update, "track dropped");
            }
            keep
        });

        let mut records = Vec::with_capacity(self.tracks.len());
        for (target, track) in &self.tracks {
            let dt = time - track.last_update;
            match track.imm.extrapolate(dt, None) {
                Ok(projection) => records.push(TrackRecord {
                    target: target.clone(),
                    time,
                    state: projection.state,
                    covariance: projection.covariance,
                    mode_probabilities: projection.mode_probabilities,
                    plot_ids: track.plot_ids.clone(),
                }),
                Err(err) => {
                    tracing::warn!(target_id = %target, error = %err, "extrapolation failed");
                }
            }
        }
        records
    }

    fn initiate(&self, plot: &Plot, r: &DMatrix<f64>) -> Result<Track> {
        let (state, covariance) = self.initial_estimate(&plot.position, r);
        let imm = self
            .spec
            .build(&state, Some(&covariance))?
            .with_logger(self.logger.clone());

        Ok(Track {
            imm,
            last_update: plot.time,
            measurement: plot.position.clone(),
            plot_ids: vec![plot.plot_id.clone()],
        })
    }

    /// Places the plot into the common state. Measured components take the
    /// plot values, everything else starts at zero.
    fn initial_estimate(&self, z: &DVector<f64>, r: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.layout.state_dim();
        let mut state = DVector::<f64>::zeros(n);
        let mut covariance = DMatrix::from_diagonal_element(n, n, self.config.unmeasured_variance);

        let indices: Vec<usize> = self
            .layout
            .measurement
            .iter()
            .filter_map(|name| self.layout.state_index(name))
            .collect();

        for (i, &si) in indices.iter().enumerate() {
            state[si] = z[i];
            for (j, &sj) in indices.iter().enumerate() {
                covariance[(si, sj)] = self.config.initial_covariance_scale * r[(i, j)];
            }
        }
        (state, covariance)
    }
}

/// Dimension of the state the IMM combines in.
fn common_dim(spec: &ImmSpec) -> usize {
    if !spec.state_variables.is_empty() {
        return spec.state_variables.len();
    }
    if let Some(expansion) = &spec.expansion_matrix {
        return expansion.len();
    }
    spec.filters
        .first()
        .map(|f| f.transition_matrix.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use crate::models::presets;
    use approx::assert_relative_eq;

    fn plot(target: &str, id: &str, x: f64, y: f64, time: f64) -> Plot {
        Plot {
            target: target.to_string(),
            plot_id: id.to_string(),
            position: DVector::from_vec(vec![x, y]),
            covariance: DMatrix::identity(2, 2),
            time,
            sensor_id: 0,
        }
    }

    fn table() -> TrackTable {
        TrackTable::new(presets::cv_ca_bank(1.0), TrackTableConfig::default()).unwrap()
    }

    #[test]
    fn test_variance_scale() {
        assert_eq!(VarianceScale::Multiply(4.0).factor(), 4.0);
        assert_eq!(VarianceScale::Divide(4.0).factor(), 0.25);
        assert_eq!(VarianceScale::Divide(0.0).factor(), 1.0);
    }

    #[test]
    fn test_sensor_noise_policy() {
        let policy = SensorNoisePolicy::airport_surveillance().with_global_scale(2.0);
        assert_relative_eq!(policy.factor(MLAT_SENSOR), 1058.0);
        assert_relative_eq!(policy.factor(ADSB_SENSOR), 0.1);
        assert_relative_eq!(policy.factor(7), 2.0);

        let r = policy.apply(7, &DMatrix::identity(2, 2));
        assert_eq!(r, DMatrix::identity(2, 2) * 2.0);
    }

    #[test]
    fn test_first_plot_initiates() {
        let mut table = table();
        assert_eq!(table.add_plot(&plot("A", "p1", 3.0, 4.0, 0.0)).unwrap(), PlotOutcome::Initiated);
        assert_eq!(table.len(), 1);

        let track = table.track("A").unwrap();
        // [x, vx, ax, y, vy, ay]
        assert_eq!(track.imm.state().as_slice(), &[3.0, 0.0, 0.0, 4.0, 0.0, 0.0]);
        assert_relative_eq!(track.imm.covariance()[(0, 0)], 10.0);
        assert_relative_eq!(track.imm.covariance()[(1, 1)], 100.0);
        assert_eq!(track.plot_ids, vec!["p1".to_string()]);
    }

    #[test]
    fn test_later_plots_update() {
        let mut table = table();
        table.add_plot(&plot("A", "p1", 0.0, 0.0, 0.0)).unwrap();
        let outcome = table.add_plot(&plot("A", "p2", 1.0, 0.0, 1.0)).unwrap();
        assert_eq!(outcome, PlotOutcome::Updated);

        let track = table.track("A").unwrap();
        assert_eq!(track.last_update, 1.0);
        assert_eq!(track.plot_ids.len(), 2);
        assert!(track.imm.state()[0] > 0.0);
    }

    #[test]
    fn test_out_of_order_plot_skipped() {
        let mut table = table();
        table.add_plot(&plot("A", "p1", 0.0, 0.0, 5.0)).unwrap();
        let before = table.track("A").unwrap().imm.state().clone();

        let outcome = table.add_plot(&plot("A", "p0", 1.0, 1.0, 4.0)).unwrap();
        assert!(matches!(outcome, PlotOutcome::Skipped { .. }));
        assert_eq!(table.track("A").unwrap().imm.state(), &before);
    }

    #[test]
    fn test_wrong_plot_shape_rejected() {
        let mut table = table();
        let mut bad = plot("A", "p1", 0.0, 0.0, 0.0);
        bad.position = DVector::zeros(3);
        assert!(table.add_plot(&bad).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_extrapolate_all_reports_and_drops() {
        let mut table = table();
        table.add_plot(&plot("A", "a1", 0.0, 0.0, 0.0)).unwrap();
        table.add_plot(&plot("B", "b1", 50.0, 50.0, 0.5)).unwrap();
        let state_a = table.track("A").unwrap().imm.state().clone();

        let records = table.extrapolate_all(1.0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].target, "A");
        assert_eq!(records[0].plot_ids, vec!["a1".to_string()]);
        assert_relative_eq!(records[0].mode_probabilities.sum(), 1.0, epsilon = 1e-9);
        assert_eq!(table.track("A").unwrap().imm.state(), &state_a);

        // A has coasted for 2 s
        let records = table.extrapolate_all(2.0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "B");
        assert!(table.track("A").is_none());
    }

    #[test]
    fn test_logger_reaches_new_tracks() {
        let logger = Arc::new(MemoryLogger::new());
        let mut table = table().with_logger(logger.clone());
        table.add_plot(&plot("A", "p1", 0.0, 0.0, 0.0)).unwrap();
        table.add_plot(&plot("A", "p2", 1.0, 1.0, 1.0)).unwrap();
        assert_eq!(logger.messages().len(), 1);
        assert!(logger.messages()[0].starts_with("cycle dt=1"));
    }

    #[test]
    fn test_layout_must_name_measured_components() {
        let mut spec = presets::cv_ca_bank(1.0);
        spec.measurement_variables = vec!["x".into(), "z".into()];
        assert!(matches!(
            TrackTable::new(spec, TrackTableConfig::default()),
            Err(ConfigError::DimensionMismatch { .. })
        ));
    }
}
