//! Core tissue simulation state for the livermets workspace.
//!
//! Cells live at planar `f64` coordinates, age through an M/G1/S/G2 division
//! cycle, and carry a heritable chemo-resistance trait in `[0, 1]`. Each tick
//! the registered culling policies stochastically mark cells for apoptosis,
//! dying cells are removed once their apoptosis deadline passes, and ready
//! cells divide. All randomness flows through a single sequential
//! [`RandomSource`], so runs are reproducible given a fixed seed; the draw
//! order across stages and within each policy is part of that contract.

use livermets_hull::{BoundaryExtractor, MonotoneChain};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::f64::consts::TAU;
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for cells backed by a generational slot map.
    pub struct CellId;
}

/// Convenience alias for associating side data with cells.
pub type CellMap<T> = SecondaryMap<CellId, T>;

/// Errors that can occur when constructing tissue state.
#[derive(Debug, Error)]
pub enum TissueError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position (SoA column representation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Division-cycle phase, determined by cell age and per-cell G1 duration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CyclePhase {
    #[default]
    M,
    G1,
    S,
    G2,
}

/// Wall-clock-in-hours view of the simulation, advanced once per tick.
///
/// Replaces the usual global simulation-time singleton with a value owned by
/// the tissue state, so components read `dt` from an explicit handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimulationClock {
    dt_hours: f64,
    tick: Tick,
}

impl SimulationClock {
    /// Create a clock with the given step length in hours.
    pub fn new(dt_hours: f64) -> Result<Self, TissueError> {
        if !dt_hours.is_finite() || dt_hours <= 0.0 {
            return Err(TissueError::InvalidConfig(
                "dt_hours must be finite and positive",
            ));
        }
        Ok(Self {
            dt_hours,
            tick: Tick::zero(),
        })
    }

    /// Step length in hours.
    #[must_use]
    pub const fn dt_hours(&self) -> f64 {
        self.dt_hours
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Simulated hours elapsed since the start of the run.
    #[must_use]
    pub fn elapsed_hours(&self) -> f64 {
        self.tick.0 as f64 * self.dt_hours
    }

    /// Advance the clock by one tick.
    pub fn advance(&mut self) {
        self.tick = self.tick.next();
    }
}

/// Sequential random stream consumed by every stochastic stage.
///
/// One shared stream with a fixed draw order keeps seeded runs reproducible;
/// implementations are not expected to be re-entrant.
pub trait RandomSource {
    /// Uniform variate in `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// Standard normal deviate.
    fn standard_normal(&mut self) -> f64;

    /// Normal deviate with the given mean and standard deviation.
    ///
    /// Consumes exactly one standard-normal draw, so scripted sources stay in
    /// step with the production stream.
    fn normal(&mut self, mean: f64, sd: f64) -> f64 {
        mean + sd * self.standard_normal()
    }
}

/// Production random source backed by a seeded [`SmallRng`].
#[derive(Debug)]
pub struct SeededRandomSource {
    rng: SmallRng,
}

impl SeededRandomSource {
    /// Build a source from an explicit seed.
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Build a source seeded from process entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        let seed: u64 = rand::random();
        Self::seed_from_u64(seed)
    }
}

impl RandomSource for SeededRandomSource {
    fn uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    fn standard_normal(&mut self) -> f64 {
        StandardNormal.sample(&mut self.rng)
    }
}

/// Time-step probability conversion.
pub mod probability {
    /// Convert a per-hour event probability into the equivalent probability
    /// for a single time step of `dt_hours`.
    ///
    /// Assumes a constant time step, an integer number `n = 1/dt` of steps per
    /// hour, and independent per-step trials. With `q` the per-hour
    /// probability and `p` the per-step probability, the chance of surviving
    /// an hour satisfies `(1 - q) = (1 - p)^(1/dt)`, so `p = 1 - (1 - q)^dt`.
    #[must_use]
    pub fn per_step(per_hour: f64, dt_hours: f64) -> f64 {
        1.0 - (1.0 - per_hour).powf(dt_hours)
    }
}

/// Smooth modulation of a per-hour death probability by a resistance trait.
///
/// The factor `tanh(steepness * (midpoint - resistance)) + offset` decreases
/// the effective probability as resistance rises and saturates toward the
/// extremes. The constants are empirical tuning values, kept configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResistanceModulation {
    pub steepness: f64,
    pub midpoint: f64,
    pub offset: f64,
}

impl Default for ResistanceModulation {
    fn default() -> Self {
        Self {
            steepness: 2.0,
            midpoint: 0.5,
            offset: 1.0,
        }
    }
}

impl ResistanceModulation {
    /// Reject constants that would produce undefined probabilities.
    pub fn validate(&self) -> Result<(), TissueError> {
        if !self.steepness.is_finite() || !self.midpoint.is_finite() || !self.offset.is_finite() {
            return Err(TissueError::InvalidConfig(
                "modulation constants must be finite",
            ));
        }
        if self.offset < 0.0 {
            return Err(TissueError::InvalidConfig(
                "modulation offset must be non-negative",
            ));
        }
        Ok(())
    }

    /// Multiplicative factor applied to the base per-hour probability.
    #[must_use]
    pub fn factor(&self, resistance: f64) -> f64 {
        (self.steepness * (self.midpoint - resistance)).tanh() + self.offset
    }

    /// Modulated per-hour probability, clamped into `[0, 1]` so the step
    /// conversion stays well-defined when `base * factor` exceeds one.
    #[must_use]
    pub fn modulate(&self, per_hour: f64, resistance: f64) -> f64 {
        (per_hour * self.factor(resistance)).clamp(0.0, 1.0)
    }
}

/// Heritable resistance trait: founders start at a base value, children
/// random-walk away from their parent at division.
#[derive(Debug, Clone, Copy)]
pub struct ResistanceDrift {
    base: f64,
    rate: f64,
}

impl ResistanceDrift {
    /// Validate the drift parameters. An unset rate is a configuration error,
    /// not a silent default.
    pub fn new(base: f64, rate: Option<f64>) -> Result<Self, TissueError> {
        let rate = rate.ok_or(TissueError::InvalidConfig(
            "resistance_drift_rate must be set",
        ))?;
        if !rate.is_finite() || rate < 0.0 {
            return Err(TissueError::InvalidConfig(
                "resistance_drift_rate must be finite and non-negative",
            ));
        }
        if !base.is_finite() || !(0.0..=1.0).contains(&base) {
            return Err(TissueError::InvalidConfig(
                "base_resistance must lie in [0, 1]",
            ));
        }
        Ok(Self { base, rate })
    }

    /// Resistance assigned to founder cells.
    #[must_use]
    pub const fn founder(&self) -> f64 {
        self.base
    }

    /// Child resistance at division: one standard-normal draw, scaled by the
    /// drift rate and clamped into `[0, 1]`. The parent's value is untouched.
    pub fn child(&self, parent: f64, rng: &mut dyn RandomSource) -> f64 {
        (parent + self.rate * rng.standard_normal()).clamp(0.0, 1.0)
    }
}

/// Stopping predicate over the live cell count.
///
/// Exceeding the limit is a named, recoverable stopping condition, not an
/// error; the host polls [`PopulationGuard::should_stop`] and ends the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationGuard {
    limit: usize,
}

impl Default for PopulationGuard {
    fn default() -> Self {
        Self { limit: 1000 }
    }
}

impl PopulationGuard {
    /// Create a guard with an explicit cell limit.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// The configured cell limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// True iff the live count strictly exceeds the limit.
    #[must_use]
    pub const fn should_stop(&self, live_count: usize) -> bool {
        live_count > self.limit
    }
}

/// Scalar fields for a single cell used when inserting or snapshotting from
/// the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CellData {
    pub position: Position,
    pub age_hours: f64,
    pub g1_duration_hours: f64,
    pub phase: CyclePhase,
    pub resistance: f64,
    /// Simulated hour at which apoptosis completes; `None` while alive.
    pub apoptosis_deadline: Option<f64>,
}

impl CellData {
    /// Returns true once apoptosis has started on this cell.
    #[must_use]
    pub const fn is_apoptotic(&self) -> bool {
        self.apoptosis_deadline.is_some()
    }
}

/// Collection of per-cell columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CellColumns {
    positions: Vec<Position>,
    ages: Vec<f64>,
    g1_durations: Vec<f64>,
    phases: Vec<CyclePhase>,
    resistances: Vec<f64>,
    apoptosis_deadlines: Vec<Option<f64>>,
}

impl CellColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.ages.clear();
        self.g1_durations.clear();
        self.phases.clear();
        self.resistances.clear();
        self.apoptosis_deadlines.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, cell: CellData) {
        self.positions.push(cell.position);
        self.ages.push(cell.age_hours);
        self.g1_durations.push(cell.g1_duration_hours);
        self.phases.push(cell.phase);
        self.resistances.push(cell.resistance);
        self.apoptosis_deadlines.push(cell.apoptosis_deadline);
        self.debug_assert_coherent();
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.positions[to] = self.positions[from];
        self.ages[to] = self.ages[from];
        self.g1_durations[to] = self.g1_durations[from];
        self.phases[to] = self.phases[from];
        self.resistances[to] = self.resistances[from];
        self.apoptosis_deadlines[to] = self.apoptosis_deadlines[from];
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.ages.truncate(len);
        self.g1_durations.truncate(len);
        self.phases.truncate(len);
        self.resistances.truncate(len);
        self.apoptosis_deadlines.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> CellData {
        CellData {
            position: self.positions[index],
            age_hours: self.ages[index],
            g1_duration_hours: self.g1_durations[index],
            phase: self.phases[index],
            resistance: self.resistances[index],
            apoptosis_deadline: self.apoptosis_deadlines[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to cell ages in hours.
    #[must_use]
    pub fn ages(&self) -> &[f64] {
        &self.ages
    }

    /// Mutable access to cell ages in hours.
    #[must_use]
    pub fn ages_mut(&mut self) -> &mut [f64] {
        &mut self.ages
    }

    /// Immutable access to per-cell G1 durations.
    #[must_use]
    pub fn g1_durations(&self) -> &[f64] {
        &self.g1_durations
    }

    /// Mutable access to per-cell G1 durations.
    #[must_use]
    pub fn g1_durations_mut(&mut self) -> &mut [f64] {
        &mut self.g1_durations
    }

    /// Immutable access to cycle phases.
    #[must_use]
    pub fn phases(&self) -> &[CyclePhase] {
        &self.phases
    }

    /// Mutable access to cycle phases.
    #[must_use]
    pub fn phases_mut(&mut self) -> &mut [CyclePhase] {
        &mut self.phases
    }

    /// Immutable access to resistance values.
    #[must_use]
    pub fn resistances(&self) -> &[f64] {
        &self.resistances
    }

    /// Immutable access to apoptosis deadlines.
    #[must_use]
    pub fn apoptosis_deadlines(&self) -> &[Option<f64>] {
        &self.apoptosis_deadlines
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.ages.len());
        debug_assert_eq!(self.positions.len(), self.g1_durations.len());
        debug_assert_eq!(self.positions.len(), self.phases.len());
        debug_assert_eq!(self.positions.len(), self.resistances.len());
        debug_assert_eq!(self.positions.len(), self.apoptosis_deadlines.len());
    }
}

/// Dense SoA storage with generational handles for cell access.
#[derive(Debug, Default)]
pub struct CellArena {
    slots: SlotMap<CellId, usize>,
    handles: Vec<CellId>,
    columns: CellColumns,
}

impl CellArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: CellColumns::new(),
        }
    }

    /// Number of active cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no cells are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over active cell handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = CellId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &CellColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut CellColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: CellId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns the handle stored at dense row `index`, if in range.
    #[must_use]
    pub fn handle_at(&self, index: usize) -> Option<CellId> {
        self.handles.get(index).copied()
    }

    /// Returns true if `id` refers to a live cell.
    #[must_use]
    pub fn contains(&self, id: CellId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new cell and return its handle.
    pub fn insert(&mut self, cell: CellData) -> CellId {
        let index = self.columns.len();
        self.columns.push(cell);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove all cells whose ids are contained in `dead`, preserving
    /// iteration order. Returns the number of cells removed.
    pub fn remove_many(&mut self, dead: &HashSet<CellId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: CellId) -> Option<CellData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored cells.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Static configuration for a tissue simulation.
///
/// Defaults follow the liver-metastasis scenario: `dt` of 0.01 hours, a
/// 1/10±2/1/1 hour M/G1/S/G2 cycle, and a division separation of 0.05.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissueConfig {
    /// Simulation step length in hours.
    pub dt_hours: f64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Resistance assigned to founder cells.
    pub base_resistance: f64,
    /// Scale of the per-division resistance random walk. Must be set.
    pub resistance_drift_rate: Option<f64>,
    /// Duration of the M phase in hours.
    pub m_duration_hours: f64,
    /// Mean of the per-cell G1 duration draw.
    pub g1_mean_hours: f64,
    /// Standard deviation of the per-cell G1 duration draw.
    pub g1_sd_hours: f64,
    /// Duration of the S phase in hours.
    pub s_duration_hours: f64,
    /// Duration of the G2 phase in hours.
    pub g2_duration_hours: f64,
    /// Distance between parent and child centres after a division.
    pub division_separation: f64,
    /// Hours a cell persists after apoptosis starts before removal.
    pub apoptosis_duration_hours: f64,
    /// Live-cell limit polled by the population guard.
    pub cell_limit: usize,
    /// Safety valve on divisions committed in a single tick.
    pub max_spawns_per_tick: usize,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
    /// Ticks between persistence batches; 0 disables the sink.
    pub sampling_multiple: u32,
}

impl Default for TissueConfig {
    fn default() -> Self {
        Self {
            dt_hours: 0.01,
            rng_seed: None,
            base_resistance: 0.0,
            resistance_drift_rate: Some(0.01),
            m_duration_hours: 1.0,
            g1_mean_hours: 10.0,
            g1_sd_hours: 2.0,
            s_duration_hours: 1.0,
            g2_duration_hours: 1.0,
            division_separation: 0.05,
            apoptosis_duration_hours: 0.25,
            cell_limit: 1000,
            max_spawns_per_tick: 256,
            history_capacity: 256,
            sampling_multiple: 1,
        }
    }
}

impl TissueConfig {
    /// Validate every construction-time invariant eagerly, so a misconfigured
    /// run never reaches its first step.
    pub fn validate(&self) -> Result<(), TissueError> {
        if !self.dt_hours.is_finite() || self.dt_hours <= 0.0 {
            return Err(TissueError::InvalidConfig(
                "dt_hours must be finite and positive",
            ));
        }
        if !self.m_duration_hours.is_finite()
            || self.m_duration_hours < 0.0
            || !self.s_duration_hours.is_finite()
            || self.s_duration_hours < 0.0
            || !self.g2_duration_hours.is_finite()
            || self.g2_duration_hours < 0.0
        {
            return Err(TissueError::InvalidConfig(
                "phase durations must be finite and non-negative",
            ));
        }
        if !self.g1_mean_hours.is_finite()
            || !self.g1_sd_hours.is_finite()
            || self.g1_sd_hours < 0.0
        {
            return Err(TissueError::InvalidConfig(
                "g1 duration distribution must be finite with non-negative sd",
            ));
        }
        if !self.division_separation.is_finite() || self.division_separation <= 0.0 {
            return Err(TissueError::InvalidConfig(
                "division_separation must be finite and positive",
            ));
        }
        if !self.apoptosis_duration_hours.is_finite() || self.apoptosis_duration_hours < 0.0 {
            return Err(TissueError::InvalidConfig(
                "apoptosis_duration_hours must be finite and non-negative",
            ));
        }
        if self.max_spawns_per_tick == 0 {
            return Err(TissueError::InvalidConfig(
                "max_spawns_per_tick must be non-zero",
            ));
        }
        if self.history_capacity == 0 {
            return Err(TissueError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        // Drift parameters share the same eager-validation policy.
        ResistanceDrift::new(self.base_resistance, self.resistance_drift_rate)?;
        Ok(())
    }

    /// Returns the configured random source, seeding from entropy if no seed
    /// was provided.
    #[must_use]
    pub fn seeded_source(&self) -> SeededRandomSource {
        match self.rng_seed {
            Some(seed) => SeededRandomSource::seed_from_u64(seed),
            None => SeededRandomSource::from_entropy(),
        }
    }
}

/// Narrow view of a cell population consumed by culling policies.
///
/// Policies request one-way apoptosis transitions through this seam and never
/// remove or reorder cells; removal happens in a later host-owned sweep.
pub trait CullTargets {
    /// Number of dense rows currently live.
    fn cell_count(&self) -> usize;

    /// Whether apoptosis has already started on the cell at `row`.
    fn is_apoptotic(&self, row: usize) -> bool;

    /// Resistance trait of the cell at `row`.
    fn resistance(&self, row: usize) -> f64;

    /// Start apoptosis on the cell at `row`. A no-op if already started.
    fn start_apoptosis(&mut self, row: usize);
}

/// Planar position lookup by dense row, required by boundary-scoped policies.
pub trait PositionQuery {
    /// Centre of the cell at `row`.
    fn position(&self, row: usize) -> (f64, f64);
}

/// Adapter implementing the culling capabilities over dense cell columns.
///
/// Stamping a kill records `deadline_hours` as the cell's removal time.
pub struct ColumnTargets<'a> {
    columns: &'a mut CellColumns,
    deadline_hours: f64,
}

impl<'a> ColumnTargets<'a> {
    /// Wrap `columns`, stamping kills with the provided removal deadline.
    #[must_use]
    pub fn new(columns: &'a mut CellColumns, deadline_hours: f64) -> Self {
        Self {
            columns,
            deadline_hours,
        }
    }
}

impl CullTargets for ColumnTargets<'_> {
    fn cell_count(&self) -> usize {
        self.columns.len()
    }

    fn is_apoptotic(&self, row: usize) -> bool {
        self.columns.apoptosis_deadlines()[row].is_some()
    }

    fn resistance(&self, row: usize) -> f64 {
        self.columns.resistances()[row]
    }

    fn start_apoptosis(&mut self, row: usize) {
        let deadline = &mut self.columns.apoptosis_deadlines[row];
        if deadline.is_none() {
            *deadline = Some(self.deadline_hours);
        }
    }
}

impl PositionQuery for ColumnTargets<'_> {
    fn position(&self, row: usize) -> (f64, f64) {
        let position = self.columns.positions()[row];
        (position.x, position.y)
    }
}

/// Candidate selection for a culling policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CullingScope {
    /// Evaluate every live cell in dense iteration order.
    Population,
    /// Evaluate only cells on the convex hull, in hull output order.
    Boundary,
}

/// Outcome of applying one culling policy for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CullOutcome {
    /// Cells considered by the policy this tick.
    pub considered: usize,
    /// Cells transitioned into apoptosis this tick.
    pub killed: usize,
    /// Hull size when the policy ran boundary-scoped.
    pub boundary_size: Option<usize>,
}

/// Stochastic death policy: a per-hour probability, a candidate scope, and an
/// optional resistance modulation.
///
/// Per considered cell the per-hour probability (modulated if configured) is
/// converted to a per-step probability and compared against one uniform draw.
/// Cells already in apoptosis are skipped without consuming a draw.
#[derive(Debug, Clone)]
pub struct CullingPolicy {
    per_hour: f64,
    scope: CullingScope,
    modulation: Option<ResistanceModulation>,
}

impl CullingPolicy {
    /// Create a policy, rejecting out-of-range probabilities at construction
    /// time rather than during a running step.
    pub fn new(
        per_hour: f64,
        scope: CullingScope,
        modulation: Option<ResistanceModulation>,
    ) -> Result<Self, TissueError> {
        if !per_hour.is_finite() || !(0.0..=1.0).contains(&per_hour) {
            return Err(TissueError::InvalidConfig(
                "death probability per hour must lie in [0, 1]",
            ));
        }
        if let Some(modulation) = &modulation {
            modulation.validate()?;
        }
        Ok(Self {
            per_hour,
            scope,
            modulation,
        })
    }

    /// Population-wide death at a flat rate (background tumour cell death).
    pub fn background(per_hour: f64) -> Result<Self, TissueError> {
        Self::new(per_hour, CullingScope::Population, None)
    }

    /// Death restricted to the tumour rim (immune attack).
    pub fn boundary(per_hour: f64) -> Result<Self, TissueError> {
        Self::new(per_hour, CullingScope::Boundary, None)
    }

    /// Population-wide death modulated by each cell's resistance
    /// (chemotherapy).
    pub fn chemotherapy(
        per_hour: f64,
        modulation: ResistanceModulation,
    ) -> Result<Self, TissueError> {
        Self::new(per_hour, CullingScope::Population, Some(modulation))
    }

    /// The configured per-hour death probability.
    #[must_use]
    pub const fn per_hour(&self) -> f64 {
        self.per_hour
    }

    /// The candidate selection scope.
    #[must_use]
    pub const fn scope(&self) -> CullingScope {
        self.scope
    }

    /// Evaluate the policy over `targets` for one tick.
    ///
    /// Boundary scope feeds every live position (apoptotic cells included)
    /// into `extractor` and draws in hull output order; population scope
    /// draws in dense row order and ignores the extractor.
    pub fn apply<T>(
        &self,
        targets: &mut T,
        extractor: &dyn BoundaryExtractor,
        dt_hours: f64,
        rng: &mut dyn RandomSource,
    ) -> CullOutcome
    where
        T: CullTargets + PositionQuery,
    {
        let (rows, boundary_size) = match self.scope {
            CullingScope::Population => ((0..targets.cell_count()).collect::<Vec<_>>(), None),
            CullingScope::Boundary => {
                let points: Vec<(f64, f64)> = (0..targets.cell_count())
                    .map(|row| targets.position(row))
                    .collect();
                let hull = extractor.boundary(&points);
                let size = hull.len();
                (hull, Some(size))
            }
        };

        let considered = rows.len();
        let mut killed = 0;
        for row in rows {
            if targets.is_apoptotic(row) {
                continue;
            }
            let per_hour = match &self.modulation {
                Some(modulation) => modulation.modulate(self.per_hour, targets.resistance(row)),
                None => self.per_hour,
            };
            let per_step = probability::per_step(per_hour, dt_hours);
            if rng.uniform() < per_step {
                targets.start_apoptosis(row);
                killed += 1;
            }
        }

        CullOutcome {
            considered,
            killed,
            boundary_size,
        }
    }
}

/// Summary emitted after each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub hours: f64,
    pub cell_count: usize,
    pub births: usize,
    /// Cells that entered apoptosis this tick.
    pub apoptosis_started: usize,
    /// Cells removed this tick after completing apoptosis.
    pub deaths: usize,
    pub mean_resistance: f64,
    /// Hull size when a boundary-scoped policy ran this tick.
    pub boundary_size: Option<usize>,
    pub limit_exceeded: bool,
}

/// Combined snapshot of a single cell for persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellState {
    pub id: CellId,
    pub data: CellData,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub cells: Vec<CellState>,
}

/// Persistence sink invoked on sampled ticks.
pub trait TissuePersistence: Send {
    fn on_tick(&mut self, batch: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl TissuePersistence for NullPersistence {
    fn on_tick(&mut self, _batch: &PersistenceBatch) {}
}

fn phase_for_age(age: f64, m: f64, g1: f64, s: f64, g2: f64) -> CyclePhase {
    if age < m {
        CyclePhase::M
    } else if age < m + g1 {
        CyclePhase::G1
    } else if age < m + g1 + s {
        CyclePhase::S
    } else {
        // Remains G2 at and beyond readiness; division resets the age.
        let _ = g2;
        CyclePhase::G2
    }
}

/// Aggregate tissue state driving the per-tick pipeline.
///
/// Stage order is fixed: clock, culling (in policy registration order),
/// apoptosis cleanup, cycle aging, division commit, then summary and
/// persistence. Deaths precede births within a tick.
pub struct TissueState {
    config: TissueConfig,
    clock: SimulationClock,
    rng: Box<dyn RandomSource>,
    cells: CellArena,
    policies: Vec<CullingPolicy>,
    extractor: Box<dyn BoundaryExtractor>,
    drift: ResistanceDrift,
    guard: PopulationGuard,
    persistence: Box<dyn TissuePersistence>,
    pending_divisions: Vec<usize>,
    last_births: usize,
    last_started: usize,
    last_removed: usize,
    last_boundary: Option<usize>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for TissueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TissueState")
            .field("config", &self.config)
            .field("tick", &self.clock.tick())
            .field("cell_count", &self.cells.len())
            .field("policy_count", &self.policies.len())
            .finish()
    }
}

impl TissueState {
    /// Instantiate a new tissue using the supplied configuration.
    pub fn new(config: TissueConfig) -> Result<Self, TissueError> {
        let rng = Box::new(config.seeded_source());
        Self::with_parts(
            config,
            rng,
            Box::new(MonotoneChain),
            Box::new(NullPersistence),
        )
    }

    /// Instantiate a new tissue with a custom persistence sink.
    pub fn with_persistence(
        config: TissueConfig,
        persistence: Box<dyn TissuePersistence>,
    ) -> Result<Self, TissueError> {
        let rng = Box::new(config.seeded_source());
        Self::with_parts(config, rng, Box::new(MonotoneChain), persistence)
    }

    /// Fully explicit constructor; the seam used by deterministic tests.
    pub fn with_parts(
        config: TissueConfig,
        rng: Box<dyn RandomSource>,
        extractor: Box<dyn BoundaryExtractor>,
        persistence: Box<dyn TissuePersistence>,
    ) -> Result<Self, TissueError> {
        config.validate()?;
        let clock = SimulationClock::new(config.dt_hours)?;
        let drift = ResistanceDrift::new(config.base_resistance, config.resistance_drift_rate)?;
        let guard = PopulationGuard::new(config.cell_limit);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            clock,
            rng,
            cells: CellArena::new(),
            policies: Vec::new(),
            extractor,
            drift,
            guard,
            persistence,
            pending_divisions: Vec::new(),
            last_births: 0,
            last_started: 0,
            last_removed: 0,
            last_boundary: None,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Register a culling policy. Policies run in registration order.
    pub fn add_policy(&mut self, policy: CullingPolicy) {
        self.policies.push(policy);
    }

    /// Seed a founder cell at `position` with the base resistance, drawing
    /// its G1 duration from the configured distribution.
    pub fn seed_cell(&mut self, position: Position) -> CellId {
        let g1 = self
            .rng
            .normal(self.config.g1_mean_hours, self.config.g1_sd_hours);
        self.cells.insert(CellData {
            position,
            age_hours: 0.0,
            g1_duration_hours: g1,
            phase: CyclePhase::M,
            resistance: self.drift.founder(),
            apoptosis_deadline: None,
        })
    }

    /// Execute one tick of the pipeline, returning its summary.
    pub fn step(&mut self) -> TickSummary {
        self.clock.advance();
        self.stage_culling();
        self.stage_apoptosis_cleanup();
        self.stage_cycle();
        self.stage_division_commit();
        let summary = self.build_summary();
        self.stage_persistence(&summary);
        summary
    }

    fn stage_culling(&mut self) {
        self.last_started = 0;
        self.last_boundary = None;
        if self.policies.is_empty() || self.cells.is_empty() {
            return;
        }
        let dt = self.clock.dt_hours();
        let deadline = self.clock.elapsed_hours() + self.config.apoptosis_duration_hours;

        let Self {
            cells,
            policies,
            extractor,
            rng,
            ..
        } = self;
        let mut targets = ColumnTargets::new(cells.columns_mut(), deadline);
        let mut started = 0;
        let mut boundary = None;
        for policy in policies.iter() {
            let outcome = policy.apply(&mut targets, extractor.as_ref(), dt, rng.as_mut());
            started += outcome.killed;
            if outcome.boundary_size.is_some() {
                boundary = outcome.boundary_size;
            }
        }
        self.last_started = started;
        self.last_boundary = boundary;
    }

    fn stage_apoptosis_cleanup(&mut self) {
        let now = self.clock.elapsed_hours();
        let mut dead = HashSet::new();
        for (row, deadline) in self.cells.columns().apoptosis_deadlines().iter().enumerate() {
            if let Some(deadline) = deadline {
                if *deadline <= now {
                    if let Some(id) = self.cells.handle_at(row) {
                        dead.insert(id);
                    }
                }
            }
        }
        self.last_removed = self.cells.remove_many(&dead);
    }

    fn stage_cycle(&mut self) {
        let dt = self.clock.dt_hours();
        let m = self.config.m_duration_hours;
        let s = self.config.s_duration_hours;
        let g2 = self.config.g2_duration_hours;

        let Self {
            cells,
            pending_divisions,
            ..
        } = self;
        pending_divisions.clear();
        let columns = cells.columns_mut();
        for row in 0..columns.len() {
            if columns.apoptosis_deadlines()[row].is_some() {
                continue;
            }
            let age = columns.ages()[row] + dt;
            columns.ages_mut()[row] = age;
            let g1 = columns.g1_durations()[row];
            columns.phases_mut()[row] = phase_for_age(age, m, g1, s, g2);
            if age >= m + g1 + s + g2 {
                pending_divisions.push(row);
            }
        }
    }

    fn stage_division_commit(&mut self) {
        if self.pending_divisions.is_empty() {
            self.last_births = 0;
            return;
        }
        let cap = self.config.max_spawns_per_tick;
        let orders: Vec<usize> = self.pending_divisions.drain(..).take(cap).collect();
        let radius = self.config.division_separation * 0.5;
        let g1_mean = self.config.g1_mean_hours;
        let g1_sd = self.config.g1_sd_hours;

        let mut spawned = Vec::with_capacity(orders.len());
        for row in orders {
            // Draw order per division event: parent G1, child G1, child
            // resistance drift, then the placement angle.
            let parent_g1 = self.rng.normal(g1_mean, g1_sd);
            let child_g1 = self.rng.normal(g1_mean, g1_sd);
            let parent_resistance = self.cells.columns().resistances()[row];
            let child_resistance = self.drift.child(parent_resistance, self.rng.as_mut());
            let theta = self.rng.uniform() * TAU;
            let (ux, uy) = (theta.cos(), theta.sin());

            let parent_position = self.cells.columns().positions()[row];
            let columns = self.cells.columns_mut();
            columns.ages_mut()[row] = 0.0;
            columns.g1_durations_mut()[row] = parent_g1;
            columns.phases_mut()[row] = CyclePhase::M;
            columns.positions_mut()[row] = Position::new(
                parent_position.x - radius * ux,
                parent_position.y - radius * uy,
            );

            spawned.push(CellData {
                position: Position::new(
                    parent_position.x + radius * ux,
                    parent_position.y + radius * uy,
                ),
                age_hours: 0.0,
                g1_duration_hours: child_g1,
                phase: CyclePhase::M,
                resistance: child_resistance,
                apoptosis_deadline: None,
            });
        }

        self.last_births = spawned.len();
        for cell in spawned {
            self.cells.insert(cell);
        }
    }

    fn build_summary(&self) -> TickSummary {
        let cell_count = self.cells.len();
        let mean_resistance = if cell_count > 0 {
            self.cells.columns().resistances().iter().sum::<f64>() / cell_count as f64
        } else {
            0.0
        };
        TickSummary {
            tick: self.clock.tick(),
            hours: self.clock.elapsed_hours(),
            cell_count,
            births: self.last_births,
            apoptosis_started: self.last_started,
            deaths: self.last_removed,
            mean_resistance,
            boundary_size: self.last_boundary,
            limit_exceeded: self.guard.should_stop(cell_count),
        }
    }

    fn stage_persistence(&mut self, summary: &TickSummary) {
        let interval = self.config.sampling_multiple;
        if interval != 0 && summary.tick.0.is_multiple_of(u64::from(interval)) {
            let cells: Vec<CellState> = self
                .cells
                .iter_handles()
                .filter_map(|id| self.cells.snapshot(id).map(|data| CellState { id, data }))
                .collect();
            let batch = PersistenceBatch {
                summary: summary.clone(),
                cells,
            };
            self.persistence.on_tick(&batch);
        }
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &TissueConfig {
        &self.config
    }

    /// The simulation clock.
    #[must_use]
    pub const fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    /// Read-only access to the cell arena.
    #[must_use]
    pub fn cells(&self) -> &CellArena {
        &self.cells
    }

    /// Number of live cells (apoptotic cells count until removed).
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// The registered culling policies, in application order.
    #[must_use]
    pub fn policies(&self) -> &[CullingPolicy] {
        &self.policies
    }

    /// The population guard.
    #[must_use]
    pub const fn guard(&self) -> &PopulationGuard {
        &self.guard
    }

    /// True iff the guard reports the population over its limit right now.
    #[must_use]
    pub fn limit_exceeded(&self) -> bool {
        self.guard.should_stop(self.cells.len())
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn TissuePersistence>) {
        self.persistence = persistence;
    }
}
