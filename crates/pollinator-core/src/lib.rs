//! Core simulation engine for pollinator foraging and pesticide mortality.
//!
//! The world couples a toroidal continuous plane (flowers, hives, bees) with
//! species-specific stochastic movement, nectar foraging with pesticide
//! exposure, a Hill dose-response mortality model, and hive reproduction.
//! Everything stochastic draws from a single seeded RNG so runs are
//! reproducible tick for tick.

use pollinator_index::{
    IndexError, NeighborhoodIndex, ToroidalGrid, toroidal_delta, toroidal_distance_sq, wrap,
};
use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};
use rand_distr::{Distribution, Normal, Pareto};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

new_key_type! {
    /// Stable handle for bees backed by a generational slot map.
    pub struct BeeId;
}

const FULL_TURN: f32 = std::f32::consts::TAU;

/// Distance under which a homing bee snaps onto its hive.
const ARRIVAL_RADIUS: f32 = 5.0;
/// Fixed step length of a homing bee.
const HOMING_STEP: f32 = 5.0;
/// Energy level at or below which a full bee turns back to its hive.
const HOMING_ENERGY_THRESHOLD: f32 = 20.0;
/// Chance per homing step that a contaminated bee flies off in a random direction.
const DISORIENTED_FLIGHT_PROB: f64 = 0.3;
/// Chance per tick that a contaminated trapliner skips a waypoint.
const WAYPOINT_SKIP_PROB: f64 = 0.3;
/// Number of flower positions a trapliner memorizes at spawn.
const TRAPLINE_MEMORY: usize = 6;

const LEVY_SHAPE: f32 = 2.5;
const LEVY_SCALE_HEALTHY: f32 = 3.0;
const LEVY_SCALE_CONTAMINATED: f32 = 2.1;
const TRAPLINE_NOISE_STD: f32 = 2.0;

/// Bee species selectable for a run. Each carries a fixed parameter set and a
/// movement strategy; there is no per-species subtype beyond this tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    Honeybee,
    Bumblebee,
    Solitary,
}

impl Species {
    /// Fixed physiological and movement constants for the species.
    #[must_use]
    pub const fn profile(self) -> SpeciesProfile {
        match self {
            Self::Honeybee => SpeciesProfile {
                energy_max: 200.0,
                energy_cost: 0.5,
                nectar_capacity: 60,
                sensing_radius: 2.0,
                speed: 5.0,
                ld50_micrograms: 0.0102,
            },
            Self::Bumblebee => SpeciesProfile {
                energy_max: 50.0,
                energy_cost: 0.2,
                nectar_capacity: 100,
                sensing_radius: 2.0,
                speed: 3.0,
                ld50_micrograms: 0.014,
            },
            Self::Solitary => SpeciesProfile {
                energy_max: 50.0,
                energy_cost: 0.3,
                nectar_capacity: 50,
                sensing_radius: 2.0,
                speed: 2.5,
                ld50_micrograms: 0.003_86,
            },
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Honeybee => "honeybee",
            Self::Bumblebee => "bumblebee",
            Self::Solitary => "solitary",
        };
        f.write_str(name)
    }
}

impl FromStr for Species {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "honeybee" => Ok(Self::Honeybee),
            "bumblebee" => Ok(Self::Bumblebee),
            "solitary" => Ok(Self::Solitary),
            other => Err(ConfigError::UnknownSpecies(other.to_string())),
        }
    }
}

/// Pesticide sensitivity class, fixed at bee creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Moderate,
    High,
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for Sensitivity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "moderate" => Ok(Self::Moderate),
            "high" => Ok(Self::High),
            other => Err(ConfigError::UnknownSensitivity(other.to_string())),
        }
    }
}

/// Per-species physiological and movement constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeciesProfile {
    /// Energy a bee starts with and is restored to on hive arrival.
    pub energy_max: f32,
    /// Energy spent per movement invocation.
    pub energy_cost: f32,
    /// Nectar load (micrograms) at which homing becomes possible.
    pub nectar_capacity: u32,
    /// Default flower sensing radius in world units.
    pub sensing_radius: f32,
    /// Cruise speed in world units per tick (unused by the Lévy flier).
    pub speed: f32,
    /// Acute contact LD50 in micrograms.
    pub ld50_micrograms: f64,
}

/// Hill-curve steepness for the (species, sensitivity) pair.
#[must_use]
pub const fn hill_steepness(species: Species, sensitivity: Sensitivity) -> f64 {
    match (species, sensitivity) {
        (Species::Honeybee, Sensitivity::Low) => 1.0,
        (Species::Honeybee, Sensitivity::Moderate) => 2.0,
        (Species::Honeybee, Sensitivity::High) => 4.0,
        (Species::Bumblebee, Sensitivity::Low) => 1.5,
        (Species::Bumblebee, Sensitivity::Moderate) => 3.0,
        (Species::Bumblebee, Sensitivity::High) => 5.0,
        (Species::Solitary, Sensitivity::Low) => 1.0,
        (Species::Solitary, Sensitivity::Moderate) => 2.5,
        (Species::Solitary, Sensitivity::High) => 4.5,
    }
}

/// Per-tick reproduction probability for a hive of the given species.
#[must_use]
pub const fn reproduction_probability(species: Species, hive_contaminated: bool) -> f64 {
    match (species, hive_contaminated) {
        (Species::Honeybee, false) => 0.98,
        (Species::Honeybee, true) => 0.6,
        (Species::Bumblebee, false) => 0.8,
        (Species::Bumblebee, true) => 0.4,
        (Species::Solitary, false) => 0.6,
        (Species::Solitary, true) => 0.2,
    }
}

/// Hill dose-response function mapping cumulative exposure to a death
/// probability. Zero exposure yields exactly zero, so an unexposed bee can
/// never die of poisoning.
#[must_use]
pub fn hill_mortality(exposure: f64, x50: f64, steepness: f64) -> f64 {
    if exposure <= 0.0 {
        return 0.0;
    }
    let xn = exposure.powf(steepness);
    xn / (xn + x50.powf(steepness))
}

/// Axis-aligned 2D position on the toroidal plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    const fn pair(self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// A nectar source. Immutable after placement apart from the contamination
/// flag, which is drawn once during world setup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Flower {
    pub position: Position,
    /// Nectar yield in micrograms, drawn once at creation.
    pub nectar_amount: u32,
    /// Pesticide concentration in parts per billion.
    pub concentration_ppb: f64,
    pub contaminated: bool,
}

impl Flower {
    /// Pesticide dose (micrograms) a bee receives from one visit.
    #[must_use]
    pub fn dosage_micrograms(&self) -> f64 {
        f64::from(self.nectar_amount) * self.concentration_ppb * 1e-6
    }
}

/// A colony site. Never removed; accumulates food from arriving bees and
/// turns contaminated, permanently, when a contaminated bee returns to it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Hive {
    pub position: Position,
    pub food_store: f64,
    pub contaminated: bool,
}

impl Hive {
    #[must_use]
    const fn at(position: Position) -> Self {
        Self {
            position,
            food_store: 0.0,
            contaminated: false,
        }
    }
}

/// A single pollinator. The species is a world-level setting; bees carry only
/// the state that varies per individual.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bee {
    pub position: Position,
    pub energy: f32,
    /// Collected nectar in micrograms. May overshoot capacity; the surplus is
    /// delivered in full at the next hive arrival.
    pub nectar_load: u32,
    /// Lifetime pesticide intake in micrograms. Never decreases.
    pub cumulative_exposure: f64,
    /// Sticky flag: set on the first contaminated flower visit, never cleared.
    pub contaminated: bool,
    pub sensitivity: Sensitivity,
    /// Index of the bee's home hive. Assigned at creation, never reassigned.
    pub home_hive: usize,
    /// Remembered flower positions (trapline species only).
    pub waypoints: Vec<Position>,
    pub waypoint_index: usize,
}

impl Bee {
    /// Whether the bee is in homing mode this tick: full load and not enough
    /// energy left to keep foraging opportunistically.
    #[must_use]
    pub fn is_homing(&self, capacity: u32) -> bool {
        self.nectar_load >= capacity && self.energy <= HOMING_ENERGY_THRESHOLD
    }
}

/// Dense arena of live bees with generational handles.
///
/// Handles iterate in insertion order (stable modulo swap-removal), which
/// keeps seeded runs deterministic without hashing.
#[derive(Debug, Default)]
pub struct BeeArena {
    slots: SlotMap<BeeId, Bee>,
    indices: SecondaryMap<BeeId, usize>,
    handles: Vec<BeeId>,
}

impl BeeArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bees.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true when no bees are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns true if `id` refers to a live bee.
    #[must_use]
    pub fn contains(&self, id: BeeId) -> bool {
        self.slots.contains_key(id)
    }

    /// Dense handle slice in iteration order.
    #[must_use]
    pub fn handles(&self) -> &[BeeId] {
        &self.handles
    }

    /// Iterate over live bees in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (BeeId, &Bee)> + '_ {
        self.handles
            .iter()
            .filter_map(|id| self.slots.get(*id).map(|bee| (*id, bee)))
    }

    /// Borrow a bee by handle.
    #[must_use]
    pub fn get(&self, id: BeeId) -> Option<&Bee> {
        self.slots.get(id)
    }

    /// Mutably borrow a bee by handle.
    #[must_use]
    pub fn get_mut(&mut self, id: BeeId) -> Option<&mut Bee> {
        self.slots.get_mut(id)
    }

    /// Insert a new bee and return its handle.
    pub fn insert(&mut self, bee: Bee) -> BeeId {
        let id = self.slots.insert(bee);
        self.indices.insert(id, self.handles.len());
        self.handles.push(id);
        id
    }

    /// Remove `id`, returning its last state if it was present.
    pub fn remove(&mut self, id: BeeId) -> Option<Bee> {
        let bee = self.slots.remove(id)?;
        if let Some(index) = self.indices.remove(id) {
            self.handles.swap_remove(index);
            if index < self.handles.len() {
                let moved = self.handles[index];
                if let Some(slot) = self.indices.get_mut(moved) {
                    *slot = index;
                }
            }
        }
        Some(bee)
    }
}

/// Errors raised while validating configuration or building a world.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates a configuration value that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("unknown species '{0}' (expected honeybee, bumblebee, or solitary)")]
    UnknownSpecies(String),
    #[error("unknown sensitivity class '{0}' (expected low, moderate, or high)")]
    UnknownSensitivity(String),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Static configuration for a pollinator world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollinatorConfig {
    /// Active species for the run; the world is monospecific.
    pub species: Species,
    /// Sensitivity class assigned to every bee created in this world.
    pub sensitivity: Sensitivity,
    /// Width of the plane in world units.
    pub world_width: f32,
    /// Height of the plane in world units.
    pub world_height: f32,
    /// Bees created at setup.
    pub initial_bees: usize,
    /// Flowers scattered at setup.
    pub flower_count: usize,
    /// Hives placed at setup.
    pub hive_count: usize,
    /// Probability that a flower starts contaminated.
    pub pesticide_ratio: f64,
    /// Overrides the species' default flower sensing radius.
    pub sensing_radius_override: Option<f32>,
    /// When set, a hive must hold this much food to reproduce and pays it per
    /// birth. `None` reproduces for free.
    pub reproduction_food_cost: Option<f64>,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for PollinatorConfig {
    fn default() -> Self {
        Self {
            species: Species::Honeybee,
            sensitivity: Sensitivity::Moderate,
            world_width: 150.0,
            world_height: 150.0,
            initial_bees: 100,
            flower_count: 200,
            hive_count: 2,
            pesticide_ratio: 0.7,
            sensing_radius_override: None,
            reproduction_food_cost: None,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl PollinatorConfig {
    /// Validates the configuration before any world state is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_width <= 0.0 || self.world_height <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "world dimensions must be positive",
            ));
        }
        if self.hive_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "at least one hive is required",
            ));
        }
        if !(0.0..=1.0).contains(&self.pesticide_ratio) {
            return Err(ConfigError::InvalidConfig(
                "pesticide_ratio must lie in [0, 1]",
            ));
        }
        if let Some(radius) = self.sensing_radius_override {
            if radius <= 0.0 {
                return Err(ConfigError::InvalidConfig(
                    "sensing radius override must be positive",
                ));
            }
        }
        if let Some(cost) = self.reproduction_food_cost {
            if cost < 0.0 {
                return Err(ConfigError::InvalidConfig(
                    "reproduction food cost must be non-negative",
                ));
            }
        }
        if self.species == Species::Bumblebee && self.flower_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "trapline species needs at least one flower to memorize",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Sensing radius in effect for this run.
    #[must_use]
    pub fn sensing_radius(&self) -> f32 {
        self.sensing_radius_override
            .unwrap_or(self.species.profile().sensing_radius)
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
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

/// Aggregates emitted to the data collector after each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub population: usize,
    pub births: usize,
    pub deaths: usize,
    pub mean_exposure: f64,
    pub contaminated_bees: usize,
    pub mean_nectar: f64,
    pub hive_food_total: f64,
}

/// Scalar metric forwarded alongside the summary.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: Cow<'static, str>,
    pub value: f64,
}

impl MetricSample {
    /// Creates a new metric sample.
    #[must_use]
    pub fn new(name: impl Into<Cow<'static, str>>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Payload handed to the data collector once per tick.
#[derive(Debug, Clone)]
pub struct CollectorBatch {
    pub summary: TickSummary,
    pub metrics: Vec<MetricSample>,
}

/// Per-tick observer. The reporting layer implements this; the core never
/// depends on how the numbers are stored or drawn.
pub trait DataCollector: Send {
    fn on_tick(&mut self, batch: &CollectorBatch);
}

/// No-op collector.
#[derive(Debug, Default)]
pub struct NullCollector;

impl DataCollector for NullCollector {
    fn on_tick(&mut self, _batch: &CollectorBatch) {}
}

/// Tag attached to each entity in a render snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderTag {
    Bee(Species),
    Flower,
    Hive,
}

/// One drawable entity: enough for an external renderer, nothing more.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RenderEntity {
    pub position: Position,
    pub tag: RenderTag,
    pub contaminated: bool,
}

/// Aggregate world state: entities, spatial index, RNG, and tick pipeline.
pub struct WorldState {
    config: PollinatorConfig,
    tick: Tick,
    rng: SmallRng,
    bees: BeeArena,
    flowers: Vec<Flower>,
    hives: Vec<Hive>,
    flower_index: ToroidalGrid,
    sensing_radius: f32,
    levy_steps: Pareto<f32>,
    trapline_noise: Normal<f32>,
    heading_noise: Normal<f32>,
    collector: Box<dyn DataCollector>,
    history: VecDeque<TickSummary>,
    pending_spawns: Vec<Bee>,
    last_births: usize,
    last_deaths: usize,
    nectar_delivered_total: f64,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("bee_count", &self.bees.len())
            .field("flower_count", &self.flowers.len())
            .field("hive_count", &self.hives.len())
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: PollinatorConfig) -> Result<Self, ConfigError> {
        Self::with_collector(config, Box::new(NullCollector))
    }

    /// Instantiate a new world with a data collector attached.
    pub fn with_collector(
        config: PollinatorConfig,
        collector: Box<dyn DataCollector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let sensing_radius = config.sensing_radius();

        let width = config.world_width;
        let height = config.world_height;
        let cell_size = sensing_radius.max(ARRIVAL_RADIUS);
        let mut flower_index = ToroidalGrid::new(cell_size, width, height)?;

        let mut flowers = Vec::with_capacity(config.flower_count);
        for _ in 0..config.flower_count {
            let position = Position::new(
                rng.random_range(0.0..width),
                rng.random_range(0.0..height),
            );
            flowers.push(Flower {
                position,
                nectar_amount: rng.random_range(10..=51),
                concentration_ppb: rng.random_range(1.9..46.4),
                contaminated: rng.random_bool(config.pesticide_ratio),
            });
        }
        let flower_positions: Vec<(f32, f32)> =
            flowers.iter().map(|f| f.position.pair()).collect();
        flower_index.rebuild(&flower_positions)?;

        let mut hives = Vec::with_capacity(config.hive_count);
        for _ in 0..config.hive_count {
            let position = Position::new(
                rng.random_range(0.0..width),
                rng.random_range(0.0..height),
            );
            hives.push(Hive::at(position));
        }

        let levy_steps = Pareto::new(1.0, LEVY_SHAPE)
            .map_err(|_| ConfigError::InvalidConfig("invalid Lévy step distribution"))?;
        let trapline_noise = Normal::new(0.0, TRAPLINE_NOISE_STD)
            .map_err(|_| ConfigError::InvalidConfig("invalid trapline noise distribution"))?;
        let heading_noise = Normal::new(0.0, std::f32::consts::FRAC_PI_2)
            .map_err(|_| ConfigError::InvalidConfig("invalid heading noise distribution"))?;

        let history_capacity = config.history_capacity;
        let initial_bees = config.initial_bees;
        let mut world = Self {
            config,
            tick: Tick::zero(),
            rng,
            bees: BeeArena::new(),
            flowers,
            hives,
            flower_index,
            sensing_radius,
            levy_steps,
            trapline_noise,
            heading_noise,
            collector,
            history: VecDeque::with_capacity(history_capacity),
            pending_spawns: Vec::new(),
            last_births: 0,
            last_deaths: 0,
            nectar_delivered_total: 0.0,
        };

        // Each initial bee picks its home hive uniformly at random.
        for _ in 0..initial_bees {
            let hive = world.rng.random_range(0..world.hives.len());
            let bee = world.hatch_bee(hive);
            world.bees.insert(bee);
        }
        Ok(world)
    }

    /// Build a fresh bee bound to `hive`, placed at the hive's position.
    fn hatch_bee(&mut self, hive: usize) -> Bee {
        let profile = self.config.species.profile();
        let waypoints = if self.config.species == Species::Bumblebee {
            (0..TRAPLINE_MEMORY)
                .map(|_| {
                    let pick = self.rng.random_range(0..self.flowers.len());
                    self.flowers[pick].position
                })
                .collect()
        } else {
            Vec::new()
        };
        Bee {
            position: self.hives[hive].position,
            energy: profile.energy_max,
            nectar_load: 0,
            cumulative_exposure: 0.0,
            contaminated: false,
            sensitivity: self.config.sensitivity,
            home_hive: hive,
            waypoints,
            waypoint_index: 0,
        }
    }

    /// Spawn a bee bound to the given hive, returning its handle. `None` when
    /// the hive index is out of range.
    pub fn spawn_bee(&mut self, hive: usize) -> Option<BeeId> {
        if hive >= self.hives.len() {
            return None;
        }
        let bee = self.hatch_bee(hive);
        Some(self.bees.insert(bee))
    }

    /// Remove a bee by handle, returning its last known state.
    pub fn remove_bee(&mut self, id: BeeId) -> Option<Bee> {
        self.bees.remove(id)
    }

    /// Execute one simulation tick and emit the resulting summary.
    pub fn step(&mut self) -> TickSummary {
        let next_tick = self.tick.next();
        self.last_births = 0;
        self.last_deaths = 0;

        self.stage_bees();
        self.stage_hives();
        self.stage_spawn_commit();
        let summary = self.stage_collect(next_tick);

        self.tick = next_tick;
        summary
    }

    /// Activate a snapshot of the live population in randomized order. Bees
    /// born this tick sit in `pending_spawns` and are never observed here.
    fn stage_bees(&mut self) {
        let mut order: Vec<BeeId> = self.bees.handles().to_vec();
        order.shuffle(&mut self.rng);
        for id in order {
            self.step_bee(id);
        }
    }

    /// Mortality gate first, then the behavior branch. A removed bee performs
    /// no further action this tick, and removal happens at most once.
    fn step_bee(&mut self, id: BeeId) {
        let (energy, homing) = match self.bees.get(id) {
            Some(bee) => {
                let capacity = self.config.species.profile().nectar_capacity;
                (bee.energy, bee.is_homing(capacity))
            }
            None => return,
        };

        let probability = match self.poison_probability(id) {
            Some(p) => p,
            None => return,
        };
        if self.rng.random::<f64>() < probability {
            self.bees.remove(id);
            self.last_deaths += 1;
            return;
        }
        if energy <= 0.0 {
            self.bees.remove(id);
            self.last_deaths += 1;
            return;
        }

        if homing {
            self.return_to_hive(id);
        } else {
            self.flight(id);
            self.forage(id);
        }
    }

    /// Poison death probability for the bee this tick, keyed by the bee's own
    /// sensitivity class rather than the world default.
    #[must_use]
    pub fn poison_probability(&self, id: BeeId) -> Option<f64> {
        let bee = self.bees.get(id)?;
        let profile = self.config.species.profile();
        let steepness = hill_steepness(self.config.species, bee.sensitivity);
        Some(hill_mortality(
            bee.cumulative_exposure,
            profile.ld50_micrograms,
            steepness,
        ))
    }

    /// Run the species movement strategy: compute a displacement, wrap the new
    /// position, and charge the per-move energy cost.
    fn flight(&mut self, id: BeeId) {
        let displacement = match self.config.species {
            Species::Honeybee => self.levy_displacement(id),
            Species::Solitary => self.walk_displacement(id),
            Species::Bumblebee => self.trapline_displacement(id),
        };
        let (dx, dy) = match displacement {
            Some(d) => d,
            None => return,
        };
        let width = self.config.world_width;
        let height = self.config.world_height;
        let cost = self.config.species.profile().energy_cost;
        if let Some(bee) = self.bees.get_mut(id) {
            bee.position.x = wrap(bee.position.x + dx, width);
            bee.position.y = wrap(bee.position.y + dy, height);
            bee.energy -= cost;
        }
    }

    /// Lévy flight: uniform heading, heavy-tailed step length. Contaminated
    /// fliers draw from a scaled-down step distribution.
    fn levy_displacement(&mut self, id: BeeId) -> Option<(f32, f32)> {
        let contaminated = self.bees.get(id)?.contaminated;
        let angle = self.rng.random_range(0.0..FULL_TURN);
        let scale = if contaminated {
            LEVY_SCALE_CONTAMINATED
        } else {
            LEVY_SCALE_HEALTHY
        };
        // Pareto(1, shape) minus its minimum gives the Lomax-shaped tail the
        // original step model used.
        let step = (self.levy_steps.sample(&mut self.rng) - 1.0) * scale;
        Some((angle.cos() * step, angle.sin() * step))
    }

    /// Biased random walk: uniform heading, Gaussian-perturbed and slowed to
    /// half speed when contaminated.
    fn walk_displacement(&mut self, id: BeeId) -> Option<(f32, f32)> {
        let contaminated = self.bees.get(id)?.contaminated;
        let mut angle = self.rng.random_range(0.0..FULL_TURN);
        let mut step = self.config.species.profile().speed;
        if contaminated {
            angle += self.heading_noise.sample(&mut self.rng);
            step *= 0.5;
        }
        Some((angle.cos() * step, angle.sin() * step))
    }

    /// Trapline: advance along the remembered route each tick; contaminated
    /// bees sometimes skip a waypoint in a random direction and fly at 0.7x
    /// speed. Gaussian positional noise rides on every move.
    fn trapline_displacement(&mut self, id: BeeId) -> Option<(f32, f32)> {
        let (contaminated, len, index) = {
            let bee = self.bees.get(id)?;
            (bee.contaminated, bee.waypoints.len(), bee.waypoint_index)
        };
        if len == 0 {
            return None;
        }
        let next_index = if contaminated && self.rng.random_bool(WAYPOINT_SKIP_PROB) {
            let offset: isize = if self.rng.random_bool(0.5) { 1 } else { -1 };
            (index as isize + offset).rem_euclid(len as isize) as usize
        } else {
            (index + 1) % len
        };

        let (position, target) = {
            let bee = self.bees.get_mut(id)?;
            bee.waypoint_index = next_index;
            (bee.position, bee.waypoints[next_index])
        };

        let width = self.config.world_width;
        let height = self.config.world_height;
        let dx = toroidal_delta(position.x, target.x, width);
        let dy = toroidal_delta(position.y, target.y, height);
        let distance = (dx * dx + dy * dy).sqrt();
        let (ux, uy) = if distance > 0.0 {
            (dx / distance, dy / distance)
        } else {
            (0.0, 0.0)
        };

        let speed_factor = if contaminated { 0.7 } else { 1.0 };
        let speed = self.config.species.profile().speed * speed_factor;
        let noise_x = self.trapline_noise.sample(&mut self.rng);
        let noise_y = self.trapline_noise.sample(&mut self.rng);
        Some((ux * speed + noise_x, uy * speed + noise_y))
    }

    /// Collect from every flower within sensing range of the bee's position.
    /// Load overshoot is allowed; the surplus is squared up at hive delivery.
    fn forage(&mut self, id: BeeId) {
        let position = match self.bees.get(id) {
            Some(bee) => bee.position,
            None => return,
        };
        let mut visited: Vec<usize> = Vec::new();
        self.flower_index.neighbors_within(
            position.pair(),
            self.sensing_radius,
            true,
            &mut |idx, _| visited.push(idx),
        );
        if visited.is_empty() {
            return;
        }

        let mut nectar_gain: u32 = 0;
        let mut energy_gain: f32 = 0.0;
        let mut exposure_gain: f64 = 0.0;
        let mut touched_contaminated = false;
        for idx in visited {
            let flower = &self.flowers[idx];
            nectar_gain += flower.nectar_amount;
            energy_gain += self.rng.random_range(4u32..=10) as f32;
            if flower.contaminated {
                exposure_gain += flower.dosage_micrograms();
                touched_contaminated = true;
            }
        }

        let energy_max = self.config.species.profile().energy_max;
        if let Some(bee) = self.bees.get_mut(id) {
            bee.nectar_load += nectar_gain;
            bee.energy = (bee.energy + energy_gain).min(energy_max);
            bee.cumulative_exposure += exposure_gain;
            if touched_contaminated {
                bee.contaminated = true;
            }
        }
    }

    /// Move directly toward the home hive; on arrival transfer the load,
    /// restore energy, and propagate contamination into the hive.
    fn return_to_hive(&mut self, id: BeeId) {
        let (position, contaminated, load, hive_idx) = match self.bees.get(id) {
            Some(bee) => (
                bee.position,
                bee.contaminated,
                bee.nectar_load,
                bee.home_hive,
            ),
            None => return,
        };
        let width = self.config.world_width;
        let height = self.config.world_height;
        let hive_position = self.hives[hive_idx].position;
        let dx = toroidal_delta(position.x, hive_position.x, width);
        let dy = toroidal_delta(position.y, hive_position.y, height);
        let distance = (dx * dx + dy * dy).sqrt();

        if distance < ARRIVAL_RADIUS {
            let delivered = f64::from(load);
            let hive = &mut self.hives[hive_idx];
            hive.food_store += delivered;
            if contaminated {
                hive.contaminated = true;
            }
            self.nectar_delivered_total += delivered;

            let energy_max = self.config.species.profile().energy_max;
            if let Some(bee) = self.bees.get_mut(id) {
                bee.position = hive_position;
                bee.nectar_load = 0;
                bee.energy = energy_max;
                bee.waypoint_index = 0;
            }
            return;
        }

        let (ux, uy) = if contaminated && self.rng.random_bool(DISORIENTED_FLIGHT_PROB) {
            // Disoriented flight replaces the hive bearing with a random one.
            let rx: f32 = self.rng.random_range(-1.0..1.0);
            let ry: f32 = self.rng.random_range(-1.0..1.0);
            let norm = (rx * rx + ry * ry).sqrt();
            if norm > 0.0 {
                (rx / norm, ry / norm)
            } else {
                (1.0, 0.0)
            }
        } else {
            (dx / distance, dy / distance)
        };

        let cost = self.config.species.profile().energy_cost;
        if let Some(bee) = self.bees.get_mut(id) {
            bee.position.x = wrap(bee.position.x + ux * HOMING_STEP, width);
            bee.position.y = wrap(bee.position.y + uy * HOMING_STEP, height);
            bee.energy -= cost;
        }
    }

    /// One reproduction draw per hive. Successful draws queue a spawn; the
    /// population itself is only mutated at commit time.
    fn stage_hives(&mut self) {
        let species = self.config.species;
        for hive_idx in 0..self.hives.len() {
            let probability = reproduction_probability(species, self.hives[hive_idx].contaminated);
            if self.rng.random::<f64>() >= probability {
                continue;
            }
            if let Some(cost) = self.config.reproduction_food_cost {
                if self.hives[hive_idx].food_store < cost {
                    continue;
                }
                self.hives[hive_idx].food_store -= cost;
            }
            let bee = self.hatch_bee(hive_idx);
            self.pending_spawns.push(bee);
        }
    }

    fn stage_spawn_commit(&mut self) {
        if self.pending_spawns.is_empty() {
            return;
        }
        let spawns = std::mem::take(&mut self.pending_spawns);
        self.last_births = spawns.len();
        for bee in spawns {
            self.bees.insert(bee);
        }
    }

    /// Build the tick summary, notify the collector, and retain history.
    fn stage_collect(&mut self, next_tick: Tick) -> TickSummary {
        let population = self.bees.len();
        let mut exposure_sum = 0.0_f64;
        let mut nectar_sum = 0.0_f64;
        let mut contaminated_bees = 0_usize;
        for (_, bee) in self.bees.iter() {
            exposure_sum += bee.cumulative_exposure;
            nectar_sum += f64::from(bee.nectar_load);
            if bee.contaminated {
                contaminated_bees += 1;
            }
        }
        let mean = |sum: f64| {
            if population > 0 {
                sum / population as f64
            } else {
                0.0
            }
        };
        let hive_food_total: f64 = self.hives.iter().map(|hive| hive.food_store).sum();

        let summary = TickSummary {
            tick: next_tick,
            population,
            births: self.last_births,
            deaths: self.last_deaths,
            mean_exposure: mean(exposure_sum),
            contaminated_bees,
            mean_nectar: mean(nectar_sum),
            hive_food_total,
        };
        let metrics = vec![
            MetricSample::new("population", population as f64),
            MetricSample::new("mean_exposure", summary.mean_exposure),
            MetricSample::new("contaminated_bees", contaminated_bees as f64),
            MetricSample::new("mean_nectar", summary.mean_nectar),
            MetricSample::new("hive_food_total", hive_food_total),
        ];
        let batch = CollectorBatch {
            summary: summary.clone(),
            metrics,
        };
        self.collector.on_tick(&batch);

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &PollinatorConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the bee arena.
    #[must_use]
    pub fn bees(&self) -> &BeeArena {
        &self.bees
    }

    /// Mutable access to the bee arena.
    #[must_use]
    pub fn bees_mut(&mut self) -> &mut BeeArena {
        &mut self.bees
    }

    /// Flowers in placement order.
    #[must_use]
    pub fn flowers(&self) -> &[Flower] {
        &self.flowers
    }

    /// Hives in placement order.
    #[must_use]
    pub fn hives(&self) -> &[Hive] {
        &self.hives
    }

    /// Number of live bees.
    #[must_use]
    pub fn population(&self) -> usize {
        self.bees.len()
    }

    /// Sensing radius in effect for this run.
    #[must_use]
    pub const fn sensing_radius(&self) -> f32 {
        self.sensing_radius
    }

    /// Sum of all nectar ever delivered into hives.
    #[must_use]
    pub const fn nectar_delivered_total(&self) -> f64 {
        self.nectar_delivered_total
    }

    /// Replace the data collector.
    pub fn set_collector(&mut self, collector: Box<dyn DataCollector>) {
        self.collector = collector;
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Derived index of live bees per hive, rebuilt on demand.
    #[must_use]
    pub fn bees_of_hive(&self, hive: usize) -> Vec<BeeId> {
        self.bees
            .iter()
            .filter(|(_, bee)| bee.home_hive == hive)
            .map(|(id, _)| id)
            .collect()
    }

    /// Snapshot of every entity for an external renderer: position, tag, and
    /// contamination flag, nothing else.
    pub fn render_entities(&self) -> impl Iterator<Item = RenderEntity> + '_ {
        let species = self.config.species;
        self.flowers
            .iter()
            .map(|flower| RenderEntity {
                position: flower.position,
                tag: RenderTag::Flower,
                contaminated: flower.contaminated,
            })
            .chain(self.hives.iter().map(|hive| RenderEntity {
                position: hive.position,
                tag: RenderTag::Hive,
                contaminated: hive.contaminated,
            }))
            .chain(self.bees.iter().map(move |(_, bee)| RenderEntity {
                position: bee.position,
                tag: RenderTag::Bee(species),
                contaminated: bee.contaminated,
            }))
    }

    /// Toroidal distance between two points on this world's plane.
    #[must_use]
    pub fn distance(&self, a: Position, b: Position) -> f32 {
        toroidal_distance_sq(
            a.pair(),
            b.pair(),
            self.config.world_width,
            self.config.world_height,
        )
        .sqrt()
    }
}
