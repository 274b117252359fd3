//! Clock-driven agent world.
//!
//! `WorldState` is the single-threaded simulation core. `SimWorld` wraps it
//! for sharing: reads take the read lock, a tick holds the write lock for its
//! whole duration, and mutations requested by tools are queued and applied at
//! the start of the next tick.

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SimClock;
use crate::config::SimulationConfig;
use crate::entity::{
    Component, ComponentKind, EntityId, EntityStore, Lifecycle, Motion, Position, Profile,
};
use crate::error::{ToolError, ToolResult};
use crate::genome::{Inheritance, TraitSet};

/// Tunables for the simulation core
#[derive(Debug, Clone, PartialEq)]
pub struct SimParams {
    pub fixed_step: f64,
    pub maturity_age: f64,
    pub reproduction_cooldown: f64,
    pub compatibility_threshold: f64,
    pub mating_radius: f64,
    pub max_population: usize,
    pub inheritance: Inheritance,
    pub width: f64,
    pub height: f64,
    pub max_speed: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self::from(&SimulationConfig::default())
    }
}

impl From<&SimulationConfig> for SimParams {
    fn from(c: &SimulationConfig) -> Self {
        Self {
            fixed_step: if c.fixed_step > 0.0 { c.fixed_step } else { 0.25 },
            maturity_age: c.maturity_age,
            reproduction_cooldown: c.reproduction_cooldown,
            compatibility_threshold: c.compatibility_threshold,
            mating_radius: c.mating_radius,
            max_population: c.max_population,
            inheritance: Inheritance {
                weight: c.inheritance_weight,
                mutation_bound: c.mutation_bound,
            },
            width: c.world_width,
            height: c.world_height,
            max_speed: c.max_speed,
        }
    }
}

/// What a caller wants a new agent to look like; missing parts are randomised.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub name: Option<String>,
    pub traits: Option<TraitSet>,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub simulated_delta: f64,
    pub steps: u64,
    pub births: usize,
    pub commands_applied: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldStatus {
    pub simulated_time: f64,
    pub stepped_time: f64,
    pub acceleration: f64,
    pub population: usize,
    pub mature: usize,
    pub births_total: u64,
    pub max_generation: u32,
    pub steps: u64,
    pub real_elapsed_secs: f64,
}

/// Read-only projection of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    pub id: u64,
    pub name: String,
    pub generation: u32,
    pub age: f64,
    pub created_at: f64,
    pub parents: Vec<u64>,
    pub offspring: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub traits: TraitSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct MateCandidate {
    pub id: u64,
    pub name: String,
    pub compatibility: f64,
}

pub struct WorldState {
    clock: SimClock,
    store: EntityStore,
    rng: SmallRng,
    params: SimParams,
    /// Unstepped simulated time in nanoseconds
    accumulator: u128,
    stepped_time: f64,
    steps: u64,
    births: u64,
    named: u64,
}

impl WorldState {
    pub fn new(params: SimParams, clock: SimClock, seed: u64) -> Self {
        Self {
            clock,
            store: EntityStore::new(),
            rng: SmallRng::seed_from_u64(seed),
            params,
            accumulator: 0,
            stepped_time: 0.0,
            steps: 0,
            births: 0,
            named: 0,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> ToolResult<Self> {
        let clock = SimClock::new(config.acceleration, config.max_acceleration)?;
        let seed = config.seed.unwrap_or_else(rand::random);
        Ok(Self::new(SimParams::from(config), clock, seed))
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut SimClock {
        &mut self.clock
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn stepped_time(&self) -> f64 {
        self.stepped_time
    }

    /// Create an agent with generation 0.
    pub fn spawn(&mut self, spec: SpawnSpec) -> EntityId {
        let traits = spec
            .traits
            .unwrap_or_else(|| TraitSet::random(&mut self.rng));
        let position = spec.position.map(|p| self.clamp_to_bounds(p)).unwrap_or_else(|| Position {
            x: self.rng.gen_range(0.0..=self.params.width),
            y: self.rng.gen_range(0.0..=self.params.height),
        });
        let motion = self.random_motion(&traits);
        let name = spec.name.unwrap_or_else(|| self.next_name());

        self.store.create(vec![
            Component::Profile(Profile { name }),
            Component::Traits(traits),
            Component::Position(position),
            Component::Motion(motion),
            Component::Lifecycle(Lifecycle::genesis(self.stepped_time)),
        ])
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        self.store.remove(id)
    }

    /// Explicit reproduction between two named parents. Maturity, cooldown and
    /// compatibility are not checked; population cap and trait presence are.
    pub fn breed(&mut self, a: EntityId, b: EntityId) -> ToolResult<EntityId> {
        if a == b {
            return Err(ToolError::Validation("an agent cannot breed with itself".into()));
        }
        for id in [a, b] {
            if !self.store.contains(id) {
                return Err(ToolError::NotFound(format!("agent {}", id.to_raw())));
            }
            if self.store.traits(id).is_none() {
                return Err(ToolError::Validation(format!(
                    "agent {} has no traits",
                    id.to_raw()
                )));
            }
        }
        if self.store.len() >= self.params.max_population {
            return Err(ToolError::Validation(format!(
                "population cap of {} reached",
                self.params.max_population
            )));
        }
        Ok(self.give_birth(a, b))
    }

    /// Accumulate simulated time and run every whole fixed step it covers.
    /// The remainder is carried to the next call. Time is counted in whole
    /// nanoseconds so the step count depends only on the total.
    pub fn advance(&mut self, delta: f64) -> TickReport {
        let mut report = TickReport {
            simulated_delta: delta,
            ..TickReport::default()
        };
        if delta.is_finite() && delta > 0.0 {
            self.accumulator += to_nanos(delta);
        }
        let step = self.params.fixed_step;
        let step_nanos = to_nanos(step).max(1);
        while self.accumulator >= step_nanos {
            self.accumulator -= step_nanos;
            report.births += self.step(step);
            report.steps += 1;
        }
        report
    }

    fn step(&mut self, dt: f64) -> usize {
        self.steps += 1;
        self.stepped_time = self.steps as f64 * dt;

        for (_, lifecycle) in self.store.lifecycles_mut() {
            lifecycle.age += dt;
        }

        for id in self
            .store
            .query(&[ComponentKind::Position, ComponentKind::Motion])
        {
            self.move_entity(id, dt);
        }

        self.reproduce()
    }

    fn move_entity(&mut self, id: EntityId, dt: f64) {
        let (width, height) = (self.params.width, self.params.height);
        let Some(mut motion) = self.store.motion(id).copied() else {
            return;
        };
        let Some(pos) = self.store.position_mut(id) else {
            return;
        };
        pos.x += motion.vx * dt;
        pos.y += motion.vy * dt;
        if pos.x < 0.0 || pos.x > width {
            pos.x = reflect(pos.x, width);
            motion.vx = -motion.vx;
        }
        if pos.y < 0.0 || pos.y > height {
            pos.y = reflect(pos.y, height);
            motion.vy = -motion.vy;
        }
        if let Some(m) = self.store.motion_mut(id) {
            *m = motion;
        }
    }

    fn is_eligible(&self, id: EntityId) -> bool {
        let Some(lifecycle) = self.store.lifecycle(id) else {
            return false;
        };
        if lifecycle.age < self.params.maturity_age || self.store.traits(id).is_none() {
            return false;
        }
        match lifecycle.last_reproduced_at {
            Some(at) => self.stepped_time - at >= self.params.reproduction_cooldown,
            None => true,
        }
    }

    fn spatially_matched(&self, a: EntityId, b: EntityId) -> bool {
        match (self.store.position(a), self.store.position(b)) {
            (Some(pa), Some(pb)) => pa.distance(pb) <= self.params.mating_radius,
            _ => true,
        }
    }

    /// Greedy pairing in creation order; each agent pairs at most once per step.
    fn reproduce(&mut self) -> usize {
        let eligible: Vec<EntityId> = self
            .store
            .query(&[ComponentKind::Lifecycle, ComponentKind::Traits])
            .into_iter()
            .filter(|id| self.is_eligible(*id))
            .collect();
        if eligible.len() < 2 {
            return 0;
        }

        let mut paired = vec![false; eligible.len()];
        let mut pairs = Vec::new();
        for i in 0..eligible.len() {
            if paired[i] {
                continue;
            }
            for j in (i + 1)..eligible.len() {
                if paired[j] || !self.spatially_matched(eligible[i], eligible[j]) {
                    continue;
                }
                let score = match (self.store.traits(eligible[i]), self.store.traits(eligible[j])) {
                    (Some(a), Some(b)) => a.compatibility(b),
                    _ => 0.0,
                };
                if score >= self.params.compatibility_threshold {
                    paired[i] = true;
                    paired[j] = true;
                    pairs.push((eligible[i], eligible[j]));
                    break;
                }
            }
        }

        let mut born = 0;
        for (a, b) in pairs {
            if self.store.len() >= self.params.max_population {
                debug!(cap = self.params.max_population, "population cap reached");
                break;
            }
            self.give_birth(a, b);
            born += 1;
        }
        born
    }

    fn give_birth(&mut self, a: EntityId, b: EntityId) -> EntityId {
        let empty = TraitSet::new();
        let traits = TraitSet::combine(
            self.store.traits(a).unwrap_or(&empty),
            self.store.traits(b).unwrap_or(&empty),
            self.params.inheritance,
            &mut self.rng,
        );
        let generation = |id| self.store.lifecycle(id).map(|l| l.generation).unwrap_or(0);
        let lifecycle = Lifecycle::offspring_of(
            self.stepped_time,
            &[(a, generation(a)), (b, generation(b))],
        );
        let position = match (self.store.position(a), self.store.position(b)) {
            (Some(pa), Some(pb)) => Position {
                x: (pa.x + pb.x) / 2.0,
                y: (pa.y + pb.y) / 2.0,
            },
            (Some(p), None) | (None, Some(p)) => *p,
            (None, None) => Position {
                x: self.params.width / 2.0,
                y: self.params.height / 2.0,
            },
        };
        let motion = self.random_motion(&traits);
        let name = self.next_name();
        let generation = lifecycle.generation;

        let child = self.store.create(vec![
            Component::Profile(Profile { name }),
            Component::Traits(traits),
            Component::Position(position),
            Component::Motion(motion),
            Component::Lifecycle(lifecycle),
        ]);

        let now = self.stepped_time;
        for parent in [a, b] {
            if let Some(l) = self.store.lifecycle_mut(parent) {
                l.last_reproduced_at = Some(now);
                l.offspring += 1;
            }
        }
        self.births += 1;
        debug!(
            child = child.to_raw(),
            parent_a = a.to_raw(),
            parent_b = b.to_raw(),
            generation,
            "agent born"
        );
        child
    }

    /// Speed scales with curiosity when the agent has that trait.
    fn random_motion(&mut self, traits: &TraitSet) -> Motion {
        let drive = traits.value("curiosity").unwrap_or(0.5);
        let speed = self.params.max_speed * (0.25 + 0.75 * drive);
        let heading = self.rng.gen_range(0.0..std::f64::consts::TAU);
        Motion {
            vx: speed * heading.cos(),
            vy: speed * heading.sin(),
        }
    }

    fn next_name(&mut self) -> String {
        self.named += 1;
        format!("agent-{}", self.named)
    }

    fn clamp_to_bounds(&self, p: Position) -> Position {
        Position {
            x: if p.x.is_finite() { p.x.clamp(0.0, self.params.width) } else { 0.0 },
            y: if p.y.is_finite() { p.y.clamp(0.0, self.params.height) } else { 0.0 },
        }
    }

    pub fn status(&self) -> WorldStatus {
        let ids = self.store.query(&[ComponentKind::Lifecycle]);
        let mature = ids
            .iter()
            .filter(|id| {
                self.store
                    .lifecycle(**id)
                    .map(|l| l.age >= self.params.maturity_age)
                    .unwrap_or(false)
            })
            .count();
        let max_generation = ids
            .iter()
            .filter_map(|id| self.store.lifecycle(*id).map(|l| l.generation))
            .max()
            .unwrap_or(0);
        WorldStatus {
            simulated_time: self.clock.simulated_time(),
            stepped_time: self.stepped_time,
            acceleration: self.clock.acceleration(),
            population: self.store.len(),
            mature,
            births_total: self.births,
            max_generation,
            steps: self.steps,
            real_elapsed_secs: self.clock.real_elapsed_secs(),
        }
    }

    pub fn agent(&self, id: EntityId) -> Option<AgentView> {
        if !self.store.contains(id) {
            return None;
        }
        let lifecycle = self.store.lifecycle(id);
        Some(AgentView {
            id: id.to_raw(),
            name: self
                .store
                .profile(id)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            generation: lifecycle.map(|l| l.generation).unwrap_or(0),
            age: lifecycle.map(|l| l.age).unwrap_or(0.0),
            created_at: lifecycle.map(|l| l.created_at).unwrap_or(0.0),
            parents: lifecycle
                .map(|l| l.parent_ids.iter().map(|p| p.to_raw()).collect())
                .unwrap_or_default(),
            offspring: lifecycle.map(|l| l.offspring).unwrap_or(0),
            position: self.store.position(id).copied(),
            traits: self.store.traits(id).cloned().unwrap_or_default(),
        })
    }

    pub fn agents(&self) -> Vec<AgentView> {
        self.store
            .ids()
            .into_iter()
            .filter_map(|id| self.agent(id))
            .collect()
    }

    pub fn positions(&self) -> Vec<(u64, Position)> {
        self.store
            .query(&[ComponentKind::Position])
            .into_iter()
            .filter_map(|id| self.store.position(id).map(|p| (id.to_raw(), *p)))
            .collect()
    }

    pub fn compatibility(&self, a: EntityId, b: EntityId) -> ToolResult<f64> {
        let ta = self
            .store
            .traits(a)
            .ok_or_else(|| ToolError::NotFound(format!("agent {}", a.to_raw())))?;
        let tb = self
            .store
            .traits(b)
            .ok_or_else(|| ToolError::NotFound(format!("agent {}", b.to_raw())))?;
        Ok(ta.compatibility(tb))
    }

    /// Other agents at or above the compatibility threshold, best first.
    pub fn compatible_mates(&self, id: EntityId, limit: usize) -> ToolResult<Vec<MateCandidate>> {
        let own = self
            .store
            .traits(id)
            .ok_or_else(|| ToolError::NotFound(format!("agent {}", id.to_raw())))?;
        let mut mates: Vec<MateCandidate> = self
            .store
            .query(&[ComponentKind::Traits])
            .into_iter()
            .filter(|other| *other != id)
            .filter_map(|other| {
                let score = own.compatibility(self.store.traits(other)?);
                (score >= self.params.compatibility_threshold).then(|| MateCandidate {
                    id: other.to_raw(),
                    name: self
                        .store
                        .profile(other)
                        .map(|p| p.name.clone())
                        .unwrap_or_default(),
                    compatibility: score,
                })
            })
            .collect();
        mates.sort_by(|a, b| {
            b.compatibility
                .partial_cmp(&a.compatibility)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        mates.truncate(limit);
        Ok(mates)
    }

    /// Parents and children of an agent
    pub fn lineage(&self, id: EntityId) -> ToolResult<serde_json::Value> {
        let lifecycle = self
            .store
            .lifecycle(id)
            .ok_or_else(|| ToolError::NotFound(format!("agent {}", id.to_raw())))?;
        let children: Vec<u64> = self
            .store
            .children_of(id)
            .into_iter()
            .map(|c| c.to_raw())
            .collect();
        Ok(serde_json::json!({
            "id": id.to_raw(),
            "generation": lifecycle.generation,
            "parents": lifecycle.parent_ids.iter().map(|p| p.to_raw()).collect::<Vec<_>>(),
            "children": children,
        }))
    }
}

fn to_nanos(secs: f64) -> u128 {
    (secs * 1e9).round() as u128
}

fn reflect(v: f64, max: f64) -> f64 {
    let r = if v < 0.0 {
        -v
    } else if v > max {
        2.0 * max - v
    } else {
        v
    };
    r.clamp(0.0, max)
}

/// Entity mutations queued for the next tick boundary
#[derive(Debug, Clone)]
pub enum WorldCommand {
    Spawn(SpawnSpec),
    Remove(EntityId),
    Breed(EntityId, EntityId),
}

struct PendingCommand {
    command: WorldCommand,
    reply: oneshot::Sender<ToolResult<EntityId>>,
}

/// Shared handle to the world; the only owner of the entity store.
pub struct SimWorld {
    state: RwLock<WorldState>,
    pending: Mutex<Vec<PendingCommand>>,
}

impl SimWorld {
    pub fn new(state: WorldState) -> Self {
        Self {
            state: RwLock::new(state),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Run a read-only closure against a consistent snapshot (never mid-tick).
    pub fn read<R>(&self, f: impl FnOnce(&WorldState) -> R) -> R {
        f(&self.state.read())
    }

    /// Queue a mutation; it is applied at the start of the next tick.
    pub fn submit(&self, command: WorldCommand) -> oneshot::Receiver<ToolResult<EntityId>> {
        let (reply, rx) = oneshot::channel();
        self.pending.lock().push(PendingCommand { command, reply });
        rx
    }

    /// Queue a mutation and wait for the tick that applies it.
    pub async fn execute(&self, command: WorldCommand) -> ToolResult<EntityId> {
        self.submit(command)
            .await
            .map_err(|_| ToolError::Handler("world stopped before applying command".into()))?
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.lock().len()
    }

    /// One tick driven by elapsed real time.
    pub fn tick_real(&self, real_elapsed: Duration) -> TickReport {
        let mut state = self.state.write();
        let applied = self.apply_pending(&mut state);
        let delta = state.clock.advance(real_elapsed);
        let mut report = state.advance(delta);
        report.commands_applied = applied;
        report
    }

    /// One tick driven by simulated time directly.
    pub fn tick_simulated(&self, delta: f64) -> TickReport {
        let mut state = self.state.write();
        let applied = self.apply_pending(&mut state);
        let delta = state.clock.advance_simulated(delta);
        let mut report = state.advance(delta);
        report.commands_applied = applied;
        report
    }

    fn apply_pending(&self, state: &mut WorldState) -> usize {
        let commands = std::mem::take(&mut *self.pending.lock());
        let mut count = 0;
        for pending in commands {
            // The caller gave up (timed out or was cancelled); do not apply
            if pending.reply.is_closed() {
                debug!(command = ?pending.command, "dropping abandoned world command");
                continue;
            }
            count += 1;
            let outcome = match pending.command {
                WorldCommand::Spawn(spec) => {
                    let id = state.spawn(spec);
                    info!(agent = id.to_raw(), "agent spawned");
                    Ok(id)
                }
                WorldCommand::Remove(id) => {
                    if state.remove(id) {
                        info!(agent = id.to_raw(), "agent removed");
                        Ok(id)
                    } else {
                        Err(ToolError::NotFound(format!("agent {}", id.to_raw())))
                    }
                }
                WorldCommand::Breed(a, b) => state.breed(a, b),
            };
            let _ = pending.reply.send(outcome);
        }
        count
    }

    pub fn set_acceleration(&self, factor: f64) -> ToolResult<f64> {
        let applied = self.state.write().clock.set_acceleration(factor)?;
        info!(acceleration = applied, "time acceleration changed");
        Ok(applied)
    }

    pub fn nudge(&self, amount: f64) {
        self.state.write().clock.nudge(amount);
    }

    pub fn status(&self) -> WorldStatus {
        self.read(|s| s.status())
    }
}

/// Dedicated tick loop; at most one tick runs at a time.
pub struct WorldDriver {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorldDriver {
    pub fn spawn(world: Arc<SimWorld>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = tokio::time::Instant::now();
            info!(interval_ms = interval.as_millis() as u64, "world driver started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = tokio::time::Instant::now();
                        let report = world.tick_real(now - last);
                        last = now;
                        if report.births > 0 || report.commands_applied > 0 {
                            debug!(
                                steps = report.steps,
                                births = report.births,
                                commands = report.commands_applied,
                                "world tick"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("world driver stopped");
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "world driver task failed");
        }
    }
}
