use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use fuzzx_dsa::{BranchTree, NodeId};
use fuzzx_io::bits::{bits_to_bytes, bytes_to_bits};
use fuzzx_io::{ExecutionTrace, InputType, Predicate, StdinRecord};

use crate::math::{
    add_scaled, added, axis, component_orthogonal_to, dot, is_finite, max_abs, scale, scaled,
    small_delta_around,
};
use crate::overlay::{smallest_step, TypedValue};
use crate::Analysis;

const MAX_CLIP_ITERATIONS: usize = 10;
const STEP_DOUBLINGS: u32 = 64;

/// True when every sensitive bit falls inside a chunk of known type;
/// the typed descent refuses untyped widths.
pub fn types_of_sensitive_bits_available(stdin: &StdinRecord, bits: &BTreeSet<u32>) -> bool {
    !bits.is_empty()
        && bits
            .iter()
            .all(|&bit| stdin.types[stdin.type_index(bit)].is_known())
}

#[derive(Debug, Default, Clone)]
pub struct TypedStats {
    pub start_calls: usize,
    pub generated_inputs: usize,
    pub partials: usize,
    pub gradient_steps: usize,
    pub stop_calls_regular: usize,
    pub stop_calls_early: usize,
    pub stop_calls_failed: usize,
}

/// Which bits of which typed chunk a variable occupies.
#[derive(Debug, Clone)]
struct VariableMap {
    start_bit: u32,
    ty: InputType,
    /// Sensitive bit offsets inside the chunk; the remaining chunk
    /// bits keep their witness values.
    value_bit_indices: Vec<u8>,
}

/// One branching along the path, oriented so its predicate must hold
/// (interior nodes) or become true (the target).
#[derive(Debug)]
struct PathFrame {
    node: NodeId,
    value: f64,
    direction: bool,
    predicate: Predicate,
    variables: HashSet<usize>,
}

/// Half-space in world coordinates: a clipped shift `d` must satisfy
/// `dot(d, normal) / dot(normal, normal)  <predicate>  param`.
#[derive(Debug, Clone)]
struct Constraint {
    normal: Vec<f64>,
    param: f64,
    predicate: Predicate,
}

/// Local coordinate frame of one path branching: a unit-orthogonal
/// world basis of the subspace the earlier constraints leave free,
/// and the finite-difference gradient over it.
#[derive(Debug)]
struct LocalSpace {
    basis: Vec<Vec<f64>>,
    gradient: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Partials,
    Descent,
}

#[derive(Debug)]
struct PendingPartial {
    basis_index: usize,
    lambda: f64,
    alternatives: Vec<f64>,
}

#[derive(Debug, Default)]
struct DescentProps {
    shifts: Vec<Vec<f64>>,
    points: Vec<Vec<f64>>,
    results: Vec<Option<Vec<f64>>>,
    emitted: usize,
}

/// Gradient descent over the typed stdin variables, constrained to
/// keep the witness path stable up to the target branching.
///
/// Builds one local frame per path node: each frame is an orthogonal
/// basis of the subspace orthogonal to the previous frame's gradient,
/// so the final frame isolates the directions along which the target
/// value still moves freely. Interior non-equality predicates become
/// half-space constraints that every descent candidate is clipped
/// against.
pub struct TypedMinimization {
    busy: bool,
    node: Option<NodeId>,
    witness: Option<Arc<StdinRecord>>,
    execution_id: u32,
    path: Vec<PathFrame>,
    variables: Vec<VariableMap>,
    types: Vec<InputType>,
    origin: Vec<f64>,
    tested_origins: HashSet<Vec<u8>>,
    spaces: Vec<LocalSpace>,
    constraints: Vec<Constraint>,
    stage: Stage,
    pending: Option<PendingPartial>,
    descent: DescentProps,
    num_executions: u32,
    max_executions: u32,
    failed: bool,
    stopped_early: bool,
    stats: TypedStats,
}

impl TypedMinimization {
    pub fn new() -> Self {
        Self {
            busy: false,
            node: None,
            witness: None,
            execution_id: 0,
            path: Vec::new(),
            variables: Vec::new(),
            types: Vec::new(),
            origin: Vec::new(),
            tested_origins: HashSet::new(),
            spaces: Vec::new(),
            constraints: Vec::new(),
            stage: Stage::Partials,
            pending: None,
            descent: DescentProps::default(),
            num_executions: 0,
            max_executions: 0,
            failed: false,
            stopped_early: false,
            stats: TypedStats::default(),
        }
    }

    pub fn start(&mut self, tree: &BranchTree, node: NodeId, execution_id: u32) {
        assert!(self.is_ready(), "typed minimization already running");
        let n = tree.node(node);
        let witness = n.best_stdin.clone().expect("target carries a witness");
        let trace = n.best_trace.clone().expect("target carries a witness");

        let path_ids = tree.path_to_root(node);
        let directions = tree.path_directions(&path_ids);

        self.path = path_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let pn = tree.node(id);
                let value = trace[pn.trace_index as usize].value;
                let (direction, predicate) = if i + 1 < path_ids.len() {
                    let dir = directions[i];
                    (dir, if dir { pn.predicate } else { pn.predicate.opposite() })
                } else {
                    // Aim for the unexplored direction of the target.
                    let dir = !pn.is_direction_unexplored(false);
                    (dir, if dir { pn.predicate } else { pn.predicate.opposite() })
                };
                PathFrame {
                    node: id,
                    value,
                    direction,
                    predicate,
                    variables: HashSet::new(),
                }
            })
            .collect();

        // Group the union of path-sensitive bits into typed variables.
        let mut chunks: BTreeMap<u32, (InputType, BTreeSet<u8>)> = BTreeMap::new();
        for &id in &path_ids {
            for &bit in &tree.node(id).sensitive_bits {
                let type_index = witness.type_index(bit);
                let start = witness.type_start_bit_index(type_index);
                let entry = chunks
                    .entry(start)
                    .or_insert_with(|| (witness.types[type_index], BTreeSet::new()));
                entry.1.insert((bit - start) as u8);
            }
        }
        self.variables = chunks
            .iter()
            .map(|(&start_bit, (ty, offsets))| VariableMap {
                start_bit,
                ty: *ty,
                value_bit_indices: offsets.iter().copied().collect(),
            })
            .collect();
        self.types = self.variables.iter().map(|v| v.ty).collect();

        let var_of_start: BTreeMap<u32, usize> = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.start_bit, i))
            .collect();
        for (frame, &id) in self.path.iter_mut().zip(path_ids.iter()) {
            for &bit in &tree.node(id).sensitive_bits {
                let type_index = witness.type_index(bit);
                let start = witness.type_start_bit_index(type_index);
                frame.variables.insert(var_of_start[&start]);
            }
        }

        let nvars = self.variables.len() as u32;
        let nspaces = self.path.len() as u32;
        self.max_executions = 10 * (nspaces * 2 * nvars + 6);

        self.origin = self.bits_to_point(&witness.bits);
        self.tested_origins.clear();
        let origin_canon = self.canonical(&self.origin);
        self.tested_origins.insert(origin_canon);

        self.spaces = vec![Self::first_space(self.variables.len())];
        self.constraints.clear();
        self.stage = Stage::Partials;
        self.pending = None;
        self.descent = DescentProps::default();
        self.num_executions = 0;
        self.failed = false;
        self.stopped_early = false;
        self.witness = Some(witness);
        self.busy = true;
        self.node = Some(node);
        self.execution_id = execution_id;
        self.stats.start_calls += 1;
        tracing::debug!(
            variables = self.variables.len(),
            frames = self.path.len(),
            budget = self.max_executions,
            "typed minimization started"
        );
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn max_num_executions(&self) -> u32 {
        self.max_executions
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn stats(&self) -> &TypedStats {
        &self.stats
    }

    fn first_space(nvars: usize) -> LocalSpace {
        LocalSpace {
            basis: (0..nvars).map(|i| axis(nvars, i)).collect(),
            gradient: Vec::new(),
        }
    }

    /// Reads every variable's chunk out of the stdin bits as an
    /// `f64` coordinate.
    fn bits_to_point(&self, bits: &[bool]) -> Vec<f64> {
        self.variables
            .iter()
            .map(|var| {
                let start = var.start_bit as usize;
                let nbits = var.ty.num_bits() as usize;
                let chunk: Vec<bool> = (start..start + nbits)
                    .map(|i| bits.get(i).copied().unwrap_or(false))
                    .collect();
                let bytes = bits_to_bytes(&chunk);
                TypedValue::from_le_bytes(var.ty, &bytes)
                    .map(|v| v.as_f64())
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Writes the point back over the witness, touching only the
    /// sensitive bits of each chunk.
    fn point_to_bits(&self, point: &[f64]) -> Vec<bool> {
        let witness = self.witness.as_ref().expect("busy");
        let mut bits = witness.bits.clone();
        for (var, &coord) in self.variables.iter().zip(point.iter()) {
            let Some(value) = TypedValue::from_f64(var.ty, coord) else {
                continue;
            };
            let value_bits = bytes_to_bits(&value.to_le_bytes());
            for &offset in &var.value_bit_indices {
                let src = offset as usize;
                let dst = var.start_bit as usize + src;
                if let (Some(&bit), Some(slot)) = (value_bits.get(src), bits.get_mut(dst)) {
                    *slot = bit;
                }
            }
        }
        bits
    }

    /// Canonical byte image of the point after typed discretization;
    /// two points mapping to the same stdin are the same origin.
    fn canonical(&self, point: &[f64]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (var, &coord) in self.variables.iter().zip(point.iter()) {
            match TypedValue::from_f64(var.ty, coord) {
                Some(v) => bytes.extend(v.to_le_bytes()),
                None => bytes.push(0xFF),
            }
        }
        bytes
    }

    fn point_is_typed_finite(&self, point: &[f64]) -> bool {
        self.variables.iter().zip(point.iter()).all(|(var, &coord)| {
            TypedValue::from_f64(var.ty, coord).is_some_and(|v| v.is_finite())
        })
    }

    /// Values of the path branchings in `trace`, provided the sample
    /// followed the interior directions and loc-matched up to
    /// `upto` (inclusive). The direction taken at `upto` is free.
    fn prefix_values(&self, trace: &ExecutionTrace, upto: usize, tree: &BranchTree) -> Option<Vec<f64>> {
        if trace.len() <= upto {
            return None;
        }
        let mut values = Vec::with_capacity(upto + 1);
        for i in 0..=upto {
            let frame = &self.path[i];
            if trace[i].loc != tree.node(frame.node).loc {
                return None;
            }
            if i < upto && trace[i].direction != frame.direction {
                return None;
            }
            values.push(trace[i].value);
        }
        Some(values)
    }

    fn gradient_world(space: &LocalSpace) -> Vec<f64> {
        let n = space.basis.first().map(|b| b.len()).unwrap_or(0);
        let mut world = vec![0.0; n];
        for (j, basis) in space.basis.iter().enumerate() {
            add_scaled(&mut world, space.gradient[j], basis);
        }
        world
    }

    fn constraints_satisfied(&self, shift: &[f64]) -> bool {
        self.constraints.iter().all(|c| {
            let nn = dot(&c.normal, &c.normal);
            if nn <= 0.0 {
                return true;
            }
            let param = dot(shift, &c.normal) / nn;
            param.is_finite() && c.predicate.holds_f64(param, c.param)
        })
    }

    /// Iterated projection of the shift onto the feasible region; at
    /// most [`MAX_CLIP_ITERATIONS`] passes.
    fn clip_shift_by_constraints(&self, gradient: &[f64], shift: &mut Vec<f64>) -> bool {
        for iteration in 0..MAX_CLIP_ITERATIONS {
            let mut clipped = false;
            for constraint in &self.constraints {
                let nn = dot(&constraint.normal, &constraint.normal);
                if nn <= 0.0 {
                    continue;
                }
                let mut direction = constraint.normal.clone();
                if iteration == 0 {
                    // Prefer sliding along the descent direction over
                    // backing straight out of the half-space.
                    let component = component_orthogonal_to(&constraint.normal, gradient);
                    if dot(&component, &component) >= 0.01 * nn {
                        let rescale = nn / dot(&component, &constraint.normal);
                        if rescale.is_finite() {
                            direction = scaled(&component, rescale);
                        }
                    }
                }
                let param = dot(shift, &constraint.normal) / nn;
                if !param.is_finite() {
                    return false;
                }
                let epsilon = small_delta_around(param);
                let correction = match constraint.predicate {
                    Predicate::Unequal if param == constraint.param => {
                        Some((constraint.param + epsilon) - param)
                    }
                    Predicate::Less if param >= constraint.param => {
                        Some((constraint.param - epsilon) - param)
                    }
                    Predicate::LessEqual if param > constraint.param => {
                        Some(constraint.param - param)
                    }
                    Predicate::Greater if param <= constraint.param => {
                        Some((constraint.param + epsilon) - param)
                    }
                    Predicate::GreaterEqual if param < constraint.param => {
                        Some(constraint.param - param)
                    }
                    _ => None,
                };
                if let Some(correction) = correction {
                    add_scaled(shift, correction, &direction);
                    clipped = true;
                }
            }
            if !clipped {
                return true;
            }
        }
        false
    }

    /// Grows the frame chain by one: Gram-Schmidt of the current
    /// basis against the current gradient, plus the constraint the
    /// crossed branching leaves behind.
    fn insert_next_space(&mut self) {
        let space_index = self.spaces.len() - 1;
        let src = &self.spaces[space_index];
        let gradient_world = Self::gradient_world(src);
        let gg = dot(&gradient_world, &gradient_world);

        if !gg.is_finite() || gg < 1e-12 {
            // No usable gradient: the next frame sees the same space.
            let basis = src.basis.clone();
            self.spaces.push(LocalSpace {
                basis,
                gradient: Vec::new(),
            });
            return;
        }

        let g_len = gg.sqrt();
        let mut basis: Vec<Vec<f64>> = Vec::new();
        for w in &src.basis {
            let mut v = component_orthogonal_to(w, &gradient_world);
            for existing in &basis {
                let ee = dot(existing, existing);
                if ee > 0.0 {
                    let coeff = dot(&v, existing) / ee;
                    add_scaled(&mut v, -coeff, existing);
                }
            }
            let vv = dot(&v, &v);
            if vv > 1e-6 {
                scale(&mut v, 1.0 / vv.sqrt());
                basis.push(v);
            }
        }

        let frame = &self.path[space_index];
        if frame.predicate != Predicate::Equal {
            // Movement along the gradient stays legal inside the
            // half-space this branching carves out.
            let mut unit_g = gradient_world.clone();
            scale(&mut unit_g, 1.0 / g_len);
            basis.push(unit_g);
            self.constraints.push(Constraint {
                normal: gradient_world,
                param: -frame.value / gg,
                predicate: frame.predicate,
            });
        }

        self.spaces.push(LocalSpace {
            basis,
            gradient: Vec::new(),
        });
    }

    /// Smallest step along the basis vector that survives typed
    /// discretization, starting from a magnitude-relative delta.
    fn probe_lambda(&self, basis: &[f64]) -> Option<f64> {
        let scale_of_basis = max_abs(basis);
        if scale_of_basis <= 0.0 {
            return None;
        }
        let mut lambda = small_delta_around(max_abs(&self.origin)) / scale_of_basis;
        // Integer variables need the step to clear one unit.
        for (i, var) in self.variables.iter().enumerate() {
            if basis[i].abs() > 1e-6 {
                let needed = smallest_step(var.ty, self.origin[i]) / basis[i].abs();
                if needed.is_finite() {
                    lambda = lambda.max(needed);
                }
            }
        }
        let origin_canon = self.canonical(&self.origin);
        for _ in 0..STEP_DOUBLINGS {
            let point = added(&self.origin, &scaled(basis, lambda));
            if !is_finite(&point) {
                return None;
            }
            if self.canonical(&point) != origin_canon {
                return Some(lambda);
            }
            lambda *= 2.0;
        }
        None
    }

    /// Lines up the probe shifts for the next unfinished partial, or
    /// advances the frame chain / descent stage when none is left.
    /// Returns false when the analysis is out of moves.
    fn advance_partials(&mut self) -> bool {
        loop {
            let space_index = self.spaces.len() - 1;
            let space = &self.spaces[space_index];
            if space.gradient.len() == space.basis.len() {
                if self.spaces.len() < self.path.len() {
                    self.insert_next_space();
                    continue;
                }
                if !self.compute_descent_shifts() {
                    return false;
                }
                self.stage = Stage::Descent;
                return true;
            }

            let j = space.gradient.len();
            let basis = &space.basis[j];
            let involves_sensitive = basis
                .iter()
                .enumerate()
                .any(|(i, &c)| c.abs() > 1e-6 && self.path[space_index].variables.contains(&i));
            if !involves_sensitive {
                self.spaces[space_index].gradient.push(0.0);
                continue;
            }

            let Some(lambda) = self.probe_lambda(basis) else {
                self.spaces[space_index].gradient.push(0.0);
                continue;
            };

            let mut candidates = Vec::new();
            for lam in [lambda, -lambda] {
                let shift = scaled(basis, lam);
                if self.constraints_satisfied(&shift) {
                    let point = added(&self.origin, &shift);
                    if is_finite(&point) && self.point_is_typed_finite(&point) {
                        candidates.push(lam);
                    }
                }
            }
            if candidates.is_empty() {
                self.spaces[space_index].gradient.push(0.0);
                continue;
            }
            let first = candidates.remove(0);
            self.pending = Some(PendingPartial {
                basis_index: j,
                lambda: first,
                alternatives: candidates,
            });
            return true;
        }
    }

    fn compute_descent_shifts(&mut self) -> bool {
        let target = self.path.last().expect("non-empty path");
        let space = self.spaces.last().expect("non-empty chain");
        let gradient_world = Self::gradient_world(space);
        let gg = dot(&gradient_world, &gradient_world);
        if !gg.is_finite() || gg < 1e-12 {
            return false;
        }
        let value = target.value;
        let lambda0 = -value / gg;
        if !lambda0.is_finite() {
            return false;
        }

        let g_len = gg.sqrt();
        let ray_start = added(&self.origin, &scaled(&gradient_world, lambda0));
        let param = {
            let coef = 0.01;
            let interpolant = (1.0 - coef) * max_abs(&ray_start) + coef * value.abs();
            small_delta_around(interpolant) / g_len
        };

        let mut lambdas = Vec::new();
        match target.predicate {
            Predicate::Equal => lambdas.push(lambda0),
            Predicate::Unequal => {
                lambdas.push(lambda0 + param);
                lambdas.push(lambda0 - param);
            }
            Predicate::Less => lambdas.push(lambda0 - param),
            Predicate::LessEqual => {
                lambdas.push(lambda0);
                lambdas.push(lambda0 - param);
            }
            Predicate::Greater => lambdas.push(lambda0 + param),
            Predicate::GreaterEqual => {
                lambdas.push(lambda0);
                lambdas.push(lambda0 + param);
            }
        }
        for multiplier in [100.0, 10.0, 0.1, 0.01] {
            lambdas.push(multiplier * lambda0);
        }

        self.descent = DescentProps::default();
        let mut used: HashSet<Vec<u8>> = HashSet::new();
        for lambda in lambdas {
            if !lambda.is_finite() {
                continue;
            }
            let mut shift = scaled(&gradient_world, lambda);
            self.clip_shift_by_constraints(&gradient_world, &mut shift);
            if !is_finite(&shift) {
                continue;
            }
            let point = added(&self.origin, &shift);
            if !is_finite(&point) || !self.point_is_typed_finite(&point) {
                continue;
            }
            let canon = self.canonical(&point);
            if self.tested_origins.contains(&canon) || !used.insert(canon) {
                continue;
            }
            self.descent.points.push(point);
            self.descent.shifts.push(shift);
        }
        !self.descent.shifts.is_empty()
    }

    /// Did the candidate value strictly improve over the current one
    /// in the sense of the target predicate?
    fn improves(predicate: Predicate, candidate: f64, current: f64) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        match predicate {
            Predicate::Equal => candidate.abs() < current.abs(),
            Predicate::Unequal => candidate.abs() > current.abs(),
            Predicate::Less | Predicate::LessEqual => candidate < current,
            Predicate::Greater | Predicate::GreaterEqual => candidate > current,
        }
    }

    /// Adopts the best strictly-improving descent candidate as the
    /// new origin and restarts the frame chain there.
    fn apply_best_gradient_step(&mut self) -> bool {
        let predicate = self.path.last().expect("non-empty path").predicate;
        let current = self.path.last().expect("non-empty path").value;

        let mut best: Option<usize> = None;
        for (i, result) in self.descent.results.iter().enumerate() {
            let Some(values) = result else { continue };
            let candidate = *values.last().expect("prefix covers the target");
            let reference = match best {
                Some(b) => *self.descent.results[b]
                    .as_ref()
                    .expect("best is valid")
                    .last()
                    .expect("prefix covers the target"),
                None => current,
            };
            if Self::improves(predicate, candidate, reference) {
                best = Some(i);
            }
        }

        let Some(best) = best else { return false };
        let values = self.descent.results[best].clone().expect("best is valid");
        self.origin = self.descent.points[best].clone();
        for (frame, value) in self.path.iter_mut().zip(values.iter()) {
            frame.value = *value;
        }
        self.spaces = vec![Self::first_space(self.variables.len())];
        self.constraints.clear();
        self.descent = DescentProps::default();
        self.stage = Stage::Partials;
        self.stats.gradient_steps += 1;
        true
    }

    fn stop_with_failure(&mut self, tree: &mut BranchTree) {
        if !self.busy {
            return;
        }
        self.failed = true;
        self.stats.stop_calls_failed += 1;
        self.latch(tree);
    }

    fn latch(&mut self, tree: &mut BranchTree) {
        self.busy = false;
        if let Some(node) = self.node {
            if tree.contains(node) {
                let n = tree.node_mut(node);
                n.minimization_performed = true;
                n.minimization_start_execution = self.execution_id;
            }
        }
        self.witness = None;
        self.path.clear();
        self.spaces.clear();
        self.constraints.clear();
        self.pending = None;
        self.descent = DescentProps::default();
        self.tested_origins.clear();
    }
}

impl Default for TypedMinimization {
    fn default() -> Self {
        Self::new()
    }
}

impl Analysis for TypedMinimization {
    fn is_ready(&self) -> bool {
        !self.busy
    }

    fn generate_next_input(&mut self, _tree: &BranchTree) -> Option<Vec<bool>> {
        if !self.busy {
            return None;
        }
        if self.num_executions >= self.max_executions {
            self.failed = true;
            return None;
        }
        loop {
            match self.stage {
                Stage::Partials => {
                    if self.pending.is_none() && !self.advance_partials() {
                        self.failed = true;
                        return None;
                    }
                    if let Some(pending) = &self.pending {
                        let space = self.spaces.last().expect("non-empty chain");
                        let shift = scaled(&space.basis[pending.basis_index], pending.lambda);
                        let point = added(&self.origin, &shift);
                        let canon = self.canonical(&point);
                        self.tested_origins.insert(canon);
                        self.num_executions += 1;
                        self.stats.generated_inputs += 1;
                        return Some(self.point_to_bits(&point));
                    }
                }
                Stage::Descent => {
                    if self.descent.emitted < self.descent.shifts.len() {
                        let point = self.descent.points[self.descent.emitted].clone();
                        self.descent.emitted += 1;
                        let canon = self.canonical(&point);
                        self.tested_origins.insert(canon);
                        self.num_executions += 1;
                        self.stats.generated_inputs += 1;
                        return Some(self.point_to_bits(&point));
                    }
                    if !self.apply_best_gradient_step() {
                        self.failed = true;
                        return None;
                    }
                }
            }
        }
    }

    fn process_results(
        &mut self,
        trace: &Arc<ExecutionTrace>,
        _stdin: &Arc<StdinRecord>,
        tree: &mut BranchTree,
    ) {
        if !self.busy {
            return;
        }
        match self.stage {
            Stage::Partials => {
                let Some(pending) = self.pending.take() else {
                    return;
                };
                let space_index = self.spaces.len() - 1;
                let Some(values) = self.prefix_values(trace, space_index, tree) else {
                    // The probe derailed the path: nothing this frame
                    // chain says is trustworthy anymore.
                    self.stop_with_failure(tree);
                    return;
                };
                self.stats.partials += 1;
                let sample_value = values[space_index];
                let partial = (sample_value - self.path[space_index].value) / pending.lambda;
                if partial.is_finite() && partial != 0.0 {
                    self.spaces[space_index].gradient.push(partial);
                } else if let Some((&next, rest)) = pending.alternatives.split_first() {
                    self.pending = Some(PendingPartial {
                        basis_index: pending.basis_index,
                        lambda: next,
                        alternatives: rest.to_vec(),
                    });
                } else {
                    self.spaces[space_index].gradient.push(0.0);
                }
            }
            Stage::Descent => {
                let target_index = self.path.len() - 1;
                let values = self.prefix_values(trace, target_index, tree);
                self.descent.results.push(values);
            }
        }
    }

    fn stop(&mut self, tree: &mut BranchTree) {
        if !self.busy {
            return;
        }
        if self.failed {
            // Already counted by stop_with_failure when it fired
            // mid-processing; budget exhaustion lands here.
            self.stats.stop_calls_failed += 1;
        } else if self.num_executions < self.max_executions {
            self.stopped_early = true;
            self.stats.stop_calls_early += 1;
        } else {
            self.stats.stop_calls_regular += 1;
        }
        self.latch(tree);
    }
}
