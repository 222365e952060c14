use std::fmt::Display;

use kfvertex_core::{
    utils::packed::{invert_sym3, unpack},
    KfError, KfResult, Vec3, VertexEstimate,
};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    field::{MagneticField, UniformField},
    mass_constraint::{set_mass_constraint, KinematicMatrix, KinematicVector},
    particle::{ParticleMatrix, ParticleState, ParticleVector},
};

/// A tag which refers to a particle stored in a [`DecayTree`]. Ids are handed out in creation
/// order and are only meaningful for the tree which created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(pub(crate) usize);

impl ParticleId {
    /// The position of the particle in its tree.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for ParticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParticleId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParticleRecord {
    state: ParticleState,
    daughters: Vec<ParticleId>,
    used_as_daughter: bool,
    zero_gain_updates: usize,
}

/// An arena holding final-state particles and the composites built from them.
///
/// A composite refers to its daughters by [`ParticleId`], so every daughter stays available for
/// inspection after the combination. Once a particle has been used as a daughter it is frozen:
/// further daughters can no longer be added to it, since that would silently invalidate every
/// composite which already includes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayTree {
    records: Vec<ParticleRecord>,
}

impl DecayTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a final-state particle and return its id.
    pub fn add_particle(&mut self, state: ParticleState) -> ParticleId {
        self.push(state, Vec::new(), 0)
    }

    fn push(
        &mut self,
        state: ParticleState,
        daughters: Vec<ParticleId>,
        zero_gain_updates: usize,
    ) -> ParticleId {
        let id = ParticleId(self.records.len());
        for daughter in &daughters {
            self.records[daughter.0].used_as_daughter = true;
        }
        self.records.push(ParticleRecord {
            state,
            daughters,
            used_as_daughter: false,
            zero_gain_updates,
        });
        id
    }

    fn record(&self, id: ParticleId) -> KfResult<&ParticleRecord> {
        self.records
            .get(id.0)
            .ok_or(KfError::UnknownParticle { id: id.0 })
    }

    fn record_mut(&mut self, id: ParticleId) -> KfResult<&mut ParticleRecord> {
        self.records
            .get_mut(id.0)
            .ok_or(KfError::UnknownParticle { id: id.0 })
    }

    /// The state of a particle.
    pub fn get(&self, id: ParticleId) -> KfResult<&ParticleState> {
        Ok(&self.record(id)?.state)
    }

    /// The direct daughters of a particle, empty for a final-state particle.
    pub fn daughters(&self, id: ParticleId) -> KfResult<&[ParticleId]> {
        Ok(&self.record(id)?.daughters)
    }

    pub fn is_composite(&self, id: ParticleId) -> KfResult<bool> {
        Ok(!self.record(id)?.daughters.is_empty())
    }

    pub fn is_used_as_daughter(&self, id: ParticleId) -> KfResult<bool> {
        Ok(self.record(id)?.used_as_daughter)
    }

    /// How many daughter updates of this composite had a singular vertex system and were added
    /// without a gain.
    pub fn zero_gain_updates(&self, id: ParticleId) -> KfResult<usize> {
        Ok(self.record(id)?.zero_gain_updates)
    }

    /// Linearise the next [`CompositeParticleBuilder::add_daughter`] on `id` around `guess`.
    pub fn set_vertex_guess(&mut self, id: ParticleId, guess: Vec3) -> KfResult<()> {
        let record = self.record_mut(id)?;
        if record.used_as_daughter {
            return Err(KfError::StaleCompositeMutation { id: id.0 });
        }
        record.state.set_vertex_guess(guess);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticleId> + '_ {
        (0..self.records.len()).map(ParticleId)
    }

    /// Whether `id` appears anywhere below `ancestor`.
    pub fn is_descendant(&self, ancestor: ParticleId, id: ParticleId) -> bool {
        let mut stack: Vec<ParticleId> = match self.records.get(ancestor.0) {
            Some(record) => record.daughters.clone(),
            None => return false,
        };
        while let Some(current) = stack.pop() {
            if current == id {
                return true;
            }
            if let Some(record) = self.records.get(current.0) {
                stack.extend_from_slice(&record.daughters);
            }
        }
        false
    }

    /// Two daughters of the same composite must be distinct and must not contain each other.
    fn check_unrelated(&self, parent: usize, a: ParticleId, b: ParticleId) -> KfResult<()> {
        if a == b || self.is_descendant(a, b) || self.is_descendant(b, a) {
            return Err(KfError::CyclicCombination {
                parent,
                daughter: b.0,
            });
        }
        Ok(())
    }
}

/// An independently known vertex, for instance a primary vertex from [`VertexFitter`](kfvertex_core::VertexFitter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductionVertex {
    pub position: Vec3,
    pub covariance: Matrix3<f64>,
}

impl ProductionVertex {
    /// A vertex with the packed lower triangle of its 3×3 covariance.
    pub fn new(position: Vec3, covariance: [f64; 6]) -> Self {
        Self {
            position,
            covariance: unpack(&covariance),
        }
    }
}

impl From<&VertexEstimate> for ProductionVertex {
    fn from(estimate: &VertexEstimate) -> Self {
        Self {
            position: estimate.position,
            covariance: estimate.covariance_matrix(),
        }
    }
}

/// The outcome of [`CompositeParticleBuilder::transport_to_production_vertex`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProductionVertexReport {
    /// Path over momentum from the decay vertex to the production vertex
    pub ds: f64,
    /// `χ²` of the transported position against the vertex, with one degree of freedom per
    /// coordinate, or [`None`] if the combined covariance is singular
    pub compatibility_chi2: Option<f64>,
}

/// Builds composite particles in a [`DecayTree`] by vertex-constrained combination of their
/// daughters.
///
/// Every daughter after the first is added with a Kalman update which pulls mother and
/// daughter to a common vertex, then the momenta and energies are summed. The magnetic field is
/// owned by the builder and used for every transport it performs.
#[derive(Debug, Clone)]
pub struct CompositeParticleBuilder {
    field: Box<dyn MagneticField>,
}

impl Default for CompositeParticleBuilder {
    fn default() -> Self {
        Self::new(UniformField::zero())
    }
}

impl CompositeParticleBuilder {
    pub fn new<F: MagneticField + 'static>(field: F) -> Self {
        Self {
            field: Box::new(field),
        }
    }

    pub fn with_field<F: MagneticField + 'static>(mut self, field: F) -> Self {
        self.field = Box::new(field);
        self
    }

    pub fn field(&self) -> &dyn MagneticField {
        self.field.as_ref()
    }

    /// Combine two particles into a new composite.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::UnknownParticle`] for ids which are not in the tree and
    /// [`KfError::CyclicCombination`] if `a` and `b` are the same particle or one contains the
    /// other.
    pub fn combine(
        &self,
        tree: &mut DecayTree,
        a: ParticleId,
        b: ParticleId,
    ) -> KfResult<ParticleId> {
        self.combine_all(tree, &[a, b])
    }

    /// Combine two or more particles into a new composite, adding them in the given order.
    ///
    /// The result is identical to [`CompositeParticleBuilder::combine`] on the first two
    /// followed by [`CompositeParticleBuilder::add_daughter`] for the rest.
    pub fn combine_all(&self, tree: &mut DecayTree, ids: &[ParticleId]) -> KfResult<ParticleId> {
        if ids.len() < 2 {
            return Err(KfError::InsufficientDaughters { n: ids.len() });
        }
        let parent = tree.len();
        for id in ids {
            tree.record(*id)?;
        }
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                tree.check_unrelated(parent, *a, *b)?;
            }
        }
        let mut state = ParticleState::empty_composite();
        let mut zero_gain_updates = 0;
        for (i, id) in ids.iter().enumerate() {
            let daughter = tree.get(*id)?;
            if i == 0 {
                copy_first_daughter(&mut state, daughter);
            } else if !self.add_to(&mut state, daughter, i == 1, parent, *id) {
                zero_gain_updates += 1;
            }
        }
        Ok(tree.push(state, ids.to_vec(), zero_gain_updates))
    }

    /// Add another daughter to an existing composite, updating it in place.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::NotComposite`] if `composite` has no daughters,
    /// [`KfError::StaleCompositeMutation`] if it is already a daughter of another composite and
    /// [`KfError::CyclicCombination`] if `extra` is the composite itself or shares particles
    /// with it.
    pub fn add_daughter(
        &self,
        tree: &mut DecayTree,
        composite: ParticleId,
        extra: ParticleId,
    ) -> KfResult<()> {
        let record = tree.record(composite)?;
        if record.daughters.is_empty() {
            return Err(KfError::NotComposite { id: composite.0 });
        }
        if record.used_as_daughter {
            return Err(KfError::StaleCompositeMutation { id: composite.0 });
        }
        tree.record(extra)?;
        tree.check_unrelated(composite.0, composite, extra)?;
        for daughter in &record.daughters {
            tree.check_unrelated(composite.0, *daughter, extra)?;
        }
        let only_first = record.daughters.len() == 1;
        let mut state = record.state.clone();
        let updated = self.add_to(&mut state, tree.get(extra)?, only_first, composite.0, extra);

        tree.records[extra.0].used_as_daughter = true;
        let record = tree.record_mut(composite)?;
        record.state = state;
        record.daughters.push(extra);
        if !updated {
            record.zero_gain_updates += 1;
        }
        Ok(())
    }

    /// Path over momentum from a particle to its closest approach to `point`.
    pub fn distance_to_point(&self, particle: &ParticleState, point: &Vec3) -> f64 {
        particle.distance_to_point(point, self.field())
    }

    /// Path-over-momentum parameters bringing two particles to their mutual closest approach.
    pub fn distance_to_particle(&self, a: &ParticleState, b: &ParticleState) -> (f64, f64) {
        a.distance_to_particle(b, self.field())
    }

    /// Move a composite from its decay vertex to the point of closest approach to `vertex`.
    ///
    /// The decay length parameter is set to the travelled distance, `s = -ds`, with its
    /// variance propagated from the composite and vertex covariances, and the position errors
    /// are widened by the decay-length uncertainty. Momentum, energy and the fit counters are
    /// left unchanged. [`CompositeParticleBuilder::transport_to_decay_vertex`] undoes the
    /// move.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::NotComposite`] for final-state particles and
    /// [`KfError::StaleCompositeMutation`] if the composite is already a daughter of another
    /// composite.
    pub fn transport_to_production_vertex(
        &self,
        tree: &mut DecayTree,
        composite: ParticleId,
        vertex: &ProductionVertex,
    ) -> KfResult<ProductionVertexReport> {
        let field = self.field.as_ref();
        let record = tree.record_mut(composite)?;
        if record.daughters.is_empty() {
            return Err(KfError::NotComposite { id: composite.0 });
        }
        if record.used_as_daughter {
            return Err(KfError::StaleCompositeMutation { id: composite.0 });
        }
        let state = &mut record.state;
        state.transport_to_decay_vertex(field);
        let ds = state.distance_to_point(&vertex.position, field);
        set_decay_length(state, vertex, ds);
        state.transport_to_ds(ds, field);

        let zeta = Vector3::from(vertex.position - state.position());
        let combined = state.covariance.fixed_view::<3, 3>(0, 0) + vertex.covariance;
        let compatibility_chi2 = invert_sym3(&combined, "production vertex compatibility")
            .ok()
            .map(|s| zeta.dot(&(s * zeta)));

        state.convert(true, field);
        state.at_production_vertex = true;
        Ok(ProductionVertexReport {
            ds,
            compatibility_chi2,
        })
    }

    /// Move a particle back to its decay vertex.
    ///
    /// # Errors
    ///
    /// Returns [`KfError::StaleCompositeMutation`] if the particle is already a daughter of a
    /// composite.
    pub fn transport_to_decay_vertex(&self, tree: &mut DecayTree, id: ParticleId) -> KfResult<()> {
        let field = self.field.as_ref();
        let record = tree.record_mut(id)?;
        if record.used_as_daughter {
            return Err(KfError::StaleCompositeMutation { id: id.0 });
        }
        record.state.transport_to_decay_vertex(field);
        Ok(())
    }

    /// Vertex-constrained update of `mother` with one more daughter. Returns `false` if the
    /// vertex system was singular and the daughter was added without a gain.
    fn add_to(
        &self,
        mother: &mut ParticleState,
        daughter: &ParticleState,
        only_first: bool,
        parent: usize,
        daughter_id: ParticleId,
    ) -> bool {
        let field = self.field.as_ref();
        mother.transport_to_decay_vertex(field);

        let (mut guess, passes) = match mother.vertex_guess {
            Some(guess) => (guess, 1),
            None if only_first => {
                let (ds, ds1) = mother.distance_to_particle(daughter, field);
                mother.transport_to_ds(ds, field);
                let (moved, _) = daughter.transported(ds1, field);
                let other = Vec3::new(moved[0], moved[1], moved[2]);
                ((mother.position() + other) * 0.5, 3)
            }
            None => (mother.position(), 3),
        };

        let mut updated = true;
        for pass in 0..passes {
            let (ff_p, ff_c) = if only_first {
                mother.measurement_at(&guess, field)
            } else {
                (mother.params, mother.covariance)
            };
            let (m_p, m_c) = if daughter.covariance[(7, 7)] > 0.0 {
                daughter.measurement_at(&guess, field)
            } else {
                (daughter.params, daughter.covariance)
            };
            let mut ffp = kinematics(&ff_p);
            let mut ffc = kinematic_covariance(&ff_c);
            let mut mp = kinematics(&m_p);
            let mut mv = kinematic_covariance(&m_c);

            let residual_covariance = ffc.fixed_view::<3, 3>(0, 0) + mv.fixed_view::<3, 3>(0, 0);
            let s = match invert_sym3(&residual_covariance, "daughter vertex update") {
                Ok(s) => s,
                Err(err) => {
                    debug!(parent, daughter = daughter_id.0, pass, %err, "adding daughter without gain");
                    updated = false;
                    Matrix3::zeros()
                }
            };
            let zeta: Vector3<f64> = mp.fixed_rows::<3>(0) - ffp.fixed_rows::<3>(0);
            let cht = ffc.fixed_view::<7, 3>(0, 0).into_owned();
            let k = cht * s;

            if pass + 1 < passes {
                let next = ffp.fixed_rows::<3>(0) + k.fixed_view::<3, 3>(0, 0) * zeta;
                guess = Vec3::new(next[0], next[1], next[2]);
                continue;
            }

            let vht = mv.fixed_view::<7, 3>(0, 0).into_owned();
            let km = vht * s;
            ffp += k * zeta;
            mp -= km * zeta;
            ffc -= k * cht.transpose();
            mv -= km * vht.transpose();
            let df = km * cht.transpose();

            let mut j1 = KinematicMatrix::identity();
            let mut j2 = KinematicMatrix::identity();
            if let Some(mass) =
                constraint_mass(&ffp, mother.mass_hypothesis, mother.sum_daughter_mass)
            {
                j1 = set_mass_constraint(&mut ffp, &mut ffc, mass);
            }
            if let Some(mass) =
                constraint_mass(&mp, daughter.mass_hypothesis, daughter.sum_daughter_mass)
            {
                j2 = set_mass_constraint(&mut mp, &mut mv, mass);
            }
            let df = j2 * df * j1.transpose();

            for i in 3..7 {
                ffp[i] += mp[i];
                for j in 3..7 {
                    ffc[(i, j)] += mv[(i, j)] + df[(i, j)] + df[(j, i)];
                }
                for j in 0..3 {
                    ffc[(i, j)] += df[(i, j)];
                    ffc[(j, i)] = ffc[(i, j)];
                }
            }

            mother.params = ParticleVector::zeros();
            mother.params.fixed_rows_mut::<7>(0).copy_from(&ffp);
            mother.covariance = ParticleMatrix::zeros();
            mother
                .covariance
                .fixed_view_mut::<7, 7>(0, 0)
                .copy_from(&((ffc + ffc.transpose()) * 0.5));
            mother.ndf += 2;
            mother.charge += daughter.charge;
            mother.s_from_decay = 0.0;
            mother.chi2 += zeta.dot(&(s * zeta));
        }

        mother.sum_daughter_mass += daughter.sum_daughter_mass;
        mother.mass_hypothesis = None;
        mother.chi2 += daughter.chi2;
        mother.ndf += daughter.ndf;
        updated
    }
}

fn copy_first_daughter(mother: &mut ParticleState, daughter: &ParticleState) {
    mother.ndf = daughter.ndf - 1;
    mother.chi2 = daughter.chi2;
    mother.charge = daughter.charge;
    mother.params = ParticleVector::zeros();
    mother
        .params
        .fixed_rows_mut::<7>(0)
        .copy_from(&kinematics(&daughter.params));
    mother.covariance = ParticleMatrix::zeros();
    mother
        .covariance
        .fixed_view_mut::<7, 7>(0, 0)
        .copy_from(&kinematic_covariance(&daughter.covariance));
    mother.s_from_decay = 0.0;
    mother.mass_hypothesis = daughter.mass_hypothesis;
    mother.sum_daughter_mass = daughter.sum_daughter_mass;
}

fn kinematics(params: &ParticleVector) -> KinematicVector {
    params.fixed_rows::<7>(0).into_owned()
}

fn kinematic_covariance(covariance: &ParticleMatrix) -> KinematicMatrix {
    covariance.fixed_view::<7, 7>(0, 0).into_owned()
}

/// The mass a state has to be constrained to: its hypothesis if it has one, otherwise the sum
/// of its daughter masses when the state is below it or has negative energy.
fn constraint_mass(
    params: &KinematicVector,
    hypothesis: Option<f64>,
    sum_daughter_mass: f64,
) -> Option<f64> {
    if hypothesis.is_some() {
        return hypothesis;
    }
    let m2 = params[6] * params[6] - params.fixed_rows::<3>(3).norm_squared();
    let mass = if m2 > 0.0 { m2.sqrt() } else { m2 };
    (mass < sum_daughter_mass || params[6] < 0.0).then_some(sum_daughter_mass)
}

/// Fill the decay length parameter of a state at its decay vertex with `s = -ds` and its
/// straight-line linearised covariance.
fn set_decay_length(state: &mut ParticleState, vertex: &ProductionVertex, ds: f64) {
    let p = Vector3::from(state.momentum());
    let p2 = p.norm_squared();
    let p2 = if p2 < 1e-4 { 1.0 } else { p2 };
    let d = Vector3::from(vertex.position - state.position());

    let mut g = ParticleVector::zeros();
    g.fixed_rows_mut::<3>(0).copy_from(&(p / p2));
    g.fixed_rows_mut::<3>(3)
        .copy_from(&((p * (2.0 * ds) - d) / p2));
    let g_vertex = -p / p2;

    let mut c = state.covariance;
    for i in 0..8 {
        c[(7, i)] = 0.0;
        c[(i, 7)] = 0.0;
    }
    let row = c * g;
    let variance = g.dot(&row) + g_vertex.dot(&(vertex.covariance * g_vertex));
    for i in 0..7 {
        c[(7, i)] = row[i];
        c[(i, 7)] = row[i];
    }
    c[(7, 7)] = variance;
    state.covariance = c;
    state.params[7] = -ds;
}
