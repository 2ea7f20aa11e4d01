//! Search controller: benchmark every applicable candidate per shape, pick
//! the winner, persist it.
//!
//! Each shape moves through an explicit state machine:
//!
//! ```text
//! Pending -> Benchmarking -> Selecting -> Persisted
//!         \______________________________-> Exhausted
//! ```
//!
//! `Persisted` and `Exhausted` are terminal. Shape searches are independent:
//! a failing candidate (or a whole exhausted shape) never aborts the run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::bench::{MeasureStatus, Measurement, Measurer};
use crate::catalog::{Candidate, CandidateCatalog, KernelFamily};
use crate::error::TuneError;
use crate::shape::{ProblemShape, ShapeRegistry};
use crate::store::{ResultStore, TuningResult};

/// Per-shape search states. See the module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Pending,
    Benchmarking,
    Selecting,
    Persisted,
    Exhausted,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchState::Persisted | SearchState::Exhausted)
    }
}

/// Non-fatal conditions reported in the run summary.
#[derive(Debug, Clone)]
pub enum TuneWarning {
    /// The catalog produced zero candidates for a shape whose dtype it
    /// declares supported.
    NoCandidates { shape: ProblemShape },
    /// A candidate's applicability predicate lied: the kernel rejected the
    /// shape at runtime.
    PredicateMismatch {
        shape: ProblemShape,
        candidate_id: String,
        detail: String,
    },
    /// An override policy forced a family that produced no successful
    /// measurement; the latency-minimal choice stood.
    ForcedChoiceUnavailable {
        shape: ProblemShape,
        family: KernelFamily,
    },
}

impl fmt::Display for TuneWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuneWarning::NoCandidates { shape } => {
                write!(f, "catalog produced no candidates for shape {shape}")
            }
            TuneWarning::PredicateMismatch {
                shape,
                candidate_id,
                detail,
            } => write!(
                f,
                "candidate {candidate_id} rejected shape {shape} at runtime: {detail}"
            ),
            TuneWarning::ForcedChoiceUnavailable { shape, family } => write!(
                f,
                "forced family {family} has no successful measurement for shape {shape}; \
                 keeping latency-minimal choice"
            ),
        }
    }
}

/// External policy hook that may replace the latency-minimal choice.
///
/// Applied after selection; the forced family must have produced an `Ok`
/// measurement, otherwise the override is ignored with a warning.
pub trait SelectionPolicy {
    /// The family to force for this shape, if any.
    fn preferred_family(&self, shape: &ProblemShape) -> Option<KernelFamily>;
}

/// Forces a kernel family for narrow decode shapes (N == 1).
pub struct DecodeFamilyPolicy {
    family: KernelFamily,
}

impl DecodeFamilyPolicy {
    pub fn new(family: KernelFamily) -> Self {
        Self { family }
    }

    /// Force the dense BLAS family on decode shapes.
    pub fn dense() -> Self {
        Self::new(KernelFamily::Dense)
    }
}

impl SelectionPolicy for DecodeFamilyPolicy {
    fn preferred_family(&self, shape: &ProblemShape) -> Option<KernelFamily> {
        shape.is_decode().then_some(self.family)
    }
}

/// Full record of one shape's search, ending in a terminal state.
#[derive(Debug)]
pub struct ShapeSearch {
    pub shape: ProblemShape,
    pub state: SearchState,
    pub measurements: Vec<Measurement>,
    pub warnings: Vec<TuneWarning>,
    pub chosen: Option<TuningResult>,
}

impl ShapeSearch {
    fn new(shape: ProblemShape) -> Self {
        Self {
            shape,
            state: SearchState::Pending,
            measurements: Vec::new(),
            warnings: Vec::new(),
            chosen: None,
        }
    }
}

/// End-of-run report.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub persisted: usize,
    pub exhausted: Vec<ProblemShape>,
    pub skipped_existing: usize,
    pub warnings: Vec<TuneWarning>,
    pub cancelled: bool,
}

/// Orchestrates the per-shape search against a single device context.
///
/// Shapes, and candidates within a shape, are processed strictly
/// sequentially: the measurer owns the device and concurrent launches would
/// corrupt timing.
pub struct SearchController<M: Measurer> {
    catalog: CandidateCatalog,
    measurer: M,
    policy: Option<Box<dyn SelectionPolicy>>,
    skip_existing: bool,
}

impl<M: Measurer> SearchController<M> {
    pub fn new(catalog: CandidateCatalog, measurer: M) -> Self {
        Self {
            catalog,
            measurer,
            policy: None,
            skip_existing: true,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn SelectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Re-measure shapes already present in the store instead of skipping
    /// them.
    pub fn retune_existing(mut self, retune: bool) -> Self {
        self.skip_existing = !retune;
        self
    }

    /// Pre-run config validation: every registry dtype must be supported by
    /// at least one family. Fails before any benchmarking starts.
    pub fn validate(&self, registry: &ShapeRegistry) -> Result<(), TuneError> {
        for shape in registry.iter() {
            if !self.catalog.supports_dtype(shape.indtype) {
                return Err(TuneError::UnsupportedDtype(shape.indtype));
            }
        }
        Ok(())
    }

    /// Tune every registry shape, upserting each winner into `store`.
    ///
    /// When the store is bound to a path it is flushed after every persisted
    /// shape, so an abort between shapes loses nothing already tuned. The
    /// optional `cancel` flag is checked between shapes; setting it stops
    /// the run cleanly with `cancelled = true` in the summary.
    pub fn run(
        &mut self,
        registry: &ShapeRegistry,
        store: &mut ResultStore,
        cancel: Option<&AtomicBool>,
    ) -> Result<RunSummary, TuneError> {
        self.validate(registry)?;

        let mut summary = RunSummary::default();
        for shape in registry.iter() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                info!("tuning cancelled; results persisted so far are kept");
                summary.cancelled = true;
                break;
            }
            if self.skip_existing && store.contains(shape) {
                debug!(shape = %shape, "already tuned, skipping");
                summary.skipped_existing += 1;
                continue;
            }

            let mut search = self.tune_shape(shape);
            summary.warnings.append(&mut search.warnings);
            match search.chosen {
                Some(result) => {
                    store.upsert(result);
                    store.flush()?;
                    summary.persisted += 1;
                }
                None => summary.exhausted.push(*shape),
            }
        }
        info!(
            persisted = summary.persisted,
            exhausted = summary.exhausted.len(),
            skipped = summary.skipped_existing,
            warnings = summary.warnings.len(),
            "tuning run finished"
        );
        Ok(summary)
    }

    /// Run one shape through the state machine to a terminal state.
    pub fn tune_shape(&mut self, shape: &ProblemShape) -> ShapeSearch {
        let mut search = ShapeSearch::new(*shape);

        // Pending -> Benchmarking, or straight to Exhausted when the catalog
        // has nothing to offer (a catalog configuration problem, not fatal).
        let candidates = self.catalog.candidates_for(shape);
        if candidates.is_empty() {
            warn!(shape = %shape, "catalog produced no applicable candidates");
            search.warnings.push(TuneWarning::NoCandidates { shape: *shape });
            search.state = SearchState::Exhausted;
            return search;
        }
        search.state = SearchState::Benchmarking;

        for candidate in &candidates {
            let measurement = self.measurer.measure(shape, candidate);
            if measurement.status == MeasureStatus::Skipped {
                search.warnings.push(TuneWarning::PredicateMismatch {
                    shape: *shape,
                    candidate_id: candidate.id.clone(),
                    detail: measurement.error.clone().unwrap_or_default(),
                });
            }
            search.measurements.push(measurement);
        }

        // Benchmarking -> Selecting
        search.state = SearchState::Selecting;
        match self.select(shape, &candidates, &search.measurements, &mut search.warnings) {
            Some(winner) => {
                let candidate = &candidates[winner];
                let measurement = &search.measurements[winner];
                info!(
                    shape = %shape,
                    candidate = %candidate.id,
                    latency_ns = measurement.latency_ns,
                    "selected"
                );
                search.chosen = Some(TuningResult {
                    shape: *shape,
                    family: candidate.family,
                    candidate_id: candidate.id.clone(),
                    latency_ns: measurement.latency_ns,
                });
                search.state = SearchState::Persisted;
            }
            None => {
                warn!(shape = %shape, "no candidate succeeded");
                search.state = SearchState::Exhausted;
            }
        }
        search
    }

    /// Minimum-latency `Ok` measurement, first-declared wins ties; then the
    /// override policy, which only replaces the choice if its family has an
    /// `Ok` measurement of its own.
    fn select(
        &self,
        shape: &ProblemShape,
        candidates: &[Candidate],
        measurements: &[Measurement],
        warnings: &mut Vec<TuneWarning>,
    ) -> Option<usize> {
        let best = min_ok(measurements, |_| true)?;

        if let Some(policy) = &self.policy {
            if let Some(family) = policy.preferred_family(shape) {
                if candidates[best].family != family {
                    match min_ok(measurements, |idx| candidates[idx].family == family) {
                        Some(forced) => {
                            info!(
                                shape = %shape,
                                family = %family,
                                candidate = %candidates[forced].id,
                                "override policy replaced latency-minimal choice"
                            );
                            return Some(forced);
                        }
                        None => {
                            warn!(
                                shape = %shape,
                                family = %family,
                                "forced family has no successful measurement; ignoring override"
                            );
                            warnings.push(TuneWarning::ForcedChoiceUnavailable {
                                shape: *shape,
                                family,
                            });
                        }
                    }
                }
            }
        }
        Some(best)
    }
}

fn min_ok(measurements: &[Measurement], keep: impl Fn(usize) -> bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, measurement) in measurements.iter().enumerate() {
        if !measurement.is_ok() || !keep(idx) {
            continue;
        }
        // strict < keeps the first-declared candidate on ties
        if best.is_none_or(|b| measurement.latency_ns < measurements[b].latency_ns) {
            best = Some(idx);
        }
    }
    best
}
