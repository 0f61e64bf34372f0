//! Predictor engine.
//!
//! Maintains one fitted cell per (bar, version, step-or-whole, technique
//! key). Cells materialize lazily on first query from a durable scan, then
//! stay current through incremental retain/evict updates. Updates that have
//! no closed streaming form (percentile order statistics, linear-fit
//! evictions) mark the cell stale; the next query recomputes it, spaced by
//! a minimum recompute interval so retention bursts coalesce into one scan.
//!
//! Version bumps freeze prior-version cells: they stay readable but are
//! never written again.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use pbar_common::{BarSchema, Clock, CompletedTrace, StepSpec, TechniqueKey};

use crate::config::PredictorConfig;
use crate::durable::{DurableStore, StepSample};
use crate::error::{with_store_retry, EngineError, RetryPolicy, ValidationError};
use crate::hot_store::{keys, HotStore};

/// Outcome of an estimate query.
///
/// `Empty` is the distinguished no-samples result; it is never a synthesized
/// zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prediction {
    /// No retained samples support a prediction.
    Empty,
    /// Predicted duration in seconds.
    Seconds(f64),
}

impl Prediction {
    /// The predicted seconds, if any.
    pub fn seconds(&self) -> Option<f64> {
        match self {
            Prediction::Empty => None,
            Prediction::Seconds(s) => Some(*s),
        }
    }
}

/// What a cell predicts: one step, or the whole trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellTarget {
    Step(u32),
    Whole,
}

/// Identity of a predictor cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub bar_uid: String,
    pub version: u32,
    pub target: CellTarget,
    pub technique: TechniqueKey,
}

/// Fitted parameters: `a` alone for means/percentiles (seconds, or seconds
/// per iteration for iterated specs), `a` slope + `b` intercept for the
/// linear fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FittedParams {
    pub a: f64,
    pub b: Option<f64>,
}

#[derive(Debug, Clone)]
enum Accumulator {
    Mean {
        sum: f64,
        count: u64,
    },
    Geometric {
        ln_sum: f64,
        count: u64,
    },
    Harmonic {
        recip_sum: f64,
        count: u64,
    },
    /// Order statistics cannot stream; the fit lives in `Cell::fitted` and
    /// is refreshed by recompute.
    Percentile {
        percentile: u8,
    },
    Linear {
        n_sum: f64,
        t_sum: f64,
        nn_sum: f64,
        nt_sum: f64,
        norm_sum: f64,
        count: u64,
        first_n: Option<u32>,
        distinct: bool,
    },
    /// Whole-trace cell; derived from component step cells.
    Whole,
}

impl Accumulator {
    fn for_technique(technique: TechniqueKey) -> Self {
        match technique {
            TechniqueKey::ArithmeticMean => Accumulator::Mean { sum: 0.0, count: 0 },
            TechniqueKey::GeometricMean => Accumulator::Geometric { ln_sum: 0.0, count: 0 },
            TechniqueKey::HarmonicMean => Accumulator::Harmonic {
                recip_sum: 0.0,
                count: 0,
            },
            TechniqueKey::Percentile(p) => Accumulator::Percentile { percentile: p },
            TechniqueKey::BestFitLinear => Accumulator::Linear {
                n_sum: 0.0,
                t_sum: 0.0,
                nn_sum: 0.0,
                nt_sum: 0.0,
                norm_sum: 0.0,
                count: 0,
                first_n: None,
                distinct: false,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Cell {
    acc: Accumulator,
    fitted: Option<FittedParams>,
    /// Trace uids folded into the accumulator; makes retain/evict updates
    /// exactly once per cell.
    seen: HashSet<String>,
    stale: bool,
    frozen: bool,
    last_recompute_at: f64,
}

/// The observation a non-linear technique fits: raw seconds for one-off
/// specs, seconds per iteration for iterated specs. `None` when the sample
/// cannot be used (missing or zero iteration count).
fn observation(spec: &StepSpec, sample: &StepSample) -> Option<f64> {
    if spec.iterated {
        let n = sample.iterations? as f64;
        if n <= 0.0 {
            return None;
        }
        Some(sample.duration / n)
    } else {
        Some(sample.duration)
    }
}

/// Fold one sample into the accumulator. Returns false when the sample was
/// rejected (non-positive value for log/reciprocal forms, missing
/// iterations for the linear fit).
fn add_sample(acc: &mut Accumulator, spec: &StepSpec, sample: &StepSample) -> bool {
    match acc {
        Accumulator::Mean { sum, count } => {
            let Some(obs) = observation(spec, sample) else {
                return false;
            };
            *sum += obs;
            *count += 1;
            true
        }
        Accumulator::Geometric { ln_sum, count } => {
            let obs = match observation(spec, sample) {
                Some(obs) if obs > 0.0 => obs,
                _ => return false,
            };
            *ln_sum += obs.ln();
            *count += 1;
            true
        }
        Accumulator::Harmonic { recip_sum, count } => {
            let obs = match observation(spec, sample) {
                Some(obs) if obs > 0.0 => obs,
                _ => return false,
            };
            *recip_sum += obs.recip();
            *count += 1;
            true
        }
        Accumulator::Percentile { .. } | Accumulator::Whole => true,
        Accumulator::Linear {
            n_sum,
            t_sum,
            nn_sum,
            nt_sum,
            norm_sum,
            count,
            first_n,
            distinct,
        } => {
            let Some(n) = sample.iterations.filter(|n| *n > 0) else {
                return false;
            };
            let nf = n as f64;
            *n_sum += nf;
            *t_sum += sample.duration;
            *nn_sum += nf * nf;
            *nt_sum += nf * sample.duration;
            *norm_sum += sample.duration / nf;
            *count += 1;
            match first_n {
                None => *first_n = Some(n),
                Some(first) if *first != n => *distinct = true,
                Some(_) => {}
            }
            true
        }
    }
}

/// Unfold one sample. Only the streaming means support removal; callers
/// mark percentile and linear cells stale instead.
fn remove_sample(acc: &mut Accumulator, spec: &StepSpec, sample: &StepSample) {
    match acc {
        Accumulator::Mean { sum, count } => {
            if let Some(obs) = observation(spec, sample) {
                if *count > 0 {
                    *sum -= obs;
                    *count -= 1;
                }
            }
        }
        Accumulator::Geometric { ln_sum, count } => {
            if let Some(obs) = observation(spec, sample) {
                if obs > 0.0 && *count > 0 {
                    *ln_sum -= obs.ln();
                    *count -= 1;
                }
            }
        }
        Accumulator::Harmonic { recip_sum, count } => {
            if let Some(obs) = observation(spec, sample) {
                if obs > 0.0 && *count > 0 {
                    *recip_sum -= obs.recip();
                    *count -= 1;
                }
            }
        }
        _ => {}
    }
}

/// Closed-form fit from the accumulator. Percentile and whole cells are
/// fitted by their recompute paths, not here.
fn fit(acc: &Accumulator) -> Option<FittedParams> {
    match acc {
        Accumulator::Mean { sum, count } => (*count > 0).then(|| FittedParams {
            a: sum / *count as f64,
            b: None,
        }),
        Accumulator::Geometric { ln_sum, count } => (*count > 0).then(|| FittedParams {
            a: (ln_sum / *count as f64).exp(),
            b: None,
        }),
        Accumulator::Harmonic { recip_sum, count } => {
            if *count == 0 || *recip_sum <= 0.0 {
                return None;
            }
            Some(FittedParams {
                a: *count as f64 / recip_sum,
                b: None,
            })
        }
        Accumulator::Percentile { .. } | Accumulator::Whole => None,
        Accumulator::Linear {
            n_sum,
            t_sum,
            nn_sum,
            nt_sum,
            norm_sum,
            count,
            distinct,
            ..
        } => {
            if *count == 0 {
                return None;
            }
            let m = *count as f64;
            let denom = m * nn_sum - n_sum * n_sum;
            if !*distinct || denom.abs() < f64::EPSILON * m * nn_sum.max(1.0) {
                // Fewer than two distinct iteration counts: degenerate to
                // the arithmetic mean of seconds per iteration.
                return Some(FittedParams {
                    a: norm_sum / m,
                    b: None,
                });
            }
            let slope = (m * nt_sum - n_sum * t_sum) / denom;
            let intercept = (t_sum - slope * n_sum) / m;
            Some(FittedParams {
                a: slope,
                b: Some(intercept),
            })
        }
    }
}

/// Percentile fit: the smallest observation with cumulative sample fraction
/// at or above p/100. 0 selects the minimum, 100 the maximum.
fn percentile_fit(spec: &StepSpec, percentile: u8, samples: &[StepSample]) -> Option<FittedParams> {
    let mut observations: Vec<f64> = samples
        .iter()
        .filter_map(|s| observation(spec, s))
        .collect();
    if observations.is_empty() {
        return None;
    }
    observations.sort_by(|a, b| a.total_cmp(b));
    let m = observations.len();
    let need = (f64::from(percentile) / 100.0) * m as f64;
    let idx = (need.ceil() as usize).clamp(1, m);
    Some(FittedParams {
        a: observations[idx - 1],
        b: None,
    })
}

/// Evaluate fitted parameters for a spec at an iteration count.
fn predict_value(spec: &StepSpec, fitted: FittedParams, n: Option<f64>) -> Prediction {
    if spec.active_key() == TechniqueKey::BestFitLinear {
        return match n {
            Some(n) => Prediction::Seconds(match fitted.b {
                Some(b) => fitted.a * n + b,
                // Degenerate fit: normalized mean, scaled by iterations.
                None => fitted.a * n,
            }),
            None => Prediction::Empty,
        };
    }
    if spec.iterated {
        match n {
            Some(n) => Prediction::Seconds(fitted.a * n),
            None => Prediction::Empty,
        }
    } else {
        Prediction::Seconds(fitted.a)
    }
}

/// Incrementally maintained prediction cells.
#[derive(Debug)]
pub struct PredictorEngine {
    durable: Arc<dyn DurableStore>,
    hot: Arc<dyn HotStore>,
    clock: Arc<dyn Clock>,
    config: PredictorConfig,
    retry: RetryPolicy,
    cells: DashMap<CellKey, Cell>,
    latest_version: DashMap<String, u32>,
}

impl PredictorEngine {
    /// Create an engine over the given stores.
    pub fn new(
        durable: Arc<dyn DurableStore>,
        hot: Arc<dyn HotStore>,
        clock: Arc<dyn Clock>,
        config: PredictorConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            durable,
            hot,
            clock,
            config,
            retry,
            cells: DashMap::new(),
            latest_version: DashMap::new(),
        }
    }

    /// Record the newest version seen for a bar, freezing cells of prior
    /// versions. Detection is by version-mismatch-on-read; no registry
    /// wiring is needed.
    pub fn note_version(&self, bar_uid: &str, version: u32) {
        let bumped = {
            let mut entry = self
                .latest_version
                .entry(bar_uid.to_string())
                .or_insert(version);
            if *entry < version {
                *entry = version;
                true
            } else {
                false
            }
        };
        if !bumped {
            return;
        }
        let mut frozen = 0usize;
        for mut cell in self.cells.iter_mut() {
            if cell.key().bar_uid == bar_uid && cell.key().version < version && !cell.frozen {
                cell.frozen = true;
                frozen += 1;
            }
        }
        if frozen > 0 {
            info!(bar_uid, version, frozen, "froze predictor cells for prior versions");
        }
    }

    fn step_key(&self, schema: &BarSchema, spec: &StepSpec) -> CellKey {
        CellKey {
            bar_uid: schema.bar_uid.as_str().to_string(),
            version: schema.version,
            target: CellTarget::Step(spec.position),
            technique: spec.active_key(),
        }
    }

    fn whole_key(&self, schema: &BarSchema) -> CellKey {
        CellKey {
            bar_uid: schema.bar_uid.as_str().to_string(),
            version: schema.version,
            target: CellTarget::Whole,
            technique: TechniqueKey::new(
                schema.default_spec.one_off_technique,
                schema.default_spec.one_off_percentile,
            ),
        }
    }

    fn scan_floor(&self, schema: &BarSchema) -> f64 {
        match schema.sampling_max_age_seconds {
            Some(age) => self.clock.now() - f64::from(age),
            None => 0.0,
        }
    }

    /// Fold a freshly retained trace into every materialized step cell of
    /// its (bar, version). Unmaterialized cells pick the trace up from the
    /// durable scan on first query. Safe to call twice with the same trace.
    pub async fn observe_retained(
        &self,
        schema: &BarSchema,
        trace: &CompletedTrace,
    ) -> Result<(), EngineError> {
        self.note_version(schema.bar_uid.as_str(), schema.version);
        if trace.bar_version != schema.version {
            // A trace from an older version never updates newer cells.
            return Ok(());
        }
        let mut mirrors = Vec::new();
        for spec in &schema.steps {
            let Some(tstep) = trace.steps.iter().find(|s| s.position == spec.position) else {
                continue;
            };
            let Some(duration) = tstep.duration() else {
                continue;
            };
            let sample = StepSample {
                trace_uid: trace.uid.as_str().to_string(),
                iterations: tstep.iterations,
                duration,
            };
            let key = self.step_key(schema, spec);
            if let Some(refit) = self.apply_retain(&key, spec, &sample) {
                mirrors.push((spec.position, key.technique, refit));
            }
        }
        self.mark_whole_stale(schema);
        for (position, technique, fitted) in mirrors {
            self.mirror_step(schema, position, technique, fitted).await;
        }
        Ok(())
    }

    /// Unlearn an evicted trace. Means decrement in place; percentile and
    /// linear cells are marked stale for recompute.
    pub async fn observe_evicted(
        &self,
        schema: &BarSchema,
        trace: &CompletedTrace,
    ) -> Result<(), EngineError> {
        self.note_version(schema.bar_uid.as_str(), schema.version);
        let mut mirrors = Vec::new();
        for spec in &schema.steps {
            let Some(tstep) = trace.steps.iter().find(|s| s.position == spec.position) else {
                continue;
            };
            let Some(duration) = tstep.duration() else {
                continue;
            };
            let sample = StepSample {
                trace_uid: trace.uid.as_str().to_string(),
                iterations: tstep.iterations,
                duration,
            };
            let key = self.step_key(schema, spec);
            if let Some(refit) = self.apply_evict(&key, spec, &sample) {
                mirrors.push((spec.position, key.technique, refit));
            }
        }
        self.mark_whole_stale(schema);
        for (position, technique, fitted) in mirrors {
            self.mirror_step(schema, position, technique, fitted).await;
        }
        Ok(())
    }

    fn apply_retain(
        &self,
        key: &CellKey,
        spec: &StepSpec,
        sample: &StepSample,
    ) -> Option<FittedParams> {
        let mut cell = self.cells.get_mut(key)?;
        if cell.frozen || !cell.seen.insert(sample.trace_uid.clone()) {
            return None;
        }
        match cell.acc {
            Accumulator::Percentile { .. } => {
                cell.stale = true;
                None
            }
            _ => {
                add_sample(&mut cell.acc, spec, sample);
                cell.fitted = fit(&cell.acc);
                cell.fitted
            }
        }
    }

    fn apply_evict(
        &self,
        key: &CellKey,
        spec: &StepSpec,
        sample: &StepSample,
    ) -> Option<FittedParams> {
        let mut cell = self.cells.get_mut(key)?;
        if cell.frozen || !cell.seen.remove(&sample.trace_uid) {
            return None;
        }
        match cell.acc {
            Accumulator::Percentile { .. } | Accumulator::Linear { .. } => {
                cell.stale = true;
                None
            }
            _ => {
                remove_sample(&mut cell.acc, spec, sample);
                cell.fitted = fit(&cell.acc);
                cell.fitted
            }
        }
    }

    fn mark_whole_stale(&self, schema: &BarSchema) {
        let bar_uid = schema.bar_uid.as_str();
        for mut cell in self.cells.iter_mut() {
            let key = cell.key();
            if key.bar_uid == bar_uid
                && key.version == schema.version
                && key.target == CellTarget::Whole
            {
                cell.stale = true;
            }
        }
    }

    /// Serve the step cell, materializing or recomputing as needed.
    async fn ensure_step_cell(
        &self,
        schema: &BarSchema,
        spec: &StepSpec,
    ) -> Result<Option<FittedParams>, EngineError> {
        let key = self.step_key(schema, spec);
        let now = self.clock.now();
        if let Some(cell) = self.cells.get(&key) {
            if cell.frozen
                || !cell.stale
                || now - cell.last_recompute_at < self.config.recompute_min_interval_seconds
            {
                return Ok(cell.fitted);
            }
        }

        let samples = with_store_retry(self.retry, "predictor.step_samples", || {
            self.durable.step_samples(
                schema.bar_uid.as_str(),
                schema.version,
                spec.position,
                self.scan_floor(schema),
            )
        })
        .await?;

        let mut acc = Accumulator::for_technique(key.technique);
        let mut seen = HashSet::with_capacity(samples.len());
        for sample in &samples {
            // add_sample accepts every sample for percentile cells, so the
            // seen set covers the whole scan there too.
            if add_sample(&mut acc, spec, sample) {
                seen.insert(sample.trace_uid.clone());
            }
        }
        let fitted = match &acc {
            Accumulator::Percentile { percentile } => percentile_fit(spec, *percentile, &samples),
            _ => fit(&acc),
        };
        debug!(
            bar = schema.bar_uid.as_str(),
            version = schema.version,
            position = spec.position,
            technique = %key.technique,
            samples = samples.len(),
            "materialized predictor cell"
        );
        self.cells.insert(
            key.clone(),
            Cell {
                acc,
                fitted,
                seen,
                stale: false,
                frozen: false,
                last_recompute_at: now,
            },
        );
        if let Some(f) = fitted {
            self.mirror_step(schema, spec.position, key.technique, f).await;
        }
        Ok(fitted)
    }

    /// Median iteration count across the retained window for an iterated
    /// step; the evaluation point for whole-trace estimates when the caller
    /// supplies no count.
    async fn median_iterations(
        &self,
        schema: &BarSchema,
        spec: &StepSpec,
    ) -> Result<Option<f64>, EngineError> {
        let samples = with_store_retry(self.retry, "predictor.median_scan", || {
            self.durable.step_samples(
                schema.bar_uid.as_str(),
                schema.version,
                spec.position,
                self.scan_floor(schema),
            )
        })
        .await?;
        let mut ns: Vec<f64> = samples
            .iter()
            .filter_map(|s| s.iterations)
            .map(f64::from)
            .collect();
        if ns.is_empty() {
            return Ok(None);
        }
        ns.sort_by(|a, b| a.total_cmp(b));
        let mid = ns.len() / 2;
        Ok(Some(if ns.len() % 2 == 1 {
            ns[mid]
        } else {
            (ns[mid - 1] + ns[mid]) / 2.0
        }))
    }

    /// Predict the duration of one step.
    ///
    /// `iterations` is the count for this run of an iterated step; when
    /// omitted, the median retained count is used.
    pub async fn predict_step(
        &self,
        schema: &BarSchema,
        position: u32,
        iterations: Option<u32>,
    ) -> Result<Prediction, EngineError> {
        self.note_version(schema.bar_uid.as_str(), schema.version);
        let spec = schema
            .step_at(position)
            .ok_or(ValidationError::WrongPosition {
                expected: schema.final_position(),
                got: position,
            })?;
        let Some(fitted) = self.ensure_step_cell(schema, spec).await? else {
            return Ok(Prediction::Empty);
        };
        let n = if spec.iterated {
            match iterations {
                Some(n) => Some(f64::from(n)),
                None => self.median_iterations(schema, spec).await?,
            }
        } else {
            None
        };
        Ok(predict_value(spec, fitted, n))
    }

    /// Predict the whole-trace duration: the sum of per-step predictions
    /// using each step's own technique, iterated steps evaluated at the
    /// median retained count. Cached in the default-technique whole cell
    /// and mirrored to the hot store.
    pub async fn predict_whole(&self, schema: &BarSchema) -> Result<Prediction, EngineError> {
        self.note_version(schema.bar_uid.as_str(), schema.version);
        let key = self.whole_key(schema);
        let now = self.clock.now();
        if let Some(cell) = self.cells.get(&key) {
            if cell.frozen
                || !cell.stale
                || now - cell.last_recompute_at < self.config.recompute_min_interval_seconds
            {
                return Ok(match cell.fitted {
                    Some(f) => Prediction::Seconds(f.a),
                    None => Prediction::Empty,
                });
            }
        }

        let mut total = 0.0;
        let mut empty = schema.steps.is_empty();
        for spec in &schema.steps {
            match self.predict_step(schema, spec.position, None).await? {
                Prediction::Seconds(s) => total += s,
                Prediction::Empty => {
                    empty = true;
                    break;
                }
            }
        }
        let fitted = (!empty).then_some(FittedParams { a: total, b: None });
        self.cells.insert(
            key.clone(),
            Cell {
                acc: Accumulator::Whole,
                fitted,
                seen: HashSet::new(),
                stale: false,
                frozen: false,
                last_recompute_at: now,
            },
        );
        if let Some(f) = fitted {
            let hot_key = keys::stats_whole(
                &schema.owner,
                &schema.name,
                schema.version,
                &key.technique.to_string(),
            );
            if let Err(e) = self.hot.scalar_set(&hot_key, f.a.to_string()).await {
                warn!(key = %hot_key, error = %e, "failed to mirror whole-trace estimate");
            }
        }
        Ok(match fitted {
            Some(f) => Prediction::Seconds(f.a),
            None => Prediction::Empty,
        })
    }

    async fn mirror_step(
        &self,
        schema: &BarSchema,
        position: u32,
        technique: TechniqueKey,
        fitted: FittedParams,
    ) {
        let hot_key = keys::stats_step(
            &schema.owner,
            &schema.name,
            schema.version,
            position,
            &technique.to_string(),
        );
        let mut fields: Vec<(&str, String)> = vec![("a", fitted.a.to_string())];
        if let Some(b) = fitted.b {
            fields.push(("b", b.to_string()));
        }
        if let Err(e) = self.hot.hash_set(&hot_key, &fields).await {
            warn!(key = %hot_key, error = %e, "failed to mirror step estimate");
        }
    }
}
