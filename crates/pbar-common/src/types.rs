//! Schema types for progress bars, steps, and traces.
//!
//! A progress bar is an ordered sequence of named steps. Position 0 holds
//! the *default spec*, which is not a real step: it supplies the technique
//! used for the whole-trace estimate. Positions 1..K are the steps a run
//! actually executes, contiguous with no gaps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::ExternalId;

/// Reserved name for the position-0 default spec.
pub const DEFAULT_STEP_NAME: &str = "default";

/// Default number of retained samples per bar.
pub const DEFAULT_SAMPLING_MAX_COUNT: u32 = 100;
/// Default retained-sample age bound: one week, in seconds.
pub const DEFAULT_SAMPLING_MAX_AGE_SECONDS: u32 = 604_800;
/// Default percentile for percentile-technique predictions.
pub const DEFAULT_PERCENTILE: u8 = 75;

/// Statistical technique used to predict a step duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    /// Smallest sample slower than a fixed fraction of the samples.
    Percentile,
    /// <https://en.wikipedia.org/wiki/Harmonic_mean>
    HarmonicMean,
    /// <https://en.wikipedia.org/wiki/Geometric_mean>
    GeometricMean,
    /// <https://en.wikipedia.org/wiki/Arithmetic_mean>
    ArithmeticMean,
    /// Ordinary least squares fit of t = a·n + b over (iterations, seconds)
    /// pairs. Only valid for iterated steps.
    #[serde(rename = "best_fit.linear")]
    BestFitLinear,
}

impl Technique {
    /// Wire name, matching the stored `technique` columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::Percentile => "percentile",
            Technique::HarmonicMean => "harmonic_mean",
            Technique::GeometricMean => "geometric_mean",
            Technique::ArithmeticMean => "arithmetic_mean",
            Technique::BestFitLinear => "best_fit.linear",
        }
    }

    /// Whether this technique may appear as a one-off (non-iterated)
    /// technique. The linear fit needs iteration counts, so it is
    /// iterated-only.
    pub fn valid_for_one_off(&self) -> bool {
        !matches!(self, Technique::BestFitLinear)
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentile" => Ok(Technique::Percentile),
            "harmonic_mean" => Ok(Technique::HarmonicMean),
            "geometric_mean" => Ok(Technique::GeometricMean),
            "arithmetic_mean" => Ok(Technique::ArithmeticMean),
            "best_fit.linear" => Ok(Technique::BestFitLinear),
            other => Err(format!("unknown technique: {other}")),
        }
    }
}

/// A technique plus the parameter that distinguishes its predictor cell.
///
/// Rendered with the `technique_key` grammar used in store keys:
/// `arithmetic_mean | geometric_mean | harmonic_mean | best_fit.linear |
/// percentile_{P}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TechniqueKey {
    ArithmeticMean,
    GeometricMean,
    HarmonicMean,
    BestFitLinear,
    Percentile(u8),
}

impl TechniqueKey {
    /// Build the key for a technique, attaching the percentile parameter
    /// when the technique needs one.
    pub fn new(technique: Technique, percentile: u8) -> Self {
        match technique {
            Technique::ArithmeticMean => TechniqueKey::ArithmeticMean,
            Technique::GeometricMean => TechniqueKey::GeometricMean,
            Technique::HarmonicMean => TechniqueKey::HarmonicMean,
            Technique::BestFitLinear => TechniqueKey::BestFitLinear,
            Technique::Percentile => TechniqueKey::Percentile(percentile.min(100)),
        }
    }

    /// The underlying technique.
    pub fn technique(&self) -> Technique {
        match self {
            TechniqueKey::ArithmeticMean => Technique::ArithmeticMean,
            TechniqueKey::GeometricMean => Technique::GeometricMean,
            TechniqueKey::HarmonicMean => Technique::HarmonicMean,
            TechniqueKey::BestFitLinear => Technique::BestFitLinear,
            TechniqueKey::Percentile(_) => Technique::Percentile,
        }
    }

    /// Parse a rendered technique key.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arithmetic_mean" => Some(TechniqueKey::ArithmeticMean),
            "geometric_mean" => Some(TechniqueKey::GeometricMean),
            "harmonic_mean" => Some(TechniqueKey::HarmonicMean),
            "best_fit.linear" => Some(TechniqueKey::BestFitLinear),
            other => {
                let p = other.strip_prefix("percentile_")?;
                let p: u8 = p.parse().ok()?;
                (p <= 100).then_some(TechniqueKey::Percentile(p))
            }
        }
    }
}

impl fmt::Display for TechniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TechniqueKey::ArithmeticMean => f.write_str("arithmetic_mean"),
            TechniqueKey::GeometricMean => f.write_str("geometric_mean"),
            TechniqueKey::HarmonicMean => f.write_str("harmonic_mean"),
            TechniqueKey::BestFitLinear => f.write_str("best_fit.linear"),
            TechniqueKey::Percentile(p) => write!(f, "percentile_{p}"),
        }
    }
}

/// How completed traces are selected for retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplingTechnique {
    /// Retain at most one trace per fixed interval; hard count limit.
    #[default]
    Systematic,
    /// Retain each trace with probability max_count / window_count; no hard
    /// limit, expected count near max_count.
    SimpleRandom,
}

impl SamplingTechnique {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingTechnique::Systematic => "systematic",
            SamplingTechnique::SimpleRandom => "simple_random",
        }
    }
}

impl fmt::Display for SamplingTechnique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingTechnique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "systematic" => Ok(SamplingTechnique::Systematic),
            "simple_random" => Ok(SamplingTechnique::SimpleRandom),
            other => Err(format!("unknown sampling technique: {other}")),
        }
    }
}

/// Configuration of a single step within a bar's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Stable external id.
    pub uid: ExternalId,
    /// Name, unique within the bar. `default` is reserved for position 0.
    pub name: String,
    /// Position within the task. 0 is the default spec, 1 is the first real
    /// step.
    pub position: u32,
    /// Whether the step consists of many identical sub-units.
    pub iterated: bool,
    /// Technique applied when the step is one-off.
    pub one_off_technique: Technique,
    /// Percentile used when `one_off_technique` is percentile.
    pub one_off_percentile: u8,
    /// Technique applied when the step is iterated.
    pub iterated_technique: Technique,
    /// Percentile used when `iterated_technique` is percentile.
    pub iterated_percentile: u8,
    /// Creation time, seconds since the epoch.
    pub created_at: f64,
}

impl StepSpec {
    /// The default spec for a new bar: one-off percentile-75, iterated
    /// linear fit.
    pub fn default_spec(created_at: f64) -> Self {
        Self {
            uid: ExternalId::step(),
            name: DEFAULT_STEP_NAME.to_string(),
            position: 0,
            iterated: false,
            one_off_technique: Technique::Percentile,
            one_off_percentile: DEFAULT_PERCENTILE,
            iterated_technique: Technique::BestFitLinear,
            iterated_percentile: DEFAULT_PERCENTILE,
            created_at,
        }
    }

    /// Whether this is the position-0 default spec.
    pub fn is_default(&self) -> bool {
        self.position == 0
    }

    /// The technique in effect given the step's iterated flag.
    pub fn active_technique(&self) -> Technique {
        if self.iterated {
            self.iterated_technique
        } else {
            self.one_off_technique
        }
    }

    /// The predictor-cell key in effect for this spec.
    pub fn active_key(&self) -> TechniqueKey {
        if self.iterated {
            TechniqueKey::new(self.iterated_technique, self.iterated_percentile)
        } else {
            TechniqueKey::new(self.one_off_technique, self.one_off_percentile)
        }
    }
}

/// A bar's resolved schema at a specific version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSchema {
    /// Stable external id of the bar.
    pub bar_uid: ExternalId,
    /// Owning user's subject identifier.
    pub owner: String,
    /// Bar name, unique per owner.
    pub name: String,
    /// Monotone version, bumped on schema drift.
    pub version: u32,
    /// Maximum retained samples (hard limit under systematic).
    pub sampling_max_count: u32,
    /// Maximum retained-sample age; `None` means unbounded.
    pub sampling_max_age_seconds: Option<u32>,
    /// Retention technique.
    pub sampling_technique: SamplingTechnique,
    /// Position-0 default spec (whole-trace technique).
    pub default_spec: StepSpec,
    /// Real steps at positions 1..K, in position order.
    pub steps: Vec<StepSpec>,
    /// Creation time, seconds since the epoch.
    pub created_at: f64,
}

impl BarSchema {
    /// Number of real steps (K).
    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Position of the last step, the one whose finish completes a trace.
    pub fn final_position(&self) -> u32 {
        self.steps.len() as u32
    }

    /// The step at a 1-based position, if any.
    pub fn step_at(&self, position: u32) -> Option<&StepSpec> {
        if position == 0 {
            return None;
        }
        self.steps.get(position as usize - 1)
    }

    /// The age window used for sampling math, defaulting to one week when
    /// the bar has no age bound.
    pub fn sampling_window_seconds(&self) -> f64 {
        f64::from(
            self.sampling_max_age_seconds
                .unwrap_or(DEFAULT_SAMPLING_MAX_AGE_SECONDS),
        )
    }

    /// Verify positions 0..K are contiguous, names are unique, and the
    /// reserved name only appears at position 0. Returns a description of
    /// the first violation.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.default_spec.position != 0 {
            return Err("default spec must sit at position 0".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.position != expected {
                return Err(format!(
                    "step {:?} at position {} but expected {}",
                    step.name, step.position, expected
                ));
            }
            if step.name == DEFAULT_STEP_NAME {
                return Err(format!("step name {DEFAULT_STEP_NAME:?} is reserved"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(format!("duplicate step name {:?}", step.name));
            }
            if !step.iterated && !step.one_off_technique.valid_for_one_off() {
                return Err(format!(
                    "step {:?} is one-off but uses {}",
                    step.name,
                    step.one_off_technique
                ));
            }
        }
        Ok(())
    }
}

/// One observed step of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// 1-based position within the bar.
    pub position: u32,
    /// Step name as reported by the client.
    pub step_name: String,
    /// Total iterations; `None` iff the step spec is one-off.
    pub iterations: Option<u32>,
    /// Start time, seconds since the epoch.
    pub started_at: f64,
    /// Finish time; `None` while the step is in progress.
    pub finished_at: Option<f64>,
}

impl TraceStep {
    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<f64> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// An in-memory projection of a completed trace, ready for retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTrace {
    /// Client-chosen trace uid.
    pub uid: ExternalId,
    /// Bar the trace ran against.
    pub bar_uid: ExternalId,
    /// Bar version captured at intake time.
    pub bar_version: u32,
    /// Trace start time.
    pub created_at: f64,
    /// Steps 1..K, all finished, in position order.
    pub steps: Vec<TraceStep>,
}

impl CompletedTrace {
    /// Duration of the step at a 1-based position.
    pub fn step_duration(&self, position: u32) -> Option<f64> {
        self.steps
            .iter()
            .find(|s| s.position == position)
            .and_then(TraceStep::duration)
    }

    /// Total wall-clock duration across all steps.
    pub fn total_duration(&self) -> f64 {
        self.steps
            .iter()
            .filter_map(TraceStep::duration)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, position: u32, iterated: bool) -> StepSpec {
        StepSpec {
            uid: ExternalId::step(),
            name: name.to_string(),
            position,
            iterated,
            one_off_technique: Technique::ArithmeticMean,
            one_off_percentile: DEFAULT_PERCENTILE,
            iterated_technique: Technique::BestFitLinear,
            iterated_percentile: DEFAULT_PERCENTILE,
            created_at: 0.0,
        }
    }

    fn schema(steps: Vec<StepSpec>) -> BarSchema {
        BarSchema {
            bar_uid: ExternalId::bar(),
            owner: "user-1".to_string(),
            name: "upload".to_string(),
            version: 1,
            sampling_max_count: 100,
            sampling_max_age_seconds: Some(3600),
            sampling_technique: SamplingTechnique::Systematic,
            default_spec: StepSpec::default_spec(0.0),
            steps,
            created_at: 0.0,
        }
    }

    #[test]
    fn technique_round_trips_through_str() {
        for t in [
            Technique::Percentile,
            Technique::HarmonicMean,
            Technique::GeometricMean,
            Technique::ArithmeticMean,
            Technique::BestFitLinear,
        ] {
            assert_eq!(t.as_str().parse::<Technique>().unwrap(), t);
        }
        assert!("midpoint".parse::<Technique>().is_err());
    }

    #[test]
    fn technique_serde_uses_wire_names() {
        let json = serde_json::to_string(&Technique::BestFitLinear).unwrap();
        assert_eq!(json, "\"best_fit.linear\"");
        let json = serde_json::to_string(&Technique::HarmonicMean).unwrap();
        assert_eq!(json, "\"harmonic_mean\"");
    }

    #[test]
    fn technique_key_grammar() {
        assert_eq!(TechniqueKey::ArithmeticMean.to_string(), "arithmetic_mean");
        assert_eq!(TechniqueKey::BestFitLinear.to_string(), "best_fit.linear");
        assert_eq!(TechniqueKey::Percentile(90).to_string(), "percentile_90");

        assert_eq!(
            TechniqueKey::parse("percentile_90"),
            Some(TechniqueKey::Percentile(90))
        );
        assert_eq!(
            TechniqueKey::parse("best_fit.linear"),
            Some(TechniqueKey::BestFitLinear)
        );
        assert_eq!(TechniqueKey::parse("percentile_101"), None);
        assert_eq!(TechniqueKey::parse("percentile_"), None);
        assert_eq!(TechniqueKey::parse("median"), None);
    }

    #[test]
    fn percentile_param_only_kept_for_percentile() {
        assert_eq!(
            TechniqueKey::new(Technique::ArithmeticMean, 90),
            TechniqueKey::ArithmeticMean
        );
        assert_eq!(
            TechniqueKey::new(Technique::Percentile, 90),
            TechniqueKey::Percentile(90)
        );
    }

    #[test]
    fn active_key_follows_iterated_flag() {
        let mut s = spec("load", 1, false);
        s.one_off_technique = Technique::Percentile;
        s.one_off_percentile = 90;
        assert_eq!(s.active_key(), TechniqueKey::Percentile(90));
        s.iterated = true;
        assert_eq!(s.active_key(), TechniqueKey::BestFitLinear);
    }

    #[test]
    fn schema_integrity_accepts_contiguous_steps() {
        let s = schema(vec![spec("a", 1, false), spec("b", 2, true)]);
        assert!(s.check_integrity().is_ok());
        assert_eq!(s.final_position(), 2);
        assert_eq!(s.step_at(2).unwrap().name, "b");
        assert!(s.step_at(0).is_none());
        assert!(s.step_at(3).is_none());
    }

    #[test]
    fn schema_integrity_rejects_gaps_and_duplicates() {
        let s = schema(vec![spec("a", 1, false), spec("b", 3, false)]);
        assert!(s.check_integrity().is_err());

        let s = schema(vec![spec("a", 1, false), spec("a", 2, false)]);
        assert!(s.check_integrity().is_err());

        let s = schema(vec![spec(DEFAULT_STEP_NAME, 1, false)]);
        assert!(s.check_integrity().is_err());
    }

    #[test]
    fn schema_integrity_rejects_linear_one_off() {
        let mut bad = spec("a", 1, false);
        bad.one_off_technique = Technique::BestFitLinear;
        assert!(schema(vec![bad]).check_integrity().is_err());
    }

    #[test]
    fn sampling_window_defaults_to_a_week() {
        let mut s = schema(vec![]);
        s.sampling_max_age_seconds = None;
        assert_eq!(s.sampling_window_seconds(), 604_800.0);
        s.sampling_max_age_seconds = Some(60);
        assert_eq!(s.sampling_window_seconds(), 60.0);
    }

    #[test]
    fn trace_durations() {
        let trace = CompletedTrace {
            uid: ExternalId::trace(),
            bar_uid: ExternalId::bar(),
            bar_version: 1,
            created_at: 100.0,
            steps: vec![
                TraceStep {
                    position: 1,
                    step_name: "a".to_string(),
                    iterations: None,
                    started_at: 100.0,
                    finished_at: Some(103.0),
                },
                TraceStep {
                    position: 2,
                    step_name: "b".to_string(),
                    iterations: Some(4),
                    started_at: 103.0,
                    finished_at: Some(110.0),
                },
            ],
        };
        assert_eq!(trace.step_duration(1), Some(3.0));
        assert_eq!(trace.step_duration(2), Some(7.0));
        assert_eq!(trace.step_duration(3), None);
        assert_eq!(trace.total_duration(), 10.0);
    }
}
