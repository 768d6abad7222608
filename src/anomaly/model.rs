use crate::reading::EnrichedReading;
use std::fmt;

/// Feature vector layout: [speed, heading, quality, battery, x, y].
pub const FEATURE_COUNT: usize = 6;

/// Score above which a standardized observation counts as novel.
pub const NOVELTY_THRESHOLD: f64 = 3.0;

const STD_EPSILON: f64 = 1e-9;

/// Minimum history rows needed to fit a model.
pub const MIN_TRAINING_ROWS: usize = 20;

/// Why a model fit was not produced this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingError {
    InsufficientHistory { have: usize, need: usize },
    /// Every feature is constant, leaving nothing to standardize against
    DegenerateHistory,
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::InsufficientHistory { have, need } => {
                write!(f, "insufficient history: {} rows, need {}", have, need)
            }
            TrainingError::DegenerateHistory => write!(f, "degenerate history: zero variance"),
        }
    }
}

impl std::error::Error for TrainingError {}

/// Extract the model feature vector from an enriched reading.
///
/// Absent telemetry falls back to its nominal value so the vector stays
/// fixed-width across producers with different payload completeness.
pub fn features(reading: &EnrichedReading) -> [f64; FEATURE_COUNT] {
    [
        reading.speed_mps.unwrap_or(0.0),
        reading.heading_deg.unwrap_or(0.0),
        reading.quality.unwrap_or(1.0),
        reading.battery_percent.unwrap_or(100.0),
        reading.plant_x,
        reading.plant_y,
    ]
}

/// Per-entity unsupervised novelty scorer.
///
/// Fit standardizes each feature against the entity's recent history; the
/// score of a new observation is its mean absolute z across features with
/// usable variance. Replaced atomically on retrain: a track either holds
/// the old model or the new one, never a partial update.
#[derive(Clone, Debug, PartialEq)]
pub struct NoveltyModel {
    means: [f64; FEATURE_COUNT],
    stds: [f64; FEATURE_COUNT],
    trained_on: usize,
}

impl NoveltyModel {
    /// Fit scaling parameters on recent feature history.
    pub fn fit(rows: &[[f64; FEATURE_COUNT]]) -> Result<Self, TrainingError> {
        if rows.len() < MIN_TRAINING_ROWS {
            return Err(TrainingError::InsufficientHistory {
                have: rows.len(),
                need: MIN_TRAINING_ROWS,
            });
        }

        let n = rows.len() as f64;
        let mut means = [0.0; FEATURE_COUNT];
        let mut stds = [0.0; FEATURE_COUNT];

        for row in rows {
            for (i, v) in row.iter().enumerate() {
                means[i] += v;
            }
        }
        for mean in means.iter_mut() {
            *mean /= n;
        }
        for row in rows {
            for (i, v) in row.iter().enumerate() {
                stds[i] += (v - means[i]).powi(2);
            }
        }
        for std in stds.iter_mut() {
            *std = (*std / n).sqrt();
        }

        if stds.iter().all(|s| *s <= STD_EPSILON) {
            return Err(TrainingError::DegenerateHistory);
        }

        Ok(Self {
            means,
            stds,
            trained_on: rows.len(),
        })
    }

    /// Mean absolute z-score across features with usable variance.
    pub fn score(&self, v: &[f64; FEATURE_COUNT]) -> f64 {
        let mut total = 0.0;
        let mut used = 0usize;
        for i in 0..FEATURE_COUNT {
            if self.stds[i] > STD_EPSILON {
                total += ((v[i] - self.means[i]) / self.stds[i]).abs();
                used += 1;
            }
        }
        if used == 0 {
            0.0
        } else {
            total / used as f64
        }
    }

    pub fn is_novel(&self, v: &[f64; FEATURE_COUNT]) -> bool {
        self.score(v) > NOVELTY_THRESHOLD
    }

    pub fn trained_on(&self) -> usize {
        self.trained_on
    }
}
