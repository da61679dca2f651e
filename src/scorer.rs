//! Scorer (spec §4.F): weighted linear combination of per-candidate signals
//! with online gradient-based weight adaptation. Weights are a single
//! process-wide snapshot-replace value (§9 "Global mutable weights") — every
//! scoring pass reads one `Arc<ScorerWeights>` snapshot taken at request
//! start, so a concurrent learner update never produces partial-update
//! visibility within one request.

use crate::candidates::Candidate;
use crate::config::EngineConfig;
use crate::normalizer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ScorerWeights {
    pub transition: f64,
    pub frequency: f64,
    pub success: f64,
    pub prefix: f64,
    pub affinity: f64,
    pub project_type_affinity: f64,
    pub task: f64,
    pub feedback: f64,
    pub failure_recovery: f64,
    pub risk: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        ScorerWeights {
            transition: 1.0,
            frequency: 1.0,
            success: 0.5,
            prefix: 1.0,
            affinity: 0.3,
            project_type_affinity: 0.3,
            task: 0.8,
            feedback: 1.0,
            failure_recovery: 1.2,
            risk: 1.0,
        }
    }
}

impl ScorerWeights {
    fn as_array(&self) -> [f64; 10] {
        [
            self.transition,
            self.frequency,
            self.success,
            self.prefix,
            self.affinity,
            self.project_type_affinity,
            self.task,
            self.feedback,
            self.failure_recovery,
            self.risk,
        ]
    }

    fn from_array(a: [f64; 10]) -> Self {
        ScorerWeights {
            transition: a[0],
            frequency: a[1],
            success: a[2],
            prefix: a[3],
            affinity: a[4],
            project_type_affinity: a[5],
            task: a[6],
            feedback: a[7],
            failure_recovery: a[8],
            risk: a[9],
        }
    }
}

const SIGNAL_NAMES: [&str; 10] = [
    "transition",
    "frequency",
    "success",
    "prefix",
    "affinity",
    "project_type_affinity",
    "task",
    "feedback",
    "failure_recovery",
    "risk",
];

pub struct Scorer {
    weights: RwLock<ScorerWeights>,
    samples: AtomicU64,
    cfg: Arc<EngineConfig>,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub cmd_norm: String,
    pub candidate: Candidate,
    pub score: f64,
    pub signals: [f64; 10],
}

pub struct ScoringContext {
    pub session_tool: Option<String>,
    pub project_type: Option<String>,
    pub buffer: Option<String>,
    pub prior_exit_nonzero: bool,
}

impl Scorer {
    pub fn new(cfg: Arc<EngineConfig>) -> Self {
        Scorer {
            weights: RwLock::new(ScorerWeights::default()),
            samples: AtomicU64::new(0),
            cfg,
        }
    }

    pub fn load_persisted(&self, rows: Vec<(String, f64, u64)>) {
        let mut weights = self.weights.write().unwrap();
        let mut arr = weights.as_array();
        let mut max_samples = 0u64;
        for (signal, value, sample_count) in rows {
            if let Some(idx) = SIGNAL_NAMES.iter().position(|n| *n == signal) {
                arr[idx] = value.clamp(self.cfg.signal_weight_min, self.cfg.signal_weight_max);
                max_samples = max_samples.max(sample_count);
            }
        }
        *weights = ScorerWeights::from_array(arr);
        self.samples.store(max_samples, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScorerWeights {
        *self.weights.read().unwrap()
    }

    pub fn weights_for_persist(&self) -> Vec<(String, f64, u64)> {
        let arr = self.weights.read().unwrap().as_array();
        let samples = self.samples.load(Ordering::Relaxed);
        SIGNAL_NAMES
            .iter()
            .zip(arr.iter())
            .map(|(name, value)| (name.to_string(), *value, samples))
            .collect()
    }

    /// Scores every candidate against one weight snapshot, stopping early if
    /// the deadline is within `hook_write_timeout_ms` of having elapsed
    /// (§4.F latency policy) and returning whatever top-K it has collected so
    /// far, tagging the response as degraded via the caller.
    pub fn score_all(
        &self,
        candidates: Vec<Candidate>,
        ctx: &ScoringContext,
        limit: u32,
        deadline: Instant,
    ) -> (Vec<ScoredCandidate>, bool) {
        let weights = self.snapshot();
        let mut scored = Vec::with_capacity(candidates.len());
        let margin = std::time::Duration::from_millis(self.cfg.hook_write_timeout_ms);
        let mut truncated = false;

        for candidate in candidates {
            if Instant::now() + margin >= deadline {
                truncated = true;
                break;
            }
            let (score, signals) = score_one(&candidate, &weights, ctx, &self.cfg);
            scored.push(ScoredCandidate {
                cmd_norm: candidate.cmd_norm.clone(),
                candidate,
                score,
                signals,
            });
        }

        scored.sort_by(|a, b| tie_break(a, b));
        scored.truncate(limit as usize);
        (scored, truncated)
    }

    /// Clipped gradient step per feedback observation (§4.F "Online
    /// learning"). `target` is 1.0 for an accept, 0.0 for a dismiss.
    pub fn observe_feedback(&self, signals: [f64; 10], predicted: f64, target: f64) {
        let samples = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if samples < self.cfg.online_learning_min_samples {
            return;
        }

        let eta = (self.cfg.learning_rate_initial * self.cfg.learning_rate_decay_const
            / (self.cfg.learning_rate_decay_const + samples as f64))
            .max(self.cfg.learning_rate_floor);
        let error = target - predicted;

        let mut weights = self.weights.write().unwrap();
        let mut arr = weights.as_array();
        for (w, signal) in arr.iter_mut().zip(signals.iter()) {
            *w = (*w + eta * error * signal).clamp(self.cfg.signal_weight_min, self.cfg.signal_weight_max);
        }
        *weights = ScorerWeights::from_array(arr);
    }
}

fn score_one(
    candidate: &Candidate,
    weights: &ScorerWeights,
    ctx: &ScoringContext,
    cfg: &EngineConfig,
) -> (f64, [f64; 10]) {
    let age_hours = ((crate::util::now_ms() - candidate.last_ts).max(0) as f64) / 3_600_000.0;
    let decay = (-std::f64::consts::LN_2 * age_hours / cfg.score_half_life_hours.max(0.001)).exp();

    let transition = if candidate.transition_total > 0 {
        (candidate.transition_count as f64 + 1.0) / (candidate.transition_total as f64 + 2.0)
    } else {
        0.0
    } * decay;

    let scope_weight = match candidate.frequency_scope_rank {
        0 => 1.0,
        1 => 0.7,
        2 => 0.4,
        _ => 0.2,
    };
    let frequency = if candidate.frequency_count > 0 {
        scope_weight * ((1.0 + candidate.frequency_count as f64).ln() / (1.0 + candidate.frequency_count as f64 + 50.0).ln())
    } else {
        0.0
    } * decay;

    let success = if candidate.frequency_count > 0 {
        candidate.frequency_success as f64 / candidate.frequency_count.max(1) as f64
    } else {
        0.0
    };

    let prefix = match &ctx.buffer {
        Some(buf) if !buf.is_empty() => {
            if candidate.is_prefix_match {
                1.0
            } else {
                partial_match_ratio(buf, &candidate.cmd_norm)
            }
        }
        _ => 0.0,
    };

    let affinity = match (&ctx.session_tool, candidate.tool.is_empty()) {
        (Some(tool), false) if tool == &candidate.tool => 1.0,
        _ => 0.0,
    };

    let project_type_affinity = if ctx.project_type.is_some() && candidate.playbook_boost > 0.0 {
        1.0
    } else {
        0.0
    };

    let task = candidate.playbook_boost;

    // (accepts - dismisses) / (accepts + dismisses + k), §4.F's smoothed
    // feedback ratio. k keeps candidates with little feedback history near 0
    // instead of swinging on a single observation.
    let accepts = candidate.feedback_accepts as f64;
    let dismisses = candidate.feedback_dismisses as f64;
    let feedback = (accepts - dismisses) / (accepts + dismisses + cfg.feedback_smoothing_k);

    let failure_recovery = if candidate.failure_recovery_count > 0 {
        candidate.failure_recovery_count as f64 / (candidate.failure_recovery_count as f64 + cfg.candidate_pool_per_source as f64)
    } else {
        0.0
    };

    let risk_tags = normalizer::risk_tags_for_text(&candidate.cmd_norm);
    let risk_penalty: f64 = risk_tags
        .iter()
        .filter_map(|tag| cfg.risk_tag_weights.get(tag))
        .sum();

    let signals = [
        transition,
        frequency,
        success,
        prefix,
        affinity,
        project_type_affinity,
        task,
        feedback,
        failure_recovery,
        risk_penalty,
    ];

    let w = weights.as_array();
    let score = w[0] * signals[0]
        + w[1] * signals[1]
        + w[2] * signals[2]
        + w[3] * signals[3]
        + w[4] * signals[4]
        + w[5] * signals[5]
        + w[6] * signals[6]
        + w[7] * signals[7]
        + w[8] * signals[8]
        - w[9] * signals[9];

    (score, signals)
}

fn partial_match_ratio(buffer: &str, candidate: &str) -> f64 {
    let common = buffer
        .chars()
        .zip(candidate.chars())
        .take_while(|(a, b)| a == b)
        .count();
    if buffer.is_empty() {
        0.0
    } else {
        common as f64 / buffer.len() as f64
    }
}

/// Deterministic tie-break (§4.F): higher score, then larger `last_ts`, then
/// shorter `cmd_norm`, then lexicographic `cmd_norm`.
fn tie_break(a: &ScoredCandidate, b: &ScoredCandidate) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.candidate.last_ts.cmp(&a.candidate.last_ts))
        .then_with(|| a.cmd_norm.len().cmp(&b.cmd_norm.len()))
        .then_with(|| a.cmd_norm.cmp(&b.cmd_norm))
}

#[allow(dead_code)]
fn signal_map(signals: [f64; 10]) -> HashMap<&'static str, f64> {
    SIGNAL_NAMES.iter().copied().zip(signals).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateSource;

    fn candidate(cmd_norm: &str) -> Candidate {
        Candidate {
            cmd_norm: cmd_norm.to_string(),
            sources: vec![CandidateSource::Transition],
            tool: "git".to_string(),
            transition_count: 9,
            transition_total: 10,
            frequency_count: 5,
            frequency_success: 5,
            frequency_scope_rank: 0,
            last_ts: crate::util::now_ms(),
            is_prefix_match: false,
            failure_recovery_count: 0,
            playbook_boost: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn high_transition_count_outscores_cold_candidate() {
        let cfg = Arc::new(EngineConfig::default());
        let scorer = Scorer::new(cfg.clone());
        let ctx = ScoringContext {
            session_tool: None,
            project_type: None,
            buffer: None,
            prior_exit_nonzero: false,
        };
        let hot = candidate("git commit -m <STR>");
        let mut cold = candidate("git log");
        cold.transition_count = 0;
        cold.frequency_count = 0;

        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (scored, _) = scorer.score_all(vec![hot, cold], &ctx, 10, deadline);
        assert_eq!(scored[0].cmd_norm, "git commit -m <STR>");
    }

    #[test]
    fn learning_is_inactive_below_min_samples() {
        let cfg = Arc::new(EngineConfig::default());
        let scorer = Scorer::new(cfg);
        let before = scorer.snapshot().transition;
        scorer.observe_feedback([1.0; 10], 0.2, 1.0);
        assert_eq!(scorer.snapshot().transition, before);
    }

    #[test]
    fn tie_break_prefers_shorter_then_lexicographic() {
        let mut c_a = candidate("git status");
        let mut c_b = candidate("git st");
        c_a.last_ts = 1000;
        c_b.last_ts = 1000;
        let a = ScoredCandidate {
            cmd_norm: "git status".into(),
            candidate: c_a,
            score: 1.0,
            signals: [0.0; 10],
        };
        let b = ScoredCandidate {
            cmd_norm: "git st".into(),
            candidate: c_b,
            score: 1.0,
            signals: [0.0; 10],
        };
        let mut v = vec![a, b];
        v.sort_by(tie_break);
        assert_eq!(v[0].cmd_norm, "git st");
    }
}
