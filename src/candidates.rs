//! Candidate generator (spec §4.E). Assembles a deduplicated candidate set
//! from five tagged sources. Each source contributes the raw counts the
//! Scorer needs to compute its per-signal normalization — the generator
//! itself does no weighting, matching §9's "closed set of tagged variants
//! with one shared output shape" design note.

use crate::config::EngineConfig;
use crate::models::{CandidateSource, CommandEvent, Scope};
use crate::session::SessionState;
use crate::store::Store;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub cmd_norm: String,
    pub sources: Vec<CandidateSource>,
    pub tool: String,
    pub transition_count: u64,
    pub transition_total: u64,
    pub frequency_count: u64,
    pub frequency_success: u64,
    /// 0 = session scope matched, 1 = dir, 2 = repo, 3 = global-only.
    pub frequency_scope_rank: u8,
    pub last_ts: i64,
    pub is_prefix_match: bool,
    pub failure_recovery_count: u64,
    pub playbook_boost: f64,
    pub feedback_accepts: u64,
    pub feedback_dismisses: u64,
}

impl Candidate {
    fn get_or_insert(map: &mut HashMap<String, Candidate>, cmd_norm: &str) -> &mut Candidate {
        map.entry(cmd_norm.to_string()).or_insert_with(|| Candidate {
            cmd_norm: cmd_norm.to_string(),
            ..Default::default()
        })
    }

    fn add_source(&mut self, source: CandidateSource) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaybookEntry {
    pub id: String,
    pub matches: PlaybookMatch,
    pub commands: Vec<String>,
    pub boost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybookMatch {
    pub project_type: Option<String>,
    pub prev_norm: Option<String>,
    pub task_id: Option<String>,
}

pub struct GenerateArgs<'a> {
    pub session_id: String,
    pub session: Option<&'a SessionState>,
    pub repo_key: Option<String>,
    pub buffer: Option<String>,
    pub case_sensitive: bool,
    pub playbooks: &'a [PlaybookEntry],
    pub project_type: Option<String>,
}

pub async fn generate(
    store: &Store,
    cfg: &EngineConfig,
    args: GenerateArgs<'_>,
) -> anyhow::Result<Vec<Candidate>> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    let now_ms = crate::util::now_ms();

    // 1. Transitions.
    let prev_norm = args.session.and_then(|s| s.last_norm.clone());
    let prev_norm = match prev_norm {
        Some(p) => Some(p),
        None => match &args.repo_key {
            Some(repo_key) => {
                store
                    .most_recent_in_scope(repo_key.clone(), now_ms - cfg.fallback_window_ms as i64)
                    .await?
            }
            None => None,
        },
    };

    if let Some(prev) = &prev_norm {
        for scope in candidate_scopes(args.session, &args.repo_key) {
            let rows = store
                .top_transitions(scope.clone(), prev.clone(), cfg.candidate_pool_per_source as u32)
                .await?;
            let total: u64 = rows.iter().map(|r| r.count).sum();
            for row in rows {
                let c = Candidate::get_or_insert(&mut candidates, &row.next_norm);
                c.add_source(CandidateSource::Transition);
                c.transition_count = c.transition_count.max(row.count);
                c.transition_total = c.transition_total.max(total);
                c.last_ts = c.last_ts.max(row.last_ts);
            }
        }
    }

    // 2. Frequency — scope preference order: session > dir > repo > global.
    for (rank, scope) in candidate_scopes(args.session, &args.repo_key).into_iter().enumerate() {
        let rows = store
            .top_frequency(scope, cfg.candidate_pool_per_source as u32)
            .await?;
        for row in rows {
            let c = Candidate::get_or_insert(&mut candidates, &row.cmd_norm);
            c.add_source(CandidateSource::Frequency);
            if c.frequency_count == 0 || (rank as u8) < c.frequency_scope_rank {
                c.frequency_scope_rank = rank as u8;
            }
            c.frequency_count = c.frequency_count.max(row.count);
            c.frequency_success = c.frequency_success.max(row.success_count);
            c.last_ts = c.last_ts.max(row.last_ts);
        }
    }

    // 3. Prefix match — only meaningful against candidates already in the
    // pool plus a direct store search when a buffer is present.
    if let Some(buffer) = &args.buffer {
        if !buffer.is_empty() {
            let needle = if args.case_sensitive {
                buffer.clone()
            } else {
                buffer.to_lowercase()
            };
            for c in candidates.values_mut() {
                let hay = if args.case_sensitive {
                    c.cmd_norm.clone()
                } else {
                    c.cmd_norm.to_lowercase()
                };
                if hay.starts_with(&needle) {
                    c.is_prefix_match = true;
                    c.add_source(CandidateSource::Prefix);
                }
            }

            let hits = store
                .search(buffer.clone(), args.repo_key.clone(), cfg.candidate_pool_per_source as u32, cfg.search_fallback_scan_limit)
                .await?;
            for hit in hits {
                let hay = if args.case_sensitive {
                    hit.cmd_norm.clone()
                } else {
                    hit.cmd_norm.to_lowercase()
                };
                if hay.starts_with(&needle) {
                    let c = Candidate::get_or_insert(&mut candidates, &hit.cmd_norm);
                    c.is_prefix_match = true;
                    c.last_ts = c.last_ts.max(hit.ts_ms);
                    c.add_source(CandidateSource::Prefix);
                }
            }
        }
    }

    // 4. Failure recovery.
    if let Some(failed_norm) = args.session.and_then(last_failed_norm) {
        let rows = store
            .failure_recoveries(args.session_id.clone(), failed_norm, cfg.failure_recovery_min_count)
            .await?;
        for row in rows {
            let c = Candidate::get_or_insert(&mut candidates, &row.recovery_norm);
            c.add_source(CandidateSource::FailureRecovery);
            c.failure_recovery_count = c.failure_recovery_count.max(row.count);
        }
    }

    // 5. Playbook.
    for entry in args.playbooks {
        let project_match = match (&entry.matches.project_type, &args.project_type) {
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let prev_match = match (&entry.matches.prev_norm, &prev_norm) {
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if project_match && prev_match {
            for cmd in &entry.commands {
                let c = Candidate::get_or_insert(&mut candidates, cmd);
                c.add_source(CandidateSource::Playbook);
                c.playbook_boost = c.playbook_boost.max(entry.boost.clamp(0.0, 1.0));
            }
        }
    }

    // 5.5 Ephemeral overlay. Sessions running `incognito=ephemeral|no_send`
    // never reach the Store (§3), so their own just-recorded commands would
    // otherwise contribute nothing to `suggest`; fold the session's volatile
    // log in as if it were a miniature transition/frequency source.
    if let Some(session) = args.session {
        if !session.incognito.persists() {
            apply_ephemeral_overlay(&mut candidates, &session.ephemeral_events, &prev_norm);
        }
    }

    // 6. Feedback counts, per candidate, scoped to the same key the Scorer's
    // feedback signal reasons about (§4.F). The candidate pool is already
    // bounded by `candidate_pool_per_source`, so one query per candidate here
    // stays cheap relative to the transition/frequency scans above.
    let feedback_scope = args.repo_key.clone().unwrap_or_else(|| Scope::Global.key());
    for c in candidates.values_mut() {
        if let Ok((accepts, dismisses)) = store.feedback_counts(feedback_scope.clone(), c.cmd_norm.clone()).await {
            c.feedback_accepts = accepts;
            c.feedback_dismisses = dismisses;
        }
    }

    Ok(candidates.into_values().collect())
}

/// Derives frequency and transition signals from a session's in-memory
/// overlay the same way the Store-backed sources do, scoped to session rank
/// (`frequency_scope_rank = 0`) since the overlay only ever holds this
/// session's own history.
fn apply_ephemeral_overlay(
    candidates: &mut HashMap<String, Candidate>,
    events: &[CommandEvent],
    prev_norm: &Option<String>,
) {
    if events.is_empty() {
        return;
    }

    let mut frequency: HashMap<&str, (u64, u64, i64)> = HashMap::new();
    for event in events {
        let entry = frequency.entry(event.cmd_norm.as_str()).or_insert((0, 0, 0));
        entry.0 += 1;
        if event.exit_code == 0 {
            entry.1 += 1;
        }
        entry.2 = entry.2.max(event.ts_ms);
    }
    for (cmd_norm, (count, success, last_ts)) in frequency {
        let c = Candidate::get_or_insert(candidates, cmd_norm);
        c.add_source(CandidateSource::Frequency);
        c.frequency_scope_rank = 0;
        c.frequency_count = c.frequency_count.max(count);
        c.frequency_success = c.frequency_success.max(success);
        c.last_ts = c.last_ts.max(last_ts);
    }

    let Some(prev) = prev_norm else { return };
    let mut transitions: HashMap<&str, (u64, i64)> = HashMap::new();
    let mut total = 0u64;
    for pair in events.windows(2) {
        if pair[0].cmd_norm != *prev {
            continue;
        }
        let entry = transitions.entry(pair[1].cmd_norm.as_str()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(pair[1].ts_ms);
        total += 1;
    }
    for (next_norm, (count, last_ts)) in transitions {
        let c = Candidate::get_or_insert(candidates, next_norm);
        c.add_source(CandidateSource::Transition);
        c.transition_count = c.transition_count.max(count);
        c.transition_total = c.transition_total.max(total);
        c.last_ts = c.last_ts.max(last_ts);
    }
}

fn candidate_scopes(session: Option<&SessionState>, repo_key: &Option<String>) -> Vec<String> {
    let mut scopes = Vec::new();
    if let Some(session) = session {
        if let Some(cwd_scope) = (!session.cwd.is_empty()).then(|| Scope::dir_for(&session.cwd, 1).key()) {
            scopes.push(cwd_scope);
        }
    }
    if let Some(repo_key) = repo_key {
        scopes.push(repo_key.clone());
    }
    scopes.push(Scope::Global.key());
    scopes
}

fn last_failed_norm(session: &SessionState) -> Option<String> {
    match session.last_exit_code {
        Some(code) if code != 0 => session.last_norm.clone(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_merges_across_sources() {
        let mut map: HashMap<String, Candidate> = HashMap::new();
        let c = Candidate::get_or_insert(&mut map, "git status");
        c.add_source(CandidateSource::Frequency);
        let c2 = Candidate::get_or_insert(&mut map, "git status");
        c2.add_source(CandidateSource::Transition);
        assert_eq!(map.len(), 1);
        assert_eq!(map["git status"].sources.len(), 2);
    }

    fn ephemeral_event(cmd_norm: &str, ts_ms: i64) -> CommandEvent {
        CommandEvent {
            event_id: format!("ev-{ts_ms}"),
            session_id: "s1".into(),
            command_id: format!("c-{ts_ms}"),
            ts_ms,
            cwd: "/tmp/proj".into(),
            repo_key: None,
            repo_root: None,
            branch: None,
            cmd_raw: cmd_norm.into(),
            cmd_norm: cmd_norm.into(),
            exit_code: 0,
            duration_ms: 10,
            tool: "git".into(),
            pipeline_segments: vec![],
            risk_tags: vec![],
            source_ingest_batch: 0,
            standalone_end: false,
        }
    }

    #[test]
    fn ephemeral_overlay_surfaces_transition_and_frequency() {
        let events = vec![
            ephemeral_event("git status", 1000),
            ephemeral_event("git add .", 1100),
            ephemeral_event("git status", 1200),
            ephemeral_event("git add .", 1300),
        ];
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        apply_ephemeral_overlay(&mut candidates, &events, &Some("git status".to_string()));

        let add = &candidates["git add ."];
        assert_eq!(add.transition_count, 2);
        assert_eq!(add.transition_total, 2);
        assert!(add.sources.contains(&CandidateSource::Transition));

        let status = &candidates["git status"];
        assert_eq!(status.frequency_count, 2);
        assert!(status.sources.contains(&CandidateSource::Frequency));
    }

    #[test]
    fn ephemeral_overlay_is_noop_on_empty_log() {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        apply_ephemeral_overlay(&mut candidates, &[], &None);
        assert!(candidates.is_empty());
    }
}
