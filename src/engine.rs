//! Psychology engine: turns stored sessions and events into cognitive metrics.
//!
//! The server only talks to the [`PsychologyEngine`] trait. [`HeuristicEngine`]
//! is the deterministic scorer shipped with the service.

use std::collections::{BTreeMap, HashMap};

use crate::models::{
    Archetype, ComparativeInsights, Event, Match, MetricComparison, Profile, Recommendation,
    Session, SessionMetrics, VisualEdge, VisualNode, Visualization,
};

/// Event types that count as revising an earlier choice.
const REVISION_EVENTS: &[&str] = &["undo", "revise", "backtrack", "reset"];

pub trait PsychologyEngine: Send + Sync {
    /// Derive metrics for one session from its events and final state.
    fn score_session(
        &self,
        session: &Session,
        events: &[Event],
        final_state: &serde_json::Value,
    ) -> SessionMetrics;

    /// Label a user from their completed-session history. `None` when empty.
    fn assign_archetype(&self, history: &[SessionMetrics]) -> Option<Archetype>;

    /// Compare a user's averages against a population of sessions.
    fn comparative(
        &self,
        user_id: &str,
        history: &[SessionMetrics],
        population: &[SessionMetrics],
        archetype: Option<Archetype>,
    ) -> ComparativeInsights;

    fn visualize(&self, session: &Session, events: &[Event]) -> Visualization;

    /// Rank candidate profiles by similarity to `target`, excluding itself.
    fn matches(&self, target: &Profile, candidates: &[Profile], limit: usize) -> Vec<Match>;

    fn recommend(&self, user_id: &str, history: &[Session], catalog: &[String]) -> Recommendation;
}

#[derive(Debug, Clone)]
pub struct HeuristicEngine {
    /// Mean seconds between events above which play counts as deliberate
    pub deliberate_interval_secs: f64,
    /// Revision ratio above which play counts as perfectionist
    pub revision_threshold: f64,
    /// Distinct event types per session above which play counts as exploratory
    pub exploration_threshold: f64,
}

impl Default for HeuristicEngine {
    fn default() -> Self {
        Self {
            deliberate_interval_secs: 5.0,
            revision_threshold: 0.25,
            exploration_threshold: 5.0,
        }
    }
}

impl HeuristicEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn compare(user: f64, population: &[f64]) -> MetricComparison {
    if population.is_empty() {
        return MetricComparison {
            user,
            population: 0.0,
            percentile: 0.0,
        };
    }
    let at_or_below = population.iter().filter(|&&p| p <= user).count();
    MetricComparison {
        user,
        population: mean(population.iter().copied()),
        percentile: at_or_below as f64 / population.len() as f64,
    }
}

impl PsychologyEngine for HeuristicEngine {
    fn score_session(
        &self,
        session: &Session,
        events: &[Event],
        final_state: &serde_json::Value,
    ) -> SessionMetrics {
        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let duration_secs = ordered
            .last()
            .map(|last| (last.timestamp - session.started_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
            .max(0.0);

        let mean_interval_secs = mean(
            ordered
                .windows(2)
                .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0),
        );

        let mut types: Vec<&str> = ordered.iter().map(|e| e.event_type.as_str()).collect();
        types.sort_unstable();
        types.dedup();

        let revisions = ordered
            .iter()
            .filter(|e| REVISION_EVENTS.contains(&e.event_type.as_str()))
            .count();
        let revision_ratio = if ordered.is_empty() {
            0.0
        } else {
            revisions as f64 / ordered.len() as f64
        };

        SessionMetrics {
            event_count: ordered.len() as u64,
            duration_secs,
            mean_interval_secs,
            distinct_event_types: types.len() as u64,
            revision_ratio,
            score: final_state.get("score").and_then(|v| v.as_f64()),
        }
    }

    fn assign_archetype(&self, history: &[SessionMetrics]) -> Option<Archetype> {
        if history.is_empty() {
            return None;
        }
        let revision = mean(history.iter().map(|m| m.revision_ratio));
        let interval = mean(history.iter().map(|m| m.mean_interval_secs));
        let distinct = mean(history.iter().map(|m| m.distinct_event_types as f64));

        let archetype = if revision >= self.revision_threshold {
            Archetype::Perfectionist
        } else if interval >= self.deliberate_interval_secs {
            Archetype::Analyst
        } else if distinct >= self.exploration_threshold {
            Archetype::Explorer
        } else {
            Archetype::Intuitive
        };
        Some(archetype)
    }

    fn comparative(
        &self,
        user_id: &str,
        history: &[SessionMetrics],
        population: &[SessionMetrics],
        archetype: Option<Archetype>,
    ) -> ComparativeInsights {
        let pop_duration: Vec<f64> = population.iter().map(|m| m.duration_secs).collect();
        let pop_pace: Vec<f64> = population.iter().map(|m| m.mean_interval_secs).collect();
        let pop_revision: Vec<f64> = population.iter().map(|m| m.revision_ratio).collect();
        let pop_score: Vec<f64> = population.iter().filter_map(|m| m.score).collect();

        let user_scores: Vec<f64> = history.iter().filter_map(|m| m.score).collect();
        let score = if user_scores.is_empty() {
            None
        } else {
            Some(compare(mean(user_scores.into_iter()), &pop_score))
        };

        ComparativeInsights {
            user_id: user_id.to_string(),
            archetype,
            sessions_completed: history.len() as u64,
            population_size: population.len() as u64,
            duration: compare(mean(history.iter().map(|m| m.duration_secs)), &pop_duration),
            pace: compare(mean(history.iter().map(|m| m.mean_interval_secs)), &pop_pace),
            revision: compare(mean(history.iter().map(|m| m.revision_ratio)), &pop_revision),
            score,
        }
    }

    fn visualize(&self, session: &Session, events: &[Event]) -> Visualization {
        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by_key(|e| e.timestamp);

        let mut node_counts: BTreeMap<&str, u64> = BTreeMap::new();
        for event in &ordered {
            *node_counts.entry(event.event_type.as_str()).or_default() += 1;
        }
        let mut edge_counts: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for pair in ordered.windows(2) {
            let key = (pair[0].event_type.as_str(), pair[1].event_type.as_str());
            *edge_counts.entry(key).or_default() += 1;
        }

        let max_node = node_counts.values().copied().max().unwrap_or(1) as f64;
        let max_edge = edge_counts.values().copied().max().unwrap_or(1) as f64;

        Visualization {
            session_id: session.session_id.clone(),
            puzzle_type: session.puzzle_type.clone(),
            nodes: node_counts
                .into_iter()
                .map(|(id, count)| VisualNode {
                    id: id.to_string(),
                    count,
                    weight: count as f64 / max_node,
                })
                .collect(),
            edges: edge_counts
                .into_iter()
                .map(|((from, to), count)| VisualEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    count,
                    weight: count as f64 / max_edge,
                })
                .collect(),
        }
    }

    fn matches(&self, target: &Profile, candidates: &[Profile], limit: usize) -> Vec<Match> {
        let mut ranked: Vec<Match> = candidates
            .iter()
            .filter(|c| c.user_id != target.user_id)
            .map(|c| {
                let mut similarity = 0.0;
                if target.archetype.is_some() && c.archetype == target.archetype {
                    similarity += 0.6;
                }
                let prefs = (&target.preferences, &c.preferences);
                if prefs.0.difficulty == prefs.1.difficulty {
                    similarity += 0.2;
                }
                if prefs.0.hints == prefs.1.hints {
                    similarity += 0.1;
                }
                if prefs.0.theme == prefs.1.theme {
                    similarity += 0.1;
                }
                Match {
                    user_id: c.user_id.clone(),
                    archetype: c.archetype,
                    similarity,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        ranked.truncate(limit);
        ranked
    }

    fn recommend(&self, user_id: &str, history: &[Session], catalog: &[String]) -> Recommendation {
        let completed: Vec<&Session> = history.iter().filter(|s| s.is_completed()).collect();
        let scores: Vec<f64> = completed
            .iter()
            .filter_map(|s| s.metrics.as_ref().and_then(|m| m.score))
            .collect();

        let difficulty = if completed.is_empty() {
            "easy"
        } else if scores.is_empty() {
            "normal"
        } else {
            match mean(scores.iter().copied()) {
                s if s >= 80.0 => "hard",
                s if s < 40.0 => "easy",
                _ => "normal",
            }
        };

        let mut played: HashMap<&str, usize> = HashMap::new();
        for session in history {
            *played.entry(session.puzzle_type.as_str()).or_default() += 1;
        }

        // Least-played catalog entry, catalog order breaking ties.
        let choice = catalog
            .iter()
            .min_by_key(|p| played.get(p.as_str()).copied().unwrap_or(0))
            .cloned()
            .or_else(|| history.last().map(|s| s.puzzle_type.clone()))
            .unwrap_or_default();

        let reason = if history.is_empty() {
            "start with an introductory puzzle".to_string()
        } else {
            match played.get(choice.as_str()) {
                None | Some(0) => format!("you have not tried {} yet", choice),
                Some(n) => format!("{} is your least played puzzle ({} sessions)", choice, n),
            }
        };

        Recommendation {
            user_id: user_id.to_string(),
            puzzle_type: choice,
            difficulty: difficulty.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn session(id: &str, puzzle: &str) -> Session {
        Session {
            session_id: id.into(),
            user_id: "u1".into(),
            puzzle_type: puzzle.into(),
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            resolution: None,
            user_agent: None,
            status: SessionStatus::Active,
            completed_at: None,
            final_state: None,
            metrics: None,
        }
    }

    fn event_at(s: &Session, kind: &str, secs: i64) -> Event {
        Event {
            session_id: s.session_id.clone(),
            event_type: kind.into(),
            payload: json!({}),
            timestamp: s.started_at + Duration::seconds(secs),
        }
    }

    #[test]
    fn test_score_session() {
        let engine = HeuristicEngine::new();
        let s = session("s1", "ego_labyrinth");
        let events = vec![
            event_at(&s, "move", 2),
            event_at(&s, "move", 4),
            event_at(&s, "undo", 10),
            event_at(&s, "move", 12),
        ];
        let m = engine.score_session(&s, &events, &json!({"score": 42}));
        assert_eq!(m.event_count, 4);
        assert_eq!(m.duration_secs, 12.0);
        assert!((m.mean_interval_secs - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.distinct_event_types, 2);
        assert_eq!(m.revision_ratio, 0.25);
        assert_eq!(m.score, Some(42.0));
    }

    #[test]
    fn test_score_empty_session() {
        let engine = HeuristicEngine::new();
        let s = session("s1", "ego_labyrinth");
        let m = engine.score_session(&s, &[], &json!(null));
        assert_eq!(m, SessionMetrics::default());
    }

    #[test]
    fn test_assign_archetype() {
        let engine = HeuristicEngine::new();
        assert_eq!(engine.assign_archetype(&[]), None);

        let careful = SessionMetrics {
            revision_ratio: 0.4,
            ..Default::default()
        };
        assert_eq!(engine.assign_archetype(&[careful]), Some(Archetype::Perfectionist));

        let slow = SessionMetrics {
            mean_interval_secs: 9.0,
            ..Default::default()
        };
        assert_eq!(engine.assign_archetype(&[slow]), Some(Archetype::Analyst));

        let wide = SessionMetrics {
            distinct_event_types: 7,
            mean_interval_secs: 1.0,
            ..Default::default()
        };
        assert_eq!(engine.assign_archetype(&[wide]), Some(Archetype::Explorer));

        let quick = SessionMetrics {
            mean_interval_secs: 1.0,
            distinct_event_types: 2,
            ..Default::default()
        };
        assert_eq!(engine.assign_archetype(&[quick]), Some(Archetype::Intuitive));
    }

    #[test]
    fn test_comparative_percentiles() {
        let engine = HeuristicEngine::new();
        let with = |d: f64, score: f64| SessionMetrics {
            duration_secs: d,
            score: Some(score),
            ..Default::default()
        };
        let population = vec![with(10.0, 20.0), with(20.0, 40.0), with(30.0, 60.0), with(40.0, 80.0)];
        let insights = engine.comparative("u1", &[with(20.0, 60.0)], &population, None);

        assert_eq!(insights.sessions_completed, 1);
        assert_eq!(insights.population_size, 4);
        assert_eq!(insights.duration.population, 25.0);
        assert_eq!(insights.duration.percentile, 0.5);
        assert_eq!(insights.score.unwrap().percentile, 0.75);
    }

    #[test]
    fn test_comparative_empty_population() {
        let engine = HeuristicEngine::new();
        let insights = engine.comparative("u1", &[], &[], Some(Archetype::Analyst));
        assert_eq!(insights.population_size, 0);
        assert_eq!(insights.duration.percentile, 0.0);
        assert!(insights.score.is_none());
        assert_eq!(insights.archetype, Some(Archetype::Analyst));
    }

    #[test]
    fn test_visualize_transitions() {
        let engine = HeuristicEngine::new();
        let s = session("s1", "ego_labyrinth");
        let events = vec![
            event_at(&s, "move", 1),
            event_at(&s, "move", 2),
            event_at(&s, "hint", 3),
            event_at(&s, "move", 4),
        ];
        let viz = engine.visualize(&s, &events);
        assert_eq!(viz.nodes.len(), 2);
        let move_node = viz.nodes.iter().find(|n| n.id == "move").unwrap();
        assert_eq!(move_node.count, 3);
        assert_eq!(move_node.weight, 1.0);

        assert_eq!(viz.edges.len(), 3);
        assert!(viz.edges.iter().all(|e| e.count == 1 && e.weight == 1.0));
    }

    #[test]
    fn test_matches_ranked_and_exclude_self() {
        let engine = HeuristicEngine::new();
        let mut target = Profile::new("me");
        target.archetype = Some(Archetype::Explorer);

        let mut twin = Profile::new("twin");
        twin.archetype = Some(Archetype::Explorer);
        let mut other = Profile::new("other");
        other.archetype = Some(Archetype::Analyst);
        other.preferences.difficulty = "hard".into();

        let ranked = engine.matches(&target, &[other, target.clone(), twin], 5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].user_id, "twin");
        assert!((ranked[0].similarity - 1.0).abs() < 1e-9);
        assert_eq!(ranked[1].user_id, "other");

        assert_eq!(engine.matches(&target, &[Profile::new("x")], 0).len(), 0);
    }

    #[test]
    fn test_recommend_new_user() {
        let engine = HeuristicEngine::new();
        let catalog = vec!["ego_labyrinth".to_string(), "memory_maze".to_string()];
        let rec = engine.recommend("u1", &[], &catalog);
        assert_eq!(rec.puzzle_type, "ego_labyrinth");
        assert_eq!(rec.difficulty, "easy");
    }

    #[test]
    fn test_recommend_least_played() {
        let engine = HeuristicEngine::new();
        let catalog = vec!["ego_labyrinth".to_string(), "memory_maze".to_string()];
        let mut done = session("s1", "ego_labyrinth");
        done.status = SessionStatus::Completed;
        done.metrics = Some(SessionMetrics {
            score: Some(90.0),
            ..Default::default()
        });
        let rec = engine.recommend("u1", &[done], &catalog);
        assert_eq!(rec.puzzle_type, "memory_maze");
        assert_eq!(rec.difficulty, "hard");
        assert!(rec.reason.contains("not tried"));
    }
}
