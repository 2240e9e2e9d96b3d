//! Group formation over a queue's active pool
//!
//! The built-in strategy is a greedy anchor expansion: walk the pool oldest
//! first, and for each unplaced anchor take the best-scoring unplaced
//! candidates up to the queue's capacity. Anchors that cannot reach the
//! minimum stay queued so their range tolerance can widen by the next pass.

use crate::matching::scorer::score;
use crate::queue::Queue;
use crate::ticket::Ticket;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Tickets proposed to become one match, anchor first
pub type TicketGroup = Vec<Ticket>;

/// Strategy that turns a fairness-ordered pool into proposed groups
pub trait GroupFormer: Send + Sync {
    /// Proposed groups; no ticket may appear in more than one
    fn form_groups(&self, queue: &Queue, pool: &[Ticket], now: DateTime<Utc>) -> Vec<TicketGroup>;
}

/// Greedy anchor expansion using the compatibility scorer
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyGroupFormer;

impl GreedyGroupFormer {
    pub fn new() -> Self {
        Self
    }
}

impl GroupFormer for GreedyGroupFormer {
    fn form_groups(&self, queue: &Queue, pool: &[Ticket], now: DateTime<Utc>) -> Vec<TicketGroup> {
        if pool.len() < queue.min_players || queue.max_players == 0 {
            return Vec::new();
        }

        if queue.criteria.is_empty() {
            let size = queue.max_players.min(pool.len());
            return vec![pool[..size].to_vec()];
        }

        let mut placed = vec![false; pool.len()];
        let mut groups = Vec::new();

        for anchor_idx in 0..pool.len() {
            if placed[anchor_idx] {
                continue;
            }
            let anchor = &pool[anchor_idx];

            let mut candidates: Vec<(usize, f64)> = pool
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != anchor_idx && !placed[*idx])
                .map(|(idx, candidate)| {
                    let s = score(
                        &anchor.attributes,
                        &candidate.attributes,
                        &queue.criteria,
                        anchor.created_at,
                        now,
                    );
                    (idx, s)
                })
                .filter(|(_, s)| *s > 0.0)
                .collect();

            // stable sort keeps pool order among equal scores
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
            candidates.truncate(queue.max_players - 1);

            if 1 + candidates.len() < queue.min_players {
                debug!(
                    queue = %queue.name,
                    anchor = %anchor.id,
                    compatible = candidates.len(),
                    "Anchor cannot fill a group this pass"
                );
                continue;
            }

            placed[anchor_idx] = true;
            let mut group = Vec::with_capacity(1 + candidates.len());
            group.push(anchor.clone());
            for (idx, _) in candidates {
                placed[idx] = true;
                group.push(pool[idx].clone());
            }
            groups.push(group);
        }

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Criterion, QueueDefinition};
    use crate::types::AttributeSnapshot;
    use crate::utils::generate_ticket_id;
    use chrono::Duration;
    use serde_json::json;

    fn queue(min: usize, max: usize, criteria: Vec<Criterion>) -> Queue {
        QueueDefinition::new("q", min, max)
            .with_criteria(criteria)
            .into_queue("game", Utc::now())
            .unwrap()
    }

    fn ticket(player: &str, skill: Option<i64>, created_at: DateTime<Utc>) -> Ticket {
        let mut attributes = AttributeSnapshot::new();
        if let Some(skill) = skill {
            attributes.insert("skill".to_string(), json!(skill));
        }
        Ticket::new(
            generate_ticket_id(),
            "game",
            player,
            "q",
            attributes,
            created_at,
            Duration::minutes(30),
        )
    }

    fn players(group: &TicketGroup) -> Vec<&str> {
        group.iter().map(|t| t.player_id.as_str()).collect()
    }

    #[test]
    fn test_pool_below_minimum_yields_nothing() {
        let now = Utc::now();
        let q = queue(3, 4, vec![]);
        let pool = vec![ticket("a", None, now), ticket("b", None, now)];
        assert!(GreedyGroupFormer.form_groups(&q, &pool, now).is_empty());
    }

    #[test]
    fn test_criteria_less_queue_takes_oldest_in_order() {
        let now = Utc::now();
        let q = queue(2, 4, vec![]);
        let pool: Vec<Ticket> = ["A", "B", "C", "D"]
            .iter()
            .map(|p| ticket(p, None, now))
            .collect();

        let groups = GreedyGroupFormer.form_groups(&q, &pool, now);
        assert_eq!(groups.len(), 1);
        assert_eq!(players(&groups[0]), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_criteria_less_queue_caps_at_max() {
        let now = Utc::now();
        let q = queue(2, 3, vec![]);
        let pool: Vec<Ticket> = ["A", "B", "C", "D", "E"]
            .iter()
            .map(|p| ticket(p, None, now))
            .collect();

        let groups = GreedyGroupFormer.form_groups(&q, &pool, now);
        assert_eq!(groups.len(), 1);
        assert_eq!(players(&groups[0]), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_best_candidates_chosen_first() {
        let now = Utc::now();
        let q = queue(2, 2, vec![Criterion::range("skill", 50.0)]);
        let pool = vec![
            ticket("anchor", Some(100), now),
            ticket("far", Some(140), now),
            ticket("near", Some(105), now),
        ];

        let groups = GreedyGroupFormer.form_groups(&q, &pool, now);
        assert_eq!(groups.len(), 1);
        assert_eq!(players(&groups[0]), vec!["anchor", "near"]);
    }

    #[test]
    fn test_multiple_groups_in_one_pass() {
        let now = Utc::now();
        let q = queue(2, 2, vec![Criterion::range("skill", 10.0)]);
        let pool = vec![
            ticket("a", Some(100), now),
            ticket("x", Some(500), now),
            ticket("b", Some(102), now),
            ticket("y", Some(505), now),
        ];

        let groups = GreedyGroupFormer.form_groups(&q, &pool, now);
        assert_eq!(groups.len(), 2);
        assert_eq!(players(&groups[0]), vec!["a", "b"]);
        assert_eq!(players(&groups[1]), vec!["x", "y"]);
    }

    #[test]
    fn test_incompatible_tickets_stay_unplaced() {
        let start = Utc::now();
        let q = queue(2, 2, vec![Criterion::range("skill", 10.0)]);
        let pool = vec![ticket("a", Some(100), start), ticket("b", Some(140), start)];

        for minutes in [0, 5, 10] {
            let now = start + Duration::minutes(minutes);
            assert!(GreedyGroupFormer.form_groups(&q, &pool, now).is_empty());
        }
    }

    #[test]
    fn test_group_sizes_within_bounds() {
        let now = Utc::now();
        let q = queue(2, 3, vec![Criterion::range("skill", 1000.0)]);
        let pool: Vec<Ticket> = (0..10)
            .map(|i| ticket(&format!("p{}", i), Some(i * 10), now))
            .collect();

        let groups = GreedyGroupFormer.form_groups(&q, &pool, now);
        assert!(!groups.is_empty());
        let mut seen = std::collections::HashSet::new();
        for group in &groups {
            assert!(group.len() >= 2 && group.len() <= 3);
            for t in group {
                assert!(seen.insert(t.id), "ticket placed twice");
            }
        }
    }
}
