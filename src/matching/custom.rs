//! External custom matchmaker client
//!
//! A queue may hand group formation to an HTTP function. The function gets
//! the queue parameters and the active pool, and answers with ticket id
//! groups. Its answer is never trusted: every group is re-checked against
//! the pool and the queue's bounds before it reaches the commit step.

use crate::error::{MatchmakingError, Result};
use crate::matching::formation::TicketGroup;
use crate::queue::{Criterion, CustomMatchmakerRef, Queue};
use crate::ticket::Ticket;
use crate::types::{AttributeSnapshot, GameId, PlayerId, TicketId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Queue parameters sent to the custom matchmaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueParameters {
    pub name: String,
    pub min_players: usize,
    pub max_players: usize,
    pub criteria: Vec<Criterion>,
}

/// One pool entry sent to the custom matchmaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTicket {
    pub ticket_id: TicketId,
    pub player_id: PlayerId,
    pub attributes: AttributeSnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMatchRequest {
    pub game_id: GameId,
    pub queue: QueueParameters,
    pub pool: Vec<PoolTicket>,
}

impl CustomMatchRequest {
    pub fn new(queue: &Queue, pool: &[Ticket]) -> Self {
        Self {
            game_id: queue.game_id.clone(),
            queue: QueueParameters {
                name: queue.name.clone(),
                min_players: queue.min_players,
                max_players: queue.max_players,
                criteria: queue.criteria.clone(),
            },
            pool: pool
                .iter()
                .map(|t| PoolTicket {
                    ticket_id: t.id,
                    player_id: t.player_id.clone(),
                    attributes: t.attributes.clone(),
                    created_at: t.created_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomMatchResponse {
    #[serde(default)]
    pub groups: Vec<Vec<TicketId>>,
}

/// Callable that replaces built-in group formation for a queue
#[async_trait]
pub trait CustomMatchmaker: Send + Sync {
    /// Ask for groups over `pool`; any failure or timeout is `ExternalMatchmakerFailure`
    async fn request_groups(
        &self,
        reference: &CustomMatchmakerRef,
        request: &CustomMatchRequest,
    ) -> Result<Vec<Vec<TicketId>>>;
}

/// JSON-over-HTTP custom matchmaker
pub struct HttpCustomMatchmaker {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpCustomMatchmaker {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| MatchmakingError::ConfigurationError {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            default_timeout,
        })
    }

    fn failure(reference: &CustomMatchmakerRef, reason: impl std::fmt::Display) -> anyhow::Error {
        MatchmakingError::ExternalMatchmakerFailure {
            reason: format!("{}: {}", reference.url, reason),
        }
        .into()
    }
}

#[async_trait]
impl CustomMatchmaker for HttpCustomMatchmaker {
    async fn request_groups(
        &self,
        reference: &CustomMatchmakerRef,
        request: &CustomMatchRequest,
    ) -> Result<Vec<Vec<TicketId>>> {
        let timeout = reference
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        debug!(
            url = %reference.url,
            queue = %request.queue.name,
            pool = request.pool.len(),
            "Calling custom matchmaker"
        );

        let response = self
            .client
            .post(&reference.url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::failure(reference, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::failure(reference, format!("HTTP {}", status)));
        }

        let body: CustomMatchResponse = response
            .json()
            .await
            .map_err(|e| Self::failure(reference, format!("malformed response: {}", e)))?;

        Ok(body.groups)
    }
}

/// Resolve returned id groups against the pool, dropping any group that is
/// out of bounds, names an unknown ticket, or reuses a ticket
///
/// Returns the valid groups and the number discarded.
pub fn validate_groups(
    queue: &Queue,
    pool: &[Ticket],
    groups: Vec<Vec<TicketId>>,
) -> (Vec<TicketGroup>, usize) {
    let by_id: HashMap<TicketId, &Ticket> = pool.iter().map(|t| (t.id, t)).collect();
    let mut used: HashSet<TicketId> = HashSet::new();
    let mut valid = Vec::new();
    let mut discarded = 0;

    for ids in groups {
        if ids.len() < queue.min_players || ids.len() > queue.max_players {
            warn!(
                queue = %queue.name,
                size = ids.len(),
                "Discarding custom group outside player bounds"
            );
            discarded += 1;
            continue;
        }

        let mut seen = HashSet::new();
        let resolved: Option<TicketGroup> = ids
            .iter()
            .map(|id| {
                if used.contains(id) || !seen.insert(*id) {
                    return None;
                }
                by_id.get(id).map(|t| (*t).clone())
            })
            .collect();

        match resolved {
            Some(group) => {
                used.extend(ids);
                valid.push(group);
            }
            None => {
                warn!(
                    queue = %queue.name,
                    "Discarding custom group with unknown or reused tickets"
                );
                discarded += 1;
            }
        }
    }

    (valid, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{error_kind, ErrorKind};
    use crate::queue::QueueDefinition;
    use crate::utils::generate_ticket_id;
    use axum::{routing::post, Json, Router};

    fn queue() -> Queue {
        QueueDefinition::new("custom", 2, 3)
            .into_queue("game", Utc::now())
            .unwrap()
    }

    fn pool(n: usize) -> Vec<Ticket> {
        (0..n)
            .map(|i| {
                Ticket::new(
                    generate_ticket_id(),
                    "game",
                    format!("p{}", i),
                    "custom",
                    AttributeSnapshot::new(),
                    Utc::now(),
                    chrono::Duration::minutes(5),
                )
            })
            .collect()
    }

    #[test]
    fn test_validate_groups_keeps_valid() {
        let q = queue();
        let pool = pool(4);
        let groups = vec![vec![pool[0].id, pool[1].id], vec![pool[2].id, pool[3].id]];

        let (valid, discarded) = validate_groups(&q, &pool, groups);
        assert_eq!(valid.len(), 2);
        assert_eq!(discarded, 0);
        assert_eq!(valid[1][0].player_id, "p2");
    }

    #[test]
    fn test_validate_groups_discards_bad_groups() {
        let q = queue();
        let pool = pool(5);
        let groups = vec![
            // too small
            vec![pool[0].id],
            // too large
            vec![pool[0].id, pool[1].id, pool[2].id, pool[3].id],
            // unknown ticket
            vec![pool[0].id, generate_ticket_id()],
            // duplicate within a group
            vec![pool[4].id, pool[4].id],
            vec![pool[0].id, pool[1].id],
            // reuses p1
            vec![pool[1].id, pool[2].id],
        ];

        let (valid, discarded) = validate_groups(&q, &pool, groups);
        assert_eq!(valid.len(), 1);
        assert_eq!(discarded, 5);
        assert_eq!(valid[0].len(), 2);
    }

    #[test]
    fn test_request_carries_pool_and_queue() {
        let q = queue();
        let pool = pool(2);
        let request = CustomMatchRequest::new(&q, &pool);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["game_id"], "game");
        assert_eq!(json["queue"]["max_players"], 3);
        assert_eq!(json["pool"].as_array().unwrap().len(), 2);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/match", addr)
    }

    #[tokio::test]
    async fn test_http_matchmaker_round_trip() {
        let router = Router::new().route(
            "/match",
            post(|Json(request): Json<CustomMatchRequest>| async move {
                let ids: Vec<TicketId> = request.pool.iter().map(|t| t.ticket_id).collect();
                Json(CustomMatchResponse { groups: vec![ids] })
            }),
        );
        let url = serve(router).await;

        let q = queue();
        let pool = pool(2);
        let matchmaker = HttpCustomMatchmaker::new(Duration::from_secs(2)).unwrap();
        let groups = matchmaker
            .request_groups(
                &CustomMatchmakerRef {
                    url,
                    timeout_ms: None,
                },
                &CustomMatchRequest::new(&q, &pool),
            )
            .await
            .unwrap();

        assert_eq!(groups, vec![vec![pool[0].id, pool[1].id]]);
    }

    #[tokio::test]
    async fn test_http_matchmaker_timeout_is_external_failure() {
        let router = Router::new().route(
            "/match",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(CustomMatchResponse::default())
            }),
        );
        let url = serve(router).await;

        let q = queue();
        let matchmaker = HttpCustomMatchmaker::new(Duration::from_secs(2)).unwrap();
        let err = matchmaker
            .request_groups(
                &CustomMatchmakerRef {
                    url,
                    timeout_ms: Some(100),
                },
                &CustomMatchRequest::new(&q, &pool(2)),
            )
            .await
            .unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::ExternalMatchmaker));
    }

    #[tokio::test]
    async fn test_http_matchmaker_error_status_is_external_failure() {
        let router = Router::new().route(
            "/match",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let url = serve(router).await;

        let matchmaker = HttpCustomMatchmaker::new(Duration::from_secs(2)).unwrap();
        let err = matchmaker
            .request_groups(
                &CustomMatchmakerRef {
                    url,
                    timeout_ms: None,
                },
                &CustomMatchRequest::new(&queue(), &pool(2)),
            )
            .await
            .unwrap_err();

        assert_eq!(error_kind(&err), Some(ErrorKind::ExternalMatchmaker));
    }
}
