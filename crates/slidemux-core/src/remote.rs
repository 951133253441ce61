//! Remote tile-server session adapter.
//!
//! The only component that talks to a shard over the network. Two operations
//! exist: fetching a shard's authoritative live-session listing, and asking
//! shards to terminate a set of sessions so they free the backing memory.
//!
//! Listing failures are surfaced as errors so a synchronization pass aborts
//! instead of treating stale local data as fresh. Resets are best-effort and
//! independent per session: one failed termination never stops the rest, and
//! the shard's own idle policy is the backstop for anything left behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{RemoteError, Result};
use crate::session::{RemoteSession, SessionData, TileServerShard};

/// Boxed future returned by remote operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Network boundary to the stateful tile-server shards.
pub trait RemoteSessionHandler: Send + Sync {
    /// Fetch the shard's live session listing.
    ///
    /// Transport and non-success responses are returned as errors, never as
    /// a silently empty list.
    fn get_sessions(&self, shard: &TileServerShard) -> RemoteFuture<'_, Vec<RemoteSession>>;

    /// Ask the owning shards to terminate the given sessions.
    ///
    /// Each reset is attempted independently; failures are logged with the
    /// session id and collected into the report.
    fn reset_sessions(&self, sessions: Vec<SessionData>) -> RemoteFuture<'_, ResetReport>;
}

/// Shared handle to a remote session handler.
pub type RemoteHandle = Arc<dyn RemoteSessionHandler>;

/// Accounting for one reset fan-out.
#[derive(Debug, Clone, Default)]
pub struct ResetReport {
    /// Resets issued.
    pub attempted: usize,
    /// Resets that failed.
    pub failed: usize,
    /// Session ids whose reset failed.
    pub failed_session_ids: Vec<String>,
}

impl ResetReport {
    /// Resets that completed.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }

    /// Whether every reset completed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// URL of a shard's session-listing endpoint.
fn sessions_url(shard: &TileServerShard) -> String {
    format!("{}/api/v1/sessions", shard.base_url.trim_end_matches('/'))
}

/// URL of the termination endpoint for one session id.
fn reset_url(shard: &TileServerShard, session_id: &str) -> String {
    format!(
        "{}/api/v1/sessions/{}",
        shard.base_url.trim_end_matches('/'),
        session_id
    )
}

/// HTTP implementation of [`RemoteSessionHandler`].
#[derive(Debug, Clone)]
pub struct HttpSessionHandler {
    client: reqwest::Client,
}

impl HttpSessionHandler {
    /// Build a handler with the given per-request timeout.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(RemoteError::Transport)?;
        Ok(Self { client })
    }
}

impl RemoteSessionHandler for HttpSessionHandler {
    fn get_sessions(&self, shard: &TileServerShard) -> RemoteFuture<'_, Vec<RemoteSession>> {
        let url = sessions_url(shard);
        let shard_label = shard.label.clone();
        Box::pin(async move {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(RemoteError::Transport)?;

            let status = response.status();
            if !status.is_success() {
                return Err(RemoteError::Status {
                    url,
                    status: status.as_u16(),
                }
                .into());
            }

            let sessions = response
                .json::<Vec<RemoteSession>>()
                .await
                .map_err(|source| RemoteError::Decode { url, source })?;
            debug!(
                shard = %shard_label,
                live = sessions.len(),
                "fetched remote session listing"
            );
            Ok(sessions)
        })
    }

    fn reset_sessions(&self, sessions: Vec<SessionData>) -> RemoteFuture<'_, ResetReport> {
        Box::pin(async move {
            let attempted = sessions.len();
            let resets = sessions.iter().map(|session| {
                let url = reset_url(&session.tile_server_shard, &session.image_session_id);
                let client = self.client.clone();
                let session_id = session.image_session_id.clone();
                let shard_label = session.tile_server_shard.label.clone();
                async move {
                    let outcome = client
                        .delete(&url)
                        .send()
                        .await
                        .and_then(reqwest::Response::error_for_status);
                    match outcome {
                        Ok(_) => {
                            debug!(
                                session_id = %session_id,
                                shard = %shard_label,
                                "reset remote session"
                            );
                            None
                        }
                        Err(err) => {
                            warn!(
                                session_id = %session_id,
                                shard = %shard_label,
                                error = %err,
                                "failed to reset remote session"
                            );
                            Some(session_id)
                        }
                    }
                }
            });

            let failed_session_ids: Vec<String> =
                join_all(resets).await.into_iter().flatten().collect();
            Ok(ResetReport {
                attempted,
                failed: failed_session_ids.len(),
                failed_session_ids,
            })
        })
    }
}
