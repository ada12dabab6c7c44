//! Authorized fan-out of committed mutations.
//!
//! ```text
//! publish(project) ──► ProjectDirectory ──► {creator, admins, members}
//!                                                 │
//!                        ConnectionRegistry ◄─────┘ per user snapshot
//!                                │
//!                   send to each connection; failure ⇒ evict + close
//! ```
//!
//! Delivery is best-effort and at most once per connection. A failed send
//! never stops delivery to the remaining connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::{ProjectAuthSet, ProjectDirectory};
use crate::error::BoardResult;
use crate::model::ProjectId;
use crate::protocol::{Event, EventType};
use crate::registry::ConnectionRegistry;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub messages_delivered: u64,
    pub connections_evicted: u64,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Lock-free counters, read via [`BroadcastHub::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    messages_delivered: AtomicU64,
    connections_evicted: AtomicU64,
}

/// Resolves a project's audience and pushes events to its live connections.
pub struct BroadcastHub {
    directory: Arc<dyn ProjectDirectory>,
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(directory: Arc<dyn ProjectDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            directory,
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver an event to every live connection of every user authorized on
    /// `project_id`. Membership is looked up fresh on every call.
    ///
    /// Errors only when the audience cannot be resolved.
    pub async fn publish(
        &self,
        project_id: ProjectId,
        event_type: EventType,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> BoardResult<PublishReport> {
        let audience = self.directory.resolve_project_members(project_id)?;
        Ok(self
            .publish_to(&audience, Event::new(event_type, message, payload))
            .await)
    }

    /// Deliver to an already-resolved audience, e.g. the members of a
    /// project that no longer exists.
    pub async fn publish_to(&self, audience: &ProjectAuthSet, event: Event) -> PublishReport {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        let mut report = PublishReport::default();

        for user in audience.user_ids() {
            for conn in self.registry.connections_for(user).await {
                match conn.send(&event).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        log::warn!(
                            "Evicting connection {} of user {user}: {e}",
                            conn.id()
                        );
                        self.registry.deregister(conn.id(), user).await;
                        conn.close().await;
                        report.evicted += 1;
                    }
                }
            }
        }

        self.stats
            .messages_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .connections_evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        log::trace!(
            "Published {:?}: {} delivered, {} evicted",
            event.event_type,
            report.delivered,
            report.evicted
        );
        report
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            connections_evicted: self.stats.connections_evicted.load(Ordering::Relaxed),
        }
    }
}
