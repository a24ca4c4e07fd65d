//! Matchmaking engine for pool-based activities
//!
//! A pass snapshots the waiting pool of one locale, plans groups without
//! holding any lock, then commits the plan under the locale lock. The commit
//! re-validates every candidate, so a plan made from a stale snapshot can
//! shrink but never double-assigns a session.

use crate::activity::{ActivityConfiguration, ActivityProvider};
use crate::bus::RoomEventBus;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::pool::{LocalePool, PoolEntry, WaitingPools};
use crate::relay::PresenceRelay;
use crate::room::{RoomDirectory, RoomSnapshot};
use crate::session::SessionRegistry;
use crate::types::{BusMessage, Member, RoomKind, RoomMutation, SessionId};
use crate::utils::{generate_room_id, room_key};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A group selected by the planner, not yet committed
#[derive(Debug, Clone)]
pub struct PlannedGroup {
    pub activity: ActivityConfiguration,
    pub members: Vec<PoolEntry>,
}

/// A room formed by a pass
#[derive(Debug, Clone)]
pub struct FormedRoom {
    pub room: RoomSnapshot,
    pub min_players: usize,
}

/// Result of one matchmaking pass
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub rooms: Vec<FormedRoom>,
    /// A group was abandoned at commit time and another pass should run
    pub needs_retry: bool,
}

/// Group a pool snapshot into rooms
///
/// Every entry is expanded into each activity bucket it is eligible for, the
/// bucket order is shuffled, and each bucket is sliced greedily into groups of
/// the activity maximum. A session lands in at most one group; slices below
/// the activity minimum are left waiting.
pub fn plan_groups<R: Rng + ?Sized>(
    entries: &[PoolEntry],
    provider: &dyn ActivityProvider,
    rng: &mut R,
) -> Vec<PlannedGroup> {
    let mut buckets: BTreeMap<&str, Vec<&PoolEntry>> = BTreeMap::new();
    for entry in entries {
        let mut seen = HashSet::new();
        for activity in &entry.activities {
            if seen.insert(activity.as_str()) {
                buckets.entry(activity.as_str()).or_default().push(entry);
            }
        }
    }

    let mut order: Vec<&str> = buckets.keys().copied().collect();
    order.shuffle(rng);

    let mut consumed: HashSet<&str> = HashSet::new();
    let mut groups = Vec::new();

    for name in order {
        let Some(activity) = provider.get_activity(name) else {
            debug!("Skipping unknown activity bucket '{}'", name);
            continue;
        };
        let bounds = activity.bounds();

        let remaining: Vec<&PoolEntry> = buckets[name]
            .iter()
            .copied()
            .filter(|entry| !consumed.contains(entry.session_id.as_str()))
            .collect();
        if remaining.len() < bounds.min {
            continue;
        }

        for slice in remaining.chunks(bounds.max.max(1)) {
            if slice.len() < bounds.min {
                break;
            }
            for entry in slice {
                consumed.insert(entry.session_id.as_str());
            }
            groups.push(PlannedGroup {
                activity: activity.clone(),
                members: slice.iter().map(|entry| (*entry).clone()).collect(),
            });
        }
    }

    groups
}

/// Runs matchmaking passes and commits their rooms
pub struct MatchmakingEngine {
    pools: Arc<WaitingPools>,
    registry: Arc<SessionRegistry>,
    directory: Arc<RoomDirectory>,
    activity_provider: Arc<dyn ActivityProvider>,
    relay: PresenceRelay,
    bus: Arc<dyn RoomEventBus>,
    metrics_collector: Arc<MetricsCollector>,
}

impl MatchmakingEngine {
    pub fn new(
        pools: Arc<WaitingPools>,
        registry: Arc<SessionRegistry>,
        directory: Arc<RoomDirectory>,
        activity_provider: Arc<dyn ActivityProvider>,
        relay: PresenceRelay,
        bus: Arc<dyn RoomEventBus>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pools,
            registry,
            directory,
            activity_provider,
            relay,
            bus,
            metrics_collector,
        }
    }

    /// Group the waiting sessions of `locale` into rooms
    ///
    /// Idempotent on an unchanged pool: once everything that can be grouped
    /// has been, further passes form nothing.
    pub async fn run_matching_pass(&self, locale: &str) -> Result<PassOutcome> {
        let timer = self.metrics_collector.start_timer();

        let snapshot = self.pools.snapshot(locale)?;
        let groups = {
            let mut rng = rand::rng();
            plan_groups(&snapshot, self.activity_provider.as_ref(), &mut rng)
        };

        let outcome = if groups.is_empty() {
            PassOutcome::default()
        } else {
            self.pools
                .with_pool(locale, |pool| self.commit_groups(locale, pool, groups))?
        };

        for formed in &outcome.rooms {
            self.announce(formed).await;
        }

        self.metrics_collector.record_matching_pass(
            outcome.rooms.len(),
            outcome.needs_retry,
            timer.stop(),
        );
        if !outcome.rooms.is_empty() {
            info!(
                "Matching pass for '{}' formed {} rooms from {} waiting sessions",
                locale,
                outcome.rooms.len(),
                snapshot.len()
            );
        }
        Ok(outcome)
    }

    /// Commit planned groups while holding the locale pool lock
    fn commit_groups(
        &self,
        locale: &str,
        pool: &mut LocalePool,
        groups: Vec<PlannedGroup>,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        for group in groups {
            let bounds = group.activity.bounds();
            let key = room_key(locale, &group.activity.name, &generate_room_id());

            let mut claimed: Vec<&PoolEntry> = Vec::with_capacity(group.members.len());
            for entry in &group.members {
                if !pool.holds(&entry.session_id, entry.ticket) {
                    continue;
                }
                if self
                    .registry
                    .assign_matched_room(&entry.session_id, locale, &key)
                {
                    claimed.push(entry);
                } else {
                    // Pooled but no longer waiting here: the entry is stale
                    debug!("Dropping stale pool entry for {}", entry.session_id);
                    pool.remove(&entry.session_id);
                }
            }

            if claimed.len() < bounds.min {
                debug!(
                    "Abandoning '{}' group in '{}': {} of {} candidates still waiting",
                    group.activity.name,
                    locale,
                    claimed.len(),
                    group.members.len()
                );
                self.release(locale, &key, &claimed);
                self.metrics_collector.record_group_abandoned();
                outcome.needs_retry = true;
                continue;
            }

            let members: Vec<Member> = claimed
                .iter()
                .map(|entry| Member {
                    id: entry.session_id.clone(),
                    name: entry.display_name.clone(),
                })
                .collect();

            match self.directory.register_matched(
                &key,
                &group.activity.name,
                bounds,
                group.activity.media,
                members,
            ) {
                Ok(room) => {
                    for entry in &claimed {
                        pool.remove(&entry.session_id);
                    }
                    outcome.rooms.push(FormedRoom {
                        room,
                        min_players: bounds.min,
                    });
                }
                Err(e) => {
                    warn!("Failed to register matched room {}: {}", key, e);
                    self.release(locale, &key, &claimed);
                    outcome.needs_retry = true;
                }
            }
        }

        outcome
    }

    /// Put claimed sessions back into the waiting state
    ///
    /// A session that left `key` for another room since it was claimed keeps
    /// that room.
    fn release(&self, locale: &str, key: &str, claimed: &[&PoolEntry]) {
        for entry in claimed {
            if !self
                .registry
                .revert_matched(&entry.session_id, locale, key)
            {
                debug!(
                    "Session {} moved on from {} before release",
                    entry.session_id, key
                );
            }
        }
    }

    /// Tell members and peers about a committed room
    ///
    /// Members who already left since the commit are skipped, so a peer never
    /// sees their join after their leave.
    async fn announce(&self, formed: &FormedRoom) {
        self.metrics_collector
            .record_room_created(RoomKind::Matched, formed.room.members.len());
        self.metrics_collector
            .record_sessions_matched(&formed.room.activity, formed.room.members.len());

        let Some(current) = self.directory.get(&formed.room.key) else {
            debug!("Room {} emptied before it was announced", formed.room.key);
            return;
        };
        let room = &current;

        self.relay.announce_matched(room, formed.min_players).await;

        for member in &room.members {
            let mutation = RoomMutation::MemberJoined {
                room_key: room.key.clone(),
                activity: room.activity.clone(),
                room_kind: RoomKind::Matched,
                bounds: room.bounds,
                media: room.media,
                member: member.clone(),
            };
            if let Err(e) = self.bus.publish(BusMessage::Mutation(mutation)).await {
                warn!("Failed to publish match of {} into {}: {}", member.id, room.key, e);
            }
        }

        let ids: Vec<&SessionId> = room.members.iter().map(|m| &m.id).collect();
        info!(
            "Matched room {} ({}) with {} members: {:?}",
            room.key,
            room.activity,
            room.members.len(),
            ids
        );
    }
}
