//! Throttled re-fetching of cached profiles and discovery feeds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use rendezvous_store::{DiscoveryProfile, Profile};

use crate::error::Result;
use crate::remote::DiscoveryCard;
use crate::state::AppContext;

/// Whether data fetched at `last_fetched_at` is old enough to fetch again.
/// Strictly older than `throttle`; a clock that moved backwards never
/// triggers a fetch.
pub fn should_fetch(last_fetched_at: DateTime<Utc>, now: DateTime<Utc>, throttle: Duration) -> bool {
    match chrono::Duration::from_std(throttle) {
        Ok(throttle) => now.signed_duration_since(last_fetched_at) > throttle,
        Err(_) => false,
    }
}

/// Stale-while-revalidate cache of other users' profiles.
#[derive(Clone)]
pub struct ProfileCache {
    ctx: Arc<AppContext>,
}

impl ProfileCache {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Serve the cached profile if there is one.  When it is stale a refresh
    /// runs in the background; only a cache miss waits for the network.
    pub async fn get(&self, user_id: &str) -> Result<Profile> {
        let cached = self.ctx.with_db(|db| db.get_profile_by_user(user_id))?;
        let Some(profile) = cached else {
            return self.refresh(user_id).await;
        };

        let throttle = self.ctx.config().profile_throttle;
        if should_fetch(profile.last_fetched_at, Utc::now(), throttle) {
            self.revalidate(user_id);
        }
        Ok(profile)
    }

    /// Fetch now, ignoring the throttle.
    pub async fn refresh(&self, user_id: &str) -> Result<Profile> {
        let raw = self.ctx.remote().fetch_profile(user_id).await?;
        let now = Utc::now();
        let fetched = Profile {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            raw_data: raw.to_string(),
            last_fetched_at: now,
            created_at: now,
        };

        let stored = self.ctx.with_db(|db| {
            db.upsert_profile(&fetched)?;
            db.get_profile_by_user(user_id)
        })?;
        tracing::debug!(user_id, "profile fetched");
        Ok(stored.unwrap_or(fetched))
    }

    fn revalidate(&self, user_id: &str) {
        let cache = self.clone();
        let user_id = user_id.to_string();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(e) = cache.refresh(&user_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "profile revalidation failed");
            }
        });
    }
}

/// Discovery cards per place.
#[derive(Clone)]
pub struct DiscoveryFeed {
    ctx: Arc<AppContext>,
    // An empty feed leaves no rows to date it, so fetch times are kept here too.
    fetched: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl DiscoveryFeed {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            fetched: Arc::default(),
        }
    }

    /// Cached cards, re-fetched first when the cache is missing or stale.
    /// If the fetch fails and a cached feed exists, it is served instead.
    pub async fn load(&self, place_id: &str) -> Result<Vec<DiscoveryProfile>> {
        let stored = self.ctx.with_db(|db| db.discovery_fetched_at(place_id))?;
        let remembered = self
            .fetched
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(place_id)
            .copied();
        let last = stored.into_iter().chain(remembered).max();

        let throttle = self.ctx.config().profile_throttle;
        match last {
            Some(at) if !should_fetch(at, Utc::now(), throttle) => {
                self.ctx.with_db(|db| db.discovery_feed(place_id))
            }
            Some(_) => match self.refresh(place_id).await {
                Ok(cards) => Ok(cards),
                Err(e) => {
                    tracing::warn!(place_id, error = %e, "feed refresh failed, serving cache");
                    self.ctx.with_db(|db| db.discovery_feed(place_id))
                }
            },
            None => self.refresh(place_id).await,
        }
    }

    /// Fetch the feed now and replace the cached one.  Users already swiped
    /// on, queued, or the local user are left out.
    pub async fn refresh(&self, place_id: &str) -> Result<Vec<DiscoveryProfile>> {
        let response = self.ctx.remote().fetch_discovery(place_id).await?;
        let now = Utc::now();

        let mut excluded: HashSet<String> = self.ctx.acted_user_ids();
        excluded.insert(self.ctx.user_id().to_string());

        let cards = self.ctx.with_db(|db| {
            excluded.extend(db.queued_targets()?);
            let cards: Vec<DiscoveryProfile> = response
                .profiles
                .iter()
                .filter(|c| !excluded.contains(&c.user_id))
                .map(|c| to_card(c, place_id, now))
                .collect();
            db.write(|w| {
                w.replace_discovery_feed(place_id, &cards)?;
                w.replace_likers(&response.liker_ids, now)
            })?;
            db.discovery_feed(place_id)
        })?;

        self.fetched
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(place_id.to_string(), now);
        tracing::debug!(place_id, cards = cards.len(), "discovery feed fetched");
        Ok(cards)
    }

    /// Remove a card without swiping.
    pub fn dismiss(&self, user_id: &str) -> Result<bool> {
        Ok(self.ctx.with_db(|db| db.delete_discovery_for_user(user_id))? > 0)
    }
}

fn to_card(card: &DiscoveryCard, place_id: &str, now: DateTime<Utc>) -> DiscoveryProfile {
    DiscoveryProfile {
        id: Uuid::new_v4().to_string(),
        user_id: card.user_id.clone(),
        raw_data: card.profile.to_string(),
        place_id: place_id.to_string(),
        last_fetched_at: now,
        is_dismissed: false,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::remote::DiscoveryResponse;
    use crate::test_support::{test_context, FakeRemote};

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    #[test]
    fn throttle_boundary() {
        let t0 = Utc::now();
        assert!(!should_fetch(t0, t0 + ChronoDuration::minutes(4), FIVE_MINUTES));
        assert!(should_fetch(t0, t0 + ChronoDuration::minutes(6), FIVE_MINUTES));
        assert!(!should_fetch(t0, t0 + ChronoDuration::minutes(5), FIVE_MINUTES));
        assert!(!should_fetch(t0, t0 - ChronoDuration::minutes(10), FIVE_MINUTES));
    }

    #[tokio::test]
    async fn fresh_profile_is_served_from_cache() {
        let remote = FakeRemote::new();
        remote.set_profile("u1", serde_json::json!({ "display_name": "Ada", "age": 31 }));
        let cache = ProfileCache::new(test_context(remote.clone()));

        let first = cache.get("u1").await.unwrap();
        assert_eq!(first.data().unwrap().display_name.as_deref(), Some("Ada"));
        cache.get("u1").await.unwrap();
        assert_eq!(remote.profile_fetch_count(), 1);

        cache.refresh("u1").await.unwrap();
        assert_eq!(remote.profile_fetch_count(), 2);
    }

    #[tokio::test]
    async fn stale_profile_is_served_then_revalidated() {
        let remote = FakeRemote::new();
        remote.set_profile("u1", serde_json::json!({ "display_name": "New" }));
        let ctx = test_context(remote.clone());
        let old = Utc::now() - ChronoDuration::minutes(10);
        ctx.with_db(|db| {
            db.upsert_profile(&Profile {
                id: "p1".into(),
                user_id: "u1".into(),
                raw_data: r#"{"display_name":"Old"}"#.into(),
                last_fetched_at: old,
                created_at: old,
            })
        })
        .unwrap();

        let cache = ProfileCache::new(ctx.clone());
        let served = cache.get("u1").await.unwrap();
        assert_eq!(served.data().unwrap().display_name.as_deref(), Some("Old"));

        for _ in 0..50 {
            if remote.profile_fetch_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let now = ctx.with_db(|db| db.get_profile_by_user("u1")).unwrap().unwrap();
        assert_eq!(now.data().unwrap().display_name.as_deref(), Some("New"));
        assert_eq!(now.id, "p1");
    }

    #[tokio::test]
    async fn feed_excludes_acted_and_queued_users() {
        let remote = FakeRemote::new();
        let card = |id: &str| DiscoveryCard {
            user_id: id.into(),
            profile: serde_json::json!({ "display_name": id }),
        };
        remote.set_discovery(
            "P1",
            DiscoveryResponse {
                profiles: vec![card("a"), card("b"), card("c"), card("me")],
                liker_ids: vec!["c".into()],
            },
        );
        let ctx = test_context(remote.clone());
        ctx.mark_acted("a");
        crate::swipes::SwipeQueue::new(ctx.clone())
            .enqueue("b", rendezvous_shared::SwipeAction::Dislike, "P1", None)
            .unwrap();

        let feed = DiscoveryFeed::new(ctx.clone());
        let cards = feed.load("P1").await.unwrap();
        let users: Vec<_> = cards.iter().map(|c| c.user_id.as_str()).collect();
        assert_eq!(users, vec!["c"]);
        assert!(ctx.with_db(|db| db.is_liker("c")).unwrap());

        // Within the throttle: no second fetch.
        feed.load("P1").await.unwrap();
        assert_eq!(remote.discovery_fetch_count(), 1);

        assert!(feed.dismiss("c").unwrap());
        assert!(feed.load("P1").await.unwrap().is_empty());
        assert_eq!(remote.discovery_fetch_count(), 1);
    }
}
