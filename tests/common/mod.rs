#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};

use live_poll::auth::SessionAuthenticator;
use live_poll::broadcast::Broadcaster;
use live_poll::clock::ManualClock;
use live_poll::config::RateLimits;
use live_poll::models::{NewPoll, PollSnapshot, Session, User, UserId};
use live_poll::rate_limit::RateLimiter;
use live_poll::routes::{create_routes, AppState};
use live_poll::store::MemoryStore;
use live_poll::{PollService, ServiceSettings};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 7, 12, 0, 0).unwrap()
}

pub fn token_for(name: &str) -> String {
    format!("token-{name}")
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub broadcaster: Arc<Broadcaster>,
    pub service: Arc<PollService>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(ServiceSettings::default()).await
    }

    pub async fn with_settings(settings: ServiceSettings) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let broadcaster = Arc::new(Broadcaster::default());
        let service = Arc::new(PollService::new(
            Arc::new(store.clone()),
            broadcaster.clone(),
            clock.clone(),
            settings,
        ));
        Self {
            store,
            clock,
            broadcaster,
            service,
        }
    }

    /// Registers a user with a session token of `token-{name}`.
    pub async fn user(&self, name: &str) -> UserId {
        let user = User {
            id: UserId::new(),
            name: name.to_string(),
        };
        self.store.insert_user(user.clone()).await;
        self.store
            .insert_session(Session {
                token: token_for(name),
                user_id: user.id,
                expires_at: start() + Duration::days(30),
            })
            .await;
        user.id
    }

    pub fn draft(&self, title: &str, options: &[&str]) -> NewPoll {
        NewPoll {
            title: title.to_string(),
            description: None,
            expires_at: self.clock_now() + Duration::hours(1),
            options: options.iter().map(|text| text.to_string()).collect(),
        }
    }

    pub async fn poll(&self, owner: UserId, options: &[&str]) -> PollSnapshot {
        self.service
            .create_poll(owner, self.draft("Where should we eat?", options))
            .await
            .unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use live_poll::clock::Clock;
        self.clock.now()
    }

    pub fn app(&self) -> Router {
        self.app_with_limits(RateLimits::default())
    }

    pub fn app_with_limits(&self, limits: RateLimits) -> Router {
        create_routes(AppState {
            service: self.service.clone(),
            authenticator: Arc::new(SessionAuthenticator::new(
                Arc::new(self.store.clone()),
                self.clock.clone(),
            )),
            broadcaster: self.broadcaster.clone(),
            rate_limiter: Arc::new(RateLimiter::new(limits)),
        })
    }

    /// Asserts every counter equals the number of vote rows pointing at it.
    pub async fn assert_counters_match(&self) {
        for (option, rows) in self.store.counter_audit().await {
            assert_eq!(
                option.votes_count, rows,
                "option {} ({}) drifted",
                option.id, option.text
            );
        }
    }
}
