// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron trigger.
//!
//! One timer task per subscription. Every replica runs the timers; with a
//! [`JobReducer`] a tick fires on one replica only, keyed by target and tick
//! time. Schedule events carry no payload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use fnhost_core::{EventQueue, JobReducer};
use fnhost_protocol::messages::{Event, EventType, Target};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Completions, Enqueuer, EnqueuerContext, Outcome, Trigger, enqueue_event};
use crate::error::EnqueuerError;

/// Parse a 5-field (minute first) or 6-field (second first) expression and
/// an IANA timezone. Day of week follows crontab: 0 and 7 are Sunday.
pub fn parse_schedule(cron: &str, timezone: &str) -> Result<(Cron, Tz), String> {
    let fields = cron.split_whitespace().count();
    if !(5..=6).contains(&fields) {
        return Err(format!("cron expression must have 5 or 6 fields, got {}", fields));
    }
    let schedule = Cron::new(cron)
        .with_seconds_optional()
        .parse()
        .map_err(|e| format!("invalid cron '{}': {}", cron, e))?;
    let tz = timezone
        .parse::<Tz>()
        .map_err(|_| format!("unknown timezone '{}'", timezone))?;
    Ok((schedule, tz))
}

/// First tick strictly after `after`, evaluated in `tz`.
pub fn next_tick(schedule: &Cron, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .find_next_occurrence(&after.with_timezone(&tz), false)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

struct Shared {
    event_queue: Arc<EventQueue>,
    job_reducer: Option<Arc<JobReducer>>,
    completions: Completions,
}

impl Shared {
    fn fire(self: &Arc<Self>, target: &Target, tick: DateTime<Utc>) {
        let target = target.clone();
        let Some(reducer) = self.job_reducer.clone() else {
            self.enqueue(&target);
            return;
        };

        let shared = self.clone();
        tokio::spawn(async move {
            let meta = json!({
                "trigger": "schedule",
                "target": target.id,
                "handler": target.handler,
                "tick": tick.to_rfc3339(),
            });
            let Some(claim) = reducer.try_claim(&meta).await else {
                debug!(target = %target.id, tick = %tick, "Tick handled by another replica");
                return;
            };
            let _ = shared.enqueue(&target).await;
            claim.finish().await;
        });
    }

    fn enqueue(&self, target: &Target) -> tokio::sync::oneshot::Receiver<Outcome> {
        let id = uuid::Uuid::new_v4().to_string();
        let outcome = self.completions.register(&id);
        enqueue_event(&self.event_queue, EventType::Schedule, &id, target);
        outcome
    }
}

pub struct ScheduleEnqueuer {
    shared: Arc<Shared>,
    timers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl ScheduleEnqueuer {
    pub fn new(event_queue: Arc<EventQueue>, job_reducer: Option<Arc<JobReducer>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                event_queue,
                job_reducer,
                completions: Completions::new(),
            }),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(ctx: &EnqueuerContext) -> Arc<dyn Enqueuer> {
        Arc::new(Self::new(ctx.event_queue.clone(), ctx.job_reducer.clone()))
    }
}

#[async_trait]
impl Enqueuer for ScheduleEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Schedule
    }

    async fn subscribe(&self, target: Target, trigger: Trigger) -> Result<(), EnqueuerError> {
        let kind = trigger.kind();
        let Trigger::Schedule { cron, timezone } = trigger else {
            return Err(EnqueuerError::Unsupported(kind));
        };
        let (schedule, tz) =
            parse_schedule(&cron, &timezone).map_err(|reason| EnqueuerError::InvalidTrigger {
                target: target.id.clone(),
                reason,
            })?;

        info!(
            target = %target.id,
            cron = %cron,
            timezone = %timezone,
            next = ?next_tick(&schedule, tz, Utc::now()),
            "Schedule bound"
        );

        let shared = self.shared.clone();
        let timer_target = target.clone();
        let timer = tokio::spawn(async move {
            let mut last = Utc::now();
            while let Some(tick) = next_tick(&schedule, tz, last) {
                let wait = (tick - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                debug!(target = %timer_target.id, tick = %tick, "Schedule tick");
                shared.fire(&timer_target, tick);
                last = tick;
            }
            warn!(target = %timer_target.id, "Schedule has no further ticks");
        });

        self.timers
            .lock()
            .await
            .entry(target.id)
            .or_default()
            .push(timer);
        Ok(())
    }

    async fn unsubscribe(&self, target_id: &str) -> bool {
        match self.timers.lock().await.remove(target_id) {
            Some(timers) => {
                timers.iter().for_each(JoinHandle::abort);
                true
            }
            None => false,
        }
    }

    fn on_event_completed(&self, event: &Event, outcome: Outcome) {
        self.shared.completions.resolve(&event.id, outcome);
    }

    async fn on_events_are_drained(&self) {
        self.shared.completions.drained().await;
    }

    async fn stop(&self) {
        for (_, timers) in self.timers.lock().await.drain() {
            timers.iter().for_each(JoinHandle::abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fnhost_protocol::RpcServerConfig;

    #[test]
    fn test_five_field_expressions_are_normalized() {
        let (schedule, tz) = parse_schedule("30 9 * * *", "UTC").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();

        assert_eq!(
            next_tick(&schedule, tz, after),
            Some(Utc.with_ymd_and_hms(2025, 3, 2, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_next_tick_honours_timezone() {
        let (schedule, tz) = parse_schedule("0 0 9 * * *", "Europe/Warsaw").unwrap();
        // 09:00 in Warsaw is 08:00 UTC in winter.
        let after = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();

        assert_eq!(
            next_tick(&schedule, tz, after),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_next_tick_is_strictly_after() {
        let (schedule, tz) = parse_schedule("0 * * * *", "UTC").unwrap();
        let on_tick = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();

        assert_eq!(
            next_tick(&schedule, tz, on_tick),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_day_of_week_uses_crontab_numbering() {
        // 2025-03-01 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = |cron: &str| {
            let (schedule, tz) = parse_schedule(cron, "UTC").unwrap();
            next_tick(&schedule, tz, saturday)
        };

        let monday = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(next("0 9 * * 1"), Some(monday));
        assert_eq!(next("0 9 * * MON"), Some(monday));
        assert_eq!(next("0 0 * * 0"), Some(sunday));
        assert_eq!(next("0 0 * * 7"), Some(sunday));
        assert_eq!(
            next("0 0 * * 1-5"),
            Some(Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap())
        );
        assert_eq!(
            next("0 0 * * 6"),
            Some(Utc.with_ymd_and_hms(2025, 3, 8, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(parse_schedule("* * *", "UTC").is_err());
        assert!(parse_schedule("0 0 0 1 1 * 2030", "UTC").is_err());
        assert!(parse_schedule("0 61 * * *", "UTC").is_err());
        assert!(parse_schedule("0 * * * *", "Mars/Olympus").is_err());
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (event_queue, _notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = ScheduleEnqueuer::new(event_queue, None);
        let target = Target {
            id: "nightly".into(),
            handler: "default".into(),
            ..Default::default()
        };

        let err = enqueuer
            .subscribe(
                target.clone(),
                Trigger::Schedule {
                    cron: "not a cron".into(),
                    timezone: "UTC".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueuerError::InvalidTrigger { .. }));

        enqueuer
            .subscribe(
                target,
                Trigger::Schedule {
                    cron: "0 0 * * *".into(),
                    timezone: "UTC".into(),
                },
            )
            .await
            .unwrap();
        assert!(enqueuer.unsubscribe("nightly").await);
        assert!(!enqueuer.unsubscribe("nightly").await);
    }

    #[tokio::test]
    async fn test_every_second_schedule_fires() {
        let (event_queue, mut notices) = EventQueue::new(RpcServerConfig::default());
        let enqueuer = ScheduleEnqueuer::new(event_queue, None);
        let target = Target {
            id: "ticker".into(),
            ..Default::default()
        };
        enqueuer
            .subscribe(
                target,
                Trigger::Schedule {
                    cron: "* * * * * *".into(),
                    timezone: "UTC".into(),
                },
            )
            .await
            .unwrap();

        let notice = tokio::time::timeout(std::time::Duration::from_secs(3), notices.recv())
            .await
            .unwrap()
            .unwrap();
        match notice {
            fnhost_core::QueueNotice::Enqueued(event) => {
                assert_eq!(event.kind(), Some(EventType::Schedule));
                assert_eq!(event.target_id(), "ticker");
            }
            other => panic!("unexpected notice: {:?}", other),
        }
        enqueuer.stop().await;
    }

    #[tokio::test]
    async fn test_tick_fires_on_one_replica() {
        use fnhost_core::{Persistence, QueueNotice, SqlitePersistence};

        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (queue_a, mut notices_a) = EventQueue::new(RpcServerConfig::default());
        let (queue_b, mut notices_b) = EventQueue::new(RpcServerConfig::default());
        let a = ScheduleEnqueuer::new(
            queue_a,
            Some(Arc::new(JobReducer::new(persistence.clone(), "r1"))),
        );
        let b = ScheduleEnqueuer::new(
            queue_b,
            Some(Arc::new(JobReducer::new(persistence, "r2"))),
        );
        let target = Target {
            id: "nightly".into(),
            handler: "default".into(),
            ..Default::default()
        };

        async fn next_event(
            notices: &mut tokio::sync::mpsc::UnboundedReceiver<QueueNotice>,
        ) -> Event {
            loop {
                if let Some(QueueNotice::Enqueued(event)) = notices.recv().await {
                    return event;
                }
            }
        }
        fn enqueued(notices: &mut tokio::sync::mpsc::UnboundedReceiver<QueueNotice>) -> usize {
            std::iter::from_fn(|| notices.try_recv().ok())
                .filter(|notice| matches!(notice, QueueNotice::Enqueued(_)))
                .count()
        }

        let tick = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        a.shared.fire(&target, tick);
        b.shared.fire(&target, tick);

        let wait = std::time::Duration::from_secs(5);
        tokio::time::timeout(wait, async {
            tokio::select! {
                _ = next_event(&mut notices_a) => {}
                _ = next_event(&mut notices_b) => {}
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(enqueued(&mut notices_a) + enqueued(&mut notices_b), 0);

        // The next tick is a different job.
        b.shared.fire(&target, tick + chrono::Duration::days(1));
        let event = tokio::time::timeout(wait, next_event(&mut notices_b))
            .await
            .unwrap();
        assert_eq!(event.target_id(), "nightly");
    }
}
