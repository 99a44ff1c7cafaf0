//! Notification delivery with method selection and timed escalation.
//!
//! `send_notification` delivers once immediately and records what should
//! happen later in the [`EscalationScheduler`]. Nothing is cancelled when a
//! parent opens a notification; every scheduled task re-reads the record
//! when it fires and does nothing if the notification was opened, completed
//! or has expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::scheduler::{EscalationScheduler, ScheduledTask, TaskAction};
use super::store::NotificationStore;
use super::types::{
    DeliveryAttempt, DeliveryMethod, DeliveryTrigger, EscalationRule, NotificationOptions,
    NotificationPriority, NotificationRecord,
};
use super::{NotifyConfig, NotifyError, NotifyResult};
use crate::clock::SharedClock;

/// Channel backend (SMS gateway, mailer, push service, in-app inbox).
#[async_trait]
pub trait NotificationDelivery: Send + Sync {
    async fn deliver(
        &self,
        record: &NotificationRecord,
        method: DeliveryMethod,
        priority: NotificationPriority,
    ) -> NotifyResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Opened,
    Completed,
    Expired,
    Missing,
}

/// What happened when a scheduled task fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FireOutcome {
    Delivered {
        notification_id: String,
        method: DeliveryMethod,
        trigger: DeliveryTrigger,
    },
    DeliveryFailed {
        notification_id: String,
        method: DeliveryMethod,
        trigger: DeliveryTrigger,
    },
    Skipped {
        notification_id: String,
        reason: SkipReason,
    },
}

pub struct NotificationEngine {
    store: Arc<dyn NotificationStore>,
    delivery: Arc<dyn NotificationDelivery>,
    clock: SharedClock,
    config: NotifyConfig,
    scheduler: Mutex<EscalationScheduler>,
}

impl NotificationEngine {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        delivery: Arc<dyn NotificationDelivery>,
        clock: SharedClock,
        config: NotifyConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            clock,
            config,
            scheduler: Mutex::new(EscalationScheduler::new()),
        }
    }

    /// Build an engine and reload any schedule left by a previous process.
    pub async fn restore(
        store: Arc<dyn NotificationStore>,
        delivery: Arc<dyn NotificationDelivery>,
        clock: SharedClock,
        config: NotifyConfig,
    ) -> NotifyResult<Self> {
        let engine = Self::new(store, delivery, clock, config);
        engine.load_schedule().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Replace the in-memory schedule with the persisted one.
    pub async fn load_schedule(&self) -> NotifyResult<usize> {
        let tasks = self.store.load_schedule().await?;
        let count = tasks.len();
        *self.scheduler.lock().await = EscalationScheduler::from_tasks(tasks);
        info!(tasks = count, "Escalation schedule loaded");
        Ok(count)
    }

    pub async fn pending_tasks(&self) -> Vec<ScheduledTask> {
        self.scheduler.lock().await.tasks()
    }

    async fn persist_schedule(&self, scheduler: &EscalationScheduler) -> NotifyResult<()> {
        self.store.save_schedule(&scheduler.tasks()).await?;
        Ok(())
    }

    /// Persist, deliver once, and schedule escalations.
    pub async fn send_notification(&self, options: NotificationOptions) -> NotifyResult<NotificationRecord> {
        let now = self.clock.now();
        let expires_in = options
            .expires_in
            .unwrap_or_else(|| options.template.kind.default_expiration());
        let mut record = NotificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: options.user_id,
            template: options.template,
            priority: options.priority,
            action_url: options.action_url,
            created_at: now,
            expires_at: now + to_chrono(expires_in),
            delivery_attempts: Vec::new(),
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            completed_at: None,
        };
        self.store.insert(&record).await?;

        let priority = record.priority;
        let method = self.select_method(&record.user_id, priority).await?;
        let delivered = self
            .attempt(&mut record, method, priority, DeliveryTrigger::Initial)
            .await;
        self.store.update(&record).await?;

        let mut rules: Vec<(usize, &EscalationRule)> = options.escalation_rules.iter().enumerate().collect();
        // stable: equal trigger times keep declaration order
        rules.sort_by_key(|(_, rule)| rule.trigger_after);

        let mut scheduler = self.scheduler.lock().await;
        for (rule_index, rule) in rules {
            scheduler.schedule(
                record.created_at + to_chrono(rule.trigger_after),
                record.id.clone(),
                TaskAction::Escalate {
                    rule_index,
                    method: rule.method,
                    priority: rule.priority,
                },
            );
        }
        if !delivered {
            let fallback = method.fallback();
            scheduler.schedule(
                now + to_chrono(Duration::from_secs(self.config.fallback_delay_secs)),
                record.id.clone(),
                TaskAction::Fallback { method: fallback },
            );
            info!(notification_id = %record.id, %method, %fallback, "Initial delivery failed; fallback scheduled");
        }
        self.persist_schedule(&scheduler).await?;
        drop(scheduler);

        info!(
            notification_id = %record.id,
            user_id = %record.user_id,
            priority = %record.priority,
            %method,
            delivered,
            "Notification sent"
        );
        Ok(record)
    }

    /// Best channel for this user at `priority`.
    ///
    /// Walks the priority's preference list, dropping opted-out channels and
    /// channels whose recent open ratio is under the floor. When nothing
    /// survives, falls back to in-app, or the next channel along the
    /// fallback chain the user has not opted out of.
    pub async fn select_method(
        &self,
        user_id: &str,
        priority: NotificationPriority,
    ) -> NotifyResult<DeliveryMethod> {
        let opt_outs = self.store.opt_outs(user_id).await?;
        let recent = self
            .store
            .recent_for_user(user_id, self.config.performance_window)
            .await?;

        let mut stats: HashMap<DeliveryMethod, (usize, usize)> = HashMap::new();
        for record in &recent {
            if let Some(method) = record.delivered_method() {
                let entry = stats.entry(method).or_default();
                entry.1 += 1;
                if record.is_opened() {
                    entry.0 += 1;
                }
            }
        }

        let chosen = priority.preferred_methods().iter().copied().find(|method| {
            if opt_outs.contains(method) {
                return false;
            }
            match stats.get(method) {
                Some(&(opened, total)) if total >= self.config.min_samples => {
                    let ratio = opened as f64 / total as f64;
                    if ratio < self.config.performance_floor {
                        debug!(user_id, %method, ratio, "Skipping under-performing channel");
                        return false;
                    }
                    true
                }
                _ => true,
            }
        });
        if let Some(method) = chosen {
            return Ok(method);
        }
        std::iter::successors(Some(DeliveryMethod::InApp), |m| Some(m.fallback()))
            .take(DeliveryMethod::ALL.len())
            .find(|method| !opt_outs.contains(method))
            .ok_or_else(|| NotifyError::NoChannel(user_id.to_string()))
    }

    async fn attempt(
        &self,
        record: &mut NotificationRecord,
        method: DeliveryMethod,
        priority: NotificationPriority,
        trigger: DeliveryTrigger,
    ) -> bool {
        let result = self.delivery.deliver(record, method, priority).await;
        let now = self.clock.now();
        let success = result.is_ok();
        if let Err(e) = &result {
            warn!(notification_id = %record.id, %method, error = %e, "Delivery failed");
        }
        record.delivery_attempts.push(DeliveryAttempt {
            method,
            priority,
            trigger,
            attempted_at: now,
            success,
            error: result.err().map(|e| e.to_string()),
        });
        if success && record.delivered_at.is_none() {
            record.delivered_at = Some(now);
        }
        success
    }

    /// Fire every task due at `now`.
    ///
    /// Tasks for one notification run in order; different notifications run
    /// concurrently.
    pub async fn run_due(&self, now: DateTime<Utc>) -> NotifyResult<Vec<FireOutcome>> {
        let due = {
            let mut scheduler = self.scheduler.lock().await;
            let due = scheduler.pop_due(now);
            if !due.is_empty() {
                self.persist_schedule(&scheduler).await?;
            }
            due
        };
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<ScheduledTask>> = HashMap::new();
        for task in due {
            if !grouped.contains_key(&task.notification_id) {
                order.push(task.notification_id.clone());
            }
            grouped.entry(task.notification_id.clone()).or_default().push(task);
        }

        let runs = order.into_iter().filter_map(|id| grouped.remove(&id)).map(|tasks| async move {
            let mut outcomes = Vec::with_capacity(tasks.len());
            for task in tasks {
                match self.fire(&task, now).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!(notification_id = %task.notification_id, error = %e, "Scheduled task failed"),
                }
            }
            outcomes
        });
        Ok(join_all(runs).await.into_iter().flatten().collect())
    }

    async fn fire(&self, task: &ScheduledTask, now: DateTime<Utc>) -> NotifyResult<FireOutcome> {
        let skipped = |reason| FireOutcome::Skipped {
            notification_id: task.notification_id.clone(),
            reason,
        };
        let Some(mut record) = self.store.get(&task.notification_id).await? else {
            return Ok(skipped(SkipReason::Missing));
        };
        if record.completed_at.is_some() {
            return Ok(skipped(SkipReason::Completed));
        }
        if record.is_opened() {
            return Ok(skipped(SkipReason::Opened));
        }
        if record.is_expired(now) {
            debug!(notification_id = %record.id, "Suppressing stale escalation");
            return Ok(skipped(SkipReason::Expired));
        }

        let (method, priority, trigger) = match task.action {
            TaskAction::Escalate {
                rule_index,
                method,
                priority,
            } => (method, priority, DeliveryTrigger::Escalation { rule_index }),
            TaskAction::Fallback { method } => (method, record.priority, DeliveryTrigger::Fallback),
        };
        let delivered = self.attempt(&mut record, method, priority, trigger).await;
        self.store.update(&record).await?;

        info!(notification_id = %record.id, %method, %priority, ?trigger, delivered, "Escalation fired");
        Ok(if delivered {
            FireOutcome::Delivered {
                notification_id: record.id,
                method,
                trigger,
            }
        } else {
            FireOutcome::DeliveryFailed {
                notification_id: record.id,
                method,
                trigger,
            }
        })
    }

    async fn touch(
        &self,
        id: &str,
        apply: impl FnOnce(&mut NotificationRecord, DateTime<Utc>),
    ) -> NotifyResult<NotificationRecord> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| NotifyError::NotFound(id.to_string()))?;
        apply(&mut record, self.clock.now());
        self.store.update(&record).await?;
        Ok(record)
    }

    pub async fn mark_opened(&self, id: &str) -> NotifyResult<NotificationRecord> {
        self.touch(id, |r, now| {
            r.opened_at.get_or_insert(now);
        })
        .await
    }

    /// A click implies the notification was opened.
    pub async fn mark_clicked(&self, id: &str) -> NotifyResult<NotificationRecord> {
        self.touch(id, |r, now| {
            r.opened_at.get_or_insert(now);
            r.clicked_at.get_or_insert(now);
        })
        .await
    }

    pub async fn mark_completed(&self, id: &str) -> NotifyResult<NotificationRecord> {
        self.touch(id, |r, now| {
            r.completed_at.get_or_insert(now);
        })
        .await
    }

    /// Run [`Self::run_due`] every `dispatch_interval_ms` until the handle
    /// is aborted.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = Duration::from_millis(self.config.dispatch_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = engine.clock.now();
                match engine.run_due(now).await {
                    Ok(outcomes) if !outcomes.is_empty() => {
                        debug!(fired = outcomes.len(), "Escalation dispatcher tick")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Escalation dispatcher tick failed"),
                }
            }
        })
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
