//! # Pipeline Engine
//!
//! Owns the pipeline table and executes runs: fetch from the source
//! registry, thread the value through the transformation chain, deliver to
//! targets, then re-arm the scheduler. A failed run is recorded and
//! reported but never stops future runs — the pipeline is rescheduled on
//! failure exactly as on success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::store::{CacheStore, CacheWriteOptions};
use crate::core::error::{EngineError, Result};
use crate::core::events::{emit, EngineEvent, EventSender};
use crate::core::payload::WidgetPayload;
use crate::core::scheduler::RunScheduler;
use crate::pipelines::{Pipeline, Schedule, Target, Transformation};
use crate::sources::SourceRegistry;
use crate::subscriptions::SubscriptionRegistry;

pub struct PipelineEngine {
    pipelines: Mutex<HashMap<Uuid, Pipeline>>,
    sources: Arc<SourceRegistry>,
    cache: Arc<CacheStore>,
    subscriptions: Arc<SubscriptionRegistry>,
    scheduler: Arc<RunScheduler>,
    write_opts: CacheWriteOptions,
    events: EventSender,
    runs: AtomicU64,
    errors: AtomicU64,
}

impl PipelineEngine {
    pub fn new(
        sources: Arc<SourceRegistry>,
        cache: Arc<CacheStore>,
        subscriptions: Arc<SubscriptionRegistry>,
        scheduler: Arc<RunScheduler>,
        write_opts: CacheWriteOptions,
        events: EventSender,
    ) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            sources,
            cache,
            subscriptions,
            scheduler,
            write_opts,
            events,
            runs: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Registers a pipeline and arms its first run. Fails up front on an
    /// unknown source or an invalid schedule, so a pipeline that exists is
    /// always runnable.
    pub fn create_pipeline(
        &self,
        name: &str,
        source_id: &str,
        mut transformations: Vec<Transformation>,
        targets: Vec<Target>,
        schedule: Schedule,
    ) -> Result<Uuid> {
        if !self.sources.contains(source_id) {
            return Err(EngineError::SourceNotFound(source_id.to_string()));
        }
        // Stable sort: stages with equal `order` keep their insertion order.
        transformations.sort_by_key(|stage| stage.order);

        let next_run_at = schedule.next_run(Utc::now())?;
        let id = Uuid::new_v4();
        let pipeline = Pipeline {
            id,
            name: name.to_string(),
            source_id: source_id.to_string(),
            transformations,
            targets,
            schedule,
            active: true,
            last_run_at: None,
            next_run_at,
        };
        self.pipelines
            .lock()
            .expect("Pipeline table lock poisoned")
            .insert(id, pipeline);
        if let Some(at) = next_run_at {
            self.scheduler.arm(id, at);
        }
        log::info!("Pipeline '{}' ({}) created, next run {:?}", name, id, next_run_at);
        Ok(id)
    }

    /// Executes one run and returns the final transformed value. Fetch,
    /// transform, and target delivery errors all surface through the
    /// returned `Result` and as a `PipelineError` event; either way the
    /// pipeline is re-armed for its next scheduled run.
    pub async fn run(&self, id: Uuid) -> Result<Value> {
        let (name, source_id, transformations, targets) = {
            let pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
            let pipeline = pipelines
                .get(&id)
                .ok_or(EngineError::PipelineNotFound(id))?;
            if !pipeline.active {
                return Err(EngineError::PipelineInactive(id));
            }
            (
                pipeline.name.clone(),
                pipeline.source_id.clone(),
                pipeline.transformations.clone(),
                pipeline.targets.clone(),
            )
        };

        let outcome = self.execute(&source_id, &transformations, &targets).await;
        let now = Utc::now();

        let result = match outcome {
            Ok(value) => {
                self.runs.fetch_add(1, Ordering::Relaxed);
                let mut pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
                if let Some(pipeline) = pipelines.get_mut(&id) {
                    pipeline.last_run_at = Some(now);
                }
                Ok(value)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pipeline '{}' run failed: {}", name, e);
                emit(
                    &self.events,
                    EngineEvent::PipelineError {
                        pipeline_id: id,
                        pipeline_name: name,
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        };

        self.reschedule(id, now);
        result
    }

    async fn execute(
        &self,
        source_id: &str,
        transformations: &[Transformation],
        targets: &[Target],
    ) -> Result<Value> {
        let mut value = self.sources.fetch(source_id, &Value::Null).await?;
        for stage in transformations {
            value = stage
                .apply(value)
                .map_err(|reason| EngineError::TransformationFailed {
                    stage: stage.id.clone(),
                    reason,
                })?;
        }

        let payload = WidgetPayload::new(value);
        for target in targets {
            match target {
                Target::Cache { key } => {
                    self.cache.set(key, &payload, &self.write_opts)?;
                }
                Target::Widget { key } => {
                    // Subscribers first, then the cache write that makes the
                    // update visible to late readers.
                    self.subscriptions.publish(key, &payload);
                    self.cache.set(key, &payload, &self.write_opts)?;
                }
            }
        }
        Ok(payload.data)
    }

    /// Computes and arms the next run. Failure to compute (which creation
    /// already validated against) leaves the pipeline unscheduled.
    fn reschedule(&self, id: Uuid, now: chrono::DateTime<Utc>) {
        let mut pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
        let Some(pipeline) = pipelines.get_mut(&id) else {
            return;
        };
        if !pipeline.active {
            pipeline.next_run_at = None;
            return;
        }
        match pipeline.schedule.next_run(now) {
            Ok(next) => {
                pipeline.next_run_at = next;
                if let Some(at) = next {
                    self.scheduler.arm(id, at);
                }
            }
            Err(e) => {
                pipeline.next_run_at = None;
                log::warn!("Pipeline {} could not be rescheduled: {}", id, e);
            }
        }
    }

    /// Pauses or resumes a pipeline. Resuming re-arms the schedule from now;
    /// pausing clears `next_run_at` so stale heap entries are discarded by
    /// the tick loop's validation.
    pub fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        let next = {
            let mut pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
            let pipeline = pipelines
                .get_mut(&id)
                .ok_or(EngineError::PipelineNotFound(id))?;
            pipeline.active = active;
            if active {
                let next = pipeline.schedule.next_run(Utc::now())?;
                pipeline.next_run_at = next;
                next
            } else {
                pipeline.next_run_at = None;
                None
            }
        };
        if let Some(at) = next {
            self.scheduler.arm(id, at);
        }
        log::info!("Pipeline {} {}", id, if active { "resumed" } else { "paused" });
        Ok(())
    }

    /// Runs every active pipeline whose schedule waits on this event name.
    /// Returns the number of pipelines run (failures included; they are
    /// reported through events).
    pub async fn trigger_event(&self, event_name: &str) -> usize {
        let matching: Vec<Uuid> = {
            let pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
            pipelines
                .values()
                .filter(|pipeline| {
                    pipeline.active
                        && matches!(&pipeline.schedule, Schedule::Event { name } if name == event_name)
                })
                .map(|pipeline| pipeline.id)
                .collect()
        };
        let count = matching.len();
        for id in matching {
            // Errors are already reported via PipelineError events.
            let _ = self.run(id).await;
        }
        if count > 0 {
            log::debug!("Event '{}' triggered {} pipeline(s)", event_name, count);
        }
        count
    }

    /// Pops due scheduler entries and keeps only the ones that still match a
    /// live, active pipeline's `next_run_at`. Entries obsoleted by a pause
    /// or reschedule fall away here.
    pub fn take_due(&self, now: chrono::DateTime<Utc>) -> Vec<Uuid> {
        let due = self.scheduler.due(now);
        let pipelines = self.pipelines.lock().expect("Pipeline table lock poisoned");
        due.into_iter()
            .filter(|run| {
                pipelines
                    .get(&run.pipeline_id)
                    .is_some_and(|pipeline| {
                        pipeline.active && pipeline.next_run_at == Some(run.at)
                    })
            })
            .map(|run| run.pipeline_id)
            .collect()
    }

    /// Snapshot of one pipeline's current state.
    pub fn pipeline(&self, id: Uuid) -> Option<Pipeline> {
        self.pipelines
            .lock()
            .expect("Pipeline table lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines
            .lock()
            .expect("Pipeline table lock poisoned")
            .len()
    }

    /// Successful runs since construction.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Failed runs since construction.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.pipelines
            .lock()
            .expect("Pipeline table lock poisoned")
            .clear();
        self.scheduler.clear();
    }
}
