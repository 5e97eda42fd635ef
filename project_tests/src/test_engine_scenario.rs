//! # Engine End-to-End Scenario
//!
//! Drives a full engine lifecycle against an in-process synthetic source:
//! pipeline scheduling, filtered subscriber fan-out, cache reads, an offline
//! sync pass, and a final metrics window, then tears everything down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use lib_realtime::config::EngineConfig;
use lib_realtime::core::RealtimeEngine;
use lib_realtime::offline::ConflictStrategy;
use lib_realtime::pipelines::{Schedule, Target, TransformKind, Transformation};
use lib_realtime::sources::{SourceConnector, SourceKind};
use lib_realtime::subscriptions::SubscribeOptions;

/// Synthetic source producing a rolling batch of sensor readings.
struct SensorFeed {
    tick: Mutex<u64>,
}

#[async_trait]
impl SourceConnector for SensorFeed {
    async fn fetch(&self, _params: &Value) -> anyhow::Result<Value> {
        let mut tick = self.tick.lock().unwrap();
        *tick += 1;
        let base = *tick as f64;
        Ok(json!([
            { "sensor": "s1", "region": "eu", "value": base * 1.5 },
            { "sensor": "s2", "region": "eu", "value": base * 0.5 },
            { "sensor": "s3", "region": "us", "value": base * 2.0 },
        ]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = EngineConfig {
        scheduler_tick_ms: 20,
        sweep_interval_secs: 5,
        metrics_interval_secs: 3600,
        ..Default::default()
    };
    let engine = RealtimeEngine::new(config)?;
    engine.register_source(
        "sensors",
        "synthetic sensor feed",
        SourceKind::Stream,
        Arc::new(SensorFeed { tick: Mutex::new(0) }),
        Duration::from_millis(100),
    );
    engine.start();

    println!("[*] Subscribing a throttled, EU-only dashboard widget...");
    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);
    engine.subscribe(
        "ops-dashboard",
        "w:eu-average",
        Arc::new(move |payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            log::info!("Widget update: {}", payload.data);
            Ok(())
        }),
        SubscribeOptions {
            filter: None,
            throttle: Some(Duration::from_millis(50)),
        },
    );

    println!("[*] Creating a scheduled pipeline (filter -> average)...");
    let pipeline_id = engine.create_pipeline(
        "eu-average",
        "sensors",
        vec![
            Transformation::new(
                "eu-only",
                TransformKind::Filter,
                json!({ "field": "region", "op": "eq", "value": "eu" }),
                1,
            ),
            Transformation::new(
                "avg-value",
                TransformKind::Aggregate,
                json!({ "op": "avg", "field": "value" }),
                2,
            ),
        ],
        vec![Target::Widget { key: "w:eu-average".to_string() }],
        Schedule::Interval(Duration::from_millis(100)),
    )?;

    println!("[*] Letting the scheduler run for one second...");
    tokio::time::sleep(Duration::from_secs(1)).await;

    let delivered = deliveries.load(Ordering::SeqCst);
    let cached = engine
        .get_cached("w:eu-average")
        .ok_or_else(|| anyhow::anyhow!("expected a cached widget payload"))?;
    println!("[INFO] {} throttled deliveries, cached value: {}", delivered, cached.data);
    if delivered == 0 {
        eprintln!("[ERROR] Scheduler never delivered an update");
        std::process::exit(1);
    }

    println!("[*] Queueing offline changes and syncing...");
    engine.enable_offline_mode(ConflictStrategy::LastWriterWins);
    engine.queue_offline_change(
        "w:manual-note",
        json!({ "note": "written while offline" }),
        Utc::now(),
    );
    engine.queue_offline_change(
        "w:eu-average",
        json!({ "op": "avg", "value": -1.0 }),
        Utc::now() - chrono::Duration::hours(1),
    );
    let report = engine.sync_offline_changes();
    println!(
        "[INFO] Offline sync: {} applied, {} discarded, {} failed",
        report.applied, report.discarded, report.failed
    );
    if report.applied != 1 || report.discarded != 1 {
        eprintln!("[ERROR] Unexpected offline sync outcome: {:?}", report);
        std::process::exit(1);
    }
    let status = engine.get_sync_status(&["w:eu-average", "w:manual-note", "w:never-written"]);
    println!("[INFO] Sync status: {:?}", status);

    println!("[*] Collecting a metrics window...");
    let metrics = engine.get_metrics();
    println!("\n[SUCCESS] Final metrics window:");
    println!("-----------------------------------------------");
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    println!("-----------------------------------------------");

    engine.set_pipeline_active(pipeline_id, false)?;
    engine.destroy();
    println!("[INFO] Engine destroyed, scenario complete");
    Ok(())
}
