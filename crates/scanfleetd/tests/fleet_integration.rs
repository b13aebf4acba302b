//! End-to-end: config file → supervised fleet → scans run to completion.

use std::io::Write;
use std::time::Duration;

use scanfleet_core::{FleetConfig, ScanRequest};
use scanfleet_pool::EngineState;
use scanfleetd::SimulatedFleet;
use scanfleetd::fleet::load_config;

const CONFIG: &str = r#"
[fleet]
name_prefix = "it"
queue_interval = "25ms"
reconcile_interval = "25ms"
shutdown_timeout = "2s"

[simulator]
launch_delay = "0s"
scan_duration = "0s"

[[pool]]
tier = "S"
min_metric = 0
max_metric = 99999
total = 3
min_idle = 2

[[pool]]
tier = "L"
min_metric = 100000
max_metric = 999999
total = 2
min_idle = 0
"#;

async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn fleet_warms_min_idle_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = load_config(file.path()).unwrap();

    let mut fleet = SimulatedFleet::from_config(&config).unwrap();
    fleet.supervisor.start().await.unwrap();

    let pool = fleet.pool.clone();
    let warmed = wait_until(|| {
        let pool = pool.clone();
        async move { pool.tier_counts("S").await.idle == 2 }
    })
    .await;
    assert!(warmed, "min idle engines never came up");

    fleet
        .supervisor
        .run_until(tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap();

    let s = fleet.pool.tier_counts("S").await;
    assert_eq!(s.idle, 2);
    assert_eq!(s.unprovisioned, 1);
    let l = fleet.pool.tier_counts("L").await;
    assert_eq!(l.unprovisioned, 2);
    assert!(fleet.pool.engine_by_name("it-s-01").await.is_some());
}

#[tokio::test]
async fn queued_scans_run_to_completion() {
    let config = FleetConfig::from_toml_str(CONFIG).unwrap();
    let mut fleet = SimulatedFleet::from_config(&config).unwrap();

    for i in 0..4 {
        fleet.queue.submit(ScanRequest::new(format!("small-{i}"), 1_000)).await;
    }
    fleet.queue.submit(ScanRequest::new("large-0", 500_000)).await;
    fleet.queue.submit(ScanRequest::new("too-big", 5_000_000)).await;

    fleet.supervisor.start().await.unwrap();

    let queue = fleet.queue.clone();
    let done = wait_until(|| {
        let queue = queue.clone();
        async move { queue.completed_len().await == 5 }
    })
    .await;

    fleet.supervisor.stop().await;
    assert!(done, "scans did not complete");

    // The unclassifiable scan is never dispatched.
    assert_eq!(fleet.queue.pending_len().await, 1);

    let counts = fleet.pool.state_counts().await;
    assert_eq!(counts["S"].total(), 3);
    assert_eq!(counts["L"].total(), 2);
    let engines = fleet.pool.all_engines_by_name().await;
    assert!(
        engines
            .values()
            .all(|e| e.state() != EngineState::Scanning || e.job().is_some())
    );
}

#[tokio::test]
async fn invalid_config_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[[pool]]\ntier = \"S\"\nmin_metric = 10\nmax_metric = 1\ntotal = 1\n")
        .unwrap();

    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid config"));
}
