use anyhow::Result;
use mq_chat_router::{
    pool::PoolSize,
    router::RouterConfig,
    sim::{SimConfig, run_in_process},
};
use std::time::Duration;

#[test]
fn every_client_sees_every_message() -> Result<()> {
    let config = SimConfig {
        clients: 3,
        messages_per_client: 5,
        interval: Duration::from_millis(1),
        ..SimConfig::default()
    };
    let router = RouterConfig {
        workers: PoolSize::from(4),
        ..RouterConfig::default()
    };

    let report = run_in_process(&config, router)?;

    assert_eq!(report.sent, 15);
    assert_eq!(report.expected, 45);
    assert_eq!(report.received, 45);
    assert_eq!(report.errors, 0);
    assert!(report.is_complete());
    assert!(report.min_latency_us.is_some());
    assert!(report.min_latency_us <= report.max_latency_us);
    Ok(())
}

#[test]
fn report_serializes_to_json() -> Result<()> {
    let config = SimConfig {
        clients: 1,
        messages_per_client: 2,
        interval: Duration::from_millis(1),
        ..SimConfig::default()
    };
    let report = run_in_process(&config, RouterConfig::default())?;

    let json = serde_json::to_value(&report)?;
    assert_eq!(json["clients"], 1);
    assert_eq!(json["received"], 2);
    assert!(json["avg_latency_us"].is_i64());
    Ok(())
}
