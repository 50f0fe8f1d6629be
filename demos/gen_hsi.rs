//! Minimal end-to-end demo: initialize the runtime against in-memory
//! adapters, grant consent, push a few wear samples, and print the first
//! Human State Vector produced.

use std::sync::Arc;
use std::time::Duration;

use synheart_runtime::adapters::{InMemoryBehaviorAdapter, InMemoryPhoneAdapter, InMemoryWearAdapter};
use synheart_runtime::config::{DeviceIdentity, RuntimeConfig};
use synheart_runtime::storage::InMemoryStore;
use synheart_runtime::SynheartEngine;
use synheart_runtime::types::WearSample;

#[tokio::main]
async fn main() {
    let wear = InMemoryWearAdapter::new();
    let engine = Arc::new(SynheartEngine::new(
        Arc::new(InMemoryStore::new()),
        wear.clone(),
        InMemoryPhoneAdapter::new(),
        InMemoryBehaviorAdapter::new(),
    ));

    let device = DeviceIdentity {
        device_id: "demo-device".into(),
        platform: "demo".into(),
    };
    engine
        .initialize(RuntimeConfig::new(device))
        .await
        .expect("initialize");
    engine
        .grant_consent(true, true, true, false)
        .await
        .expect("grant consent");

    let mut hsv_rx = engine.subscribe_hsv().await.expect("subscribe");
    engine.start_data_collection().await.expect("start");

    let now = synheart_runtime::now_ms();
    for i in 0..5 {
        wear.push(WearSample {
            timestamp: now + i * 1000,
            hr: Some(72.0),
            hrv_rmssd: Some(45.0),
            resp_rate: None,
            motion_level: None,
            sleep_stage: None,
            rr_intervals: vec![800.0, 820.0, 790.0],
        })
        .await;
    }

    tokio::time::timeout(Duration::from_secs(3), hsv_rx.changed())
        .await
        .expect("hsv stream should emit")
        .expect("fusion engine should stay alive");
    let hsv = hsv_rx.borrow_and_update().clone();
    println!("{}", serde_json::to_string_pretty(&hsv).unwrap());

    engine.stop_data_collection().await.expect("stop");
    engine.dispose().await.expect("dispose");
}
