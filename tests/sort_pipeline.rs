//! 仕分けパイプライン統合テスト
//!
//! モックリンク・モック認識を使ったend-to-endテスト。
//! 検出投入からワイヤフレーム送出・ACK・完了イベントまでを通しで検証する。

use std::time::Duration;

use SushiBelt::application::controller::{SortEvent, SortProcessController};
use SushiBelt::domain::{
    AppConfig, BinEntryConfig, BoundingBox, CameraView, Centroid, Detection, DeviceConfig,
    JetConfig, LinkHealth, LinkPort, SorterConfig, SpeedSample, Timestamp,
};
use SushiBelt::infrastructure::mock_link::MockLink;
use SushiBelt::infrastructure::mock_recognizer::MockRecognizer;

/// 高速確定・高速発火のテスト用設定
fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.belt.initial_speed_mm_s = 1000.0;
    config.pairing.view_offset_mm = 0.0;
    config.pairing.idle_timeout_ms = 50;
    config.scheduler.tick_interval_ms = 10;
    config.actuators.sorters = vec![SorterConfig {
        index: 0,
        device_id: "sorter-0".to_string(),
        offset_mm: 400.0,
    }];
    config.actuators.jets = vec![JetConfig {
        index: 0,
        device_id: "jet-0".to_string(),
        offset_mm: 450.0,
    }];
    config.hardware.devices = vec![
        DeviceConfig {
            id: "sorter-0".to_string(),
            path: String::new(),
            baud_rate: 115200,
            ack_timeout_ms: 20,
            max_retries: 2,
        },
        DeviceConfig {
            id: "jet-0".to_string(),
            path: String::new(),
            baud_rate: 115200,
            ack_timeout_ms: 20,
            max_retries: 2,
        },
    ];
    config
        .classification
        .bin_table
        .insert("m3-screw".to_string(), BinEntryConfig { sorter: 0, bin: 2 });
    config
}

fn detection(view: CameraView, x: f64, t: Timestamp) -> Detection {
    Detection {
        view,
        timestamp: t,
        centroid: Centroid { x, y: 0.0 },
        bounding_box: BoundingBox {
            x: x - 5.0,
            y: -5.0,
            width: 10.0,
            height: 10.0,
        },
        confidence: 0.9,
        image_uri: Some("crop://test".to_string()),
    }
}

fn wait_for<F: Fn(&SortEvent) -> bool>(
    controller: &SortProcessController,
    pred: F,
) -> SortEvent {
    loop {
        let event = controller
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("event");
        if pred(&event) {
            return event;
        }
    }
}

#[test]
fn test_pipeline_sends_wire_frames_and_completes() {
    let sorter_link = MockLink::always_ack();
    let jet_link = MockLink::always_ack();
    let sorter_sent = sorter_link.sent_frames();
    let jet_sent = jet_link.sent_frames();

    let config = test_config();
    let links: Vec<(String, Box<dyn LinkPort>)> = vec![
        ("sorter-0".to_string(), Box::new(sorter_link)),
        ("jet-0".to_string(), Box::new(jet_link)),
    ];
    let controller = SortProcessController::start(
        &config,
        Box::new(MockRecognizer::with_identity("m3-screw", 0.95)),
        links,
    )
    .expect("start");

    let now = controller.clock().now();
    controller
        .detections()
        .send(vec![
            detection(CameraView::Top, 100.0, now),
            detection(CameraView::Side, 100.0, now),
        ])
        .unwrap();

    let event = wait_for(&controller, |e| matches!(e, SortEvent::Completed(_)));
    let SortEvent::Completed(completion) = event else {
        unreachable!()
    };
    assert_eq!(completion.identity, "m3-screw");
    assert_eq!(completion.sorter, 0);
    assert_eq!(completion.bin, 2);

    // ソーターへはmove-to-bin(0x01, ビン2)、ジェットへはfire-jet(0x02)が届く
    let sorter_frames = sorter_sent.lock().unwrap();
    assert!(sorter_frames
        .iter()
        .any(|f| f[1] == 0x01 && f[2] == 2));
    let jet_frames = jet_sent.lock().unwrap();
    assert!(jet_frames.iter().any(|f| f[1] == 0x02 && f[2] == 0));

    // 全フレームのチェックサム（先頭7バイトのXOR）を検証
    for frame in sorter_frames.iter().chain(jet_frames.iter()) {
        let checksum = frame[..7].iter().fold(0u8, |acc, b| acc ^ b);
        assert_eq!(frame[7], checksum);
    }

    drop(sorter_frames);
    drop(jet_frames);
    controller.stop();
}

#[test]
fn test_belt_stop_defers_firing_until_resume() {
    let config = test_config();
    let links: Vec<(String, Box<dyn LinkPort>)> = vec![
        ("sorter-0".to_string(), Box::new(MockLink::always_ack())),
        ("jet-0".to_string(), Box::new(MockLink::always_ack())),
    ];
    let controller = SortProcessController::start(
        &config,
        Box::new(MockRecognizer::with_identity("m3-screw", 0.95)),
        links,
    )
    .expect("start");

    // ベルト停止を通知してから検出を投入する
    let now = controller.clock().now();
    controller
        .telemetry()
        .send(SpeedSample {
            timestamp: now,
            speed: 0.0,
        })
        .unwrap();
    controller
        .detections()
        .send(vec![
            detection(CameraView::Top, 100.0, now),
            detection(CameraView::Side, 100.0, now),
        ])
        .unwrap();

    // 停止中は発火しない（アイドル確定と分類は進む）
    std::thread::sleep(Duration::from_millis(300));
    assert!(controller
        .events()
        .try_iter()
        .all(|e| !matches!(e, SortEvent::Completed(_))));

    // 再開すると予定時刻が再計算され発火する
    controller
        .telemetry()
        .send(SpeedSample {
            timestamp: controller.clock().now(),
            speed: 1000.0,
        })
        .unwrap();

    let event = wait_for(&controller, |e| matches!(e, SortEvent::Completed(_)));
    assert!(matches!(event, SortEvent::Completed(_)));

    controller.stop();
}

#[test]
fn test_jet_fault_reported_and_recovered() {
    // ジェットはACKを3回（リトライ上限まで）落として障害に入る
    let config = test_config();
    let links: Vec<(String, Box<dyn LinkPort>)> = vec![
        ("sorter-0".to_string(), Box::new(MockLink::always_ack())),
        (
            "jet-0".to_string(),
            Box::new(MockLink::with_ack_script(vec![false, false, false])),
        ),
    ];
    let controller = SortProcessController::start(
        &config,
        Box::new(MockRecognizer::with_identity("m3-screw", 0.95)),
        links,
    )
    .expect("start");

    let now = controller.clock().now();
    controller
        .detections()
        .send(vec![
            detection(CameraView::Top, 100.0, now),
            detection(CameraView::Side, 100.0, now),
        ])
        .unwrap();

    let event = wait_for(&controller, |e| matches!(e, SortEvent::DeviceFaulted(_)));
    let SortEvent::DeviceFaulted(fault) = event else {
        unreachable!()
    };
    assert_eq!(fault.device_id, "jet-0");
    assert_eq!(
        controller.device_health("jet-0"),
        Some(LinkHealth::Faulted)
    );

    // 復旧すると保持されていたコマンドが再送され、完了まで進む
    controller.recover_device("jet-0").expect("recover");
    let event = wait_for(&controller, |e| matches!(e, SortEvent::Completed(_)));
    let SortEvent::Completed(completion) = event else {
        unreachable!()
    };
    assert_eq!(completion.identity, "m3-screw");
    assert_eq!(
        controller.device_health("jet-0"),
        Some(LinkHealth::Healthy)
    );

    controller.stop();
}

#[test]
fn test_start_rejects_unconfigured_link() {
    let config = test_config();
    let links: Vec<(String, Box<dyn LinkPort>)> = vec![
        ("sorter-0".to_string(), Box::new(MockLink::always_ack())),
        ("ghost".to_string(), Box::new(MockLink::always_ack())),
    ];
    let result = SortProcessController::start(
        &config,
        Box::new(MockRecognizer::with_identity("m3-screw", 0.95)),
        links,
    );
    assert!(result.is_err());
}
