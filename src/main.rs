mod application;
mod domain;
mod infrastructure;
mod logging;

use crate::application::controller::{SortEvent, SortProcessController};
use crate::domain::config::AppConfig;
use crate::domain::{LinkPort, RecognizerPort};
use crate::infrastructure::http_recognizer::HttpRecognizerAdapter;
use crate::infrastructure::mock_link::MockLink;
use crate::infrastructure::mock_recognizer::MockRecognizer;
use crate::infrastructure::mock_source::MockDetectionSource;
use crate::infrastructure::serial_link::SerialLinkAdapter;
use crate::logging::init_logging;
use std::path::PathBuf;
use std::time::Duration;

fn main() {
    // ログシステムの初期化（非同期ファイル出力）
    let log_dir = PathBuf::from("logs");
    let _guard = init_logging("info", false, Some(log_dir));
    // 注意: _guardはmain終了まで保持する必要がある（Dropでログスレッドが終了）

    tracing::info!("SushiBelt starting...");

    match run() {
        Ok(_) => {
            tracing::info!("SushiBelt terminated gracefully.");
        }
        Err(e) => {
            tracing::error!("Fatal error: {:?}", e);
            std::process::exit(1);
        }
    }
}

/// アプリケーションのメイン処理
fn run() -> Result<(), Box<dyn std::error::Error>> {
    // 設定ファイルの読み込み（存在しない場合はデフォルト設定を使用）
    let config = match AppConfig::from_file("config.toml") {
        Ok(config) => {
            tracing::info!("Loaded configuration from config.toml");
            config
        }
        Err(e) => {
            tracing::warn!("Failed to load config.toml: {:?}, using defaults", e);
            AppConfig::default()
        }
    };

    // 設定の検証（失敗は致命的）
    config.validate()?;

    tracing::info!("Configuration validated successfully");
    tracing::info!(
        "Belt: initial {}mm/s, retention {}s",
        config.belt.initial_speed_mm_s,
        config.belt.retention_window_secs
    );
    tracing::info!(
        "Actuators: {} sorters, {} jets; classification mode={}, hardware mode={}",
        config.actuators.sorters.len(),
        config.actuators.jets.len(),
        config.classification.mode,
        config.hardware.mode
    );

    // 認識アダプタの選択
    let recognizer: Box<dyn RecognizerPort> = match config.classification.mode.as_str() {
        "http" => {
            tracing::info!(
                "Initializing HTTP recognizer: {}",
                config.classification.endpoint
            );
            Box::new(HttpRecognizerAdapter::new(&config.classification)?)
        }
        _ => {
            // 対応表の先頭エントリを返すモック（デモ用）
            let identity = config
                .classification
                .bin_table
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "unknown-part".to_string());
            tracing::info!("Initializing mock recognizer (identity '{}')", identity);
            Box::new(MockRecognizer::with_identity(&identity, 0.9))
        }
    };

    // デバイスリンクの構築
    let mut links: Vec<(String, Box<dyn LinkPort>)> = Vec::new();
    for device in &config.hardware.devices {
        let link: Box<dyn LinkPort> = match config.hardware.mode.as_str() {
            "serial" => {
                tracing::info!("Initializing serial link: {} -> {}", device.id, device.path);
                Box::new(SerialLinkAdapter::new(device))
            }
            _ => {
                tracing::info!("Initializing mock link: {}", device.id);
                Box::new(MockLink::always_ack())
            }
        };
        links.push((device.id.clone(), link));
    }

    // パイプラインの起動
    let controller = SortProcessController::start(&config, recognizer, links)?;

    // フルモック構成ではデモ用の擬似検出フィードを流す
    let _mock_source = if config.classification.mode != "http" && config.hardware.mode != "serial"
    {
        tracing::info!("Starting mock detection source (demo mode)");
        Some(MockDetectionSource::spawn(
            controller.detections(),
            controller.clock().clone(),
            Duration::from_secs(2),
            config.pairing.view_offset_mm,
        ))
    } else {
        None
    };

    // イベントループ（停止まで完了・障害イベントをログする）
    let events = controller.events().clone();
    while controller.is_running() {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(SortEvent::Completed(completion)) => {
                tracing::info!(
                    "Completed: group {} '{}' -> sorter {} bin {} ({} ppm)",
                    completion.group_id,
                    completion.identity,
                    completion.sorter,
                    completion.bin,
                    completion.ppm_count
                );
            }
            Ok(SortEvent::Skipped { group_id, reason }) => {
                tracing::info!("Skipped: group {} ({})", group_id, reason.as_str());
            }
            Ok(SortEvent::DeviceFaulted(fault)) => {
                tracing::error!("Device fault: {} ({})", fault.device_id, fault.detail);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}
