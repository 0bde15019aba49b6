/// モック検出ソース
///
/// デモ実行用の擬似2ビュー検出フィード。一定間隔で上面・側面の
/// 検出ペアを生成してコントローラへ送信する。カメラ・検出器なしで
/// パイプライン全体の動作を確認できる。

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::domain::{BoundingBox, CameraView, Centroid, Detection, MonotonicClock};

/// モック検出ソース
///
/// Dropで生成スレッドを停止する。
pub struct MockDetectionSource {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockDetectionSource {
    /// 部品が検出されるベルト座標（ビュー入口付近）
    const ENTRY_BELT_X: f64 = 150.0;

    /// 検出生成スレッドを起動する
    ///
    /// # Arguments
    /// * `detection_tx` - コントローラの検出入力
    /// * `clock` - コントローラと共有する単調クロック
    /// * `interval` - 部品の投入間隔
    /// * `view_offset_mm` - 側面カメラのベルト座標オフセット（設定と一致させる）
    pub fn spawn(
        detection_tx: Sender<Vec<Detection>>,
        clock: MonotonicClock,
        interval: Duration,
        view_offset_mm: f64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let mut part_no: u64 = 0;

            tracing::info!("Mock detection source started ({:?} interval)", interval);

            while !stop_flag.load(Ordering::Relaxed) {
                part_no += 1;
                let now = clock.now();
                // 両ビューが同一ベルト座標を指すようにビュー内座標を調整する
                let frame = vec![
                    Self::detection(CameraView::Top, Self::ENTRY_BELT_X, now, part_no),
                    Self::detection(
                        CameraView::Side,
                        Self::ENTRY_BELT_X - view_offset_mm,
                        now,
                        part_no,
                    ),
                ];
                if detection_tx.send(frame).is_err() {
                    break;
                }
                std::thread::sleep(interval);
            }

            tracing::info!("Mock detection source stopped");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn detection(view: CameraView, x: f64, timestamp: f64, part_no: u64) -> Detection {
        Detection {
            view,
            timestamp,
            centroid: Centroid { x, y: 0.0 },
            bounding_box: BoundingBox {
                x: x - 5.0,
                y: -5.0,
                width: 10.0,
                height: 10.0,
            },
            confidence: 0.9,
            image_uri: Some(format!("crop://mock/part-{}", part_no)),
        }
    }
}

impl Drop for MockDetectionSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_emits_two_view_frames() {
        let (tx, rx) = unbounded();
        let source = MockDetectionSource::spawn(
            tx,
            MonotonicClock::new(),
            Duration::from_millis(10),
            120.0,
        );

        let frame = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame[0].view, CameraView::Top);
        assert_eq!(frame[1].view, CameraView::Side);
        assert_eq!(frame[0].image_uri, frame[1].image_uri);
        // 両ビューは同一ベルト座標を指す
        assert_eq!(frame[0].centroid.x, frame[1].centroid.x + 120.0);

        drop(source);
    }
}
