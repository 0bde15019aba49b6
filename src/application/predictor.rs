//! 位置予測モジュール
//!
//! SpeedTimelineを用いてトラッキング対象の将来位置と
//! アクチュエータ到達時刻（ETA）を外挿します。
//!
//! 距離・位置の単位は設定されたアクチュエータオフセットと同じ線形単位（mm）。
//! アクチュエータオフセット自体は設置ごとに静的で、設定から供給される。

use std::sync::{Arc, Mutex};

use crate::application::speed_timeline::SpeedTimeline;
use crate::domain::Timestamp;

/// 位置予測器
///
/// タイムラインを共有参照で保持する。スケジューラの再計算パスと
/// 同じタイムラインを見るため `Arc<Mutex<_>>` で渡される。
#[derive(Clone)]
pub struct PositionPredictor {
    timeline: Arc<Mutex<SpeedTimeline>>,
}

impl PositionPredictor {
    pub fn new(timeline: Arc<Mutex<SpeedTimeline>>) -> Self {
        Self { timeline }
    }

    /// 共有タイムラインへの参照を取得
    pub fn timeline(&self) -> &Arc<Mutex<SpeedTimeline>> {
        &self.timeline
    }

    /// 時刻`t`におけるベルト座標位置を外挿
    ///
    /// `initial_position + distance_between(initial_time, t)`
    pub fn position_at(
        &self,
        initial_position: f64,
        initial_time: Timestamp,
        t: Timestamp,
    ) -> f64 {
        let timeline = self.timeline.lock().unwrap_or_else(|e| e.into_inner());
        initial_position + timeline.distance_between(initial_time, t)
    }

    /// 指定ベルト座標への到達予測時刻（ETA）を計算
    ///
    /// # Returns
    /// - `Some(t)`: 到達予測時刻
    /// - `None`: ベルト停止が維持されており到達不能（速度サンプル待ち）
    pub fn eta_at(
        &self,
        initial_position: f64,
        initial_time: Timestamp,
        target_distance: f64,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let timeline = self.timeline.lock().unwrap_or_else(|e| e.into_inner());
        let current = initial_position + timeline.distance_between(initial_time, now);
        timeline.time_to_reach(now, target_distance - current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SpeedSample;

    fn predictor_with_reference_timeline() -> PositionPredictor {
        let mut timeline = SpeedTimeline::new(60.0);
        timeline.record(SpeedSample {
            timestamp: 0.0,
            speed: 10.0,
        });
        timeline.record(SpeedSample {
            timestamp: 5.0,
            speed: 20.0,
        });
        PositionPredictor::new(Arc::new(Mutex::new(timeline)))
    }

    #[test]
    fn test_position_at() {
        let predictor = predictor_with_reference_timeline();
        // t=0に位置100mmで検出。t=10までに150mm進む
        assert_eq!(predictor.position_at(100.0, 0.0, 10.0), 250.0);
        assert_eq!(predictor.position_at(100.0, 0.0, 5.0), 150.0);
    }

    #[test]
    fn test_eta_at() {
        let predictor = predictor_with_reference_timeline();
        // t=0に位置0mm。目標50mm → t=5（速度変化点ちょうど）
        assert_eq!(predictor.eta_at(0.0, 0.0, 50.0, 0.0), Some(5.0));
        // 目標75mm → 6.25
        assert_eq!(predictor.eta_at(0.0, 0.0, 75.0, 0.0), Some(6.25));
    }

    #[test]
    fn test_eta_already_past_target() {
        let predictor = predictor_with_reference_timeline();
        // t=10時点で位置150mm、目標100mmは通過済み → 即時
        assert_eq!(predictor.eta_at(0.0, 0.0, 100.0, 10.0), Some(10.0));
    }

    #[test]
    fn test_eta_reflects_new_samples() {
        let predictor = predictor_with_reference_timeline();
        let before = predictor.eta_at(0.0, 0.0, 150.0, 6.0).unwrap();

        // 減速サンプルが届くとETAは後ろへずれる
        predictor
            .timeline()
            .lock()
            .unwrap()
            .record(SpeedSample {
                timestamp: 6.0,
                speed: 10.0,
            });
        let after = predictor.eta_at(0.0, 0.0, 150.0, 6.0).unwrap();
        assert!(after > before);
    }
}
