//! 統計情報管理モジュール
//!
//! 仕分けレート（ppm）、各処理段階のレイテンシ、スキップ件数などの
//! 統計を収集・出力します。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::domain::{SkipSortReason, Timestamp};

/// 統計情報の種別（処理段階のレイテンシ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// 初回検出からグループ確定まで
    Finalize,
    /// グループ確定から分類結果受領まで
    Classification,
    /// 発火予定時刻から実ディスパッチ（ACK）まで
    Dispatch,
    /// 初回検出からジェット噴射ACKまで
    EndToEnd,
}

/// パーセンタイル統計値
#[derive(Debug, Clone)]
pub struct PercentileStats {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub count: usize,
}

/// 仕分けレートトラッカー
///
/// 完了イベントのタイムスタンプをローリングウィンドウで保持し、
/// 毎分仕分け数（parts per minute）を算出する。ウィンドウ境界の
/// トリムは記録時に行われる。
#[derive(Debug)]
pub struct SortRateTracker {
    completions: VecDeque<Timestamp>,
    window: f64,
}

impl SortRateTracker {
    /// # Arguments
    /// * `window_secs` - レート算出ウィンドウ（例: 600秒 = 10分）
    pub fn new(window_secs: f64) -> Self {
        Self {
            completions: VecDeque::new(),
            window: window_secs,
        }
    }

    /// 仕分け完了を記録し、その時点のppmを返す
    pub fn record(&mut self, at: Timestamp) -> u32 {
        self.completions.push_back(at);
        while let Some(&front) = self.completions.front() {
            if at - front > self.window {
                self.completions.pop_front();
            } else {
                break;
            }
        }
        self.rate()
    }

    /// 現在のppm（ウィンドウ内サンプルが2未満なら0）
    ///
    /// レートは実際にサンプルが張る時間幅から算出する。ウィンドウ幅で
    /// 割ると立ち上がり直後のレートが過小になるため。
    pub fn rate(&self) -> u32 {
        if self.completions.len() < 2 {
            return 0;
        }
        let first = *self.completions.front().unwrap_or(&0.0);
        let last = *self.completions.back().unwrap_or(&0.0);
        let minutes = (last - first) / 60.0;
        if minutes <= 0.0 {
            return 0;
        }
        (((self.completions.len() - 1) as f64) / minutes).round() as u32
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }
}

/// 統計情報コレクター
///
/// コントローラスレッドが所有し、各イベント処理時に記録する。
#[derive(Debug)]
pub struct SortStats {
    /// 各処理段階の所要時間（最大1000サンプル保持）
    durations: std::collections::HashMap<StageKind, VecDeque<Duration>>,
    /// 仕分け完了件数（累積）
    sorted_count: u64,
    /// スキップ件数（理由別、累積）
    skipped_single_view: u64,
    skipped_unknown: u64,
    skipped_failed: u64,
    /// デバイス障害回数
    fault_count: u64,
    /// 最後の統計出力時刻
    last_report: Instant,
    /// 統計出力間隔
    report_interval: Duration,
}

impl SortStats {
    /// 最大サンプル保持数（パーセンタイル計算用）
    const MAX_DURATION_SAMPLES: usize = 1000;

    /// # Arguments
    /// * `report_interval` - 統計出力間隔（例: 10秒）
    pub fn new(report_interval: Duration) -> Self {
        Self {
            durations: std::collections::HashMap::new(),
            sorted_count: 0,
            skipped_single_view: 0,
            skipped_unknown: 0,
            skipped_failed: 0,
            fault_count: 0,
            last_report: Instant::now(),
            report_interval,
        }
    }

    /// 処理段階の所要時間を記録
    pub fn record_duration(&mut self, kind: StageKind, duration: Duration) {
        let queue = self.durations.entry(kind).or_default();
        queue.push_back(duration);

        if queue.len() > Self::MAX_DURATION_SAMPLES {
            queue.pop_front();
        }
    }

    /// 仕分け完了をカウント
    pub fn record_sorted(&mut self) {
        self.sorted_count += 1;
    }

    /// スキップを理由別にカウント
    pub fn record_skipped(&mut self, reason: SkipSortReason) {
        match reason {
            SkipSortReason::SingleViewOnly => self.skipped_single_view += 1,
            SkipSortReason::UnknownPart => self.skipped_unknown += 1,
            SkipSortReason::ClassificationFailed => self.skipped_failed += 1,
        }
    }

    /// デバイス障害をカウント
    pub fn record_fault(&mut self) {
        self.fault_count += 1;
    }

    pub fn sorted_count(&self) -> u64 {
        self.sorted_count
    }

    /// パーセンタイル統計を計算
    ///
    /// # Returns
    /// パーセンタイル統計値。データがない場合は None
    pub fn percentile_stats(&self, kind: StageKind) -> Option<PercentileStats> {
        let queue = self.durations.get(&kind)?;
        if queue.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = queue.iter().copied().collect();
        sorted.sort();

        let count = sorted.len();
        let p50 = sorted[count * 50 / 100];
        let p95 = sorted[count * 95 / 100];
        let p99 = sorted[count * 99 / 100];

        Some(PercentileStats {
            p50,
            p95,
            p99,
            count,
        })
    }

    /// 統計レポートを出力すべきか判定
    pub fn should_report(&self) -> bool {
        self.last_report.elapsed() >= self.report_interval
    }

    /// 統計レポートを出力してタイマーをリセット
    pub fn report_and_reset(&mut self, current_ppm: u32) {
        use tracing::info;

        info!("=== Sort Statistics ===");
        info!("Rate: {} ppm", current_ppm);
        info!(
            "Sorted: {}, skipped: single-view={} unknown={} failed={}, faults: {}",
            self.sorted_count,
            self.skipped_single_view,
            self.skipped_unknown,
            self.skipped_failed,
            self.fault_count
        );

        for kind in [
            StageKind::Finalize,
            StageKind::Classification,
            StageKind::Dispatch,
            StageKind::EndToEnd,
        ] {
            if let Some(stats) = self.percentile_stats(kind) {
                info!(
                    "{:?}: p50={:.2}ms, p95={:.2}ms, p99={:.2}ms (n={})",
                    kind,
                    stats.p50.as_secs_f64() * 1000.0,
                    stats.p95.as_secs_f64() * 1000.0,
                    stats.p99.as_secs_f64() * 1000.0,
                    stats.count
                );
            }
        }

        info!("=======================");

        self.last_report = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_needs_two_samples() {
        let mut tracker = SortRateTracker::new(600.0);

        assert_eq!(tracker.rate(), 0);
        assert_eq!(tracker.record(10.0), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_rate_from_span() {
        let mut tracker = SortRateTracker::new(600.0);

        // 0秒・30秒・60秒に完了 → 2個/分
        tracker.record(0.0);
        tracker.record(30.0);
        assert_eq!(tracker.record(60.0), 2);
    }

    #[test]
    fn test_rate_window_trims_old_completions() {
        let mut tracker = SortRateTracker::new(600.0);

        tracker.record(0.0);
        tracker.record(30.0);
        // 0秒・30秒のサンプルはウィンドウ外に落ちる
        tracker.record(700.0);
        tracker.record(760.0);

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.rate(), 1);
    }

    #[test]
    fn test_simultaneous_completions_rate_zero() {
        let mut tracker = SortRateTracker::new(600.0);
        tracker.record(5.0);
        assert_eq!(tracker.record(5.0), 0);
    }

    #[test]
    fn test_percentile_stats() {
        let mut stats = SortStats::new(Duration::from_secs(10));

        for i in 0..100 {
            stats.record_duration(StageKind::Classification, Duration::from_millis(i));
        }

        let percentile = stats.percentile_stats(StageKind::Classification).unwrap();
        assert_eq!(percentile.count, 100);
        assert!(percentile.p50.as_millis() >= 45 && percentile.p50.as_millis() <= 55);
        assert!(percentile.p95.as_millis() >= 90 && percentile.p95.as_millis() <= 99);
        assert_eq!(percentile.p99.as_millis(), 99);
    }

    #[test]
    fn test_skip_counters_by_reason() {
        let mut stats = SortStats::new(Duration::from_secs(10));

        stats.record_skipped(SkipSortReason::UnknownPart);
        stats.record_skipped(SkipSortReason::UnknownPart);
        stats.record_skipped(SkipSortReason::SingleViewOnly);

        assert_eq!(stats.skipped_unknown, 2);
        assert_eq!(stats.skipped_single_view, 1);
        assert_eq!(stats.skipped_failed, 0);
    }

    #[test]
    fn test_should_report() {
        let stats = SortStats::new(Duration::from_millis(100));

        assert!(!stats.should_report());

        std::thread::sleep(Duration::from_millis(150));

        assert!(stats.should_report());
    }
}
