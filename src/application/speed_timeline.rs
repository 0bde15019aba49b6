//! ベルト速度タイムライン
//!
//! テレメトリから届く速度サンプルを時系列で保持し、
//! 区分定数モデルで移動距離・到達時刻クエリに答えます。
//!
//! # モデル
//! 各サンプルの速度は、そのタイムスタンプから次のサンプルのタイムスタンプ
//! まで有効。最後のサンプルの速度は、新しいサンプルが届くまで無期限に
//! 維持されるとみなす（明示的な単純化ポリシー）。
//! 最初のサンプルより前の時刻には最初のサンプルの速度を適用する。

use std::collections::VecDeque;

use crate::domain::{SpeedSample, Timestamp};

/// 速度タイムライン
///
/// 追記専用。保持ウィンドウより古いサンプルは`record`時にトリムされる。
/// クエリは呼び出し時点のサンプル集合に対して決定的。
#[derive(Debug)]
pub struct SpeedTimeline {
    samples: VecDeque<SpeedSample>,
    /// サンプルの保持ウィンドウ（秒）
    retention_window: f64,
}

impl SpeedTimeline {
    /// 新しいタイムラインを作成
    ///
    /// # Arguments
    /// * `retention_window` - サンプル保持ウィンドウ（秒）
    pub fn new(retention_window: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            retention_window,
        }
    }

    /// 速度サンプルを記録
    ///
    /// タイムスタンプは厳密増加が不変条件。順序違反のサンプルは
    /// 警告ログの上で破棄する（履歴の書き換えは発火済みアクションと
    /// 矛盾するため受け付けない）。
    pub fn record(&mut self, sample: SpeedSample) {
        if let Some(last) = self.samples.back() {
            if sample.timestamp <= last.timestamp {
                tracing::warn!(
                    "Out-of-order speed sample dropped: t={:.3} <= last t={:.3}",
                    sample.timestamp,
                    last.timestamp
                );
                return;
            }
        }

        self.samples.push_back(sample);
        self.trim(sample.timestamp);
    }

    /// 保持ウィンドウより古いサンプルを破棄
    ///
    /// 直近の速度を失わないよう、最後の1サンプルは常に残す。
    fn trim(&mut self, now: Timestamp) {
        let cutoff = now - self.retention_window;
        while self.samples.len() > 1 {
            // 先頭の次のサンプルがカットオフより古ければ、先頭区間は
            // もはやどのクエリにも掛からない
            let second_ts = self.samples[1].timestamp;
            if second_ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 記録済みサンプル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 最後に記録された速度
    pub fn current_speed(&self) -> Option<f64> {
        self.samples.back().map(|s| s.speed)
    }

    /// `[t0, t1)` の間にベルトが進む距離を計算
    ///
    /// 各区分定数セグメントについて `speed_i * overlap_i` を合算する。
    /// サンプルが無い場合は 0.0。`t1 <= t0` も 0.0（過去向きクエリは
    /// 発生しない想定だがエラーにはしない）。
    pub fn distance_between(&self, t0: Timestamp, t1: Timestamp) -> f64 {
        if t1 <= t0 || self.samples.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        let n = self.samples.len();
        for (i, sample) in self.samples.iter().enumerate() {
            // 最初のセグメントは過去方向にも延長する
            let seg_start = if i == 0 {
                f64::NEG_INFINITY
            } else {
                sample.timestamp
            };
            // 最後のセグメントは無期限に延長する
            let seg_end = if i + 1 < n {
                self.samples[i + 1].timestamp
            } else {
                f64::INFINITY
            };

            let lo = seg_start.max(t0);
            let hi = seg_end.min(t1);
            if hi > lo {
                total += sample.speed * (hi - lo);
            }
        }
        total
    }

    /// `t0` から距離 `distance` を進み切る時刻を計算
    ///
    /// セグメントごとに距離を累積し、目標距離に達するセグメント内で
    /// 線形補間して正確なタイムスタンプを返す。
    ///
    /// # Returns
    /// - `Some(t)`: 到達時刻
    /// - `None`: サンプルが無い、または維持速度が0で到達不能
    pub fn time_to_reach(&self, t0: Timestamp, distance: f64) -> Option<Timestamp> {
        if self.samples.is_empty() {
            return None;
        }
        if distance <= 0.0 {
            // すでに到達済み（通過済みのアクションは次のtickで即時発火する）
            return Some(t0);
        }

        let mut remaining = distance;
        let mut cursor = t0;
        let n = self.samples.len();

        // cursorを含むセグメントから歩き始める
        let start_idx = match self
            .samples
            .iter()
            .rposition(|s| s.timestamp <= cursor)
        {
            Some(idx) => idx,
            // t0が最初のサンプルより前: 最初のセグメントを過去方向に延長
            None => 0,
        };

        for i in start_idx..n {
            let speed = self.samples[i].speed;
            let seg_end = if i + 1 < n {
                self.samples[i + 1].timestamp
            } else {
                f64::INFINITY
            };

            if speed <= 0.0 {
                if seg_end.is_infinite() {
                    // ベルト停止が維持されている: 到達不能
                    return None;
                }
                cursor = seg_end;
                continue;
            }

            if seg_end.is_infinite() {
                // 最後のセグメント内で線形補間
                return Some(cursor + remaining / speed);
            }

            let capacity = speed * (seg_end - cursor);
            if capacity >= remaining {
                return Some(cursor + remaining / speed);
            }
            remaining -= capacity;
            cursor = seg_end;
        }

        None
    }
}
