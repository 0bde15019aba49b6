//! 検出ペアリングモジュール
//!
//! 2カメラのフレーム検出をトラッキンググループへ融合し、
//! 生成から確定までのライフサイクルを管理します。
//!
//! # 状態機械（グループごと）
//! `Open → AwaitingSecondView → ReadyToFinalize → Finalized`
//!
//! 着信検出は、最後に更新されたグループから順に、反対ビューの最終検出を
//! PositionPredictorで現在時刻へ外挿した予測位置と照合される。
//! 許容距離内なら既存グループへ追加、そうでなければ新規グループを開く。

use crate::application::predictor::PositionPredictor;
use crate::domain::{
    CameraView, Detection, DetectionPair, GroupId, GroupState, PairingConfig, SkipSortReason,
    Timestamp, TrackedGroup,
};

/// 検出ペアラー
///
/// アクティブなグループ集合を排他的に所有する。取り込みは
/// フレームレートで呼ばれるが計算量は O(アクティブグループ数)。
pub struct DetectionPairer {
    config: PairingConfig,
    predictor: PositionPredictor,
    active: Vec<TrackedGroup>,
    next_id: GroupId,
}

impl DetectionPairer {
    pub fn new(config: PairingConfig, predictor: PositionPredictor) -> Self {
        Self {
            config,
            predictor,
            active: Vec::new(),
            next_id: 1,
        }
    }

    /// アクティブなグループ数
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// ビュー内座標をベルト座標へ変換
    ///
    /// 側面カメラは上面カメラより下流にあるため、設定オフセットを加算する。
    fn belt_x(&self, detection: &Detection) -> f64 {
        match detection.view {
            CameraView::Top => detection.centroid.x,
            CameraView::Side => detection.centroid.x + self.config.view_offset_mm,
        }
    }

    /// 1フレーム分の検出をまとめて取り込む
    ///
    /// 同一ビュー内の近接重複は信頼度の最も高いものだけを残してから
    /// 個別に取り込む。
    pub fn ingest_frame(&mut self, detections: Vec<Detection>) {
        for detection in self.dedup_frame(detections) {
            self.ingest(detection);
        }
    }

    /// 同一フレーム内の重複検出を排除
    fn dedup_frame(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
        for det in detections {
            let duplicate_of = kept.iter().position(|k| {
                k.view == det.view
                    && (k.centroid.x - det.centroid.x).hypot(k.centroid.y - det.centroid.y)
                        <= self.config.duplicate_radius_mm
            });
            match duplicate_of {
                Some(idx) => {
                    if det.confidence > kept[idx].confidence {
                        kept[idx] = det;
                    }
                }
                None => kept.push(det),
            }
        }
        kept
    }

    /// 1件の検出を取り込む
    ///
    /// 照合順序は最終更新の新しいグループ優先。許容距離内の最初の
    /// グループに追加し、見つからなければ新規グループを開く。
    pub fn ingest(&mut self, detection: Detection) {
        let det_x = self.belt_x(&detection);
        let det_t = detection.timestamp;

        // 最終更新の新しい順にインデックスを並べる
        let mut order: Vec<usize> = (0..self.active.len())
            .filter(|&i| {
                matches!(
                    self.active[i].state,
                    GroupState::Open | GroupState::AwaitingSecondView
                )
            })
            .collect();
        order.sort_by(|&a, &b| {
            self.active[b]
                .last_update
                .total_cmp(&self.active[a].last_update)
        });

        for i in order {
            let other_view = detection.view.other();
            let (anchor_x, anchor_t, cross_view) = {
                let group = &self.active[i];
                match group.last_detection(other_view) {
                    Some(anchor) => (self.belt_x(anchor), anchor.timestamp, true),
                    // 反対ビューの検出が無いグループは同一ビューの
                    // 最終検出から外挿する（片側ビューのみの延伸）
                    None => match group.last_detection(detection.view) {
                        Some(anchor) => (self.belt_x(anchor), anchor.timestamp, false),
                        None => continue,
                    },
                }
            };

            let predicted = self.predictor.position_at(anchor_x, anchor_t, det_t);
            if (det_x - predicted).abs() > self.config.tolerance_mm {
                continue;
            }

            let group = &mut self.active[i];
            if cross_view {
                // 最新ペアの空きスロットを埋めるか、新しいペアを開く
                let last = group
                    .pairs
                    .last_mut()
                    .filter(|p| p.get(detection.view).is_none());
                match last {
                    Some(pair) => pair.set(detection),
                    None => group.pairs.push(DetectionPair::from_single(detection)),
                }
            } else {
                group.pairs.push(DetectionPair::from_single(detection));
            }

            group.last_update = det_t;
            group.state = if group.pairs.last().map(|p| p.is_complete()).unwrap_or(false) {
                GroupState::Open
            } else {
                GroupState::AwaitingSecondView
            };
            return;
        }

        // 許容距離内のグループなし: 新規グループを開く
        let id = self.next_id;
        self.next_id += 1;
        let group = TrackedGroup::from_detection(id, det_x, detection);

        #[cfg(debug_assertions)]
        tracing::debug!(
            "New tracked group {} opened at belt_x={:.1}mm",
            id,
            group.initial_position
        );

        self.active.push(group);
    }

    /// 確定条件を満たしたグループを回収する
    ///
    /// 条件: 最新検出が画面外境界を越えた、またはアイドルタイムアウト。
    /// 確定時に分類用ペア（クロスビュー整列誤差最小）を選択し、
    /// アクティブセットから除去して返す。
    pub fn poll_finalized(&mut self, now: Timestamp) -> Vec<TrackedGroup> {
        let idle_timeout = self.config.idle_timeout().as_secs_f64();
        let boundary = self.config.offscreen_boundary_mm;

        let mut finalized = Vec::new();
        let mut i = 0;
        while i < self.active.len() {
            let ready = {
                let group = &self.active[i];
                let beyond_boundary = group
                    .newest_detection()
                    .map(|d| self.belt_x(d) > boundary)
                    .unwrap_or(false);
                let idle = now - group.last_update >= idle_timeout;
                beyond_boundary || idle
            };

            if !ready {
                i += 1;
                continue;
            }

            let mut group = self.active.swap_remove(i);
            group.state = GroupState::ReadyToFinalize;
            self.finalize(&mut group);
            finalized.push(group);
        }
        finalized
    }

    /// グループを確定する
    ///
    /// 完結ペアが1つも無ければ single-view-only としてマークする。
    fn finalize(&self, group: &mut TrackedGroup) {
        group.index_used_to_classify = self.best_pair_index(group);
        if group.index_used_to_classify.is_none() {
            group.skip_sort_reason = Some(SkipSortReason::SingleViewOnly);
        }
        group.state = GroupState::Finalized;

        #[cfg(debug_assertions)]
        tracing::debug!(
            "Group {} finalized: pairs={}, classify_index={:?}, skip={:?}",
            group.id,
            group.pairs.len(),
            group.index_used_to_classify,
            group.skip_sort_reason.map(|r| r.as_str())
        );
    }

    /// クロスビュー整列誤差が最小の完結ペアを選択
    ///
    /// 誤差 = 上面検出を側面検出の時刻へ外挿した位置と、側面検出の
    /// ベルト座標との差。カメラ間の撮像時刻差を速度タイムラインで補正する。
    fn best_pair_index(&self, group: &TrackedGroup) -> Option<usize> {
        group
            .pairs
            .iter()
            .enumerate()
            .filter_map(|(idx, pair)| {
                let top = pair.top.as_ref()?;
                let side = pair.side.as_ref()?;
                let predicted =
                    self.predictor
                        .position_at(self.belt_x(top), top.timestamp, side.timestamp);
                Some((idx, (self.belt_x(side) - predicted).abs()))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx)
    }
}
