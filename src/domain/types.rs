/// コア型定義
///
/// Domain層の中心となるデータ構造。
/// すべての処理で共有される不変の型。
///
/// # 座標系
/// ベルト進行方向をX軸とするベルト座標系（ミリメートル）を全コンポーネントで共有する。
/// 検出座標・アクチュエータオフセット・許容距離はすべて同じ線形単位で表現される。

use std::time::Instant;

/// プロセス基準の単調タイムスタンプ（秒）
///
/// `MonotonicClock`の起点からの経過秒数。f64で保持することで
/// 速度タイムラインの区分積分・線形補間を純粋な数値演算として扱える。
pub type Timestamp = f64;

/// トラッキンググループの識別子
pub type GroupId = u64;

/// 単調クロック
///
/// `Instant`を起点として秒単位の`Timestamp`を供給する。
/// 各コンポーネントは`now`を引数で受け取るため、テストでは数値を直接渡せる。
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// 現在時刻を起点とするクロックを作成
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// 起点からの経過秒数を取得
    pub fn now(&self) -> Timestamp {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// カメラビューの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CameraView {
    /// 上面カメラ
    Top,
    /// 側面カメラ
    Side,
}

impl CameraView {
    /// 反対側のビューを取得
    pub fn other(&self) -> Self {
        match self {
            Self::Top => Self::Side,
            Self::Side => Self::Top,
        }
    }
}

/// 検出重心（ビュー内座標、mm）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    /// ベルト進行方向の座標
    pub x: f64,
    /// 進行方向と直交する座標（上面: 幅方向、側面: 高さ方向）
    pub y: f64,
}

/// 検出バウンディングボックス（ビュー内座標、mm）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 1フレーム・1ビュー分の検出結果
///
/// 生成後は不変。グループに取り込まれるまではDetectionPairerが所有する。
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// 検出元のビュー
    pub view: CameraView,
    /// 検出時刻
    pub timestamp: Timestamp,
    /// 重心座標
    pub centroid: Centroid,
    /// バウンディングボックス
    pub bounding_box: BoundingBox,
    /// 検出信頼度（0.0-1.0、同一フレーム内の重複排除に使用）
    pub confidence: f64,
    /// 切り出し画像の参照（分類リクエストに使用）
    pub image_uri: Option<String>,
}

/// 両ビューの検出ペア
///
/// 片側のみ埋まっている状態は `AwaitingSecondView` に対応する。
#[derive(Debug, Clone, Default)]
pub struct DetectionPair {
    pub top: Option<Detection>,
    pub side: Option<Detection>,
}

impl DetectionPair {
    /// 指定ビューのみ埋めたペアを作成
    pub fn from_single(detection: Detection) -> Self {
        let mut pair = Self::default();
        pair.set(detection);
        pair
    }

    /// 指定ビューのスロットに検出を格納
    pub fn set(&mut self, detection: Detection) {
        match detection.view {
            CameraView::Top => self.top = Some(detection),
            CameraView::Side => self.side = Some(detection),
        }
    }

    /// 指定ビューの検出を取得
    pub fn get(&self, view: CameraView) -> Option<&Detection> {
        match view {
            CameraView::Top => self.top.as_ref(),
            CameraView::Side => self.side.as_ref(),
        }
    }

    /// 両ビューが揃っているか
    pub fn is_complete(&self) -> bool {
        self.top.is_some() && self.side.is_some()
    }
}

/// グループのライフサイクル状態
///
/// 遷移: Open → AwaitingSecondView → ReadyToFinalize → Finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// 最新ペアが完結しており、次の検出を受け付け可能
    Open,
    /// 最新ペアの片側ビューが未充足
    AwaitingSecondView,
    /// 画面外境界通過またはタイムアウトにより確定待ち
    ReadyToFinalize,
    /// 確定済み（アクティブセットから除去される）
    Finalized,
}

/// 分類をスキップする理由
///
/// いずれも正常系の結果でありエラーではない（ログ・イベント通知のみ）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipSortReason {
    /// 片側ビューのみで確定した
    SingleViewOnly,
    /// 部品識別結果がビン対応表に存在しない
    UnknownPart,
    /// 認識サービス呼び出しに失敗した
    ClassificationFailed,
}

impl SkipSortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleViewOnly => "single-view-only",
            Self::UnknownPart => "unknown-part",
            Self::ClassificationFailed => "classification-failed",
        }
    }
}

/// ビン割り当て（部品識別結果から解決される）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinAssignment {
    /// ソーターアームのインデックス
    pub sorter: u8,
    /// ビンのインデックス
    pub bin: u8,
}

/// 外部認識サービスのレスポンス
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResponse {
    /// 部品識別子
    pub identity: String,
    /// 認識信頼度
    pub confidence: f64,
    /// 部品カテゴリ
    pub category: String,
    /// 認識サービス側の画像URL
    pub image_url: Option<String>,
}

/// 両ビューを横断するトラッキンググループ
///
/// 1つの物理オブジェクトに対応する。生存中の変更はDetectionPairer
/// によるペア追加のみで、認識結果はClassificationOutcomeが運ぶ。
#[derive(Debug, Clone)]
pub struct TrackedGroup {
    pub id: GroupId,
    /// 時系列順の検出ペア
    pub pairs: Vec<DetectionPair>,
    pub state: GroupState,
    /// 初回検出時のベルト座標（位置予測の基準点）
    pub initial_position: f64,
    /// 初回検出時刻（位置予測の基準時刻）
    pub initial_time: Timestamp,
    /// 最後に検出が追加された時刻
    pub last_update: Timestamp,
    /// 分類に使用したペアのインデックス（確定時に選択）
    pub index_used_to_classify: Option<usize>,
    /// 分類スキップの理由
    pub skip_sort_reason: Option<SkipSortReason>,
}

impl TrackedGroup {
    /// 最初の検出からグループを作成
    pub fn from_detection(id: GroupId, belt_x: f64, detection: Detection) -> Self {
        let timestamp = detection.timestamp;
        Self {
            id,
            initial_position: belt_x,
            initial_time: timestamp,
            last_update: timestamp,
            pairs: vec![DetectionPair::from_single(detection)],
            state: GroupState::AwaitingSecondView,
            index_used_to_classify: None,
            skip_sort_reason: None,
        }
    }

    /// 指定ビューの最新の検出を取得
    pub fn last_detection(&self, view: CameraView) -> Option<&Detection> {
        self.pairs.iter().rev().find_map(|p| p.get(view))
    }

    /// 最も新しい検出（ビュー不問）を取得
    pub fn newest_detection(&self) -> Option<&Detection> {
        self.pairs
            .iter()
            .flat_map(|p| [p.top.as_ref(), p.side.as_ref()])
            .flatten()
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
    }

    /// 両ビューが揃ったペアを一度でも持ったか
    pub fn has_complete_pair(&self) -> bool {
        self.pairs.iter().any(|p| p.is_complete())
    }
}

/// アクチュエータの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuatorKind {
    /// ソーターアームの移動
    SorterMove,
    /// エアジェットの噴射
    JetFire,
}

impl ActuatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SorterMove => "sorter-move",
            Self::JetFire => "jet-fire",
        }
    }
}

/// デバイスへのコマンド
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    /// 指定ビンの位置へソーターアームを移動
    MoveToBin { bin: u8 },
    /// 指定ジェットを噴射
    FireJet { jet: u8 },
    /// ホームポジションへ復帰
    Home,
    /// ベルト速度を指令
    ConveyorSpeed { value: f64 },
    /// デバイスをリセット
    Reset,
}

/// スケジュール済みアクチュエーション
///
/// SortProcessControllerが分類後に生成し、ActuationSchedulerが
/// ディスパッチまたはキャンセルまで排他的に所有する。
/// `fire_at`のみが再スケジュールアルゴリズムによって更新される。
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub group_id: GroupId,
    pub actuator: ActuatorKind,
    /// 送信先デバイス
    pub device_id: String,
    pub command: DeviceCommand,
    /// アクチュエータ位置（ベルト座標、mm）
    pub target_distance: f64,
    /// 発火予定時刻（速度変化時に再計算される）
    pub fire_at: Timestamp,
    /// 位置予測の基準（グループから引き継ぐ）
    pub initial_position: f64,
    pub initial_time: Timestamp,
}

/// ベルト速度サンプル
///
/// タイムスタンプ順・追記専用。次のサンプルが到着するまで
/// その速度が維持される（区分定数モデル）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub timestamp: Timestamp,
    /// ベルト速度（mm/秒）
    pub speed: f64,
}

/// リンクの健全性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    /// ACKリトライ上限超過。明示的な復旧操作まで送出停止
    Faulted,
}

/// デバイス障害イベント
#[derive(Debug, Clone)]
pub struct DeviceFault {
    pub device_id: String,
    pub detail: String,
    pub at: Timestamp,
}

/// ソート完了イベント（ログ/UI向けアウトバウンド）
#[derive(Debug, Clone)]
pub struct SortCompletion {
    pub group_id: GroupId,
    pub identity: String,
    pub sorter: u8,
    pub bin: u8,
    /// スケジュール時刻
    pub scheduled_at: Timestamp,
    /// ジェット噴射コマンドのACK受信時刻
    pub dispatched_at: Timestamp,
    /// 直近10分間のソートレート（parts per minute、四捨五入）
    pub ppm_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

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
            image_uri: None,
        }
    }

    #[test]
    fn test_camera_view_other() {
        assert_eq!(CameraView::Top.other(), CameraView::Side);
        assert_eq!(CameraView::Side.other(), CameraView::Top);
    }

    #[test]
    fn test_detection_pair_completion() {
        let mut pair = DetectionPair::from_single(detection(CameraView::Top, 100.0, 1.0));
        assert!(!pair.is_complete());
        assert!(pair.get(CameraView::Top).is_some());
        assert!(pair.get(CameraView::Side).is_none());

        pair.set(detection(CameraView::Side, 102.0, 1.1));
        assert!(pair.is_complete());
    }

    #[test]
    fn test_tracked_group_from_detection() {
        let group = TrackedGroup::from_detection(1, 100.0, detection(CameraView::Top, 100.0, 2.0));
        assert_eq!(group.state, GroupState::AwaitingSecondView);
        assert_eq!(group.initial_position, 100.0);
        assert_eq!(group.initial_time, 2.0);
        assert!(!group.has_complete_pair());
    }

    #[test]
    fn test_tracked_group_newest_detection() {
        let mut group =
            TrackedGroup::from_detection(1, 100.0, detection(CameraView::Top, 100.0, 2.0));
        group.pairs[0].set(detection(CameraView::Side, 103.0, 2.3));
        group
            .pairs
            .push(DetectionPair::from_single(detection(CameraView::Top, 150.0, 2.5)));

        let newest = group.newest_detection().unwrap();
        assert_eq!(newest.timestamp, 2.5);
        assert_eq!(newest.view, CameraView::Top);
        assert!(group.has_complete_pair());
    }

    #[test]
    fn test_skip_sort_reason_str() {
        assert_eq!(SkipSortReason::SingleViewOnly.as_str(), "single-view-only");
        assert_eq!(SkipSortReason::UnknownPart.as_str(), "unknown-part");
        assert_eq!(
            SkipSortReason::ClassificationFailed.as_str(),
            "classification-failed"
        );
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let t0 = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t1 = clock.now();
        assert!(t1 > t0);
    }
}
