//! 設定管理
//!
//! TOML設定ファイルの読み込みとDomain型への変換。
//! 設定エラーは起動時に致命的であり、実行時の回復は行わない。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::{BinAssignment, SortError, SortResult};

/// アプリケーション設定のルート構造
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AppConfig {
    /// ベルト速度タイムライン設定
    pub belt: BeltConfig,
    /// 検出ペアリング設定
    pub pairing: PairingConfig,
    /// アクチュエータ配置設定
    pub actuators: ActuatorsConfig,
    /// 外部分類サービス設定
    pub classification: ClassificationConfig,
    /// ハードウェアリンク設定
    pub hardware: HardwareConfig,
    /// スケジューラ設定
    pub scheduler: SchedulerConfig,
    /// 統計・レート計測設定
    #[serde(default)]
    pub stats: StatsConfig,
}

/// ベルト速度タイムライン設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BeltConfig {
    /// 速度サンプルの保持ウィンドウ（秒）
    ///
    /// これより古いサンプルは破棄される
    /// デフォルト: 60秒
    pub retention_window_secs: f64,

    /// 起動時に記録する初期ベルト速度（mm/秒）
    ///
    /// テレメトリの最初のサンプルが届くまでこの速度が使われる
    /// デフォルト: 150.0
    pub initial_speed_mm_s: f64,
}

impl BeltConfig {
    /// デフォルトの保持ウィンドウ（秒）
    pub const DEFAULT_RETENTION_SECS: f64 = 60.0;
    /// デフォルトの初期速度（mm/秒）
    pub const DEFAULT_INITIAL_SPEED: f64 = 150.0;
}

impl Default for BeltConfig {
    fn default() -> Self {
        Self {
            retention_window_secs: Self::DEFAULT_RETENTION_SECS,
            initial_speed_mm_s: Self::DEFAULT_INITIAL_SPEED,
        }
    }
}

/// 検出ペアリング設定
///
/// 許容距離とビュー間オフセットはカメラ幾何とベルト速度で決まる
/// ポリシー値。マジックナンバーを避けるため設定として外出しする。
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PairingConfig {
    /// クロスビュー照合の許容距離（mm）
    ///
    /// 予測位置と実検出位置の差がこの距離以内ならば同一オブジェクトとみなす
    /// デフォルト: 25.0
    pub tolerance_mm: f64,

    /// 側面カメラの上面カメラに対する下流オフセット（mm）
    ///
    /// 側面ビューの検出X座標に加算してベルト座標へ変換する
    /// デフォルト: 0.0
    pub view_offset_mm: f64,

    /// 画面外境界（ベルト座標、mm）
    ///
    /// 最新検出がこの位置を越えたグループは確定待ちに遷移する
    pub offscreen_boundary_mm: f64,

    /// アイドルタイムアウト（ミリ秒）
    ///
    /// どちらのビューからも検出が追加されないままこの時間が経過した
    /// グループは確定待ちに遷移する
    /// デフォルト: 1500ms
    pub idle_timeout_ms: u64,

    /// 同一フレーム内の重複検出とみなす距離（mm）
    ///
    /// 同一ビュー・同一フレームでこの距離以内の検出は
    /// 最も信頼度の高いものだけを残す
    /// デフォルト: 5.0
    pub duplicate_radius_mm: f64,
}

impl PairingConfig {
    pub const DEFAULT_TOLERANCE_MM: f64 = 25.0;
    pub const DEFAULT_OFFSCREEN_BOUNDARY_MM: f64 = 600.0;
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1500;
    pub const DEFAULT_DUPLICATE_RADIUS_MM: f64 = 5.0;

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            tolerance_mm: Self::DEFAULT_TOLERANCE_MM,
            view_offset_mm: 0.0,
            offscreen_boundary_mm: Self::DEFAULT_OFFSCREEN_BOUNDARY_MM,
            idle_timeout_ms: Self::DEFAULT_IDLE_TIMEOUT_MS,
            duplicate_radius_mm: Self::DEFAULT_DUPLICATE_RADIUS_MM,
        }
    }
}

/// ソーターアームの配置
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SorterConfig {
    /// ソーターインデックス（ビン対応表から参照される）
    pub index: u8,
    /// 制御デバイスのID（[[hardware.devices]]を参照）
    pub device_id: String,
    /// カメラ基準位置からのオフセット（ベルト座標、mm）
    pub offset_mm: f64,
}

/// エアジェットの配置
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JetConfig {
    /// ジェットインデックス
    pub index: u8,
    /// 制御デバイスのID（[[hardware.devices]]を参照）
    pub device_id: String,
    /// カメラ基準位置からのオフセット（ベルト座標、mm）
    pub offset_mm: f64,
}

/// アクチュエータ配置設定
///
/// オフセットは設置ごとに静的であり、ここで供給される。
/// 欠落は起動時エラー（実行時に計算で補うことはしない）。
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ActuatorsConfig {
    /// ソーターアームのリスト
    pub sorters: Vec<SorterConfig>,
    /// エアジェットのリスト
    pub jets: Vec<JetConfig>,
}

impl ActuatorsConfig {
    /// 指定インデックスのソーターを取得
    pub fn sorter(&self, index: u8) -> Option<&SorterConfig> {
        self.sorters.iter().find(|s| s.index == index)
    }

    /// 指定インデックスのジェットを取得
    pub fn jet(&self, index: u8) -> Option<&JetConfig> {
        self.jets.iter().find(|j| j.index == index)
    }
}

/// ビン対応表のエントリ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct BinEntryConfig {
    /// ソーターインデックス
    pub sorter: u8,
    /// ビンインデックス
    pub bin: u8,
}

impl From<BinEntryConfig> for BinAssignment {
    fn from(entry: BinEntryConfig) -> Self {
        BinAssignment {
            sorter: entry.sorter,
            bin: entry.bin,
        }
    }
}

/// 外部分類サービス設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassificationConfig {
    /// 認識バックエンド
    ///
    /// 選択肢: "http" (外部認識サービス), "mock" (開発・テスト用)
    /// デフォルト: "mock"
    pub mode: String,

    /// 認識サービスのエンドポイントURL（mode = "http" の場合必須）
    #[serde(default)]
    pub endpoint: String,

    /// 認識呼び出しのタイムアウト（ミリ秒）
    ///
    /// デフォルト: 5000ms
    pub timeout_ms: u64,

    /// 部品識別子 → (ソーター, ビン) の対応表
    ///
    /// 存在しない識別子は正常な結果（unknown-part）として扱われる
    #[serde(default)]
    pub bin_table: BTreeMap<String, BinEntryConfig>,
}

impl ClassificationConfig {
    pub const MODE_HTTP: &'static str = "http";
    pub const MODE_MOCK: &'static str = "mock";
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            mode: Self::MODE_MOCK.to_string(),
            endpoint: String::new(),
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            bin_table: BTreeMap::new(),
        }
    }
}

/// シリアルデバイス設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceConfig {
    /// デバイスID（アクチュエータ設定から参照される）
    pub id: String,

    /// シリアルポートのパス（mode = "serial" の場合必須）
    ///
    /// 例: "/dev/ttyUSB0"
    #[serde(default)]
    pub path: String,

    /// ボーレート
    ///
    /// デフォルト: 115200
    pub baud_rate: u32,

    /// ACK待ちタイムアウト（ミリ秒）
    ///
    /// デフォルト: 250ms
    pub ack_timeout_ms: u64,

    /// ACKタイムアウト時のリトライ上限
    ///
    /// 超過するとデバイスはfaulted状態になり、明示的な復旧まで送出停止
    /// デフォルト: 3回
    pub max_retries: u32,
}

impl DeviceConfig {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 250;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            path: String::new(),
            baud_rate: Self::DEFAULT_BAUD_RATE,
            ack_timeout_ms: Self::DEFAULT_ACK_TIMEOUT_MS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }
}

/// ハードウェアリンク設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HardwareConfig {
    /// リンクバックエンド
    ///
    /// 選択肢: "serial" (serialport), "mock" (開発・テスト用)
    /// デフォルト: "mock"
    pub mode: String,

    /// 物理リンクのリスト（デバイスごとに1つ）
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    pub const MODE_SERIAL: &'static str = "serial";
    pub const MODE_MOCK: &'static str = "mock";

    /// 指定IDのデバイス設定を取得
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mode: Self::MODE_MOCK.to_string(),
            devices: Vec::new(),
        }
    }
}

/// スケジューラ設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    /// ティック間隔（ミリ秒）
    ///
    /// 発火時刻に達したアクションをディスパッチする周期
    /// デフォルト: 50ms（許容範囲: 10-1000ms）
    pub tick_interval_ms: u64,
}

impl SchedulerConfig {
    pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;
    pub const MIN_TICK_INTERVAL_MS: u64 = 10;
    pub const MAX_TICK_INTERVAL_MS: u64 = 1000;

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: Self::DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

/// 統計・レート計測設定
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatsConfig {
    /// 統計情報の出力間隔（秒）
    ///
    /// デフォルト: 10秒
    pub report_interval_sec: u64,

    /// ソートレートのローリングウィンドウ（秒）
    ///
    /// デフォルト: 600秒（10分）
    pub rate_window_secs: f64,
}

impl StatsConfig {
    pub const DEFAULT_REPORT_INTERVAL_SEC: u64 = 10;
    pub const DEFAULT_RATE_WINDOW_SECS: f64 = 600.0;

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_sec)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_sec: Self::DEFAULT_REPORT_INTERVAL_SEC,
            rate_window_secs: Self::DEFAULT_RATE_WINDOW_SECS,
        }
    }
}

impl AppConfig {
    /// TOMLファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> SortResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SortError::Configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| SortError::Configuration(format!("Failed to parse config file: {}", e)))
    }

    /// デフォルト設定をTOMLファイルに書き出す
    pub fn write_default<P: AsRef<Path>>(path: P) -> SortResult<()> {
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| SortError::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SortError::Configuration(format!("Failed to write config file: {}", e)))
    }

    /// 設定の妥当性を検証
    ///
    /// 不正な設定は起動時に致命的エラーとする（§実行時回復なし）。
    pub fn validate(&self) -> SortResult<()> {
        // ベルト設定の検証
        if self.belt.retention_window_secs <= 0.0 {
            return Err(SortError::Configuration(
                "Belt retention window must be greater than 0".to_string(),
            ));
        }
        if self.belt.initial_speed_mm_s < 0.0 {
            return Err(SortError::Configuration(
                "Initial belt speed must be non-negative".to_string(),
            ));
        }

        // ペアリング設定の検証
        if self.pairing.tolerance_mm <= 0.0 {
            return Err(SortError::Configuration(
                "Pairing tolerance must be greater than 0".to_string(),
            ));
        }
        if self.pairing.offscreen_boundary_mm <= 0.0 {
            return Err(SortError::Configuration(
                "Off-screen boundary must be greater than 0".to_string(),
            ));
        }
        if self.pairing.idle_timeout_ms == 0 {
            return Err(SortError::Configuration(
                "Pairing idle timeout must be greater than 0".to_string(),
            ));
        }

        // アクチュエータ設定の検証（オフセット欠落は致命的）
        if self.actuators.sorters.is_empty() {
            return Err(SortError::Configuration(
                "At least one sorter must be configured".to_string(),
            ));
        }
        if self.actuators.jets.is_empty() {
            return Err(SortError::Configuration(
                "At least one jet must be configured".to_string(),
            ));
        }
        for sorter in &self.actuators.sorters {
            if sorter.offset_mm <= 0.0 {
                return Err(SortError::Configuration(format!(
                    "Sorter {} offset must be greater than 0",
                    sorter.index
                )));
            }
            if self.hardware.device(&sorter.device_id).is_none() {
                return Err(SortError::Configuration(format!(
                    "Sorter {} references unknown device '{}'",
                    sorter.index, sorter.device_id
                )));
            }
        }
        for jet in &self.actuators.jets {
            if jet.offset_mm <= 0.0 {
                return Err(SortError::Configuration(format!(
                    "Jet {} offset must be greater than 0",
                    jet.index
                )));
            }
            if self.hardware.device(&jet.device_id).is_none() {
                return Err(SortError::Configuration(format!(
                    "Jet {} references unknown device '{}'",
                    jet.index, jet.device_id
                )));
            }
        }

        // ビン対応表の検証（存在しないソーターへの参照は致命的）
        for (identity, entry) in &self.classification.bin_table {
            if self.actuators.sorter(entry.sorter).is_none() {
                return Err(SortError::Configuration(format!(
                    "Bin table entry '{}' references unknown sorter {}",
                    identity, entry.sorter
                )));
            }
        }

        // 分類サービス設定の検証
        match self.classification.mode.as_str() {
            ClassificationConfig::MODE_HTTP => {
                if self.classification.endpoint.is_empty() {
                    return Err(SortError::Configuration(
                        "Classification endpoint is required in http mode".to_string(),
                    ));
                }
            }
            ClassificationConfig::MODE_MOCK => {}
            other => {
                return Err(SortError::Configuration(format!(
                    "Unknown classification mode '{}'",
                    other
                )));
            }
        }
        if self.classification.timeout_ms == 0 {
            return Err(SortError::Configuration(
                "Classification timeout must be greater than 0".to_string(),
            ));
        }

        // ハードウェア設定の検証
        match self.hardware.mode.as_str() {
            HardwareConfig::MODE_SERIAL => {
                for device in &self.hardware.devices {
                    if device.path.is_empty() {
                        return Err(SortError::Configuration(format!(
                            "Device '{}' requires a serial path in serial mode",
                            device.id
                        )));
                    }
                }
            }
            HardwareConfig::MODE_MOCK => {}
            other => {
                return Err(SortError::Configuration(format!(
                    "Unknown hardware mode '{}'",
                    other
                )));
            }
        }
        for device in &self.hardware.devices {
            if device.id.is_empty() {
                return Err(SortError::Configuration(
                    "Device id must not be empty".to_string(),
                ));
            }
            if device.ack_timeout_ms == 0 {
                return Err(SortError::Configuration(format!(
                    "Device '{}' ack timeout must be greater than 0",
                    device.id
                )));
            }
        }
        let mut ids: Vec<&str> = self.hardware.devices.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.hardware.devices.len() {
            return Err(SortError::Configuration(
                "Device ids must be unique".to_string(),
            ));
        }

        // スケジューラ設定の検証
        if self.scheduler.tick_interval_ms < SchedulerConfig::MIN_TICK_INTERVAL_MS
            || self.scheduler.tick_interval_ms > SchedulerConfig::MAX_TICK_INTERVAL_MS
        {
            return Err(SortError::Configuration(format!(
                "Scheduler tick interval must be between {} and {} ms",
                SchedulerConfig::MIN_TICK_INTERVAL_MS,
                SchedulerConfig::MAX_TICK_INTERVAL_MS
            )));
        }

        // 統計設定の検証
        if self.stats.rate_window_secs <= 0.0 {
            return Err(SortError::Configuration(
                "Rate window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
