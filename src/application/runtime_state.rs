//! ランタイム状態管理（Application層）
//!
//! 仕分け処理の実行中フラグとベルト停止フラグを管理します。
//! `Arc<AtomicBool>`を使用したロックフリー設計により、
//! 読み取り側スレッド（取り込み/ティック/ディスパッチ）は
//! 数CPUサイクルで状態を確認できます。

use std::sync::{atomic::{AtomicBool, Ordering}, Arc};

/// ランタイム状態（スレッド間で共有、ロックフリー）
///
/// # パフォーマンス特性
/// - 読み取り: `Ordering::Relaxed` - 数CPUサイクル、ロック不要
/// - 書き込み: コントローラのみが実行（低頻度）
/// - メモリオーダー: Relaxed - 厳密な順序保証は不要（少し古い値でも無害）
#[derive(Clone)]
pub struct RuntimeState {
    /// 仕分け処理の実行中フラグ（stop()で下ろす）
    running: Arc<AtomicBool>,
    /// ベルト停止フラグ（速度0の報告で立つ）
    belt_halted: Arc<AtomicBool>,
}

impl RuntimeState {
    /// 新しいRuntimeStateを作成（デフォルトで実行中）
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            belt_halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 実行中かどうかを確認（ロックフリー、超高速）
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// ベルトが停止中かどうかを確認（ロックフリー、超高速）
    #[inline]
    pub fn is_belt_halted(&self) -> bool {
        self.belt_halted.load(Ordering::Relaxed)
    }

    /// 実行を停止する
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// ベルト停止フラグを設定する
    pub fn set_belt_halted(&self, halted: bool) {
        self.belt_halted.store(halted, Ordering::Relaxed);
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
