//! 分類ゲートウェイ
//!
//! 確定グループの切り出し画像を認識サービスへ問い合わせ、
//! 識別結果を仕分け先ビンへ解決するワーカースレッドです。
//!
//! # 設計方針
//! - ブロッキングHTTPクライアントはワーカースレッドだけが所有し、
//!   フレーム取り込み側は送信のみでブロックしない
//! - 認識エラーは正常系として扱い再試行しない（部品は流れ続けるため、
//!   遅延した結果はいずれにせよ使えない）
//! - 結果は相関ID（グループID）付きでコントローラへ返送する

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::thread::JoinHandle;

use crate::domain::{
    BinAssignment, BinEntryConfig, GroupId, RecognitionResponse, RecognizerPort, SkipSortReason,
    SortError, SortResult,
};

/// 分類ジョブ
#[derive(Debug, Clone)]
pub struct ClassificationJob {
    pub group_id: GroupId,
    /// 分類に使うペアの切り出し画像参照
    pub crop_uri: String,
}

/// 分類結果
///
/// `Skipped` はエラーではなく通常の結果。コントローラはログと
/// カウントのみ行い、アクチュエーションしない。
#[derive(Debug, Clone)]
pub enum ClassificationOutcome {
    /// 識別成功かつビン割り当てあり
    Sorted {
        group_id: GroupId,
        response: RecognitionResponse,
        bin: BinAssignment,
    },
    /// 仕分けスキップ（未知部品・認識失敗）
    Skipped {
        group_id: GroupId,
        reason: SkipSortReason,
        identity: Option<String>,
    },
}

impl ClassificationOutcome {
    pub fn group_id(&self) -> GroupId {
        match self {
            Self::Sorted { group_id, .. } | Self::Skipped { group_id, .. } => *group_id,
        }
    }
}

/// 分類ゲートウェイ
///
/// `spawn` でワーカースレッドを起動し、ジョブを `submit` で投入する。
/// Dropでジョブチャネルを閉じてワーカーの終了を待つ。
pub struct ClassificationGateway {
    job_tx: Option<Sender<ClassificationJob>>,
    handle: Option<JoinHandle<()>>,
}

impl ClassificationGateway {
    /// ワーカースレッドを起動する
    ///
    /// # Arguments
    /// * `bin_table` - 識別名/カテゴリ → 仕分け先の対応表
    /// * `recognizer` - 認識ポート（ワーカーが所有）
    /// * `outcome_tx` - 結果の返送先（コントローラのイベントチャネル）
    pub fn spawn(
        bin_table: BTreeMap<String, BinEntryConfig>,
        recognizer: Box<dyn RecognizerPort>,
        outcome_tx: Sender<ClassificationOutcome>,
    ) -> Self {
        let (job_tx, job_rx) = unbounded::<ClassificationJob>();
        let handle = std::thread::spawn(move || {
            Self::worker_loop(job_rx, recognizer, bin_table, outcome_tx);
        });
        Self {
            job_tx: Some(job_tx),
            handle: Some(handle),
        }
    }

    /// ジョブを投入する
    pub fn submit(&self, job: ClassificationJob) -> SortResult<()> {
        self.job_tx
            .as_ref()
            .and_then(|tx| tx.send(job).ok())
            .ok_or_else(|| {
                SortError::Classification("classification worker is not running".to_string())
            })
    }

    /// ワーカーのメインループ
    ///
    /// ジョブチャネルの切断で終了する。
    fn worker_loop(
        job_rx: Receiver<ClassificationJob>,
        mut recognizer: Box<dyn RecognizerPort>,
        bin_table: BTreeMap<String, BinEntryConfig>,
        outcome_tx: Sender<ClassificationOutcome>,
    ) {
        tracing::info!("Classification worker started");

        while let Ok(job) = job_rx.recv() {
            let outcome = Self::classify(&mut *recognizer, &bin_table, &job);
            if outcome_tx.send(outcome).is_err() {
                // コントローラ側が終了済み
                break;
            }
        }

        tracing::info!("Classification worker stopped");
    }

    /// 1件の分類を実行する
    fn classify(
        recognizer: &mut dyn RecognizerPort,
        bin_table: &BTreeMap<String, BinEntryConfig>,
        job: &ClassificationJob,
    ) -> ClassificationOutcome {
        let response = match recognizer.recognize(&job.crop_uri) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Recognition failed for group {}: {}", job.group_id, e);
                return ClassificationOutcome::Skipped {
                    group_id: job.group_id,
                    reason: SkipSortReason::ClassificationFailed,
                    identity: None,
                };
            }
        };

        // 識別名を優先し、無ければカテゴリで対応表を引く
        let entry = bin_table
            .get(&response.identity)
            .or_else(|| bin_table.get(&response.category));

        match entry {
            Some(entry) => {
                #[cfg(debug_assertions)]
                tracing::debug!(
                    "Group {} classified as '{}' -> sorter {} bin {}",
                    job.group_id,
                    response.identity,
                    entry.sorter,
                    entry.bin
                );
                ClassificationOutcome::Sorted {
                    group_id: job.group_id,
                    bin: BinAssignment::from(*entry),
                    response,
                }
            }
            None => {
                tracing::info!(
                    "Group {}: no bin mapping for '{}', skipping",
                    job.group_id,
                    response.identity
                );
                ClassificationOutcome::Skipped {
                    group_id: job.group_id,
                    reason: SkipSortReason::UnknownPart,
                    identity: Some(response.identity),
                }
            }
        }
    }
}

impl Drop for ClassificationGateway {
    fn drop(&mut self) {
        // チャネルを閉じてワーカーを止める
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
