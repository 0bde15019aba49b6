/// エラー型定義
///
/// Domain層の統一エラー型。thiserrorを使用して型安全なエラー処理を提供します。
///
/// # 設計方針
/// - unwrap()の使用を禁止し、明示的なエラーハンドリングを強制
/// - Result型でエラー伝播を明示化
/// - 回復可能性をエラー型で表現（Classification: 再試行せず記録のみ、
///   DeviceFaulted: 明示的な復旧操作が必要、Configuration: 起動時に致命的）

use thiserror::Error;

/// Domain層の統一エラー型
#[derive(Error, Debug)]
pub enum SortError {
    /// ペアリング関連のエラー
    #[error("Pairing error: {0}")]
    Pairing(String),

    /// 分類（外部認識サービス）関連のエラー
    ///
    /// タイムアウト・非2xx・不正ペイロードを含む。自動再試行は行わない
    /// （再試行時点では位置が古く意味がないため）。
    #[error("Classification error: {0}")]
    Classification(String),

    /// スケジューリング関連のエラー
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// ハードウェア通信（シリアルリンク）関連のエラー
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// デバイス障害（Non-recoverable）
    ///
    /// ACKリトライ上限超過でデバイスがfaulted状態。明示的な
    /// 復旧操作までそのデバイスへのスケジューリングは停止する。
    #[error("Device faulted: {0}")]
    DeviceFaulted(String),

    /// 設定関連のエラー（起動時に致命的、実行時には発生しない）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// タイムアウトエラー
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// その他のエラー
    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Domain層の統一Result型
pub type SortResult<T> = Result<T, SortError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SortError::Classification("timeout after 5000ms".to_string());
        assert_eq!(err.to_string(), "Classification error: timeout after 5000ms");

        let err = SortError::DeviceFaulted("sorter0".to_string());
        assert_eq!(err.to_string(), "Device faulted: sorter0");
    }
}
