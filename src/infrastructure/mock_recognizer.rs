/// モック認識アダプタ
///
/// テスト・開発用の認識実装。固定の識別結果または固定エラーを返し、
/// 呼び出し回数を記録する。外部サービスへのアクセスは行わない。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{RecognitionResponse, RecognizerPort, SortError, SortResult};

/// モック認識アダプタ
pub struct MockRecognizer {
    identity: String,
    category: String,
    confidence: f64,
    /// Someの場合は常にこのメッセージで失敗する
    failure: Option<String>,
    /// 応答前に挿入する遅延（認識サービスの所要時間の模擬）
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockRecognizer {
    /// 固定の識別結果を返すモックを作成
    pub fn with_identity(identity: &str, confidence: f64) -> Self {
        Self::with_identity_and_category(identity, identity, confidence)
    }

    /// 識別名とカテゴリを個別に指定したモックを作成
    pub fn with_identity_and_category(identity: &str, category: &str, confidence: f64) -> Self {
        Self {
            identity: identity.to_string(),
            category: category.to_string(),
            confidence,
            failure: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 常に失敗するモックを作成
    pub fn failing(message: &str) -> Self {
        Self {
            identity: String::new(),
            category: String::new(),
            confidence: 0.0,
            failure: Some(message.to_string()),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 各応答の前に遅延を挿入する
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 呼び出し回数カウンタへの共有ハンドルを取得
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl RecognizerPort for MockRecognizer {
    fn recognize(&mut self, crop_uri: &str) -> SortResult<RecognitionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        #[cfg(debug_assertions)]
        tracing::debug!("MockRecognizer: recognize({})", crop_uri);

        #[cfg(not(debug_assertions))]
        let _ = crop_uri;

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if let Some(message) = &self.failure {
            return Err(SortError::Classification(message.clone()));
        }

        Ok(RecognitionResponse {
            identity: self.identity.clone(),
            confidence: self.confidence,
            category: self.category.clone(),
            image_url: None,
        })
    }
}
