/// HTTP認識アダプタ
///
/// reqwestを使用した外部視覚分類サービスのクライアント実装。
/// 分類ワーカースレッドのみが呼び出すため、ブロッキングクライアント
/// を使用する。タイムアウト・非2xx・不正ペイロードはすべて
/// `SortError::Classification` として返す（再試行は行わない）。

use serde::{Deserialize, Serialize};

use crate::domain::{
    ClassificationConfig, RecognitionResponse, RecognizerPort, SortError, SortResult,
};

/// 認識リクエストのペイロード
#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image_uri: &'a str,
}

/// 認識サービスのレスポンスペイロード
#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    identity: String,
    confidence: f64,
    #[serde(default)]
    category: String,
    #[serde(default)]
    image_url: Option<String>,
}

/// HTTP認識アダプタ
pub struct HttpRecognizerAdapter {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpRecognizerAdapter {
    /// 新しいHTTP認識アダプタを作成
    ///
    /// # Arguments
    /// * `config` - 検証済みの分類設定（エンドポイントとタイムアウトを使用）
    pub fn new(config: &ClassificationConfig) -> SortResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                SortError::Classification(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl RecognizerPort for HttpRecognizerAdapter {
    fn recognize(&mut self, crop_uri: &str) -> SortResult<RecognitionResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RecognizeRequest {
                image_uri: crop_uri,
            })
            .send()
            .map_err(|e| {
                SortError::Classification(format!("recognition request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SortError::Classification(format!(
                "recognition service returned {}",
                status
            )));
        }

        let payload: RecognizeResponse = response.json().map_err(|e| {
            SortError::Classification(format!("malformed recognition payload: {}", e))
        })?;

        #[cfg(debug_assertions)]
        tracing::debug!(
            "Recognized '{}' (confidence {:.2})",
            payload.identity,
            payload.confidence
        );

        Ok(RecognitionResponse {
            identity: payload.identity,
            confidence: payload.confidence,
            category: payload.category,
            image_url: payload.image_url,
        })
    }
}
