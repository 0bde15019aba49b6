/// モックリンクアダプタ
///
/// テスト・開発用のリンク実装。送信フレームを記録し、ACK応答を
/// スクリプトで制御できる。実際のシリアル送信は行わない。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{LinkPort, SortError, SortResult, COMMAND_FRAME_LEN};

/// モックリンクアダプタ
pub struct MockLink {
    connected: bool,
    /// 送信されたフレームの記録（テストから参照する）
    sent: Arc<Mutex<Vec<[u8; COMMAND_FRAME_LEN]>>>,
    /// ACK応答のスクリプト（true=ACK受信、false=タイムアウト）
    ///
    /// 空になった後は常にACKを返す。
    ack_script: VecDeque<bool>,
}

impl MockLink {
    /// 常にACKを返すリンクを作成
    pub fn always_ack() -> Self {
        Self::with_ack_script(Vec::new())
    }

    /// ACK応答スクリプト付きのリンクを作成
    ///
    /// # Arguments
    /// * `script` - recv_ack呼び出しごとの応答列。消費し尽くすと常にACK
    pub fn with_ack_script(script: Vec<bool>) -> Self {
        Self {
            connected: true,
            sent: Arc::new(Mutex::new(Vec::new())),
            ack_script: script.into(),
        }
    }

    /// 送信フレーム記録への共有ハンドルを取得
    pub fn sent_frames(&self) -> Arc<Mutex<Vec<[u8; COMMAND_FRAME_LEN]>>> {
        Arc::clone(&self.sent)
    }
}

impl LinkPort for MockLink {
    fn send_frame(&mut self, frame: &[u8; COMMAND_FRAME_LEN]) -> SortResult<()> {
        if !self.connected {
            return Err(SortError::Hardware("mock link disconnected".to_string()));
        }

        #[cfg(debug_assertions)]
        tracing::debug!("MockLink: sending frame {:02X?}", frame);

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(*frame);
        Ok(())
    }

    fn recv_ack(&mut self, _timeout: Duration) -> SortResult<bool> {
        if !self.connected {
            return Err(SortError::Hardware("mock link disconnected".to_string()));
        }
        Ok(self.ack_script.pop_front().unwrap_or(true))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reconnect(&mut self) -> SortResult<()> {
        self.connected = true;

        #[cfg(debug_assertions)]
        tracing::info!("MockLink: reconnected");

        Ok(())
    }
}
