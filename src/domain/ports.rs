/// Port定義（Clean Architectureのインターフェース）
///
/// Domain層が外部実装に依存するための抽象trait。
/// Infrastructure層がこれらを実装し、Application層がDIで注入する。

use std::time::Duration;

use crate::domain::{DeviceCommand, RecognitionResponse, SortResult};

/// リンクポート: デバイスとのシリアル通信を抽象化
///
/// 1つの物理リンク（1デバイス）に対応する。送信とACK待ちは
/// HardwareDispatcherのデバイスワーカースレッドから逐次呼び出される。
pub trait LinkPort: Send {
    /// コマンドフレームを送信
    ///
    /// # Returns
    /// - `Ok(())`: 送信成功（ACKはまだ受信していない）
    /// - `Err(SortError)`: 送信エラー（リンク切断等）
    fn send_frame(&mut self, frame: &[u8; COMMAND_FRAME_LEN]) -> SortResult<()>;

    /// ACKを待ち受ける
    ///
    /// # Returns
    /// - `Ok(true)`: ACK受信
    /// - `Ok(false)`: タイムアウト（リトライ対象）
    /// - `Err(SortError)`: リンクエラー
    fn recv_ack(&mut self, timeout: Duration) -> SortResult<bool>;

    /// リンクの接続状態を確認
    fn is_connected(&self) -> bool;

    /// リンクの再接続を試行（明示的な復旧操作で呼ばれる）
    fn reconnect(&mut self) -> SortResult<()>;
}

/// 認識ポート: 外部の視覚分類サービス呼び出しを抽象化
///
/// 呼び出しはブロッキングで構わない。分類ワーカースレッドのみが
/// 使用するため、フレーム取り込みを妨げることはない。
pub trait RecognizerPort: Send {
    /// 切り出し画像を認識サービスへ送信し、識別結果を得る
    ///
    /// # Arguments
    /// - `crop_uri`: 分類対象の切り出し画像の参照
    ///
    /// # Returns
    /// - `Ok(RecognitionResponse)`: 認識成功
    /// - `Err(SortError::Classification)`: タイムアウト・非2xx・不正ペイロード
    fn recognize(&mut self, crop_uri: &str) -> SortResult<RecognitionResponse>;
}

/// コマンドフレーム長（バイト）
pub const COMMAND_FRAME_LEN: usize = 8;

/// フレームヘッダ
pub const FRAME_HEADER: u8 = 0xA5;

/// デバイスからのACKバイト
pub const ACK_BYTE: u8 = 0x06;

/// デバイスコマンドをワイヤフレームに変換するヘルパー
///
/// # フレーム構造（8バイト）
/// - [0]: ヘッダ (固定 0xA5)
/// - [1]: オペコード (0x01=move-to-bin, 0x02=fire-jet, 0x03=home,
///        0x04=conveyor-speed, 0x05=reset)
/// - [2]: インデックス引数（ビン/ジェット、他は0x00）
/// - [3-6]: 速度値 (f32, ビッグエンディアン、conveyor-speedのみ)
/// - [7]: チェックサム（[0-6]のXOR）
pub fn encode_command(command: &DeviceCommand) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[0] = FRAME_HEADER;

    match command {
        DeviceCommand::MoveToBin { bin } => {
            frame[1] = 0x01;
            frame[2] = *bin;
        }
        DeviceCommand::FireJet { jet } => {
            frame[1] = 0x02;
            frame[2] = *jet;
        }
        DeviceCommand::Home => {
            frame[1] = 0x03;
        }
        DeviceCommand::ConveyorSpeed { value } => {
            frame[1] = 0x04;
            let bytes = (*value as f32).to_be_bytes();
            frame[3..7].copy_from_slice(&bytes);
        }
        DeviceCommand::Reset => {
            frame[1] = 0x05;
        }
    }

    frame[7] = frame[..7].iter().fold(0u8, |acc, b| acc ^ b);
    frame
}
