//! Infrastructure Layer
//!
//! Domain層のPort traitに対する具体的な実装を提供します。
//!
//! ## モジュール構成
//! - `serial_link`: serialportによるデバイスリンク実装
//! - `mock_link`: テスト・開発用のスクリプト応答リンク
//! - `http_recognizer`: reqwestによる認識サービスクライアント
//! - `mock_recognizer`: テスト・開発用の固定応答認識
//! - `mock_source`: デモ実行用の擬似検出フィード

pub mod http_recognizer;
pub mod mock_link;
pub mod mock_recognizer;
pub mod mock_source;
pub mod serial_link;
