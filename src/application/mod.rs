//! Application Layer
//!
//! 検出取り込みから仕分け完了までのユースケースを実装します。
//!
//! ## モジュール構成
//! - `speed_timeline`: ベルト速度履歴（区分定数モデル）
//! - `predictor`: タイムラインに基づく位置予測・到達時刻算出
//! - `pairing`: 2ビュー検出のグループ化と確定
//! - `classification`: 外部認識サービスへの問い合わせワーカー
//! - `scheduler`: 発火予定時刻順の優先度キューと周期ティック
//! - `dispatch`: デバイスごとのFIFOコマンド送出と障害管理
//! - `controller`: 全体の配線とライフサイクル制御
//! - `runtime_state`: ロックフリーの実行状態フラグ
//! - `stats`: 仕分けレート（ppm）とレイテンシ統計

pub mod classification;
pub mod controller;
pub mod dispatch;
pub mod pairing;
pub mod predictor;
pub mod runtime_state;
pub mod scheduler;
pub mod speed_timeline;
pub mod stats;
