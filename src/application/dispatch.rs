//! ハードウェア・ディスパッチャ
//!
//! デバイスごとに1本のワーカースレッドを持ち、コマンドを厳密な
//! FIFO順で送出します。デバイス間の通信は互いに独立して並行します。
//!
//! # 設計方針
//! - 送信→ACK待ちを1コマンドずつ完結させる（順序の入れ替えなし）
//! - タイムアウトはその場でリトライし、上限到達でデバイスを
//!   Faulted化。未完了コマンドは保持し、明示的な復旧まで待機する
//! - 障害フラグはAtomicBoolで公開し、コントローラはロックなしで
//!   スケジュール可否を判定できる

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::domain::{
    encode_command, ActuatorKind, DeviceCommand, DeviceConfig, DeviceFault, GroupId, LinkHealth,
    LinkPort, MonotonicClock, SortError, SortResult, Timestamp,
};

/// ワーカーへ渡す送出コマンド
///
/// スケジュール起点のコマンドは相関ID（グループ・アクチュエータ）を
/// 持ち、ACKイベントで完了追跡に使われる。直接指令（ホーム復帰等）は
/// 相関IDなし。
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub group_id: Option<GroupId>,
    pub actuator: Option<ActuatorKind>,
    pub command: DeviceCommand,
}

impl OutboundCommand {
    /// 相関IDなしの直接指令を作成
    pub fn direct(command: DeviceCommand) -> Self {
        Self {
            group_id: None,
            actuator: None,
            command,
        }
    }
}

/// ディスパッチ結果イベント（コントローラへ返送）
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// コマンドがACKされた
    Acked {
        device_id: String,
        group_id: Option<GroupId>,
        actuator: Option<ActuatorKind>,
        at: Timestamp,
    },
    /// デバイスが障害状態に遷移した
    Fault(DeviceFault),
}

/// ワーカーへの制御メッセージ
enum DeviceControl {
    /// 障害状態からの復旧を試行
    Recover,
    /// ワーカーを終了
    Shutdown,
}

/// デバイスワーカーのハンドル
struct DeviceHandle {
    command_tx: Sender<OutboundCommand>,
    control_tx: Sender<DeviceControl>,
    faulted: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// ハードウェア・ディスパッチャ
///
/// `add_device` で登録された各リンクにワーカースレッドを張り、
/// `enqueue` でコマンドを投入する。Dropで全ワーカーを停止する。
pub struct HardwareDispatcher {
    devices: HashMap<String, DeviceHandle>,
    event_tx: Sender<DispatchEvent>,
    clock: MonotonicClock,
}

impl HardwareDispatcher {
    pub fn new(event_tx: Sender<DispatchEvent>, clock: MonotonicClock) -> Self {
        Self {
            devices: HashMap::new(),
            event_tx,
            clock,
        }
    }

    /// デバイスを登録し、ワーカースレッドを起動する
    pub fn add_device(&mut self, config: &DeviceConfig, link: Box<dyn LinkPort>) {
        let (command_tx, command_rx) = unbounded::<OutboundCommand>();
        let (control_tx, control_rx) = unbounded::<DeviceControl>();
        let faulted = Arc::new(AtomicBool::new(false));

        let worker = DeviceWorker {
            device_id: config.id.clone(),
            link,
            command_rx,
            control_rx,
            event_tx: self.event_tx.clone(),
            faulted: Arc::clone(&faulted),
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
            clock: self.clock.clone(),
            retained: None,
        };

        let join = std::thread::spawn(move || worker.run());

        self.devices.insert(
            config.id.clone(),
            DeviceHandle {
                command_tx,
                control_tx,
                faulted,
                join: Some(join),
            },
        );
    }

    /// コマンドを投入する
    ///
    /// 障害中のデバイスにも投入できる（復旧後に送出される）。
    pub fn enqueue(&self, device_id: &str, command: OutboundCommand) -> SortResult<()> {
        let handle = self
            .devices
            .get(device_id)
            .ok_or_else(|| SortError::Hardware(format!("unknown device '{}'", device_id)))?;
        handle
            .command_tx
            .send(command)
            .map_err(|_| SortError::Hardware(format!("device worker '{}' stopped", device_id)))
    }

    /// デバイスの健全性を確認する（ロックなし）
    pub fn health(&self, device_id: &str) -> Option<LinkHealth> {
        self.devices.get(device_id).map(|h| {
            if h.faulted.load(Ordering::Relaxed) {
                LinkHealth::Faulted
            } else {
                LinkHealth::Healthy
            }
        })
    }

    /// 障害デバイスの復旧を指示する
    ///
    /// 保持中の未完了コマンドから送出が再開される。
    pub fn recover(&self, device_id: &str) -> SortResult<()> {
        let handle = self
            .devices
            .get(device_id)
            .ok_or_else(|| SortError::Hardware(format!("unknown device '{}'", device_id)))?;
        handle
            .control_tx
            .send(DeviceControl::Recover)
            .map_err(|_| SortError::Hardware(format!("device worker '{}' stopped", device_id)))
    }

    /// 登録済みデバイスIDの一覧
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}

impl Drop for HardwareDispatcher {
    fn drop(&mut self) {
        for handle in self.devices.values() {
            let _ = handle.control_tx.send(DeviceControl::Shutdown);
        }
        for handle in self.devices.values_mut() {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// デバイスワーカー本体
struct DeviceWorker {
    device_id: String,
    link: Box<dyn LinkPort>,
    command_rx: Receiver<OutboundCommand>,
    control_rx: Receiver<DeviceControl>,
    event_tx: Sender<DispatchEvent>,
    faulted: Arc<AtomicBool>,
    ack_timeout: Duration,
    max_retries: u32,
    clock: MonotonicClock,
    /// 障害発生時の未完了コマンド（復旧後に最優先で再送される）
    retained: Option<OutboundCommand>,
}

impl DeviceWorker {
    fn run(mut self) {
        tracing::info!("Dispatch worker started for device '{}'", self.device_id);

        loop {
            // 制御メッセージを先に処理する
            match self.control_rx.try_recv() {
                Ok(DeviceControl::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Ok(DeviceControl::Recover) => self.try_recover(),
                Err(TryRecvError::Empty) => {}
            }

            if self.faulted.load(Ordering::Relaxed) {
                // 障害中はコマンドを消費せず、復旧指示だけを待つ
                match self.control_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(DeviceControl::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(DeviceControl::Recover) => self.try_recover(),
                    Err(RecvTimeoutError::Timeout) => {}
                }
                continue;
            }

            let command = match self.retained.take() {
                Some(command) => command,
                None => match self.command_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            self.dispatch(command);
        }

        tracing::info!("Dispatch worker stopped for device '{}'", self.device_id);
    }

    /// 1コマンドの送出（リトライ込み）
    fn dispatch(&mut self, command: OutboundCommand) {
        let frame = encode_command(&command.command);

        for attempt in 0..=self.max_retries {
            let acked = self
                .link
                .send_frame(&frame)
                .and_then(|_| self.link.recv_ack(self.ack_timeout));

            match acked {
                Ok(true) => {
                    #[cfg(debug_assertions)]
                    tracing::debug!(
                        "Device '{}' acked {:?} (attempt {})",
                        self.device_id,
                        command.command,
                        attempt + 1
                    );
                    let _ = self.event_tx.send(DispatchEvent::Acked {
                        device_id: self.device_id.clone(),
                        group_id: command.group_id,
                        actuator: command.actuator,
                        at: self.clock.now(),
                    });
                    return;
                }
                Ok(false) => {
                    tracing::warn!(
                        "Device '{}' ack timeout for {:?} (attempt {}/{})",
                        self.device_id,
                        command.command,
                        attempt + 1,
                        self.max_retries + 1
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Device '{}' link error for {:?}: {} (attempt {}/{})",
                        self.device_id,
                        command.command,
                        e,
                        attempt + 1,
                        self.max_retries + 1
                    );
                }
            }
        }

        self.mark_faulted(command);
    }

    /// リトライ上限到達: デバイスをFaulted化し、コマンドを保持する
    fn mark_faulted(&mut self, command: OutboundCommand) {
        let detail = format!(
            "no ack after {} attempts for {:?}",
            self.max_retries + 1,
            command.command
        );
        tracing::error!("Device '{}' faulted: {}", self.device_id, detail);

        self.retained = Some(command);
        self.faulted.store(true, Ordering::Relaxed);
        let _ = self.event_tx.send(DispatchEvent::Fault(DeviceFault {
            device_id: self.device_id.clone(),
            detail,
            at: self.clock.now(),
        }));
    }

    /// 復旧を試みる
    ///
    /// リンクの再接続に成功したら障害フラグを下げる。保持中の
    /// コマンドは次のループで最優先に送出される。
    fn try_recover(&mut self) {
        if !self.faulted.load(Ordering::Relaxed) {
            return;
        }
        match self.link.reconnect() {
            Ok(()) => {
                tracing::info!("Device '{}' recovered", self.device_id);
                self.faulted.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("Device '{}' recovery failed: {}", self.device_id, e);
            }
        }
    }
}
