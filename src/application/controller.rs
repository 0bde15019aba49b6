//! ソートプロセスコントローラ
//!
//! 検出取り込みから分類・スケジュール・ディスパッチ完了までの
//! ライフサイクル全体を配線・駆動します。
//!
//! # スレッド構成
//! - コントローラスレッド: 検出・速度・分類結果・ディスパッチ結果の
//!   4チャネルをselectで待ち受け、ペアラーの確定ポーリングと統計
//!   レポートを既定タイムアウトで回す
//! - ティックスレッド: スケジューラの期限到来アクションを
//!   ディスパッチャへ払い出す（既定50ms周期）
//! - 分類ワーカー・デバイスワーカーはそれぞれのモジュールが起動する

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::application::classification::{
    ClassificationGateway, ClassificationJob, ClassificationOutcome,
};
use crate::application::dispatch::{DispatchEvent, HardwareDispatcher, OutboundCommand};
use crate::application::pairing::DetectionPairer;
use crate::application::predictor::PositionPredictor;
use crate::application::runtime_state::RuntimeState;
use crate::application::scheduler::ActuationScheduler;
use crate::application::speed_timeline::SpeedTimeline;
use crate::application::stats::{SortRateTracker, SortStats, StageKind};
use crate::domain::{
    ActuatorKind, AppConfig, DetectionPair, DeviceCommand, DeviceFault, GroupId, LinkHealth,
    LinkPort, MonotonicClock, RecognizerPort, ScheduledAction, SkipSortReason, SortCompletion,
    SortResult, SpeedSample, Timestamp, TrackedGroup,
};
use crate::domain::Detection;

/// 外部監視向けのアウトバウンドイベント
#[derive(Debug, Clone)]
pub enum SortEvent {
    /// 仕分け完了（ジェット噴射ACK受信）
    Completed(SortCompletion),
    /// 仕分けスキップ（正常系）
    Skipped {
        group_id: GroupId,
        reason: SkipSortReason,
    },
    /// デバイス障害発生
    DeviceFaulted(DeviceFault),
}

/// 分類結果待ちのグループ情報
struct PendingClassification {
    group: TrackedGroup,
    finalized_at: Timestamp,
}

/// ジェット噴射ACK待ちの完了情報
struct PendingCompletion {
    identity: String,
    sorter: u8,
    bin: u8,
    scheduled_at: Timestamp,
    first_detection_at: Timestamp,
    /// スケジュール時点の噴射予定時刻（ディスパッチ遅延の計測用）
    expected_fire_at: Option<Timestamp>,
}

/// ソートプロセスコントローラ
///
/// `start` で全スレッドを起動し、`detections`/`telemetry` の送信側と
/// `events` の受信側を外部へ公開する。Dropで停止と合流を行う。
pub struct SortProcessController {
    detection_tx: Sender<Vec<Detection>>,
    speed_tx: Sender<SpeedSample>,
    event_rx: Receiver<SortEvent>,
    runtime: RuntimeState,
    clock: MonotonicClock,
    dispatcher: Arc<HardwareDispatcher>,
    scheduler: Arc<ActuationScheduler>,
    handles: Vec<JoinHandle<()>>,
}

impl SortProcessController {
    /// パイプライン全体を起動する
    ///
    /// # Arguments
    /// * `config` - 検証済みの設定
    /// * `recognizer` - 認識ポート（分類ワーカーが所有する）
    /// * `links` - デバイスIDとリンクポートの対応（設定のdevicesと一致）
    pub fn start(
        config: &AppConfig,
        recognizer: Box<dyn RecognizerPort>,
        links: Vec<(String, Box<dyn LinkPort>)>,
    ) -> SortResult<Self> {
        let clock = MonotonicClock::new();
        let runtime = RuntimeState::new();

        // 速度タイムライン（起動時点の速度を初期サンプルとして記録）
        let mut timeline = SpeedTimeline::new(config.belt.retention_window_secs);
        timeline.record(SpeedSample {
            timestamp: 0.0,
            speed: config.belt.initial_speed_mm_s,
        });
        let timeline = Arc::new(Mutex::new(timeline));
        let predictor = PositionPredictor::new(Arc::clone(&timeline));
        let scheduler = Arc::new(ActuationScheduler::new(Arc::clone(&timeline)));

        // ディスパッチャ: デバイスごとにワーカーを起動
        let (dispatch_tx, dispatch_rx) = unbounded::<DispatchEvent>();
        let mut dispatcher = HardwareDispatcher::new(dispatch_tx, clock.clone());
        for (device_id, link) in links {
            let device = config.hardware.device(&device_id).ok_or_else(|| {
                crate::domain::SortError::Configuration(format!(
                    "link provided for unconfigured device '{}'",
                    device_id
                ))
            })?;
            dispatcher.add_device(device, link);
        }
        let dispatcher = Arc::new(dispatcher);

        // 分類ワーカー
        let (outcome_tx, outcome_rx) = unbounded::<ClassificationOutcome>();
        let gateway = ClassificationGateway::spawn(
            config.classification.bin_table.clone(),
            recognizer,
            outcome_tx,
        );

        let (detection_tx, detection_rx) = unbounded::<Vec<Detection>>();
        let (speed_tx, speed_rx) = unbounded::<SpeedSample>();
        let (event_tx, event_rx) = unbounded::<SortEvent>();

        let mut handles = Vec::new();

        // ティックスレッド
        {
            let scheduler = Arc::clone(&scheduler);
            let dispatcher = Arc::clone(&dispatcher);
            let runtime = runtime.clone();
            let clock = clock.clone();
            let interval = config.scheduler.tick_interval();
            handles.push(std::thread::spawn(move || {
                Self::tick_thread(scheduler, dispatcher, runtime, clock, interval);
            }));
        }

        // コントローラスレッド
        {
            let pairer = DetectionPairer::new(config.pairing.clone(), predictor.clone());
            let loop_state = ControllerLoop {
                pairer,
                gateway,
                scheduler: Arc::clone(&scheduler),
                dispatcher: Arc::clone(&dispatcher),
                predictor,
                runtime: runtime.clone(),
                clock: clock.clone(),
                config: config.clone(),
                stats: SortStats::new(config.stats.report_interval()),
                rate: SortRateTracker::new(config.stats.rate_window_secs),
                awaiting_classification: HashMap::new(),
                awaiting_completion: HashMap::new(),
                detection_rx,
                speed_rx,
                outcome_rx,
                dispatch_rx,
                event_tx,
            };
            handles.push(std::thread::spawn(move || loop_state.run()));
        }

        tracing::info!(
            "Sort process started: {} sorters, {} jets, {} devices",
            config.actuators.sorters.len(),
            config.actuators.jets.len(),
            config.hardware.devices.len()
        );

        Ok(Self {
            detection_tx,
            speed_tx,
            event_rx,
            runtime,
            clock,
            dispatcher,
            scheduler,
            handles,
        })
    }

    /// 検出フレームの送信側
    pub fn detections(&self) -> Sender<Vec<Detection>> {
        self.detection_tx.clone()
    }

    /// ベルト速度テレメトリの送信側
    pub fn telemetry(&self) -> Sender<SpeedSample> {
        self.speed_tx.clone()
    }

    /// アウトバウンドイベントの受信側
    pub fn events(&self) -> &Receiver<SortEvent> {
        &self.event_rx
    }

    /// プロセス共通の単調クロック
    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_running()
    }

    /// 障害デバイスの復旧を指示する
    pub fn recover_device(&self, device_id: &str) -> SortResult<()> {
        self.dispatcher.recover(device_id)
    }

    /// デバイスの健全性を確認する
    pub fn device_health(&self, device_id: &str) -> Option<LinkHealth> {
        self.dispatcher.health(device_id)
    }

    /// 停止する
    ///
    /// 未発火のスケジュール済みアクションは全て破棄される。
    /// 既にディスパッチ済みのコマンドは取り消せない。
    pub fn stop(&self) {
        if self.runtime.is_running() {
            tracing::info!("Sort process stopping");
            self.runtime.stop();
            self.scheduler.cancel_all();
        }
    }

    /// ティックスレッドのメインループ
    fn tick_thread(
        scheduler: Arc<ActuationScheduler>,
        dispatcher: Arc<HardwareDispatcher>,
        runtime: RuntimeState,
        clock: MonotonicClock,
        interval: Duration,
    ) {
        while runtime.is_running() {
            // 停止中のベルトでは全予定時刻が無限大（発火保留）
            if runtime.is_belt_halted() {
                std::thread::sleep(interval);
                continue;
            }
            for action in scheduler.tick(clock.now()) {
                let command = OutboundCommand {
                    group_id: Some(action.group_id),
                    actuator: Some(action.actuator),
                    command: action.command,
                };
                if let Err(e) = dispatcher.enqueue(&action.device_id, command) {
                    tracing::error!(
                        "Failed to dispatch {:?} for group {}: {}",
                        action.actuator,
                        action.group_id,
                        e
                    );
                }
            }
            std::thread::sleep(interval);
        }
    }
}

impl Drop for SortProcessController {
    fn drop(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// コントローラスレッドの状態
struct ControllerLoop {
    pairer: DetectionPairer,
    gateway: ClassificationGateway,
    scheduler: Arc<ActuationScheduler>,
    dispatcher: Arc<HardwareDispatcher>,
    predictor: PositionPredictor,
    runtime: RuntimeState,
    clock: MonotonicClock,
    config: AppConfig,
    stats: SortStats,
    rate: SortRateTracker,
    awaiting_classification: HashMap<GroupId, PendingClassification>,
    awaiting_completion: HashMap<GroupId, PendingCompletion>,
    detection_rx: Receiver<Vec<Detection>>,
    speed_rx: Receiver<SpeedSample>,
    outcome_rx: Receiver<ClassificationOutcome>,
    dispatch_rx: Receiver<DispatchEvent>,
    event_tx: Sender<SortEvent>,
}

impl ControllerLoop {
    fn run(mut self) {
        tracing::info!("Controller thread started");

        // selectの間も&mut selfでハンドラを呼べるよう受信側を複製する
        let detection_rx = self.detection_rx.clone();
        let speed_rx = self.speed_rx.clone();
        let outcome_rx = self.outcome_rx.clone();
        let dispatch_rx = self.dispatch_rx.clone();

        while self.runtime.is_running() {
            select! {
                recv(detection_rx) -> msg => match msg {
                    Ok(frame) => {
                        crate::measure_span!("ingest_frame", self.pairer.ingest_frame(frame));
                    }
                    Err(_) => break,
                },
                recv(speed_rx) -> msg => match msg {
                    Ok(sample) => self.on_speed_sample(sample),
                    Err(_) => break,
                },
                recv(outcome_rx) -> msg => match msg {
                    Ok(outcome) => self.on_classification_outcome(outcome),
                    Err(_) => break,
                },
                recv(dispatch_rx) -> msg => match msg {
                    Ok(event) => self.on_dispatch_event(event),
                    Err(_) => break,
                },
                default(Duration::from_millis(20)) => {}
            }

            let now = self.clock.now();
            for group in self.pairer.poll_finalized(now) {
                self.on_finalized(group, now);
            }
            if self.stats.should_report() {
                let ppm = self.rate.rate();
                self.stats.report_and_reset(ppm);
            }
        }

        tracing::info!("Controller thread stopped");
    }

    /// ベルト速度サンプルの反映
    ///
    /// タイムラインへの記録と全予定時刻の再計算はスケジューラ側で
    /// 1つのロック区間にまとめられている。
    fn on_speed_sample(&mut self, sample: SpeedSample) {
        self.scheduler.on_speed_change(sample);
        self.runtime.set_belt_halted(sample.speed <= 0.0);
    }

    /// 確定グループの処理
    fn on_finalized(&mut self, group: TrackedGroup, now: Timestamp) {
        self.stats.record_duration(
            StageKind::Finalize,
            Duration::from_secs_f64((now - group.initial_time).max(0.0)),
        );

        if let Some(reason) = group.skip_sort_reason {
            self.skip(group.id, reason);
            return;
        }

        let crop_uri = group
            .index_used_to_classify
            .and_then(|idx| group.pairs.get(idx))
            .and_then(Self::crop_uri_of);

        let Some(crop_uri) = crop_uri else {
            // 分類に使える切り出し画像がない
            tracing::warn!("Group {} has no crop image, skipping", group.id);
            self.skip(group.id, SkipSortReason::ClassificationFailed);
            return;
        };

        let job = ClassificationJob {
            group_id: group.id,
            crop_uri,
        };
        if let Err(e) = self.gateway.submit(job) {
            tracing::error!("Failed to submit classification for group {}: {}", group.id, e);
            self.skip(group.id, SkipSortReason::ClassificationFailed);
            return;
        }
        self.awaiting_classification.insert(
            group.id,
            PendingClassification {
                group,
                finalized_at: now,
            },
        );
    }

    /// ペアから切り出し画像参照を取り出す（上面優先）
    fn crop_uri_of(pair: &DetectionPair) -> Option<String> {
        pair.top
            .as_ref()
            .and_then(|d| d.image_uri.clone())
            .or_else(|| pair.side.as_ref().and_then(|d| d.image_uri.clone()))
    }

    /// 分類結果の処理
    fn on_classification_outcome(&mut self, outcome: ClassificationOutcome) {
        let Some(pending) = self.awaiting_classification.remove(&outcome.group_id()) else {
            // 既に破棄されたグループの遅延結果は黙って捨てる
            #[cfg(debug_assertions)]
            tracing::debug!("Dropping late outcome for group {}", outcome.group_id());
            return;
        };

        let now = self.clock.now();
        self.stats.record_duration(
            StageKind::Classification,
            Duration::from_secs_f64((now - pending.finalized_at).max(0.0)),
        );

        match outcome {
            ClassificationOutcome::Sorted { response, bin, .. } => {
                self.schedule_sort(pending.group, response.identity, bin, now);
            }
            ClassificationOutcome::Skipped {
                group_id, reason, ..
            } => {
                self.skip(group_id, reason);
            }
        }
    }

    /// ビン割り当て済みグループのアクチュエーションをスケジュールする
    fn schedule_sort(
        &mut self,
        group: TrackedGroup,
        identity: String,
        bin: crate::domain::BinAssignment,
        now: Timestamp,
    ) {
        let Some(sorter) = self.config.actuators.sorter(bin.sorter) else {
            tracing::error!(
                "Group {}: bin table references unknown sorter {}",
                group.id,
                bin.sorter
            );
            return;
        };
        // ジェットはソーターステーションと同じインデックスで対応する
        let Some(jet) = self.config.actuators.jet(bin.sorter) else {
            tracing::error!("Group {}: no jet for sorter {}", group.id, bin.sorter);
            return;
        };

        // 障害中のデバイスへはスケジュールしない（部品は素通りする）
        for device_id in [&sorter.device_id, &jet.device_id] {
            if self.dispatcher.health(device_id) == Some(LinkHealth::Faulted) {
                tracing::warn!(
                    "Group {}: device '{}' is faulted, part will pass unsorted",
                    group.id,
                    device_id
                );
                return;
            }
        }

        let expected_fire_at = self.predictor.eta_at(
            group.initial_position,
            group.initial_time,
            jet.offset_mm,
            now,
        );

        self.scheduler.schedule(ScheduledAction {
            group_id: group.id,
            actuator: ActuatorKind::SorterMove,
            device_id: sorter.device_id.clone(),
            command: DeviceCommand::MoveToBin { bin: bin.bin },
            target_distance: sorter.offset_mm,
            fire_at: 0.0,
            initial_position: group.initial_position,
            initial_time: group.initial_time,
        });
        self.scheduler.schedule(ScheduledAction {
            group_id: group.id,
            actuator: ActuatorKind::JetFire,
            device_id: jet.device_id.clone(),
            command: DeviceCommand::FireJet { jet: jet.index },
            target_distance: jet.offset_mm,
            fire_at: 0.0,
            initial_position: group.initial_position,
            initial_time: group.initial_time,
        });

        #[cfg(debug_assertions)]
        tracing::debug!(
            "Group {} scheduled: '{}' -> sorter {} bin {} (fire ~t={:.3}s)",
            group.id,
            identity,
            bin.sorter,
            bin.bin,
            expected_fire_at.unwrap_or(f64::INFINITY)
        );

        self.awaiting_completion.insert(
            group.id,
            PendingCompletion {
                identity,
                sorter: bin.sorter,
                bin: bin.bin,
                scheduled_at: now,
                first_detection_at: group.initial_time,
                expected_fire_at,
            },
        );
    }

    /// ディスパッチ結果の処理
    fn on_dispatch_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Acked {
                group_id: Some(group_id),
                actuator: Some(ActuatorKind::JetFire),
                at,
                ..
            } => self.on_jet_acked(group_id, at),
            DispatchEvent::Acked { .. } => {}
            DispatchEvent::Fault(fault) => {
                self.stats.record_fault();
                let _ = self.event_tx.send(SortEvent::DeviceFaulted(fault));
            }
        }
    }

    /// ジェット噴射ACK: 仕分け完了として記録・通知する
    fn on_jet_acked(&mut self, group_id: GroupId, at: Timestamp) {
        let Some(pending) = self.awaiting_completion.remove(&group_id) else {
            return;
        };

        if let Some(expected) = pending.expected_fire_at {
            self.stats.record_duration(
                StageKind::Dispatch,
                Duration::from_secs_f64((at - expected).max(0.0)),
            );
        }
        self.stats.record_duration(
            StageKind::EndToEnd,
            Duration::from_secs_f64((at - pending.first_detection_at).max(0.0)),
        );
        self.stats.record_sorted();

        let ppm_count = self.rate.record(at);
        let completion = SortCompletion {
            group_id,
            identity: pending.identity,
            sorter: pending.sorter,
            bin: pending.bin,
            scheduled_at: pending.scheduled_at,
            dispatched_at: at,
            ppm_count,
        };
        tracing::info!(
            "Group {} sorted: '{}' -> sorter {} bin {} ({} ppm)",
            completion.group_id,
            completion.identity,
            completion.sorter,
            completion.bin,
            completion.ppm_count
        );
        let _ = self.event_tx.send(SortEvent::Completed(completion));
    }

    /// 仕分けスキップの記録と通知
    fn skip(&mut self, group_id: GroupId, reason: SkipSortReason) {
        self.stats.record_skipped(reason);
        let _ = self.event_tx.send(SortEvent::Skipped { group_id, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BinEntryConfig, BoundingBox, CameraView, Centroid, DeviceConfig};
    use crate::domain::{JetConfig, SorterConfig};
    use crate::infrastructure::mock_link::MockLink;
    use crate::infrastructure::mock_recognizer::MockRecognizer;

    /// 高速確定・高速発火のテスト用設定
    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.belt.initial_speed_mm_s = 1000.0;
        config.pairing.view_offset_mm = 0.0;
        config.pairing.idle_timeout_ms = 50;
        config.scheduler.tick_interval_ms = 10;
        config.actuators.sorters = vec![SorterConfig {
            index: 0,
            device_id: "sorter-0".to_string(),
            offset_mm: 400.0,
        }];
        config.actuators.jets = vec![JetConfig {
            index: 0,
            device_id: "jet-0".to_string(),
            offset_mm: 450.0,
        }];
        config.hardware.devices = vec![
            DeviceConfig {
                id: "sorter-0".to_string(),
                path: String::new(),
                baud_rate: 115200,
                ack_timeout_ms: 20,
                max_retries: 2,
            },
            DeviceConfig {
                id: "jet-0".to_string(),
                path: String::new(),
                baud_rate: 115200,
                ack_timeout_ms: 20,
                max_retries: 2,
            },
        ];
        config
            .classification
            .bin_table
            .insert("m3-screw".to_string(), BinEntryConfig { sorter: 0, bin: 2 });
        config
    }

    fn detection(view: CameraView, x: f64, t: Timestamp) -> Detection {
        Detection {
            view,
            timestamp: t,
            centroid: Centroid { x, y: 0.0 },
            bounding_box: BoundingBox {
                x: x - 5.0,
                y: -5.0,
                width: 10.0,
                height: 10.0,
            },
            confidence: 0.9,
            image_uri: Some("crop://test".to_string()),
        }
    }

    fn start_controller(recognizer: MockRecognizer) -> SortProcessController {
        let config = test_config();
        let links: Vec<(String, Box<dyn crate::domain::LinkPort>)> = vec![
            ("sorter-0".to_string(), Box::new(MockLink::always_ack())),
            ("jet-0".to_string(), Box::new(MockLink::always_ack())),
        ];
        SortProcessController::start(&config, Box::new(recognizer), links).expect("start")
    }

    #[test]
    fn test_full_pipeline_completes_sort() {
        let controller = start_controller(MockRecognizer::with_identity("m3-screw", 0.95));
        let detections = controller.detections();
        let events = controller.events().clone();

        let now = controller.clock().now();
        detections
            .send(vec![
                detection(CameraView::Top, 100.0, now),
                detection(CameraView::Side, 100.0, now),
            ])
            .unwrap();

        // 確定(アイドル50ms) → 分類 → スケジュール → 発火 → ACK
        let completion = loop {
            match events.recv_timeout(Duration::from_secs(5)).expect("event") {
                SortEvent::Completed(completion) => break completion,
                _ => continue,
            }
        };
        assert_eq!(completion.identity, "m3-screw");
        assert_eq!(completion.sorter, 0);
        assert_eq!(completion.bin, 2);
        assert!(completion.dispatched_at >= completion.scheduled_at);

        controller.stop();
    }

    #[test]
    fn test_unknown_part_reports_skip() {
        let controller = start_controller(MockRecognizer::with_identity("mystery", 0.9));
        let detections = controller.detections();
        let events = controller.events().clone();

        let now = controller.clock().now();
        detections
            .send(vec![
                detection(CameraView::Top, 100.0, now),
                detection(CameraView::Side, 100.0, now),
            ])
            .unwrap();

        match events.recv_timeout(Duration::from_secs(5)).expect("event") {
            SortEvent::Skipped { reason, .. } => {
                assert_eq!(reason, SkipSortReason::UnknownPart);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        controller.stop();
    }

    #[test]
    fn test_single_view_part_reports_skip() {
        let controller = start_controller(MockRecognizer::with_identity("m3-screw", 0.95));
        let detections = controller.detections();
        let events = controller.events().clone();

        let now = controller.clock().now();
        detections
            .send(vec![detection(CameraView::Top, 100.0, now)])
            .unwrap();

        match events.recv_timeout(Duration::from_secs(5)).expect("event") {
            SortEvent::Skipped { reason, .. } => {
                assert_eq!(reason, SkipSortReason::SingleViewOnly);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        controller.stop();
    }

    #[test]
    fn test_late_outcome_after_stop_is_dropped() {
        // 分類中に停止すると、結果は破棄済みグループの遅延結果として
        // 到着する。エラーにならず完了イベントも出ないこと。
        let recognizer = MockRecognizer::with_identity("m3-screw", 0.95)
            .with_response_delay(Duration::from_millis(200));
        let calls = recognizer.call_counter();
        let controller = start_controller(recognizer);
        let detections = controller.detections();
        let events = controller.events().clone();

        let now = controller.clock().now();
        detections
            .send(vec![
                detection(CameraView::Top, 100.0, now),
                detection(CameraView::Side, 100.0, now),
            ])
            .unwrap();

        // 認識ワーカーがジョブを掴んでから停止する
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "recognizer not called");
            std::thread::sleep(Duration::from_millis(5));
        }
        controller.stop();
        drop(controller);

        assert!(events
            .try_iter()
            .all(|e| !matches!(e, SortEvent::Completed(_))));
    }

    #[test]
    fn test_stop_halts_threads() {
        let controller = start_controller(MockRecognizer::with_identity("m3-screw", 0.95));
        assert!(controller.is_running());

        controller.stop();
        assert!(!controller.is_running());
        // Dropで全スレッドが合流する（ハングしないことの確認）
        drop(controller);
    }
}
