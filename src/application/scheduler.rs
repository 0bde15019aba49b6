//! アクチュエーション・スケジューラ
//!
//! 確定したアクションを発火予定時刻順の優先度キューで保持し、
//! 周期ティックで期限到来分を払い出します。
//!
//! # 設計方針
//! - 共有速度タイムラインへの新サンプル記録と全予定時刻の再計算は
//!   1つのロック区間内で行う（ティックとの競合で古い予定が発火
//!   しないことを保証する）
//! - 同一 (グループ, アクチュエータ) の再スケジュールは置換。ヒープ
//!   からの即時削除はせず、世代番号による遅延破棄で実現する
//! - 予定時刻が同一のアクションは登録順（FIFO）で払い出す

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::application::speed_timeline::SpeedTimeline;
use crate::domain::{ActuatorKind, GroupId, ScheduledAction, SpeedSample, Timestamp};

/// ヒープ内のエントリ
///
/// 順序は (fire_at, seq)。seq は登録順の単調増加値で、同時刻の
/// FIFO性と全順序を保証する。
struct Pending {
    fire_at: Timestamp,
    seq: u64,
    action: ScheduledAction,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .total_cmp(&other.fire_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Pending>>,
    /// (グループ, アクチュエータ) → 最新エントリのseq
    ///
    /// ヒープから取り出したエントリのseqがここと一致しなければ
    /// 置換・キャンセル済みとして破棄する。
    live: HashMap<(GroupId, ActuatorKind), u64>,
    next_seq: u64,
}

/// アクチュエーション・スケジューラ
///
/// コントローラスレッド（登録・速度変化）とティックスレッド（払い出し）
/// の両方から `Arc` 経由で共有される。
pub struct ActuationScheduler {
    timeline: Arc<Mutex<SpeedTimeline>>,
    inner: Mutex<Inner>,
}

impl ActuationScheduler {
    pub fn new(timeline: Arc<Mutex<SpeedTimeline>>) -> Self {
        Self {
            timeline,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timeline(&self) -> MutexGuard<'_, SpeedTimeline> {
        self.timeline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// アクションの発火予定時刻を計算
    ///
    /// ベルト停止中で到達不能な場合は無限大（発火保留）を返す。
    /// 速度再開時の再計算で有限値に戻る。
    fn fire_at_of(timeline: &SpeedTimeline, action: &ScheduledAction) -> Timestamp {
        let remaining = action.target_distance - action.initial_position;
        timeline
            .time_to_reach(action.initial_time, remaining)
            .unwrap_or(f64::INFINITY)
    }

    /// アクションを登録する
    ///
    /// 同一 (グループ, アクチュエータ) の既存エントリは置換される。
    pub fn schedule(&self, mut action: ScheduledAction) {
        // ロック順序: inner → timeline
        let mut inner = self.lock_inner();
        let fire_at = Self::fire_at_of(&self.lock_timeline(), &action);
        action.fire_at = fire_at;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.live.insert((action.group_id, action.actuator), seq);

        #[cfg(debug_assertions)]
        tracing::debug!(
            "Scheduled {:?} for group {} at t={:.3}s (target {:.1}mm)",
            action.actuator,
            action.group_id,
            fire_at,
            action.target_distance
        );

        inner.heap.push(Reverse(Pending {
            fire_at,
            seq,
            action,
        }));
    }

    /// 指定 (グループ, アクチュエータ) のエントリをキャンセルする
    pub fn cancel(&self, group_id: GroupId, actuator: ActuatorKind) {
        let mut inner = self.lock_inner();
        inner.live.remove(&(group_id, actuator));
    }

    /// 指定グループの全エントリをキャンセルする
    pub fn cancel_group(&self, group_id: GroupId) {
        let mut inner = self.lock_inner();
        inner.live.retain(|(gid, _), _| *gid != group_id);
    }

    /// 全エントリをキャンセルする（シャットダウン・リセット時）
    pub fn cancel_all(&self) {
        let mut inner = self.lock_inner();
        inner.live.clear();
        inner.heap.clear();
    }

    /// 有効なエントリ数
    pub fn pending_len(&self) -> usize {
        self.lock_inner().live.len()
    }

    /// 速度変化を反映する
    ///
    /// サンプルの記録と全予定時刻の再計算を同一ロック区間で行う。
    /// 記録だけ済んで再計算前の状態をティックに観測させない。
    pub fn on_speed_change(&self, sample: SpeedSample) {
        let mut inner = self.lock_inner();
        let mut timeline = self.lock_timeline();
        timeline.record(sample);

        let Inner { heap, live, .. } = &mut *inner;
        let entries: Vec<Reverse<Pending>> = std::mem::take(heap).into_vec();
        *heap = entries
            .into_iter()
            .filter(|Reverse(p)| live.get(&(p.action.group_id, p.action.actuator)) == Some(&p.seq))
            .map(|Reverse(mut p)| {
                p.fire_at = Self::fire_at_of(&timeline, &p.action);
                p.action.fire_at = p.fire_at;
                Reverse(p)
            })
            .collect();

        tracing::info!(
            "Belt speed changed to {:.1}mm/s, {} pending actions rescheduled",
            sample.speed,
            heap.len()
        );
    }

    /// 期限到来したアクションを払い出す
    ///
    /// 置換・キャンセル済みの古いエントリはここで破棄される。
    pub fn tick(&self, now: Timestamp) -> Vec<ScheduledAction> {
        let mut inner = self.lock_inner();
        let mut due = Vec::new();

        while let Some(Reverse(head)) = inner.heap.peek() {
            if head.fire_at > now {
                break;
            }
            let Reverse(pending) = inner.heap.pop().unwrap_or_else(|| unreachable!());
            let key = (pending.action.group_id, pending.action.actuator);
            if inner.live.get(&key) == Some(&pending.seq) {
                inner.live.remove(&key);
                due.push(pending.action);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActuatorKind, DeviceCommand};

    fn timeline_with(samples: &[(f64, f64)]) -> Arc<Mutex<SpeedTimeline>> {
        let mut timeline = SpeedTimeline::new(600.0);
        for &(timestamp, speed) in samples {
            timeline.record(SpeedSample { timestamp, speed });
        }
        Arc::new(Mutex::new(timeline))
    }

    fn action(group_id: GroupId, actuator: ActuatorKind, target: f64) -> ScheduledAction {
        ScheduledAction {
            group_id,
            actuator,
            device_id: "sorter-0".into(),
            command: match actuator {
                ActuatorKind::SorterMove => DeviceCommand::MoveToBin { bin: 1 },
                ActuatorKind::JetFire => DeviceCommand::FireJet { jet: 0 },
            },
            target_distance: target,
            fire_at: 0.0,
            initial_position: 0.0,
            initial_time: 0.0,
        }
    }

    #[test]
    fn test_tick_releases_due_actions_in_order() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        // 10mm/s: 100mm→10s, 50mm→5s
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));
        scheduler.schedule(action(2, ActuatorKind::SorterMove, 50.0));

        assert!(scheduler.tick(4.9).is_empty());

        let due = scheduler.tick(10.0);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].group_id, 2);
        assert_eq!(due[1].group_id, 1);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn test_equal_fire_times_released_fifo() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));
        scheduler.schedule(action(2, ActuatorKind::JetFire, 100.0));
        scheduler.schedule(action(3, ActuatorKind::SorterMove, 100.0));

        let due = scheduler.tick(10.0);
        let order: Vec<GroupId> = due.iter().map(|a| a.group_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_reschedule_replaces_previous_entry() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 50.0));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));

        assert_eq!(scheduler.pending_len(), 1);
        // 旧エントリ(t=5)は発火しない
        assert!(scheduler.tick(5.0).is_empty());
        assert_eq!(scheduler.tick(10.0).len(), 1);
    }

    #[test]
    fn test_cancel_removes_group_entries() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 50.0));
        scheduler.schedule(action(1, ActuatorKind::JetFire, 60.0));
        scheduler.schedule(action(2, ActuatorKind::SorterMove, 50.0));

        scheduler.cancel_group(1);
        assert_eq!(scheduler.pending_len(), 1);

        let due = scheduler.tick(100.0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].group_id, 2);
    }

    #[test]
    fn test_cancel_single_actuator_keeps_other() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 50.0));
        scheduler.schedule(action(1, ActuatorKind::JetFire, 60.0));

        scheduler.cancel(1, ActuatorKind::SorterMove);

        let due = scheduler.tick(100.0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].actuator, ActuatorKind::JetFire);
    }

    #[test]
    fn test_released_action_carries_fire_time() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));

        let due = scheduler.tick(10.0);
        assert_eq!(due[0].fire_at, 10.0);

        // 再計算後も払い出されたアクションは最新の予定時刻を持つ
        // (t=10で半減 → 残り50mmに10s → 発火はt=20)
        scheduler.schedule(action(2, ActuatorKind::SorterMove, 150.0));
        scheduler.on_speed_change(SpeedSample {
            timestamp: 10.0,
            speed: 5.0,
        });
        let due = scheduler.tick(20.0);
        assert_eq!(due[0].fire_at, 20.0);
    }

    #[test]
    fn test_speed_change_delays_fire_time() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));

        // t=5で半減 → 残り50mmに10s → 発火はt=15
        scheduler.on_speed_change(SpeedSample {
            timestamp: 5.0,
            speed: 5.0,
        });

        assert!(scheduler.tick(10.0).is_empty());
        assert_eq!(scheduler.tick(15.0).len(), 1);
    }

    #[test]
    fn test_belt_stop_suspends_until_resume() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 100.0));

        scheduler.on_speed_change(SpeedSample {
            timestamp: 5.0,
            speed: 0.0,
        });
        // 停止中は到達不能: どれだけ待っても発火しない
        assert!(scheduler.tick(1.0e6).is_empty());
        assert_eq!(scheduler.pending_len(), 1);

        // 再開で残り50mmに5s → t=105で発火
        scheduler.on_speed_change(SpeedSample {
            timestamp: 100.0,
            speed: 10.0,
        });
        assert!(scheduler.tick(104.9).is_empty());
        assert_eq!(scheduler.tick(105.0).len(), 1);
    }

    #[test]
    fn test_cancel_all_empties_queue() {
        let scheduler = ActuationScheduler::new(timeline_with(&[(0.0, 10.0)]));
        scheduler.schedule(action(1, ActuatorKind::SorterMove, 50.0));
        scheduler.schedule(action(2, ActuatorKind::JetFire, 50.0));

        scheduler.cancel_all();
        assert_eq!(scheduler.pending_len(), 0);
        assert!(scheduler.tick(100.0).is_empty());
    }
}
