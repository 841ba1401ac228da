//! 切换决策引擎

use super::{DeviceState, RankedAlgorithm};
use crate::device::AlgorithmId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// 切换策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchingConfig {
    /// 决策周期 (秒)
    pub tick_interval_secs: u64,
    /// 最小相对收益提升，0.05 表示新算法需高出 5%
    pub switch_threshold: f64,
    /// 最短驻留时间 (秒)
    pub min_dwell_secs: u64,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            switch_threshold: 0.05,
            min_dwell_secs: 180,
        }
    }
}

impl SwitchingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn min_dwell(&self) -> Duration {
        Duration::from_secs(self.min_dwell_secs)
    }
}

/// 不采取行动的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// 设备未启用或已停止
    Inactive,
    /// 切换进行中，不重复评估
    SwitchInProgress,
    /// 还没有可用的收益排名
    NoRanking,
    /// 当前算法已经是最优
    AlreadyBest,
    /// 收益提升未超过阈值
    BelowThreshold,
    /// 驻留时间未满
    DwellNotElapsed,
}

/// 单次决策结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoAction(HoldReason),
    Start {
        algorithm: AlgorithmId,
        payrate: f64,
    },
    Switch {
        from: AlgorithmId,
        to: AlgorithmId,
        current_payrate: f64,
        best_payrate: f64,
    },
}

/// 切换决策引擎
///
/// 纯策略，不持有设备状态。
#[derive(Debug, Clone)]
pub struct SwitchingEngine {
    config: SwitchingConfig,
}

impl SwitchingEngine {
    pub fn new(config: SwitchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SwitchingConfig {
        &self.config
    }

    /// 根据当前状态和排名做一次决策
    pub fn decide(
        &self,
        state: &DeviceState,
        ranking: &[RankedAlgorithm],
        session_started: Option<Instant>,
        now: Instant,
    ) -> Decision {
        match state {
            DeviceState::Idle | DeviceState::Stopped => Decision::NoAction(HoldReason::Inactive),
            DeviceState::Switching { .. } => Decision::NoAction(HoldReason::SwitchInProgress),
            // 首次选择没有可比较的旧算法，不做阈值和驻留检查
            DeviceState::Selecting => match ranking.first() {
                Some(best) => Decision::Start {
                    algorithm: best.algorithm.clone(),
                    payrate: best.payrate,
                },
                None => Decision::NoAction(HoldReason::NoRanking),
            },
            DeviceState::Running(current) => {
                self.evaluate_running(current, ranking, session_started, now)
            }
        }
    }

    fn evaluate_running(
        &self,
        current: &AlgorithmId,
        ranking: &[RankedAlgorithm],
        session_started: Option<Instant>,
        now: Instant,
    ) -> Decision {
        let Some(best) = ranking.first() else {
            return Decision::NoAction(HoldReason::NoRanking);
        };
        if &best.algorithm == current {
            return Decision::NoAction(HoldReason::AlreadyBest);
        }

        // 当前算法不在排名中时 (基准或行情丢失) 按 0 收益处理
        let current_payrate = ranking
            .iter()
            .find(|ranked| &ranked.algorithm == current)
            .map(|ranked| ranked.payrate)
            .unwrap_or(0.0);

        if !self.exceeds_threshold(best.payrate, current_payrate) {
            return Decision::NoAction(HoldReason::BelowThreshold);
        }

        let dwell = session_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or(Duration::ZERO);
        if dwell <= self.config.min_dwell() {
            return Decision::NoAction(HoldReason::DwellNotElapsed);
        }

        Decision::Switch {
            from: current.clone(),
            to: best.algorithm.clone(),
            current_payrate,
            best_payrate: best.payrate,
        }
    }

    /// 手动指定算法时的决策，跳过阈值和驻留检查
    pub fn decide_forced(
        &self,
        state: &DeviceState,
        forced: &AlgorithmId,
        ranking: &[RankedAlgorithm],
    ) -> Decision {
        let payrate_of = |algorithm: &AlgorithmId| {
            ranking
                .iter()
                .find(|ranked| &ranked.algorithm == algorithm)
                .map(|ranked| ranked.payrate)
                .unwrap_or(0.0)
        };

        match state {
            DeviceState::Idle | DeviceState::Stopped => Decision::NoAction(HoldReason::Inactive),
            DeviceState::Switching { .. } => Decision::NoAction(HoldReason::SwitchInProgress),
            DeviceState::Selecting => Decision::Start {
                algorithm: forced.clone(),
                payrate: payrate_of(forced),
            },
            DeviceState::Running(current) if current == forced => Decision::NoAction(HoldReason::AlreadyBest),
            DeviceState::Running(current) => Decision::Switch {
                from: current.clone(),
                to: forced.clone(),
                current_payrate: payrate_of(current),
                best_payrate: payrate_of(forced),
            },
        }
    }

    /// 新收益是否超过 `current * (1 + threshold)`
    pub fn exceeds_threshold(&self, best_payrate: f64, current_payrate: f64) -> bool {
        best_payrate > current_payrate * (1.0 + self.config.switch_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(pairs: &[(&str, f64)]) -> Vec<RankedAlgorithm> {
        pairs
            .iter()
            .map(|(algorithm, payrate)| RankedAlgorithm {
                algorithm: AlgorithmId::new(*algorithm),
                payrate: *payrate,
            })
            .collect()
    }

    fn engine(threshold: f64, dwell_secs: u64) -> SwitchingEngine {
        SwitchingEngine::new(SwitchingConfig {
            tick_interval_secs: 30,
            switch_threshold: threshold,
            min_dwell_secs: dwell_secs,
        })
    }

    fn running(algorithm: &str) -> DeviceState {
        DeviceState::Running(AlgorithmId::new(algorithm))
    }

    #[test]
    fn test_selecting_starts_best() {
        let engine = engine(0.05, 180);
        let now = Instant::now();

        let decision = engine.decide(&DeviceState::Selecting, &ranked(&[("b", 1.6), ("a", 1.0)]), None, now);
        assert_eq!(
            decision,
            Decision::Start {
                algorithm: AlgorithmId::new("b"),
                payrate: 1.6
            }
        );

        assert_eq!(
            engine.decide(&DeviceState::Selecting, &[], None, now),
            Decision::NoAction(HoldReason::NoRanking)
        );
    }

    #[test]
    fn test_inactive_and_switching_states_hold() {
        let engine = engine(0.05, 180);
        let now = Instant::now();
        let ranking = ranked(&[("b", 10.0)]);
        let switching = DeviceState::Switching {
            from: AlgorithmId::new("a"),
            to: AlgorithmId::new("b"),
        };

        assert_eq!(engine.decide(&DeviceState::Idle, &ranking, None, now), Decision::NoAction(HoldReason::Inactive));
        assert_eq!(engine.decide(&DeviceState::Stopped, &ranking, None, now), Decision::NoAction(HoldReason::Inactive));
        assert_eq!(
            engine.decide(&switching, &ranking, Some(now), now),
            Decision::NoAction(HoldReason::SwitchInProgress)
        );
    }

    #[test]
    fn test_switch_after_dwell_with_margin() {
        let engine = engine(0.05, 180);
        let started = Instant::now();
        let now = started + Duration::from_secs(181);

        let decision = engine.decide(&running("b"), &ranked(&[("a", 1.0), ("b", 0.4)]), Some(started), now);
        assert_eq!(
            decision,
            Decision::Switch {
                from: AlgorithmId::new("b"),
                to: AlgorithmId::new("a"),
                current_payrate: 0.4,
                best_payrate: 1.0,
            }
        );
    }

    #[test]
    fn test_no_switch_before_dwell() {
        let engine = engine(0.05, 180);
        let started = Instant::now();

        let decision = engine.decide(
            &running("b"),
            &ranked(&[("a", 100.0), ("b", 1.0)]),
            Some(started),
            started + Duration::from_secs(180),
        );
        assert_eq!(decision, Decision::NoAction(HoldReason::DwellNotElapsed));
    }

    #[test]
    fn test_no_switch_below_threshold_for_any_policy() {
        let started = Instant::now();
        let now = started + Duration::from_secs(3600);

        for threshold in [0.0, 0.02, 0.05, 0.1, 0.5] {
            let engine = engine(threshold, 60);
            let current = 1.0;
            // 恰好等于阈值也不切换
            let best = current * (1.0 + threshold);
            let decision = engine.decide(
                &running("a"),
                &ranked(&[("b", best), ("a", current)]),
                Some(started),
                now,
            );
            assert_eq!(decision, Decision::NoAction(HoldReason::BelowThreshold), "threshold {}", threshold);

            let decision = engine.decide(
                &running("a"),
                &ranked(&[("b", best + 0.01), ("a", current)]),
                Some(started),
                now,
            );
            assert!(matches!(decision, Decision::Switch { .. }), "threshold {}", threshold);
        }
    }

    #[test]
    fn test_already_best_holds() {
        let engine = engine(0.05, 0);
        let started = Instant::now();
        let decision = engine.decide(
            &running("a"),
            &ranked(&[("a", 2.0), ("b", 1.0)]),
            Some(started),
            started + Duration::from_secs(10),
        );
        assert_eq!(decision, Decision::NoAction(HoldReason::AlreadyBest));
    }

    #[test]
    fn test_missing_current_counts_as_zero() {
        let engine = engine(0.05, 10);
        let started = Instant::now();
        let decision = engine.decide(
            &running("gone"),
            &ranked(&[("b", 0.1)]),
            Some(started),
            started + Duration::from_secs(11),
        );
        assert!(matches!(decision, Decision::Switch { current_payrate, .. } if current_payrate == 0.0));
    }

    #[test]
    fn test_forced_ignores_threshold_and_dwell() {
        let engine = engine(0.05, 180);
        let ranking = ranked(&[("a", 2.0), ("b", 1.0)]);

        assert_eq!(
            engine.decide_forced(&running("a"), &AlgorithmId::new("b"), &ranking),
            Decision::Switch {
                from: AlgorithmId::new("a"),
                to: AlgorithmId::new("b"),
                current_payrate: 2.0,
                best_payrate: 1.0,
            }
        );
        assert_eq!(
            engine.decide_forced(&DeviceState::Selecting, &AlgorithmId::new("c"), &ranking),
            Decision::Start {
                algorithm: AlgorithmId::new("c"),
                payrate: 0.0
            }
        );
        assert_eq!(
            engine.decide_forced(&running("b"), &AlgorithmId::new("b"), &ranking),
            Decision::NoAction(HoldReason::AlreadyBest)
        );
        assert_eq!(
            engine.decide_forced(&DeviceState::Idle, &AlgorithmId::new("b"), &ranking),
            Decision::NoAction(HoldReason::Inactive)
        );
    }

    #[test]
    fn test_running_without_ranking_holds() {
        let engine = engine(0.05, 10);
        let now = Instant::now();
        assert_eq!(
            engine.decide(&running("a"), &[], Some(now), now),
            Decision::NoAction(HoldReason::NoRanking)
        );
    }
}
