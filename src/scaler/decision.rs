//! Pure scaling decisions.
//!
//! Nothing here talks to a broker or orchestrator: the controller gathers an
//! [`Observation`], calls [`decide`], and executes the result.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::descriptor::{ScalingPolicy, ServiceDescriptor};

/// Load signal gathered for one service in one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// Ready messages on the tier's queue.
    QueueDepth(u64),
    /// Load score in `[0, 100]`.
    LoadScore(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Healthy replicas reported by the directory.
    pub current_replicas: u32,
    pub signal: Signal,
}

/// What the controller should do for one service this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Desired equals current.
    Hold { replicas: u32 },
    /// Issue a scale command.
    Scale { from: u32, to: u32 },
    /// A change is due but the service is cooling down.
    CoolingDown { from: u32, to: u32, remaining: Duration },
}

impl Decision {
    pub fn desired(&self) -> u32 {
        match self {
            Decision::Hold { replicas } => *replicas,
            Decision::Scale { to, .. } | Decision::CoolingDown { to, .. } => *to,
        }
    }
}

/// Combines dependent queue depths and response latency into `[0, 100]`:
/// `min(10 * avg_depth + min(latency_ms / 100, 100), 100)`.
pub fn load_score(dependent_depths: &[u64], latency: Duration) -> f64 {
    let avg_depth = if dependent_depths.is_empty() {
        0.0
    } else {
        dependent_depths.iter().sum::<u64>() as f64 / dependent_depths.len() as f64
    };
    let latency_ms = latency.as_secs_f64() * 1000.0;
    let latency_score = (latency_ms / 100.0).min(100.0);
    (10.0 * avg_depth + latency_score).min(100.0)
}

/// Whether the cooldown has passed. Strictly after `cooldown_until`.
pub fn cooldown_elapsed(cooldown_until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    cooldown_until.map_or(true, |until| now > until)
}

/// Replica count the policy asks for, clamped to the descriptor's bounds.
pub fn desired_replicas(descriptor: &ServiceDescriptor, observation: &Observation) -> u32 {
    let min = descriptor.min_replicas;
    let max = descriptor.max_replicas.max(min);
    let current = observation.current_replicas;

    let desired = match (&descriptor.policy, observation.signal) {
        (ScalingPolicy::QueueDepth { .. }, Signal::QueueDepth(0)) => min,
        (
            ScalingPolicy::QueueDepth {
                scale_up_threshold,
                scale_down_threshold,
                ..
            },
            Signal::QueueDepth(depth),
        ) => {
            let per_replica = depth as f64 / current.max(1) as f64;
            step(current, min, max, per_replica, *scale_up_threshold, *scale_down_threshold)
        }
        (
            ScalingPolicy::Load {
                up_threshold,
                down_threshold,
                ..
            },
            Signal::LoadScore(score),
        ) => step(current, min, max, score, *up_threshold, *down_threshold),
        // Signal does not match the policy: leave the tier alone.
        _ => current,
    };

    desired.clamp(min, max)
}

fn step(current: u32, min: u32, max: u32, value: f64, up: f64, down: f64) -> u32 {
    if value > up {
        current.saturating_add(1).min(max)
    } else if value < down && current > min {
        current - 1
    } else {
        current
    }
}

/// Decides the action for one service at `now`.
pub fn decide(
    descriptor: &ServiceDescriptor,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Decision {
    let from = observation.current_replicas;
    let to = desired_replicas(descriptor, observation);

    if to == from {
        return Decision::Hold { replicas: from };
    }
    if cooldown_elapsed(descriptor.cooldown_until, now) {
        return Decision::Scale { from, to };
    }

    let remaining = descriptor
        .cooldown_until
        .and_then(|until| (until - now).to_std().ok())
        .unwrap_or_default();
    Decision::CoolingDown {
        from,
        to,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn workers() -> ServiceDescriptor {
        ServiceDescriptor::worker_tier("grayscale_service", "image_processing")
    }

    fn gateway() -> ServiceDescriptor {
        ServiceDescriptor::routing_tier("api_gateway", "http://gw/health")
    }

    fn queue(current: u32, depth: u64) -> Observation {
        Observation {
            current_replicas: current,
            signal: Signal::QueueDepth(depth),
        }
    }

    fn load(current: u32, score: f64) -> Observation {
        Observation {
            current_replicas: current,
            signal: Signal::LoadScore(score),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_empty_queue_drains_to_minimum() {
        let decision = decide(&workers(), &queue(3, 0), t(0));
        assert_eq!(decision, Decision::Scale { from: 3, to: 1 });
    }

    #[test]
    fn test_deep_queue_scales_up_by_one() {
        let decision = decide(&workers(), &queue(3, 45), t(0));
        assert_eq!(decision, Decision::Scale { from: 3, to: 4 });
    }

    #[test]
    fn test_queue_depth_thresholds() {
        let tier = workers();
        // 30 / 3 = 10 is not above 10
        assert_eq!(desired_replicas(&tier, &queue(3, 30)), 3);
        // 5 / 3 < 2
        assert_eq!(desired_replicas(&tier, &queue(3, 5)), 2);
        // 6 / 3 = 2 is not below 2
        assert_eq!(desired_replicas(&tier, &queue(3, 6)), 3);
        // Already at min
        assert_eq!(desired_replicas(&tier, &queue(1, 1)), 1);
        // Capped at max
        assert_eq!(desired_replicas(&tier, &queue(5, 500)), 5);
        // Zero observed replicas counts as one
        assert_eq!(desired_replicas(&tier, &queue(0, 11)), 1);
    }

    #[test]
    fn test_load_thresholds() {
        let tier = gateway();
        assert_eq!(desired_replicas(&tier, &load(1, 95.0)), 2);
        assert_eq!(desired_replicas(&tier, &load(3, 95.0)), 3);
        assert_eq!(desired_replicas(&tier, &load(2, 10.0)), 1);
        assert_eq!(desired_replicas(&tier, &load(1, 10.0)), 1);
        assert_eq!(desired_replicas(&tier, &load(2, 50.0)), 2);
        assert_eq!(desired_replicas(&tier, &load(2, 80.0)), 2);
    }

    #[test]
    fn test_mismatched_signal_holds() {
        assert_eq!(desired_replicas(&workers(), &load(3, 99.0)), 3);
        assert_eq!(desired_replicas(&gateway(), &queue(2, 50)), 2);
    }

    #[test]
    fn test_desired_always_within_bounds() {
        let tier = workers().with_bounds(2, 6);
        for current in 0..12 {
            for depth in [0u64, 1, 5, 11, 20, 60, 1000, u64::MAX] {
                let desired = desired_replicas(&tier, &queue(current, depth));
                assert!(
                    (2..=6).contains(&desired),
                    "current={} depth={} desired={}",
                    current,
                    depth,
                    desired
                );
            }
        }

        let tier = gateway();
        for current in 0..6 {
            for score in [0.0, 29.9, 30.0, 55.0, 80.0, 80.1, 100.0] {
                let desired = desired_replicas(&tier, &load(current, score));
                assert!((1..=3).contains(&desired));
            }
        }
    }

    #[test]
    fn test_cooldown_blocks_until_strictly_after() {
        let mut tier = workers();
        tier.cooldown_until = Some(t(120));

        match decide(&tier, &queue(3, 45), t(60)) {
            Decision::CoolingDown { from, to, remaining } => {
                assert_eq!((from, to), (3, 4));
                assert_eq!(remaining, Duration::from_secs(60));
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert!(matches!(
            decide(&tier, &queue(3, 45), t(120)),
            Decision::CoolingDown { .. }
        ));
        assert_eq!(
            decide(&tier, &queue(3, 45), t(121)),
            Decision::Scale { from: 3, to: 4 }
        );
    }

    #[test]
    fn test_hold_ignores_cooldown() {
        let mut tier = workers();
        tier.cooldown_until = Some(t(120));
        assert_eq!(
            decide(&tier, &queue(3, 20), t(0)),
            Decision::Hold { replicas: 3 }
        );
    }

    #[test]
    fn test_load_score() {
        assert_eq!(load_score(&[], Duration::ZERO), 0.0);
        assert!((load_score(&[2, 4], Duration::from_millis(500)) - 35.0).abs() < 1e-9);
        assert_eq!(load_score(&[50], Duration::ZERO), 100.0);
        assert_eq!(load_score(&[0], Duration::from_secs(60)), 100.0);
        assert!((load_score(&[1], Duration::from_secs(1)) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_elapsed() {
        assert!(cooldown_elapsed(None, t(0)));
        assert!(!cooldown_elapsed(Some(t(10)), t(10)));
        assert!(cooldown_elapsed(Some(t(10)), t(11)));
    }
}
