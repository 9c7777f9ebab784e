//! Static description of a scalable service tier.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ConfigError;

/// Which signal drives a tier's replica count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingPolicy {
    /// Ready messages per replica on a queue.
    QueueDepth {
        queue: String,
        scale_up_threshold: f64,
        scale_down_threshold: f64,
    },
    /// Load score computed from the service's health endpoint.
    Load {
        health_endpoint: String,
        up_threshold: f64,
        down_threshold: f64,
    },
}

impl ScalingPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            ScalingPolicy::QueueDepth { .. } => "queue_depth",
            ScalingPolicy::Load { .. } => "load",
        }
    }

    /// `(up, down)` thresholds in the policy's own unit.
    pub fn thresholds(&self) -> (f64, f64) {
        match self {
            ScalingPolicy::QueueDepth {
                scale_up_threshold,
                scale_down_threshold,
                ..
            } => (*scale_up_threshold, *scale_down_threshold),
            ScalingPolicy::Load {
                up_threshold,
                down_threshold,
                ..
            } => (*up_threshold, *down_threshold),
        }
    }
}

/// One scalable tier plus the controller's mutable view of it.
///
/// `current_replicas` and `cooldown_until` are written only by the
/// controller loop.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    /// Orchestrator service name.
    pub name: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub cooldown: Duration,
    pub policy: ScalingPolicy,
    /// Last replica count observed from the directory.
    pub current_replicas: u32,
    /// No scale command is issued before this instant.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, policy: ScalingPolicy) -> Self {
        Self {
            name: name.into(),
            min_replicas: 1,
            max_replicas: 5,
            cooldown: Duration::from_secs(120),
            policy,
            current_replicas: 1,
            cooldown_until: None,
            last_scaled_at: None,
        }
    }

    /// Queue-depth tier with the worker defaults: 1..=5 replicas, up above
    /// 10 messages per replica, down below 2, 120s cooldown.
    pub fn worker_tier(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self::new(
            name,
            ScalingPolicy::QueueDepth {
                queue: queue.into(),
                scale_up_threshold: 10.0,
                scale_down_threshold: 2.0,
            },
        )
    }

    /// Load-scored tier with the routing defaults: 1..=3 replicas, up above
    /// a score of 80, down below 30, 180s cooldown.
    pub fn routing_tier(name: impl Into<String>, health_endpoint: impl Into<String>) -> Self {
        Self::new(
            name,
            ScalingPolicy::Load {
                health_endpoint: health_endpoint.into(),
                up_threshold: 80.0,
                down_threshold: 30.0,
            },
        )
        .with_bounds(1, 3)
        .with_cooldown(Duration::from_secs(180))
    }

    pub fn with_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_replicas = min;
        self.max_replicas = max;
        self.current_replicas = self.current_replicas.clamp(min, max.max(min));
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_thresholds(mut self, up: f64, down: f64) -> Self {
        match &mut self.policy {
            ScalingPolicy::QueueDepth {
                scale_up_threshold,
                scale_down_threshold,
                ..
            } => {
                *scale_up_threshold = up;
                *scale_down_threshold = down;
            }
            ScalingPolicy::Load {
                up_threshold,
                down_threshold,
                ..
            } => {
                *up_threshold = up;
                *down_threshold = down;
            }
        }
        self
    }

    /// Queue watched by a queue-depth tier.
    pub fn queue_name(&self) -> Option<&str> {
        match &self.policy {
            ScalingPolicy::QueueDepth { queue, .. } => Some(queue),
            ScalingPolicy::Load { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "service name must not be empty"));
        }
        if self.max_replicas == 0 {
            return Err(ConfigError::invalid(
                format!("{}.max_replicas", self.name),
                "must be at least 1",
            ));
        }
        if self.min_replicas > self.max_replicas {
            return Err(ConfigError::invalid(
                format!("{}.min_replicas", self.name),
                format!(
                    "min ({}) exceeds max ({})",
                    self.min_replicas, self.max_replicas
                ),
            ));
        }

        let (up, down) = self.policy.thresholds();
        if !(up.is_finite() && down.is_finite()) || down < 0.0 {
            return Err(ConfigError::invalid(
                format!("{}.thresholds", self.name),
                "thresholds must be finite and non-negative",
            ));
        }
        if down > up {
            return Err(ConfigError::invalid(
                format!("{}.thresholds", self.name),
                format!("scale-down threshold ({}) exceeds scale-up threshold ({})", down, up),
            ));
        }

        match &self.policy {
            ScalingPolicy::QueueDepth { queue, .. } if queue.trim().is_empty() => Err(
                ConfigError::invalid(format!("{}.queue", self.name), "must not be empty"),
            ),
            ScalingPolicy::Load {
                health_endpoint, ..
            } if !health_endpoint.starts_with("http://")
                && !health_endpoint.starts_with("https://") =>
            {
                Err(ConfigError::invalid(
                    format!("{}.health_endpoint", self.name),
                    format!("'{}' is not an http(s) URL", health_endpoint),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_tier_defaults() {
        let tier = ServiceDescriptor::worker_tier("grayscale_service", "image_processing");
        assert_eq!(tier.min_replicas, 1);
        assert_eq!(tier.max_replicas, 5);
        assert_eq!(tier.cooldown, Duration::from_secs(120));
        assert_eq!(tier.policy.thresholds(), (10.0, 2.0));
        assert_eq!(tier.queue_name(), Some("image_processing"));
        assert!(tier.validate().is_ok());
    }

    #[test]
    fn test_routing_tier_defaults() {
        let tier = ServiceDescriptor::routing_tier("api_gateway", "http://api_gateway:8000/health");
        assert_eq!(tier.max_replicas, 3);
        assert_eq!(tier.cooldown, Duration::from_secs(180));
        assert_eq!(tier.policy.thresholds(), (80.0, 30.0));
        assert_eq!(tier.queue_name(), None);
        assert_eq!(tier.policy.kind(), "load");
        assert!(tier.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let tier = ServiceDescriptor::worker_tier("w", "q")
            .with_bounds(2, 8)
            .with_thresholds(20.0, 5.0)
            .with_cooldown(Duration::from_secs(30));
        assert_eq!((tier.min_replicas, tier.max_replicas), (2, 8));
        assert_eq!(tier.current_replicas, 2);
        assert_eq!(tier.policy.thresholds(), (20.0, 5.0));
        assert_eq!(tier.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_errors() {
        assert!(ServiceDescriptor::worker_tier("w", "q")
            .with_bounds(4, 2)
            .validate()
            .is_err());
        assert!(ServiceDescriptor::worker_tier("w", "q")
            .with_bounds(0, 0)
            .validate()
            .is_err());
        assert!(ServiceDescriptor::worker_tier("w", "q")
            .with_thresholds(2.0, 10.0)
            .validate()
            .is_err());
        assert!(ServiceDescriptor::worker_tier("w", "").validate().is_err());
        assert!(ServiceDescriptor::worker_tier("", "q").validate().is_err());
        assert!(ServiceDescriptor::routing_tier("g", "api_gateway:8000")
            .validate()
            .is_err());
    }
}
