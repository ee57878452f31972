//! Deployment descriptor consumed by the external autoscaler.
//!
//! The gateway does not scale itself. It only carries the descriptor, checks it
//! for consistency at startup and exposes it read-only so the orchestrator (and
//! operators) can see what a replica asks for.

use serde::{Deserialize, Serialize};

/// Resource needs and replica bounds for one gateway deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub autoscaling: AutoscalingConfig,
}

/// Per-replica resource reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default = "default_num_gpus")]
    pub num_gpus: f32,
    #[serde(default = "default_num_cpus")]
    pub num_cpus: f32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            num_gpus: default_num_gpus(),
            num_cpus: default_num_cpus(),
        }
    }
}

/// Replica bounds and scaling reaction times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    /// Ongoing requests per replica the autoscaler aims for.
    #[serde(default = "default_target_ongoing")]
    pub target_ongoing_requests: u32,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_initial_replicas")]
    pub initial_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default = "default_upscale_delay")]
    pub upscale_delay_s: f64,
    #[serde(default = "default_downscale_delay")]
    pub downscale_delay_s: f64,
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            target_ongoing_requests: default_target_ongoing(),
            min_replicas: default_min_replicas(),
            initial_replicas: default_initial_replicas(),
            max_replicas: default_max_replicas(),
            upscale_delay_s: default_upscale_delay(),
            downscale_delay_s: default_downscale_delay(),
        }
    }
}

fn default_num_gpus() -> f32 {
    2.0
}
fn default_num_cpus() -> f32 {
    1.0
}
fn default_target_ongoing() -> u32 {
    1
}
fn default_min_replicas() -> u32 {
    2
}
fn default_initial_replicas() -> u32 {
    2
}
fn default_max_replicas() -> u32 {
    5
}
fn default_upscale_delay() -> f64 {
    0.1
}
fn default_downscale_delay() -> f64 {
    10.0
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DeploymentError {
    #[error("Invalid resource requirement: {0}")]
    InvalidResources(String),
    #[error("Invalid replica bounds: min={min}, initial={initial}, max={max}")]
    InvalidReplicaBounds { min: u32, initial: u32, max: u32 },
    #[error("target_ongoing_requests must be at least 1")]
    InvalidTarget,
    #[error("Invalid scaling delay: {0}")]
    InvalidDelay(&'static str),
}

impl DeploymentDescriptor {
    /// Check the descriptor for internal consistency.
    pub fn validate(&self) -> Result<(), DeploymentError> {
        let r = &self.resources;
        if !(r.num_gpus.is_finite() && r.num_gpus >= 0.0) {
            return Err(DeploymentError::InvalidResources(format!("num_gpus={}", r.num_gpus)));
        }
        if !(r.num_cpus.is_finite() && r.num_cpus >= 0.0) {
            return Err(DeploymentError::InvalidResources(format!("num_cpus={}", r.num_cpus)));
        }

        let a = &self.autoscaling;
        if a.min_replicas == 0 || a.min_replicas > a.initial_replicas || a.initial_replicas > a.max_replicas {
            return Err(DeploymentError::InvalidReplicaBounds {
                min: a.min_replicas,
                initial: a.initial_replicas,
                max: a.max_replicas,
            });
        }
        if a.target_ongoing_requests == 0 {
            return Err(DeploymentError::InvalidTarget);
        }
        if !(a.upscale_delay_s.is_finite() && a.upscale_delay_s >= 0.0) {
            return Err(DeploymentError::InvalidDelay("upscale_delay_s"));
        }
        if !(a.downscale_delay_s.is_finite() && a.downscale_delay_s >= 0.0) {
            return Err(DeploymentError::InvalidDelay("downscale_delay_s"));
        }
        Ok(())
    }
}
