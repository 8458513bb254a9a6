// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运动规划 (Motion Planning)
//!
//! - `SteppedMove`: 两个位姿之间线性插值的步进序列
//! - `HeatmapSampler`: 以热力图为目标分布的 Metropolis-Hastings 随机游走

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::{CameraError, PtzCamera};
use crate::heatmap::DynamicHeatmap;
use crate::types::CameraPose;

/// 目标位姿 + 到达后停留时间
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedPose {
    #[serde(flatten)]
    pub pose: CameraPose,
    #[serde(rename = "wait_time_ms", default = "default_wait_ms")]
    pub wait_ms: f64,
}

fn default_wait_ms() -> f64 {
    1000.0
}

impl PlannedPose {
    pub fn new(pose: CameraPose, wait_ms: f64) -> Self {
        Self { pose, wait_ms }
    }
}

impl std::fmt::Display for PlannedPose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, wait_ms: {}", self.pose, self.wait_ms.round() as i64)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 {
        (end - start) / (n - 1) as f64
    } else {
        0.0
    };
    (0..n).map(move |i| if i + 1 == n && n > 1 { end } else { start + step * i as f64 })
}

/// 序列文件中的一段: 起止位姿之间插值 `nr_steps` 步
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveSegment {
    pub start_pose: PlannedPose,
    pub end_pose: PlannedPose,
    pub nr_steps: usize,
}

// ========== 步进移动 ==========

#[derive(Clone, Debug, Default)]
pub struct SteppedMove {
    steps: VecDeque<PlannedPose>,
    total_steps: usize,
}

impl SteppedMove {
    pub fn new(from: PlannedPose, to: PlannedPose, nr_steps: usize) -> Self {
        let mut moves = Self::default();
        moves.add_linspaced_steps(from, to, nr_steps);
        moves
    }

    /// 追加 `nr_steps` 个等间距步 (含两端点)
    pub fn add_linspaced_steps(&mut self, from: PlannedPose, to: PlannedPose, nr_steps: usize) {
        let pans = linspace(from.pose.pan, to.pose.pan, nr_steps);
        let tilts = linspace(from.pose.tilt, to.pose.tilt, nr_steps);
        let zooms = linspace(from.pose.zoom, to.pose.zoom, nr_steps);
        let waits = linspace(from.wait_ms, to.wait_ms, nr_steps);

        self.steps.extend(
            pans.zip(tilts)
                .zip(zooms)
                .zip(waits)
                .map(|(((pan, tilt), zoom), wait_ms)| {
                    PlannedPose::new(CameraPose::new(pan, tilt, zoom), wait_ms)
                }),
        );
        self.total_steps = self.steps.len();
        info!("{from} -> {to}, generated {nr_steps} steps");
    }

    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a MoveSegment>) -> Self {
        let mut moves = Self::default();
        for segment in segments {
            moves.add_linspaced_steps(segment.start_pose, segment.end_pose, segment.nr_steps);
        }
        moves
    }

    /// 从序列文件 (JSON 数组, 每项一个 `MoveSegment`) 加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read move sequence {}", path.display()))?;
        let segments: Vec<MoveSegment> = serde_json::from_str(&json)
            .with_context(|| format!("invalid move sequence {}", path.display()))?;
        info!("loaded {} segments from {}", segments.len(), path.display());
        Ok(Self::from_segments(&segments))
    }

    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn pop_step(&mut self) -> Option<PlannedPose> {
        let step = self.steps.pop_front()?;
        debug!(remaining = self.steps.len(), "next step: {step}");
        Some(step)
    }

    /// 依次移动相机并停留, `should_stop` 返回 true 时提前结束
    ///
    /// Returns the number of executed steps. A failed move aborts the sequence.
    pub fn execute(
        &mut self,
        camera: &dyn PtzCamera,
        mut should_stop: impl FnMut() -> bool,
    ) -> Result<usize, CameraError> {
        let mut executed = 0;
        while !should_stop() {
            let Some(step) = self.pop_step() else {
                break;
            };
            camera.move_absolute(&step.pose)?;
            executed += 1;
            if step.wait_ms > 0.0 {
                thread::sleep(Duration::from_secs_f64(step.wait_ms / 1000.0));
            }
        }
        Ok(executed)
    }
}

// ========== 热力图采样 ==========

/// 目标密度下限, 冷区域也能被提议接受
pub const MIN_TARGET_DENSITY: f64 = 1e-6;

#[derive(Clone, Copy, Debug)]
pub struct HeatmapSampler {
    /// 提议分布标准差 (度)
    pub step_size: f64,
}

impl Default for HeatmapSampler {
    fn default() -> Self {
        Self { step_size: 0.1 }
    }
}

impl HeatmapSampler {
    pub fn new(step_size: f64) -> Self {
        Self { step_size }
    }

    fn density(heatmap: &DynamicHeatmap, pan: f64, tilt: f64) -> f64 {
        heatmap.heat_at(pan, tilt).max(MIN_TARGET_DENSITY)
    }

    /// 从 `start` (pan, tilt) 出发采样 `num_samples` 个位置
    ///
    /// pan 取模 360, tilt 截断到 [-90, 90].
    pub fn sample<R: Rng + ?Sized>(
        &self,
        heatmap: &DynamicHeatmap,
        start: (f64, f64),
        num_samples: usize,
        rng: &mut R,
    ) -> Vec<(f64, f64)> {
        let proposal_step = match Normal::new(0.0, self.step_size.max(0.0)) {
            Ok(normal) => normal,
            Err(e) => {
                warn!(step_size = self.step_size, "invalid proposal step: {e}");
                return Vec::new();
            }
        };
        let (mut pan, mut tilt) = (start.0.rem_euclid(360.0), start.1.clamp(-90.0, 90.0));
        let mut current = Self::density(heatmap, pan, tilt);
        let mut samples = Vec::with_capacity(num_samples);
        let mut accepted = 0usize;

        for _ in 0..num_samples {
            let proposal_pan = (pan + proposal_step.sample(rng)).rem_euclid(360.0);
            let proposal_tilt = (tilt + proposal_step.sample(rng)).clamp(-90.0, 90.0);
            let proposal = Self::density(heatmap, proposal_pan, proposal_tilt);

            let acceptance = (proposal / current).min(1.0);
            if rng.gen::<f64>() < acceptance {
                pan = proposal_pan;
                tilt = proposal_tilt;
                current = proposal;
                accepted += 1;
            }
            samples.push((pan, tilt));
        }

        debug!(num_samples, accepted, "metropolis-hastings walk finished");
        samples
    }

    /// 采样序列转为步进移动 (固定 zoom 与停留时间)
    pub fn plan(
        &self,
        samples: &[(f64, f64)],
        zoom: f64,
        wait_ms: f64,
    ) -> SteppedMove {
        let mut moves = SteppedMove::default();
        moves
            .steps
            .extend(samples.iter().map(|&(pan, tilt)| {
                PlannedPose::new(CameraPose::new(pan, tilt, zoom), wait_ms)
            }));
        moves.total_steps = moves.steps.len();
        moves
    }
}
