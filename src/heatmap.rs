// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 动态热力图 (Dynamic Heatmap)
//!
//! Tracks where matched detections occurred in pan/tilt space. Detections raise
//! heat with a Gaussian footprint (max-merge); the region under the current
//! camera view is decayed on every pose poll.
//!
//! 网格: `pan_bins × tilt_bins`, pan 覆盖 [0, 360), tilt 覆盖 [-90, 90].
//! The kernel does not wrap across the 0°/360° pan seam.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{CameraPose, MatchedDetection};

const KERNEL_EPS: f64 = 1e-10;

/// 读取时低于该值的格子不返回
pub const MIN_REPORTED_HEAT: f64 = 0.01;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeatmapConfig {
    pub pan_bins: usize,
    pub tilt_bins: usize,
    pub global_decay: f64,     // 全局衰减 (仅 apply_global_decay 使用)
    pub local_decay: f64,      // 视野内衰减
    pub max_zoom: f64,
    pub pan_sigma_scale: f64,  // 广角时的 pan 方向 sigma (bins)
    pub tilt_sigma_scale: f64, // 广角时的 tilt 方向 sigma (bins)
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            pan_bins: 360,
            tilt_bins: 100,
            global_decay: 0.001,
            local_decay: 0.1,
            max_zoom: 300.0,
            pan_sigma_scale: 15.0,
            tilt_sigma_scale: 3.0,
        }
    }
}

/// 热力图单元 (可视化用)
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HeatCell {
    pub pan: f64,
    pub tilt: f64,
    pub heat: f64,
}

#[derive(Clone, Debug)]
pub struct DynamicHeatmap {
    config: HeatmapConfig,
    grid: Array2<f64>, // [pan_bin, tilt_bin]
}

/// 以某个 bin 为中心的二维高斯核
struct GaussianKernel {
    p_idx: f64,
    t_idx: f64,
    inv_x: f64,
    inv_y: f64,
}

impl GaussianKernel {
    fn value(&self, p: usize, t: usize) -> f64 {
        let dx = p as f64 - self.p_idx;
        let dy = t as f64 - self.t_idx;
        (-(dx * dx * self.inv_x + dy * dy * self.inv_y)).exp()
    }
}

impl DynamicHeatmap {
    pub fn new(config: HeatmapConfig) -> Self {
        let pan_bins = config.pan_bins.max(1);
        let tilt_bins = config.tilt_bins.max(1);
        let config = HeatmapConfig {
            pan_bins,
            tilt_bins,
            ..config
        };
        Self {
            grid: Array2::zeros((pan_bins, tilt_bins)),
            config,
        }
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.config.pan_bins, self.config.tilt_bins)
    }

    /// 原始网格 (未截断, 可能短暂大于 1)
    pub fn grid(&self) -> &Array2<f64> {
        &self.grid
    }

    pub fn pan_tilt_to_bin(&self, pan: f64, tilt: f64) -> (usize, usize) {
        let pan_bins = self.config.pan_bins as f64;
        let tilt_bins = self.config.tilt_bins as f64;
        let p = (pan.rem_euclid(360.0) / 360.0 * pan_bins).floor();
        let t = ((tilt + 90.0) / 180.0 * tilt_bins).floor();
        (
            clamp_index(p, self.config.pan_bins),
            clamp_index(t, self.config.tilt_bins),
        )
    }

    pub fn bin_to_pan_tilt(&self, p_idx: usize, t_idx: usize) -> (f64, f64) {
        let pan = p_idx as f64 / self.config.pan_bins as f64 * 360.0;
        let tilt = t_idx as f64 / self.config.tilt_bins as f64 * 180.0 - 90.0;
        (pan, tilt)
    }

    /// zoom 越大 (视场越窄) sigma 越小
    pub fn zoom_to_sigma(&self, zoom: f64) -> (f64, f64) {
        let zoom_scale = 1.0 - (0.01 + zoom / self.config.max_zoom).clamp(0.0, 1.0);
        (
            zoom_scale * self.config.pan_sigma_scale,
            zoom_scale * self.config.tilt_sigma_scale,
        )
    }

    fn kernel(&self, pan: f64, tilt: f64, sigma_x: f64, sigma_y: f64) -> GaussianKernel {
        let (p_idx, t_idx) = self.pan_tilt_to_bin(pan, tilt);
        GaussianKernel {
            p_idx: p_idx as f64,
            t_idx: t_idx as f64,
            inv_x: 1.0 / (2.0 * (sigma_x * sigma_x + KERNEL_EPS)),
            inv_y: 1.0 / (2.0 * (sigma_y * sigma_y + KERNEL_EPS)),
        }
    }

    /// 逐元素取最大值合并: 重复检测会饱和而不是无限累加
    pub fn add_gaussian_heat(&mut self, pan: f64, tilt: f64, sigma_x: f64, sigma_y: f64, heat: f64) {
        let kernel = self.kernel(pan, tilt, sigma_x, sigma_y);
        for ((p, t), cell) in self.grid.indexed_iter_mut() {
            let value = heat * kernel.value(p, t);
            if value > *cell {
                *cell = value;
            }
        }
    }

    /// grid *= (1 - heat * kernel), 不允许出现负值
    pub fn subtract_gaussian_heat(
        &mut self,
        pan: f64,
        tilt: f64,
        sigma_x: f64,
        sigma_y: f64,
        heat: f64,
    ) {
        let kernel = self.kernel(pan, tilt, sigma_x, sigma_y);
        for ((p, t), cell) in self.grid.indexed_iter_mut() {
            let factor = 1.0 - heat * kernel.value(p, t);
            *cell = (*cell * factor).max(0.0);
        }
    }

    /// 当前视野区域衰减 (每次位姿轮询调用一次)
    pub fn decay_heatmap(&mut self, camera_pose: &CameraPose) {
        let (sigma_x, sigma_y) = self.zoom_to_sigma(camera_pose.zoom);
        self.subtract_gaussian_heat(
            camera_pose.pan,
            camera_pose.tilt,
            sigma_x,
            sigma_y,
            self.config.local_decay,
        );
    }

    /// 全局衰减, 匹配流程默认不调用
    pub fn apply_global_decay(&mut self) {
        let factor = (1.0 - self.config.global_decay).max(0.0);
        self.grid.mapv_inplace(|v| v * factor);
    }

    pub fn update(&mut self, detections: &MatchedDetection) {
        for (pose, score) in detections.pose_scores() {
            let (sigma_x, sigma_y) = self.zoom_to_sigma(pose.zoom);
            debug!(
                sigma_x,
                sigma_y,
                zoom = pose.zoom,
                score,
                "adding detection heat"
            );
            self.add_gaussian_heat(pose.pan, pose.tilt, sigma_x, sigma_y, score);
        }
    }

    pub fn norm_heat(&self, p_idx: usize, t_idx: usize) -> f64 {
        self.grid
            .get((p_idx, t_idx))
            .map_or(0.0, |v| v.clamp(0.0, 1.0))
    }

    pub fn heat_at(&self, pan: f64, tilt: f64) -> f64 {
        let (p_idx, t_idx) = self.pan_tilt_to_bin(pan, tilt);
        self.norm_heat(p_idx, t_idx)
    }

    /// 全网格快照, 只返回 heat >= 0.01 的格子, 值截断到 [0, 1]
    pub fn get_pan_tilt_heat_map(&self) -> Vec<HeatCell> {
        self.grid
            .indexed_iter()
            .filter_map(|((p, t), v)| {
                let heat = v.clamp(0.0, 1.0);
                if heat < MIN_REPORTED_HEAT {
                    return None;
                }
                let (pan, tilt) = self.bin_to_pan_tilt(p, t);
                Some(HeatCell { pan, tilt, heat })
            })
            .collect()
    }

    /// 最热的 n 个格子 (降序)
    pub fn hottest(&self, n: usize) -> Vec<HeatCell> {
        let mut cells = self.get_pan_tilt_heat_map();
        cells.sort_by(|a, b| b.heat.total_cmp(&a.heat));
        cells.truncate(n);
        cells
    }
}

impl Default for DynamicHeatmap {
    fn default() -> Self {
        Self::new(HeatmapConfig::default())
    }
}

fn clamp_index(idx: f64, bins: usize) -> usize {
    if idx.is_nan() || idx <= 0.0 {
        0
    } else {
        (idx as usize).min(bins - 1)
    }
}

// ========== 线程共享句柄 ==========

/// 热力图共享句柄: 写者 (位姿线程衰减 / 匹配线程更新) 互斥, 读者拿快照
#[derive(Clone, Debug, Default)]
pub struct SharedHeatmap {
    inner: Arc<RwLock<DynamicHeatmap>>,
}

impl SharedHeatmap {
    pub fn new(heatmap: DynamicHeatmap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(heatmap)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DynamicHeatmap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DynamicHeatmap> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn decay(&self, camera_pose: &CameraPose) {
        self.write().decay_heatmap(camera_pose);
    }

    pub fn update(&self, detections: &MatchedDetection) {
        self.write().update(detections);
    }

    pub fn apply_global_decay(&self) {
        self.write().apply_global_decay();
    }

    /// 完整拷贝
    pub fn snapshot(&self) -> DynamicHeatmap {
        self.read().clone()
    }

    pub fn get_pan_tilt_heat_map(&self) -> Vec<HeatCell> {
        self.read().get_pan_tilt_heat_map()
    }

    pub fn heat_at(&self, pan: f64, tilt: f64) -> f64 {
        self.read().heat_at(pan, tilt)
    }

    pub fn hottest(&self, n: usize) -> Vec<HeatCell> {
        self.read().hottest(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, DetectionEvent};

    #[test]
    fn test_bin_round_trip_within_resolution() {
        let heatmap = DynamicHeatmap::default();
        let pan_res = 360.0 / 360.0;
        let tilt_res = 180.0 / 100.0;
        let mut pan = 0.0;
        while pan < 360.0 {
            let mut tilt = -90.0;
            while tilt <= 90.0 {
                let (p, t) = heatmap.pan_tilt_to_bin(pan, tilt);
                let (pan2, tilt2) = heatmap.bin_to_pan_tilt(p, t);
                assert!((pan - pan2).abs() <= pan_res + 1e-9, "pan {pan} -> {pan2}");
                assert!((tilt - tilt2).abs() <= tilt_res + 1e-9, "tilt {tilt} -> {tilt2}");
                tilt += 7.3;
            }
            pan += 3.7;
        }
        // 边界
        assert_eq!(heatmap.pan_tilt_to_bin(0.0, 90.0), (0, 99));
        assert_eq!(heatmap.pan_tilt_to_bin(359.999, -90.0), (359, 0));
        assert_eq!(heatmap.pan_tilt_to_bin(360.0, 0.0), (0, 50));
        assert_eq!(heatmap.pan_tilt_to_bin(-10.0, 200.0), (350, 99));
        assert_eq!(heatmap.pan_tilt_to_bin(0.0, -500.0), (0, 0));
    }

    #[test]
    fn test_zoom_to_sigma() {
        let heatmap = DynamicHeatmap::default();
        let (sx, sy) = heatmap.zoom_to_sigma(0.0);
        assert!((sx - 0.99 * 15.0).abs() < 1e-9);
        assert!((sy - 0.99 * 3.0).abs() < 1e-9);

        let (wide, _) = heatmap.zoom_to_sigma(30.0);
        let (narrow, _) = heatmap.zoom_to_sigma(200.0);
        assert!(narrow < wide);
        assert_eq!(heatmap.zoom_to_sigma(1000.0), (0.0, 0.0));
    }

    #[test]
    fn test_add_heat_is_max_merged() {
        let mut heatmap = DynamicHeatmap::default();
        heatmap.add_gaussian_heat(100.0, 0.0, 5.0, 2.0, 0.8);
        assert!((heatmap.heat_at(100.0, 0.0) - 0.8).abs() < 1e-9);

        // 弱检测不会稀释强检测
        heatmap.add_gaussian_heat(100.0, 0.0, 5.0, 2.0, 0.3);
        assert!((heatmap.heat_at(100.0, 0.0) - 0.8).abs() < 1e-9);

        // 邻近格子低于中心
        assert!(heatmap.heat_at(105.0, 0.0) < 0.8);
        assert!(heatmap.heat_at(105.0, 0.0) > 0.0);
        assert!(heatmap.heat_at(250.0, 0.0) < 1e-6);
    }

    #[test]
    fn test_heat_clamped_on_read() {
        let mut heatmap = DynamicHeatmap::default();
        heatmap.add_gaussian_heat(10.0, 10.0, 3.0, 1.0, 1.7);
        heatmap.subtract_gaussian_heat(10.0, 10.0, 3.0, 1.0, 2.5);
        heatmap.add_gaussian_heat(200.0, -45.0, 8.0, 2.0, 3.0);
        heatmap.subtract_gaussian_heat(201.0, -45.0, 1.0, 1.0, 0.2);

        assert!(heatmap.grid().iter().any(|v| *v > 1.0));
        assert!(heatmap.grid().iter().all(|v| *v >= 0.0));
        for cell in heatmap.get_pan_tilt_heat_map() {
            assert!((0.0..=1.0).contains(&cell.heat));
            assert!(cell.heat >= MIN_REPORTED_HEAT);
        }
        for p in 0..360 {
            for t in 0..100 {
                let heat = heatmap.norm_heat(p, t);
                assert!((0.0..=1.0).contains(&heat));
            }
        }
    }

    #[test]
    fn test_decay_reduces_heat_under_view() {
        let mut heatmap = DynamicHeatmap::default();
        heatmap.add_gaussian_heat(50.0, 0.0, 10.0, 3.0, 1.0);
        heatmap.add_gaussian_heat(200.0, 0.0, 10.0, 3.0, 1.0);

        heatmap.decay_heatmap(&CameraPose::new(50.0, 0.0, 0.0));
        let viewed = heatmap.heat_at(50.0, 0.0);
        assert!((viewed - 0.9).abs() < 1e-9);
        // 视野外不受影响
        assert!((heatmap.heat_at(200.0, 0.0) - 1.0).abs() < 1e-6);

        for _ in 0..50 {
            heatmap.decay_heatmap(&CameraPose::new(50.0, 0.0, 0.0));
        }
        assert!(heatmap.heat_at(50.0, 0.0) < 0.01);
        assert!(heatmap.heat_at(50.0, 0.0) >= 0.0);
    }

    #[test]
    fn test_update_from_matched_detection() {
        let mut heatmap = DynamicHeatmap::default();
        let matched = MatchedDetection {
            detection: DetectionEvent::new(
                vec![BBox::new(0.0, 0.0, 1.0, 1.0), BBox::new(0.0, 0.0, 1.0, 1.0)],
                vec![0, 2],
                vec![0.9, 0.4],
                0.0,
            ),
            poses: vec![CameraPose::new(30.0, 10.0, 30.0), CameraPose::new(300.0, -20.0, 30.0)],
        };
        heatmap.update(&matched);
        assert!((heatmap.heat_at(30.0, 10.0) - 0.9).abs() < 1e-9);
        assert!((heatmap.heat_at(300.0, -20.0) - 0.4).abs() < 1e-9);

        let hottest = heatmap.hottest(1);
        assert_eq!(hottest.len(), 1);
        assert!((hottest[0].pan - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_pan_seam_is_not_wrapped() {
        let mut heatmap = DynamicHeatmap::default();
        heatmap.add_gaussian_heat(0.0, 0.0, 5.0, 2.0, 1.0);
        assert!(heatmap.heat_at(3.0, 0.0) > 0.5);
        assert!(heatmap.heat_at(357.0, 0.0) < 1e-6);
    }

    #[test]
    fn test_global_decay() {
        let mut heatmap = DynamicHeatmap::default();
        heatmap.add_gaussian_heat(90.0, 0.0, 2.0, 2.0, 1.0);
        heatmap.apply_global_decay();
        assert!((heatmap.heat_at(90.0, 0.0) - 0.999).abs() < 1e-9);
    }

    #[test]
    fn test_shared_snapshot_is_detached() {
        let shared = SharedHeatmap::default();
        shared.decay(&CameraPose::new(0.0, 0.0, 0.0));
        let snapshot = shared.snapshot();
        shared.update(&MatchedDetection {
            detection: DetectionEvent::new(vec![BBox::default()], vec![0], vec![1.0], 0.0),
            poses: vec![CameraPose::new(90.0, 0.0, 0.0)],
        });
        assert_eq!(snapshot.heat_at(90.0, 0.0), 0.0);
        assert!((shared.heat_at(90.0, 0.0) - 1.0).abs() < 1e-9);
    }
}
