// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测/位姿数据结构定义
//! Data structures shared by the matcher, heatmap and converter
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ========== 数据结构 ==========

/// 检测框 (image pixel coordinates, origin top-left)
///
/// `x0 > x1` is allowed and signals a zoom-out request to the converter.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// 正常方向 (x0 < x1)
    pub fn is_upright(&self) -> bool {
        self.x0 < self.x1
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x0, b.y0, b.x1, b.y1]
    }
}

/// 相机位姿 (pan/tilt in degrees, zoom in device units)
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraPose {
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
}

impl CameraPose {
    pub fn new(pan: f64, tilt: f64, zoom: f64) -> Self {
        Self { pan, tilt, zoom }
    }

    /// 换算结果截断: 非有限的 pan/tilt 用 `fallback` 代替, zoom 截断到 [0, max_zoom]
    ///
    /// JSON has no representation for `inf`/`NaN`, so every pose that is
    /// stored or persisted goes through here first.
    pub fn clamped(&self, fallback: &CameraPose, max_zoom: f64) -> CameraPose {
        let finite_or = |v: f64, other: f64| if v.is_finite() { v } else { other };
        let zoom = if self.zoom.is_nan() {
            fallback.zoom
        } else {
            self.zoom
        };
        CameraPose {
            pan: finite_or(self.pan, fallback.pan),
            tilt: finite_or(self.tilt, fallback.tilt),
            zoom: finite_or(zoom.clamp(0.0, max_zoom.max(0.0)), 0.0),
        }
    }
}

impl std::fmt::Display for CameraPose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pan: {:.2}, tilt: {:.2}, zoom: {:.2}",
            self.pan, self.tilt, self.zoom
        )
    }
}

/// 轮询得到的位姿 + 轮询完成时间 (秒)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    #[serde(flatten)]
    pub pose: CameraPose,
    pub timestamp: f64,
}

impl PoseSample {
    pub fn new(pose: CameraPose, timestamp: f64) -> Self {
        Self { pose, timestamp }
    }
}

/// 单帧检测结果 (检测进程 → 匹配器)
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(default)]
    pub bboxes: Vec<BBox>,
    #[serde(default)]
    pub class_ids: Vec<i64>,
    #[serde(default)]
    pub scores: Vec<f64>,
    pub timestamp: f64,
}

impl DetectionEvent {
    pub fn new(bboxes: Vec<BBox>, class_ids: Vec<i64>, scores: Vec<f64>, timestamp: f64) -> Self {
        Self {
            bboxes,
            class_ids,
            scores,
            timestamp,
        }
    }

    /// 对齐后的条目数 (三个数组取最短)
    pub fn len(&self) -> usize {
        self.bboxes
            .len()
            .min(self.class_ids.len())
            .min(self.scores.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = (&BBox, i64, f64)> + '_ {
        self.bboxes
            .iter()
            .zip(self.class_ids.iter().copied())
            .zip(self.scores.iter().copied())
            .map(|((bbox, class_id), score)| (bbox, class_id, score))
    }

    pub fn push(&mut self, bbox: BBox, class_id: i64, score: f64) {
        self.bboxes.push(bbox);
        self.class_ids.push(class_id);
        self.scores.push(score);
    }

    /// 过滤低置信度
    pub fn retain_min_confidence(&mut self, min_confidence: f64) {
        self.retain(|_, _, score| score >= min_confidence);
    }

    /// 仅保留指定类别; `None` 表示不过滤
    pub fn retain_classes(&mut self, accepted: Option<&[i64]>) {
        if let Some(accepted) = accepted {
            self.retain(|_, class_id, _| accepted.contains(&class_id));
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&BBox, i64, f64) -> bool) {
        let mut kept = DetectionEvent {
            timestamp: self.timestamp,
            ..Default::default()
        };
        for (bbox, class_id, score) in self.entries() {
            if keep(bbox, class_id, score) {
                kept.push(*bbox, class_id, score);
            }
        }
        *self = kept;
    }
}

/// UDP 报文格式: 三个数组必填, timestamp 可缺省 (缺省时以到达时间填充)
#[derive(Clone, Debug, Deserialize)]
pub struct DetectionDatagram {
    pub bboxes: Vec<BBox>,
    pub class_ids: Vec<i64>,
    pub scores: Vec<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl DetectionDatagram {
    pub fn into_event(self, arrival: f64) -> DetectionEvent {
        DetectionEvent {
            bboxes: self.bboxes,
            class_ids: self.class_ids,
            scores: self.scores,
            timestamp: self.timestamp.unwrap_or(arrival),
        }
    }
}

/// 匹配结果: 每个检测框附带一个换算后的相机位姿
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchedDetection {
    #[serde(flatten)]
    pub detection: DetectionEvent,
    pub poses: Vec<CameraPose>,
}

impl MatchedDetection {
    /// (pose, score) 对, 用于热力图更新
    pub fn pose_scores(&self) -> impl Iterator<Item = (&CameraPose, f64)> + '_ {
        self.poses
            .iter()
            .zip(self.detection.scores.iter().copied())
    }
}

/// 当前 Unix 时间 (秒)
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
