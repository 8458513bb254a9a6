// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! PTZ 哨兵: 检测结果与相机位姿的时间对齐 + 注意力热力图
pub mod alarm; // 告警与远程播放
pub mod camera; // PTZ 相机接口
pub mod config; // 相机配置与命令行参数
pub mod converter; // 检测框 → 相机位姿
pub mod heatmap; // 动态热力图
pub mod matcher; // 检测-位姿匹配器
pub mod network; // UDP JSON 报文
pub mod planner; // 步进移动与热力图采样
pub mod queue; // 有界队列
pub mod store; // 匹配结果落盘
pub mod types; // 公共数据类型

pub use crate::alarm::{Alarm, AlarmConfig, RemotePlayer, SoundPlayer};
pub use crate::camera::{CameraError, IsapiCamera, PtzCamera, RetryPolicy};
pub use crate::config::{Args, CameraSettings};
pub use crate::converter::{BBoxCameraPoseConverter, ConverterConfig};
pub use crate::heatmap::{DynamicHeatmap, HeatCell, HeatmapConfig, SharedHeatmap};
pub use crate::matcher::{Correlator, DetectionPositionMatcher, MatchOutcome, MatcherConfig};
pub use crate::planner::{HeatmapSampler, MoveSegment, PlannedPose, SteppedMove};
pub use crate::types::{BBox, CameraPose, DetectionEvent, MatchedDetection, PoseSample};
