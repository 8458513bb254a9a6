// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! PTZ 哨兵 (PTZ Sentinel)
//!
//! 系统架构:
//! 1. 检测采集线程: UDP 接收检测结果
//! 2. 位姿采集线程: 轮询相机位姿
//! 3. 匹配线程:     检测与位姿对齐, 更新热力图
//! 4. 主线程:       转发新匹配到告警, 定期输出热区

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ptz_sentinel::{
    Alarm, Args, BBoxCameraPoseConverter, CameraSettings, DetectionPositionMatcher, IsapiCamera,
};

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = CameraSettings::load(&args.camera_config)?;
    info!("📹 RTSP地址: {}", settings.rtsp_url());
    let camera = Arc::new(IsapiCamera::new(&settings));

    let converter = BBoxCameraPoseConverter::new(args.converter_config());
    let matcher = DetectionPositionMatcher::start(args.matcher_config(), camera, converter)?;
    let mut alarm = Alarm::new(args.alarm_config());

    info!("✅ 系统就绪, 监听 {}", matcher.local_addr());

    // ========== 主线程: 告警 + 热区输出 ==========
    let report_interval = Duration::from_secs(args.report_interval_s.max(1));
    let mut last_report = Instant::now();
    let mut seen = 0u64;
    loop {
        thread::sleep(Duration::from_secs(1));

        // 计数与快照在同一把锁下读取
        let (total, fresh) = matcher.matches_since(seen);
        for matched in &fresh {
            let outcome = alarm.evaluate(&matched.detection);
            if outcome.fired {
                info!(
                    triggered = outcome.triggered.len(),
                    "🚨 alarm fired at {:.3}",
                    matched.detection.timestamp
                );
            }
        }
        seen = total;

        if last_report.elapsed() >= report_interval {
            last_report = Instant::now();
            let (detections, poses, matches) = matcher.queue_lengths();
            let pose = matcher
                .curr_pose()
                .map_or_else(|| "unknown".to_string(), |p| p.pose.to_string());
            info!(detections, poses, matches, total, "camera at {pose}");
            for cell in matcher.heatmap().hottest(3) {
                info!(
                    "🔥 pan {:.1} tilt {:.1} heat {:.2}",
                    cell.pan, cell.tilt, cell.heat
                );
            }
        }
    }
}
