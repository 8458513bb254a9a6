// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测-位姿匹配器 (Detection/Pose Matcher)
//!
//! 三线程架构:
//! 1. 检测采集线程: UDP 接收检测报文 → 检测队列
//! 2. 位姿采集线程: 轮询相机状态 → 热力图视野衰减 → 位姿队列
//! 3. 匹配线程:     按时间戳对齐两个队列的队首 → 换算位姿 → 热力图 → 匹配队列
//!
//! Matching is strictly FIFO and greedy: only the two queue heads are compared,
//! after compensating the pose timestamp by a fixed frame-to-pose latency.

use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, trace, warn};

use crate::camera::PtzCamera;
use crate::converter::BBoxCameraPoseConverter;
use crate::heatmap::{DynamicHeatmap, HeatmapConfig, SharedHeatmap};
use crate::network::{self, Received};
use crate::queue::BoundedQueue;
use crate::store::MatchStore;
use crate::types::{
    unix_timestamp, CameraPose, DetectionDatagram, DetectionEvent, MatchedDetection, PoseSample,
};

/// 匹配器参数 (时间单位: 毫秒)
#[derive(Clone, Debug)]
pub struct MatcherConfig {
    pub frame_data_port: u16,
    pub bind_address: String,
    /// 匹配时间窗
    pub min_dt_ms: i64,
    /// 图像采集 → 位姿可用 的固定延迟
    pub frame_to_pose_latency_ms: i64,
    pub detections_dir: PathBuf,
    pub write_detections: bool,
    pub detection_queue_capacity: usize,
    pub pose_queue_capacity: usize,
    pub match_queue_capacity: usize,
    pub recv_timeout_ms: u64,
    pub poll_retry_ms: u64,
    pub poll_interval_ms: u64,
    pub idle_sleep_ms: u64,
    pub heatmap: HeatmapConfig,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            frame_data_port: 4545,
            bind_address: "127.0.0.1".to_string(),
            min_dt_ms: 500,
            frame_to_pose_latency_ms: -1350,
            detections_dir: PathBuf::from("data/detections"),
            write_detections: false,
            detection_queue_capacity: 1000,
            pose_queue_capacity: 1000,
            match_queue_capacity: 100,
            recv_timeout_ms: 100,
            poll_retry_ms: 100,
            poll_interval_ms: 0,
            idle_sleep_ms: 10,
            heatmap: HeatmapConfig::default(),
        }
    }
}

impl MatcherConfig {
    pub fn min_dt(&self) -> f64 {
        self.min_dt_ms as f64 / 1000.0
    }

    pub fn frame_to_pose_latency(&self) -> f64 {
        self.frame_to_pose_latency_ms as f64 / 1000.0
    }
}

/// 单步匹配结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// 任一队列为空
    Idle,
    Matched,
    /// 位姿过旧, 丢弃队首位姿
    PoseDiscarded,
    /// 检测过旧, 丢弃队首检测
    DetectionDiscarded,
}

// ========== 匹配状态 ==========

/// Queues, heatmap and matching policy, independent of the worker threads.
pub struct Correlator {
    min_dt: f64,
    latency: f64,
    converter: BBoxCameraPoseConverter,
    heatmap: SharedHeatmap,
    detections: BoundedQueue<DetectionEvent>,
    poses: BoundedQueue<PoseSample>,
    matches: BoundedQueue<MatchedDetection>,
    curr_pose: Mutex<Option<PoseSample>>,
    store: Option<MatchStore>,
    max_zoom: f64,
}

impl Correlator {
    pub fn new(config: &MatcherConfig, converter: BBoxCameraPoseConverter) -> Result<Self> {
        let store = if config.write_detections {
            let store = MatchStore::create(&config.detections_dir)?;
            info!("matches will be written to {}", store.path().display());
            Some(store)
        } else {
            None
        };

        Ok(Self {
            min_dt: config.min_dt(),
            latency: config.frame_to_pose_latency(),
            converter,
            heatmap: SharedHeatmap::new(DynamicHeatmap::new(config.heatmap.clone())),
            detections: BoundedQueue::new(config.detection_queue_capacity),
            poses: BoundedQueue::new(config.pose_queue_capacity),
            matches: BoundedQueue::new(config.match_queue_capacity),
            curr_pose: Mutex::new(None),
            store,
            max_zoom: config.heatmap.max_zoom,
        })
    }

    pub fn push_detection(&self, event: DetectionEvent) {
        if let Some(dropped) = self.detections.push(event) {
            trace!(timestamp = dropped.timestamp, "detection queue full, dropped oldest");
        }
    }

    /// 位姿采集: 先衰减当前视野, 再打时间戳入队
    pub fn observe_pose(&self, pose: CameraPose) {
        self.heatmap.decay(&pose);
        self.enqueue_pose(PoseSample::new(pose, unix_timestamp()));
    }

    /// 同 `observe_pose`, 使用给定时间戳
    pub fn observe_pose_at(&self, pose: CameraPose, timestamp: f64) {
        self.heatmap.decay(&pose);
        self.enqueue_pose(PoseSample::new(pose, timestamp));
    }

    fn enqueue_pose(&self, sample: PoseSample) {
        *self
            .curr_pose
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sample);
        if let Some(dropped) = self.poses.push(sample) {
            trace!(timestamp = dropped.timestamp, "pose queue full, dropped oldest");
        }
    }

    /// 比较两个队首, 执行一次匹配/丢弃
    pub fn match_step(&self) -> MatchOutcome {
        let (detection, pose) = {
            // 加锁顺序固定: 检测 → 位姿; 生产者只锁自己的队列
            let mut detections = self.detections.consumer();
            let mut poses = self.poses.consumer();
            let (Some(det_head), Some(pose_head)) = (detections.front(), poses.front()) else {
                return MatchOutcome::Idle;
            };

            let dt = pose_head.timestamp - det_head.timestamp - self.latency;
            if dt.abs() <= self.min_dt {
                match (detections.pop_front(), poses.pop_front()) {
                    (Some(detection), Some(pose)) => (detection, pose),
                    _ => return MatchOutcome::Idle,
                }
            } else if dt < -self.min_dt {
                poses.pop_front();
                trace!(dt, "pose too old for head detection, discarded");
                return MatchOutcome::PoseDiscarded;
            } else {
                detections.pop_front();
                trace!(dt, "detection too old for head pose, discarded");
                return MatchOutcome::DetectionDiscarded;
            }
        };

        let poses = self
            .converter
            .convert_all(&detection.bboxes, &pose.pose)
            .into_iter()
            .map(|converted| converted.clamped(&pose.pose, self.max_zoom))
            .collect();
        let matched = MatchedDetection { detection, poses };
        self.heatmap.update(&matched);
        self.matches.push(matched);

        debug!(
            matches = self.matches.len(),
            detections = self.detections.len(),
            poses = self.poses.len(),
            "matched detection with camera pose"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.write(&self.matches.snapshot()) {
                warn!("failed to write matches: {e:#}");
            }
        }
        MatchOutcome::Matched
    }

    /// 反复匹配直到某个队列为空, 返回本次匹配数
    pub fn run_until_idle(&self) -> usize {
        let mut matched = 0;
        loop {
            match self.match_step() {
                MatchOutcome::Idle => return matched,
                MatchOutcome::Matched => matched += 1,
                MatchOutcome::PoseDiscarded | MatchOutcome::DetectionDiscarded => {}
            }
        }
    }

    pub fn heatmap(&self) -> &SharedHeatmap {
        &self.heatmap
    }

    pub fn converter(&self) -> &BBoxCameraPoseConverter {
        &self.converter
    }

    pub fn curr_pose(&self) -> Option<PoseSample> {
        *self
            .curr_pose
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 匹配队列快照 (从旧到新)
    pub fn matches(&self) -> Vec<MatchedDetection> {
        self.matches.snapshot()
    }

    /// 累计匹配数 (单调递增, 不受队列容量影响)
    pub fn match_count(&self) -> u64 {
        self.matches.pushed()
    }

    /// 第 `seen` 个匹配之后的新匹配 + 当前累计匹配数
    pub fn matches_since(&self, seen: u64) -> (u64, Vec<MatchedDetection>) {
        self.matches.snapshot_since(seen)
    }

    /// (检测队列, 位姿队列, 匹配队列) 长度
    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        (self.detections.len(), self.poses.len(), self.matches.len())
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref().map(MatchStore::path)
    }
}

// ========== 关闭信号 ==========

/// 发送端被丢弃即视为关闭, 所有等待中的线程立即醒来
#[derive(Clone)]
struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// 最多等待 `timeout`; 收到关闭信号返回 true
    fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

// ========== 工作线程 ==========

/// 单次接收结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Collected {
    Pushed,
    /// 超时, 已经在 recv 中等待过
    Idle,
    /// 坏报文或 socket 错误, 需要退避
    Backoff,
}

fn collect_once(correlator: &Correlator, socket: &UdpSocket) -> Collected {
    match network::recv_json::<DetectionDatagram>(socket) {
        Ok(Received::Data(datagram, from)) => {
            let event = datagram.into_event(unix_timestamp());
            trace!(%from, boxes = event.bboxes.len(), timestamp = event.timestamp, "detection received");
            correlator.push_detection(event);
            Collected::Pushed
        }
        Ok(Received::Empty) => Collected::Idle,
        Ok(Received::Malformed) => Collected::Backoff,
        Err(e) => {
            warn!("detection receive failed: {e}");
            Collected::Backoff
        }
    }
}

fn collect_detection_data(
    correlator: Arc<Correlator>,
    socket: UdpSocket,
    shutdown: ShutdownSignal,
    error_backoff: Duration,
) {
    info!("detection collector started");
    while !shutdown.is_triggered() {
        if collect_once(&correlator, &socket) == Collected::Backoff && shutdown.wait(error_backoff) {
            break;
        }
    }
    info!("detection collector stopped");
}

fn collect_camera_poses(
    correlator: Arc<Correlator>,
    camera: Arc<dyn PtzCamera>,
    shutdown: ShutdownSignal,
    retry: Duration,
    interval: Duration,
) {
    info!("pose collector started");
    while !shutdown.is_triggered() {
        match camera.get_status() {
            Ok(pose) => {
                correlator.observe_pose(pose);
                if !interval.is_zero() && shutdown.wait(interval) {
                    break;
                }
            }
            Err(e) => {
                warn!("camera status poll failed: {e}");
                if shutdown.wait(retry) {
                    break;
                }
            }
        }
    }
    info!("pose collector stopped");
}

fn match_detection_and_pose(correlator: Arc<Correlator>, shutdown: ShutdownSignal, idle: Duration) {
    info!("matcher loop started");
    while !shutdown.is_triggered() {
        if correlator.match_step() == MatchOutcome::Idle && shutdown.wait(idle) {
            break;
        }
    }
    info!("matcher loop stopped");
}

// ========== 匹配器 ==========

/// Owns the correlator and its three worker threads for one camera session.
pub struct DetectionPositionMatcher {
    correlator: Arc<Correlator>,
    shutdown_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl DetectionPositionMatcher {
    /// 绑定 UDP 端口并启动三个工作线程
    ///
    /// Fails only if the socket cannot be bound, the detections folder cannot
    /// be created, or a thread cannot be spawned.
    pub fn start(
        config: MatcherConfig,
        camera: Arc<dyn PtzCamera>,
        converter: BBoxCameraPoseConverter,
    ) -> Result<Self> {
        let socket = network::create_udp_socket(
            &config.bind_address,
            config.frame_data_port,
            Some(Duration::from_millis(config.recv_timeout_ms)),
        )?;
        let local_addr = socket.local_addr().context("failed to read UDP address")?;
        let correlator = Arc::new(Correlator::new(&config, converter)?);

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let shutdown = ShutdownSignal { rx: shutdown_rx };
        let retry = Duration::from_millis(config.poll_retry_ms);
        let interval = Duration::from_millis(config.poll_interval_ms);
        let idle = Duration::from_millis(config.idle_sleep_ms);

        let mut workers = Vec::with_capacity(3);
        {
            let correlator = Arc::clone(&correlator);
            let shutdown = shutdown.clone();
            workers.push(
                thread::Builder::new()
                    .name("detection-collector".into())
                    .spawn(move || collect_detection_data(correlator, socket, shutdown, retry))
                    .context("failed to spawn detection collector")?,
            );
        }
        {
            let correlator = Arc::clone(&correlator);
            let shutdown = shutdown.clone();
            workers.push(
                thread::Builder::new()
                    .name("pose-collector".into())
                    .spawn(move || {
                        collect_camera_poses(correlator, camera, shutdown, retry, interval)
                    })
                    .context("failed to spawn pose collector")?,
            );
        }
        {
            let correlator = Arc::clone(&correlator);
            workers.push(
                thread::Builder::new()
                    .name("pose-matcher".into())
                    .spawn(move || match_detection_and_pose(correlator, shutdown, idle))
                    .context("failed to spawn matcher loop")?,
            );
        }

        info!(
            address = %local_addr,
            min_dt_ms = config.min_dt_ms,
            latency_ms = config.frame_to_pose_latency_ms,
            "detection/pose matcher running"
        );

        Ok(Self {
            correlator,
            shutdown_tx: Some(shutdown_tx),
            workers,
            local_addr,
        })
    }

    /// 实际监听地址 (端口为 0 时由系统分配)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn heatmap(&self) -> &SharedHeatmap {
        self.correlator.heatmap()
    }

    pub fn curr_pose(&self) -> Option<PoseSample> {
        self.correlator.curr_pose()
    }

    pub fn matches(&self) -> Vec<MatchedDetection> {
        self.correlator.matches()
    }

    pub fn match_count(&self) -> u64 {
        self.correlator.match_count()
    }

    pub fn matches_since(&self, seen: u64) -> (u64, Vec<MatchedDetection>) {
        self.correlator.matches_since(seen)
    }

    pub fn queue_lengths(&self) -> (usize, usize, usize) {
        self.correlator.queue_lengths()
    }

    /// 通知所有线程退出并等待
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shutdown_tx.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!("{name} thread panicked");
            }
        }
        info!("detection/pose matcher stopped");
    }
}

impl Drop for DetectionPositionMatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
