// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 告警 (Alarm)
//!
//! 按类别阈值筛选检测结果, 冷却时间内只触发一次远程播放.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::types::DetectionEvent;

#[derive(Clone, Debug)]
pub struct AlarmConfig {
    /// class_id → 最低置信度
    pub triggers: BTreeMap<i64, f64>,
    pub class_names: BTreeMap<i64, String>,
    pub alarm_sound_file_name: Option<String>,
    pub cool_down: Duration,
    pub remote_player_url: String,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        let classes: [(i64, f64, &str); 11] = [
            (0, 0.0, "Human"),
            (2, 0.8, "Car"),
            (14, 0.8, "Bird"),
            (15, 0.0, "Cat"),
            (16, 0.0, "Dog"),
            (17, 0.0, "Horse"),
            (18, 0.0, "Sheep"),
            (19, 0.0, "Cow"),
            (21, 0.0, "Bear"),
            (22, 0.0, "Zebra"),
            (23, 0.0, "Giraffe"),
        ];
        Self {
            triggers: classes.iter().map(|(id, conf, _)| (*id, *conf)).collect(),
            class_names: classes
                .iter()
                .map(|(id, _, name)| (*id, name.to_string()))
                .collect(),
            alarm_sound_file_name: Some("notification_00.mp3".to_string()),
            cool_down: Duration::from_secs(20),
            remote_player_url: "http://127.0.0.1:5000".to_string(),
        }
    }
}

/// 声音播放接口
pub trait SoundPlayer: Send {
    fn play(&self, file_name: &str) -> Result<()>;
}

/// 远程播放器: POST <url>/play {"file_name": ...}
pub struct RemotePlayer {
    agent: ureq::Agent,
    url: String,
}

impl RemotePlayer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(3))
                .build(),
            url: url.into(),
        }
    }
}

impl SoundPlayer for RemotePlayer {
    fn play(&self, file_name: &str) -> Result<()> {
        let url = format!("{}/play", self.url.trim_end_matches('/'));
        let response = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({ "file_name": file_name }));
        match response {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                bail!("remote player returned HTTP {code}: {body}")
            }
            Err(e) => Err(e).with_context(|| format!("failed to call remote player {url}")),
        }
    }
}

/// 一次评估的结果
#[derive(Debug, Default)]
pub struct AlarmOutcome {
    /// 满足阈值的检测
    pub triggered: DetectionEvent,
    /// 是否实际发出声音
    pub fired: bool,
}

pub struct Alarm<P: SoundPlayer = RemotePlayer> {
    config: AlarmConfig,
    player: P,
    last_alarm: Option<Instant>,
}

impl Alarm<RemotePlayer> {
    pub fn new(config: AlarmConfig) -> Self {
        let player = RemotePlayer::new(config.remote_player_url.clone());
        Self::with_player(config, player)
    }
}

impl<P: SoundPlayer> Alarm<P> {
    pub fn with_player(config: AlarmConfig, player: P) -> Self {
        Self {
            config,
            player,
            last_alarm: None,
        }
    }

    pub fn check_alarm(&self, class_id: i64, score: f64) -> bool {
        match self.config.triggers.get(&class_id) {
            Some(min_score) if score >= *min_score => {
                let name = self
                    .config
                    .class_names
                    .get(&class_id)
                    .map_or("unknown", String::as_str);
                info!(class_id, score, "found a {name}");
                true
            }
            _ => false,
        }
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_alarm
            .map_or(true, |last| now.duration_since(last) >= self.config.cool_down)
    }

    pub fn evaluate(&mut self, detection: &DetectionEvent) -> AlarmOutcome {
        self.evaluate_at(detection, Instant::now())
    }

    pub fn evaluate_at(&mut self, detection: &DetectionEvent, now: Instant) -> AlarmOutcome {
        let mut triggered = DetectionEvent {
            timestamp: detection.timestamp,
            ..Default::default()
        };
        for (bbox, class_id, score) in detection.entries() {
            if self.check_alarm(class_id, score) {
                triggered.push(*bbox, class_id, score);
            }
        }

        if triggered.is_empty() || !self.cooled_down(now) {
            return AlarmOutcome {
                triggered,
                fired: false,
            };
        }

        self.last_alarm = Some(now);
        if let Some(file_name) = &self.config.alarm_sound_file_name {
            info!("playing alarm sound: {file_name}");
            if let Err(e) = self.player.play(file_name) {
                error!("failed to play sound: {e:#}");
            }
        }
        AlarmOutcome {
            triggered,
            fired: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BBox;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPlayer {
        played: Arc<Mutex<Vec<String>>>,
    }

    impl SoundPlayer for RecordingPlayer {
        fn play(&self, file_name: &str) -> Result<()> {
            self.played.lock().unwrap().push(file_name.to_string());
            Ok(())
        }
    }

    fn detection(entries: &[(i64, f64)]) -> DetectionEvent {
        let mut event = DetectionEvent::default();
        for (class_id, score) in entries {
            event.push(BBox::new(0.0, 0.0, 10.0, 10.0), *class_id, *score);
        }
        event
    }

    #[test]
    fn test_thresholds() {
        let player = RecordingPlayer::default();
        let mut alarm = Alarm::with_player(AlarmConfig::default(), player.clone());
        let outcome = alarm.evaluate(&detection(&[(2, 0.5), (2, 0.85), (0, 0.1), (5, 0.99)]));
        assert_eq!(outcome.triggered.class_ids, vec![2, 0]);
        assert!(outcome.fired);
        assert_eq!(*player.played.lock().unwrap(), vec!["notification_00.mp3"]);
    }

    #[test]
    fn test_cool_down() {
        let player = RecordingPlayer::default();
        let mut alarm = Alarm::with_player(AlarmConfig::default(), player.clone());
        let start = Instant::now();
        let human = detection(&[(0, 0.9)]);

        assert!(alarm.evaluate_at(&human, start).fired);
        assert!(!alarm.evaluate_at(&human, start + Duration::from_secs(5)).fired);
        assert!(alarm.evaluate_at(&human, start + Duration::from_secs(21)).fired);
        assert_eq!(player.played.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_untriggered_does_not_reset_cool_down() {
        let player = RecordingPlayer::default();
        let mut alarm = Alarm::with_player(AlarmConfig::default(), player.clone());
        let start = Instant::now();
        let outcome = alarm.evaluate_at(&detection(&[(7, 1.0)]), start);
        assert!(outcome.triggered.is_empty());
        assert!(!outcome.fired);
        assert!(alarm.evaluate_at(&detection(&[(16, 0.2)]), start).fired);
    }
}
