// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 匹配结果落盘
//!
//! 文件名在构造时确定: `pose_detection_matches_<YYYYMMDD_HHMMSS>.json`,
//! 每次匹配后整体重写 (从旧到新).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};

use crate::types::MatchedDetection;

pub const FILE_PREFIX: &str = "pose_detection_matches_";

pub fn gen_file_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}{}.json", FILE_PREFIX, now.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone)]
pub struct MatchStore {
    path: PathBuf,
}

impl MatchStore {
    /// 创建目录并确定文件名 (不写文件)
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create detections folder {}", dir.display()))?;
        Ok(Self {
            path: dir.join(gen_file_name(&Local::now())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, matches: &[MatchedDetection]) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, matches).context("failed to encode matches")?;
        writer.flush().context("failed to flush matches")?;
        Ok(())
    }
}
