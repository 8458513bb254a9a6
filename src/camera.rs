// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! PTZ 相机客户端
//! PTZ camera client: the polling/command interface the matcher needs, plus an
//! HTTP implementation for ISAPI-style cameras (Digest authentication).

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use digest_auth::{AuthContext, HttpMethod, WwwAuthenticateHeader};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CameraSettings;
use crate::types::CameraPose;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera request {endpoint:?} failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("camera returned HTTP {code} for {endpoint:?}")]
    Status { endpoint: String, code: u16 },
    #[error("camera authentication for {endpoint:?} failed: {message}")]
    Auth { endpoint: String, message: String },
    #[error("camera status document is missing <{0}>")]
    MissingField(&'static str),
    #[error("failed to read camera response")]
    Io(#[from] std::io::Error),
}

/// 相机接口 (位姿轮询线程 + 运动控制)
pub trait PtzCamera: Send + Sync {
    /// 当前绝对位姿
    fn get_status(&self) -> Result<CameraPose, CameraError>;

    fn move_absolute(&self, pose: &CameraPose) -> Result<(), CameraError>;

    /// 速度控制
    fn continuous_move(&self, pan: f64, tilt: f64, zoom: f64) -> Result<(), CameraError>;

    fn stop(&self) -> Result<(), CameraError> {
        self.continuous_move(0.0, 0.0, 0.0)
    }
}

/// 重试策略
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            wait: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T, CameraError>,
    ) -> Result<T, CameraError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    debug!(attempt, "{what} failed, retrying: {e}");
                    thread::sleep(self.wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ========== ISAPI HTTP 实现 ==========

static ABSOLUTE_HIGH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?AbsoluteHigh\b[^>]*>(.*?)</(?:\w+:)?AbsoluteHigh>")
        .expect("valid AbsoluteHigh pattern")
});
static AZIMUTH: Lazy<Regex> = Lazy::new(|| field_pattern("azimuth"));
static ELEVATION: Lazy<Regex> = Lazy::new(|| field_pattern("elevation"));
static ABSOLUTE_ZOOM: Lazy<Regex> = Lazy::new(|| field_pattern("absoluteZoom"));

fn field_pattern(tag: &str) -> Regex {
    Regex::new(&format!(
        r"<(?:\w+:)?{tag}>\s*(-?\d+(?:\.\d+)?)\s*</(?:\w+:)?{tag}>"
    ))
    .expect("valid field pattern")
}

fn capture_number(re: &Regex, text: &str, field: &'static str) -> Result<f64, CameraError> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or(CameraError::MissingField(field))
}

/// 解析状态 XML
///
/// azimuth 单位为 0.1°, elevation 为度, absoluteZoom 为设备单位.
pub fn parse_status(xml: &str) -> Result<CameraPose, CameraError> {
    let block = ABSOLUTE_HIGH
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or(CameraError::MissingField("AbsoluteHigh"))?;

    let azimuth = capture_number(&AZIMUTH, block, "azimuth")?;
    let elevation = capture_number(&ELEVATION, block, "elevation")?;
    let zoom = capture_number(&ABSOLUTE_ZOOM, block, "absoluteZoom")?;

    Ok(CameraPose {
        pan: azimuth / 10.0,
        tilt: elevation,
        zoom,
    })
}

static PTZ_PRESET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?PTZPreset\b[^>]*>(.*?)</(?:\w+:)?PTZPreset>")
        .expect("valid PTZPreset pattern")
});
static PRESET_ID: Lazy<Regex> = Lazy::new(|| text_pattern("id"));
static PRESET_NAME: Lazy<Regex> = Lazy::new(|| text_pattern("presetName"));

fn text_pattern(tag: &str) -> Regex {
    Regex::new(&format!(r"<(?:\w+:)?{tag}>\s*([^<]*?)\s*</(?:\w+:)?{tag}>"))
        .expect("valid text pattern")
}

/// 解析预置位列表: id → 名称 (缺 id 的条目跳过)
pub fn parse_presets(xml: &str) -> BTreeMap<String, String> {
    PTZ_PRESET
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .filter_map(|block| {
            let block = block.as_str();
            let id = PRESET_ID.captures(block)?.get(1)?.as_str().to_string();
            let name = PRESET_NAME
                .captures(block)
                .and_then(|c| c.get(1))
                .map_or_else(String::new, |m| m.as_str().to_string());
            Some((id, name))
        })
        .collect()
}

fn absolute_move_xml(pose: &CameraPose) -> String {
    format!(
        "<PTZData>\n  <AbsoluteHigh>\n    <elevation>{}</elevation>\n    \
         <azimuth>{}</azimuth>\n    <absoluteZoom>{}</absoluteZoom>\n  \
         </AbsoluteHigh>\n</PTZData>\n",
        pose.tilt as i64,
        (pose.pan * 10.0) as i64,
        pose.zoom as i64
    )
}

fn continuous_move_xml(pan: f64, tilt: f64, zoom: f64) -> String {
    format!(
        "<PTZData>\n  <pan>{}</pan>\n  <tilt>{}</tilt>\n  <zoom>{}</zoom>\n</PTZData>\n",
        pan as i64, tilt as i64, zoom as i64
    )
}

/// ISAPI PTZ 相机 (HTTP Digest 认证, 请求超时 3s)
///
/// The first request goes out without credentials; the `401` challenge is
/// cached and answered on every later request until the camera issues a
/// new one.
pub struct IsapiCamera {
    agent: ureq::Agent,
    base_url: String,
    path: String,
    user: String,
    password: String,
    retry: RetryPolicy,
    challenge: Mutex<Option<WwwAuthenticateHeader>>,
}

impl IsapiCamera {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(settings: &CameraSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Self::REQUEST_TIMEOUT)
            .build();
        Self {
            agent,
            base_url: settings.ptz_base_url(),
            path: settings.ptz_path(),
            user: settings.user.clone(),
            password: settings.password.clone(),
            retry: RetryPolicy::default(),
            challenge: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    fn map_err(endpoint: &str, err: ureq::Error) -> CameraError {
        match err {
            ureq::Error::Status(code, _) => CameraError::Status {
                endpoint: endpoint.to_string(),
                code,
            },
            ureq::Error::Transport(t) => CameraError::Transport {
                endpoint: endpoint.to_string(),
                message: t.to_string(),
            },
        }
    }

    fn auth_err(endpoint: &str, err: digest_auth::Error) -> CameraError {
        CameraError::Auth {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }

    /// 用缓存的 challenge 生成 Authorization 头 (nc 自增)
    fn authorization(
        &self,
        method: &'static str,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<Option<String>, CameraError> {
        let mut challenge = self
            .challenge
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(prompt) = challenge.as_mut() else {
            return Ok(None);
        };
        let uri = format!("{}/{}", self.path, endpoint);
        let context = AuthContext::new_with_method(
            self.user.as_str(),
            self.password.as_str(),
            uri.as_str(),
            body.map(str::as_bytes),
            HttpMethod::from(method),
        );
        let answer = prompt
            .respond(&context)
            .map_err(|e| Self::auth_err(endpoint, e))?;
        Ok(Some(answer.to_string()))
    }

    fn call(
        &self,
        method: &'static str,
        endpoint: &str,
        body: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<ureq::Response, ureq::Error> {
        let mut request = self.agent.request(method, &self.url(endpoint));
        if let Some(authorization) = authorization {
            request = request.set("Authorization", authorization);
        }
        match body {
            Some(body) => request.set("Content-Type", "text/xml").send_string(body),
            None => request.call(),
        }
    }

    fn send(
        &self,
        method: &'static str,
        endpoint: &str,
        body: Option<&str>,
    ) -> Result<String, CameraError> {
        let authorization = self.authorization(method, endpoint, body)?;
        let response = match self.call(method, endpoint, body, authorization.as_deref()) {
            Err(ureq::Error::Status(401, response)) if !self.user.is_empty() => {
                let Some(header) = response.header("WWW-Authenticate") else {
                    return Err(CameraError::Status {
                        endpoint: endpoint.to_string(),
                        code: 401,
                    });
                };
                debug!(endpoint, "camera requested authentication");
                let prompt =
                    digest_auth::parse(header).map_err(|e| Self::auth_err(endpoint, e))?;
                *self
                    .challenge
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(prompt);
                let authorization = self.authorization(method, endpoint, body)?;
                self.call(method, endpoint, body, authorization.as_deref())
            }
            other => other,
        }
        .map_err(|e| Self::map_err(endpoint, e))?;
        Ok(response.into_string()?)
    }

    fn put(&self, endpoint: &str, xml: &str) -> Result<String, CameraError> {
        self.retry
            .run(endpoint, || self.send("PUT", endpoint, Some(xml)))
    }

    fn post(&self, endpoint: &str, xml: &str) -> Result<String, CameraError> {
        self.retry
            .run(endpoint, || self.send("POST", endpoint, Some(xml)))
    }

    fn get(&self, endpoint: &str) -> Result<String, CameraError> {
        self.retry.run(endpoint, || self.send("GET", endpoint, None))
    }

    pub fn go_to_preset(&self, preset_id: u32) -> Result<(), CameraError> {
        self.put(&format!("presets/{preset_id}/goto"), "")?;
        Ok(())
    }

    pub fn save_preset(&self, preset_id: u32) -> Result<(), CameraError> {
        let xml = format!(
            "<PTZPreset>\n  <id>{preset_id}</id>\n  <presetName>{preset_id}</presetName>\n</PTZPreset>\n"
        );
        self.post("presets", &xml)?;
        Ok(())
    }

    /// 预置位列表: id → 名称
    pub fn list_presets(&self) -> Result<BTreeMap<String, String>, CameraError> {
        let body = self.get("presets")?;
        Ok(parse_presets(&body))
    }
}

impl PtzCamera for IsapiCamera {
    fn get_status(&self) -> Result<CameraPose, CameraError> {
        let body = self.get("status")?;
        parse_status(&body).map_err(|e| {
            warn!("unexpected status document: {e}");
            e
        })
    }

    fn move_absolute(&self, pose: &CameraPose) -> Result<(), CameraError> {
        self.put("absolute", &absolute_move_xml(pose))?;
        Ok(())
    }

    fn continuous_move(&self, pan: f64, tilt: f64, zoom: f64) -> Result<(), CameraError> {
        self.put("continuous", &continuous_move_xml(pan, tilt, zoom))?;
        Ok(())
    }
}
