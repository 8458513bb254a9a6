// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测框 → 相机位姿换算
//! Converts an image-space bounding box into absolute camera pointing

use serde::{Deserialize, Serialize};

use crate::types::{BBox, CameraPose};

/// 相机内参 (按镜头标定)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub img_width: f64,
    pub img_height: f64,
    pub fx_scale: f64, // 水平焦距/zoom
    pub fy_scale: f64, // 垂直焦距/zoom
    pub zoom_damping: f64, // 缩放阻尼, 防止过度放大来回振荡
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            img_width: 1920.0,
            img_height: 1080.0,
            fx_scale: 175.0,
            fy_scale: 17.0,
            zoom_damping: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BBoxCameraPoseConverter {
    config: ConverterConfig,
    cx: f64,
    cy: f64,
}

impl BBoxCameraPoseConverter {
    pub fn new(config: ConverterConfig) -> Self {
        let cx = config.img_width / 2.0;
        let cy = config.img_height / 2.0;
        Self { config, cx, cy }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// 换算检测框中心对应的绝对位姿
    ///
    /// `cam_pose` is where the camera pointed when the frame was captured.
    /// A reversed box (`x0 >= x1`) yields a zoom below the current one.
    /// Degenerate boxes are not rejected; they produce extreme or non-finite
    /// zoom values that the caller clamps.
    pub fn convert(&self, bbox: &BBox, cam_pose: &CameraPose) -> CameraPose {
        let (x_center, y_center) = bbox.center();

        // 有效焦距
        let fx = cam_pose.zoom * self.config.fx_scale;
        let fy = cam_pose.zoom * self.config.fy_scale;

        let delta_pan = ((x_center - self.cx) / fx).atan();
        let delta_tilt = ((y_center - self.cy) / fy).atan();

        let scale = if bbox.is_upright() {
            self.config.img_width / (bbox.x1 - bbox.x0)
        } else {
            (bbox.x0 - bbox.x1) / self.config.img_width
        };

        CameraPose {
            pan: cam_pose.pan + delta_pan.to_degrees(),
            tilt: cam_pose.tilt + delta_tilt.to_degrees(),
            zoom: cam_pose.zoom * scale * self.config.zoom_damping,
        }
    }

    /// 对一帧中所有检测框换算
    pub fn convert_all<'a>(
        &self,
        bboxes: impl IntoIterator<Item = &'a BBox>,
        cam_pose: &CameraPose,
    ) -> Vec<CameraPose> {
        bboxes
            .into_iter()
            .map(|bbox| self.convert(bbox, cam_pose))
            .collect()
    }
}

impl Default for BBoxCameraPoseConverter {
    fn default() -> Self {
        Self::new(ConverterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_centered_box_keeps_pan_tilt() {
        let converter = BBoxCameraPoseConverter::default();
        let bbox = BBox::new(910.0, 490.0, 1010.0, 590.0);
        let pose = converter.convert(&bbox, &CameraPose::new(120.0, -10.0, 20.0));
        assert!(approx(pose.pan, 120.0));
        assert!(approx(pose.tilt, -10.0));
        // 1920 / 100 * 20 * 0.1
        assert!(approx(pose.zoom, 38.4));
    }

    #[test]
    fn test_offsets_follow_image_axes() {
        let converter = BBoxCameraPoseConverter::default();
        let cam = CameraPose::new(0.0, 0.0, 10.0);

        let right = converter.convert(&BBox::new(1500.0, 500.0, 1600.0, 580.0), &cam);
        let left = converter.convert(&BBox::new(300.0, 500.0, 400.0, 580.0), &cam);
        assert!(right.pan > 0.0);
        assert!(left.pan < 0.0);

        let below = converter.convert(&BBox::new(910.0, 900.0, 1010.0, 1000.0), &cam);
        assert!(below.tilt > 0.0);

        let expected = ((1550.0_f64 - 960.0) / (10.0 * 175.0)).atan().to_degrees();
        assert!(approx(right.pan, expected));
    }

    #[test]
    fn test_reversed_box_zooms_out() {
        let converter = BBoxCameraPoseConverter::default();
        let cam = CameraPose::new(0.0, 0.0, 10.0);
        let reversed = converter.convert(&BBox::new(100.0, 50.0, 50.0, 150.0), &cam);
        let normal = converter.convert(&BBox::new(50.0, 50.0, 100.0, 150.0), &cam);
        assert!(reversed.zoom < normal.zoom);
        assert!(reversed.zoom < cam.zoom);
        // 同一中心
        assert!(approx(reversed.pan, normal.pan));
    }

    #[test]
    fn test_zero_width_box_does_not_panic() {
        let converter = BBoxCameraPoseConverter::default();
        let pose = converter.convert(
            &BBox::new(10.0, 10.0, 10.0, 20.0),
            &CameraPose::new(0.0, 0.0, 5.0),
        );
        assert_eq!(pose.zoom, 0.0);

        let pose = converter.convert(
            &BBox::new(10.0, 10.0, 10.0 + 1e-12, 20.0),
            &CameraPose::new(0.0, 0.0, 5.0),
        );
        assert!(pose.zoom > 1e9);
    }
}
