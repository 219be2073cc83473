/// Which way a camera sensor points relative to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Facing {
    #[default]
    Front,
    Back,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub facing: Facing,
    /// Clockwise angle the sensor image must be rotated to appear upright
    /// on a display in its natural orientation.
    pub sensor_orientation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FocusMode {
    Fixed,
    Auto,
    ContinuousVideo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewSize {
    pub width: u32,
    pub height: u32,
}

impl PreviewSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Frame rate range in frames per thousand seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }
}

/// What a device reports it can do.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub preview_sizes: Vec<PreviewSize>,
    pub default_size: PreviewSize,
    pub fps_ranges: Vec<FpsRange>,
    pub current_fps_range: FpsRange,
    pub focus_modes: Vec<FocusMode>,
}

/// What gets requested from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewParams {
    pub size: PreviewSize,
    pub fps_range: FpsRange,
    pub focus_mode: Option<FocusMode>,
    pub display_orientation: u32,
    pub recording_hint: bool,
}

pub fn find_camera(cameras: &[CameraInfo], facing: Facing) -> Option<&CameraInfo> {
    cameras.iter().find(|c| c.facing == facing)
}

pub fn has_front_camera(cameras: &[CameraInfo]) -> bool {
    find_camera(cameras, Facing::Front).is_some()
}

/// Switching facing only makes sense with several cameras, one of them in front.
pub fn has_few_cameras(cameras: &[CameraInfo]) -> bool {
    cameras.len() > 1 && has_front_camera(cameras)
}

/// Looks up the requested facing, then any front camera, then any back camera.
pub fn select_camera(cameras: &[CameraInfo], facing: Facing) -> Option<&CameraInfo> {
    find_camera(cameras, facing)
        .or_else(|| find_camera(cameras, Facing::Front))
        .or_else(|| find_camera(cameras, Facing::Back))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str, facing: Facing) -> CameraInfo {
        CameraInfo {
            id: id.to_string(),
            name: format!("camera {id}"),
            facing,
            sensor_orientation: 90,
        }
    }

    #[test]
    fn test_select_camera_fallback() {
        let cameras = vec![camera("0", Facing::Back)];
        assert_eq!(select_camera(&cameras, Facing::Front).unwrap().id, "0");
        assert!(select_camera(&[], Facing::Back).is_none());

        let cameras = vec![camera("0", Facing::Back), camera("1", Facing::Front)];
        assert_eq!(select_camera(&cameras, Facing::Front).unwrap().id, "1");
        assert_eq!(select_camera(&cameras, Facing::Back).unwrap().id, "0");
    }

    #[test]
    fn test_has_few_cameras() {
        assert!(!has_few_cameras(&[camera("0", Facing::Front)]));
        assert!(!has_few_cameras(&[
            camera("0", Facing::Back),
            camera("1", Facing::Back)
        ]));
        assert!(has_few_cameras(&[
            camera("0", Facing::Back),
            camera("1", Facing::Front)
        ]));
    }
}
