use crate::camera_info::{Facing, FocusMode, FpsRange, PreviewSize};

pub const ASPECT_TOLERANCE: f64 = 0.05;

fn matches_ratio(size: &PreviewSize, aspect_ratio: f64) -> bool {
    size.height > 0 && (size.aspect_ratio() - aspect_ratio).abs() <= ASPECT_TOLERANCE
}

/// Largest-height size within [`ASPECT_TOLERANCE`] of `aspect_ratio`, capped
/// by `max_height` when given. Falls back to the uncapped choice when nothing
/// fits under the cap.
pub fn optimal_preview_size(
    sizes: &[PreviewSize],
    aspect_ratio: f64,
    max_height: Option<u32>,
) -> Option<PreviewSize> {
    let largest = |cap: Option<u32>| {
        sizes
            .iter()
            .filter(|s| matches_ratio(s, aspect_ratio))
            .filter(|s| cap.is_none_or(|h| s.height <= h))
            .fold(None::<PreviewSize>, |best, s| match best {
                Some(b) if b.height >= s.height => Some(b),
                _ => Some(*s),
            })
    };

    match max_height {
        Some(h) => largest(Some(h)).or_else(|| {
            log::debug!("no preview size under {h}px matches {aspect_ratio:.3}, ignoring the cap");
            largest(None)
        }),
        None => largest(None),
    }
}

/// The range with the highest upper bound, ties broken by the higher lower bound.
pub fn widest_fps_range(ranges: &[FpsRange]) -> Option<FpsRange> {
    ranges.iter().copied().max_by_key(|r| (r.max, r.min))
}

/// An exact fixed range for `desired` (fps x 1000) when one exists. Otherwise
/// keeps `current` and returns a guess at the rate it will deliver.
pub fn choose_fixed_fps(ranges: &[FpsRange], current: FpsRange, desired: u32) -> (FpsRange, u32) {
    if let Some(range) = ranges.iter().find(|r| r.is_fixed() && r.min == desired) {
        return (*range, range.min);
    }

    let guess = if current.is_fixed() {
        current.min
    } else {
        current.max / 2
    };
    log::debug!("no fixed fps range for {desired}, using {guess}");
    (current, guess)
}

pub fn choose_focus_mode(modes: &[FocusMode]) -> Option<FocusMode> {
    if modes.contains(&FocusMode::ContinuousVideo) {
        Some(FocusMode::ContinuousVideo)
    } else if modes.contains(&FocusMode::Auto) {
        Some(FocusMode::Auto)
    } else {
        log::info!("camera does not support autofocus");
        None
    }
}

/// Clockwise degrees the preview must be turned for the current display
/// rotation. Front sensors are mirrored, so their correction is reversed.
pub fn orientation_correction(facing: Facing, sensor_orientation: u32, display_rotation: u32) -> u32 {
    let sensor = sensor_orientation % 360;
    let rotation = display_rotation % 360;

    match facing {
        Facing::Front => (360 - (sensor + rotation) % 360) % 360,
        Facing::Back => (sensor + 360 - rotation) % 360,
    }
}

/// Size of the upright image once `rotation` is applied.
pub fn rotated_size(size: PreviewSize, rotation: u32) -> PreviewSize {
    if rotation % 180 == 0 {
        size
    } else {
        PreviewSize::new(size.height, size.width)
    }
}

/// Normalizes a display rotation to one of 0, 90, 180, 270.
pub fn normalize_rotation(degrees: i32) -> u32 {
    let d = degrees.rem_euclid(360) as u32;
    (d + 45) / 90 % 4 * 90
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> Vec<PreviewSize> {
        vec![
            PreviewSize::new(640, 480),
            PreviewSize::new(1280, 720),
            PreviewSize::new(1920, 1080),
        ]
    }

    #[test]
    fn test_preview_size_with_cap() {
        assert_eq!(
            optimal_preview_size(&sizes(), 16.0 / 9.0, Some(800)),
            Some(PreviewSize::new(1280, 720))
        );
    }

    #[test]
    fn test_preview_size_without_cap() {
        assert_eq!(
            optimal_preview_size(&sizes(), 16.0 / 9.0, None),
            Some(PreviewSize::new(1920, 1080))
        );
    }

    #[test]
    fn test_preview_size_cap_fallback() {
        assert_eq!(
            optimal_preview_size(&sizes(), 16.0 / 9.0, Some(600)),
            Some(PreviewSize::new(1920, 1080))
        );
        assert_eq!(
            optimal_preview_size(&sizes(), 4.0 / 3.0, Some(600)),
            Some(PreviewSize::new(640, 480))
        );
        assert_eq!(optimal_preview_size(&sizes(), 1.0, None), None);
        assert_eq!(optimal_preview_size(&[], 16.0 / 9.0, None), None);
    }

    #[test]
    fn test_orientation_correction() {
        assert_eq!(orientation_correction(Facing::Front, 90, 0), 270);
        assert_eq!(orientation_correction(Facing::Back, 90, 0), 90);
        assert_eq!(orientation_correction(Facing::Front, 270, 90), 0);
        assert_eq!(orientation_correction(Facing::Back, 90, 270), 180);
        assert_eq!(orientation_correction(Facing::Back, 0, 0), 0);
    }

    #[test]
    fn test_fps_choice() {
        let ranges = vec![
            FpsRange::new(15000, 15000),
            FpsRange::new(7000, 30000),
            FpsRange::new(30000, 30000),
        ];
        assert_eq!(widest_fps_range(&ranges), Some(FpsRange::new(30000, 30000)));
        assert_eq!(widest_fps_range(&[]), None);

        let current = FpsRange::new(7000, 30000);
        assert_eq!(
            choose_fixed_fps(&ranges, current, 15000),
            (FpsRange::new(15000, 15000), 15000)
        );
        assert_eq!(choose_fixed_fps(&ranges, current, 24000), (current, 15000));
        assert_eq!(
            choose_fixed_fps(&[], FpsRange::new(24000, 24000), 30000),
            (FpsRange::new(24000, 24000), 24000)
        );
    }

    #[test]
    fn test_focus_mode() {
        assert_eq!(
            choose_focus_mode(&[FocusMode::Auto, FocusMode::ContinuousVideo]),
            Some(FocusMode::ContinuousVideo)
        );
        assert_eq!(
            choose_focus_mode(&[FocusMode::Fixed, FocusMode::Auto]),
            Some(FocusMode::Auto)
        );
        assert_eq!(choose_focus_mode(&[FocusMode::Fixed]), None);
    }

    #[test]
    fn test_rotated_size() {
        let size = PreviewSize::new(1280, 720);
        assert_eq!(rotated_size(size, 0), size);
        assert_eq!(rotated_size(size, 180), size);
        assert_eq!(rotated_size(size, 270), PreviewSize::new(720, 1280));
    }

    #[test]
    fn test_normalize_rotation() {
        assert_eq!(normalize_rotation(0), 0);
        assert_eq!(normalize_rotation(-90), 270);
        assert_eq!(normalize_rotation(100), 90);
        assert_eq!(normalize_rotation(359), 0);
    }
}
