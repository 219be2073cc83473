use std::ops::Mul;

/// Column-major 4x4 matrix, laid out the way WGSL `mat4x4<f32>` uniforms expect it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [f32; 16]);

impl Default for Mat4 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mat4 {
    pub const fn identity() -> Self {
        Self([
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, //
        ])
    }

    pub fn scale(sx: f32, sy: f32, sz: f32) -> Self {
        let mut m = Self::identity();
        m.0[0] = sx;
        m.0[5] = sy;
        m.0[10] = sz;
        m
    }

    pub fn translate(tx: f32, ty: f32, tz: f32) -> Self {
        let mut m = Self::identity();
        m.0[12] = tx;
        m.0[13] = ty;
        m.0[14] = tz;
        m
    }

    /// Counter-clockwise rotation around the z axis.
    pub fn rotate_z(degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        let mut m = Self::identity();
        m.0[0] = cos;
        m.0[1] = sin;
        m.0[4] = -sin;
        m.0[5] = cos;
        m
    }

    /// Texture-coordinate transform that makes a sampled image appear rotated
    /// clockwise by `degrees`. Rotation happens around the texture center.
    pub fn texture_rotation(degrees: u32) -> Self {
        if degrees % 360 == 0 {
            return Self::identity();
        }

        Self::translate(0.5, 0.5, 0.0)
            * Self::rotate_z(degrees as f32)
            * Self::translate(-0.5, -0.5, 0.0)
    }

    pub fn as_array(&self) -> &[f32; 16] {
        &self.0
    }

    /// Applies the matrix to `(x, y, 0, 1)` and drops `z`/`w`.
    pub fn transform_point2(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0] * x + m[4] * y + m[12], m[1] * x + m[5] * y + m[13])
    }

    pub fn approx_eq(&self, other: &Mat4, eps: f32) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= eps)
    }
}

impl Mul for Mat4 {
    type Output = Mat4;

    fn mul(self, rhs: Mat4) -> Mat4 {
        let (a, b) = (&self.0, &rhs.0);
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                out[col * 4 + row] = (0..4).map(|k| a[k * 4 + row] * b[col * 4 + k]).sum();
            }
        }
        Mat4(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mul() {
        let m = Mat4::scale(2.0, 3.0, 1.0);
        assert_eq!(Mat4::identity() * m, m);
        assert_eq!(m * Mat4::identity(), m);
    }

    #[test]
    fn test_texture_rotation_90() {
        let m = Mat4::texture_rotation(90);
        let (s, t) = m.transform_point2(0.0, 1.0);
        assert!(s.abs() < 1e-5 && t.abs() < 1e-5, "({s}, {t})");

        let (s, t) = m.transform_point2(0.5, 0.5);
        assert!((s - 0.5).abs() < 1e-5 && (t - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_full_turn_is_identity() {
        let quarter = Mat4::texture_rotation(90);
        let turn = quarter * quarter * quarter * quarter;
        assert!(turn.approx_eq(&Mat4::identity(), 1e-5));
        assert_eq!(Mat4::texture_rotation(360), Mat4::identity());
    }
}
