use glam::{Mat4, Vec3};

/// A perspective camera.
///
/// Ray generation reconstructs primary rays from the inverse view-projection
/// matrix, so only [`Camera::inverse_view_projection`] and the position reach
/// the GPU. The pipeline compares cameras frame to frame and restarts
/// progressive accumulation whenever one changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view, radians.
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(1.0, 1.2, 4.0),
            target: Vec3::new(0.0, 0.5, 0.0),
            up: Vec3::Y,
            fov_y: 45f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 1.0,
            far: 10000.0,
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn looking_at(mut self, target: Vec3) -> Self {
        self.target = target;
        self
    }

    pub fn with_fov(mut self, fov_degrees: f32) -> Self {
        self.fov_y = fov_degrees.to_radians();
        self
    }

    pub fn with_aspect(mut self, aspect: f32) -> Self {
        self.set_aspect(aspect);
        self
    }

    pub fn with_z_range(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Ignores non-positive ratios (minimized windows).
    pub fn set_aspect(&mut self, aspect: f32) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(self.up).normalize_or_zero()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// Maps clip space back to world space.
    pub fn inverse_view_projection(&self) -> Mat4 {
        self.view_projection().inverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_of_screen_looks_at_target() {
        let camera = Camera::new()
            .at(Vec3::new(0.0, 0.0, 5.0))
            .looking_at(Vec3::ZERO)
            .with_aspect(1.0);

        let inverse = camera.inverse_view_projection();
        let near = inverse.project_point3(Vec3::new(0.0, 0.0, 0.0));
        let far = inverse.project_point3(Vec3::new(0.0, 0.0, 1.0));
        let direction = (far - near).normalize();

        assert!((direction - camera.forward()).length() < 1e-3);
    }

    #[test]
    fn invalid_aspect_is_ignored() {
        let mut camera = Camera::new().with_aspect(2.0);
        camera.set_aspect(0.0);
        camera.set_aspect(f32::NAN);
        assert_eq!(camera.aspect, 2.0);
    }

    #[test]
    fn right_is_perpendicular() {
        let camera = Camera::default();
        assert!(camera.right().dot(camera.forward()).abs() < 1e-6);
        assert!(camera.right().dot(camera.up).abs() < 1e-6);
    }
}
