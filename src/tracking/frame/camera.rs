//! Pinhole camera with radial-tangential (OpenCV "plumb bob") distortion.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Intrinsics, distortion and the undistorted image bounds.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// k1, k2, p1, p2, k3
    pub distortion: [f64; 5],
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Camera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            distortion: [0.0; 5],
            min_x: 0.0,
            max_x: width as f64,
            min_y: 0.0,
            max_y: height as f64,
        }
    }

    /// Attach distortion coefficients and recompute the undistorted bounds.
    pub fn with_distortion(mut self, distortion: [f64; 5]) -> Self {
        self.distortion = distortion;
        if self.is_distorted() {
            let (w, h) = (self.width as f64, self.height as f64);
            let corners = [
                self.undistort_point(&Vector2::new(0.0, 0.0)),
                self.undistort_point(&Vector2::new(w, 0.0)),
                self.undistort_point(&Vector2::new(0.0, h)),
                self.undistort_point(&Vector2::new(w, h)),
            ];
            self.min_x = corners[0].x.min(corners[2].x);
            self.max_x = corners[1].x.max(corners[3].x);
            self.min_y = corners[0].y.min(corners[1].y);
            self.max_y = corners[2].y.max(corners[3].y);
        }
        self
    }

    pub fn is_distorted(&self) -> bool {
        self.distortion.iter().any(|&d| d != 0.0)
    }

    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a camera-frame point. `None` for points at or behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p.z;
        Some(Vector2::new(
            self.fx * p.x * inv_z + self.cx,
            self.fy * p.y * inv_z + self.cy,
        ))
    }

    /// Normalized image coordinates of an undistorted pixel.
    pub fn normalize(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy)
    }

    /// Unit bearing vector through an undistorted pixel.
    pub fn bearing(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        self.normalize(uv).push(1.0).normalize()
    }

    pub fn is_in_image(&self, uv: &Vector2<f64>) -> bool {
        uv.x >= self.min_x && uv.x < self.max_x && uv.y >= self.min_y && uv.y < self.max_y
    }

    /// Remove lens distortion from a raw pixel by fixed-point iteration.
    pub fn undistort_point(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        if !self.is_distorted() {
            return *uv;
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let xd = self.normalize(uv);
        let mut x = xd;
        for _ in 0..10 {
            let r2 = x.norm_squared();
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * x.x * x.y + p2 * (r2 + 2.0 * x.x * x.x);
            let dy = p1 * (r2 + 2.0 * x.y * x.y) + 2.0 * p2 * x.x * x.y;
            x = Vector2::new((xd.x - dx) / radial, (xd.y - dy) / radial);
        }
        Vector2::new(x.x * self.fx + self.cx, x.y * self.fy + self.cy)
    }

    /// Apply lens distortion to an ideal pixel.
    pub fn distort_point(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let x = self.normalize(uv);
        let r2 = x.norm_squared();
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
        let xd = x.x * radial + 2.0 * p1 * x.x * x.y + p2 * (r2 + 2.0 * x.x * x.x);
        let yd = x.y * radial + p1 * (r2 + 2.0 * x.y * x.y) + 2.0 * p2 * x.x * x.y;
        Vector2::new(xd * self.fx + self.cx, yd * self.fy + self.cy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_project_and_bearing() {
        let cam = Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        let p = Vector3::new(0.2, -0.1, 2.0);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv, Vector2::new(370.0, 215.0), epsilon = 1e-12);
        assert_relative_eq!(cam.bearing(&uv), p.normalize(), epsilon = 1e-12);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let cam = Camera::new(517.3, 516.5, 318.6, 255.3, 640, 480)
            .with_distortion([0.26, -0.95, -0.005, 0.0026, 1.16]);
        let ideal = Vector2::new(400.0, 300.0);
        let raw = cam.distort_point(&ideal);
        assert_relative_eq!(cam.undistort_point(&raw), ideal, epsilon = 1e-4);
    }

    #[test]
    fn test_bounds_without_distortion() {
        let cam = Camera::new(500.0, 500.0, 320.0, 240.0, 640, 480);
        assert!(cam.is_in_image(&Vector2::new(0.0, 0.0)));
        assert!(!cam.is_in_image(&Vector2::new(640.0, 10.0)));
    }
}
