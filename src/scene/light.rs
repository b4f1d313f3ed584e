//! Light types for the scene

use glam::Vec3;

/// Kind of light source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LightType {
    Directional,
    #[default]
    Point,
    Spot,
}

/// A light as supplied by the render view.
///
/// Only point lights take part in clustering. Directional and spot lights are
/// carried so that views can hand over their full light list unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightType,
    /// World-space position
    pub position: Vec3,
    /// World-space direction (directional and spot lights)
    pub direction: Vec3,
    /// Distance at which the light's contribution reaches zero
    pub range: f32,
    /// Linear RGB color
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            kind: LightType::Point,
            position: Vec3::ZERO,
            direction: -Vec3::Y,
            range: 10.0,
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl Light {
    pub fn point(position: Vec3, range: f32, color: Vec3) -> Self {
        Self {
            kind: LightType::Point,
            position,
            range,
            color,
            ..Default::default()
        }
    }

    pub fn directional(direction: Vec3, color: Vec3) -> Self {
        Self {
            kind: LightType::Directional,
            direction: direction.normalize_or_zero(),
            range: f32::INFINITY,
            color,
            ..Default::default()
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, range: f32, color: Vec3) -> Self {
        Self {
            kind: LightType::Spot,
            position,
            direction: direction.normalize_or_zero(),
            range,
            color,
            ..Default::default()
        }
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    /// Color scaled by intensity
    pub fn effective_color(&self) -> Vec3 {
        self.color * self.intensity
    }

    /// Effective color quantized to RGBA8, red in the lowest byte, alpha opaque.
    pub fn packed_color(&self) -> u32 {
        let c = self.effective_color().clamp(Vec3::ZERO, Vec3::ONE) * 255.0;
        let (r, g, b) = (c.x.round() as u32, c.y.round() as u32, c.z.round() as u32);
        r | (g << 8) | (b << 16) | (0xFF << 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_color_channel_order() {
        let light = Light::point(Vec3::ZERO, 1.0, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(light.packed_color(), 0xFF00_00FF);
        let light = Light::point(Vec3::ZERO, 1.0, Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(light.packed_color(), 0xFFFF_0000);
    }

    #[test]
    fn test_packed_color_saturates_intensity() {
        let light = Light::point(Vec3::ZERO, 1.0, Vec3::new(0.5, 0.25, 0.0)).with_intensity(4.0);
        assert_eq!(light.packed_color() & 0xFF, 255);
        assert_eq!((light.packed_color() >> 8) & 0xFF, 255);
        assert_eq!((light.packed_color() >> 16) & 0xFF, 0);
    }
}
