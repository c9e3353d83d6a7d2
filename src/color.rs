use rand::Rng;

/// Pointer splats are dimmed so repeated strokes do not saturate.
pub const POINTER_COLOR_SCALE: f32 = 0.15;
/// Ambient bursts are brightened on top of the pointer dimming.
pub const AMBIENT_COLOR_BOOST: f32 = 10.0;

/// HSV to RGB with `h`, `s`, `v` in [0, 1].
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match sector as u32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

/// A random fully saturated hue, dimmed for pointer splats.
pub fn generate_color(rng: &mut impl Rng) -> [f32; 3] {
    hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0).map(|c| c * POINTER_COLOR_SCALE)
}

pub fn ambient_color(rng: &mut impl Rng) -> [f32; 3] {
    generate_color(rng).map(|c| c * AMBIENT_COLOR_BOOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn assert_rgb(actual: [f32; 3], expected: [f32; 3]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn primary_hues() {
        assert_rgb(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
        assert_rgb(hsv_to_rgb(1.0 / 3.0, 1.0, 1.0), [0.0, 1.0, 0.0]);
        assert_rgb(hsv_to_rgb(2.0 / 3.0, 1.0, 1.0), [0.0, 0.0, 1.0]);
        assert_rgb(hsv_to_rgb(0.5, 0.0, 0.4), [0.4, 0.4, 0.4]);
    }

    #[test]
    fn pointer_and_ambient_use_distinct_magnitudes() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let c = generate_color(&mut rng);
            let max = c.iter().cloned().fold(0.0f32, f32::max);
            assert!((max - POINTER_COLOR_SCALE).abs() < 1e-5);
        }
        for _ in 0..100 {
            let c = ambient_color(&mut rng);
            let max = c.iter().cloned().fold(0.0f32, f32::max);
            assert!((max - POINTER_COLOR_SCALE * AMBIENT_COLOR_BOOST).abs() < 1e-5);
        }
    }
}
