//! Pointer tracking and splat generation.
//!
//! Pointer events arrive in device pixels and are normalised here to texture
//! space ([0, 1] on both axes, origin top-left). Events between two simulated
//! steps coalesce: a pointer contributes at most one splat per step.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;

use crate::color;
use crate::config::SimulationConfig;

/// Velocity range of ambient splats, per axis, centred on zero.
pub const AMBIENT_SPLAT_VELOCITY: f32 = 1000.0;
/// Random burst size used for start-up and idle bursts.
pub const RANDOM_BURST: std::ops::RangeInclusive<u32> = 5..=25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerId {
    /// The mouse, or whatever single pointer the host reports.
    Primary,
    Touch(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub id: PointerId,
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    /// Aspect-corrected displacement since the previous move.
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: [f32; 3],
}

/// One localized injection of force (`dx`, `dy`) and dye (`color`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRequest {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub color: [f32; 3],
}

pub fn aspect_ratio(width: u32, height: u32) -> f32 {
    width.max(1) as f32 / height.max(1) as f32
}

pub fn correct_delta_x(delta: f32, aspect: f32) -> f32 {
    if aspect < 1.0 {
        delta * aspect
    } else {
        delta
    }
}

pub fn correct_delta_y(delta: f32, aspect: f32) -> f32 {
    if aspect > 1.0 {
        delta / aspect
    } else {
        delta
    }
}

/// Widens the kernel on landscape surfaces; `p.x` is multiplied by the aspect
/// ratio in the splat program, so the two cancel and the kernel stays round.
pub fn correct_radius(radius: f32, aspect: f32) -> f32 {
    if aspect > 1.0 {
        radius * aspect
    } else {
        radius
    }
}

pub struct InputAdapter {
    pointers: Vec<Pointer>,
    ambient: VecDeque<u32>,
    surface: (u32, u32),
    color_timer: f32,
    idle_time: f32,
    rng: StdRng,
}

impl InputAdapter {
    pub fn new(surface_width: u32, surface_height: u32) -> Self {
        Self::with_rng(surface_width, surface_height, StdRng::from_entropy())
    }

    pub fn with_rng(surface_width: u32, surface_height: u32, rng: StdRng) -> Self {
        Self {
            pointers: vec![Self::idle_pointer(PointerId::Primary, [0.0; 3])],
            ambient: VecDeque::new(),
            surface: (surface_width, surface_height),
            color_timer: 0.0,
            idle_time: 0.0,
            rng,
        }
    }

    fn idle_pointer(id: PointerId, color: [f32; 3]) -> Pointer {
        Pointer {
            id,
            texcoord: [0.0; 2],
            prev_texcoord: [0.0; 2],
            delta: [0.0; 2],
            down: false,
            moved: false,
            color,
        }
    }

    pub fn set_surface(&mut self, width: u32, height: u32) {
        self.surface = (width, height);
    }

    pub fn surface_aspect(&self) -> f32 {
        aspect_ratio(self.surface.0, self.surface.1)
    }

    fn normalize(&self, x: f32, y: f32) -> [f32; 2] {
        [x / self.surface.0.max(1) as f32, y / self.surface.1.max(1) as f32]
    }

    pub fn pointer(&self, id: PointerId) -> Option<&Pointer> {
        self.pointers.iter().find(|p| p.id == id)
    }

    pub fn pointers(&self) -> &[Pointer] {
        &self.pointers
    }

    fn pointer_mut(&mut self, id: PointerId) -> &mut Pointer {
        let index = match self.pointers.iter().position(|p| p.id == id) {
            Some(index) => index,
            None => {
                self.pointers.push(Self::idle_pointer(id, [0.0; 3]));
                self.pointers.len() - 1
            }
        };
        &mut self.pointers[index]
    }

    /// Starts a stroke at device position (`x`, `y`) with a fresh colour.
    pub fn pointer_down(&mut self, id: PointerId, x: f32, y: f32) {
        let position = self.normalize(x, y);
        let color = color::generate_color(&mut self.rng);
        self.idle_time = 0.0;

        let pointer = self.pointer_mut(id);
        pointer.down = true;
        pointer.moved = false;
        pointer.texcoord = position;
        pointer.prev_texcoord = position;
        pointer.delta = [0.0; 2];
        pointer.color = color;
    }

    /// Moves a pressed pointer. Moves of released or unknown pointers are ignored.
    pub fn pointer_move(&mut self, id: PointerId, x: f32, y: f32) {
        let position = self.normalize(x, y);
        let aspect = self.surface_aspect();
        let Some(pointer) = self.pointers.iter_mut().find(|p| p.id == id && p.down) else {
            return;
        };
        self.idle_time = 0.0;

        pointer.prev_texcoord = pointer.texcoord;
        pointer.texcoord = position;
        pointer.delta = [
            correct_delta_x(pointer.texcoord[0] - pointer.prev_texcoord[0], aspect),
            correct_delta_y(pointer.texcoord[1] - pointer.prev_texcoord[1], aspect),
        ];
        if pointer.delta[0].abs() > 0.0 || pointer.delta[1].abs() > 0.0 {
            pointer.moved = true;
        }
    }

    /// Releases a pointer. A pending move still splats once; a released touch
    /// is dropped by the next [`take_splats`](Self::take_splats).
    pub fn pointer_up(&mut self, id: PointerId) {
        if let Some(pointer) = self.pointers.iter_mut().find(|p| p.id == id) {
            pointer.down = false;
        }
    }

    /// Drops a touch point that has left the surface entirely.
    pub fn forget(&mut self, id: PointerId) {
        if id != PointerId::Primary {
            self.pointers.retain(|p| p.id != id);
        }
    }

    pub fn request_ambient_burst(&mut self, count: u32) {
        if count > 0 {
            self.ambient.push_back(count);
        }
    }

    pub fn request_random_burst(&mut self) {
        let count = self.rng.gen_range(RANDOM_BURST);
        self.request_ambient_burst(count);
    }

    pub fn pending_bursts(&self) -> usize {
        self.ambient.len()
    }

    /// Re-rolls pointer colours every `1 / color_update_speed` seconds.
    pub fn update_colors(&mut self, dt: f32, config: &SimulationConfig) {
        if !config.colorful {
            return;
        }
        self.color_timer += dt * config.color_update_speed;
        if self.color_timer >= 1.0 {
            self.color_timer = self.color_timer.rem_euclid(1.0);
            for pointer in &mut self.pointers {
                pointer.color = color::generate_color(&mut self.rng);
            }
        }
    }

    /// Queues a random burst after `idle_burst_interval` seconds of inactivity.
    pub fn tick_idle(&mut self, dt: f32, config: &SimulationConfig) {
        let Some(interval) = config.idle_burst_interval else {
            return;
        };
        if self.pointers.iter().any(|p| p.down) {
            self.idle_time = 0.0;
            return;
        }
        self.idle_time += dt;
        if self.idle_time >= interval {
            self.idle_time = 0.0;
            self.request_random_burst();
        }
    }

    /// Splats for the next simulated step: the oldest queued ambient burst,
    /// then one splat per moved pointer. Consumed entries are gone for good.
    pub fn take_splats(&mut self, config: &SimulationConfig) -> Vec<SplatRequest> {
        let mut splats = Vec::new();

        if let Some(count) = self.ambient.pop_front() {
            for _ in 0..count {
                let color = color::ambient_color(&mut self.rng);
                splats.push(SplatRequest {
                    x: self.rng.gen(),
                    y: self.rng.gen(),
                    dx: AMBIENT_SPLAT_VELOCITY * (self.rng.gen::<f32>() - 0.5),
                    dy: AMBIENT_SPLAT_VELOCITY * (self.rng.gen::<f32>() - 0.5),
                    color,
                });
            }
        }

        for pointer in self.pointers.iter_mut().filter(|p| p.moved) {
            pointer.moved = false;
            splats.push(SplatRequest {
                x: pointer.texcoord[0],
                y: pointer.texcoord[1],
                dx: pointer.delta[0] * config.splat_force,
                dy: pointer.delta[1] * config.splat_force,
                color: pointer.color,
            });
        }
        // Finished touches have nothing left to splat.
        self.pointers.retain(|p| p.id == PointerId::Primary || p.down);

        splats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(width: u32, height: u32) -> InputAdapter {
        InputAdapter::with_rng(width, height, StdRng::seed_from_u64(42))
    }

    #[test]
    fn down_move_up_yields_one_splat() {
        let config = SimulationConfig::default();
        let mut input = adapter(100, 100);

        input.pointer_down(PointerId::Primary, 50.0, 50.0);
        assert!(input.take_splats(&config).is_empty());

        input.pointer_move(PointerId::Primary, 60.0, 50.0);
        input.pointer_up(PointerId::Primary);
        let color = input.pointer(PointerId::Primary).unwrap().color;

        let splats = input.take_splats(&config);
        assert_eq!(splats.len(), 1);
        let splat = splats[0];
        assert_eq!((splat.x, splat.y), (0.6, 0.5));
        assert!((splat.dx - 0.1 * config.splat_force).abs() < 1e-2);
        assert_eq!(splat.dy, 0.0);
        assert_eq!(splat.color, color);

        // Released: further moves are ignored until the next down.
        input.pointer_move(PointerId::Primary, 70.0, 40.0);
        assert!(input.take_splats(&config).is_empty());
        assert!(input.take_splats(&config).is_empty());

        input.pointer_down(PointerId::Primary, 70.0, 40.0);
        input.pointer_move(PointerId::Primary, 71.0, 40.0);
        assert_eq!(input.take_splats(&config).len(), 1);
    }

    #[test]
    fn moves_between_steps_coalesce() {
        let config = SimulationConfig::default();
        let mut input = adapter(200, 200);
        input.pointer_down(PointerId::Primary, 10.0, 10.0);
        for i in 1..=10 {
            input.pointer_move(PointerId::Primary, 10.0 + i as f32, 10.0);
        }
        let splats = input.take_splats(&config);
        assert_eq!(splats.len(), 1);
        assert_eq!(splats[0].x, 20.0 / 200.0);
        assert!(input.take_splats(&config).is_empty());
    }

    #[test]
    fn zero_displacement_does_not_mark_moved() {
        let mut input = adapter(100, 100);
        input.pointer_down(PointerId::Primary, 30.0, 30.0);
        input.pointer_move(PointerId::Primary, 30.0, 30.0);
        assert!(!input.pointer(PointerId::Primary).unwrap().moved);
    }

    #[test]
    fn pointer_down_resets_state() {
        let mut input = adapter(100, 100);
        input.pointer_down(PointerId::Touch(3), 10.0, 20.0);
        input.pointer_move(PointerId::Touch(3), 40.0, 20.0);
        input.pointer_down(PointerId::Touch(3), 80.0, 90.0);
        let p = input.pointer(PointerId::Touch(3)).unwrap();
        assert_eq!(p.texcoord, [0.8, 0.9]);
        assert_eq!(p.prev_texcoord, p.texcoord);
        assert_eq!(p.delta, [0.0, 0.0]);
        assert!(p.down && !p.moved);
    }

    #[test]
    fn every_moved_pointer_splats_in_the_same_step() {
        let config = SimulationConfig::default();
        let mut input = adapter(100, 100);
        for id in 0..3 {
            input.pointer_down(PointerId::Touch(id), 10.0, 10.0);
            input.pointer_move(PointerId::Touch(id), 20.0, 10.0 + id as f32);
        }
        assert_eq!(input.take_splats(&config).len(), 3);
        input.forget(PointerId::Touch(1));
        assert!(input.pointer(PointerId::Touch(1)).is_none());
    }

    #[test]
    fn finished_touches_are_dropped_after_their_last_splat() {
        let config = SimulationConfig::default();
        let mut input = adapter(100, 100);
        for id in 0..1000 {
            input.pointer_down(PointerId::Touch(id), 10.0, 10.0);
            input.pointer_move(PointerId::Touch(id), 20.0, 10.0);
            input.pointer_up(PointerId::Touch(id));
            assert_eq!(input.take_splats(&config).len(), 1);
        }
        assert_eq!(input.pointers().len(), 1);
        assert!(input.pointer(PointerId::Primary).is_some());

        // A held touch survives the step; it goes once released.
        input.pointer_down(PointerId::Touch(7), 50.0, 50.0);
        input.take_splats(&config);
        assert!(input.pointer(PointerId::Touch(7)).is_some());
        input.pointer_up(PointerId::Touch(7));
        input.take_splats(&config);
        assert!(input.pointer(PointerId::Touch(7)).is_none());
    }

    #[test]
    fn ambient_burst_is_consumed_once_in_fifo_order() {
        let config = SimulationConfig::default();
        let mut input = adapter(100, 100);
        input.request_ambient_burst(4);
        input.request_ambient_burst(2);

        let first = input.take_splats(&config);
        assert_eq!(first.len(), 4);
        for splat in &first {
            assert!((0.0..=1.0).contains(&splat.x) && (0.0..=1.0).contains(&splat.y));
            assert!(splat.dx.abs() <= AMBIENT_SPLAT_VELOCITY / 2.0);
        }
        assert_eq!(input.take_splats(&config).len(), 2);
        assert!(input.take_splats(&config).is_empty());
        assert_eq!(input.pending_bursts(), 0);
    }

    #[test]
    fn landscape_corrections_are_inverse() {
        let aspect = aspect_ratio(200, 100);
        assert_eq!(aspect, 2.0);
        assert_eq!(correct_radius(0.01, aspect), 0.02);
        assert_eq!(correct_delta_y(0.5, aspect), 0.25);
        assert_eq!(correct_delta_x(0.5, aspect), 0.5);
        // Scaling the radius up and the vertical delta down undo each other.
        assert_eq!(correct_delta_y(correct_radius(0.3, aspect), aspect), 0.3);
    }

    #[test]
    fn portrait_scales_horizontal_delta() {
        let aspect = aspect_ratio(100, 200);
        assert_eq!(correct_delta_x(0.5, aspect), 0.25);
        assert_eq!(correct_delta_y(0.5, aspect), 0.5);
        assert_eq!(correct_radius(0.01, aspect), 0.01);
    }

    #[test]
    fn horizontal_move_on_wide_surface_keeps_full_delta() {
        let config = SimulationConfig::default();
        let mut input = adapter(200, 100);
        input.pointer_down(PointerId::Primary, 100.0, 50.0);
        input.pointer_move(PointerId::Primary, 120.0, 60.0);
        let p = input.pointer(PointerId::Primary).unwrap();
        assert!((p.delta[0] - 0.1).abs() < 1e-6);
        assert!((p.delta[1] - 0.05).abs() < 1e-6);
        assert_eq!(input.take_splats(&config).len(), 1);
    }

    #[test]
    fn colors_cycle_only_when_colorful() {
        let mut config = SimulationConfig {
            color_update_speed: 10.0,
            ..Default::default()
        };
        let mut input = adapter(100, 100);
        input.pointer_down(PointerId::Primary, 1.0, 1.0);
        let before = input.pointer(PointerId::Primary).unwrap().color;
        input.update_colors(0.05, &config);
        assert_eq!(input.pointer(PointerId::Primary).unwrap().color, before);
        input.update_colors(0.06, &config);
        assert_ne!(input.pointer(PointerId::Primary).unwrap().color, before);

        config.colorful = false;
        let fixed = input.pointer(PointerId::Primary).unwrap().color;
        input.update_colors(10.0, &config);
        assert_eq!(input.pointer(PointerId::Primary).unwrap().color, fixed);
    }

    #[test]
    fn idle_bursts_fire_after_inactivity() {
        let config = SimulationConfig {
            idle_burst_interval: Some(2.0),
            ..Default::default()
        };
        let mut input = adapter(100, 100);
        input.tick_idle(1.5, &config);
        assert_eq!(input.pending_bursts(), 0);
        input.tick_idle(0.6, &config);
        assert_eq!(input.pending_bursts(), 1);

        let splats = input.take_splats(&config);
        assert!(RANDOM_BURST.contains(&(splats.len() as u32)));
    }
}
