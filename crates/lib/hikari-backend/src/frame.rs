use glam::Vec3;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Camera parameters that feed progressive accumulation. Any material change
/// between frames invalidates the accumulated samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    pub position: Vec3,
    pub look_at: Vec3,
    pub vertical_fov: f32,
}

impl CameraState {
    /// Angular and positional slack below which two camera states are treated
    /// as the same view. Keeps sub-pixel jitter from throwing samples away.
    pub const EPSILON: f32 = 1e-4;

    pub fn new(position: Vec3, look_at: Vec3, vertical_fov: f32) -> Self {
        Self {
            position,
            look_at,
            vertical_fov,
        }
    }

    pub fn forward(&self) -> Vec3 {
        (self.look_at - self.position).normalize_or_zero()
    }

    pub fn changed_materially_from(&self, other: &CameraState) -> bool {
        let angular_delta = 1.0 - self.forward().dot(other.forward());

        self.position.distance_squared(other.position) > Self::EPSILON * Self::EPSILON
            || angular_delta > Self::EPSILON
            || (self.vertical_fov - other.vertical_fov).abs() > Self::EPSILON
    }
}

/// What the renderer must do this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAdvance {
    /// Clear the accumulation image and per-pixel counters before tracing.
    pub reset_accumulation: bool,
    /// Samples accumulated after this frame's trace lands, clamped to the
    /// budget. Progress reporting only; the per-pixel counter on the GPU is
    /// what actually stops contribution.
    pub accumulated_samples: u32,
    pub converged: bool,
}

/// CPU-side progressive accumulation tracking. One sample set is traced per
/// frame until the budget is reached; camera or budget changes start over.
pub struct AccumulationState {
    camera: CameraState,
    max_samples: u32,
    accumulated_samples: u32,
}

impl AccumulationState {
    pub fn new(camera: CameraState, max_samples: u32) -> Self {
        Self {
            camera,
            max_samples,
            accumulated_samples: 0,
        }
    }

    pub fn max_samples(&self) -> u32 {
        self.max_samples
    }

    pub fn accumulated_samples(&self) -> u32 {
        self.accumulated_samples
    }

    /// Changing the budget restarts accumulation, even when lowering it.
    pub fn set_max_samples(&mut self, max_samples: u32) {
        if max_samples != self.max_samples {
            self.max_samples = max_samples;
            self.accumulated_samples = 0;
        }
    }

    pub fn begin_frame(&mut self, camera: CameraState) -> FrameAdvance {
        let reset_accumulation = camera.changed_materially_from(&self.camera);
        if reset_accumulation {
            trace!("Camera moved; restarting accumulation");
            self.accumulated_samples = 0;
        }
        self.camera = camera;

        if self.accumulated_samples < self.max_samples {
            self.accumulated_samples += 1;
        }

        FrameAdvance {
            reset_accumulation,
            accumulated_samples: self.accumulated_samples,
            converged: self.accumulated_samples >= self.max_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraState {
        CameraState::new(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, 45.0f32.to_radians())
    }

    #[test]
    fn first_frame_does_not_reset() {
        let mut state = AccumulationState::new(camera(), 16);
        let advance = state.begin_frame(camera());

        assert!(!advance.reset_accumulation);
        assert_eq!(advance.accumulated_samples, 1);
        assert!(!advance.converged);
    }

    #[test]
    fn samples_accumulate_one_per_frame_up_to_the_budget() {
        let mut state = AccumulationState::new(camera(), 4);

        for expected in 1..=4 {
            let advance = state.begin_frame(camera());
            assert_eq!(advance.accumulated_samples, expected);
        }

        // Further frames hold at the budget instead of counting past it.
        let advance = state.begin_frame(camera());
        assert_eq!(advance.accumulated_samples, 4);
        assert!(advance.converged);
    }

    #[test]
    fn camera_movement_resets_the_counter_and_requests_a_clear() {
        let mut state = AccumulationState::new(camera(), 16);
        for _ in 0..5 {
            state.begin_frame(camera());
        }

        let mut moved = camera();
        moved.position.x += 0.5;
        let advance = state.begin_frame(moved);

        assert!(advance.reset_accumulation);
        assert_eq!(advance.accumulated_samples, 1);
        assert!(!advance.converged);
    }

    #[test]
    fn sub_epsilon_jitter_keeps_accumulated_samples() {
        let mut state = AccumulationState::new(camera(), 16);
        for _ in 0..5 {
            state.begin_frame(camera());
        }

        let mut jittered = camera();
        jittered.position.x += 1e-6;
        let advance = state.begin_frame(jittered);

        assert!(!advance.reset_accumulation);
        assert_eq!(advance.accumulated_samples, 6);
    }

    #[test]
    fn fov_change_resets_accumulation() {
        let mut state = AccumulationState::new(camera(), 16);
        for _ in 0..3 {
            state.begin_frame(camera());
        }

        let mut zoomed = camera();
        zoomed.vertical_fov *= 0.5;
        let advance = state.begin_frame(zoomed);

        assert!(advance.reset_accumulation);
        assert_eq!(advance.accumulated_samples, 1);
    }

    #[test]
    fn changing_the_sample_budget_restarts_accumulation() {
        let mut state = AccumulationState::new(camera(), 8);
        for _ in 0..8 {
            state.begin_frame(camera());
        }
        assert_eq!(state.accumulated_samples(), 8);

        state.set_max_samples(32);
        assert_eq!(state.accumulated_samples(), 0);

        let advance = state.begin_frame(camera());
        assert_eq!(advance.accumulated_samples, 1);
        assert!(!advance.converged);
    }

    #[test]
    fn setting_the_same_budget_is_a_no_op() {
        let mut state = AccumulationState::new(camera(), 8);
        for _ in 0..3 {
            state.begin_frame(camera());
        }

        state.set_max_samples(8);
        assert_eq!(state.accumulated_samples(), 3);
    }
}
