//! Pointer-reactive 2D fluid background.
//!
//! A semi-Lagrangian smoke solver with Jacobi pressure projection and
//! vorticity confinement, run as a fixed sequence of fragment passes over
//! double-buffered textures. [`scheduler::create_backdrop`] is the entry point
//! for windowed hosts; tests and headless runs drive
//! [`scheduler::FluidEngine`] over [`backend::cpu::CpuBackend`].

pub mod backend;
pub mod capability;
pub mod color;
pub mod config;
pub mod error;
pub mod input;
pub mod programs;
pub mod scheduler;
pub mod solver;
pub mod targets;

pub use config::SimulationConfig;
pub use error::EngineError;
pub use input::PointerId;
pub use scheduler::{create_backdrop, Backdrop, EngineState, FluidEngine, StaticBackdrop};
