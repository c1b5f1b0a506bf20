// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/iotsim

//! Sensor module - virtual sensor definitions and their sampling loops

mod runtime;
mod spec;

pub use runtime::{SensorRuntime, FAILURE_RATE};
pub use spec::*;
