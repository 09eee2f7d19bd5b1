/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Host-side helpers for exercising `vring` queues without a hypervisor:
//! a heap-backed guest memory, a simulated split ring device and a logger
//! that records what the engine logs.

mod device;
mod memory;
pub mod simplelogger;

pub use device::{DeviceChain, SimDevice};
pub use memory::GuestMemory;

/// Guest physical address the test memories start at by default.
pub const DEFAULT_GPA_BASE: u64 = 0x10_0000;
