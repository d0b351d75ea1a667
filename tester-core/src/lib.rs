#![cfg_attr(not(test), no_std)]

#[cfg(test)]
extern crate std;

// Concurrent control-and-measurement engine for a four-channel Li-Ion
// capacity tester.
//
// This crate stays portable across MCU firmware and host tooling by avoiding
// the Rust standard library: every buffer is bounded, time always arrives as
// an argument, and hardware is reached only through the `AdcReader` and
// `SwitchDriver` traits.

pub mod bus;
pub mod channel;
pub mod command;
pub mod config;
pub mod controller;
pub mod coulomb;
pub mod events;
pub mod sample;
pub mod soc;
pub mod telemetry;
