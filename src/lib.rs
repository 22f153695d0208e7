//! Core library for dielectric spectroscopy over GPIB.
//!
//! An HP4284A LCR meter is swept across a frequency table. Each Cp-D reading
//! is converted to relative permittivity, written to a text file and pushed to
//! a plot. A LakeShore 330 temperature controller can share the bus.
//!
//! Layers, bottom up:
//! - [`gpib`] - bus primitives, status decoding, mock and VISA backends
//! - [`instrument`] - command sequences of the two instruments
//! - [`notification`] - service-request polling
//! - [`acquisition`] - the sweep/correction state machine
//!
//! [`config`] and [`logging`] are used by the `dielectric_daq` binary.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod gpib;
pub mod instrument;
pub mod logging;
pub mod notification;
