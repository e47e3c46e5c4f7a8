//! Scripted bus transactions against emulated peripheral models.
//!
//! A [`PlatformConfig`] decides which models are mapped where; a script
//! parsed by [`parse_script`] drives reads, writes, line checks and resets
//! through the resulting [`peripherals::SystemBus`], and [`run`] collects
//! every failed expectation into a [`Report`].

use tracing_subscriber as _;

/// Script syntax and parser.
pub mod script;
pub use script::{parse_number, parse_script, Command, Comparison, ParseError, Statement};

/// Platform description and bus construction.
pub mod platform;
pub use platform::{Placement, PlatformConfig, PlatformError};

/// Script execution.
pub mod runner;
pub use runner::{run, Failure, Report};
