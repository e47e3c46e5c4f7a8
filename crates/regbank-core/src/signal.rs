//! Named boolean output lines driven by peripherals.

use std::fmt;

type Sink = Box<dyn FnMut(bool)>;

/// An interrupt or alert output.
///
/// Level changes are delivered synchronously to the connected sink, if any.
pub struct GpioLine {
    name: &'static str,
    level: bool,
    rising_edges: u64,
    sink: Option<Sink>,
}

impl fmt::Debug for GpioLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioLine")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("rising_edges", &self.rising_edges)
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

impl GpioLine {
    /// A low, unconnected line.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            level: false,
            rising_edges: 0,
            sink: None,
        }
    }

    /// Line name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current level.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.level
    }

    /// Number of low-to-high transitions since construction.
    #[must_use]
    pub const fn rising_edges(&self) -> u64 {
        self.rising_edges
    }

    /// Routes level changes to `sink`.
    pub fn connect(&mut self, sink: impl FnMut(bool) + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Removes the sink.
    pub fn disconnect(&mut self) {
        self.sink = None;
    }

    /// Drives the line to `level`. Repeating the current level is a no-op.
    pub fn set(&mut self, level: bool) {
        if self.level == level {
            return;
        }
        self.level = level;
        if level {
            self.rising_edges = self.rising_edges.saturating_add(1);
        }
        if let Some(sink) = self.sink.as_mut() {
            sink(level);
        }
    }

    /// Drives the line low.
    pub fn unset(&mut self) {
        self.set(false);
    }

    /// Emits a single pulse and leaves the line low.
    pub fn blink(&mut self) {
        self.set(false);
        self.set(true);
        self.set(false);
    }
}
