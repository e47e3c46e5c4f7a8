//! Executes parsed scripts against a [`SystemBus`].
//!
//! Every statement runs, even after a failed expectation, so one pass
//! reports all mismatches.

use std::fmt;

use peripherals::SystemBus;
use tracing::debug;

use crate::script::{Command, Comparison, Statement};

/// A failed expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// 1-indexed script line.
    pub line: usize,
    /// Expected versus observed.
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Outcome of a script run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Statements executed.
    pub executed: usize,
    /// Statements that carried a check.
    pub checks: usize,
    /// Checks that did not hold, in script order.
    pub failures: Vec<Failure>,
}

impl Report {
    /// Returns `true` when every check held.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed ({} commands)",
            self.checks - self.failures.len(),
            self.failures.len(),
            self.executed
        )
    }
}

fn check_line(
    bus: &SystemBus,
    peripheral: &str,
    line: &str,
    expected: bool,
    comparison: Comparison,
) -> Result<(), String> {
    let Some(target) = bus.peripheral(peripheral) else {
        return Err(format!("no peripheral named `{peripheral}`"));
    };
    let Some(level) = target.line_level(line) else {
        return Err(format!(
            "`{peripheral}` has no line `{line}` (lines: {})",
            target.line_names().join(", ")
        ));
    };
    if comparison.holds(u64::from(level), u64::from(expected)) {
        Ok(())
    } else {
        Err(format!(
            "{peripheral}.{line}: expected {comparison} {}, got {}",
            u8::from(expected),
            u8::from(level)
        ))
    }
}

/// Runs `statements` in order on `bus`.
pub fn run(bus: &mut SystemBus, statements: &[Statement]) -> Report {
    let mut report = Report::default();
    for statement in statements {
        debug!(line = statement.line, command = ?statement.command, "executing");
        report.executed += 1;
        let outcome = match &statement.command {
            Command::Write {
                address,
                value,
                width,
            } => {
                bus.write(*address, *width, *value);
                continue;
            }
            Command::Read {
                address,
                width,
                expect,
            } => {
                let actual = bus.read(*address, *width);
                let Some(expect) = expect else {
                    debug!(address = format_args!("{address:#x}"), actual, "read");
                    continue;
                };
                if expect.comparison.holds(actual, expect.value) {
                    Ok(())
                } else {
                    Err(format!(
                        "read {address:#x}: expected {} {:#x}, got {actual:#x}",
                        expect.comparison, expect.value
                    ))
                }
            }
            Command::Line {
                peripheral,
                line,
                comparison,
                level,
            } => check_line(bus, peripheral, line, *level, *comparison),
            Command::Reset => {
                bus.reset();
                continue;
            }
        };
        report.checks += 1;
        if let Err(message) = outcome {
            report.failures.push(Failure {
                line: statement.line,
                message,
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformConfig, HMAC_BASE, RNGCTRL_BASE};
    use crate::script::parse_script;

    fn bus() -> SystemBus {
        PlatformConfig::default().build().unwrap()
    }

    fn run_source(source: &str) -> Report {
        run(&mut bus(), &parse_script(source).unwrap())
    }

    #[test]
    fn sha256_of_abc_through_the_bus() {
        let source = format!(
            "\
write {cmd:#x} 1
write {fifo:#x} 0x61 b
write {fifo:#x} 0x62 b
write {fifo:#x} 0x63 b
write {enable:#x} 1
write {cmd:#x} 2
read {digest:#x} == 0xba7816bf
line hmac.hmac_done == 1
",
            cmd = HMAC_BASE + 0x14,
            fifo = HMAC_BASE + 0x800,
            enable = HMAC_BASE + 0x04,
            digest = HMAC_BASE + 0x44,
        );
        let report = run_source(&source);
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.executed, 8);
        assert_eq!(report.checks, 2);
    }

    #[test]
    fn mismatches_are_collected_and_execution_continues() {
        let source = format!(
            "\
read {depth:#x} == 63
read {depth:#x} != 64
read {depth:#x} == 64
line rngctrl.IRQ == 1
",
            depth = RNGCTRL_BASE + 0xC,
        );
        let report = run_source(&source);
        let lines: Vec<usize> = report.failures.iter().map(|f| f.line).collect();
        assert_eq!(lines, [1, 2, 4]);
        assert_eq!(
            report.failures[0].message,
            format!("read {:#x}: expected == 0x3f, got 0x40", RNGCTRL_BASE + 0xC)
        );
        assert_eq!(report.to_string(), "1 passed, 3 failed (4 commands)");
    }

    #[test]
    fn unknown_lines_and_peripherals_fail() {
        let report = run_source("line uart.tx == 0\nline hmac.bogus == 0\n");
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].message.contains("no peripheral named `uart`"));
        assert!(report.failures[1]
            .message
            .contains("lines: hmac_done, fifo_empty, hmac_err"));
    }

    #[test]
    fn reset_restores_register_state() {
        let source = format!(
            "\
write {enable:#x} 0b111
read {enable:#x} == 7
reset
read {enable:#x} == 0
",
            enable = HMAC_BASE + 0x04,
        );
        assert!(run_source(&source).passed());
    }
}
