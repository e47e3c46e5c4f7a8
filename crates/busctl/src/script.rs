//! Bus script parsing.
//!
//! A script holds one command per line. Everything after `#` is a comment.
//!
//! ```text
//! write 0x4111_0014 1            # double-word by default
//! write 0x4111_0800 0x61 b
//! read  0x4111_0044 == 0xba7816bf
//! read  0x4001_0004 != 0 w
//! line  hmac.hmac_done == 1
//! reset
//! ```
//!
//! Numbers accept decimal, `0x` hex and `0b` binary, with `_` separators.

use std::fmt;

use regbank_core::AccessWidth;
use thiserror::Error;

/// Comparison operator of an expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
}

impl Comparison {
    /// Returns `true` when `actual` satisfies the comparison against `expected`.
    #[must_use]
    pub const fn holds(self, actual: u64, expected: u64) -> bool {
        match self {
            Self::Equal => actual == expected,
            Self::NotEqual => actual != expected,
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            _ => None,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
        })
    }
}

/// Expected outcome of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    /// Operator.
    pub comparison: Comparison,
    /// Right-hand side.
    pub value: u64,
}

/// One executable script command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bus write.
    Write {
        /// Target address.
        address: u64,
        /// Written value.
        value: u64,
        /// Access width.
        width: AccessWidth,
    },
    /// Bus read, optionally checked.
    Read {
        /// Source address.
        address: u64,
        /// Access width.
        width: AccessWidth,
        /// Check applied to the value read, if any.
        expect: Option<Expectation>,
    },
    /// Check of a peripheral output line.
    Line {
        /// Name the peripheral is mapped under.
        peripheral: String,
        /// Line name.
        line: String,
        /// Operator.
        comparison: Comparison,
        /// Expected level.
        level: bool,
    },
    /// Reset of every mapped peripheral.
    Reset,
}

/// A command with the script line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-indexed source line.
    pub line: usize,
    /// Parsed command.
    pub command: Command,
}

/// Why a script line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    /// The first word is not a command.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    /// A required operand is absent.
    #[error("missing {0}")]
    Missing(&'static str),
    /// An operand is not a number.
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    /// The width suffix is not one of `b`, `w`, `d`, `q`.
    #[error("invalid access width `{0}`, expected b, w, d or q")]
    InvalidWidth(String),
    /// The operator is neither `==` nor `!=`.
    #[error("expected `==` or `!=`, found `{0}`")]
    InvalidComparison(String),
    /// A line reference without a `.` separator.
    #[error("expected `<peripheral>.<line>`, found `{0}`")]
    InvalidLineName(String),
    /// A line level other than `0` or `1`.
    #[error("line level must be 0 or 1, found `{0}`")]
    InvalidLevel(String),
    /// A written or expected value wider than the access.
    #[error("value {value:#x} does not fit in {bytes} byte(s)")]
    ValueTooWide {
        /// Offending value.
        value: u64,
        /// Access width in bytes.
        bytes: u8,
    },
    /// Extra words after a complete command.
    #[error("unexpected `{0}`")]
    Trailing(String),
}

/// A parse failure located on a script line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    /// 1-indexed source line.
    pub line: usize,
    /// What went wrong.
    pub kind: ParseErrorKind,
}

/// Parses an unsigned number in decimal, `0x` hex or `0b` binary.
///
/// Underscores are ignored anywhere after the first digit.
#[must_use]
pub fn parse_number(text: &str) -> Option<u64> {
    let (digits, radix) = if let Some(rest) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (rest, 16)
    } else if let Some(rest) = text
        .strip_prefix("0b")
        .or_else(|| text.strip_prefix("0B"))
    {
        (rest, 2)
    } else {
        (text, 10)
    };
    if digits.starts_with('_') {
        return None;
    }
    let cleaned: String = digits.chars().filter(|&c| c != '_').collect();
    if cleaned.is_empty() || cleaned.starts_with('+') {
        return None;
    }
    u64::from_str_radix(&cleaned, radix).ok()
}

/// Maps a width suffix to an access width.
#[must_use]
pub fn parse_width(text: &str) -> Option<AccessWidth> {
    match text {
        "b" => Some(AccessWidth::Byte),
        "w" => Some(AccessWidth::Word),
        "d" => Some(AccessWidth::DoubleWord),
        "q" => Some(AccessWidth::QuadWord),
        _ => None,
    }
}

struct Words<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Words<'a> {
    fn required(&mut self, what: &'static str) -> Result<&'a str, ParseErrorKind> {
        self.inner.next().ok_or(ParseErrorKind::Missing(what))
    }

    fn number(&mut self, what: &'static str) -> Result<u64, ParseErrorKind> {
        let word = self.required(what)?;
        parse_number(word).ok_or_else(|| ParseErrorKind::InvalidNumber(word.to_string()))
    }

    fn width(&mut self) -> Result<AccessWidth, ParseErrorKind> {
        self.inner.next().map_or(Ok(AccessWidth::DoubleWord), |word| {
            parse_width(word).ok_or_else(|| ParseErrorKind::InvalidWidth(word.to_string()))
        })
    }

    fn finish(mut self) -> Result<(), ParseErrorKind> {
        self.inner
            .next()
            .map_or(Ok(()), |word| Err(ParseErrorKind::Trailing(word.to_string())))
    }
}

const fn fits(value: u64, width: AccessWidth) -> Result<(), ParseErrorKind> {
    if value & !width.mask() == 0 {
        Ok(())
    } else {
        Err(ParseErrorKind::ValueTooWide {
            value,
            bytes: width.bytes(),
        })
    }
}

fn parse_read(words: &mut Words<'_>) -> Result<Command, ParseErrorKind> {
    let address = words.number("address")?;
    let Some(next) = words.inner.next() else {
        return Ok(Command::Read {
            address,
            width: AccessWidth::DoubleWord,
            expect: None,
        });
    };
    if let Some(width) = parse_width(next) {
        return Ok(Command::Read {
            address,
            width,
            expect: None,
        });
    }
    let comparison =
        Comparison::parse(next).ok_or_else(|| ParseErrorKind::InvalidComparison(next.to_string()))?;
    let value = words.number("expected value")?;
    let width = words.width()?;
    fits(value, width)?;
    Ok(Command::Read {
        address,
        width,
        expect: Some(Expectation { comparison, value }),
    })
}

fn parse_line(words: &mut Words<'_>) -> Result<Command, ParseErrorKind> {
    let target = words.required("line reference")?;
    let (peripheral, line) = target
        .split_once('.')
        .filter(|(p, l)| !p.is_empty() && !l.is_empty())
        .ok_or_else(|| ParseErrorKind::InvalidLineName(target.to_string()))?;
    let operator = words.required("comparison")?;
    let comparison = Comparison::parse(operator)
        .ok_or_else(|| ParseErrorKind::InvalidComparison(operator.to_string()))?;
    let level = match words.required("line level")? {
        "0" => false,
        "1" => true,
        other => return Err(ParseErrorKind::InvalidLevel(other.to_string())),
    };
    Ok(Command::Line {
        peripheral: peripheral.to_string(),
        line: line.to_string(),
        comparison,
        level,
    })
}

fn parse_statement(text: &str) -> Result<Option<Command>, ParseErrorKind> {
    let code = text.split_once('#').map_or(text, |(code, _)| code);
    let mut words = Words {
        inner: code.split_whitespace(),
    };
    let Some(keyword) = words.inner.next() else {
        return Ok(None);
    };
    let command = match keyword {
        "write" => {
            let address = words.number("address")?;
            let value = words.number("value")?;
            let width = words.width()?;
            fits(value, width)?;
            Command::Write {
                address,
                value,
                width,
            }
        }
        "read" => parse_read(&mut words)?,
        "line" => parse_line(&mut words)?,
        "reset" => Command::Reset,
        other => return Err(ParseErrorKind::UnknownCommand(other.to_string())),
    };
    words.finish()?;
    Ok(Some(command))
}

/// Parses a whole script.
///
/// # Errors
///
/// Returns the first [`ParseError`] in source order.
pub fn parse_script(source: &str) -> Result<Vec<Statement>, ParseError> {
    let mut statements = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let line = index + 1;
        match parse_statement(text) {
            Ok(Some(command)) => statements.push(Statement { line, command }),
            Ok(None) => {}
            Err(kind) => return Err(ParseError { line, kind }),
        }
    }
    Ok(statements)
}
