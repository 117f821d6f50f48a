//! Parsing of the interactive command language.
//!
//! One line is one command. Names follow the usual debugger short forms
//! (`s`, `n`, `si`, `ni`, `c`, `bt`).

use stepwise_core::types::{Address, ThreadId};
use thiserror::Error;

/// Where a breakpoint or `until` should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location
{
    /// A raw address.
    Address(Address),
    /// The post-prologue start of a named function.
    Symbol(String),
}

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command
{
    StepLine,
    NextLine,
    StepInstruction,
    StepNativeInstruction,
    NextInstruction,
    Finish,
    Continue,
    Background,
    Until(Location),
    Interrupt,
    Break
    {
        location: Location,
        group: Option<String>,
        hit_count: Option<u64>,
    },
    Delete(u32),
    Enable(u32),
    Disable(u32),
    EnableGroup(String),
    DisableGroup(String),
    Backtrace(Option<usize>),
    Frame,
    Registers,
    SetRegister
    {
        name: String,
        value: u64,
    },
    Examine
    {
        address: Address,
        len: usize,
    },
    Write
    {
        address: Address,
        bytes: Vec<u8>,
    },
    Maps,
    Threads,
    SelectThread(ThreadId),
    Kill,
    Detach,
    Help,
    Quit,
}

/// Command line that could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError
{
    /// Empty input.
    #[error("empty command")]
    Empty,
    /// First word is not a command.
    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),
    /// A required argument is missing.
    #[error("'{command}' needs {what}")]
    Missing
    {
        command: &'static str,
        what: &'static str,
    },
    /// An argument is malformed.
    #[error("bad number '{0}'")]
    BadNumber(String),
    /// Odd-length or non-hex byte string.
    #[error("bad byte string '{0}'")]
    BadBytes(String),
}

/// Usage text for `help`.
pub const HELP: &str = "\
stepping:     s|step  n|next  si|stepi  sni|stepni  ni|nexti  finish  c|continue
              until <addr|symbol>  bg|background  interrupt
breakpoints:  b|break <addr|symbol> [group <name>] [after <n>]
              delete <n>  enable <n>  disable <n>  enable-group <g>  disable-group <g>
inspection:   bt [max]  frame  regs  set <reg> <value>  x <addr> [len]  write <addr> <hex>
              maps  threads  thread <tid>
process:      kill  detach  q|quit";

/// Parse an unsigned integer, hex with a `0x` prefix or decimal.
///
/// ## Errors
///
/// [`ParseError::BadNumber`] for anything else.
pub fn parse_number(text: &str) -> Result<u64, ParseError>
{
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse(),
    };
    parsed.map_err(|_| ParseError::BadNumber(text.to_string()))
}

fn parse_location(text: &str) -> Result<Location, ParseError>
{
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        parse_number(text).map(|value| Location::Address(Address::new(value)))
    } else {
        Ok(Location::Symbol(text.to_string()))
    }
}

fn parse_bytes(text: &str) -> Result<Vec<u8>, ParseError>
{
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(ParseError::BadBytes(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| ParseError::BadBytes(text.to_string())))
        .collect()
}

fn required<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    what: &'static str,
) -> Result<&'a str, ParseError>
{
    words.next().ok_or(ParseError::Missing { command, what })
}

fn parse_handle(words: &mut std::str::SplitWhitespace<'_>, command: &'static str) -> Result<u32, ParseError>
{
    let text = required(words, command, "a breakpoint number")?;
    let text = text.strip_prefix('#').unwrap_or(text);
    text.parse().map_err(|_| ParseError::BadNumber(text.to_string()))
}

fn parse_break(words: &mut std::str::SplitWhitespace<'_>) -> Result<Command, ParseError>
{
    let location = parse_location(required(words, "break", "a location")?)?;
    let mut group = None;
    let mut hit_count = None;
    while let Some(word) = words.next() {
        match word {
            "group" => group = Some(required(words, "break", "a group name")?.to_string()),
            "after" => hit_count = Some(parse_number(required(words, "break", "a hit count")?)?),
            other => return Err(ParseError::Unknown(other.to_string())),
        }
    }
    Ok(Command::Break {
        location,
        group,
        hit_count,
    })
}

/// Parse one command line.
///
/// ## Errors
///
/// A [`ParseError`] describing the first problem found.
pub fn parse(line: &str) -> Result<Command, ParseError>
{
    let mut words = line.split_whitespace();
    let name = words.next().ok_or(ParseError::Empty)?;

    let command = match name {
        "s" | "step" => Command::StepLine,
        "n" | "next" => Command::NextLine,
        "si" | "stepi" => Command::StepInstruction,
        "sni" | "stepni" => Command::StepNativeInstruction,
        "ni" | "nexti" => Command::NextInstruction,
        "finish" | "fin" => Command::Finish,
        "c" | "continue" => Command::Continue,
        "bg" | "background" => Command::Background,
        "until" | "u" => Command::Until(parse_location(required(&mut words, "until", "a location")?)?),
        "interrupt" | "stop" => Command::Interrupt,
        "b" | "break" => parse_break(&mut words)?,
        "delete" | "d" => Command::Delete(parse_handle(&mut words, "delete")?),
        "enable" => Command::Enable(parse_handle(&mut words, "enable")?),
        "disable" => Command::Disable(parse_handle(&mut words, "disable")?),
        "enable-group" => Command::EnableGroup(required(&mut words, "enable-group", "a group name")?.to_string()),
        "disable-group" => Command::DisableGroup(required(&mut words, "disable-group", "a group name")?.to_string()),
        "bt" | "backtrace" => Command::Backtrace(
            words
                .next()
                .map(parse_number)
                .transpose()?
                .map(|max| usize::try_from(max).unwrap_or(usize::MAX)),
        ),
        "frame" | "f" => Command::Frame,
        "regs" | "registers" => Command::Registers,
        "set" => {
            let name = required(&mut words, "set", "a register name")?.to_string();
            let value = parse_number(required(&mut words, "set", "a value")?)?;
            Command::SetRegister { name, value }
        }
        "x" | "examine" => {
            let address = Address::new(parse_number(required(&mut words, "x", "an address")?)?);
            let len = match words.next() {
                Some(len) => usize::try_from(parse_number(len)?).map_err(|_| ParseError::BadNumber(len.to_string()))?,
                None => 16,
            };
            Command::Examine { address, len }
        }
        "write" => {
            let address = Address::new(parse_number(required(&mut words, "write", "an address")?)?);
            let bytes = parse_bytes(required(&mut words, "write", "hex bytes")?)?;
            Command::Write { address, bytes }
        }
        "maps" => Command::Maps,
        "threads" => Command::Threads,
        "thread" | "t" => Command::SelectThread(ThreadId(parse_number(required(&mut words, "thread", "a thread id")?)?)),
        "kill" => Command::Kill,
        "detach" => Command::Detach,
        "help" | "h" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_short_forms()
    {
        assert_eq!(parse("s").unwrap(), Command::StepLine);
        assert_eq!(parse("  n  ").unwrap(), Command::NextLine);
        assert_eq!(parse("si").unwrap(), Command::StepInstruction);
        assert_eq!(parse("ni").unwrap(), Command::NextInstruction);
        assert_eq!(parse("c").unwrap(), Command::Continue);
        assert_eq!(parse("q").unwrap(), Command::Quit);
    }

    #[test]
    fn test_numbers()
    {
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number("0x7fff_0000").unwrap(), 0x7fff_0000);
        assert_eq!(parse_number("42").unwrap(), 42);
        assert_eq!(parse_number("zz"), Err(ParseError::BadNumber("zz".to_string())));
    }

    #[test]
    fn test_break_options()
    {
        assert_eq!(
            parse("break main group trace after 3").unwrap(),
            Command::Break {
                location: Location::Symbol("main".to_string()),
                group: Some("trace".to_string()),
                hit_count: Some(3),
            }
        );
        assert_eq!(
            parse("b 0x401000").unwrap(),
            Command::Break {
                location: Location::Address(Address::new(0x40_1000)),
                group: None,
                hit_count: None,
            }
        );
        assert!(matches!(parse("b main group"), Err(ParseError::Missing { .. })));
    }

    #[test]
    fn test_breakpoint_numbers_accept_hash()
    {
        assert_eq!(parse("delete #4").unwrap(), Command::Delete(4));
        assert_eq!(parse("disable 2").unwrap(), Command::Disable(2));
    }

    #[test]
    fn test_memory_commands()
    {
        assert_eq!(
            parse("x 0x1000").unwrap(),
            Command::Examine {
                address: Address::new(0x1000),
                len: 16
            }
        );
        assert_eq!(
            parse("write 0x1000 90cc").unwrap(),
            Command::Write {
                address: Address::new(0x1000),
                bytes: vec![0x90, 0xcc]
            }
        );
        assert!(matches!(parse("write 0x1000 9"), Err(ParseError::BadBytes(_))));
    }

    #[test]
    fn test_errors()
    {
        assert_eq!(parse("   "), Err(ParseError::Empty));
        assert_eq!(parse("frobnicate"), Err(ParseError::Unknown("frobnicate".to_string())));
        assert!(matches!(parse("until"), Err(ParseError::Missing { command: "until", .. })));
    }
}
