use std::sync::LazyLock;

use anyhow::{Context, bail};
use regex::Regex;

pub const HELP: &[(&str, &str)] = &[
    ("segheap <addr>", "decode a _SEGMENT_HEAP and its page segments"),
    ("lfhsub <addr>", "decode a _HEAP_LFH_SUBSEGMENT and its blocks"),
    ("lfhctx <addr>", "decode a _HEAP_LFH_CONTEXT and its buckets"),
    ("vsctx <addr>", "decode a _HEAP_VS_CONTEXT and its free chunk tree"),
    ("clear", "clear the output"),
    ("help", "show this help"),
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    SegHeap(u64),
    LfhSub(u64),
    LfhCtx(u64),
    VsCtx(u64),
    Clear,
    Help,
}

impl Command {
    /// Parse one input line. `(..)` groups are evaluated before the address is read, so
    /// `lfhsub (0xffffb68000412000 + 0x1000)` works.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut line = line.trim().to_owned();
        resolve_paren_expressions(&mut line);

        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            bail!("empty command");
        };
        let args: Vec<&str> = words.collect();

        let address = || -> anyhow::Result<u64> {
            match args.as_slice() {
                [address] => parse_address(address),
                _ => bail!("usage: {name} <addr>"),
            }
        };

        let command = match name {
            "segheap" => Command::SegHeap(address()?),
            "lfhsub" => Command::LfhSub(address()?),
            "lfhctx" => Command::LfhCtx(address()?),
            "vsctx" => Command::VsCtx(address()?),
            "clear" => Command::Clear,
            "help" => Command::Help,
            _ => bail!("unknown command `{name}`, try `help`"),
        };
        Ok(command)
    }
}

/// `0x` hex, WinDbg style hex with a backtick (`ffffa000`00000000`), otherwise decimal
pub fn parse_address(s: &str) -> anyhow::Result<u64> {
    let address = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('`', ""), 16)
    } else if s.contains('`') {
        u64::from_str_radix(&s.replace('`', ""), 16)
    } else {
        s.parse()
    };
    address.with_context(|| format!("invalid address `{s}`"))
}

/// Replace every innermost `(expr)` with its value
pub fn resolve_paren_expressions(val: &mut String) {
    static RE_PAREN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([^()]+)\)").unwrap());
    static RE_HEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0[xX][0-9a-fA-F]+").unwrap());

    *val = RE_PAREN
        .replace_all(&*val, |caps: &regex::Captures| {
            let expression = &caps[1];
            // evalexpr only knows signed decimal, kernel addresses wrap negative
            let decimal = RE_HEX.replace_all(expression, |hex: &regex::Captures| {
                match u64::from_str_radix(&hex[0][2..], 16) {
                    Ok(v) => (v as i64).to_string(),
                    Err(_) => hex[0].to_string(),
                }
            });
            match evalexpr::eval(&decimal) {
                Ok(evalexpr::Value::Int(result)) => format!("0x{:x}", result as u64),
                Ok(result) => result.to_string(),
                Err(_) => expression.to_string(),
            }
        })
        .to_string();
}
