//! Parsing of flags in the format of Go's "flag" package, with an optional
//! environment variable backing every flag.
//!
//! A flag's value is taken from, in order of precedence: the command line,
//! the environment variable, the default.
//!
//! Link to the Go package: https://pkg.go.dev/flag

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};

pub trait GoValue: Sized + 'static {
    fn parse(s: &str) -> Result<Self>;
    fn to_string(&self) -> String;
    fn is_zero_value(&self) -> bool {
        false
    }
    fn is_bool_flag() -> bool {
        false
    }
    fn type_name() -> &'static str {
        "value"
    }
}

impl GoValue for bool {
    fn parse(s: &str) -> Result<Self> {
        super::strconv::parse_bool(s)
    }

    fn to_string(&self) -> String {
        format!("{self}")
    }

    fn is_zero_value(&self) -> bool {
        !*self
    }

    fn is_bool_flag() -> bool {
        true
    }

    fn type_name() -> &'static str {
        ""
    }
}

impl GoValue for u64 {
    fn parse(s: &str) -> Result<Self> {
        super::strconv::parse_uint(s)
    }

    fn to_string(&self) -> String {
        format!("{self}")
    }

    fn is_zero_value(&self) -> bool {
        *self == 0
    }

    fn type_name() -> &'static str {
        "uint"
    }
}

impl GoValue for String {
    fn parse(s: &str) -> Result<Self> {
        Ok(s.to_string())
    }

    fn to_string(&self) -> String {
        format!("{self:?}")
    }

    fn is_zero_value(&self) -> bool {
        self.is_empty()
    }

    fn type_name() -> &'static str {
        "string"
    }
}

impl GoValue for Duration {
    fn parse(s: &str) -> Result<Self> {
        super::strconv::parse_duration(s)
    }

    fn to_string(&self) -> String {
        super::strconv::format_duration(*self)
    }

    fn is_zero_value(&self) -> bool {
        self.is_zero()
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

trait FlagCell {
    fn set(&self, s: &str) -> Result<()>;
}

struct ValueCell<T: GoValue>(RefCell<Option<T>>);

impl<T: GoValue> FlagCell for ValueCell<T> {
    fn set(&self, s: &str) -> Result<()> {
        *self.0.borrow_mut() = Some(T::parse(s)?);
        Ok(())
    }
}

struct Flag {
    env: Option<&'static str>,
    desc: &'static str,
    default: Option<String>,
    type_name: &'static str,
    is_bool_flag: bool,
    cell: Rc<dyn FlagCell>,
}

/// Handle to the value of a flag, filled in by [`Parser::parse_args`].
pub struct FlagValue<T: GoValue> {
    cell: Rc<ValueCell<T>>,
}

impl<T: GoValue> FlagValue<T> {
    /// Returns the parsed value, or the default if the parser didn't
    /// run or found no value for the flag.
    pub fn get(self) -> T {
        match self.cell.0.borrow_mut().take() {
            Some(value) => value,
            None => unreachable!("a flag cell always holds a value until taken by its only handle"),
        }
    }
}

type FlagMap = BTreeMap<&'static str, Flag>;

/// Collects flag definitions.
pub struct ParserBuilder {
    flags: FlagMap,
}

impl ParserBuilder {
    pub fn new() -> Self {
        Self {
            flags: FlagMap::new(),
        }
    }

    pub fn build(self) -> (Parser, FlagSetDescription) {
        let flags = Rc::new(self.flags);
        (
            Parser {
                flags: Rc::clone(&flags),
            },
            FlagSetDescription { flags },
        )
    }

    pub fn bool_var(
        &mut self,
        name: &'static str,
        env: Option<&'static str>,
        default: bool,
        desc: &'static str,
    ) -> FlagValue<bool> {
        self.add_flag(name, env, default, desc)
    }

    pub fn string_var(
        &mut self,
        name: &'static str,
        env: Option<&'static str>,
        default: impl ToString,
        desc: &'static str,
    ) -> FlagValue<String> {
        self.add_flag(name, env, default.to_string(), desc)
    }

    pub fn u64_var(
        &mut self,
        name: &'static str,
        env: Option<&'static str>,
        default: u64,
        desc: &'static str,
    ) -> FlagValue<u64> {
        self.add_flag(name, env, default, desc)
    }

    pub fn duration_var(
        &mut self,
        name: &'static str,
        env: Option<&'static str>,
        default: Duration,
        desc: &'static str,
    ) -> FlagValue<Duration> {
        self.add_flag(name, env, default, desc)
    }

    fn add_flag<T: GoValue>(
        &mut self,
        name: &'static str,
        env: Option<&'static str>,
        default: T,
        desc: &'static str,
    ) -> FlagValue<T> {
        assert!(
            !name.is_empty() && !name.starts_with(['-', '=']),
            "Invalid flag name: {name:?}",
        );

        let default_desc = (!default.is_zero_value()).then(|| default.to_string());
        let cell = Rc::new(ValueCell(RefCell::new(Some(default))));
        let flag = Flag {
            env,
            desc,
            default: default_desc,
            type_name: T::type_name(),
            is_bool_flag: T::is_bool_flag(),
            cell: Rc::clone(&cell) as Rc<dyn FlagCell>,
        };
        assert!(
            self.flags.insert(name, flag).is_none(),
            "Flag {name} was defined more than once",
        );

        FlagValue { cell }
    }
}

pub struct Parser {
    flags: Rc<FlagMap>,
}

impl Parser {
    /// Parses the command line arguments, then fills the flags which were
    /// not given on the command line from the environment, as read by `env`.
    ///
    /// Each argument must have one of the forms:
    /// -name=value
    /// -name value  (non-boolean flags only)
    /// -name        (boolean flags only)
    ///
    /// A flag may start with one or two dashes. A lone "--" ends parsing.
    pub fn parse_args<I, S>(self, mut args: I, env: impl Fn(&str) -> Option<String>) -> Result<()>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        let mut given = HashSet::new();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            if arg == "--" {
                break;
            }

            let stripped = arg
                .strip_prefix("--")
                .or_else(|| arg.strip_prefix('-'))
                .ok_or_else(|| anyhow::anyhow!("Expected a flag, but got {arg}"))?;
            anyhow::ensure!(
                !stripped.is_empty() && !stripped.starts_with(['-', '=']),
                "Invalid flag syntax: {arg}",
            );

            let (name, inline_value) = match stripped.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (stripped, None),
            };
            let flag = self
                .flags
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown flag: {name}"))?;
            anyhow::ensure!(
                given.insert(name.to_owned()),
                "The flag {name} was provided twice",
            );

            let result = match inline_value {
                Some(value) => flag.cell.set(value),
                None if flag.is_bool_flag => flag.cell.set("true"),
                None => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("Value is missing for flag {name}"))?;
                    flag.cell.set(value.as_ref())
                }
            };
            result.with_context(|| format!("Invalid value of flag {name}"))?;
        }

        for (name, flag) in self.flags.iter() {
            if given.contains(*name) {
                continue;
            }
            let Some(var) = flag.env else {
                continue;
            };
            if let Some(value) = env(var) {
                flag.cell
                    .set(&value)
                    .with_context(|| format!("Invalid value of environment variable {var}"))?;
            }
        }

        Ok(())
    }
}

pub struct FlagSetDescription {
    flags: Rc<FlagMap>,
}

impl FlagSetDescription {
    /// Prints the usage of every flag, sorted by name, in Go's layout.
    pub fn print_help(&self, out: &mut impl Write, program_name: &str) -> Result<()> {
        writeln!(out, "Usage of {program_name}:")?;
        for (name, flag) in self.flags.iter() {
            let mut line = format!("  -{name}");
            if !flag.type_name.is_empty() {
                line.push(' ');
                line.push_str(flag.type_name);
            }
            line.push_str("\n    \t");
            line.push_str(&flag.desc.replace('\n', "\n    \t"));
            if let Some(default) = &flag.default {
                line.push_str(&format!(" (default {default})"));
            }
            if let Some(env) = flag.env {
                line.push_str(&format!(" (env {env})"));
            }
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}
