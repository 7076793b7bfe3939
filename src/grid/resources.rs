// src/grid/resources.rs

//! Grid resource requests and the equation mini-language.
//!
//! A request field is either a literal amount or an equation evaluated at
//! submission time, not graph-build time, so it can be sized from input
//! data that only exists once upstream tasks complete. Equations support
//! `+ - * /`, parentheses, decimal numbers, the variable `cores`, and
//! `depends[i]` which evaluates to the i-th dependency's file size in GB.
//!
//! Example: `mem = "4000 + 8000 * depends[0]"`.

use std::path::Path;

use anyhow::{anyhow, bail};

use crate::errors::{Result, RundagError};
use crate::tracked::TrackedItem;

/// Either a fixed amount or an equation string.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Amount(u64),
    Equation(String),
}

impl ResourceSpec {
    pub fn from_config(field: &crate::config::ResourceField) -> Self {
        match field {
            crate::config::ResourceField::Amount(n) => ResourceSpec::Amount(*n),
            crate::config::ResourceField::Equation(s) => ResourceSpec::Equation(s.clone()),
        }
    }

    /// Evaluate against the task's resolved dependencies and core count.
    /// Results are rounded up to whole units and floored at 1.
    pub fn evaluate(&self, depends: &[TrackedItem], cores: u32) -> Result<u64> {
        match self {
            ResourceSpec::Amount(n) => Ok(*n),
            ResourceSpec::Equation(eq) => {
                let value = eval_equation(eq, depends, cores).map_err(RundagError::Other)?;
                Ok(value.ceil().max(1.0) as u64)
            }
        }
    }
}

/// Resources requested for one grid submission.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Memory in MB.
    pub mem: ResourceSpec,
    /// Wall-clock time in minutes.
    pub time: ResourceSpec,
    pub cores: u32,
    /// Overrides the backend's default partition.
    pub partition: Option<String>,
}

impl ResourceRequest {
    pub fn fixed(mem_mb: u64, time_min: u64, cores: u32) -> Self {
        Self {
            mem: ResourceSpec::Amount(mem_mb),
            time: ResourceSpec::Amount(time_min),
            cores,
            partition: None,
        }
    }
}

/// Syntax-check an equation without evaluating file sizes; used for
/// fail-fast config validation.
pub fn check_equation(eq: &str) -> anyhow::Result<()> {
    let mut parser = Parser::new(eq, &EvalContext { sizes: &[], cores: 1 });
    parser.parse_expression()?;
    parser.expect_end()
}

fn eval_equation(eq: &str, depends: &[TrackedItem], cores: u32) -> anyhow::Result<f64> {
    let sizes: Vec<f64> = depends.iter().map(dep_size_gb).collect();
    let ctx = EvalContext {
        sizes: &sizes,
        cores,
    };
    let mut parser = Parser::new(eq, &ctx);
    let value = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(value)
}

/// Size of a dependency's backing file(s) in GB; items without a backing
/// file (variables, functions) count as zero.
fn dep_size_gb(item: &TrackedItem) -> f64 {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let size_of = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    match item {
        TrackedItem::File(p) | TrackedItem::HugeFile(p) => size_of(p) as f64 / GB,
        TrackedItem::Directory(p) => size_of(p) as f64 / GB,
        TrackedItem::Executable { path, .. } => size_of(path) as f64 / GB,
        TrackedItem::Pattern { matches, .. } => {
            matches.iter().map(|p| size_of(p)).sum::<u64>() as f64 / GB
        }
        TrackedItem::Function { .. } | TrackedItem::Variable { .. } => 0.0,
    }
}

struct EvalContext<'a> {
    sizes: &'a [f64],
    cores: u32,
}

/// Recursive-descent parser over the expression grammar:
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := factor (('*' | '/') factor)*
/// factor := number | 'cores' | 'depends' '[' index ']' | '(' expr ')' | '-' factor
/// ```
struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    ctx: &'a EvalContext<'a>,
}

impl<'a> Parser<'a> {
    fn new(input: &str, ctx: &'a EvalContext<'a>) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            ctx,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, expected: char) -> anyhow::Result<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            other => bail!("expected `{expected}', found {other:?}"),
        }
    }

    fn expect_end(&mut self) -> anyhow::Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(c) => bail!("unexpected trailing `{c}' in resource equation"),
        }
    }

    fn parse_expression(&mut self) -> anyhow::Result<f64> {
        let mut value = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.bump();
                    value += self.parse_term()?;
                }
                '-' => {
                    self.bump();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> anyhow::Result<f64> {
        let mut value = self.parse_factor()?;
        while let Some(op) = self.peek() {
            match op {
                '*' => {
                    self.bump();
                    value *= self.parse_factor()?;
                }
                '/' => {
                    self.bump();
                    let divisor = self.parse_factor()?;
                    if divisor == 0.0 {
                        bail!("division by zero in resource equation");
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_factor(&mut self) -> anyhow::Result<f64> {
        match self.peek() {
            Some('(') => {
                self.bump();
                let value = self.parse_expression()?;
                self.expect(')')?;
                Ok(value)
            }
            Some('-') => {
                self.bump();
                Ok(-self.parse_factor()?)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_identifier(),
            other => Err(anyhow!("unexpected {other:?} in resource equation")),
        }
    }

    fn parse_number(&mut self) -> anyhow::Result<f64> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_ascii_digit() || self.chars[self.pos] == '.')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map_err(|_| anyhow!("bad number `{text}' in resource equation"))
    }

    fn parse_identifier(&mut self) -> anyhow::Result<f64> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "cores" => Ok(self.ctx.cores as f64),
            "depends" => {
                self.expect('[')?;
                let index = self.parse_number()? as usize;
                self.expect(']')?;
                // During syntax checks (empty context) any index passes.
                if self.ctx.sizes.is_empty() {
                    Ok(0.0)
                } else {
                    self.ctx.sizes.get(index).copied().ok_or_else(|| {
                        anyhow!("depends[{index}] out of range in resource equation")
                    })
                }
            }
            other => Err(anyhow!("unknown variable `{other}' in resource equation")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn literal_amounts_pass_through() {
        let spec = ResourceSpec::Amount(4000);
        assert_eq!(spec.evaluate(&[], 1).unwrap(), 4000);
    }

    #[test]
    fn arithmetic_with_cores() {
        let spec = ResourceSpec::Equation("100 * cores + 50".to_string());
        assert_eq!(spec.evaluate(&[], 4).unwrap(), 450);
    }

    #[test]
    fn depends_size_contributes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.dat");
        fs::write(&path, vec![0u8; 1024]).unwrap();
        let dep = TrackedItem::file(&path);

        // 1 KiB is a tiny fraction of a GB; the ceil floors at 1.
        let spec = ResourceSpec::Equation("depends[0] * 1000".to_string());
        assert_eq!(spec.evaluate(&[dep], 1).unwrap(), 1);
    }

    #[test]
    fn parentheses_and_division() {
        let spec = ResourceSpec::Equation("(6000 + 2000) / 2".to_string());
        assert_eq!(spec.evaluate(&[], 1).unwrap(), 4000);
    }

    #[test]
    fn syntax_errors_are_rejected_up_front() {
        assert!(check_equation("2 *").is_err());
        assert!(check_equation("mem + 1").is_err());
        assert!(check_equation("depends[0] + cores").is_ok());
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let spec = ResourceSpec::Equation("10 / 0".to_string());
        assert!(spec.evaluate(&[], 1).is_err());
    }
}
