//! Timing model text format.
//!
//! A model file is line oriented:
//!
//! ```text
//! PSRJ           J0000+0000
//! F0             1.2345678901 1  0.000000002
//! PEPOCH         59000
//! RAJ            1.2 1
//! ```
//!
//! `NAME VALUE [FLAG [UNCERTAINTY]]`. Numeric lines for known parameters are
//! parsed; every other line (comments, clock settings, `PSRJ` ...) is kept
//! verbatim so rewriting a model never loses information.
//!
//! `JUMP -rcvr NAME OFFSET [FLAG [UNCERTAINTY]]` lines declare a constant
//! offset (s) by which TOAs from receiver `NAME` arrive late. Jumps are
//! applied but never fitted.
//!
//! Angles (`RAJ`, `DECJ`) are in radians, `PMRA`/`PMDEC` in mas/yr of the
//! respective coordinate, `PX` in mas, spin terms in Hz, Hz/s, ...

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{TimingError, TimingResult};

/// Parameters the fitters know how to differentiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FitParam {
    F0,
    F1,
    F2,
    F3,
    RaJ,
    DecJ,
    PmRa,
    PmDec,
    Px,
}

impl FitParam {
    pub const ALL: [FitParam; 9] = [
        FitParam::F0,
        FitParam::F1,
        FitParam::F2,
        FitParam::F3,
        FitParam::RaJ,
        FitParam::DecJ,
        FitParam::PmRa,
        FitParam::PmDec,
        FitParam::Px,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FitParam::F0 => "F0",
            FitParam::F1 => "F1",
            FitParam::F2 => "F2",
            FitParam::F3 => "F3",
            FitParam::RaJ => "RAJ",
            FitParam::DecJ => "DECJ",
            FitParam::PmRa => "PMRA",
            FitParam::PmDec => "PMDEC",
            FitParam::Px => "PX",
        }
    }

    /// Spin derivative order for `F0..F3`.
    pub fn spin_order(self) -> Option<usize> {
        match self {
            FitParam::F0 => Some(0),
            FitParam::F1 => Some(1),
            FitParam::F2 => Some(2),
            FitParam::F3 => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for FitParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitParam {
    type Err = TimingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FitParam::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| TimingError::Configuration(format!("unknown fit parameter '{s}'")))
    }
}

/// Epoch-like parameters: parsed as numbers, never fitted.
const EPOCH_PARAMS: [&str; 2] = ["PEPOCH", "POSEPOCH"];

/// Parameters zeroed before a fit when they are not free.
pub const RESETTABLE_PARAMS: [FitParam; 4] = [FitParam::F1, FitParam::Px, FitParam::PmRa, FitParam::PmDec];

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: f64,
    pub fit: bool,
    pub uncertainty: Option<f64>,
}

/// Per-receiver arrival-time offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Jump {
    pub receiver: String,
    /// Seconds.
    pub offset: f64,
    pub fit: bool,
    pub uncertainty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Param(Param),
    Jump(Jump),
    Verbatim(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimingModel {
    lines: Vec<Line>,
}

fn is_numeric_param(name: &str) -> bool {
    EPOCH_PARAMS.contains(&name) || name.parse::<FitParam>().is_ok()
}

fn parse_number(token: &str, line: usize) -> TimingResult<f64> {
    // Fortran-style exponents ("1.0D-15") are still common in model files.
    let normalised = token.replace(['D', 'd'], "E");
    normalised
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TimingError::Parse {
            line,
            message: format!("invalid number '{token}'"),
        })
}

fn parse_flag(token: Option<&str>, name: &str, line: usize) -> TimingResult<bool> {
    match token {
        None | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(flag) => Err(TimingError::Parse {
            line,
            message: format!("parameter {name}: fit flag must be 0 or 1, got '{flag}'"),
        }),
    }
}

/// `JUMP -rcvr NAME OFFSET ...`; other selectors stay verbatim.
fn parse_jump(raw: &str, line: usize) -> TimingResult<Option<Jump>> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() < 4 || tokens[0] != "JUMP" || tokens[1] != "-rcvr" {
        return Ok(None);
    }
    Ok(Some(Jump {
        receiver: tokens[2].to_string(),
        offset: parse_number(tokens[3], line)?,
        fit: parse_flag(tokens.get(4).copied(), "JUMP", line)?,
        uncertainty: tokens.get(5).map(|u| parse_number(u, line)).transpose()?,
    }))
}

impl TimingModel {
    pub fn parse(text: &str) -> TimingResult<Self> {
        let mut lines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            if let Some(jump) = parse_jump(raw, line_no)? {
                lines.push(Line::Jump(jump));
                continue;
            }
            let mut tokens = raw.split_whitespace();
            let name = match tokens.next() {
                Some(name) if !name.starts_with('#') && is_numeric_param(name) => name,
                _ => {
                    lines.push(Line::Verbatim(raw.to_string()));
                    continue;
                }
            };

            let value = match tokens.next() {
                Some(v) => parse_number(v, line_no)?,
                None => {
                    return Err(TimingError::Parse {
                        line: line_no,
                        message: format!("parameter {name} has no value"),
                    });
                }
            };
            let fit = parse_flag(tokens.next(), name, line_no)?;
            let uncertainty = tokens.next().map(|u| parse_number(u, line_no)).transpose()?;

            lines.push(Line::Param(Param {
                name: name.to_string(),
                value,
                fit: fit && !EPOCH_PARAMS.contains(&name),
                uncertainty,
            }));
        }
        Ok(Self { lines })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(text) => out.push_str(text),
                Line::Jump(j) => {
                    out.push_str(&format!("{:<15}-rcvr {} {}", "JUMP", j.receiver, j.offset));
                    out.push_str(if j.fit { " 1" } else { " 0" });
                    if let Some(u) = j.uncertainty {
                        out.push_str(&format!(" {u}"));
                    }
                }
                Line::Param(p) => {
                    out.push_str(&format!("{:<15}{}", p.name, p.value));
                    if p.fit || p.uncertainty.is_some() {
                        out.push_str(if p.fit { " 1" } else { " 0" });
                    }
                    if let Some(u) = p.uncertainty {
                        out.push_str(&format!(" {u}"));
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    /// Pulsar name from `PSRJ`/`PSR`.
    pub fn psr_name(&self) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Verbatim(text) => {
                let mut tokens = text.split_whitespace();
                match tokens.next() {
                    Some("PSRJ") | Some("PSR") => tokens.next(),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    pub fn jumps(&self) -> impl Iterator<Item = &Jump> {
        self.lines.iter().filter_map(|line| match line {
            Line::Jump(j) => Some(j),
            _ => None,
        })
    }

    /// Append a receiver jump unless that receiver already has one.
    pub fn add_jump(&mut self, receiver: &str, offset: f64, uncertainty: f64) -> bool {
        if self.jumps().any(|j| j.receiver == receiver) {
            return false;
        }
        self.lines.push(Line::Jump(Jump {
            receiver: receiver.to_string(),
            offset,
            fit: false,
            uncertainty: Some(uncertainty),
        }));
        true
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.lines.iter().find_map(|line| match line {
            Line::Param(p) if p.name == name => Some(p),
            _ => None,
        })
    }

    fn param_mut(&mut self, name: &str) -> &mut Param {
        let pos = self
            .lines
            .iter()
            .position(|line| matches!(line, Line::Param(p) if p.name == name));
        let idx = match pos {
            Some(idx) => idx,
            None => {
                self.lines.push(Line::Param(Param {
                    name: name.to_string(),
                    value: 0.0,
                    fit: false,
                    uncertainty: None,
                }));
                self.lines.len() - 1
            }
        };
        match &mut self.lines[idx] {
            Line::Param(p) => p,
            _ => unreachable!("index points at a parameter line"),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.param(name).map(|p| p.value)
    }

    /// Value of a fittable parameter, zero when absent.
    pub fn value(&self, param: FitParam) -> f64 {
        self.get(param.as_str()).unwrap_or(0.0)
    }

    /// Set a value, inserting the parameter when missing.
    pub fn set(&mut self, name: &str, value: f64) {
        self.param_mut(name).value = value;
    }

    pub fn set_uncertainty(&mut self, name: &str, uncertainty: Option<f64>) {
        self.param_mut(name).uncertainty = uncertainty;
    }

    pub fn set_free(&mut self, param: FitParam, free: bool) {
        self.param_mut(param.as_str()).fit = free;
    }

    pub fn freeze_all(&mut self) {
        for line in &mut self.lines {
            if let Line::Param(p) = line {
                p.fit = false;
            }
        }
    }

    /// Free parameters in file order.
    pub fn free_params(&self) -> TimingResult<Vec<FitParam>> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Param(p) if p.fit => Some(p.name.parse::<FitParam>()),
                _ => None,
            })
            .collect()
    }

    pub fn free_param_names(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Param(p) if p.fit => Some(p.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// All numeric parameters as a name → value map.
    pub fn values(&self) -> BTreeMap<String, f64> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Param(p) => Some((p.name.clone(), p.value)),
                _ => None,
            })
            .collect()
    }

    /// Zero the resettable parameters that are not free.
    pub fn reset_frozen(&mut self) {
        for param in RESETTABLE_PARAMS {
            let free = self.param(param.as_str()).is_some_and(|p| p.fit);
            if !free {
                self.set(param.as_str(), 0.0);
            }
        }
    }

    /// Spin period (s).
    pub fn period(&self) -> Option<f64> {
        self.get("F0").filter(|f| *f > 0.0).map(|f| 1.0 / f)
    }

    /// A model is usable when it names a pulsar and carries F0 > 0 and PEPOCH.
    pub fn validate(&self) -> TimingResult<()> {
        if self.psr_name().is_none() {
            return Err(TimingError::Configuration(
                "timing model has no PSRJ/PSR line".to_string(),
            ));
        }
        if self.period().is_none() {
            return Err(TimingError::Configuration(
                "timing model needs a positive F0".to_string(),
            ));
        }
        if self.get("PEPOCH").is_none() {
            return Err(TimingError::Configuration(
                "timing model has no PEPOCH".to_string(),
            ));
        }
        Ok(())
    }
}
