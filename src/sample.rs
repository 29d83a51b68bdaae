//! Accelerometer samples and the recorded-sample text format.

use std::io::BufRead;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Sample {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Squared L2 norm of `next - self`. Wide enough for any pair of i32 samples.
    pub fn slope_sq(&self, next: &Sample) -> u128 {
        let d = |a: i32, b: i32| (b as i64 - a as i64).unsigned_abs() as u128;
        let (dx, dy, dz) = (d(self.x, next.x), d(self.y, next.y), d(self.z, next.z));
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleParseError {
    #[error("expected 3 columns (x y z), got {0}")]
    Columns(usize),
    #[error("{axis}: '{value}' is not an integer")]
    Value { axis: &'static str, value: String },
}

/// Parse one line of `x,y,z` (commas and/or whitespace). Blank lines and
/// `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Sample>, SampleParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    if fields.len() != 3 {
        return Err(SampleParseError::Columns(fields.len()));
    }

    let axis = |i: usize, name: &'static str| {
        fields[i].parse::<i32>().map_err(|_| SampleParseError::Value {
            axis: name,
            value: fields[i].to_string(),
        })
    };
    Ok(Some(Sample::new(axis(0, "x")?, axis(1, "y")?, axis(2, "z")?)))
}

/// Iterate the samples of a recording, tagged with their 1-based line number.
pub fn read_samples<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = anyhow::Result<(usize, Sample)>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line_no = i + 1;
            let parsed = match line {
                Ok(l) => parse_line(&l)
                    .map_err(|e| anyhow::anyhow!("line {line_no}: {e}")),
                Err(e) => Err(e.into()),
            };
            parsed.transpose().map(|r| r.map(|s| (line_no, s)))
        })
}
