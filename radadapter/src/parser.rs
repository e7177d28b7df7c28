//! Parsers for the text files a debug run produces
//!
//! Covers the dispatch status file, the valid-watches list and the
//! hexadecimal text form of the debug output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

static STATUS_FILE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        grid[\ _]size \s* \( \s* (?P<gd_x>\d+) \s*,\s* (?P<gd_y>\d+) \s*,\s* (?P<gd_z>\d+) \s* \) \s+
        group[\ _]size \s* \( \s* (?P<gp_x>\d+) \s*,\s* (?P<gp_y>\d+) \s*,\s* (?P<gp_z>\d+) \s* \) \s+
        wave[\ _]size \s+ (?P<wv>\d+)
        (?: [\ \t]* \r?\n \s* comment [\ \t]+ (?P<comment>[^\r\n]*) )?",
    )
    .expect("status file regex is valid")
});

/// Which consistency rule the status file violates
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchParamsRule {
    #[error("Make sure that the status file contents match the format.")]
    FormatMismatch,
    #[error("GridX cannot be zero.")]
    GridXZero,
    #[error("GroupX cannot be zero.")]
    GroupXZero,
    #[error("WaveSize cannot be zero.")]
    WaveSizeZero,
    #[error("WaveSize cannot be bigger than GroupX.")]
    WaveSizeExceedsGroupX,
    #[error("If GridY is set, GroupY cannot be zero.")]
    GroupYZero,
    #[error("If GridZ is set, GroupZ cannot be zero.")]
    GroupZZero,
    #[error("GroupX cannot be bigger than GridX.")]
    GroupXExceedsGridX,
    #[error("GroupY cannot be bigger than GridY.")]
    GroupYExceedsGridY,
    #[error("GroupZ cannot be bigger than GridZ.")]
    GroupZExceedsGridZ,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Could not set dispatch parameters from the status file. {rule}\n\nStatus file contents:\n{status_text}")]
pub struct DispatchParamsError {
    pub rule: DispatchParamsRule,
    pub status_text: String,
}

pub type Result<T> = std::result::Result<T, DispatchParamsError>;

/// Validated dispatch geometry read from the status file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakStateDispatchParameters {
    pub wave_size: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_z: u32,
    pub group_x: u32,
    pub group_y: u32,
    pub group_z: u32,
    /// Number of groups along each axis; zero for a degenerate Y or Z axis
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub nd_range_3d: bool,
    pub status_string: Option<String>,
}

impl BreakStateDispatchParameters {
    /// Parses the status file. `None` means the run produced no status file,
    /// which is not an error.
    ///
    /// Accepted format (`grid size` may also be spelled `grid_size`, and so on):
    ///
    /// ```text
    /// grid_size (2048, 1, 1)
    /// group_size (512, 1, 1)
    /// wave_size 64
    /// comment optional free text
    /// ```
    pub fn parse(status_text: Option<&str>) -> Result<Option<Self>> {
        let Some(text) = status_text else {
            return Ok(None);
        };
        let fail = |rule| DispatchParamsError { rule, status_text: text.to_string() };

        let caps = STATUS_FILE_REGEX.captures(text).ok_or_else(|| fail(DispatchParamsRule::FormatMismatch))?;
        let num = |name: &str| -> Result<u32> {
            caps[name].parse().map_err(|_| fail(DispatchParamsRule::FormatMismatch))
        };

        let (grid_x, grid_y, grid_z) = (num("gd_x")?, num("gd_y")?, num("gd_z")?);
        let (group_x, group_y, group_z) = (num("gp_x")?, num("gp_y")?, num("gp_z")?);
        let wave_size = num("wv")?;
        let status_string = caps.name("comment").map(|m| m.as_str().trim().to_string());

        let checks = [
            (grid_x == 0, DispatchParamsRule::GridXZero),
            (group_x == 0, DispatchParamsRule::GroupXZero),
            (wave_size == 0, DispatchParamsRule::WaveSizeZero),
            (wave_size > group_x, DispatchParamsRule::WaveSizeExceedsGroupX),
            (grid_y > 1 && group_y == 0, DispatchParamsRule::GroupYZero),
            (grid_z > 1 && group_z == 0, DispatchParamsRule::GroupZZero),
            (group_x > grid_x, DispatchParamsRule::GroupXExceedsGridX),
            (group_y > grid_y, DispatchParamsRule::GroupYExceedsGridY),
            (group_z > grid_z, DispatchParamsRule::GroupZExceedsGridZ),
        ];
        if let Some((_, rule)) = checks.iter().find(|(violated, _)| *violated) {
            return Err(fail(*rule));
        }

        let nd_range_3d = grid_y > 1 || grid_z > 1;
        let dim_x = grid_x / group_x;
        let dim_y = if grid_y > 1 { grid_y / group_y } else { 0 };
        let dim_z = if grid_z > 1 { grid_z / group_z } else { 0 };

        Ok(Some(Self {
            wave_size,
            grid_x,
            grid_y,
            grid_z,
            group_x,
            group_y,
            group_z,
            dim_x,
            dim_y,
            dim_z,
            nd_range_3d,
            status_string,
        }))
    }
}

impl fmt::Display for BreakStateDispatchParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid ({}, {}, {}), group ({}, {}, {}), wave {}, dims ({}, {}, {}){}",
            self.grid_x,
            self.grid_y,
            self.grid_z,
            self.group_x,
            self.group_y,
            self.group_z,
            self.wave_size,
            self.dim_x,
            self.dim_y,
            self.dim_z,
            if self.nd_range_3d { ", 3D" } else { "" }
        )?;
        if let Some(comment) = &self.status_string {
            write!(f, ": {}", comment)?;
        }
        Ok(())
    }
}

/// One watch name per line; blank lines are ignored.
pub fn parse_valid_watches(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads hexadecimal dwords from the text form of the debug output, one per
/// line, after skipping `line_offset` header lines. Non-hex characters
/// (such as a `0x` prefix's `x`) are ignored; lines without digits are skipped.
pub fn parse_text_output(text: &str, line_offset: usize) -> Vec<u32> {
    text.lines()
        .skip(line_offset)
        .filter_map(|line| {
            let digits = line.trim().trim_start_matches("0x").trim_start_matches("0X");
            let mut value: Option<u32> = None;
            for c in digits.chars() {
                if let Some(d) = c.to_digit(16) {
                    value = Some(value.unwrap_or(0).wrapping_mul(16).wrapping_add(d));
                }
            }
            value
        })
        .collect()
}

/// Little-endian byte form of a dword list, as stored in a binary output file
pub fn dwords_to_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
