use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GROUP_SIZE: usize = 4;

pub const ALLOWED_STAGE_VALUES: [u32; 6] = [1, 2, 4, 8, 16, 32];

pub const DEFAULT_S2_VALUES: &str = "1,2,4,8";

const FIXED_GRID: [(u32, u32, u32); 16] = [
    (1, 1, 1),
    (1, 2, 1),
    (1, 4, 1),
    (1, 8, 1),
    (2, 1, 2),
    (2, 2, 2),
    (2, 4, 2),
    (2, 8, 2),
    (4, 1, 4),
    (4, 2, 4),
    (4, 4, 4),
    (4, 8, 4),
    (8, 1, 8),
    (8, 2, 8),
    (8, 4, 8),
    (8, 8, 8),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MsConfig {
    pub stage1: u32,
    pub stage2: u32,
    pub stage3: u32,
}

impl MsConfig {
    pub const fn new(stage1: u32, stage2: u32, stage3: u32) -> Self {
        Self {
            stage1,
            stage2,
            stage3,
        }
    }

    pub fn tag(&self) -> String {
        format!("m{}-{}-{}", self.stage1, self.stage2, self.stage3)
    }

    pub fn ms_infer(&self) -> String {
        format!("{},{},{}", self.stage1, self.stage2, self.stage3)
    }
}

impl From<(u32, u32, u32)> for MsConfig {
    fn from((s1, s2, s3): (u32, u32, u32)) -> Self {
        Self::new(s1, s2, s3)
    }
}

impl fmt::Display for MsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ms_infer())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridSpec {
    #[default]
    Fixed,
    Parametric {
        m13: u32,
        #[serde(default = "default_s2_values")]
        s2_values: String,
    },
}

fn default_s2_values() -> String {
    DEFAULT_S2_VALUES.to_string()
}

impl GridSpec {
    pub fn build(&self) -> Result<Vec<MsConfig>> {
        match self {
            GridSpec::Fixed => Ok(fixed_grid()),
            GridSpec::Parametric { m13, s2_values } => parametric_grid(*m13, s2_values),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GridSpec::Fixed => "fixed",
            GridSpec::Parametric { .. } => "parametric",
        }
    }
}

pub fn fixed_grid() -> Vec<MsConfig> {
    FIXED_GRID.iter().copied().map(MsConfig::from).collect()
}

// Tokens are matched textually, so "04" is dropped like "abc".
pub fn parametric_grid(m13: u32, s2_values: &str) -> Result<Vec<MsConfig>> {
    if !ALLOWED_STAGE_VALUES.contains(&m13) {
        return Err(SweepError::InvalidM13 { value: m13 });
    }
    let grid: Vec<MsConfig> = s2_values
        .split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .filter_map(allowed_stage_value)
        .map(|s2| MsConfig::new(m13, s2, m13))
        .collect();
    if grid.is_empty() {
        return Err(SweepError::EmptySweepList {
            raw: s2_values.to_string(),
        });
    }
    Ok(grid)
}

fn allowed_stage_value(token: &str) -> Option<u32> {
    ALLOWED_STAGE_VALUES
        .iter()
        .copied()
        .find(|v| v.to_string() == token)
}

pub fn select_group(grid: &[MsConfig], group: usize, batch_size: usize) -> Result<&[MsConfig]> {
    let empty = || SweepError::EmptyGroup {
        group,
        grid_size: grid.len(),
    };
    let start = group.checked_mul(batch_size).ok_or_else(empty)?;
    if start >= grid.len() {
        return Err(empty());
    }
    let end = start.saturating_add(batch_size).min(grid.len());
    let slice = &grid[start..end];
    if slice.is_empty() {
        return Err(empty());
    }
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triples(grid: &[MsConfig]) -> Vec<(u32, u32, u32)> {
        grid.iter().map(|c| (c.stage1, c.stage2, c.stage3)).collect()
    }

    #[test]
    fn fixed_grid_has_sixteen_mirrored_entries() {
        let grid = fixed_grid();
        assert_eq!(grid.len(), 16);
        for c in &grid {
            assert_eq!(c.stage1, c.stage3);
            assert!([1, 2, 4, 8].contains(&c.stage1));
            assert!([1, 2, 4, 8].contains(&c.stage2));
        }
        assert_eq!(grid[0], MsConfig::new(1, 1, 1));
        assert_eq!(grid[15], MsConfig::new(8, 8, 8));
    }

    #[test]
    fn parametric_grid_drops_invalid_tokens_and_keeps_order() {
        let grid = parametric_grid(4, "1,4,8,99,abc").expect("grid");
        assert_eq!(triples(&grid), vec![(4, 1, 4), (4, 4, 4), (4, 8, 4)]);
    }

    #[test]
    fn parametric_grid_trims_and_preserves_input_order() {
        let grid = parametric_grid(2, " 32 , 1,,16 ").expect("grid");
        assert_eq!(triples(&grid), vec![(2, 32, 2), (2, 1, 2), (2, 16, 2)]);
    }

    #[test]
    fn parametric_grid_rejects_empty_filtered_list() {
        for raw in ["", "99", "abc, 0 ,04"] {
            let err = parametric_grid(4, raw).expect_err("should fail");
            assert!(matches!(err, SweepError::EmptySweepList { .. }), "{raw}: {err}");
            assert!(err.is_configuration_error());
        }
    }

    #[test]
    fn parametric_grid_rejects_unknown_m13() {
        let err = parametric_grid(3, "1,2").expect_err("should fail");
        assert!(matches!(err, SweepError::InvalidM13 { value: 3 }));
    }

    #[test]
    fn select_group_returns_in_range_batches() {
        let grid = parametric_grid(1, "1,2,4,8,16,32").expect("grid");
        for g in 0..2 {
            let slice = select_group(&grid, g, GROUP_SIZE).expect("group");
            let expected = GROUP_SIZE.min(grid.len() - g * GROUP_SIZE);
            assert_eq!(slice.len(), expected);
            assert_eq!(slice, &grid[g * GROUP_SIZE..g * GROUP_SIZE + expected]);
        }
    }

    #[test]
    fn select_group_fails_out_of_range() {
        let grid = fixed_grid();
        for g in [4, 5, usize::MAX] {
            let err = select_group(&grid, g, GROUP_SIZE).expect_err("should fail");
            let msg = err.to_string();
            assert!(msg.contains(&format!("group {g}")), "{msg}");
            assert!(msg.contains("grid size=16"), "{msg}");
        }
    }

    #[test]
    fn group_zero_of_fixed_grid_is_first_row() {
        let grid = fixed_grid();
        let slice = select_group(&grid, 0, GROUP_SIZE).expect("group");
        assert_eq!(
            triples(slice),
            vec![(1, 1, 1), (1, 2, 1), (1, 4, 1), (1, 8, 1)]
        );
    }

    #[test]
    fn config_tag_and_encoding() {
        let c = MsConfig::new(4, 16, 4);
        assert_eq!(c.tag(), "m4-16-4");
        assert_eq!(c.ms_infer(), "4,16,4");
    }

    #[test]
    fn grid_spec_deserializes_from_yaml() {
        let spec: GridSpec = serde_yaml::from_str("kind: parametric\nm13: 8\n").expect("yaml");
        assert_eq!(
            spec,
            GridSpec::Parametric {
                m13: 8,
                s2_values: DEFAULT_S2_VALUES.to_string()
            }
        );
        let fixed: GridSpec = serde_yaml::from_str("kind: fixed\n").expect("yaml");
        assert_eq!(fixed, GridSpec::Fixed);
    }
}
