use serde::{Deserialize, Serialize};

use crate::Error;

/// How a parent's angular share is divided among its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingSizing {
    /// Every child gets the same fraction of its parent.
    #[default]
    EqualAngle,
    /// Children get a fraction proportional to their value.
    Proportional,
}

impl SiblingSizing {
    /// Splits `parent_share` among siblings with the given values.
    /// The returned shares sum up to `parent_share` (unless there are no
    /// siblings at all). When all values are zero, proportional sizing
    /// degrades to an equal split.
    pub fn split(&self, parent_share: f64, values: &[f64]) -> Vec<f64> {
        if values.is_empty() {
            return vec![];
        }

        let equal = parent_share / values.len() as f64;
        match self {
            SiblingSizing::EqualAngle => vec![equal; values.len()],
            SiblingSizing::Proportional => {
                let total: f64 = values.iter().sum();
                if total <= 0.0 {
                    return vec![equal; values.len()];
                }
                values.iter().map(|v| parent_share * v / total).collect()
            }
        }
    }
}

impl std::str::FromStr for SiblingSizing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equal" | "equal-angle" | "equal_angle" => Ok(SiblingSizing::EqualAngle),
            "proportional" => Ok(SiblingSizing::Proportional),
            other => Err(Error::InvalidRequest(format!(
                "unknown sizing policy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SiblingSizing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiblingSizing::EqualAngle => f.write_str("equal-angle"),
            SiblingSizing::Proportional => f.write_str("proportional"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::SiblingSizing;

    #[rstest]
    #[case::equal_three(SiblingSizing::EqualAngle, 1.0, vec![5.0, 1.0, 0.0], vec![1.0 / 3.0; 3])]
    #[case::equal_half_parent(SiblingSizing::EqualAngle, 0.5, vec![1.0, 9.0], vec![0.25, 0.25])]
    #[case::proportional(SiblingSizing::Proportional, 1.0, vec![1.0, 3.0], vec![0.25, 0.75])]
    #[case::proportional_scaled(SiblingSizing::Proportional, 0.5, vec![2.0, 2.0], vec![0.25, 0.25])]
    #[case::proportional_all_zero(SiblingSizing::Proportional, 1.0, vec![0.0, 0.0], vec![0.5, 0.5])]
    #[case::no_children(SiblingSizing::Proportional, 1.0, vec![], vec![])]
    fn split(
        #[case] sizing: SiblingSizing,
        #[case] parent_share: f64,
        #[case] values: Vec<f64>,
        #[case] exp: Vec<f64>,
    ) {
        let shares = sizing.split(parent_share, &values);
        assert_eq!(exp.len(), shares.len());
        for (e, s) in exp.iter().zip(shares.iter()) {
            assert!((e - s).abs() < 1e-12, "expected {e}, got {s}");
        }
        if !values.is_empty() {
            let sum: f64 = shares.iter().sum();
            assert!((sum - parent_share).abs() < 1e-12);
        }
    }

    #[rstest]
    #[case("equal", Some(SiblingSizing::EqualAngle))]
    #[case("equal-angle", Some(SiblingSizing::EqualAngle))]
    #[case("proportional", Some(SiblingSizing::Proportional))]
    #[case("size", None)]
    fn parse(#[case] input: &str, #[case] exp: Option<SiblingSizing>) {
        assert_eq!(exp, input.parse().ok());
    }
}
