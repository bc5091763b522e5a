use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Multiple testing correction applied across the genes tested in one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// Family-wise error control; each p-value times the number of tests.
    #[default]
    Bonferroni,
    /// False discovery rate control (step-up).
    BenjaminiHochberg,
}

impl Correction {
    pub fn apply(self, p_values: &[f64]) -> Result<Vec<f64>> {
        match self {
            Correction::Bonferroni => bonferroni_correction(p_values),
            Correction::BenjaminiHochberg => benjamini_hochberg_correction(p_values),
        }
    }
}

fn validate(p_values: &[f64]) -> Result<()> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }
    if let Some((i, p)) = p_values
        .iter()
        .enumerate()
        .find(|(_, p)| !(0.0..=1.0).contains(*p))
    {
        return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
    }
    Ok(())
}

/// Bonferroni correction: multiply by the number of tests, capping at 1.
pub fn bonferroni_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len() as f64;
    Ok(p_values.iter().map(|&p| (p * n).min(1.0)).collect())
}

/// Benjamini-Hochberg adjusted p-values, monotone in the raw p-values.
pub fn benjamini_hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0f64;
    // from the largest p-value down
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let candidate = (p_values[idx] * n as f64 / (rank0 + 1) as f64).min(1.0);
        running_min = running_min.min(candidate);
        adjusted[idx] = running_min;
    }

    Ok(adjusted)
}
