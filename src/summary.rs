//! Human-readable model structure tables.

use std::fmt;

/// One layer (or group of layers) in a summary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub name: String,
    pub kind: String,
    /// Per-sample output shape.
    pub output_shape: Vec<usize>,
    pub params: usize,
}

impl SummaryRow {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        output_shape: Vec<usize>,
        params: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            output_shape,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub title: String,
    pub rows: Vec<SummaryRow>,
    pub trainable_params: usize,
}

impl ModelSummary {
    pub fn total_params(&self) -> usize {
        self.rows.iter().map(|row| row.params).sum()
    }
}

fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    format!("(None, {})", dims.join(", "))
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(78);
        writeln!(f, "Model: \"{}\"", self.title)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "{:<34}{:<28}{:>16}", "Layer (type)", "Output Shape", "Param #")?;
        writeln!(f, "{rule}")?;
        for row in &self.rows {
            let label = format!("{} ({})", row.name, row.kind);
            writeln!(
                f,
                "{:<34}{:<28}{:>16}",
                label,
                format_shape(&row.output_shape),
                row.params
            )?;
        }
        writeln!(f, "{rule}")?;
        writeln!(f, "Total params: {}", self.total_params())?;
        writeln!(f, "Trainable params: {}", self.trainable_params)?;
        write!(
            f,
            "Non-trainable params: {}",
            self.total_params().saturating_sub(self.trainable_params)
        )
    }
}
