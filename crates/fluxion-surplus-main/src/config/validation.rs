// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use serde::Serialize;

/// A single finding of configuration validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Field path (e.g., "entries[0].policy.hysteresis_w")
    pub field: String,
    pub message: String,
    /// "error" or "warning"
    pub severity: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: "error".to_owned(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: "warning".to_owned(),
        });
    }

    /// Error if `value` is outside `[min, max]`
    pub fn check_range(&mut self, field: impl Into<String>, value: f64, min: f64, max: f64) {
        if !(min..=max).contains(&value) {
            self.add_error(field, format!("Must be between {min} and {max}, got {value}"));
        }
    }

    /// Error unless `0 < value <= max`
    pub fn check_positive_max(&mut self, field: impl Into<String>, value: f64, max: f64) {
        if value <= 0.0 || value > max {
            self.add_error(field, format!("Must be greater than 0 and at most {max}, got {value}"));
        }
    }

    /// One line per error, for startup failures
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_invalidate_warnings_do_not() {
        let mut result = ValidationResult::success();
        result.add_warning("entries[0].poll_interval_secs", "very high");
        assert!(result.valid);

        result.check_range("entries[0].ramp.deadband_pct", 11.0, 0.0, 10.0);
        result.check_positive_max("entries[0].ramp.up_step_pct", 0.0, 100.0);
        result.check_positive_max("entries[0].ramp.down_step_pct", 100.0, 100.0);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].severity, "error");
        assert!(result.error_summary().contains("deadband_pct"));
    }
}
