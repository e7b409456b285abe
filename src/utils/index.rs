/// `part / whole * 100`, or 0 when `whole` is 0.
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

/// Render a percentage with one decimal place ("33.3").
pub fn format_percentage(value: f64) -> String {
    format!("{:.1}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_of_empty_whole_is_zero() {
        assert_eq!(percentage(3, 0), 0.0);
    }

    #[test]
    fn formats_one_decimal() {
        assert_eq!(format_percentage(percentage(1, 3)), "33.3");
        assert_eq!(format_percentage(percentage(2, 2)), "100.0");
    }
}
