//! Human-readable byte sizes for result tables and logs.

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

/// Renders a byte count with a binary unit, e.g. `1.50 MiB`.
///
/// Returns `None` for negative inputs; sizes are magnitudes and a negative
/// one always indicates a bug upstream.
pub fn size_to_string(value: f64) -> Option<String> {
    if value < 0.0 || value.is_nan() {
        return None;
    }
    let mut value = value;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    Some(format!("{:.2} {}", value, UNITS[unit]))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scales_to_binary_units() {
        assert_eq!(size_to_string(0.0).unwrap(), "0.00 B");
        assert_eq!(size_to_string(512.0).unwrap(), "512.00 B");
        assert_eq!(size_to_string(1024.0).unwrap(), "1.00 KiB");
        assert_eq!(size_to_string(1536.0 * 1024.0).unwrap(), "1.50 MiB");
        assert_eq!(size_to_string(256.0 * 1024.0 * 1024.0).unwrap(), "256.00 MiB");
        assert_eq!(
            size_to_string(3.0 * 1024f64.powi(4)).unwrap(),
            "3.00 TiB"
        );
    }

    #[test]
    fn saturates_at_largest_unit() {
        assert_eq!(size_to_string(5000.0 * 1024f64.powi(4)).unwrap(), "5000.00 TiB");
    }

    #[test]
    fn rejects_negative_sizes() {
        assert_eq!(size_to_string(-1.0), None);
    }

    #[test]
    fn displayed_magnitude_parses_back() {
        let rendered = size_to_string(1536.0 * 1024.0).unwrap();
        let magnitude: f64 = rendered.split(' ').next().unwrap().parse().unwrap();
        assert!((magnitude - 1.5).abs() < 0.005);
    }
}
