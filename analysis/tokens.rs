//! Number parsing shared by the text loaders.

/// Parses a finite `f64`, accepting Fortran `D` exponents (`1.5D+02`).
pub(crate) fn parse_finite(token: &str) -> Option<f64> {
    let value = match lexical_core::parse::<f64>(token.as_bytes()) {
        Ok(value) => value,
        Err(_) if token.contains(['d', 'D']) => {
            let exponent = token.replace(['d', 'D'], "e");
            lexical_core::parse::<f64>(exponent.as_bytes()).ok()?
        }
        Err(_) => return None,
    };
    value.is_finite().then_some(value)
}

pub(crate) fn parse_int(token: &str) -> Option<i32> {
    lexical_core::parse::<i32>(token.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fortran_numbers() {
        assert_eq!(parse_finite("2.5"), Some(2.5));
        assert_eq!(parse_finite("-1.0E+02"), Some(-100.0));
        assert_eq!(parse_finite("1.5D+02"), Some(150.0));
        assert_eq!(parse_finite("3d0"), Some(3.0));
        assert_eq!(parse_int("-7"), Some(-7));
    }

    #[test]
    fn rejects_text_and_non_finite_values() {
        assert_eq!(parse_finite("head"), None);
        assert_eq!(parse_finite("nan"), None);
        assert_eq!(parse_finite("inf"), None);
        assert_eq!(parse_finite("1e400"), None);
        assert_eq!(parse_int("1.5"), None);
    }
}
