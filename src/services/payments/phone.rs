use phonenumber::country;
use tracing::debug;

/// Formats a buyer phone number as E.164.
///
/// Numbers without a country code are read in `default_region`. Unparseable
/// input is returned trimmed but otherwise untouched.
pub fn to_e164(raw: &str, default_region: &str) -> String {
    let raw = raw.trim();
    let region = default_region
        .trim()
        .to_ascii_uppercase()
        .parse::<country::Id>()
        .unwrap_or(country::Id::SA);

    match phonenumber::parse(Some(region), raw) {
        Ok(parsed) => parsed.format().mode(phonenumber::Mode::E164).to_string(),
        Err(err) => {
            debug!(error = %err, "phone number not parseable; sending as entered");
            raw.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn national_number_uses_default_region() {
        assert_eq!(to_e164("0501234567", "SA"), "+966501234567");
    }

    #[test]
    fn international_number_keeps_its_country() {
        assert_eq!(to_e164("+971 50 123 4567", "SA"), "+971501234567");
    }

    #[test]
    fn garbage_falls_back_to_raw_input() {
        assert_eq!(to_e164("  not a phone ", "SA"), "not a phone");
    }

    #[test]
    fn unknown_region_falls_back_to_saudi_arabia() {
        assert_eq!(to_e164("0501234567", "??"), "+966501234567");
    }
}
