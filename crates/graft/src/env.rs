use std::env;
use std::sync::OnceLock;

static GRAFT_DUMP_PROGRAM: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `GRAFT_DUMP_PROGRAM=1` logs every newly traced program in text form.
pub(crate) fn dump_program_enabled() -> bool {
    *GRAFT_DUMP_PROGRAM.get_or_init(|| match env::var("GRAFT_DUMP_PROGRAM") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_common_truthy_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
