//! IANA to Windows time zone names, as expected by `Set-MailboxRegionalConfiguration`.
//! The fleet deployments this serves are Australian, so only those zones are mapped.

pub const DEFAULT_WINDOWS_TIMEZONE: &str = "AUS Eastern Standard Time";

const IANA_TO_WINDOWS: [(&str, &str); 12] = [
    ("Australia/Sydney", "AUS Eastern Standard Time"),
    ("Australia/Melbourne", "AUS Eastern Standard Time"),
    ("Australia/Canberra", "AUS Eastern Standard Time"),
    ("Australia/ACT", "AUS Eastern Standard Time"),
    ("Australia/Brisbane", "E. Australia Standard Time"),
    ("Australia/Hobart", "Tasmania Standard Time"),
    ("Australia/Adelaide", "Cen. Australia Standard Time"),
    ("Australia/Broken_Hill", "Cen. Australia Standard Time"),
    ("Australia/Darwin", "AUS Central Standard Time"),
    ("Australia/Perth", "W. Australia Standard Time"),
    ("Australia/Lord_Howe", "Lord Howe Standard Time"),
    ("Australia/Eucla", "Aus Central W. Standard Time"),
];

// Long names match anywhere, abbreviations only as a whole word
const HINTS: [(&[&str], &[&str], &str); 6] = [
    (&["sydney", "melbourne", "canberra"], &["nsw", "vic", "act"], "AUS Eastern Standard Time"),
    (&["brisbane", "queensland"], &["qld"], "E. Australia Standard Time"),
    (&["hobart", "tasmania"], &["tas"], "Tasmania Standard Time"),
    (&["adelaide", "south australia", "broken"], &["sa"], "Cen. Australia Standard Time"),
    (&["darwin", "northern territory"], &["nt"], "AUS Central Standard Time"),
    (&["perth", "western australia"], &["wa"], "W. Australia Standard Time"),
];

/// Converts a device time zone to its Windows name, or returns `default` when unknown.
pub fn to_windows_timezone(zone: Option<&str>, default: &str) -> String {
    let zone = match zone.map(str::trim).filter(|z| !z.is_empty()) {
        Some(z) => z,
        None => return default.to_string(),
    };

    if IANA_TO_WINDOWS.iter().any(|(_, windows)| windows.eq_ignore_ascii_case(zone)) {
        return zone.to_string();
    }
    if let Some((_, windows)) = IANA_TO_WINDOWS.iter().find(|(iana, _)| iana.eq_ignore_ascii_case(zone)) {
        return windows.to_string();
    }
    if zone.eq_ignore_ascii_case("UTC") || zone.eq_ignore_ascii_case("Etc/UTC") {
        return "UTC".to_string();
    }

    let lower = zone.to_lowercase();
    let words: Vec<&str> = lower.split(|c: char| !c.is_ascii_alphanumeric()).collect();
    for (names, abbreviations, windows) in HINTS.iter() {
        if names.iter().any(|n| lower.contains(n)) || abbreviations.iter().any(|a| words.contains(a)) {
            return windows.to_string();
        }
    }
    default.to_string()
}
