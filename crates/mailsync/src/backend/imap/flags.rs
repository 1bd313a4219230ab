//! Mapping between IMAP system flags/keywords and [`Flag`]

use crate::models::{Flag, FlagSet};

const FORWARDED_KEYWORD: &str = "$Forwarded";

/// None for flags with no local meaning (`\Recent`, `\*`)
pub fn flag_from_imap(name: &str) -> Option<Flag> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if let Some(system) = name.strip_prefix('\\') {
        return match system.to_ascii_lowercase().as_str() {
            "seen" => Some(Flag::Read),
            "answered" => Some(Flag::Answered),
            "flagged" => Some(Flag::Flagged),
            "deleted" => Some(Flag::Deleted),
            "draft" => Some(Flag::Draft),
            _ => None,
        };
    }
    if name.eq_ignore_ascii_case(FORWARDED_KEYWORD) {
        return Some(Flag::Forwarded);
    }
    Some(Flag::Custom(name.to_string()))
}

pub fn flag_to_imap(flag: &Flag) -> String {
    match flag {
        Flag::Read => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Forwarded => FORWARDED_KEYWORD.to_string(),
        Flag::Custom(keyword) => keyword.clone(),
    }
}

pub fn flags_from_imap<S: AsRef<str>>(names: &[S]) -> FlagSet {
    names
        .iter()
        .filter_map(|n| flag_from_imap(n.as_ref()))
        .collect()
}

pub fn flags_to_imap(flags: &FlagSet) -> Vec<String> {
    flags.iter().map(flag_to_imap).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_flags() {
        assert_eq!(flag_from_imap("\\Seen"), Some(Flag::Read));
        assert_eq!(flag_from_imap("\\FLAGGED"), Some(Flag::Flagged));
        assert_eq!(flag_from_imap("\\Recent"), None);
        assert_eq!(flag_to_imap(&Flag::Deleted), "\\Deleted");
    }

    #[test]
    fn test_keywords() {
        assert_eq!(flag_from_imap("$forwarded"), Some(Flag::Forwarded));
        assert_eq!(flag_from_imap("$Label1"), Some(Flag::Custom("$Label1".into())));
        assert_eq!(flag_to_imap(&Flag::Custom("Work".into())), "Work");
    }

    #[test]
    fn test_set_conversion_skips_unknown() {
        let set = flags_from_imap(&["\\Seen", "\\Recent", "\\Answered"]);
        assert_eq!(set, FlagSet::from([Flag::Read, Flag::Answered]));
        let back = flags_to_imap(&set);
        assert_eq!(back, vec!["\\Seen".to_string(), "\\Answered".to_string()]);
    }
}
