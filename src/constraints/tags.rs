//! Guest tag grammar
//!
//! Constraints ride on ordinary hypervisor tags, case-sensitive:
//!
//! - `plb_ignore_*` — never move this guest
//! - `plb_affinity_<key>` — join affinity group `<key>`
//! - `plb_anti_affinity_<key>` — join anti-affinity group `<key>`
//! - `plb_pin_<nodename>` — allow only `<nodename>` as a target; several
//!   pin tags form a union
//!
//! Tags are parsed once into [`Constraint`] values and consumed as data
//! afterwards.

/// A single parsed constraint tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    Ignore,
    Affinity(String),
    AntiAffinity(String),
    Pin(String),
}

const IGNORE_PREFIX: &str = "plb_ignore";
const ANTI_AFFINITY_PREFIX: &str = "plb_anti_affinity_";
const AFFINITY_PREFIX: &str = "plb_affinity_";
const PIN_PREFIX: &str = "plb_pin_";

/// Parse one tag. Tags outside the `plb_` namespace and malformed `plb_`
/// tags (empty key) yield `None`.
pub fn parse_tag(tag: &str) -> Option<Constraint> {
    if tag.starts_with(IGNORE_PREFIX) {
        return Some(Constraint::Ignore);
    }
    // The anti-affinity prefix contains the affinity prefix, so order
    // matters here.
    if let Some(key) = tag.strip_prefix(ANTI_AFFINITY_PREFIX) {
        return (!key.is_empty()).then(|| Constraint::AntiAffinity(key.to_string()));
    }
    if let Some(key) = tag.strip_prefix(AFFINITY_PREFIX) {
        return (!key.is_empty()).then(|| Constraint::Affinity(key.to_string()));
    }
    if let Some(node) = tag.strip_prefix(PIN_PREFIX) {
        return (!node.is_empty()).then(|| Constraint::Pin(node.to_string()));
    }
    None
}

/// All constraints carried by a tag list.
pub fn parse_tags(tags: &[String]) -> Vec<Constraint> {
    tags.iter().filter_map(|t| parse_tag(t)).collect()
}

/// True when any tag marks the guest as ignored.
pub fn has_ignore_tag(tags: &[String]) -> bool {
    tags.iter().any(|t| t.starts_with(IGNORE_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_tag() {
        assert_eq!(parse_tag("plb_ignore_this"), Some(Constraint::Ignore));
        assert_eq!(parse_tag("plb_ignore"), Some(Constraint::Ignore));
    }

    #[test]
    fn test_affinity_tag() {
        assert_eq!(
            parse_tag("plb_affinity_web"),
            Some(Constraint::Affinity("web".to_string()))
        );
    }

    #[test]
    fn test_anti_affinity_tag_not_mistaken_for_affinity() {
        assert_eq!(
            parse_tag("plb_anti_affinity_db"),
            Some(Constraint::AntiAffinity("db".to_string()))
        );
    }

    #[test]
    fn test_pin_tag() {
        assert_eq!(
            parse_tag("plb_pin_pve03"),
            Some(Constraint::Pin("pve03".to_string()))
        );
    }

    #[test]
    fn test_unrelated_and_malformed_tags() {
        assert_eq!(parse_tag("production"), None);
        assert_eq!(parse_tag("plb_affinity_"), None);
        assert_eq!(parse_tag("plb_pin_"), None);
        // Legacy alias from old docs is intentionally not recognized.
        assert_eq!(parse_tag("plb_exclude_web"), None);
        // Case-sensitive by contract.
        assert_eq!(parse_tag("PLB_AFFINITY_WEB"), None);
    }

    #[test]
    fn test_parse_tags_mixed() {
        let tags = vec![
            "prod".to_string(),
            "plb_affinity_web".to_string(),
            "plb_pin_pve01".to_string(),
            "plb_pin_pve02".to_string(),
        ];
        let constraints = parse_tags(&tags);
        assert_eq!(constraints.len(), 3);
        assert!(constraints.contains(&Constraint::Pin("pve02".to_string())));
    }

    #[test]
    fn test_has_ignore_tag() {
        assert!(has_ignore_tag(&["plb_ignore_maintenance".to_string()]));
        assert!(!has_ignore_tag(&["plb_affinity_web".to_string()]));
    }
}
