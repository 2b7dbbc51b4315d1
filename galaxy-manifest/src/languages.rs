//! Depot language matching
//!
//! Depots declare the language tags they serve. A depot matches the target
//! language when its set contains the exact tag, the tag's base (the part
//! before `-`), the wildcard `*`, or `Neutral` (language-independent Gen-1
//! depots).

/// Check whether a depot language set matches the target language tag
pub fn depot_matches_language(depot_languages: &[String], target: &str) -> bool {
    let base = target.split('-').next().unwrap_or(target);
    depot_languages.iter().any(|lang| {
        lang == "*" || lang == "Neutral" || lang == target || lang == base
    })
}

/// Collect the concrete (non-wildcard) languages a manifest offers
pub fn list_languages<'a, I>(depot_language_sets: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Vec<String>>,
{
    let mut languages: Vec<String> = Vec::new();
    for set in depot_language_sets {
        for lang in set {
            if lang != "*" && lang != "Neutral" && !languages.contains(lang) {
                languages.push(lang.clone());
            }
        }
    }
    languages.sort();
    languages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        assert!(depot_matches_language(&langs(&["en-US"]), "en-US"));
    }

    #[test]
    fn test_base_tag_match() {
        assert!(depot_matches_language(&langs(&["en"]), "en-US"));
    }

    #[test]
    fn test_wildcard_and_neutral() {
        assert!(depot_matches_language(&langs(&["*"]), "pl-PL"));
        assert!(depot_matches_language(&langs(&["Neutral"]), "de-DE"));
    }

    #[test]
    fn test_no_match() {
        assert!(!depot_matches_language(&langs(&["fr-FR", "de"]), "en-US"));
    }

    #[test]
    fn test_list_languages_skips_wildcards() {
        let sets = vec![langs(&["en-US", "*"]), langs(&["de", "Neutral", "en-US"])];
        assert_eq!(list_languages(sets.iter()), vec!["de", "en-US"]);
    }
}
