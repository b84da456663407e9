//! Name/path relevance scoring.

use crate::query::RankedEntry;

/// Lowercased whitespace-separated terms of a query.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// Score an entry against every term.
///
/// Each term earns 100 for an exact name match, 50 if the name starts with it,
/// 30 if the name contains it and 10 if only the path contains it. A term that
/// matches nowhere makes the whole score 0. `name` and `path` must already be
/// lowercased.
pub fn score(name: &str, path: &str, terms: &[String]) -> u32 {
    let mut total = 0;
    for term in terms {
        total += if name == term {
            100
        } else if name.starts_with(term.as_str()) {
            50
        } else if name.contains(term.as_str()) {
            30
        } else if path.contains(term.as_str()) {
            10
        } else {
            return 0;
        };
    }
    total
}

/// Sort best first (ties by path) and keep at most `limit`.
pub fn rank(results: &mut Vec<RankedEntry>, limit: usize) {
    results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    results.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(q: &str) -> Vec<String> {
        query_terms(q)
    }

    #[test]
    fn test_match_levels() {
        assert_eq!(score("report", "docs/report", &terms("report")), 100);
        assert_eq!(score("report.txt", "docs/report.txt", &terms("report")), 50);
        assert_eq!(score("q3-report.txt", "docs/q3-report.txt", &terms("report")), 30);
        assert_eq!(score("summary.txt", "reports/summary.txt", &terms("report")), 10);
    }

    #[test]
    fn test_all_terms_required() {
        let t = terms("Report  2024");
        assert_eq!(t, vec!["report", "2024"]);
        assert_eq!(score("report-2024.pdf", "a/report-2024.pdf", &t), 80);
        assert_eq!(score("report.pdf", "a/report.pdf", &t), 0);
    }

    #[test]
    fn test_empty_query_scores_zero_terms() {
        assert!(terms("   ").is_empty());
    }
}
