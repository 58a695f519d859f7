//! Smart-scraper mode selection.

use lido_core::SmartScraperMode;

/// What the worker does after the base scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapePlan {
    /// No smart-scraper pass.
    Skip,
    /// Enrich whatever the base scrape found.
    EnrichExisting,
    /// Base scrape came back empty: discover candidates, then enrich them.
    DiscoverThenEnrich,
}

/// Pure decision over (mode, base result count).
pub fn select_plan(mode: SmartScraperMode, base_result_count: usize) -> ScrapePlan {
    match mode {
        SmartScraperMode::Disabled => ScrapePlan::Skip,
        SmartScraperMode::Enrichment => ScrapePlan::EnrichExisting,
        SmartScraperMode::Fallback => {
            if base_result_count == 0 {
                ScrapePlan::DiscoverThenEnrich
            } else {
                ScrapePlan::Skip
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_always_skips() {
        assert_eq!(select_plan(SmartScraperMode::Disabled, 0), ScrapePlan::Skip);
        assert_eq!(select_plan(SmartScraperMode::Disabled, 42), ScrapePlan::Skip);
    }

    #[test]
    fn enrichment_always_enriches() {
        assert_eq!(
            select_plan(SmartScraperMode::Enrichment, 0),
            ScrapePlan::EnrichExisting
        );
        assert_eq!(
            select_plan(SmartScraperMode::Enrichment, 7),
            ScrapePlan::EnrichExisting
        );
    }

    #[test]
    fn fallback_only_fires_on_empty_base_results() {
        assert_eq!(
            select_plan(SmartScraperMode::Fallback, 0),
            ScrapePlan::DiscoverThenEnrich
        );
        assert_eq!(select_plan(SmartScraperMode::Fallback, 1), ScrapePlan::Skip);
    }
}
